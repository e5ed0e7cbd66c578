// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Credential selection for new connections.
//!
//! Engines behind the same deployment trust callers differently: some expect a
//! service account whose secret lives in the process environment, some expect
//! the end user's own name, and the rest use whatever the datasource profile
//! configures. [`CredentialPolicy`] is the table that encodes which is which.

use std::fmt;

use tracing::debug;

use crate::{DatasourceProfile, Properties};

/// Where the credentials of a datasource family come from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CredentialSource {
    /// A username and password read from the named environment variables at
    /// acquisition time.
    Environment {
        user_var: String,
        password_var: String,
    },
    /// The executing end user's name, with no secret.
    ExecutingUser,
    /// The `user` and `password` configured on the profile.
    Profile,
}

/// The username and secret to authenticate a new connection with.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct Credential {
    pub user: Option<String>,
    pub secret: Option<String>,
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("user", &self.user)
            .field("secret", &self.secret.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// How a driver should authenticate a new connection.
#[derive(Clone, PartialEq, Eq)]
pub enum ConnectAuth {
    /// Explicit credentials.
    Credentials {
        user: String,
        password: Option<String>,
    },
    /// No username resolved; the driver authenticates from the whole profile
    /// property bag using its own defaults.
    Properties(Properties),
}

impl fmt::Debug for ConnectAuth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectAuth::Credentials { user, password } => f
                .debug_struct("Credentials")
                .field("user", user)
                .field("password", &password.as_ref().map(|_| "<redacted>"))
                .finish(),
            ConnectAuth::Properties(properties) => {
                f.debug_tuple("Properties").field(properties).finish()
            }
        }
    }
}

impl Credential {
    /// Converts the resolved credential into connection instructions.
    pub fn into_auth(self, profile: &DatasourceProfile) -> ConnectAuth {
        match self.user {
            Some(user) => ConnectAuth::Credentials {
                user,
                password: self.secret,
            },
            None => ConnectAuth::Properties(profile.properties().clone()),
        }
    }
}

static PROFILE_SOURCE: CredentialSource = CredentialSource::Profile;

/// An ordered table of datasource-key patterns and the credential source
/// each selects.
///
/// Rules match when the datasource key *contains* the pattern; the first
/// matching rule wins and keys matching no rule use [`CredentialSource::Profile`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CredentialPolicy {
    rules: Vec<(String, CredentialSource)>,
}

impl Default for CredentialPolicy {
    fn default() -> Self {
        CredentialPolicy::empty()
            .with_rule(
                "vertica",
                CredentialSource::environment("ZEPPELIN_VERTICA_USER", "ZEPPELIN_VERTICA_PASSWORD"),
            )
            .with_rule("presto", CredentialSource::ExecutingUser)
            .with_rule(
                "mysql-birdbrain",
                CredentialSource::environment(
                    "ZEPPELIN_MYSQL_BIRDBRAIN_USER",
                    "ZEPPELIN_MYSQL_BIRDBRAIN_PASSWORD",
                ),
            )
            .with_rule(
                "mysql-fabric",
                CredentialSource::environment(
                    "ZEPPELIN_MYSQL_FABRIC_USER",
                    "ZEPPELIN_MYSQL_FABRIC_PASSWORD",
                ),
            )
    }
}

impl CredentialSource {
    pub fn environment(user_var: impl Into<String>, password_var: impl Into<String>) -> Self {
        CredentialSource::Environment {
            user_var: user_var.into(),
            password_var: password_var.into(),
        }
    }
}

impl CredentialPolicy {
    /// A policy without rules: every datasource uses its profile credentials.
    pub fn empty() -> Self {
        CredentialPolicy { rules: Vec::new() }
    }

    /// Appends a rule, evaluated after all existing rules.
    pub fn with_rule(mut self, pattern: impl Into<String>, source: CredentialSource) -> Self {
        self.rules.push((pattern.into(), source));
        self
    }

    /// The credential source selected for `datasource_key`.
    pub fn source_for(&self, datasource_key: &str) -> &CredentialSource {
        self.rules
            .iter()
            .find(|(pattern, _)| datasource_key.contains(pattern.as_str()))
            .map(|(_, source)| source)
            .unwrap_or(&PROFILE_SOURCE)
    }

    /// Resolves credentials, reading the process environment.
    pub fn resolve(&self, profile: &DatasourceProfile, executing_user: &str) -> Credential {
        self.resolve_with(profile, executing_user, |var| std::env::var(var).ok())
    }

    /// Resolves credentials, looking environment variables up with `env`.
    pub fn resolve_with<F>(
        &self,
        profile: &DatasourceProfile,
        executing_user: &str,
        env: F,
    ) -> Credential
    where
        F: Fn(&str) -> Option<String>,
    {
        let source = self.source_for(profile.key());
        debug!(datasource = profile.key(), ?source, "resolving credentials");
        match source {
            CredentialSource::Environment {
                user_var,
                password_var,
            } => Credential {
                user: env(user_var),
                secret: env(password_var),
            },
            CredentialSource::ExecutingUser => Credential {
                user: Some(executing_user.to_string()),
                secret: None,
            },
            CredentialSource::Profile => Credential {
                user: profile.user().map(str::to_string),
                secret: profile.password().map(str::to_string),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use crate::DatasourceRegistry;

    use super::*;

    fn registry() -> DatasourceRegistry {
        let properties: Properties = [
            ("vertica-prod.driver", "vertica"),
            ("vertica-prod.url", "vertica://warehouse"),
            ("vertica-prod.user", "ignored"),
            ("presto.driver", "presto"),
            ("presto.url", "presto://coordinator"),
            ("mysql-fabric-eu.driver", "mysql"),
            ("mysql-fabric-eu.url", "mysql://fabric"),
            ("default.driver", "postgres"),
            ("default.url", "postgresql://localhost/db"),
            ("default.user", "hive"),
            ("default.password", "secret"),
            ("anonymous.driver", "postgres"),
            ("anonymous.url", "postgresql://localhost/db"),
        ]
        .into_iter()
        .collect();
        DatasourceRegistry::from_properties(&properties)
    }

    fn env() -> impl Fn(&str) -> Option<String> {
        let vars: BTreeMap<&str, &str> = [
            ("ZEPPELIN_VERTICA_USER", "svc_vertica"),
            ("ZEPPELIN_VERTICA_PASSWORD", "vpass"),
            ("ZEPPELIN_MYSQL_FABRIC_USER", "svc_fabric"),
        ]
        .into_iter()
        .collect();
        move |var| vars.get(var).map(|v| v.to_string())
    }

    #[test]
    fn environment_credentials() {
        let registry = registry();
        let profile = registry.resolve("vertica-prod").expect("configured");
        let credential = CredentialPolicy::default().resolve_with(profile, "alice", env());
        assert_eq!(credential.user.as_deref(), Some("svc_vertica"));
        assert_eq!(credential.secret.as_deref(), Some("vpass"));

        // A password variable that is unset resolves to no secret.
        let profile = registry.resolve("mysql-fabric-eu").expect("configured");
        let credential = CredentialPolicy::default().resolve_with(profile, "alice", env());
        assert_eq!(credential.user.as_deref(), Some("svc_fabric"));
        assert_eq!(credential.secret, None);
    }

    #[test]
    fn executing_user_credentials() {
        let registry = registry();
        let profile = registry.resolve("presto").expect("configured");
        let credential = CredentialPolicy::default().resolve_with(profile, "alice", env());
        assert_eq!(credential.user.as_deref(), Some("alice"));
        assert_eq!(credential.secret, None);
    }

    #[test]
    fn profile_credentials_and_property_bag_fallback() {
        let registry = registry();
        let policy = CredentialPolicy::default();

        let profile = registry.resolve("default").expect("configured");
        let auth = policy.resolve_with(profile, "alice", env()).into_auth(profile);
        assert_eq!(
            auth,
            ConnectAuth::Credentials {
                user: "hive".into(),
                password: Some("secret".into()),
            }
        );

        let profile = registry.resolve("anonymous").expect("configured");
        let auth = policy.resolve_with(profile, "alice", env()).into_auth(profile);
        assert_eq!(auth, ConnectAuth::Properties(profile.properties().clone()));
    }

    #[test]
    fn first_matching_rule_wins() {
        let policy = CredentialPolicy::empty()
            .with_rule("presto", CredentialSource::ExecutingUser)
            .with_rule("presto-vertica", CredentialSource::environment("U", "P"));
        assert_eq!(
            policy.source_for("presto-vertica"),
            &CredentialSource::ExecutingUser
        );
        assert_eq!(policy.source_for("postgres"), &CredentialSource::Profile);
    }

    #[test]
    fn debug_output_hides_secrets() {
        let credential = Credential {
            user: Some("svc".into()),
            secret: Some("hunter2".into()),
        };
        assert!(!format!("{credential:?}").contains("hunter2"));
    }
}
