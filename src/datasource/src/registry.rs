// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

use std::collections::BTreeMap;

use serde::{Serialize, Serializer};
use tracing::{debug, error};

use crate::{
    COMMON_KEY, ConfigError, DRIVER_KEY, MAX_COUNT_DEFAULT, MAX_COUNT_KEY, PASSWORD_KEY,
    Properties, URL_KEY, USER_KEY,
};

/// A named remote SQL engine and the settings used to connect to it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DatasourceProfile {
    key: String,
    driver: String,
    url: String,
    /// Every `<key>.<property>` setting, including `driver` and `url`.
    #[serde(serialize_with = "serialize_redacted")]
    properties: Properties,
}

impl DatasourceProfile {
    pub fn key(&self) -> &str {
        &self.key
    }

    /// The identifier used to look up the driver in a driver registry.
    pub fn driver(&self) -> &str {
        &self.driver
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// The statically configured username, if any.
    pub fn user(&self) -> Option<&str> {
        self.properties.get(USER_KEY)
    }

    /// The statically configured password, if any.
    pub fn password(&self) -> Option<&str> {
        self.properties.get(PASSWORD_KEY)
    }

    /// The full property bag, for drivers that authenticate from it directly.
    pub fn properties(&self) -> &Properties {
        &self.properties
    }
}

fn serialize_redacted<S: Serializer>(properties: &Properties, s: S) -> Result<S::Ok, S::Error> {
    s.collect_map(properties.iter().map(|(k, v)| {
        if k == PASSWORD_KEY {
            (k, "<redacted>")
        } else {
            (k, v)
        }
    }))
}

/// The datasources a deployment knows about, loaded once at startup.
///
/// Read-only after construction, so it can be shared freely between
/// concurrently executing paragraphs.
#[derive(Debug, Clone, Default)]
pub struct DatasourceRegistry {
    profiles: BTreeMap<String, DatasourceProfile>,
    common: Properties,
}

impl DatasourceRegistry {
    /// Groups `<group>.<property>` settings into datasource profiles.
    ///
    /// Settings whose name has no `.` are ignored. A group other than `common`
    /// that lacks a `driver` or a `url` is dropped with an error log rather
    /// than failing startup.
    pub fn from_properties(properties: &Properties) -> DatasourceRegistry {
        let mut groups: BTreeMap<&str, Properties> = BTreeMap::new();
        for (name, value) in properties.iter() {
            let Some((group, property)) = name.split_once('.') else {
                debug!(property = name, "ignoring property without a datasource prefix");
                continue;
            };
            groups.entry(group).or_default().insert(property, value);
        }

        let common = groups.remove(COMMON_KEY).unwrap_or_default();
        let mut profiles = BTreeMap::new();
        for (key, properties) in groups {
            let (Some(driver), Some(url)) = (properties.get(DRIVER_KEY), properties.get(URL_KEY))
            else {
                error!(
                    "{key} will be ignored. {key}.{DRIVER_KEY} and {key}.{URL_KEY} are mandatory."
                );
                continue;
            };
            let profile = DatasourceProfile {
                key: key.to_string(),
                driver: driver.to_string(),
                url: url.to_string(),
                properties: properties.clone(),
            };
            profiles.insert(key.to_string(), profile);
        }

        debug!(datasources = ?profiles.keys().collect::<Vec<_>>(), ?common, "loaded datasources");
        DatasourceRegistry { profiles, common }
    }

    pub fn resolve(&self, key: &str) -> Result<&DatasourceProfile, ConfigError> {
        self.profiles
            .get(key)
            .ok_or_else(|| ConfigError::NotFound(key.to_string()))
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.profiles.keys().map(String::as_str)
    }

    pub fn profiles(&self) -> impl Iterator<Item = &DatasourceProfile> {
        self.profiles.values()
    }

    /// The settings of the reserved `common` group.
    pub fn common(&self) -> &Properties {
        &self.common
    }

    /// The maximum number of rows a statement may return.
    ///
    /// Parsed on every call so that a malformed setting surfaces on the
    /// paragraph that trips over it instead of being replaced by the default.
    pub fn max_rows(&self) -> Result<usize, ConfigError> {
        match self.common.get(MAX_COUNT_KEY) {
            None => Ok(MAX_COUNT_DEFAULT),
            Some(value) => value
                .trim()
                .parse()
                .map_err(|source| ConfigError::InvalidMaxCount {
                    value: value.to_string(),
                    source,
                }),
        }
    }
}
