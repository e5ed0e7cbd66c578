// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! A multi-tenant SQL interpreter for notebook paragraphs.
//!
//! Each paragraph is a piece of SQL, optionally preceded by a `(datasource)`
//! selector, executed on behalf of the user who submitted it. Results come
//! back as text the notebook knows how to render: a tab-separated table, a
//! query plan, or an update count.

use serde::Serialize;

mod health;
mod interpreter;
mod output;
mod scheduler;
mod selector;

pub use health::{ClosedConnectionSignatures, VERTICA_CONNECTION_CLOSED};
pub use interpreter::{INTERPRETER_GROUP, INTERPRETER_NAME, SqlInterpreter};
pub use output::{TABLE_MARKER, UPDATE_COUNT_HEADER, is_explain};
pub use scheduler::ParallelScheduler;
pub use selector::parse_selector;

/// Who is running which paragraph.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParagraphContext {
    pub user: String,
    pub paragraph_id: String,
}

impl ParagraphContext {
    pub fn new(user: impl Into<String>, paragraph_id: impl Into<String>) -> Self {
        ParagraphContext {
            user: user.into(),
            paragraph_id: paragraph_id.into(),
        }
    }
}

/// Whether a paragraph succeeded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Code {
    Success,
    Error,
}

/// The outcome of a paragraph, as shown to the user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InterpreterResult {
    code: Code,
    message: String,
}

impl InterpreterResult {
    pub fn success(message: impl Into<String>) -> Self {
        InterpreterResult {
            code: Code::Success,
            message: message.into(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        InterpreterResult {
            code: Code::Error,
            message: message.into(),
        }
    }

    pub fn code(&self) -> Code {
        self.code
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn is_success(&self) -> bool {
        self.code == Code::Success
    }
}

/// How the notebook should render a paragraph's input form.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FormType {
    Native,
    Simple,
    None,
}

/// A property the interpreter understands, with the value it takes when not
/// configured.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PropertyDefault {
    pub name: &'static str,
    pub default: &'static str,
    pub description: &'static str,
}

/// The properties registered with the interpreter and their defaults.
pub fn default_properties() -> Vec<PropertyDefault> {
    vec![
        PropertyDefault {
            name: "common.max_count",
            default: "1000",
            description: "Maximum number of rows returned per statement",
        },
        PropertyDefault {
            name: "default.driver",
            default: "postgres",
            description: "Driver for the default datasource",
        },
        PropertyDefault {
            name: "default.url",
            default: "postgres://localhost:5432/postgres",
            description: "The URL of the default datasource",
        },
        PropertyDefault {
            name: "default.user",
            default: "postgres",
            description: "The user for the default datasource",
        },
        PropertyDefault {
            name: "default.password",
            default: "",
            description: "The password for the default datasource user",
        },
    ]
}

#[cfg(test)]
mod tests {
    use hql_datasource::{DatasourceRegistry, Properties};

    use super::*;

    #[test]
    fn defaults_describe_a_usable_datasource() {
        let properties: Properties = default_properties()
            .into_iter()
            .map(|p| (p.name, p.default))
            .collect();
        let registry = DatasourceRegistry::from_properties(&properties);
        let profile = registry.resolve("default").unwrap();
        assert_eq!(profile.driver(), "postgres");
        assert_eq!(registry.max_rows().unwrap(), 1000);
    }

    #[test]
    fn results_serialize_with_upper_case_codes() {
        let json = serde_json::to_string(&InterpreterResult::error("boom")).unwrap();
        assert_eq!(json, r#"{"code":"ERROR","message":"boom"}"#);
    }
}
