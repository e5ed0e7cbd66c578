// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Datasource configuration for the hql interpreter.
//!
//! A deployment describes every remote SQL engine it can talk to with a flat
//! set of `<group>.<property>` settings. This crate turns those settings into
//! named [`DatasourceProfile`]s, exposes the cross-cutting limits stored in the
//! reserved `common` group, and decides which credentials a connection for a
//! given datasource and end user should authenticate with.

use std::num::ParseIntError;

mod credentials;
mod properties;
mod registry;

pub use credentials::{ConnectAuth, Credential, CredentialPolicy, CredentialSource};
pub use properties::{Properties, PropertiesError};
pub use registry::{DatasourceProfile, DatasourceRegistry};

/// The reserved group holding limits that apply to every datasource.
pub const COMMON_KEY: &str = "common";
/// The datasource used when a paragraph does not name one.
pub const DEFAULT_KEY: &str = "default";

/// Property holding the maximum number of rows returned per statement.
pub const MAX_COUNT_KEY: &str = "max_count";
/// Value of [`MAX_COUNT_KEY`] when it is not configured.
pub const MAX_COUNT_DEFAULT: usize = 1000;

pub const DRIVER_KEY: &str = "driver";
pub const URL_KEY: &str = "url";
pub const USER_KEY: &str = "user";
pub const PASSWORD_KEY: &str = "password";

/// Errors arising from datasource configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// No datasource with the requested key survived loading.
    #[error("datasource '{0}' is not configured")]
    NotFound(String),
    /// `common.max_count` is not a non-negative integer.
    #[error("invalid {COMMON_KEY}.{MAX_COUNT_KEY} value '{value}': {source}")]
    InvalidMaxCount {
        value: String,
        #[source]
        source: ParseIntError,
    },
}
