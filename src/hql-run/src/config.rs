// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Interpreter configuration assembled from defaults, a properties file and
//! command-line overrides.

use std::fmt::Display;
use std::path::Path;
use std::str::FromStr;

use anyhow::Context;
use hql_datasource::{DatasourceProfile, DatasourceRegistry, Properties};
use hql_interpreter::{PropertyDefault, default_properties};
use serde::Serialize;

/// A command-line argument of the form `KEY=VALUE`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyValueArg<K, V> {
    pub key: K,
    pub value: V,
}

impl<K, V> FromStr for KeyValueArg<K, V>
where
    K: FromStr,
    K::Err: Display,
    V: FromStr,
    V::Err: Display,
{
    type Err = String;

    fn from_str(s: &str) -> Result<KeyValueArg<K, V>, String> {
        let (key, value) = s
            .split_once('=')
            .ok_or_else(|| "must have format KEY=VALUE".to_string())?;
        Ok(KeyValueArg {
            key: key.parse().map_err(|e| format!("parsing key: {}", e))?,
            value: value.parse().map_err(|e| format!("parsing value: {}", e))?,
        })
    }
}

/// Builds the interpreter's properties.
///
/// Later sources win: registered defaults, then `file`, then `overrides`.
pub fn load_properties(
    file: Option<&Path>,
    overrides: &[KeyValueArg<String, String>],
) -> Result<Properties, anyhow::Error> {
    let mut properties: Properties = default_properties()
        .into_iter()
        .map(|p| (p.name, p.default))
        .collect();
    if let Some(path) = file {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        let from_file: Properties = text
            .parse()
            .with_context(|| format!("parsing {}", path.display()))?;
        properties.merge(from_file);
    }
    properties.merge(
        overrides
            .iter()
            .map(|kv| (kv.key.as_str(), kv.value.as_str()))
            .collect(),
    );
    Ok(properties)
}

/// What `--dump-config` prints.
#[derive(Debug, Serialize)]
pub struct ConfigDump<'a> {
    pub max_rows: Option<usize>,
    pub datasources: Vec<&'a DatasourceProfile>,
    pub drivers: Vec<&'a str>,
    pub defaults: Vec<PropertyDefault>,
}

impl<'a> ConfigDump<'a> {
    pub fn new(registry: &'a DatasourceRegistry, drivers: Vec<&'a str>) -> Self {
        ConfigDump {
            max_rows: registry.max_rows().ok(),
            datasources: registry.profiles().collect(),
            drivers,
            defaults: default_properties(),
        }
    }
}
