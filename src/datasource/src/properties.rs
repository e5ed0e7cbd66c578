// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Flat key-value settings in the properties-file format.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// An ordered bag of string settings.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct Properties {
    entries: BTreeMap<String, String>,
}

#[derive(Debug, thiserror::Error)]
#[error("line {line}: expected KEY=VALUE or KEY: VALUE, got '{text}'")]
pub struct PropertiesError {
    pub line: usize,
    pub text: String,
}

impl Properties {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries.get(key).map(String::as_str)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    /// Sets `key` to `value`, returning the previous value.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) -> Option<String> {
        self.entries.insert(key.into(), value.into())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Overlays `other` on top of `self`; keys in `other` win.
    pub fn merge(&mut self, other: Properties) {
        self.entries.extend(other.entries);
    }
}

impl FromStr for Properties {
    type Err = PropertiesError;

    /// Parses the line-oriented properties format: `key=value` or
    /// `key: value`, blank lines and lines starting with `#` or `!` ignored.
    /// Keys and values are trimmed. Line continuations are not supported.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut properties = Properties::new();
        for (idx, raw) in s.lines().enumerate() {
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') || line.starts_with('!') {
                continue;
            }
            let Some(split) = line.find(['=', ':']) else {
                return Err(PropertiesError {
                    line: idx + 1,
                    text: raw.to_string(),
                });
            };
            let key = line[..split].trim();
            if key.is_empty() {
                return Err(PropertiesError {
                    line: idx + 1,
                    text: raw.to_string(),
                });
            }
            properties.insert(key, line[split + 1..].trim());
        }
        Ok(properties)
    }
}

impl<K, V> FromIterator<(K, V)> for Properties
where
    K: Into<String>,
    V: Into<String>,
{
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Properties {
            entries: iter
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }
}

impl fmt::Debug for Properties {
    // Values under password-like keys never reach the logs.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut map = f.debug_map();
        for (k, v) in &self.entries {
            if k.ends_with(crate::PASSWORD_KEY) {
                map.entry(k, &"<redacted>");
            } else {
                map.entry(k, v);
            }
        }
        map.finish()
    }
}
