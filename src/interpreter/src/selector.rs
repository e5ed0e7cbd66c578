// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Datasource selectors.
//!
//! A paragraph may name the datasource it runs against by starting with
//! `(<key>)`, on the first line:
//!
//! ```text
//! (reporting)
//! SELECT count(*) FROM events
//! ```

use hql_datasource::DEFAULT_KEY;

/// Splits paragraph text into the datasource key it selects and the SQL to
/// run.
///
/// The selector is recognized only when the text starts with `(` and the
/// matching `)` comes before the first line break. Anything else, including
/// parentheses inside the SQL itself, selects [`DEFAULT_KEY`] and leaves the
/// text untouched. The returned SQL is trimmed.
///
/// Only a leading `(` counts, not the first `(` anywhere on the line:
/// otherwise `SELECT count(*) FROM t` would select a datasource named `*`.
pub fn parse_selector(text: &str) -> (&str, &str) {
    let first_line = text.split('\n').next().unwrap_or_default();
    if let Some(rest) = first_line.strip_prefix('(') {
        if let Some(end) = rest.find(')') {
            let key = &rest[..end];
            // Skip the opening paren, the key and the closing paren.
            let sql = &text[end + 2..];
            return (key, sql.trim());
        }
    }
    (DEFAULT_KEY, text.trim())
}
