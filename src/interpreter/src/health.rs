// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Deciding whether a failed statement left its connection usable.

use hql_conn_pool::{BackendError, BackendErrorKind, Disposition};

/// Error text Vertica reports once it has torn a session down.
pub const VERTICA_CONNECTION_CLOSED: &str = "[Vertica][VJDBC](100161) The connection is closed";

/// Recognizes errors that mean the engine closed the session server-side.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClosedConnectionSignatures {
    signatures: Vec<String>,
}

impl Default for ClosedConnectionSignatures {
    fn default() -> Self {
        ClosedConnectionSignatures {
            signatures: vec![VERTICA_CONNECTION_CLOSED.to_string()],
        }
    }
}

impl ClosedConnectionSignatures {
    pub fn new(signatures: impl IntoIterator<Item = impl Into<String>>) -> Self {
        ClosedConnectionSignatures {
            signatures: signatures.into_iter().map(Into::into).collect(),
        }
    }

    pub fn with_signature(mut self, signature: impl Into<String>) -> Self {
        self.signatures.push(signature.into());
        self
    }

    /// Whether `error` says the connection is gone.
    ///
    /// Errors the driver itself classified as [`BackendErrorKind::Closed`]
    /// count, as does any message containing a known signature.
    pub fn matches(&self, error: &BackendError) -> bool {
        error.kind == BackendErrorKind::Closed
            || self
                .signatures
                .iter()
                .any(|signature| error.message.contains(signature.as_str()))
    }

    /// What to do with the connection a statement failed on.
    pub fn disposition(&self, error: &BackendError) -> Disposition {
        if self.matches(error) {
            Disposition::Discard
        } else {
            Disposition::Recycle
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vertica_signature_discards() {
        let signatures = ClosedConnectionSignatures::default();
        let error = BackendError::execution(
            "ERROR 100161: [Vertica][VJDBC](100161) The connection is closed",
        );
        assert_eq!(signatures.disposition(&error), Disposition::Discard);
    }

    #[test]
    fn ordinary_errors_recycle() {
        let signatures = ClosedConnectionSignatures::default();
        let error = BackendError::execution("relation \"missing\" does not exist");
        assert_eq!(signatures.disposition(&error), Disposition::Recycle);
    }

    #[test]
    fn closed_kind_discards() {
        let signatures = ClosedConnectionSignatures::new(Vec::<String>::new());
        assert!(signatures.matches(&BackendError::closed("connection closed")));
        assert!(!signatures.matches(&BackendError::execution("The connection is closed")));
    }

    #[test]
    fn extra_signatures() {
        let signatures = ClosedConnectionSignatures::default().with_signature("server closed");
        assert!(signatures.matches(&BackendError::execution("FATAL: server closed the connection")));
    }
}
