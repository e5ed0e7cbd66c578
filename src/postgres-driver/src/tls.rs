// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! TLS connectors for PostgreSQL connections.

use openssl::ssl::{SslConnector, SslMethod, SslVerifyMode};
use openssl::x509::X509;
use postgres_openssl::MakeTlsConnector;
use tokio_postgres::config::SslMode;

/// An error representing TLS setup failures.
#[derive(Debug, thiserror::Error)]
pub enum TlsError {
    #[error(transparent)]
    Generic(#[from] anyhow::Error),
    #[error(transparent)]
    OpenSsl(#[from] openssl::error::ErrorStack),
}

/// Creates a TLS connector for the given [`Config`](tokio_postgres::Config).
///
/// With `sslmode=require` the server certificate is only verified when a root
/// certificate is supplied, and the hostname is never verified.
pub fn make_tls(
    config: &tokio_postgres::Config,
    root_cert: Option<&[u8]>,
) -> Result<MakeTlsConnector, TlsError> {
    let mut builder = SslConnector::builder(SslMethod::tls_client())?;
    let verify_mode = match config.get_ssl_mode() {
        SslMode::Disable | SslMode::Prefer => SslVerifyMode::NONE,
        SslMode::Require => match root_cert {
            Some(_) => SslVerifyMode::PEER,
            None => SslVerifyMode::NONE,
        },
        mode => {
            return Err(TlsError::Generic(anyhow::anyhow!(
                "unsupported sslmode {mode:?}"
            )));
        }
    };
    builder.set_verify(verify_mode);

    if let Some(root_cert) = root_cert {
        builder
            .cert_store_mut()
            .add_cert(X509::from_pem(root_cert)?)?;
    }

    let mut tls_connector = MakeTlsConnector::new(builder.build());
    if verify_mode == SslVerifyMode::PEER {
        tls_connector.set_callback(|connect, _| {
            connect.set_verify_hostname(false);
            Ok(())
        });
    }
    Ok(tls_connector)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_connector_for_plain_modes() {
        let mut config = tokio_postgres::Config::new();
        config.ssl_mode(SslMode::Disable);
        assert!(make_tls(&config, None).is_ok());
        config.ssl_mode(SslMode::Require);
        assert!(make_tls(&config, None).is_ok());
    }

    #[test]
    fn rejects_malformed_root_cert() {
        let mut config = tokio_postgres::Config::new();
        config.ssl_mode(SslMode::Require);
        assert!(matches!(
            make_tls(&config, Some(b"not a certificate")),
            Err(TlsError::OpenSsl(_))
        ));
    }
}
