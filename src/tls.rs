// This file is part of vrm-bridge.
//
// Copyright 2026 vrm-bridge contributors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//   http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.
//
// SPDX-License-Identifier: Apache-2.0

//! TLS configuration of the VRM API client.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use rustls::crypto::CryptoProvider;
use rustls::{ClientConfig, RootCertStore};
use tracing::{debug, warn};

use crate::error::Report;

/// Environment variable to disable the certificate validation.
pub const IGNORE_SSL_ENV: &str = "VRM_IGNORE_SSL_ERRORS";

/// Error returned while configuring TLS.
#[non_exhaustive]
#[derive(thiserror::Error, Debug)]
pub enum TlsError {
    /// Couldn't read the CA bundle.
    #[error("couldn't read CA bundle {}", path.display())]
    ReadBundle {
        /// Path of the bundle.
        path: PathBuf,
        #[source]
        backtrace: io::Error,
    },
    /// The CA bundle doesn't contain any certificate.
    #[error("no certificate in CA bundle {}", .0.display())]
    EmptyBundle(PathBuf),
    /// Couldn't configure rustls.
    #[error("couldn't configure rustls")]
    Rustls(#[from] rustls::Error),
    /// The blocking task reading the certificates panicked.
    #[error("couldn't join the certificate loading task")]
    Join(#[from] tokio::task::JoinError),
}

pub(crate) fn is_env_ignore_ssl() -> bool {
    matches!(std::env::var(IGNORE_SSL_ENV).as_deref(), Ok("1" | "true"))
}

fn provider() -> Arc<CryptoProvider> {
    Arc::new(rustls::crypto::aws_lc_rs::default_provider())
}

/// Creates the client configuration to reach the VRM API.
///
/// The servers are verified with the CA bundle if given, or with the native roots otherwise.
pub async fn client_config(
    ca_bundle: Option<&Path>,
    insecure: bool,
) -> Result<ClientConfig, TlsError> {
    if insecure || is_env_ignore_ssl() {
        warn!("TLS certificate validation is disabled");

        let config = ClientConfig::builder_with_provider(provider())
            .with_safe_default_protocol_versions()?
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(NoVerifier))
            .with_no_client_auth();

        return Ok(config);
    }

    let roots = match ca_bundle {
        Some(path) => read_ca_bundle(path).await?,
        None => read_native_roots().await?,
    };

    let config = ClientConfig::builder_with_provider(provider())
        .with_safe_default_protocol_versions()?
        .with_root_certificates(roots)
        .with_no_client_auth();

    Ok(config)
}

/// Reads the root certificates from a PEM bundle.
pub async fn read_ca_bundle(path: &Path) -> Result<RootCertStore, TlsError> {
    let pem = tokio::fs::read(path)
        .await
        .map_err(|err| TlsError::ReadBundle {
            path: path.to_path_buf(),
            backtrace: err,
        })?;

    let mut roots = RootCertStore::empty();

    for cert in rustls_pemfile::certs(&mut pem.as_slice()) {
        let cert = cert.map_err(|err| TlsError::ReadBundle {
            path: path.to_path_buf(),
            backtrace: err,
        })?;

        roots.add(cert)?;
    }

    if roots.is_empty() {
        return Err(TlsError::EmptyBundle(path.to_path_buf()));
    }

    debug!(path = %path.display(), certs = roots.len(), "CA bundle read");

    Ok(roots)
}

/// Reads the root certificates of the system.
pub async fn read_native_roots() -> Result<RootCertStore, TlsError> {
    let roots = tokio::task::spawn_blocking(|| {
        let mut roots = RootCertStore::empty();

        let native = rustls_native_certs::load_native_certs();

        for err in native.errors {
            warn!(error = %Report::new(err), "couldn't load a native certificate");
        }

        let (added, ignored) = roots.add_parsable_certificates(native.certs);

        debug!(added, ignored, "native certificates read");

        roots
    })
    .await?;

    Ok(roots)
}

/// Verifier accepting any certificate.
#[derive(Debug)]
struct NoVerifier;

impl rustls::client::danger::ServerCertVerifier for NoVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::pki_types::CertificateDer<'_>,
        _intermediates: &[rustls::pki_types::CertificateDer<'_>],
        _server_name: &rustls::pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        provider()
            .signature_verification_algorithms
            .supported_schemes()
    }
}
