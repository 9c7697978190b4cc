//! Per-request TLS policy construction.
//!
//! The `skip_tls_checks` query parameter selects which parts of TLS
//! verification to relax for a single outbound connection: nothing, the
//! hostname check, the certificate chain, or both, optionally widening the
//! cipher-suite list. The resulting `rustls::ClientConfig` is built per
//! request and feeds both the HTTP client and the WebSocket connector, so a
//! bypass granted to one request can never leak into another.

use std::sync::{Arc, Once};

use once_cell::sync::Lazy;
use rustls::{
    CertificateError, ClientConfig, DigitallySignedStruct, Error as TlsError, RootCertStore,
    SignatureScheme,
    client::{
        WebPkiServerVerifier,
        danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier},
    },
    crypto::CryptoProvider,
    pki_types::{CertificateDer, ServerName, UnixTime},
};

/// Install the ring crypto provider as the process default.
///
/// Must be called once at startup before any TLS connection is attempted.
pub fn init_crypto_provider() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = rustls::crypto::ring::default_provider().install_default();
    });
}

/// TLS verification relaxations requested for a single request.
///
/// Widening is monotonic: every recognized token only ever disables more
/// verification, never less.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TlsBypass {
    pub skip_hostname: bool,
    pub skip_verify: bool,
    pub weak_ciphers: bool,
}

impl TlsBypass {
    /// Parse the `skip_tls_checks` query parameter value.
    ///
    /// Absent or empty means full verification. A truthy literal
    /// (`true|1|yes`) or the token `all` disables hostname and chain
    /// verification. Otherwise the value is a comma-separated list of
    /// tokens naming individual TLS failures to tolerate.
    pub fn parse(raw: Option<&str>) -> Self {
        let Some(raw) = raw else {
            return Self::default();
        };
        let lowered = raw.trim().to_ascii_lowercase();
        if lowered.is_empty() {
            return Self::default();
        }
        if matches!(lowered.as_str(), "true" | "1" | "yes") {
            tracing::debug!("skip_tls_checks is truthy, disabling all TLS verification");
            return Self {
                skip_hostname: true,
                skip_verify: true,
                weak_ciphers: false,
            };
        }

        let mut bypass = Self::default();
        for check in lowered.split(',').map(str::trim).filter(|c| !c.is_empty()) {
            match check {
                "all" => {
                    bypass.skip_hostname = true;
                    bypass.skip_verify = true;
                }
                "expired_cert" | "self_signed" => {
                    bypass.skip_verify = true;
                    bypass.skip_hostname = true;
                }
                "cert_authority" => bypass.skip_verify = true,
                "hostname_mismatch" => bypass.skip_hostname = true,
                "weak_cipher" => bypass.weak_ciphers = true,
                other => {
                    tracing::warn!(check = %other, "Unknown skip_tls_checks value, ignoring");
                }
            }
        }
        bypass
    }

    pub fn is_default(&self) -> bool {
        *self == Self::default()
    }

    /// Build the client configuration implementing this bypass.
    pub fn client_config(&self) -> Result<ClientConfig, TlsBuildError> {
        let provider = Arc::new(self.crypto_provider());
        let builder = ClientConfig::builder_with_provider(provider.clone())
            .with_safe_default_protocol_versions()
            .map_err(|e| TlsBuildError::Protocols(e.to_string()))?;

        let config = if self.skip_verify {
            builder
                .dangerous()
                .with_custom_certificate_verifier(Arc::new(AcceptAnyCert(provider)))
                .with_no_client_auth()
        } else if self.skip_hostname {
            let webpki = WebPkiServerVerifier::builder_with_provider(native_roots(), provider)
                .build()
                .map_err(|e| TlsBuildError::Verifier(e.to_string()))?;
            builder
                .dangerous()
                .with_custom_certificate_verifier(Arc::new(IgnoreHostname(webpki)))
                .with_no_client_auth()
        } else {
            builder
                .with_root_certificates(native_roots())
                .with_no_client_auth()
        };

        Ok(config)
    }

    fn crypto_provider(&self) -> CryptoProvider {
        let mut provider = rustls::crypto::ring::default_provider();
        if self.weak_ciphers {
            // The full ring suite list includes the non-default (weaker)
            // suites; rustls offers nothing below this.
            provider.cipher_suites = rustls::crypto::ring::ALL_CIPHER_SUITES.to_vec();
        }
        provider
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TlsBuildError {
    #[error("unsupported protocol versions: {0}")]
    Protocols(String),

    #[error("failed to build certificate verifier: {0}")]
    Verifier(String),
}

/// Native trust roots, loaded once per process.
fn native_roots() -> Arc<RootCertStore> {
    static ROOTS: Lazy<Arc<RootCertStore>> = Lazy::new(|| {
        let mut store = RootCertStore::empty();
        let native = rustls_native_certs::load_native_certs();
        for error in &native.errors {
            tracing::warn!(error = %error, "Failed to load a native root certificate");
        }
        let (added, ignored) = store.add_parsable_certificates(native.certs);
        tracing::debug!(added, ignored, "Loaded native trust roots");
        store.into()
    });
    ROOTS.clone()
}

/// Verifier that accepts any certificate chain and any hostname.
///
/// Selected only when the request explicitly opted out of chain
/// verification. Signature checks still run so the handshake remains
/// well-formed.
#[derive(Debug)]
struct AcceptAnyCert(Arc<CryptoProvider>);

impl ServerCertVerifier for AcceptAnyCert {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, TlsError> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, TlsError> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.0.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, TlsError> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.0.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.0.signature_verification_algorithms.supported_schemes()
    }
}

/// Verifier that enforces chain validity but tolerates a name mismatch.
#[derive(Debug)]
struct IgnoreHostname(Arc<WebPkiServerVerifier>);

impl ServerCertVerifier for IgnoreHostname {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        server_name: &ServerName<'_>,
        ocsp_response: &[u8],
        now: UnixTime,
    ) -> Result<ServerCertVerified, TlsError> {
        match self
            .0
            .verify_server_cert(end_entity, intermediates, server_name, ocsp_response, now)
        {
            Err(TlsError::InvalidCertificate(
                CertificateError::NotValidForName
                | CertificateError::NotValidForNameContext { .. },
            )) => Ok(ServerCertVerified::assertion()),
            other => other,
        }
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, TlsError> {
        self.0.verify_tls12_signature(message, cert, dss)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, TlsError> {
        self.0.verify_tls13_signature(message, cert, dss)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.0.supported_verify_schemes()
    }
}
