//! TLS configuration and the certificate verification policy.
//!
//! Client verification wraps the WebPKI verifier and reclassifies its
//! failures through the open options: a self-signed leaf, a self-signed
//! chain, an expired certificate and a name mismatch are each individually
//! forgivable. When a self-signed certificate is admitted, the peer name is
//! still checked against it unless that too is waived.

use std::sync::{Arc, OnceLock};

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::client::WebPkiServerVerifier;
use rustls::crypto::CryptoProvider;
use rustls::{CertificateError, ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme};
use rustls_pki_types::{CertificateDer, ServerName, UnixTime};
use tracing::{debug, warn};

use crate::{Error, Result};

use super::opts::OpenOpts;

fn provider() -> Arc<CryptoProvider> {
    static PROVIDER: OnceLock<Arc<CryptoProvider>> = OnceLock::new();
    PROVIDER
        .get_or_init(|| Arc::new(rustls::crypto::ring::default_provider()))
        .clone()
}

fn native_roots() -> Arc<RootCertStore> {
    static ROOTS: OnceLock<Arc<RootCertStore>> = OnceLock::new();
    ROOTS
        .get_or_init(|| {
            let mut store = RootCertStore::empty();
            let loaded = rustls_native_certs::load_native_certs();
            for err in &loaded.errors {
                warn!("trust store: {}", err);
            }
            let mut rejected = 0usize;
            for cert in loaded.certs {
                if store.add(cert).is_err() {
                    rejected += 1;
                }
            }
            debug!("trust store: {} roots, {} rejected", store.len(), rejected);
            Arc::new(store)
        })
        .clone()
}

/// Build the client-side TLS configuration for one open.
pub(crate) fn client_config(opts: &OpenOpts) -> Result<Arc<ClientConfig>> {
    let verifier = PolicyVerifier::new(opts)?;
    let mut config = ClientConfig::builder_with_provider(provider())
        .with_safe_default_protocol_versions()
        .map_err(Error::new_tls)?
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(verifier))
        .with_no_client_auth();
    config.enable_sni = opts.send_sni;
    Ok(Arc::new(config))
}

/// The name rustls dials with; doubles as the SNI payload when enabled.
pub(crate) fn server_name(opts: &OpenOpts) -> Result<ServerName<'static>> {
    ServerName::try_from(opts.sni_name().to_owned())
        .map_err(|err| Error::new_tls(format!("bad server name: {}", err)))
}

#[derive(Debug)]
struct PolicyVerifier {
    inner: Option<Arc<WebPkiServerVerifier>>,
    verify_certificate: bool,
    allow_self_signed: bool,
    allow_self_chain: bool,
    allow_expired: bool,
    verify_common_name: bool,
    verify_self_signed_common_name: bool,
}

impl PolicyVerifier {
    fn new(opts: &OpenOpts) -> Result<PolicyVerifier> {
        let inner = if opts.verify_certificate {
            let roots = native_roots();
            if roots.is_empty() {
                return Err(Error::new_tls("no trust roots available"));
            }
            Some(
                WebPkiServerVerifier::builder_with_provider(roots, provider())
                    .build()
                    .map_err(|err| Error::new_tls(format!("{}", err)))?,
            )
        } else {
            None
        };
        Ok(PolicyVerifier {
            inner,
            verify_certificate: opts.verify_certificate,
            allow_self_signed: opts.allow_self_signed,
            allow_self_chain: opts.allow_self_chain,
            allow_expired: opts.allow_expired,
            verify_common_name: opts.verify_common_name,
            verify_self_signed_common_name: opts.verify_self_signed_common_name,
        })
    }

    /// Decide whether a WebPKI rejection is forgiven by the open options.
    fn forgive(
        &self,
        error: CertificateError,
        end_entity: &CertificateDer<'_>,
        chain_depth: usize,
        server_name: &ServerName<'_>,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        let forgiven = match &error {
            CertificateError::UnknownIssuer if chain_depth == 0 => {
                if self.allow_self_signed && self.verify_self_signed_common_name {
                    self.name_matches(end_entity, server_name)
                } else {
                    self.allow_self_signed
                }
            }
            CertificateError::UnknownIssuer => self.allow_self_signed || self.allow_self_chain,
            CertificateError::Expired | CertificateError::ExpiredContext { .. } => {
                self.allow_expired
            }
            CertificateError::NotValidForName
            | CertificateError::NotValidForNameContext { .. } => !self.verify_common_name,
            _ => false,
        };
        if forgiven {
            debug!("certificate admitted by policy despite {:?}", error);
            Ok(ServerCertVerified::assertion())
        } else {
            Err(rustls::Error::InvalidCertificate(error))
        }
    }

    /// subjectAltName / CN equivalence against the offered name.
    fn name_matches(&self, cert: &CertificateDer<'_>, server_name: &ServerName<'_>) -> bool {
        let parsed = match rustls::server::ParsedCertificate::try_from(cert) {
            Ok(parsed) => parsed,
            Err(_) => return false,
        };
        rustls::client::verify_server_name(&parsed, server_name).is_ok()
    }
}

impl ServerCertVerifier for PolicyVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        server_name: &ServerName<'_>,
        ocsp_response: &[u8],
        now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        if !self.verify_certificate {
            return Ok(ServerCertVerified::assertion());
        }
        let inner = self.inner.as_ref().expect("verifier without webpki");
        match inner.verify_server_cert(end_entity, intermediates, server_name, ocsp_response, now)
        {
            Ok(verified) => Ok(verified),
            Err(rustls::Error::InvalidCertificate(cert_err)) => {
                self.forgive(cert_err, end_entity, intermediates.len(), server_name)
            }
            Err(err) => Err(err),
        }
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        match &self.inner {
            Some(inner) => inner.verify_tls12_signature(message, cert, dss),
            None => Ok(HandshakeSignatureValid::assertion()),
        }
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        match &self.inner {
            Some(inner) => inner.verify_tls13_signature(message, cert, dss),
            None => Ok(HandshakeSignatureValid::assertion()),
        }
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        match &self.inner {
            Some(inner) => inner.supported_verify_schemes(),
            None => provider()
                .signature_verification_algorithms
                .supported_schemes(),
        }
    }
}

/// Filter a crypto provider's suites and groups by name fragments, the way
/// an embedding server expresses cipher lists.
pub(crate) fn filter_provider(
    cipher_list: Option<&[String]>,
    cipher_blacklist: &[String],
    curve_list: Option<&[String]>,
) -> CryptoProvider {
    let mut filtered = (*provider()).clone();
    if let Some(list) = cipher_list {
        filtered.cipher_suites.retain(|suite| {
            let name = format!("{:?}", suite.suite()).to_ascii_uppercase();
            list.iter().any(|want| name.contains(&want.to_ascii_uppercase()))
        });
    }
    if !cipher_blacklist.is_empty() {
        filtered.cipher_suites.retain(|suite| {
            let name = format!("{:?}", suite.suite()).to_ascii_uppercase();
            !cipher_blacklist
                .iter()
                .any(|banned| name.contains(&banned.to_ascii_uppercase()))
        });
    }
    if let Some(list) = curve_list {
        filtered.kx_groups.retain(|group| {
            let name = format!("{:?}", group.name()).to_ascii_uppercase();
            list.iter().any(|want| name.contains(&want.to_ascii_uppercase()))
        });
    }
    filtered
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filter_provider_blacklist() {
        let full = provider().cipher_suites.len();
        let filtered = filter_provider(None, &["AES_128".into()], None);
        assert!(filtered.cipher_suites.len() < full);
        for suite in &filtered.cipher_suites {
            let name = format!("{:?}", suite.suite()).to_ascii_uppercase();
            assert!(!name.contains("AES_128"));
        }
    }

    #[test]
    fn filter_provider_allowlist() {
        let filtered = filter_provider(Some(&["CHACHA20".into()]), &[], None);
        assert!(!filtered.cipher_suites.is_empty());
        for suite in &filtered.cipher_suites {
            let name = format!("{:?}", suite.suite()).to_ascii_uppercase();
            assert!(name.contains("CHACHA20"));
        }
    }
}
