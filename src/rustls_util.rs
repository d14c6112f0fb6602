use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::OnceLock;

use rustls::pki_types::pem::PemObject;

/// Client config whose handshake-time verifier accepts any chain.
///
/// Chain and hostname trust are decided after the handshake by
/// `TrustEvaluator`; handshake signatures are still verified here.
pub fn create_client_config(
    alpn_protocols: &[String],
    enable_sni: bool,
) -> std::io::Result<rustls::ClientConfig> {
    let builder = rustls::ClientConfig::builder_with_provider(get_crypto_provider())
        .with_safe_default_protocol_versions()
        .map_err(|e| {
            std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("Could not select protocol versions: {e}"),
            )
        })?;

    let mut config = builder
        .dangerous()
        .with_custom_certificate_verifier(get_deferred_verifier())
        .with_no_client_auth();

    config.alpn_protocols = alpn_protocols
        .iter()
        .map(|s| s.as_bytes().to_vec())
        .collect();

    config.enable_sni = enable_sni;
    Ok(config)
}

#[derive(Debug)]
pub struct DeferredVerifier {
    supported_algs: rustls::crypto::WebPkiSupportedAlgorithms,
}

impl rustls::client::danger::ServerCertVerifier for DeferredVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::pki_types::CertificateDer<'_>,
        _intermediates: &[rustls::pki_types::CertificateDer<'_>],
        _server_name: &rustls::pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> std::result::Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &rustls::pki_types::CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(message, cert, dss, &self.supported_algs)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &rustls::pki_types::CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(message, cert, dss, &self.supported_algs)
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        self.supported_algs.supported_schemes()
    }
}

fn get_crypto_provider() -> Arc<rustls::crypto::CryptoProvider> {
    static INSTANCE: OnceLock<Arc<rustls::crypto::CryptoProvider>> = OnceLock::new();
    INSTANCE
        .get_or_init(|| Arc::new(rustls::crypto::aws_lc_rs::default_provider()))
        .clone()
}

pub fn get_supported_algorithms() -> rustls::crypto::WebPkiSupportedAlgorithms {
    get_crypto_provider().signature_verification_algorithms
}

fn get_deferred_verifier() -> Arc<DeferredVerifier> {
    static INSTANCE: OnceLock<Arc<DeferredVerifier>> = OnceLock::new();
    INSTANCE
        .get_or_init(|| {
            Arc::new(DeferredVerifier {
                supported_algs: get_supported_algorithms(),
            })
        })
        .clone()
}

pub fn get_root_cert_store() -> Arc<rustls::RootCertStore> {
    static INSTANCE: OnceLock<Arc<rustls::RootCertStore>> = OnceLock::new();
    INSTANCE
        .get_or_init(|| {
            let root_store = rustls::RootCertStore {
                roots: webpki_roots::TLS_SERVER_ROOTS.to_vec(),
            };
            Arc::new(root_store)
        })
        .clone()
}

/// Builds a root store from PEM-encoded certificates, optionally on top of
/// the bundled Mozilla roots.
pub fn create_root_cert_store(
    pem_certs: &[String],
    include_platform_roots: bool,
) -> std::io::Result<Arc<rustls::RootCertStore>> {
    let mut root_store = if include_platform_roots {
        get_root_cert_store().as_ref().clone()
    } else {
        rustls::RootCertStore::empty()
    };

    for pem in pem_certs {
        let mut found = false;
        for cert in rustls::pki_types::CertificateDer::pem_slice_iter(pem.as_bytes()) {
            let cert = cert.map_err(|e| {
                std::io::Error::new(
                    std::io::ErrorKind::InvalidInput,
                    format!("Invalid CA certificate PEM: {e}"),
                )
            })?;
            root_store.add(cert).map_err(|e| {
                std::io::Error::new(
                    std::io::ErrorKind::InvalidInput,
                    format!("Unusable CA certificate: {e}"),
                )
            })?;
            found = true;
        }
        if !found {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "No certificates found in CA certificate entry",
            ));
        }
    }

    Ok(Arc::new(root_store))
}

pub fn create_server_config(
    cert_bytes: &[u8],
    key_bytes: &[u8],
    alpn_protocols: &[String],
) -> std::io::Result<rustls::ServerConfig> {
    let certs = rustls::pki_types::CertificateDer::pem_slice_iter(cert_bytes)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| {
            std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("Invalid certificate PEM: {e}"),
            )
        })?;

    let privkey = rustls::pki_types::PrivateKeyDer::from_pem_slice(key_bytes).map_err(|e| {
        std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            format!("Invalid private key PEM: {e}"),
        )
    })?;

    let builder = rustls::ServerConfig::builder_with_provider(get_crypto_provider())
        .with_safe_default_protocol_versions()
        .map_err(|e| {
            std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("Could not select protocol versions: {e}"),
            )
        })?;

    let mut config = builder
        .with_no_client_auth()
        .with_single_cert(certs, privkey)
        .map_err(|e| {
            std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("bad certificate/key: {e}"),
            )
        })?;

    config.alpn_protocols = alpn_protocols
        .iter()
        .map(|s| s.as_bytes().to_vec())
        .collect();

    config.ignore_client_order = true;

    Ok(config)
}

pub fn process_fingerprints(fingerprints: &[String]) -> std::io::Result<BTreeSet<Vec<u8>>> {
    let mut result = BTreeSet::new();

    for fingerprint in fingerprints {
        // Remove any colons and whitespace
        let clean_fp = fingerprint.replace(":", "").replace(" ", "");

        if clean_fp.len() % 2 != 0 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!(
                    "Invalid fingerprint, odd number of hex chars: {}",
                    fingerprint
                ),
            ));
        }

        let bytes = (0..clean_fp.len())
            .step_by(2)
            .map(|i| {
                clean_fp
                    .get(i..i + 2)
                    .and_then(|s| u8::from_str_radix(s, 16).ok())
            })
            .collect::<Option<Vec<u8>>>()
            .ok_or_else(|| {
                std::io::Error::new(
                    std::io::ErrorKind::InvalidInput,
                    format!(
                        "Invalid fingerprint, could not convert to hex: {}",
                        fingerprint
                    ),
                )
            })?;

        if bytes.len() != 32 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!(
                    "Invalid fingerprint, expected 32 bytes of SHA-256: {}",
                    fingerprint
                ),
            ));
        }

        result.insert(bytes);
    }

    Ok(result)
}
