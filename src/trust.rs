//! Post-handshake peer verification.
//!
//! The rustls client configs built by this crate accept any certificate chain
//! during the handshake (handshake signatures are still checked). Chain trust
//! and hostname checks happen here instead, once the handshake engine reports
//! the handshake as done, so that a failure can be reported to the
//! application and optionally overridden.

use std::collections::BTreeSet;
use std::fmt::Debug;
use std::net::IpAddr;
use std::sync::Arc;

use log::debug;
use rustls::pki_types::{CertificateDer, UnixTime};
use x509_parser::prelude::{FromDer, GeneralName, X509Certificate};

use crate::rustls_util::{get_root_cert_store, get_supported_algorithms, process_fingerprints};

/// Decides whether a peer's certificate chain is trusted.
pub trait TrustManager: Debug {
    fn check_server_trusted(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
    ) -> Result<(), rustls::Error>;
}

/// Verifies that the host we connected to is named by the peer's certificate.
pub trait HostnameVerifier: Debug {
    fn verify(&self, host: &str, end_entity: &CertificateDer<'_>) -> Result<(), rustls::Error>;
}

/// Path validation against a set of trust anchors.
#[derive(Debug)]
pub struct WebPkiTrustManager {
    roots: Arc<rustls::RootCertStore>,
    supported_algs: rustls::crypto::WebPkiSupportedAlgorithms,
}

impl WebPkiTrustManager {
    pub fn new(roots: Arc<rustls::RootCertStore>) -> Self {
        Self {
            roots,
            supported_algs: get_supported_algorithms(),
        }
    }

    /// Trust manager over the bundled Mozilla root set.
    pub fn with_platform_roots() -> Self {
        Self::new(get_root_cert_store())
    }
}

impl TrustManager for WebPkiTrustManager {
    fn check_server_trusted(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
    ) -> Result<(), rustls::Error> {
        let cert = rustls::server::ParsedCertificate::try_from(end_entity)?;
        rustls::client::verify_server_cert_signed_by_trust_anchor(
            &cert,
            &self.roots,
            intermediates,
            UnixTime::now(),
            self.supported_algs.all,
        )
    }
}

/// Trusts exactly the end-entity certificates whose SHA-256 digest is pinned.
#[derive(Debug)]
pub struct FingerprintTrustManager {
    fingerprints: BTreeSet<Vec<u8>>,
}

impl FingerprintTrustManager {
    pub fn new(fingerprints: &[String]) -> std::io::Result<Self> {
        Ok(Self {
            fingerprints: process_fingerprints(fingerprints)?,
        })
    }

    pub fn fingerprint(cert: &CertificateDer<'_>) -> Vec<u8> {
        aws_lc_rs::digest::digest(&aws_lc_rs::digest::SHA256, cert.as_ref())
            .as_ref()
            .to_vec()
    }
}

impl TrustManager for FingerprintTrustManager {
    fn check_server_trusted(
        &self,
        end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
    ) -> Result<(), rustls::Error> {
        let fingerprint = Self::fingerprint(end_entity);
        if self.fingerprints.contains(&fingerprint) {
            return Ok(());
        }

        let hex_fingerprint = fingerprint
            .iter()
            .map(|b| format!("{:02x}", b))
            .collect::<Vec<String>>()
            .join(":");

        Err(rustls::Error::General(format!(
            "unknown server fingerprint: {}",
            hex_fingerprint
        )))
    }
}

// Second-level labels under which a `*.xx.yy` wildcard is too broad.
const BAD_COUNTRY_2LDS: [&str; 14] = [
    "ac", "co", "com", "ed", "edu", "go", "gouv", "gov", "info", "lg", "ne", "net", "or", "org",
];

/// Matches the host against the certificate's first common name and its
/// subject alternative names.
///
/// A wildcard only covers a single label: `*.example.com` matches
/// `www.example.com` but neither `example.com` nor `a.b.example.com`.
#[derive(Debug, Default, Clone, Copy)]
pub struct StrictHostnameVerifier;

impl StrictHostnameVerifier {
    /// Subject common names, in certificate order.
    pub fn get_cns(end_entity: &CertificateDer<'_>) -> Result<Vec<String>, rustls::Error> {
        let cert = parse_certificate(end_entity)?;
        Ok(cert
            .subject()
            .iter_common_name()
            .filter_map(|cn| cn.as_str().ok())
            .map(|cn| cn.to_string())
            .collect())
    }

    /// DNS subject alternative names, plus IP address entries when
    /// `include_ips` is set.
    pub fn get_subject_alts(
        end_entity: &CertificateDer<'_>,
        include_ips: bool,
    ) -> Result<Vec<String>, rustls::Error> {
        let cert = parse_certificate(end_entity)?;
        let extension = match cert.subject_alternative_name() {
            Ok(Some(extension)) => extension,
            Ok(None) => return Ok(vec![]),
            Err(e) => {
                return Err(rustls::Error::General(format!(
                    "invalid subject alternative name extension: {e}"
                )));
            }
        };

        let mut names = vec![];
        for name in extension.value.general_names.iter() {
            match name {
                GeneralName::DNSName(dns_name) => names.push(dns_name.to_string()),
                GeneralName::IPAddress(bytes) if include_ips => {
                    if let Some(ip) = ip_from_bytes(bytes) {
                        names.push(ip.to_string());
                    }
                }
                _ => {}
            }
        }
        Ok(names)
    }

    pub fn verify_names(
        &self,
        host: &str,
        cns: &[String],
        subject_alts: &[String],
    ) -> Result<(), rustls::Error> {
        let mut names: Vec<&str> = vec![];
        if let Some(cn) = cns.first() {
            names.push(cn);
        }
        names.extend(subject_alts.iter().map(|s| s.as_str()));

        if names.is_empty() {
            return Err(rustls::Error::General(format!(
                "certificate for <{host}> doesn't contain CN or DNS subjectAlt"
            )));
        }

        let host = normalize_host(host);
        let host_is_ip = host.parse::<IpAddr>().is_ok();

        for name in names.iter() {
            let name = normalize_host(name);
            if matches_name(&host, &name, host_is_ip) {
                return Ok(());
            }
        }

        Err(rustls::Error::General(format!(
            "hostname in certificate didn't match: <{}> != <{}>",
            host,
            names.join(", ")
        )))
    }
}

impl HostnameVerifier for StrictHostnameVerifier {
    fn verify(&self, host: &str, end_entity: &CertificateDer<'_>) -> Result<(), rustls::Error> {
        let host_is_ip = normalize_host(host).parse::<IpAddr>().is_ok();
        let cns = Self::get_cns(end_entity)?;
        let subject_alts = Self::get_subject_alts(end_entity, host_is_ip)?;
        self.verify_names(host, &cns, &subject_alts)
    }
}

fn parse_certificate<'a>(der: &'a CertificateDer<'_>) -> Result<X509Certificate<'a>, rustls::Error> {
    X509Certificate::from_der(der.as_ref())
        .map(|(_, cert)| cert)
        .map_err(|_| rustls::Error::InvalidCertificate(rustls::CertificateError::BadEncoding))
}

fn ip_from_bytes(bytes: &[u8]) -> Option<IpAddr> {
    match bytes.len() {
        4 => {
            let octets: [u8; 4] = bytes.try_into().ok()?;
            Some(IpAddr::from(octets))
        }
        16 => {
            let octets: [u8; 16] = bytes.try_into().ok()?;
            Some(IpAddr::from(octets))
        }
        _ => None,
    }
}

fn normalize_host(host: &str) -> String {
    let host = host.trim().trim_end_matches('.').to_ascii_lowercase();
    let unbracketed = host
        .strip_prefix('[')
        .and_then(|h| h.strip_suffix(']'))
        .unwrap_or(&host);
    // Canonical form, so "0:0::1" matches "::1".
    match unbracketed.parse::<IpAddr>() {
        Ok(ip) => ip.to_string(),
        Err(_) => unbracketed.to_string(),
    }
}

fn acceptable_country_wildcard(parts: &[&str]) -> bool {
    if parts.len() != 3 || parts[2].len() != 2 {
        return true;
    }
    !BAD_COUNTRY_2LDS.contains(&parts[1])
}

fn matches_name(host: &str, name: &str, host_is_ip: bool) -> bool {
    let parts: Vec<&str> = name.split('.').collect();
    let is_wildcard = parts.len() >= 3
        && parts[0].ends_with('*')
        && acceptable_country_wildcard(&parts)
        && !host_is_ip;

    if !is_wildcard {
        return host == name;
    }

    let first_part = parts[0];
    let matched = if first_part.len() > 1 {
        // e.g. "server*.example.com"
        let prefix = &first_part[..first_part.len() - 1];
        let suffix = &name[first_part.len()..];
        host.starts_with(prefix) && host[prefix.len()..].ends_with(suffix)
    } else {
        host.ends_with(&name[1..])
    };

    matched && count_dots(host) == count_dots(name)
}

fn count_dots(s: &str) -> usize {
    s.bytes().filter(|b| *b == b'.').count()
}

/// Accepts every chain. Only for peers authenticated some other way.
#[derive(Debug, Default, Clone, Copy)]
pub struct InsecureTrustManager;

impl TrustManager for InsecureTrustManager {
    fn check_server_trusted(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
    ) -> Result<(), rustls::Error> {
        Ok(())
    }
}

/// Skips hostname verification.
#[derive(Debug, Default, Clone, Copy)]
pub struct AllowAnyHostnameVerifier;

impl HostnameVerifier for AllowAnyHostnameVerifier {
    fn verify(&self, _host: &str, _end_entity: &CertificateDer<'_>) -> Result<(), rustls::Error> {
        Ok(())
    }
}

/// Runs the configured trust managers, then hostname verification, over a
/// peer certificate chain.
#[derive(Debug, Clone, Default)]
pub struct TrustEvaluator {
    trust_managers: Vec<Arc<dyn TrustManager>>,
    hostname_verifier: Option<Arc<dyn HostnameVerifier>>,
}

impl TrustEvaluator {
    pub fn new(
        trust_managers: Vec<Arc<dyn TrustManager>>,
        hostname_verifier: Option<Arc<dyn HostnameVerifier>>,
    ) -> Self {
        Self {
            trust_managers,
            hostname_verifier,
        }
    }

    /// Trust is established when any trust manager accepts the chain and the
    /// hostname check passes for it. Otherwise the last failure is returned.
    ///
    /// Hostname verification is skipped when `host` is `None`.
    pub fn evaluate(
        &self,
        host: Option<&str>,
        chain: &[CertificateDer<'_>],
    ) -> Result<(), rustls::Error> {
        let Some((end_entity, intermediates)) = chain.split_first() else {
            return Err(rustls::Error::NoCertificatesPresented);
        };

        let platform_default: [Arc<dyn TrustManager>; 1];
        let trust_managers: &[Arc<dyn TrustManager>] = if self.trust_managers.is_empty() {
            platform_default = [Arc::new(WebPkiTrustManager::with_platform_roots())];
            &platform_default
        } else {
            &self.trust_managers
        };

        let mut last_error = rustls::Error::General("no trust manager accepted the chain".into());
        for trust_manager in trust_managers.iter() {
            let result = trust_manager
                .check_server_trusted(end_entity, intermediates)
                .and_then(|()| match host {
                    Some(host) => match self.hostname_verifier {
                        Some(ref verifier) => verifier.verify(host, end_entity),
                        None => StrictHostnameVerifier.verify(host, end_entity),
                    },
                    None => Ok(()),
                });
            match result {
                Ok(()) => return Ok(()),
                Err(e) => {
                    debug!("trust manager {:?} rejected peer: {}", trust_manager, e);
                    last_error = e;
                }
            }
        }
        Err(last_error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn self_signed(names: &[&str]) -> CertificateDer<'static> {
        let key_pair = rcgen::KeyPair::generate().expect("Failed to generate key pair");
        let params =
            rcgen::CertificateParams::new(names.iter().map(|s| s.to_string()).collect::<Vec<_>>())
                .expect("Failed to create certificate params");
        let cert = params
            .self_signed(&key_pair)
            .expect("Failed to create self-signed certificate");
        cert.der().clone()
    }

    fn verify(host: &str, cn: Option<&str>, alts: &[&str]) -> bool {
        let cns: Vec<String> = cn.into_iter().map(|s| s.to_string()).collect();
        let alts: Vec<String> = alts.iter().map(|s| s.to_string()).collect();
        StrictHostnameVerifier
            .verify_names(host, &cns, &alts)
            .is_ok()
    }

    #[test]
    fn test_exact_match_is_case_insensitive() {
        assert!(verify("www.Example.com", Some("WWW.example.COM"), &[]));
        assert!(verify("example.com", None, &["other.com", "example.com"]));
        assert!(!verify("example.org", Some("example.com"), &["example.net"]));
    }

    #[test]
    fn test_wildcard_covers_single_label() {
        assert!(verify("www.example.com", None, &["*.example.com"]));
        assert!(!verify("example.com", None, &["*.example.com"]));
        assert!(!verify("a.b.example.com", None, &["*.example.com"]));
    }

    #[test]
    fn test_partial_wildcard() {
        assert!(verify("server1.example.com", None, &["server*.example.com"]));
        assert!(!verify("mail.example.com", None, &["server*.example.com"]));
    }

    #[test]
    fn test_wildcard_rejected_for_country_2ld_and_ip() {
        assert!(!verify("foo.co.uk", None, &["*.co.uk"]));
        assert!(verify("foo.bar.uk", None, &["*.bar.uk"]));
        assert!(!verify("10.0.0.1", None, &["*.0.0.1"]));
    }

    #[test]
    fn test_only_first_cn_used() {
        let cns = vec!["first.example.com".to_string(), "second.example.com".to_string()];
        assert!(StrictHostnameVerifier
            .verify_names("first.example.com", &cns, &[])
            .is_ok());
        assert!(StrictHostnameVerifier
            .verify_names("second.example.com", &cns, &[])
            .is_err());
    }

    #[test]
    fn test_no_names() {
        assert!(!verify("example.com", None, &[]));
    }

    #[test]
    fn test_verify_against_certificate() {
        let cert = self_signed(&["localhost", "127.0.0.1"]);
        assert!(StrictHostnameVerifier.verify("localhost", &cert).is_ok());
        assert!(StrictHostnameVerifier.verify("127.0.0.1", &cert).is_ok());
        assert!(StrictHostnameVerifier.verify("example.com", &cert).is_err());
    }

    #[test]
    fn test_fingerprint_trust_manager() {
        let cert = self_signed(&["localhost"]);
        let hex = FingerprintTrustManager::fingerprint(&cert)
            .iter()
            .map(|b| format!("{:02x}", b))
            .collect::<Vec<String>>()
            .join(":");

        let pinned = FingerprintTrustManager::new(&[hex]).unwrap();
        assert!(pinned.check_server_trusted(&cert, &[]).is_ok());

        let other = self_signed(&["localhost"]);
        assert!(pinned.check_server_trusted(&other, &[]).is_err());
    }

    #[test]
    fn test_platform_roots_reject_self_signed() {
        let cert = self_signed(&["localhost"]);
        let evaluator = TrustEvaluator::default();
        assert!(evaluator.evaluate(Some("localhost"), &[cert]).is_err());
    }

    #[test]
    fn test_evaluator_tries_each_manager_and_checks_hostname() {
        let cert = self_signed(&["localhost"]);
        let hex = FingerprintTrustManager::fingerprint(&cert)
            .iter()
            .map(|b| format!("{:02x}", b))
            .collect::<String>();
        let evaluator = TrustEvaluator::new(
            vec![
                Arc::new(WebPkiTrustManager::with_platform_roots()),
                Arc::new(FingerprintTrustManager::new(&[hex]).unwrap()),
            ],
            None,
        );
        assert!(evaluator.evaluate(Some("localhost"), &[cert.clone()]).is_ok());
        assert!(evaluator.evaluate(None, &[cert.clone()]).is_ok());
        assert!(evaluator.evaluate(Some("example.com"), &[cert]).is_err());
        assert!(matches!(
            evaluator.evaluate(Some("localhost"), &[]),
            Err(rustls::Error::NoCertificatesPresented)
        ));
    }
}
