//! YAML connector configuration.
//!
//! ```yaml
//! buffer:
//!   initial_decode_capacity: 8192
//!   growth_factor: 2
//! trust:
//!   verify_webpki: true
//!   ca_certs: ["/etc/ssl/private-ca.pem"]
//!   fingerprints: ["ab:cd:..."]
//! proxy:
//!   address: proxy.internal:3128
//!   username: user
//!   password: secret
//! alpn_protocols: ["http/1.1"]
//! ```

use log::debug;
use serde::Deserialize;

use crate::address::NetLocation;
use crate::rustls_util::process_fingerprints;
use crate::tcp_transport::DEFAULT_READ_BUFFER_SIZE;
use crate::tls_socket::{
    BufferPolicy, DEFAULT_DECODE_CAPACITY, DEFAULT_GROWTH_FACTOR, DEFAULT_MIN_ENCODE_CAPACITY,
};

fn default_true() -> bool {
    true
}

fn default_decode_capacity() -> usize {
    DEFAULT_DECODE_CAPACITY
}

fn default_min_encode_capacity() -> usize {
    DEFAULT_MIN_ENCODE_CAPACITY
}

fn default_growth_factor() -> usize {
    DEFAULT_GROWTH_FACTOR
}

fn default_read_buffer_size() -> usize {
    DEFAULT_READ_BUFFER_SIZE
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConnectorConfig {
    #[serde(default)]
    pub buffer: BufferConfig,
    #[serde(default)]
    pub trust: TrustConfig,
    #[serde(default)]
    pub proxy: Option<ProxyConfig>,
    #[serde(default)]
    pub alpn_protocols: Vec<String>,
    #[serde(default = "default_true")]
    pub enable_sni: bool,
    /// Caps the ciphertext rustls buffers per connection.
    #[serde(default)]
    pub tls_buffer_limit: Option<usize>,
}

impl Default for ConnectorConfig {
    fn default() -> Self {
        Self {
            buffer: BufferConfig::default(),
            trust: TrustConfig::default(),
            proxy: None,
            alpn_protocols: vec![],
            enable_sni: true,
            tls_buffer_limit: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BufferConfig {
    #[serde(default = "default_decode_capacity")]
    pub initial_decode_capacity: usize,
    #[serde(default = "default_min_encode_capacity")]
    pub min_encode_capacity: usize,
    #[serde(default = "default_growth_factor")]
    pub growth_factor: usize,
    #[serde(default = "default_read_buffer_size")]
    pub read_buffer_size: usize,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            initial_decode_capacity: DEFAULT_DECODE_CAPACITY,
            min_encode_capacity: DEFAULT_MIN_ENCODE_CAPACITY,
            growth_factor: DEFAULT_GROWTH_FACTOR,
            read_buffer_size: DEFAULT_READ_BUFFER_SIZE,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TrustConfig {
    /// Path validation against the bundled Mozilla roots plus `ca_certs`.
    #[serde(default = "default_true")]
    pub verify_webpki: bool,
    /// Extra trust anchors, as inline PEM or paths to PEM files.
    #[serde(default)]
    pub ca_certs: Vec<String>,
    /// SHA-256 fingerprints of accepted end-entity certificates.
    #[serde(default)]
    pub fingerprints: Vec<String>,
    #[serde(default = "default_true")]
    pub verify_hostname: bool,
}

impl Default for TrustConfig {
    fn default() -> Self {
        Self {
            verify_webpki: true,
            ca_certs: vec![],
            fingerprints: vec![],
            verify_hostname: true,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProxyConfig {
    pub address: NetLocation,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
}

impl ProxyConfig {
    pub fn auth_credentials(&self) -> Option<(String, String)> {
        match (&self.username, &self.password) {
            (None, None) => None,
            (username, password) => Some((
                username.clone().unwrap_or_default(),
                password.clone().unwrap_or_default(),
            )),
        }
    }
}

impl ConnectorConfig {
    pub fn buffer_policy(&self) -> BufferPolicy {
        BufferPolicy {
            initial_decode_capacity: self.buffer.initial_decode_capacity,
            min_encode_capacity: self.buffer.min_encode_capacity,
            growth_factor: self.buffer.growth_factor,
        }
    }

    pub fn validate(&self) -> std::io::Result<()> {
        if self.buffer.initial_decode_capacity == 0 {
            return Err(invalid("buffer.initial_decode_capacity must be positive"));
        }
        if self.buffer.min_encode_capacity == 0 {
            return Err(invalid("buffer.min_encode_capacity must be positive"));
        }
        if self.buffer.growth_factor < 2 {
            return Err(invalid("buffer.growth_factor must be at least 2"));
        }
        if self.buffer.read_buffer_size == 0 {
            return Err(invalid("buffer.read_buffer_size must be positive"));
        }
        if let Some(limit) = self.tls_buffer_limit
            && limit == 0
        {
            return Err(invalid("tls_buffer_limit must be positive"));
        }
        if let Some(ref proxy) = self.proxy
            && proxy.password.is_some()
            && proxy.username.is_none()
        {
            return Err(invalid("proxy.password requires proxy.username"));
        }
        process_fingerprints(&self.trust.fingerprints)?;
        Ok(())
    }
}

fn invalid(message: &str) -> std::io::Error {
    std::io::Error::new(std::io::ErrorKind::InvalidInput, message.to_string())
}

fn is_pem_file_path(s: &str) -> bool {
    !s.trim_start().starts_with("-----BEGIN")
}

/// Parses and validates a config. CA certificate paths are left as they are;
/// `load_config` resolves them.
pub fn parse_config(config_str: &str) -> std::io::Result<ConnectorConfig> {
    let config = serde_yaml::from_str::<ConnectorConfig>(config_str).map_err(|e| {
        std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            format!("Could not parse config YAML: {e}"),
        )
    })?;
    config.validate()?;
    Ok(config)
}

pub async fn load_config(config_filename: &str) -> std::io::Result<ConnectorConfig> {
    let config_str = tokio::fs::read_to_string(config_filename)
        .await
        .map_err(|e| {
            std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("Could not read config file {config_filename}: {e}"),
            )
        })?;

    let mut config = parse_config(&config_str)?;
    for pem in config.trust.ca_certs.iter_mut() {
        if is_pem_file_path(pem) {
            *pem = read_pem_to_string(pem).await?;
        }
    }
    Ok(config)
}

async fn read_pem_to_string(path: &str) -> std::io::Result<String> {
    debug!("Reading PEM file: {path}");
    tokio::fs::read_to_string(path).await.map_err(|e| {
        std::io::Error::new(e.kind(), format!("Failed to read PEM file '{path}': {e}"))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = parse_config("{}").unwrap();
        assert_eq!(config.buffer_policy(), BufferPolicy::default());
        assert_eq!(config.buffer.read_buffer_size, DEFAULT_READ_BUFFER_SIZE);
        assert!(config.trust.verify_webpki);
        assert!(config.trust.verify_hostname);
        assert!(config.enable_sni);
        assert!(config.proxy.is_none());
    }

    #[test]
    fn test_full_config() {
        let config = parse_config(
            r#"
buffer:
  initial_decode_capacity: 1024
  growth_factor: 4
trust:
  verify_webpki: false
  fingerprints: ["ab:ab:ab:ab:ab:ab:ab:ab:ab:ab:ab:ab:ab:ab:ab:ab:ab:ab:ab:ab:ab:ab:ab:ab:ab:ab:ab:ab:ab:ab:ab:ab"]
  verify_hostname: false
proxy:
  address: "[::1]:3128"
  username: user
  password: pass
alpn_protocols: ["h2", "http/1.1"]
enable_sni: false
tls_buffer_limit: 65536
"#,
        )
        .unwrap();
        assert_eq!(config.buffer.initial_decode_capacity, 1024);
        assert_eq!(config.buffer.min_encode_capacity, DEFAULT_MIN_ENCODE_CAPACITY);
        assert_eq!(config.buffer.growth_factor, 4);
        assert!(!config.trust.verify_webpki);
        assert_eq!(config.trust.fingerprints.len(), 1);
        let proxy = config.proxy.unwrap();
        assert_eq!(proxy.address.authority(), "[::1]:3128");
        assert_eq!(
            proxy.auth_credentials(),
            Some(("user".to_string(), "pass".to_string()))
        );
        assert_eq!(config.alpn_protocols.len(), 2);
        assert!(!config.enable_sni);
        assert_eq!(config.tls_buffer_limit, Some(65536));
    }

    #[test]
    fn test_rejects_unknown_fields() {
        assert!(parse_config("bufer: {}").is_err());
        assert!(parse_config("trust:\n  verify: false").is_err());
    }

    #[test]
    fn test_rejects_invalid_values() {
        assert!(parse_config("buffer:\n  growth_factor: 1").is_err());
        assert!(parse_config("buffer:\n  initial_decode_capacity: 0").is_err());
        assert!(parse_config("tls_buffer_limit: 0").is_err());
        assert!(parse_config("proxy:\n  address: proxy:3128\n  password: x").is_err());
        assert!(parse_config("proxy:\n  address: proxy").is_err());
        assert!(parse_config("trust:\n  fingerprints: [\"aa:bb\"]").is_err());
        let bad_hex = format!("trust:\n  fingerprints: [\"{}\"]", "zz".repeat(32));
        assert!(parse_config(&bad_hex).is_err());
    }

    #[test]
    fn test_pem_path_detection() {
        assert!(is_pem_file_path("/etc/ssl/ca.pem"));
        assert!(!is_pem_file_path("-----BEGIN CERTIFICATE-----\nabc"));
    }

    #[tokio::test]
    async fn test_load_config_missing_file() {
        let err = load_config("/nonexistent/connector.yaml").await.unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::InvalidInput);
    }
}
