//! Client-side factory for TLS sockets: one shared rustls config, trust
//! policy and buffer policy, applied to every connection it opens.

use std::fmt::Debug;
use std::io;
use std::sync::Arc;

use bytes::Bytes;
use log::{debug, warn};

use crate::address::NetLocation;
use crate::config::{ConnectorConfig, ProxyConfig};
use crate::error::SslError;
use crate::http_connect::ConnectTunnel;
use crate::rustls_engine::RustlsEngine;
use crate::rustls_util::{create_client_config, create_root_cert_store};
use crate::tcp_transport::{DEFAULT_READ_BUFFER_SIZE, TcpTransport, establish_tunnel};
use crate::tls_socket::{BufferPolicy, TlsSocket};
use crate::transport::Transport;
use crate::trust::{
    AllowAnyHostnameVerifier, FingerprintTrustManager, HostnameVerifier, InsecureTrustManager,
    TrustEvaluator, TrustManager, WebPkiTrustManager,
};

/// Adjusts each client connection before its handshake starts.
pub trait EngineConfigurator: Debug {
    fn configure_engine(&self, connection: &mut rustls::ClientConnection);
}

/// Caps the ciphertext rustls will buffer for sending.
#[derive(Debug, Clone, Copy)]
pub struct BufferLimitConfigurator(pub Option<usize>);

impl EngineConfigurator for BufferLimitConfigurator {
    fn configure_engine(&self, connection: &mut rustls::ClientConnection) {
        connection.set_buffer_limit(self.0);
    }
}

#[derive(Debug)]
pub struct TlsConnector {
    client_config: Arc<rustls::ClientConfig>,
    trust_managers: Vec<Arc<dyn TrustManager>>,
    hostname_verifier: Option<Arc<dyn HostnameVerifier>>,
    engine_configurators: Vec<Box<dyn EngineConfigurator>>,
    buffer_policy: BufferPolicy,
    read_buffer_size: usize,
    proxy: Option<ProxyConfig>,
}

impl TlsConnector {
    /// Connector with platform roots, strict hostname checks and no proxy.
    pub fn new() -> io::Result<Self> {
        Ok(Self::with_client_config(Arc::new(create_client_config(
            &[], true,
        )?)))
    }

    pub fn with_client_config(client_config: Arc<rustls::ClientConfig>) -> Self {
        Self {
            client_config,
            trust_managers: vec![],
            hostname_verifier: None,
            engine_configurators: vec![],
            buffer_policy: BufferPolicy::default(),
            read_buffer_size: DEFAULT_READ_BUFFER_SIZE,
            proxy: None,
        }
    }

    pub fn from_config(config: &ConnectorConfig) -> io::Result<Self> {
        config.validate()?;
        let client_config = create_client_config(&config.alpn_protocols, config.enable_sni)?;
        let mut connector = Self::with_client_config(Arc::new(client_config));

        let trust = &config.trust;
        if trust.verify_webpki {
            connector.add_trust_manager(Arc::new(WebPkiTrustManager::new(
                create_root_cert_store(&trust.ca_certs, true)?,
            )));
        } else if !trust.ca_certs.is_empty() {
            connector.add_trust_manager(Arc::new(WebPkiTrustManager::new(
                create_root_cert_store(&trust.ca_certs, false)?,
            )));
        }
        if !trust.fingerprints.is_empty() {
            connector.add_trust_manager(Arc::new(FingerprintTrustManager::new(
                &trust.fingerprints,
            )?));
        }
        if connector.trust_managers.is_empty() {
            warn!("certificate verification is disabled, any server will be trusted");
            connector.add_trust_manager(Arc::new(InsecureTrustManager));
        }
        if !trust.verify_hostname {
            warn!("hostname verification is disabled");
            connector.set_hostname_verifier(Some(Arc::new(AllowAnyHostnameVerifier)));
        }

        if config.tls_buffer_limit.is_some() {
            connector.add_engine_configurator(Box::new(BufferLimitConfigurator(
                config.tls_buffer_limit,
            )));
        }
        connector.set_buffer_policy(config.buffer_policy());
        connector.read_buffer_size = config.buffer.read_buffer_size;
        connector.set_proxy(config.proxy.clone());
        Ok(connector)
    }

    /// With no trust managers, the bundled Mozilla roots are used.
    pub fn set_trust_managers(&mut self, trust_managers: Vec<Arc<dyn TrustManager>>) {
        self.trust_managers = trust_managers;
    }

    pub fn add_trust_manager(&mut self, trust_manager: Arc<dyn TrustManager>) {
        self.trust_managers.push(trust_manager);
    }

    /// `None` restores strict hostname verification.
    pub fn set_hostname_verifier(&mut self, hostname_verifier: Option<Arc<dyn HostnameVerifier>>) {
        self.hostname_verifier = hostname_verifier;
    }

    pub fn add_engine_configurator(&mut self, configurator: Box<dyn EngineConfigurator>) {
        self.engine_configurators.push(configurator);
    }

    pub fn clear_engine_configurators(&mut self) {
        self.engine_configurators.clear();
    }

    pub fn set_buffer_policy(&mut self, buffer_policy: BufferPolicy) {
        self.buffer_policy = buffer_policy;
    }

    pub fn set_proxy(&mut self, proxy: Option<ProxyConfig>) {
        self.proxy = proxy;
    }

    pub fn read_buffer_size(&self) -> usize {
        self.read_buffer_size
    }

    pub fn trust_evaluator(&self) -> TrustEvaluator {
        TrustEvaluator::new(self.trust_managers.clone(), self.hostname_verifier.clone())
    }

    /// A client engine for `host` with every configurator applied.
    pub fn create_engine(&self, host: &str) -> io::Result<RustlsEngine> {
        let mut engine = RustlsEngine::new_client(self.client_config.clone(), host)?;
        if let rustls::Connection::Client(ref mut connection) = *engine.connection_mut() {
            for configurator in self.engine_configurators.iter() {
                configurator.configure_engine(connection);
            }
        }
        Ok(engine)
    }

    /// Wraps an already connected transport. The handshake has not started;
    /// call `start_handshake` once callbacks are in place.
    pub fn wrap<T: Transport>(
        &self,
        transport: T,
        target: &NetLocation,
    ) -> io::Result<TlsSocket<RustlsEngine, T>> {
        let host = target.address().to_string();
        let engine = self.create_engine(&host)?;
        Ok(TlsSocket::new(transport, engine, Some(host), target.port())
            .with_trust_evaluator(self.trust_evaluator())
            .with_buffer_policy(self.buffer_policy))
    }

    /// Opens a TCP connection to `target`, through the configured proxy if
    /// any, and wraps it. The returned socket has started its handshake and
    /// already holds any bytes the proxy sent past its response.
    ///
    /// Drive it with `tcp_transport::drive`.
    pub async fn connect(
        &self,
        target: &NetLocation,
    ) -> Result<TlsSocket<RustlsEngine, TcpTransport>, SslError> {
        let (transport, leftover) = match self.proxy {
            Some(ref proxy) => {
                debug!("connecting to {} through proxy {}", target, proxy.address);
                let mut transport = TcpTransport::connect(&proxy.address)
                    .await
                    .map_err(SslError::Transport)?;
                let mut tunnel = ConnectTunnel::new(target.clone(), proxy.auth_credentials());
                let leftover = establish_tunnel(&mut transport, &mut tunnel).await?;
                (transport, leftover)
            }
            None => {
                debug!("connecting to {}", target);
                let transport = TcpTransport::connect(target)
                    .await
                    .map_err(SslError::Transport)?;
                (transport, Bytes::new())
            }
        };

        let mut socket = self.wrap(transport, target).map_err(SslError::Engine)?;
        socket.start_handshake();
        if !leftover.is_empty() {
            socket.on_data(leftover);
        }
        Ok(socket)
    }
}
