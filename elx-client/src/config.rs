//! Client configuration.
//!
//! A [`ClientConfig`] names the server to talk to and how to reach it.
//! Each network has a preset default server; everything can be
//! overridden, and [`ClientConfig::connect_opts`] turns the result into
//! the [`ConnectOpts`] a connection is opened with.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use bitcoin::Network;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{CryptoProvider, verify_tls12_signature, verify_tls13_signature};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{DigitallySignedStruct, RootCertStore, SignatureScheme};
use thiserror::Error;

use crate::electrumx::{ConnectOpts, DEFAULT_CONNECT_TIMEOUT, DEFAULT_PING_INTERVAL};

/// Configuration errors.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid server address {0:?}: expected tcp://host:port or ssl://host:port")]
    InvalidServerAddr(String),

    #[error("Unknown network {0:?}")]
    UnknownNetwork(String),

    #[error("No default server for network {0}")]
    NoDefaultServer(Network),

    #[error("TLS configuration error: {0}")]
    Tls(#[from] rustls::Error),
}

/// How a server is reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    Tcp,
    Ssl,
}

/// Server address with its transport, written `tcp://host:port` or
/// `ssl://host:port`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerAddr {
    pub transport: Transport,

    /// host:port
    pub addr: String,
}

impl ServerAddr {
    pub fn tcp(addr: impl Into<String>) -> Self {
        Self {
            transport: Transport::Tcp,
            addr: addr.into(),
        }
    }

    pub fn ssl(addr: impl Into<String>) -> Self {
        Self {
            transport: Transport::Ssl,
            addr: addr.into(),
        }
    }
}

impl FromStr for ServerAddr {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ConfigError::InvalidServerAddr(s.to_string());

        let (transport, addr) = if let Some(addr) = s.strip_prefix("tcp://") {
            (Transport::Tcp, addr)
        } else if let Some(addr) = s.strip_prefix("ssl://") {
            (Transport::Ssl, addr)
        } else {
            return Err(invalid());
        };

        crate::electrumx::split_host_port(addr).map_err(|_| invalid())?;
        Ok(Self {
            transport,
            addr: addr.to_string(),
        })
    }
}

impl fmt::Display for ServerAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let scheme = match self.transport {
            Transport::Tcp => "tcp",
            Transport::Ssl => "ssl",
        };
        write!(f, "{}://{}", scheme, self.addr)
    }
}

/// Parse a network name. Accepts "mainnet" for Bitcoin's main network
/// as well as the names `bitcoin::Network` understands.
pub fn parse_network(s: &str) -> Result<Network, ConfigError> {
    match s {
        "mainnet" | "main" => Ok(Network::Bitcoin),
        "testnet3" => Ok(Network::Testnet),
        "simnet" => Ok(Network::Regtest),
        other => other
            .parse()
            .map_err(|_| ConfigError::UnknownNetwork(s.to_string())),
    }
}

/// Settings for connecting to one ElectrumX server.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub network: Network,
    pub server: ServerAddr,

    /// SOCKS5 proxy (host:port), e.g. Tor at 127.0.0.1:9050
    pub proxy: Option<String>,

    /// Skip certificate verification. ElectrumX servers commonly use
    /// self-signed certificates; regtest servers always do.
    pub accept_invalid_certs: bool,

    pub connect_timeout: Option<Duration>,
    pub ping_interval: Duration,
}

impl ClientConfig {
    /// Configuration for `server` on `network` with default timing.
    /// Certificates are only left unverified on regtest.
    pub fn new(network: Network, server: ServerAddr) -> Self {
        Self {
            network,
            server,
            proxy: None,
            accept_invalid_certs: network == Network::Regtest,
            connect_timeout: Some(DEFAULT_CONNECT_TIMEOUT),
            ping_interval: DEFAULT_PING_INTERVAL,
        }
    }

    /// Preset configuration for `network`.
    pub fn for_network(network: Network) -> Result<Self, ConfigError> {
        let server = match network {
            Network::Bitcoin => ServerAddr::ssl("elx.bitske.com:50002"),
            Network::Testnet => ServerAddr::tcp("testnet.aranguren.org:51001"),
            Network::Regtest => ServerAddr::ssl("127.0.0.1:53002"),
            other => return Err(ConfigError::NoDefaultServer(other)),
        };
        Ok(Self::new(network, server))
    }

    /// Build connection options, including the TLS client configuration
    /// for `ssl://` servers.
    pub fn connect_opts(&self) -> Result<ConnectOpts, ConfigError> {
        let tls = match self.server.transport {
            Transport::Tcp => None,
            Transport::Ssl => Some(Arc::new(tls_config(self.accept_invalid_certs)?)),
        };

        Ok(ConnectOpts {
            tls,
            proxy: self.proxy.clone(),
            connect_timeout: self.connect_timeout,
            ping_interval: self.ping_interval,
            ..ConnectOpts::default()
        })
    }
}

/// rustls client configuration using the ring provider.
///
/// Verifies against the Mozilla root set unless `accept_invalid_certs`,
/// in which case any certificate is accepted but handshake signatures are
/// still checked.
pub fn tls_config(accept_invalid_certs: bool) -> Result<rustls::ClientConfig, ConfigError> {
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let builder = rustls::ClientConfig::builder_with_provider(provider.clone())
        .with_safe_default_protocol_versions()?;

    let config = if accept_invalid_certs {
        builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(AcceptAnyCert { provider }))
            .with_no_client_auth()
    } else {
        let roots = RootCertStore {
            roots: webpki_roots::TLS_SERVER_ROOTS.to_vec(),
        };
        builder.with_root_certificates(roots).with_no_client_auth()
    };

    Ok(config)
}

// Accepts any server certificate
#[derive(Debug)]
struct AcceptAnyCert {
    provider: Arc<CryptoProvider>,
}

impl ServerCertVerifier for AcceptAnyCert {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_server_addr() {
        let addr: ServerAddr = "ssl://elx.example.com:50002".parse().unwrap();
        assert_eq!(addr, ServerAddr::ssl("elx.example.com:50002"));
        assert_eq!(addr.to_string(), "ssl://elx.example.com:50002");

        let addr: ServerAddr = "tcp://[::1]:50001".parse().unwrap();
        assert_eq!(addr.transport, Transport::Tcp);
        assert_eq!(addr.addr, "[::1]:50001");
    }

    #[test]
    fn test_parse_server_addr_rejects_bad_input() {
        for bad in [
            "elx.example.com:50002",
            "http://elx.example.com:50002",
            "ssl://elx.example.com",
            "ssl://elx.example.com:port",
            "tcp://:50001",
        ] {
            assert!(
                matches!(bad.parse::<ServerAddr>(), Err(ConfigError::InvalidServerAddr(_))),
                "{} should be rejected",
                bad
            );
        }
    }

    #[test]
    fn test_parse_network() {
        assert_eq!(parse_network("mainnet").unwrap(), Network::Bitcoin);
        assert_eq!(parse_network("bitcoin").unwrap(), Network::Bitcoin);
        assert_eq!(parse_network("testnet").unwrap(), Network::Testnet);
        assert_eq!(parse_network("regtest").unwrap(), Network::Regtest);
        assert!(matches!(
            parse_network("dogecoin"),
            Err(ConfigError::UnknownNetwork(_))
        ));
    }

    #[test]
    fn test_network_presets() {
        let mainnet = ClientConfig::for_network(Network::Bitcoin).unwrap();
        assert_eq!(mainnet.server, ServerAddr::ssl("elx.bitske.com:50002"));
        assert!(!mainnet.accept_invalid_certs);

        let testnet = ClientConfig::for_network(Network::Testnet).unwrap();
        assert_eq!(testnet.server.transport, Transport::Tcp);

        let regtest = ClientConfig::for_network(Network::Regtest).unwrap();
        assert_eq!(regtest.server, ServerAddr::ssl("127.0.0.1:53002"));
        assert!(regtest.accept_invalid_certs);

        assert!(matches!(
            ClientConfig::for_network(Network::Signet),
            Err(ConfigError::NoDefaultServer(Network::Signet))
        ));

        let custom = ClientConfig::new(Network::Signet, ServerAddr::ssl("signet.example.com:50002"));
        assert!(!custom.accept_invalid_certs);
    }

    #[test]
    fn test_connect_opts() {
        let mut config = ClientConfig::for_network(Network::Testnet).unwrap();
        config.proxy = Some("127.0.0.1:9050".to_string());
        config.ping_interval = Duration::from_secs(60);

        let opts = config.connect_opts().unwrap();
        assert!(opts.tls.is_none());
        assert_eq!(opts.proxy.as_deref(), Some("127.0.0.1:9050"));
        assert_eq!(opts.ping_interval, Duration::from_secs(60));

        let config = ClientConfig::for_network(Network::Regtest).unwrap();
        assert!(config.connect_opts().unwrap().tls.is_some());
    }

    #[test]
    fn test_tls_config_builds_both_modes() {
        assert!(tls_config(false).is_ok());
        assert!(tls_config(true).is_ok());
    }
}
