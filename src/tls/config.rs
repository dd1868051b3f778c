//! TLS configuration
//!
//! This module provides TLS configuration builders for both client and server.
//! Certificate validation is off by default on the client: the harness proves
//! connection establishment and data exchange, not trust policy.

use super::locking::{self, LockMode, SLOT_SSL_CTX, SLOT_X509, SLOT_X509_STORE};
use super::session::TlsSession;
use super::{Result, TlsError};
use crate::net::Endpoint;
use openssl::pkey::PKey;
use openssl::ssl::{SslContext, SslContextBuilder, SslMethod, SslVerifyMode, SslVersion};
use openssl::x509::X509;
use std::fs;
use std::path::Path;
use std::str::FromStr;

/// TLS version
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum TlsVersion {
    /// TLS 1.2
    Tls12,
    /// TLS 1.3
    Tls13,
}

impl TlsVersion {
    /// Get OpenSSL protocol version constant
    pub fn to_openssl_version(&self) -> SslVersion {
        match self {
            TlsVersion::Tls12 => SslVersion::TLS1_2,
            TlsVersion::Tls13 => SslVersion::TLS1_3,
        }
    }

    /// Get version as string
    pub fn as_str(&self) -> &'static str {
        match self {
            TlsVersion::Tls12 => "TLSv1.2",
            TlsVersion::Tls13 => "TLSv1.3",
        }
    }
}

impl FromStr for TlsVersion {
    type Err = TlsError;

    /// Parse TLS version from string (case-insensitive)
    fn from_str(s: &str) -> Result<Self> {
        match s.to_uppercase().as_str() {
            "TLSV1.2" | "TLS1.2" => Ok(TlsVersion::Tls12),
            "TLSV1.3" | "TLS1.3" => Ok(TlsVersion::Tls13),
            _ => Err(TlsError::InvalidConfig(format!("unsupported TLS version: {}", s))),
        }
    }
}

/// Which side of the handshake a configuration drives
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Client,
    Server,
}

/// TLS configuration (immutable after building)
#[derive(Clone)]
pub struct TlsConfig {
    pub(crate) ctx: SslContext,
    pub(crate) role: Role,
    pub(crate) servername: Option<String>,
    pub(crate) verify_peer: bool,
}

impl TlsConfig {
    /// Create a new client configuration builder
    pub fn client() -> Result<ClientConfigBuilder> {
        ClientConfigBuilder::new()
    }

    /// Create a new server configuration builder
    pub fn server() -> Result<ServerConfigBuilder> {
        ServerConfigBuilder::new()
    }

    /// Role of sessions created from this configuration
    pub fn role(&self) -> Role {
        self.role
    }

    /// Whether the client verifies the server certificate
    pub fn verifies_peer(&self) -> bool {
        self.verify_peer
    }

    /// Wrap an endpoint in a pending session for this configuration's role
    pub fn session(&self, endpoint: Endpoint) -> Result<TlsSession> {
        match self.role {
            Role::Client => TlsSession::client(self, endpoint),
            Role::Server => TlsSession::server(self, endpoint),
        }
    }

    /// Wrap a blocking endpoint and complete the client handshake
    pub fn connect(&self, endpoint: Endpoint) -> Result<TlsSession> {
        let mut session = TlsSession::client(self, endpoint)?;
        session.handshake_as_client()?;
        Ok(session)
    }

    /// Wrap a blocking endpoint and complete the server handshake
    pub fn accept(&self, endpoint: Endpoint) -> Result<TlsSession> {
        let mut session = TlsSession::server(self, endpoint)?;
        session.handshake_as_server()?;
        Ok(session)
    }
}

fn new_context(method: SslMethod) -> Result<SslContextBuilder> {
    let table = locking::installed()?;
    let _slot = locking::acquire(table, SLOT_SSL_CTX, LockMode::Write);
    Ok(SslContextBuilder::new(method)?)
}

fn set_version_range(
    ctx_builder: &mut SslContextBuilder,
    min: TlsVersion,
    max: TlsVersion,
) -> Result<()> {
    if min > max {
        return Err(TlsError::InvalidConfig(format!(
            "minimum version {} above maximum {}",
            min.as_str(),
            max.as_str()
        )));
    }
    ctx_builder.set_min_proto_version(Some(min.to_openssl_version()))?;
    ctx_builder.set_max_proto_version(Some(max.to_openssl_version()))?;
    Ok(())
}

/// Load a certificate and its private key from one PEM bundle
fn load_identity(ctx_builder: &mut SslContextBuilder, pem: &[u8]) -> Result<()> {
    let table = locking::installed()?;
    let _slot = locking::acquire(table, SLOT_X509, LockMode::Write);

    let cert = X509::from_pem(pem)
        .map_err(|e| TlsError::Certificate(format!("Failed to load certificate: {}", e)))?;
    ctx_builder.set_certificate(&cert)?;

    let key = PKey::private_key_from_pem(pem)
        .map_err(|e| TlsError::Certificate(format!("Failed to load private key: {}", e)))?;
    ctx_builder.set_private_key(&key)?;
    ctx_builder.check_private_key()?;
    Ok(())
}

fn finish(ctx_builder: SslContextBuilder) -> Result<SslContext> {
    let table = locking::installed()?;
    let _slot = locking::acquire(table, SLOT_SSL_CTX, LockMode::Write);
    Ok(ctx_builder.build())
}

/// Client configuration builder
pub struct ClientConfigBuilder {
    ctx_builder: SslContextBuilder,
    servername: Option<String>,
    verify_peer: bool,
}

impl ClientConfigBuilder {
    fn new() -> Result<Self> {
        let mut ctx_builder = new_context(SslMethod::tls_client())?;

        // Default: don't verify peer (for testing)
        ctx_builder.set_verify(SslVerifyMode::NONE);

        Ok(ClientConfigBuilder {
            ctx_builder,
            servername: None,
            verify_peer: false,
        })
    }

    /// Set TLS version (both min and max)
    pub fn version(mut self, version: TlsVersion) -> Result<Self> {
        set_version_range(&mut self.ctx_builder, version, version)?;
        Ok(self)
    }

    /// Set TLS version range
    pub fn version_range(mut self, min: TlsVersion, max: TlsVersion) -> Result<Self> {
        set_version_range(&mut self.ctx_builder, min, max)?;
        Ok(self)
    }

    /// Set SNI servername
    pub fn servername(mut self, name: impl Into<String>) -> Self {
        self.servername = Some(name.into());
        self
    }

    /// Enable/disable peer certificate verification
    ///
    /// With verification on, the system trust store is used, so a
    /// self-signed server certificate fails the handshake.
    pub fn verify_peer(mut self, verify: bool) -> Result<Self> {
        self.verify_peer = verify;
        if verify {
            let table = locking::installed()?;
            let _slot = locking::acquire(table, SLOT_X509_STORE, LockMode::Write);
            self.ctx_builder.set_default_verify_paths()?;
            self.ctx_builder.set_verify(SslVerifyMode::PEER);
        } else {
            self.ctx_builder.set_verify(SslVerifyMode::NONE);
        }
        Ok(self)
    }

    /// Build the TLS configuration
    pub fn build(self) -> Result<TlsConfig> {
        Ok(TlsConfig {
            ctx: finish(self.ctx_builder)?,
            role: Role::Client,
            servername: self.servername,
            verify_peer: self.verify_peer,
        })
    }
}

/// Server configuration builder
pub struct ServerConfigBuilder {
    ctx_builder: SslContextBuilder,
    has_cert: bool,
}

impl ServerConfigBuilder {
    fn new() -> Result<Self> {
        Ok(ServerConfigBuilder {
            ctx_builder: new_context(SslMethod::tls_server())?,
            has_cert: false,
        })
    }

    /// Set TLS version (both min and max)
    pub fn version(mut self, version: TlsVersion) -> Result<Self> {
        set_version_range(&mut self.ctx_builder, version, version)?;
        Ok(self)
    }

    /// Set TLS version range
    pub fn version_range(mut self, min: TlsVersion, max: TlsVersion) -> Result<Self> {
        set_version_range(&mut self.ctx_builder, min, max)?;
        Ok(self)
    }

    /// Load server certificate and key from a PEM file
    pub fn cert_file<P: AsRef<Path>>(self, path: P) -> Result<Self> {
        let pem = fs::read(path.as_ref())?;
        self.cert_pem(&pem)
    }

    /// Load server certificate and key from an in-memory PEM bundle
    pub fn cert_pem(mut self, pem: &[u8]) -> Result<Self> {
        load_identity(&mut self.ctx_builder, pem)?;
        self.has_cert = true;
        Ok(self)
    }

    /// Build the TLS configuration
    ///
    /// Falls back to the built-in certificate if none was loaded.
    pub fn build(mut self) -> Result<TlsConfig> {
        if !self.has_cert {
            load_identity(&mut self.ctx_builder, super::builtin_cert::BUILTIN_CERT.as_bytes())?;
        }

        Ok(TlsConfig {
            ctx: finish(self.ctx_builder)?,
            role: Role::Server,
            servername: None,
            verify_peer: false,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tls::locking::install_default_callbacks;
    use std::io::Write;

    #[test]
    fn test_tls_version_parsing() {
        assert_eq!("TLSv1.2".parse::<TlsVersion>().unwrap(), TlsVersion::Tls12);
        assert_eq!("tlsv1.3".parse::<TlsVersion>().unwrap(), TlsVersion::Tls13);
        assert!("TLS1.0".parse::<TlsVersion>().is_err());
        assert!("invalid".parse::<TlsVersion>().is_err());
    }

    #[test]
    fn test_client_config_builder() {
        install_default_callbacks();
        let config = TlsConfig::client()
            .unwrap()
            .version(TlsVersion::Tls13)
            .unwrap()
            .servername("example.com")
            .verify_peer(false)
            .unwrap()
            .build()
            .unwrap();

        assert_eq!(config.role(), Role::Client);
        assert_eq!(config.servername, Some("example.com".to_string()));
        assert!(!config.verifies_peer());
    }

    #[test]
    fn test_server_config_builder() {
        install_default_callbacks();
        let config = TlsConfig::server()
            .unwrap()
            .version_range(TlsVersion::Tls12, TlsVersion::Tls13)
            .unwrap()
            .build()
            .unwrap();

        assert_eq!(config.role(), Role::Server);
    }

    #[test]
    fn test_inverted_version_range() {
        install_default_callbacks();
        let result = TlsConfig::client()
            .unwrap()
            .version_range(TlsVersion::Tls13, TlsVersion::Tls12);
        assert!(matches!(result, Err(TlsError::InvalidConfig(_))));
    }

    #[test]
    fn test_server_cert_file() {
        install_default_callbacks();
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(crate::tls::builtin_cert::BUILTIN_CERT.as_bytes()).unwrap();

        let config = TlsConfig::server()
            .unwrap()
            .cert_file(file.path())
            .unwrap()
            .build()
            .unwrap();
        assert_eq!(config.role(), Role::Server);
    }

    #[test]
    fn test_server_cert_garbage() {
        install_default_callbacks();
        let result = TlsConfig::server().unwrap().cert_pem(b"not a certificate");
        assert!(matches!(result, Err(TlsError::Certificate(_))));
    }

    #[test]
    fn test_missing_cert_file() {
        install_default_callbacks();
        let result = TlsConfig::server()
            .unwrap()
            .cert_file("/nonexistent/vtls/server.pem");
        assert!(matches!(result, Err(TlsError::Io(_))));
    }
}
