//! Negotiated session facts
//!
//! Captured once the handshake completes so scenarios can log what was
//! negotiated without reaching into the TLS library.

use openssl::nid::Nid;
use openssl::ssl::SslRef;
use openssl::x509::X509NameRef;

/// What the handshake settled on
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionInfo {
    /// Negotiated TLS version (e.g., "TLSv1.3")
    pub version: String,

    /// Negotiated cipher suite
    pub cipher: String,

    /// Common name of the peer certificate, if the peer sent one
    pub peer_subject: Option<String>,

    /// Whether the session was resumed from the cache
    pub session_reused: bool,
}

impl SessionInfo {
    /// Read session facts from an established connection
    pub fn from_ssl(ssl: &SslRef) -> Self {
        SessionInfo {
            version: ssl.version_str().to_string(),
            cipher: ssl
                .current_cipher()
                .map(|c| c.name().to_string())
                .unwrap_or_else(|| "<undef>".to_string()),
            peer_subject: ssl
                .peer_certificate()
                .and_then(|cert| common_name(cert.subject_name())),
            session_reused: ssl.session_reused(),
        }
    }
}

fn common_name(name: &X509NameRef) -> Option<String> {
    name.entries_by_nid(Nid::COMMONNAME)
        .next()
        .and_then(|entry| entry.data().to_string().ok())
}
