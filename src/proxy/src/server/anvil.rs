use async_trait::async_trait;
use rand::RngCore;
use std::fmt;
use std::net::IpAddr;
use tracing::debug;

/// Identifies one proxied connection towards the connection-accounting
/// service for its whole lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AnvilGuid([u8; 16]);

impl AnvilGuid {
    pub fn generate() -> Self {
        let mut bytes = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self(bytes)
    }
}

impl fmt::Display for AnvilGuid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

#[derive(Debug, Clone)]
pub struct AnvilSession {
    pub username: String,
    pub service_name: String,
    pub ip: IpAddr,
    pub dest_ip: Option<IpAddr>,
    pub alt_usernames: Vec<(String, String)>,
}

/// Connection-accounting collaborator. The real implementation talks to the
/// anvil process over its UNIX socket; the proxy only needs the
/// connect/disconnect pairing and the returned GUID.
#[async_trait]
pub trait AnvilReporter: Send + Sync {
    /// Register the session; `None` means accounting is unavailable and no
    /// disconnect should be sent later.
    async fn connect(&self, session: &AnvilSession) -> Option<AnvilGuid>;

    async fn disconnect(&self, session: &AnvilSession, guid: AnvilGuid);
}

/// Accounting sink used when no anvil socket is configured: generates GUIDs
/// so kicks can still be filtered by connection, logs the rest.
#[derive(Debug, Default)]
pub struct LocalAnvil;

#[async_trait]
impl AnvilReporter for LocalAnvil {
    async fn connect(&self, session: &AnvilSession) -> Option<AnvilGuid> {
        let guid = AnvilGuid::generate();
        debug!(
            user = %session.username,
            service = %session.service_name,
            conn_guid = %guid,
            "anvil connect"
        );
        Some(guid)
    }

    async fn disconnect(&self, session: &AnvilSession, guid: AnvilGuid) {
        debug!(user = %session.username, conn_guid = %guid, "anvil disconnect");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn guid_renders_as_32_hex_chars() {
        let guid = AnvilGuid::generate();
        let s = guid.to_string();
        assert_eq!(s.len(), 32);
        assert!(s.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[tokio::test]
    async fn local_anvil_hands_out_distinct_guids() {
        let anvil = LocalAnvil;
        let session = AnvilSession {
            username: "alice".to_string(),
            service_name: "pop3".to_string(),
            ip: IpAddr::from([127, 0, 0, 1]),
            dest_ip: None,
            alt_usernames: Vec::new(),
        };
        let a = anvil.connect(&session).await.unwrap();
        let b = anvil.connect(&session).await.unwrap();
        assert_ne!(a, b);
        anvil.disconnect(&session, a).await;
    }
}
