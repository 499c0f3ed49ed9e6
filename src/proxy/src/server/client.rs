use crate::sasl::Mechanism;
use std::net::IpAddr;
use std::sync::atomic::{AtomicU32, Ordering};

/// Knobs the outer login daemon resolves per client from its configuration.
#[derive(Debug, Clone)]
pub struct ClientSettings {
    pub login_proxy_max_reconnects: u32,
    /// Seconds over which mass client disconnects are smeared. 0 disables
    /// delaying.
    pub login_proxy_max_disconnect_delay: u32,
    pub auth_verbose: bool,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            login_proxy_max_reconnects: 3,
            login_proxy_max_disconnect_delay: 0,
            auth_verbose: false,
        }
    }
}

/// Everything the proxy needs to know about the mail client it is acting
/// for. Produced by the outer login daemon after the client authenticated
/// and its passdb lookup said "proxy".
pub struct ClientSession {
    /// The user as they logged in; the key for admin kicks.
    pub virtual_user: String,
    /// Login name sent to the backend.
    pub proxy_user: String,
    /// Master user to authenticate as, with `proxy_user` as authorization id.
    pub proxy_master_user: Option<String>,
    pub proxy_password: Option<String>,
    pub proxy_mech: Option<Mechanism>,
    /// Hop budget forwarded over XCLIENT; each redirect consumes one.
    proxy_ttl: AtomicU32,
    /// Client's address as seen by our accept().
    pub ip: IpAddr,
    pub remote_port: u16,
    /// Local side of the accepted socket; a redirect pointing here is a loop.
    pub local_ip: Option<IpAddr>,
    pub local_port: u16,
    /// TLS SNI name the client connected with.
    pub local_name: Option<String>,
    pub end_client_tls_secured: bool,
    /// Set when the client connected from an untrusted network; suppresses
    /// XCLIENT.
    pub proxy_not_trusted: bool,
    /// (field name, value) pairs reported to connection accounting.
    pub alt_usernames: Vec<(String, String)>,
    /// Raw `key=value` extra fields from the passdb; `forward_*` entries are
    /// propagated over XCLIENT.
    pub auth_passdb_args: Vec<String>,
    pub session_id: String,
    pub set: ClientSettings,
}

impl ClientSession {
    pub fn new(virtual_user: impl Into<String>, proxy_user: impl Into<String>) -> Self {
        Self {
            virtual_user: virtual_user.into(),
            proxy_user: proxy_user.into(),
            proxy_master_user: None,
            proxy_password: None,
            proxy_mech: None,
            proxy_ttl: AtomicU32::new(2),
            ip: IpAddr::from([127, 0, 0, 1]),
            remote_port: 0,
            local_ip: None,
            local_port: 0,
            local_name: None,
            end_client_tls_secured: false,
            proxy_not_trusted: false,
            alt_usernames: Vec::new(),
            auth_passdb_args: Vec::new(),
            session_id: nanoid::nanoid!(16),
            set: ClientSettings::default(),
        }
    }

    pub fn proxy_ttl(&self) -> u32 {
        self.proxy_ttl.load(Ordering::Acquire)
    }

    pub fn set_proxy_ttl(&self, ttl: u32) {
        self.proxy_ttl.store(ttl, Ordering::Release);
    }

    pub fn consume_proxy_ttl(&self) -> u32 {
        self.proxy_ttl.fetch_sub(1, Ordering::AcqRel) - 1
    }

    /// `forward_*` passdb fields with the prefix stripped, in passdb order.
    pub fn forward_fields(&self) -> Vec<&str> {
        self.auth_passdb_args
            .iter()
            .filter_map(|arg| match (arg.get(..8), arg.get(8..)) {
                (Some(prefix), Some(rest)) if prefix.eq_ignore_ascii_case("forward_") => {
                    Some(rest)
                }
                _ => None,
            })
            .collect()
    }
}

/// DNS name check applied to `local_name` before it is forwarded to a
/// backend inside XCLIENT, where it must not need escaping.
pub fn is_valid_dns_name(name: &str) -> bool {
    if name.is_empty() || name.len() > 255 {
        return false;
    }
    name.split('.').all(|label| {
        !label.is_empty()
            && label.len() <= 63
            && !label.starts_with('-')
            && !label.ends_with('-')
            && label
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn forward_fields_strip_prefix_case_insensitively() {
        let mut client = ClientSession::new("alice", "alice");
        client.auth_passdb_args = vec![
            "nologin=y".to_string(),
            "forward_fields=a".to_string(),
            "Forward_quota=1G".to_string(),
            "forwardx=skip".to_string(),
        ];
        assert_eq!(client.forward_fields(), vec!["fields=a", "quota=1G"]);
    }

    #[test]
    fn ttl_consumption_is_visible_through_shared_refs() {
        let client = ClientSession::new("alice", "alice");
        client.set_proxy_ttl(3);
        assert_eq!(client.consume_proxy_ttl(), 2);
        assert_eq!(client.proxy_ttl(), 2);
    }

    #[test]
    fn dns_name_validation() {
        assert!(is_valid_dns_name("mail.example.com"));
        assert!(is_valid_dns_name("mx-1.example.com"));
        assert!(!is_valid_dns_name(""));
        assert!(!is_valid_dns_name("bad name.example.com"));
        assert!(!is_valid_dns_name("-bad.example.com"));
        assert!(!is_valid_dns_name("double..dot"));
    }
}
