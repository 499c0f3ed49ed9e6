use bitflags::bitflags;
use std::net::IpAddr;
use strum_macros::{AsRefStr, Display, IntoStaticStr};
use thiserror::Error;

pub mod anvil;
pub mod client;
pub mod manager;
pub mod proxy_cli_args;
pub mod proxy_conn;
pub mod relay;
#[cfg(feature = "tls")]
pub mod tls;

/// Server lines longer than this abort the login phase.
pub const MAX_PROXY_INPUT: usize = 4096;
/// Client-bound writes are chunked to this once the relay starts.
pub const PROXY_MAX_OUTBUF: usize = 1024;
pub const LOGIN_PROXY_DIE_IDLE_SECS: u64 = 2;
/// Wait this long before retrying on reconnect.
pub const PROXY_CONNECT_RETRY_MS: u64 = 1000;
/// Don't even try to reconnect if proxying will timeout in less than this.
pub const PROXY_CONNECT_RETRY_MIN_MS: u64 = PROXY_CONNECT_RETRY_MS + 100;
pub const PROXY_DISCONNECT_INTERVAL_MS: u64 = 100;
/// How many times the same ip:port can be connected to before proxying
/// decides that it's a loop and fails. The first time isn't necessarily a
/// loop, just a reversed dynamic decision that it was actually the proper
/// destination.
pub const PROXY_REDIRECT_LOOP_MIN_COUNT: u32 = 2;

pub const KILL_PREFIX: &str = "Disconnected by proxy: ";
pub const KILLED_BY_ADMIN_REASON: &str = "Kicked by admin";
pub const KILLED_BY_SHUTDOWN_REASON: &str = "Process shutting down";
pub const LOGIN_PROXY_FAILURE_MSG: &str = "Account is temporarily unavailable.";
pub const AUTH_FAILED_MSG: &str = "Authentication failed.";

bitflags! {
    /// TLS policy towards the backend.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct SslFlags: u8 {
        /// Connect over TLS.
        const YES = 0b001;
        /// Upgrade in-protocol (STLS/STARTTLS) instead of implicitly.
        const STARTTLS = 0b010;
        /// Accept whatever certificate the backend presents.
        const ANY_CERT = 0b100;
    }
}

/// Why a proxy session failed, as surfaced to the failure handler and the
/// session-finished event. Determines retry eligibility and the reply the
/// client sees.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, AsRefStr, IntoStaticStr)]
#[strum(serialize_all = "snake_case")]
pub enum FailureType {
    Internal,
    InternalConfig,
    Connect,
    Remote,
    RemoteConfig,
    Protocol,
    AuthReplied,
    AuthNotReplied,
    AuthTempfail,
    AuthRedirect,
}

impl FailureType {
    /// Reconnecting only makes sense for failures the backend might not
    /// repeat. Config and already-answered-auth failures are final.
    pub fn may_reconnect(&self) -> bool {
        matches!(
            self,
            FailureType::Connect
                | FailureType::Remote
                | FailureType::Protocol
                | FailureType::AuthTempfail
        )
    }

    pub(crate) fn log_prefix(&self) -> &'static str {
        match self {
            FailureType::Internal => "Aborting due to internal error: ",
            FailureType::Remote | FailureType::RemoteConfig => "Aborting due to remote server: ",
            FailureType::Protocol => "Remote server sent invalid input: ",
            _ => "",
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{reason}")]
pub struct ProxyFailure {
    pub kind: FailureType,
    pub reason: String,
}

impl ProxyFailure {
    pub fn new(kind: FailureType, reason: impl Into<String>) -> Self {
        Self {
            kind,
            reason: reason.into(),
        }
    }
}

/// Which endpoint initiated a disconnection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "lowercase")]
pub enum DisconnectSide {
    Client,
    Server,
    Proxy,
}

/// Per-session proxying parameters, supplied by whoever authenticated the
/// client (normally the passdb lookup of the outer login daemon).
#[derive(Debug, Clone)]
pub struct ProxySettings {
    pub host: String,
    pub ip: IpAddr,
    pub port: u16,
    pub source_ip: Option<IpAddr>,
    pub connect_timeout_ms: u64,
    pub notify_refresh_secs: u64,
    pub host_immediate_failure_after_secs: u64,
    pub ssl_flags: SslFlags,
    pub rawlog_dir: Option<String>,
    /// ALPN identifiers offered on the backend TLS handshake.
    pub alpn: Vec<String>,
}

/// `ip:port`, with IPv6 addresses bracketed.
pub fn ipport(ip: &IpAddr, port: u16) -> String {
    match ip {
        IpAddr::V4(v4) => format!("{v4}:{port}"),
        IpAddr::V6(v6) => format!("[{v6}]:{port}"),
    }
}

/// Destination rendering for log prefixes: plain `ip:port` when the
/// configured host is the ip itself, otherwise `host[ip]:port`.
pub fn hostport(host: &str, ip: &IpAddr, port: u16) -> String {
    match host.parse::<IpAddr>() {
        Ok(host_ip) if host_ip == *ip => ipport(ip, port),
        _ => format!("{host}[{ip}]:{port}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reconnect_eligibility_follows_failure_type() {
        assert!(FailureType::Connect.may_reconnect());
        assert!(FailureType::Remote.may_reconnect());
        assert!(FailureType::Protocol.may_reconnect());
        assert!(FailureType::AuthTempfail.may_reconnect());

        assert!(!FailureType::Internal.may_reconnect());
        assert!(!FailureType::InternalConfig.may_reconnect());
        assert!(!FailureType::RemoteConfig.may_reconnect());
        assert!(!FailureType::AuthReplied.may_reconnect());
        assert!(!FailureType::AuthNotReplied.may_reconnect());
    }

    #[test]
    fn hostport_collapses_ip_hosts() {
        let ip: IpAddr = "10.1.2.3".parse().unwrap();
        assert_eq!(hostport("10.1.2.3", &ip, 110), "10.1.2.3:110");
        assert_eq!(
            hostport("mail.example.com", &ip, 110),
            "mail.example.com[10.1.2.3]:110"
        );

        let v6: IpAddr = "::1".parse().unwrap();
        assert_eq!(ipport(&v6, 995), "[::1]:995");
    }

    #[test]
    fn disconnect_side_renders_lowercase() {
        assert_eq!(DisconnectSide::Client.to_string(), "client");
        assert_eq!(DisconnectSide::Proxy.to_string(), "proxy");
    }
}
