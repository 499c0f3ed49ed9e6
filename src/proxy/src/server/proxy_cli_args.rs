use crate::sasl::Mechanism;
use crate::server::client::ClientSettings;
use crate::server::{ProxySettings, SslFlags};

use anyhow::{anyhow, Context};
use clap::Parser;
use std::net::{IpAddr, ToSocketAddrs};

#[derive(Parser, Default, Debug, Clone)]
#[clap(
    name = "mail-proxy",
    version = "0.1.0",
    about = "login proxy for mail backends."
)]
pub struct ProxyServerArgs {
    #[clap(long, value_name = "WORKS", default_value_t = 4)]
    pub works: usize,
    #[clap(long, value_name = "PORT", default_value_t = 1110)]
    pub port: u16,
    #[clap(long, value_name = "LOG_LEVEL")]
    pub log_level: Option<String>,

    /// Backend to proxy logins to, as host:port.
    #[clap(long, value_name = "HOST:PORT")]
    pub backend: String,
    /// Backend IP, when the backend host shouldn't be resolved.
    #[clap(long, value_name = "IP")]
    pub backend_ip: Option<IpAddr>,
    #[clap(long, value_name = "SOURCE_IP")]
    pub source_ip: Option<IpAddr>,
    #[clap(long, value_name = "MSECS", default_value_t = 30_000)]
    pub connect_timeout_ms: u64,
    #[clap(long, value_name = "SECS", default_value_t = 0)]
    pub notify_refresh_secs: u64,
    #[clap(long, value_name = "SECS", default_value_t = 0)]
    pub host_immediate_failure_after_secs: u64,
    #[clap(long, value_name = "TLS", default_value_t = false)]
    pub tls: bool,
    #[clap(long, default_value_t = false)]
    pub starttls: bool,
    #[clap(long, default_value_t = false)]
    pub allow_invalid_cert: bool,
    #[clap(long, value_name = "RAWLOG_DIR")]
    pub rawlog_dir: Option<String>,

    #[clap(long, value_name = "USER")]
    pub proxy_user: String,
    #[clap(long, value_name = "MASTER_USER")]
    pub proxy_master_user: Option<String>,
    #[clap(long, value_name = "PASSWORD")]
    pub proxy_password: Option<String>,
    #[clap(long, value_name = "MECH")]
    pub proxy_mech: Option<String>,
    #[clap(long, value_name = "TTL", default_value_t = 2)]
    pub proxy_ttl: u32,

    #[clap(long, value_name = "COUNT", default_value_t = 3)]
    pub login_proxy_max_reconnects: u32,
    #[clap(long, value_name = "SECS", default_value_t = 0)]
    pub login_proxy_max_disconnect_delay: u32,
    #[clap(long, default_value_t = false)]
    pub auth_verbose: bool,
}

impl ProxyServerArgs {
    pub fn ssl_flags(&self) -> SslFlags {
        let mut flags = SslFlags::empty();
        if self.tls || self.starttls {
            flags |= SslFlags::YES;
        }
        if self.starttls {
            flags |= SslFlags::STARTTLS;
        }
        if self.allow_invalid_cert {
            flags |= SslFlags::ANY_CERT;
        }
        flags
    }

    pub fn mechanism(&self) -> anyhow::Result<Option<Mechanism>> {
        self.proxy_mech
            .as_deref()
            .map(|name| {
                name.parse::<Mechanism>()
                    .map_err(|_| anyhow!("unknown SASL mechanism {name:?}"))
            })
            .transpose()
    }

    pub fn client_settings(&self) -> ClientSettings {
        ClientSettings {
            login_proxy_max_reconnects: self.login_proxy_max_reconnects,
            login_proxy_max_disconnect_delay: self.login_proxy_max_disconnect_delay,
            auth_verbose: self.auth_verbose,
        }
    }

    /// Resolve `--backend` into the per-session proxy settings. Resolution
    /// happens once at startup; per-session DNS is the login daemon's job.
    pub fn proxy_settings(&self) -> anyhow::Result<ProxySettings> {
        let (host, port_str) = self
            .backend
            .rsplit_once(':')
            .ok_or_else(|| anyhow!("--backend must be host:port, got {:?}", self.backend))?;
        let host = host.trim_matches(['[', ']']).to_string();
        let port: u16 = port_str
            .parse()
            .with_context(|| format!("bad backend port {port_str:?}"))?;

        let ip = match self.backend_ip {
            Some(ip) => ip,
            None => match host.parse::<IpAddr>() {
                Ok(ip) => ip,
                Err(_) => (host.as_str(), port)
                    .to_socket_addrs()
                    .with_context(|| format!("resolving backend host {host:?}"))?
                    .next()
                    .map(|addr| addr.ip())
                    .ok_or_else(|| anyhow!("backend host {host:?} resolved to nothing"))?,
            },
        };

        Ok(ProxySettings {
            host,
            ip,
            port,
            source_ip: self.source_ip,
            connect_timeout_ms: self.connect_timeout_ms,
            notify_refresh_secs: self.notify_refresh_secs,
            host_immediate_failure_after_secs: self.host_immediate_failure_after_secs,
            ssl_flags: self.ssl_flags(),
            rawlog_dir: self.rawlog_dir.clone(),
            alpn: vec!["pop3".to_string()],
        })
    }
}
