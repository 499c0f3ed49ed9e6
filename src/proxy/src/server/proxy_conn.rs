use crate::backend::{now_ms, DestRec};
use crate::protocol::line::LineReader;
use crate::protocol::referral::{RedirectHost, RedirectTarget};
use crate::protocol::{DriverAction, ProtocolDriver};
use crate::server::anvil::AnvilSession;
use crate::server::client::{is_valid_dns_name, ClientSession};
use crate::server::manager::{KillOrder, ProxyHandle, ProxyManager};
use crate::server::relay::{RelayOutcome, StreamRelay};
use crate::server::{
    hostport, ipport, DisconnectSide, FailureType, ProxyFailure, ProxySettings, SslFlags,
    KILL_PREFIX, MAX_PROXY_INPUT, PROXY_CONNECT_RETRY_MIN_MS, PROXY_CONNECT_RETRY_MS,
    PROXY_DISCONNECT_INTERVAL_MS, PROXY_REDIRECT_LOOP_MIN_COUNT,
};
use rand::Rng;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpSocket, TcpStream};
use tokio::sync::watch;
use tokio::time::{sleep, sleep_until, timeout_at, MissedTickBehavior};
use tracing::{debug, error, info, warn};

pub(crate) trait ServerIo: AsyncRead + AsyncWrite + Send + Unpin {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin> ServerIo for T {}
pub(crate) type BoxedServerIo = Box<dyn ServerIo>;

type KillRx = watch::Receiver<Option<KillOrder>>;

#[derive(Debug, Clone, PartialEq, Eq)]
struct RedirectEntry {
    ip: IpAddr,
    port: u16,
    count: u32,
}

/// How one connect attempt ended, when it didn't end in a detach.
enum AttemptEnd {
    /// Transient failure, retry budget left: reconnect after the usual pause.
    Retry,
    /// The backend referred us elsewhere; reconnect immediately.
    Redirected,
    GiveUp(ProxyFailure),
    Killed(KillOrder),
}

enum SessionEnd {
    Failed(ProxyFailure),
    Relayed(RelayOutcome),
    Killed(KillOrder),
}

enum ReadLine {
    Line(String),
    Eof,
    Timeout,
    Failed(io::Error),
}

async fn read_auth_line<R: AsyncRead + Unpin>(
    reader: &mut LineReader<R>,
    deadline: Option<tokio::time::Instant>,
) -> ReadLine {
    let read = match deadline {
        Some(deadline) => match timeout_at(deadline, reader.next_line()).await {
            Ok(read) => read,
            Err(_) => return ReadLine::Timeout,
        },
        None => reader.next_line().await,
    };
    match read {
        Ok(Some(line)) => ReadLine::Line(line),
        Ok(None) => ReadLine::Eof,
        Err(err) => ReadLine::Failed(err),
    }
}

async fn write_stream<S: AsyncWrite + Unpin>(io: &mut S, bytes: &[u8]) -> io::Result<()> {
    io.write_all(bytes).await?;
    io.flush().await
}

async fn tcp_connect(ip: IpAddr, port: u16, source_ip: Option<IpAddr>) -> io::Result<TcpStream> {
    let socket = match ip {
        IpAddr::V4(_) => TcpSocket::new_v4()?,
        IpAddr::V6(_) => TcpSocket::new_v6()?,
    };
    if let Some(source_ip) = source_ip {
        socket.bind(SocketAddr::new(source_ip, 0))?;
    }
    socket.connect(SocketAddr::new(ip, port)).await
}

/// One proxied login session: owns the backend connection through the whole
/// `connect → (TLS) → authenticate → detach → relay → disconnect` life
/// cycle, with reconnects and referral redirects folded into the connect
/// loop. The client's byte streams are loaned in by the caller for the
/// duration of [`ProxyConnection::run`].
pub struct ProxyConnection {
    manager: Arc<ProxyManager>,
    client: Arc<ClientSession>,
    set: ProxySettings,
    driver: Box<dyn ProtocolDriver>,
    handle: Arc<ProxyHandle>,
    kill_rx: Option<KillRx>,
    rec: Arc<DestRec>,
    host: String,
    ip: IpAddr,
    port: u16,
    redirect_path: Vec<RedirectEntry>,
    reconnect_count: u32,
    created: Instant,
    created_ms: i64,
    connected: bool,
    /// This attempt's slot in the destination's waiting counter has been
    /// released; guards against double decrements.
    waiting_counted: bool,
    disable_reconnect: bool,
    detached: bool,
    local_addr: Option<SocketAddr>,
}

impl ProxyConnection {
    pub fn new(
        manager: Arc<ProxyManager>,
        client: Arc<ClientSession>,
        set: ProxySettings,
        driver: Box<dyn ProtocolDriver>,
    ) -> Self {
        let (handle, kill_rx) = manager.new_handle(&client.virtual_user);
        let rec = manager.dest_registry().get_or_create(set.ip, set.port);
        Self {
            manager,
            client,
            host: set.host.clone(),
            ip: set.ip,
            port: set.port,
            set,
            driver,
            handle,
            kill_rx: Some(kill_rx),
            rec,
            redirect_path: Vec::new(),
            reconnect_count: 0,
            created: Instant::now(),
            created_ms: now_ms(),
            connected: false,
            waiting_counted: true,
            disable_reconnect: false,
            detached: false,
            local_addr: None,
        }
    }

    pub fn handle(&self) -> Arc<ProxyHandle> {
        Arc::clone(&self.handle)
    }

    fn hostport(&self) -> String {
        hostport(&self.host, &self.ip, self.port)
    }

    /// Drive the session to completion. `client_r`/`client_w` are the mail
    /// client's streams, loaned from the outer daemon until the session
    /// ends.
    pub async fn run<R, W>(mut self, mut client_r: R, mut client_w: W)
    where
        R: AsyncRead + Send + Unpin,
        W: AsyncWrite + Send + Unpin,
    {
        let Some(mut kill_rx) = self.kill_rx.take() else {
            return;
        };
        self.manager.register_pending(&self.handle);
        debug!(
            target: "proxy_session_started",
            source_ip = ?self.set.source_ip,
            dest_ip = %self.ip,
            dest_port = self.port,
            dest_host = %self.host,
            master_user = ?self.client.proxy_master_user,
            user = %self.client.virtual_user,
            "Created proxy session to remote host"
        );

        let end = loop {
            match self.connect_and_login(&mut client_w, &mut kill_rx).await {
                Ok((server, leftover)) => {
                    break self
                        .relay_phase(server, leftover, &mut client_r, &mut client_w, &mut kill_rx)
                        .await;
                }
                Err(AttemptEnd::Retry) | Err(AttemptEnd::Redirected) => continue,
                Err(AttemptEnd::GiveUp(failure)) => break SessionEnd::Failed(failure),
                Err(AttemptEnd::Killed(order)) => break SessionEnd::Killed(order),
            }
        };
        self.finish(end, &mut client_r, &mut client_w, &mut kill_rx)
            .await;
    }

    /// One full connect attempt: pre-checks, TCP connect, optional implicit
    /// TLS, then the driver-fed login exchange. Success hands back the
    /// server stream plus any bytes read past the final reply line.
    async fn connect_and_login<W>(
        &mut self,
        client_w: &mut W,
        kill_rx: &mut KillRx,
    ) -> Result<(BoxedServerIo, Vec<u8>), AttemptEnd>
    where
        W: AsyncWrite + Send + Unpin,
    {
        self.rec.connect_begin();
        self.waiting_counted = false;
        self.local_addr = None;
        debug!(dest = %self.hostport(), "Connecting to remote host");

        if let Some(local_name) = self.client.local_name.as_deref() {
            if !is_valid_dns_name(local_name) {
                return Err(self
                    .fail(FailureType::Internal, "[BUG] Invalid local_name!".into(), kill_rx)
                    .await);
            }
        }
        if self.client.proxy_ttl() <= 1 {
            return Err(self
                .fail(
                    FailureType::RemoteConfig,
                    "TTL reached zero - proxies appear to be looping?".into(),
                    kill_rx,
                )
                .await);
        }

        let now = now_ms();
        self.rec.seed_last_success(now);
        let down_secs = self.rec.down_seconds(now);
        if self.set.host_immediate_failure_after_secs != 0
            && down_secs > self.set.host_immediate_failure_after_secs as i64
            && self.rec.num_waiting_connections() > 1
        {
            // the server is down, fail without burning a socket on it
            self.disable_reconnect = true;
            let last_success = chrono::DateTime::from_timestamp(self.rec.last_success_ms() / 1000, 0)
                .map(|ts| ts.to_rfc3339())
                .unwrap_or_else(|| (self.rec.last_success_ms() / 1000).to_string());
            return Err(self
                .fail(
                    FailureType::Connect,
                    format!("Host has been down for {down_secs} secs (last success was {last_success})"),
                    kill_rx,
                )
                .await);
        }

        let deadline = (self.set.connect_timeout_ms != 0)
            .then(|| tokio::time::Instant::now() + Duration::from_millis(self.set.connect_timeout_ms));

        let (ip, port, source_ip) = (self.ip, self.port, self.set.source_ip);
        let connected = tokio::select! {
            biased;
            _ = kill_rx.changed() => return Err(AttemptEnd::Killed(self.take_order(kill_rx))),
            connected = async {
                match deadline {
                    Some(deadline) => match timeout_at(deadline, tcp_connect(ip, port, source_ip)).await {
                        Ok(connected) => connected,
                        Err(_) => Err(io::Error::new(io::ErrorKind::TimedOut, "Connection timed out")),
                    },
                    None => tcp_connect(ip, port, source_ip).await,
                }
            } => connected,
        };
        let stream = match connected {
            Ok(stream) => stream,
            Err(err) => {
                self.fail_connect_bookkeeping();
                let reason = format!(
                    "connect({}, {}) failed: {err}{}",
                    self.ip,
                    self.port,
                    self.connect_error_context()
                );
                return Err(self.fail(FailureType::Connect, reason, kill_rx).await);
            }
        };

        self.local_addr = stream.local_addr().ok();
        self.connected = true;
        self.waiting_counted = true;
        self.rec.connect_succeeded(now_ms());
        debug!(local = ?self.local_addr, dest = %self.hostport(), "Connected to remote host");

        let mut server: BoxedServerIo = Box::new(stream);
        if self.set.ssl_flags.contains(SslFlags::YES)
            && !self.set.ssl_flags.contains(SslFlags::STARTTLS)
        {
            server = match self.starttls_upgrade(server, Vec::new()).await {
                Ok(server) => server,
                Err(failure) => return Err(self.fail(failure.kind, failure.reason, kill_rx).await),
            };
        }

        let mut reader = LineReader::new(server, MAX_PROXY_INPUT);
        loop {
            let read = tokio::select! {
                biased;
                _ = kill_rx.changed() => return Err(AttemptEnd::Killed(self.take_order(kill_rx))),
                read = read_auth_line(&mut reader, deadline) => read,
            };
            let line = match read {
                ReadLine::Line(line) => line,
                ReadLine::Eof => {
                    drop(reader);
                    return Err(self
                        .fail(
                            FailureType::Remote,
                            "Disconnected from server unexpectedly".into(),
                            kill_rx,
                        )
                        .await);
                }
                ReadLine::Timeout => {
                    drop(reader);
                    let reason = format!(
                        "Login timed out in state={}{}",
                        self.driver.state_name(),
                        self.connect_error_context()
                    );
                    return Err(self.fail(FailureType::Connect, reason, kill_rx).await);
                }
                ReadLine::Failed(err) => {
                    drop(reader);
                    return Err(self
                        .fail(
                            FailureType::Remote,
                            format!("Disconnected from server: {err}"),
                            kill_rx,
                        )
                        .await);
                }
            };

            for action in self.driver.handle_line(&line) {
                match action {
                    DriverAction::SendServer(bytes) => {
                        if let Err(err) = write_stream(reader.inner_mut(), &bytes).await {
                            drop(reader);
                            return Err(self
                                .fail(
                                    FailureType::Remote,
                                    format!("Disconnected from server: {err}"),
                                    kill_rx,
                                )
                                .await);
                        }
                        self.handle
                            .stats
                            .net_in_bytes
                            .fetch_add(bytes.len() as u64, Ordering::AcqRel);
                    }
                    DriverAction::SendClient(bytes) => {
                        // a failing client write surfaces soon enough, don't
                        // let it preempt the backend exchange
                        if write_stream(client_w, &bytes).await.is_ok() {
                            self.handle
                                .stats
                                .net_out_bytes
                                .fetch_add(bytes.len() as u64, Ordering::AcqRel);
                        }
                    }
                    DriverAction::StartTls => {
                        let (server, leftover) = reader.into_parts();
                        match self.starttls_upgrade(server, leftover).await {
                            Ok(server) => reader = LineReader::new(server, MAX_PROXY_INPUT),
                            Err(failure) => {
                                return Err(self
                                    .fail(failure.kind, failure.reason, kill_rx)
                                    .await)
                            }
                        }
                    }
                    DriverAction::Redirect(target) => {
                        drop(reader);
                        return match self.redirect_finish(target).await {
                            Ok(()) => Err(AttemptEnd::Redirected),
                            Err(failure) => {
                                Err(self.fail(failure.kind, failure.reason, kill_rx).await)
                            }
                        };
                    }
                    DriverAction::Detach => {
                        return Ok(reader.into_parts());
                    }
                    DriverAction::Fail(failure) => {
                        drop(reader);
                        return Err(self.fail(failure.kind, failure.reason, kill_rx).await);
                    }
                }
            }
        }
    }

    #[cfg(feature = "tls")]
    async fn starttls_upgrade(
        &mut self,
        server: BoxedServerIo,
        leftover: Vec<u8>,
    ) -> Result<BoxedServerIo, ProxyFailure> {
        use crate::server::relay::PrependedStream;
        use crate::server::tls;

        let connector = tls::client_connector(&self.set)?;
        let server_name = tls::server_name(&self.host)?;
        let server: BoxedServerIo = if leftover.is_empty() {
            server
        } else {
            Box::new(PrependedStream::new(leftover, server))
        };
        match connector.connect(server_name, server).await {
            Ok(stream) => Ok(Box::new(stream)),
            Err(err) => Err(ProxyFailure::new(
                FailureType::Internal,
                format!("Failed to start SSL handshake: {err}"),
            )),
        }
    }

    #[cfg(not(feature = "tls"))]
    async fn starttls_upgrade(
        &mut self,
        _server: BoxedServerIo,
        _leftover: Vec<u8>,
    ) -> Result<BoxedServerIo, ProxyFailure> {
        Err(ProxyFailure::new(
            FailureType::Internal,
            "Failed to create SSL client: TLS support not compiled in",
        ))
    }

    /// The backend referred the session elsewhere. Guard against referral
    /// loops, spend a TTL hop and rewrite the destination for the next
    /// connect attempt.
    async fn redirect_finish(&mut self, target: RedirectTarget) -> Result<(), ProxyFailure> {
        let port = target.port.unwrap_or(self.port);
        let ip = match &target.host {
            RedirectHost::Ip(ip) => *ip,
            RedirectHost::Name(name) => tokio::net::lookup_host((name.as_str(), port))
                .await
                .ok()
                .and_then(|mut addrs| addrs.next())
                .map(|addr| addr.ip())
                .ok_or_else(|| {
                    ProxyFailure::new(
                        FailureType::RemoteConfig,
                        format!("Couldn't resolve redirect destination {name}"),
                    )
                })?,
        };

        let is_self =
            self.client.local_ip == Some(ip) && self.client.local_port == port;
        let visits = self
            .redirect_path
            .iter()
            .find(|entry| entry.ip == ip && entry.port == port)
            .map(|entry| entry.count)
            .unwrap_or(0);
        if is_self || visits >= PROXY_REDIRECT_LOOP_MIN_COUNT {
            return Err(ProxyFailure::new(
                FailureType::InternalConfig,
                format!("Proxying loops - already connected to {}", ipport(&ip, port)),
            ));
        }

        self.client.consume_proxy_ttl();
        match self
            .redirect_path
            .iter_mut()
            .find(|entry| entry.ip == ip && entry.port == port)
        {
            Some(entry) => entry.count += 1,
            None => self.redirect_path.push(RedirectEntry { ip, port, count: 1 }),
        }

        self.disconnect_bookkeeping();
        debug!(redirect_path = %self.redirect_path_str(), "Redirecting to {}", ipport(&ip, port));
        self.host = ip.to_string();
        self.ip = ip;
        self.port = port;
        self.rec = self.manager.dest_registry().get_or_create(ip, port);
        Ok(())
    }

    /// Current destination plus every destination this session was referred
    /// through, for diagnostics.
    fn redirect_path_str(&self) -> String {
        let mut out = ipport(&self.ip, self.port);
        for entry in &self.redirect_path {
            out.push(',');
            out.push_str(&ipport(&entry.ip, entry.port));
        }
        out
    }

    /// Shared failure funnel: decides between scheduling a reconnect and
    /// giving up, mirroring the retry policy of the failure taxonomy.
    async fn fail(
        &mut self,
        kind: FailureType,
        reason: String,
        kill_rx: &mut KillRx,
    ) -> AttemptEnd {
        if kind.may_reconnect() && self.can_reconnect() {
            self.reconnect_count += 1;
            self.handle
                .reconnect_attempts
                .store(self.reconnect_count, Ordering::Release);
            warn!(
                target: "proxy_session_reconnecting",
                reconnect_attempts = self.reconnect_count,
                error = %reason,
                "{}{} - reconnecting (attempt #{})",
                kind.log_prefix(),
                reason,
                self.reconnect_count
            );
            self.driver.reset();
            self.disconnect_bookkeeping();
            tokio::select! {
                biased;
                _ = kill_rx.changed() => AttemptEnd::Killed(self.take_order(kill_rx)),
                _ = sleep(Duration::from_millis(PROXY_CONNECT_RETRY_MS)) => AttemptEnd::Retry,
            }
        } else {
            AttemptEnd::GiveUp(ProxyFailure::new(kind, reason))
        }
    }

    fn can_reconnect(&self) -> bool {
        if self.reconnect_count >= self.client.set.login_proxy_max_reconnects {
            return false;
        }
        if self.disable_reconnect {
            return false;
        }
        let since_started_ms = self.created.elapsed().as_millis() as i64;
        let left_ms = self.set.connect_timeout_ms as i64 - since_started_ms;
        left_ms > PROXY_CONNECT_RETRY_MIN_MS as i64
    }

    /// The TCP connect itself failed: record the failure against the
    /// destination unless a parallel attempt succeeded after we started.
    fn fail_connect_bookkeeping(&mut self) {
        debug_assert!(!self.waiting_counted);
        if self.created_ms >= self.rec.last_success_ms() {
            self.rec.record_failure(now_ms());
        }
        self.rec.waiting_done();
        self.waiting_counted = true;
    }

    fn disconnect_bookkeeping(&mut self) {
        if !self.waiting_counted {
            self.rec.waiting_done();
            self.waiting_counted = true;
        }
        if self.connected {
            self.rec.proxying_done();
            self.connected = false;
        }
    }

    fn connect_error_context(&self) -> String {
        let mut out = format!(" (after {} secs", self.created.elapsed().as_secs());
        if self.reconnect_count > 0 {
            out.push_str(&format!(", {} reconnects", self.reconnect_count));
        }
        if let Some(local) = self.local_addr {
            out.push_str(&format!(", local={local}"));
        } else if let Some(source_ip) = self.set.source_ip {
            out.push_str(&format!(", local={source_ip}"));
        }
        out.push(')');
        out
    }

    fn success_log_info(&self) -> String {
        let msecs = self.created.elapsed().as_millis();
        let mut out = format!(" ({}.{:03} secs", msecs / 1000, msecs % 1000);
        if self.reconnect_count > 0 {
            out.push_str(&format!(", {} reconnects", self.reconnect_count));
        }
        out.push(')');
        out
    }

    fn take_order(&self, kill_rx: &mut KillRx) -> KillOrder {
        kill_rx
            .borrow_and_update()
            .clone()
            .unwrap_or_else(|| KillOrder::immediate(crate::server::KILLED_BY_SHUTDOWN_REASON))
    }

    fn anvil_session(&self) -> AnvilSession {
        AnvilSession {
            username: self.client.virtual_user.clone(),
            service_name: self.manager.service_name().to_string(),
            ip: self.client.ip,
            dest_ip: Some(self.ip),
            alt_usernames: self.client.alt_usernames.clone(),
        }
    }

    /// Authentication succeeded: register the session, hand both directions
    /// to the byte pump and stay out of the way until one side finishes or
    /// an admin order arrives.
    async fn relay_phase<R, W>(
        &mut self,
        server: BoxedServerIo,
        leftover: Vec<u8>,
        client_r: &mut R,
        client_w: &mut W,
        kill_rx: &mut KillRx,
    ) -> SessionEnd
    where
        R: AsyncRead + Send + Unpin,
        W: AsyncWrite + Send + Unpin,
    {
        self.detached = true;
        self.handle.set_detached();
        self.handle.stats.touch();
        self.manager.link_detached(&self.handle);

        let session = self.anvil_session();
        if let Some(guid) = self.manager.anvil().connect(&session).await {
            self.handle.set_anvil_guid(guid);
        }
        info!(
            user = %self.client.virtual_user,
            "Started proxying to {}{}",
            self.hostport(),
            self.success_log_info()
        );

        let (mut server_r, mut server_w) = tokio::io::split(server);
        let stats = Arc::clone(&self.handle.stats);
        let notify_secs = self.set.notify_refresh_secs;
        let notify_period = if notify_secs > 0 {
            Duration::from_secs(notify_secs)
        } else {
            Duration::from_secs(86_400 * 365)
        };
        let mut notify = tokio::time::interval_at(
            tokio::time::Instant::now() + notify_period,
            notify_period,
        );
        notify.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let outcome = {
            let relay = StreamRelay::run(
                client_r,
                client_w,
                &mut server_r,
                &mut server_w,
                leftover,
                stats,
            );
            tokio::pin!(relay);
            loop {
                tokio::select! {
                    outcome = &mut relay => break Some(outcome),
                    _ = notify.tick() => {
                        if notify_secs > 0 {
                            self.manager
                                .dest_registry()
                                .notify_user(&self.client.proxy_user);
                        }
                    }
                    _ = kill_rx.changed() => break None,
                }
            }
        };
        let _ = server_w.shutdown().await;

        match outcome {
            Some(outcome) => SessionEnd::Relayed(outcome),
            None => SessionEnd::Killed(self.take_order(kill_rx)),
        }
    }

    /// Tear the session down exactly once: reply to the client when the
    /// protocol calls for it, update the destination record, unlink from the
    /// registries, smear the client disconnect when asked to, and settle
    /// accounting.
    async fn finish<R, W>(
        &mut self,
        end: SessionEnd,
        client_r: &mut R,
        client_w: &mut W,
        kill_rx: &mut KillRx,
    ) where
        R: AsyncRead + Send + Unpin,
        W: AsyncWrite + Send + Unpin,
    {
        if !self.handle.begin_teardown() {
            return;
        }

        let stats = Arc::clone(&self.handle.stats);
        let net_in = stats.net_in_bytes.load(Ordering::Acquire);
        let net_out = stats.net_out_bytes.load(Ordering::Acquire);

        let (side, reason, log_msg, delay_wanted, error_code) = match &end {
            SessionEnd::Failed(failure) => {
                if let Some(reply) = self.driver.failure_reply(failure.kind, &failure.reason) {
                    let _ = write_stream(client_w, &reply).await;
                }
                match failure.kind {
                    FailureType::AuthReplied
                    | FailureType::AuthNotReplied
                    | FailureType::AuthTempfail => {
                        if self.client.set.auth_verbose {
                            info!(user = %self.client.virtual_user, "Login failed: {}", failure.reason);
                        }
                    }
                    _ => {
                        error!(
                            dest = %self.hostport(),
                            "{}{}",
                            failure.kind.log_prefix(),
                            failure.reason
                        );
                    }
                }
                (
                    DisconnectSide::Proxy,
                    failure.reason.clone(),
                    None,
                    false,
                    Some(failure.kind),
                )
            }
            SessionEnd::Relayed(outcome) => {
                let errstr = outcome.error_str();
                let idle_secs = (now_ms() - stats.last_io_ms.load(Ordering::Acquire)) / 1000;
                let mut msg = format!("Disconnected by {}", outcome.side);
                if !errstr.is_empty() {
                    msg.push_str(": ");
                    msg.push_str(errstr);
                }
                msg.push_str(&format!(" ({idle_secs}s idle, in={net_in}, out={net_out}"));
                if stats.client_output_blocked.load(Ordering::Acquire) {
                    msg.push_str(", client output blocked");
                }
                if stats.server_output_blocked.load(Ordering::Acquire) {
                    msg.push_str(", server output blocked");
                }
                msg.push(')');
                (
                    outcome.side,
                    errstr.to_string(),
                    Some(msg),
                    outcome.side == DisconnectSide::Server,
                    None,
                )
            }
            SessionEnd::Killed(order) => (
                DisconnectSide::Proxy,
                order.reason.clone(),
                Some(format!("{KILL_PREFIX}{}", order.reason)),
                order.delayed,
                None,
            ),
        };

        self.disconnect_bookkeeping();
        if self.detached {
            self.manager.unlink_detached(&self.handle);
        } else {
            self.manager.unlink_pending(&self.handle);
        }

        let mut delay_ms = 0;
        if self.detached && delay_wanted {
            let max_delay = self.client.set.login_proxy_max_disconnect_delay;
            let jitter = rand::thread_rng().gen_range(0..PROXY_DISCONNECT_INTERVAL_MS);
            delay_ms = self.rec.delay_disconnect(max_delay, now_ms(), jitter);
        }

        if self.detached {
            let idle_usecs = (now_ms() - stats.last_io_ms.load(Ordering::Acquire)).max(0) * 1000;
            let log_msg = log_msg.as_deref().unwrap_or("");
            if delay_ms == 0 {
                info!(
                    target: "proxy_session_finished",
                    disconnect_reason = %reason,
                    disconnect_side = %side,
                    idle_usecs,
                    net_in_bytes = net_in,
                    net_out_bytes = net_out,
                    user = %self.client.virtual_user,
                    "{log_msg}"
                );
            } else {
                info!(
                    target: "proxy_session_finished",
                    disconnect_reason = %reason,
                    disconnect_side = %side,
                    idle_usecs,
                    net_in_bytes = net_in,
                    net_out_bytes = net_out,
                    delay_ms,
                    user = %self.client.virtual_user,
                    "{log_msg} - disconnecting client in {delay_ms}ms"
                );
            }
        } else {
            debug!(
                target: "proxy_session_finished",
                disconnect_reason = %reason,
                disconnect_side = %side,
                error_code = error_code.map(<&'static str>::from),
                user = %self.client.virtual_user,
                "{}",
                log_msg.as_deref().unwrap_or("Failed to connect to remote host")
            );
        }

        if delay_ms > 0 {
            // while the disconnect is smeared, keep draining the client so
            // its death is noticed; a closed client frees immediately
            self.manager.link_disconnecting(&self.handle);
            let deadline = tokio::time::Instant::now() + Duration::from_millis(delay_ms);
            let mut discard = [0u8; 1024];
            loop {
                tokio::select! {
                    _ = sleep_until(deadline) => break,
                    read = client_r.read(&mut discard) => match read {
                        Ok(0) | Err(_) => break,
                        Ok(_) => {}
                    },
                    _ = kill_rx.changed() => {
                        if self.take_order(kill_rx).force_final {
                            break;
                        }
                    }
                }
            }
            self.manager.unlink_disconnecting(&self.handle);
            self.rec.delayed_disconnect_done();
        }

        if let Some(guid) = self.handle.anvil_guid() {
            self.manager
                .anvil()
                .disconnect(&self.anvil_session(), guid)
                .await;
        }
    }
}
