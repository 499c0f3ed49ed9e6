use crate::server::PROXY_DISCONNECT_INTERVAL_MS;
use dashmap::DashMap;
use std::net::IpAddr;
use std::sync::atomic::{AtomicI64, AtomicU32, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

/// Wall clock in milliseconds, cheap enough for per-event stamping.
pub fn now_ms() -> i64 {
    coarsetime::Clock::now_since_epoch().as_millis() as i64
}

/// Per-destination health record, shared by every proxy connection headed to
/// the same `(ip, port)`. Lives for the whole process; connections mutate it
/// through their own bookkeeping operations only.
#[derive(Debug, Default)]
pub struct DestRec {
    last_success_ms: AtomicI64,
    last_failure_ms: AtomicI64,
    num_waiting_connections: AtomicU32,
    num_proxying_connections: AtomicU32,
    num_disconnects_since_ts: AtomicU32,
    num_delayed_client_disconnects: AtomicU32,
    /// Anchor for disconnect smearing; all delayed frees to this destination
    /// are scheduled relative to it.
    disconnect_timestamp_ms: AtomicI64,
}

fn decrement_nonzero(counter: &AtomicU32, what: &str) {
    let previous = counter.fetch_update(Ordering::AcqRel, Ordering::Acquire, |v| {
        v.checked_sub(1)
    });
    if previous.is_err() {
        warn!("attempted to decrement {what} below zero");
    }
}

impl DestRec {
    pub fn last_success_ms(&self) -> i64 {
        self.last_success_ms.load(Ordering::Acquire)
    }

    pub fn last_failure_ms(&self) -> i64 {
        self.last_failure_ms.load(Ordering::Acquire)
    }

    pub fn num_waiting_connections(&self) -> u32 {
        self.num_waiting_connections.load(Ordering::Acquire)
    }

    pub fn num_proxying_connections(&self) -> u32 {
        self.num_proxying_connections.load(Ordering::Acquire)
    }

    pub fn num_disconnects_since_ts(&self) -> u32 {
        self.num_disconnects_since_ts.load(Ordering::Acquire)
    }

    pub fn num_delayed_client_disconnects(&self) -> u32 {
        self.num_delayed_client_disconnects.load(Ordering::Acquire)
    }

    /// A connect attempt is in flight.
    pub fn connect_begin(&self) {
        self.num_waiting_connections.fetch_add(1, Ordering::AcqRel);
    }

    /// The in-flight attempt stopped waiting (failed or was abandoned).
    pub fn waiting_done(&self) {
        decrement_nonzero(&self.num_waiting_connections, "num_waiting_connections");
    }

    /// First connect to this destination: pretend the last success was a
    /// second ago so the down-too-long check cannot trip on attempt one.
    pub fn seed_last_success(&self, now_ms: i64) {
        let _ = self.last_success_ms.compare_exchange(
            0,
            now_ms - 1000,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }

    /// How long the destination has been down, zero while it is healthy.
    pub fn down_seconds(&self, _now_ms: i64) -> i64 {
        let failure = self.last_failure_ms();
        let success = self.last_success_ms();
        if failure > success {
            (failure - success) / 1000
        } else {
            0
        }
    }

    pub fn record_failure(&self, now_ms: i64) {
        self.last_failure_ms.store(now_ms, Ordering::Release);
    }

    /// TCP connect completed: the attempt moves from waiting to proxying.
    pub fn connect_succeeded(&self, now_ms: i64) {
        self.last_success_ms.store(now_ms, Ordering::Release);
        decrement_nonzero(&self.num_waiting_connections, "num_waiting_connections");
        self.num_proxying_connections.fetch_add(1, Ordering::AcqRel);
        self.num_disconnects_since_ts.store(0, Ordering::Release);
    }

    pub fn proxying_done(&self) {
        decrement_nonzero(&self.num_proxying_connections, "num_proxying_connections");
    }

    /// Decide how long to keep this client connected after its backend went
    /// away. Disconnects are spread across `max_delay_secs` in
    /// 100ms buckets anchored at a per-destination jittered timestamp, so a
    /// dead backend doesn't translate into every client reconnecting in the
    /// same instant. Returns 0 for "disconnect now".
    pub fn delay_disconnect(&self, max_delay_secs: u32, now_ms: i64, jitter_ms: u64) -> u64 {
        if self.num_disconnects_since_ts() == 0 {
            self.disconnect_timestamp_ms
                .store(now_ms + jitter_ms as i64, Ordering::Release);
        }
        let since_ts = self.num_disconnects_since_ts.fetch_add(1, Ordering::AcqRel) + 1;

        if max_delay_secs == 0 {
            // delaying is disabled
            return 0;
        }
        let max_conns = self.num_proxying_connections() + since_ts;
        let max_disconnects_per_sec = (max_conns + max_delay_secs - 1) / max_delay_secs;
        if since_ts <= max_disconnects_per_sec && self.num_delayed_client_disconnects() == 0 {
            // wait delaying until we have 1 second's worth of clients
            // disconnected
            return 0;
        }

        let offset_ms = PROXY_DISCONNECT_INTERVAL_MS
            * (max_delay_secs as u64 * since_ts as u64
                * (1000 / PROXY_DISCONNECT_INTERVAL_MS)
                / max_conns as u64);
        let disconnect_at =
            self.disconnect_timestamp_ms.load(Ordering::Acquire) + offset_ms as i64;
        let delay_ms = disconnect_at - now_ms;
        if delay_ms <= 0 {
            // we already reached the time
            return 0;
        }
        self.num_delayed_client_disconnects
            .fetch_add(1, Ordering::AcqRel);
        delay_ms as u64
    }

    /// A delayed client disconnect finished (or was forced). When the queue
    /// empties the smear window restarts from scratch.
    pub fn delayed_disconnect_done(&self) {
        let drained = self
            .num_delayed_client_disconnects
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |v| v.checked_sub(1));
        if drained == Ok(1) {
            self.num_disconnects_since_ts.store(0, Ordering::Release);
        }
    }
}

/// Sink for the periodic "this user is still proxied here" refresh emitted
/// while a connection is detached.
pub trait DestNotify: Send + Sync {
    fn notify_user(&self, user: &str);
}

/// Default sink when no notification pipe is wired up.
#[derive(Debug, Default)]
pub struct LogNotify;

impl DestNotify for LogNotify {
    fn notify_user(&self, user: &str) {
        debug!(user = %user, "proxy notify refresh");
    }
}

/// Process-wide `(ip, port)` → [`DestRec`] map. Records are created on first
/// reference and never dropped, so health data and smear anchors survive
/// individual sessions.
pub struct DestRegistry {
    records: DashMap<(IpAddr, u16), Arc<DestRec>>,
    notify: Box<dyn DestNotify>,
}

impl Default for DestRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl DestRegistry {
    pub fn new() -> Self {
        Self::with_notify(Box::new(LogNotify))
    }

    pub fn with_notify(notify: Box<dyn DestNotify>) -> Self {
        Self {
            records: DashMap::new(),
            notify,
        }
    }

    pub fn get_or_create(&self, ip: IpAddr, port: u16) -> Arc<DestRec> {
        self.records
            .entry((ip, port))
            .or_insert_with(|| Arc::new(DestRec::default()))
            .clone()
    }

    pub fn notify_user(&self, user: &str) {
        self.notify.notify_user(user);
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}
