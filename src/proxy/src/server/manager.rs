use crate::backend::{now_ms, DestRegistry};
use crate::server::anvil::{AnvilGuid, AnvilReporter, LocalAnvil};
use crate::server::relay::RelayStats;
use crate::server::{KILLED_BY_ADMIN_REASON, KILLED_BY_SHUTDOWN_REASON, LOGIN_PROXY_DIE_IDLE_SECS};
use dashmap::DashMap;
use hashbrown::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::sleep;
use tracing::{debug, warn};

/// Instruction delivered to a proxy task to terminate itself.
#[derive(Debug, Clone)]
pub struct KillOrder {
    pub reason: String,
    /// Smear the client disconnect instead of closing immediately.
    pub delayed: bool,
    /// Cut a delayed disconnect short (shutdown drain).
    pub force_final: bool,
}

impl KillOrder {
    pub fn immediate(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
            delayed: false,
            force_final: false,
        }
    }

    pub fn delayed(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
            delayed: true,
            force_final: false,
        }
    }

    pub fn force_final() -> Self {
        Self {
            reason: KILLED_BY_SHUTDOWN_REASON.to_string(),
            delayed: false,
            force_final: true,
        }
    }
}

/// The manager's view of one live proxy connection. The connection task owns
/// the sockets; everyone else (kick, reaper, shutdown) acts through this.
pub struct ProxyHandle {
    pub id: u64,
    pub virtual_user: String,
    pub stats: Arc<RelayStats>,
    pub reconnect_attempts: AtomicU32,
    detached: AtomicBool,
    destroying: AtomicBool,
    anvil_guid: Mutex<Option<AnvilGuid>>,
    kill_tx: watch::Sender<Option<KillOrder>>,
}

impl ProxyHandle {
    fn new(id: u64, virtual_user: &str) -> (Arc<Self>, watch::Receiver<Option<KillOrder>>) {
        let (kill_tx, kill_rx) = watch::channel(None);
        let handle = Arc::new(Self {
            id,
            virtual_user: virtual_user.to_string(),
            stats: Arc::new(RelayStats::default()),
            reconnect_attempts: AtomicU32::new(0),
            detached: AtomicBool::new(false),
            destroying: AtomicBool::new(false),
            anvil_guid: Mutex::new(None),
            kill_tx,
        });
        (handle, kill_rx)
    }

    pub fn is_detached(&self) -> bool {
        self.detached.load(Ordering::Acquire)
    }

    pub(crate) fn set_detached(&self) {
        self.detached.store(true, Ordering::Release);
    }

    pub fn is_destroying(&self) -> bool {
        self.destroying.load(Ordering::Acquire)
    }

    /// One-shot teardown guard; only the first caller gets to free.
    pub(crate) fn begin_teardown(&self) -> bool {
        !self.destroying.swap(true, Ordering::AcqRel)
    }

    pub fn anvil_guid(&self) -> Option<AnvilGuid> {
        *self.anvil_guid.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub(crate) fn set_anvil_guid(&self, guid: AnvilGuid) {
        *self.anvil_guid.lock().unwrap_or_else(|e| e.into_inner()) = Some(guid);
    }

    pub fn last_io_ms(&self) -> i64 {
        self.stats.last_io_ms.load(Ordering::Acquire)
    }

    pub fn kill(&self, order: KillOrder) {
        let _ = self.kill_tx.send(Some(order));
    }
}

/// Process-wide registry of live proxies: the ones still logging in
/// (`pending`), the ones relaying (`detached`, with a per-user index for
/// O(1) kicks) and the ones whose client disconnect is being smeared
/// (`disconnecting`).
pub struct ProxyManager {
    service_name: String,
    dest_registry: DestRegistry,
    anvil: Arc<dyn AnvilReporter>,
    pending: DashMap<u64, Arc<ProxyHandle>>,
    detached: DashMap<u64, Arc<ProxyHandle>>,
    by_user: DashMap<String, HashSet<u64>>,
    disconnecting: DashMap<u64, Arc<ProxyHandle>>,
    detached_count: AtomicUsize,
    next_id: AtomicU64,
}

impl ProxyManager {
    pub fn new(service_name: impl Into<String>) -> Self {
        Self::with_parts(service_name, DestRegistry::new(), Arc::new(LocalAnvil))
    }

    pub fn with_parts(
        service_name: impl Into<String>,
        dest_registry: DestRegistry,
        anvil: Arc<dyn AnvilReporter>,
    ) -> Self {
        Self {
            service_name: service_name.into(),
            dest_registry,
            anvil,
            pending: DashMap::new(),
            detached: DashMap::new(),
            by_user: DashMap::new(),
            disconnecting: DashMap::new(),
            detached_count: AtomicUsize::new(0),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn service_name(&self) -> &str {
        &self.service_name
    }

    pub fn dest_registry(&self) -> &DestRegistry {
        &self.dest_registry
    }

    pub fn anvil(&self) -> &Arc<dyn AnvilReporter> {
        &self.anvil
    }

    pub fn new_handle(
        &self,
        virtual_user: &str,
    ) -> (Arc<ProxyHandle>, watch::Receiver<Option<KillOrder>>) {
        let id = self.next_id.fetch_add(1, Ordering::AcqRel);
        ProxyHandle::new(id, virtual_user)
    }

    pub fn register_pending(&self, handle: &Arc<ProxyHandle>) {
        self.pending.insert(handle.id, Arc::clone(handle));
    }

    pub fn unlink_pending(&self, handle: &ProxyHandle) {
        self.pending.remove(&handle.id);
    }

    /// The proxy finished logging in: move it from pending to detached and
    /// index it by user.
    pub fn link_detached(&self, handle: &Arc<ProxyHandle>) {
        self.pending.remove(&handle.id);
        self.detached.insert(handle.id, Arc::clone(handle));
        self.by_user
            .entry(handle.virtual_user.clone())
            .or_default()
            .insert(handle.id);
        self.detached_count.fetch_add(1, Ordering::AcqRel);
    }

    pub fn unlink_detached(&self, handle: &ProxyHandle) {
        if self.detached.remove(&handle.id).is_some() {
            self.detached_count.fetch_sub(1, Ordering::AcqRel);
        }
        if let Some(mut ids) = self.by_user.get_mut(&handle.virtual_user) {
            ids.remove(&handle.id);
            if ids.is_empty() {
                drop(ids);
                self.by_user
                    .remove_if(&handle.virtual_user, |_, ids| ids.is_empty());
            }
        }
    }

    pub fn link_disconnecting(&self, handle: &Arc<ProxyHandle>) {
        self.disconnecting.insert(handle.id, Arc::clone(handle));
    }

    pub fn unlink_disconnecting(&self, handle: &ProxyHandle) {
        self.disconnecting.remove(&handle.id);
    }

    pub fn detached_count(&self) -> usize {
        self.detached_count.load(Ordering::Acquire)
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn disconnecting_count(&self) -> usize {
        self.disconnecting.len()
    }

    /// Admin kick: terminate every proxy belonging to `user`, optionally
    /// narrowed to a single connection GUID. Detached proxies get a smeared
    /// disconnect, pending ones die immediately. Returns how many were hit.
    pub fn kick_user(&self, user: &str, conn_guid: Option<AnvilGuid>) -> usize {
        let mut count = 0;

        let detached_ids: Vec<u64> = self
            .by_user
            .get(user)
            .map(|ids| ids.iter().copied().collect())
            .unwrap_or_default();
        for id in detached_ids {
            let Some(handle) = self.detached.get(&id).map(|e| Arc::clone(e.value())) else {
                continue;
            };
            if conn_guid.is_some() && handle.anvil_guid() != conn_guid {
                continue;
            }
            handle.kill(KillOrder::delayed(KILLED_BY_ADMIN_REASON));
            count += 1;
        }

        let pending: Vec<Arc<ProxyHandle>> = self
            .pending
            .iter()
            .filter(|entry| entry.value().virtual_user == user)
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        for handle in pending {
            if conn_guid.is_some() && handle.anvil_guid() != conn_guid {
                continue;
            }
            handle.kill(KillOrder::immediate(KILLED_BY_ADMIN_REASON));
            count += 1;
        }
        count
    }

    /// Reap detached proxies whose session has gone idle: anything quiet for
    /// `LOGIN_PROXY_DIE_IDLE_SECS` dies now, the rest get a watcher armed at
    /// the moment they would cross the threshold.
    pub fn kill_idle(self: &Arc<Self>) {
        let stop = now_ms() - (LOGIN_PROXY_DIE_IDLE_SECS * 1000) as i64;
        for entry in self.detached.iter() {
            let handle = Arc::clone(entry.value());
            if handle.last_io_ms() <= stop {
                handle.kill(KillOrder::immediate(KILLED_BY_SHUTDOWN_REASON));
                continue;
            }
            tokio::spawn(async move {
                loop {
                    if handle.is_destroying() {
                        return;
                    }
                    let deadline =
                        handle.last_io_ms() + (LOGIN_PROXY_DIE_IDLE_SECS * 1000) as i64;
                    let now = now_ms();
                    if now >= deadline {
                        handle.kill(KillOrder::immediate(KILLED_BY_SHUTDOWN_REASON));
                        return;
                    }
                    sleep(Duration::from_millis((deadline - now) as u64)).await;
                }
            });
        }
    }

    /// Graceful shutdown: kill everything, then force the smeared
    /// disconnects so the process can exit with empty registries.
    pub async fn shutdown(&self) {
        for entry in self.detached.iter() {
            entry
                .value()
                .kill(KillOrder::immediate(KILLED_BY_SHUTDOWN_REASON));
        }
        for entry in self.pending.iter() {
            entry
                .value()
                .kill(KillOrder::immediate(KILLED_BY_SHUTDOWN_REASON));
        }

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            for entry in self.disconnecting.iter() {
                entry.value().kill(KillOrder::force_final());
            }
            if self.pending.is_empty() && self.detached.is_empty() && self.disconnecting.is_empty()
            {
                break;
            }
            if tokio::time::Instant::now() >= deadline {
                warn!(
                    pending = self.pending.len(),
                    detached = self.detached.len(),
                    disconnecting = self.disconnecting.len(),
                    "shutdown drain timed out with live proxies"
                );
                break;
            }
            sleep(Duration::from_millis(10)).await;
        }
        debug_assert_eq!(self.detached_count(), 0);
        debug!("proxy registries drained");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn linked_detached(manager: &ProxyManager, user: &str) -> (Arc<ProxyHandle>, watch::Receiver<Option<KillOrder>>) {
        let (handle, kill_rx) = manager.new_handle(user);
        manager.register_pending(&handle);
        manager.link_detached(&handle);
        handle.set_detached();
        (handle, kill_rx)
    }

    #[test]
    fn detached_count_tracks_links_and_unlinks() {
        let manager = ProxyManager::new("pop3");
        let (a, _rx_a) = linked_detached(&manager, "alice");
        let (b, _rx_b) = linked_detached(&manager, "alice");
        assert_eq!(manager.detached_count(), 2);
        assert_eq!(manager.pending_count(), 0);

        manager.unlink_detached(&a);
        assert_eq!(manager.detached_count(), 1);
        // unlinking twice must not underflow
        manager.unlink_detached(&a);
        assert_eq!(manager.detached_count(), 1);
        manager.unlink_detached(&b);
        assert_eq!(manager.detached_count(), 0);
    }

    #[test]
    fn kick_user_hits_each_matching_proxy_once() {
        let manager = ProxyManager::new("pop3");
        let (_a, mut rx_a) = linked_detached(&manager, "alice");
        let (_b, mut rx_b) = linked_detached(&manager, "alice");
        let (_c, mut rx_c) = linked_detached(&manager, "bob");

        let (pending, mut rx_p) = manager.new_handle("alice");
        manager.register_pending(&pending);

        assert_eq!(manager.kick_user("alice", None), 3);

        let order_a = rx_a.borrow_and_update().clone().unwrap();
        assert_eq!(order_a.reason, KILLED_BY_ADMIN_REASON);
        assert!(order_a.delayed);
        assert!(rx_b.borrow_and_update().clone().is_some());
        // pending proxies are closed immediately
        let order_p = rx_p.borrow_and_update().clone().unwrap();
        assert!(!order_p.delayed);
        // other users untouched
        assert!(rx_c.borrow_and_update().clone().is_none());

        assert_eq!(manager.kick_user("nobody", None), 0);
    }

    #[test]
    fn kick_user_honors_the_conn_guid_filter() {
        let manager = ProxyManager::new("pop3");
        let (a, mut rx_a) = linked_detached(&manager, "alice");
        let (_b, mut rx_b) = linked_detached(&manager, "alice");

        let guid = AnvilGuid::generate();
        a.set_anvil_guid(guid);

        assert_eq!(manager.kick_user("alice", Some(guid)), 1);
        assert!(rx_a.borrow_and_update().clone().is_some());
        assert!(rx_b.borrow_and_update().clone().is_none());
    }

    #[test]
    fn teardown_guard_is_one_shot() {
        let manager = ProxyManager::new("pop3");
        let (handle, _rx) = manager.new_handle("alice");
        assert!(handle.begin_teardown());
        assert!(!handle.begin_teardown());
        assert!(handle.is_destroying());
    }

    #[tokio::test]
    async fn kill_idle_reaps_stale_sessions_and_arms_watchers() {
        let manager = Arc::new(ProxyManager::new("pop3"));
        let (stale, mut rx_stale) = linked_detached(&manager, "alice");
        let (active, mut rx_active) = linked_detached(&manager, "bob");

        stale
            .stats
            .last_io_ms
            .store(now_ms() - 3_000, Ordering::Release);
        active
            .stats
            .last_io_ms
            .store(now_ms() - 1_500, Ordering::Release);

        manager.kill_idle();

        // quiet for >2s: killed synchronously
        assert!(rx_stale.borrow_and_update().clone().is_some());
        // quiet for 1.5s: killed once it crosses the threshold
        assert!(rx_active.borrow_and_update().clone().is_none());
        tokio::time::timeout(Duration::from_secs(2), rx_active.changed())
            .await
            .expect("idle watcher never fired")
            .unwrap();
        assert!(rx_active.borrow_and_update().clone().is_some());
    }

    #[tokio::test]
    async fn shutdown_drains_cooperating_proxy_tasks() {
        let manager = Arc::new(ProxyManager::new("pop3"));
        for user in ["alice", "bob"] {
            let (handle, mut kill_rx) = manager.new_handle(user);
            manager.register_pending(&handle);
            manager.link_detached(&handle);
            let task_manager = Arc::clone(&manager);
            tokio::spawn(async move {
                kill_rx.changed().await.unwrap();
                task_manager.unlink_detached(&handle);
            });
        }
        manager.shutdown().await;
        assert_eq!(manager.detached_count(), 0);
        assert_eq!(manager.pending_count(), 0);
        assert_eq!(manager.disconnecting_count(), 0);
    }
}
