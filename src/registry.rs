//! Process-wide table of live pre-login sessions
//!
//! Every accepted connection is admitted here before its session task
//! starts. The registry enforces the connection cap by evicting the oldest
//! sessions in batches, sweeps for idle sessions once a second, and drains
//! everything at shutdown. It never touches a session's socket itself:
//! destruction requests travel over each session's control channel, and a
//! session that already exited simply has a dead receiver.

use crate::config::{DESTROY_OLDEST_COUNT, SWEEP_INTERVAL};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Order to a session to shut itself down.
///
/// `line` is written to the client first when present; `reason` is logged
/// when present. Shutdown sends neither: sessions die silently.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DisconnectNotice {
    pub line: Option<&'static str>,
    pub reason: Option<&'static str>,
}

struct Entry {
    created: Instant,
    peer: SocketAddr,
    last_input: Arc<Mutex<Instant>>,
    control: mpsc::Sender<DisconnectNotice>,
}

/// What a session receives at admission: its control receiver, the shared
/// activity timestamp the sweep reads, and the guard whose drop removes the
/// table entry.
pub struct SessionHandle {
    pub id: u64,
    pub control: mpsc::Receiver<DisconnectNotice>,
    pub last_input: Arc<Mutex<Instant>>,
    _guard: Guard,
}

impl SessionHandle {
    /// Record client activity; called on every successful read.
    pub fn touch(&self) {
        *self.last_input.lock().unwrap() = Instant::now();
    }
}

/// Removes the table entry when the session ends, however it ends.
struct Guard {
    id: u64,
    table: Arc<Mutex<HashMap<u64, Entry>>>,
}

impl Drop for Guard {
    fn drop(&mut self) {
        self.table.lock().unwrap().remove(&self.id);
    }
}

pub struct Registry {
    table: Arc<Mutex<HashMap<u64, Entry>>>,
    next_id: AtomicU64,
    max_users: usize,
    idle_timeout: Duration,
    shutdown: CancellationToken,
}

impl Registry {
    #[must_use]
    pub fn new(max_users: usize, idle_timeout: Duration) -> Self {
        Self {
            table: Arc::new(Mutex::new(HashMap::new())),
            next_id: AtomicU64::new(1),
            max_users,
            idle_timeout,
            shutdown: CancellationToken::new(),
        }
    }

    /// Admit a new connection, evicting the oldest batch first when the
    /// table is at capacity.
    pub fn admit(&self, peer: SocketAddr) -> SessionHandle {
        self.admit_at(peer, Instant::now())
    }

    fn admit_at(&self, peer: SocketAddr, created: Instant) -> SessionHandle {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (control_tx, control_rx) = mpsc::channel(4);
        let last_input = Arc::new(Mutex::new(created));

        let evicted = {
            let mut table = self.table.lock().unwrap();
            let evicted = if self.max_users > DESTROY_OLDEST_COUNT && table.len() >= self.max_users
            {
                oldest_entries(&table)
                    .into_iter()
                    .filter_map(|old| table.remove(&old))
                    .collect()
            } else {
                Vec::new()
            };
            table.insert(
                id,
                Entry {
                    created,
                    peer,
                    last_input: Arc::clone(&last_input),
                    control: control_tx,
                },
            );
            evicted
        };

        for old in evicted {
            info!(peer = %old.peer, "Disconnected: Connection queue full");
            let _ = old.control.try_send(DisconnectNotice {
                line: None,
                reason: None,
            });
        }

        SessionHandle {
            id,
            control: control_rx,
            last_input,
            _guard: Guard {
                id,
                table: Arc::clone(&self.table),
            },
        }
    }

    /// Number of live sessions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.table.lock().unwrap().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.table.lock().unwrap().is_empty()
    }

    /// Destroy every session idle for the configured timeout. Returns how
    /// many were reaped.
    pub fn sweep(&self, now: Instant) -> usize {
        let expired: Vec<Entry> = {
            let mut table = self.table.lock().unwrap();
            let ids: Vec<u64> = table
                .iter()
                .filter(|(_, entry)| {
                    now.duration_since(*entry.last_input.lock().unwrap()) >= self.idle_timeout
                })
                .map(|(id, _)| *id)
                .collect();
            ids.into_iter().filter_map(|id| table.remove(&id)).collect()
        };

        let count = expired.len();
        for entry in expired {
            debug!(peer = %entry.peer, "idle session reaped");
            let _ = entry.control.try_send(DisconnectNotice {
                line: Some("* BYE Disconnected for inactivity."),
                reason: Some("Disconnected: Inactivity"),
            });
        }
        count
    }

    /// Run the 1 s idle sweep until shutdown.
    pub fn spawn_sweeper(self: &Arc<Self>) -> JoinHandle<()> {
        let registry = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        registry.sweep(Instant::now());
                    }
                    () = registry.shutdown.cancelled() => return,
                }
            }
        })
    }

    /// Drain the table silently: no farewell line, no log reason.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
        let drained: Vec<Entry> = {
            let mut table = self.table.lock().unwrap();
            table.drain().map(|(_, entry)| entry).collect()
        };
        for entry in drained {
            let _ = entry.control.try_send(DisconnectNotice {
                line: None,
                reason: None,
            });
        }
    }
}

/// The ids of the `DESTROY_OLDEST_COUNT` oldest sessions, by creation time.
/// Bounded insertion into a fixed-size buffer; one pass over the table.
fn oldest_entries(table: &HashMap<u64, Entry>) -> Vec<u64> {
    let mut oldest: Vec<(Instant, u64)> = Vec::with_capacity(DESTROY_OLDEST_COUNT + 1);
    for (id, entry) in table {
        let slot = oldest.partition_point(|(created, _)| *created <= entry.created);
        if slot < DESTROY_OLDEST_COUNT {
            oldest.insert(slot, (entry.created, *id));
            oldest.truncate(DESTROY_OLDEST_COUNT);
        }
    }
    oldest.into_iter().map(|(_, id)| id).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer() -> SocketAddr {
        "10.0.0.1:50000".parse().unwrap()
    }

    #[tokio::test]
    async fn guard_drop_removes_entry() {
        let registry = Registry::new(0, Duration::from_secs(60));
        let handle = registry.admit(peer());
        assert_eq!(registry.len(), 1);
        drop(handle);
        assert_eq!(registry.len(), 0);
    }

    #[tokio::test]
    async fn admission_over_capacity_evicts_oldest_batch() {
        let max = DESTROY_OLDEST_COUNT + 4;
        let registry = Registry::new(max, Duration::from_secs(60));
        let base = Instant::now();

        let mut handles = Vec::new();
        for i in 0..max {
            handles.push(registry.admit_at(peer(), base + Duration::from_secs(i as u64)));
        }
        assert_eq!(registry.len(), max);

        let newcomer = registry.admit_at(peer(), base + Duration::from_secs(1000));
        // The 16 oldest are gone; the 4 youngest plus the newcomer remain.
        assert_eq!(registry.len(), max - DESTROY_OLDEST_COUNT + 1);

        let mut evicted = 0;
        for handle in &mut handles {
            if handle.control.try_recv().is_ok() {
                evicted += 1;
            }
        }
        assert_eq!(evicted, DESTROY_OLDEST_COUNT);
        drop(newcomer);
    }

    #[tokio::test]
    async fn small_caps_never_evict() {
        let registry = Registry::new(DESTROY_OLDEST_COUNT, Duration::from_secs(60));
        let mut handles = Vec::new();
        for _ in 0..DESTROY_OLDEST_COUNT + 2 {
            handles.push(registry.admit(peer()));
        }
        assert_eq!(registry.len(), DESTROY_OLDEST_COUNT + 2);
        for handle in &mut handles {
            assert!(handle.control.try_recv().is_err());
        }
    }

    #[tokio::test]
    async fn sweep_reaps_only_idle_sessions() {
        let registry = Registry::new(0, Duration::from_secs(60));
        let mut idle = registry.admit(peer());
        let active = registry.admit(peer());

        let later = Instant::now() + Duration::from_secs(61);
        *active.last_input.lock().unwrap() = later;

        assert_eq!(registry.sweep(later), 1);
        let notice = idle.control.try_recv().unwrap();
        assert_eq!(notice.line, Some("* BYE Disconnected for inactivity."));
        assert_eq!(notice.reason, Some("Disconnected: Inactivity"));
        assert_eq!(registry.len(), 1);
        drop(active);
    }

    #[tokio::test]
    async fn shutdown_drains_silently() {
        let registry = Registry::new(0, Duration::from_secs(60));
        let mut a = registry.admit(peer());
        let mut b = registry.admit(peer());
        registry.shutdown();
        assert!(registry.is_empty());
        for handle in [&mut a, &mut b] {
            let notice = handle.control.try_recv().unwrap();
            assert_eq!(notice.line, None);
            assert_eq!(notice.reason, None);
        }
    }

    #[test]
    fn oldest_selection_is_bounded_and_sorted() {
        let mut table = HashMap::new();
        let base = Instant::now();
        for i in 0u64..40 {
            let (tx, _rx) = mpsc::channel(1);
            table.insert(
                i,
                Entry {
                    created: base + Duration::from_secs(100 - i),
                    peer: peer(),
                    last_input: Arc::new(Mutex::new(base)),
                    control: tx,
                },
            );
        }
        let oldest = oldest_entries(&table);
        assert_eq!(oldest.len(), DESTROY_OLDEST_COUNT);
        // Creation time decreases as id grows, so the oldest are the
        // highest ids.
        for id in oldest {
            assert!(id >= 40 - DESTROY_OLDEST_COUNT as u64);
        }
    }
}
