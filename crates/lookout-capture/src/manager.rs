use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use lookout_core::{AgentId, Event, EventBus, LookoutError, Result, StreamKind};

use crate::backend::{CaptureBackend, CaptureSource};

/// One open capture handle plus the set of agents depending on it.
/// Invariant: an entry exists iff its owner set is non-empty.
struct StreamEntry {
    source: Arc<dyn CaptureSource>,
    owners: HashSet<AgentId>,
    watcher: JoinHandle<()>,
}

/// Reference-counted broker for shared hardware capture handles.
///
/// All acquire/release bookkeeping happens behind a single async mutex, so
/// two simultaneous first-acquirers can never both open hardware. Every
/// state change broadcasts an [`Event::StreamsChanged`] snapshot.
pub struct StreamManager {
    backend: Arc<dyn CaptureBackend>,
    bus: EventBus,
    inner: Mutex<HashMap<StreamKind, StreamEntry>>,
}

impl StreamManager {
    pub fn new(backend: Arc<dyn CaptureBackend>, bus: EventBus) -> Arc<Self> {
        Arc::new(Self {
            backend,
            bus,
            inner: Mutex::new(HashMap::new()),
        })
    }

    /// Register `owner` for `kind`, opening the hardware handle if this is
    /// the first acquirer. Subsequent acquirers share the existing handle
    /// without touching hardware.
    pub async fn acquire(
        self: &Arc<Self>,
        kind: StreamKind,
        owner: &str,
    ) -> Result<Arc<dyn CaptureSource>> {
        let mut inner = self.inner.lock().await;

        if let Some(entry) = inner.get_mut(&kind) {
            entry.owners.insert(owner.to_string());
            debug!(%kind, owner, owners = entry.owners.len(), "joined existing stream");
            let source = Arc::clone(&entry.source);
            let active = Self::snapshot(&inner);
            drop(inner);
            self.bus.publish(Event::StreamsChanged { active });
            return Ok(source);
        }

        // First acquirer: open hardware while still holding the lock so a
        // racing acquirer for the same kind waits instead of double-opening.
        let source = match self.backend.open(kind).await {
            Ok(source) => source,
            Err(e) => {
                // No owner was registered, nothing is left half-open.
                let reason = match e {
                    LookoutError::Acquisition { reason, .. } => reason,
                    other => other.to_string(),
                };
                return Err(LookoutError::Acquisition { kind, reason });
            }
        };

        let watcher = self.spawn_end_watcher(kind, source.closed());
        let mut owners = HashSet::new();
        owners.insert(owner.to_string());
        inner.insert(
            kind,
            StreamEntry {
                source: Arc::clone(&source),
                owners,
                watcher,
            },
        );
        info!(%kind, owner, "opened capture stream");

        let active = Self::snapshot(&inner);
        drop(inner);
        self.bus.publish(Event::StreamsChanged { active });
        Ok(source)
    }

    /// Remove `owner` from `kind`'s owner set; the last releaser closes
    /// the hardware handle. Releasing an unknown owner or an inactive
    /// kind is a logged no-op.
    pub async fn release(&self, kind: StreamKind, owner: &str) {
        let mut inner = self.inner.lock().await;

        let Some(entry) = inner.get_mut(&kind) else {
            debug!(%kind, owner, "release for inactive stream — ignoring");
            return;
        };
        if !entry.owners.remove(owner) {
            debug!(%kind, owner, "release for unregistered owner — ignoring");
            return;
        }
        debug!(%kind, owner, owners = entry.owners.len(), "released stream");

        if entry.owners.is_empty() {
            if let Some(entry) = inner.remove(&kind) {
                entry.watcher.abort();
                entry.source.close().await;
                info!(%kind, "closed capture stream (last owner released)");
            }
        }

        let active = Self::snapshot(&inner);
        drop(inner);
        self.bus.publish(Event::StreamsChanged { active });
    }

    /// The currently open handle for `kind`, if any.
    pub async fn current(&self, kind: StreamKind) -> Option<Arc<dyn CaptureSource>> {
        self.inner
            .lock()
            .await
            .get(&kind)
            .map(|e| Arc::clone(&e.source))
    }

    /// Snapshot of currently open kinds.
    pub async fn active_kinds(&self) -> Vec<StreamKind> {
        Self::snapshot(&*self.inner.lock().await)
    }

    fn snapshot(inner: &HashMap<StreamKind, StreamEntry>) -> Vec<StreamKind> {
        let mut active: Vec<StreamKind> = inner.keys().copied().collect();
        active.sort_by_key(|k| format!("{k}"));
        active
    }

    fn spawn_end_watcher(
        self: &Arc<Self>,
        kind: StreamKind,
        mut closed: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let weak = Arc::downgrade(self);
        tokio::spawn(async move {
            loop {
                if *closed.borrow() {
                    break;
                }
                if closed.changed().await.is_err() {
                    // Sender dropped: the source is gone.
                    break;
                }
            }
            if let Some(manager) = weak.upgrade() {
                manager.handle_stream_ended(kind).await;
            }
        })
    }

    /// Hardware ended the stream unilaterally: force-clear the owner set,
    /// close exactly once, and notify subscribers so dependent agents can
    /// react on their next iteration.
    async fn handle_stream_ended(&self, kind: StreamKind) {
        let removed = self.inner.lock().await.remove(&kind);
        let Some(entry) = removed else {
            // A normal release won the race and already closed it.
            return;
        };
        warn!(
            %kind,
            owners = entry.owners.len(),
            "stream ended by hardware — force-clearing owners"
        );
        entry.source.close().await;

        self.bus.publish(Event::StreamEnded { kind });
        let active = self.active_kinds().await;
        self.bus.publish(Event::StreamsChanged { active });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockBackend;

    fn manager() -> (Arc<StreamManager>, Arc<MockBackend>, EventBus) {
        let backend = MockBackend::new();
        let bus = EventBus::new(64);
        let manager = StreamManager::new(backend.clone(), bus.clone());
        (manager, backend, bus)
    }

    #[tokio::test]
    async fn n_acquirers_share_one_hardware_open() {
        let (manager, backend, _bus) = manager();

        for owner in ["a", "b", "c", "d"] {
            manager
                .acquire(StreamKind::ScreenVideo, owner)
                .await
                .unwrap();
        }
        assert_eq!(backend.open_count(StreamKind::ScreenVideo), 1);

        // Releases in arbitrary order; close only after the last one.
        for owner in ["c", "a", "d"] {
            manager.release(StreamKind::ScreenVideo, owner).await;
            assert_eq!(backend.close_count(StreamKind::ScreenVideo), 0);
        }
        manager.release(StreamKind::ScreenVideo, "b").await;
        assert_eq!(backend.close_count(StreamKind::ScreenVideo), 1);
        assert!(manager.current(StreamKind::ScreenVideo).await.is_none());
    }

    #[tokio::test]
    async fn concurrent_first_acquirers_open_once() {
        let (manager, backend, _bus) = manager();

        let mut handles = Vec::new();
        for i in 0..8 {
            let manager = Arc::clone(&manager);
            handles.push(tokio::spawn(async move {
                manager
                    .acquire(StreamKind::Camera, &format!("agent_{i}"))
                    .await
                    .unwrap();
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        assert_eq!(backend.open_count(StreamKind::Camera), 1);
    }

    #[tokio::test]
    async fn release_of_unknown_owner_is_a_noop() {
        let (manager, backend, _bus) = manager();
        manager.release(StreamKind::Microphone, "ghost").await;

        manager.acquire(StreamKind::Microphone, "a").await.unwrap();
        manager.release(StreamKind::Microphone, "ghost").await;
        assert_eq!(backend.close_count(StreamKind::Microphone), 0);
        manager.release(StreamKind::Microphone, "a").await;
        assert_eq!(backend.close_count(StreamKind::Microphone), 1);
        // Double release after close is also a no-op.
        manager.release(StreamKind::Microphone, "a").await;
        assert_eq!(backend.close_count(StreamKind::Microphone), 1);
    }

    #[tokio::test]
    async fn failed_open_leaves_nothing_half_open() {
        let (manager, backend, _bus) = manager();
        backend.fail_opens(StreamKind::ScreenVideo);

        let err = manager.acquire(StreamKind::ScreenVideo, "a").await;
        assert!(matches!(
            err,
            Err(LookoutError::Acquisition {
                kind: StreamKind::ScreenVideo,
                ..
            })
        ));
        assert!(manager.current(StreamKind::ScreenVideo).await.is_none());

        // A later attempt after the fault clears opens fresh.
        backend.clear_failures();
        manager.acquire(StreamKind::ScreenVideo, "a").await.unwrap();
        assert_eq!(backend.open_count(StreamKind::ScreenVideo), 2);
    }

    #[tokio::test]
    async fn hardware_end_force_clears_owners_and_closes_once() {
        let (manager, backend, bus) = manager();
        let mut events = bus.subscribe();

        manager.acquire(StreamKind::ScreenVideo, "a").await.unwrap();
        manager.acquire(StreamKind::ScreenVideo, "b").await.unwrap();
        // Drain the two acquire snapshots.
        let _ = events.recv().await.unwrap();
        let _ = events.recv().await.unwrap();

        backend
            .source(StreamKind::ScreenVideo)
            .unwrap()
            .end_stream();

        // StreamEnded, then the emptied snapshot.
        loop {
            match events.recv().await.unwrap() {
                Event::StreamEnded { kind } => {
                    assert_eq!(kind, StreamKind::ScreenVideo);
                    break;
                }
                _ => continue,
            }
        }
        assert_eq!(backend.close_count(StreamKind::ScreenVideo), 1);
        assert!(manager.current(StreamKind::ScreenVideo).await.is_none());

        // Releases from the former owners are now no-ops.
        manager.release(StreamKind::ScreenVideo, "a").await;
        manager.release(StreamKind::ScreenVideo, "b").await;
        assert_eq!(backend.close_count(StreamKind::ScreenVideo), 1);
    }

    #[tokio::test]
    async fn snapshot_is_published_on_every_change() {
        let (manager, _backend, bus) = manager();
        let mut events = bus.subscribe();

        manager.acquire(StreamKind::Camera, "a").await.unwrap();
        match events.recv().await.unwrap() {
            Event::StreamsChanged { active } => assert_eq!(active, vec![StreamKind::Camera]),
            other => panic!("unexpected event: {other:?}"),
        }

        manager.release(StreamKind::Camera, "a").await;
        match events.recv().await.unwrap() {
            Event::StreamsChanged { active } => assert!(active.is_empty()),
            other => panic!("unexpected event: {other:?}"),
        }
    }
}
