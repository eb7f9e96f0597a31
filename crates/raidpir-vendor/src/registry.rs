//! The live-mirror registry.
//!
//! Keyed by `ip:port`. An advertisement creates or refreshes an entry;
//! entries silent for longer than the expiry window are dropped by the
//! sweep that runs before every mirror-list reply. The sweep is guarded by
//! an atomic flag: if one is already in progress, concurrent list requests
//! proceed without sweeping again rather than queueing up.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use dashmap::DashMap;

use raidpir_core::wire::MirrorInfo;

struct Entry {
    info: MirrorInfo,
    advertised_at: Instant,
}

pub struct MirrorRegistry {
    entries: DashMap<String, Entry>,
    expiry: Duration,
    sweeping: AtomicBool,
}

impl MirrorRegistry {
    pub fn new(expiry: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            expiry,
            sweeping: AtomicBool::new(false),
        }
    }

    /// Record an advertisement, creating or refreshing the entry.
    pub fn upsert(&self, info: MirrorInfo) {
        let key = info.key();
        self.entries.insert(
            key.clone(),
            Entry {
                info,
                advertised_at: Instant::now(),
            },
        );
        tracing::info!(mirror = %key, "mirror advertised");
    }

    /// Drop entries older than the expiry window. A no-op when another
    /// sweep is already running.
    pub fn sweep(&self) {
        if self
            .sweeping
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }
        let now = Instant::now();
        self.entries.retain(|key, entry| {
            let live = now.duration_since(entry.advertised_at) <= self.expiry;
            if !live {
                tracing::info!(mirror = %key, "removing mirror due to timeout");
            }
            live
        });
        self.sweeping.store(false, Ordering::Release);
    }

    /// Sweep, then return the surviving mirrors.
    pub fn live_mirrors(&self) -> Vec<MirrorInfo> {
        self.sweep();
        self.entries
            .iter()
            .map(|entry| entry.info.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
