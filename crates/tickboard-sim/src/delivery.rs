//! Fault-injecting release of queued realtime pushes.
//!
//! The store runs in deferred mode, so every push waits in a per-collection
//! queue. Each round the scheduler decides which queues release, how many
//! pushes they release, and in which order the collections go. Within one
//! collection pushes always leave in emission order; across collections
//! there is no ordering at all, matching independent realtime streams.

use serde::{Deserialize, Serialize};
use tickboard_core::store::{Collection, MemoryStore, StoreError};
use tickboard_core::sync::SYNCED;
use tracing::trace;

use crate::rng::DeterministicRng;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FaultConfig {
    /// Chance that a collection with queued pushes releases any this round.
    pub release_rate_percent: u8,
    /// Most pushes one collection releases in a round.
    pub max_burst: u8,
    /// Chance that a released push is delivered twice.
    pub duplicate_rate_percent: u8,
    /// Chance per round that collections release in shuffled order.
    pub reorder_rate_percent: u8,
    /// Chance per round that one synced stream reports an error.
    pub stream_error_rate_percent: u8,
}

impl Default for FaultConfig {
    fn default() -> Self {
        Self {
            release_rate_percent: 60,
            max_burst: 2,
            duplicate_rate_percent: 5,
            reorder_rate_percent: 30,
            stream_error_rate_percent: 3,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Release {
    Delivered {
        collection: Collection,
        duplicated: bool,
    },
    StreamError {
        collection: Collection,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeliveryScheduler {
    fault: FaultConfig,
}

impl DeliveryScheduler {
    #[must_use]
    pub const fn new(fault: FaultConfig) -> Self {
        Self { fault }
    }

    #[must_use]
    pub const fn fault_config(&self) -> FaultConfig {
        self.fault
    }

    /// Release this round's pushes into the subscribers' sinks.
    pub fn release_round(&self, store: &MemoryStore, rng: &mut DeterministicRng) -> Vec<Release> {
        let mut collections = store.pending_collections();
        if collections.len() > 1 && rng.hit_rate_percent(self.fault.reorder_rate_percent) {
            rng.shuffle(&mut collections);
        }

        let mut released = Vec::new();
        for collection in collections {
            if !rng.hit_rate_percent(self.fault.release_rate_percent) {
                continue;
            }
            let burst = 1 + rng.next_bounded(u64::from(self.fault.max_burst.max(1)));
            for _ in 0..burst {
                if rng.hit_rate_percent(self.fault.duplicate_rate_percent)
                    && store.duplicate_next(collection)
                {
                    released.push(Release::Delivered {
                        collection,
                        duplicated: true,
                    });
                }
                if !store.deliver_next(collection) {
                    break;
                }
                released.push(Release::Delivered {
                    collection,
                    duplicated: false,
                });
            }
        }
        trace!(count = released.len(), "pushes released");
        released
    }

    /// Possibly break one synced stream. The error queues behind the
    /// stream's earlier pushes.
    pub fn maybe_break(&self, store: &MemoryStore, rng: &mut DeterministicRng) -> Option<Release> {
        if !rng.hit_rate_percent(self.fault.stream_error_rate_percent) {
            return None;
        }
        let collection = *rng.pick(&SYNCED)?;
        store.fail_subscriptions(
            collection,
            &StoreError::Unavailable("simulated stream outage".to_string()),
        );
        Some(Release::StreamError { collection })
    }
}
