//! tickboard-sim library.
//!
//! Drives a [`Session`] against a deferred [`MemoryStore`] while a scripted
//! world writes boards, tickets and profiles, signs users in and out, and
//! breaks streams. Pushes are released late, in bursts, duplicated and
//! reordered across collections. After every event the session applies,
//! the [`oracle`] checks the authorization invariants.
//!
//! # Conventions
//!
//! - **Errors**: `anyhow::Result` for return types.
//! - **Logging**: `tracing` macros.

pub mod actor;
pub mod campaign;
pub mod delivery;
pub mod oracle;
pub mod rng;

use std::collections::BTreeSet;
use std::sync::Arc;

use anyhow::{Result, bail};
use chrono::{Duration, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use tickboard_core::config::TrackerConfig;
use tickboard_core::session::Session;
use tickboard_core::store::{Collection, DocumentStore, MemoryStore};
use tracing::{debug, info};

use crate::actor::{Action, World, email_for};
use crate::delivery::{DeliveryScheduler, FaultConfig, Release};
use crate::oracle::{InvariantViolation, Oracle};
use crate::rng::DeterministicRng;

/// Upper bound on drain iterations once the rounds are over.
const MAX_DRAIN_PASSES: usize = 1_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SimulationConfig {
    pub seed: u64,
    /// Accounts in the world (at least two: the reserved admin and an admin).
    pub users: usize,
    pub rounds: u64,
    /// Most world actions per round.
    pub max_actions_per_round: u8,
    /// Most queued session events applied per round.
    pub max_applies_per_round: u8,
    pub fault: FaultConfig,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            seed: 0,
            users: 4,
            rounds: 40,
            max_actions_per_round: 2,
            max_applies_per_round: 6,
            fault: FaultConfig::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TraceEventKind {
    Action { action: Action },
    Delivered { collection: String, duplicated: bool },
    StreamError { collection: String },
    Applied {
        principal: Option<String>,
        loading: bool,
        boards: usize,
        tickets: usize,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TraceEvent {
    pub round: u64,
    pub kind: TraceEventKind,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SimulationResult {
    pub seed: u64,
    pub trace: Vec<TraceEvent>,
    pub violations: Vec<InvariantViolation>,
    pub steps_checked: usize,
    /// Sign-ins and sign-outs issued while pushes were still in flight.
    pub teardowns_in_flight: usize,
    pub duplicates: usize,
    pub stream_errors: usize,
    pub interesting_state_reached: bool,
}

impl SimulationResult {
    #[must_use]
    pub fn passed(&self) -> bool {
        self.violations.is_empty()
    }
}

pub struct Simulator {
    config: SimulationConfig,
    rng: DeterministicRng,
    store: Arc<MemoryStore>,
    world: World,
    session: Session,
    scheduler: DeliveryScheduler,
    oracle: Oracle,
    super_admin_email: String,
    stale: BTreeSet<Collection>,
    trace: Vec<TraceEvent>,
    round: u64,
    teardowns_in_flight: usize,
    duplicates: usize,
    stream_errors: usize,
}

impl Simulator {
    /// Build the world and a signed-out session for `config`.
    ///
    /// # Errors
    ///
    /// Returns an error for an unusable configuration or if the world
    /// cannot be seeded.
    pub fn new(config: SimulationConfig) -> Result<Self> {
        if config.users < 2 {
            bail!("a simulation needs at least 2 users, got {}", config.users);
        }
        let start = Utc
            .timestamp_millis_opt(1_700_000_000_000)
            .single()
            .unwrap_or_else(Utc::now);
        let store = Arc::new(
            MemoryStore::new()
                .with_manual_clock(start)
                .with_sequential_ids()
                .deferred(),
        );
        let world = World::new(Arc::clone(&store), config.users)?;

        let super_admin_email = email_for(0);
        let mut tracker = TrackerConfig::default();
        tracker.auth.super_admin_email = Some(super_admin_email.clone());
        let session = Session::new(
            Arc::clone(&store) as Arc<dyn DocumentStore>,
            world.identity.as_ref(),
            Arc::new(world.grants.clone()),
            &tracker,
        );

        Ok(Self {
            rng: DeterministicRng::new(config.seed),
            scheduler: DeliveryScheduler::new(config.fault),
            config,
            store,
            world,
            session,
            oracle: Oracle::new(),
            super_admin_email,
            stale: BTreeSet::new(),
            trace: Vec::new(),
            round: 0,
            teardowns_in_flight: 0,
            duplicates: 0,
            stream_errors: 0,
        })
    }

    /// Run every round, drain, and check convergence.
    ///
    /// # Errors
    ///
    /// Returns an error if the world fails to carry out an action or the
    /// queues never drain.
    pub fn run(&mut self) -> Result<SimulationResult> {
        info!(seed = self.config.seed, rounds = self.config.rounds, "simulation started");
        for round in 0..self.config.rounds {
            self.round = round;
            self.store.advance_clock(Duration::seconds(1));
            self.act()?;
            self.release();
            self.apply_some();
        }
        self.drain()?;
        self.oracle.check_quiescent(
            &self.session,
            &self.store,
            self.world.identity.as_ref(),
            Some(&self.super_admin_email),
            &self.stale,
        );

        let steps_checked = self.oracle.steps_checked();
        let violations = std::mem::take(&mut self.oracle).into_violations();
        let result = SimulationResult {
            seed: self.config.seed,
            trace: std::mem::take(&mut self.trace),
            steps_checked,
            teardowns_in_flight: self.teardowns_in_flight,
            duplicates: self.duplicates,
            stream_errors: self.stream_errors,
            interesting_state_reached: self.teardowns_in_flight > 0
                && (self.duplicates > 0 || self.stream_errors > 0),
            violations,
        };
        info!(
            seed = result.seed,
            steps = result.steps_checked,
            violations = result.violations.len(),
            "simulation finished"
        );
        Ok(result)
    }

    fn record(&mut self, kind: TraceEventKind) {
        self.trace.push(TraceEvent {
            round: self.round,
            kind,
        });
    }

    fn act(&mut self) -> Result<()> {
        let count = 1 + self
            .rng
            .next_bounded(u64::from(self.config.max_actions_per_round.max(1)));
        for _ in 0..count {
            let action = self.world.choose(&mut self.rng);
            let in_flight = !self.store.pending_collections().is_empty();
            match action {
                Action::SignIn { user } => {
                    if self.world.signed_in() != Some(user) {
                        // A new principal restarts sync with fresh snapshots.
                        self.stale.clear();
                        if in_flight {
                            self.teardowns_in_flight += 1;
                        }
                    }
                }
                Action::SignOut => {
                    if in_flight && self.world.signed_in().is_some() {
                        self.teardowns_in_flight += 1;
                    }
                }
                _ => {}
            }
            debug!(round = self.round, %action, "world action");
            let touched = self.world.perform(action, &mut self.rng)?;
            if let Some(collection) = touched {
                self.stale.remove(&collection);
            }
            self.record(TraceEventKind::Action { action });
        }
        Ok(())
    }

    fn release(&mut self) {
        if let Some(Release::StreamError { collection }) =
            self.scheduler.maybe_break(&self.store, &mut self.rng)
        {
            self.stream_errors += 1;
            self.stale.insert(collection);
            self.record(TraceEventKind::StreamError {
                collection: collection.to_string(),
            });
        }
        for release in self.scheduler.release_round(&self.store, &mut self.rng) {
            if let Release::Delivered {
                collection,
                duplicated,
            } = release
            {
                if duplicated {
                    self.duplicates += 1;
                }
                self.record(TraceEventKind::Delivered {
                    collection: collection.to_string(),
                    duplicated,
                });
            }
        }
    }

    fn apply_some(&mut self) {
        let budget = self
            .rng
            .next_bounded(u64::from(self.config.max_applies_per_round) + 1);
        for _ in 0..budget {
            if !self.apply_one() {
                break;
            }
        }
    }

    fn apply_one(&mut self) -> bool {
        if !self.session.pump_one() {
            return false;
        }
        self.oracle.check_step(&self.session);
        let view = self.session.view();
        let kind = TraceEventKind::Applied {
            principal: self.session.principal().map(|p| p.id.to_string()),
            loading: self.session.loading(),
            boards: view.boards.len(),
            tickets: view.tickets.len(),
        };
        self.record(kind);
        true
    }

    /// Release and apply everything still queued. Applying can queue more
    /// (profile repairs, restarted subscriptions), so loop until both the
    /// store and the session are idle.
    fn drain(&mut self) -> Result<()> {
        for _ in 0..MAX_DRAIN_PASSES {
            let delivered = self.store.deliver_all();
            let mut applied = 0;
            while self.apply_one() {
                applied += 1;
            }
            if delivered == 0 && applied == 0 {
                return Ok(());
            }
        }
        bail!(
            "seed {}: queues still busy after {MAX_DRAIN_PASSES} drain passes",
            self.config.seed
        )
    }
}
