//! Campaign runner: many seeds, one report.
//!
//! Runs every seed in a range with shared parameters, records which seeds
//! broke an invariant, and keeps the first failing seed for replay.

use std::ops::Range;

use anyhow::{Result, bail};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::delivery::FaultConfig;
use crate::oracle::InvariantViolation;
use crate::{SimulationConfig, SimulationResult, Simulator};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CampaignConfig {
    /// Seeds to execute, e.g. `0..100`.
    pub seed_range: Range<u64>,
    pub users: usize,
    pub rounds: u64,
    pub max_actions_per_round: u8,
    pub max_applies_per_round: u8,
    pub fault: FaultConfig,
}

impl Default for CampaignConfig {
    fn default() -> Self {
        let sim = SimulationConfig::default();
        Self {
            seed_range: 0..100,
            users: sim.users,
            rounds: sim.rounds,
            max_actions_per_round: sim.max_actions_per_round,
            max_applies_per_round: sim.max_applies_per_round,
            fault: sim.fault,
        }
    }
}

impl CampaignConfig {
    #[must_use]
    pub const fn sim_config_for_seed(&self, seed: u64) -> SimulationConfig {
        SimulationConfig {
            seed,
            users: self.users,
            rounds: self.rounds,
            max_actions_per_round: self.max_actions_per_round,
            max_applies_per_round: self.max_applies_per_round,
            fault: self.fault,
        }
    }

    /// # Errors
    ///
    /// Returns an error if any parameter is out of range.
    pub fn validate(&self) -> Result<()> {
        if self.seed_range.is_empty() {
            bail!("seed_range must not be empty");
        }
        if self.users < 2 {
            bail!("users must be >= 2");
        }
        if self.rounds == 0 {
            bail!("rounds must be > 0");
        }
        if self.fault.release_rate_percent == 0 {
            bail!("release_rate_percent must be > 0 or nothing is ever delivered mid-run");
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeedFailure {
    pub seed: u64,
    pub violations: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CampaignReport {
    pub seeds_run: usize,
    pub seeds_passed: usize,
    /// First failing seed, replay this one first.
    pub first_failure: Option<u64>,
    pub failures: Vec<SeedFailure>,
    pub steps_checked: usize,
    /// Seeds that tore a session down with pushes in flight while also
    /// seeing duplicates or stream errors.
    pub interesting_states_reached: usize,
}

impl CampaignReport {
    #[must_use]
    pub fn all_passed(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Run every seed in the campaign.
///
/// # Errors
///
/// Returns an error for an invalid config or when a simulation itself
/// fails (as opposed to finding a violation).
pub fn run_campaign(config: &CampaignConfig) -> Result<CampaignReport> {
    config.validate()?;

    let mut report = CampaignReport {
        seeds_run: 0,
        seeds_passed: 0,
        first_failure: None,
        failures: Vec::new(),
        steps_checked: 0,
        interesting_states_reached: 0,
    };

    for seed in config.seed_range.clone() {
        let result = run_seed(seed, config)?;
        report.seeds_run += 1;
        report.steps_checked += result.steps_checked;
        if result.interesting_state_reached {
            report.interesting_states_reached += 1;
        }
        if result.passed() {
            report.seeds_passed += 1;
        } else {
            warn!(seed, violations = result.violations.len(), "seed failed");
            report.first_failure.get_or_insert(seed);
            report.failures.push(SeedFailure {
                seed,
                violations: result.violations.iter().map(ToString::to_string).collect(),
            });
        }
    }
    Ok(report)
}

/// Run one seed. The inner result separates a pass from violations.
///
/// # Errors
///
/// Returns an error when the simulation itself fails.
pub fn run_single_seed(
    seed: u64,
    config: &CampaignConfig,
) -> Result<std::result::Result<(), Vec<InvariantViolation>>> {
    let result = run_seed(seed, config)?;
    if result.passed() {
        Ok(Ok(()))
    } else {
        Ok(Err(result.violations))
    }
}

/// Replay one seed and return the full trace.
///
/// # Errors
///
/// Returns an error for an invalid config or a failed simulation.
pub fn replay_seed(seed: u64, config: &CampaignConfig) -> Result<SimulationResult> {
    config.validate()?;
    run_seed(seed, config)
}

fn run_seed(seed: u64, config: &CampaignConfig) -> Result<SimulationResult> {
    Simulator::new(config.sim_config_for_seed(seed))?.run()
}
