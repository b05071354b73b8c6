#![forbid(unsafe_code)]

use anyhow::{Result, bail};
use clap::Parser;
use tickboard_sim::campaign::{CampaignConfig, replay_seed, run_campaign};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "Deterministic simulation campaigns for tickboard sessions",
    long_about = None
)]
struct Cli {
    /// First seed to run.
    #[arg(long, default_value_t = 0)]
    start_seed: u64,

    /// Number of seeds.
    #[arg(long, default_value_t = 100)]
    seeds: u64,

    /// Rounds per seed.
    #[arg(long, default_value_t = 40)]
    rounds: u64,

    /// Simulated accounts per seed.
    #[arg(long, default_value_t = 4)]
    users: usize,

    /// Chance (percent) that a stream reports an error each round.
    #[arg(long)]
    stream_errors: Option<u8>,

    /// Replay a single seed and print its trace.
    #[arg(long)]
    replay: Option<u64>,

    /// Emit JSON instead of text.
    #[arg(long)]
    json: bool,
}

impl Cli {
    fn campaign(&self) -> CampaignConfig {
        let mut config = CampaignConfig {
            seed_range: self.start_seed..self.start_seed.saturating_add(self.seeds),
            users: self.users,
            rounds: self.rounds,
            ..CampaignConfig::default()
        };
        if let Some(rate) = self.stream_errors {
            config.fault.stream_error_rate_percent = rate;
        }
        config
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_env("TICKBOARD_LOG")
        .unwrap_or_else(|_| EnvFilter::new("tickboard=info,warn"));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().compact().with_writer(std::io::stderr))
        .init();
}

fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let config = cli.campaign();

    if let Some(seed) = cli.replay {
        let result = replay_seed(seed, &config)?;
        if cli.json {
            println!("{}", serde_json::to_string_pretty(&result)?);
        } else {
            for event in &result.trace {
                println!("[{:>3}] {:?}", event.round, event.kind);
            }
            for violation in &result.violations {
                println!("VIOLATION {violation}");
            }
            println!(
                "seed {seed}: steps={} violations={}",
                result.steps_checked,
                result.violations.len()
            );
        }
        if !result.passed() {
            bail!("seed {seed} broke {} invariant(s)", result.violations.len());
        }
        return Ok(());
    }

    let report = run_campaign(&config)?;
    if cli.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!(
            "campaign complete: seeds={} passed={} steps={} interesting={}",
            report.seeds_run,
            report.seeds_passed,
            report.steps_checked,
            report.interesting_states_reached
        );
        for failure in &report.failures {
            println!("seed {} failed:", failure.seed);
            for violation in &failure.violations {
                println!("  {violation}");
            }
        }
    }
    if let Some(seed) = report.first_failure {
        bail!(
            "{} of {} seeds failed, replay with --replay {seed}",
            report.failures.len(),
            report.seeds_run
        );
    }
    Ok(())
}
