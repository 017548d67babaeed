use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};
use tokio::signal;
use tracing::info;
use tracing_subscriber::EnvFilter;

use turnstile::clock::{ManualClock, SystemClock};
use turnstile::config::TurnstileConfig;
use turnstile::quota::InMemoryQuotaOracle;
use turnstile::ratelimit::{AdmissionBackend, Decision, InvitationDenied, LimiterKey, Outcome, RejectReason};
use turnstile::AdmissionControl;

#[derive(Debug, Parser)]
#[command(name = "turnstile", version, about = "Multi-tier admission control")]
struct Cli {
    /// Configuration file (YAML). TURNSTILE__* variables override it.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Emit logs as JSON
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Validate the configuration and print the effective values
    CheckConfig,

    /// Build every limiter and run the idle sweeper until shutdown
    Run,

    /// Drive one limiter with synthetic requests and print a summary
    Simulate {
        /// Limiter to drive
        #[arg(long, value_enum, default_value_t = Tier::Client)]
        tier: Tier,

        /// Client address, user, or organization the requests come from
        #[arg(long, default_value = "10.0.0.1")]
        key: String,

        /// Method name for the method tier
        #[arg(long, default_value = "/turnstile.Demo/Call")]
        method: String,

        /// Organization for the invitation tier
        #[arg(long, default_value = "org-1")]
        org: String,

        /// Number of requests
        #[arg(short = 'n', long, default_value_t = 20)]
        requests: u32,

        /// Simulated time between requests, in milliseconds
        #[arg(long, default_value_t = 0)]
        interval_ms: u64,

        /// Load factor reported before the adaptive tier runs
        #[arg(long)]
        load_factor: Option<f64>,

        /// Hourly ceiling the in-memory oracle reports
        #[arg(long)]
        ceiling: Option<u64>,

        /// Make the in-memory oracle fail every call
        #[arg(long)]
        oracle_down: bool,

        /// Report this many failures to the breaker before the run
        #[arg(long, default_value_t = 0)]
        failures: u32,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Tier {
    Client,
    User,
    Method,
    Organization,
    Adaptive,
    Breaker,
    Invitation,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.json_logs);

    let config = TurnstileConfig::load(cli.config.as_deref()).context("Failed to load configuration")?;

    match cli.command {
        Command::CheckConfig => {
            config.validate().context("Invalid configuration")?;
            print!("{}", config.to_yaml()?);
            info!("Configuration is valid");
        }
        Command::Run => run(config).await?,
        Command::Simulate {
            tier,
            key,
            method,
            org,
            requests,
            interval_ms,
            load_factor,
            ceiling,
            oracle_down,
            failures,
        } => {
            let clock = ManualClock::new();
            let oracle = Arc::new(InMemoryQuotaOracle::new(config.organization.default_calls_per_hour));
            if let Some(ceiling) = ceiling {
                oracle.set_ceiling(&key, ceiling);
            }
            oracle.set_failing(oracle_down);

            let control = AdmissionControl::new(config, oracle, Arc::new(clock.clone()))?;
            if let Some(factor) = load_factor {
                control.adaptive().update_load_factor(factor)?;
            }
            for _ in 0..failures {
                control.breaker().record_outcome(&Outcome::failure("simulated failure"));
            }

            let backend: Option<(&dyn AdmissionBackend, LimiterKey)> = match tier {
                Tier::Client => Some((&**control.clients() as &dyn AdmissionBackend, LimiterKey::client(&key))),
                Tier::User => Some((&**control.users() as &dyn AdmissionBackend, LimiterKey::user(&key))),
                Tier::Organization => Some((
                    control.organizations() as &dyn AdmissionBackend,
                    LimiterKey::organization(&key),
                )),
                Tier::Adaptive => Some((control.adaptive() as &dyn AdmissionBackend, LimiterKey::client(&key))),
                Tier::Breaker => Some((control.breaker() as &dyn AdmissionBackend, LimiterKey::client(&key))),
                Tier::Method | Tier::Invitation => None,
            };

            let mut summary = Summary::default();
            for _ in 0..requests {
                match (&backend, tier) {
                    (Some((backend, limiter_key)), _) => summary.record(backend.admit(limiter_key).await),
                    (None, Tier::Invitation) => {
                        summary.record_invitation(control.invitations().check_both(&key, &org))
                    }
                    (None, _) => summary.record(control.check_method(&method, &key)),
                }
                clock.advance(Duration::from_millis(interval_ms));
            }

            summary.print();
        }
    }

    Ok(())
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);

    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

async fn run(config: TurnstileConfig) -> anyhow::Result<()> {
    info!("Starting Turnstile admission control");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let oracle = Arc::new(InMemoryQuotaOracle::new(config.organization.default_calls_per_hour));
    let control = AdmissionControl::new(config, oracle, Arc::new(SystemClock))?;
    let sweeper = control.start_sweeper();

    shutdown_signal().await;

    sweeper.shutdown().await;
    info!("Turnstile stopped");
    Ok(())
}

#[derive(Debug, Default)]
struct Summary {
    admitted: u32,
    rejected: Vec<(&'static str, u32)>,
    last_rejection: Option<Decision>,
}

impl Summary {
    fn record(&mut self, decision: Decision) {
        match decision.reason {
            None => self.admitted += 1,
            Some(reason) => {
                self.bump(reason.as_str());
                self.last_rejection = Some(decision);
            }
        }
    }

    fn record_invitation(&mut self, result: Result<(), InvitationDenied>) {
        match result {
            Ok(()) => self.admitted += 1,
            Err(InvitationDenied::User) => self.bump("user_invitation_limit"),
            Err(InvitationDenied::Organization) => self.bump("org_invitation_limit"),
        }
    }

    fn bump(&mut self, reason: &'static str) {
        match self.rejected.iter_mut().find(|(r, _)| *r == reason) {
            Some((_, count)) => *count += 1,
            None => self.rejected.push((reason, 1)),
        }
    }

    fn print(&self) {
        println!("admitted: {}", self.admitted);
        for (reason, count) in &self.rejected {
            println!("rejected ({}): {}", reason, count);
        }

        if let Some(decision) = &self.last_rejection {
            println!("last rejection headers:");
            for (name, value) in decision.headers() {
                println!("  {}: {}", name, value);
            }
            if let Some(body) = decision.throttle_response() {
                match body.to_json() {
                    Ok(json) => println!("last rejection body: {}", json),
                    Err(e) => eprintln!("failed to render rejection body: {}", e),
                }
            }
            if decision.reason == Some(RejectReason::QuotaUnavailable) {
                println!("quota oracle was unavailable and fail_open is disabled");
            }
        }
    }
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown");
        }
    }
}
