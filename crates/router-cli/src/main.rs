//! Ensemble router CLI
//!
//! Loads a router config, builds HTTP adapters for every provider with a
//! resolved credential, and runs one command against the ensemble.
//!
//! # Usage
//!
//! ```bash
//! # Ensemble decision for one market snapshot
//! OPENAI_API_KEY=... router-cli --config router.toml decide BTC-USD \
//!     --price 42000 --volume 1500 --volatility 0.012 --trend bullish
//!
//! # Single best provider, high priority, 5s deadline
//! router-cli decide ETH-USD --price 2300 --volume 900 --single --priority high --timeout-ms 5000
//!
//! # Probe every provider
//! RUST_LOG=debug router-cli health
//! ```

mod adapters;
mod config;

use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use ensemble_router::{DecisionRequest, EnsembleService, MarketSnapshot, Priority, Trend};
use tracing::{info, warn};

use config::RouterSettings;

/// Command-line arguments
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the router TOML config
    #[arg(long, default_value = "router.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Route one decision request and print the result as JSON
    Decide(DecideArgs),
    /// Probe every configured provider
    Health,
    /// Validate the config and print the resolved settings
    CheckConfig,
}

#[derive(clap::Args, Debug)]
struct DecideArgs {
    /// Market symbol, e.g. BTC-USD
    symbol: String,

    #[arg(long)]
    price: f64,

    #[arg(long)]
    volume: f64,

    /// Volatility as a fraction of price
    #[arg(long, default_value_t = 0.02)]
    volatility: f64,

    #[arg(long, value_enum, default_value_t = TrendArg::Sideways)]
    trend: TrendArg,

    #[arg(long)]
    support: Option<f64>,

    #[arg(long)]
    resistance: Option<f64>,

    /// Ask the single best provider instead of the ensemble
    #[arg(long, default_value_t = false)]
    single: bool,

    #[arg(long, value_enum, default_value_t = PriorityArg::Medium)]
    priority: PriorityArg,

    /// Overall deadline (overrides ensemble.default_timeout_ms)
    #[arg(long)]
    timeout_ms: Option<u64>,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum TrendArg {
    Bullish,
    Bearish,
    Sideways,
}

impl From<TrendArg> for Trend {
    fn from(trend: TrendArg) -> Self {
        match trend {
            TrendArg::Bullish => Trend::Bullish,
            TrendArg::Bearish => Trend::Bearish,
            TrendArg::Sideways => Trend::Sideways,
        }
    }
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum PriorityArg {
    Low,
    Medium,
    High,
}

impl From<PriorityArg> for Priority {
    fn from(priority: PriorityArg) -> Self {
        match priority {
            PriorityArg::Low => Priority::Low,
            PriorityArg::Medium => Priority::Medium,
            PriorityArg::High => Priority::High,
        }
    }
}

impl DecideArgs {
    fn into_request(self) -> DecisionRequest {
        let snapshot = MarketSnapshot {
            price: self.price,
            volume: self.volume,
            volatility: self.volatility,
            trend: self.trend.into(),
            support: self.support,
            resistance: self.resistance,
        };
        let mut request =
            DecisionRequest::new(self.symbol, snapshot).with_priority(self.priority.into());
        if self.single {
            request = request.single();
        }
        if let Some(timeout_ms) = self.timeout_ms {
            request = request.with_timeout_ms(timeout_ms);
        }
        request
    }
}

fn build_service(settings: &RouterSettings) -> Result<EnsembleService> {
    if settings.providers.is_empty() {
        bail!("No usable providers: configure at least one with a resolved credential");
    }
    let adapters = adapters::build_adapters(
        &settings.providers,
        settings.ensemble.ensemble.per_call_timeout(),
    )?;
    EnsembleService::builder(settings.ensemble.clone())
        .providers(adapters)
        .build()
        .context("Failed to build ensemble service")
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let settings = RouterSettings::load(&args.config)?;
    if !settings.missing_credentials.is_empty() {
        warn!(
            providers = ?settings.missing_credentials,
            "Some providers were skipped for missing credentials"
        );
    }
    info!(
        config = %args.config.display(),
        providers = settings.providers.len(),
        "Router starting"
    );

    match args.command {
        Command::Decide(decide) => {
            let service = build_service(&settings)?;
            let decision = service
                .decide(decide.into_request())
                .await
                .context("Decision cycle failed")?;
            println!("{}", serde_json::to_string_pretty(&decision)?);
        }
        Command::Health => {
            let service = build_service(&settings)?;
            let reports = service.run_health_checks().await;
            println!("{}", serde_json::to_string_pretty(&reports)?);
            if reports.iter().all(|r| !r.healthy) {
                bail!("No provider passed its health check");
            }
        }
        Command::CheckConfig => {
            let summary = serde_json::json!({
                "ensemble": &settings.ensemble.ensemble,
                "providers": settings
                    .providers
                    .iter()
                    .map(|p| p.config.id.clone())
                    .collect::<Vec<_>>(),
                "missing_credentials": &settings.missing_credentials,
            });
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
    }

    Ok(())
}
