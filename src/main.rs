//! Spotproxy - spot-instance proxy fleet orchestration
//!
//! ## Usage
//!
//! ```bash
//! # Run one or more rejuvenation experiments from config files
//! spotproxy run --config liveip.json --config instance.json
//!
//! # Show the current ranked spot price catalog
//! spotproxy prices --per-interface --top 20
//!
//! # Show the secondary retail feed for comparison
//! spotproxy prices --retail
//!
//! # Last-resort sweep: terminate every instance, release every address
//! spotproxy nuke --force --exclude i-0123456789abcdef0
//! ```

use clap::{Parser, Subcommand};
use spotproxy_orchestrator::{
    CloudGateway, CredentialRefresher, Ec2Gateway, ExperimentConfig, PingProber,
    PriceFilter, Reachability, RejuvenationExperiment, RetailPriceFeed, RetryPolicy, Session,
    SortKey, StatusRegistry, catalog,
    credentials::{AssumeRoleRefresher, NoopRefresher},
    gateway,
};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Spotproxy: spot-instance proxy fleet acquisition and rejuvenation
#[derive(Parser)]
#[command(name = "spotproxy")]
#[command(about = "Spot-instance proxy fleet acquisition and rejuvenation", long_about = None)]
struct Cli {
    /// AWS region (config files may override per experiment)
    #[arg(long, global = true, default_value = spotproxy_orchestrator::DEFAULT_REGION)]
    region: String,

    /// Directory for daily-rotated log files (stdout only when unset)
    #[arg(long, global = true)]
    log_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run rejuvenation experiments, one concurrent task per config file
    Run {
        /// Experiment config file (JSON); repeat for concurrent experiments
        #[arg(long, required = true)]
        config: Vec<PathBuf>,

        /// Override the target proxy capacity of every loaded config
        #[arg(long)]
        proxy_count: Option<u32>,

        /// Override the experiment duration (minutes) of every loaded config
        #[arg(long)]
        duration_min: Option<u64>,

        /// Override the rejuvenation period (seconds) of every loaded config
        #[arg(long)]
        period_secs: Option<u64>,

        /// Assume this role before each tick's mutations
        #[arg(long)]
        assume_role_arn: Option<String>,

        /// Credentials-file profile the assumed role is written to
        #[arg(long, default_value = "default")]
        profile: String,
    },

    /// Show the ranked spot price catalog
    Prices {
        /// Rank by price per interface instead of raw spot price
        #[arg(long)]
        per_interface: bool,

        /// Minimum spot price (inclusive)
        #[arg(long)]
        min_cost: Option<f64>,

        /// Maximum spot price (inclusive)
        #[arg(long)]
        max_cost: Option<f64>,

        /// Rows to print
        #[arg(long, default_value_t = 20)]
        top: usize,

        /// Show the secondary retail feed instead of the spot catalog
        #[arg(long)]
        retail: bool,
    },

    /// Terminate every running instance and release every address in the
    /// region (best-effort sweep)
    Nuke {
        /// Instance ids to spare
        #[arg(long)]
        exclude: Vec<String>,

        /// Confirm: without this flag the sweep refuses to run
        #[arg(long)]
        force: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "spotproxy_orchestrator=info,info".into());
    // The guard must outlive every write to the file layer
    let _file_guard = match &cli.log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "spotproxy.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::registry()
                .with(filter)
                .with(tracing_subscriber::fmt::layer())
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_ansi(false)
                        .with_writer(writer),
                )
                .init();
            Some(guard)
        }
        None => {
            tracing_subscriber::registry()
                .with(filter)
                .with(tracing_subscriber::fmt::layer())
                .init();
            None
        }
    };

    match cli.command {
        Commands::Run {
            config,
            proxy_count,
            duration_min,
            period_secs,
            assume_role_arn,
            profile,
        } => {
            run_experiments(
                config,
                proxy_count,
                duration_min,
                period_secs,
                assume_role_arn,
                profile,
            )
            .await
        }
        Commands::Prices {
            per_interface,
            min_cost,
            max_cost,
            top,
            retail,
        } => show_prices(cli.region, per_interface, min_cost, max_cost, top, retail).await,
        Commands::Nuke { exclude, force } => nuke(cli.region, exclude, force).await,
    }
}

async fn run_experiments(
    paths: Vec<PathBuf>,
    proxy_count: Option<u32>,
    duration_min: Option<u64>,
    period_secs: Option<u64>,
    assume_role_arn: Option<String>,
    profile: String,
) -> anyhow::Result<()> {
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn({
        let shutdown_tx = shutdown_tx.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("interrupt received, draining experiments");
                let _ = shutdown_tx.send(true);
            }
        }
    });

    let mut workers = Vec::with_capacity(paths.len());
    for path in &paths {
        let mut config = ExperimentConfig::from_file(path)?;
        if let Some(count) = proxy_count {
            config.proxy_count = count;
        }
        if let Some(minutes) = duration_min {
            config.experiment_duration_min = minutes;
        }
        if let Some(secs) = period_secs {
            config.rejuvenation_period_secs = secs;
        }
        config.validate()?;

        let gateway: Arc<dyn CloudGateway> =
            Arc::new(Ec2Gateway::connect(Session::new(config.region.clone())).await);
        let prober: Arc<dyn Reachability> = Arc::new(PingProber::new());
        let refresher: Arc<dyn CredentialRefresher> = match &assume_role_arn {
            Some(role_arn) => Arc::new(AssumeRoleRefresher::new(
                role_arn.clone(),
                format!("{}-refresh", config.experiment_name),
                profile.clone(),
            )),
            None => Arc::new(NoopRefresher),
        };

        let name = config.experiment_name.clone();
        let experiment = RejuvenationExperiment::new(
            gateway,
            prober,
            refresher,
            config,
            StatusRegistry::new(),
            shutdown_rx.clone(),
        );
        workers.push((name, tokio::spawn(experiment.run())));
    }

    let mut failed = false;
    for (name, handle) in workers {
        match handle.await? {
            Ok(outcome) => {
                info!(
                    experiment = %name,
                    rejuvenations = outcome.rejuvenations,
                    instances = outcome.records.len(),
                    "experiment finished"
                );
                println!("{name}: {}", serde_json::to_string_pretty(&outcome.report)?);
            }
            Err(err) => {
                error!(experiment = %name, error = %err, "experiment failed");
                failed = true;
            }
        }
    }
    if failed {
        anyhow::bail!("one or more experiments failed");
    }
    Ok(())
}

async fn show_prices(
    region: String,
    per_interface: bool,
    min_cost: Option<f64>,
    max_cost: Option<f64>,
    top: usize,
    retail: bool,
) -> anyhow::Result<()> {
    let filter = PriceFilter {
        min_cost,
        max_cost,
        regions: Vec::new(),
    };
    let key = if per_interface {
        SortKey::PricePerInterface
    } else {
        SortKey::SpotPrice
    };

    let catalog = if retail {
        let mut catalog = RetailPriceFeed::new().fetch_catalog().await?;
        catalog.filter(&filter);
        catalog.sort(key);
        catalog
    } else {
        let gateway = Ec2Gateway::connect(Session::new(region)).await;
        catalog::fetch(&gateway, &RetryPolicy::default(), &filter, key).await?
    };

    println!(
        "{:<14} {:<20} {:>4} {:>12} {:>14}",
        "ZONE", "TYPE", "NICS", "SPOT $/HR", "PER-NIC $/HR"
    );
    for quote in catalog.rows().iter().take(top) {
        println!(
            "{:<14} {:<20} {:>4} {:>12.6} {:>14.6}",
            quote.zone,
            quote.instance_type,
            quote.max_network_interfaces,
            quote.spot_price,
            quote.price_per_interface,
        );
    }
    info!(shown = top.min(catalog.len()), total = catalog.len(), "catalog printed");
    Ok(())
}

async fn nuke(region: String, exclude: Vec<String>, force: bool) -> anyhow::Result<()> {
    if !force {
        anyhow::bail!(
            "nuke terminates every running instance and releases every address in {region}; \
             pass --force to confirm"
        );
    }

    let ec2 = Ec2Gateway::connect(Session::new(region.clone())).await;
    let report = gateway::sweep(&ec2, &exclude).await?;
    info!(
        region = %region,
        instances_terminated = report.instances_terminated,
        addresses_released = report.addresses_released,
        failures = report.failures,
        "sweep complete"
    );
    if report.failures > 0 {
        anyhow::bail!("sweep finished with {} failed calls", report.failures);
    }
    Ok(())
}
