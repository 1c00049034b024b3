//! mcluster - bring up and probe test clusters from the command line.
//!
//! This is the entry point for the `mcluster` binary.
//!
//! # Commands
//!
//! - `mcluster up --variant <v> [--timeout-secs N]` - launch a cluster, print its endpoint,
//!   hold it until Ctrl-C, then tear it down
//! - `mcluster probe --endpoint <url>` - wait for an existing master to become ready

use std::time::Duration;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use mcluster_config::ClusterConfigBuilder;
use mcluster_control::{ClusterSession, HealthState, ReadinessWaiter, SessionSettings};
use mcluster_core::{ClusterId, ScopeKey, Variant};
use mcluster_runner::{Backends, HttpHealthProbe, ProcessSet};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// mcluster - managed test clusters.
#[derive(Parser, Debug)]
#[command(name = "mcluster")]
#[command(author, version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Launch a cluster and hold it until Ctrl-C.
    Up {
        /// Cluster variant to launch.
        #[arg(long, env = "MCLUSTER_VARIANT", default_value = "default")]
        variant: Variant,

        /// How long to wait for the cluster to become ready.
        #[arg(long, env = "MCLUSTER_READY_TIMEOUT_SECS")]
        timeout_secs: Option<u64>,

        /// Print the cluster as JSON instead of just its endpoint.
        #[arg(long, default_value = "false")]
        json: bool,
    },

    /// Wait for an existing master to become ready.
    Probe {
        /// Master API endpoint, e.g. `http://127.0.0.1:8080`.
        #[arg(long, env = "MCLUSTER_ENDPOINT")]
        endpoint: String,

        /// How long to keep probing.
        #[arg(long, default_value_t = 30)]
        timeout_secs: u64,

        /// Spacing between probes.
        #[arg(long, default_value_t = 500)]
        interval_ms: u64,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,mcluster=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    match args.command {
        Command::Up {
            variant,
            timeout_secs,
            json,
        } => up(variant, timeout_secs, json).await,
        Command::Probe {
            endpoint,
            timeout_secs,
            interval_ms,
        } => probe(&endpoint, timeout_secs, interval_ms).await,
    }
}

async fn up(variant: Variant, timeout_secs: Option<u64>, json: bool) -> anyhow::Result<()> {
    let mut settings = SessionSettings::from_env();
    if let Some(secs) = timeout_secs {
        settings.manager.ready_timeout_secs = secs;
    }

    let session = ClusterSession::start(settings, Backends::from_env().await);
    let key = ScopeKey::session(variant);
    tracing::info!(scope_key = %key, session_id = %session.id(), "Bringing cluster up");

    // The acquire future is dropped before teardown so its per-key gate is released.
    let acquired = tokio::select! {
        result = session.manager().acquire(&key) => Some(result),
        _ = tokio::signal::ctrl_c() => None,
    };
    let Some(acquired) = acquired else {
        tracing::info!("Interrupted during launch");
        session.finish().await;
        return Ok(());
    };

    let handle = match acquired {
        Ok(handle) => handle,
        Err(e) => {
            session.finish().await;
            return Err(e).with_context(|| format!("could not bring up {variant} cluster"));
        }
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&handle.snapshot())?);
    } else {
        println!("{}", handle.endpoint());
    }
    tracing::info!(
        cluster_id = %handle.cluster_id().short(),
        endpoint = %handle.endpoint(),
        "Cluster ready; press Ctrl-C to tear down"
    );

    let signal = tokio::signal::ctrl_c().await;
    let stopped = session.finish().await;
    tracing::info!(clusters_stopped = stopped, "Cluster torn down");

    signal.context("failed to listen for Ctrl-C")
}

async fn probe(endpoint: &str, timeout_secs: u64, interval_ms: u64) -> anyhow::Result<()> {
    if interval_ms == 0 {
        bail!("--interval-ms must be greater than zero");
    }

    // The probe only reads the endpoint; the rest describes a placeholder cluster.
    let config = ClusterConfigBuilder::default().build(Variant::Default)?;
    let cluster_id = ClusterId::generate(&ScopeKey::test("probe", Variant::Default));
    let processes = ProcessSet::new(cluster_id, config, endpoint);

    let interval = Duration::from_millis(interval_ms);
    let state = ReadinessWaiter::new(interval)
        .wait_until_ready(
            &HttpHealthProbe::new(interval),
            &processes,
            Duration::from_secs(timeout_secs),
        )
        .await;

    match state {
        HealthState::Ready => {
            println!("{endpoint} is ready");
            Ok(())
        }
        other => bail!("{endpoint} is {other} after {timeout_secs}s"),
    }
}
