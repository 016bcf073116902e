//! Precache smoke harness.
//!
//! Registers a worker for a build manifest against a live origin, fetches a
//! few paths through it and prints a JSON report with timings.
//!
//! ## Usage
//!
//! ```bash
//! # Install into a throwaway in-memory store
//! precache-smoke run --manifest build/manifest.json --origin http://localhost:4173/ \
//!     --path / --path /about
//!
//! # Persist caches, then check what is served with the network gone
//! precache-smoke run --manifest build/manifest.json --origin http://localhost:4173/ \
//!     --cache-dir .precache --path /about --offline
//! ```

use std::cell::RefCell;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use async_trait::async_trait;
use clap::{Parser, Subcommand};
use precache_common::{init_logging, LogConfig, LogFormat};
use precache_net::{Fetched, Fetcher, NetError, Request, ResourceLoader};
use precache_sw::{
    BuildManifest, CacheLifecycleHandler, FetchDisposition, HostEvent, ServiceWorkerHost,
    StorageConfig, WorkerConfig,
};
use serde_json::json;
use tracing::{error, info};
use url::Url;

#[derive(Parser)]
#[command(name = "precache-smoke")]
#[command(about = "Smoke harness for the precache worker")]
struct Cli {
    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Log format: pretty, compact or json
    #[arg(long, default_value = "compact", global = true)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Install a worker and fetch paths through it
    Run {
        /// Build manifest (JSON)
        #[arg(short, long)]
        manifest: PathBuf,
        /// Origin the assets are served from; also the worker scope
        #[arg(short, long)]
        origin: Url,
        /// Persist caches here instead of in memory
        #[arg(long)]
        cache_dir: Option<PathBuf>,
        /// Paths to fetch once the worker controls the scope
        #[arg(short, long = "path")]
        paths: Vec<String>,
        /// Fetch the paths with the network disabled
        #[arg(long)]
        offline: bool,
        /// Also write the report here
        #[arg(long)]
        report: Option<PathBuf>,
    },
}

/// Performance timing collector for tracking operation durations.
struct PerfTiming {
    timings: RefCell<HashMap<&'static str, Vec<Duration>>>,
}

impl PerfTiming {
    fn new() -> Self {
        Self {
            timings: RefCell::new(HashMap::new()),
        }
    }

    fn record(&self, operation: &'static str, duration: Duration) {
        self.timings
            .borrow_mut()
            .entry(operation)
            .or_default()
            .push(duration);
    }

    fn summary(&self) -> serde_json::Value {
        let round = |ms: f64| (ms * 100.0).round() / 100.0;
        let mut summary = serde_json::Map::new();

        for (op, durations) in self.timings.borrow().iter() {
            if durations.is_empty() {
                continue;
            }
            let millis: Vec<f64> = durations.iter().map(|d| d.as_secs_f64() * 1000.0).collect();
            let total_ms: f64 = millis.iter().sum();
            let min_ms = millis.iter().copied().fold(f64::INFINITY, f64::min);
            let max_ms = millis.iter().copied().fold(f64::NEG_INFINITY, f64::max);

            summary.insert(
                op.to_string(),
                json!({
                    "count": millis.len(),
                    "total_ms": round(total_ms),
                    "avg_ms": round(total_ms / millis.len() as f64),
                    "min_ms": round(min_ms),
                    "max_ms": round(max_ms),
                }),
            );
        }

        serde_json::Value::Object(summary)
    }
}

/// Wraps the live loader so `--offline` can cut it off after install.
struct Switchable {
    inner: ResourceLoader,
    offline: AtomicBool,
}

#[async_trait]
impl Fetcher for Switchable {
    async fn fetch(&self, request: &Request) -> Result<Fetched, NetError> {
        if self.offline.load(Ordering::Relaxed) {
            return Err(NetError::RequestFailed("network disabled".to_string()));
        }
        self.inner.fetch(request).await
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(LogConfig::from_verbosity(cli.verbose).with_format(cli.log_format))?;

    match cli.command {
        Commands::Run {
            manifest,
            origin,
            cache_dir,
            paths,
            offline,
            report,
        } => {
            let summary = run(manifest, origin, cache_dir, paths, offline).await?;
            let rendered = serde_json::to_string_pretty(&summary)?;
            println!("{rendered}");
            if let Some(path) = report {
                tokio::fs::write(&path, &rendered)
                    .await
                    .with_context(|| format!("writing report to {}", path.display()))?;
                info!(path = %path.display(), "Report written");
            }
        }
    }

    Ok(())
}

async fn run(
    manifest_path: PathBuf,
    origin: Url,
    cache_dir: Option<PathBuf>,
    paths: Vec<String>,
    offline: bool,
) -> anyhow::Result<serde_json::Value> {
    let perf = PerfTiming::new();

    let manifest = BuildManifest::from_path(&manifest_path)
        .await
        .with_context(|| format!("loading manifest {}", manifest_path.display()))?;

    let mut config = WorkerConfig::new(origin);
    config.storage = match cache_dir {
        Some(path) => StorageConfig::Disk { path },
        None => StorageConfig::Memory,
    };
    let caches = config.build_storage().await?;

    let fetcher = Arc::new(Switchable {
        inner: ResourceLoader::new(config.loader_config())?,
        offline: AtomicBool::new(false),
    });
    let handler =
        CacheLifecycleHandler::from_manifest(&config, &manifest, caches.clone(), fetcher.clone())?;
    let cache_name = handler.cache_name().to_string();
    let asset_count = handler.assets().len();

    let (host, mut events) = ServiceWorkerHost::new(config.scope.clone());

    let started = Instant::now();
    let worker = host.register(handler).await.context("install failed")?;
    perf.record("register", started.elapsed());
    info!(worker = %worker, cache = %cache_name, assets = asset_count, "Worker registered");

    let mut pruned = Vec::new();
    while let Ok(event) = events.try_recv() {
        if let HostEvent::CachesPruned { deleted, .. } = event {
            pruned.extend(deleted);
        }
    }

    if offline {
        fetcher.offline.store(true, Ordering::Relaxed);
    }

    let mut fetches = Vec::new();
    for path in &paths {
        let url = config.scope.join(path)?;
        let started = Instant::now();
        let outcome = host.handle_fetch(&Request::get(url.clone())).await;
        perf.record("fetch", started.elapsed());

        fetches.push(match outcome {
            Ok(FetchDisposition::Respond(response)) => json!({
                "url": url.as_str(),
                "status": response.status.as_u16(),
                "bytes": response.body.len(),
                "from_cache": response.from_cache,
            }),
            Ok(FetchDisposition::Passthrough) => json!({
                "url": url.as_str(),
                "passthrough": true,
            }),
            Err(e) => {
                error!(url = %url, error = %e, "Fetch failed");
                json!({ "url": url.as_str(), "error": e.to_string() })
            }
        });
    }

    let started = Instant::now();
    host.flush().await;
    perf.record("flush", started.elapsed());

    Ok(json!({
        "worker": worker.to_string(),
        "cache": cache_name,
        "assets": asset_count,
        "pruned": pruned,
        "caches": caches.keys().await?,
        "offline": offline,
        "fetches": fetches,
        "timings": perf.summary(),
    }))
}
