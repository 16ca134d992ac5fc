use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use rsd_core::config::{load_config, write_schema_file, Config};
use rsd_core::region::RegionCatalog;
use rsd_core::{
    ControlSurface, Coordinates, DiscoveryOrchestrator, HttpUpstream, RefreshScope,
    RequestScheduler, SubnetLocationTable,
};
use rsd_events::Bus;
use serde_json::{json, Value};
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "rsd", version, about = "Region-aware instance discovery")]
struct Cli {
    /// TOML config file; built-in defaults when omitted
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List every live instance of a collection, classified by region (JSON)
    Discover(DiscoverArgs),
    /// Fetch join details for one instance (JSON)
    Details {
        collection: String,
        instance: String,
    },
    /// Print the region catalog, optionally sorted by distance from a point
    Regions {
        #[arg(long, allow_hyphen_values = true)]
        lat: Option<f64>,
        #[arg(long, allow_hyphen_values = true)]
        lon: Option<f64>,
    },
    /// Write the config JSON schema to a file
    Schema { path: PathBuf },
}

#[derive(Args)]
struct DiscoverArgs {
    collection: String,
    /// Refresh a single region ("all" by default)
    #[arg(long, default_value = RefreshScope::ALL)]
    region: String,
    /// Stream discovery events as JSON lines on stderr while running
    #[arg(long)]
    events: bool,
}

struct Pipeline {
    scheduler: Arc<RequestScheduler>,
    orchestrator: Arc<DiscoveryOrchestrator>,
    bus: Bus,
    catalog: RegionCatalog,
}

fn main() -> Result<()> {
    rsd_otel::init();
    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => load_config(path)?,
        None => Config::default(),
    }
    .with_env_overrides();

    match cli.command {
        Commands::Schema { path } => {
            write_schema_file(&path)
                .with_context(|| format!("writing schema {}", path.display()))?;
            println!("{}", path.display());
            Ok(())
        }
        Commands::Regions { lat, lon } => {
            print_regions(&config.catalog(), lat.zip(lon));
            Ok(())
        }
        Commands::Discover(args) => runtime()?.block_on(discover(&config, args)),
        Commands::Details {
            collection,
            instance,
        } => runtime()?.block_on(details(&config, &collection, &instance)),
    }
}

fn runtime() -> Result<tokio::runtime::Runtime> {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("building tokio runtime")
}

fn build_pipeline(config: &Config) -> Result<Pipeline> {
    let upstream = Arc::new(HttpUpstream::new(config.http())?);
    let scheduler = Arc::new(RequestScheduler::new(
        config.scheduler(),
        upstream.clone(),
        upstream.rule(),
    ));
    let table = match config.subnet_table_path() {
        Some(path) => SubnetLocationTable::load(&path),
        None => {
            warn!("no subnet table configured; every instance will be unknown");
            SubnetLocationTable::empty()
        }
    };
    let bus = Bus::default();
    let orchestrator = Arc::new(DiscoveryOrchestrator::new(
        upstream,
        scheduler.clone(),
        Arc::new(table),
        Arc::new(bus.clone()),
        config.discovery(),
    ));
    Ok(Pipeline {
        scheduler,
        orchestrator,
        bus,
        catalog: config.catalog(),
    })
}

async fn discover(config: &Config, args: DiscoverArgs) -> Result<()> {
    let scope: RefreshScope = args.region.parse().map_err(anyhow::Error::msg)?;
    let pipeline = build_pipeline(config)?;
    pipeline.scheduler.start().await;

    if args.events {
        let mut rx = pipeline.bus.subscribe();
        tokio::spawn(async move {
            while let Ok(env) = rx.recv().await {
                if let Ok(line) = serde_json::to_string(&env) {
                    eprintln!("{line}");
                }
            }
        });
    }

    let refresh = pipeline.orchestrator.refresh(&args.collection, scope);
    let summary = tokio::select! {
        summary = refresh => summary,
        _ = tokio::signal::ctrl_c() => {
            info!("interrupted; rejecting queued work");
            pipeline.scheduler.suspend().await;
            anyhow::bail!("discovery interrupted");
        }
    };
    pipeline.scheduler.suspend().await;

    let snapshot = pipeline.orchestrator.snapshot();
    let regions: Vec<Value> = snapshot
        .region_counts
        .iter()
        .map(|(code, count)| {
            json!({
                "code": code,
                "name": pipeline.catalog.display_name(code.as_str()),
                "instances": count,
                "representative": snapshot.representatives.get(code),
            })
        })
        .collect();
    let nearest = snapshot.client_location.and_then(|loc| {
        pipeline
            .catalog
            .nearest_region(loc)
            .map(|(info, km)| json!({"code": info.code, "distance_km": km.round()}))
    });
    print_json(&json!({
        "summary": summary,
        "regions": regions,
        "nearest_region": nearest,
        "session": snapshot,
        "scheduler": pipeline.scheduler.stats(),
    }))
}

async fn details(config: &Config, collection: &str, instance: &str) -> Result<()> {
    let pipeline = build_pipeline(config)?;
    let control = ControlSurface::new(pipeline.scheduler.clone(), pipeline.orchestrator.clone());
    pipeline.scheduler.start().await;
    let result = control.fetch_details(collection, instance).await;
    pipeline.scheduler.suspend().await;
    match result {
        Ok(details) => print_json(&json!({
            "address": details.address(),
            "client_location": details.client_location(),
            "details": details.raw(),
        })),
        Err(failure) => {
            print_json(&json!({ "error": failure }))?;
            anyhow::bail!("fetch failed with status {}", failure.status)
        }
    }
}

fn print_regions(catalog: &RegionCatalog, origin: Option<(f64, f64)>) {
    let origin = origin.map(|(latitude, longitude)| Coordinates {
        latitude,
        longitude,
    });
    let mut rows: Vec<(f64, Value)> = catalog
        .regions()
        .iter()
        .map(|info| {
            let km = origin
                .map(|o| rsd_core::region::haversine_km(o, info.coordinates))
                .unwrap_or(0.0);
            (
                km,
                json!({
                    "code": info.code,
                    "name": catalog.display_name(info.code),
                    "coordinates": info.coordinates,
                    "distance_km": origin.map(|_| km.round()),
                }),
            )
        })
        .collect();
    if origin.is_some() {
        rows.sort_by(|a, b| a.0.total_cmp(&b.0));
    }
    let rows: Vec<Value> = rows.into_iter().map(|(_, row)| row).collect();
    if let Err(err) = print_json(&Value::Array(rows)) {
        warn!(%err, "failed to print regions");
    }
}

fn print_json(value: &Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
