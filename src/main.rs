//! fleet-admin - administration CLI for a school transport fleet
//!
//! Runs the core services against a local document store persisted as a JSON
//! snapshot file.
//!
//! Module structure:
//! - `domain/` - Core business types (Vehicle, Stop, Guardian, import records)
//! - `io/` - External interfaces (store, identity, CSV, audit, Prometheus)
//! - `services/` - Business logic (cache, stop mutations, provisioning)
//! - `infra/` - Infrastructure (Config, Metrics)

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use fleet_admin::domain::types::{CollectionKind, OperatorId, StopId, VehicleId};
use fleet_admin::infra::{Config, Metrics};
use fleet_admin::io::{
    tabular, AuditSink, JsonlAuditLog, MemoryIdentityProvider, MemoryStore, RemoteStore,
    TracingAuditSink,
};
use fleet_admin::services::directory::{DirectorySettings, NewOperator, NewVehicle};
use fleet_admin::services::live_feed::PositionExtras;
use fleet_admin::services::reference;
use fleet_admin::services::{
    ChangeStreamCache, FleetDirectory, LivePositionFeed, MutationSettings, NewStop,
    OperatorAssignment, PipelineSettings, ProvisioningPipeline, StopListMutator,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::fmt::time::UtcTime;
use tracing_subscriber::EnvFilter;

/// fleet-admin - fleet directory administration
#[derive(Parser, Debug)]
#[command(name = "fleet-admin", version, about)]
struct Args {
    /// Path to TOML configuration file (falls back to CONFIG_FILE, then config/dev.toml)
    #[arg(short, long, global = true)]
    config: Option<String>,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Mirror every collection and log updates until Ctrl+C
    Watch,
    /// Provision guardians from a CSV file
    Import {
        input: PathBuf,
        /// Where to write rejected rows (default: `<input>.errors.csv`)
        #[arg(long)]
        errors: Option<PathBuf>,
    },
    /// Write the bulk-import template
    Template {
        #[arg(default_value = "guardian_template.csv")]
        output: PathBuf,
    },
    /// Write the vehicle/stop reference sheet
    Reference {
        #[arg(default_value = "reference.csv")]
        output: PathBuf,
    },
    /// Insert a stop; appends unless a 1-based position is given
    AddStop {
        #[arg(long)]
        vehicle: String,
        #[arg(long)]
        name: String,
        #[arg(long, allow_hyphen_values = true)]
        lat: f64,
        #[arg(long, allow_hyphen_values = true)]
        lng: f64,
        #[arg(long, allow_hyphen_values = true)]
        position: Option<i64>,
    },
    RemoveStop {
        #[arg(long)]
        vehicle: String,
        #[arg(long)]
        stop: String,
    },
    RenameStop {
        #[arg(long)]
        vehicle: String,
        #[arg(long)]
        stop: String,
        #[arg(long)]
        name: String,
    },
    AddVehicle {
        #[arg(long)]
        number: String,
        #[arg(long, default_value = "")]
        route: String,
        #[arg(long)]
        capacity: Option<u32>,
        #[arg(long)]
        color: Option<String>,
        #[arg(long)]
        operator: Option<String>,
    },
    AddOperator {
        #[arg(long)]
        name: String,
        #[arg(long)]
        phone: String,
        #[arg(long)]
        vehicle: Option<String>,
    },
    /// Assign an operator to a vehicle, or unassign when no vehicle is given
    AssignOperator {
        #[arg(long)]
        operator: String,
        #[arg(long)]
        vehicle: Option<String>,
    },
    /// Search guardians by student name, guardian name or phone
    SearchGuardians {
        #[arg(default_value = "")]
        query: String,
    },
    ReportPosition {
        #[arg(long)]
        vehicle: String,
        #[arg(long, allow_hyphen_values = true)]
        lat: f64,
        #[arg(long, allow_hyphen_values = true)]
        lng: f64,
        #[arg(long)]
        number: Option<String>,
        #[arg(long)]
        operator_name: Option<String>,
    },
    /// Show the live position board
    Positions,
}

/// Shared collaborators for one CLI invocation
struct App {
    config: Config,
    store: Arc<MemoryStore>,
    identity: Arc<MemoryIdentityProvider>,
    audit: Arc<dyn AuditSink>,
    metrics: Arc<Metrics>,
}

impl App {
    fn open(config: Config) -> Result<Self> {
        let store = Arc::new(MemoryStore::load_snapshot(config.store_snapshot_file())?);
        let identity = Arc::new(MemoryIdentityProvider::with_existing(store.login_keys()));
        let audit: Arc<dyn AuditSink> = match config.audit_file() {
            Some(path) => Arc::new(JsonlAuditLog::new(path)),
            None => Arc::new(TracingAuditSink),
        };
        Ok(Self { config, store, identity, audit, metrics: Arc::new(Metrics::new()) })
    }

    fn remote(&self) -> Arc<dyn RemoteStore> {
        self.store.clone()
    }

    fn save(&self) -> Result<()> {
        self.store.save_snapshot(self.config.store_snapshot_file())
    }

    /// Start the cache and wait for the first snapshot of each kind
    async fn synced_cache(&self, kinds: &[CollectionKind]) -> Result<ChangeStreamCache> {
        let cache = ChangeStreamCache::from_config(
            self.remote(),
            self.audit.clone(),
            self.metrics.clone(),
            &self.config,
        );
        cache.init();
        for kind in kinds {
            if !cache.wait_synced(*kind, self.config.import_sync_timeout()).await {
                cache.shutdown().await;
                bail!("timed out waiting for {} snapshot", kind);
            }
        }
        Ok(cache)
    }

    fn mutator(&self) -> StopListMutator {
        StopListMutator::new(
            self.remote(),
            self.audit.clone(),
            self.metrics.clone(),
            MutationSettings::from(&self.config),
        )
    }
}

fn init_logging(json: bool) {
    // Default: INFO, use RUST_LOG=debug for per-call detail
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_timer(UtcTime::rfc_3339())
        .with_target(false);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

/// Watch channel flipped to true on Ctrl+C
fn ctrl_c_channel() -> watch::Receiver<bool> {
    let (tx, rx) = watch::channel(false);
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("shutdown_signal_received");
        let _ = tx.send(true);
    });
    rx
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(args.json_logs);

    info!(git_hash = %env!("GIT_HASH"), "fleet-admin starting");

    let config = match &args.config {
        Some(path) => Config::load_from_path(path),
        None => Config::load(&[]),
    };
    info!(
        config_file = %config.config_file(),
        site_id = %config.site_id(),
        snapshot_file = %config.store_snapshot_file(),
        identity_domain = %config.identity_domain(),
        row_delay_ms = %config.import_row_delay().as_millis(),
        max_attempts = %config.mutation_max_attempts(),
        prometheus_port = %config.prometheus_port(),
        "config_loaded"
    );

    let app = App::open(config)?;
    run(&app, args.command).await
}

async fn run(app: &App, command: Command) -> Result<()> {
    match command {
        Command::Watch => watch_collections(app).await,
        Command::Import { input, errors } => import(app, input, errors).await,
        Command::Template { output } => {
            tabular::write_table(&output, &reference::template_table())?;
            println!("Template written to {}", output.display());
            Ok(())
        }
        Command::Reference { output } => {
            let cache = app.synced_cache(&[CollectionKind::Vehicles]).await?;
            let table = reference::export_from_cache(&cache);
            cache.shutdown().await;
            tabular::write_table(&output, &table)?;
            println!("Reference sheet ({} rows) written to {}", table.len(), output.display());
            Ok(())
        }
        Command::AddStop { vehicle, name, lat, lng, position } => {
            let stop = app
                .mutator()
                .insert_stop(&VehicleId::new(vehicle), NewStop::new(name, lat, lng), position)
                .await?;
            app.save()?;
            println!("Added stop {} ({}) at position {}", stop.name, stop.id, stop.order);
            Ok(())
        }
        Command::RemoveStop { vehicle, stop } => {
            app.mutator().remove_stop(&VehicleId::new(vehicle), &StopId::new(stop)).await?;
            app.save()?;
            println!("Stop removed");
            Ok(())
        }
        Command::RenameStop { vehicle, stop, name } => {
            let stop = app
                .mutator()
                .rename_stop(&VehicleId::new(vehicle), &StopId::new(stop), &name)
                .await?;
            app.save()?;
            println!("Stop {} renamed to {}", stop.id, stop.name);
            Ok(())
        }
        Command::AddVehicle { number, route, capacity, color, operator } => {
            let form = NewVehicle {
                number,
                route_name: route,
                capacity,
                color_code: color,
                operator: operator.map(OperatorId::new),
            };
            let cache = app.synced_cache(&[]).await?;
            let vehicle = directory(app, &cache).create_vehicle(form).await;
            cache.shutdown().await;
            let vehicle = vehicle?;
            app.save()?;
            println!("Added vehicle {} ({})", vehicle.number, vehicle.id);
            Ok(())
        }
        Command::AddOperator { name, phone, vehicle } => {
            let form = NewOperator { name, phone, vehicle: vehicle.map(VehicleId::new) };
            let cache = app.synced_cache(&[]).await?;
            let operator = directory(app, &cache).create_operator(form).await;
            cache.shutdown().await;
            let operator = operator?;
            app.save()?;
            println!(
                "Added operator {} ({}), login {}",
                operator.name, operator.id, operator.login_key
            );
            Ok(())
        }
        Command::AssignOperator { operator, vehicle } => {
            let assignment = OperatorAssignment::new(
                app.remote(),
                app.audit.clone(),
                MutationSettings::from(&app.config),
            );
            let vehicle = vehicle.map(VehicleId::new);
            assignment.assign(&OperatorId::new(operator), vehicle.as_ref()).await?;
            app.save()?;
            println!("Assignment saved");
            Ok(())
        }
        Command::SearchGuardians { query } => {
            let cache = app.synced_cache(&[CollectionKind::Guardians]).await?;
            let found = directory(app, &cache).search_guardians(&query);
            cache.shutdown().await;
            for g in &found {
                println!(
                    "{}\t{}\t{}\t{} / {}",
                    g.student_name, g.name, g.phone, g.vehicle_number, g.stop_name
                );
            }
            println!("{} guardian(s)", found.len());
            Ok(())
        }
        Command::ReportPosition { vehicle, lat, lng, number, operator_name } => {
            let feed = LivePositionFeed::from_config(app.remote(), app.audit.clone(), &app.config);
            let extras = PositionExtras { vehicle_number: number, operator_name };
            feed.report(&VehicleId::new(vehicle), lat, lng, extras).await?;
            app.save()?;
            println!("Position recorded");
            Ok(())
        }
        Command::Positions => {
            let feed = LivePositionFeed::from_config(app.remote(), app.audit.clone(), &app.config);
            let board = feed.board().await?;
            for marker in &board.markers {
                println!(
                    "{}\t{:.5}\t{:.5}\t{}",
                    marker.label, marker.location.lat, marker.location.lng, marker.timestamp
                );
            }
            println!("{}", board.status);
            Ok(())
        }
    }
}

fn directory<'a>(app: &App, cache: &'a ChangeStreamCache) -> FleetDirectory<'a> {
    FleetDirectory::new(
        cache,
        app.remote(),
        app.identity.clone(),
        app.audit.clone(),
        DirectorySettings::from(&app.config),
    )
}

async fn import(app: &App, input: PathBuf, errors: Option<PathBuf>) -> Result<()> {
    let records = tabular::read_records(&input)?;
    if records.is_empty() {
        bail!("{} has no data rows", input.display());
    }

    let cache = app.synced_cache(&[CollectionKind::Vehicles]).await?;
    let cancel = ctrl_c_channel();
    let mut pipeline = ProvisioningPipeline::new(
        &cache,
        app.remote(),
        app.identity.clone(),
        app.audit.clone(),
        app.metrics.clone(),
        PipelineSettings::from(&app.config),
    )
    .with_progress(|p| {
        eprint!(
            "\r{}/{} processed ({} ok, {} failed)",
            p.processed, p.total, p.succeeded, p.failed
        );
    });
    let report = pipeline.run(records, cancel).await;
    eprintln!();
    cache.shutdown().await;

    app.save().context("saving store after import")?;
    app.metrics.report().log();

    if let Some(table) = report.error_report() {
        let path = errors.unwrap_or_else(|| input.with_extension("errors.csv"));
        tabular::write_table(&path, &table)?;
        warn!(path = %path.display(), rows = %table.len(), "import_error_report_written");
        println!("Error report written to {}", path.display());
    }
    println!("{}", report.summary_line());
    Ok(())
}

async fn watch_collections(app: &App) -> Result<()> {
    let shutdown = ctrl_c_channel();

    let cache = ChangeStreamCache::from_config(
        app.remote(),
        app.audit.clone(),
        app.metrics.clone(),
        &app.config,
    );
    cache.init();

    let handles: Vec<_> = CollectionKind::ALL
        .iter()
        .map(|kind| {
            cache.subscribe(*kind, |snapshot| {
                info!(kind = %snapshot.kind(), len = %snapshot.len(), "snapshot_received");
            })
        })
        .collect();

    // Start Prometheus metrics HTTP server (if port > 0)
    let prometheus_port = app.config.prometheus_port();
    if prometheus_port > 0 {
        let prom_metrics = app.metrics.clone();
        let site_id = app.config.site_id().to_string();
        let prom_shutdown = shutdown.clone();
        tokio::spawn(async move {
            if let Err(e) = fleet_admin::io::prometheus::start_metrics_server(
                prometheus_port,
                prom_metrics,
                site_id,
                prom_shutdown,
            )
            .await
            {
                tracing::error!(error = %e, "Prometheus metrics server error");
            }
        });
    }

    // Periodic metrics summary until shutdown
    let mut interval =
        tokio::time::interval(Duration::from_secs(app.config.metrics_interval_secs()));
    interval.tick().await;
    let mut shutdown_rx = shutdown;
    loop {
        tokio::select! {
            _ = interval.tick() => app.metrics.report().log(),
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    break;
                }
            }
        }
    }

    for handle in &handles {
        handle.unsubscribe();
    }
    cache.shutdown().await;
    app.metrics.report().log();
    info!("fleet-admin shutdown complete");
    Ok(())
}
