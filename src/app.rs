//! Command implementations: wire the store, ledger, gateway and scheduler
//! together behind the CLI and run them.

use crate::cli::{Cli, Commands};
use crate::config::Config;
use crate::events::EventBus;
use crate::ledger::{BudgetStatus, Ledger};
use crate::policy::PolicyGateway;
use crate::scheduler::{Scheduler, TickReport};
use crate::store::{DocId, IntegrityKeyer, StateStore};
use anyhow::{Context, Result, bail};
use chrono::Utc;
use std::sync::Arc;

pub async fn dispatch(cli: Cli) -> Result<()> {
    let config = Config::load(&cli.config)?;
    match cli.command {
        Commands::Run => run(config).await,
        Commands::Once => once(config).await,
        Commands::Status => status(config).await,
        Commands::Spawn { unit, data } => spawn(config, &unit, data.as_deref()).await,
        Commands::Trigger { event, data } => trigger(config, &event, &data).await,
        Commands::Readmit { unit } => readmit(config, &unit),
    }
}

// ── Wiring ───────────────────────────────────────────────────────

struct Colony {
    config: Arc<Config>,
    store: Arc<StateStore>,
    ledger: Arc<tokio::sync::Mutex<Ledger>>,
    sched: Scheduler,
}

fn build(config: Config) -> Result<Colony> {
    std::fs::create_dir_all(&config.honeycomb_dir).with_context(|| {
        format!(
            "failed to create honeycomb dir {}",
            config.honeycomb_dir.display()
        )
    })?;

    let keyer = IntegrityKeyer::new(config.secret_key_bytes());
    let store = Arc::new(StateStore::open(&config.honeycomb_dir, keyer)?);
    for doc in store.corrupt_docs() {
        tracing::error!(doc = %doc, "document failed integrity verification; commits to it are halted");
    }

    let ledger = Ledger::open(&config.ledger_path(), config.ledger.recent_key_window)
        .with_context(|| format!("ledger replay failed: {}", config.ledger_path().display()))?;
    let ledger = Arc::new(tokio::sync::Mutex::new(ledger));

    let registry = Arc::new(config.build_registry()?);
    let gateway = Arc::new(PolicyGateway::with_default_rules(&config.policy));
    let bus = Arc::new(EventBus::new());
    let config = Arc::new(config);

    let sched = Scheduler::new(
        Arc::clone(&config),
        registry,
        Arc::clone(&store),
        Arc::clone(&ledger),
        gateway,
        bus,
    );
    Ok(Colony {
        config,
        store,
        ledger,
        sched,
    })
}

// ── Commands ─────────────────────────────────────────────────────

async fn run(config: Config) -> Result<()> {
    let mut colony = build(config)?;
    let period = std::time::Duration::from_secs(colony.config.scheduler.tick_interval_secs);
    let mut interval = tokio::time::interval(period);
    tracing::info!(
        units = colony.config.units.len(),
        tick_secs = period.as_secs(),
        "colony running"
    );

    loop {
        tokio::select! {
            _ = interval.tick() => {
                let report = colony.sched.tick(Utc::now()).await;
                if report.dispatched + report.committed + report.blocked + report.failed > 0 {
                    tracing::info!(
                        dispatched = report.dispatched,
                        committed = report.committed,
                        blocked = report.blocked,
                        failed = report.failed,
                        "tick complete"
                    );
                }
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("shutdown requested, draining in-flight runs");
                colony.sched.drain().await;
                return Ok(());
            }
        }
    }
}

async fn once(config: Config) -> Result<()> {
    let mut colony = build(config)?;
    let tick = colony.sched.tick(Utc::now()).await;
    let settled = colony.sched.drain().await;
    print_report(tick, settled);
    fail_on_corruption(&colony.store)
}

async fn status(config: Config) -> Result<()> {
    let colony = build(config)?;

    println!("documents");
    for doc in DocId::all() {
        let snapshot = colony.store.snapshot();
        let verified = colony.store.verify(doc);
        println!(
            "  {doc:<8} v{:<6} {}",
            snapshot.version(doc),
            if verified { "ok" } else { "CORRUPT" }
        );
    }

    let quarantined = colony.sched.quarantined();
    if quarantined.is_empty() {
        println!("quarantine  none");
    } else {
        println!("quarantine");
        for (unit, record) in quarantined {
            println!(
                "  {unit}: {} (after {} attempts, at {})",
                record.reason,
                record.attempts,
                record.at.to_rfc3339()
            );
        }
    }

    let ledger = colony.ledger.lock().await;
    let health = ledger.budget_health(Utc::now());
    let floor = colony.config.policy.reserve_floor_cents;
    println!("ledger      {} events", ledger.len());
    println!("  balance   {}", dollars(health.balance_cents));
    println!(
        "  burn      {}/day over the last 7 days",
        dollars(health.burn_rate_cents_per_day)
    );
    match health.runway_days {
        Some(days) => println!("  runway    {days:.1} days ({:?})", health.status),
        None => println!("  runway    open-ended ({:?})", health.status),
    }
    println!(
        "  reserve   floor {} ({})",
        dollars(floor),
        if ledger.reserve_check(0, floor) {
            "above floor"
        } else {
            "BELOW FLOOR"
        }
    );
    if health.status == BudgetStatus::Critical {
        tracing::warn!(runway_days = ?health.runway_days, "budget runway critical");
    }
    drop(ledger);

    fail_on_corruption(&colony.store)
}

async fn spawn(config: Config, unit: &str, data: Option<&str>) -> Result<()> {
    let payload = data
        .map(serde_json::from_str)
        .transpose()
        .context("--data must be valid JSON")?;

    let mut colony = build(config)?;
    colony.sched.force_dispatch(unit, payload, Utc::now())?;
    let settled = colony.sched.drain().await;
    print_report(TickReport::default(), settled);
    fail_on_corruption(&colony.store)
}

async fn trigger(config: Config, event: &str, data: &str) -> Result<()> {
    let payload = serde_json::from_str(data).context("--data must be valid JSON")?;

    let mut colony = build(config)?;
    colony.sched.bus().publish(event, payload, Utc::now());
    let tick = colony.sched.tick(Utc::now()).await;
    if tick.dispatched == 0 {
        println!("no unit subscribes to '{event}'");
    }
    let settled = colony.sched.drain().await;
    print_report(tick, settled);
    fail_on_corruption(&colony.store)
}

fn readmit(config: Config, unit: &str) -> Result<()> {
    let mut colony = build(config)?;
    if !colony.sched.readmit(unit) {
        bail!("unit '{unit}' is not quarantined");
    }
    println!("unit '{unit}' re-admitted");
    Ok(())
}

// ── Helpers ──────────────────────────────────────────────────────

fn print_report(tick: TickReport, settled: TickReport) {
    println!(
        "dispatched {} | committed {} | blocked {} | failed {}",
        tick.dispatched + settled.dispatched,
        tick.committed + settled.committed,
        tick.blocked + settled.blocked,
        tick.failed + settled.failed,
    );
}

fn fail_on_corruption(store: &StateStore) -> Result<()> {
    let corrupt = store.corrupt_docs();
    if corrupt.is_empty() {
        return Ok(());
    }
    let names: Vec<String> = corrupt.iter().map(ToString::to_string).collect();
    bail!("integrity verification failed for: {}", names.join(", "));
}

fn dollars(cents: i64) -> String {
    format!("${}.{:02}", cents / 100, (cents % 100).abs())
}
