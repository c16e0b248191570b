use std::io::BufRead;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::io::AsyncWriteExt;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use txsentinel::audit::AuditTrail;
use txsentinel::cases::CaseManager;
use txsentinel::cases::sla::SlaPolicy;
use txsentinel::collaborators::Collaborators;
use txsentinel::collaborators::http::{HttpEnrichment, HttpWatchlist, JsonClient};
use txsentinel::config::Config;
use txsentinel::core::pipeline::{PipelineOutput, Screener, run_pipeline};
use txsentinel::core::velocity::VelocityTracker;
use txsentinel::db::SharedDatabase;
use txsentinel::error::Error;
use txsentinel::notifications::Notifier;
use txsentinel::rules::store::RuleStore;
use txsentinel::signals::RuleEngine;
use txsentinel::signals::decision::DecisionPolicy;

#[tokio::main]
async fn main() -> Result<(), Error> {
    // Logs go to stderr; stdout carries screening results.
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("txsentinel=info")),
        )
        .init();

    info!("TxSentinel starting...");

    let config_path = std::env::args().nth(1).unwrap_or_else(|| "config.toml".into());
    let config = Config::load(&config_path);
    debug!("Config: {:?}", config);

    // Open the database
    let db_path = Path::new(&config.database.path);
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let db = SharedDatabase::open(db_path)?;
    info!("Database opened at {}", config.database.path);

    // Rules: stored versions first, then anything new in the seed file
    let rules = Arc::new(RuleStore::load_from_db(&db)?);
    if let Some(path) = config.rules.path.as_deref().filter(|p| Path::new(p).exists()) {
        if let Err(e) = rules.seed_from_file(path) {
            warn!("Failed to seed rules from {path}: {e}");
        }
    }
    info!("{} active rules", rules.snapshot().len());

    let audit = Arc::new(AuditTrail::new(config.cases.audit_memory, Some(db.clone())));
    let notifier = Arc::new(Notifier::new(&config.notifications));
    let cases = Arc::new(
        CaseManager::new(SlaPolicy::from(&config.sla), audit.clone())
            .with_db(db.clone())
            .with_supervisors(config.cases.supervisors.clone())
            .with_auto_assign(config.cases.auto_assign.clone())
            .with_notifier(notifier),
    );
    cases.load_from_db()?;

    let collaborators = build_collaborators(&config);
    let tracker = Arc::new(VelocityTracker::new(config.screening.max_window_events));
    let engine = RuleEngine::new(
        tracker.clone(),
        config.screening.high_risk_countries.clone(),
        config.screening.watchlist_fail_action,
    );
    let policy = DecisionPolicy {
        block_threshold: config.screening.block_threshold,
        flag_threshold: config.screening.flag_threshold,
    };
    let screener = Arc::new(Screener::new(
        rules.clone(),
        collaborators,
        engine,
        policy,
        cases.clone(),
        audit.clone(),
    ));

    // stdin → pipeline → stdout
    let (line_tx, line_rx) = mpsc::channel(1024);
    let (out_tx, out_rx) = mpsc::unbounded_channel::<PipelineOutput>();
    let (stop_tx, stop_rx) = watch::channel(false);

    start_stdin_reader(line_tx);
    let writer = tokio::spawn(write_outputs(out_rx));
    let maintenance = tokio::spawn(run_maintenance(
        cases.clone(),
        tracker,
        rules,
        Duration::from_secs(config.sla.sweep_interval_secs.max(1)),
        Duration::from_secs(config.rules.reload_interval_secs.max(1)),
        stop_rx.clone(),
    ));
    let mut pipeline = tokio::spawn(run_pipeline(
        line_rx,
        out_tx,
        screener,
        config.workers(),
        stop_rx,
    ));

    let finished = tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Interrupt received, shutting down");
            false
        }
        res = &mut pipeline => {
            if let Err(e) = res {
                error!("Pipeline task failed: {e}");
            }
            true
        }
    };
    let _ = stop_tx.send(true);
    if !finished {
        if let Err(e) = pipeline.await {
            error!("Pipeline task failed: {e}");
        }
    }
    if let Err(e) = maintenance.await {
        error!("Maintenance task failed: {e}");
    }
    if let Err(e) = writer.await {
        error!("Output writer failed: {e}");
    }

    let stats = cases.stats(Utc::now());
    info!(
        total = stats.total,
        open = stats.open,
        breached = stats.breached,
        "Case summary"
    );
    info!("{} audit entries recorded this run", audit.recorded());
    Ok(())
}

fn build_collaborators(config: &Config) -> Collaborators {
    let c = &config.collaborators;
    let mut collaborators =
        Collaborators::new(Duration::from_millis(config.screening.collaborator_timeout_ms));
    if let Some(url) = &c.watchlist_url {
        let client = JsonClient::new("watchlist", url, c.user.as_deref(), c.password.as_deref());
        collaborators = collaborators.with_watchlist(Arc::new(HttpWatchlist::new(client)));
        info!("Watchlist screening via {url}");
    }
    if let Some(url) = &c.enrichment_url {
        let client = JsonClient::new("enrichment", url, c.user.as_deref(), c.password.as_deref());
        collaborators = collaborators.with_enrichment(Arc::new(HttpEnrichment::new(client)));
        info!("Enrichment via {url}");
    }
    collaborators
}

/// Blocking stdin reads live on their own thread so shutdown never waits on them.
fn start_stdin_reader(tx: mpsc::Sender<String>) {
    std::thread::spawn(move || {
        for line in std::io::stdin().lock().lines() {
            match line {
                Ok(line) => {
                    if tx.blocking_send(line).is_err() {
                        break;
                    }
                }
                Err(e) => {
                    warn!("Failed to read stdin: {e}");
                    break;
                }
            }
        }
        debug!("stdin closed");
    });
}

async fn write_outputs(mut rx: mpsc::UnboundedReceiver<PipelineOutput>) {
    let mut stdout = tokio::io::stdout();
    while let Some(output) = rx.recv().await {
        let mut line = match serde_json::to_string(&output) {
            Ok(line) => line,
            Err(e) => {
                warn!("Failed to encode output: {e}");
                continue;
            }
        };
        line.push('\n');
        if let Err(e) = stdout.write_all(line.as_bytes()).await {
            warn!("stdout closed: {e}");
            break;
        }
        let _ = stdout.flush().await;
    }
}

/// SLA sweep and velocity eviction share one schedule; rule reload has its own.
async fn run_maintenance(
    cases: Arc<CaseManager>,
    tracker: Arc<VelocityTracker>,
    rules: Arc<RuleStore>,
    sweep_every: Duration,
    reload_every: Duration,
    mut stop: watch::Receiver<bool>,
) {
    let mut sweep = tokio::time::interval(sweep_every);
    let mut reload = tokio::time::interval(reload_every);
    // Both fire immediately; rules were just loaded.
    reload.tick().await;

    loop {
        tokio::select! {
            _ = stop.wait_for(|stop| *stop) => break,
            _ = sweep.tick() => {
                let now = Utc::now();
                let breached = cases.sweep_sla(now);
                let dropped = tracker.evict_expired(now);
                if !breached.is_empty() || dropped > 0 {
                    info!(
                        breached = breached.len(),
                        windows_dropped = dropped,
                        "Maintenance sweep"
                    );
                }
            }
            _ = reload.tick() => {
                if let Err(e) = rules.reload_from_db() {
                    warn!("Rule reload failed: {e}");
                }
            }
        }
    }
    debug!("Maintenance stopped");
}
