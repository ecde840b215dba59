//! Headless simulator: two tabs and a phone of one user against the
//! in-memory backend.
//!
//! Runs a sibling-tab broadcast, a simultaneous double start, a stop, and a
//! dormancy cycle with a zombie connection, logging each outcome.
//!
//! Usage: `trackline-sim [config.toml]`

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use trackline::backend::memory::MemoryBackend;
use trackline::broadcast::BroadcastHub;
use trackline::clock::SystemClock;
use trackline::presence::PresenceIdentity;
use trackline::storage::MemorySnapshotStore;
use trackline::{ClientSession, RecoveryStatus, SyncConfig, SyncError, Visibility};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let config = match std::env::args_os().nth(1) {
        Some(path) => {
            let path = std::path::PathBuf::from(path);
            SyncConfig::from_file(&path)
                .with_context(|| format!("loading config from {}", path.display()))?
        }
        None => SyncConfig::default(),
    };

    let backend = MemoryBackend::new(Arc::new(SystemClock));
    let hub = BroadcastHub::new(config.broadcast.capacity);
    // Tabs of one browser share local storage; the phone has its own.
    let browser_storage = Arc::new(MemorySnapshotStore::new());
    let identity = PresenceIdentity {
        user_id: "sim-user".to_owned(),
        display_name: "Sim User".to_owned(),
        avatar_ref: None,
    };

    let build = |store: Arc<MemorySnapshotStore>, replica: &str| {
        ClientSession::builder(identity.clone(), backend.factory())
            .config(config.clone())
            .snapshot_store(store)
            .broadcast_hub(Arc::clone(&hub))
            .replica(replica.to_owned())
            .build()
    };
    let tab_a = build(Arc::clone(&browser_storage), "tab-a").await;
    let tab_b = build(Arc::clone(&browser_storage), "tab-b").await;
    let phone = build(Arc::new(MemorySnapshotStore::new()), "phone").await;

    // Sibling tab picks up the start via broadcast.
    let started = tab_a.start("task", "T1", "Write release notes").await?;
    tokio::time::sleep(Duration::from_millis(50)).await;
    tracing::info!(
        entry_id = %started.entry_id,
        tab_b_running = tab_b.is_running(),
        "broadcast sync"
    );

    // Phone races a second start; the backend constraint decides.
    match phone.start("task", "T2", "Triage inbox").await {
        Err(SyncError::AlreadyRunning) => tracing::info!(
            adopted = ?phone.active_timer().map(|t| t.entry_id),
            "phone start rejected; reconciled to running timer"
        ),
        Ok(snapshot) => {
            tracing::warn!(entry_id = %snapshot.entry_id, "phone start unexpectedly won")
        }
        Err(e) => return Err(e.into()),
    }

    tokio::time::sleep(Duration::from_millis(1200)).await;
    tracing::info!(elapsed = %tab_a.elapsed_display(), "tab A display");
    let closed = tab_a.stop().await?;
    tracing::info!(
        duration_secs = ?closed.duration_secs,
        open_timers = backend.open_count("sim-user"),
        "timer stopped"
    );

    // Dormancy: connections go zombie while the phone is backgrounded.
    let min_dormancy = Duration::from_millis(config.recovery.min_dormancy_ms);
    phone.on_visibility_change(Visibility::Hidden);
    backend.zombify_connections();
    tokio::time::sleep(min_dormancy + Duration::from_millis(100)).await;
    phone.on_visibility_change(Visibility::Visible);

    let mut state = phone.watch_recovery();
    let settle = Duration::from_millis(config.recovery.debounce_ms)
        + Duration::from_millis(config.health.probe_timeout_ms) * 3;
    let finished = state.wait_for(|s| {
        s.last_recovery_at.is_some() || s.status == RecoveryStatus::Degraded
    });
    if tokio::time::timeout(settle, finished).await.is_err() {
        tracing::warn!("phone recovery did not finish in time");
    }
    let recovered = phone.recovery_state();
    tracing::info!(
        status = %recovered.status,
        connection_healthy = recovered.connection_healthy,
        auth = ?recovered.auth_confidence,
        "phone recovery"
    );

    Ok(())
}
