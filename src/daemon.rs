//! Long-running daemon loop: trading-hours gating, maintenance cadence,
//! PID-file hygiene, and graceful signal-driven shutdown.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::{NaiveDate, Utc};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;

use crate::hours::TradingHoursChecker;

/// Shutdown checks happen at most this far apart while sleeping.
const IDLE_SLICE: Duration = Duration::from_secs(60);
const CYCLE_SLICE: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MaintenanceCadence {
    Daily,
    Weekly,
    Monthly,
    Never,
}

impl MaintenanceCadence {
    fn interval_days(self) -> Option<i64> {
        match self {
            MaintenanceCadence::Daily => Some(1),
            MaintenanceCadence::Weekly => Some(7),
            MaintenanceCadence::Monthly => Some(30),
            MaintenanceCadence::Never => None,
        }
    }

    pub fn is_due(self, last_run: Option<NaiveDate>, today: NaiveDate) -> bool {
        let Some(days) = self.interval_days() else {
            return false;
        };
        match last_run {
            None => true,
            Some(last) => (today - last).num_days() >= days,
        }
    }
}

impl FromStr for MaintenanceCadence {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self> {
        match value {
            "daily" => Ok(MaintenanceCadence::Daily),
            "weekly" => Ok(MaintenanceCadence::Weekly),
            "monthly" => Ok(MaintenanceCadence::Monthly),
            "never" => Ok(MaintenanceCadence::Never),
            other => bail!("unknown maintenance cadence: {other} (expected daily|weekly|monthly|never)"),
        }
    }
}

/// Single shutdown flag shared between signal handlers and sleep slices.
#[derive(Debug, Clone, Default)]
pub struct ShutdownFlag(Arc<AtomicBool>);

impl ShutdownFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_set(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Install SIGTERM/SIGINT handlers that set the flag.
    pub fn install_signal_handlers(&self) -> Result<()> {
        use tokio::signal::unix::{signal, SignalKind};
        for kind in [SignalKind::terminate(), SignalKind::interrupt()] {
            let flag = self.clone();
            let mut stream = signal(kind).context("failed to install signal handler")?;
            tokio::spawn(async move {
                if stream.recv().await.is_some() {
                    tracing::info!("received shutdown signal, shutting down gracefully");
                    flag.set();
                }
            });
        }
        Ok(())
    }
}

/// One ingestion job driven by the daemon loop.
#[async_trait]
pub trait DaemonTask: Send {
    /// Whether any data exists yet; an empty store triggers the immediate
    /// initial fetch regardless of trading hours (the rolling window would
    /// otherwise age data out before the market opens).
    fn has_any_data(&self) -> bool {
        true
    }

    async fn run_cycle(&mut self) -> Result<()>;

    async fn run_maintenance(&mut self) -> Result<()> {
        Ok(())
    }
}

pub struct DaemonOptions {
    pub fetch_interval_hours: u64,
    pub hours: TradingHoursChecker,
    pub maintenance: MaintenanceCadence,
    pub pid_file: Option<PathBuf>,
    /// Posttrade rule: fetch once at startup when the store is empty.
    pub initial_fetch_when_empty: bool,
}

/// Removes the PID file when the daemon exits.
pub struct PidGuard {
    path: PathBuf,
}

impl Drop for PidGuard {
    fn drop(&mut self) {
        if self.path.exists() {
            if let Err(err) = std::fs::remove_file(&self.path) {
                tracing::debug!(path = %self.path.display(), %err, "failed to remove PID file");
            } else {
                tracing::info!(path = %self.path.display(), "PID file removed");
            }
        }
    }
}

/// Refuse to start when a live instance owns the PID file; clean up a
/// stale one (recorded process no longer running) and take over.
pub fn check_and_write_pid_file(pid_file: &Path) -> Result<PidGuard> {
    if pid_file.exists() {
        let recorded = std::fs::read_to_string(pid_file)
            .ok()
            .and_then(|text| text.trim().parse::<i32>().ok());
        match recorded {
            Some(old_pid) if process_alive(old_pid) => {
                bail!(
                    "another instance is already running (PID {old_pid}). Remove {} if this is stale.",
                    pid_file.display()
                );
            }
            Some(old_pid) => {
                tracing::warn!(old_pid, "removing stale PID file");
                let _ = std::fs::remove_file(pid_file);
            }
            None => {
                tracing::warn!("removing invalid PID file");
                let _ = std::fs::remove_file(pid_file);
            }
        }
    }

    if let Some(parent) = pid_file.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    std::fs::write(pid_file, std::process::id().to_string())
        .with_context(|| format!("failed to write {}", pid_file.display()))?;
    tracing::info!(path = %pid_file.display(), pid = std::process::id(), "PID file created");
    Ok(PidGuard {
        path: pid_file.to_path_buf(),
    })
}

fn process_alive(pid: i32) -> bool {
    // Signal 0 probes for existence without delivering anything.
    unsafe { libc::kill(pid, 0) == 0 }
}

/// Sleep `total`, waking every `slice` to poll the shutdown flag.
async fn sleep_in_slices(total: Duration, slice: Duration, shutdown: &ShutdownFlag) {
    let mut remaining = total;
    while remaining > Duration::ZERO && !shutdown.is_set() {
        let step = remaining.min(slice);
        sleep(step).await;
        remaining = remaining.saturating_sub(step);
    }
}

/// Drive a task until shutdown: honor trading hours, run maintenance on
/// cadence, and never exit on a caught operational error.
pub async fn run_daemon(
    task: &mut dyn DaemonTask,
    options: &DaemonOptions,
    shutdown: &ShutdownFlag,
) -> Result<()> {
    let _pid_guard = options
        .pid_file
        .as_deref()
        .map(check_and_write_pid_file)
        .transpose()?;

    tracing::info!(
        interval_hours = options.fetch_interval_hours,
        "starting daemon loop"
    );

    // Initial-fetch rule: with an empty store, data currently in the
    // provider's rolling window would vanish before the next open.
    if options.initial_fetch_when_empty && !task.has_any_data() {
        tracing::info!("no existing data found, performing initial fetch of all available data");
        if let Err(err) = task.run_cycle().await {
            tracing::error!(%err, "error during initial fetch, will retry on next cycle");
        }
    }

    let mut run_count = 0u64;
    let mut last_maintenance: Option<NaiveDate> = None;

    while !shutdown.is_set() {
        if !options.hours.is_within_hours() {
            let wait = options.hours.seconds_until_active().max(0) as u64;
            tracing::info!(
                next_active = %options.hours.next_active_time(),
                wait_secs = wait,
                "outside active hours, waiting"
            );
            sleep_in_slices(Duration::from_secs(wait), IDLE_SLICE, shutdown).await;
            if shutdown.is_set() {
                break;
            }
            tracing::info!("entering active hours, starting fetch cycle");
        }

        run_count += 1;
        tracing::info!(run = run_count, "daemon run started");

        let today = Utc::now().date_naive();
        if options.maintenance.is_due(last_maintenance, today) {
            if let Err(err) = task.run_maintenance().await {
                tracing::error!(%err, "maintenance failed");
            }
            last_maintenance = Some(today);
        }

        if let Err(err) = task.run_cycle().await {
            // The daemon only exits on a signal, never on a cycle error.
            tracing::error!(run = run_count, %err, "error in daemon run");
        }

        if shutdown.is_set() {
            break;
        }
        tracing::info!(run = run_count, "daemon run completed");
        sleep_in_slices(
            Duration::from_secs(options.fetch_interval_hours * 3600),
            CYCLE_SLICE,
            shutdown,
        )
        .await;
    }

    tracing::info!("daemon shutting down gracefully");
    Ok(())
}
