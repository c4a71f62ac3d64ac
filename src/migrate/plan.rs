//! The durable migration plan document (`migration_plan.json`).
//!
//! Every mutation is followed by a whole-file rewrite before the next unit
//! of work starts, so a crash leaves the plan a faithful lower bound on
//! progress.

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::config::write_json;

pub const PLAN_SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntervalStatus {
    Pending,
    Migrating,
    Complete,
    Error,
}

impl std::fmt::Display for IntervalStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            IntervalStatus::Pending => "pending",
            IntervalStatus::Migrating => "migrating",
            IntervalStatus::Complete => "complete",
            IntervalStatus::Error => "error",
        };
        f.write_str(name)
    }
}

impl std::str::FromStr for IntervalStatus {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self> {
        match value {
            "pending" => Ok(IntervalStatus::Pending),
            "migrating" => Ok(IntervalStatus::Migrating),
            "complete" => Ok(IntervalStatus::Complete),
            "error" => Ok(IntervalStatus::Error),
            other => bail!("unknown interval status: {other}"),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IntervalTotals {
    pub legacy_rows: Option<u64>,
    pub partition_rows: Option<u64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IntervalJobs {
    pub total: u64,
    pub completed: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntervalVerification {
    pub method: String,
    pub verified_at: Option<String>,
}

impl Default for IntervalVerification {
    fn default() -> Self {
        Self {
            method: "row_counts".to_string(),
            verified_at: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntervalBackup {
    pub path: PathBuf,
    pub created_at: String,
    pub size_bytes: Option<u64>,
    pub verified: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrationInterval {
    pub legacy_path: PathBuf,
    pub partition_path: PathBuf,
    pub status: IntervalStatus,
    #[serde(default)]
    pub totals: IntervalTotals,
    #[serde(default)]
    pub jobs: IntervalJobs,
    #[serde(default)]
    pub resume_token: Option<String>,
    #[serde(default)]
    pub verification: IntervalVerification,
    #[serde(default)]
    pub backups: Vec<IntervalBackup>,
}

impl MigrationInterval {
    pub fn new(legacy_path: PathBuf, partition_path: PathBuf) -> Self {
        Self {
            legacy_path,
            partition_path,
            status: IntervalStatus::Pending,
            totals: IntervalTotals::default(),
            jobs: IntervalJobs::default(),
            resume_token: None,
            verification: IntervalVerification::default(),
            backups: Vec::new(),
        }
    }

    pub fn resolve_legacy_path(&self, base: &Path) -> PathBuf {
        resolve_path(&self.legacy_path, base)
    }

    pub fn resolve_partition_path(&self, base: &Path) -> PathBuf {
        resolve_path(&self.partition_path, base)
    }

    pub fn is_verified(&self) -> bool {
        self.status == IntervalStatus::Complete && self.verification.verified_at.is_some()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrationVenue {
    pub id: String,
    pub market: String,
    pub source: String,
    pub status: String,
    pub last_updated: String,
    pub intervals: BTreeMap<String, MigrationInterval>,
}

impl MigrationVenue {
    pub fn all_intervals_verified(&self) -> bool {
        !self.intervals.is_empty() && self.intervals.values().all(MigrationInterval::is_verified)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrationPlan {
    pub schema_version: u32,
    pub generated_at: String,
    pub created_by: String,
    pub legacy_root: PathBuf,
    pub venues: Vec<MigrationVenue>,
    #[serde(skip)]
    plan_path: Option<PathBuf>,
}

impl MigrationPlan {
    pub fn new(
        generated_at: String,
        created_by: String,
        legacy_root: PathBuf,
        venues: Vec<MigrationVenue>,
    ) -> Self {
        Self {
            schema_version: PLAN_SCHEMA_VERSION,
            generated_at,
            created_by,
            legacy_root,
            venues,
            plan_path: None,
        }
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read migration plan at {}", path.display()))?;
        let mut plan: MigrationPlan =
            serde_json::from_str(&text).context("failed to decode migration plan")?;
        if plan.schema_version != PLAN_SCHEMA_VERSION {
            bail!(
                "migration plan schema_version {} is not supported",
                plan.schema_version
            );
        }
        if plan.legacy_root.as_os_str().is_empty() {
            bail!("legacy_root is required in the migration plan");
        }
        plan.plan_path = Some(path.to_path_buf());
        Ok(plan)
    }

    pub fn resolve_legacy_root(&self, base: &Path) -> PathBuf {
        resolve_path(&self.legacy_root, base)
    }

    pub fn get_venue(&self, venue_id: &str) -> Result<&MigrationVenue> {
        self.venues
            .iter()
            .find(|venue| venue.id == venue_id)
            .with_context(|| format!("venue {venue_id} not found in migration plan"))
    }

    pub fn get_venue_mut(&mut self, venue_id: &str) -> Result<&mut MigrationVenue> {
        self.venues
            .iter_mut()
            .find(|venue| venue.id == venue_id)
            .with_context(|| format!("venue {venue_id} not found in migration plan"))
    }

    pub fn get_interval(&self, venue_id: &str, interval: &str) -> Result<&MigrationInterval> {
        self.get_venue(venue_id)?
            .intervals
            .get(interval)
            .with_context(|| format!("interval {interval} not found for venue {venue_id}"))
    }

    /// Apply a mutation to one interval and stamp the venue/plan timestamps.
    pub fn update_interval(
        &mut self,
        venue_id: &str,
        interval: &str,
        when: &str,
        mutate: impl FnOnce(&mut MigrationInterval),
    ) -> Result<()> {
        let venue = self.get_venue_mut(venue_id)?;
        let state = venue
            .intervals
            .get_mut(interval)
            .with_context(|| format!("interval {interval} not found for venue {venue_id}"))?;
        mutate(state);
        venue.last_updated = when.to_string();
        self.generated_at = when.to_string();
        Ok(())
    }

    /// Durably persist the plan. Must be called after every state mutation
    /// before the next unit of work starts.
    pub fn write(&mut self, path: Option<&Path>) -> Result<PathBuf> {
        let target = match path {
            Some(path) => path.to_path_buf(),
            None => self
                .plan_path
                .clone()
                .context("no target path specified for writing migration plan")?,
        };
        write_json(&target, self)?;
        self.plan_path = Some(target.clone());
        Ok(target)
    }
}

fn resolve_path(path: &Path, base: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn sample_plan() -> MigrationPlan {
        let interval = MigrationInterval::new(
            PathBuf::from("data/legacy/stocks_1d"),
            PathBuf::from("data/us/yahoo/stocks_1d"),
        );
        MigrationPlan::new(
            "2025-01-01T00:00:00Z".to_string(),
            "parqed-cli".to_string(),
            PathBuf::from("data/legacy"),
            vec![MigrationVenue {
                id: "XNAS".to_string(),
                market: "us".to_string(),
                source: "yahoo".to_string(),
                status: "pending".to_string(),
                last_updated: "2025-01-01T00:00:00Z".to_string(),
                intervals: BTreeMap::from([("1d".to_string(), interval)]),
            }],
        )
    }

    #[test]
    fn round_trips_through_disk() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("migration_plan.json");
        let mut plan = sample_plan();
        plan.write(Some(&path)).unwrap();

        let loaded = MigrationPlan::from_file(&path).unwrap();
        assert_eq!(loaded.schema_version, PLAN_SCHEMA_VERSION);
        let interval = loaded.get_interval("XNAS", "1d").unwrap();
        assert_eq!(interval.status, IntervalStatus::Pending);
        assert_eq!(interval.verification.method, "row_counts");
    }

    #[test]
    fn unsupported_schema_version_is_rejected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("migration_plan.json");
        std::fs::write(
            &path,
            r#"{"schema_version": 2, "generated_at": "", "created_by": "", "legacy_root": "x", "venues": []}"#,
        )
        .unwrap();
        assert!(MigrationPlan::from_file(&path).is_err());
    }

    #[test]
    fn update_interval_stamps_timestamps() {
        let mut plan = sample_plan();
        plan.update_interval("XNAS", "1d", "2025-02-02T00:00:00Z", |interval| {
            interval.status = IntervalStatus::Migrating;
            interval.jobs.total = 5;
        })
        .unwrap();
        assert_eq!(plan.generated_at, "2025-02-02T00:00:00Z");
        let venue = plan.get_venue("XNAS").unwrap();
        assert_eq!(venue.last_updated, "2025-02-02T00:00:00Z");
        assert_eq!(
            plan.get_interval("XNAS", "1d").unwrap().status,
            IntervalStatus::Migrating
        );
    }

    #[test]
    fn relative_paths_resolve_against_base() {
        let plan = sample_plan();
        let interval = plan.get_interval("XNAS", "1d").unwrap();
        assert_eq!(
            interval.resolve_legacy_path(Path::new("/work")),
            PathBuf::from("/work/data/legacy/stocks_1d")
        );
        assert_eq!(
            plan.resolve_legacy_root(Path::new("/work")),
            PathBuf::from("/work/data/legacy")
        );
    }

    #[test]
    fn verified_requires_complete_and_timestamp() {
        let mut plan = sample_plan();
        assert!(!plan.get_venue("XNAS").unwrap().all_intervals_verified());
        plan.update_interval("XNAS", "1d", "t", |interval| {
            interval.status = IntervalStatus::Complete;
            interval.verification.verified_at = Some("t".to_string());
        })
        .unwrap();
        assert!(plan.get_venue("XNAS").unwrap().all_intervals_verified());
    }
}
