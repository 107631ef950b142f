//! Run configuration.
//!
//! All tunable policy lives here: concurrency budgets, retry/timeout
//! limits, critical tasks, health thresholds, decision authority order,
//! and the soft-input upgrade policy. Loaded from TOML like the rest of
//! the on-disk surface.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use crate::core::task::TaskId;
use crate::{clog_debug, Error, Result};

/// What to do with an in-flight soft-dependent task when its dependency
/// completes (or with a result produced on stub inputs).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SoftInputPolicy {
    /// Let the in-flight invocation keep its stubs; a result parked on an
    /// incomplete soft dependency is absorbed once the dependency completes.
    #[default]
    FinishWithStubs,
    /// Abort the in-flight invocation (or discard a parked stub result)
    /// and return the task to Ready so the next dispatch carries the real
    /// artifact.
    Redispatch,
}

/// Blocker-count thresholds for health classification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthThresholds {
    /// Open blockers at or above this count degrade health to Warning.
    pub warning_blockers: usize,
    /// Open blockers at or above this count degrade health to Critical.
    pub critical_blockers: usize,
}

impl Default for HealthThresholds {
    fn default() -> Self {
        Self {
            warning_blockers: 1,
            critical_blockers: 3,
        }
    }
}

/// Configuration for one orchestration run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunConfig {
    /// Simultaneous InProgress limit per capability tag.
    #[serde(default)]
    pub capacity_per_category: HashMap<String, usize>,
    /// Budget for categories not listed above.
    #[serde(default = "default_capacity")]
    pub default_capacity: usize,
    /// Invocation attempts before a failure becomes terminal.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Base delay for exponential retry backoff.
    #[serde(default = "default_retry_base_delay", with = "duration_ms")]
    pub retry_base_delay: Duration,
    /// Per-invocation timeout; expiry blocks the task rather than failing it.
    #[serde(default = "default_invocation_timeout", with = "duration_ms")]
    pub invocation_timeout: Duration,
    /// How long in-flight invocations may run after cancellation.
    #[serde(default = "default_grace_timeout", with = "duration_ms")]
    pub grace_timeout: Duration,
    /// Tasks whose terminal failure halts the whole run.
    #[serde(default)]
    pub critical_task_ids: HashSet<TaskId>,
    /// Blocker thresholds for health classification.
    #[serde(default)]
    pub health_thresholds: HealthThresholds,
    /// Decision authority order over categories, highest first
    /// (e.g. architecture > implementation > styling).
    #[serde(default)]
    pub authority: Vec<String>,
    /// Remaining critical-path weight above which the run counts as
    /// behind schedule. None disables the check.
    #[serde(default)]
    pub critical_path_budget: Option<u32>,
    /// Named phases as an explicit partition of task ids. Progress is
    /// reported per phase; tasks in no declared phase are grouped by
    /// their category instead.
    #[serde(default)]
    pub phases: HashMap<String, HashSet<TaskId>>,
    /// Soft-dependency input upgrade policy.
    #[serde(default)]
    pub soft_input_policy: SoftInputPolicy,
}

fn default_capacity() -> usize {
    2
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_base_delay() -> Duration {
    Duration::from_millis(100)
}

fn default_invocation_timeout() -> Duration {
    Duration::from_secs(300)
}

fn default_grace_timeout() -> Duration {
    Duration::from_secs(5)
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> std::result::Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        d: D,
    ) -> std::result::Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            capacity_per_category: HashMap::new(),
            default_capacity: default_capacity(),
            max_retries: default_max_retries(),
            retry_base_delay: default_retry_base_delay(),
            invocation_timeout: default_invocation_timeout(),
            grace_timeout: default_grace_timeout(),
            critical_task_ids: HashSet::new(),
            health_thresholds: HealthThresholds::default(),
            authority: Vec::new(),
            critical_path_budget: None,
            phases: HashMap::new(),
            soft_input_policy: SoftInputPolicy::default(),
        }
    }
}

impl RunConfig {
    pub fn conductor_dir() -> Result<PathBuf> {
        Ok(dirs::home_dir().ok_or(Error::NoHomeDir)?.join(".conductor"))
    }

    pub fn config_path() -> Result<PathBuf> {
        Ok(Self::conductor_dir()?.join("conductor.toml"))
    }

    /// Concurrency budget for a capability tag.
    pub fn capacity_for(&self, category: &str) -> usize {
        self.capacity_per_category
            .get(category)
            .copied()
            .unwrap_or(self.default_capacity)
    }

    /// Authority rank for a category: 0 is highest. Categories not in the
    /// authority list rank below all listed ones, equal to each other.
    pub fn authority_rank(&self, category: &str) -> usize {
        self.authority
            .iter()
            .position(|c| c == category)
            .unwrap_or(self.authority.len())
    }

    /// Budgets must be positive; a zero budget would strand Ready tasks.
    /// Declared phases must not overlap.
    pub fn validate(&self) -> Result<()> {
        if self.default_capacity == 0 {
            return Err(Error::Validation(
                "default_capacity must be positive".to_string(),
            ));
        }
        for (category, &capacity) in &self.capacity_per_category {
            if capacity == 0 {
                return Err(Error::Validation(format!(
                    "capacity for category '{}' must be positive",
                    category
                )));
            }
        }
        let mut assigned: HashMap<TaskId, &str> = HashMap::new();
        for (phase, ids) in &self.phases {
            for id in ids {
                if let Some(other) = assigned.insert(*id, phase) {
                    return Err(Error::Validation(format!(
                        "task {} appears in phases '{}' and '{}'",
                        id, other, phase
                    )));
                }
            }
        }
        Ok(())
    }

    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path()?)
    }

    pub fn load_from(path: &PathBuf) -> Result<Self> {
        clog_debug!("RunConfig::load path={}", path.display());
        if !path.exists() {
            clog_debug!("Config file not found, using defaults");
            return Ok(Self::default());
        }
        let config: Self = toml::from_str(&fs::read_to_string(path)?)?;
        config.validate()?;
        Ok(config)
    }

    pub fn save(&self) -> Result<()> {
        let dir = Self::conductor_dir()?;
        if !dir.exists() {
            fs::create_dir_all(&dir)?;
        }
        self.save_to(&Self::config_path()?)
    }

    pub fn save_to(&self, path: &PathBuf) -> Result<()> {
        fs::write(path, toml::to_string_pretty(self)?)?;
        clog_debug!("Config saved to {}", path.display());
        Ok(())
    }
}
