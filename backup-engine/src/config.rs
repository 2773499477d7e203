//! Configuration for the backup engine.
//!
//! Two TOML files feed a run: the global file (`[engine]` settings plus a
//! `[defaults]` job table) and a per-job file. Job values override the
//! defaults field by field; the result resolves into a validated
//! [`JobConfig`].

use crate::fs::exclude::BUILTIN_EXCLUDED_DIRS;
use crate::lock::DEFAULT_STALE_AFTER_HOURS;
use crate::offload::encrypt::DEFAULT_PASSPHRASE_ENV;
use crate::utils::{EngineError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Contents of the global configuration file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GlobalConfig {
    pub engine: EngineSettings,
    pub defaults: PartialJobConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineSettings {
    /// Directory holding per-job lock markers
    pub lock_dir: PathBuf,

    /// SQLite ledger file
    pub database: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    pub log_level: String,

    /// Age after which a lock is reclaimed regardless of its holder
    pub stale_lock_hours: i64,

    /// Directory names excluded from every job
    pub builtin_excludes: Vec<String>,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            lock_dir: PathBuf::from("/var/lib/backup-engine/locks"),
            database: PathBuf::from("/var/lib/backup-engine/ledger.db"),
            log_level: "info".to_string(),
            stale_lock_hours: DEFAULT_STALE_AFTER_HOURS,
            builtin_excludes: BUILTIN_EXCLUDED_DIRS.iter().map(|d| d.to_string()).collect(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PartialEncryption {
    pub enabled: Option<bool>,
    pub passphrase_env: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PartialAws {
    pub enabled: Option<bool>,
    pub bucket: Option<String>,
    pub region: Option<String>,
    pub profile: Option<String>,
    pub storage_class: Option<String>,
}

/// A job configuration as written in a file: anything may be missing.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PartialJobConfig {
    pub job_name: Option<String>,
    pub source: Option<PathBuf>,
    pub destination: Option<PathBuf>,
    pub exclude: Vec<String>,
    pub use_common_exclude: Option<bool>,
    /// Chunk size limit in MB
    pub max_tarball_size: Option<u64>,
    pub keep_sets: Option<usize>,
    pub encryption: PartialEncryption,
    pub aws: PartialAws,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EncryptionConfig {
    pub enabled: bool,
    pub passphrase_env: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AwsConfig {
    pub enabled: bool,
    pub bucket: Option<String>,
    pub region: Option<String>,
    pub profile: String,
    pub storage_class: String,
}

/// A fully resolved job, ready to run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobConfig {
    pub job_name: String,
    pub source: PathBuf,
    pub destination: PathBuf,
    pub exclude: Vec<String>,
    pub use_common_exclude: bool,
    pub max_tarball_size: u64,
    pub keep_sets: usize,
    pub encryption: EncryptionConfig,
    pub aws: AwsConfig,
}

// Default values
fn default_max_tarball_size() -> u64 {
    1024
}

fn default_keep_sets() -> usize {
    5
}

fn default_aws_profile() -> String {
    "default".to_string()
}

fn default_storage_class() -> String {
    "STANDARD".to_string()
}

fn read_toml<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| EngineError::Config(format!("cannot read {}: {}", path.display(), e)))?;
    toml::from_str(&content).map_err(|e| EngineError::Config(format!("{}: {}", path.display(), e)))
}

impl GlobalConfig {
    pub fn from_file(path: &Path) -> Result<Self> {
        read_toml(path)
    }
}

impl PartialEncryption {
    fn merge(&self, over: &Self) -> Self {
        Self {
            enabled: over.enabled.or(self.enabled),
            passphrase_env: over.passphrase_env.clone().or_else(|| self.passphrase_env.clone()),
        }
    }
}

impl PartialAws {
    fn merge(&self, over: &Self) -> Self {
        Self {
            enabled: over.enabled.or(self.enabled),
            bucket: over.bucket.clone().or_else(|| self.bucket.clone()),
            region: over.region.clone().or_else(|| self.region.clone()),
            profile: over.profile.clone().or_else(|| self.profile.clone()),
            storage_class: over.storage_class.clone().or_else(|| self.storage_class.clone()),
        }
    }
}

impl PartialJobConfig {
    pub fn from_file(path: &Path) -> Result<Self> {
        read_toml(path)
    }

    /// Overlay `job` on these defaults. Set job fields win, nested tables
    /// merge field by field. Exclusions are the defaults' followed by the
    /// job's unless the job turns `use_common_exclude` off.
    pub fn merge(&self, job: &PartialJobConfig) -> PartialJobConfig {
        let use_common_exclude = job.use_common_exclude.or(self.use_common_exclude);
        let exclude = if use_common_exclude.unwrap_or(true) {
            self.exclude.iter().chain(job.exclude.iter()).cloned().collect()
        } else {
            job.exclude.clone()
        };

        PartialJobConfig {
            job_name: job.job_name.clone().or_else(|| self.job_name.clone()),
            source: job.source.clone().or_else(|| self.source.clone()),
            destination: job.destination.clone().or_else(|| self.destination.clone()),
            exclude,
            use_common_exclude,
            max_tarball_size: job.max_tarball_size.or(self.max_tarball_size),
            keep_sets: job.keep_sets.or(self.keep_sets),
            encryption: self.encryption.merge(&job.encryption),
            aws: self.aws.merge(&job.aws),
        }
    }

    /// Apply defaults and validate.
    pub fn resolve(self) -> Result<JobConfig> {
        let job_name = self
            .job_name
            .filter(|n| !n.trim().is_empty())
            .ok_or_else(|| EngineError::Config("job_name is required".to_string()))?;
        let source = required_absolute("source", self.source)?;
        let destination = required_absolute("destination", self.destination)?;

        let max_tarball_size = self.max_tarball_size.unwrap_or_else(default_max_tarball_size);
        if max_tarball_size == 0 {
            return Err(EngineError::Config("max_tarball_size must be at least 1 MB".to_string()));
        }
        let keep_sets = self.keep_sets.unwrap_or_else(default_keep_sets);
        if keep_sets == 0 {
            return Err(EngineError::Config("keep_sets must be at least 1".to_string()));
        }

        let aws = AwsConfig {
            enabled: self.aws.enabled.unwrap_or(false),
            bucket: self.aws.bucket.filter(|b| !b.is_empty()),
            region: self.aws.region.filter(|r| !r.is_empty()),
            profile: self.aws.profile.unwrap_or_else(default_aws_profile),
            storage_class: self.aws.storage_class.unwrap_or_else(default_storage_class),
        };
        if aws.enabled && aws.bucket.is_none() {
            return Err(EngineError::Config("aws.bucket is required when aws is enabled".to_string()));
        }

        Ok(JobConfig {
            job_name,
            source,
            destination,
            exclude: self.exclude,
            use_common_exclude: self.use_common_exclude.unwrap_or(true),
            max_tarball_size,
            keep_sets,
            encryption: EncryptionConfig {
                enabled: self.encryption.enabled.unwrap_or(false),
                passphrase_env: self
                    .encryption
                    .passphrase_env
                    .unwrap_or_else(|| DEFAULT_PASSPHRASE_ENV.to_string()),
            },
            aws,
        })
    }
}

fn required_absolute(field: &str, value: Option<PathBuf>) -> Result<PathBuf> {
    let path = value.ok_or_else(|| EngineError::Config(format!("{} is required", field)))?;
    if !path.is_absolute() {
        return Err(EngineError::Config(format!(
            "{} must be an absolute path, got {}",
            field,
            path.display()
        )));
    }
    Ok(path)
}

impl JobConfig {
    /// Chunk size limit in bytes.
    pub fn max_chunk_bytes(&self) -> u64 {
        self.max_tarball_size.saturating_mul(1024 * 1024)
    }
}
