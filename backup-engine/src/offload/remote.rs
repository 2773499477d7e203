//! Mirroring backup sets to S3.

use crate::config::AwsConfig;
use crate::utils::{sanitize_name, EngineError, Result};
use chrono::Local;
use std::ffi::OsStr;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Command, Output, Stdio};

pub const SET_PREFIX: &str = "backup_set_";

/// Object storage as the engine uses it: one bucket, slash-separated
/// prefixes acting as directories.
pub trait RemoteStore {
    fn bucket_exists(&self) -> Result<bool>;
    fn create_bucket(&self) -> Result<()>;
    /// Put and delete a small test object next to `prefix`.
    fn check_writable(&self, prefix: &str) -> Result<()>;
    /// Mirror the contents of `local` under `prefix/`.
    fn upload_dir(&self, local: &Path, prefix: &str) -> Result<()>;
    /// Immediate child "directories" of `prefix/`, without trailing slash.
    fn list_prefixes(&self, prefix: &str) -> Result<Vec<String>>;
    /// Delete everything under `prefix/`.
    fn remove_prefix(&self, prefix: &str) -> Result<()>;
}

/// Where one job's sets live remotely.
pub struct RemoteTarget<'a> {
    pub store: &'a dyn RemoteStore,
    pub host: String,
    pub job: String,
}

impl<'a> RemoteTarget<'a> {
    pub fn new(store: &'a dyn RemoteStore, host: &str, job: &str) -> Self {
        Self {
            store,
            host: host.to_string(),
            job: job.to_string(),
        }
    }

    /// `<host>/<job>`
    pub fn job_prefix(&self) -> String {
        format!("{}/{}", sanitize_name(&self.host), sanitize_name(&self.job))
    }

    /// `<host>/<job>/backup_set_<set>`
    pub fn set_prefix(&self, set_name: &str) -> String {
        format!("{}/{}{}", self.job_prefix(), SET_PREFIX, set_name)
    }

    /// Make sure the bucket exists, creating it when it does not.
    pub fn ensure_bucket(&self) -> Result<()> {
        if !self.store.bucket_exists()? {
            tracing::info!("remote bucket missing, creating it");
            self.store.create_bucket()?;
        }
        Ok(())
    }

    /// Check the bucket exists and accepts writes under this job, without
    /// creating anything.
    pub fn check_accessible(&self) -> Result<()> {
        if !self.store.bucket_exists()? {
            return Err(EngineError::RemoteSync("remote bucket does not exist".to_string()));
        }
        self.store.check_writable(&self.job_prefix())
    }

    /// Upload `set_dir` and drop every other set of this job from the
    /// remote, leaving only the one just mirrored.
    pub fn sync_set(&self, set_dir: &Path, set_name: &str) -> Result<String> {
        self.ensure_bucket()?;

        let prefix = self.set_prefix(set_name);
        self.store.upload_dir(set_dir, &prefix)?;
        tracing::info!(prefix = %prefix, "backup set mirrored to remote");

        let current = format!("{}{}", SET_PREFIX, set_name);
        for child in self.store.list_prefixes(&self.job_prefix())? {
            if child.starts_with(SET_PREFIX) && child != current {
                let stale = format!("{}/{}", self.job_prefix(), child);
                self.store.remove_prefix(&stale)?;
                tracing::info!(prefix = %stale, "removed superseded remote set");
            }
        }
        Ok(prefix)
    }
}

/// [`RemoteStore`] backed by the `aws` command line client.
#[derive(Debug, Clone)]
pub struct AwsCliStore {
    program: PathBuf,
    bucket: String,
    region: Option<String>,
    profile: String,
    storage_class: String,
}

impl AwsCliStore {
    pub fn from_config(aws: &AwsConfig) -> Result<Self> {
        let bucket = aws
            .bucket
            .clone()
            .filter(|b| !b.is_empty())
            .ok_or_else(|| EngineError::Config("aws.bucket is required when aws is enabled".to_string()))?;
        Ok(Self {
            program: PathBuf::from("aws"),
            bucket,
            region: aws.region.clone(),
            profile: aws.profile.clone(),
            storage_class: aws.storage_class.clone(),
        })
    }

    pub fn with_program(mut self, program: impl Into<PathBuf>) -> Self {
        self.program = program.into();
        self
    }

    fn url(&self, key: &str) -> String {
        format!("s3://{}/{}", self.bucket, key)
    }

    fn command<I, S>(&self, args: I) -> Command
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let mut cmd = Command::new(&self.program);
        cmd.args(args).args(["--profile", self.profile.as_str()]);
        if let Some(region) = &self.region {
            cmd.args(["--region", region.as_str()]);
        }
        cmd
    }

    fn run(&self, mut cmd: Command) -> Result<Output> {
        let output = cmd
            .stdin(Stdio::null())
            .output()
            .map_err(|e| EngineError::RemoteSync(format!("failed to start {}: {}", self.program.display(), e)))?;
        check(output)
    }
}

fn check(output: Output) -> Result<Output> {
    if output.status.success() {
        Ok(output)
    } else {
        Err(EngineError::RemoteSync(format!(
            "aws exited with {}: {}",
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        )))
    }
}

impl RemoteStore for AwsCliStore {
    fn bucket_exists(&self) -> Result<bool> {
        let output = self
            .command(["s3api", "head-bucket", "--bucket", self.bucket.as_str()])
            .stdin(Stdio::null())
            .output()
            .map_err(|e| EngineError::RemoteSync(format!("failed to start {}: {}", self.program.display(), e)))?;
        Ok(output.status.success())
    }

    fn create_bucket(&self) -> Result<()> {
        let mut cmd = self.command(["s3api", "create-bucket", "--bucket", self.bucket.as_str()]);
        // us-east-1 rejects an explicit location constraint
        if let Some(region) = self.region.as_deref().filter(|r| *r != "us-east-1") {
            cmd.arg("--create-bucket-configuration")
                .arg(format!("LocationConstraint={}", region));
        }
        self.run(cmd)?;
        Ok(())
    }

    fn check_writable(&self, prefix: &str) -> Result<()> {
        let key = format!(
            "{}_dryrun_test_{}.txt",
            prefix.trim_end_matches('/'),
            Local::now().format("%Y%m%d_%H%M%S")
        );
        let url = self.url(&key);

        let mut child = self
            .command(["s3", "cp", "-", url.as_str()])
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| EngineError::RemoteSync(format!("failed to start {}: {}", self.program.display(), e)))?;
        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(b"backup-engine write test\n")?;
        }
        check(child.wait_with_output()?)?;

        self.run(self.command(["s3", "rm", url.as_str()]))?;
        Ok(())
    }

    fn upload_dir(&self, local: &Path, prefix: &str) -> Result<()> {
        let mut cmd = self.command(["s3", "sync"]);
        cmd.arg(local)
            .arg(format!("{}/", self.url(prefix)))
            .args(["--storage-class", self.storage_class.as_str()]);
        self.run(cmd)?;
        Ok(())
    }

    fn list_prefixes(&self, prefix: &str) -> Result<Vec<String>> {
        let url = format!("{}/", self.url(prefix));
        let output = self.command(["s3", "ls", url.as_str()]).output();
        let output = output
            .map_err(|e| EngineError::RemoteSync(format!("failed to start {}: {}", self.program.display(), e)))?;
        // `aws s3 ls` exits 1 when nothing matches
        if !output.status.success() && output.stderr.is_empty() {
            return Ok(Vec::new());
        }
        let output = check(output)?;
        Ok(parse_ls_prefixes(&String::from_utf8_lossy(&output.stdout)))
    }

    fn remove_prefix(&self, prefix: &str) -> Result<()> {
        let url = format!("{}/", self.url(prefix));
        self.run(self.command(["s3", "rm", url.as_str(), "--recursive"]))?;
        Ok(())
    }
}

/// Pull `PRE name/` lines out of `aws s3 ls` output.
fn parse_ls_prefixes(listing: &str) -> Vec<String> {
    listing
        .lines()
        .filter_map(|line| line.trim().strip_prefix("PRE "))
        .map(|name| name.trim().trim_end_matches('/').to_string())
        .filter(|name| !name.is_empty())
        .collect()
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::collections::BTreeSet;
    use std::rc::Rc;

    /// In-memory store recording uploaded prefixes.
    #[derive(Default)]
    pub(crate) struct FakeStore {
        pub bucket: RefCell<bool>,
        pub prefixes: RefCell<BTreeSet<String>>,
        pub fail_uploads: bool,
    }

    impl RemoteStore for FakeStore {
        fn bucket_exists(&self) -> Result<bool> {
            Ok(*self.bucket.borrow())
        }

        fn create_bucket(&self) -> Result<()> {
            *self.bucket.borrow_mut() = true;
            Ok(())
        }

        fn check_writable(&self, _prefix: &str) -> Result<()> {
            if *self.bucket.borrow() {
                Ok(())
            } else {
                Err(EngineError::RemoteSync("no such bucket".to_string()))
            }
        }

        fn upload_dir(&self, _local: &Path, prefix: &str) -> Result<()> {
            if self.fail_uploads {
                return Err(EngineError::RemoteSync("upload refused".to_string()));
            }
            self.prefixes.borrow_mut().insert(prefix.to_string());
            Ok(())
        }

        fn list_prefixes(&self, prefix: &str) -> Result<Vec<String>> {
            let parent = format!("{}/", prefix);
            Ok(self
                .prefixes
                .borrow()
                .iter()
                .filter_map(|p| p.strip_prefix(&parent))
                .filter_map(|rest| rest.split('/').next())
                .map(str::to_string)
                .collect())
        }

        fn remove_prefix(&self, prefix: &str) -> Result<()> {
            self.prefixes
                .borrow_mut()
                .retain(|p| p != prefix && !p.starts_with(&format!("{}/", prefix)));
            Ok(())
        }
    }

    /// Lets a test keep a handle on a store it hands to the engine.
    impl RemoteStore for Rc<FakeStore> {
        fn bucket_exists(&self) -> Result<bool> {
            self.as_ref().bucket_exists()
        }

        fn create_bucket(&self) -> Result<()> {
            self.as_ref().create_bucket()
        }

        fn check_writable(&self, prefix: &str) -> Result<()> {
            self.as_ref().check_writable(prefix)
        }

        fn upload_dir(&self, local: &Path, prefix: &str) -> Result<()> {
            self.as_ref().upload_dir(local, prefix)
        }

        fn list_prefixes(&self, prefix: &str) -> Result<Vec<String>> {
            self.as_ref().list_prefixes(prefix)
        }

        fn remove_prefix(&self, prefix: &str) -> Result<()> {
            self.as_ref().remove_prefix(prefix)
        }
    }

    #[test]
    fn test_sync_set_keeps_only_current_set() {
        let store = FakeStore::default();
        store
            .prefixes
            .borrow_mut()
            .insert("web_01/docs/backup_set_20240101_000000".to_string());
        store
            .prefixes
            .borrow_mut()
            .insert("web_01/photos/backup_set_20240101_000000".to_string());

        let target = RemoteTarget::new(&store, "web.01", "docs");
        let dir = tempfile::TempDir::new().unwrap();
        let prefix = target.sync_set(dir.path(), "20240201_000000").unwrap();

        assert_eq!(prefix, "web_01/docs/backup_set_20240201_000000");
        assert!(*store.bucket.borrow());
        let left: Vec<_> = store.prefixes.borrow().iter().cloned().collect();
        assert_eq!(
            left,
            vec![
                "web_01/docs/backup_set_20240201_000000".to_string(),
                "web_01/photos/backup_set_20240101_000000".to_string(),
            ]
        );
    }

    #[test]
    fn test_check_accessible_never_creates_bucket() {
        let store = FakeStore::default();
        let target = RemoteTarget::new(&store, "host", "docs");
        assert!(matches!(target.check_accessible(), Err(EngineError::RemoteSync(_))));
        assert!(!*store.bucket.borrow());

        *store.bucket.borrow_mut() = true;
        target.check_accessible().unwrap();
        assert!(store.prefixes.borrow().is_empty());
    }

    #[test]
    fn test_parse_ls_prefixes() {
        let listing = "                           PRE backup_set_20240101_000000/\n\
                       2024-01-01 00:00:00        123 last_full.txt\n\
                                                  PRE backup_set_20240102_000000/\n";
        assert_eq!(
            parse_ls_prefixes(listing),
            vec!["backup_set_20240101_000000", "backup_set_20240102_000000"]
        );
    }

    #[test]
    fn test_from_config_requires_bucket() {
        let aws = AwsConfig {
            enabled: true,
            bucket: None,
            region: None,
            profile: "default".to_string(),
            storage_class: "STANDARD".to_string(),
        };
        assert!(matches!(AwsCliStore::from_config(&aws), Err(EngineError::Config(_))));
    }
}
