//! Naming of the output directory and its backup and failed slots.
//!
//! For an output directory `build` under the repository root:
//! - backup slots are `build.<unix timestamp>`
//! - failed slots are `build.failed.<n>` for the smallest unused `n`

use std::path::{Path, PathBuf};

use tokio::fs;

use crate::config::BuildConfig;

#[derive(Debug, Clone)]
pub struct BuildLayout {
    repo_path: PathBuf,
    build_dir: String,
}

impl BuildLayout {
    pub fn new(repo_path: impl Into<PathBuf>, build_dir: impl Into<String>) -> Self {
        Self {
            repo_path: repo_path.into(),
            build_dir: build_dir.into(),
        }
    }

    pub fn from_config(config: &BuildConfig) -> Self {
        Self::new(config.repo_path.clone(), config.build_dir.clone())
    }

    pub fn repo_path(&self) -> &Path {
        &self.repo_path
    }

    /// The primary output directory
    pub fn output_dir(&self) -> PathBuf {
        self.repo_path.join(&self.build_dir)
    }

    pub fn backup_slot(&self, timestamp: i64) -> PathBuf {
        self.repo_path
            .join(format!("{}.{}", self.build_dir, timestamp))
    }

    pub fn failed_slot(&self, n: u32) -> PathBuf {
        self.repo_path
            .join(format!("{}.failed.{}", self.build_dir, n))
    }

    /// Parse the timestamp out of a backup slot name, if it is one.
    pub fn backup_timestamp(&self, file_name: &str) -> Option<i64> {
        let suffix = file_name
            .strip_prefix(self.build_dir.as_str())?
            .strip_prefix('.')?;
        if suffix.is_empty() || !suffix.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        suffix.parse().ok()
    }

    /// First failed slot that does not exist yet
    pub async fn next_failed_slot(&self) -> std::io::Result<PathBuf> {
        let mut n = 0;
        loop {
            let candidate = self.failed_slot(n);
            if !fs::try_exists(&candidate).await? {
                return Ok(candidate);
            }
            n += 1;
        }
    }

    /// Backup slot with the greatest timestamp not older than `not_before`
    pub async fn latest_backup(&self, not_before: i64) -> std::io::Result<Option<PathBuf>> {
        let mut entries = fs::read_dir(&self.repo_path).await?;
        let mut latest: Option<(i64, PathBuf)> = None;

        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let Some(timestamp) = name.to_str().and_then(|n| self.backup_timestamp(n)) else {
                continue;
            };
            if timestamp < not_before {
                continue;
            }
            if !entry.file_type().await?.is_dir() {
                continue;
            }
            if latest.as_ref().map_or(true, |(best, _)| timestamp > *best) {
                latest = Some((timestamp, entry.path()));
            }
        }

        Ok(latest.map(|(_, path)| path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_slot_names() {
        let layout = BuildLayout::new("/repo", "build-wmma");
        assert_eq!(layout.output_dir(), PathBuf::from("/repo/build-wmma"));
        assert_eq!(
            layout.backup_slot(1700000000),
            PathBuf::from("/repo/build-wmma.1700000000")
        );
        assert_eq!(layout.failed_slot(2), PathBuf::from("/repo/build-wmma.failed.2"));
    }

    #[test]
    fn test_backup_timestamp_parsing() {
        let layout = BuildLayout::new("/repo", "build");
        assert_eq!(layout.backup_timestamp("build.1700000000"), Some(1700000000));
        assert_eq!(layout.backup_timestamp("build.failed.0"), None);
        assert_eq!(layout.backup_timestamp("build"), None);
        assert_eq!(layout.backup_timestamp("build."), None);
        assert_eq!(layout.backup_timestamp("build-other.17"), None);
        assert_eq!(layout.backup_timestamp("build.+17"), None);
    }

    #[tokio::test]
    async fn test_next_failed_slot_skips_existing() {
        let temp_dir = TempDir::new().unwrap();
        let layout = BuildLayout::new(temp_dir.path(), "build");

        assert_eq!(layout.next_failed_slot().await.unwrap(), layout.failed_slot(0));

        std::fs::create_dir(layout.failed_slot(0)).unwrap();
        std::fs::create_dir(layout.failed_slot(1)).unwrap();
        assert_eq!(layout.next_failed_slot().await.unwrap(), layout.failed_slot(2));
    }

    #[tokio::test]
    async fn test_next_failed_slot_counts_files_as_taken() {
        let temp_dir = TempDir::new().unwrap();
        let layout = BuildLayout::new(temp_dir.path(), "build");
        std::fs::write(layout.failed_slot(0), "not a dir").unwrap();

        assert_eq!(layout.next_failed_slot().await.unwrap(), layout.failed_slot(1));
    }

    #[tokio::test]
    async fn test_latest_backup() {
        let temp_dir = TempDir::new().unwrap();
        let layout = BuildLayout::new(temp_dir.path(), "build");

        assert!(layout.latest_backup(0).await.unwrap().is_none());

        std::fs::create_dir(layout.backup_slot(100)).unwrap();
        std::fs::create_dir(layout.backup_slot(300)).unwrap();
        std::fs::create_dir(layout.backup_slot(200)).unwrap();
        std::fs::create_dir(layout.failed_slot(0)).unwrap();
        std::fs::create_dir(layout.output_dir()).unwrap();
        std::fs::write(layout.backup_slot(999), "file, not a backup").unwrap();

        assert_eq!(
            layout.latest_backup(0).await.unwrap(),
            Some(layout.backup_slot(300))
        );
    }

    #[tokio::test]
    async fn test_latest_backup_ignores_older_slots() {
        let temp_dir = TempDir::new().unwrap();
        let layout = BuildLayout::new(temp_dir.path(), "build");
        std::fs::create_dir(layout.backup_slot(100)).unwrap();
        std::fs::create_dir(layout.backup_slot(200)).unwrap();

        assert_eq!(
            layout.latest_backup(200).await.unwrap(),
            Some(layout.backup_slot(200))
        );
        assert!(layout.latest_backup(201).await.unwrap().is_none());
    }
}
