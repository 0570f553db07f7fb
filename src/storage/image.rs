//! Boot-image cache.
//!
//! Images are cached as `<cache>/<name>.raw`, keyed by name only. A miss
//! downloads the source image into a uniquely named scratch file, converts it
//! to raw and renames it into place, so a present `.raw` file is always
//! complete.

use crate::config::AgentConfig;
use crate::error::{Error, Result};
use crate::executor::{Cmd, Executor};
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use tempfile::TempPath;

pub struct ImageCache<'a> {
    exec: &'a dyn Executor,
    config: &'a AgentConfig,
}

impl<'a> ImageCache<'a> {
    pub fn new(exec: &'a dyn Executor, config: &'a AgentConfig) -> Self {
        Self { exec, config }
    }

    /// Cached raw image path for `name`.
    pub fn raw_path(&self, name: &str) -> PathBuf {
        self.config.image_cache_dir.join(format!("{}.raw", name))
    }

    /// Return the raw image for `name`, fetching it on a miss.
    ///
    /// `url` overrides the configured source.
    pub fn acquire(&self, name: &str, url: Option<&str>) -> Result<PathBuf> {
        validate_image_name(name)?;
        let raw = self.raw_path(name);
        if raw.exists() {
            tracing::debug!(image = name, path = %raw.display(), "boot image cached");
            return Ok(raw);
        }

        let url = url
            .or_else(|| self.config.image_url(name))
            .ok_or_else(|| Error::ImageDownloadFailed {
                image: name.to_string(),
                reason: "no source url configured".to_string(),
            })?;

        let cache_dir = &self.config.image_cache_dir;
        fs::create_dir_all(cache_dir)?;
        // Per-invocation scratch names; concurrent misses on the same image
        // each convert privately and the last rename wins.
        let download = scratch_path(cache_dir, name, ".download")?;
        let tmp = scratch_path(cache_dir, name, ".raw.tmp")?;

        tracing::info!(image = name, url, "downloading boot image");
        self.exec
            .run(&Cmd::new("curl").argv(&["-f", "-L", "-o", &download.to_string_lossy(), url]))
            .map_err(|e| Error::ImageDownloadFailed {
                image: name.to_string(),
                reason: e.to_string(),
            })?;

        let converted = self.exec.run(&Cmd::new("qemu-img").argv(&[
            "convert",
            "-p",
            "-f",
            "qcow2",
            "-O",
            "raw",
            &download.to_string_lossy(),
            &tmp.to_string_lossy(),
        ]));
        download.close()?;
        converted.map_err(|e| Error::ImageConvertFailed {
            image: name.to_string(),
            reason: e.to_string(),
        })?;

        tmp.persist(&raw).map_err(|e| Error::Io(e.error))?;
        tracing::info!(image = name, path = %raw.display(), "boot image ready");
        Ok(raw)
    }
}

/// Empty world-readable scratch file in `dir`, removed again when dropped.
fn scratch_path(dir: &Path, name: &str, suffix: &str) -> Result<TempPath> {
    Ok(tempfile::Builder::new()
        .prefix(&format!(".{}.", name))
        .suffix(suffix)
        .permissions(fs::Permissions::from_mode(0o644))
        .tempfile_in(dir)?
        .into_temp_path())
}

fn validate_image_name(name: &str) -> Result<()> {
    let ok = !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_.".contains(c))
        && !name.starts_with('.');
    if ok {
        Ok(())
    } else {
        Err(Error::params(format!("invalid boot image name '{}'", name)))
    }
}

pub(crate) fn remove_if_exists(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::RecordingExecutor;
    use std::cell::Cell;

    #[test]
    fn test_cache_hit_runs_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let config = AgentConfig::rooted_at(dir.path());
        fs::create_dir_all(&config.image_cache_dir).unwrap();
        fs::write(config.image_cache_dir.join("ubuntu-jammy.raw"), b"raw").unwrap();

        let exec = RecordingExecutor::new();
        let path = ImageCache::new(&exec, &config)
            .acquire("ubuntu-jammy", None)
            .unwrap();
        assert_eq!(path, config.image_cache_dir.join("ubuntu-jammy.raw"));
        assert!(exec.calls().is_empty());
    }

    fn cache_entries(config: &AgentConfig) -> Vec<String> {
        let mut names: Vec<String> = fs::read_dir(&config.image_cache_dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        names
    }

    #[test]
    fn test_miss_downloads_and_converts() {
        let dir = tempfile::tempdir().unwrap();
        let config = AgentConfig::rooted_at(dir.path());
        let exec = RecordingExecutor::new();
        let cache = ImageCache::new(&exec, &config);

        let path = cache.acquire("ubuntu-jammy", None).unwrap();
        assert!(path.exists());
        assert_eq!(cache_entries(&config), vec!["ubuntu-jammy.raw"]);

        let lines = exec.command_lines();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].starts_with("curl -f -L -o "));
        assert!(lines[0].contains(".download "));
        assert!(lines[0].ends_with("ubuntu-22.04-server-cloudimg-amd64.img"));
        assert!(lines[1].starts_with("qemu-img convert -p -f qcow2 -O raw "));
        assert!(lines[1].ends_with(".raw.tmp"));
    }

    /// Runs a second VM's acquire of the same image while the first one is
    /// converting.
    struct ConcurrentMiss<'c> {
        config: &'c AgentConfig,
        inner: RecordingExecutor,
        other: RecordingExecutor,
        fired: Cell<bool>,
    }

    impl Executor for ConcurrentMiss<'_> {
        fn run(&self, cmd: &Cmd) -> Result<String> {
            if cmd.program() == "qemu-img" && !self.fired.replace(true) {
                ImageCache::new(&self.other, self.config).acquire("ubuntu-jammy", None)?;
            }
            self.inner.run(cmd)
        }
    }

    #[test]
    fn test_concurrent_misses_do_not_collide() {
        let dir = tempfile::tempdir().unwrap();
        let config = AgentConfig::rooted_at(dir.path());
        let exec = ConcurrentMiss {
            config: &config,
            inner: RecordingExecutor::new(),
            other: RecordingExecutor::new(),
            fired: Cell::new(false),
        };

        let path = ImageCache::new(&exec, &config)
            .acquire("ubuntu-jammy", None)
            .unwrap();
        assert!(path.exists());
        assert_eq!(cache_entries(&config), vec!["ubuntu-jammy.raw"]);

        // Both invocations used their own scratch files.
        let first = exec.inner.command_lines();
        let second = exec.other.command_lines();
        assert_eq!(first.len(), 2);
        assert_eq!(second.len(), 2);
        assert_ne!(first[0], second[0]);
        assert_ne!(first[1], second[1]);
    }

    #[test]
    fn test_download_failure() {
        let dir = tempfile::tempdir().unwrap();
        let config = AgentConfig::rooted_at(dir.path());
        let exec = RecordingExecutor::new().fail_when("curl", 22, "404 Not Found");
        let err = ImageCache::new(&exec, &config)
            .acquire("custom", Some("https://example.invalid/x.img"))
            .unwrap_err();
        assert!(matches!(err, Error::ImageDownloadFailed { .. }));
        assert_eq!(exec.calls().len(), 1);
    }

    #[test]
    fn test_convert_failure_leaves_no_raw() {
        let dir = tempfile::tempdir().unwrap();
        let config = AgentConfig::rooted_at(dir.path());
        let exec = RecordingExecutor::new().fail_when("qemu-img", 1, "unknown format");
        let cache = ImageCache::new(&exec, &config);
        let err = cache.acquire("almalinux-9", None).unwrap_err();
        assert!(matches!(err, Error::ImageConvertFailed { .. }));
        assert!(!cache.raw_path("almalinux-9").exists());
        assert!(cache_entries(&config).is_empty());
    }

    #[test]
    fn test_unknown_image_without_url() {
        let dir = tempfile::tempdir().unwrap();
        let config = AgentConfig::rooted_at(dir.path());
        let exec = RecordingExecutor::new();
        let err = ImageCache::new(&exec, &config)
            .acquire("nonexistent", None)
            .unwrap_err();
        assert!(matches!(err, Error::ImageDownloadFailed { .. }));
        assert!(exec.calls().is_empty());
    }

    #[test]
    fn test_image_name_validation() {
        let exec = RecordingExecutor::new();
        let config = AgentConfig::default();
        let cache = ImageCache::new(&exec, &config);
        assert!(matches!(
            cache.acquire("../etc/passwd", None),
            Err(Error::InvalidParams(_))
        ));
        assert!(cache.acquire("", None).is_err());
    }
}
