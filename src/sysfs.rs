//! # Sysfs Access
//!
//! ## Responsibility
//! Reads and writes single-value kernel attribute files below one sanctioned
//! root (normally `/sys`), and parses the bracket-marked "active option"
//! format many of those files use (`noop deadline [cfq]`).
//!
//! ## Guarantees
//! - Safety boundary: every write is checked against the sanctioned root after
//!   lexical normalization; `..` cannot escape it
//! - Non-panicking: I/O failures are logged and reported as `None` / `false`
//!
//! ## NOT Responsible For
//! - Glob expansion (the sysfs plugin expands patterns, then writes here)
//! - Knowing which attribute belongs to which device class

use std::fs;
use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};

use tracing::{debug, error};

use crate::error::{Result, TuneError};

/// Default sanctioned root for attribute writes.
pub const DEFAULT_SYSFS_ROOT: &str = "/sys";

/// Handle on a sysfs tree rooted at a sanctioned directory.
///
/// Cheap to clone. Tests point it at a temporary directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sysfs {
    root: PathBuf,
}

impl Default for Sysfs {
    fn default() -> Self {
        Self::new(DEFAULT_SYSFS_ROOT)
    }
}

impl Sysfs {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: normalize(&root.into()) }
    }

    /// The sanctioned root.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Join a root-relative path.
    pub fn path(&self, relative: impl AsRef<Path>) -> PathBuf {
        self.root.join(relative)
    }

    /// Path of `suffix` inside a per-device directory such as `block/<dev>`.
    ///
    /// Device names containing `/` are stored by the kernel with `!`
    /// (`cciss/c0d0` → `cciss!c0d0`); that spelling wins when it exists.
    pub fn device_path(&self, class_dir: &str, device: &str, suffix: &str) -> PathBuf {
        if device.contains('/') {
            let mangled = self
                .path(class_dir)
                .join(device.replace('/', "!"))
                .join(suffix);
            if mangled.exists() {
                return mangled;
            }
        }
        self.path(class_dir).join(device).join(suffix)
    }

    /// Whether `path` lies inside the sanctioned root.
    pub fn is_sanctioned(&self, path: &Path) -> bool {
        path.is_absolute() && normalize(path).starts_with(&self.root)
    }

    /// Read an attribute, trimmed.
    ///
    /// A missing file yields `None`; it is only logged as an error when
    /// `ignore_missing` is false.
    pub fn read(&self, path: &Path, ignore_missing: bool) -> Option<String> {
        match fs::read_to_string(path) {
            Ok(content) => Some(content.trim().to_string()),
            Err(e) if e.kind() == ErrorKind::NotFound && ignore_missing => {
                debug!(path = %path.display(), "attribute missing, ignored");
                None
            }
            Err(e) => {
                error!(path = %path.display(), error = %e, "failed to read attribute");
                None
            }
        }
    }

    /// Write `value` to `path`, refusing anything outside the sanctioned root.
    pub fn try_write(&self, path: &Path, value: &str) -> Result<()> {
        if !self.is_sanctioned(path) {
            return Err(TuneError::OutsideSysfs {
                path: path.to_path_buf(),
                root: self.root.clone(),
            });
        }
        fs::write(path, value).map_err(|source| TuneError::Io {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Logging wrapper around [`try_write`](Self::try_write).
    pub fn write(&self, path: &Path, value: &str) -> bool {
        match self.try_write(path, value) {
            Ok(()) => {
                debug!(path = %path.display(), value, "attribute written");
                true
            }
            Err(e) => {
                error!(error = %e, "attribute write failed");
                false
            }
        }
    }
}

/// Lexically normalize a path: drop `.`, fold `..` into its parent.
///
/// Never touches the filesystem, so symlinks are not resolved.
pub fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

/// Extract the active option from an attribute's content.
///
/// `noop deadline [cfq]` → `cfq`. Without brackets, `split` returns the first
/// whitespace-separated word, otherwise the whole (trimmed) text.
pub fn active_option(content: &str, split: bool) -> String {
    if let Some(open) = content.find('[') {
        if let Some(len) = content[open + 1..].find(']') {
            let inner = &content[open + 1..open + 1 + len];
            if !inner.is_empty() {
                return inner.to_string();
            }
        }
    }
    let trimmed = content.trim();
    if split {
        trimmed.split_whitespace().next().unwrap_or("").to_string()
    } else {
        trimmed.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("noop deadline [cfq]", true, "cfq")]
    #[case("[mq-deadline] kyber bfq none", true, "mq-deadline")]
    #[case("always [madvise] never", false, "madvise")]
    #[case("128", true, "128")]
    #[case("foo bar", true, "foo")]
    #[case("foo bar", false, "foo bar")]
    #[case("", true, "")]
    fn test_active_option(#[case] content: &str, #[case] split: bool, #[case] want: &str) {
        assert_eq!(active_option(content, split), want);
    }

    #[test]
    fn test_normalize_folds_parent_dirs() {
        assert_eq!(normalize(Path::new("/sys/block/../../etc")), PathBuf::from("/etc"));
        assert_eq!(normalize(Path::new("/sys/./block/sda")), PathBuf::from("/sys/block/sda"));
    }

    #[test]
    fn test_is_sanctioned_rejects_escape() {
        let sysfs = Sysfs::new("/sys");
        assert!(sysfs.is_sanctioned(Path::new("/sys/block/sda/queue/scheduler")));
        assert!(!sysfs.is_sanctioned(Path::new("/sys/../etc/shadow")));
        assert!(!sysfs.is_sanctioned(Path::new("/system/file")));
        assert!(!sysfs.is_sanctioned(Path::new("sys/block")));
    }

    #[test]
    fn test_try_write_outside_root_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let sysfs = Sysfs::new(dir.path().join("sys"));
        let target = dir.path().join("outside");
        let err = sysfs.try_write(&target, "1").unwrap_err();
        assert!(matches!(err, TuneError::OutsideSysfs { .. }));
        assert!(!target.exists(), "refused write must not create the file");
    }

    #[test]
    fn test_read_write_roundtrip_trims() {
        let dir = tempfile::tempdir().unwrap();
        let sysfs = Sysfs::new(dir.path());
        let file = sysfs.path("attr");
        assert!(sysfs.write(&file, "42\n"));
        assert_eq!(sysfs.read(&file, false).as_deref(), Some("42"));
    }

    #[test]
    fn test_read_missing_returns_none() {
        let dir = tempfile::tempdir().unwrap();
        let sysfs = Sysfs::new(dir.path());
        assert_eq!(sysfs.read(&sysfs.path("nope"), true), None);
        assert_eq!(sysfs.read(&sysfs.path("nope"), false), None);
    }

    #[test]
    fn test_device_path_prefers_mangled_name() {
        let dir = tempfile::tempdir().unwrap();
        let sysfs = Sysfs::new(dir.path());
        fs::create_dir_all(sysfs.path("block/cciss!c0d0/queue")).unwrap();
        let p = sysfs.device_path("block", "cciss/c0d0", "queue/scheduler");
        assert!(p.ends_with("block/cciss!c0d0/queue/scheduler"), "{}", p.display());

        let plain = sysfs.device_path("block", "sda", "stat");
        assert!(plain.ends_with("block/sda/stat"));
    }
}
