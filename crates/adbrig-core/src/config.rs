use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use tracing::{info, warn};

/// Overrides every other adb location candidate when set.
pub const ADB_PATH_ENV: &str = "ADBRIG_ADB_PATH";

/// Well-known pseudo-terminal helper. Many adb builds only emit fine-grained
/// progress text when they detect an interactive terminal.
pub const PTY_HELPER_PATH: &str = "/usr/bin/script";

const DEFAULT_LIST_TIMEOUT: Duration = Duration::from_secs(5);

/// Resolved adb location plus engine knobs. Produced once during setup and
/// passed into every runner; there is no process-wide cached path.
#[derive(Debug, Clone)]
pub struct AdbConfig {
    adb_path: PathBuf,
    pty_helper: Option<PathBuf>,
    list_timeout: Duration,
}

impl AdbConfig {
    /// Resolve the adb binary: env override, then the application-supplied
    /// default, then a binary adjacent to the running executable. Each
    /// candidate must exist as a file; otherwise fall back to PATH lookup.
    pub fn resolve(app_default: Option<&Path>) -> Self {
        let mut candidates: Vec<PathBuf> = Vec::new();
        if let Ok(path) = std::env::var(ADB_PATH_ENV) {
            if !path.is_empty() {
                candidates.push(PathBuf::from(path));
            }
        }
        if let Some(path) = app_default {
            candidates.push(path.to_path_buf());
        }
        if let Ok(exe) = std::env::current_exe() {
            if let Some(dir) = exe.parent() {
                candidates.push(dir.join(adb_file_name()));
            }
        }

        for candidate in candidates {
            if candidate.is_file() {
                info!("adb path: {}", candidate.display());
                return Self::with_path(candidate);
            }
        }

        warn!("adb not found (set {ADB_PATH_ENV}); relying on PATH lookup");
        Self::with_path(adb_file_name())
    }

    pub fn with_path(path: impl Into<PathBuf>) -> Self {
        Self {
            adb_path: path.into(),
            pty_helper: default_pty_helper(),
            list_timeout: DEFAULT_LIST_TIMEOUT,
        }
    }

    pub fn adb_path(&self) -> &Path {
        &self.adb_path
    }

    pub fn list_timeout(&self) -> Duration {
        self.list_timeout
    }

    pub fn with_list_timeout(mut self, timeout: Duration) -> Self {
        self.list_timeout = timeout;
        self
    }

    /// Disable the pseudo-terminal wrapper even where the helper exists.
    pub fn without_pty_helper(mut self) -> Self {
        self.pty_helper = None;
        self
    }

    /// The helper, only when it actually exists on this host.
    pub(crate) fn pty_helper(&self) -> Option<&Path> {
        self.pty_helper.as_deref().filter(|path| path.is_file())
    }

    /// The configured helper path regardless of existence.
    pub(crate) fn pty_helper_configured(&self) -> Option<&Path> {
        self.pty_helper.as_deref()
    }
}

fn adb_file_name() -> &'static str {
    if cfg!(windows) {
        "adb.exe"
    } else {
        "adb"
    }
}

fn default_pty_helper() -> Option<PathBuf> {
    if cfg!(unix) {
        Some(PathBuf::from(PTY_HELPER_PATH))
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn with_path_keeps_defaults() {
        let config = AdbConfig::with_path("/opt/adb");
        assert_eq!(config.adb_path(), Path::new("/opt/adb"));
        assert_eq!(config.list_timeout(), DEFAULT_LIST_TIMEOUT);
    }

    #[test]
    fn list_timeout_is_adjustable() {
        let config = AdbConfig::with_path("adb").with_list_timeout(Duration::from_millis(250));
        assert_eq!(config.list_timeout(), Duration::from_millis(250));
    }

    #[test]
    fn disabled_pty_helper_is_never_reported() {
        let config = AdbConfig::with_path("adb").without_pty_helper();
        assert!(config.pty_helper().is_none());
        assert!(config.pty_helper_configured().is_none());
    }
}
