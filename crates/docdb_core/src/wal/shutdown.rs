//! The `SHUTDOWN` file persisted next to the logfiles.

use crate::error::{CoreError, CoreResult};
use crate::types::{LogfileId, Tick};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

/// Name of the shutdown file inside the WAL directory.
pub const SHUTDOWN_FILE: &str = "SHUTDOWN";

/// Logfile and tick bookkeeping that survives restarts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShutdownInfo {
    /// Last tick handed out.
    pub tick: Tick,
    /// Id of the last fully collected logfile.
    pub last_collected: LogfileId,
    /// Id of the last sealed logfile.
    pub last_sealed: LogfileId,
    /// Seconds since the epoch, set only by a clean shutdown.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shutdown_time: Option<u64>,
}

impl ShutdownInfo {
    /// Path of the shutdown file in `wal_dir`.
    #[must_use]
    pub fn path(wal_dir: &Path) -> PathBuf {
        wal_dir.join(SHUTDOWN_FILE)
    }

    /// Reads the shutdown file, `None` if there is none.
    ///
    /// `last_sealed` is raised to `last_collected` if it lags behind.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::IllegalParameterFile`] if the file is not valid.
    pub fn read(wal_dir: &Path) -> CoreResult<Option<Self>> {
        let path = Self::path(wal_dir);
        let content = match fs::read(&path) {
            Ok(content) => content,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        let mut info: Self = serde_json::from_slice(&content)
            .map_err(|err| CoreError::illegal_parameter_file(&path, err.to_string()))?;
        if info.last_sealed < info.last_collected {
            info.last_sealed = info.last_collected;
        }
        Ok(Some(info))
    }

    /// Writes the file atomically, stamping the time if `clean` is set.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written.
    pub fn write(mut self, wal_dir: &Path, clean: bool) -> CoreResult<()> {
        self.shutdown_time = if clean {
            SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .ok()
                .map(|d| d.as_secs())
        } else {
            None
        };

        let path = Self::path(wal_dir);
        let tmp = path.with_extension("tmp");
        let json = serde_json::to_vec_pretty(&self)?;
        {
            let mut file = fs::File::create(&tmp)?;
            file.write_all(&json)?;
            file.sync_all()?;
        }
        fs::rename(&tmp, &path)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn missing_file_reads_none() {
        let dir = tempdir().unwrap();
        assert_eq!(ShutdownInfo::read(dir.path()).unwrap(), None);
    }

    #[test]
    fn write_and_read_back() {
        let dir = tempdir().unwrap();
        let info = ShutdownInfo {
            tick: Tick::new(99),
            last_collected: LogfileId::new(3),
            last_sealed: LogfileId::new(5),
            shutdown_time: None,
        };
        info.write(dir.path(), true).unwrap();

        let read = ShutdownInfo::read(dir.path()).unwrap().unwrap();
        assert_eq!(read.tick, Tick::new(99));
        assert_eq!(read.last_sealed, LogfileId::new(5));
        assert!(read.shutdown_time.is_some());
        assert!(!dir.path().join("SHUTDOWN.tmp").exists());
    }

    #[test]
    fn uses_camel_case_keys() {
        let dir = tempdir().unwrap();
        ShutdownInfo::default().write(dir.path(), false).unwrap();
        let text = std::fs::read_to_string(ShutdownInfo::path(dir.path())).unwrap();
        assert!(text.contains("lastCollected"));
        assert!(!text.contains("shutdownTime"));
    }

    #[test]
    fn last_sealed_is_clamped() {
        let dir = tempdir().unwrap();
        std::fs::write(
            ShutdownInfo::path(dir.path()),
            r#"{"tick": 10, "lastCollected": 7, "lastSealed": 2}"#,
        )
        .unwrap();
        let read = ShutdownInfo::read(dir.path()).unwrap().unwrap();
        assert_eq!(read.last_sealed, LogfileId::new(7));
    }

    #[test]
    fn garbage_is_illegal_parameter_file() {
        let dir = tempdir().unwrap();
        std::fs::write(ShutdownInfo::path(dir.path()), b"not json").unwrap();
        let err = ShutdownInfo::read(dir.path()).unwrap_err();
        assert!(matches!(err, CoreError::IllegalParameterFile { .. }));
    }
}
