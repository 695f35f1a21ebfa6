//! On-disk state: frequency corrections, state snapshots and statistics.

use crate::stats::ClockStats;
use crate::status::DaemonStatus;
use anyhow::{Context, Result};
use log::debug;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone)]
pub struct StateStore {
    dir: PathBuf,
}

impl StateStore {
    pub fn new(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir).with_context(|| format!("failed to create state directory {}", dir.display()))?;
        Ok(StateStore { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn freq_correction_path(&self, clock: &str) -> PathBuf {
        self.dir.join(format!("freq-correction-{}", clock))
    }

    /// Returns `Ok(None)` when no record exists or it cannot be parsed.
    pub fn load_freq_correction(&self, clock: &str) -> io::Result<Option<f64>> {
        let path = self.freq_correction_path(clock);
        match fs::read_to_string(&path) {
            Ok(text) => match text.trim().parse::<f64>() {
                Ok(v) if v.is_finite() => Ok(Some(v)),
                _ => {
                    debug!("ignoring malformed frequency correction in {}", path.display());
                    Ok(None)
                }
            },
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }

    pub fn save_freq_correction(&self, clock: &str, ppb: f64) -> io::Result<()> {
        write_atomic(&self.freq_correction_path(clock), format!("{:.6}\n", ppb).as_bytes())
    }

    pub fn delete_freq_correction(&self, clock: &str) -> io::Result<()> {
        match fs::remove_file(self.freq_correction_path(clock)) {
            Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
            _ => Ok(()),
        }
    }

    pub fn write_state(&self, clock: &str, text: &str) -> io::Result<()> {
        write_atomic(&self.dir.join(format!("state-{}", clock)), text.as_bytes())
    }

    pub fn write_stats(&self, clock: &str, stats: &ClockStats) -> Result<()> {
        let json = serde_json::to_vec_pretty(stats)?;
        let path = self.dir.join(format!("stats-{}.json", clock));
        write_atomic(&path, &json).with_context(|| format!("failed to write {}", path.display()))
    }

    /// `status.json`, read by monitoring tools.
    pub fn write_status(&self, status: &DaemonStatus) -> Result<()> {
        let json = serde_json::to_vec_pretty(status)?;
        let path = self.dir.join("status.json");
        write_atomic(&path, &json).with_context(|| format!("failed to write {}", path.display()))
    }
}

pub(crate) fn write_atomic(path: &Path, data: &[u8]) -> io::Result<()> {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);
    fs::write(&tmp, data)?;
    fs::rename(&tmp, path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_freq_correction_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::new(dir.path()).unwrap();

        assert_eq!(store.load_freq_correction("phc0").unwrap(), None);
        store.save_freq_correction("phc0", -1234.5).unwrap();

        let text = fs::read_to_string(dir.path().join("freq-correction-phc0")).unwrap();
        assert_eq!(text, "-1234.500000\n");
        assert_eq!(store.load_freq_correction("phc0").unwrap(), Some(-1234.5));

        store.delete_freq_correction("phc0").unwrap();
        store.delete_freq_correction("phc0").unwrap();
        assert_eq!(store.load_freq_correction("phc0").unwrap(), None);
    }

    #[test]
    fn test_malformed_record_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::new(dir.path()).unwrap();
        fs::write(dir.path().join("freq-correction-system"), "garbage\n").unwrap();
        assert_eq!(store.load_freq_correction("system").unwrap(), None);
    }

    #[test]
    fn test_write_state_and_stats() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::new(dir.path().join("nested")).unwrap();
        store.write_state("phc1", "in-sync: 1\n").unwrap();
        store.write_stats("phc1", &ClockStats::default()).unwrap();

        assert!(dir.path().join("nested/state-phc1").exists());
        let json = fs::read_to_string(dir.path().join("nested/stats-phc1.json")).unwrap();
        assert!(json.contains("history"));
    }

    #[test]
    fn test_write_status() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::new(dir.path()).unwrap();
        let status = DaemonStatus {
            updated_ts: 1_700_000_000,
            servos: vec![Default::default()],
        };
        store.write_status(&status).unwrap();

        let json = fs::read_to_string(dir.path().join("status.json")).unwrap();
        let restored: DaemonStatus = serde_json::from_str(&json).unwrap();
        assert_eq!(restored.updated_ts, 1_700_000_000);
        assert_eq!(restored.servos.len(), 1);
        assert!(!dir.path().join("status.json.tmp").exists());
    }
}
