// =============================================================================
// State persistence — crash-safe engine state for warm restart
// =============================================================================
//
// Layout under the state directory:
//   trading_state.json                     primary
//   trading_state.backup.json              previous primary
//   trading_state.tmp.json                 write target
//   trading_state_YYYYMMDD_HHMMSS.json     timestamped backups (5 newest kept)
//   .state.lock                            advisory cross-process lock
//
// Save: write tmp -> timestamped copy of primary -> rotate primary to backup
// -> rename tmp to primary, all under the lock. Load walks primary -> backup
// -> newest timestamped backup whose checksum validates, else starts clean.
// =============================================================================

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{info, warn};

use crate::state_machine::{HoldTracking, PortfolioState};

/// Timestamped backups retained.
const MAX_TIMESTAMPED_BACKUPS: usize = 5;

/// Lock acquisition retry interval.
const LOCK_RETRY: Duration = Duration::from_millis(50);

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Why persisted state could not be used.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PersistenceError {
    /// The advisory lock could not be acquired within the timeout.
    LockTimeout(String),
    /// No candidate file had a valid checksum.
    NoValidState,
}

impl std::fmt::Display for PersistenceError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::LockTimeout(path) => write!(f, "state lock timeout on {path}"),
            Self::NoValidState => write!(f, "no persisted state with a valid checksum"),
        }
    }
}

impl std::error::Error for PersistenceError {}

// ---------------------------------------------------------------------------
// Advisory file lock
// ---------------------------------------------------------------------------

/// Exclusive lock file held for the duration of a read-modify-write.
///
/// Acquisition creates the file with `create_new`; the lock is released by
/// removing the file on drop.
pub struct FileLock {
    path: PathBuf,
}

impl FileLock {
    /// Acquire the lock, retrying until `timeout` elapses.
    pub fn acquire(path: impl AsRef<Path>, timeout: Duration) -> Result<Self, PersistenceError> {
        let path = path.as_ref().to_path_buf();
        let deadline = Instant::now() + timeout;

        loop {
            match std::fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&path)
            {
                Ok(_) => return Ok(Self { path }),
                Err(_) => {
                    if Instant::now() >= deadline {
                        return Err(PersistenceError::LockTimeout(
                            path.display().to_string(),
                        ));
                    }
                    std::thread::sleep(LOCK_RETRY);
                }
            }
        }
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

// ---------------------------------------------------------------------------
// TradingState
// ---------------------------------------------------------------------------

/// An open position as persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedPosition {
    pub symbol: String,
    pub quantity: f64,
    pub avg_entry_price: f64,
    pub entry_timestamp: i64,
}

/// The engine state required for a warm restart.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradingState {
    pub psm_state: PortfolioState,
    pub bars_held: u32,
    pub entry_equity: f64,
    pub last_bar_timestamp: i64,
    pub session_id: String,
    #[serde(default)]
    pub save_timestamp: i64,
    #[serde(default)]
    pub save_count: u32,
    #[serde(default)]
    pub positions: Vec<PersistedPosition>,
    #[serde(default)]
    pub hold_tracking: HashMap<String, HoldTracking>,
    #[serde(default)]
    pub checksum: String,
}

impl TradingState {
    pub fn new(session_id: &str, entry_equity: f64) -> Self {
        Self {
            psm_state: PortfolioState::CashOnly,
            bars_held: 0,
            entry_equity,
            last_bar_timestamp: 0,
            session_id: session_id.to_string(),
            save_timestamp: 0,
            save_count: 0,
            positions: Vec::new(),
            hold_tracking: HashMap::new(),
            checksum: String::new(),
        }
    }

    /// SHA-256 over the critical fields.
    pub fn calculate_checksum(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(format!(
            "{:?}|{}|{}|{}|{}",
            self.psm_state,
            self.bars_held,
            self.entry_equity,
            self.last_bar_timestamp,
            self.positions.len()
        ));
        for pos in &self.positions {
            hasher.update(format!(
                "|{}:{}:{}",
                pos.symbol, pos.quantity, pos.avg_entry_price
            ));
        }
        hex::encode(hasher.finalize())
    }

    pub fn validate_checksum(&self) -> bool {
        self.checksum == self.calculate_checksum()
    }
}

// ---------------------------------------------------------------------------
// StatePersistence
// ---------------------------------------------------------------------------

pub struct StatePersistence {
    state_dir: PathBuf,
    primary: PathBuf,
    backup: PathBuf,
    tmp: PathBuf,
    lock: PathBuf,
    lock_timeout: Duration,
}

impl StatePersistence {
    pub fn new(state_dir: impl AsRef<Path>) -> Result<Self> {
        let state_dir = state_dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&state_dir)
            .with_context(|| format!("failed to create state dir {}", state_dir.display()))?;

        Ok(Self {
            primary: state_dir.join("trading_state.json"),
            backup: state_dir.join("trading_state.backup.json"),
            tmp: state_dir.join("trading_state.tmp.json"),
            lock: state_dir.join(".state.lock"),
            state_dir,
            lock_timeout: Duration::from_secs(1),
        })
    }

    /// Persist `state`, rotating backups.
    pub fn save_state(&self, state: &TradingState) -> Result<()> {
        let _lock = FileLock::acquire(&self.lock, self.lock_timeout)?;

        let mut to_save = state.clone();
        to_save.save_timestamp = Utc::now().timestamp_millis();
        to_save.save_count = state.save_count + 1;
        to_save.checksum = to_save.calculate_checksum();

        let content =
            serde_json::to_string_pretty(&to_save).context("failed to serialise state")?;
        std::fs::write(&self.tmp, &content)
            .with_context(|| format!("failed to write {}", self.tmp.display()))?;

        if self.primary.exists() {
            let stamped = self.state_dir.join(format!(
                "trading_state_{}.json",
                Utc::now().format("%Y%m%d_%H%M%S%3f")
            ));
            if let Err(e) = std::fs::copy(&self.primary, &stamped) {
                warn!(error = %e, "failed to create timestamped state backup");
            }
            if let Err(e) = std::fs::rename(&self.primary, &self.backup) {
                warn!(error = %e, "failed to rotate primary state to backup");
            }
        }

        std::fs::rename(&self.tmp, &self.primary)
            .with_context(|| format!("failed to rename into {}", self.primary.display()))?;

        self.cleanup_old_backups();

        info!(
            path = %self.primary.display(),
            save_count = to_save.save_count,
            "trading state saved"
        );
        Ok(())
    }

    /// Load the newest state with a valid checksum, or `None` to start clean.
    pub fn load_state(&self) -> Result<Option<TradingState>> {
        let _lock = FileLock::acquire(&self.lock, self.lock_timeout)?;

        let mut candidates = vec![self.primary.clone(), self.backup.clone()];
        candidates.extend(self.timestamped_backups());

        for path in candidates {
            match Self::load_from(&path) {
                Some(state) if state.validate_checksum() => {
                    info!(path = %path.display(), "trading state loaded");
                    return Ok(Some(state));
                }
                Some(_) => {
                    warn!(path = %path.display(), "state checksum mismatch, trying next candidate");
                }
                None => {}
            }
        }

        warn!("no valid persisted state found, starting clean");
        Ok(None)
    }

    fn load_from(path: &Path) -> Option<TradingState> {
        let content = std::fs::read_to_string(path).ok()?;
        serde_json::from_str(&content).ok()
    }

    /// Timestamped backups, newest first.
    fn timestamped_backups(&self) -> Vec<PathBuf> {
        let Ok(entries) = std::fs::read_dir(&self.state_dir) else {
            return Vec::new();
        };
        let mut backups: Vec<PathBuf> = entries
            .flatten()
            .map(|e| e.path())
            .filter(|p| {
                p.file_name()
                    .and_then(|n| n.to_str())
                    .map_or(false, |n| {
                        n.starts_with("trading_state_") && n.ends_with(".json")
                    })
            })
            .collect();
        backups.sort();
        backups.reverse();
        backups
    }

    fn cleanup_old_backups(&self) {
        let backups = self.timestamped_backups();
        for stale in backups.iter().skip(MAX_TIMESTAMPED_BACKUPS) {
            if let Err(e) = std::fs::remove_file(stale) {
                warn!(path = %stale.display(), error = %e, "failed to prune state backup");
            }
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn temp_dir(tag: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "meridian-sp-{tag}-{}",
            uuid::Uuid::new_v4().simple()
        ));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn sample_state() -> TradingState {
        let mut state = TradingState::new("session-1", 100_000.0);
        state.psm_state = PortfolioState::BaseLong;
        state.bars_held = 7;
        state.last_bar_timestamp = 1_700_000_000_000;
        state.positions.push(PersistedPosition {
            symbol: "QQQ".to_string(),
            quantity: 100.0,
            avg_entry_price: 400.0,
            entry_timestamp: 1_700_000_000_000,
        });
        state.hold_tracking.insert(
            "QQQ".to_string(),
            HoldTracking {
                open_bar_id: 1000,
                horizon: 5,
                entry_price: 400.0,
                earliest_exit_bar_id: 1005,
            },
        );
        state
    }

    #[test]
    fn save_and_load_roundtrip() {
        let dir = temp_dir("roundtrip");
        let persistence = StatePersistence::new(&dir).unwrap();

        persistence.save_state(&sample_state()).unwrap();
        let loaded = persistence.load_state().unwrap().unwrap();

        assert_eq!(loaded.psm_state, PortfolioState::BaseLong);
        assert_eq!(loaded.bars_held, 7);
        assert_eq!(loaded.positions.len(), 1);
        assert_eq!(loaded.hold_tracking["QQQ"].earliest_exit_bar_id, 1005);
        assert!(loaded.validate_checksum());
        assert_eq!(loaded.save_count, 1);

        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn corrupt_primary_falls_back_to_backup() {
        let dir = temp_dir("fallback");
        let persistence = StatePersistence::new(&dir).unwrap();

        persistence.save_state(&sample_state()).unwrap();
        let mut second = sample_state();
        second.bars_held = 9;
        persistence.save_state(&second).unwrap();

        // Corrupt the primary in place.
        std::fs::write(dir.join("trading_state.json"), "{ not json").unwrap();

        let loaded = persistence.load_state().unwrap().unwrap();
        // The backup holds the first save.
        assert_eq!(loaded.bars_held, 7);

        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn tampered_checksum_is_rejected() {
        let dir = temp_dir("tamper");
        let persistence = StatePersistence::new(&dir).unwrap();
        persistence.save_state(&sample_state()).unwrap();

        // Flip a field without recomputing the checksum.
        let path = dir.join("trading_state.json");
        let content = std::fs::read_to_string(&path).unwrap();
        let tampered = content.replace("\"bars_held\": 7", "\"bars_held\": 99");
        std::fs::write(&path, tampered).unwrap();

        // Only the tampered primary exists, so loading starts clean.
        let loaded = persistence.load_state().unwrap();
        assert!(loaded.is_none());

        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn timestamped_backups_are_pruned() {
        let dir = temp_dir("prune");
        let persistence = StatePersistence::new(&dir).unwrap();

        for i in 0..9 {
            let mut state = sample_state();
            state.bars_held = i;
            persistence.save_state(&state).unwrap();
        }

        let backups: Vec<_> = std::fs::read_dir(&dir)
            .unwrap()
            .flatten()
            .filter(|e| {
                let name = e.file_name().to_string_lossy().to_string();
                name.starts_with("trading_state_") && name.ends_with(".json")
            })
            .collect();
        assert!(backups.len() <= MAX_TIMESTAMPED_BACKUPS);

        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn lock_contention_times_out() {
        let dir = temp_dir("lock");
        let lock_path = dir.join(".state.lock");

        let held = FileLock::acquire(&lock_path, Duration::from_millis(100)).unwrap();
        let second = FileLock::acquire(&lock_path, Duration::from_millis(150));
        assert!(matches!(second, Err(PersistenceError::LockTimeout(_))));
        drop(held);

        // Released lock can be re-acquired.
        assert!(FileLock::acquire(&lock_path, Duration::from_millis(100)).is_ok());

        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn missing_state_loads_clean() {
        let dir = temp_dir("clean");
        let persistence = StatePersistence::new(&dir).unwrap();
        assert!(persistence.load_state().unwrap().is_none());
        std::fs::remove_dir_all(&dir).unwrap();
    }
}
