// =============================================================================
// EOD Guardian — forced flatness in the end-of-day window, idempotent per date
// =============================================================================
//
// The rule is anchored to facts, not history:
//
//   should_liquidate = in_window && (has_positions || status != Done)
//
// so a crash and restart mid-window simply re-reads the state file and
// resumes; once the book is flat and the date is marked Done, replays emit
// nothing. Verification failure is fatal and never marks Done.
// =============================================================================

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::broker::BrokerClient;
use crate::et_time::{et_date, EodWindow, SessionClock};
use crate::persistence::FileLock;
use crate::position_book::PositionBook;

/// Longest wait for fills during liquidation.
const LIQUIDATION_WAIT: Duration = Duration::from_secs(3);

/// Poll interval while waiting for flatness.
const LIQUIDATION_POLL: Duration = Duration::from_millis(100);

/// Lock acquisition timeout for the EOD state file.
const STORE_LOCK_TIMEOUT: Duration = Duration::from_secs(1);

// ---------------------------------------------------------------------------
// EOD state
// ---------------------------------------------------------------------------

/// Liquidation progress for one trading date.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EodStatus {
    Pending,
    InProgress,
    Done,
}

impl std::fmt::Display for EodStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "PENDING"),
            Self::InProgress => write!(f, "IN_PROGRESS"),
            Self::Done => write!(f, "DONE"),
        }
    }
}

impl std::str::FromStr for EodStatus {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, ()> {
        match s {
            "PENDING" => Ok(Self::Pending),
            "IN_PROGRESS" => Ok(Self::InProgress),
            "DONE" => Ok(Self::Done),
            _ => Err(()),
        }
    }
}

/// Persisted per-date EOD record.
#[derive(Debug, Clone, PartialEq)]
pub struct EodState {
    pub status: EodStatus,
    pub last_attempt_epoch: i64,
    pub positions_hash: String,
}

impl Default for EodState {
    fn default() -> Self {
        Self {
            status: EodStatus::Pending,
            last_attempt_epoch: 0,
            positions_hash: String::new(),
        }
    }
}

// ---------------------------------------------------------------------------
// EodStateStore — one record per date in a single text file
// ---------------------------------------------------------------------------

/// File-backed store: one `date|status|epoch|hash` line per trading date,
/// atomic tmp-then-rename writes under an advisory lock.
pub struct EodStateStore {
    path: PathBuf,
    lock_path: PathBuf,
}

impl EodStateStore {
    pub fn new(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        let lock_path = path.with_extension("lock");
        Ok(Self { path, lock_path })
    }

    /// Load the record for `date` (Pending when absent).
    pub fn load(&self, date: &str) -> Result<EodState> {
        let _lock = FileLock::acquire(&self.lock_path, STORE_LOCK_TIMEOUT)?;
        Ok(self.read_all()?.into_iter().find_map(|(d, state)| {
            if d == date {
                Some(state)
            } else {
                None
            }
        })
        .unwrap_or_default())
    }

    /// Upsert the record for `date`.
    pub fn save(&self, date: &str, state: &EodState) -> Result<()> {
        let _lock = FileLock::acquire(&self.lock_path, STORE_LOCK_TIMEOUT)?;

        let mut records = self.read_all()?;
        if let Some(existing) = records.iter_mut().find(|(d, _)| d == date) {
            existing.1 = state.clone();
        } else {
            records.push((date.to_string(), state.clone()));
        }

        let mut content = String::new();
        for (d, s) in &records {
            content.push_str(&format!(
                "{d}|{}|{}|{}\n",
                s.status, s.last_attempt_epoch, s.positions_hash
            ));
        }

        let tmp = self.path.with_extension("tmp");
        std::fs::write(&tmp, &content)
            .with_context(|| format!("failed to write {}", tmp.display()))?;
        std::fs::rename(&tmp, &self.path)
            .with_context(|| format!("failed to rename into {}", self.path.display()))?;
        Ok(())
    }

    fn read_all(&self) -> Result<Vec<(String, EodState)>> {
        let Ok(content) = std::fs::read_to_string(&self.path) else {
            return Ok(Vec::new());
        };

        let mut records = Vec::new();
        for line in content.lines().filter(|l| !l.trim().is_empty()) {
            let parts: Vec<&str> = line.splitn(4, '|').collect();
            if parts.len() < 2 {
                warn!(line, "skipping malformed EOD state line");
                continue;
            }
            let Ok(status) = parts[1].parse::<EodStatus>() else {
                warn!(line, "skipping EOD state line with unknown status");
                continue;
            };
            records.push((
                parts[0].to_string(),
                EodState {
                    status,
                    last_attempt_epoch: parts
                        .get(2)
                        .and_then(|s| s.parse().ok())
                        .unwrap_or(0),
                    positions_hash: parts.get(3).unwrap_or(&"").to_string(),
                },
            ));
        }
        Ok(records)
    }
}

// ---------------------------------------------------------------------------
// Decision
// ---------------------------------------------------------------------------

/// The guardian's per-tick verdict.
#[derive(Debug, Clone)]
pub struct EodDecision {
    pub in_window: bool,
    pub has_positions: bool,
    pub should_liquidate: bool,
    pub reason: &'static str,
}

// ---------------------------------------------------------------------------
// EodGuardian
// ---------------------------------------------------------------------------

pub struct EodGuardian {
    broker: Arc<dyn BrokerClient>,
    store: EodStateStore,
    clock: Box<dyn SessionClock>,
    window: EodWindow,
    current_et_date: String,
    current_state: EodState,
    liquidation_in_progress: bool,
}

impl EodGuardian {
    pub fn new(
        broker: Arc<dyn BrokerClient>,
        store: EodStateStore,
        clock: Box<dyn SessionClock>,
        window: EodWindow,
    ) -> Result<Self> {
        let date = et_date(&clock.now_et());
        let state = store.load(&date)?;
        info!(date = %date, status = %state.status, "EOD guardian initialised");
        Ok(Self {
            broker,
            store,
            clock,
            window,
            current_et_date: date,
            current_state: state,
            liquidation_in_progress: false,
        })
    }

    pub fn state(&self) -> &EodState {
        &self.current_state
    }

    /// Whether this date's EOD completed with a verified-flat book.
    pub fn is_eod_complete(&self, book: &PositionBook) -> bool {
        self.current_state.status == EodStatus::Done && book.is_flat()
    }

    /// The decision for the current instant, without side effects.
    pub fn calc_decision(&self, book: &PositionBook) -> EodDecision {
        let now = self.clock.now_et();
        let in_window = self.window.contains(&now);
        let has_positions = !book.is_flat();

        if in_window && has_positions {
            return EodDecision {
                in_window,
                has_positions,
                should_liquidate: true,
                reason: "in EOD window with open positions",
            };
        }
        if in_window && self.current_state.status != EodStatus::Done {
            return EodDecision {
                in_window,
                has_positions,
                should_liquidate: true,
                reason: "in EOD window, flat, marking done",
            };
        }
        EodDecision {
            in_window,
            has_positions,
            should_liquidate: false,
            reason: if in_window {
                "in EOD window, already done"
            } else {
                "outside EOD window"
            },
        }
    }

    /// Run one guardian tick between bars.
    ///
    /// `drain_fills` applies any pending execution reports to the book; the
    /// guardian calls it while polling for flatness.
    pub async fn tick(
        &mut self,
        book: &mut PositionBook,
        drain_fills: &mut (dyn FnMut(&mut PositionBook) + Send),
    ) -> Result<()> {
        self.refresh_date()?;

        let decision = self.calc_decision(book);
        if decision.in_window || decision.should_liquidate {
            info!(
                in_window = decision.in_window,
                has_positions = decision.has_positions,
                should_liquidate = decision.should_liquidate,
                reason = decision.reason,
                status = %self.current_state.status,
                "EOD decision"
            );
        }

        if decision.should_liquidate && !self.liquidation_in_progress {
            self.execute_liquidation(book, drain_fills).await?;
        }

        Ok(())
    }

    /// Liquidate immediately regardless of the window (shutdown path).
    pub async fn force_liquidate(
        &mut self,
        book: &mut PositionBook,
        drain_fills: &mut (dyn FnMut(&mut PositionBook) + Send),
    ) -> Result<()> {
        warn!("EOD force-liquidate requested");
        self.execute_liquidation(book, drain_fills).await
    }

    async fn execute_liquidation(
        &mut self,
        book: &mut PositionBook,
        drain_fills: &mut (dyn FnMut(&mut PositionBook) + Send),
    ) -> Result<()> {
        self.liquidation_in_progress = true;
        let result = self.liquidation_steps(book, drain_fills).await;
        self.liquidation_in_progress = false;
        result
    }

    async fn liquidation_steps(
        &mut self,
        book: &mut PositionBook,
        drain_fills: &mut (dyn FnMut(&mut PositionBook) + Send),
    ) -> Result<()> {
        info!(date = %self.current_et_date, "executing EOD liquidation");

        // 1. Mark IN_PROGRESS and persist before touching the broker.
        self.current_state.status = EodStatus::InProgress;
        self.current_state.last_attempt_epoch = self.clock.now_et().timestamp();
        self.store.save(&self.current_et_date, &self.current_state)?;

        // 2. Cancel all open orders.
        self.broker
            .cancel_all_orders()
            .await
            .context("EOD cancel_all_orders failed")?;

        // 3. Flatten positions and wait (bounded) for fills.
        if !book.is_flat() {
            self.broker
                .close_all_positions()
                .await
                .context("EOD close_all_positions failed")?;

            let mut waited = Duration::ZERO;
            loop {
                drain_fills(book);
                if book.is_flat() {
                    break;
                }
                if waited >= LIQUIDATION_WAIT {
                    break;
                }
                tokio::time::sleep(LIQUIDATION_POLL).await;
                waited += LIQUIDATION_POLL;
            }
        } else {
            drain_fills(book);
        }

        // 4. Verify flatness; failure is fatal and never marks Done.
        if !book.is_flat() {
            let open: Vec<String> = book
                .get_all_positions()
                .iter()
                .map(|p| format!("{}:{}", p.symbol, p.quantity))
                .collect();
            error!(positions = ?open, "EOD flatness verification FAILED");
            bail!("EOD liquidation failed, positions still open: {open:?}");
        }

        // 5. Hash must be the distinguished empty hash for a flat book.
        let hash = book.positions_hash();
        if !hash.is_empty() {
            bail!("positions hash non-empty after liquidation");
        }

        // 6. Mark DONE and persist.
        self.current_state.status = EodStatus::Done;
        self.current_state.positions_hash = hash;
        self.current_state.last_attempt_epoch = self.clock.now_et().timestamp();
        self.store.save(&self.current_et_date, &self.current_state)?;

        info!(date = %self.current_et_date, "EOD liquidation complete and verified flat");
        Ok(())
    }

    /// Re-read persisted state when the ET date rolls over.
    fn refresh_date(&mut self) -> Result<()> {
        let today = et_date(&self.clock.now_et());
        if today != self.current_et_date {
            info!(from = %self.current_et_date, to = %today, "ET date rolled");
            self.current_et_date = today;
            self.current_state = self.store.load(&self.current_et_date)?;
            self.liquidation_in_progress = false;
        }
        Ok(())
    }
}
