// Pacemaker for liveness
//
// Owns the per-view timer bookkeeping and the view-change schedule:
// timeouts with exponential backoff, the pending target view, and the
// consecutive view-change count that drives the liveness alarm. The
// timers themselves are run by the engine; the pacemaker only hands out
// tokens so a stale firing can be recognised and ignored.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Identifies one armed timer
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TimerToken(pub u64);

/// Pacemaker ensures liveness by scheduling view changes
#[derive(Debug)]
pub struct Pacemaker {
    /// Base timeout duration
    base_timeout: Duration,

    /// Cap for the backoff
    max_timeout: Duration,

    /// View changes started since the last commit
    consecutive_view_changes: u32,

    /// Consecutive view changes after which operators are alerted
    alarm_threshold: u32,

    /// Target view of the view change in progress
    pending_view: Option<u64>,

    /// The one timer allowed to fire
    active: Option<TimerToken>,

    next_token: u64,
}

impl Pacemaker {
    pub fn new(base_timeout: Duration, max_timeout: Duration, alarm_threshold: u32) -> Self {
        Self {
            base_timeout,
            max_timeout,
            consecutive_view_changes: 0,
            alarm_threshold,
            pending_view: None,
            active: None,
            next_token: 0,
        }
    }

    /// Timeout with exponential backoff
    ///
    /// Formula: min(base_timeout * 2^consecutive_view_changes, max_timeout)
    pub fn current_timeout(&self) -> Duration {
        let exponent = self.consecutive_view_changes.min(31);
        let timeout = self.base_timeout.saturating_mul(1u32 << exponent);
        timeout.min(self.max_timeout)
    }

    /// Arm a fresh timer, replacing any active one
    ///
    /// Returns the replaced token (to cancel), the new token and its delay.
    pub fn arm(&mut self) -> (Option<TimerToken>, TimerToken, Duration) {
        let replaced = self.active.take();
        self.next_token += 1;
        let token = TimerToken(self.next_token);
        self.active = Some(token);
        (replaced, token, self.current_timeout())
    }

    /// Accept a timer firing; false for cancelled or superseded timers
    pub fn fire(&mut self, token: TimerToken) -> bool {
        if self.active == Some(token) {
            self.active = None;
            true
        } else {
            false
        }
    }

    /// Start (or escalate) a view change away from `current_view`
    ///
    /// The first timeout targets current_view + 1; each further timeout
    /// without a new-view quorum targets one view higher.
    pub fn begin_view_change(&mut self, current_view: u64) -> u64 {
        let target = self.pending_view.unwrap_or(current_view).max(current_view) + 1;
        self.join_view_change(target);
        target
    }

    /// Adopt a target view proposed by others
    pub fn join_view_change(&mut self, target: u64) {
        if self.pending_view.map_or(true, |pending| target > pending) {
            self.pending_view = Some(target);
            self.consecutive_view_changes = self.consecutive_view_changes.saturating_add(1);
        }
    }

    pub fn pending_view(&self) -> Option<u64> {
        self.pending_view
    }

    /// A new view was installed; backoff persists until something commits
    pub fn view_installed(&mut self, view: u64) {
        if self.pending_view.map_or(false, |pending| pending <= view) {
            self.pending_view = None;
        }
    }

    /// A block committed: reset backoff
    pub fn record_progress(&mut self) {
        self.consecutive_view_changes = 0;
        self.pending_view = None;
    }

    pub fn consecutive_view_changes(&self) -> u32 {
        self.consecutive_view_changes
    }

    /// True once the consecutive count passes the threshold
    pub fn liveness_alarm(&self) -> bool {
        self.alarm_threshold > 0 && self.consecutive_view_changes >= self.alarm_threshold
    }
}
