//! Time source shared by the queue and its worker.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;

/// Wall clock used for `run_at` scheduling.
///
/// The system clock is used in production. A manual clock only moves when
/// told to, which lets debounce and retry windows be stepped through in
/// tests without sleeping.
#[derive(Debug, Clone, Default)]
pub struct Clock {
    manual: Option<Arc<Mutex<DateTime<Utc>>>>,
}

impl Clock {
    /// Clock backed by [`Utc::now`].
    pub fn system() -> Self {
        Self { manual: None }
    }

    /// Clock frozen at `start` until advanced.
    pub fn manual(start: DateTime<Utc>) -> Self {
        Self {
            manual: Some(Arc::new(Mutex::new(start))),
        }
    }

    /// Current time.
    pub fn now(&self) -> DateTime<Utc> {
        match &self.manual {
            Some(now) => *now.lock(),
            None => Utc::now(),
        }
    }

    /// Move a manual clock forward. No-op for the system clock.
    pub fn advance(&self, by: Duration) {
        if let Some(now) = &self.manual {
            let mut now = now.lock();
            *now = checked_add(*now, by).unwrap_or(DateTime::<Utc>::MAX_UTC);
        }
    }

    /// Whether this clock is manual.
    pub fn is_manual(&self) -> bool {
        self.manual.is_some()
    }
}

/// `at + by`, or `None` when the result is outside chrono's range.
pub(crate) fn checked_add(at: DateTime<Utc>, by: Duration) -> Option<DateTime<Utc>> {
    chrono::Duration::from_std(by)
        .ok()
        .and_then(|by| at.checked_add_signed(by))
}

/// `at - by`, or `None` when the result is outside chrono's range.
pub(crate) fn checked_sub(at: DateTime<Utc>, by: Duration) -> Option<DateTime<Utc>> {
    chrono::Duration::from_std(by)
        .ok()
        .and_then(|by| at.checked_sub_signed(by))
}
