//! Time source used for cache timestamps, queue entries and lifecycle transitions.

use chrono::{DateTime, Utc};

/// Source of the current time.
pub trait Clock: Send + Sync {
  fn now(&self) -> DateTime<Utc>;
}

/// Wall clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
  fn now(&self) -> DateTime<Utc> {
    Utc::now()
  }
}

#[cfg(test)]
pub use manual::ManualClock;

#[cfg(test)]
mod manual {
  use super::Clock;
  use chrono::{DateTime, Duration, TimeZone, Utc};
  use std::sync::Mutex;

  /// Clock that only moves when told to.
  #[derive(Debug)]
  pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
  }

  impl ManualClock {
    pub fn new() -> Self {
      Self {
        now: Mutex::new(Utc.timestamp_millis_opt(1_700_000_000_000).unwrap()),
      }
    }

    pub fn advance(&self, by: Duration) {
      let mut now = self.now.lock().unwrap();
      *now += by;
    }
  }

  impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
      *self.now.lock().unwrap()
    }
  }
}
