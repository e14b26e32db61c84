use std::{
  sync::{Arc, Mutex},
  time::{Duration, Instant},
};

/// Source of time for the engine and the RWCP retransmission timer.
pub trait Clock: Send + Sync {
  fn now(&self) -> Instant;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
  fn now(&self) -> Instant {
    Instant::now()
  }
}

/// Clock that only moves when told to. Used by the simulator and tests.
#[derive(Debug, Clone)]
pub struct ManualClock {
  now: Arc<Mutex<Instant>>,
}

impl ManualClock {
  pub fn new() -> Self {
    Self {
      now: Arc::new(Mutex::new(Instant::now())),
    }
  }

  pub fn advance(&self, by: Duration) {
    let mut now = self.now.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
    *now += by;
  }
}

impl Default for ManualClock {
  fn default() -> Self {
    Self::new()
  }
}

impl Clock for ManualClock {
  fn now(&self) -> Instant {
    *self.now.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_manual_clock_advances_shared() {
    let clock = ManualClock::new();
    let other = clock.clone();
    let start = clock.now();
    other.advance(Duration::from_millis(250));
    assert_eq!(clock.now() - start, Duration::from_millis(250));
  }
}
