use serde::Serialize;
use std::time::{Duration, Instant};

/// Snapshot of transfer progress published to observers.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateProgress {
  /// 0.0 ..= 100.0
  pub percent: f64,
  pub elapsed: Duration,
  /// zero when unknown
  pub time_remaining: Duration,
  pub transfer_size: usize,
  pub progress_bytes: usize,
  pub skipped_bytes: usize,
}

/// Byte counters and timing for the current transfer attempt.
///
/// `skipped_bytes <= progress_bytes <= transfer_size` always holds.
#[derive(Debug, Clone, Default)]
pub struct TransferAccounting {
  transfer_size: usize,
  progress_bytes: usize,
  skipped_bytes: usize,
  started_at: Option<Instant>,
}

impl TransferAccounting {
  pub fn new(transfer_size: usize) -> Self {
    Self {
      transfer_size,
      ..Default::default()
    }
  }

  /// Zero the counters and forget the start time; the size is kept.
  pub fn reset(&mut self) {
    self.progress_bytes = 0;
    self.skipped_bytes = 0;
    self.started_at = None;
  }

  pub fn start_timing(&mut self, now: Instant) {
    self.started_at.get_or_insert(now);
  }

  /// Bytes the device already had. Returns how many were actually counted.
  pub fn record_skipped(&mut self, bytes: usize) -> usize {
    let counted = bytes.min(self.transfer_size - self.progress_bytes);
    self.progress_bytes += counted;
    self.skipped_bytes += counted;
    counted
  }

  pub fn record_sent(&mut self, bytes: usize) {
    self.progress_bytes = (self.progress_bytes + bytes).min(self.transfer_size);
  }

  pub fn transfer_size(&self) -> usize {
    self.transfer_size
  }

  pub fn progress_bytes(&self) -> usize {
    self.progress_bytes
  }

  pub fn skipped_bytes(&self) -> usize {
    self.skipped_bytes
  }

  pub fn sent_bytes(&self) -> usize {
    self.progress_bytes - self.skipped_bytes
  }

  pub fn elapsed(&self, now: Instant) -> Duration {
    self
      .started_at
      .map(|started| now.saturating_duration_since(started))
      .unwrap_or_default()
  }

  pub fn percent(&self) -> f64 {
    if self.transfer_size == 0 {
      return 0.0;
    }
    self.progress_bytes as f64 / self.transfer_size as f64 * 100.0
  }

  /// Estimated from the unskipped part only, so a large skip on resume does not spike the estimate.
  pub fn time_remaining(&self, now: Instant) -> Duration {
    let unskipped_done = self.sent_bytes();
    if unskipped_done == 0 {
      return Duration::ZERO;
    }
    let unskipped_total = self.transfer_size - self.skipped_bytes;
    let elapsed = self.elapsed(now).as_secs_f64();
    let remaining = elapsed * (unskipped_total as f64 / unskipped_done as f64) - elapsed;
    Duration::from_secs_f64(remaining.max(0.0))
  }

  pub fn throughput_kbps(&self, now: Instant) -> Option<f64> {
    let elapsed = self.elapsed(now).as_secs_f64();
    if elapsed <= 0.0 {
      return None;
    }
    Some((self.sent_bytes() as f64 * 8.0 / elapsed) / 1000.0)
  }

  pub fn snapshot(&self, now: Instant) -> UpdateProgress {
    UpdateProgress {
      percent: self.percent(),
      elapsed: self.elapsed(now),
      time_remaining: self.time_remaining(now),
      transfer_size: self.transfer_size,
      progress_bytes: self.progress_bytes,
      skipped_bytes: self.skipped_bytes,
    }
  }
}
