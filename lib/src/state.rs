use std::{fmt, time::Duration};

use crate::DeviceErrorCode;

/// The only state callers observe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UpdateState {
  #[default]
  Ready,
  Busy(BusyPhase),
  Stopped(StopReason),
}

impl UpdateState {
  pub fn is_busy(&self) -> bool {
    matches!(self, UpdateState::Busy(_))
  }

  pub fn is_terminal(&self) -> bool {
    matches!(
      self,
      UpdateState::Stopped(StopReason::Completed(_) | StopReason::CompletedAwaitingReboot | StopReason::Aborted(_))
    )
  }

  /// Waiting on one of the engine's confirmation calls.
  pub fn awaiting_confirmation(&self) -> bool {
    matches!(
      self,
      UpdateState::Busy(
        BusyPhase::AwaitingConfirmation
          | BusyPhase::AwaitingConfirmForceUpgrade
          | BusyPhase::AwaitingConfirmTransferRequired
          | BusyPhase::AwaitingConfirmBatteryLow
          | BusyPhase::AwaitingEarbudsInCaseTimedOut
      )
    )
  }
}

impl fmt::Display for UpdateState {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      UpdateState::Ready => write!(f, "ready"),
      UpdateState::Busy(phase) => write!(f, "busy ({phase:?})"),
      UpdateState::Stopped(StopReason::Aborted(reason)) => write!(f, "aborted ({reason})"),
      UpdateState::Stopped(reason) => write!(f, "stopped ({reason:?})"),
    }
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BusyPhase {
  Connecting,
  /// device asked to commit the new image
  AwaitingConfirmation,
  AwaitingConfirmForceUpgrade,
  AwaitingConfirmTransferRequired,
  AwaitingConfirmBatteryLow,
  AwaitingEarbudsInCase,
  AwaitingEarbudsInCaseConfirmed,
  AwaitingEarbudsInCaseTimedOut,
  Transferring,
  Validating,
  /// device is rebooting; waits for the connection to come back
  Restarting,
  Paused,
  Unpausing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
  Completed(CompletionStatus),
  CompletedAwaitingReboot,
  UserAbortPending,
  Aborted(AbortReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CompletionStatus {
  pub elapsed: Duration,
  pub bytes_sent: usize,
  pub bytes_skipped: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum AbortReason {
  #[error("cancelled by user")]
  UserCancelled,
  #[error("device error {0}")]
  DeviceError(DeviceErrorCode),
  #[error("device unexpectedly asked to restart the transfer")]
  UnexpectedStart,
  #[error("malformed frame for opcode {0:#04x}")]
  MalformedFrame(u8),
  #[error("device requested data beyond the end of the file")]
  DataRequestOutOfBounds,
  #[error("transport failed")]
  TransportError,
  #[error("device did not reconnect in time")]
  ReconnectionTimedOut,
  #[error("device rejected start with status {0:#04x}")]
  StartRejected(u8),
  #[error("device rejected command with status {0:#04x}")]
  CommandRejected(u8),
  #[error("transport settings leave no room for data")]
  UnsupportedTransport,
  #[error("device reset the windowed transfer")]
  RwcpReset,
}

/// How the device should apply a transferred image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransferOption {
  /// reboot now, then confirm the commit
  Interactive,
  /// apply on the next natural reboot
  Silent,
  Cancel,
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_terminal_states() {
    assert!(!UpdateState::Ready.is_terminal());
    assert!(!UpdateState::Stopped(StopReason::UserAbortPending).is_terminal());
    assert!(UpdateState::Stopped(StopReason::Aborted(AbortReason::UserCancelled)).is_terminal());
    assert!(UpdateState::Busy(BusyPhase::AwaitingConfirmBatteryLow).awaiting_confirmation());
    assert!(!UpdateState::Busy(BusyPhase::Transferring).awaiting_confirmation());
  }

  #[test]
  fn test_abort_reason_display() {
    let state = UpdateState::Stopped(StopReason::Aborted(AbortReason::DeviceError(DeviceErrorCode(0x0019))));
    assert_eq!(state.to_string(), "aborted (device error 0x0019 (sfs validation failed))");
  }
}
