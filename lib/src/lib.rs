mod clock;
mod device_error;
mod engine;
mod progress;
mod rwcp;
mod session;
mod state;
mod transport;

pub mod codec;
pub mod config;
pub mod envelope;
pub mod service;
pub mod simulator;

use std::sync::Arc;

pub use clock::{Clock, ManualClock, SystemClock};
pub use device_error::{DeviceErrorCode, DeviceErrorInfo, Recovery, DEVICE_ERRORS};
pub use engine::{ConnectionEvent, UpdateEngine};
pub use progress::{TransferAccounting, UpdateProgress};
pub use rwcp::{RwcpClient, RwcpConfig, RwcpEvent, RwcpState};
pub use session::UpdateSession;
pub use state::{AbortReason, BusyPhase, CompletionStatus, StopReason, TransferOption, UpdateState};
pub use transport::{Channel, ConnectionKind, PacketSizing, Transport, TransportCapabilities, TransportNegotiation};

pub type Callback = Arc<dyn Fn(Event) + Send + Sync>;
#[derive(Debug, Clone)]
pub enum Event {
  /// externally observable state changed
  StateChanged(UpdateState),
  /// bytes were confirmed or skipped
  Progress(UpdateProgress),
}

pub type Result<T> = std::result::Result<T, Error>;
#[derive(thiserror::Error, Debug)]
pub enum Error {
  #[error("malformed frame (opcode {opcode:#04x}): declared {declared} bytes, {available} available")]
  MalformedFrame {
    opcode: u8,
    declared: usize,
    available: usize,
  },
  #[error("unexpected {length} byte payload for opcode {opcode:#04x}")]
  UnexpectedPayload { opcode: u8, length: usize },
  #[error("unknown opcode: {0:#04x}")]
  UnknownOpcode(u8),
  #[error("truncated GAIA packet ({0} bytes)")]
  TruncatedEnvelope(usize),
  #[error("invalid settings: {0}")]
  InvalidSettings(String),
  #[error("transport error: {0}")]
  Transport(String),
  #[error("IO error: {0}")]
  IoError(#[from] std::io::Error),
  #[error("failed to deserialize json: {0}")]
  Json(#[from] serde_json::Error),
  #[error("update service has shut down")]
  ServiceClosed,
}

impl Error {
  /// opcode of the update frame that failed to decode, if the failure was frame-level
  pub fn frame_opcode(&self) -> Option<u8> {
    match self {
      Error::MalformedFrame { opcode, .. } | Error::UnexpectedPayload { opcode, .. } => Some(*opcode),
      _ => None,
    }
  }
}

// ATT defaults when data length extension is off or unsupported
const DEFAULT_ATT_MTU: usize = 23;
const ATT_HEADER_LENGTH: usize = 3;

// vendor id + command id
const GAIA_HEADER_LENGTH: usize = 4;
// SOF, version, flags, length, vendor id, command id
const IAP2_HEADER_LENGTH: usize = 8;
const IAP2_EXTENDED_LENGTH_THRESHOLD: usize = 0xFE;

// framing subtracted from the negotiated MTU to get the data payload
const BLE_ACKNOWLEDGED_OVERHEAD: usize = 11;
const BLE_WINDOWED_OVERHEAD: usize = 12;
const IAP2_OVERHEAD: usize = 12;
const IAP2_EXTENDED_OVERHEAD: usize = 13;

const DEFAULT_MESSAGE_SIZE: usize = 0xFFFF;
const DEFAULT_INITIAL_WINDOW: u8 = 16;
// 32 upsets peers running older RWCP versions
const DEFAULT_MAX_WINDOW: u8 = 31;
const RWCP_MAX_WINDOW: u8 = 32;
const RWCP_INITIAL_TIMEOUT_MS: u64 = 100;
const RWCP_MAX_TIMEOUT_MS: u64 = 2000;
