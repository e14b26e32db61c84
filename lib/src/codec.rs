//! Update control frames, carried inside the GAIA upgrade-control command:
//! `{opcode: u8, length: u16 big-endian, payload: length bytes}`.

use crate::{Error, Result};

pub const FRAME_HEADER_LENGTH: usize = 3;
/// leading byte of a DATA payload
pub const DATA_FLAG_LENGTH: usize = 1;
pub const FILE_IDENTIFIER_LENGTH: usize = 4;

const DATA_MORE_COMING: u8 = 0x00;
const DATA_LAST_PACKET: u8 = 0x01;

const ACTION_CONTINUE: u8 = 0x00;
const ACTION_ABORT: u8 = 0x01;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Opcode {
  StartReq = 0x01,
  StartCfm = 0x02,
  DataBytesReq = 0x03,
  Data = 0x04,
  AbortReq = 0x07,
  AbortCfm = 0x08,
  TransferCompleteInd = 0x0B,
  TransferCompleteRes = 0x0C,
  InProgressInd = 0x0D,
  InProgressRes = 0x0E,
  CommitReq = 0x0F,
  CommitCfm = 0x10,
  ErrorWarnInd = 0x11,
  CompleteInd = 0x12,
  SyncReq = 0x13,
  SyncCfm = 0x14,
  StartDataReq = 0x15,
  IsValidationDoneReq = 0x16,
  IsValidationDoneCfm = 0x17,
  ErrorWarnRes = 0x1F,
  SilentCommitSupportedReq = 0x20,
  SilentCommitSupportedCfm = 0x21,
  SilentCommitReq = 0x22,
  CasePlacementInd = 0x23,
}

impl TryFrom<u8> for Opcode {
  type Error = Error;

  fn try_from(value: u8) -> Result<Self> {
    let opcode = match value {
      0x01 => Opcode::StartReq,
      0x02 => Opcode::StartCfm,
      0x03 => Opcode::DataBytesReq,
      0x04 => Opcode::Data,
      0x07 => Opcode::AbortReq,
      0x08 => Opcode::AbortCfm,
      0x0B => Opcode::TransferCompleteInd,
      0x0C => Opcode::TransferCompleteRes,
      0x0D => Opcode::InProgressInd,
      0x0E => Opcode::InProgressRes,
      0x0F => Opcode::CommitReq,
      0x10 => Opcode::CommitCfm,
      0x11 => Opcode::ErrorWarnInd,
      0x12 => Opcode::CompleteInd,
      0x13 => Opcode::SyncReq,
      0x14 => Opcode::SyncCfm,
      0x15 => Opcode::StartDataReq,
      0x16 => Opcode::IsValidationDoneReq,
      0x17 => Opcode::IsValidationDoneCfm,
      0x1F => Opcode::ErrorWarnRes,
      0x20 => Opcode::SilentCommitSupportedReq,
      0x21 => Opcode::SilentCommitSupportedCfm,
      0x22 => Opcode::SilentCommitReq,
      0x23 => Opcode::CasePlacementInd,
      other => return Err(Error::UnknownOpcode(other)),
    };
    Ok(opcode)
  }
}

/// Point from which the device wants the protocol to continue, reported in `SYNC_CFM`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ResumePoint {
  Start = 0x00,
  Validate = 0x01,
  Reboot = 0x02,
  PostReboot = 0x03,
  Commit = 0x04,
}

impl ResumePoint {
  pub fn from_u8(value: u8) -> Option<Self> {
    match value {
      0x00 => Some(ResumePoint::Start),
      0x01 => Some(ResumePoint::Validate),
      0x02 => Some(ResumePoint::Reboot),
      0x03 => Some(ResumePoint::PostReboot),
      0x04 => Some(ResumePoint::Commit),
      _ => None,
    }
  }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateFrame {
  pub opcode: Opcode,
  pub payload: Vec<u8>,
}

impl UpdateFrame {
  pub fn new(opcode: Opcode, payload: Vec<u8>) -> Self {
    Self { opcode, payload }
  }

  pub fn empty(opcode: Opcode) -> Self {
    Self::new(opcode, vec![])
  }

  /// Encode into `{opcode, length, payload}`.
  ///
  /// Payloads are produced by this crate and never exceed the negotiated packet size, which is
  /// itself bounded by a u16 message size.
  pub fn encode(&self) -> Vec<u8> {
    debug_assert!(self.payload.len() <= u16::MAX as usize);
    let mut bytes = Vec::with_capacity(FRAME_HEADER_LENGTH + self.payload.len());
    bytes.push(self.opcode as u8);
    bytes.extend_from_slice(&(self.payload.len() as u16).to_be_bytes());
    bytes.extend_from_slice(&self.payload);
    bytes
  }

  /// Decode a single frame. The declared length must match the bytes that follow the header exactly.
  pub fn decode(bytes: &[u8]) -> Result<Self> {
    if bytes.len() < FRAME_HEADER_LENGTH {
      return Err(Error::MalformedFrame {
        opcode: bytes.first().copied().unwrap_or_default(),
        declared: FRAME_HEADER_LENGTH,
        available: bytes.len(),
      });
    }

    let raw_opcode = bytes[0];
    let declared = u16::from_be_bytes([bytes[1], bytes[2]]) as usize;
    let available = bytes.len() - FRAME_HEADER_LENGTH;
    if declared != available {
      return Err(Error::MalformedFrame {
        opcode: raw_opcode,
        declared,
        available,
      });
    }

    Ok(Self {
      opcode: Opcode::try_from(raw_opcode)?,
      payload: bytes[FRAME_HEADER_LENGTH..].to_vec(),
    })
  }

  pub fn sync_request(identifier: [u8; FILE_IDENTIFIER_LENGTH]) -> Self {
    Self::new(Opcode::SyncReq, identifier.to_vec())
  }

  pub fn validation_request(identifier: [u8; FILE_IDENTIFIER_LENGTH]) -> Self {
    Self::new(Opcode::IsValidationDoneReq, identifier.to_vec())
  }

  /// DATA frame; `more_coming` is false only on the last chunk of a device request.
  pub fn data(more_coming: bool, chunk: &[u8]) -> Self {
    let mut payload = Vec::with_capacity(DATA_FLAG_LENGTH + chunk.len());
    payload.push(if more_coming { DATA_MORE_COMING } else { DATA_LAST_PACKET });
    payload.extend_from_slice(chunk);
    Self::new(Opcode::Data, payload)
  }

  pub fn transfer_complete_response(proceed: bool) -> Self {
    Self::new(Opcode::TransferCompleteRes, vec![action(proceed)])
  }

  pub fn in_progress_response() -> Self {
    Self::new(Opcode::InProgressRes, vec![ACTION_CONTINUE])
  }

  pub fn commit_confirm(commit: bool) -> Self {
    Self::new(Opcode::CommitCfm, vec![action(commit)])
  }

  pub fn error_warn_response(code: u16) -> Self {
    Self::new(Opcode::ErrorWarnRes, code.to_be_bytes().to_vec())
  }
}

fn action(proceed: bool) -> u8 {
  if proceed {
    ACTION_CONTINUE
  } else {
    ACTION_ABORT
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataBytesRequest {
  /// bytes the device wants next
  pub length: u32,
  /// bytes to skip from the current position before sending
  pub offset: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncConfirm {
  pub resume_point: ResumePoint,
  pub protocol_version: Option<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StartConfirm {
  pub status: u8,
  pub battery_level: Option<u16>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CasePlacement {
  PlaceInCase,
  InCase,
}

/// Frames the device sends to the host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceMessage {
  StartConfirm(StartConfirm),
  DataBytesRequest(DataBytesRequest),
  AbortConfirm,
  TransferComplete,
  InProgress,
  CommitRequest,
  ErrorWarning(u16),
  Complete,
  SyncConfirm(SyncConfirm),
  ValidationPending { delay_ms: u16 },
  SilentCommitSupported(bool),
  CasePlacement(CasePlacement),
}

impl DeviceMessage {
  pub fn decode(bytes: &[u8]) -> Result<Self> {
    let frame = UpdateFrame::decode(bytes)?;
    let payload = frame.payload.as_slice();
    let unexpected = || Error::UnexpectedPayload {
      opcode: frame.opcode as u8,
      length: payload.len(),
    };

    let message = match frame.opcode {
      Opcode::StartCfm => {
        let status = *payload.first().ok_or_else(unexpected)?;
        let battery_level = payload.get(1..3).map(|b| u16::from_be_bytes([b[0], b[1]]));
        DeviceMessage::StartConfirm(StartConfirm { status, battery_level })
      }
      Opcode::DataBytesReq => {
        let bytes: [u8; 8] = payload.try_into().map_err(|_| unexpected())?;
        DeviceMessage::DataBytesRequest(DataBytesRequest {
          length: u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]),
          offset: u32::from_be_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]),
        })
      }
      Opcode::AbortCfm => DeviceMessage::AbortConfirm,
      Opcode::TransferCompleteInd => DeviceMessage::TransferComplete,
      Opcode::InProgressInd => DeviceMessage::InProgress,
      Opcode::CommitReq => DeviceMessage::CommitRequest,
      Opcode::ErrorWarnInd => {
        let code: [u8; 2] = payload.get(..2).ok_or_else(unexpected)?.try_into().map_err(|_| unexpected())?;
        DeviceMessage::ErrorWarning(u16::from_be_bytes(code))
      }
      Opcode::CompleteInd => DeviceMessage::Complete,
      Opcode::SyncCfm => {
        let resume_point = payload
          .first()
          .and_then(|b| ResumePoint::from_u8(*b))
          .ok_or_else(unexpected)?;
        // resume point, 4 reserved bytes, protocol version
        let protocol_version = payload.get(5).copied();
        DeviceMessage::SyncConfirm(SyncConfirm {
          resume_point,
          protocol_version,
        })
      }
      Opcode::IsValidationDoneCfm => {
        let delay: [u8; 2] = payload.get(..2).ok_or_else(unexpected)?.try_into().map_err(|_| unexpected())?;
        DeviceMessage::ValidationPending {
          delay_ms: u16::from_be_bytes(delay),
        }
      }
      Opcode::SilentCommitSupportedCfm => {
        DeviceMessage::SilentCommitSupported(*payload.first().ok_or_else(unexpected)? != 0)
      }
      Opcode::CasePlacementInd => match payload.first() {
        Some(0x00) => DeviceMessage::CasePlacement(CasePlacement::PlaceInCase),
        Some(0x01) => DeviceMessage::CasePlacement(CasePlacement::InCase),
        _ => return Err(unexpected()),
      },
      host_only => return Err(Error::UnknownOpcode(host_only as u8)),
    };

    Ok(message)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_encode_header_is_big_endian() {
    let frame = UpdateFrame::new(Opcode::Data, vec![0xAA; 0x0102]);
    let bytes = frame.encode();
    assert_eq!(&bytes[..3], &[0x04, 0x01, 0x02]);
    assert_eq!(bytes.len(), 3 + 0x0102);
  }

  #[test]
  fn test_decode_rejects_length_mismatch() {
    let err = UpdateFrame::decode(&[0x03, 0x00, 0x08, 0x00, 0x00]).unwrap_err();
    match err {
      Error::MalformedFrame {
        opcode,
        declared,
        available,
      } => {
        assert_eq!(opcode, 0x03);
        assert_eq!(declared, 8);
        assert_eq!(available, 2);
      }
      other => panic!("unexpected error {other:?}"),
    }
  }

  #[test]
  fn test_decode_short_buffer() {
    let err = UpdateFrame::decode(&[0x14]).unwrap_err();
    assert_eq!(err.frame_opcode(), Some(0x14));
  }

  #[test]
  fn test_data_bytes_request() {
    let bytes = [0x03, 0x00, 0x08, 0x00, 0x00, 0x03, 0xE8, 0x00, 0x00, 0x00, 0x10];
    let message = DeviceMessage::decode(&bytes).unwrap();
    assert_eq!(
      message,
      DeviceMessage::DataBytesRequest(DataBytesRequest {
        length: 1000,
        offset: 16
      })
    );
  }

  #[test]
  fn test_data_bytes_request_wrong_payload_keeps_opcode() {
    let err = DeviceMessage::decode(&[0x03, 0x00, 0x02, 0x00, 0x01]).unwrap_err();
    assert_eq!(err.frame_opcode(), Some(Opcode::DataBytesReq as u8));
  }

  #[test]
  fn test_sync_confirm_short_and_long() {
    let short = DeviceMessage::decode(&[0x14, 0x00, 0x01, 0x02]).unwrap();
    assert_eq!(
      short,
      DeviceMessage::SyncConfirm(SyncConfirm {
        resume_point: ResumePoint::Reboot,
        protocol_version: None
      })
    );

    let long = DeviceMessage::decode(&[0x14, 0x00, 0x06, 0x01, 0xDE, 0xAD, 0xBE, 0xEF, 0x03]).unwrap();
    assert_eq!(
      long,
      DeviceMessage::SyncConfirm(SyncConfirm {
        resume_point: ResumePoint::Validate,
        protocol_version: Some(3)
      })
    );
  }

  #[test]
  fn test_sync_confirm_unknown_resume_point() {
    let err = DeviceMessage::decode(&[0x14, 0x00, 0x01, 0x09]).unwrap_err();
    assert_eq!(err.frame_opcode(), Some(Opcode::SyncCfm as u8));
  }

  #[test]
  fn test_data_flag() {
    assert_eq!(UpdateFrame::data(true, &[1, 2]).payload, vec![0x00, 1, 2]);
    assert_eq!(UpdateFrame::data(false, &[1, 2]).payload, vec![0x01, 1, 2]);
  }

  #[test]
  fn test_host_only_opcode_is_rejected() {
    let err = DeviceMessage::decode(&UpdateFrame::empty(Opcode::StartReq).encode()).unwrap_err();
    assert!(matches!(err, Error::UnknownOpcode(0x01)));
    assert_eq!(err.frame_opcode(), None);
  }

  #[test]
  fn test_error_warning_code() {
    let message = DeviceMessage::decode(&[0x11, 0x00, 0x02, 0x00, 0x81]).unwrap();
    assert_eq!(message, DeviceMessage::ErrorWarning(0x0081));
  }
}
