//! GAIA packet envelopes.
//!
//! The engine talks to the device through [GaiaEnvelope], chosen once from the device's protocol
//! version. V2 and V3 differ in vendor id, command numbering and in how upgrade data and
//! acknowledgements are reported; nothing outside this module branches on the version.

use std::fmt;

use crate::{codec::UpdateFrame, Error, Result, GAIA_HEADER_LENGTH};

pub const V2_VENDOR_ID: u16 = 0x000A;
pub const V3_VENDOR_ID: u16 = 0x001D;

const V2_UPGRADE_CONNECT: u16 = 0x0640;
const V2_UPGRADE_DISCONNECT: u16 = 0x0641;
const V2_UPGRADE_CONTROL: u16 = 0x0642;
const V2_SET_DATA_ENDPOINT: u16 = 0x064E;
const V2_REGISTER_NOTIFICATION: u16 = 0x4001;
pub const V2_EVENT_NOTIFICATION: u16 = 0x4003;
pub const V2_ACK_MASK: u16 = 0x8000;
pub const V2_EVENT_UPGRADE_PACKET: u8 = 0x12;
const V2_EVENT_STOP_REQUEST: u8 = 0x13;
const V2_EVENT_START_REQUEST: u8 = 0x14;

const V3_CORE_FEATURE: u8 = 0;
const V3_UPGRADE_FEATURE: u8 = 6;
const V3_CORE_REGISTER_NOTIFICATION: u8 = 7;
const V3_UPGRADE_CONNECT: u8 = 0;
const V3_UPGRADE_DISCONNECT: u8 = 1;
const V3_UPGRADE_CONTROL: u8 = 2;
const V3_UPGRADE_SET_DATA_ENDPOINT: u8 = 4;
const V3_NOTIFICATION_UPGRADE_DATA: u8 = 0;
const V3_NOTIFICATION_STOP_REQUEST: u8 = 1;
const V3_NOTIFICATION_START_REQUEST: u8 = 2;

const DATA_ENDPOINT_DEFAULT: u8 = 0x00;
const DATA_ENDPOINT_RWCP: u8 = 0x01;

const STATUS_SUCCESS: u8 = 0x00;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProtocolVersion {
  V2,
  V3,
}

impl TryFrom<u8> for ProtocolVersion {
  type Error = Error;

  fn try_from(value: u8) -> Result<Self> {
    match value {
      2 => Ok(ProtocolVersion::V2),
      3 => Ok(ProtocolVersion::V3),
      other => Err(Error::InvalidSettings(format!("unsupported GAIA protocol version {other}"))),
    }
  }
}

impl fmt::Display for ProtocolVersion {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      ProtocolVersion::V2 => write!(f, "v2"),
      ProtocolVersion::V3 => write!(f, "v3"),
    }
  }
}

/// Commands the engine issues, used to tell which one a response or rejection belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UpgradeCommand {
  RegisterNotification,
  Connect,
  Disconnect,
  Control,
  SetDataEndpoint,
}

/// A decoded packet from the device's GAIA command channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
  /// successful response to a command
  Accepted(UpgradeCommand),
  /// the device refused a command
  Rejected { command: UpgradeCommand, status: u8 },
  /// an update control frame from the device
  UpgradeData(Vec<u8>),
  /// the device asks the host to stop transferring
  StopRequest,
  /// the device asks the host to (re)start transferring
  StartRequest,
  /// anything this engine does not consume
  Unhandled { command_id: u16 },
}

/// Version specific packet layout.
pub trait GaiaEnvelope: Send + Sync + fmt::Debug {
  fn version(&self) -> ProtocolVersion;
  fn register_notification(&self) -> Vec<u8>;
  fn upgrade_connect(&self) -> Vec<u8>;
  fn upgrade_disconnect(&self) -> Vec<u8>;
  fn set_data_endpoint(&self, rwcp: bool) -> Vec<u8>;
  /// Wrap an update frame in an upgrade-control command. This is also how DATA packets travel.
  fn upgrade_control(&self, frame: &UpdateFrame) -> Vec<u8>;
  fn decode(&self, packet: &[u8]) -> Result<Inbound>;
}

pub fn envelope_for(version: ProtocolVersion) -> Box<dyn GaiaEnvelope> {
  match version {
    ProtocolVersion::V2 => Box::new(V2Envelope),
    ProtocolVersion::V3 => Box::new(V3Envelope),
  }
}

/// Build a raw GAIA packet: `{vendor_id, command_id, payload}`.
pub fn gaia_packet(vendor_id: u16, command_id: u16, payload: &[u8]) -> Vec<u8> {
  let mut packet = Vec::with_capacity(GAIA_HEADER_LENGTH + payload.len());
  packet.extend_from_slice(&vendor_id.to_be_bytes());
  packet.extend_from_slice(&command_id.to_be_bytes());
  packet.extend_from_slice(payload);
  packet
}

/// Split a raw GAIA packet into `(vendor_id, command_id, payload)`.
pub fn split_packet(packet: &[u8]) -> Result<(u16, u16, &[u8])> {
  if packet.len() < GAIA_HEADER_LENGTH {
    return Err(Error::TruncatedEnvelope(packet.len()));
  }
  let vendor_id = u16::from_be_bytes([packet[0], packet[1]]);
  let command_id = u16::from_be_bytes([packet[2], packet[3]]);
  Ok((vendor_id, command_id, &packet[GAIA_HEADER_LENGTH..]))
}

fn endpoint_payload(rwcp: bool) -> [u8; 1] {
  [if rwcp { DATA_ENDPOINT_RWCP } else { DATA_ENDPOINT_DEFAULT }]
}

#[derive(Debug, Clone, Copy, Default)]
pub struct V2Envelope;

impl V2Envelope {
  pub fn command_for(command_id: u16) -> Option<UpgradeCommand> {
    match command_id {
      V2_REGISTER_NOTIFICATION => Some(UpgradeCommand::RegisterNotification),
      V2_UPGRADE_CONNECT => Some(UpgradeCommand::Connect),
      V2_UPGRADE_DISCONNECT => Some(UpgradeCommand::Disconnect),
      V2_UPGRADE_CONTROL => Some(UpgradeCommand::Control),
      V2_SET_DATA_ENDPOINT => Some(UpgradeCommand::SetDataEndpoint),
      _ => None,
    }
  }

  pub fn command_id(command: UpgradeCommand) -> u16 {
    match command {
      UpgradeCommand::RegisterNotification => V2_REGISTER_NOTIFICATION,
      UpgradeCommand::Connect => V2_UPGRADE_CONNECT,
      UpgradeCommand::Disconnect => V2_UPGRADE_DISCONNECT,
      UpgradeCommand::Control => V2_UPGRADE_CONTROL,
      UpgradeCommand::SetDataEndpoint => V2_SET_DATA_ENDPOINT,
    }
  }
}

impl GaiaEnvelope for V2Envelope {
  fn version(&self) -> ProtocolVersion {
    ProtocolVersion::V2
  }

  fn register_notification(&self) -> Vec<u8> {
    gaia_packet(V2_VENDOR_ID, V2_REGISTER_NOTIFICATION, &[V2_EVENT_UPGRADE_PACKET])
  }

  fn upgrade_connect(&self) -> Vec<u8> {
    gaia_packet(V2_VENDOR_ID, V2_UPGRADE_CONNECT, &[])
  }

  fn upgrade_disconnect(&self) -> Vec<u8> {
    gaia_packet(V2_VENDOR_ID, V2_UPGRADE_DISCONNECT, &[])
  }

  fn set_data_endpoint(&self, rwcp: bool) -> Vec<u8> {
    gaia_packet(V2_VENDOR_ID, V2_SET_DATA_ENDPOINT, &endpoint_payload(rwcp))
  }

  fn upgrade_control(&self, frame: &UpdateFrame) -> Vec<u8> {
    gaia_packet(V2_VENDOR_ID, V2_UPGRADE_CONTROL, &frame.encode())
  }

  fn decode(&self, packet: &[u8]) -> Result<Inbound> {
    let (vendor_id, command_id, payload) = split_packet(packet)?;
    if vendor_id != V2_VENDOR_ID {
      return Ok(Inbound::Unhandled { command_id });
    }

    if command_id & V2_ACK_MASK != 0 {
      let Some(command) = Self::command_for(command_id & !V2_ACK_MASK) else {
        return Ok(Inbound::Unhandled { command_id });
      };
      let status = *payload.first().ok_or(Error::TruncatedEnvelope(packet.len()))?;
      if status != STATUS_SUCCESS {
        return Ok(Inbound::Rejected { command, status });
      }
      return Ok(Inbound::Accepted(command));
    }

    if command_id != V2_EVENT_NOTIFICATION {
      return Ok(Inbound::Unhandled { command_id });
    }

    match payload.first() {
      Some(&V2_EVENT_UPGRADE_PACKET) => Ok(Inbound::UpgradeData(payload[1..].to_vec())),
      Some(&V2_EVENT_STOP_REQUEST) => Ok(Inbound::StopRequest),
      Some(&V2_EVENT_START_REQUEST) => Ok(Inbound::StartRequest),
      Some(_) => Ok(Inbound::Unhandled { command_id }),
      None => Err(Error::TruncatedEnvelope(packet.len())),
    }
  }
}

/// V3 packet kinds, bits 7..8 of the command id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum V3PacketType {
  Command = 0,
  Notification = 1,
  Response = 2,
  Error = 3,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct V3Envelope;

impl V3Envelope {
  /// `feature << 9 | type << 7 | id`
  pub fn command_id(feature: u8, packet_type: V3PacketType, id: u8) -> u16 {
    ((feature as u16 & 0x7F) << 9) | ((packet_type as u16 & 0x03) << 7) | (id as u16 & 0x7F)
  }

  pub fn split_command_id(command_id: u16) -> (u8, V3PacketType, u8) {
    let feature = (command_id >> 9) as u8 & 0x7F;
    let packet_type = match (command_id >> 7) & 0x03 {
      0 => V3PacketType::Command,
      1 => V3PacketType::Notification,
      2 => V3PacketType::Response,
      _ => V3PacketType::Error,
    };
    (feature, packet_type, command_id as u8 & 0x7F)
  }

  pub fn command_for(feature: u8, id: u8) -> Option<UpgradeCommand> {
    match (feature, id) {
      (V3_CORE_FEATURE, V3_CORE_REGISTER_NOTIFICATION) => Some(UpgradeCommand::RegisterNotification),
      (V3_UPGRADE_FEATURE, V3_UPGRADE_CONNECT) => Some(UpgradeCommand::Connect),
      (V3_UPGRADE_FEATURE, V3_UPGRADE_DISCONNECT) => Some(UpgradeCommand::Disconnect),
      (V3_UPGRADE_FEATURE, V3_UPGRADE_CONTROL) => Some(UpgradeCommand::Control),
      (V3_UPGRADE_FEATURE, V3_UPGRADE_SET_DATA_ENDPOINT) => Some(UpgradeCommand::SetDataEndpoint),
      _ => None,
    }
  }

  pub fn feature_and_id(command: UpgradeCommand) -> (u8, u8) {
    match command {
      UpgradeCommand::RegisterNotification => (V3_CORE_FEATURE, V3_CORE_REGISTER_NOTIFICATION),
      UpgradeCommand::Connect => (V3_UPGRADE_FEATURE, V3_UPGRADE_CONNECT),
      UpgradeCommand::Disconnect => (V3_UPGRADE_FEATURE, V3_UPGRADE_DISCONNECT),
      UpgradeCommand::Control => (V3_UPGRADE_FEATURE, V3_UPGRADE_CONTROL),
      UpgradeCommand::SetDataEndpoint => (V3_UPGRADE_FEATURE, V3_UPGRADE_SET_DATA_ENDPOINT),
    }
  }

  fn command(command: UpgradeCommand, payload: &[u8]) -> Vec<u8> {
    let (feature, id) = Self::feature_and_id(command);
    gaia_packet(
      V3_VENDOR_ID,
      Self::command_id(feature, V3PacketType::Command, id),
      payload,
    )
  }

  pub fn upgrade_notification_id(notification: u8) -> u16 {
    Self::command_id(V3_UPGRADE_FEATURE, V3PacketType::Notification, notification)
  }
}

impl GaiaEnvelope for V3Envelope {
  fn version(&self) -> ProtocolVersion {
    ProtocolVersion::V3
  }

  fn register_notification(&self) -> Vec<u8> {
    Self::command(UpgradeCommand::RegisterNotification, &[V3_UPGRADE_FEATURE])
  }

  fn upgrade_connect(&self) -> Vec<u8> {
    Self::command(UpgradeCommand::Connect, &[])
  }

  fn upgrade_disconnect(&self) -> Vec<u8> {
    Self::command(UpgradeCommand::Disconnect, &[])
  }

  fn set_data_endpoint(&self, rwcp: bool) -> Vec<u8> {
    Self::command(UpgradeCommand::SetDataEndpoint, &endpoint_payload(rwcp))
  }

  fn upgrade_control(&self, frame: &UpdateFrame) -> Vec<u8> {
    Self::command(UpgradeCommand::Control, &frame.encode())
  }

  fn decode(&self, packet: &[u8]) -> Result<Inbound> {
    let (vendor_id, command_id, payload) = split_packet(packet)?;
    if vendor_id != V3_VENDOR_ID {
      return Ok(Inbound::Unhandled { command_id });
    }

    let (feature, packet_type, id) = Self::split_command_id(command_id);
    match packet_type {
      V3PacketType::Response => Ok(
        Self::command_for(feature, id)
          .map(Inbound::Accepted)
          .unwrap_or(Inbound::Unhandled { command_id }),
      ),
      V3PacketType::Error => match Self::command_for(feature, id) {
        Some(command) => Ok(Inbound::Rejected {
          command,
          status: *payload.first().ok_or(Error::TruncatedEnvelope(packet.len()))?,
        }),
        None => Ok(Inbound::Unhandled { command_id }),
      },
      V3PacketType::Notification if feature == V3_UPGRADE_FEATURE => match id {
        V3_NOTIFICATION_UPGRADE_DATA => Ok(Inbound::UpgradeData(payload.to_vec())),
        V3_NOTIFICATION_STOP_REQUEST => Ok(Inbound::StopRequest),
        V3_NOTIFICATION_START_REQUEST => Ok(Inbound::StartRequest),
        _ => Ok(Inbound::Unhandled { command_id }),
      },
      _ => Ok(Inbound::Unhandled { command_id }),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::codec::Opcode;

  #[test]
  fn test_v3_command_id_layout() {
    assert_eq!(V3Envelope::command_id(6, V3PacketType::Command, 2), 0x0C02);
    assert_eq!(V3Envelope::command_id(6, V3PacketType::Response, 0), 0x0D00);
    assert_eq!(V3Envelope::command_id(6, V3PacketType::Notification, 0), 0x0C80);
    assert_eq!(
      V3Envelope::split_command_id(0x0D80),
      (6, V3PacketType::Error, 0)
    );
  }

  #[test]
  fn test_v3_control_wraps_frame() {
    let packet = V3Envelope.upgrade_control(&UpdateFrame::sync_request([1, 2, 3, 4]));
    assert_eq!(packet, vec![0x00, 0x1D, 0x0C, 0x02, 0x13, 0x00, 0x04, 1, 2, 3, 4]);
  }

  #[test]
  fn test_v3_decode_notification_and_error() {
    let data = gaia_packet(V3_VENDOR_ID, 0x0C80, &[0x12, 0x00, 0x00]);
    assert_eq!(
      V3Envelope.decode(&data).unwrap(),
      Inbound::UpgradeData(vec![0x12, 0x00, 0x00])
    );

    let rejected = gaia_packet(V3_VENDOR_ID, 0x0D80, &[0x05]);
    assert_eq!(
      V3Envelope.decode(&rejected).unwrap(),
      Inbound::Rejected {
        command: UpgradeCommand::Connect,
        status: 0x05
      }
    );

    let stop = gaia_packet(V3_VENDOR_ID, V3Envelope::upgrade_notification_id(1), &[]);
    assert_eq!(V3Envelope.decode(&stop).unwrap(), Inbound::StopRequest);
  }

  #[test]
  fn test_v2_ack_and_event() {
    let ack = gaia_packet(V2_VENDOR_ID, V2_UPGRADE_CONNECT | V2_ACK_MASK, &[0x00]);
    assert_eq!(V2Envelope.decode(&ack).unwrap(), Inbound::Accepted(UpgradeCommand::Connect));

    let nak = gaia_packet(V2_VENDOR_ID, V2_UPGRADE_CONTROL | V2_ACK_MASK, &[0x01]);
    assert_eq!(
      V2Envelope.decode(&nak).unwrap(),
      Inbound::Rejected {
        command: UpgradeCommand::Control,
        status: 0x01
      }
    );

    let frame = UpdateFrame::empty(Opcode::AbortCfm).encode();
    let mut payload = vec![V2_EVENT_UPGRADE_PACKET];
    payload.extend_from_slice(&frame);
    let event = gaia_packet(V2_VENDOR_ID, V2_EVENT_NOTIFICATION, &payload);
    assert_eq!(V2Envelope.decode(&event).unwrap(), Inbound::UpgradeData(frame));
  }

  #[test]
  fn test_truncated_and_foreign_packets() {
    assert!(matches!(
      V2Envelope.decode(&[0x00, 0x0A, 0x06]),
      Err(Error::TruncatedEnvelope(3))
    ));
    let foreign = gaia_packet(0x1234, 0x0001, &[]);
    assert_eq!(
      V3Envelope.decode(&foreign).unwrap(),
      Inbound::Unhandled { command_id: 0x0001 }
    );
  }
}
