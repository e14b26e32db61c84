use serde::{Deserialize, Serialize};

use crate::{
  config::UpdateSettings, Error, Result, ATT_HEADER_LENGTH, BLE_ACKNOWLEDGED_OVERHEAD, BLE_WINDOWED_OVERHEAD,
  DEFAULT_ATT_MTU, IAP2_EXTENDED_LENGTH_THRESHOLD, IAP2_EXTENDED_OVERHEAD, IAP2_HEADER_LENGTH, IAP2_OVERHEAD,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionKind {
  Ble,
  Iap2,
}

/// What the connection can do, queried once when an update starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransportCapabilities {
  pub max_write_length: usize,
  pub max_write_without_response_length: usize,
  #[serde(default)]
  pub data_length_extension_supported: bool,
  #[serde(default)]
  pub rwcp_supported: bool,
  pub kind: ConnectionKind,
}

/// Which path a packet leaves on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Channel {
  /// GAIA command packets; completion is not reported back
  Command,
  /// DATA packets, tagged with a sequence number; the caller reports each completion with that number through
  /// [UpdateEngine::handle_send_complete](crate::UpdateEngine::handle_send_complete)
  Data(u32),
  /// RWCP segments, written without response
  Rwcp,
}

/// Connection to the device's update feature.
///
/// Inbound packets are demultiplexed by the caller and fed to the engine; the transport only sends.
pub trait Transport: Send {
  fn capabilities(&self) -> TransportCapabilities;
  fn send(&mut self, channel: Channel, bytes: &[u8]) -> Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportNegotiation {
  BleAcknowledged,
  BleWindowed { initial_window: u8, max_window: u8 },
  Iap2 { expect_acks: bool },
}

impl TransportNegotiation {
  pub fn negotiate(settings: &UpdateSettings, capabilities: &TransportCapabilities) -> Self {
    match capabilities.kind {
      ConnectionKind::Iap2 => TransportNegotiation::Iap2 {
        expect_acks: settings.expect_acks,
      },
      ConnectionKind::Ble if settings.use_rwcp && capabilities.rwcp_supported => TransportNegotiation::BleWindowed {
        initial_window: settings.initial_window,
        max_window: settings.max_window,
      },
      ConnectionKind::Ble => TransportNegotiation::BleAcknowledged,
    }
  }

  pub fn is_windowed(&self) -> bool {
    matches!(self, TransportNegotiation::BleWindowed { .. })
  }

  /// Each DATA packet also waits for the device's GAIA acknowledgement before the next one goes out.
  pub fn expects_device_acks(&self) -> bool {
    matches!(self, TransportNegotiation::Iap2 { expect_acks: true })
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketSizing {
  pub negotiated_mtu: usize,
  pub framing_overhead: usize,
  /// file bytes per DATA packet, always even
  pub max_payload: usize,
}

impl PacketSizing {
  pub fn compute(
    settings: &UpdateSettings,
    capabilities: &TransportCapabilities,
    negotiation: &TransportNegotiation,
  ) -> Result<Self> {
    let (negotiated_mtu, framing_overhead) = match negotiation {
      TransportNegotiation::BleAcknowledged | TransportNegotiation::BleWindowed { .. } => {
        let windowed = negotiation.is_windowed();
        let cap = if settings.use_data_length_extension && capabilities.data_length_extension_supported {
          let write_length = if windowed {
            capabilities.max_write_without_response_length
          } else {
            capabilities.max_write_length
          };
          write_length + ATT_HEADER_LENGTH
        } else {
          DEFAULT_ATT_MTU
        };
        let overhead = if windowed {
          BLE_WINDOWED_OVERHEAD
        } else {
          BLE_ACKNOWLEDGED_OVERHEAD
        };
        (settings.requested_message_size.min(cap), overhead)
      }
      TransportNegotiation::Iap2 { .. } => {
        let mtu = settings.requested_message_size.min(capabilities.max_write_length);
        let overhead = if mtu.saturating_sub(IAP2_HEADER_LENGTH) > IAP2_EXTENDED_LENGTH_THRESHOLD {
          IAP2_EXTENDED_OVERHEAD
        } else {
          IAP2_OVERHEAD
        };
        (mtu, overhead)
      }
    };

    let max_payload = negotiated_mtu.saturating_sub(framing_overhead) / 2 * 2;
    if max_payload == 0 {
      return Err(Error::InvalidSettings(format!(
        "mtu {negotiated_mtu} leaves no room for data after {framing_overhead} bytes of framing"
      )));
    }

    tracing::debug!(
      "negotiated mtu {negotiated_mtu}, framing overhead {framing_overhead}, max payload {max_payload} \
       ({negotiation:?})"
    );
    Ok(Self {
      negotiated_mtu,
      framing_overhead,
      max_payload,
    })
  }
}
