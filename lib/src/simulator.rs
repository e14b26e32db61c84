//! In-process device speaking the same wire format as real earbuds, plus a harness that wires it to an
//! [UpdateEngine]. Used by the CLI and the end-to-end tests.

use std::{
  collections::VecDeque,
  sync::{Arc, Mutex},
  time::Duration,
};

use crate::{
  codec::{Opcode, ResumePoint, UpdateFrame},
  config::UpdateSettings,
  envelope::{
    gaia_packet, split_packet, ProtocolVersion, UpgradeCommand, V2Envelope, V3Envelope, V3PacketType,
    V2_ACK_MASK, V2_EVENT_NOTIFICATION, V2_EVENT_UPGRADE_PACKET, V2_VENDOR_ID, V3_VENDOR_ID,
  },
  rwcp::{header, split_header, CLIENT_DATA, CLIENT_RST, CLIENT_SYN, SEQUENCE_MASK, SERVER_DATA_ACK, SERVER_GAP,
    SERVER_RST, SERVER_SYN_ACK},
  service::Command,
  BusyPhase, Channel, ConnectionEvent, ConnectionKind, ManualClock, Result, TransferOption, Transport,
  TransportCapabilities, UpdateEngine, UpdateState,
};

const SYNC_CONFIRM_PROTOCOL_VERSION: u8 = 3;
const BATTERY_LOW: u16 = 0x0021;
const SYNC_ID_MISMATCH: u16 = 0x0081;

/// How the simulated device behaves.
#[derive(Debug, Clone)]
pub struct DeviceProfile {
  pub version: ProtocolVersion,
  /// resume point reported on the first sync
  pub resume_point: ResumePoint,
  /// bytes the device already holds from an earlier attempt
  pub resume_offset: usize,
  /// bytes asked for per data request
  pub chunk_request: u32,
  pub battery_low_once: bool,
  pub sync_mismatch_once: bool,
  pub silent_commit_supported: bool,
  /// "not yet" answers before validation finishes
  pub validation_polls: u32,
  pub validation_delay_ms: u16,
  /// drop every nth RWCP data segment
  pub drop_every: Option<usize>,
  pub case_placement_prompt: bool,
  /// answer every DATA packet with a GAIA response
  pub acknowledge_data: bool,
}

impl Default for DeviceProfile {
  fn default() -> Self {
    Self {
      version: ProtocolVersion::V3,
      resume_point: ResumePoint::Start,
      resume_offset: 0,
      chunk_request: 4096,
      battery_low_once: false,
      sync_mismatch_once: false,
      silent_commit_supported: false,
      validation_polls: 0,
      validation_delay_ms: 30,
      drop_every: None,
      case_placement_prompt: false,
      acknowledge_data: false,
    }
  }
}

/// What the device sends back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceOutput {
  Gaia(Vec<u8>),
  Rwcp(Vec<u8>),
  /// the device dropped the link (reboot)
  Disconnected,
  Reconnected,
}

impl DeviceOutput {
  pub fn into_command(self) -> Command {
    match self {
      DeviceOutput::Gaia(packet) => Command::Inbound(packet),
      DeviceOutput::Rwcp(segment) => Command::RwcpSegment(segment),
      DeviceOutput::Disconnected => Command::Connection(ConnectionEvent::Disconnected),
      DeviceOutput::Reconnected => Command::Connection(ConnectionEvent::Reconnected),
    }
  }
}

#[derive(Debug, Default)]
struct RwcpServer {
  expected: u8,
  gap_reported: bool,
  data_segments: usize,
}

#[derive(Debug)]
pub struct SimulatedDevice {
  profile: DeviceProfile,
  image_length: usize,
  image: Vec<u8>,
  resume_point: ResumePoint,
  outstanding: usize,
  validation_polls_left: u32,
  validation_requests: u32,
  battery_warned: bool,
  mismatch_reported: bool,
  connected: bool,
  rwcp_endpoint: bool,
  rwcp: RwcpServer,
  silent_commit_requested: bool,
  committed: bool,
  reboots: u32,
  largest_data_packet: usize,
}

impl SimulatedDevice {
  pub fn new(profile: DeviceProfile) -> Self {
    Self {
      resume_point: profile.resume_point,
      validation_polls_left: profile.validation_polls,
      profile,
      image_length: 0,
      image: vec![],
      outstanding: 0,
      validation_requests: 0,
      battery_warned: false,
      mismatch_reported: false,
      connected: false,
      rwcp_endpoint: false,
      rwcp: RwcpServer::default(),
      silent_commit_requested: false,
      committed: false,
      reboots: 0,
      largest_data_packet: 0,
    }
  }

  /// Tell the device how large the image is, pre-loading the part it already holds.
  pub fn with_image(mut self, file: &[u8]) -> Self {
    self.image_length = file.len();
    let held = self.profile.resume_offset.min(file.len());
    self.image = file[..held].to_vec();
    self
  }

  /// Bytes received so far, including the pre-loaded part.
  pub fn image(&self) -> &[u8] {
    &self.image
  }

  pub fn validation_requests(&self) -> u32 {
    self.validation_requests
  }

  pub fn committed(&self) -> bool {
    self.committed
  }

  pub fn silent_commit_requested(&self) -> bool {
    self.silent_commit_requested
  }

  pub fn reboots(&self) -> u32 {
    self.reboots
  }

  pub fn is_connected(&self) -> bool {
    self.connected
  }

  pub fn uses_rwcp(&self) -> bool {
    self.rwcp_endpoint
  }

  /// Longest GAIA packet that carried image data, without link framing.
  pub fn largest_data_packet(&self) -> usize {
    self.largest_data_packet
  }

  /// Handle one packet written by the host.
  pub fn receive(&mut self, channel: Channel, bytes: &[u8]) -> Vec<DeviceOutput> {
    match channel {
      Channel::Rwcp => self.receive_segment(bytes),
      Channel::Data(_) => {
        self.largest_data_packet = self.largest_data_packet.max(bytes.len());
        self.receive_gaia(bytes)
      }
      Channel::Command => self.receive_gaia(bytes),
    }
  }

  fn receive_segment(&mut self, bytes: &[u8]) -> Vec<DeviceOutput> {
    let Some((&first, payload)) = bytes.split_first() else {
      return vec![];
    };
    let (opcode, sequence) = split_header(first);

    match opcode {
      CLIENT_SYN => {
        self.rwcp = RwcpServer::default();
        vec![DeviceOutput::Rwcp(vec![header(SERVER_SYN_ACK, sequence)])]
      }
      CLIENT_RST => {
        self.rwcp = RwcpServer::default();
        vec![DeviceOutput::Rwcp(vec![header(SERVER_RST, 0)])]
      }
      CLIENT_DATA => {
        self.rwcp.data_segments += 1;
        if self
          .profile
          .drop_every
          .is_some_and(|every| every > 0 && self.rwcp.data_segments % every == 0)
        {
          tracing::trace!("simulated loss of segment {sequence}");
          return vec![];
        }

        let last_in_order = self.rwcp.expected.wrapping_sub(1) & SEQUENCE_MASK;
        if sequence != self.rwcp.expected {
          let ahead = sequence.wrapping_sub(self.rwcp.expected) & SEQUENCE_MASK;
          if ahead < 32 {
            if self.rwcp.gap_reported {
              return vec![];
            }
            self.rwcp.gap_reported = true;
            return vec![DeviceOutput::Rwcp(vec![header(SERVER_GAP, last_in_order)])];
          }
          // already have it
          return vec![DeviceOutput::Rwcp(vec![header(SERVER_DATA_ACK, last_in_order)])];
        }

        self.largest_data_packet = self.largest_data_packet.max(payload.len());
        self.rwcp.expected = (sequence + 1) & SEQUENCE_MASK;
        self.rwcp.gap_reported = false;
        let mut outputs = vec![DeviceOutput::Rwcp(vec![header(SERVER_DATA_ACK, sequence)])];
        outputs.extend(self.receive_gaia(payload));
        outputs
      }
      _ => vec![],
    }
  }

  fn classify(&self, command_id: u16) -> Option<UpgradeCommand> {
    match self.profile.version {
      ProtocolVersion::V2 => V2Envelope::command_for(command_id),
      ProtocolVersion::V3 => {
        let (feature, packet_type, id) = V3Envelope::split_command_id(command_id);
        (packet_type == V3PacketType::Command)
          .then(|| V3Envelope::command_for(feature, id))
          .flatten()
      }
    }
  }

  fn response(&self, command: UpgradeCommand) -> DeviceOutput {
    DeviceOutput::Gaia(match self.profile.version {
      ProtocolVersion::V2 => gaia_packet(V2_VENDOR_ID, V2Envelope::command_id(command) | V2_ACK_MASK, &[0x00]),
      ProtocolVersion::V3 => {
        let (feature, id) = V3Envelope::feature_and_id(command);
        gaia_packet(V3_VENDOR_ID, V3Envelope::command_id(feature, V3PacketType::Response, id), &[])
      }
    })
  }

  fn notify(&self, frame: UpdateFrame) -> DeviceOutput {
    let encoded = frame.encode();
    DeviceOutput::Gaia(match self.profile.version {
      ProtocolVersion::V2 => {
        let mut payload = vec![V2_EVENT_UPGRADE_PACKET];
        payload.extend_from_slice(&encoded);
        gaia_packet(V2_VENDOR_ID, V2_EVENT_NOTIFICATION, &payload)
      }
      ProtocolVersion::V3 => gaia_packet(V3_VENDOR_ID, V3Envelope::upgrade_notification_id(0), &encoded),
    })
  }

  fn receive_gaia(&mut self, packet: &[u8]) -> Vec<DeviceOutput> {
    let Ok((_, command_id, payload)) = split_packet(packet) else {
      return vec![];
    };
    let Some(command) = self.classify(command_id) else {
      tracing::trace!("device ignoring command {command_id:#06x}");
      return vec![];
    };

    let mut outputs = vec![];
    match command {
      UpgradeCommand::RegisterNotification => outputs.push(self.response(command)),
      UpgradeCommand::Connect => {
        self.connected = true;
        outputs.push(self.response(command));
      }
      UpgradeCommand::Disconnect => {
        self.connected = false;
        outputs.push(self.response(command));
      }
      UpgradeCommand::SetDataEndpoint => {
        self.rwcp_endpoint = payload.first() == Some(&0x01);
        outputs.push(self.response(command));
      }
      UpgradeCommand::Control => match UpdateFrame::decode(payload) {
        Ok(frame) => {
          if frame.opcode == Opcode::Data && self.profile.acknowledge_data {
            outputs.push(self.response(command));
          }
          for reply in self.handle_frame(frame, &mut outputs) {
            outputs.push(self.notify(reply));
          }
        }
        Err(err) => tracing::warn!("device could not decode frame: {err}"),
      },
    }
    outputs
  }

  fn data_request(&mut self, offset: usize) -> UpdateFrame {
    let remaining = self.image_length.saturating_sub(self.image.len());
    let length = (self.profile.chunk_request as usize).min(remaining);
    self.outstanding = length;
    let mut payload = Vec::with_capacity(8);
    payload.extend_from_slice(&(length as u32).to_be_bytes());
    payload.extend_from_slice(&(offset as u32).to_be_bytes());
    UpdateFrame::new(Opcode::DataBytesReq, payload)
  }

  /// Returns frames for the host. Link-level events go straight into `outputs`.
  fn handle_frame(&mut self, frame: UpdateFrame, outputs: &mut Vec<DeviceOutput>) -> Vec<UpdateFrame> {
    let payload = frame.payload.as_slice();
    match frame.opcode {
      Opcode::SyncReq => {
        if self.profile.sync_mismatch_once && !self.mismatch_reported {
          self.mismatch_reported = true;
          return vec![UpdateFrame::new(Opcode::ErrorWarnInd, SYNC_ID_MISMATCH.to_be_bytes().to_vec())];
        }
        vec![UpdateFrame::new(
          Opcode::SyncCfm,
          vec![self.resume_point as u8, 0, 0, 0, 0, SYNC_CONFIRM_PROTOCOL_VERSION],
        )]
      }
      Opcode::StartReq => {
        if self.profile.battery_low_once && !self.battery_warned {
          self.battery_warned = true;
          return vec![UpdateFrame::new(Opcode::ErrorWarnInd, BATTERY_LOW.to_be_bytes().to_vec())];
        }
        vec![UpdateFrame::new(Opcode::StartCfm, vec![0x00, 0x00, 0x64])]
      }
      Opcode::StartDataReq => {
        let mut frames = vec![];
        if self.profile.case_placement_prompt {
          frames.push(UpdateFrame::new(Opcode::CasePlacementInd, vec![0x00]));
          frames.push(UpdateFrame::new(Opcode::CasePlacementInd, vec![0x01]));
        }
        // the host restarts from zero after every sync
        let held = self.image.len();
        frames.push(self.data_request(held));
        frames
      }
      Opcode::Data => {
        let Some((_, bytes)) = payload.split_first() else {
          return vec![];
        };
        let take = bytes.len().min(self.outstanding);
        self.image.extend_from_slice(&bytes[..take]);
        self.outstanding -= take;
        if self.outstanding > 0 {
          return vec![];
        }
        if self.image.len() >= self.image_length {
          self.resume_point = ResumePoint::Validate;
          return vec![];
        }
        vec![self.data_request(0)]
      }
      Opcode::IsValidationDoneReq => {
        self.validation_requests += 1;
        if self.validation_polls_left > 0 {
          self.validation_polls_left -= 1;
          let delay = self.profile.validation_delay_ms.to_be_bytes().to_vec();
          return vec![UpdateFrame::new(Opcode::IsValidationDoneCfm, delay)];
        }
        self.resume_point = ResumePoint::Reboot;
        vec![UpdateFrame::empty(Opcode::TransferCompleteInd)]
      }
      Opcode::SilentCommitSupportedReq => vec![UpdateFrame::new(
        Opcode::SilentCommitSupportedCfm,
        vec![self.profile.silent_commit_supported as u8],
      )],
      Opcode::SilentCommitReq => {
        self.silent_commit_requested = true;
        vec![]
      }
      Opcode::TransferCompleteRes => {
        if payload.first() == Some(&0x00) {
          self.reboot(outputs);
        } else {
          self.reset_transfer();
        }
        vec![]
      }
      Opcode::InProgressRes => {
        self.resume_point = ResumePoint::Commit;
        vec![UpdateFrame::empty(Opcode::CommitReq)]
      }
      Opcode::CommitCfm => {
        if payload.first() == Some(&0x00) {
          self.committed = true;
          self.resume_point = ResumePoint::Start;
          vec![UpdateFrame::empty(Opcode::CompleteInd)]
        } else {
          self.reset_transfer();
          vec![]
        }
      }
      Opcode::AbortReq => {
        self.reset_transfer();
        vec![UpdateFrame::empty(Opcode::AbortCfm)]
      }
      Opcode::ErrorWarnRes => {
        tracing::trace!("host acknowledged error {payload:02x?}");
        vec![]
      }
      opcode => {
        tracing::warn!("device ignoring {opcode:?}");
        vec![]
      }
    }
  }

  fn reset_transfer(&mut self) {
    self.image.clear();
    self.outstanding = 0;
    self.resume_point = ResumePoint::Start;
    self.validation_polls_left = self.profile.validation_polls;
  }

  fn reboot(&mut self, outputs: &mut Vec<DeviceOutput>) {
    tracing::debug!("simulated device rebooting");
    self.reboots += 1;
    self.resume_point = ResumePoint::PostReboot;
    self.connected = false;
    self.rwcp = RwcpServer::default();
    outputs.push(DeviceOutput::Disconnected);
    outputs.push(DeviceOutput::Reconnected);
  }
}

/// Transport that queues everything the engine writes for the harness to deliver.
#[derive(Debug, Clone)]
pub struct SimTransport {
  capabilities: TransportCapabilities,
  outbox: Arc<Mutex<VecDeque<(Channel, Vec<u8>)>>>,
}

impl SimTransport {
  pub fn new(capabilities: TransportCapabilities) -> Self {
    Self {
      capabilities,
      outbox: Arc::new(Mutex::new(VecDeque::new())),
    }
  }

  pub fn ble(max_write_length: usize, rwcp_supported: bool) -> Self {
    Self::new(TransportCapabilities {
      max_write_length,
      max_write_without_response_length: max_write_length,
      data_length_extension_supported: true,
      rwcp_supported,
      kind: ConnectionKind::Ble,
    })
  }

  pub fn iap2(max_write_length: usize) -> Self {
    Self::new(TransportCapabilities {
      max_write_length,
      max_write_without_response_length: max_write_length,
      data_length_extension_supported: false,
      rwcp_supported: false,
      kind: ConnectionKind::Iap2,
    })
  }

  pub fn pop(&self) -> Option<(Channel, Vec<u8>)> {
    self.outbox.lock().unwrap_or_else(|poisoned| poisoned.into_inner()).pop_front()
  }
}

impl Transport for SimTransport {
  fn capabilities(&self) -> TransportCapabilities {
    self.capabilities
  }

  fn send(&mut self, channel: Channel, bytes: &[u8]) -> Result<()> {
    self
      .outbox
      .lock()
      .unwrap_or_else(|poisoned| poisoned.into_inner())
      .push_back((channel, bytes.to_vec()));
    Ok(())
  }
}

/// Answers the engine's confirmation states the way a user would.
#[derive(Debug, Clone)]
pub struct AutoResponder {
  pub accept_force_upgrade: bool,
  pub transfer_option: TransferOption,
  pub commit: bool,
  pub retry_case_timeout: bool,
  /// pause once this many bytes are confirmed, then resume
  pub pause_at: Option<usize>,
}

impl Default for AutoResponder {
  fn default() -> Self {
    Self {
      accept_force_upgrade: true,
      transfer_option: TransferOption::Interactive,
      commit: true,
      retry_case_timeout: true,
      pause_at: None,
    }
  }
}

/// Runs an engine against a [SimulatedDevice] on a manual clock until the update stops.
pub struct SimulationHarness {
  engine: UpdateEngine<SimTransport>,
  device: SimulatedDevice,
  transport: SimTransport,
  clock: ManualClock,
  responder: AutoResponder,
  tick: Duration,
  paused_once: bool,
}

impl SimulationHarness {
  pub fn new(device: SimulatedDevice, transport: SimTransport, responder: AutoResponder) -> Self {
    let clock = ManualClock::new();
    let engine = UpdateEngine::new(transport.clone(), device.profile.version).with_clock(Arc::new(clock.clone()));
    Self {
      engine,
      device,
      transport,
      clock,
      responder,
      tick: Duration::from_millis(10),
      paused_once: false,
    }
  }

  pub fn engine(&self) -> &UpdateEngine<SimTransport> {
    &self.engine
  }

  pub fn engine_mut(&mut self) -> &mut UpdateEngine<SimTransport> {
    &mut self.engine
  }

  pub fn device(&self) -> &SimulatedDevice {
    &self.device
  }

  pub fn clock(&self) -> &ManualClock {
    &self.clock
  }

  /// Start an update and step until a terminal state or `max_steps` is reached.
  pub fn run(
    &mut self,
    file: &[u8],
    settings: &UpdateSettings,
    previous_transfer_completed: bool,
    max_steps: usize,
  ) -> UpdateState {
    self.engine.start_update(file.to_vec(), settings, previous_transfer_completed);

    for _ in 0..max_steps {
      if self.engine.state().is_terminal() {
        break;
      }
      self.step();
    }
    self.engine.state()
  }

  /// Deliver one host packet, or when idle answer a prompt or let time pass.
  pub fn step(&mut self) {
    if let Some((channel, packet)) = self.transport.pop() {
      let outputs = self.device.receive(channel, &packet);
      if let Channel::Data(sequence) = channel {
        self.engine.handle_send_complete(sequence, Ok(()));
      }
      for output in outputs {
        self.deliver(output);
      }
      self.maybe_pause();
      return;
    }

    if !self.respond() {
      self.clock.advance(self.tick);
      self.engine.tick();
    }
  }

  fn deliver(&mut self, output: DeviceOutput) {
    match output {
      DeviceOutput::Gaia(packet) => self.engine.handle_inbound(&packet),
      DeviceOutput::Rwcp(segment) => self.engine.handle_rwcp_segment(&segment),
      DeviceOutput::Disconnected => self.engine.handle_connection_event(ConnectionEvent::Disconnected),
      DeviceOutput::Reconnected => self.engine.handle_connection_event(ConnectionEvent::Reconnected),
    }
  }

  fn maybe_pause(&mut self) {
    let Some(at) = self.responder.pause_at else {
      return;
    };
    if !self.paused_once
      && self.engine.state() == UpdateState::Busy(BusyPhase::Transferring)
      && self.engine.progress().progress_bytes >= at
    {
      tracing::info!("pausing at {} bytes", self.engine.progress().progress_bytes);
      self.paused_once = true;
      self.engine.pause();
    }
  }

  fn respond(&mut self) -> bool {
    let responder = &self.responder;
    match self.engine.state() {
      UpdateState::Busy(BusyPhase::AwaitingConfirmForceUpgrade) => {
        self.engine.confirm_force_upgrade_response(responder.accept_force_upgrade)
      }
      UpdateState::Busy(BusyPhase::AwaitingConfirmBatteryLow) => self.engine.battery_warning_confirmed(),
      UpdateState::Busy(BusyPhase::AwaitingConfirmTransferRequired) => {
        self.engine.commit_transfer_required(responder.transfer_option)
      }
      UpdateState::Busy(BusyPhase::AwaitingConfirmation) => self.engine.commit_confirm(responder.commit),
      UpdateState::Busy(BusyPhase::AwaitingEarbudsInCaseTimedOut) => {
        self.engine.earbuds_in_case_timeout_response(responder.retry_case_timeout)
      }
      UpdateState::Busy(BusyPhase::Paused) if self.paused_once => {
        tracing::info!("resuming");
        self.engine.unpause()
      }
      _ => return false,
    }
    true
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::envelope::GaiaEnvelope;

  #[test]
  fn test_device_answers_registration_and_sync() {
    let mut device = SimulatedDevice::new(DeviceProfile::default());
    let register = V3Envelope.register_notification();
    let outputs = device.receive(Channel::Command, &register);
    assert_eq!(outputs.len(), 1);

    let sync = gaia_packet(
      V3_VENDOR_ID,
      V3Envelope::command_id(6, V3PacketType::Command, 2),
      &UpdateFrame::sync_request([1, 2, 3, 4]).encode(),
    );
    let outputs = device.receive(Channel::Command, &sync);
    let expected = gaia_packet(
      V3_VENDOR_ID,
      V3Envelope::upgrade_notification_id(0),
      &[0x14, 0x00, 0x06, 0x00, 0, 0, 0, 0, 3],
    );
    assert_eq!(outputs, vec![DeviceOutput::Gaia(expected)]);
  }

  #[test]
  fn test_rwcp_server_gap_and_loss() {
    let mut device = SimulatedDevice::new(DeviceProfile {
      drop_every: Some(2),
      ..Default::default()
    });
    assert_eq!(
      device.receive(Channel::Rwcp, &[header(CLIENT_SYN, 0)]),
      vec![DeviceOutput::Rwcp(vec![header(SERVER_SYN_ACK, 0)])]
    );
    // empty GAIA payloads are ignored, only the acknowledgements matter here
    assert_eq!(
      device.receive(Channel::Rwcp, &[header(CLIENT_DATA, 0)]),
      vec![DeviceOutput::Rwcp(vec![header(SERVER_DATA_ACK, 0)])]
    );
    assert!(device.receive(Channel::Rwcp, &[header(CLIENT_DATA, 1)]).is_empty());
    assert_eq!(
      device.receive(Channel::Rwcp, &[header(CLIENT_DATA, 2)]),
      vec![DeviceOutput::Rwcp(vec![header(SERVER_GAP, 0)])]
    );
  }

  #[test]
  fn test_harness_completes_small_update() {
    let file: Vec<u8> = (0..300).map(|i| (i * 7) as u8).collect();
    let device = SimulatedDevice::new(DeviceProfile {
      chunk_request: 100,
      ..Default::default()
    })
    .with_image(&file);
    let mut harness = SimulationHarness::new(device, SimTransport::ble(64, false), AutoResponder::default());

    let state = harness.run(&file, &UpdateSettings::default(), false, 10_000);
    assert!(matches!(
      state,
      UpdateState::Stopped(crate::StopReason::Completed(status)) if status.bytes_sent == 300
    ));
    assert_eq!(harness.device().image(), file.as_slice());
    assert!(harness.device().committed());
    assert_eq!(harness.device().reboots(), 1);
  }
}
