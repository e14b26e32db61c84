use std::{sync::Arc, time::Duration};

use crate::{
  clock::{Clock, SystemClock},
  codec::{CasePlacement, DataBytesRequest, DeviceMessage, Opcode, ResumePoint, StartConfirm, SyncConfirm, UpdateFrame},
  config::UpdateSettings,
  device_error::{DeviceErrorCode, Recovery},
  envelope::{envelope_for, GaiaEnvelope, Inbound, ProtocolVersion, UpgradeCommand},
  progress::UpdateProgress,
  rwcp::{RwcpClient, RwcpConfig, RwcpEvent},
  session::{InFlightPacket, PendingPacket, UpdateSession},
  state::{AbortReason, BusyPhase, CompletionStatus, StopReason, TransferOption, UpdateState},
  transport::{Channel, PacketSizing, Transport, TransportCapabilities, TransportNegotiation},
  Callback, Event, Result,
};

/// Signals from whoever manages the physical connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionEvent {
  Disconnected,
  Reconnected,
  /// the device did not come back after a disconnect
  ReconnectionTimedOut,
}

/// Progress of the GAIA-level link setup that precedes every sync.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LinkStage {
  Disconnected,
  Registering,
  Connecting,
  SettingEndpoint,
  Connected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PauseCause {
  User,
  /// stop request or handover
  Device,
  Link,
  TransportError,
}

/// Drives one firmware update at a time over a [Transport].
///
/// Every method runs to completion without blocking; results show up as [UpdateState] changes.
pub struct UpdateEngine<T: Transport> {
  transport: T,
  envelope: Box<dyn GaiaEnvelope>,
  clock: Arc<dyn Clock>,
  callback: Option<Callback>,

  session: Option<UpdateSession>,
  state: UpdateState,
  negotiation: Option<TransportNegotiation>,
  sizing: Option<PacketSizing>,
  rwcp: Option<RwcpClient>,

  link: LinkStage,
  resync_after_abort: bool,
  pause_cause: Option<PauseCause>,
  validation_retry_at: Option<std::time::Instant>,
  silent_commit_supported: bool,
  pending_error: Option<DeviceErrorCode>,
  /// tag for the next DATA send; never reused across sessions
  next_data_sequence: u32,
}

impl<T: Transport> UpdateEngine<T> {
  pub fn new(transport: T, version: ProtocolVersion) -> Self {
    Self {
      transport,
      envelope: envelope_for(version),
      clock: Arc::new(SystemClock),
      callback: None,
      session: None,
      state: UpdateState::Ready,
      negotiation: None,
      sizing: None,
      rwcp: None,
      link: LinkStage::Disconnected,
      resync_after_abort: false,
      pause_cause: None,
      validation_retry_at: None,
      silent_commit_supported: false,
      pending_error: None,
      next_data_sequence: 0,
    }
  }

  pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
    self.clock = clock;
    self
  }

  pub fn with_callback(mut self, callback: Callback) -> Self {
    self.callback = Some(callback);
    self
  }

  pub fn set_callback(&mut self, callback: Option<Callback>) {
    self.callback = callback;
  }

  pub fn state(&self) -> UpdateState {
    self.state
  }

  pub fn progress(&self) -> UpdateProgress {
    self
      .session
      .as_ref()
      .map(|session| session.accounting().snapshot(self.clock.now()))
      .unwrap_or_default()
  }

  pub fn session(&self) -> Option<&UpdateSession> {
    self.session.as_ref()
  }

  pub fn protocol_version(&self) -> ProtocolVersion {
    self.envelope.version()
  }

  /// Lets the caller pick settings before [UpdateEngine::start_update].
  pub fn transport_capabilities(&self) -> TransportCapabilities {
    self.transport.capabilities()
  }

  pub fn transport_negotiation(&self) -> Option<TransportNegotiation> {
    self.negotiation
  }

  pub fn packet_sizing(&self) -> Option<PacketSizing> {
    self.sizing
  }

  /// Whether the device offered silent commit for the current transfer.
  pub fn silent_commit_supported(&self) -> bool {
    self.silent_commit_supported
  }

  pub fn transport(&self) -> &T {
    &self.transport
  }

  pub fn transport_mut(&mut self) -> &mut T {
    &mut self.transport
  }

  fn in_progress(&self) -> bool {
    self.session.as_ref().is_some_and(|session| session.in_progress)
  }

  fn paused(&self) -> bool {
    self.session.as_ref().is_some_and(|session| session.paused)
  }

  fn aborting(&self) -> bool {
    self.session.as_ref().is_some_and(|session| session.aborted)
  }

  fn set_state(&mut self, state: UpdateState) {
    if self.state == state {
      return;
    }
    tracing::info!("update state {} -> {}", self.state, state);
    self.state = state;
    if let Some(callback) = &self.callback {
      callback(Event::StateChanged(state));
    }
  }

  fn set_phase(&mut self, phase: BusyPhase) {
    self.set_state(UpdateState::Busy(phase));
  }

  fn emit_progress(&self) {
    if let Some(callback) = &self.callback {
      callback(Event::Progress(self.progress()));
    }
  }

  // ---- public operations ----

  /// Start transferring `file`. Ignored while another update is running and not paused.
  #[cfg_attr(feature = "instrument", tracing::instrument(level = "trace", skip_all))]
  pub fn start_update(
    &mut self,
    file: impl Into<Arc<[u8]>>,
    settings: &UpdateSettings,
    previous_transfer_completed: bool,
  ) {
    if self.aborting() && self.state.is_terminal() {
      tracing::debug!("device never confirmed the abort, releasing the old session");
      self.release_session();
    }
    if self.in_progress() && !self.paused() {
      tracing::debug!("update already running, ignoring start");
      return;
    }
    if let Some(rwcp) = self.rwcp.as_mut() {
      rwcp.abort();
    }

    let capabilities = self.transport.capabilities();
    let negotiation = TransportNegotiation::negotiate(settings, &capabilities);
    let sizing = match settings
      .validate()
      .and_then(|_| PacketSizing::compute(settings, &capabilities, &negotiation))
    {
      Ok(sizing) => sizing,
      Err(err) => {
        tracing::error!("cannot start update: {err}");
        self.session = None;
        self.set_state(UpdateState::Stopped(StopReason::Aborted(AbortReason::UnsupportedTransport)));
        return;
      }
    };

    let session = UpdateSession::new(file.into(), previous_transfer_completed, sizing.max_payload);
    tracing::info!(
      "starting update of {} bytes (id {:02x?}) over {negotiation:?}, {} bytes per packet",
      session.file().len(),
      session.identifier(),
      sizing.max_payload
    );

    self.rwcp = negotiation
      .is_windowed()
      .then(|| RwcpClient::new(RwcpConfig::from_settings(settings)));
    self.negotiation = Some(negotiation);
    self.sizing = Some(sizing);
    self.session = Some(session);
    self.resync_after_abort = false;
    self.pause_cause = None;
    self.validation_retry_at = None;
    self.silent_commit_supported = false;
    self.pending_error = None;

    self.set_phase(BusyPhase::Connecting);
    self.begin_connect();
  }

  pub fn pause(&mut self) {
    self.pause_with(PauseCause::User);
  }

  pub fn unpause(&mut self) {
    if !self.in_progress() || !self.paused() || self.aborting() {
      tracing::debug!("not paused, ignoring unpause");
      return;
    }
    if let Some(session) = self.session.as_mut() {
      session.paused = false;
      session.reset_transfer_position();
    }
    self.pause_cause = None;
    self.emit_progress();
    self.set_phase(BusyPhase::Unpausing);
    self.begin_connect();
  }

  /// Cancel the update. The session is released once the device confirms.
  pub fn abort(&mut self) {
    self.abort_with(AbortReason::UserCancelled);
  }

  /// Answer the device's commit request. Declining aborts.
  pub fn commit_confirm(&mut self, accept: bool) {
    if !self.expect_phase(BusyPhase::AwaitingConfirmation) {
      return;
    }
    if !accept {
      self.abort();
      return;
    }
    self.send_control(UpdateFrame::commit_confirm(true));
    self.set_phase(BusyPhase::Restarting);
  }

  /// Answer a sync id mismatch. Accepting aborts the other transfer on the device and syncs again.
  pub fn confirm_force_upgrade_response(&mut self, accept: bool) {
    if !self.expect_phase(BusyPhase::AwaitingConfirmForceUpgrade) {
      return;
    }
    self.acknowledge_pending_error();

    if accept {
      tracing::info!("forcing upgrade, aborting the device's previous transfer");
      self.resync_after_abort = true;
      self.set_phase(BusyPhase::Connecting);
      self.abort_with(AbortReason::UserCancelled);
    } else {
      self.send_quietly(Channel::Command, self.envelope.upgrade_disconnect());
      self.link = LinkStage::Disconnected;
      self.release_session();
      self.set_state(UpdateState::Stopped(StopReason::Aborted(AbortReason::UserCancelled)));
    }
  }

  /// Tell the device how to apply the transferred image.
  pub fn commit_transfer_required(&mut self, option: TransferOption) {
    if !self.expect_phase(BusyPhase::AwaitingConfirmTransferRequired) {
      return;
    }

    match option {
      TransferOption::Cancel => self.abort(),
      TransferOption::Silent if self.silent_commit_supported => {
        self.send_control(UpdateFrame::empty(Opcode::SilentCommitReq));
        if let Some(session) = self.session.as_mut() {
          session.silent_commit_confirmed = true;
          session.mark_transfer_acknowledged();
        }
        self.send_quietly(Channel::Command, self.envelope.upgrade_disconnect());
        self.link = LinkStage::Disconnected;
        self.release_session();
        self.set_state(UpdateState::Stopped(StopReason::CompletedAwaitingReboot));
      }
      option => {
        if option == TransferOption::Silent {
          tracing::warn!("device does not support silent commit, rebooting now");
        }
        self.send_control(UpdateFrame::transfer_complete_response(true));
        if let Some(session) = self.session.as_mut() {
          session.mark_transfer_acknowledged();
        }
        let now = self.clock.now();
        if let Some(rwcp) = self.rwcp.as_mut() {
          rwcp.power_off(now);
        }
        self.process_rwcp();
        self.set_phase(BusyPhase::Restarting);
      }
    }
  }

  /// Carry on after the user dealt with a low battery warning.
  pub fn battery_warning_confirmed(&mut self) {
    if !self.expect_phase(BusyPhase::AwaitingConfirmBatteryLow) {
      return;
    }
    self.acknowledge_pending_error();
    self.resync();
  }

  /// Answer a case placement timeout: `retry` syncs again, otherwise the update is aborted.
  pub fn earbuds_in_case_timeout_response(&mut self, retry: bool) {
    if !self.expect_phase(BusyPhase::AwaitingEarbudsInCaseTimedOut) {
      return;
    }
    self.acknowledge_pending_error();
    if retry {
      self.resync();
    } else {
      self.abort();
    }
  }

  #[cfg_attr(feature = "instrument", tracing::instrument(level = "trace", skip_all))]
  pub fn handle_connection_event(&mut self, event: ConnectionEvent) {
    tracing::debug!("connection event {event:?} in {}", self.state);
    match event {
      ConnectionEvent::Disconnected => {
        self.link = LinkStage::Disconnected;
        if !self.in_progress() {
          return;
        }
        if self.aborting() {
          self.finish_abort();
        } else if self.state == UpdateState::Busy(BusyPhase::Restarting) {
          tracing::info!("device disconnected, waiting for it to come back");
        } else if !self.paused() {
          self.pause_with(PauseCause::Link);
        }
      }
      ConnectionEvent::Reconnected => {
        if !self.in_progress() {
          return;
        }
        if self.state == UpdateState::Busy(BusyPhase::Restarting) {
          self.begin_connect();
        } else if self.paused() && self.pause_cause == Some(PauseCause::Link) {
          self.unpause();
        }
      }
      ConnectionEvent::ReconnectionTimedOut => {
        if !self.in_progress() || self.link == LinkStage::Connected {
          return;
        }
        tracing::error!("device did not reconnect");
        self.release_session();
        self.set_state(UpdateState::Stopped(StopReason::Aborted(AbortReason::ReconnectionTimedOut)));
      }
    }
  }

  /// Feed a GAIA packet received on the update feature channel.
  #[cfg_attr(feature = "instrument", tracing::instrument(level = "trace", skip_all))]
  pub fn handle_inbound(&mut self, packet: &[u8]) {
    let inbound = match self.envelope.decode(packet) {
      Ok(inbound) => inbound,
      Err(err) => {
        tracing::warn!("ignoring GAIA packet: {err}");
        return;
      }
    };

    match inbound {
      Inbound::Accepted(command) => self.on_command_accepted(command),
      Inbound::Rejected { command, status } => self.on_command_rejected(command, status),
      Inbound::UpgradeData(bytes) => self.on_upgrade_data(&bytes),
      Inbound::StopRequest => {
        if self.in_progress() && !self.paused() && !self.aborting() {
          tracing::info!("device asked to stop");
          self.pause_with(PauseCause::Device);
        }
      }
      Inbound::StartRequest => {
        if self.paused() {
          tracing::info!("device asked to resume");
          self.unpause();
        }
      }
      Inbound::Unhandled { command_id } => tracing::trace!("unhandled GAIA command {command_id:#06x}"),
    }
  }

  /// Feed an RWCP segment received from the device.
  pub fn handle_rwcp_segment(&mut self, segment: &[u8]) {
    let now = self.clock.now();
    let Some(rwcp) = self.rwcp.as_mut() else {
      tracing::trace!("rwcp segment without a windowed transfer");
      return;
    };
    if let Err(err) = rwcp.handle_segment(now, segment) {
      tracing::warn!("ignoring rwcp segment: {err}");
    }
    self.process_rwcp();
  }

  /// Report the outcome of the [Channel::Data] send tagged `sequence`. Reports for packets dropped by a pause or
  /// abort are ignored.
  #[cfg_attr(feature = "instrument", tracing::instrument(level = "trace", skip_all))]
  pub fn handle_send_complete(&mut self, sequence: u32, result: Result<()>) {
    match self.in_flight().map(|in_flight| in_flight.sequence) {
      Some(current) if current == sequence => {}
      Some(current) => {
        tracing::debug!("ignoring completion of data packet {sequence}, {current} is in flight");
        return;
      }
      None => {
        tracing::trace!("completion of data packet {sequence} without a packet in flight");
        return;
      }
    }
    if let Err(err) = result {
      self.on_transport_failure(err);
      return;
    }

    if let Some(in_flight) = self.in_flight_mut() {
      in_flight.written = true;
    }
    self.finish_in_flight();
  }

  /// Periodic timer: RWCP retransmissions and validation polling.
  #[cfg_attr(feature = "instrument", tracing::instrument(level = "trace", skip_all))]
  pub fn tick(&mut self) {
    let now = self.clock.now();
    if let Some(rwcp) = self.rwcp.as_mut() {
      rwcp.handle_timeout(now);
    }
    self.process_rwcp();

    if self.validation_retry_at.is_some_and(|at| now >= at) {
      self.validation_retry_at = None;
      if self.state == UpdateState::Busy(BusyPhase::Validating) {
        if let Some(identifier) = self.session.as_ref().map(UpdateSession::identifier) {
          tracing::debug!("asking again whether validation is done");
          self.send_control(UpdateFrame::validation_request(identifier));
        }
      }
    }
  }

  // ---- link setup ----

  fn begin_connect(&mut self) {
    self.link = LinkStage::Registering;
    self.send_command(self.envelope.register_notification());
  }

  fn on_command_accepted(&mut self, command: UpgradeCommand) {
    tracing::trace!("{command:?} accepted during {:?}", self.link);
    match (command, self.link) {
      (UpgradeCommand::RegisterNotification, LinkStage::Registering) => {
        self.link = LinkStage::Connecting;
        self.send_command(self.envelope.upgrade_connect());
      }
      (UpgradeCommand::Connect, LinkStage::Connecting) => {
        if self.negotiation.is_some_and(|negotiation| negotiation.is_windowed()) {
          self.link = LinkStage::SettingEndpoint;
          self.send_command(self.envelope.set_data_endpoint(true));
        } else {
          self.on_link_ready();
        }
      }
      (UpgradeCommand::SetDataEndpoint, LinkStage::SettingEndpoint) => self.on_link_ready(),
      (UpgradeCommand::Control, LinkStage::Connected) => self.on_data_acknowledged(),
      (UpgradeCommand::Disconnect, _) => self.link = LinkStage::Disconnected,
      _ => {}
    }
  }

  fn on_command_rejected(&mut self, command: UpgradeCommand, status: u8) {
    tracing::warn!("device rejected {command:?} with status {status:#04x}");
    if !self.in_progress() || command == UpgradeCommand::Disconnect {
      return;
    }
    if self.aborting() {
      self.finish_abort();
      return;
    }
    self.abort_with(AbortReason::CommandRejected(status));
  }

  fn on_link_ready(&mut self) {
    self.link = LinkStage::Connected;
    let Some(session) = self.session.as_ref() else {
      return;
    };
    if session.aborted {
      self.send_control(UpdateFrame::empty(Opcode::AbortReq));
    } else {
      let identifier = session.identifier();
      tracing::debug!("syncing with id {identifier:02x?}");
      self.send_control(UpdateFrame::sync_request(identifier));
    }
  }

  // ---- device messages ----

  fn on_upgrade_data(&mut self, bytes: &[u8]) {
    let message = match DeviceMessage::decode(bytes) {
      Ok(message) => message,
      Err(err) => {
        match err.frame_opcode() {
          Some(opcode) if opcode == Opcode::DataBytesReq as u8 || opcode == Opcode::SyncCfm as u8 => {
            tracing::error!("required frame is malformed: {err}");
            self.abort_with(AbortReason::MalformedFrame(opcode));
          }
          _ => tracing::warn!("ignoring update frame: {err}"),
        }
        return;
      }
    };

    if !self.in_progress() {
      tracing::debug!("no update running, ignoring {message:?}");
      return;
    }
    if self.aborting() && message != DeviceMessage::AbortConfirm {
      tracing::debug!("aborting, ignoring {message:?}");
      return;
    }
    tracing::debug!("device: {message:?}");

    match message {
      DeviceMessage::SyncConfirm(confirm) => self.on_sync_confirm(confirm),
      DeviceMessage::StartConfirm(confirm) => self.on_start_confirm(confirm),
      DeviceMessage::DataBytesRequest(request) => self.on_data_request(request),
      DeviceMessage::AbortConfirm if self.aborting() => self.finish_abort(),
      DeviceMessage::AbortConfirm => tracing::debug!("late abort confirmation"),
      DeviceMessage::TransferComplete => {
        self.validation_retry_at = None;
        self.send_control(UpdateFrame::empty(Opcode::SilentCommitSupportedReq));
      }
      DeviceMessage::SilentCommitSupported(supported) => {
        self.silent_commit_supported = supported;
        self.set_phase(BusyPhase::AwaitingConfirmTransferRequired);
      }
      DeviceMessage::InProgress => self.send_control(UpdateFrame::in_progress_response()),
      DeviceMessage::CommitRequest => self.set_phase(BusyPhase::AwaitingConfirmation),
      DeviceMessage::ErrorWarning(code) => self.on_device_error(DeviceErrorCode(code)),
      DeviceMessage::Complete => self.on_complete(),
      DeviceMessage::ValidationPending { delay_ms } => {
        self.validation_retry_at = Some(self.clock.now() + Duration::from_millis(delay_ms as u64));
      }
      DeviceMessage::CasePlacement(CasePlacement::PlaceInCase) => self.set_phase(BusyPhase::AwaitingEarbudsInCase),
      DeviceMessage::CasePlacement(CasePlacement::InCase) => {
        self.set_phase(BusyPhase::AwaitingEarbudsInCaseConfirmed)
      }
    }
  }

  fn on_sync_confirm(&mut self, confirm: SyncConfirm) {
    if let Some(version) = confirm.protocol_version {
      tracing::debug!("device upgrade protocol version {version}");
    }
    let Some(session) = self.session.as_mut() else {
      return;
    };
    if let Err(reason) = session.accept_resume_point(confirm.resume_point) {
      tracing::error!("device resumed from {:?}, which this session cannot do", confirm.resume_point);
      self.abort_with(reason);
      return;
    }

    match confirm.resume_point {
      ResumePoint::Start => self.send_control(UpdateFrame::empty(Opcode::StartReq)),
      ResumePoint::Validate => self.start_validation(),
      ResumePoint::Reboot => {
        self.set_phase(BusyPhase::Validating);
        self.send_control(UpdateFrame::empty(Opcode::SilentCommitSupportedReq));
      }
      ResumePoint::PostReboot => {
        self.set_phase(BusyPhase::Restarting);
        self.send_control(UpdateFrame::in_progress_response());
      }
      ResumePoint::Commit => self.set_phase(BusyPhase::AwaitingConfirmation),
    }
  }

  fn on_start_confirm(&mut self, confirm: StartConfirm) {
    if confirm.status != 0 {
      self.abort_with(AbortReason::StartRejected(confirm.status));
      return;
    }
    if let Some(level) = confirm.battery_level {
      tracing::debug!("device battery level {level}");
    }
    let now = self.clock.now();
    if let Some(session) = self.session.as_mut() {
      session.accounting_mut().start_timing(now);
    }
    self.set_phase(BusyPhase::Transferring);
    self.send_control(UpdateFrame::empty(Opcode::StartDataReq));
  }

  #[cfg_attr(feature = "instrument", tracing::instrument(level = "trace", skip_all))]
  fn on_data_request(&mut self, request: DataBytesRequest) {
    if self.paused() || self.state.awaiting_confirmation() {
      tracing::debug!("ignoring data request in {}", self.state);
      return;
    }
    let now = self.clock.now();
    let Some(session) = self.session.as_mut() else {
      return;
    };

    session.accounting_mut().start_timing(now);
    let chunks = match session.take_chunks(request) {
      Ok(chunks) => chunks,
      Err(reason) => {
        tracing::error!("device requested {request:?} past the end of the file");
        self.abort_with(reason);
        return;
      }
    };
    let windowed = self.rwcp.is_some();
    tracing::trace!("{request:?} -> {} packets", chunks.len());

    for chunk in chunks {
      let progress_bytes = chunk.bytes.len();
      let packet = self
        .envelope
        .upgrade_control(&UpdateFrame::data(chunk.more_coming, &chunk.bytes));

      if let Some(rwcp) = self.rwcp.as_mut() {
        rwcp.enqueue(now, packet, progress_bytes);
        if chunk.last_in_file {
          session.mark_file_sent();
          rwcp.power_off(now);
        }
      } else {
        session.pending_packets.push_back(PendingPacket {
          bytes: packet,
          progress_bytes,
          last_in_file: chunk.last_in_file,
        });
      }
    }

    self.set_phase(BusyPhase::Transferring);
    self.emit_progress();
    if windowed {
      self.process_rwcp();
    } else {
      self.send_next_packet();
    }
  }

  fn on_device_error(&mut self, code: DeviceErrorCode) {
    let Some(recovery) = code.recovery() else {
      tracing::error!("device error {code}");
      self.send_control(UpdateFrame::error_warn_response(code.0));
      self.abort_with(AbortReason::DeviceError(code));
      return;
    };

    tracing::warn!("device reported {code}");
    self.stop_outbound();
    self.pending_error = Some(code);
    match recovery {
      Recovery::ForceUpgrade => self.set_phase(BusyPhase::AwaitingConfirmForceUpgrade),
      Recovery::BatteryLow => self.set_phase(BusyPhase::AwaitingConfirmBatteryLow),
      Recovery::CaseTimeout => self.set_phase(BusyPhase::AwaitingEarbudsInCaseTimedOut),
      Recovery::Handover => {
        self.acknowledge_pending_error();
        self.pause_with(PauseCause::Device);
      }
    }
  }

  fn on_complete(&mut self) {
    let now = self.clock.now();
    let status = self
      .session
      .as_ref()
      .map(|session| CompletionStatus {
        elapsed: session.accounting().elapsed(now),
        bytes_sent: session.accounting().sent_bytes(),
        bytes_skipped: session.accounting().skipped_bytes(),
      })
      .unwrap_or_default();
    tracing::info!("update complete: {status:?}");

    self.send_quietly(Channel::Command, self.envelope.upgrade_disconnect());
    self.link = LinkStage::Disconnected;
    self.release_session();
    self.set_state(UpdateState::Stopped(StopReason::Completed(status)));
  }

  // ---- transfer ----

  fn send_next_packet(&mut self) {
    let acknowledged = !self.negotiation.is_some_and(|negotiation| negotiation.expects_device_acks());
    let sequence = self.next_data_sequence;
    let Some(session) = self.session.as_mut() else {
      return;
    };
    if session.sending.is_some() {
      return;
    }
    let Some(mut packet) = session.pending_packets.pop_front() else {
      return;
    };
    if packet.last_in_file {
      session.mark_file_sent();
    }

    let bytes = std::mem::take(&mut packet.bytes);
    session.sending = Some(InFlightPacket {
      sequence,
      packet,
      written: false,
      acknowledged,
    });
    self.next_data_sequence = sequence.wrapping_add(1);
    tracing::trace!("sending {} byte data packet {sequence}", bytes.len());
    if let Err(err) = self.transport.send(Channel::Data(sequence), &bytes) {
      self.on_transport_failure(err);
    }
  }

  fn in_flight(&self) -> Option<&InFlightPacket> {
    self.session.as_ref().and_then(|session| session.sending.as_ref())
  }

  fn in_flight_mut(&mut self) -> Option<&mut InFlightPacket> {
    self.session.as_mut().and_then(|session| session.sending.as_mut())
  }

  /// GAIA responses arrive in order and nothing but DATA is sent while a packet is in flight, so an accepted
  /// control command here belongs to that packet.
  fn on_data_acknowledged(&mut self) {
    let Some(in_flight) = self.in_flight_mut() else {
      return;
    };
    if in_flight.acknowledged {
      return;
    }
    in_flight.acknowledged = true;
    self.finish_in_flight();
  }

  /// Credit the in-flight packet once it is done, then send the next one or ask for validation.
  fn finish_in_flight(&mut self) {
    let Some(session) = self.session.as_mut() else {
      return;
    };
    if !session.sending.as_ref().is_some_and(InFlightPacket::done) {
      return;
    }
    let Some(sent) = session.sending.take() else {
      return;
    };
    session.accounting_mut().record_sent(sent.packet.progress_bytes);
    let more = !session.pending_packets.is_empty();
    let validate = session.needs_validation;
    self.emit_progress();

    if more {
      self.send_next_packet();
    } else if validate {
      self.start_validation();
    }
  }

  fn start_validation(&mut self) {
    let now = self.clock.now();
    let Some(session) = self.session.as_mut() else {
      return;
    };
    session.needs_validation = false;
    let identifier = session.identifier();

    let accounting = session.accounting();
    match accounting.throughput_kbps(now) {
      Some(kbps) => tracing::info!(
        "transferred {} bytes ({} skipped) in {:?}: {kbps:.2} kbps",
        accounting.sent_bytes(),
        accounting.skipped_bytes(),
        accounting.elapsed(now)
      ),
      None => tracing::info!("transfer finished, no timing available"),
    }

    self.set_phase(BusyPhase::Validating);
    self.send_control(UpdateFrame::validation_request(identifier));
  }

  fn process_rwcp(&mut self) {
    loop {
      let Some(rwcp) = self.rwcp.as_mut() else {
        return;
      };
      let transmits: Vec<Vec<u8>> = std::iter::from_fn(|| rwcp.poll_transmit()).collect();
      let events: Vec<RwcpEvent> = std::iter::from_fn(|| rwcp.poll_event()).collect();
      if transmits.is_empty() && events.is_empty() {
        return;
      }

      for segment in transmits {
        if let Err(err) = self.transport.send(Channel::Rwcp, &segment) {
          self.on_transport_failure(err);
          return;
        }
      }

      for event in events {
        match event {
          RwcpEvent::Delivered { progress_bytes } => {
            if let Some(session) = self.session.as_mut() {
              session.accounting_mut().record_sent(progress_bytes);
            }
            self.emit_progress();
          }
          RwcpEvent::Flushed => {
            if self.session.as_ref().is_some_and(|session| session.needs_validation) {
              self.start_validation();
            }
          }
          RwcpEvent::Reset => {
            if self.in_progress() && !self.aborting() {
              self.abort_with(AbortReason::RwcpReset);
            }
          }
        }
      }
    }
  }

  /// Drop everything queued for the device.
  fn stop_outbound(&mut self) {
    if let Some(session) = self.session.as_mut() {
      session.pending_packets.clear();
      session.sending = None;
    }
    if let Some(rwcp) = self.rwcp.as_mut() {
      rwcp.abort();
    }
    self.validation_retry_at = None;
  }

  fn resync(&mut self) {
    let Some(session) = self.session.as_mut() else {
      return;
    };
    session.reset_transfer_position();
    let identifier = session.identifier();
    self.set_phase(BusyPhase::Connecting);
    if self.link == LinkStage::Connected {
      self.send_control(UpdateFrame::sync_request(identifier));
    } else {
      self.begin_connect();
    }
  }

  // ---- pause and abort ----

  fn pause_with(&mut self, cause: PauseCause) {
    if !self.in_progress() || self.paused() || self.aborting() {
      tracing::debug!("nothing to pause");
      return;
    }
    let link_lost = matches!(cause, PauseCause::Link | PauseCause::TransportError);

    self.stop_outbound();
    if link_lost {
      if let Some(rwcp) = self.rwcp.as_mut() {
        while rwcp.poll_transmit().is_some() {}
      }
    } else {
      self.process_rwcp();
    }
    if let Some(session) = self.session.as_mut() {
      session.paused = true;
    }
    self.pause_cause = Some(cause);
    tracing::info!("pausing update ({cause:?})");
    self.set_phase(BusyPhase::Paused);

    if !link_lost {
      self.send_quietly(Channel::Command, self.envelope.upgrade_disconnect());
    }
    self.link = LinkStage::Disconnected;
  }

  fn abort_with(&mut self, reason: AbortReason) {
    if !self.in_progress() || self.aborting() {
      tracing::debug!("nothing to abort");
      return;
    }
    if reason == AbortReason::UserCancelled {
      tracing::info!("aborting update");
    } else {
      tracing::error!("aborting update: {reason}");
    }

    self.stop_outbound();
    if self.link == LinkStage::Connected {
      self.process_rwcp();
    }
    let paused = self.paused();
    if let Some(session) = self.session.as_mut() {
      session.aborted = true;
      session.paused = false;
    }
    if !self.resync_after_abort {
      let state = match reason {
        AbortReason::UserCancelled => StopReason::UserAbortPending,
        reason => StopReason::Aborted(reason),
      };
      self.set_state(UpdateState::Stopped(state));
    }

    match self.link {
      LinkStage::Connected => {
        let packet = self.envelope.upgrade_control(&UpdateFrame::empty(Opcode::AbortReq));
        if let Err(err) = self.transport.send(Channel::Command, &packet) {
          tracing::warn!("could not send abort: {err}");
          self.finish_abort();
        }
      }
      // the link setup in progress sends the abort once connected
      LinkStage::Registering | LinkStage::Connecting | LinkStage::SettingEndpoint => {}
      LinkStage::Disconnected if paused && self.pause_cause != Some(PauseCause::Link) => {
        self.pause_cause = None;
        self.begin_connect();
      }
      LinkStage::Disconnected => self.finish_abort(),
    }
  }

  fn finish_abort(&mut self) {
    let Some(session) = self.session.take() else {
      return;
    };
    if let Some(rwcp) = self.rwcp.as_mut() {
      rwcp.abort();
    }
    self.process_rwcp();
    self.pause_cause = None;
    self.pending_error = None;
    self.validation_retry_at = None;

    if self.resync_after_abort {
      self.resync_after_abort = false;
      let renewed = session.renew();
      let identifier = renewed.identifier();
      self.session = Some(renewed);
      tracing::info!("device abort confirmed, syncing again");
      self.set_phase(BusyPhase::Connecting);
      if self.link == LinkStage::Connected {
        self.send_control(UpdateFrame::sync_request(identifier));
      } else {
        self.begin_connect();
      }
      return;
    }

    if self.link == LinkStage::Connected {
      self.send_quietly(Channel::Command, self.envelope.upgrade_disconnect());
      self.link = LinkStage::Disconnected;
    }
    if self.state == UpdateState::Stopped(StopReason::UserAbortPending) {
      self.set_state(UpdateState::Stopped(StopReason::Aborted(AbortReason::UserCancelled)));
    }
  }

  fn release_session(&mut self) {
    if let Some(rwcp) = self.rwcp.as_mut() {
      rwcp.abort();
      while rwcp.poll_transmit().is_some() {}
    }
    self.session = None;
    self.pause_cause = None;
    self.pending_error = None;
    self.validation_retry_at = None;
  }

  fn on_transport_failure(&mut self, err: crate::Error) {
    tracing::warn!("transport failure: {err}");
    if !self.in_progress() {
      return;
    }
    if self.aborting() {
      self.finish_abort();
    } else if self.state == UpdateState::Busy(BusyPhase::Transferring) && self.rwcp.is_none() {
      self.pause_with(PauseCause::TransportError);
    } else {
      self.abort_with(AbortReason::TransportError);
    }
  }

  // ---- sending helpers ----

  fn expect_phase(&self, phase: BusyPhase) -> bool {
    if self.state != UpdateState::Busy(phase) {
      tracing::warn!("not waiting for {phase:?} (state is {})", self.state);
      return false;
    }
    true
  }

  fn acknowledge_pending_error(&mut self) {
    if let Some(code) = self.pending_error.take() {
      self.send_control(UpdateFrame::error_warn_response(code.0));
    }
  }

  fn send_control(&mut self, frame: UpdateFrame) {
    tracing::trace!("host: {:?} ({} bytes)", frame.opcode, frame.payload.len());
    let packet = self.envelope.upgrade_control(&frame);
    self.send_command(packet);
  }

  fn send_command(&mut self, packet: Vec<u8>) {
    if let Err(err) = self.transport.send(Channel::Command, &packet) {
      self.on_transport_failure(err);
    }
  }

  /// Best effort; failures are only logged.
  fn send_quietly(&mut self, channel: Channel, packet: Vec<u8>) {
    if let Err(err) = self.transport.send(channel, &packet) {
      tracing::debug!("ignoring send failure: {err}");
    }
  }
}
