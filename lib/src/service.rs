//! Runs an [UpdateEngine] on a tokio task so every input is handled on one execution context.

use std::{sync::Arc, time::Duration};

use tokio::{
  sync::{mpsc, watch},
  task::JoinHandle,
  time::MissedTickBehavior,
};

use crate::{
  config::UpdateSettings, Clock, ConnectionEvent, Error, Result, TransferOption, Transport, UpdateEngine,
  UpdateProgress, UpdateState,
};

/// Clock backed by the tokio runtime, so paused test time drives the engine too.
#[derive(Debug, Default, Clone, Copy)]
pub struct TokioClock;

impl Clock for TokioClock {
  fn now(&self) -> std::time::Instant {
    tokio::time::Instant::now().into_std()
  }
}

/// One input for the engine.
#[derive(Debug)]
pub enum Command {
  StartUpdate {
    file: Arc<[u8]>,
    settings: UpdateSettings,
    previous_transfer_completed: bool,
  },
  Pause,
  Unpause,
  Abort,
  CommitConfirm(bool),
  ConfirmForceUpgrade(bool),
  CommitTransferRequired(TransferOption),
  BatteryWarningConfirmed,
  EarbudsInCaseTimeoutResponse(bool),
  Inbound(Vec<u8>),
  RwcpSegment(Vec<u8>),
  SendComplete { sequence: u32, result: Result<()> },
  Connection(ConnectionEvent),
  Tick,
  Shutdown,
}

impl<T: Transport> UpdateEngine<T> {
  /// Dispatch a command to the matching engine operation.
  pub fn apply(&mut self, command: Command) {
    match command {
      Command::StartUpdate {
        file,
        settings,
        previous_transfer_completed,
      } => self.start_update(file, &settings, previous_transfer_completed),
      Command::Pause => self.pause(),
      Command::Unpause => self.unpause(),
      Command::Abort => self.abort(),
      Command::CommitConfirm(accept) => self.commit_confirm(accept),
      Command::ConfirmForceUpgrade(accept) => self.confirm_force_upgrade_response(accept),
      Command::CommitTransferRequired(option) => self.commit_transfer_required(option),
      Command::BatteryWarningConfirmed => self.battery_warning_confirmed(),
      Command::EarbudsInCaseTimeoutResponse(retry) => self.earbuds_in_case_timeout_response(retry),
      Command::Inbound(packet) => self.handle_inbound(&packet),
      Command::RwcpSegment(segment) => self.handle_rwcp_segment(&segment),
      Command::SendComplete { sequence, result } => self.handle_send_complete(sequence, result),
      Command::Connection(event) => self.handle_connection_event(event),
      Command::Tick => self.tick(),
      Command::Shutdown => {}
    }
  }
}

pub struct UpdateService;

impl UpdateService {
  /// Move `engine` onto a new task. Its clock is replaced by [TokioClock].
  ///
  /// The task ends on [UpdateHandle::shutdown] or when every handle is dropped, and yields the engine back.
  pub fn spawn<T>(engine: UpdateEngine<T>, tick_interval: Duration) -> (UpdateHandle, JoinHandle<UpdateEngine<T>>)
  where
    T: Transport + 'static,
  {
    let (commands, mut receiver) = mpsc::unbounded_channel();
    let (state_tx, state) = watch::channel(engine.state());
    let (progress_tx, progress) = watch::channel(engine.progress());
    let mut engine = engine.with_clock(Arc::new(TokioClock));

    let task = tokio::spawn(async move {
      let mut interval = tokio::time::interval(tick_interval);
      interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

      loop {
        tokio::select! {
          command = receiver.recv() => match command {
            Some(Command::Shutdown) | None => break,
            Some(command) => engine.apply(command),
          },
          _ = interval.tick() => engine.tick(),
        }

        let current = engine.state();
        state_tx.send_if_modified(|state| {
          let changed = *state != current;
          *state = current;
          changed
        });
        let current = engine.progress();
        progress_tx.send_if_modified(|progress| {
          let changed = *progress != current;
          *progress = current;
          changed
        });
      }

      tracing::debug!("update service stopped in {}", engine.state());
      engine
    });

    (
      UpdateHandle {
        commands,
        state,
        progress,
      },
      task,
    )
  }
}

/// Cheap to clone; every method only enqueues.
#[derive(Debug, Clone)]
pub struct UpdateHandle {
  commands: mpsc::UnboundedSender<Command>,
  state: watch::Receiver<UpdateState>,
  progress: watch::Receiver<UpdateProgress>,
}

impl UpdateHandle {
  pub fn send(&self, command: Command) -> Result<()> {
    self.commands.send(command).map_err(|_| Error::ServiceClosed)
  }

  pub fn start_update(
    &self,
    file: impl Into<Arc<[u8]>>,
    settings: UpdateSettings,
    previous_transfer_completed: bool,
  ) -> Result<()> {
    self.send(Command::StartUpdate {
      file: file.into(),
      settings,
      previous_transfer_completed,
    })
  }

  pub fn pause(&self) -> Result<()> {
    self.send(Command::Pause)
  }

  pub fn unpause(&self) -> Result<()> {
    self.send(Command::Unpause)
  }

  pub fn abort(&self) -> Result<()> {
    self.send(Command::Abort)
  }

  pub fn commit_confirm(&self, accept: bool) -> Result<()> {
    self.send(Command::CommitConfirm(accept))
  }

  pub fn confirm_force_upgrade_response(&self, accept: bool) -> Result<()> {
    self.send(Command::ConfirmForceUpgrade(accept))
  }

  pub fn commit_transfer_required(&self, option: TransferOption) -> Result<()> {
    self.send(Command::CommitTransferRequired(option))
  }

  pub fn battery_warning_confirmed(&self) -> Result<()> {
    self.send(Command::BatteryWarningConfirmed)
  }

  pub fn earbuds_in_case_timeout_response(&self, retry: bool) -> Result<()> {
    self.send(Command::EarbudsInCaseTimeoutResponse(retry))
  }

  pub fn inbound(&self, packet: Vec<u8>) -> Result<()> {
    self.send(Command::Inbound(packet))
  }

  pub fn rwcp_segment(&self, segment: Vec<u8>) -> Result<()> {
    self.send(Command::RwcpSegment(segment))
  }

  pub fn send_complete(&self, sequence: u32, result: Result<()>) -> Result<()> {
    self.send(Command::SendComplete { sequence, result })
  }

  pub fn connection_event(&self, event: ConnectionEvent) -> Result<()> {
    self.send(Command::Connection(event))
  }

  pub fn shutdown(&self) -> Result<()> {
    self.send(Command::Shutdown)
  }

  pub fn state(&self) -> UpdateState {
    *self.state.borrow()
  }

  pub fn progress(&self) -> UpdateProgress {
    *self.progress.borrow()
  }

  pub fn subscribe(&self) -> watch::Receiver<UpdateState> {
    self.state.clone()
  }

  pub fn subscribe_progress(&self) -> watch::Receiver<UpdateProgress> {
    self.progress.clone()
  }

  /// Wait until the published state satisfies `predicate`.
  pub async fn wait_for(&self, mut predicate: impl FnMut(&UpdateState) -> bool) -> Result<UpdateState> {
    let mut state = self.state.clone();
    let found = state.wait_for(|state| predicate(state)).await.map_err(|_| Error::ServiceClosed)?;
    Ok(*found)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::{
    envelope::ProtocolVersion,
    simulator::{DeviceProfile, SimulatedDevice},
    AbortReason, BusyPhase, Channel, ConnectionKind, StopReason, TransportCapabilities,
  };
  use std::sync::Mutex;

  #[derive(Clone, Default)]
  struct SharedTransport {
    sent: Arc<Mutex<Vec<(Channel, Vec<u8>)>>>,
  }

  impl Transport for SharedTransport {
    fn capabilities(&self) -> TransportCapabilities {
      TransportCapabilities {
        max_write_length: 244,
        max_write_without_response_length: 182,
        data_length_extension_supported: true,
        rwcp_supported: false,
        kind: ConnectionKind::Ble,
      }
    }

    fn send(&mut self, channel: Channel, bytes: &[u8]) -> Result<()> {
      self.sent.lock().unwrap().push((channel, bytes.to_vec()));
      Ok(())
    }
  }

  #[tokio::test(start_paused = true)]
  async fn test_abort_before_link_is_up() {
    let transport = SharedTransport::default();
    let engine = UpdateEngine::new(transport.clone(), ProtocolVersion::V3);
    let (handle, task) = UpdateService::spawn(engine, Duration::from_millis(50));

    handle.start_update(vec![0u8; 64], UpdateSettings::default(), false).unwrap();
    handle
      .wait_for(|state| *state == UpdateState::Busy(BusyPhase::Connecting))
      .await
      .unwrap();
    assert_eq!(transport.sent.lock().unwrap().len(), 1);

    handle.abort().unwrap();
    handle
      .wait_for(|state| *state == UpdateState::Stopped(StopReason::UserAbortPending))
      .await
      .unwrap();

    handle.connection_event(ConnectionEvent::Disconnected).unwrap();
    let state = handle.wait_for(UpdateState::is_terminal).await.unwrap();
    assert_eq!(state, UpdateState::Stopped(StopReason::Aborted(AbortReason::UserCancelled)));

    handle.shutdown().unwrap();
    let engine = task.await.unwrap();
    assert!(engine.session().is_none());
    assert!(handle.abort().is_err());
  }

  #[tokio::test(start_paused = true)]
  async fn test_validation_is_polled_on_tick() {
    let device = Arc::new(Mutex::new(SimulatedDevice::new(DeviceProfile {
      resume_point: crate::codec::ResumePoint::Validate,
      validation_polls: 2,
      ..Default::default()
    })));
    let transport = SharedTransport::default();
    let engine = UpdateEngine::new(transport.clone(), ProtocolVersion::V3);
    let (handle, task) = UpdateService::spawn(engine, Duration::from_millis(20));

    handle.start_update(vec![1u8; 32], UpdateSettings::default(), true).unwrap();

    // relay host packets to the device until it asks which way to commit
    let relay = {
      let handle = handle.clone();
      let device = device.clone();
      let sent = transport.sent.clone();
      tokio::spawn(async move {
        loop {
          let outgoing: Vec<_> = sent.lock().unwrap().drain(..).collect();
          for (channel, packet) in outgoing {
            let replies = device.lock().unwrap().receive(channel, &packet);
            for reply in replies {
              if handle.send(reply.into_command()).is_err() {
                return;
              }
            }
          }
          tokio::time::sleep(Duration::from_millis(5)).await;
        }
      })
    };

    let state = handle
      .wait_for(|state| *state == UpdateState::Busy(BusyPhase::AwaitingConfirmTransferRequired))
      .await
      .unwrap();
    assert!(state.awaiting_confirmation());
    assert_eq!(device.lock().unwrap().validation_requests(), 3);

    handle.shutdown().unwrap();
    task.await.unwrap();
    relay.abort();
  }
}
