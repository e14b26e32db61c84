//! Reliable Write Command Protocol: a sliding-window layer over BLE write-without-response.
//!
//! The client is sans-IO. Callers feed it segments and timeouts with the current time and drain
//! outgoing segments with [RwcpClient::poll_transmit] and upward events with
//! [RwcpClient::poll_event].

use std::{
  collections::VecDeque,
  time::{Duration, Instant},
};

use crate::{config::UpdateSettings, Error, Result, RWCP_MAX_WINDOW};

pub const SEQUENCE_MASK: u8 = 0x3F;
const OPCODE_SHIFT: u8 = 6;

// client to server
pub const CLIENT_DATA: u8 = 0;
pub const CLIENT_SYN: u8 = 1;
pub const CLIENT_RST: u8 = 2;

// server to client
pub const SERVER_DATA_ACK: u8 = 0;
pub const SERVER_SYN_ACK: u8 = 1;
pub const SERVER_RST: u8 = 2;
pub const SERVER_GAP: u8 = 3;

pub fn header(opcode: u8, sequence: u8) -> u8 {
  (opcode << OPCODE_SHIFT) | (sequence & SEQUENCE_MASK)
}

/// `(opcode, sequence)`
pub fn split_header(header: u8) -> (u8, u8) {
  (header >> OPCODE_SHIFT, header & SEQUENCE_MASK)
}

fn next_sequence(sequence: u8) -> u8 {
  (sequence + 1) & SEQUENCE_MASK
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RwcpConfig {
  pub initial_window: u8,
  pub max_window: u8,
  pub initial_timeout: Duration,
  pub max_timeout: Duration,
}

impl RwcpConfig {
  pub fn from_settings(settings: &UpdateSettings) -> Self {
    let timeouts = settings.timeouts();
    let max_window = settings.max_window.clamp(1, RWCP_MAX_WINDOW);
    Self {
      initial_window: settings.initial_window.clamp(1, max_window),
      max_window,
      initial_timeout: timeouts.initial(),
      max_timeout: timeouts.max(),
    }
  }
}

impl Default for RwcpConfig {
  fn default() -> Self {
    Self::from_settings(&UpdateSettings::default())
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RwcpState {
  Listen,
  SynSent,
  Established,
  /// RST sent after the last segment, waiting for the server's RST
  Closing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RwcpEvent {
  /// a segment was acknowledged
  Delivered { progress_bytes: usize },
  /// nothing queued and nothing in flight
  Flushed,
  /// the server reset the session
  Reset,
}

#[derive(Debug)]
struct Segment {
  sequence: u8,
  payload: Vec<u8>,
  progress_bytes: usize,
  needs_send: bool,
}

impl Segment {
  fn encode(&self) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(1 + self.payload.len());
    bytes.push(header(CLIENT_DATA, self.sequence));
    bytes.extend_from_slice(&self.payload);
    bytes
  }
}

#[derive(Debug)]
pub struct RwcpClient {
  config: RwcpConfig,
  state: RwcpState,
  window: u8,
  /// acknowledgements counted towards the next window increase
  credit: usize,
  next_sequence: u8,
  timeout: Duration,
  timer: Option<Instant>,
  in_flight: VecDeque<Segment>,
  queue: VecDeque<(Vec<u8>, usize)>,
  transmits: VecDeque<Vec<u8>>,
  events: VecDeque<RwcpEvent>,
  power_off_requested: bool,
}

impl RwcpClient {
  pub fn new(config: RwcpConfig) -> Self {
    Self {
      window: config.initial_window,
      timeout: config.initial_timeout,
      config,
      state: RwcpState::Listen,
      credit: 0,
      next_sequence: 0,
      timer: None,
      in_flight: VecDeque::new(),
      queue: VecDeque::new(),
      transmits: VecDeque::new(),
      events: VecDeque::new(),
      power_off_requested: false,
    }
  }

  pub fn state(&self) -> RwcpState {
    self.state
  }

  pub fn window(&self) -> u8 {
    self.window
  }

  pub fn in_flight(&self) -> usize {
    self.in_flight.len()
  }

  pub fn is_idle(&self) -> bool {
    self.in_flight.is_empty() && self.queue.is_empty()
  }

  /// Queue a payload. `progress_bytes` is reported back in [RwcpEvent::Delivered] once acknowledged.
  pub fn enqueue(&mut self, now: Instant, payload: Vec<u8>, progress_bytes: usize) {
    self.queue.push_back((payload, progress_bytes));
    self.power_off_requested = false;
    match self.state {
      RwcpState::Listen | RwcpState::Closing => self.open(now),
      RwcpState::SynSent => {}
      RwcpState::Established => self.pump(now),
    }
  }

  /// Close the session once everything queued has been acknowledged.
  pub fn power_off(&mut self, now: Instant) {
    self.power_off_requested = true;
    if self.state == RwcpState::Established && self.is_idle() {
      self.close(now);
    }
  }

  /// Drop everything in flight and reset the session.
  pub fn abort(&mut self) {
    if self.state != RwcpState::Listen {
      self.transmits.push_back(vec![header(CLIENT_RST, 0)]);
    }
    tracing::debug!("rwcp abort with {} segments in flight", self.in_flight.len());
    self.in_flight.clear();
    self.queue.clear();
    self.events.clear();
    self.timer = None;
    self.window = self.config.initial_window;
    self.timeout = self.config.initial_timeout;
    self.credit = 0;
    self.power_off_requested = false;
    self.state = RwcpState::Listen;
  }

  pub fn poll_transmit(&mut self) -> Option<Vec<u8>> {
    self.transmits.pop_front()
  }

  pub fn poll_event(&mut self) -> Option<RwcpEvent> {
    self.events.pop_front()
  }

  pub fn poll_timeout(&self) -> Option<Instant> {
    self.timer
  }

  #[cfg_attr(feature = "instrument", tracing::instrument(level = "trace", skip_all))]
  pub fn handle_segment(&mut self, now: Instant, bytes: &[u8]) -> Result<()> {
    let (opcode, sequence) = split_header(*bytes.first().ok_or(Error::TruncatedEnvelope(0))?);
    tracing::trace!("rwcp segment opcode {opcode} sequence {sequence} in {:?}", self.state);

    match (opcode, self.state) {
      (SERVER_SYN_ACK, RwcpState::SynSent) => {
        self.state = RwcpState::Established;
        self.timer = None;
        self.timeout = self.config.initial_timeout;
        self.pump(now);
        self.check_flushed(now);
      }
      (SERVER_DATA_ACK, RwcpState::Established) => self.acknowledge(now, sequence),
      (SERVER_GAP, RwcpState::Established) => {
        self.acknowledge(now, sequence);
        if !self.in_flight.is_empty() {
          tracing::debug!("rwcp gap after sequence {sequence}");
          self.congestion_event(now);
        }
      }
      (SERVER_RST, RwcpState::Closing) => {
        self.timer = None;
        self.state = RwcpState::Listen;
      }
      (SERVER_RST, RwcpState::SynSent | RwcpState::Established) => {
        tracing::warn!("rwcp reset by server");
        self.abort();
        self.transmits.clear();
        self.events.push_back(RwcpEvent::Reset);
      }
      (_, state) => tracing::trace!("ignoring rwcp opcode {opcode} in {state:?}"),
    }

    Ok(())
  }

  pub fn handle_timeout(&mut self, now: Instant) {
    if !self.timer.is_some_and(|deadline| now >= deadline) {
      return;
    }
    self.timer = None;

    match self.state {
      RwcpState::SynSent => {
        self.timeout = (self.timeout * 2).min(self.config.max_timeout);
        self.send_syn(now);
      }
      RwcpState::Established if !self.in_flight.is_empty() => {
        self.timeout = (self.timeout * 2).min(self.config.max_timeout);
        tracing::debug!("rwcp timeout, {} in flight, next timeout {:?}", self.in_flight.len(), self.timeout);
        self.congestion_event(now);
      }
      RwcpState::Closing => {
        tracing::debug!("no rwcp reset from server, closing anyway");
        self.state = RwcpState::Listen;
      }
      _ => {}
    }
  }

  fn open(&mut self, now: Instant) {
    self.state = RwcpState::SynSent;
    self.next_sequence = 0;
    self.window = self.config.initial_window;
    self.timeout = self.config.initial_timeout;
    self.credit = 0;
    self.send_syn(now);
  }

  fn send_syn(&mut self, now: Instant) {
    self.transmits.push_back(vec![header(CLIENT_SYN, 0)]);
    self.timer = Some(now + self.timeout);
  }

  fn close(&mut self, now: Instant) {
    tracing::debug!("rwcp power off");
    self.power_off_requested = false;
    self.transmits.push_back(vec![header(CLIENT_RST, 0)]);
    self.state = RwcpState::Closing;
    self.timer = Some(now + self.config.max_timeout);
  }

  /// Cumulative acknowledgement up to and including `sequence`.
  fn acknowledge(&mut self, now: Instant, sequence: u8) {
    let Some(index) = self.in_flight.iter().position(|segment| segment.sequence == sequence) else {
      tracing::trace!("stale rwcp acknowledgement {sequence}");
      return;
    };

    for segment in self.in_flight.drain(..=index) {
      self.events.push_back(RwcpEvent::Delivered {
        progress_bytes: segment.progress_bytes,
      });
    }

    self.credit += index + 1;
    while self.window < self.config.max_window && self.credit >= self.window as usize {
      self.credit -= self.window as usize;
      self.window += 1;
    }
    if self.window == self.config.max_window {
      self.credit = 0;
    }

    self.timeout = self.config.initial_timeout;
    self.timer = None;
    self.pump(now);
    self.check_flushed(now);
  }

  /// Loss detected: halve the window and resend everything in flight.
  fn congestion_event(&mut self, now: Instant) {
    self.window = ((self.window.saturating_sub(1)) / 2 + 1).max(1);
    self.credit = 0;
    for segment in self.in_flight.iter_mut() {
      segment.needs_send = true;
    }
    self.timer = None;
    self.pump(now);
  }

  fn pump(&mut self, now: Instant) {
    let window = self.window as usize;
    let mut sent = false;

    for segment in self.in_flight.iter_mut().take(window) {
      if segment.needs_send {
        segment.needs_send = false;
        self.transmits.push_back(segment.encode());
        sent = true;
      }
    }

    while self.in_flight.len() < window {
      let Some((payload, progress_bytes)) = self.queue.pop_front() else {
        break;
      };
      let segment = Segment {
        sequence: self.next_sequence,
        payload,
        progress_bytes,
        needs_send: false,
      };
      self.next_sequence = next_sequence(self.next_sequence);
      self.transmits.push_back(segment.encode());
      self.in_flight.push_back(segment);
      sent = true;
    }

    if (sent || !self.in_flight.is_empty()) && self.timer.is_none() {
      self.timer = Some(now + self.timeout);
    }
  }

  fn check_flushed(&mut self, now: Instant) {
    if self.state != RwcpState::Established || !self.is_idle() {
      return;
    }
    self.timer = None;
    self.events.push_back(RwcpEvent::Flushed);
    if self.power_off_requested {
      self.close(now);
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn config(initial_window: u8, max_window: u8) -> RwcpConfig {
    RwcpConfig {
      initial_window,
      max_window,
      initial_timeout: Duration::from_millis(100),
      max_timeout: Duration::from_millis(2000),
    }
  }

  fn drain(client: &mut RwcpClient) -> Vec<Vec<u8>> {
    std::iter::from_fn(|| client.poll_transmit()).collect()
  }

  fn established(config: RwcpConfig, now: Instant, segments: usize) -> RwcpClient {
    let mut client = RwcpClient::new(config);
    for i in 0..segments {
      client.enqueue(now, vec![i as u8], 1);
    }
    assert_eq!(drain(&mut client), vec![vec![0x40]]);
    client.handle_segment(now, &[header(SERVER_SYN_ACK, 0)]).unwrap();
    client
  }

  #[test]
  fn test_handshake_then_window_of_data() {
    let now = Instant::now();
    let mut client = established(config(4, 8), now, 6);
    let sent = drain(&mut client);
    assert_eq!(sent.len(), 4);
    assert_eq!(sent[0], vec![0x00, 0]);
    assert_eq!(sent[3], vec![0x03, 3]);
    assert_eq!(client.in_flight(), 4);
  }

  #[test]
  fn test_cumulative_ack_delivers_and_grows() {
    let now = Instant::now();
    let mut client = established(config(2, 4), now, 8);
    drain(&mut client);

    client.handle_segment(now, &[header(SERVER_DATA_ACK, 1)]).unwrap();
    let events: Vec<_> = std::iter::from_fn(|| client.poll_event()).collect();
    assert_eq!(events, vec![RwcpEvent::Delivered { progress_bytes: 1 }; 2]);
    assert_eq!(client.window(), 3);
    assert_eq!(drain(&mut client).len(), 3);
  }

  #[test]
  fn test_gap_halves_window_and_resends() {
    let now = Instant::now();
    let mut client = established(config(8, 8), now, 8);
    drain(&mut client);

    // server has 0..=2, lost 3
    client.handle_segment(now, &[header(SERVER_GAP, 2)]).unwrap();
    assert_eq!(client.window(), 4);
    let resent = drain(&mut client);
    assert_eq!(resent.len(), 4);
    assert_eq!(resent[0][0], header(CLIENT_DATA, 3));
    assert_eq!(client.in_flight(), 5);
  }

  #[test]
  fn test_timeout_backs_off() {
    let now = Instant::now();
    let mut client = established(config(4, 8), now, 2);
    drain(&mut client);
    let deadline = client.poll_timeout().unwrap();
    assert_eq!(deadline, now + Duration::from_millis(100));

    client.handle_timeout(deadline);
    assert_eq!(drain(&mut client).len(), 2);
    assert_eq!(client.window(), 2);
    assert_eq!(client.poll_timeout(), Some(deadline + Duration::from_millis(200)));
  }

  #[test]
  fn test_flush_then_power_off() {
    let now = Instant::now();
    let mut client = established(config(4, 8), now, 2);
    drain(&mut client);
    client.power_off(now);
    client.handle_segment(now, &[header(SERVER_DATA_ACK, 1)]).unwrap();

    let events: Vec<_> = std::iter::from_fn(|| client.poll_event()).collect();
    assert_eq!(events.last(), Some(&RwcpEvent::Flushed));
    assert_eq!(drain(&mut client), vec![vec![header(CLIENT_RST, 0)]]);
    assert_eq!(client.state(), RwcpState::Closing);

    client.handle_segment(now, &[header(SERVER_RST, 0)]).unwrap();
    assert_eq!(client.state(), RwcpState::Listen);
  }

  #[test]
  fn test_server_reset_reports() {
    let now = Instant::now();
    let mut client = established(config(4, 8), now, 2);
    client.handle_segment(now, &[header(SERVER_RST, 0)]).unwrap();
    assert_eq!(client.poll_event(), Some(RwcpEvent::Reset));
    assert_eq!(client.state(), RwcpState::Listen);
    assert!(client.is_idle());
  }

  #[test]
  fn test_sequence_wraps() {
    let now = Instant::now();
    let mut client = established(config(1, 1), now, 70);
    for expected in 0..70u32 {
      let sent = drain(&mut client);
      assert_eq!(sent.len(), 1);
      let (_, sequence) = split_header(sent[0][0]);
      assert_eq!(sequence as u32, expected % 64);
      client.handle_segment(now, &[header(SERVER_DATA_ACK, sequence)]).unwrap();
    }
    assert!(client.is_idle());
  }
}
