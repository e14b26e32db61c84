use md5::{Digest, Md5};
use std::{collections::VecDeque, sync::Arc};

use crate::{
  codec::{DataBytesRequest, ResumePoint, FILE_IDENTIFIER_LENGTH},
  progress::TransferAccounting,
  state::AbortReason,
};

/// A framed packet waiting for the transport to finish the previous one.
#[derive(Debug, Clone)]
pub(crate) struct PendingPacket {
  pub bytes: Vec<u8>,
  /// file bytes carried, credited once the send completes
  pub progress_bytes: usize,
  pub last_in_file: bool,
}

/// DATA packet handed to the transport, credited once written and acknowledged.
#[derive(Debug, Clone)]
pub(crate) struct InFlightPacket {
  /// echoed back by the transport's completion report
  pub sequence: u32,
  pub packet: PendingPacket,
  pub written: bool,
  /// set up front unless the device acknowledges each DATA packet
  pub acknowledged: bool,
}

impl InFlightPacket {
  pub fn done(&self) -> bool {
    self.written && self.acknowledged
  }
}

/// Slice of the file answering a data request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct OutgoingChunk {
  pub bytes: Vec<u8>,
  /// false on the final chunk of the request
  pub more_coming: bool,
  pub last_in_file: bool,
}

/// State of one transfer attempt. Survives pauses and reconnects.
#[derive(Debug, Clone)]
pub struct UpdateSession {
  file: Arc<[u8]>,
  checksum: [u8; 16],
  accounting: TransferAccounting,
  start_offset: usize,
  resume_point: Option<ResumePoint>,
  max_payload: usize,

  pub(crate) pending_packets: VecDeque<PendingPacket>,
  /// packet handed to the transport whose completion has not been reported yet
  pub(crate) sending: Option<InFlightPacket>,

  pub(crate) in_progress: bool,
  pub(crate) paused: bool,
  pub(crate) aborted: bool,
  pub(crate) needs_validation: bool,
  pub(crate) transfer_complete_acknowledged: bool,
  pub(crate) silent_commit_confirmed: bool,

  /// a sync may resume from Start
  start_permitted: bool,
  /// a sync may resume from Validate or later
  later_permitted: bool,
}

impl UpdateSession {
  pub fn new(file: Arc<[u8]>, previous_transfer_completed: bool, max_payload: usize) -> Self {
    let mut checksum = [0; 16];
    checksum.copy_from_slice(&Md5::digest(&file));
    Self::with_checksum(file, checksum, previous_transfer_completed, max_payload)
  }

  fn with_checksum(file: Arc<[u8]>, checksum: [u8; 16], previous_transfer_completed: bool, max_payload: usize) -> Self {
    Self {
      accounting: TransferAccounting::new(file.len()),
      file,
      checksum,
      start_offset: 0,
      resume_point: None,
      max_payload,
      pending_packets: VecDeque::new(),
      sending: None,
      in_progress: true,
      paused: false,
      aborted: false,
      needs_validation: false,
      transfer_complete_acknowledged: false,
      silent_commit_confirmed: false,
      start_permitted: !previous_transfer_completed,
      later_permitted: previous_transfer_completed,
    }
  }

  /// Fresh session over the same file, used to resync from scratch after a forced abort.
  pub(crate) fn renew(&self) -> Self {
    Self::with_checksum(self.file.clone(), self.checksum, false, self.max_payload)
  }

  pub fn file(&self) -> &Arc<[u8]> {
    &self.file
  }

  pub fn checksum(&self) -> &[u8; 16] {
    &self.checksum
  }

  /// Last four bytes of the MD5 digest; sent in `SYNC_REQ` and `IS_VALIDATION_DONE_REQ`.
  pub fn identifier(&self) -> [u8; FILE_IDENTIFIER_LENGTH] {
    let mut identifier = [0; FILE_IDENTIFIER_LENGTH];
    identifier.copy_from_slice(&self.checksum[self.checksum.len() - FILE_IDENTIFIER_LENGTH..]);
    identifier
  }

  pub fn accounting(&self) -> &TransferAccounting {
    &self.accounting
  }

  pub(crate) fn accounting_mut(&mut self) -> &mut TransferAccounting {
    &mut self.accounting
  }

  pub fn start_offset(&self) -> usize {
    self.start_offset
  }

  pub fn resume_point(&self) -> Option<ResumePoint> {
    self.resume_point
  }

  pub fn max_payload(&self) -> usize {
    self.max_payload
  }

  pub fn is_in_progress(&self) -> bool {
    self.in_progress
  }

  pub fn is_paused(&self) -> bool {
    self.paused
  }

  pub fn is_aborted(&self) -> bool {
    self.aborted
  }

  pub fn needs_validation(&self) -> bool {
    self.needs_validation
  }

  /// Record the device's resume point. Fails when the point contradicts what this session has done.
  pub(crate) fn accept_resume_point(&mut self, resume_point: ResumePoint) -> Result<(), AbortReason> {
    let permitted = match resume_point {
      ResumePoint::Start => self.start_permitted,
      _ => self.later_permitted,
    };
    if !permitted {
      return Err(AbortReason::UnexpectedStart);
    }
    self.resume_point = Some(resume_point);
    Ok(())
  }

  /// The whole file has been handed to the transport.
  pub(crate) fn mark_file_sent(&mut self) {
    self.needs_validation = true;
    self.later_permitted = true;
  }

  /// Device was told to go ahead with the transferred image; a restart from scratch is no longer valid.
  pub(crate) fn mark_transfer_acknowledged(&mut self) {
    self.transfer_complete_acknowledged = true;
    self.start_permitted = false;
    self.later_permitted = true;
  }

  /// Zero the position counters. The device's next sync says where to continue.
  pub(crate) fn reset_transfer_position(&mut self) {
    self.accounting.reset();
    self.start_offset = 0;
    self.pending_packets.clear();
    self.sending = None;
    self.needs_validation = false;
  }

  /// Apply a data request: skip what the device already has, then cut the requested range into
  /// packets of at most `max_payload` bytes.
  pub(crate) fn take_chunks(&mut self, request: DataBytesRequest) -> Result<Vec<OutgoingChunk>, AbortReason> {
    let file_length = self.file.len();

    let skip = (request.offset as usize).min(file_length - self.start_offset);
    if skip > 0 {
      self.accounting.record_skipped(skip);
      self.start_offset += skip;
      tracing::debug!("skipping {skip} bytes, now at offset {}", self.start_offset);
    }

    let remaining = file_length - self.start_offset;
    if request.length == 0 {
      return Ok(vec![]);
    }
    if remaining == 0 {
      return Err(AbortReason::DataRequestOutOfBounds);
    }

    let length = (request.length as usize).min(remaining);
    let end = self.start_offset + length;
    let chunks = self.file[self.start_offset..end]
      .chunks(self.max_payload)
      .scan(self.start_offset, |position, chunk| {
        *position += chunk.len();
        Some(OutgoingChunk {
          bytes: chunk.to_vec(),
          more_coming: *position < end,
          last_in_file: *position == file_length,
        })
      })
      .collect();
    self.start_offset = end;

    Ok(chunks)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn session(length: usize, max_payload: usize) -> UpdateSession {
    let file: Vec<u8> = (0..length).map(|i| i as u8).collect();
    UpdateSession::new(Arc::from(file), false, max_payload)
  }

  #[test]
  fn test_identifier_is_digest_tail() {
    let session = UpdateSession::new(Arc::from(&b"abc"[..]), false, 20);
    // md5("abc") = 900150983cd24fb0d6963f7d28e17f72
    assert_eq!(session.identifier(), [0x28, 0xe1, 0x7f, 0x72]);
  }

  #[test]
  fn test_chunks_flag_only_last() {
    let mut session = session(1000, 20);
    let chunks = session.take_chunks(DataBytesRequest { length: 1000, offset: 0 }).unwrap();
    assert_eq!(chunks.len(), 50);
    assert!(chunks[..49].iter().all(|c| c.more_coming && !c.last_in_file && c.bytes.len() == 20));
    assert!(!chunks[49].more_coming);
    assert!(chunks[49].last_in_file);
    assert_eq!(session.start_offset(), 1000);
  }

  #[test]
  fn test_offset_is_skipped() {
    let mut session = session(100, 16);
    let chunks = session.take_chunks(DataBytesRequest { length: 10, offset: 40 }).unwrap();
    assert_eq!(session.accounting().skipped_bytes(), 40);
    assert_eq!(session.accounting().progress_bytes(), 40);
    assert_eq!(session.start_offset(), 50);
    assert_eq!(chunks.len(), 1);
    assert_eq!(chunks[0].bytes[0], 40);
    assert!(!chunks[0].more_coming);
  }

  #[test]
  fn test_length_is_clamped_and_overrun_rejected() {
    let mut session = session(30, 16);
    let chunks = session.take_chunks(DataBytesRequest { length: 500, offset: 0 }).unwrap();
    assert_eq!(chunks.iter().map(|c| c.bytes.len()).sum::<usize>(), 30);
    assert!(chunks.last().unwrap().last_in_file);
    assert_eq!(
      session.take_chunks(DataBytesRequest { length: 1, offset: 0 }),
      Err(AbortReason::DataRequestOutOfBounds)
    );
  }

  #[test]
  fn test_resume_point_guard() {
    let mut fresh = session(10, 4);
    assert_eq!(fresh.accept_resume_point(ResumePoint::Reboot), Err(AbortReason::UnexpectedStart));
    assert!(fresh.accept_resume_point(ResumePoint::Start).is_ok());

    let mut resumed = UpdateSession::new(Arc::from(&[1u8, 2, 3][..]), true, 4);
    assert_eq!(resumed.accept_resume_point(ResumePoint::Start), Err(AbortReason::UnexpectedStart));
    assert!(resumed.accept_resume_point(ResumePoint::PostReboot).is_ok());

    fresh.mark_file_sent();
    assert!(fresh.accept_resume_point(ResumePoint::Validate).is_ok());
    fresh.mark_transfer_acknowledged();
    assert_eq!(fresh.accept_resume_point(ResumePoint::Start), Err(AbortReason::UnexpectedStart));
  }

  #[test]
  fn test_renew_keeps_file() {
    let mut original = session(64, 8);
    original.take_chunks(DataBytesRequest { length: 64, offset: 0 }).unwrap();
    original.mark_file_sent();
    let renewed = original.renew();
    assert_eq!(renewed.file(), original.file());
    assert_eq!(renewed.identifier(), original.identifier());
    assert_eq!(renewed.start_offset(), 0);
    assert_eq!(renewed.accounting().transfer_size(), 64);
    assert!(!renewed.needs_validation());
  }
}
