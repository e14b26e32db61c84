//! Property tests for packet sizing, progress accounting and whole transfers.

use std::time::{Duration, Instant};

use gaiadfu::{
  config::UpdateSettings,
  simulator::{AutoResponder, DeviceProfile, SimTransport, SimulatedDevice, SimulationHarness},
  ConnectionKind, PacketSizing, StopReason, TransferAccounting, TransportCapabilities, TransportNegotiation,
  UpdateState,
};
use proptest::prelude::*;

fn arb_kind() -> impl Strategy<Value = ConnectionKind> {
  prop_oneof![Just(ConnectionKind::Ble), Just(ConnectionKind::Iap2)]
}

fn arb_capabilities() -> impl Strategy<Value = TransportCapabilities> {
  (0usize..1024, 0usize..1024, any::<bool>(), any::<bool>(), arb_kind()).prop_map(
    |(max_write_length, max_write_without_response_length, data_length_extension_supported, rwcp_supported, kind)| {
      TransportCapabilities {
        max_write_length,
        max_write_without_response_length,
        data_length_extension_supported,
        rwcp_supported,
        kind,
      }
    },
  )
}

fn arb_settings() -> impl Strategy<Value = UpdateSettings> {
  (13usize..=0xFFFF, any::<bool>(), any::<bool>(), any::<bool>()).prop_map(
    |(requested_message_size, use_data_length_extension, use_rwcp, expect_acks)| UpdateSettings {
      requested_message_size,
      use_data_length_extension,
      use_rwcp,
      expect_acks,
      ..Default::default()
    },
  )
}

#[derive(Debug, Clone, Copy)]
enum Step {
  Skip(usize),
  Sent(usize),
}

fn arb_step() -> impl Strategy<Value = Step> {
  prop_oneof![(0usize..500).prop_map(Step::Skip), (0usize..500).prop_map(Step::Sent)]
}

proptest! {
  #[test]
  fn packet_fits_negotiated_mtu(settings in arb_settings(), capabilities in arb_capabilities()) {
    let negotiation = TransportNegotiation::negotiate(&settings, &capabilities);
    if let Ok(sizing) = PacketSizing::compute(&settings, &capabilities, &negotiation) {
      prop_assert!(sizing.max_payload > 0);
      prop_assert_eq!(sizing.max_payload % 2, 0);
      prop_assert!(sizing.max_payload + sizing.framing_overhead <= sizing.negotiated_mtu);
      prop_assert!(sizing.negotiated_mtu <= settings.requested_message_size);
    }
  }

  #[test]
  fn windowed_only_over_ble_with_rwcp(settings in arb_settings(), capabilities in arb_capabilities()) {
    let negotiation = TransportNegotiation::negotiate(&settings, &capabilities);
    prop_assert_eq!(
      negotiation.is_windowed(),
      capabilities.kind == ConnectionKind::Ble && settings.use_rwcp && capabilities.rwcp_supported
    );
  }

  #[test]
  fn accounting_stays_ordered(size in 0usize..5_000, steps in prop::collection::vec(arb_step(), 0..64)) {
    let start = Instant::now();
    let mut accounting = TransferAccounting::new(size);
    accounting.start_timing(start);

    let mut last_percent = 0.0;
    for (i, step) in steps.into_iter().enumerate() {
      match step {
        Step::Skip(bytes) => {
          let counted = accounting.record_skipped(bytes);
          prop_assert!(counted <= bytes);
        }
        Step::Sent(bytes) => accounting.record_sent(bytes),
      }

      prop_assert!(accounting.skipped_bytes() <= accounting.progress_bytes());
      prop_assert!(accounting.progress_bytes() <= accounting.transfer_size());
      let percent = accounting.percent();
      prop_assert!((0.0..=100.0).contains(&percent));
      prop_assert!(percent >= last_percent);
      last_percent = percent;

      let now = start + Duration::from_millis(10 * (i as u64 + 1));
      let snapshot = accounting.snapshot(now);
      prop_assert_eq!(snapshot.progress_bytes, accounting.progress_bytes());
      if accounting.sent_bytes() == 0 {
        prop_assert_eq!(snapshot.time_remaining, Duration::ZERO);
      }
    }
  }
}

proptest! {
  #![proptest_config(ProptestConfig::with_cases(24))]

  #[test]
  fn device_receives_exact_image(
    length in 1usize..3_000,
    chunk_request in 1u32..700,
    resume_fraction in 0.0f64..1.0,
    max_write_length in 20usize..200,
  ) {
    let file: Vec<u8> = (0..length).map(|i| (i * 31 % 256) as u8).collect();
    let resume_offset = (length as f64 * resume_fraction) as usize;
    let device = SimulatedDevice::new(DeviceProfile {
      chunk_request,
      resume_offset,
      ..Default::default()
    })
    .with_image(&file);
    let transport = SimTransport::ble(max_write_length, false);
    let mut harness = SimulationHarness::new(device, transport, AutoResponder::default());

    let state = harness.run(&file, &UpdateSettings::default(), false, 1_000_000);
    match state {
      UpdateState::Stopped(StopReason::Completed(status)) => {
        prop_assert_eq!(status.bytes_skipped, resume_offset);
        prop_assert_eq!(status.bytes_sent + status.bytes_skipped, length);
      }
      other => prop_assert!(false, "update did not complete: {}", other),
    }
    prop_assert_eq!(harness.device().image(), file.as_slice());
  }
}
