mod monitoring;

use clap::{Args as ClapArgs, Parser, Subcommand};
use gaiadfu::{
  codec::ResumePoint,
  config::UpdateSettings,
  envelope::ProtocolVersion,
  simulator::{AutoResponder, DeviceProfile, SimTransport, SimulatedDevice, SimulationHarness},
  ConnectionKind, Event, PacketSizing, StopReason, TransferOption, TransportCapabilities, TransportNegotiation,
  UpdateState,
};
use std::{
  path::PathBuf,
  sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
  },
};

#[derive(Parser, Debug)]
#[command(version = "0.1.0", about = "GAIA firmware update tooling", long_about = None)]
struct Args {
  /// Log level used when RUST_LOG is not set.
  #[arg(long, global = true, default_value = "info")]
  log_level: String,
  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Show the transport mode and packet size chosen for a link.
  Plan(LinkArgs),
  /// Push a firmware image to a simulated device.
  Simulate {
    /// Firmware image to transfer.
    file: PathBuf,
    #[command(flatten)]
    link: LinkArgs,
    /// GAIA protocol version spoken by the device (2 or 3).
    #[arg(long, default_value_t = 3)]
    protocol: u8,
    /// Bytes the device already holds.
    #[arg(long, default_value_t = 0)]
    resume_offset: usize,
    /// Drop every nth RWCP data segment.
    #[arg(long)]
    drop_every: Option<usize>,
    /// Pause once this many bytes are confirmed, then resume.
    #[arg(long)]
    pause_at: Option<usize>,
    /// Ask the device to apply the image on its next reboot.
    #[arg(long, action)]
    silent: bool,
  },
}

#[derive(ClapArgs, Debug)]
struct LinkArgs {
  /// JSON settings file; flags below override it.
  #[arg(long)]
  settings: Option<PathBuf>,
  /// Use iAP2 instead of BLE.
  #[arg(long, action)]
  iap2: bool,
  #[arg(long, default_value_t = 244)]
  max_write: usize,
  #[arg(long, default_value_t = 182)]
  max_write_without_response: usize,
  /// The link lacks BLE data length extension.
  #[arg(long, action)]
  no_dle: bool,
  /// Use the windowed RWCP data channel when available.
  #[arg(long, action)]
  rwcp: bool,
  /// Wait for the device to acknowledge each DATA packet (iAP2 only).
  #[arg(long, action)]
  expect_acks: bool,
}

impl LinkArgs {
  fn settings(&self) -> gaiadfu::Result<UpdateSettings> {
    let mut settings = match &self.settings {
      Some(path) => UpdateSettings::from_file(path)?,
      None => UpdateSettings::default(),
    };
    settings.use_rwcp |= self.rwcp;
    settings.expect_acks |= self.expect_acks;
    settings.validate()?;
    Ok(settings)
  }

  fn capabilities(&self) -> TransportCapabilities {
    TransportCapabilities {
      max_write_length: self.max_write,
      max_write_without_response_length: self.max_write_without_response,
      data_length_extension_supported: !self.no_dle,
      rwcp_supported: !self.iap2,
      kind: if self.iap2 {
        ConnectionKind::Iap2
      } else {
        ConnectionKind::Ble
      },
    }
  }
}

fn main() {
  let args = Args::parse();
  monitoring::init_logger(&args.log_level);

  let result = match args.command {
    Command::Plan(link) => plan(&link),
    Command::Simulate {
      file,
      link,
      protocol,
      resume_offset,
      drop_every,
      pause_at,
      silent,
    } => simulate(file, &link, protocol, resume_offset, drop_every, pause_at, silent),
  };

  if let Err(err) = result {
    tracing::error!("{err}");
    std::process::exit(1);
  }
}

fn plan(link: &LinkArgs) -> gaiadfu::Result<()> {
  let settings = link.settings()?;
  let capabilities = link.capabilities();
  let negotiation = TransportNegotiation::negotiate(&settings, &capabilities);
  let sizing = PacketSizing::compute(&settings, &capabilities, &negotiation)?;

  println!("settings: {}", serde_json::to_string_pretty(&settings)?);
  println!("transport: {negotiation:?}");
  println!(
    "mtu {} bytes, {} bytes framing, {} bytes of image per packet",
    sizing.negotiated_mtu, sizing.framing_overhead, sizing.max_payload
  );
  Ok(())
}

fn simulate(
  file: PathBuf,
  link: &LinkArgs,
  protocol: u8,
  resume_offset: usize,
  drop_every: Option<usize>,
  pause_at: Option<usize>,
  silent: bool,
) -> gaiadfu::Result<()> {
  let image = std::fs::read(&file)?;
  let settings = link.settings()?;
  let profile = DeviceProfile {
    version: ProtocolVersion::try_from(protocol)?,
    resume_point: ResumePoint::Start,
    resume_offset,
    drop_every,
    silent_commit_supported: silent,
    acknowledge_data: settings.expect_acks,
    ..Default::default()
  };
  let responder = AutoResponder {
    transfer_option: if silent {
      TransferOption::Silent
    } else {
      TransferOption::Interactive
    },
    pause_at,
    ..Default::default()
  };

  tracing::info!("sending {} ({} bytes) to a simulated {} device", file.display(), image.len(), profile.version);
  let device = SimulatedDevice::new(profile).with_image(&image);
  let mut harness = SimulationHarness::new(device, SimTransport::new(link.capabilities()), responder);

  let last_decile = AtomicU64::new(0);
  harness.engine_mut().set_callback(Some(Arc::new(move |event: Event| match event {
    Event::Progress(progress) => {
      let decile = (progress.percent / 10.0) as u64;
      if last_decile.swap(decile, Ordering::Relaxed) != decile {
        tracing::info!("{:.0}% ({} of {} bytes)", progress.percent, progress.progress_bytes, progress.transfer_size);
      }
    }
    Event::StateChanged(state) => tracing::debug!("state: {state}"),
  })));
  let state = harness.run(&image, &settings, false, usize::MAX);

  match state {
    UpdateState::Stopped(StopReason::Completed(status)) => {
      let seconds = status.elapsed.as_secs_f64();
      tracing::info!(
        "done: {} bytes sent, {} skipped, {:.1}s of simulated time",
        status.bytes_sent,
        status.bytes_skipped,
        seconds
      );
    }
    state => tracing::info!("finished in {state}"),
  }
  if harness.device().image() != image.as_slice() {
    tracing::warn!("device image does not match {}", file.display());
  }
  Ok(())
}
