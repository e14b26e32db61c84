use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// `RUST_LOG` wins over `default_level` when set.
pub fn init_logger(default_level: &str) {
  let filter = EnvFilter::try_from_default_env()
    .unwrap_or_else(|_| EnvFilter::new(format!("gaiadfu={default_level},gaiadfu_cli={default_level}")));

  tracing_subscriber::registry()
    .with(filter)
    .with(fmt::layer().with_target(false))
    .init();
}
