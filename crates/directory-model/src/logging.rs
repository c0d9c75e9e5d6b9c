use std::{path::Path, sync::Once};

use anyhow::{anyhow, Result};
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Install the global tracing subscriber.
///
/// Logs go to stdout and, when `logs_dir` is given, to a daily rotated file in
/// that directory. `RUST_LOG` wins over `default_filter`. Only the first call
/// has any effect.
pub fn init_tracing(logs_dir: Option<&Path>, default_filter: &str) -> Result<()> {
	static INIT: Once = Once::new();
	let mut result = Ok(());

	INIT.call_once(|| {
		let env_filter = EnvFilter::try_from_default_env()
			.unwrap_or_else(|_| EnvFilter::new(default_filter));

		let file_layer = match logs_dir {
			Some(logs_dir) => {
				if let Err(e) = std::fs::create_dir_all(logs_dir) {
					result = Err(anyhow!("Failed to create logs directory: {e}"));
					return;
				}

				Some(
					fmt::layer()
						.with_target(true)
						.with_thread_ids(true)
						.with_ansi(false) // No ANSI colors in log files
						.with_writer(RollingFileAppender::new(
							Rotation::DAILY,
							logs_dir,
							"directory_model.log",
						)),
				)
			}
			None => None,
		};

		if let Err(e) = tracing_subscriber::registry()
			.with(env_filter)
			.with(
				fmt::layer()
					.with_target(true)
					.with_thread_ids(true)
					.with_writer(std::io::stdout),
			)
			.with(file_layer)
			.try_init()
		{
			result = Err(anyhow!("Failed to initialize tracing: {e}"));
		}
	});

	result
}
