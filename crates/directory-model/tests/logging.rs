#![allow(clippy::unwrap_used)]

use sd_directory_model::{logging::init_tracing, DirectoryModelConfig};
use tempfile::tempdir;
use tracing::info;

#[test]
fn tracing_installs_once_and_writes_to_the_logs_dir() {
	let data_dir = tempdir().unwrap();
	let logs_dir = data_dir.path().join("logs");

	init_tracing(Some(&logs_dir), "sd_directory_model=debug").unwrap();
	// Later calls are no-ops
	init_tracing(None, "warn").unwrap();

	let config = DirectoryModelConfig::load_or_create(data_dir.path()).unwrap();
	info!(?config, "Config loaded");

	assert!(logs_dir.is_dir());
	assert!(data_dir.path().join("directory_model.json").is_file());
}
