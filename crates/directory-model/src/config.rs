//! Directory model configuration

use std::{
	fs,
	path::{Path, PathBuf},
	time::Duration,
};

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

const CONFIG_FILE_NAME: &str = "directory_model.json";

/// Platform-specific data directory resolution
pub fn default_data_dir() -> Result<PathBuf> {
	#[cfg(target_os = "linux")]
	let dir = dirs::data_local_dir()
		.ok_or_else(|| anyhow!("Could not determine data directory"))?
		.join("spacedrive");

	#[cfg(target_os = "windows")]
	let dir = dirs::data_dir()
		.ok_or_else(|| anyhow!("Could not determine data directory"))?
		.join("Spacedrive");

	#[cfg(not(any(target_os = "linux", target_os = "windows")))]
	let dir = dirs::data_dir()
		.ok_or_else(|| anyhow!("Could not determine data directory"))?
		.join("spacedrive");

	// Create directory if it doesn't exist
	fs::create_dir_all(&dir)?;

	Ok(dir)
}

/// Schema migrations for persisted configuration
pub trait Migrate {
	fn current_version(&self) -> u32;

	fn target_version() -> u32;

	fn migrate(&mut self) -> Result<()>;
}

/// Tunables of the scan coordinator
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DirectoryModelConfig {
	/// Config schema version
	pub version: u32,

	/// Delay used by `rescan_soon`
	pub rescan_soon_ms: u64,

	/// Delay used by `rescan_later`, also the automatic retry delay after a failed scan
	pub rescan_later_ms: u64,

	/// Quiet period before unstructured watcher notifications turn into a rescan
	pub watcher_aggregation_ms: u64,

	/// Entries per batch handed out by the local provider
	pub scan_batch_size: usize,

	/// Entries per metadata prefetch request
	pub metadata_chunk_size: usize,

	/// Capacity of every broadcast channel
	pub event_capacity: usize,

	/// Maximum number of results of a local search
	pub search_max_results: usize,

	/// How far back the "Recent" root looks
	pub recent_window_days: u32,

	/// Maximum number of entries listed by the "Recent" root
	pub recent_max_results: usize,

	/// Whether the selection holds at most one entry
	pub single_selection: bool,
}

impl DirectoryModelConfig {
	pub const fn rescan_soon(&self) -> Duration {
		Duration::from_millis(self.rescan_soon_ms)
	}

	pub const fn rescan_later(&self) -> Duration {
		Duration::from_millis(self.rescan_later_ms)
	}

	pub const fn watcher_aggregation(&self) -> Duration {
		Duration::from_millis(self.watcher_aggregation_ms)
	}

	pub fn recent_window(&self) -> chrono::Duration {
		chrono::Duration::days(i64::from(self.recent_window_days))
	}

	/// Load configuration from a specific data directory
	pub fn load_from(data_dir: &Path) -> Result<Self> {
		let config_path = data_dir.join(CONFIG_FILE_NAME);

		if config_path.exists() {
			info!("Loading directory model config from {:?}", config_path);
			let json = fs::read_to_string(&config_path)?;
			let mut config: Self = serde_json::from_str(&json)?;

			// Apply migrations if needed
			if config.current_version() < Self::target_version() {
				info!(
					"Migrating directory model config from v{} to v{}",
					config.version,
					Self::target_version()
				);
				config.migrate()?;
				config.save_to(data_dir)?;
			}

			Ok(config)
		} else {
			warn!("No directory model config found, creating default at {:?}", config_path);
			let config = Self::default();
			config.save_to(data_dir)?;
			Ok(config)
		}
	}

	/// Load or create configuration, falling back to defaults on a broken file
	pub fn load_or_create(data_dir: &Path) -> Result<Self> {
		Self::load_from(data_dir).or_else(|e| {
			warn!(?e, "Failed to load directory model config, rewriting defaults;");
			let config = Self::default();
			config.save_to(data_dir)?;
			Ok(config)
		})
	}

	/// Save configuration to disk
	pub fn save_to(&self, data_dir: &Path) -> Result<()> {
		fs::create_dir_all(data_dir)?;

		let config_path = data_dir.join(CONFIG_FILE_NAME);
		let json = serde_json::to_string_pretty(self)?;
		fs::write(&config_path, json)?;
		info!("Saved directory model config to {:?}", config_path);
		Ok(())
	}
}

impl Default for DirectoryModelConfig {
	fn default() -> Self {
		Self {
			version: Self::target_version(),
			rescan_soon_ms: 100,
			rescan_later_ms: 500,
			watcher_aggregation_ms: 500,
			scan_batch_size: 100,
			metadata_chunk_size: 25,
			event_capacity: 1024,
			search_max_results: 100,
			recent_window_days: 30,
			recent_max_results: 500,
			single_selection: false,
		}
	}
}

impl Migrate for DirectoryModelConfig {
	fn current_version(&self) -> u32 {
		self.version
	}

	fn target_version() -> u32 {
		1 // Current schema version
	}

	fn migrate(&mut self) -> Result<()> {
		match self.version {
			0 => {
				// v0 files predate the recent view limits, serde defaults already filled them
				self.version = 1;
				Ok(())
			}
			1 => Ok(()), // Already at target version
			v => Err(anyhow!("Unknown directory model config version: {}", v)),
		}
	}
}

/// Banner reconciliation settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BannerConfig {
	/// Prefix of every persisted banner key
	pub storage_key_prefix: String,

	/// Whether the controller follows persistence change notifications on its own
	pub follow_storage_changes: bool,
}

impl Default for BannerConfig {
	fn default() -> Self {
		Self {
			storage_key_prefix: "banners".to_string(),
			follow_storage_changes: true,
		}
	}
}
