use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::volume::{DriveConnectionState, SizeStats, Volume, VolumeType};

/// Warnings always outrank educational banners.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum BannerKind {
	Warning,
	Educational,
}

/// A volume a banner may show on, optionally narrowed to one volume id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllowedVolume {
	pub volume_type: VolumeType,
	pub volume_id: Option<String>,
}

impl AllowedVolume {
	pub fn matches(&self, volume: &Volume) -> bool {
		self.volume_type == volume.volume_type
			&& self
				.volume_id
				.as_ref()
				.map_or(true, |volume_id| *volume_id == volume.id)
	}
}

/// Free space under which a disk space banner becomes eligible.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum DiskThreshold {
	MinFreeRatio(f64),
	MinFreeBytes(u64),
}

impl DiskThreshold {
	pub fn is_reached(&self, stats: &SizeStats) -> bool {
		match self {
			Self::MinFreeRatio(ratio) => stats.free_ratio() < *ratio,
			Self::MinFreeBytes(bytes) => stats.remaining < *bytes,
		}
	}
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BannerSpec {
	pub id: String,
	pub kind: BannerKind,
	/// Empty means any location, including ones without a volume.
	pub allowed_volumes: Vec<AllowedVolume>,
	/// Maximum number of sessions the banner may be shown in.
	pub show_limit: Option<u32>,
	pub disk_threshold: Option<DiskThreshold>,
	/// How long a dismissal lasts, forever when unset.
	pub dismiss_duration: Option<Duration>,
	pub required_connection: Option<DriveConnectionState>,
}

impl BannerSpec {
	pub fn new(id: impl Into<String>, kind: BannerKind) -> Self {
		Self {
			id: id.into(),
			kind,
			allowed_volumes: Vec::new(),
			show_limit: None,
			disk_threshold: None,
			dismiss_duration: None,
			required_connection: None,
		}
	}

	pub fn warning(id: impl Into<String>) -> Self {
		Self::new(id, BannerKind::Warning)
	}

	pub fn educational(id: impl Into<String>) -> Self {
		Self::new(id, BannerKind::Educational)
	}

	#[must_use]
	pub fn allow_volume(mut self, volume_type: VolumeType, volume_id: Option<&str>) -> Self {
		self.allowed_volumes.push(AllowedVolume {
			volume_type,
			volume_id: volume_id.map(ToString::to_string),
		});
		self
	}

	#[must_use]
	pub const fn with_show_limit(mut self, show_limit: u32) -> Self {
		self.show_limit = Some(show_limit);
		self
	}

	#[must_use]
	pub const fn with_disk_threshold(mut self, threshold: DiskThreshold) -> Self {
		self.disk_threshold = Some(threshold);
		self
	}

	#[must_use]
	pub const fn with_dismiss_duration(mut self, duration: Duration) -> Self {
		self.dismiss_duration = Some(duration);
		self
	}

	#[must_use]
	pub const fn with_required_connection(mut self, state: DriveConnectionState) -> Self {
		self.required_connection = Some(state);
		self
	}

	pub fn allows(&self, volume: Option<&Volume>) -> bool {
		if self.allowed_volumes.is_empty() {
			return true;
		}

		volume.is_some_and(|volume| {
			self.allowed_volumes
				.iter()
				.any(|allowed| allowed.matches(volume))
		})
	}
}

/// Persisted view history of a banner.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BannerViewState {
	pub view_counter: u32,
	/// Milliseconds since the Unix epoch, 0 when never dismissed.
	pub last_dismissed: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum BannerEvent {
	Shown { id: String },
	Hidden { id: String },
}
