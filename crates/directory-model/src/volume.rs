//! Volume lookups used by the coordinator and the banner controller.

use std::{
	collections::HashMap,
	fmt,
	path::{Path, PathBuf},
};

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, info};

use crate::{
	entry::{Container, SyntheticRoot},
	error::VolumeError,
};

/// Classification of volumes for display and banner eligibility
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum VolumeType {
	/// Primary system drive containing OS and user data
	Primary,
	/// Dedicated user data volumes
	UserData,
	/// External or removable storage devices
	External,
	/// Secondary internal storage
	Secondary,
	/// System or OS internal volumes
	System,
	/// Network attached storage
	Network,
	/// Guest machines and other mounts bridged in by a host service
	Virtual,
	/// Unknown or unclassified volumes
	Unknown,
}

impl VolumeType {
	/// Classify a mount point the way the desktop apps present it.
	pub fn classify(mount_point: &Path, file_system: &str, is_removable: bool) -> Self {
		let mount_str = mount_point.to_string_lossy();

		match mount_str.as_ref() {
			"/" | "C:\\" => Self::Primary,
			"/home" => Self::UserData,
			path if path.starts_with("/System/Volumes/Data") => Self::Primary,
			path if path.starts_with("/proc")
				|| path.starts_with("/sys")
				|| path.starts_with("/dev")
				|| path.starts_with("/boot")
				|| path.starts_with("/System/Volumes/") =>
			{
				Self::System
			}
			_ if matches!(file_system, "nfs" | "nfs4" | "cifs" | "smbfs") => Self::Network,
			path if path.starts_with("\\\\") || path.starts_with("/Network/") => Self::Network,
			_ if is_removable => Self::External,
			path if path.starts_with("/media/") || path.starts_with("/mnt/") => Self::External,
			_ => Self::Secondary,
		}
	}
}

impl fmt::Display for VolumeType {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		let name = match self {
			Self::Primary => "Primary",
			Self::UserData => "User Data",
			Self::External => "External",
			Self::Secondary => "Secondary",
			Self::System => "System",
			Self::Network => "Network",
			Self::Virtual => "Virtual",
			Self::Unknown => "Unknown",
		};
		write!(f, "{name}")
	}
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Volume {
	pub id: String,
	pub name: String,
	pub volume_type: VolumeType,
	pub mount_point: PathBuf,
	pub is_mounted: bool,
	pub read_only: bool,
	pub total_bytes_capacity: u64,
	pub total_bytes_available: u64,
}

impl Volume {
	pub fn new(
		id: impl Into<String>,
		volume_type: VolumeType,
		mount_point: impl Into<PathBuf>,
	) -> Self {
		let id = id.into();
		Self {
			name: id.clone(),
			id,
			volume_type,
			mount_point: mount_point.into(),
			is_mounted: true,
			read_only: false,
			total_bytes_capacity: 0,
			total_bytes_available: 0,
		}
	}

	#[must_use]
	pub const fn with_capacity(mut self, total: u64, available: u64) -> Self {
		self.total_bytes_capacity = total;
		self.total_bytes_available = available;
		self
	}

	pub fn contains_path(&self, path: &Path) -> bool {
		path.starts_with(&self.mount_point)
	}
}

/// Where a container lives, as far as the UI is concerned.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocationInfo {
	pub volume_id: Option<String>,
	pub volume_type: Option<VolumeType>,
	pub is_root_entry: bool,
	pub is_read_only: bool,
	pub synthetic_root: Option<SyntheticRoot>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DriveConnectionState {
	Online,
	Offline,
	Metered,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SizeStats {
	pub total: u64,
	pub remaining: u64,
}

impl SizeStats {
	pub fn free_ratio(&self) -> f64 {
		if self.total == 0 {
			0.0
		} else {
			self.remaining as f64 / self.total as f64
		}
	}
}

/// Mount and unmount notifications.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum VolumeEvent {
	Added(Volume),
	Removed { id: String },
}

/// Read-only view of the mounted volumes.
#[async_trait]
pub trait VolumeManager: Send + Sync + fmt::Debug {
	fn volumes(&self) -> Vec<Volume>;

	/// The volume with the longest mount point containing `path`.
	fn volume_for_path(&self, path: &Path) -> Option<Volume> {
		self.volumes()
			.into_iter()
			.filter(|volume| volume.is_mounted && volume.contains_path(path))
			.max_by_key(|volume| volume.mount_point.components().count())
	}

	fn volume_for_container(&self, container: &Container) -> Option<Volume> {
		container
			.location()
			.and_then(|path| self.volume_for_path(path))
	}

	fn location_info(&self, container: &Container) -> LocationInfo {
		let volume = self.volume_for_container(container);

		LocationInfo {
			is_root_entry: match (&volume, container) {
				(Some(volume), Container::Directory(path)) => *path == volume.mount_point,
				(_, Container::Synthetic(_)) => true,
				_ => false,
			},
			is_read_only: volume.as_ref().is_some_and(|volume| volume.read_only)
				|| container.synthetic_root().is_some(),
			volume_type: volume.as_ref().map(|volume| volume.volume_type),
			volume_id: volume.map(|volume| volume.id),
			synthetic_root: container.synthetic_root(),
		}
	}

	fn drive_connection_state(&self) -> DriveConnectionState;

	fn subscribe(&self) -> broadcast::Receiver<VolumeEvent>;

	async fn size_stats(&self, volume_id: &str) -> Result<SizeStats, VolumeError>;
}

/// In-memory volume list, fed by the host or by [`VolumeRegistry::detect`].
#[derive(Debug)]
pub struct VolumeRegistry {
	volumes: RwLock<HashMap<String, Volume>>,
	connection_state: RwLock<DriveConnectionState>,
	events_tx: broadcast::Sender<VolumeEvent>,
}

impl VolumeRegistry {
	pub fn new() -> Self {
		let (events_tx, _) = broadcast::channel(64);
		Self {
			volumes: RwLock::new(HashMap::new()),
			connection_state: RwLock::new(DriveConnectionState::Online),
			events_tx,
		}
	}

	/// Registry populated with the disks currently mounted on this machine.
	pub fn detect() -> Self {
		let registry = Self::new();

		for disk in sysinfo::Disks::new_with_refreshed_list().list() {
			let mount_point = disk.mount_point().to_path_buf();
			let file_system = disk.file_system().to_string_lossy().to_lowercase();
			let id = mount_point.to_string_lossy().into_owned();
			let volume_type = VolumeType::classify(&mount_point, &file_system, disk.is_removable());

			let mut volume = Volume::new(id, volume_type, mount_point)
				.with_capacity(disk.total_space(), disk.available_space());

			let name = disk.name().to_string_lossy();
			if !name.is_empty() {
				volume.name = name.into_owned();
			}

			registry.mount(volume);
		}

		info!(
			count = registry.volumes.read().len(),
			"Detected mounted volumes"
		);

		registry
	}

	pub fn mount(&self, volume: Volume) {
		debug!(id = %volume.id, volume_type = %volume.volume_type, "Volume mounted");
		self.volumes.write().insert(volume.id.clone(), volume.clone());
		let _ = self.events_tx.send(VolumeEvent::Added(volume));
	}

	pub fn unmount(&self, id: &str) -> Result<Volume, VolumeError> {
		let volume = self
			.volumes
			.write()
			.remove(id)
			.ok_or_else(|| VolumeError::NotFound(id.to_string()))?;

		debug!(%id, "Volume unmounted");
		let _ = self.events_tx.send(VolumeEvent::Removed { id: id.to_string() });

		Ok(volume)
	}

	pub fn set_available_bytes(&self, id: &str, available: u64) -> Result<(), VolumeError> {
		let mut volumes = self.volumes.write();
		let volume = volumes
			.get_mut(id)
			.ok_or_else(|| VolumeError::NotFound(id.to_string()))?;
		volume.total_bytes_available = available;
		Ok(())
	}

	pub fn set_connection_state(&self, state: DriveConnectionState) {
		*self.connection_state.write() = state;
	}
}

impl Default for VolumeRegistry {
	fn default() -> Self {
		Self::new()
	}
}

#[async_trait]
impl VolumeManager for VolumeRegistry {
	fn volumes(&self) -> Vec<Volume> {
		self.volumes.read().values().cloned().collect()
	}

	fn drive_connection_state(&self) -> DriveConnectionState {
		*self.connection_state.read()
	}

	fn subscribe(&self) -> broadcast::Receiver<VolumeEvent> {
		self.events_tx.subscribe()
	}

	async fn size_stats(&self, volume_id: &str) -> Result<SizeStats, VolumeError> {
		let volume = self
			.volumes
			.read()
			.get(volume_id)
			.cloned()
			.ok_or_else(|| VolumeError::NotFound(volume_id.to_string()))?;

		if !volume.is_mounted {
			return Err(VolumeError::NotMounted(volume_id.to_string()));
		}

		Ok(SizeStats {
			total: volume.total_bytes_capacity,
			remaining: volume.total_bytes_available,
		})
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn nested_mounts_win() {
		let registry = VolumeRegistry::new();
		registry.mount(Volume::new("root", VolumeType::Primary, "/"));
		registry.mount(Volume::new("usb", VolumeType::External, "/media/usb"));

		let volume = registry
			.volume_for_container(&Container::directory("/media/usb/photos"))
			.unwrap();
		assert_eq!(volume.id, "usb");

		let volume = registry.volume_for_path(Path::new("/home/user")).unwrap();
		assert_eq!(volume.id, "root");

		assert!(registry
			.volume_for_container(&Container::Synthetic(SyntheticRoot::Recent))
			.is_none());
	}

	#[test]
	fn location_info_marks_mount_roots() {
		let registry = VolumeRegistry::new();
		registry.mount(Volume::new("usb", VolumeType::External, "/media/usb"));

		let info = registry.location_info(&Container::directory("/media/usb"));
		assert!(info.is_root_entry);
		assert_eq!(info.volume_type, Some(VolumeType::External));

		let info = registry.location_info(&Container::directory("/media/usb/a"));
		assert!(!info.is_root_entry);
	}

	#[test]
	fn classifies_common_mount_points() {
		assert_eq!(VolumeType::classify(Path::new("/"), "ext4", false), VolumeType::Primary);
		assert_eq!(
			VolumeType::classify(Path::new("/media/usb"), "vfat", true),
			VolumeType::External
		);
		assert_eq!(
			VolumeType::classify(Path::new("/srv/share"), "nfs", false),
			VolumeType::Network
		);
	}

	#[tokio::test]
	async fn unmount_emits_and_size_stats_fail() {
		let registry = VolumeRegistry::new();
		let mut rx = registry.subscribe();
		registry.mount(Volume::new("usb", VolumeType::External, "/media/usb").with_capacity(100, 5));

		assert_eq!(
			registry.size_stats("usb").await.unwrap(),
			SizeStats {
				total: 100,
				remaining: 5
			}
		);

		registry.unmount("usb").unwrap();
		assert!(matches!(rx.recv().await.unwrap(), VolumeEvent::Added(_)));
		assert_eq!(
			rx.recv().await.unwrap(),
			VolumeEvent::Removed { id: "usb".into() }
		);
		assert!(matches!(
			registry.size_stats("usb").await,
			Err(VolumeError::NotFound(_))
		));
	}
}
