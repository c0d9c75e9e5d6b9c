//! Picking the single advisory banner to show for the displayed location.
//!
//! Banners are ordered once, warnings before educational ones and otherwise
//! in registration order, and [`BannerController::reconcile`] shows the first
//! eligible one. View counters and dismissals are persisted through a
//! [`KeyValueStore`] and mirrored in memory.

use std::{
	collections::{HashMap, HashSet},
	sync::{
		atomic::{AtomicU64, Ordering},
		Arc, Weak,
	},
	time::Duration,
};

use chrono::Utc;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::{
	spawn,
	sync::broadcast::{self, error::RecvError},
	task::JoinHandle,
};
use tracing::{debug, instrument, trace, warn};

use crate::{
	config::BannerConfig,
	events::EventBus,
	model::{DirectoryModel, DirectoryModelEvent},
	storage::{KeyValueStore, StorageArea, StorageChanges},
	volume::{DriveConnectionState, Volume, VolumeEvent},
};

mod types;

pub use types::{
	AllowedVolume, BannerEvent, BannerKind, BannerSpec, BannerViewState, DiskThreshold,
};

const VIEW_COUNTER: &str = "view_counter";
const LAST_DISMISSED: &str = "last_dismissed";

#[derive(Debug)]
pub struct BannerController {
	config: BannerConfig,
	banners: Vec<BannerSpec>,
	model: DirectoryModel,
	store: Arc<dyn KeyValueStore>,
	cache: Mutex<HashMap<String, BannerViewState>>,
	shown_this_session: Mutex<HashSet<String>>,
	visible: Mutex<Option<String>>,
	/// Bumped by every reconcile, an older one finishing late must not win
	generation: AtomicU64,
	events: EventBus<BannerEvent>,
	listeners: Mutex<Vec<JoinHandle<()>>>,
}

impl BannerController {
	/// `banners` are given in registration order.
	///
	/// A new controller starts a new session.
	pub fn new(
		config: BannerConfig,
		model: DirectoryModel,
		store: Arc<dyn KeyValueStore>,
		mut banners: Vec<BannerSpec>,
	) -> Self {
		// Stable, registration order is kept within a kind
		banners.sort_by_key(|banner| banner.kind);

		let cache = banners
			.iter()
			.map(|banner| (banner.id.clone(), BannerViewState::default()))
			.collect();

		Self {
			config,
			banners,
			model,
			store,
			cache: Mutex::new(cache),
			shown_this_session: Mutex::default(),
			visible: Mutex::default(),
			generation: AtomicU64::new(0),
			events: EventBus::default(),
			listeners: Mutex::default(),
		}
	}

	pub fn subscribe(&self) -> broadcast::Receiver<BannerEvent> {
		self.events.subscribe()
	}

	/// Banners in priority order.
	pub fn banners(&self) -> &[BannerSpec] {
		&self.banners
	}

	pub fn visible(&self) -> Option<String> {
		self.visible.lock().clone()
	}

	pub fn view_state(&self, id: &str) -> Option<BannerViewState> {
		self.cache.lock().get(id).copied()
	}

	/// Seed the in-memory cache from persistence, missing or corrupt values read as 0.
	#[instrument(skip(self))]
	pub async fn initialize(&self) {
		let keys = self
			.banners
			.iter()
			.flat_map(|banner| {
				[
					self.key(&banner.id, VIEW_COUNTER),
					self.key(&banner.id, LAST_DISMISSED),
				]
			})
			.collect::<Vec<_>>();

		let values = match self.store.get(&keys).await {
			Ok(values) => values,
			Err(e) => {
				warn!(?e, "Failed to read banner state, using defaults;");
				HashMap::new()
			}
		};

		let mut cache = self.cache.lock();
		for banner in &self.banners {
			let view_counter = values
				.get(&self.key(&banner.id, VIEW_COUNTER))
				.and_then(parse_counter)
				.unwrap_or_default();
			let last_dismissed = values
				.get(&self.key(&banner.id, LAST_DISMISSED))
				.and_then(parse_timestamp)
				.unwrap_or_default();

			cache.insert(
				banner.id.clone(),
				BannerViewState {
					view_counter,
					last_dismissed,
				},
			);
		}

		debug!(banners = self.banners.len(), "Banner state loaded");
	}

	/// Show the first eligible banner and hide every other one.
	///
	/// Returns the id of the banner now visible. A reconcile overtaken by a
	/// newer one while it was checking eligibility changes nothing.
	#[instrument(skip(self))]
	pub async fn reconcile(&self) -> Option<String> {
		let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
		let volume = self.model.current_volume();
		let connection = self.model.volumes().drive_connection_state();

		let mut chosen = None;
		for banner in &self.banners {
			if self.is_eligible(banner, volume.as_ref(), connection).await {
				chosen = Some(banner.id.clone());
				break;
			}
		}

		let previous = {
			let mut visible = self.visible.lock();

			if !self.is_current(generation) {
				trace!(%generation, "Reconcile superseded by a newer one");
				return visible.clone();
			}

			std::mem::replace(&mut *visible, chosen.clone())
		};

		if previous != chosen {
			if let Some(id) = previous {
				trace!(%id, "Hiding banner");
				self.events.emit(BannerEvent::Hidden { id });
			}
			if let Some(id) = &chosen {
				trace!(%id, "Showing banner");
				self.events.emit(BannerEvent::Shown { id: id.clone() });
			}
		}

		if let Some(id) = chosen.as_ref().filter(|_| self.is_current(generation)) {
			let first_time_this_session = self.shown_this_session.lock().insert(id.clone());
			if first_time_this_session {
				let view_counter = self.view_state(id).unwrap_or_default().view_counter + 1;
				self.set_show_count(id, view_counter).await;
			}
		}

		chosen
	}

	/// Start a new session: the visible banner is taken down and every banner
	/// counts as not yet shown.
	pub fn start_session(&self) {
		self.shown_this_session.lock().clear();

		if let Some(id) = self.visible.lock().take() {
			self.events.emit(BannerEvent::Hidden { id });
		}
	}

	/// Overwrite the view counter of `id`, in memory and in persistence.
	pub async fn set_show_count(&self, id: &str, view_counter: u32) {
		let known = self
			.cache
			.lock()
			.get_mut(id)
			.map(|state| state.view_counter = view_counter)
			.is_some();

		if !known {
			warn!(%id, "Tried to set the view counter of an unknown banner");
			return;
		}

		self.persist(id, VIEW_COUNTER, Value::from(view_counter)).await;
	}

	/// Dismiss `id` and reconcile again.
	#[instrument(skip(self))]
	pub async fn dismiss(&self, id: &str) -> Option<String> {
		let now = Utc::now().timestamp_millis();

		let known = self
			.cache
			.lock()
			.get_mut(id)
			.map(|state| state.last_dismissed = now)
			.is_some();

		if !known {
			warn!(%id, "Tried to dismiss an unknown banner");
			return self.visible();
		}

		self.persist(id, LAST_DISMISSED, Value::from(now)).await;
		self.reconcile().await
	}

	/// Mirror changes written by someone else into the cache.
	pub fn on_storage_changed(&self, changes: &StorageChanges) {
		if changes.area != StorageArea::Local {
			return;
		}

		let mut cache = self.cache.lock();

		for (key, change) in &changes.changes {
			let Some((id, field)) = self.parse_key(key) else {
				continue;
			};
			let Some(state) = cache.get_mut(id) else {
				continue;
			};

			match field {
				VIEW_COUNTER => {
					state.view_counter = change
						.new_value
						.as_ref()
						.and_then(parse_counter)
						.unwrap_or_default();
				}
				LAST_DISMISSED => {
					state.last_dismissed = change
						.new_value
						.as_ref()
						.and_then(parse_timestamp)
						.unwrap_or_default();
				}
				_ => {}
			}
		}
	}

	/// Follow directory changes, mounts and, if configured, persistence changes.
	pub fn spawn_listeners(self: &Arc<Self>) {
		let mut listeners = self.listeners.lock();

		listeners.push(spawn(Self::follow_directory(
			Arc::downgrade(self),
			self.model.subscribe(),
		)));

		listeners.push(spawn(Self::follow_volumes(
			Arc::downgrade(self),
			self.model.volumes().subscribe(),
		)));

		if self.config.follow_storage_changes {
			listeners.push(spawn(Self::follow_storage(
				Arc::downgrade(self),
				self.store.subscribe(),
			)));
		}
	}

	pub fn stop_listeners(&self) {
		for listener in self.listeners.lock().drain(..) {
			listener.abort();
		}
	}

	fn is_current(&self, generation: u64) -> bool {
		self.generation.load(Ordering::SeqCst) == generation
	}

	async fn is_eligible(
		&self,
		banner: &BannerSpec,
		volume: Option<&Volume>,
		connection: DriveConnectionState,
	) -> bool {
		if !banner.allows(volume) {
			return false;
		}

		if banner
			.required_connection
			.is_some_and(|required| required != connection)
		{
			return false;
		}

		let state = self.view_state(&banner.id).unwrap_or_default();

		if state.last_dismissed > 0 {
			let still_dismissed = match banner.dismiss_duration {
				None => true,
				Some(duration) => {
					let elapsed = Utc::now().timestamp_millis() - state.last_dismissed;
					u64::try_from(elapsed).map_or(true, |elapsed| {
						Duration::from_millis(elapsed) < duration
					})
				}
			};

			if still_dismissed {
				return false;
			}
		}

		if let Some(show_limit) = banner.show_limit {
			let shown_this_session = self.shown_this_session.lock().contains(&banner.id);
			if !shown_this_session && state.view_counter >= show_limit {
				return false;
			}
		}

		if let Some(threshold) = banner.disk_threshold {
			let Some(volume) = volume else {
				return false;
			};

			return match self.model.volumes().size_stats(&volume.id).await {
				Ok(stats) => threshold.is_reached(&stats),
				Err(e) => {
					debug!(?e, id = %banner.id, "No size stats for disk space banner;");
					false
				}
			};
		}

		true
	}

	async fn persist(&self, id: &str, field: &str, value: Value) {
		let key = self.key(id, field);

		if let Err(e) = self.store.set(HashMap::from([(key, value)])).await {
			// The cache keeps the value for the rest of the session
			warn!(?e, %id, %field, "Failed to persist banner state;");
		}
	}

	fn key(&self, id: &str, field: &str) -> String {
		format!("{}.{id}.{field}", self.config.storage_key_prefix)
	}

	fn parse_key<'a>(&self, key: &'a str) -> Option<(&'a str, &'a str)> {
		key.strip_prefix(self.config.storage_key_prefix.as_str())?
			.strip_prefix('.')?
			.rsplit_once('.')
	}

	async fn follow_directory(
		weak: Weak<Self>,
		mut events_rx: broadcast::Receiver<DirectoryModelEvent>,
	) {
		loop {
			match events_rx.recv().await {
				Ok(DirectoryModelEvent::DirectoryChanged { .. }) => {}
				Ok(_) => continue,
				Err(RecvError::Lagged(skipped)) => {
					trace!(%skipped, "Banner listener lagged, reconciling");
				}
				Err(RecvError::Closed) => break,
			}

			let Some(controller) = weak.upgrade() else {
				break;
			};
			controller.reconcile().await;
		}
	}

	async fn follow_volumes(
		weak: Weak<Self>,
		mut events_rx: broadcast::Receiver<VolumeEvent>,
	) {
		loop {
			match events_rx.recv().await {
				Ok(_) | Err(RecvError::Lagged(_)) => {}
				Err(RecvError::Closed) => break,
			}

			let Some(controller) = weak.upgrade() else {
				break;
			};
			controller.reconcile().await;
		}
	}

	async fn follow_storage(weak: Weak<Self>, mut changes_rx: broadcast::Receiver<StorageChanges>) {
		loop {
			match changes_rx.recv().await {
				Ok(changes) => {
					let Some(controller) = weak.upgrade() else {
						break;
					};
					controller.on_storage_changed(&changes);
				}
				Err(RecvError::Lagged(skipped)) => {
					warn!(%skipped, "Missed persistence change notifications;");
				}
				Err(RecvError::Closed) => break,
			}
		}
	}
}

impl Drop for BannerController {
	fn drop(&mut self) {
		self.stop_listeners();
	}
}

fn parse_counter(value: &Value) -> Option<u32> {
	value
		.as_u64()
		.or_else(|| value.as_str().and_then(|s| s.parse().ok()))
		.and_then(|counter| u32::try_from(counter).ok())
}

fn parse_timestamp(value: &Value) -> Option<i64> {
	value
		.as_i64()
		.or_else(|| value.as_str().and_then(|s| s.parse().ok()))
		.filter(|timestamp| *timestamp >= 0)
}
