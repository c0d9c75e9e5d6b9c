//! The directory model: owner of what is displayed.
//!
//! Every directory change bumps a sequence number and goes through an
//! [`AsyncQueue`], so changes never scan concurrently. Every asynchronous step
//! compares the sequence number it started with against the current one and
//! drops its results when they differ. Filesystem notifications become partial
//! updates of the displayed session or, when they carry no detail, an
//! aggregated rescan.

use std::{
	future::Future,
	pin::{pin, Pin},
	sync::{
		atomic::{AtomicBool, AtomicU64, Ordering},
		Arc, Weak,
	},
	task::{Context, Poll},
};

use async_channel as chan;
use futures_concurrency::future::Join;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::{
	select, spawn,
	sync::{broadcast, oneshot, Notify},
	task::JoinHandle,
};
use tracing::{debug, error, instrument, trace, warn};

use crate::{
	config::DirectoryModelConfig,
	entry::{Container, Entry, EntryUrl},
	error::ScanError,
	events::EventBus,
	file_list::{FileListModel, SortSpec},
	filter::FileFilter,
	metadata::{MetadataCache, MetadataStore},
	provider::EntryProvider,
	queue::{Aggregator, AsyncQueue},
	scan::{ScanContext, ScanDelta, ScanEvent, ScanOutcome, ScanSession, ScanState},
	selection::Selection,
	volume::{Volume, VolumeManager},
	watcher::{WatchRegistrar, WatcherEvent},
};

mod rescan;

use rescan::RescanScheduler;

/// Published by the [`DirectoryModel`].
#[derive(Debug, Clone)]
pub enum DirectoryModelEvent {
	ScanStarted {
		container: Container,
		sequence: u64,
	},
	/// The displayed list changed while a scan or partial update was running.
	ScanUpdated {
		container: Container,
		changed: usize,
		removed: usize,
	},
	ScanCompleted {
		container: Container,
	},
	ScanFailed {
		container: Container,
		error: ScanError,
	},
	ScanCancelled {
		container: Container,
	},
	/// A rescan replaced the displayed list.
	RescanCompleted {
		container: Container,
		entries: usize,
	},
	DirectoryChanged {
		previous: Option<Container>,
		new: Container,
		volume_changed: bool,
	},
	SelectionChanged {
		indices: Vec<usize>,
		lead_index: Option<usize>,
	},
}

/// How a directory change or search request ended.
#[derive(Debug, Clone)]
pub enum ChangeOutcome {
	Displayed,
	Failed(ScanError),
	/// A newer request took over, nothing of this one was applied.
	Superseded,
}

impl ChangeOutcome {
	pub const fn is_displayed(&self) -> bool {
		matches!(self, Self::Displayed)
	}
}

/// Resolves once a queued directory change or search settled.
///
/// The change runs whether or not this is awaited.
#[derive(Debug)]
#[must_use = "dropping it doesn't cancel the change, but its outcome is lost"]
pub struct DirectoryChange {
	outcome_rx: oneshot::Receiver<ChangeOutcome>,
}

impl DirectoryChange {
	fn ready(outcome: ChangeOutcome) -> Self {
		let (outcome_tx, outcome_rx) = oneshot::channel();
		let _ = outcome_tx.send(outcome);
		Self { outcome_rx }
	}
}

impl Future for DirectoryChange {
	type Output = ChangeOutcome;

	fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
		Pin::new(&mut self.outcome_rx)
			.poll(cx)
			.map(|res| res.unwrap_or(ChangeOutcome::Superseded))
	}
}

/// Entry changes reported by file operations of the host.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum EntriesChange {
	Created(Vec<Entry>),
	Changed(Vec<Entry>),
	Deleted(Vec<EntryUrl>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RequestKind {
	Navigate,
	Search,
}

#[derive(Debug)]
struct ModelState {
	current_container: Option<Container>,
	/// The displayed session.
	current: Option<Arc<ScanSession>>,
	/// The session scanning or taking a partial update right now.
	running: Option<Arc<ScanSession>>,
	/// Directory changes queued but not scanning yet.
	queued_changes: usize,
	/// Refresh flag of a rescan requested while another scan was running.
	pending_rescan: Option<bool>,
	scan_failures: u32,
	file_list: FileListModel,
	selection: Selection,
	search_query: String,
	preferred_sort: SortSpec,
}

#[derive(Debug)]
struct Inner {
	config: DirectoryModelConfig,
	ctx: ScanContext,
	volumes: Arc<dyn VolumeManager>,
	registrar: Option<Arc<dyn WatchRegistrar>>,
	sequence: AtomicU64,
	disposed: AtomicBool,
	queue: AsyncQueue,
	state: Mutex<ModelState>,
	events: EventBus<DirectoryModelEvent>,
	rescans: RescanScheduler,
	aggregator: Aggregator,
	scan_finished: Notify,
	listeners: Mutex<Vec<JoinHandle<()>>>,
}

/// Cheap to clone handle over the shared coordinator.
#[derive(Debug, Clone)]
pub struct DirectoryModel {
	inner: Arc<Inner>,
}

pub struct DirectoryModelBuilder {
	config: DirectoryModelConfig,
	provider: Arc<dyn EntryProvider>,
	volumes: Arc<dyn VolumeManager>,
	filter: Option<Arc<FileFilter>>,
	metadata: Option<Arc<dyn MetadataStore>>,
	registrar: Option<Arc<dyn WatchRegistrar>>,
}

impl DirectoryModelBuilder {
	#[must_use]
	pub fn filter(mut self, filter: Arc<FileFilter>) -> Self {
		self.filter = Some(filter);
		self
	}

	#[must_use]
	pub fn metadata(mut self, metadata: Arc<dyn MetadataStore>) -> Self {
		self.metadata = Some(metadata);
		self
	}

	#[must_use]
	pub fn watch_registrar(mut self, registrar: Arc<dyn WatchRegistrar>) -> Self {
		self.registrar = Some(registrar);
		self
	}

	/// Must be called from within a tokio runtime.
	pub fn build(self) -> DirectoryModel {
		let Self {
			config,
			provider,
			volumes,
			filter,
			metadata,
			registrar,
		} = self;

		let filter = filter.unwrap_or_default();
		let ctx = ScanContext {
			provider,
			filter: Arc::clone(&filter),
			metadata: metadata.unwrap_or_else(|| Arc::new(MetadataCache::new())),
			metadata_chunk_size: config.metadata_chunk_size,
			event_capacity: config.event_capacity,
		};

		let inner = Arc::new_cyclic(|weak: &Weak<Inner>| Inner {
			aggregator: Aggregator::new(config.watcher_aggregation(), {
				let weak = weak.clone();
				move || {
					let weak = weak.clone();
					async move {
						if let Some(inner) = weak.upgrade() {
							trace!("Aggregated watcher notifications, rescanning");
							inner.rescan_soon(true);
						}
					}
				}
			}),
			state: Mutex::new(ModelState {
				current_container: None,
				current: None,
				running: None,
				queued_changes: 0,
				pending_rescan: None,
				scan_failures: 0,
				file_list: FileListModel::empty(),
				selection: Selection::new(config.single_selection),
				search_query: String::new(),
				preferred_sort: SortSpec::default(),
			}),
			events: EventBus::new(config.event_capacity),
			config,
			ctx,
			volumes,
			registrar,
			sequence: AtomicU64::new(0),
			disposed: AtomicBool::new(false),
			queue: AsyncQueue::new(),
			rescans: RescanScheduler::default(),
			scan_finished: Notify::new(),
			listeners: Mutex::new(Vec::new()),
		});

		let filter_listener = spawn(Inner::follow_filter(
			Arc::downgrade(&inner),
			filter.subscribe(),
		));
		inner.listeners.lock().push(filter_listener);

		DirectoryModel { inner }
	}
}

impl DirectoryModel {
	pub fn builder(
		config: DirectoryModelConfig,
		provider: Arc<dyn EntryProvider>,
		volumes: Arc<dyn VolumeManager>,
	) -> DirectoryModelBuilder {
		DirectoryModelBuilder {
			config,
			provider,
			volumes,
			filter: None,
			metadata: None,
			registrar: None,
		}
	}

	pub fn subscribe(&self) -> broadcast::Receiver<DirectoryModelEvent> {
		self.inner.events.subscribe()
	}

	pub fn config(&self) -> &DirectoryModelConfig {
		&self.inner.config
	}

	pub fn filter(&self) -> &Arc<FileFilter> {
		&self.inner.ctx.filter
	}

	/// Start displaying `container`. See [`DirectoryChange`].
	#[instrument(skip(self, container), fields(%container))]
	pub fn change_directory(&self, container: Container) -> DirectoryChange {
		self.inner.enqueue_change(container, RequestKind::Navigate)
	}

	/// Search below the current directory. An empty query leaves an active search.
	#[instrument(skip(self))]
	pub fn search(&self, query: &str) -> DirectoryChange {
		self.inner.search(query.trim())
	}

	/// Enumerate the current container again, resetting the automatic retry budget.
	#[instrument(skip(self))]
	pub fn rescan(&self, refresh: bool) {
		self.inner.state.lock().scan_failures = 0;
		self.inner.rescan(refresh);
	}

	pub fn rescan_soon(&self, refresh: bool) {
		self.inner.rescan_soon(refresh);
	}

	pub fn rescan_later(&self, refresh: bool) {
		self.inner.rescan_later(refresh);
	}

	/// Apply a delta to the displayed session without enumerating again.
	///
	/// Waits for a running scan to finish first. Dropped if a directory change
	/// is queued or the directory changed while waiting.
	pub async fn partial_update(&self, changed: Vec<Entry>, removed: Vec<EntryUrl>) {
		self.inner.partial_update(changed, removed).await;
	}

	pub async fn on_watcher_event(&self, event: WatcherEvent) {
		self.inner.on_watcher_event(event).await;
	}

	/// Feed events of a watcher into the model until the channel closes.
	pub fn attach_watcher(&self, events_rx: chan::Receiver<WatcherEvent>) {
		let weak = Arc::downgrade(&self.inner);

		let handle = spawn(async move {
			while let Ok(event) = events_rx.recv().await {
				let Some(inner) = weak.upgrade() else {
					break;
				};
				inner.on_watcher_event(event).await;
			}
			trace!("Watcher listener finished");
		});

		self.inner.listeners.lock().push(handle);
	}

	pub async fn on_entries_changed(&self, change: EntriesChange) {
		self.inner.on_entries_changed(change).await;
	}

	pub fn current_container(&self) -> Option<Container> {
		self.inner.state.lock().current_container.clone()
	}

	pub fn current_volume(&self) -> Option<Volume> {
		self.current_container()
			.and_then(|container| self.inner.volumes.volume_for_container(&container))
	}

	pub fn volumes(&self) -> &Arc<dyn VolumeManager> {
		&self.inner.volumes
	}

	pub fn sequence(&self) -> u64 {
		self.inner.sequence()
	}

	pub fn is_scanning(&self) -> bool {
		self.inner.state.lock().running.is_some()
	}

	pub fn is_searching(&self) -> bool {
		self.inner
			.state
			.lock()
			.current_container
			.as_ref()
			.is_some_and(Container::is_search)
	}

	pub fn search_query(&self) -> String {
		self.inner.state.lock().search_query.clone()
	}

	/// Snapshot of the displayed list.
	pub fn file_list(&self) -> FileListModel {
		self.inner.state.lock().file_list.clone()
	}

	pub fn entries(&self) -> Vec<Entry> {
		self.inner.state.lock().file_list.entries().to_vec()
	}

	pub fn selection(&self) -> Selection {
		self.inner.state.lock().selection.clone()
	}

	pub fn selected_entries(&self) -> Vec<Entry> {
		let state = self.inner.state.lock();
		state
			.selection
			.indices()
			.filter_map(|index| state.file_list.get(index).cloned())
			.collect()
	}

	/// Select the entries with the given identities, ignoring unknown ones.
	pub fn select_entries(&self, urls: &[EntryUrl]) {
		self.inner.update_selection(|selection, list| {
			selection.clear();
			for url in urls {
				if let Some(index) = list.index_of(url) {
					selection.set_index_selected(index, true);
				}
			}
		});
	}

	pub fn select_index(&self, index: usize) {
		self.inner.update_selection(|selection, list| {
			if index < list.len() {
				selection.select_only(index);
			}
		});
	}

	pub fn clear_selection(&self) {
		self.inner.update_selection(|selection, _| selection.clear());
	}

	pub fn set_check_select_mode(&self, enabled: bool) {
		self.inner
			.update_selection(|selection, _| selection.set_check_select_mode(enabled));
	}

	/// Change the preferred order; containers with a forced order keep theirs.
	pub fn set_sort(&self, sort: SortSpec) {
		self.inner.set_sort(sort);
	}

	/// Cancel the running scan, drop the rescan timer and stop listening.
	#[instrument(skip(self))]
	pub fn dispose(&self) {
		self.inner.dispose();
	}
}

impl Inner {
	fn sequence(&self) -> u64 {
		self.sequence.load(Ordering::SeqCst)
	}

	fn is_current(&self, sequence: u64) -> bool {
		!self.disposed.load(Ordering::SeqCst) && self.sequence() == sequence
	}

	fn enqueue_change(self: &Arc<Self>, container: Container, kind: RequestKind) -> DirectoryChange {
		if self.disposed.load(Ordering::SeqCst) {
			return DirectoryChange::ready(ChangeOutcome::Superseded);
		}

		let sequence = self.sequence.fetch_add(1, Ordering::SeqCst) + 1;

		let running = {
			let mut state = self.state.lock();
			if kind == RequestKind::Navigate {
				state.search_query.clear();
			}
			state.queued_changes += 1;
			state.running.clone()
		};

		if let Some(running) = running {
			running.cancel_scan();
		}
		self.rescans.clear();

		debug!(%sequence, %container, ?kind, "Directory change queued");

		let (outcome_tx, outcome_rx) = oneshot::channel();
		let inner = Arc::clone(self);

		self.queue.run(move |done| async move {
			let outcome = inner.run_change(sequence, container, kind).await;
			// Nobody may be waiting for the outcome
			let _ = outcome_tx.send(outcome);
			done.done();
		});

		DirectoryChange { outcome_rx }
	}

	fn search(self: &Arc<Self>, query: &str) -> DirectoryChange {
		let (current, previous_query) = {
			let state = self.state.lock();
			(state.current_container.clone(), state.search_query.clone())
		};

		let Some(current) = current else {
			debug!("Search requested with nothing displayed");
			return DirectoryChange::ready(ChangeOutcome::Superseded);
		};

		let base = current.base_directory();

		if query.is_empty() {
			if !current.is_search() {
				return DirectoryChange::ready(ChangeOutcome::Displayed);
			}
			self.state.lock().search_query.clear();
			return self.enqueue_change(base, RequestKind::Search);
		}

		if current.is_search() && previous_query == query {
			return DirectoryChange::ready(ChangeOutcome::Displayed);
		}

		let Container::Directory(root) = base else {
			debug!(%base, "Only directories can be searched");
			return DirectoryChange::ready(ChangeOutcome::Superseded);
		};

		self.state.lock().search_query = query.to_string();
		self.enqueue_change(
			Container::Search {
				root,
				query: query.to_string(),
			},
			RequestKind::Search,
		)
	}

	async fn run_change(
		self: &Arc<Self>,
		sequence: u64,
		container: Container,
		kind: RequestKind,
	) -> ChangeOutcome {
		if let Some(registrar) = &self.registrar {
			let target = match &container {
				Container::Synthetic(_) => None,
				other => Some(other.base_directory()),
			};

			if let Err(e) = registrar.change_watched_directory(target.as_ref()).await {
				warn!(?e, %container, "Unable to watch directory;");
			}
		}

		let session = Arc::new(ScanSession::new(container.clone(), self.ctx.clone()));

		let previous = {
			let mut state = self.state.lock();
			state.queued_changes = state.queued_changes.saturating_sub(1);

			if !self.is_current(sequence) {
				trace!(%sequence, "Directory change superseded before scanning");
				return ChangeOutcome::Superseded;
			}

			state.scan_failures = 0;
			let sort = SortSpec::for_container(&container, state.preferred_sort);
			state.file_list = FileListModel::new(sort);
			state.selection.clear();
			state.current = Some(Arc::clone(&session));
			state.running = Some(Arc::clone(&session));
			state.current_container.replace(container.clone())
		};

		self.ctx.metadata.clear_all_cache();

		self.events.emit(DirectoryModelEvent::ScanStarted {
			container: container.clone(),
			sequence,
		});

		let outcome = self
			.drive(sequence, &session, session.scan(false), true)
			.await;
		self.finish_scan(sequence, &session, &outcome);

		match outcome {
			ScanOutcome::Completed if self.is_current(sequence) => {
				if kind == RequestKind::Navigate {
					let volume_id = |container: Option<&Container>| {
						container
							.and_then(|container| self.volumes.volume_for_container(container))
							.map(|volume| volume.id)
					};
					let volume_changed = volume_id(previous.as_ref()) != volume_id(Some(&container));

					debug!(%sequence, %container, %volume_changed, "Directory changed");

					self.events.emit(DirectoryModelEvent::DirectoryChanged {
						previous,
						new: container,
						volume_changed,
					});
				}
				ChangeOutcome::Displayed
			}
			ScanOutcome::Failed(e) if self.is_current(sequence) => ChangeOutcome::Failed(e),
			_ => ChangeOutcome::Superseded,
		}
	}

	/// Run `op` on `session`, applying its deltas to the displayed list when
	/// `live` and the sequence number still matches.
	async fn drive(
		&self,
		sequence: u64,
		session: &Arc<ScanSession>,
		op: impl Future<Output = ScanOutcome>,
		live: bool,
	) -> ScanOutcome {
		let mut events_rx = session.subscribe();
		let mut op = pin!(op);
		let mut lagged = false;

		let outcome = loop {
			select! {
				biased;

				event = events_rx.recv() => match event {
					Ok(ScanEvent::Updated(delta)) if live => {
						self.apply_delta(sequence, session, delta);
					}
					Ok(_) => {}
					Err(broadcast::error::RecvError::Lagged(skipped)) => {
						warn!(%skipped, "Scan events lagged behind, resyncing at the end");
						lagged = true;
					}
					Err(broadcast::error::RecvError::Closed) => {
						error!("Scan session events closed while scanning;");
					}
				},

				outcome = &mut op => break outcome,
			}
		};

		loop {
			match events_rx.try_recv() {
				Ok(ScanEvent::Updated(delta)) if live => self.apply_delta(sequence, session, delta),
				Ok(_) => {}
				Err(broadcast::error::TryRecvError::Lagged(_)) => lagged = true,
				Err(_) => break,
			}
		}

		if lagged && live {
			self.resync(sequence, session);
		}

		outcome
	}

	fn apply_delta(&self, sequence: u64, session: &Arc<ScanSession>, delta: ScanDelta) {
		let container = {
			let mut state = self.state.lock();

			let displayed = state
				.current
				.as_ref()
				.is_some_and(|current| Arc::ptr_eq(current, session));

			if !self.is_current(sequence) || !displayed {
				drop(state);
				trace!(%sequence, "Dropping stale scan results");
				session.cancel_scan();
				return;
			}

			let ModelState {
				file_list,
				selection,
				..
			} = &mut *state;

			let snapshot = selection.snapshot(file_list);
			file_list.apply_delta(delta.changed.iter().cloned(), &delta.removed);
			selection.restore(&snapshot, file_list, false);

			session.container().clone()
		};

		self.events.emit(DirectoryModelEvent::ScanUpdated {
			container,
			changed: delta.changed.len(),
			removed: delta.removed.len(),
		});
	}

	fn resync(&self, sequence: u64, session: &Arc<ScanSession>) {
		let items = session.items();
		let mut state = self.state.lock();

		let displayed = state
			.current
			.as_ref()
			.is_some_and(|current| Arc::ptr_eq(current, session));

		if self.is_current(sequence) && displayed {
			let ModelState {
				file_list,
				selection,
				..
			} = &mut *state;

			let snapshot = selection.snapshot(file_list);
			*file_list = FileListModel::from_entries(items, file_list.sort_spec());
			selection.restore(&snapshot, file_list, false);
		}
	}

	fn finish_scan(self: &Arc<Self>, sequence: u64, session: &Arc<ScanSession>, outcome: &ScanOutcome) {
		let current = self.is_current(sequence);

		let (failures, pending_rescan) = {
			let mut state = self.state.lock();

			if state
				.running
				.as_ref()
				.is_some_and(|running| Arc::ptr_eq(running, session))
			{
				state.running = None;
			}

			match outcome {
				ScanOutcome::Completed if current => state.scan_failures = 0,
				ScanOutcome::Failed(_) if current => state.scan_failures += 1,
				_ => {}
			}

			(state.scan_failures, state.pending_rescan.take())
		};

		self.scan_finished.notify_waiters();

		if !current {
			trace!(%sequence, "Stale scan finished");
			return;
		}

		let container = session.container().clone();

		match outcome {
			ScanOutcome::Completed => {
				self.events
					.emit(DirectoryModelEvent::ScanCompleted { container });
			}
			ScanOutcome::Failed(error) => {
				self.events.emit(DirectoryModelEvent::ScanFailed {
					container,
					error: error.clone(),
				});

				if pending_rescan.is_none() {
					if !error.is_retryable() {
						debug!(?error, "Not retrying scan;");
					} else if failures <= 1 {
						debug!(%failures, "Retrying failed scan later");
						self.rescan_later(true);
					} else {
						warn!(%failures, "Giving up on retrying scan");
					}
				}
			}
			ScanOutcome::Cancelled => {
				self.events
					.emit(DirectoryModelEvent::ScanCancelled { container });
			}
		}

		if let Some(refresh) = pending_rescan {
			self.rescan_soon(refresh);
		}
	}

	fn rescan(self: &Arc<Self>, refresh: bool) {
		let sequence = self.sequence();

		let session = {
			let mut state = self.state.lock();

			if state.queued_changes > 0 {
				trace!("Rescan skipped, a directory change is queued");
				return;
			}

			if state.running.is_some() {
				trace!(%refresh, "Scan running, rescan deferred");
				state.pending_rescan = Some(state.pending_rescan.unwrap_or(false) || refresh);
				return;
			}

			let Some(current) = state.current.as_ref() else {
				return;
			};

			let session = Arc::new(current.clone_for_rescan());
			state.running = Some(Arc::clone(&session));
			session
		};

		self.events.emit(DirectoryModelEvent::ScanStarted {
			container: session.container().clone(),
			sequence,
		});

		let inner = Arc::clone(self);
		spawn(async move {
			let outcome = inner
				.drive(sequence, &session, session.scan(refresh), false)
				.await;

			if matches!(outcome, ScanOutcome::Completed) {
				inner.replace_contents(sequence, &session);
			}

			inner.finish_scan(sequence, &session, &outcome);
		});
	}

	/// Swap in the list of a finished rescan, keeping selected entries selected.
	fn replace_contents(&self, sequence: u64, session: &Arc<ScanSession>) {
		let items = session.items();

		let (container, entries, selection_changed) = {
			let mut state = self.state.lock();
			if !self.is_current(sequence) {
				return;
			}

			let ModelState {
				current,
				file_list,
				selection,
				..
			} = &mut *state;

			let snapshot = selection.snapshot(file_list);
			let previous_selection = selection.clone();

			*file_list = FileListModel::from_entries(items, file_list.sort_spec());
			selection.restore(&snapshot, file_list, true);
			*current = Some(Arc::clone(session));

			(
				session.container().clone(),
				file_list.len(),
				(*selection != previous_selection).then(|| {
					(selection.indices().collect::<Vec<_>>(), selection.lead_index())
				}),
			)
		};

		debug!(%container, %entries, "Rescan replaced the displayed list");

		self.events
			.emit(DirectoryModelEvent::RescanCompleted { container, entries });

		if let Some((indices, lead_index)) = selection_changed {
			self.events
				.emit(DirectoryModelEvent::SelectionChanged { indices, lead_index });
		}
	}

	fn rescan_soon(self: &Arc<Self>, refresh: bool) {
		self.schedule_rescan(self.config.rescan_soon(), refresh);
	}

	fn rescan_later(self: &Arc<Self>, refresh: bool) {
		self.schedule_rescan(self.config.rescan_later(), refresh);
	}

	fn schedule_rescan(self: &Arc<Self>, delay: std::time::Duration, refresh: bool) {
		if self.disposed.load(Ordering::SeqCst) {
			return;
		}

		let sequence = self.sequence();
		let weak = Arc::downgrade(self);

		self.rescans.schedule(delay, move || {
			if let Some(inner) = weak.upgrade() {
				if inner.is_current(sequence) {
					inner.rescan(refresh);
				}
			}
		});
	}

	async fn partial_update(self: &Arc<Self>, changed: Vec<Entry>, removed: Vec<EntryUrl>) {
		self.partial_update_at(self.sequence(), changed, removed).await;
	}

	/// Partial update computed while `sequence` was the current directory.
	async fn partial_update_at(
		self: &Arc<Self>,
		sequence: u64,
		changed: Vec<Entry>,
		removed: Vec<EntryUrl>,
	) {
		loop {
			let mut scan_finished = pin!(self.scan_finished.notified());

			let session = {
				let mut state = self.state.lock();

				if !self.is_current(sequence) {
					trace!(%sequence, "Partial update dropped, directory changed");
					return;
				}

				if state.queued_changes > 0 {
					debug!("Partial update dropped, a directory change will scan fresh contents");
					return;
				}

				if state.running.is_some() {
					// Registered under the lock so the wake up can't be missed
					scan_finished.as_mut().enable();
					None
				} else {
					let Some(current) = state.current.clone() else {
						return;
					};

					if !matches!(current.state(), ScanState::Completed | ScanState::Idle) {
						drop(state);
						debug!("Displayed session never completed, rescanning instead");
						self.rescan_soon(true);
						return;
					}

					state.running = Some(Arc::clone(&current));
					Some(current)
				}
			};

			let Some(session) = session else {
				trace!("Partial update waiting for the running scan");
				scan_finished.await;
				tokio::task::yield_now().await;
				continue;
			};

			let outcome = self
				.drive(sequence, &session, session.update(changed, removed), true)
				.await;
			self.finish_scan(sequence, &session, &outcome);
			return;
		}
	}

	async fn on_watcher_event(self: &Arc<Self>, event: WatcherEvent) {
		let sequence = self.sequence();
		let current = self.state.lock().current_container.clone();

		let Some(current) = current else {
			return;
		};

		if current.base_directory().url() != event.directory {
			trace!(directory = %event.directory, "Ignoring event for another directory");
			return;
		}

		let changed_files = match event.changed_files {
			Some(changed_files) if !current.is_search() => changed_files,
			_ => {
				self.aggregator.run();
				return;
			}
		};

		let (deleted, touched): (Vec<_>, Vec<_>) =
			changed_files.into_iter().partition(|file| file.is_deleted());

		let mut removed = deleted.into_iter().map(|file| file.url).collect::<Vec<_>>();
		let mut changed = Vec::with_capacity(touched.len());

		let resolved = touched
			.iter()
			.map(|file| self.ctx.provider.resolve(&file.url))
			.collect::<Vec<_>>()
			.join()
			.await;

		if !self.is_current(sequence) {
			trace!(%sequence, "Resolved changes dropped, directory changed");
			return;
		}

		for (file, res) in touched.into_iter().zip(resolved) {
			match res {
				Ok(entry) => changed.push(entry),
				Err(e) => {
					// Most likely deleted right after the notification
					warn!(?e, url = %file.url, "Failed to resolve changed entry, removing it;");
					removed.push(file.url);
				}
			}
		}

		self.partial_update_at(sequence, changed, removed).await;
	}

	async fn on_entries_changed(self: &Arc<Self>, change: EntriesChange) {
		let current = self.state.lock().current_container.clone();

		let directory = match current {
			Some(Container::Directory(directory)) => directory,
			Some(_) => {
				self.rescan_soon(true);
				return;
			}
			None => return,
		};

		match change {
			EntriesChange::Deleted(urls) => self.partial_update(Vec::new(), urls).await,
			EntriesChange::Created(entries) | EntriesChange::Changed(entries) => {
				let entries = entries
					.into_iter()
					.filter(|entry| {
						entry
							.url
							.to_path()
							.is_some_and(|path| path.parent() == Some(directory.as_path()))
					})
					.collect::<Vec<_>>();

				if !entries.is_empty() {
					self.partial_update(entries, Vec::new()).await;
				}
			}
		}
	}

	fn update_selection(&self, update: impl FnOnce(&mut Selection, &FileListModel)) {
		let (indices, lead_index): (Vec<usize>, _) = {
			let mut state = self.state.lock();
			let ModelState {
				file_list,
				selection,
				..
			} = &mut *state;

			let before = selection.clone();
			update(selection, file_list);
			selection.retain_valid(file_list.len());

			if *selection == before {
				return;
			}

			(selection.indices().collect(), selection.lead_index())
		};

		self.events
			.emit(DirectoryModelEvent::SelectionChanged { indices, lead_index });
	}

	fn set_sort(&self, sort: SortSpec) {
		let mut state = self.state.lock();
		state.preferred_sort = sort;

		let effective = state
			.current_container
			.as_ref()
			.map_or(sort, |container| SortSpec::for_container(container, sort));

		let ModelState {
			file_list,
			selection,
			..
		} = &mut *state;

		let snapshot = selection.snapshot(file_list);
		file_list.set_sort(effective);
		selection.restore(&snapshot, file_list, false);
	}

	async fn follow_filter(weak: Weak<Self>, mut changes_rx: tokio::sync::watch::Receiver<u64>) {
		while changes_rx.changed().await.is_ok() {
			let Some(inner) = weak.upgrade() else {
				break;
			};
			debug!("Filter changed, rescanning soon");
			inner.rescan_soon(false);
		}
	}

	fn dispose(&self) {
		if self.disposed.swap(true, Ordering::SeqCst) {
			return;
		}

		let running = {
			let mut state = self.state.lock();
			state.pending_rescan = None;
			state.running.clone()
		};

		if let Some(running) = running {
			running.cancel_scan();
		}

		self.rescans.clear();

		for listener in self.listeners.lock().drain(..) {
			listener.abort();
		}

		if let Some(registrar) = self.registrar.clone() {
			spawn(async move {
				if let Err(e) = registrar.change_watched_directory(None).await {
					warn!(?e, "Unable to stop watching on dispose;");
				}
			});
		}

		debug!("Directory model disposed");
	}
}
