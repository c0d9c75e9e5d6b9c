use std::{collections::HashMap, fmt};

use futures::StreamExt;
use parking_lot::Mutex;
use tokio::{select, sync::broadcast, sync::watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace, warn};
use uuid::Uuid;

use crate::{
	entry::{Container, Entry, EntryUrl},
	error::ScanError,
	events::EventBus,
	metadata::MetadataProperty,
};

use super::{ScanContext, ScanDelta, ScanEvent, ScanOutcome, ScanState};

const PREFETCH_PROPERTIES: &[MetadataProperty] = &[
	MetadataProperty::Size,
	MetadataProperty::ModificationTime,
	MetadataProperty::IsDirectory,
];

/// Insertion ordered entries, unique by url.
#[derive(Debug, Default)]
struct SessionItems {
	entries: Vec<Entry>,
	positions: HashMap<EntryUrl, usize>,
}

impl SessionItems {
	fn upsert(&mut self, entry: Entry) {
		match self.positions.get(&entry.url) {
			Some(&index) => self.entries[index] = entry,
			None => {
				self.positions.insert(entry.url.clone(), self.entries.len());
				self.entries.push(entry);
			}
		}
	}

	fn remove(&mut self, urls: &[EntryUrl]) {
		if urls.iter().any(|url| self.positions.contains_key(url)) {
			self.entries.retain(|entry| !urls.contains(&entry.url));
			self.positions = self
				.entries
				.iter()
				.enumerate()
				.map(|(index, entry)| (entry.url.clone(), index))
				.collect();
		}
	}
}

/// One scan of one container.
///
/// A session goes `Idle -> Scanning -> {Completed | Failed | Cancelled}`.
/// A completed session may take partial updates, each of which goes through
/// `Scanning` again and ends with its own terminal event.
pub struct ScanSession {
	id: Uuid,
	container: Container,
	ctx: ScanContext,
	state: watch::Sender<ScanState>,
	items: Mutex<SessionItems>,
	cancel: CancellationToken,
	events: EventBus<ScanEvent>,
}

impl fmt::Debug for ScanSession {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("ScanSession")
			.field("id", &self.id)
			.field("container", &self.container)
			.field("state", &*self.state.borrow())
			.field("items", &self.items.lock().entries.len())
			.finish_non_exhaustive()
	}
}

impl ScanSession {
	pub fn new(container: Container, ctx: ScanContext) -> Self {
		let events = EventBus::new(ctx.event_capacity);

		Self {
			id: Uuid::new_v4(),
			container,
			ctx,
			state: watch::Sender::new(ScanState::Idle),
			items: Mutex::default(),
			cancel: CancellationToken::new(),
			events,
		}
	}

	/// A fresh idle session over the same container, used to build a rescan
	/// while this one stays displayed.
	pub fn clone_for_rescan(&self) -> Self {
		Self::new(self.container.clone(), self.ctx.clone())
	}

	pub const fn id(&self) -> Uuid {
		self.id
	}

	pub const fn container(&self) -> &Container {
		&self.container
	}

	pub const fn is_search(&self) -> bool {
		self.container.is_search()
	}

	pub fn state(&self) -> ScanState {
		*self.state.borrow()
	}

	pub fn watch_state(&self) -> watch::Receiver<ScanState> {
		self.state.subscribe()
	}

	pub fn subscribe(&self) -> broadcast::Receiver<ScanEvent> {
		self.events.subscribe()
	}

	pub fn items(&self) -> Vec<Entry> {
		self.items.lock().entries.clone()
	}

	pub fn len(&self) -> usize {
		self.items.lock().entries.len()
	}

	pub fn is_empty(&self) -> bool {
		self.items.lock().entries.is_empty()
	}

	/// Enumerate the container, publishing batches as they arrive.
	///
	/// Only an idle session can scan. Batches that land after the session left
	/// `Scanning` are dropped.
	pub async fn scan(&self, refresh: bool) -> ScanOutcome {
		if !self.transition(&[ScanState::Idle], ScanState::Scanning) {
			error!(
				session_id = %self.id,
				state = ?self.state(),
				"Tried to scan a session that already ran;"
			);
			return self.outcome();
		}

		debug!(session_id = %self.id, container = %self.container, %refresh, "Scan started");

		let enumeration = select! {
			biased;
			() = self.cancel.cancelled() => return ScanOutcome::Cancelled,
			enumeration = self.ctx.provider.enumerate(&self.container, refresh) => enumeration,
		};

		let mut batches = match enumeration {
			Ok(batches) => batches,
			Err(e) => return self.fail(e),
		};

		loop {
			let next = select! {
				biased;
				() = self.cancel.cancelled() => return ScanOutcome::Cancelled,
				next = batches.next() => next,
			};

			match next {
				Some(Ok(batch)) => {
					if !self.add_batch(batch, refresh).await {
						return self.outcome();
					}
				}
				Some(Err(e)) => return self.fail(e),
				None => break,
			}
		}

		self.complete()
	}

	/// Apply an incremental delta without enumerating again.
	///
	/// Entries rejected by the filter are treated as removed.
	pub async fn update(&self, changed: Vec<Entry>, mut removed: Vec<EntryUrl>) -> ScanOutcome {
		if !self.transition(&[ScanState::Idle, ScanState::Completed], ScanState::Scanning) {
			warn!(
				session_id = %self.id,
				state = ?self.state(),
				"Partial update refused, session is not settled"
			);
			return self.outcome();
		}

		let (accepted, rejected): (Vec<_>, Vec<_>) = changed
			.into_iter()
			.partition(|entry| self.ctx.filter.accepts(entry));
		removed.extend(rejected.into_iter().map(|entry| entry.url));

		let created = {
			let items = self.items.lock();
			accepted
				.iter()
				.filter(|entry| !items.positions.contains_key(&entry.url))
				.cloned()
				.collect::<Vec<_>>()
		};

		if !removed.is_empty() {
			self.ctx.metadata.notify_entries_removed(&removed);
		}
		if !created.is_empty() {
			self.ctx.metadata.notify_entries_created(&created);
		}

		if !self.prefetch(&accepted, true).await {
			return self.outcome();
		}

		trace!(
			session_id = %self.id,
			changed = accepted.len(),
			removed = removed.len(),
			"Applying partial update"
		);

		if !self.publish(ScanDelta {
			changed: accepted,
			removed,
		}) {
			return self.outcome();
		}

		self.complete()
	}

	/// Stop a running scan. Synchronous: the session is `Cancelled` once this
	/// returns. Does nothing unless the session is scanning.
	pub fn cancel_scan(&self) {
		let _items = self.items.lock();

		if self.transition(&[ScanState::Scanning], ScanState::Cancelled) {
			self.cancel.cancel();
			debug!(session_id = %self.id, "Scan cancelled");
			self.events.emit(ScanEvent::Cancelled);
		}
	}

	/// Filter, prefetch and store a batch. Returns false if the session stopped
	/// scanning in the meantime.
	async fn add_batch(&self, batch: Vec<Entry>, refresh: bool) -> bool {
		let accepted = batch
			.into_iter()
			.filter(|entry| self.ctx.filter.accepts(entry))
			.collect::<Vec<_>>();

		if accepted.is_empty() {
			return self.state() == ScanState::Scanning;
		}

		if !self.prefetch(&accepted, refresh).await {
			return false;
		}

		self.publish(ScanDelta {
			changed: accepted,
			removed: Vec::new(),
		})
	}

	/// Store `delta` and announce it, unless the session stopped scanning.
	///
	/// Runs under the items lock, which `cancel_scan` takes as well, so nothing is
	/// published after `Cancelled`.
	fn publish(&self, delta: ScanDelta) -> bool {
		let mut items = self.items.lock();

		if self.state() != ScanState::Scanning {
			return false;
		}

		for entry in &delta.changed {
			items.upsert(entry.clone());
		}
		items.remove(&delta.removed);

		self.events.emit(ScanEvent::Updated(delta));

		true
	}

	async fn prefetch(&self, entries: &[Entry], refresh: bool) -> bool {
		for chunk in entries.chunks(self.ctx.metadata_chunk_size.max(1)) {
			if self.state() != ScanState::Scanning {
				return false;
			}

			self.ctx
				.metadata
				.get(chunk, PREFETCH_PROPERTIES, refresh)
				.await;
		}

		self.state() == ScanState::Scanning
	}

	fn complete(&self) -> ScanOutcome {
		if self.transition(&[ScanState::Scanning], ScanState::Completed) {
			debug!(session_id = %self.id, items = self.len(), "Scan completed");
			self.events.emit(ScanEvent::Completed);
		}
		self.outcome()
	}

	fn fail(&self, e: ScanError) -> ScanOutcome {
		if self.transition(&[ScanState::Scanning], ScanState::Failed) {
			warn!(?e, session_id = %self.id, container = %self.container, "Scan failed;");
			self.events.emit(ScanEvent::Failed(e.clone()));
			return ScanOutcome::Failed(e);
		}
		self.outcome()
	}

	fn outcome(&self) -> ScanOutcome {
		match self.state() {
			ScanState::Completed => ScanOutcome::Completed,
			ScanState::Failed => {
				ScanOutcome::Failed(ScanError::Provider("scan already failed".to_string()))
			}
			ScanState::Idle | ScanState::Scanning | ScanState::Cancelled => ScanOutcome::Cancelled,
		}
	}

	fn transition(&self, from: &[ScanState], to: ScanState) -> bool {
		self.state.send_if_modified(|state| {
			if from.contains(state) {
				*state = to;
				true
			} else {
				false
			}
		})
	}
}

#[cfg(test)]
mod tests {
	use std::sync::Arc;

	use async_trait::async_trait;
	use futures::stream;
	use pretty_assertions::assert_eq;
	use tokio::sync::Notify;

	use super::*;
	use crate::{
		filter::FileFilter,
		metadata::MetadataCache,
		provider::{EntryProvider, EntryStream},
	};

	#[derive(Debug, Default)]
	struct Batches {
		batches: Vec<Vec<Entry>>,
		fail_after: Option<usize>,
		gate: Option<Arc<Notify>>,
	}

	#[async_trait]
	impl EntryProvider for Batches {
		async fn enumerate(&self, _: &Container, _: bool) -> Result<EntryStream, ScanError> {
			let mut items = self
				.batches
				.iter()
				.cloned()
				.map(Ok)
				.collect::<Vec<Result<Vec<Entry>, ScanError>>>();
			if let Some(at) = self.fail_after {
				items.truncate(at);
				items.push(Err(ScanError::Provider("boom".into())));
			}

			let gate = self.gate.clone();
			Ok(Box::pin(stream::iter(items).then(move |item| {
				let gate = gate.clone();
				async move {
					if let Some(gate) = gate {
						gate.notified().await;
					}
					item
				}
			})))
		}

		async fn resolve(&self, url: &EntryUrl) -> Result<Entry, ScanError> {
			Err(ScanError::NotFound(url.clone()))
		}
	}

	fn file(name: &str) -> Entry {
		Entry::file(EntryUrl::new(format!("file:///d/{name}")), name, 1)
	}

	fn session(provider: Batches) -> ScanSession {
		ScanSession::new(
			Container::directory("/d"),
			ScanContext::new(
				Arc::new(provider),
				Arc::new(FileFilter::new()),
				Arc::new(MetadataCache::new()),
			),
		)
	}

	fn names(entries: &[Entry]) -> Vec<&str> {
		entries.iter().map(|e| e.name.as_str()).collect()
	}

	#[tokio::test]
	async fn scan_publishes_batches_then_completes() {
		let session = session(Batches {
			batches: vec![vec![file("a"), file(".hidden")], vec![file("b")]],
			..Default::default()
		});
		let mut rx = session.subscribe();

		assert!(matches!(session.scan(false).await, ScanOutcome::Completed));
		assert_eq!(names(&session.items()), vec!["a", "b"]);

		assert!(matches!(rx.recv().await.unwrap(), ScanEvent::Updated(_)));
		assert!(matches!(rx.recv().await.unwrap(), ScanEvent::Updated(_)));
		assert!(matches!(rx.recv().await.unwrap(), ScanEvent::Completed));
		assert!(rx.try_recv().is_err());

		// A finished session can't scan again
		assert!(matches!(session.scan(false).await, ScanOutcome::Completed));
	}

	#[tokio::test]
	async fn failures_end_with_a_single_event() {
		let session = session(Batches {
			batches: vec![vec![file("a")], vec![file("b")]],
			fail_after: Some(1),
			..Default::default()
		});
		let mut rx = session.subscribe();

		assert!(matches!(session.scan(false).await, ScanOutcome::Failed(_)));
		assert_eq!(session.state(), ScanState::Failed);
		assert!(matches!(rx.recv().await.unwrap(), ScanEvent::Updated(_)));
		assert!(matches!(rx.recv().await.unwrap(), ScanEvent::Failed(_)));
		assert!(rx.try_recv().is_err());
	}

	#[tokio::test]
	async fn cancel_is_immediate_and_idempotent() {
		let gate = Arc::new(Notify::new());
		let session = Arc::new(session(Batches {
			batches: vec![vec![file("a")]],
			gate: Some(Arc::clone(&gate)),
			..Default::default()
		}));
		let mut rx = session.subscribe();

		let scan = tokio::spawn({
			let session = Arc::clone(&session);
			async move { session.scan(false).await }
		});

		let mut state = session.watch_state();
		state.wait_for(|state| *state == ScanState::Scanning).await.unwrap();

		session.cancel_scan();
		assert_eq!(session.state(), ScanState::Cancelled);
		session.cancel_scan();

		// The late batch is dropped
		gate.notify_one();
		assert!(matches!(scan.await.unwrap(), ScanOutcome::Cancelled));
		assert!(session.is_empty());

		assert!(matches!(rx.recv().await.unwrap(), ScanEvent::Cancelled));
		assert!(rx.try_recv().is_err());
	}

	#[tokio::test]
	async fn update_replaces_appends_and_removes() {
		let session = session(Batches {
			batches: vec![vec![file("a"), file("b"), file("c")]],
			..Default::default()
		});
		session.scan(false).await;
		let mut rx = session.subscribe();

		let mut bigger_a = file("a");
		bigger_a.size = 99;

		let outcome = session
			.update(vec![bigger_a, file("d"), file(".e")], vec![file("b").url])
			.await;
		assert!(matches!(outcome, ScanOutcome::Completed));

		let items = session.items();
		assert_eq!(names(&items), vec!["a", "c", "d"]);
		assert_eq!(items[0].size, 99);

		match rx.recv().await.unwrap() {
			ScanEvent::Updated(delta) => {
				assert_eq!(names(&delta.changed), vec!["a", "d"]);
				assert_eq!(delta.removed, vec![file("b").url, file(".e").url]);
			}
			other => panic!("unexpected event: {other:?}"),
		}
		assert!(matches!(rx.recv().await.unwrap(), ScanEvent::Completed));
	}

	#[tokio::test]
	async fn clones_start_empty() {
		let session = session(Batches {
			batches: vec![vec![file("a")]],
			..Default::default()
		});
		session.scan(false).await;

		let clone = session.clone_for_rescan();
		assert_eq!(clone.state(), ScanState::Idle);
		assert!(clone.is_empty());
		assert_eq!(clone.container(), session.container());
		assert_ne!(clone.id(), session.id());
	}
}
