#![allow(dead_code, clippy::unwrap_used)]

use std::{
	collections::{HashMap, VecDeque},
	path::Path,
	sync::Arc,
	time::Duration,
};

use async_stream::try_stream;
use async_trait::async_trait;
use futures::Stream;
use parking_lot::Mutex;
use sd_directory_model::{
	metadata::{EntryMetadata, MetadataProperty},
	Container, DirectoryModel, DirectoryModelConfig, DirectoryModelEvent, Entry, EntryProvider,
	EntryStream, EntryUrl, MetadataStore, ScanError, VolumeRegistry,
};
use tokio::{
	sync::{broadcast, watch},
	time::timeout,
};

/// Holds back every batch of a container until opened.
#[derive(Debug)]
pub struct Gate(watch::Sender<bool>);

impl Gate {
	pub fn open(&self) {
		self.0.send_replace(true);
	}
}

/// Provider serving canned listings, with failures and gates on demand.
#[derive(Debug, Default)]
pub struct MockProvider {
	listings: Mutex<HashMap<Container, Vec<Entry>>>,
	failures: Mutex<HashMap<Container, VecDeque<ScanError>>>,
	gates: Mutex<HashMap<Container, watch::Receiver<bool>>>,
	resolve_gate: Mutex<Option<watch::Receiver<bool>>>,
	enumerations: Mutex<Vec<(Container, bool)>>,
	resolutions: Mutex<Vec<EntryUrl>>,
}

impl MockProvider {
	pub fn new() -> Arc<Self> {
		Arc::new(Self::default())
	}

	pub fn set_listing(&self, container: &Container, entries: Vec<Entry>) {
		self.listings.lock().insert(container.clone(), entries);
	}

	/// The next enumeration of `container` fails with `error`.
	pub fn fail_next(&self, container: &Container, error: ScanError) {
		self.failures
			.lock()
			.entry(container.clone())
			.or_default()
			.push_back(error);
	}

	pub fn gate(&self, container: &Container) -> Gate {
		let (gate_tx, gate_rx) = watch::channel(false);
		self.gates.lock().insert(container.clone(), gate_rx);
		Gate(gate_tx)
	}

	/// Every later `resolve` waits until the returned gate is opened.
	pub fn hold_resolves(&self) -> Gate {
		let (gate_tx, gate_rx) = watch::channel(false);
		*self.resolve_gate.lock() = Some(gate_rx);
		Gate(gate_tx)
	}

	pub fn resolutions(&self) -> usize {
		self.resolutions.lock().len()
	}

	pub fn enumerations(&self, container: &Container) -> Vec<bool> {
		self.enumerations
			.lock()
			.iter()
			.filter(|(enumerated, _)| enumerated == container)
			.map(|(_, refresh)| *refresh)
			.collect()
	}
}

#[async_trait]
impl EntryProvider for MockProvider {
	async fn enumerate(&self, container: &Container, refresh: bool) -> Result<EntryStream, ScanError> {
		self.enumerations.lock().push((container.clone(), refresh));

		let entries = self
			.listings
			.lock()
			.get(container)
			.cloned()
			.unwrap_or_default();
		let failure = self
			.failures
			.lock()
			.get_mut(container)
			.and_then(VecDeque::pop_front);
		let gate = self.gates.lock().get(container).cloned();

		Ok(Box::pin(batches(entries, failure, gate)))
	}

	async fn resolve(&self, url: &EntryUrl) -> Result<Entry, ScanError> {
		self.resolutions.lock().push(url.clone());

		let gate = self.resolve_gate.lock().clone();
		if let Some(mut gate) = gate {
			let _opened = gate.wait_for(|open| *open).await.is_ok();
		}

		self.listings
			.lock()
			.values()
			.flatten()
			.find(|entry| entry.url == *url)
			.cloned()
			.ok_or_else(|| ScanError::NotFound(url.clone()))
	}
}

fn batches(
	entries: Vec<Entry>,
	failure: Option<ScanError>,
	gate: Option<watch::Receiver<bool>>,
) -> impl Stream<Item = Result<Vec<Entry>, ScanError>> + Send + 'static {
	try_stream! {
		if let Some(mut gate) = gate {
			let _opened = gate.wait_for(|open| *open).await.is_ok();
		}

		if let Some(e) = failure {
			Err::<(), _>(e)?;
		}

		for batch in entries.chunks(2) {
			yield batch.to_vec();
		}
	}
}

/// Metadata store that never touches the filesystem.
#[derive(Debug, Default)]
pub struct NoMetadata;

#[async_trait]
impl MetadataStore for NoMetadata {
	async fn get(
		&self,
		entries: &[Entry],
		_properties: &[MetadataProperty],
		_refresh: bool,
	) -> Vec<EntryMetadata> {
		vec![EntryMetadata::default(); entries.len()]
	}

	fn notify_entries_created(&self, _entries: &[Entry]) {}

	fn notify_entries_removed(&self, _urls: &[EntryUrl]) {}
}

pub fn file(directory: impl AsRef<Path>, name: &str) -> Entry {
	Entry::file(EntryUrl::from_path(directory.as_ref().join(name)), name, 1)
}

pub fn names(entries: &[Entry]) -> Vec<String> {
	entries.iter().map(|entry| entry.name.clone()).collect()
}

pub fn model(provider: &Arc<MockProvider>, volumes: &Arc<VolumeRegistry>) -> DirectoryModel {
	DirectoryModel::builder(
		DirectoryModelConfig::default(),
		provider.clone(),
		volumes.clone(),
	)
	.metadata(Arc::new(NoMetadata))
	.build()
}

/// Wait for the first event accepted by `pick`, skipping the others.
pub async fn wait_for<T>(
	events_rx: &mut broadcast::Receiver<DirectoryModelEvent>,
	mut pick: impl FnMut(&DirectoryModelEvent) -> Option<T>,
) -> T {
	timeout(Duration::from_secs(10), async {
		loop {
			let event = events_rx.recv().await.unwrap();
			if let Some(picked) = pick(&event) {
				return picked;
			}
		}
	})
	.await
	.unwrap()
}

/// Every event published so far, without waiting.
pub fn drain(events_rx: &mut broadcast::Receiver<DirectoryModelEvent>) -> Vec<DirectoryModelEvent> {
	let mut events = Vec::new();
	while let Ok(event) = events_rx.try_recv() {
		events.push(event);
	}
	events
}
