//! The sorted, identity-unique list of entries being displayed.

use std::{
	cmp::Ordering,
	collections::{HashMap, HashSet},
	mem,
};

use serde::{Deserialize, Serialize};

use crate::entry::{Container, Entry, EntryUrl, SyntheticRoot};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum SortField {
	#[default]
	Name,
	Size,
	ModificationTime,
	Type,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum SortDirection {
	#[default]
	Ascending,
	Descending,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct SortSpec {
	pub field: SortField,
	pub direction: SortDirection,
}

impl SortSpec {
	pub const fn new(field: SortField, direction: SortDirection) -> Self {
		Self { field, direction }
	}

	/// The order used for `container`, given what the user last picked.
	///
	/// `Recent` always lists the newest files first.
	pub fn for_container(container: &Container, preferred: Self) -> Self {
		match container.synthetic_root() {
			Some(SyntheticRoot::Recent) => {
				Self::new(SortField::ModificationTime, SortDirection::Descending)
			}
			None => preferred,
		}
	}

	fn compare(&self, a: &Entry, b: &Entry) -> Ordering {
		// Directories always come first, whatever the direction
		match (a.is_directory(), b.is_directory()) {
			(true, false) => return Ordering::Less,
			(false, true) => return Ordering::Greater,
			_ => {}
		}

		let by_name = || {
			a.name
				.to_lowercase()
				.cmp(&b.name.to_lowercase())
				.then_with(|| a.url.cmp(&b.url))
		};

		let ordering = match self.field {
			SortField::Name => by_name(),
			SortField::Size => a.size.cmp(&b.size).then_with(by_name),
			SortField::ModificationTime => a.modified_at.cmp(&b.modified_at).then_with(by_name),
			SortField::Type => a.extension().cmp(&b.extension()).then_with(by_name),
		};

		match self.direction {
			SortDirection::Ascending => ordering,
			SortDirection::Descending => ordering.reverse(),
		}
	}
}

/// Entries of the displayed container, never holding two entries with the same url.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FileListModel {
	entries: Vec<Entry>,
	positions: HashMap<EntryUrl, usize>,
	sort: SortSpec,
}

impl FileListModel {
	pub fn new(sort: SortSpec) -> Self {
		Self {
			entries: Vec::new(),
			positions: HashMap::new(),
			sort,
		}
	}

	/// The permanently empty list shown while no directory is open.
	pub fn empty() -> Self {
		Self::default()
	}

	pub fn from_entries(entries: impl IntoIterator<Item = Entry>, sort: SortSpec) -> Self {
		let mut list = Self::new(sort);
		list.apply_delta(entries, &[]);
		list
	}

	pub fn entries(&self) -> &[Entry] {
		&self.entries
	}

	pub fn get(&self, index: usize) -> Option<&Entry> {
		self.entries.get(index)
	}

	pub fn len(&self) -> usize {
		self.entries.len()
	}

	pub fn is_empty(&self) -> bool {
		self.entries.is_empty()
	}

	pub fn index_of(&self, url: &EntryUrl) -> Option<usize> {
		self.positions.get(url).copied()
	}

	pub fn contains(&self, url: &EntryUrl) -> bool {
		self.positions.contains_key(url)
	}

	pub const fn sort_spec(&self) -> SortSpec {
		self.sort
	}

	pub fn set_sort(&mut self, sort: SortSpec) {
		if self.sort != sort {
			self.sort = sort;
			self.resort();
		}
	}

	/// Replace entries matching `changed`, add the new ones and drop `removed`.
	///
	/// The list is kept sorted by merging the sorted delta into it, a url both
	/// changed and removed ends up removed.
	pub fn apply_delta(&mut self, changed: impl IntoIterator<Item = Entry>, removed: &[EntryUrl]) {
		let removed = removed.iter().collect::<HashSet<_>>();

		// Later duplicates win, as they would replacing in place
		let incoming = changed
			.into_iter()
			.filter(|entry| !removed.contains(&entry.url))
			.map(|entry| (entry.url.clone(), entry))
			.collect::<HashMap<_, _>>();

		if incoming.is_empty() && removed.is_empty() {
			return;
		}

		// Replaced entries come back at their new position with the merge
		self.entries
			.retain(|entry| !removed.contains(&entry.url) && !incoming.contains_key(&entry.url));

		let sort = self.sort;
		let mut incoming = incoming.into_values().collect::<Vec<_>>();
		incoming.sort_by(|a, b| sort.compare(a, b));

		let existing = mem::take(&mut self.entries);
		let mut merged = Vec::with_capacity(existing.len() + incoming.len());
		let mut incoming = incoming.into_iter().peekable();

		for entry in existing {
			while let Some(next) =
				incoming.next_if(|next| sort.compare(next, &entry) == Ordering::Less)
			{
				merged.push(next);
			}
			merged.push(entry);
		}
		merged.extend(incoming);

		self.entries = merged;
		self.reindex();
	}

	/// Remove the entries at `indices`, given in any order.
	///
	/// Indices are handled from the highest down so earlier removals never shift
	/// the ones still to come. Duplicates and out of range indices are ignored.
	pub fn remove_indices(&mut self, indices: &[usize]) -> Vec<Entry> {
		let mut indices = indices
			.iter()
			.copied()
			.filter(|&index| index < self.entries.len())
			.collect::<Vec<_>>();
		indices.sort_unstable_by(|a, b| b.cmp(a));
		indices.dedup();

		let removed = indices
			.into_iter()
			.map(|index| self.entries.remove(index))
			.collect::<Vec<_>>();

		self.reindex();
		removed
	}

	pub fn clear(&mut self) {
		self.entries.clear();
		self.positions.clear();
	}

	fn resort(&mut self) {
		let sort = self.sort;
		self.entries.sort_by(|a, b| sort.compare(a, b));
		self.reindex();
	}

	fn reindex(&mut self) {
		self.positions = self
			.entries
			.iter()
			.enumerate()
			.map(|(index, entry)| (entry.url.clone(), index))
			.collect();
	}
}
