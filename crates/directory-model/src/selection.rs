//! Selection over the displayed [`FileListModel`].

use std::collections::BTreeSet;

use crate::{entry::EntryUrl, file_list::FileListModel};

/// Indices into the current list plus a lead index.
///
/// Indices are only ever valid for the list they were made against, whenever
/// the list changes the coordinator goes through [`Selection::snapshot`] and
/// [`Selection::restore`] so selected entries follow their identity.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Selection {
	indices: BTreeSet<usize>,
	lead_index: Option<usize>,
	check_select_mode: bool,
	single: bool,
}

/// Identity based copy of a [`Selection`], independent of list positions.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SelectionSnapshot {
	urls: Vec<EntryUrl>,
	lead_url: Option<EntryUrl>,
	max_index: Option<usize>,
	check_select_mode: bool,
}

impl SelectionSnapshot {
	pub fn urls(&self) -> &[EntryUrl] {
		&self.urls
	}
}

impl Selection {
	pub fn new(single: bool) -> Self {
		Self {
			single,
			..Default::default()
		}
	}

	pub const fn is_single(&self) -> bool {
		self.single
	}

	pub fn indices(&self) -> impl Iterator<Item = usize> + '_ {
		self.indices.iter().copied()
	}

	pub const fn lead_index(&self) -> Option<usize> {
		self.lead_index
	}

	pub fn len(&self) -> usize {
		self.indices.len()
	}

	pub fn is_empty(&self) -> bool {
		self.indices.is_empty()
	}

	pub fn contains(&self, index: usize) -> bool {
		self.indices.contains(&index)
	}

	pub const fn check_select_mode(&self) -> bool {
		self.check_select_mode
	}

	pub fn set_check_select_mode(&mut self, enabled: bool) {
		self.check_select_mode = enabled;
	}

	/// Select `index` alone and make it the lead.
	pub fn select_only(&mut self, index: usize) {
		self.indices.clear();
		self.indices.insert(index);
		self.lead_index = Some(index);
	}

	/// Add or remove `index`, a single-selection model keeps at most one index.
	pub fn set_index_selected(&mut self, index: usize, selected: bool) {
		if selected {
			if self.single {
				self.indices.clear();
			}
			self.indices.insert(index);
			self.lead_index = Some(index);
		} else {
			self.indices.remove(&index);
			if self.lead_index == Some(index) {
				self.lead_index = self.indices.iter().next().copied();
			}
		}
	}

	pub fn clear(&mut self) {
		self.indices.clear();
		self.lead_index = None;
	}

	/// Drop indices that fall outside a list of `len` entries.
	pub fn retain_valid(&mut self, len: usize) {
		self.indices.retain(|&index| index < len);
		if self.lead_index.is_some_and(|lead| lead >= len) {
			self.lead_index = self.indices.iter().next_back().copied();
		}
	}

	pub fn selected_urls(&self, list: &FileListModel) -> Vec<EntryUrl> {
		self.indices
			.iter()
			.filter_map(|&index| list.get(index).map(|entry| entry.url.clone()))
			.collect()
	}

	pub fn snapshot(&self, list: &FileListModel) -> SelectionSnapshot {
		SelectionSnapshot {
			urls: self.selected_urls(list),
			lead_url: self
				.lead_index
				.and_then(|lead| list.get(lead))
				.map(|entry| entry.url.clone()),
			max_index: self.indices.iter().next_back().copied(),
			check_select_mode: self.check_select_mode,
		}
	}

	/// Re-select by identity in `list`.
	///
	/// With `fallback`, used when a whole list is swapped in, losing every
	/// selected entry selects the one now sitting closest to where the old
	/// selection ended instead.
	pub fn restore(&mut self, snapshot: &SelectionSnapshot, list: &FileListModel, fallback: bool) {
		self.clear();
		self.check_select_mode = snapshot.check_select_mode;

		for url in &snapshot.urls {
			if let Some(index) = list.index_of(url) {
				self.indices.insert(index);
				if self.single {
					break;
				}
			}
		}

		if !self.indices.is_empty() {
			self.lead_index = snapshot
				.lead_url
				.as_ref()
				.and_then(|url| list.index_of(url))
				.filter(|index| self.indices.contains(index))
				.or_else(|| self.indices.iter().next().copied());
			return;
		}

		if let (true, Some(max_index), false) = (fallback, snapshot.max_index, list.is_empty()) {
			let count = snapshot.urls.len().max(1);
			let index = (max_index + 2).saturating_sub(count).min(list.len()).max(1) - 1;
			self.select_only(index);
		}
	}
}

#[cfg(test)]
mod tests {
	use pretty_assertions::assert_eq;

	use super::*;
	use crate::{entry::Entry, file_list::SortSpec};

	fn list(names: &[&str]) -> FileListModel {
		FileListModel::from_entries(
			names
				.iter()
				.map(|name| Entry::file(EntryUrl::new(format!("file:///d/{name}")), *name, 1)),
			SortSpec::default(),
		)
	}

	fn selected_names(selection: &Selection, list: &FileListModel) -> Vec<String> {
		selection
			.indices()
			.map(|index| list.get(index).unwrap().name.clone())
			.collect()
	}

	#[test]
	fn follows_identity_across_replacement() {
		let before = list(&["A", "B", "C", "E"]);
		let mut selection = Selection::new(false);
		for index in 0..3 {
			selection.set_index_selected(index, true);
		}
		selection.set_check_select_mode(true);

		let snapshot = selection.snapshot(&before);
		let after = list(&["B", "C", "D"]);
		selection.restore(&snapshot, &after, true);

		assert_eq!(selected_names(&selection, &after), vec!["B", "C"]);
		assert!(selection.check_select_mode());
		assert_eq!(selection.lead_index(), Some(1));
	}

	#[test]
	fn falls_back_near_the_old_position() {
		let before = list(&["a", "b", "c", "d", "e"]);
		let mut selection = Selection::new(false);
		selection.set_index_selected(3, true);
		selection.set_index_selected(4, true);

		let snapshot = selection.snapshot(&before);
		let after = list(&["a", "b", "c"]);
		selection.restore(&snapshot, &after, true);

		// min(4 - 2 + 2, 3) - 1
		assert_eq!(selection.indices().collect::<Vec<_>>(), vec![2]);
		assert_eq!(selection.lead_index(), Some(2));

		let mut no_fallback = Selection::new(false);
		no_fallback.set_index_selected(4, true);
		let snapshot = no_fallback.snapshot(&before);
		no_fallback.restore(&snapshot, &after, false);
		assert!(no_fallback.is_empty());
	}

	#[test]
	fn single_mode_keeps_one_index() {
		let mut selection = Selection::new(true);
		selection.set_index_selected(1, true);
		selection.set_index_selected(2, true);
		assert_eq!(selection.indices().collect::<Vec<_>>(), vec![2]);

		selection.retain_valid(2);
		assert!(selection.is_empty());
		assert_eq!(selection.lead_index(), None);
	}
}
