#![allow(clippy::unwrap_used)]

use std::{
	fs::{self, File},
	path::Path,
	sync::Arc,
	time::{Duration, SystemTime},
};

use futures::TryStreamExt;
use pretty_assertions::assert_eq;
use sd_directory_model::{
	Container, DirectoryModel, DirectoryModelConfig, DirectoryWatcher, Entry, EntryProvider,
	LocalFsProvider, SyntheticRoot, VolumeRegistry,
};
use tempfile::tempdir;
use tokio::time::{sleep, timeout};

mod common;

use common::names;

const DAY: Duration = Duration::from_secs(24 * 60 * 60);

fn touch(path: &Path, age: Duration) {
	fs::write(path, path.to_string_lossy().as_bytes()).unwrap();
	File::options()
		.write(true)
		.open(path)
		.unwrap()
		.set_modified(SystemTime::now() - age)
		.unwrap();
}

async fn collect(provider: &LocalFsProvider, container: &Container) -> Vec<Entry> {
	provider
		.enumerate(container, false)
		.await
		.unwrap()
		.try_collect::<Vec<_>>()
		.await
		.unwrap()
		.concat()
}

#[tokio::test]
async fn searches_match_names_below_the_root() {
	let dir = tempdir().unwrap();
	fs::create_dir_all(dir.path().join("a")).unwrap();
	fs::create_dir_all(dir.path().join("b/deeper")).unwrap();
	fs::write(dir.path().join("a/cat.txt"), "meow").unwrap();
	fs::write(dir.path().join("b/deeper/Category.md"), "# cats").unwrap();
	fs::write(dir.path().join("dog.txt"), "woof").unwrap();

	let search = Container::Search {
		root: dir.path().to_path_buf(),
		query: "cat".into(),
	};

	let provider = LocalFsProvider::new(&DirectoryModelConfig::default());
	let mut found = names(&collect(&provider, &search).await);
	found.sort();
	assert_eq!(found, vec!["Category.md", "cat.txt"]);

	let capped = LocalFsProvider::new(&DirectoryModelConfig {
		search_max_results: 1,
		..Default::default()
	});
	assert_eq!(collect(&capped, &search).await.len(), 1);
}

#[tokio::test]
async fn recent_lists_newest_files_within_the_window() {
	let dir = tempdir().unwrap();
	fs::create_dir(dir.path().join("nested")).unwrap();
	touch(&dir.path().join("old.txt"), 60 * DAY);
	touch(&dir.path().join("yesterday.txt"), DAY);
	touch(&dir.path().join("nested/now.txt"), Duration::ZERO);

	let config = DirectoryModelConfig::default();
	let provider = LocalFsProvider::new(&config).with_recent_roots([dir.path().to_path_buf()]);
	let recent = Container::Synthetic(SyntheticRoot::Recent);

	assert_eq!(
		names(&collect(&provider, &recent).await),
		vec!["now.txt", "yesterday.txt"]
	);

	// The model keeps the newest first order whatever the preferred sort
	let model = DirectoryModel::builder(
		config,
		Arc::new(provider),
		Arc::new(VolumeRegistry::new()),
	)
	.build();

	assert!(model.change_directory(recent).await.is_displayed());
	assert_eq!(names(&model.entries()), vec!["now.txt", "yesterday.txt"]);
}

#[tokio::test]
async fn watched_directories_stay_in_sync() {
	let dir = tempdir().unwrap();
	let root = dir.path().canonicalize().unwrap();
	fs::write(root.join("existing.txt"), "x").unwrap();

	let config = DirectoryModelConfig::default();
	let watcher = Arc::new(DirectoryWatcher::new().unwrap());

	let model = DirectoryModel::builder(
		config.clone(),
		Arc::new(LocalFsProvider::new(&config)),
		Arc::new(VolumeRegistry::new()),
	)
	.watch_registrar(watcher.clone())
	.build();
	model.attach_watcher(watcher.events());

	assert!(model
		.change_directory(Container::directory(&root))
		.await
		.is_displayed());
	assert_eq!(watcher.watched(), Some(root.clone()));
	assert_eq!(names(&model.entries()), vec!["existing.txt"]);

	let wait_until = |expected: Vec<&'static str>| {
		let model = model.clone();
		async move {
			timeout(Duration::from_secs(10), async {
				while names(&model.entries()) != expected {
					sleep(Duration::from_millis(20)).await;
				}
			})
			.await
			.unwrap();
		}
	};

	fs::write(root.join("fresh.txt"), "new").unwrap();
	wait_until(vec!["existing.txt", "fresh.txt"]).await;

	fs::remove_file(root.join("existing.txt")).unwrap();
	wait_until(vec!["fresh.txt"]).await;

	model.dispose();
}
