use std::{
	sync::{
		atomic::{AtomicU64, Ordering},
		Arc,
	},
	time::Duration,
};

use parking_lot::Mutex;
use tokio::{
	spawn,
	task::JoinHandle,
	time::{sleep_until, Instant},
};
use tracing::trace;

#[derive(Debug)]
struct Scheduled {
	id: u64,
	deadline: Instant,
	handle: JoinHandle<()>,
}

/// Single outstanding rescan timer.
///
/// A request that would fire before the scheduled one replaces it, a request
/// that would fire at the same time or later is dropped.
#[derive(Debug, Default)]
pub(super) struct RescanScheduler {
	slot: Arc<Mutex<Option<Scheduled>>>,
	next_id: AtomicU64,
}

impl RescanScheduler {
	/// Returns whether the request ended up scheduled.
	pub(super) fn schedule(&self, delay: Duration, fire: impl FnOnce() + Send + 'static) -> bool {
		let deadline = Instant::now() + delay;
		let mut slot = self.slot.lock();

		if let Some(scheduled) = slot.as_ref() {
			if scheduled.deadline <= deadline {
				trace!(?delay, "Rescan already scheduled earlier, dropping request");
				return false;
			}
			scheduled.handle.abort();
		}

		let id = self.next_id.fetch_add(1, Ordering::Relaxed);
		let shared_slot = Arc::clone(&self.slot);

		let handle = spawn(async move {
			sleep_until(deadline).await;

			{
				let mut slot = shared_slot.lock();
				if !slot.as_ref().is_some_and(|scheduled| scheduled.id == id) {
					return;
				}
				*slot = None;
			}

			fire();
		});

		*slot = Some(Scheduled {
			id,
			deadline,
			handle,
		});

		true
	}

	pub(super) fn clear(&self) {
		if let Some(scheduled) = self.slot.lock().take() {
			scheduled.handle.abort();
			trace!("Cleared scheduled rescan");
		}
	}

	pub(super) fn is_scheduled(&self) -> bool {
		self.slot.lock().is_some()
	}
}

impl Drop for RescanScheduler {
	fn drop(&mut self) {
		self.clear();
	}
}

#[cfg(test)]
mod tests {
	use std::sync::atomic::AtomicUsize;

	use tokio::time::sleep;

	use super::*;

	#[tokio::test(start_paused = true)]
	async fn earlier_deadline_wins() {
		let scheduler = RescanScheduler::default();
		let fired = Arc::new(Mutex::new(Vec::new()));

		let record = |label: &'static str| {
			let fired = Arc::clone(&fired);
			move || fired.lock().push(label)
		};

		assert!(scheduler.schedule(Duration::from_millis(500), record("later")));
		assert!(scheduler.schedule(Duration::from_millis(100), record("soon")));
		assert!(!scheduler.schedule(Duration::from_millis(300), record("dropped")));

		sleep(Duration::from_millis(150)).await;
		assert_eq!(*fired.lock(), vec!["soon"]);
		assert!(!scheduler.is_scheduled());

		sleep(Duration::from_millis(500)).await;
		assert_eq!(*fired.lock(), vec!["soon"]);
	}

	#[tokio::test(start_paused = true)]
	async fn cleared_timers_never_fire() {
		let scheduler = RescanScheduler::default();
		let fired = Arc::new(AtomicUsize::new(0));

		scheduler.schedule(Duration::from_millis(100), {
			let fired = Arc::clone(&fired);
			move || {
				fired.fetch_add(1, Ordering::SeqCst);
			}
		});
		scheduler.clear();

		sleep(Duration::from_millis(200)).await;
		assert_eq!(fired.load(Ordering::SeqCst), 0);
	}
}
