//! Strict FIFO execution of asynchronous tasks and a trailing-edge aggregator.
//!
//! [`AsyncQueue`] runs one task at a time: a task receives a [`Done`] handle and
//! the next task is not started until that handle is released. There is no
//! timeout, a task that never releases its handle stalls the queue for good.
//!
//! [`Aggregator`] collapses bursts of [`Aggregator::run`] calls into a single
//! invocation of its action, fired once the calls stop for a whole window.

use std::{future::Future, pin::pin, time::Duration};

use async_channel as chan;
use futures::{future::BoxFuture, StreamExt};
use tokio::{spawn, sync::oneshot, task::JoinHandle, time::timeout};
use tracing::{error, trace, warn};

type QueuedTask = Box<dyn FnOnce(Done) -> BoxFuture<'static, ()> + Send>;

/// Handle given to every queued task, releasing it lets the next task start.
///
/// Dropping the handle without calling [`Done::done`] releases the queue only
/// once the task has finished, so a task that panics or returns early doesn't
/// wedge everything queued behind it and never overlaps with the next one.
#[derive(Debug)]
pub struct Done(oneshot::Sender<()>);

impl Done {
	fn new() -> (Self, oneshot::Receiver<()>) {
		let (tx, rx) = oneshot::channel();
		(Self(tx), rx)
	}

	/// Release the queue.
	pub fn done(self) {
		// The queue loop only goes away with the queue itself
		let _ = self.0.send(());
	}
}

#[derive(Debug)]
pub struct AsyncQueue {
	tasks_tx: chan::Sender<QueuedTask>,
	handle: JoinHandle<()>,
}

impl AsyncQueue {
	/// Must be called from within a tokio runtime.
	pub fn new() -> Self {
		let (tasks_tx, tasks_rx) = chan::unbounded();

		Self {
			tasks_tx,
			handle: spawn(Self::run_loop(tasks_rx)),
		}
	}

	/// Enqueue `task`, it is started once every previously enqueued task is done.
	pub fn run<F, Fut>(&self, task: F)
	where
		F: FnOnce(Done) -> Fut + Send + 'static,
		Fut: Future<Output = ()> + Send + 'static,
	{
		if self
			.tasks_tx
			.try_send(Box::new(move |done| Box::pin(task(done))))
			.is_err()
		{
			error!("Tried to enqueue a task on a closed queue;");
		}
	}

	async fn run_loop(tasks_rx: chan::Receiver<QueuedTask>) {
		let mut tasks = pin!(tasks_rx);

		while let Some(task) = tasks.next().await {
			let (done, released) = Done::new();

			let handle = spawn(task(done));

			if released.await.is_err() {
				// Dropped without calling `done`, the task itself must end first
				if !handle.is_finished() {
					warn!("Queued task dropped its done handle while still running");
				}

				if let Err(e) = handle.await {
					error!(?e, "Queued task failed;");
				}
			}

			trace!("Queued task released the queue");
		}
	}
}

impl Default for AsyncQueue {
	fn default() -> Self {
		Self::new()
	}
}

impl Drop for AsyncQueue {
	fn drop(&mut self) {
		self.handle.abort();
	}
}

/// Fires `action` at most once per quiet period of `window` after the last `run`.
#[derive(Debug)]
pub struct Aggregator {
	triggers_tx: chan::Sender<()>,
	handle: JoinHandle<()>,
}

impl Aggregator {
	/// Must be called from within a tokio runtime.
	pub fn new<F, Fut>(window: Duration, action: F) -> Self
	where
		F: Fn() -> Fut + Send + Sync + 'static,
		Fut: Future<Output = ()> + Send + 'static,
	{
		let (triggers_tx, triggers_rx) = chan::unbounded();

		Self {
			triggers_tx,
			handle: spawn(Self::run_loop(window, triggers_rx, action)),
		}
	}

	pub fn run(&self) {
		if self.triggers_tx.try_send(()).is_err() {
			warn!("Aggregator triggered after being shut down");
		}
	}

	async fn run_loop<F, Fut>(window: Duration, triggers_rx: chan::Receiver<()>, action: F)
	where
		F: Fn() -> Fut,
		Fut: Future<Output = ()>,
	{
		while triggers_rx.recv().await.is_ok() {
			// Every new trigger restarts the quiet window
			loop {
				match timeout(window, triggers_rx.recv()).await {
					Ok(Ok(())) => continue,
					Ok(Err(_)) => return,
					Err(_elapsed) => break,
				}
			}

			action().await;
		}
	}
}

impl Drop for Aggregator {
	fn drop(&mut self) {
		self.handle.abort();
	}
}

#[cfg(test)]
mod tests {
	use std::sync::{
		atomic::{AtomicUsize, Ordering},
		Arc,
	};

	use parking_lot::Mutex;
	use tokio::time::{sleep, Instant};

	use super::*;

	#[tokio::test]
	async fn tasks_never_overlap() {
		let queue = AsyncQueue::new();
		let log = Arc::new(Mutex::new(Vec::new()));
		let (finished_tx, finished_rx) = oneshot::channel();

		queue.run({
			let log = Arc::clone(&log);
			move |done| async move {
				log.lock().push("first started");
				sleep(Duration::from_millis(30)).await;
				log.lock().push("first finished");
				done.done();
			}
		});

		queue.run({
			let log = Arc::clone(&log);
			move |done| async move {
				log.lock().push("second started");
				log.lock().push("second finished");
				done.done();
				let _ = finished_tx.send(());
			}
		});

		finished_rx.await.unwrap();

		assert_eq!(
			*log.lock(),
			vec![
				"first started",
				"first finished",
				"second started",
				"second finished"
			]
		);
	}

	#[tokio::test]
	async fn dropped_handle_releases_the_queue_once_the_task_ends() {
		let queue = AsyncQueue::new();
		let log = Arc::new(Mutex::new(Vec::new()));
		let (finished_tx, finished_rx) = oneshot::channel();

		queue.run(|done| async move { drop(done) });
		queue.run({
			let log = Arc::clone(&log);
			move |done| async move {
				log.lock().push("second started");
				drop(done);
				sleep(Duration::from_millis(30)).await;
				log.lock().push("second finished");
			}
		});
		queue.run({
			let log = Arc::clone(&log);
			move |done| async move {
				log.lock().push("third started");
				done.done();
				let _ = finished_tx.send(());
			}
		});

		finished_rx.await.unwrap();

		assert_eq!(
			*log.lock(),
			vec!["second started", "second finished", "third started"]
		);
	}

	#[tokio::test(start_paused = true)]
	async fn aggregator_fires_once_after_the_last_call() {
		const WINDOW: Duration = Duration::from_millis(100);

		let fired = Arc::new(AtomicUsize::new(0));
		let fired_at = Arc::new(Mutex::new(None));

		let aggregator = Aggregator::new(WINDOW, {
			let fired = Arc::clone(&fired);
			let fired_at = Arc::clone(&fired_at);
			move || {
				let fired = Arc::clone(&fired);
				let fired_at = Arc::clone(&fired_at);
				async move {
					fired.fetch_add(1, Ordering::SeqCst);
					*fired_at.lock() = Some(Instant::now());
				}
			}
		});

		let start = Instant::now();
		aggregator.run();
		sleep(WINDOW / 2).await;
		aggregator.run();
		sleep(WINDOW / 2).await;
		aggregator.run();

		sleep(WINDOW / 2).await;
		assert_eq!(fired.load(Ordering::SeqCst), 0);

		sleep(WINDOW).await;
		assert_eq!(fired.load(Ordering::SeqCst), 1);

		let fired_at = (*fired_at.lock()).expect("aggregator action ran");
		assert!(fired_at >= start + WINDOW + WINDOW / 2);
	}
}
