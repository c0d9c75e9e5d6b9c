//! Event bus for decoupled communication

use tokio::sync::broadcast;

/// Event bus for broadcasting events of a single publisher
#[derive(Debug)]
pub struct EventBus<E> {
	sender: broadcast::Sender<E>,
}

impl<E: Clone> EventBus<E> {
	/// Create a new event bus with specified capacity
	pub fn new(capacity: usize) -> Self {
		let (sender, _) = broadcast::channel(capacity.max(1));
		Self { sender }
	}

	/// Emit an event
	pub fn emit(&self, event: E) {
		// Ignore send errors (no receivers)
		let _ = self.sender.send(event);
	}

	/// Subscribe to events
	pub fn subscribe(&self) -> broadcast::Receiver<E> {
		self.sender.subscribe()
	}
}

impl<E: Clone> Default for EventBus<E> {
	fn default() -> Self {
		Self::new(1024)
	}
}
