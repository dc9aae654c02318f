use tokio::sync::oneshot;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotOutcome {
    Granted,
    Cancelled,
}

/// The awaitable handed back by `UploadQueue::await_start`. If the entry
/// was already `Ready` when `await_start` was called, the underlying
/// one-shot already has a buffered value, so `wait()` resolves on the
/// first poll without the caller needing special-case handling.
#[derive(Debug)]
pub struct SlotAwait {
    receiver: oneshot::Receiver<SlotOutcome>,
}

impl SlotAwait {
    pub(super) fn new(receiver: oneshot::Receiver<SlotOutcome>) -> Self {
        Self { receiver }
    }

    /// A dropped sender (entry removed without ever granting or
    /// cancelling explicitly) is treated the same as an explicit cancel.
    pub async fn wait(self) -> SlotOutcome {
        self.receiver.await.unwrap_or(SlotOutcome::Cancelled)
    }
}

#[derive(Debug)]
pub struct UploadEntry {
    pub username: String,
    pub filename: String,
    pub enqueued_at: Instant,
    pub ready: bool,
    pub granted_group: Option<String>,
    pub(super) sender: Option<oneshot::Sender<SlotOutcome>>,
    pub(super) receiver: Option<oneshot::Receiver<SlotOutcome>>,
}

impl UploadEntry {
    pub(super) fn new(username: &str, filename: &str) -> Self {
        let (sender, receiver) = oneshot::channel();
        Self {
            username: username.to_string(),
            filename: filename.to_string(),
            enqueued_at: Instant::now(),
            ready: false,
            granted_group: None,
            sender: Some(sender),
            receiver: Some(receiver),
        }
    }

    pub(super) fn take_await(&mut self) -> Option<SlotAwait> {
        self.receiver.take().map(SlotAwait::new)
    }

    pub(super) fn resolve(&mut self, outcome: SlotOutcome) {
        if let Some(sender) = self.sender.take() {
            let _ = sender.send(outcome);
        }
    }
}
