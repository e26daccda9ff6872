//! Pending-request queue: the rendezvous between outbound callers and
//! arriving pollers.
//!
//! Exactly one queue exists per subscription URI, created on first use and
//! kept for the runtime's lifetime. Callers park requests with
//! [`PendingRequestQueue::enqueue_and_wait`]; a subscriber-identified
//! exchange session claims them one at a time with
//! [`PendingRequestQueue::dequeue`] and fulfils each claim through its
//! [`PendingEntry`].
//!
//! Delivery is at most once: an entry is waiting, in flight with exactly
//! one subscriber, completed, or abandoned, and never two of these at once.
//! Entries that were already waiting when a dequeue arrives are served in
//! FIFO order.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{Notify, oneshot};
use tokio::time::{Instant, timeout};
use url::Url;

use turnpike_core::{RequestMessage, ResponseMessage, TransportError, TransportResult};

/// A claimed queue entry: the request to ship and the slot that wakes the
/// original caller.
pub struct PendingEntry {
    /// The parked request.
    pub request: RequestMessage,
    slot: oneshot::Sender<TransportResult<ResponseMessage>>,
}

impl PendingEntry {
    /// Wake the caller with the response.
    ///
    /// Returns `false` if the caller stopped waiting (its deadline elapsed
    /// while this burst was in flight); the session that shipped the burst
    /// must then tear its stream down.
    pub fn complete(self, response: ResponseMessage) -> bool {
        self.slot.send(Ok(response)).is_ok()
    }

    /// Wake the caller with a transport failure.
    pub fn abandon(self, error: TransportError) {
        let _ = self.slot.send(Err(error));
    }
}

struct QueueInner {
    waiting: VecDeque<PendingEntry>,
    closed: bool,
}

/// Rendezvous queue for one subscription URI.
pub struct PendingRequestQueue {
    inner: Mutex<QueueInner>,
    notify: Notify,
}

impl Default for PendingRequestQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl PendingRequestQueue {
    /// Create an empty queue.
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(QueueInner {
                waiting: VecDeque::new(),
                closed: false,
            }),
            notify: Notify::new(),
        }
    }

    /// Park `request` and wait for a poller to deliver its response.
    ///
    /// # Errors
    ///
    /// - `PollingTimeout` if the deadline elapses while the entry is still
    ///   waiting (the entry is removed).
    /// - `TransportTimeout` if the deadline elapses after a poller claimed
    ///   the entry.
    /// - `Shutdown` if the queue is closed before or while waiting.
    /// - Any transport failure the claiming session reported via
    ///   [`PendingEntry::abandon`].
    pub async fn enqueue_and_wait(
        &self,
        request: RequestMessage,
        deadline: Duration,
    ) -> TransportResult<ResponseMessage> {
        let request_id = request.id.clone();
        let (slot, completion) = oneshot::channel();
        {
            let mut inner = self.lock();
            if inner.closed {
                return Err(TransportError::Shutdown);
            }
            inner.waiting.push_back(PendingEntry { request, slot });
        }
        tracing::debug!(request_id = %request_id, "request parked for polling");
        self.notify.notify_one();

        match timeout(deadline, completion).await {
            Ok(Ok(result)) => result,
            // The slot was dropped without completion or abandonment; the
            // queue itself went away.
            Ok(Err(_)) => Err(TransportError::Shutdown),
            Err(_) => {
                let mut inner = self.lock();
                if let Some(index) = inner
                    .waiting
                    .iter()
                    .position(|entry| entry.request.id == request_id)
                {
                    inner.waiting.remove(index);
                    tracing::debug!(request_id = %request_id, "polling deadline elapsed while queued");
                    Err(TransportError::PollingTimeout { request_id })
                } else {
                    // A poller claimed the entry; the burst overran the
                    // deadline in flight.
                    tracing::debug!(request_id = %request_id, "deadline elapsed in flight");
                    Err(TransportError::TransportTimeout { after: deadline })
                }
            }
        }
    }

    /// Claim the oldest waiting entry, blocking up to `max_wait`.
    ///
    /// Returns `None` when the wait elapses with the queue empty, or when
    /// the queue is closed.
    pub async fn dequeue(&self, max_wait: Duration) -> Option<PendingEntry> {
        let deadline = Instant::now() + max_wait;
        loop {
            let notified = self.notify.notified();
            {
                let mut inner = self.lock();
                if let Some(entry) = inner.waiting.pop_front() {
                    // Relay the wakeup in case more entries and more
                    // waiters exist.
                    if !inner.waiting.is_empty() {
                        self.notify.notify_one();
                    }
                    return Some(entry);
                }
                if inner.closed {
                    return None;
                }
            }

            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            let _ = timeout(deadline - now, notified).await;
        }
    }

    /// Close the queue: abandon every waiting entry with `Shutdown` and wake
    /// all blocked subscribers.
    pub fn close(&self) {
        let drained: Vec<PendingEntry> = {
            let mut inner = self.lock();
            inner.closed = true;
            inner.waiting.drain(..).collect()
        };
        for entry in drained {
            entry.abandon(TransportError::Shutdown);
        }
        self.notify.notify_waiters();
    }

    /// Number of entries currently waiting (in-flight entries excluded).
    pub fn len(&self) -> usize {
        self.lock().waiting.len()
    }

    /// Whether no entries are waiting.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether the queue has been closed.
    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, QueueInner> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Lazily-populated map of subscription URI → queue. One per runtime.
#[derive(Default)]
pub(crate) struct QueueMap {
    queues: Mutex<HashMap<String, Arc<PendingRequestQueue>>>,
}

impl QueueMap {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Queue for `subscription`, created on first use.
    pub(crate) fn get_or_create(&self, subscription: &Url) -> Arc<PendingRequestQueue> {
        let mut queues = self
            .queues
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        queues
            .entry(subscription.as_str().to_string())
            .or_default()
            .clone()
    }

    pub(crate) fn get(&self, subscription: &Url) -> Option<Arc<PendingRequestQueue>> {
        self.queues
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(subscription.as_str())
            .cloned()
    }

    /// Close every queue. Called on runtime shutdown.
    pub(crate) fn close_all(&self) {
        let queues: Vec<Arc<PendingRequestQueue>> = self
            .queues
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .values()
            .cloned()
            .collect();
        for queue in queues {
            queue.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use turnpike_core::ServiceEndpoint;

    const THUMB: &str = "DA39A3EE5E6B4B0D3255BFEF95601890AFD80709";

    fn request(tag: u32) -> RequestMessage {
        let endpoint = ServiceEndpoint::parse("poll://inbox-a/", THUMB).expect("endpoint");
        RequestMessage::new(endpoint, "svc", "method", vec![json!(tag)])
    }

    fn echo(entry: &PendingEntry) -> ResponseMessage {
        ResponseMessage::result(entry.request.id.clone(), entry.request.args[0].clone())
    }

    #[tokio::test]
    async fn rendezvous_completes_the_caller() {
        let queue = Arc::new(PendingRequestQueue::new());

        let subscriber = {
            let queue = queue.clone();
            tokio::spawn(async move {
                let entry = queue
                    .dequeue(Duration::from_secs(5))
                    .await
                    .expect("should claim an entry");
                let response = echo(&entry);
                assert!(entry.complete(response));
            })
        };

        let response = queue
            .enqueue_and_wait(request(7), Duration::from_secs(5))
            .await
            .expect("should complete");
        assert_eq!(response.result, Ok(json!(7)));
        subscriber.await.expect("subscriber");
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn fifo_among_waiting_entries() {
        let queue = Arc::new(PendingRequestQueue::new());

        let mut callers = Vec::new();
        for tag in 0..3u32 {
            let queue = queue.clone();
            callers.push(tokio::spawn(async move {
                queue
                    .enqueue_and_wait(request(tag), Duration::from_secs(5))
                    .await
            }));
            // Ensure deterministic arrival order.
            tokio::task::yield_now().await;
        }
        assert_eq!(queue.len(), 3);

        for expected in 0..3u32 {
            let entry = queue
                .dequeue(Duration::from_secs(1))
                .await
                .expect("should claim");
            assert_eq!(entry.request.args[0], json!(expected));
            let response = echo(&entry);
            entry.complete(response);
        }
        for (tag, caller) in callers.into_iter().enumerate() {
            let response = caller.await.expect("join").expect("complete");
            assert_eq!(response.result, Ok(json!(tag as u32)));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn queued_deadline_raises_polling_timeout_and_removes_entry() {
        let queue = PendingRequestQueue::new();
        let parked = request(1);
        let id = parked.id.clone();

        let result = queue
            .enqueue_and_wait(parked, Duration::from_millis(200))
            .await;
        assert!(matches!(
            result,
            Err(TransportError::PollingTimeout { request_id }) if request_id == id
        ));
        assert!(queue.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn claimed_deadline_raises_transport_timeout() {
        let queue = Arc::new(PendingRequestQueue::new());

        let caller = {
            let queue = queue.clone();
            tokio::spawn(async move {
                queue
                    .enqueue_and_wait(request(1), Duration::from_millis(200))
                    .await
            })
        };
        tokio::task::yield_now().await;

        // Claim the entry but never complete it within the deadline.
        let entry = queue
            .dequeue(Duration::from_millis(50))
            .await
            .expect("should claim");

        let result = caller.await.expect("join");
        assert!(matches!(
            result,
            Err(TransportError::TransportTimeout { .. })
        ));

        // Completing now reports that the caller is gone.
        let response = echo(&entry);
        assert!(!entry.complete(response));
    }

    #[tokio::test(start_paused = true)]
    async fn dequeue_times_out_on_empty_queue() {
        let queue = PendingRequestQueue::new();
        let claimed = queue.dequeue(Duration::from_millis(100)).await;
        assert!(claimed.is_none());
    }

    #[tokio::test]
    async fn abandon_wakes_caller_with_the_error() {
        let queue = Arc::new(PendingRequestQueue::new());

        let caller = {
            let queue = queue.clone();
            tokio::spawn(async move {
                queue
                    .enqueue_and_wait(request(1), Duration::from_secs(5))
                    .await
            })
        };
        tokio::task::yield_now().await;

        let entry = queue
            .dequeue(Duration::from_secs(1))
            .await
            .expect("should claim");
        entry.abandon(TransportError::Io {
            message: "subscriber stream died".into(),
        });

        let result = caller.await.expect("join");
        assert!(matches!(result, Err(TransportError::Io { .. })));
    }

    #[tokio::test]
    async fn close_wakes_everyone_with_shutdown() {
        let queue = Arc::new(PendingRequestQueue::new());

        let caller = {
            let queue = queue.clone();
            tokio::spawn(async move {
                queue
                    .enqueue_and_wait(request(1), Duration::from_secs(30))
                    .await
            })
        };
        let subscriber = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.dequeue(Duration::from_secs(30)).await })
        };
        tokio::task::yield_now().await;

        queue.close();

        // The parked entry was abandoned with Shutdown...
        let result = caller.await.expect("join");
        assert!(matches!(result, Err(TransportError::Shutdown)));
        // ...but a subscriber may legitimately have claimed it first; after
        // close, at the latest the next dequeue returns None.
        let _ = subscriber.await.expect("join");
        assert!(queue.dequeue(Duration::from_millis(10)).await.is_none());

        // Enqueue after close fails immediately.
        let result = queue
            .enqueue_and_wait(request(2), Duration::from_secs(1))
            .await;
        assert!(matches!(result, Err(TransportError::Shutdown)));
    }

    #[tokio::test]
    async fn queue_map_creates_lazily_and_reuses() {
        let map = QueueMap::new();
        let inbox = Url::parse("poll://inbox-a/").expect("url");
        let other = Url::parse("poll://inbox-b/").expect("url");

        assert!(map.get(&inbox).is_none());
        let queue = map.get_or_create(&inbox);
        assert!(Arc::ptr_eq(&queue, &map.get_or_create(&inbox)));
        assert!(!Arc::ptr_eq(&queue, &map.get_or_create(&other)));
        assert!(map.get(&inbox).is_some());
    }
}
