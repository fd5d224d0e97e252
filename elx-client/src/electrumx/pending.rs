//! Correlation of in-flight requests with their responses.

use std::collections::HashMap;

use parking_lot::Mutex;
use tokio::sync::oneshot;

use super::error::{ElectrumError, ElectrumResult};
use super::messages::Response;

/// Table of requests awaiting a response, keyed by request id.
///
/// Each entry is a single-use delivery slot. An entry leaves the table
/// exactly once: when its response is delivered, when the requester
/// stops waiting, or when the connection closes the whole table. After
/// [`close_all`](Self::close_all) nothing can be registered, so a request
/// issued on a dead connection fails immediately instead of waiting for
/// a read loop that no longer exists.
pub struct PendingRequests {
    inner: Mutex<Table>,
}

struct Table {
    closed: bool,
    slots: HashMap<u64, oneshot::Sender<Response>>,
}

impl PendingRequests {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Table {
                closed: false,
                slots: HashMap::new(),
            }),
        }
    }

    /// Register a slot for request `id`.
    ///
    /// The returned handle removes the slot when dropped, so a requester
    /// that gives up (canceled, timed out, future dropped) leaves nothing
    /// behind and a late response is treated as unknown.
    pub fn register(&self, id: u64) -> ElectrumResult<PendingResponse<'_>> {
        let (tx, rx) = oneshot::channel();
        let mut table = self.inner.lock();
        if table.closed {
            return Err(ElectrumError::Terminated);
        }
        let previous = table.slots.insert(id, tx);
        // Ids come from a monotonically increasing counter
        debug_assert!(previous.is_none(), "request id {} registered twice", id);
        Ok(PendingResponse {
            id,
            rx,
            table: self,
        })
    }

    /// Deliver a response to its requester.
    ///
    /// Returns false if no request with that id is pending (never sent,
    /// already answered, or abandoned by its requester).
    pub fn resolve(&self, response: Response) -> bool {
        let slot = self.inner.lock().slots.remove(&response.id);
        match slot {
            // Send fails only if the requester dropped its handle after
            // we took the slot; same outcome as an unknown id.
            Some(tx) => tx.send(response).is_ok(),
            None => false,
        }
    }

    /// Resolve every pending request as terminated and refuse new ones.
    ///
    /// Returns how many requests were outstanding.
    pub fn close_all(&self) -> usize {
        let mut table = self.inner.lock();
        table.closed = true;
        let outstanding = table.slots.len();
        // Dropping the senders wakes every requester with "closed"
        table.slots.clear();
        outstanding
    }

    /// Number of requests awaiting a response.
    pub fn len(&self) -> usize {
        self.inner.lock().slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn forget(&self, id: u64) {
        self.inner.lock().slots.remove(&id);
    }
}

impl Default for PendingRequests {
    fn default() -> Self {
        Self::new()
    }
}

/// Requester's side of a pending slot.
pub struct PendingResponse<'a> {
    id: u64,
    rx: oneshot::Receiver<Response>,
    table: &'a PendingRequests,
}

impl PendingResponse<'_> {
    /// Wait for the response.
    ///
    /// Fails with [`ElectrumError::Terminated`] if the connection closed
    /// the table before a response arrived. Cancel safe.
    pub async fn wait(&mut self) -> ElectrumResult<Response> {
        (&mut self.rx).await.map_err(|_| ElectrumError::Terminated)
    }
}

impl Drop for PendingResponse<'_> {
    fn drop(&mut self) {
        self.table.forget(self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn response(id: u64) -> Response {
        Response {
            id,
            result: json!(id),
            error: None,
        }
    }

    #[tokio::test]
    async fn delivers_to_matching_id() {
        let table = PendingRequests::new();
        let mut a = table.register(1).unwrap();
        let mut b = table.register(2).unwrap();

        assert!(table.resolve(response(2)));
        assert!(table.resolve(response(1)));

        assert_eq!(a.wait().await.unwrap().result, json!(1));
        assert_eq!(b.wait().await.unwrap().result, json!(2));
        assert!(table.is_empty());
    }

    #[tokio::test]
    async fn delivers_at_most_once() {
        let table = PendingRequests::new();
        let _pending = table.register(1).unwrap();

        assert!(table.resolve(response(1)));
        assert!(!table.resolve(response(1)));
    }

    #[test]
    fn unknown_id_is_not_delivered() {
        let table = PendingRequests::new();
        assert!(!table.resolve(response(42)));
    }

    #[test]
    fn dropping_handle_forgets_request() {
        let table = PendingRequests::new();
        let pending = table.register(1).unwrap();
        assert_eq!(table.len(), 1);

        drop(pending);
        assert!(table.is_empty());
        assert!(!table.resolve(response(1)));
    }

    #[tokio::test]
    async fn close_all_terminates_every_waiter() {
        let table = PendingRequests::new();
        let mut waiters: Vec<_> = (1..=3).map(|id| table.register(id).unwrap()).collect();

        assert_eq!(table.close_all(), 3);

        for waiter in &mut waiters {
            assert!(matches!(waiter.wait().await, Err(ElectrumError::Terminated)));
        }
    }

    #[test]
    fn register_after_close_fails() {
        let table = PendingRequests::new();
        table.close_all();
        assert!(matches!(table.register(1), Err(ElectrumError::Terminated)));
    }
}
