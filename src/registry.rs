//! Pending request registry.
//!
//! Correlates outgoing command IDs with the tasks awaiting their replies.
//! Uses `scc::HashMap` for lock-free insertion and removal; each entry is a
//! oneshot sender, so a callback resolves at most once no matter which of
//! reply, timeout, disconnect or shutdown fires first.

use tokio::sync::oneshot;

use crate::error::{ClientError, ClientResult};
use crate::protocol::Reply;

pub(crate) struct RequestRegistry {
    requests: scc::HashMap<u32, oneshot::Sender<ClientResult<Reply>>>,
}

impl RequestRegistry {
    pub(crate) fn new() -> Self {
        Self {
            requests: scc::HashMap::new(),
        }
    }

    /// Register a pending request. Returns the receiver the caller awaits.
    pub(crate) fn add(&self, id: u32) -> ClientResult<oneshot::Receiver<ClientResult<Reply>>> {
        let (tx, rx) = oneshot::channel();
        if self.requests.insert(id, tx).is_err() {
            return Err(ClientError::codec(format!(
                "command id {id} already pending"
            )));
        }
        Ok(rx)
    }

    /// Resolve a pending request with a reply or error.
    ///
    /// Returns `true` if the request was still pending.
    pub(crate) fn resolve(&self, id: u32, result: ClientResult<Reply>) -> bool {
        if let Some((_, tx)) = self.requests.remove(&id) {
            let _ = tx.send(result);
            return true;
        }
        false
    }

    /// Remove a pending request without notifying the receiver.
    pub(crate) fn remove(&self, id: u32) -> bool {
        self.requests.remove(&id).is_some()
    }

    /// Resolve every pending request with the given error.
    pub(crate) fn drain(&self, error: impl Fn() -> ClientError) {
        let mut ids = Vec::new();
        self.requests.retain(|id, _| {
            ids.push(*id);
            true
        });

        for id in ids {
            if let Some((_, tx)) = self.requests.remove(&id) {
                let _ = tx.send(Err(error()));
            }
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.requests.len()
    }
}
