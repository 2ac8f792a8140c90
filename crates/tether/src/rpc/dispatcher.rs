use rustc_hash::FxHashMap;
use std::sync::{Arc, Mutex, PoisonError};

use super::PendingRpc;

pub type RpcHandler = Box<dyn FnMut(&PendingRpc)>;

/// Collects the RPCs that arrive during a tick and hands them to handlers in
/// one batch, entering the handler environment's critical section once.
pub struct RpcDispatcher {
    handlers: FxHashMap<String, Vec<RpcHandler>>,
    inbox: Vec<PendingRpc>,
    lock: Arc<Mutex<()>>,
    acquisitions: u64,
    dispatched: u64,
    unhandled: u64,
}

impl Default for RpcDispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl RpcDispatcher {
    pub fn new() -> Self {
        Self::with_lock(Arc::new(Mutex::new(())))
    }

    /// Shares a lock with whatever environment the handlers run in.
    pub fn with_lock(lock: Arc<Mutex<()>>) -> Self {
        Self {
            handlers: FxHashMap::default(),
            inbox: Vec::with_capacity(64),
            lock,
            acquisitions: 0,
            dispatched: 0,
            unhandled: 0,
        }
    }

    pub fn register(&mut self, subject: impl Into<String>, handler: RpcHandler) {
        self.handlers.entry(subject.into()).or_default().push(handler);
    }

    pub fn enqueue(&mut self, rpc: PendingRpc) {
        self.inbox.push(rpc);
    }

    pub fn pending(&self) -> usize {
        self.inbox.len()
    }

    pub fn dispatch(&mut self) -> usize {
        if self.inbox.is_empty() {
            return 0;
        }

        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        self.acquisitions += 1;

        let count = self.inbox.len();
        for rpc in self.inbox.drain(..) {
            match self.handlers.get_mut(&rpc.subject) {
                Some(handlers) => {
                    for handler in handlers.iter_mut() {
                        handler(&rpc);
                    }
                }
                None => {
                    self.unhandled += 1;
                    log::debug!("no handler registered for rpc '{}'", rpc.subject);
                }
            }
        }
        self.dispatched += count as u64;

        count
    }

    pub fn lock_handle(&self) -> Arc<Mutex<()>> {
        Arc::clone(&self.lock)
    }

    pub fn lock_acquisitions(&self) -> u64 {
        self.acquisitions
    }

    pub fn dispatched(&self) -> u64 {
        self.dispatched
    }

    pub fn unhandled(&self) -> u64 {
        self.unhandled
    }

    pub fn clear(&mut self) {
        self.inbox.clear();
    }
}
