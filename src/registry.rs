//! Live index of connected agents.
//!
//! The registry is the only structure shared between connection tasks and
//! dispatchers. All access goes through `register`, `unregister` and
//! `snapshot`, each of which holds the lock for the duration of a single
//! call; callers never see a reference into the underlying list.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};

use crate::{
    error::RegistryError,
    protocol::{DispatchEnvelope, ResultEnvelope},
};

pub const INBOUND_CAPACITY: usize = 8;

/// A command queued for one connection, with the channel its reply goes to.
#[derive(Debug)]
pub struct PendingDispatch {
    pub envelope: DispatchEnvelope,
    pub reply: oneshot::Sender<ResultEnvelope>,
}

#[derive(Debug, Clone)]
pub struct Candidate {
    pub identity: String,
    pub inbound: mpsc::Sender<PendingDispatch>,
}

#[derive(Debug, Clone, Default)]
pub struct ConnectionRegistry {
    entries: Arc<Mutex<Vec<Candidate>>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a connection and returns the receiving end of its inbound
    /// command channel.
    pub fn register(
        &self,
        identity: impl Into<String>,
    ) -> Result<mpsc::Receiver<PendingDispatch>, RegistryError> {
        let identity = identity.into();
        let mut entries = self.entries.lock();
        if entries.iter().any(|entry| entry.identity == identity) {
            return Err(RegistryError::AlreadyRegistered(identity));
        }

        let (inbound, rx) = mpsc::channel(INBOUND_CAPACITY);
        entries.push(Candidate {
            identity: identity.clone(),
            inbound,
        });
        drop(entries);

        tracing::info!(
            target = "agent_dispatch::registry",
            identity = %identity,
            "connection registered"
        );
        Ok(rx)
    }

    /// Removes a connection. Returns whether an entry was removed; calling
    /// it again for the same identity is a no-op.
    pub fn unregister(&self, identity: &str) -> bool {
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|entry| entry.identity != identity);
        let removed = entries.len() != before;
        drop(entries);

        if removed {
            tracing::info!(
                target = "agent_dispatch::registry",
                identity = %identity,
                "connection unregistered"
            );
        }
        removed
    }

    /// Point-in-time copy of the registered connections in registration
    /// order.
    pub fn snapshot(&self) -> Vec<Candidate> {
        self.entries.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}
