//! Connection supervisor: owns the set of named connections and the
//! unified caller-facing surface.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::log::MessageLog;
use crate::scheduler::{ReconnectPolicy, ReconnectScheduler};
use crate::types::{ClientError, ConnectionStatus, Endpoint, Message};
use crate::worker::Worker;

/// Owns one [`Worker`](crate::worker) per connection name, assigns each to
/// an endpoint round-robin over the pool, and merges everything the
/// workers receive into one shared [`MessageLog`].
///
/// Create via [`SupervisorBuilder`](crate::builder::SupervisorBuilder).
/// Must be used inside a Tokio runtime; [`start`](Self::start) spawns the
/// connection tasks.  Call [`stop`](Self::stop) before dropping to close
/// the transports gracefully.
pub struct ChatSupervisor {
    pub(crate) room: String,
    pub(crate) endpoints: Vec<Endpoint>,
    pub(crate) policy: ReconnectPolicy,
    log: Arc<MessageLog>,
    scheduler: ReconnectScheduler,
    workers: RwLock<WorkerSet>,
}

#[derive(Default)]
struct WorkerSet {
    /// Names in start order; positions drive endpoint assignment.
    order: Vec<String>,
    by_name: HashMap<String, Worker>,
}

impl ChatSupervisor {
    pub fn builder() -> crate::builder::SupervisorBuilder {
        crate::builder::SupervisorBuilder::new()
    }

    pub(crate) fn new(room: String, endpoints: Vec<Endpoint>, policy: ReconnectPolicy) -> Self {
        Self {
            room,
            endpoints,
            policy,
            log: Arc::new(MessageLog::new()),
            scheduler: ReconnectScheduler::new(),
            workers: RwLock::new(WorkerSet::default()),
        }
    }

    /// (Re)start the supervisor with an ordered list of connection names.
    ///
    /// This is a full rebuild, not an incremental diff: every existing
    /// worker is torn down gracefully before fresh workers are created,
    /// even for names present in both lists.  Name `i` is assigned
    /// endpoint `pool[i % pool_len]`, and that assignment is stable until
    /// the next `start` or `stop`.
    pub fn start<I, S>(&self, names: I) -> Result<(), ClientError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let names: Vec<String> = names.into_iter().map(Into::into).collect();
        let mut unique = HashSet::new();
        for name in &names {
            if !unique.insert(name.as_str()) {
                return Err(ClientError::Config(format!(
                    "duplicate connection name `{name}`"
                )));
            }
        }

        self.stop();

        tracing::info!(connections = names.len(), room = %self.room, "starting supervisor");

        let mut set = self.workers.write();
        for (index, name) in names.iter().enumerate() {
            let endpoint = self.endpoints[index % self.endpoints.len()].clone();
            let worker = Worker::new(
                name.clone(),
                endpoint,
                self.room.clone(),
                Arc::clone(&self.log),
                self.scheduler.clone(),
                self.policy.clone(),
            );
            worker.connect();
            set.by_name.insert(name.clone(), worker);
        }
        set.order = names;
        Ok(())
    }

    /// Send a chat message through the named connection.
    ///
    /// Fails without any transport I/O or log mutation when the name is
    /// unknown or the connection is not open.
    pub fn send_message(&self, name: &str, text: &str) -> Result<(), ClientError> {
        let worker = self.worker(name)?;
        worker.send(text)
    }

    /// Restart the named connection immediately, regardless of its current
    /// state and bypassing any pending backoff delay.
    pub fn manual_reconnect(&self, name: &str) -> Result<(), ClientError> {
        let worker = self.worker(name)?;
        tracing::info!(name = %name, "manual reconnect requested");
        worker.connect();
        Ok(())
    }

    /// Gracefully tear down every worker and cancel every pending
    /// reconnect task.
    pub fn stop(&self) {
        let mut set = self.workers.write();
        if !set.order.is_empty() {
            tracing::info!(connections = set.order.len(), "stopping supervisor");
        }
        for name in &set.order {
            if let Some(worker) = set.by_name.get(name) {
                worker.teardown();
            }
        }
        set.order.clear();
        set.by_name.clear();
        drop(set);

        self.scheduler.cancel_all();
    }

    // ── Read surface ─────────────────────────────────────────────────

    /// Ordered snapshot of the merged message timeline.
    pub fn messages(&self) -> Vec<Message> {
        self.log.snapshot()
    }

    pub fn message_count(&self) -> usize {
        self.log.len()
    }

    /// Current status of every connection.
    pub fn statuses(&self) -> HashMap<String, ConnectionStatus> {
        let set = self.workers.read();
        set.by_name
            .iter()
            .map(|(name, worker)| (name.clone(), worker.status()))
            .collect()
    }

    /// Connection names in start order.
    pub fn connection_names(&self) -> Vec<String> {
        self.workers.read().order.clone()
    }

    /// Endpoint label the named connection is assigned to.
    pub fn endpoint_of(&self, name: &str) -> Option<String> {
        self.workers
            .read()
            .by_name
            .get(name)
            .map(|w| w.endpoint().label.clone())
    }

    /// Number of reconnect tasks currently pending across all connections.
    pub fn pending_reconnects(&self) -> usize {
        self.scheduler.pending_count()
    }

    fn worker(&self, name: &str) -> Result<Worker, ClientError> {
        self.workers
            .read()
            .by_name
            .get(name)
            .cloned()
            .ok_or_else(|| ClientError::UnknownConnection(name.to_string()))
    }
}

// Workers and the log hold live transport state, so this stays manual and
// reports configuration plus the connection names.
impl fmt::Debug for ChatSupervisor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChatSupervisor")
            .field("room", &self.room)
            .field("endpoints", &self.endpoints)
            .field("connections", &self.workers.read().order)
            .finish_non_exhaustive()
    }
}
