//! Builder pattern for constructing a [`ChatSupervisor`].

use crate::scheduler::ReconnectPolicy;
use crate::supervisor::ChatSupervisor;
use crate::types::{ClientError, Endpoint};

/// Default endpoint pool: three local chat servers.
const DEFAULT_POOL: [&str; 3] = [
    "ws://localhost:8080/ws",
    "ws://localhost:8081/ws",
    "ws://localhost:8082/ws",
];

/// Fluent builder for [`ChatSupervisor`].
///
/// # Example
///
/// ```rust,no_run
/// # use cm_client::SupervisorBuilder;
/// let supervisor = SupervisorBuilder::new()
///     .room("general")
///     .build()
///     .unwrap();
/// supervisor.start(["alice", "bob", "carol"]).unwrap();
/// ```
pub struct SupervisorBuilder {
    endpoints: Vec<Endpoint>,
    room: String,
    policy: ReconnectPolicy,
}

impl SupervisorBuilder {
    pub fn new() -> Self {
        Self {
            endpoints: DEFAULT_POOL.into_iter().map(Endpoint::new).collect(),
            room: "general".into(),
            policy: ReconnectPolicy::default(),
        }
    }

    /// Replace the endpoint pool.  Connections are assigned round-robin
    /// over this list, in order.
    pub fn endpoints<I, S>(mut self, urls: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.endpoints = urls.into_iter().map(Endpoint::new).collect();
        self
    }

    /// Add one endpoint to the pool.
    pub fn endpoint(mut self, url: impl Into<String>) -> Self {
        self.endpoints.push(Endpoint::new(url));
        self
    }

    /// Set the room every connection joins (default `"general"`).
    pub fn room(mut self, room: impl Into<String>) -> Self {
        self.room = room.into();
        self
    }

    /// Override the reconnect delays (defaults 2000/3000/5000 ms).
    pub fn reconnect_policy(mut self, policy: ReconnectPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn build(self) -> Result<ChatSupervisor, ClientError> {
        if self.endpoints.is_empty() {
            return Err(ClientError::Config("endpoint pool is empty".into()));
        }
        if self.room.is_empty() {
            return Err(ClientError::Config("room is required".into()));
        }
        Ok(ChatSupervisor::new(self.room, self.endpoints, self.policy))
    }
}

impl Default for SupervisorBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn default_pool_has_three_local_servers() {
        let sup = SupervisorBuilder::new().build().unwrap();
        assert_eq!(sup.endpoints.len(), 3);
        assert_eq!(sup.endpoints[0].label, ":8080");
        assert_eq!(sup.endpoints[1].label, ":8081");
        assert_eq!(sup.endpoints[2].label, ":8082");
        assert_eq!(sup.room, "general");
    }

    #[test]
    fn empty_pool_is_rejected() {
        let err = SupervisorBuilder::new()
            .endpoints(Vec::<String>::new())
            .build()
            .unwrap_err();
        assert!(matches!(err, crate::types::ClientError::Config(_)));
    }

    #[test]
    fn empty_room_is_rejected() {
        let err = SupervisorBuilder::new().room("").build().unwrap_err();
        assert!(matches!(err, crate::types::ClientError::Config(_)));
    }

    #[test]
    fn custom_policy_is_kept() {
        let sup = SupervisorBuilder::new()
            .reconnect_policy(ReconnectPolicy {
                abnormal_close_delay: Duration::from_millis(10),
                transport_error_delay: Duration::from_millis(20),
                connect_failure_delay: Duration::from_millis(30),
            })
            .build()
            .unwrap();
        assert_eq!(sup.policy.abnormal_close_delay, Duration::from_millis(10));
    }
}
