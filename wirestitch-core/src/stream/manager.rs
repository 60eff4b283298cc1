use std::collections::HashMap;

use tracing::{debug, warn};

use crate::error::{Error, Result};

use super::{ConnTracker, Protocol, RawEvent, StitchOutput, TrackerConfig, TrackerStats};

/// Configuration for the StreamManager.
#[derive(Debug, Clone)]
pub struct StreamConfig {
    /// Settings applied to every connection.
    pub tracker: TrackerConfig,
    /// Connections without events for this long are closed by
    /// [`StreamManager::cleanup_idle`] (nanoseconds).
    pub idle_timeout_ns: u64,
    /// Maximum number of tracked connections.
    pub max_connections: usize,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            tracker: TrackerConfig::default(),
            idle_timeout_ns: 300_000_000_000, // 5 minutes
            max_connections: 65536,
        }
    }
}

/// Owns one [`ConnTracker`] per connection id.
pub struct StreamManager {
    connections: HashMap<u64, ConnTracker>,
    config: StreamConfig,
}

impl StreamManager {
    pub fn new(config: StreamConfig) -> Self {
        Self {
            connections: HashMap::new(),
            config,
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(StreamConfig::default())
    }

    /// Route an event to its connection, creating the tracker on first use.
    pub fn add_event(
        &mut self,
        connection_id: u64,
        protocol: Protocol,
        event: RawEvent<'_>,
    ) -> Result<()> {
        if let Some(tracker) = self.connections.get_mut(&connection_id) {
            if tracker.protocol() != protocol {
                return Err(Error::ProtocolMismatch {
                    connection_id,
                    tracked: tracker.protocol(),
                    requested: protocol,
                });
            }
            tracker.add_event(event);
            return Ok(());
        }

        if self.connections.len() >= self.config.max_connections {
            warn!(
                connection_id,
                limit = self.config.max_connections,
                "connection table full, event dropped"
            );
            return Err(Error::ConnectionLimit {
                limit: self.config.max_connections,
            });
        }

        debug!(connection_id, protocol = protocol.name(), "tracking connection");
        let mut tracker = ConnTracker::new(connection_id, protocol, self.config.tracker.clone());
        tracker.add_event(event);
        self.connections.insert(connection_id, tracker);
        Ok(())
    }

    /// Process one connection.
    pub fn process(&mut self, connection_id: u64) -> Option<StitchOutput> {
        self.connections
            .get_mut(&connection_id)
            .map(ConnTracker::process)
    }

    /// Process every connection, in connection id order.
    pub fn process_all(&mut self) -> StitchOutput {
        let mut ids: Vec<u64> = self.connections.keys().copied().collect();
        ids.sort_unstable();

        let mut output = StitchOutput::default();
        for id in ids {
            if let Some(tracker) = self.connections.get_mut(&id) {
                output.extend(tracker.process());
            }
        }
        output
    }

    /// Stop tracking a connection, returning its final counters.
    pub fn close_connection(&mut self, connection_id: u64) -> Option<TrackerStats> {
        let tracker = self.connections.remove(&connection_id)?;
        debug!(connection_id, "connection closed");
        Some(tracker.close())
    }

    /// Close connections idle for longer than the configured timeout.
    pub fn cleanup_idle(&mut self, now_ns: u64) -> Vec<(u64, TrackerStats)> {
        let timeout = self.config.idle_timeout_ns;
        let mut idle: Vec<u64> = self
            .connections
            .values()
            .filter(|tracker| now_ns.saturating_sub(tracker.last_event_ns()) > timeout)
            .map(ConnTracker::connection_id)
            .collect();
        idle.sort_unstable();

        idle.into_iter()
            .filter_map(|id| Some((id, self.close_connection(id)?)))
            .collect()
    }

    pub fn get(&self, connection_id: u64) -> Option<&ConnTracker> {
        self.connections.get(&connection_id)
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Get total memory usage.
    pub fn total_memory(&self) -> usize {
        self.connections.values().map(ConnTracker::memory_usage).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::MessageType;

    const ROLLBACK_REQ: &[u8] = b"Q\x00\x00\x00\x0dROLLBACK\x00";
    const ROLLBACK_RESP: &[u8] = b"C\x00\x00\x00\x0dROLLBACK\x00";

    fn req(ts: u64, data: &[u8]) -> RawEvent<'_> {
        RawEvent::new(MessageType::Request, 0, ts, data)
    }

    fn resp(ts: u64, data: &[u8]) -> RawEvent<'_> {
        RawEvent::new(MessageType::Response, 0, ts, data)
    }

    // Test 1: Trackers are created lazily
    #[test]
    fn test_add_event_creates_tracker() {
        let mut manager = StreamManager::with_defaults();
        assert_eq!(manager.connection_count(), 0);

        manager.add_event(1, Protocol::Pgsql, req(10, ROLLBACK_REQ)).unwrap();
        manager.add_event(1, Protocol::Pgsql, resp(20, ROLLBACK_RESP)).unwrap();

        assert_eq!(manager.connection_count(), 1);
        assert_eq!(manager.get(1).unwrap().protocol(), Protocol::Pgsql);
        assert!(manager.total_memory() > 0);
    }

    // Test 2: Records from every connection
    #[test]
    fn test_process_all() {
        let mut manager = StreamManager::with_defaults();
        for id in [7, 3] {
            manager.add_event(id, Protocol::Pgsql, req(10, ROLLBACK_REQ)).unwrap();
            manager.add_event(id, Protocol::Pgsql, resp(20, ROLLBACK_RESP)).unwrap();
        }

        let output = manager.process_all();

        assert_eq!(output.error_count, 0);
        let ids: Vec<u64> = output.records.iter().map(|r| r.connection_id).collect();
        assert_eq!(ids, vec![3, 7]);
        assert_eq!(manager.total_memory(), 0);
    }

    // Test 3: A connection keeps the protocol it started with
    #[test]
    fn test_protocol_mismatch() {
        let mut manager = StreamManager::with_defaults();
        manager.add_event(1, Protocol::Pgsql, req(10, ROLLBACK_REQ)).unwrap();

        let err = manager
            .add_event(1, Protocol::Mysql, req(20, b"x"))
            .unwrap_err();
        match err {
            Error::ProtocolMismatch {
                connection_id,
                tracked,
                requested,
            } => {
                assert_eq!(connection_id, 1);
                assert_eq!(tracked, Protocol::Pgsql);
                assert_eq!(requested, Protocol::Mysql);
            }
            other => panic!("Expected ProtocolMismatch, got {other:?}"),
        }
    }

    // Test 4: Connection limit
    #[test]
    fn test_connection_limit() {
        let mut manager = StreamManager::new(StreamConfig {
            max_connections: 1,
            ..Default::default()
        });
        manager.add_event(1, Protocol::Redis, req(10, b"*1\r\n")).unwrap();

        let err = manager.add_event(2, Protocol::Redis, req(10, b"*1\r\n"));
        assert!(matches!(err, Err(Error::ConnectionLimit { limit: 1 })));

        // Existing connections still accept events.
        assert!(manager
            .add_event(1, Protocol::Redis, RawEvent::new(MessageType::Request, 4, 11, b"$4\r\n"))
            .is_ok());
    }

    // Test 5: Close reports discarded frames
    #[test]
    fn test_close_connection() {
        let mut manager = StreamManager::with_defaults();
        manager.add_event(1, Protocol::Pgsql, req(10, ROLLBACK_REQ)).unwrap();
        manager.process_all();

        let stats = manager.close_connection(1).unwrap();
        assert_eq!(stats.request_frames, 1);
        assert_eq!(stats.discarded_frames, 1);
        assert_eq!(manager.connection_count(), 0);
        assert!(manager.close_connection(1).is_none());
    }

    // Test 6: Idle cleanup uses the caller's clock
    #[test]
    fn test_cleanup_idle() {
        let mut manager = StreamManager::new(StreamConfig {
            idle_timeout_ns: 1_000,
            ..Default::default()
        });
        manager.add_event(1, Protocol::Pgsql, req(100, ROLLBACK_REQ)).unwrap();
        manager.add_event(2, Protocol::Pgsql, req(5_000, ROLLBACK_REQ)).unwrap();

        let closed = manager.cleanup_idle(5_500);

        assert_eq!(closed.len(), 1);
        assert_eq!(closed[0].0, 1);
        assert_eq!(manager.connection_count(), 1);
        assert!(manager.get(2).is_some());
    }
}
