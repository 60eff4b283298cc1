use std::fmt;
use std::str::FromStr;

use crate::error::Error;

/// The closed set of protocols the tracker can reconstruct.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Protocol {
    Pgsql,
    Cql,
    Amqp,
    Nats,
    Mysql,
    Kafka,
    Redis,
    Dns,
    Http,
    Http2,
    Mux,
}

impl Protocol {
    /// Every supported protocol, in declaration order.
    pub const ALL: [Protocol; 11] = [
        Protocol::Pgsql,
        Protocol::Cql,
        Protocol::Amqp,
        Protocol::Nats,
        Protocol::Mysql,
        Protocol::Kafka,
        Protocol::Redis,
        Protocol::Dns,
        Protocol::Http,
        Protocol::Http2,
        Protocol::Mux,
    ];

    /// Protocol identifier (e.g., "pgsql", "http2").
    pub fn name(&self) -> &'static str {
        match self {
            Protocol::Pgsql => "pgsql",
            Protocol::Cql => "cql",
            Protocol::Amqp => "amqp",
            Protocol::Nats => "nats",
            Protocol::Mysql => "mysql",
            Protocol::Kafka => "kafka",
            Protocol::Redis => "redis",
            Protocol::Dns => "dns",
            Protocol::Http => "http",
            Protocol::Http2 => "http2",
            Protocol::Mux => "mux",
        }
    }

    /// Human-readable name.
    pub fn display_name(&self) -> &'static str {
        match self {
            Protocol::Pgsql => "PostgreSQL",
            Protocol::Cql => "Cassandra CQL",
            Protocol::Amqp => "AMQP 0-9-1",
            Protocol::Nats => "NATS",
            Protocol::Mysql => "MySQL",
            Protocol::Kafka => "Kafka",
            Protocol::Redis => "Redis",
            Protocol::Dns => "DNS",
            Protocol::Http => "HTTP/1.x",
            Protocol::Http2 => "HTTP/2",
            Protocol::Mux => "Mux",
        }
    }

    /// Look a protocol up by identifier (case-insensitive).
    pub fn from_name(name: &str) -> Option<Protocol> {
        Protocol::ALL
            .iter()
            .copied()
            .find(|p| p.name().eq_ignore_ascii_case(name))
    }

    /// Whether frames carry a stream key that demultiplexes exchanges.
    pub fn is_multiplexed(&self) -> bool {
        matches!(
            self,
            Protocol::Cql
                | Protocol::Amqp
                | Protocol::Kafka
                | Protocol::Dns
                | Protocol::Http2
                | Protocol::Mux
        )
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Protocol {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Protocol::from_name(s).ok_or_else(|| Error::UnknownProtocol(s.to_string()))
    }
}
