//! Protocol handlers.
//!
//! Each submodule defines a zero-sized handler implementing
//! [`ProtocolHandler`](crate::stream::ProtocolHandler) together with its
//! frame, record and state types.

pub mod amqp;
pub mod cql;
pub mod dns;
pub mod http;
pub mod http2;
pub mod kafka;
pub mod mux;
pub mod mysql;
pub mod nats;
pub mod pgsql;
pub mod redis;

pub use amqp::Amqp;
pub use cql::Cql;
pub use dns::Dns;
pub use http::Http;
pub use http2::Http2;
pub use kafka::Kafka;
pub use mux::Mux;
pub use mysql::Mysql;
pub use nats::Nats;
pub use pgsql::Pgsql;
pub use redis::Redis;
