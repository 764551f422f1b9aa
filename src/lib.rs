//! Async Redis connection engine
//!
//! `redis-conduit` is the connection core of a Redis client: it owns a
//! transport to one server, authenticates, detects the deployment topology
//! (standalone, Sentinel, Cluster) and dispatches commands asynchronously
//! with ordered request/response correlation. On top of that it implements
//! the multi-node operations a management client needs: cluster-wide key
//! scanning and flushing, iterative SCAN streaming and server-side
//! namespace aggregation.
//!
//! # Quick Start
//!
//! ```no_run
//! use redis_conduit::{Command, Connection, ConnectionConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = ConnectionConfig::new("localhost", 6379).with_password("secret");
//!     let conn = Connection::new(config);
//!
//!     conn.connect(true).await?;
//!
//!     let reply = conn.command_sync(Command::new(["GET", "mykey"])).await?;
//!     println!("Value: {:?}", reply.value());
//!
//!     conn.disconnect().await;
//!     Ok(())
//! }
//! ```

#![deny(warnings)]
#![warn(missing_docs)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_const_for_fn)]
#![allow(clippy::uninlined_format_args)]
#![allow(clippy::future_not_send)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_sign_loss)]
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::return_self_not_must_use)]

pub mod command;
pub mod connection;
pub mod core;
pub mod protocol;
pub mod response;
pub mod script;
pub mod server_info;
pub mod transporter;

pub use crate::command::{Command, CommandOwner, ResponseFuture, ScanCommand};
pub use crate::connection::{
    Connection, ConnectionEvent, Mode, NamespaceItems, END_OF_COLLECTION,
};
pub use crate::core::{
    config::ConnectionConfig,
    error::{RedisError, RedisResult},
    value::RespValue,
};
pub use crate::response::Response;
pub use crate::server_info::{DatabaseList, ServerInfo};
pub use crate::transporter::{TcpTransport, Transport, TransporterEvent};
