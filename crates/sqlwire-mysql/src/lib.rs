//! Synchronous MySQL wire protocol client.
//!
//! This crate implements the MySQL client/server protocol directly over a
//! blocking byte stream. It provides:
//!
//! - Packet framing with sequence numbers
//! - Authentication (mysql_native_password, caching_sha2_password,
//!   sha256_password, opt-in mysql_clear_password)
//! - Text and binary query protocols
//! - Buffered and streaming cursors with drain-on-close
//! - LOCAL INFILE with a client-side file policy
//!
//! # MySQL Protocol Overview
//!
//! MySQL uses a packet-based protocol with:
//! - 3-byte payload length + 1-byte sequence number header
//! - Packets over 16MB are split
//! - One outstanding command per connection
//!
//! # Example
//!
//! ```rust,ignore
//! use sqlwire_mysql::{MySqlConfig, MySqlConnection};
//!
//! let config = MySqlConfig::new()
//!     .host("localhost")
//!     .port(3306)
//!     .user("root")
//!     .database("mydb");
//!
//! let mut conn = MySqlConnection::connect(config)?;
//! let mut cursor = conn.streaming_cursor();
//! cursor.execute("SELECT id, name FROM users")?;
//! while let Some(row) = cursor.fetch_one()? {
//!     println!("{:?}", row.get_named::<String>("name")?);
//! }
//! ```

pub mod auth;
pub mod config;
pub mod connection;
pub mod cursor;
pub mod infile;
pub mod protocol;
pub mod stream;
pub mod types;

pub use config::{LocalInfilePolicy, MySqlConfig};
pub use connection::{ConnectionState, MySqlConnection, SessionInfo, cancel_query};
pub use cursor::{Cursor, CursorKind, CursorState, ExecuteOutcome};
pub use infile::{FileSystemProvider, InfileProvider};
pub use sqlwire_core::{Error, Result, Row, Value};
pub use types::{ColumnDef, FieldType};
