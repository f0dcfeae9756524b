//! Core types for sqlwire.
//!
//! This crate provides the types shared by the protocol engine and its
//! callers:
//!
//! - `Error` taxonomy separating operational faults from API misuse
//! - `Value` for dynamically-typed column values
//! - `Row` with shared column metadata and typed access

pub mod error;
pub mod row;
pub mod value;

pub use error::{
    AuthError, AuthErrorKind, ConfigError, CursorStateError, CursorStateErrorKind, Error,
    LocalInfileError, LocalInfileErrorKind, ProtocolError, ProtocolErrorKind, Result, ServerError,
    ServerErrorKind, TransportError, TransportErrorKind, TypeError,
};
pub use row::{ColumnInfo, FromValue, Row};
pub use value::Value;
