//! Error types for sqlwire operations.
//!
//! Errors fall into two families:
//!
//! - **Operational**: transport, protocol, authentication, server and
//!   local-infile faults. These come from the environment and a caller may
//!   reasonably reconnect or retry.
//! - **Programming**: cursor state violations and type mismatches. These are
//!   API misuse and retrying will never help.
//!
//! Transport, protocol and authentication faults are also *fatal*: the
//! connection they occurred on is unusable and must be discarded.

use std::fmt;

/// The primary error type for all sqlwire operations.
#[derive(Debug)]
pub enum Error {
    /// Socket I/O failures and connect errors
    Transport(TransportError),
    /// Wire-level corruption (sequence desync, malformed frames)
    Protocol(ProtocolError),
    /// Credential rejection or plugin mismatch
    Auth(AuthError),
    /// ERR packet returned by the server
    Server(ServerError),
    /// Fault while answering a server-initiated LOCAL INFILE request
    LocalInfile(LocalInfileError),
    /// API misuse against the cursor/connection state machine
    CursorState(CursorStateError),
    /// Type conversion errors
    Type(TypeError),
    /// Configuration errors
    Config(ConfigError),
}

#[derive(Debug)]
pub struct TransportError {
    pub kind: TransportErrorKind,
    pub message: String,
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportErrorKind {
    /// Failed to establish the TCP connection
    Connect,
    /// Connection refused by the peer
    Refused,
    /// Connection lost during a read or write
    Disconnected,
    /// Socket read/write deadline expired
    Timeout,
    /// The connection was already marked broken by an earlier fault
    Unusable,
}

#[derive(Debug)]
pub struct ProtocolError {
    pub kind: ProtocolErrorKind,
    pub message: String,
    pub raw_data: Option<Vec<u8>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolErrorKind {
    /// Packet sequence number did not match the expected value
    SequenceMismatch { expected: u8, actual: u8 },
    /// Packet could not be parsed (truncated, bad length, bad column count)
    Malformed,
    /// A well-formed packet arrived where the protocol forbids it
    UnexpectedPacket,
}

#[derive(Debug)]
pub struct AuthError {
    pub kind: AuthErrorKind,
    pub message: String,
    /// Server error code when the server rejected the credentials
    pub code: Option<u16>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthErrorKind {
    /// Server rejected the credentials
    Rejected,
    /// Server asked for an authentication plugin this client does not implement
    UnsupportedPlugin(String),
    /// Full authentication was requested but cannot be performed
    FullAuthUnavailable,
}

#[derive(Debug, Clone)]
pub struct ServerError {
    pub kind: ServerErrorKind,
    pub code: u16,
    pub sqlstate: Option<String>,
    pub message: String,
    pub sql: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerErrorKind {
    /// Syntax error in SQL
    Syntax,
    /// Constraint violation (unique, foreign key, not null)
    Constraint,
    /// Database, table or column not found
    NotFound,
    /// Permission denied
    Permission,
    /// Deadlock detected
    Deadlock,
    /// Lock wait timeout exceeded
    LockTimeout,
    /// Statement was killed or interrupted
    Interrupted,
    /// Any other server error
    Other,
}

#[derive(Debug)]
pub struct LocalInfileError {
    pub kind: LocalInfileErrorKind,
    /// Filename token as sent by the server
    pub filename: String,
    /// Reply the server sent after the client terminated the transfer
    pub server: Option<ServerError>,
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LocalInfileErrorKind {
    /// Local infile is disabled or the policy rejected the filename
    Denied,
    /// The requested resource does not exist
    NotFound,
    /// The resource exists but reading it failed
    Io,
}

#[derive(Debug)]
pub struct CursorStateError {
    pub kind: CursorStateErrorKind,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CursorStateErrorKind {
    /// A streaming result is still pending on the connection
    Busy,
    /// The cursor has no more rows
    Exhausted,
    /// The cursor was closed
    Closed,
    /// Fetch called before any statement produced a result set
    NoResultSet,
    /// Operation requires a buffered cursor
    BufferedOnly,
    /// The connection was closed by the caller
    ConnectionClosed,
}

#[derive(Debug)]
pub struct TypeError {
    pub expected: &'static str,
    pub actual: String,
    pub column: Option<String>,
}

#[derive(Debug)]
pub struct ConfigError {
    pub message: String,
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl ServerErrorKind {
    /// Classify a MySQL server error code.
    pub fn from_code(code: u16) -> Self {
        match code {
            1064 | 1149 => ServerErrorKind::Syntax,
            1022 | 1048 | 1062 | 1169 | 1216 | 1217 | 1451 | 1452 | 1557 | 1586 => {
                ServerErrorKind::Constraint
            }
            1046 | 1049 | 1051 | 1054 | 1091 | 1146 => ServerErrorKind::NotFound,
            1044 | 1045 | 1142 | 1143 | 1227 | 1148 => ServerErrorKind::Permission,
            1213 => ServerErrorKind::Deadlock,
            1205 => ServerErrorKind::LockTimeout,
            1053 | 1317 | 3024 => ServerErrorKind::Interrupted,
            _ => ServerErrorKind::Other,
        }
    }
}

impl ServerError {
    /// Build a server error from the fields of an ERR packet.
    pub fn new(code: u16, sqlstate: Option<String>, message: impl Into<String>) -> Self {
        Self {
            kind: ServerErrorKind::from_code(code),
            code,
            sqlstate: sqlstate.filter(|s| !s.is_empty()),
            message: message.into(),
            sql: None,
        }
    }

    /// Attach the SQL text that produced this error.
    pub fn with_sql(mut self, sql: impl Into<String>) -> Self {
        self.sql = Some(sql.into());
        self
    }
}

impl Error {
    /// Is this an environmental fault rather than API misuse?
    pub fn is_operational(&self) -> bool {
        matches!(
            self,
            Error::Transport(_)
                | Error::Protocol(_)
                | Error::Auth(_)
                | Error::Server(_)
                | Error::LocalInfile(_)
        )
    }

    /// Is this a programming error (misuse of the API)?
    pub fn is_programming(&self) -> bool {
        matches!(self, Error::CursorState(_) | Error::Type(_))
    }

    /// Does this error leave the connection unusable?
    ///
    /// Transport, protocol and authentication faults leave the sequence state
    /// indeterminate; the connection must be closed and re-established.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::Transport(_) | Error::Protocol(_) | Error::Auth(_)
        )
    }

    /// Is a retry likely to succeed (on a fresh connection where fatal)?
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Server(s) => matches!(
                s.kind,
                ServerErrorKind::Deadlock | ServerErrorKind::LockTimeout
            ),
            Error::Transport(t) => !matches!(t.kind, TransportErrorKind::Unusable),
            _ => false,
        }
    }

    /// Get SQLSTATE if available.
    pub fn sqlstate(&self) -> Option<&str> {
        match self {
            Error::Server(s) => s.sqlstate.as_deref(),
            Error::LocalInfile(e) => e.server.as_ref().and_then(|s| s.sqlstate.as_deref()),
            _ => None,
        }
    }

    /// Get the server error code if the server reported one.
    pub fn server_code(&self) -> Option<u16> {
        match self {
            Error::Server(s) => Some(s.code),
            Error::Auth(a) => a.code,
            Error::LocalInfile(e) => e.server.as_ref().map(|s| s.code),
            _ => None,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Transport(e) => write!(f, "Transport error: {}", e.message),
            Error::Protocol(e) => write!(f, "Protocol error: {}", e.message),
            Error::Auth(e) => write!(f, "Authentication error: {}", e.message),
            Error::Server(e) => write!(f, "Server error {}", e),
            Error::LocalInfile(e) => write!(f, "Local infile error: {}", e),
            Error::CursorState(e) => write!(f, "Cursor state error: {}", e.message),
            Error::Type(e) => write!(f, "Type error: {}", e),
            Error::Config(e) => write!(f, "Configuration error: {}", e.message),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Transport(e) => e
                .source
                .as_deref()
                .map(|err| err as &(dyn std::error::Error + 'static)),
            Error::LocalInfile(e) => e
                .source
                .as_deref()
                .map(|err| err as &(dyn std::error::Error + 'static)),
            Error::Config(e) => e
                .source
                .as_deref()
                .map(|err| err as &(dyn std::error::Error + 'static)),
            _ => None,
        }
    }
}

impl fmt::Display for ServerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.sqlstate {
            Some(state) => write!(f, "({}, SQLSTATE {}): {}", self.code, state, self.message),
            None => write!(f, "({}): {}", self.code, self.message),
        }
    }
}

impl fmt::Display for LocalInfileError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            LocalInfileErrorKind::Denied => {
                write!(f, "local infile request for '{}' denied", self.filename)?;
            }
            LocalInfileErrorKind::NotFound => write!(f, "can't find file '{}'", self.filename)?,
            LocalInfileErrorKind::Io => write!(f, "failed reading '{}'", self.filename)?,
        }
        if let Some(server) = &self.server {
            write!(f, "; server replied {}", server)?;
        }
        Ok(())
    }
}

impl fmt::Display for TypeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(col) = &self.column {
            write!(
                f,
                "expected {} for column '{}', found {}",
                self.expected, col, self.actual
            )
        } else {
            write!(f, "expected {}, found {}", self.expected, self.actual)
        }
    }
}

impl From<TransportError> for Error {
    fn from(err: TransportError) -> Self {
        Error::Transport(err)
    }
}

impl From<ProtocolError> for Error {
    fn from(err: ProtocolError) -> Self {
        Error::Protocol(err)
    }
}

impl From<AuthError> for Error {
    fn from(err: AuthError) -> Self {
        Error::Auth(err)
    }
}

impl From<ServerError> for Error {
    fn from(err: ServerError) -> Self {
        Error::Server(err)
    }
}

impl From<LocalInfileError> for Error {
    fn from(err: LocalInfileError) -> Self {
        Error::LocalInfile(err)
    }
}

impl From<CursorStateError> for Error {
    fn from(err: CursorStateError) -> Self {
        Error::CursorState(err)
    }
}

impl From<TypeError> for Error {
    fn from(err: TypeError) -> Self {
        Error::Type(err)
    }
}

impl From<ConfigError> for Error {
    fn from(err: ConfigError) -> Self {
        Error::Config(err)
    }
}

/// Result type alias for sqlwire operations.
pub type Result<T> = std::result::Result<T, Error>;
