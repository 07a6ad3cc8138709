use crate::protocol::ResultCode;
use thiserror::Error;

/// Engine error taxonomy. Clone is required: a single connection-fatal
/// failure is fanned out to every outstanding and future waiter.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum LdapError {
    /// A single wait_for_message call ran out of time. Does not affect
    /// other waiters or the connection.
    #[error("operation timed out")]
    Timeout,

    /// A single wait_for_message call was cancelled by its caller. The
    /// request is not abandoned on the server.
    #[error("operation cancelled")]
    Cancelled,

    /// Bad BER on the wire. Fatal to the connection.
    #[error("malformed BER data: {0}")]
    Malformed(String),

    /// Socket-level failure. Fatal to the connection.
    #[error("i/o error: {0}")]
    Io(String),

    /// The connection was closed (locally or by peer EOF). Fatal.
    #[error("connection closed: {0}")]
    ConnectionClosed(String),

    /// Unsolicited Notice of Disconnection from the server. Fatal.
    #[error("server notice of disconnection: {code} ({message})")]
    Disconnected { code: ResultCode, message: String },

    /// Non-success result code in a response. Local to the request that
    /// produced it; the connection stays usable.
    #[error("operation failed: {code} ({message})")]
    OperationFailed {
        code: ResultCode,
        matched_dn: String,
        message: String,
    },

    /// The server returned a referral. Surfaced, never followed.
    #[error("referral returned: {0:?}")]
    Referral(Vec<String>),

    /// Filter node with no wire serialization (Substrings, ExtensibleMatch).
    #[error("unsupported filter serialization: {0}")]
    UnsupportedFilter(String),

    /// Invalid filter string syntax.
    #[error("invalid filter: {0}")]
    InvalidFilter(String),

    /// Operation issued in a connection state that does not allow it.
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// SASL wrap/unwrap failure from the security-context collaborator.
    #[error("security layer error: {0}")]
    SecurityLayer(String),
}

impl LdapError {
    /// True for errors that poison the whole connection, as opposed to
    /// per-request outcomes.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            LdapError::Malformed(_)
                | LdapError::Io(_)
                | LdapError::ConnectionClosed(_)
                | LdapError::Disconnected { .. }
        )
    }
}

impl From<std::io::Error> for LdapError {
    fn from(e: std::io::Error) -> Self {
        LdapError::Io(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, LdapError>;
