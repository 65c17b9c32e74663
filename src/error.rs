// Copyright 2021 MaidSafe.net limited.
//
// This SAFE Network Software is licensed to you under The General Public License (GPL), version 3.
// Unless required by applicable law or agreed to in writing, the SAFE Network Software distributed
// under the GPL Licence is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied. Please review the Licences for the specific language governing
// permissions and limitations relating to use of the SAFE Network Software.

use std::result;
use thiserror::Error;

/// A specialised `Result` type for this crate.
pub type Result<T, E = Error> = result::Result<T, E>;

/// Main error type for the crate.
///
/// Variants split into three policy classes: protocol-fatal conditions
/// (the process must abort rather than continue with corrupt replication
/// state), configuration-fatal conditions (reported to the caller before
/// the stack starts), and value-level errors the caller retries or treats
/// as membership events.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum Error {
    /// Unrecoverable protocol violation, e.g. a fifo sequence regression,
    /// a failed message checksum or inconsistent primary component states.
    #[error("unrecoverable protocol error: {0}")]
    Unrecoverable(String),
    /// Invalid configuration supplied at construction.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    /// A parameter key that is not recognized by any layer.
    #[error("unknown parameter: {0}")]
    UnknownParameter(String),
    /// The parameter exists but cannot be changed at runtime.
    #[error("parameter is read-only: {0}")]
    ReadOnlyParameter(String),
    /// Message failed to parse.
    #[error("failed to parse: {0}")]
    FailedToParse(String),
    /// Serialisation error.
    #[error("serialisation error: {0}")]
    Serialisation(String),
    /// Received a message carrying an unsupported protocol version.
    #[error("unsupported protocol version: {0}")]
    UnsupportedVersion(u8),
    /// The send window is exhausted; the caller retries later.
    #[error("would block")]
    WouldBlock,
    /// User generated messages are not accepted outside a primary component.
    #[error("not in primary component")]
    NotPrimary,
    /// The stack is closed.
    #[error("connection closed")]
    Closed,
    /// Failed to reach the requested state before the configured deadline.
    #[error("timed out")]
    Timeout,
    /// Network failure.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// True for conditions under which the process must not continue to
    /// exchange group messages.
    pub fn is_unrecoverable(&self) -> bool {
        matches!(self, Error::Unrecoverable(_))
    }
}
