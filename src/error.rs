//! Error kinds of the gateway core.
//!
//! Frame level problems live in [`crate::protocol::FrameError`] and never
//! leave the receive path on their own; everything else ends up here.
use crate::protocol as proto;
use std::time::Duration;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// The device could not be reached; a retry is up to the caller.
    #[error("Cannot connect to {address}: {source}")]
    Connect {
        address: String,
        #[source]
        source: std::io::Error,
    },

    /// The established connection broke down.
    #[error("Link lost: {0}")]
    LinkLost(#[source] std::io::Error),

    #[error("No matching reply within {0:?}")]
    RequestTimeout(Duration),

    #[error("Device unresponsive after {0} consecutive request timeouts")]
    Unresponsive(u32),

    /// Another request is still awaiting its reply.
    #[error("A request is already pending on the link")]
    Busy,

    #[error("Write slot is occupied, command rejected")]
    WriteSlotFull,

    #[error("Unknown writable parameter '{0}'")]
    UnknownParameter(String),

    #[error("Invalid value '{value}' for parameter '{parameter}'")]
    InvalidValue { parameter: String, value: String },

    #[error(transparent)]
    Frame(#[from] proto::FrameError),

    #[error("Operation cancelled")]
    Cancelled,
}

impl Error {
    pub(crate) fn link_closed() -> Self {
        Error::LinkLost(std::io::Error::new(
            std::io::ErrorKind::ConnectionAborted,
            "receive activity stopped",
        ))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
