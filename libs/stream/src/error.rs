use std::time::Duration;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Codec error: {0}")]
    Codec(String),

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Invalid frame: {0}")]
    InvalidFrame(String),

    #[error("Cannot resolve address {address}: {source}")]
    Resolve {
        address: String,
        source: std::io::Error,
    },

    #[error("Unknown endpoint: {0}")]
    UnknownEndpoint(String),

    #[error("Send ACK timeout after {attempts} attempts")]
    SendTimeout { attempts: u32 },

    #[error("Target does not recognize exchange {id}")]
    Rejected { id: u32 },

    #[error("Response timeout after {0:?}")]
    ResponseTimeout(Duration),

    #[error("Correlation table exhausted ({capacity} slots)")]
    TableExhausted { capacity: u32 },

    #[error("Invalid config: {0}")]
    InvalidConfig(String),
}

pub type Result<T> = std::result::Result<T, Error>;
