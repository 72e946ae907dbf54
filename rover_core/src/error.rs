use thiserror::Error;

/// Error type shared across the host core.
///
/// Only initialization failures are treated as fatal by the callers; sensor
/// and MCU anomalies are recovered locally and routing failures are surfaced
/// to the client as an explicit status byte.
#[derive(Error, Debug)]
pub enum RoverError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("MCU link error: {0}")]
    Mcu(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("map error: {0}")]
    Map(String),

    #[error("routing error: {0}")]
    Routing(String),
}

pub type RoverResult<T> = Result<T, RoverError>;
