use std::io;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("config error: {0}")]
    Config(String),

    #[error("parse error: {0}")]
    Parse(String),

    #[error("packet too short: need {needed} bytes, have {actual}")]
    PacketTooShort { needed: usize, actual: usize },

    #[error("unsupported IP version {0}")]
    UnsupportedVersion(u8),

    #[error("QoS class {0} already exists")]
    DuplicateClass(String),

    #[error("packet source closed")]
    Closed,
}

pub type Result<T> = std::result::Result<T, Error>;
