// Error Module - Error taxonomy shared by the pipeline modules
use thiserror::Error;

/// Pipeline errors
#[derive(Error, Debug)]
pub enum Error {
    /// Sampling parameter outside its accepted range
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    /// Area, device or universe definition that cannot be used
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// Layout document refers to a name it never defines
    #[error("unknown {kind}: {name}")]
    UnknownReference { kind: &'static str, name: String },

    /// Frame acquisition failed
    #[error("capture failed: {0}")]
    Capture(String),

    /// Frame transmission failed
    #[error("transmission to {target} failed: {reason}")]
    Transmit { target: String, reason: String },

    /// A pool task panicked instead of returning
    #[error("worker task panicked: {0}")]
    TaskPanicked(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    TomlDe(#[from] toml::de::Error),

    #[error("TOML write error: {0}")]
    TomlSer(#[from] toml::ser::Error),

    #[error("image error: {0}")]
    Image(#[from] image::ImageError),
}

pub type Result<T> = std::result::Result<T, Error>;
