//! Error types for every fallible stage of the pipeline.
//!
//! Delivery failures are not errors here: a send always produces an
//! [`Outcome`](crate::transmit::Outcome), and the orchestrator decides what
//! to do with it. The enums below cover everything that fails *before* a
//! request leaves the device or *around* the local queue file.

use std::path::PathBuf;

use thiserror::Error;

/// Problems found while loading or validating [`Config`](crate::config::Config).
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("missing required setting `{0}`")]
    Missing(&'static str),

    #[error("invalid value for `{key}`: {reason}")]
    Invalid { key: &'static str, reason: String },

    #[error("unknown timezone `{0}`")]
    UnknownTimezone(String),
}

/// Failures while building, sealing or opening a dispatch envelope.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("nothing to report: averaged set is empty")]
    EmptyEnvelope,

    #[error("envelope must carry exactly one station, found {0}")]
    StationCount(usize),

    #[error("envelope must carry exactly one device, found {0}")]
    DeviceCount(usize),

    #[error("envelope serialization failed: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("ciphertext is not valid base64: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error("ciphertext could not be decrypted with the shared secret")]
    Decrypt,

    #[error("decrypted payload is not UTF-8")]
    Utf8,

    #[error("malformed envelope: {0}")]
    Malformed(String),

    #[error("invalid RSA public key: {0}")]
    PublicKey(String),

    #[error("invalid RSA private key: {0}")]
    PrivateKey(String),

    #[error("RSA operation failed: {0}")]
    Rsa(#[from] rsa::Error),
}

/// Why a dispatch timestamp would be refused by the receiver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum TimestampError {
    #[error("timestamp is older than the 7-day backdate limit")]
    Backdated,

    #[error("timestamp is in the future")]
    Future,

    #[error("timestamp is not on a {0}-minute boundary")]
    Misaligned(u32),
}

/// Failure queue persistence and drain coordination errors.
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("queue file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("queue file {path} is not valid JSON: {source}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("a drain is already in progress")]
    DrainInProgress,
}

/// A single sensor source failed to produce readings this cycle.
#[derive(Debug, Error)]
pub enum SourceError {
    #[error("{source_name}: request failed: {message}")]
    Request { source_name: String, message: String },

    #[error("{source_name}: unexpected response: {message}")]
    Response { source_name: String, message: String },

    #[error("{0}: acquisition device disconnected")]
    Disconnected(String),
}
