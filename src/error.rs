use crate::whois::WhoIsError;
use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Errors surfaced by the aggregation core and its collaborators
#[derive(Debug, Error)]
pub enum Error {
    /// A `YYYY-MM-DD` argument could not be parsed
    #[error("{which} date '{value}' is not valid (expected YYYY-MM-DD)")]
    InvalidDate { which: &'static str, value: String },

    #[error("specify at least one --code argument; use the codes command to list possible codes")]
    NoCodesSpecified,

    #[error("file does not exist: {}", path.display())]
    NotFound { path: PathBuf },

    #[error("could not decode snapshot {}: {source}", path.display())]
    DecodeFailure {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("the database at {} is for site {found}, not {expected}", path.display())]
    SiteMismatch {
        path: PathBuf,
        found: String,
        expected: String,
    },

    #[error("i/o failure on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// The visit source failed or returned something unusable
    #[error("visit source failure: {0}")]
    Upstream(String),

    #[error("whois lookup for {ip} failed: {source}")]
    WhoIs {
        ip: String,
        #[source]
        source: WhoIsError,
    },

    #[error("environment variable {0} must be set")]
    MissingCredentials(&'static str),
}

impl Error {
    pub fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Error::Io {
            path: path.into(),
            source,
        }
    }
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        Error::Upstream(err.to_string())
    }
}
