// Error taxonomy for the reporter.
//
// Only `Config` is allowed to stop the process, and only before collection starts.  Everything
// else degrades to partial data: a failed source yields nothing for that collector, a malformed
// record is dropped, a failed push is logged.  Merging two samples with the same identity is not
// an error at all; the registry handles it.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("source unavailable: {source_name}: {reason}")]
    SourceUnavailable { source_name: String, reason: String },

    #[error("malformed record: {0}")]
    MalformedRecord(String),

    #[error("transport failure: HTTP {status}: {body}")]
    TransportFailure { status: u16, body: String },

    #[error("configuration: {0}")]
    Config(String),
}

impl Error {
    pub fn unavailable<S: ToString, R: ToString>(source_name: S, reason: R) -> Error {
        Error::SourceUnavailable {
            source_name: source_name.to_string(),
            reason: reason.to_string(),
        }
    }

    pub fn malformed<S: ToString>(what: S) -> Error {
        Error::MalformedRecord(what.to_string())
    }
}
