//! The request-level error type and its terminal classification.

use tonic::{Code, Status};

/// An error recorded into a request. Once set, later pipeline stages
/// observe it and become no-ops; the terminal mapping to a transport
/// status happens in [Error::to_status].
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// An RPC against the backend failed.
    #[error(transparent)]
    Rpc(#[from] Status),

    /// A failure of the adapter itself (wrapper synthesis, symlink
    /// rewriting, bookkeeping inconsistencies).
    #[error("{0}")]
    Internal(String),
}

impl Error {
    pub fn internal(msg: impl Into<String>) -> Self {
        Error::Internal(msg.into())
    }

    pub fn code(&self) -> Code {
        match self {
            Error::Rpc(s) => s.code(),
            Error::Internal(_) => Code::Internal,
        }
    }

    /// The transport status reported to the frontend.
    ///
    /// Cancellation, deadline expiry and aborts pass through verbatim.
    /// So does `Unauthenticated`: it means the access token expired
    /// mid-call, and the frontend retries with a refreshed one.
    /// Everything else is the adapter's problem, not the caller's, and
    /// is wrapped as `Internal`.
    pub fn to_status(&self) -> Status {
        match self {
            Error::Rpc(s) => match s.code() {
                Code::Cancelled | Code::DeadlineExceeded | Code::Aborted | Code::Unauthenticated => {
                    Status::new(s.code(), s.message())
                }
                _ => Status::internal(format!("exec error: {}", s.message())),
            },
            Error::Internal(msg) => Status::internal(format!("exec error: {}", msg)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn passthrough_codes_survive() {
        for code in [
            Code::Cancelled,
            Code::DeadlineExceeded,
            Code::Aborted,
            Code::Unauthenticated,
        ] {
            let err = Error::from(Status::new(code, "boom"));
            let status = err.to_status();
            assert_eq!(status.code(), code);
            assert_eq!(status.message(), "boom");
        }
    }

    #[test]
    fn everything_else_becomes_internal() {
        let err = Error::from(Status::unavailable("backend down"));
        assert_eq!(err.to_status().code(), Code::Internal);

        let err = Error::internal("wrapper script: no run.exe");
        assert_eq!(err.to_status().code(), Code::Internal);
        assert!(err.to_status().message().contains("no run.exe"));
    }
}
