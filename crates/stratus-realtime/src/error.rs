// Caller-facing failures.
//
// Transport failures never reach callers directly: the read loop absorbs them
// and reconnects. What callers see is the outcome of their own wait.
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// The connection went away (manual disconnect or transport loss) while
    /// the caller was waiting.
    #[error("connection closed")]
    ConnectionClosed,
    #[error("connection not established")]
    NotConnected,
    #[error("request {request_id} timed out")]
    Timeout { request_id: String },
    /// The server answered the correlated request with an `error` envelope.
    #[error("server error: {message}")]
    Server { message: String },
    #[error("transport error: {0:#}")]
    Transport(#[from] anyhow::Error),
    #[error("failed to encode payload")]
    Encode(#[source] stratus_wire::Error),
}

impl Error {
    /// Whether retrying after a reconnect could succeed.
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self,
            Error::ConnectionClosed | Error::NotConnected | Error::Transport(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messages_are_stable() {
        assert_eq!(Error::NotConnected.to_string(), "connection not established");
        assert_eq!(
            Error::Timeout {
                request_id: "r1".to_string()
            }
            .to_string(),
            "request r1 timed out"
        );
        assert_eq!(
            Error::Server {
                message: "denied".to_string()
            }
            .to_string(),
            "server error: denied"
        );
        assert!(Error::ConnectionClosed.is_connection_error());
        assert!(
            !Error::Server {
                message: String::new()
            }
            .is_connection_error()
        );
    }
}
