// Wire formats for the realtime transports.
//
// Two shapes share this crate:
// - the server-push text stream (`stream`), decoded line by line into frames, and
// - the duplex socket envelopes (`envelope`), one JSON object per text frame.
pub mod envelope;
pub mod stream;

pub use envelope::{Incoming, Outgoing, decode_incoming};
pub use stream::{CONNECT_EVENT, DEFAULT_EVENT, StreamDecoder, StreamFrame};

/// Default cap for a single buffered stream line.
pub const DEFAULT_MAX_LINE_BYTES: usize = 16 * 1024 * 1024;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("stream line exceeds {limit} bytes")]
    LineTooLong { limit: usize },
    #[error("failed to serialize envelope")]
    Serialize(serde_json::Error),
    #[error("failed to deserialize envelope")]
    Deserialize(serde_json::Error),
}
