// Realtime subscriptions and messaging.
//
// Two channels share one connection supervisor, one subscription registry
// type, and one reconnect policy:
// - `StreamChannel`: server push over a long-lived event stream, with the
//   key set submitted out of band.
// - `SocketChannel`: duplex JSON envelopes with request/ack correlation.
#[macro_use]
mod macros;

mod backoff;
mod config;
mod error;
mod handle;
mod lifecycle;
mod pending;
mod registry;
mod socket;
mod stream;

pub use backoff::Backoff;
pub use config::RealtimeConfig;
pub use error::{Error, Result};
pub use handle::UnsubscribeHandle;
pub use lifecycle::{ConnectionState, DisconnectHook};
pub use pending::{PendingAck, PendingRequests};
pub use registry::{Callback, Removed, SubscriptionRegistry, callback};
pub use socket::{SocketChannel, SocketMessage};
pub use stream::{StreamChannel, SubscribeOptions, topic_key};
