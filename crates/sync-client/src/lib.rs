//! Network side of the Huddle sync engine: the REST backend, the
//! refresh-token session and the WebSocket change stream.

pub mod client;
pub mod error;
pub mod session;
pub mod stream;
pub mod types;

#[cfg(test)]
pub(crate) mod test_server;

pub use client::HuddleApiClient;
pub use error::{Result, SyncClientError};
pub use session::RefreshTokenSession;
pub use stream::{WebSocketConnection, WebSocketTransport};
