//! Remote invocation protocol: a node host presents its execution container
//! to a dispatcher as just another invoker, over one ordered message stream
//! per connection.

pub mod channel;
pub mod message;

mod client;
mod invoker;
mod server;

pub use client::RemoteNodeClient;
pub use invoker::RemoteNodeJobInvoker;
pub use message::RemoteNodeMessage;
pub use server::{serve_connection, RemoteNodeServer};
