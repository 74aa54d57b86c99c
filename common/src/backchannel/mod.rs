// Back-channel between the executor and its child processes
// Children POST JSON messages keyed by their correlation id

pub mod client;
pub mod messages;
pub mod server;

pub use client::BackChannelClient;
pub use messages::{BackChannelMessage, MessageSink};
pub use server::BackChannelServer;
