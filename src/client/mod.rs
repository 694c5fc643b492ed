//! The Channel Access client: a [`Context`] that searches for channels,
//! manages circuits to the servers that host them, and routes replies to
//! callbacks.

mod beacons;
mod callbacks;
mod channels;
mod circuit;
mod context;
mod error;
mod requests;
mod searcher;
mod send_buffer;

pub use callbacks::{ConnectionEvent, is_dispatch_thread};
pub use channels::ChannelState;
pub use context::{Channel, Context, ContextBuilder, PendingGet, Subscription};
pub use error::ClientError;
pub use requests::RequestType;
