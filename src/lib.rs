// #![warn(missing_docs)]

//! Rust implementation of an EPICS Channel Access client.
//!
//! This crate is a pure-rust implementation of the client side of the
//! [EPICS CA protocol]. It does not depend on the C-based [epics-base] project
//! at all.
//!
//! <div class="warning">This is an early version of this library. Interfaces or
//! structure may be changed around between versions until a comfortable final
//! design is settled upon.</div>
//!
//! The crate is split into:
//!
//! - Mapping and serialization/deserialization of message types, in module [messages].
//! - Representing data for transferring back and forth (["DBR" types]) via CA in module
//!   [dbr].
//! - A [client::Context] that finds channels by name over UDP, keeps one TCP circuit
//!   per server, and routes replies and subscription updates to callbacks.
//! - [config::ContextConfig], seeded from the usual `EPICS_CA_*` environment variables.
//!
//! Each context runs its own dispatch thread. Callbacks are run on that thread, never
//! while any lock inside the context is held, so they are free to call back into the
//! context; blocking calls made from a callback fail with
//! [`ClientError::NotAllowedInCallback`](client::ClientError::NotAllowedInCallback)
//! rather than deadlocking.
//!
//! ## Example
//!
//! Reading a value once, and then watching it for changes:
//!
//! ```no_run
//! # use std::time::Duration;
//! use ca_client::{client::{Context, RequestType}, messages::MonitorMask};
//!
//! let context = Context::new().unwrap();
//! let channel = context.create_channel("TEMP1").unwrap();
//! context.pend_io(Duration::from_secs(2)).unwrap();
//!
//! let value = channel
//!     .get(RequestType::default())
//!     .unwrap()
//!     .wait(Duration::from_secs(2))
//!     .unwrap();
//! println!("TEMP1 is {}", value.value());
//!
//! let _subscription = channel
//!     .subscribe(RequestType::default(), MonitorMask::default(), |update| {
//!         println!("TEMP1 update: {update:?}");
//!     })
//!     .unwrap();
//! context.pend_event(Duration::from_secs(10)).unwrap();
//! ```
//!
//! [EPICS CA protocol]:
//!     https://docs.epics-controls.org/en/latest/internal/ca_protocol.html
//! [epics-base]: https://github.com/epics-base/epics-base
//! ["DBR" types]:
//!     https://docs.epics-controls.org/en/latest/internal/ca_protocol.html#payload-data-types

use std::sync::Mutex;

pub mod client;
pub mod config;
pub mod dbr;
pub mod messages;
mod utils;

pub use crate::client::{Context, ContextBuilder};
pub use crate::utils::parse_address_list;

static DEFAULT_CONTEXT: Mutex<Option<&'static Context>> = Mutex::new(None);

/// A process-wide context, started from the environment on first use.
///
/// It lives until the process exits. Libraries should prefer taking a
/// [`Context`] from their caller.
pub fn default_context() -> Result<&'static Context, client::ClientError> {
    let mut slot = DEFAULT_CONTEXT.lock().unwrap();
    if let Some(context) = *slot {
        return Ok(context);
    }
    let context: &'static Context = Box::leak(Box::new(Context::new()?));
    *slot = Some(context);
    Ok(context)
}
