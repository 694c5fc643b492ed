//! Storage and delivery of user callbacks.
//!
//! Callbacks are held in reference-counted [`CallbackSlot`]s. The registry
//! and request tables hold one reference, notifications in flight hold others.
//! Cancelling retires the slot: a retired slot never invokes its callback
//! again, and retiring from outside the dispatch thread waits for an
//! invocation that is already running to return.
//!
//! Handlers collect [`Notification`]s while holding the context lock and
//! deliver them only after it is released.

use std::{
    cell::Cell,
    net::SocketAddr,
    panic::{self, AssertUnwindSafe},
    sync::{
        Arc, Mutex, MutexGuard, PoisonError,
        atomic::{AtomicBool, Ordering},
    },
};
use tracing::error;

use crate::{
    client::ClientError,
    dbr::{Dbr, DbrBasicType},
};

thread_local! {
    static DISPATCH_THREAD: Cell<bool> = const { Cell::new(false) };
}

pub(crate) fn mark_dispatch_thread() {
    DISPATCH_THREAD.with(|d| d.set(true));
}

/// Is the caller running on a context's dispatch thread, i.e. inside a callback?
pub fn is_dispatch_thread() -> bool {
    DISPATCH_THREAD.with(Cell::get)
}

/// Changes in a channel's connection, delivered to its connection callback
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionEvent {
    Connected {
        native_type: DbrBasicType,
        element_count: u32,
        server: SocketAddr,
    },
    Disconnected,
    /// The search retry bound was reached without any server answering
    NotFound,
}

pub type ConnectionCallback = dyn FnMut(ConnectionEvent) + Send;
pub type GetCallback = dyn FnOnce(Result<Dbr, ClientError>) + Send;
pub type PutCallback = dyn FnOnce(Result<(), ClientError>) + Send;
pub type UpdateCallback = dyn FnMut(Result<Dbr, ClientError>) + Send;

pub(crate) struct CallbackSlot<F: ?Sized> {
    retired: AtomicBool,
    callback: Mutex<Option<Box<F>>>,
}

impl<F: ?Sized> CallbackSlot<F> {
    pub fn new(callback: Box<F>) -> Arc<Self> {
        Arc::new(CallbackSlot {
            retired: AtomicBool::new(false),
            callback: Mutex::new(Some(callback)),
        })
    }

    pub fn is_retired(&self) -> bool {
        self.retired.load(Ordering::SeqCst)
    }

    /// Stop any further invocation of this callback.
    ///
    /// From the dispatch thread this only marks the slot, since the caller may
    /// be the callback itself.
    pub fn retire(&self) {
        self.retired.store(true, Ordering::SeqCst);
        if !is_dispatch_thread() {
            let callback = self.lock().take();
            drop(callback);
        }
    }

    fn lock(&self) -> MutexGuard<'_, Option<Box<F>>> {
        self.callback.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Type-erased handle for retiring any kind of slot
pub(crate) trait Retire: Send + Sync {
    fn retire(&self);
}

impl<F: ?Sized + Send> Retire for CallbackSlot<F> {
    fn retire(&self) {
        CallbackSlot::retire(self)
    }
}

/// A panicking callback must not take the dispatch thread down with it
fn guarded(f: impl FnOnce()) {
    if panic::catch_unwind(AssertUnwindSafe(f)).is_err() {
        error!("User callback panicked; continuing");
    }
}

impl<A> CallbackSlot<dyn FnMut(A) + Send> {
    pub fn invoke(&self, arg: A) {
        let mut slot = self.lock();
        if self.is_retired() {
            return;
        }
        if let Some(callback) = slot.as_mut() {
            guarded(|| callback(arg));
        }
    }
}

impl<A> CallbackSlot<dyn FnOnce(A) + Send> {
    pub fn invoke_once(&self, arg: A) {
        let mut slot = self.lock();
        if self.is_retired() {
            return;
        }
        if let Some(callback) = slot.take() {
            guarded(|| callback(arg));
        }
    }
}

/// A callback invocation waiting for the context lock to be released
pub(crate) enum Notification {
    Connection(Arc<CallbackSlot<ConnectionCallback>>, ConnectionEvent),
    Get(Arc<CallbackSlot<GetCallback>>, Result<Dbr, ClientError>),
    Put(Arc<CallbackSlot<PutCallback>>, Result<(), ClientError>),
    Update(Arc<CallbackSlot<UpdateCallback>>, Result<Dbr, ClientError>),
}

impl Notification {
    pub fn deliver(self) {
        match self {
            Notification::Connection(slot, event) => slot.invoke(event),
            Notification::Get(slot, result) => slot.invoke_once(result),
            Notification::Put(slot, result) => slot.invoke_once(result),
            Notification::Update(slot, result) => slot.invoke(result),
        }
    }
}

pub(crate) fn deliver_all(notifications: Vec<Notification>) {
    for notification in notifications {
        notification.deliver();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{
        sync::{
            atomic::AtomicUsize,
            mpsc,
        },
        thread,
        time::Duration,
    };

    #[test]
    fn retired_slot_is_silent() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let slot: Arc<CallbackSlot<ConnectionCallback>> =
            CallbackSlot::new(Box::new(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            }));
        slot.invoke(ConnectionEvent::Disconnected);
        slot.invoke(ConnectionEvent::Disconnected);
        slot.retire();
        slot.invoke(ConnectionEvent::Disconnected);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert!(slot.is_retired());
    }

    #[test]
    fn one_shot_runs_once() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let slot: Arc<CallbackSlot<PutCallback>> = CallbackSlot::new(Box::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));
        slot.invoke_once(Ok(()));
        slot.invoke_once(Err(ClientError::Disconnected));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn retire_waits_for_running_callback() {
        let finished = Arc::new(AtomicBool::new(false));
        let flag = finished.clone();
        let (started_tx, started_rx) = mpsc::channel();
        let slot: Arc<CallbackSlot<ConnectionCallback>> =
            CallbackSlot::new(Box::new(move |_| {
                let _ = started_tx.send(());
                thread::sleep(Duration::from_millis(100));
                flag.store(true, Ordering::SeqCst);
            }));
        let dispatcher = {
            let slot = slot.clone();
            thread::spawn(move || {
                mark_dispatch_thread();
                slot.invoke(ConnectionEvent::NotFound);
            })
        };
        started_rx.recv().unwrap();
        slot.retire();
        assert!(finished.load(Ordering::SeqCst));
        dispatcher.join().unwrap();
    }

    #[test]
    fn panicking_callback_is_contained() {
        let slot: Arc<CallbackSlot<UpdateCallback>> =
            CallbackSlot::new(Box::new(|_| panic!("callback failure")));
        slot.invoke(Err(ClientError::Disconnected));
        slot.invoke(Err(ClientError::Disconnected));
    }
}
