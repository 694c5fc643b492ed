//! The bounded outbound byte queue of a virtual circuit.
//!
//! Application threads push encoded messages; the circuit's writer task takes
//! everything queued in one go and writes it to the socket. Bytes queued before
//! the circuit is established are held until [`SendBuffer::start_draining`].

use std::{
    mem,
    sync::{Condvar, Mutex, MutexGuard, PoisonError},
    time::{Duration, Instant},
};

use tokio::sync::Notify;

use crate::client::ClientError;

#[derive(Debug, Clone, Copy)]
pub(crate) enum PushMode {
    /// Wait up to this long for space
    Block(Duration),
    /// Fail at once if there is no space
    NoWait,
    /// Protocol traffic from the engine itself, ignores the bound
    Internal,
}

pub(crate) enum Taken {
    Data(Vec<u8>),
    Empty,
    Closed,
}

#[derive(Default)]
struct SendState {
    queued: Vec<u8>,
    draining: bool,
    closed: bool,
    high_water: usize,
}

pub(crate) struct SendBuffer {
    state: Mutex<SendState>,
    /// Signalled when the writer takes bytes, or the buffer closes
    space: Condvar,
    /// Wakes the writer task
    wake: Notify,
    capacity: usize,
}

impl SendBuffer {
    pub fn new(capacity: usize) -> Self {
        SendBuffer {
            state: Mutex::new(SendState::default()),
            space: Condvar::new(),
            wake: Notify::new(),
            capacity,
        }
    }

    fn lock(&self) -> MutexGuard<'_, SendState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Queue an encoded message.
    ///
    /// A message is always accepted into an empty buffer, however large.
    pub fn push(&self, message: &[u8], mode: PushMode) -> Result<(), ClientError> {
        let deadline = match mode {
            PushMode::Block(timeout) => Some(Instant::now() + timeout),
            _ => None,
        };
        let mut state = self.lock();
        loop {
            if state.closed {
                return Err(ClientError::Disconnected);
            }
            if matches!(mode, PushMode::Internal)
                || state.queued.is_empty()
                || state.queued.len() + message.len() <= self.capacity
            {
                break;
            }
            let Some(deadline) = deadline else {
                return Err(ClientError::ResourceExhausted);
            };
            let now = Instant::now();
            if now >= deadline {
                return Err(ClientError::ResourceExhausted);
            }
            self.wake.notify_one();
            state = self
                .space
                .wait_timeout(state, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
        state.queued.extend_from_slice(message);
        state.high_water = state.high_water.max(state.queued.len());
        let wake = matches!(mode, PushMode::Internal) || state.queued.len() >= self.capacity / 2;
        drop(state);
        if wake {
            self.wake.notify_one();
        }
        Ok(())
    }

    /// Take everything queued, if the circuit is ready to send it
    pub fn take(&self) -> Taken {
        let mut state = self.lock();
        if state.closed {
            return Taken::Closed;
        }
        if !state.draining || state.queued.is_empty() {
            return Taken::Empty;
        }
        let data = mem::take(&mut state.queued);
        drop(state);
        self.space.notify_all();
        Taken::Data(data)
    }

    /// Wait until there may be something to take
    pub async fn wait(&self) {
        self.wake.notified().await
    }

    /// The circuit is established. Everything queued so far may be sent.
    pub fn start_draining(&self) {
        self.lock().draining = true;
        self.wake.notify_one();
    }

    /// Ask the writer to send whatever is queued
    pub fn flush(&self) {
        self.wake.notify_one();
    }

    /// Refuse further messages and release anyone blocked on space
    pub fn close(&self) {
        self.lock().closed = true;
        self.space.notify_all();
        self.wake.notify_one();
    }

    /// Largest number of bytes ever queued at once
    pub fn high_water(&self) -> usize {
        self.lock().high_water
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{sync::Arc, thread};

    #[test]
    fn holds_until_draining() {
        let buffer = SendBuffer::new(64);
        buffer.push(&[1, 2, 3], PushMode::NoWait).unwrap();
        assert!(matches!(buffer.take(), Taken::Empty));
        buffer.start_draining();
        let Taken::Data(data) = buffer.take() else {
            panic!("Expected queued data");
        };
        assert_eq!(data, vec![1, 2, 3]);
        assert!(matches!(buffer.take(), Taken::Empty));
    }

    #[test]
    fn full_buffer() {
        let buffer = SendBuffer::new(16);
        // Oversize messages still go into an empty buffer
        buffer.push(&[0; 24], PushMode::NoWait).unwrap();
        assert!(matches!(
            buffer.push(&[0; 8], PushMode::NoWait),
            Err(ClientError::ResourceExhausted)
        ));
        assert!(matches!(
            buffer.push(&[0; 8], PushMode::Block(Duration::from_millis(20))),
            Err(ClientError::ResourceExhausted)
        ));
        buffer.push(&[0; 8], PushMode::Internal).unwrap();
        assert_eq!(buffer.high_water(), 32);
        buffer.start_draining();
        let Taken::Data(data) = buffer.take() else {
            panic!("Expected queued data");
        };
        assert_eq!(data.len(), 32);
    }

    #[test]
    fn blocked_push_resumes_after_take() {
        let buffer = Arc::new(SendBuffer::new(16));
        buffer.start_draining();
        buffer.push(&[1; 16], PushMode::NoWait).unwrap();
        let pusher = {
            let buffer = buffer.clone();
            thread::spawn(move || buffer.push(&[2; 8], PushMode::Block(Duration::from_secs(5))))
        };
        thread::sleep(Duration::from_millis(50));
        let Taken::Data(first) = buffer.take() else {
            panic!("Expected queued data");
        };
        assert_eq!(first, vec![1; 16]);
        pusher.join().unwrap().unwrap();
        let Taken::Data(second) = buffer.take() else {
            panic!("Expected queued data");
        };
        assert_eq!(second, vec![2; 8]);
    }

    #[test]
    fn close_releases_waiters() {
        let buffer = Arc::new(SendBuffer::new(8));
        buffer.push(&[0; 8], PushMode::NoWait).unwrap();
        let pusher = {
            let buffer = buffer.clone();
            thread::spawn(move || buffer.push(&[0; 8], PushMode::Block(Duration::from_secs(5))))
        };
        thread::sleep(Duration::from_millis(50));
        buffer.close();
        assert!(matches!(
            pusher.join().unwrap(),
            Err(ClientError::Disconnected)
        ));
        assert!(matches!(buffer.take(), Taken::Closed));
    }
}
