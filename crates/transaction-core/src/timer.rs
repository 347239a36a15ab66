//! Transaction timers.
//!
//! Every armed timer is a spawned task that sleeps and then calls back into
//! its transaction. The callback holds only a weak handle, so a pending
//! timer never keeps a finished transaction alive.
//!
//! Each arming gets a fresh id. A firing timer must present that id under
//! the transaction lock and [`Timers::take`] it before acting, so a timer
//! that was stopped or re-armed while its task was already waking up is
//! recognised as stale and ignored.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::time::Duration;

use sipflow_infra_common::task::spawn_guarded;
use tokio::task::JoinHandle;

/// RFC 3261 transaction timers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerType {
    /// INVITE client retransmission
    A,
    /// INVITE client timeout
    B,
    /// INVITE client wait for response retransmissions
    D,
    /// Non-INVITE client retransmission
    E,
    /// Non-INVITE client timeout
    F,
    /// INVITE server response retransmission
    G,
    /// INVITE server wait for ACK
    H,
    /// INVITE server wait for ACK retransmissions
    I,
    /// Non-INVITE server wait for request retransmissions
    J,
    /// Non-INVITE client wait for response retransmissions
    K,
    /// INVITE server wait after a 2xx (RFC 6026)
    L,
    /// INVITE client wait after a 2xx (RFC 6026)
    M,
    /// INVITE server automatic `100 Trying`
    Trying,
}

impl fmt::Display for TimerType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TimerType::A => write!(f, "A"),
            TimerType::B => write!(f, "B"),
            TimerType::D => write!(f, "D"),
            TimerType::E => write!(f, "E"),
            TimerType::F => write!(f, "F"),
            TimerType::G => write!(f, "G"),
            TimerType::H => write!(f, "H"),
            TimerType::I => write!(f, "I"),
            TimerType::J => write!(f, "J"),
            TimerType::K => write!(f, "K"),
            TimerType::L => write!(f, "L"),
            TimerType::M => write!(f, "M"),
            TimerType::Trying => write!(f, "1xx"),
        }
    }
}

struct ArmedTimer {
    id: u64,
    handle: JoinHandle<()>,
}

/// The timers armed for one transaction
#[derive(Default)]
pub(crate) struct Timers {
    next_id: u64,
    armed: HashMap<TimerType, ArmedTimer>,
}

impl Timers {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Arm `timer` to call `fire` with the arming id after `after`.
    ///
    /// An already armed timer of the same type is replaced.
    pub(crate) fn arm<F, Fut>(&mut self, timer: TimerType, after: Duration, fire: F)
    where
        F: FnOnce(u64) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.next_id += 1;
        let id = self.next_id;
        let handle = spawn_guarded("transaction-timer", async move {
            tokio::time::sleep(after).await;
            fire(id).await;
        });
        if let Some(previous) = self.armed.insert(timer, ArmedTimer { id, handle }) {
            previous.handle.abort();
        }
    }

    /// Claim a firing timer.
    ///
    /// Returns false when `id` is no longer the armed instance of `timer`.
    /// The task is not aborted; it is the caller.
    pub(crate) fn take(&mut self, timer: TimerType, id: u64) -> bool {
        match self.armed.get(&timer) {
            Some(armed) if armed.id == id => {
                self.armed.remove(&timer);
                true
            }
            _ => false,
        }
    }

    pub(crate) fn stop(&mut self, timer: TimerType) {
        if let Some(armed) = self.armed.remove(&timer) {
            armed.handle.abort();
        }
    }

    pub(crate) fn is_armed(&self, timer: TimerType) -> bool {
        self.armed.contains_key(&timer)
    }

    pub(crate) fn stop_all(&mut self) {
        for (_, armed) in self.armed.drain() {
            armed.handle.abort();
        }
    }
}

impl Drop for Timers {
    fn drop(&mut self) {
        self.stop_all();
    }
}
