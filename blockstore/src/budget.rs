//! Bound the number of bytes held in flight.
//!
//! A [Budget] admits a request of `size` bytes immediately only if no earlier request is
//! still waiting and the allocation stays strictly below the maximum. Otherwise the request
//! joins a FIFO queue. Releasing bytes admits queued requests in arrival order for as long
//! as the one at the front fits, so a large request is never starved by a stream of small
//! ones that arrived after it.

use crate::Error;
use futures::channel::oneshot;
use std::{
    collections::VecDeque,
    sync::{Arc, Mutex},
};
use tracing::trace;

struct Ticket {
    size: u64,
    sender: oneshot::Sender<()>,
}

struct State {
    allocated: u64,
    queue: VecDeque<Ticket>,
}

impl State {
    fn admit(&mut self, max: u64) {
        while let Some(ticket) = self.queue.front() {
            if ticket.sender.is_canceled() {
                self.queue.pop_front();
                continue;
            }
            if self.allocated + ticket.size >= max {
                break;
            }
            let Some(ticket) = self.queue.pop_front() else {
                break;
            };
            if ticket.sender.send(()).is_ok() {
                self.allocated += ticket.size;
            }
        }
    }
}

/// FIFO admission control over a fixed number of bytes.
#[derive(Clone)]
pub struct Budget {
    max: u64,
    state: Arc<Mutex<State>>,
}

impl Budget {
    pub fn new(max: u64) -> Self {
        Self {
            max,
            state: Arc::new(Mutex::new(State {
                allocated: 0,
                queue: VecDeque::new(),
            })),
        }
    }

    /// Wait until `size` bytes are admitted.
    ///
    /// The caller must [Budget::release] the bytes once it is done with them. A request that
    /// could never be admitted (`size >= max`) fails immediately. Dropping the returned
    /// future before it resolves withdraws the request.
    pub async fn request(&self, size: u64) -> Result<(), Error> {
        if size >= self.max {
            return Err(Error::BudgetExceeded {
                requested: size,
                max: self.max,
            });
        }
        let receiver = {
            let mut state = self.state.lock().unwrap();
            if state.queue.is_empty() && state.allocated + size < self.max {
                state.allocated += size;
                return Ok(());
            }
            trace!(size, allocated = state.allocated, queued = state.queue.len(), "queued");
            let (sender, receiver) = oneshot::channel();
            state.queue.push_back(Ticket { size, sender });
            receiver
        };
        let mut admission = Admission {
            budget: self,
            size,
            receiver,
        };
        (&mut admission.receiver).await.map_err(|_| Error::Closed)
    }

    /// Return `size` bytes and admit whatever now fits.
    pub fn release(&self, size: u64) {
        let mut state = self.state.lock().unwrap();
        state.allocated = state.allocated.saturating_sub(size);
        state.admit(self.max);
    }

    /// Wait until `size` bytes are admitted, returning a guard that releases them on drop.
    pub async fn reserve(&self, size: u64) -> Result<Reservation, Error> {
        self.request(size).await?;
        Ok(Reservation {
            budget: self.clone(),
            size,
        })
    }

    /// Bytes currently admitted.
    pub fn allocated(&self) -> u64 {
        self.state.lock().unwrap().allocated
    }

    /// Number of requests waiting for admission.
    pub fn queued(&self) -> usize {
        self.state.lock().unwrap().queue.len()
    }

    /// Largest allocation (exclusive).
    pub fn max(&self) -> u64 {
        self.max
    }
}

/// A queued request that has not yet observed its admission.
struct Admission<'a> {
    budget: &'a Budget,
    size: u64,
    receiver: oneshot::Receiver<()>,
}

impl Drop for Admission<'_> {
    fn drop(&mut self) {
        // Admitted after the caller stopped waiting
        if let Ok(Some(())) = self.receiver.try_recv() {
            self.budget.release(self.size);
        }
    }
}

/// Bytes admitted by [Budget::reserve], released when dropped.
pub struct Reservation {
    budget: Budget,
    size: u64,
}

impl Reservation {
    /// Number of bytes held.
    pub fn size(&self) -> u64 {
        self.size
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        self.budget.release(self.size);
    }
}
