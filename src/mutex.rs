//! FIFO mutual exclusion for async callers.
//!
//! Guards read-modify-write sequences against the persisted book library so
//! two updates firing close together cannot interleave. The lock carries no
//! data: holding a [`Release`] token is what grants the critical section.

use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex as StdMutex, MutexGuard};
use std::task::{Context, Poll};
use tokio::sync::oneshot;
use tracing::trace;

#[derive(Default)]
struct LockState {
    locked: bool,
    waiters: VecDeque<oneshot::Sender<()>>,
}

#[derive(Clone, Default)]
pub struct FifoMutex {
    state: Arc<StdMutex<LockState>>,
}

impl FifoMutex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take the lock. Ready on first poll when the lock is free, otherwise
    /// queued behind every earlier caller.
    pub fn lock(&self) -> Acquire {
        let mut state = lock_state(&self.state);
        if !state.locked {
            state.locked = true;
            return Acquire {
                state: Arc::clone(&self.state),
                stage: AcquireStage::Granted,
            };
        }
        let (tx, rx) = oneshot::channel();
        state.waiters.push_back(tx);
        trace!(queued = state.waiters.len(), "Mutex busy; queued waiter");
        Acquire {
            state: Arc::clone(&self.state),
            stage: AcquireStage::Queued(rx),
        }
    }

    /// Synchronous form of [`FifoMutex::lock`]; `None` when held.
    pub fn try_lock(&self) -> Option<Release> {
        let mut state = lock_state(&self.state);
        if state.locked {
            return None;
        }
        state.locked = true;
        Some(Release::new(Arc::clone(&self.state)))
    }

    pub fn is_locked(&self) -> bool {
        lock_state(&self.state).locked
    }

    pub fn queued(&self) -> usize {
        lock_state(&self.state).waiters.len()
    }
}

enum AcquireStage {
    Granted,
    Queued(oneshot::Receiver<()>),
    Done,
}

/// Future returned by [`FifoMutex::lock`].
pub struct Acquire {
    state: Arc<StdMutex<LockState>>,
    stage: AcquireStage,
}

impl Future for Acquire {
    type Output = Release;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Release> {
        let this = &mut *self;
        let ready = match &mut this.stage {
            AcquireStage::Granted => true,
            // A sender is only dropped unsent when the queue itself goes
            // away, which cannot happen while we hold the state Arc.
            AcquireStage::Queued(rx) => Pin::new(rx).poll(cx).is_ready(),
            AcquireStage::Done => panic!("Acquire polled after completion"),
        };
        if !ready {
            return Poll::Pending;
        }
        this.stage = AcquireStage::Done;
        Poll::Ready(Release::new(Arc::clone(&this.state)))
    }
}

impl Drop for Acquire {
    fn drop(&mut self) {
        match std::mem::replace(&mut self.stage, AcquireStage::Done) {
            AcquireStage::Granted => hand_off(&self.state),
            AcquireStage::Queued(mut rx) => {
                rx.close();
                if rx.try_recv().is_ok() {
                    // Handed the lock after we stopped waiting; pass it on.
                    hand_off(&self.state);
                }
            }
            AcquireStage::Done => {}
        }
    }
}

/// Ownership of the critical section. Releasing twice is a no-op; dropping
/// the token releases it.
pub struct Release {
    state: Arc<StdMutex<LockState>>,
    released: bool,
}

impl Release {
    fn new(state: Arc<StdMutex<LockState>>) -> Self {
        Self {
            state,
            released: false,
        }
    }

    pub fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        hand_off(&self.state);
    }

    pub fn is_released(&self) -> bool {
        self.released
    }
}

impl Drop for Release {
    fn drop(&mut self) {
        self.release();
    }
}

fn hand_off(state: &StdMutex<LockState>) {
    let mut state = lock_state(state);
    while let Some(next) = state.waiters.pop_front() {
        if next.send(()).is_ok() {
            trace!(remaining = state.waiters.len(), "Mutex handed to next waiter");
            return;
        }
    }
    state.locked = false;
}

fn lock_state(state: &StdMutex<LockState>) -> MutexGuard<'_, LockState> {
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
