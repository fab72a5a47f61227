// SPDX-License-Identifier: CEPL-1.0
//! FIFO hand-off between the presenting thread and the swapchain workers.
//!
//! Items move queued -> in progress -> retired. Workers may finish the heavy
//! part of an item in any order, but [`WorkQueue::complete_in_order`] only
//! lets the oldest in-progress item retire, so completions happen in push
//! order.

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex, MutexGuard};

struct State<T> {
    active: bool,
    next_seq: u64,
    queued: VecDeque<(u64, T)>,
    in_progress: VecDeque<u64>,
}

/// An item a worker has taken off the queue.
pub struct Ticket<T> {
    seq: u64,
    pub item: T,
}

pub struct WorkQueue<T> {
    state: Mutex<State<T>>,
    changed: Condvar,
}

impl<T> Default for WorkQueue<T> {
    fn default() -> Self {
        Self {
            state: Mutex::new(State {
                active: true,
                next_seq: 0,
                queued: VecDeque::new(),
                in_progress: VecDeque::new(),
            }),
            changed: Condvar::new(),
        }
    }
}

impl<T> WorkQueue<T> {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, State<T>> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn wait_while<'a>(
        &self,
        guard: MutexGuard<'a, State<T>>,
        cond: impl FnMut(&mut State<T>) -> bool,
    ) -> MutexGuard<'a, State<T>> {
        self.changed.wait_while(guard, cond).unwrap_or_else(|e| e.into_inner())
    }

    /// Run `f` and, if it succeeds, enqueue `item`, both under the queue lock
    /// so that whatever `f` submits is ordered like the queue itself.
    pub fn push_with<E>(&self, item: T, f: impl FnOnce(&T) -> Result<(), E>) -> Result<(), E> {
        let mut state = self.lock();
        f(&item)?;
        let seq = state.next_seq;
        state.next_seq += 1;
        state.queued.push_back((seq, item));
        drop(state);
        self.changed.notify_all();
        Ok(())
    }

    /// Block for the next item. `None` once the queue has been stopped.
    pub fn pop(&self) -> Option<Ticket<T>> {
        let state = self.lock();
        let mut state = self.wait_while(state, |s| s.active && s.queued.is_empty());
        if !state.active {
            return None;
        }
        let (seq, item) = state.queued.pop_front()?;
        state.in_progress.push_back(seq);
        Some(Ticket { seq, item })
    }

    /// Wait until `ticket` is the oldest item in progress, run `f` under the
    /// queue lock and retire the item.
    pub fn complete_in_order<R>(&self, ticket: Ticket<T>, f: impl FnOnce(&T) -> R) -> R {
        let state = self.lock();
        let mut state = self.wait_while(state, |s| s.in_progress.front() != Some(&ticket.seq));
        let out = f(&ticket.item);
        state.in_progress.pop_front();
        drop(state);
        self.changed.notify_all();
        out
    }

    /// Block while more than `limit` items are queued or in progress.
    pub fn wait_ready(&self, limit: usize) {
        let state = self.lock();
        let _state = self.wait_while(state, |s| {
            s.active && s.queued.len() + s.in_progress.len() > limit
        });
    }

    /// Wake everybody and make [`WorkQueue::pop`] return `None` from now on.
    pub fn stop(&self) {
        self.lock().active = false;
        self.changed.notify_all();
    }

    #[cfg(test)]
    fn pending(&self) -> usize {
        let state = self.lock();
        state.queued.len() + state.in_progress.len()
    }
}
