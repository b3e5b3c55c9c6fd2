//! Virtual-time event scheduler.
//!
//! Devices complete asynchronously: a started command schedules a callback
//! some number of cycles in the future, and each callback may move a byte
//! and schedule the next one. The queue is a delta list: each entry stores
//! the cycles between the previous entry firing and itself firing, so
//! advancing time only ever touches the head.
//!
//! Callbacks dispatch through `Device::event`, so an event is fully
//! identified by `(device, arg)`; `cancel` removes the first entry matching
//! both. Zero-delay callbacks are dispatched immediately by the caller
//! (`IoContext::schedule`) and never enter the queue.

use std::collections::VecDeque;

struct Event {
    dev: u16,
    arg: i32,
    /// Cycles after the previous entry fires. Only the head may go
    /// non-positive, while an advance is being drained.
    delta: i64,
}

/// Ordered delta list of pending device callbacks.
pub struct EventQueue {
    queue: VecDeque<Event>,
}

impl EventQueue {
    #[must_use]
    pub fn new() -> Self {
        Self {
            queue: VecDeque::new(),
        }
    }

    /// Insert a callback `cycles` in the future. The entry lands at the
    /// position where the running delta sum first reaches `cycles`; the
    /// displaced successor's delta shrinks by the new entry's delta so
    /// every later firing time is unchanged.
    pub fn schedule(&mut self, dev: u16, cycles: u32, arg: i32) {
        let mut remaining = i64::from(cycles);
        let mut idx = self.queue.len();
        for (i, ev) in self.queue.iter().enumerate() {
            if remaining <= ev.delta {
                idx = i;
                break;
            }
            remaining -= ev.delta;
        }
        if let Some(next) = self.queue.get_mut(idx) {
            next.delta -= remaining;
        }
        self.queue.insert(
            idx,
            Event {
                dev,
                arg,
                delta: remaining,
            },
        );
    }

    /// Remove the first entry matching `(dev, arg)`. The removed delta is
    /// folded into the successor so later firing times do not shift.
    pub fn cancel(&mut self, dev: u16, arg: i32) {
        let Some(idx) = self
            .queue
            .iter()
            .position(|ev| ev.dev == dev && ev.arg == arg)
        else {
            return;
        };
        let removed = self.queue.remove(idx).map_or(0, |ev| ev.delta);
        if let Some(next) = self.queue.get_mut(idx) {
            next.delta += removed;
        }
    }

    /// Begin advancing virtual time by `cycles`: charge the whole advance
    /// to the head. Callers then drain with `pop_due` until it returns
    /// `None`, dispatching each callback as it comes off.
    pub fn begin_advance(&mut self, cycles: u32) {
        if let Some(head) = self.queue.front_mut() {
            head.delta -= i64::from(cycles);
        }
    }

    /// Detach the head if it is due. Any overshoot carries into the new
    /// head, so a callback scheduled mid-drain with time remaining stops
    /// the drain.
    pub fn pop_due(&mut self) -> Option<(u16, i32)> {
        if self.queue.front()?.delta > 0 {
            return None;
        }
        let ev = self.queue.pop_front()?;
        if let Some(next) = self.queue.front_mut() {
            next.delta += ev.delta;
        }
        Some((ev.dev, ev.arg))
    }

    /// Is anything queued?
    #[must_use]
    pub fn any_event(&self) -> bool {
        !self.queue.is_empty()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Drop every pending event. Used when the system is reset for IPL.
    pub fn clear(&mut self) {
        self.queue.clear();
    }
}

impl Default for EventQueue {
    fn default() -> Self {
        Self::new()
    }
}
