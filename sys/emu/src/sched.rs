// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Cycle-driven event scheduler.
//!
//! A due-cycle-ordered queue of callbacks, drained between instructions.
//! A callback re-arms itself by returning its next deadline; this keeps
//! dispatch free of reentrant queue mutation. Used to pace modeled
//! timers.

/// Returns the next due cycle to stay scheduled, or `None` to stop.
pub type SchedCallback = Box<dyn FnMut(u64) -> Option<u64>>;

struct Event {
    due: u64,
    /// Insertion order, the tie-break so same-cycle events fire FIFO.
    seq: u64,
    cb: SchedCallback,
}

#[derive(Default)]
pub struct Scheduler {
    /// Sorted ascending by (due, seq); index 0 fires first.
    events: Vec<Event>,
    next_seq: u64,
}

impl Scheduler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn schedule(&mut self, due: u64, cb: SchedCallback) {
        let seq = self.next_seq;
        self.next_seq += 1;
        let at = self
            .events
            .partition_point(|e| (e.due, e.seq) <= (due, seq));
        self.events.insert(at, Event { due, seq, cb });
    }

    /// Cycle of the earliest scheduled event.
    pub fn next_due(&self) -> Option<u64> {
        self.events.first().map(|e| e.due)
    }

    /// Fires every event with `due <= now`, re-inserting the ones that
    /// re-arm themselves.
    pub fn run_due(&mut self, now: u64) {
        while self.events.first().is_some_and(|e| e.due <= now) {
            let mut ev = self.events.remove(0);
            if let Some(next) = (ev.cb)(now) {
                // Clamp so a stale deadline cannot spin forever.
                ev.due = next.max(now + 1);
                let at = self
                    .events
                    .partition_point(|e| (e.due, e.seq) <= (ev.due, ev.seq));
                self.events.insert(at, ev);
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn clear(&mut self) {
        self.events.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    #[test]
    fn fires_in_time_order() {
        let log = Rc::new(RefCell::new(Vec::new()));
        let mut s = Scheduler::new();
        for (due, tag) in [(30u64, 'c'), (10, 'a'), (20, 'b')] {
            let log = log.clone();
            s.schedule(
                due,
                Box::new(move |_| {
                    log.borrow_mut().push(tag);
                    None
                }),
            );
        }
        s.run_due(15);
        assert_eq!(*log.borrow(), vec!['a']);
        s.run_due(30);
        assert_eq!(*log.borrow(), vec!['a', 'b', 'c']);
        assert!(s.is_empty());
    }

    #[test]
    fn same_cycle_fires_in_insertion_order() {
        let log = Rc::new(RefCell::new(Vec::new()));
        let mut s = Scheduler::new();
        for tag in ['x', 'y', 'z'] {
            let log = log.clone();
            s.schedule(
                5,
                Box::new(move |_| {
                    log.borrow_mut().push(tag);
                    None
                }),
            );
        }
        s.run_due(5);
        assert_eq!(*log.borrow(), vec!['x', 'y', 'z']);
    }

    #[test]
    fn rearming_callback_keeps_running() {
        let count = Rc::new(RefCell::new(0u32));
        let mut s = Scheduler::new();
        let c = count.clone();
        s.schedule(
            10,
            Box::new(move |now| {
                *c.borrow_mut() += 1;
                if *c.borrow() < 3 {
                    Some(now + 10)
                } else {
                    None
                }
            }),
        );
        s.run_due(9);
        assert_eq!(*count.borrow(), 0);
        assert_eq!(s.next_due(), Some(10));
        // Each drain fires at most the events due by `now`; the re-arm
        // lands 10 cycles later.
        s.run_due(10);
        assert_eq!(*count.borrow(), 1);
        assert_eq!(s.next_due(), Some(20));
        s.run_due(20);
        s.run_due(30);
        assert_eq!(*count.borrow(), 3);
        assert!(s.is_empty());
    }
}
