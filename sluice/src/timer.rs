use std::cell::Cell;
use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::rc::Rc;
use std::time::{Duration, Instant};

use hashbrown::HashMap;

/// Cancellation token shared between a scheduled timer and its owner. A
/// canceled handler turns a late firing into a no-op.
#[derive(Clone)]
pub struct TimerHandle {
    canceled: Rc<Cell<bool>>,
}

impl TimerHandle {
    pub fn cancel(&self) {
        self.canceled.set(true);
    }

    pub fn is_canceled(&self) -> bool {
        self.canceled.get()
    }
}

struct Entry {
    handler: Box<dyn FnOnce()>,
    canceled: Rc<Cell<bool>>,
}

/// Per-worker timer queue. Timers fire in non-decreasing deadline order;
/// insertion order breaks ties.
pub struct Timers {
    heap: BinaryHeap<Reverse<(Instant, u64)>>,
    entries: HashMap<u64, Entry>,
    next_id: u64,
}

impl Timers {
    pub fn new() -> Timers {
        Timers {
            heap: BinaryHeap::new(),
            entries: HashMap::new(),
            next_id: 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn schedule(&mut self, timeout: Duration, handler: impl FnOnce() + 'static) -> TimerHandle {
        self.schedule_at(Instant::now() + timeout, handler)
    }

    pub fn schedule_at(&mut self, deadline: Instant, handler: impl FnOnce() + 'static) -> TimerHandle {
        let id = self.next_id;
        self.next_id += 1;
        let canceled = Rc::new(Cell::new(false));
        self.heap.push(Reverse((deadline, id)));
        self.entries.insert(
            id,
            Entry {
                handler: Box::new(handler),
                canceled: canceled.clone(),
            },
        );
        TimerHandle { canceled }
    }

    /// Next pending deadline, for the reactor's poll timeout.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.heap.peek().map(|r| (r.0).0)
    }

    /// Fires every timer due at `now`. Canceled handlers are dropped silently.
    pub fn poll(&mut self, now: Instant) {
        while let Some(Reverse((deadline, id))) = self.heap.peek().copied() {
            if deadline > now {
                break;
            }
            self.heap.pop();
            if let Some(entry) = self.entries.remove(&id) {
                if !entry.canceled.get() {
                    (entry.handler)();
                }
            }
        }
    }
}

/// A watcher registered on the shared ticker. Watchers compare the tick
/// against their own last-activity marks.
pub trait TickWatcher {
    fn on_tick(&mut self, now: Instant);
}

/// Periodic driver for aggregate chores: idle-timeout scans, mux session
/// sweeps. One ticker per worker; the worker calls `tick` from its loop.
pub struct Ticker {
    interval: Duration,
    last: Option<Instant>,
}

impl Ticker {
    pub fn new(interval: Duration) -> Ticker {
        Ticker {
            interval,
            last: None,
        }
    }

    /// Returns true when a tick is due, advancing the ticker.
    pub fn due(&mut self, now: Instant) -> bool {
        match self.last {
            Some(last) if now.duration_since(last) < self.interval => false,
            _ => {
                self.last = Some(now);
                true
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;

    #[test]
    fn test_fire_in_deadline_order() {
        let fired = Rc::new(RefCell::new(Vec::new()));
        let mut timers = Timers::new();
        let now = Instant::now();

        for (name, offset) in [("b", 20u64), ("a", 10), ("c", 30)].iter() {
            let fired = fired.clone();
            let name = *name;
            timers.schedule_at(now + Duration::from_millis(*offset), move || {
                fired.borrow_mut().push(name);
            });
        }

        timers.poll(now + Duration::from_millis(15));
        assert_eq!(*fired.borrow(), vec!["a"]);

        timers.poll(now + Duration::from_millis(100));
        assert_eq!(*fired.borrow(), vec!["a", "b", "c"]);
        assert!(timers.is_empty());
    }

    #[test]
    fn test_cancel_makes_late_fire_noop() {
        let fired = Rc::new(Cell::new(false));
        let mut timers = Timers::new();
        let now = Instant::now();

        let handle = {
            let fired = fired.clone();
            timers.schedule_at(now, move || fired.set(true))
        };
        handle.cancel();

        timers.poll(now + Duration::from_secs(1));
        assert!(!fired.get());
    }

    #[test]
    fn test_ticker_interval() {
        let mut ticker = Ticker::new(Duration::from_millis(100));
        let now = Instant::now();

        assert!(ticker.due(now));
        assert!(!ticker.due(now + Duration::from_millis(50)));
        assert!(ticker.due(now + Duration::from_millis(150)));
    }
}
