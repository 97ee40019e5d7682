//! Timed event queue shared by interrupt callbacks (producers) and the
//! controller's dispatch loop (the single consumer).
//!
//! Entries are ordered by `(due, sequence)`.  `Due::Asap` sorts before any
//! instant, and the sequence number is assigned under the lock, so events
//! planned for the same moment come out in the order they were planned.
//!
//! ```text
//!  ISR ──plan(Button, 100ms, replace)──▶ ┌────────────┐
//!  ISR ──plan(Gate, 100ms, replace)────▶ │ EventQueue │ ──wait()──▶ Controller
//!  Controller ──plan / delete_events──▶  └────────────┘
//! ```

use std::collections::BTreeMap;
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use crate::event::{Event, EventKind};

// ---------------------------------------------------------------------------
// Scheduling times
// ---------------------------------------------------------------------------

/// Absolute due time of a queued entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Due {
    /// Due immediately; sorts before every concrete instant.
    Asap,
    At(Instant),
}

impl Due {
    /// Time left until the entry is due, or `None` if it already is.
    fn remaining(self, now: Instant) -> Option<Duration> {
        match self {
            Due::Asap => None,
            Due::At(t) if t <= now => None,
            Due::At(t) => Some(t - now),
        }
    }
}

/// When to dispatch a newly planned event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum When {
    Asap,
    In(Duration),
    At(Instant),
}

impl From<Duration> for When {
    fn from(d: Duration) -> Self {
        When::In(d)
    }
}

impl From<Instant> for When {
    fn from(t: Instant) -> Self {
        When::At(t)
    }
}

// ---------------------------------------------------------------------------
// Observability hook
// ---------------------------------------------------------------------------

/// Queue transitions reported to a [`QueueObserver`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueAction {
    /// A plan or delete is about to mutate the queue.
    Changing,
    /// The consumer entered `wait`.
    Wait,
    Plan,
    Delete,
    Dispatch,
}

/// Read-only view of a queued entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntryView {
    pub kind: EventKind,
    pub payload: u32,
    pub due: Due,
    pub sequence: u64,
}

impl EntryView {
    fn new(due: Due, sequence: u64, event: &Event) -> Self {
        Self {
            kind: event.kind(),
            payload: event.payload(),
            due,
            sequence,
        }
    }
}

/// Called synchronously while the queue lock is held, so notifications are
/// strictly ordered with the mutation they describe.  Keep it short.
pub trait QueueObserver: Send {
    fn notify(&mut self, action: QueueAction, entry: Option<&EntryView>);
}

// ---------------------------------------------------------------------------
// Queue
// ---------------------------------------------------------------------------

struct Inner {
    entries: BTreeMap<(Due, u64), Event>,
    last_sequence: u64,
    observer: Option<Box<dyn QueueObserver>>,
}

impl Inner {
    fn notify(&mut self, action: QueueAction, entry: Option<&EntryView>) {
        if let Some(observer) = self.observer.as_mut() {
            observer.notify(action, entry);
        }
    }

    fn remove_kind(&mut self, kind: EventKind) -> usize {
        let Inner {
            entries, observer, ..
        } = self;
        let before = entries.len();
        entries.retain(|&(due, seq), event| {
            if event.kind() != kind {
                return true;
            }
            if let Some(observer) = observer.as_mut() {
                observer.notify(QueueAction::Delete, Some(&EntryView::new(due, seq, event)));
            }
            false
        });
        before - entries.len()
    }
}

pub struct EventQueue {
    inner: Mutex<Inner>,
    changed: Condvar,
    epoch: Instant,
}

impl Default for EventQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl EventQueue {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                entries: BTreeMap::new(),
                last_sequence: 0,
                observer: None,
            }),
            changed: Condvar::new(),
            epoch: Instant::now(),
        }
    }

    /// When the queue was created; due times in traces are relative to it.
    pub fn epoch(&self) -> Instant {
        self.epoch
    }

    /// Install (or replace) the observability hook.
    pub fn set_observer(&self, observer: Box<dyn QueueObserver>) {
        self.lock().observer = Some(observer);
    }

    /// Schedule `event`.  With `replace_previous`, every pending entry of the
    /// same kind is dropped in the same critical section as the insert.
    pub fn plan(&self, event: Event, when: impl Into<When>, replace_previous: bool) {
        let due = match when.into() {
            When::Asap => Due::Asap,
            When::In(d) => Due::At(Instant::now() + d),
            When::At(t) => Due::At(t),
        };
        {
            let mut inner = self.lock();
            inner.notify(QueueAction::Changing, None);
            if replace_previous {
                inner.remove_kind(event.kind());
            }
            inner.last_sequence += 1;
            let sequence = inner.last_sequence;
            inner.entries.insert((due, sequence), event);
            let view = EntryView::new(due, sequence, &event);
            inner.notify(QueueAction::Plan, Some(&view));
        }
        self.changed.notify_all();
    }

    /// Schedule `event` to be dispatched as soon as possible.
    pub fn plan_now(&self, event: Event) {
        self.plan(event, When::Asap, false);
    }

    /// Remove every pending entry of `kind`.  Returns how many were dropped.
    pub fn delete_events(&self, kind: EventKind) -> usize {
        let removed = {
            let mut inner = self.lock();
            inner.notify(QueueAction::Changing, None);
            inner.remove_kind(kind)
        };
        // Wake the consumer even when nothing matched; it re-evaluates its
        // deadline from scratch.
        self.changed.notify_all();
        removed
    }

    /// Block until the earliest entry is due, then remove and return it.
    pub fn wait(&self) -> Event {
        loop {
            if let Some(event) = self.next_due(None) {
                return event;
            }
        }
    }

    /// Like [`wait`](Self::wait) but gives up after `limit`.
    #[cfg(test)]
    pub fn wait_timeout(&self, limit: Duration) -> Option<Event> {
        self.next_due(Some(Instant::now() + limit))
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().entries.is_empty()
    }

    /// Number of pending entries of `kind`.
    #[cfg(test)]
    pub fn pending(&self, kind: EventKind) -> usize {
        self.lock()
            .entries
            .values()
            .filter(|e| e.kind() == kind)
            .count()
    }

    /// Pending entries in dispatch order.
    pub fn snapshot(&self) -> Vec<EntryView> {
        self.lock()
            .entries
            .iter()
            .map(|(&(due, seq), event)| EntryView::new(due, seq, event))
            .collect()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn next_due(&self, deadline: Option<Instant>) -> Option<Event> {
        let mut inner = self.lock();
        inner.notify(QueueAction::Wait, None);
        loop {
            let now = Instant::now();
            let head = inner.entries.keys().next().map(|&(due, _)| due);

            let until_head = match head {
                Some(due) => match due.remaining(now) {
                    None => {
                        let ((due, sequence), event) = inner.entries.pop_first()?;
                        let view = EntryView::new(due, sequence, &event);
                        inner.notify(QueueAction::Dispatch, Some(&view));
                        return Some(event);
                    }
                    left => left,
                },
                None => None,
            };

            let until_deadline = match deadline {
                Some(d) if d <= now => return None,
                Some(d) => Some(d - now),
                None => None,
            };

            let sleep = match (until_head, until_deadline) {
                (Some(a), Some(b)) => Some(a.min(b)),
                (a, b) => a.or(b),
            };

            inner = match sleep {
                Some(d) => {
                    self.changed
                        .wait_timeout(inner, d)
                        .unwrap_or_else(PoisonError::into_inner)
                        .0
                }
                None => self
                    .changed
                    .wait(inner)
                    .unwrap_or_else(PoisonError::into_inner),
            };
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    fn step(n: u32) -> Event {
        Event::DisplayTimeLeftBlink { remaining: n }
    }

    /// Drain everything currently queued, waiting at most `limit` per entry.
    fn drain(q: &EventQueue, limit: Duration) -> Vec<Event> {
        let mut out = Vec::new();
        while let Some(e) = q.wait_timeout(limit) {
            out.push(e);
        }
        out
    }

    #[derive(Clone, Default)]
    struct Recorder(Arc<Mutex<Vec<(QueueAction, Option<EventKind>)>>>);

    impl QueueObserver for Recorder {
        fn notify(&mut self, action: QueueAction, entry: Option<&EntryView>) {
            self.0.lock().unwrap().push((action, entry.map(|e| e.kind)));
        }
    }

    // -- Ordering ---------------------------------------------------------

    #[test]
    fn asap_events_dispatch_in_plan_order() {
        let q = EventQueue::new();
        q.plan_now(Event::Button);
        q.plan_now(Event::Gate);
        q.plan_now(Event::WriteStats);

        assert_eq!(q.wait(), Event::Button);
        assert_eq!(q.wait(), Event::Gate);
        assert_eq!(q.wait(), Event::WriteStats);
        assert!(q.is_empty());
    }

    #[test]
    fn earlier_due_time_dispatches_first() {
        let q = EventQueue::new();
        q.plan(Event::LightTooLong, Duration::from_millis(40), false);
        q.plan(Event::LightFinalOff, Duration::from_millis(10), false);

        assert_eq!(q.wait(), Event::LightFinalOff);
        assert_eq!(q.wait(), Event::LightTooLong);
    }

    #[test]
    fn asap_sorts_before_past_instants() {
        let q = EventQueue::new();
        q.plan(Event::Gate, Instant::now(), false);
        q.plan_now(Event::Button);

        assert_eq!(q.wait(), Event::Button);
        assert_eq!(q.wait(), Event::Gate);
    }

    #[test]
    fn equal_due_times_are_fifo() {
        let q = EventQueue::new();
        let at = Instant::now() + Duration::from_millis(5);
        for n in 1..=5 {
            q.plan(step(n), at, false);
        }

        let got = drain(&q, Duration::from_millis(50));
        assert_eq!(got, (1..=5).map(step).collect::<Vec<_>>());
    }

    #[test]
    fn dispatch_order_matches_due_then_sequence() {
        let q = EventQueue::new();
        let base = Instant::now() + Duration::from_millis(5);
        // Deterministic scatter with plenty of collisions.
        let mut x: u64 = 7;
        for n in 0..40 {
            x = x.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
            let offset = Duration::from_millis((x >> 60) % 8);
            q.plan(step(n), base + offset, false);
        }

        let expected: Vec<u32> = q.snapshot().iter().map(|v| v.payload).collect();
        let got: Vec<u32> = drain(&q, Duration::from_millis(50))
            .iter()
            .map(Event::payload)
            .collect();
        assert_eq!(got, expected);

        // Snapshot order itself is (due, sequence).
        let views = {
            let q2 = EventQueue::new();
            q2.plan(step(1), base + Duration::from_millis(3), false);
            q2.plan(step(2), base, false);
            q2.plan(step(3), base, false);
            q2.snapshot()
        };
        let payloads: Vec<u32> = views.iter().map(|v| v.payload).collect();
        assert_eq!(payloads, vec![2, 3, 1]);
    }

    #[test]
    fn sequence_numbers_strictly_increase() {
        let q = EventQueue::new();
        q.plan_now(Event::Button);
        q.plan_now(Event::Gate);
        q.plan(Event::Halt, Duration::from_secs(5), false);
        let mut seqs: Vec<u64> = q.snapshot().iter().map(|v| v.sequence).collect();
        seqs.sort_unstable();
        assert_eq!(seqs, vec![1, 2, 3]);
    }

    // -- Replacement & deletion -------------------------------------------

    #[test]
    fn replace_previous_keeps_single_entry_of_kind() {
        let q = EventQueue::new();
        q.plan(Event::BlinkExternal { lit: true }, Duration::from_secs(10), false);
        q.plan(Event::BlinkExternal { lit: false }, Duration::from_secs(20), false);
        q.plan_now(Event::Gate);

        q.plan(Event::BlinkExternal { lit: true }, When::Asap, true);

        assert_eq!(q.pending(EventKind::BlinkExternal), 1);
        assert_eq!(q.pending(EventKind::Gate), 1);
        assert_eq!(q.wait(), Event::Gate);
        assert_eq!(q.wait(), Event::BlinkExternal { lit: true });
        assert!(q.is_empty());
    }

    #[test]
    fn repeated_debounce_replacement_yields_one_check() {
        let q = EventQueue::new();
        for _ in 0..10 {
            q.plan(Event::Button, Duration::from_millis(5), true);
        }
        assert_eq!(drain(&q, Duration::from_millis(50)), vec![Event::Button]);
    }

    #[test]
    fn delete_events_removes_all_and_only_matching_kind() {
        let q = EventQueue::new();
        q.plan(Event::LightTooLong, Duration::from_millis(1), false);
        q.plan(Event::DisplayTimeLeft, Duration::from_millis(2), false);
        q.plan(Event::LightTooLong, Duration::from_millis(3), false);

        assert_eq!(q.delete_events(EventKind::LightTooLong), 2);
        assert_eq!(q.delete_events(EventKind::LightTooLong), 0);
        assert_eq!(
            drain(&q, Duration::from_millis(50)),
            vec![Event::DisplayTimeLeft]
        );
    }

    #[test]
    fn delete_on_empty_queue_is_noop() {
        let q = EventQueue::new();
        assert_eq!(q.delete_events(EventKind::Halt), 0);
        assert!(q.is_empty());
    }

    // -- Blocking behaviour -----------------------------------------------

    #[test]
    fn wait_timeout_on_empty_queue_returns_none() {
        let q = EventQueue::new();
        let started = Instant::now();
        assert_eq!(q.wait_timeout(Duration::from_millis(30)), None);
        assert!(started.elapsed() >= Duration::from_millis(30));
    }

    #[test]
    fn wait_timeout_does_not_return_entries_before_due() {
        let q = EventQueue::new();
        q.plan(Event::Halt, Duration::from_secs(60), false);
        assert_eq!(q.wait_timeout(Duration::from_millis(20)), None);
        assert_eq!(q.len(), 1);
    }

    #[test]
    fn producer_wakes_blocked_consumer() {
        let q = Arc::new(EventQueue::new());
        let consumer = {
            let q = Arc::clone(&q);
            thread::spawn(move || q.wait())
        };

        thread::sleep(Duration::from_millis(20));
        q.plan_now(Event::Gate);

        assert_eq!(consumer.join().unwrap(), Event::Gate);
    }

    #[test]
    fn earlier_insert_preempts_pending_deadline() {
        let q = Arc::new(EventQueue::new());
        q.plan(Event::WriteStats, Duration::from_secs(30), false);

        let consumer = {
            let q = Arc::clone(&q);
            thread::spawn(move || {
                let started = Instant::now();
                let e = q.wait_timeout(Duration::from_secs(5));
                (e, started.elapsed())
            })
        };

        thread::sleep(Duration::from_millis(20));
        q.plan_now(Event::Button);

        let (event, waited) = consumer.join().unwrap();
        assert_eq!(event, Some(Event::Button));
        assert!(waited < Duration::from_secs(5), "waited {waited:?}");
        assert_eq!(q.pending(EventKind::WriteStats), 1);
    }

    #[test]
    fn deleting_head_makes_waiter_reblock() {
        let q = Arc::new(EventQueue::new());
        q.plan(Event::Halt, Duration::from_millis(60), false);

        let consumer = {
            let q = Arc::clone(&q);
            thread::spawn(move || q.wait_timeout(Duration::from_millis(200)))
        };

        thread::sleep(Duration::from_millis(10));
        q.delete_events(EventKind::Halt);

        // The deleted Halt must never surface.
        assert_eq!(consumer.join().unwrap(), None);
    }

    #[test]
    fn emptied_queue_blocks_until_next_plan() {
        let q = Arc::new(EventQueue::new());
        q.plan(Event::Halt, Duration::from_millis(60), false);

        let consumer = {
            let q = Arc::clone(&q);
            thread::spawn(move || {
                let event = q.wait();
                (event, Instant::now())
            })
        };

        thread::sleep(Duration::from_millis(10));
        assert_eq!(q.delete_events(EventKind::Halt), 1);
        assert!(q.is_empty());

        // Well past the deleted Halt's due time; the consumer must still be
        // parked with no deadline.
        thread::sleep(Duration::from_millis(150));
        assert!(!consumer.is_finished());

        let planned = Instant::now();
        q.plan_now(Event::Gate);
        let (event, woke) = consumer.join().unwrap();
        assert_eq!(event, Event::Gate);
        assert!(woke >= planned);
    }

    #[test]
    fn concurrent_producers_lose_nothing() {
        let q = Arc::new(EventQueue::new());
        let producers: Vec<_> = (0..4)
            .map(|t| {
                let q = Arc::clone(&q);
                thread::spawn(move || {
                    for n in 0..25 {
                        q.plan_now(step(t * 100 + n));
                    }
                })
            })
            .collect();
        for p in producers {
            p.join().unwrap();
        }

        let got = drain(&q, Duration::from_millis(20));
        assert_eq!(got.len(), 100);
        // Per producer, planning order is preserved.
        for t in 0..4 {
            let mine: Vec<u32> = got
                .iter()
                .map(Event::payload)
                .filter(|p| p / 100 == t)
                .collect();
            assert_eq!(mine, (0..25).map(|n| t * 100 + n).collect::<Vec<_>>());
        }
    }

    // -- Observer ---------------------------------------------------------

    #[test]
    fn observer_sees_mutations_in_order() {
        let q = EventQueue::new();
        let rec = Recorder::default();
        q.set_observer(Box::new(rec.clone()));

        q.plan_now(Event::Button);
        q.plan(Event::Button, When::Asap, true);
        let _ = q.wait();

        let log = rec.0.lock().unwrap().clone();
        assert_eq!(
            log,
            vec![
                (QueueAction::Changing, None),
                (QueueAction::Plan, Some(EventKind::Button)),
                (QueueAction::Changing, None),
                (QueueAction::Delete, Some(EventKind::Button)),
                (QueueAction::Plan, Some(EventKind::Button)),
                (QueueAction::Wait, None),
                (QueueAction::Dispatch, Some(EventKind::Button)),
            ]
        );
    }
}
