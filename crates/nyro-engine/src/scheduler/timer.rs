//! Per-worker timer registry
//!
//! A `Timer` is a one-shot or interval function handle. Arming a timer means
//! inserting a matching timer event into the owning worker's queue; the
//! registry entry is only ever freed from that event's own process/discard
//! path, never directly by a cancel call. That rule is what makes a cancel
//! racing with a fire safe: the event checks the cleared sentinel and turns
//! into a plain discard.

use crate::engine::{Callback, Value};
use rustc_hash::FxHashMap;
use std::time::Duration;

/// Default timer id space: ids are masked to 31 bits
pub const DEFAULT_TIMER_ID_MASK: u32 = 0x7fff_ffff;

/// Numeric id of a live timer, unique among live timers at any instant
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct TimerId(u32);

impl TimerId {
    /// The raw id value
    pub fn as_u32(self) -> u32 {
        self.0
    }
}

/// Timer kind encoding
///
/// A live timer is either pending one-shot or an active interval with its
/// period. The two cleared sentinels remember which kind the timer was, so a
/// fired-after-clear event knows to discard without running the callback.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum TimerKind {
    /// One-shot timer that has not fired yet
    OneShot,

    /// Repeating timer with its period
    Interval(Duration),

    /// A one-shot timer that was cleared before its event ran
    ClearedTimeout,

    /// An interval timer that was cleared
    ClearedInterval,
}

impl TimerKind {
    /// Whether this kind is one of the cleared sentinels
    pub fn is_cleared(self) -> bool {
        matches!(self, TimerKind::ClearedTimeout | TimerKind::ClearedInterval)
    }

    /// The cleared sentinel matching this kind
    fn cleared(self) -> TimerKind {
        match self {
            TimerKind::OneShot | TimerKind::ClearedTimeout => TimerKind::ClearedTimeout,
            TimerKind::Interval(_) | TimerKind::ClearedInterval => TimerKind::ClearedInterval,
        }
    }
}

/// A one-shot or interval function handle
#[derive(Debug, Clone)]
pub struct Timer {
    /// Current kind (live or cleared sentinel)
    pub kind: TimerKind,

    /// Script function to invoke when the timer fires
    pub target: Callback,

    /// Arguments passed to the callback on every fire
    pub args: Vec<Value>,
}

impl Timer {
    /// Create a pending one-shot timer
    pub fn one_shot(target: Callback, args: Vec<Value>) -> Self {
        Self {
            kind: TimerKind::OneShot,
            target,
            args,
        }
    }

    /// Create an interval timer with the given period
    pub fn interval(period: Duration, target: Callback, args: Vec<Value>) -> Self {
        Self {
            kind: TimerKind::Interval(period),
            target,
            args,
        }
    }

    /// Move a live timer to its matching cleared sentinel
    pub fn clear(&mut self) {
        self.kind = self.kind.cleared();
    }
}

/// Per-worker registry mapping numeric ids to timers
pub struct TimerContext {
    /// Rolling id counter; the next insert scans forward from here
    next_id: u32,

    /// Id space mask; ids occupy `0..=id_mask`
    id_mask: u32,

    /// Live and cleared-but-not-yet-freed timers
    timers: FxHashMap<u32, Timer>,
}

impl TimerContext {
    /// Create a registry with the default id space
    pub fn new() -> Self {
        Self::with_id_mask(DEFAULT_TIMER_ID_MASK)
    }

    /// Create a registry with a custom id mask (small spaces for tests)
    pub fn with_id_mask(id_mask: u32) -> Self {
        Self {
            next_id: 1,
            id_mask,
            timers: FxHashMap::default(),
        }
    }

    /// Assign a free id to `timer` and register it
    ///
    /// Scans forward from the rolling counter over the masked id space and
    /// takes the first vacant slot, then advances the counter past it.
    /// Returns `None` when every slot in the id space is occupied; callers
    /// treat that as a silent failure, never a crash.
    pub fn insert(&mut self, timer: Timer) -> Option<TimerId> {
        for offset in 0..=self.id_mask {
            let id = self.next_id.wrapping_add(offset) & self.id_mask;
            if let std::collections::hash_map::Entry::Vacant(slot) = self.timers.entry(id) {
                slot.insert(timer);
                self.next_id = id.wrapping_add(1) & self.id_mask;
                return Some(TimerId(id));
            }
        }
        None
    }

    /// Look up a timer by id
    pub fn get(&self, id: TimerId) -> Option<&Timer> {
        self.timers.get(&id.0)
    }

    /// Mark a timer cleared, preserving its registry entry
    ///
    /// Returns false if no timer with that id exists. The entry itself is
    /// freed later, by the discard of the timer's scheduled event.
    pub fn clear(&mut self, id: TimerId) -> bool {
        match self.timers.get_mut(&id.0) {
            Some(timer) => {
                timer.clear();
                true
            }
            None => false,
        }
    }

    /// Free a timer's registry entry
    pub fn remove(&mut self, id: TimerId) -> Option<Timer> {
        self.timers.remove(&id.0)
    }

    /// Mark every registered timer cleared without firing callbacks
    ///
    /// Used only at worker shutdown; the entries are freed as the remaining
    /// queued events are discarded.
    pub fn clear_all(&mut self) {
        for timer in self.timers.values_mut() {
            timer.clear();
        }
    }

    /// Number of registered timers, cleared sentinels included
    pub fn len(&self) -> usize {
        self.timers.len()
    }

    /// Whether no timers are registered
    pub fn is_empty(&self) -> bool {
        self.timers.is_empty()
    }

    /// Number of timers that are live (not cleared)
    pub fn live_count(&self) -> usize {
        self.timers
            .values()
            .filter(|timer| !timer.kind.is_cleared())
            .count()
    }
}

impl Default for TimerContext {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn one_shot() -> Timer {
        Timer::one_shot(Callback::new(), Vec::new())
    }

    #[test]
    fn test_insert_assigns_unique_ids() {
        let mut ctx = TimerContext::new();
        let a = ctx.insert(one_shot()).unwrap();
        let b = ctx.insert(one_shot()).unwrap();
        let c = ctx.insert(one_shot()).unwrap();

        assert_ne!(a, b);
        assert_ne!(b, c);
        assert_eq!(ctx.len(), 3);
        assert_eq!(ctx.live_count(), 3);
    }

    #[test]
    fn test_small_id_space_never_duplicates() {
        // 16-slot id space, heavy churn
        let mut ctx = TimerContext::with_id_mask(0xf);
        let mut live: Vec<TimerId> = Vec::new();

        for round in 0..100 {
            let id = ctx.insert(one_shot()).unwrap();
            assert!(!live.contains(&id), "duplicate live id on round {round}");
            live.push(id);

            if live.len() == 8 {
                for id in live.drain(..4) {
                    ctx.remove(id);
                }
            }
        }
    }

    #[test]
    fn test_exhaustion_returns_none_only_when_full() {
        let mut ctx = TimerContext::with_id_mask(0xf);
        let ids: Vec<TimerId> = (0..16).map(|_| ctx.insert(one_shot()).unwrap()).collect();
        assert_eq!(ids.len(), 16);

        // Genuinely full: 17th insert fails
        assert!(ctx.insert(one_shot()).is_none());

        // Freeing one slot makes insertion succeed again
        ctx.remove(ids[5]);
        let replacement = ctx.insert(one_shot()).unwrap();
        assert_eq!(replacement, ids[5]);
        assert!(ctx.insert(one_shot()).is_none());
    }

    #[test]
    fn test_clear_moves_to_matching_sentinel() {
        let mut ctx = TimerContext::new();
        let timeout = ctx.insert(one_shot()).unwrap();
        let interval = ctx
            .insert(Timer::interval(
                Duration::from_millis(10),
                Callback::new(),
                Vec::new(),
            ))
            .unwrap();

        assert!(ctx.clear(timeout));
        assert!(ctx.clear(interval));
        assert_eq!(ctx.get(timeout).unwrap().kind, TimerKind::ClearedTimeout);
        assert_eq!(ctx.get(interval).unwrap().kind, TimerKind::ClearedInterval);

        // Cleared entries still occupy their id until their event discards them
        assert_eq!(ctx.len(), 2);
        assert_eq!(ctx.live_count(), 0);
    }

    #[test]
    fn test_clear_unknown_id_is_noop() {
        let mut ctx = TimerContext::new();
        let id = ctx.insert(one_shot()).unwrap();
        ctx.remove(id);
        assert!(!ctx.clear(id));
    }

    #[test]
    fn test_clear_all_preserves_entries() {
        let mut ctx = TimerContext::new();
        for _ in 0..5 {
            ctx.insert(one_shot()).unwrap();
        }
        ctx.clear_all();
        assert_eq!(ctx.len(), 5);
        assert_eq!(ctx.live_count(), 0);
    }
}
