// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

//! Identifiers: nodes, dispatchers, and transaction instances.
//!
//! A [TxnId] is issued by a single dispatcher without coordination and is
//! assumed globally unique because it embeds the dispatcher's id. It also
//! carries the instance's _logical timestamp_: the millisecond component is
//! fixed when the instance begins and is the only notion of time a hop's
//! statements can observe, so re-executing a hop is reproducible.

use async_std::sync::Arc;
use serde::{Deserialize, Serialize};
use std::convert::TryFrom;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// A data-owning node (logical shard). Nodes are numbered `0..cluster_size`.
#[derive(Clone, Copy, Default, PartialOrd, Ord, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NodeId(pub u32);

impl std::fmt::Debug for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_fmt(format_args!("n{}", self.0))
    }
}

/// Identifies a dispatcher; should be unique across all dispatchers that share
/// a cluster. A randomly-chosen u64 suffices.
#[derive(Clone, Copy, Default, PartialOrd, Ord, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DispatcherId(pub u64);

impl std::fmt::Debug for DispatcherId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_fmt(format_args!("#{}", self.0))
    }
}

/// Unique, totally ordered id of one transaction instance.
#[derive(Clone, Copy, Default, PartialOrd, Ord, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TxnId {
    pub milli_secs: u64,
    pub dispatcher: DispatcherId,
    pub event: u64,
}

impl std::fmt::Debug for TxnId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_fmt(format_args!(
            "{}.{}@{}",
            self.milli_secs, self.event, self.dispatcher.0
        ))
    }
}

impl TxnId {
    pub fn new(dispatcher: DispatcherId, milli_secs: u64, event: u64) -> TxnId {
        TxnId {
            milli_secs,
            dispatcher,
            event,
        }
    }

    pub fn time_zero_for(dispatcher: DispatcherId) -> TxnId {
        // Event numbering starts at 1 so "the previous event" never wraps in logs.
        TxnId::new(dispatcher, 0, 1)
    }

    /// The logical timestamp handed to every hop of this instance.
    pub fn logical_time(&self) -> u64 {
        self.milli_secs
    }

    pub fn with_milli_sec(&self, milli_secs: u64) -> TxnId {
        Self {
            milli_secs,
            ..*self
        }
    }

    pub fn with_event(&self, event: u64) -> TxnId {
        Self { event, ..*self }
    }

    pub fn next_event(&self) -> TxnId {
        match self.event {
            u64::MAX => Self {
                milli_secs: self.milli_secs.saturating_add(1),
                event: 0,
                ..*self
            },
            v => self.with_event(v + 1),
        }
    }
}

/// Trait to support multiple sorts of clock-source.
pub trait Clock: Send + Sync {
    fn current_time(&self) -> SystemTime;
}

/// An implementation of [Clock] that calls [std::time::SystemTime::now].
pub struct RealClock;
impl Clock for RealClock {
    fn current_time(&self) -> SystemTime {
        std::time::SystemTime::now()
    }
}

/// An implementation of [Clock] that holds a shared [AtomicU64] representing
/// the current millisecond count since the epoch, that increments on each
/// call to `Clock::current_time`.
#[derive(Clone)]
pub struct TestClock(Arc<AtomicU64>);
impl TestClock {
    pub fn new() -> Self {
        TestClock(Arc::new(AtomicU64::from(0)))
    }

    pub fn starting_at(millis: u64) -> Self {
        TestClock(Arc::new(AtomicU64::from(millis)))
    }
}
impl Default for TestClock {
    fn default() -> Self {
        Self::new()
    }
}
impl Clock for TestClock {
    fn current_time(&self) -> SystemTime {
        SystemTime::UNIX_EPOCH + Duration::from_millis(self.0.fetch_add(1, Ordering::SeqCst))
    }
}

/// Hands out monotonically-increasing [TxnId]s for one dispatcher.
pub struct TxnIdIssuer {
    /// The clock source we'll use to draw system time from.
    clock: Box<dyn Clock>,

    /// The previously-issued id; only advances, regardless of the clock.
    prev: TxnId,
}

impl TxnIdIssuer {
    pub fn new(dispatcher: DispatcherId, clock: Box<dyn Clock>) -> Self {
        TxnIdIssuer {
            clock,
            prev: TxnId::time_zero_for(dispatcher),
        }
    }

    pub fn dispatcher(&self) -> DispatcherId {
        self.prev.dispatcher
    }

    /// Usually this moves forward with the clock, but if the clock stalls or
    /// goes backwards we just bump the event counter of the previous id.
    pub fn issue(&mut self) -> TxnId {
        let next_millis = self
            .clock
            .current_time()
            .duration_since(UNIX_EPOCH)
            .ok()
            .and_then(|dur| u64::try_from(dur.as_millis()).ok());
        self.prev = match next_millis {
            Some(millis) if millis > self.prev.milli_secs => {
                self.prev.with_milli_sec(millis).with_event(1)
            }
            _ => self.prev.next_event(),
        };
        self.prev
    }

    /// Makes sure ids issued from now on sort after `seen`; used after
    /// recovering instances from a persisted log.
    pub fn observe(&mut self, seen: TxnId) {
        if seen.dispatcher == self.prev.dispatcher && seen > self.prev {
            self.prev = seen;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct StuckClock;
    impl Clock for StuckClock {
        fn current_time(&self) -> SystemTime {
            SystemTime::UNIX_EPOCH + Duration::from_millis(5)
        }
    }

    #[test]
    fn ids_are_monotonic_even_with_a_stuck_clock() {
        let mut issuer = TxnIdIssuer::new(DispatcherId(9), Box::new(StuckClock));
        let a = issuer.issue();
        let b = issuer.issue();
        let c = issuer.issue();
        assert!(a < b && b < c);
        assert_eq!(a.logical_time(), 5);
        assert_eq!(c.logical_time(), 5);
        assert_eq!(c.dispatcher, DispatcherId(9));
    }

    #[test]
    fn observe_skips_past_recovered_ids() {
        let mut issuer = TxnIdIssuer::new(DispatcherId(1), Box::new(StuckClock));
        let recovered = TxnId::new(DispatcherId(1), 50, 3);
        issuer.observe(recovered);
        assert!(issuer.issue() > recovered);
    }

    #[test]
    fn test_clock_ticks() {
        let clock = TestClock::starting_at(10);
        let mut issuer = TxnIdIssuer::new(DispatcherId(2), Box::new(clock.clone()));
        assert_eq!(issuer.issue().logical_time(), 10);
        assert_eq!(issuer.issue().logical_time(), 11);
    }
}
