use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::TxError;

/// Per-node Lamport clock.
///
/// `tick` stamps local events and outgoing messages, `update` folds in a
/// timestamp carried by an incoming message. Every operation is a single
/// atomic read-modify-write, so concurrent callers on one clock observe a
/// linearizable history.
#[derive(Debug, Default)]
pub struct LamportClock {
    time: AtomicU64,
}

impl LamportClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Advance the clock for a local event and return the new time.
    ///
    /// Saturates at `u64::MAX`.
    pub fn tick(&self) -> u64 {
        self.update(0)
    }

    /// Merge a received timestamp: `time = max(time, received) + 1`.
    ///
    /// Saturates at `u64::MAX`; the clock never wraps back to zero.
    pub fn update(&self, received: u64) -> u64 {
        let next = |t: u64| t.max(received).saturating_add(1);
        let prev = self
            .time
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |t| Some(next(t)))
            .unwrap_or_else(|t| t);
        next(prev)
    }

    /// Current time, without advancing.
    pub fn now(&self) -> u64 {
        self.time.load(Ordering::SeqCst)
    }
}

/// An out-of-band message tagged with the sender's Lamport time.
///
/// Wire form is `"<lamport_ts>|<payload>"`; the payload may itself contain `|`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CausalMessage {
    pub lamport_ts: u64,
    pub payload: String,
}

impl CausalMessage {
    /// Stamp `payload` with a fresh tick of `clock`.
    pub fn stamp(clock: &LamportClock, payload: impl Into<String>) -> Self {
        Self {
            lamport_ts: clock.tick(),
            payload: payload.into(),
        }
    }

    /// Apply the carried timestamp to `clock`, returning the receive time.
    pub fn receive(&self, clock: &LamportClock) -> u64 {
        clock.update(self.lamport_ts)
    }
}

impl fmt::Display for CausalMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}|{}", self.lamport_ts, self.payload)
    }
}

impl FromStr for CausalMessage {
    type Err = TxError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (ts, payload) = s
            .split_once('|')
            .ok_or_else(|| TxError::MalformedCausalTag(s.to_string()))?;
        let lamport_ts = ts
            .trim()
            .parse()
            .map_err(|_| TxError::MalformedCausalTag(s.to_string()))?;
        Ok(Self {
            lamport_ts,
            payload: payload.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn tick_and_update_follow_lamport_rules() {
        let clock = LamportClock::new();
        assert_eq!(clock.now(), 0);
        assert_eq!(clock.tick(), 1);
        assert_eq!(clock.tick(), 2);

        // Remote time ahead of ours
        assert_eq!(clock.update(10), 11);
        // Remote time behind ours still advances
        assert_eq!(clock.update(3), 12);
        assert_eq!(clock.now(), 12);
    }

    #[test]
    fn concurrent_ticks_are_unique() {
        let clock = Arc::new(LamportClock::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let clock = clock.clone();
                std::thread::spawn(move || (0..1000).map(|_| clock.tick()).collect::<Vec<_>>())
            })
            .collect();

        let mut all: Vec<u64> = handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect();
        all.sort_unstable();
        all.dedup();
        assert_eq!(all.len(), 8000);
        assert_eq!(clock.now(), 8000);
    }

    #[test]
    fn causal_tag_round_trip() {
        let sender = LamportClock::new();
        let receiver = LamportClock::new();
        sender.update(41);

        let msg = CausalMessage::stamp(&sender, "hello|world");
        let wire = msg.to_string();
        assert_eq!(wire, "43|hello|world");

        let parsed: CausalMessage = wire.parse().unwrap();
        assert_eq!(parsed.payload, "hello|world");
        assert_eq!(parsed.receive(&receiver), 44);
        assert!(receiver.now() > msg.lamport_ts);
    }

    #[test]
    fn clock_saturates_instead_of_wrapping() {
        let clock = LamportClock::new();
        clock.tick();
        assert_eq!(clock.update(u64::MAX), u64::MAX);
        assert_eq!(clock.tick(), u64::MAX);
        assert_eq!(clock.update(5), u64::MAX);
        assert_eq!(clock.now(), u64::MAX);

        let msg: CausalMessage = "18446744073709551615|hi".parse().unwrap();
        assert_eq!(msg.receive(&clock), u64::MAX);
    }

    #[test]
    fn malformed_tag_is_rejected() {
        assert!("no-separator".parse::<CausalMessage>().is_err());
        assert!("abc|payload".parse::<CausalMessage>().is_err());
    }
}
