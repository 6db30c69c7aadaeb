//! Change detection and notification dedup.
//!
//! A state is announced the first time it is seen, again whenever it
//! changes, and re-announced every `resend_interval` while it stays the
//! same. An empty listing forgets the last state, so a set that returns
//! later counts as new.

use crate::extract::Offer;
use chrono::{DateTime, Utc};
use std::fmt;
use std::time::Duration;

/// Order-independent identity of an offer set.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Fingerprint(String);

impl Fingerprint {
    pub fn of(offers: &[Offer]) -> Self {
        let mut keys: Vec<(&str, &str, &str)> = offers
            .iter()
            .map(|o| (o.price.as_str(), o.quantity.as_str(), o.kind.as_str()))
            .collect();
        keys.sort_unstable();
        Fingerprint(format!("{:?}", keys))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotifyReason {
    /// Nothing was announced before, or the last state was cleared.
    New,
    Changed,
    /// Unchanged, but the resend interval has passed.
    Resend,
}

impl fmt::Display for NotifyReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NotifyReason::New => write!(f, "new"),
            NotifyReason::Changed => write!(f, "changed"),
            NotifyReason::Resend => write!(f, "resend"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Suppress,
    Notify { count: usize, reason: NotifyReason },
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Announced {
    fingerprint: Fingerprint,
    at: DateTime<Utc>,
}

/// Last announced state. Fingerprint and timestamp are set together or
/// not at all.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DedupRecord {
    last: Option<Announced>,
}

impl DedupRecord {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn last_fingerprint(&self) -> Option<&Fingerprint> {
        self.last.as_ref().map(|a| &a.fingerprint)
    }

    pub fn last_notified_at(&self) -> Option<DateTime<Utc>> {
        self.last.as_ref().map(|a| a.at)
    }

    pub fn clear(&mut self) {
        self.last = None;
    }

    /// Decide whether `offers` warrant a notification at `now`. Empty
    /// offers suppress and clear the record.
    pub fn decide(&mut self, offers: &[Offer], resend_interval: Duration, now: DateTime<Utc>) -> Decision {
        if offers.is_empty() {
            self.clear();
            return Decision::Suppress;
        }

        let count = offers.len();
        let fingerprint = Fingerprint::of(offers);
        match self.last {
            None => Decision::Notify {
                count,
                reason: NotifyReason::New,
            },
            Some(ref last) if last.fingerprint != fingerprint => Decision::Notify {
                count,
                reason: NotifyReason::Changed,
            },
            Some(ref last) => {
                // A clock that went backwards counts as no time elapsed.
                let elapsed = (now - last.at).to_std().unwrap_or(Duration::ZERO);
                if elapsed >= resend_interval {
                    Decision::Notify {
                        count,
                        reason: NotifyReason::Resend,
                    }
                } else {
                    Decision::Suppress
                }
            }
        }
    }

    /// Record that `offers` were announced at `now`.
    pub fn commit(&mut self, offers: &[Offer], now: DateTime<Utc>) {
        self.last = Some(Announced {
            fingerprint: Fingerprint::of(offers),
            at: now,
        });
    }
}
