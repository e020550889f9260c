//! Starvation tracking.
//!
//! An entity becomes `starving` once its satisfaction stays below its
//! tolerance for the starvation timeout, and `aggressively_starving` once
//! it stays below the aggressive tolerance for the aggressive timeout. It
//! stays starving until its satisfaction reaches 1, so preemption in its
//! favor runs until it holds its full fair share.

use std::collections::BTreeMap;

use tessera_core::{Millis, OperationId, EPSILON};

use crate::shares::StarvationStatus;

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub enum EntityKey {
    Pool(String),
    Operation(OperationId),
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StarvationParams {
    pub tolerance: f64,
    pub aggressive_tolerance: f64,
    pub timeout_ms: u64,
    pub aggressive_timeout_ms: u64,
}

#[derive(Debug, Clone, Copy, Default)]
struct Track {
    below_since: Option<Millis>,
    aggressive_since: Option<Millis>,
    status: StarvationStatus,
}

#[derive(Debug, Default)]
pub struct StarvationTracker {
    tracks: BTreeMap<EntityKey, Track>,
}

impl StarvationTracker {
    pub fn update(
        &mut self,
        key: EntityKey,
        satisfaction: f64,
        params: &StarvationParams,
        now: Millis,
    ) -> StarvationStatus {
        let track = self.tracks.entry(key).or_default();
        if satisfaction >= 1.0 - EPSILON {
            *track = Track::default();
            return StarvationStatus::NonStarving;
        }

        let below = satisfaction < params.tolerance - EPSILON;
        if below {
            track.below_since.get_or_insert(now);
        } else if track.status == StarvationStatus::NonStarving {
            track.below_since = None;
        }
        if satisfaction < params.aggressive_tolerance - EPSILON {
            track.aggressive_since.get_or_insert(now);
        } else {
            track.aggressive_since = None;
        }

        let elapsed = |since: Option<Millis>| since.map(|t| now.saturating_sub(t));
        let status = if elapsed(track.aggressive_since).is_some_and(|e| e >= params.aggressive_timeout_ms) {
            StarvationStatus::AggressivelyStarving
        } else if track.status.is_starving()
            || elapsed(track.below_since).is_some_and(|e| e >= params.timeout_ms)
        {
            StarvationStatus::Starving
        } else {
            StarvationStatus::NonStarving
        };
        track.status = status;
        status
    }

    pub fn below_since(&self, key: &EntityKey) -> Option<Millis> {
        self.tracks.get(key).and_then(|t| t.below_since)
    }

    /// Drop tracks of entities not seen in the last update.
    pub fn retain(&mut self, mut keep: impl FnMut(&EntityKey) -> bool) {
        self.tracks.retain(|key, _| keep(key));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params() -> StarvationParams {
        StarvationParams {
            tolerance: 0.8,
            aggressive_tolerance: 0.5,
            timeout_ms: 1_000,
            aggressive_timeout_ms: 5_000,
        }
    }

    #[test]
    fn starving_after_timeout_until_satisfied() {
        let mut tracker = StarvationTracker::default();
        let key = || EntityKey::Pool("p".into());
        assert_eq!(tracker.update(key(), 0.6, &params(), 0), StarvationStatus::NonStarving);
        assert_eq!(tracker.update(key(), 0.6, &params(), 999), StarvationStatus::NonStarving);
        assert_eq!(tracker.update(key(), 0.6, &params(), 1_000), StarvationStatus::Starving);
        // Above tolerance but below the full fair share: still starving.
        assert_eq!(tracker.update(key(), 0.9, &params(), 1_100), StarvationStatus::Starving);
        assert_eq!(tracker.update(key(), 1.0, &params(), 1_200), StarvationStatus::NonStarving);
        assert_eq!(tracker.below_since(&key()), None);
    }

    #[test]
    fn recovering_before_timeout_resets_the_clock() {
        let mut tracker = StarvationTracker::default();
        let key = || EntityKey::Pool("p".into());
        tracker.update(key(), 0.5, &params(), 0);
        tracker.update(key(), 0.9, &params(), 500);
        assert_eq!(tracker.update(key(), 0.5, &params(), 1_200), StarvationStatus::NonStarving);
        assert_eq!(tracker.below_since(&key()), Some(1_200));
    }

    #[test]
    fn aggressive_starvation_needs_the_longer_timeout() {
        let mut tracker = StarvationTracker::default();
        let key = || EntityKey::Pool("p".into());
        tracker.update(key(), 0.1, &params(), 0);
        assert_eq!(tracker.update(key(), 0.1, &params(), 1_000), StarvationStatus::Starving);
        assert_eq!(
            tracker.update(key(), 0.1, &params(), 5_000),
            StarvationStatus::AggressivelyStarving
        );
    }
}
