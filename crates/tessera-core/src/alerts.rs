//! Persistent alerts.
//!
//! Alerts are values, not errors: raising one never interrupts the caller.
//! They stay in the set until explicitly cleared.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::time::Millis;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    SchedulerCannotConnect,
    PoolTreeGuaranteesOvercommit,
    IntegralGuaranteesOvercommit,
    CypressSynchronizerPassFailed,
    QueueAgentPassFailed,
    FairShareUpdateFailed,
    BalancerPassFailed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    pub kind: AlertKind,
    pub message: String,
    pub raised_at: Millis,
}

/// Alerts keyed by `(kind, scope)`; scope is e.g. a pool tree name.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AlertSet {
    alerts: BTreeMap<(AlertKind, String), Alert>,
}

impl AlertSet {
    /// Raise or refresh an alert. The original `raised_at` is kept.
    /// Returns true if the alert is new.
    pub fn raise(&mut self, kind: AlertKind, scope: &str, message: String, now: Millis) -> bool {
        let key = (kind, scope.to_string());
        match self.alerts.get_mut(&key) {
            Some(existing) => {
                existing.message = message;
                false
            }
            None => {
                self.alerts.insert(
                    key,
                    Alert {
                        kind,
                        message,
                        raised_at: now,
                    },
                );
                true
            }
        }
    }

    /// Returns true if an alert was present.
    pub fn clear(&mut self, kind: AlertKind, scope: &str) -> bool {
        self.alerts.remove(&(kind, scope.to_string())).is_some()
    }

    pub fn contains(&self, kind: AlertKind, scope: &str) -> bool {
        self.alerts.contains_key(&(kind, scope.to_string()))
    }

    pub fn has_kind(&self, kind: AlertKind) -> bool {
        self.alerts.keys().any(|(k, _)| *k == kind)
    }

    pub fn list(&self) -> Vec<Alert> {
        self.alerts.values().cloned().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.alerts.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raise_is_idempotent_and_keeps_first_timestamp() {
        let mut set = AlertSet::default();
        assert!(set.raise(AlertKind::PoolTreeGuaranteesOvercommit, "default", "a".into(), 10));
        assert!(!set.raise(AlertKind::PoolTreeGuaranteesOvercommit, "default", "b".into(), 20));
        let alerts = set.list();
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].raised_at, 10);
        assert_eq!(alerts[0].message, "b");
        assert!(set.clear(AlertKind::PoolTreeGuaranteesOvercommit, "default"));
        assert!(set.is_empty());
    }
}
