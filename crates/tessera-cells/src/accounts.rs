//! Accounts and their tablet resource limits.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::{CellError, CellResult};

/// Account resources tracked for tables. `None` limits are unlimited.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountResources {
    pub tablet_count: u64,
    pub tablet_static_memory: u64,
    pub chunk_count: u64,
    pub disk_space: u64,
}

impl AccountResources {
    pub fn tablets(count: u64) -> Self {
        Self {
            tablet_count: count,
            ..Self::default()
        }
    }

    fn fields(&self) -> [(&'static str, u64); 4] {
        [
            ("tablet_count", self.tablet_count),
            ("tablet_static_memory", self.tablet_static_memory),
            ("chunk_count", self.chunk_count),
            ("disk_space", self.disk_space),
        ]
    }

    pub fn add(&self, other: &Self) -> Self {
        Self {
            tablet_count: self.tablet_count + other.tablet_count,
            tablet_static_memory: self.tablet_static_memory + other.tablet_static_memory,
            chunk_count: self.chunk_count + other.chunk_count,
            disk_space: self.disk_space + other.disk_space,
        }
    }

    pub fn sub(&self, other: &Self) -> Self {
        Self {
            tablet_count: self.tablet_count.saturating_sub(other.tablet_count),
            tablet_static_memory: self
                .tablet_static_memory
                .saturating_sub(other.tablet_static_memory),
            chunk_count: self.chunk_count.saturating_sub(other.chunk_count),
            disk_space: self.disk_space.saturating_sub(other.disk_space),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountLimits {
    pub tablet_count: Option<u64>,
    pub tablet_static_memory: Option<u64>,
    pub chunk_count: Option<u64>,
    pub disk_space: Option<u64>,
}

impl AccountLimits {
    fn get(&self, resource: &str) -> Option<u64> {
        match resource {
            "tablet_count" => self.tablet_count,
            "tablet_static_memory" => self.tablet_static_memory,
            "chunk_count" => self.chunk_count,
            "disk_space" => self.disk_space,
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Account {
    pub name: String,
    pub limits: AccountLimits,
    pub usage: AccountResources,
}

/// Fail if `usage + delta` exceeds any limit `delta` touches.
pub fn check_limits(
    owner: &str,
    usage: &AccountResources,
    limits: &AccountLimits,
    delta: &AccountResources,
) -> CellResult<()> {
    for ((resource, used), (_, d)) in usage.fields().into_iter().zip(delta.fields()) {
        if d == 0 {
            continue;
        }
        if let Some(limit) = limits.get(resource) {
            if used + d > limit {
                return Err(CellError::ResourceLimitExceeded {
                    owner: owner.to_string(),
                    resource: resource.to_string(),
                    usage: used,
                    delta: d,
                    limit,
                });
            }
        }
    }
    Ok(())
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountRegistry {
    accounts: BTreeMap<String, Account>,
}

impl Default for AccountRegistry {
    fn default() -> Self {
        let mut registry = Self {
            accounts: BTreeMap::new(),
        };
        registry.create("sys", AccountLimits::default());
        registry.create("tmp", AccountLimits::default());
        registry
    }
}

impl AccountRegistry {
    pub fn create(&mut self, name: &str, limits: AccountLimits) {
        self.accounts.insert(
            name.to_string(),
            Account {
                name: name.to_string(),
                limits,
                usage: AccountResources::default(),
            },
        );
    }

    pub fn exists(&self, name: &str) -> bool {
        self.accounts.contains_key(name)
    }

    pub fn get(&self, name: &str) -> Option<&Account> {
        self.accounts.get(name)
    }

    pub fn set_limits(&mut self, name: &str, limits: AccountLimits) -> CellResult<()> {
        let account = self
            .accounts
            .get_mut(name)
            .ok_or_else(|| CellError::Configuration(format!("unknown account {name:?}")))?;
        account.limits = limits;
        Ok(())
    }

    /// Fail with `ResourceLimitExceeded` if charging `delta` would overflow a limit.
    pub fn check(&self, name: &str, delta: &AccountResources) -> CellResult<()> {
        let account = self
            .accounts
            .get(name)
            .ok_or_else(|| CellError::Configuration(format!("unknown account {name:?}")))?;
        check_limits(&format!("account {name:?}"), &account.usage, &account.limits, delta)
    }

    /// Check and charge.
    pub fn charge(&mut self, name: &str, delta: &AccountResources) -> CellResult<()> {
        self.check(name, delta)?;
        if let Some(account) = self.accounts.get_mut(name) {
            account.usage = account.usage.add(delta);
        }
        Ok(())
    }

    pub fn release(&mut self, name: &str, delta: &AccountResources) {
        if let Some(account) = self.accounts.get_mut(name) {
            account.usage = account.usage.sub(delta);
        }
    }

    /// Move usage between accounts; nothing changes if the target is over limit.
    pub fn transfer(&mut self, from: &str, to: &str, delta: &AccountResources) -> CellResult<()> {
        if from == to {
            return Ok(());
        }
        self.check(to, delta)?;
        self.release(from, delta);
        if let Some(account) = self.accounts.get_mut(to) {
            account.usage = account.usage.add(delta);
        }
        Ok(())
    }

    pub fn iter(&self) -> impl Iterator<Item = &Account> {
        self.accounts.values()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn charge_respects_limits() {
        let mut reg = AccountRegistry::default();
        reg.create(
            "small",
            AccountLimits {
                tablet_count: Some(2),
                ..Default::default()
            },
        );
        reg.charge("small", &AccountResources::tablets(2)).unwrap();
        let err = reg.charge("small", &AccountResources::tablets(1)).unwrap_err();
        assert!(matches!(err, CellError::ResourceLimitExceeded { ref resource, .. } if resource == "tablet_count"));
        reg.release("small", &AccountResources::tablets(1));
        reg.charge("small", &AccountResources::tablets(1)).unwrap();
    }

    #[test]
    fn transfer_is_all_or_nothing() {
        let mut reg = AccountRegistry::default();
        reg.create(
            "full",
            AccountLimits {
                tablet_count: Some(0),
                ..Default::default()
            },
        );
        reg.charge("tmp", &AccountResources::tablets(3)).unwrap();
        assert!(reg.transfer("tmp", "full", &AccountResources::tablets(3)).is_err());
        assert_eq!(reg.get("tmp").unwrap().usage.tablet_count, 3);
        reg.transfer("tmp", "sys", &AccountResources::tablets(3)).unwrap();
        assert_eq!(reg.get("tmp").unwrap().usage.tablet_count, 0);
        assert_eq!(reg.get("sys").unwrap().usage.tablet_count, 3);
    }
}
