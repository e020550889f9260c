//! A single pool tree: pool hierarchy, ephemeral pools and the operations
//! placed in them.

use std::collections::{BTreeMap, BTreeSet};

use serde::Serialize;
use tracing::{debug, info};

use tessera_core::{
    Millis, OperationId, Permission, PoolTreeConfig, ResourceVector, UserDirectory, ROOT_POOL_NAME,
    ROOT_USER,
};
use tessera_state::{EphemeralPoolRecord, FairShareSnapshot, PoolStateRecord};

use crate::error::{PoolError, PoolResult};
use crate::pool::{ephemeral_subpool_name, validate_pool_name, Pool, PoolConfig};

/// Placement of one operation in the tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PoolOperation {
    pub pool: String,
    pub user: String,
    pub running: bool,
    /// Registration order; ties between equal submit times break on it.
    pub seq: u64,
}

struct Placement {
    pool: String,
    create: Option<NewEphemeral>,
}

struct NewEphemeral {
    parent: String,
    subpool: bool,
}

pub struct PoolTree {
    name: String,
    config: PoolTreeConfig,
    pools: BTreeMap<String, Pool>,
    /// Pool names in creation order, root first.
    order: Vec<String>,
    operations: BTreeMap<OperationId, PoolOperation>,
    user_ephemeral_pools: BTreeMap<String, BTreeSet<String>>,
    user_default_parents: BTreeMap<String, String>,
    next_seq: u64,
}

impl PoolTree {
    pub fn new(name: &str, config: PoolTreeConfig) -> Self {
        let root_config = PoolConfig {
            acl: Pool::root_acl(),
            ..PoolConfig::default()
        };
        let root = Pool::new(ROOT_POOL_NAME, None, root_config, 0);
        let mut pools = BTreeMap::new();
        pools.insert(ROOT_POOL_NAME.to_string(), root);
        Self {
            name: name.to_string(),
            config,
            pools,
            order: vec![ROOT_POOL_NAME.to_string()],
            operations: BTreeMap::new(),
            user_ephemeral_pools: BTreeMap::new(),
            user_default_parents: BTreeMap::new(),
            next_seq: 0,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &PoolTreeConfig {
        &self.config
    }

    pub fn set_config(&mut self, config: PoolTreeConfig) {
        if !self.pools.contains_key(&config.default_parent_pool) {
            debug!(tree = %self.name, parent = %config.default_parent_pool, "default parent pool does not exist yet");
        }
        self.config = config;
    }

    // ── Lookup ─────────────────────────────────────────────────

    pub fn root(&self) -> &Pool {
        &self.pools[ROOT_POOL_NAME]
    }

    pub fn pool(&self, name: &str) -> Option<&Pool> {
        self.pools.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.pools.contains_key(name)
    }

    fn require(&self, name: &str) -> PoolResult<&Pool> {
        self.pools.get(name).ok_or_else(|| PoolError::NoSuchPool {
            tree: self.name.clone(),
            pool: name.to_string(),
        })
    }

    fn require_mut(&mut self, name: &str) -> PoolResult<&mut Pool> {
        let tree = &self.name;
        self.pools.get_mut(name).ok_or_else(|| PoolError::NoSuchPool {
            tree: tree.clone(),
            pool: name.to_string(),
        })
    }

    /// Pools in creation order, root first.
    pub fn pools(&self) -> impl Iterator<Item = &Pool> {
        self.order.iter().filter_map(|name| self.pools.get(name))
    }

    pub fn len(&self) -> usize {
        self.pools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pools.len() <= 1
    }

    /// Direct children in creation order.
    pub fn children(&self, name: &str) -> Vec<&Pool> {
        self.pools()
            .filter(|p| p.parent.as_deref() == Some(name))
            .collect()
    }

    /// `name` followed by its ancestors up to the root.
    pub fn path_to_root(&self, name: &str) -> Vec<&Pool> {
        let mut path = Vec::new();
        let mut current = self.pools.get(name);
        while let Some(pool) = current {
            path.push(pool);
            current = pool.parent.as_deref().and_then(|p| self.pools.get(p));
        }
        path
    }

    /// True if `name` is `ancestor` or lies below it.
    pub fn is_in_subtree(&self, name: &str, ancestor: &str) -> bool {
        self.path_to_root(name).iter().any(|p| p.name == ancestor)
    }

    pub fn state_mut(&mut self, name: &str) -> Option<&mut PoolStateRecord> {
        self.pools.get_mut(name).map(|p| &mut p.state)
    }

    // ── Pool edits ─────────────────────────────────────────────

    /// Create an explicit pool, or promote an ephemeral pool of the same
    /// name in place. Returns true on promotion.
    pub fn create_pool(
        &mut self,
        name: &str,
        parent: Option<&str>,
        config: PoolConfig,
        now: Millis,
    ) -> PoolResult<bool> {
        validate_pool_name(name)?;
        config.validate()?;
        let parent = parent.unwrap_or(ROOT_POOL_NAME);
        self.require(parent)?;

        if let Some(existing) = self.pools.get(name) {
            if !existing.is_ephemeral {
                return Err(PoolError::PoolExists(name.to_string()));
            }
            if self.is_in_subtree(parent, name) {
                return Err(PoolError::Configuration(format!(
                    "pool {name:?} cannot become a descendant of itself"
                )));
            }
            let user = existing.user_name.clone();
            let pool = self.require_mut(name)?;
            pool.is_ephemeral = false;
            pool.user_name = None;
            pool.parent = Some(parent.to_string());
            pool.set_config(config);
            if let Some(user) = user {
                self.forget_user_pool(&user, name);
            }
            info!(tree = %self.name, pool = name, parent, "ephemeral pool promoted");
            return Ok(true);
        }

        self.pools
            .insert(name.to_string(), Pool::new(name, Some(parent), config, now));
        self.order.push(name.to_string());
        info!(tree = %self.name, pool = name, parent, "pool created");
        Ok(false)
    }

    pub fn update_pool_config(&mut self, name: &str, config: PoolConfig) -> PoolResult<()> {
        config.validate()?;
        let pool = self.require_mut(name)?;
        if pool.is_ephemeral {
            return Err(PoolError::InvalidState(format!(
                "pool {name:?} is ephemeral; create it explicitly to configure it"
            )));
        }
        pool.set_config(config);
        debug!(tree = %self.name, pool = name, "pool config updated");
        Ok(())
    }

    /// Remove an explicit pool.
    ///
    /// A pool that still holds operations is demoted to an ephemeral pool
    /// with fresh state instead, and goes away with its last operation.
    pub fn remove_pool(&mut self, name: &str) -> PoolResult<()> {
        let pool = self.require(name)?;
        if pool.is_root() {
            return Err(PoolError::InvalidState("the root pool cannot be removed".into()));
        }
        if pool.is_ephemeral {
            return Err(PoolError::InvalidState(format!(
                "pool {name:?} is ephemeral and is removed with its last operation"
            )));
        }
        if !self.children(name).is_empty() {
            return Err(PoolError::InvalidState(format!("pool {name:?} has child pools")));
        }

        let owner = self
            .operations
            .values()
            .filter(|o| o.pool == name)
            .min_by_key(|o| o.seq)
            .map(|o| o.user.clone());
        match owner {
            None => {
                self.pools.remove(name);
                self.order.retain(|n| n != name);
                info!(tree = %self.name, pool = name, "pool removed");
            }
            Some(user) => {
                let tree = self.name.clone();
                let pool = self.require_mut(name)?;
                pool.is_ephemeral = true;
                pool.user_name = Some(user.clone());
                pool.set_config(PoolConfig::default());
                pool.state = PoolStateRecord::default();
                self.user_ephemeral_pools
                    .entry(user.clone())
                    .or_default()
                    .insert(name.to_string());
                info!(%tree, pool = name, %user, "pool demoted to ephemeral");
            }
        }
        Ok(())
    }

    /// Re-parent a pool. Operations, historic usage and volume move with it.
    pub fn move_pool(&mut self, name: &str, new_parent: &str) -> PoolResult<()> {
        if self.require(name)?.is_root() {
            return Err(PoolError::InvalidState("the root pool cannot be moved".into()));
        }
        self.require(new_parent)?;
        if self.is_in_subtree(new_parent, name) {
            return Err(PoolError::Configuration(format!(
                "pool {name:?} cannot become a descendant of itself"
            )));
        }
        self.require_mut(name)?.parent = Some(new_parent.to_string());
        info!(tree = %self.name, pool = name, parent = new_parent, "pool moved");
        Ok(())
    }

    /// Rename a pool. Operations, historic usage and volume stay with it.
    pub fn rename_pool(&mut self, old: &str, new: &str) -> PoolResult<()> {
        validate_pool_name(new)?;
        if self.require(old)?.is_root() {
            return Err(PoolError::InvalidState("the root pool cannot be renamed".into()));
        }
        if self.pools.contains_key(new) {
            return Err(PoolError::PoolExists(new.to_string()));
        }
        let Some(mut pool) = self.pools.remove(old) else {
            return Err(PoolError::NoSuchPool {
                tree: self.name.clone(),
                pool: old.to_string(),
            });
        };
        pool.name = new.to_string();
        self.pools.insert(new.to_string(), pool);

        for name in self.order.iter_mut().filter(|n| n.as_str() == old) {
            *name = new.to_string();
        }
        for child in self.pools.values_mut() {
            if child.parent.as_deref() == Some(old) {
                child.parent = Some(new.to_string());
            }
        }
        for op in self.operations.values_mut().filter(|o| o.pool == old) {
            op.pool = new.to_string();
        }
        for pools in self.user_ephemeral_pools.values_mut() {
            if pools.remove(old) {
                pools.insert(new.to_string());
            }
        }
        for parent in self.user_default_parents.values_mut().filter(|p| p.as_str() == old) {
            *parent = new.to_string();
        }
        if self.config.default_parent_pool == old {
            self.config.default_parent_pool = new.to_string();
        }
        info!(tree = %self.name, from = old, to = new, "pool renamed");
        Ok(())
    }

    /// Per-user override of the tree's `default_parent_pool`.
    pub fn set_user_default_parent(&mut self, user: &str, parent: Option<&str>) -> PoolResult<()> {
        match parent {
            Some(parent) => {
                self.require(parent)?;
                self.user_default_parents
                    .insert(user.to_string(), parent.to_string());
            }
            None => {
                self.user_default_parents.remove(user);
            }
        }
        Ok(())
    }

    pub fn default_parent_for(&self, user: &str) -> &str {
        self.user_default_parents
            .get(user)
            .map(String::as_str)
            .unwrap_or(&self.config.default_parent_pool)
    }

    /// Check `permission` on `pool`, falling back to ancestors' ACLs.
    pub fn check_permission(
        &self,
        pool: &str,
        user: &str,
        users: &UserDirectory,
        permission: Permission,
    ) -> PoolResult<()> {
        if user == ROOT_USER {
            return Ok(());
        }
        let subjects = users.subjects(user);
        let refs: Vec<&str> = subjects.iter().map(String::as_str).collect();
        for p in self.path_to_root(pool) {
            if let Some(allowed) = p.config.acl.decide(&refs, permission) {
                if allowed {
                    return Ok(());
                }
                break;
            }
        }
        Err(PoolError::AccessDenied {
            user: user.to_string(),
            permission,
            pool: pool.to_string(),
        })
    }

    // ── Operations ─────────────────────────────────────────────

    pub fn operation(&self, id: OperationId) -> Option<&PoolOperation> {
        self.operations.get(&id)
    }

    pub fn operations(&self) -> impl Iterator<Item = (OperationId, &PoolOperation)> {
        self.operations.iter().map(|(id, op)| (*id, op))
    }

    pub fn operation_count(&self) -> usize {
        self.operations.len()
    }

    /// Operations placed directly in `pool`, in registration order.
    pub fn operations_in(&self, pool: &str) -> Vec<OperationId> {
        let mut ops: Vec<(u64, OperationId)> = self
            .operations
            .iter()
            .filter(|(_, o)| o.pool == pool)
            .map(|(id, o)| (o.seq, *id))
            .collect();
        ops.sort();
        ops.into_iter().map(|(_, id)| id).collect()
    }

    fn subtree_count(&self, pool: &str, running_only: bool) -> usize {
        self.operations
            .values()
            .filter(|o| !running_only || o.running)
            .filter(|o| self.is_in_subtree(&o.pool, pool))
            .count()
    }

    fn operation_limit(&self, pool: &Pool) -> usize {
        pool.config.max_operation_count.unwrap_or(if pool.is_root() {
            self.config.max_operation_count
        } else {
            self.config.max_operation_count_per_pool
        })
    }

    fn running_limit(&self, pool: &Pool) -> usize {
        pool.config.max_running_operation_count.unwrap_or(if pool.is_root() {
            self.config.max_running_operation_count
        } else {
            self.config.max_running_operation_count_per_pool
        })
    }

    /// Place an operation of `user` into `requested` (or the user's own
    /// pool name). Unknown pools are created as ephemeral pools under the
    /// user's default parent. Returns the pool the operation landed in.
    pub fn register_operation(
        &mut self,
        id: OperationId,
        user: &str,
        requested: Option<&str>,
        users: &UserDirectory,
        now: Millis,
    ) -> PoolResult<String> {
        if self.operations.contains_key(&id) {
            return Err(PoolError::InvalidState(format!(
                "operation {id} is already registered in tree {:?}",
                self.name
            )));
        }
        let placement = self.resolve_placement(user, requested, users)?;
        let anchor = placement
            .create
            .as_ref()
            .map_or(placement.pool.as_str(), |c| c.parent.as_str());
        self.check_operation_limits(anchor)?;

        if let Some(create) = &placement.create {
            self.create_ephemeral(&placement.pool, &create.parent, user, create.subpool, now);
        }
        let seq = self.next_seq;
        self.next_seq += 1;
        self.operations.insert(
            id,
            PoolOperation {
                pool: placement.pool.clone(),
                user: user.to_string(),
                running: false,
                seq,
            },
        );
        debug!(tree = %self.name, %id, pool = %placement.pool, "operation registered");
        Ok(placement.pool)
    }

    fn resolve_placement(
        &self,
        user: &str,
        requested: Option<&str>,
        users: &UserDirectory,
    ) -> PoolResult<Placement> {
        let name = requested.unwrap_or(user);
        validate_pool_name(name)?;

        match self.pools.get(name) {
            Some(pool) if pool.config.create_ephemeral_subpools => {
                self.check_permission(name, user, users, Permission::Use)?;
                let subpool = ephemeral_subpool_name(name, user);
                let create = (!self.pools.contains_key(&subpool)).then(|| NewEphemeral {
                    parent: name.to_string(),
                    subpool: true,
                });
                Ok(Placement { pool: subpool, create })
            }
            Some(pool) => {
                if pool.config.forbid_immediate_operations {
                    return Err(PoolError::Configuration(format!(
                        "starting operations directly in pool {name:?} is forbidden"
                    )));
                }
                self.check_permission(name, user, users, Permission::Use)?;
                Ok(Placement {
                    pool: name.to_string(),
                    create: None,
                })
            }
            None => {
                let parent = self.default_parent_for(user).to_string();
                if !self.pools.contains_key(&parent) {
                    return Err(PoolError::Configuration(format!(
                        "default parent pool {parent:?} of tree {:?} does not exist",
                        self.name
                    )));
                }
                self.check_permission(&parent, user, users, Permission::Use)?;
                let owned = self.user_ephemeral_pools.get(user).map_or(0, BTreeSet::len);
                let max = self.config.max_ephemeral_pools_per_user;
                if owned >= max {
                    return Err(PoolError::Configuration(format!(
                        "limit for the number of ephemeral pools ({max}) of user {user:?} in tree {:?} has been reached",
                        self.name
                    )));
                }
                Ok(Placement {
                    pool: name.to_string(),
                    create: Some(NewEphemeral {
                        parent,
                        subpool: false,
                    }),
                })
            }
        }
    }

    fn check_operation_limits(&self, anchor: &str) -> PoolResult<()> {
        for pool in self.path_to_root(anchor) {
            let limit = self.operation_limit(pool);
            if self.subtree_count(&pool.name, false) >= limit {
                let scope = if pool.is_root() {
                    format!("tree {:?}", self.name)
                } else {
                    format!("pool {:?}", pool.name)
                };
                return Err(PoolError::TooManyOperations { scope, limit });
            }
        }
        Ok(())
    }

    fn create_ephemeral(&mut self, name: &str, parent: &str, user: &str, subpool: bool, now: Millis) {
        let config = if subpool {
            let template = self
                .pools
                .get(parent)
                .and_then(|p| p.config.ephemeral_subpool_config.as_ref());
            PoolConfig::for_ephemeral_subpool(template)
        } else {
            PoolConfig::default()
        };
        let mut pool = Pool::new(name, Some(parent), config, now);
        pool.is_ephemeral = true;
        pool.user_name = Some(user.to_string());
        self.pools.insert(name.to_string(), pool);
        self.order.push(name.to_string());
        if !subpool {
            self.user_ephemeral_pools
                .entry(user.to_string())
                .or_default()
                .insert(name.to_string());
        }
        info!(tree = %self.name, pool = name, parent, %user, "ephemeral pool created");
    }

    fn forget_user_pool(&mut self, user: &str, pool: &str) {
        if let Some(pools) = self.user_ephemeral_pools.get_mut(user) {
            pools.remove(pool);
            if pools.is_empty() {
                self.user_ephemeral_pools.remove(user);
            }
        }
    }

    /// Remove `pool` if it is an ephemeral pool left without operations
    /// and children. Returns true if it was removed.
    fn drop_if_unused(&mut self, pool: &str) -> bool {
        let Some(p) = self.pools.get(pool) else {
            return false;
        };
        let unused = p.is_ephemeral
            && !self.operations.values().any(|o| o.pool == pool)
            && self.children(pool).is_empty();
        if !unused {
            return false;
        }
        let user = p.user_name.clone();
        self.pools.remove(pool);
        self.order.retain(|n| n != pool);
        if let Some(user) = user {
            self.forget_user_pool(&user, pool);
        }
        info!(tree = %self.name, pool, "ephemeral pool removed");
        true
    }

    /// Drop every ephemeral pool that no operation uses.
    pub fn prune_ephemeral_pools(&mut self) -> Vec<String> {
        let mut candidates: Vec<String> = self
            .pools()
            .filter(|p| p.is_ephemeral)
            .map(|p| p.name.clone())
            .collect();
        // Children were created after their parents.
        candidates.reverse();
        candidates
            .into_iter()
            .filter(|name| self.drop_if_unused(name))
            .collect()
    }

    /// The closest pool on the operation's path (or the tree) whose running
    /// operation limit is reached, or `None` if the operation may run.
    pub fn running_blocker(&self, id: OperationId) -> PoolResult<Option<String>> {
        let op = self
            .operations
            .get(&id)
            .ok_or(PoolError::NoSuchOperation(id))?;
        if op.running {
            return Ok(None);
        }
        for pool in self.path_to_root(&op.pool) {
            if self.subtree_count(&pool.name, true) >= self.running_limit(pool) {
                return Ok(Some(pool.name.clone()));
            }
        }
        Ok(None)
    }

    pub fn set_running(&mut self, id: OperationId, running: bool) -> PoolResult<()> {
        let op = self
            .operations
            .get_mut(&id)
            .ok_or(PoolError::NoSuchOperation(id))?;
        op.running = running;
        Ok(())
    }

    /// Remove an operation. Returns the ephemeral pool that went away with
    /// it, if any.
    pub fn unregister_operation(&mut self, id: OperationId) -> PoolResult<Option<String>> {
        let op = self
            .operations
            .remove(&id)
            .ok_or(PoolError::NoSuchOperation(id))?;
        Ok(self.drop_if_unused(&op.pool).then_some(op.pool))
    }

    /// Move an operation to another pool, keeping its running flag and
    /// registration order. The old placement is kept on failure.
    pub fn reassign_operation(
        &mut self,
        id: OperationId,
        requested: &str,
        users: &UserDirectory,
        now: Millis,
    ) -> PoolResult<String> {
        let old = self
            .operations
            .remove(&id)
            .ok_or(PoolError::NoSuchOperation(id))?;
        match self.register_operation(id, &old.user, Some(requested), users, now) {
            Ok(pool) => {
                if let Some(op) = self.operations.get_mut(&id) {
                    op.running = old.running;
                    op.seq = old.seq;
                }
                self.drop_if_unused(&old.pool);
                info!(tree = %self.name, %id, from = %old.pool, to = %pool, "operation moved");
                Ok(pool)
            }
            Err(e) => {
                self.operations.insert(id, old);
                Err(e)
            }
        }
    }

    pub fn user_ephemeral_pools(&self, user: &str) -> Vec<&str> {
        self.user_ephemeral_pools
            .get(user)
            .map(|pools| pools.iter().map(String::as_str).collect())
            .unwrap_or_default()
    }

    /// Resource limits of the pool and its ancestors, closest first.
    pub fn limits_on_path(&self, pool: &str) -> Vec<(&str, &ResourceVector)> {
        self.path_to_root(pool)
            .into_iter()
            .filter_map(|p| p.config.resource_limits.as_ref().map(|l| (p.name.as_str(), l)))
            .collect()
    }

    // ── Persistence ────────────────────────────────────────────

    /// Pool state and the ephemeral pool maps. Operation segments are
    /// filled in by the scheduler.
    pub fn snapshot(&self, now: Millis) -> FairShareSnapshot {
        let pools = self
            .pools()
            .map(|p| (p.name.clone(), p.state.clone()))
            .collect();
        let ephemeral_pools = self
            .pools()
            .filter(|p| p.is_ephemeral)
            .filter_map(|p| {
                Some((
                    p.name.clone(),
                    EphemeralPoolRecord {
                        user: p.user_name.clone()?,
                        parent: p.parent.clone()?,
                    },
                ))
            })
            .collect();
        FairShareSnapshot {
            tree: self.name.clone(),
            taken_at: now,
            pools,
            ephemeral_pools,
            user_ephemeral_pools: self.user_ephemeral_pools.clone(),
            operation_segments: BTreeMap::new(),
        }
    }

    /// Recreate ephemeral pools and restore accumulated pool state.
    ///
    /// Pools that no longer exist in the tree (and whose parent is gone)
    /// are skipped.
    pub fn restore(&mut self, snapshot: &FairShareSnapshot, now: Millis) {
        let user_owned: BTreeSet<&str> = snapshot
            .user_ephemeral_pools
            .values()
            .flatten()
            .map(String::as_str)
            .collect();
        let mut pending: Vec<(&str, &EphemeralPoolRecord)> = snapshot
            .ephemeral_pools
            .iter()
            .map(|(name, record)| (name.as_str(), record))
            .collect();
        // Parents may themselves be ephemeral; retry until no progress.
        loop {
            let before = pending.len();
            pending.retain(|&(name, record)| {
                if self.pools.contains_key(name) {
                    return false;
                }
                if !self.pools.contains_key(&record.parent) {
                    return true;
                }
                let subpool = !user_owned.contains(name);
                self.create_ephemeral(name, &record.parent, &record.user, subpool, now);
                false
            });
            if pending.is_empty() || pending.len() == before {
                break;
            }
        }
        for (name, state) in &snapshot.pools {
            if let Some(pool) = self.pools.get_mut(name) {
                pool.state = state.clone();
            }
        }
        info!(
            tree = %self.name,
            pools = snapshot.pools.len(),
            ephemeral = snapshot.ephemeral_pools.len(),
            "pool tree state restored"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tessera_core::Acl;

    fn users() -> UserDirectory {
        let mut users = UserDirectory::default();
        for name in ["alice", "bob"] {
            users.add_user(name);
        }
        users
    }

    #[test]
    fn unknown_pool_becomes_ephemeral_and_leaves_with_last_operation() {
        let mut tree = PoolTree::new("default", PoolTreeConfig::default());
        let users = users();
        let op = OperationId::new();
        let pool = tree.register_operation(op, "alice", None, &users, 0).unwrap();
        assert_eq!(pool, "alice");
        assert!(tree.pool("alice").unwrap().is_ephemeral);
        assert_eq!(tree.user_ephemeral_pools("alice"), vec!["alice"]);

        assert_eq!(tree.unregister_operation(op).unwrap(), Some("alice".to_string()));
        assert!(!tree.contains("alice"));
        assert!(tree.user_ephemeral_pools("alice").is_empty());
    }

    #[test]
    fn explicit_pools_survive_their_last_operation() {
        let mut tree = PoolTree::new("default", PoolTreeConfig::default());
        tree.create_pool("research", None, PoolConfig::default(), 0).unwrap();
        let op = OperationId::new();
        tree.register_operation(op, "alice", Some("research"), &users(), 0)
            .unwrap();
        assert_eq!(tree.unregister_operation(op).unwrap(), None);
        assert!(tree.contains("research"));
    }

    #[test]
    fn move_rejects_cycles() {
        let mut tree = PoolTree::new("default", PoolTreeConfig::default());
        tree.create_pool("a", None, PoolConfig::default(), 0).unwrap();
        tree.create_pool("b", Some("a"), PoolConfig::default(), 0).unwrap();
        assert!(tree.move_pool("a", "b").is_err());
        assert!(tree.move_pool("a", "a").is_err());
        tree.move_pool("b", ROOT_POOL_NAME).unwrap();
        assert_eq!(tree.children(ROOT_POOL_NAME).len(), 2);
    }

    #[test]
    fn acl_is_inherited_from_ancestors() {
        let mut tree = PoolTree::new("default", PoolTreeConfig::default());
        let closed = PoolConfig::default().with_acl(Acl::new(vec![
            tessera_core::Ace::allow(&["alice"], &[Permission::Use]),
            tessera_core::Ace::deny(&["bob"], &[Permission::Use]),
        ]));
        tree.create_pool("team", None, closed, 0).unwrap();
        tree.create_pool("batch", Some("team"), PoolConfig::default(), 0).unwrap();
        let users = users();
        tree.check_permission("batch", "alice", &users, Permission::Use).unwrap();
        let err = tree
            .check_permission("batch", "bob", &users, Permission::Use)
            .unwrap_err();
        assert_eq!(err.kind(), tessera_core::ErrorKind::AccessDenied);
    }

    #[test]
    fn running_limit_is_checked_at_every_ancestor() {
        let mut tree = PoolTree::new("default", PoolTreeConfig::default());
        tree.create_pool("parent", None, PoolConfig::default().with_max_running_operation_count(1), 0)
            .unwrap();
        tree.create_pool("left", Some("parent"), PoolConfig::default(), 0).unwrap();
        tree.create_pool("right", Some("parent"), PoolConfig::default(), 0).unwrap();
        let users = users();
        let first = OperationId::new();
        let second = OperationId::new();
        tree.register_operation(first, "alice", Some("left"), &users, 0).unwrap();
        tree.register_operation(second, "alice", Some("right"), &users, 0).unwrap();

        assert_eq!(tree.running_blocker(first).unwrap(), None);
        tree.set_running(first, true).unwrap();
        assert_eq!(tree.running_blocker(second).unwrap(), Some("parent".to_string()));
        tree.unregister_operation(first).unwrap();
        assert_eq!(tree.running_blocker(second).unwrap(), None);
    }
}
