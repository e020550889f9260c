//! The set of pool trees a scheduler serves.

use std::collections::BTreeMap;

use tracing::info;

use tessera_core::{PoolTreeConfig, TesseraConfig};

use crate::error::{PoolError, PoolResult};
use crate::tree::PoolTree;

pub struct PoolTrees {
    trees: BTreeMap<String, PoolTree>,
    default_tree: String,
}

impl PoolTrees {
    /// One tree per entry of `pool_trees`.
    pub fn from_config(config: &TesseraConfig) -> Self {
        let trees = config
            .pool_trees
            .iter()
            .map(|(name, tree)| (name.clone(), PoolTree::new(name, tree.clone())))
            .collect();
        Self {
            trees,
            default_tree: config.default_pool_tree.clone(),
        }
    }

    /// Push new tree configs into existing trees and create missing ones.
    /// Trees absent from the config are kept; they go away through
    /// [`remove_tree`](Self::remove_tree). Returns the names of new trees.
    pub fn apply_config(&mut self, config: &TesseraConfig) -> Vec<String> {
        let mut created = Vec::new();
        for (name, tree_config) in &config.pool_trees {
            match self.trees.get_mut(name) {
                Some(tree) => tree.set_config(tree_config.clone()),
                None => {
                    self.trees
                        .insert(name.clone(), PoolTree::new(name, tree_config.clone()));
                    created.push(name.clone());
                }
            }
        }
        self.default_tree = config.default_pool_tree.clone();
        created
    }

    pub fn default_tree(&self) -> &str {
        &self.default_tree
    }

    pub fn tree(&self, name: &str) -> PoolResult<&PoolTree> {
        self.trees
            .get(name)
            .ok_or_else(|| PoolError::NoSuchTree(name.to_string()))
    }

    pub fn tree_mut(&mut self, name: &str) -> PoolResult<&mut PoolTree> {
        self.trees
            .get_mut(name)
            .ok_or_else(|| PoolError::NoSuchTree(name.to_string()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.trees.contains_key(name)
    }

    pub fn names(&self) -> Vec<String> {
        self.trees.keys().cloned().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &PoolTree> {
        self.trees.values()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut PoolTree> {
        self.trees.values_mut()
    }

    pub fn create_tree(&mut self, name: &str, config: PoolTreeConfig) -> PoolResult<()> {
        if self.trees.contains_key(name) {
            return Err(PoolError::TreeExists(name.to_string()));
        }
        self.trees.insert(name.to_string(), PoolTree::new(name, config));
        info!(tree = name, "pool tree created");
        Ok(())
    }

    pub fn remove_tree(&mut self, name: &str) -> PoolResult<()> {
        let tree = self.tree(name)?;
        if name == self.default_tree {
            return Err(PoolError::InvalidState(format!(
                "pool tree {name:?} is the default tree"
            )));
        }
        if tree.operation_count() > 0 {
            return Err(PoolError::InvalidState(format!(
                "pool tree {name:?} still has operations"
            )));
        }
        self.trees.remove(name);
        info!(tree = name, "pool tree removed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_creates_trees_and_keeps_unlisted_ones() {
        let mut config = TesseraConfig::default();
        let mut trees = PoolTrees::from_config(&config);
        assert_eq!(trees.names(), vec!["default"]);

        trees.create_tree("gpu", PoolTreeConfig::default()).unwrap();
        config.pool_trees.insert("cloud".into(), PoolTreeConfig::default());
        assert_eq!(trees.apply_config(&config), vec!["cloud"]);
        assert_eq!(trees.names(), vec!["cloud", "default", "gpu"]);

        assert!(trees.remove_tree("default").is_err());
        trees.remove_tree("gpu").unwrap();
        assert!(!trees.contains("gpu"));
    }
}
