//! Access control lists for bundles, pools and pool trees.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::error::{CoreError, CoreResult};

/// Superuser that bypasses every ACL check.
pub const ROOT_USER: &str = "root";

/// Group every user implicitly belongs to.
pub const EVERYONE_GROUP: &str = "everyone";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Permission {
    Read,
    Write,
    Use,
    Create,
    Remove,
    Administer,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AceAction {
    Allow,
    Deny,
}

/// A single access control entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ace {
    pub action: AceAction,
    pub subjects: Vec<String>,
    pub permissions: Vec<Permission>,
}

impl Ace {
    pub fn allow(subjects: &[&str], permissions: &[Permission]) -> Self {
        Self {
            action: AceAction::Allow,
            subjects: subjects.iter().map(|s| s.to_string()).collect(),
            permissions: permissions.to_vec(),
        }
    }

    pub fn deny(subjects: &[&str], permissions: &[Permission]) -> Self {
        Self {
            action: AceAction::Deny,
            ..Self::allow(subjects, permissions)
        }
    }
}

/// Ordered list of entries. Deny entries win over allow entries.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Acl {
    pub entries: Vec<Ace>,
}

impl Acl {
    pub fn new(entries: Vec<Ace>) -> Self {
        Self { entries }
    }

    /// ACL granting `permissions` to everybody.
    pub fn open(permissions: &[Permission]) -> Self {
        Self::new(vec![Ace::allow(&[EVERYONE_GROUP], permissions)])
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Evaluate this ACL alone.
    ///
    /// `subjects` is the user followed by the groups it belongs to. Returns
    /// `Some(false)` on an explicit deny, `Some(true)` on an allow, and
    /// `None` when no entry mentions any of the subjects for `permission`,
    /// letting the caller fall back to an inherited ACL.
    pub fn decide(&self, subjects: &[&str], permission: Permission) -> Option<bool> {
        let mut allowed = None;
        for ace in &self.entries {
            if !ace.permissions.contains(&permission) {
                continue;
            }
            let hit = ace
                .subjects
                .iter()
                .any(|s| s == EVERYONE_GROUP || subjects.contains(&s.as_str()));
            if !hit {
                continue;
            }
            match ace.action {
                AceAction::Deny => return Some(false),
                AceAction::Allow => allowed = Some(true),
            }
        }
        allowed
    }

    /// Check `permission` for `subjects` with no inheritance.
    pub fn check(&self, subjects: &[&str], permission: Permission) -> bool {
        if subjects.first() == Some(&ROOT_USER) {
            return true;
        }
        self.decide(subjects, permission).unwrap_or(false)
    }

    /// Fail with `UnknownSubject` if any entry names a subject `known` rejects.
    pub fn validate(&self, known: impl Fn(&str) -> bool) -> CoreResult<()> {
        for ace in &self.entries {
            for subject in &ace.subjects {
                if subject != EVERYONE_GROUP && !known(subject) {
                    return Err(CoreError::UnknownSubject(subject.clone()));
                }
            }
        }
        Ok(())
    }
}

/// Known users and the groups they belong to.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserDirectory {
    users: BTreeMap<String, BTreeSet<String>>,
    groups: BTreeSet<String>,
}

impl Default for UserDirectory {
    fn default() -> Self {
        let mut dir = Self {
            users: BTreeMap::new(),
            groups: BTreeSet::new(),
        };
        dir.groups.insert(EVERYONE_GROUP.to_string());
        dir.groups.insert("users".to_string());
        dir.groups.insert("superusers".to_string());
        dir.users.insert(
            ROOT_USER.to_string(),
            ["superusers".to_string()].into_iter().collect(),
        );
        dir
    }
}

impl UserDirectory {
    /// Add a user; every user is a member of `users`.
    pub fn add_user(&mut self, name: &str) {
        self.users
            .entry(name.to_string())
            .or_default()
            .insert("users".to_string());
    }

    pub fn add_group(&mut self, name: &str) {
        self.groups.insert(name.to_string());
    }

    /// Returns false if the user or group is unknown.
    pub fn add_member(&mut self, group: &str, user: &str) -> bool {
        if !self.groups.contains(group) {
            return false;
        }
        match self.users.get_mut(user) {
            Some(groups) => {
                groups.insert(group.to_string());
                true
            }
            None => false,
        }
    }

    pub fn has_user(&self, name: &str) -> bool {
        self.users.contains_key(name)
    }

    /// Users and groups are both valid ACL subjects.
    pub fn is_known_subject(&self, name: &str) -> bool {
        self.users.contains_key(name) || self.groups.contains(name)
    }

    /// The user followed by its groups, as expected by [`Acl::check`].
    pub fn subjects(&self, user: &str) -> Vec<String> {
        let mut subjects = vec![user.to_string()];
        if let Some(groups) = self.users.get(user) {
            subjects.extend(groups.iter().cloned());
        }
        subjects
    }

    /// Convenience wrapper: check `acl` for `user` with group expansion.
    pub fn check(&self, acl: &Acl, user: &str, permission: Permission) -> bool {
        let subjects = self.subjects(user);
        let refs: Vec<&str> = subjects.iter().map(String::as_str).collect();
        acl.check(&refs, permission)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deny_overrides_allow() {
        let acl = Acl::new(vec![
            Ace::allow(&["users"], &[Permission::Use]),
            Ace::deny(&["mallory"], &[Permission::Use]),
        ]);
        assert!(acl.check(&["alice", "users"], Permission::Use));
        assert!(!acl.check(&["mallory", "users"], Permission::Use));
    }

    #[test]
    fn unmatched_permission_is_undecided() {
        let acl = Acl::open(&[Permission::Read]);
        assert_eq!(acl.decide(&["alice"], Permission::Use), None);
        assert_eq!(acl.decide(&["alice"], Permission::Read), Some(true));
    }

    #[test]
    fn root_bypasses_checks() {
        assert!(Acl::default().check(&[ROOT_USER], Permission::Administer));
        assert!(!Acl::default().check(&["alice"], Permission::Administer));
    }

    #[test]
    fn directory_expands_groups() {
        let mut dir = UserDirectory::default();
        dir.add_user("alice");
        dir.add_group("admins");
        assert!(dir.add_member("admins", "alice"));
        assert!(!dir.add_member("ghosts", "alice"));
        let acl = Acl::new(vec![Ace::allow(&["admins"], &[Permission::Administer])]);
        assert!(dir.check(&acl, "alice", Permission::Administer));
        assert!(!dir.check(&acl, "bob", Permission::Administer));
        assert!(dir.check(&acl, ROOT_USER, Permission::Administer));
        assert!(acl.validate(|s| dir.is_known_subject(s)).is_ok());
    }

    #[test]
    fn validate_rejects_unknown_subjects() {
        let acl = Acl::new(vec![Ace::allow(&["ghost"], &[Permission::Use])]);
        assert!(acl.validate(|s| s == "alice").is_err());
        assert!(Acl::open(&[Permission::Use]).validate(|_| false).is_ok());
    }
}
