use proptest::prelude::*;

use tessera_core::{ErrorKind, OperationId, PoolTreeConfig, ResourceVector, UserDirectory, ROOT_POOL_NAME};
use tessera_pools::{EphemeralSubpoolConfig, PoolConfig, PoolKind, PoolTree, SchedulingMode};

fn users() -> UserDirectory {
    let mut users = UserDirectory::default();
    for name in ["alice", "bob", "carol"] {
        users.add_user(name);
    }
    users
}

fn tree() -> PoolTree {
    PoolTree::new("default", PoolTreeConfig::default())
}

#[test]
fn promotion_keeps_state_and_removal_clears_it() {
    let mut tree = tree();
    let users = users();
    let op = OperationId::new();
    tree.register_operation(op, "alice", Some("adhoc"), &users, 0).unwrap();
    {
        let state = tree.state_mut("adhoc").unwrap();
        state.historic_usage = ResourceVector::cpu(2.0);
        state.integral_volume = ResourceVector::cpu(120.0);
    }

    assert!(tree.create_pool("adhoc", None, PoolConfig::default().with_weight(3.0), 10).unwrap());
    let pool = tree.pool("adhoc").unwrap();
    assert!(!pool.is_ephemeral);
    assert_eq!(pool.weight(), 3.0);
    assert_eq!(pool.state.integral_volume, ResourceVector::cpu(120.0));
    assert_eq!(pool.state.historic_usage, ResourceVector::cpu(2.0));
    assert!(tree.user_ephemeral_pools("alice").is_empty());

    // Still used by `op`: the pool is demoted with fresh state.
    tree.remove_pool("adhoc").unwrap();
    let pool = tree.pool("adhoc").unwrap();
    assert!(pool.is_ephemeral);
    assert!(pool.state.integral_volume.is_zero());
    assert!(pool.state.historic_usage.is_zero());
    assert_eq!(tree.user_ephemeral_pools("alice"), vec!["adhoc"]);

    tree.unregister_operation(op).unwrap();
    assert!(!tree.contains("adhoc"));
}

#[test]
fn ephemeral_pool_limit_per_user() {
    let mut tree = tree();
    let users = users();
    tree.register_operation(OperationId::new(), "alice", Some("one"), &users, 0)
        .unwrap();
    let err = tree
        .register_operation(OperationId::new(), "alice", Some("two"), &users, 0)
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Configuration);
    assert!(!tree.contains("two"));

    // The existing ephemeral pool still takes more operations.
    tree.register_operation(OperationId::new(), "alice", Some("one"), &users, 0)
        .unwrap();
    // Other users have their own limit.
    tree.register_operation(OperationId::new(), "bob", Some("two"), &users, 0)
        .unwrap();
}

#[test]
fn ephemeral_pools_go_under_the_user_default_parent() {
    let mut tree = tree();
    let users = users();
    tree.create_pool("research", None, PoolConfig::default(), 0).unwrap();
    tree.set_user_default_parent("carol", Some("research")).unwrap();

    tree.register_operation(OperationId::new(), "carol", None, &users, 0)
        .unwrap();
    assert_eq!(tree.pool("carol").unwrap().parent.as_deref(), Some("research"));

    tree.register_operation(OperationId::new(), "bob", None, &users, 0)
        .unwrap();
    assert_eq!(tree.pool("bob").unwrap().parent.as_deref(), Some(ROOT_POOL_NAME));
}

#[test]
fn missing_default_parent_is_a_configuration_error() {
    let config = PoolTreeConfig {
        default_parent_pool: "nowhere".into(),
        ..PoolTreeConfig::default()
    };
    let mut tree = PoolTree::new("default", config);
    let err = tree
        .register_operation(OperationId::new(), "alice", None, &users(), 0)
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Configuration);
}

#[test]
fn subpools_are_created_per_user() {
    let mut tree = tree();
    let users = users();
    let config = PoolConfig {
        create_ephemeral_subpools: true,
        ephemeral_subpool_config: Some(EphemeralSubpoolConfig {
            mode: SchedulingMode::Fifo,
            max_running_operation_count: Some(1),
            ..EphemeralSubpoolConfig::default()
        }),
        ..PoolConfig::default()
    };
    tree.create_pool("shared", None, config, 0).unwrap();

    let a = OperationId::new();
    let b = OperationId::new();
    assert_eq!(tree.register_operation(a, "alice", Some("shared"), &users, 0).unwrap(), "shared$alice");
    assert_eq!(tree.register_operation(b, "bob", Some("shared"), &users, 0).unwrap(), "shared$bob");
    let sub = tree.pool("shared$alice").unwrap();
    assert_eq!(sub.kind, PoolKind::FifoInner);
    assert_eq!(sub.config.max_running_operation_count, Some(1));
    // Subpools do not count against the user's ephemeral pool limit.
    tree.register_operation(OperationId::new(), "alice", Some("own"), &users, 0)
        .unwrap();

    tree.unregister_operation(a).unwrap();
    assert!(!tree.contains("shared$alice"));
    assert!(tree.contains("shared$bob"));
}

#[test]
fn forbid_immediate_operations_allows_children() {
    let mut tree = tree();
    let users = users();
    let parent = PoolConfig {
        forbid_immediate_operations: true,
        ..PoolConfig::default()
    };
    tree.create_pool("org", None, parent, 0).unwrap();
    tree.create_pool("team", Some("org"), PoolConfig::default(), 0).unwrap();

    let err = tree
        .register_operation(OperationId::new(), "alice", Some("org"), &users, 0)
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Configuration);
    tree.register_operation(OperationId::new(), "alice", Some("team"), &users, 0)
        .unwrap();
}

#[test]
fn invalid_pool_names_are_rejected_on_submit() {
    let mut tree = tree();
    let err = tree
        .register_operation(OperationId::new(), "alice", Some("bad$name"), &users(), 0)
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Configuration);
}

#[test]
fn max_operation_count_is_a_hard_limit() {
    let mut tree = tree();
    let users = users();
    tree.create_pool("small", None, PoolConfig::default().with_max_operation_count(2), 0)
        .unwrap();
    tree.create_pool("leaf", Some("small"), PoolConfig::default(), 0).unwrap();
    tree.register_operation(OperationId::new(), "alice", Some("small"), &users, 0)
        .unwrap();
    tree.register_operation(OperationId::new(), "alice", Some("leaf"), &users, 0)
        .unwrap();
    let err = tree
        .register_operation(OperationId::new(), "alice", Some("leaf"), &users, 0)
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ResourceLimitExceeded);
}

#[test]
fn rename_and_move_keep_operations_and_state() {
    let mut tree = tree();
    let users = users();
    tree.create_pool("a", None, PoolConfig::default(), 0).unwrap();
    tree.create_pool("b", None, PoolConfig::default(), 0).unwrap();
    tree.create_pool("leaf", Some("a"), PoolConfig::default(), 0).unwrap();
    let op = OperationId::new();
    tree.register_operation(op, "alice", Some("leaf"), &users, 0).unwrap();
    tree.state_mut("leaf").unwrap().integral_volume = ResourceVector::cpu(42.0);

    tree.move_pool("leaf", "b").unwrap();
    tree.rename_pool("leaf", "renamed").unwrap();

    assert_eq!(tree.operation(op).unwrap().pool, "renamed");
    let pool = tree.pool("renamed").unwrap();
    assert_eq!(pool.parent.as_deref(), Some("b"));
    assert_eq!(pool.state.integral_volume, ResourceVector::cpu(42.0));
    assert!(tree.rename_pool("renamed", "a").is_err());
}

#[test]
fn reassign_operation_moves_between_pools() {
    let mut tree = tree();
    let users = users();
    tree.create_pool("first", None, PoolConfig::default(), 0).unwrap();
    tree.create_pool("second", None, PoolConfig::default(), 0).unwrap();
    let op = OperationId::new();
    tree.register_operation(op, "alice", Some("first"), &users, 0).unwrap();
    tree.set_running(op, true).unwrap();

    tree.reassign_operation(op, "second", &users, 0).unwrap();
    let placed = tree.operation(op).unwrap();
    assert_eq!(placed.pool, "second");
    assert!(placed.running);

    assert!(tree.reassign_operation(op, "bad|name", &users, 0).is_err());
    assert_eq!(tree.operation(op).unwrap().pool, "second");
}

#[test]
fn snapshot_restores_ephemeral_pools_and_state() {
    let mut tree = tree();
    let users = users();
    tree.create_pool("explicit", None, PoolConfig::default(), 0).unwrap();
    tree.register_operation(OperationId::new(), "alice", Some("scratch"), &users, 0)
        .unwrap();
    tree.state_mut("explicit").unwrap().historic_usage = ResourceVector::cpu(1.5);
    tree.state_mut("scratch").unwrap().integral_volume = ResourceVector::cpu(7.0);
    let snapshot = tree.snapshot(1_000);

    let mut restored = PoolTree::new("default", PoolTreeConfig::default());
    restored
        .create_pool("explicit", None, PoolConfig::default(), 0)
        .unwrap();
    restored.restore(&snapshot, 2_000);

    assert_eq!(restored.pool("explicit").unwrap().state.historic_usage, ResourceVector::cpu(1.5));
    let scratch = restored.pool("scratch").unwrap();
    assert!(scratch.is_ephemeral);
    assert_eq!(scratch.user_name.as_deref(), Some("alice"));
    assert_eq!(scratch.state.integral_volume, ResourceVector::cpu(7.0));
    assert_eq!(restored.user_ephemeral_pools("alice"), vec!["scratch"]);

    // Nothing was re-registered: the restored ephemeral pool is unused.
    assert_eq!(restored.prune_ephemeral_pools(), vec!["scratch".to_string()]);
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn ephemeral_pools_per_user_never_exceed_limit(
        max in 1usize..4,
        submissions in prop::collection::vec((0usize..3, 0usize..6, any::<bool>()), 1..40),
    ) {
        let config = PoolTreeConfig {
            max_ephemeral_pools_per_user: max,
            ..PoolTreeConfig::default()
        };
        let mut tree = PoolTree::new("default", config);
        let users = users();
        let names = ["alice", "bob", "carol"];
        let mut live: Vec<OperationId> = Vec::new();

        for (user, pool, finish_one) in submissions {
            let pool_name = format!("p{pool}");
            let op = OperationId::new();
            match tree.register_operation(op, names[user], Some(&pool_name), &users, 0) {
                Ok(_) => live.push(op),
                Err(e) => prop_assert!(matches!(
                    e.kind(),
                    ErrorKind::Configuration | ErrorKind::AccessDenied
                )),
            }
            if finish_one && !live.is_empty() {
                let done = live.remove(0);
                tree.unregister_operation(done).unwrap();
            }
            for name in names {
                prop_assert!(tree.user_ephemeral_pools(name).len() <= max);
            }
        }
    }
}
