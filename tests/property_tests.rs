//! Property-based tests for the authorization engine using proptest.
//!
//! These verify the structural invariants: the role graph stays acyclic
//! under arbitrary reparenting sequences, inheritance only ever widens a
//! child's permission set (minus explicit denials), deny always wins
//! across role combinations, and scope containment is a partial order.

use std::collections::BTreeSet;
use std::sync::Arc;

use proptest::prelude::*;

use authz_core::{
    invalidation_bus, Action, AssignmentRequest, AuthzConfig, AuthzEngine, InMemoryAuditStorage,
    NewRole, Outcome, PermissionEntry, Polarity, RequestContext, RoleGraph, RoleUpdate, Scope,
    ScopeType,
};
use chrono::{Duration as ChronoDuration, Utc};

fn action_strategy() -> impl Strategy<Value = Action> {
    prop_oneof![
        Just(Action::Create),
        Just(Action::Read),
        Just(Action::Write),
        Just(Action::Update),
        Just(Action::Delete),
        Just(Action::Approve),
        Just(Action::Assign),
        Just(Action::Export),
        Just(Action::Close),
    ]
}

fn resource_strategy() -> impl Strategy<Value = String> {
    prop_oneof![
        Just("tickets".to_string()),
        Just("documents".to_string()),
        Just("reports".to_string()),
    ]
}

fn scope_type_strategy() -> impl Strategy<Value = ScopeType> {
    prop_oneof![
        Just(ScopeType::Organization),
        Just(ScopeType::Department),
        Just(ScopeType::Project),
        Just(ScopeType::Personal),
    ]
}

fn scope_strategy() -> impl Strategy<Value = Scope> {
    (
        scope_type_strategy(),
        prop::collection::btree_set("[a-z0-9]{1,4}", 1..4),
    )
        .prop_map(|(scope_type, values)| {
            Scope::new(scope_type, values).expect("generated identifiers are non-empty")
        })
}

fn entry_strategy() -> impl Strategy<Value = PermissionEntry> {
    (
        resource_strategy(),
        prop::collection::btree_set(action_strategy(), 1..4),
        prop::bool::ANY,
    )
        .prop_map(|(resource, actions, deny)| {
            if deny {
                PermissionEntry::deny(resource, actions)
            } else {
                PermissionEntry::allow(resource, actions)
            }
        })
}

fn root_role(id: &str, permissions: Vec<PermissionEntry>) -> NewRole {
    NewRole {
        id: id.to_string(),
        name: id.to_string(),
        description: String::new(),
        parent_id: None,
        permissions,
        contextual_rules: vec![],
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    // No sequence of reparent attempts ever produces a cyclic graph:
    // every accepted edge keeps each role absent from its own ancestor
    // chain, and rejected edges leave the graph untouched.
    #[test]
    fn role_graph_stays_acyclic_under_random_reparenting(
        edges in prop::collection::vec((0usize..8, 0usize..8), 1..20)
    ) {
        let rt = tokio::runtime::Runtime::new().unwrap();
        rt.block_on(async {
            let graph = RoleGraph::new(32, invalidation_bus());
            for i in 0..8 {
                graph.create_role(root_role(&format!("r{i}"), vec![])).await.unwrap();
            }

            for (child, parent) in edges {
                let _ = graph
                    .update_role(
                        &format!("r{child}"),
                        RoleUpdate {
                            parent_id: Some(Some(format!("r{parent}"))),
                            ..Default::default()
                        },
                    )
                    .await;
            }

            for i in 0..8 {
                let id = format!("r{i}");
                let chain = graph.chain_ids(&id).await.unwrap();
                // The chain terminates and revisits no role.
                let unique: BTreeSet<_> = chain.iter().collect();
                prop_assert_eq!(unique.len(), chain.len());
                // No role is its own ancestor.
                prop_assert!(!chain.iter().skip(1).any(|ancestor| ancestor == &id));
            }
            Ok(())
        })?;
    }

    // A child's effective permission set contains everything its parent
    // declares; inheritance only widens.
    #[test]
    fn child_inherits_every_parent_entry(
        parent_entries in prop::collection::vec(entry_strategy(), 0..5),
        child_entries in prop::collection::vec(entry_strategy(), 0..5),
    ) {
        let rt = tokio::runtime::Runtime::new().unwrap();
        rt.block_on(async {
            let graph = RoleGraph::new(10, invalidation_bus());
            graph.create_role(root_role("parent", parent_entries.clone())).await.unwrap();
            let mut child = root_role("child", child_entries);
            child.parent_id = Some("parent".to_string());
            graph.create_role(child).await.unwrap();

            let effective = graph.effective_permissions("child").await.unwrap();
            for entry in &parent_entries {
                prop_assert!(
                    effective.iter().any(|e| &e.entry == entry),
                    "parent entry missing from child expansion: {:?}",
                    entry
                );
            }
            Ok(())
        })?;
    }

    // Deny-wins across arbitrary role combinations: if any held role
    // explicitly denies the pair, the decision is Deny; with no deny and
    // at least one covering allow, it is Allow.
    #[test]
    fn deny_always_beats_allow_across_roles(
        entries in prop::collection::vec(entry_strategy(), 1..6),
        resource in resource_strategy(),
        action in action_strategy(),
    ) {
        let rt = tokio::runtime::Runtime::new().unwrap();
        rt.block_on(async {
            let engine = AuthzEngine::new(
                AuthzConfig::default(),
                Arc::new(InMemoryAuditStorage::new()),
            );
            for (i, entry) in entries.iter().enumerate() {
                let id = format!("r{i}");
                engine
                    .roles()
                    .create_role(root_role(&id, vec![entry.clone()]))
                    .await
                    .unwrap();
                engine
                    .assignments()
                    .assign(AssignmentRequest {
                        user_id: "u".to_string(),
                        role_id: id,
                        scope: Scope::organization("acme"),
                        valid_from: Utc::now() - ChronoDuration::hours(1),
                        valid_until: None,
                        created_by: "admin".to_string(),
                    })
                    .await
                    .unwrap();
            }

            let decision = engine
                .resolver()
                .check_permission(
                    "u",
                    &resource,
                    action,
                    &Scope::department("08"),
                    &RequestContext::default(),
                )
                .await;

            let any_deny = entries
                .iter()
                .any(|e| e.polarity == Polarity::Deny && e.covers(&resource, action));
            let any_allow = entries
                .iter()
                .any(|e| e.polarity == Polarity::Allow && e.covers(&resource, action));

            if any_deny {
                prop_assert_eq!(decision.outcome, Outcome::Deny);
            } else if any_allow {
                prop_assert_eq!(decision.outcome, Outcome::Allow);
            } else {
                prop_assert_eq!(decision.outcome, Outcome::Deny);
                prop_assert_eq!(decision.reason.as_str(), "no matching grant");
            }
            engine.shutdown().await;
            Ok(())
        })?;
    }

    // Scope containment is reflexive and only ever crosses granularity
    // downward.
    #[test]
    fn scope_containment_is_a_partial_order(a in scope_strategy(), b in scope_strategy()) {
        prop_assert!(a.contains(&a));
        if a.contains(&b) && b.contains(&a) {
            prop_assert_eq!(&a, &b);
        }
        if a.contains(&b) && a.scope_type != b.scope_type {
            prop_assert!(a.scope_type < b.scope_type);
        }
    }
}
