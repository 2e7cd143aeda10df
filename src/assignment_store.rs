//! User→role bindings with scope and validity windows.
//!
//! The store keeps a dual index (by user for resolution, by role for
//! impact analysis before archiving). Every mutation publishes an
//! invalidation event consumed by the decision cache.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use tracing::{debug, info};
use uuid::Uuid;

use crate::errors::AuthzError;
use crate::events::{self, InvalidationEvent, InvalidationSender};
use crate::model::{Assignment, RoleId, RoleStatus, Scope, UserId};
use crate::role_graph::RoleGraph;

/// Inputs for creating an assignment.
#[derive(Debug, Clone)]
pub struct AssignmentRequest {
    pub user_id: UserId,
    pub role_id: RoleId,
    pub scope: Scope,
    pub valid_from: DateTime<Utc>,
    /// `None` means unbounded.
    pub valid_until: Option<DateTime<Utc>>,
    pub created_by: UserId,
}

/// Read side of the store as the resolver consumes it. `AssignmentStore`
/// is the production implementation; tests substitute wrappers to control
/// lookup latency and failure.
#[async_trait]
pub trait AssignmentSource: Send + Sync {
    /// Assignments whose validity window covers `now`.
    async fn active_assignments_for(&self, user_id: &str, now: DateTime<Utc>)
        -> Vec<Arc<Assignment>>;
    /// All of a user's assignments regardless of validity.
    async fn assignments_for_user(&self, user_id: &str) -> Vec<Arc<Assignment>>;
}

#[derive(Default)]
struct AssignmentIndex {
    by_id: HashMap<Uuid, Arc<Assignment>>,
    by_user: HashMap<UserId, HashSet<Uuid>>,
    by_role: HashMap<RoleId, HashSet<Uuid>>,
}

/// Holds user→role bindings. Read-mostly; writers hold a narrow critical
/// section and then publish invalidation.
pub struct AssignmentStore {
    graph: Arc<RoleGraph>,
    inner: RwLock<AssignmentIndex>,
    bus: InvalidationSender,
}

impl AssignmentStore {
    pub fn new(graph: Arc<RoleGraph>, bus: InvalidationSender) -> Self {
        Self {
            graph,
            inner: RwLock::new(AssignmentIndex::default()),
            bus,
        }
    }

    /// Bind a role to a user. Rejects archived roles, inverted validity
    /// windows, and a duplicate not-yet-ended assignment of the same
    /// (user, role, scope).
    pub async fn assign(&self, req: AssignmentRequest) -> Result<Arc<Assignment>, AuthzError> {
        if let Some(until) = req.valid_until {
            if until < req.valid_from {
                return Err(AuthzError::InvalidValidityWindow);
            }
        }

        let role = self.graph.get_role(&req.role_id).await?;
        if role.status == RoleStatus::Archived {
            return Err(AuthzError::ArchivedRole {
                role_id: req.role_id,
            });
        }

        let now = Utc::now();
        let mut inner = self.inner.write().await;
        let duplicate = inner
            .by_user
            .get(&req.user_id)
            .map(|ids| {
                ids.iter()
                    .filter_map(|id| inner.by_id.get(id))
                    .any(|existing| {
                        existing.role_id == req.role_id
                            && existing.scope == req.scope
                            && !existing.is_expired_at(now)
                    })
            })
            .unwrap_or(false);
        if duplicate {
            return Err(AuthzError::DuplicateAssignment {
                user_id: req.user_id,
                role_id: req.role_id,
            });
        }

        let assignment = Arc::new(Assignment {
            id: Uuid::new_v4(),
            user_id: req.user_id.clone(),
            role_id: req.role_id.clone(),
            scope: req.scope,
            valid_from: req.valid_from,
            valid_until: req.valid_until,
            created_by: req.created_by,
            created_at: now,
        });

        inner.by_id.insert(assignment.id, Arc::clone(&assignment));
        inner
            .by_user
            .entry(req.user_id.clone())
            .or_default()
            .insert(assignment.id);
        inner
            .by_role
            .entry(req.role_id.clone())
            .or_default()
            .insert(assignment.id);
        drop(inner);

        events::publish(
            &self.bus,
            InvalidationEvent::User {
                user_id: req.user_id.clone(),
            },
        );
        info!(
            user_id = %req.user_id,
            role_id = %req.role_id,
            assignment_id = %assignment.id,
            "role assigned"
        );
        Ok(assignment)
    }

    /// Explicit revocation: removes the binding outright.
    pub async fn revoke(&self, assignment_id: Uuid) -> Result<Arc<Assignment>, AuthzError> {
        let mut inner = self.inner.write().await;
        let assignment =
            inner
                .by_id
                .remove(&assignment_id)
                .ok_or(AuthzError::AssignmentNotFound { assignment_id })?;
        if let Some(ids) = inner.by_user.get_mut(&assignment.user_id) {
            ids.remove(&assignment_id);
            if ids.is_empty() {
                inner.by_user.remove(&assignment.user_id);
            }
        }
        if let Some(ids) = inner.by_role.get_mut(&assignment.role_id) {
            ids.remove(&assignment_id);
            if ids.is_empty() {
                inner.by_role.remove(&assignment.role_id);
            }
        }
        drop(inner);

        events::publish(
            &self.bus,
            InvalidationEvent::User {
                user_id: assignment.user_id.clone(),
            },
        );
        info!(assignment_id = %assignment_id, user_id = %assignment.user_id, "assignment revoked");
        Ok(assignment)
    }

    /// Assignments whose validity window covers `now`.
    pub async fn active_assignments_for(
        &self,
        user_id: &str,
        now: DateTime<Utc>,
    ) -> Vec<Arc<Assignment>> {
        let inner = self.inner.read().await;
        let mut active: Vec<Arc<Assignment>> = inner
            .by_user
            .get(user_id)
            .into_iter()
            .flatten()
            .filter_map(|id| inner.by_id.get(id))
            .filter(|a| a.is_active_at(now))
            .cloned()
            .collect();
        active.sort_by_key(|a| a.created_at);
        debug!(user_id = %user_id, count = active.len(), "active assignments fetched");
        active
    }

    /// All of a user's assignments regardless of validity.
    pub async fn assignments_for_user(&self, user_id: &str) -> Vec<Arc<Assignment>> {
        let inner = self.inner.read().await;
        let mut all: Vec<Arc<Assignment>> = inner
            .by_user
            .get(user_id)
            .into_iter()
            .flatten()
            .filter_map(|id| inner.by_id.get(id))
            .cloned()
            .collect();
        all.sort_by_key(|a| a.created_at);
        all
    }

    /// Impact analysis before archiving a role: who still holds it.
    pub async fn assignments_by_role(&self, role_id: &str) -> Vec<Arc<Assignment>> {
        let inner = self.inner.read().await;
        let mut all: Vec<Arc<Assignment>> = inner
            .by_role
            .get(role_id)
            .into_iter()
            .flatten()
            .filter_map(|id| inner.by_id.get(id))
            .cloned()
            .collect();
        all.sort_by_key(|a| a.created_at);
        all
    }
}

#[async_trait]
impl AssignmentSource for AssignmentStore {
    async fn active_assignments_for(
        &self,
        user_id: &str,
        now: DateTime<Utc>,
    ) -> Vec<Arc<Assignment>> {
        AssignmentStore::active_assignments_for(self, user_id, now).await
    }

    async fn assignments_for_user(&self, user_id: &str) -> Vec<Arc<Assignment>> {
        AssignmentStore::assignments_for_user(self, user_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::invalidation_bus;
    use crate::role_graph::NewRole;
    use chrono::Duration;

    async fn store_with_role(role_id: &str) -> AssignmentStore {
        let bus = invalidation_bus();
        let graph = Arc::new(RoleGraph::new(10, bus.clone()));
        graph
            .create_role(NewRole {
                id: role_id.to_string(),
                name: role_id.to_string(),
                description: String::new(),
                parent_id: None,
                permissions: vec![],
                contextual_rules: vec![],
            })
            .await
            .unwrap();
        AssignmentStore::new(graph, bus)
    }

    fn request(user: &str, role: &str) -> AssignmentRequest {
        AssignmentRequest {
            user_id: user.to_string(),
            role_id: role.to_string(),
            scope: Scope::department("08"),
            valid_from: Utc::now() - Duration::hours(1),
            valid_until: None,
            created_by: "admin".to_string(),
        }
    }

    #[tokio::test]
    async fn assign_and_fetch_active() {
        let store = store_with_role("manager").await;
        store.assign(request("u1", "manager")).await.unwrap();

        let active = store.active_assignments_for("u1", Utc::now()).await;
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].role_id, "manager");
    }

    #[tokio::test]
    async fn expired_assignment_is_not_active() {
        let store = store_with_role("manager").await;
        let mut req = request("u1", "manager");
        req.valid_from = Utc::now() - Duration::days(10);
        req.valid_until = Some(Utc::now() - Duration::days(1));
        store.assign(req).await.unwrap();

        assert!(store.active_assignments_for("u1", Utc::now()).await.is_empty());
        assert_eq!(store.assignments_for_user("u1").await.len(), 1);
    }

    #[tokio::test]
    async fn future_assignment_is_not_yet_active() {
        let store = store_with_role("manager").await;
        let mut req = request("u1", "manager");
        req.valid_from = Utc::now() + Duration::days(1);
        store.assign(req).await.unwrap();

        assert!(store.active_assignments_for("u1", Utc::now()).await.is_empty());
    }

    #[tokio::test]
    async fn inverted_window_is_rejected() {
        let store = store_with_role("manager").await;
        let mut req = request("u1", "manager");
        req.valid_until = Some(req.valid_from - Duration::hours(1));
        let err = store.assign(req).await.unwrap_err();
        assert!(matches!(err, AuthzError::InvalidValidityWindow));
    }

    #[tokio::test]
    async fn archived_role_rejects_new_assignments() {
        let bus = invalidation_bus();
        let graph = Arc::new(RoleGraph::new(10, bus.clone()));
        graph
            .create_role(NewRole {
                id: "old".into(),
                name: "old".into(),
                description: String::new(),
                parent_id: None,
                permissions: vec![],
                contextual_rules: vec![],
            })
            .await
            .unwrap();
        graph.publish_role("old").await.unwrap();
        let store = AssignmentStore::new(Arc::clone(&graph), bus);

        // Existing assignment keeps working after archival.
        let existing = store.assign(request("u1", "old")).await.unwrap();
        graph.archive_role("old").await.unwrap();
        assert!(existing.is_active_at(Utc::now()));

        let err = store.assign(request("u2", "old")).await.unwrap_err();
        assert!(matches!(err, AuthzError::ArchivedRole { .. }));
    }

    #[tokio::test]
    async fn duplicate_active_assignment_conflicts() {
        let store = store_with_role("manager").await;
        store.assign(request("u1", "manager")).await.unwrap();
        let err = store.assign(request("u1", "manager")).await.unwrap_err();
        assert!(matches!(err, AuthzError::DuplicateAssignment { .. }));

        // Same role in a different scope is not a duplicate.
        let mut other_scope = request("u1", "manager");
        other_scope.scope = Scope::department("10");
        store.assign(other_scope).await.unwrap();
    }

    #[tokio::test]
    async fn revoke_removes_from_all_indexes() {
        let store = store_with_role("manager").await;
        let a = store.assign(request("u1", "manager")).await.unwrap();
        store.revoke(a.id).await.unwrap();

        assert!(store.assignments_for_user("u1").await.is_empty());
        assert!(store.assignments_by_role("manager").await.is_empty());
        let err = store.revoke(a.id).await.unwrap_err();
        assert!(matches!(err, AuthzError::AssignmentNotFound { .. }));
    }

    #[tokio::test]
    async fn by_role_index_supports_impact_analysis() {
        let store = store_with_role("manager").await;
        store.assign(request("u1", "manager")).await.unwrap();
        let mut second = request("u2", "manager");
        second.scope = Scope::department("10");
        store.assign(second).await.unwrap();

        let holders = store.assignments_by_role("manager").await;
        assert_eq!(holders.len(), 2);
    }
}
