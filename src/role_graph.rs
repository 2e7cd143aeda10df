//! Role definitions and the parent/child inheritance DAG.
//!
//! Cycle prevention is constructive: an edge that would create a cycle is
//! rejected at write time, never detected lazily at read time. Readers see
//! atomic `Arc<Role>` snapshots; a role is either fully-old or fully-new,
//! never partially updated.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::errors::AuthzError;
use crate::events::{self, InvalidationEvent, InvalidationSender};
use crate::model::{ContextualRule, PermissionEntry, Role, RoleId, RoleStatus};

/// Where an effective permission came from: the role itself, or an
/// ancestor in the inheritance chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Provenance {
    Direct,
    Inherited { from: RoleId },
}

/// One entry of a role's flattened permission set, ordered most-specific
/// first (the role's own entries, then each ancestor's in chain order).
#[derive(Debug, Clone)]
pub struct EffectivePermission {
    pub entry: PermissionEntry,
    /// The role that was expanded (the chain's head).
    pub role_id: RoleId,
    pub provenance: Provenance,
}

/// Inputs for creating a role. Roles start in Draft unless seeded as
/// system roles.
#[derive(Debug, Clone)]
pub struct NewRole {
    pub id: RoleId,
    pub name: String,
    pub description: String,
    pub parent_id: Option<RoleId>,
    pub permissions: Vec<PermissionEntry>,
    pub contextual_rules: Vec<ContextualRule>,
}

/// Partial update applied to a Draft role. `parent_id` uses the outer
/// Option for "leave unchanged" and the inner for "clear the parent".
#[derive(Debug, Clone, Default)]
pub struct RoleUpdate {
    pub name: Option<String>,
    pub description: Option<String>,
    pub parent_id: Option<Option<RoleId>>,
    pub permissions: Option<Vec<PermissionEntry>>,
    pub contextual_rules: Option<Vec<ContextualRule>>,
}

struct GraphInner {
    roles: HashMap<RoleId, Arc<Role>>,
    /// Memoized inheritance chains (self first, root last), dropped for
    /// every chain that contains a mutated role.
    chain_cache: HashMap<RoleId, Arc<Vec<RoleId>>>,
}

/// Holds role definitions and inheritance edges; validates acyclicity and
/// the configured depth bound; computes flattened effective permissions.
pub struct RoleGraph {
    inner: RwLock<GraphInner>,
    max_depth: u32,
    bus: InvalidationSender,
}

impl RoleGraph {
    pub fn new(max_depth: u32, bus: InvalidationSender) -> Self {
        Self {
            inner: RwLock::new(GraphInner {
                roles: HashMap::new(),
                chain_cache: HashMap::new(),
            }),
            max_depth,
            bus,
        }
    }

    /// Create a role in Draft status.
    pub async fn create_role(&self, new: NewRole) -> Result<Arc<Role>, AuthzError> {
        self.insert_role(new, RoleStatus::Draft, false).await
    }

    /// Seed an immutable system role, already Published. Intended for
    /// engine construction time.
    pub async fn seed_system_role(&self, new: NewRole) -> Result<Arc<Role>, AuthzError> {
        self.insert_role(new, RoleStatus::Published, true).await
    }

    async fn insert_role(
        &self,
        new: NewRole,
        status: RoleStatus,
        is_system_role: bool,
    ) -> Result<Arc<Role>, AuthzError> {
        let mut inner = self.inner.write().await;
        if inner.roles.contains_key(&new.id) {
            return Err(AuthzError::RoleAlreadyExists { role_id: new.id });
        }

        let level = match &new.parent_id {
            Some(parent_id) => {
                let parent =
                    inner
                        .roles
                        .get(parent_id)
                        .ok_or_else(|| AuthzError::RoleNotFound {
                            role_id: parent_id.clone(),
                        })?;
                parent.level + 1
            }
            None => 0,
        };
        if level + 1 > self.max_depth {
            return Err(AuthzError::MaxDepthExceeded {
                depth: level + 1,
                max: self.max_depth,
            });
        }

        let role = Arc::new(Role {
            id: new.id.clone(),
            name: new.name,
            description: new.description,
            parent_id: new.parent_id,
            permissions: new.permissions,
            contextual_rules: new.contextual_rules,
            is_system_role,
            status,
            level,
        });
        inner.roles.insert(new.id.clone(), Arc::clone(&role));
        info!(role_id = %new.id, level, system = is_system_role, "role created");
        Ok(role)
    }

    /// Update a Draft role. Re-parenting walks the proposed parent's
    /// ancestor chain and rejects the edge if it already contains this
    /// role (cycle), or if any affected role would exceed the depth bound.
    /// On rejection the graph is left unchanged.
    pub async fn update_role(
        &self,
        role_id: &str,
        update: RoleUpdate,
    ) -> Result<Arc<Role>, AuthzError> {
        let mut inner = self.inner.write().await;
        let current = inner
            .roles
            .get(role_id)
            .ok_or_else(|| AuthzError::RoleNotFound {
                role_id: role_id.to_string(),
            })?
            .clone();

        if current.is_system_role {
            return Err(AuthzError::SystemRoleImmutable {
                role_id: role_id.to_string(),
            });
        }
        if current.status != RoleStatus::Draft {
            return Err(AuthzError::RoleNotEditable {
                role_id: role_id.to_string(),
                status: current.status,
            });
        }

        let new_parent = match &update.parent_id {
            Some(p) => p.clone(),
            None => current.parent_id.clone(),
        };

        let new_level = match &new_parent {
            Some(parent_id) => {
                if parent_id.as_str() == role_id {
                    return Err(AuthzError::CycleDetected {
                        role_id: role_id.to_string(),
                        parent_id: parent_id.clone(),
                    });
                }
                let parent =
                    inner
                        .roles
                        .get(parent_id)
                        .ok_or_else(|| AuthzError::RoleNotFound {
                            role_id: parent_id.clone(),
                        })?;
                // Reject if the proposed parent's ancestor chain already
                // contains this role.
                if ancestor_chain(&inner.roles, parent_id).contains(&role_id.to_string()) {
                    return Err(AuthzError::CycleDetected {
                        role_id: role_id.to_string(),
                        parent_id: parent_id.clone(),
                    });
                }
                parent.level + 1
            }
            None => 0,
        };

        // Depth check covers this role and its deepest descendant.
        let subtree_height = subtree_height(&inner.roles, role_id);
        if new_level + subtree_height + 1 > self.max_depth {
            return Err(AuthzError::MaxDepthExceeded {
                depth: new_level + subtree_height + 1,
                max: self.max_depth,
            });
        }

        let updated = Arc::new(Role {
            id: current.id.clone(),
            name: update.name.unwrap_or_else(|| current.name.clone()),
            description: update
                .description
                .unwrap_or_else(|| current.description.clone()),
            parent_id: new_parent,
            permissions: update
                .permissions
                .unwrap_or_else(|| current.permissions.clone()),
            contextual_rules: update
                .contextual_rules
                .unwrap_or_else(|| current.contextual_rules.clone()),
            is_system_role: false,
            status: current.status,
            level: new_level,
        });
        inner.roles.insert(role_id.to_string(), updated.clone());
        recompute_descendant_levels(&mut inner.roles, role_id);

        self.invalidate_chains(&mut inner, role_id);
        events::publish(
            &self.bus,
            InvalidationEvent::Role {
                role_id: role_id.to_string(),
            },
        );
        debug!(role_id = %role_id, level = new_level, "role updated");
        Ok(updated)
    }

    /// Draft → Published. The only legal forward transition.
    pub async fn publish_role(&self, role_id: &str) -> Result<Arc<Role>, AuthzError> {
        self.transition(role_id, RoleStatus::Published, |status| {
            status == RoleStatus::Draft
        })
        .await
    }

    /// Soft-disable: existing assignments keep working until revoked, but
    /// no new assignment may reference the role.
    pub async fn archive_role(&self, role_id: &str) -> Result<Arc<Role>, AuthzError> {
        self.transition(role_id, RoleStatus::Archived, |status| {
            status != RoleStatus::Archived
        })
        .await
    }

    async fn transition(
        &self,
        role_id: &str,
        to: RoleStatus,
        allowed: impl Fn(RoleStatus) -> bool,
    ) -> Result<Arc<Role>, AuthzError> {
        let mut inner = self.inner.write().await;
        let current = inner
            .roles
            .get(role_id)
            .ok_or_else(|| AuthzError::RoleNotFound {
                role_id: role_id.to_string(),
            })?
            .clone();
        if current.is_system_role {
            return Err(AuthzError::SystemRoleImmutable {
                role_id: role_id.to_string(),
            });
        }
        if !allowed(current.status) {
            return Err(AuthzError::InvalidStatusTransition {
                from: current.status,
                to,
            });
        }
        let mut role = (*current).clone();
        role.status = to;
        let role = Arc::new(role);
        inner.roles.insert(role_id.to_string(), role.clone());

        self.invalidate_chains(&mut inner, role_id);
        events::publish(
            &self.bus,
            InvalidationEvent::Role {
                role_id: role_id.to_string(),
            },
        );
        info!(role_id = %role_id, status = ?to, "role status changed");
        Ok(role)
    }

    pub async fn get_role(&self, role_id: &str) -> Result<Arc<Role>, AuthzError> {
        let inner = self.inner.read().await;
        inner
            .roles
            .get(role_id)
            .cloned()
            .ok_or_else(|| AuthzError::RoleNotFound {
                role_id: role_id.to_string(),
            })
    }

    /// The inheritance chain from the role (first) to its root ancestor
    /// (last).
    pub async fn hierarchy_chain(&self, role_id: &str) -> Result<Vec<Arc<Role>>, AuthzError> {
        let chain_ids = self.chain_ids(role_id).await?;
        let inner = self.inner.read().await;
        let mut chain = Vec::with_capacity(chain_ids.len());
        for id in chain_ids.iter() {
            let role = inner
                .roles
                .get(id)
                .cloned()
                .ok_or_else(|| AuthzError::RoleNotFound {
                    role_id: id.clone(),
                })?;
            chain.push(role);
        }
        Ok(chain)
    }

    /// The role's flattened permission set with provenance, ordered
    /// most-specific first: the role's own declarations, then each
    /// ancestor's in chain order.
    pub async fn effective_permissions(
        &self,
        role_id: &str,
    ) -> Result<Vec<EffectivePermission>, AuthzError> {
        let chain = self.hierarchy_chain(role_id).await?;
        let expanded_id = match chain.first() {
            Some(role) => role.id.clone(),
            None => return Ok(Vec::new()),
        };
        let mut effective = Vec::new();
        for (idx, role) in chain.iter().enumerate() {
            let provenance = if idx == 0 {
                Provenance::Direct
            } else {
                Provenance::Inherited {
                    from: role.id.clone(),
                }
            };
            for entry in &role.permissions {
                effective.push(EffectivePermission {
                    entry: entry.clone(),
                    role_id: expanded_id.clone(),
                    provenance: provenance.clone(),
                });
            }
        }
        Ok(effective)
    }

    /// Contextual rules collected along the chain, most-specific role
    /// first, declaration order preserved within a role.
    pub async fn contextual_rules(&self, role_id: &str) -> Result<Vec<ContextualRule>, AuthzError> {
        let chain = self.hierarchy_chain(role_id).await?;
        Ok(chain
            .iter()
            .flat_map(|role| role.contextual_rules.iter().cloned())
            .collect())
    }

    /// Memoized chain of role ids, self first, root last.
    pub async fn chain_ids(&self, role_id: &str) -> Result<Arc<Vec<RoleId>>, AuthzError> {
        {
            let inner = self.inner.read().await;
            if let Some(chain) = inner.chain_cache.get(role_id) {
                return Ok(Arc::clone(chain));
            }
            if !inner.roles.contains_key(role_id) {
                return Err(AuthzError::RoleNotFound {
                    role_id: role_id.to_string(),
                });
            }
        }
        let mut inner = self.inner.write().await;
        if !inner.roles.contains_key(role_id) {
            return Err(AuthzError::RoleNotFound {
                role_id: role_id.to_string(),
            });
        }
        let mut chain = vec![role_id.to_string()];
        chain.extend(ancestor_chain(&inner.roles, role_id));
        let chain = Arc::new(chain);
        inner
            .chain_cache
            .insert(role_id.to_string(), Arc::clone(&chain));
        Ok(chain)
    }

    fn invalidate_chains(&self, inner: &mut GraphInner, role_id: &str) {
        inner
            .chain_cache
            .retain(|_, chain| !chain.iter().any(|id| id == role_id));
    }
}

/// Ancestor ids of `role_id`, nearest first, excluding the role itself.
/// The constructive write-time validation keeps the graph acyclic, so the
/// walk terminates.
fn ancestor_chain(roles: &HashMap<RoleId, Arc<Role>>, role_id: &str) -> Vec<RoleId> {
    let mut ancestors = Vec::new();
    let mut cursor = roles.get(role_id).and_then(|r| r.parent_id.clone());
    while let Some(id) = cursor {
        if ancestors.contains(&id) {
            break;
        }
        cursor = roles.get(&id).and_then(|r| r.parent_id.clone());
        ancestors.push(id);
    }
    ancestors
}

/// Longest descendant distance below `role_id` (0 = leaf).
fn subtree_height(roles: &HashMap<RoleId, Arc<Role>>, role_id: &str) -> u32 {
    roles
        .values()
        .filter(|r| r.parent_id.as_deref() == Some(role_id))
        .map(|child| 1 + subtree_height(roles, &child.id))
        .max()
        .unwrap_or(0)
}

/// After a reparent, refresh the derived `level` of every descendant.
fn recompute_descendant_levels(roles: &mut HashMap<RoleId, Arc<Role>>, root_id: &str) {
    let mut queue = vec![root_id.to_string()];
    while let Some(parent_id) = queue.pop() {
        let parent_level = match roles.get(&parent_id) {
            Some(p) => p.level,
            None => continue,
        };
        let child_ids: Vec<RoleId> = roles
            .values()
            .filter(|r| r.parent_id.as_deref() == Some(parent_id.as_str()))
            .map(|r| r.id.clone())
            .collect();
        for child_id in child_ids {
            if let Some(child) = roles.get(&child_id) {
                let mut updated = (**child).clone();
                updated.level = parent_level + 1;
                roles.insert(child_id.clone(), Arc::new(updated));
            }
            queue.push(child_id);
        }
    }
}
