//! # authz-core
//!
//! Unified role-based authorization engine: hierarchical role
//! inheritance, time- and scope-bounded assignments, contextual override
//! rules, TTL-cached decisions, and a tamper-evident audit trail.
//!
//! The engine assumes an already-authenticated principal; role claims
//! carried by identity tokens are never trusted and are resolved fresh on
//! every check. Absence of a matching grant, an internal error, or a
//! resolution timeout all fail closed to Deny.
//!
//! ```no_run
//! use std::sync::Arc;
//! use authz_core::{
//!     Action, AuthzConfig, AuthzEngine, InMemoryAuditStorage, RequestContext, Scope,
//! };
//!
//! # async fn demo() {
//! let engine = AuthzEngine::new(
//!     AuthzConfig::from_env(),
//!     Arc::new(InMemoryAuditStorage::new()),
//! );
//! let decision = engine
//!     .resolver()
//!     .check_permission(
//!         "user-1",
//!         "tickets",
//!         Action::Close,
//!         &Scope::department("08"),
//!         &RequestContext::default(),
//!     )
//!     .await;
//! if decision.is_allowed() {
//!     // proceed
//! }
//! engine.shutdown().await;
//! # }
//! ```

#![forbid(unsafe_code)]
#![deny(rust_2018_idioms, future_incompatible)]

use std::sync::Arc;

pub mod assignment_store;
pub mod audit;
pub mod cache;
pub mod config;
pub mod context;
pub mod errors;
pub mod events;
pub mod metrics;
pub mod model;
pub mod resolver;
pub mod role_graph;

pub use assignment_store::{AssignmentRequest, AssignmentSource, AssignmentStore};
pub use audit::{
    AuditLog, AuditPage, AuditQuery, AuditStorage, ChainVerification, ExportFormat,
    InMemoryAuditStorage,
};
pub use cache::{CacheKey, DecisionCache};
pub use config::AuthzConfig;
pub use context::{Candidate, CandidateSource, ContextEvaluator};
pub use errors::AuthzError;
pub use events::{invalidation_bus, InvalidationEvent};
pub use model::{
    Action, Assignment, AuditEvent, AuditRecord, ContextualRule, Decision, Outcome,
    PermissionEntry, Polarity, RequestContext, Role, RoleId, RoleStatus, RuleCondition, Scope,
    ScopeType, UserId,
};
pub use resolver::PermissionResolver;
pub use role_graph::{EffectivePermission, NewRole, Provenance, RoleGraph, RoleUpdate};

/// Fully wired engine: role graph, assignment store, decision cache (with
/// its invalidation listener), audit log, and resolver sharing one
/// invalidation bus. Construct once, inject where needed, shut down on
/// service exit.
pub struct AuthzEngine {
    graph: Arc<RoleGraph>,
    assignments: Arc<AssignmentStore>,
    cache: Arc<DecisionCache>,
    audit: Arc<AuditLog>,
    resolver: PermissionResolver,
    cache_listener: tokio::task::JoinHandle<()>,
}

impl AuthzEngine {
    /// Wire up the engine against a durable audit backend. Must be called
    /// from within a tokio runtime (the audit writer and the cache
    /// invalidation listener are spawned here).
    pub fn new(config: AuthzConfig, audit_storage: Arc<dyn AuditStorage>) -> Self {
        let bus = events::invalidation_bus();
        let graph = Arc::new(RoleGraph::new(config.max_role_depth, bus.clone()));
        let assignments = Arc::new(AssignmentStore::new(Arc::clone(&graph), bus.clone()));
        let cache = Arc::new(DecisionCache::new(
            config.cache_ttl,
            config.cache_max_entries,
        ));
        let cache_listener = cache.spawn_invalidation_listener(bus.subscribe());
        let audit = AuditLog::new(audit_storage, &config);
        let resolver = PermissionResolver::new(
            Arc::clone(&graph),
            Arc::clone(&assignments) as Arc<dyn AssignmentSource>,
            ContextEvaluator::new(),
            Arc::clone(&cache),
            Arc::clone(&audit),
            config,
        );
        Self {
            graph,
            assignments,
            cache,
            audit,
            resolver,
            cache_listener,
        }
    }

    /// Role administration: create/update/publish/archive, hierarchy
    /// queries.
    pub fn roles(&self) -> &RoleGraph {
        &self.graph
    }

    /// Assignment administration: assign/revoke/list.
    pub fn assignments(&self) -> &AssignmentStore {
        &self.assignments
    }

    /// Decision cache, exposed for explicit invalidation (bulk imports,
    /// config reloads).
    pub fn cache(&self) -> &DecisionCache {
        &self.cache
    }

    /// Audit queries, export, risk scoring, chain verification.
    pub fn audit(&self) -> &AuditLog {
        &self.audit
    }

    /// The hot-path surface: `check_permission` and
    /// `list_effective_permissions`.
    pub fn resolver(&self) -> &PermissionResolver {
        &self.resolver
    }

    /// Stop background tasks after a final audit flush.
    pub async fn shutdown(self) {
        self.cache_listener.abort();
        self.audit.shutdown().await;
    }
}
