//! The permission resolver: the one entry point callers use to ask
//! "may this user do this action on this resource in this scope?".
//!
//! Resolution is fail-closed end to end: no matching grant, an internal
//! error, or hitting the resolution timeout all yield Deny. The resolver
//! never returns an error to `check_permission` callers; authorization
//! checks always produce a decision.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::assignment_store::AssignmentSource;
use crate::audit::AuditLog;
use crate::cache::{CacheKey, DecisionCache};
use crate::config::AuthzConfig;
use crate::context::{Candidate, ContextEvaluator};
use crate::metrics::METRICS;
use crate::model::{
    Action, AuditRecord, Decision, Outcome, Polarity, RequestContext, RoleId, Scope,
};
use crate::role_graph::RoleGraph;

struct Resolved {
    decision: Decision,
    /// Role ids the resolution touched, for the cache's reverse index.
    roles: Vec<RoleId>,
}

/// Orchestrates assignment lookup, role expansion, contextual adjustment,
/// deny-precedence, caching, and audit. Explicitly constructed with its
/// collaborators; no shared global instance.
pub struct PermissionResolver {
    graph: Arc<RoleGraph>,
    assignments: Arc<dyn AssignmentSource>,
    evaluator: ContextEvaluator,
    cache: Arc<DecisionCache>,
    audit: Arc<AuditLog>,
    config: AuthzConfig,
}

impl PermissionResolver {
    pub fn new(
        graph: Arc<RoleGraph>,
        assignments: Arc<dyn AssignmentSource>,
        evaluator: ContextEvaluator,
        cache: Arc<DecisionCache>,
        audit: Arc<AuditLog>,
        config: AuthzConfig,
    ) -> Self {
        Self {
            graph,
            assignments,
            evaluator,
            cache,
            audit,
            config,
        }
    }

    /// Resolve one (user, resource, action, scope) request to a Decision.
    ///
    /// Exactly one audit event is recorded per completed call, cache hit
    /// or miss. If the caller's own timeout cancels the returned future,
    /// nothing is cached and nothing is audited. A hit of the internal
    /// resolution bound yields Deny with reason "resolution timeout" and
    /// is never cached.
    pub async fn check_permission(
        &self,
        user_id: &str,
        resource: &str,
        action: Action,
        scope: &Scope,
        ctx: &RequestContext,
    ) -> Decision {
        let started = Instant::now();
        let key = CacheKey::new(user_id, resource, action, scope);

        if let Some(decision) = self.cache.get(&key).await {
            self.record(&decision, ctx, started, true).await;
            return decision;
        }

        let resolved = timeout(
            self.config.resolution_timeout,
            self.resolve(user_id, resource, action, scope, ctx),
        )
        .await;

        let decision = match resolved {
            Ok(resolved) => {
                METRICS
                    .resolution_duration_seconds
                    .observe(started.elapsed().as_secs_f64());
                self.cache
                    .insert(key, resolved.decision.clone(), resolved.roles)
                    .await;
                resolved.decision
            }
            Err(_elapsed) => {
                METRICS.resolution_timeouts_total.inc();
                warn!(
                    user_id = %user_id,
                    resource = %resource,
                    timeout_ms = self.config.resolution_timeout.as_millis() as u64,
                    "permission resolution timed out; failing closed"
                );
                self.timeout_decision(user_id, resource, action, scope)
            }
        };

        self.record(&decision, ctx, started, false).await;
        decision
    }

    /// Batch form for UI capability gating: every (resource, action) the
    /// user currently holds in the given scope, with the same resolution
    /// rules applied per tuple.
    pub async fn list_effective_permissions(
        &self,
        user_id: &str,
        scope: &Scope,
        ctx: &RequestContext,
    ) -> BTreeSet<(String, Action)> {
        let candidates = match self.gather_candidates(user_id, scope, ctx).await {
            Some((candidates, _roles)) => candidates,
            None => return BTreeSet::new(),
        };

        let denied: BTreeSet<(String, Action)> = candidates
            .iter()
            .filter(|c| c.entry.polarity == Polarity::Deny)
            .flat_map(|c| {
                c.entry
                    .actions
                    .iter()
                    .map(|a| (c.entry.resource.clone(), *a))
            })
            .collect();

        candidates
            .iter()
            .filter(|c| c.entry.polarity == Polarity::Allow)
            .flat_map(|c| {
                c.entry
                    .actions
                    .iter()
                    .map(|a| (c.entry.resource.clone(), *a))
            })
            .filter(|pair| !denied.contains(pair))
            .collect()
    }

    async fn resolve(
        &self,
        user_id: &str,
        resource: &str,
        action: Action,
        scope: &Scope,
        ctx: &RequestContext,
    ) -> Resolved {
        let (candidates, roles) = match self.gather_candidates(user_id, scope, ctx).await {
            Some(gathered) => gathered,
            None => {
                let reason = self.absent_grant_reason(user_id, ctx).await;
                return Resolved {
                    decision: self.deny(user_id, resource, action, scope, None, reason),
                    roles: Vec::new(),
                };
            }
        };

        // Deny-wins across roles: one denying role beats any allowing one.
        if let Some(denying) = candidates
            .iter()
            .find(|c| c.entry.polarity == Polarity::Deny && c.entry.covers(resource, action))
        {
            let matched = denying.source.reference();
            let reason = format!("explicitly denied by {matched}");
            return Resolved {
                decision: self.deny(user_id, resource, action, scope, Some(matched), reason),
                roles,
            };
        }

        if let Some(allowing) = candidates
            .iter()
            .find(|c| c.entry.polarity == Polarity::Allow && c.entry.covers(resource, action))
        {
            let matched = allowing.source.reference();
            debug!(user_id = %user_id, resource = %resource, action = %action, matched = %matched, "permission granted");
            return Resolved {
                decision: Decision {
                    user_id: user_id.to_string(),
                    resource: resource.to_string(),
                    action,
                    scope: scope.clone(),
                    outcome: Outcome::Allow,
                    matched_rule: Some(matched.clone()),
                    reason: format!("granted by {matched}"),
                    timestamp: Utc::now(),
                },
                roles,
            };
        }

        Resolved {
            decision: self.deny(
                user_id,
                resource,
                action,
                scope,
                None,
                "no matching grant".to_string(),
            ),
            roles,
        }
    }

    /// Expand every scope-qualifying active assignment into adjusted
    /// permission candidates. `None` means no assignment qualified.
    async fn gather_candidates(
        &self,
        user_id: &str,
        scope: &Scope,
        ctx: &RequestContext,
    ) -> Option<(Vec<Candidate>, Vec<RoleId>)> {
        let active = self.assignments.active_assignments_for(user_id, ctx.now).await;
        let qualifying: Vec<_> = active
            .iter()
            .filter(|a| a.scope.contains(scope))
            .collect();
        if qualifying.is_empty() {
            return None;
        }

        let mut candidates = Vec::new();
        let mut roles = Vec::new();
        for assignment in qualifying {
            let effective = match self.graph.effective_permissions(&assignment.role_id).await {
                Ok(effective) => effective,
                Err(e) => {
                    // Fail-closed: an unresolvable role contributes no
                    // grants.
                    warn!(
                        role_id = %assignment.role_id,
                        error = %e,
                        "role expansion failed during resolution"
                    );
                    continue;
                }
            };
            let rules = self
                .graph
                .contextual_rules(&assignment.role_id)
                .await
                .unwrap_or_default();
            if let Ok(chain) = self.graph.chain_ids(&assignment.role_id).await {
                for role_id in chain.iter() {
                    if !roles.contains(role_id) {
                        roles.push(role_id.clone());
                    }
                }
            }

            let base: Vec<Candidate> = effective.into_iter().map(Candidate::from_effective).collect();
            candidates.extend(self.evaluator.apply(base, &rules, ctx));
        }
        Some((candidates, roles))
    }

    /// Distinguish "expired assignment" from "no matching grant" for the
    /// default denial, per the audit trail's needs.
    async fn absent_grant_reason(&self, user_id: &str, ctx: &RequestContext) -> String {
        let all = self.assignments.assignments_for_user(user_id).await;
        if !all.is_empty() && all.iter().all(|a| !a.is_active_at(ctx.now)) {
            if all.iter().any(|a| a.is_expired_at(ctx.now)) {
                return "expired assignment".to_string();
            }
            return "assignment not yet valid".to_string();
        }
        if all.iter().any(|a| a.is_active_at(ctx.now)) {
            return "assignment scope does not cover request".to_string();
        }
        "no matching grant".to_string()
    }

    fn deny(
        &self,
        user_id: &str,
        resource: &str,
        action: Action,
        scope: &Scope,
        matched_rule: Option<String>,
        reason: String,
    ) -> Decision {
        Decision {
            user_id: user_id.to_string(),
            resource: resource.to_string(),
            action,
            scope: scope.clone(),
            outcome: Outcome::Deny,
            matched_rule,
            reason,
            timestamp: Utc::now(),
        }
    }

    fn timeout_decision(
        &self,
        user_id: &str,
        resource: &str,
        action: Action,
        scope: &Scope,
    ) -> Decision {
        self.deny(
            user_id,
            resource,
            action,
            scope,
            None,
            "resolution timeout".to_string(),
        )
    }

    async fn record(
        &self,
        decision: &Decision,
        ctx: &RequestContext,
        started: Instant,
        cache_hit: bool,
    ) {
        let outcome = decision.outcome.to_string();
        METRICS
            .decisions_total
            .with_label_values(&[outcome.as_str()])
            .inc();
        let attributes: BTreeMap<String, String> = ctx
            .attributes
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        self.audit
            .append(AuditRecord::new(
                decision.clone(),
                attributes,
                started.elapsed().as_micros() as u64,
                cache_hit,
            ))
            .await;
    }

    /// Flush and stop the audit writer. The resolver itself holds no
    /// other background state.
    pub async fn shutdown(&self) {
        self.audit.shutdown().await;
    }
}
