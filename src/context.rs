//! Contextual rule application.
//!
//! Rules are evaluated in declaration order against the request context.
//! A satisfied rule unions its grants into the candidate set and revokes
//! its denied entries unconditionally; revocation takes precedence over
//! any grant of the same (resource, action) pair.

use std::collections::HashSet;

use crate::model::{Action, ContextualRule, PermissionEntry, Polarity, RequestContext, RoleId};
use crate::role_graph::{EffectivePermission, Provenance};

/// Where a candidate permission entry came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CandidateSource {
    Role {
        role_id: RoleId,
        provenance: Provenance,
    },
    ContextRule {
        rule_id: String,
    },
}

impl CandidateSource {
    /// Human-readable reference recorded as a decision's matched rule.
    pub fn reference(&self) -> String {
        match self {
            CandidateSource::Role {
                role_id,
                provenance,
            } => match provenance {
                Provenance::Direct => format!("role:{role_id}"),
                Provenance::Inherited { from } => format!("role:{role_id} (inherited from {from})"),
            },
            CandidateSource::ContextRule { rule_id } => format!("rule:{rule_id}"),
        }
    }
}

/// One candidate permission entry under consideration for a decision.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub entry: PermissionEntry,
    pub source: CandidateSource,
}

impl Candidate {
    pub fn from_effective(effective: EffectivePermission) -> Self {
        Self {
            entry: effective.entry,
            source: CandidateSource::Role {
                role_id: effective.role_id,
                provenance: effective.provenance,
            },
        }
    }
}

/// Applies contextual rules to a role's candidate permission set.
/// Stateless; injected into the resolver so tests can exercise it in
/// isolation.
#[derive(Debug, Clone, Default)]
pub struct ContextEvaluator;

impl ContextEvaluator {
    pub fn new() -> Self {
        Self
    }

    /// Adjust `base` (a role expansion) by the chain's contextual rules.
    ///
    /// Entries carrying unmet predicate conditions are dropped first.
    /// Satisfied rules then contribute explicit Deny candidates for their
    /// revocations and Allow candidates for their grants; revoked
    /// (resource, action) pairs are struck from every Allow candidate,
    /// whatever its origin.
    pub fn apply(
        &self,
        base: Vec<Candidate>,
        rules: &[ContextualRule],
        ctx: &RequestContext,
    ) -> Vec<Candidate> {
        let mut candidates: Vec<Candidate> = base
            .into_iter()
            .filter(|c| conditions_met(&c.entry, ctx))
            .collect();

        let mut revoked: HashSet<(String, Action)> = HashSet::new();
        for rule in rules {
            if !rule.condition.is_satisfied(ctx) {
                continue;
            }
            for revocation in &rule.revocations {
                if !conditions_met(revocation, ctx) {
                    continue;
                }
                for action in &revocation.actions {
                    revoked.insert((revocation.resource.clone(), *action));
                }
                let mut deny = revocation.clone();
                deny.polarity = Polarity::Deny;
                candidates.push(Candidate {
                    entry: deny,
                    source: CandidateSource::ContextRule {
                        rule_id: rule.id.clone(),
                    },
                });
            }
        }

        // Grants in a second pass: a matching revocation from any
        // satisfied rule blocks the addition regardless of declaration
        // order.
        for rule in rules {
            if !rule.condition.is_satisfied(ctx) {
                continue;
            }
            for grant in &rule.grants {
                if !conditions_met(grant, ctx) {
                    continue;
                }
                let mut entry = grant.clone();
                entry
                    .actions
                    .retain(|action| !revoked.contains(&(entry.resource.clone(), *action)));
                if entry.actions.is_empty() {
                    continue;
                }
                candidates.push(Candidate {
                    entry,
                    source: CandidateSource::ContextRule {
                        rule_id: rule.id.clone(),
                    },
                });
            }
        }

        // Strike revoked pairs from every Allow candidate.
        if !revoked.is_empty() {
            candidates.retain_mut(|c| {
                if c.entry.polarity == Polarity::Deny {
                    return true;
                }
                let resource = c.entry.resource.clone();
                c.entry
                    .actions
                    .retain(|action| !revoked.contains(&(resource.clone(), *action)));
                !c.entry.actions.is_empty()
            });
        }

        candidates
    }
}

fn conditions_met(entry: &PermissionEntry, ctx: &RequestContext) -> bool {
    entry.conditions.iter().all(|p| ctx.predicates.contains(p))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::RuleCondition;
    use chrono::NaiveTime;

    fn base_allow(resource: &str, action: Action) -> Candidate {
        Candidate {
            entry: PermissionEntry::allow(resource, [action]),
            source: CandidateSource::Role {
                role_id: "r".into(),
                provenance: Provenance::Direct,
            },
        }
    }

    fn at_hour(hour: u32) -> RequestContext {
        let mut ctx = RequestContext::default();
        ctx.local_time = NaiveTime::from_hms_opt(hour, 0, 0).unwrap();
        ctx
    }

    #[test]
    fn unsatisfied_rule_changes_nothing() {
        let evaluator = ContextEvaluator::new();
        let rules = vec![ContextualRule {
            id: "after-hours".into(),
            condition: RuleCondition::TimeWindow {
                start: NaiveTime::from_hms_opt(17, 0, 0).unwrap(),
                end: NaiveTime::from_hms_opt(9, 0, 0).unwrap(),
            },
            grants: vec![],
            revocations: vec![PermissionEntry::deny("documents", [Action::Read])],
        }];

        let out = evaluator.apply(
            vec![base_allow("documents", Action::Read)],
            &rules,
            &at_hour(12),
        );
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].entry.polarity, Polarity::Allow);
    }

    #[test]
    fn satisfied_revocation_strikes_allow_and_adds_deny() {
        let evaluator = ContextEvaluator::new();
        let rules = vec![ContextualRule {
            id: "after-hours".into(),
            condition: RuleCondition::TimeWindow {
                start: NaiveTime::from_hms_opt(17, 0, 0).unwrap(),
                end: NaiveTime::from_hms_opt(9, 0, 0).unwrap(),
            },
            grants: vec![],
            revocations: vec![PermissionEntry::deny("documents", [Action::Read])],
        }];

        let out = evaluator.apply(
            vec![base_allow("documents", Action::Read)],
            &rules,
            &at_hour(20),
        );
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].entry.polarity, Polarity::Deny);
        assert!(matches!(
            out[0].source,
            CandidateSource::ContextRule { .. }
        ));
    }

    #[test]
    fn satisfied_grant_is_unioned_in() {
        let evaluator = ContextEvaluator::new();
        let rules = vec![ContextualRule {
            id: "on-site".into(),
            condition: RuleCondition::Location { tag: "hq".into() },
            grants: vec![PermissionEntry::allow("tickets", [Action::Approve])],
            revocations: vec![],
        }];

        let ctx = RequestContext::default().with_location("hq");
        let out = evaluator.apply(vec![], &rules, &ctx);
        assert_eq!(out.len(), 1);
        assert!(out[0].entry.covers("tickets", Action::Approve));

        let elsewhere = RequestContext::default().with_location("branch-2");
        assert!(evaluator.apply(vec![], &rules, &elsewhere).is_empty());
    }

    #[test]
    fn revocation_blocks_grant_of_same_pair_regardless_of_order() {
        let evaluator = ContextEvaluator::new();
        let rules = vec![
            ContextualRule {
                id: "grant-first".into(),
                condition: RuleCondition::Predicate { id: "flag".into() },
                grants: vec![PermissionEntry::allow("documents", [Action::Export])],
                revocations: vec![],
            },
            ContextualRule {
                id: "deny-second".into(),
                condition: RuleCondition::Predicate { id: "flag".into() },
                grants: vec![],
                revocations: vec![PermissionEntry::deny("documents", [Action::Export])],
            },
        ];

        let ctx = RequestContext::default().with_predicate("flag");
        let out = evaluator.apply(vec![], &rules, &ctx);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].entry.polarity, Polarity::Deny);
    }

    #[test]
    fn entry_predicate_conditions_gate_application() {
        let evaluator = ContextEvaluator::new();
        let conditional = Candidate {
            entry: PermissionEntry::allow("documents", [Action::Delete])
                .when(["cleared".to_string()]),
            source: CandidateSource::Role {
                role_id: "r".into(),
                provenance: Provenance::Direct,
            },
        };

        let without = evaluator.apply(vec![conditional.clone()], &[], &RequestContext::default());
        assert!(without.is_empty());

        let ctx = RequestContext::default().with_predicate("cleared");
        let with = evaluator.apply(vec![conditional], &[], &ctx);
        assert_eq!(with.len(), 1);
    }

    #[test]
    fn partial_revocation_keeps_untouched_actions() {
        let evaluator = ContextEvaluator::new();
        let base = Candidate {
            entry: PermissionEntry::allow("documents", [Action::Read, Action::Write]),
            source: CandidateSource::Role {
                role_id: "r".into(),
                provenance: Provenance::Direct,
            },
        };
        let rules = vec![ContextualRule {
            id: "no-writes".into(),
            condition: RuleCondition::Predicate { id: "freeze".into() },
            grants: vec![],
            revocations: vec![PermissionEntry::deny("documents", [Action::Write])],
        }];

        let ctx = RequestContext::default().with_predicate("freeze");
        let out = evaluator.apply(vec![base], &rules, &ctx);
        let allow: Vec<_> = out
            .iter()
            .filter(|c| c.entry.polarity == Polarity::Allow)
            .collect();
        assert_eq!(allow.len(), 1);
        assert!(allow[0].entry.covers("documents", Action::Read));
        assert!(!allow[0].entry.covers("documents", Action::Write));
    }
}
