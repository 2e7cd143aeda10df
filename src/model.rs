//! Core data model for the authorization engine.
//!
//! All types are strongly typed and validated at construction; nothing in
//! this module is ever partially populated. Decisions and audit events are
//! immutable once produced.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::errors::AuthzError;

/// Opaque identifier of an already-authenticated principal. Role claims
/// carried by identity tokens are never trusted; roles are resolved fresh
/// from the assignment store on every check.
pub type UserId = String;

/// Stable identifier of a role definition.
pub type RoleId = String;

/// Fixed action vocabulary. Permission entries reference subsets of this.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    Create,
    Read,
    Write,
    Update,
    Delete,
    Approve,
    Assign,
    Export,
    Close,
}

impl Action {
    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Create => "create",
            Action::Read => "read",
            Action::Write => "write",
            Action::Update => "update",
            Action::Delete => "delete",
            Action::Approve => "approve",
            Action::Assign => "assign",
            Action::Export => "export",
            Action::Close => "close",
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Action {
    type Err = AuthzError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "create" => Ok(Action::Create),
            "read" => Ok(Action::Read),
            "write" => Ok(Action::Write),
            "update" => Ok(Action::Update),
            "delete" => Ok(Action::Delete),
            "approve" => Ok(Action::Approve),
            "assign" => Ok(Action::Assign),
            "export" => Ok(Action::Export),
            "close" => Ok(Action::Close),
            other => Err(AuthzError::MalformedScope {
                reason: format!("unknown action: {other}"),
            }),
        }
    }
}

/// Explicit polarity of a permission entry. An explicit `Deny` always
/// overrides any `Allow` for the same (resource, action), regardless of
/// specificity or role combination.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Polarity {
    Allow,
    Deny,
}

/// One grant or denial carried by a role or a contextual rule.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PermissionEntry {
    /// Resource type tag, e.g. "tickets", "documents".
    pub resource: String,
    /// Actions this entry covers.
    pub actions: BTreeSet<Action>,
    /// Predicate ids that must all be present in the request context for
    /// this entry to apply. Empty means unconditional.
    pub conditions: Vec<String>,
    pub polarity: Polarity,
}

impl PermissionEntry {
    pub fn allow(resource: impl Into<String>, actions: impl IntoIterator<Item = Action>) -> Self {
        Self {
            resource: resource.into(),
            actions: actions.into_iter().collect(),
            conditions: Vec::new(),
            polarity: Polarity::Allow,
        }
    }

    pub fn deny(resource: impl Into<String>, actions: impl IntoIterator<Item = Action>) -> Self {
        Self {
            resource: resource.into(),
            actions: actions.into_iter().collect(),
            conditions: Vec::new(),
            polarity: Polarity::Deny,
        }
    }

    /// Attach predicate conditions to this entry.
    pub fn when(mut self, predicate_ids: impl IntoIterator<Item = String>) -> Self {
        self.conditions = predicate_ids.into_iter().collect();
        self
    }

    pub fn covers(&self, resource: &str, action: Action) -> bool {
        self.resource == resource && self.actions.contains(&action)
    }
}

/// Role lifecycle. Draft roles edit freely; Published roles may only be
/// archived; Archived roles keep existing assignments working but accept
/// no new ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RoleStatus {
    Draft,
    Published,
    Archived,
}

/// A role definition. `level` is the derived depth in the hierarchy
/// (0 = root). System roles are seeded already Published and are immutable.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Role {
    pub id: RoleId,
    pub name: String,
    pub description: String,
    pub parent_id: Option<RoleId>,
    pub permissions: Vec<PermissionEntry>,
    /// Contextual rules evaluated against the request context, able to add
    /// or revoke permissions beyond the static entries above.
    pub contextual_rules: Vec<ContextualRule>,
    pub is_system_role: bool,
    pub status: RoleStatus,
    pub level: u32,
}

/// Scope granularity, ordered broad to narrow. A broader assignment scope
/// contains any narrower request; a narrower scope never satisfies a
/// broader request.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum ScopeType {
    Organization,
    Department,
    Project,
    Personal,
}

/// The organizational boundary an assignment is restricted to, and the
/// shape of the scope context a permission check is made against.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Scope {
    pub scope_type: ScopeType,
    pub values: BTreeSet<String>,
}

impl Scope {
    pub fn new(
        scope_type: ScopeType,
        values: impl IntoIterator<Item = String>,
    ) -> Result<Self, AuthzError> {
        let values: BTreeSet<String> = values.into_iter().collect();
        if values.is_empty() {
            return Err(AuthzError::MalformedScope {
                reason: "scope must carry at least one identifier".into(),
            });
        }
        if values.iter().any(|v| v.trim().is_empty()) {
            return Err(AuthzError::MalformedScope {
                reason: "scope identifiers must be non-empty".into(),
            });
        }
        Ok(Self { scope_type, values })
    }

    pub fn organization(id: impl Into<String>) -> Self {
        Self {
            scope_type: ScopeType::Organization,
            values: BTreeSet::from([id.into()]),
        }
    }

    pub fn department(id: impl Into<String>) -> Self {
        Self {
            scope_type: ScopeType::Department,
            values: BTreeSet::from([id.into()]),
        }
    }

    pub fn project(id: impl Into<String>) -> Self {
        Self {
            scope_type: ScopeType::Project,
            values: BTreeSet::from([id.into()]),
        }
    }

    pub fn personal(user_id: impl Into<String>) -> Self {
        Self {
            scope_type: ScopeType::Personal,
            values: BTreeSet::from([user_id.into()]),
        }
    }

    /// Whether an assignment with this scope satisfies a request made
    /// against `requested`: equal granularity requires the requested
    /// identifiers to all be covered; a broader granularity contains any
    /// narrower request; a narrower granularity never satisfies a broader
    /// or sibling request.
    pub fn contains(&self, requested: &Scope) -> bool {
        match self.scope_type.cmp(&requested.scope_type) {
            std::cmp::Ordering::Less => true,
            std::cmp::Ordering::Equal => requested.values.is_subset(&self.values),
            std::cmp::Ordering::Greater => false,
        }
    }
}

/// A user→role binding with scope and an optional validity window.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Assignment {
    pub id: Uuid,
    pub user_id: UserId,
    pub role_id: RoleId,
    pub scope: Scope,
    pub valid_from: DateTime<Utc>,
    /// `None` means unbounded.
    pub valid_until: Option<DateTime<Utc>>,
    pub created_by: UserId,
    pub created_at: DateTime<Utc>,
}

impl Assignment {
    /// Active iff `at` falls inside [valid_from, valid_until].
    pub fn is_active_at(&self, at: DateTime<Utc>) -> bool {
        if at < self.valid_from {
            return false;
        }
        match self.valid_until {
            Some(until) => at <= until,
            None => true,
        }
    }

    pub fn is_expired_at(&self, at: DateTime<Utc>) -> bool {
        matches!(self.valid_until, Some(until) if at > until)
    }
}

/// Condition under which a contextual rule fires.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RuleCondition {
    /// Satisfied when the request's local wall-clock time falls inside
    /// [start, end). A window with `start > end` wraps midnight, so
    /// "outside business hours" is expressed as the wrapped window
    /// 17:00–09:00.
    TimeWindow { start: NaiveTime, end: NaiveTime },
    /// Satisfied when the request carries this location tag.
    Location { tag: String },
    /// Satisfied when the caller-supplied predicate flag is set.
    Predicate { id: String },
}

impl RuleCondition {
    pub fn is_satisfied(&self, ctx: &RequestContext) -> bool {
        match self {
            RuleCondition::TimeWindow { start, end } => {
                let t = ctx.local_time;
                if start <= end {
                    t >= *start && t < *end
                } else {
                    // wrapped window crossing midnight
                    t >= *start || t < *end
                }
            }
            RuleCondition::Location { tag } => ctx.location.as_deref() == Some(tag.as_str()),
            RuleCondition::Predicate { id } => ctx.predicates.contains(id),
        }
    }
}

/// A runtime rule that adds or revokes permissions beyond the static role
/// definition when its condition is satisfied.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ContextualRule {
    pub id: String,
    pub condition: RuleCondition,
    /// Entries unioned into the candidate set when the condition holds.
    pub grants: Vec<PermissionEntry>,
    /// Entries revoked when the condition holds; revocation takes
    /// precedence over any grant of the same (resource, action).
    pub revocations: Vec<PermissionEntry>,
}

/// Situational inputs to one permission check, supplied by the caller
/// alongside the authenticated principal's attribute bag.
#[derive(Debug, Clone)]
pub struct RequestContext {
    /// Evaluation instant for assignment validity windows.
    pub now: DateTime<Utc>,
    /// Local wall-clock time for time-window rules.
    pub local_time: NaiveTime,
    /// Location tag, if the caller knows one.
    pub location: Option<String>,
    /// Custom predicate flags evaluated by `RuleCondition::Predicate` and
    /// by `PermissionEntry::conditions`.
    pub predicates: HashSet<String>,
    /// Caller attributes recorded into the audit trail.
    pub attributes: HashMap<String, String>,
}

impl RequestContext {
    pub fn at(now: DateTime<Utc>) -> Self {
        Self {
            now,
            local_time: now.time(),
            location: None,
            predicates: HashSet::new(),
            attributes: HashMap::new(),
        }
    }

    pub fn with_location(mut self, tag: impl Into<String>) -> Self {
        self.location = Some(tag.into());
        self
    }

    pub fn with_predicate(mut self, id: impl Into<String>) -> Self {
        self.predicates.insert(id.into());
        self
    }
}

impl Default for RequestContext {
    fn default() -> Self {
        Self::at(Utc::now())
    }
}

/// Allow/Deny result of one authorization check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
    Allow,
    Deny,
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Outcome::Allow => f.write_str("allow"),
            Outcome::Deny => f.write_str("deny"),
        }
    }
}

/// The immutable result of one permission check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Decision {
    pub user_id: UserId,
    pub resource: String,
    pub action: Action,
    pub scope: Scope,
    pub outcome: Outcome,
    /// Reference to the role, entry, or contextual rule that determined
    /// the outcome; absent for default denials.
    pub matched_rule: Option<String>,
    pub reason: String,
    pub timestamp: DateTime<Utc>,
}

impl Decision {
    pub fn is_allowed(&self) -> bool {
        self.outcome == Outcome::Allow
    }
}

/// A decision plus request metadata, as recorded by the audit trail. The
/// sequence number and hash chain fields are assigned at persistence time;
/// events are append-only and never mutated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    pub id: Uuid,
    /// Position in the hash chain, assigned on successful persistence.
    pub sequence: u64,
    pub decision: Decision,
    /// Caller attribute bag captured from the request context. BTreeMap
    /// keeps the canonical serialization stable for hashing.
    pub caller_attributes: BTreeMap<String, String>,
    pub latency_micros: u64,
    pub cache_hit: bool,
    /// Hex SHA-256 of the previous event in the chain.
    pub previous_hash: String,
    /// Hex SHA-256 over (previous_hash, canonical event body).
    pub event_hash: String,
    pub recorded_at: DateTime<Utc>,
}

/// The portion of an audit event the resolver produces; chain fields are
/// filled in by the audit writer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditRecord {
    pub id: Uuid,
    pub decision: Decision,
    pub caller_attributes: BTreeMap<String, String>,
    pub latency_micros: u64,
    pub cache_hit: bool,
    pub recorded_at: DateTime<Utc>,
}

impl AuditRecord {
    pub fn new(
        decision: Decision,
        caller_attributes: BTreeMap<String, String>,
        latency_micros: u64,
        cache_hit: bool,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            decision,
            caller_attributes,
            latency_micros,
            cache_hit,
            recorded_at: Utc::now(),
        }
    }
}
