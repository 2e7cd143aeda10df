//! TTL-based decision cache with explicit invalidation.
//!
//! Keys mirror the resolver's request tuple. A reverse index from role id
//! to cache keys lets a role mutation invalidate exactly the decisions
//! whose resolution depended on that role. Reads never block on
//! invalidation; an in-flight invalidation simply causes subsequent reads
//! to miss and recompute. Staleness after a mutation is bounded by the
//! TTL.

use std::collections::hash_map::DefaultHasher;
use std::collections::{HashMap, HashSet};
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::events::{InvalidationEvent, InvalidationReceiver};
use crate::metrics::METRICS;
use crate::model::{Action, Decision, RoleId, Scope, UserId};

/// Cache key: (user, resource type, action, scope-context hash).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub user_id: UserId,
    pub resource: String,
    pub action: Action,
    pub scope_hash: u64,
}

impl CacheKey {
    pub fn new(user_id: &str, resource: &str, action: Action, scope: &Scope) -> Self {
        let mut hasher = DefaultHasher::new();
        scope.hash(&mut hasher);
        Self {
            user_id: user_id.to_string(),
            resource: resource.to_string(),
            action,
            scope_hash: hasher.finish(),
        }
    }
}

struct CacheEntry {
    decision: Decision,
    /// Roles this decision's resolution touched, mirrored in `by_role`.
    roles: Vec<RoleId>,
    expires_at: Instant,
}

#[derive(Default)]
struct CacheInner {
    entries: HashMap<CacheKey, CacheEntry>,
    by_role: HashMap<RoleId, HashSet<CacheKey>>,
    by_user: HashMap<UserId, HashSet<CacheKey>>,
}

impl CacheInner {
    fn remove(&mut self, key: &CacheKey) {
        if let Some(entry) = self.entries.remove(key) {
            for role_id in entry.roles {
                if let Some(keys) = self.by_role.get_mut(&role_id) {
                    keys.remove(key);
                    if keys.is_empty() {
                        self.by_role.remove(&role_id);
                    }
                }
            }
            if let Some(keys) = self.by_user.get_mut(&key.user_id) {
                keys.remove(key);
                if keys.is_empty() {
                    self.by_user.remove(&key.user_id);
                }
            }
        }
    }
}

/// Memoizes resolved decisions for the cache TTL.
pub struct DecisionCache {
    inner: RwLock<CacheInner>,
    ttl: Duration,
    max_entries: usize,
}

impl DecisionCache {
    pub fn new(ttl: Duration, max_entries: usize) -> Self {
        Self {
            inner: RwLock::new(CacheInner::default()),
            ttl,
            max_entries,
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Fetch a cached decision; expired entries count as misses and are
    /// reaped lazily on the next insert.
    pub async fn get(&self, key: &CacheKey) -> Option<Decision> {
        let inner = self.inner.read().await;
        match inner.entries.get(key) {
            Some(entry) if entry.expires_at > Instant::now() => {
                METRICS.cache_operations_total.with_label_values(&["hit"]).inc();
                debug!(user_id = %key.user_id, resource = %key.resource, "decision cache hit");
                Some(entry.decision.clone())
            }
            _ => {
                METRICS
                    .cache_operations_total
                    .with_label_values(&["miss"])
                    .inc();
                None
            }
        }
    }

    /// Write-through from the resolver. `roles` are the role ids the
    /// resolution touched, feeding the reverse index.
    pub async fn insert(&self, key: CacheKey, decision: Decision, roles: Vec<RoleId>) {
        let mut inner = self.inner.write().await;
        if inner.entries.len() >= self.max_entries {
            let now = Instant::now();
            let expired: Vec<CacheKey> = inner
                .entries
                .iter()
                .filter(|(_, e)| e.expires_at <= now)
                .map(|(k, _)| k.clone())
                .collect();
            for k in expired {
                inner.remove(&k);
            }
            // Still full: evict the entry nearest to expiry.
            if inner.entries.len() >= self.max_entries {
                if let Some(k) = inner
                    .entries
                    .iter()
                    .min_by_key(|(_, e)| e.expires_at)
                    .map(|(k, _)| k.clone())
                {
                    inner.remove(&k);
                }
            }
        }

        for role_id in &roles {
            inner
                .by_role
                .entry(role_id.clone())
                .or_default()
                .insert(key.clone());
        }
        inner
            .by_user
            .entry(key.user_id.clone())
            .or_default()
            .insert(key.clone());
        inner.entries.insert(
            key,
            CacheEntry {
                decision,
                roles,
                expires_at: Instant::now() + self.ttl,
            },
        );
    }

    pub async fn invalidate_user(&self, user_id: &str) {
        let mut inner = self.inner.write().await;
        let keys: Vec<CacheKey> = inner
            .by_user
            .get(user_id)
            .map(|s| s.iter().cloned().collect())
            .unwrap_or_default();
        for key in &keys {
            inner.remove(key);
        }
        debug!(user_id = %user_id, invalidated = keys.len(), "user cache entries invalidated");
    }

    /// Broadcast invalidation to every cached entry whose computation
    /// depended on the role.
    pub async fn invalidate_role(&self, role_id: &str) {
        let mut inner = self.inner.write().await;
        let keys: Vec<CacheKey> = inner
            .by_role
            .get(role_id)
            .map(|s| s.iter().cloned().collect())
            .unwrap_or_default();
        for key in &keys {
            inner.remove(key);
        }
        debug!(role_id = %role_id, invalidated = keys.len(), "role cache entries invalidated");
    }

    pub async fn invalidate_all(&self) {
        let mut inner = self.inner.write().await;
        *inner = CacheInner::default();
        debug!("decision cache cleared");
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.entries.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Subscribe to the invalidation bus. Lagging behind the bus degrades
    /// to a full clear, which is always safe.
    pub fn spawn_invalidation_listener(
        self: &Arc<Self>,
        mut rx: InvalidationReceiver,
    ) -> JoinHandle<()> {
        let cache = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(InvalidationEvent::User { user_id }) => {
                        cache.invalidate_user(&user_id).await;
                    }
                    Ok(InvalidationEvent::Role { role_id }) => {
                        cache.invalidate_role(&role_id).await;
                    }
                    Ok(InvalidationEvent::All) => {
                        cache.invalidate_all().await;
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "invalidation listener lagged; clearing cache");
                        cache.invalidate_all().await;
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Outcome, ScopeType};
    use chrono::Utc;

    fn decision(user: &str, outcome: Outcome) -> Decision {
        Decision {
            user_id: user.to_string(),
            resource: "tickets".into(),
            action: Action::Close,
            scope: Scope::department("08"),
            outcome,
            matched_rule: None,
            reason: "test".into(),
            timestamp: Utc::now(),
        }
    }

    fn key(user: &str) -> CacheKey {
        CacheKey::new(user, "tickets", Action::Close, &Scope::department("08"))
    }

    #[tokio::test]
    async fn insert_then_get() {
        let cache = DecisionCache::new(Duration::from_secs(5), 100);
        cache
            .insert(key("u1"), decision("u1", Outcome::Allow), vec!["r1".into()])
            .await;
        let hit = cache.get(&key("u1")).await.unwrap();
        assert_eq!(hit.outcome, Outcome::Allow);
    }

    #[tokio::test]
    async fn distinct_scopes_hash_to_distinct_keys() {
        let a = CacheKey::new("u1", "tickets", Action::Close, &Scope::department("08"));
        let b = CacheKey::new("u1", "tickets", Action::Close, &Scope::department("10"));
        assert_ne!(a, b);

        let broad = Scope::new(ScopeType::Department, vec!["08".into(), "10".into()]).unwrap();
        let c = CacheKey::new("u1", "tickets", Action::Close, &broad);
        assert_ne!(a, c);
    }

    #[tokio::test]
    async fn entries_expire_after_ttl() {
        let cache = DecisionCache::new(Duration::from_millis(30), 100);
        cache
            .insert(key("u1"), decision("u1", Outcome::Allow), vec![])
            .await;
        assert!(cache.get(&key("u1")).await.is_some());
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(cache.get(&key("u1")).await.is_none());
    }

    #[tokio::test]
    async fn role_invalidation_uses_reverse_index() {
        let cache = DecisionCache::new(Duration::from_secs(60), 100);
        cache
            .insert(key("u1"), decision("u1", Outcome::Allow), vec!["r1".into()])
            .await;
        cache
            .insert(key("u2"), decision("u2", Outcome::Allow), vec!["r2".into()])
            .await;

        cache.invalidate_role("r1").await;
        assert!(cache.get(&key("u1")).await.is_none());
        assert!(cache.get(&key("u2")).await.is_some());
    }

    #[tokio::test]
    async fn user_invalidation_leaves_other_users() {
        let cache = DecisionCache::new(Duration::from_secs(60), 100);
        cache
            .insert(key("u1"), decision("u1", Outcome::Allow), vec!["r1".into()])
            .await;
        cache
            .insert(key("u2"), decision("u2", Outcome::Deny), vec!["r1".into()])
            .await;

        cache.invalidate_user("u1").await;
        assert!(cache.get(&key("u1")).await.is_none());
        assert!(cache.get(&key("u2")).await.is_some());
    }

    #[tokio::test]
    async fn eviction_bounds_entry_count() {
        let cache = DecisionCache::new(Duration::from_secs(60), 2);
        for user in ["u1", "u2", "u3"] {
            cache
                .insert(key(user), decision(user, Outcome::Allow), vec![])
                .await;
        }
        assert!(cache.len().await <= 2);
    }

    #[tokio::test]
    async fn listener_applies_bus_events() {
        let cache = Arc::new(DecisionCache::new(Duration::from_secs(60), 100));
        let bus = crate::events::invalidation_bus();
        let handle = cache.spawn_invalidation_listener(bus.subscribe());

        cache
            .insert(key("u1"), decision("u1", Outcome::Allow), vec!["r1".into()])
            .await;
        bus.send(InvalidationEvent::Role {
            role_id: "r1".into(),
        })
        .unwrap();

        // Listener runs on the runtime; give it a beat.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(cache.get(&key("u1")).await.is_none());
        handle.abort();
    }
}
