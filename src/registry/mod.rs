//! Tracking registry: which subscribers watch which targets.
//!
//! Data model:
//!   subscriber:{id}     → JSON SubscriberRecord   (forward index, source of truth)
//!   target:{address}    → JSON TargetRecord       (reverse index)
//!   handle:{handle}     → canonical address       (resolve-once memo)
//!   subscribers         → SET of subscriber ids
//!   watched_targets     → SET of addresses with at least one subscriber
//!   registry:pending    → SET of JSON intents     (see `journal`)
//!
//! The store has no cross-key transactions. Every mutation is journaled,
//! then applied forward → reverse → watch set with one compare-and-swap
//! per key, then the journal entry is cleared. A writer that dies midway
//! leaves its intent behind for `reconcile`. Reads only report an edge
//! when both indices agree on it, so a half-applied edge is invisible.

mod audit;
mod journal;

pub use audit::AuditReport;
pub use journal::{Intent, IntentOp, ReconcileReport};

use crate::cursor::{CursorError, CursorStore};
use crate::kv::{self, KvError, KvStore, Mutation, UpdateError};
use crate::resolver::{normalize_handle, HandleResolver, ResolveError};
use journal::Journal;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

const WATCHED_TARGETS: &str = "watched_targets";
const SUBSCRIBERS: &str = "subscribers";

fn subscriber_key(id: &str) -> String {
    format!("subscriber:{}", id)
}
fn target_key(address: &str) -> String {
    format!("target:{}", address)
}
fn handle_key(handle: &str) -> String {
    format!("handle:{}", handle)
}

#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("could not resolve handle: {0}")]
    Resolution(#[from] ResolveError),
    #[error("@{handle} now resolves to {resolved}, but is stored as {stored}")]
    ResolutionConflict {
        handle: String,
        stored: String,
        resolved: String,
    },
    #[error("index update on {key} could not be applied (retryable: {retryable})")]
    Conflict { key: String, retryable: bool },
    #[error("registry store error: {0}")]
    Store(#[from] KvError),
    #[error("corrupt registry record {key}: {reason}")]
    Corrupt { key: String, reason: String },
    #[error(transparent)]
    Cursor(#[from] CursorError),
}

impl From<UpdateError> for RegistryError {
    fn from(err: UpdateError) -> Self {
        match err {
            UpdateError::Kv(e) => RegistryError::Store(e),
            UpdateError::Corrupt { key, source } => RegistryError::Corrupt {
                key,
                reason: source.to_string(),
            },
            UpdateError::Contended { key, .. } => RegistryError::Conflict {
                key,
                retryable: true,
            },
        }
    }
}

/// What a subscribe/unsubscribe request names.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetSpec {
    Address(String),
    Handle(String),
}

impl TargetSpec {
    /// "@name" is always a handle; a base58 string of account length is an
    /// address; anything else is treated as a handle.
    pub fn parse(input: &str) -> Self {
        let input = input.trim();
        if input.starts_with('@') {
            return TargetSpec::Handle(normalize_handle(input));
        }
        let looks_like_address = (32..=44).contains(&input.len())
            && input
                .chars()
                .all(|c| c.is_ascii_alphanumeric() && !matches!(c, '0' | 'O' | 'I' | 'l'));
        if looks_like_address {
            TargetSpec::Address(input.to_string())
        } else {
            TargetSpec::Handle(normalize_handle(input))
        }
    }
}

/// Identity of a notification recipient, as supplied by the caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Profile {
    pub subscriber_id: String,
    pub delivery_address: String,
    pub display_name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Subscription {
    pub target: String,
    /// Handle the subscriber asked for, if any. Display only.
    #[serde(default)]
    pub handle: Option<String>,
    pub created_at: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubscriberRecord {
    pub subscriber_id: String,
    pub delivery_address: String,
    pub display_name: String,
    pub created_at: String,
    /// target address → subscription
    #[serde(default)]
    pub subscriptions: BTreeMap<String, Subscription>,
}

impl SubscriberRecord {
    fn profile(&self) -> Profile {
        Profile {
            subscriber_id: self.subscriber_id.clone(),
            delivery_address: self.delivery_address.clone(),
            display_name: self.display_name.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TargetRecord {
    pub address: String,
    #[serde(default)]
    pub handle: Option<String>,
    /// Minted when the first subscriber arrives; scopes the cursor.
    pub generation: String,
    pub created_at: String,
    #[serde(default)]
    pub subscribers: BTreeSet<String>,
}

impl TargetRecord {
    fn target(&self) -> Target {
        Target {
            address: self.address.clone(),
            handle: self.handle.clone(),
            generation: self.generation.clone(),
        }
    }
}

/// A watched account as seen by the monitor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Target {
    pub address: String,
    pub handle: Option<String>,
    pub generation: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum SubscribeOutcome {
    Added { target: Target },
    AlreadyTracking { target: Target },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum UnsubscribeOutcome {
    /// `collected` is set when this was the target's last subscriber.
    Removed { address: String, collected: bool },
    NotTracking,
}

#[derive(Clone)]
pub struct Registry {
    kv: Arc<dyn KvStore>,
    resolver: Arc<dyn HandleResolver>,
    cursors: CursorStore,
    journal: Journal,
}

impl Registry {
    pub fn new(kv: Arc<dyn KvStore>, resolver: Arc<dyn HandleResolver>, cursors: CursorStore) -> Self {
        Self {
            journal: Journal::new(kv.clone()),
            kv,
            resolver,
            cursors,
        }
    }

    // --- Mutations ---

    pub async fn subscribe(
        &self,
        profile: &Profile,
        spec: &TargetSpec,
    ) -> Result<SubscribeOutcome, RegistryError> {
        let (address, handle) = match spec {
            TargetSpec::Address(a) => (a.clone(), None),
            TargetSpec::Handle(h) => {
                let h = normalize_handle(h);
                (self.resolve_once(&h).await?, Some(h))
            }
        };

        let intent = Intent::new(IntentOp::Subscribe, &profile.subscriber_id, &address);
        let entry = self.journal.record(&intent).await?;

        let added = self.add_forward(profile, &address, handle.as_deref()).await?;
        // Even when already tracking, the reverse side is re-asserted: a
        // previous writer may have died between the two indices.
        let target = self
            .add_reverse(&profile.subscriber_id, &address, handle.as_deref())
            .await?;
        self.kv.add_to_set(WATCHED_TARGETS, &address).await?;
        self.journal.clear(&entry).await?;

        if added {
            info!(
                subscriber = %profile.subscriber_id,
                target = %address,
                handle = handle.as_deref().unwrap_or(""),
                "subscribed"
            );
            Ok(SubscribeOutcome::Added { target })
        } else {
            debug!(subscriber = %profile.subscriber_id, target = %address, "already tracking");
            Ok(SubscribeOutcome::AlreadyTracking { target })
        }
    }

    pub async fn unsubscribe(
        &self,
        subscriber_id: &str,
        spec: &TargetSpec,
    ) -> Result<UnsubscribeOutcome, RegistryError> {
        let address = match spec {
            TargetSpec::Address(a) => a.clone(),
            // Never resolve on unsubscribe: an unknown handle is simply untracked.
            TargetSpec::Handle(h) => match self.kv.get(&handle_key(&normalize_handle(h))).await? {
                Some(a) => a,
                None => return Ok(UnsubscribeOutcome::NotTracking),
            },
        };

        let intent = Intent::new(IntentOp::Unsubscribe, subscriber_id, &address);
        let entry = self.journal.record(&intent).await?;

        let removed = self.remove_forward(subscriber_id, &address).await?;
        if !removed {
            self.journal.clear(&entry).await?;
            return Ok(UnsubscribeOutcome::NotTracking);
        }
        let collected = self.remove_reverse(subscriber_id, &address).await?;
        self.journal.clear(&entry).await?;

        info!(subscriber = %subscriber_id, target = %address, collected, "unsubscribed");
        Ok(UnsubscribeOutcome::Removed { address, collected })
    }

    /// Re-resolve a memoized handle and fail if the answer moved.
    pub async fn verify_handle(&self, handle: &str) -> Result<Option<String>, RegistryError> {
        let handle = normalize_handle(handle);
        let stored = match self.kv.get(&handle_key(&handle)).await? {
            Some(a) => a,
            None => return Ok(None),
        };
        let resolved = self.resolver.resolve_fresh(&handle).await?;
        if resolved != stored {
            warn!(handle = %handle, stored = %stored, resolved = %resolved, "handle resolution moved");
            return Err(RegistryError::ResolutionConflict {
                handle,
                stored,
                resolved,
            });
        }
        Ok(Some(stored))
    }

    // --- Reads ---

    /// Subscribers of `address` whose forward record agrees.
    pub async fn subscribers_of(&self, address: &str) -> Result<Vec<Profile>, RegistryError> {
        let record: Option<TargetRecord> = kv::get_json(self.kv.as_ref(), &target_key(address)).await?;
        let Some(record) = record else {
            return Ok(Vec::new());
        };

        let mut out = Vec::with_capacity(record.subscribers.len());
        for sid in &record.subscribers {
            match self.subscriber(sid).await? {
                Some(sub) if sub.subscriptions.contains_key(address) => out.push(sub.profile()),
                _ => debug!(subscriber = %sid, target = %address, "skipping reverse-only edge"),
            }
        }
        Ok(out)
    }

    /// Targets of `subscriber_id` whose reverse record agrees.
    pub async fn targets_of(&self, subscriber_id: &str) -> Result<Vec<Target>, RegistryError> {
        let Some(sub) = self.subscriber(subscriber_id).await? else {
            return Ok(Vec::new());
        };

        let mut out = Vec::with_capacity(sub.subscriptions.len());
        for address in sub.subscriptions.keys() {
            match self.target_record(address).await? {
                Some(rec) if rec.subscribers.contains(subscriber_id) => out.push(rec.target()),
                _ => debug!(subscriber = %subscriber_id, target = %address, "skipping forward-only edge"),
            }
        }
        Ok(out)
    }

    /// Every target in the watch set that still has a record.
    pub async fn all_watched_targets(&self) -> Result<Vec<Target>, RegistryError> {
        let mut addresses = self.kv.members_of(WATCHED_TARGETS).await?;
        addresses.sort();

        let mut out = Vec::with_capacity(addresses.len());
        for address in addresses {
            match self.target_record(&address).await? {
                Some(rec) => out.push(rec.target()),
                None => self.unwatch(&address).await?,
            }
        }
        Ok(out)
    }

    pub async fn subscriber(&self, subscriber_id: &str) -> Result<Option<SubscriberRecord>, RegistryError> {
        Ok(kv::get_json(self.kv.as_ref(), &subscriber_key(subscriber_id)).await?)
    }

    pub async fn target_record(&self, address: &str) -> Result<Option<TargetRecord>, RegistryError> {
        Ok(kv::get_json(self.kv.as_ref(), &target_key(address)).await?)
    }

    // --- Steps ---

    /// Memoized handle lookup. The first caller to store the memo wins;
    /// a later lookup disagreeing with it is a conflict, never a rewrite.
    async fn resolve_once(&self, handle: &str) -> Result<String, RegistryError> {
        let key = handle_key(handle);
        if let Some(address) = self.kv.get(&key).await? {
            return Ok(address);
        }

        let resolved = self.resolver.resolve(handle).await?;
        if self.kv.compare_and_swap(&key, None, Some(&resolved)).await? {
            return Ok(resolved);
        }
        match self.kv.get(&key).await? {
            Some(stored) if stored == resolved => Ok(stored),
            Some(stored) => Err(RegistryError::ResolutionConflict {
                handle: handle.to_string(),
                stored,
                resolved,
            }),
            None => Err(RegistryError::Conflict { key, retryable: true }),
        }
    }

    /// Insert the edge into the subscriber's record. Returns false when it
    /// was already there.
    async fn add_forward(
        &self,
        profile: &Profile,
        address: &str,
        handle: Option<&str>,
    ) -> Result<bool, RegistryError> {
        let now = chrono::Utc::now().to_rfc3339();
        let subscription = Subscription {
            target: address.to_string(),
            handle: handle.map(str::to_string),
            created_at: now.clone(),
        };

        let key = subscriber_key(&profile.subscriber_id);
        let added = kv::update_json(self.kv.as_ref(), &key, |stored: Option<SubscriberRecord>| {
            let mut record = stored.unwrap_or_else(|| SubscriberRecord {
                subscriber_id: profile.subscriber_id.clone(),
                delivery_address: profile.delivery_address.clone(),
                display_name: profile.display_name.clone(),
                created_at: now.clone(),
                subscriptions: BTreeMap::new(),
            });
            if record.subscriptions.contains_key(address) {
                return Mutation::Keep(false);
            }
            record.delivery_address = profile.delivery_address.clone();
            record.display_name = profile.display_name.clone();
            record.subscriptions.insert(address.to_string(), subscription.clone());
            Mutation::Put(record, true)
        })
        .await?;

        if added {
            self.kv.add_to_set(SUBSCRIBERS, &profile.subscriber_id).await?;
        }
        Ok(added)
    }

    async fn remove_forward(&self, subscriber_id: &str, address: &str) -> Result<bool, RegistryError> {
        let key = subscriber_key(subscriber_id);
        let removed = kv::update_json(self.kv.as_ref(), &key, |stored: Option<SubscriberRecord>| {
            match stored {
                Some(mut record) if record.subscriptions.contains_key(address) => {
                    record.subscriptions.remove(address);
                    Mutation::Put(record, true)
                }
                _ => Mutation::Keep(false),
            }
        })
        .await?;
        Ok(removed)
    }

    /// Ensure `subscriber_id` is in the target's reverse set, creating the
    /// target (with a new generation) if needed.
    async fn add_reverse(
        &self,
        subscriber_id: &str,
        address: &str,
        handle: Option<&str>,
    ) -> Result<Target, RegistryError> {
        let key = target_key(address);
        let generation = uuid::Uuid::new_v4().to_string();
        let now = chrono::Utc::now().to_rfc3339();

        let target = kv::update_json(self.kv.as_ref(), &key, |stored: Option<TargetRecord>| {
            let mut record = stored.unwrap_or_else(|| TargetRecord {
                address: address.to_string(),
                handle: None,
                generation: generation.clone(),
                created_at: now.clone(),
                subscribers: BTreeSet::new(),
            });
            let mut changed = record.subscribers.insert(subscriber_id.to_string());
            if record.handle.is_none() && handle.is_some() {
                record.handle = handle.map(str::to_string);
                changed = true;
            }
            let target = record.target();
            if changed {
                Mutation::Put(record, target)
            } else {
                Mutation::Keep(target)
            }
        })
        .await?;
        Ok(target)
    }

    /// Drop `subscriber_id` from the reverse set. The last one out
    /// collects the target. Returns whether collection happened.
    async fn remove_reverse(&self, subscriber_id: &str, address: &str) -> Result<bool, RegistryError> {
        let key = target_key(address);
        let collected = kv::update_json(self.kv.as_ref(), &key, |stored: Option<TargetRecord>| {
            match stored {
                Some(mut record) if record.subscribers.contains(subscriber_id) => {
                    record.subscribers.remove(subscriber_id);
                    if record.subscribers.is_empty() {
                        Mutation::Delete(Some(record))
                    } else {
                        Mutation::Put(record, None)
                    }
                }
                _ => Mutation::Keep(None),
            }
        })
        .await?;

        match collected {
            Some(record) => {
                self.collect(&record).await?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Garbage-collect a target whose record was just deleted: leave the
    /// watch set, purge this generation's cursor, forget the handle memo.
    async fn collect(&self, record: &TargetRecord) -> Result<(), RegistryError> {
        self.unwatch(&record.address).await?;
        self.cursors
            .purge(&record.address, Some(&record.generation))
            .await?;
        if let Some(handle) = &record.handle {
            // A concurrent subscribe may have re-created the target through
            // this memo; it must outlive the old generation.
            if self.target_record(&record.address).await?.is_none() {
                self.kv
                    .compare_and_swap(&handle_key(handle), Some(&record.address), None)
                    .await?;
            }
        }
        info!(target = %record.address, generation = %record.generation, "target collected");
        Ok(())
    }

    /// Remove `address` from the watch set, unless a concurrent subscribe
    /// re-created its record in the meantime.
    async fn unwatch(&self, address: &str) -> Result<(), KvError> {
        self.kv.remove_from_set(WATCHED_TARGETS, address).await?;
        if self.kv.get(&target_key(address)).await?.is_some() {
            self.kv.add_to_set(WATCHED_TARGETS, address).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::MemoryStore;
    use crate::testing::StaticResolver;
    use std::time::Duration;

    const W: &str = "7xKXtg2CW87d97TXJSDpbD5jBkheTqA83TZRuJosgAsU";

    struct Fixture {
        kv: Arc<MemoryStore>,
        resolver: Arc<StaticResolver>,
        cursors: CursorStore,
        registry: Registry,
    }

    fn fixture() -> Fixture {
        let kv = Arc::new(MemoryStore::new());
        let resolver = Arc::new(StaticResolver::new(&[("alice", W)]));
        let cursors = CursorStore::new(kv.clone(), Duration::from_secs(30), 0);
        let registry = Registry::new(kv.clone(), resolver.clone(), cursors.clone());
        Fixture {
            kv,
            resolver,
            cursors,
            registry,
        }
    }

    fn profile(id: &str) -> Profile {
        Profile {
            subscriber_id: id.to_string(),
            delivery_address: format!("chat-{}", id),
            display_name: id.to_string(),
        }
    }

    async fn assert_indices_agree(registry: &Registry, subscribers: &[&str]) {
        for sid in subscribers {
            for target in registry.targets_of(sid).await.unwrap() {
                let subs = registry.subscribers_of(&target.address).await.unwrap();
                assert!(subs.iter().any(|p| p.subscriber_id == *sid));
            }
        }
        for target in registry.all_watched_targets().await.unwrap() {
            for sub in registry.subscribers_of(&target.address).await.unwrap() {
                let targets = registry.targets_of(&sub.subscriber_id).await.unwrap();
                assert!(targets.iter().any(|t| t.address == target.address));
            }
        }
    }

    #[test]
    fn test_target_spec_parse() {
        assert_eq!(TargetSpec::parse("@Alice"), TargetSpec::Handle("alice".into()));
        assert_eq!(TargetSpec::parse(W), TargetSpec::Address(W.into()));
        assert_eq!(TargetSpec::parse("bob"), TargetSpec::Handle("bob".into()));
    }

    #[tokio::test]
    async fn test_subscribe_twice_reports_already_tracking() {
        let f = fixture();
        let spec = TargetSpec::Address(W.into());
        let first = f.registry.subscribe(&profile("s1"), &spec).await.unwrap();
        let second = f.registry.subscribe(&profile("s1"), &spec).await.unwrap();
        assert!(matches!(first, SubscribeOutcome::Added { .. }));
        assert!(matches!(second, SubscribeOutcome::AlreadyTracking { .. }));
        assert_eq!(f.registry.all_watched_targets().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_unsubscribe_untracked_pair() {
        let f = fixture();
        let spec = TargetSpec::Address(W.into());
        assert_eq!(
            f.registry.unsubscribe("s1", &spec).await.unwrap(),
            UnsubscribeOutcome::NotTracking
        );
        // Unknown handle is not resolved on unsubscribe.
        let out = f
            .registry
            .unsubscribe("s1", &TargetSpec::Handle("alice".into()))
            .await
            .unwrap();
        assert_eq!(out, UnsubscribeOutcome::NotTracking);
        assert_eq!(f.resolver.calls(), 0);
    }

    #[tokio::test]
    async fn test_handle_resolved_once() {
        let f = fixture();
        let spec = TargetSpec::Handle("@alice".into());
        f.registry.subscribe(&profile("s1"), &spec).await.unwrap();
        f.registry.subscribe(&profile("s2"), &spec).await.unwrap();
        f.registry.subscribe(&profile("s1"), &spec).await.unwrap();
        assert_eq!(f.resolver.calls(), 1);

        let targets = f.registry.targets_of("s2").await.unwrap();
        assert_eq!(targets[0].address, W);
        assert_eq!(targets[0].handle.as_deref(), Some("alice"));
    }

    #[tokio::test]
    async fn test_unknown_handle_is_rejected() {
        let f = fixture();
        let err = f
            .registry
            .subscribe(&profile("s1"), &TargetSpec::Handle("ghost".into()))
            .await
            .unwrap_err();
        assert!(matches!(err, RegistryError::Resolution(ResolveError::NotFound(_))));
        assert!(f.registry.all_watched_targets().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_verify_handle_flags_moved_resolution() {
        let f = fixture();
        f.registry
            .subscribe(&profile("s1"), &TargetSpec::Handle("alice".into()))
            .await
            .unwrap();
        assert_eq!(f.registry.verify_handle("alice").await.unwrap().as_deref(), Some(W));

        f.resolver.set("alice", "OtherWa11etAddressxxxxxxxxxxxxxxxxxxx");
        let err = f.registry.verify_handle("alice").await.unwrap_err();
        assert!(matches!(err, RegistryError::ResolutionConflict { .. }));
        // The stored subscription is untouched.
        assert_eq!(f.registry.targets_of("s1").await.unwrap()[0].address, W);
    }

    #[tokio::test]
    async fn test_indices_agree_across_mutations() {
        let f = fixture();
        let other = "9WzDXwBbmkg8ZTbNMqUxvQRAyrZzDsGYdLVL9zYtAWWM";
        let w = TargetSpec::Address(W.into());
        let o = TargetSpec::Address(other.into());

        f.registry.subscribe(&profile("s1"), &w).await.unwrap();
        f.registry.subscribe(&profile("s2"), &w).await.unwrap();
        f.registry.subscribe(&profile("s2"), &o).await.unwrap();
        assert_indices_agree(&f.registry, &["s1", "s2"]).await;

        f.registry.unsubscribe("s2", &w).await.unwrap();
        assert_indices_agree(&f.registry, &["s1", "s2"]).await;
        let subs = f.registry.subscribers_of(W).await.unwrap();
        assert_eq!(subs.len(), 1);
        assert_eq!(subs[0].subscriber_id, "s1");

        assert_eq!(f.registry.targets_of("s2").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_half_applied_edge_is_invisible() {
        let f = fixture();
        // Forward edge written, writer died before the reverse index.
        f.registry.add_forward(&profile("s1"), W, None).await.unwrap();
        assert!(f.registry.targets_of("s1").await.unwrap().is_empty());
        assert!(f.registry.subscribers_of(W).await.unwrap().is_empty());

        // Re-subscribing heals it.
        let out = f
            .registry
            .subscribe(&profile("s1"), &TargetSpec::Address(W.into()))
            .await
            .unwrap();
        assert!(matches!(out, SubscribeOutcome::AlreadyTracking { .. }));
        assert_eq!(f.registry.targets_of("s1").await.unwrap().len(), 1);
        assert_eq!(f.registry.subscribers_of(W).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_last_unsubscribe_purges_cursor() {
        let f = fixture();
        let spec = TargetSpec::Handle("alice".into());
        let SubscribeOutcome::Added { target } = f.registry.subscribe(&profile("s1"), &spec).await.unwrap() else {
            panic!("expected Added");
        };
        f.cursors.advance(W, &target.generation, 1_700_000_000).await.unwrap();

        let out = f.registry.unsubscribe("s1", &spec).await.unwrap();
        assert_eq!(
            out,
            UnsubscribeOutcome::Removed {
                address: W.to_string(),
                collected: true
            }
        );
        assert!(f.registry.all_watched_targets().await.unwrap().is_empty());
        assert_eq!(f.kv.get(&handle_key("alice")).await.unwrap(), None);

        let SubscribeOutcome::Added { target: again } = f
            .registry
            .subscribe(&profile("s1"), &TargetSpec::Address(W.into()))
            .await
            .unwrap()
        else {
            panic!("expected Added");
        };
        assert_ne!(again.generation, target.generation);
        let cursor = f.cursors.get(W, &again.generation).await.unwrap();
        assert_eq!(cursor.last_checked_at, 0);
    }

    #[tokio::test]
    async fn test_stale_watch_entry_is_dropped_on_read() {
        let f = fixture();
        f.kv.add_to_set(WATCHED_TARGETS, "gone").await.unwrap();
        assert!(f.registry.all_watched_targets().await.unwrap().is_empty());
        assert!(f.kv.members_of(WATCHED_TARGETS).await.unwrap().is_empty());
    }
    #[tokio::test]
    async fn test_collect_keeps_memo_of_recreated_target() {
        let f = fixture();
        let spec = TargetSpec::Handle("alice".into());
        f.registry.subscribe(&profile("s1"), &spec).await.unwrap();
        let old = f.registry.target_record(W).await.unwrap().unwrap();

        // The target came back to life before the old collection ran.
        f.registry.subscribe(&profile("s2"), &spec).await.unwrap();
        f.registry.collect(&old).await.unwrap();

        assert_eq!(f.kv.get(&handle_key("alice")).await.unwrap().as_deref(), Some(W));
        assert!(f.registry.target_record(W).await.unwrap().is_some());
        let watched = f.registry.all_watched_targets().await.unwrap();
        assert_eq!(watched.len(), 1);
        assert_eq!(f.resolver.calls(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_churn_on_one_target_leaves_indices_clean() {
        let f = fixture();
        let registry = f.registry.clone();
        let spec = TargetSpec::Address(W.into());

        // Even subscribers end subscribed, odd ones end unsubscribed.
        let mut tasks = Vec::new();
        for i in 0..6 {
            let registry = registry.clone();
            let spec = spec.clone();
            tasks.push(tokio::spawn(async move {
                let sid = format!("s{}", i);
                for round in 0..10 {
                    registry.subscribe(&profile(&sid), &spec).await.unwrap();
                    if round < 9 || i % 2 == 1 {
                        registry.unsubscribe(&sid, &spec).await.unwrap();
                    }
                }
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        let audit = registry.audit().await.unwrap();
        assert!(audit.is_clean(), "{:?}", audit);
        assert_eq!(audit.pending_intents, 0);
        let mut subs: Vec<String> = registry
            .subscribers_of(W)
            .await
            .unwrap()
            .into_iter()
            .map(|p| p.subscriber_id)
            .collect();
        subs.sort();
        assert_eq!(subs, vec!["s0", "s2", "s4"]);

        // The remaining subscribers leave while a newcomer joins.
        let mut tasks = Vec::new();
        for sid in ["s0", "s2", "s4"] {
            let registry = registry.clone();
            let spec = spec.clone();
            tasks.push(tokio::spawn(async move {
                registry.unsubscribe(sid, &spec).await.unwrap();
            }));
        }
        {
            let registry = registry.clone();
            let spec = spec.clone();
            tasks.push(tokio::spawn(async move {
                registry.subscribe(&profile("late"), &spec).await.unwrap();
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        let audit = registry.audit().await.unwrap();
        assert!(audit.is_clean(), "{:?}", audit);
        assert_eq!(audit.pending_intents, 0);
        let subs = registry.subscribers_of(W).await.unwrap();
        assert_eq!(subs.len(), 1);
        assert_eq!(subs[0].subscriber_id, "late");
        let watched = registry.all_watched_targets().await.unwrap();
        assert_eq!(watched.iter().map(|t| t.address.as_str()).collect::<Vec<_>>(), vec![W]);
        assert!(f.kv.members_of(WATCHED_TARGETS).await.unwrap().contains(&W.to_string()));
    }
}
