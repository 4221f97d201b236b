//! Optimistic mutations against the entity cache
//!
//! A mutation is applied to the cache before its request is sent, then either
//! committed or rolled back once the request settles:
//!
//! ```text
//! Applied --request settles--> Reconciling --ok--> Committed
//!                                          \--err-> RolledBack
//! ```
//!
//! Several mutations may be pending on the same entity. Each keeps the value
//! the entity had when it was applied. When one of them settles, the newer
//! ones covering the same key are rebased onto the value the entity must
//! return to, so a later rollback never resurrects a value that was itself
//! speculative.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use log::{debug, error, warn};

use crate::core::message::{Entity, EntityKey, EntityKind, IssueStatus, UserRef};
use crate::error::{Result, SyncError};
use crate::storage::cache::{CacheTarget, CollectionKey, SharedCache, Snapshot};

/// The optimistic operations the client supports
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mutation {
    LikePost { post_id: String },
    UnlikePost { post_id: String },
    BookmarkPost { post_id: String },
    UnbookmarkPost { post_id: String },
    SetIssueStatus { issue_id: String, status: IssueStatus },
    AddIssueLabel { issue_id: String, label: String },
    RemoveIssueLabel { issue_id: String, label: String },
    AssignIssue { issue_id: String, user: UserRef },
    UnassignIssue { issue_id: String, user_id: String },
    MarkNotificationRead { notification_id: String },
    MarkAllNotificationsRead,
}

impl Mutation {
    pub fn name(&self) -> &'static str {
        match self {
            Self::LikePost { .. } => "like_post",
            Self::UnlikePost { .. } => "unlike_post",
            Self::BookmarkPost { .. } => "bookmark_post",
            Self::UnbookmarkPost { .. } => "unbookmark_post",
            Self::SetIssueStatus { .. } => "set_issue_status",
            Self::AddIssueLabel { .. } => "add_issue_label",
            Self::RemoveIssueLabel { .. } => "remove_issue_label",
            Self::AssignIssue { .. } => "assign_issue",
            Self::UnassignIssue { .. } => "unassign_issue",
            Self::MarkNotificationRead { .. } => "mark_notification_read",
            Self::MarkAllNotificationsRead => "mark_all_notifications_read",
        }
    }

    /// Whether the speculative value depends on who performs the mutation
    pub fn needs_actor(&self) -> bool {
        matches!(
            self,
            Self::LikePost { .. }
                | Self::UnlikePost { .. }
                | Self::BookmarkPost { .. }
                | Self::UnbookmarkPost { .. }
        )
    }

    /// Cache keys this mutation may change. Mark-all covers every cached
    /// notification at the time it is applied.
    fn affected_keys(&self, cache: &SharedCache) -> Vec<EntityKey> {
        match self {
            Self::LikePost { post_id }
            | Self::UnlikePost { post_id }
            | Self::BookmarkPost { post_id }
            | Self::UnbookmarkPost { post_id } => vec![EntityKey::post(post_id)],
            Self::SetIssueStatus { issue_id, .. }
            | Self::AddIssueLabel { issue_id, .. }
            | Self::RemoveIssueLabel { issue_id, .. }
            | Self::AssignIssue { issue_id, .. }
            | Self::UnassignIssue { issue_id, .. } => vec![EntityKey::issue(issue_id)],
            Self::MarkNotificationRead { notification_id } => {
                vec![EntityKey::notification(notification_id)]
            }
            Self::MarkAllNotificationsRead => cache.keys_of(EntityKind::Notification),
        }
    }

    /// Collections whose authoritative contents may differ once the
    /// mutation has succeeded
    fn stale_collections(&self) -> Vec<CollectionKey> {
        match self {
            Self::LikePost { .. }
            | Self::UnlikePost { .. }
            | Self::BookmarkPost { .. }
            | Self::UnbookmarkPost { .. } => vec![CollectionKey::Posts],
            Self::SetIssueStatus { .. }
            | Self::AddIssueLabel { .. }
            | Self::RemoveIssueLabel { .. }
            | Self::AssignIssue { .. }
            | Self::UnassignIssue { .. } => vec![CollectionKey::Issues],
            Self::MarkNotificationRead { .. } | Self::MarkAllNotificationsRead => {
                vec![CollectionKey::Notifications]
            }
        }
    }

    /// Apply the speculative change to one entity
    fn apply(&self, entity: &mut Entity, actor: Option<&str>, at: DateTime<Utc>) {
        match (self, entity) {
            (Self::LikePost { .. }, Entity::Post(post)) => {
                if let Some(actor) = actor {
                    add_unique(&mut post.likes, actor);
                }
            }
            (Self::UnlikePost { .. }, Entity::Post(post)) => {
                if let Some(actor) = actor {
                    post.likes.retain(|id| id != actor);
                }
            }
            (Self::BookmarkPost { .. }, Entity::Post(post)) => {
                if let Some(actor) = actor {
                    add_unique(&mut post.bookmarks, actor);
                }
            }
            (Self::UnbookmarkPost { .. }, Entity::Post(post)) => {
                if let Some(actor) = actor {
                    post.bookmarks.retain(|id| id != actor);
                }
            }
            (Self::SetIssueStatus { status, .. }, Entity::Issue(issue)) => {
                issue.status = *status;
                if *status == IssueStatus::Closed {
                    issue.closed_at = Some(at);
                }
            }
            (Self::AddIssueLabel { label, .. }, Entity::Issue(issue)) => {
                add_unique(&mut issue.labels, label);
            }
            (Self::RemoveIssueLabel { label, .. }, Entity::Issue(issue)) => {
                issue.labels.retain(|l| l != label);
            }
            (Self::AssignIssue { user, .. }, Entity::Issue(issue)) => {
                if !issue.assignees.iter().any(|a| a.id == user.id) {
                    issue.assignees.push(user.clone());
                }
            }
            (Self::UnassignIssue { user_id, .. }, Entity::Issue(issue)) => {
                issue.assignees.retain(|a| &a.id != user_id);
            }
            (Self::MarkNotificationRead { .. }, Entity::Notification(n))
            | (Self::MarkAllNotificationsRead, Entity::Notification(n)) => {
                n.is_read = true;
            }
            (mutation, entity) => {
                warn!(
                    "{} does not apply to {}, leaving it unchanged",
                    mutation.name(),
                    entity.key()
                );
            }
        }
    }
}

fn add_unique(list: &mut Vec<String>, value: &str) {
    if !list.iter().any(|v| v == value) {
        list.push(value.to_string());
    }
}

/// Lifecycle of a speculative mutation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutationPhase {
    /// Speculative value is in the cache, request in flight
    Applied,
    /// Request settled, cache being reconciled
    Reconciling,
    Committed,
    RolledBack,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MutationId(u64);

#[derive(Debug)]
struct PendingMutation {
    id: MutationId,
    mutation: Mutation,
    actor: Option<String>,
    applied_at: DateTime<Utc>,
    snapshot: Snapshot,
    phase: MutationPhase,
}

impl PendingMutation {
    fn covers(&self, key: &EntityKey) -> bool {
        self.snapshot.iter().any(|(k, _)| k == key)
    }

    fn advance(&mut self, next: MutationPhase) {
        debug!("{:?} {}: {:?} -> {:?}", self.id, self.mutation.name(), self.phase, next);
        self.phase = next;
    }

    fn set_base(&mut self, key: &EntityKey, value: Option<Entity>) {
        if let Some(slot) = self.snapshot.iter_mut().find(|(k, _)| k == key) {
            slot.1 = value;
        }
    }

    /// Fold a settled mutation into the value this one would roll back to
    fn absorb(&mut self, key: &EntityKey, settled: &PendingMutation) {
        if let Some((_, Some(base))) = self.snapshot.iter_mut().find(|(k, _)| k == key) {
            settled
                .mutation
                .apply(base, settled.actor.as_deref(), settled.applied_at);
        }
    }
}

/// Runs speculative transactions against the shared cache
pub struct MutationEngine {
    cache: SharedCache,
    next_id: AtomicU64,
    // Ordered by id, oldest first
    pending: Mutex<Vec<PendingMutation>>,
}

impl MutationEngine {
    pub fn new(cache: SharedCache) -> Self {
        Self {
            cache,
            next_id: AtomicU64::new(0),
            pending: Mutex::new(Vec::new()),
        }
    }

    pub fn cache(&self) -> &SharedCache {
        &self.cache
    }

    /// Snapshot the affected keys and apply the speculative value
    pub fn begin(&self, mutation: Mutation, actor: Option<String>) -> Result<MutationId> {
        if mutation.needs_actor() && actor.is_none() {
            return Err(SyncError::AuthRequired);
        }

        let id = MutationId(self.next_id.fetch_add(1, Ordering::Relaxed) + 1);
        let applied_at = Utc::now();

        let mut pending = self.pending.lock()?;
        let keys = mutation.affected_keys(&self.cache);
        let snapshot = self.cache.snapshot(&keys)?;

        for (key, before) in &snapshot {
            if before.is_some() {
                self.cache
                    .update(key, |entity| mutation.apply(entity, actor.as_deref(), applied_at))?;
            }
        }

        debug!("{:?} {} applied to {} keys", id, mutation.name(), snapshot.len());
        pending.push(PendingMutation {
            id,
            mutation,
            actor,
            applied_at,
            snapshot,
            phase: MutationPhase::Applied,
        });
        Ok(id)
    }

    /// Settle a successful mutation. `authoritative` is the entity returned
    /// by the server, if any; it is written back unless another pending
    /// mutation still covers the same key.
    pub fn commit(&self, id: MutationId, authoritative: Option<Entity>) -> Result<MutationPhase> {
        let mut pending = self.pending.lock()?;
        let mut done = take_pending(&mut pending, id)?;
        done.advance(MutationPhase::Reconciling);

        for (key, _) in &done.snapshot {
            // Older mutations took their snapshot before this one applied
            for older in pending.iter_mut().filter(|m| m.id < done.id && m.covers(key)) {
                older.absorb(key, &done);
            }

            let server_value = authoritative.as_ref().filter(|e| &e.key() == key);
            let contested = pending.iter().any(|m| m.covers(key));

            match server_value {
                Some(entity) if !contested => self.cache.put(entity.clone())?,
                _ => self.cache.mark_stale(CacheTarget::Entity(key.clone()))?,
            }
        }

        for collection in done.mutation.stale_collections() {
            self.cache.mark_stale(CacheTarget::Collection(collection))?;
        }

        done.advance(MutationPhase::Committed);
        Ok(done.phase)
    }

    /// Settle a failed mutation: every key it touched returns to its
    /// pre-mutation value, with newer mutations on the same keys re-applied
    /// on top. All keys are restored in one cache write.
    pub fn rollback(&self, id: MutationId) -> Result<MutationPhase> {
        let mut pending = self.pending.lock()?;
        let mut done = take_pending(&mut pending, id)?;
        done.advance(MutationPhase::Reconciling);

        let mut restored: Snapshot = Vec::with_capacity(done.snapshot.len());
        for (key, base) in &done.snapshot {
            let mut value = base.clone();
            for newer in pending.iter_mut().filter(|m| m.id > done.id && m.covers(key)) {
                newer.set_base(key, value.clone());
                if let Some(entity) = value.as_mut() {
                    newer
                        .mutation
                        .apply(entity, newer.actor.as_deref(), newer.applied_at);
                }
            }
            restored.push((key.clone(), value));
        }

        self.cache.restore(&restored)?;
        done.advance(MutationPhase::RolledBack);
        Ok(done.phase)
    }

    /// Hand fetched entities to `write`. Entities with pending mutations
    /// become the new rollback base and are written with those mutations
    /// re-applied, so a late fetch never hides a speculative change.
    pub fn store_fetched<F>(&self, entities: Vec<Entity>, write: F) -> Result<()>
    where
        F: FnOnce(Vec<Entity>) -> Result<()>,
    {
        let mut pending = self.pending.lock()?;
        let merged = entities
            .into_iter()
            .map(|fetched| rebase_fetched(&mut pending, fetched))
            .collect();
        write(merged)
    }

    /// Settle a mutation from its request result, surfacing the request
    /// error after rollback
    pub fn settle(&self, id: MutationId, result: Result<Option<Entity>>) -> Result<()> {
        match result {
            Ok(authoritative) => {
                self.commit(id, authoritative)?;
                Ok(())
            }
            Err(e) => {
                if let Err(rollback_error) = self.rollback(id) {
                    error!("Failed to roll back {:?}: {}", id, rollback_error);
                }
                Err(e)
            }
        }
    }

    /// Apply `mutation`, run `request` and reconcile with its result.
    ///
    /// The request runs on its own task: dropping the returned future does
    /// not abort it, and the cache is still reconciled when it settles.
    pub async fn run<Fut>(self: &Arc<Self>, mutation: Mutation, actor: Option<String>, request: Fut) -> Result<()>
    where
        Fut: Future<Output = Result<Option<Entity>>> + Send + 'static,
    {
        let id = self.begin(mutation, actor)?;
        let engine = self.clone();

        tokio::spawn(async move {
            let result = request.await;
            engine.settle(id, result)
        })
        .await
        .map_err(|e| SyncError::StateLock(format!("Mutation task failed: {}", e)))?
    }

    pub fn phase(&self, id: MutationId) -> Option<MutationPhase> {
        self.pending
            .lock()
            .ok()?
            .iter()
            .find(|m| m.id == id)
            .map(|m| m.phase)
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().map(|p| p.len()).unwrap_or(0)
    }

    /// Pending mutations touching `key`
    pub fn pending_for(&self, key: &EntityKey) -> usize {
        self.pending
            .lock()
            .map(|p| p.iter().filter(|m| m.covers(key)).count())
            .unwrap_or(0)
    }
}

fn rebase_fetched(pending: &mut [PendingMutation], fetched: Entity) -> Entity {
    let key = fetched.key();
    let mut value = fetched;
    for mutation in pending.iter_mut().filter(|m| m.covers(&key)) {
        mutation.set_base(&key, Some(value.clone()));
        mutation
            .mutation
            .apply(&mut value, mutation.actor.as_deref(), mutation.applied_at);
    }
    value
}

fn take_pending(pending: &mut Vec<PendingMutation>, id: MutationId) -> Result<PendingMutation> {
    let index = pending
        .iter()
        .position(|m| m.id == id)
        .ok_or_else(|| SyncError::NotFound(format!("pending mutation {:?}", id)))?;
    Ok(pending.remove(index))
}

/// Thread-safe wrapper for MutationEngine
pub type SharedMutationEngine = Arc<MutationEngine>;
