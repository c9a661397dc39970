//! Reassembly of multi-part ("album") posts.
//!
//! Fragments sharing a group id arrive as independent updates. The aggregator buffers
//! them per group id and hands the whole group back once the completion policy says
//! it is done. A completed id is remembered for a while so stragglers are surfaced
//! as [`GroupPush::Late`] instead of silently opening a second group.

use std::{collections::HashMap, time::Duration};

use tokio::time::Instant;

use crate::{cache::BoundedTtlCache, domain::Message};

/// Decides when a pending group holds every fragment.
///
/// The platform gives no per-fragment "last one" marker, so the default is a
/// fragment-count heuristic. Callers with an authoritative album size should use
/// [`ExpectedSize`] or their own closure.
pub trait CompletionPolicy: Send + Sync {
    fn is_complete(&self, fragments: &[Message]) -> bool;
}

impl<F> CompletionPolicy for F
where
    F: Fn(&[Message]) -> bool + Send + Sync,
{
    fn is_complete(&self, fragments: &[Message]) -> bool {
        self(fragments)
    }
}

/// Complete once strictly more than `n` fragments have arrived.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MinFragments(pub usize);

impl Default for MinFragments {
    fn default() -> Self {
        Self(2)
    }
}

impl CompletionPolicy for MinFragments {
    fn is_complete(&self, fragments: &[Message]) -> bool {
        fragments.len() > self.0
    }
}

/// Complete once exactly the announced number of fragments is present.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ExpectedSize(pub usize);

impl CompletionPolicy for ExpectedSize {
    fn is_complete(&self, fragments: &[Message]) -> bool {
        fragments.len() >= self.0
    }
}

#[derive(Clone, Debug)]
pub struct PendingGroup<C> {
    pub group_id: String,
    /// Arrival order.
    pub messages: Vec<Message>,
    pub first_seen_at: Instant,
    pub last_seen_at: Instant,
    /// Configuration of the pair the first fragment arrived for.
    pub config: C,
}

#[derive(Clone, Debug)]
pub struct CompletedGroup<C> {
    pub group_id: String,
    pub messages: Vec<Message>,
    pub config: C,
}

impl<C> From<PendingGroup<C>> for CompletedGroup<C> {
    fn from(g: PendingGroup<C>) -> Self {
        Self {
            group_id: g.group_id,
            messages: g.messages,
            config: g.config,
        }
    }
}

#[derive(Clone, Debug)]
pub enum GroupPush<C> {
    /// No group id: the message is its own unit.
    Bypass(Message, C),
    /// Buffered; `fragments` is the current group size.
    Pending { group_id: String, fragments: usize },
    Complete(CompletedGroup<C>),
    /// Fragment for a group that was already emitted.
    Late(Message, C),
}

const COMPLETED_MEMORY: usize = 1024;
const COMPLETED_TTL: Duration = Duration::from_secs(600);

pub struct MediaGroupAggregator<C> {
    pending: HashMap<String, PendingGroup<C>>,
    completed: BoundedTtlCache<String, ()>,
    policy: Box<dyn CompletionPolicy>,
}

impl<C> Default for MediaGroupAggregator<C> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C> MediaGroupAggregator<C> {
    pub fn new() -> Self {
        Self::with_policy(MinFragments::default())
    }

    pub fn with_policy(policy: impl CompletionPolicy + 'static) -> Self {
        Self {
            pending: HashMap::new(),
            completed: BoundedTtlCache::new(COMPLETED_MEMORY),
            policy: Box::new(policy),
        }
    }

    pub fn push(&mut self, msg: Message, config: C) -> GroupPush<C> {
        self.push_at(msg, config, Instant::now())
    }

    pub fn push_at(&mut self, msg: Message, config: C, now: Instant) -> GroupPush<C> {
        let Some(group_id) = msg.group_id().map(str::to_string) else {
            return GroupPush::Bypass(msg, config);
        };

        if self.completed.contains_fresh_at(group_id.as_str(), now) {
            tracing::debug!(%group_id, message_id = msg.id.0, "fragment for completed group");
            return GroupPush::Late(msg, config);
        }

        let group = self
            .pending
            .entry(group_id.clone())
            .or_insert_with(|| PendingGroup {
                group_id: group_id.clone(),
                messages: Vec::new(),
                first_seen_at: now,
                last_seen_at: now,
                config,
            });

        if group.messages.iter().any(|m| m.id == msg.id) {
            tracing::debug!(%group_id, message_id = msg.id.0, "duplicate fragment ignored");
            return GroupPush::Pending {
                group_id,
                fragments: group.messages.len(),
            };
        }

        group.messages.push(msg);
        group.last_seen_at = now;

        if !self.policy.is_complete(&group.messages) {
            return GroupPush::Pending {
                fragments: group.messages.len(),
                group_id,
            };
        }

        match self.finish(&group_id, now) {
            Some(done) => GroupPush::Complete(done),
            None => GroupPush::Pending {
                group_id,
                fragments: 0,
            },
        }
    }

    /// Remove and return a pending group regardless of the policy (external "album done" signal).
    pub fn take(&mut self, group_id: &str) -> Option<CompletedGroup<C>> {
        self.finish(group_id, Instant::now())
    }

    pub fn get(&self, group_id: &str) -> Option<&PendingGroup<C>> {
        self.pending.get(group_id)
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Flush groups that have not received a fragment for `max_idle`.
    ///
    /// Not called by the aggregator itself; the default behaviour holds incomplete
    /// groups indefinitely.
    pub fn drain_idle(&mut self, max_idle: Duration, now: Instant) -> Vec<CompletedGroup<C>> {
        let mut idle: Vec<(Instant, String)> = self
            .pending
            .values()
            .filter(|g| now.saturating_duration_since(g.last_seen_at) >= max_idle)
            .map(|g| (g.first_seen_at, g.group_id.clone()))
            .collect();
        idle.sort();

        idle.into_iter()
            .filter_map(|(_, id)| self.finish(&id, now))
            .collect()
    }

    fn finish(&mut self, group_id: &str, now: Instant) -> Option<CompletedGroup<C>> {
        let group = self.pending.remove(group_id)?;
        self.completed
            .put_at(group_id.to_string(), (), COMPLETED_TTL, now);
        tracing::debug!(
            group_id,
            fragments = group.messages.len(),
            "media group complete"
        );
        Some(group.into())
    }
}
