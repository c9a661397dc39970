//! Message retrieval with a shared per-(chat, id) cache.
//!
//! Remote calls go through the [`RetryExecutor`]; anything that still fails is
//! reported to the [`ErrorClassifier`] and surfaces as an empty result.

use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use tokio::sync::Mutex;

use crate::{
    cache::{BoundedTtlCache, CacheStats},
    classifier::{context, ErrorClassifier},
    config::Config,
    domain::{ChatId, MediaKind, Message, MessageId},
    errors::Error,
    ports::ChatApi,
    retry::RetryExecutor,
};

/// Largest page requested from the history endpoint at once.
pub const HISTORY_PAGE: usize = 100;

type MessageKey = (ChatId, MessageId);

pub struct MessageFetcher {
    api: Arc<dyn ChatApi>,
    retry: Arc<RetryExecutor>,
    errors: Arc<ErrorClassifier>,
    cache: Mutex<BoundedTtlCache<MessageKey, Message>>,
    ttl: Duration,
    cache_enabled: AtomicBool,
}

impl MessageFetcher {
    pub fn new(
        api: Arc<dyn ChatApi>,
        retry: Arc<RetryExecutor>,
        errors: Arc<ErrorClassifier>,
        cfg: &Config,
    ) -> Self {
        Self {
            api,
            retry,
            errors,
            cache: Mutex::new(BoundedTtlCache::new(cfg.message_cache.capacity)),
            ttl: cfg.message_cache.ttl,
            cache_enabled: AtomicBool::new(cfg.cache_enabled),
        }
    }

    /// Toggling the flag drops every cached message: nothing is written while the
    /// cache is off, so entries from before the toggle may be stale.
    pub async fn set_cache_enabled(&self, enabled: bool) {
        let mut cache = self.cache.lock().await;
        if self.cache_enabled.swap(enabled, Ordering::Relaxed) != enabled {
            cache.clear();
            tracing::debug!(enabled, "message cache toggled, entries dropped");
        }
    }

    pub fn cache_enabled(&self) -> bool {
        self.cache_enabled.load(Ordering::Relaxed)
    }

    pub async fn clear_cache(&self) {
        self.cache.lock().await.clear();
    }

    pub async fn cache_stats(&self) -> CacheStats {
        self.cache.lock().await.stats()
    }

    pub async fn get_message(&self, chat_id: ChatId, id: MessageId) -> Option<Message> {
        if self.cache_enabled() {
            if let Some(hit) = self.cache.lock().await.get(&(chat_id, id)) {
                return Some(hit);
            }
        }

        match self
            .retry
            .execute("get_message", || self.api.get_message(chat_id, id))
            .await
        {
            Ok(Some(msg)) => {
                self.remember(std::slice::from_ref(&msg)).await;
                Some(msg)
            }
            Ok(None) => None,
            Err(err) => {
                self.report(&err, "get_message", chat_id, Some(id));
                None
            }
        }
    }

    /// One slot per requested id, in request order; missing or failed ids are `None`.
    pub async fn get_messages(&self, chat_id: ChatId, ids: &[MessageId]) -> Vec<Option<Message>> {
        let mut out = Vec::with_capacity(ids.len());
        for &id in ids {
            out.push(self.get_message(chat_id, id).await);
        }
        out
    }

    /// Newest first, ids strictly below `offset_id` when given. Empty on failure.
    pub async fn get_history(
        &self,
        chat_id: ChatId,
        limit: usize,
        offset_id: Option<MessageId>,
    ) -> Vec<Message> {
        if limit == 0 {
            return Vec::new();
        }
        match self.fetch_page(chat_id, limit, offset_id).await {
            Ok(page) => page,
            Err(err) => {
                self.report(&err, "get_history", chat_id, offset_id);
                Vec::new()
            }
        }
    }

    /// Messages with `start <= id <= end`, ascending by id.
    ///
    /// Pages backwards from `end` until it passes `start`, runs out of history or
    /// collects `limit` messages (default: the size of the range). A failure part-way
    /// returns what was collected so far.
    pub async fn get_range(
        &self,
        chat_id: ChatId,
        start: MessageId,
        end: MessageId,
        limit: Option<usize>,
    ) -> Vec<Message> {
        if start > end {
            return Vec::new();
        }
        let span = (i64::from(end.0) - i64::from(start.0) + 1) as usize;
        let limit = limit.unwrap_or(span).min(span);

        let mut out: Vec<Message> = Vec::new();
        let mut offset = Some(MessageId(end.0.saturating_add(1)));

        'pages: while out.len() < limit {
            let want = (limit - out.len()).min(HISTORY_PAGE);
            let page = match self.fetch_page(chat_id, want, offset).await {
                Ok(page) => page,
                Err(err) => {
                    self.report(&err, "get_range", chat_id, offset);
                    break;
                }
            };
            let Some(last) = page.last() else { break };
            offset = Some(last.id);

            for msg in page {
                if msg.id < start {
                    break 'pages;
                }
                if msg.id <= end {
                    out.push(msg);
                    if out.len() == limit {
                        break 'pages;
                    }
                }
            }
        }

        out.sort_by_key(|m| m.id);
        out
    }

    pub async fn search(&self, chat_id: ChatId, query: &str, limit: usize) -> Vec<Message> {
        match self
            .retry
            .execute("search", || self.api.search(chat_id, query, limit))
            .await
        {
            Ok(found) => {
                self.remember(&found).await;
                found
            }
            Err(err) => {
                let mut ctx = context([("operation", "search"), ("query", query)]);
                ctx.insert("chat_id".to_string(), chat_id.0.into());
                self.errors.handle(&err, ctx);
                Vec::new()
            }
        }
    }

    /// Up to `limit` recent messages carrying media, optionally restricted to `kinds`.
    ///
    /// Scans `2 * limit` history items, so sparse chats may yield fewer than `limit`.
    pub async fn get_media_messages(
        &self,
        chat_id: ChatId,
        limit: usize,
        kinds: Option<&[MediaKind]>,
    ) -> Vec<Message> {
        self.get_history(chat_id, limit.saturating_mul(2), None)
            .await
            .into_iter()
            .filter(|m| match (m.media, kinds) {
                (Some(kind), Some(allowed)) => allowed.contains(&kind),
                (Some(_), None) => true,
                (None, _) => false,
            })
            .take(limit)
            .collect()
    }

    async fn fetch_page(
        &self,
        chat_id: ChatId,
        limit: usize,
        offset_id: Option<MessageId>,
    ) -> crate::Result<Vec<Message>> {
        let page = self
            .retry
            .execute("get_history", || {
                self.api.get_history(chat_id, limit, offset_id)
            })
            .await?;
        self.remember(&page).await;
        Ok(page)
    }

    async fn remember(&self, msgs: &[Message]) {
        if !self.cache_enabled() || msgs.is_empty() {
            return;
        }
        let mut cache = self.cache.lock().await;
        for m in msgs {
            cache.put((m.chat_id, m.id), m.clone(), self.ttl);
        }
    }

    fn report(&self, err: &Error, op: &str, chat_id: ChatId, id: Option<MessageId>) {
        let mut ctx = context([("operation", op)]);
        ctx.insert("chat_id".to_string(), chat_id.0.into());
        if let Some(id) = id {
            ctx.insert("message_id".to_string(), id.0.into());
        }
        self.errors.handle(err, ctx);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{classifier, fast_retry, FakeApi};

    const CHAT: ChatId = ChatId(-100);

    fn seeded(n: i32) -> Arc<FakeApi> {
        let api = Arc::new(FakeApi::default());
        api.add_messages((1..=n).map(|i| {
            let m = Message::new(CHAT, MessageId(i)).with_text(format!("post {i}"));
            if i % 3 == 0 {
                m.with_media(MediaKind::Photo)
            } else if i % 5 == 0 {
                m.with_media(MediaKind::Video)
            } else {
                m
            }
        }));
        api
    }

    fn fetcher(api: Arc<FakeApi>) -> (MessageFetcher, Arc<ErrorClassifier>) {
        let errors = classifier();
        let f = MessageFetcher::new(api, fast_retry(), errors.clone(), &Config::default());
        (f, errors)
    }

    fn ids(msgs: &[Message]) -> Vec<i32> {
        msgs.iter().map(|m| m.id.0).collect()
    }

    #[tokio::test(start_paused = true)]
    async fn get_messages_keeps_request_order_and_gaps() {
        let api = seeded(5);
        let (f, _) = fetcher(api.clone());

        let got = f
            .get_messages(CHAT, &[MessageId(3), MessageId(99), MessageId(1)])
            .await;
        assert_eq!(got.len(), 3);
        assert_eq!(got[0].as_ref().map(|m| m.id), Some(MessageId(3)));
        assert!(got[1].is_none());
        assert_eq!(got[2].as_ref().map(|m| m.id), Some(MessageId(1)));
    }

    #[tokio::test(start_paused = true)]
    async fn repeated_reads_hit_the_cache() {
        let api = seeded(5);
        let (f, _) = fetcher(api.clone());

        f.get_message(CHAT, MessageId(2)).await.unwrap();
        f.get_message(CHAT, MessageId(2)).await.unwrap();
        assert_eq!(api.calls("get_message"), 1);
        assert_eq!(f.cache_stats().await.hits, 1);

        f.set_cache_enabled(false).await;
        f.get_message(CHAT, MessageId(2)).await.unwrap();
        assert_eq!(api.calls("get_message"), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn re_enabling_the_cache_does_not_serve_stale_copies() {
        let api = Arc::new(FakeApi::default());
        api.add_messages([Message::new(CHAT, MessageId(1)).with_text("v1")]);
        let (f, _) = fetcher(api.clone());

        let first = f.get_message(CHAT, MessageId(1)).await.unwrap();
        assert_eq!(first.text.as_deref(), Some("v1"));

        f.set_cache_enabled(false).await;
        assert_eq!(f.cache_stats().await.len, 0);
        api.add_messages([Message::new(CHAT, MessageId(1)).with_text("v2 edited")]);
        let while_off = f.get_message(CHAT, MessageId(1)).await.unwrap();
        assert_eq!(while_off.text.as_deref(), Some("v2 edited"));

        f.set_cache_enabled(true).await;
        let after = f.get_message(CHAT, MessageId(1)).await.unwrap();
        assert_eq!(after.text.as_deref(), Some("v2 edited"));
        assert_eq!(api.calls("get_message"), 3);

        // Setting the same value again keeps what is cached.
        f.set_cache_enabled(true).await;
        assert_eq!(f.cache_stats().await.len, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn history_back_fills_single_lookups() {
        let api = seeded(10);
        let (f, _) = fetcher(api.clone());

        let page = f.get_history(CHAT, 4, None).await;
        assert_eq!(ids(&page), vec![10, 9, 8, 7]);

        f.get_message(CHAT, MessageId(8)).await.unwrap();
        assert_eq!(api.calls("get_message"), 0);

        let older = f.get_history(CHAT, 2, Some(MessageId(7))).await;
        assert_eq!(ids(&older), vec![6, 5]);
    }

    #[tokio::test(start_paused = true)]
    async fn failures_become_empty_results() {
        let api = seeded(3);
        api.fail_next("get_history", Error::rpc(400, "CHANNEL_PRIVATE"));
        let (f, errors) = fetcher(api.clone());

        assert!(f.get_history(CHAT, 10, None).await.is_empty());
        let rec = errors.recent(1).pop().unwrap();
        assert_eq!(rec.context["operation"], serde_json::json!("get_history"));
        assert_eq!(rec.context["chat_id"], serde_json::json!(-100));
    }

    #[tokio::test(start_paused = true)]
    async fn range_is_inclusive_and_ascending() {
        let api = seeded(250);
        let (f, _) = fetcher(api.clone());

        let got = f.get_range(CHAT, MessageId(5), MessageId(9), None).await;
        assert_eq!(ids(&got), vec![5, 6, 7, 8, 9]);

        // Spans several pages.
        let before = api.calls("get_history");
        let wide = f.get_range(CHAT, MessageId(20), MessageId(240), None).await;
        assert_eq!(wide.len(), 221);
        assert_eq!(wide.first().map(|m| m.id.0), Some(20));
        assert_eq!(wide.last().map(|m| m.id.0), Some(240));
        assert_eq!(api.calls("get_history") - before, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn range_respects_limit_and_bounds() {
        let api = seeded(20);
        let (f, _) = fetcher(api.clone());

        // Limit keeps the newest end of the range.
        let got = f.get_range(CHAT, MessageId(1), MessageId(10), Some(3)).await;
        assert_eq!(ids(&got), vec![8, 9, 10]);

        assert!(f
            .get_range(CHAT, MessageId(9), MessageId(3), None)
            .await
            .is_empty());

        // Range past the end of history.
        let tail = f.get_range(CHAT, MessageId(18), MessageId(30), None).await;
        assert_eq!(ids(&tail), vec![18, 19, 20]);
    }

    #[tokio::test(start_paused = true)]
    async fn range_returns_partial_results_on_failure() {
        let api = seeded(250);
        api.pass_next("get_history");
        api.fail_next("get_history", Error::rpc(403, "CHAT_ADMIN_REQUIRED"));
        let (f, errors) = fetcher(api.clone());

        let got = f.get_range(CHAT, MessageId(1), MessageId(250), None).await;
        assert_eq!(got.len(), 100);
        assert_eq!(got.first().map(|m| m.id.0), Some(151));
        assert_eq!(errors.history_len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn media_messages_filter_by_kind() {
        let api = seeded(30);
        let (f, _) = fetcher(api.clone());

        let any = f.get_media_messages(CHAT, 5, None).await;
        assert!(any.iter().all(Message::has_media));
        assert!(any.len() <= 5);

        let videos = f
            .get_media_messages(CHAT, 10, Some(&[MediaKind::Video]))
            .await;
        // 20 newest items scanned: 25 and 20 are videos, 30 and 15 are photos.
        assert_eq!(ids(&videos), vec![25, 20]);
    }

    #[tokio::test(start_paused = true)]
    async fn search_matches_text() {
        let api = seeded(12);
        let (f, _) = fetcher(api.clone());
        let hits = f.search(CHAT, "POST 1", 10).await;
        assert_eq!(ids(&hits), vec![12, 11, 10, 1]);
    }
}
