//! In-memory `ChatApi` double shared by the resolver/fetcher tests.

use std::{
    collections::{BTreeMap, HashMap, VecDeque},
    sync::{Arc, Mutex},
    time::Duration,
};

use async_trait::async_trait;

use crate::{
    classifier::ErrorClassifier,
    domain::{ChannelInfo, ChatId, ChatKind, Membership, Message, MessageId},
    errors::Error,
    ports::ChatApi,
    retry::{RetryExecutor, RetryPolicy},
    Result,
};

#[derive(Default)]
pub(crate) struct FakeApi {
    pub chats: Mutex<HashMap<ChatId, ChannelInfo>>,
    pub usernames: Mutex<HashMap<String, ChatId>>,
    pub memberships: Mutex<HashMap<ChatId, Membership>>,
    pub messages: Mutex<BTreeMap<(ChatId, MessageId), Message>>,
    failures: Mutex<HashMap<&'static str, VecDeque<Option<Error>>>>,
    calls: Mutex<HashMap<&'static str, usize>>,
}

impl FakeApi {
    pub fn add_chat(&self, id: i64, kind: ChatKind, title: &str) {
        self.chats.lock().unwrap().insert(
            ChatId(id),
            ChannelInfo {
                id: ChatId(id),
                title: title.to_string(),
                kind,
                username: None,
                member_count: Some(10),
                flags: Default::default(),
                default_permissions: None,
            },
        );
    }

    pub fn add_messages(&self, msgs: impl IntoIterator<Item = Message>) {
        let mut map = self.messages.lock().unwrap();
        for m in msgs {
            map.insert((m.chat_id, m.id), m);
        }
    }

    /// Queue an error returned by the next call(s) to `op`.
    pub fn fail_next(&self, op: &'static str, err: Error) {
        self.failures
            .lock()
            .unwrap()
            .entry(op)
            .or_default()
            .push_back(Some(err));
    }

    /// Let the next queued call to `op` through; pairs with `fail_next` to fail a later call.
    pub fn pass_next(&self, op: &'static str) {
        self.failures
            .lock()
            .unwrap()
            .entry(op)
            .or_default()
            .push_back(None);
    }

    pub fn calls(&self, op: &str) -> usize {
        self.calls.lock().unwrap().get(op).copied().unwrap_or(0)
    }

    fn enter(&self, op: &'static str) -> Result<()> {
        *self.calls.lock().unwrap().entry(op).or_default() += 1;
        match self
            .failures
            .lock()
            .unwrap()
            .get_mut(op)
            .and_then(|q| q.pop_front())
            .flatten()
        {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl ChatApi for FakeApi {
    async fn resolve_username(&self, username: &str) -> Result<ChatId> {
        self.enter("resolve_username")?;
        self.usernames
            .lock()
            .unwrap()
            .get(username)
            .copied()
            .ok_or_else(|| Error::rpc(400, "USERNAME_NOT_OCCUPIED"))
    }

    async fn get_chat(&self, chat_id: ChatId) -> Result<ChannelInfo> {
        self.enter("get_chat")?;
        self.chats
            .lock()
            .unwrap()
            .get(&chat_id)
            .cloned()
            .ok_or_else(|| Error::rpc(400, "CHANNEL_INVALID"))
    }

    async fn get_membership(&self, chat_id: ChatId) -> Result<Membership> {
        self.enter("get_membership")?;
        self.memberships
            .lock()
            .unwrap()
            .get(&chat_id)
            .cloned()
            .ok_or_else(|| Error::rpc(400, "USER_NOT_PARTICIPANT"))
    }

    async fn get_message(&self, chat_id: ChatId, id: MessageId) -> Result<Option<Message>> {
        self.enter("get_message")?;
        Ok(self.messages.lock().unwrap().get(&(chat_id, id)).cloned())
    }

    async fn get_history(
        &self,
        chat_id: ChatId,
        limit: usize,
        offset_id: Option<MessageId>,
    ) -> Result<Vec<Message>> {
        self.enter("get_history")?;
        let map = self.messages.lock().unwrap();
        Ok(map
            .range((chat_id, MessageId(i32::MIN))..=(chat_id, MessageId(i32::MAX)))
            .rev()
            .map(|(_, m)| m)
            .filter(|m| offset_id.map_or(true, |off| m.id < off))
            .take(limit)
            .cloned()
            .collect())
    }

    async fn search(&self, chat_id: ChatId, query: &str, limit: usize) -> Result<Vec<Message>> {
        self.enter("search")?;
        let needle = query.to_lowercase();
        let map = self.messages.lock().unwrap();
        Ok(map
            .values()
            .rev()
            .filter(|m| m.chat_id == chat_id)
            .filter(|m| {
                m.text_content()
                    .is_some_and(|t| t.to_lowercase().contains(&needle))
            })
            .take(limit)
            .cloned()
            .collect())
    }
}

pub(crate) fn fast_retry() -> Arc<RetryExecutor> {
    Arc::new(RetryExecutor::new(RetryPolicy {
        max_retries: 2,
        base_delay: Duration::from_millis(10),
        max_delay: Duration::from_millis(40),
        max_flood_wait: None,
    }))
}

pub(crate) fn classifier() -> Arc<ErrorClassifier> {
    Arc::new(ErrorClassifier::new(100))
}
