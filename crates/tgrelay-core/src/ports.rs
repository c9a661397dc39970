use async_trait::async_trait;

use crate::{
    domain::{ChannelInfo, ChatId, Membership, Message, MessageId},
    Result,
};

/// Hexagonal port for the remote chat platform.
///
/// The platform client (MTProto session, bot API, test double) implements this; the
/// retrieval layer never talks to the network directly. Implementations should map
/// flood-control responses to `Error::RateLimited` (or leave the raw `FLOOD_WAIT_<n>`
/// RPC string in `Error::Rpc`) so the retry layer can honour them.
#[async_trait]
pub trait ChatApi: Send + Sync {
    /// Look up a public username (without the leading `@`).
    async fn resolve_username(&self, username: &str) -> Result<ChatId>;

    async fn get_chat(&self, chat_id: ChatId) -> Result<ChannelInfo>;

    /// The calling account's membership in `chat_id`.
    async fn get_membership(&self, chat_id: ChatId) -> Result<Membership>;

    /// `Ok(None)` when the message was deleted or never existed.
    async fn get_message(&self, chat_id: ChatId, id: MessageId) -> Result<Option<Message>>;

    /// Newest-first page of history. When `offset_id` is set only ids strictly below it
    /// are returned.
    async fn get_history(
        &self,
        chat_id: ChatId,
        limit: usize,
        offset_id: Option<MessageId>,
    ) -> Result<Vec<Message>>;

    async fn search(&self, chat_id: ChatId, query: &str, limit: usize) -> Result<Vec<Message>>;
}
