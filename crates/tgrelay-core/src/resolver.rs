//! Channel lookups: name/link → id, metadata and the calling account's rights.
//!
//! Every remote-backed operation degrades to `None`/`false` after routing the
//! failure through the shared [`ErrorClassifier`].

use std::{collections::HashMap, sync::Arc, time::Duration};

use tokio::sync::Mutex;

use crate::{
    cache::BoundedTtlCache,
    classifier::{context, ErrorClassifier},
    config::Config,
    domain::{
        ChannelInfo, ChatId, ChatKind, MemberRole, Membership, Permission, PermissionCheck,
        PermissionSet,
    },
    errors::Error,
    ports::ChatApi,
    retry::RetryExecutor,
};

/// Rights an ordinary member of a group gets when the chat does not publish its own defaults.
pub fn default_member_permissions() -> PermissionSet {
    [
        Permission::ViewMessages,
        Permission::SendMessages,
        Permission::SendMedia,
        Permission::EmbedLinks,
        Permission::InviteUsers,
    ]
    .into_iter()
    .collect()
}

/// Effective rights of the calling account in a chat.
///
/// Roles carrying an explicit privilege set use it (administrators additionally keep
/// the member baseline); roles without one fall back to the chat's defaults.
pub fn derive_permissions(info: &ChannelInfo, membership: &Membership) -> PermissionSet {
    let baseline = match info.kind {
        // Broadcast subscribers can only read.
        ChatKind::Channel => PermissionSet::from([Permission::ViewMessages]),
        _ => info
            .default_permissions
            .clone()
            .unwrap_or_else(default_member_permissions),
    };

    match membership.role {
        MemberRole::Creator => Permission::ALL.into_iter().collect(),
        MemberRole::Left | MemberRole::Banned => PermissionSet::new(),
        MemberRole::Administrator => match &membership.privileges {
            Some(privileges) => baseline.union(privileges).copied().collect(),
            None => baseline,
        },
        MemberRole::Member | MemberRole::Restricted => {
            membership.privileges.clone().unwrap_or(baseline)
        }
    }
}

/// Id offset of supergroups/channels in the `-100…` form.
const CHANNEL_ID_BASE: i64 = 1_000_000_000_000;

fn strip_link_prefix(raw: &str) -> &str {
    let mut s = raw.trim();
    for prefix in ["https://", "http://"] {
        if let Some(rest) = s.strip_prefix(prefix) {
            s = rest;
        }
    }
    for prefix in ["www.", "t.me/", "telegram.me/"] {
        if let Some(rest) = s.strip_prefix(prefix) {
            s = rest;
        }
    }
    s
}

/// `t.me/c/<id>/<msg>` links address a channel by its bare id.
pub fn private_link_chat_id(raw: &str) -> Option<ChatId> {
    let rest = strip_link_prefix(raw).strip_prefix("c/")?;
    let bare: i64 = rest.split(['/', '?']).next()?.parse().ok()?;
    (bare > 0).then(|| ChatId(-(CHANNEL_ID_BASE + bare)))
}

/// Normalise `@name`, `t.me/name` and `https://t.me/name` to a bare username.
///
/// Invite links (`t.me/+hash`, `t.me/joinchat/…`), `t.me/c/…` links and anything
/// that is not a plausible username yield `None`.
pub fn normalize_username(raw: &str) -> Option<String> {
    let s = strip_link_prefix(raw).trim_start_matches('@');
    let name = s.split(['/', '?']).next().unwrap_or_default();

    let reserved = matches!(name, "c" | "joinchat" | "addlist" | "s");
    let valid = !name.is_empty()
        && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');
    if reserved || !valid {
        None
    } else {
        Some(name.to_string())
    }
}

pub struct ChannelResolver {
    api: Arc<dyn ChatApi>,
    retry: Arc<RetryExecutor>,
    errors: Arc<ErrorClassifier>,

    resolve_ttl: Duration,
    info_ttl: Duration,
    permission_ttl: Duration,

    resolved: Mutex<BoundedTtlCache<String, ChatId>>,
    info: Mutex<BoundedTtlCache<ChatId, ChannelInfo>>,
    permissions: Mutex<BoundedTtlCache<ChatId, PermissionSet>>,
}

impl ChannelResolver {
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
            resolve_ttl: cfg.resolve_cache.ttl,
            info_ttl: cfg.channel_cache.ttl,
            permission_ttl: cfg.permission_cache.ttl,
            resolved: Mutex::new(BoundedTtlCache::new(cfg.resolve_cache.capacity)),
            info: Mutex::new(BoundedTtlCache::new(cfg.channel_cache.capacity)),
            permissions: Mutex::new(BoundedTtlCache::new(cfg.permission_cache.capacity)),
        }
    }

    /// Numeric ids and `t.me/c/…` links parse directly; usernames are looked up remotely
    /// and cached by the raw input.
    pub async fn resolve(&self, name_or_id: &str) -> Option<ChatId> {
        let trimmed = name_or_id.trim();
        if let Ok(id) = trimmed.parse::<i64>() {
            return Some(ChatId(id));
        }
        if let Some(id) = private_link_chat_id(trimmed) {
            return Some(id);
        }

        if let Some(id) = self.resolved.lock().await.get(name_or_id) {
            return Some(id);
        }

        let username = normalize_username(trimmed)?;
        match self
            .retry
            .execute("resolve_username", || self.api.resolve_username(&username))
            .await
        {
            Ok(id) => {
                self.resolved
                    .lock()
                    .await
                    .put(name_or_id.to_string(), id, self.resolve_ttl);
                Some(id)
            }
            Err(err) => {
                self.report(&err, "resolve", None, Some(name_or_id));
                None
            }
        }
    }

    pub async fn resolve_many<S: AsRef<str>>(&self, inputs: &[S]) -> HashMap<String, Option<ChatId>> {
        let mut out = HashMap::with_capacity(inputs.len());
        for input in inputs {
            let input = input.as_ref();
            out.insert(input.to_string(), self.resolve(input).await);
        }
        out
    }

    pub async fn get_info(&self, chat_id: ChatId) -> Option<ChannelInfo> {
        if let Some(info) = self.info.lock().await.get(&chat_id) {
            return Some(info);
        }

        match self
            .retry
            .execute("get_chat", || self.api.get_chat(chat_id))
            .await
        {
            Ok(info) => {
                self.info
                    .lock()
                    .await
                    .put(chat_id, info.clone(), self.info_ttl);
                Some(info)
            }
            Err(err) => {
                self.report(&err, "get_info", Some(chat_id), None);
                None
            }
        }
    }

    pub async fn get_info_many(&self, ids: &[ChatId]) -> HashMap<ChatId, Option<ChannelInfo>> {
        let mut out = HashMap::with_capacity(ids.len());
        for &id in ids {
            out.insert(id, self.get_info(id).await);
        }
        out
    }

    /// Effective rights of the calling account, `None` if they could not be determined.
    pub async fn effective_permissions(&self, chat_id: ChatId) -> Option<PermissionSet> {
        if let Some(perms) = self.permissions.lock().await.get(&chat_id) {
            return Some(perms);
        }

        let info = self.get_info(chat_id).await?;
        let membership = match self
            .retry
            .execute("get_membership", || self.api.get_membership(chat_id))
            .await
        {
            Ok(m) => m,
            Err(err) => {
                self.report(&err, "check_permissions", Some(chat_id), None);
                return None;
            }
        };

        let perms = derive_permissions(&info, &membership);
        self.permissions
            .lock()
            .await
            .put(chat_id, perms.clone(), self.permission_ttl);
        Some(perms)
    }

    pub async fn check_permissions(
        &self,
        chat_id: ChatId,
        required: &PermissionSet,
    ) -> PermissionCheck {
        let Some(granted) = self.effective_permissions(chat_id).await else {
            return PermissionCheck::denied(required);
        };

        let missing: PermissionSet = required.difference(&granted).copied().collect();
        PermissionCheck {
            can_access: missing.is_empty(),
            missing,
        }
    }

    /// Whether the account may publish into `chat_id`. Private chats always can.
    pub async fn check_forward_permission(&self, chat_id: ChatId) -> bool {
        let Some(info) = self.get_info(chat_id).await else {
            return false;
        };

        let required = match info.kind {
            ChatKind::Private => return true,
            ChatKind::Channel => PermissionSet::from([Permission::PostMessages]),
            ChatKind::Group | ChatKind::Supergroup => {
                PermissionSet::from([Permission::SendMessages])
            }
        };
        self.check_permissions(chat_id, &required).await.can_access
    }

    pub async fn clear_cache(&self) {
        self.resolved.lock().await.clear();
        self.info.lock().await.clear();
        self.permissions.lock().await.clear();
    }

    pub async fn set_cache_capacity(&self, capacity: usize) {
        self.resolved.lock().await.set_capacity(capacity);
        self.info.lock().await.set_capacity(capacity);
        self.permissions.lock().await.set_capacity(capacity);
    }

    fn report(&self, err: &Error, op: &str, chat_id: Option<ChatId>, input: Option<&str>) {
        let mut ctx = context([("operation", op)]);
        if let Some(id) = chat_id {
            ctx.insert("chat_id".to_string(), id.0.into());
        }
        if let Some(raw) = input {
            ctx.insert("input".to_string(), raw.into());
        }
        self.errors.handle(err, ctx);
    }
}
