use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Telegram user id (numeric).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct UserId(pub i64);

/// Telegram chat id (numeric, channels carry the `-100` prefix).
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct ChatId(pub i64);

/// Telegram message id (numeric, increasing within a chat).
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct MessageId(pub i32);

/// A stable reference to a Telegram message.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct MessageRef {
    pub chat_id: ChatId,
    pub message_id: MessageId,
}

// ============== Messages ==============

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaKind {
    Photo,
    Video,
    Audio,
    Voice,
    VideoNote,
    Document,
    Animation,
    Sticker,
    Contact,
    Location,
    Poll,
    WebPage,
}

impl MediaKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Photo => "photo",
            Self::Video => "video",
            Self::Audio => "audio",
            Self::Voice => "voice",
            Self::VideoNote => "video_note",
            Self::Document => "document",
            Self::Animation => "animation",
            Self::Sticker => "sticker",
            Self::Contact => "contact",
            Self::Location => "location",
            Self::Poll => "poll",
            Self::WebPage => "web_page",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Url,
    TextLink,
    Mention,
    Hashtag,
    Bold,
    Italic,
    Code,
    Pre,
    Other,
}

/// Formatting/annotation span over the message text (UTF-16 offsets, as the platform sends them).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageEntity {
    pub kind: EntityKind,
    pub offset: usize,
    pub length: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

/// Where a forwarded message originally came from.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ForwardOrigin {
    User(UserId),
    Chat(ChatId),
    /// Sender hid their account; only a display name is known.
    Hidden(String),
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub chat_id: ChatId,
    #[serde(default)]
    pub date: Option<DateTime<Utc>>,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub caption: Option<String>,
    #[serde(default)]
    pub media: Option<MediaKind>,
    #[serde(default)]
    pub media_group_id: Option<String>,
    #[serde(default)]
    pub forward: Option<ForwardOrigin>,
    #[serde(default)]
    pub reply_to: Option<MessageId>,
    #[serde(default)]
    pub entities: Vec<MessageEntity>,
}

impl Message {
    pub fn new(chat_id: ChatId, id: MessageId) -> Self {
        Self {
            id,
            chat_id,
            ..Default::default()
        }
    }

    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.text = Some(text.into());
        self
    }

    pub fn with_caption(mut self, caption: impl Into<String>) -> Self {
        self.caption = Some(caption.into());
        self
    }

    pub fn with_media(mut self, media: MediaKind) -> Self {
        self.media = Some(media);
        self
    }

    pub fn with_group(mut self, group_id: impl Into<String>) -> Self {
        self.media_group_id = Some(group_id.into());
        self
    }

    pub fn reference(&self) -> MessageRef {
        MessageRef {
            chat_id: self.chat_id,
            message_id: self.id,
        }
    }

    /// Text body for plain messages, caption for media messages.
    pub fn text_content(&self) -> Option<&str> {
        self.text
            .as_deref()
            .filter(|t| !t.is_empty())
            .or_else(|| self.caption.as_deref().filter(|c| !c.is_empty()))
    }

    pub fn has_media(&self) -> bool {
        self.media.is_some()
    }

    pub fn is_forward(&self) -> bool {
        self.forward.is_some()
    }

    pub fn is_reply(&self) -> bool {
        self.reply_to.is_some()
    }

    /// Group id, ignoring empty strings some clients send for ungrouped media.
    pub fn group_id(&self) -> Option<&str> {
        self.media_group_id.as_deref().filter(|g| !g.is_empty())
    }
}

// ============== Chats ==============

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChatKind {
    Private,
    Group,
    Supergroup,
    Channel,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelFlags {
    pub verified: bool,
    pub restricted: bool,
    pub scam: bool,
    /// Content may not be forwarded or saved (`noforwards`).
    pub protected_content: bool,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelInfo {
    pub id: ChatId,
    pub title: String,
    pub kind: ChatKind,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub member_count: Option<u32>,
    #[serde(default)]
    pub flags: ChannelFlags,
    /// Rights every ordinary member gets, when the chat publishes them.
    #[serde(default)]
    pub default_permissions: Option<PermissionSet>,
}

// ============== Permissions ==============

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Permission {
    ViewMessages,
    SendMessages,
    SendMedia,
    EmbedLinks,
    PostMessages,
    EditMessages,
    DeleteMessages,
    PinMessages,
    InviteUsers,
    BanUsers,
    ChangeInfo,
    AddAdmins,
}

impl Permission {
    pub const ALL: [Permission; 12] = [
        Permission::ViewMessages,
        Permission::SendMessages,
        Permission::SendMedia,
        Permission::EmbedLinks,
        Permission::PostMessages,
        Permission::EditMessages,
        Permission::DeleteMessages,
        Permission::PinMessages,
        Permission::InviteUsers,
        Permission::BanUsers,
        Permission::ChangeInfo,
        Permission::AddAdmins,
    ];
}

pub type PermissionSet = BTreeSet<Permission>;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemberRole {
    Creator,
    Administrator,
    Member,
    Restricted,
    Left,
    Banned,
}

/// The calling account's membership in a chat.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Membership {
    pub role: MemberRole,
    /// Explicit privilege set carried by the role (admin rights, restriction overrides).
    #[serde(default)]
    pub privileges: Option<PermissionSet>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PermissionCheck {
    pub can_access: bool,
    pub missing: PermissionSet,
}

impl PermissionCheck {
    pub fn denied(required: &PermissionSet) -> Self {
        Self {
            can_access: false,
            missing: required.clone(),
        }
    }
}
