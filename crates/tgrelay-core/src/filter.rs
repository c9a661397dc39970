//! Per-pair message filtering and text rewriting.
//!
//! Stages run in order and stop at the first rejection:
//! 1. universal exclusions (forwards, replies, text-only, links)
//! 2. keyword inclusion
//! 3. media-type inclusion
//!
//! The text transform is computed independently of the verdict so callers can
//! audit what *would* have been sent.

use std::sync::{Arc, OnceLock};

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::domain::{EntityKind, MediaKind, Message, MessageId};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TextReplacement {
    pub find: String,
    pub replace: String,
}

/// Filter settings for one source→target pair.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FilterConfig {
    pub exclude_forwards: bool,
    pub exclude_replies: bool,
    pub exclude_text_only: bool,
    pub exclude_links: bool,
    pub keywords: Vec<String>,
    pub media_types: Vec<MediaKind>,
    /// Applied in order, each to the output of the previous one.
    pub text_replacements: Vec<TextReplacement>,
    /// Drop the caption entirely when the message carries media.
    pub strip_caption: bool,
}

impl FilterConfig {
    pub fn with_replacements<'a>(
        mut self,
        pairs: impl IntoIterator<Item = (&'a str, &'a str)>,
    ) -> Self {
        self.text_replacements
            .extend(pairs.into_iter().map(|(find, replace)| TextReplacement {
                find: find.to_string(),
                replace: replace.to_string(),
            }));
        self
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum FilterStage {
    UniversalExclusions,
    Keywords,
    MediaTypes,
    TextTransform,
}

impl FilterStage {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::UniversalExclusions => "universal_exclusions",
            Self::Keywords => "keywords",
            Self::MediaTypes => "media_types",
            Self::TextTransform => "text_transform",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FilterDecision {
    Pass,
    Reject { stage: FilterStage, reason: String },
}

impl FilterDecision {
    pub fn passed(&self) -> bool {
        matches!(self, Self::Pass)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FilterOutcome {
    pub decision: FilterDecision,
    /// Text to publish (after replacements / caption stripping).
    pub text: Option<String>,
    pub has_replacement: bool,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FilterEvent {
    Rejected {
        message_id: MessageId,
        stage: FilterStage,
        reason: String,
    },
    Transformed {
        message_id: MessageId,
        stage: FilterStage,
        before: Option<String>,
        after: Option<String>,
    },
}

/// Receives filter decisions for auditing. Must not block.
pub trait FilterObserver: Send + Sync {
    fn on_filter(&self, event: &FilterEvent);
}

#[derive(Clone, Copy, Debug, Default)]
pub struct TracingFilterObserver;

impl FilterObserver for TracingFilterObserver {
    fn on_filter(&self, event: &FilterEvent) {
        match event {
            FilterEvent::Rejected {
                message_id,
                stage,
                reason,
            } => tracing::debug!(
                message_id = message_id.0,
                stage = stage.as_str(),
                %reason,
                "message filtered"
            ),
            FilterEvent::Transformed {
                message_id,
                stage,
                before,
                after,
            } => tracing::debug!(
                message_id = message_id.0,
                stage = stage.as_str(),
                before = ?before,
                after = ?after,
                "message text transformed"
            ),
        }
    }
}

fn link_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| Regex::new(r"(?i)\b(?:https?://|www\.)\S+|\bt(?:elegram)?\.me/\S+").ok())
        .as_ref()
}

pub fn contains_link(msg: &Message) -> bool {
    if msg
        .entities
        .iter()
        .any(|e| matches!(e.kind, EntityKind::Url | EntityKind::TextLink))
    {
        return true;
    }

    let Some(pattern) = link_pattern() else {
        return false;
    };
    [msg.text.as_deref(), msg.caption.as_deref()]
        .into_iter()
        .flatten()
        .any(|t| pattern.is_match(t))
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TransformedText {
    pub text: Option<String>,
    pub has_replacement: bool,
}

/// Apply ordered find→replace pairs. Empty `find` strings are ignored.
pub fn apply_replacements(text: &str, replacements: &[TextReplacement]) -> TransformedText {
    let mut out = text.to_string();
    let mut has_replacement = false;
    for r in replacements {
        if r.find.is_empty() || !out.contains(&r.find) {
            continue;
        }
        out = out.replace(&r.find, &r.replace);
        has_replacement = true;
    }
    TransformedText {
        text: Some(out),
        has_replacement,
    }
}

pub struct MessageFilterPipeline {
    config: FilterConfig,
    keywords_lower: Vec<String>,
    observer: Arc<dyn FilterObserver>,
}

impl MessageFilterPipeline {
    pub fn new(config: FilterConfig) -> Self {
        let keywords_lower = config
            .keywords
            .iter()
            .map(|k| k.trim().to_lowercase())
            .filter(|k| !k.is_empty())
            .collect();
        Self {
            config,
            keywords_lower,
            observer: Arc::new(TracingFilterObserver),
        }
    }

    pub fn with_observer(mut self, observer: Arc<dyn FilterObserver>) -> Self {
        self.observer = observer;
        self
    }

    pub fn config(&self) -> &FilterConfig {
        &self.config
    }

    /// Run the accept/reject stages and compute the outgoing text.
    pub fn process(&self, msg: &Message) -> FilterOutcome {
        let decision = self.evaluate(msg);
        let transformed = self.transform(msg);
        FilterOutcome {
            decision,
            text: transformed.text,
            has_replacement: transformed.has_replacement,
        }
    }

    pub fn evaluate(&self, msg: &Message) -> FilterDecision {
        let stages: [(FilterStage, fn(&Self, &Message) -> Option<String>); 3] = [
            (FilterStage::UniversalExclusions, Self::universal_exclusions),
            (FilterStage::Keywords, Self::keyword_inclusion),
            (FilterStage::MediaTypes, Self::media_inclusion),
        ];

        for (stage, check) in stages {
            if let Some(reason) = check(self, msg) {
                self.observer.on_filter(&FilterEvent::Rejected {
                    message_id: msg.id,
                    stage,
                    reason: reason.clone(),
                });
                return FilterDecision::Reject { stage, reason };
            }
        }
        FilterDecision::Pass
    }

    pub fn transform(&self, msg: &Message) -> TransformedText {
        let before = msg.text_content().map(str::to_string);

        let result = if self.config.strip_caption && msg.has_media() {
            TransformedText {
                text: None,
                has_replacement: false,
            }
        } else {
            match before.as_deref() {
                Some(text) => apply_replacements(text, &self.config.text_replacements),
                None => TransformedText {
                    text: None,
                    has_replacement: false,
                },
            }
        };

        if result.text != before {
            self.observer.on_filter(&FilterEvent::Transformed {
                message_id: msg.id,
                stage: FilterStage::TextTransform,
                before,
                after: result.text.clone(),
            });
        }
        result
    }

    fn universal_exclusions(&self, msg: &Message) -> Option<String> {
        let cfg = &self.config;
        if cfg.exclude_forwards && msg.is_forward() {
            return Some("forwarded messages are excluded".to_string());
        }
        if cfg.exclude_replies && msg.is_reply() {
            return Some("replies are excluded".to_string());
        }
        if cfg.exclude_text_only && !msg.has_media() {
            return Some("text-only messages are excluded".to_string());
        }
        if cfg.exclude_links && contains_link(msg) {
            return Some("messages with links are excluded".to_string());
        }
        None
    }

    fn keyword_inclusion(&self, msg: &Message) -> Option<String> {
        if self.keywords_lower.is_empty() {
            return None;
        }
        // Text and caption are both searched; either may carry the keyword.
        let fields: Vec<String> = [msg.text.as_deref(), msg.caption.as_deref()]
            .into_iter()
            .flatten()
            .filter(|t| !t.is_empty())
            .map(str::to_lowercase)
            .collect();
        if fields.is_empty() {
            return Some("no text to match keywords against".to_string());
        }
        let matched = fields
            .iter()
            .any(|f| self.keywords_lower.iter().any(|k| f.contains(k.as_str())));
        if matched {
            None
        } else {
            Some("no configured keyword found".to_string())
        }
    }

    fn media_inclusion(&self, msg: &Message) -> Option<String> {
        if self.config.media_types.is_empty() {
            return None;
        }
        match msg.media {
            None => None,
            Some(kind) if self.config.media_types.contains(&kind) => None,
            Some(kind) => Some(format!("media type {} is not allowed", kind.as_str())),
        }
    }
}
