//! Uniform failure taxonomy, bounded error history and pluggable recovery.
//!
//! Build one [`ErrorClassifier`] at composition time, register handlers/recovery
//! strategies on it, then share it (`Arc`) with the resolver and fetcher.

use std::{
    collections::{BTreeMap, HashMap, VecDeque},
    fmt,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use chrono::{DateTime, Utc};
use serde::Serialize;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Network,
    Api,
    Authentication,
    Permission,
    Media,
    Configuration,
    Validation,
    Resource,
    Unknown,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Network => "network",
            Self::Api => "api",
            Self::Authentication => "authentication",
            Self::Permission => "permission",
            Self::Media => "media",
            Self::Configuration => "configuration",
            Self::Validation => "validation",
            Self::Resource => "resource",
            Self::Unknown => "unknown",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

// Order matters: the first bucket with a matching keyword wins.
const BUCKETS: &[(ErrorKind, &[&str])] = &[
    (
        ErrorKind::Network,
        &[
            "connection",
            "network",
            "timeout",
            "timed out",
            "socket",
            "unreachable",
            "dns",
            "reset by peer",
            "broken pipe",
        ],
    ),
    (
        ErrorKind::Api,
        &[
            "flood",
            "rate limit",
            "rpc_call_fail",
            "too many requests",
            "api",
            "bad request",
            "internal server",
            "server error",
        ],
    ),
    (
        ErrorKind::Authentication,
        &[
            "auth",
            "unauthorized",
            "session",
            "login",
            "password",
            "phone_code",
            "credentials",
        ],
    ),
    (
        ErrorKind::Permission,
        &[
            "forbidden",
            "permission",
            "access denied",
            "not allowed",
            "admin",
            "rights",
            "private",
            "banned",
        ],
    ),
    (
        ErrorKind::Media,
        &[
            "media", "file", "photo", "video", "document", "upload", "download", "sticker",
        ],
    ),
    (
        ErrorKind::Configuration,
        &[
            "config",
            "setting",
            "missing key",
            "not configured",
            "environment variable",
        ],
    ),
    (
        ErrorKind::Validation,
        &[
            "invalid",
            "validation",
            "malformed",
            "parse",
            "format",
            "required",
            "empty",
        ],
    ),
    (
        ErrorKind::Resource,
        &[
            "memory",
            "disk",
            "space",
            "quota",
            "resource",
            "too large",
            "limit exceeded",
            "exhausted",
        ],
    ),
];

const CRITICAL_HINTS: &[&str] = &["critical", "fatal", "panic"];

/// Keyword-match a lowercase-insensitive message against the ordered buckets.
pub fn classify_message(message: &str) -> ErrorKind {
    let lower = message.to_lowercase();
    BUCKETS
        .iter()
        .find(|(_, keywords)| keywords.iter().any(|k| lower.contains(k)))
        .map(|(kind, _)| *kind)
        .unwrap_or(ErrorKind::Unknown)
}

pub fn severity_for(kind: ErrorKind, message: &str) -> Severity {
    let lower = message.to_lowercase();
    if CRITICAL_HINTS.iter().any(|k| lower.contains(k)) {
        return Severity::Critical;
    }
    match kind {
        ErrorKind::Authentication | ErrorKind::Permission => Severity::High,
        ErrorKind::Network | ErrorKind::Api | ErrorKind::Media => Severity::Medium,
        ErrorKind::Configuration | ErrorKind::Validation => Severity::Low,
        ErrorKind::Resource | ErrorKind::Unknown => Severity::Medium,
    }
}

/// Display text of an error followed by its `source()` chain.
pub fn error_text(err: &(dyn std::error::Error + 'static)) -> String {
    let mut text = err.to_string();
    let mut source = err.source();
    while let Some(inner) = source {
        let inner_text = inner.to_string();
        if !text.contains(&inner_text) {
            text.push_str(": ");
            text.push_str(&inner_text);
        }
        source = inner.source();
    }
    text
}

// ============== Records ==============

pub type ErrorContext = BTreeMap<String, serde_json::Value>;

/// Build an [`ErrorContext`] from `(key, value)` pairs.
pub fn context<I, K, V>(pairs: I) -> ErrorContext
where
    I: IntoIterator<Item = (K, V)>,
    K: Into<String>,
    V: Into<serde_json::Value>,
{
    pairs
        .into_iter()
        .map(|(k, v)| (k.into(), v.into()))
        .collect()
}

#[derive(Clone, Debug, Serialize)]
pub struct ErrorRecord {
    pub kind: ErrorKind,
    pub severity: Severity,
    pub message: String,
    pub context: ErrorContext,
    pub timestamp: DateTime<Utc>,
    /// `None` when no recovery strategy is registered for `kind`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recovered: Option<bool>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ErrorStats {
    pub total: usize,
    pub by_kind: BTreeMap<ErrorKind, usize>,
    pub by_severity: BTreeMap<Severity, usize>,
}

pub type ErrorHandler = Arc<dyn Fn(&ErrorRecord) -> anyhow::Result<()> + Send + Sync>;
pub type RecoveryStrategy = Arc<dyn Fn(&ErrorRecord) -> anyhow::Result<bool> + Send + Sync>;

// ============== Classifier ==============

pub struct ErrorClassifier {
    history_limit: usize,
    history: Mutex<VecDeque<ErrorRecord>>,
    handlers: HashMap<ErrorKind, Vec<ErrorHandler>>,
    recoveries: HashMap<ErrorKind, RecoveryStrategy>,
}

impl Default for ErrorClassifier {
    fn default() -> Self {
        Self::new(1000)
    }
}

impl ErrorClassifier {
    pub fn new(history_limit: usize) -> Self {
        Self {
            history_limit: history_limit.max(1),
            history: Mutex::new(VecDeque::new()),
            handlers: HashMap::new(),
            recoveries: HashMap::new(),
        }
    }

    pub fn register_handler(
        &mut self,
        kind: ErrorKind,
        handler: impl Fn(&ErrorRecord) -> anyhow::Result<()> + Send + Sync + 'static,
    ) {
        self.handlers
            .entry(kind)
            .or_default()
            .push(Arc::new(handler));
    }

    /// Replace the recovery strategy for `kind`.
    pub fn register_recovery(
        &mut self,
        kind: ErrorKind,
        strategy: impl Fn(&ErrorRecord) -> anyhow::Result<bool> + Send + Sync + 'static,
    ) {
        self.recoveries.insert(kind, Arc::new(strategy));
    }

    pub fn classify(&self, err: &(dyn std::error::Error + 'static)) -> ErrorKind {
        classify_message(&error_text(err))
    }

    pub fn handle(
        &self,
        err: &(dyn std::error::Error + 'static),
        context: ErrorContext,
    ) -> ErrorRecord {
        self.handle_message(error_text(err), context)
    }

    /// Same as [`handle`](Self::handle) for failures that only exist as text.
    pub fn handle_message(&self, message: String, context: ErrorContext) -> ErrorRecord {
        let kind = classify_message(&message);
        let mut record = ErrorRecord {
            kind,
            severity: severity_for(kind, &message),
            message,
            context,
            timestamp: Utc::now(),
            recovered: None,
        };

        log_record(&record);

        for handler in self.handlers.get(&kind).into_iter().flatten() {
            if let Err(e) = handler(&record) {
                tracing::warn!(kind = %kind, error = %e, "error handler failed");
            }
        }

        if let Some(strategy) = self.recoveries.get(&kind) {
            let recovered = match strategy(&record) {
                Ok(ok) => ok,
                Err(e) => {
                    tracing::warn!(kind = %kind, error = %e, "recovery strategy failed");
                    false
                }
            };
            tracing::debug!(kind = %kind, recovered, "recovery attempted");
            record.recovered = Some(recovered);
        }

        let mut history = self.history();
        history.push_back(record.clone());
        while history.len() > self.history_limit {
            history.pop_front();
        }

        record
    }

    /// Most recent `n` records, oldest first.
    pub fn recent(&self, n: usize) -> Vec<ErrorRecord> {
        let history = self.history();
        let skip = history.len().saturating_sub(n);
        history.iter().skip(skip).cloned().collect()
    }

    pub fn history_len(&self) -> usize {
        self.history().len()
    }

    pub fn clear_history(&self) {
        self.history().clear();
    }

    pub fn stats(&self) -> ErrorStats {
        let history = self.history();
        let mut stats = ErrorStats {
            total: history.len(),
            ..Default::default()
        };
        for record in history.iter() {
            *stats.by_kind.entry(record.kind).or_default() += 1;
            *stats.by_severity.entry(record.severity).or_default() += 1;
        }
        stats
    }

    fn history(&self) -> MutexGuard<'_, VecDeque<ErrorRecord>> {
        // Records are appended whole; a poisoned lock still holds a consistent queue.
        self.history.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn log_record(record: &ErrorRecord) {
    let kind = record.kind.as_str();
    match record.severity {
        Severity::Critical | Severity::High => {
            tracing::error!(kind, severity = ?record.severity, context = ?record.context, "{}", record.message);
        }
        Severity::Medium => {
            tracing::warn!(kind, context = ?record.context, "{}", record.message);
        }
        Severity::Low => {
            tracing::info!(kind, context = ?record.context, "{}", record.message);
        }
    }
}
