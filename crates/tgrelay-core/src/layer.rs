//! Composition root: one retry executor and one error classifier shared by the lookups.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::{
    classifier::ErrorClassifier,
    config::Config,
    fetcher::MessageFetcher,
    filter::{FilterConfig, MessageFilterPipeline},
    media_group::{MediaGroupAggregator, MinFragments},
    ports::ChatApi,
    resolver::ChannelResolver,
    retry::{RetryExecutor, WaitObserver},
};

pub struct RetrievalLayer {
    pub retry: Arc<RetryExecutor>,
    pub errors: Arc<ErrorClassifier>,
    pub resolver: ChannelResolver,
    pub fetcher: MessageFetcher,
    min_fragments: usize,
}

pub struct RetrievalLayerBuilder {
    api: Arc<dyn ChatApi>,
    config: Config,
    errors: Option<ErrorClassifier>,
    observer: Option<Arc<dyn WaitObserver>>,
    cancel: Option<CancellationToken>,
}

impl RetrievalLayerBuilder {
    /// Use a classifier with handlers/recoveries already registered.
    pub fn classifier(mut self, errors: ErrorClassifier) -> Self {
        self.errors = Some(errors);
        self
    }

    pub fn wait_observer(mut self, observer: Arc<dyn WaitObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    pub fn cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    pub fn build(self) -> RetrievalLayer {
        let mut retry = RetryExecutor::new(self.config.retry);
        if let Some(observer) = self.observer {
            retry = retry.with_observer(observer);
        }
        if let Some(token) = self.cancel {
            retry = retry.with_cancellation(token);
        }
        let retry = Arc::new(retry);

        let errors = Arc::new(
            self.errors
                .unwrap_or_else(|| ErrorClassifier::new(self.config.error_history_limit)),
        );

        RetrievalLayer {
            resolver: ChannelResolver::new(
                self.api.clone(),
                retry.clone(),
                errors.clone(),
                &self.config,
            ),
            fetcher: MessageFetcher::new(self.api, retry.clone(), errors.clone(), &self.config),
            retry,
            errors,
            min_fragments: self.config.media_group_min_fragments,
        }
    }
}

impl RetrievalLayer {
    pub fn builder(api: Arc<dyn ChatApi>, config: Config) -> RetrievalLayerBuilder {
        RetrievalLayerBuilder {
            api,
            config,
            errors: None,
            observer: None,
            cancel: None,
        }
    }

    pub fn new(api: Arc<dyn ChatApi>, config: Config) -> Self {
        Self::builder(api, config).build()
    }

    /// Aggregator using the configured fragment threshold.
    pub fn media_groups<C>(&self) -> MediaGroupAggregator<C> {
        MediaGroupAggregator::with_policy(MinFragments(self.min_fragments))
    }

    pub fn filter(&self, config: FilterConfig) -> MessageFilterPipeline {
        MessageFilterPipeline::new(config)
    }

    /// Cancel any in-flight rate-limit wait or backoff.
    pub fn shutdown(&self) {
        self.retry.cancellation_token().cancel();
    }
}
