//! Shared fixtures: counting handlers and tokenizers wired into an engine.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use fenceref_context::{
    CachedTokenCounter, HierarchicalCache, Namespace, TiktokenTokenizer, TokenCounter,
    TokenizeError, Tokenizer,
};
use fenceref_engine::{
    HandlerRegistry, PromptEngine, QueueSettings, Resolver, ResolverOptions, Snapshot,
};
use fenceref_tools::{HandlerFut, ReferenceHandler, Resolved, RetryConfig};
use fenceref_types::{Reference, ReferenceKind, ResolveError};

/// Tiktoken wrapper that records every text it is asked to count.
#[derive(Default)]
pub struct CountingTokenizer {
    inner: TiktokenTokenizer,
    seen: Mutex<Vec<String>>,
}

impl CountingTokenizer {
    pub fn calls(&self) -> usize {
        self.seen.lock().unwrap().len()
    }

    pub fn calls_for(&self, text: &str) -> usize {
        self.seen.lock().unwrap().iter().filter(|t| *t == text).count()
    }
}

impl Tokenizer for CountingTokenizer {
    fn encoding(&self) -> &str {
        self.inner.encoding()
    }

    fn count(&self, text: &str) -> Result<usize, TokenizeError> {
        self.seen.lock().unwrap().push(text.to_string());
        self.inner.count(text)
    }
}

/// Serves `content` for every value it knows and counts fetches per value.
pub struct CountingHandler {
    kind: ReferenceKind,
    content: BTreeMap<String, String>,
    delays: BTreeMap<String, Duration>,
    fetches: Mutex<BTreeMap<String, usize>>,
    total: AtomicUsize,
}

impl CountingHandler {
    pub fn new(kind: ReferenceKind) -> Self {
        Self {
            kind,
            content: BTreeMap::new(),
            delays: BTreeMap::new(),
            fetches: Mutex::new(BTreeMap::new()),
            total: AtomicUsize::new(0),
        }
    }

    pub fn with(mut self, value: &str, content: &str) -> Self {
        self.content.insert(value.to_string(), content.to_string());
        self
    }

    pub fn with_delay(mut self, value: &str, delay: Duration) -> Self {
        self.delays.insert(value.to_string(), delay);
        self
    }

    pub fn fetches(&self, value: &str) -> usize {
        self.fetches.lock().unwrap().get(value).copied().unwrap_or(0)
    }

    pub fn total_fetches(&self) -> usize {
        self.total.load(Ordering::SeqCst)
    }
}

impl ReferenceHandler for CountingHandler {
    fn kind(&self) -> ReferenceKind {
        self.kind
    }

    fn validate(&self, _reference: &Reference, _snapshot: &Snapshot) -> Result<(), ResolveError> {
        Ok(())
    }

    fn resolve<'a>(&'a self, reference: &'a Reference, _snapshot: &'a Snapshot) -> HandlerFut<'a> {
        Box::pin(async move {
            let value = reference.value.clone();
            self.total.fetch_add(1, Ordering::SeqCst);
            *self
                .fetches
                .lock()
                .unwrap()
                .entry(value.clone())
                .or_default() += 1;

            if let Some(delay) = self.delays.get(&value) {
                tokio::time::sleep(*delay).await;
            }
            match self.content.get(&value) {
                Some(content) => Ok(Resolved::text(content.clone(), "text/plain")),
                None => Err(ResolveError::NotFound {
                    what: "value",
                    name: value,
                }),
            }
        })
    }

    fn cache_ttl(&self) -> Duration {
        Duration::from_secs(3600)
    }
}

pub fn fast_queue() -> QueueSettings {
    QueueSettings {
        workers: 2,
        retry: RetryConfig {
            max_retries: 2,
            initial_delay: Duration::from_millis(5),
            max_delay: Duration::from_millis(20),
            jitter_factor: 0.0,
        },
        ..QueueSettings::default()
    }
}

/// Memory-only engine around `handlers` with a counting tokenizer.
pub fn engine_with(handlers: HandlerRegistry) -> (PromptEngine, Arc<CountingTokenizer>) {
    let tokenizer = Arc::new(CountingTokenizer::default());
    let tokens = CachedTokenCounter::new(
        TokenCounter::new(tokenizer.clone()),
        HierarchicalCache::new(Namespace::Tokens, 256, None),
        Duration::from_secs(3600),
    );
    let resolver = Resolver::new(
        handlers,
        HierarchicalCache::new(Namespace::Resolution, 256, None),
        tokens,
        ResolverOptions::default(),
    );
    (PromptEngine::new(resolver, fast_queue()), tokenizer)
}

/// Engine with a single counting handler registered.
pub fn engine_with_handler(
    handler: CountingHandler,
) -> (PromptEngine, Arc<CountingHandler>, Arc<CountingTokenizer>) {
    let handler = Arc::new(handler);
    let mut handlers = HandlerRegistry::default();
    handlers.register(handler.clone());
    let (engine, tokenizer) = engine_with(handlers);
    (engine, handler, tokenizer)
}

pub fn variables(pairs: &[(&str, &str)]) -> Snapshot {
    let map: BTreeMap<String, String> = pairs
        .iter()
        .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
        .collect();
    Snapshot::default().with_variables(Arc::new(map))
}
