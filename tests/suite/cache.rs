//! Resolution cache behavior across calls, invalidation, and restarts.

use std::sync::Arc;
use std::time::{Duration, SystemTime};

use fenceref_context::{CachedTokenCounter, DurableTier, HierarchicalCache, Namespace, TokenCounter};
use fenceref_engine::{
    CacheTarget, HandlerRegistry, PromptEngine, Resolver, ResolverOptions, Signature, Snapshot,
};
use fenceref_tools::{FileHandler, FileSettings, VariableHandler};
use fenceref_types::{AllowedDirectory, ErrorKind, ReferenceKind};

use crate::common::{CountingHandler, engine_with, engine_with_handler, fast_queue, variables};

fn builtin_engine() -> PromptEngine {
    let mut handlers = HandlerRegistry::default();
    handlers.register(Arc::new(FileHandler::new(FileSettings::default()).unwrap()));
    handlers.register(Arc::new(VariableHandler::new(Duration::from_secs(86_400))));
    engine_with(handlers).0
}

fn rooted_at(dir: &std::path::Path) -> Snapshot {
    Snapshot::default().with_directory(AllowedDirectory::new(dir, false))
}

#[tokio::test]
async fn repeat_resolution_is_served_from_cache() {
    let handler = CountingHandler::new(ReferenceKind::Variable).with("a", "cached text");
    let (engine, handler, _) = engine_with_handler(handler);
    let snapshot = variables(&[]);

    let first = engine.resolve("@[var:a]", &snapshot).await.unwrap();
    let second = engine.resolve("again @[var:a]", &snapshot).await.unwrap();

    assert_eq!(handler.fetches("a"), 1);
    assert_eq!(first.per_reference_tokens, second.per_reference_tokens);
}

#[tokio::test]
async fn invalidating_a_signature_forces_one_refetch() {
    let handler = CountingHandler::new(ReferenceKind::Variable)
        .with("a", "A")
        .with("b", "B");
    let (engine, handler, _) = engine_with_handler(handler);
    let snapshot = variables(&[]);
    let text = "@[var:a] @[var:b]";

    engine.resolve(text, &snapshot).await.unwrap();
    let removed = engine
        .invalidate_cache(&CacheTarget::Signature(Signature::parse("var:a").unwrap()))
        .unwrap();
    assert_eq!(removed, 1);

    engine.resolve(text, &snapshot).await.unwrap();
    engine.resolve(text, &snapshot).await.unwrap();
    assert_eq!(handler.fetches("a"), 2);
    assert_eq!(handler.fetches("b"), 1);
}

#[tokio::test]
async fn invalidating_everything_refetches_every_reference() {
    let handler = CountingHandler::new(ReferenceKind::Variable)
        .with("a", "A")
        .with("b", "B");
    let (engine, handler, _) = engine_with_handler(handler);
    let snapshot = variables(&[]);

    engine.resolve("@[var:a] @[var:b]", &snapshot).await.unwrap();
    engine.invalidate_cache(&CacheTarget::All).unwrap();
    engine.resolve("@[var:a] @[var:b]", &snapshot).await.unwrap();

    assert_eq!(handler.total_fetches(), 4);
}

#[tokio::test]
async fn failures_are_not_cached() {
    let handler = CountingHandler::new(ReferenceKind::Variable);
    let (engine, handler, _) = engine_with_handler(handler);
    let snapshot = variables(&[]);

    let _ = engine.resolve("@[var:missing]", &snapshot).await;
    let _ = engine.resolve("@[var:missing]", &snapshot).await;

    assert_eq!(handler.fetches("missing"), 2);
}

fn durable_engine(durable: Arc<DurableTier>, handler: Arc<CountingHandler>) -> PromptEngine {
    let mut handlers = HandlerRegistry::default();
    handlers.register(handler);
    let tokens = CachedTokenCounter::new(
        TokenCounter::default(),
        HierarchicalCache::new(Namespace::Tokens, 16, Some(durable.clone())),
        Duration::from_secs(3600),
    );
    let resolver = Resolver::new(
        handlers,
        HierarchicalCache::new(Namespace::Resolution, 16, Some(durable)),
        tokens,
        ResolverOptions::default(),
    );
    PromptEngine::new(resolver, fast_queue())
}

#[tokio::test]
async fn durable_tier_survives_a_restart() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("cache.db");
    let snapshot = variables(&[]);

    let first_handler = Arc::new(CountingHandler::new(ReferenceKind::Variable).with("a", "A"));
    {
        let durable = Arc::new(DurableTier::open(&path).unwrap());
        let engine = durable_engine(durable, first_handler.clone());
        engine.resolve("@[var:a]", &snapshot).await.unwrap();
        engine.shutdown().await;
    }
    assert_eq!(first_handler.fetches("a"), 1);

    let second_handler = Arc::new(CountingHandler::new(ReferenceKind::Variable).with("a", "A"));
    let durable = Arc::new(DurableTier::open(&path).unwrap());
    let engine = durable_engine(durable, second_handler.clone());
    let result = engine.resolve("@[var:a]", &snapshot).await.unwrap();

    assert_eq!(result.resolved_content, "A");
    assert_eq!(second_handler.total_fetches(), 0);
}

#[tokio::test]
async fn cached_file_content_still_goes_through_the_sandbox() {
    let secret = tempfile::tempdir().unwrap();
    let other = tempfile::tempdir().unwrap();
    std::fs::write(secret.path().join("notes.txt"), "TOP SECRET").unwrap();
    std::fs::write(other.path().join("notes.txt"), "public").unwrap();
    let engine = builtin_engine();
    let text = "x @[file:notes.txt]";

    let first = engine.resolve(text, &rooted_at(secret.path())).await.unwrap();
    assert_eq!(first.resolved_content, "x TOP SECRET");

    let err = engine.resolve(text, &Snapshot::default()).await.unwrap_err();
    let partial = err.partial().unwrap();
    assert_eq!(partial.resolved_content, text);
    assert_eq!(partial.errors[0].kind, ErrorKind::NotInAllowedDirectory);

    let elsewhere = engine.resolve(text, &rooted_at(other.path())).await.unwrap();
    assert_eq!(elsewhere.resolved_content, "x public");
}

#[tokio::test]
async fn changed_variable_value_is_picked_up() {
    let engine = builtin_engine();

    let first = engine
        .resolve("Hi @[var:name]", &variables(&[("name", "Alice")]))
        .await
        .unwrap();
    let second = engine
        .resolve("Hi @[var:name]", &variables(&[("name", "Bob")]))
        .await
        .unwrap();

    assert_eq!(first.resolved_content, "Hi Alice");
    assert_eq!(second.resolved_content, "Hi Bob");
}

#[tokio::test]
async fn edited_file_is_read_again() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("notes.txt");
    std::fs::write(&path, "draft").unwrap();
    let engine = builtin_engine();
    let snapshot = rooted_at(dir.path());

    let first = engine.resolve("@[file:notes.txt]", &snapshot).await.unwrap();
    assert_eq!(first.resolved_content, "draft");

    std::fs::write(&path, "final").unwrap();
    let file = std::fs::OpenOptions::new().write(true).open(&path).unwrap();
    file.set_modified(SystemTime::now() + Duration::from_secs(60)).unwrap();

    let second = engine.resolve("@[file:notes.txt]", &snapshot).await.unwrap();
    assert_eq!(second.resolved_content, "final");
}
