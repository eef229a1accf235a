//! End-to-end resolution: substitution, dedup, failure handling, ordering.

use std::sync::Arc;
use std::time::Duration;

use fenceref_engine::{HandlerRegistry, ResolutionError};
use fenceref_tools::{
    FileSettings, GitHubSettings, HttpSettings, RetryConfig, VariableHandler,
};
use fenceref_types::{ErrorKind, ReferenceKind, contains_references};

use crate::common::{CountingHandler, engine_with, engine_with_handler, variables};

#[tokio::test]
async fn variable_is_substituted_and_counted() {
    let mut handlers = HandlerRegistry::default();
    handlers.register(Arc::new(VariableHandler::new(Duration::from_secs(60))));
    let (engine, _) = engine_with(handlers);

    let result = engine
        .resolve("Hello @[var:name]!", &variables(&[("name", "World")]))
        .await
        .unwrap();

    assert_eq!(result.resolved_content, "Hello World!");
    assert_eq!(result.total_tokens, engine.count_tokens("Hello World!").unwrap());
    assert!(result.errors.is_empty());
    assert_eq!(result.per_reference_tokens.len(), 1);
    assert!(!result.approximate);
}

#[tokio::test]
async fn resolved_output_is_reference_free_and_stable() {
    let handler = CountingHandler::new(ReferenceKind::Variable)
        .with("a", "first value")
        .with("b", "second value");
    let (engine, _, _) = engine_with_handler(handler);
    let snapshot = variables(&[]);

    let first = engine
        .resolve("x @[var:a] y @[var:b] z", &snapshot)
        .await
        .unwrap();
    assert_eq!(first.resolved_content, "x first value y second value z");
    assert!(!contains_references(&first.resolved_content));

    let second = engine
        .resolve(&first.resolved_content, &snapshot)
        .await
        .unwrap();
    assert_eq!(second.resolved_content, first.resolved_content);
    assert_eq!(second.total_tokens, first.total_tokens);
    assert!(second.per_reference_tokens.is_empty());
}

#[tokio::test]
async fn repeated_reference_is_fetched_and_counted_once() {
    let content = "alpha beta gamma";
    let handler = CountingHandler::new(ReferenceKind::Variable).with("a", content);
    let (engine, handler, tokenizer) = engine_with_handler(handler);

    let result = engine
        .resolve("@[var:a] / @[var:a] / @[var: a ]", &variables(&[]))
        .await
        .unwrap();

    assert_eq!(handler.fetches("a"), 1);
    assert_eq!(tokenizer.calls_for(content), 1);
    assert_eq!(result.per_reference_tokens.len(), 1);

    let reference = &result.per_reference_tokens[0];
    assert_eq!(reference.occurrences, 3);
    assert_eq!(
        result.block_tokens(),
        result.base_content_tokens + reference.tokens
    );
}

#[tokio::test]
async fn failed_reference_keeps_literal_while_siblings_resolve() {
    let http = HttpSettings {
        timeout: Duration::from_secs(5),
        retry: RetryConfig {
            max_retries: 0,
            ..RetryConfig::default()
        },
        ..HttpSettings::default()
    };
    let github = GitHubSettings {
        // Nothing listens on port 1.
        api_base: "http://127.0.0.1:1".to_string(),
        ..GitHubSettings::default()
    };
    let handlers = HandlerRegistry::standard(
        FileSettings::default(),
        http,
        Duration::from_secs(60),
        github,
        Duration::from_secs(60),
    )
    .unwrap();
    let (engine, _) = engine_with(handlers);

    let text = "Hi @[var:name], see @[github:issue:acme/widgets#7]";
    let result = engine
        .resolve(text, &variables(&[("name", "World")]))
        .await
        .unwrap();

    assert_eq!(
        result.resolved_content,
        "Hi World, see @[github:issue:acme/widgets#7]"
    );
    assert_eq!(result.errors.len(), 1);

    let error = &result.errors[0];
    assert_eq!(error.kind, ErrorKind::Network);
    assert!(error.transient);
    assert_eq!(error.raw_token, "@[github:issue:acme/widgets#7]");
    assert!(!error.marker.is_empty());
}

#[tokio::test]
async fn all_failures_return_the_partial_result() {
    let handler = CountingHandler::new(ReferenceKind::Variable);
    let (engine, _, _) = engine_with_handler(handler);

    let text = "only @[var:missing] here";
    let err = engine.resolve(text, &variables(&[])).await.unwrap_err();

    assert!(matches!(err, ResolutionError::AllReferencesFailed { .. }));
    let partial = err.partial().unwrap();
    assert_eq!(partial.resolved_content, text);
    assert_eq!(partial.errors[0].kind, ErrorKind::NotFound);
    assert!(!partial.errors[0].transient);
}

#[tokio::test]
async fn completion_order_does_not_affect_output() {
    let handler = CountingHandler::new(ReferenceKind::Variable)
        .with("a", "A")
        .with("b", "B")
        .with("c", "C")
        .with_delay("a", Duration::from_millis(60))
        .with_delay("c", Duration::from_millis(20));
    let (engine, _, _) = engine_with_handler(handler);

    let result = engine
        .resolve("@[var:a]-@[var:b]-@[var:c]", &variables(&[]))
        .await
        .unwrap();

    assert_eq!(result.resolved_content, "A-B-C");
    let order: Vec<_> = result
        .per_reference_tokens
        .iter()
        .map(|r| r.signature.as_str().to_string())
        .collect();
    assert_eq!(order, ["var:a", "var:b", "var:c"]);
}

#[tokio::test]
async fn unregistered_kind_is_reported_not_fetched() {
    let handler = CountingHandler::new(ReferenceKind::Variable).with("a", "A");
    let (engine, handler, _) = engine_with_handler(handler);

    let result = engine
        .resolve("@[var:a] @[file:notes.md]", &variables(&[]))
        .await
        .unwrap();

    assert_eq!(result.resolved_content, "A @[file:notes.md]");
    assert_eq!(result.errors[0].kind, ErrorKind::NotResolvable);
    assert_eq!(handler.total_fetches(), 1);
}

#[tokio::test]
async fn empty_text_counts_zero_without_tokenizing() {
    let (engine, tokenizer) = engine_with(HandlerRegistry::default());

    assert_eq!(engine.count_tokens("").unwrap(), 0);
    let result = engine.resolve("", &variables(&[])).await.unwrap();
    assert_eq!(result.total_tokens, 0);
    assert_eq!(tokenizer.calls(), 0);
}
