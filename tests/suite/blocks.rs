//! Block totals and background refresh tasks.

use fenceref_engine::{BlockId, FenceBlock, TaskError, TaskPriority, TaskState};
use fenceref_types::ReferenceKind;

use crate::common::{CountingHandler, engine_with_handler, variables};

fn handler() -> CountingHandler {
    CountingHandler::new(ReferenceKind::Variable)
        .with("greeting", "Good morning, team")
        .with("sign_off", "Regards")
}

#[tokio::test]
async fn global_total_is_the_sum_of_block_totals() {
    let (engine, _, _) = engine_with_handler(handler());
    let snapshot = variables(&[]);
    engine.register_block(FenceBlock::new("intro", "@[var:greeting] and welcome"));
    engine.register_block(FenceBlock::new("outro", "@[var:sign_off], the bot"));

    let intro = engine
        .count_block(&BlockId::new("intro"), &snapshot)
        .await
        .unwrap();
    let outro = engine
        .count_block(&BlockId::new("outro"), &snapshot)
        .await
        .unwrap();

    assert!(intro.total_tokens > 0);
    assert_eq!(
        engine.global_total(),
        u64::from(intro.total_tokens) + u64::from(outro.total_tokens)
    );
    assert_eq!(engine.block_summaries().len(), 2);
}

#[tokio::test]
async fn shared_reference_counts_once_per_block() {
    let (engine, handler, _) = engine_with_handler(handler());
    engine.register_block(FenceBlock::new(
        "b",
        "@[var:greeting] @[var:greeting] @[var:greeting]",
    ));

    let summary = engine
        .count_block(&BlockId::new("b"), &variables(&[]))
        .await
        .unwrap();
    let reference = engine.count_tokens("Good morning, team").unwrap();

    assert_eq!(handler.fetches("greeting"), 1);
    assert_eq!(summary.distinct_references, 1);
    assert_eq!(summary.reference_tokens, reference);
    assert_eq!(
        summary.total_tokens,
        summary.base_content_tokens + reference
    );
}

#[tokio::test]
async fn empty_block_leaves_the_totals_but_stays_refreshable() {
    let (engine, _, _) = engine_with_handler(handler());
    let blank = BlockId::new("blank");
    engine.register_block(FenceBlock::new("blank", ""));

    let summary = engine.count_block(&blank, &variables(&[])).await.unwrap();

    assert_eq!(summary.total_tokens, 0);
    assert!(engine.block_summary(&blank).is_none());
    assert_eq!(engine.global_total(), 0);

    engine.register_block(FenceBlock::new("blank", "@[var:greeting]"));
    let id = engine
        .refresh(vec![blank.clone()], TaskPriority::Interactive, variables(&[]))
        .unwrap();
    assert_eq!(
        engine.wait_for_task(id).await.unwrap().state,
        TaskState::Completed
    );
    assert!(engine.block_summary(&blank).unwrap().total_tokens > 0);

    engine.shutdown().await;
}

#[tokio::test]
async fn refresh_task_refetches_and_reports_totals() {
    let (engine, handler, _) = engine_with_handler(handler());
    let snapshot = variables(&[]);
    engine.register_block(FenceBlock::new("intro", "@[var:greeting]!"));
    engine.register_block(FenceBlock::new("outro", "@[var:sign_off]."));
    engine
        .count_block(&BlockId::new("intro"), &snapshot)
        .await
        .unwrap();

    let id = engine
        .refresh(
            vec![BlockId::new("intro"), BlockId::new("outro")],
            TaskPriority::Interactive,
            snapshot,
        )
        .unwrap();
    let status = engine.wait_for_task(id).await.unwrap();

    assert_eq!(status.state, TaskState::Completed);
    assert_eq!(status.attempts, 1);
    let outcome = status.outcome.unwrap();
    assert_eq!(outcome.blocks.len(), 2);
    assert_eq!(outcome.reference_errors, 0);
    assert_eq!(outcome.global_total, engine.global_total());
    // Refresh bypasses the cached entry from the first count.
    assert_eq!(handler.fetches("greeting"), 2);
    assert_eq!(handler.fetches("sign_off"), 1);

    engine.shutdown().await;
}

#[tokio::test]
async fn refresh_with_only_permanent_failures_fails_without_retry() {
    let (engine, handler, _) = engine_with_handler(handler());
    engine.register_block(FenceBlock::new("broken", "see @[var:nowhere]"));

    let id = engine
        .refresh(
            vec![BlockId::new("broken")],
            TaskPriority::Passive,
            variables(&[]),
        )
        .unwrap();
    let status = engine.wait_for_task(id).await.unwrap();

    assert_eq!(status.state, TaskState::Failed);
    assert_eq!(status.attempts, 1);
    assert!(status.error.is_some());
    assert_eq!(handler.fetches("nowhere"), 1);
}

#[tokio::test]
async fn failing_block_does_not_fail_a_global_refresh() {
    let (engine, handler, _) = engine_with_handler(handler());
    engine.register_block(FenceBlock::new("a", "text @[var:missing]"));
    engine.register_block(FenceBlock::new("b", "text @[var:greeting]"));

    let id = engine
        .refresh(
            vec![BlockId::new("a"), BlockId::new("b")],
            TaskPriority::Global,
            variables(&[]),
        )
        .unwrap();
    let status = engine.wait_for_task(id).await.unwrap();

    assert_eq!(status.state, TaskState::Completed);
    assert_eq!(status.attempts, 1);
    let outcome = status.outcome.unwrap();
    assert_eq!(outcome.failed_blocks.len(), 1);
    assert_eq!(outcome.failed_blocks[0].id, BlockId::new("a"));
    assert!(!outcome.failed_blocks[0].transient);
    assert_eq!(outcome.reference_errors, 1);

    let b = engine.block_summary(&BlockId::new("b")).unwrap();
    assert!(b.total_tokens > 0);
    assert_eq!(b.failed_references, 0);
    // The failed block keeps its literal text in the totals.
    let a = engine.block_summary(&BlockId::new("a")).unwrap();
    assert_eq!(a.failed_references, 1);
    assert_eq!(outcome.global_total, u64::from(a.total_tokens) + u64::from(b.total_tokens));
    assert_eq!(handler.fetches("missing"), 1);

    engine.shutdown().await;
}

#[tokio::test]
async fn refresh_rejects_unknown_blocks() {
    let (engine, _, _) = engine_with_handler(handler());

    let err = engine
        .refresh(
            vec![BlockId::new("ghost")],
            TaskPriority::Global,
            variables(&[]),
        )
        .unwrap_err();
    assert_eq!(err, TaskError::UnknownBlock(BlockId::new("ghost")));

    let err = engine
        .refresh(Vec::new(), TaskPriority::Global, variables(&[]))
        .unwrap_err();
    assert_eq!(err, TaskError::NoBlocks);
}
