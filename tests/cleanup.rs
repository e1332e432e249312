mod common;

use common::{open_order, shared, Bulk, ScriptedExchange};
use exchange_latency_bench::capability::ExchangeCapability;
use exchange_latency_bench::cleanup::{CleanupCoordinator, CleanupPhase, CleanupStatus, OpenOrderBook};
use exchange_latency_bench::error::FailureKind;
use exchange_latency_bench::types::*;
use pretty_assertions::assert_eq;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

fn book_with(orders: &[OpenOrder]) -> Arc<OpenOrderBook> {
    let book = Arc::new(OpenOrderBook::new());
    for order in orders {
        book.track(order.clone());
    }
    book
}

fn coordinator(
    book: &Arc<OpenOrderBook>,
    venues: Vec<Arc<dyn ExchangeCapability>>,
    timeout: Duration,
) -> CleanupCoordinator {
    CleanupCoordinator::with_settings(book.clone(), venues, timeout, Some(Transport::Rest))
}

#[tokio::test]
async fn bulk_failure_falls_back_to_individual_cancels() {
    let venue = ScriptedExchange::new("binance", Transport::Rest)
        .bulk(Bulk::Fails)
        .failing_cancel("o-2");
    let book = book_with(&[
        open_order("binance", "o-1", Transport::Rest),
        open_order("binance", "o-2", Transport::Rest),
    ]);
    let cleanup = coordinator(&book, vec![shared(venue)], Duration::from_secs(1));

    let report = cleanup.run().await;
    assert_eq!(report.cancelled(), 1);
    let failures = report.failures();
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].order.order_id, OrderId("o-2".into()));
    match &failures[0].status {
        CleanupStatus::Failed { reason } => {
            assert_eq!(reason.kind, FailureKind::ConnectionError);
            assert!(reason.message.contains("o-2"));
        }
        other => panic!("unexpected status {other:?}"),
    }

    assert!(!report.is_clean());
    assert_eq!(book.len(), 1);
    assert!(book.contains(&ExchangeId("binance".into()), &OrderId("o-2".into())));
    assert_eq!(cleanup.phase(), CleanupPhase::Done);
}

#[tokio::test]
async fn partial_bulk_cancel_leaves_the_rest_to_individual_cancels() {
    let venue = Arc::new(
        ScriptedExchange::new("sim", Transport::Rest)
            .bulk(Bulk::Partial)
            .bulk_reports(&["o-1"]),
    );
    let book = book_with(&[
        open_order("sim", "o-1", Transport::Rest),
        open_order("sim", "o-2", Transport::Rest),
    ]);
    let report = coordinator(&book, vec![venue.clone() as Arc<dyn ExchangeCapability>], Duration::from_secs(1))
        .run()
        .await;

    assert_eq!(report.cancelled(), 2);
    assert_eq!(venue.cancelled_ids(), vec![OrderId("o-2".into())]);
    assert!(book.is_empty());
}

#[tokio::test]
async fn unknown_orders_count_as_already_closed() {
    let venue = ScriptedExchange::new("binance", Transport::Rest).unknown_order("gone");
    let book = book_with(&[
        open_order("binance", "gone", Transport::Rest),
        open_order("binance", "live", Transport::Rest),
    ]);
    let report = coordinator(&book, vec![shared(venue)], Duration::from_secs(1))
        .run()
        .await;

    assert_eq!(report.cancelled(), 1);
    assert_eq!(report.already_closed(), 1);
    assert!(report.is_clean());
    assert!(book.is_empty());
}

#[tokio::test]
async fn dead_primary_transport_falls_back_to_rest() {
    let ws = ScriptedExchange::new("binance", Transport::WebSocket).fail_all_cancels();
    let rest = Arc::new(ScriptedExchange::new("binance", Transport::Rest));
    let book = book_with(&[
        open_order("binance", "o-1", Transport::WebSocket),
        open_order("binance", "o-2", Transport::WebSocket),
    ]);
    let report = coordinator(
        &book,
        vec![shared(ws), rest.clone() as Arc<dyn ExchangeCapability>],
        Duration::from_secs(1),
    )
    .run()
    .await;

    assert_eq!(report.cancelled(), 2);
    assert!(report.outcomes.iter().all(|o| o.via == Some(Transport::Rest)));
    assert_eq!(rest.cancelled_ids().len(), 2);
}

#[tokio::test]
async fn no_fallback_when_the_primary_path_partly_works() {
    let ws = ScriptedExchange::new("binance", Transport::WebSocket).failing_cancel("o-2");
    let rest = Arc::new(ScriptedExchange::new("binance", Transport::Rest));
    let book = book_with(&[
        open_order("binance", "o-1", Transport::WebSocket),
        open_order("binance", "o-2", Transport::WebSocket),
    ]);
    let report = coordinator(
        &book,
        vec![shared(ws), rest.clone() as Arc<dyn ExchangeCapability>],
        Duration::from_secs(1),
    )
    .run()
    .await;

    assert_eq!(report.cancelled(), 1);
    assert_eq!(report.failures().len(), 1);
    assert!(rest.cancelled_ids().is_empty());
}

#[tokio::test]
async fn fallback_is_decided_per_transport() {
    let ws = ScriptedExchange::new("binance", Transport::WebSocket).fail_all_cancels();
    let rest = Arc::new(ScriptedExchange::new("binance", Transport::Rest));
    let book = book_with(&[
        open_order("binance", "w-1", Transport::WebSocket),
        open_order("binance", "w-2", Transport::WebSocket),
        open_order("binance", "r-1", Transport::Rest),
    ]);
    let report = coordinator(
        &book,
        vec![shared(ws), rest.clone() as Arc<dyn ExchangeCapability>],
        Duration::from_secs(1),
    )
    .run()
    .await;

    assert_eq!(report.cancelled(), 3);
    assert!(report.is_clean());
    assert!(report.outcomes.iter().all(|o| o.via == Some(Transport::Rest)));
    let mut ids = rest.cancelled_ids();
    ids.sort();
    assert_eq!(
        ids,
        vec![OrderId("r-1".into()), OrderId("w-1".into()), OrderId("w-2".into())]
    );
    assert!(book.is_empty());
}

#[tokio::test]
async fn orders_on_the_fallback_transport_are_not_retried() {
    let rest = Arc::new(ScriptedExchange::new("binance", Transport::Rest).fail_all_cancels());
    let ws = Arc::new(ScriptedExchange::new("binance", Transport::WebSocket));
    let book = book_with(&[
        open_order("binance", "r-1", Transport::Rest),
        open_order("binance", "r-2", Transport::Rest),
    ]);
    let report = coordinator(
        &book,
        vec![
            rest.clone() as Arc<dyn ExchangeCapability>,
            ws.clone() as Arc<dyn ExchangeCapability>,
        ],
        Duration::from_secs(1),
    )
    .run()
    .await;

    assert_eq!(report.failures().len(), 2);
    assert!(report.failures().iter().all(|o| o.via == Some(Transport::Rest)));
    assert_eq!(rest.cancel_attempts.load(Ordering::SeqCst), 2);
    assert_eq!(ws.cancel_attempts.load(Ordering::SeqCst), 0);
    assert_eq!(book.len(), 2);
}

#[tokio::test]
async fn orders_still_open_at_the_deadline_are_reported() {
    let slow = ScriptedExchange::new("slow", Transport::Rest).cancel_delay(Duration::from_secs(30));
    let fast = ScriptedExchange::new("fast", Transport::Rest);
    let book = book_with(&[
        open_order("slow", "s-1", Transport::Rest),
        open_order("fast", "f-1", Transport::Rest),
    ]);

    let started = Instant::now();
    let report = coordinator(&book, vec![shared(slow), shared(fast)], Duration::from_millis(100))
        .run()
        .await;
    assert!(started.elapsed() < Duration::from_secs(2));

    assert_eq!(report.cancelled(), 1);
    let failures = report.failures();
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].order.exchange, ExchangeId("slow".into()));
    assert_eq!(failures[0].via, None);
    match &failures[0].status {
        CleanupStatus::Failed { reason } => assert_eq!(reason.kind, FailureKind::Timeout),
        other => panic!("unexpected status {other:?}"),
    }
    assert!(book.contains(&ExchangeId("slow".into()), &OrderId("s-1".into())));
}

#[tokio::test]
async fn exchanges_without_a_capability_are_failures() {
    let book = book_with(&[open_order("orphan", "o-1", Transport::Rest)]);
    let report = coordinator(&book, Vec::new(), Duration::from_secs(1)).run().await;
    assert_eq!(report.failures().len(), 1);
}

#[tokio::test]
async fn second_run_is_a_no_op() {
    let book = book_with(&[open_order("binance", "o-1", Transport::Rest)]);
    let cleanup = coordinator(
        &book,
        vec![shared(ScriptedExchange::new("binance", Transport::Rest))],
        Duration::from_secs(1),
    );
    assert_eq!(cleanup.run().await.cancelled(), 1);
    assert!(cleanup.run().await.outcomes.is_empty());
}
