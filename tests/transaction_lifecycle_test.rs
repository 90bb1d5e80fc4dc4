mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{charge_request, dec, decline, test_settings, FakeDisputeSource, FakeGateway, Harness};
use payflow_core::domain::{TransactionKind, TransactionStatus};
use payflow_core::error::PaymentError;
use payflow_core::services::{CaptureRequest, Engine, Repositories, RefundRequest, VoidRequest};

#[tokio::test]
async fn test_void_after_capture_is_rejected() {
    let h = Harness::new();
    let auth = h
        .engine
        .transactions
        .authorize("auth-1", charge_request("merchant-a", "25"))
        .await
        .unwrap();
    let group_id = auth.group_id;

    h.engine
        .transactions
        .capture("capture-1", CaptureRequest { group_id, amount: None })
        .await
        .unwrap();
    let calls = h.gateway.calls();

    let err = h
        .engine
        .transactions
        .void("void-1", VoidRequest { group_id })
        .await
        .unwrap_err();
    match err {
        PaymentError::InvalidStateTransition { from, to } => {
            assert_eq!(from, TransactionStatus::Captured);
            assert_eq!(to, TransactionStatus::Voided);
        }
        other => panic!("unexpected error: {:?}", other),
    }

    // Nothing reached the gateway and the record is unchanged.
    assert_eq!(h.gateway.calls(), calls);
    let primary = h.engine.transactions.get(auth.id).await.unwrap();
    assert_eq!(primary.status, TransactionStatus::Captured);
}

#[tokio::test]
async fn test_void_authorized_then_capture_is_rejected() {
    let h = Harness::new();
    let auth = h
        .engine
        .transactions
        .authorize("auth-1", charge_request("merchant-a", "25"))
        .await
        .unwrap();
    let group_id = auth.group_id;

    let voided = h
        .engine
        .transactions
        .void("void-1", VoidRequest { group_id })
        .await
        .unwrap();
    assert_eq!(voided.status, TransactionStatus::Voided);
    assert!(voided.is_terminal());

    let err = h
        .engine
        .transactions
        .capture("capture-1", CaptureRequest { group_id, amount: None })
        .await
        .unwrap_err();
    assert!(matches!(err, PaymentError::InvalidStateTransition { .. }));

    let err = h
        .engine
        .transactions
        .refund("refund-1", RefundRequest { group_id, amount: dec("1") })
        .await
        .unwrap_err();
    assert!(matches!(err, PaymentError::InvalidStateTransition { .. }));
}

#[tokio::test]
async fn test_partial_capture_and_capture_ceiling() {
    let h = Harness::new();
    let auth = h
        .engine
        .transactions
        .authorize("auth-1", charge_request("merchant-a", "100"))
        .await
        .unwrap();
    let group_id = auth.group_id;

    let err = h
        .engine
        .transactions
        .capture("capture-too-much", CaptureRequest { group_id, amount: Some(dec("100.01")) })
        .await
        .unwrap_err();
    assert!(matches!(err, PaymentError::InvalidInput(_)));

    let captured = h
        .engine
        .transactions
        .capture("capture-1", CaptureRequest { group_id, amount: Some(dec("60")) })
        .await
        .unwrap();
    assert_eq!(captured.captured_amount, Some(dec("60")));

    let rows = h.engine.transactions.group(group_id).await.unwrap();
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[1].kind, TransactionKind::Capture);
    assert_eq!(rows[1].parent_id, Some(auth.id));
    assert_eq!(rows[1].status, TransactionStatus::Captured);
}

#[tokio::test]
async fn test_declined_authorization_fails_the_row() {
    let h = Harness::new();
    h.gateway.push(decline());

    let err = h
        .engine
        .transactions
        .authorize("auth-declined", charge_request("merchant-a", "10"))
        .await
        .unwrap_err();
    assert!(matches!(err, PaymentError::TerminalGatewayFailure(_)));
    assert!(!err.is_retriable());

    let row = h.transaction_by_key("auth-declined").await;
    assert_eq!(row.status, TransactionStatus::Failed);
    assert_eq!(row.response_code.as_deref(), Some("05"));
}

#[tokio::test]
async fn test_unknown_group_is_not_found() {
    let h = Harness::new();
    let err = h
        .engine
        .transactions
        .capture(
            "capture-1",
            CaptureRequest { group_id: uuid::Uuid::new_v4(), amount: None },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, PaymentError::NotFound(_)));
}

#[tokio::test]
async fn test_every_change_is_audited() {
    let h = Harness::new();
    let sale = h
        .engine
        .transactions
        .sale("sale-1", charge_request("merchant-a", "10"))
        .await
        .unwrap();

    let entries = h.audit_for(sale.id).await;
    let actions: Vec<_> = entries.iter().map(|e| e.action.as_str()).collect();
    assert_eq!(actions, vec!["created", "gateway_approved"]);
}

/// Two engines over one store, as two API replicas would run.
fn replicas(gateway: &Arc<FakeGateway>) -> (Engine, Engine) {
    let repos = Repositories::in_memory();
    let disputes = Arc::new(FakeDisputeSource::new());
    let a = Engine::new(repos.clone(), gateway.clone(), disputes.clone(), test_settings());
    let b = Engine::new(repos, gateway.clone(), disputes, test_settings());
    (a, b)
}

#[tokio::test]
async fn test_concurrent_captures_across_engines_reach_gateway_once() {
    let gateway = Arc::new(FakeGateway::with_delay(Duration::from_millis(50)));
    let (a, b) = replicas(&gateway);

    let auth = a
        .transactions
        .authorize("auth-1", charge_request("merchant-a", "25"))
        .await
        .unwrap();
    let group_id = auth.group_id;

    let (first, second) = tokio::join!(
        a.transactions.capture("cap-a", CaptureRequest { group_id, amount: None }),
        b.transactions.capture("cap-b", CaptureRequest { group_id, amount: None }),
    );

    assert_eq!(gateway.operations(), vec!["authorize", "capture"]);
    let (winner, loser_key, loser) = match (first, second) {
        (Ok(tx), Err(e)) => (tx, "cap-b", e),
        (Err(e), Ok(tx)) => (tx, "cap-a", e),
        other => panic!("expected exactly one capture to win: {:?}", other),
    };
    assert_eq!(winner.status, TransactionStatus::Captured);
    assert!(winner.in_flight_key.is_none());
    assert!(matches!(
        loser,
        PaymentError::RequestInProgress(_) | PaymentError::InvalidStateTransition { .. }
    ));

    // Once the winner settled, the losing key is a plain illegal transition.
    let retry = b
        .transactions
        .capture(loser_key, CaptureRequest { group_id, amount: None })
        .await
        .unwrap_err();
    assert!(matches!(retry, PaymentError::InvalidStateTransition { .. }));
    assert_eq!(gateway.calls(), 2);

    let rows = a.transactions.group(group_id).await.unwrap();
    let captures = rows.iter().filter(|r| r.kind == TransactionKind::Capture).count();
    assert_eq!(captures, 1);
}

#[tokio::test]
async fn test_capture_and_void_race_across_engines_settles_one() {
    let gateway = Arc::new(FakeGateway::with_delay(Duration::from_millis(50)));
    let (a, b) = replicas(&gateway);

    let auth = a
        .transactions
        .authorize("auth-1", charge_request("merchant-a", "25"))
        .await
        .unwrap();
    let group_id = auth.group_id;

    let (captured, voided) = tokio::join!(
        a.transactions.capture("cap-1", CaptureRequest { group_id, amount: None }),
        b.transactions.void("void-1", VoidRequest { group_id }),
    );
    assert!(captured.is_ok() != voided.is_ok());
    assert_eq!(gateway.calls(), 2);

    let primary = a.transactions.get(auth.id).await.unwrap();
    let expected = if captured.is_ok() {
        TransactionStatus::Captured
    } else {
        TransactionStatus::Voided
    };
    assert_eq!(primary.status, expected);
    assert!(primary.in_flight_key.is_none());
}

#[tokio::test]
async fn test_declined_capture_lifts_reservation() {
    let h = Harness::new();
    let auth = h
        .engine
        .transactions
        .authorize("auth-1", charge_request("merchant-a", "25"))
        .await
        .unwrap();
    let group_id = auth.group_id;

    h.gateway.push(decline());
    let err = h
        .engine
        .transactions
        .capture("capture-1", CaptureRequest { group_id, amount: None })
        .await
        .unwrap_err();
    assert!(matches!(err, PaymentError::TerminalGatewayFailure(_)));

    let primary = h.engine.transactions.get(auth.id).await.unwrap();
    assert_eq!(primary.status, TransactionStatus::Authorized);
    assert!(primary.in_flight_key.is_none());

    // Another key may void the still-authorized group.
    let voided = h
        .engine
        .transactions
        .void("void-1", VoidRequest { group_id })
        .await
        .unwrap();
    assert_eq!(voided.status, TransactionStatus::Voided);
}
