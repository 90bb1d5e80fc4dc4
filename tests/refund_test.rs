mod common;

use bigdecimal::BigDecimal;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use common::{charge_request, dec, decline, upstream_error, Harness};
use payflow_core::domain::{RefundState, TransactionKind, TransactionStatus};
use payflow_core::error::PaymentError;
use payflow_core::services::{CaptureRequest, RefundRequest};

#[tokio::test]
async fn test_partial_refunds_up_to_captured_amount() {
    let h = Harness::new();
    let tx = &h.engine.transactions;

    let auth = tx
        .authorize("order-1-auth", charge_request("merchant-a", "100.00"))
        .await
        .unwrap();
    assert_eq!(auth.status, TransactionStatus::Authorized);
    let group_id = auth.group_id;

    let captured = tx
        .capture("order-1-capture", CaptureRequest { group_id, amount: None })
        .await
        .unwrap();
    assert_eq!(captured.status, TransactionStatus::Captured);
    assert_eq!(captured.captured_amount, Some(dec("100.00")));

    let after_first = tx
        .refund("order-1-refund-1", RefundRequest { group_id, amount: dec("30") })
        .await
        .unwrap();
    assert_eq!(after_first.status, TransactionStatus::Refunded);
    assert_eq!(after_first.refund_state(), RefundState::Partial);

    let after_second = tx
        .refund("order-1-refund-2", RefundRequest { group_id, amount: dec("50") })
        .await
        .unwrap();
    assert_eq!(after_second.refunded_amount, dec("80"));

    let err = tx
        .refund("order-1-refund-3", RefundRequest { group_id, amount: dec("30") })
        .await
        .unwrap_err();
    match err {
        PaymentError::RefundExceedsCaptured { requested, available } => {
            assert_eq!(requested, dec("30"));
            assert_eq!(available, dec("20"));
        }
        other => panic!("unexpected error: {:?}", other),
    }

    let full = tx
        .refund("order-1-refund-4", RefundRequest { group_id, amount: dec("20") })
        .await
        .unwrap();
    assert_eq!(full.refunded_amount, dec("100"));
    assert_eq!(full.refund_state(), RefundState::Full);
    assert!(full.is_terminal());

    let err = tx
        .refund("order-1-refund-5", RefundRequest { group_id, amount: dec("1") })
        .await
        .unwrap_err();
    assert!(matches!(err, PaymentError::InvalidStateTransition { .. }));

    let rows = tx.group(group_id).await.unwrap();
    assert!(rows[0].is_primary());
    let refunds: Vec<_> = rows
        .iter()
        .filter(|row| row.kind == TransactionKind::Refund)
        .collect();
    // The rejected refund never produced a row.
    assert_eq!(refunds.len(), 3);
    assert!(refunds.iter().all(|row| row.status == TransactionStatus::Refunded));
}

#[tokio::test]
async fn test_refund_of_sale_uses_sale_amount() {
    let h = Harness::new();
    let sale = h
        .engine
        .transactions
        .sale("sale-1", charge_request("merchant-a", "42.50"))
        .await
        .unwrap();
    assert_eq!(sale.status, TransactionStatus::Captured);

    let err = h
        .engine
        .transactions
        .refund(
            "sale-1-refund",
            RefundRequest { group_id: sale.group_id, amount: dec("42.51") },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, PaymentError::RefundExceedsCaptured { .. }));
}

#[tokio::test]
async fn test_declined_refund_releases_reservation() {
    let h = Harness::new();
    let sale = h
        .engine
        .transactions
        .sale("sale-1", charge_request("merchant-a", "50"))
        .await
        .unwrap();
    let group_id = sale.group_id;

    h.gateway.push(decline());
    let err = h
        .engine
        .transactions
        .refund("refund-1", RefundRequest { group_id, amount: dec("50") })
        .await
        .unwrap_err();
    assert!(matches!(err, PaymentError::TerminalGatewayFailure(_)));

    let primary = h.engine.transactions.get(sale.id).await.unwrap();
    assert_eq!(primary.pending_refund_amount, BigDecimal::from(0));
    assert_eq!(primary.refundable_amount(), dec("50"));

    // The same key replays the decline without another gateway call.
    let calls = h.gateway.calls();
    let replay = h
        .engine
        .transactions
        .refund("refund-1", RefundRequest { group_id, amount: dec("50") })
        .await
        .unwrap_err();
    assert!(matches!(replay, PaymentError::TerminalGatewayFailure(_)));
    assert_eq!(h.gateway.calls(), calls);

    // A fresh key may refund the full amount.
    let refunded = h
        .engine
        .transactions
        .refund("refund-2", RefundRequest { group_id, amount: dec("50") })
        .await
        .unwrap();
    assert_eq!(refunded.refunded_amount, dec("50"));
}

#[tokio::test]
async fn test_retriable_refund_keeps_reservation_until_redriven() {
    let h = Harness::new();
    let sale = h
        .engine
        .transactions
        .sale("sale-1", charge_request("merchant-a", "50"))
        .await
        .unwrap();
    let group_id = sale.group_id;

    h.gateway.push(upstream_error());
    let err = h
        .engine
        .transactions
        .refund("refund-1", RefundRequest { group_id, amount: dec("40") })
        .await
        .unwrap_err();
    assert!(err.is_retriable());

    let primary = h.engine.transactions.get(sale.id).await.unwrap();
    assert_eq!(primary.pending_refund_amount, dec("40"));

    // Reserved funds are not available to another refund.
    let err = h
        .engine
        .transactions
        .refund("refund-2", RefundRequest { group_id, amount: dec("20") })
        .await
        .unwrap_err();
    assert!(matches!(err, PaymentError::RefundExceedsCaptured { .. }));

    // Resubmitting the original key re-drives the same pending row.
    let settled = h
        .engine
        .transactions
        .refund("refund-1", RefundRequest { group_id, amount: dec("40") })
        .await
        .unwrap();
    assert_eq!(settled.refunded_amount, dec("40"));
    assert_eq!(settled.pending_refund_amount, BigDecimal::from(0));

    let rows = h.engine.transactions.group(group_id).await.unwrap();
    let refund_rows = rows.iter().filter(|r| r.kind == TransactionKind::Refund).count();
    assert_eq!(refund_rows, 1);
}

#[tokio::test]
async fn test_refund_key_reused_with_other_amount_after_retriable_failure() {
    let h = Harness::new();
    let sale = h
        .engine
        .transactions
        .sale("sale-1", charge_request("merchant-a", "50"))
        .await
        .unwrap();
    let group_id = sale.group_id;

    h.gateway.push(upstream_error());
    let err = h
        .engine
        .transactions
        .refund("r1", RefundRequest { group_id, amount: dec("40") })
        .await
        .unwrap_err();
    assert!(err.is_retriable());
    let calls = h.gateway.calls();

    let err = h
        .engine
        .transactions
        .refund("r1", RefundRequest { group_id, amount: dec("5") })
        .await
        .unwrap_err();
    assert!(matches!(err, PaymentError::IdempotencyConflict(_)));
    assert_eq!(h.gateway.calls(), calls);

    let primary = h.engine.transactions.get(sale.id).await.unwrap();
    assert_eq!(primary.pending_refund_amount, dec("40"));
    assert_eq!(primary.refunded_amount, BigDecimal::from(0));
}

#[tokio::test]
async fn test_third_refund_over_remaining_balance_is_rejected() {
    let h = Harness::new();
    let sale = h
        .engine
        .transactions
        .sale("sale-100", charge_request("merchant-a", "100.00"))
        .await
        .unwrap();
    let group_id = sale.group_id;

    let first = h
        .engine
        .transactions
        .refund("refund-a", RefundRequest { group_id, amount: dec("40") })
        .await
        .unwrap();
    assert_eq!(first.refund_state(), RefundState::Partial);

    let second = h
        .engine
        .transactions
        .refund("refund-b", RefundRequest { group_id, amount: dec("40") })
        .await
        .unwrap();
    assert_eq!(second.refunded_amount, dec("80"));
    assert_eq!(second.refund_state(), RefundState::Partial);

    let calls = h.gateway.calls();
    let err = h
        .engine
        .transactions
        .refund("refund-c", RefundRequest { group_id, amount: dec("30") })
        .await
        .unwrap_err();
    match err {
        PaymentError::RefundExceedsCaptured { requested, available } => {
            assert_eq!(requested, dec("30"));
            assert_eq!(available, dec("20"));
        }
        other => panic!("unexpected error: {:?}", other),
    }
    assert_eq!(h.gateway.calls(), calls);

    let primary = h.engine.transactions.get(sale.id).await.unwrap();
    assert_eq!(primary.refunded_amount, dec("80"));
    assert_eq!(primary.pending_refund_amount, BigDecimal::from(0));
}

#[tokio::test]
async fn test_refunds_never_exceed_capture_over_random_sequences() {
    for seed in 0..20u64 {
        let mut rng = StdRng::seed_from_u64(seed);
        let h = Harness::new();
        let sale = h
            .engine
            .transactions
            .sale(&format!("sale-{}", seed), charge_request("merchant-a", "100"))
            .await
            .unwrap();
        let group_id = sale.group_id;
        let mut settled_total = BigDecimal::from(0);

        for step in 0..25 {
            let amount = BigDecimal::from(rng.gen_range(1..=40));
            match rng.gen_range(0..10) {
                0 | 1 => h.gateway.push(decline()),
                2 => h.gateway.push(upstream_error()),
                _ => {}
            }

            let result = h
                .engine
                .transactions
                .refund(
                    &format!("refund-{}-{}", seed, step),
                    RefundRequest { group_id, amount: amount.clone() },
                )
                .await;
            h.gateway.clear();

            match result {
                Ok(_) => settled_total += amount,
                Err(PaymentError::RefundExceedsCaptured { .. })
                | Err(PaymentError::InvalidStateTransition { .. })
                | Err(PaymentError::TerminalGatewayFailure(_))
                | Err(PaymentError::RetriableGatewayFailure(_)) => {}
                Err(other) => panic!("unexpected error: {:?}", other),
            }

            let primary = h.engine.transactions.get(sale.id).await.unwrap();
            let captured = primary.captured_amount.clone().unwrap();
            assert!(
                &primary.refunded_amount + &primary.pending_refund_amount <= captured,
                "seed {} step {}: refunded {} + pending {} > captured {}",
                seed,
                step,
                primary.refunded_amount,
                primary.pending_refund_amount,
                captured
            );
            assert_eq!(primary.refunded_amount, settled_total);
        }
    }
}
