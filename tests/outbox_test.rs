// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2025 Daniel Negri
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

//! Outbox integration tests: accepted payments, the worker and waiting.

use chrono::NaiveDate;
use ledger_recon::{
    AccountType, CashBankId, Direction, DocumentId, DocumentStatus, Engine, EngineConfig,
    LedgerError, NewAccount, OutboxWorker, PaymentRequest, PaymentStatus, Scope,
};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::sync::Arc;
use std::time::Duration;

fn engine_with(config: EngineConfig) -> (Engine, CashBankId, DocumentId) {
    let engine = Engine::new(config);
    let bank = engine
        .create_account(NewAccount::detail("1102", "Bank", AccountType::Asset))
        .unwrap();
    engine
        .create_account(NewAccount::detail("1201", "Receivables", AccountType::Asset))
        .unwrap();
    let operating = engine.create_cash_bank("Operating", Some(bank)).unwrap();
    let doc = DocumentId(1);
    engine
        .register_document(doc, Direction::Receivable, dec!(1000))
        .unwrap();
    engine.approve_document(doc).unwrap();
    (engine, operating, doc)
}

fn receipt(reference: &str, bank: CashBankId, doc: DocumentId, amount: Decimal) -> PaymentRequest {
    PaymentRequest::new(
        reference,
        bank,
        amount,
        NaiveDate::from_ymd_opt(2025, 5, 12).unwrap(),
        Direction::Receivable,
    )
    .allocate(doc, amount)
}

#[test]
fn accepted_payment_waits_in_the_outbox() {
    let (engine, bank, doc) = engine_with(EngineConfig::default());
    let payment = engine.accept_payment(receipt("R-1", bank, doc, dec!(600))).unwrap();

    assert_eq!(payment.status, PaymentStatus::Pending);
    assert_eq!(payment.entry_id, None);
    assert_eq!(engine.pending_outbox().len(), 1);
    // Nothing is projected until the entry posts.
    assert_eq!(engine.outstanding(doc).unwrap().outstanding_amount, dec!(1000));
    assert_eq!(engine.cash_bank(bank).unwrap().balance(), Decimal::ZERO);
    assert!(engine.validate(Scope::All).is_clean());

    assert_eq!(
        engine.wait_for_posting(payment.id, Duration::from_millis(20)),
        Err(LedgerError::Timeout(payment.id))
    );
}

#[test]
fn pending_allocations_reserve_outstanding() {
    let (engine, bank, doc) = engine_with(EngineConfig::default());
    engine.accept_payment(receipt("R-1", bank, doc, dec!(600))).unwrap();

    assert_eq!(
        engine.apply_payment(receipt("R-2", bank, doc, dec!(500))),
        Err(LedgerError::InsufficientOutstanding {
            document: doc,
            outstanding: dec!(400),
            requested: dec!(500),
        })
    );
    engine.apply_payment(receipt("R-3", bank, doc, dec!(400))).unwrap();

    let report = OutboxWorker::drain(&engine);
    assert_eq!(report.posted.len(), 1);
    let summary = engine.outstanding(doc).unwrap();
    assert_eq!(summary.outstanding_amount, Decimal::ZERO);
    assert_eq!(summary.status, DocumentStatus::Paid);
}

#[test]
fn accept_is_idempotent_on_reference() {
    let (engine, bank, doc) = engine_with(EngineConfig::default());
    let first = engine.accept_payment(receipt("R-1", bank, doc, dec!(250))).unwrap();
    let again = engine.accept_payment(receipt("R-1", bank, doc, dec!(250))).unwrap();

    assert_eq!(first.id, again.id);
    assert_eq!(engine.pending_outbox().len(), 1);

    OutboxWorker::drain(&engine);
    let replay = engine.apply_payment(receipt("R-1", bank, doc, dec!(250))).unwrap();
    assert_eq!(replay.id, first.id);
    assert_eq!(replay.status, PaymentStatus::Posted);
    assert_eq!(engine.entries().len(), 1);
}

#[test]
fn spawned_worker_posts_and_wakes_waiters() {
    let mut config = EngineConfig::default();
    config.outbox.poll_interval_ms = 10;
    let (engine, bank, doc) = engine_with(config);
    let engine = Arc::new(engine);

    let worker = OutboxWorker::spawn(Arc::clone(&engine));
    let payment = engine.accept_payment(receipt("R-1", bank, doc, dec!(1000))).unwrap();

    let posted = engine
        .wait_for_posting(payment.id, Duration::from_secs(5))
        .unwrap();
    worker.stop();

    assert_eq!(posted.status, PaymentStatus::Posted);
    assert!(posted.entry_id.is_some());
    assert!(engine.pending_outbox().is_empty());
    assert_eq!(engine.outstanding(doc).unwrap().status, DocumentStatus::Paid);
    assert_eq!(engine.cash_bank(bank).unwrap().balance(), dec!(1000));
    assert!(engine.validate(Scope::All).is_clean());
}

#[test]
fn missing_payment_cannot_be_awaited() {
    let (engine, ..) = engine_with(EngineConfig::default());
    let unknown = ledger_recon::PaymentId(77);
    assert_eq!(
        engine.wait_for_posting(unknown, Duration::from_millis(1)),
        Err(LedgerError::PaymentNotFound(unknown))
    );
}
