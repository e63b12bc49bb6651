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

//! Reconciliation integration tests: drift detection, repair and sweeps.

use chrono::NaiveDate;
use ledger_recon::{
    AccountId, AccountType, CashBankId, Direction, DiscrepancyKind, DocumentId, DocumentStatus,
    Engine, LedgerError, NewAccount, NewEntry, PaymentRequest, ReconciliationJob,
    ReferenceType, Scope, Severity,
};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

struct Books {
    engine: Engine,
    bank: AccountId,
    sales: AccountId,
    suspense: AccountId,
    equity: AccountId,
    current_assets: AccountId,
    operating: CashBankId,
}

fn books() -> Books {
    let engine = Engine::default();
    let create = |code: &str, name: &str, account_type: AccountType| {
        engine
            .create_account(NewAccount::detail(code, name, account_type))
            .unwrap()
    };
    let bank = create("1102", "Bank", AccountType::Asset);
    create("1201", "Receivables", AccountType::Asset);
    let suspense = create("1901", "Suspense", AccountType::Asset);
    let equity = create("3901", "Opening Balance Equity", AccountType::Equity);
    let sales = create("4101", "Sales", AccountType::Revenue);
    let current_assets = engine
        .create_account(NewAccount::header("1100", "Current Assets", AccountType::Asset))
        .unwrap();
    let operating = engine.create_cash_bank("Operating", Some(bank)).unwrap();
    Books {
        engine,
        bank,
        sales,
        suspense,
        equity,
        current_assets,
        operating,
    }
}

fn date() -> NaiveDate {
    NaiveDate::from_ymd_opt(2025, 6, 30).unwrap()
}

fn deposit(books: &Books, amount: Decimal) {
    books
        .engine
        .post(
            NewEntry::new(date(), ReferenceType::Deposit, "Takings")
                .debit(books.bank, amount)
                .credit(books.sales, amount),
        )
        .unwrap();
}

fn receipt(books: &Books, reference: &str, doc: DocumentId, amount: Decimal) {
    books
        .engine
        .apply_payment(
            PaymentRequest::new(reference, books.operating, amount, date(), Direction::Receivable)
                .allocate(doc, amount),
        )
        .unwrap();
}

fn open(books: &Books, id: u64, total: Decimal) -> DocumentId {
    let id = DocumentId(id);
    books
        .engine
        .register_document(id, Direction::Receivable, total)
        .unwrap();
    books.engine.approve_document(id).unwrap();
    id
}

#[test]
fn consistent_books_validate_clean() {
    let books = books();
    deposit(&books, dec!(1250));
    let doc = open(&books, 1, dec!(800));
    receipt(&books, "RCPT-1", doc, dec!(300));

    let report = books.engine.validate(Scope::All);
    assert!(report.is_clean(), "{:?}", report.discrepancies);
}

#[test]
fn header_balance_is_critical_and_repairs_into_suspense() {
    let books = books();
    books
        .engine
        .import_opening_balance(books.current_assets, dec!(555000))
        .unwrap();

    let report = books.engine.validate(Scope::All);
    assert_eq!(report.discrepancies.len(), 1);
    let header = &report.discrepancies[0];
    assert_eq!(header.kind, DiscrepancyKind::HeaderBalance(books.current_assets));
    assert_eq!(header.severity, Severity::Critical);
    assert_eq!(header.expected, Decimal::ZERO);

    // A sweep leaves critical drift alone.
    let swept = books.engine.sweep(Scope::All);
    assert!(swept.repaired.is_empty());
    assert_eq!(swept.skipped.len(), 1);

    let entry = books.engine.repair(header.id).unwrap();
    assert_eq!(entry.reference_type, ReferenceType::Correction);
    assert_eq!(
        books.engine.account(books.current_assets).unwrap().balance(),
        Decimal::ZERO
    );
    assert_eq!(books.engine.account(books.suspense).unwrap().balance(), dec!(555000));
    assert_eq!(books.engine.account(books.equity).unwrap().balance(), dec!(555000));
    assert!(books.engine.validate(Scope::All).is_clean());
}

#[test]
fn cash_bank_drift_is_corrected_to_transactions() {
    let books = books();
    deposit(&books, dec!(500000));
    deposit(&books, dec!(332500));
    books
        .engine
        .import_cash_bank_balance(books.operating, dec!(10000000))
        .unwrap();

    let report = books.engine.validate(Scope::All);
    assert_eq!(report.discrepancies.len(), 1);
    let drift = report
        .find(DiscrepancyKind::CashBankBalance(books.operating))
        .unwrap();
    assert_eq!(drift.severity, Severity::Warning);
    assert_eq!(drift.stored, dec!(10000000));
    assert_eq!(drift.expected, dec!(832500));
    assert_eq!(drift.difference, dec!(9167500));

    let entry = books.engine.repair(drift.id).unwrap();
    assert_eq!(
        books.engine.cash_bank(books.operating).unwrap().balance(),
        dec!(832500)
    );
    // The memo pair leaves suspense flat.
    assert_eq!(books.engine.account(books.suspense).unwrap().balance(), Decimal::ZERO);

    // Repeating the repair returns the first correction.
    let entries = books.engine.entries().len();
    assert_eq!(books.engine.repair(drift.id).unwrap().id, entry.id);
    assert_eq!(books.engine.entries().len(), entries);

    // A clean run forgets the resolved discrepancy.
    assert!(books.engine.validate(Scope::All).is_clean());
    assert!(books.engine.discrepancy(drift.id).is_none());
    assert!(matches!(
        books.engine.repair(drift.id),
        Err(LedgerError::NotRepairable { .. })
    ));
}

#[test]
fn document_drift_is_swept_back_to_allocations() {
    let books = books();
    let doc = open(&books, 7, dec!(1000));
    receipt(&books, "RCPT-1", doc, dec!(400));
    books
        .engine
        .import_document_amounts(doc, Decimal::ZERO, dec!(1000))
        .unwrap();

    let report = books.engine.validate(Scope::Documents);
    let drift = report.find(DiscrepancyKind::DocumentPaid(doc)).unwrap();
    assert_eq!(drift.severity, Severity::Warning);
    assert_eq!(drift.expected, dec!(400));

    let swept = books.engine.sweep(Scope::All);
    assert_eq!(swept.repaired.len(), 1);
    assert!(swept.failed.is_empty());

    let document = books.engine.document(doc).unwrap();
    assert_eq!(document.paid_amount(), dec!(400));
    assert_eq!(document.outstanding_amount(), dec!(600));
    assert_eq!(document.effective_status(), DocumentStatus::PartiallyPaid);
    assert!(books.engine.validate(Scope::All).is_clean());
}

#[test]
fn sub_tolerance_header_balance_is_critical() {
    let books = books();
    books
        .engine
        .import_opening_balance(books.current_assets, dec!(0.005))
        .unwrap();

    let report = books.engine.validate(Scope::Account(books.current_assets));
    let header = report
        .find(DiscrepancyKind::HeaderBalance(books.current_assets))
        .unwrap();
    assert_eq!(header.severity, Severity::Critical);
    assert_eq!(header.stored, dec!(0.005));

    books.engine.repair(header.id).unwrap();
    assert!(books.engine.validate(Scope::All).is_clean());
}

#[test]
fn out_of_scope_discrepancy_survives_a_narrower_run() {
    let books = books();
    books.engine.import_opening_balance(books.bank, dec!(70)).unwrap();
    books
        .engine
        .import_cash_bank_balance(books.operating, dec!(70))
        .unwrap();
    let report = books.engine.validate(Scope::All);
    let cash_bank = report
        .find(DiscrepancyKind::CashBankBalance(books.operating))
        .unwrap()
        .id;
    let account = report
        .find(DiscrepancyKind::AccountBalance(books.bank))
        .unwrap()
        .id;

    books.engine.repair(account).unwrap();
    assert!(books.engine.validate(Scope::Accounts).is_clean());
    assert!(books.engine.discrepancy(account).is_none());
    assert!(books.engine.discrepancy(cash_bank).is_some());
    books.engine.repair(cash_bank).unwrap();
}

#[test]
fn negative_outstanding_is_critical() {
    let books = books();
    let doc = open(&books, 3, dec!(100));
    books
        .engine
        .import_document_amounts(doc, Decimal::ZERO, dec!(-20))
        .unwrap();

    let report = books.engine.validate(Scope::Document(doc));
    let drift = report
        .find(DiscrepancyKind::DocumentOutstanding(doc))
        .unwrap();
    assert_eq!(drift.severity, Severity::Critical);
    assert_eq!(drift.expected, dec!(100));

    books.engine.repair(drift.id).unwrap();
    assert_eq!(books.engine.outstanding(doc).unwrap().outstanding_amount, dec!(100));
    assert!(books.engine.validate(Scope::All).is_clean());
}

#[test]
fn reversed_payment_reconciles_clean() {
    let books = books();
    let doc = open(&books, 1, dec!(650));
    receipt(&books, "RCPT-1", doc, dec!(650));
    let payment = books.engine.payment_by_reference("RCPT-1").unwrap();

    books.engine.reverse(payment.entry_id.unwrap()).unwrap();
    assert!(books.engine.validate(Scope::All).is_clean());

    receipt(&books, "RCPT-2", doc, dec!(650));
    assert!(books.engine.validate(Scope::All).is_clean());
}

#[test]
fn scope_limits_what_is_checked() {
    let books = books();
    books.engine.import_opening_balance(books.bank, dec!(70)).unwrap();
    books
        .engine
        .import_cash_bank_balance(books.operating, dec!(70))
        .unwrap();

    assert_eq!(books.engine.validate(Scope::All).discrepancies.len(), 2);
    assert_eq!(books.engine.validate(Scope::Accounts).discrepancies.len(), 1);
    assert_eq!(books.engine.validate(Scope::CashBanks).discrepancies.len(), 1);
    assert!(books.engine.validate(Scope::Account(books.sales)).is_clean());
    assert!(books.engine.validate(Scope::Documents).is_clean());
}

#[test]
fn repair_after_further_changes_is_refused() {
    let books = books();
    deposit(&books, dec!(100));
    books
        .engine
        .import_cash_bank_balance(books.operating, dec!(150))
        .unwrap();
    let id = books.engine.validate(Scope::All).discrepancies[0].id;

    deposit(&books, dec!(10));
    assert!(matches!(
        books.engine.repair(id),
        Err(LedgerError::NotRepairable { .. })
    ));

    // Validating again reports the current drift, which repairs.
    let id = books.engine.validate(Scope::All).discrepancies[0].id;
    books.engine.repair(id).unwrap();
    assert_eq!(books.engine.cash_bank(books.operating).unwrap().balance(), dec!(110));
}

#[test]
fn scheduled_job_sweeps_drift() {
    let books = books();
    books
        .engine
        .import_cash_bank_balance(books.operating, dec!(0.40))
        .unwrap();
    let operating = books.operating;
    let engine = Arc::new(books.engine);

    let job = ReconciliationJob::spawn(
        Arc::clone(&engine),
        Scope::CashBanks,
        Duration::from_millis(10),
        true,
    );
    let deadline = Instant::now() + Duration::from_secs(5);
    while job.runs() == 0 && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(5));
    }
    job.stop();

    assert_eq!(engine.cash_bank(operating).unwrap().balance(), Decimal::ZERO);
}
