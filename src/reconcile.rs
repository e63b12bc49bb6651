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

//! Reconciliation and validation.
//!
//! [`validate`] recomputes every materialized balance from the journal of
//! record, ignoring the stored fields:
//!
//! - account: signed sum of booked lines
//! - cash/bank: debit minus credit of cash/bank-typed lines on the linked account
//! - document paid: allocations of payments whose entry is still live
//!
//! Differences above `tolerance` are reported as [`Discrepancy`] rows, never
//! as errors. Header accounts and documents paid beyond their total are
//! reported whatever the tolerance says. [`repair`] fixes one by posting a `CORRECTION` entry; the
//! correction's projection moves the stored value, its lines leave the
//! recomputed sums untouched, so the two converge.
//!
//! Each repair has a content-addressed operation id (SHA-256 over the target
//! and both values). Repairing the same discrepancy twice returns the entry
//! posted the first time.

use crate::base::{AccountId, CashBankId, DiscrepancyId, DocumentId, EntryId};
use crate::document::DocumentStatus;
use crate::engine::Engine;
use crate::error::LedgerError;
use crate::interfaces::AccountRole;
use crate::journal::{Adjustment, EntryStatus, JournalEntry, NewEntry, ReferenceType};
use crate::posting;
use crate::store::Tables;
use crossbeam::channel::{self, RecvTimeoutError, Sender};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use parking_lot::Mutex;
use rust_decimal::Decimal;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Which balances a validation run covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Scope {
    #[default]
    All,
    Accounts,
    CashBanks,
    Documents,
    Account(AccountId),
    CashBank(CashBankId),
    Document(DocumentId),
}

impl Scope {
    fn covers_account(self, id: AccountId) -> bool {
        matches!(self, Self::All | Self::Accounts) || self == Self::Account(id)
    }

    fn covers_cash_bank(self, id: CashBankId) -> bool {
        matches!(self, Self::All | Self::CashBanks) || self == Self::CashBank(id)
    }

    fn covers_document(self, id: DocumentId) -> bool {
        matches!(self, Self::All | Self::Documents) || self == Self::Document(id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Severity {
    /// Rounding-level drift.
    Info,
    Warning,
    /// Never repaired by a sweep.
    Critical,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Info => f.write_str("INFO"),
            Self::Warning => f.write_str("WARNING"),
            Self::Critical => f.write_str("CRITICAL"),
        }
    }
}

/// What drifted, and where.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(tag = "kind", content = "target", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DiscrepancyKind {
    AccountBalance(AccountId),
    /// Any non-zero balance on a header account.
    HeaderBalance(AccountId),
    CashBankBalance(CashBankId),
    DocumentPaid(DocumentId),
    /// Outstanding disagrees with total minus paid, or is negative.
    DocumentOutstanding(DocumentId),
    /// Live allocations sum to more than the document total.
    DocumentOverAllocated(DocumentId),
}

impl DiscrepancyKind {
    pub fn label(&self) -> &'static str {
        match self {
            Self::AccountBalance(_) => "ACCOUNT_BALANCE",
            Self::HeaderBalance(_) => "HEADER_BALANCE",
            Self::CashBankBalance(_) => "CASH_BANK_BALANCE",
            Self::DocumentPaid(_) => "DOCUMENT_PAID",
            Self::DocumentOutstanding(_) => "DOCUMENT_OUTSTANDING",
            Self::DocumentOverAllocated(_) => "DOCUMENT_OVER_ALLOCATED",
        }
    }

    /// Display form of the drifted row's id.
    pub fn target(&self) -> String {
        match self {
            Self::AccountBalance(id) | Self::HeaderBalance(id) => id.to_string(),
            Self::CashBankBalance(id) => id.to_string(),
            Self::DocumentPaid(id)
            | Self::DocumentOutstanding(id)
            | Self::DocumentOverAllocated(id) => id.to_string(),
        }
    }

    fn document(&self) -> Option<DocumentId> {
        match self {
            Self::DocumentPaid(id)
            | Self::DocumentOutstanding(id)
            | Self::DocumentOverAllocated(id) => Some(*id),
            _ => None,
        }
    }

    fn within(&self, scope: Scope) -> bool {
        match *self {
            Self::AccountBalance(id) | Self::HeaderBalance(id) => scope.covers_account(id),
            Self::CashBankBalance(id) => scope.covers_cash_bank(id),
            Self::DocumentPaid(id)
            | Self::DocumentOutstanding(id)
            | Self::DocumentOverAllocated(id) => scope.covers_document(id),
        }
    }
}

/// One stored value that disagrees with the journal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Discrepancy {
    pub id: DiscrepancyId,
    pub kind: DiscrepancyKind,
    pub severity: Severity,
    pub stored: Decimal,
    pub expected: Decimal,
    /// `stored - expected`.
    pub difference: Decimal,
}

impl Discrepancy {
    /// Content address of the repair for this exact drift.
    pub fn operation_id(&self) -> String {
        operation_id(&self.kind, self.stored, self.expected)
    }
}

fn operation_id(kind: &DiscrepancyKind, stored: Decimal, expected: Decimal) -> String {
    let mut hasher = Sha256::new();
    hasher.update(kind.label().as_bytes());
    hasher.update(b"|");
    hasher.update(kind.target().as_bytes());
    hasher.update(b"|");
    hasher.update(stored.normalize().to_string().as_bytes());
    hasher.update(b"|");
    hasher.update(expected.normalize().to_string().as_bytes());
    format!("{:x}", hasher.finalize())
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Report {
    pub discrepancies: Vec<Discrepancy>,
}

impl Report {
    pub fn is_clean(&self) -> bool {
        self.discrepancies.is_empty()
    }

    pub fn count(&self, severity: Severity) -> usize {
        self.discrepancies
            .iter()
            .filter(|d| d.severity == severity)
            .count()
    }

    pub fn find(&self, kind: DiscrepancyKind) -> Option<&Discrepancy> {
        self.discrepancies.iter().find(|d| d.kind == kind)
    }
}

/// Outcome of [`sweep`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub repaired: Vec<(DiscrepancyId, EntryId)>,
    /// Critical discrepancies, left for an explicit repair.
    pub skipped: Vec<Discrepancy>,
    pub failed: Vec<(DiscrepancyId, LedgerError)>,
}

/// Discrepancies seen so far, keyed by id and by operation id.
///
/// The same drift found by two validation runs keeps its first id. A record
/// lives until a run covering its target no longer finds it.
#[derive(Debug, Default)]
pub(crate) struct DiscrepancyLog {
    next_id: AtomicU64,
    by_operation: DashMap<String, DiscrepancyId>,
    records: DashMap<DiscrepancyId, Discrepancy>,
}

impl DiscrepancyLog {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    fn register(
        &self,
        kind: DiscrepancyKind,
        severity: Severity,
        stored: Decimal,
        expected: Decimal,
    ) -> Discrepancy {
        let id = match self.by_operation.entry(operation_id(&kind, stored, expected)) {
            Entry::Occupied(entry) => *entry.get(),
            Entry::Vacant(entry) => {
                let id = DiscrepancyId(self.next_id.fetch_add(1, Ordering::Relaxed) + 1);
                entry.insert(id);
                id
            }
        };
        let discrepancy = Discrepancy {
            id,
            kind,
            severity,
            stored,
            expected,
            difference: stored - expected,
        };
        self.records.insert(id, discrepancy.clone());
        discrepancy
    }

    pub(crate) fn get(&self, id: DiscrepancyId) -> Option<Discrepancy> {
        self.records.get(&id).map(|d| d.clone())
    }

    /// Forgets records in `scope` that the latest run did not report.
    fn prune(&self, scope: Scope, seen: &HashSet<DiscrepancyId>) {
        self.records
            .retain(|id, d| !d.kind.within(scope) || seen.contains(id));
        self.by_operation
            .retain(|_, id| self.records.contains_key(id));
    }
}

/// Balances recomputed from the journal and payments.
#[derive(Debug, Default)]
struct Expected {
    accounts: HashMap<AccountId, Decimal>,
    cash_banks: HashMap<CashBankId, Decimal>,
    paid: HashMap<DocumentId, Decimal>,
}

impl Expected {
    fn from_journal(tables: &Tables) -> Self {
        let mut expected = Self::default();

        for entry in tables.entries.values().filter(|e| e.is_booked()) {
            for line in &entry.lines {
                if let Some(account) = tables.account(line.account_id) {
                    *expected.accounts.entry(account.id).or_default() +=
                        account.account_type.signed_delta(line.debit, line.credit);
                }
                if entry.reference_type.is_cash_bank() {
                    if let Some(&cash_bank) = tables.cash_bank_links.get(&line.account_id) {
                        *expected.cash_banks.entry(cash_bank).or_default() +=
                            line.debit - line.credit;
                    }
                }
            }
        }

        for payment in tables.payments.values().filter(|p| p.is_posted()) {
            if payment.entry_id.is_some_and(|id| is_live(tables, id)) {
                for allocation in &payment.allocations {
                    *expected.paid.entry(allocation.document_id).or_default() +=
                        allocation.allocated_amount;
                }
            }
        }
        expected
    }

    fn account(&self, id: AccountId) -> Decimal {
        self.accounts.get(&id).copied().unwrap_or_default()
    }

    fn cash_bank(&self, id: CashBankId) -> Decimal {
        self.cash_banks.get(&id).copied().unwrap_or_default()
    }

    fn paid(&self, id: DocumentId) -> Decimal {
        self.paid.get(&id).copied().unwrap_or_default()
    }
}

/// An entry's effect stands unless an odd number of reversals follow it.
fn is_live(tables: &Tables, id: EntryId) -> bool {
    let mut live = true;
    let mut current = tables.entry(id);
    while let Some(entry) = current {
        if entry.status == EntryStatus::Draft {
            return false;
        }
        match entry.reversed_by {
            Some(next) => {
                live = !live;
                current = tables.entry(next);
            }
            None => break,
        }
    }
    live
}

/// Stored and recomputed values for one target, or `None` if not measurable.
fn measure(tables: &Tables, expected: &Expected, kind: DiscrepancyKind) -> Option<(Decimal, Decimal)> {
    match kind {
        DiscrepancyKind::AccountBalance(id) => tables
            .account(id)
            .map(|a| (a.balance(), expected.account(id))),
        DiscrepancyKind::HeaderBalance(id) => tables.account(id).map(|a| (a.balance(), Decimal::ZERO)),
        DiscrepancyKind::CashBankBalance(id) => tables
            .cash_bank(id)
            .map(|cb| (cb.balance(), expected.cash_bank(id))),
        DiscrepancyKind::DocumentPaid(id) => tables
            .document(id)
            .map(|d| (d.paid_amount(), expected.paid(id))),
        DiscrepancyKind::DocumentOutstanding(id) => tables.document(id).map(|d| {
            let owed = (d.total_amount - expected.paid(id)).max(Decimal::ZERO);
            (d.outstanding_amount(), owed)
        }),
        DiscrepancyKind::DocumentOverAllocated(id) => tables
            .document(id)
            .map(|d| (expected.paid(id), d.total_amount)),
    }
}

/// Whether a measured pair is reportable.
fn drifted(kind: DiscrepancyKind, stored: Decimal, expected: Decimal, tolerance: Decimal) -> bool {
    match kind {
        DiscrepancyKind::HeaderBalance(_) => !stored.is_zero(),
        DiscrepancyKind::DocumentOverAllocated(_) => stored - expected > tolerance,
        _ => (stored - expected).abs() > tolerance,
    }
}

fn classify(engine: &Engine, kind: DiscrepancyKind, stored: Decimal, difference: Decimal) -> Severity {
    let critical = match kind {
        DiscrepancyKind::HeaderBalance(_) | DiscrepancyKind::DocumentOverAllocated(_) => true,
        DiscrepancyKind::DocumentOutstanding(_) => stored < Decimal::ZERO,
        _ => false,
    };
    if critical {
        Severity::Critical
    } else if difference.abs() <= engine.config.rounding_threshold {
        Severity::Info
    } else {
        Severity::Warning
    }
}

/// Recomputes balances in `scope` and reports every drift.
pub fn validate(engine: &Engine, scope: Scope) -> Report {
    let tolerance = engine.config.tolerance;
    let found: Vec<(DiscrepancyKind, Decimal, Decimal)> = engine.store.read(|tables| {
        let expected = Expected::from_journal(tables);
        let mut found = Vec::new();
        let mut check = |kind: DiscrepancyKind| match measure(tables, &expected, kind) {
            Some((stored, exp)) if drifted(kind, stored, exp, tolerance) => {
                found.push((kind, stored, exp));
                true
            }
            _ => false,
        };

        for account in tables.accounts.values().filter(|a| scope.covers_account(a.id)) {
            check(if account.is_header {
                DiscrepancyKind::HeaderBalance(account.id)
            } else {
                DiscrepancyKind::AccountBalance(account.id)
            });
        }
        for cash_bank in tables.cash_banks.values() {
            if cash_bank.is_linked() && scope.covers_cash_bank(cash_bank.id) {
                check(DiscrepancyKind::CashBankBalance(cash_bank.id));
            }
        }
        for doc in tables.documents.values() {
            // Drafts have no outstanding yet.
            if doc.status() == DocumentStatus::Draft || !scope.covers_document(doc.id) {
                continue;
            }
            if check(DiscrepancyKind::DocumentOverAllocated(doc.id)) {
                continue;
            }
            if doc.outstanding_amount() < Decimal::ZERO {
                check(DiscrepancyKind::DocumentOutstanding(doc.id));
            } else if !check(DiscrepancyKind::DocumentPaid(doc.id)) {
                check(DiscrepancyKind::DocumentOutstanding(doc.id));
            }
        }
        found
    });

    let discrepancies: Vec<Discrepancy> = found
        .into_iter()
        .map(|(kind, stored, expected)| {
            let severity = classify(engine, kind, stored, stored - expected);
            let discrepancy = engine.discrepancies.register(kind, severity, stored, expected);
            warn!(
                discrepancy = %discrepancy.id,
                kind = kind.label(),
                target = %kind.target(),
                %severity,
                %stored,
                %expected,
                "balance drift"
            );
            discrepancy
        })
        .collect();

    let seen: HashSet<DiscrepancyId> = discrepancies.iter().map(|d| d.id).collect();
    engine.discrepancies.prune(scope, &seen);
    info!(?scope, discrepancies = discrepancies.len(), "validation finished");
    Report { discrepancies }
}

/// Posts the correction for one reported discrepancy.
///
/// # Errors
///
/// [`LedgerError::NotRepairable`] if the discrepancy is unknown, the state
/// changed since it was reported, or no posting can fix it (allocations
/// exceeding a document's total).
pub fn repair(engine: &Engine, id: DiscrepancyId) -> Result<JournalEntry, LedgerError> {
    let discrepancy = engine.discrepancies.get(id).ok_or_else(|| LedgerError::NotRepairable {
        id,
        reason: "unknown discrepancy".to_string(),
    })?;
    let operation = discrepancy.operation_id();
    let documents: Vec<DocumentId> = discrepancy.kind.document().into_iter().collect();
    let date = chrono::Local::now().date_naive();

    let entry = engine.write_locked(&documents, |txn| {
        if let Some(&done) = txn.tables().operations.get(&operation) {
            debug!(discrepancy = %id, entry = %done, "repair already applied");
            return txn.tables().entry(done).cloned().ok_or(LedgerError::EntryNotFound(done));
        }

        let expected = Expected::from_journal(txn.tables());
        let current = measure(txn.tables(), &expected, discrepancy.kind);
        if current != Some((discrepancy.stored, discrepancy.expected)) {
            return Err(LedgerError::NotRepairable {
                id,
                reason: "balances changed since validation".to_string(),
            });
        }

        let request = correction(engine, txn.tables(), &discrepancy, &expected, date)?;
        let entry = posting::post_in(txn, &engine.config, request)?;
        txn.record_operation(&operation, entry.id);
        Ok(entry)
    });

    match &entry {
        Ok(entry) => info!(discrepancy = %id, entry = %entry.id, kind = discrepancy.kind.label(), "repaired discrepancy"),
        Err(e) => error!(discrepancy = %id, error = %e, "repair failed"),
    }
    entry
}

/// Builds the `CORRECTION` entry for a discrepancy.
fn correction(
    engine: &Engine,
    tables: &Tables,
    discrepancy: &Discrepancy,
    expected: &Expected,
    date: chrono::NaiveDate,
) -> Result<NewEntry, LedgerError> {
    let suspense = engine.directory.resolve(tables, AccountRole::Suspense)?;
    let entry = NewEntry::new(
        date,
        ReferenceType::Correction,
        &format!("Repair {} {}", discrepancy.kind.label(), discrepancy.kind.target()),
    )
    .reference(&discrepancy.operation_id());

    // Memo pair on suspense: nets to zero, carries the correction.
    let memo = |entry: NewEntry| {
        let amount = discrepancy.difference.abs();
        entry.debit(suspense, amount).credit(suspense, amount)
    };

    let entry = match discrepancy.kind {
        DiscrepancyKind::HeaderBalance(account) => {
            let header = tables
                .account(account)
                .ok_or_else(|| LedgerError::AccountNotFound(account.to_string()))?;
            let equity = engine
                .directory
                .resolve(tables, AccountRole::OpeningBalanceEquity)?;
            let (debit, credit) = header.account_type.sides_for(discrepancy.stored);
            let entry = if debit > Decimal::ZERO {
                entry.debit(suspense, debit).credit(equity, debit)
            } else {
                entry.credit(suspense, credit).debit(equity, credit)
            };
            entry.adjust(Adjustment::CorrectAccount {
                account,
                delta: -discrepancy.stored,
            })
        }
        DiscrepancyKind::AccountBalance(account) => memo(entry).adjust(Adjustment::CorrectAccount {
            account,
            delta: -discrepancy.difference,
        }),
        DiscrepancyKind::CashBankBalance(cash_bank) => {
            memo(entry).adjust(Adjustment::CorrectCashBank {
                cash_bank,
                delta: -discrepancy.difference,
            })
        }
        DiscrepancyKind::DocumentPaid(document)
        | DiscrepancyKind::DocumentOutstanding(document)
        | DiscrepancyKind::DocumentOverAllocated(document) => {
            let doc = tables.document(document).ok_or(LedgerError::DocumentNotFound(document))?;
            let paid = expected.paid(document);
            if paid > doc.total_amount {
                return Err(LedgerError::NotRepairable {
                    id: discrepancy.id,
                    reason: format!("allocations {paid} exceed document total {}", doc.total_amount),
                });
            }
            memo(entry).adjust(Adjustment::Settle {
                document,
                paid_delta: paid - doc.paid_amount(),
            })
        }
    };
    Ok(entry)
}

/// Validates `scope` and repairs every INFO and WARNING discrepancy.
pub fn sweep(engine: &Engine, scope: Scope) -> SweepReport {
    let mut report = SweepReport::default();
    for discrepancy in validate(engine, scope).discrepancies {
        if discrepancy.severity == Severity::Critical {
            report.skipped.push(discrepancy);
            continue;
        }
        match repair(engine, discrepancy.id) {
            Ok(entry) => report.repaired.push((discrepancy.id, entry.id)),
            Err(e) => report.failed.push((discrepancy.id, e)),
        }
    }
    info!(
        repaired = report.repaired.len(),
        skipped = report.skipped.len(),
        failed = report.failed.len(),
        "sweep finished"
    );
    report
}

// ============================================================================
// Scheduled reconciliation
// ============================================================================

#[derive(Debug, Default)]
struct JobState {
    runs: AtomicU64,
    repaired: AtomicU64,
    last_report: Mutex<Option<Report>>,
}

/// Background thread running [`validate`] (or [`sweep`]) on an interval.
///
/// The first run starts immediately. Dropping the job stops it.
pub struct ReconciliationJob {
    stop: Option<Sender<()>>,
    thread: Option<JoinHandle<()>>,
    state: Arc<JobState>,
}

impl ReconciliationJob {
    pub fn spawn(engine: Arc<Engine>, scope: Scope, interval: Duration, auto_fix: bool) -> Self {
        let (stop, stopped) = channel::bounded::<()>(1);
        let state = Arc::new(JobState::default());
        let thread = {
            let state = Arc::clone(&state);
            thread::spawn(move || {
                loop {
                    let report = if auto_fix {
                        let swept = sweep(&engine, scope);
                        state
                            .repaired
                            .fetch_add(swept.repaired.len() as u64, Ordering::Relaxed);
                        // What is left after the repairs.
                        validate(&engine, scope)
                    } else {
                        validate(&engine, scope)
                    };
                    *state.last_report.lock() = Some(report);
                    state.runs.fetch_add(1, Ordering::Relaxed);

                    match stopped.recv_timeout(interval) {
                        Err(RecvTimeoutError::Timeout) => continue,
                        Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                    }
                }
                debug!("reconciliation job stopped");
            })
        };
        Self {
            stop: Some(stop),
            thread: Some(thread),
            state,
        }
    }

    /// Completed runs.
    pub fn runs(&self) -> u64 {
        self.state.runs.load(Ordering::Relaxed)
    }

    /// Discrepancies repaired across all runs.
    pub fn repaired(&self) -> u64 {
        self.state.repaired.load(Ordering::Relaxed)
    }

    pub fn last_report(&self) -> Option<Report> {
        self.state.last_report.lock().clone()
    }

    /// Stops the thread and waits for the current run to finish.
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for ReconciliationJob {
    fn drop(&mut self) {
        self.shutdown();
    }
}
