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

//! Ledger engine.
//!
//! The [`Engine`] is the facade collaborators call into. It owns the store,
//! the document locks and the collaborator seams, and wires every request
//! through the posting engine.
//!
//! # Operations
//!
//! - **Setup**: create accounts and cash/bank accounts, register and approve
//!   documents.
//! - **Posting**: post, save and post drafts, reverse.
//! - **Payments**: apply synchronously, or accept into the outbox.
//! - **Reconciliation**: validate, repair, sweep (see [`crate::reconcile`]).
//!
//! # Thread Safety
//!
//! All methods take `&self`. Writes serialize on the store's write lock;
//! payments additionally serialize per document on [`DocumentLocks`], so
//! the engine can be shared across threads behind an [`Arc`].

use crate::account::{Account, CashBankAccount, NewAccount};
use crate::allocation::{self, DocumentLocks};
use crate::base::{AccountId, CashBankId, DiscrepancyId, DocumentId, EntryId, PaymentId};
use crate::config::EngineConfig;
use crate::document::{Direction, OutstandingDocument, OutstandingSummary};
use crate::error::LedgerError;
use crate::interfaces::{self, AccountDirectory, ChartDirectory, DocumentObserver, NoopObserver};
use crate::journal::{Adjustment, JournalEntry, NewEntry};
use crate::payment::{OutboxRecord, Payment, PaymentRequest};
use crate::posting;
use crate::projector;
use crate::reconcile::{self, Discrepancy, DiscrepancyLog, Report, Scope, SweepReport};
use crate::store::{DocumentEvent, Store, Tables, Txn};
use chrono::NaiveDate;
use rust_decimal::Decimal;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};

/// Posting and reconciliation engine.
///
/// # Invariants
///
/// - Every posted entry balances within `tolerance`.
/// - Every detail account balance equals the signed sum of its booked lines.
/// - Header accounts never take postings.
/// - A document's outstanding never goes negative, and only the projector
///   moves it.
pub struct Engine {
    pub(crate) store: Store,
    pub(crate) config: EngineConfig,
    pub(crate) directory: Box<dyn AccountDirectory>,
    observer: Arc<dyn DocumentObserver>,
    pub(crate) locks: DocumentLocks,
    pub(crate) discrepancies: DiscrepancyLog,
}

impl Engine {
    /// Creates an empty engine resolving roles from `config.accounts`.
    pub fn new(config: EngineConfig) -> Self {
        Engine {
            store: Store::new(),
            directory: Box::new(ChartDirectory::new(config.accounts.clone())),
            observer: Arc::new(NoopObserver),
            locks: DocumentLocks::new(config.lock_timeout()),
            discrepancies: DiscrepancyLog::new(),
            config,
        }
    }

    /// Replaces the document-service observer.
    pub fn with_observer(mut self, observer: Arc<dyn DocumentObserver>) -> Self {
        self.observer = observer;
        self
    }

    /// Replaces the account directory.
    pub fn with_directory(mut self, directory: impl AccountDirectory + 'static) -> Self {
        self.directory = Box::new(directory);
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Runs a write transaction and delivers its document events.
    pub(crate) fn write<R>(
        &self,
        f: impl FnOnce(&mut Txn<'_>) -> Result<R, LedgerError>,
    ) -> Result<R, LedgerError> {
        let (value, events) = self.store.transaction(f)?;
        self.notify(&events);
        Ok(value)
    }

    /// Runs a write transaction while holding the documents' locks.
    ///
    /// Events are delivered once the locks are released, so an observer may
    /// call back into the engine for the same documents.
    pub(crate) fn write_locked<R>(
        &self,
        documents: &[DocumentId],
        f: impl FnOnce(&mut Txn<'_>) -> Result<R, LedgerError>,
    ) -> Result<R, LedgerError> {
        let (value, events) = self
            .locks
            .with_locked(documents, || self.store.transaction(f))?;
        self.notify(&events);
        Ok(value)
    }

    pub(crate) fn notify(&self, events: &[DocumentEvent]) {
        interfaces::dispatch(self.observer.as_ref(), events);
    }

    // ========================================================================
    // Setup
    // ========================================================================

    /// Adds an account to the chart.
    ///
    /// # Errors
    ///
    /// [`LedgerError::DuplicateAccount`] if the code is taken.
    pub fn create_account(&self, definition: NewAccount) -> Result<AccountId, LedgerError> {
        self.write(|txn| {
            if txn.tables().account_by_code(&definition.code).is_some() {
                return Err(LedgerError::DuplicateAccount(definition.code));
            }
            let id = txn.next_account_id();
            info!(account = %id, code = %definition.code, header = definition.is_header, "created account");
            txn.insert_account(Account::new(id, definition));
            Ok(id)
        })
    }

    /// Activates or deactivates a detail account for future postings.
    pub fn set_account_active(&self, id: AccountId, active: bool) -> Result<(), LedgerError> {
        self.write(|txn| {
            let account = txn
                .account_mut(id)
                .ok_or_else(|| LedgerError::AccountNotFound(id.to_string()))?;
            account.active = active;
            Ok(())
        })
    }

    /// Adds a cash/bank account, optionally linked to a detail account.
    ///
    /// # Errors
    ///
    /// - [`LedgerError::InvalidAccount`] if the linked account is a header
    /// - [`LedgerError::DuplicateAccount`] if the account is already linked
    pub fn create_cash_bank(
        &self,
        name: &str,
        account: Option<AccountId>,
    ) -> Result<CashBankId, LedgerError> {
        self.write(|txn| {
            if let Some(account_id) = account {
                let linked = txn
                    .tables()
                    .account(account_id)
                    .ok_or_else(|| LedgerError::AccountNotFound(account_id.to_string()))?;
                if linked.is_header {
                    return Err(LedgerError::InvalidAccount(account_id));
                }
                if txn.tables().cash_bank_links.contains_key(&account_id) {
                    return Err(LedgerError::DuplicateAccount(linked.code.clone()));
                }
            }
            let id = txn.next_cash_bank_id();
            txn.insert_cash_bank(CashBankAccount::new(id, name, account));
            info!(cash_bank = %id, name, linked = account.is_some(), "created cash/bank account");
            Ok(id)
        })
    }

    /// Registers a draft document. It takes no payment until approved.
    pub fn register_document(
        &self,
        id: DocumentId,
        direction: Direction,
        total_amount: Decimal,
    ) -> Result<(), LedgerError> {
        if total_amount <= Decimal::ZERO {
            return Err(LedgerError::InvalidAmount);
        }
        self.write(|txn| {
            if txn.tables().document(id).is_some() {
                return Err(LedgerError::DuplicateDocument(id));
            }
            txn.insert_document(OutstandingDocument::new(id, direction, total_amount));
            Ok(())
        })
    }

    /// Makes a document payable; outstanding starts at the total.
    ///
    /// # Errors
    ///
    /// [`LedgerError::DocumentAlreadyApproved`] on any second call.
    pub fn approve_document(&self, id: DocumentId) -> Result<(), LedgerError> {
        self.write_locked(&[id], |txn| projector::open_document(txn, id))?;
        info!(document = %id, "approved document");
        Ok(())
    }

    // ========================================================================
    // Legacy import
    //
    // Direct writes of materialized values carried over from another system.
    // Nothing checks them against the journal; reconciliation will.
    // ========================================================================

    /// Overwrites an account's stored balance.
    pub fn import_opening_balance(&self, id: AccountId, balance: Decimal) -> Result<(), LedgerError> {
        self.write(|txn| {
            let account = txn
                .account_mut(id)
                .ok_or_else(|| LedgerError::AccountNotFound(id.to_string()))?;
            account.balance = balance;
            Ok(())
        })?;
        warn!(account = %id, %balance, "imported account balance");
        Ok(())
    }

    /// Overwrites a cash/bank account's stored balance.
    pub fn import_cash_bank_balance(&self, id: CashBankId, balance: Decimal) -> Result<(), LedgerError> {
        self.write(|txn| {
            let row = txn.cash_bank_mut(id).ok_or(LedgerError::CashBankNotFound(id))?;
            row.balance = balance;
            Ok(())
        })?;
        warn!(cash_bank = %id, %balance, "imported cash/bank balance");
        Ok(())
    }

    /// Overwrites a document's stored paid and outstanding amounts.
    pub fn import_document_amounts(
        &self,
        id: DocumentId,
        paid: Decimal,
        outstanding: Decimal,
    ) -> Result<(), LedgerError> {
        self.write_locked(&[id], |txn| {
            let doc = txn.document_mut(id).ok_or(LedgerError::DocumentNotFound(id))?;
            doc.paid_amount = paid;
            doc.outstanding_amount = outstanding;
            Ok(())
        })?;
        warn!(document = %id, %paid, %outstanding, "imported document amounts");
        Ok(())
    }

    // ========================================================================
    // Posting
    // ========================================================================

    /// Posts a balanced entry and projects it onto balances.
    ///
    /// # Errors
    ///
    /// - [`LedgerError::EmptyEntry`] / [`LedgerError::InvalidLine`]
    /// - [`LedgerError::InvalidAccount`] for header accounts
    /// - [`LedgerError::InactiveAccount`]
    /// - [`LedgerError::UnbalancedEntry`]
    pub fn post(&self, entry: NewEntry) -> Result<JournalEntry, LedgerError> {
        self.write(|txn| posting::post_in(txn, &self.config, entry))
    }

    /// Stores a validated entry as a draft without touching balances.
    pub fn save_draft(&self, entry: NewEntry) -> Result<JournalEntry, LedgerError> {
        self.write(|txn| posting::save_draft_in(txn, &self.config, entry))
    }

    /// Posts a stored draft.
    pub fn post_draft(&self, id: EntryId) -> Result<JournalEntry, LedgerError> {
        self.write(|txn| posting::post_draft_in(txn, &self.config, id))
    }

    /// Reverses a posted entry with a mirror dated today.
    pub fn reverse(&self, id: EntryId) -> Result<JournalEntry, LedgerError> {
        self.reverse_on(id, chrono::Local::now().date_naive())
    }

    /// Reverses a posted entry with a mirror dated `date`.
    ///
    /// Documents settled by the entry are locked for the duration, so a
    /// reversed payment cannot race a new one on the same document.
    ///
    /// # Errors
    ///
    /// - [`LedgerError::EntryNotPosted`] for drafts
    /// - [`LedgerError::AlreadyReversed`]
    pub fn reverse_on(&self, id: EntryId, date: NaiveDate) -> Result<JournalEntry, LedgerError> {
        let documents = self
            .store
            .read(|t| t.entry(id).map(settled_documents))
            .ok_or(LedgerError::EntryNotFound(id))?;
        self.write_locked(&documents, |txn| posting::reverse_in(txn, &self.config, id, date))
    }

    // ========================================================================
    // Payments
    // ========================================================================

    /// Applies a payment synchronously: one posted entry, all projections.
    ///
    /// Replaying a request with a known `reference` returns the original
    /// payment and changes nothing.
    ///
    /// # Errors
    ///
    /// - [`LedgerError::OverAllocation`] unless allocations sum to the amount
    /// - [`LedgerError::DocumentNotPayable`]
    /// - [`LedgerError::InsufficientOutstanding`]
    /// - [`LedgerError::ConcurrentModification`] (retryable)
    pub fn apply_payment(&self, request: PaymentRequest) -> Result<Payment, LedgerError> {
        allocation::precheck(&request)?;
        if let Some(existing) = self.payment_by_reference(&request.reference) {
            allocation::log_replay(&existing);
            return Ok(existing);
        }

        self.write_locked(&request.lock_order(), |txn| {
            if let Some(existing) = txn.tables().payment_by_reference(&request.reference) {
                allocation::log_replay(existing);
                return Ok(existing.clone());
            }
            allocation::check_allocations(txn.tables(), &request)?;
            let id = allocation::record_in(txn, &request);
            allocation::post_payment_in(txn, &self.config, self.directory.as_ref(), id)
        })
    }

    /// Accepts a payment into the outbox without posting it.
    ///
    /// The pending payment reserves its allocations, so later payments see
    /// the reduced outstanding. Use [`Engine::wait_for_posting`] before
    /// trusting balances that should include it.
    pub fn accept_payment(&self, request: PaymentRequest) -> Result<Payment, LedgerError> {
        allocation::precheck(&request)?;
        if let Some(existing) = self.payment_by_reference(&request.reference) {
            allocation::log_replay(&existing);
            return Ok(existing);
        }

        let payment = self.write_locked(&request.lock_order(), |txn| {
            if let Some(existing) = txn.tables().payment_by_reference(&request.reference) {
                return Ok(existing.clone());
            }
            allocation::check_allocations(txn.tables(), &request)?;
            let id = allocation::record_in(txn, &request);
            txn.enqueue_outbox(OutboxRecord {
                payment_id: id,
                attempts: 0,
                last_error: None,
            });
            txn.tables().payment(id).cloned().ok_or(LedgerError::PaymentNotFound(id))
        })?;
        info!(payment = %payment.id, reference = %payment.reference, amount = %payment.amount, "accepted payment");
        Ok(payment)
    }

    /// Posts one pending payment from the outbox.
    pub(crate) fn post_pending(&self, id: PaymentId) -> Result<Payment, LedgerError> {
        let documents = self
            .store
            .read(|t| {
                t.payment(id).map(|p| {
                    let mut ids: Vec<DocumentId> = p.allocations.iter().map(|a| a.document_id).collect();
                    ids.sort_unstable();
                    ids.dedup();
                    ids
                })
            })
            .ok_or(LedgerError::PaymentNotFound(id))?;
        self.write_locked(&documents, |txn| {
            allocation::post_payment_in(txn, &self.config, self.directory.as_ref(), id)
        })
    }

    /// Blocks until a payment's entry is posted, or `timeout` passes.
    ///
    /// # Errors
    ///
    /// - [`LedgerError::PaymentNotFound`]
    /// - [`LedgerError::Timeout`] (retryable)
    pub fn wait_for_posting(&self, id: PaymentId, timeout: Duration) -> Result<Payment, LedgerError> {
        if self.payment(id).is_none() {
            return Err(LedgerError::PaymentNotFound(id));
        }
        let deadline = Instant::now() + timeout;
        self.store
            .wait_until(deadline, |t| t.payment(id).is_some_and(Payment::is_posted));
        match self.payment(id) {
            Some(payment) if payment.is_posted() => Ok(payment),
            Some(_) => Err(LedgerError::Timeout(id)),
            None => Err(LedgerError::PaymentNotFound(id)),
        }
    }

    // ========================================================================
    // Reconciliation
    // ========================================================================

    /// Recomputes balances from the journal and reports drift.
    pub fn validate(&self, scope: Scope) -> Report {
        reconcile::validate(self, scope)
    }

    /// Posts the correction for a reported discrepancy.
    ///
    /// # Errors
    ///
    /// [`LedgerError::NotRepairable`]
    pub fn repair(&self, id: DiscrepancyId) -> Result<JournalEntry, LedgerError> {
        reconcile::repair(self, id)
    }

    /// Validates and repairs every non-critical discrepancy.
    pub fn sweep(&self, scope: Scope) -> SweepReport {
        reconcile::sweep(self, scope)
    }

    pub fn discrepancy(&self, id: DiscrepancyId) -> Option<Discrepancy> {
        self.discrepancies.get(id)
    }

    // ========================================================================
    // Readers
    // ========================================================================

    /// Runs `f` against a consistent snapshot of every table.
    pub fn snapshot<R>(&self, f: impl FnOnce(&Tables) -> R) -> R {
        self.store.read(f)
    }

    pub fn account(&self, id: AccountId) -> Option<Account> {
        self.store.read(|t| t.account(id).cloned())
    }

    pub fn account_by_code(&self, code: &str) -> Option<Account> {
        self.store.read(|t| t.account_by_code(code).cloned())
    }

    /// All accounts in id order.
    pub fn accounts(&self) -> Vec<Account> {
        self.store.read(|t| t.accounts.values().cloned().collect())
    }

    pub fn cash_bank(&self, id: CashBankId) -> Option<CashBankAccount> {
        self.store.read(|t| t.cash_bank(id).cloned())
    }

    pub fn cash_banks(&self) -> Vec<CashBankAccount> {
        self.store.read(|t| t.cash_banks.values().cloned().collect())
    }

    pub fn document(&self, id: DocumentId) -> Option<OutstandingDocument> {
        self.store.read(|t| t.document(id).cloned())
    }

    /// Document service query: total, outstanding and derived status.
    pub fn outstanding(&self, id: DocumentId) -> Option<OutstandingSummary> {
        self.store.read(|t| t.document(id).map(OutstandingDocument::summary))
    }

    pub fn entry(&self, id: EntryId) -> Option<JournalEntry> {
        self.store.read(|t| t.entry(id).cloned())
    }

    /// All entries in id order, drafts included.
    pub fn entries(&self) -> Vec<JournalEntry> {
        self.store.read(|t| t.entries.values().cloned().collect())
    }

    pub fn payment(&self, id: PaymentId) -> Option<Payment> {
        self.store.read(|t| t.payment(id).cloned())
    }

    pub fn payment_by_reference(&self, reference: &str) -> Option<Payment> {
        self.store.read(|t| t.payment_by_reference(reference).cloned())
    }

    /// Outbox markers still waiting for their entry, oldest first.
    pub fn pending_outbox(&self) -> Vec<OutboxRecord> {
        self.store.read(|t| t.outbox.values().cloned().collect())
    }
}

impl Default for Engine {
    fn default() -> Self {
        Self::new(EngineConfig::default())
    }
}

/// Documents an entry's settlements touch, in lock order.
fn settled_documents(entry: &JournalEntry) -> Vec<DocumentId> {
    let mut ids: Vec<DocumentId> = entry
        .adjustments
        .iter()
        .filter_map(|a| match a {
            Adjustment::Settle { document, .. } => Some(*document),
            _ => None,
        })
        .collect();
    ids.sort_unstable();
    ids.dedup();
    ids
}
