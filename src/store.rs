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

//! Ledger store: the relational state and its transactions.
//!
//! All tables live behind one [`RwLock`]. Writers run inside
//! [`Store::transaction`], which hands the closure a [`Txn`]. Every row the
//! transaction touches is recorded in an undo log first; if the closure
//! returns an error the log is replayed backwards and the counters restored,
//! so readers only ever see committed state.

use crate::account::{Account, CashBankAccount};
use crate::base::{AccountId, CashBankId, DocumentId, EntryId, PaymentId};
use crate::document::OutstandingDocument;
use crate::error::LedgerError;
use crate::journal::JournalEntry;
use crate::payment::{OutboxRecord, Payment};
use parking_lot::{Condvar, Mutex, RwLock};
use rust_decimal::Decimal;
use std::collections::{BTreeMap, HashMap};
use std::time::Instant;

/// Notification raised by the projector, delivered after commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocumentEvent {
    FullyPaid(DocumentId),
    PartiallyPaid {
        document: DocumentId,
        outstanding: Decimal,
    },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct Counters {
    account: u32,
    cash_bank: u32,
    entry: u64,
    payment: u64,
}

/// Committed rows, indexed the way the engine queries them.
#[derive(Debug, Default)]
pub struct Tables {
    pub(crate) accounts: BTreeMap<AccountId, Account>,
    pub(crate) account_codes: HashMap<String, AccountId>,
    pub(crate) cash_banks: BTreeMap<CashBankId, CashBankAccount>,
    /// Linked ledger account → cash/bank account (1:1).
    pub(crate) cash_bank_links: HashMap<AccountId, CashBankId>,
    pub(crate) documents: BTreeMap<DocumentId, OutstandingDocument>,
    pub(crate) entries: BTreeMap<EntryId, JournalEntry>,
    pub(crate) payments: BTreeMap<PaymentId, Payment>,
    pub(crate) payment_refs: HashMap<String, PaymentId>,
    pub(crate) outbox: BTreeMap<PaymentId, OutboxRecord>,
    /// Idempotent-operation registry: operation id → entry it posted.
    pub(crate) operations: HashMap<String, EntryId>,
    counters: Counters,
}

impl Tables {
    pub fn account(&self, id: AccountId) -> Option<&Account> {
        self.accounts.get(&id)
    }

    pub fn account_by_code(&self, code: &str) -> Option<&Account> {
        self.account_codes
            .get(code)
            .and_then(|id| self.accounts.get(id))
    }

    pub fn cash_bank(&self, id: CashBankId) -> Option<&CashBankAccount> {
        self.cash_banks.get(&id)
    }

    pub fn document(&self, id: DocumentId) -> Option<&OutstandingDocument> {
        self.documents.get(&id)
    }

    pub fn entry(&self, id: EntryId) -> Option<&JournalEntry> {
        self.entries.get(&id)
    }

    pub fn payment(&self, id: PaymentId) -> Option<&Payment> {
        self.payments.get(&id)
    }

    pub fn payment_by_reference(&self, reference: &str) -> Option<&Payment> {
        self.payment_refs
            .get(reference)
            .and_then(|id| self.payments.get(id))
    }

    /// Amount reserved on a document by payments still in the outbox.
    pub fn pending_allocations(&self, document: DocumentId) -> Decimal {
        self.outbox
            .keys()
            .filter_map(|id| self.payments.get(id))
            .map(|p| p.allocated_to(document))
            .sum()
    }
}

/// Prior state of one touched row.
#[derive(Debug)]
enum Undo {
    Account(AccountId, Option<Account>),
    AccountCode(String, Option<AccountId>),
    CashBank(CashBankId, Option<CashBankAccount>),
    CashBankLink(AccountId, Option<CashBankId>),
    Document(DocumentId, Option<OutstandingDocument>),
    Entry(EntryId, Option<JournalEntry>),
    Payment(PaymentId, Option<Payment>),
    PaymentRef(String, Option<PaymentId>),
    Outbox(PaymentId, Option<OutboxRecord>),
    Operation(String, Option<EntryId>),
}

fn restore<K: Ord, V>(map: &mut BTreeMap<K, V>, key: K, prior: Option<V>) {
    match prior {
        Some(v) => {
            map.insert(key, v);
        }
        None => {
            map.remove(&key);
        }
    }
}

fn restore_hashed<K: std::hash::Hash + Eq, V>(map: &mut HashMap<K, V>, key: K, prior: Option<V>) {
    match prior {
        Some(v) => {
            map.insert(key, v);
        }
        None => {
            map.remove(&key);
        }
    }
}

/// A write transaction over [`Tables`].
///
/// Reads go straight to the tables; every mutable accessor logs the row's
/// prior state before handing it out.
pub struct Txn<'a> {
    tables: &'a mut Tables,
    undo: Vec<Undo>,
    counters: Counters,
    events: Vec<DocumentEvent>,
}

impl<'a> Txn<'a> {
    fn begin(tables: &'a mut Tables) -> Self {
        let counters = tables.counters;
        Self {
            tables,
            undo: Vec::new(),
            counters,
            events: Vec::new(),
        }
    }

    fn rollback(mut self) {
        while let Some(undo) = self.undo.pop() {
            let t = &mut *self.tables;
            match undo {
                Undo::Account(k, v) => restore(&mut t.accounts, k, v),
                Undo::AccountCode(k, v) => restore_hashed(&mut t.account_codes, k, v),
                Undo::CashBank(k, v) => restore(&mut t.cash_banks, k, v),
                Undo::CashBankLink(k, v) => restore_hashed(&mut t.cash_bank_links, k, v),
                Undo::Document(k, v) => restore(&mut t.documents, k, v),
                Undo::Entry(k, v) => restore(&mut t.entries, k, v),
                Undo::Payment(k, v) => restore(&mut t.payments, k, v),
                Undo::PaymentRef(k, v) => restore_hashed(&mut t.payment_refs, k, v),
                Undo::Outbox(k, v) => restore(&mut t.outbox, k, v),
                Undo::Operation(k, v) => restore_hashed(&mut t.operations, k, v),
            }
        }
        self.tables.counters = self.counters;
    }

    pub fn tables(&self) -> &Tables {
        &*self.tables
    }

    pub(crate) fn next_account_id(&mut self) -> AccountId {
        self.tables.counters.account += 1;
        AccountId(self.tables.counters.account)
    }

    pub(crate) fn next_cash_bank_id(&mut self) -> CashBankId {
        self.tables.counters.cash_bank += 1;
        CashBankId(self.tables.counters.cash_bank)
    }

    pub(crate) fn next_entry_id(&mut self) -> EntryId {
        self.tables.counters.entry += 1;
        EntryId(self.tables.counters.entry)
    }

    pub(crate) fn next_payment_id(&mut self) -> PaymentId {
        self.tables.counters.payment += 1;
        PaymentId(self.tables.counters.payment)
    }

    pub(crate) fn account_mut(&mut self, id: AccountId) -> Option<&mut Account> {
        let prior = self.tables.accounts.get(&id)?.clone();
        self.undo.push(Undo::Account(id, Some(prior)));
        self.tables.accounts.get_mut(&id)
    }

    pub(crate) fn insert_account(&mut self, account: Account) {
        let (id, code) = (account.id, account.code.clone());
        let prior_code = self.tables.account_codes.insert(code.clone(), id);
        self.undo.push(Undo::AccountCode(code, prior_code));
        let prior = self.tables.accounts.insert(id, account);
        self.undo.push(Undo::Account(id, prior));
    }

    pub(crate) fn cash_bank_mut(&mut self, id: CashBankId) -> Option<&mut CashBankAccount> {
        let prior = self.tables.cash_banks.get(&id)?.clone();
        self.undo.push(Undo::CashBank(id, Some(prior)));
        self.tables.cash_banks.get_mut(&id)
    }

    pub(crate) fn insert_cash_bank(&mut self, cash_bank: CashBankAccount) {
        let id = cash_bank.id;
        if let Some(account) = cash_bank.account_id {
            let prior_link = self.tables.cash_bank_links.insert(account, id);
            self.undo.push(Undo::CashBankLink(account, prior_link));
        }
        let prior = self.tables.cash_banks.insert(id, cash_bank);
        self.undo.push(Undo::CashBank(id, prior));
    }

    pub(crate) fn document_mut(&mut self, id: DocumentId) -> Option<&mut OutstandingDocument> {
        let prior = self.tables.documents.get(&id)?.clone();
        self.undo.push(Undo::Document(id, Some(prior)));
        self.tables.documents.get_mut(&id)
    }

    pub(crate) fn insert_document(&mut self, document: OutstandingDocument) {
        let id = document.id;
        let prior = self.tables.documents.insert(id, document);
        self.undo.push(Undo::Document(id, prior));
    }

    pub(crate) fn entry_mut(&mut self, id: EntryId) -> Option<&mut JournalEntry> {
        let prior = self.tables.entries.get(&id)?.clone();
        self.undo.push(Undo::Entry(id, Some(prior)));
        self.tables.entries.get_mut(&id)
    }

    pub(crate) fn insert_entry(&mut self, entry: JournalEntry) {
        let id = entry.id;
        let prior = self.tables.entries.insert(id, entry);
        self.undo.push(Undo::Entry(id, prior));
    }

    pub(crate) fn payment_mut(&mut self, id: PaymentId) -> Option<&mut Payment> {
        let prior = self.tables.payments.get(&id)?.clone();
        self.undo.push(Undo::Payment(id, Some(prior)));
        self.tables.payments.get_mut(&id)
    }

    pub(crate) fn insert_payment(&mut self, payment: Payment) {
        let (id, reference) = (payment.id, payment.reference.clone());
        let prior_ref = self.tables.payment_refs.insert(reference.clone(), id);
        self.undo.push(Undo::PaymentRef(reference, prior_ref));
        let prior = self.tables.payments.insert(id, payment);
        self.undo.push(Undo::Payment(id, prior));
    }

    pub(crate) fn outbox_mut(&mut self, id: PaymentId) -> Option<&mut OutboxRecord> {
        let prior = self.tables.outbox.get(&id)?.clone();
        self.undo.push(Undo::Outbox(id, Some(prior)));
        self.tables.outbox.get_mut(&id)
    }

    pub(crate) fn enqueue_outbox(&mut self, record: OutboxRecord) {
        let id = record.payment_id;
        let prior = self.tables.outbox.insert(id, record);
        self.undo.push(Undo::Outbox(id, prior));
    }

    pub(crate) fn clear_outbox(&mut self, id: PaymentId) {
        let prior = self.tables.outbox.remove(&id);
        self.undo.push(Undo::Outbox(id, prior));
    }

    pub(crate) fn record_operation(&mut self, operation: &str, entry: EntryId) {
        let prior = self.tables.operations.insert(operation.to_string(), entry);
        self.undo.push(Undo::Operation(operation.to_string(), prior));
    }

    pub(crate) fn raise(&mut self, event: DocumentEvent) {
        self.events.push(event);
    }
}

/// The single mutable resource of the engine.
#[derive(Debug, Default)]
pub struct Store {
    tables: RwLock<Tables>,
    /// Bumped after every commit; waiters re-check their condition on change.
    commit_seq: Mutex<u64>,
    committed: Condvar,
}

impl Store {
    pub fn new() -> Self {
        Self::default()
    }

    /// Runs `f` against a consistent snapshot.
    pub fn read<R>(&self, f: impl FnOnce(&Tables) -> R) -> R {
        f(&self.tables.read())
    }

    /// Runs `f` atomically. On error nothing `f` wrote is kept.
    ///
    /// Returns the closure's value and the document events to deliver.
    pub fn transaction<R>(
        &self,
        f: impl FnOnce(&mut Txn<'_>) -> Result<R, LedgerError>,
    ) -> Result<(R, Vec<DocumentEvent>), LedgerError> {
        let result = {
            let mut tables = self.tables.write();
            let mut txn = Txn::begin(&mut tables);
            match f(&mut txn) {
                Ok(value) => Ok((value, std::mem::take(&mut txn.events))),
                Err(error) => {
                    txn.rollback();
                    Err(error)
                }
            }
        };
        if result.is_ok() {
            *self.commit_seq.lock() += 1;
            self.committed.notify_all();
        }
        result
    }

    /// Blocks until `done` holds on committed state or `deadline` passes.
    ///
    /// Returns the final evaluation of `done`.
    pub fn wait_until(&self, deadline: Instant, done: impl Fn(&Tables) -> bool) -> bool {
        let mut seq = self.commit_seq.lock();
        loop {
            if self.read(&done) {
                return true;
            }
            if self.committed.wait_until(&mut seq, deadline).timed_out() {
                return self.read(&done);
            }
        }
    }
}
