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

//! Payment allocation processor.
//!
//! A payment moves through these steps:
//!
//! 1. [`precheck`]: amounts positive, allocations sum exactly to the amount
//! 2. [`DocumentLocks::with_locked`]: every target document, ascending id
//! 3. [`check_allocations`]: re-read under lock; state, direction, outstanding
//! 4. [`record_in`] + [`post_payment_in`]: one balanced entry per payment
//!
//! Steps 3 and 4 run inside one store transaction, so a payment either
//! commits with all of its projections or leaves no trace.

use crate::base::{DocumentId, PaymentId};
use crate::config::EngineConfig;
use crate::document::Direction;
use crate::error::LedgerError;
use crate::interfaces::{AccountDirectory, AccountRole};
use crate::journal::{Adjustment, NewEntry, ReferenceType};
use crate::payment::{Payment, PaymentRequest, PaymentStatus};
use crate::posting;
use crate::store::{Tables, Txn};
use dashmap::DashMap;
use parking_lot::Mutex;
use rust_decimal::Decimal;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Document-scoped serialization sections.
///
/// One mutex per document, created on first use and dropped once no caller
/// holds it. Callers pass ids in ascending order so two payments over
/// crossing document sets cannot wait on each other.
#[derive(Debug)]
pub(crate) struct DocumentLocks {
    locks: DashMap<DocumentId, Arc<Mutex<()>>>,
    timeout: Duration,
}

impl DocumentLocks {
    pub(crate) fn new(timeout: Duration) -> Self {
        Self {
            locks: DashMap::new(),
            timeout,
        }
    }

    /// Runs `f` while holding every lock in `documents`.
    ///
    /// # Errors
    ///
    /// [`LedgerError::ConcurrentModification`] if a lock is not granted
    /// within the timeout. Locks already taken are released.
    pub(crate) fn with_locked<R>(
        &self,
        documents: &[DocumentId],
        f: impl FnOnce() -> Result<R, LedgerError>,
    ) -> Result<R, LedgerError> {
        debug_assert!(documents.windows(2).all(|w| w[0] < w[1]));

        // The DashMap shard guard is dropped before any document lock is taken.
        let mutexes: Vec<(DocumentId, Arc<Mutex<()>>)> = documents
            .iter()
            .map(|&id| (id, Arc::clone(&self.locks.entry(id).or_default())))
            .collect();

        let mut guards = Vec::with_capacity(mutexes.len());
        let mut timed_out = None;
        for (id, mutex) in &mutexes {
            match mutex.try_lock_for(self.timeout) {
                Some(guard) => guards.push(guard),
                None => {
                    timed_out = Some(*id);
                    break;
                }
            }
        }

        let result = match timed_out {
            None => f(),
            Some(id) => {
                warn!(document = %id, timeout_ms = self.timeout.as_millis() as u64, "document lock timed out");
                Err(LedgerError::ConcurrentModification(id))
            }
        };
        drop(guards);
        self.release(mutexes);
        result
    }

    /// Drops map entries nobody else holds.
    fn release(&self, mutexes: Vec<(DocumentId, Arc<Mutex<()>>)>) {
        for (id, mutex) in mutexes {
            drop(mutex);
            self.locks.remove_if(&id, |_, m| Arc::strong_count(m) == 1);
        }
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.locks.len()
    }
}

/// Checks that need no store access.
pub(crate) fn precheck(request: &PaymentRequest) -> Result<(), LedgerError> {
    if request.amount <= Decimal::ZERO
        || request.allocations.iter().any(|a| a.amount <= Decimal::ZERO)
    {
        return Err(LedgerError::InvalidAmount);
    }
    let allocated = request.allocated_total();
    if allocated != request.amount {
        return Err(LedgerError::OverAllocation {
            allocated,
            amount: request.amount,
        });
    }
    Ok(())
}

/// Checks the request against committed state. Must run under the locks.
///
/// Outstanding reserved by payments still in the outbox counts as taken.
pub(crate) fn check_allocations(tables: &Tables, request: &PaymentRequest) -> Result<(), LedgerError> {
    let cash_bank = tables
        .cash_bank(request.cash_bank)
        .ok_or(LedgerError::CashBankNotFound(request.cash_bank))?;
    if !cash_bank.is_linked() {
        return Err(LedgerError::CashBankNotLinked(request.cash_bank));
    }

    let mut requested: BTreeMap<DocumentId, Decimal> = BTreeMap::new();
    for allocation in &request.allocations {
        *requested.entry(allocation.document).or_default() += allocation.amount;
    }

    for (&id, &amount) in &requested {
        let doc = tables.document(id).ok_or(LedgerError::DocumentNotFound(id))?;
        if doc.direction != request.direction {
            return Err(LedgerError::DirectionMismatch(id));
        }
        if !doc.status().accepts_payment() {
            return Err(LedgerError::DocumentNotPayable(id));
        }
        let available = doc.outstanding_amount() - tables.pending_allocations(id);
        if amount > available {
            return Err(LedgerError::InsufficientOutstanding {
                document: id,
                outstanding: available,
                requested: amount,
            });
        }
    }
    Ok(())
}

/// Inserts the payment as `Pending` and returns its id.
pub(crate) fn record_in(txn: &mut Txn<'_>, request: &PaymentRequest) -> PaymentId {
    let id = txn.next_payment_id();
    txn.insert_payment(Payment::from_request(id, request));
    id
}

/// Builds the payment's journal entry.
///
/// Receivable: debit the cash-linked account, credit receivables.
/// Payable: debit payables, credit the cash-linked account.
/// One line pair and one settlement per allocation.
pub(crate) fn build_entry(
    tables: &Tables,
    directory: &dyn AccountDirectory,
    payment: &Payment,
) -> Result<NewEntry, LedgerError> {
    let cash = tables
        .cash_bank(payment.cash_bank)
        .ok_or(LedgerError::CashBankNotFound(payment.cash_bank))?
        .account_id
        .ok_or(LedgerError::CashBankNotLinked(payment.cash_bank))?;
    let counter = directory.resolve(tables, AccountRole::counter_for(payment.direction))?;

    let (reference_type, debit, credit) = match payment.direction {
        Direction::Receivable => (ReferenceType::Receipt, cash, counter),
        Direction::Payable => (ReferenceType::Disbursement, counter, cash),
    };

    let mut entry = NewEntry::new(
        payment.date,
        reference_type,
        &format!("Payment {}", payment.reference),
    )
    .reference(&payment.reference);
    for allocation in &payment.allocations {
        entry = entry
            .debit(debit, allocation.allocated_amount)
            .credit(credit, allocation.allocated_amount)
            .adjust(Adjustment::Settle {
                document: allocation.document_id,
                paid_delta: allocation.allocated_amount,
            });
    }
    Ok(entry)
}

/// Posts a recorded payment's entry and marks the payment posted.
///
/// A payment that is already posted is returned unchanged.
pub(crate) fn post_payment_in(
    txn: &mut Txn<'_>,
    config: &EngineConfig,
    directory: &dyn AccountDirectory,
    id: PaymentId,
) -> Result<Payment, LedgerError> {
    let payment = txn
        .tables()
        .payment(id)
        .cloned()
        .ok_or(LedgerError::PaymentNotFound(id))?;
    if payment.is_posted() {
        return Ok(payment);
    }

    let request = build_entry(txn.tables(), directory, &payment)?;
    let entry = posting::post_in(txn, config, request)?;

    let row = txn.payment_mut(id).ok_or(LedgerError::PaymentNotFound(id))?;
    row.status = PaymentStatus::Posted;
    row.entry_id = Some(entry.id);
    let posted = row.clone();
    if txn.tables().outbox.contains_key(&id) {
        txn.clear_outbox(id);
    }

    info!(
        payment = %id,
        reference = %posted.reference,
        entry = %entry.id,
        amount = %posted.amount,
        direction = %posted.direction,
        "posted payment"
    );
    Ok(posted)
}

/// Logs an idempotent replay.
pub(crate) fn log_replay(existing: &Payment) {
    debug!(payment = %existing.id, reference = %existing.reference, "payment replay");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::account::{Account, AccountType, CashBankAccount, NewAccount};
    use crate::base::{AccountId, CashBankId};
    use crate::document::{DocumentStatus, OutstandingDocument};
    use crate::interfaces::ChartDirectory;
    use crate::payment::OutboxRecord;
    use crate::store::Store;
    use chrono::NaiveDate;
    use rust_decimal_macros::dec;
    use std::thread;

    fn date() -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 2, 14).unwrap()
    }

    fn receipt(reference: &str, amount: Decimal) -> PaymentRequest {
        PaymentRequest::new(reference, CashBankId(1), amount, date(), Direction::Receivable)
            .allocate(DocumentId(1), amount)
    }

    /// Cash 1101 linked to cash bank 1, receivables 1201, one approved
    /// receivable of 1000 and one payable of 400.
    fn seeded() -> Store {
        let store = Store::new();
        store
            .transaction(|txn| {
                for def in [
                    NewAccount::detail("1101", "Cash", AccountType::Asset),
                    NewAccount::detail("1201", "Receivables", AccountType::Asset),
                    NewAccount::detail("2101", "Payables", AccountType::Liability),
                ] {
                    let id = txn.next_account_id();
                    txn.insert_account(Account::new(id, def));
                }
                let cb = txn.next_cash_bank_id();
                txn.insert_cash_bank(CashBankAccount::new(cb, "Main", Some(AccountId(1))));
                let cb = txn.next_cash_bank_id();
                txn.insert_cash_bank(CashBankAccount::new(cb, "Petty", None));

                for (id, direction, total) in [
                    (1, Direction::Receivable, dec!(1000)),
                    (2, Direction::Payable, dec!(400)),
                ] {
                    let mut doc = OutstandingDocument::new(DocumentId(id), direction, total);
                    doc.status = DocumentStatus::Approved;
                    doc.outstanding_amount = total;
                    txn.insert_document(doc);
                }
                Ok(())
            })
            .unwrap();
        store
    }

    #[test]
    fn precheck_requires_exact_allocation() {
        assert_eq!(precheck(&receipt("R", dec!(10))), Ok(()));

        let short = PaymentRequest::new("R", CashBankId(1), dec!(100), date(), Direction::Receivable)
            .allocate(DocumentId(1), dec!(60));
        assert_eq!(
            precheck(&short),
            Err(LedgerError::OverAllocation {
                allocated: dec!(60),
                amount: dec!(100)
            })
        );

        let negative = PaymentRequest::new("R", CashBankId(1), dec!(100), date(), Direction::Receivable)
            .allocate(DocumentId(1), dec!(150))
            .allocate(DocumentId(1), dec!(-50));
        assert_eq!(precheck(&negative), Err(LedgerError::InvalidAmount));
    }

    #[test]
    fn check_allocations_rejects_bad_targets() {
        let store = seeded();
        store.read(|t| {
            assert_eq!(check_allocations(t, &receipt("R", dec!(1000))), Ok(()));
            assert_eq!(
                check_allocations(t, &receipt("R", dec!(1000.01))),
                Err(LedgerError::InsufficientOutstanding {
                    document: DocumentId(1),
                    outstanding: dec!(1000),
                    requested: dec!(1000.01),
                })
            );

            let wrong_way =
                PaymentRequest::new("R", CashBankId(1), dec!(5), date(), Direction::Receivable)
                    .allocate(DocumentId(2), dec!(5));
            assert_eq!(
                check_allocations(t, &wrong_way),
                Err(LedgerError::DirectionMismatch(DocumentId(2)))
            );

            let unlinked =
                PaymentRequest::new("R", CashBankId(2), dec!(5), date(), Direction::Receivable)
                    .allocate(DocumentId(1), dec!(5));
            assert_eq!(
                check_allocations(t, &unlinked),
                Err(LedgerError::CashBankNotLinked(CashBankId(2)))
            );
        });
    }

    #[test]
    fn duplicate_allocations_are_summed_per_document() {
        let store = seeded();
        let request = PaymentRequest::new("R", CashBankId(1), dec!(1200), date(), Direction::Receivable)
            .allocate(DocumentId(1), dec!(600))
            .allocate(DocumentId(1), dec!(600));
        store.read(|t| {
            assert!(matches!(
                check_allocations(t, &request),
                Err(LedgerError::InsufficientOutstanding { requested, .. }) if requested == dec!(1200)
            ));
        });
    }

    #[test]
    fn pending_outbox_reserves_outstanding() {
        let store = seeded();
        store
            .transaction(|txn| {
                let id = record_in(txn, &receipt("R-1", dec!(700)));
                txn.enqueue_outbox(OutboxRecord {
                    payment_id: id,
                    attempts: 0,
                    last_error: None,
                });
                Ok(())
            })
            .unwrap();

        store.read(|t| {
            assert_eq!(
                check_allocations(t, &receipt("R-2", dec!(400))),
                Err(LedgerError::InsufficientOutstanding {
                    document: DocumentId(1),
                    outstanding: dec!(300),
                    requested: dec!(400),
                })
            );
        });
    }

    #[test]
    fn posting_a_payment_settles_and_clears_outbox() {
        let store = seeded();
        let config = EngineConfig::default();
        let directory = ChartDirectory::default();

        let (payment, _) = store
            .transaction(|txn| {
                let id = record_in(txn, &receipt("R-1", dec!(250)));
                txn.enqueue_outbox(OutboxRecord {
                    payment_id: id,
                    attempts: 0,
                    last_error: None,
                });
                post_payment_in(txn, &config, &directory, id)
            })
            .unwrap();

        assert!(payment.is_posted());
        store.read(|t| {
            assert!(t.outbox.is_empty());
            assert_eq!(t.account(AccountId(1)).unwrap().balance(), dec!(250));
            assert_eq!(t.account(AccountId(2)).unwrap().balance(), dec!(-250));
            assert_eq!(t.cash_bank(CashBankId(1)).unwrap().balance(), dec!(250));
            assert_eq!(t.document(DocumentId(1)).unwrap().outstanding_amount(), dec!(750));
            let entry = t.entry(payment.entry_id.unwrap()).unwrap();
            assert_eq!(entry.reference_type, ReferenceType::Receipt);
            assert_eq!(entry.reference_id.as_deref(), Some("R-1"));
        });
    }

    #[test]
    fn payable_credits_cash() {
        let store = seeded();
        let config = EngineConfig::default();
        let directory = ChartDirectory::default();
        let request = PaymentRequest::new("P-1", CashBankId(1), dec!(400), date(), Direction::Payable)
            .allocate(DocumentId(2), dec!(400));

        store
            .transaction(|txn| {
                let id = record_in(txn, &request);
                post_payment_in(txn, &config, &directory, id)
            })
            .unwrap();

        store.read(|t| {
            assert_eq!(t.account(AccountId(1)).unwrap().balance(), dec!(-400));
            assert_eq!(t.account(AccountId(3)).unwrap().balance(), dec!(-400));
            assert_eq!(t.cash_bank(CashBankId(1)).unwrap().balance(), dec!(-400));
            assert_eq!(t.document(DocumentId(2)).unwrap().status(), DocumentStatus::Paid);
        });
    }

    #[test]
    fn lock_timeout_is_concurrent_modification() {
        let locks = Arc::new(DocumentLocks::new(Duration::from_millis(20)));
        let (held_tx, held_rx) = crossbeam::channel::bounded(0);
        let (release_tx, release_rx) = crossbeam::channel::bounded::<()>(0);

        let holder = {
            let locks = Arc::clone(&locks);
            thread::spawn(move || {
                locks
                    .with_locked(&[DocumentId(1)], || {
                        held_tx.send(()).unwrap();
                        release_rx.recv().unwrap();
                        Ok(())
                    })
                    .unwrap();
            })
        };

        held_rx.recv().unwrap();
        let result = locks.with_locked(&[DocumentId(1), DocumentId(2)], || Ok(()));
        assert_eq!(result, Err(LedgerError::ConcurrentModification(DocumentId(1))));
        assert!(result.unwrap_err().is_retryable());

        release_tx.send(()).unwrap();
        holder.join().unwrap();
        assert_eq!(locks.with_locked(&[DocumentId(1)], || Ok(7)), Ok(7));
        assert_eq!(locks.len(), 0);
    }

    #[test]
    fn released_locks_leave_the_map() {
        let locks = DocumentLocks::new(Duration::from_millis(20));
        for id in 1..=50 {
            locks
                .with_locked(&[DocumentId(id), DocumentId(id + 100)], || {
                    assert_eq!(locks.len(), 2);
                    Ok(())
                })
                .unwrap();
        }
        assert_eq!(locks.len(), 0);
    }
}
