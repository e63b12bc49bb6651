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

//! Balance projector.
//!
//! The only writer of `Account.balance`, `CashBankAccount.balance` and the
//! paid/outstanding/status fields of documents. Every function takes the
//! posting's [`Txn`], so a projection can only happen inside a posting.
//!
//! All updates are deltas against the row being updated; status is a pure
//! function of the new outstanding amount. Replaying the same postings in
//! the same order always lands on the same balances.

use crate::base::{AccountId, CashBankId, DocumentId};
use crate::document::DocumentStatus;
use crate::error::LedgerError;
use crate::journal::{Adjustment, JournalEntry};
use crate::store::{DocumentEvent, Txn};
use rust_decimal::Decimal;
use tracing::debug;

/// Adds `delta` to a detail account's balance.
///
/// # Errors
///
/// [`LedgerError::HeaderAccountMutation`] if the account is a header.
pub(crate) fn apply(txn: &mut Txn<'_>, account_id: AccountId, delta: Decimal) -> Result<(), LedgerError> {
    let account = txn
        .account_mut(account_id)
        .ok_or_else(|| LedgerError::AccountNotFound(account_id.to_string()))?;
    if account.is_header {
        return Err(LedgerError::HeaderAccountMutation(account_id));
    }
    account.balance += delta;
    Ok(())
}

/// Adds `delta` to a cash/bank balance.
pub(crate) fn apply_cash_bank(
    txn: &mut Txn<'_>,
    cash_bank: CashBankId,
    delta: Decimal,
) -> Result<(), LedgerError> {
    let row = txn
        .cash_bank_mut(cash_bank)
        .ok_or(LedgerError::CashBankNotFound(cash_bank))?;
    row.balance += delta;
    Ok(())
}

/// Adds `paid_delta` to a document's paid amount and re-derives the rest.
///
/// Outstanding is clamped at zero; status becomes `Paid` when outstanding is
/// within `tolerance` of zero and `Approved` otherwise. Raises the
/// document-service notification for the new state.
///
/// # Errors
///
/// [`LedgerError::InsufficientOutstanding`] when a positive delta would take
/// the paid amount beyond the total by more than `tolerance`.
pub(crate) fn apply_outstanding(
    txn: &mut Txn<'_>,
    document: DocumentId,
    paid_delta: Decimal,
    tolerance: Decimal,
) -> Result<(), LedgerError> {
    let doc = txn
        .document_mut(document)
        .ok_or(LedgerError::DocumentNotFound(document))?;
    if doc.status == DocumentStatus::Draft {
        return Err(LedgerError::DocumentNotPayable(document));
    }
    // Bounded by the total rather than the stored outstanding.
    let remaining = doc.total_amount - doc.paid_amount;
    if paid_delta > Decimal::ZERO && paid_delta > remaining + tolerance {
        return Err(LedgerError::InsufficientOutstanding {
            document,
            outstanding: doc.outstanding_amount,
            requested: paid_delta,
        });
    }

    let was_paid = doc.status == DocumentStatus::Paid;
    doc.paid_amount += paid_delta;
    doc.outstanding_amount = (doc.total_amount - doc.paid_amount).max(Decimal::ZERO);
    doc.status = if doc.outstanding_amount <= tolerance {
        DocumentStatus::Paid
    } else {
        DocumentStatus::Approved
    };

    let event = match (was_paid, doc.status) {
        (false, DocumentStatus::Paid) => Some(DocumentEvent::FullyPaid(document)),
        (_, DocumentStatus::Approved) if !paid_delta.is_zero() => {
            Some(DocumentEvent::PartiallyPaid {
                document,
                outstanding: doc.outstanding_amount,
            })
        }
        _ => None,
    };
    debug!(
        %document,
        paid = %doc.paid_amount,
        outstanding = %doc.outstanding_amount,
        status = ?doc.status,
        "projected document"
    );
    if let Some(event) = event {
        txn.raise(event);
    }
    Ok(())
}

/// Makes a draft document payable, initializing outstanding to the total.
///
/// # Errors
///
/// [`LedgerError::DocumentAlreadyApproved`] unless the document is a draft.
pub(crate) fn open_document(txn: &mut Txn<'_>, document: DocumentId) -> Result<(), LedgerError> {
    let doc = txn
        .document_mut(document)
        .ok_or(LedgerError::DocumentNotFound(document))?;
    if doc.status != DocumentStatus::Draft {
        return Err(LedgerError::DocumentAlreadyApproved(document));
    }
    doc.status = DocumentStatus::Approved;
    doc.paid_amount = Decimal::ZERO;
    doc.outstanding_amount = doc.total_amount;
    debug!(%document, outstanding = %doc.outstanding_amount, "opened document");
    Ok(())
}

/// Projects every effect of a freshly booked entry.
///
/// One account update per line; a cash/bank update per line on a linked
/// account when the entry is cash/bank typed; then the entry's adjustments.
pub(crate) fn project(
    txn: &mut Txn<'_>,
    entry: &JournalEntry,
    tolerance: Decimal,
) -> Result<(), LedgerError> {
    for line in &entry.lines {
        let account_type = txn
            .tables()
            .account(line.account_id)
            .map(|a| a.account_type)
            .ok_or_else(|| LedgerError::AccountNotFound(line.account_id.to_string()))?;
        apply(txn, line.account_id, account_type.signed_delta(line.debit, line.credit))?;

        if entry.reference_type.is_cash_bank() {
            let linked = txn.tables().cash_bank_links.get(&line.account_id).copied();
            if let Some(cash_bank) = linked {
                apply_cash_bank(txn, cash_bank, line.debit - line.credit)?;
            }
        }
    }

    for adjustment in &entry.adjustments {
        match *adjustment {
            Adjustment::Settle {
                document,
                paid_delta,
            } => apply_outstanding(txn, document, paid_delta, tolerance)?,
            Adjustment::CorrectAccount { account, delta } => apply(txn, account, delta)
                .or_else(|e| match e {
                    // Corrections may move a header towards zero.
                    LedgerError::HeaderAccountMutation(_) => correct_header(txn, account, delta),
                    other => Err(other),
                })?,
            Adjustment::CorrectCashBank { cash_bank, delta } => {
                apply_cash_bank(txn, cash_bank, delta)?
            }
        }
    }
    Ok(())
}

/// Moves a header's stray balance by `delta`, allowed only towards zero.
fn correct_header(txn: &mut Txn<'_>, account_id: AccountId, delta: Decimal) -> Result<(), LedgerError> {
    let account = txn
        .account_mut(account_id)
        .ok_or_else(|| LedgerError::AccountNotFound(account_id.to_string()))?;
    let corrected = account.balance + delta;
    if corrected.abs() > account.balance.abs() {
        return Err(LedgerError::HeaderAccountMutation(account_id));
    }
    account.balance = corrected;
    Ok(())
}
