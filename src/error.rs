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

//! Error types for posting, payment and reconciliation.
//!
//! Validation failures abort the enclosing store transaction and reach the
//! caller unmodified. Reconciliation discrepancies are data, not errors; see
//! [`crate::reconcile`].

use crate::base::{AccountId, CashBankId, DiscrepancyId, DocumentId, EntryId, PaymentId};
use rust_decimal::Decimal;
use thiserror::Error;

/// Ledger engine errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LedgerError {
    /// Total debits differ from total credits beyond tolerance
    #[error("unbalanced entry: debit {debit}, credit {credit}")]
    UnbalancedEntry { debit: Decimal, credit: Decimal },

    /// Line references an account that cannot take postings (header)
    #[error("account {0} does not accept postings")]
    InvalidAccount(AccountId),

    /// Line references an inactive account
    #[error("account {0} is inactive")]
    InactiveAccount(AccountId),

    /// Projector was asked to move the balance of a header account
    #[error("header account {0} cannot carry a balance")]
    HeaderAccountMutation(AccountId),

    /// Allocations do not add up to the payment amount
    #[error("allocations total {allocated} but payment amount is {amount}")]
    OverAllocation { allocated: Decimal, amount: Decimal },

    /// Document is not in a state that accepts payment
    #[error("document {0} does not accept payment")]
    DocumentNotPayable(DocumentId),

    /// Allocation exceeds the document's remaining outstanding amount
    #[error("document {document} has {outstanding} outstanding, {requested} requested")]
    InsufficientOutstanding {
        document: DocumentId,
        outstanding: Decimal,
        requested: Decimal,
    },

    /// A competing operation holds the document; retry after observing new state
    #[error("document {0} is being modified concurrently, retry")]
    ConcurrentModification(DocumentId),

    /// Only posted entries can be reversed
    #[error("entry {0} is not posted")]
    EntryNotPosted(EntryId),

    /// Entry was already reversed
    #[error("entry {0} is already reversed")]
    AlreadyReversed(EntryId),

    /// Discrepancy cannot be repaired by a corrective posting
    #[error("discrepancy {id} is not repairable: {reason}")]
    NotRepairable { id: DiscrepancyId, reason: String },

    #[error("entry has no lines")]
    EmptyEntry,

    /// Line amounts are negative, or both or neither side is set
    #[error("line {index} must have exactly one positive side")]
    InvalidLine { index: usize },

    #[error("invalid amount (must be positive)")]
    InvalidAmount,

    #[error("account {0} not found")]
    AccountNotFound(String),

    #[error("account code {0} already exists")]
    DuplicateAccount(String),

    #[error("cash/bank account {0} not found")]
    CashBankNotFound(CashBankId),

    /// Cash/bank account has no linked GL account and cannot move money
    #[error("cash/bank account {0} is not linked to a ledger account")]
    CashBankNotLinked(CashBankId),

    #[error("document {0} not found")]
    DocumentNotFound(DocumentId),

    #[error("document {0} already exists")]
    DuplicateDocument(DocumentId),

    /// Outstanding amount is initialized exactly once
    #[error("document {0} is already approved")]
    DocumentAlreadyApproved(DocumentId),

    /// Payment direction differs from the document's direction
    #[error("document {0} has a different direction than the payment")]
    DirectionMismatch(DocumentId),

    #[error("entry {0} not found")]
    EntryNotFound(EntryId),

    #[error("payment {0} not found")]
    PaymentNotFound(PaymentId),

    /// Waited too long for a pending posting to complete
    #[error("timed out waiting for payment {0} to post")]
    Timeout(PaymentId),
}

impl LedgerError {
    /// Returns true if the caller may retry the same request.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::ConcurrentModification(_) | Self::Timeout(_))
    }

    /// Returns a stable machine-readable code.
    pub fn code(&self) -> &'static str {
        match self {
            Self::UnbalancedEntry { .. } => "UNBALANCED_ENTRY",
            Self::InvalidAccount(_) => "INVALID_ACCOUNT",
            Self::InactiveAccount(_) => "INACTIVE_ACCOUNT",
            Self::HeaderAccountMutation(_) => "HEADER_ACCOUNT_MUTATION",
            Self::OverAllocation { .. } => "OVER_ALLOCATION",
            Self::DocumentNotPayable(_) => "DOCUMENT_NOT_PAYABLE",
            Self::InsufficientOutstanding { .. } => "INSUFFICIENT_OUTSTANDING",
            Self::ConcurrentModification(_) => "CONCURRENT_MODIFICATION",
            Self::EntryNotPosted(_) => "ENTRY_NOT_POSTED",
            Self::AlreadyReversed(_) => "ALREADY_REVERSED",
            Self::NotRepairable { .. } => "NOT_REPAIRABLE",
            Self::EmptyEntry => "EMPTY_ENTRY",
            Self::InvalidLine { .. } => "INVALID_LINE",
            Self::InvalidAmount => "INVALID_AMOUNT",
            Self::AccountNotFound(_) => "ACCOUNT_NOT_FOUND",
            Self::DuplicateAccount(_) => "DUPLICATE_ACCOUNT",
            Self::CashBankNotFound(_) => "CASH_BANK_NOT_FOUND",
            Self::CashBankNotLinked(_) => "CASH_BANK_NOT_LINKED",
            Self::DocumentNotFound(_) => "DOCUMENT_NOT_FOUND",
            Self::DuplicateDocument(_) => "DUPLICATE_DOCUMENT",
            Self::DocumentAlreadyApproved(_) => "DOCUMENT_ALREADY_APPROVED",
            Self::DirectionMismatch(_) => "DIRECTION_MISMATCH",
            Self::EntryNotFound(_) => "ENTRY_NOT_FOUND",
            Self::PaymentNotFound(_) => "PAYMENT_NOT_FOUND",
            Self::Timeout(_) => "TIMEOUT",
        }
    }
}
