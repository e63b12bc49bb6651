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

//! Payments and their allocations to documents.

use crate::base::{CashBankId, DocumentId, EntryId, PaymentId};
use crate::document::Direction;
use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Portion of a payment requested against one document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct AllocationRequest {
    pub document: DocumentId,
    pub amount: Decimal,
}

/// A request to move money against one or more documents.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaymentRequest {
    /// Caller-supplied idempotency token.
    pub reference: String,
    pub cash_bank: CashBankId,
    pub amount: Decimal,
    pub date: NaiveDate,
    pub direction: Direction,
    pub allocations: Vec<AllocationRequest>,
}

impl PaymentRequest {
    pub fn new(
        reference: &str,
        cash_bank: CashBankId,
        amount: Decimal,
        date: NaiveDate,
        direction: Direction,
    ) -> Self {
        Self {
            reference: reference.to_string(),
            cash_bank,
            amount,
            date,
            direction,
            allocations: Vec::new(),
        }
    }

    pub fn allocate(mut self, document: DocumentId, amount: Decimal) -> Self {
        self.allocations.push(AllocationRequest { document, amount });
        self
    }

    pub fn allocated_total(&self) -> Decimal {
        self.allocations.iter().map(|a| a.amount).sum()
    }

    /// Target documents, ascending and deduplicated: the lock order.
    pub fn lock_order(&self) -> Vec<DocumentId> {
        let mut ids: Vec<DocumentId> = self.allocations.iter().map(|a| a.document).collect();
        ids.sort_unstable();
        ids.dedup();
        ids
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PaymentStatus {
    /// Accepted; its journal entry is waiting in the outbox.
    Pending,
    Posted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PaymentAllocation {
    pub payment_id: PaymentId,
    pub document_id: DocumentId,
    pub allocated_amount: Decimal,
}

/// A recorded cash movement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Payment {
    pub id: PaymentId,
    pub reference: String,
    pub cash_bank: CashBankId,
    pub amount: Decimal,
    pub date: NaiveDate,
    pub direction: Direction,
    pub status: PaymentStatus,
    /// Journal entry, once posted.
    pub entry_id: Option<EntryId>,
    pub allocations: Vec<PaymentAllocation>,
}

impl Payment {
    pub(crate) fn from_request(id: PaymentId, request: &PaymentRequest) -> Self {
        Self {
            id,
            reference: request.reference.clone(),
            cash_bank: request.cash_bank,
            amount: request.amount,
            date: request.date,
            direction: request.direction,
            status: PaymentStatus::Pending,
            entry_id: None,
            allocations: request
                .allocations
                .iter()
                .map(|a| PaymentAllocation {
                    payment_id: id,
                    document_id: a.document,
                    allocated_amount: a.amount,
                })
                .collect(),
        }
    }

    /// Sum allocated to `document` by this payment.
    pub fn allocated_to(&self, document: DocumentId) -> Decimal {
        self.allocations
            .iter()
            .filter(|a| a.document_id == document)
            .map(|a| a.allocated_amount)
            .sum()
    }

    pub fn is_posted(&self) -> bool {
        self.status == PaymentStatus::Posted
    }
}

/// Durable marker that a pending payment still needs its journal entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboxRecord {
    pub payment_id: PaymentId,
    pub attempts: u32,
    pub last_error: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn request() -> PaymentRequest {
        PaymentRequest::new(
            "PAY-1",
            CashBankId(1),
            dec!(300),
            NaiveDate::from_ymd_opt(2025, 5, 2).unwrap(),
            Direction::Receivable,
        )
        .allocate(DocumentId(9), dec!(100))
        .allocate(DocumentId(3), dec!(150))
        .allocate(DocumentId(9), dec!(50))
    }

    #[test]
    fn lock_order_is_sorted_and_unique() {
        assert_eq!(request().lock_order(), vec![DocumentId(3), DocumentId(9)]);
    }

    #[test]
    fn allocations_total() {
        assert_eq!(request().allocated_total(), dec!(300));
    }

    #[test]
    fn payment_starts_pending() {
        let payment = Payment::from_request(PaymentId(4), &request());
        assert_eq!(payment.status, PaymentStatus::Pending);
        assert_eq!(payment.entry_id, None);
        assert_eq!(payment.allocated_to(DocumentId(9)), dec!(150));
        assert!(payment.allocations.iter().all(|a| a.payment_id == PaymentId(4)));
    }
}
