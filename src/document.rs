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

//! Receivable and payable documents.
//!
//! Documents follow a state machine:
//!
//! ```text
//! Draft ──approve──► Approved ──(outstanding reaches 0)──► Paid
//!                       ▲                                   │
//!                       └────────(reversal of a payment)────┘
//! ```
//!
//! `PartiallyPaid` is a read state derived from the amounts, never stored.

use crate::base::DocumentId;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Which side of the business the document sits on.
///
/// Set explicitly at creation; never inferred from a payment method label.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Direction {
    /// Sale: money comes in.
    Receivable,
    /// Purchase: money goes out.
    Payable,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Receivable => f.write_str("RECEIVABLE"),
            Self::Payable => f.write_str("PAYABLE"),
        }
    }
}

impl FromStr for Direction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "RECEIVABLE" | "IN" => Ok(Self::Receivable),
            "PAYABLE" | "OUT" => Ok(Self::Payable),
            other => Err(format!("unknown direction '{other}'")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DocumentStatus {
    Draft,
    Approved,
    PartiallyPaid,
    Paid,
}

impl DocumentStatus {
    /// States in which a payment may be allocated to the document.
    pub fn accepts_payment(self) -> bool {
        matches!(self, Self::Approved | Self::PartiallyPaid)
    }
}

/// A receivable (sale) or payable (purchase) with a remaining unpaid amount.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutstandingDocument {
    pub id: DocumentId,
    pub direction: Direction,
    pub total_amount: Decimal,
    pub(crate) paid_amount: Decimal,
    pub(crate) outstanding_amount: Decimal,
    pub(crate) status: DocumentStatus,
}

impl OutstandingDocument {
    pub(crate) fn new(id: DocumentId, direction: Direction, total_amount: Decimal) -> Self {
        Self {
            id,
            direction,
            total_amount,
            paid_amount: Decimal::ZERO,
            outstanding_amount: Decimal::ZERO,
            status: DocumentStatus::Draft,
        }
    }

    pub fn paid_amount(&self) -> Decimal {
        self.paid_amount
    }

    pub fn outstanding_amount(&self) -> Decimal {
        self.outstanding_amount
    }

    /// Persisted status.
    pub fn status(&self) -> DocumentStatus {
        self.status
    }

    /// Status as presented to readers, deriving `PartiallyPaid` from amounts.
    pub fn effective_status(&self) -> DocumentStatus {
        match self.status {
            DocumentStatus::Approved if self.paid_amount > Decimal::ZERO => {
                DocumentStatus::PartiallyPaid
            }
            status => status,
        }
    }

    /// Read-only summary handed to document services.
    pub fn summary(&self) -> OutstandingSummary {
        OutstandingSummary {
            total_amount: self.total_amount,
            outstanding_amount: self.outstanding_amount,
            status: self.effective_status(),
        }
    }
}

/// Answer to a document service's `getOutstanding` query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct OutstandingSummary {
    pub total_amount: Decimal,
    pub outstanding_amount: Decimal,
    pub status: DocumentStatus,
}
