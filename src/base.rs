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

//! Core identifier types for ledger rows.

use serde::{Deserialize, Serialize};
use std::fmt;

macro_rules! id_type {
    ($(#[$meta:meta])* $name:ident($inner:ty), $prefix:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Deserialize, Serialize)]
        #[serde(transparent)]
        pub struct $name(pub $inner);

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!($prefix, "{}"), self.0)
            }
        }
    };
}

id_type!(
    /// Identifier of a general-ledger account.
    AccountId(u32),
    "acct-"
);

id_type!(
    /// Identifier of a journal entry.
    ///
    /// Assigned by the store in commit order, so ids are monotonic.
    EntryId(u64),
    "je-"
);

id_type!(
    /// Identifier of a cash or bank account.
    CashBankId(u32),
    "cb-"
);

id_type!(
    /// Identifier of a receivable or payable document.
    ///
    /// Ordering matters: document locks are always taken in ascending id order.
    DocumentId(u64),
    "doc-"
);

id_type!(
    /// Identifier of a payment.
    PaymentId(u64),
    "pay-"
);

id_type!(
    /// Identifier of a reconciliation discrepancy.
    DiscrepancyId(u64),
    "disc-"
);
