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

//! Journal entries and lines.
//!
//! Entries follow a state machine:
//! - [`Draft`] → [`Posted`] (via post)
//! - [`Posted`] → [`Reversed`] (via reverse, which posts a mirror entry)
//!
//! Posted rows are never deleted or edited; the only change a posted entry
//! ever sees is the `Reversed` mark.
//!
//! [`Draft`]: EntryStatus::Draft
//! [`Posted`]: EntryStatus::Posted
//! [`Reversed`]: EntryStatus::Reversed

use crate::base::{AccountId, CashBankId, DocumentId, EntryId};
use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// What kind of business event produced the entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReferenceType {
    Manual,
    Sale,
    Purchase,
    /// Incoming payment against receivables.
    Receipt,
    /// Outgoing payment against payables.
    Disbursement,
    Deposit,
    Withdrawal,
    Transfer,
    /// Repair posted by reconciliation.
    Correction,
}

impl ReferenceType {
    /// Entries of these types move cash/bank balances.
    pub fn is_cash_bank(self) -> bool {
        matches!(
            self,
            Self::Receipt | Self::Disbursement | Self::Deposit | Self::Withdrawal | Self::Transfer
        )
    }
}

impl FromStr for ReferenceType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "MANUAL" => Ok(Self::Manual),
            "SALE" => Ok(Self::Sale),
            "PURCHASE" => Ok(Self::Purchase),
            "RECEIPT" => Ok(Self::Receipt),
            "DISBURSEMENT" => Ok(Self::Disbursement),
            "DEPOSIT" => Ok(Self::Deposit),
            "WITHDRAWAL" => Ok(Self::Withdrawal),
            "TRANSFER" => Ok(Self::Transfer),
            "CORRECTION" => Ok(Self::Correction),
            other => Err(format!("unknown reference type '{other}'")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum EntryStatus {
    Draft,
    Posted,
    Reversed,
}

/// One leg of a journal entry as supplied by the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LineInput {
    pub account_id: AccountId,
    pub debit: Decimal,
    pub credit: Decimal,
}

impl LineInput {
    pub fn debit(account_id: AccountId, amount: Decimal) -> Self {
        Self {
            account_id,
            debit: amount,
            credit: Decimal::ZERO,
        }
    }

    pub fn credit(account_id: AccountId, amount: Decimal) -> Self {
        Self {
            account_id,
            debit: Decimal::ZERO,
            credit: amount,
        }
    }

    /// Exactly one side positive, neither negative.
    pub(crate) fn is_well_formed(&self) -> bool {
        let zero = Decimal::ZERO;
        self.debit >= zero
            && self.credit >= zero
            && ((self.debit > zero) ^ (self.credit > zero))
    }
}

/// A committed journal line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct JournalLine {
    pub entry_id: EntryId,
    pub account_id: AccountId,
    pub debit: Decimal,
    pub credit: Decimal,
}

/// Materialized-field effect carried by an entry besides its GL lines.
///
/// Settlements are how a payment entry reaches a document. Corrections are
/// only attached by reconciliation repairs; they move a stored balance
/// without contributing to the journal sums it is recomputed from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Adjustment {
    Settle {
        document: DocumentId,
        paid_delta: Decimal,
    },
    CorrectAccount {
        account: AccountId,
        delta: Decimal,
    },
    CorrectCashBank {
        cash_bank: CashBankId,
        delta: Decimal,
    },
}

impl Adjustment {
    fn negated(self) -> Self {
        match self {
            Self::Settle {
                document,
                paid_delta,
            } => Self::Settle {
                document,
                paid_delta: -paid_delta,
            },
            Self::CorrectAccount { account, delta } => Self::CorrectAccount {
                account,
                delta: -delta,
            },
            Self::CorrectCashBank { cash_bank, delta } => Self::CorrectCashBank {
                cash_bank,
                delta: -delta,
            },
        }
    }
}

/// Journal entry request, built with chained calls.
///
/// ```
/// use chrono::NaiveDate;
/// use ledger_recon::{AccountId, NewEntry, ReferenceType};
/// use rust_decimal_macros::dec;
///
/// let entry = NewEntry::new(
///     NaiveDate::from_ymd_opt(2025, 1, 31).unwrap(),
///     ReferenceType::Manual,
///     "Accrue rent",
/// )
/// .debit(AccountId(5), dec!(1200))
/// .credit(AccountId(9), dec!(1200));
/// assert_eq!(entry.lines.len(), 2);
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewEntry {
    pub date: NaiveDate,
    pub reference_type: ReferenceType,
    pub reference_id: Option<String>,
    pub description: String,
    pub lines: Vec<LineInput>,
    pub(crate) adjustments: Vec<Adjustment>,
}

impl NewEntry {
    pub fn new(date: NaiveDate, reference_type: ReferenceType, description: &str) -> Self {
        Self {
            date,
            reference_type,
            reference_id: None,
            description: description.to_string(),
            lines: Vec::new(),
            adjustments: Vec::new(),
        }
    }

    pub fn reference(mut self, reference_id: &str) -> Self {
        self.reference_id = Some(reference_id.to_string());
        self
    }

    pub fn debit(mut self, account_id: AccountId, amount: Decimal) -> Self {
        self.lines.push(LineInput::debit(account_id, amount));
        self
    }

    pub fn credit(mut self, account_id: AccountId, amount: Decimal) -> Self {
        self.lines.push(LineInput::credit(account_id, amount));
        self
    }

    pub(crate) fn adjust(mut self, adjustment: Adjustment) -> Self {
        self.adjustments.push(adjustment);
        self
    }

    pub fn totals(&self) -> (Decimal, Decimal) {
        self.lines.iter().fold((Decimal::ZERO, Decimal::ZERO), |(d, c), l| {
            (d + l.debit, c + l.credit)
        })
    }
}

/// Committed transaction header with its lines.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JournalEntry {
    pub id: EntryId,
    pub date: NaiveDate,
    pub status: EntryStatus,
    pub reference_type: ReferenceType,
    pub reference_id: Option<String>,
    pub description: String,
    pub lines: Vec<JournalLine>,
    pub adjustments: Vec<Adjustment>,
    /// Set on a mirror entry: the entry it reverses.
    pub reverses: Option<EntryId>,
    /// Set on a reversed entry: its mirror.
    pub reversed_by: Option<EntryId>,
}

impl JournalEntry {
    pub(crate) fn from_request(id: EntryId, status: EntryStatus, request: NewEntry) -> Self {
        let lines = request
            .lines
            .iter()
            .map(|l| JournalLine {
                entry_id: id,
                account_id: l.account_id,
                debit: l.debit,
                credit: l.credit,
            })
            .collect();
        Self {
            id,
            date: request.date,
            status,
            reference_type: request.reference_type,
            reference_id: request.reference_id,
            description: request.description,
            lines,
            adjustments: request.adjustments,
            reverses: None,
            reversed_by: None,
        }
    }

    /// Back to request form, e.g. to post a stored draft.
    pub(crate) fn to_request(&self) -> NewEntry {
        NewEntry {
            date: self.date,
            reference_type: self.reference_type,
            reference_id: self.reference_id.clone(),
            description: self.description.clone(),
            lines: self
                .lines
                .iter()
                .map(|l| LineInput {
                    account_id: l.account_id,
                    debit: l.debit,
                    credit: l.credit,
                })
                .collect(),
            adjustments: self.adjustments.clone(),
        }
    }

    /// The exact debit/credit mirror, keeping the reference type so
    /// cash/bank projections unwind too.
    pub(crate) fn mirror(&self, date: NaiveDate) -> NewEntry {
        NewEntry {
            date,
            reference_type: self.reference_type,
            reference_id: self.reference_id.clone(),
            description: format!("Reversal of {}", self.id),
            lines: self
                .lines
                .iter()
                .map(|l| LineInput {
                    account_id: l.account_id,
                    debit: l.credit,
                    credit: l.debit,
                })
                .collect(),
            adjustments: self.adjustments.iter().map(|a| a.negated()).collect(),
        }
    }

    pub fn totals(&self) -> (Decimal, Decimal) {
        self.lines.iter().fold((Decimal::ZERO, Decimal::ZERO), |(d, c), l| {
            (d + l.debit, c + l.credit)
        })
    }

    /// Posted or reversed; both count towards journal sums.
    pub fn is_booked(&self) -> bool {
        !matches!(self.status, EntryStatus::Draft)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn date() -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 3, 1).unwrap()
    }

    #[test]
    fn line_must_have_exactly_one_side() {
        assert!(LineInput::debit(AccountId(1), dec!(10)).is_well_formed());
        assert!(LineInput::credit(AccountId(1), dec!(10)).is_well_formed());
        assert!(!LineInput::debit(AccountId(1), dec!(0)).is_well_formed());
        assert!(!LineInput::debit(AccountId(1), dec!(-5)).is_well_formed());
        let both = LineInput {
            account_id: AccountId(1),
            debit: dec!(1),
            credit: dec!(1),
        };
        assert!(!both.is_well_formed());
    }

    #[test]
    fn cash_bank_reference_types() {
        assert!(ReferenceType::Receipt.is_cash_bank());
        assert!(ReferenceType::Disbursement.is_cash_bank());
        assert!(ReferenceType::Transfer.is_cash_bank());
        assert!(!ReferenceType::Sale.is_cash_bank());
        assert!(!ReferenceType::Correction.is_cash_bank());
        assert_eq!("deposit".parse::<ReferenceType>(), Ok(ReferenceType::Deposit));
        assert!("refund".parse::<ReferenceType>().is_err());
    }

    #[test]
    fn mirror_swaps_sides_and_negates_adjustments() {
        let request = NewEntry::new(date(), ReferenceType::Receipt, "Receipt")
            .reference("PAY-1")
            .debit(AccountId(1), dec!(500))
            .credit(AccountId(2), dec!(500))
            .adjust(Adjustment::Settle {
                document: DocumentId(7),
                paid_delta: dec!(500),
            });
        let entry = JournalEntry::from_request(EntryId(3), EntryStatus::Posted, request);

        let mirror = entry.mirror(date());
        assert_eq!(mirror.reference_type, ReferenceType::Receipt);
        assert_eq!(mirror.lines[0], LineInput::credit(AccountId(1), dec!(500)));
        assert_eq!(mirror.lines[1], LineInput::debit(AccountId(2), dec!(500)));
        assert_eq!(
            mirror.adjustments,
            vec![Adjustment::Settle {
                document: DocumentId(7),
                paid_delta: dec!(-500),
            }]
        );
        assert_eq!(mirror.description, "Reversal of je-3");
    }

    #[test]
    fn totals_sum_each_side() {
        let request = NewEntry::new(date(), ReferenceType::Manual, "Split")
            .debit(AccountId(1), dec!(60))
            .debit(AccountId(2), dec!(40))
            .credit(AccountId(3), dec!(100));
        assert_eq!(request.totals(), (dec!(100), dec!(100)));
    }
}
