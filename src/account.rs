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

//! General-ledger and cash/bank accounts.
//!
//! Balances on these rows are materialized projections of the journal. Only
//! [`crate::projector`] writes them.
//!
//! # Example
//!
//! ```
//! use rust_decimal_macros::dec;
//! use ledger_recon::AccountType;
//!
//! // A 100.00 debit raises an asset and lowers a liability.
//! assert_eq!(AccountType::Asset.signed_delta(dec!(100), dec!(0)), dec!(100));
//! assert_eq!(AccountType::Liability.signed_delta(dec!(100), dec!(0)), dec!(-100));
//! ```

use crate::base::{AccountId, CashBankId};
use rust_decimal::Decimal;
use serde::ser::{Serialize, SerializeStruct, Serializer};
use serde::Deserialize;
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, serde::Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum AccountType {
    Asset,
    Liability,
    Equity,
    Revenue,
    Expense,
}

impl AccountType {
    /// Debits increase asset and expense accounts.
    pub fn is_debit_normal(self) -> bool {
        matches!(self, Self::Asset | Self::Expense)
    }

    /// Balance change implied by one line with the given debit and credit.
    pub fn signed_delta(self, debit: Decimal, credit: Decimal) -> Decimal {
        if self.is_debit_normal() {
            debit - credit
        } else {
            credit - debit
        }
    }

    /// Splits a signed balance into the (debit, credit) pair that produces it.
    pub fn sides_for(self, balance: Decimal) -> (Decimal, Decimal) {
        let positive_is_debit = self.is_debit_normal();
        match (balance >= Decimal::ZERO, positive_is_debit) {
            (true, true) | (false, false) => (balance.abs(), Decimal::ZERO),
            _ => (Decimal::ZERO, balance.abs()),
        }
    }
}

impl fmt::Display for AccountType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Asset => "ASSET",
            Self::Liability => "LIABILITY",
            Self::Equity => "EQUITY",
            Self::Revenue => "REVENUE",
            Self::Expense => "EXPENSE",
        };
        f.write_str(s)
    }
}

impl FromStr for AccountType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "ASSET" => Ok(Self::Asset),
            "LIABILITY" => Ok(Self::Liability),
            "EQUITY" => Ok(Self::Equity),
            "REVENUE" => Ok(Self::Revenue),
            "EXPENSE" => Ok(Self::Expense),
            other => Err(format!("unknown account type '{other}'")),
        }
    }
}

/// Chart-of-accounts definition supplied at setup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewAccount {
    pub code: String,
    pub name: String,
    pub account_type: AccountType,
    pub is_header: bool,
}

impl NewAccount {
    pub fn detail(code: &str, name: &str, account_type: AccountType) -> Self {
        Self {
            code: code.to_string(),
            name: name.to_string(),
            account_type,
            is_header: false,
        }
    }

    pub fn header(code: &str, name: &str, account_type: AccountType) -> Self {
        Self {
            is_header: true,
            ..Self::detail(code, name, account_type)
        }
    }
}

/// General-ledger account.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Account {
    pub id: AccountId,
    pub code: String,
    pub name: String,
    pub account_type: AccountType,
    /// Aggregation node; never takes postings and must stay at zero.
    pub is_header: bool,
    pub active: bool,
    pub(crate) balance: Decimal,
}

impl Account {
    const DECIMAL_PRECISION: u32 = 4;

    pub(crate) fn new(id: AccountId, def: NewAccount) -> Self {
        Self {
            id,
            code: def.code,
            name: def.name,
            account_type: def.account_type,
            is_header: def.is_header,
            active: true,
            balance: Decimal::ZERO,
        }
    }

    /// Materialized balance, signed by account type convention.
    pub fn balance(&self) -> Decimal {
        self.balance
    }

    /// True if journal lines may reference this account.
    pub fn is_postable(&self) -> bool {
        !self.is_header
    }
}

impl Serialize for Account {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let mut state = serializer.serialize_struct("Account", 5)?;
        state.serialize_field("code", &self.code)?;
        state.serialize_field("name", &self.name)?;
        state.serialize_field("type", &self.account_type)?;
        state.serialize_field("header", &self.is_header)?;
        state.serialize_field(
            "balance",
            &self.balance.round_dp(Account::DECIMAL_PRECISION),
        )?;
        state.end()
    }
}

/// Cash or bank account owned by the entity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CashBankAccount {
    pub id: CashBankId,
    pub name: String,
    /// Linked ledger account. `None` is valid but cannot move money.
    pub account_id: Option<AccountId>,
    pub(crate) balance: Decimal,
}

impl CashBankAccount {
    pub(crate) fn new(id: CashBankId, name: &str, account_id: Option<AccountId>) -> Self {
        Self {
            id,
            name: name.to_string(),
            account_id,
            balance: Decimal::ZERO,
        }
    }

    /// Materialized balance: debit minus credit of cash/bank-typed lines.
    pub fn balance(&self) -> Decimal {
        self.balance
    }

    pub fn is_linked(&self) -> bool {
        self.account_id.is_some()
    }
}
