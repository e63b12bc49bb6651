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

//! Collaborator seams: the account directory and document-service callbacks.

use crate::base::{AccountId, DocumentId};
use crate::config::AccountCodes;
use crate::document::Direction;
use crate::error::LedgerError;
use crate::store::{DocumentEvent, Tables};
use rust_decimal::Decimal;

/// Well-known chart positions the engine posts against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AccountRole {
    Receivable,
    Payable,
    Suspense,
    OpeningBalanceEquity,
}

impl AccountRole {
    /// Counter-account role for a document's classification.
    pub fn counter_for(direction: Direction) -> Self {
        match direction {
            Direction::Receivable => Self::Receivable,
            Direction::Payable => Self::Payable,
        }
    }
}

/// Maps roles to chart codes.
pub trait AccountDirectory: Send + Sync {
    fn code(&self, role: AccountRole) -> String;

    /// Looks the role's code up in the committed chart.
    fn resolve(&self, tables: &Tables, role: AccountRole) -> Result<AccountId, LedgerError> {
        let code = self.code(role);
        tables
            .account_by_code(&code)
            .map(|account| account.id)
            .ok_or(LedgerError::AccountNotFound(code))
    }
}

/// Directory backed by [`AccountCodes`] from the engine configuration.
#[derive(Debug, Clone, Default)]
pub struct ChartDirectory {
    codes: AccountCodes,
}

impl ChartDirectory {
    pub fn new(codes: AccountCodes) -> Self {
        Self { codes }
    }
}

impl AccountDirectory for ChartDirectory {
    fn code(&self, role: AccountRole) -> String {
        match role {
            AccountRole::Receivable => self.codes.receivable.clone(),
            AccountRole::Payable => self.codes.payable.clone(),
            AccountRole::Suspense => self.codes.suspense.clone(),
            AccountRole::OpeningBalanceEquity => self.codes.opening_balance_equity.clone(),
        }
    }
}

/// Document service notified after a posting changes a document.
///
/// Callbacks run after commit, outside every lock, in posting order.
pub trait DocumentObserver: Send + Sync {
    fn on_fully_paid(&self, _document: DocumentId) {}

    fn on_partially_paid(&self, _document: DocumentId, _outstanding: Decimal) {}
}

/// Observer that ignores every notification.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopObserver;

impl DocumentObserver for NoopObserver {}

pub(crate) fn dispatch(observer: &dyn DocumentObserver, events: &[DocumentEvent]) {
    for event in events {
        match *event {
            DocumentEvent::FullyPaid(document) => observer.on_fully_paid(document),
            DocumentEvent::PartiallyPaid {
                document,
                outstanding,
            } => observer.on_partially_paid(document, outstanding),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use rust_decimal_macros::dec;

    #[derive(Default)]
    struct Recorder(Mutex<Vec<String>>);

    impl DocumentObserver for Recorder {
        fn on_fully_paid(&self, document: DocumentId) {
            self.0.lock().push(format!("paid {document}"));
        }

        fn on_partially_paid(&self, document: DocumentId, outstanding: Decimal) {
            self.0.lock().push(format!("partial {document} {outstanding}"));
        }
    }

    #[test]
    fn chart_directory_uses_configured_codes() {
        let directory = ChartDirectory::default();
        assert_eq!(directory.code(AccountRole::Receivable), "1201");
        assert_eq!(directory.code(AccountRole::Suspense), "1901");
        assert_eq!(
            AccountRole::counter_for(Direction::Payable),
            AccountRole::Payable
        );
    }

    #[test]
    fn resolve_reports_missing_code() {
        let directory = ChartDirectory::default();
        let tables = Tables::default();
        assert_eq!(
            directory.resolve(&tables, AccountRole::Payable),
            Err(LedgerError::AccountNotFound("2101".to_string()))
        );
    }

    #[test]
    fn dispatch_preserves_order() {
        let recorder = Recorder::default();
        dispatch(
            &recorder,
            &[
                DocumentEvent::PartiallyPaid {
                    document: DocumentId(1),
                    outstanding: dec!(40),
                },
                DocumentEvent::FullyPaid(DocumentId(1)),
            ],
        );
        assert_eq!(
            *recorder.0.lock(),
            vec!["partial doc-1 40".to_string(), "paid doc-1".to_string()]
        );
    }
}
