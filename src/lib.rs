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

//! # Ledger Recon
//!
//! A double-entry posting engine that keeps every materialized balance
//! (ledger accounts, cash/bank accounts, outstanding amounts on receivable
//! and payable documents) in step with the journal, and finds and repairs
//! drift when something else wrote to them.
//!
//! ## Core Components
//!
//! - [`Engine`]: facade over the store, posting and payments
//! - [`NewEntry`] / [`JournalEntry`]: journal entries and their lines
//! - [`PaymentRequest`] / [`Payment`]: money moved against documents
//! - [`reconcile`]: validation, repair, sweeps and the scheduled job
//! - [`OutboxWorker`]: posts payments accepted without an immediate entry
//! - [`LedgerError`]: every rejected operation
//!
//! ## Example
//!
//! ```
//! use chrono::NaiveDate;
//! use ledger_recon::{
//!     AccountType, Direction, DocumentId, DocumentStatus, Engine, NewAccount, PaymentRequest,
//!     Scope,
//! };
//! use rust_decimal_macros::dec;
//!
//! let engine = Engine::default();
//! let cash = engine
//!     .create_account(NewAccount::detail("1101", "Cash", AccountType::Asset))
//!     .unwrap();
//! engine
//!     .create_account(NewAccount::detail("1201", "Receivables", AccountType::Asset))
//!     .unwrap();
//! let till = engine.create_cash_bank("Till", Some(cash)).unwrap();
//!
//! engine
//!     .register_document(DocumentId(1), Direction::Receivable, dec!(1000))
//!     .unwrap();
//! engine.approve_document(DocumentId(1)).unwrap();
//!
//! let date = NaiveDate::from_ymd_opt(2025, 3, 1).unwrap();
//! let request = PaymentRequest::new("RCPT-1", till, dec!(1000), date, Direction::Receivable)
//!     .allocate(DocumentId(1), dec!(1000));
//! engine.apply_payment(request).unwrap();
//!
//! let summary = engine.outstanding(DocumentId(1)).unwrap();
//! assert_eq!(summary.status, DocumentStatus::Paid);
//! assert_eq!(engine.cash_bank(till).unwrap().balance(), dec!(1000));
//! assert!(engine.validate(Scope::All).is_clean());
//! ```
//!
//! ## Thread Safety
//!
//! The engine is `Send + Sync`. Payments on the same document serialize on
//! a per-document lock; everything else serializes only on the commit.

pub mod account;
mod allocation;
mod base;
pub mod config;
pub mod document;
mod engine;
pub mod error;
pub mod interfaces;
pub mod journal;
pub mod outbox;
pub mod payment;
mod posting;
mod projector;
pub mod reconcile;
mod store;

pub use account::{Account, AccountType, CashBankAccount, NewAccount};
pub use base::{AccountId, CashBankId, DiscrepancyId, DocumentId, EntryId, PaymentId};
pub use config::EngineConfig;
pub use document::{Direction, DocumentStatus, OutstandingDocument, OutstandingSummary};
pub use engine::Engine;
pub use error::LedgerError;
pub use interfaces::{AccountDirectory, AccountRole, ChartDirectory, DocumentObserver, NoopObserver};
pub use journal::{Adjustment, EntryStatus, JournalEntry, JournalLine, LineInput, NewEntry, ReferenceType};
pub use outbox::{DrainReport, OutboxWorker, WorkerHandle};
pub use payment::{AllocationRequest, OutboxRecord, Payment, PaymentAllocation, PaymentRequest, PaymentStatus};
pub use reconcile::{Discrepancy, DiscrepancyKind, ReconciliationJob, Report, Scope, Severity, SweepReport};
pub use store::{DocumentEvent, Tables};
