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

//! Posting engine.
//!
//! The single path by which journal rows are written. Every function runs
//! inside the caller's [`Txn`]: an entry is validated, inserted and projected
//! onto balances in one step, or nothing happens at all.
//!
//! # Validation
//!
//! - at least one line
//! - every line has exactly one positive side
//! - every line's account exists, is a detail account and is active
//! - total debit equals total credit within `tolerance`

use crate::base::EntryId;
use crate::config::EngineConfig;
use crate::error::LedgerError;
use crate::journal::{EntryStatus, JournalEntry, NewEntry};
use crate::projector;
use crate::store::{Tables, Txn};
use chrono::NaiveDate;
use tracing::{debug, info};

/// Checks an entry request against the committed chart.
pub(crate) fn validate(
    tables: &Tables,
    config: &EngineConfig,
    request: &NewEntry,
) -> Result<(), LedgerError> {
    if request.lines.is_empty() {
        return Err(LedgerError::EmptyEntry);
    }

    for (index, line) in request.lines.iter().enumerate() {
        if !line.is_well_formed() {
            return Err(LedgerError::InvalidLine { index });
        }
        let account = tables
            .account(line.account_id)
            .ok_or_else(|| LedgerError::AccountNotFound(line.account_id.to_string()))?;
        if account.is_header {
            return Err(LedgerError::InvalidAccount(account.id));
        }
        if !account.active {
            return Err(LedgerError::InactiveAccount(account.id));
        }
    }

    let (debit, credit) = request.totals();
    if !config.within_tolerance(debit, credit) {
        return Err(LedgerError::UnbalancedEntry { debit, credit });
    }
    Ok(())
}

/// Validates, inserts and projects a new entry as `Posted`.
pub(crate) fn post_in(
    txn: &mut Txn<'_>,
    config: &EngineConfig,
    request: NewEntry,
) -> Result<JournalEntry, LedgerError> {
    book(txn, config, request, None)
}

/// Stores a structurally valid entry as `Draft`. Balances are untouched.
pub(crate) fn save_draft_in(
    txn: &mut Txn<'_>,
    config: &EngineConfig,
    request: NewEntry,
) -> Result<JournalEntry, LedgerError> {
    validate(txn.tables(), config, &request)?;
    let id = txn.next_entry_id();
    let entry = JournalEntry::from_request(id, EntryStatus::Draft, request);
    txn.insert_entry(entry.clone());
    debug!(entry = %id, "saved draft");
    Ok(entry)
}

/// Posts a stored draft under its own id.
///
/// Posting an entry that is already booked returns it unchanged.
pub(crate) fn post_draft_in(
    txn: &mut Txn<'_>,
    config: &EngineConfig,
    id: EntryId,
) -> Result<JournalEntry, LedgerError> {
    let draft = txn
        .tables()
        .entry(id)
        .cloned()
        .ok_or(LedgerError::EntryNotFound(id))?;
    if draft.is_booked() {
        return Ok(draft);
    }

    // The chart may have changed since the draft was saved.
    validate(txn.tables(), config, &draft.to_request())?;
    let mut entry = draft;
    entry.status = EntryStatus::Posted;
    projector::project(txn, &entry, config.tolerance)?;
    if let Some(row) = txn.entry_mut(id) {
        row.status = EntryStatus::Posted;
    }
    log_posted(&entry);
    Ok(entry)
}

/// Posts the exact mirror of a posted entry and marks the original reversed.
///
/// # Errors
///
/// - [`LedgerError::EntryNotPosted`] for drafts
/// - [`LedgerError::AlreadyReversed`] if a mirror already exists
pub(crate) fn reverse_in(
    txn: &mut Txn<'_>,
    config: &EngineConfig,
    id: EntryId,
    date: NaiveDate,
) -> Result<JournalEntry, LedgerError> {
    let original = txn
        .tables()
        .entry(id)
        .ok_or(LedgerError::EntryNotFound(id))?;
    match original.status {
        EntryStatus::Draft => return Err(LedgerError::EntryNotPosted(id)),
        EntryStatus::Reversed => return Err(LedgerError::AlreadyReversed(id)),
        EntryStatus::Posted => {}
    }
    let mirror = original.mirror(date);

    let reversal = book(txn, config, mirror, Some(id))?;
    if let Some(row) = txn.entry_mut(id) {
        row.status = EntryStatus::Reversed;
        row.reversed_by = Some(reversal.id);
    }
    info!(entry = %id, reversal = %reversal.id, "reversed entry");
    Ok(reversal)
}

fn book(
    txn: &mut Txn<'_>,
    config: &EngineConfig,
    request: NewEntry,
    reverses: Option<EntryId>,
) -> Result<JournalEntry, LedgerError> {
    validate(txn.tables(), config, &request)?;
    let id = txn.next_entry_id();
    let mut entry = JournalEntry::from_request(id, EntryStatus::Posted, request);
    entry.reverses = reverses;

    projector::project(txn, &entry, config.tolerance)?;
    txn.insert_entry(entry.clone());
    log_posted(&entry);
    Ok(entry)
}

fn log_posted(entry: &JournalEntry) {
    let (debit, _) = entry.totals();
    info!(
        entry = %entry.id,
        reference_type = ?entry.reference_type,
        reference = entry.reference_id.as_deref().unwrap_or(""),
        lines = entry.lines.len(),
        amount = %debit,
        "posted entry"
    );
}
