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

use chrono::NaiveDate;
use clap::Parser;
use csv::{ReaderBuilder, Trim, Writer, WriterBuilder};
use ledger_recon::{
    AccountType, CashBankId, Direction, DocumentId, Engine, EngineConfig, LedgerError,
    NewAccount, NewEntry, PaymentRequest, ReferenceType, Report, Scope, Severity,
};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufReader, Read, Write};
use std::path::PathBuf;
use std::process;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

/// Ledger Recon - replay ledger operations and reconcile balances
///
/// Reads operations from a CSV file, applies them to a fresh engine, then
/// writes account balances and the reconciliation report to stdout.
#[derive(Parser, Debug)]
#[command(name = "ledger-recon")]
#[command(about = "Replays ledger operations from CSV and reconciles balances", long_about = None)]
struct Args {
    /// Path to CSV file with operations
    ///
    /// Expected format: op,reference,account,debit,credit,cash_bank,document,amount,kind,name
    #[arg(value_name = "FILE")]
    input: PathBuf,

    /// Engine configuration (TOML); LEDGER_RECON__* variables override it
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Repair INFO and WARNING discrepancies before reporting
    #[arg(long)]
    repair: bool,
}

fn main() {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "ledger_recon=info".into()))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let args = Args::parse();

    let config = match EngineConfig::load(args.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error loading configuration: {}", e);
            process::exit(1);
        }
    };

    let file = match File::open(&args.input) {
        Ok(f) => f,
        Err(e) => {
            eprintln!("Error opening file '{}': {}", args.input.display(), e);
            process::exit(1);
        }
    };

    let engine = match process_operations(Engine::new(config), BufReader::new(file)) {
        Ok(engine) => engine,
        Err(e) => {
            eprintln!("Error processing operations: {}", e);
            process::exit(1);
        }
    };

    if args.repair {
        let swept = engine.sweep(Scope::All);
        info!(
            repaired = swept.repaired.len(),
            critical = swept.skipped.len(),
            "repair pass finished"
        );
    }

    let report = engine.validate(Scope::All);
    if let Err(e) = write_report(&engine, &report, std::io::stdout()) {
        eprintln!("Error writing output: {}", e);
        process::exit(1);
    }
}

/// Raw CSV record. Only `op` is required; each op reads the columns it needs.
#[derive(Debug, Deserialize)]
struct CsvRecord {
    op: String,
    #[serde(default)]
    reference: Option<String>,
    #[serde(default)]
    account: Option<String>,
    #[serde(default)]
    debit: Option<String>,
    #[serde(default)]
    credit: Option<String>,
    #[serde(default, deserialize_with = "csv::invalid_option")]
    cash_bank: Option<u32>,
    #[serde(default, deserialize_with = "csv::invalid_option")]
    document: Option<u64>,
    #[serde(default, deserialize_with = "csv::invalid_option")]
    amount: Option<Decimal>,
    #[serde(default)]
    kind: Option<String>,
    #[serde(default)]
    name: Option<String>,
}

/// Why a row was skipped.
#[derive(Debug, thiserror::Error)]
enum RowError {
    #[error("missing column '{0}'")]
    Missing(&'static str),
    #[error("{0}")]
    Invalid(String),
    #[error(transparent)]
    Ledger(#[from] LedgerError),
}

fn required<T>(value: Option<T>, column: &'static str) -> Result<T, RowError> {
    value.ok_or(RowError::Missing(column))
}

fn account_id(engine: &Engine, code: &str) -> Result<ledger_recon::AccountId, RowError> {
    engine
        .account_by_code(code)
        .map(|a| a.id)
        .ok_or_else(|| RowError::Ledger(LedgerError::AccountNotFound(code.to_string())))
}

fn replay_date() -> NaiveDate {
    chrono::Local::now().date_naive()
}

impl CsvRecord {
    /// Applies one operation to the engine.
    ///
    /// | op | columns |
    /// |----|---------|
    /// | account, header | account (code), name, kind (account type) |
    /// | cashbank | name, account (linked code, optional) |
    /// | document | document, kind (direction), amount (total) |
    /// | approve | document |
    /// | journal | debit (code), credit (code), amount, kind (reference type), name |
    /// | payment | reference, cash_bank, document, amount, kind (direction) |
    /// | reverse | reference (payment) |
    /// | seed | account (code) or cash_bank, amount |
    fn apply(self, engine: &Engine) -> Result<(), RowError> {
        match self.op.to_lowercase().as_str() {
            op @ ("account" | "header") => {
                let code = required(self.account, "account")?;
                let name = self.name.unwrap_or_else(|| code.clone());
                let account_type: AccountType = required(self.kind, "kind")?
                    .parse()
                    .map_err(RowError::Invalid)?;
                let definition = if op == "header" {
                    NewAccount::header(&code, &name, account_type)
                } else {
                    NewAccount::detail(&code, &name, account_type)
                };
                engine.create_account(definition)?;
            }
            "cashbank" => {
                let linked = match self.account {
                    Some(code) => Some(account_id(engine, &code)?),
                    None => None,
                };
                engine.create_cash_bank(&required(self.name, "name")?, linked)?;
            }
            "document" => {
                let direction: Direction = required(self.kind, "kind")?
                    .parse()
                    .map_err(RowError::Invalid)?;
                engine.register_document(
                    DocumentId(required(self.document, "document")?),
                    direction,
                    required(self.amount, "amount")?,
                )?;
            }
            "approve" => {
                engine.approve_document(DocumentId(required(self.document, "document")?))?;
            }
            "journal" => {
                let debit = account_id(engine, &required(self.debit, "debit")?)?;
                let credit = account_id(engine, &required(self.credit, "credit")?)?;
                let amount = required(self.amount, "amount")?;
                let reference_type = match self.kind {
                    None => ReferenceType::Manual,
                    Some(kind) => kind.parse().map_err(RowError::Invalid)?,
                };
                let description = self.name.unwrap_or_default();
                let mut entry = NewEntry::new(replay_date(), reference_type, &description)
                    .debit(debit, amount)
                    .credit(credit, amount);
                if let Some(reference) = self.reference {
                    entry = entry.reference(&reference);
                }
                engine.post(entry)?;
            }
            "payment" => {
                let direction: Direction = required(self.kind, "kind")?
                    .parse()
                    .map_err(RowError::Invalid)?;
                let amount = required(self.amount, "amount")?;
                let request = PaymentRequest::new(
                    &required(self.reference, "reference")?,
                    CashBankId(required(self.cash_bank, "cash_bank")?),
                    amount,
                    replay_date(),
                    direction,
                )
                .allocate(DocumentId(required(self.document, "document")?), amount);
                engine.apply_payment(request)?;
            }
            "reverse" => {
                let reference = required(self.reference, "reference")?;
                let payment = engine
                    .payment_by_reference(&reference)
                    .ok_or_else(|| RowError::Invalid(format!("unknown payment '{reference}'")))?;
                let entry = required(payment.entry_id, "reference")?;
                engine.reverse(entry)?;
            }
            "seed" => {
                let amount = required(self.amount, "amount")?;
                match (self.account, self.cash_bank) {
                    (Some(code), _) => {
                        engine.import_opening_balance(account_id(engine, &code)?, amount)?
                    }
                    (None, Some(id)) => engine.import_cash_bank_balance(CashBankId(id), amount)?,
                    (None, None) => return Err(RowError::Missing("account")),
                }
            }
            other => return Err(RowError::Invalid(format!("unknown op '{other}'"))),
        }
        Ok(())
    }
}

/// Replays operations from a CSV reader into `engine`.
///
/// Rows that fail to parse or are rejected by the engine are logged and
/// skipped; replay continues with the next row.
///
/// # Example
///
/// ```csv
/// op,reference,account,debit,credit,cash_bank,document,amount,kind,name
/// account,,1101,,,,,,asset,Cash
/// account,,1201,,,,,,asset,Receivables
/// cashbank,,1101,,,,,,,Till
/// document,,,,,,1,1000,receivable,
/// approve,,,,,,1,,,
/// payment,RCPT-1,,,,1,1,400,receivable,
/// ```
///
/// # Errors
///
/// Returns a CSV error if the reader fails or the header row is invalid.
pub fn process_operations<R: Read>(engine: Engine, reader: R) -> Result<Engine, csv::Error> {
    let mut rdr = ReaderBuilder::new()
        .trim(Trim::All)
        .flexible(true)
        .has_headers(true)
        .from_reader(reader);

    for (index, result) in rdr.deserialize::<CsvRecord>().enumerate() {
        let row = index + 2;
        match result {
            Ok(record) => {
                let op = record.op.clone();
                if let Err(e) = record.apply(&engine) {
                    warn!(row, op = %op, error = %e, "skipping operation");
                }
            }
            Err(e) => warn!(row, error = %e, "skipping malformed row"),
        }
    }

    Ok(engine)
}

/// Flat reconciliation row.
#[derive(Debug, Serialize)]
struct DiscrepancyRow {
    discrepancy: String,
    kind: &'static str,
    target: String,
    severity: Severity,
    stored: Decimal,
    expected: Decimal,
    difference: Decimal,
}

/// Writes account balances, a blank line, then the reconciliation report.
///
/// # CSV Format
///
/// ```csv
/// code,name,type,header,balance
/// 1101,Cash,ASSET,false,400
///
/// discrepancy,kind,target,severity,stored,expected,difference
/// ```
///
/// # Errors
///
/// Returns a CSV error if writing fails.
pub fn write_report<W: Write>(engine: &Engine, report: &Report, mut writer: W) -> Result<(), csv::Error> {
    {
        let mut wtr = Writer::from_writer(&mut writer);
        for account in engine.accounts() {
            wtr.serialize(&account)?;
        }
        wtr.flush()?;
    }
    writeln!(writer)?;

    let mut wtr = WriterBuilder::new().has_headers(false).from_writer(writer);
    wtr.write_record([
        "discrepancy",
        "kind",
        "target",
        "severity",
        "stored",
        "expected",
        "difference",
    ])?;
    for d in &report.discrepancies {
        let row = DiscrepancyRow {
            discrepancy: d.id.to_string(),
            kind: d.kind.label(),
            target: d.kind.target(),
            severity: d.severity,
            stored: d.stored,
            expected: d.expected,
            difference: d.difference,
        };
        wtr.serialize(row)?;
    }
    wtr.flush()?;
    Ok(())
}
