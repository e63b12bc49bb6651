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

//! Engine configuration.
//!
//! Every field has a default, so an empty file (or no file at all) yields a
//! usable engine. Decimal values are written as strings in TOML:
//!
//! ```toml
//! tolerance = "0.01"
//! rounding_threshold = "1.00"
//! lock_timeout_ms = 5000
//!
//! [accounts]
//! receivable = "1201"
//! payable = "2101"
//! suspense = "1901"
//! opening_balance_equity = "3901"
//! ```

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

/// Environment variable prefix, e.g. `LEDGER_RECON__LOCK_TIMEOUT_MS=100`.
pub const ENV_PREFIX: &str = "LEDGER_RECON";

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct EngineConfig {
    /// Absolute epsilon for balanced entries and for reporting drift.
    pub tolerance: Decimal,
    /// Drift at or below this magnitude is classified as rounding-level.
    pub rounding_threshold: Decimal,
    /// Bounded wait for a document lock before giving up.
    pub lock_timeout_ms: u64,
    pub accounts: AccountCodes,
    pub outbox: OutboxConfig,
}

/// Chart codes the default account directory resolves.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct AccountCodes {
    pub receivable: String,
    pub payable: String,
    pub suspense: String,
    pub opening_balance_equity: String,
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct OutboxConfig {
    /// Failed attempts after which retries are logged at `warn`.
    pub max_attempts_before_warn: u32,
    /// Sleep between drains of a spawned worker.
    pub poll_interval_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            tolerance: dec!(0.01),
            rounding_threshold: dec!(1.00),
            lock_timeout_ms: 5_000,
            accounts: AccountCodes::default(),
            outbox: OutboxConfig::default(),
        }
    }
}

impl Default for AccountCodes {
    fn default() -> Self {
        Self {
            receivable: "1201".to_string(),
            payable: "2101".to_string(),
            suspense: "1901".to_string(),
            opening_balance_equity: "3901".to_string(),
        }
    }
}

impl Default for OutboxConfig {
    fn default() -> Self {
        Self {
            max_attempts_before_warn: 5,
            poll_interval_ms: 200,
        }
    }
}

impl EngineConfig {
    /// Loads configuration from an optional TOML file, then environment.
    ///
    /// # Errors
    ///
    /// Returns an error if a source cannot be parsed or a value has the wrong type.
    pub fn load(path: Option<&Path>) -> Result<Self, config::ConfigError> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        }
        builder
            .add_source(config::Environment::with_prefix(ENV_PREFIX).separator("__"))
            .build()?
            .try_deserialize()
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.outbox.poll_interval_ms)
    }

    /// True if `a` and `b` are equal within [`tolerance`](Self::tolerance).
    pub fn within_tolerance(&self, a: Decimal, b: Decimal) -> bool {
        (a - b).abs() <= self.tolerance
    }
}
