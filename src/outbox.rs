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

//! Outbox worker.
//!
//! Posts payments accepted by [`Engine::accept_payment`]. The marker written
//! with the payment is cleared in the same transaction that posts its entry;
//! a failed attempt keeps the marker, bumps `attempts` and records the error
//! so the next drain retries it.

use crate::base::PaymentId;
use crate::engine::Engine;
use crate::error::LedgerError;
use crossbeam::channel::{self, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, warn};

/// Outcome of one [`OutboxWorker::drain`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DrainReport {
    pub posted: Vec<PaymentId>,
    pub failed: Vec<(PaymentId, LedgerError)>,
}

impl DrainReport {
    pub fn is_empty(&self) -> bool {
        self.posted.is_empty() && self.failed.is_empty()
    }
}

pub struct OutboxWorker;

impl OutboxWorker {
    /// Attempts every pending payment once, oldest first.
    pub fn drain(engine: &Engine) -> DrainReport {
        let mut report = DrainReport::default();
        for record in engine.pending_outbox() {
            let id = record.payment_id;
            match engine.post_pending(id) {
                Ok(_) => report.posted.push(id),
                Err(e) => {
                    record_failure(engine, id, &e);
                    report.failed.push((id, e));
                }
            }
        }
        if !report.is_empty() {
            debug!(
                posted = report.posted.len(),
                failed = report.failed.len(),
                "drained outbox"
            );
        }
        report
    }

    /// Drains on a thread every `outbox.poll_interval_ms` until stopped.
    pub fn spawn(engine: Arc<Engine>) -> WorkerHandle {
        let (stop, stopped) = channel::bounded::<()>(1);
        let interval = engine.config().poll_interval();
        let thread = thread::spawn(move || {
            loop {
                Self::drain(&engine);
                match stopped.recv_timeout(interval) {
                    Err(RecvTimeoutError::Timeout) => continue,
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                }
            }
            debug!("outbox worker stopped");
        });
        WorkerHandle {
            stop: Some(stop),
            thread: Some(thread),
        }
    }
}

fn record_failure(engine: &Engine, id: PaymentId, error: &LedgerError) {
    let warn_after = engine.config().outbox.max_attempts_before_warn;
    let attempts = engine.write(|txn| {
        Ok(txn.outbox_mut(id).map(|record| {
            record.attempts += 1;
            record.last_error = Some(error.to_string());
            record.attempts
        }))
    });
    match attempts {
        Ok(Some(attempts)) if attempts >= warn_after => {
            warn!(payment = %id, attempts, error = %error, "outbox posting keeps failing")
        }
        Ok(Some(attempts)) => debug!(payment = %id, attempts, error = %error, "outbox posting failed"),
        Ok(None) | Err(_) => {}
    }
}

/// Running outbox worker. Dropping the handle stops the thread.
pub struct WorkerHandle {
    stop: Option<Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl WorkerHandle {
    /// Stops the worker after its current drain.
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for WorkerHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}
