//! Convergence ledger.
//!
//! Records, per round, the sequence number and descriptor of the operation
//! applied and the rendered state of every replica. Replica 0 is the
//! reference: [`ConvergenceLedger::validate`] compares every other replica
//! against it in every recorded round and reports the earliest divergence,
//! carrying the full table so the failing run can be read at a glance.
//!
//! ```text
//! seq | op            | A  | B  | C
//! 1   | insert X at 0 | X  | X  | X
//! 2   | insert Y at 0 | YX | YX | YX
//! ```

use std::fmt;

use serde::Serialize;
use thiserror::Error;

/// Column separator in the rendered table.
const SEPARATOR: &str = " | ";

/// Errors from recording a round.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LedgerError {
    /// Round numbers must strictly increase.
    #[error("round {round} recorded after round {previous}")]
    RoundOutOfOrder {
        /// Round being recorded
        round: u64,
        /// Last recorded round
        previous: u64,
    },

    /// One state per replica is required.
    #[error("expected {expected} replica states, got {found}")]
    ReplicaCountMismatch {
        /// Replicas in the ledger
        expected: usize,
        /// States supplied
        found: usize,
    },
}

/// A replica disagreed with the reference replica.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("round {round} (seq {sequence_number}): replica {replica} diverged from {reference}\n{table}")]
pub struct DivergenceError {
    /// Earliest round with a divergence
    pub round: u64,
    /// Sequence number applied in that round
    pub sequence_number: u64,
    /// First replica whose state differs
    pub replica: String,
    /// Reference replica
    pub reference: String,
    /// Rendered ledger
    pub table: String,
}

/// One recorded round.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LedgerRow {
    /// Round number
    pub round: u64,
    /// Sequence number applied in this round
    pub sequence_number: u64,
    /// Descriptor of the applied operation
    pub operation: String,
    /// Rendered state per replica, in replica order
    pub states: Vec<String>,
}

/// Append-only per-round record of replica states.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ConvergenceLedger {
    title: Option<String>,
    replicas: Vec<String>,
    rows: Vec<LedgerRow>,
}

impl ConvergenceLedger {
    /// Ledger over the named replicas. The first is the reference.
    pub fn new<I, S>(replicas: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self { title: None, replicas: replicas.into_iter().map(Into::into).collect(), rows: Vec::new() }
    }

    /// Title printed above the table.
    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }

    /// Record one round.
    pub fn record(
        &mut self,
        round: u64,
        sequence_number: u64,
        operation: impl Into<String>,
        states: Vec<String>,
    ) -> Result<(), LedgerError> {
        if let Some(previous) = self.rows.last().map(|row| row.round)
            && round <= previous
        {
            return Err(LedgerError::RoundOutOfOrder { round, previous });
        }
        if states.len() != self.replicas.len() {
            return Err(LedgerError::ReplicaCountMismatch {
                expected: self.replicas.len(),
                found: states.len(),
            });
        }

        self.rows.push(LedgerRow { round, sequence_number, operation: operation.into(), states });
        Ok(())
    }

    /// Check every round: all replicas must equal the reference.
    pub fn validate(&self) -> Result<(), DivergenceError> {
        let Some(reference) = self.replicas.first() else {
            return Ok(());
        };

        for row in &self.rows {
            let expected = &row.states[0];
            if let Some(index) = row.states.iter().position(|state| state != expected) {
                return Err(DivergenceError {
                    round: row.round,
                    sequence_number: row.sequence_number,
                    replica: self.replicas[index].clone(),
                    reference: reference.clone(),
                    table: self.to_string(),
                });
            }
        }
        Ok(())
    }

    /// Recorded rows, in round order.
    pub fn rows(&self) -> &[LedgerRow] {
        &self.rows
    }

    /// Replica names, reference first.
    pub fn replicas(&self) -> &[String] {
        &self.replicas
    }

    /// Number of recorded rounds.
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// Whether nothing has been recorded.
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

impl fmt::Display for ConvergenceLedger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(title) = &self.title {
            writeln!(f, "{title}")?;
        }

        let header: Vec<String> = ["seq".to_string(), "op".to_string()]
            .into_iter()
            .chain(self.replicas.iter().cloned())
            .collect();
        let body: Vec<Vec<String>> = self
            .rows
            .iter()
            .map(|row| {
                [row.sequence_number.to_string(), row.operation.clone()]
                    .into_iter()
                    .chain(row.states.iter().cloned())
                    .collect()
            })
            .collect();

        let mut widths: Vec<usize> = header.iter().map(|cell| cell.chars().count()).collect();
        for line in &body {
            for (width, cell) in widths.iter_mut().zip(line) {
                *width = (*width).max(cell.chars().count());
            }
        }

        for (i, line) in std::iter::once(&header).chain(&body).enumerate() {
            if i > 0 {
                writeln!(f)?;
            }
            write_line(f, line, &widths)?;
        }
        Ok(())
    }
}

/// Write one table line; the last column is not padded.
fn write_line(f: &mut fmt::Formatter<'_>, cells: &[String], widths: &[usize]) -> fmt::Result {
    let last = cells.len().saturating_sub(1);
    for (i, (cell, width)) in cells.iter().zip(widths).enumerate() {
        if i > 0 {
            f.write_str(SEPARATOR)?;
        }
        if i == last {
            f.write_str(cell)?;
        } else {
            write!(f, "{cell:<width$}")?;
        }
    }
    Ok(())
}
