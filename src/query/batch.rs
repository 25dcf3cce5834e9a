//! Buffered results for callback-mode submissions.

use crate::error::QueryError;
use crate::types::Row;

/// The value a callback-mode submission reports.
#[derive(Debug, Clone, PartialEq)]
pub enum BatchOutcome {
    /// Rows of the single statement that ran
    Rows(Vec<Row>),
    /// One result per statement, in batch order
    Sets(Vec<Result<Vec<Row>, QueryError>>),
}

impl BatchOutcome {
    /// Rows of a single-statement outcome.
    pub fn rows(&self) -> Option<&[Row]> {
        match self {
            BatchOutcome::Rows(rows) => Some(rows),
            BatchOutcome::Sets(_) => None,
        }
    }

    /// Per-statement results of a multi-statement outcome.
    pub fn sets(&self) -> Option<&[Result<Vec<Row>, QueryError>]> {
        match self {
            BatchOutcome::Rows(_) => None,
            BatchOutcome::Sets(sets) => Some(sets),
        }
    }

    /// Number of statements reported.
    pub fn statement_count(&self) -> usize {
        match self {
            BatchOutcome::Rows(_) => 1,
            BatchOutcome::Sets(sets) => sets.len(),
        }
    }
}

/// Result delivered to a callback-mode submission.
pub type BatchResult = Result<BatchOutcome, QueryError>;

/// Accumulates per-statement results until the batch ends.
#[derive(Debug, Default)]
pub(crate) struct BatchCollector {
    results: Vec<Result<Vec<Row>, QueryError>>,
    partial: Vec<Row>,
}

impl BatchCollector {
    /// Rows of a statement that has more to produce.
    pub fn extend(&mut self, rows: Vec<Row>) {
        self.partial.extend(rows);
    }

    /// The current statement finished with these final rows.
    pub fn complete(&mut self, rows: Vec<Row>) {
        let mut all = std::mem::take(&mut self.partial);
        all.extend(rows);
        self.results.push(Ok(all));
    }

    /// The current statement failed.
    pub fn fail(&mut self, error: QueryError) {
        self.partial.clear();
        self.results.push(Err(error));
    }

    /// Build the final outcome: a single result is reported directly, more
    /// than one as a per-statement sequence.
    pub fn finish(mut self) -> BatchResult {
        match self.results.len() {
            0 => Ok(BatchOutcome::Rows(Vec::new())),
            1 => match self.results.pop() {
                Some(Ok(rows)) => Ok(BatchOutcome::Rows(rows)),
                Some(Err(error)) => Err(error),
                None => Ok(BatchOutcome::Rows(Vec::new())),
            },
            _ => Ok(BatchOutcome::Sets(self.results)),
        }
    }
}
