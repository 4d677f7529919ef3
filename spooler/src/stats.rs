//! Per-master aggregate accumulator
//!
//! Folds one record at a time into the statistics carried by the trailer.
//! Everything is O(1) per record except `unique_customers`, which holds one
//! entry per distinct customer id seen for the master. For masters with very
//! large distinct-customer cardinality this set is the only unbounded memory
//! in the pipeline; the emitted count is exact by contract.

use std::collections::HashSet;

use rust_decimal::{Decimal, RoundingStrategy};

use crate::projection::FlatRecord;

/// Folding accumulator over a master's record stream.
#[derive(Debug, Default)]
pub struct FileStats {
    record_count: u64,
    total_amount: Decimal,
    risk_score_sum: f64,
    risk_score_count: u64,
    unique_customers: HashSet<String>,
    json_error_count: u64,
}

/// The trailer aggregates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Totals {
    pub total_records: u64,
    pub total_amount: Decimal,
    /// Mean of the seen risk scores, rounded half-up to 2 decimal places.
    /// Zero when no record carried a risk score.
    pub average_risk_score: Decimal,
    pub unique_customers: u64,
}

impl FileStats {
    pub fn new() -> Self {
        Default::default()
    }

    /// Fold one record into the accumulator.
    pub fn record(&mut self, record: &FlatRecord) {
        self.record_count += 1;

        if let Some(amount) = record.amount {
            self.total_amount += amount;
        }

        if let Some(risk_score) = record.risk_score {
            self.risk_score_sum += risk_score;
            self.risk_score_count += 1;
        }

        if let Some(customer_id) = &record.customer_id {
            if !self.unique_customers.contains(customer_id) {
                self.unique_customers.insert(customer_id.clone());
            }
        }

        if record.json_error {
            self.json_error_count += 1;
        }
    }

    pub fn record_count(&self) -> u64 {
        self.record_count
    }

    /// Rows whose embedded document failed to deserialize.
    pub fn json_error_count(&self) -> u64 {
        self.json_error_count
    }

    /// The trailer aggregates for everything recorded so far.
    pub fn totals(&self) -> Totals {
        let average_risk_score = if self.risk_score_count == 0 {
            Decimal::ZERO
        } else {
            let mean = self.risk_score_sum / self.risk_score_count as f64;
            Decimal::from_f64_retain(mean)
                .unwrap_or_default()
                .round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero)
        };

        Totals {
            total_records: self.record_count,
            total_amount: self.total_amount,
            average_risk_score,
            unique_customers: self.unique_customers.len() as u64,
        }
    }
}
