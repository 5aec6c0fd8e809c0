// wall-clock stamp for the last completed pass
use chrono::{NaiveDateTime, Utc};

use tracing::{debug, info, warn};

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::error::{FormcalcError, Result};
use crate::formula::{EvaluationContext, Evaluator};
use crate::graph::DependencyGraph;
use crate::settings::Settings;
use crate::value::{fold, FieldHasher, Snapshot, Value};

/// Resolves the stored formula for a calculated field, if the field has one.
/// Lookups are case-insensitive. Implemented by the form-schema collaborator;
/// the driver treats it as opaque.
pub trait FormulaSource {
    fn formula_for(&self, field: &str) -> Option<&str>;
}

/// Immutable copy of the driver's cumulative counters. Reading the metrics
/// never exposes the live state behind the lock.
#[derive(Debug, Clone, Default)]
pub struct RecalculationMetrics {
    /// Completed `recalculate`/`recalculate_all` passes.
    pub total_passes: u64,
    /// Wall time spent across all passes.
    pub total_time: Duration,
    /// `total_time / total_passes`, zero before the first pass.
    pub average_pass_time: Duration,
    /// Impact-set sizes summed over all passes. Counts attempts, including
    /// fields without a formula and fields whose evaluation failed.
    pub fields_recalculated: u64,
    /// Per-field attempt counts, keyed by the first-seen spelling.
    pub field_counts: HashMap<String, u64, FieldHasher>,
    /// Per-field cumulative evaluation time, same keys.
    pub field_times: HashMap<String, Duration, FieldHasher>,
    /// When the most recent pass finished (UTC), if any has run.
    pub last_pass: Option<NaiveDateTime>,
}

impl RecalculationMetrics {
    /// Case-insensitive per-field count lookup.
    pub fn count_for(&self, field: &str) -> u64 {
        self.field_counts
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case(field))
            .map(|(_, count)| *count)
            .unwrap_or(0)
    }

    /// Case-insensitive per-field cumulative time lookup.
    pub fn time_for(&self, field: &str) -> Duration {
        self.field_times
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case(field))
            .map(|(_, elapsed)| *elapsed)
            .unwrap_or(Duration::ZERO)
    }
}

#[derive(Default)]
struct MetricsInner {
    total_passes: u64,
    total_time: Duration,
    fields_recalculated: u64,
    // folded key to (first-seen spelling, count, cumulative time)
    per_field: HashMap<String, FieldTally, FieldHasher>,
    last_pass: Option<NaiveDateTime>,
}

struct FieldTally {
    name: String,
    count: u64,
    elapsed: Duration,
}

// ------------- Recalculator -------------
/// The incremental recalculation driver.
///
/// A pass applies one changed value to a copy of the snapshot, asks the graph
/// which fields are impacted and in what order, and re-evaluates each via the
/// evaluator against the progressively-updated copy, so later fields observe
/// earlier fields' freshly computed values. A single field's failure is
/// logged and skipped; it never aborts the pass or corrupts the snapshot.
///
/// The metrics behind one mutex are the only cross-call state.
pub struct Recalculator {
    budget: Duration,
    metrics: Mutex<MetricsInner>,
}

impl Recalculator {
    pub fn new() -> Self {
        Self::with_settings(&Settings::default())
    }

    pub fn with_settings(settings: &Settings) -> Self {
        Self {
            budget: settings.budget(),
            metrics: Mutex::new(MetricsInner::default()),
        }
    }

    /// Applies `new_value` to `changed_field` and recomputes the impacted
    /// fields in dependency order. Returns the updated snapshot; the input
    /// snapshot is never mutated.
    pub fn recalculate(
        &self,
        snapshot: &Snapshot,
        changed_field: &str,
        new_value: Value,
        graph: &DependencyGraph,
        evaluator: &Evaluator,
        formulas: &dyn FormulaSource,
    ) -> Result<Snapshot> {
        if changed_field.trim().is_empty() {
            return Err(FormcalcError::InvalidField(
                "changed field name must not be empty".to_owned(),
            ));
        }
        let started = Instant::now();
        let mut updated = snapshot.clone();
        updated.set(changed_field, new_value);
        let impacted = graph.fields_to_recalculate(changed_field)?;
        debug!(
            field = %changed_field,
            impacted = impacted.len(),
            "recalculation pass started"
        );
        self.run_pass(&mut updated, &impacted, evaluator, formulas);
        self.record_pass(started.elapsed(), impacted.len());
        info!(
            field = %changed_field,
            impacted = impacted.len(),
            ms = started.elapsed().as_secs_f64() * 1000.0,
            "recalculation pass complete"
        );
        Ok(updated)
    }

    /// Recomputes every calculated field over the full topological order.
    /// Used for whole-form reconciliation, e.g. after a bulk data import.
    pub fn recalculate_all(
        &self,
        snapshot: &Snapshot,
        graph: &DependencyGraph,
        evaluator: &Evaluator,
        formulas: &dyn FormulaSource,
    ) -> Result<Snapshot> {
        let started = Instant::now();
        let mut updated = snapshot.clone();
        let order = graph.topological_order()?;
        self.run_pass(&mut updated, &order, evaluator, formulas);
        self.record_pass(started.elapsed(), order.len());
        info!(
            fields = order.len(),
            ms = started.elapsed().as_secs_f64() * 1000.0,
            "full recalculation complete"
        );
        Ok(updated)
    }

    /// A deep copy of the cumulative counters.
    pub fn metrics(&self) -> RecalculationMetrics {
        let inner = self.metrics.lock().unwrap();
        let average_pass_time = if inner.total_passes > 0 {
            inner.total_time / inner.total_passes as u32
        } else {
            Duration::ZERO
        };
        RecalculationMetrics {
            total_passes: inner.total_passes,
            total_time: inner.total_time,
            average_pass_time,
            fields_recalculated: inner.fields_recalculated,
            field_counts: inner
                .per_field
                .values()
                .map(|tally| (tally.name.clone(), tally.count))
                .collect(),
            field_times: inner
                .per_field
                .values()
                .map(|tally| (tally.name.clone(), tally.elapsed))
                .collect(),
            last_pass: inner.last_pass,
        }
    }

    /// Zeroes every counter.
    pub fn reset_metrics(&self) {
        let mut inner = self.metrics.lock().unwrap();
        *inner = MetricsInner::default();
    }

    fn run_pass(
        &self,
        snapshot: &mut Snapshot,
        fields: &[String],
        evaluator: &Evaluator,
        formulas: &dyn FormulaSource,
    ) {
        for field in fields {
            let field_started = Instant::now();
            match formulas.formula_for(field) {
                Some(formula) => {
                    let outcome = {
                        let context =
                            EvaluationContext::new(snapshot).with_budget(self.budget);
                        evaluator.evaluate(formula, &context)
                    };
                    match outcome {
                        Ok(evaluation) => {
                            debug!(
                                field = %field,
                                value = %evaluation.value,
                                kind = %evaluation.kind,
                                "field recalculated"
                            );
                            snapshot.set(field, evaluation.value);
                        }
                        Err(error) => {
                            // previous value stays; the pass continues
                            warn!(
                                field = %field,
                                %error,
                                "formula failed; keeping previous value"
                            );
                        }
                    }
                }
                None => {
                    debug!(field = %field, "no formula; value left unchanged");
                }
            }
            self.record_field(field, field_started.elapsed());
        }
    }

    fn record_field(&self, field: &str, elapsed: Duration) {
        let mut inner = self.metrics.lock().unwrap();
        let tally = inner
            .per_field
            .entry(fold(field))
            .or_insert_with(|| FieldTally {
                name: field.to_owned(),
                count: 0,
                elapsed: Duration::ZERO,
            });
        tally.count += 1;
        tally.elapsed += elapsed;
    }

    fn record_pass(&self, elapsed: Duration, impacted: usize) {
        let mut inner = self.metrics.lock().unwrap();
        inner.total_passes += 1;
        inner.total_time += elapsed;
        inner.fields_recalculated += impacted as u64;
        inner.last_pass = Some(Utc::now().naive_utc());
    }
}

impl Default for Recalculator {
    fn default() -> Self {
        Self::new()
    }
}
