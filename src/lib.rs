//! Formcalc – formula evaluation and incremental recalculation for forms
//! whose fields are computed live from other fields (`total = price *
//! quantity`).
//!
//! Three components make up the core:
//! * The [`formula::Evaluator`] parses and evaluates one author-written
//!   formula string against a variable [`value::Snapshot`], behind a
//!   deny-list safety gate and a cooperative execution budget. It is
//!   stateless per call and safe to share across threads.
//! * The [`graph::DependencyGraph`] tracks "field depends on field" edges,
//!   rejects any edge that would close a cycle before mutating state, and
//!   answers topological-order and impact-set queries.
//! * The [`recalc::Recalculator`] orchestrates a pass: apply a changed
//!   value, ask the graph which fields are impacted and in what order,
//!   re-evaluate each against the progressively-updated snapshot, and record
//!   metrics. One field's failure never aborts a pass.
//!
//! The embedded expression language is intentionally tiny: arithmetic,
//! comparison, boolean logic, string operations, a fixed table of 30 builtin
//! functions, and `$name` variable references. No loops, no declarations, no
//! reflection. Safety comes from the restricted grammar plus the deny-list,
//! not from a full sandbox.
//!
//! ## Modules
//! * [`formula`] – the expression evaluator, safety gate, and validation.
//! * [`graph`] – the dependency graph and its statistics.
//! * [`recalc`] – the recalculation driver and its metrics.
//! * [`schema`] – the form-schema collaborator: field definitions, graph
//!   seeding, and the initial snapshot.
//! * [`value`] – the value model, coercions, and the snapshot map.
//! * [`settings`] – engine tuning loaded via the `config` crate.
//! * [`error`] – the crate-wide error enum.
//!
//! ## Quick Start
//! ```
//! use formcalc::formula::{EvaluationContext, Evaluator};
//! use formcalc::graph::DependencyGraph;
//! use formcalc::value::{Snapshot, Value};
//!
//! let evaluator = Evaluator::new();
//! let mut snapshot = Snapshot::new();
//! snapshot.set("price", Value::from(3));
//! let context = EvaluationContext::new(&snapshot);
//! let result = evaluator.evaluate("$price * 2", &context).unwrap();
//! assert_eq!(result.value, Value::from(6));
//!
//! let graph = DependencyGraph::new();
//! graph.add_dependency("total", "price").unwrap();
//! assert_eq!(graph.fields_to_recalculate("price").unwrap(), vec!["total"]);
//! ```
//!
//! ## Operator semantics
//! By default the evaluator reproduces the legacy first-match operator scan:
//! the text is split at the first occurrence of an operator token in a fixed
//! priority order, not by mathematical precedence, so chains group to the
//! right (`10-2-3` is `10-(2-3)`). Existing stored formulas depend on this.
//! Setting [`settings::Settings::operator_precedence`] switches to a
//! tokenizer and precedence-climbing parser behind the same contract.

pub mod error;
pub mod formula;
pub mod graph;
pub mod recalc;
pub mod schema;
pub mod settings;
pub mod value;
