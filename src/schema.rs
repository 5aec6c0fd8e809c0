use serde::Deserialize;
use serde_json::Value as JsonValue;

use tracing::debug;

use std::collections::HashMap;

use crate::error::{FormcalcError, Result};
use crate::formula::{extract_variables, Evaluator, ValidationReport};
use crate::graph::DependencyGraph;
use crate::recalc::FormulaSource;
use crate::value::{fold, FieldHasher, Snapshot, Value};

/// One field in a form schema document. A field with a formula is calculated;
/// one without is user-entered. The optional value seeds the initial snapshot.
#[derive(Debug, Clone, Deserialize)]
pub struct FieldDef {
    pub name: String,
    #[serde(default)]
    pub formula: Option<String>,
    #[serde(default)]
    pub value: Option<JsonValue>,
}

/// Findings for one field's formula, from static validation of a schema.
#[derive(Debug, Clone)]
pub struct FieldValidation {
    pub field: String,
    pub report: ValidationReport,
    /// `$name` references that match no field in the schema.
    pub unknown_references: Vec<String>,
}

// ------------- FormSchema -------------
/// The schema collaborator: the list of fields, their formulas, and their
/// initial values, as authored. Deserializes from a document of the shape
/// `{"fields": [{"name": ..., "formula": ..., "value": ...}]}`. Field names
/// are unique case-insensitively; duplicates are rejected on construction.
#[derive(Debug, Clone, Deserialize)]
#[serde(try_from = "SchemaDoc")]
pub struct FormSchema {
    fields: Vec<FieldDef>,
    // folded name to position in `fields`
    index: HashMap<String, usize, FieldHasher>,
}

#[derive(Deserialize)]
struct SchemaDoc {
    fields: Vec<FieldDef>,
}

impl TryFrom<SchemaDoc> for FormSchema {
    type Error = FormcalcError;

    fn try_from(doc: SchemaDoc) -> Result<Self> {
        FormSchema::new(doc.fields)
    }
}

impl FormSchema {
    pub fn new(fields: Vec<FieldDef>) -> Result<Self> {
        let mut index: HashMap<String, usize, FieldHasher> = HashMap::default();
        for (at, field) in fields.iter().enumerate() {
            if field.name.trim().is_empty() {
                return Err(FormcalcError::InvalidField(
                    "field names must not be empty".to_owned(),
                ));
            }
            if index.insert(fold(&field.name), at).is_some() {
                return Err(FormcalcError::InvalidField(format!(
                    "duplicate field name '{}'",
                    field.name
                )));
            }
        }
        Ok(Self { fields, index })
    }

    /// Case-insensitive field lookup.
    pub fn field(&self, name: &str) -> Option<&FieldDef> {
        self.index.get(&fold(name)).map(|at| &self.fields[*at])
    }

    pub fn fields(&self) -> impl Iterator<Item = &FieldDef> {
        self.fields.iter()
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Seeds a dependency graph with one edge per statically-detected `$name`
    /// reference in each calculated field's formula. A formula that closes a
    /// cycle or references its own field surfaces the graph's error.
    pub fn build_graph(&self) -> Result<DependencyGraph> {
        let graph = DependencyGraph::new();
        for field in &self.fields {
            if let Some(formula) = &field.formula {
                for referenced in extract_variables(formula) {
                    debug!(
                        dependent = %field.name,
                        depends_on = %referenced,
                        "seeding dependency edge"
                    );
                    graph.add_dependency(&field.name, &referenced)?;
                }
            }
        }
        Ok(graph)
    }

    /// The starting snapshot: each field's declared value, null when absent.
    pub fn initial_snapshot(&self) -> Snapshot {
        let mut snapshot = Snapshot::new();
        for field in &self.fields {
            let value = match &field.value {
                Some(json) => Value::from(json.clone()),
                None => Value::Null,
            };
            snapshot.set(&field.name, value);
        }
        snapshot
    }

    /// Static validation of every formula: the evaluator's own checks plus
    /// references to fields the schema does not define. Fields without a
    /// formula are skipped.
    pub fn validate(&self, evaluator: &Evaluator) -> Vec<FieldValidation> {
        let mut findings = Vec::new();
        for field in &self.fields {
            let Some(formula) = &field.formula else {
                continue;
            };
            let report = evaluator.validate(formula);
            let unknown_references: Vec<String> = extract_variables(formula)
                .into_iter()
                .filter(|name| !self.index.contains_key(&fold(name)))
                .collect();
            if !report.is_valid()
                || !report.warnings.is_empty()
                || !unknown_references.is_empty()
            {
                findings.push(FieldValidation {
                    field: field.name.clone(),
                    report,
                    unknown_references,
                });
            }
        }
        findings
    }
}

impl FormulaSource for FormSchema {
    fn formula_for(&self, field: &str) -> Option<&str> {
        self.field(field).and_then(|def| def.formula.as_deref())
    }
}
