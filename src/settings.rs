// config lets you read a separate config file
use config::Config;
use serde::Deserialize;

use std::time::Duration;

use crate::error::Result;
use crate::formula::{DEFAULT_BUDGET, DEFAULT_MAX_DEPTH};

/// Engine tuning shared by the evaluator and the recalculation driver.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Cooperative execution budget per evaluation, in milliseconds.
    pub evaluation_budget_ms: u64,
    /// When false the evaluator reproduces the legacy first-match operator
    /// scan; when true it applies standard operator precedence. Flip this
    /// only once stored formulas have been reviewed, since it can change
    /// what an existing formula means.
    pub operator_precedence: bool,
    /// Nesting limit that turns runaway recursion into a syntax error.
    pub max_nesting_depth: usize,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            evaluation_budget_ms: DEFAULT_BUDGET.as_millis() as u64,
            operator_precedence: false,
            max_nesting_depth: DEFAULT_MAX_DEPTH,
        }
    }
}

impl Settings {
    /// Reads an optional `formcalc.*` file from the working directory, then
    /// `FORMCALC_*` environment overrides on top of the defaults.
    pub fn load() -> Result<Self> {
        let source = Config::builder()
            .add_source(config::File::with_name("formcalc").required(false))
            .add_source(config::Environment::with_prefix("FORMCALC"))
            .build()?;
        Ok(source.try_deserialize()?)
    }

    pub fn budget(&self) -> Duration {
        Duration::from_millis(self.evaluation_budget_ms)
    }
}
