//! Demo binary: loads a schema document, seeds the dependency graph, runs a
//! full reconciliation, then applies `field = value` lines from stdin through
//! incremental recalculation, printing the impacted fields as they change.

use bigdecimal::BigDecimal;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use std::io::{self, BufRead, Write};
use std::str::FromStr;

use formcalc::formula::Evaluator;
use formcalc::recalc::Recalculator;
use formcalc::schema::FormSchema;
use formcalc::settings::Settings;
use formcalc::value::Value;

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();
    if let Err(e) = run() {
        error!(%e, "formcalc demo failed");
        std::process::exit(1);
    }
}

fn run() -> Result<(), Box<dyn std::error::Error>> {
    let settings = match Settings::load() {
        Ok(settings) => settings,
        Err(e) => {
            warn!(%e, "could not load settings; using defaults");
            Settings::default()
        }
    };
    let path = std::env::args().nth(1).unwrap_or_else(|| "form.json".to_owned());
    let document = std::fs::read_to_string(&path)?;
    let schema: FormSchema = serde_json::from_str(&document)?;
    info!(path = %path, fields = schema.len(), "schema loaded");

    let evaluator = Evaluator::with_settings(&settings);
    for finding in schema.validate(&evaluator) {
        for issue in &finding.report.errors {
            warn!(field = %finding.field, issue = %issue, "formula problem");
        }
        for name in &finding.unknown_references {
            warn!(field = %finding.field, reference = %name, "reference to unknown field");
        }
    }

    let graph = schema.build_graph()?;
    let stats = graph.stats();
    info!(
        fields = stats.total_fields,
        edges = stats.total_dependencies,
        max_depth = stats.max_depth,
        "dependency graph seeded"
    );

    let recalculator = Recalculator::with_settings(&settings);
    let mut snapshot =
        recalculator.recalculate_all(&schema.initial_snapshot(), &graph, &evaluator, &schema)?;
    for (name, value) in snapshot.iter() {
        println!("{} = {}", name, value);
    }

    println!("enter `field = value` lines (ctrl-d to quit):");
    let stdin = io::stdin();
    print!("> ");
    io::stdout().flush()?;
    for line in stdin.lock().lines() {
        let line = line?;
        if let Some((field, raw)) = line.split_once('=') {
            let field = field.trim();
            let value = parse_value(raw.trim());
            match recalculator.recalculate(&snapshot, field, value, &graph, &evaluator, &schema) {
                Ok(updated) => {
                    for name in graph.fields_to_recalculate(field)? {
                        if let Some(value) = updated.get(&name) {
                            println!("{} = {}", name, value);
                        }
                    }
                    snapshot = updated;
                }
                Err(e) => warn!(%e, "recalculation failed"),
            }
        } else if !line.trim().is_empty() {
            println!("expected `field = value`");
        }
        print!("> ");
        io::stdout().flush()?;
    }

    let metrics = recalculator.metrics();
    info!(
        passes = metrics.total_passes,
        fields = metrics.fields_recalculated,
        avg_ms = metrics.average_pass_time.as_secs_f64() * 1000.0,
        "session metrics"
    );
    Ok(())
}

// Literal forms accepted at the prompt: number, boolean, quoted or bare text.
fn parse_value(raw: &str) -> Value {
    if raw.is_empty() || raw.eq_ignore_ascii_case("null") {
        return Value::Null;
    }
    if raw.eq_ignore_ascii_case("true") {
        return Value::Boolean(true);
    }
    if raw.eq_ignore_ascii_case("false") {
        return Value::Boolean(false);
    }
    if let Ok(number) = BigDecimal::from_str(raw) {
        return Value::Number(number);
    }
    let unquoted = raw
        .strip_prefix('\'')
        .and_then(|s| s.strip_suffix('\''))
        .or_else(|| raw.strip_prefix('"').and_then(|s| s.strip_suffix('"')))
        .unwrap_or(raw);
    Value::Text(unquoted.to_owned())
}
