use formcalc::error::FormcalcError;
use formcalc::formula::{extract_variables, EvaluationContext, Evaluator};
use formcalc::value::{Snapshot, Value};

fn setup() -> (Evaluator, Snapshot) {
    let mut snapshot = Snapshot::new();
    snapshot.set("name", Value::from("world"));
    snapshot.set("price", Value::from(10));
    (Evaluator::new(), snapshot)
}

#[test]
fn conditional_and_boolean_functions() {
    let (evaluator, snapshot) = setup();
    let ctx = EvaluationContext::new(&snapshot);
    let res = evaluator.evaluate("IF(1>0,'yes','no')", &ctx).expect("ok");
    assert_eq!(res.value, Value::from("yes"));
    let res = evaluator.evaluate("IF(1<0,'yes','no')", &ctx).expect("ok");
    assert_eq!(res.value, Value::from("no"));
    let res = evaluator.evaluate("AND(true, false)", &ctx).expect("ok");
    assert_eq!(res.value, Value::Boolean(false));
    let res = evaluator.evaluate("OR(true, false)", &ctx).expect("ok");
    assert_eq!(res.value, Value::Boolean(true));
    let res = evaluator.evaluate("NOT(true)", &ctx).expect("ok");
    assert_eq!(res.value, Value::Boolean(false));
}

#[test]
fn function_names_are_case_insensitive() {
    let (evaluator, snapshot) = setup();
    let ctx = EvaluationContext::new(&snapshot);
    let res = evaluator.evaluate("if(1>0, 1, 2)", &ctx).expect("ok");
    assert_eq!(res.value, Value::from(1));
}

#[test]
fn string_functions() {
    let (evaluator, snapshot) = setup();
    let ctx = EvaluationContext::new(&snapshot);
    let res = evaluator
        .evaluate("CONCAT('hello ', $name)", &ctx)
        .expect("ok");
    assert_eq!(res.value, Value::from("hello world"));
    let res = evaluator.evaluate("UPPER('abc')", &ctx).expect("ok");
    assert_eq!(res.value, Value::from("ABC"));
    let res = evaluator.evaluate("LOWER('ABC')", &ctx).expect("ok");
    assert_eq!(res.value, Value::from("abc"));
    let res = evaluator.evaluate("TRIM('  pad  ')", &ctx).expect("ok");
    assert_eq!(res.value, Value::from("pad"));
    let res = evaluator
        .evaluate("SUBSTRING('hello', 1, 3)", &ctx)
        .expect("ok");
    assert_eq!(res.value, Value::from("ell"));
    let res = evaluator
        .evaluate("CONTAINS('hello world', 'world')", &ctx)
        .expect("ok");
    assert_eq!(res.value, Value::Boolean(true));
}

#[test]
fn length_counts_characters_not_bytes() {
    let (evaluator, snapshot) = setup();
    let ctx = EvaluationContext::new(&snapshot);
    let res = evaluator.evaluate("LENGTH('héllo')", &ctx).expect("ok");
    assert_eq!(res.value, Value::from(5));
}

#[test]
fn commas_inside_string_literals_are_not_split_points() {
    let (evaluator, snapshot) = setup();
    let ctx = EvaluationContext::new(&snapshot);
    let res = evaluator
        .evaluate("CONCAT('a,b', UPPER('c'))", &ctx)
        .expect("ok");
    assert_eq!(res.value, Value::from("a,bC"));
}

#[test]
fn arithmetic_functions() {
    let (evaluator, snapshot) = setup();
    let ctx = EvaluationContext::new(&snapshot);
    let res = evaluator.evaluate("ADD(2, 3)", &ctx).expect("ok");
    assert_eq!(res.value, Value::from(5));
    let res = evaluator.evaluate("SUBTRACT(10, 4)", &ctx).expect("ok");
    assert_eq!(res.value, Value::from(6));
    let res = evaluator.evaluate("MULTIPLY($price, 3)", &ctx).expect("ok");
    assert_eq!(res.value, Value::from(30));
    let res = evaluator.evaluate("DIVIDE(9, 2)", &ctx).expect("ok");
    assert_eq!(res.value.to_string(), "4.5");
    let res = evaluator.evaluate("ABS(-7)", &ctx).expect("ok");
    assert_eq!(res.value, Value::from(7));
    let res = evaluator.evaluate("MIN(3, 7)", &ctx).expect("ok");
    assert_eq!(res.value, Value::from(3));
    let res = evaluator.evaluate("MAX(3, 7)", &ctx).expect("ok");
    assert_eq!(res.value, Value::from(7));
}

#[test]
fn round_is_half_to_even() {
    let (evaluator, snapshot) = setup();
    let ctx = EvaluationContext::new(&snapshot);
    let res = evaluator.evaluate("ROUND(2.5, 0)", &ctx).expect("ok");
    assert_eq!(res.value.to_string(), "2");
    let res = evaluator.evaluate("ROUND(3.5, 0)", &ctx).expect("ok");
    assert_eq!(res.value.to_string(), "4");
    let res = evaluator.evaluate("ROUND(2.345, 2)", &ctx).expect("ok");
    assert_eq!(res.value.to_string(), "2.34");
    let err = evaluator.evaluate("ROUND(2.5, -1)", &ctx).unwrap_err();
    assert!(matches!(err, FormcalcError::Evaluation(_)));
}

#[test]
fn date_functions() {
    let (evaluator, snapshot) = setup();
    let ctx = EvaluationContext::new(&snapshot);
    let res = evaluator
        .evaluate("DATE_ADD('2024-01-15', 10, 'days')", &ctx)
        .expect("ok");
    assert_eq!(res.value.to_string(), "2024-01-25 00:00:00");
    // month arithmetic clamps to the end of a shorter month
    let res = evaluator
        .evaluate("DATE_ADD('2024-01-31', 1, 'months')", &ctx)
        .expect("ok");
    assert_eq!(res.value.to_string(), "2024-02-29 00:00:00");
    let res = evaluator
        .evaluate("DATE_DIFF('2024-01-01', '2024-01-31', 'days')", &ctx)
        .expect("ok");
    assert_eq!(res.value, Value::from(30));
    let res = evaluator
        .evaluate("DATE_DIFF('2024-01-01', '2024-03-01', 'months')", &ctx)
        .expect("ok");
    assert_eq!(res.value, Value::from(2));
    let res = evaluator
        .evaluate("FORMAT_DATE('2024-01-15', '%d/%m/%Y')", &ctx)
        .expect("ok");
    assert_eq!(res.value, Value::from("15/01/2024"));
}

#[test]
fn null_handling_functions() {
    let (evaluator, snapshot) = setup();
    let ctx = EvaluationContext::new(&snapshot);
    let res = evaluator.evaluate("IS_NULL($missing)", &ctx).expect("ok");
    assert_eq!(res.value, Value::Boolean(true));
    let res = evaluator.evaluate("IS_NULL($price)", &ctx).expect("ok");
    assert_eq!(res.value, Value::Boolean(false));
    let res = evaluator.evaluate("IS_EMPTY('')", &ctx).expect("ok");
    assert_eq!(res.value, Value::Boolean(true));
    let res = evaluator
        .evaluate("COALESCE($missing, 'fallback')", &ctx)
        .expect("ok");
    assert_eq!(res.value, Value::from("fallback"));
    let res = evaluator
        .evaluate("COALESCE($name, 'fallback')", &ctx)
        .expect("ok");
    assert_eq!(res.value, Value::from("world"));
}

#[test]
fn nested_calls_evaluate_inside_out() {
    let (evaluator, snapshot) = setup();
    let ctx = EvaluationContext::new(&snapshot);
    let res = evaluator
        .evaluate("IF(GREATER_THAN($price, 5), ROUND(DIVIDE($price, 3), 2), 0)", &ctx)
        .expect("ok");
    assert_eq!(res.value.to_string(), "3.33");
}

#[test]
fn unknown_function_is_a_syntax_error() {
    let (evaluator, snapshot) = setup();
    let ctx = EvaluationContext::new(&snapshot);
    let err = evaluator.evaluate("FROBNICATE(1)", &ctx).unwrap_err();
    assert!(matches!(err, FormcalcError::Syntax(_)));
}

#[test]
fn wrong_argument_count_is_an_evaluation_error() {
    let (evaluator, snapshot) = setup();
    let ctx = EvaluationContext::new(&snapshot);
    let err = evaluator.evaluate("IF(1, 2)", &ctx).unwrap_err();
    assert!(matches!(err, FormcalcError::Evaluation(_)));
}

#[test]
fn function_table_is_exposed() {
    let (evaluator, _) = setup();
    let functions = evaluator.available_functions();
    assert_eq!(functions.len(), 30);
    let concat = functions
        .iter()
        .find(|f| f.name == "CONCAT")
        .expect("CONCAT listed");
    assert_eq!(concat.arity, 2);
}

#[test]
fn variable_extraction_for_graph_seeding() {
    let vars = extract_variables("IF($a > $b, $a, $A) + $total_price");
    assert_eq!(vars, vec!["a", "b", "total_price"]);
    assert!(extract_variables("1 + 2").is_empty());
}
