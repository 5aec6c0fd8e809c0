use formcalc::error::FormcalcError;
use formcalc::formula::{EvaluationContext, Evaluator};
use formcalc::settings::Settings;
use formcalc::value::{Snapshot, Value};

fn setup() -> (Evaluator, Snapshot) {
    let mut snapshot = Snapshot::new();
    snapshot.set("a", Value::from(1));
    snapshot.set("b", Value::from(2));
    (Evaluator::new(), snapshot)
}

fn precedence_evaluator() -> Evaluator {
    let settings = Settings {
        operator_precedence: true,
        ..Settings::default()
    };
    Evaluator::with_settings(&settings)
}

#[test]
fn basic_arithmetic() {
    let (evaluator, snapshot) = setup();
    let ctx = EvaluationContext::new(&snapshot);
    let res = evaluator.evaluate("2+3", &ctx).expect("ok");
    assert_eq!(res.value, Value::from(5));
    let res = evaluator.evaluate("10 - 4", &ctx).expect("ok");
    assert_eq!(res.value, Value::from(6));
    let res = evaluator.evaluate("6 * 7", &ctx).expect("ok");
    assert_eq!(res.value, Value::from(42));
    let res = evaluator.evaluate("10 / 4", &ctx).expect("ok");
    assert_eq!(res.value.to_string(), "2.5");
}

#[test]
fn operands_from_variables() {
    let (evaluator, snapshot) = setup();
    let ctx = EvaluationContext::new(&snapshot);
    let res = evaluator.evaluate("$a + $b", &ctx).expect("ok");
    assert_eq!(res.value, Value::from(3));
}

#[test]
fn legacy_scan_groups_chains_to_the_right() {
    let (evaluator, snapshot) = setup();
    let ctx = EvaluationContext::new(&snapshot);
    // the first "-" splits the text, so 10-2-3 means 10-(2-3)
    let res = evaluator.evaluate("10-2-3", &ctx).expect("ok");
    assert_eq!(res.value, Value::from(11));
    let res = evaluator.evaluate("100/10/5", &ctx).expect("ok");
    assert_eq!(res.value, Value::from(50));
}

#[test]
fn precedence_mode_groups_chains_to_the_left() {
    let evaluator = precedence_evaluator();
    let snapshot = Snapshot::new();
    let ctx = EvaluationContext::new(&snapshot);
    let res = evaluator.evaluate("10-2-3", &ctx).expect("ok");
    assert_eq!(res.value, Value::from(5));
    let res = evaluator.evaluate("100/10/5", &ctx).expect("ok");
    assert_eq!(res.value, Value::from(2));
}

#[test]
fn precedence_mode_supports_grouping_parentheses() {
    let evaluator = precedence_evaluator();
    let snapshot = Snapshot::new();
    let ctx = EvaluationContext::new(&snapshot);
    let res = evaluator.evaluate("(1+2)*3", &ctx).expect("ok");
    assert_eq!(res.value, Value::from(9));
    let res = evaluator.evaluate("3 * -2", &ctx).expect("ok");
    assert_eq!(res.value, Value::from(-6));
    // the legacy scan has no grouping parentheses
    let (legacy, _) = setup();
    let err = legacy.evaluate("(1+2)*3", &ctx).unwrap_err();
    assert!(matches!(err, FormcalcError::Syntax(_)));
}

#[test]
fn comparison_operators() {
    let (evaluator, snapshot) = setup();
    let ctx = EvaluationContext::new(&snapshot);
    let cases = [
        ("2 > 1", true),
        ("1 > 2", false),
        ("1 < 2", true),
        ("3 >= 3", true),
        ("2 <= 1", false),
        ("1 == 1", true),
        ("1 != 1", false),
    ];
    for (text, expected) in cases {
        let res = evaluator.evaluate(text, &ctx).expect("comparison ok");
        assert_eq!(res.value, Value::Boolean(expected), "case {text}");
    }
}

#[test]
fn equality_is_structural() {
    let (evaluator, snapshot) = setup();
    let ctx = EvaluationContext::new(&snapshot);
    // a text and a number are never equal, even when they read alike
    let res = evaluator.evaluate("'5' == 5", &ctx).expect("ok");
    assert_eq!(res.value, Value::Boolean(false));
}

#[test]
fn ordering_falls_back_to_text_for_mixed_kinds() {
    let (evaluator, snapshot) = setup();
    let ctx = EvaluationContext::new(&snapshot);
    let res = evaluator.evaluate("'b' > 'a'", &ctx).expect("ok");
    assert_eq!(res.value, Value::Boolean(true));
    // null sorts before everything
    let res = evaluator.evaluate("$missing < 0", &ctx).expect("ok");
    assert_eq!(res.value, Value::Boolean(true));
}

#[test]
fn boolean_operators_use_truthy_coercion() {
    let (evaluator, snapshot) = setup();
    let ctx = EvaluationContext::new(&snapshot);
    let res = evaluator.evaluate("true && false", &ctx).expect("ok");
    assert_eq!(res.value, Value::Boolean(false));
    let res = evaluator.evaluate("true || false", &ctx).expect("ok");
    assert_eq!(res.value, Value::Boolean(true));
    // a nonzero number is truthy
    let res = evaluator.evaluate("$a && true", &ctx).expect("ok");
    assert_eq!(res.value, Value::Boolean(true));
}

#[test]
fn division_by_zero_is_an_evaluation_error() {
    let (evaluator, snapshot) = setup();
    let ctx = EvaluationContext::new(&snapshot);
    let err = evaluator.evaluate("10/0", &ctx).unwrap_err();
    assert!(matches!(err, FormcalcError::Evaluation(_)));
}

#[test]
fn non_numeric_operand_is_an_evaluation_error() {
    let (evaluator, snapshot) = setup();
    let ctx = EvaluationContext::new(&snapshot);
    let err = evaluator.evaluate("'oops' * 2", &ctx).unwrap_err();
    assert!(matches!(err, FormcalcError::Evaluation(_)));
}

#[test]
fn dangling_operand_is_a_syntax_error() {
    let (evaluator, snapshot) = setup();
    let ctx = EvaluationContext::new(&snapshot);
    let err = evaluator.evaluate("1 +", &ctx).unwrap_err();
    assert!(matches!(err, FormcalcError::Syntax(_)));
}

#[test]
fn operator_list_is_exposed_in_scan_order() {
    let (evaluator, _) = setup();
    let operators = evaluator.supported_operators();
    assert_eq!(operators.first(), Some(&"=="));
    assert!(operators.contains(&"&&"));
    assert_eq!(operators.len(), 14);
}
