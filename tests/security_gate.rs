use formcalc::error::FormcalcError;
use formcalc::formula::{EvaluationContext, Evaluator};
use formcalc::value::{Snapshot, Value};

fn setup() -> (Evaluator, Snapshot) {
    let mut snapshot = Snapshot::new();
    snapshot.set("process_fee", Value::from(5));
    (Evaluator::new(), snapshot)
}

#[test]
fn denied_keywords_are_rejected_before_execution() {
    let (evaluator, snapshot) = setup();
    let ctx = EvaluationContext::new(&snapshot);
    let hostile = [
        "eval(1)",
        "system('ls')",
        "exec('rm')",
        "File.read('x')",
        "typeof(1)",
        "while(true)",
        "goto end",
        "try catch",
        "Reflection.get()",
    ];
    for text in hostile {
        let err = evaluator.evaluate(text, &ctx).unwrap_err();
        assert!(
            matches!(err, FormcalcError::SecurityViolation(_)),
            "expression {text:?} should be rejected, got {err}"
        );
    }
}

#[test]
fn denied_markup_fragments_are_rejected() {
    let (evaluator, snapshot) = setup();
    let ctx = EvaluationContext::new(&snapshot);
    let hostile = ["${name}", "<script>alert(1)</script>", "javascript:void(0)", "<% 1 %>"];
    for text in hostile {
        let err = evaluator.evaluate(text, &ctx).unwrap_err();
        assert!(
            matches!(err, FormcalcError::SecurityViolation(_)),
            "expression {text:?} should be rejected, got {err}"
        );
    }
}

#[test]
fn matching_is_case_insensitive() {
    let (evaluator, snapshot) = setup();
    let ctx = EvaluationContext::new(&snapshot);
    let err = evaluator.evaluate("EVAL(1)", &ctx).unwrap_err();
    assert!(matches!(err, FormcalcError::SecurityViolation(_)));
    let err = evaluator.evaluate("JavaScript:x", &ctx).unwrap_err();
    assert!(matches!(err, FormcalcError::SecurityViolation(_)));
}

#[test]
fn keywords_embedded_in_field_names_pass() {
    let (evaluator, snapshot) = setup();
    let ctx = EvaluationContext::new(&snapshot);
    // "process" is denied as a word; "$process_fee" is a field reference
    let res = evaluator.evaluate("$process_fee + 1", &ctx).expect("ok");
    assert_eq!(res.value, Value::from(6));
    assert!(evaluator.is_safe("$process_fee + 1"));
}

#[test]
fn is_safe_is_a_pure_gate() {
    let (evaluator, _) = setup();
    assert!(evaluator.is_safe("$total + $price"));
    assert!(!evaluator.is_safe("eval(1)"));
    assert!(!evaluator.is_safe(""));
}

#[test]
fn validation_reports_security_issues_and_balance() {
    let (evaluator, _) = setup();
    let report = evaluator.validate("eval(1)");
    assert!(!report.is_valid());
    assert!(!report.security_issues.is_empty());

    let report = evaluator.validate("(1+2");
    assert!(!report.is_valid());
    assert!(report.errors.iter().any(|e| e.contains("parentheses")));

    let report = evaluator.validate("'unterminated");
    assert!(report.errors.iter().any(|e| e.contains("single quotes")));

    let report = evaluator.validate("1 $ 2");
    assert!(report.is_valid());
    assert!(!report.warnings.is_empty());

    let report = evaluator.validate("IF($a > 1, 'x', 'y')");
    assert!(report.is_valid());
    assert!(report.warnings.is_empty());
}

#[test]
fn unbalanced_parentheses_fail_evaluation() {
    let (evaluator, snapshot) = setup();
    let ctx = EvaluationContext::new(&snapshot);
    let err = evaluator.evaluate("(1+2", &ctx).unwrap_err();
    assert!(matches!(err, FormcalcError::Syntax(_)));
}
