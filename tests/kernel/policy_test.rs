//! Policy evaluation: first-match-wins, fail-closed default, budgets.

use nodekernel::kernel::policy::{
    evaluate, BudgetLedger, PolicyDecision, PolicyError, PolicySet, Rule, BUDGET_EXCEEDED,
    NO_MATCHING_RULE,
};
use nodekernel::types::SyscallRequest;
use serde_json::json;

fn request(capability: &str) -> SyscallRequest {
    SyscallRequest::new(capability, json!({}))
}

fn policy(rules: Vec<Rule>) -> PolicySet {
    PolicySet::new(rules)
}

#[test]
fn empty_policy_denies_everything() {
    let decision = evaluate(&PolicySet::default(), &request("qsk.read"), &BudgetLedger::new(), 0);
    assert_eq!(decision, PolicyDecision::Deny(NO_MATCHING_RULE.to_owned()));
}

#[test]
fn unmatched_capability_is_denied_with_no_matching_rule() {
    let p = policy(vec![Rule::allow("qsk.*").expect("rule")]);
    let decision = evaluate(&p, &request("bio.synthesize"), &BudgetLedger::new(), 0);
    assert_eq!(decision.reason(), Some("no matching rule"));
}

#[test]
fn first_match_wins_over_more_specific_later_rule() {
    let p = policy(vec![
        Rule::deny("qsk.*", "quarantined").expect("rule"),
        Rule::allow("qsk.read").expect("rule"),
    ]);
    let decision = evaluate(&p, &request("qsk.read"), &BudgetLedger::new(), 0);
    assert_eq!(decision, PolicyDecision::Deny("quarantined".to_owned()));

    let reversed = policy(vec![
        Rule::allow("qsk.read").expect("rule"),
        Rule::deny("qsk.*", "quarantined").expect("rule"),
    ]);
    assert!(evaluate(&reversed, &request("qsk.read"), &BudgetLedger::new(), 0).is_allowed());
    assert!(!evaluate(&reversed, &request("qsk.write"), &BudgetLedger::new(), 0).is_allowed());
}

#[test]
fn deny_rule_without_reason_names_its_pattern() {
    let mut rule = Rule::deny("bio.*", "x").expect("rule");
    rule.reason = None;
    let decision = evaluate(&policy(vec![rule]), &request("bio.read"), &BudgetLedger::new(), 0);
    assert_eq!(decision.reason(), Some("denied by rule 'bio.*'"));
}

#[test]
fn budget_converts_allow_into_deny() {
    let p = policy(vec![Rule::allow("qsk.read").expect("rule").with_budget(2, 10)]);
    let mut ledger = BudgetLedger::new();

    assert!(evaluate(&p, &request("qsk.read"), &ledger, 1).is_allowed());
    ledger.record("qsk.read", 1);
    assert!(evaluate(&p, &request("qsk.read"), &ledger, 2).is_allowed());
    ledger.record("qsk.read", 2);

    let decision = evaluate(&p, &request("qsk.read"), &ledger, 3);
    assert_eq!(decision, PolicyDecision::Deny(BUDGET_EXCEEDED.to_owned()));
}

#[test]
fn budget_window_slides() {
    let p = policy(vec![Rule::allow("qsk.read").expect("rule").with_budget(1, 5)]);
    let mut ledger = BudgetLedger::new();
    ledger.record("qsk.read", 1);

    assert!(!evaluate(&p, &request("qsk.read"), &ledger, 5).is_allowed());
    // Tick 1 falls out of (1, 6].
    assert!(evaluate(&p, &request("qsk.read"), &ledger, 6).is_allowed());
}

#[test]
fn budgets_are_per_capability() {
    let p = policy(vec![Rule::allow("qsk.*").expect("rule").with_budget(1, 100)]);
    let mut ledger = BudgetLedger::new();
    ledger.record("qsk.read", 1);
    assert!(!evaluate(&p, &request("qsk.read"), &ledger, 2).is_allowed());
    assert!(evaluate(&p, &request("qsk.write"), &ledger, 2).is_allowed());
}

#[test]
fn evaluation_is_pure() {
    let p = policy(vec![
        Rule::allow("qsk.*").expect("rule").with_budget(3, 10),
        Rule::deny("*", "catch-all").expect("rule"),
    ]);
    let mut ledger = BudgetLedger::new();
    ledger.record("qsk.read", 4);
    let snapshot = ledger.clone();

    for cap in ["qsk.read", "bio.read", "qsk.write"] {
        let first = evaluate(&p, &request(cap), &ledger, 9);
        let second = evaluate(&p, &request(cap), &ledger, 9);
        assert_eq!(first, second);
    }
    assert_eq!(ledger, snapshot);
}

#[test]
fn zero_window_budget_fails_validation() {
    let p = policy(vec![Rule::allow("qsk.*").expect("rule").with_budget(1, 0)]);
    assert_eq!(
        p.validate(),
        Err(PolicyError::InvalidBudget {
            pattern: "qsk.*".to_owned()
        })
    );
}

#[test]
fn policy_deserializes_from_toml() {
    let toml_str = r#"
[[rules]]
pattern = "qsk.*"
action = "allow"
budget = { max_requests = 5, window_ticks = 60 }

[[rules]]
pattern = "bio.*"
action = "deny"
reason = "biosecurity"
"#;
    let p: PolicySet = toml::from_str(toml_str).expect("parse");
    assert_eq!(p.rules.len(), 2);
    assert_eq!(p.rules[0].budget.map(|b| b.max_requests), Some(5));
    assert_eq!(
        evaluate(&p, &request("bio.x"), &BudgetLedger::new(), 0).reason(),
        Some("biosecurity")
    );
}

#[test]
fn empty_pattern_fails_to_deserialize() {
    let toml_str = r#"
[[rules]]
pattern = ""
action = "allow"
"#;
    assert!(toml::from_str::<PolicySet>(toml_str).is_err());
}
