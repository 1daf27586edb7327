//! Node orchestration: readiness gate, ticks, health-driven pause,
//! snapshot and replay.

use std::io::Write;
use std::sync::{Arc, Mutex};
use std::thread;

use nodekernel::kernel::audit::AuditLog;
use nodekernel::kernel::handler::{HandlerError, HandlerRegistry};
use nodekernel::kernel::health::{AlertThreshold, HealthError};
use nodekernel::kernel::identity::{DigestAttestor, NodeIdentity};
use nodekernel::kernel::incident::IncidentFilter;
use nodekernel::kernel::lifecycle::LifecycleState;
use nodekernel::kernel::node::derive_query_id;
use nodekernel::kernel::policy::{PolicySet, Rule};
use nodekernel::kernel::{KernelError, KernelSettings, Node, NodeSnapshot, SharedNode};
use nodekernel::types::{Outcome, Payload, Severity, SyscallRequest};
use serde_json::json;

/// Shared buffer for capturing the audit mirror in tests.
#[derive(Clone, Default)]
struct SharedBuf(Arc<Mutex<Vec<u8>>>);

impl SharedBuf {
    fn contents(&self) -> String {
        String::from_utf8_lossy(&self.0.lock().expect("test lock")).to_string()
    }
}

impl Write for SharedBuf {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().expect("test lock").write(buf)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

fn identity() -> NodeIdentity {
    NodeIdentity::create("node-1", &DigestAttestor::from_seed(&[1u8; 32]), 0).expect("identity")
}

fn policy() -> PolicySet {
    PolicySet::new(vec![
        Rule::allow("qsk.*").expect("rule"),
        Rule::deny("bio.*", "biosecurity").expect("rule"),
    ])
}

fn handlers() -> HandlerRegistry {
    let mut reg = HandlerRegistry::new();
    reg.register_fn("qsk.read", |args| Ok(args.clone()));
    reg.register_fn("qsk.write", |_| Err(HandlerError::Failed("read-only".into())));
    reg.register_fn("bio.synthesize", |_| Ok(Payload::Null));
    reg
}

fn node_with(thresholds: Vec<AlertThreshold>) -> Node {
    let mut node =
        Node::bootstrap(identity(), policy(), thresholds, KernelSettings::default()).expect("boot");
    node.register_fn("qsk.read", |args| Ok(args.clone()));
    node.register_fn("qsk.write", |_| Err(HandlerError::Failed("read-only".into())));
    node.register_fn("bio.synthesize", |_| Ok(Payload::Null));
    assert_eq!(node.handlers().len(), handlers().len());
    node
}

fn running_node() -> Node {
    let mut node = node_with(Vec::new());
    node.transition(LifecycleState::Running).expect("start");
    node
}

fn req(capability: &str) -> SyscallRequest {
    SyscallRequest::new(capability, json!({ "n": 1 }))
}

#[test]
fn init_node_refuses_submit_without_side_effects() {
    let mut node = node_with(Vec::new());
    let err = node.submit(req("qsk.read")).expect_err("not ready");
    assert!(matches!(
        err,
        KernelError::NodeNotReady {
            state: LifecycleState::Init
        }
    ));
    assert!(node.audit().is_empty());
    assert!(node.incidents().is_empty());
    assert_eq!(node.tick(), 0);
    assert_eq!(node.sequence(), 0);
}

#[test]
fn shutdown_node_refuses_submit() {
    let mut node = running_node();
    node.transition(LifecycleState::Shutdown).expect("stop");
    let before = node.audit().len();
    assert!(matches!(
        node.submit(req("qsk.read")),
        Err(KernelError::NodeNotReady {
            state: LifecycleState::Shutdown
        })
    ));
    assert_eq!(node.audit().len(), before);
}

#[test]
fn paused_node_still_routes() {
    let mut node = running_node();
    node.transition(LifecycleState::Paused).expect("pause");
    assert!(node.submit(req("qsk.read")).is_ok());
    assert_eq!(node.audit().len(), 1);
}

#[test]
fn ticks_advance_per_submit_and_transition() {
    let mut node = running_node();
    assert_eq!(node.tick(), 1);
    node.submit(req("qsk.read")).expect("ok");
    assert_eq!(node.tick(), 2);
    node.transition(LifecycleState::Running).expect("noop");
    assert_eq!(node.tick(), 2);
    node.transition(LifecycleState::Paused).expect("pause");
    assert_eq!(node.tick(), 3);
    assert_eq!(node.lifecycle().history()[1].tick, 3);
}

#[test]
fn invalid_transition_leaves_node_unchanged() {
    let mut node = running_node();
    let before = node.snapshot();
    let err = node.transition(LifecycleState::Init).expect_err("illegal");
    assert!(matches!(err, KernelError::Lifecycle(_)));
    assert_eq!(node.snapshot(), before);
}

#[test]
fn derived_query_ids_are_deterministic_and_unique() {
    let mut node = running_node();
    let a = node.submit(req("qsk.read")).expect("ok");
    let b = node.submit(req("qsk.read")).expect("ok");
    assert_eq!(a.query_id(), derive_query_id("node-1", 1));
    assert_eq!(b.query_id(), derive_query_id("node-1", 2));
    assert_ne!(a.query_id(), b.query_id());
}

#[test]
fn derived_query_id_skips_ids_taken_by_callers() {
    let mut node = running_node();
    let taken = derive_query_id("node-1", 2);
    node
        .submit(req("qsk.read").with_query_id(taken.clone()))
        .expect("caller id accepted");

    let derived = node.submit(req("qsk.read")).expect("derived id is fresh");
    assert_ne!(derived.query_id(), taken);
    assert_eq!(node.audit().len(), 2);

    // Same history, same id.
    let mut again = running_node();
    again
        .submit(req("qsk.read").with_query_id(taken))
        .expect("caller id accepted");
    let rerun = again.submit(req("qsk.read")).expect("derived id is fresh");
    assert_eq!(rerun.query_id(), derived.query_id());
}

#[test]
fn caller_query_id_is_used_verbatim() {
    let mut node = running_node();
    let outcome = node
        .submit(req("qsk.read").with_query_id("caller-7"))
        .expect("ok");
    assert_eq!(outcome.query_id(), "caller-7");
    assert!(node.audit().find_by_query_id("caller-7").is_some());
}

#[test]
fn critical_alert_pauses_after_the_audit_entry() {
    let mut node = node_with(vec![AlertThreshold {
        name: "failure-storm".to_owned(),
        counter: "*:failed".to_owned(),
        threshold: 2,
        severity: Severity::Critical,
    }]);
    node.transition(LifecycleState::Running).expect("start");

    let _ = node.submit(req("qsk.write"));
    assert_eq!(node.state(), LifecycleState::Running);
    let _ = node.submit(req("qsk.write"));
    assert_eq!(node.state(), LifecycleState::Paused);
    assert_eq!(node.audit().len(), 2);

    let filter = IncidentFilter::new().min_severity(Severity::Critical);
    let critical: Vec<_> = node
        .query_incidents(&filter)
        .collect();
    assert_eq!(critical.len(), 1);

    // Fires once: further failures do not re-trigger.
    node.transition(LifecycleState::Running).expect("resume");
    let _ = node.submit(req("qsk.write"));
    assert_eq!(node.state(), LifecycleState::Running);

    // Clearing re-arms it.
    assert!(node.clear_alert("failure-storm"));
    let _ = node.submit(req("qsk.write"));
    assert_eq!(node.state(), LifecycleState::Paused);
}

#[test]
fn warning_alert_does_not_pause() {
    let mut node = node_with(vec![AlertThreshold {
        name: "denials".to_owned(),
        counter: "*:denied".to_owned(),
        threshold: 1,
        severity: Severity::Warning,
    }]);
    node.transition(LifecycleState::Running).expect("start");
    node.submit(req("bio.synthesize")).expect("denial is Ok");
    assert_eq!(node.state(), LifecycleState::Running);
    assert!(node.health().is_active("denials"));
}

#[test]
fn snapshot_round_trips_through_replay() {
    let mut node = running_node();
    node.submit(req("qsk.read")).expect("ok");
    node.submit(req("bio.synthesize")).expect("denied");
    let _ = node.submit(req("qsk.write"));
    let _ = node.submit(req("nav.fly"));
    node.transition(LifecycleState::Paused).expect("pause");

    let snapshot = node.snapshot();
    let replayed = Node::replay(snapshot.clone(), handlers()).expect("replay");
    assert_eq!(replayed.snapshot(), snapshot);
}

#[test]
fn snapshot_survives_json() {
    let mut node = running_node();
    node.submit(req("qsk.read")).expect("ok");
    node.submit(req("bio.synthesize")).expect("denied");

    let snapshot = node.snapshot();
    let json = serde_json::to_string(&snapshot).expect("serialize");
    let back: NodeSnapshot = serde_json::from_str(&json).expect("deserialize");
    assert_eq!(back, snapshot);

    let replayed = Node::replay(back, HandlerRegistry::new()).expect("replay");
    assert_eq!(replayed.snapshot(), snapshot);
}

#[test]
fn replayed_node_continues_the_same_run() {
    let mut original = running_node();
    original.submit(req("qsk.read")).expect("ok");

    let mut replayed = Node::replay(original.snapshot(), handlers()).expect("replay");
    original.submit(req("qsk.read")).expect("ok");
    replayed.submit(req("qsk.read")).expect("ok");
    assert_eq!(replayed.snapshot(), original.snapshot());
}

#[test]
fn replayed_node_rejects_reused_query_ids() {
    let mut node = running_node();
    node.submit(req("qsk.read").with_query_id("once")).expect("ok");
    let mut replayed = Node::replay(node.snapshot(), handlers()).expect("replay");
    assert!(matches!(
        replayed.submit(req("qsk.read").with_query_id("once")),
        Err(KernelError::DuplicateQueryId { .. })
    ));
}

#[test]
fn replay_rejects_tampered_audit() {
    let mut node = running_node();
    node.submit(req("qsk.read")).expect("ok");
    let mut snapshot = node.snapshot();
    snapshot.audit[0].data["capability"] = json!("qsk.admin");
    assert!(matches!(
        Node::replay(snapshot, handlers()),
        Err(KernelError::ChainVerification(_))
    ));
}

#[test]
fn replay_rejects_inconsistent_lifecycle() {
    let node = running_node();
    let mut json = serde_json::to_value(node.snapshot()).expect("to value");
    json["lifecycle"]["state"] = json!("shutdown");
    let snapshot: NodeSnapshot = serde_json::from_value(json).expect("from value");
    assert!(matches!(
        Node::replay(snapshot, handlers()),
        Err(KernelError::Snapshot { .. })
    ));
}

#[test]
fn replay_rejects_health_counters_that_disagree() {
    let mut node = running_node();
    node.submit(req("qsk.read")).expect("ok");
    let mut snapshot = node.snapshot();
    snapshot.health.counters.insert("*:completed".to_owned(), 5);
    assert!(matches!(
        Node::replay(snapshot, handlers()),
        Err(KernelError::Snapshot { .. })
    ));
}

#[test]
fn bootstrap_rejects_thresholds_that_cannot_alert() {
    let info = AlertThreshold {
        name: "noise".to_owned(),
        counter: "*:completed".to_owned(),
        threshold: 0,
        severity: Severity::Info,
    };
    assert!(matches!(
        Node::bootstrap(identity(), policy(), vec![info], KernelSettings::default()),
        Err(KernelError::Health(HealthError::InvalidThreshold { .. }))
    ));
}

#[test]
fn replay_rejects_invalid_thresholds() {
    let mut node = running_node();
    node.submit(req("qsk.read")).expect("ok");
    let mut snapshot = node.snapshot();
    let dup = AlertThreshold {
        name: "d".to_owned(),
        counter: "*:denied".to_owned(),
        threshold: 1,
        severity: Severity::Warning,
    };
    snapshot.thresholds = vec![dup.clone(), dup];
    assert!(matches!(
        Node::replay(snapshot, handlers()),
        Err(KernelError::Health(HealthError::DuplicateName { .. }))
    ));
}

#[test]
fn replay_rejects_health_totals_that_disagree() {
    let mut node = running_node();
    node.submit(req("qsk.read")).expect("ok");
    let mut snapshot = node.snapshot();
    snapshot.health.totals.insert(Outcome::Completed, 5);
    assert!(matches!(
        Node::replay(snapshot, handlers()),
        Err(KernelError::Snapshot { .. })
    ));
}

#[test]
fn audit_mirror_receives_every_entry() {
    let buf = SharedBuf::default();
    let mut node = running_node().with_audit_mirror(Box::new(buf.clone()));
    node.submit(req("qsk.read")).expect("ok");
    node.submit(req("bio.synthesize")).expect("denied");

    let mirrored = AuditLog::from_jsonl(&buf.contents()).expect("decode");
    assert_eq!(mirrored.entries(), node.audit().entries());
    assert!(mirrored.verify_chain());
}

#[test]
fn bootstrap_rejects_invalid_policy() {
    let bad = PolicySet::new(vec![Rule::allow("qsk.*").expect("rule").with_budget(1, 0)]);
    assert!(matches!(
        Node::bootstrap(identity(), bad, Vec::new(), KernelSettings::default()),
        Err(KernelError::Policy(_))
    ));
}

#[test]
fn shared_node_serialises_concurrent_submits() {
    let shared = SharedNode::new(running_node());
    let workers: Vec<_> = (0..4)
        .map(|w| {
            let node = shared.clone();
            thread::spawn(move || {
                for i in 0..25 {
                    let request = req("qsk.read").with_query_id(format!("w{w}-{i}"));
                    node.submit(request).expect("ok");
                }
            })
        })
        .collect();
    for w in workers {
        w.join().expect("worker");
    }

    let snapshot = shared.snapshot();
    assert_eq!(snapshot.audit.len(), 100);
    assert!(nodekernel::kernel::audit::verify_chain(&snapshot.audit));
    assert_eq!(snapshot.sequence, 100);
    shared.with(|node| assert_eq!(node.health().counter("*:completed"), 100));
}
