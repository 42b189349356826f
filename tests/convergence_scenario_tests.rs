//! Integration tests for the full convergence chain on a singleton machine.
//!
//! Exercises the canonical graph: a choice into a hold gate, a second
//! choice that branches between an attempt and an alternate terminal, and
//! an attempt that lands on its resolve state. Convergence happens as a
//! chain of micro-steps, one externally visible move per tick.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use serde::Serialize;
use tokio::time::timeout;

use stateseek::{
    ConvergenceDriver, DataPatch, Heartbeat, InternalData, SingleMachine, StateKey, StoreOptions,
    Template, TickOutcome,
};

/// Route engine tracing into the test harness; RUST_LOG selects verbosity.
fn init_test_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

const INITIAL: StateKey = StateKey("INITIAL");
const HOLD: StateKey = StateKey("HOLD");
const CHOICE2: StateKey = StateKey("CHOICE2");
const ATTEMPT: StateKey = StateKey("ATTEMPT");
const ALTERNATE: StateKey = StateKey("ALTERNATE");
const LANDING: StateKey = StateKey("LANDING");
const ERROR: StateKey = StateKey("ERROR");

#[derive(Debug, Clone, Default, Serialize)]
struct SessionInternal {
    error: Option<String>,
    documents_fetched: u32,
}

impl InternalData for SessionInternal {
    fn set_error(&mut self, error: String) {
        self.error = Some(error);
    }
}

#[derive(Debug, Clone, Default, Serialize, PartialEq)]
struct SessionPublic {
    phase: String,
}

/// Host context the hold gate reads; stands in for "is the link up".
#[derive(Debug, Default)]
struct SessionContext {
    link_up: AtomicBool,
}

fn session_template(fail_attempt: bool) -> Template<SessionInternal, SessionPublic, SessionContext> {
    Template::builder(
        "session",
        INITIAL,
        SessionInternal::default(),
        SessionPublic::default(),
    )
    .initial_desired([LANDING])
    .choice(INITIAL, [HOLD])
    .hold(
        HOLD,
        |_, _, ctx: &SessionContext| ctx.link_up.load(Ordering::SeqCst),
        CHOICE2,
    )
    .choice(CHOICE2, [ATTEMPT, ALTERNATE])
    .attempt(
        ATTEMPT,
        move |mut internal: SessionInternal, public: SessionPublic| async move {
            if fail_attempt {
                anyhow::bail!("document fetch refused")
            }
            internal.documents_fetched += 1;
            Ok(DataPatch::both(internal, public))
        },
        LANDING,
        ERROR,
    )
    .choice(ALTERNATE, [])
    .choice(LANDING, [])
    .choice(ERROR, [])
    .build()
    .expect("valid session template")
}

fn machine(fail_attempt: bool, link_up: bool) -> SingleMachine<SessionInternal, SessionPublic, SessionContext> {
    let context = SessionContext {
        link_up: AtomicBool::new(link_up),
    };
    SingleMachine::new(
        session_template(fail_attempt),
        context,
        Heartbeat::new(),
        StoreOptions::default(),
    )
}

#[tokio::test]
async fn four_ticks_converge_initial_to_landing() {
    init_test_logging();
    let machine = machine(false, true);

    // Tick 1: the initial choice advances toward the hold gate.
    assert!(matches!(machine.tick_once(), TickOutcome::Moved(HOLD)));
    assert_eq!(machine.snapshot().current_state, HOLD);

    // Tick 2: the gate is open, so the hold advances to the branch point.
    assert!(matches!(machine.tick_once(), TickOutcome::Moved(CHOICE2)));
    assert_eq!(machine.snapshot().current_state, CHOICE2);

    // Tick 3: the branch picks the attempt, the first hop of the shortest
    // route to LANDING.
    assert!(matches!(machine.tick_once(), TickOutcome::Moved(ATTEMPT)));
    assert_eq!(machine.snapshot().current_state, ATTEMPT);

    // Tick 4: the attempt launches; its settle lands on LANDING.
    let TickOutcome::Launched(handle) = machine.tick_once() else {
        panic!("fourth tick should launch the attempt action");
    };
    assert_eq!(
        machine.snapshot().in_progress,
        Some(ATTEMPT),
        "launch mark set while the action is in flight"
    );
    handle.await.expect("settle task completes");

    let snapshot = machine.snapshot();
    assert_eq!(snapshot.current_state, LANDING);
    assert!(snapshot.converged());
    assert!(snapshot.in_progress.is_none());
    assert_eq!(snapshot.internal.documents_fetched, 1);
}

#[tokio::test]
async fn closed_gate_parks_the_machine_at_the_hold() {
    let machine = machine(false, false);

    assert!(matches!(machine.tick_once(), TickOutcome::Moved(HOLD)));
    for _ in 0..5 {
        assert!(matches!(machine.tick_once(), TickOutcome::Holding));
    }
    assert_eq!(
        machine.snapshot().current_state,
        HOLD,
        "a false hold condition stalls indefinitely without error"
    );
}

#[tokio::test]
async fn failed_attempt_lands_on_error_with_the_rejection_recorded() {
    let machine = machine(true, true);

    let handle = loop {
        match machine.tick_once() {
            TickOutcome::Moved(_) => continue,
            TickOutcome::Launched(handle) => break handle,
            other => panic!("unexpected tick outcome {other:?}"),
        }
    };
    handle.await.expect("settle task completes");

    let snapshot = machine.snapshot();
    assert_eq!(snapshot.current_state, ERROR);
    assert!(snapshot.in_progress.is_none());
    assert_eq!(
        snapshot.internal.error.as_deref(),
        Some("document fetch refused")
    );
    assert!(
        !snapshot.converged(),
        "ERROR is a terminal sink, not a desired state"
    );
}

#[tokio::test]
async fn alternate_intent_routes_around_the_attempt() {
    let machine = machine(false, true);
    machine.set_intent(vec![ALTERNATE]);

    assert!(matches!(machine.tick_once(), TickOutcome::Moved(HOLD)));
    assert!(matches!(machine.tick_once(), TickOutcome::Moved(CHOICE2)));
    assert!(matches!(machine.tick_once(), TickOutcome::Moved(ALTERNATE)));
    assert!(machine.snapshot().converged());
}

#[tokio::test]
async fn heartbeat_driver_converges_the_machine_unattended() {
    init_test_logging();
    let heartbeat = Heartbeat::new();
    let machine = std::sync::Arc::new(SingleMachine::new(
        session_template(false),
        SessionContext {
            link_up: AtomicBool::new(true),
        },
        heartbeat.clone(),
        StoreOptions::default(),
    ));

    let mut driver = ConvergenceDriver::new(heartbeat.clone());
    driver.register(machine.clone());
    let task = tokio::spawn(driver.run());

    heartbeat.pulse();
    let arrival = timeout(Duration::from_secs(2), machine.on_enter(&[LANDING]))
        .await
        .expect("driver converges within the deadline")
        .expect("waiter resolves with an arrival");
    task.abort();

    assert_eq!(arrival.state, LANDING);
    assert_eq!(arrival.internal.documents_fetched, 1);
    assert!(machine.snapshot().converged());
}

#[tokio::test]
async fn public_reducers_and_selectors_touch_only_the_public_half() {
    let machine = machine(false, true);

    machine.update_public(|public| public.phase = "connecting".to_string());
    let phase = machine.read_public(|public| public.phase.clone());
    assert_eq!(phase, "connecting");

    let snapshot = machine.snapshot();
    assert_eq!(snapshot.public.phase, "connecting");
    assert_eq!(
        snapshot.internal.documents_fetched, 0,
        "reducer had no path to the internal half"
    );
}

#[tokio::test]
async fn status_report_reflects_convergence() {
    let machine = machine(false, true);
    let before = machine.status_report();
    assert_eq!(before.instances, 1);
    assert_eq!(before.converged, 0);

    let handle = loop {
        match machine.tick_once() {
            TickOutcome::Moved(_) => continue,
            TickOutcome::Launched(handle) => break handle,
            other => panic!("unexpected tick outcome {other:?}"),
        }
    };
    handle.await.expect("settle task completes");

    let after = machine.status_report();
    assert_eq!(after.converged, 1);
    assert_eq!(after.in_flight, 0);
}
