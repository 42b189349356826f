//! The step engine: one scheduling tick for one machine instance.
//!
//! A tick does at most one unit of externally visible work. Everything in a
//! tick is synchronous except the attempt settle, which runs on a spawned
//! task; between launch and settle the instance's `in_progress` mark makes
//! it opaque to further ticks for that state. The engine never panics and
//! never returns an error from a tick: every failure is captured and turned
//! into a state transition.

use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::instance::{DataPatch, InternalData, PublicData, Snapshot};
use crate::planner::plan;
use crate::template::{Node, StateKey, Template};

/// How a state change manipulates the instance's in-flight marker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InProgressMark {
    /// Leave the marker as it is.
    Keep,
    /// Mark this attempt state as launched.
    Set(StateKey),
    /// Clear the marker (an attempt settled).
    Clear,
}

/// One described mutation of an instance record, dispatched through
/// [`StepEffects::change_state`].
#[derive(Debug)]
pub struct StateChange<I, P> {
    pub to: StateKey,
    pub in_progress: InProgressMark,
    pub patch: Option<DataPatch<I, P>>,
}

impl<I, P> StateChange<I, P> {
    pub fn to(state: StateKey) -> Self {
        Self {
            to: state,
            in_progress: InProgressMark::Keep,
            patch: None,
        }
    }

    pub fn launch(state: StateKey) -> Self {
        Self {
            to: state,
            in_progress: InProgressMark::Set(state),
            patch: None,
        }
    }

    pub fn settle(to: StateKey, patch: DataPatch<I, P>) -> Self {
        Self {
            to,
            in_progress: InProgressMark::Clear,
            patch: Some(patch),
        }
    }
}

/// The callback hooks a tick dispatches through.
///
/// Implemented by the instance-store adapters (and by recording mocks in
/// tests); the engine itself never touches shared state directly.
pub trait StepEffects<I, P>: Send + Sync {
    fn change_state(&self, change: StateChange<I, P>);
    fn change_intent(&self, new_intent: Vec<StateKey>);
    /// Request one reschedule pass.
    fn pulse(&self);
}

/// What one tick did, for logs, iteration summaries, and tests.
#[derive(Debug)]
pub enum TickOutcome {
    /// Current state is already one of the desired states.
    Converged,
    /// No route from here to any desired state; the instance idles.
    Stuck,
    /// Parked on a hold whose condition is false.
    Holding,
    /// An attempt for this state is already in flight; the tick was a no-op.
    InFlight,
    /// Moved one edge along the planned route.
    Moved(StateKey),
    /// A redirect fired: intent swapped, and possibly one move.
    Redirected { moved: Option<StateKey> },
    /// An attempt action was launched; the handle settles it.
    Launched(JoinHandle<()>),
}

/// Shared steps 2-3 of the tick for every node type except redirect: the
/// convergence check and the route guard.
fn next_hop<I, P, C>(
    snapshot: &Snapshot<I, P>,
    template: &Template<I, P, C>,
) -> Result<StateKey, TickOutcome>
where
    I: InternalData,
    P: PublicData,
{
    if snapshot.converged() {
        return Err(TickOutcome::Converged);
    }
    let route = plan(snapshot.current_state, &snapshot.desired_states, template);
    match route.first() {
        Some(&next) => Ok(next),
        None => {
            debug!(
                machine = %template.name(),
                state = %snapshot.current_state,
                desired = ?snapshot.desired_states,
                "no route to any desired state, instance idles"
            );
            Err(TickOutcome::Stuck)
        }
    }
}

/// Turn a panicked (or aborted) action task into the rejection value routed
/// to the attempt's reject state.
fn panic_rejection(error: tokio::task::JoinError) -> anyhow::Error {
    match error.try_into_panic() {
        Ok(payload) => {
            let message = payload
                .downcast_ref::<&str>()
                .map(|message| (*message).to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "non-string panic payload".to_string());
            anyhow::anyhow!("attempt action panicked: {message}")
        }
        Err(error) => anyhow::anyhow!("attempt action aborted: {error}"),
    }
}

/// Run one tick for one instance.
///
/// `ctx` is the host context hold conditions are evaluated against. The
/// dispatch order follows the node type:
///
/// 1. Redirect: swap intent unconditionally (even when converged), then
///    move toward the redirect's own choices if any is reachable.
/// 2. Already converged: no dispatch.
/// 3. No route to any desired state: no dispatch (a legal stuck).
/// 4. Choice: move to the first planned hop, pulse.
/// 5. Hold: move only when the condition is true; otherwise stall.
/// 6. Attempt: launch the action once (the in-flight mark guards against a
///    second launch) and settle to the node's declared resolve or reject
///    state. The plan only establishes that a route exists before starting
///    expensive work; it never picks the successor.
pub fn tick<I, P, C>(
    template: &Template<I, P, C>,
    snapshot: &Snapshot<I, P>,
    effects: &Arc<dyn StepEffects<I, P>>,
    ctx: &C,
) -> TickOutcome
where
    I: InternalData,
    P: PublicData,
{
    let current = snapshot.current_state;
    let Some(node) = template.node(current) else {
        // Unreachable for validated templates.
        warn!(machine = %template.name(), state = %current, "tick on unknown state");
        return TickOutcome::Stuck;
    };

    match node {
        Node::Redirect { new_intent, choices } => {
            info!(
                machine = %template.name(),
                state = %current,
                new_intent = ?new_intent,
                "redirect fired, replacing intent"
            );
            effects.change_intent(new_intent.clone());
            let route = plan(current, choices, template);
            match route.first() {
                Some(&next) => {
                    effects.change_state(StateChange::to(next));
                    effects.pulse();
                    TickOutcome::Redirected { moved: Some(next) }
                }
                None => TickOutcome::Redirected { moved: None },
            }
        }
        Node::Choice { .. } => match next_hop(snapshot, template) {
            Err(outcome) => outcome,
            Ok(next) => {
                effects.change_state(StateChange::to(next));
                effects.pulse();
                TickOutcome::Moved(next)
            }
        },
        Node::Hold { condition, .. } => match next_hop(snapshot, template) {
            Err(outcome) => outcome,
            Ok(next) => {
                if !condition(&snapshot.internal, &snapshot.public, ctx) {
                    TickOutcome::Holding
                } else {
                    effects.change_state(StateChange::to(next));
                    effects.pulse();
                    TickOutcome::Moved(next)
                }
            }
        },
        Node::Attempt {
            action,
            resolve,
            reject,
        } => match next_hop(snapshot, template) {
            Err(outcome) => outcome,
            Ok(_) => {
                if snapshot.in_progress == Some(current) {
                    return TickOutcome::InFlight;
                }

                // Mark the launch before the action runs; no pulse here,
                // the settle dispatches the one pulse for this attempt.
                effects.change_state(StateChange::launch(current));

                let action = Arc::clone(action);
                let effects = Arc::clone(effects);
                let internal = snapshot.internal.clone();
                let public = snapshot.public.clone();
                let error_base = internal.clone();
                let (resolve, reject) = (*resolve, *reject);
                let family = template.name().to_string();

                let handle = tokio::spawn(async move {
                    // The action runs on its own task so a panic inside it
                    // surfaces here as a JoinError instead of killing the
                    // settle; a panicking action settles like a rejection.
                    let run = tokio::spawn(async move { action.run(internal, public).await });
                    let settled = match run.await {
                        Ok(settled) => settled,
                        Err(join_error) => Err(panic_rejection(join_error)),
                    };
                    match settled {
                        Ok(patch) => {
                            debug!(
                                machine = %family,
                                state = %current,
                                to = %resolve,
                                "attempt resolved"
                            );
                            effects.change_state(StateChange::settle(resolve, patch));
                            effects.pulse();
                        }
                        Err(error) => {
                            warn!(
                                machine = %family,
                                state = %current,
                                to = %reject,
                                error = %error,
                                "attempt rejected"
                            );
                            let mut internal = error_base;
                            internal.set_error(error.to_string());
                            effects
                                .change_state(StateChange::settle(reject, DataPatch::internal(internal)));
                            effects.pulse();
                        }
                    }
                });
                TickOutcome::Launched(handle)
            }
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Serialize;
    use std::sync::Mutex;

    const INITIAL: StateKey = StateKey("INITIAL");
    const GATE: StateKey = StateKey("GATE");
    const FETCH: StateKey = StateKey("FETCH");
    const LANDING: StateKey = StateKey("LANDING");
    const ERROR: StateKey = StateKey("ERROR");
    const DETOUR: StateKey = StateKey("DETOUR");
    const ISLAND: StateKey = StateKey("ISLAND");

    #[derive(Debug, Clone, Default, Serialize, PartialEq)]
    struct TestInternal {
        error: Option<String>,
        fetched: u32,
    }

    impl InternalData for TestInternal {
        fn set_error(&mut self, error: String) {
            self.error = Some(error);
        }
    }

    #[derive(Debug, Clone, Default)]
    struct TestContext {
        gate_open: bool,
    }

    type TestTemplate = Template<TestInternal, (), TestContext>;

    /// Recording effects sink; stores every dispatch for assertion.
    #[derive(Default)]
    struct RecordingEffects {
        dispatches: Mutex<Vec<Dispatch>>,
    }

    #[derive(Debug, Clone, PartialEq)]
    enum Dispatch {
        State {
            to: StateKey,
            in_progress: InProgressMark,
            internal: Option<TestInternal>,
        },
        Intent(Vec<StateKey>),
        Pulse,
    }

    impl RecordingEffects {
        fn arc() -> Arc<Self> {
            Arc::new(Self::default())
        }

        fn dispatches(&self) -> Vec<Dispatch> {
            self.dispatches.lock().unwrap().clone()
        }
    }

    impl StepEffects<TestInternal, ()> for RecordingEffects {
        fn change_state(&self, change: StateChange<TestInternal, ()>) {
            self.dispatches.lock().unwrap().push(Dispatch::State {
                to: change.to,
                in_progress: change.in_progress,
                internal: change.patch.and_then(|patch| patch.internal),
            });
        }

        fn change_intent(&self, new_intent: Vec<StateKey>) {
            self.dispatches
                .lock()
                .unwrap()
                .push(Dispatch::Intent(new_intent));
        }

        fn pulse(&self) {
            self.dispatches.lock().unwrap().push(Dispatch::Pulse);
        }
    }

    fn effects_of(recording: &Arc<RecordingEffects>) -> Arc<dyn StepEffects<TestInternal, ()>> {
        Arc::clone(recording) as Arc<dyn StepEffects<TestInternal, ()>>
    }

    /// INITIAL(choice) -> GATE(hold) -> FETCH(attempt) -> LANDING, with the
    /// attempt rejecting to ERROR and an unreachable ISLAND for stuck cases.
    fn scenario_template(fail_fetch: bool) -> TestTemplate {
        Template::builder("scenario", INITIAL, TestInternal::default(), ())
            .initial_desired([LANDING])
            .choice(INITIAL, [GATE])
            .hold(GATE, |_, _, ctx: &TestContext| ctx.gate_open, FETCH)
            .attempt(
                FETCH,
                move |mut internal: TestInternal, _: ()| async move {
                    if fail_fetch {
                        anyhow::bail!("fetch failed")
                    }
                    internal.fetched += 1;
                    Ok(DataPatch::internal(internal))
                },
                LANDING,
                ERROR,
            )
            .choice(LANDING, [])
            .choice(ERROR, [])
            .choice(ISLAND, [])
            .build()
            .expect("valid scenario template")
    }

    fn snapshot_at(current: StateKey, desired: &[StateKey]) -> Snapshot<TestInternal, ()> {
        Snapshot {
            current_state: current,
            desired_states: desired.to_vec(),
            in_progress: None,
            internal: TestInternal::default(),
            public: (),
        }
    }

    #[tokio::test]
    async fn converged_instance_dispatches_nothing() {
        let template = scenario_template(false);
        let recording = RecordingEffects::arc();
        let outcome = tick(
            &template,
            &snapshot_at(LANDING, &[LANDING]),
            &effects_of(&recording),
            &TestContext::default(),
        );
        assert!(matches!(outcome, TickOutcome::Converged));
        assert!(recording.dispatches().is_empty());
    }

    #[tokio::test]
    async fn unreachable_desired_state_is_a_silent_stuck() {
        let template = scenario_template(false);
        let recording = RecordingEffects::arc();
        let outcome = tick(
            &template,
            &snapshot_at(INITIAL, &[ISLAND]),
            &effects_of(&recording),
            &TestContext::default(),
        );
        assert!(matches!(outcome, TickOutcome::Stuck));
        assert!(recording.dispatches().is_empty());
    }

    #[tokio::test]
    async fn choice_moves_one_hop_and_pulses() {
        let template = scenario_template(false);
        let recording = RecordingEffects::arc();
        let outcome = tick(
            &template,
            &snapshot_at(INITIAL, &[LANDING]),
            &effects_of(&recording),
            &TestContext::default(),
        );
        assert!(matches!(outcome, TickOutcome::Moved(GATE)));
        assert_eq!(
            recording.dispatches(),
            vec![
                Dispatch::State {
                    to: GATE,
                    in_progress: InProgressMark::Keep,
                    internal: None,
                },
                Dispatch::Pulse,
            ]
        );
    }

    #[tokio::test]
    async fn hold_with_false_condition_stalls_silently() {
        let template = scenario_template(false);
        let recording = RecordingEffects::arc();
        let outcome = tick(
            &template,
            &snapshot_at(GATE, &[LANDING]),
            &effects_of(&recording),
            &TestContext { gate_open: false },
        );
        assert!(matches!(outcome, TickOutcome::Holding));
        assert!(recording.dispatches().is_empty());
    }

    #[tokio::test]
    async fn hold_with_true_condition_advances_to_next() {
        let template = scenario_template(false);
        let recording = RecordingEffects::arc();
        let outcome = tick(
            &template,
            &snapshot_at(GATE, &[LANDING]),
            &effects_of(&recording),
            &TestContext { gate_open: true },
        );
        assert!(matches!(outcome, TickOutcome::Moved(FETCH)));
        assert_eq!(
            recording.dispatches(),
            vec![
                Dispatch::State {
                    to: FETCH,
                    in_progress: InProgressMark::Keep,
                    internal: None,
                },
                Dispatch::Pulse,
            ]
        );
    }

    #[tokio::test]
    async fn attempt_in_flight_tick_is_a_noop() {
        let template = scenario_template(false);
        let recording = RecordingEffects::arc();
        let mut snapshot = snapshot_at(FETCH, &[LANDING]);
        snapshot.in_progress = Some(FETCH);
        let outcome = tick(
            &template,
            &snapshot,
            &effects_of(&recording),
            &TestContext::default(),
        );
        assert!(matches!(outcome, TickOutcome::InFlight));
        assert!(recording.dispatches().is_empty());
    }

    #[tokio::test]
    async fn attempt_success_routes_to_resolve_with_one_pulse() {
        let template = scenario_template(false);
        let recording = RecordingEffects::arc();
        let outcome = tick(
            &template,
            &snapshot_at(FETCH, &[LANDING]),
            &effects_of(&recording),
            &TestContext::default(),
        );
        let TickOutcome::Launched(handle) = outcome else {
            panic!("attempt tick should launch the action");
        };
        handle.await.expect("settle task completes");

        assert_eq!(
            recording.dispatches(),
            vec![
                Dispatch::State {
                    to: FETCH,
                    in_progress: InProgressMark::Set(FETCH),
                    internal: None,
                },
                Dispatch::State {
                    to: LANDING,
                    in_progress: InProgressMark::Clear,
                    internal: Some(TestInternal {
                        error: None,
                        fetched: 1,
                    }),
                },
                Dispatch::Pulse,
            ]
        );
    }

    #[tokio::test]
    async fn attempt_failure_routes_to_reject_with_error_recorded() {
        let template = scenario_template(true);
        let recording = RecordingEffects::arc();
        let outcome = tick(
            &template,
            &snapshot_at(FETCH, &[LANDING]),
            &effects_of(&recording),
            &TestContext::default(),
        );
        let TickOutcome::Launched(handle) = outcome else {
            panic!("attempt tick should launch the action");
        };
        handle.await.expect("settle task completes");

        assert_eq!(
            recording.dispatches(),
            vec![
                Dispatch::State {
                    to: FETCH,
                    in_progress: InProgressMark::Set(FETCH),
                    internal: None,
                },
                Dispatch::State {
                    to: ERROR,
                    in_progress: InProgressMark::Clear,
                    internal: Some(TestInternal {
                        error: Some("fetch failed".to_string()),
                        fetched: 0,
                    }),
                },
                Dispatch::Pulse,
            ]
        );
    }

    #[tokio::test]
    async fn panicking_action_settles_to_reject_like_a_rejection() {
        let template: TestTemplate =
            Template::builder("scenario", FETCH, TestInternal::default(), ())
                .initial_desired([LANDING])
                .attempt(
                    FETCH,
                    |_: TestInternal, _: ()| async { panic!("fetch blew up") },
                    LANDING,
                    ERROR,
                )
                .choice(LANDING, [])
                .choice(ERROR, [])
                .build()
                .expect("valid panic template");
        let recording = RecordingEffects::arc();
        let outcome = tick(
            &template,
            &snapshot_at(FETCH, &[LANDING]),
            &effects_of(&recording),
            &TestContext::default(),
        );
        let TickOutcome::Launched(handle) = outcome else {
            panic!("attempt tick should launch the action");
        };
        // The settle task must outlive the panicking action and route it
        // like a rejection: the instance never stays in-flight forever.
        handle.await.expect("settle task survives the panic");

        let dispatches = recording.dispatches();
        assert_eq!(dispatches.len(), 3, "launch mark, reject settle, one pulse");
        let Dispatch::State {
            to,
            in_progress,
            internal,
        } = &dispatches[1]
        else {
            panic!("second dispatch should settle the attempt");
        };
        assert_eq!(*to, ERROR);
        assert_eq!(*in_progress, InProgressMark::Clear);
        let error = internal
            .as_ref()
            .and_then(|internal| internal.error.as_deref())
            .expect("panic recorded as the rejection error");
        assert!(error.contains("panicked"), "got: {error}");
        assert!(error.contains("fetch blew up"), "got: {error}");
        assert_eq!(dispatches[2], Dispatch::Pulse);
    }

    #[tokio::test]
    async fn redirect_fires_even_when_converged() {
        let template: TestTemplate =
            Template::builder("redirect", DETOUR, TestInternal::default(), ())
                .initial_desired([DETOUR])
                .redirect(DETOUR, [LANDING], [FETCH])
                .choice(FETCH, [LANDING])
                .choice(LANDING, [])
                .build()
                .unwrap();

        let recording = RecordingEffects::arc();
        let outcome = tick(
            &template,
            &snapshot_at(DETOUR, &[DETOUR]),
            &effects_of(&recording),
            &TestContext::default(),
        );
        assert!(matches!(
            outcome,
            TickOutcome::Redirected { moved: Some(FETCH) }
        ));
        assert_eq!(
            recording.dispatches(),
            vec![
                Dispatch::Intent(vec![LANDING]),
                Dispatch::State {
                    to: FETCH,
                    in_progress: InProgressMark::Keep,
                    internal: None,
                },
                Dispatch::Pulse,
            ]
        );
    }

    #[tokio::test]
    async fn redirect_with_no_reachable_choice_still_swaps_intent() {
        // A redirect's planner edges are its own choices, so an empty
        // choice list is the "no route" case.
        let template: TestTemplate =
            Template::builder("redirect-stuck", DETOUR, TestInternal::default(), ())
                .redirect(DETOUR, [LANDING], [])
                .choice(LANDING, [])
                .build()
                .unwrap();

        let recording = RecordingEffects::arc();
        let outcome = tick(
            &template,
            &snapshot_at(DETOUR, &[LANDING]),
            &effects_of(&recording),
            &TestContext::default(),
        );
        assert!(matches!(outcome, TickOutcome::Redirected { moved: None }));
        assert_eq!(
            recording.dispatches(),
            vec![Dispatch::Intent(vec![LANDING])],
            "intent swap stands, but no move and no pulse"
        );
    }
}
