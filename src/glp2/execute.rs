//! Test execution state machines.
//!
//! Two mutually exclusive strategies drive a bound program on the tester:
//!
//! - **Per-step mode** runs reset-check, set-program, start-test,
//!   poll-actual-values and finalize once per enabled step.
//! - **All-in-one mode** submits the entire enabled step list as one compound
//!   program and demultiplexes interim responses by step number back to the
//!   right progress slot. Step boundaries trigger per-kind setup (programming
//!   sub-flow, visual-check wait, timed wait, lamp monitoring), and a
//!   "nearly completed" event (one second remaining) runs the
//!   fluorescent-lamp minimum-illumination check before a step may pass.
//!
//! The executor never owns run state: all progress and state changes flow
//! through the [`TestHost`] update contract back into the orchestrator.

use super::response::{ActualValues, FaultStatus, Glp2Response, InterimActualValues};
use super::steps::TestStepSpec;
use super::{TesterLink, TesterManager, UNEXPECTED_RESPONSE};
use crate::broker::{cancel_pair, Broker, CancelHandle, CancelToken, Subscription};
use crate::error::RunError;
use crate::program::{Program, ProgramStep, StepKind, VisStep, WaitKind, WaitStep};
use crate::run::{StepProgressUpdate, StepStatus, WaitingReason};
use crate::services::{LampStateSource, ProgressFn};
use crate::settings::Settings;
use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::stream::{FuturesUnordered, StreamExt};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;

/// Number of fluorescent-lamp inputs wired to the station.
pub const FL_LAMP_COUNT: usize = 2;

/// Device-programming backend selected for `program` steps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgramBackend {
    /// Serial lighting-driver programmer.
    Sol,
    /// Generic serial/parallel device programmer.
    Generic,
    /// Remote provisioning backend.
    Gprs,
}

/// Update contract between the execution engine and the orchestrator.
///
/// The engine borrows step descriptions and writes progress back through
/// these methods; it never owns run state.
#[async_trait]
pub trait TestHost: Sync {
    fn settings(&self) -> &Settings;
    fn broker(&self) -> &Broker;
    fn cancel_token(&self) -> CancelToken;
    /// Cancel the whole run (tripping the token and publishing
    /// `programmer.cancelled`). Idempotent.
    fn request_cancel(&self);
    fn bound_program(&self) -> Option<Program>;
    fn waiting_for_continue(&self) -> Option<WaitingReason>;
    fn log(&self, text: &str, params: Value);
    fn change_state(&self, changes: Value);
    fn update_step_progress(&self, index: usize, update: StepProgressUpdate);
    fn lamp_source(&self) -> Arc<dyn LampStateSource>;
    /// Merge a device-interaction transcript into the run output.
    fn append_output(&self, lines: Vec<String>);
    /// Block until the operator clears the given waiting reason. The waiting
    /// state is cleared on every return path.
    async fn wait_for_continue(&self, reason: WaitingReason) -> Result<(), RunError>;
    async fn run_programming_backend(
        &self,
        backend: ProgramBackend,
        progress: ProgressFn<'_>,
    ) -> Result<(), RunError>;
}

/// Program and electrically test the device under test on the GLP2 tester.
pub async fn program_and_test<H: TestHost, L: TesterLink>(
    host: &H,
    manager: &mut TesterManager<L>,
    backend: Option<ProgramBackend>,
) -> Result<(), RunError> {
    let program = host
        .bound_program()
        .ok_or_else(|| RunError::code("GLP2:PROGRAM_NOT_RECOGNIZED"))?;

    host.log("TESTING_STARTED", json!({"program": program.name}));

    if !host.settings().supports_feature("glp2") {
        return Err(RunError::code("GLP2:FEATURE_DISABLED"));
    }

    let has_lamp_check = program.steps.iter().any(|step| {
        matches!(step, ProgramStep::Fn(fct) if fct.enabled && fct.lamp_count > 0)
    });
    if has_lamp_check && !host.settings().supports_feature("fl") {
        return Err(RunError::code("FL:FEATURE_DISABLED"));
    }

    let result = run_program(host, manager, &program, backend).await;

    let output = manager.take_output();
    if !output.is_empty() {
        host.append_output(output);
    }

    result
}

async fn run_program<H: TestHost, L: TesterLink>(
    host: &H,
    manager: &mut TesterManager<L>,
    program: &Program,
    backend: Option<ProgramBackend>,
) -> Result<(), RunError> {
    let cancel = host.cancel_token();
    if cancel.is_cancelled() {
        return Err(RunError::cancelled());
    }

    host.log("GLP2:RESETTING_TESTER", json!({}));
    manager
        .reset()
        .await
        .map_err(|err| RunError::with_message("GLP2:RESETTING_TESTER_FAILURE", err.to_string()))?;

    if cancel.is_cancelled() {
        return Err(RunError::cancelled());
    }
    if !manager.is_ready() {
        return Err(RunError::code("GLP2:TESTER_NOT_READY"));
    }

    if host.settings().glp2_all_in_one {
        return execute_aio(host, manager, program, backend).await;
    }

    let mut attempts = 0u32;
    for (index, step) in program.enabled_steps() {
        if cancel.is_cancelled() {
            return Err(RunError::cancelled());
        }

        let result =
            execute_enabled_step(host, manager, program, backend, &mut attempts, step, index).await;

        match result {
            Ok(()) => {
                host.update_step_progress(
                    index,
                    StepProgressUpdate::status(StepStatus::Success).with_progress(100.0),
                );
            }
            Err(err) => {
                host.update_step_progress(index, StepProgressUpdate::status(StepStatus::Failure));
                if cancel.is_cancelled() {
                    return Err(RunError::cancelled());
                }
                return Err(err);
            }
        }
    }

    Ok(())
}

fn interim_progress(time_ms: u64, total: Duration) -> f64 {
    let total_ms = total.as_millis() as f64;
    if total_ms <= 0.0 {
        100.0
    } else {
        (time_ms as f64 / total_ms * 100.0).round()
    }
}

/// Classify a final actual-values response for the given progress slot.
fn classify_final<H: TestHost>(
    host: &H,
    step_index: usize,
    response: &ActualValues,
) -> Result<(), RunError> {
    let fail = || {
        host.update_step_progress(step_index, StepProgressUpdate::status(StepStatus::Failure));
    };

    if host.cancel_token().is_cancelled() {
        fail();
        return Err(RunError::code(FaultStatus::Cancelled.error_code()));
    }

    if let Some(fault) = response.fault_status {
        fail();
        return Err(RunError::code(FaultStatus::Code(fault).error_code()));
    }

    let Some(result) = response.steps.first() else {
        if response.completed {
            // No test results and completed: the operator cancelled the test
            // on the instrument's own panel.
            fail();
            return Err(RunError::code(FaultStatus::Cancelled.error_code()));
        }
        return Ok(());
    };

    if result.evaluation {
        host.update_step_progress(
            step_index,
            StepProgressUpdate::status(StepStatus::Success).with_progress(100.0),
        );
        return Ok(());
    }

    fail();

    let (Some(set1), Some(actual1)) = (result.set_value, result.actual_value) else {
        return Err(RunError::code("GLP2:TEST_STEP_FAILURE"));
    };

    host.log(
        "GLP2:TEST_STEP_FAILURE",
        json!({
            "setValue": set1,
            "actualValue": actual1,
            "setValue2": result.set_value2,
            "actualValue2": result.actual_value2,
        }),
    );

    Err(RunError::with_message(
        "GLP2:TEST_STEP_FAILURE",
        format!(
            "Expected set value 1: `{}`, got actual value 1: `{}`. Expected set value 2: `{:?}`, got actual value 2: `{:?}`.",
            set1, actual1, result.set_value2, result.actual_value2
        ),
    ))
}

/// Drain stale actual-value responses left over from a previous test.
async fn empty_actual_values<H: TestHost, L: TesterLink>(
    host: &H,
    manager: &mut TesterManager<L>,
) -> Result<(), RunError> {
    loop {
        if host.cancel_token().is_cancelled() {
            return Err(RunError::cancelled());
        }
        if manager.get_actual_values().await?.is_none() {
            return Ok(());
        }
    }
}

/// Start the test. The very first start of a run waits for the operator
/// unless the step autostarts (visual checks).
async fn gated_start<H: TestHost, L: TesterLink>(
    host: &H,
    manager: &mut TesterManager<L>,
    autostart: bool,
    attempts: &mut u32,
) -> Result<(), RunError> {
    *attempts += 1;
    if !autostart && *attempts == 1 {
        host.wait_for_continue(WaitingReason::Glp2).await?;
    }
    manager.start_test().await
}

/// Broker-backed flag flipping once `waitingForContinue` is cleared.
struct ContinueFlag {
    flag: Arc<AtomicBool>,
    sub: Subscription,
}

impl ContinueFlag {
    fn watch(broker: &Broker) -> Self {
        let flag = Arc::new(AtomicBool::new(false));
        let flipped = Arc::clone(&flag);
        let sub = broker
            .subscribe("programmer.stateChanged")
            .set_filter(|changes| matches!(changes.get("waitingForContinue"), Some(Value::Null)))
            .on_message(move |_| flipped.store(true, Ordering::SeqCst));
        Self { flag, sub }
    }

    fn cleared(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

impl Drop for ContinueFlag {
    fn drop(&mut self) {
        self.sub.cancel();
    }
}

/// Fluorescent-lamp monitor: polls the external lamp state resources at
/// ~30 ms intervals and tracks the longest continuous on-time per lamp.
struct LampWatch {
    durations: Arc<Mutex<Vec<u64>>>,
    near_completed: Arc<AtomicBool>,
    evaluated: bool,
    lamp_count: u32,
    required_secs: f64,
    stop: CancelHandle,
    sub: Subscription,
    task: tokio::task::JoinHandle<()>,
}

impl LampWatch {
    fn start<H: TestHost>(host: &H, lamp_count: u32, required_secs: f64) -> Self {
        host.log("FL:MONITORING", json!({"count": lamp_count}));

        let durations = Arc::new(Mutex::new(vec![0u64; FL_LAMP_COUNT]));
        let (stop, stop_token) = cancel_pair();
        let source = host.lamp_source();
        let resources = host.settings().fl_resources.clone();
        let tracked = Arc::clone(&durations);

        let task = tokio::spawn(async move {
            let mut on_at: Vec<Option<Instant>> = vec![None; FL_LAMP_COUNT];
            let mut interval = tokio::time::interval(Duration::from_millis(33));
            loop {
                tokio::select! {
                    _ = stop_token.cancelled() => return,
                    _ = interval.tick() => {}
                }

                for lamp in 0..FL_LAMP_COUNT {
                    let Some(resource) = resources.get(lamp).filter(|r| !r.is_empty()) else {
                        continue;
                    };
                    let Some(state) = source.read(resource).await else {
                        continue;
                    };

                    let now = Instant::now();
                    match on_at[lamp] {
                        None => {
                            if state {
                                on_at[lamp] = Some(now);
                            }
                        }
                        Some(since) => {
                            let on_for = now.duration_since(since).as_millis() as u64;
                            let mut durations = tracked.lock().unwrap();
                            if on_for > durations[lamp] {
                                durations[lamp] = on_for;
                            }
                            if !state {
                                on_at[lamp] = None;
                            }
                        }
                    }
                }
            }
        });

        let near_completed = Arc::new(AtomicBool::new(false));
        let seen = Arc::clone(&near_completed);
        let sub = host
            .broker()
            .subscribe("programmer.glp2.stepNearlyCompleted")
            .set_limit(1)
            .on_message(move |_| seen.store(true, Ordering::SeqCst));

        Self {
            durations,
            near_completed,
            evaluated: false,
            lamp_count,
            required_secs,
            stop,
            sub,
            task,
        }
    }

    /// Once the step is nearly completed, verify every required lamp reached
    /// the minimum cumulative illumination duration.
    fn check<H: TestHost>(&mut self, host: &H) -> Result<(), RunError> {
        if self.evaluated || !self.near_completed.load(Ordering::SeqCst) {
            return Ok(());
        }
        self.evaluated = true;

        if self.lamp_count == 0 || self.required_secs <= 0.0 {
            return Ok(());
        }

        let durations = self.durations.lock().unwrap().clone();
        let mut valid = 0u32;
        for (lamp, duration_ms) in durations.iter().enumerate() {
            if *duration_ms as f64 / 1000.0 >= self.required_secs {
                valid += 1;
            }
            host.log(
                "FL:LIGHTING_TIME",
                json!({"no": lamp + 1, "duration": duration_ms}),
            );
        }

        if valid == self.lamp_count {
            Ok(())
        } else {
            Err(RunError::code("FL:LIGHTING_TIME_TOO_SHORT"))
        }
    }
}

impl Drop for LampWatch {
    fn drop(&mut self) {
        self.stop.cancel();
        self.sub.cancel();
        self.task.abort();
    }
}

// =============================================================================
// Per-step mode
// =============================================================================

async fn execute_enabled_step<H: TestHost, L: TesterLink>(
    host: &H,
    manager: &mut TesterManager<L>,
    program: &Program,
    backend: Option<ProgramBackend>,
    attempts: &mut u32,
    step: &ProgramStep,
    index: usize,
) -> Result<(), RunError> {
    match step {
        ProgramStep::Wait(wait) => execute_wait_step(host, wait, index).await,
        ProgramStep::Program(_) => {
            execute_programming_step(host, manager, program, backend, attempts, step, index).await
        }
        _ => execute_test_step(host, manager, program, attempts, step, index).await,
    }
}

async fn execute_wait_step<H: TestHost>(
    host: &H,
    wait: &WaitStep,
    index: usize,
) -> Result<(), RunError> {
    host.log(
        "TESTING_EXECUTING_STEP",
        json!({"type": "wait", "index": index}),
    );

    match wait.kind {
        WaitKind::Auto => {
            host.update_step_progress(index, StepProgressUpdate::active().with_value(-1.0));

            let cancel = host.cancel_token();
            let total = Duration::from_secs_f64(wait.duration);
            let started = Instant::now();
            let mut ticker = tokio::time::interval(Duration::from_millis(250));

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return Err(RunError::cancelled()),
                    _ = ticker.tick() => {}
                }

                let elapsed = started.elapsed();
                host.update_step_progress(
                    index,
                    StepProgressUpdate::default()
                        .with_progress(elapsed.as_secs_f64() / total.as_secs_f64() * 100.0),
                );
                if elapsed >= total {
                    return Ok(());
                }
            }
        }
        WaitKind::Manual => {
            host.update_step_progress(
                index,
                StepProgressUpdate::active().with_progress(50.0).with_value(-1.0),
            );
            host.wait_for_continue(WaitingReason::Test).await
        }
    }
}

async fn execute_programming_step<H: TestHost, L: TesterLink>(
    host: &H,
    manager: &mut TesterManager<L>,
    program: &Program,
    backend: Option<ProgramBackend>,
    attempts: &mut u32,
    step: &ProgramStep,
    index: usize,
) -> Result<(), RunError> {
    let Some(backend) = backend else {
        host.log("TESTING_SKIPPING_PROGRAMMING", json!({}));
        return Ok(());
    };

    host.log(
        "TESTING_EXECUTING_STEP",
        json!({"type": "program", "index": index}),
    );
    host.update_step_progress(index, StepProgressUpdate::active().with_value(-1.0));

    let ProgramStep::Program(programming) = step else {
        return Err(RunError::code(UNEXPECTED_RESPONSE));
    };
    let spec = TestStepSpec::programming_window(programming, 60.0);

    empty_actual_values(host, manager).await?;
    manager.set_test_program(&program.name, &[spec]).await?;
    gated_start(host, manager, false, attempts).await?;

    let cancel = host.cancel_token();
    let delay = Duration::from_millis(host.settings().glp2_programming_delay_ms);
    if !delay.is_zero() {
        tokio::select! {
            _ = cancel.cancelled() => return Err(RunError::cancelled()),
            _ = tokio::time::sleep(delay) => {}
        }
    }

    let progress = |percent: f64| {
        host.update_step_progress(index, StepProgressUpdate::default().with_progress(percent));
    };
    host.run_programming_backend(backend, &progress).await?;

    // Clear the programming window off the tester before the next step.
    manager.reset().await
}

async fn execute_test_step<H: TestHost, L: TesterLink>(
    host: &H,
    manager: &mut TesterManager<L>,
    program: &Program,
    attempts: &mut u32,
    step: &ProgramStep,
    index: usize,
) -> Result<(), RunError> {
    host.log(
        "TESTING_EXECUTING_STEP",
        json!({"type": step.kind().as_str(), "index": index}),
    );
    host.update_step_progress(index, StepProgressUpdate::active());

    let spec = TestStepSpec::from_program_step(step)
        .ok_or_else(|| RunError::code(UNEXPECTED_RESPONSE))?;

    let mut lamp = match step {
        ProgramStep::Fn(fct) if fct.lamp_count > 0 => {
            Some(LampWatch::start(host, fct.lamp_count, fct.lamp_duration))
        }
        _ => None,
    };

    empty_actual_values(host, manager).await?;
    manager
        .set_test_program(&program.name, &[spec.clone()])
        .await?;
    gated_start(host, manager, spec.is_vis(), attempts).await?;

    if let ProgramStep::Vis(vis) = step {
        monitor_vis_step(host, manager, vis, index).await
    } else {
        monitor_test_step(host, manager, &spec, index, lamp.as_mut()).await
    }
}

async fn monitor_test_step<H: TestHost, L: TesterLink>(
    host: &H,
    manager: &mut TesterManager<L>,
    spec: &TestStepSpec,
    index: usize,
    mut lamp: Option<&mut LampWatch>,
) -> Result<(), RunError> {
    let cancel = host.cancel_token();
    let total = spec.total_time();

    loop {
        if cancel.is_cancelled() {
            return Err(RunError::cancelled());
        }
        if let Some(watch) = lamp.as_mut() {
            watch.check(host)?;
        }

        match manager.get_actual_values().await? {
            None => tokio::time::sleep(Duration::from_millis(25)).await,
            Some(Glp2Response::Interim(interim)) => {
                handle_interim(host, index, spec, &interim, total);
            }
            Some(Glp2Response::Final(actual)) => return classify_final(host, index, &actual),
        }
    }
}

fn handle_interim<H: TestHost>(
    host: &H,
    step_index: usize,
    spec: &TestStepSpec,
    interim: &InterimActualValues,
    total: Duration,
) {
    host.update_step_progress(
        step_index,
        StepProgressUpdate::default()
            .with_value(interim.value1)
            .with_unit(interim.unit1.clone())
            .with_progress(interim_progress(interim.time_ms, total)),
    );

    let remaining_ms = total.as_millis() as i64 - interim.time_ms as i64;
    if remaining_ms <= 1000 {
        host.broker().publish(
            "programmer.glp2.stepNearlyCompleted",
            json!({
                "stepIndex": step_index,
                "label": spec.label(),
                "remainingTime": remaining_ms,
            }),
        );
    }
}

async fn monitor_vis_step<H: TestHost, L: TesterLink>(
    host: &H,
    manager: &mut TesterManager<L>,
    vis: &VisStep,
    index: usize,
) -> Result<(), RunError> {
    host.update_step_progress(index, StepProgressUpdate::active().with_value(-1.0));

    let cancel = host.cancel_token();
    let continue_flag = ContinueFlag::watch(host.broker());
    let prompt_after = Duration::from_secs_f64(vis.duration);
    let total = if vis.max_duration > 0.0 {
        Duration::from_secs_f64(vis.max_duration)
    } else {
        Duration::from_secs_f64(vis.duration * 2.0)
    };
    let started = Instant::now();
    let mut prompted = false;
    let mut acked = false;

    loop {
        if cancel.is_cancelled() {
            return Err(RunError::cancelled());
        }

        let elapsed = started.elapsed();
        if !prompted && elapsed >= prompt_after {
            host.change_state(json!({"waitingForContinue": "vis"}));
            prompted = true;
        }
        if prompted && !acked && continue_flag.cleared() {
            manager.ack_vis_test(true).await?;
            acked = true;
        }

        host.update_step_progress(
            index,
            StepProgressUpdate::default()
                .with_progress(elapsed.as_secs_f64() / total.as_secs_f64() * 100.0),
        );

        match manager.get_actual_values().await? {
            None => tokio::time::sleep(Duration::from_millis(25)).await,
            Some(Glp2Response::Interim(_)) => {}
            Some(Glp2Response::Final(actual)) => {
                if host.waiting_for_continue().is_some() {
                    host.change_state(json!({"waitingForContinue": null}));
                }
                return classify_final(host, index, &actual);
            }
        }
    }
}

// =============================================================================
// All-in-one mode
// =============================================================================

enum AioAction {
    AckVis(bool),
}

/// Live resources of the step currently executing on the instrument.
struct AioStepRuntime<'h> {
    scope: Option<CancelHandle>,
    lamp: Option<LampWatch>,
    /// Set once the programming backend finished (or was never started).
    programming_done: Option<Arc<AtomicBool>>,
    aux: FuturesUnordered<BoxFuture<'h, Result<(), RunError>>>,
}

impl<'h> AioStepRuntime<'h> {
    fn new() -> Self {
        Self {
            scope: None,
            lamp: None,
            programming_done: None,
            aux: FuturesUnordered::new(),
        }
    }

    /// Tear down the previous step's resources. Runs exactly once per step
    /// regardless of which path (boundary, failure, cancellation) hits first.
    fn teardown<H: TestHost>(&mut self, host: &H) {
        if let Some(scope) = self.scope.take() {
            scope.cancel();
        }
        self.aux = FuturesUnordered::new();
        self.lamp = None;

        if let Some(done) = self.programming_done.take() {
            // The tester moved on while programming was still running: abort
            // the whole run rather than leave a half-programmed device.
            if !done.load(Ordering::SeqCst) && !host.cancel_token().is_cancelled() {
                host.request_cancel();
            }
        }

        if host.waiting_for_continue().is_some() {
            host.change_state(json!({"waitingForContinue": null}));
        }
    }

    /// Let pending auxiliary futures make progress for one scheduling slice,
    /// surfacing the first failure.
    async fn drive(&mut self) -> Option<RunError> {
        if self.aux.is_empty() {
            tokio::time::sleep(Duration::from_millis(15)).await;
            return None;
        }
        tokio::select! {
            result = self.aux.next() => match result {
                Some(Err(err)) => Some(err),
                _ => None,
            },
            _ = tokio::time::sleep(Duration::from_millis(15)) => None,
        }
    }
}

async fn execute_aio<H: TestHost, L: TesterLink>(
    host: &H,
    manager: &mut TesterManager<L>,
    program: &Program,
    backend: Option<ProgramBackend>,
) -> Result<(), RunError> {
    let enabled: Vec<(usize, ProgramStep)> = program
        .enabled_steps()
        .map(|(index, step)| (index, step.clone()))
        .collect();
    if enabled.is_empty() {
        return Ok(());
    }

    let specs: Vec<TestStepSpec> = enabled
        .iter()
        .map(|(_, step)| TestStepSpec::aio_from_program_step(step))
        .collect();
    let step_indexes: Vec<usize> = enabled.iter().map(|(index, _)| *index).collect();
    let software_version = manager.software_version();
    let is_first_vis = specs[0].is_vis();

    empty_actual_values(host, manager).await?;
    manager.set_test_program(&program.name, &specs).await?;
    let mut attempts = 0;
    gated_start(host, manager, is_first_vis, &mut attempts).await?;

    let cancel = host.cancel_token();
    let (act_tx, mut act_rx) = mpsc::unbounded_channel::<AioAction>();
    let mut runtime = AioStepRuntime::new();
    let mut current_index: Option<usize> = None;
    let mut completed = 0usize;
    // Visual checks and waits produce no interim records; synthesize one so
    // their setup runs as soon as the instrument reaches them.
    let mut pending_interim =
        wants_placeholder(&enabled[0].1).then(|| InterimActualValues::placeholder(1));

    let result = 'monitor: loop {
        if cancel.is_cancelled() {
            break Err(RunError::cancelled());
        }

        if let Some(lamp) = runtime.lamp.as_mut() {
            if let Err(err) = lamp.check(host) {
                break Err(err);
            }
        }

        while let Ok(action) = act_rx.try_recv() {
            match action {
                AioAction::AckVis(pass) => {
                    if let Err(err) = manager.ack_vis_test(pass).await {
                        break 'monitor Err(err);
                    }
                }
            }
        }

        let response = match pending_interim.take() {
            Some(interim) => Some(Glp2Response::Interim(interim)),
            None => match manager.get_actual_values().await {
                Ok(response) => response,
                Err(err) => break Err(err),
            },
        };

        match response {
            None => {}
            Some(Glp2Response::Interim(interim)) => {
                let slot = interim.step_number as usize;
                if slot == 0 || slot > specs.len() {
                    break Err(RunError::code(UNEXPECTED_RESPONSE));
                }
                let slot = slot - 1;
                let program_index = step_indexes[slot];
                let spec = &specs[slot];
                let step = &enabled[slot].1;
                let progress = interim_progress(interim.time_ms, spec.total_time());

                if current_index != Some(program_index) {
                    runtime.teardown(host);
                    current_index = Some(program_index);

                    host.log(
                        "TESTING_EXECUTING_STEP",
                        json!({"type": step.kind().as_str(), "index": program_index}),
                    );

                    let (scope, scope_token) = cancel_pair();
                    runtime.scope = Some(scope);

                    match step {
                        ProgramStep::Program(_) => {
                            let done = Arc::new(AtomicBool::new(false));
                            runtime.programming_done = Some(Arc::clone(&done));
                            runtime.aux.push(setup_aio_programming(
                                host,
                                program_index,
                                backend,
                                software_version,
                                done,
                                scope_token,
                                act_tx.clone(),
                            ));
                        }
                        ProgramStep::Vis(vis) => {
                            runtime.aux.push(setup_aio_vis(
                                host,
                                vis.clone(),
                                program_index,
                                scope_token,
                                act_tx.clone(),
                            ));
                        }
                        ProgramStep::Wait(wait) => {
                            runtime.aux.push(setup_aio_wait(
                                host,
                                wait.clone(),
                                program_index,
                                scope_token,
                                act_tx.clone(),
                            ));
                        }
                        ProgramStep::Fn(fct) => {
                            if fct.lamp_count > 0 {
                                runtime.lamp = Some(LampWatch::start(
                                    host,
                                    fct.lamp_count,
                                    fct.lamp_duration,
                                ));
                            }
                            host.update_step_progress(
                                program_index,
                                StepProgressUpdate::active()
                                    .with_value(interim.value1)
                                    .with_unit(interim.unit1.clone())
                                    .with_progress(progress),
                            );
                        }
                        _ => {
                            host.update_step_progress(
                                program_index,
                                StepProgressUpdate::active()
                                    .with_value(interim.value1)
                                    .with_unit(interim.unit1.clone())
                                    .with_progress(progress),
                            );
                        }
                    }
                } else {
                    handle_interim(host, program_index, spec, &interim, spec.total_time());
                }
            }
            Some(Glp2Response::Final(actual)) => {
                runtime.teardown(host);
                current_index = None;

                if completed >= specs.len() {
                    break Err(RunError::code(UNEXPECTED_RESPONSE));
                }
                let step_index = step_indexes[completed];
                completed += 1;

                if let Err(err) = classify_final(host, step_index, &actual) {
                    break Err(err);
                }
                if completed == specs.len() {
                    break Ok(());
                }
                if wants_placeholder(&enabled[completed].1) {
                    pending_interim = Some(InterimActualValues::placeholder(completed as u32 + 1));
                }
            }
        }

        if let Some(err) = runtime.drive().await {
            if let Some(index) = current_index {
                host.update_step_progress(index, StepProgressUpdate::status(StepStatus::Failure));
            }
            break Err(err);
        }
    };

    runtime.teardown(host);
    result
}

fn wants_placeholder(step: &ProgramStep) -> bool {
    matches!(step.kind(), StepKind::Vis | StepKind::Wait)
}

fn setup_aio_programming<'h, H: TestHost>(
    host: &'h H,
    index: usize,
    backend: Option<ProgramBackend>,
    software_version: f64,
    done: Arc<AtomicBool>,
    scope: CancelToken,
    act: mpsc::UnboundedSender<AioAction>,
) -> BoxFuture<'h, Result<(), RunError>> {
    Box::pin(async move {
        let inner = async {
            host.update_step_progress(index, StepProgressUpdate::active().with_value(-1.0));

            // Tester firmware before 4.6 keeps the visual-check window open
            // until the operator confirms, so surface that state.
            let wait_for_continue = software_version < 4.6;

            let Some(backend) = backend else {
                host.log("TESTING_SKIPPING_PROGRAMMING", json!({}));
                done.store(true, Ordering::SeqCst);
                if wait_for_continue {
                    host.change_state(json!({"waitingForContinue": "programmed"}));
                }
                let _ = act.send(AioAction::AckVis(true));
                return Ok(());
            };

            let delay = Duration::from_millis(host.settings().glp2_programming_delay_ms);
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }

            let progress = |percent: f64| {
                host.update_step_progress(
                    index,
                    StepProgressUpdate::default().with_progress(percent),
                );
            };
            let result = host.run_programming_backend(backend, &progress).await;
            done.store(true, Ordering::SeqCst);
            result?;

            if wait_for_continue {
                host.change_state(json!({"waitingForContinue": "programmed"}));
            }
            let _ = act.send(AioAction::AckVis(true));
            Ok(())
        };

        tokio::select! {
            _ = scope.cancelled() => Ok(()),
            result = inner => result,
        }
    })
}

fn setup_aio_vis<'h, H: TestHost>(
    host: &'h H,
    vis: VisStep,
    index: usize,
    scope: CancelToken,
    act: mpsc::UnboundedSender<AioAction>,
) -> BoxFuture<'h, Result<(), RunError>> {
    Box::pin(async move {
        let inner = async {
            host.update_step_progress(index, StepProgressUpdate::active().with_value(-1.0));

            let total = Duration::from_secs_f64(vis.max_duration.max(1.0));
            let started = Instant::now();

            tick_progress_for(host, index, started, total, Duration::from_secs_f64(vis.duration))
                .await;

            host.wait_for_continue(WaitingReason::Vis).await?;
            let _ = act.send(AioAction::AckVis(true));
            Ok(())
        };

        tokio::select! {
            _ = scope.cancelled() => Ok(()),
            result = inner => result,
        }
    })
}

fn setup_aio_wait<'h, H: TestHost>(
    host: &'h H,
    wait: WaitStep,
    index: usize,
    scope: CancelToken,
    act: mpsc::UnboundedSender<AioAction>,
) -> BoxFuture<'h, Result<(), RunError>> {
    Box::pin(async move {
        let inner = async {
            match wait.kind {
                WaitKind::Auto => {
                    host.update_step_progress(index, StepProgressUpdate::active().with_value(-1.0));

                    let total = Duration::from_secs_f64(wait.duration);
                    let started = Instant::now();
                    tick_progress_for(host, index, started, total, total).await;

                    let _ = act.send(AioAction::AckVis(true));
                    Ok(())
                }
                WaitKind::Manual => {
                    host.update_step_progress(
                        index,
                        StepProgressUpdate::active().with_progress(50.0).with_value(-1.0),
                    );
                    host.wait_for_continue(WaitingReason::Test).await?;
                    let _ = act.send(AioAction::AckVis(true));
                    Ok(())
                }
            }
        };

        tokio::select! {
            _ = scope.cancelled() => Ok(()),
            result = inner => result,
        }
    })
}

/// Update a step's progress every 250 ms against `total` until `run_for`
/// elapses.
async fn tick_progress_for<H: TestHost>(
    host: &H,
    index: usize,
    started: Instant,
    total: Duration,
    run_for: Duration,
) {
    let mut ticker = tokio::time::interval(Duration::from_millis(250));
    loop {
        ticker.tick().await;
        let elapsed = started.elapsed();
        host.update_step_progress(
            index,
            StepProgressUpdate::default()
                .with_progress(elapsed.as_secs_f64() / total.as_secs_f64() * 100.0),
        );
        if elapsed >= run_for {
            return;
        }
    }
}
