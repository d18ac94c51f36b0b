//! Workflow orchestrator.
//!
//! [`Programmer`] owns the single live run record and drives one submitted
//! request through the whole station workflow: countdown, feature file
//! discovery (with a documented fallback path), workflow file synthesis,
//! the parallel-port gate, the programming/testing dispatch, service-tag
//! acquisition and printing, and finalization. Every phase observes the
//! run's cancellation token, publishes structured log entries around its
//! side effects, and moves `overallProgress` along a fixed milestone
//! schedule. Finalization always runs: state is persisted and a
//! `programmer.finished` event is published even for cancelled runs.

use crate::broker::{cancel_pair, Broker, CancelHandle, CancelToken};
use crate::error::RunError;
use crate::glp2::{ProgramBackend, TestHost};
use crate::lpt::{LptConfig, LptIo, LptPort};
use crate::pipeline::{Pipeline, StepOutcome};
use crate::program::Program;
use crate::run::{
    InputMode, MeasurementKind, RunRecord, RunResult, StepProgressUpdate, WaitingReason, WorkMode,
};
use crate::sdp::BenchSupply;
use crate::services::{
    DeviceProgrammer, FeatureFileLocator, HistoryStore, LampStateSource, Printer,
    ProgressFn, RemoteCoordinator, RemoteProvisioner, SearchOutcome,
};
use crate::settings::Settings;
use crate::sol::{self, SolPortProvider};
use async_trait::async_trait;
use chrono::Utc;
use futures::future::BoxFuture;
use log::{debug, error, warn};
use serde_json::{json, Map, Value};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;

/// Overall progress reached once setup (countdown, files, gate) completes.
const OVERALL_SETUP_PROGRESS: f64 = 20.0;

/// One programming/testing request submitted to the station.
#[derive(Debug, Clone, Default)]
pub struct ProgramRequest {
    pub order_no: Option<String>,
    pub quantity: u32,
    pub nc12: Option<String>,
}

/// External collaborators wired into the orchestrator.
pub struct Services {
    pub locator: Arc<dyn FeatureFileLocator>,
    pub coordinator: Arc<dyn RemoteCoordinator>,
    pub store: Arc<dyn HistoryStore>,
    pub printer: Arc<dyn Printer>,
    pub device_programmer: Arc<dyn DeviceProgrammer>,
    pub provisioner: Option<Arc<dyn RemoteProvisioner>>,
    pub lamp_source: Arc<dyn LampStateSource>,
    pub sol_ports: Option<Arc<dyn SolPortProvider>>,
    pub lpt_port: Option<Arc<dyn LptPort>>,
    pub supply: Option<Arc<tokio::sync::Mutex<Box<dyn BenchSupply>>>>,
}

impl Services {
    /// Collaborator set for a stand-alone station: filesystem locator and
    /// store, no remote link, no optional hardware.
    pub fn offline(store: Arc<dyn HistoryStore>) -> Self {
        Self {
            locator: Arc::new(crate::services::FsFeatureFileLocator),
            coordinator: Arc::new(crate::services::OfflineCoordinator),
            store,
            printer: Arc::new(crate::services::NoopPrinter),
            device_programmer: Arc::new(crate::services::UnavailableProgrammer),
            provisioner: None,
            lamp_source: Arc::new(crate::services::NullLampSource),
            sol_ports: None,
            lpt_port: None,
            supply: None,
        }
    }
}

/// Type-erased tester session usable by the main dispatch phase.
pub trait TesterHandle: Send {
    fn run<'a>(
        &'a mut self,
        host: &'a Programmer,
        backend: Option<ProgramBackend>,
    ) -> BoxFuture<'a, Result<(), RunError>>;
}

impl<L: crate::glp2::TesterLink> TesterHandle for crate::glp2::TesterManager<L> {
    fn run<'a>(
        &'a mut self,
        host: &'a Programmer,
        backend: Option<ProgramBackend>,
    ) -> BoxFuture<'a, Result<(), RunError>> {
        Box::pin(crate::glp2::program_and_test(host, self, backend))
    }
}

/// The workflow orchestrator. One instance per station.
pub struct Programmer {
    settings: Arc<Settings>,
    broker: Broker,
    services: Services,
    state: Mutex<RunRecord>,
    cancel: Mutex<CancelHandle>,
    new_program: Mutex<Option<Program>>,
}

impl Programmer {
    pub fn new(settings: Arc<Settings>, broker: Broker, services: Services) -> Self {
        let (handle, _token) = cancel_pair();
        Self {
            settings,
            broker,
            services,
            state: Mutex::new(RunRecord::new()),
            cancel: Mutex::new(handle),
            new_program: Mutex::new(None),
        }
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn broker(&self) -> &Broker {
        &self.broker
    }

    pub fn is_in_progress(&self) -> bool {
        self.state(|state| state.is_in_progress())
    }

    pub fn snapshot(&self) -> Value {
        self.state(|state| state.snapshot())
    }

    /// Read access to the run record.
    pub fn state<R>(&self, read: impl FnOnce(&RunRecord) -> R) -> R {
        read(&self.state.lock().unwrap())
    }

    fn state_mut<R>(&self, mutate: impl FnOnce(&mut RunRecord) -> R) -> R {
        mutate(&mut self.state.lock().unwrap())
    }

    /// Bind a program for subsequent runs. Rejected while a run is live.
    pub fn bind_program(&self, program: Option<Program>) -> Result<(), RunError> {
        self.state_mut(|state| {
            if state.is_in_progress() {
                return Err(RunError::code("IN_PROGRESS"));
            }
            state.program = program;
            Ok(())
        })
    }

    /// Stage a newer program version; it replaces the bound program at the
    /// start of the next run when the identity matches, never mid-run.
    pub fn set_new_program(&self, program: Program) {
        *self.new_program.lock().unwrap() = Some(program);
    }

    pub fn select_input_mode(&self, mode: InputMode) {
        self.state_mut(|state| state.input_mode = mode);
    }

    pub fn select_work_mode(&self, mode: WorkMode) {
        self.state_mut(|state| state.work_mode = mode);
    }

    /// Operator pressed continue: clears the waiting flag and lets whichever
    /// sub-phase is blocked resume.
    pub fn continue_run(&self) {
        self.change_state(json!({"waitingForContinue": null}));
    }

    /// Request cancellation of the live run. Idempotent; the `cancelled`
    /// topic fires once.
    pub fn request_cancel(&self) {
        let handle = self.cancel.lock().unwrap();
        let token = handle.token();
        if token.is_cancelled() {
            return;
        }
        handle.cancel();
        drop(handle);
        self.broker.publish("programmer.cancelled", Value::Null);
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.lock().unwrap().token()
    }

    /// Append a structured log entry to the live run.
    pub fn log(&self, text: &str, params: Value) {
        debug!("[programmer] {} {}", text, params);
        let time = Utc::now().timestamp_millis();
        self.state_mut(|state| state.push_log(time, text, params));
    }

    /// Merge partial changes into the run record and publish a
    /// `stateChanged` event carrying exactly the changed keys.
    pub fn change_state(&self, changes: Value) {
        let Value::Object(map) = &changes else {
            warn!("[programmer] non-object state change ignored");
            return;
        };
        self.state_mut(|state| apply_changes(state, map));
        self.broker.publish("programmer.stateChanged", changes);
    }

    /// Move overall progress forward. With `is_increment`, `percent` is a
    /// fraction of the main programming window (setup → terminal reserve)
    /// instead of an absolute milestone.
    pub fn update_overall_progress(&self, percent: f64, is_increment: bool) {
        let value = if is_increment {
            let target = self.programming_target();
            OVERALL_SETUP_PROGRESS + percent / 100.0 * (target - OVERALL_SETUP_PROGRESS)
        } else {
            percent
        };
        let changed = self.state_mut(|state| {
            let before = state.overall_progress;
            state.raise_overall_progress(value);
            (state.overall_progress - before).abs() > f64::EPSILON
        });
        if changed {
            self.broker.publish(
                "programmer.stateChanged",
                json!({"overallProgress": self.state(|s| s.overall_progress)}),
            );
        }
    }

    /// Where the programming phase tops out: leave room for tag acquisition
    /// and printing when they are on the schedule.
    fn programming_target(&self) -> f64 {
        let remote = self.state(|state| state.input_mode == InputMode::Remote);
        if remote && self.settings.should_print_service_tag() {
            90.0
        } else if remote {
            92.0
        } else {
            100.0
        }
    }

    /// Apply a partial update to one step-progress slot and notify.
    pub fn update_step_progress(&self, index: usize, update: StepProgressUpdate) {
        let applied = self.state_mut(|state| state.apply_step_progress(index, &update));
        if applied {
            let step = self.state(|state| {
                state
                    .steps
                    .as_ref()
                    .and_then(|steps| steps.get(index).cloned())
            });
            if let Some(step) = step {
                self.broker.publish(
                    "programmer.stepProgressChanged",
                    json!({"stepIndex": index, "step": step}),
                );
            }
        }
    }

    /// Append transcript lines to the run output.
    pub fn append_output(&self, lines: Vec<String>) {
        if lines.is_empty() {
            return;
        }
        let joined = lines.join("\n");
        let output = self.state_mut(|state| {
            match state.output.as_mut() {
                Some(output) => {
                    output.push('\n');
                    output.push_str(&joined);
                }
                None => state.output = Some(joined),
            }
            state.output.clone()
        });
        self.broker
            .publish("programmer.stateChanged", json!({"output": output}));
    }

    /// Record one bench-supply sample.
    pub fn append_metrics(&self, u_set: f64, u_get: f64, i: f64) {
        self.state_mut(|state| {
            state.append_metric(MeasurementKind::SetVoltage, u_set);
            state.append_metric(MeasurementKind::ReadVoltage, u_get);
            state.append_metric(MeasurementKind::Current, i);
        });
    }

    /// Block until the operator clears the waiting reason, observing the
    /// run's cancellation token. The waiting state is cleared on every
    /// return path.
    pub async fn wait_for_continue(&self, reason: WaitingReason) -> Result<(), RunError> {
        let token = self.cancel_token();
        if token.is_cancelled() {
            return Err(RunError::cancelled());
        }

        let notify = Arc::new(Notify::new());
        let notified = Arc::clone(&notify);
        let sub = self
            .broker
            .subscribe("programmer.stateChanged")
            .set_filter(|changes| matches!(changes.get("waitingForContinue"), Some(Value::Null)))
            .on_message(move |_| notified.notify_one());

        self.change_state(json!({
            "waitingForContinue": serde_json::to_value(reason).unwrap_or(Value::Null)
        }));

        let result = tokio::select! {
            _ = token.cancelled() => Err(RunError::cancelled()),
            _ = notify.notified() => Ok(()),
        };
        sub.cancel();

        if result.is_err() && self.state(|state| state.waiting_for_continue.is_some()) {
            self.change_state(json!({"waitingForContinue": null}));
        }
        result
    }

    /// Dispatch to one of the device-programming backends.
    pub async fn run_backend(
        &self,
        backend: ProgramBackend,
        progress: ProgressFn<'_>,
    ) -> Result<(), RunError> {
        let cancel = self.cancel_token();
        match backend {
            ProgramBackend::Sol => {
                let Some(ports) = self.services.sol_ports.clone() else {
                    return Err(RunError::code("SOL_COM_NOT_FOUND"));
                };
                let feature = self
                    .state(|state| state.feature.clone())
                    .ok_or_else(|| RunError::code("SOL_NO_COMMANDS"))?;

                let mut output = Vec::new();
                let result = sol::program_sol_driver(
                    &self.settings,
                    ports.as_ref(),
                    &feature,
                    &|text, params| self.log(text, params),
                    &mut output,
                    progress,
                    &cancel,
                )
                .await;
                self.append_output(output);
                result
            }
            ProgramBackend::Generic => {
                let feature = self
                    .state(|state| state.feature.clone())
                    .unwrap_or_default();
                self.services
                    .device_programmer
                    .program(&feature, progress, &cancel)
                    .await
            }
            ProgramBackend::Gprs => {
                let Some(provisioner) = self.services.provisioner.clone() else {
                    return Err(RunError::code("GPRS:UNAVAILABLE"));
                };
                let nc12 = self
                    .state(|state| state.nc12.clone())
                    .unwrap_or_default();
                let files = provisioner.provision(&nc12, progress, &cancel).await?;
                self.state_mut(|state| {
                    state.gprs_order_file = Some(files.order);
                    state.gprs_input_file = Some(files.input);
                    state.gprs_result_file = Some(files.result);
                });
                Ok(())
            }
        }
    }

    /// Submit one programming/testing request and drive it to completion.
    ///
    /// Returns the terminal run error, if any. The run record is always
    /// finalized, persisted and announced, whatever the outcome.
    pub async fn program<'a>(
        &'a self,
        mut tester: Option<&'a mut dyn TesterHandle>,
        request: ProgramRequest,
    ) -> Result<(), RunError> {
        {
            let state = self.state.lock().unwrap();
            if state.is_in_progress() {
                return Err(RunError::code("IN_PROGRESS"));
            }
            if state.input_mode == InputMode::Remote && !self.services.coordinator.is_connected() {
                return Err(RunError::code("NO_REMOTE_CONNECTION"));
            }
        }

        // Install a fresh cancellation context for this run.
        let (handle, token) = cancel_pair();
        *self.cancel.lock().unwrap() = handle;

        // A newer program version with the same identity replaces the bound
        // program between runs, never mid-run.
        if let Some(new_program) = self.new_program.lock().unwrap().take() {
            self.state_mut(|state| {
                if state
                    .program
                    .as_ref()
                    .map(|program| program.id == new_program.id)
                    .unwrap_or(false)
                {
                    state.program = Some(new_program);
                }
            });
        }

        self.state_mut(|state| {
            state.reset(
                &self.settings,
                request.order_no.as_deref(),
                request.quantity,
                request.nc12.as_deref(),
            )
        });
        self.broker
            .publish("programmer.stateChanged", self.snapshot());

        let mut ctx = ProgramContext {
            programmer: self,
            tester: tester.take(),
            found_feature1: false,
            is_sol: false,
            lpt: None,
        };

        let pipeline = Pipeline::new()
            .step(countdown_step)
            .step(find_feature_file1_step)
            .step(read_feature_file1_step)
            .step(find_feature_file2_step)
            .step(read_feature_file2_step)
            .step(check_sol_program_step)
            .step(write_workflow_file_step)
            .step(lpt_start_step)
            .step(main_dispatch_step)
            .step(acquire_service_tag_step)
            .step(print_service_tag_step);

        let err = pipeline.run(&mut ctx, &token).await;
        let lpt = ctx.lpt.take();
        drop(ctx);

        self.finalize(err, lpt).await
    }

    async fn finalize(
        &self,
        err: Option<RunError>,
        lpt: Option<LptIo<Arc<dyn LptPort>>>,
    ) -> Result<(), RunError> {
        let cancelled = self.cancel_token().is_cancelled();
        let err = if cancelled {
            Some(RunError::cancelled())
        } else {
            err
        };

        if let Some(mut lpt) = lpt {
            self.log(
                "LPT_FINISHING",
                json!({
                    "port": lpt.config().write_port,
                    "bit": lpt.config().write_bit,
                }),
            );
            lpt.finish(err.is_none());
        }

        let finished_at = Utc::now().timestamp_millis();
        let (snapshot, feature, release, changes) = {
            let mut state = self.state.lock().unwrap();
            let started_at = state.started_at.unwrap_or(finished_at);
            let duration = finished_at - started_at;

            state.finished_at = Some(finished_at);
            state.duration = Some(duration);
            state.countdown = -1;
            state.waiting_for_continue = None;
            state.waiting_for_leds = false;

            let mut release = None;
            match &err {
                Some(err) => {
                    state.result = Some(RunResult::Failure);
                    state.error_code = Some(err.code.clone());
                    state.exception = err.message.clone();
                    let log_params = json!({
                        "time": finished_at,
                        "duration": duration,
                        "errorCode": err.code,
                        "nc12": state.nc12,
                    });
                    state.push_log(finished_at, "PROGRAMMING_FAILURE", log_params);
                    if let (Some(id), Some(tag)) = (state.id.clone(), state.service_tag.clone()) {
                        release = Some((id, state.nc12.clone(), tag));
                    }
                }
                None => {
                    state.result = Some(RunResult::Success);
                    state.error_code = None;
                    state.exception = None;
                    state.counter += 1;
                    let log_params = json!({
                        "time": finished_at,
                        "duration": duration,
                        "nc12": state.nc12,
                    });
                    state.push_log(finished_at, "PROGRAMMING_SUCCESS", log_params);
                }
            }

            if let Some(order) = state.order.as_mut() {
                if err.is_some() {
                    order.failure_counter += 1;
                } else {
                    order.success_counter += 1;
                }
                order.finished_at = Some(finished_at);
                order.duration = Some(finished_at - order.started_at);
            }

            let hash = state.hash_feature_file();
            state.in_progress = false;
            state.overall_progress = 100.0;

            let changes = json!({
                "finishedAt": finished_at,
                "duration": duration,
                "result": state.result,
                "errorCode": state.error_code,
                "exception": state.exception,
                "order": state.order,
                "featureFileHash": state.feature_file_hash,
                "inProgress": false,
                "overallProgress": 100.0,
            });

            let feature = hash.and_then(|hash| {
                state
                    .feature
                    .clone()
                    .map(|content| (hash, content))
            });
            (state.snapshot(), feature, release, changes)
        };

        if let Some((id, nc12, tag)) = release {
            self.services
                .coordinator
                .release_service_tag(&id, nc12.as_deref(), &tag)
                .await;
        }

        let feature_ref = feature
            .as_ref()
            .map(|(hash, content)| (hash.as_str(), content.as_str()));
        if let Err(save_err) = self.services.store.save(&snapshot, feature_ref).await {
            error!("[programmer] failed to save the run record: {:#}", save_err);
        }

        self.broker.publish("programmer.stateChanged", changes);
        self.broker.publish("programmer.finished", snapshot);

        match err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

fn apply_changes(state: &mut RunRecord, changes: &Map<String, Value>) {
    for (key, value) in changes {
        match key.as_str() {
            "countdown" => {
                if let Some(countdown) = value.as_i64() {
                    state.countdown = countdown;
                }
            }
            "overallProgress" => {
                if let Some(percent) = value.as_f64() {
                    state.raise_overall_progress(percent);
                }
            }
            "featureFile" => state.feature_file = value.as_str().map(str::to_string),
            "featureFileName" => state.feature_file_name = value.as_str().map(str::to_string),
            "feature" => state.feature = value.as_str().map(str::to_string),
            "workflowFile" => state.workflow_file = value.as_str().map(str::to_string),
            "workflow" => state.workflow = value.as_str().map(str::to_string),
            "output" => state.output = value.as_str().map(str::to_string),
            "serviceTag" => state.service_tag = value.as_str().map(str::to_string),
            "waitingForContinue" => {
                state.waiting_for_continue = value
                    .as_str()
                    .and_then(|reason| serde_json::from_value(Value::String(reason.into())).ok());
            }
            other => debug!("[programmer] ignoring state change key {}", other),
        }
    }
}

#[async_trait]
impl TestHost for Programmer {
    fn settings(&self) -> &Settings {
        &self.settings
    }

    fn broker(&self) -> &Broker {
        &self.broker
    }

    fn cancel_token(&self) -> CancelToken {
        Programmer::cancel_token(self)
    }

    fn request_cancel(&self) {
        Programmer::request_cancel(self)
    }

    fn bound_program(&self) -> Option<Program> {
        self.state(|state| state.program.clone())
    }

    fn waiting_for_continue(&self) -> Option<WaitingReason> {
        self.state(|state| state.waiting_for_continue)
    }

    fn log(&self, text: &str, params: Value) {
        Programmer::log(self, text, params)
    }

    fn change_state(&self, changes: Value) {
        Programmer::change_state(self, changes)
    }

    fn update_step_progress(&self, index: usize, update: StepProgressUpdate) {
        Programmer::update_step_progress(self, index, update)
    }

    fn lamp_source(&self) -> Arc<dyn LampStateSource> {
        Arc::clone(&self.services.lamp_source)
    }

    fn append_output(&self, lines: Vec<String>) {
        Programmer::append_output(self, lines)
    }

    async fn wait_for_continue(&self, reason: WaitingReason) -> Result<(), RunError> {
        Programmer::wait_for_continue(self, reason).await
    }

    async fn run_programming_backend(
        &self,
        backend: ProgramBackend,
        progress: ProgressFn<'_>,
    ) -> Result<(), RunError> {
        self.run_backend(backend, progress).await
    }
}

// =============================================================================
// Workflow phases
// =============================================================================

struct ProgramContext<'p> {
    programmer: &'p Programmer,
    tester: Option<&'p mut dyn TesterHandle>,
    found_feature1: bool,
    is_sol: bool,
    lpt: Option<LptIo<Arc<dyn LptPort>>>,
}

fn countdown_step<'a, 'p>(
    ctx: &'a mut ProgramContext<'p>,
    _prev: Option<&'a RunError>,
) -> BoxFuture<'a, StepOutcome> {
    Box::pin(async move {
        let p = ctx.programmer;
        let delay = p.settings().program_delay;
        if delay == 0 {
            p.update_overall_progress(6.0, false);
            return StepOutcome::Continue;
        }

        p.log("COUNTDOWN_STARTED", json!({"delay": delay}));
        p.change_state(json!({"countdown": delay}));

        let total = delay as f64;
        let mut remaining = delay as i64;
        let mut ticker = tokio::time::interval(Duration::from_secs(1));
        ticker.tick().await;

        while remaining >= 0 {
            ticker.tick().await;
            remaining -= 1;
            let elapsed = total - remaining.max(0) as f64;
            p.change_state(json!({
                "overallProgress": 1.0 + 5.0 * (elapsed / total),
                "countdown": remaining.max(-1),
            }));
        }

        StepOutcome::Continue
    })
}

fn find_feature_file1_step<'a, 'p>(
    ctx: &'a mut ProgramContext<'p>,
    _prev: Option<&'a RunError>,
) -> BoxFuture<'a, StepOutcome> {
    Box::pin(async move {
        let p = ctx.programmer;
        let Some(feature_path) = p
            .settings()
            .feature_path1
            .clone()
            .filter(|path| !path.is_empty())
        else {
            return StepOutcome::Skip(Some(RunError::code("UNSET_FEATURE_PATH_1")));
        };

        p.update_overall_progress(7.0, false);
        p.log("SEARCHING_FEATURE_FILE", json!({"featurePath": feature_path}));

        let nc12 = p.state(|state| state.nc12.clone()).unwrap_or_default();
        let outcome = p
            .services
            .locator
            .find(
                Path::new(&feature_path),
                &nc12,
                p.settings().search_timeout(false),
            )
            .await;

        match outcome {
            Err(err) => {
                p.update_overall_progress(8.0, false);
                p.log(
                    "SEARCHING_FEATURE_FILE_FAILURE",
                    json!({"error": err.to_string()}),
                );
            }
            Ok(SearchOutcome::TimedOut) => {
                p.update_overall_progress(8.0, false);
                p.log("SEARCHING_FEATURE_FILE_TIMEOUT", json!({}));
            }
            Ok(SearchOutcome::NotFound) => {
                p.update_overall_progress(8.0, false);
                p.log("MISSING_FEATURE_FILE_1", json!({}));
            }
            Ok(SearchOutcome::Found { matches, .. }) if matches.len() > 1 => {
                // A duplicate on the primary path degrades to the fallback
                // search instead of failing the run.
                p.update_overall_progress(8.0, false);
                p.log(
                    "DUPLICATE_FEATURE_FILE_1",
                    json!({"fileCount": matches.len(), "files": matches}),
                );
            }
            Ok(SearchOutcome::Found { path, matches }) => {
                ctx.found_feature1 = true;
                p.change_state(json!({
                    "overallProgress": 8.0,
                    "featureFile": path.to_string_lossy(),
                    "featureFileName": matches[0],
                }));
                p.log("FEATURE_FILE_FOUND", json!({"featureFile": matches[0]}));
            }
        }

        StepOutcome::Continue
    })
}

fn read_feature_file1_step<'a, 'p>(
    ctx: &'a mut ProgramContext<'p>,
    _prev: Option<&'a RunError>,
) -> BoxFuture<'a, StepOutcome> {
    Box::pin(async move {
        let p = ctx.programmer;
        if !ctx.found_feature1 {
            return StepOutcome::Continue;
        }

        let feature_file = p
            .state(|state| state.feature_file.clone())
            .unwrap_or_default();
        p.update_overall_progress(9.0, false);
        p.log("READING_FEATURE_FILE", json!({"featureFile": feature_file}));

        match p
            .services
            .locator
            .read(Path::new(&feature_file), p.settings().read_timeout(false))
            .await
        {
            Err(err) => {
                p.update_overall_progress(10.0, false);
                p.log(
                    "READING_FEATURE_FILE_FAILURE",
                    json!({"error": err.to_string()}),
                );
            }
            Ok(None) => {
                p.update_overall_progress(10.0, false);
                p.log("READING_FEATURE_FILE_TIMEOUT", json!({}));
            }
            Ok(Some(feature)) => {
                let length = feature.len();
                p.change_state(json!({"overallProgress": 10.0, "feature": feature}));
                p.log("FEATURE_FILE_READ", json!({"length": length}));
            }
        }

        StepOutcome::Continue
    })
}

fn find_feature_file2_step<'a, 'p>(
    ctx: &'a mut ProgramContext<'p>,
    _prev: Option<&'a RunError>,
) -> BoxFuture<'a, StepOutcome> {
    Box::pin(async move {
        let p = ctx.programmer;
        if ctx.found_feature1 {
            return StepOutcome::Continue;
        }

        let Some(feature_path) = p
            .settings()
            .feature_path2
            .clone()
            .filter(|path| !path.is_empty())
        else {
            return StepOutcome::Skip(Some(RunError::code("MISSING_FEATURE_FILE")));
        };

        p.update_overall_progress(11.0, false);
        p.log("SEARCHING_FEATURE_FILE", json!({"featurePath": feature_path}));

        let nc12 = p.state(|state| state.nc12.clone()).unwrap_or_default();
        let outcome = p
            .services
            .locator
            .find(
                Path::new(&feature_path),
                &nc12,
                p.settings().search_timeout(true),
            )
            .await;

        match outcome {
            Err(err) => {
                p.update_overall_progress(12.0, false);
                p.log(
                    "SEARCHING_FEATURE_FILE_FAILURE",
                    json!({"error": err.to_string()}),
                );
                StepOutcome::Skip(Some(RunError::code("MISSING_FEATURE_FILE")))
            }
            Ok(SearchOutcome::TimedOut) => {
                p.update_overall_progress(12.0, false);
                p.log("SEARCHING_FEATURE_FILE_TIMEOUT", json!({}));
                StepOutcome::Skip(Some(RunError::code("MISSING_FEATURE_FILE")))
            }
            Ok(SearchOutcome::NotFound) => {
                p.update_overall_progress(12.0, false);
                p.log("MISSING_FEATURE_FILE_2", json!({}));
                StepOutcome::Skip(Some(RunError::code("MISSING_FEATURE_FILE")))
            }
            Ok(SearchOutcome::Found { matches, .. }) if matches.len() > 1 => {
                // On the fallback path an ambiguous match is fatal: never
                // silently pick one of several candidate files.
                p.update_overall_progress(12.0, false);
                p.log(
                    "DUPLICATE_FEATURE_FILE_2",
                    json!({"fileCount": matches.len(), "files": matches}),
                );
                StepOutcome::Skip(Some(RunError::code("DUPLICATE_FEATURE_FILE")))
            }
            Ok(SearchOutcome::Found { path, matches }) => {
                p.change_state(json!({
                    "overallProgress": 12.0,
                    "featureFile": path.to_string_lossy(),
                    "featureFileName": matches[0],
                }));
                p.log("FEATURE_FILE_FOUND", json!({"featureFile": matches[0]}));
                StepOutcome::Continue
            }
        }
    })
}

fn read_feature_file2_step<'a, 'p>(
    ctx: &'a mut ProgramContext<'p>,
    _prev: Option<&'a RunError>,
) -> BoxFuture<'a, StepOutcome> {
    Box::pin(async move {
        let p = ctx.programmer;
        if ctx.found_feature1 {
            return StepOutcome::Continue;
        }

        let feature_file = p
            .state(|state| state.feature_file.clone())
            .unwrap_or_default();
        p.update_overall_progress(13.0, false);
        p.log("READING_FEATURE_FILE", json!({"featureFile": feature_file}));

        match p
            .services
            .locator
            .read(Path::new(&feature_file), p.settings().read_timeout(true))
            .await
        {
            Err(err) => StepOutcome::Skip(Some(RunError::with_message(
                "FEATURE_FILE_ERROR",
                err.to_string(),
            ))),
            Ok(None) => StepOutcome::Skip(Some(RunError::code("READING_FEATURE_FILE_TIMEOUT"))),
            Ok(Some(feature)) => {
                let length = feature.len();
                p.change_state(json!({"overallProgress": 14.0, "feature": feature}));
                p.log("FEATURE_FILE_READ", json!({"length": length}));
                StepOutcome::Continue
            }
        }
    })
}

fn check_sol_program_step<'a, 'p>(
    ctx: &'a mut ProgramContext<'p>,
    _prev: Option<&'a RunError>,
) -> BoxFuture<'a, StepOutcome> {
    Box::pin(async move {
        let p = ctx.programmer;
        let pattern = p.settings().sol_file_pattern.clone();
        let feature_file = p
            .state(|state| state.feature_file.clone())
            .unwrap_or_default();

        ctx.is_sol = !pattern.is_empty() && feature_file.contains(&pattern);

        p.update_overall_progress(15.0, false);

        // Testing-only mode works exclusively with lighting-driver files.
        let testing = p.state(|state| state.work_mode == WorkMode::Testing);
        if !ctx.is_sol && testing {
            return StepOutcome::Skip(Some(RunError::code("TESTING_NOT_SOL")));
        }

        StepOutcome::Continue
    })
}

fn write_workflow_file_step<'a, 'p>(
    ctx: &'a mut ProgramContext<'p>,
    _prev: Option<&'a RunError>,
) -> BoxFuture<'a, StepOutcome> {
    Box::pin(async move {
        let p = ctx.programmer;
        if ctx.is_sol {
            return StepOutcome::Continue;
        }

        let Some(workflow_file) = p
            .settings()
            .workflow_file
            .clone()
            .filter(|path| !path.is_empty())
        else {
            return StepOutcome::Skip(Some(RunError::code("UNSET_WORKFLOW_FILE")));
        };

        let (workflow, options) = build_workflow_file(p.settings());

        p.log(
            "WRITING_WORKFLOW_FILE",
            json!({"workflowFile": workflow_file, "workflowOptions": options}),
        );
        p.change_state(json!({
            "overallProgress": 16.0,
            "workflowFile": workflow_file,
            "workflow": workflow.trim(),
        }));

        if let Err(err) = tokio::fs::write(&workflow_file, &workflow).await {
            return StepOutcome::Skip(Some(RunError::with_message(
                "WORKFLOW_FILE_WRITE_ERROR",
                err.to_string(),
            )));
        }

        p.update_overall_progress(17.0, false);
        p.log("WORKFLOW_FILE_WRITTEN", json!({"length": workflow.len()}));
        StepOutcome::Continue
    })
}

fn lpt_start_step<'a, 'p>(
    ctx: &'a mut ProgramContext<'p>,
    _prev: Option<&'a RunError>,
) -> BoxFuture<'a, StepOutcome> {
    Box::pin(async move {
        let p = ctx.programmer;
        if ctx.is_sol || !p.settings().lpt_enabled {
            return StepOutcome::Continue;
        }

        let pattern = &p.settings().lpt_file_pattern;
        let feature_file = p
            .state(|state| state.feature_file.clone())
            .unwrap_or_default();
        if !pattern.is_empty() && !feature_file.contains(pattern.as_str()) {
            return StepOutcome::Continue;
        }

        let Some(port) = p.services.lpt_port.clone() else {
            return StepOutcome::Skip(Some(RunError::code("LPT:UNAVAILABLE")));
        };

        let config = LptConfig::from_settings(p.settings());
        let mut lpt = LptIo::new(port, config);

        p.log(
            "LPT_STARTING",
            json!({
                "port": config.read_port,
                "bit": config.read_bit,
                "inverted": config.read_inverted,
            }),
        );

        if let Err(err) = lpt.start(&p.cancel_token()).await {
            return StepOutcome::Skip(Some(err));
        }

        ctx.lpt = Some(lpt);
        StepOutcome::Continue
    })
}

fn main_dispatch_step<'a, 'p>(
    ctx: &'a mut ProgramContext<'p>,
    _prev: Option<&'a RunError>,
) -> BoxFuture<'a, StepOutcome> {
    Box::pin(async move {
        let p = ctx.programmer;
        p.update_overall_progress(OVERALL_SETUP_PROGRESS, false);

        let has_program = p.state(|state| state.program.is_some());
        let has_feature = p.state(|state| state.feature.is_some());

        let backend = if !has_feature {
            None
        } else if ctx.is_sol {
            Some(ProgramBackend::Sol)
        } else if p.settings().supports_feature("gprs") && p.services.provisioner.is_some() {
            Some(ProgramBackend::Gprs)
        } else {
            Some(ProgramBackend::Generic)
        };

        let sampler = metrics_sampler(p);

        let dispatch = async {
            if has_program {
                let Some(tester) = ctx.tester.as_mut() else {
                    return Err(RunError::code("GLP2:TESTER_NOT_READY"));
                };
                tester.run(p, backend).await
            } else {
                let progress = |percent: f64| p.update_overall_progress(percent, true);
                let backend = if ctx.is_sol {
                    ProgramBackend::Sol
                } else {
                    backend.unwrap_or(ProgramBackend::Generic)
                };
                p.run_backend(backend, &progress).await
            }
        };

        let result = tokio::select! {
            result = dispatch => result,
            _ = sampler => unreachable!("metrics sampler never completes"),
        };

        match result {
            Ok(()) => StepOutcome::Continue,
            Err(err) => StepOutcome::Skip(Some(err)),
        }
    })
}

/// Poll the bench supply while the main dispatch runs, appending one
/// (set voltage, read voltage, current) sample per tick. Pends forever when
/// metrics are not being captured.
async fn metrics_sampler(p: &Programmer) {
    let Some(supply) = p.services.supply.clone() else {
        return futures::future::pending::<()>().await;
    };
    if p.state(|state| state.metrics.is_none()) {
        return futures::future::pending::<()>().await;
    }

    let mut ticker = tokio::time::interval(Duration::from_millis(250));
    loop {
        ticker.tick().await;
        let sample = { supply.lock().await.sample().await };
        match sample {
            Ok((u_set, u_get, i)) => p.append_metrics(u_set, u_get, i),
            Err(err) => debug!("[programmer] supply sample failed: {}", err),
        }
    }
}

fn acquire_service_tag_step<'a, 'p>(
    ctx: &'a mut ProgramContext<'p>,
    _prev: Option<&'a RunError>,
) -> BoxFuture<'a, StepOutcome> {
    Box::pin(async move {
        let p = ctx.programmer;
        if p.state(|state| state.input_mode != InputMode::Remote) {
            return StepOutcome::Continue;
        }

        p.update_overall_progress(92.0, false);
        p.log("ACQUIRING_SERVICE_TAG", json!({}));

        let request = p.state(|state| state.service_tag_request());
        match p.services.coordinator.acquire_service_tag(&request).await {
            Err(err) => StepOutcome::Skip(Some(RunError::with_message(
                "REMOTE_SERVICE_TAG_FAILURE",
                err.to_string(),
            ))),
            Ok(service_tag) => {
                if p.cancel_token().is_cancelled() {
                    // Acquired after the run was already cancelled: give the
                    // tag straight back.
                    p.services
                        .coordinator
                        .release_service_tag(
                            &request.result_id,
                            request.nc12.as_deref(),
                            &service_tag,
                        )
                        .await;
                    return StepOutcome::Skip(Some(RunError::cancelled()));
                }
                p.change_state(json!({"serviceTag": service_tag}));
                p.log("SERVICE_TAG_ACQUIRED", json!({"serviceTag": service_tag}));
                StepOutcome::Continue
            }
        }
    })
}

fn print_service_tag_step<'a, 'p>(
    ctx: &'a mut ProgramContext<'p>,
    _prev: Option<&'a RunError>,
) -> BoxFuture<'a, StepOutcome> {
    Box::pin(async move {
        let p = ctx.programmer;
        let should_print = p.state(|state| state.input_mode == InputMode::Remote)
            && p.settings().should_print_service_tag();
        if !should_print {
            return StepOutcome::Continue;
        }

        let Some(service_tag) = p.state(|state| state.service_tag.clone()) else {
            return StepOutcome::Continue;
        };

        p.update_overall_progress(97.0, false);
        p.log(
            "PRINTING_SERVICE_TAG",
            json!({"printerName": p.settings().service_tag_printer}),
        );

        if let Err(err) = p.services.printer.print(&service_tag).await {
            // Printing failures are logged, never fatal.
            p.log(
                "PRINTING_SERVICE_TAG_FAILURE",
                json!({"error": err.to_string()}),
            );
        }

        StepOutcome::Continue
    })
}

/// Render the workflow file: one `<option>=true|false` line per option.
fn build_workflow_file(settings: &Settings) -> (String, Vec<String>) {
    let options = [
        ("verify", settings.workflow_verify),
        ("identifyalways", settings.workflow_identify_always),
        ("multidevice", settings.workflow_multi_device),
        ("checkdevicemodel", settings.workflow_check_device_model),
        ("commissionall", settings.workflow_commission_all),
    ];

    let mut workflow = String::new();
    let mut enabled = Vec::new();
    for (option, value) in options {
        workflow.push_str(option);
        workflow.push('=');
        workflow.push_str(if value { "true" } else { "false" });
        workflow.push_str("\r\n");
        if value {
            enabled.push(option.to_string());
        }
    }
    (workflow, enabled)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::FsHistoryStore;

    fn programmer() -> Programmer {
        let dir = std::env::temp_dir().join("flashrig-test-store");
        let store = Arc::new(FsHistoryStore::new(
            dir.join("records"),
            dir.join("features"),
        ));
        Programmer::new(
            Arc::new(Settings::default()),
            Broker::new(),
            Services::offline(store),
        )
    }

    #[test]
    fn workflow_file_lines_encode_boolean_options() {
        let mut settings = Settings::default();
        settings.workflow_verify = true;
        settings.workflow_commission_all = true;

        let (workflow, enabled) = build_workflow_file(&settings);
        assert_eq!(
            workflow,
            "verify=true\r\nidentifyalways=false\r\nmultidevice=false\r\ncheckdevicemodel=false\r\ncommissionall=true\r\n"
        );
        assert_eq!(enabled, vec!["verify", "commissionall"]);
    }

    #[test]
    fn change_state_publishes_exactly_the_changed_keys() {
        let p = programmer();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let _sub = p
            .broker()
            .subscribe("programmer.stateChanged")
            .on_message(move |changes| {
                sink.lock().unwrap().push(changes.clone());
            });

        p.change_state(json!({"countdown": 5, "serviceTag": "T1"}));

        let events = seen.lock().unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0], json!({"countdown": 5, "serviceTag": "T1"}));
        assert_eq!(p.state(|state| state.countdown), 5);
        assert_eq!(
            p.state(|state| state.service_tag.clone()),
            Some("T1".to_string())
        );
    }

    #[test]
    fn request_cancel_publishes_once() {
        let p = programmer();
        let count = Arc::new(Mutex::new(0u32));
        let counted = Arc::clone(&count);
        let _sub = p
            .broker()
            .subscribe("programmer.cancelled")
            .on_message(move |_| {
                *counted.lock().unwrap() += 1;
            });

        p.request_cancel();
        p.request_cancel();
        assert_eq!(*count.lock().unwrap(), 1);
        assert!(p.cancel_token().is_cancelled());
    }

    #[tokio::test]
    async fn wait_for_continue_resumes_on_operator_continue() {
        let p = Arc::new(programmer());
        let waiter = Arc::clone(&p);
        let task = tokio::spawn(async move {
            waiter.wait_for_continue(WaitingReason::Vis).await
        });

        // Give the waiter time to install its subscription and state.
        for _ in 0..50 {
            if p.state(|state| state.waiting_for_continue.is_some()) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(
            p.state(|state| state.waiting_for_continue),
            Some(WaitingReason::Vis)
        );

        p.continue_run();
        task.await.unwrap().unwrap();
        assert_eq!(p.state(|state| state.waiting_for_continue), None);
    }

    #[tokio::test]
    async fn wait_for_continue_observes_cancellation() {
        let p = Arc::new(programmer());
        let waiter = Arc::clone(&p);
        let task = tokio::spawn(async move {
            waiter.wait_for_continue(WaitingReason::Test).await
        });

        for _ in 0..50 {
            if p.state(|state| state.waiting_for_continue.is_some()) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        p.request_cancel();
        let err = task.await.unwrap().unwrap_err();
        assert!(err.is_cancelled());
        assert_eq!(p.state(|state| state.waiting_for_continue), None);
    }
}
