//! End-to-end tester execution through the orchestrator.
//!
//! A behavioral mock of the tester link answers command frames with ACK,
//! serves scripted actual-value responses once the test is started and
//! emits the final record after a visual-check acknowledgement, which is
//! enough to drive both execution strategies without hardware.

use async_trait::async_trait;
use flashrig::broker::{Broker, Subscription};
use flashrig::error::RigResult;
use flashrig::glp2::{build_frame, TesterLink, TesterManager, WireEvent, ACK, ETX, STX};
use flashrig::program::Program;
use flashrig::programmer::{ProgramRequest, Programmer, Services, TesterHandle};
use flashrig::run::{RunResult, StepStatus};
use flashrig::services::FsHistoryStore;
use flashrig::settings::Settings;
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

#[derive(Default)]
struct LinkState {
    poll_script: VecDeque<WireEvent>,
    final_after_ack: Option<WireEvent>,
    sent_payloads: Vec<String>,
    started: bool,
    vis_acked: bool,
    last_was_poll: bool,
}

#[derive(Clone)]
struct BenchLink {
    state: Arc<Mutex<LinkState>>,
}

impl BenchLink {
    fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(LinkState::default())),
        }
    }

    fn frame(payload: &str) -> WireEvent {
        WireEvent::Frame(build_frame(payload))
    }

    fn push_poll_response(&self, event: WireEvent) {
        self.state.lock().unwrap().poll_script.push_back(event);
    }

    fn set_final_after_ack(&self, payload: &str) {
        self.state.lock().unwrap().final_after_ack = Some(Self::frame(payload));
    }

    fn sent_payloads(&self) -> Vec<String> {
        self.state.lock().unwrap().sent_payloads.clone()
    }
}

#[async_trait]
impl TesterLink for BenchLink {
    async fn send(&mut self, bytes: &[u8]) -> RigResult<()> {
        let mut state = self.state.lock().unwrap();
        if bytes.len() == 3 && bytes[0] == STX && bytes[2] == ACK {
            state.last_was_poll = true;
            return Ok(());
        }
        state.last_was_poll = false;

        if bytes.first() == Some(&STX) && bytes.last() == Some(&ETX) {
            let payload = String::from_utf8_lossy(&bytes[1..bytes.len() - 1]).into_owned();
            if payload == "ST" {
                state.started = true;
            }
            if payload.starts_with("QA;") {
                state.vis_acked = true;
            }
            state.sent_payloads.push(payload);
        }
        Ok(())
    }

    async fn recv(&mut self) -> RigResult<WireEvent> {
        tokio::task::yield_now().await;
        let mut state = self.state.lock().unwrap();

        if !state.last_was_poll {
            return Ok(WireEvent::Ack);
        }
        if !state.started {
            return Ok(WireEvent::Nak);
        }
        if let Some(event) = state.poll_script.pop_front() {
            return Ok(event);
        }
        if state.vis_acked {
            if let Some(event) = state.final_after_ack.take() {
                return Ok(event);
            }
        }
        Ok(WireEvent::Nak)
    }
}

fn wait_program(duration: f64) -> Program {
    Program::from_json(&json!({
        "_id": "PRG-WAIT",
        "name": "wait only",
        "type": "glp2",
        "steps": [
            {"type": "wait", "kind": "auto", "duration": duration, "enabled": true}
        ]
    }))
    .expect("valid program")
}

fn pe_program() -> Program {
    Program::from_json(&json!({
        "_id": "PRG-PE",
        "name": "pe only",
        "type": "glp2",
        "steps": [{
            "type": "pe",
            "setValue": 0.2, "duration": 3, "directConnection": false,
            "startOnTouch": false, "ipr": 10, "multi": false, "u": 12,
            "buzzer": false, "setProbe": false, "retries": 0,
            "cancelOnFailure": true, "enabled": true, "minSetValue": 0
        }]
    }))
    .expect("valid program")
}

fn glp2_settings(all_in_one: bool) -> Settings {
    let mut settings = Settings::default();
    settings.features = vec!["glp2".into()];
    settings.glp2_all_in_one = all_in_one;
    settings
}

fn station(mut settings: Settings, program: Program) -> (Arc<Programmer>, tempfile::TempDir) {
    let dir = tempfile::tempdir().expect("tempdir");
    let feature_dir = dir.path().join("features");
    std::fs::create_dir_all(&feature_dir).expect("feature dir");
    std::fs::write(feature_dir.join("578901234567.xml"), "<feature/>").expect("feature file");

    settings.feature_path1 = Some(feature_dir.to_string_lossy().into_owned());
    settings.workflow_file = Some(dir.path().join("workflow.txt").to_string_lossy().into_owned());

    let store = Arc::new(FsHistoryStore::new(
        dir.path().join("records"),
        dir.path().join("featuredb"),
    ));
    let programmer = Arc::new(Programmer::new(
        Arc::new(settings),
        Broker::new(),
        Services::offline(store),
    ));
    programmer.bind_program(Some(program)).expect("bind program");
    (programmer, dir)
}

fn request() -> ProgramRequest {
    ProgramRequest {
        order_no: Some("100200300".to_string()),
        quantity: 10,
        nc12: Some("578901234567".to_string()),
    }
}

/// Clear every operator gate as soon as it appears.
fn auto_continue(programmer: &Arc<Programmer>) -> Subscription {
    let station = Arc::clone(programmer);
    programmer
        .broker()
        .subscribe("programmer.stateChanged")
        .set_filter(|changes| matches!(changes.get("waitingForContinue"), Some(Value::String(_))))
        .on_message(move |_| station.continue_run())
}

fn step_status(programmer: &Programmer, index: usize) -> (StepStatus, f64) {
    programmer.state(|state| {
        let step = &state.steps.as_ref().expect("steps mirror")[index];
        (step.status, step.progress)
    })
}

#[tokio::test]
async fn aio_auto_wait_reaches_completion_only_after_its_duration() {
    let (programmer, _dir) = station(glp2_settings(true), wait_program(2.0));
    let link = BenchLink::new();
    link.set_final_after_ack("EW;1;0;1,1");
    let mut manager = TesterManager::new(link.clone(), 1);

    let started = Instant::now();
    programmer
        .program(Some(&mut manager as &mut dyn TesterHandle), request())
        .await
        .expect("run succeeds");

    assert!(
        started.elapsed() >= Duration::from_millis(2000),
        "wait step completed after {:?}",
        started.elapsed()
    );
    assert_eq!(step_status(&programmer, 0), (StepStatus::Success, 100.0));
    assert_eq!(
        programmer.state(|state| state.result),
        Some(RunResult::Success)
    );
    assert_eq!(programmer.state(|state| state.overall_progress), 100.0);
}

#[tokio::test]
async fn per_step_test_succeeds_and_submits_the_step_record() {
    let (programmer, _dir) = station(glp2_settings(false), pe_program());
    let _gate = auto_continue(&programmer);

    let link = BenchLink::new();
    link.push_poll_response(BenchLink::frame("AW;1;1500;0.21;Ohm;0;;-1"));
    link.push_poll_response(BenchLink::frame("EW;1;0;1,1,0.20,0.15,0.00,0.00"));
    let mut manager = TesterManager::new(link.clone(), 1);

    programmer
        .program(Some(&mut manager as &mut dyn TesterHandle), request())
        .await
        .expect("run succeeds");

    assert_eq!(step_status(&programmer, 0), (StepStatus::Success, 100.0));

    let payloads = link.sent_payloads();
    assert!(payloads.iter().any(|p| p.starts_with("TP;pe only;1")));
    assert!(payloads.iter().any(|p| p.starts_with("S9-1_0.20_3000_")));
}

#[tokio::test]
async fn failed_evaluation_reports_both_channels() {
    let (programmer, _dir) = station(glp2_settings(false), pe_program());
    let _gate = auto_continue(&programmer);

    let link = BenchLink::new();
    link.push_poll_response(BenchLink::frame("EW;1;0;1,0,0.20,0.35,0.00,0.00"));
    let mut manager = TesterManager::new(link.clone(), 1);

    let err = programmer
        .program(Some(&mut manager as &mut dyn TesterHandle), request())
        .await
        .expect_err("run fails");

    assert_eq!(err.code, "GLP2:TEST_STEP_FAILURE");
    assert!(err.message.as_deref().unwrap_or("").contains("0.35"));
    assert_eq!(step_status(&programmer, 0).0, StepStatus::Failure);
    assert_eq!(
        programmer.state(|state| state.error_code.clone()),
        Some("GLP2:TEST_STEP_FAILURE".to_string())
    );
}

#[tokio::test]
async fn completed_response_without_results_is_a_panel_abort() {
    let (programmer, _dir) = station(glp2_settings(false), pe_program());
    let _gate = auto_continue(&programmer);

    let link = BenchLink::new();
    link.push_poll_response(BenchLink::frame("EW;1;0"));
    let mut manager = TesterManager::new(link.clone(), 1);

    let err = programmer
        .program(Some(&mut manager as &mut dyn TesterHandle), request())
        .await
        .expect_err("run fails");
    assert_eq!(err.code, "GLP2:FAULT:CANCELLED");
}

#[tokio::test]
async fn device_fault_status_is_carried_in_the_error_code() {
    let (programmer, _dir) = station(glp2_settings(false), pe_program());
    let _gate = auto_continue(&programmer);

    let link = BenchLink::new();
    link.push_poll_response(BenchLink::frame("EW;1;4"));
    let mut manager = TesterManager::new(link.clone(), 1);

    let err = programmer
        .program(Some(&mut manager as &mut dyn TesterHandle), request())
        .await
        .expect_err("run fails");
    assert_eq!(err.code, "GLP2:FAULT:4");
}

#[tokio::test]
async fn missing_license_rejects_testing() {
    let mut settings = glp2_settings(false);
    settings.features.clear();
    let (programmer, _dir) = station(settings, pe_program());

    let link = BenchLink::new();
    let mut manager = TesterManager::new(link, 1);

    let err = programmer
        .program(Some(&mut manager as &mut dyn TesterHandle), request())
        .await
        .expect_err("run fails");
    assert_eq!(err.code, "GLP2:FEATURE_DISABLED");
}

#[tokio::test]
async fn cancellation_during_polling_finalizes_with_cancelled() {
    let (programmer, _dir) = station(glp2_settings(false), pe_program());
    let _gate = auto_continue(&programmer);

    // No scripted responses: the monitor keeps polling NAKs forever.
    let link = BenchLink::new();
    let mut manager = TesterManager::new(link, 1);

    let station = Arc::clone(&programmer);
    let run = tokio::spawn(async move {
        station
            .program(Some(&mut manager as &mut dyn TesterHandle), request())
            .await
    });

    tokio::time::sleep(Duration::from_millis(300)).await;
    programmer.request_cancel();

    let err = run.await.expect("task").expect_err("run fails");
    assert!(err.is_cancelled());
    assert_eq!(
        programmer.state(|state| state.error_code.clone()),
        Some("CANCELLED".to_string())
    );
    assert_eq!(
        programmer.state(|state| state.result),
        Some(RunResult::Failure)
    );
    assert!(!programmer.is_in_progress());
    assert_eq!(programmer.state(|state| state.overall_progress), 100.0);
}
