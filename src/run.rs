//! Run record: the mutable state of one programming/testing attempt.
//!
//! Exactly one run record exists per station and it is owned by the
//! orchestrator; protocol engines only write back into it through the
//! orchestrator's update contract. A reset rebuilds the record for a new
//! attempt; finalization freezes the outcome, hashes file artifacts and hands
//! a snapshot to the history store.

use crate::program::{Program, ProgramKind, StepKind};
use crate::settings::Settings;
use chrono::Utc;
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};

/// Where the order/device selection came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum InputMode {
    Local,
    Remote,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum WorkMode {
    Programming,
    Testing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RunResult {
    Success,
    Failure,
}

/// Which sub-phase is blocked on an operator action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum WaitingReason {
    /// Manual wait step in a test program.
    Test,
    /// Visual check awaiting a pass/fail acknowledgement.
    Vis,
    /// Programming finished, waiting for the operator to continue.
    Programmed,
    /// Tester start gate before the first step.
    Glp2,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum StepStatus {
    Idle,
    Active,
    Success,
    Failure,
}

/// Per-step progress mirror entry, index-aligned with the bound program.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepProgress {
    pub status: StepStatus,
    /// 0..=100.
    pub progress: f64,
    pub value: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,
}

impl Default for StepProgress {
    fn default() -> Self {
        Self {
            status: StepStatus::Idle,
            progress: 0.0,
            value: 0.0,
            unit: None,
        }
    }
}

/// Partial update applied to one [`StepProgress`] entry.
#[derive(Debug, Clone, Default)]
pub struct StepProgressUpdate {
    pub status: Option<StepStatus>,
    pub progress: Option<f64>,
    pub value: Option<f64>,
    pub unit: Option<String>,
}

impl StepProgressUpdate {
    pub fn status(status: StepStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }

    pub fn active() -> Self {
        Self {
            status: Some(StepStatus::Active),
            progress: Some(0.0),
            ..Self::default()
        }
    }

    pub fn with_progress(mut self, progress: f64) -> Self {
        self.progress = Some(progress);
        self
    }

    pub fn with_value(mut self, value: f64) -> Self {
        self.value = Some(value);
        self
    }

    pub fn with_unit(mut self, unit: impl Into<String>) -> Self {
        self.unit = Some(unit.into());
        self
    }
}

/// Measurement kinds captured by the bench-supply sampler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MeasurementKind {
    SetVoltage,
    ReadVoltage,
    Current,
}

/// Append-only measurement history, present only when the bound program's
/// kind and the enabled feature set permit metrics capture.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Metrics {
    #[serde(rename = "uSet")]
    pub u_set: Vec<f64>,
    #[serde(rename = "uGet")]
    pub u_get: Vec<f64>,
    pub i: Vec<f64>,
}

impl Metrics {
    pub fn push(&mut self, kind: MeasurementKind, value: f64) {
        match kind {
            MeasurementKind::SetVoltage => self.u_set.push(value),
            MeasurementKind::ReadVoltage => self.u_get.push(value),
            MeasurementKind::Current => self.i.push(value),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum UnitStatus {
    Waiting,
    Checking,
    Checked,
    Failed,
}

/// One LED or HID lamp unit on the auxiliary checklist.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UnitCheck {
    pub nc12: String,
    pub name: String,
    pub serial_number: Option<String>,
    pub status: UnitStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum OrderItemKind {
    Program,
    Led,
    Hid,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderItem {
    pub kind: OrderItemKind,
    pub nc12: String,
    pub name: String,
    pub quantity_todo: u32,
}

/// Line items of one remotely coordinated order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteOrderData {
    #[serde(rename = "_id")]
    pub id: String,
    pub quantity_todo: u32,
    pub items: Vec<OrderItem>,
}

/// Production order shared by consecutive runs of the same `(no, quantity)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Order {
    #[serde(rename = "_id")]
    pub id: String,
    pub no: String,
    pub quantity: u32,
    pub started_at: i64,
    pub finished_at: Option<i64>,
    pub duration: Option<i64>,
    pub success_counter: u32,
    pub failure_counter: u32,
}

impl Order {
    pub fn new(started_at: i64, no: impl Into<String>, quantity: u32) -> Self {
        Self {
            id: to_base36(started_at as u128),
            no: no.into(),
            quantity,
            started_at,
            finished_at: None,
            duration: None,
            success_counter: 0,
            failure_counter: 0,
        }
    }

    pub fn is_same_order(&self, no: &str, quantity: u32) -> bool {
        self.no == no && self.quantity == quantity
    }
}

/// Structured log entry: event tag plus parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub time: i64,
    pub text: String,
    #[serde(flatten)]
    pub params: serde_json::Map<String, Value>,
}

/// Payload sent to the remote coordinator when acquiring a service tag.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceTagRequest {
    pub result_id: String,
    pub order_no: Option<String>,
    pub nc12: Option<String>,
    pub multi: bool,
    pub leds: Vec<ServiceTagLeds>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceTagLeds {
    pub nc12: String,
    pub serial_numbers: Vec<String>,
}

/// The mutable record of one programming/testing attempt.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunRecord {
    #[serde(rename = "_id")]
    pub id: Option<String>,
    pub input_mode: InputMode,
    pub work_mode: WorkMode,
    pub remote_data: Vec<RemoteOrderData>,
    pub selected_order_no: Option<String>,
    pub selected_nc12: Option<String>,

    pub order: Option<Order>,
    pub nc12: Option<String>,
    pub counter: u32,
    pub service_tag: Option<String>,

    pub started_at: Option<i64>,
    pub finished_at: Option<i64>,
    pub duration: Option<i64>,

    pub log: Option<Vec<LogEntry>>,
    pub result: Option<RunResult>,
    pub error_code: Option<String>,
    pub exception: Option<String>,
    /// Combined device-interaction transcript.
    pub output: Option<String>,

    pub feature_file: Option<String>,
    pub feature_file_name: Option<String>,
    pub feature_file_hash: Option<String>,
    pub feature: Option<String>,
    pub workflow_file: Option<String>,
    pub workflow: Option<String>,
    pub gprs_order_file: Option<String>,
    pub gprs_input_file: Option<String>,
    pub gprs_result_file: Option<String>,

    /// Seconds remaining before work starts, -1 when inactive.
    pub countdown: i64,
    pub program: Option<Program>,
    pub steps: Option<Vec<StepProgress>>,
    pub metrics: Option<Metrics>,
    pub leds: Vec<UnitCheck>,
    pub hids: Vec<UnitCheck>,

    pub waiting_for_leds: bool,
    pub waiting_for_continue: Option<WaitingReason>,
    pub in_progress: bool,
    pub overall_progress: f64,
}

impl Default for RunRecord {
    fn default() -> Self {
        Self {
            id: None,
            input_mode: InputMode::Local,
            work_mode: WorkMode::Programming,
            remote_data: Vec::new(),
            selected_order_no: None,
            selected_nc12: None,
            order: None,
            nc12: None,
            counter: 0,
            service_tag: None,
            started_at: None,
            finished_at: None,
            duration: None,
            log: None,
            result: None,
            error_code: None,
            exception: None,
            output: None,
            feature_file: None,
            feature_file_name: None,
            feature_file_hash: None,
            feature: None,
            workflow_file: None,
            workflow: None,
            gprs_order_file: None,
            gprs_input_file: None,
            gprs_result_file: None,
            countdown: -1,
            program: None,
            steps: None,
            metrics: None,
            leds: Vec::new(),
            hids: Vec::new(),
            waiting_for_leds: false,
            waiting_for_continue: None,
            in_progress: false,
            overall_progress: 0.0,
        }
    }
}

fn to_base36(mut value: u128) -> String {
    const DIGITS: &[u8; 36] = b"0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZ";
    if value == 0 {
        return "0".to_string();
    }
    let mut out = Vec::new();
    while value > 0 {
        out.push(DIGITS[(value % 36) as usize]);
        value /= 36;
    }
    out.reverse();
    String::from_utf8(out).unwrap_or_default()
}

impl RunRecord {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_in_progress(&self) -> bool {
        self.in_progress
    }

    pub fn is_finished(&self) -> bool {
        self.finished_at.is_some()
    }

    /// Generate the opaque, sortable run identifier: millisecond timestamp
    /// plus a random suffix, base-36, uppercase. Rough chronological ordering
    /// with an extremely low collision probability within a batch.
    fn generate_id(started_at: i64) -> String {
        let suffix: u32 = rand::thread_rng().gen_range(0..10_000_000);
        to_base36(started_at as u128 + suffix as u128)
    }

    pub fn get_selected_order_data(&self) -> Option<&RemoteOrderData> {
        let selected = self.selected_order_no.as_deref()?;
        self.remote_data.iter().find(|data| data.id == selected)
    }

    /// A remote order with LED line items only and no bound program.
    pub fn is_led_only(&self) -> bool {
        if self.program.is_some() {
            return false;
        }
        let Some(order_data) = self.get_selected_order_data() else {
            return false;
        };
        let mut programs = 0;
        let mut leds = 0;
        for item in &order_data.items {
            match item.kind {
                OrderItemKind::Program => programs += 1,
                OrderItemKind::Led => leds += 1,
                OrderItemKind::Hid => {}
            }
        }
        programs == 0 && leds > 0
    }

    pub fn has_program_step(&self, kind: StepKind) -> bool {
        self.program
            .as_ref()
            .map(|program| program.has_step_kind(kind))
            .unwrap_or(false)
    }

    /// Reset the record for a new attempt.
    pub fn reset(
        &mut self,
        settings: &Settings,
        order_no: Option<&str>,
        quantity: u32,
        nc12: Option<&str>,
    ) {
        let started_at = Utc::now().timestamp_millis();

        self.started_at = Some(started_at);
        self.id = Some(Self::generate_id(started_at));
        self.nc12 = nc12.map(str::to_string);
        self.service_tag = None;
        self.log = Some(Vec::new());
        self.finished_at = None;
        self.duration = None;
        self.result = None;
        self.error_code = None;
        self.exception = None;
        self.output = None;
        self.feature_file = None;
        self.feature_file_name = None;
        self.feature_file_hash = None;
        self.feature = None;
        self.workflow_file = None;
        self.workflow = None;
        self.gprs_order_file = None;
        self.gprs_input_file = None;
        self.gprs_result_file = None;
        self.countdown = -1;
        self.steps = None;
        self.metrics = None;
        self.leds = Vec::new();
        self.hids = Vec::new();

        self.set_up_program(settings);
        self.set_up_units(settings);

        self.waiting_for_leds = settings.leds_enabled > 0
            && settings.supports_feature("led")
            && !self.leds.is_empty();
        self.waiting_for_continue = None;
        self.in_progress = true;
        self.overall_progress = 1.0;

        match order_no {
            None => {
                self.order = None;
                self.counter = 0;
            }
            Some(no) => {
                let reuse = self
                    .order
                    .as_ref()
                    .map(|order| order.is_same_order(no, quantity))
                    .unwrap_or(false);

                if reuse {
                    let params = self
                        .order
                        .as_ref()
                        .map(|order| {
                            json!({
                                "orderNo": order.no,
                                "quantity": order.quantity,
                                "counter": self.counter + 1,
                            })
                        })
                        .unwrap_or_else(|| json!({}));
                    self.push_log(started_at, "ORDER_CONTINUED", params);
                } else {
                    let order = Order::new(started_at, no, quantity);
                    let params = json!({
                        "orderNo": order.no,
                        "quantity": order.quantity,
                    });
                    self.order = Some(order);
                    self.counter = 0;
                    self.push_log(started_at, "ORDER_CREATED", params);
                }
            }
        }

        if self.nc12.is_none() && self.waiting_for_leds && self.program.is_none() {
            self.push_log(started_at, "LED_CHECKING_STARTED", json!({}));
        } else {
            self.push_log(
                started_at,
                "PROGRAMMING_STARTED",
                json!({"nc12": self.nc12.as_deref().unwrap_or("-")}),
            );
        }
    }

    fn set_up_program(&mut self, settings: &Settings) {
        let Some(program) = &self.program else {
            return;
        };

        self.steps = Some(vec![StepProgress::default(); program.step_count()]);

        if program.kind == ProgramKind::T24vdc && settings.supports_feature("sdp") {
            self.metrics = Some(Metrics::default());
        }
    }

    fn set_up_units(&mut self, settings: &Settings) {
        if self.input_mode != InputMode::Remote {
            return;
        }
        let Some(order_data) = self.get_selected_order_data() else {
            return;
        };
        if order_data.quantity_todo == 0 {
            return;
        }

        let mut leds = Vec::new();
        let mut hids = Vec::new();

        for item in &order_data.items {
            let list = match item.kind {
                OrderItemKind::Led if settings.supports_feature("led") => &mut leds,
                OrderItemKind::Hid if settings.supports_feature("hid") => &mut hids,
                _ => continue,
            };
            let units_per_result = item.quantity_todo / order_data.quantity_todo;
            for _ in 0..units_per_result {
                list.push(UnitCheck {
                    nc12: item.nc12.clone(),
                    name: item.name.clone(),
                    serial_number: None,
                    status: UnitStatus::Waiting,
                });
            }
        }

        self.leds = leds;
        self.hids = hids;
    }

    pub fn push_log(&mut self, time: i64, text: &str, params: Value) {
        let params = match params {
            Value::Object(map) => map,
            Value::Null => serde_json::Map::new(),
            other => {
                let mut map = serde_json::Map::new();
                map.insert("value".to_string(), other);
                map
            }
        };
        if let Some(log) = self.log.as_mut() {
            log.push(LogEntry {
                time,
                text: text.to_string(),
                params,
            });
        }
    }

    /// Raise overall progress, clamped to 0..=100. Never decreases while the
    /// run is in progress.
    pub fn raise_overall_progress(&mut self, percent: f64) {
        let clamped = percent.clamp(0.0, 100.0);
        if clamped > self.overall_progress {
            self.overall_progress = clamped;
        }
    }

    /// Apply a partial update to one step-progress entry. Ignored when the
    /// run is idle, no program is bound or the index is out of range.
    pub fn apply_step_progress(&mut self, index: usize, update: &StepProgressUpdate) -> bool {
        if !self.in_progress {
            return false;
        }
        let Some(step) = self.steps.as_mut().and_then(|steps| steps.get_mut(index)) else {
            return false;
        };

        if let Some(status) = update.status {
            step.status = status;
        }
        if let Some(progress) = update.progress {
            step.progress = progress.clamp(0.0, 100.0);
        }
        if let Some(value) = update.value {
            step.value = value;
        }
        if let Some(unit) = &update.unit {
            step.unit = Some(unit.clone());
        }
        true
    }

    pub fn append_metric(&mut self, kind: MeasurementKind, value: f64) {
        if let Some(metrics) = self.metrics.as_mut() {
            metrics.push(kind, value);
        }
    }

    /// Hex SHA-256 digest of the feature file content, computed at
    /// finalization. `None` when no feature file was read.
    pub fn hash_feature_file(&mut self) -> Option<String> {
        self.feature_file_hash = self.feature.as_ref().map(|feature| {
            let mut hasher = Sha256::new();
            hasher.update(feature.as_bytes());
            format!("{:x}", hasher.finalize())
        });
        self.feature_file_hash.clone()
    }

    /// Data sent along with a service-tag acquisition.
    pub fn service_tag_request(&self) -> ServiceTagRequest {
        let mut groups: Vec<ServiceTagLeds> = Vec::new();
        for led in &self.leds {
            let index = match groups.iter().position(|group| group.nc12 == led.nc12) {
                Some(index) => index,
                None => {
                    groups.push(ServiceTagLeds {
                        nc12: led.nc12.clone(),
                        serial_numbers: Vec::new(),
                    });
                    groups.len() - 1
                }
            };
            if let Some(serial) = &led.serial_number {
                groups[index].serial_numbers.push(serial.clone());
            }
        }

        let multi = self
            .workflow
            .as_deref()
            .map(workflow_declares_multi_device)
            .unwrap_or(false);

        ServiceTagRequest {
            result_id: self.id.clone().unwrap_or_default(),
            order_no: self.order.as_ref().map(|order| order.no.clone()),
            nc12: self.nc12.clone(),
            multi,
            leds: groups,
        }
    }

    /// Full serialized state, published with the `finished` event and handed
    /// to the history store.
    pub fn snapshot(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

fn workflow_declares_multi_device(workflow: &str) -> bool {
    workflow.lines().any(|line| {
        let mut parts = line.splitn(2, '=');
        match (parts.next(), parts.next()) {
            (Some(key), Some(value)) => {
                key.trim().eq_ignore_ascii_case("multidevice")
                    && value.trim().eq_ignore_ascii_case("true")
            }
            _ => false,
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::program::Program;
    use serde_json::json;

    fn glp2_program() -> Program {
        Program::from_json(&json!({
            "_id": "PRG1",
            "name": "pe + wait",
            "type": "glp2",
            "steps": [
                {
                    "type": "pe",
                    "setValue": 0.2, "duration": 3, "directConnection": false,
                    "startOnTouch": false, "ipr": 10, "multi": false, "u": 12,
                    "buzzer": false, "setProbe": false, "retries": 0,
                    "cancelOnFailure": true, "enabled": true, "minSetValue": 0
                },
                {"type": "wait", "kind": "auto", "duration": 2, "enabled": true}
            ]
        }))
        .unwrap()
    }

    #[test]
    fn reset_without_order_starts_with_programming_log() {
        let settings = Settings::default();
        let mut run = RunRecord::new();
        run.reset(&settings, None, 0, Some("578901234567"));

        assert!(run.order.is_none());
        assert_eq!(run.counter, 0);
        assert!(run.in_progress);
        assert_eq!(run.overall_progress, 1.0);
        let log = run.log.as_ref().unwrap();
        assert_eq!(log[0].text, "PROGRAMMING_STARTED");
    }

    #[test]
    fn reset_with_same_order_reuses_it() {
        let settings = Settings::default();
        let mut run = RunRecord::new();
        run.reset(&settings, Some("100200300"), 10, Some("578901234567"));
        let first_order_id = run.order.as_ref().unwrap().id.clone();
        assert_eq!(run.log.as_ref().unwrap()[0].text, "ORDER_CREATED");

        run.counter = 3;
        run.reset(&settings, Some("100200300"), 10, Some("578901234567"));
        assert_eq!(run.order.as_ref().unwrap().id, first_order_id);
        assert_eq!(run.counter, 3);
        let log = run.log.as_ref().unwrap();
        assert_eq!(log[0].text, "ORDER_CONTINUED");
        assert_eq!(log[0].params["counter"], json!(4));
    }

    #[test]
    fn reset_with_different_order_replaces_it() {
        let settings = Settings::default();
        let mut run = RunRecord::new();
        run.reset(&settings, Some("100200300"), 10, None);
        run.counter = 7;
        run.reset(&settings, Some("100200300"), 25, None);

        assert_eq!(run.counter, 0);
        assert_eq!(run.order.as_ref().unwrap().quantity, 25);
        assert_eq!(run.log.as_ref().unwrap()[0].text, "ORDER_CREATED");
    }

    #[test]
    fn progress_mirror_matches_program_shape() {
        let settings = Settings::default();
        let mut run = RunRecord::new();
        run.program = Some(glp2_program());
        run.reset(&settings, None, 0, None);

        let steps = run.steps.as_ref().unwrap();
        assert_eq!(steps.len(), 2);
        for step in steps {
            assert_eq!(step.status, StepStatus::Idle);
            assert_eq!(step.progress, 0.0);
        }
        // Metrics require a t24vdc program and the sdp feature.
        assert!(run.metrics.is_none());
    }

    #[test]
    fn step_progress_requires_in_progress_run() {
        let settings = Settings::default();
        let mut run = RunRecord::new();
        run.program = Some(glp2_program());
        run.reset(&settings, None, 0, None);

        assert!(run.apply_step_progress(0, &StepProgressUpdate::active()));
        run.in_progress = false;
        assert!(!run.apply_step_progress(0, &StepProgressUpdate::status(StepStatus::Success)));
        assert_eq!(run.steps.as_ref().unwrap()[0].status, StepStatus::Active);
    }

    #[test]
    fn overall_progress_is_monotone() {
        let mut run = RunRecord::new();
        run.raise_overall_progress(10.0);
        run.raise_overall_progress(5.0);
        assert_eq!(run.overall_progress, 10.0);
        run.raise_overall_progress(250.0);
        assert_eq!(run.overall_progress, 100.0);
    }

    #[test]
    fn feature_hash_is_stable_hex_sha256() {
        let mut run = RunRecord::new();
        run.feature = Some("feature body".to_string());
        let hash = run.hash_feature_file().unwrap();
        assert_eq!(hash.len(), 64);
        assert_eq!(hash, run.hash_feature_file().unwrap());
        run.feature = None;
        assert!(run.hash_feature_file().is_none());
    }

    #[test]
    fn remote_reset_populates_unit_checklists() {
        let mut settings = Settings::default();
        settings.features = vec!["led".into(), "hid".into()];
        settings.leds_enabled = 1;

        let mut run = RunRecord::new();
        run.input_mode = InputMode::Remote;
        run.selected_order_no = Some("ORD1".to_string());
        run.remote_data = vec![RemoteOrderData {
            id: "ORD1".to_string(),
            quantity_todo: 5,
            items: vec![
                OrderItem {
                    kind: OrderItemKind::Led,
                    nc12: "578900000001".to_string(),
                    name: "LED module".to_string(),
                    quantity_todo: 10,
                },
                OrderItem {
                    kind: OrderItemKind::Hid,
                    nc12: "578900000002".to_string(),
                    name: "HID lamp".to_string(),
                    quantity_todo: 5,
                },
            ],
        }];

        run.reset(&settings, Some("ORD1"), 5, None);

        assert_eq!(run.leds.len(), 2);
        assert_eq!(run.hids.len(), 1);
        assert!(run.waiting_for_leds);
        assert!(run
            .leds
            .iter()
            .all(|led| led.status == UnitStatus::Waiting && led.serial_number.is_none()));
    }

    #[test]
    fn service_tag_request_detects_multi_device_workflow() {
        let mut run = RunRecord::new();
        run.id = Some("RUN1".to_string());
        run.workflow = Some("verify=false\r\nmultidevice=true\r\n".to_string());
        run.leds = vec![
            UnitCheck {
                nc12: "578900000001".to_string(),
                name: "LED".to_string(),
                serial_number: Some("SN1".to_string()),
                status: UnitStatus::Checked,
            },
            UnitCheck {
                nc12: "578900000001".to_string(),
                name: "LED".to_string(),
                serial_number: None,
                status: UnitStatus::Waiting,
            },
        ];

        let request = run.service_tag_request();
        assert!(request.multi);
        assert_eq!(request.leds.len(), 1);
        assert_eq!(request.leds[0].serial_numbers, vec!["SN1"]);
    }

    #[test]
    fn base36_ids_are_uppercase_and_sortable() {
        let earlier = RunRecord::generate_id(1_600_000_000_000);
        let later = RunRecord::generate_id(1_700_000_000_000);
        assert!(earlier.chars().all(|c| c.is_ascii_uppercase() || c.is_ascii_digit()));
        assert!(later > earlier);
    }
}
