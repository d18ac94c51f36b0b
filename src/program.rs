//! Test/programming programs and their typed steps.
//!
//! A [`Program`] is an ordered, immutable list of typed steps bound to a run
//! at start time. Steps form a closed sum type over the supported kinds;
//! every variant validates its own parameters at construction time (numeric
//! ranges, enum membership). Validation failure is fatal to program loading,
//! never to a run: a program that deserializes but fails [`Program::validate`]
//! is rejected before it can be bound.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug, PartialEq)]
pub enum ProgramError {
    #[error("program is malformed: {0}")]
    Malformed(String),

    #[error("program has no steps")]
    Empty,

    #[error("step {index} ({kind}): {field} must be within [{min}, {max}], got {value}")]
    OutOfRange {
        index: usize,
        kind: &'static str,
        field: &'static str,
        min: f64,
        max: f64,
        value: f64,
    },

    #[error("step {index} ({kind}): {field} must be one of {allowed:?}, got {value}")]
    InvalidChoice {
        index: usize,
        kind: &'static str,
        field: &'static str,
        allowed: &'static [u32],
        value: u32,
    },
}

/// Program family. Determines both the execution engine and whether the
/// bench-supply metrics sampler may run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProgramKind {
    /// 24 V DC driver programs executed through the generic programmer with
    /// bench-supply metrics capture.
    #[serde(rename = "t24vdc")]
    T24vdc,
    /// Electrical test programs executed on the GLP2 tester.
    #[serde(rename = "glp2")]
    Glp2,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Program {
    #[serde(rename = "_id")]
    pub id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub kind: ProgramKind,
    #[serde(default)]
    pub updated_at: Option<i64>,
    pub steps: Vec<ProgramStep>,
}

impl Program {
    /// Deserialize and validate a program. Any invalid step parameter rejects
    /// the whole program.
    pub fn from_json(value: &serde_json::Value) -> Result<Program, ProgramError> {
        let program: Program = serde_json::from_value(value.clone())
            .map_err(|err| ProgramError::Malformed(err.to_string()))?;
        program.validate()?;
        Ok(program)
    }

    pub fn validate(&self) -> Result<(), ProgramError> {
        if self.steps.is_empty() {
            return Err(ProgramError::Empty);
        }
        for (index, step) in self.steps.iter().enumerate() {
            step.validate(index)?;
        }
        Ok(())
    }

    pub fn step_count(&self) -> usize {
        self.steps.len()
    }

    /// Enabled steps with their original index in the program.
    pub fn enabled_steps(&self) -> impl Iterator<Item = (usize, &ProgramStep)> {
        self.steps
            .iter()
            .enumerate()
            .filter(|(_, step)| step.enabled())
    }

    pub fn has_step_kind(&self, kind: StepKind) -> bool {
        self.steps
            .iter()
            .any(|step| step.enabled() && step.kind() == kind)
    }
}

/// Discriminant of a program step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StepKind {
    #[serde(rename = "pe")]
    Pe,
    #[serde(rename = "iso")]
    Iso,
    #[serde(rename = "fn")]
    Fn,
    #[serde(rename = "vis")]
    Vis,
    #[serde(rename = "wait")]
    Wait,
    #[serde(rename = "program")]
    Program,
}

impl StepKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StepKind::Pe => "pe",
            StepKind::Iso => "iso",
            StepKind::Fn => "fn",
            StepKind::Vis => "vis",
            StepKind::Wait => "wait",
            StepKind::Program => "program",
        }
    }
}

/// One typed program step. Closed over the supported kinds; dispatch is by
/// exhaustive matching.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ProgramStep {
    #[serde(rename = "pe")]
    Pe(PeStep),
    #[serde(rename = "iso")]
    Iso(IsoStep),
    #[serde(rename = "fn")]
    Fn(FnStep),
    #[serde(rename = "vis")]
    Vis(VisStep),
    #[serde(rename = "wait")]
    Wait(WaitStep),
    #[serde(rename = "program")]
    Program(ProgrammingStep),
}

impl ProgramStep {
    pub fn kind(&self) -> StepKind {
        match self {
            ProgramStep::Pe(_) => StepKind::Pe,
            ProgramStep::Iso(_) => StepKind::Iso,
            ProgramStep::Fn(_) => StepKind::Fn,
            ProgramStep::Vis(_) => StepKind::Vis,
            ProgramStep::Wait(_) => StepKind::Wait,
            ProgramStep::Program(_) => StepKind::Program,
        }
    }

    pub fn enabled(&self) -> bool {
        match self {
            ProgramStep::Pe(step) => step.enabled,
            ProgramStep::Iso(step) => step.enabled,
            ProgramStep::Fn(step) => step.enabled,
            ProgramStep::Vis(step) => step.enabled,
            ProgramStep::Wait(step) => step.enabled,
            ProgramStep::Program(step) => step.enabled,
        }
    }

    pub fn label(&self) -> &str {
        match self {
            ProgramStep::Pe(step) => &step.label,
            ProgramStep::Iso(step) => &step.label,
            ProgramStep::Fn(step) => &step.label,
            ProgramStep::Vis(step) => &step.label,
            ProgramStep::Wait(step) => &step.label,
            ProgramStep::Program(step) => &step.label,
        }
    }

    /// Declared total duration, used to convert interim elapsed time into a
    /// 0..=100 progress percentage.
    pub fn total_time(&self) -> Duration {
        match self {
            ProgramStep::Pe(step) => Duration::from_secs_f64(step.duration),
            ProgramStep::Iso(step) => Duration::from_secs_f64(step.duration),
            ProgramStep::Fn(step) => Duration::from_secs_f64(step.start_time + step.duration),
            ProgramStep::Vis(step) => {
                if step.max_duration > 0.0 {
                    Duration::from_secs_f64(step.max_duration)
                } else {
                    Duration::from_secs_f64(step.duration * 2.0)
                }
            }
            ProgramStep::Wait(step) => match step.kind {
                WaitKind::Auto => Duration::from_secs_f64(step.duration),
                WaitKind::Manual => Duration::ZERO,
            },
            // Programming windows are bounded by the backend, not the tester.
            ProgramStep::Program(_) => Duration::from_secs(120),
        }
    }

    pub fn validate(&self, index: usize) -> Result<(), ProgramError> {
        match self {
            ProgramStep::Pe(step) => step.validate(index),
            ProgramStep::Iso(step) => step.validate(index),
            ProgramStep::Fn(step) => step.validate(index),
            ProgramStep::Vis(step) => step.validate(index),
            ProgramStep::Wait(step) => step.validate(index),
            ProgramStep::Program(_) => Ok(()),
        }
    }
}

fn check_range(
    index: usize,
    kind: &'static str,
    field: &'static str,
    value: f64,
    min: f64,
    max: f64,
) -> Result<(), ProgramError> {
    if !value.is_finite() || value < min || value > max {
        return Err(ProgramError::OutOfRange {
            index,
            kind,
            field,
            min,
            max,
            value,
        });
    }
    Ok(())
}

fn check_choice(
    index: usize,
    kind: &'static str,
    field: &'static str,
    value: u32,
    allowed: &'static [u32],
) -> Result<(), ProgramError> {
    if !allowed.contains(&value) {
        return Err(ProgramError::InvalidChoice {
            index,
            kind,
            field,
            allowed,
            value,
        });
    }
    Ok(())
}

/// Protective-earth continuity test.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeStep {
    #[serde(default)]
    pub label: String,
    /// Resistance limit in ohms.
    pub set_value: f64,
    /// Dwell in seconds.
    pub duration: f64,
    pub direct_connection: bool,
    pub start_on_touch: bool,
    /// Test current in amps.
    pub ipr: f64,
    pub multi: bool,
    /// Probe voltage, 6 V or 12 V.
    pub u: u32,
    pub buzzer: bool,
    pub set_probe: bool,
    pub retries: u32,
    pub cancel_on_failure: bool,
    pub enabled: bool,
    pub min_set_value: f64,
}

impl PeStep {
    fn validate(&self, index: usize) -> Result<(), ProgramError> {
        check_range(index, "pe", "setValue", self.set_value, 0.01, 3.0)?;
        check_range(index, "pe", "duration", self.duration, 0.0, 60.0)?;
        check_range(index, "pe", "ipr", self.ipr, 10.0, 30.0)?;
        check_choice(index, "pe", "u", self.u, &[6, 12])?;
        check_range(index, "pe", "retries", self.retries as f64, 0.0, 5.0)?;
        check_range(index, "pe", "minSetValue", self.min_set_value, 0.0, 2.0)
    }
}

/// Insulation resistance test.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IsoStep {
    #[serde(default)]
    pub label: String,
    /// Resistance limit in megaohms.
    pub set_value: f64,
    pub duration: f64,
    /// Test voltage, 250 V or 500 V.
    pub u: u32,
    /// Ramp-up in seconds.
    pub ramp_time: f64,
    pub multi: bool,
    pub retries: u32,
    pub cancel_on_failure: bool,
    pub enabled: bool,
    pub min_set_value: f64,
}

impl IsoStep {
    fn validate(&self, index: usize) -> Result<(), ProgramError> {
        check_range(index, "iso", "setValue", self.set_value, 0.01, 100.0)?;
        check_range(index, "iso", "duration", self.duration, 0.0, 60.0)?;
        check_choice(index, "iso", "u", self.u, &[250, 500])?;
        check_range(index, "iso", "rampTime", self.ramp_time, 0.0, 10.0)?;
        check_range(index, "iso", "retries", self.retries as f64, 0.0, 5.0)?;
        check_range(index, "iso", "minSetValue", self.min_set_value, 0.0, 100.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Execution {
    Auto,
    Manual,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum FctMode {
    Normal,
    VisualCheck,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum VisMode {
    Normal,
    Inverted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RsvChannel {
    #[serde(rename = "l1-n")]
    L1N,
    #[serde(rename = "l2-n")]
    L2N,
    #[serde(rename = "l3-n")]
    L3N,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Trigger {
    StartTime,
    Touch,
}

/// Functional test under mains voltage, optionally with a required minimum
/// fluorescent-lamp illumination duration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FnStep {
    #[serde(default)]
    pub label: String,
    /// Expected current draw in amps.
    pub set_value: f64,
    pub lower_tolerance_rel: f64,
    pub upper_tolerance_rel: f64,
    pub lower_tolerance_abs: f64,
    pub upper_tolerance_abs: f64,
    /// Settling time before metering starts, in seconds.
    pub start_time: f64,
    pub duration: f64,
    pub execution: Execution,
    pub range: u32,
    /// Supply voltage in volts.
    pub voltage: f64,
    pub correction: bool,
    pub mode: FctMode,
    pub leave_on: bool,
    pub u_tolerance: f64,
    pub retries: u32,
    pub cancel_on_failure: bool,
    pub vis_mode: VisMode,
    pub go_input: u32,
    pub no_go_input: u32,
    pub rsv_channel: RsvChannel,
    pub rsv_number: u32,
    pub multi: bool,
    pub trigger: Trigger,
    /// Number of fluorescent-lamp inputs that must light up during the step.
    #[serde(default)]
    pub lamp_count: u32,
    /// Required cumulative on-time per lamp, in seconds.
    #[serde(default)]
    pub lamp_duration: f64,
    pub enabled: bool,
}

impl FnStep {
    fn validate(&self, index: usize) -> Result<(), ProgramError> {
        check_range(index, "fn", "setValue", self.set_value, 0.0, 16.0)?;
        check_range(index, "fn", "lowerToleranceRel", self.lower_tolerance_rel, 0.0, 100.0)?;
        check_range(index, "fn", "upperToleranceRel", self.upper_tolerance_rel, 0.0, 100.0)?;
        check_range(index, "fn", "lowerToleranceAbs", self.lower_tolerance_abs, 0.0, 999.0)?;
        check_range(index, "fn", "upperToleranceAbs", self.upper_tolerance_abs, 0.0, 999.0)?;
        check_range(index, "fn", "startTime", self.start_time, 0.0, 60.0)?;
        check_range(index, "fn", "duration", self.duration, 0.0, 999.0)?;
        check_range(index, "fn", "range", self.range as f64, 0.0, 3.0)?;
        check_range(index, "fn", "voltage", self.voltage, 0.0, 400.0)?;
        check_range(index, "fn", "uTolerance", self.u_tolerance, 0.0, 100.0)?;
        check_range(index, "fn", "retries", self.retries as f64, 0.0, 5.0)?;
        check_range(index, "fn", "goInput", self.go_input as f64, 0.0, 8.0)?;
        check_range(index, "fn", "noGoInput", self.no_go_input as f64, 0.0, 8.0)?;
        check_range(index, "fn", "rsvNumber", self.rsv_number as f64, 1.0, 9.0)?;
        check_choice(index, "fn", "lampCount", self.lamp_count, &[0, 1, 2])?;
        check_range(index, "fn", "lampDuration", self.lamp_duration, 0.0, 999.0)
    }
}

/// Visual pass/fail check acknowledged by the operator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VisStep {
    #[serde(default)]
    pub label: String,
    /// Delay before the operator prompt appears, in seconds.
    pub duration: f64,
    /// Hard upper bound on the whole step, in seconds.
    pub max_duration: f64,
    pub mode: VisMode,
    pub go_input: u32,
    pub no_go_input: u32,
    pub cancel_on_failure: bool,
    pub enabled: bool,
}

impl VisStep {
    fn validate(&self, index: usize) -> Result<(), ProgramError> {
        check_range(index, "vis", "duration", self.duration, 0.0, 3600.0)?;
        check_range(index, "vis", "maxDuration", self.max_duration, 0.0, 86_400.0)?;
        check_range(index, "vis", "goInput", self.go_input as f64, 0.0, 8.0)?;
        check_range(index, "vis", "noGoInput", self.no_go_input as f64, 0.0, 8.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum WaitKind {
    /// Timer-only pause.
    Auto,
    /// Pause acknowledged by the operator.
    Manual,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WaitStep {
    #[serde(default)]
    pub label: String,
    pub kind: WaitKind,
    /// Seconds. Ignored for manual waits.
    pub duration: f64,
    pub enabled: bool,
}

impl WaitStep {
    fn validate(&self, index: usize) -> Result<(), ProgramError> {
        check_range(index, "wait", "duration", self.duration, 0.0, 86_400.0)?;
        if self.kind == WaitKind::Auto && self.duration < 1.0 {
            return Err(ProgramError::OutOfRange {
                index,
                kind: "wait",
                field: "duration",
                min: 1.0,
                max: 86_400.0,
                value: self.duration,
            });
        }
        Ok(())
    }
}

/// Device programming delegated to one of the programming backends.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgrammingStep {
    #[serde(default)]
    pub label: String,
    pub enabled: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn pe_step_json(set_value: f64) -> serde_json::Value {
        json!({
            "type": "pe",
            "label": "PE",
            "setValue": set_value,
            "duration": 3,
            "directConnection": false,
            "startOnTouch": false,
            "ipr": 10,
            "multi": false,
            "u": 12,
            "buzzer": false,
            "setProbe": false,
            "retries": 0,
            "cancelOnFailure": true,
            "enabled": true,
            "minSetValue": 0
        })
    }

    fn program_json(steps: Vec<serde_json::Value>) -> serde_json::Value {
        json!({
            "_id": "PRG1",
            "name": "test program",
            "type": "glp2",
            "steps": steps
        })
    }

    #[test]
    fn valid_program_loads() {
        let program = Program::from_json(&program_json(vec![pe_step_json(0.2)])).unwrap();
        assert_eq!(program.step_count(), 1);
        assert_eq!(program.steps[0].kind(), StepKind::Pe);
        assert_eq!(program.steps[0].total_time(), Duration::from_secs(3));
    }

    #[test]
    fn out_of_range_parameter_rejects_the_program() {
        let err = Program::from_json(&program_json(vec![pe_step_json(5.0)])).unwrap_err();
        assert!(matches!(
            err,
            ProgramError::OutOfRange {
                field: "setValue",
                ..
            }
        ));
    }

    #[test]
    fn invalid_enum_member_rejects_the_program() {
        let mut step = pe_step_json(0.2);
        step["u"] = json!(24);
        let err = Program::from_json(&program_json(vec![step])).unwrap_err();
        assert!(matches!(err, ProgramError::InvalidChoice { field: "u", .. }));
    }

    #[test]
    fn empty_program_is_rejected() {
        let err = Program::from_json(&program_json(vec![])).unwrap_err();
        assert_eq!(err, ProgramError::Empty);
    }

    #[test]
    fn auto_wait_requires_a_duration() {
        let wait = json!({
            "type": "wait",
            "kind": "auto",
            "duration": 0,
            "enabled": true
        });
        let err = Program::from_json(&program_json(vec![wait])).unwrap_err();
        assert!(matches!(err, ProgramError::OutOfRange { kind: "wait", .. }));
    }

    #[test]
    fn enabled_steps_keep_program_indexes() {
        let mut disabled = pe_step_json(0.2);
        disabled["enabled"] = json!(false);
        let wait = json!({
            "type": "wait",
            "kind": "auto",
            "duration": 2,
            "enabled": true
        });
        let program = Program::from_json(&program_json(vec![disabled, wait])).unwrap();

        let enabled: Vec<usize> = program.enabled_steps().map(|(i, _)| i).collect();
        assert_eq!(enabled, vec![1]);
        assert!(program.has_step_kind(StepKind::Wait));
        assert!(!program.has_step_kind(StepKind::Pe));
    }
}
