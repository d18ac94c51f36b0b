//! Parsing of tester actual-value records.
//!
//! Two record kinds arrive while a test runs: interim actual values (`AW`)
//! reporting elapsed time and live readings for one step, and final actual
//! values (`EW`) carrying the completion flag, the device fault status and
//! per-step results. Anything else is an unexpected response.

use super::UNEXPECTED_RESPONSE;
use crate::error::RunError;
use std::fmt;

/// Device fault classification attached to `GLP2:FAULT:` error codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultStatus {
    /// Operator cancelled the test on the instrument's own panel.
    Cancelled,
    /// Raw device fault status.
    Code(u32),
}

impl fmt::Display for FaultStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FaultStatus::Cancelled => f.write_str("CANCELLED"),
            FaultStatus::Code(code) => write!(f, "{}", code),
        }
    }
}

impl FaultStatus {
    /// Stable error code string for a final response carrying this fault.
    pub fn error_code(&self) -> String {
        format!("GLP2:FAULT:{}", self)
    }
}

/// Partial progress of the step currently executing on the tester.
#[derive(Debug, Clone, PartialEq)]
pub struct InterimActualValues {
    /// 1-based step number within the submitted program.
    pub step_number: u32,
    /// Elapsed time within the step, in milliseconds.
    pub time_ms: u64,
    pub value1: f64,
    pub unit1: String,
    pub value2: f64,
    pub unit2: String,
    /// Live evaluation flag; -1 when not yet decided.
    pub evaluation: i32,
}

impl InterimActualValues {
    /// Synthetic interim record for steps the instrument emits no progress
    /// for (visual checks and waits).
    pub fn placeholder(step_number: u32) -> Self {
        Self {
            step_number,
            time_ms: 0,
            value1: 0.0,
            unit1: String::new(),
            value2: 0.0,
            unit2: String::new(),
            evaluation: -1,
        }
    }
}

/// Result of one completed step inside a final actual-values record.
#[derive(Debug, Clone, PartialEq)]
pub struct TestStepResult {
    pub step_number: u32,
    pub evaluation: bool,
    pub set_value: Option<f64>,
    pub actual_value: Option<f64>,
    pub set_value2: Option<f64>,
    pub actual_value2: Option<f64>,
}

/// Final actual values for the most recently finished step.
#[derive(Debug, Clone, PartialEq)]
pub struct ActualValues {
    pub completed: bool,
    /// Non-zero device fault status, when any.
    pub fault_status: Option<u32>,
    pub steps: Vec<TestStepResult>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Glp2Response {
    Interim(InterimActualValues),
    Final(ActualValues),
}

fn unexpected() -> RunError {
    RunError::code(UNEXPECTED_RESPONSE)
}

fn parse_num<T: std::str::FromStr>(token: Option<&str>) -> Result<T, RunError> {
    token
        .and_then(|token| token.parse().ok())
        .ok_or_else(unexpected)
}

fn parse_interim(fields: &mut std::str::Split<'_, char>) -> Result<InterimActualValues, RunError> {
    Ok(InterimActualValues {
        step_number: parse_num(fields.next())?,
        time_ms: parse_num(fields.next())?,
        value1: parse_num(fields.next())?,
        unit1: fields.next().ok_or_else(unexpected)?.to_string(),
        value2: parse_num(fields.next())?,
        unit2: fields.next().ok_or_else(unexpected)?.to_string(),
        evaluation: parse_num(fields.next())?,
    })
}

fn parse_step_result(token: &str) -> Result<TestStepResult, RunError> {
    let mut parts = token.split(',');
    let step_number = parse_num(parts.next())?;
    let evaluation = match parts.next() {
        Some("0") => false,
        Some("1") => true,
        _ => return Err(unexpected()),
    };

    let mut values = [None; 4];
    for value in values.iter_mut() {
        match parts.next() {
            None => break,
            Some(token) => *value = Some(token.parse().map_err(|_| unexpected())?),
        }
    }

    Ok(TestStepResult {
        step_number,
        evaluation,
        set_value: values[0],
        actual_value: values[1],
        set_value2: values[2],
        actual_value2: values[3],
    })
}

/// Parse one frame payload into a structured response.
pub fn parse_response(payload: &str) -> Result<Glp2Response, RunError> {
    let mut fields = payload.split(';');
    match fields.next() {
        Some("AW") => Ok(Glp2Response::Interim(parse_interim(&mut fields)?)),
        Some("EW") => {
            let completed = match fields.next() {
                Some("0") => false,
                Some("1") => true,
                _ => return Err(unexpected()),
            };
            let fault: u32 = parse_num(fields.next())?;
            let mut steps = Vec::new();
            for token in fields {
                if token.is_empty() {
                    continue;
                }
                steps.push(parse_step_result(token)?);
            }
            Ok(Glp2Response::Final(ActualValues {
                completed,
                fault_status: (fault != 0).then_some(fault),
                steps,
            }))
        }
        _ => Err(unexpected()),
    }
}
