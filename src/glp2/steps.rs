//! Wire-level test step records.
//!
//! A [`TestStepSpec`] is the instrument-facing form of one program step:
//! the record the tester stores when a program is submitted. Per-step mode
//! serializes one spec at a time; all-in-one mode serializes the whole
//! enabled list, mapping wait and programming steps onto visual-check
//! records so the compound program has a slot for every step.

use crate::program::{
    Execution, FctMode, FnStep, IsoStep, PeStep, ProgramStep, ProgrammingStep, RsvChannel,
    StepKind, Trigger, VisMode, VisStep, WaitKind, WaitStep,
};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq)]
pub enum TestStepSpec {
    Pe(PeStep),
    Iso(IsoStep),
    Fct(FnStep),
    Vis(VisStep),
}

fn flag(value: bool) -> u8 {
    u8::from(value)
}

fn execution_code(execution: Execution) -> u8 {
    match execution {
        Execution::Auto => 0,
        Execution::Manual => 1,
    }
}

fn fct_mode_code(mode: FctMode) -> u8 {
    match mode {
        FctMode::Normal => 0,
        FctMode::VisualCheck => 1,
    }
}

fn vis_mode_code(mode: VisMode) -> u8 {
    match mode {
        VisMode::Normal => 0,
        VisMode::Inverted => 1,
    }
}

fn rsv_channel_code(channel: RsvChannel) -> u8 {
    match channel {
        RsvChannel::L1N => 0,
        RsvChannel::L2N => 1,
        RsvChannel::L3N => 2,
    }
}

fn trigger_code(trigger: Trigger) -> u8 {
    match trigger {
        Trigger::StartTime => 0,
        Trigger::Touch => 1,
    }
}

impl TestStepSpec {
    /// Build the spec for one program step in per-step mode. Wait and
    /// programming steps are driven by the station, not the tester, and have
    /// no spec here.
    pub fn from_program_step(step: &ProgramStep) -> Option<TestStepSpec> {
        match step {
            ProgramStep::Pe(pe) => Some(TestStepSpec::Pe(pe.clone())),
            ProgramStep::Iso(iso) => Some(TestStepSpec::Iso(iso.clone())),
            ProgramStep::Fn(fct) => Some(TestStepSpec::Fct(Self::adjust_fct(fct))),
            ProgramStep::Vis(vis) => Some(TestStepSpec::Vis(vis.clone())),
            ProgramStep::Wait(_) | ProgramStep::Program(_) => None,
        }
    }

    /// Build the spec for one program step in all-in-one mode, where every
    /// enabled step occupies a slot in the compound program.
    pub fn aio_from_program_step(step: &ProgramStep) -> TestStepSpec {
        match step {
            ProgramStep::Pe(pe) => TestStepSpec::Pe(pe.clone()),
            ProgramStep::Iso(iso) => TestStepSpec::Iso(iso.clone()),
            ProgramStep::Fn(fct) => TestStepSpec::Fct(Self::adjust_fct(fct)),
            ProgramStep::Vis(vis) => TestStepSpec::Vis(vis.clone()),
            ProgramStep::Wait(wait) => Self::wait_vis(wait),
            ProgramStep::Program(programming) => Self::programming_window(programming, 0.0),
        }
    }

    /// Fluorescent-lamp checks need the step to outlive the lamp-duration
    /// verification that runs when the step is nearly completed.
    fn adjust_fct(fct: &FnStep) -> FnStep {
        let mut fct = fct.clone();
        if fct.lamp_count > 0 {
            fct.duration += 1.0;
        }
        fct
    }

    /// Waits are expressed to the tester as visual checks: auto waits carry
    /// their duration, manual waits stay open until acknowledged.
    pub fn wait_vis(wait: &WaitStep) -> TestStepSpec {
        TestStepSpec::Vis(VisStep {
            label: "W8".to_string(),
            duration: match wait.kind {
                WaitKind::Auto => wait.duration,
                WaitKind::Manual => 0.0,
            },
            max_duration: 86_400.0,
            mode: VisMode::Normal,
            go_input: 0,
            no_go_input: 0,
            cancel_on_failure: true,
            enabled: true,
        })
    }

    /// Long visual-check window during which a device programming backend
    /// runs; the station acknowledges it once programming finishes.
    pub fn programming_window(step: &ProgrammingStep, start_time: f64) -> TestStepSpec {
        TestStepSpec::Fct(FnStep {
            label: step.label.clone(),
            set_value: 0.0,
            lower_tolerance_rel: 100.0,
            upper_tolerance_rel: 100.0,
            lower_tolerance_abs: 0.0,
            upper_tolerance_abs: 0.0,
            start_time,
            duration: 120.0,
            execution: Execution::Auto,
            range: 0,
            voltage: 230.0,
            correction: false,
            mode: FctMode::VisualCheck,
            leave_on: false,
            u_tolerance: 100.0,
            retries: 0,
            cancel_on_failure: true,
            vis_mode: VisMode::Normal,
            go_input: 0,
            no_go_input: 0,
            rsv_channel: RsvChannel::L1N,
            rsv_number: 1,
            multi: false,
            trigger: Trigger::StartTime,
            lamp_count: 0,
            lamp_duration: 0.0,
            enabled: true,
        })
    }

    pub fn kind(&self) -> StepKind {
        match self {
            TestStepSpec::Pe(_) => StepKind::Pe,
            TestStepSpec::Iso(_) => StepKind::Iso,
            TestStepSpec::Fct(_) => StepKind::Fn,
            TestStepSpec::Vis(_) => StepKind::Vis,
        }
    }

    pub fn label(&self) -> &str {
        match self {
            TestStepSpec::Pe(step) => &step.label,
            TestStepSpec::Iso(step) => &step.label,
            TestStepSpec::Fct(step) => &step.label,
            TestStepSpec::Vis(step) => &step.label,
        }
    }

    pub fn is_vis(&self) -> bool {
        matches!(self, TestStepSpec::Vis(_))
    }

    /// Declared total duration of the step on the instrument, used to turn
    /// interim elapsed time into a 0..=100 percentage.
    pub fn total_time(&self) -> Duration {
        match self {
            TestStepSpec::Pe(step) => Duration::from_secs_f64(step.duration),
            TestStepSpec::Iso(step) => Duration::from_secs_f64(step.duration),
            TestStepSpec::Fct(step) => Duration::from_secs_f64(step.start_time + step.duration),
            TestStepSpec::Vis(step) => {
                if step.max_duration > 0.0 {
                    Duration::from_secs_f64(step.max_duration)
                } else {
                    Duration::from_secs_f64(step.duration * 2.0)
                }
            }
        }
    }

    /// Serialize the settings record submitted to the tester for this step.
    pub fn serialize_command(&self, step_number: u32) -> String {
        match self {
            TestStepSpec::Pe(step) => format!(
                "S9-{}_{:.2}_{}_{}_{}_{}_{}_{}_{}_{}_{}_{}_{}_{:.2}",
                step_number,
                step.set_value,
                (step.duration * 1000.0) as u64,
                flag(step.direct_connection),
                flag(step.start_on_touch),
                step.ipr.floor() as u32,
                flag(step.multi),
                u8::from(step.u == 12),
                flag(step.buzzer),
                flag(step.set_probe),
                step.retries,
                flag(step.cancel_on_failure),
                u8::from(!step.enabled),
                step.min_set_value,
            ),
            TestStepSpec::Iso(step) => format!(
                "S6-{}_{:.2}_{}_{}_{:.1}_{}_{}_{}_{}_{:.2}",
                step_number,
                step.set_value,
                (step.duration * 1000.0) as u64,
                step.u,
                step.ramp_time,
                flag(step.multi),
                step.retries,
                flag(step.cancel_on_failure),
                u8::from(!step.enabled),
                step.min_set_value,
            ),
            TestStepSpec::Fct(step) => format!(
                "S7-{}_{:.3}_{:.1}_{:.1}_{:.2}_{:.2}_{}_{}_{}_{}_{:.0}_{}_{}_{}_{:.1}_{}_{}_{}_{}_{}_{}_{}_{}_{}",
                step_number,
                step.set_value,
                step.lower_tolerance_rel,
                step.upper_tolerance_rel,
                step.lower_tolerance_abs,
                step.upper_tolerance_abs,
                (step.start_time * 1000.0) as u64,
                (step.duration * 1000.0) as u64,
                execution_code(step.execution),
                step.range,
                step.voltage,
                flag(step.correction),
                fct_mode_code(step.mode),
                flag(step.leave_on),
                step.u_tolerance,
                step.retries,
                flag(step.cancel_on_failure),
                vis_mode_code(step.vis_mode),
                step.go_input,
                step.no_go_input,
                rsv_channel_code(step.rsv_channel),
                step.rsv_number,
                flag(step.multi),
                trigger_code(step.trigger),
            ),
            TestStepSpec::Vis(step) => format!(
                "S4-{}_{}_{}_{}_{}_{}_{}_{}",
                step_number,
                (step.duration * 1000.0) as u64,
                (step.max_duration * 1000.0) as u64,
                vis_mode_code(step.mode),
                step.go_input,
                step.no_go_input,
                flag(step.cancel_on_failure),
                u8::from(!step.enabled),
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::program::Program;
    use serde_json::json;

    fn pe_program_step() -> ProgramStep {
        let program = Program::from_json(&json!({
            "_id": "P", "name": "p", "type": "glp2",
            "steps": [{
                "type": "pe",
                "setValue": 0.2, "duration": 3, "directConnection": true,
                "startOnTouch": false, "ipr": 25, "multi": false, "u": 12,
                "buzzer": true, "setProbe": false, "retries": 2,
                "cancelOnFailure": true, "enabled": true, "minSetValue": 0.05
            }]
        }))
        .unwrap();
        program.steps[0].clone()
    }

    #[test]
    fn pe_record_serializes_all_parameters() {
        let spec = TestStepSpec::from_program_step(&pe_program_step()).unwrap();
        assert_eq!(
            spec.serialize_command(1),
            "S9-1_0.20_3000_1_0_25_0_1_1_0_2_1_0_0.05"
        );
        assert_eq!(spec.total_time(), Duration::from_secs(3));
    }

    #[test]
    fn wait_steps_become_bounded_visual_checks() {
        let auto = WaitStep {
            label: String::new(),
            kind: WaitKind::Auto,
            duration: 2.0,
            enabled: true,
        };
        let manual = WaitStep {
            kind: WaitKind::Manual,
            ..auto.clone()
        };

        match TestStepSpec::wait_vis(&auto) {
            TestStepSpec::Vis(vis) => {
                assert_eq!(vis.label, "W8");
                assert_eq!(vis.duration, 2.0);
                assert_eq!(vis.max_duration, 86_400.0);
            }
            other => panic!("unexpected {:?}", other),
        }
        match TestStepSpec::wait_vis(&manual) {
            TestStepSpec::Vis(vis) => assert_eq!(vis.duration, 0.0),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn lamp_checked_fn_steps_gain_a_second() {
        let program = Program::from_json(&json!({
            "_id": "P", "name": "p", "type": "glp2",
            "steps": [{
                "type": "fn",
                "setValue": 0.5, "lowerToleranceRel": 10, "upperToleranceRel": 10,
                "lowerToleranceAbs": 0, "upperToleranceAbs": 0, "startTime": 1,
                "duration": 5, "execution": "auto", "range": 0, "voltage": 230,
                "correction": false, "mode": "normal", "leaveOn": false,
                "uTolerance": 10, "retries": 0, "cancelOnFailure": true,
                "visMode": "normal", "goInput": 0, "noGoInput": 0,
                "rsvChannel": "l1-n", "rsvNumber": 1, "multi": false,
                "trigger": "startTime", "lampCount": 2, "lampDuration": 3,
                "enabled": true
            }]
        }))
        .unwrap();

        let spec = TestStepSpec::from_program_step(&program.steps[0]).unwrap();
        assert_eq!(spec.total_time(), Duration::from_secs(7));
    }

    #[test]
    fn programming_window_is_a_visual_check_fct() {
        let spec = TestStepSpec::programming_window(
            &ProgrammingStep {
                label: "PROG".to_string(),
                enabled: true,
            },
            0.0,
        );
        match &spec {
            TestStepSpec::Fct(fct) => {
                assert_eq!(fct.mode, FctMode::VisualCheck);
                assert_eq!(fct.duration, 120.0);
                assert_eq!(fct.voltage, 230.0);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(spec.serialize_command(3).starts_with("S7-3_"));
    }

    #[test]
    fn per_step_mode_has_no_spec_for_waits() {
        let wait = ProgramStep::Wait(WaitStep {
            label: String::new(),
            kind: WaitKind::Auto,
            duration: 2.0,
            enabled: true,
        });
        assert!(TestStepSpec::from_program_step(&wait).is_none());
    }
}
