//! Serial lighting-driver programmer.
//!
//! Lighting drivers are programmed over a low-speed serial link (1200 baud)
//! with a line protocol of `set <property> <value...>` commands. The feature
//! file is parsed into a validated command list, written to the driver, the
//! driver is optionally reset, and every option is read back and verified.
//! Each command contributes two progress increments (write and response),
//! matching what the dashboard shows as fractional programming progress.

use crate::broker::CancelToken;
use crate::error::RunError;
use crate::services::ProgressFn;
use crate::settings::Settings;
use async_trait::async_trait;
use log::debug;
use serde_json::{json, Value};

pub const SOL_BAUD_RATE: u32 = 1200;

/// Silence gap marking the end of a driver response.
pub const EOF_DELAY_MS: u64 = 250;

/// One `set`/`get` pair derived from a feature file line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SolCommand {
    pub option: String,
    pub set_cmd: Option<String>,
    pub get_cmd: String,
    /// Expected read-back value; `None` skips verification.
    pub expected: Option<i64>,
}

/// Parse failure, fatal to the programming attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SolParseError {
    pub line: String,
    pub line_no: usize,
    pub property: String,
}

struct SingleLimits {
    min: i64,
    max: i64,
}

struct DoubleLimits {
    index_min: i64,
    index_max: i64,
    value_min: i64,
    value_max: i64,
}

enum PropertySpec {
    Single(SingleLimits),
    Double(DoubleLimits),
}

fn property_spec(property: &str) -> Option<PropertySpec> {
    let spec = match property {
        "historysize" => PropertySpec::Single(SingleLimits { min: 0, max: 366 }),
        "reqnights" => PropertySpec::Single(SingleLimits { min: 0, max: 366 }),
        "minnightdur" => PropertySpec::Single(SingleLimits { min: 0, max: 1440 }),
        "maxnightdur" => PropertySpec::Single(SingleLimits { min: 0, max: 1440 }),
        "maxnightdelta" => PropertySpec::Single(SingleLimits { min: 0, max: 1440 }),
        "periodsize" => PropertySpec::Single(SingleLimits { min: 0, max: 16 }),
        "fadetime" => PropertySpec::Single(SingleLimits { min: 0, max: 536 }),
        "history" => PropertySpec::Double(DoubleLimits {
            index_min: 0,
            index_max: 366,
            value_min: 0,
            value_max: 1440,
        }),
        "dimlevel" => PropertySpec::Double(DoubleLimits {
            index_min: 0,
            index_max: 16,
            value_min: 0,
            value_max: 0xFFFF,
        }),
        "dimdur" => PropertySpec::Double(DoubleLimits {
            index_min: 0,
            index_max: 15,
            value_min: -0xFFFF,
            value_max: 0xFFFF,
        }),
        _ => return None,
    };
    Some(spec)
}

fn parse_error(line: &str, line_no: usize, property: &str) -> SolParseError {
    SolParseError {
        line: line.to_string(),
        line_no: line_no + 1,
        property: property.to_string(),
    }
}

/// Parse a value that may be given as a percentage of the maximum.
fn parse_value(token: &str, max: i64) -> Option<i64> {
    if let Some(percent) = token.strip_suffix('%') {
        let percent: f64 = percent.parse().ok()?;
        if percent < 0.0 {
            return None;
        }
        Some((percent * max as f64 / 100.0).round() as i64)
    } else {
        token.parse().ok()
    }
}

/// Parse the feature file into the driver command list. Lines that are not
/// `set` commands for known properties are ignored.
pub fn parse_program(source: &str) -> Result<Vec<SolCommand>, SolParseError> {
    let mut commands = Vec::new();

    for (line_no, raw_line) in source.replace('\r', "\n").split('\n').enumerate() {
        let line = raw_line.trim();
        if line.is_empty() {
            continue;
        }

        let mut tokens = line.split_whitespace();
        if tokens.next() != Some("set") {
            continue;
        }
        let Some(property) = tokens.next() else {
            continue;
        };
        let Some(spec) = property_spec(property) else {
            continue;
        };

        let command = match spec {
            PropertySpec::Single(limits) => {
                let value: i64 = tokens
                    .next()
                    .and_then(|token| token.parse().ok())
                    .ok_or_else(|| parse_error(line, line_no, property))?;
                if value < limits.min || value > limits.max {
                    return Err(parse_error(line, line_no, property));
                }
                SolCommand {
                    option: property.to_string(),
                    set_cmd: Some(format!("set {} {}", property, value)),
                    get_cmd: format!("get {}", property),
                    expected: Some(value),
                }
            }
            PropertySpec::Double(limits) => {
                let index: i64 = tokens
                    .next()
                    .and_then(|token| token.parse().ok())
                    .ok_or_else(|| parse_error(line, line_no, property))?;
                if index < limits.index_min || index > limits.index_max {
                    return Err(parse_error(line, line_no, property));
                }
                let value = tokens
                    .next()
                    .and_then(|token| parse_value(token, limits.value_max))
                    .ok_or_else(|| parse_error(line, line_no, property))?;
                if value < limits.value_min || value > limits.value_max {
                    return Err(parse_error(line, line_no, property));
                }
                SolCommand {
                    option: format!("{} {}", property, index),
                    set_cmd: Some(format!("set {} {} {}", property, index, value)),
                    get_cmd: format!("get {} {}", property, index),
                    expected: Some(value),
                }
            }
        };

        commands.push(command);
    }

    Ok(commands)
}

/// Open serial line to one lighting driver.
#[async_trait]
pub trait SolPort: Send {
    /// Write one command line and collect the response until the line goes
    /// quiet. The returned string is trimmed, possibly multi-line.
    async fn exec(&mut self, cmd: &str) -> crate::error::RigResult<String>;
}

/// Locates the driver's COM port and opens it at 1200 baud.
#[async_trait]
pub trait SolPortProvider: Send + Sync {
    async fn open(&self, com_pattern: &str) -> Result<Box<dyn SolPort>, RunError>;
}

/// Program a lighting driver from the feature file content.
#[allow(clippy::too_many_arguments)]
pub async fn program_sol_driver(
    settings: &Settings,
    ports: &dyn SolPortProvider,
    feature: &str,
    log: &(dyn Fn(&str, Value) + Sync),
    output: &mut Vec<String>,
    progress: ProgressFn<'_>,
    cancel: &CancelToken,
) -> Result<(), RunError> {
    log("SOL_STARTED", json!({}));

    if !settings.supports_feature("sol") {
        return Err(RunError::code("SOL_FEATURE_DISABLED"));
    }

    let commands = match parse_program(feature) {
        Ok(commands) => commands,
        Err(err) => {
            log(
                "SOL_PARSE_ERROR",
                json!({"line": err.line, "i": err.line_no, "prop": err.property}),
            );
            return Err(RunError::code("SOL_PARSE_ERROR"));
        }
    };

    if commands.is_empty() {
        return Err(RunError::code("SOL_NO_COMMANDS"));
    }

    let total_increments =
        (4 + commands.len() * 4 + if settings.sol_reset { 2 } else { 0 }) as f64;

    log(
        "SOL_SEARCHING_COM",
        json!({"pattern": settings.sol_com_pattern}),
    );
    let mut port = ports.open(&settings.sol_com_pattern).await?;

    let mut run = SolRun {
        port: port.as_mut(),
        output,
        progress,
        total_increments,
        completed_increments: 0,
    };

    if cancel.is_cancelled() {
        return Err(RunError::cancelled());
    }

    let base = run.exec("set base 10").await?;
    if base != "10" {
        return Err(RunError::code("SOL_NO_CONNECTION"));
    }

    log("SOL_EXECUTING_SET_COMMANDS", json!({"count": commands.len()}));
    for command in &commands {
        if cancel.is_cancelled() {
            return Err(RunError::cancelled());
        }
        if let Some(set_cmd) = &command.set_cmd {
            run.exec(set_cmd).await?;
        }
    }

    if settings.sol_reset {
        if cancel.is_cancelled() {
            return Err(RunError::cancelled());
        }
        log("SOL_RESETTING", json!({}));
        run.exec("do reset").await?;
        tokio::time::sleep(settings.sol_reset_delay()).await;
    }

    log("SOL_EXECUTING_GET_COMMANDS", json!({}));
    // The version probe has no expected value; it proves the link survived.
    run.exec("get version").await?;

    for command in &commands {
        if cancel.is_cancelled() {
            return Err(RunError::cancelled());
        }
        let actual = run.exec(&command.get_cmd).await?;
        if let Some(expected) = command.expected {
            if actual != expected.to_string() {
                log(
                    "SOL_INVALID_OPTION",
                    json!({
                        "option": command.option,
                        "expected": expected,
                        "actual": actual,
                    }),
                );
                return Err(RunError::code("SOL_INVALID_OPTION"));
            }
        }
    }

    Ok(())
}

struct SolRun<'a> {
    port: &'a mut dyn SolPort,
    output: &'a mut Vec<String>,
    progress: ProgressFn<'a>,
    total_increments: f64,
    completed_increments: usize,
}

impl SolRun<'_> {
    fn bump(&mut self) {
        self.completed_increments += 1;
        (self.progress)(
            (self.completed_increments as f64 * 100.0 / self.total_increments).round(),
        );
    }

    async fn exec(&mut self, cmd: &str) -> Result<String, RunError> {
        self.output.push(format!("[SOL] TX: {}", cmd));
        self.bump();

        let response = self
            .port
            .exec(cmd)
            .await
            .map_err(|err| RunError::with_message("SOL_SERIAL_PORT_FAILURE", err.to_string()))?;

        for line in response.lines().filter(|line| !line.trim().is_empty()) {
            self.output.push(format!("[SOL] RX: {}", line.trim()));
        }
        self.bump();
        debug!("[sol] {} -> {}", cmd, response);
        Ok(response)
    }
}

#[cfg(feature = "instrument_serial")]
pub use serial_port::SerialSolPortProvider;

#[cfg(feature = "instrument_serial")]
mod serial_port {
    use super::{SolPort, SolPortProvider, EOF_DELAY_MS, SOL_BAUD_RATE};
    use crate::error::{RigError, RigResult, RunError};
    use async_trait::async_trait;
    use serialport::SerialPort;
    use std::io::{Read, Write};
    use std::sync::{Arc, Mutex};
    use std::time::{Duration, Instant};

    /// Finds the driver's COM port by matching the pattern against the port
    /// name and USB descriptor strings.
    pub struct SerialSolPortProvider;

    #[async_trait]
    impl SolPortProvider for SerialSolPortProvider {
        async fn open(&self, com_pattern: &str) -> Result<Box<dyn SolPort>, RunError> {
            let pattern = com_pattern.to_string();
            let port_name = tokio::task::spawn_blocking(move || {
                let ports = serialport::available_ports()
                    .map_err(|err| RunError::with_message("SOL_SEARCHING_COM_FAILURE", err.to_string()))?;
                for port in ports {
                    if port.port_name.contains(&pattern) {
                        return Ok(Some(port.port_name));
                    }
                    if let serialport::SerialPortType::UsbPort(usb) = &port.port_type {
                        let fields = [
                            usb.manufacturer.as_deref(),
                            usb.product.as_deref(),
                            usb.serial_number.as_deref(),
                        ];
                        if fields
                            .iter()
                            .flatten()
                            .any(|field| field.contains(&pattern))
                        {
                            return Ok(Some(port.port_name));
                        }
                    }
                }
                Ok(None)
            })
            .await
            .map_err(|err| RunError::with_message("SOL_SEARCHING_COM_FAILURE", err.to_string()))??
            .ok_or_else(|| RunError::code("SOL_COM_NOT_FOUND"))?;

            let port = serialport::new(&port_name, SOL_BAUD_RATE)
                .timeout(Duration::from_millis(50))
                .open()
                .map_err(|err| RunError::with_message("SOL_OPENING_COM_FAILURE", err.to_string()))?;

            Ok(Box::new(SerialSolPort {
                port: Arc::new(Mutex::new(port)),
            }))
        }
    }

    struct SerialSolPort {
        port: Arc<Mutex<Box<dyn SerialPort>>>,
    }

    #[async_trait]
    impl SolPort for SerialSolPort {
        async fn exec(&mut self, cmd: &str) -> RigResult<String> {
            let port = Arc::clone(&self.port);
            let line = format!("{}\r", cmd);
            tokio::task::spawn_blocking(move || {
                let mut port = port.lock().unwrap();
                port.write_all(line.as_bytes())?;
                port.flush()?;

                let mut collected = Vec::new();
                let mut chunk = [0u8; 64];
                let mut last_data = Instant::now();
                loop {
                    match port.read(&mut chunk) {
                        Ok(0) => {}
                        Ok(n) => {
                            collected.extend_from_slice(&chunk[..n]);
                            last_data = Instant::now();
                        }
                        Err(err) if err.kind() == std::io::ErrorKind::TimedOut => {}
                        Err(err) => return Err(RigError::Io(err)),
                    }
                    if last_data.elapsed() >= Duration::from_millis(EOF_DELAY_MS) {
                        break;
                    }
                }

                let text = String::from_utf8_lossy(&collected)
                    .split('\r')
                    .map(str::trim)
                    .filter(|line| !line.is_empty())
                    .collect::<Vec<_>>()
                    .join("\n");
                Ok(text)
            })
            .await
            .map_err(|err| RigError::Transport(err.to_string()))?
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::cancel_pair;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn parses_known_set_commands() {
        let program = "set historysize 14\nset dimlevel 3 50%\nignore me\nget version\n";
        let commands = parse_program(program).unwrap();
        assert_eq!(commands.len(), 2);
        assert_eq!(commands[0].set_cmd.as_deref(), Some("set historysize 14"));
        assert_eq!(commands[0].expected, Some(14));
        assert_eq!(commands[1].option, "dimlevel 3");
        assert_eq!(commands[1].expected, Some((0.5f64 * 65535.0).round() as i64));
    }

    #[test]
    fn out_of_range_values_fail_parsing() {
        let err = parse_program("set historysize 999").unwrap_err();
        assert_eq!(err.property, "historysize");
        assert_eq!(err.line_no, 1);

        assert!(parse_program("set dimlevel 99 10").is_err());
        assert!(parse_program("set fadetime nope").is_err());
    }

    #[test]
    fn negative_dimdur_is_allowed() {
        let commands = parse_program("set dimdur 2 -120").unwrap();
        assert_eq!(commands[0].set_cmd.as_deref(), Some("set dimdur 2 -120"));
    }

    struct MapPort {
        responses: HashMap<String, String>,
    }

    #[async_trait]
    impl SolPort for MapPort {
        async fn exec(&mut self, cmd: &str) -> crate::error::RigResult<String> {
            Ok(self.responses.get(cmd).cloned().unwrap_or_default())
        }
    }

    struct MapProvider {
        responses: HashMap<String, String>,
    }

    #[async_trait]
    impl SolPortProvider for MapProvider {
        async fn open(&self, _com_pattern: &str) -> Result<Box<dyn SolPort>, RunError> {
            Ok(Box::new(MapPort {
                responses: self.responses.clone(),
            }))
        }
    }

    fn sol_settings() -> Settings {
        let mut settings = Settings::default();
        settings.features = vec!["sol".into()];
        settings
    }

    #[tokio::test]
    async fn programs_and_verifies_a_driver() {
        let mut responses = HashMap::new();
        responses.insert("set base 10".to_string(), "10".to_string());
        responses.insert("set historysize 14".to_string(), String::new());
        responses.insert("get version".to_string(), "2.1".to_string());
        responses.insert("get historysize".to_string(), "14".to_string());

        let provider = MapProvider { responses };
        let settings = sol_settings();
        let (_handle, cancel) = cancel_pair();
        let mut output = Vec::new();
        let updates = Arc::new(AtomicUsize::new(0));
        let counted = Arc::clone(&updates);
        let progress = move |_p: f64| {
            counted.fetch_add(1, Ordering::SeqCst);
        };

        program_sol_driver(
            &settings,
            &provider,
            "set historysize 14\n",
            &|_, _| {},
            &mut output,
            &progress,
            &cancel,
        )
        .await
        .unwrap();

        assert!(output.iter().any(|l| l == "[SOL] TX: set historysize 14"));
        assert!(output.iter().any(|l| l == "[SOL] RX: 14"));
        // 4 commands executed, two increments each.
        assert_eq!(updates.load(Ordering::SeqCst), 8);
    }

    #[tokio::test]
    async fn verification_mismatch_fails_the_run() {
        let mut responses = HashMap::new();
        responses.insert("set base 10".to_string(), "10".to_string());
        responses.insert("set historysize 14".to_string(), String::new());
        responses.insert("get version".to_string(), "2.1".to_string());
        responses.insert("get historysize".to_string(), "13".to_string());

        let provider = MapProvider { responses };
        let settings = sol_settings();
        let (_handle, cancel) = cancel_pair();
        let mut output = Vec::new();

        let err = program_sol_driver(
            &settings,
            &provider,
            "set historysize 14\n",
            &|_, _| {},
            &mut output,
            &|_| {},
            &cancel,
        )
        .await
        .unwrap_err();
        assert_eq!(err.code, "SOL_INVALID_OPTION");
    }

    #[tokio::test]
    async fn dead_link_is_no_connection() {
        let provider = MapProvider {
            responses: HashMap::new(),
        };
        let settings = sol_settings();
        let (_handle, cancel) = cancel_pair();
        let mut output = Vec::new();

        let err = program_sol_driver(
            &settings,
            &provider,
            "set historysize 14\n",
            &|_, _| {},
            &mut output,
            &|_| {},
            &cancel,
        )
        .await
        .unwrap_err();
        assert_eq!(err.code, "SOL_NO_CONNECTION");
    }

    #[tokio::test]
    async fn feature_gate_blocks_programming() {
        let provider = MapProvider {
            responses: HashMap::new(),
        };
        let settings = Settings::default();
        let (_handle, cancel) = cancel_pair();
        let mut output = Vec::new();

        let err = program_sol_driver(
            &settings,
            &provider,
            "set historysize 14\n",
            &|_, _| {},
            &mut output,
            &|_| {},
            &cancel,
        )
        .await
        .unwrap_err();
        assert_eq!(err.code, "SOL_FEATURE_DISABLED");
    }
}
