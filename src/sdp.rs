//! Fixed-length command/response codec for the SDP-family bench supply.
//!
//! Every instrument command is a pure value: request bytes, the exact
//! expected response length and a parser. Requests are a four-byte command
//! name, a two-nibble RS-485 address (two ASCII hex digits, or two zero bytes
//! when unaddressed), ASCII zero-padded numeric arguments and a CR
//! terminator. Responses are valid only at their exact declared length with a
//! trailing `OK<CR>`; [`SdpCommand::parse_response`] returns `None` for
//! anything else, signalling "malformed or not yet complete" so the caller
//! keeps reading.
//!
//! Voltage and current magnitudes are fixed-point decimals encoded as
//! zero-padded integers in tenths and hundredths respectively. Out-of-range
//! set points are silently clamped, matching the hardware's own saturation
//! behavior.

use crate::error::{RigError, RigResult};
use async_trait::async_trait;
use log::debug;
use std::time::Duration;

pub const CR: u8 = 0x0D;

/// Max voltage set point in volts. Values above are clamped to 99.9.
pub const VOLTAGE_MAX: f64 = 99.9;
/// Max current set point in amps. Values above are clamped to 9.99.
pub const CURRENT_MAX: f64 = 9.99;

fn high(byte: u8) -> u8 {
    (byte >> 4) & 0x0F
}

fn low(byte: u8) -> u8 {
    byte & 0x0F
}

fn encode_nibble(nibble: u8) -> u8 {
    nibble + if nibble < 10 { 0x30 } else { 0x37 }
}

/// Encode a fixed-point magnitude as three ASCII digits after clamping.
fn encode_scaled(value: f64, scale: f64, max: f64) -> [u8; 3] {
    let clamped = value.clamp(0.0, max);
    let scaled = (clamped * scale).floor() as u32;
    [
        encode_nibble((scaled / 100 % 10) as u8),
        encode_nibble((scaled / 10 % 10) as u8),
        encode_nibble((scaled % 10) as u8),
    ]
}

fn encode_two_digits(value: u32) -> [u8; 2] {
    [
        encode_nibble((value / 10 % 10) as u8),
        encode_nibble((value % 10) as u8),
    ]
}

/// All digits, or `None`. Corrupted numeric fields must not validate.
fn ascii_uint(slice: &[u8]) -> Option<u32> {
    if slice.is_empty() {
        return None;
    }
    let mut value: u32 = 0;
    for byte in slice {
        if !byte.is_ascii_digit() {
            return None;
        }
        value = value.checked_mul(10)?.checked_add((byte - b'0') as u32)?;
    }
    Some(value)
}

fn ends_with_ok(buffer: &[u8]) -> bool {
    buffer.len() >= 3 && &buffer[buffer.len() - 3..] == b"OK\r"
}

fn frame(name: &[u8; 4], address: Option<u8>, args: &[u8]) -> Vec<u8> {
    let mut request = Vec::with_capacity(4 + 2 + args.len() + 1);
    request.extend_from_slice(name);
    match address {
        Some(address) => {
            request.push(encode_nibble(high(address)));
            request.push(encode_nibble(low(address)));
        }
        None => request.extend_from_slice(&[0x00, 0x00]),
    }
    request.extend_from_slice(args);
    request.push(CR);
    request
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputMode {
    ConstantVoltage,
    ConstantCurrent,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PresetValues {
    pub voltage: f64,
    pub current: f64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TimedProgramSlot {
    pub voltage: f64,
    pub current: f64,
    pub minute: u32,
    pub second: u32,
}

/// Structured result of a successfully parsed response.
#[derive(Debug, Clone, PartialEq)]
pub enum SdpResponse {
    Ack,
    MaxValues { voltage: f64, current: f64 },
    OvpLimit { voltage: f64 },
    Readings { voltage: f64, current: f64, mode: OutputMode },
    SetPoints { voltage: f64, current: f64 },
    Preset(PresetValues),
    Presets(Vec<PresetValues>),
    TimedProgram(TimedProgramSlot),
    TimedPrograms(Vec<TimedProgramSlot>),
    /// Raw LCD contents, opaque to the station.
    Display(Vec<u8>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Parser {
    Ack,
    MaxValues,
    OvpLimit,
    Readings,
    SetPoints,
    Preset,
    Presets,
    TimedProgram,
    TimedPrograms,
    Display,
}

/// One encoded instrument command.
#[derive(Debug, Clone)]
pub struct SdpCommand {
    name: &'static str,
    request: Vec<u8>,
    response_length: usize,
    parser: Parser,
}

impl SdpCommand {
    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn request(&self) -> &[u8] {
        &self.request
    }

    pub fn response_length(&self) -> usize {
        self.response_length
    }

    fn ack(name: &'static str, cmd: &[u8; 4], address: Option<u8>, args: &[u8]) -> Self {
        Self {
            name,
            request: frame(cmd, address, args),
            response_length: 3,
            parser: Parser::Ack,
        }
    }

    /// Disable the front panel keypad and enter remote mode.
    pub fn sess(address: Option<u8>) -> Self {
        Self::ack("SESS", b"SESS", address, &[])
    }

    /// Enable the front panel keypad and exit remote mode.
    pub fn ends(address: Option<u8>) -> Self {
        Self::ack("ENDS", b"ENDS", address, &[])
    }

    /// Probe the RS-485 address.
    pub fn gcom(address: Option<u8>) -> Self {
        Self::ack("GCOM", b"GCOM", address, &[])
    }

    /// Get maximum voltage and current.
    pub fn gmax(address: Option<u8>) -> Self {
        Self {
            name: "GMAX",
            request: frame(b"GMAX", address, &[]),
            response_length: 7 + 3,
            parser: Parser::MaxValues,
        }
    }

    /// Get the upper voltage limit.
    pub fn govp(address: Option<u8>) -> Self {
        Self {
            name: "GOVP",
            request: frame(b"GOVP", address, &[]),
            response_length: 4 + 3,
            parser: Parser::OvpLimit,
        }
    }

    /// Get voltage and current readings plus the regulation mode.
    pub fn getd(address: Option<u8>) -> Self {
        Self {
            name: "GETD",
            request: frame(b"GETD", address, &[]),
            response_length: 10 + 3,
            parser: Parser::Readings,
        }
    }

    /// Get the voltage and current set points.
    pub fn gets(address: Option<u8>) -> Self {
        Self {
            name: "GETS",
            request: frame(b"GETS", address, &[]),
            response_length: 7 + 3,
            parser: Parser::SetPoints,
        }
    }

    /// Get one preset memory location (1..=9), or all nine at once.
    pub fn getm(address: Option<u8>, location: Option<u8>) -> Self {
        match location {
            Some(location @ 1..=9) => Self {
                name: "GETM",
                request: frame(b"GETM", address, &[encode_nibble(location)]),
                response_length: 7 + 3,
                parser: Parser::Preset,
            },
            _ => Self {
                name: "GETM",
                request: frame(b"GETM", address, &[]),
                response_length: 7 * 9 + 3,
                parser: Parser::Presets,
            },
        }
    }

    /// Get one timed-program slot (0..=19), or all twenty at once.
    pub fn getp(address: Option<u8>, slot: Option<u8>) -> Self {
        match slot {
            Some(slot @ 0..=19) => Self {
                name: "GETP",
                request: frame(b"GETP", address, &encode_two_digits(slot as u32)),
                response_length: 11 + 3,
                parser: Parser::TimedProgram,
            },
            _ => Self {
                name: "GETP",
                request: frame(b"GETP", address, &[]),
                response_length: 11 * 20 + 3,
                parser: Parser::TimedPrograms,
            },
        }
    }

    /// Get the LCD display contents.
    pub fn gpal(address: Option<u8>) -> Self {
        Self {
            name: "GPAL",
            request: frame(b"GPAL", address, &[]),
            response_length: 6 + 6 + 6 + 14 + 9 + 9 + 5 + 10 + 4 + 3,
            parser: Parser::Display,
        }
    }

    /// Set the voltage level. Clamped to [0, 99.9] V.
    pub fn volt(address: Option<u8>, voltage: f64) -> Self {
        Self::ack(
            "VOLT",
            b"VOLT",
            address,
            &encode_scaled(voltage, 10.0, VOLTAGE_MAX),
        )
    }

    /// Set the current level. Clamped to [0, 9.99] A.
    pub fn curr(address: Option<u8>, current: f64) -> Self {
        Self::ack(
            "CURR",
            b"CURR",
            address,
            &encode_scaled(current, 100.0, CURRENT_MAX),
        )
    }

    /// Set the upper voltage limit. Clamped to [0, 99.9] V.
    pub fn sovp(address: Option<u8>, voltage: f64) -> Self {
        Self::ack(
            "SOVP",
            b"SOVP",
            address,
            &encode_scaled(voltage, 10.0, VOLTAGE_MAX),
        )
    }

    /// Toggle the output. The wire value is inverted: 0 enables.
    pub fn sout(address: Option<u8>, on: bool) -> Self {
        Self::ack(
            "SOUT",
            b"SOUT",
            address,
            &[encode_nibble(if on { 0 } else { 1 })],
        )
    }

    /// Select whether the output is live when the supply powers up.
    pub fn poww(address: Option<u8>, location: u8, on: bool) -> Self {
        let location = location.clamp(1, 9);
        Self::ack(
            "POWW",
            b"POWW",
            address,
            &[encode_nibble(location), encode_nibble(u8::from(on))],
        )
    }

    /// Store voltage/current into a preset memory location.
    pub fn prom(address: Option<u8>, location: u8, voltage: f64, current: f64) -> Self {
        let location = location.clamp(1, 9);
        let mut args = vec![encode_nibble(location)];
        args.extend_from_slice(&encode_scaled(voltage, 10.0, VOLTAGE_MAX));
        args.extend_from_slice(&encode_scaled(current, 100.0, CURRENT_MAX));
        Self::ack("PROM", b"PROM", address, &args)
    }

    /// Store voltage, current and period into a timed-program slot.
    pub fn prop(
        address: Option<u8>,
        slot: u8,
        voltage: f64,
        current: f64,
        minute: u32,
        second: u32,
    ) -> Self {
        let slot = slot.min(19);
        let mut args = Vec::with_capacity(12);
        args.extend_from_slice(&encode_two_digits(slot as u32));
        args.extend_from_slice(&encode_scaled(voltage, 10.0, VOLTAGE_MAX));
        args.extend_from_slice(&encode_scaled(current, 100.0, CURRENT_MAX));
        args.extend_from_slice(&encode_two_digits(minute.min(59)));
        args.extend_from_slice(&encode_two_digits(second.min(59)));
        Self::ack("PROP", b"PROP", address, &args)
    }

    /// Recall a preset memory location.
    pub fn runm(address: Option<u8>, location: u8) -> Self {
        Self::ack(
            "RUNM",
            b"RUNM",
            address,
            &[encode_nibble(location.clamp(1, 9))],
        )
    }

    /// Run the timed program the given number of times (0 = forever).
    pub fn runp(address: Option<u8>, times: u32) -> Self {
        let times = times.min(256);
        Self::ack(
            "RUNP",
            b"RUNP",
            address,
            &[
                encode_nibble((times / 100) as u8),
                encode_nibble((times / 10 % 10) as u8),
                encode_nibble((times % 10) as u8),
            ],
        )
    }

    /// Stop the running timed program.
    pub fn stop(address: Option<u8>) -> Self {
        Self::ack("STOP", b"STOP", address, &[])
    }

    /// Parse a complete response buffer.
    ///
    /// Returns `None` unless the buffer is exactly the declared length, ends
    /// with `OK<CR>` and every field decodes cleanly.
    pub fn parse_response(&self, buffer: &[u8]) -> Option<SdpResponse> {
        if buffer.len() != self.response_length || !ends_with_ok(buffer) {
            return None;
        }

        match self.parser {
            Parser::Ack => Some(SdpResponse::Ack),
            Parser::MaxValues => {
                if buffer[6] != CR {
                    return None;
                }
                Some(SdpResponse::MaxValues {
                    voltage: ascii_uint(&buffer[0..3])? as f64 / 10.0,
                    current: ascii_uint(&buffer[3..6])? as f64 / 100.0,
                })
            }
            Parser::OvpLimit => {
                if buffer[3] != CR {
                    return None;
                }
                Some(SdpResponse::OvpLimit {
                    voltage: ascii_uint(&buffer[0..3])? as f64 / 10.0,
                })
            }
            Parser::Readings => {
                if buffer[9] != CR {
                    return None;
                }
                let mode = match buffer[8] {
                    b'0' => OutputMode::ConstantVoltage,
                    b'1' => OutputMode::ConstantCurrent,
                    _ => return None,
                };
                Some(SdpResponse::Readings {
                    voltage: ascii_uint(&buffer[0..4])? as f64 / 100.0,
                    current: ascii_uint(&buffer[4..8])? as f64 / 1000.0,
                    mode,
                })
            }
            Parser::SetPoints => {
                if buffer[6] != CR {
                    return None;
                }
                Some(SdpResponse::SetPoints {
                    voltage: ascii_uint(&buffer[0..3])? as f64 / 10.0,
                    current: ascii_uint(&buffer[3..6])? as f64 / 100.0,
                })
            }
            Parser::Preset => Some(SdpResponse::Preset(parse_preset(&buffer[0..6])?)),
            Parser::Presets => {
                let mut presets = Vec::with_capacity(9);
                for chunk in 0..9 {
                    let start = chunk * 7;
                    presets.push(parse_preset(&buffer[start..start + 6])?);
                }
                Some(SdpResponse::Presets(presets))
            }
            Parser::TimedProgram => Some(SdpResponse::TimedProgram(parse_slot(&buffer[0..10])?)),
            Parser::TimedPrograms => {
                let mut slots = Vec::with_capacity(20);
                for chunk in 0..20 {
                    let start = chunk * 11;
                    slots.push(parse_slot(&buffer[start..start + 10])?);
                }
                Some(SdpResponse::TimedPrograms(slots))
            }
            Parser::Display => Some(SdpResponse::Display(
                buffer[..self.response_length - 3].to_vec(),
            )),
        }
    }
}

fn parse_preset(slice: &[u8]) -> Option<PresetValues> {
    Some(PresetValues {
        voltage: ascii_uint(&slice[0..3])? as f64 / 10.0,
        current: ascii_uint(&slice[3..6])? as f64 / 100.0,
    })
}

fn parse_slot(slice: &[u8]) -> Option<TimedProgramSlot> {
    Some(TimedProgramSlot {
        voltage: ascii_uint(&slice[0..3])? as f64 / 10.0,
        current: ascii_uint(&slice[3..6])? as f64 / 100.0,
        minute: ascii_uint(&slice[6..8])?,
        second: ascii_uint(&slice[8..10])?,
    })
}

/// Byte transport for the bench supply.
#[async_trait]
pub trait SdpLink: Send {
    async fn write(&mut self, bytes: &[u8]) -> RigResult<()>;
    /// Read some bytes, returning how many were placed into `buf`.
    async fn read(&mut self, buf: &mut [u8]) -> RigResult<usize>;
}

/// Session-oriented client for one SDP supply.
pub struct PowerSupply<L: SdpLink> {
    link: L,
    address: Option<u8>,
    response_timeout: Duration,
}

impl<L: SdpLink> PowerSupply<L> {
    pub fn new(link: L, address: Option<u8>) -> Self {
        Self {
            link,
            address,
            response_timeout: Duration::from_millis(1000),
        }
    }

    pub fn with_response_timeout(mut self, timeout: Duration) -> Self {
        self.response_timeout = timeout;
        self
    }

    /// Execute one command, accumulating bytes until the declared response
    /// length is reached. A malformed response at full length is a protocol
    /// error; running out of time is a transport error.
    pub async fn execute(&mut self, command: &SdpCommand) -> RigResult<SdpResponse> {
        self.link.write(command.request()).await?;

        let response_timeout = self.response_timeout;
        let mut response = Vec::with_capacity(command.response_length());
        let read_all = async {
            let mut chunk = [0u8; 64];
            while response.len() < command.response_length() {
                let n = self.link.read(&mut chunk).await?;
                if n == 0 {
                    return Err(RigError::Transport("unexpected EOF from supply".into()));
                }
                response.extend_from_slice(&chunk[..n]);
            }
            Ok(())
        };

        tokio::time::timeout(response_timeout, read_all)
            .await
            .map_err(|_| {
                RigError::Transport(format!("{} response timed out", command.name()))
            })??;

        debug!("[sdp] {} -> {} bytes", command.name(), response.len());

        command
            .parse_response(&response)
            .ok_or_else(|| RigError::Protocol(format!("unexpected {} response", command.name())))
    }

    pub async fn enter_session(&mut self) -> RigResult<()> {
        self.execute(&SdpCommand::sess(self.address)).await?;
        Ok(())
    }

    pub async fn exit_session(&mut self) -> RigResult<()> {
        self.execute(&SdpCommand::ends(self.address)).await?;
        Ok(())
    }

    pub async fn set_voltage(&mut self, voltage: f64) -> RigResult<()> {
        self.execute(&SdpCommand::volt(self.address, voltage)).await?;
        Ok(())
    }

    pub async fn set_current(&mut self, current: f64) -> RigResult<()> {
        self.execute(&SdpCommand::curr(self.address, current)).await?;
        Ok(())
    }

    pub async fn set_output(&mut self, on: bool) -> RigResult<()> {
        self.execute(&SdpCommand::sout(self.address, on)).await?;
        Ok(())
    }

    pub async fn set_points(&mut self) -> RigResult<(f64, f64)> {
        match self.execute(&SdpCommand::gets(self.address)).await? {
            SdpResponse::SetPoints { voltage, current } => Ok((voltage, current)),
            _ => Err(RigError::Protocol("unexpected GETS response".into())),
        }
    }

    pub async fn readings(&mut self) -> RigResult<(f64, f64, OutputMode)> {
        match self.execute(&SdpCommand::getd(self.address)).await? {
            SdpResponse::Readings {
                voltage,
                current,
                mode,
            } => Ok((voltage, current, mode)),
            _ => Err(RigError::Protocol("unexpected GETD response".into())),
        }
    }
}

/// Sampling view used by the metrics capture task.
#[async_trait]
pub trait BenchSupply: Send {
    /// One sample of (set voltage, read voltage, read current).
    async fn sample(&mut self) -> RigResult<(f64, f64, f64)>;
}

#[async_trait]
impl<L: SdpLink> BenchSupply for PowerSupply<L> {
    async fn sample(&mut self) -> RigResult<(f64, f64, f64)> {
        let (u_set, _) = self.set_points().await?;
        let (u_get, i, _) = self.readings().await?;
        Ok((u_set, u_get, i))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    #[test]
    fn frames_carry_address_nibbles_and_terminator() {
        let cmd = SdpCommand::volt(Some(0x2B), 23.0);
        assert_eq!(cmd.request(), b"VOLT2B230\r");

        let unaddressed = SdpCommand::sess(None);
        assert_eq!(unaddressed.request(), &[b'S', b'E', b'S', b'S', 0, 0, CR]);
    }

    #[test]
    fn out_of_range_set_points_clamp_silently() {
        assert_eq!(
            SdpCommand::volt(None, 150.0).request(),
            SdpCommand::volt(None, 99.9).request()
        );
        assert_eq!(
            SdpCommand::curr(None, -3.0).request(),
            SdpCommand::curr(None, 0.0).request()
        );
        assert_eq!(SdpCommand::curr(None, 12.0).request()[6..9], *b"999");
    }

    #[test]
    fn voltage_round_trips_through_the_fixed_point_codec() {
        for raw in [0.0, 0.1, 12.3, 23.0, 99.9] {
            let cmd = SdpCommand::gets(None);
            let encoded = encode_scaled(raw, 10.0, VOLTAGE_MAX);
            let mut response = encoded.to_vec();
            response.extend_from_slice(b"000\rOK\r");
            match cmd.parse_response(&response) {
                Some(SdpResponse::SetPoints { voltage, .. }) => {
                    assert!((voltage - (raw * 10.0).round() / 10.0).abs() < 1e-9);
                }
                other => panic!("expected set points, got {:?}", other),
            }
        }
    }

    #[test]
    fn readings_parse_both_regulation_modes() {
        let cmd = SdpCommand::getd(None);
        match cmd.parse_response(b"239904550\rOK\r") {
            Some(SdpResponse::Readings {
                voltage,
                current,
                mode,
            }) => {
                assert!((voltage - 23.99).abs() < 1e-9);
                assert!((current - 0.455).abs() < 1e-9);
                assert_eq!(mode, OutputMode::ConstantVoltage);
            }
            other => panic!("unexpected {:?}", other),
        }
        match cmd.parse_response(b"239904551\rOK\r") {
            Some(SdpResponse::Readings { mode, .. }) => {
                assert_eq!(mode, OutputMode::ConstantCurrent)
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(cmd.parse_response(b"239904552\rOK\r").is_none());
    }

    #[test]
    fn malformed_responses_are_rejected() {
        let cmd = SdpCommand::gets(None);
        let valid = b"230250\rOK\r";
        assert!(cmd.parse_response(valid).is_some());

        // Short response.
        assert!(cmd.parse_response(&valid[..9]).is_none());
        // Wrong terminator.
        let mut wrong_term = valid.to_vec();
        *wrong_term.last_mut().unwrap() = b'\n';
        assert!(cmd.parse_response(&wrong_term).is_none());
        // Any single corrupted non-terminator byte must not validate.
        for index in 0..valid.len() - 1 {
            let mut corrupted = valid.to_vec();
            corrupted[index] = b'X';
            assert!(
                cmd.parse_response(&corrupted).is_none(),
                "byte {} spuriously validated",
                index
            );
        }
    }

    #[test]
    fn all_presets_parse_in_order() {
        let cmd = SdpCommand::getm(None, None);
        let mut response = Vec::new();
        for i in 0..9u32 {
            response.extend_from_slice(format!("{:03}{:03}\r", 100 + i, 200 + i).as_bytes());
        }
        response.extend_from_slice(b"OK\r");
        match cmd.parse_response(&response) {
            Some(SdpResponse::Presets(presets)) => {
                assert_eq!(presets.len(), 9);
                assert!((presets[0].voltage - 10.0).abs() < 1e-9);
                assert!((presets[8].current - 2.08).abs() < 1e-9);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    struct ScriptedLink {
        written: Vec<Vec<u8>>,
        responses: VecDeque<Vec<u8>>,
    }

    #[async_trait]
    impl SdpLink for ScriptedLink {
        async fn write(&mut self, bytes: &[u8]) -> RigResult<()> {
            self.written.push(bytes.to_vec());
            Ok(())
        }

        async fn read(&mut self, buf: &mut [u8]) -> RigResult<usize> {
            match self.responses.pop_front() {
                Some(response) => {
                    buf[..response.len()].copy_from_slice(&response);
                    Ok(response.len())
                }
                None => Err(RigError::Transport("no scripted response".into())),
            }
        }
    }

    #[tokio::test]
    async fn supply_samples_set_points_and_readings() {
        let link = ScriptedLink {
            written: Vec::new(),
            // GETS then GETD, the second split across two reads.
            responses: VecDeque::from(vec![
                b"230250\rOK\r".to_vec(),
                b"23990455".to_vec(),
                b"0\rOK\r".to_vec(),
            ]),
        };
        let mut supply = PowerSupply::new(link, None);
        let (u_set, u_get, i) = supply.sample().await.unwrap();
        assert!((u_set - 23.0).abs() < 1e-9);
        assert!((u_get - 23.99).abs() < 1e-9);
        assert!((i - 0.455).abs() < 1e-9);
    }
}
