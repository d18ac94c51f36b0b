//! GLP2 electrical-tester protocol engine.
//!
//! The tester speaks an ASCII record protocol over RS-232: every record is
//! framed as `STX <payload> ETX`, commands are acknowledged with a single
//! `ACK` byte, and actual-value polls (`STX <device id> ACK`) are answered
//! with either a response frame or a lone `NAK` when the instrument has
//! nothing new. The [`TesterManager`] keeps the per-instrument session state
//! (`NotReady` until a reset is acknowledged) and turns declarative test-step
//! descriptions into wire commands.
//!
//! Protocol I/O goes through the [`TesterLink`] trait so the engine runs
//! against mocks in tests; a `serialport`-backed link is available with the
//! `instrument_serial` feature.

pub mod execute;
pub mod response;
pub mod steps;

pub use execute::{program_and_test, ProgramBackend, TestHost};
pub use response::{ActualValues, FaultStatus, Glp2Response, InterimActualValues, TestStepResult};
pub use steps::TestStepSpec;

use crate::error::{RigResult, RunError};
#[cfg(test)]
use crate::error::RigError;
use async_trait::async_trait;
use log::{debug, warn};

pub const STX: u8 = 0x02;
pub const ETX: u8 = 0x03;
pub const ACK: u8 = 0x06;
pub const NAK: u8 = 0x15;

/// Error code of a response that was readable but not interpretable.
pub const UNEXPECTED_RESPONSE: &str = "GLP2:UNEXPECTED_RESPONSE";

/// Render a raw buffer for the device-interaction transcript.
pub fn prettify_buffer(buffer: &[u8]) -> String {
    let mut out = String::with_capacity(buffer.len());
    for byte in buffer {
        match *byte {
            STX => out.push_str("<STX>"),
            ETX => out.push_str("<ETX>"),
            ACK => out.push_str("<ACK>"),
            NAK => out.push_str("<NAK>"),
            b if b.is_ascii_graphic() || b == b' ' => out.push(b as char),
            b => out.push_str(&format!("<{:02X}>", b)),
        }
    }
    out
}

/// Frame a payload as `STX <payload> ETX`.
pub fn build_frame(payload: &str) -> Vec<u8> {
    let mut frame = Vec::with_capacity(payload.len() + 2);
    frame.push(STX);
    frame.extend_from_slice(payload.as_bytes());
    frame.push(ETX);
    frame
}

fn frame_payload(frame: &[u8]) -> Option<&[u8]> {
    if frame.len() >= 2 && frame[0] == STX && frame[frame.len() - 1] == ETX {
        Some(&frame[1..frame.len() - 1])
    } else {
        None
    }
}

/// One wire unit received from the tester.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireEvent {
    Ack,
    Nak,
    Frame(Vec<u8>),
}

/// Async transport delivering whole wire units.
#[async_trait]
pub trait TesterLink: Send {
    async fn send(&mut self, bytes: &[u8]) -> RigResult<()>;
    async fn recv(&mut self) -> RigResult<WireEvent>;
}

/// TX/RX transcript with collapsing of repeated empty polls.
///
/// Two consecutive identical NAK answers to the same poll command carry no
/// information beyond the first pair, so the repeat replaces the previous
/// pair instead of growing the transcript.
#[derive(Debug, Default)]
struct Transcript {
    lines: Vec<String>,
    prev_tx: Vec<u8>,
    prev_rx_nak: bool,
}

impl Transcript {
    fn record_tx(&mut self, bytes: &[u8]) {
        self.lines.push(format!("[GLP2] TX: {}", prettify_buffer(bytes)));
        self.prev_tx = bytes.to_vec();
    }

    fn record_rx(&mut self, bytes: &[u8]) {
        self.lines.push(format!("[GLP2] RX: {}", prettify_buffer(bytes)));

        let empty_poll = bytes == [NAK]
            && self.prev_tx.len() == 3
            && self.prev_tx[0] == STX
            && self.prev_tx[2] == ACK;

        if empty_poll {
            if self.prev_rx_nak {
                // Drop the previous TX/RX pair, keeping only the newest one.
                let keep_from = self.lines.len() - 2;
                self.lines.drain(keep_from - 2..keep_from);
            }
            self.prev_rx_nak = true;
        } else {
            self.prev_rx_nak = false;
        }
    }

    fn take(&mut self) -> Vec<String> {
        self.prev_rx_nak = false;
        std::mem::take(&mut self.lines)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TesterState {
    NotReady,
    Ready,
}

/// Session with one GLP2 tester.
pub struct TesterManager<L: TesterLink> {
    link: L,
    device_id: u8,
    state: TesterState,
    software_version: f64,
    transcript: Transcript,
}

impl<L: TesterLink> TesterManager<L> {
    pub fn new(link: L, device_id: u8) -> Self {
        Self {
            link,
            device_id,
            state: TesterState::NotReady,
            software_version: 0.0,
            transcript: Transcript::default(),
        }
    }

    pub fn is_ready(&self) -> bool {
        self.state == TesterState::Ready
    }

    /// Firmware version reported by the last reset. Behavioral gates (e.g.
    /// whether programming requires an operator continue) key off this.
    pub fn software_version(&self) -> f64 {
        self.software_version
    }

    /// Drain and clear the accumulated device-interaction transcript.
    pub fn take_output(&mut self) -> Vec<String> {
        self.transcript.take()
    }

    async fn send_logged(&mut self, bytes: &[u8]) -> RigResult<()> {
        self.transcript.record_tx(bytes);
        self.link.send(bytes).await
    }

    async fn recv_logged(&mut self) -> RigResult<WireEvent> {
        let event = self.link.recv().await?;
        let bytes = match &event {
            WireEvent::Ack => vec![ACK],
            WireEvent::Nak => vec![NAK],
            WireEvent::Frame(frame) => frame.clone(),
        };
        self.transcript.record_rx(&bytes);
        Ok(event)
    }

    /// Send one command frame and require an ACK.
    async fn exec_command(&mut self, payload: &str) -> Result<(), RunError> {
        let frame = build_frame(payload);
        self.send_logged(&frame)
            .await
            .map_err(|err| RunError::with_message("GLP2:COM_FAILURE", err.to_string()))?;

        match self
            .recv_logged()
            .await
            .map_err(|err| RunError::with_message("GLP2:COM_FAILURE", err.to_string()))?
        {
            WireEvent::Ack => Ok(()),
            WireEvent::Nak => {
                warn!("[glp2] command rejected: {}", payload);
                Err(RunError::code("GLP2:NAK"))
            }
            WireEvent::Frame(_) => Err(RunError::code(UNEXPECTED_RESPONSE)),
        }
    }

    /// Reset the tester. On a successful acknowledgement the session becomes
    /// ready and the firmware version is refreshed.
    pub async fn reset(&mut self) -> Result<(), RunError> {
        self.state = TesterState::NotReady;
        self.exec_command("RS").await?;

        self.exec_command("VE?").await.ok();
        // The version record arrives as its own frame right after the query
        // is acknowledged. Older firmware never answers; keep the last value.
        if let Ok(WireEvent::Frame(frame)) = self.recv_logged().await {
            if let Some(payload) = frame_payload(&frame) {
                let payload = String::from_utf8_lossy(payload);
                if let Some(version) = payload.strip_prefix("VE;") {
                    self.software_version = version.trim().parse().unwrap_or(0.0);
                }
            }
        }

        self.state = TesterState::Ready;
        debug!(
            "[glp2] tester {} ready, software version {}",
            self.device_id, self.software_version
        );
        Ok(())
    }

    /// Submit a test program: a header record followed by one record per
    /// step, each individually acknowledged.
    pub async fn set_test_program(
        &mut self,
        name: &str,
        steps: &[TestStepSpec],
    ) -> Result<(), RunError> {
        if !self.is_ready() {
            return Err(RunError::code("GLP2:TESTER_NOT_READY"));
        }

        self.exec_command(&format!("TP;{};{}", name, steps.len()))
            .await?;

        for (i, step) in steps.iter().enumerate() {
            self.exec_command(&step.serialize_command(i as u32 + 1))
                .await?;
        }

        Ok(())
    }

    pub async fn start_test(&mut self) -> Result<(), RunError> {
        if !self.is_ready() {
            return Err(RunError::code("GLP2:TESTER_NOT_READY"));
        }
        self.exec_command("ST").await
    }

    /// Acknowledge a running visual check as passed or failed.
    pub async fn ack_vis_test(&mut self, pass: bool) -> Result<(), RunError> {
        self.exec_command(if pass { "QA;1" } else { "QA;0" }).await
    }

    /// Poll for actual values. `None` means the instrument has nothing new
    /// yet; callers keep polling.
    pub async fn get_actual_values(&mut self) -> Result<Option<Glp2Response>, RunError> {
        let poll = [STX, b'0' + self.device_id, ACK];
        self.send_logged(&poll)
            .await
            .map_err(|err| RunError::with_message("GLP2:COM_FAILURE", err.to_string()))?;

        match self
            .recv_logged()
            .await
            .map_err(|err| RunError::with_message("GLP2:COM_FAILURE", err.to_string()))?
        {
            WireEvent::Nak => Ok(None),
            WireEvent::Ack => Ok(None),
            WireEvent::Frame(frame) => {
                let payload =
                    frame_payload(&frame).ok_or_else(|| RunError::code(UNEXPECTED_RESPONSE))?;
                let payload = std::str::from_utf8(payload)
                    .map_err(|_| RunError::code(UNEXPECTED_RESPONSE))?;
                response::parse_response(payload).map(Some)
            }
        }
    }
}

#[cfg(feature = "instrument_serial")]
pub use serial_link::SerialTesterLink;

#[cfg(feature = "instrument_serial")]
mod serial_link {
    use super::{TesterLink, WireEvent, ACK, ETX, NAK, STX};
    use crate::error::{RigError, RigResult};
    use async_trait::async_trait;
    use serialport::SerialPort;
    use std::io::{Read, Write};
    use std::sync::{Arc, Mutex};
    use std::time::{Duration, Instant};

    /// Blocking serial port driven from Tokio's blocking pool, the same shape
    /// as the station's other serial adapters.
    pub struct SerialTesterLink {
        port: Arc<Mutex<Box<dyn SerialPort>>>,
        response_timeout: Duration,
    }

    impl SerialTesterLink {
        pub fn open(port_name: &str, baud_rate: u32) -> RigResult<Self> {
            let port = serialport::new(port_name, baud_rate)
                .timeout(Duration::from_millis(100))
                .open()
                .map_err(|err| RigError::Transport(err.to_string()))?;
            Ok(Self {
                port: Arc::new(Mutex::new(port)),
                response_timeout: Duration::from_millis(2000),
            })
        }
    }

    #[async_trait]
    impl TesterLink for SerialTesterLink {
        async fn send(&mut self, bytes: &[u8]) -> RigResult<()> {
            let port = Arc::clone(&self.port);
            let bytes = bytes.to_vec();
            tokio::task::spawn_blocking(move || {
                let mut port = port.lock().unwrap();
                port.write_all(&bytes)?;
                port.flush()?;
                Ok::<(), std::io::Error>(())
            })
            .await
            .map_err(|err| RigError::Transport(err.to_string()))??;
            Ok(())
        }

        async fn recv(&mut self) -> RigResult<WireEvent> {
            let port = Arc::clone(&self.port);
            let deadline = Instant::now() + self.response_timeout;
            tokio::task::spawn_blocking(move || {
                let mut port = port.lock().unwrap();
                let mut frame: Vec<u8> = Vec::new();
                let mut byte = [0u8; 1];
                loop {
                    if Instant::now() > deadline {
                        return Err(RigError::Transport("tester response timed out".into()));
                    }
                    match port.read(&mut byte) {
                        Ok(1) => {}
                        Ok(_) => continue,
                        Err(err) if err.kind() == std::io::ErrorKind::TimedOut => continue,
                        Err(err) => return Err(err.into()),
                    }

                    if frame.is_empty() {
                        match byte[0] {
                            ACK => return Ok(WireEvent::Ack),
                            NAK => return Ok(WireEvent::Nak),
                            STX => frame.push(STX),
                            _ => continue,
                        }
                    } else {
                        frame.push(byte[0]);
                        if byte[0] == ETX {
                            return Ok(WireEvent::Frame(frame));
                        }
                    }
                }
            })
            .await
            .map_err(|err| RigError::Transport(err.to_string()))?
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::collections::VecDeque;

    /// Scripted link answering each sent command from a queue.
    pub struct ScriptedLink {
        pub sent: Vec<Vec<u8>>,
        pub responses: VecDeque<WireEvent>,
    }

    impl ScriptedLink {
        pub fn new(responses: Vec<WireEvent>) -> Self {
            Self {
                sent: Vec::new(),
                responses: VecDeque::from(responses),
            }
        }

        pub fn frame(payload: &str) -> WireEvent {
            WireEvent::Frame(build_frame(payload))
        }
    }

    #[async_trait]
    impl TesterLink for ScriptedLink {
        async fn send(&mut self, bytes: &[u8]) -> RigResult<()> {
            self.sent.push(bytes.to_vec());
            Ok(())
        }

        async fn recv(&mut self) -> RigResult<WireEvent> {
            self.responses
                .pop_front()
                .ok_or_else(|| RigError::Transport("no scripted response".into()))
        }
    }
}
