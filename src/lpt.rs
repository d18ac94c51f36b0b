//! Parallel-port gated programming.
//!
//! Some fixtures gate programming on a parallel-port input: the run may only
//! proceed once the fixture asserts its ready bit, and the station reports
//! the outcome back on an output bit. Register access goes through
//! [`LptPort`] so the gate logic is testable without hardware.

use crate::broker::CancelToken;
use crate::error::{RigResult, RunError};
use crate::settings::Settings;
use log::debug;
use std::time::Duration;
use tokio::time::Instant;

/// Raw parallel-port register access.
pub trait LptPort: Send + Sync {
    fn read(&self, port: u16) -> RigResult<u8>;
    fn write(&self, port: u16, value: u8) -> RigResult<()>;
}

impl<P: LptPort + ?Sized> LptPort for std::sync::Arc<P> {
    fn read(&self, port: u16) -> RigResult<u8> {
        (**self).read(port)
    }

    fn write(&self, port: u16, value: u8) -> RigResult<()> {
        (**self).write(port, value)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct LptConfig {
    pub start_timeout: Duration,
    pub read_port: u16,
    pub read_bit: u8,
    pub read_inverted: bool,
    pub write_port: u16,
    pub write_bit: u8,
}

impl LptConfig {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            start_timeout: Duration::from_millis(settings.lpt_start_timeout_ms.max(100)),
            read_port: settings.lpt_read_port,
            read_bit: settings.lpt_read_bit,
            read_inverted: settings.lpt_read_inverted,
            write_port: settings.lpt_write_port,
            write_bit: settings.lpt_write_bit,
        }
    }
}

/// One gate session. `finish` runs at most once; dropping an unfinished
/// session reports failure.
pub struct LptIo<P: LptPort> {
    port: P,
    config: LptConfig,
    finished: bool,
}

impl<P: LptPort> LptIo<P> {
    pub fn new(port: P, config: LptConfig) -> Self {
        Self {
            port,
            config,
            finished: false,
        }
    }

    pub fn config(&self) -> &LptConfig {
        &self.config
    }

    /// Wait for the fixture to assert the ready bit.
    pub async fn start(&mut self, cancel: &CancelToken) -> Result<(), RunError> {
        let deadline = Instant::now() + self.config.start_timeout;
        let mask = 1u8 << self.config.read_bit;

        loop {
            if cancel.is_cancelled() {
                return Err(RunError::cancelled());
            }

            let value = self
                .port
                .read(self.config.read_port)
                .map_err(|err| RunError::with_message("LPT:READ_FAILURE", err.to_string()))?;
            let mut asserted = value & mask != 0;
            if self.config.read_inverted {
                asserted = !asserted;
            }
            if asserted {
                debug!("[lpt] start bit asserted (port {:#x})", self.config.read_port);
                return Ok(());
            }

            if Instant::now() >= deadline {
                return Err(RunError::code("LPT:START_TIMEOUT"));
            }

            tokio::select! {
                _ = cancel.cancelled() => return Err(RunError::cancelled()),
                _ = tokio::time::sleep(Duration::from_millis(50)) => {}
            }
        }
    }

    /// Report the run outcome on the output bit. Idempotent.
    pub fn finish(&mut self, success: bool) {
        if self.finished {
            return;
        }
        self.finished = true;

        let value = if success {
            1u8 << self.config.write_bit
        } else {
            0
        };
        if let Err(err) = self.port.write(self.config.write_port, value) {
            debug!("[lpt] failed to write outcome: {}", err);
        }
    }
}

impl<P: LptPort> Drop for LptIo<P> {
    fn drop(&mut self) {
        self.finish(false);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::cancel_pair;
    use std::sync::atomic::{AtomicU8, Ordering};
    use std::sync::Arc;

    #[derive(Clone)]
    struct MemPort {
        input: Arc<AtomicU8>,
        output: Arc<AtomicU8>,
    }

    impl LptPort for MemPort {
        fn read(&self, _port: u16) -> RigResult<u8> {
            Ok(self.input.load(Ordering::SeqCst))
        }

        fn write(&self, _port: u16, value: u8) -> RigResult<()> {
            self.output.store(value, Ordering::SeqCst);
            Ok(())
        }
    }

    fn config(timeout_ms: u64) -> LptConfig {
        LptConfig {
            start_timeout: Duration::from_millis(timeout_ms),
            read_port: 0x379,
            read_bit: 5,
            read_inverted: false,
            write_port: 0x378,
            write_bit: 0,
        }
    }

    #[tokio::test]
    async fn start_waits_for_the_ready_bit() {
        let port = MemPort {
            input: Arc::new(AtomicU8::new(0)),
            output: Arc::new(AtomicU8::new(0xFF)),
        };
        let input = Arc::clone(&port.input);
        let output = Arc::clone(&port.output);
        let mut lpt = LptIo::new(port, config(2000));
        let (_handle, cancel) = cancel_pair();

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(80)).await;
            input.store(1 << 5, Ordering::SeqCst);
        });

        lpt.start(&cancel).await.unwrap();
        lpt.finish(true);
        lpt.finish(false);
        assert_eq!(output.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn start_times_out_without_the_bit() {
        let port = MemPort {
            input: Arc::new(AtomicU8::new(0)),
            output: Arc::new(AtomicU8::new(0)),
        };
        let mut lpt = LptIo::new(port, config(120));
        let (_handle, cancel) = cancel_pair();

        let err = lpt.start(&cancel).await.unwrap_err();
        assert_eq!(err.code, "LPT:START_TIMEOUT");
    }

    #[tokio::test]
    async fn inverted_polarity_flips_the_ready_condition() {
        let port = MemPort {
            input: Arc::new(AtomicU8::new(0)),
            output: Arc::new(AtomicU8::new(0)),
        };
        let mut cfg = config(2000);
        cfg.read_inverted = true;
        let mut lpt = LptIo::new(port, cfg);
        let (_handle, cancel) = cancel_pair();

        // Bit low plus inverted polarity reads as asserted immediately.
        lpt.start(&cancel).await.unwrap();
    }

    #[tokio::test]
    async fn dropping_an_unfinished_session_reports_failure() {
        let output = Arc::new(AtomicU8::new(0xFF));
        let port = MemPort {
            input: Arc::new(AtomicU8::new(1 << 5)),
            output: Arc::clone(&output),
        };
        {
            let _lpt = LptIo::new(port, config(100));
        }
        assert_eq!(output.load(Ordering::SeqCst), 0);
    }
}
