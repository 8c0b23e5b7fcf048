use embassy_time::{Duration, Timer};
use embedded_hal::digital::OutputPin;
use embedded_io_async::{ErrorType, Read, Write};

use crate::error::{Error, Result};

/// Baud rate the module talks at after power-up.
pub const DEFAULT_BAUD_RATE: u32 = 115_200;

const OPEN_RETRIES: u8 = 3;
const OPEN_RETRY_PAUSE: Duration = Duration::from_millis(500);

/// Byte-level transport the driver reaches the modem through.
///
/// Anything that can shuttle bytes works: a plain UART, or an I2C-bridged
/// UART expander. The driver never blocks inside the transport; reads are
/// raced against deadlines with `embassy_time::with_timeout`.
pub trait SerialPort: Read + Write {
    /// Bring the underlying device up at the given baud rate.
    async fn open(&mut self, baud: u32) -> core::result::Result<(), Self::Error>;

    /// Tear the underlying device down.
    async fn close(&mut self);
}

/// The modem's serial line: a [`SerialPort`] plus the reset pin of the
/// transport, with an idempotent bring-up lifecycle.
///
/// `init` and `open` are re-entrant no-ops once they have succeeded, so the
/// surrounding firmware can call them defensively.
pub struct SerialLine<S: SerialPort, P: OutputPin> {
    port: S,
    reset: P,
    initialized: bool,
    opened: bool,
    open_retries: u8,
    open_retry_pause: Duration,
}

impl<S: SerialPort, P: OutputPin> SerialLine<S, P> {
    pub fn new(port: S, reset: P) -> Self {
        Self {
            port,
            reset,
            initialized: false,
            opened: false,
            open_retries: OPEN_RETRIES,
            open_retry_pause: OPEN_RETRY_PAUSE,
        }
    }

    /// Overrides how often and how patiently [`open`](Self::open) retries.
    pub fn set_open_retry(&mut self, retries: u8, pause: Duration) {
        self.open_retries = retries;
        self.open_retry_pause = pause;
    }

    /// Releases the transport reset line.
    pub fn init(&mut self) -> Result<()> {
        if self.initialized {
            info!("serial line already initialized");
            return Ok(());
        }
        self.reset.set_high().map_err(|_| Error::Gpio)?;
        self.initialized = true;
        info!("serial line initialized");
        Ok(())
    }

    /// Opens the line, retrying a few times before giving up.
    pub async fn open(&mut self, baud: u32) -> Result<()> {
        if self.opened {
            info!("serial line already opened");
            return Ok(());
        }

        for attempt in 0..self.open_retries {
            if attempt > 0 {
                Timer::after(self.open_retry_pause).await;
            }
            match self.port.open(baud).await {
                Ok(()) => {
                    self.opened = true;
                    info!("serial line opened");
                    return Ok(());
                }
                Err(_) => warn!("failed to open serial line, retrying"),
            }
        }

        error!("failed to open serial line, giving up");
        Err(Error::Serial)
    }

    pub async fn close(&mut self) {
        if !self.opened {
            info!("serial line already closed");
            return;
        }
        let _ = self.port.flush().await;
        self.port.close().await;
        self.opened = false;
    }

    pub fn is_open(&self) -> bool {
        self.opened
    }

    #[cfg(test)]
    pub(crate) fn port(&self) -> &S {
        &self.port
    }

    #[cfg(test)]
    pub(crate) fn port_mut(&mut self) -> &mut S {
        &mut self.port
    }
}

impl<S: SerialPort, P: OutputPin> ErrorType for SerialLine<S, P> {
    type Error = S::Error;
}

impl<S: SerialPort, P: OutputPin> Read for SerialLine<S, P> {
    async fn read(&mut self, buf: &mut [u8]) -> core::result::Result<usize, Self::Error> {
        self.port.read(buf).await
    }
}

impl<S: SerialPort, P: OutputPin> Write for SerialLine<S, P> {
    async fn write(&mut self, buf: &[u8]) -> core::result::Result<usize, Self::Error> {
        self.port.write(buf).await
    }

    async fn flush(&mut self) -> core::result::Result<(), Self::Error> {
        self.port.flush().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{MockPin, ScriptedPort, run};

    #[test]
    fn open_succeeds_within_the_retry_limit() {
        let mut port = ScriptedPort::new();
        port.fail_opens(2);
        let mut line = SerialLine::new(port, MockPin);
        line.set_open_retry(3, Duration::from_millis(5));

        run(async {
            assert_eq!(line.open(DEFAULT_BAUD_RATE).await, Ok(()));
        });
        assert!(line.is_open());
        assert_eq!(line.port().open_calls(), 3);
    }

    #[test]
    fn open_gives_up_after_the_last_retry() {
        let mut port = ScriptedPort::new();
        port.fail_opens(3);
        let mut line = SerialLine::new(port, MockPin);
        line.set_open_retry(3, Duration::from_millis(5));

        run(async {
            assert_eq!(line.open(DEFAULT_BAUD_RATE).await, Err(Error::Serial));
        });
        assert!(!line.is_open());
    }

    #[test]
    fn open_and_init_are_reentrant() {
        let mut line = SerialLine::new(ScriptedPort::new(), MockPin);

        assert_eq!(line.init(), Ok(()));
        assert_eq!(line.init(), Ok(()));
        run(async {
            assert_eq!(line.open(DEFAULT_BAUD_RATE).await, Ok(()));
            assert_eq!(line.open(DEFAULT_BAUD_RATE).await, Ok(()));
        });
        assert_eq!(line.port().open_calls(), 1);
    }
}
