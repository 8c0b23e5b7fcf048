/// Error spine of the driver.
///
/// Every modem operation collapses into `Result<T, Error>`. The variants keep
/// the distinction the registration logic depends on: [`Error::Failed`] is
/// recoverable ("not yet"), [`Error::Timeout`] means the module stopped
/// answering altogether, everything else is a hard failure of the command or
/// the board wiring.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[non_exhaustive]
pub enum Error {
    /// The command executed cleanly but did not report the expected value
    /// (e.g. SIM present but not `READY`).
    Failed,
    /// The module answered `ERROR`, `+CME ERROR:` or `+CMS ERROR:`, or broke
    /// a transfer mid-way.
    Modem,
    /// No recognizable response arrived within the configured window.
    Timeout,
    /// A response overflowed the receive buffer or a caller-provided buffer.
    BufferOverflow,
    /// The requested radio technology is not supported by this module.
    UnsupportedRadioTech,
    /// The serial line could not be opened or written.
    Serial,
    /// Driving the reset or power pin failed.
    Gpio,
}

pub type Result<T> = core::result::Result<T, Error>;

impl From<embassy_time::TimeoutError> for Error {
    fn from(_: embassy_time::TimeoutError) -> Self {
        Error::Timeout
    }
}
