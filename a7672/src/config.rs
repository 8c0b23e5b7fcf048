use embassy_time::Duration;

/// Smallest accepted `+HTTPREAD` chunk.
pub const HTTP_READ_CHUNK_MIN: usize = 16;
/// Largest accepted `+HTTPREAD` chunk.
pub const HTTP_READ_CHUNK_MAX: usize = 1024;

/// Driver tuning knobs.
///
/// The defaults match the module datasheet and are what a production build
/// should run with. The windows and pauses exist as fields so that
/// integrations with unusual networks (or scripted tests) can shrink or
/// stretch them without patching the driver.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Config {
    /// Default window for a command's final result code.
    pub at_response_timeout: Duration,
    /// Chunk size for `+HTTPREAD` loops, clamped to
    /// [`HTTP_READ_CHUNK_MIN`]..=[`HTTP_READ_CHUNK_MAX`].
    pub http_read_chunk_size: usize,
    /// `CONNECTTO` used to size the `+HTTPACTION` wait when the caller does
    /// not provide one, in seconds.
    pub http_connect_timeout: u16,
    /// `RECVTO` used to size the `+HTTPACTION` wait when the caller does not
    /// provide one, in seconds.
    pub http_response_timeout: u16,
    /// Pause before retrying a failed registration step.
    pub registration_retry_pause: Duration,
    /// How long registration status may stay unsettled before the network
    /// gets reconfigured.
    pub registration_check_window: Duration,
    /// How long the service checks may stay unsettled before the packet
    /// service gets reconfigured.
    pub service_check_window: Duration,
    /// Wait after `+CNBP` so the band selection settles before `+COPS=0,2`.
    pub band_settle_pause: Duration,
    /// Pause between `+CMQTTACCQ` and `+CMQTTCONNECT`.
    pub mqtt_acquire_settle: Duration,
    /// Pause after each dialect setup command during (re)initialization.
    pub init_settle_pause: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            at_response_timeout: Duration::from_millis(9000),
            http_read_chunk_size: 200,
            http_connect_timeout: 120,
            http_response_timeout: 20,
            registration_retry_pause: Duration::from_secs(1),
            registration_check_window: Duration::from_secs(15),
            service_check_window: Duration::from_secs(10),
            band_settle_pause: Duration::from_secs(5),
            mqtt_acquire_settle: Duration::from_secs(3),
            init_settle_pause: Duration::from_secs(2),
        }
    }
}

impl Config {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_at_response_timeout(mut self, timeout: Duration) -> Self {
        self.at_response_timeout = timeout;
        self
    }

    pub fn with_http_read_chunk_size(mut self, size: usize) -> Self {
        self.http_read_chunk_size = size.clamp(HTTP_READ_CHUNK_MIN, HTTP_READ_CHUNK_MAX);
        self
    }

    pub fn with_http_connect_timeout(mut self, seconds: u16) -> Self {
        self.http_connect_timeout = seconds;
        self
    }

    pub fn with_http_response_timeout(mut self, seconds: u16) -> Self {
        self.http_response_timeout = seconds;
        self
    }

    pub fn with_registration_retry_pause(mut self, pause: Duration) -> Self {
        self.registration_retry_pause = pause;
        self
    }

    pub fn with_registration_check_window(mut self, window: Duration) -> Self {
        self.registration_check_window = window;
        self
    }

    pub fn with_service_check_window(mut self, window: Duration) -> Self {
        self.service_check_window = window;
        self
    }

    pub fn with_band_settle_pause(mut self, pause: Duration) -> Self {
        self.band_settle_pause = pause;
        self
    }

    pub fn with_mqtt_acquire_settle(mut self, pause: Duration) -> Self {
        self.mqtt_acquire_settle = pause;
        self
    }

    pub fn with_init_settle_pause(mut self, pause: Duration) -> Self {
        self.init_settle_pause = pause;
        self
    }
}
