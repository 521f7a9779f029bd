use std::time::Duration;

/// Default wait for a transaction response.
pub const DEFAULT_RESPONSE_TIMEOUT: Duration = Duration::from_millis(2000);

/// Initial reader buffer size in words (1 MiB).
pub const DEFAULT_INITIAL_BUFFER_WORDS: usize = 256 * 1024;

/// Command pipe engine settings.
///
/// The reader loop checks its stop flag whenever a transport read times
/// out, so shutdown latency follows the transport's read timeout.
#[derive(Debug, Clone)]
pub struct CmdPipeConfig {
    /// Wait for a super frame response.
    pub super_timeout: Duration,
    /// Wait for the stack frame after the immediate stack was triggered.
    pub stack_timeout: Duration,
    pub initial_buffer_words: usize,
}

impl Default for CmdPipeConfig {
    fn default() -> Self {
        Self {
            super_timeout: DEFAULT_RESPONSE_TIMEOUT,
            stack_timeout: DEFAULT_RESPONSE_TIMEOUT,
            initial_buffer_words: DEFAULT_INITIAL_BUFFER_WORDS,
        }
    }
}
