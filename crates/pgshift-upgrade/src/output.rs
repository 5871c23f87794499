//! Accumulating output sink for external operations.

use std::collections::VecDeque;
use std::io::{self, Write};

use pgshift_core::Config;

/// Bytes kept for diagnostics; older output is discarded first.
const MAX_BUFFERED_BYTES: usize = 4 * 1024 * 1024;

/// Collects pull progress, helper logs, and privileged command output.
///
/// Everything written is buffered so it can be attached to an error. With an
/// echo writer (stdout when verbose) the same bytes are also forwarded live.
pub struct OutputSink {
    buffer: VecDeque<u8>,
    echo: Option<Box<dyn Write>>,
}

impl OutputSink {
    /// Buffer only.
    #[must_use]
    pub const fn buffered() -> Self {
        Self {
            buffer: VecDeque::new(),
            echo: None,
        }
    }

    /// Buffer and forward to `echo`.
    #[must_use]
    pub fn with_echo(echo: Box<dyn Write>) -> Self {
        Self {
            buffer: VecDeque::new(),
            echo: Some(echo),
        }
    }

    /// Stdout echo when `config.verbose`, buffer only otherwise.
    #[must_use]
    pub fn from_config(config: &Config) -> Self {
        if config.verbose {
            Self::with_echo(Box::new(io::stdout()))
        } else {
            Self::buffered()
        }
    }

    #[must_use]
    pub const fn is_echoing(&self) -> bool {
        self.echo.is_some()
    }

    /// Buffered output, lossily decoded.
    #[must_use]
    pub fn contents(&self) -> String {
        let (head, tail) = self.buffer.as_slices();
        String::from_utf8_lossy(&[head, tail].concat()).into_owned()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }
}

impl Default for OutputSink {
    fn default() -> Self {
        Self::buffered()
    }
}

impl std::fmt::Debug for OutputSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutputSink")
            .field("buffered_bytes", &self.buffer.len())
            .field("echo", &self.echo.is_some())
            .finish()
    }
}

impl Write for OutputSink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if let Some(echo) = self.echo.as_mut() {
            echo.write_all(buf)?;
        }
        self.buffer.extend(buf);
        // Oldest bytes go first.
        if self.buffer.len() > MAX_BUFFERED_BYTES {
            let excess = self.buffer.len() - MAX_BUFFERED_BYTES;
            self.buffer.drain(..excess);
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        match self.echo.as_mut() {
            Some(echo) => echo.flush(),
            None => Ok(()),
        }
    }
}
