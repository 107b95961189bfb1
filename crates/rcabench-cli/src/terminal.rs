//! Viewer host that prints tables to the terminal.

use std::io::{self, Write};

use arrow_cast::pretty::pretty_format_batches;
use async_trait::async_trait;
use rcabench_viewer::{DisplayConfig, TableRef, ViewerHost, error::ViewerError};
use tracing::debug;

/// Prints the first rows of each loaded table.
#[derive(Debug)]
pub struct TerminalViewer {
    rows: usize,
    /// Print to stderr so stdout stays machine readable.
    to_stderr: bool,
}

impl TerminalViewer {
    #[must_use]
    pub const fn new(rows: usize, to_stderr: bool) -> Self {
        Self { rows, to_stderr }
    }

    fn write(&self, text: &str) -> io::Result<()> {
        if self.to_stderr {
            writeln!(io::stderr().lock(), "{text}")
        } else {
            writeln!(io::stdout().lock(), "{text}")
        }
    }
}

fn host_error(error: impl ToString) -> ViewerError {
    ViewerError::Host(error.to_string())
}

#[async_trait]
impl ViewerHost for TerminalViewer {
    fn is_attached(&self) -> bool {
        true
    }

    async fn load(&mut self, table: TableRef) -> Result<(), ViewerError> {
        let total = table.num_rows().await.map_err(host_error)?;
        let preview = table.preview(self.rows).await.map_err(host_error)?;
        let shown = preview.num_rows();
        let text = pretty_format_batches(&[preview]).map_err(host_error)?;
        self.write(&format!("{text}\n{shown} of {total} rows"))
            .map_err(host_error)
    }

    async fn reset(&mut self) -> Result<(), ViewerError> {
        Ok(())
    }

    async fn restore(&mut self, config: DisplayConfig) -> Result<(), ViewerError> {
        debug!(?config, "Display configuration restored");
        Ok(())
    }

    async fn dispose(&mut self) {
        debug!("Terminal viewer disposed");
    }
}
