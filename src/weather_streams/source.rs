// weather_streams - Running per-station weather averages exported as Prometheus metrics
//
// Copyright 2022 Nick Pillitteri
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <http://www.gnu.org/licenses/>.
//

use crate::worker::{DispatchError, Dispatcher};
use std::error;
use std::fmt;
use std::future::Future;
use std::io;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};

#[derive(Debug)]
pub enum SourceError {
    Io(io::Error),
    Dispatch(DispatchError),
}

impl fmt::Display for SourceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(e) => write!(f, "unable to read input: {}", e),
            Self::Dispatch(e) => write!(f, "{}", e),
        }
    }
}

impl error::Error for SourceError {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            Self::Dispatch(e) => Some(e),
        }
    }
}

impl From<DispatchError> for SourceError {
    fn from(e: DispatchError) -> Self {
        SourceError::Dispatch(e)
    }
}

/// Summary of a completed read of the input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Consumed {
    pub lines: u64,
    /// True when the end of the input was reached, false when stopped by `shutdown`.
    pub exhausted: bool,
}

/// Read records, one per line, from `reader` and dispatch each to its partition.
///
/// Lines are passed on as raw bytes so a line that is not UTF-8 is dropped by the
/// pipeline like any other invalid record instead of ending the input. Blank lines
/// are skipped. Reading stops at the end of the input, on the first error, or as
/// soon as `shutdown` completes. Records already dispatched are left for the
/// workers to finish.
pub async fn consume_lines<R, F>(mut reader: R, dispatcher: &Dispatcher, shutdown: F) -> Result<Consumed, SourceError>
where
    R: AsyncBufRead + Unpin,
    F: Future<Output = ()>,
{
    // Partial reads stay in the buffer when the shutdown branch wins the select.
    let mut buf = Vec::new();
    let mut consumed = Consumed {
        lines: 0,
        exhausted: false,
    };

    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = &mut shutdown => {
                tracing::info!(message = "stopping input on shutdown", lines = consumed.lines);
                return Ok(consumed);
            }
            read = reader.read_until(b'\n', &mut buf) => {
                if read.map_err(SourceError::Io)? == 0 {
                    tracing::info!(message = "input exhausted", lines = consumed.lines);
                    consumed.exhausted = true;
                    return Ok(consumed);
                }

                let line = trim_line_ending(&buf);
                if !line.iter().all(u8::is_ascii_whitespace) {
                    dispatcher.dispatch(line).await?;
                    consumed.lines += 1;
                }
                buf.clear();
            }
        }
    }
}

fn trim_line_ending(line: &[u8]) -> &[u8] {
    let line = line.strip_suffix(b"\n").unwrap_or(line);
    line.strip_suffix(b"\r").unwrap_or(line)
}
