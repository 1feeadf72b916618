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

use crate::store::AverageResult;
use async_trait::async_trait;
use std::error;
use std::fmt;
use std::io;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc::{self, Receiver, Sender};

#[derive(Debug)]
pub enum SinkError {
    Closed,
    Io(io::Error),
}

impl fmt::Display for SinkError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Closed => write!(f, "output channel closed"),
            Self::Io(e) => write!(f, "{}", e),
        }
    }
}

impl error::Error for SinkError {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            _ => None,
        }
    }
}

/// Record emitted to the output channel, keyed by station.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputRecord {
    pub key: String,
    pub value: String,
}

/// Destination for formatted averages.
///
/// Sending may wait for the destination to catch up, which is how a slow output
/// slows the workers down instead of buffering without limit.
#[async_trait]
pub trait RecordSink: Send + Sync {
    async fn send(&self, key: &str, value: &str) -> Result<(), SinkError>;
}

/// Render an average as the human readable value of an output record, for example
/// `A : Température Moyenne = 95.0°F, Humidité Moyenne = 50.0%`.
pub fn format_average(avg: &AverageResult) -> String {
    format!(
        "{} : Température Moyenne = {}°F, Humidité Moyenne = {}%",
        avg.station,
        decimal(avg.avg_temperature_f),
        decimal(avg.avg_humidity)
    )
}

/// Shortest representation that round-trips, always with a fractional part.
///
/// Magnitudes of at least 10^7 or below 10^-3 switch to scientific notation with
/// an upper case exponent marker (`1.0E7`, `1.5E-4`) and plain notation is used
/// everywhere else (`95.0`, `104.36`).
fn decimal(v: f64) -> String {
    let magnitude = v.abs();
    if !v.is_finite() || v == 0.0 || (1e-3..1e7).contains(&magnitude) {
        return format!("{:?}", v);
    }

    let sci = format!("{:e}", v);
    match sci.split_once('e') {
        Some((mantissa, exponent)) if mantissa.contains('.') => format!("{}E{}", mantissa, exponent),
        Some((mantissa, exponent)) => format!("{}.0E{}", mantissa, exponent),
        None => sci,
    }
}

/// Sink that hands records to a writer task through a bounded queue.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: Sender<OutputRecord>,
}

impl ChannelSink {
    /// Create a sink and the receiving end for `write_records`. Once `capacity`
    /// records (at least one) are waiting to be written, `send` waits for room.
    pub fn channel(capacity: usize) -> (Self, Receiver<OutputRecord>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }
}

#[async_trait]
impl RecordSink for ChannelSink {
    async fn send(&self, key: &str, value: &str) -> Result<(), SinkError> {
        self.tx
            .send(OutputRecord {
                key: key.to_owned(),
                value: value.to_owned(),
            })
            .await
            .map_err(|_| SinkError::Closed)
    }
}

/// Write records from `rx` to `writer` as `<key>\t<value>` lines until every
/// `ChannelSink` has been dropped, returning the number of records written.
///
/// The receiver is dropped on the first write error which makes any further
/// `ChannelSink::send` fail.
pub async fn write_records<W>(mut rx: Receiver<OutputRecord>, mut writer: W) -> Result<u64, SinkError>
where
    W: AsyncWrite + Unpin,
{
    let mut written = 0;
    while let Some(record) = rx.recv().await {
        let line = format!("{}\t{}\n", record.key, record.value);
        writer.write_all(line.as_bytes()).await.map_err(SinkError::Io)?;
        writer.flush().await.map_err(SinkError::Io)?;
        written += 1;
    }

    Ok(written)
}
