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

use crate::metrics::{MetricsSink, AVERAGE_HUMIDITY, AVERAGE_TEMPERATURE};
use crate::reading::{ParseError, Reading};
use crate::sink::{format_average, RecordSink, SinkError};
use crate::store::{AggregationStore, AverageResult, StoreError};
use std::error;
use std::fmt;
use std::sync::Arc;

pub const DEFAULT_MIN_TEMPERATURE_C: f64 = 30.0;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PipelineConfig {
    /// Readings must be strictly warmer than this, in celsius, to be aggregated.
    pub min_temperature_c: f64,
}

impl PipelineConfig {
    pub fn accepts(&self, reading: &Reading) -> bool {
        reading.temperature_c > self.min_temperature_c
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        PipelineConfig {
            min_temperature_c: DEFAULT_MIN_TEMPERATURE_C,
        }
    }
}

/// What happened to a single record.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Invalid(ParseError),
    Filtered,
    Accepted(AverageResult),
}

impl Outcome {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Invalid(_) => "invalid",
            Self::Filtered => "filtered",
            Self::Accepted(_) => "accepted",
        }
    }
}

/// Failure processing a record that must not be ignored.
#[derive(Debug)]
pub enum PipelineError {
    /// The update could not be applied, nothing was published.
    Store(StoreError),
    /// The update was applied and metrics were set but the average could not be
    /// written to the output.
    Sink { result: AverageResult, error: SinkError },
}

impl fmt::Display for PipelineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Store(e) => write!(f, "unable to update aggregate: {}", e),
            Self::Sink { result, error } => {
                write!(f, "unable to emit average for station {}: {}", result.station, error)
            }
        }
    }
}

impl error::Error for PipelineError {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match self {
            Self::Store(e) => Some(e),
            Self::Sink { error, .. } => Some(error),
        }
    }
}

impl From<StoreError> for PipelineError {
    fn from(e: StoreError) -> Self {
        PipelineError::Store(e)
    }
}

/// Parse, filter, convert, re-key and aggregate records, publishing the new average
/// of a station after every record accepted for it.
pub struct Pipeline {
    config: PipelineConfig,
    store: Arc<dyn AggregationStore>,
    metrics: Arc<dyn MetricsSink>,
    sink: Arc<dyn RecordSink>,
}

impl Pipeline {
    pub fn new(
        config: PipelineConfig,
        store: Arc<dyn AggregationStore>,
        metrics: Arc<dyn MetricsSink>,
        sink: Arc<dyn RecordSink>,
    ) -> Self {
        Pipeline {
            config,
            store,
            metrics,
            sink,
        }
    }

    /// Run one raw record, as read from the input, through every stage.
    ///
    /// Records that are not UTF-8 or do not parse are dropped as `Outcome::Invalid`.
    pub async fn process(&self, raw: impl AsRef<[u8]>) -> Result<Outcome, PipelineError> {
        let raw = raw.as_ref();
        let reading = match Reading::parse_bytes(raw) {
            Ok(r) => r,
            Err(e) => {
                tracing::debug!(
                    message = "dropping invalid record",
                    record = %String::from_utf8_lossy(raw),
                    reason = %e,
                );
                return Ok(Outcome::Invalid(e));
            }
        };

        if !self.config.accepts(&reading) {
            tracing::trace!(
                message = "dropping reading below threshold",
                station = %reading.station,
                temperature_c = reading.temperature_c,
            );
            return Ok(Outcome::Filtered);
        }

        let converted = reading.to_fahrenheit();
        let station = converted.key();
        let result = self.store.update(station, converted.temperature_f, converted.humidity)?;

        self.metrics.set(AVERAGE_TEMPERATURE, station, result.avg_temperature_f);
        self.metrics.set(AVERAGE_HUMIDITY, station, result.avg_humidity);

        if let Err(error) = self.sink.send(station, &format_average(&result)).await {
            return Err(PipelineError::Sink { result, error });
        }

        tracing::debug!(
            message = "updated station average",
            station = %result.station,
            avg_temperature_f = result.avg_temperature_f,
            avg_humidity = result.avg_humidity,
        );

        Ok(Outcome::Accepted(result))
    }
}

impl fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pipeline").field("config", &self.config).finish()
    }
}
