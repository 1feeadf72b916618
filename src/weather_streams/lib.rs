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

//! Running per-station weather averages exported as Prometheus metrics
//!
//! ## Features
//!
//! `weather_streams` consumes a stream of weather readings, one per line, in the form
//! `<station>,<temperature celsius>,<humidity>`. Readings that can't be parsed are dropped,
//! as are readings that aren't strictly warmer than a threshold (30 degrees celsius by
//! default). Remaining readings are converted to fahrenheit and folded into an all-time
//! running average per station.
//!
//! After every accepted reading, the new average for the station is written to the output
//! as a `<station>\t<value>` line, for example:
//!
//! ```text
//! A	A : Température Moyenne = 99.5°F, Humidité Moyenne = 55.0%
//! ```
//!
//! The following metrics are emitted.
//!
//! * `weather_average_temperature{station=$STATION}` - Average temperature, in degrees fahrenheit.
//! * `weather_average_humidity{station=$STATION}` - Average relative humidity (0-100).
//! * `weather_records_total{outcome=$OUTCOME}` - Records consumed, by `invalid`, `filtered`, or `accepted`.
//! * `weather_sink_errors_total` - Averages that could not be written to the output.
//! * `weather_process_start_time_seconds` - Start time of the process.
//! * `weather_process_resident_memory_bytes` - Resident memory of the process.
//! * `weather_process_virtual_memory_bytes` - Virtual memory of the process.
//! * `weather_process_cpu_usage_percent` - CPU usage of the process between scrapes.
//! * `weather_process_run_time_seconds` - How long the process has been running.
//!
//! Averages are not windowed and are not persisted: they cover every reading accepted since
//! the process started. Replaying input that has already been consumed counts it again.
//!
//! ## Usage
//!
//! Records are read from stdin and averages written to stdout unless `--input` or `--output`
//! are given.
//!
//! ```text
//! tail -F readings.csv | ./weather_streams --output averages.tsv
//! ```
//!
//! Records are spread across `--partitions` workers by station. All records for a station are
//! handled by the same worker, in the order they were read. Lines that are not valid UTF-8 are
//! dropped like any other malformed record. When the output can't keep up, workers wait for
//! it rather than buffering averages without limit.
//!
//! Once the input is exhausted, metrics keep being served until `SIGTERM` or `SIGINT`. If a
//! worker stops because of an error, the remaining records are drained and the process exits
//! with status 1.
//!
//! ### Prometheus
//!
//! Prometheus metrics are exposed on port `1234` at `/metrics`. The current averages are also
//! available as JSON at `/averages` and `/averages/$STATION`.
//!
//! ```yaml
//! scrape_configs:
//! - job_name: weather_streams
//!   static_configs:
//!   - targets: ['example:1234']
//! ```
//!

pub mod http;
pub mod metrics;
pub mod pipeline;
pub mod reading;
pub mod sink;
pub mod source;
pub mod store;
pub mod worker;
