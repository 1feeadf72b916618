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

use crate::pipeline::Outcome;
use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::registry::Registry;
use std::fmt;
use std::sync::atomic::AtomicU64;
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};
use sysinfo::{Pid, ProcessesToUpdate, System};

pub const AVERAGE_TEMPERATURE: &str = "weather_average_temperature";
pub const AVERAGE_HUMIDITY: &str = "weather_average_humidity";

type FloatGauge = Gauge<f64, AtomicU64>;

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct StationLabels {
    station: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct OutcomeLabels {
    outcome: String,
}

/// Capability for publishing per-station values.
///
/// Each call overwrites the previous value for the `name` and `station` pair.
/// Implementations must accept concurrent calls for different stations.
pub trait MetricsSink: Send + Sync {
    fn set(&self, name: &str, station: &str, value: f64);
}

/// Gauges for the current average temperature and humidity of each station.
///
/// Both metrics are created and registered upon call to `AverageMetrics::new()` and
/// have a single "station" label.
#[derive(Debug)]
pub struct AverageMetrics {
    temperature: Family<StationLabels, FloatGauge>,
    humidity: Family<StationLabels, FloatGauge>,
}

impl AverageMetrics {
    pub fn new(reg: &mut Registry) -> Self {
        let temperature = Family::<StationLabels, FloatGauge>::default();
        let humidity = Family::<StationLabels, FloatGauge>::default();

        reg.register(
            AVERAGE_TEMPERATURE,
            "Average temperature in fahrenheit per station",
            temperature.clone(),
        );
        reg.register(
            AVERAGE_HUMIDITY,
            "Average relative humidity (0-100) per station",
            humidity.clone(),
        );

        Self { temperature, humidity }
    }

    fn family(&self, name: &str) -> Option<&Family<StationLabels, FloatGauge>> {
        match name {
            AVERAGE_TEMPERATURE => Some(&self.temperature),
            AVERAGE_HUMIDITY => Some(&self.humidity),
            _ => None,
        }
    }
}

impl MetricsSink for AverageMetrics {
    fn set(&self, name: &str, station: &str, value: f64) {
        match self.family(name) {
            Some(family) => {
                family
                    .get_or_create(&StationLabels {
                        station: station.to_owned(),
                    })
                    .set(value);
            }
            None => {
                tracing::debug!(message = "ignoring unknown metric", name = name, station = station);
            }
        }
    }
}

/// Counters describing what happened to each consumed record.
#[derive(Debug)]
pub struct RecordMetrics {
    records: Family<OutcomeLabels, Counter>,
    sink_errors: Counter,
}

impl RecordMetrics {
    pub fn new(reg: &mut Registry) -> Self {
        let records = Family::<OutcomeLabels, Counter>::default();
        let sink_errors: Counter = Counter::default();
        let start_time = FloatGauge::default();

        reg.register(
            "weather_records",
            "Records consumed by outcome (invalid, filtered, accepted)",
            records.clone(),
        );
        reg.register(
            "weather_sink_errors",
            "Averages that could not be written to the output",
            sink_errors.clone(),
        );
        reg.register(
            "weather_process_start_time_seconds",
            "Start time of the process since unix epoch in seconds",
            start_time.clone(),
        );

        if let Ok(d) = SystemTime::now().duration_since(UNIX_EPOCH) {
            start_time.set(d.as_secs_f64());
        }

        Self { records, sink_errors }
    }

    pub fn observe(&self, outcome: &Outcome) {
        self.records
            .get_or_create(&OutcomeLabels {
                outcome: outcome.label().to_owned(),
            })
            .inc();
    }

    pub fn sink_error(&self) {
        self.sink_errors.inc();
    }
}

/// Resource usage of this process, read from the operating system on `refresh()`.
///
/// The values are only as fresh as the last call to `refresh()` so it should be
/// called right before the registry is encoded.
pub struct ProcessMetrics {
    system: Mutex<System>,
    pid: Option<Pid>,
    resident_memory: Gauge,
    virtual_memory: Gauge,
    cpu_usage: FloatGauge,
    run_time: Gauge,
}

impl ProcessMetrics {
    pub fn new(reg: &mut Registry) -> Self {
        let resident_memory = Gauge::default();
        let virtual_memory = Gauge::default();
        let cpu_usage = FloatGauge::default();
        let run_time = Gauge::default();

        reg.register(
            "weather_process_resident_memory_bytes",
            "Resident memory size of the process in bytes",
            resident_memory.clone(),
        );
        reg.register(
            "weather_process_virtual_memory_bytes",
            "Virtual memory size of the process in bytes",
            virtual_memory.clone(),
        );
        reg.register(
            "weather_process_cpu_usage_percent",
            "CPU usage of the process since the previous refresh, 100 per fully used core",
            cpu_usage.clone(),
        );
        reg.register(
            "weather_process_run_time_seconds",
            "Time the process has been running in seconds",
            run_time.clone(),
        );

        let pid = match sysinfo::get_current_pid() {
            Ok(pid) => Some(pid),
            Err(e) => {
                tracing::warn!(message = "process metrics unavailable on this platform", error = e);
                None
            }
        };

        Self {
            system: Mutex::new(System::new()),
            pid,
            resident_memory,
            virtual_memory,
            cpu_usage,
            run_time,
        }
    }

    pub fn refresh(&self) {
        let pid = match self.pid {
            Some(pid) => pid,
            None => return,
        };

        let mut system = match self.system.lock() {
            Ok(system) => system,
            Err(_) => {
                tracing::warn!(message = "skipping process metrics refresh after panic in previous refresh");
                return;
            }
        };

        system.refresh_processes(ProcessesToUpdate::Some(&[pid]), true);
        match system.process(pid) {
            Some(process) => {
                self.resident_memory.set(clamp(process.memory()));
                self.virtual_memory.set(clamp(process.virtual_memory()));
                self.cpu_usage.set(f64::from(process.cpu_usage()));
                self.run_time.set(clamp(process.run_time()));
            }
            None => {
                tracing::debug!(message = "no process information for current process", pid = %pid);
            }
        }
    }
}

impl fmt::Debug for ProcessMetrics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessMetrics").field("pid", &self.pid).finish()
    }
}

fn clamp(v: u64) -> i64 {
    i64::try_from(v).unwrap_or(i64::MAX)
}
