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

use serde::Serialize;
use std::collections::HashMap;
use std::error;
use std::fmt;
use std::sync::{Arc, Mutex, RwLock};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// State for the station (or the whole store) can no longer be trusted because
    /// a writer panicked while holding it.
    Poisoned { station: Option<String> },
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Poisoned { station: Some(s) } => write!(f, "aggregate state for station {} is poisoned", s),
            Self::Poisoned { station: None } => write!(f, "aggregate store is poisoned"),
        }
    }
}

impl error::Error for StoreError {}

/// Running sums for a single station.
///
/// Both sums cover exactly `count` accepted readings.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct AggregateState {
    pub temperature_sum: f64,
    pub humidity_sum: f64,
    pub count: u64,
}

impl AggregateState {
    pub fn add(&mut self, temperature_f: f64, humidity: f64) {
        self.temperature_sum += temperature_f;
        self.humidity_sum += humidity;
        self.count += 1;
    }

    /// Current mean of everything added so far, `None` if nothing has been added.
    pub fn average(&self, station: &str) -> Option<AverageResult> {
        if self.count == 0 {
            None
        } else {
            Some(self.mean(station))
        }
    }

    // Callers must ensure count > 0
    fn mean(&self, station: &str) -> AverageResult {
        let count = self.count as f64;
        AverageResult {
            station: station.to_owned(),
            avg_temperature_f: self.temperature_sum / count,
            avg_humidity: self.humidity_sum / count,
        }
    }
}

/// All-time average temperature (Fahrenheit) and humidity for a station.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AverageResult {
    pub station: String,
    pub avg_temperature_f: f64,
    pub avg_humidity: f64,
}

/// Owner of per-station aggregate state.
///
/// Implementations must serialize concurrent updates for the same station so that
/// no increment is lost. Updates are not idempotent: applying the same reading
/// twice counts it twice.
pub trait AggregationStore: Send + Sync {
    /// Add a converted reading to the state for `station` and return the new average.
    fn update(&self, station: &str, temperature_f: f64, humidity: f64) -> Result<AverageResult, StoreError>;

    /// Current average for `station`, if any reading has been accepted for it.
    fn get(&self, station: &str) -> Result<Option<AverageResult>, StoreError>;

    /// Current average of every known station, ordered by station.
    fn snapshot(&self) -> Result<Vec<AverageResult>, StoreError>;
}

/// In-memory `AggregationStore` with a lock per station.
///
/// Nothing is persisted: state starts empty every time the process starts.
#[derive(Debug, Default)]
pub struct MemoryStore {
    stations: RwLock<HashMap<String, Arc<Mutex<AggregateState>>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn entry(&self, station: &str) -> Result<Arc<Mutex<AggregateState>>, StoreError> {
        {
            let stations = self.stations.read().map_err(|_| poisoned(None))?;
            if let Some(state) = stations.get(station) {
                return Ok(Arc::clone(state));
            }
        }

        let mut stations = self.stations.write().map_err(|_| poisoned(None))?;
        Ok(Arc::clone(stations.entry(station.to_owned()).or_default()))
    }
}

impl AggregationStore for MemoryStore {
    fn update(&self, station: &str, temperature_f: f64, humidity: f64) -> Result<AverageResult, StoreError> {
        let entry = self.entry(station)?;
        let mut state = entry.lock().map_err(|_| poisoned(Some(station)))?;
        state.add(temperature_f, humidity);
        Ok(state.mean(station))
    }

    fn get(&self, station: &str) -> Result<Option<AverageResult>, StoreError> {
        let entry = {
            let stations = self.stations.read().map_err(|_| poisoned(None))?;
            match stations.get(station) {
                Some(e) => Arc::clone(e),
                None => return Ok(None),
            }
        };

        let state = entry.lock().map_err(|_| poisoned(Some(station)))?;
        Ok(state.average(station))
    }

    fn snapshot(&self) -> Result<Vec<AverageResult>, StoreError> {
        let entries: Vec<(String, Arc<Mutex<AggregateState>>)> = {
            let stations = self.stations.read().map_err(|_| poisoned(None))?;
            stations.iter().map(|(k, v)| (k.clone(), Arc::clone(v))).collect()
        };

        let mut out = Vec::with_capacity(entries.len());
        for (station, entry) in entries {
            let state = entry.lock().map_err(|_| poisoned(Some(&station)))?;
            if let Some(avg) = state.average(&station) {
                out.push(avg);
            }
        }

        out.sort_by(|a, b| a.station.cmp(&b.station));
        Ok(out)
    }
}

fn poisoned(station: Option<&str>) -> StoreError {
    StoreError::Poisoned {
        station: station.map(|s| s.to_owned()),
    }
}

#[cfg(test)]
mod test {
    use super::{AggregateState, AggregationStore, MemoryStore};
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_empty_state_has_no_average() {
        assert_eq!(None, AggregateState::default().average("A"));
    }

    #[test]
    fn test_update_running_average() {
        let store = MemoryStore::new();

        let first = store.update("A", 95.0, 50.0).unwrap();
        assert_eq!(95.0, first.avg_temperature_f);
        assert_eq!(50.0, first.avg_humidity);

        let second = store.update("A", 104.0, 60.0).unwrap();
        assert_eq!(99.5, second.avg_temperature_f);
        assert_eq!(55.0, second.avg_humidity);
        assert_eq!(Some(second), store.get("A").unwrap());
    }

    #[test]
    fn test_get_unknown_station() {
        let store = MemoryStore::new();
        store.update("A", 95.0, 50.0).unwrap();
        assert_eq!(None, store.get("B").unwrap());
    }

    #[test]
    fn test_key_isolation() {
        let store = MemoryStore::new();
        let a = store.update("A", 95.0, 50.0).unwrap();

        for i in 0..100 {
            store.update("B", 100.0 + i as f64, 10.0).unwrap();
        }

        assert_eq!(Some(a), store.get("A").unwrap());
    }

    #[test]
    fn test_snapshot_sorted() {
        let store = MemoryStore::new();
        store.update("C", 90.0, 10.0).unwrap();
        store.update("A", 95.0, 50.0).unwrap();
        store.update("B", 100.0, 20.0).unwrap();

        let stations: Vec<String> = store.snapshot().unwrap().into_iter().map(|r| r.station).collect();
        assert_eq!(vec!["A", "B", "C"], stations);
    }

    #[test]
    fn test_concurrent_same_key_updates() {
        let store = Arc::new(MemoryStore::new());
        let threads: Vec<_> = (0..8)
            .map(|_| {
                let store = Arc::clone(&store);
                thread::spawn(move || {
                    for _ in 0..1000 {
                        store.update("A", 100.0, 50.0).unwrap();
                        store.update("A", 90.0, 40.0).unwrap();
                    }
                })
            })
            .collect();

        for t in threads {
            t.join().unwrap();
        }

        let entry = store.entry("A").unwrap();
        let state = entry.lock().unwrap();
        assert_eq!(16_000, state.count);
        assert_eq!(8000.0 * 190.0, state.temperature_sum);
        assert_eq!(8000.0 * 90.0, state.humidity_sum);
    }
}
