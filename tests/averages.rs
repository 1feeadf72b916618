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

use prometheus_client::encoding::text::encode;
use prometheus_client::registry::Registry;
use std::sync::Arc;
use tokio::sync::mpsc::Receiver;
use weather_streams::metrics::AverageMetrics;
use weather_streams::pipeline::{Outcome, Pipeline, PipelineConfig};
use weather_streams::sink::{ChannelSink, OutputRecord};
use weather_streams::store::{AggregationStore, AverageResult, MemoryStore};

struct Harness {
    registry: Registry,
    store: Arc<MemoryStore>,
    output: Receiver<OutputRecord>,
    pipeline: Pipeline,
}

// Room for every record a test emits since outputs are only read at the end
const OUTPUT_CAPACITY: usize = 512;

impl Harness {
    fn new() -> Self {
        let mut registry = Registry::default();
        let metrics = Arc::new(AverageMetrics::new(&mut registry));
        let store = Arc::new(MemoryStore::new());
        let (sink, output) = ChannelSink::channel(OUTPUT_CAPACITY);
        let pipeline = Pipeline::new(PipelineConfig::default(), store.clone(), metrics, Arc::new(sink));

        Harness {
            registry,
            store,
            output,
            pipeline,
        }
    }

    async fn run(&self, records: &[&str]) -> Option<AverageResult> {
        let mut last = None;
        for r in records {
            if let Outcome::Accepted(avg) = self.pipeline.process(r).await.unwrap() {
                last = Some(avg);
            }
        }

        last
    }

    fn outputs(&mut self) -> Vec<OutputRecord> {
        let mut out = Vec::new();
        while let Ok(r) = self.output.try_recv() {
            out.push(r);
        }

        out
    }

    fn exposition(&self) -> String {
        let mut buf = String::new();
        encode(&mut buf, &self.registry).unwrap();
        buf
    }
}

#[tokio::test]
async fn test_station_a_scenario() {
    let mut h = Harness::new();

    assert_eq!(None, h.run(&["A,25,40"]).await);
    assert!(h.outputs().is_empty());
    assert_eq!(None, h.store.get("A").unwrap());

    let first = h.run(&["A,35,50"]).await.unwrap();
    assert_eq!(95.0, first.avg_temperature_f);
    assert_eq!(50.0, first.avg_humidity);

    let second = h.run(&["A,40,60"]).await.unwrap();
    assert_eq!(99.5, second.avg_temperature_f);
    assert_eq!(55.0, second.avg_humidity);

    let values: Vec<(String, String)> = h.outputs().into_iter().map(|r| (r.key, r.value)).collect();
    assert_eq!(
        vec![
            (
                "A".to_owned(),
                "A : Température Moyenne = 95.0°F, Humidité Moyenne = 50.0%".to_owned()
            ),
            (
                "A".to_owned(),
                "A : Température Moyenne = 99.5°F, Humidité Moyenne = 55.0%".to_owned()
            ),
        ],
        values
    );

    let text = h.exposition();
    assert!(text.contains("weather_average_temperature{station=\"A\"} 99.5"));
    assert!(text.contains("weather_average_humidity{station=\"A\"} 55"));
}

#[tokio::test]
async fn test_station_b_malformed_scenario() {
    let mut h = Harness::new();

    assert_eq!(None, h.run(&["B,notanumber,30", "B,35", "B,35,wet", ",35,50"]).await);
    assert!(h.outputs().is_empty());
    assert_eq!(None, h.store.get("B").unwrap());
    assert!(h.store.snapshot().unwrap().is_empty());
    assert!(!h.exposition().contains("station=\"B\""));
}

#[tokio::test]
async fn test_average_of_many_readings() {
    let h = Harness::new();
    let temps_c = [31.0, 32.5, 40.25, 35.75, 30.1, 44.0, 38.6];
    let humidities = [10.0, 20.0, 35.5, 99.0, 0.0, 64.0, 47.0];

    let records: Vec<String> = temps_c
        .iter()
        .zip(humidities.iter())
        .map(|(t, rh)| format!("S1,{},{}", t, rh))
        .collect();
    let refs: Vec<&str> = records.iter().map(|s| s.as_str()).collect();
    let avg = h.run(&refs).await.unwrap();

    let n = temps_c.len() as f64;
    let expected_t = temps_c.iter().map(|c| c * 9.0 / 5.0 + 32.0).sum::<f64>() / n;
    let expected_h = humidities.iter().sum::<f64>() / n;

    assert!((avg.avg_temperature_f - expected_t).abs() < 1e-9);
    assert!((avg.avg_humidity - expected_h).abs() < 1e-9);
}

#[tokio::test]
async fn test_stations_are_isolated() {
    let h = Harness::new();
    let a = h.run(&["A,35,50"]).await.unwrap();

    let b_records: Vec<String> = (0..200).map(|i| format!("B,{},{}", 31 + i % 20, i % 100)).collect();
    let refs: Vec<&str> = b_records.iter().map(|s| s.as_str()).collect();
    h.run(&refs).await;

    assert_eq!(Some(a), h.store.get("A").unwrap());
}

#[tokio::test]
async fn test_replay_is_not_idempotent() {
    let input = ["A,35,50", "A,40,60", "B,31,20", "A,45,70", "B,25,90"];

    let once = Harness::new().run(&input).await;
    let again = Harness::new().run(&input).await;
    assert_eq!(once, again);

    // Redelivering a suffix counts those readings a second time
    let h = Harness::new();
    h.run(&input).await;
    let replayed = h.run(&input[3..]).await.unwrap();
    assert_ne!(once, Some(replayed.clone()));

    // (95 + 104 + 113 + 113) / 4
    assert_eq!(106.25, replayed.avg_temperature_f);
    assert_eq!(62.5, replayed.avg_humidity);
}

#[tokio::test]
async fn test_undecodable_record_is_dropped() {
    let mut h = Harness::new();
    h.run(&["A,35,50"]).await;

    let outcome = h.pipeline.process(b"A,4\xff0,60").await.unwrap();
    assert_eq!("invalid", outcome.label());

    let avg = h.store.get("A").unwrap().unwrap();
    assert_eq!(95.0, avg.avg_temperature_f);
    assert_eq!(1, h.outputs().len());
}
