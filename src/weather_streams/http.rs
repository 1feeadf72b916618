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

use crate::metrics::ProcessMetrics;
use crate::store::AggregationStore;
use axum::extract::{Path, State};
use axum::http::header::CONTENT_TYPE;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use prometheus_client::encoding::text::encode;
use prometheus_client::registry::Registry;
use std::sync::Arc;
use tower_http::trace::TraceLayer;

const TEXT_FORMAT: &str = "application/openmetrics-text; version=1.0.0; charset=utf-8";

/// Global state shared between all HTTP requests via `Arc`.
pub struct RequestContext {
    registry: Registry,
    process: ProcessMetrics,
    store: Arc<dyn AggregationStore>,
}

impl RequestContext {
    pub fn new(registry: Registry, process: ProcessMetrics, store: Arc<dyn AggregationStore>) -> Self {
        Self {
            registry,
            process,
            store,
        }
    }
}

/// Build the router exposing metrics and the current station averages.
pub fn router(context: Arc<RequestContext>) -> Router {
    Router::new()
        .route("/metrics", get(text_metrics))
        .route("/averages", get(all_averages))
        .route("/averages/:station", get(station_average))
        .layer(TraceLayer::new_for_http())
        .with_state(context)
}

async fn text_metrics(State(context): State<Arc<RequestContext>>) -> Response {
    let mut buf = String::new();
    context.process.refresh();

    match encode(&mut buf, &context.registry) {
        Ok(_) => {
            tracing::debug!(message = "encoded prometheus metrics to text format", num_bytes = buf.len());
            ([(CONTENT_TYPE, TEXT_FORMAT)], buf).into_response()
        }
        Err(e) => {
            tracing::error!(message = "error encoding metrics", error = %e);
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

async fn all_averages(State(context): State<Arc<RequestContext>>) -> Response {
    match context.store.snapshot() {
        Ok(averages) => Json(averages).into_response(),
        Err(e) => {
            tracing::error!(message = "unable to read station averages", error = %e);
            StatusCode::SERVICE_UNAVAILABLE.into_response()
        }
    }
}

async fn station_average(State(context): State<Arc<RequestContext>>, Path(station): Path<String>) -> Response {
    match context.store.get(&station) {
        Ok(Some(avg)) => Json(avg).into_response(),
        Ok(None) => StatusCode::NOT_FOUND.into_response(),
        Err(e) => {
            tracing::error!(message = "unable to read station average", station = %station, error = %e);
            StatusCode::SERVICE_UNAVAILABLE.into_response()
        }
    }
}

#[cfg(test)]
mod test {
    use super::{router, RequestContext};
    use crate::metrics::{AverageMetrics, MetricsSink, ProcessMetrics, AVERAGE_HUMIDITY, AVERAGE_TEMPERATURE};
    use crate::store::{AggregationStore, MemoryStore};
    use axum::body::Body;
    use axum::http::{Method, Request, StatusCode};
    use prometheus_client::registry::Registry;
    use std::sync::Arc;
    use tower::ServiceExt;

    fn context() -> Arc<RequestContext> {
        let mut reg = Registry::default();
        let metrics = AverageMetrics::new(&mut reg);
        let process = ProcessMetrics::new(&mut reg);
        let store = Arc::new(MemoryStore::new());

        let avg = store.update("A", 95.0, 50.0).unwrap();
        metrics.set(AVERAGE_TEMPERATURE, "A", avg.avg_temperature_f);
        metrics.set(AVERAGE_HUMIDITY, "A", avg.avg_humidity);

        Arc::new(RequestContext::new(reg, process, store))
    }

    async fn body_string(body: axum::body::BoxBody) -> String {
        let bytes = hyper::body::to_bytes(body).await.unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    fn get(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    #[tokio::test]
    async fn test_metrics() {
        let res = router(context()).oneshot(get("/metrics")).await.unwrap();
        assert_eq!(StatusCode::OK, res.status());

        let body = body_string(res.into_body()).await;
        assert!(body.contains("weather_average_temperature{station=\"A\"} 95"));
        assert!(body.contains("weather_average_humidity{station=\"A\"} 50"));
        assert!(body.contains("weather_process_resident_memory_bytes"));
        assert!(body.contains("weather_process_cpu_usage_percent"));
    }

    #[tokio::test]
    async fn test_metrics_wrong_method() {
        let req = Request::builder()
            .method(Method::POST)
            .uri("/metrics")
            .body(Body::empty())
            .unwrap();
        let res = router(context()).oneshot(req).await.unwrap();
        assert_eq!(StatusCode::METHOD_NOT_ALLOWED, res.status());
    }

    #[tokio::test]
    async fn test_averages() {
        let res = router(context()).oneshot(get("/averages")).await.unwrap();
        assert_eq!(StatusCode::OK, res.status());

        let body: serde_json::Value = serde_json::from_str(&body_string(res.into_body()).await).unwrap();
        assert_eq!("A", body[0]["station"]);
        assert_eq!(95.0, body[0]["avg_temperature_f"]);
        assert_eq!(50.0, body[0]["avg_humidity"]);
    }

    #[tokio::test]
    async fn test_station_average() {
        let res = router(context()).oneshot(get("/averages/A")).await.unwrap();
        assert_eq!(StatusCode::OK, res.status());

        let res = router(context()).oneshot(get("/averages/B")).await.unwrap();
        assert_eq!(StatusCode::NOT_FOUND, res.status());
    }

    #[tokio::test]
    async fn test_unknown_path() {
        let res = router(context()).oneshot(get("/nope")).await.unwrap();
        assert_eq!(StatusCode::NOT_FOUND, res.status());
    }
}
