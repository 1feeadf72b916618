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

use clap::Parser;
use prometheus_client::registry::Registry;
use std::error::Error;
use std::io;
use std::net::SocketAddr;
use std::process;
use std::sync::Arc;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncBufRead, AsyncWrite, BufReader};
use tokio::signal::unix::{self, SignalKind};
use tokio::sync::{oneshot, watch};
use tracing::{Instrument, Level};
use weather_streams::http::RequestContext;
use weather_streams::metrics::{AverageMetrics, ProcessMetrics, RecordMetrics};
use weather_streams::pipeline::{Pipeline, PipelineConfig, DEFAULT_MIN_TEMPERATURE_C};
use weather_streams::sink::{write_records, ChannelSink};
use weather_streams::source::consume_lines;
use weather_streams::store::MemoryStore;
use weather_streams::worker::Dispatcher;

const DEFAULT_LOG_LEVEL: Level = Level::INFO;
const DEFAULT_BIND_ADDR: ([u8; 4], u16) = ([0, 0, 0, 0], 1234);
const DEFAULT_APPLICATION_ID: &str = "weather-streams-app";
const DEFAULT_PARTITIONS: u16 = 4;
const OUTPUT_QUEUE_SIZE: usize = 1024;
const STDIO: &str = "-";

#[derive(Debug, Parser)]
#[clap(name = "weather_streams", version = clap::crate_version!())]
struct WeatherStreamsApplication {
    /// File to read weather readings from, one `station,celsius,humidity` record per
    /// line. Use '-' to read from stdin.
    #[clap(long, default_value_t = STDIO.into())]
    input: String,

    /// File to append station averages to, one `station<TAB>average` record per line.
    /// Use '-' to write to stdout.
    #[clap(long, default_value_t = STDIO.into())]
    output: String,

    /// Readings must be strictly above this temperature, in celsius, to be included
    /// in station averages.
    #[clap(long, default_value_t = DEFAULT_MIN_TEMPERATURE_C)]
    min_temperature_c: f64,

    /// Number of workers to spread stations across. All readings for a station are
    /// handled by the same worker.
    #[clap(long, default_value_t = DEFAULT_PARTITIONS, value_parser = clap::value_parser!(u16).range(1..))]
    partitions: u16,

    /// Identity of this application, included in log messages
    #[clap(long, default_value_t = DEFAULT_APPLICATION_ID.into())]
    application_id: String,

    /// Logging verbosity. Allowed values are 'trace', 'debug', 'info', 'warn', and 'error'
    /// (case insensitive)
    #[clap(long, default_value_t = DEFAULT_LOG_LEVEL)]
    log_level: Level,

    /// Address to bind to. By default, weather_streams will bind to public address since
    /// the purpose is to expose metrics to an external system (Prometheus or another
    /// agent for ingestion)
    #[clap(long, default_value_t = DEFAULT_BIND_ADDR.into())]
    bind: SocketAddr,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error + Send + Sync>> {
    let opts = WeatherStreamsApplication::parse();
    tracing::subscriber::set_global_default(
        tracing_subscriber::FmtSubscriber::builder()
            .with_max_level(opts.log_level)
            .with_writer(io::stderr)
            .finish(),
    )
    .expect("failed to set tracing subscriber");

    let span = tracing::info_span!("weather_streams", application_id = %opts.application_id);
    if run(opts).instrument(span).await {
        Ok(())
    } else {
        process::exit(1)
    }
}

/// Run until the input is stopped and every queued record has been handled, returning
/// false if any part of the pipeline failed along the way.
async fn run(opts: WeatherStreamsApplication) -> bool {
    let mut registry = Registry::default();
    let averages = Arc::new(AverageMetrics::new(&mut registry));
    let records = Arc::new(RecordMetrics::new(&mut registry));
    let process = ProcessMetrics::new(&mut registry);
    let store = Arc::new(MemoryStore::new());

    let reader = open_input(&opts.input).await.unwrap_or_else(|e| {
        tracing::error!(message = "unable to open input", input = %opts.input, error = %e);
        process::exit(1)
    });
    let writer = open_output(&opts.output).await.unwrap_or_else(|e| {
        tracing::error!(message = "unable to open output", output = %opts.output, error = %e);
        process::exit(1)
    });

    let (sink, rx) = ChannelSink::channel(OUTPUT_QUEUE_SIZE);
    let writer_task = tokio::spawn(write_records(rx, writer));

    let config = PipelineConfig {
        min_temperature_c: opts.min_temperature_c,
    };
    let pipeline = Arc::new(Pipeline::new(config, store.clone(), averages, Arc::new(sink)));
    let dispatcher = Dispatcher::new(pipeline, records, usize::from(opts.partitions));

    let context = Arc::new(RequestContext::new(registry, process, store));
    let server = axum::Server::try_bind(&opts.bind)
        .unwrap_or_else(|e| {
            tracing::error!(message = "error binding to address", address = %opts.bind, error = %e);
            process::exit(1)
        })
        .serve(weather_streams::http::router(context).into_make_service());

    tracing::info!(message = "server started", address = %server.local_addr());
    let (server_tx, server_rx) = oneshot::channel::<()>();
    let server_task = tokio::spawn(server.with_graceful_shutdown(async move {
        let _ = server_rx.await;
    }));

    let (signal_tx, signal_rx) = watch::channel(false);
    tokio::spawn(async move {
        // Wait for either SIGTERM or SIGINT to shutdown
        tokio::select! {
            _ = sigterm() => {}
            _ = sigint() => {}
        }

        let _ = signal_tx.send(true);
    });

    tracing::info!(
        message = "consuming weather readings",
        input = %opts.input,
        output = %opts.output,
        partitions = dispatcher.partitions(),
        min_temperature_c = opts.min_temperature_c,
    );

    let mut ok = true;
    match consume_lines(reader, &dispatcher, halted(&dispatcher, signal_rx.clone())).await {
        Ok(consumed) if consumed.exhausted => {
            tracing::info!(message = "serving metrics until shutdown", lines = consumed.lines);
            halted(&dispatcher, signal_rx).await;
        }
        Ok(consumed) => {
            tracing::debug!(message = "input stopped", lines = consumed.lines);
        }
        Err(e) => {
            tracing::error!(message = "stopped consuming input", error = %e);
            ok = false;
        }
    }

    match dispatcher.shutdown().await {
        Ok(processed) => tracing::info!(message = "all partitions finished", records = processed),
        Err(e) => {
            tracing::error!(message = "partition failed", error = %e);
            ok = false;
        }
    }

    match writer_task.await {
        Ok(Ok(written)) => tracing::info!(message = "output closed", records = written),
        Ok(Err(e)) => {
            tracing::error!(message = "unable to write output", error = %e);
            ok = false;
        }
        Err(e) => {
            tracing::error!(message = "output writer did not complete", error = %e);
            ok = false;
        }
    }

    let _ = server_tx.send(());
    match server_task.await {
        Ok(Ok(())) => tracing::info!("server shutdown"),
        Ok(Err(e)) => tracing::error!(message = "server error", error = %e),
        Err(e) => tracing::error!(message = "server did not complete", error = %e),
    }

    ok
}

async fn open_input(path: &str) -> io::Result<Box<dyn AsyncBufRead + Unpin + Send>> {
    if path == STDIO {
        Ok(Box::new(BufReader::new(tokio::io::stdin())))
    } else {
        Ok(Box::new(BufReader::new(File::open(path).await?)))
    }
}

async fn open_output(path: &str) -> io::Result<Box<dyn AsyncWrite + Unpin + Send>> {
    if path == STDIO {
        Ok(Box::new(tokio::io::stdout()))
    } else {
        Ok(Box::new(OpenOptions::new().create(true).append(true).open(path).await?))
    }
}

/// Return once a shutdown signal has been observed
async fn stopped(mut rx: watch::Receiver<bool>) {
    while !*rx.borrow() {
        if rx.changed().await.is_err() {
            return;
        }
    }
}

/// Return once a shutdown signal has been observed or a partition has stopped
/// because of a fatal error
async fn halted(dispatcher: &Dispatcher, rx: watch::Receiver<bool>) {
    tokio::select! {
        _ = stopped(rx) => {}
        partition = dispatcher.partition_failed() => {
            tracing::error!(message = "halting after partition failure", partition = partition);
        }
    }
}

/// Return after the first SIGTERM signal received by this process
async fn sigterm() -> io::Result<()> {
    unix::signal(SignalKind::terminate())?.recv().await;
    Ok(())
}

/// Return after the first SIGINT signal received by this process
async fn sigint() -> io::Result<()> {
    unix::signal(SignalKind::interrupt())?.recv().await;
    Ok(())
}
