//! Prometheus metrics for the forwarder.
//!
//! Exposes:
//! - `telegram_forwarder_records_total` (counter by kind and status)
//! - `telegram_forwarder_delivery_attempts_total` (counter by shape and result)
//! - `telegram_forwarder_events_total` (counter by ingestion outcome)
//! - `telegram_forwarder_album_flushes_total` and `..._album_size` (histogram)
//! - `telegram_forwarder_media_declined_total` (counter by reason)
//! - `telegram_forwarder_session_restarts_total`
//! - process metrics via `process` collector

use std::convert::Infallible;
use std::net::SocketAddr;

use bytes::Bytes;
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use once_cell::sync::Lazy;
use prometheus::process_collector::ProcessCollector;
use prometheus::{
    default_registry, register_histogram, register_int_counter, register_int_counter_vec,
    Encoder, Histogram, IntCounter, IntCounterVec, TextEncoder,
};
use tokio::net::TcpListener;
use tracing::{error, info, warn};

static PROCESS_COLLECTOR: Lazy<()> = Lazy::new(|| {
    if let Err(err) = default_registry().register(Box::new(ProcessCollector::for_self())) {
        warn!("Failed to register process collector: {}", err);
    }
});

static RECORDS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "telegram_forwarder_records_total",
        "Records handed to the webhook by kind and delivery status",
        &["kind", "status"]
    )
    .expect("failed to register records counter")
});

static DELIVERY_ATTEMPTS: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "telegram_forwarder_delivery_attempts_total",
        "Webhook HTTP attempts by request shape and result",
        &["shape", "result"]
    )
    .expect("failed to register delivery attempts counter")
});

static EVENTS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "telegram_forwarder_events_total",
        "Live new-message events by routing outcome",
        &["outcome"]
    )
    .expect("failed to register events counter")
});

static ALBUM_FLUSHES: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "telegram_forwarder_album_flushes_total",
        "Album buffers flushed after the debounce window"
    )
    .expect("failed to register album flush counter")
});

static ALBUM_SIZE: Lazy<Histogram> = Lazy::new(|| {
    register_histogram!(
        "telegram_forwarder_album_size",
        "Number of messages per flushed album",
        vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 8.0, 10.0]
    )
    .expect("failed to register album size histogram")
});

static MEDIA_DECLINED: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "telegram_forwarder_media_declined_total",
        "Media items not forwarded by reason",
        &["reason"]
    )
    .expect("failed to register media declined counter")
});

static SESSION_RESTARTS: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "telegram_forwarder_session_restarts_total",
        "Live sessions restarted by the supervisor"
    )
    .expect("failed to register session restart counter")
});

/// Ensure collectors are registered.
fn init_collectors() {
    Lazy::force(&PROCESS_COLLECTOR);
    Lazy::force(&RECORDS_TOTAL);
    Lazy::force(&DELIVERY_ATTEMPTS);
    Lazy::force(&EVENTS_TOTAL);
    Lazy::force(&ALBUM_FLUSHES);
    Lazy::force(&ALBUM_SIZE);
    Lazy::force(&MEDIA_DECLINED);
    Lazy::force(&SESSION_RESTARTS);
}

fn status_label(ok: bool) -> &'static str {
    if ok {
        "ok"
    } else {
        "error"
    }
}

/// One record went through the pipeline.
pub fn record_forwarded(kind: &'static str, delivered: bool) {
    RECORDS_TOTAL
        .with_label_values(&[kind, status_label(delivered)])
        .inc();
}

/// One HTTP attempt against the webhook.
pub fn record_delivery_attempt(shape: &'static str, ok: bool) {
    DELIVERY_ATTEMPTS
        .with_label_values(&[shape, status_label(ok)])
        .inc();
}

/// Routing decision for a live event.
pub fn record_event(outcome: &'static str) {
    EVENTS_TOTAL.with_label_values(&[outcome]).inc();
}

pub fn record_album_flush(members: usize) {
    ALBUM_FLUSHES.inc();
    ALBUM_SIZE.observe(members as f64);
}

pub fn record_media_declined(reason: &'static str) {
    MEDIA_DECLINED.with_label_values(&[reason]).inc();
}

pub fn record_session_restart() {
    SESSION_RESTARTS.inc();
}

fn plain_response(status: StatusCode, body: Full<Bytes>) -> Response<Full<Bytes>> {
    let mut response = Response::new(body);
    *response.status_mut() = status;
    response
}

async fn metrics_response() -> Result<Response<Full<Bytes>>, Infallible> {
    init_collectors();
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();

    if let Err(err) = encoder.encode(&metric_families, &mut buffer) {
        error!("Failed to encode metrics: {}", err);
        return Ok(plain_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            Full::from("encode error"),
        ));
    }

    let mut response = plain_response(StatusCode::OK, Full::from(buffer));
    if let Ok(value) = hyper::header::HeaderValue::from_str(encoder.format_type()) {
        response
            .headers_mut()
            .insert(hyper::header::CONTENT_TYPE, value);
    }
    Ok(response)
}

async fn handle_request(req: Request<Incoming>) -> Result<Response<Full<Bytes>>, Infallible> {
    match req.uri().path() {
        "/metrics" => metrics_response().await,
        _ => Ok(plain_response(StatusCode::NOT_FOUND, Full::new(Bytes::new()))),
    }
}

async fn serve(addr: SocketAddr) -> anyhow::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    info!(%addr, "Prometheus metrics endpoint started");

    loop {
        let (stream, peer) = listener.accept().await?;
        let service = service_fn(handle_request);
        let io = TokioIo::new(stream);

        tokio::spawn(async move {
            if let Err(err) = http1::Builder::new().serve_connection(io, service).await {
                warn!(?peer, "Metrics connection error: {}", err);
            }
        });
    }
}

/// Spawn the metrics HTTP endpoint on the given address.
pub fn spawn_metrics_server(addr: SocketAddr) {
    init_collectors();
    tokio::spawn(async move {
        if let Err(err) = serve(addr).await {
            error!(%addr, "Metrics server failed: {}", err);
        }
    });
}
