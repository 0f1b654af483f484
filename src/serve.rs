//! Purpose: Serve one embedded kvfiler database over the HTTP v0 record protocol.
//! Exports: `ServeConfig`, `serve`, `validate_config`, `DEFAULT_MAX_BODY_BYTES`.
//! Role: Axum-based server behind `kvfiler-serve`; counterpart of `api::RemoteStore`.
//! Invariants: JSON error envelopes carry stable `ErrorKind` names.
//! Invariants: Loopback-only unless explicitly allowed.
//! Invariants: All database access is serialized behind one mutex.
//! Notes: `/v0/records` streams length-prefixed frames and ends with a zero-length key frame.
#![allow(clippy::result_large_err)]

use axum::body::Body;
use axum::extract::{DefaultBodyLimit, Query, State};
use axum::http::{HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::future::IntoFuture;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc;
use tokio::time::Duration;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::ReceiverStream;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::api::{
    Database, DbOptions, Error, ErrorKind, RECORD_STREAM_CONTENT_TYPE, encode_frame_header,
};

pub const DEFAULT_MAX_BODY_BYTES: u64 = 256 * 1024 * 1024;

#[derive(Clone, Debug)]
pub struct ServeConfig {
    pub bind: SocketAddr,
    pub db_path: PathBuf,
    pub bucket_hint: Option<u64>,
    pub max_body_bytes: u64,
    pub allow_non_loopback: bool,
}

struct AppState {
    db: Mutex<Database>,
}

impl AppState {
    fn lock(&self) -> Result<MutexGuard<'_, Database>, Error> {
        self.db
            .lock()
            .map_err(|_| Error::new(ErrorKind::Internal).with_message("database lock poisoned"))
    }
}

pub async fn serve(config: ServeConfig) -> Result<(), Error> {
    validate_config(&config)?;

    init_tracing();

    let max_body_bytes: usize = config
        .max_body_bytes
        .try_into()
        .map_err(|_| Error::new(ErrorKind::Usage).with_message("--max-body-bytes is too large"))?;

    let options = match config.bucket_hint {
        Some(hint) => DbOptions::tuned(hint),
        None => DbOptions::new(),
    };
    let db = Database::open(&config.db_path, options)?;
    info!(
        path = %config.db_path.display(),
        records = db.len(),
        buckets = db.header().bucket_count,
        "opened database"
    );

    let state = Arc::new(AppState { db: Mutex::new(db) });

    let app = Router::new()
        .route("/healthz", get(healthz))
        .route(
            "/v0/record",
            get(get_record).head(head_record).put(put_record),
        )
        .route("/v0/records", get(stream_records))
        .layer(DefaultBodyLimit::max(max_body_bytes))
        .layer(TraceLayer::new_for_http())
        .with_state(state.clone());

    let listener = tokio::net::TcpListener::bind(config.bind)
        .await
        .map_err(|err| {
            Error::new(ErrorKind::Io)
                .with_message("failed to bind server")
                .with_source(err)
        })?;
    info!(bind = %config.bind, "listening");

    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();
    let server = axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = shutdown_rx.await;
        })
        .into_future();
    tokio::pin!(server);

    tokio::select! {
        result = &mut server => {
            result.map_err(|err| {
                Error::new(ErrorKind::Io)
                    .with_message("server failed")
                    .with_source(err)
            })?;
        }
        _ = shutdown_signal() => {
            let _ = shutdown_tx.send(());
            match tokio::time::timeout(Duration::from_secs(10), &mut server).await {
                Ok(result) => result.map_err(|err| {
                    Error::new(ErrorKind::Io)
                        .with_message("server failed")
                        .with_source(err)
                })?,
                Err(_) => {
                    return Err(Error::new(ErrorKind::Io).with_message("server shutdown timed out"));
                }
            }
        }
    };

    let db = state.lock()?;
    db.sync()?;
    info!("database synced");
    Ok(())
}

fn is_loopback(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(addr) => addr.is_loopback(),
        IpAddr::V6(addr) => addr.is_loopback(),
    }
}

pub fn validate_config(config: &ServeConfig) -> Result<(), Error> {
    if !is_loopback(config.bind.ip()) && !config.allow_non_loopback {
        return Err(Error::new(ErrorKind::Usage)
            .with_message("non-loopback bind requires explicit opt-in")
            .with_hint("Re-run with --allow-non-loopback or use a loopback address."));
    }

    if config.max_body_bytes == 0 {
        return Err(Error::new(ErrorKind::Usage)
            .with_message("--max-body-bytes must be greater than zero")
            .with_hint("Use a positive value like 1048576."));
    }

    if config.max_body_bytes > usize::MAX as u64 {
        return Err(Error::new(ErrorKind::Usage)
            .with_message("--max-body-bytes exceeds platform limits")
            .with_hint("Use a smaller value that fits in memory."));
    }

    if let Some(hint) = config.bucket_hint {
        DbOptions::tuned(hint).bucket_count()?;
    }

    Ok(())
}

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };
    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                warn!(error = %err, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(unix)]
    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    #[cfg(not(unix))]
    ctrl_c.await;
}

#[derive(Debug, Deserialize)]
struct RecordQuery {
    key: Option<String>,
}

impl RecordQuery {
    fn key(self) -> Result<String, Error> {
        match self.key {
            Some(key) if !key.is_empty() => Ok(key),
            _ => Err(Error::new(ErrorKind::Usage)
                .with_message("missing record key")
                .with_hint("Pass ?key=<name>.")),
        }
    }
}

#[derive(Debug, Serialize)]
struct ErrorEnvelope {
    error: ErrorBody,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    kind: String,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    hint: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    key: Option<String>,
}

async fn healthz() -> Response {
    json_response(json!({ "ok": true }))
}

async fn with_db<T, F>(state: Arc<AppState>, op: F) -> Result<T, Error>
where
    T: Send + 'static,
    F: FnOnce(&mut Database) -> Result<T, Error> + Send + 'static,
{
    tokio::task::spawn_blocking(move || {
        let mut db = state.lock()?;
        op(&mut db)
    })
    .await
    .map_err(|err| {
        Error::new(ErrorKind::Internal)
            .with_message("database task failed")
            .with_source(err)
    })?
}

async fn get_record(
    State(state): State<Arc<AppState>>,
    Query(query): Query<RecordQuery>,
) -> Response {
    let key = match query.key() {
        Ok(key) => key,
        Err(err) => return error_response(err),
    };
    match with_db(state, move |db| db.get(key.as_bytes())).await {
        Ok(value) => {
            let mut response = Response::new(Body::from(value));
            response.headers_mut().insert(
                "content-type",
                HeaderValue::from_static("application/octet-stream"),
            );
            response
        }
        Err(err) => error_response(err),
    }
}

async fn head_record(
    State(state): State<Arc<AppState>>,
    Query(query): Query<RecordQuery>,
) -> Response {
    let key = match query.key() {
        Ok(key) => key,
        Err(err) => return error_response(err),
    };
    let lookup_key = key.clone();
    match with_db(state, move |db| db.exists(lookup_key.as_bytes())).await {
        Ok(true) => StatusCode::OK.into_response(),
        Ok(false) => error_response(
            Error::new(ErrorKind::NotFound)
                .with_message("record not found")
                .with_key(key),
        ),
        Err(err) => error_response(err),
    }
}

async fn put_record(
    State(state): State<Arc<AppState>>,
    Query(query): Query<RecordQuery>,
    body: Bytes,
) -> Response {
    let key = match query.key() {
        Ok(key) => key,
        Err(err) => return error_response(err),
    };
    let bytes = body.len() as u64;
    let stored_key = key.clone();
    match with_db(state, move |db| db.put(stored_key.as_bytes(), &body)).await {
        Ok(()) => json_response(json!({ "stored": { "key": key, "bytes": bytes } })),
        Err(err) => error_response(err),
    }
}

async fn stream_records(State(state): State<Arc<AppState>>) -> Response {
    let (tx, rx) = mpsc::channel::<Result<Bytes, Error>>(16);
    tokio::task::spawn_blocking(move || {
        let result = state.lock().and_then(|db| {
            for record in db.iter() {
                let (key, value) = record?;
                let frame = record_frame(&key, &value)?;
                if tx.blocking_send(Ok(frame)).is_err() {
                    return Ok(());
                }
            }
            let _ = tx.blocking_send(Ok(Bytes::copy_from_slice(&encode_frame_header(0, 0))));
            Ok(())
        });
        if let Err(err) = result {
            warn!(error = %err, "record stream aborted");
            let _ = tx.blocking_send(Err(err));
        }
    });

    let stream = ReceiverStream::new(rx)
        .map(|result| result.map_err(|err| std::io::Error::other(err.to_string())));

    let mut response = Response::new(Body::from_stream(stream));
    response.headers_mut().insert(
        "content-type",
        HeaderValue::from_static(RECORD_STREAM_CONTENT_TYPE),
    );
    response
}

fn record_frame(key: &[u8], value: &[u8]) -> Result<Bytes, Error> {
    let key_len = u32::try_from(key.len()).map_err(|_| {
        Error::new(ErrorKind::Corrupt).with_message("record key too long for stream frame")
    })?;
    let header = encode_frame_header(key_len, value.len() as u64);
    let mut frame = Vec::with_capacity(header.len() + key.len() + value.len());
    frame.extend_from_slice(&header);
    frame.extend_from_slice(key);
    frame.extend_from_slice(value);
    Ok(Bytes::from(frame))
}

fn json_response(payload: serde_json::Value) -> Response {
    Json(payload).into_response()
}

fn error_status(kind: ErrorKind) -> StatusCode {
    match kind {
        ErrorKind::Usage => StatusCode::BAD_REQUEST,
        ErrorKind::NotFound => StatusCode::NOT_FOUND,
        ErrorKind::Busy => StatusCode::LOCKED,
        ErrorKind::Permission => StatusCode::FORBIDDEN,
        ErrorKind::Corrupt | ErrorKind::Io | ErrorKind::Internal => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

fn error_response(err: Error) -> Response {
    let status = error_status(err.kind());
    let body = ErrorEnvelope {
        error: ErrorBody {
            kind: err.kind().as_str().to_string(),
            message: err.message().unwrap_or("error").to_string(),
            hint: err.hint().map(str::to_string),
            key: err.key().map(str::to_string),
        },
    };
    (status, Json(body)).into_response()
}

#[cfg(test)]
mod tests {
    use super::{
        DEFAULT_MAX_BODY_BYTES, ErrorKind, ServeConfig, error_status, record_frame, serve,
        validate_config,
    };
    use axum::http::StatusCode;

    fn config(bind: &str, dir: &std::path::Path) -> ServeConfig {
        ServeConfig {
            bind: bind.parse().expect("bind"),
            db_path: dir.join("served.kvf"),
            bucket_hint: None,
            max_body_bytes: DEFAULT_MAX_BODY_BYTES,
            allow_non_loopback: false,
        }
    }

    #[tokio::test]
    async fn serve_rejects_non_loopback_bind() {
        let temp = tempfile::tempdir().expect("tempdir");
        let err = serve(config("0.0.0.0:0", temp.path()))
            .await
            .expect_err("expected usage error");
        assert_eq!(err.kind(), ErrorKind::Usage);
        assert!(!temp.path().join("served.kvf").exists());
    }

    #[test]
    fn non_loopback_allowed_with_flag() {
        let temp = tempfile::tempdir().expect("tempdir");
        let mut config = config("0.0.0.0:0", temp.path());
        validate_config(&config).expect_err("needs opt-in");
        config.allow_non_loopback = true;
        validate_config(&config).expect("config ok");
    }

    #[test]
    fn body_limit_must_be_positive() {
        let temp = tempfile::tempdir().expect("tempdir");
        let mut config = config("127.0.0.1:0", temp.path());
        config.max_body_bytes = 0;
        let err = validate_config(&config).expect_err("expected usage error");
        assert_eq!(err.kind(), ErrorKind::Usage);
    }

    #[test]
    fn oversized_bucket_hint_is_rejected_up_front() {
        let temp = tempfile::tempdir().expect("tempdir");
        let mut config = config("127.0.0.1:0", temp.path());
        config.bucket_hint = Some(u64::MAX / 2);
        let err = validate_config(&config).expect_err("expected usage error");
        assert_eq!(err.kind(), ErrorKind::Usage);
    }

    #[test]
    fn error_kinds_map_to_statuses() {
        assert_eq!(error_status(ErrorKind::NotFound), StatusCode::NOT_FOUND);
        assert_eq!(error_status(ErrorKind::Usage), StatusCode::BAD_REQUEST);
        assert_eq!(error_status(ErrorKind::Busy), StatusCode::LOCKED);
        assert_eq!(
            error_status(ErrorKind::Corrupt),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn record_frame_prefixes_lengths() {
        let frame = record_frame(b"ab", b"xyz").expect("frame");
        assert_eq!(frame.len(), 12 + 2 + 3);
        assert_eq!(&frame[0..4], &[0, 0, 0, 2]);
        assert_eq!(&frame[4..12], &[0, 0, 0, 0, 0, 0, 0, 3]);
        assert_eq!(&frame[12..], b"abxyz");
    }
}
