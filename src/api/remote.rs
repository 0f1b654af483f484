//! Purpose: Provide an HTTP client for the kvfiler v0 record protocol.
//! Exports: `RemoteStore`, `RemoteRecords`.
//! Role: Remote backend that mirrors the embedded database operations over HTTP.
//! Invariants: Request/response shapes match `kvfiler-serve` (`/v0/record`, `/v0/records`).
//! Invariants: A missing key maps to `NotFound`; transport failures map to `Io`.
//! Invariants: Record streams end with an explicit terminator frame.
#![allow(clippy::result_large_err)]

use serde::Deserialize;
use std::io::{BufReader, Read};
use std::time::Duration;
use url::Url;

use super::store::{ApiResult, RecordIter, Store};
use crate::core::error::{Error, ErrorKind};
use crate::core::record::MAX_KEY_LEN;

pub const RECORD_STREAM_CONTENT_TYPE: &str = "application/x-kvfiler-records";
pub const RECORD_FRAME_HEADER_LEN: usize = 12;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Clone)]
pub struct RemoteStore {
    base_url: Url,
    agent: ureq::Agent,
}

pub struct RemoteRecords {
    reader: Option<BufReader<Box<dyn Read + Send + Sync>>>,
}

#[derive(Deserialize)]
struct ErrorEnvelope {
    error: RemoteError,
}

#[derive(Deserialize)]
struct RemoteError {
    kind: String,
    message: Option<String>,
    hint: Option<String>,
    key: Option<String>,
}

impl RemoteStore {
    pub fn new(base_url: impl Into<String>) -> ApiResult<Self> {
        let base_url = normalize_base_url(base_url.into())?;
        let agent = ureq::AgentBuilder::new()
            .timeout_connect(CONNECT_TIMEOUT)
            .build();
        Ok(Self { base_url, agent })
    }

    /// Builds a client for `host:port` and probes `/healthz` before returning.
    pub fn connect(host: &str, port: u16) -> ApiResult<Self> {
        let store = Self::new(host_port_url(host, port))?;
        store.ping()?;
        Ok(store)
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    pub fn ping(&self) -> ApiResult<()> {
        let url = build_url(&self.base_url, &["healthz"])?;
        match self.agent.get(url.as_str()).call() {
            Ok(_) => Ok(()),
            Err(err) => Err(request_error(err).with_hint(format!(
                "Is kvfiler-serve listening on {}?",
                self.base_url
            ))),
        }
    }

    pub fn exists(&self, key: &[u8]) -> ApiResult<bool> {
        let url = self.record_url(key)?;
        match self.agent.head(url.as_str()).call() {
            Ok(_) => Ok(true),
            Err(ureq::Error::Status(404, _)) => Ok(false),
            Err(err) => Err(request_error(err)),
        }
    }

    pub fn get(&self, key: &[u8]) -> ApiResult<Vec<u8>> {
        let url = self.record_url(key)?;
        let response = self
            .agent
            .get(url.as_str())
            .set("Accept", "application/octet-stream")
            .call()
            .map_err(request_error)?;
        let mut out = Vec::new();
        response.into_reader().read_to_end(&mut out).map_err(|err| {
            Error::new(ErrorKind::Io)
                .with_message("failed to read record body")
                .with_source(err)
        })?;
        Ok(out)
    }

    pub fn put(&self, key: &[u8], value: &[u8]) -> ApiResult<()> {
        let url = self.record_url(key)?;
        self.agent
            .put(url.as_str())
            .set("Accept", "application/json")
            .set("Content-Type", "application/octet-stream")
            .send_bytes(value)
            .map_err(request_error)?;
        Ok(())
    }

    pub fn records(&self) -> ApiResult<RemoteRecords> {
        let url = build_url(&self.base_url, &["v0", "records"])?;
        let response = self
            .agent
            .get(url.as_str())
            .set("Accept", RECORD_STREAM_CONTENT_TYPE)
            .call()
            .map_err(request_error)?;
        Ok(RemoteRecords {
            reader: Some(BufReader::new(response.into_reader())),
        })
    }

    fn record_url(&self, key: &[u8]) -> ApiResult<Url> {
        let key = std::str::from_utf8(key).map_err(|err| {
            Error::new(ErrorKind::Usage)
                .with_message("remote record keys must be valid UTF-8")
                .with_source(err)
        })?;
        if key.is_empty() {
            return Err(Error::new(ErrorKind::Usage).with_message("record key must not be empty"));
        }
        let mut url = build_url(&self.base_url, &["v0", "record"])?;
        url.query_pairs_mut().append_pair("key", key);
        Ok(url)
    }
}

impl Store for RemoteStore {
    fn exists(&self, key: &[u8]) -> ApiResult<bool> {
        RemoteStore::exists(self, key)
    }

    fn get(&self, key: &[u8]) -> ApiResult<Vec<u8>> {
        RemoteStore::get(self, key)
    }

    fn put(&mut self, key: &[u8], value: &[u8]) -> ApiResult<()> {
        RemoteStore::put(self, key, value)
    }

    fn records(&self) -> ApiResult<RecordIter<'_>> {
        Ok(Box::new(RemoteStore::records(self)?))
    }
}

impl RemoteRecords {
    pub fn next_record(&mut self) -> ApiResult<Option<(Vec<u8>, Vec<u8>)>> {
        let Some(reader) = self.reader.as_mut() else {
            return Ok(None);
        };
        let mut header = [0u8; RECORD_FRAME_HEADER_LEN];
        if !read_exact_or_eof(reader, &mut header)? {
            self.reader = None;
            return Err(Error::new(ErrorKind::Io).with_message("record stream ended early"));
        }
        let (key_len, value_len) = decode_frame_header(&header);
        if key_len == 0 {
            self.reader = None;
            return Ok(None);
        }
        if key_len as usize > MAX_KEY_LEN {
            self.reader = None;
            return Err(Error::new(ErrorKind::Corrupt)
                .with_message(format!("record frame key length {key_len} exceeds {MAX_KEY_LEN}")));
        }
        let mut key = vec![0u8; key_len as usize];
        reader.read_exact(&mut key).map_err(frame_read_error)?;
        // The value buffer grows with the bytes actually received.
        let mut value = Vec::new();
        reader
            .by_ref()
            .take(value_len)
            .read_to_end(&mut value)
            .map_err(frame_read_error)?;
        if value.len() as u64 != value_len {
            self.reader = None;
            return Err(Error::new(ErrorKind::Io)
                .with_message("record stream ended inside a value")
                .with_key(String::from_utf8_lossy(&key)));
        }
        Ok(Some((key, value)))
    }

    pub fn cancel(&mut self) {
        self.reader = None;
    }
}

impl Iterator for RemoteRecords {
    type Item = ApiResult<(Vec<u8>, Vec<u8>)>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.next_record() {
            Ok(Some(record)) => Some(Ok(record)),
            Ok(None) => None,
            Err(err) => {
                self.reader = None;
                Some(Err(err))
            }
        }
    }
}

/// Frame header: key length (u32 BE) then value length (u64 BE).
/// A zero key length terminates the stream.
pub fn encode_frame_header(key_len: u32, value_len: u64) -> [u8; RECORD_FRAME_HEADER_LEN] {
    let mut buf = [0u8; RECORD_FRAME_HEADER_LEN];
    buf[0..4].copy_from_slice(&key_len.to_be_bytes());
    buf[4..12].copy_from_slice(&value_len.to_be_bytes());
    buf
}

fn decode_frame_header(buf: &[u8; RECORD_FRAME_HEADER_LEN]) -> (u32, u64) {
    let mut key_len = [0u8; 4];
    key_len.copy_from_slice(&buf[0..4]);
    let mut value_len = [0u8; 8];
    value_len.copy_from_slice(&buf[4..12]);
    (u32::from_be_bytes(key_len), u64::from_be_bytes(value_len))
}

fn host_port_url(host: &str, port: u16) -> String {
    if host.contains(':') && !host.starts_with('[') {
        format!("http://[{host}]:{port}")
    } else {
        format!("http://{host}:{port}")
    }
}

fn normalize_base_url(raw: String) -> ApiResult<Url> {
    let mut url = Url::parse(&raw).map_err(|err| {
        Error::new(ErrorKind::Usage)
            .with_message("invalid remote base url")
            .with_source(err)
    })?;
    let scheme = url.scheme();
    if scheme != "http" && scheme != "https" {
        return Err(Error::new(ErrorKind::Usage)
            .with_message("remote base url must use http or https scheme"));
    }
    if url.path() != "/" && !url.path().is_empty() {
        return Err(
            Error::new(ErrorKind::Usage).with_message("remote base url must not include a path")
        );
    }
    url.set_path("/");
    url.set_query(None);
    url.set_fragment(None);
    Ok(url)
}

fn build_url(base_url: &Url, segments: &[&str]) -> ApiResult<Url> {
    let mut url = base_url.clone();
    {
        let mut path = url.path_segments_mut().map_err(|_| {
            Error::new(ErrorKind::Usage).with_message("remote base url cannot be a base")
        })?;
        path.clear();
        for segment in segments {
            path.push(segment);
        }
    }
    Ok(url)
}

fn request_error(err: ureq::Error) -> Error {
    match err {
        ureq::Error::Status(code, resp) => parse_error_response(code, resp),
        ureq::Error::Transport(err) => Error::new(ErrorKind::Io)
            .with_message("request failed")
            .with_source(err),
    }
}

fn parse_error_response(status: u16, response: ureq::Response) -> Error {
    let body = response.into_string().unwrap_or_default();
    if let Ok(envelope) = serde_json::from_str::<ErrorEnvelope>(&body) {
        return error_from_remote(envelope.error);
    }
    let kind = error_kind_from_status(status);
    Error::new(kind).with_message(format!("remote error status {status}"))
}

fn frame_read_error(err: std::io::Error) -> Error {
    Error::new(ErrorKind::Io)
        .with_message("failed to read record frame")
        .with_source(err)
}

fn read_exact_or_eof(reader: &mut dyn Read, buf: &mut [u8]) -> ApiResult<bool> {
    let mut offset = 0;
    while offset < buf.len() {
        match reader.read(&mut buf[offset..]) {
            Ok(0) => {
                if offset == 0 {
                    return Ok(false);
                }
                return Err(
                    Error::new(ErrorKind::Io).with_message("unexpected eof in record stream")
                );
            }
            Ok(read) => {
                offset += read;
            }
            Err(err) => {
                return Err(Error::new(ErrorKind::Io)
                    .with_message("failed to read record stream")
                    .with_source(err));
            }
        }
    }
    Ok(true)
}

fn error_from_remote(remote: RemoteError) -> Error {
    let mut err = Error::new(ErrorKind::parse(&remote.kind));
    if let Some(message) = remote.message {
        err = err.with_message(message);
    }
    if let Some(hint) = remote.hint {
        err = err.with_hint(hint);
    }
    if let Some(key) = remote.key {
        err = err.with_key(key);
    }
    err
}

fn error_kind_from_status(status: u16) -> ErrorKind {
    match status {
        400 | 413 => ErrorKind::Usage,
        401 | 403 => ErrorKind::Permission,
        404 => ErrorKind::NotFound,
        423 => ErrorKind::Busy,
        500..=599 => ErrorKind::Internal,
        _ => ErrorKind::Io,
    }
}
