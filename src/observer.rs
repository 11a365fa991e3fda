//! Request introspection.
//!
//! The observer takes a snapshot of each request (time, URL, client address,
//! query, headers, cookies, body) and writes it to the log sink as a block
//! framed by `>>>>` and `<<<<`. The request URL is a headline line; all other
//! fields are verbose lines. The request itself is handed on unchanged.

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use axum::{
    body::Body,
    extract::ConnectInfo,
    http::{HeaderMap, Request, header, request::Parts},
};
use base64::{Engine as _, engine::general_purpose::STANDARD_NO_PAD};
use bytes::Bytes;
use chrono::{Local, Utc};
use hmac::{Hmac, Mac};
use serde::Serialize;
use serde_json::{Map, Value, json, ser::PrettyFormatter};
use sha2::Sha256;

use crate::config::{OptimizeFor, PipelineConfig};
use crate::logging::LogSink;
use crate::pipeline::{Flow, Stage};

/// Bodies larger than this are passed through without being recorded.
pub const MAX_CAPTURED_BODY_BYTES: usize = 16 * 1024 * 1024;

/// Continuation lines of indented JSON are shifted right by this much so they
/// sit under the field label.
const CONTINUATION_INDENT: &str = "       ";

type HmacSha256 = Hmac<Sha256>;

/// What the observer records and how it renders it.
#[derive(Debug, Clone, Default)]
pub struct ObserverOptions {
    pub include_cookies: bool,
    pub include_signed_cookies: bool,
    pub include_ips: bool,
    pub optimize_for: OptimizeFor,
    pub trust_proxy: bool,
    pub cookie_secret: Option<String>,
}

impl ObserverOptions {
    pub fn from_config(config: &PipelineConfig) -> Self {
        Self {
            include_cookies: config.include_cookies,
            include_signed_cookies: config.include_signed_cookies,
            include_ips: config.include_ips,
            optimize_for: config.log_optimization,
            trust_proxy: config.trust_proxy,
            cookie_secret: config.cookie_secret.clone(),
        }
    }

    fn pretty_fields(&self) -> bool {
        self.optimize_for == OptimizeFor::Reading
    }

    fn pretty_body(&self) -> bool {
        matches!(self.optimize_for, OptimizeFor::Reading | OptimizeFor::Balanced)
    }
}

/// Serialize `value` as JSON, or fall back to its `Debug` form.
///
/// Pretty output uses a four-space indent. Never fails.
pub fn render_json<T>(value: &T, pretty: bool) -> String
where
    T: Serialize + fmt::Debug + ?Sized,
{
    let rendered = if pretty {
        let mut buf = Vec::new();
        let mut serializer =
            serde_json::Serializer::with_formatter(&mut buf, PrettyFormatter::with_indent(b"    "));
        value
            .serialize(&mut serializer)
            .map_err(|e| e.to_string())
            .and_then(|_| String::from_utf8(buf).map_err(|e| e.to_string()))
    } else {
        serde_json::to_string(value).map_err(|e| e.to_string())
    };

    rendered.unwrap_or_else(|_| format!("{value:?}"))
}

/// A structured field with both of its rendered forms.
#[derive(Debug, Clone, PartialEq)]
pub struct SnapshotField {
    pub value: Value,
    pub compact: String,
    pub pretty: String,
}

impl SnapshotField {
    pub fn new(value: Value) -> Self {
        let compact = render_json(&value, false);
        let pretty = render_json(&value, true);
        Self {
            value,
            compact,
            pretty,
        }
    }

    /// The form written to the log.
    pub fn rendered(&self, pretty: bool) -> String {
        if pretty {
            self.pretty
                .replace('\n', &format!("\n{CONTINUATION_INDENT}"))
        } else {
            self.compact.clone()
        }
    }
}

/// Read-only view of one request, built at pipeline entry.
#[derive(Debug, Clone)]
pub struct RequestSnapshot {
    pub local_time: String,
    pub utc_timestamp: String,
    pub method: String,
    pub full_url: String,
    pub ip: String,
    pub ips: SnapshotField,
    pub query: SnapshotField,
    pub headers: SnapshotField,
    pub cookies: SnapshotField,
    pub signed_cookies: SnapshotField,
    pub body: SnapshotField,
}

/// The request body as seen by the observer.
#[derive(Debug, Clone)]
pub enum CapturedBody {
    Bytes(Bytes),
    /// Declared length above the capture limit; left unread
    TooLarge(u64),
    /// Reading failed; the body is lost
    Unreadable(String),
}

impl RequestSnapshot {
    pub fn capture(parts: &Parts, body: &CapturedBody, options: &ObserverOptions) -> Self {
        let (ip, ips) = client_addresses(parts, options.trust_proxy);
        let (cookies, signed_cookies) =
            parse_cookies(&parts.headers, options.cookie_secret.as_deref());

        Self {
            local_time: Local::now().format("%H:%M:%S%.3f").to_string(),
            utc_timestamp: Utc::now().format("%Y-%m-%d %H:%M:%S%.3f").to_string(),
            method: parts.method.to_string(),
            full_url: full_url(parts),
            ip,
            ips: SnapshotField::new(json!(ips)),
            query: SnapshotField::new(parse_query(parts.uri.query().unwrap_or(""))),
            headers: SnapshotField::new(headers_to_json(&parts.headers)),
            cookies: SnapshotField::new(cookies),
            signed_cookies: SnapshotField::new(signed_cookies),
            body: SnapshotField::new(body_to_json(&parts.headers, body)),
        }
    }
}

/// Logs a snapshot of every request, then hands it on.
pub struct RequestObserver {
    options: ObserverOptions,
    sink: Arc<dyn LogSink>,
}

impl RequestObserver {
    pub const NAME: &'static str = "observer";

    pub fn new(options: ObserverOptions, sink: Arc<dyn LogSink>) -> Self {
        Self { options, sink }
    }

    /// Write the snapshot as one framed block.
    pub fn log(&self, snapshot: &RequestSnapshot) {
        let fields = self.options.pretty_fields();
        let sink = &self.sink;

        sink.verbose("");
        sink.verbose(">>>>");
        sink.verbose(&field_line(
            "Time",
            &format!("{} (UTC: {})", snapshot.local_time, snapshot.utc_timestamp),
        ));
        sink.info(&field_line("Request URL", &snapshot.full_url));
        sink.verbose(&field_line("Method", &snapshot.method));
        sink.verbose(&field_line("IP", &snapshot.ip));
        if self.options.include_ips {
            sink.verbose(&field_line("IP chain", &snapshot.ips.rendered(fields)));
        }
        sink.verbose(&field_line("Query", &snapshot.query.rendered(fields)));
        sink.verbose(&field_line("Headers", &snapshot.headers.rendered(fields)));
        if self.options.include_cookies {
            sink.verbose(&field_line("Cookies", &snapshot.cookies.rendered(fields)));
        }
        if self.options.include_signed_cookies {
            sink.verbose(&field_line(
                "Signed cookies",
                &snapshot.signed_cookies.rendered(fields),
            ));
        }
        sink.verbose(&field_line(
            "Body",
            &snapshot.body.rendered(self.options.pretty_body()),
        ));
        sink.verbose("<<<<");
    }
}

#[async_trait]
impl Stage for RequestObserver {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    async fn handle(&self, request: Request<Body>) -> Flow {
        let (parts, body) = request.into_parts();
        let (captured, body) = capture_body(&parts.headers, body).await;

        let snapshot = RequestSnapshot::capture(&parts, &captured, &self.options);
        self.log(&snapshot);

        Flow::Continue(Request::from_parts(parts, body))
    }
}

fn field_line(label: &str, value: &str) -> String {
    format!("    => {label:<14} - {value}")
}

/// Buffer the body so it can be both recorded and forwarded.
async fn capture_body(headers: &HeaderMap, body: Body) -> (CapturedBody, Body) {
    let declared = headers
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok());

    if let Some(len) = declared.filter(|len| *len > MAX_CAPTURED_BODY_BYTES as u64) {
        return (CapturedBody::TooLarge(len), body);
    }

    match axum::body::to_bytes(body, MAX_CAPTURED_BODY_BYTES).await {
        Ok(bytes) => (CapturedBody::Bytes(bytes.clone()), Body::from(bytes)),
        Err(e) => (CapturedBody::Unreadable(e.to_string()), Body::empty()),
    }
}

fn full_url(parts: &Parts) -> String {
    let host = parts
        .headers
        .get(header::HOST)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .or_else(|| parts.uri.authority().map(|a| a.to_string()))
        .unwrap_or_else(|| "localhost".to_string());
    let path = parts
        .uri
        .path_and_query()
        .map(|p| p.as_str())
        .unwrap_or("/");
    format!("http://{host}{path}")
}

/// Client address and forwarding chain.
///
/// Without `trust_proxy` the chain is empty and the address is the peer.
fn client_addresses(parts: &Parts, trust_proxy: bool) -> (String, Vec<String>) {
    let peer = parts
        .extensions
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip().to_canonical().to_string())
        .unwrap_or_else(|| "unknown".to_string());

    if !trust_proxy {
        return (peer, Vec::new());
    }

    let chain: Vec<String> = parts
        .headers
        .get_all("x-forwarded-for")
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect();

    match chain.first() {
        Some(first) => (first.clone(), chain),
        None => (peer, chain),
    }
}

fn decode_component(raw: &str) -> String {
    let spaced = raw.replace('+', " ");
    urlencoding::decode(&spaced)
        .map(|decoded| decoded.into_owned())
        .unwrap_or_else(|_| spaced.clone())
}

/// Parse `a=1&b=2&a=3` into an object; repeated keys become arrays.
pub fn parse_query(query: &str) -> Value {
    let mut map = Map::new();
    for pair in query.split('&').filter(|p| !p.is_empty()) {
        let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
        let key = decode_component(key);
        let value = Value::String(decode_component(value));

        match map.get_mut(&key) {
            Some(Value::Array(items)) => items.push(value),
            Some(existing) => {
                let first = existing.take();
                *existing = Value::Array(vec![first, value]);
            }
            None => {
                map.insert(key, value);
            }
        }
    }
    Value::Object(map)
}

/// Lowercase header names to values; repeats are joined, except `set-cookie`.
pub fn headers_to_json(headers: &HeaderMap) -> Value {
    let mut map = Map::new();
    for name in headers.keys() {
        let values: Vec<String> = headers
            .get_all(name)
            .iter()
            .map(|v| String::from_utf8_lossy(v.as_bytes()).into_owned())
            .collect();

        let value = if *name == header::SET_COOKIE {
            json!(values)
        } else {
            Value::String(values.join(", "))
        };
        map.insert(name.as_str().to_string(), value);
    }
    Value::Object(map)
}

/// Split the `Cookie` header into plain and signed cookies.
///
/// Values are percent-decoded and `j:`-prefixed values are parsed as JSON.
/// With a secret, `s:`-prefixed values are verified and moved to the signed
/// map, holding `false` when the signature does not match. Without a secret
/// the signed map stays empty.
pub fn parse_cookies(headers: &HeaderMap, secret: Option<&str>) -> (Value, Value) {
    let mut cookies = Map::new();
    let mut signed = Map::new();

    let pairs = headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(';'))
        .filter_map(|pair| pair.split_once('='));

    for (name, value) in pairs {
        let name = name.trim();
        if name.is_empty() || cookies.contains_key(name) || signed.contains_key(name) {
            continue;
        }
        let value = value.trim().trim_matches('"');
        let value = urlencoding::decode(value)
            .map(|v| v.into_owned())
            .unwrap_or_else(|_| value.to_string());

        match (secret, value.strip_prefix("s:")) {
            (Some(secret), Some(signed_value)) => {
                let verified = match unsign_cookie(signed_value, secret) {
                    Some(unsigned) => json_cookie(unsigned),
                    None => Value::Bool(false),
                };
                signed.insert(name.to_string(), verified);
            }
            _ => {
                cookies.insert(name.to_string(), json_cookie(value));
            }
        }
    }

    (Value::Object(cookies), Value::Object(signed))
}

fn json_cookie(value: String) -> Value {
    match value.strip_prefix("j:") {
        Some(raw) => serde_json::from_str(raw).unwrap_or(Value::String(value)),
        None => Value::String(value),
    }
}

/// Verify `<value>.<signature>` and return the value.
fn unsign_cookie(input: &str, secret: &str) -> Option<String> {
    let (value, signature) = input.rsplit_once('.')?;
    let signature = STANDARD_NO_PAD.decode(signature.trim_end_matches('=')).ok()?;
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).ok()?;
    mac.update(value.as_bytes());
    mac.verify_slice(&signature).ok()?;
    Some(value.to_string())
}

/// Produce a signed cookie value, the inverse of verification.
pub fn sign_cookie(value: &str, secret: &str) -> String {
    let mut mac = match HmacSha256::new_from_slice(secret.as_bytes()) {
        Ok(mac) => mac,
        Err(_) => return value.to_string(),
    };
    mac.update(value.as_bytes());
    let signature = STANDARD_NO_PAD.encode(mac.finalize().into_bytes());
    format!("s:{value}.{signature}")
}

fn body_to_json(headers: &HeaderMap, body: &CapturedBody) -> Value {
    let bytes = match body {
        CapturedBody::Bytes(bytes) => bytes,
        CapturedBody::TooLarge(len) => {
            return Value::String(format!("<{len} bytes, not captured>"));
        }
        CapturedBody::Unreadable(reason) => {
            return Value::String(format!("<unreadable body: {reason}>"));
        }
    };

    if bytes.is_empty() {
        return json!({});
    }

    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_ascii_lowercase();

    let Ok(text) = std::str::from_utf8(bytes) else {
        return Value::String(format!("<{} bytes of binary data>", bytes.len()));
    };

    if content_type.contains("json") {
        serde_json::from_str(text).unwrap_or_else(|_| Value::String(text.to_string()))
    } else if content_type.starts_with("application/x-www-form-urlencoded") {
        parse_query(text)
    } else {
        Value::String(text.to_string())
    }
}
