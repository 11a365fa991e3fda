//! Option normalization.
//!
//! Options arrive loosely typed from the command line, the environment and an
//! optional TOML file. They are merged into [`RawOptions`] and normalized once
//! into an immutable [`PipelineConfig`]. Out-of-range values are clamped or
//! reset to their defaults here, so nothing downstream has to validate them.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::ServeError;

pub const DEFAULT_PORT: u16 = 8080;
pub const DEFAULT_FALLBACK_STATUS: u16 = 404;
pub const DEFAULT_HOST: IpAddr = IpAddr::V4(Ipv4Addr::UNSPECIFIED);

/// How the request observer renders structured fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OptimizeFor {
    /// Compact single-line JSON everywhere
    Size,
    /// Indented multi-line JSON everywhere
    Reading,
    /// Compact JSON, except for the body which is indented
    #[default]
    Balanced,
}

impl FromStr for OptimizeFor {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "size" => Ok(Self::Size),
            "reading" => Ok(Self::Reading),
            "balanced" => Ok(Self::Balanced),
            other => Err(format!("unknown rendering mode: {other}")),
        }
    }
}

impl fmt::Display for OptimizeFor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Size => "size",
            Self::Reading => "reading",
            Self::Balanced => "balanced",
        };
        f.write_str(name)
    }
}

/// A loosely typed option value.
///
/// TOML files may carry numbers or strings and the command line only carries
/// strings, so numeric options are parsed late, during normalization.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum Loose {
    Int(i64),
    Float(f64),
    Text(String),
}

impl Loose {
    fn as_i64(&self) -> Option<i64> {
        match self {
            Loose::Int(v) => Some(*v),
            Loose::Float(v) if v.is_finite() => Some(v.trunc() as i64),
            Loose::Float(_) => None,
            Loose::Text(s) => {
                let s = s.trim();
                s.parse::<i64>().ok().or_else(|| {
                    s.parse::<f64>()
                        .ok()
                        .filter(|v| v.is_finite())
                        .map(|v| v.trunc() as i64)
                })
            }
        }
    }

    fn as_f64(&self) -> Option<f64> {
        match self {
            Loose::Int(v) => Some(*v as f64),
            Loose::Float(v) => Some(*v),
            Loose::Text(s) => s.trim().parse::<f64>().ok(),
        }
        .filter(|v| !v.is_nan())
    }
}

impl From<String> for Loose {
    fn from(value: String) -> Self {
        Loose::Text(value)
    }
}

impl From<&str> for Loose {
    fn from(value: &str) -> Self {
        Loose::Text(value.to_string())
    }
}

/// Unvalidated options as gathered from the CLI, environment and config file.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct RawOptions {
    pub port: Option<Loose>,
    pub port_dynamic: Option<bool>,
    pub disable_static: Option<bool>,
    pub status: Option<Loose>,
    pub response: Option<String>,
    pub delay_min: Option<Loose>,
    pub delay_max: Option<Loose>,
    pub abort_randomly: Option<Loose>,
    pub optimize_for: Option<String>,
    pub root: Option<PathBuf>,
    pub host: Option<String>,
    pub trust_proxy: Option<bool>,
    pub cookie_secret: Option<String>,
    pub include_cookies: Option<bool>,
    pub include_signed_cookies: Option<bool>,
    pub include_ips: Option<bool>,
    pub quiet: Option<bool>,
}

impl RawOptions {
    /// Load options from a TOML file
    pub fn from_file(path: &Path) -> Result<Self, ServeError> {
        let content = std::fs::read_to_string(path).map_err(|e| ServeError::Config {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        toml::from_str(&content).map_err(|e| ServeError::Config {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })
    }

    /// Layer `other` on top of `self`; values set in `other` win.
    pub fn overlay(self, other: RawOptions) -> RawOptions {
        RawOptions {
            port: other.port.or(self.port),
            port_dynamic: other.port_dynamic.or(self.port_dynamic),
            disable_static: other.disable_static.or(self.disable_static),
            status: other.status.or(self.status),
            response: other.response.or(self.response),
            delay_min: other.delay_min.or(self.delay_min),
            delay_max: other.delay_max.or(self.delay_max),
            abort_randomly: other.abort_randomly.or(self.abort_randomly),
            optimize_for: other.optimize_for.or(self.optimize_for),
            root: other.root.or(self.root),
            host: other.host.or(self.host),
            trust_proxy: other.trust_proxy.or(self.trust_proxy),
            cookie_secret: other.cookie_secret.or(self.cookie_secret),
            include_cookies: other.include_cookies.or(self.include_cookies),
            include_signed_cookies: other.include_signed_cookies.or(self.include_signed_cookies),
            include_ips: other.include_ips.or(self.include_ips),
            quiet: other.quiet.or(self.quiet),
        }
    }
}

/// Validated, immutable server configuration
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineConfig {
    /// Listen port, or the base of the search in dynamic mode
    pub port: u16,
    /// Search upward from `port` for the first free port
    pub port_dynamic: bool,
    /// Serve files and directory listings from `root`
    pub serve_static: bool,
    /// Status code of the fallback response
    pub fallback_status: u16,
    /// Literal fallback body; `None` means the JSON status body
    pub fallback_body: Option<String>,
    pub delay_min_ms: u64,
    pub delay_max_ms: u64,
    /// Chance in [0, 1] that a request gets its connection dropped
    pub abort_probability: f64,
    pub log_optimization: OptimizeFor,
    pub include_cookies: bool,
    pub include_signed_cookies: bool,
    pub include_ips: bool,
    /// Directory served by the static stage
    pub root: PathBuf,
    /// Address to bind to
    pub host: IpAddr,
    /// Take client addresses from `X-Forwarded-For`
    pub trust_proxy: bool,
    /// Secret used to verify signed cookies
    pub cookie_secret: Option<String>,
    /// Drop verbose log lines
    pub quiet: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self::from_raw(RawOptions::default())
    }
}

impl PipelineConfig {
    /// Normalize raw options, clamping or defaulting anything out of range.
    pub fn from_raw(raw: RawOptions) -> Self {
        let port = match raw.port.as_ref().and_then(Loose::as_i64) {
            Some(p) if (1..=65535).contains(&p) => p as u16,
            other => {
                if raw.port.is_some() {
                    debug!("port {:?} out of range, using {}", other, DEFAULT_PORT);
                }
                DEFAULT_PORT
            }
        };

        let fallback_status = match raw.status.as_ref().and_then(Loose::as_i64) {
            Some(s) if (100..=999).contains(&s) => s as u16,
            other => {
                if raw.status.is_some() {
                    debug!(
                        "status {:?} out of range, using {}",
                        other, DEFAULT_FALLBACK_STATUS
                    );
                }
                DEFAULT_FALLBACK_STATUS
            }
        };

        let delay_min_ms = normalize_delay("delay-min", raw.delay_min.as_ref());
        let mut delay_max_ms = normalize_delay("delay-max", raw.delay_max.as_ref());
        if delay_max_ms < delay_min_ms {
            debug!(
                "delay-max {} is below delay-min {}, raising it",
                delay_max_ms, delay_min_ms
            );
            delay_max_ms = delay_min_ms;
        }

        let abort_probability = match raw.abort_randomly.as_ref().and_then(Loose::as_f64) {
            Some(p) => {
                let clamped = p.clamp(0.0, 1.0);
                if clamped != p {
                    debug!("abort probability {} clamped to {}", p, clamped);
                }
                clamped
            }
            None => {
                if raw.abort_randomly.is_some() {
                    debug!("abort probability is not a number, disabling aborts");
                }
                0.0
            }
        };

        let log_optimization = match raw.optimize_for.as_deref() {
            Some(mode) => mode.parse().unwrap_or_else(|e| {
                debug!("{}, using {}", e, OptimizeFor::default());
                OptimizeFor::default()
            }),
            None => OptimizeFor::default(),
        };

        let host = match raw.host.as_deref() {
            Some(host) => host.trim().parse().unwrap_or_else(|_| {
                debug!("invalid host {:?}, using {}", host, DEFAULT_HOST);
                DEFAULT_HOST
            }),
            None => DEFAULT_HOST,
        };

        Self {
            port,
            port_dynamic: raw.port_dynamic.unwrap_or(false),
            serve_static: !raw.disable_static.unwrap_or(false),
            fallback_status,
            fallback_body: raw.response.filter(|body| !body.is_empty()),
            delay_min_ms,
            delay_max_ms,
            abort_probability,
            log_optimization,
            include_cookies: raw.include_cookies.unwrap_or(true),
            include_signed_cookies: raw.include_signed_cookies.unwrap_or(true),
            include_ips: raw.include_ips.unwrap_or(true),
            root: raw.root.unwrap_or_else(|| PathBuf::from(".")),
            host,
            trust_proxy: raw.trust_proxy.unwrap_or(false),
            cookie_secret: raw.cookie_secret.filter(|secret| !secret.is_empty()),
            quiet: raw.quiet.unwrap_or(false),
        }
    }
}

/// Negative or unparseable delays become 0.
fn normalize_delay(name: &str, value: Option<&Loose>) -> u64 {
    let Some(value) = value else {
        return 0;
    };
    match value.as_i64() {
        Some(ms) if ms >= 0 => ms as u64,
        other => {
            debug!("{} {:?} is not a valid delay, using 0", name, other);
            0
        }
    }
}
