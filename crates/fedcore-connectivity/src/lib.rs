//! Health-checking, TLS-aware retry, and endpoint classification for
//! per-user REST configs built by `fedcore-kubeconfig`.
//!
//! The retry loop mirrors the teacher's `get_backoff` pattern in
//! `kaniop_operator::controller::context` (a `backon::ExponentialBuilder`
//! iterator stored across attempts), generalized from per-object reconcile
//! backoff to a single bounded connectivity probe.

use std::net::{IpAddr, Ipv6Addr};
use std::time::Duration;

use backon::{BackoffBuilder, ExponentialBuilder};
use fedcore_error::{Error, ErrorKind, Result};
use tokio_util::sync::CancellationToken;

/// Tunables for a single health-check attempt and its surrounding retry loop.
#[derive(Debug, Clone)]
pub struct ConnectivityConfig {
    pub connection_timeout: Duration,
    pub request_timeout: Duration,
    pub retry_attempts: u32,
    pub retry_backoff: Duration,
    pub health_check_path: String,
    pub qps: f32,
    pub burst: u32,
}

impl Default for ConnectivityConfig {
    fn default() -> Self {
        Self {
            connection_timeout: Duration::from_secs(5),
            request_timeout: Duration::from_secs(30),
            retry_attempts: 3,
            retry_backoff: Duration::from_secs(1),
            health_check_path: "/healthz".to_string(),
            qps: 50.0,
            burst: 100,
        }
    }
}

impl ConnectivityConfig {
    /// A preset with longer timeouts for cross-region workload clusters,
    /// keeping the same retry count and backoff shape.
    pub fn high_latency() -> Self {
        Self {
            connection_timeout: Duration::from_secs(15),
            request_timeout: Duration::from_secs(60),
            ..Self::default()
        }
    }
}

/// Classification of a target host, used to pick konnectivity-aware or
/// locality-aware behavior upstream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointType {
    Konnectivity,
    Private,
    Public,
    Unknown,
}

impl EndpointType {
    pub fn as_str(self) -> &'static str {
        match self {
            EndpointType::Konnectivity => "konnectivity",
            EndpointType::Private => "private",
            EndpointType::Public => "public",
            EndpointType::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for EndpointType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

const PRIVATE_DNS_SUFFIXES: &[&str] = &[".internal", ".local", ".svc", ".cluster.local"];

/// Classify `host` (a bare host, a `host:port` pair, a bracketed IPv6
/// literal, or a full `scheme://host[:port]` URL) as `konnectivity`,
/// `private`, `public`, or `unknown`.
pub fn get_endpoint_type(host: &str) -> EndpointType {
    let lower = host.to_ascii_lowercase();
    if lower.contains("konnectivity") {
        return EndpointType::Konnectivity;
    }

    let bare = strip_scheme_and_port(&lower);
    if bare.is_empty() {
        return EndpointType::Unknown;
    }
    if let Ok(ip) = bare.parse::<IpAddr>() {
        return classify_ip(ip);
    }
    if PRIVATE_DNS_SUFFIXES.iter().any(|suffix| bare.ends_with(suffix)) {
        return EndpointType::Private;
    }
    EndpointType::Public
}

fn strip_scheme_and_port(input: &str) -> String {
    let without_scheme = input.rsplit_once("://").map(|(_, rest)| rest).unwrap_or(input);
    if let Some(rest) = without_scheme.strip_prefix('[') {
        return match rest.find(']') {
            Some(end) => rest[..end].to_string(),
            None => rest.to_string(),
        };
    }
    match without_scheme.rsplit_once(':') {
        Some((host, port)) if !port.is_empty() && port.chars().all(|c| c.is_ascii_digit()) => {
            host.to_string()
        }
        _ => without_scheme.to_string(),
    }
}

fn classify_ip(ip: IpAddr) -> EndpointType {
    match ip {
        IpAddr::V4(v4) => {
            if v4.is_private() || v4.is_link_local() {
                EndpointType::Private
            } else {
                EndpointType::Public
            }
        }
        IpAddr::V6(v6) => {
            if is_unique_local_v6(v6) || v6.is_unicast_link_local() {
                EndpointType::Private
            } else {
                EndpointType::Public
            }
        }
    }
}

fn is_unique_local_v6(v6: Ipv6Addr) -> bool {
    (v6.segments()[0] & 0xfe00) == 0xfc00
}

/// Issue a single bounded GET against `cc.health_check_path`, classifying
/// the outcome per the rules in the module doc. `cancel` lets a caller
/// abort the in-flight request independently of `cc.connection_timeout`.
pub async fn check_connectivity(
    cluster_name: &str,
    rest_config: kube::Config,
    cc: &ConnectivityConfig,
    cancel: &CancellationToken,
) -> Result<()> {
    let host = rest_config
        .cluster_url
        .host()
        .unwrap_or_default()
        .to_string();

    let client = kube::Client::try_from(rest_config).map_err(|e| Error::Connection {
        host: host.clone(),
        reason: e.to_string(),
    })?;

    let request = http::Request::get(&cc.health_check_path)
        .body(Vec::new())
        .map_err(|e| Error::Connection {
            host: host.clone(),
            reason: e.to_string(),
        })?;

    tracing::debug!(cluster = cluster_name, host = %host, "checking connectivity");

    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(Error::Connection {
            host,
            reason: "request cancelled".to_string(),
        }),
        outcome = tokio::time::timeout(cc.connection_timeout, client.request_text(request)) => {
            match outcome {
                Err(_elapsed) => Err(Error::ConnectionTimeout { host }),
                Ok(Ok(_body)) => Ok(()),
                Ok(Err(e)) => Err(classify_kube_error(&host, &e)),
            }
        }
    }
}

fn classify_kube_error(host: &str, err: &kube::Error) -> Error {
    let text = err.to_string();
    let lower = text.to_ascii_lowercase();
    if lower.contains("tls") || lower.contains("certificate") || lower.contains("x509") {
        Error::TlsHandshake {
            host: host.to_string(),
            reason: text,
        }
    } else if lower.contains("timeout") || lower.contains("timed out") {
        Error::ConnectionTimeout {
            host: host.to_string(),
        }
    } else {
        Error::Connection {
            host: host.to_string(),
            reason: text,
        }
    }
}

/// Wrap [`check_connectivity`] with exponential backoff
/// (`retry_backoff * 2^(attempt-1)`), honoring `cancel` during both the
/// request itself and the wait between attempts. TLS-class failures are
/// never retried; every other failure is retried until `retry_attempts` is
/// exhausted, at which point the last error is returned verbatim.
pub async fn check_connectivity_with_retry(
    cluster_name: &str,
    rest_config: kube::Config,
    cc: &ConnectivityConfig,
    cancel: &CancellationToken,
) -> Result<()> {
    let attempts = cc.retry_attempts.max(1);
    let mut backoff = ExponentialBuilder::default()
        .with_min_delay(cc.retry_backoff)
        .with_factor(2.0)
        .without_max_delay()
        .with_max_times((attempts - 1) as usize)
        .build();

    let mut last_err = None;
    for attempt in 1..=attempts {
        match check_connectivity(cluster_name, rest_config.clone(), cc, cancel).await {
            Ok(()) => return Ok(()),
            Err(err) => {
                let non_retryable = fedcore_error::is(&err, ErrorKind::TlsHandshakeFailed);
                last_err = Some(err);
                if non_retryable || attempt == attempts {
                    break;
                }
                let delay = backoff.next().unwrap_or(cc.retry_backoff);
                tracing::debug!(
                    cluster = cluster_name,
                    attempt,
                    next_delay_ms = delay.as_millis() as u64,
                    "connectivity check failed, retrying"
                );
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }
    }
    Err(last_err.expect("loop runs at least once and records an error before every break"))
}
