//! Dependency readiness gate.
//!
//! Blocks the run until every auxiliary service (cache store, database, ...)
//! answers its health probe. Services are checked one after another; a
//! service that stays unhealthy for `max_retries` probes aborts the run with
//! [`HarnessError::DependencyUnavailable`] before any lane starts.

use crate::error::{HarnessError, HarnessResult};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::process::Stdio;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::process::Command;
use tokio::time::Instant;
use tracing::{debug, info, warn};

const DEFAULT_INTERVAL_MS: u64 = 10_000;
const DEFAULT_TIMEOUT_MS: u64 = 5_000;
const DEFAULT_MAX_RETRIES: u32 = 5;

/// Health of one auxiliary dependency.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ServiceHealth {
    Pending,
    Healthy,
    Failed,
}

/// How a service is probed.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ProbeSpec {
    /// Run a command; exit status 0 means healthy.
    Command { command: Vec<String> },

    /// Open a TCP connection to `address` (`host:port`).
    Tcp { address: String },
}

/// Declarative description of a service to wait for.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ServiceSpec {
    pub name: String,
    pub probe: ProbeSpec,

    /// Delay between failed probes, in milliseconds.
    #[serde(default = "default_interval_ms")]
    pub interval_ms: u64,

    /// Maximum number of probe attempts.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Upper bound for a single probe, in milliseconds.
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_interval_ms() -> u64 {
    DEFAULT_INTERVAL_MS
}

fn default_max_retries() -> u32 {
    DEFAULT_MAX_RETRIES
}

fn default_timeout_ms() -> u64 {
    DEFAULT_TIMEOUT_MS
}

impl ServiceSpec {
    pub fn command(name: impl Into<String>, command: Vec<String>) -> Self {
        Self {
            name: name.into(),
            probe: ProbeSpec::Command { command },
            interval_ms: DEFAULT_INTERVAL_MS,
            max_retries: DEFAULT_MAX_RETRIES,
            timeout_ms: DEFAULT_TIMEOUT_MS,
        }
    }

    pub fn tcp(name: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            probe: ProbeSpec::Tcp {
                address: address.into(),
            },
            interval_ms: DEFAULT_INTERVAL_MS,
            max_retries: DEFAULT_MAX_RETRIES,
            timeout_ms: DEFAULT_TIMEOUT_MS,
        }
    }

    /// Parse `name=host:port` or `name=cmd arg1 arg2`.
    ///
    /// Values that look like `host:port` become TCP probes, everything else
    /// is split on whitespace into a command.
    pub fn parse_inline(raw: &str) -> HarnessResult<Self> {
        let (name, target) = raw.split_once('=').ok_or_else(|| {
            HarnessError::Config(format!("service must be name=probe, got '{}'", raw))
        })?;
        let name = name.trim();
        let target = target.trim();
        if name.is_empty() || target.is_empty() {
            return Err(HarnessError::Config(format!(
                "service must be name=probe, got '{}'",
                raw
            )));
        }

        if looks_like_address(target) {
            Ok(Self::tcp(name, target))
        } else {
            let command = target.split_whitespace().map(str::to_string).collect();
            Ok(Self::command(name, command))
        }
    }
}

fn looks_like_address(target: &str) -> bool {
    if target.contains(char::is_whitespace) {
        return false;
    }
    match target.rsplit_once(':') {
        Some((host, port)) => !host.is_empty() && port.parse::<u16>().is_ok(),
        None => false,
    }
}

/// A single health check.
#[async_trait]
pub trait Probe: Send + Sync {
    /// `Ok(())` when the service is healthy, otherwise a short reason.
    async fn check(&self) -> Result<(), String>;
}

/// Probe that runs a command and checks its exit status.
#[derive(Debug, Clone)]
pub struct CommandProbe {
    command: Vec<String>,
}

impl CommandProbe {
    pub fn new(command: Vec<String>) -> Self {
        Self { command }
    }
}

#[async_trait]
impl Probe for CommandProbe {
    async fn check(&self) -> Result<(), String> {
        let (exe, args) = self
            .command
            .split_first()
            .ok_or_else(|| "empty probe command".to_string())?;

        let status = Command::new(exe)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .status()
            .await
            .map_err(|e| format!("failed to spawn {}: {}", exe, e))?;

        if status.success() {
            Ok(())
        } else {
            Err(format!(
                "{} exited with code {}",
                exe,
                status.code().unwrap_or(-1)
            ))
        }
    }
}

/// Probe that opens a TCP connection.
#[derive(Debug, Clone)]
pub struct TcpProbe {
    address: String,
}

impl TcpProbe {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
        }
    }
}

#[async_trait]
impl Probe for TcpProbe {
    async fn check(&self) -> Result<(), String> {
        TcpStream::connect(&self.address)
            .await
            .map(|_| ())
            .map_err(|e| format!("connect {}: {}", self.address, e))
    }
}

/// A named probe together with its polling policy.
pub struct ServiceCheck {
    name: String,
    probe: Box<dyn Probe>,
    interval: Duration,
    max_retries: u32,
    timeout: Duration,
}

impl ServiceCheck {
    pub fn new(
        name: impl Into<String>,
        probe: impl Probe + 'static,
        interval: Duration,
        max_retries: u32,
    ) -> Self {
        Self {
            name: name.into(),
            probe: Box::new(probe),
            interval,
            max_retries,
            timeout: Duration::from_millis(DEFAULT_TIMEOUT_MS),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn from_spec(spec: &ServiceSpec) -> HarnessResult<Self> {
        let check = match &spec.probe {
            ProbeSpec::Command { command } => {
                if command.is_empty() {
                    return Err(HarnessError::Config(format!(
                        "service '{}' has an empty probe command",
                        spec.name
                    )));
                }
                Self::new(
                    &spec.name,
                    CommandProbe::new(command.clone()),
                    Duration::from_millis(spec.interval_ms),
                    spec.max_retries,
                )
            }
            ProbeSpec::Tcp { address } => Self::new(
                &spec.name,
                TcpProbe::new(address.clone()),
                Duration::from_millis(spec.interval_ms),
                spec.max_retries,
            ),
        };
        Ok(check.with_timeout(Duration::from_millis(spec.timeout_ms)))
    }

}

/// Final state of one service after the gate ran.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ServiceStatus {
    pub name: String,
    pub health: ServiceHealth,
    pub attempts: u32,
    pub elapsed_ms: u64,

    /// Last probe error, kept for services that never became healthy.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl ServiceStatus {
    fn pending(name: &str) -> Self {
        Self {
            name: name.to_string(),
            health: ServiceHealth::Pending,
            attempts: 0,
            elapsed_ms: 0,
            last_error: None,
        }
    }
}

/// Per-service outcome of a gate run, in configuration order.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReadinessReport {
    pub services: Vec<ServiceStatus>,
}

impl ReadinessReport {
    pub fn all_healthy(&self) -> bool {
        self.services
            .iter()
            .all(|s| s.health == ServiceHealth::Healthy)
    }

    /// The service that stopped the gate, if any.
    pub fn first_failure(&self) -> Option<&ServiceStatus> {
        self.services
            .iter()
            .find(|s| s.health == ServiceHealth::Failed)
    }

    /// `DependencyUnavailable` for the failed service, otherwise the report.
    pub fn into_result(self) -> HarnessResult<Self> {
        match self.first_failure() {
            Some(failed) => Err(HarnessError::DependencyUnavailable {
                service: failed.name.clone(),
                attempts: failed.attempts,
                last_error: failed.last_error.clone().unwrap_or_default(),
            }),
            None => Ok(self),
        }
    }
}

/// Sequential, blocking wait on all configured services.
#[derive(Default)]
pub struct ReadinessGate {
    checks: Vec<ServiceCheck>,
}

impl ReadinessGate {
    pub fn new(checks: Vec<ServiceCheck>) -> Self {
        Self { checks }
    }

    pub fn from_specs(specs: &[ServiceSpec]) -> HarnessResult<Self> {
        let checks = specs
            .iter()
            .map(ServiceCheck::from_spec)
            .collect::<HarnessResult<Vec<_>>>()?;
        Ok(Self::new(checks))
    }

    /// Probe every service in order and report each one's health.
    ///
    /// Stops probing at the first service that does not become healthy
    /// within its `max_retries` attempts. That service is reported `Failed`
    /// and the services after it stay `Pending`.
    pub async fn poll(&self) -> HarnessResult<ReadinessReport> {
        let mut report = ReadinessReport::default();
        let mut remaining = self.checks.iter();

        for check in remaining.by_ref() {
            let status = wait_for(check).await?;
            let failed = status.health == ServiceHealth::Failed;
            report.services.push(status);
            if failed {
                break;
            }
        }
        report
            .services
            .extend(remaining.map(|check| ServiceStatus::pending(&check.name)));

        if !self.checks.is_empty() && report.all_healthy() {
            info!(services = report.services.len(), "All dependencies healthy");
        }
        Ok(report)
    }

    /// Like [`poll`](Self::poll), but an unavailable service is an error.
    pub async fn wait(&self) -> HarnessResult<ReadinessReport> {
        self.poll().await?.into_result()
    }
}

async fn wait_for(check: &ServiceCheck) -> HarnessResult<ServiceStatus> {
    if check.max_retries == 0 {
        return Err(HarnessError::Config(format!(
            "service '{}' must allow at least one probe",
            check.name
        )));
    }

    let start = Instant::now();
    let mut health = ServiceHealth::Pending;
    let mut last_error = String::new();
    let mut attempts = 0;

    debug!(service = %check.name, ?health, "Waiting for dependency");

    while attempts < check.max_retries {
        attempts += 1;

        match tokio::time::timeout(check.timeout, check.probe.check()).await {
            Ok(Ok(())) => {
                health = ServiceHealth::Healthy;
                break;
            }
            Ok(Err(reason)) => last_error = reason,
            Err(_) => {
                last_error = format!("probe timed out after {}ms", check.timeout.as_millis())
            }
        }

        debug!(
            service = %check.name,
            attempt = attempts,
            max_retries = check.max_retries,
            error = %last_error,
            "Dependency not ready"
        );

        if attempts < check.max_retries {
            tokio::time::sleep(check.interval).await;
        }
    }

    let elapsed_ms = start.elapsed().as_millis() as u64;

    if health == ServiceHealth::Healthy {
        info!(service = %check.name, attempts, elapsed_ms, "Dependency healthy");
        return Ok(ServiceStatus {
            name: check.name.clone(),
            health,
            attempts,
            elapsed_ms,
            last_error: None,
        });
    }

    warn!(
        service = %check.name,
        attempts,
        error = %last_error,
        "Dependency unavailable"
    );
    Ok(ServiceStatus {
        name: check.name.clone(),
        health: ServiceHealth::Failed,
        attempts,
        elapsed_ms,
        last_error: Some(last_error),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    /// Fails until it has been called `healthy_after` times.
    struct FlakyProbe {
        calls: Arc<AtomicU32>,
        healthy_after: u32,
    }

    #[async_trait]
    impl Probe for FlakyProbe {
        async fn check(&self) -> Result<(), String> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if n >= self.healthy_after {
                Ok(())
            } else {
                Err(format!("not ready (call {})", n))
            }
        }
    }

    struct HangingProbe;

    #[async_trait]
    impl Probe for HangingProbe {
        async fn check(&self) -> Result<(), String> {
            std::future::pending::<()>().await;
            Ok(())
        }
    }

    fn flaky(healthy_after: u32) -> (FlakyProbe, Arc<AtomicU32>) {
        let calls = Arc::new(AtomicU32::new(0));
        (
            FlakyProbe {
                calls: Arc::clone(&calls),
                healthy_after,
            },
            calls,
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_fails_after_exactly_max_retries() {
        let (probe, calls) = flaky(u32::MAX);
        let gate = ReadinessGate::new(vec![ServiceCheck::new(
            "redis",
            probe,
            Duration::from_secs(10),
            5,
        )]);

        let start = Instant::now();
        let err = gate.wait().await.unwrap_err();

        assert_eq!(calls.load(Ordering::SeqCst), 5);
        // No sleep after the final attempt.
        assert_eq!(start.elapsed(), Duration::from_secs(40));
        match err {
            HarnessError::DependencyUnavailable {
                service, attempts, ..
            } => {
                assert_eq!(service, "redis");
                assert_eq!(attempts, 5);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_becomes_healthy_within_retries() {
        let (probe, calls) = flaky(3);
        let gate = ReadinessGate::new(vec![ServiceCheck::new(
            "postgres",
            probe,
            Duration::from_secs(2),
            5,
        )]);

        let report = gate.wait().await.expect("gate should pass");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert!(report.all_healthy());
        assert_eq!(report.services[0].attempts, 3);
        assert_eq!(report.services[0].elapsed_ms, 4_000);
    }

    #[tokio::test(start_paused = true)]
    async fn test_probe_timeout_counts_as_attempt() {
        let gate = ReadinessGate::new(vec![ServiceCheck::new(
            "hang",
            HangingProbe,
            Duration::from_secs(1),
            2,
        )
        .with_timeout(Duration::from_millis(500))]);

        let err = gate.wait().await.unwrap_err();
        match err {
            HarnessError::DependencyUnavailable {
                attempts,
                last_error,
                ..
            } => {
                assert_eq!(attempts, 2);
                assert!(last_error.contains("timed out"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_stops_at_first_unavailable_service() {
        let (bad, _) = flaky(u32::MAX);
        let (later, later_calls) = flaky(1);
        let gate = ReadinessGate::new(vec![
            ServiceCheck::new("redis", bad, Duration::from_millis(10), 1),
            ServiceCheck::new("postgres", later, Duration::from_millis(10), 3),
        ]);

        assert!(gate.wait().await.is_err());
        assert_eq!(later_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_poll_reports_failed_and_pending_services() {
        let (cache, _) = flaky(1);
        let (db, _) = flaky(u32::MAX);
        let (queue, queue_calls) = flaky(1);
        let gate = ReadinessGate::new(vec![
            ServiceCheck::new("redis", cache, Duration::from_secs(1), 3),
            ServiceCheck::new("postgres", db, Duration::from_secs(1), 2),
            ServiceCheck::new("queue", queue, Duration::from_secs(1), 3),
        ]);

        let report = gate.poll().await.expect("poll");
        let health: Vec<ServiceHealth> = report.services.iter().map(|s| s.health).collect();
        assert_eq!(
            health,
            vec![
                ServiceHealth::Healthy,
                ServiceHealth::Failed,
                ServiceHealth::Pending
            ]
        );
        assert_eq!(queue_calls.load(Ordering::SeqCst), 0);
        assert!(!report.all_healthy());

        let failed = report.first_failure().expect("failed service");
        assert_eq!(failed.name, "postgres");
        assert_eq!(failed.attempts, 2);
        assert!(failed
            .last_error
            .as_deref()
            .is_some_and(|e| e.contains("not ready")));

        match report.into_result().unwrap_err() {
            HarnessError::DependencyUnavailable {
                service, attempts, ..
            } => {
                assert_eq!(service, "postgres");
                assert_eq!(attempts, 2);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_zero_retries_is_config_error() {
        let (probe, _) = flaky(1);
        let gate = ReadinessGate::new(vec![ServiceCheck::new(
            "redis",
            probe,
            Duration::from_millis(1),
            0,
        )]);
        assert!(matches!(
            gate.wait().await.unwrap_err(),
            HarnessError::Config(_)
        ));
    }

    #[tokio::test]
    async fn test_empty_gate_passes() {
        let report = ReadinessGate::default().wait().await.expect("empty gate");
        assert!(report.services.is_empty());
        assert!(report.all_healthy());
    }

    #[tokio::test]
    async fn test_command_probe() {
        assert!(CommandProbe::new(vec!["true".to_string()])
            .check()
            .await
            .is_ok());
        let err = CommandProbe::new(vec!["false".to_string()])
            .check()
            .await
            .unwrap_err();
        assert!(err.contains("exited with code 1"));
        assert!(CommandProbe::new(vec![]).check().await.is_err());
    }

    #[tokio::test]
    async fn test_tcp_probe_against_local_listener() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind");
        let addr = listener.local_addr().expect("addr").to_string();
        assert!(TcpProbe::new(addr).check().await.is_ok());
    }

    #[test]
    fn test_parse_inline_service() {
        let redis = ServiceSpec::parse_inline("redis=localhost:6379").expect("parse");
        assert_eq!(
            redis.probe,
            ProbeSpec::Tcp {
                address: "localhost:6379".to_string()
            }
        );

        let pg = ServiceSpec::parse_inline("postgres=pg_isready -h localhost").expect("parse");
        assert_eq!(
            pg.probe,
            ProbeSpec::Command {
                command: vec![
                    "pg_isready".to_string(),
                    "-h".to_string(),
                    "localhost".to_string()
                ]
            }
        );

        assert!(ServiceSpec::parse_inline("redis").is_err());
        assert!(ServiceSpec::parse_inline("=localhost:1").is_err());
    }

    #[test]
    fn test_service_spec_defaults_from_json() {
        let spec: ServiceSpec = serde_json::from_str(
            r#"{"name":"redis","probe":{"kind":"command","command":["redis-cli","ping"]}}"#,
        )
        .expect("deserialize");
        assert_eq!(spec.interval_ms, 10_000);
        assert_eq!(spec.max_retries, 5);
        assert_eq!(spec.timeout_ms, 5_000);
    }
}
