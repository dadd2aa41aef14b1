//! Health probing and the per-service health state machine.
//!
//! Each configured probe feeds a [`ProbeTracker`] that counts consecutive
//! passes and failures against its thresholds. [`HealthStateMachine`]
//! aggregates the trackers of one service and reports a new
//! [`HealthState`] only when the aggregate actually changes.

use crate::model::{HealthState, Probe, ProbeKind, Service, ServiceConfig};
use async_net::TcpStream;
use async_trait::async_trait;
use futures::{AsyncReadExt, AsyncWriteExt};
use std::time::Duration;
use tracing::debug;

/// Result of one probe evaluation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeOutcome {
    /// The probe passed
    Success,
    /// The probe failed with a reason
    Failure(String),
}

impl ProbeOutcome {
    /// Whether the probe passed
    pub fn is_success(&self) -> bool {
        matches!(self, ProbeOutcome::Success)
    }
}

/// Backend-specific probe execution
#[async_trait]
pub trait ProbeRunner: Send + Sync {
    /// Evaluate `probe` against the observed `service` instance
    async fn run_probe(&self, service: &Service, probe: &Probe) -> ProbeOutcome;
}

/// Consecutive pass/fail counter for a single probe
#[derive(Debug, Clone)]
pub struct ProbeTracker {
    probe: Probe,
    consecutive_successes: u32,
    consecutive_failures: u32,
    state: HealthState,
}

impl ProbeTracker {
    /// Tracker in the `Starting` state
    pub fn new(probe: Probe) -> Self {
        Self {
            probe,
            consecutive_successes: 0,
            consecutive_failures: 0,
            state: HealthState::Starting,
        }
    }

    /// Feed one evaluation and return the probe's state afterwards
    pub fn record(&mut self, outcome: &ProbeOutcome) -> HealthState {
        if outcome.is_success() {
            self.consecutive_successes = self.consecutive_successes.saturating_add(1);
            self.consecutive_failures = 0;
            if self.state != HealthState::Healthy
                && self.consecutive_successes >= self.probe.success_threshold
            {
                self.state = HealthState::Healthy;
            }
        } else {
            self.consecutive_failures = self.consecutive_failures.saturating_add(1);
            self.consecutive_successes = 0;
            if self.state != HealthState::Unhealthy
                && self.consecutive_failures >= self.probe.failure_threshold
            {
                self.state = HealthState::Unhealthy;
            }
        }
        self.state
    }

    /// Current state of this probe
    pub fn state(&self) -> HealthState {
        self.state
    }

    /// Probe definition
    pub fn probe(&self) -> &Probe {
        &self.probe
    }
}

/// Aggregated health of one service
#[derive(Debug, Clone)]
pub struct HealthStateMachine {
    config: ServiceConfig,
    startup: Option<ProbeTracker>,
    startup_passed: bool,
    liveness: Option<ProbeTracker>,
    readiness: Option<ProbeTracker>,
    current: HealthState,
}

impl HealthStateMachine {
    /// Machine for the probes in `config`; `Starting` when any probe exists
    pub fn new(config: &ServiceConfig) -> Self {
        let current = if config.has_probes() {
            HealthState::Starting
        } else {
            HealthState::Unknown
        };
        Self {
            config: config.clone(),
            startup: config.startup_probe.clone().map(ProbeTracker::new),
            startup_passed: config.startup_probe.is_none(),
            liveness: config.liveness_probe.clone().map(ProbeTracker::new),
            readiness: config.readiness_probe.clone().map(ProbeTracker::new),
            current,
        }
    }

    /// Current aggregated health
    pub fn current(&self) -> HealthState {
        self.current
    }

    /// Whether a probe slot still needs evaluating
    pub fn wants(&self, kind: ProbeKind) -> bool {
        match kind {
            ProbeKind::Startup => self.startup.is_some() && !self.startup_passed,
            ProbeKind::Liveness => self.liveness.is_some() && self.startup_passed,
            ProbeKind::Readiness => self.readiness.is_some() && self.startup_passed,
        }
    }

    /// Feed one evaluation; returns the new health only on a transition
    pub fn record(&mut self, kind: ProbeKind, outcome: &ProbeOutcome) -> Option<HealthState> {
        if !self.wants(kind) {
            return None;
        }

        let tracker = match kind {
            ProbeKind::Startup => self.startup.as_mut(),
            ProbeKind::Liveness => self.liveness.as_mut(),
            ProbeKind::Readiness => self.readiness.as_mut(),
        }?;
        let probe_state = tracker.record(outcome);

        if kind == ProbeKind::Startup && probe_state == HealthState::Healthy {
            self.startup_passed = true;
        }

        self.transition(self.aggregate(kind, probe_state))
    }

    /// Swap in a new probe configuration; resets to `Starting` if it differs
    pub fn update_probes(&mut self, config: &ServiceConfig) -> Option<HealthState> {
        if !self.probes_differ(config) {
            return None;
        }
        let previous = self.current;
        *self = Self::new(config);
        (self.current != previous).then_some(self.current)
    }

    /// Whether `config` defines different probes than the ones tracked
    pub fn probes_differ(&self, config: &ServiceConfig) -> bool {
        self.config.liveness_probe != config.liveness_probe
            || self.config.readiness_probe != config.readiness_probe
            || self.config.startup_probe != config.startup_probe
    }

    /// Monitoring stopped; health becomes `Unknown`
    pub fn stop(&mut self) -> Option<HealthState> {
        self.transition(HealthState::Unknown)
    }

    fn aggregate(&self, kind: ProbeKind, probe_state: HealthState) -> HealthState {
        if !self.startup_passed {
            return if kind == ProbeKind::Startup && probe_state == HealthState::Unhealthy {
                HealthState::Unhealthy
            } else {
                HealthState::Starting
            };
        }

        let states: Vec<HealthState> = [&self.liveness, &self.readiness]
            .into_iter()
            .flatten()
            .map(ProbeTracker::state)
            .collect();

        if states.is_empty() {
            // Only a startup probe was configured and it has passed
            return HealthState::Healthy;
        }
        if states.contains(&HealthState::Unhealthy) {
            HealthState::Unhealthy
        } else if states.iter().all(|s| *s == HealthState::Healthy) {
            HealthState::Healthy
        } else if self.current == HealthState::Unknown {
            HealthState::Starting
        } else {
            // Healthy/unhealthy hold until every probe has an opinion
            match self.current {
                HealthState::Healthy | HealthState::Unhealthy => self.current,
                _ => HealthState::Starting,
            }
        }
    }

    fn transition(&mut self, next: HealthState) -> Option<HealthState> {
        if next == self.current {
            return None;
        }
        debug!("Health transition {} -> {}", self.current, next);
        self.current = next;
        Some(next)
    }
}

/// TCP connect probe
pub async fn tcp_probe(host: &str, port: u16) -> ProbeOutcome {
    match TcpStream::connect((host, port)).await {
        Ok(_) => ProbeOutcome::Success,
        Err(e) => ProbeOutcome::Failure(format!("connect {}:{} failed: {}", host, port, e)),
    }
}

/// HTTP GET probe; status 200-399 passes
pub async fn http_probe(host: &str, port: u16, path: &str) -> ProbeOutcome {
    let mut stream = match TcpStream::connect((host, port)).await {
        Ok(stream) => stream,
        Err(e) => return ProbeOutcome::Failure(format!("connect {}:{} failed: {}", host, port, e)),
    };

    let request = format!(
        "GET {} HTTP/1.1\r\nHost: {}:{}\r\nUser-Agent: edge-agent-probe\r\nConnection: close\r\n\r\n",
        path, host, port
    );
    if let Err(e) = stream.write_all(request.as_bytes()).await {
        return ProbeOutcome::Failure(format!("write failed: {}", e));
    }

    let mut head = vec![0u8; 64];
    let mut read = 0;
    while read < head.len() {
        match stream.read(&mut head[read..]).await {
            Ok(0) => break,
            Ok(n) => {
                read += n;
                if head[..read].contains(&b'\n') {
                    break;
                }
            }
            Err(e) => return ProbeOutcome::Failure(format!("read failed: {}", e)),
        }
    }

    match parse_status_code(&head[..read]) {
        Some(code) if (200..400).contains(&code) => ProbeOutcome::Success,
        Some(code) => ProbeOutcome::Failure(format!("HTTP status {}", code)),
        None => ProbeOutcome::Failure("malformed HTTP response".to_string()),
    }
}

fn parse_status_code(head: &[u8]) -> Option<u16> {
    let line = std::str::from_utf8(head).ok()?.lines().next()?;
    let mut parts = line.split_whitespace();
    let version = parts.next()?;
    if !version.starts_with("HTTP/") {
        return None;
    }
    parts.next()?.parse().ok()
}

/// Deadline for a probe evaluation
pub fn probe_timeout(probe: &Probe) -> Duration {
    Duration::from_secs(probe.timeout_seconds.max(1))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ProbeHandler;

    fn probe(success_threshold: u32, failure_threshold: u32) -> Probe {
        Probe {
            success_threshold,
            failure_threshold,
            ..Probe::new(ProbeHandler::Tcp { port: 80 })
        }
    }

    fn fail() -> ProbeOutcome {
        ProbeOutcome::Failure("nope".into())
    }

    #[test]
    fn test_thresholds_gate_transitions() {
        let config = ServiceConfig {
            liveness_probe: Some(probe(2, 3)),
            ..ServiceConfig::default()
        };
        let mut machine = HealthStateMachine::new(&config);
        assert_eq!(machine.current(), HealthState::Starting);

        assert_eq!(machine.record(ProbeKind::Liveness, &ProbeOutcome::Success), None);
        assert_eq!(
            machine.record(ProbeKind::Liveness, &ProbeOutcome::Success),
            Some(HealthState::Healthy)
        );
        // Repeated passes never re-announce
        assert_eq!(machine.record(ProbeKind::Liveness, &ProbeOutcome::Success), None);

        assert_eq!(machine.record(ProbeKind::Liveness, &fail()), None);
        assert_eq!(machine.record(ProbeKind::Liveness, &fail()), None);
        assert_eq!(
            machine.record(ProbeKind::Liveness, &fail()),
            Some(HealthState::Unhealthy)
        );
        assert_eq!(machine.record(ProbeKind::Liveness, &fail()), None);

        assert_eq!(machine.record(ProbeKind::Liveness, &ProbeOutcome::Success), None);
        assert_eq!(
            machine.record(ProbeKind::Liveness, &ProbeOutcome::Success),
            Some(HealthState::Healthy)
        );
    }

    #[test]
    fn test_startup_probe_gates_liveness() {
        let config = ServiceConfig {
            startup_probe: Some(probe(1, 2)),
            liveness_probe: Some(probe(1, 1)),
            ..ServiceConfig::default()
        };
        let mut machine = HealthStateMachine::new(&config);
        assert!(machine.wants(ProbeKind::Startup));
        assert!(!machine.wants(ProbeKind::Liveness));
        assert_eq!(machine.record(ProbeKind::Liveness, &fail()), None);

        assert_eq!(machine.record(ProbeKind::Startup, &ProbeOutcome::Success), None);
        assert!(!machine.wants(ProbeKind::Startup));
        assert!(machine.wants(ProbeKind::Liveness));

        assert_eq!(
            machine.record(ProbeKind::Liveness, &ProbeOutcome::Success),
            Some(HealthState::Healthy)
        );
    }

    #[test]
    fn test_probe_change_resets_to_starting_and_stop_is_unknown() {
        let config = ServiceConfig {
            liveness_probe: Some(probe(1, 1)),
            ..ServiceConfig::default()
        };
        let mut machine = HealthStateMachine::new(&config);
        machine.record(ProbeKind::Liveness, &fail());
        assert_eq!(machine.current(), HealthState::Unhealthy);

        assert_eq!(machine.update_probes(&config), None);

        let http = ServiceConfig {
            liveness_probe: Some(Probe::new(ProbeHandler::Http {
                path: "/".into(),
                port: 80,
            })),
            ..ServiceConfig::default()
        };
        assert_eq!(machine.update_probes(&http), Some(HealthState::Starting));
        assert_eq!(machine.stop(), Some(HealthState::Unknown));
        assert_eq!(machine.stop(), None);
    }

    #[test]
    fn test_parse_status_code() {
        assert_eq!(parse_status_code(b"HTTP/1.1 204 No Content\r\n"), Some(204));
        assert_eq!(parse_status_code(b"HTTP/1.0 503 Service Unavailable\r\n"), Some(503));
        assert_eq!(parse_status_code(b"garbage"), None);
    }

    #[test]
    fn test_http_probe_against_local_listener() {
        smol::block_on(async {
            let listener = async_net::TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
            let port = listener.local_addr().unwrap().port();
            let server = smol::spawn(async move {
                let (mut socket, _) = listener.accept().await.unwrap();
                let mut buf = [0u8; 512];
                let _ = socket.read(&mut buf).await;
                socket
                    .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\n")
                    .await
                    .unwrap();
            });

            assert_eq!(http_probe("127.0.0.1", port, "/healthz").await, ProbeOutcome::Success);
            server.await;
        });
    }

    #[test]
    fn test_tcp_probe_refused() {
        smol::block_on(async {
            let listener = async_net::TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
            let port = listener.local_addr().unwrap().port();
            drop(listener);
            assert!(!tcp_probe("127.0.0.1", port).await.is_success());
        });
    }
}
