//! Periodic health monitoring decoupled from the reconciliation loop.
//!
//! One background task runs per configured probe. Tasks share the
//! service's [`HealthStateMachine`] and exit once monitoring for the
//! service is stopped (their stop channel closes).

use crate::{
    Result,
    events::{Notification, Notifier},
    health::{HealthStateMachine, ProbeOutcome, ProbeRunner, probe_timeout},
    model::{HealthState, Probe, ProbeKind, Service, ServiceKey},
    runtime::{Spawner, sleep, timeout},
};
use async_channel::{Receiver, Sender};
use futures::future::{Either, select};
use futures::lock::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

struct MonitorEntry {
    service_name: String,
    machine: Arc<Mutex<HealthStateMachine>>,
    // Dropping the sender closes the channel and stops the probe tasks
    _stop: Sender<()>,
}

/// Runs probes for every monitored service and tracks their health
pub struct HealthMonitoringManager {
    runner: Arc<dyn ProbeRunner>,
    spawner: Arc<dyn Spawner>,
    notifier: Notifier,
    monitors: Arc<Mutex<HashMap<ServiceKey, MonitorEntry>>>,
}

impl HealthMonitoringManager {
    /// Create a manager that evaluates probes with `runner`
    pub fn new(runner: Arc<dyn ProbeRunner>, spawner: Arc<dyn Spawner>, notifier: Notifier) -> Self {
        Self {
            runner,
            spawner,
            notifier,
            monitors: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Evaluate one probe immediately, bounded by its timeout
    pub async fn execute_probe(&self, service: &Service, probe: &Probe) -> ProbeOutcome {
        evaluate(self.runner.as_ref(), service, probe).await
    }

    /// Start (or refresh) monitoring for an observed service
    pub async fn start_monitoring(&self, service: &Service) -> Result<()> {
        let key = service.key();
        if !service.config.has_probes() {
            debug!("No probes configured for service '{}'", service.service_name);
            return Ok(());
        }

        let mut monitors = self.monitors.lock().await;
        let existing = monitors.get(&key).map(|entry| entry.machine.clone());
        if let Some(existing) = existing {
            let mut machine = existing.lock().await;
            if !machine.probes_differ(&service.config) {
                return Ok(());
            }
            let transition = machine.update_probes(&service.config);
            drop(machine);

            info!(
                "Probe definitions for '{}' changed; restarting health monitoring",
                service.service_name
            );
            monitors.remove(&key);
            if let Some(health) = transition {
                self.notifier
                    .emit(Notification::HealthChanged {
                        service_name: service.service_name.clone(),
                        health,
                    })
                    .await;
            }
        }

        let machine = Arc::new(Mutex::new(HealthStateMachine::new(&service.config)));
        let (stop_tx, stop_rx) = async_channel::bounded::<()>(1);

        for (kind, probe) in service.config.probes() {
            let task = probe_loop(
                kind,
                probe.clone(),
                service.clone(),
                machine.clone(),
                self.runner.clone(),
                self.notifier.clone(),
                stop_rx.clone(),
            );
            self.spawner.spawn(Box::pin(task));
        }

        info!(
            "Health monitoring started for service '{}' ({} probes)",
            service.service_name,
            service.config.probes().len()
        );
        monitors.insert(
            key,
            MonitorEntry {
                service_name: service.service_name.clone(),
                machine,
                _stop: stop_tx,
            },
        );
        Ok(())
    }

    /// Stop monitoring a service; its health becomes `Unknown`
    pub async fn stop_monitoring(&self, key: &ServiceKey) {
        let entry = self.monitors.lock().await.remove(key);
        let Some(entry) = entry else {
            return;
        };

        info!("Stopping health monitoring for service '{}'", entry.service_name);
        let transition = entry.machine.lock().await.stop();
        if let Some(health) = transition {
            self.notifier
                .emit(Notification::HealthChanged {
                    service_name: entry.service_name.clone(),
                    health,
                })
                .await;
        }
    }

    /// Stop every monitor
    pub async fn stop_all(&self) {
        let keys: Vec<ServiceKey> = self.monitors.lock().await.keys().cloned().collect();
        for key in keys {
            self.stop_monitoring(&key).await;
        }
    }

    /// Current health of a monitored service
    pub async fn health(&self, key: &ServiceKey) -> Option<HealthState> {
        let machine = self.monitors.lock().await.get(key)?.machine.clone();
        let health = machine.lock().await.current();
        Some(health)
    }

    /// Whether a service is being monitored
    pub async fn is_monitoring(&self, key: &ServiceKey) -> bool {
        self.monitors.lock().await.contains_key(key)
    }

    /// Keys of all monitored services
    pub async fn monitored(&self) -> Vec<ServiceKey> {
        self.monitors.lock().await.keys().cloned().collect()
    }
}

async fn evaluate(runner: &dyn ProbeRunner, service: &Service, probe: &Probe) -> ProbeOutcome {
    let deadline = probe_timeout(probe);
    let result = timeout("health probe", deadline, async {
        Ok(runner.run_probe(service, probe).await)
    })
    .await;
    match result {
        Ok(outcome) => outcome,
        Err(e) => ProbeOutcome::Failure(e.to_string()),
    }
}

/// Sleep for `duration` unless monitoring stops first; returns false on stop
async fn wait_or_stop(stop: &Receiver<()>, duration: Duration) -> bool {
    let stopped = Box::pin(stop.recv());
    let timer = Box::pin(sleep(duration));
    matches!(select(stopped, timer).await, Either::Right(_))
}

async fn probe_loop(
    kind: ProbeKind,
    probe: Probe,
    service: Service,
    machine: Arc<Mutex<HealthStateMachine>>,
    runner: Arc<dyn ProbeRunner>,
    notifier: Notifier,
    stop: Receiver<()>,
) {
    debug!("{:?} probe task started for '{}'", kind, service.service_name);

    if !wait_or_stop(&stop, Duration::from_secs(probe.initial_delay_seconds)).await {
        return;
    }

    let period = Duration::from_secs(probe.period_seconds.max(1));
    loop {
        if stop.is_closed() {
            break;
        }

        let wanted = machine.lock().await.wants(kind);
        if wanted {
            let outcome = evaluate(runner.as_ref(), &service, &probe).await;
            if let ProbeOutcome::Failure(reason) = &outcome {
                warn!(
                    "{:?} probe failed for '{}': {}",
                    kind, service.service_name, reason
                );
            }

            // A stop that raced the evaluation wins; its Unknown must stay final
            if stop.is_closed() {
                break;
            }
            let transition = machine.lock().await.record(kind, &outcome);
            if let Some(health) = transition {
                info!("Service '{}' is now {}", service.service_name, health);
                notifier
                    .emit(Notification::HealthChanged {
                        service_name: service.service_name.clone(),
                        health,
                    })
                    .await;
            }
        }

        if !wait_or_stop(&stop, period).await {
            break;
        }
    }

    debug!("{:?} probe task stopped for '{}'", kind, service.service_name);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ProbeHandler, ServiceConfig};
    use crate::runtime::ThreadSpawner;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, Ordering};

    struct SwitchRunner {
        healthy: AtomicBool,
    }

    #[async_trait]
    impl ProbeRunner for SwitchRunner {
        async fn run_probe(&self, _service: &Service, _probe: &Probe) -> ProbeOutcome {
            if self.healthy.load(Ordering::SeqCst) {
                ProbeOutcome::Success
            } else {
                ProbeOutcome::Failure("switched off".into())
            }
        }
    }

    fn probed_service() -> Service {
        let probe = Probe {
            period_seconds: 1,
            failure_threshold: 1,
            ..Probe::new(ProbeHandler::Tcp { port: 80 })
        };
        Service::new("1", "10", "api", "api:1").with_config(ServiceConfig {
            liveness_probe: Some(probe),
            ..ServiceConfig::default()
        })
    }

    #[test]
    fn test_monitoring_emits_transitions_once() {
        futures::executor::block_on(async {
            let runner = Arc::new(SwitchRunner {
                healthy: AtomicBool::new(true),
            });
            let notifier = Notifier::new();
            let events = notifier.subscribe().await;
            let manager =
                HealthMonitoringManager::new(runner.clone(), Arc::new(ThreadSpawner), notifier);

            let service = probed_service();
            manager.start_monitoring(&service).await.unwrap();
            // A second start with identical probes is a no-op
            manager.start_monitoring(&service).await.unwrap();

            let first = events.recv().await.unwrap();
            assert_eq!(
                first,
                Notification::HealthChanged {
                    service_name: "api".into(),
                    health: HealthState::Healthy
                }
            );
            assert_eq!(manager.health(&service.key()).await, Some(HealthState::Healthy));

            runner.healthy.store(false, Ordering::SeqCst);
            let second = events.recv().await.unwrap();
            assert_eq!(
                second,
                Notification::HealthChanged {
                    service_name: "api".into(),
                    health: HealthState::Unhealthy
                }
            );

            manager.stop_monitoring(&service.key()).await;
            let last = events.recv().await.unwrap();
            assert_eq!(
                last,
                Notification::HealthChanged {
                    service_name: "api".into(),
                    health: HealthState::Unknown
                }
            );
            assert!(!manager.is_monitoring(&service.key()).await);
            assert_eq!(manager.health(&service.key()).await, None);
        });
    }

    #[test]
    fn test_services_without_probes_are_not_monitored() {
        futures::executor::block_on(async {
            let runner = Arc::new(SwitchRunner {
                healthy: AtomicBool::new(true),
            });
            let manager =
                HealthMonitoringManager::new(runner, Arc::new(ThreadSpawner), Notifier::new());
            let service = Service::new("1", "10", "plain", "plain:1");
            manager.start_monitoring(&service).await.unwrap();
            assert!(!manager.is_monitoring(&service.key()).await);
        });
    }
}
