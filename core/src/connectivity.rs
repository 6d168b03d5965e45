use crate::llm::ConnectivityReport;
use crate::settings::NetworkSettings;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Checking,
    Online,
    Offline,
}

impl HealthStatus {
    fn of(report: &ConnectivityReport) -> Self {
        if report.success {
            Self::Online
        } else {
            Self::Offline
        }
    }
}

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    pub fn advance(&self, by: Duration) {
        *self.now.lock() += to_chrono(by);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock()
    }
}

/// Something that can check reachability of the active model.
#[async_trait]
pub trait Prober: Send + Sync {
    async fn probe(&self) -> ConnectivityReport;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbePolicy {
    pub cooldown: Duration,
    pub penalty: Duration,
}

impl From<&NetworkSettings> for ProbePolicy {
    fn from(network: &NetworkSettings) -> Self {
        Self {
            cooldown: network.cooldown(),
            penalty: network.penalty_delay(),
        }
    }
}

#[derive(Debug)]
struct MonitorState {
    status: HealthStatus,
    cached: Option<ConnectivityReport>,
    last_check: Option<DateTime<Utc>>,
    next_allowed: Option<DateTime<Utc>>,
}

/// Throttled reachability checks. Non-forced checks inside the cooldown window
/// replay the cached report; rate-limited failures stretch the window.
pub struct ConnectivityMonitor {
    prober: Arc<dyn Prober>,
    clock: Arc<dyn Clock>,
    policy: ProbePolicy,
    state: Mutex<MonitorState>,
}

impl ConnectivityMonitor {
    pub fn new(prober: Arc<dyn Prober>, clock: Arc<dyn Clock>, policy: ProbePolicy) -> Self {
        Self {
            prober,
            clock,
            policy,
            state: Mutex::new(MonitorState {
                status: HealthStatus::Checking,
                cached: None,
                last_check: None,
                next_allowed: None,
            }),
        }
    }

    pub fn with_system_clock(prober: Arc<dyn Prober>, policy: ProbePolicy) -> Self {
        Self::new(prober, Arc::new(SystemClock), policy)
    }

    pub fn status(&self) -> HealthStatus {
        self.state.lock().status
    }

    pub fn last_report(&self) -> Option<ConnectivityReport> {
        self.state.lock().cached.clone()
    }

    pub fn last_check(&self) -> Option<DateTime<Utc>> {
        self.state.lock().last_check
    }

    pub fn next_allowed_probe(&self) -> Option<DateTime<Utc>> {
        self.state.lock().next_allowed
    }

    pub async fn check(&self, force: bool) -> ConnectivityReport {
        let now = self.clock.now();
        {
            let mut state = self.state.lock();
            let throttled = state.next_allowed.is_some_and(|allowed| now < allowed);
            if !force && throttled {
                if let Some(cached) = state.cached.clone() {
                    state.status = HealthStatus::of(&cached);
                    return ConnectivityReport {
                        timestamp: now,
                        ..cached
                    };
                }
            }
            state.status = HealthStatus::Checking;
        }

        let report = self.prober.probe().await;
        let finished = self.clock.now();
        let delay = if report.is_rate_limited() {
            tracing::warn!(
                penalty_secs = self.policy.penalty.as_secs(),
                "provider is rate limiting probes; backing off"
            );
            self.policy.penalty
        } else {
            self.policy.cooldown
        };

        let mut state = self.state.lock();
        state.status = HealthStatus::of(&report);
        state.last_check = Some(finished);
        state.next_allowed = Some(finished + to_chrono(delay));
        state.cached = Some(report.clone());
        report
    }

    /// Background task that runs a non-forced check every `interval`.
    pub fn spawn_polling(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let monitor = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let report = monitor.check(false).await;
                tracing::debug!(success = report.success, message = %report.message, "poll");
            }
        })
    }
}

fn to_chrono(duration: Duration) -> chrono::Duration {
    chrono::Duration::milliseconds(i64::try_from(duration.as_millis()).unwrap_or(i64::MAX / 1000))
}
