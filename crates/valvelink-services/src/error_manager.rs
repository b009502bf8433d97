//! Unified Error & Recovery Manager.
//!
//! A registry of components, each with its own recovery configuration and
//! running counters, fed by `report()` calls from anywhere in the firmware
//! and driving automatic recovery through `recover()`.
//!
//! The registry is a `DashMap` keyed by component, following the same
//! concurrent-registry shape used elsewhere in this workspace for
//! multi-writer lookup tables — callers never hold a manager-wide lock.

use std::collections::VecDeque;
use std::sync::Arc;

use dashmap::DashMap;
use tracing::{debug, error, info, warn};
use valvelink_core::config::RecoveryDefaults;
use valvelink_core::error::{default_strategy, ErrorCategory, ErrorComponent, ErrorSeverity, RecoveryStrategy};

/// Health window for "recent" severities / degraded-component checks.
const HEALTH_WINDOW_MS: u64 = 5 * 60 * 1_000;
const DEGRADED_WINDOW_MS: u64 = 2 * 60 * 1_000;

pub type RecoveryFn = Arc<dyn Fn() -> bool + Send + Sync>;

#[derive(Debug, thiserror::Error)]
pub enum ErrorManagerError {
    #[error("component {0} is not registered")]
    UnknownComponent(ErrorComponent),
    #[error("no recovery callback registered for component {0}")]
    NotSupported(ErrorComponent),
}

/// One error observation, as callers supply it to `report()`.
#[derive(Debug, Clone)]
pub struct ErrorReport {
    pub component: ErrorComponent,
    pub category: ErrorCategory,
    pub severity: ErrorSeverity,
    pub error_code: u32,
    pub underlying_code: u32,
    pub context_data: u32,
    pub description: String,
}

/// What `report()` decided about recovery, handed back so the caller can
/// await `recover()` if `should_attempt` is true.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryDecision {
    Attempt(RecoveryStrategy),
    SkipExhausted,
    SkipCooldown,
    NoStrategy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryOutcome {
    Succeeded,
    Failed,
    NotSupported,
    Escalated(RecoveryStrategy),
}

struct ComponentState {
    config: RecoveryDefaults,
    recovery_fn: Option<RecoveryFn>,
    total_errors: u64,
    category_counts: std::collections::HashMap<ErrorCategory, u64>,
    severity_counts: [u64; 5],
    recovery_attempts: u64,
    recovery_successes: u64,
    consecutive_failures: u32,
    last_error_ts_ms: u64,
    last_error_code: u32,
    last_recovery_ts_ms: Option<u64>,
    recent_severities: VecDeque<(u64, ErrorSeverity)>,
    last_critical_ts_ms: Option<u64>,
}

impl ComponentState {
    fn new(config: RecoveryDefaults) -> Self {
        Self {
            config,
            recovery_fn: None,
            total_errors: 0,
            category_counts: std::collections::HashMap::new(),
            severity_counts: [0; 5],
            recovery_attempts: 0,
            recovery_successes: 0,
            consecutive_failures: 0,
            last_error_ts_ms: 0,
            last_error_code: 0,
            last_recovery_ts_ms: None,
            recent_severities: VecDeque::new(),
            last_critical_ts_ms: None,
        }
    }

    fn prune(&mut self, now_ms: u64) {
        while let Some((ts, _)) = self.recent_severities.front() {
            if now_ms.saturating_sub(*ts) > HEALTH_WINDOW_MS {
                self.recent_severities.pop_front();
            } else {
                break;
            }
        }
    }
}

pub struct ErrorManager {
    components: DashMap<ErrorComponent, ComponentState>,
}

impl Default for ErrorManager {
    fn default() -> Self {
        Self::new()
    }
}

impl ErrorManager {
    pub fn new() -> Self {
        Self {
            components: DashMap::new(),
        }
    }

    /// Register a component with its recovery configuration and optional
    /// recovery callback. Safe to call again to replace the callback.
    pub fn register(
        &self,
        component: ErrorComponent,
        config: RecoveryDefaults,
        recovery_fn: Option<RecoveryFn>,
    ) {
        let mut state = ComponentState::new(config);
        state.recovery_fn = recovery_fn;
        self.components.insert(component, state);
        debug!(%component, "error manager: component registered");
    }

    /// Ingest an error report, update counters, log, and decide whether
    /// recovery should be attempted. Registers the component with default
    /// configuration on first report if it was never explicitly registered.
    pub fn report(&self, now_ms: u64, report: ErrorReport) -> RecoveryDecision {
        let mut entry = self
            .components
            .entry(report.component)
            .or_insert_with(|| ComponentState::new(RecoveryDefaults::default()));

        entry.total_errors += 1;
        *entry.category_counts.entry(report.category).or_insert(0) += 1;
        entry.severity_counts[report.severity as usize] += 1;
        entry.last_error_ts_ms = now_ms;
        entry.last_error_code = report.error_code;
        entry.recent_severities.push_back((now_ms, report.severity));
        if report.severity >= ErrorSeverity::Critical {
            entry.last_critical_ts_ms = Some(now_ms);
        }
        entry.prune(now_ms);
        entry.consecutive_failures += 1;

        log_report(&report);

        let strategy = default_strategy(report.category, report.severity);
        if strategy == RecoveryStrategy::None {
            return RecoveryDecision::NoStrategy;
        }

        let cfg = entry.config.clone();
        let decision = if report.severity >= ErrorSeverity::Critical {
            RecoveryDecision::Attempt(strategy)
        } else if entry.consecutive_failures >= cfg.max_consecutive_errors {
            RecoveryDecision::SkipExhausted
        } else if entry
            .last_recovery_ts_ms
            .is_some_and(|last| now_ms.saturating_sub(last) < cfg.recovery_cooldown_ms as u64)
        {
            RecoveryDecision::SkipCooldown
        } else if !cfg.auto_recovery_enabled {
            RecoveryDecision::NoStrategy
        } else {
            RecoveryDecision::Attempt(strategy)
        };

        decision
    }

    /// Execute a recovery strategy for `component`. Escalates on failure
    /// when the component's config requests it, capped one step below
    /// `SystemRestart` to avoid reboot loops.
    pub async fn recover(
        &self,
        now_ms: u64,
        component: ErrorComponent,
        strategy: RecoveryStrategy,
    ) -> Result<RecoveryOutcome, ErrorManagerError> {
        let (escalate, retry_delay_ms, recovery_fn) = {
            let mut entry = self
                .components
                .get_mut(&component)
                .ok_or(ErrorManagerError::UnknownComponent(component))?;
            entry.recovery_attempts += 1;
            entry.last_recovery_ts_ms = Some(now_ms);
            (
                entry.config.escalate_on_failure,
                entry.config.retry_delay_ms,
                entry.recovery_fn.clone(),
            )
        };

        let success = execute_strategy(strategy, retry_delay_ms, recovery_fn.as_ref()).await?;

        let mut entry = self
            .components
            .get_mut(&component)
            .ok_or(ErrorManagerError::UnknownComponent(component))?;

        if success {
            entry.recovery_successes += 1;
            entry.consecutive_failures = 0;
            info!(%component, %strategy, "recovery succeeded");
            return Ok(RecoveryOutcome::Succeeded);
        }

        warn!(%component, %strategy, "recovery failed");

        if escalate {
            if let Some(next) = escalate_strategy(strategy) {
                return Ok(RecoveryOutcome::Escalated(next));
            }
        }
        Ok(RecoveryOutcome::Failed)
    }

    /// Max recent severity within the health window across all
    /// components, or `Warning` if any component has exhausted its
    /// consecutive-error threshold.
    pub fn system_health(&self, now_ms: u64) -> ErrorSeverity {
        let mut worst = ErrorSeverity::Info;
        let mut any_exhausted = false;
        for mut entry in self.components.iter_mut() {
            entry.prune(now_ms);
            if let Some((_, sev)) = entry.recent_severities.iter().max_by_key(|(_, s)| *s) {
                if *sev > worst {
                    worst = *sev;
                }
            }
            if entry.consecutive_failures >= entry.config.max_consecutive_errors {
                any_exhausted = true;
            }
        }
        if any_exhausted && worst < ErrorSeverity::Warning {
            ErrorSeverity::Warning
        } else {
            worst
        }
    }

    /// A component is degraded if it had a critical/fatal error in the
    /// last two minutes, or its consecutive failures are at least half
    /// its configured maximum.
    pub fn is_degraded(&self, now_ms: u64, component: ErrorComponent) -> bool {
        let Some(entry) = self.components.get(&component) else {
            return false;
        };
        let recent_critical = entry
            .last_critical_ts_ms
            .is_some_and(|ts| now_ms.saturating_sub(ts) <= DEGRADED_WINDOW_MS);
        let half_exhausted = entry.consecutive_failures * 2 >= entry.config.max_consecutive_errors;
        recent_critical || half_exhausted
    }

    pub fn time_since_last_critical_error(
        &self,
        now_ms: u64,
        component: ErrorComponent,
    ) -> Option<u64> {
        self.components
            .get(&component)
            .and_then(|e| e.last_critical_ts_ms)
            .map(|ts| now_ms.saturating_sub(ts))
    }

    pub fn consecutive_failures(&self, component: ErrorComponent) -> u32 {
        self.components
            .get(&component)
            .map(|e| e.consecutive_failures)
            .unwrap_or(0)
    }
}

fn log_report(report: &ErrorReport) {
    let component = report.component;
    let category = report.category;
    let error_code = report.error_code;
    match report.severity {
        ErrorSeverity::Info => info!(%component, %category, error_code, "{}", report.description),
        ErrorSeverity::Warning => warn!(%component, %category, error_code, "{}", report.description),
        ErrorSeverity::Error | ErrorSeverity::Critical | ErrorSeverity::Fatal => {
            error!(%component, %category, error_code, "{}", report.description)
        }
    }
}

async fn execute_strategy(
    strategy: RecoveryStrategy,
    retry_delay_ms: u32,
    recovery_fn: Option<&RecoveryFn>,
) -> Result<bool, ErrorManagerError> {
    match strategy {
        RecoveryStrategy::None => Ok(true),
        RecoveryStrategy::Retry => {
            tokio::time::sleep(std::time::Duration::from_millis(retry_delay_ms as u64)).await;
            Ok(true)
        }
        RecoveryStrategy::ResetState
        | RecoveryStrategy::RestartComponent
        | RecoveryStrategy::RestartService
        | RecoveryStrategy::Custom => match recovery_fn {
            Some(f) => Ok(f()),
            None => Ok(false),
        },
        // Reported only — never actually executed, to avoid firmware
        // reboot loops driven purely by error-manager policy.
        RecoveryStrategy::SystemRestart => {
            warn!("system restart requested by recovery policy (not executed)");
            Ok(true)
        }
    }
}

fn escalate_strategy(current: RecoveryStrategy) -> Option<RecoveryStrategy> {
    match current {
        RecoveryStrategy::None => Some(RecoveryStrategy::Retry),
        RecoveryStrategy::Retry => Some(RecoveryStrategy::ResetState),
        RecoveryStrategy::ResetState => Some(RecoveryStrategy::RestartComponent),
        RecoveryStrategy::RestartComponent => Some(RecoveryStrategy::RestartService),
        // Capped below SystemRestart — escalation never reboots the device.
        RecoveryStrategy::RestartService => None,
        RecoveryStrategy::SystemRestart => None,
        RecoveryStrategy::Custom => None,
    }
}
