//! Unified error taxonomy shared by every component reporting into the
//! Error Manager: which component failed, what kind of failure it was, how
//! severe it was, and what recovery strategy applies.
//!
//! Variant sets mirror the component registry one to one; only the naming
//! is made Rust-idiomatic (`CamelCase` instead of `ERROR_CATEGORY_SHOUTING`).

use std::fmt;

/// Registered components, indexed for the Error Manager's per-component
/// counters. `Codec` covers both the legacy binary and MQTT JSON shapes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u8)]
pub enum ErrorComponent {
    System = 0,
    BleTransport,
    MqttTransport,
    CmdProcessor,
    ChunkManager,
    Wifi,
    Solenoid,
    Schedule,
    Codec,
}

impl ErrorComponent {
    pub const ALL: [ErrorComponent; 9] = [
        ErrorComponent::System,
        ErrorComponent::BleTransport,
        ErrorComponent::MqttTransport,
        ErrorComponent::CmdProcessor,
        ErrorComponent::ChunkManager,
        ErrorComponent::Wifi,
        ErrorComponent::Solenoid,
        ErrorComponent::Schedule,
        ErrorComponent::Codec,
    ];
}

impl fmt::Display for ErrorComponent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorComponent::System => "system",
            ErrorComponent::BleTransport => "ble_transport",
            ErrorComponent::MqttTransport => "mqtt_transport",
            ErrorComponent::CmdProcessor => "cmd_processor",
            ErrorComponent::ChunkManager => "chunk_manager",
            ErrorComponent::Wifi => "wifi",
            ErrorComponent::Solenoid => "solenoid",
            ErrorComponent::Schedule => "schedule",
            ErrorComponent::Codec => "codec",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ErrorCategory {
    None = 0,
    Connection,
    Communication,
    Protocol,
    Resource,
    Memory,
    Queue,
    Processing,
    Validation,
    Timeout,
    Hardware,
    System,
    Configuration,
    Recovery,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorCategory::None => "none",
            ErrorCategory::Connection => "connection",
            ErrorCategory::Communication => "communication",
            ErrorCategory::Protocol => "protocol",
            ErrorCategory::Resource => "resource",
            ErrorCategory::Memory => "memory",
            ErrorCategory::Queue => "queue",
            ErrorCategory::Processing => "processing",
            ErrorCategory::Validation => "validation",
            ErrorCategory::Timeout => "timeout",
            ErrorCategory::Hardware => "hardware",
            ErrorCategory::System => "system",
            ErrorCategory::Configuration => "configuration",
            ErrorCategory::Recovery => "recovery",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum ErrorSeverity {
    Info = 0,
    Warning,
    Error,
    Critical,
    Fatal,
}

impl fmt::Display for ErrorSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorSeverity::Info => "info",
            ErrorSeverity::Warning => "warning",
            ErrorSeverity::Error => "error",
            ErrorSeverity::Critical => "critical",
            ErrorSeverity::Fatal => "fatal",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum RecoveryStrategy {
    None = 0,
    Retry,
    ResetState,
    RestartComponent,
    RestartService,
    SystemRestart,
    Custom,
}

impl fmt::Display for RecoveryStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RecoveryStrategy::None => "none",
            RecoveryStrategy::Retry => "retry",
            RecoveryStrategy::ResetState => "reset_state",
            RecoveryStrategy::RestartComponent => "restart_component",
            RecoveryStrategy::RestartService => "restart_service",
            RecoveryStrategy::SystemRestart => "system_restart",
            RecoveryStrategy::Custom => "custom",
        };
        f.write_str(name)
    }
}

/// Default strategy for a (category, severity) pair, per the reference
/// policy table. Non-critical categories not listed explicitly fall
/// through to `None`.
pub fn default_strategy(category: ErrorCategory, severity: ErrorSeverity) -> RecoveryStrategy {
    use ErrorCategory::*;
    use ErrorSeverity::*;

    if severity >= Critical {
        return match category {
            Connection | Communication => RecoveryStrategy::RestartComponent,
            Memory | Resource => RecoveryStrategy::ResetState,
            Hardware | System => RecoveryStrategy::SystemRestart,
            _ => RecoveryStrategy::ResetState,
        };
    }

    match category {
        Connection | Communication | Timeout => RecoveryStrategy::Retry,
        Memory | Resource | Queue => RecoveryStrategy::Retry,
        Protocol | Validation => RecoveryStrategy::ResetState,
        Configuration => RecoveryStrategy::None,
        _ => RecoveryStrategy::None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn critical_connection_restarts_component() {
        assert_eq!(
            default_strategy(ErrorCategory::Connection, ErrorSeverity::Critical),
            RecoveryStrategy::RestartComponent
        );
    }

    #[test]
    fn critical_hardware_triggers_system_restart() {
        assert_eq!(
            default_strategy(ErrorCategory::Hardware, ErrorSeverity::Fatal),
            RecoveryStrategy::SystemRestart
        );
    }

    #[test]
    fn non_critical_timeout_retries() {
        assert_eq!(
            default_strategy(ErrorCategory::Timeout, ErrorSeverity::Warning),
            RecoveryStrategy::Retry
        );
    }

    #[test]
    fn configuration_errors_have_no_automatic_recovery() {
        assert_eq!(
            default_strategy(ErrorCategory::Configuration, ErrorSeverity::Error),
            RecoveryStrategy::None
        );
    }

    #[test]
    fn severity_ordering_treats_fatal_as_worst() {
        assert!(ErrorSeverity::Fatal > ErrorSeverity::Critical);
        assert!(ErrorSeverity::Critical > ErrorSeverity::Error);
    }
}
