use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthCheckResponse {
    pub status: HealthStatus,
    pub timestamp: DateTime<Utc>,
    pub checks: HashMap<String, ServiceHealth>,
    pub consumers: HashMap<String, ConsumerHealth>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceHealth {
    pub status: HealthStatus,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_time_ms: Option<u64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ServiceHealth {
    pub fn healthy(response_time_ms: u64) -> Self {
        Self {
            status: HealthStatus::Healthy,
            response_time_ms: Some(response_time_ms),
            error: None,
        }
    }

    pub fn unhealthy(error: String) -> Self {
        Self {
            status: HealthStatus::Unhealthy,
            response_time_ms: None,
            error: Some(error),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", tag = "state", content = "detail")]
pub enum LoopState {
    Starting,
    Running,
    Reconnecting,
    Stopped,
    Failed(String),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DispatchStatsSnapshot {
    pub acked: u64,
    pub duplicates: u64,
    pub retried: u64,
    pub rejected: u64,
    pub dead_lettered: u64,
    pub poison: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsumerHealth {
    pub status: HealthStatus,
    pub state: LoopState,
    pub stats: DispatchStatsSnapshot,
}

impl ConsumerHealth {
    pub fn new(state: LoopState, stats: DispatchStatsSnapshot) -> Self {
        let status = match state {
            LoopState::Running | LoopState::Stopped => HealthStatus::Healthy,
            LoopState::Starting | LoopState::Reconnecting => HealthStatus::Degraded,
            LoopState::Failed(_) => HealthStatus::Unhealthy,
        };

        Self {
            status,
            state,
            stats,
        }
    }
}
