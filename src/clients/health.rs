use std::{collections::HashMap, sync::Arc, time::Instant};

use chrono::Utc;
use tracing::{debug, warn};

use crate::{
    clients::{database::DatabaseClient, rbmq::BrokerClient},
    config::Config,
    consumer::ConsumerStatus,
    models::{
        event::QueueName,
        health::{ConsumerHealth, HealthCheckResponse, HealthStatus, ServiceHealth},
    },
    store::Store,
};

pub struct HealthChecker {
    config: Config,
    consumers: HashMap<QueueName, Arc<ConsumerStatus>>,
}

impl HealthChecker {
    pub fn new(config: Config, consumers: HashMap<QueueName, Arc<ConsumerStatus>>) -> Self {
        Self { config, consumers }
    }

    pub async fn check_all(&self) -> HealthCheckResponse {
        let mut checks = HashMap::new();

        checks.insert("database".to_string(), self.check_database().await);
        checks.insert("message_broker".to_string(), self.check_rabbitmq().await);

        let consumers = self.check_consumers();
        let status = determine_overall_status(&checks, &consumers);

        HealthCheckResponse {
            status,
            timestamp: Utc::now(),
            checks,
            consumers,
        }
    }

    async fn check_database(&self) -> ServiceHealth {
        let start = Instant::now();

        match DatabaseClient::connect(&self.config.database_url).await {
            Ok(mut client) => match client.health_check().await {
                Ok(_) => {
                    let elapsed = start.elapsed().as_millis() as u64;
                    debug!(response_time_ms = elapsed, "Database health check passed");
                    ServiceHealth::healthy(elapsed)
                }
                Err(e) => {
                    warn!(error = %e, "Database health check failed");
                    ServiceHealth::unhealthy(format!("Health check query failed: {}", e))
                }
            },
            Err(e) => {
                warn!(error = %e, "Database connection failed");
                ServiceHealth::unhealthy(format!("Connection failed: {}", e))
            }
        }
    }

    async fn check_rabbitmq(&self) -> ServiceHealth {
        let start = Instant::now();

        match BrokerClient::connect(&self.config).await {
            Ok(broker) => {
                let elapsed = start.elapsed().as_millis() as u64;
                debug!(response_time_ms = elapsed, "RabbitMQ health check passed");
                broker.close().await;
                ServiceHealth::healthy(elapsed)
            }
            Err(e) => {
                warn!(error = %e, "RabbitMQ connection failed");
                ServiceHealth::unhealthy(format!("Connection failed: {}", e))
            }
        }
    }

    fn check_consumers(&self) -> HashMap<String, ConsumerHealth> {
        self.consumers
            .iter()
            .map(|(queue, status)| {
                (
                    queue.to_string(),
                    ConsumerHealth::new(status.state(), status.stats()),
                )
            })
            .collect()
    }
}

pub fn determine_overall_status(
    checks: &HashMap<String, ServiceHealth>,
    consumers: &HashMap<String, ConsumerHealth>,
) -> HealthStatus {
    let statuses = checks
        .values()
        .map(|health| &health.status)
        .chain(consumers.values().map(|health| &health.status));

    let mut overall = HealthStatus::Healthy;
    for status in statuses {
        match status {
            HealthStatus::Unhealthy => return HealthStatus::Unhealthy,
            HealthStatus::Degraded => overall = HealthStatus::Degraded,
            HealthStatus::Healthy => {}
        }
    }

    overall
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::health::{DispatchStatsSnapshot, LoopState};

    fn consumer(state: LoopState) -> HashMap<String, ConsumerHealth> {
        HashMap::from([(
            "requests".to_string(),
            ConsumerHealth::new(state, DispatchStatsSnapshot::default()),
        )])
    }

    fn healthy_checks() -> HashMap<String, ServiceHealth> {
        HashMap::from([
            ("database".to_string(), ServiceHealth::healthy(3)),
            ("message_broker".to_string(), ServiceHealth::healthy(5)),
        ])
    }

    #[test]
    fn running_consumers_with_reachable_dependencies_are_healthy() {
        assert_eq!(
            determine_overall_status(&healthy_checks(), &consumer(LoopState::Running)),
            HealthStatus::Healthy
        );
    }

    #[test]
    fn reconnecting_consumer_degrades() {
        assert_eq!(
            determine_overall_status(&healthy_checks(), &consumer(LoopState::Reconnecting)),
            HealthStatus::Degraded
        );
    }

    #[test]
    fn failed_consumer_or_dependency_is_unhealthy() {
        assert_eq!(
            determine_overall_status(
                &healthy_checks(),
                &consumer(LoopState::Failed("topology".into()))
            ),
            HealthStatus::Unhealthy
        );

        let mut checks = healthy_checks();
        checks.insert(
            "database".to_string(),
            ServiceHealth::unhealthy("refused".into()),
        );
        assert_eq!(
            determine_overall_status(&checks, &consumer(LoopState::Running)),
            HealthStatus::Unhealthy
        );
    }
}
