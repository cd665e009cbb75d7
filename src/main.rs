use std::collections::HashMap;

use anyhow::{Error, Result, anyhow};
use appointment_notifier::{
    api::run_api_server, clients::database::DatabaseClient, config::Config,
    consumer::QueueConsumer, utils::retry_with_backoff,
};
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

fn init_tracing(config: &Config) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);

    if config.log_format == "pretty" {
        builder.init();
    } else {
        builder.json().init();
    }
}

#[tokio::main]
async fn main() -> Result<(), Error> {
    let config = Config::load()?;
    init_tracing(&config);

    let queues = config.queues()?;
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let mut statuses = HashMap::new();
    let mut handles = Vec::new();

    for queue in queues {
        let store = retry_with_backoff(&config.connect_retry_config(), "postgres", || {
            DatabaseClient::connect(&config.database_url)
        })
        .await
        .map_err(|e| anyhow!("Database unavailable for {} consumer: {}", queue, e))?;

        let consumer = QueueConsumer::new(config.clone(), queue, store);
        statuses.insert(queue, consumer.status());
        handles.push((queue, consumer.start(shutdown_rx.clone())));
    }

    let api = tokio::spawn(run_api_server(
        config.clone(),
        statuses,
        shutdown_rx.clone(),
    ));

    info!(consumers = handles.len(), "Notification consumers started");

    tokio::signal::ctrl_c().await?;
    info!("Shutdown requested, draining in-flight messages");
    let _ = shutdown_tx.send(true);

    let mut failed = false;
    for (queue, handle) in handles {
        match handle.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                error!(queue = %queue, error = %e, "Consumer exited with error");
                failed = true;
            }
            Err(e) => {
                error!(queue = %queue, error = %e, "Consumer task panicked");
                failed = true;
            }
        }
    }

    if let Err(e) = api.await? {
        error!(error = %e, "Health server failed");
    }

    if failed {
        return Err(anyhow!("One or more consumers failed"));
    }

    info!("Shutdown complete");
    Ok(())
}
