//! Bridge wiring: builds the dispatcher and its sinks, then runs the MQTT loop

use anyhow::Result;
use localizer_core::{Dispatcher, FamilyClassifier, SensorRegistry};
use std::sync::Arc;
use tracing::{info, warn};

use crate::config::Config;
use crate::influx::InfluxSink;
use crate::mqtt::{self, MqttSink};

/// Run until Ctrl-C or SIGTERM
pub async fn run(config: Config) -> Result<()> {
    let registry = Arc::new(SensorRegistry::new(config.sensors.clone()));
    if registry.is_empty() {
        warn!("No sensors configured, incoming readings will be ignored");
    }

    let (client, eventloop) = mqtt::connect(&config.mqtt);

    let classifier = FamilyClassifier::new(config.classifier.family_prefix.clone());
    info!(
        sensors = registry.len(),
        family = %classifier.prefix(),
        "Sensor registry loaded"
    );

    let mut dispatcher = Dispatcher::new(registry, classifier, config.dispatcher_config());

    if config.mqtt.republish {
        dispatcher = dispatcher.with_message_sink(Arc::new(MqttSink::new(client.clone())));
    }

    if let Some(influx) = &config.influx {
        dispatcher = dispatcher.with_storage_sink(Arc::new(InfluxSink::new(influx)?));
        info!(
            url = %influx.url,
            bucket = %influx.bucket,
            measurement = %influx.measurement,
            "InfluxDB sink enabled"
        );
    }

    info!(
        broker = %format!("{}:{}", config.mqtt.host, config.mqtt.port),
        subscribe = %config.mqtt.subscribe_topic,
        publish_base = %config.mqtt.publish_topic_base,
        republish = config.mqtt.republish,
        "Starting bridge"
    );

    mqtt::run(
        client,
        eventloop,
        &config.mqtt.subscribe_topic,
        Arc::new(dispatcher),
        shutdown_signal(),
    )
    .await?;

    info!("Bridge stopped");
    Ok(())
}

/// Resolves on Ctrl-C or, on unix, SIGTERM
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
