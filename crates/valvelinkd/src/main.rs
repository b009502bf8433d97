//! valvelinkd — irrigation-valve controller firmware core (host build).
//!
//! Links the transport-agnostic core (`valvelink-core`, `valvelink-services`)
//! against whatever BLE/MQTT stack the target provides. On real hardware
//! that's NimBLE and ESP-MQTT; this host build links placeholder radios
//! that log instead of touching a device, for exercising the boot
//! sequence and command dispatch off-target.

mod backoff;
mod dispatch;
mod orchestrator;
mod transport_ble;
mod transport_mqtt;

use std::sync::Arc;

use anyhow::Result;
use tracing::info;
use valvelink_core::config::ValvelinkConfig;

use orchestrator::Orchestrator;
use transport_ble::{BleIoError, BleRadio};
use transport_mqtt::{MqttBroker, MqttIoError};

struct LoggingBleRadio;

impl BleRadio for LoggingBleRadio {
    fn start_advertising(&self, aggressive: bool) -> Result<(), BleIoError> {
        info!(aggressive, "ble: start advertising");
        Ok(())
    }
    fn stop_advertising(&self) {
        info!("ble: stop advertising");
    }
    fn send_notify(&self, data: &[u8]) -> Result<(), BleIoError> {
        info!(len = data.len(), "ble: notify");
        Ok(())
    }
}

struct LoggingMqttBroker;

impl MqttBroker for LoggingMqttBroker {
    fn connect(&self) -> Result<(), MqttIoError> {
        info!("mqtt: connect");
        Ok(())
    }
    fn subscribe(&self, topic: &str) -> Result<(), MqttIoError> {
        info!(topic, "mqtt: subscribe");
        Ok(())
    }
    fn unsubscribe(&self, topic: &str) {
        info!(topic, "mqtt: unsubscribe");
    }
    fn publish(&self, topic: &str, payload: &[u8]) -> Result<(), MqttIoError> {
        info!(topic, len = payload.len(), "mqtt: publish");
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let config = ValvelinkConfig::load()?;
    info!(device = %config.device.ble_name, "valvelinkd starting");

    let secure = true;
    let (orchestrator, mut responses) = Orchestrator::boot(
        &config,
        Arc::new(LoggingBleRadio),
        Arc::new(LoggingMqttBroker),
        secure,
    );

    let ble_drain = tokio::spawn(async move {
        while let Some(resp) = responses.ble_resp_rx.recv().await {
            info!(id = resp.id, status = resp.status, "ble response ready to send");
        }
    });
    let mqtt_drain = tokio::spawn(async move {
        while let Some(resp) = responses.mqtt_resp_rx.recv().await {
            info!(id = resp.id, status = resp.status, "mqtt response ready to send");
        }
    });

    orchestrator.network_up.mark_up();
    orchestrator.start_mqtt_when_network_up().await;

    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received");
    ble_drain.abort();
    mqtt_drain.abort();
    orchestrator.shutdown().await;

    Ok(())
}
