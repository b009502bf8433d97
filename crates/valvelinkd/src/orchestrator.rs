//! Orchestrator — linear boot sequence wiring the Error Manager, the
//! three queues, the Command Router, Security1, and both transports.
//!
//! Boot order (spec §4.7): error manager, then the queues, then the
//! router task, then Security1, then BLE, then MQTT — MQTT itself blocks
//! on a network-up signal (modeled as a `tokio::sync::watch` channel,
//! since WiFi station management is an external collaborator) before
//! connecting.

use std::sync::Arc;

use tokio::sync::{broadcast, mpsc, watch};
use tracing::info;
use valvelink_core::config::ValvelinkConfig;
use valvelink_core::error::ErrorComponent;
use valvelink_core::message::{Frame, RespFrame};
use valvelink_services::{ChunkManager, ChunkManagerConfig, CommandRouter, ErrorManager, Security1Session};

use crate::dispatch::{spawn_router_task, COMMAND_QUEUE_DEPTH, RESPONSE_QUEUE_DEPTH};
use crate::transport_ble::{BleRadio, BleTransport};
use crate::transport_mqtt::{MqttBroker, MqttTopics, MqttTransport};

/// Signaled once the platform's WiFi station connects. BLE boots
/// regardless; MQTT waits on this before its first connect attempt.
///
/// Backed by a `watch` channel rather than a `Notify`: the state
/// ("is the network up") must be observable by a waiter that starts
/// after `mark_up()` already fired, which a bare `Notify` doesn't
/// guarantee.
#[derive(Clone)]
pub struct NetworkUpSignal {
    tx: Arc<watch::Sender<bool>>,
    rx: watch::Receiver<bool>,
}

impl NetworkUpSignal {
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(false);
        Self { tx: Arc::new(tx), rx }
    }

    pub fn mark_up(&self) {
        let _ = self.tx.send(true);
    }

    pub async fn wait(&self) {
        let mut rx = self.rx.clone();
        if *rx.borrow() {
            return;
        }
        let _ = rx.changed().await;
    }
}

pub struct Orchestrator<BR: BleRadio + 'static, MB: MqttBroker + 'static> {
    pub error_manager: Arc<ErrorManager>,
    pub chunk_manager: Arc<ChunkManager>,
    pub ble_security1: Arc<Security1Session>,
    pub mqtt_security1: Arc<Security1Session>,
    pub ble: Arc<BleTransport<BR>>,
    pub mqtt: Arc<MqttTransport<MB>>,
    pub cmd_tx: mpsc::Sender<Frame>,
    pub network_up: NetworkUpSignal,
    shutdown_tx: broadcast::Sender<()>,
    router_task: tokio::task::JoinHandle<()>,
}

impl<BR: BleRadio + 'static, MB: MqttBroker + 'static> Orchestrator<BR, MB> {
    /// Returns the orchestrator plus the two response receivers, which the
    /// caller hands to each transport's own driving task (the actual radio
    /// I/O loop, external to this crate).
    pub fn boot(
        config: &ValvelinkConfig,
        ble_radio: Arc<BR>,
        mqtt_broker: Arc<MB>,
        secure: bool,
    ) -> (Self, ResponseHandles) {
        let error_manager = Arc::new(ErrorManager::new());
        for component in ErrorComponent::ALL {
            error_manager.register(component, config.recovery.clone(), None);
        }
        info!("error manager initialized, {} components registered", ErrorComponent::ALL.len());

        let chunk_manager = Arc::new(ChunkManager::new(ChunkManagerConfig {
            max_chunk_size: config.ble.initial_mtu as usize,
            max_concurrent_frames: config.ble.max_concurrent_frames as usize,
            reassembly_timeout_ms: config.ble.reassembly_timeout_ms as u64,
        }));

        let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_QUEUE_DEPTH);
        let (ble_resp_tx, ble_resp_rx) = mpsc::channel(RESPONSE_QUEUE_DEPTH);
        let (mqtt_resp_tx, mqtt_resp_rx) = mpsc::channel(RESPONSE_QUEUE_DEPTH);
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);

        let mut router = CommandRouter::new();
        router.register("echo", Box::new(valvelink_services::router::EchoHandler));
        router.register("status", Box::new(valvelink_services::router::StatusHandler));
        let router = Arc::new(router);

        let router_task = spawn_router_task(router, cmd_rx, ble_resp_tx, mqtt_resp_tx, shutdown_rx);
        info!("command router task started");

        let ble_security1 = Arc::new(Security1Session::new());
        let mqtt_security1 = Arc::new(Security1Session::new());
        info!("security1 sessions initialized");

        let ble = Arc::new(BleTransport::new(ble_radio, chunk_manager.clone()));
        ble.start().expect("ble advertising failed to start at boot");
        info!(device_name = %config.device.ble_name, "ble transport started");

        let topics = MqttTopics::from_prefix(&config.mqtt.topic_prefix);
        let mqtt = Arc::new(MqttTransport::new(
            mqtt_broker,
            topics,
            secure,
            config.backoff.min_ms as u64,
            config.backoff.max_ms as u64,
        ));
        info!(broker = %config.mqtt.broker_uri, "mqtt transport initialized, awaiting network-up");

        let orchestrator = Self {
            error_manager,
            chunk_manager,
            ble_security1,
            mqtt_security1,
            ble,
            mqtt,
            cmd_tx,
            network_up: NetworkUpSignal::new(),
            shutdown_tx,
            router_task,
        };
        (
            orchestrator,
            ResponseHandles {
                ble_resp_rx,
                mqtt_resp_rx,
            },
        )
    }

    /// Block until WiFi reports station-up, then connect MQTT.
    pub async fn start_mqtt_when_network_up(&self) {
        self.network_up.wait().await;
        if let Err(e) = self.mqtt.connect() {
            tracing::warn!(?e, "initial mqtt connect failed");
        }
    }

    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(());
        let _ = self.router_task.await;
    }
}

pub struct ResponseHandles {
    pub ble_resp_rx: mpsc::Receiver<RespFrame>,
    pub mqtt_resp_rx: mpsc::Receiver<RespFrame>,
}
