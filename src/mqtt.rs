//! MQTT client loop feeding the dispatcher.
//!
//! The broker is external. We subscribe to the state pattern and the alarm
//! pattern derived from the topic template, and hand every publish to the
//! dispatcher in arrival order. Subscriptions are renewed on each ConnAck so
//! a broker restart does not silently stop the bridge.

use std::sync::Arc;
use std::time::Duration;

use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Packet, QoS};
use tokio::task::JoinHandle;

use crate::config::BridgeConfig;
use crate::dispatcher::Dispatcher;

const RECONNECT_DELAY: Duration = Duration::from_secs(5);

/// Client options for the configured broker.
pub fn options(config: &BridgeConfig) -> MqttOptions {
    let mqtt = &config.mqtt;
    let mut options = MqttOptions::new(mqtt.client_id.clone(), mqtt.host.clone(), mqtt.port);
    options.set_keep_alive(Duration::from_secs(mqtt.keep_alive_secs.max(5)));
    if let (Some(user), Some(password)) = (&mqtt.username, &mqtt.password) {
        options.set_credentials(user.clone(), password.clone());
    }
    options
}

/// Topics the bridge listens on.
pub fn subscriptions(dispatcher: &Dispatcher) -> [String; 2] {
    let resolver = dispatcher.resolver();
    [
        resolver.state_pattern().to_string(),
        resolver.alarm_pattern().to_string(),
    ]
}

/// Connect and spawn the event loop task.
pub fn start(config: &BridgeConfig, dispatcher: Arc<Dispatcher>) -> (AsyncClient, JoinHandle<()>) {
    let resolver = dispatcher.resolver();
    if !resolver.has_placeholder() {
        tracing::warn!(
            "topic_template '{}' has no '{}' segment: every device is named after the last topic segment",
            resolver.template(),
            resolver.placeholder()
        );
    }

    let (client, eventloop) = AsyncClient::new(options(config), 64);
    let qos = config.qos();
    tracing::info!(
        "MQTT connecting to {}:{} as {}",
        config.mqtt.host,
        config.mqtt.port,
        config.mqtt.client_id
    );

    let handle = tokio::spawn(run(client.clone(), eventloop, dispatcher, qos));
    (client, handle)
}

async fn run(client: AsyncClient, mut eventloop: EventLoop, dispatcher: Arc<Dispatcher>, qos: QoS) {
    let topics = subscriptions(&dispatcher);
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                for topic in &topics {
                    // try_subscribe: awaiting here would block the loop that
                    // drains the request channel
                    match client.try_subscribe(topic.clone(), qos) {
                        Ok(()) => tracing::info!("MQTT subscribed to {}", topic),
                        Err(e) => tracing::error!("MQTT subscribe {} failed: {}", topic, e),
                    }
                }
            }
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                tracing::trace!("MQTT <- {} ({} bytes)", publish.topic, publish.payload.len());
                dispatcher.handle_message(&publish.topic, &publish.payload);
            }
            Ok(Event::Incoming(Packet::Disconnect)) => {
                tracing::warn!("MQTT broker sent disconnect");
            }
            Ok(Event::Outgoing(rumqttc::Outgoing::Disconnect)) => {
                tracing::info!("MQTT disconnected");
                break;
            }
            Ok(_) => {}
            Err(e) => {
                tracing::error!(
                    "MQTT connection error: {}; retrying in {}s",
                    e,
                    RECONNECT_DELAY.as_secs()
                );
                tokio::time::sleep(RECONNECT_DELAY).await;
            }
        }
    }
}

/// Unsubscribe both patterns and disconnect. The event loop task then ends.
pub async fn shutdown(client: &AsyncClient, dispatcher: &Dispatcher) {
    for topic in subscriptions(dispatcher) {
        if let Err(e) = client.unsubscribe(topic.clone()).await {
            tracing::warn!("MQTT unsubscribe {} failed: {}", topic, e);
        }
    }
    if let Err(e) = client.disconnect().await {
        tracing::warn!("MQTT disconnect failed: {}", e);
    }
}
