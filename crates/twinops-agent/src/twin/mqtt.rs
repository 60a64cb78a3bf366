//! MQTT shadow feed.
//!
//! Subscribes to the shell's update topics and applies deliveries to the
//! shadow twin. Every (re)connection triggers a fresh HTTP snapshot
//! before incremental updates resume, so events missed while
//! disconnected cannot leave the shadow stale.

use std::sync::Arc;
use std::time::Duration;

use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use tracing::{debug, info, warn};
use twinops_core::shadow::topics::{parse_payload, parse_topic, subscription_filter};
use twinops_core::shadow::ShadowTwin;

use super::TwinClient;
use crate::config::Settings;

/// Interval between reconnect attempts after a connection error.
const RECONNECT_DELAY: Duration = Duration::from_secs(5);

/// Runs the shadow feed until the process shuts down.
///
/// Spawn this on its own task; it owns the MQTT event loop.
pub async fn run_shadow_feed(
    settings: Settings,
    shadow: Arc<ShadowTwin>,
    client: Arc<TwinClient>,
    tracked_submodels: Vec<String>,
) {
    let mut options = MqttOptions::new(
        settings.mqtt_client_id.clone(),
        settings.mqtt_broker_host.clone(),
        settings.mqtt_broker_port,
    );
    options.set_keep_alive(Duration::from_secs(30));
    // Resume the session where the broker supports it; the snapshot on
    // reconnect covers the rest.
    options.set_clean_session(false);
    if let (Some(user), Some(pass)) = (&settings.mqtt_username, &settings.mqtt_password) {
        options.set_credentials(user.clone(), pass.clone());
    }

    let (mqtt, mut event_loop) = AsyncClient::new(options, 64);
    let filter = subscription_filter(&settings.repo_id, &settings.aas_id);

    loop {
        match event_loop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                info!(filter = %filter, "mqtt connected, subscribing and reseeding shadow");
                if let Err(err) = mqtt.subscribe(filter.clone(), QoS::AtLeastOnce).await {
                    warn!(error = %err, "mqtt subscribe failed");
                }
                let snapshot = client.snapshot(&tracked_submodels).await;
                if snapshot.is_empty() {
                    warn!("shadow reseed returned no submodels");
                } else {
                    shadow.apply_snapshot(snapshot);
                }
            },
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                apply_publish(&shadow, &settings, &publish.topic, &publish.payload);
            },
            Ok(_) => {},
            Err(err) => {
                warn!(error = %err, "mqtt connection error, retrying");
                tokio::time::sleep(RECONNECT_DELAY).await;
            },
        }
    }
}

/// Applies one MQTT delivery to the shadow.
fn apply_publish(shadow: &ShadowTwin, settings: &Settings, topic: &str, payload: &[u8]) {
    let Some(parsed) = parse_topic(topic) else {
        return;
    };
    if parsed.repo_id != settings.repo_id || parsed.aas_id != settings.aas_id {
        return;
    }
    let Some((value, broker_ts)) = parse_payload(payload) else {
        warn!(topic, "unparseable shadow update payload");
        return;
    };

    debug!(
        submodel = %parsed.submodel_id,
        path = %parsed.element_path,
        "shadow update"
    );
    shadow.apply_timestamped_update(&parsed.submodel_id, &parsed.element_path, value, broker_ts);
}
