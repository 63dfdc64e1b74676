//! Broker subscription loop, bounded queues with drop policy, and the
//! telemetry-priority worker pool that drains them into the dispatcher.

mod queue;

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use rumqttc::{AsyncClient, Event, Incoming, MqttOptions, QoS, Transport};
use sqlx::PgPool;

use cgtw_config::{AppConfig, DropPolicy};
use cgtw_dispatch::DispatchState;
use cgtw_schemas::{parse_topic, Topic};
use cgtw_watchdog::LivenessMap;

pub use queue::BoundedQueue;

#[derive(Debug, Clone)]
pub struct IngestItem {
    pub topic: String,
    pub payload: Vec<u8>,
    pub received_at: chrono::DateTime<Utc>,
}

/// The two queues a worker drains, created once at startup and shared by
/// every task.
pub struct Queues {
    pub telemetry: Arc<BoundedQueue<IngestItem>>,
    pub decoded: Arc<BoundedQueue<IngestItem>>,
}

impl Queues {
    pub fn new(cfg: &AppConfig) -> Self {
        Self {
            telemetry: Arc::new(BoundedQueue::new(cfg.ingest.telemetry_queue_maxsize)),
            decoded: Arc::new(BoundedQueue::new(cfg.ingest.decoded_queue_maxsize)),
        }
    }
}

/// Touch the liveness map synchronously on receipt (not on DB write — see
/// module docs on `cgtw_watchdog::LivenessMap`). Returns `None` for a topic
/// that parses to neither recognized shape, in which case the caller drops
/// the message without enqueueing it.
fn touch_and_classify(topic: &str, liveness: &LivenessMap) -> Option<&'static str> {
    match parse_topic(topic) {
        Some(Topic::Telemetry { router_sn }) => {
            liveness.touch_router(&router_sn);
            Some("telemetry")
        }
        Some(Topic::Decoded { router_sn, panel_id }) => {
            liveness.touch_panel(&router_sn, panel_id);
            Some("decoded")
        }
        None => None,
    }
}

fn build_mqtt_options(cfg: &AppConfig) -> MqttOptions {
    let mc = &cfg.mqtt;
    let mut opts = MqttOptions::new(mc.client_id.clone(), mc.host.clone(), mc.port);
    opts.set_keep_alive(Duration::from_secs(mc.keepalive.max(5)));
    if !mc.user.is_empty() {
        opts.set_credentials(mc.user.clone(), mc.password.clone());
    }
    if mc.tls {
        opts.set_transport(Transport::tls_with_default_config());
    }
    opts
}

/// Connects to the broker, subscribes to both topic patterns, and enqueues
/// every inbound message. On any transport failure, reconnects with
/// exponential backoff (`reconnect_min_delay` doubling up to
/// `reconnect_max_delay`, reset on each successful connect). Runs forever;
/// the caller aborts the task on shutdown.
pub async fn ingest_loop(cfg: Arc<AppConfig>, liveness: Arc<LivenessMap>, queues: Arc<Queues>) {
    let mut delay = cfg.mqtt.reconnect_min_delay.max(1);

    loop {
        let opts = build_mqtt_options(&cfg);
        let (client, mut eventloop) = AsyncClient::new(opts, 64);

        tracing::info!(host = %cfg.mqtt.host, port = cfg.mqtt.port, "mqtt connecting");

        if let Err(e) = client.subscribe(&cfg.mqtt.sub_decoded, QoS::AtLeastOnce).await {
            tracing::warn!(error = %e, topic = %cfg.mqtt.sub_decoded, "subscribe failed");
        }
        if let Err(e) = client.subscribe(&cfg.mqtt.sub_telemetry, QoS::AtLeastOnce).await {
            tracing::warn!(error = %e, topic = %cfg.mqtt.sub_telemetry, "subscribe failed");
        }

        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Incoming::ConnAck(_))) => {
                    delay = cfg.mqtt.reconnect_min_delay.max(1);
                    tracing::info!("mqtt connected");
                }
                Ok(Event::Incoming(Incoming::Publish(publish))) => {
                    handle_publish(&cfg, &liveness, &queues, publish.topic, publish.payload.to_vec()).await;
                }
                Ok(_) => {}
                Err(e) => {
                    tracing::warn!(error = %e, delay_sec = delay, "mqtt connection lost, reconnecting");
                    tokio::time::sleep(Duration::from_secs(delay)).await;
                    delay = (delay * 2).min(cfg.mqtt.reconnect_max_delay.max(delay));
                    break;
                }
            }
        }
    }
}

async fn handle_publish(cfg: &AppConfig, liveness: &LivenessMap, queues: &Queues, topic: String, payload: Vec<u8>) {
    let Some(kind) = touch_and_classify(&topic, liveness) else {
        tracing::debug!(topic, "unrecognized topic, dropping");
        return;
    };

    let item = IngestItem {
        topic,
        payload,
        received_at: Utc::now(),
    };

    if kind == "telemetry" {
        // Never dropped: GPS and liveness are precious. Backpressure here
        // stalls the broker read loop, which is the intended tradeoff.
        queues.telemetry.put(item).await;
        return;
    }

    let ic = &cfg.ingest;
    match queues.decoded.try_put(item) {
        Ok(()) => {}
        Err(item) => {
            if !ic.drop_decoded_when_full {
                tracing::warn!(size = queues.decoded.len(), "decoded queue full; blocking put");
                queues.decoded.put(item).await;
            } else {
                match ic.drop_decoded_policy {
                    DropPolicy::DropOldest => {
                        tracing::warn!(topic = %item.topic, "decoded queue full; dropped oldest");
                        queues.decoded.drop_oldest_and_put(item);
                    }
                    DropPolicy::DropNew => {
                        tracing::warn!(topic = %item.topic, "decoded queue full; dropped new message");
                    }
                }
            }
        }
    }
}

/// One DB-writer worker: telemetry is checked first (non-blocking); if empty,
/// blocks on the decoded queue. On dispatch failure, retries up to
/// `worker_max_retries` with `worker_retry_delay_sec` between attempts, then
/// logs and drops.
pub async fn worker_loop(
    worker_id: usize,
    cfg: Arc<AppConfig>,
    pool: PgPool,
    dispatch_state: Arc<DispatchState>,
    queues: Arc<Queues>,
) {
    tracing::info!(
        worker_id,
        max_retries = cfg.ingest.worker_max_retries,
        retry_delay_sec = cfg.ingest.worker_retry_delay_sec,
        "ingest worker started"
    );

    loop {
        let item = match queues.telemetry.try_get() {
            Some(item) => item,
            None => queues.decoded.get().await,
        };

        let mut attempt = 0u32;
        loop {
            match cgtw_dispatch::dispatch(&item.topic, &item.payload, &cfg, &pool, &dispatch_state).await {
                Ok(()) => break,
                Err(e) => {
                    attempt += 1;
                    if attempt > cfg.ingest.worker_max_retries {
                        tracing::error!(
                            worker_id,
                            topic = %item.topic,
                            error = %e,
                            retries = cfg.ingest.worker_max_retries,
                            "dropping message after exhausting retries"
                        );
                        break;
                    }
                    tracing::warn!(
                        worker_id,
                        topic = %item.topic,
                        error = %e,
                        attempt,
                        "dispatch failed, retrying"
                    );
                    tokio::time::sleep(Duration::from_secs_f64(cfg.ingest.worker_retry_delay_sec.max(0.0))).await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_and_touches_telemetry_topic() {
        let liveness = LivenessMap::new();
        let kind = touch_and_classify("cg/v1/telemetry/SN/R1", &liveness);
        assert_eq!(kind, Some("telemetry"));
    }

    #[test]
    fn classifies_and_touches_decoded_topic_including_router() {
        let liveness = LivenessMap::new();
        let kind = touch_and_classify("cg/v1/decoded/SN/R1/pcc/7", &liveness);
        assert_eq!(kind, Some("decoded"));
    }

    #[test]
    fn unrecognized_topic_is_dropped() {
        let liveness = LivenessMap::new();
        assert_eq!(touch_and_classify("not/a/cg/topic", &liveness), None);
    }
}
