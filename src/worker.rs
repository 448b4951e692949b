// =============================================================================
// worker.rs - THE SIMULATED DEVICE ITSELF
// =============================================================================
//
// One long-lived loop per device. Connect with the device token as the MQTT
// username, arrive at the start gate, then publish telemetry at the shared
// cadence until someone trips the stop token.
//
// The tick schedule is absolute: tick k fires at S + k*I where S is the
// coordinator's shared start instant. A slow publish makes the NEXT tick
// late, never the whole schedule, and a worker that joins late (second ramp
// stage, or a reconnect after backoff) skips straight to the next future
// tick instead of machine-gunning the broker to catch up.
//
// Failure handling is the whole point of this tool, so every exit path is
// classified and recorded: CONNACK refusals, transport errors, publish
// rejections, broker-initiated disconnects. Transient failures cost the
// worker an exponential backoff (reset on a successful connect) and the
// session is torn down and rebuilt from scratch.
//
//   START -> CONNECTING -> READY -> gate -> PUBLISHING
//     ^          |                            |
//     |          +-- connect_error --+        |
//     |                              v        v
//     +--- (backoff, bounded) <-- ERRORED <-- publish_error / mqtt_error
//                                       +---- cancelled / stopped -> TERMINAL
// =============================================================================

use std::sync::Arc;
use std::time::Duration;

use rand::distributions::Alphanumeric;
use rand::Rng;
use rumqttc::{
    AsyncClient, ConnectReturnCode, Event, EventLoop, MqttOptions, Packet, QoS,
};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::classify::{
    classify, classify_connect_code, connack_code, is_graceful_reason, Classification,
    FailureCause,
};
use crate::metrics::MetricsAggregator;
use crate::models::{DeviceToken, EventRecord, FailureStage, TelemetryPayload};
use crate::ramp::{StartCoordinator, StartGate};
use crate::sinks::EventSink;
use crate::stop::StopToken;

/// Knobs shared by every worker in a shard.
pub struct WorkerSettings {
    pub host: String,
    pub port: u16,
    pub topic: String,
    pub qos: QoS,
    pub interval: Duration,
    pub backoff_base: f64,
    pub backoff_max: f64,
}

/// What the MQTT driver task observed on the wire, reduced to the five
/// things a publishing worker cares about.
enum DriverEvent {
    ConnAck(ConnectReturnCode),
    PubAck,
    PubComp,
    BrokerDisconnect,
    Error(rumqttc::ConnectionError),
}

enum PublishOutcome {
    Sent,
    Stopped,
    Failed { reason: String },
}

struct SessionEnd {
    reason: String,
    graceful: bool,
}

/// One simulated device: owns exactly one MQTT session at a time and
/// shares only the aggregator, the event sink, and the stop token.
pub struct DeviceWorker {
    device: DeviceToken,
    settings: Arc<WorkerSettings>,
    metrics: Arc<MetricsAggregator>,
    events: EventSink,
    stop: StopToken,
    gate: Arc<StartGate>,
    coordinator: Arc<StartCoordinator>,
    sequence: u64,
    arrived: bool,
    start_instant: Option<Instant>,
}

impl DeviceWorker {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        device: DeviceToken,
        settings: Arc<WorkerSettings>,
        metrics: Arc<MetricsAggregator>,
        events: EventSink,
        stop: StopToken,
        gate: Arc<StartGate>,
        coordinator: Arc<StartCoordinator>,
    ) -> Self {
        Self {
            device,
            settings,
            metrics,
            events,
            stop,
            gate,
            coordinator,
            sequence: 0,
            arrived: false,
            start_instant: None,
        }
    }

    /// Connect-publish-reconnect until stopped. Terminates promptly on
    /// cancellation and cleans the MQTT session up on every exit path.
    pub async fn run(mut self) {
        let backoff_base = self.settings.backoff_base.max(0.1);
        let backoff_max = self.settings.backoff_max.max(backoff_base);
        let mut backoff = backoff_base;
        loop {
            if self.stop.is_stopped() {
                break;
            }
            let end = self.run_session(&mut backoff).await;
            if self.stop.is_stopped() || end.graceful {
                break;
            }
            debug!(
                device = %self.device.device_id,
                reason = %end.reason,
                backoff_secs = backoff,
                "session ended, backing off before reconnect"
            );
            if self.stop.sleep(Duration::from_secs_f64(backoff)).await {
                break;
            }
            backoff = (backoff * 2.0).min(backoff_max);
        }
        debug!(device = %self.device.device_id, "worker finished");
    }

    /// One full session: connect, synchronize, publish until something
    /// ends it. Records every outcome; the return value only tells the
    /// outer loop whether to back off and retry.
    async fn run_session(&mut self, backoff: &mut f64) -> SessionEnd {
        let device_id = self.device.device_id.clone();
        let client_id = format!("sim-{}-{}", device_id, client_suffix());
        let mut options = MqttOptions::new(client_id, self.settings.host.clone(), self.settings.port);
        options.set_credentials(self.device.token.clone(), String::new());
        options.set_keep_alive(Duration::from_secs(60));
        options.set_clean_session(true);

        let (client, eventloop) = AsyncClient::new(options, 10);
        let (mut driver_rx, driver) = spawn_driver(eventloop);

        // Phase one: wait for the broker's verdict on our credentials.
        let connack = tokio::select! {
            event = driver_rx.recv() => event,
            _ = self.stop.cancelled() => {
                self.teardown(client, driver, false, "stopped").await;
                return SessionEnd { reason: "stopped".into(), graceful: true };
            }
        };
        match connack {
            Some(DriverEvent::ConnAck(ConnectReturnCode::Success)) => {}
            Some(DriverEvent::ConnAck(code)) => {
                let rc = connack_code(code);
                let cls = classify_connect_code(rc);
                warn!(device = %device_id, rc, reason = cls.reason, "broker refused connection");
                self.metrics
                    .record_connection_failure(&device_id, cls.reason, Some(&cls.detail), Some(rc));
                self.events
                    .log(EventRecord::connection_error(&device_id, &cls.detail))
                    .await;
                self.teardown(client, driver, false, cls.reason).await;
                return SessionEnd {
                    reason: cls.reason.to_string(),
                    graceful: false,
                };
            }
            Some(DriverEvent::Error(error)) => {
                let cls = classify(FailureStage::Connect, Some(FailureCause::Connection(&error)));
                let reason = format!("mqtt_error:{}", cls.reason);
                warn!(device = %device_id, error = %error, reason = %reason, "connection failed");
                self.metrics
                    .record_connection_failure(&device_id, &reason, Some(&cls.detail), None);
                self.events
                    .log(EventRecord::connection_error(&device_id, &cls.detail))
                    .await;
                self.teardown(client, driver, false, &reason).await;
                return SessionEnd {
                    reason,
                    graceful: false,
                };
            }
            _ => {
                let reason = "mqtt_error:unknown".to_string();
                self.metrics.record_connection_failure(
                    &device_id,
                    &reason,
                    Some("driver stopped before CONNACK"),
                    None,
                );
                self.teardown(client, driver, false, &reason).await;
                return SessionEnd {
                    reason,
                    graceful: false,
                };
            }
        }

        // Connected. Reset the backoff, tell the ledger, and line up for
        // the synchronized first burst exactly once per worker lifetime.
        *backoff = self.settings.backoff_base.max(0.1);
        self.metrics.record_client_connected(&device_id);
        self.events
            .log(EventRecord::connected(
                &device_id,
                &self.settings.host,
                self.settings.port,
            ))
            .await;
        debug!(device = %device_id, "connected");
        if !self.arrived {
            self.gate.arrive();
            self.arrived = true;
        }
        let start = match self.start_instant {
            Some(start) => start,
            None => {
                let start = tokio::select! {
                    start = self.coordinator.wait() => start,
                    _ = self.stop.cancelled() => {
                        self.teardown(client, driver, true, "stopped").await;
                        return SessionEnd { reason: "stopped".into(), graceful: true };
                    }
                };
                self.start_instant = Some(start);
                start
            }
        };

        // Phase two: the tick loop. Absolute deadlines, no cumulative drift.
        let interval = self.settings.interval;
        let mut tick = tick_after(start, interval, Instant::now());
        let end = loop {
            if self.stop.is_stopped() {
                break SessionEnd {
                    reason: "stopped".into(),
                    graceful: true,
                };
            }
            let deadline = start + interval * tick as u32;
            if self.stop.sleep_until(deadline).await {
                break SessionEnd {
                    reason: "stopped".into(),
                    graceful: true,
                };
            }
            match self.publish_once(&client, &mut driver_rx).await {
                PublishOutcome::Sent => {
                    tick += 1;
                }
                PublishOutcome::Stopped => {
                    break SessionEnd {
                        reason: "stopped".into(),
                        graceful: true,
                    };
                }
                PublishOutcome::Failed { reason } => {
                    break SessionEnd {
                        reason,
                        graceful: false,
                    };
                }
            }
        };

        self.teardown(client, driver, true, &end.reason).await;
        end
    }

    /// Publish one telemetry sample and, for QoS 1/2, wait for the broker
    /// to acknowledge it. Latency covers publish start to acknowledgement.
    async fn publish_once(
        &mut self,
        client: &AsyncClient,
        driver_rx: &mut mpsc::Receiver<DriverEvent>,
    ) -> PublishOutcome {
        let device_id = self.device.device_id.clone();
        self.sequence += 1;
        let payload = TelemetryPayload::sample(&device_id, self.sequence);
        let publish_started = Instant::now();
        let body = match serde_json::to_vec(&payload) {
            Ok(body) => body,
            Err(error) => {
                let cls = Classification {
                    reason: "internal-error",
                    detail: format!("payload serialization failed: {error}"),
                };
                return self
                    .publish_failed(&device_id, cls, publish_started)
                    .await;
            }
        };
        let payload_bytes = body.len();

        if let Err(error) = client
            .publish(self.settings.topic.as_str(), self.settings.qos, false, body)
            .await
        {
            let cls = classify(FailureStage::Publish, Some(FailureCause::Client(&error)));
            return self
                .publish_failed(&device_id, cls, publish_started)
                .await;
        }

        if self.settings.qos != QoS::AtMostOnce {
            loop {
                let event = tokio::select! {
                    event = driver_rx.recv() => event,
                    _ = self.stop.cancelled() => return PublishOutcome::Stopped,
                };
                match event {
                    Some(DriverEvent::PubAck) | Some(DriverEvent::PubComp) => break,
                    Some(DriverEvent::ConnAck(_)) => continue,
                    Some(DriverEvent::Error(error)) => {
                        let cls =
                            classify(FailureStage::Publish, Some(FailureCause::Connection(&error)));
                        return self
                            .publish_failed(&device_id, cls, publish_started)
                            .await;
                    }
                    Some(DriverEvent::BrokerDisconnect) => {
                        let cls = Classification {
                            reason: "broker",
                            detail: "broker closed the session mid-publish".to_string(),
                        };
                        return self
                            .publish_failed(&device_id, cls, publish_started)
                            .await;
                    }
                    None => {
                        let cls = Classification {
                            reason: "internal-error",
                            detail: "event loop driver exited unexpectedly".to_string(),
                        };
                        return self
                            .publish_failed(&device_id, cls, publish_started)
                            .await;
                    }
                }
            }
        }

        let latency_seconds = publish_started.elapsed().as_secs_f64();
        self.metrics
            .record_publish_success(&device_id, latency_seconds, payload_bytes);
        self.events
            .log(EventRecord::publish_success(
                &device_id,
                latency_seconds * 1000.0,
                payload,
            ))
            .await;
        PublishOutcome::Sent
    }

    async fn publish_failed(
        &self,
        device_id: &str,
        cls: Classification,
        publish_started: Instant,
    ) -> PublishOutcome {
        let latency_ms = publish_started.elapsed().as_secs_f64() * 1000.0;
        warn!(device = %device_id, reason = cls.reason, detail = %cls.detail, "publish failed");
        self.metrics
            .record_publish_failure(device_id, cls.reason, Some(&cls.detail));
        self.events
            .log(EventRecord::publish_failure(device_id, &cls.detail, latency_ms))
            .await;
        PublishOutcome::Failed {
            reason: format!("mqtt_error:{}", cls.reason),
        }
    }

    /// Every exit path funnels through here: send DISCONNECT, stop the
    /// driver, and if the session ever reached the broker, classify how it
    /// ended.
    async fn teardown(
        &self,
        client: AsyncClient,
        driver: JoinHandle<()>,
        connected: bool,
        reason: &str,
    ) {
        let _ = client.disconnect().await;
        // One breath so the driver can flush the DISCONNECT on the wire.
        tokio::time::sleep(Duration::from_millis(50)).await;
        driver.abort();
        let _ = driver.await;
        if connected {
            let graceful = is_graceful_reason(reason);
            self.metrics
                .record_client_disconnected(&self.device.device_id, reason, graceful);
            self.events
                .log(EventRecord::disconnected(&self.device.device_id, reason))
                .await;
        }
    }
}

/// Pump the rumqttc event loop and forward the packets the worker cares
/// about. Exits on the first transport error; reconnecting is the worker's
/// decision, not the library's.
fn spawn_driver(mut eventloop: EventLoop) -> (mpsc::Receiver<DriverEvent>, JoinHandle<()>) {
    let (tx, rx) = mpsc::channel::<DriverEvent>(64);
    let handle = tokio::spawn(async move {
        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                    if tx.send(DriverEvent::ConnAck(ack.code)).await.is_err() {
                        break;
                    }
                }
                Ok(Event::Incoming(Packet::PubAck(_))) => {
                    if tx.send(DriverEvent::PubAck).await.is_err() {
                        break;
                    }
                }
                Ok(Event::Incoming(Packet::PubComp(_))) => {
                    if tx.send(DriverEvent::PubComp).await.is_err() {
                        break;
                    }
                }
                Ok(Event::Incoming(Packet::Disconnect)) => {
                    let _ = tx.send(DriverEvent::BrokerDisconnect).await;
                    break;
                }
                Ok(_) => {}
                Err(error) => {
                    let _ = tx.send(DriverEvent::Error(error)).await;
                    break;
                }
            }
        }
    });
    (rx, handle)
}

/// Index of the first tick at or after `now` on the schedule S + k*I.
fn tick_after(start: Instant, interval: Duration, now: Instant) -> u64 {
    if now <= start {
        return 0;
    }
    let elapsed = (now - start).as_secs_f64();
    (elapsed / interval.as_secs_f64()).ceil() as u64
}

fn client_suffix() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(6)
        .map(char::from)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tick_after_skips_to_future_ticks() {
        let start = Instant::now();
        let interval = Duration::from_secs(1);
        assert_eq!(tick_after(start, interval, start), 0);
        // A start instant still in the future means the first tick is tick 0.
        let future_start = start + Duration::from_secs(5);
        assert_eq!(tick_after(future_start, interval, start), 0);
        assert_eq!(
            tick_after(start, interval, start + Duration::from_millis(100)),
            1
        );
        // 3.2 intervals late: next tick is the fourth.
        assert_eq!(
            tick_after(start, interval, start + Duration::from_millis(3200)),
            4
        );
    }

    #[test]
    fn test_client_suffix_shape() {
        let suffix = client_suffix();
        assert_eq!(suffix.len(), 6);
        assert!(suffix.chars().all(|c| c.is_ascii_alphanumeric()));
    }

    async fn test_worker(
        stop: &StopToken,
        metrics: &Arc<MetricsAggregator>,
        events: EventSink,
        backoff_base: f64,
    ) -> DeviceWorker {
        let settings = Arc::new(WorkerSettings {
            host: "127.0.0.1".to_string(),
            // Port 1 is essentially guaranteed to refuse connections.
            port: 1,
            topic: "v1/devices/me/telemetry".to_string(),
            qos: QoS::AtLeastOnce,
            interval: Duration::from_millis(100),
            backoff_base,
            backoff_max: 1.0,
        });
        let gate = Arc::new(StartGate::new(1));
        let coordinator = Arc::new(StartCoordinator::new(0.05));
        DeviceWorker::new(
            DeviceToken::new("sim-test", "sim-test"),
            settings,
            Arc::clone(metrics),
            events,
            stop.clone(),
            gate,
            coordinator,
        )
    }

    #[tokio::test]
    async fn test_worker_exits_promptly_when_already_stopped() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (events, task) = EventSink::spawn(&dir.path().join("events.jsonl"))
            .await
            .expect("sink");
        let stop = StopToken::new();
        let metrics = Arc::new(MetricsAggregator::new(1, stop.clone()));
        stop.trip("test");
        let worker = test_worker(&stop, &metrics, events.clone(), 0.1).await;
        tokio::time::timeout(Duration::from_secs(2), worker.run())
            .await
            .expect("stopped worker must exit immediately");
        events.close(task).await;
        assert_eq!(metrics.snapshot().successful_publishes, 0);
    }

    #[tokio::test]
    async fn test_worker_classifies_unreachable_broker_and_backs_off() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (events, task) = EventSink::spawn(&dir.path().join("events.jsonl"))
            .await
            .expect("sink");
        let stop = StopToken::new();
        let metrics = Arc::new(MetricsAggregator::new(1, stop.clone()));
        let worker = test_worker(&stop, &metrics, events.clone(), 0.05).await;
        let handle = tokio::spawn(worker.run());

        // Wait until at least two connection attempts have been recorded,
        // which proves the backoff-and-retry cycle is turning.
        let deadline = Instant::now() + Duration::from_secs(10);
        loop {
            if metrics.snapshot().failed_publishes >= 2 {
                break;
            }
            assert!(Instant::now() < deadline, "worker never recorded failures");
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        stop.trip("test done");
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("worker should exit after stop")
            .expect("worker task should not panic");

        let summary = metrics.summary();
        assert_eq!(summary.successful_publishes, 0);
        assert!(summary.failed_publishes >= 2);
        assert_eq!(summary.peak_connected_devices, 0);
        let reason = summary.collapse_reason.expect("collapse must be marked");
        assert!(
            reason.starts_with("mqtt_error:"),
            "unexpected collapse reason {reason}"
        );
        events.close(task).await;
    }
}
