//! Connection Manager: owns the MQTT session lifecycle.
//!
//! One subscription per invocation. Transport failures feed an exponential
//! backoff with jitter until either the attempt budget runs out or the
//! supervisor's deadline cancels us; message handling never aborts the
//! connection.

use std::time::Duration;

use rand::Rng;
use rumqttc::{
    AsyncClient, ConnectReturnCode, Event, EventLoop, MqttOptions, Outgoing, Packet, Publish, QoS,
    SubscribeReasonCode,
};
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::error::{DaemonError, Result};

/// Capacity of the request channel between client handle and event loop.
const REQUEST_CAP: usize = 64;
/// How long to drain the event loop for in-flight acks on shutdown.
const SHUTDOWN_DRAIN: Duration = Duration::from_secs(2);

pub struct ConnectionManager {
    client: AsyncClient,
    eventloop: EventLoop,
    topic: String,
    qos: QoS,
    attempt_budget: u32,
    backoff_base: Duration,
    backoff_cap: Duration,
    /// Consecutive transport failures since the last healthy event.
    failed_attempts: u32,
}

impl ConnectionManager {
    pub fn new(cfg: &Config) -> Self {
        let mut options = MqttOptions::new(&cfg.client_id, &cfg.mqtt_host, cfg.mqtt_port);
        options.set_keep_alive(cfg.mqtt_keepalive);
        if let (Some(user), Some(pass)) = (&cfg.mqtt_username, &cfg.mqtt_password) {
            options.set_credentials(user, pass);
        }

        let (client, eventloop) = AsyncClient::new(options, REQUEST_CAP);

        Self {
            client,
            eventloop,
            topic: cfg.mqtt_topic.clone(),
            qos: qos_from_level(cfg.mqtt_qos),
            attempt_budget: cfg.connect_attempts.max(1),
            backoff_base: cfg.reconnect_base,
            backoff_cap: cfg.reconnect_cap,
            failed_attempts: 0,
        }
    }

    /// Drive the event loop until the broker acknowledges the session.
    /// Fails with [`DaemonError::Connection`] once the attempt budget is
    /// spent.
    pub async fn connect(&mut self) -> Result<()> {
        loop {
            match self.eventloop.poll().await {
                Ok(Event::Incoming(Packet::ConnAck(ack)))
                    if ack.code == ConnectReturnCode::Success =>
                {
                    self.failed_attempts = 0;
                    info!("Connected to MQTT broker");
                    return Ok(());
                }
                Ok(event) => debug!(?event, "Ignoring pre-connect event"),
                Err(e) => self.note_failure(&e.to_string()).await?,
            }
        }
    }

    /// Subscribe to the configured topic pattern and wait for the broker to
    /// grant it. A rejected grant is a [`DaemonError::Subscription`] (ACL
    /// denial, not a transport problem).
    pub async fn subscribe(&mut self) -> Result<()> {
        self.client
            .subscribe(&self.topic, self.qos)
            .await
            .map_err(|e| DaemonError::Subscription(e.to_string()))?;

        loop {
            match self.eventloop.poll().await {
                Ok(Event::Incoming(Packet::SubAck(ack))) => {
                    if ack.return_codes.iter().any(|c| *c == SubscribeReasonCode::Failure) {
                        return Err(DaemonError::Subscription(format!(
                            "broker rejected subscription to {:?}",
                            self.topic
                        )));
                    }
                    info!(topic = %self.topic, qos = ?self.qos, "Subscribed");
                    return Ok(());
                }
                Ok(event) => debug!(?event, "Ignoring pre-subscribe event"),
                Err(e) => {
                    return Err(DaemonError::Connection(format!(
                        "connection lost while subscribing: {e}"
                    )))
                }
            }
        }
    }

    /// Wait for the next inbound publish, transparently reconnecting and
    /// resubscribing on transport errors. Returns
    /// [`DaemonError::Connection`] only when the reconnect budget is
    /// exhausted. The supervisor drops this future on shutdown; a publish
    /// in flight at that moment is not guaranteed to be delivered.
    pub async fn next_publish(&mut self) -> Result<Publish> {
        loop {
            match self.eventloop.poll().await {
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    self.failed_attempts = 0;
                    return Ok(publish);
                }
                // A ConnAck mid-run means the transport reconnected; the
                // broker does not replay our subscription, so renew it.
                Ok(Event::Incoming(Packet::ConnAck(ack)))
                    if ack.code == ConnectReturnCode::Success =>
                {
                    self.failed_attempts = 0;
                    info!("Reconnected to MQTT broker, renewing subscription");
                    self.client
                        .subscribe(&self.topic, self.qos)
                        .await
                        .map_err(|e| DaemonError::Subscription(e.to_string()))?;
                }
                Ok(event) => debug!(?event, "MQTT event"),
                Err(e) => self.note_failure(&e.to_string()).await?,
            }
        }
    }

    /// Unsubscribe and disconnect, then drain the event loop briefly so
    /// in-flight acks for the QoS level in use get flushed.
    pub async fn shutdown(mut self) {
        let _ = self.client.unsubscribe(&self.topic).await;
        let _ = self.client.disconnect().await;

        let drain = async {
            loop {
                match self.eventloop.poll().await {
                    Ok(Event::Outgoing(Outgoing::Disconnect)) | Err(_) => break,
                    Ok(event) => debug!(?event, "Draining event during shutdown"),
                }
            }
        };
        if tokio::time::timeout(SHUTDOWN_DRAIN, drain).await.is_err() {
            warn!("Timed out draining MQTT event loop during shutdown");
        }
        info!("MQTT connection closed");
    }

    /// Count one transport failure, wait out the backoff, or give up once the
    /// budget is spent.
    async fn note_failure(&mut self, cause: &str) -> Result<()> {
        self.failed_attempts += 1;
        if self.failed_attempts >= self.attempt_budget {
            return Err(DaemonError::Connection(format!(
                "giving up after {} attempts: {cause}",
                self.failed_attempts
            )));
        }

        let delay = jittered(backoff_delay(
            self.backoff_base,
            self.backoff_cap,
            self.failed_attempts,
        ));
        warn!(
            attempt = self.failed_attempts,
            budget = self.attempt_budget,
            next_retry_ms = delay.as_millis() as u64,
            error = %cause,
            "MQTT transport error, backing off"
        );
        tokio::time::sleep(delay).await;
        Ok(())
    }
}

/// Deterministic exponential backoff: `base * 2^(attempt-1)`, capped.
fn backoff_delay(base: Duration, cap: Duration, attempt: u32) -> Duration {
    let shift = attempt.saturating_sub(1).min(16);
    base.saturating_mul(1u32 << shift).min(cap)
}

/// Add up to 25% uniform jitter so restarting fleets do not reconnect in
/// lockstep.
fn jittered(delay: Duration) -> Duration {
    let extra_ms = delay.as_millis() as u64 / 4;
    if extra_ms == 0 {
        return delay;
    }
    delay + Duration::from_millis(rand::thread_rng().gen_range(0..=extra_ms))
}

fn qos_from_level(level: u8) -> QoS {
    match level {
        0 => QoS::AtMostOnce,
        2 => QoS::ExactlyOnce,
        // Config validation only admits 0..=2.
        _ => QoS::AtLeastOnce,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BASE: Duration = Duration::from_secs(1);
    const CAP: Duration = Duration::from_secs(60);

    #[test]
    fn backoff_doubles_per_attempt() {
        assert_eq!(backoff_delay(BASE, CAP, 1), Duration::from_secs(1));
        assert_eq!(backoff_delay(BASE, CAP, 2), Duration::from_secs(2));
        assert_eq!(backoff_delay(BASE, CAP, 3), Duration::from_secs(4));
        assert_eq!(backoff_delay(BASE, CAP, 4), Duration::from_secs(8));
    }

    #[test]
    fn backoff_is_monotone_and_capped() {
        let mut previous = Duration::ZERO;
        for attempt in 1..40 {
            let d = backoff_delay(BASE, CAP, attempt);
            assert!(d >= previous, "attempt {attempt} went backwards");
            assert!(d <= CAP, "attempt {attempt} exceeded the cap");
            previous = d;
        }
        assert_eq!(previous, CAP);
    }

    #[test]
    fn jitter_stays_within_a_quarter() {
        let base = Duration::from_secs(4);
        for _ in 0..100 {
            let d = jittered(base);
            assert!(d >= base);
            assert!(d <= base + Duration::from_secs(1));
        }
    }

    #[test]
    fn qos_levels_map_to_rumqttc() {
        assert_eq!(qos_from_level(0), QoS::AtMostOnce);
        assert_eq!(qos_from_level(1), QoS::AtLeastOnce);
        assert_eq!(qos_from_level(2), QoS::ExactlyOnce);
    }
}
