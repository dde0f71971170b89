//! # MQTT Broker Connector
//!
//! Subscribes to the configured topics and feeds every received publish into
//! the intake queue as a `RawMessage`.
//!
//! ## Behaviour:
//! - Subscriptions are QoS 0 (at most once). They are re-issued on every
//!   `ConnAck`, so a reconnect restores them.
//! - `put` into a full intake queue blocks the receive loop. While blocked the
//!   event loop is not polled, so backpressure reaches the broker connection.
//! - Connection errors move the state to `Reconnecting`; the event loop
//!   reconnects on the next poll after `reconnect_delay`. With a
//!   `max_reconnect_attempts` limit, the first consecutive failure beyond
//!   that many ends the run with [`IngestError::ConnectionLost`].
//! - A subscribe request the client refuses is fatal: without a subscription
//!   the connector would sit `Connected` and receive nothing.
//! - On exit a live session is closed with an MQTT DISCONNECT, flushed by
//!   polling the event loop for at most [`DISCONNECT_TIMEOUT`].

use std::sync::Arc;
use std::time::Duration;

use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Outgoing, Packet, QoS, SubscribeFilter};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::configs::BrokerConfig;
use crate::core::intake_queue::IntakeQueue;
use crate::error::IngestError;
use crate::reading::RawMessage;

/// Capacity of the request channel between `AsyncClient` and `EventLoop`.
const CLIENT_CHANNEL_CAPACITY: usize = 16;

/// Upper bound on flushing the DISCONNECT packet at shutdown.
pub const DISCONNECT_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Connected,
    Reconnecting,
    Failed,
    Disconnected,
}

pub struct MqttConnector {
    config: BrokerConfig,
    client: AsyncClient,
    eventloop: EventLoop,
    state: watch::Sender<ConnectionState>,
    failures: u32,
}

impl MqttConnector {
    /// Builds the client. No network I/O happens until [`MqttConnector::run`].
    pub fn new(config: &BrokerConfig) -> Self {
        let mut options = MqttOptions::new(config.client_id.clone(), config.host.clone(), config.port);
        options.set_keep_alive(config.keep_alive);
        options.set_clean_session(true);

        let (client, eventloop) = AsyncClient::new(options, CLIENT_CHANNEL_CAPACITY);
        let (state, _) = watch::channel(ConnectionState::Connecting);
        Self {
            config: config.clone(),
            client,
            eventloop,
            state,
            failures: 0,
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Receiver that observes every state change.
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    /// Receive loop. Runs until `cancel` fires, the queue is closed, or the
    /// reconnect limit is exceeded. Always disconnects on the way out.
    pub async fn run(&mut self, queue: Arc<IntakeQueue<RawMessage>>, cancel: CancellationToken) -> Result<(), IngestError> {
        info!(
            host = %self.config.host,
            port = self.config.port,
            topics = ?self.config.topics,
            "connecting to broker"
        );
        let result = self.receive(&queue, &cancel).await;

        if self.state() == ConnectionState::Connected {
            self.disconnect().await;
        }
        match &result {
            Ok(()) => {
                self.set_state(ConnectionState::Disconnected);
                info!("broker connector stopped");
            }
            Err(e) => {
                self.set_state(ConnectionState::Failed);
                error!(error = %e, "broker connector failed");
            }
        }
        result
    }

    async fn receive(&mut self, queue: &IntakeQueue<RawMessage>, cancel: &CancellationToken) -> Result<(), IngestError> {
        loop {
            let event = tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                event = self.eventloop.poll() => event,
            };

            match event {
                Ok(event) => {
                    let Some(message) = self.handle_event(event)? else {
                        continue;
                    };
                    tokio::select! {
                        _ = cancel.cancelled() => return Ok(()),
                        put = queue.put(message) => {
                            if put.is_err() {
                                return Err(IngestError::QueueClosed);
                            }
                        }
                    }
                }
                Err(e) => {
                    self.failures += 1;
                    if self.config.max_reconnect_attempts.is_some_and(|max| self.failures > max) {
                        return Err(IngestError::ConnectionLost(e.to_string()));
                    }
                    self.set_state(ConnectionState::Reconnecting);
                    warn!(
                        error = %e,
                        attempt = self.failures,
                        retry_in_ms = self.config.reconnect_delay.as_millis() as u64,
                        "broker connection error"
                    );
                    tokio::select! {
                        _ = cancel.cancelled() => return Ok(()),
                        _ = tokio::time::sleep(self.config.reconnect_delay) => {}
                    }
                }
            }
        }
    }

    /// Reacts to one event loop notification. Returns the message to enqueue
    /// for incoming publishes, or an error when the subscription can't be
    /// requested.
    pub fn handle_event(&mut self, event: Event) -> Result<Option<RawMessage>, IngestError> {
        match event {
            Event::Incoming(Packet::ConnAck(_)) => {
                self.failures = 0;
                self.set_state(ConnectionState::Connected);
                info!(host = %self.config.host, "connected to broker");
                self.subscribe()?;
                Ok(None)
            }
            Event::Incoming(Packet::Publish(publish)) => {
                debug!(topic = %publish.topic, bytes = publish.payload.len(), "publish received");
                Ok(Some(RawMessage::new(publish.topic, publish.payload)))
            }
            Event::Incoming(Packet::SubAck(ack)) => {
                debug!(pkid = ack.pkid, "subscription acknowledged");
                Ok(None)
            }
            Event::Incoming(Packet::Disconnect) => {
                warn!("broker sent disconnect");
                Ok(None)
            }
            _ => Ok(None),
        }
    }

    fn subscribe(&self) -> Result<(), IngestError> {
        let filters = self
            .config
            .topics
            .iter()
            .map(|topic| SubscribeFilter::new(topic.clone(), QoS::AtMostOnce));
        self.client
            .try_subscribe_many(filters)
            .map_err(|e| IngestError::ConnectionLost(format!("subscribe to {:?} refused: {}", self.config.topics, e)))?;
        info!(topics = ?self.config.topics, "subscribed");
        Ok(())
    }

    /// Queues a DISCONNECT and polls the event loop until it is written.
    async fn disconnect(&mut self) {
        if let Err(e) = self.client.try_disconnect() {
            debug!(error = %e, "disconnect request not queued");
            return;
        }
        let eventloop = &mut self.eventloop;
        let flushed = tokio::time::timeout(DISCONNECT_TIMEOUT, async {
            loop {
                match eventloop.poll().await {
                    Ok(Event::Outgoing(Outgoing::Disconnect)) => return Ok(()),
                    Ok(_) => continue,
                    Err(e) => return Err(e),
                }
            }
        })
        .await;
        match flushed {
            Ok(Ok(())) => debug!("disconnect sent to broker"),
            Ok(Err(e)) => debug!(error = %e, "connection closed before disconnect"),
            Err(_) => warn!(timeout_ms = DISCONNECT_TIMEOUT.as_millis() as u64, "disconnect not flushed in time"),
        }
    }

    fn set_state(&self, state: ConnectionState) {
        self.state.send_replace(state);
    }
}
