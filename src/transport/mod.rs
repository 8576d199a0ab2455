//! MQTT transport - one subscribed client per topic filter
//!
//! Each subscription owns a rumqttc event loop running on its own task and
//! forwards every publish into a bounded channel. Nothing is ever published.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Outgoing, Packet, QoS};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::clock::MonotonicClock;
use crate::config::TransportConfig;
use crate::{Error, Result};

/// How long to wait for the broker's ConnAck at startup
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Pause before polling again after a connection error
const RECONNECT_DELAY: Duration = Duration::from_secs(1);

/// How long a clean disconnect may take at shutdown
const DISCONNECT_GRACE: Duration = Duration::from_secs(2);

/// Outstanding requests between client handle and event loop
const REQUEST_CAPACITY: usize = 16;

/// A message received from the broker
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportEvent {
    pub topic: String,
    pub payload: Vec<u8>,
    /// Arrival time, non-decreasing across all subscriptions
    pub received_at: DateTime<Utc>,
}

impl TransportEvent {
    #[must_use]
    pub fn new(topic: impl Into<String>, payload: impl Into<Vec<u8>>, received_at: DateTime<Utc>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
            received_at,
        }
    }
}

/// A live source of inbound events
///
/// The channel closes once the pumping task has stopped.
pub struct Subscription {
    pub name: String,
    pub events: mpsc::Receiver<TransportEvent>,
    task: Option<JoinHandle<()>>,
}

impl Subscription {
    /// Wrap a channel that is fed by something other than a broker
    #[must_use]
    pub fn from_channel(name: impl Into<String>, events: mpsc::Receiver<TransportEvent>) -> Self {
        Self {
            name: name.into(),
            events,
            task: None,
        }
    }

    /// Wrap a channel fed by the spawned `task`
    pub(crate) fn with_task(
        name: impl Into<String>,
        events: mpsc::Receiver<TransportEvent>,
        task: JoinHandle<()>,
    ) -> Self {
        Self {
            name: name.into(),
            events,
            task: Some(task),
        }
    }

    /// Split into the event channel and the pumping task, if any
    #[must_use]
    pub fn into_parts(self) -> (String, mpsc::Receiver<TransportEvent>, Option<JoinHandle<()>>) {
        (self.name, self.events, self.task)
    }
}

/// Connect a dedicated client, subscribe to `filter` and start pumping
///
/// Blocks until the broker has accepted the connection. After that,
/// connection errors are logged and retried; the subscription is renewed on
/// every reconnect. Pumping stops when `shutdown` flips or its sender drops.
///
/// # Errors
///
/// Returns `Error::Startup` if the broker cannot be reached in time
pub async fn subscribe(
    config: &TransportConfig,
    name: &str,
    filter: &str,
    clock: Arc<MonotonicClock>,
    shutdown: watch::Receiver<bool>,
) -> Result<Subscription> {
    let client_id = format!("{}-{name}", config.client_id);
    let mut options = MqttOptions::new(client_id, config.broker_host.clone(), config.broker_port);
    options.set_keep_alive(config.keep_alive);
    options.set_clean_session(true);

    let (client, mut eventloop) = AsyncClient::new(options, REQUEST_CAPACITY);

    let connected = tokio::time::timeout(CONNECT_TIMEOUT, async {
        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Packet::ConnAck(_))) => return Ok(()),
                Ok(_) => {}
                Err(e) => return Err(e),
            }
        }
    })
    .await;

    let broker = format!("{}:{}", config.broker_host, config.broker_port);
    match connected {
        Ok(Ok(())) => {}
        Ok(Err(e)) => {
            return Err(Error::Startup(format!("cannot connect to broker {broker}: {e}")));
        }
        Err(_) => {
            return Err(Error::Startup(format!("timed out connecting to broker {broker}")));
        }
    }

    client
        .try_subscribe(filter, QoS::AtMostOnce)
        .map_err(|e| Error::Transport(e.to_string()))?;

    tracing::info!(subscription = name, %broker, filter, "subscribed");

    let (tx, rx) = mpsc::channel(config.channel_capacity);
    let pump = Pump {
        name: name.to_string(),
        filter: filter.to_string(),
        client,
        clock,
        tx,
    };
    let task = tokio::spawn(pump.run(eventloop, shutdown));

    Ok(Subscription::with_task(name, rx, task))
}

struct Pump {
    name: String,
    filter: String,
    client: AsyncClient,
    clock: Arc<MonotonicClock>,
    tx: mpsc::Sender<TransportEvent>,
}

impl Pump {
    async fn run(self, mut eventloop: EventLoop, mut shutdown: watch::Receiver<bool>) {
        while !*shutdown.borrow() {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                polled = eventloop.poll() => match polled {
                    Ok(Event::Incoming(Packet::Publish(publish))) => {
                        let event = TransportEvent {
                            topic: publish.topic,
                            payload: publish.payload.to_vec(),
                            received_at: self.clock.now(),
                        };
                        if self.tx.send(event).await.is_err() {
                            break;
                        }
                    }
                    Ok(Event::Incoming(Packet::ConnAck(_))) => {
                        tracing::info!(subscription = %self.name, "reconnected to broker");
                        if let Err(e) = self.client.try_subscribe(self.filter.as_str(), QoS::AtMostOnce) {
                            tracing::warn!(subscription = %self.name, error = %e, "failed to resubscribe");
                        }
                    }
                    Ok(_) => {}
                    Err(e) => {
                        tracing::warn!(subscription = %self.name, error = %e, "broker connection error");
                        tokio::time::sleep(RECONNECT_DELAY).await;
                    }
                }
            }
        }

        if self.client.try_disconnect().is_ok() {
            let _ = tokio::time::timeout(DISCONNECT_GRACE, async {
                loop {
                    match eventloop.poll().await {
                        Ok(Event::Outgoing(Outgoing::Disconnect)) | Err(_) => break,
                        Ok(_) => {}
                    }
                }
            })
            .await;
        }

        tracing::debug!(subscription = %self.name, "transport stopped");
    }
}
