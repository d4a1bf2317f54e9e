use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use rumqttc::{AsyncClient, Event, MqttOptions, Outgoing, Packet, QoS};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{GatewayError, Link, Publisher};

const KEEP_ALIVE: Duration = Duration::from_secs(30);
const REQUEST_CAPACITY: usize = 16;
/// How long `close` lets the event loop write DISCONNECT before cutting it off.
const DISCONNECT_GRACE: Duration = Duration::from_secs(1);

/// Publishes to one topic on a broker, QoS 1, never retained.
///
/// The connection is made once. If it drops, the link goes
/// [`Link::Down`] and stays there; the caller decides whether to reconnect.
pub struct MqttPublisher {
    client: AsyncClient,
    topic: String,
    link: Arc<watch::Sender<Link>>,
    token: CancellationToken,
    events: Mutex<Option<JoinHandle<()>>>,
}

#[must_use]
pub fn client_id() -> String {
    // brokers may refuse IDs over 23 characters
    let random = uuid::Uuid::new_v4().simple().to_string();
    format!("blescout-{}", &random[..12])
}

impl MqttPublisher {
    /// Starts connecting in the background; watch [`Publisher::link`] to
    /// learn when the broker accepts the session.
    pub fn connect(
        broker: &str,
        port: u16,
        topic: &str,
        tls: bool,
        username: Option<String>,
        password: Option<String>,
    ) -> MqttPublisher {
        let mut options = MqttOptions::new(client_id(), broker, port);
        options.set_keep_alive(KEEP_ALIVE);
        options.set_clean_session(true);
        if let Some(username) = username {
            options.set_credentials(username, password.unwrap_or_default());
        }
        if tls {
            options.set_transport(rumqttc::Transport::tls_with_default_config());
        }

        let (client, mut eventloop) = AsyncClient::new(options, REQUEST_CAPACITY);
        let link = Arc::new(watch::Sender::new(Link::Connecting));
        let token = CancellationToken::new();

        let task_link = Arc::clone(&link);
        let task_token = token.clone();
        let broker = broker.to_string();
        let events = tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    () = task_token.cancelled() => break,
                    event = eventloop.poll() => event,
                };
                match event {
                    Ok(Event::Incoming(Packet::ConnAck(_))) => {
                        info!(%broker, port, "connected to MQTT broker");
                        task_link.send_replace(Link::Up);
                    }
                    Ok(Event::Incoming(Packet::Disconnect)) => {
                        let reason = "broker closed the session".to_string();
                        task_link.send_replace(Link::Down(reason));
                        break;
                    }
                    Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                        debug!(%broker, "MQTT session closed");
                        task_link.send_replace(Link::Down("session closed".to_string()));
                        break;
                    }
                    Ok(_) => {}
                    Err(err) => {
                        warn!(%broker, port, %err, "MQTT connection lost");
                        task_link.send_replace(Link::Down(err.to_string()));
                        break;
                    }
                }
            }
            debug!(%broker, "MQTT event loop finished");
        });

        MqttPublisher {
            client,
            topic: topic.to_string(),
            link,
            token,
            events: Mutex::new(Some(events)),
        }
    }
}

#[async_trait]
impl Publisher for MqttPublisher {
    async fn publish(&self, body: Vec<u8>) -> Result<(), GatewayError> {
        if *self.link.borrow() != Link::Up {
            return Err(GatewayError::NotConnected);
        }
        self.client
            .publish(self.topic.as_str(), QoS::AtLeastOnce, false, body)
            .await?;
        Ok(())
    }

    async fn close(&self) {
        let events = self.events.lock().take();
        if let Err(err) = self.client.disconnect().await {
            debug!(%err, "MQTT disconnect request not delivered");
        } else if let Some(events) = events {
            // the event loop stops itself once DISCONNECT is on the wire
            let finished = tokio::time::timeout(DISCONNECT_GRACE, events).await;
            if finished.is_err() {
                debug!("MQTT event loop did not write DISCONNECT in time");
            }
        }
        self.token.cancel();
    }

    fn link(&self) -> watch::Receiver<Link> {
        self.link.subscribe()
    }
}
