//! Periodic forwarding of the filtered registry to a gateway.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use blescout_domain::clock::Clock;
use blescout_domain::filter::View;
use blescout_domain::registry::RegistryReader;

use crate::gateway::{self, GatewayConfig, GatewayError, Link, Publisher};

const COUNTDOWN_STEP: Duration = Duration::from_secs(1);

#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
pub enum GatewayState {
    Disabled,
    AwaitingConnection,
    Connected {
        last_publish: DateTime<Utc>,
        /// Whole seconds until the next publish.
        next_publish_in: u64,
    },
    Error(String),
}

struct Active {
    token: CancellationToken,
    publisher: Arc<dyn Publisher>,
    publish_task: JoinHandle<()>,
    countdown: JoinHandle<()>,
}

/// What one publish needs; shared with the publish task.
#[derive(Clone)]
struct Cycle {
    reader: RegistryReader,
    view: Arc<View>,
    clock: Arc<dyn Clock>,
    state: Arc<watch::Sender<GatewayState>>,
    publisher: Arc<dyn Publisher>,
}

impl Cycle {
    async fn publish_once(&self) -> Result<usize, GatewayError> {
        let devices = self.view.apply(&self.reader.snapshot());
        let body = gateway::encode(&devices)?;
        self.publisher.publish(body).await?;
        Ok(devices.len())
    }
}

pub struct Forwarder {
    reader: RegistryReader,
    view: Arc<View>,
    clock: Arc<dyn Clock>,
    state: Arc<watch::Sender<GatewayState>>,
    active: Mutex<Option<Active>>,
}

impl Forwarder {
    #[must_use]
    pub fn new(reader: RegistryReader, view: View, clock: Arc<dyn Clock>) -> Forwarder {
        Forwarder {
            reader,
            view: Arc::new(view),
            clock,
            state: Arc::new(watch::Sender::new(GatewayState::Disabled)),
            active: Mutex::new(None),
        }
    }

    #[must_use]
    pub fn state(&self) -> GatewayState {
        self.state.borrow().clone()
    }

    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<GatewayState> {
        self.state.subscribe()
    }

    /// True while the publish timer is running.
    #[must_use]
    pub fn is_armed(&self) -> bool {
        self.active
            .lock()
            .as_ref()
            .is_some_and(|a| !a.token.is_cancelled() && !a.publish_task.is_finished())
    }

    /// Connects to the gateway described by `config` and starts forwarding.
    /// Replaces any forwarding already running.
    pub async fn enable(&self, config: &GatewayConfig) -> Result<(), GatewayError> {
        let publisher = gateway::connect(config)?;
        info!(
            transport = ?config.transport,
            interval = config.interval_seconds,
            "forwarding enabled"
        );
        self.enable_with(publisher, config.interval()).await;
        Ok(())
    }

    /// Starts forwarding through an already opened publisher: one publish
    /// right away, then one every `interval`. Failed publishes are retried on
    /// the next tick.
    pub async fn enable_with(&self, publisher: Arc<dyn Publisher>, interval: Duration) {
        self.shut_down().await;
        self.state.send_replace(GatewayState::AwaitingConnection);

        let token = CancellationToken::new();
        let deadline = Arc::new(Mutex::new(Instant::now()));
        let cycle = Cycle {
            reader: self.reader.clone(),
            view: Arc::clone(&self.view),
            clock: Arc::clone(&self.clock),
            state: Arc::clone(&self.state),
            publisher: Arc::clone(&publisher),
        };
        let publish_task = tokio::spawn(run_publish(
            cycle,
            interval,
            token.clone(),
            Arc::clone(&deadline),
        ));
        let countdown = tokio::spawn(run_countdown(
            Arc::clone(&self.state),
            token.clone(),
            deadline,
        ));
        *self.active.lock() = Some(Active {
            token,
            publisher,
            publish_task,
            countdown,
        });
    }

    /// Stops forwarding and disconnects. A publish already in flight may
    /// still complete, but it no longer changes state or rearms the timer.
    pub async fn disable(&self) {
        if self.shut_down().await {
            info!("forwarding disabled");
        }
        self.state.send_replace(GatewayState::Disabled);
    }

    async fn shut_down(&self) -> bool {
        let active = self.active.lock().take();
        let Some(active) = active else {
            return false;
        };
        active.token.cancel();
        active.countdown.abort();
        active.publisher.close().await;
        true
    }
}

async fn run_publish(
    cycle: Cycle,
    interval: Duration,
    token: CancellationToken,
    deadline: Arc<Mutex<Instant>>,
) {
    let mut link = cycle.publisher.link();

    // give a fresh connection up to one interval to come up
    let link_settled = tokio::time::timeout(interval, async {
        link.wait_for(|l| *l != Link::Connecting).await.map(|_| ())
    });
    tokio::select! {
        () = token.cancelled() => return,
        _ = link_settled => {}
    }

    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut link_open = true;
    loop {
        tokio::select! {
            () = token.cancelled() => return,
            changed = link.changed(), if link_open => {
                if changed.is_err() {
                    link_open = false;
                    continue;
                }
                let current = link.borrow_and_update().clone();
                if let Link::Down(reason) = current {
                    warn!(%reason, "gateway link down");
                    let disconnected = GatewayState::Error(GatewayError::NotConnected.to_string());
                    set_unless_disabled(&cycle.state, &token, disconnected);
                }
                continue;
            }
            _ = ticker.tick() => {}
        }

        *deadline.lock() = Instant::now() + interval;
        let next = match cycle.publish_once().await {
            Ok(count) => {
                debug!(count, "snapshot forwarded");
                GatewayState::Connected {
                    last_publish: cycle.clock.now(),
                    next_publish_in: interval.as_secs(),
                }
            }
            Err(err) => {
                warn!(%err, "forwarding failed, retrying next interval");
                GatewayState::Error(err.to_string())
            }
        };
        if !set_unless_disabled(&cycle.state, &token, next) {
            debug!("publish completed after forwarding was disabled");
            return;
        }
    }
}

/// Replaces the state unless forwarding has been disabled. The check runs
/// under the state lock, so it is ordered against `disable` publishing
/// `Disabled`.
fn set_unless_disabled(
    state: &watch::Sender<GatewayState>,
    token: &CancellationToken,
    next: GatewayState,
) -> bool {
    state.send_if_modified(|current| {
        if token.is_cancelled() {
            return false;
        }
        *current = next;
        true
    })
}

async fn run_countdown(
    state: Arc<watch::Sender<GatewayState>>,
    token: CancellationToken,
    deadline: Arc<Mutex<Instant>>,
) {
    let mut ticker = tokio::time::interval_at(Instant::now() + COUNTDOWN_STEP, COUNTDOWN_STEP);
    loop {
        tokio::select! {
            () = token.cancelled() => return,
            _ = ticker.tick() => {}
        }
        let remaining = deadline.lock().saturating_duration_since(Instant::now());
        let secs = remaining.as_secs() + u64::from(remaining.subsec_nanos() > 0);
        state.send_if_modified(|current| match current {
            GatewayState::Connected {
                next_publish_in, ..
            } if *next_publish_in != secs => {
                *next_publish_in = secs;
                true
            }
            _ => false,
        });
    }
}
