//! Scan lifecycle: one continuous "scanning" session for callers, on top of a
//! radio whose scans the platform may end at any time.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, trace, warn};

use blescout_domain::clock::Clock;
use blescout_domain::registry::{EVICTION_PERIOD, EVICTION_WINDOW, RegistryReader, SharedRegistry};

use crate::{Radio, RadioEvent, ScanError};

/// Pause before restarting a scan the platform ended.
pub const RESTART_DELAY: Duration = Duration::from_millis(100);

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanState {
    Idle,
    Scanning,
}

#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
pub struct ScanStatus {
    pub state: ScanState,
    pub auto_restart: bool,
    pub last_error: Option<String>,
}

impl Default for ScanStatus {
    fn default() -> ScanStatus {
        ScanStatus {
            state: ScanState::Idle,
            auto_restart: false,
            last_error: None,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(default)]
pub struct SweepConfig {
    pub period_secs: u64,
    pub window_secs: u64,
}

impl Default for SweepConfig {
    fn default() -> SweepConfig {
        SweepConfig {
            period_secs: EVICTION_PERIOD.num_seconds().unsigned_abs(),
            window_secs: EVICTION_WINDOW.num_seconds().unsigned_abs(),
        }
    }
}

/// State shared between the controller and its pump task.
struct Shared {
    radio: Arc<dyn Radio>,
    registry: SharedRegistry,
    auto_restart: AtomicBool,
    status: watch::Sender<ScanStatus>,
    restart_delay: Duration,
}

impl Shared {
    fn publish(&self, state: ScanState, last_error: Option<String>) {
        let auto_restart = self.auto_restart.load(Ordering::SeqCst);
        self.status.send_replace(ScanStatus {
            state,
            auto_restart,
            last_error,
        });
    }
}

/// Owns the registry for writing and the radio's scan lifecycle.
pub struct ScanController {
    shared: Arc<Shared>,
    clock: Arc<dyn Clock>,
    pump: Mutex<Option<JoinHandle<()>>>,
}

impl ScanController {
    #[must_use]
    pub fn new(radio: Arc<dyn Radio>, clock: Arc<dyn Clock>) -> ScanController {
        ScanController::with_restart_delay(radio, clock, RESTART_DELAY)
    }

    #[must_use]
    pub fn with_restart_delay(
        radio: Arc<dyn Radio>,
        clock: Arc<dyn Clock>,
        restart_delay: Duration,
    ) -> ScanController {
        let (status, _) = watch::channel(ScanStatus::default());
        ScanController {
            shared: Arc::new(Shared {
                radio,
                registry: SharedRegistry::new(),
                auto_restart: AtomicBool::new(false),
                status,
                restart_delay,
            }),
            clock,
            pump: Mutex::new(None),
        }
    }

    #[must_use]
    pub fn reader(&self) -> RegistryReader {
        self.shared.registry.reader()
    }

    #[must_use]
    pub fn status(&self) -> ScanStatus {
        self.shared.status.borrow().clone()
    }

    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<ScanStatus> {
        self.shared.status.subscribe()
    }

    /// Starts scanning from `Idle`; a no-op while already scanning.
    ///
    /// Clears the registry. Fails with [`ScanError::PermissionDenied`] if the
    /// platform has not granted scanning.
    pub async fn start(&self) -> Result<(), ScanError> {
        let mut pump = self.pump.lock().await;
        if self.status().state == ScanState::Scanning {
            debug!("already scanning, ignoring start");
            return Ok(());
        }
        if !self.shared.radio.permission_granted() {
            let err = ScanError::PermissionDenied;
            warn!(%err, "refusing to start scan");
            self.shared.publish(ScanState::Idle, Some(err.to_string()));
            return Err(err);
        }

        self.shared.auto_restart.store(true, Ordering::SeqCst);
        self.shared.registry.write().clear();
        let events = match self.shared.radio.start().await {
            Ok(events) => events,
            Err(err) => {
                warn!(%err, "scan start failed");
                self.shared.auto_restart.store(false, Ordering::SeqCst);
                self.shared.publish(ScanState::Idle, Some(err.to_string()));
                return Err(err);
            }
        };
        info!("scan started");
        self.shared.publish(ScanState::Scanning, None);

        let next = tokio::spawn(run_pump(Arc::clone(&self.shared), events));
        if let Some(previous) = pump.replace(next) {
            previous.abort();
        }
        Ok(())
    }

    /// Stops scanning and cancels any pending restart. A no-op while idle.
    pub async fn stop(&self) -> Result<(), ScanError> {
        let mut pump = self.pump.lock().await;
        self.shared.auto_restart.store(false, Ordering::SeqCst);
        if let Some(handle) = pump.take() {
            handle.abort();
        }
        if self.status().state == ScanState::Idle {
            self.shared.publish(ScanState::Idle, self.status().last_error);
            return Ok(());
        }

        let result = self.shared.radio.stop().await;
        match &result {
            Ok(()) => {
                info!("scan stopped");
                self.shared.publish(ScanState::Idle, None);
            }
            Err(err) => {
                warn!(%err, "scan stop failed");
                self.shared.publish(ScanState::Idle, Some(err.to_string()));
            }
        }
        result
    }

    /// Flips a device's favorite flag. Unknown addresses are ignored.
    pub fn toggle_favorite(&self, address: &str) -> Option<bool> {
        let favorite = self.shared.registry.write().toggle_favorite(address);
        debug!(address, ?favorite, "favorite toggled");
        favorite
    }

    /// Forgets every device, favorites included.
    pub fn clear(&self) {
        self.shared.registry.write().clear();
    }

    /// Spawns the periodic eviction of stale devices. It runs regardless of
    /// scan state; abort the handle to cancel it.
    #[must_use]
    pub fn eviction_sweep(&self, config: SweepConfig) -> JoinHandle<()> {
        let registry = self.shared.registry.clone();
        let clock = Arc::clone(&self.clock);
        let period = Duration::from_secs(config.period_secs.max(1));
        let window = i64::try_from(config.window_secs)
            .ok()
            .and_then(chrono::Duration::try_seconds)
            .unwrap_or(EVICTION_WINDOW);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let removed = registry.write().evict_stale(clock.now(), window);
                if removed > 0 {
                    debug!(removed, "evicted stale devices");
                }
            }
        })
    }
}

async fn run_pump(shared: Arc<Shared>, mut events: mpsc::Receiver<RadioEvent>) {
    loop {
        match events.recv().await {
            Some(RadioEvent::Discovered(event)) => {
                trace!(address = %event.address, rssi = event.rssi, "sighting");
                shared.registry.write().upsert(&event);
            }
            Some(RadioEvent::Stopped) | None => {
                if !shared.auto_restart.load(Ordering::SeqCst) {
                    shared.publish(ScanState::Idle, None);
                    return;
                }
                info!("scan ended by platform, restarting");
                tokio::time::sleep(shared.restart_delay).await;
                if !shared.auto_restart.load(Ordering::SeqCst) {
                    return;
                }
                match shared.radio.start().await {
                    Ok(next) => {
                        debug!("scan restarted");
                        events = next;
                    }
                    Err(err) => {
                        warn!(%err, "scan restart failed, giving up");
                        shared.auto_restart.store(false, Ordering::SeqCst);
                        shared.publish(ScanState::Idle, Some(err.to_string()));
                        return;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod test {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;
    use chrono::{DateTime, TimeZone, Utc};
    use parking_lot::Mutex;
    use tokio::sync::mpsc;

    use blescout_domain::advertising::AdvertisingPayload;
    use blescout_domain::clock::ManualClock;
    use blescout_domain::discover::DiscoveryEvent;

    use crate::{Radio, RadioEvent, ScanError};

    use super::{ScanController, ScanState, SweepConfig};

    #[derive(Default)]
    struct ScriptedRadio {
        denied: AtomicBool,
        starts: AtomicUsize,
        stops: AtomicUsize,
        fail_from_start: Mutex<Option<usize>>,
        senders: Mutex<Vec<mpsc::Sender<RadioEvent>>>,
    }

    impl ScriptedRadio {
        fn latest(&self) -> mpsc::Sender<RadioEvent> {
            self.senders.lock().last().cloned().unwrap()
        }
    }

    #[async_trait]
    impl Radio for ScriptedRadio {
        fn permission_granted(&self) -> bool {
            !self.denied.load(Ordering::SeqCst)
        }

        async fn start(&self) -> Result<mpsc::Receiver<RadioEvent>, ScanError> {
            let n = self.starts.fetch_add(1, Ordering::SeqCst) + 1;
            if self.fail_from_start.lock().is_some_and(|from| n >= from) {
                return Err(ScanError::Radio("adapter gone".to_string()));
            }
            let (tx, rx) = mpsc::channel(16);
            self.senders.lock().push(tx);
            Ok(rx)
        }

        async fn stop(&self) -> Result<(), ScanError> {
            self.stops.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    fn sighting(secs: i64, address: &str, rssi: i16) -> RadioEvent {
        RadioEvent::Discovered(DiscoveryEvent::new(
            at(secs),
            address,
            rssi,
            AdvertisingPayload::default(),
        ))
    }

    fn controller(radio: &Arc<ScriptedRadio>) -> (ScanController, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(at(0)));
        let controller = ScanController::new(radio.clone(), clock.clone());
        (controller, clock)
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(1)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn refuses_to_start_without_permission() {
        let radio = Arc::new(ScriptedRadio::default());
        radio.denied.store(true, Ordering::SeqCst);
        let (controller, _) = controller(&radio);

        assert!(matches!(controller.start().await, Err(ScanError::PermissionDenied)));
        assert_eq!(controller.status().state, ScanState::Idle);
        assert_eq!(radio.starts.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn same_address_twice_is_one_updated_entry() {
        let radio = Arc::new(ScriptedRadio::default());
        let (controller, _) = controller(&radio);
        controller.start().await.unwrap();

        let tx = radio.latest();
        tx.send(sighting(0, "AA:BB:CC:DD:EE:FF", -50)).await.unwrap();
        tx.send(sighting(1, "AA:BB:CC:DD:EE:FF", -60)).await.unwrap();
        settle().await;

        let snapshot = controller.reader().snapshot();
        assert_eq!(snapshot.len(), 1);
        let device = &snapshot.devices()[0];
        assert_eq!(device.rssi, -60);
        assert_eq!(device.first_seen, at(0));
        assert_eq!(device.last_seen, at(1));
    }

    #[tokio::test(start_paused = true)]
    async fn start_while_scanning_is_a_no_op() {
        let radio = Arc::new(ScriptedRadio::default());
        let (controller, _) = controller(&radio);
        controller.start().await.unwrap();
        radio.latest().send(sighting(0, "AA", -50)).await.unwrap();
        settle().await;

        controller.start().await.unwrap();

        assert_eq!(radio.starts.load(Ordering::SeqCst), 1);
        assert_eq!(controller.reader().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn start_clears_previous_session() {
        let radio = Arc::new(ScriptedRadio::default());
        let (controller, _) = controller(&radio);
        controller.start().await.unwrap();
        radio.latest().send(sighting(0, "AA", -50)).await.unwrap();
        settle().await;
        controller.stop().await.unwrap();
        assert_eq!(controller.reader().len(), 1);

        controller.start().await.unwrap();
        assert!(controller.reader().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn platform_stop_restarts_after_delay_keeping_devices() {
        let radio = Arc::new(ScriptedRadio::default());
        let (controller, _) = controller(&radio);
        controller.start().await.unwrap();
        let tx = radio.latest();
        tx.send(sighting(0, "AA", -50)).await.unwrap();
        tx.send(RadioEvent::Stopped).await.unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(radio.starts.load(Ordering::SeqCst), 1);

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(radio.starts.load(Ordering::SeqCst), 2);
        let status = controller.status();
        assert_eq!(status.state, ScanState::Scanning);
        assert!(status.auto_restart);
        assert_eq!(controller.reader().len(), 1);

        radio.latest().send(sighting(1, "BB", -70)).await.unwrap();
        settle().await;
        assert_eq!(controller.reader().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_restart_settles_idle() {
        let radio = Arc::new(ScriptedRadio::default());
        *radio.fail_from_start.lock() = Some(2);
        let (controller, _) = controller(&radio);
        let mut status = controller.subscribe();
        controller.start().await.unwrap();

        radio.latest().send(RadioEvent::Stopped).await.unwrap();
        tokio::time::sleep(Duration::from_millis(150)).await;

        status.changed().await.unwrap();
        let status = controller.status();
        assert_eq!(status.state, ScanState::Idle);
        assert!(!status.auto_restart);
        assert_eq!(status.last_error.as_deref(), Some("radio: adapter gone"));
    }

    #[tokio::test(start_paused = true)]
    async fn stop_cancels_pending_restart() {
        let radio = Arc::new(ScriptedRadio::default());
        let (controller, _) = controller(&radio);
        controller.start().await.unwrap();
        radio.latest().send(RadioEvent::Stopped).await.unwrap();
        settle().await;

        controller.stop().await.unwrap();
        tokio::time::sleep(Duration::from_millis(500)).await;

        assert_eq!(radio.starts.load(Ordering::SeqCst), 1);
        assert_eq!(radio.stops.load(Ordering::SeqCst), 1);
        let status = controller.status();
        assert_eq!(status.state, ScanState::Idle);
        assert!(!status.auto_restart);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_while_idle_is_a_no_op() {
        let radio = Arc::new(ScriptedRadio::default());
        let (controller, _) = controller(&radio);
        controller.stop().await.unwrap();
        assert_eq!(radio.stops.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn sweep_evicts_stale_devices_but_not_favorites() {
        let radio = Arc::new(ScriptedRadio::default());
        let (controller, clock) = controller(&radio);
        controller.start().await.unwrap();
        let tx = radio.latest();
        tx.send(sighting(0, "OLD", -50)).await.unwrap();
        tx.send(sighting(0, "FAV", -50)).await.unwrap();
        settle().await;
        assert_eq!(controller.toggle_favorite("FAV"), Some(true));
        assert_eq!(controller.toggle_favorite("NOPE"), None);

        let sweep = controller.eviction_sweep(SweepConfig::default());
        clock.advance(chrono::Duration::minutes(6));
        tokio::time::sleep(Duration::from_secs(31)).await;

        let reader = controller.reader();
        assert!(reader.get("OLD").is_none());
        assert!(reader.get("FAV").is_some());
        sweep.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn sweep_keeps_fresh_devices() {
        let radio = Arc::new(ScriptedRadio::default());
        let (controller, clock) = controller(&radio);
        controller.start().await.unwrap();
        radio.latest().send(sighting(0, "AA", -50)).await.unwrap();
        settle().await;

        let sweep = controller.eviction_sweep(SweepConfig::default());
        clock.advance(chrono::Duration::minutes(4));
        tokio::time::sleep(Duration::from_secs(31)).await;

        assert_eq!(controller.reader().len(), 1);
        sweep.abort();
    }
}
