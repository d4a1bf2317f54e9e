use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use blescout_discovery::Radio;
use blescout_discovery::controller::{ScanController, ScanStatus, SweepConfig};
use blescout_domain::clock::Clock;
use blescout_domain::device::Device;
use blescout_domain::filter::View;
use blescout_domain::registry::RegistryReader;
use blescout_sinks::forwarder::{Forwarder, GatewayState};
use blescout_sinks::gateway::GatewayConfig;

/// Everything one run of the scanner owns: the scan, the eviction sweep and
/// the optional gateway forwarding.
pub struct Session {
    controller: ScanController,
    view: View,
    sweep: JoinHandle<()>,
    forwarder: Forwarder,
    status: watch::Receiver<ScanStatus>,
}

impl Session {
    pub async fn start(
        radio: Arc<dyn Radio>,
        clock: Arc<dyn Clock>,
        view: View,
        sweep: SweepConfig,
        gateway: Option<&GatewayConfig>,
    ) -> Result<Session> {
        let controller = ScanController::new(radio, Arc::clone(&clock));
        let status = controller.subscribe();
        controller.start().await.context("starting scan")?;
        let sweep = controller.eviction_sweep(sweep);

        let forwarder = Forwarder::new(controller.reader(), view.clone(), clock);
        if let Some(config) = gateway {
            if let Err(err) = forwarder.enable(config).await {
                sweep.abort();
                controller.stop().await.ok();
                return Err(err).context("enabling gateway forwarding");
            }
        }
        info!("session started");

        Ok(Session {
            controller,
            view,
            sweep,
            forwarder,
            status,
        })
    }

    #[must_use]
    pub fn reader(&self) -> RegistryReader {
        self.controller.reader()
    }

    /// Devices passing the session's filters, in its sort order.
    #[must_use]
    pub fn table(&self) -> Vec<Device> {
        self.view.apply(&self.controller.reader().snapshot())
    }

    #[must_use]
    pub fn scan_status(&self) -> ScanStatus {
        self.status.borrow().clone()
    }

    #[must_use]
    pub fn gateway_state(&self) -> GatewayState {
        self.forwarder.state()
    }

    /// Marks each listed address as a favorite once it has been seen.
    /// Returns how many were newly marked.
    pub fn mark_favorites(&self, addresses: &[String]) -> usize {
        let reader = self.controller.reader();
        let mut marked = 0;
        for address in addresses {
            let unmarked = reader.get(address).is_some_and(|d| !d.favorite);
            if unmarked && self.controller.toggle_favorite(address) == Some(true) {
                debug!(%address, "marked favorite");
                marked += 1;
            }
        }
        marked
    }

    pub async fn shutdown(self) -> Result<()> {
        self.forwarder.disable().await;
        self.sweep.abort();
        let stopped = self.controller.stop().await.context("stopping scan");
        drop(self.status);
        info!("session ended");
        stopped
    }
}
