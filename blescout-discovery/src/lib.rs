pub mod controller;
pub mod local;
pub mod replay;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

use blescout_domain::discover::DiscoveryEvent;

/// Capacity of the channel between a radio and the registry pump.
pub const EVENT_BUFFER: usize = 256;

#[derive(Debug, Clone, PartialEq)]
pub enum RadioEvent {
    Discovered(DiscoveryEvent),
    /// The platform ended the scan on its own (timeout, adapter reset, end
    /// of a recording).
    Stopped,
}

#[derive(Debug, Error)]
pub enum ScanError {
    #[error("scan permission not granted")]
    PermissionDenied,
    #[error("no Bluetooth adapters found")]
    NoAdapter,
    #[error("bluetooth: {0}")]
    Bluetooth(#[from] btleplug::Error),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("radio: {0}")]
    Radio(String),
}

/// The platform scanning primitive. A started radio delivers sightings on the
/// returned channel until it is stopped, or until it sends
/// [`RadioEvent::Stopped`] because the platform ended the scan.
#[async_trait]
pub trait Radio: Send + Sync {
    fn permission_granted(&self) -> bool;
    async fn start(&self) -> Result<mpsc::Receiver<RadioEvent>, ScanError>;
    async fn stop(&self) -> Result<(), ScanError>;
}
