use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use blescout_domain::advertising::AdvertisingPayload;
use blescout_domain::clock::Clock;
use blescout_domain::discover::DiscoveryEvent;

use crate::{EVENT_BUFFER, Radio, RadioEvent, ScanError};

/// Plays back sightings recorded as JSON lines, one [`DiscoveryEvent`] per
/// line. Each sighting is re-stamped with the clock when delivered. The end of
/// the file ends the "scan" the way a platform timeout would.
///
/// A line may carry only `advertising.rawData`; the other advertising fields
/// are then parsed out of the raw bytes.
pub struct ReplayRadio {
    path: PathBuf,
    pace: Duration,
    clock: Arc<dyn Clock>,
    pump: Mutex<Option<JoinHandle<()>>>,
}

impl ReplayRadio {
    pub fn new<P>(path: P, pace: Duration, clock: Arc<dyn Clock>) -> ReplayRadio
    where
        P: AsRef<Path>,
    {
        ReplayRadio {
            path: path.as_ref().to_path_buf(),
            pace,
            clock,
            pump: Mutex::new(None),
        }
    }
}

/// Parses one recorded line.
pub fn parse_line(line: &str) -> Result<DiscoveryEvent, serde_json::Error> {
    let mut event: DiscoveryEvent = serde_json::from_str(line)?;
    let ad = &event.advertising;
    let only_raw = ad.local_name.is_none()
        && ad.manufacturer_data.is_none()
        && ad.service_uuids.is_empty()
        && ad.service_data.is_empty();
    if only_raw && let Some(raw) = ad.raw_data.clone() {
        event.advertising = AdvertisingPayload::from_raw(&raw);
    }
    if event.name.is_none() {
        event.name.clone_from(&event.advertising.local_name);
    }
    Ok(event)
}

#[async_trait]
impl Radio for ReplayRadio {
    fn permission_granted(&self) -> bool {
        self.path.is_file()
    }

    async fn start(&self) -> Result<mpsc::Receiver<RadioEvent>, ScanError> {
        let file = File::open(&self.path).await?;
        let mut lines = BufReader::new(file).lines();
        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        let clock = Arc::clone(&self.clock);
        let pace = self.pace;
        let path = self.path.clone();

        let handle = tokio::spawn(async move {
            let mut number = 0usize;
            loop {
                let line = match lines.next_line().await {
                    Ok(Some(line)) => line,
                    Ok(None) => break,
                    Err(err) => {
                        warn!(%err, path = %path.display(), "replay read failed");
                        break;
                    }
                };
                number += 1;
                if line.trim().is_empty() {
                    continue;
                }
                match parse_line(&line) {
                    Ok(mut event) => {
                        event.date_time = clock.now();
                        if tx.send(RadioEvent::Discovered(event)).await.is_err() {
                            return;
                        }
                    }
                    Err(err) => warn!(%err, line = number, "skipping unreadable replay line"),
                }
                if !pace.is_zero() {
                    tokio::time::sleep(pace).await;
                }
            }
            debug!(path = %path.display(), "replay finished");
            let _ = tx.send(RadioEvent::Stopped).await;
        });
        if let Some(previous) = self.pump.lock().replace(handle) {
            previous.abort();
        }
        Ok(rx)
    }

    async fn stop(&self) -> Result<(), ScanError> {
        if let Some(handle) = self.pump.lock().take() {
            handle.abort();
        }
        Ok(())
    }
}
