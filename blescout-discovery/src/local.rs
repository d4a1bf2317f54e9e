use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use btleplug::api::{
    Central, CentralEvent, Manager as _, Peripheral as _, PeripheralProperties, ScanFilter,
};
use btleplug::platform::{Adapter, Manager, PeripheralId};

use blescout_domain::advertising::{
    AdvertisingPayload, manufacturer_data_with_company, normalize_tx_power,
};
use blescout_domain::clock::Clock;
use blescout_domain::discover::DiscoveryEvent;

use crate::{EVENT_BUFFER, Radio, RadioEvent, ScanError};

/// Scans with the host's first Bluetooth adapter.
pub struct LocalRadio {
    adapter: Adapter,
    clock: Arc<dyn Clock>,
    pump: Mutex<Option<JoinHandle<()>>>,
}

impl LocalRadio {
    pub async fn new(clock: Arc<dyn Clock>) -> Result<LocalRadio, ScanError> {
        let manager = Manager::new().await?;
        let adapter = manager
            .adapters()
            .await?
            .into_iter()
            .next()
            .ok_or(ScanError::NoAdapter)?;
        if let Ok(info) = adapter.adapter_info().await {
            info!(adapter = %info, "using Bluetooth adapter");
        }
        Ok(LocalRadio {
            adapter,
            clock,
            pump: Mutex::new(None),
        })
    }
}

#[async_trait]
impl Radio for LocalRadio {
    // Holding an adapter handle means the platform already let us in.
    fn permission_granted(&self) -> bool {
        true
    }

    async fn start(&self) -> Result<mpsc::Receiver<RadioEvent>, ScanError> {
        let mut events = self.adapter.events().await?;
        self.adapter.start_scan(ScanFilter::default()).await?;
        debug!("adapter scan started");

        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        let adapter = self.adapter.clone();
        let clock = Arc::clone(&self.clock);
        let handle = tokio::spawn(async move {
            while let Some(event) = events.next().await {
                let Some(id) = peripheral_of(event) else {
                    continue;
                };
                match sighting(&adapter, &id, clock.as_ref()).await {
                    Ok(Some(discovery)) => {
                        if tx.send(RadioEvent::Discovered(discovery)).await.is_err() {
                            return;
                        }
                    }
                    Ok(None) => trace!(?id, "peripheral without rssi, skipping"),
                    Err(err) => warn!(%err, "failed to read peripheral properties"),
                }
            }
            debug!("adapter event stream ended");
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
        self.adapter.stop_scan().await?;
        debug!("adapter scan stopped");
        Ok(())
    }
}

fn peripheral_of(event: CentralEvent) -> Option<PeripheralId> {
    use CentralEvent::{
        DeviceDiscovered, DeviceUpdated, ManufacturerDataAdvertisement, ServiceDataAdvertisement,
        ServicesAdvertisement,
    };
    match event {
        DeviceDiscovered(id)
        | DeviceUpdated(id)
        | ManufacturerDataAdvertisement { id, .. }
        | ServiceDataAdvertisement { id, .. }
        | ServicesAdvertisement { id, .. } => Some(id),
        _ => None,
    }
}

async fn sighting(
    adapter: &Adapter,
    id: &PeripheralId,
    clock: &dyn Clock,
) -> Result<Option<DiscoveryEvent>, btleplug::Error> {
    let peripheral = adapter.peripheral(id).await?;
    let Some(properties) = peripheral.properties().await? else {
        return Ok(None);
    };
    Ok(discovery_from_properties(&properties, clock))
}

/// Normalizes btleplug's already-split properties into a discovery event.
/// Sightings without an RSSI are dropped.
#[must_use]
pub fn discovery_from_properties(
    properties: &PeripheralProperties,
    clock: &dyn Clock,
) -> Option<DiscoveryEvent> {
    let rssi = properties.rssi?;
    let advertising = payload_from_properties(properties);
    let mut event = DiscoveryEvent::new(
        clock.now(),
        properties.address.to_string(),
        rssi,
        advertising,
    );
    event.name.clone_from(&properties.local_name);
    Some(event)
}

#[must_use]
pub fn payload_from_properties(properties: &PeripheralProperties) -> AdvertisingPayload {
    // several companies in one report is rare; keep the lowest ID so the
    // choice is stable between reports
    let manufacturer_data = properties
        .manufacturer_data
        .iter()
        .min_by_key(|(id, _)| **id)
        .map(|(id, data)| manufacturer_data_with_company(*id, data));

    AdvertisingPayload {
        local_name: properties.local_name.clone(),
        tx_power_level: properties.tx_power_level.and_then(normalize_tx_power),
        manufacturer_data,
        service_uuids: properties
            .services
            .iter()
            .map(|uuid| uuid.hyphenated().to_string())
            .collect(),
        service_data: properties
            .service_data
            .iter()
            .map(|(uuid, data)| (uuid.hyphenated().to_string(), data.clone()))
            .collect(),
        raw_data: None,
    }
}

#[cfg(test)]
mod test {
    use std::collections::HashMap;

    use btleplug::api::bleuuid::uuid_from_u16;
    use btleplug::api::{BDAddr, PeripheralProperties};
    use chrono::{TimeZone, Utc};

    use blescout_domain::clock::ManualClock;

    use super::{discovery_from_properties, payload_from_properties};

    fn properties() -> PeripheralProperties {
        PeripheralProperties {
            address: BDAddr::from([0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0xFF]),
            local_name: Some("Sensor".to_string()),
            tx_power_level: Some(-4),
            rssi: Some(-61),
            manufacturer_data: HashMap::from([
                (0x0059, vec![0x01, 0x02]),
                (0x004C, vec![0x10, 0x05]),
            ]),
            ..PeripheralProperties::default()
        }
    }

    #[test]
    fn company_id_is_put_back_in_front() {
        let payload = payload_from_properties(&properties());
        assert_eq!(payload.manufacturer_data, Some(vec![0x4C, 0x00, 0x10, 0x05]));
        assert_eq!(payload.company_id(), Some(0x004C));
        assert_eq!(payload.tx_power_level, Some(-4));
        assert_eq!(payload.raw_data, None);
    }

    #[test]
    fn service_uuids_are_lowercase_hyphenated() {
        let mut props = properties();
        props.services = vec![uuid_from_u16(0x180F)];
        props.service_data = HashMap::from([(uuid_from_u16(0xFEAA), vec![0x10])]);
        let payload = payload_from_properties(&props);
        assert_eq!(
            payload.service_uuids,
            vec!["0000180f-0000-1000-8000-00805f9b34fb".to_string()]
        );
        assert_eq!(
            payload.service_data.get("0000feaa-0000-1000-8000-00805f9b34fb"),
            Some(&vec![0x10])
        );
    }

    #[test]
    fn implausible_tx_power_is_dropped() {
        let mut props = properties();
        props.tx_power_level = Some(127);
        assert_eq!(payload_from_properties(&props).tx_power_level, None);
    }

    #[test]
    fn sighting_is_stamped_by_the_clock() {
        let now = Utc.timestamp_opt(42, 0).unwrap();
        let clock = ManualClock::new(now);
        let event = discovery_from_properties(&properties(), &clock).unwrap();
        assert_eq!(event.date_time, now);
        assert_eq!(event.address, "AA:BB:CC:DD:EE:FF");
        assert_eq!(event.name.as_deref(), Some("Sensor"));
        assert_eq!(event.rssi, -61);
    }

    #[test]
    fn sighting_without_rssi_is_dropped() {
        let mut props = properties();
        props.rssi = None;
        let clock = ManualClock::new(Utc.timestamp_opt(0, 0).unwrap());
        assert!(discovery_from_properties(&props, &clock).is_none());
    }
}
