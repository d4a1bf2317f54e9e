use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{advertising::AdvertisingPayload, discover::DiscoveryEvent};

#[derive(Serialize, Deserialize, PartialEq, Debug, Clone)]
pub struct Device {
    pub address: String,
    pub name: Option<String>,
    pub rssi: i16,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub advertising: AdvertisingPayload,
    pub favorite: bool,
    /// Order of first discovery within the registry.
    pub sequence: u64,
}

impl Device {
    #[must_use]
    pub fn from_event(event: &DiscoveryEvent, sequence: u64) -> Device {
        Device {
            address: event.address.clone(),
            name: event.name.clone(),
            rssi: event.rssi,
            first_seen: event.date_time,
            last_seen: event.date_time,
            advertising: event.advertising.clone(),
            favorite: false,
            sequence,
        }
    }

    /// Applies a newer sighting. `first_seen`, `favorite` and `sequence` are
    /// kept; a sighting without a name keeps the last known one.
    pub fn update(&mut self, event: &DiscoveryEvent) {
        self.last_seen = event.date_time.max(self.first_seen);
        self.rssi = event.rssi;
        self.advertising = event.advertising.clone();
        if event.name.is_some() {
            self.name.clone_from(&event.name);
        }
    }

    /// Name if present and not blank.
    #[must_use]
    pub fn display_name(&self) -> Option<&str> {
        self.name.as_deref().filter(|n| !n.trim().is_empty())
    }
}

#[cfg(test)]
mod test {
    use chrono::{TimeZone, Utc};

    use crate::{advertising::AdvertisingPayload, discover::DiscoveryEvent};

    use super::Device;

    #[test]
    fn update_keeps_identity_fields() {
        let first = Utc.timestamp_opt(10, 0).unwrap();
        let later = Utc.timestamp_opt(20, 0).unwrap();
        let mut device = Device::from_event(
            &DiscoveryEvent::new(first, "AA", -50, AdvertisingPayload::default())
                .with_name("Lamp"),
            3,
        );
        device.favorite = true;

        device.update(&DiscoveryEvent::new(later, "AA", -70, AdvertisingPayload::default()));

        assert_eq!(device.first_seen, first);
        assert_eq!(device.last_seen, later);
        assert_eq!(device.rssi, -70);
        assert_eq!(device.name.as_deref(), Some("Lamp"));
        assert!(device.favorite);
        assert_eq!(device.sequence, 3);
    }

    #[test]
    fn late_sighting_never_precedes_first_seen() {
        let first = Utc.timestamp_opt(10, 0).unwrap();
        let earlier = Utc.timestamp_opt(5, 0).unwrap();
        let mut device = Device::from_event(
            &DiscoveryEvent::new(first, "AA", -50, AdvertisingPayload::default()),
            0,
        );
        device.update(&DiscoveryEvent::new(earlier, "AA", -60, AdvertisingPayload::default()));
        assert!(device.first_seen <= device.last_seen);
    }

    #[test]
    fn blank_name_is_not_a_display_name() {
        let at = Utc.timestamp_opt(0, 0).unwrap();
        let event =
            DiscoveryEvent::new(at, "AA", -50, AdvertisingPayload::default()).with_name("  ");
        let mut device = Device::from_event(&event, 0);
        assert_eq!(device.display_name(), None);
        device.name = Some("Watch".to_string());
        assert_eq!(device.display_name(), Some("Watch"));
    }
}
