use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::advertising::AdvertisingPayload;

/// A single sighting of a peripheral, as reported by a radio.
#[derive(Serialize, Deserialize, PartialEq, Debug, Clone)]
pub struct DiscoveryEvent {
    pub date_time: DateTime<Utc>,
    pub address: String,
    #[serde(default)]
    pub name: Option<String>,
    pub rssi: i16,
    #[serde(default)]
    pub advertising: AdvertisingPayload,
}

impl DiscoveryEvent {
    #[must_use]
    pub fn new(
        date_time: DateTime<Utc>,
        address: impl Into<String>,
        rssi: i16,
        advertising: AdvertisingPayload,
    ) -> DiscoveryEvent {
        let advertising_name = advertising.local_name.clone();
        DiscoveryEvent {
            date_time,
            address: address.into(),
            name: advertising_name,
            rssi,
            advertising,
        }
    }

    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> DiscoveryEvent {
        self.name = Some(name.into());
        self
    }
}
