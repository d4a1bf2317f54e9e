//! Filter and sort over a registry snapshot.
//!
//! Every criterion that is set must hold (AND). A criterion that is unset,
//! empty or only whitespace always holds. A criterion that is set but cannot
//! be parsed (bad hex company ID, malformed byte pattern) matches nothing.

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};

use crate::{device::Device, pattern, snapshot::Snapshot};

#[derive(Serialize, Deserialize, PartialEq, Eq, Debug, Clone, Default)]
#[serde(default)]
pub struct FilterCriteria {
    pub rssi_floor: Option<i16>,
    pub name: Option<String>,
    pub address: Option<String>,
    pub named_only: bool,
    /// Comma separated list of UUIDs or UUID fragments.
    pub service_uuids: Option<String>,
    /// Hex company ID, `0x` prefix optional.
    pub company_id: Option<String>,
    /// Hex pairs and `xx` wildcards.
    pub raw_pattern: Option<String>,
}

#[derive(Serialize, Deserialize, PartialEq, Eq, Debug, Clone, Copy, Default)]
#[serde(rename_all = "kebab-case")]
pub enum SortKey {
    #[default]
    Insertion,
    Rssi,
    Name,
    FirstSeen,
    LastSeen,
}

fn active(value: Option<&String>) -> Option<&str> {
    value.map(|s| s.trim()).filter(|s| !s.is_empty())
}

fn contains_ignore_case(haystack: &str, needle: &str) -> bool {
    haystack.to_lowercase().contains(&needle.to_lowercase())
}

/// Parses `0x004C`, `004c` or `4C`.
#[must_use]
pub fn parse_company_id(value: &str) -> Option<u16> {
    let value = value.trim();
    let hex = value
        .strip_prefix("0x")
        .or_else(|| value.strip_prefix("0X"))
        .unwrap_or(value);
    u16::from_str_radix(hex, 16).ok()
}

impl FilterCriteria {
    #[must_use]
    pub fn matches(&self, device: &Device) -> bool {
        self.rssi_holds(device)
            && self.name_holds(device)
            && self.address_holds(device)
            && self.named_only_holds(device)
            && self.services_hold(device)
            && self.company_holds(device)
            && self.pattern_holds(device)
    }

    fn rssi_holds(&self, device: &Device) -> bool {
        self.rssi_floor.is_none_or(|floor| device.rssi >= floor)
    }

    fn name_holds(&self, device: &Device) -> bool {
        match active(self.name.as_ref()) {
            None => true,
            Some(wanted) => device
                .name
                .as_deref()
                .is_some_and(|name| contains_ignore_case(name, wanted)),
        }
    }

    fn address_holds(&self, device: &Device) -> bool {
        active(self.address.as_ref())
            .is_none_or(|wanted| contains_ignore_case(&device.address, wanted))
    }

    fn named_only_holds(&self, device: &Device) -> bool {
        !self.named_only || device.display_name().is_some()
    }

    fn services_hold(&self, device: &Device) -> bool {
        let Some(list) = active(self.service_uuids.as_ref()) else {
            return true;
        };
        let wanted: Vec<String> = list
            .split(',')
            .map(|s| s.trim().to_lowercase())
            .filter(|s| !s.is_empty())
            .collect();
        if wanted.is_empty() {
            return true;
        }
        device.advertising.service_uuids.iter().any(|uuid| {
            let uuid = uuid.to_lowercase();
            wanted.iter().any(|w| uuid.contains(w.as_str()))
        })
    }

    fn company_holds(&self, device: &Device) -> bool {
        let Some(value) = active(self.company_id.as_ref()) else {
            return true;
        };
        match (parse_company_id(value), device.advertising.company_id()) {
            (Some(wanted), Some(actual)) => wanted == actual,
            _ => false,
        }
    }

    fn pattern_holds(&self, device: &Device) -> bool {
        let Some(value) = active(self.raw_pattern.as_ref()) else {
            return true;
        };
        match device.advertising.raw_data.as_deref() {
            Some(raw) if !raw.is_empty() => pattern::matches(raw, value),
            _ => false,
        }
    }
}

fn sort_name(device: &Device) -> String {
    device.name.as_deref().unwrap_or("Unknown").to_lowercase()
}

impl SortKey {
    fn compare(self, a: &Device, b: &Device) -> Ordering {
        match self {
            SortKey::Insertion => Ordering::Equal,
            SortKey::Rssi => b.rssi.cmp(&a.rssi),
            SortKey::Name => sort_name(a).cmp(&sort_name(b)),
            SortKey::FirstSeen => a.first_seen.cmp(&b.first_seen),
            SortKey::LastSeen => b.last_seen.cmp(&a.last_seen),
        }
    }
}

/// Filters then sorts a snapshot. Insertion order is a pass-through of the
/// snapshot order; the other keys sort stably.
#[must_use]
pub fn apply(snapshot: &Snapshot, criteria: &FilterCriteria, sort: SortKey) -> Vec<Device> {
    let mut devices: Vec<Device> = snapshot
        .devices()
        .iter()
        .filter(|d| criteria.matches(d))
        .cloned()
        .collect();
    if sort != SortKey::Insertion {
        devices.sort_by(|a, b| sort.compare(a, b));
    }
    devices
}

/// A filter and sort order bundled together, as consumers hold them.
#[derive(Serialize, Deserialize, PartialEq, Eq, Debug, Clone, Default)]
#[serde(default)]
pub struct View {
    pub criteria: FilterCriteria,
    pub sort: SortKey,
}

impl View {
    #[must_use]
    pub fn new(criteria: FilterCriteria, sort: SortKey) -> View {
        View { criteria, sort }
    }

    #[must_use]
    pub fn apply(&self, snapshot: &Snapshot) -> Vec<Device> {
        apply(snapshot, &self.criteria, self.sort)
    }
}
