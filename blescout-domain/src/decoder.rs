//! Human-readable interpretation of advertising payloads.
//!
//! Everything here is best effort: a field that is too short or otherwise
//! malformed is left out of the result, the rest of the payload is still
//! decoded.

use std::fmt::Write as _;

use serde::Serialize;
use uuid::Uuid;

use crate::advertising::{AdvertisingPayload, short_uuid, trim_trailing_zeros};

pub const APPLE_COMPANY_ID: u16 = 0x004C;

const COMPANY_ID_OFFSET: usize = 0;
const APPLE_SUB_TYPE_OFFSET: usize = COMPANY_ID_OFFSET + 2;
const IBEACON_MIN_REMAINING: usize = 21;

const COMPANIES: &[(u16, &str)] = &[
    (0x0001, "Nokia"),
    (0x0002, "Intel"),
    (0x0003, "IBM"),
    (0x0006, "Microsoft"),
    (0x000D, "Texas Instruments"),
    (0x000F, "Broadcom"),
    (0x004C, "Apple"),
    (0x0059, "Nordic Semiconductor"),
    (0x0075, "Samsung"),
    (0x0087, "Garmin"),
    (0x009E, "Bose"),
    (0x00E0, "Google"),
    (0x012D, "Sony"),
    (0x0131, "Cypress Semiconductor"),
    (0x0157, "Huami"),
    (0x027D, "Huawei"),
    (0x038F, "Xiaomi"),
    (0x0499, "Ruuvi Innovations"),
];

const SERVICES: &[(u16, &str)] = &[
    (0x1800, "Generic Access"),
    (0x1801, "Generic Attribute"),
    (0x1802, "Immediate Alert"),
    (0x1803, "Link Loss"),
    (0x1804, "Tx Power"),
    (0x1805, "Current Time"),
    (0x1808, "Glucose"),
    (0x1809, "Health Thermometer"),
    (0x180A, "Device Information"),
    (0x180D, "Heart Rate"),
    (0x180F, "Battery"),
    (0x1810, "Blood Pressure"),
    (0x1812, "Human Interface Device"),
    (0x1813, "Scan Parameters"),
    (0x1814, "Running Speed and Cadence"),
    (0x1816, "Cycling Speed and Cadence"),
    (0x1818, "Cycling Power"),
    (0x1819, "Location and Navigation"),
    (0x181A, "Environmental Sensing"),
    (0x181B, "Body Composition"),
    (0x181C, "User Data"),
    (0x181D, "Weight Scale"),
    (0x1826, "Fitness Machine"),
    (0x1827, "Mesh Provisioning"),
    (0x1828, "Mesh Proxy"),
    (0xFD6F, "Exposure Notification"),
    (0xFEAA, "Eddystone"),
];

/// Formats bytes as `4C 00 02`, dropping trailing zero padding.
#[must_use]
pub fn format_hex(bytes: &[u8]) -> String {
    trim_trailing_zeros(bytes)
        .iter()
        .map(|b| format!("{b:02X}"))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Formats bytes as `[0]=4C [1]=00`, for writing byte patterns by offset.
#[must_use]
pub fn format_hex_indexed(bytes: &[u8]) -> String {
    trim_trailing_zeros(bytes)
        .iter()
        .enumerate()
        .map(|(i, b)| format!("[{i}]={b:02X}"))
        .collect::<Vec<_>>()
        .join(" ")
}

#[must_use]
pub fn company_name(company_id: u16) -> Option<&'static str> {
    COMPANIES
        .iter()
        .find(|(id, _)| *id == company_id)
        .map(|(_, name)| *name)
}

/// Name of a SIG service given as a full base UUID (any form `Uuid` parses)
/// or as a 4 digit short form. Anything else is unknown.
#[must_use]
pub fn service_name(uuid: &str) -> Option<&'static str> {
    let uuid = uuid.trim();
    let id = if uuid.len() == 4 {
        u16::from_str_radix(uuid, 16).ok()?
    } else {
        let full = Uuid::parse_str(uuid).ok()?;
        u16::try_from(short_uuid(&full)?).ok()?
    };
    SERVICES.iter().find(|(s, _)| *s == id).map(|(_, name)| *name)
}

/// Service name if known, the UUID untouched otherwise.
#[must_use]
pub fn describe_service(uuid: &str) -> String {
    service_name(uuid).map_or_else(|| uuid.to_string(), str::to_string)
}

#[derive(Serialize, PartialEq, Eq, Debug, Clone)]
pub struct ManufacturerInfo {
    pub company_id: u16,
    pub company_name: Option<&'static str>,
    pub detail: VendorDetail,
}

#[derive(Serialize, PartialEq, Eq, Debug, Clone)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum VendorDetail {
    IBeacon {
        uuid: String,
        major: u16,
        minor: u16,
        tx_power: Option<i8>,
    },
    AppleProximity,
    FindMy,
    AirPods,
    AirPlay,
    AppleOther {
        sub_type: u8,
        data: Vec<u8>,
    },
    Raw {
        data: Vec<u8>,
    },
}

impl std::fmt::Display for VendorDetail {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        use VendorDetail::{AirPlay, AirPods, AppleOther, AppleProximity, FindMy, IBeacon, Raw};
        match self {
            IBeacon {
                uuid,
                major,
                minor,
                tx_power,
            } => {
                write!(f, "iBeacon uuid={uuid} major={major} minor={minor}")?;
                if let Some(tx) = tx_power {
                    write!(f, " tx={tx} dBm")?;
                }
                Ok(())
            }
            AppleProximity => write!(f, "Apple proximity beacon"),
            FindMy => write!(f, "FindMy network beacon"),
            AirPods => write!(f, "AirPods"),
            AirPlay => write!(f, "AirPlay"),
            AppleOther { sub_type, data } => {
                write!(f, "Apple type 0x{sub_type:02X}: {}", format_hex(data))
            }
            Raw { data } => write!(f, "{}", format_hex(data)),
        }
    }
}

/// Decodes manufacturer data whose company ID sits at offset 0.
#[must_use]
pub fn decode_manufacturer(data: &[u8]) -> Option<ManufacturerInfo> {
    let id_bytes = data.get(COMPANY_ID_OFFSET..COMPANY_ID_OFFSET + 2)?;
    let company_id = u16::from_le_bytes([id_bytes[0], id_bytes[1]]);
    let rest = &data[COMPANY_ID_OFFSET + 2..];
    let detail = if company_id == APPLE_COMPANY_ID {
        decode_apple(data)
    } else {
        VendorDetail::Raw {
            data: rest.to_vec(),
        }
    };
    Some(ManufacturerInfo {
        company_id,
        company_name: company_name(company_id),
        detail,
    })
}

fn decode_apple(data: &[u8]) -> VendorDetail {
    let Some(&sub_type) = data.get(APPLE_SUB_TYPE_OFFSET) else {
        return VendorDetail::Raw { data: Vec::new() };
    };
    let remaining = &data[APPLE_SUB_TYPE_OFFSET + 1..];
    match sub_type {
        0x02 if remaining.len() >= IBEACON_MIN_REMAINING => decode_ibeacon(remaining)
            .unwrap_or_else(|| VendorDetail::AppleOther {
                sub_type,
                data: remaining.to_vec(),
            }),
        0x10 => VendorDetail::AppleProximity,
        0x12 => VendorDetail::FindMy,
        0x07 => VendorDetail::AirPods,
        0x09 => VendorDetail::AirPlay,
        _ => VendorDetail::AppleOther {
            sub_type,
            data: remaining.to_vec(),
        },
    }
}

// remaining = [len(0x15), uuid x16, major x2, minor x2, tx?]
fn decode_ibeacon(remaining: &[u8]) -> Option<VendorDetail> {
    let uuid = Uuid::from_slice(remaining.get(1..17)?).ok()?;
    let major = u16::from_be_bytes([*remaining.get(17)?, *remaining.get(18)?]);
    let minor = u16::from_be_bytes([*remaining.get(19)?, *remaining.get(20)?]);
    let tx_power = remaining.get(21).map(|&b| i8::from_ne_bytes([b]));
    Some(VendorDetail::IBeacon {
        uuid: uuid.hyphenated().to_string(),
        major,
        minor,
        tx_power,
    })
}

/// Everything we could make of a payload, in one place.
#[derive(Serialize, PartialEq, Eq, Debug, Clone, Default)]
pub struct DecodedPayload {
    pub manufacturer: Option<ManufacturerInfo>,
    pub services: Vec<(String, Option<&'static str>)>,
    pub lines: Vec<String>,
}

#[must_use]
pub fn decode(payload: &AdvertisingPayload) -> DecodedPayload {
    let manufacturer = payload
        .manufacturer_data
        .as_deref()
        .and_then(decode_manufacturer);
    let services: Vec<(String, Option<&'static str>)> = payload
        .service_uuids
        .iter()
        .map(|uuid| (uuid.clone(), service_name(uuid)))
        .collect();

    let mut lines = Vec::new();
    if let Some(name) = &payload.local_name {
        lines.push(format!("Name: {name}"));
    }
    if let Some(tx) = payload.tx_power_level {
        lines.push(format!("TX power: {tx} dBm"));
    }
    if let Some(info) = &manufacturer {
        let mut line = format!("Company: 0x{:04X}", info.company_id);
        if let Some(name) = info.company_name {
            let _ = write!(line, " ({name})");
        }
        lines.push(line);
        lines.push(format!("Vendor data: {}", info.detail));
    }
    for (uuid, name) in &services {
        match name {
            Some(name) => lines.push(format!("Service: {name} ({uuid})")),
            None => lines.push(format!("Service: {uuid}")),
        }
    }
    for (uuid, data) in &payload.service_data {
        lines.push(format!(
            "Service data {}: {}",
            describe_service(uuid),
            format_hex(data)
        ));
    }
    if let Some(data) = &payload.manufacturer_data {
        lines.push(format!("Manufacturer data: {}", format_hex(data)));
    }
    if let Some(raw) = &payload.raw_data {
        lines.push(format!("Raw: {}", format_hex_indexed(raw)));
    }

    DecodedPayload {
        manufacturer,
        services,
        lines,
    }
}
