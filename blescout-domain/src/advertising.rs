use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lowest TX power level we believe; anything below is a misread field.
pub const TX_POWER_MIN: i16 = -30;
/// Highest TX power level we believe.
pub const TX_POWER_MAX: i16 = 20;

// AD structure types (Bluetooth Core Supplement, part A)
const AD_INCOMPLETE_UUID16: u8 = 0x02;
const AD_COMPLETE_UUID16: u8 = 0x03;
const AD_INCOMPLETE_UUID32: u8 = 0x04;
const AD_COMPLETE_UUID32: u8 = 0x05;
const AD_INCOMPLETE_UUID128: u8 = 0x06;
const AD_COMPLETE_UUID128: u8 = 0x07;
const AD_SHORT_NAME: u8 = 0x08;
const AD_COMPLETE_NAME: u8 = 0x09;
const AD_TX_POWER: u8 = 0x0A;
const AD_SERVICE_DATA_UUID16: u8 = 0x16;
const AD_SERVICE_DATA_UUID32: u8 = 0x20;
const AD_SERVICE_DATA_UUID128: u8 = 0x21;
const AD_MANUFACTURER_DATA: u8 = 0xFF;

/// Bluetooth base UUID, 0000xxxx-0000-1000-8000-00805f9b34fb.
pub const BASE_UUID: Uuid = Uuid::from_u128(0x0000_0000_0000_1000_8000_0080_5f9b_34fb);
// the 32 bits a short UUID occupies in the base UUID
const SHORT_UUID_MASK: u128 = 0xFFFF_FFFF << 96;

/// One advertising report, normalized into a single shape whatever the
/// platform handed us.
///
/// `manufacturer_data` always starts with the little-endian company ID.
#[derive(Serialize, Deserialize, PartialEq, Eq, Debug, Clone, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct AdvertisingPayload {
    pub local_name: Option<String>,
    pub tx_power_level: Option<i8>,
    pub manufacturer_data: Option<Vec<u8>>,
    #[serde(rename = "serviceUUIDs")]
    pub service_uuids: Vec<String>,
    pub service_data: BTreeMap<String, Vec<u8>>,
    pub raw_data: Option<Vec<u8>>,
}

impl AdvertisingPayload {
    /// Parses a raw advertisement into its AD structures.
    ///
    /// The walk is best effort: a zero length byte is treated as the start of
    /// padding, and a structure that claims more bytes than remain ends the
    /// walk without contributing anything. The untouched input is kept in
    /// `raw_data` either way.
    #[must_use]
    pub fn from_raw(raw: &[u8]) -> AdvertisingPayload {
        let mut payload = AdvertisingPayload {
            raw_data: (!raw.is_empty()).then(|| raw.to_vec()),
            ..AdvertisingPayload::default()
        };

        let mut offset = 0;
        while offset < raw.len() {
            let len = raw[offset] as usize;
            if len == 0 || offset + 1 + len > raw.len() {
                break;
            }
            let ad_type = raw[offset + 1];
            let value = &raw[offset + 2..offset + 1 + len];
            payload.absorb(ad_type, value);
            offset += 1 + len;
        }
        payload
    }

    fn absorb(&mut self, ad_type: u8, value: &[u8]) {
        match ad_type {
            AD_SHORT_NAME | AD_COMPLETE_NAME => {
                let name = String::from_utf8_lossy(value)
                    .trim_end_matches('\0')
                    .to_string();
                // the complete name wins over a shortened one
                if !name.is_empty() && (self.local_name.is_none() || ad_type == AD_COMPLETE_NAME) {
                    self.local_name = Some(name);
                }
            }
            AD_TX_POWER => {
                if let Some(&b) = value.first() {
                    self.tx_power_level = normalize_tx_power(i16::from(b));
                }
            }
            AD_INCOMPLETE_UUID16 | AD_COMPLETE_UUID16 => {
                for chunk in value.chunks_exact(2) {
                    self.push_uuid(&uuid_from_le(chunk));
                }
            }
            AD_INCOMPLETE_UUID32 | AD_COMPLETE_UUID32 => {
                for chunk in value.chunks_exact(4) {
                    self.push_uuid(&uuid_from_le(chunk));
                }
            }
            AD_INCOMPLETE_UUID128 | AD_COMPLETE_UUID128 => {
                for chunk in value.chunks_exact(16) {
                    self.push_uuid(&uuid_from_le(chunk));
                }
            }
            AD_SERVICE_DATA_UUID16 => self.absorb_service_data(value, 2),
            AD_SERVICE_DATA_UUID32 => self.absorb_service_data(value, 4),
            AD_SERVICE_DATA_UUID128 => self.absorb_service_data(value, 16),
            AD_MANUFACTURER_DATA => {
                if value.len() >= 2 {
                    self.manufacturer_data = Some(value.to_vec());
                }
            }
            _ => {}
        }
    }

    fn absorb_service_data(&mut self, value: &[u8], uuid_len: usize) {
        if value.len() < uuid_len {
            return;
        }
        let (uuid, data) = value.split_at(uuid_len);
        let key = uuid_from_le(uuid).hyphenated().to_string();
        self.service_data.insert(key, data.to_vec());
    }

    fn push_uuid(&mut self, uuid: &Uuid) {
        let uuid = uuid.hyphenated().to_string();
        if !self.service_uuids.contains(&uuid) {
            self.service_uuids.push(uuid);
        }
    }

    /// Company ID read from the first two bytes of the manufacturer data.
    #[must_use]
    pub fn company_id(&self) -> Option<u16> {
        match self.manufacturer_data.as_deref() {
            Some([lo, hi, ..]) => Some(u16::from_le_bytes([*lo, *hi])),
            _ => None,
        }
    }

    /// Copy with trailing zero padding removed from every byte field.
    #[must_use]
    pub fn trimmed(&self) -> AdvertisingPayload {
        AdvertisingPayload {
            local_name: self.local_name.clone(),
            tx_power_level: self.tx_power_level,
            manufacturer_data: self
                .manufacturer_data
                .as_deref()
                .map(|d| trim_trailing_zeros(d).to_vec()),
            service_uuids: self.service_uuids.clone(),
            service_data: self
                .service_data
                .iter()
                .map(|(k, v)| (k.clone(), trim_trailing_zeros(v).to_vec()))
                .collect(),
            raw_data: self
                .raw_data
                .as_deref()
                .map(|d| trim_trailing_zeros(d).to_vec()),
        }
    }
}

/// Prefixes platform-split manufacturer data with its company ID again, so
/// every payload carries the ID at offset 0.
#[must_use]
pub fn manufacturer_data_with_company(company_id: u16, data: &[u8]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(data.len() + 2);
    bytes.extend_from_slice(&company_id.to_le_bytes());
    bytes.extend_from_slice(data);
    bytes
}

/// Interprets a reported TX power as an unsigned byte and returns the signed
/// dBm value, or `None` if it falls outside the plausible range.
#[must_use]
pub fn normalize_tx_power(reported: i16) -> Option<i8> {
    let unsigned = reported & 0xFF;
    let signed = if unsigned > 127 { unsigned - 256 } else { unsigned };
    if (TX_POWER_MIN..=TX_POWER_MAX).contains(&signed) {
        i8::try_from(signed).ok()
    } else {
        None
    }
}

#[must_use]
pub fn trim_trailing_zeros(bytes: &[u8]) -> &[u8] {
    let end = bytes.iter().rposition(|&b| b != 0).map_or(0, |i| i + 1);
    &bytes[..end]
}

/// Full UUID for a 16 or 32-bit SIG short form.
#[must_use]
pub fn uuid_from_short(short: u32) -> Uuid {
    Uuid::from_u128(BASE_UUID.as_u128() | (u128::from(short) << 96))
}

/// The short form of `uuid`, if it is derived from the base UUID.
#[must_use]
pub fn short_uuid(uuid: &Uuid) -> Option<u32> {
    let value = uuid.as_u128();
    if value & !SHORT_UUID_MASK != BASE_UUID.as_u128() {
        return None;
    }
    u32::try_from(value >> 96).ok()
}

/// Expands a little-endian 16, 32 or 128-bit UUID as carried in AD
/// structures. Any other length yields the nil UUID.
fn uuid_from_le(bytes: &[u8]) -> Uuid {
    match *bytes {
        [a, b] => uuid_from_short(u32::from(u16::from_le_bytes([a, b]))),
        [a, b, c, d] => uuid_from_short(u32::from_le_bytes([a, b, c, d])),
        _ => <[u8; 16]>::try_from(bytes)
            .map_or(Uuid::nil(), |le| Uuid::from_u128(u128::from_le_bytes(le))),
    }
}
