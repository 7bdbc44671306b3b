//! OpenTag spool record decoding
//!
//! OpenTag is a fixed-layout, little-endian schema. The required prefix is
//! 89 bytes; each optional field after it is decoded only when the buffer
//! still holds the field's full width. `0xFF`-family sentinels mark absent
//! optional values.

use chrono::{DateTime, TimeZone, Utc};
use serde::Serialize;
use thiserror::Error;

/// Minimum buffer length for a decodable record
pub const MIN_RECORD_LEN: usize = 89;

const MANUFACTURER_LEN: usize = 16;
const MATERIAL_LEN: usize = 16;
const COLOR_LEN: usize = 32;
const SERIAL_LEN: usize = 16;
const AUX_URL_LEN: usize = 32;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum OpenTagError {
    #[error("record too short: {len} bytes, need at least {MIN_RECORD_LEN}")]
    TooShort { len: usize },
}

/// Decoded spool description
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct OpenTagRecord {
    pub tag_version: u16,
    pub manufacturer: String,
    pub material: String,
    pub color: String,
    /// Target diameter in micrometres
    pub diameter_um: u16,
    /// Nominal weight in grams
    pub weight_g: u16,
    pub print_temp_c: u16,
    pub bed_temp_c: u16,
    /// Density in µg/cm³
    pub density_ug_cm3: u16,

    pub serial: Option<String>,
    pub manufacture_date: Option<DateTime<Utc>>,
    pub spool_core_diameter: Option<u8>,
    pub mfi: Option<u8>,
    pub tolerance: Option<u8>,
    pub aux_url: Option<String>,
    pub empty_spool_weight_g: Option<u16>,
    pub measured_weight_g: Option<u16>,
    pub measured_length_m: Option<u16>,
    pub tx_distance: Option<u16>,
    pub color_rgb: Option<u32>,
    pub max_dry_temp_c: Option<u8>,
}

impl OpenTagRecord {
    /// Decode a reassembled RFID payload.
    pub fn decode(data: &[u8]) -> Result<Self, OpenTagError> {
        if data.len() < MIN_RECORD_LEN {
            return Err(OpenTagError::TooShort { len: data.len() });
        }

        let mut cursor = Cursor::new(data);
        let mut record = OpenTagRecord {
            tag_version: cursor.u16(),
            manufacturer: cursor.string(MANUFACTURER_LEN),
            material: cursor.string(MATERIAL_LEN),
            color: cursor.string(COLOR_LEN),
            diameter_um: cursor.u16(),
            weight_g: cursor.u16(),
            print_temp_c: cursor.u16(),
            bed_temp_c: cursor.u16(),
            density_ug_cm3: cursor.u16(),
            ..OpenTagRecord::default()
        };

        record.serial = cursor.try_string(SERIAL_LEN);
        record.manufacture_date = cursor.try_u32_pair().and_then(|(date, _time)| {
            if date == 0xFFFF_FFFF {
                None
            } else {
                Utc.timestamp_opt(i64::from(date), 0).single()
            }
        });
        record.spool_core_diameter = cursor.try_u8().filter(|&v| v != 0xFF);
        record.mfi = cursor.try_u8().filter(|&v| v != 0xFF);
        record.tolerance = cursor.try_u8().filter(|&v| v != 0xFF);
        record.aux_url = cursor.try_string(AUX_URL_LEN);
        record.empty_spool_weight_g = cursor.try_u16().filter(|&v| v != 0xFFFF);
        record.measured_weight_g = cursor.try_u16().filter(|&v| v != 0xFFFF);
        record.measured_length_m = cursor.try_u16().filter(|&v| v != 0xFFFF);
        record.tx_distance = cursor.try_u16().filter(|&v| v != 0xFFFF);
        record.color_rgb = cursor.try_u32().filter(|&v| v != 0xFFFF_FFFF);
        record.max_dry_temp_c = cursor.try_u8().filter(|&v| v != 0xFF);

        Ok(record)
    }
}

/// Sequential little-endian reader over the record buffer. The infallible
/// accessors are only used inside the 89-byte required prefix.
struct Cursor<'a> {
    data: &'a [u8],
    offset: usize,
}

impl<'a> Cursor<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, offset: 0 }
    }

    fn remaining(&self) -> usize {
        self.data.len() - self.offset
    }

    fn u16(&mut self) -> u16 {
        let value = u16::from_le_bytes([self.data[self.offset], self.data[self.offset + 1]]);
        self.offset += 2;
        value
    }

    fn string(&mut self, width: usize) -> String {
        let raw = &self.data[self.offset..self.offset + width];
        self.offset += width;
        decode_padded_string(raw)
    }

    fn try_u8(&mut self) -> Option<u8> {
        if self.remaining() < 1 {
            return None;
        }
        let value = self.data[self.offset];
        self.offset += 1;
        Some(value)
    }

    fn try_u16(&mut self) -> Option<u16> {
        if self.remaining() < 2 {
            return None;
        }
        Some(self.u16())
    }

    fn try_u32(&mut self) -> Option<u32> {
        if self.remaining() < 4 {
            return None;
        }
        let value = u32::from_le_bytes([
            self.data[self.offset],
            self.data[self.offset + 1],
            self.data[self.offset + 2],
            self.data[self.offset + 3],
        ]);
        self.offset += 4;
        Some(value)
    }

    /// Manufacture timestamp: epoch date seconds + time-of-day word, read
    /// together so a truncated pair never consumes half its width.
    fn try_u32_pair(&mut self) -> Option<(u32, u32)> {
        if self.remaining() < 8 {
            return None;
        }
        let first = self.try_u32()?;
        let second = self.try_u32()?;
        Some((first, second))
    }

    fn try_string(&mut self, width: usize) -> Option<String> {
        if self.remaining() < width {
            return None;
        }
        Some(self.string(width))
    }
}

/// NUL-terminated string in a fixed-width field; malformed UTF-8 bytes are
/// dropped rather than replaced.
fn decode_padded_string(raw: &[u8]) -> String {
    let terminated = match raw.iter().position(|&b| b == 0) {
        Some(pos) => &raw[..pos],
        None => raw,
    };
    String::from_utf8_lossy(terminated)
        .chars()
        .filter(|&c| c != char::REPLACEMENT_CHARACTER)
        .collect::<String>()
        .trim()
        .to_string()
}
