//! RFID transfer reassembly
//!
//! The cabinet streams a spool's OpenTag payload as a start frame, a run of
//! 4-byte data packets, and an end frame carrying a 16-bit checksum. Each
//! transfer is a session keyed by the start frame's 8-bit sequence number;
//! sessions are isolated, may be restarted by a new start frame with the
//! same sequence, and are swept after a TTL so an abandoned transfer never
//! produces a record.

pub mod opentag;

use std::collections::HashMap;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tracing::{debug, info, warn};

use crate::can::frame::code;
pub use opentag::{OpenTagError, OpenTagRecord};

/// Session lifetime before the sweeper evicts it
pub const SESSION_TTL: Duration = Duration::from_secs(10);

/// Where the payload originated on the cabinet side
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataSource {
    Rfid,
    Manual,
}

impl From<u8> for DataSource {
    fn from(value: u8) -> Self {
        if value == 0 {
            DataSource::Rfid
        } else {
            DataSource::Manual
        }
    }
}

/// Error codes reported by the cabinet in an `RFID_ERROR` frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CabinetRfidError {
    ReadFail,
    NoFilament,
    InvalidData,
    Timeout,
    NoMapping,
    Busy,
    Unknown(u8),
}

impl From<u8> for CabinetRfidError {
    fn from(value: u8) -> Self {
        match value {
            0x01 => CabinetRfidError::ReadFail,
            0x02 => CabinetRfidError::NoFilament,
            0x03 => CabinetRfidError::InvalidData,
            0x04 => CabinetRfidError::Timeout,
            0x05 => CabinetRfidError::NoMapping,
            0x06 => CabinetRfidError::Busy,
            other => CabinetRfidError::Unknown(other),
        }
    }
}

impl std::fmt::Display for CabinetRfidError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CabinetRfidError::ReadFail => write!(f, "tag read failed"),
            CabinetRfidError::NoFilament => write!(f, "no filament detected"),
            CabinetRfidError::InvalidData => write!(f, "invalid tag data"),
            CabinetRfidError::Timeout => write!(f, "operation timed out"),
            CabinetRfidError::NoMapping => write!(f, "no extruder mapping"),
            CabinetRfidError::Busy => write!(f, "cabinet busy"),
            CabinetRfidError::Unknown(code) => write!(f, "unknown error 0x{code:02X}"),
        }
    }
}

/// Why a finished transfer produced no record
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReassemblyFailure {
    /// Not every index in `1..=total_packets` arrived, or the concatenation
    /// came up short of the declared length
    ReassembleFailed,
    /// The 16-bit sum of the reassembled bytes disagreed with the end frame
    ChecksumFailed { expected: u16, actual: u16 },
    /// Reassembly succeeded but the buffer was not a valid OpenTag record
    DecodeFailed(OpenTagError),
}

/// Result of feeding one RFID frame to the reassembler
#[derive(Debug, Clone, PartialEq)]
pub enum RfidOutcome {
    SessionStarted {
        sequence: u8,
        extruder: u8,
        filament_channel: u8,
        data_source: DataSource,
    },
    PacketStored {
        sequence: u8,
        index: u8,
        total: u8,
    },
    Complete {
        sequence: u8,
        extruder: u8,
        filament_channel: u8,
        data_source: DataSource,
        record: OpenTagRecord,
    },
    Failed {
        sequence: u8,
        reason: ReassemblyFailure,
    },
    CabinetError {
        sequence: u8,
        extruder: u8,
        error: CabinetRfidError,
        ext_error: u8,
    },
}

struct Session {
    extruder: u8,
    filament_channel: u8,
    total_packets: u8,
    declared_length: usize,
    data_source: DataSource,
    received: HashMap<u8, Vec<u8>>,
    started_at: Instant,
}

impl Session {
    fn reassemble(&self) -> Option<Vec<u8>> {
        let mut data = Vec::with_capacity(self.total_packets as usize * 4);
        for index in 1..=self.total_packets {
            data.extend_from_slice(self.received.get(&index)?);
        }
        if data.len() < self.declared_length {
            return None;
        }
        data.truncate(self.declared_length);
        Some(data)
    }
}

/// Multi-packet reassembler with per-sequence session isolation.
pub struct RfidReassembler {
    sessions: DashMap<u8, Session>,
    completed: DashMap<u8, OpenTagRecord>,
    ttl: Duration,
}

impl Default for RfidReassembler {
    fn default() -> Self {
        Self::new(SESSION_TTL)
    }
}

impl RfidReassembler {
    pub fn new(ttl: Duration) -> Self {
        Self {
            sessions: DashMap::new(),
            completed: DashMap::new(),
            ttl,
        }
    }

    /// Feed one raw 8-byte RFID frame. Returns `None` for frames that do
    /// not advance any session (unknown sequence, out-of-range packet
    /// index, non-RFID command codes).
    pub fn handle_frame(&self, data: &[u8; 8]) -> Option<RfidOutcome> {
        match data[0] {
            code::RFID_NOTIFY_START => Some(self.start_session(
                data[1],
                data[6],
                data[2],
                data[3],
                length_from(data),
                data[7],
            )),
            code::RFID_RESPONSE_START => Some(self.start_session(
                data[1],
                data[2],
                data[6],
                data[3],
                length_from(data),
                data[7],
            )),
            code::RFID_PACKET => self.store_packet(data),
            code::RFID_END => self.finish_session(data),
            code::RFID_ERROR => Some(self.cabinet_error(data)),
            _ => None,
        }
    }

    /// The extruder or filament-channel byte sits at offset 2 or 6 depending
    /// on the start variant; both orderings are accepted as-is.
    fn start_session(
        &self,
        sequence: u8,
        extruder: u8,
        filament_channel: u8,
        total_packets: u8,
        declared_length: usize,
        data_source: u8,
    ) -> RfidOutcome {
        let data_source = DataSource::from(data_source);
        // a start frame with an open sequence replaces the old session
        self.sessions.insert(
            sequence,
            Session {
                extruder,
                filament_channel,
                total_packets,
                declared_length,
                data_source,
                received: HashMap::new(),
                started_at: Instant::now(),
            },
        );
        info!(
            sequence,
            extruder,
            filament_channel,
            total_packets,
            declared_length,
            "RFID transfer started"
        );
        RfidOutcome::SessionStarted {
            sequence,
            extruder,
            filament_channel,
            data_source,
        }
    }

    fn store_packet(&self, data: &[u8; 8]) -> Option<RfidOutcome> {
        let sequence = data[1];
        let index = data[2];
        let valid_bytes = (data[3] as usize).min(4);

        let mut session = match self.sessions.get_mut(&sequence) {
            Some(session) => session,
            None => {
                warn!(sequence, "RFID packet for unknown session");
                return None;
            }
        };
        if index == 0 || index > session.total_packets {
            warn!(
                sequence,
                index,
                total = session.total_packets,
                "RFID packet index out of range"
            );
            return None;
        }
        // duplicates overwrite
        session
            .received
            .insert(index, data[4..4 + valid_bytes].to_vec());
        debug!(
            sequence,
            index,
            total = session.total_packets,
            valid_bytes,
            "RFID packet stored"
        );
        Some(RfidOutcome::PacketStored {
            sequence,
            index,
            total: session.total_packets,
        })
    }

    fn finish_session(&self, data: &[u8; 8]) -> Option<RfidOutcome> {
        let sequence = data[1];
        let expected_checksum = u16::from(data[3]) << 8 | u16::from(data[4]);

        let (_, session) = match self.sessions.remove(&sequence) {
            Some(entry) => entry,
            None => {
                warn!(sequence, "RFID end frame for unknown session");
                return None;
            }
        };

        let payload = match session.reassemble() {
            Some(payload) => payload,
            None => {
                warn!(
                    sequence,
                    received = session.received.len(),
                    expected = session.total_packets,
                    "RFID reassembly failed"
                );
                return Some(RfidOutcome::Failed {
                    sequence,
                    reason: ReassemblyFailure::ReassembleFailed,
                });
            }
        };

        let actual_checksum = payload
            .iter()
            .fold(0u32, |sum, &byte| sum + u32::from(byte)) as u16;
        if actual_checksum != expected_checksum {
            warn!(
                sequence,
                expected = expected_checksum,
                actual = actual_checksum,
                "RFID checksum mismatch"
            );
            return Some(RfidOutcome::Failed {
                sequence,
                reason: ReassemblyFailure::ChecksumFailed {
                    expected: expected_checksum,
                    actual: actual_checksum,
                },
            });
        }

        match OpenTagRecord::decode(&payload) {
            Ok(record) => {
                info!(
                    sequence,
                    extruder = session.extruder,
                    manufacturer = %record.manufacturer,
                    material = %record.material,
                    color = %record.color,
                    "RFID record decoded"
                );
                self.completed.insert(session.extruder, record.clone());
                Some(RfidOutcome::Complete {
                    sequence,
                    extruder: session.extruder,
                    filament_channel: session.filament_channel,
                    data_source: session.data_source,
                    record,
                })
            }
            Err(err) => {
                warn!(sequence, error = %err, "OpenTag decode failed");
                Some(RfidOutcome::Failed {
                    sequence,
                    reason: ReassemblyFailure::DecodeFailed(err),
                })
            }
        }
    }

    fn cabinet_error(&self, data: &[u8; 8]) -> RfidOutcome {
        let sequence = data[1];
        let extruder = data[2];
        let error = CabinetRfidError::from(data[3]);
        let ext_error = data[4];
        // a reported error ends any transfer in flight for that sequence
        self.sessions.remove(&sequence);
        warn!(sequence, extruder, %error, ext_error, "cabinet reported RFID error");
        RfidOutcome::CabinetError {
            sequence,
            extruder,
            error,
            ext_error,
        }
    }

    /// Evict sessions older than the TTL. Returns the evicted sequences.
    pub fn sweep_expired(&self) -> Vec<u8> {
        let mut evicted = Vec::new();
        self.sessions.retain(|&sequence, session| {
            if session.started_at.elapsed() > self.ttl {
                evicted.push(sequence);
                false
            } else {
                true
            }
        });
        for sequence in &evicted {
            warn!(sequence, "evicted expired RFID session");
        }
        evicted
    }

    /// Latest decoded record for an extruder, if any transfer completed.
    pub fn latest_record(&self, extruder: u8) -> Option<OpenTagRecord> {
        self.completed.get(&extruder).map(|entry| entry.clone())
    }

    pub fn open_sessions(&self) -> usize {
        self.sessions.len()
    }
}

fn length_from(data: &[u8; 8]) -> usize {
    (usize::from(data[4]) << 8) | usize::from(data[5])
}
