//! CAN frame codec for the feeder cabinet protocol
//!
//! Every frame is a classic 11-bit-identifier frame with exactly 8 data
//! bytes. Byte 0 carries the command code; the remaining bytes are the
//! command's payload (zero on send, ignored on receive where unused).
//! Commands are represented as a tagged enum and encoded/decoded only at
//! the link boundary.

/// Printer → cabinet data frames
pub const PRINTER_TO_CABINET: u16 = 0x10A;
/// Cabinet → printer data frames
pub const CABINET_TO_PRINTER: u16 = 0x10B;
/// Handshake request identifier
pub const HANDSHAKE_TX: u16 = 0x3F0;
/// Handshake response identifier
pub const HANDSHAKE_RX: u16 = 0x3F1;

/// Fixed handshake request payload sent on [`HANDSHAKE_TX`]
pub const HANDSHAKE_REQUEST: [u8; 8] = [0x01, 0xF0, 0x10, 0x00, 0x00, 0x06, 0x01, 0x05];
/// First (and only significant) byte of a successful handshake response
pub const HANDSHAKE_ACK: u8 = 0x05;

/// Command codes (frame byte 0)
pub mod code {
    pub const REQUEST_FEED: u8 = 0x01;
    pub const STOP_FEED: u8 = 0x02;
    pub const QUERY_STATUS: u8 = 0x03;
    pub const PRINTING: u8 = 0x04;
    pub const PRINT_COMPLETE: u8 = 0x05;
    pub const PRINT_PAUSE: u8 = 0x06;
    pub const PRINT_CANCEL: u8 = 0x07;
    pub const PRINTER_IDLE: u8 = 0x08;
    pub const PRINTER_ERROR: u8 = 0x09;
    pub const HEARTBEAT: u8 = 0x0A;
    pub const QUERY_FILAMENT_STATUS: u8 = 0x0D;
    pub const FILAMENT_STATUS_RESPONSE: u8 = 0x0E;
    pub const SET_FEEDER_MAPPING: u8 = 0x0F;
    pub const QUERY_FEEDER_MAPPING: u8 = 0x10;
    pub const FEEDER_MAPPING_RESPONSE: u8 = 0x11;
    pub const RFID_NOTIFY_START: u8 = 0x14;
    pub const RFID_REQUEST: u8 = 0x15;
    pub const RFID_RESPONSE_START: u8 = 0x16;
    pub const RFID_PACKET: u8 = 0x17;
    pub const RFID_END: u8 = 0x18;
    pub const RFID_ERROR: u8 = 0x19;
}

/// True for the six RFID transfer commands, which bypass normal
/// classification and are handed to the reassembler as raw frames.
pub fn is_rfid_code(cmd: u8) -> bool {
    matches!(
        cmd,
        code::RFID_NOTIFY_START
            | code::RFID_REQUEST
            | code::RFID_RESPONSE_START
            | code::RFID_PACKET
            | code::RFID_END
            | code::RFID_ERROR
    )
}

/// Cabinet-side status byte carried in unsolicited status frames
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CabinetStatus {
    Idle,
    Ready,
    Feeding,
    Complete,
    Error,
    Unknown(u8),
}

impl From<u8> for CabinetStatus {
    fn from(value: u8) -> Self {
        match value {
            0x00 => CabinetStatus::Idle,
            0x01 => CabinetStatus::Ready,
            0x02 => CabinetStatus::Feeding,
            0x03 => CabinetStatus::Complete,
            0x04 => CabinetStatus::Error,
            other => CabinetStatus::Unknown(other),
        }
    }
}

impl std::fmt::Display for CabinetStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CabinetStatus::Idle => write!(f, "Idle"),
            CabinetStatus::Ready => write!(f, "Ready"),
            CabinetStatus::Feeding => write!(f, "Feeding"),
            CabinetStatus::Complete => write!(f, "Complete"),
            CabinetStatus::Error => write!(f, "Error"),
            CabinetStatus::Unknown(code) => write!(f, "Unknown(0x{code:02X})"),
        }
    }
}

/// Commands exchanged with the cabinet, one variant per code with its
/// fixed payload layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CabinetCommand {
    /// Ask the cabinet to feed filament through `tube`
    RequestFeed { tube: u8 },
    /// Abort an in-flight feed on `tube`
    StopFeed { tube: u8 },
    QueryStatus,
    Printing { extruder: u8 },
    PrintComplete { extruder: u8 },
    PrintPause { extruder: u8 },
    PrintCancel { extruder: u8 },
    PrinterIdle { extruder: u8 },
    PrinterError { extruder: u8 },
    Heartbeat,
    QueryFilamentStatus,
    /// `valid=false` is encoded as validity byte 1 with a zero bitmap
    FilamentStatusResponse { valid: bool, bitmap: u8 },
    SetFeederMapping { left: u8, right: u8 },
    QueryFeederMapping,
    FeederMappingResponse { left: u8, right: u8, status: u8 },
    RfidRequest { extruder: u8 },
}

impl CabinetCommand {
    /// Command code (frame byte 0)
    pub fn code(&self) -> u8 {
        match self {
            CabinetCommand::RequestFeed { .. } => code::REQUEST_FEED,
            CabinetCommand::StopFeed { .. } => code::STOP_FEED,
            CabinetCommand::QueryStatus => code::QUERY_STATUS,
            CabinetCommand::Printing { .. } => code::PRINTING,
            CabinetCommand::PrintComplete { .. } => code::PRINT_COMPLETE,
            CabinetCommand::PrintPause { .. } => code::PRINT_PAUSE,
            CabinetCommand::PrintCancel { .. } => code::PRINT_CANCEL,
            CabinetCommand::PrinterIdle { .. } => code::PRINTER_IDLE,
            CabinetCommand::PrinterError { .. } => code::PRINTER_ERROR,
            CabinetCommand::Heartbeat => code::HEARTBEAT,
            CabinetCommand::QueryFilamentStatus => code::QUERY_FILAMENT_STATUS,
            CabinetCommand::FilamentStatusResponse { .. } => code::FILAMENT_STATUS_RESPONSE,
            CabinetCommand::SetFeederMapping { .. } => code::SET_FEEDER_MAPPING,
            CabinetCommand::QueryFeederMapping => code::QUERY_FEEDER_MAPPING,
            CabinetCommand::FeederMappingResponse { .. } => code::FEEDER_MAPPING_RESPONSE,
            CabinetCommand::RfidRequest { .. } => code::RFID_REQUEST,
        }
    }

    /// Serialize into the fixed 8-byte frame payload
    pub fn encode(&self) -> [u8; 8] {
        let mut data = [0u8; 8];
        data[0] = self.code();
        match *self {
            CabinetCommand::RequestFeed { tube } | CabinetCommand::StopFeed { tube } => {
                // byte 1 is the validity flag (always 0 on send)
                data[2] = tube;
            }
            CabinetCommand::Printing { extruder }
            | CabinetCommand::PrintComplete { extruder }
            | CabinetCommand::PrintPause { extruder }
            | CabinetCommand::PrintCancel { extruder }
            | CabinetCommand::PrinterIdle { extruder }
            | CabinetCommand::PrinterError { extruder } => {
                data[1] = extruder;
            }
            CabinetCommand::FilamentStatusResponse { valid, bitmap } => {
                data[1] = if valid { 0x00 } else { 0x01 };
                data[2] = bitmap;
            }
            CabinetCommand::SetFeederMapping { left, right } => {
                data[1] = left;
                data[2] = right;
            }
            CabinetCommand::FeederMappingResponse {
                left,
                right,
                status,
            } => {
                data[1] = left;
                data[2] = right;
                data[3] = status;
            }
            CabinetCommand::RfidRequest { extruder } => {
                // byte 1 is the sequence placeholder, assigned by the cabinet
                data[2] = extruder;
            }
            CabinetCommand::QueryStatus
            | CabinetCommand::Heartbeat
            | CabinetCommand::QueryFilamentStatus
            | CabinetCommand::QueryFeederMapping => {}
        }
        data
    }

    /// Parse a frame payload back into a command. Returns `None` for codes
    /// outside the command set (including the raw RFID transfer frames).
    pub fn decode(data: &[u8; 8]) -> Option<CabinetCommand> {
        let cmd = match data[0] {
            code::REQUEST_FEED => CabinetCommand::RequestFeed { tube: data[2] },
            code::STOP_FEED => CabinetCommand::StopFeed { tube: data[2] },
            code::QUERY_STATUS => CabinetCommand::QueryStatus,
            code::PRINTING => CabinetCommand::Printing { extruder: data[1] },
            code::PRINT_COMPLETE => CabinetCommand::PrintComplete { extruder: data[1] },
            code::PRINT_PAUSE => CabinetCommand::PrintPause { extruder: data[1] },
            code::PRINT_CANCEL => CabinetCommand::PrintCancel { extruder: data[1] },
            code::PRINTER_IDLE => CabinetCommand::PrinterIdle { extruder: data[1] },
            code::PRINTER_ERROR => CabinetCommand::PrinterError { extruder: data[1] },
            code::HEARTBEAT => CabinetCommand::Heartbeat,
            code::QUERY_FILAMENT_STATUS => CabinetCommand::QueryFilamentStatus,
            code::FILAMENT_STATUS_RESPONSE => CabinetCommand::FilamentStatusResponse {
                valid: data[1] == 0x00,
                bitmap: data[2],
            },
            code::SET_FEEDER_MAPPING => CabinetCommand::SetFeederMapping {
                left: data[1],
                right: data[2],
            },
            code::QUERY_FEEDER_MAPPING => CabinetCommand::QueryFeederMapping,
            code::FEEDER_MAPPING_RESPONSE => CabinetCommand::FeederMappingResponse {
                left: data[1],
                right: data[2],
                status: data[3],
            },
            code::RFID_REQUEST => CabinetCommand::RfidRequest { extruder: data[2] },
            _ => return None,
        };
        Some(cmd)
    }
}

impl std::fmt::Display for CabinetCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CabinetCommand::RequestFeed { tube } => write!(f, "RequestFeed(tube={tube})"),
            CabinetCommand::StopFeed { tube } => write!(f, "StopFeed(tube={tube})"),
            CabinetCommand::QueryStatus => write!(f, "QueryStatus"),
            CabinetCommand::Printing { extruder } => write!(f, "Printing(extruder={extruder})"),
            CabinetCommand::PrintComplete { extruder } => {
                write!(f, "PrintComplete(extruder={extruder})")
            }
            CabinetCommand::PrintPause { extruder } => {
                write!(f, "PrintPause(extruder={extruder})")
            }
            CabinetCommand::PrintCancel { extruder } => {
                write!(f, "PrintCancel(extruder={extruder})")
            }
            CabinetCommand::PrinterIdle { extruder } => {
                write!(f, "PrinterIdle(extruder={extruder})")
            }
            CabinetCommand::PrinterError { extruder } => {
                write!(f, "PrinterError(extruder={extruder})")
            }
            CabinetCommand::Heartbeat => write!(f, "Heartbeat"),
            CabinetCommand::QueryFilamentStatus => write!(f, "QueryFilamentStatus"),
            CabinetCommand::FilamentStatusResponse { valid, bitmap } => {
                write!(f, "FilamentStatusResponse(valid={valid}, bitmap={bitmap:#010b})")
            }
            CabinetCommand::SetFeederMapping { left, right } => {
                write!(f, "SetFeederMapping(left={left}, right={right})")
            }
            CabinetCommand::QueryFeederMapping => write!(f, "QueryFeederMapping"),
            CabinetCommand::FeederMappingResponse {
                left,
                right,
                status,
            } => write!(
                f,
                "FeederMappingResponse(left={left}, right={right}, status={status})"
            ),
            CabinetCommand::RfidRequest { extruder } => {
                write!(f, "RfidRequest(extruder={extruder})")
            }
        }
    }
}

/// Unsolicited cabinet status wrapper for frames outside the dedicated
/// classifications.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusReport {
    pub status: u8,
    pub progress: u8,
    pub error_code: u8,
    pub raw: [u8; 8],
}

impl StatusReport {
    pub fn cabinet_status(&self) -> CabinetStatus {
        CabinetStatus::from(self.status)
    }
}

/// Classification of an accepted frame on [`CABINET_TO_PRINTER`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InboundFrame {
    /// Cabinet asks for the current filament bitmap
    FilamentQuery,
    /// Cabinet pushes a new tube→extruder mapping (already validated)
    MappingSet { left: u8, right: u8 },
    /// One of the six RFID transfer frames, forwarded raw
    Rfid([u8; 8]),
    /// Everything else, wrapped as a status event
    Status(StatusReport),
}

/// Classify an accepted data frame. Returns `None` only for a
/// `SET_FEEDER_MAPPING` whose operands fail validation (both sides must be
/// `< 2` and distinct); such frames are silently dropped per protocol.
pub fn classify(data: &[u8; 8]) -> Option<InboundFrame> {
    match data[0] {
        code::QUERY_FILAMENT_STATUS => Some(InboundFrame::FilamentQuery),
        code::SET_FEEDER_MAPPING => {
            let (left, right) = (data[1], data[2]);
            if left < 2 && right < 2 && left != right {
                Some(InboundFrame::MappingSet { left, right })
            } else {
                None
            }
        }
        cmd if is_rfid_code(cmd) => Some(InboundFrame::Rfid(*data)),
        _ => Some(InboundFrame::Status(StatusReport {
            status: data[0],
            progress: data[1],
            error_code: data[2],
            raw: *data,
        })),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_roundtrip() {
        let commands = [
            CabinetCommand::RequestFeed { tube: 1 },
            CabinetCommand::StopFeed { tube: 0 },
            CabinetCommand::QueryStatus,
            CabinetCommand::Printing { extruder: 1 },
            CabinetCommand::PrintComplete { extruder: 0 },
            CabinetCommand::PrintPause { extruder: 0 },
            CabinetCommand::PrintCancel { extruder: 1 },
            CabinetCommand::PrinterIdle { extruder: 0 },
            CabinetCommand::PrinterError { extruder: 0 },
            CabinetCommand::Heartbeat,
            CabinetCommand::QueryFilamentStatus,
            CabinetCommand::FilamentStatusResponse {
                valid: true,
                bitmap: 0b10,
            },
            CabinetCommand::FilamentStatusResponse {
                valid: false,
                bitmap: 0,
            },
            CabinetCommand::SetFeederMapping { left: 1, right: 0 },
            CabinetCommand::QueryFeederMapping,
            CabinetCommand::FeederMappingResponse {
                left: 0,
                right: 1,
                status: 0,
            },
            CabinetCommand::RfidRequest { extruder: 1 },
        ];
        for cmd in commands {
            let frame = cmd.encode();
            assert_eq!(CabinetCommand::decode(&frame), Some(cmd), "{cmd}");
        }
    }

    #[test]
    fn request_feed_layout() {
        let frame = CabinetCommand::RequestFeed { tube: 1 }.encode();
        assert_eq!(frame, [0x01, 0x00, 0x01, 0, 0, 0, 0, 0]);
    }

    #[test]
    fn filament_status_response_layout() {
        let frame = CabinetCommand::FilamentStatusResponse {
            valid: true,
            bitmap: 0b11,
        }
        .encode();
        assert_eq!(frame, [0x0E, 0x00, 0x03, 0, 0, 0, 0, 0]);

        let frame = CabinetCommand::FilamentStatusResponse {
            valid: false,
            bitmap: 0,
        }
        .encode();
        assert_eq!(frame, [0x0E, 0x01, 0x00, 0, 0, 0, 0, 0]);
    }

    #[test]
    fn mapping_response_layout() {
        let frame = CabinetCommand::FeederMappingResponse {
            left: 1,
            right: 0,
            status: 0,
        }
        .encode();
        assert_eq!(frame, [0x11, 0x01, 0x00, 0x00, 0, 0, 0, 0]);
    }

    #[test]
    fn classify_filament_query() {
        let frame = [code::QUERY_FILAMENT_STATUS, 0, 0, 0, 0, 0, 0, 0];
        assert_eq!(classify(&frame), Some(InboundFrame::FilamentQuery));
    }

    #[test]
    fn classify_valid_mapping_set() {
        let frame = [code::SET_FEEDER_MAPPING, 0x01, 0x00, 0, 0, 0, 0, 0];
        assert_eq!(
            classify(&frame),
            Some(InboundFrame::MappingSet { left: 1, right: 0 })
        );
    }

    #[test]
    fn classify_rejects_bad_mapping_set() {
        // out of range
        let frame = [code::SET_FEEDER_MAPPING, 0x02, 0x00, 0, 0, 0, 0, 0];
        assert_eq!(classify(&frame), None);
        // not distinct
        let frame = [code::SET_FEEDER_MAPPING, 0x01, 0x01, 0, 0, 0, 0, 0];
        assert_eq!(classify(&frame), None);
    }

    #[test]
    fn classify_rfid_frames() {
        for cmd in [
            code::RFID_NOTIFY_START,
            code::RFID_RESPONSE_START,
            code::RFID_PACKET,
            code::RFID_END,
            code::RFID_ERROR,
        ] {
            let frame = [cmd, 1, 2, 3, 4, 5, 6, 7];
            assert_eq!(classify(&frame), Some(InboundFrame::Rfid(frame)));
        }
    }

    #[test]
    fn classify_unknown_as_status() {
        let frame = [0x02, 0x32, 0x00, 0, 0, 0, 0, 0];
        match classify(&frame) {
            Some(InboundFrame::Status(report)) => {
                assert_eq!(report.status, 0x02);
                assert_eq!(report.progress, 0x32);
                assert_eq!(report.cabinet_status(), CabinetStatus::Feeding);
            }
            other => panic!("expected status event, got {other:?}"),
        }
    }

    #[test]
    fn handshake_constants() {
        assert_eq!(HANDSHAKE_REQUEST.len(), 8);
        assert_eq!(HANDSHAKE_REQUEST[0], 0x01);
        assert_eq!(HANDSHAKE_REQUEST[7], HANDSHAKE_ACK);
    }
}
