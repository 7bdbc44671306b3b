//! feeder-hub: automatic filament refill bridge
//!
//! Couples a Klipper/Moonraker printer (JSON-RPC over WebSocket) with a
//! filament feeder cabinet (CAN bus) to coordinate runout detection,
//! pausing, refeeding and resuming, plus RFID spool identification.

pub mod can;
pub mod common;
pub mod config;
pub mod coordinator;
pub mod klipper;
pub mod logging;
pub mod mapping;
pub mod rfid;
pub mod spoolman;
