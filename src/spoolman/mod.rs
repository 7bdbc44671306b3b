//! Spoolman REST adapter
//!
//! Uploads decoded OpenTag records to a Spoolman instance: vendor is
//! fetched or created, the filament type is matched by material and color
//! or created, and a fresh spool is registered. The whole sync is wrapped
//! in the adapter's own bounded retry; callers treat it as one operation.

use std::time::Duration;

use serde::Deserialize;
use serde_json::{json, Value};
use thiserror::Error;
use tracing::{info, warn};

use crate::rfid::OpenTagRecord;

#[derive(Error, Debug)]
pub enum SpoolmanError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("unexpected response shape: {0}")]
    BadResponse(&'static str),

    #[error("sync failed after {attempts} attempts: {last_error}")]
    RetriesExhausted { attempts: u32, last_error: String },
}

/// Identifiers assigned by Spoolman during a sync
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncOutcome {
    pub vendor_id: u64,
    pub filament_id: u64,
    pub spool_id: u64,
}

#[derive(Debug, Deserialize)]
struct IdOnly {
    id: u64,
}

/// Spoolman API client
#[derive(Clone)]
pub struct SpoolmanClient {
    api_url: String,
    client: reqwest::Client,
    retry_count: u32,
    retry_interval: Duration,
}

impl SpoolmanClient {
    pub fn new(base_url: &str, retry_count: u32, retry_interval: Duration) -> Self {
        Self {
            api_url: format!("{}/api/v1", base_url.trim_end_matches('/')),
            client: reqwest::Client::new(),
            retry_count: retry_count.max(1),
            retry_interval,
        }
    }

    pub fn from_config(config: &crate::config::SpoolmanConfig) -> Self {
        Self::new(
            &config.url,
            config.retry_count,
            Duration::from_secs_f64(config.retry_interval),
        )
    }

    /// Upload one decoded record, retrying the whole sequence on failure.
    pub async fn sync(&self, record: &OpenTagRecord) -> Result<SyncOutcome, SpoolmanError> {
        let mut last_error = String::new();
        for attempt in 1..=self.retry_count {
            match self.sync_once(record).await {
                Ok(outcome) => {
                    info!(
                        vendor_id = outcome.vendor_id,
                        filament_id = outcome.filament_id,
                        spool_id = outcome.spool_id,
                        "record synced to Spoolman"
                    );
                    return Ok(outcome);
                }
                Err(err) => {
                    warn!(
                        attempt,
                        retries = self.retry_count,
                        error = %err,
                        "Spoolman sync attempt failed"
                    );
                    last_error = err.to_string();
                    if attempt < self.retry_count {
                        tokio::time::sleep(self.retry_interval).await;
                    }
                }
            }
        }
        Err(SpoolmanError::RetriesExhausted {
            attempts: self.retry_count,
            last_error,
        })
    }

    async fn sync_once(&self, record: &OpenTagRecord) -> Result<SyncOutcome, SpoolmanError> {
        let vendor_id = self.get_or_create_vendor(&record.manufacturer).await?;
        let filament_id = self.find_or_create_filament(record, vendor_id).await?;
        let spool_id = self.create_spool(record, filament_id).await?;
        Ok(SyncOutcome {
            vendor_id,
            filament_id,
            spool_id,
        })
    }

    async fn get_or_create_vendor(&self, name: &str) -> Result<u64, SpoolmanError> {
        let vendors: Vec<Value> = self
            .client
            .get(format!("{}/vendor", self.api_url))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        if let Some(existing) = vendors
            .iter()
            .find(|vendor| vendor.get("name").and_then(Value::as_str) == Some(name))
        {
            let id = existing
                .get("id")
                .and_then(Value::as_u64)
                .ok_or(SpoolmanError::BadResponse("vendor without id"))?;
            return Ok(id);
        }

        info!(vendor = name, "creating Spoolman vendor");
        let created: IdOnly = self
            .client
            .post(format!("{}/vendor", self.api_url))
            .json(&json!({ "name": name, "comment": "created from RFID import" }))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(created.id)
    }

    async fn find_or_create_filament(
        &self,
        record: &OpenTagRecord,
        vendor_id: u64,
    ) -> Result<u64, SpoolmanError> {
        let filaments: Vec<Value> = self
            .client
            .get(format!("{}/filament", self.api_url))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        let matching = filaments.iter().find(|filament| {
            filament.get("material").and_then(Value::as_str) == Some(record.material.as_str())
                && filament
                    .get("name")
                    .and_then(Value::as_str)
                    .is_some_and(|name| name.contains(record.color.as_str()))
        });
        if let Some(existing) = matching {
            let id = existing
                .get("id")
                .and_then(Value::as_u64)
                .ok_or(SpoolmanError::BadResponse("filament without id"))?;
            return Ok(id);
        }

        info!(
            material = %record.material,
            color = %record.color,
            "creating Spoolman filament"
        );
        let created: IdOnly = self
            .client
            .post(format!("{}/filament", self.api_url))
            .json(&filament_payload(record, vendor_id))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(created.id)
    }

    async fn create_spool(
        &self,
        record: &OpenTagRecord,
        filament_id: u64,
    ) -> Result<u64, SpoolmanError> {
        let created: IdOnly = self
            .client
            .post(format!("{}/spool", self.api_url))
            .json(&spool_payload(record, filament_id))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(created.id)
    }
}

/// Filament creation payload from a record; absent optional values are
/// omitted rather than sent as null.
fn filament_payload(record: &OpenTagRecord, vendor_id: u64) -> Value {
    let mut payload = json!({
        "name": format!("{} - {}", record.material, record.color),
        "vendor_id": vendor_id,
        "material": record.material,
        "diameter": f64::from(record.diameter_um) / 1000.0,
        "density": f64::from(record.density_ug_cm3) / 1000.0,
        "weight": record.weight_g,
        "settings_extruder_temp": record.print_temp_c,
        "settings_bed_temp": record.bed_temp_c,
    });
    let map = payload.as_object_mut().expect("literal is an object");
    if let Some(rgb) = record.color_rgb {
        map.insert("color_hex".to_string(), json!(format!("{rgb:06X}")));
    }
    if let Some(serial) = &record.serial {
        map.insert("comment".to_string(), json!(format!("RFID import: {serial}")));
    }
    payload
}

/// Spool creation payload; measured weight wins over the nominal one.
fn spool_payload(record: &OpenTagRecord, filament_id: u64) -> Value {
    let remaining = record.measured_weight_g.unwrap_or(record.weight_g);
    let mut payload = json!({
        "filament_id": filament_id,
        "remaining_weight": remaining,
    });
    let map = payload.as_object_mut().expect("literal is an object");
    if let Some(serial) = &record.serial {
        map.insert("lot_nr".to_string(), json!(serial));
    }
    if let Some(date) = record.manufacture_date {
        map.insert("registered".to_string(), json!(date.to_rfc3339()));
    }
    payload
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record() -> OpenTagRecord {
        OpenTagRecord {
            tag_version: 1,
            manufacturer: "MINGDA 3D".to_string(),
            material: "PLA-HS".to_string(),
            color: "White".to_string(),
            diameter_um: 1750,
            weight_g: 1000,
            print_temp_c: 210,
            bed_temp_c: 60,
            density_ug_cm3: 1240,
            serial: Some("TEST-001".to_string()),
            color_rgb: Some(0x00FF_FFFF),
            measured_weight_g: Some(985),
            ..OpenTagRecord::default()
        }
    }

    #[test]
    fn filament_payload_converts_units() {
        let payload = filament_payload(&record(), 3);
        assert_eq!(payload["vendor_id"], 3);
        assert_eq!(payload["name"], "PLA-HS - White");
        assert_eq!(payload["diameter"], 1.75);
        assert_eq!(payload["density"], 1.24);
        assert_eq!(payload["settings_extruder_temp"], 210);
        assert_eq!(payload["color_hex"], "FFFFFF");
        assert_eq!(payload["comment"], "RFID import: TEST-001");
    }

    #[test]
    fn filament_payload_omits_absent_fields() {
        let mut bare = record();
        bare.serial = None;
        bare.color_rgb = None;
        let payload = filament_payload(&bare, 1);
        assert!(payload.get("color_hex").is_none());
        assert!(payload.get("comment").is_none());
    }

    #[test]
    fn spool_payload_prefers_measured_weight() {
        let payload = spool_payload(&record(), 9);
        assert_eq!(payload["filament_id"], 9);
        assert_eq!(payload["remaining_weight"], 985);
        assert_eq!(payload["lot_nr"], "TEST-001");

        let mut nominal_only = record();
        nominal_only.measured_weight_g = None;
        let payload = spool_payload(&nominal_only, 9);
        assert_eq!(payload["remaining_weight"], 1000);
    }

    #[test]
    fn client_builds_api_url() {
        let client = SpoolmanClient::new("http://localhost:7912/", 3, Duration::from_secs(1));
        assert_eq!(client.api_url, "http://localhost:7912/api/v1");
    }
}
