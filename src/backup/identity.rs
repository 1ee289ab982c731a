// src/backup/identity.rs

//! What a tablet reports about itself
//!
//! Recorded in every snapshot and read again before a restore so that a
//! snapshot is not written onto hardware it was never taken from.

use crate::device::Connection;
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};

pub const VERSION_FILE: &str = "/etc/version";
pub const SERIAL_FILE: &str = "/sys/devices/soc0/serial_number";
pub const MODEL_FILE: &str = "/sys/devices/soc0/machine";

/// Device files read by [`DeviceIdentity::read_from`]
pub const IDENTITY_FILES: [&str; 3] = [VERSION_FILE, SERIAL_FILE, MODEL_FILE];

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceIdentity {
    /// Firmware build
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub osver: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub serial: Option<String>,
    /// Hardware model, e.g. "reMarkable 2.0"
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

/// One field on which a snapshot and a device disagree
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdentityMismatch {
    pub field: &'static str,
    pub recorded: String,
    pub current: String,
}

impl DeviceIdentity {
    /// Read the identity files; a missing file leaves its field unset
    pub fn read_from(conn: &mut dyn Connection) -> Result<Self> {
        Ok(Self {
            osver: read_field(conn, VERSION_FILE)?,
            serial: read_field(conn, SERIAL_FILE)?,
            model: read_field(conn, MODEL_FILE)?,
        })
    }

    pub fn is_known(&self) -> bool {
        self.osver.is_some() || self.serial.is_some() || self.model.is_some()
    }

    /// Fields known on both sides that differ
    pub fn differences(&self, current: &DeviceIdentity) -> Vec<IdentityMismatch> {
        [
            ("model", &self.model, &current.model),
            ("serial", &self.serial, &current.serial),
            ("osver", &self.osver, &current.osver),
        ]
        .into_iter()
        .filter_map(|(field, recorded, now)| match (recorded, now) {
            (Some(recorded), Some(now)) if recorded != now => Some(IdentityMismatch {
                field,
                recorded: recorded.clone(),
                current: now.clone(),
            }),
            _ => None,
        })
        .collect()
    }
}

fn read_field(conn: &mut dyn Connection, path: &str) -> Result<Option<String>> {
    match conn.read_file(path) {
        Ok(bytes) => {
            // sysfs strings carry a trailing newline and sometimes a NUL
            let text = String::from_utf8_lossy(&bytes);
            let text = text.trim_matches(|c: char| c.is_whitespace() || c == '\0');
            Ok((!text.is_empty()).then(|| text.to_string()))
        }
        Err(Error::NotFound(_)) => Ok(None),
        Err(e) => Err(e),
    }
}
