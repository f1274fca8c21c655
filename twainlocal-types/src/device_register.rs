//! Persisted scanner identity
//!
//! The register remembers the single scanner a device host exposes:
//! its friendly name (`ty`), serial number and note. The instance name
//! used for advertising is derived from the first two.

use std::fmt;
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// One registered scanner
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisteredDevice {
    /// User readable friendly name
    pub ty: String,

    /// Serial number reported by the driver
    pub serial_number: String,

    /// Free form note, defaults to `ty`
    pub note: String,

    /// `ty_serial` with anything outside `[A-Za-z0-9_]` replaced by `_`
    pub instance_name: String,
}

impl RegisteredDevice {
    pub fn new(
        ty: impl Into<String>,
        serial_number: impl Into<String>,
        note: impl Into<String>,
    ) -> Result<Self> {
        let ty = ty.into();
        if ty.is_empty() {
            return Err(Error::Validation("twainLocalTy is empty".into()));
        }

        let serial_number = serial_number.into();
        let mut note = note.into();
        if note.is_empty() {
            note = ty.clone();
        }

        let instance_name = instance_name(&ty, &serial_number);

        Ok(Self {
            ty,
            serial_number,
            note,
            instance_name,
        })
    }
}

impl fmt::Display for RegisteredDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Scanner[{}, SN: {}]", self.ty, self.serial_number)
    }
}

fn instance_name(ty: &str, serial_number: &str) -> String {
    format!("{}_{}", ty, serial_number)
        .chars()
        .map(|c| if c.is_alphanumeric() || c == '_' { c } else { '_' })
        .collect()
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ScannerFile {
    #[serde(default)]
    twain_local_ty: String,
    #[serde(default)]
    twain_local_serial_number: String,
    #[serde(default)]
    twain_local_note: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct RegisterFile {
    scanner: ScannerFile,
}

/// Device register backed by a small JSON file
#[derive(Debug, Clone, Default)]
pub struct DeviceRegister {
    device: Option<RegisteredDevice>,
}

impl DeviceRegister {
    pub fn new() -> Self {
        Self::default()
    }

    /// Forget the registered scanner
    pub fn clear(&mut self) {
        self.device = None;
    }

    /// Get the registered scanner, if any
    pub fn device(&self) -> Option<&RegisteredDevice> {
        self.device.as_ref()
    }

    /// Add or replace the registered scanner
    ///
    /// An empty `ty` clears the register and is reported as a validation error.
    pub fn set(&mut self, ty: &str, serial_number: &str, note: &str) -> Result<()> {
        self.device = None;
        self.device = Some(RegisteredDevice::new(ty, serial_number, note)?);
        Ok(())
    }

    /// Load the register from `path`
    ///
    /// Returns `Ok(false)` when the file does not exist. A malformed file
    /// leaves the register empty.
    pub fn load(&mut self, path: impl AsRef<Path>) -> Result<bool> {
        let path = path.as_ref();
        if !path.exists() {
            return Ok(false);
        }

        self.device = None;

        let text = fs::read_to_string(path)?;
        let file: RegisterFile =
            serde_json::from_str(&text).map_err(|e| Error::Parse(e.to_string()))?;

        self.set(
            &file.scanner.twain_local_ty,
            &file.scanner.twain_local_serial_number,
            &file.scanner.twain_local_note,
        )?;

        Ok(true)
    }

    /// Persist the register to `path`, replacing any previous file
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let scanner = match &self.device {
            Some(device) => ScannerFile {
                twain_local_ty: device.ty.clone(),
                twain_local_serial_number: device.serial_number.clone(),
                twain_local_note: device.note.clone(),
            },
            None => ScannerFile::default(),
        };

        let text = serde_json::to_string_pretty(&RegisterFile { scanner })
            .map_err(|e| Error::Parse(e.to_string()))?;
        fs::write(path, text + "\n")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_instance_name_sanitized() {
        let device = RegisteredDevice::new("Acme fi-7160", "A1-22/3", "").unwrap();
        assert_eq!(device.instance_name, "Acme_fi_7160_A1_22_3");
        assert_eq!(device.note, "Acme fi-7160");
    }

    #[test]
    fn test_set_rejects_empty_ty() {
        let mut register = DeviceRegister::new();
        register.set("scanner", "1", "desk").unwrap();
        assert!(register.set("", "1", "desk").is_err());
        assert!(register.device().is_none());
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("register.txt");

        let mut register = DeviceRegister::new();
        register.set("Office Scanner", "SN42", "second floor").unwrap();
        register.save(&path).unwrap();

        let text = fs::read_to_string(&path).unwrap();
        assert!(text.contains("\"twainLocalTy\": \"Office Scanner\""));

        let mut loaded = DeviceRegister::new();
        assert!(loaded.load(&path).unwrap());
        assert_eq!(loaded.device(), register.device());
    }

    #[test]
    fn test_load_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let mut register = DeviceRegister::new();
        assert!(!register.load(dir.path().join("nope.txt")).unwrap());
        assert!(register.device().is_none());
    }

    #[test]
    fn test_load_malformed_file_clears() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("register.txt");
        fs::write(&path, "{ not json").unwrap();

        let mut register = DeviceRegister::new();
        register.set("scanner", "1", "").unwrap();
        assert!(register.load(&path).is_err());
        assert!(register.device().is_none());
    }
}
