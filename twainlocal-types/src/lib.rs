//! Type definitions for twainlocal

pub mod device_register;
pub mod error;

pub use device_register::{DeviceRegister, RegisteredDevice};
pub use error::{Error, Result};
