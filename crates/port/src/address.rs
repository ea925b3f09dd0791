//! Device selection strings
//!
//! A port is opened from a selection string of the form
//! `VID=0x1234:PID=0x5678[:SID=serial][:bInterfaceNumber=0]`.
//! The serial number disambiguates between several attached devices with the
//! same VID/PID pair; the interface number selects one of several USBTMC
//! interfaces on the same device.

use common::PortError;
use std::fmt;

/// Parsed device selection string
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceAddress {
    /// USB vendor id
    pub vendor_id: u16,
    /// USB product id
    pub product_id: u16,
    /// Optional serial number for disambiguation
    pub serial: Option<String>,
    /// USBTMC interface number on the device
    pub interface: u8,
}

impl DeviceAddress {
    /// Create an address from vendor and product id, first interface
    pub fn new(vendor_id: u16, product_id: u16) -> Self {
        Self {
            vendor_id,
            product_id,
            serial: None,
            interface: 0,
        }
    }

    /// Parse a selection string
    ///
    /// `VID` and `PID` are required and come first; `SID` and
    /// `bInterfaceNumber` are optional and may appear in either order.
    pub fn parse(s: &str) -> Result<Self, PortError> {
        let mut vendor_id = None;
        let mut product_id = None;
        let mut serial = None;
        let mut interface = 0u8;

        for part in s.split(':') {
            let (key, value) = part
                .split_once('=')
                .ok_or_else(|| PortError::Setup(format!("Malformed field '{}' in '{}'", part, s)))?;
            match key {
                "VID" => vendor_id = Some(parse_id(value, s)?),
                "PID" => product_id = Some(parse_id(value, s)?),
                "SID" => serial = Some(value.to_string()),
                "bInterfaceNumber" => {
                    interface = value.parse().map_err(|_| {
                        PortError::Setup(format!("Invalid interface number '{}' in '{}'", value, s))
                    })?;
                }
                other => {
                    return Err(PortError::Setup(format!(
                        "Unknown field '{}' in '{}'",
                        other, s
                    )));
                }
            }
        }

        let vendor_id = vendor_id
            .ok_or_else(|| PortError::Setup(format!("Missing VID field in '{}'", s)))?;
        let product_id = product_id
            .ok_or_else(|| PortError::Setup(format!("Missing PID field in '{}'", s)))?;

        Ok(Self {
            vendor_id,
            product_id,
            serial,
            interface,
        })
    }
}

fn parse_id(value: &str, full: &str) -> Result<u16, PortError> {
    let digits = value.strip_prefix("0x").unwrap_or(value);
    u16::from_str_radix(digits, 16)
        .map_err(|_| PortError::Setup(format!("Invalid id '{}' in '{}'", value, full)))
}

impl fmt::Display for DeviceAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "VID=0x{:04X}:PID=0x{:04X}", self.vendor_id, self.product_id)?;
        if let Some(serial) = &self.serial {
            write!(f, ":SID={}", serial)?;
        }
        if self.interface != 0 {
            write!(f, ":bInterfaceNumber={}", self.interface)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_minimal() {
        let addr = DeviceAddress::parse("VID=0x0957:PID=0x4d18").unwrap();
        assert_eq!(addr.vendor_id, 0x0957);
        assert_eq!(addr.product_id, 0x4D18);
        assert_eq!(addr.serial, None);
        assert_eq!(addr.interface, 0);
    }

    #[test]
    fn test_parse_with_serial_and_interface() {
        let addr =
            DeviceAddress::parse("VID=0x0403:PID=0x6001:SID=MY47000585:bInterfaceNumber=1")
                .unwrap();
        assert_eq!(addr.vendor_id, 0x0403);
        assert_eq!(addr.product_id, 0x6001);
        assert_eq!(addr.serial.as_deref(), Some("MY47000585"));
        assert_eq!(addr.interface, 1);
    }

    #[test]
    fn test_parse_ids_without_prefix() {
        let addr = DeviceAddress::parse("VID=0957:PID=4d18").unwrap();
        assert_eq!(addr.vendor_id, 0x0957);
        assert_eq!(addr.product_id, 0x4D18);
    }

    #[test]
    fn test_parse_rejects_missing_pid() {
        assert!(matches!(
            DeviceAddress::parse("VID=0x0957"),
            Err(PortError::Setup(_))
        ));
    }

    #[test]
    fn test_parse_rejects_unknown_field() {
        assert!(matches!(
            DeviceAddress::parse("VID=0x0957:PID=0x4d18:BUS=2"),
            Err(PortError::Setup(_))
        ));
    }

    #[test]
    fn test_display_roundtrip() {
        let s = "VID=0x0957:PID=0x4D18:SID=abc:bInterfaceNumber=2";
        let addr = DeviceAddress::parse(s).unwrap();
        assert_eq!(addr.to_string(), s);
        assert_eq!(DeviceAddress::parse(&addr.to_string()).unwrap(), addr);
    }
}
