//! Filter for USB devices reported by external watchers
//!
//! Devices with a CTAPHID interface are always relevant. Devices that only
//! offer a CCID interface are admitted if their vendor and product id belong
//! to a tested security key, or if untested devices are allowed.

use derive_more::Display;

const VENDOR_YUBICO: u16 = 0x1050;
const VENDOR_NITROKEY: u16 = 0x20A0;
const VENDOR_FSIJ: u16 = 0x234B;
const VENDOR_LEDGER: u16 = 0x2C97;
const VENDOR_GEMALTO: u16 = 0x08E6;
const VENDOR_ONLYKEY: u16 = 0x16C0;
const VENDOR_ONLYKEY_2: u16 = 0x1D50;
const VENDOR_ACS: u16 = 0x072F;

/// USB interface classes a watcher found on a device
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UsbInterfaces {
    /// FIDO HID interface (usage page 0xF1D0)
    pub ctaphid: bool,
    /// Smart card interface (class 0x0B)
    pub ccid: bool,
}

/// What a watcher knows about an attached USB device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[display("{vendor_id:04x}:{product_id:04x}")]
pub struct UsbDeviceInfo {
    /// USB vendor id
    pub vendor_id: u16,
    /// USB product id
    pub product_id: u16,
    /// Interfaces offered by the device
    pub interfaces: UsbInterfaces,
}

impl UsbDeviceInfo {
    /// Describe a device
    pub const fn new(vendor_id: u16, product_id: u16, interfaces: UsbInterfaces) -> Self {
        Self {
            vendor_id,
            product_id,
            interfaces,
        }
    }
}

/// Whether the device is a security key known to work
pub const fn is_tested_security_key(vendor_id: u16, product_id: u16) -> bool {
    matches!(
        (vendor_id, product_id),
        (VENDOR_YUBICO, 0x0111 | 0x0112 | 0x0115 | 0x0116 | 0x0404..=0x0407)
            | (VENDOR_NITROKEY, 0x4108 | 0x4109 | 0x4211)
            | (VENDOR_FSIJ | VENDOR_LEDGER, _)
            | (VENDOR_GEMALTO, 0x5503)
            | (VENDOR_ACS, 0x223E)
            | (VENDOR_ONLYKEY, 0x0486)
            | (VENDOR_ONLYKEY_2, 0x60FC)
    )
}

/// Decides which USB devices a watcher offers to the manager
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UsbDeviceFilter {
    allow_untested: bool,
}

impl UsbDeviceFilter {
    /// Create a filter, optionally admitting untested CCID devices
    pub const fn new(allow_untested: bool) -> Self {
        Self { allow_untested }
    }

    /// Whether untested CCID devices are admitted
    pub const fn allows_untested(&self) -> bool {
        self.allow_untested
    }

    /// Whether the device should be offered
    pub const fn is_relevant(&self, device: &UsbDeviceInfo) -> bool {
        if device.interfaces.ctaphid {
            return true;
        }
        if !device.interfaces.ccid {
            return false;
        }
        self.allow_untested || is_tested_security_key(device.vendor_id, device.product_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CCID: UsbInterfaces = UsbInterfaces {
        ctaphid: false,
        ccid: true,
    };

    #[test]
    fn test_tested_keys() {
        assert!(is_tested_security_key(0x1050, 0x0407));
        assert!(is_tested_security_key(0x20A0, 0x4211));
        assert!(is_tested_security_key(0x234B, 0x0000));
        assert!(is_tested_security_key(0x1D50, 0x60FC));
        assert!(!is_tested_security_key(0x1050, 0x0010));
        assert!(!is_tested_security_key(0x1234, 0x5678));
    }

    #[test]
    fn test_ctaphid_is_always_relevant() {
        let device = UsbDeviceInfo::new(
            0x1234,
            0x5678,
            UsbInterfaces {
                ctaphid: true,
                ccid: false,
            },
        );
        assert!(UsbDeviceFilter::new(false).is_relevant(&device));
    }

    #[test]
    fn test_untested_ccid_needs_opt_in() {
        let untested = UsbDeviceInfo::new(0x1234, 0x5678, CCID);
        assert!(!UsbDeviceFilter::new(false).is_relevant(&untested));
        assert!(UsbDeviceFilter::new(true).is_relevant(&untested));

        let yubikey = UsbDeviceInfo::new(0x1050, 0x0404, CCID);
        assert!(UsbDeviceFilter::new(false).is_relevant(&yubikey));
        assert_eq!(yubikey.to_string(), "1050:0404");
    }

    #[test]
    fn test_device_without_key_interfaces_is_ignored() {
        let device = UsbDeviceInfo::new(0x1050, 0x0404, UsbInterfaces::default());
        assert!(!UsbDeviceFilter::new(true).is_relevant(&device));
    }
}
