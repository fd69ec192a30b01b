//! Known receipt-printer vendors and the printer-class rule

use crate::bus::{DeviceDescriptor, PRINTER_CLASS};

/// USB vendor IDs of thermal/receipt printer manufacturers
const KNOWN_VENDORS: &[(u16, &str)] = &[
    (0x04b8, "Epson"),
    (0x0519, "Star Micronics"),
    (0x1504, "Bixolon"),
    (0x1d90, "Citizen"),
    (0x0dd4, "Custom"),
    (0x0619, "Seiko Instruments"),
    (0x154f, "SNBC"),
    (0x0a5f, "Zebra"),
    // Generic POS-58/80 boards
    (0x0416, "Winbond"),
    (0x0fe6, "ICS Advent"),
    (0x28e9, "GD32"),
];

/// How a device relates to receipt printing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Classification {
    pub is_known_vendor: bool,
    pub is_printer_class: bool,
    pub vendor_name: Option<&'static str>,
}

impl Classification {
    /// Whether the scanner should offer this device
    pub fn is_candidate(&self) -> bool {
        self.is_known_vendor || self.is_printer_class
    }
}

/// Look up a vendor name by USB vendor ID
pub fn vendor_name(vendor_id: u16) -> Option<&'static str> {
    KNOWN_VENDORS
        .iter()
        .find(|(vid, _)| *vid == vendor_id)
        .map(|(_, name)| *name)
}

/// Classify a device descriptor
pub fn classify(descriptor: &DeviceDescriptor) -> Classification {
    let vendor_name = vendor_name(descriptor.vendor_id);
    Classification {
        is_known_vendor: vendor_name.is_some(),
        is_printer_class: descriptor.device_class == PRINTER_CLASS,
        vendor_name,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn desc(vendor_id: u16, device_class: u8) -> DeviceDescriptor {
        DeviceDescriptor {
            bus_index: 0,
            bus_number: 1,
            address: 1,
            vendor_id,
            product_id: 0x0001,
            device_class,
            interface_class: Some(PRINTER_CLASS),
        }
    }

    #[test]
    fn test_printer_class_regardless_of_vendor() {
        for vid in [0x0000, 0x04b8, 0x1234, 0xffff] {
            assert!(classify(&desc(vid, 7)).is_printer_class, "vid {vid:04x}");
        }
        // a printer-class interface does not make the device printer class
        assert!(!classify(&desc(0x04b8, 0)).is_printer_class);
        assert!(!classify(&desc(0x04b8, 0xff)).is_printer_class);
    }

    #[test]
    fn test_every_catalog_vendor_is_known() {
        for (vid, name) in KNOWN_VENDORS {
            let c = classify(&desc(*vid, 0));
            assert!(c.is_known_vendor);
            assert_eq!(c.vendor_name, Some(*name));
            assert!(c.is_candidate());
        }
    }

    #[test]
    fn test_unknown_vendor() {
        let c = classify(&desc(0x1234, 0));
        assert!(!c.is_known_vendor);
        assert_eq!(c.vendor_name, None);
        assert!(!c.is_candidate());
    }

    #[test]
    fn test_epson_mapping() {
        assert_eq!(vendor_name(0x04b8), Some("Epson"));
    }
}
