/*
    QICTape

    Copyright 2022-2025 Daniel Balsom

    Permission is hereby granted, free of charge, to any person obtaining a
    copy of this software and associated documentation files (the “Software”),
    to deal in the Software without restriction, including without limitation
    the rights to use, copy, modify, merge, publish, distribute, sublicense,
    and/or sell copies of the Software, and to permit persons to whom the
    Software is furnished to do so, subject to the following conditions:

    The above copyright notice and this permission notice shall be included in
    all copies or substantial portions of the Software.

    THE SOFTWARE IS PROVIDED “AS IS”, WITHOUT WARRANTY OF ANY KIND, EXPRESS OR
    IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY,
    FITNESS FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE
    AUTHORS OR COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER
    LIABILITY, WHETHER IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING
    FROM, OUT OF OR IN CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER
    DEALINGS IN THE SOFTWARE.

    --------------------------------------------------------------------------
*/

//! Known drive vendors and the wake-up method each one answers to.

use std::str::FromStr;

use serde::Deserialize;
use strum_macros::Display;

/// How a drive is brought onto the floppy bus. Most QIC-117 drives sit deselected until
/// they see a vendor-specific select sequence.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash, Display, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WakeupMethod {
    /// Always selected, no sequence needed.
    #[default]
    None,
    /// Phantom select command.
    Colorado,
    /// Soft select command followed by a parameter.
    Mountain,
    /// Floppy motor enable line of the drive's unit.
    Insight,
}

impl WakeupMethod {
    /// Order in which the methods are tried when the drive is unknown.
    pub const PROBE_ORDER: [WakeupMethod; 4] = [
        WakeupMethod::None,
        WakeupMethod::Colorado,
        WakeupMethod::Mountain,
        WakeupMethod::Insight,
    ];
}

impl FromStr for WakeupMethod {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, String> {
        match s.to_lowercase().as_str() {
            "none" => Ok(WakeupMethod::None),
            "colorado" => Ok(WakeupMethod::Colorado),
            "mountain" => Ok(WakeupMethod::Mountain),
            "insight" => Ok(WakeupMethod::Insight),
            _ => Err("Bad value for wakeup method".to_string()),
        }
    }
}

#[derive(Copy, Clone, Debug)]
pub struct VendorInfo {
    pub vendor_id: u16,
    pub wakeup: WakeupMethod,
    pub name: &'static str,
}

pub const UNKNOWN_VENDOR: u16 = 0xffff;

pub const VENDORS: &[VendorInfo] = &[
    VendorInfo {
        vendor_id: 0x0001,
        wakeup: WakeupMethod::Colorado,
        name: "Colorado Memory Systems QIC-40",
    },
    VendorInfo {
        vendor_id: 0x0002,
        wakeup: WakeupMethod::Colorado,
        name: "Colorado Memory Systems QIC-80",
    },
    VendorInfo {
        vendor_id: 0x0047,
        wakeup: WakeupMethod::Colorado,
        name: "Colorado Memory Systems Trakker",
    },
    VendorInfo {
        vendor_id: 0x0080,
        wakeup: WakeupMethod::Mountain,
        name: "Mountain FS8000",
    },
    VendorInfo {
        vendor_id: 0x0146,
        wakeup: WakeupMethod::Insight,
        name: "Insight 80Mb",
    },
    VendorInfo {
        vendor_id: 0x0300,
        wakeup: WakeupMethod::None,
        name: "Conner C250MQT",
    },
    VendorInfo {
        vendor_id: 0x0388,
        wakeup: WakeupMethod::None,
        name: "Iomega 250",
    },
    VendorInfo {
        vendor_id: 0x0701,
        wakeup: WakeupMethod::None,
        name: "Irwin 285",
    },
];

pub fn lookup_vendor(vendor_id: u16) -> Option<&'static VendorInfo> {
    VENDORS.iter().find(|v| v.vendor_id == vendor_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lookup() {
        assert_eq!(lookup_vendor(0x0080).map(|v| v.wakeup), Some(WakeupMethod::Mountain));
        assert!(lookup_vendor(UNKNOWN_VENDOR).is_none());
    }
}
