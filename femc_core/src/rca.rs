//! Relative Channel Addresses (RCAs) and the subsystem classifier.
//!
//! Every module on the front-end bus is reached through a 24-bit RCA. The
//! address space is partitioned by fixed-priority bitmask rules, and several
//! blocks overlap bit patterns (the AMBSI generic-interface block at 0x30000
//! shares bits with "special monitor + command flag"), so [`Rca::decode`]
//! must test the rules in exactly the order written here.

use std::fmt;

use serde::Serialize;

/// Command (control) flag bit within the 24-bit address space.
pub const COMMAND_FLAG: u32 = 0x10000;

/// AMBSI generic-interface firmware block.
const GENERIC_BASE: u32 = 0x30000;
/// Special control points (firmware setup, FE mode).
const SPECIAL_CONTROL_BASE: u32 = 0x21000;
/// Special monitor points (firmware revisions, error queue).
const SPECIAL_MONITOR_BASE: u32 = 0x20000;

/// A 24-bit Relative Channel Address. Immutable value type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct Rca(u32);

/// Subsystem classification of an RCA, used for log summaries and for the
/// transaction logger's cartridge column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RcaClass {
    /// Address zero: the AMBSI serial-number request sentinel.
    SerialNumber,
    /// AMBSI generic-interface block (0x30000..=0x3FFFF).
    GenericInterface { offset: u16 },
    /// Special control block (0x21000..=0x21FFF).
    SpecialControl { offset: u16 },
    /// Special monitor block (0x20000..=0x20FFF).
    SpecialMonitor { offset: u16 },
    /// Power distribution module; `channel` is the powered cartridge slot
    /// when the per-channel sub-index is nonzero.
    PowerDistribution { channel: Option<u8>, offset: u8 },
    IfSwitch { offset: u16 },
    Cryostat { offset: u16 },
    /// LO photonic receiver.
    Lpr { offset: u16 },
    /// High-nibble blocks 0xE and 0xF carry no implemented hardware.
    Unimplemented { block: u8 },
    /// Cartridge temperature-sensor sub-block.
    CartridgeTemp { cartridge: u8, offset: u16 },
    /// Cartridge LO-synthesizer (WCA) sub-block.
    CartridgeLo { cartridge: u8, offset: u16 },
    /// Cartridge cold-cartridge bias sub-block.
    CartridgeBias { cartridge: u8, offset: u16 },
}

/// Full decode of an RCA: subsystem class plus the command flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RcaDecode {
    pub class: RcaClass,
    pub is_command: bool,
}

impl Rca {
    /// Build an RCA, masking to the 24-bit address space.
    pub const fn new(raw: u32) -> Self {
        Rca(raw & 0x00FF_FFFF)
    }

    /// Raw 24-bit value.
    pub const fn raw(self) -> u32 {
        self.0
    }

    /// The same address with the command flag set.
    pub const fn as_command(self) -> Self {
        Rca(self.0 | COMMAND_FLAG)
    }

    /// The same address with the command flag cleared.
    pub const fn as_monitor(self) -> Self {
        Rca(self.0 & !COMMAND_FLAG)
    }

    /// Cartridge bias monitor point: `cartridge` 0-9, 12-bit offset.
    pub const fn cartridge_bias(cartridge: u8, offset: u16) -> Self {
        Rca(((cartridge as u32) << 12) | (offset as u32 & 0xFFF))
    }

    /// Cryostat monitor point.
    pub const fn cryostat(offset: u16) -> Self {
        Rca(0xC000 | (offset as u32 & 0xFFF))
    }

    /// IF switch monitor point.
    pub const fn if_switch(offset: u16) -> Self {
        Rca(0xB000 | (offset as u32 & 0xFFF))
    }

    /// LO photonic receiver monitor point.
    pub const fn lpr(offset: u16) -> Self {
        Rca(0xD000 | (offset as u32 & 0xFFF))
    }

    /// Power distribution point; `channel` None addresses the module itself.
    pub const fn power_dist(channel: Option<u8>, offset: u8) -> Self {
        let sub = match channel {
            Some(ch) => ch as u32 + 1,
            None => 0,
        };
        Rca(0xA000 | (sub << 8) | offset as u32)
    }

    /// Special monitor point.
    pub const fn special_monitor(offset: u16) -> Self {
        Rca(SPECIAL_MONITOR_BASE | (offset as u32 & 0xFFF))
    }

    /// Special control point.
    pub const fn special_control(offset: u16) -> Self {
        Rca(SPECIAL_CONTROL_BASE | (offset as u32 & 0xFFF))
    }

    /// Classify this address. Total over the entire 24-bit space: every value
    /// yields either a subsystem or an explicit `Unimplemented`, never a
    /// panic. The tests below depend on the ordering of these rules.
    pub fn decode(self) -> RcaDecode {
        // Rule 1: exact base-prefix blocks, tested before the command flag is
        // masked. The generic block overlaps SPECIAL_MONITOR | COMMAND_FLAG.
        if self.0 == 0 {
            return RcaDecode {
                class: RcaClass::SerialNumber,
                is_command: false,
            };
        }
        if (self.0 & 0xF_0000) == GENERIC_BASE {
            return RcaDecode {
                class: RcaClass::GenericInterface {
                    offset: (self.0 & 0xFFFF) as u16,
                },
                is_command: true,
            };
        }
        if (self.0 & 0xF_F000) == SPECIAL_CONTROL_BASE {
            return RcaDecode {
                class: RcaClass::SpecialControl {
                    offset: (self.0 & 0xFFF) as u16,
                },
                is_command: true,
            };
        }
        if (self.0 & 0xF_F000) == SPECIAL_MONITOR_BASE {
            return RcaDecode {
                class: RcaClass::SpecialMonitor {
                    offset: (self.0 & 0xFFF) as u16,
                },
                is_command: false,
            };
        }

        // Rule 2: strip the command flag, classify the low 16 bits.
        let is_command = (self.0 & COMMAND_FLAG) != 0;
        let masked = self.0 & !COMMAND_FLAG & 0xFFFF;
        let nibble = ((masked >> 12) & 0xF) as u8;
        let offset = (masked & 0xFFF) as u16;

        // Rule 3: fixed-module high nibbles, first match wins.
        let class = match nibble {
            0xA => {
                let sub = ((masked >> 8) & 0xF) as u8;
                RcaClass::PowerDistribution {
                    channel: if sub == 0 { None } else { Some(sub - 1) },
                    offset: (masked & 0xFF) as u8,
                }
            }
            0xB => RcaClass::IfSwitch { offset },
            0xC => RcaClass::Cryostat { offset },
            0xD => RcaClass::Lpr { offset },
            // Rule 4: blocks with no hardware behind them.
            0xE | 0xF => RcaClass::Unimplemented { block: nibble },
            // Rule 5: high nibble is the cartridge index 0-9.
            cart => {
                if (offset & 0x880) == 0x880 {
                    RcaClass::CartridgeTemp {
                        cartridge: cart,
                        offset,
                    }
                } else if (offset & 0x800) != 0 {
                    RcaClass::CartridgeLo {
                        cartridge: cart,
                        offset,
                    }
                } else {
                    RcaClass::CartridgeBias {
                        cartridge: cart,
                        offset,
                    }
                }
            }
        };
        RcaDecode { class, is_command }
    }

    /// The 0-based cartridge index this address belongs to, where one applies.
    pub fn cartridge(self) -> Option<u8> {
        match self.decode().class {
            RcaClass::CartridgeTemp { cartridge, .. }
            | RcaClass::CartridgeLo { cartridge, .. }
            | RcaClass::CartridgeBias { cartridge, .. } => Some(cartridge),
            RcaClass::PowerDistribution { channel, .. } => channel,
            _ => None,
        }
    }
}

impl fmt::Display for Rca {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:06X}", self.0)
    }
}

impl RcaClass {
    /// Short subsystem tag for log lines.
    pub fn tag(&self) -> &'static str {
        match self {
            RcaClass::SerialNumber => "AMBSI_SN",
            RcaClass::GenericInterface { .. } => "AMBSI",
            RcaClass::SpecialControl { .. } => "SPECIAL_C",
            RcaClass::SpecialMonitor { .. } => "SPECIAL_M",
            RcaClass::PowerDistribution { .. } => "POWER",
            RcaClass::IfSwitch { .. } => "IFSWITCH",
            RcaClass::Cryostat { .. } => "CRYOSTAT",
            RcaClass::Lpr { .. } => "LPR",
            RcaClass::Unimplemented { .. } => "UNIMPL",
            RcaClass::CartridgeTemp { .. } => "CART_TEMP",
            RcaClass::CartridgeLo { .. } => "CART_LO",
            RcaClass::CartridgeBias { .. } => "CART_BIAS",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serial_number_sentinel() {
        let d = Rca::new(0).decode();
        assert_eq!(d.class, RcaClass::SerialNumber);
        assert!(!d.is_command);
    }

    #[test]
    fn generic_block_beats_command_flag() {
        // 0x30000 == SPECIAL_MONITOR_BASE | COMMAND_FLAG; the generic block
        // must win.
        let d = Rca::new(0x30012).decode();
        assert_eq!(d.class, RcaClass::GenericInterface { offset: 0x12 });
    }

    #[test]
    fn special_blocks() {
        assert_eq!(
            Rca::new(0x20005).decode().class,
            RcaClass::SpecialMonitor { offset: 5 }
        );
        assert_eq!(
            Rca::new(0x2100A).decode().class,
            RcaClass::SpecialControl { offset: 0xA }
        );
    }

    #[test]
    fn fixed_module_nibbles() {
        assert_eq!(
            Rca::new(0xB014).decode().class,
            RcaClass::IfSwitch { offset: 0x14 }
        );
        assert_eq!(
            Rca::new(0xC030).decode().class,
            RcaClass::Cryostat { offset: 0x30 }
        );
        assert_eq!(
            Rca::new(0xD002).decode().class,
            RcaClass::Lpr { offset: 2 }
        );
    }

    #[test]
    fn power_distribution_channels() {
        assert_eq!(
            Rca::new(0xA010).decode().class,
            RcaClass::PowerDistribution {
                channel: None,
                offset: 0x10
            }
        );
        // Sub-index 4 addresses cartridge power channel 3.
        assert_eq!(
            Rca::new(0xA40C).decode().class,
            RcaClass::PowerDistribution {
                channel: Some(3),
                offset: 0x0C
            }
        );
        assert_eq!(Rca::new(0xA40C).cartridge(), Some(3));
    }

    #[test]
    fn unimplemented_blocks_reject_without_panic() {
        assert_eq!(
            Rca::new(0xE123).decode().class,
            RcaClass::Unimplemented { block: 0xE }
        );
        assert_eq!(
            Rca::new(0xF000).decode().class,
            RcaClass::Unimplemented { block: 0xF }
        );
    }

    #[test]
    fn cartridge_sub_blocks() {
        // Bias: LO bit clear.
        assert_eq!(
            Rca::new(0x3008).decode().class,
            RcaClass::CartridgeBias {
                cartridge: 3,
                offset: 0x008
            }
        );
        // LO: bit 0x800 set, temperature mask not fully set.
        assert_eq!(
            Rca::new(0x5810).decode().class,
            RcaClass::CartridgeLo {
                cartridge: 5,
                offset: 0x810
            }
        );
        // Temperature: 0x880 mask fully set.
        assert_eq!(
            Rca::new(0x9884).decode().class,
            RcaClass::CartridgeTemp {
                cartridge: 9,
                offset: 0x884
            }
        );
    }

    #[test]
    fn command_flag_stripped_for_classification() {
        let d = Rca::new(0x13008).decode();
        assert!(d.is_command);
        assert_eq!(
            d.class,
            RcaClass::CartridgeBias {
                cartridge: 3,
                offset: 0x008
            }
        );
        assert_eq!(Rca::new(0x3008).as_command(), Rca::new(0x13008));
    }

    #[test]
    fn decode_is_total() {
        // Spot-sweep the space; classification never panics.
        for raw in (0..0x100_0000u32).step_by(0x101) {
            let _ = Rca::new(raw).decode();
        }
    }
}
