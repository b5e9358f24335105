//! USB definitions shared by the capture decoder and the fold engine.

use clap::ValueEnum;
use num_enum::{FromPrimitive, IntoPrimitive};

use crate::pcapng::{
    LINKTYPE_USB_2_0_FULL_SPEED,
    LINKTYPE_USB_2_0_HIGH_SPEED,
    LINKTYPE_USB_2_0_LOW_SPEED,
};

/// USB packet identifiers, as they appear in the first payload byte.
#[allow(clippy::upper_case_acronyms)]
#[derive(Copy, Clone, Debug, Default, IntoPrimitive, FromPrimitive, PartialEq, Eq)]
#[repr(u8)]
pub enum PID {
    RSVD  = 0xF0,
    OUT   = 0xE1,
    ACK   = 0xD2,
    DATA0 = 0xC3,
    PING  = 0xB4,
    SOF   = 0xA5,
    NYET  = 0x96,
    DATA2 = 0x87,
    SPLIT = 0x78,
    IN    = 0x69,
    NAK   = 0x5A,
    DATA1 = 0x4B,
    ERR   = 0x3C,
    SETUP = 0x2D,
    STALL = 0x1E,
    MDATA = 0x0F,
    #[default]
    Malformed = 0,
}

/// Capture speed selected on the command line.
#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
pub enum Speed {
    /// Low-Speed (1.5 Mbps)
    #[value(name = "ls")]
    Low,
    /// Full-Speed (12 Mbps)
    #[value(name = "fs")]
    Full,
    /// High-Speed (480 Mbps)
    #[value(name = "hs")]
    High,
}

impl Speed {
    /// Value written to the Speed0/Speed1 capture-control registers.
    pub fn control_bits(self) -> u8 {
        use Speed::*;
        match self {
            Low  => 0,
            Full => 1,
            High => 2,
        }
    }

    /// pcapng link type for the capture interface.
    pub fn link_type(self) -> u16 {
        use Speed::*;
        match self {
            Low  => LINKTYPE_USB_2_0_LOW_SPEED,
            Full => LINKTYPE_USB_2_0_FULL_SPEED,
            High => LINKTYPE_USB_2_0_HIGH_SPEED,
        }
    }
}

/// Bus speed as reported in the status frame speed field.
#[derive(Copy, Clone, Debug, IntoPrimitive, FromPrimitive, PartialEq, Eq)]
#[repr(u8)]
pub enum BusSpeed {
    Low  = 0,
    Full = 1,
    High = 2,
    /// The hardware reports this value while the bus is held in reset.
    #[num_enum(default)]
    Reset = 3,
}

impl BusSpeed {
    pub fn description(self) -> &'static str {
        use BusSpeed::*;
        match self {
            Low   => "Low-Speed",
            Full  => "Full-Speed",
            High  => "High-Speed",
            Reset => "",
        }
    }
}
