//! VME address modifiers and transfer parameters.

use serde::{Deserialize, Serialize};

pub mod amods {
    pub const A32_USER_DATA: u8 = 0x09;
    pub const A32_USER_PROGRAM: u8 = 0x0A;
    pub const A32_USER_BLOCK: u8 = 0x0B;
    pub const A32_USER_BLOCK64: u8 = 0x08;
    pub const A32_PRIV_DATA: u8 = 0x0D;
    pub const A32_PRIV_PROGRAM: u8 = 0x0E;
    pub const A32_PRIV_BLOCK: u8 = 0x0F;
    pub const A32_PRIV_BLOCK64: u8 = 0x0C;

    pub const A24_USER_DATA: u8 = 0x39;
    pub const A24_USER_PROGRAM: u8 = 0x3A;
    pub const A24_USER_BLOCK: u8 = 0x3B;
    pub const A24_PRIV_DATA: u8 = 0x3D;
    pub const A24_PRIV_PROGRAM: u8 = 0x3E;
    pub const A24_PRIV_BLOCK: u8 = 0x3F;

    pub const CR: u8 = 0x2F;
    pub const A16_USER: u8 = 0x29;
    pub const A16_PRIV: u8 = 0x2D;

    pub const A16: u8 = A16_USER;
    pub const A24: u8 = A24_USER_DATA;
    pub const A32: u8 = A32_USER_DATA;
    pub const BLT32: u8 = A32_USER_BLOCK;
    pub const MBLT64: u8 = A32_USER_BLOCK64;
    /// Not a real VME amod; selects 2eSST transfers on the controller.
    pub const BLK2ESST64: u8 = 0x20;

    pub const AMOD_MASK: u8 = 0x3f;
}

/// Shift of the 2eSST rate inside the amod argument byte.
pub const BLK2ESST_RATE_SHIFT: u32 = 6;

pub fn is_block_mode(amod: u8) -> bool {
    is_blt_mode(amod) || is_mblt_mode(amod) || is_esst64_mode(amod)
}

pub fn is_blt_mode(amod: u8) -> bool {
    matches!(
        amod,
        amods::A32_USER_BLOCK | amods::A32_PRIV_BLOCK | amods::A24_USER_BLOCK | amods::A24_PRIV_BLOCK
    )
}

pub fn is_mblt_mode(amod: u8) -> bool {
    matches!(amod, amods::A32_USER_BLOCK64 | amods::A32_PRIV_BLOCK64)
}

pub fn is_esst64_mode(amod: u8) -> bool {
    amod == amods::BLK2ESST64
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VmeDataWidth {
    D16 = 0x1,
    #[default]
    D32 = 0x2,
}

impl VmeDataWidth {
    pub fn from_raw(raw: u32) -> Option<Self> {
        match raw {
            0x1 => Some(Self::D16),
            0x2 => Some(Self::D32),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Blk2eSstRate {
    #[default]
    Rate160MB = 0,
    Rate276MB = 1,
    Rate320MB = 2,
}

impl Blk2eSstRate {
    pub fn from_raw(raw: u8) -> Self {
        match raw {
            1 => Self::Rate276MB,
            2 => Self::Rate320MB,
            _ => Self::Rate160MB,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn block_mode_classification() {
        for amod in [0x0B, 0x08, 0x0F, 0x0C, 0x3B, 0x3F, 0x20] {
            assert!(is_block_mode(amod), "{amod:#x}");
        }
        for amod in [0x09, 0x0D, 0x39, 0x3D, 0x29, 0x2D, 0x2F] {
            assert!(!is_block_mode(amod), "{amod:#x}");
        }
        assert!(is_mblt_mode(amods::MBLT64));
        assert!(!is_blt_mode(amods::MBLT64));
        assert!(is_blt_mode(amods::BLT32));
        assert!(is_esst64_mode(amods::BLK2ESST64));
    }
}
