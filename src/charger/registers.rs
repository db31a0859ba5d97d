//! RD60xx holding-register map. Numbering is fixed by the device firmware.

pub const ID: u16 = 0;
pub const SN_H: u16 = 1;
pub const SN_L: u16 = 2;
pub const FW: u16 = 3;
pub const INT_C_S: u16 = 4;
pub const INT_C: u16 = 5;
pub const INT_F_S: u16 = 6;
pub const INT_F: u16 = 7;
pub const V_SET: u16 = 8;
pub const I_SET: u16 = 9;
pub const V_OUT: u16 = 10;
pub const I_OUT: u16 = 11;
pub const AH: u16 = 12;
pub const P_OUT: u16 = 13;
pub const V_IN: u16 = 14;
pub const KEYPAD: u16 = 15;
pub const OVP_OCP: u16 = 16;
pub const CV_CC: u16 = 17;
pub const OUTPUT: u16 = 18;
pub const PRESET: u16 = 19;
pub const I_RANGE: u16 = 20;

pub const BAT_MODE: u16 = 32;
pub const V_BAT: u16 = 33;
pub const EXT_C_S: u16 = 34;
pub const EXT_C: u16 = 35;
pub const EXT_F_S: u16 = 36;
pub const EXT_F: u16 = 37;
pub const AH_H: u16 = 38;
pub const AH_L: u16 = 39;
pub const WH_H: u16 = 40;
pub const WH_L: u16 = 41;

pub const YEAR: u16 = 48;
pub const MONTH: u16 = 49;
pub const DAY: u16 = 50;
pub const HOUR: u16 = 51;
pub const MINUTE: u16 = 52;
pub const SECOND: u16 = 53;

pub const OPT_TAKE_OK: u16 = 59;
pub const OPT_TAKE_OUT: u16 = 60;
pub const OPT_BOOT_POW: u16 = 61;
pub const OPT_BUZZ: u16 = 62;
pub const OPT_LOGO: u16 = 63;
pub const OPT_LANG: u16 = 64;
pub const OPT_LIGHT: u16 = 72;

pub const SYSTEM: u16 = 256;
pub const BOOTLOADER: u16 = 0x1601;

/// Identity block read at init: ID, SN_H, SN_L, FW
pub const IDENTITY_SPAN: u16 = FW - ID + 1;

/// Telemetry block refreshed by `update`: INT_C_S ..= I_RANGE
pub const TELEMETRY_SPAN: u16 = I_RANGE - INT_C_S + 1;

/// Battery block refreshed by `update_battery`: BAT_MODE ..= WH_L
pub const BATTERY_SPAN: u16 = WH_L - BAT_MODE + 1;

/// Clock block: YEAR ..= SECOND
pub const CLOCK_SPAN: u16 = SECOND - YEAR + 1;
