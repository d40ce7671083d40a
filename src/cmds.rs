// Copyright 2022 Steven Bosnick
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE-2.0 or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms

//! The command set the driver speaks and its frame encoding.
//!
//! Command indices and response formats come from Tables 7-3 and 7-4 of
//! the Simplified Specification, restricted to the commands this driver
//! issues. Since the driver turns bus CRC checking on (with the CRCOnOff
//! command) every frame carries a real checksum rather than the fixed
//! value section 7.2.2 would otherwise allow.

use crate::constants::{IF_COND_CHECK_PATTERN, VOLTAGE_2_7_TO_3_6};
use crate::crc::crc7;

/// The number of bytes in an encoded command frame.
pub const FRAME_LEN: usize = 6;

/// The number of tail bytes that follow the R1 byte of an R3 or R7
/// response.
pub const RESPONSE_TAIL_LEN: usize = 4;

// The two fixed leading bits of a frame: a zero start bit and a one for
// host-to-card direction (Table 7-1). The command index fills the low six
// bits.
const CMD_START: u8 = 0b0100_0000;

// Every frame closes with a one end bit below the checksum (Table 7-1).
const CMD_END: u8 = 0b0000_0001;

/// The response format a command answers with.
///
/// The formats are 1, 5 and 5 bytes long respectively; the first byte is
/// always the R1 status (see section 7.3.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseKind {
    /// A bare status byte.
    R1,

    /// Status byte followed by the 4 byte OCR.
    R3,

    /// Status byte followed by the 4 byte interface condition echo.
    R7,
}

/// The commands this driver issues, in SPI mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// CMD0: reset the card into the idle state.
    GoIdleState,

    /// CMD8: check the supplied voltage and probe the card version.
    SendIfCond,

    /// CMD16: set the block length for byte addressed cards.
    SetBlockLen,

    /// CMD17: read one block.
    ReadSingleBlock,

    /// CMD24: write one block.
    WriteBlock,

    /// CMD55: escape prefix for application specific commands.
    AppCmd,

    /// CMD58: read the operating conditions register.
    ReadOcr,

    /// CMD59: turn bus CRC checking on or off.
    CrcOnOff,

    /// ACMD41: start the card's initialization process.
    SdSendOpCond,
}

impl Command {
    /// The command index transmitted in the frame's first byte.
    pub fn index(self) -> u8 {
        match self {
            Command::GoIdleState => 0,
            Command::SendIfCond => 8,
            Command::SetBlockLen => 16,
            Command::ReadSingleBlock => 17,
            Command::WriteBlock => 24,
            Command::AppCmd => 55,
            Command::ReadOcr => 58,
            Command::CrcOnOff => 59,
            Command::SdSendOpCond => 41,
        }
    }

    /// The response format the card answers this command with.
    pub fn response(self) -> ResponseKind {
        match self {
            Command::ReadOcr => ResponseKind::R3,
            Command::SendIfCond => ResponseKind::R7,
            _ => ResponseKind::R1,
        }
    }

    /// An application specific command that must be escaped with AppCmd.
    pub fn is_app_cmd(self) -> bool {
        matches!(self, Command::SdSendOpCond)
    }

    /// Encode the command and its argument as a 6 byte frame.
    ///
    /// The layout is from Table 7-1: start bits and index, the argument
    /// big-endian, then the checksum over the first five bytes with the
    /// end bit appended.
    pub fn encode(self, arg: u32, buffer: &mut [u8; FRAME_LEN]) {
        buffer[0] = CMD_START | self.index();
        buffer[1..5].copy_from_slice(&arg.to_be_bytes());
        buffer[5] = (crc7(&buffer[..5]) << 1) | CMD_END;
    }
}

/// The argument for a SendIfCond command: our supplied voltage and the
/// check pattern the card must echo.
pub fn if_cond_arg() -> u32 {
    ((VOLTAGE_2_7_TO_3_6 as u32) << 8) | IF_COND_CHECK_PATTERN as u32
}

/// The argument for an SdSendOpCond command.
///
/// The host capacity support bit is always set: this host handles SDHC
/// and SDXC cards, and standard capacity cards ignore the bit.
pub fn op_cond_arg() -> u32 {
    const HCS_BIT: u32 = 1 << 30;
    HCS_BIT
}
