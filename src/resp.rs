// Copyright 2022 Steven Bosnick
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE-2.0 or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms

//! R1 status handling and response tail interpretation for SPI mode.
//!
//! Whatever format a command answers with, the first byte on the wire is
//! always the R1 status bitfield; R3 and R7 merely append four more bytes
//! to it. When an error flag is set in that first byte the card truncates
//! the rest of a longer response (section 7.3.2 of the Simplified
//! Specification), so the command engine stops reading there and surfaces
//! the error. The error keeps the raw status byte because some of the
//! flags are load bearing for callers: a SendIfCond that fails with
//! *only* the illegal command flag identifies a version 1 card rather
//! than a fault.

use core::ops::{BitAnd, BitAndAssign, BitOr, BitOrAssign};

use snafu::{ensure, Snafu};

/// The R1 status bitfield, the first byte of every response.
///
/// The flag layout is the one section 7.3.2.1 of the Simplified
/// Specification gives. Wrapping the byte keeps the flag tests and the
/// error classification in one place.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct R1Response(u8);

/// The error flags an R1 status byte can carry.
#[derive(Debug, PartialEq, Eq, Snafu)]
pub enum ResponseError {
    /// The card did not recognize the command.
    #[snafu(display("The card flagged an illegal command (status {status:#04x})."))]
    IllegalCommand {
        /// The raw R1 status byte.
        status: u8,
    },

    /// The checksum on the last command did not verify.
    #[snafu(display("The card flagged a command checksum failure (status {status:#04x})."))]
    ComCrcError {
        /// The raw R1 status byte.
        status: u8,
    },

    /// An erase command was out of sequence.
    #[snafu(display("The card flagged an erase sequence error (status {status:#04x})."))]
    EraseSequenceError {
        /// The raw R1 status byte.
        status: u8,
    },

    /// The command's address was out of range or misaligned.
    #[snafu(display("The card flagged an address error (status {status:#04x})."))]
    AddressError {
        /// The raw R1 status byte.
        status: u8,
    },

    /// The command's argument was out of range.
    #[snafu(display("The card flagged a parameter error (status {status:#04x})."))]
    ParameterError {
        /// The raw R1 status byte.
        status: u8,
    },
}

impl ResponseError {
    /// True when the illegal command flag was the only error flag set.
    ///
    /// This is how a version 1 card answers SendIfCond.
    pub fn is_illegal_command_only(&self) -> bool {
        match self {
            ResponseError::IllegalCommand { status } => {
                (R1Response(*status) & R1Response::ALL_ERROR) == R1Response::ILLEGAL_COMMAND
            }
            _ => false,
        }
    }
}

impl R1Response {
    /// Wrap a raw status byte.
    pub fn new(value: u8) -> Self {
        Self(value)
    }

    /// The raw status byte.
    pub fn bits(self) -> u8 {
        self.0
    }

    /// The card is still in the idle state.
    pub fn is_idle(self) -> bool {
        self.is_set(Self::IDLE)
    }

    /// The card reported no flags at all: it is ready for data transfer.
    pub fn is_ready(self) -> bool {
        self == Self::NONE
    }

    /// Surface any error flag as a [`ResponseError`] carrying the raw
    /// status. The lowest set flag names the error.
    pub fn check_error(self) -> Result<R1Response, ResponseError> {
        ensure!(
            self.is_clear(Self::ILLEGAL_COMMAND),
            IllegalCommandSnafu { status: self.0 }
        );
        ensure!(
            self.is_clear(Self::COM_CRC_ERROR),
            ComCrcSnafu { status: self.0 }
        );
        ensure!(
            self.is_clear(Self::ERASE_SEQUENCE_ERROR),
            EraseSequenceSnafu { status: self.0 }
        );
        ensure!(
            self.is_clear(Self::ADDRESS_ERROR),
            AddressSnafu { status: self.0 }
        );
        ensure!(
            self.is_clear(Self::PARAMETER_ERROR),
            ParameterSnafu { status: self.0 }
        );

        Ok(self)
    }

    fn is_clear(self, rhs: Self) -> bool {
        (self & rhs) == Self::NONE
    }

    fn is_set(self, rhs: Self) -> bool {
        (self & rhs) != Self::NONE
    }
}

// The full flag set from section 7.3.2.1, kept complete even where the
// driver never tests a particular flag.
#[allow(dead_code)]
impl R1Response {
    /// The card is in the idle state, running initilization.
    pub const IDLE: R1Response = R1Response(0b0000_0001);
    /// An erase sequence was cleared by an out of sequence command.
    pub const ERASE_RESET: R1Response = R1Response(0b0000_0010);
    /// An illegal command code was detected.
    pub const ILLEGAL_COMMAND: R1Response = R1Response(0b0000_0100);
    /// The CRC check of the last command failed.
    pub const COM_CRC_ERROR: R1Response = R1Response(0b0000_1000);
    /// An error in the sequence of erase commands occured.
    pub const ERASE_SEQUENCE_ERROR: R1Response = R1Response(0b0001_0000);
    /// A misaligned address did not match the block length.
    pub const ADDRESS_ERROR: R1Response = R1Response(0b0010_0000);
    /// The command's argument was outside the accepted range.
    pub const PARAMETER_ERROR: R1Response = R1Response(0b0100_0000);

    /// Every flag that signals a fault: the whole set minus IDLE and
    /// ERASE_RESET.
    pub const ALL_ERROR: R1Response = R1Response(0b0111_1100);

    /// The empty flag set.
    pub const NONE: R1Response = R1Response(0);
}

impl BitAnd for R1Response {
    type Output = R1Response;

    fn bitand(self, rhs: Self) -> Self::Output {
        R1Response(self.0 & rhs.0)
    }
}

impl BitAndAssign for R1Response {
    fn bitand_assign(&mut self, rhs: Self) {
        *self = *self & rhs
    }
}

impl BitOr for R1Response {
    type Output = R1Response;

    fn bitor(self, rhs: Self) -> Self::Output {
        R1Response(self.0 | rhs.0)
    }
}

impl BitOrAssign for R1Response {
    fn bitor_assign(&mut self, rhs: Self) {
        *self = *self | rhs
    }
}

/// The voltage check echo carried in the low 12 bits of an R7 response
/// tail (see Table 4-41).
pub fn r7_echo(tail: &[u8; 4]) -> u16 {
    ((tail[2] as u16 & 0x0F) << 8) | tail[3] as u16
}

/// True when the OCR in an R3 response tail has the card capacity status
/// bit set. A set bit means the card is block addressed.
pub fn ocr_high_capacity(tail: &[u8; 4]) -> bool {
    const CCS: u8 = 0x40;
    tail[0] & CCS != 0
}
