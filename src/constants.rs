// Copyright 2022 Steven Bosnick
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE-2.0 or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms

//! Protocol constants and shared card state types that more than one
//! module needs.

/// The VHS nibble for the 2.7 V to 3.6 V supply range.
///
/// Sent as the supplied voltage in a SendIfCond argument, and matched
/// against the accepted voltage the card echoes in the R7 tail. Tables
/// 4-18 and 4-41 of the Simplified Specification define the encoding.
pub const VOLTAGE_2_7_TO_3_6: u8 = 0b0001;

/// The SendIfCond check pattern the card has to echo back.
///
/// The value is arbitrary; the card only has to mirror it, which proves
/// the command and response made it across the wire intact.
pub const IF_COND_CHECK_PATTERN: u8 = 0xAA;

/// The voltage nibble and check pattern combined, as they come back in the
/// low 12 bits of the R7 response.
pub const IF_COND_ECHO: u16 =
    ((VOLTAGE_2_7_TO_3_6 as u16) << 8) | IF_COND_CHECK_PATTERN as u16;

/// The one block length this driver speaks. The protocol engine assumes it.
pub const BLOCK_LEN: usize = 512;

/// The addressing classification of the card from section 3.3.2, discovered
/// during initilization.
///
/// Ultra Capacity (SDUC) cards never appear here: section 7.1 rules them
/// out of SPI mode entirely.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CardType {
    /// Version 1 SD card, byte addressed. An MMCv3 card reports the same
    /// way and is not told apart.
    SdV1,

    /// Version 2 standard capacity card, byte addressed.
    SdV2,

    /// Version 2 high or extended capacity card, block addressed.
    SdV2Block,

    /// The card has not been classified (yet).
    Unknown,
}

impl CardType {
    /// Translate a block index into the address the card expects on the
    /// wire.
    ///
    /// Block addressed cards take the index directly; byte addressed cards
    /// take a byte offset.
    pub fn wire_address(self, block: u32) -> u32 {
        match self {
            CardType::SdV2Block => block,
            _ => block * BLOCK_LEN as u32,
        }
    }
}

/// The SPI clock configurations the driver asks the platform for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusClock {
    /// The identification clock. Must be within 100 kHz to 400 kHz.
    Slow,

    /// The steady state clock used once the card is ready.
    Fast,
}

impl BusClock {
    /// The nominal clock rate in Hertz.
    pub fn hertz(self) -> u32 {
        match self {
            BusClock::Slow => 200_000,
            BusClock::Fast => 2_000_000,
        }
    }
}
