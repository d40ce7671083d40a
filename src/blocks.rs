// Copyright 2022 Steven Bosnick
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE-2.0 or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms

//! Single block data transfer with an SD Card over SPI.
//!
//! The transfer protocol is from section 7.2.3 (reads) and 7.2.4 (writes)
//! of the Simplified Specification: a block command, the 0xFE data token,
//! 512 bytes of payload and a 16 bit checksum, and for writes a data
//! response followed by a busy period on the wire. Each public operation
//! runs as one bus transaction; the `*_locked` forms run on an already
//! held [`Bus`] so that [`modify_block`] can compose a read and a write
//! without letting the bus go in between.

use embedded_hal::{
    blocking::spi::{Transfer, Write},
    digital::v2::OutputPin,
};
use log::trace;
use snafu::prelude::*;

use crate::{
    cmds::Command,
    constants::BLOCK_LEN,
    crc::{crc16, crc16_add},
    transactions::{self, transaction, Bus},
};

const MAX_WAIT_FOR_DATA_TOKEN: u32 = 100;
const MAX_WRITE_BUSY_POLLS: u32 = 100;

/// Marks the start of a block payload in either direction.
const DATA_START_TOKEN: u8 = 0xFE;

/// The meaningful low bits of the data response to a write.
const DATA_RESPONSE_MASK: u8 = 0x1F;
const DATA_RESPONSE_ACCEPTED: u8 = 0x05;

/// The ways a block transfer can fail.
#[derive(Debug, PartialEq, Snafu)]
pub enum Error {
    /// A bus transfer failed underneath the block operation.
    #[snafu(context(false), display("Unable to complete a bus transfer for a block operation."))]
    Bus {
        /// The underlying transfer failure.
        source: transactions::Error,
    },

    /// The card answered a block command with flags where ready was
    /// required.
    #[snafu(display("The card put off a block command with status {status:#04x}."))]
    NotReadyStatus {
        /// The raw R1 status byte.
        status: u8,
    },

    /// The card never produced a data token for a read.
    #[snafu(display("Timed out waiting for the data token."))]
    DataTokenTimeout,

    /// The card answered a read with an error token instead of data.
    #[snafu(display("The card reported a read error (token {token:#04x})."))]
    ReadError {
        /// The raw error token.
        token: u8,
    },

    /// The checksum over a read payload did not verify.
    #[snafu(display("Checksum error on data transfer."))]
    Checksum,

    /// The card refused the payload of a write.
    #[snafu(display("The card rejected written data (response {response:#04x})."))]
    WriteRejected {
        /// The masked data response bits. 0x0B is a checksum rejection
        /// and 0x0D a write error.
        response: u8,
    },

    /// The card stayed busy past the whole post write poll budget.
    #[snafu(display("Timed out waiting for a write to finish."))]
    WriteBusyTimeout,
}

/// Read one block in its own bus transaction.
///
/// `address` must already be scaled for the card's addressing mode.
pub fn read_block<SPI, CS>(
    spi: &mut SPI,
    cs: &mut CS,
    address: u32,
    buffer: &mut [u8; BLOCK_LEN],
) -> Result<(), Error>
where
    SPI: Transfer<u8> + Write<u8>,
    CS: OutputPin,
{
    transaction(spi, cs, |bus| read_block_locked(bus, address, buffer))
}

/// Write one block in its own bus transaction.
///
/// `address` must already be scaled for the card's addressing mode.
pub fn write_block<SPI, CS>(
    spi: &mut SPI,
    cs: &mut CS,
    address: u32,
    data: &[u8; BLOCK_LEN],
) -> Result<(), Error>
where
    SPI: Transfer<u8> + Write<u8>,
    CS: OutputPin,
{
    transaction(spi, cs, |bus| write_block_locked(bus, address, data))
}

/// Read a block, let `modify` rewrite it in place, and write the result
/// back, all without releasing the bus in between.
pub fn modify_block<SPI, CS, F>(
    spi: &mut SPI,
    cs: &mut CS,
    address: u32,
    modify: F,
) -> Result<(), Error>
where
    SPI: Transfer<u8> + Write<u8>,
    CS: OutputPin,
    F: FnOnce(&mut [u8; BLOCK_LEN]),
{
    transaction(spi, cs, |bus| {
        let mut buffer = [0; BLOCK_LEN];
        read_block_locked(bus, address, &mut buffer)?;
        modify(&mut buffer);
        write_block_locked(bus, address, &buffer)
    })
}

/// Read one block on an already held bus.
pub fn read_block_locked<SPI, CS>(
    bus: &mut Bus<'_, SPI, CS>,
    address: u32,
    buffer: &mut [u8; BLOCK_LEN],
) -> Result<(), Error>
where
    SPI: Transfer<u8> + Write<u8>,
    CS: OutputPin,
{
    trace!("reading block at {address:#x}");

    let response = bus.command(Command::ReadSingleBlock, address)?;
    ensure!(
        response.status.is_ready(),
        NotReadyStatusSnafu {
            status: response.status.bits()
        }
    );

    wait_for_data_token(bus)?;

    bus.receive_exact(buffer)?;
    let mut checksum = [0xFF; 2];
    bus.receive_exact(&mut checksum)?;

    // Running the accumulator across the payload and the appended
    // checksum leaves a zero remainder when the transfer was clean.
    let residue = checksum
        .iter()
        .fold(crc16(buffer), |crc, &byte| crc16_add(crc, byte));
    ensure!(residue == 0, ChecksumSnafu);

    Ok(())
}

/// Write one block on an already held bus.
pub fn write_block_locked<SPI, CS>(
    bus: &mut Bus<'_, SPI, CS>,
    address: u32,
    data: &[u8; BLOCK_LEN],
) -> Result<(), Error>
where
    SPI: Transfer<u8> + Write<u8>,
    CS: OutputPin,
{
    trace!("writing block at {address:#x}");

    let response = bus.command(Command::WriteBlock, address)?;
    ensure!(
        response.status.is_ready(),
        NotReadyStatusSnafu {
            status: response.status.bits()
        }
    );

    // One stuff byte, then the start token, in a single two byte send.
    bus.send(&[0xFF, DATA_START_TOKEN])?;
    bus.send(data)?;
    bus.send(&crc16(data).to_be_bytes())?;

    // The data response arrives in the first of these two bytes; the
    // second is the first byte of the busy period.
    let mut status = [0xFF; 2];
    bus.receive_exact(&mut status)?;
    let data_response = status[0] & DATA_RESPONSE_MASK;
    ensure!(
        data_response == DATA_RESPONSE_ACCEPTED,
        WriteRejectedSnafu {
            response: data_response
        }
    );

    wait_while_busy(bus)
}

// The card holds the line low until its internal program finishes; a
// 0xFF byte means it is done.
fn wait_while_busy<SPI, CS>(bus: &mut Bus<'_, SPI, CS>) -> Result<(), Error>
where
    SPI: Transfer<u8> + Write<u8>,
    CS: OutputPin,
{
    for _ in 0..MAX_WRITE_BUSY_POLLS {
        if bus.receive()? == 0xFF {
            return Ok(());
        }
    }

    WriteBusyTimeoutSnafu {}.fail()
}

// Between the command response and the payload the card idles the line
// high. The first byte with the high bit clear is either the data token
// or an error token.
fn wait_for_data_token<SPI, CS>(bus: &mut Bus<'_, SPI, CS>) -> Result<(), Error>
where
    SPI: Transfer<u8> + Write<u8>,
    CS: OutputPin,
{
    for _ in 0..MAX_WAIT_FOR_DATA_TOKEN {
        let byte = bus.receive()?;
        if byte == DATA_START_TOKEN {
            return Ok(());
        }
        ensure!(byte & 0x80 != 0, ReadSnafu { token: byte });
    }

    DataTokenTimeoutSnafu {}.fail()
}
