// Copyright 2022 Steven Bosnick
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE-2.0 or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms

//! An embedded-hal block device driver for an SD Card over SPI.
//!
//! The driver owns the SPI peripheral, the chip select pin and the card
//! detect pin, and exposes 512 byte block reads and writes to whatever
//! sits on top (a partition table, a filesystem). The card lifecycle is
//! driven by [`SdCard::poll`]: the platform calls it from its main loop
//! or card detect edge handler, and each call can report one
//! [`CardEvent`] (an insertion, a removal, the card coming ready after
//! the cold start dance, or the dance failing). Block IO is only allowed
//! once the card is ready; everything else fails loudly without touching
//! the bus.
//!
//! The driver controls chip select itself instead of leaving it to the
//! SPI peripheral: the protocol has moments where bytes must be clocked
//! with the card deselected (the power up pulse, and the gap between an
//! AppCmd escape and the command that follows it).

#![cfg_attr(not(test), no_std)]
#![forbid(unsafe_code)]
#![deny(missing_docs)]

mod blocks;
mod cmds;
mod constants;
mod crc;
mod detect;
mod initilization;
mod mbr;
mod resp;
mod transactions;

#[cfg(test)]
mod testutils;

use embedded_hal::{
    blocking::{
        delay::DelayMs,
        spi::{Transfer, Write},
    },
    digital::v2::{InputPin, OutputPin},
};
use log::{debug, trace};
use snafu::prelude::*;

use detect::{DetectMonitor, Edge};

pub use blocks::Error as BlockError;
pub use constants::{BusClock, CardType, BLOCK_LEN};
pub use detect::Error as DetectError;
pub use initilization::Error as InitilizationError;
pub use mbr::{Error as PartitionError, Partition, PARTITION_COUNT};
pub use resp::ResponseError;
pub use transactions::Error as BusError;

/// A lifecycle notification from [`SdCard::poll`].
#[derive(Debug, PartialEq)]
pub enum CardEvent {
    /// A card appeared in the slot. Initilization runs on the next poll.
    Inserted,

    /// The card left the slot. It is no longer ready.
    Removed,

    /// Initilization finished and block IO is available.
    Ready,

    /// Initilization failed. The card stays unusable until it is
    /// reinserted or [`SdCard::restart`] is called before the next
    /// insertion.
    InitFailed(InitilizationError),
}

/// The error type for [`SdCard`] operations.
#[derive(Debug, PartialEq, Snafu)]
pub enum Error {
    /// Block IO was requested before the card finished initilizing.
    #[snafu(display("The card is not ready for block IO."))]
    NotReady,

    /// The card detect line could not be sampled.
    #[snafu(display("Unable to observe the card detect pin."))]
    Detect {
        /// The underlying pin failure.
        source: DetectError,
    },

    /// A block transfer failed.
    #[snafu(display("Unable to transfer a block."))]
    Block {
        /// The underlying transfer failure.
        source: BlockError,
    },

    /// The partition table was malformed.
    #[snafu(display("Unable to parse the partition table."))]
    PartitionTable {
        /// The underlying parse failure.
        source: PartitionError,
    },
}

/// The driver handle: one card slot's SPI peripheral, chip select pin
/// and card detect pin, plus the lifecycle state behind them.
///
/// `configure_clock` is the platform hook through which the driver asks
/// for the two clock rates the protocol needs: the identification rate
/// while a card initilizes and the full rate afterwards. It is called
/// again on every insertion, so it must be reusable (unlike a one shot
/// speed increase closure).
pub struct SdCard<SPI, CS, DETECT, F> {
    spi: SPI,
    cs: CS,
    detect: DetectMonitor<DETECT>,
    configure_clock: F,
    card_type: CardType,
    ready: bool,
    waiting: bool,
    init_due: bool,
}

impl<SPI, CS, DETECT, F> SdCard<SPI, CS, DETECT, F>
where
    SPI: Transfer<u8> + Write<u8>,
    CS: OutputPin,
    DETECT: InputPin,
    F: FnMut(&mut SPI, BusClock),
{
    /// Create a new [`SdCard`] watching the given card detect pin.
    ///
    /// No bus traffic happens until a card shows up: the handle starts
    /// absent and not ready, with initilization armed for the first
    /// insertion [`poll`](Self::poll) observes.
    pub fn bind(spi: SPI, cs: CS, detect: DETECT, configure_clock: F) -> Self {
        SdCard {
            spi,
            cs,
            detect: DetectMonitor::new(detect),
            configure_clock,
            card_type: CardType::Unknown,
            ready: false,
            waiting: true,
            init_due: false,
        }
    }

    /// The card detect level the last poll saw.
    pub fn is_present(&self) -> bool {
        self.detect.is_present()
    }

    /// The card finished initilization and block IO is available.
    pub fn is_ready(&self) -> bool {
        self.ready
    }

    /// The addressing classification discovered during initilization.
    pub fn card_type(&self) -> CardType {
        self.card_type
    }

    /// Arm initilization to re-run on the next insertion.
    ///
    /// Removals arm it on their own; `restart` is for re-running the
    /// dance for a card that never left the slot (it still takes a
    /// removal and insertion to trigger).
    pub fn restart(&mut self) {
        self.waiting = true;
    }

    /// Drive the card lifecycle forward one step.
    ///
    /// Samples the card detect line and reports at most one event: an
    /// edge on the line, or the outcome of the initilization dance on
    /// the poll after an insertion. Quiet polls report nothing.
    pub fn poll<D: DelayMs<u8>>(&mut self, delay: &mut D) -> Result<Option<CardEvent>, Error> {
        if let Some(edge) = self.detect.poll().context(DetectSnafu)? {
            return Ok(Some(match edge {
                Edge::Inserted => {
                    trace!("card inserted");
                    if self.waiting {
                        self.waiting = false;
                        self.init_due = true;
                    }
                    CardEvent::Inserted
                }
                Edge::Removed => {
                    trace!("card removed");
                    // Whatever shows up next is a different card: it is
                    // not ready, its type is unknown, and it must run
                    // the dance from the top.
                    self.ready = false;
                    self.init_due = false;
                    self.waiting = true;
                    self.card_type = CardType::Unknown;
                    CardEvent::Removed
                }
            }));
        }

        if self.init_due {
            self.init_due = false;
            return Ok(Some(
                match initilization::initialize(
                    &mut self.spi,
                    &mut self.cs,
                    delay,
                    &mut self.configure_clock,
                ) {
                    Ok(card_type) => {
                        self.card_type = card_type;
                        self.ready = true;
                        CardEvent::Ready
                    }
                    Err(error) => {
                        debug!("card initilization failed: {error}");
                        CardEvent::InitFailed(error)
                    }
                },
            ));
        }

        Ok(None)
    }

    /// Read the block at `block` into `buffer`.
    pub fn read_block(&mut self, block: u32, buffer: &mut [u8; BLOCK_LEN]) -> Result<(), Error> {
        ensure!(self.ready, NotReadySnafu);

        let address = self.card_type.wire_address(block);
        blocks::read_block(&mut self.spi, &mut self.cs, address, buffer).context(BlockSnafu)
    }

    /// Write `data` to the block at `block`.
    pub fn write_block(&mut self, block: u32, data: &[u8; BLOCK_LEN]) -> Result<(), Error> {
        ensure!(self.ready, NotReadySnafu);

        let address = self.card_type.wire_address(block);
        blocks::write_block(&mut self.spi, &mut self.cs, address, data).context(BlockSnafu)
    }

    /// Read the block at `block`, let `modify` rewrite it in place, and
    /// write the result back, holding the bus for the whole exchange.
    pub fn modify_block<M>(&mut self, block: u32, modify: M) -> Result<(), Error>
    where
        M: FnOnce(&mut [u8; BLOCK_LEN]),
    {
        ensure!(self.ready, NotReadySnafu);

        let address = self.card_type.wire_address(block);
        blocks::modify_block(&mut self.spi, &mut self.cs, address, modify).context(BlockSnafu)
    }

    /// Read the partition table from the first block of the card.
    ///
    /// A filesystem layer consumes the returned regions through
    /// [`read_block`](Self::read_block) and
    /// [`write_block`](Self::write_block).
    pub fn partitions(&mut self) -> Result<[Option<Partition>; PARTITION_COUNT], Error> {
        let mut block = [0; BLOCK_LEN];
        self.read_block(0, &mut block)?;

        mbr::parse(&block).context(PartitionTableSnafu)
    }
}

impl<SPI, CS, DETECT, F> SdCard<SPI, CS, DETECT, F> {
    /// Consume the `SdCard` and return the underlying peripherals.
    pub fn release(self) -> (SPI, CS, DETECT) {
        (self.spi, self.cs, self.detect.release())
    }
}
