// Copyright 2022 Steven Bosnick
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE-2.0 or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms

//! Master boot record parsing.
//!
//! The driver stops at locating partitions: it reads the first block of
//! the card and hands the partition regions to whatever filesystem layer
//! sits on top, which consumes them through the block IO operations.

use snafu::prelude::*;

use crate::constants::BLOCK_LEN;

/// The number of primary partition entries an MBR holds.
pub const PARTITION_COUNT: usize = 4;

const PARTITION_TABLE_OFFSET: usize = 446;
const PARTITION_ENTRY_LEN: usize = 16;
const SIGNATURE_OFFSET: usize = 510;
const SIGNATURE: [u8; 2] = [0x55, 0xAA];

// Entry layout offsets.
const ENTRY_KIND: usize = 4;
const ENTRY_FIRST_BLOCK: usize = 8;
const ENTRY_NUM_BLOCKS: usize = 12;

/// Marker for a FAT16 partition. Seen on a card formatted with the official
/// SD-Card formatter.
pub const PARTITION_ID_FAT16: u8 = 0x06;
/// Marker for a FAT32 partition. What Macosx disk utility (and also SD-Card
/// formatter?) use.
pub const PARTITION_ID_FAT32_CHS_LBA: u8 = 0x0B;
/// Marker for a FAT32 partition. Sometimes also use for FAT16 formatted
/// partitions.
pub const PARTITION_ID_FAT32_LBA: u8 = 0x0C;
/// Marker for a FAT16 partition with LBA. Seen on a Raspberry Pi SD card.
pub const PARTITION_ID_FAT16_LBA: u8 = 0x0E;

/// The ways partition table parsing can fail.
#[derive(Debug, PartialEq, Snafu)]
pub enum Error {
    /// The boot block did not end in the 0x55 0xAA signature.
    #[snafu(display("The boot block does not carry a valid signature."))]
    BadSignature,
}

/// One primary partition entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Partition {
    /// The partition type marker byte.
    pub kind: u8,

    /// The first block of the partition.
    pub first_block: u32,

    /// The length of the partition in blocks.
    pub num_blocks: u32,
}

impl Partition {
    /// True for the partition types a FAT filesystem layer understands.
    pub fn is_fat(&self) -> bool {
        matches!(
            self.kind,
            PARTITION_ID_FAT16
                | PARTITION_ID_FAT16_LBA
                | PARTITION_ID_FAT32_LBA
                | PARTITION_ID_FAT32_CHS_LBA
        )
    }
}

/// Parse the partition table out of the first block of a card.
///
/// Unused table slots come back as `None`.
pub fn parse(block: &[u8; BLOCK_LEN]) -> Result<[Option<Partition>; PARTITION_COUNT], Error> {
    ensure!(
        block[SIGNATURE_OFFSET..SIGNATURE_OFFSET + 2] == SIGNATURE[..],
        BadSignatureSnafu
    );

    let mut table = [None; PARTITION_COUNT];
    for (index, slot) in table.iter_mut().enumerate() {
        let entry = PARTITION_TABLE_OFFSET + index * PARTITION_ENTRY_LEN;

        let kind = block[entry + ENTRY_KIND];
        if kind == 0 {
            continue;
        }

        let mut first_block = [0; 4];
        first_block.copy_from_slice(&block[entry + ENTRY_FIRST_BLOCK..entry + ENTRY_FIRST_BLOCK + 4]);
        let mut num_blocks = [0; 4];
        num_blocks.copy_from_slice(&block[entry + ENTRY_NUM_BLOCKS..entry + ENTRY_NUM_BLOCKS + 4]);

        *slot = Some(Partition {
            kind,
            first_block: u32::from_le_bytes(first_block),
            num_blocks: u32::from_le_bytes(num_blocks),
        });
    }

    Ok(table)
}
