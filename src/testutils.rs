// Copyright 2022 Steven Bosnick
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE-2.0 or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms

//! Mock expectation builders shared by the tests.
//!
//! Each helper produces the SPI or chip select trace of one whole
//! protocol exchange, so tests can assert on bus traces without
//! repeating the byte level framing everywhere.

use embedded_hal_mock::{pin, spi};

use crate::cmds::{Command, FRAME_LEN};
use crate::constants::{BusClock, CardType, BLOCK_LEN};
use crate::crc::crc16;

/// The encoded frame for a command, as a vector for mock expectations.
pub fn frame(cmd: Command, arg: u32) -> Vec<u8> {
    let mut buffer = [0; FRAME_LEN];
    cmd.encode(arg, &mut buffer);
    buffer.to_vec()
}

/// The SPI trace of the power up pulse: ten idle bytes clocked out in one
/// write.
pub fn pulse_exchange() -> Vec<spi::Transaction> {
    vec![spi::Transaction::write(vec![0xFF; 10])]
}

/// The chip select trace of the power up pulse: the line goes high and
/// stays there for the whole pulse.
pub fn pulse_pin_cycle() -> Vec<pin::Transaction> {
    vec![pin::Transaction::set(pin::State::High)]
}

/// The SPI trace of one plain command transaction: frame out, response
/// polled on the first try, optional 4 byte tail, then the release byte
/// clocked after chip select deasserts.
pub fn command_exchange(
    cmd: Command,
    arg: u32,
    r1: u8,
    tail: Option<[u8; 4]>,
) -> Vec<spi::Transaction> {
    let mut trace = vec![
        spi::Transaction::write(frame(cmd, arg)),
        spi::Transaction::transfer(vec![0xFF], vec![r1]),
    ];
    if let Some(tail) = tail {
        trace.push(spi::Transaction::transfer(vec![0xFF; 4], tail.to_vec()));
    }
    trace.push(spi::Transaction::transfer(vec![0xFF], vec![0xFF]));
    trace
}

/// The SPI trace of one application command transaction: the AppCmd
/// escape, the chip select cycle byte, the command itself, the release
/// byte.
pub fn acmd_exchange(cmd: Command, arg: u32, r1: u8) -> Vec<spi::Transaction> {
    vec![
        spi::Transaction::write(frame(Command::AppCmd, 0)),
        spi::Transaction::transfer(vec![0xFF], vec![0x01]),
        spi::Transaction::transfer(vec![0xFF], vec![0xFF]),
        spi::Transaction::write(frame(cmd, arg)),
        spi::Transaction::transfer(vec![0xFF], vec![r1]),
        spi::Transaction::transfer(vec![0xFF], vec![0xFF]),
    ]
}

/// The chip select trace of one plain command transaction.
pub fn command_pin_cycle() -> Vec<pin::Transaction> {
    vec![
        pin::Transaction::set(pin::State::Low),
        pin::Transaction::set(pin::State::High),
    ]
}

/// The chip select trace of one application command transaction, with
/// the cycle between the escape and the command.
pub fn acmd_pin_cycle() -> Vec<pin::Transaction> {
    vec![
        pin::Transaction::set(pin::State::Low),
        pin::Transaction::set(pin::State::High),
        pin::Transaction::set(pin::State::Low),
        pin::Transaction::set(pin::State::High),
    ]
}

/// The whole SPI trace of a successful cold start, along with the clock
/// rates the platform hook should see.
///
/// `op_cond_tries` is the try on which SdSendOpCond reports ready;
/// `card_type` selects the SendIfCond and ReadOcr answers.
pub fn init_exchanges(op_cond_tries: u32, card_type: CardType) -> (Vec<spi::Transaction>, Vec<BusClock>) {
    let mut trace = pulse_exchange();

    trace.extend(command_exchange(Command::GoIdleState, 0, 0x01, None));

    match card_type {
        // idle and illegal command: the version 1 answer
        CardType::SdV1 => {
            trace.extend(command_exchange(Command::SendIfCond, 0x1AA, 0x05, None))
        }
        _ => trace.extend(command_exchange(
            Command::SendIfCond,
            0x1AA,
            0x01,
            Some([0x00, 0x00, 0x01, 0xAA]),
        )),
    }

    for try_number in 1..=op_cond_tries {
        let r1 = if try_number == op_cond_tries { 0x00 } else { 0x01 };
        trace.extend(acmd_exchange(Command::SdSendOpCond, 1 << 30, r1));
    }

    trace.extend(command_exchange(Command::CrcOnOff, 1, 0x00, None));

    match card_type {
        CardType::SdV1 => {}
        CardType::SdV2Block => trace.extend(command_exchange(
            Command::ReadOcr,
            0,
            0x00,
            Some([0xC0, 0xFF, 0x80, 0x00]),
        )),
        _ => {
            trace.extend(command_exchange(
                Command::ReadOcr,
                0,
                0x00,
                Some([0x80, 0xFF, 0x80, 0x00]),
            ));
            trace.extend(command_exchange(Command::SetBlockLen, 512, 0x00, None));
        }
    }

    (trace, vec![BusClock::Slow, BusClock::Fast])
}

/// The whole chip select trace matching [`init_exchanges`].
pub fn init_pin_cycles(op_cond_tries: u32, card_type: CardType) -> Vec<pin::Transaction> {
    let mut cycles = pulse_pin_cycle();

    cycles.extend(command_pin_cycle()); // GoIdleState
    cycles.extend(command_pin_cycle()); // SendIfCond
    for _ in 0..op_cond_tries {
        cycles.extend(acmd_pin_cycle());
    }
    cycles.extend(command_pin_cycle()); // CrcOnOff
    match card_type {
        CardType::SdV1 => {}
        CardType::SdV2Block => cycles.extend(command_pin_cycle()), // ReadOcr
        _ => {
            cycles.extend(command_pin_cycle()); // ReadOcr
            cycles.extend(command_pin_cycle()); // SetBlockLen
        }
    }

    cycles
}

/// A clock configuration hook that ignores every request.
pub fn no_clock() -> impl FnMut(&mut spi::Mock, BusClock) {
    |_, _| ()
}

/// The SPI trace of one single block read transaction: the command, the
/// data token on the first poll, the payload and checksum, the release
/// byte.
pub fn read_exchange(
    address: u32,
    payload: &[u8; BLOCK_LEN],
    checksum: u16,
) -> Vec<spi::Transaction> {
    vec![
        spi::Transaction::write(frame(Command::ReadSingleBlock, address)),
        spi::Transaction::transfer(vec![0xFF], vec![0x00]),
        spi::Transaction::transfer(vec![0xFF], vec![0xFE]),
        spi::Transaction::transfer(vec![0xFF; BLOCK_LEN], payload.to_vec()),
        spi::Transaction::transfer(vec![0xFF; 2], checksum.to_be_bytes().to_vec()),
        spi::Transaction::transfer(vec![0xFF], vec![0xFF]),
    ]
}

/// The SPI trace of one single block write transaction: the command, the
/// stuff byte and token, the payload and checksum, an accepted data
/// response with one busy byte, the poll that sees the line idle, the
/// release byte.
pub fn write_exchange(address: u32, payload: &[u8; BLOCK_LEN]) -> Vec<spi::Transaction> {
    vec![
        spi::Transaction::write(frame(Command::WriteBlock, address)),
        spi::Transaction::transfer(vec![0xFF], vec![0x00]),
        spi::Transaction::write(vec![0xFF, 0xFE]),
        spi::Transaction::write(payload.to_vec()),
        spi::Transaction::write(crc16(payload).to_be_bytes().to_vec()),
        spi::Transaction::transfer(vec![0xFF; 2], vec![0xE5, 0x00]),
        spi::Transaction::transfer(vec![0xFF], vec![0xFF]),
        spi::Transaction::transfer(vec![0xFF], vec![0xFF]),
    ]
}
