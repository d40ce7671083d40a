// Copyright 2022 Steven Bosnick
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE-2.0 or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms

//! Bus transactions and the command engine that runs inside them.
//!
//! A transaction is the span of one chip select assertion. [`transaction`]
//! brackets a body with the assert and release sequence and hands the body
//! a [`Bus`] through which everything on the wire flows. Operations that
//! already run under a transaction take the [`Bus`] directly (the
//! `*_locked` forms elsewhere in the crate); operations that do not wrap
//! themselves in [`transaction`] first. There is no other way to get at
//! the wire, which is what keeps nested operations and top level ones
//! from interleaving.

use embedded_hal::{
    blocking::spi::{Transfer, Write},
    digital::v2::OutputPin,
};
use snafu::prelude::*;

use crate::{
    cmds::{Command, ResponseKind, FRAME_LEN, RESPONSE_TAIL_LEN},
    resp::{R1Response, ResponseError},
};

const MAX_WAIT_FOR_RESPONSE: u32 = 8;

/// The ways a bus transaction can fail.
#[derive(Debug, PartialEq, Snafu)]
pub enum Error {
    /// The chip select pin could not be driven.
    #[snafu(display("Unable to drive the chip select pin."))]
    ChipSelect,

    /// The SPI peripheral failed an outbound transfer.
    #[snafu(display("Unable to clock bytes out over SPI."))]
    SpiWrite,

    /// The SPI peripheral failed a bidirectional transfer.
    #[snafu(display("Unable to exchange bytes over SPI."))]
    SpiTransfer,

    /// The card never presented a response byte to a command.
    #[snafu(display("The card never answered the command."))]
    WaitForResponseTimeout,

    /// The card answered a command with error flags set.
    #[snafu(display("The card answered the command with error flags set."))]
    CommandResponse {
        /// The flags the card reported.
        source: ResponseError,
    },
}

/// A parsed command response.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Response {
    /// The R1 status byte, with all error flags already checked clear.
    pub status: R1Response,

    /// The trailing 4 bytes of an R3 or R7 format response.
    pub tail: Option<[u8; RESPONSE_TAIL_LEN]>,
}

/// Exclusive access to the wire for the span of one transaction.
///
/// A `Bus` only exists inside [`transaction`], so holding one is proof
/// that chip select is asserted and that nothing else is mid-command.
pub struct Bus<'a, SPI, CS> {
    spi: &'a mut SPI,
    cs: &'a mut CS,
}

/// Run `body` as a single bus transaction.
///
/// Chip select is asserted before the body and released afterwards on
/// every exit path, success or error, followed by one extra 0xFF byte
/// clocked out so the card can finish its side of the exchange. An error
/// from the body takes priority over an error from the release sequence.
pub fn transaction<SPI, CS, T, E, F>(spi: &mut SPI, cs: &mut CS, body: F) -> Result<T, E>
where
    SPI: Transfer<u8> + Write<u8>,
    CS: OutputPin,
    E: From<Error>,
    F: FnOnce(&mut Bus<'_, SPI, CS>) -> Result<T, E>,
{
    cs.set_low()
        .map_err(|_| E::from(ChipSelectSnafu {}.build()))?;

    let mut bus = Bus {
        spi: &mut *spi,
        cs: &mut *cs,
    };
    let result = body(&mut bus);
    let released = release(spi, cs);

    match (result, released) {
        (Err(e), _) => Err(e),
        (Ok(_), Err(e)) => Err(E::from(e)),
        (Ok(value), Ok(())) => Ok(value),
    }
}

/// Execute one command in its own transaction.
pub fn command<SPI, CS>(
    spi: &mut SPI,
    cs: &mut CS,
    cmd: Command,
    arg: u32,
) -> Result<Response, Error>
where
    SPI: Transfer<u8> + Write<u8>,
    CS: OutputPin,
{
    transaction(spi, cs, |bus| bus.command(cmd, arg))
}

fn release<SPI, CS>(spi: &mut SPI, cs: &mut CS) -> Result<(), Error>
where
    SPI: Transfer<u8>,
    CS: OutputPin,
{
    cs.set_high().map_err(|_| ChipSelectSnafu {}.build())?;

    // One more byte with chip select high lets the card finish the
    // transaction before the bus moves on.
    receive(spi)?;

    Ok(())
}

fn receive<SPI: Transfer<u8>>(spi: &mut SPI) -> Result<u8, Error> {
    let mut buffer = [0xFF];
    spi.transfer(&mut buffer)
        .map_err(|_| SpiTransferSnafu {}.build())?;

    Ok(buffer[0])
}

impl<'a, SPI, CS> Bus<'a, SPI, CS>
where
    SPI: Transfer<u8> + Write<u8>,
    CS: OutputPin,
{
    /// Execute a command on the already held bus and parse its response.
    ///
    /// An application specific command is escaped with AppCmd first. Error
    /// flags in the R1 byte surface as [`Error::CommandResponse`]; the
    /// tail of an R3 or R7 response is only read when the status is clean
    /// since the card truncates the tail after a flagged status.
    pub fn command(&mut self, cmd: Command, arg: u32) -> Result<Response, Error> {
        if cmd.is_app_cmd() {
            self.run_command(Command::AppCmd, 0)?;
            self.cycle_chip_select()?;
        }

        self.run_command(cmd, arg)
    }

    /// Clock in one byte by sending 0xFF.
    pub fn receive(&mut self) -> Result<u8, Error> {
        receive(self.spi)
    }

    /// Fill `buffer` with clocked in bytes.
    pub fn receive_exact(&mut self, buffer: &mut [u8]) -> Result<(), Error> {
        buffer.fill(0xFF);
        self.spi
            .transfer(buffer)
            .map_err(|_| SpiTransferSnafu {}.build())?;

        Ok(())
    }

    /// Clock out `bytes`, discarding whatever comes back.
    pub fn send(&mut self, bytes: &[u8]) -> Result<(), Error> {
        self.spi.write(bytes).map_err(|_| SpiWriteSnafu {}.build())
    }

    fn run_command(&mut self, cmd: Command, arg: u32) -> Result<Response, Error> {
        let mut frame = [0; FRAME_LEN];
        cmd.encode(arg, &mut frame);
        self.send(&frame)?;

        let status = self
            .wait_for_response()?
            .check_error()
            .context(CommandResponseSnafu)?;

        let tail = match cmd.response() {
            ResponseKind::R1 => None,
            ResponseKind::R3 | ResponseKind::R7 => {
                let mut tail = [0xFF; RESPONSE_TAIL_LEN];
                self.receive_exact(&mut tail)?;
                Some(tail)
            }
        };

        Ok(Response { status, tail })
    }

    // The response byte is the first one clocked in with the transmission
    // bit (MSB) clear; the card needs up to 8 byte times to present it
    // (section 7.2.1).
    fn wait_for_response(&mut self) -> Result<R1Response, Error> {
        for _ in 0..MAX_WAIT_FOR_RESPONSE {
            let recv = self.receive()?;
            if recv & 0x80 == 0 {
                return Ok(R1Response::new(recv));
            }
        }

        WaitForResponseTimeoutSnafu {}.fail()
    }

    // Deassert chip select, clock one byte, reassert. Required between
    // AppCmd and the application command that follows it to keep the
    // second response aligned on some cards.
    fn cycle_chip_select(&mut self) -> Result<(), Error> {
        self.cs.set_high().map_err(|_| ChipSelectSnafu {}.build())?;
        self.receive()?;
        self.cs.set_low().map_err(|_| ChipSelectSnafu {}.build())?;

        Ok(())
    }
}

#[cfg(test)]
mod test {
    use std::{io::ErrorKind, iter};

    use embedded_hal_mock::{pin, spi, MockError};

    use crate::testutils::frame;

    use super::*;

    #[test]
    fn transaction_toggles_cs_and_clocks_release_byte() {
        let mut spi = spi::Mock::new(&[spi::Transaction::transfer(vec![0xFF], vec![0xFF])]);
        let mut cs = pin::Mock::new(&[
            pin::Transaction::set(pin::State::Low),
            pin::Transaction::set(pin::State::High),
        ]);

        let result: Result<(), Error> = transaction(&mut spi, &mut cs, |_| Ok(()));

        spi.done();
        cs.done();
        assert_eq!(result, Ok(()));
    }

    #[test]
    fn transaction_releases_bus_when_body_errors() {
        let mut spi = spi::Mock::new(&[spi::Transaction::transfer(vec![0xFF], vec![0xFF])]);
        let mut cs = pin::Mock::new(&[
            pin::Transaction::set(pin::State::Low),
            pin::Transaction::set(pin::State::High),
        ]);

        let result: Result<(), Error> =
            transaction(&mut spi, &mut cs, |_| WaitForResponseTimeoutSnafu {}.fail());

        spi.done();
        cs.done();
        assert_eq!(result, Err(Error::WaitForResponseTimeout));
    }

    #[test]
    fn transaction_body_error_takes_priority_over_release_error() {
        let go_high = pin::Transaction::set(pin::State::High)
            .with_error(MockError::Io(ErrorKind::Unsupported));
        let mut spi = spi::Mock::new(&[]);
        let mut cs = pin::Mock::new(&[pin::Transaction::set(pin::State::Low), go_high]);

        let result: Result<(), Error> =
            transaction(&mut spi, &mut cs, |_| WaitForResponseTimeoutSnafu {}.fail());

        spi.done();
        cs.done();
        assert_eq!(result, Err(Error::WaitForResponseTimeout));
    }

    #[test]
    fn command_writes_frame_and_polls_response() {
        let expectations = [
            spi::Transaction::write(frame(Command::GoIdleState, 0)),
            spi::Transaction::transfer(vec![0xFF], vec![0xFF]),
            spi::Transaction::transfer(vec![0xFF], vec![0x01]),
            spi::Transaction::transfer(vec![0xFF], vec![0xFF]),
        ];
        let mut spi = spi::Mock::new(&expectations);
        let mut cs = pin::Mock::new(&[
            pin::Transaction::set(pin::State::Low),
            pin::Transaction::set(pin::State::High),
        ]);

        let response = command(&mut spi, &mut cs, Command::GoIdleState, 0)
            .expect("error executing command");

        spi.done();
        cs.done();
        assert!(response.status.is_idle());
        assert_eq!(response.tail, None);
    }

    #[test]
    fn command_with_no_response_times_out() {
        let mut expectations = vec![spi::Transaction::write(frame(Command::GoIdleState, 0))];
        expectations.extend(
            iter::repeat(spi::Transaction::transfer(vec![0xFF], vec![0xFF]))
                .take(MAX_WAIT_FOR_RESPONSE as usize),
        );
        // the release byte still goes out after the timeout
        expectations.push(spi::Transaction::transfer(vec![0xFF], vec![0xFF]));
        let mut spi = spi::Mock::new(&expectations);
        let mut cs = pin::Mock::new(&[
            pin::Transaction::set(pin::State::Low),
            pin::Transaction::set(pin::State::High),
        ]);

        let result = command(&mut spi, &mut cs, Command::GoIdleState, 0);

        spi.done();
        cs.done();
        assert_eq!(result, Err(Error::WaitForResponseTimeout));
    }

    #[test]
    fn command_with_error_response_reports_flags() {
        let expectations = [
            spi::Transaction::write(frame(Command::SetBlockLen, 512)),
            spi::Transaction::transfer(vec![0xFF], vec![0b0100_0000]),
            spi::Transaction::transfer(vec![0xFF], vec![0xFF]),
        ];
        let mut spi = spi::Mock::new(&expectations);
        let mut cs = pin::Mock::new(&[
            pin::Transaction::set(pin::State::Low),
            pin::Transaction::set(pin::State::High),
        ]);

        let result = command(&mut spi, &mut cs, Command::SetBlockLen, 512);

        spi.done();
        cs.done();
        assert_eq!(
            result,
            Err(Error::CommandResponse {
                source: ResponseError::ParameterError { status: 0b0100_0000 }
            })
        );
    }

    #[test]
    fn r7_command_reads_four_byte_tail() {
        let expectations = [
            spi::Transaction::write(frame(Command::SendIfCond, 0x1AA)),
            spi::Transaction::transfer(vec![0xFF], vec![0x01]),
            spi::Transaction::transfer(vec![0xFF; 4], vec![0x00, 0x00, 0x01, 0xAA]),
            spi::Transaction::transfer(vec![0xFF], vec![0xFF]),
        ];
        let mut spi = spi::Mock::new(&expectations);
        let mut cs = pin::Mock::new(&[
            pin::Transaction::set(pin::State::Low),
            pin::Transaction::set(pin::State::High),
        ]);

        let response = command(&mut spi, &mut cs, Command::SendIfCond, 0x1AA)
            .expect("error executing command");

        spi.done();
        cs.done();
        assert_eq!(response.tail, Some([0x00, 0x00, 0x01, 0xAA]));
    }

    #[test]
    fn app_cmd_cycles_chip_select_between_escape_and_command() {
        let expectations: Vec<spi::Transaction> = vec![
            spi::Transaction::write(frame(Command::AppCmd, 0)),
            spi::Transaction::transfer(vec![0xFF], vec![0x01]),
            // one byte clocked with chip select deasserted
            spi::Transaction::transfer(vec![0xFF], vec![0xFF]),
            spi::Transaction::write(frame(Command::SdSendOpCond, 1 << 30)),
            spi::Transaction::transfer(vec![0xFF], vec![0x00]),
            spi::Transaction::transfer(vec![0xFF], vec![0xFF]),
        ];
        let mut spi = spi::Mock::new(&expectations);
        let mut cs = pin::Mock::new(&[
            pin::Transaction::set(pin::State::Low),
            pin::Transaction::set(pin::State::High),
            pin::Transaction::set(pin::State::Low),
            pin::Transaction::set(pin::State::High),
        ]);

        let response = command(&mut spi, &mut cs, Command::SdSendOpCond, 1 << 30)
            .expect("error executing app command");

        spi.done();
        cs.done();
        assert!(response.status.is_ready());
    }
}
