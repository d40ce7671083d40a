// Copyright 2022 Steven Bosnick
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE-2.0 or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms

//! The cold start dance that takes a card from power up to full clock.
//!
//! This follows the power up sequence in section 6.4.1 and the
//! initilization flow from Figure 7-2 of the Simplified Specification.
//! The flow is drivern as an explicit state machine: each [`Step`] names
//! the milestone the card has reached, and the driver loop advances one
//! milestone at a time until the card runs at full clock. Every command
//! is its own bus transaction, so a failure at any milestone leaves the
//! bus released.

use embedded_hal::{
    blocking::{
        delay::DelayMs,
        spi::{Transfer, Write},
    },
    digital::v2::OutputPin,
};
use log::{debug, trace};
use snafu::prelude::*;

use crate::{
    cmds::{if_cond_arg, op_cond_arg, Command},
    constants::{BusClock, CardType, BLOCK_LEN, IF_COND_ECHO},
    resp, transactions,
};

const MAX_OP_COND_RETRIES: u32 = 100;

/// The ways card initilization can fail.
#[derive(Debug, PartialEq, Snafu)]
pub enum Error {
    /// The chip select pin could not be driven for the power up pulse.
    #[snafu(display("Unable to drive chip select for the power up pulse."))]
    ChipSelect,

    /// The SPI peripheral failed during the power up pulse.
    #[snafu(display("Unable to clock the power up pulse out over SPI."))]
    SpiWrite,

    /// The card did not answer the reset command with the idle state.
    #[snafu(display("Unknown or missing card."))]
    UnknownCard,

    /// The voltage echo of a SendIfCond command came back wrong.
    #[snafu(display("Bad card voltage response."))]
    BadVoltage,

    /// The card stayed idle through the whole SdSendOpCond retry budget.
    #[snafu(display("Timed out before card was ready."))]
    OpCondTimeout,

    /// A command transfer failed partway through initilization.
    #[snafu(display("Unable to complete an initilization command."))]
    Command {
        /// The underlying transfer failure.
        source: transactions::Error,
    },
}

// The milestones of Figure 7-2, in the order the driver loop reaches
// them. The card is usable once `Fast` is reached.
#[derive(Debug, Clone, Copy, PartialEq)]
enum Step {
    PulseSent,
    IdleAcked,
    VoltageChecked,
    Ready41,
    CrcOn,
    OcrRead,
    Fast,
}

// 74 clocks is the minimum the card needs to latch SPI mode; ten whole
// bytes is the nearest the bus can clock out.
const PULSE: [u8; 10] = [0xFF; 10];

/// Wake a freshly powered card.
///
/// Section 6.4.1.1 of the Simplified Specification asks for 1 ms of
/// supply settle followed by at least 74 clocks with chip select held
/// high; only after that pulse will the card take commands in SPI mode.
pub fn power_up_card(
    spi: &mut impl Write<u8>,
    cs: &mut impl OutputPin,
    delay: &mut impl DelayMs<u8>,
) -> Result<(), Error> {
    delay.delay_ms(1);

    cs.set_high().map_err(|_| ChipSelectSnafu {}.build())?;
    spi.write(&PULSE).map_err(|_| SpiWriteSnafu {}.build())?;

    Ok(())
}

/// Take a freshly inserted card through the whole cold start dance and
/// report how it wants to be addressed.
///
/// `configure_clock` is the platform hook for the two clock rates the
/// dance needs: it is called with [`BusClock::Slow`] before the power up
/// pulse and with [`BusClock::Fast`] once the card is ready.
pub fn initialize<SPI, CS, D, F>(
    spi: &mut SPI,
    cs: &mut CS,
    delay: &mut D,
    configure_clock: &mut F,
) -> Result<CardType, Error>
where
    SPI: Transfer<u8> + Write<u8>,
    CS: OutputPin,
    D: DelayMs<u8>,
    F: FnMut(&mut SPI, BusClock),
{
    configure_clock(spi, BusClock::Slow);
    power_up_card(spi, cs, delay)?;

    let mut card_type = CardType::Unknown;
    let mut step = Step::PulseSent;

    loop {
        step = match step {
            // 2. GoIdleState must put the card into the idle state.
            Step::PulseSent => match transactions::command(spi, cs, Command::GoIdleState, 0) {
                Ok(response) if response.status.is_idle() => Step::IdleAcked,
                response => {
                    debug!("card reset failed: {response:?}");
                    return UnknownCardSnafu {}.fail();
                }
            },

            // 3. SendIfCond probes the card version. A version 1 card
            // rejects the command outright; a version 2 card must echo
            // our voltage nibble and check pattern.
            Step::IdleAcked => match transactions::command(spi, cs, Command::SendIfCond, if_cond_arg()) {
                Ok(response) => {
                    let echoed = match response.tail {
                        Some(tail) => resp::r7_echo(&tail),
                        None => 0,
                    };
                    ensure!(echoed == IF_COND_ECHO, BadVoltageSnafu);
                    Step::VoltageChecked
                }
                Err(transactions::Error::CommandResponse { ref source })
                    if source.is_illegal_command_only() =>
                {
                    trace!("card rejected SendIfCond: version 1 card");
                    card_type = CardType::SdV1;
                    Step::VoltageChecked
                }
                Err(e) => return Err(e).context(CommandSnafu),
            },

            // 4. SdSendOpCond repeatedly until the card leaves the idle
            // state.
            Step::VoltageChecked => {
                let mut ready = false;
                for _ in 0..MAX_OP_COND_RETRIES {
                    let response =
                        transactions::command(spi, cs, Command::SdSendOpCond, op_cond_arg())
                            .context(CommandSnafu)?;

                    if !response.status.is_idle() {
                        ready = true;
                        break;
                    }

                    delay.delay_ms(1);
                }

                ensure!(ready, OpCondTimeoutSnafu);
                Step::Ready41
            }

            // 5. CrcOnOff turns bus checksum protection on.
            Step::Ready41 => {
                transactions::command(spi, cs, Command::CrcOnOff, 1).context(CommandSnafu)?;
                Step::CrcOn
            }

            // 6. ReadOcr classifies a version 2 card by its capacity
            // bit; byte addressed cards also get the block length pinned.
            Step::CrcOn => {
                if card_type == CardType::Unknown {
                    let response = transactions::command(spi, cs, Command::ReadOcr, 0)
                        .context(CommandSnafu)?;

                    card_type = match response.tail {
                        Some(tail) if resp::ocr_high_capacity(&tail) => CardType::SdV2Block,
                        _ => CardType::SdV2,
                    };

                    if card_type == CardType::SdV2 {
                        transactions::command(spi, cs, Command::SetBlockLen, BLOCK_LEN as u32)
                            .context(CommandSnafu)?;
                    }
                }
                Step::OcrRead
            }

            // 7. The identification clock is no longer needed.
            Step::OcrRead => {
                configure_clock(spi, BusClock::Fast);
                Step::Fast
            }

            Step::Fast => break,
        };
    }

    debug!("card initilized as {card_type:?}");
    Ok(card_type)
}
