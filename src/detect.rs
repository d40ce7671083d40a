// Copyright 2022 Steven Bosnick
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE-2.0 or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms

//! Card detect pin monitoring.
//!
//! The card detect signal is active low: a card sitting in the slot pulls
//! the pin down. The monitor keeps the last observed level and turns
//! level changes into edges, so repeated samples at the same level are
//! quiet and a single mechanical bounce produces at most one edge per
//! sample.

use embedded_hal::digital::v2::InputPin;
use snafu::prelude::*;

/// A change on the card detect line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Edge {
    /// A card appeared in the slot.
    Inserted,

    /// The card left the slot.
    Removed,
}

/// The ways presence monitoring can fail.
#[derive(Debug, PartialEq, Snafu)]
pub enum Error {
    /// The card detect pin could not be read.
    #[snafu(display("Unable to read the card detect pin."))]
    DetectPin,
}

/// Watches the active low card detect signal for insertions and removals.
#[derive(Debug)]
pub struct DetectMonitor<PIN> {
    pin: PIN,
    present: bool,
}

impl<PIN> DetectMonitor<PIN> {
    /// Start monitoring `pin`. The card counts as absent until the first
    /// sample says otherwise, so a card already in the slot produces an
    /// [`Edge::Inserted`] on the first poll.
    pub fn new(pin: PIN) -> Self {
        Self {
            pin,
            present: false,
        }
    }

    /// The level the last sample saw.
    pub fn is_present(&self) -> bool {
        self.present
    }

    /// Stop monitoring and return the pin.
    pub fn release(self) -> PIN {
        self.pin
    }
}

impl<PIN: InputPin> DetectMonitor<PIN> {
    /// Sample the detect line and report an edge if the level changed.
    pub fn poll(&mut self) -> Result<Option<Edge>, Error> {
        let present = self.pin.is_low().map_err(|_| DetectPinSnafu {}.build())?;

        if present == self.present {
            return Ok(None);
        }

        self.present = present;
        Ok(Some(if present {
            Edge::Inserted
        } else {
            Edge::Removed
        }))
    }
}

#[cfg(test)]
mod test {
    use embedded_hal_mock::pin;

    use super::*;

    #[test]
    fn first_low_sample_is_an_insertion() {
        let mut monitor = DetectMonitor::new(pin::Mock::new(&[pin::Transaction::get(
            pin::State::Low,
        )]));

        let edge = monitor.poll().expect("error polling detect pin");

        assert_eq!(edge, Some(Edge::Inserted));
        assert!(monitor.is_present());
        monitor.release().done();
    }

    #[test]
    fn absent_card_stays_quiet() {
        let mut monitor = DetectMonitor::new(pin::Mock::new(&[pin::Transaction::get(
            pin::State::High,
        )]));

        let edge = monitor.poll().expect("error polling detect pin");

        assert_eq!(edge, None);
        assert!(!monitor.is_present());
        monitor.release().done();
    }

    #[test]
    fn same_level_samples_produce_one_edge() {
        let mut monitor = DetectMonitor::new(pin::Mock::new(&[
            pin::Transaction::get(pin::State::Low),
            pin::Transaction::get(pin::State::Low),
        ]));

        assert_eq!(monitor.poll(), Ok(Some(Edge::Inserted)));
        assert_eq!(monitor.poll(), Ok(None));
        monitor.release().done();
    }

    #[test]
    fn high_after_low_is_a_removal() {
        let mut monitor = DetectMonitor::new(pin::Mock::new(&[
            pin::Transaction::get(pin::State::Low),
            pin::Transaction::get(pin::State::High),
        ]));

        assert_eq!(monitor.poll(), Ok(Some(Edge::Inserted)));
        assert_eq!(monitor.poll(), Ok(Some(Edge::Removed)));
        assert!(!monitor.is_present());
        monitor.release().done();
    }
}
