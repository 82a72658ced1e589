//! Sprinkler relay on a single GPIO line. The `gpio` feature gates the real
//! rppal driver; without it, a mock relay only tracks and logs its state.

use anyhow::Result;
use tracing::info;

#[cfg(feature = "gpio")]
use rppal::gpio::{Gpio, OutputPin};

// ---------------------------------------------------------------------------
// Real GPIO relay (Raspberry Pi)
// ---------------------------------------------------------------------------
#[cfg(feature = "gpio")]
pub struct SprinklerRelay {
    pin: OutputPin,
    active_low: bool,
    on: bool,
}

#[cfg(feature = "gpio")]
impl SprinklerRelay {
    pub fn new(pin_num: u8, active_low: bool) -> Result<Self> {
        let gpio = Gpio::new()?;
        let mut pin = gpio.get(pin_num)?.into_output();
        // Only `release` hands the line back to the kernel.
        pin.set_reset_on_drop(false);

        let mut relay = Self {
            pin,
            active_low,
            on: true,
        };
        relay.set(false);
        info!(gpio = pin_num, active_low, "sprinkler relay ready");
        Ok(relay)
    }

    pub fn set(&mut self, on: bool) {
        // active-low boards energise on LOW
        if on != self.active_low {
            self.pin.set_high();
        } else {
            self.pin.set_low();
        }
        if self.on != on {
            info!(on, "sprinkler relay switched");
        }
        self.on = on;
    }

    pub fn is_on(&self) -> bool {
        self.on
    }

    /// Drive the relay off and give the line back to the kernel.
    pub fn release(mut self) {
        self.set(false);
        self.pin.set_reset_on_drop(true);
        info!("sprinkler relay released");
    }
}

// ---------------------------------------------------------------------------
// Mock relay (no hardware)
// ---------------------------------------------------------------------------
#[cfg(not(feature = "gpio"))]
pub struct SprinklerRelay {
    pin_num: u8,
    on: bool,
}

#[cfg(not(feature = "gpio"))]
impl SprinklerRelay {
    pub fn new(pin_num: u8, active_low: bool) -> Result<Self> {
        info!(gpio = pin_num, active_low, "[mock-gpio] sprinkler relay registered (not wired)");
        Ok(Self { pin_num, on: false })
    }

    pub fn set(&mut self, on: bool) {
        if self.on != on {
            info!(gpio = self.pin_num, on, "[mock-gpio] sprinkler relay switched");
        }
        self.on = on;
    }

    pub fn is_on(&self) -> bool {
        self.on
    }

    pub fn release(mut self) {
        self.set(false);
        info!(gpio = self.pin_num, "[mock-gpio] sprinkler relay released");
    }
}

// ===========================================================================
// Tests
// ===========================================================================
