//! # LED Alert Output
//!
//! Shows the latest alert color on an RGB LED.
//!
//! ## Lifecycle
//!
//! The controller is a statum state machine. Colors can only be set on a
//! `LedController<Ready>`, which exists only after `initialize` switched the LED off
//! successfully:
//!
//! ```text
//! create() ──► Uninitialized ──initialize()──► Ready ──cleanup()──► Uninitialized
//!                                               │ ▲
//!                                               └─┘ set_color / turn_off / test_sequence
//! ```
//!
//! ## Validation
//!
//! Channel values are checked before any driver is invoked. Input outside [0,255] fails
//! with [`LedError::InvalidColor`] and the LED keeps its previous color.

pub mod driver;

use statum::{machine, state};
use std::time::Duration;
use tracing::{error, info, warn};

use crate::mqtt::payload::Rgb;
pub use driver::{LedDriver, LedError, ScriptLedDriver};

#[cfg(feature = "gpio")]
pub use driver::GpioLedDriver;

/// Colors shown by [`LedController::test_sequence`], ending with the LED off.
pub const TEST_SEQUENCE: [(&str, Rgb); 8] = [
    ("red", Rgb::new(255, 0, 0)),
    ("green", Rgb::new(0, 255, 0)),
    ("blue", Rgb::new(0, 0, 255)),
    ("yellow", Rgb::new(255, 255, 0)),
    ("magenta", Rgb::new(255, 0, 255)),
    ("cyan", Rgb::new(0, 255, 255)),
    ("white", Rgb::new(255, 255, 255)),
    ("off", Rgb::OFF),
];

pub const TEST_STEP: Duration = Duration::from_millis(800);

#[state]
#[derive(Debug, Clone)]
pub enum LedState {
    Uninitialized,
    Ready,
}

#[machine]
pub struct LedController<S: LedState> {
    driver: Box<dyn LedDriver>,
    current: Rgb,
}

impl<S: LedState> LedController<S> {
    /// Last color the driver confirmed.
    pub fn current_color(&self) -> Rgb {
        self.current
    }

    pub fn driver_name(&self) -> &'static str {
        self.driver.name()
    }
}

impl LedController<Uninitialized> {
    pub fn create(driver: Box<dyn LedDriver>) -> Self {
        info!("Creating LED controller with {} driver", driver.name());
        Self::new(driver, Rgb::OFF)
    }

    /// Switches the LED off and transitions to Ready.
    pub async fn initialize(mut self) -> Result<LedController<Ready>, LedError> {
        match self.driver.apply(Rgb::OFF).await {
            Ok(()) => {
                self.current = Rgb::OFF;
                info!("LED initialized");
                Ok(self.transition())
            }
            Err(e) => {
                error!("LED initialization failed: {}", e);
                Err(e)
            }
        }
    }
}

impl LedController<Ready> {
    pub async fn set_color(&mut self, color: Rgb) -> Result<(), LedError> {
        self.driver.apply(color).await?;
        self.current = color;
        info!("LED set to {}", color);
        Ok(())
    }

    /// Validates raw channel values before touching the driver.
    pub async fn set_channels(&mut self, r: i64, g: i64, b: i64) -> Result<(), LedError> {
        let color = Rgb::try_from_channels(r, g, b).map_err(|_| {
            let e = LedError::InvalidColor(format!("({r}, {g}, {b})"));
            error!("{}", e);
            e
        })?;
        self.set_color(color).await
    }

    pub async fn turn_off(&mut self) -> Result<(), LedError> {
        self.set_color(Rgb::OFF).await
    }

    /// Cycles through [`TEST_SEQUENCE`], waiting `step` after each color.
    pub async fn test_sequence(&mut self, step: Duration) -> Result<(), LedError> {
        info!("Running LED test sequence");
        for (name, color) in TEST_SEQUENCE {
            info!("LED test: {}", name);
            self.set_color(color).await?;
            tokio::time::sleep(step).await;
        }
        Ok(())
    }

    /// Switches the LED off for shutdown. A failing driver is logged, not returned.
    pub async fn cleanup(mut self) -> LedController<Uninitialized> {
        if let Err(e) = self.turn_off().await {
            warn!("Could not switch LED off during cleanup: {}", e);
        }
        info!("LED controller cleaned up");
        self.transition()
    }
}
