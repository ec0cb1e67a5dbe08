use async_trait::async_trait;
use std::path::PathBuf;
use tokio::process::Command;
use tracing::{debug, info};

use crate::mqtt::payload::Rgb;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LedError {
    #[error("Invalid RGB values: {0}")]
    InvalidColor(String),

    #[error("Failed to start {program}: {reason}")]
    Spawn { program: String, reason: String },

    #[error("LED script exited with {code:?}: {stderr}")]
    ScriptFailed { code: Option<i32>, stderr: String },

    #[error("GPIO error: {0}")]
    Gpio(String),
}

/// Hardware side of the LED. Colors reaching a driver are already validated.
#[async_trait]
pub trait LedDriver: Send {
    async fn apply(&mut self, color: Rgb) -> Result<(), LedError>;

    fn name(&self) -> &'static str;
}

/// Runs an external script as `<interpreter> <script> R G B` for every color change.
pub struct ScriptLedDriver {
    interpreter: String,
    script: PathBuf,
}

impl ScriptLedDriver {
    pub fn new(interpreter: impl Into<String>, script: impl Into<PathBuf>) -> Self {
        Self {
            interpreter: interpreter.into(),
            script: script.into(),
        }
    }
}

#[async_trait]
impl LedDriver for ScriptLedDriver {
    async fn apply(&mut self, color: Rgb) -> Result<(), LedError> {
        let output = Command::new(&self.interpreter)
            .arg(&self.script)
            .args([color.r.to_string(), color.g.to_string(), color.b.to_string()])
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| LedError::Spawn {
                program: self.interpreter.clone(),
                reason: e.to_string(),
            })?;

        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        if !output.status.success() {
            return Err(LedError::ScriptFailed {
                code: output.status.code(),
                stderr,
            });
        }

        if stderr.contains("simulation") {
            info!("LED script is running in simulation mode");
        }
        let stdout = String::from_utf8_lossy(&output.stdout);
        debug!("LED script: {}", stdout.trim());
        Ok(())
    }

    fn name(&self) -> &'static str {
        "script"
    }
}

#[cfg(feature = "gpio")]
pub use gpio::GpioLedDriver;

#[cfg(feature = "gpio")]
mod gpio {
    use async_trait::async_trait;
    use rppal::gpio::{Gpio, OutputPin};

    use super::{LedDriver, LedError};
    use crate::mqtt::payload::Rgb;

    const PWM_FREQUENCY_HZ: f64 = 100.0;

    /// Drives the three channels with software PWM.
    ///
    /// On a common-anode LED a channel is lit when its pin is low, so duty cycles are
    /// inverted.
    pub struct GpioLedDriver {
        pins: [OutputPin; 3],
        common_anode: bool,
    }

    impl GpioLedDriver {
        pub fn new(red: u8, green: u8, blue: u8, common_anode: bool) -> Result<Self, LedError> {
            let gpio = Gpio::new().map_err(|e| LedError::Gpio(e.to_string()))?;
            let output = |pin: u8| -> Result<OutputPin, LedError> {
                gpio.get(pin)
                    .map(|pin| pin.into_output())
                    .map_err(|e| LedError::Gpio(format!("pin {pin}: {e}")))
            };

            Ok(Self {
                pins: [output(red)?, output(green)?, output(blue)?],
                common_anode,
            })
        }

        fn duty_cycle(&self, channel: u8) -> f64 {
            let level = f64::from(channel) / 255.0;
            if self.common_anode {
                1.0 - level
            } else {
                level
            }
        }
    }

    #[async_trait]
    impl LedDriver for GpioLedDriver {
        async fn apply(&mut self, color: Rgb) -> Result<(), LedError> {
            let duties = [
                self.duty_cycle(color.r),
                self.duty_cycle(color.g),
                self.duty_cycle(color.b),
            ];
            for (pin, duty) in self.pins.iter_mut().zip(duties) {
                pin.set_pwm_frequency(PWM_FREQUENCY_HZ, duty)
                    .map_err(|e| LedError::Gpio(e.to_string()))?;
            }
            Ok(())
        }

        fn name(&self) -> &'static str {
            "gpio"
        }
    }
}
