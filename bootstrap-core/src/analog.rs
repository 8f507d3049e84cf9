// Averaged analog voltage reads

use crate::error::DriverError;

/// One calibrated conversion in millivolts.
pub trait AnalogInput {
    fn sample_mv(&mut self, channel: u8) -> Result<u32, DriverError>;
}

pub struct AnalogReader<I> {
    input: I,
}

impl<I: AnalogInput> AnalogReader<I> {
    pub fn new(input: I) -> Self {
        Self { input }
    }

    pub fn input(&self) -> &I {
        &self.input
    }

    /// Mean of the valid samples out of `samples` attempts. Failed samples are
    /// logged and skipped; no valid sample reads as 0.
    pub fn read_voltage(&mut self, channel: u8, samples: u16) -> u32 {
        let mut sum = 0u64;
        let mut valid = 0u32;

        for _ in 0..samples {
            match self.input.sample_mv(channel) {
                Ok(mv) => {
                    sum += u64::from(mv);
                    valid += 1;
                }
                Err(e) => log::warn!("ADC channel {} sample failed: {}", channel, e),
            }
        }

        if valid == 0 {
            log::error!("ADC channel {}: no valid samples", channel);
            return 0;
        }
        (sum / u64::from(valid)) as u32
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    struct Script(VecDeque<Result<u32, DriverError>>);

    impl AnalogInput for Script {
        fn sample_mv(&mut self, _channel: u8) -> Result<u32, DriverError> {
            self.0
                .pop_front()
                .unwrap_or_else(|| Err(DriverError::new("adc_oneshot_read", "exhausted")))
        }
    }

    fn reader(samples: Vec<Result<u32, DriverError>>) -> AnalogReader<Script> {
        AnalogReader::new(Script(samples.into()))
    }

    #[test]
    fn averages_valid_samples() {
        let mut r = reader(vec![Ok(1000), Ok(1100), Ok(1200), Ok(1300)]);
        assert_eq!(r.read_voltage(6, 4), 1150);
    }

    #[test]
    fn skips_failed_samples() {
        let timeout = || Err(DriverError::with_code("adc_oneshot_read", 0x107, "timeout"));
        let mut r = reader(vec![Ok(900), timeout(), Ok(1100), timeout()]);
        assert_eq!(r.read_voltage(0, 4), 1000);
    }

    #[test]
    fn no_valid_samples_reads_zero() {
        let mut r = reader(vec![]);
        assert_eq!(r.read_voltage(3, 8), 0);
        assert_eq!(r.read_voltage(3, 0), 0);
    }
}
