//! Absorbance transform
//!
//! Detector counts are logarithmic in light intensity. Each count `x` maps to
//! an intensity `10^(2·K·x)`; the sample intensity combines both pulses and
//! subtracts the background twice:
//!
//! ```text
//! Is = 10^(2Kp1) + 10^(2Kp2) - 2·10^(2Kbg)
//! absorbance = log10(reference / Is)
//! ```
//!
//! The subtraction cancels most of the magnitude when the pulses are close to
//! the background, so everything runs on 66-digit decimals.

use crate::channel::{decimal, AdcReading, ChannelRegister, CHANNEL_COUNT, PRECISION};
use crate::error::{AppResult, DaqError};
use crate::measurement::{AbsorbanceRecord, MeasurementRecord};
use dashu::float::DBig;
use dashu::integer::IBig;
use once_cell::sync::Lazy;
use tracing::debug;

/// `2·K` with K = 45.7763672e-6, the ADC count to log-intensity scale.
static TWO_K: Lazy<DBig> = Lazy::new(|| {
    let k = DBig::from_parts(IBig::from(457_763_672), -13)
        .with_precision(PRECISION)
        .value();
    &k * &decimal(2)
});

static LN_10: Lazy<DBig> = Lazy::new(|| decimal(10).ln());

fn pow10(exponent: &DBig) -> DBig {
    (exponent * &*LN_10).exp()
}

fn log10(value: &DBig) -> DBig {
    value.ln() / &*LN_10
}

/// Sample intensity `Is` of one raw triple.
pub fn intensity(reading: &AdcReading) -> DBig {
    let level = |count: u16| pow10(&(&*TWO_K * &decimal(count)));
    let im1 = level(reading.pulse1);
    let im2 = level(reading.pulse2);
    let imbg = level(reading.background);
    im1 + im2 - &decimal(2) * &imbg
}

/// `log10(reference / Is)` for one channel.
///
/// Fails with `Domain` when `Is` or `reference` is not strictly positive.
pub fn absorbance(pulse1: u16, pulse2: u16, background: u16, reference: &DBig) -> AppResult<DBig> {
    let reading = AdcReading {
        pulse1,
        pulse2,
        background,
    };
    ratio_absorbance(reference, &checked_intensity(&reading)?)
}

fn checked_intensity(reading: &AdcReading) -> AppResult<DBig> {
    let is = intensity(reading);
    if is <= DBig::ZERO {
        return Err(DaqError::Domain(format!(
            "non-positive intensity {is} for reading {reading:?}"
        )));
    }
    Ok(is)
}

fn ratio_absorbance(reference: &DBig, is: &DBig) -> AppResult<DBig> {
    if *reference <= DBig::ZERO {
        return Err(DaqError::Domain(format!("non-positive reference {reference}")));
    }
    let reference = reference.clone().with_precision(PRECISION).value();
    Ok(log10(&(reference / is)))
}

/// Transform every channel of `record` against the register's references.
///
/// For a reference record (label starting with `REF`) each measured
/// channel's reference becomes its own `Is` first, so the record itself has
/// absorbance zero. Channels with an all-zero triple were not measured and
/// yield `None`. A domain error on any channel rejects the whole record and
/// leaves the register untouched.
pub fn apply_record(
    register: &mut ChannelRegister,
    record: &MeasurementRecord,
) -> AppResult<AbsorbanceRecord> {
    let adopt = record.is_reference();
    let mut values = Vec::with_capacity(CHANNEL_COUNT);
    let mut new_references = Vec::new();

    for (channel, reading) in record.readings.iter().enumerate() {
        if reading.is_zero() {
            values.push(None);
            continue;
        }
        let is = checked_intensity(reading)
            .map_err(|e| DaqError::Domain(format!("{} channel {channel}: {e}", record.label)))?;
        let reference = if adopt {
            new_references.push((channel, is.clone()));
            is.clone()
        } else {
            register
                .get(channel)
                .map(|c| c.reference().clone())
                .ok_or_else(|| DaqError::InvalidArgument(format!("no channel {channel}")))?
        };
        values.push(Some(ratio_absorbance(&reference, &is)?));
    }

    for (channel, reference) in new_references {
        register.set_reference(channel, reference)?;
    }
    debug!("Transformed record {}", record.label);

    Ok(AbsorbanceRecord {
        user_id: record.user_id.clone(),
        sample: record.sample.clone(),
        label: record.label.clone(),
        values,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::MetadataBuilder;

    fn to_f64(value: &DBig) -> f64 {
        value.to_f64().value()
    }

    fn record(label: &str, readings: &[(usize, AdcReading)]) -> MeasurementRecord {
        let metadata = MetadataBuilder::new().user_id("op1").build();
        let mut record = MeasurementRecord::new(&metadata, "", label.to_string());
        for (channel, reading) in readings {
            record.readings[*channel] = *reading;
        }
        record
    }

    fn reading(pulse1: u16, pulse2: u16, background: u16) -> AdcReading {
        AdcReading {
            pulse1,
            pulse2,
            background,
        }
    }

    #[test]
    fn test_intensity_of_zero_background() {
        // p1 = p2 = 0, bg = 0: 1 + 1 - 2 = 0
        assert_eq!(intensity(&reading(0, 0, 0)), DBig::ZERO);
        // 2K * 10000 = 0.915527344 -> 10^0.915527344 ~ 8.2321
        let is = to_f64(&intensity(&reading(10000, 10000, 0)));
        let expected = 2.0 * 10f64.powf(0.915_527_344) - 2.0;
        assert!((is - expected).abs() < 1e-9, "{is} vs {expected}");
    }

    #[test]
    fn test_absorbance_is_deterministic() {
        let reference = decimal(3);
        let first = absorbance(12000, 11950, 300, &reference).unwrap();
        let second = absorbance(12000, 11950, 300, &reference).unwrap();
        assert_eq!(first, second);
        assert_eq!(first.to_string(), second.to_string());
    }

    #[test]
    fn test_absorbance_matches_double_precision_estimate() {
        let reference = decimal(20);
        let value = to_f64(&absorbance(10000, 10000, 0, &reference).unwrap());
        let is = 2.0 * 10f64.powf(0.915_527_344) - 2.0;
        assert!((value - (20.0 / is).log10()).abs() < 1e-9);
    }

    #[test]
    fn test_domain_errors() {
        assert!(matches!(
            absorbance(400, 400, 500, &decimal(1)),
            Err(DaqError::Domain(_))
        ));
        assert!(matches!(
            absorbance(9000, 9000, 100, &DBig::ZERO),
            Err(DaqError::Domain(_))
        ));
    }

    #[test]
    fn test_reference_record_zeroes_itself_and_updates_register() {
        let mut register = ChannelRegister::new();
        let readings = [(0, reading(12000, 12000, 0)), (1, reading(8000, 8000, 0))];

        let calibration = apply_record(&mut register, &record("REF_00000_0", &readings)).unwrap();
        assert!(calibration.values[2].is_none());
        for channel in [0, 1] {
            let value = calibration.values[channel].as_ref().unwrap();
            assert!(to_f64(value).abs() < 1e-40);
            assert_eq!(
                *register.get(channel).unwrap().reference(),
                intensity(&readings[channel].1)
            );
        }

        let follow_up = apply_record(&mut register, &record("MEAS_00000_0", &readings)).unwrap();
        for channel in [0, 1] {
            assert!(to_f64(follow_up.values[channel].as_ref().unwrap()).abs() < 1e-40);
        }
    }

    #[test]
    fn test_domain_error_leaves_register_untouched() {
        let mut register = ChannelRegister::new();
        let readings = [(0, reading(12000, 12000, 0)), (1, reading(400, 400, 500))];
        let before = register.references();

        let result = apply_record(&mut register, &record("REF_10000_0", &readings));

        assert!(matches!(result, Err(DaqError::Domain(_))));
        assert_eq!(register.references(), before);
    }
}
