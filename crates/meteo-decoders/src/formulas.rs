//! Shared contractual formulas copied verbatim from the sensors'
//! manufacturer tables, factored out because more than one decoder uses
//! them.

/// Rain-tick-counter wraparound: ticks are a cumulative counter modulo
/// `2^n`; if the counter has wrapped since the last reading, the ticks
/// consumed is `(modulus - previous + current)`, not a negative delta.
pub fn rain_wrap_ticks(current: u32, previous: u32, modulus: u32) -> u32 {
    if current >= previous {
        current - previous
    } else {
        modulus - previous + current
    }
}

/// NTC thermistor conversion used by the Dragino 6470 soil-probe: derives
/// the Steinhart-Hart log term from the ADC reading against a known
/// reference resistance, then applies the probe's fitted polynomial.
/// This is contractual output copied verbatim from the manufacturer's
/// calibration table.
pub fn parse_ntc(adc0: f64, battery_adc: f64, reference_resistance: f64) -> f64 {
    let lr0 = (adc0 * reference_resistance / (battery_adc - adc0)).ln();
    -273.15 + 1.0 / (1.140e-3 + 2.320e-4 * lr0 + 9.860e-8 * lr0.powi(3))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rain_wrap_without_overflow() {
        assert_eq!(rain_wrap_ticks(30, 10, 4096), 20);
    }

    #[test]
    fn rain_wrap_with_overflow() {
        // S4: previous 0xFFFF00, current 0x000010, modulus 0x1000000
        let ticks = rain_wrap_ticks(0x000010, 0xFFFF00, 0x1000000);
        assert_eq!(ticks, 0x110);
    }
}
