//! Byte level decoders for the two ABB B23 response telegrams.
//!
//! All offsets are fixed constants of the meter firmware's layout, nothing
//! here is derived from length or type fields inside the frame. This is not
//! a general M-Bus record parser and does not try to be one.

use crate::config::EnergyEncoding;
use crate::models::{Measurement, MeasurementSet, Metadata};
use thiserror::Error;

/// Telegram 1 layout: the total energy counter and nothing else.
const T1_ENERGY_TOTAL: usize = 22;
pub const TELEGRAM1_MIN_LEN: usize = 28;

/// Telegram 2 layout.
const T2_SERIAL_NUMBER: usize = 7;
const T2_VERSION: usize = 13;
const T2_ACCESS_NUMBER: usize = 15;
const T2_STATUS: usize = 16;
const T2_ACTIVE_POWER: [usize; 4] = [22, 31, 40, 49];
const T2_VOLTAGE_PHASE: [usize; 3] = [59, 69, 79];
const T2_VOLTAGE_LINE: [usize; 3] = [89, 99, 109];
const T2_CURRENT: [usize; 3] = [119, 129, 139];
const T2_ENERGY_PHASE: [usize; 3] = [171, 182, 193];
/* The BCD firmware appends a frequency field after the L3 counter */
const T2_FREQUENCY: usize = 199;
pub const TELEGRAM2_MIN_LEN: usize = 199;

const ENERGY_FIELD_LEN: usize = 6;

/// Custom error type for telegram decoding
#[derive(Error, Debug)]
pub enum TelegramError {
    #[error("Telegram too short: got {actual} bytes, need {expected}")]
    TooShort { expected: usize, actual: usize },
}

fn check_len(telegram: &[u8], expected: usize) -> Result<(), TelegramError> {
    if telegram.len() < expected {
        return Err(TelegramError::TooShort { expected, actual: telegram.len() });
    }
    return Ok(());
}

fn round_to(value: f64, digits: i32) -> f64 {
    let factor = 10f64.powi(digits);
    return (value * factor).round() / factor;
}

/// Decodes a signed packed BCD field, least significant byte first.
///
/// Two digits per byte, high nibble first within a byte. A high nibble
/// above 9 counts as zero, 0xF in the high nibble of the most significant
/// byte marks the whole value negative. Malformed input decodes best
/// effort, this never errors.
pub fn decode_bcd(field: &[u8]) -> i64 {
    let mut value: i64 = 0;
    let mut negative = false;

    for (idx, byte) in field.iter().enumerate().rev() {
        let mut high = ((byte >> 4) & 0x0F) as i64;
        if high > 9 {
            if high == 0x0F && idx == field.len() - 1 {
                negative = true;
            }
            high = 0;
        }
        value = value * 10 + high;
        value = value * 10 + (byte & 0x0F) as i64;
    }

    if negative {
        return -value;
    }
    return value;
}

/// A 6 byte energy counter, interpreted per the configured firmware
/// encoding. Integer counters carry kWh * 1000, BCD counters kWh * 100.
fn decode_energy(field: &[u8], encoding: EnergyEncoding) -> f64 {
    match encoding {
        EnergyEncoding::Integer => {
            let mut raw = [0u8; 8];
            raw[..ENERGY_FIELD_LEN].copy_from_slice(field);
            return round_to(u64::from_le_bytes(raw) as f64 / 1000.0, 3);
        }
        EnergyEncoding::Bcd => {
            return round_to(decode_bcd(field) as f64 / 100.0, 2);
        }
    }
}

fn decode_i32_le(field: &[u8]) -> i32 {
    return i32::from_le_bytes([field[0], field[1], field[2], field[3]]);
}

/// Decode a telegram 1 from an ABB meter, it carries only the total energy.
pub fn decode_telegram1(telegram: &[u8], encoding: EnergyEncoding) -> Result<MeasurementSet, TelegramError> {
    check_len(telegram, TELEGRAM1_MIN_LEN)?;

    let mut set = MeasurementSet::new();
    let value = decode_energy(&telegram[T1_ENERGY_TOTAL..T1_ENERGY_TOTAL + ENERGY_FIELD_LEN], encoding);
    set.insert(Measurement::new("energy_total", "Energy, total", value));
    return Ok(set);
}

/// Decode a telegram 2 from an ABB meter: device metadata, per phase power,
/// voltage, current and energy, and on the BCD firmware the line frequency.
///
/// The length check runs up front so a short frame never produces a half
/// populated record.
pub fn decode_telegram2(telegram: &[u8], encoding: EnergyEncoding) -> Result<MeasurementSet, TelegramError> {
    let expected = match encoding {
        EnergyEncoding::Integer => TELEGRAM2_MIN_LEN,
        EnergyEncoding::Bcd => T2_FREQUENCY + 2,
    };
    check_len(telegram, expected)?;

    let mut set = MeasurementSet::new();

    set.metadata = Some(Metadata {
        serial_number: hex::encode(&telegram[T2_SERIAL_NUMBER..T2_SERIAL_NUMBER + 4]),
        version: telegram[T2_VERSION],
        access_number: telegram[T2_ACCESS_NUMBER],
        status: telegram[T2_STATUS],
    });

    let power_names = [
        ("active_power_total", "Active power, total"),
        ("active_power_l1", "Active power, L1"),
        ("active_power_l2", "Active power, L2"),
        ("active_power_l3", "Active power, L3"),
    ];
    for (offset, (key, name)) in T2_ACTIVE_POWER.iter().zip(power_names) {
        let value = round_to(decode_i32_le(&telegram[*offset..offset + 4]) as f64 * 0.01, 3);
        set.insert(Measurement::new(key, name, value));
    }

    let voltage_names = [
        ("voltage_l1", "Voltage, L1"),
        ("voltage_l2", "Voltage, L2"),
        ("voltage_l3", "Voltage, L3"),
    ];
    for (offset, (key, name)) in T2_VOLTAGE_PHASE.iter().zip(voltage_names) {
        let value = round_to(decode_i32_le(&telegram[*offset..offset + 4]) as f64 * 0.1, 3);
        set.insert(Measurement::new(key, name, value));
    }

    let line_names = [
        ("voltage_l1_l2", "Voltage, L1-L2"),
        ("voltage_l3_l2", "Voltage, L3-L2"),
        ("voltage_l1_l3", "Voltage, L1-L3"),
    ];
    for (offset, (key, name)) in T2_VOLTAGE_LINE.iter().zip(line_names) {
        let value = round_to(decode_i32_le(&telegram[*offset..offset + 4]) as f64 * 0.1, 3);
        set.insert(Measurement::new(key, name, value));
    }

    let current_names = [
        ("current_l1", "Current, L1"),
        ("current_l2", "Current, L2"),
        ("current_l3", "Current, L3"),
    ];
    for (offset, (key, name)) in T2_CURRENT.iter().zip(current_names) {
        let value = round_to(decode_i32_le(&telegram[*offset..offset + 4]) as f64 * 0.01, 3);
        set.insert(Measurement::new(key, name, value));
    }

    let energy_names = [
        ("energy_l1", "Energy, L1"),
        ("energy_l2", "Energy, L2"),
        ("energy_l3", "Energy, L3"),
    ];
    for (offset, (key, name)) in T2_ENERGY_PHASE.iter().zip(energy_names) {
        let value = decode_energy(&telegram[*offset..offset + ENERGY_FIELD_LEN], encoding);
        set.insert(Measurement::new(key, name, value));
    }

    if encoding == EnergyEncoding::Bcd {
        let value = round_to(decode_bcd(&telegram[T2_FREQUENCY..T2_FREQUENCY + 2]) as f64 / 100.0, 2);
        set.insert(Measurement::with_unit("frequency", "Frequency", value, "Hz"));
    }

    return Ok(set);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bcd_plain_digits() {
        assert_eq!(decode_bcd(&[0x00; 6]), 0);
        assert_eq!(decode_bcd(&[0x01, 0x00, 0x00, 0x00, 0x00, 0x00]), 1);
        assert_eq!(decode_bcd(&[0x56, 0x34, 0x12, 0x00, 0x00, 0x00]), 123456);
        /* digits read most significant byte first */
        assert_eq!(decode_bcd(&[0x34, 0x12]), 1234);
    }

    #[test]
    fn test_bcd_sign_nibble() {
        assert_eq!(decode_bcd(&[0x01, 0x00, 0x00, 0x00, 0x00, 0xF0]), -1);
        assert_eq!(decode_bcd(&[0x99, 0x99, 0x99, 0x00, 0x00, 0xF0]), -999999);
        /* a non decimal high nibble that is not the sign counts as zero */
        assert_eq!(decode_bcd(&[0x05, 0xA0]), 5);
        /* 0xF only negates in the most significant byte */
        assert_eq!(decode_bcd(&[0xF5, 0x00]), 5);
    }

    #[test]
    fn test_telegram1_too_short() {
        let telegram = vec![0u8; TELEGRAM1_MIN_LEN - 1];
        let result = decode_telegram1(&telegram, EnergyEncoding::Integer);
        assert!(matches!(result, Err(TelegramError::TooShort { expected: 28, actual: 27 })));
    }

    #[test]
    fn test_telegram1_integer_value() {
        let mut telegram = vec![0u8; TELEGRAM1_MIN_LEN];
        /* 12345678 * 1/1000 = 12345.678 kWh */
        telegram[22..28].copy_from_slice(&12345678u64.to_le_bytes()[..6]);

        let set = decode_telegram1(&telegram, EnergyEncoding::Integer).unwrap();
        assert_eq!(set.len(), 1);
        let m = set.get("energy_total").unwrap();
        assert_eq!(m.name, "Energy, total");
        assert_eq!(m.value, 12345.678);
    }

    #[test]
    fn test_telegram1_bcd_value() {
        let mut telegram = vec![0u8; TELEGRAM1_MIN_LEN];
        /* BCD 123456 * 1/100 = 1234.56 kWh */
        telegram[22..28].copy_from_slice(&[0x56, 0x34, 0x12, 0x00, 0x00, 0x00]);

        let set = decode_telegram1(&telegram, EnergyEncoding::Bcd).unwrap();
        assert_eq!(set.get("energy_total").unwrap().value, 1234.56);
    }

    #[test]
    fn test_telegram2_too_short_is_atomic() {
        let telegram = vec![0u8; TELEGRAM2_MIN_LEN - 1];
        let result = decode_telegram2(&telegram, EnergyEncoding::Integer);
        assert!(result.is_err());
    }

    #[test]
    fn test_telegram2_bcd_needs_frequency_field() {
        /* long enough for the integer layout but not for the BCD one */
        let telegram = vec![0u8; TELEGRAM2_MIN_LEN];
        assert!(decode_telegram2(&telegram, EnergyEncoding::Integer).is_ok());
        assert!(decode_telegram2(&telegram, EnergyEncoding::Bcd).is_err());
    }

    #[test]
    fn test_telegram2_single_injected_field() {
        let mut telegram = vec![0u8; TELEGRAM2_MIN_LEN];
        /* voltage L2 at offset 69, 2301 * 0.1 = 230.1 V */
        telegram[69..73].copy_from_slice(&2301i32.to_le_bytes());

        let set = decode_telegram2(&telegram, EnergyEncoding::Integer).unwrap();
        assert_eq!(set.len(), 16);
        let nonzero: Vec<_> = set.iter().filter(|m| m.value != 0.0).collect();
        assert_eq!(nonzero.len(), 1);
        assert_eq!(nonzero[0].key, "voltage_l2");
        assert_eq!(nonzero[0].value, 230.1);
    }

    #[test]
    fn test_telegram2_negative_power() {
        let mut telegram = vec![0u8; TELEGRAM2_MIN_LEN];
        /* feeding into the grid shows up as negative power */
        telegram[22..26].copy_from_slice(&(-2345i32).to_le_bytes());

        let set = decode_telegram2(&telegram, EnergyEncoding::Integer).unwrap();
        assert_eq!(set.get("active_power_total").unwrap().value, -23.45);
    }

    #[test]
    fn test_telegram2_metadata() {
        let mut telegram = vec![0u8; TELEGRAM2_MIN_LEN];
        telegram[7..11].copy_from_slice(&[0x0C, 0xAF, 0x32, 0x02]);
        telegram[13] = 32;
        telegram[15] = 7;
        telegram[16] = 0x04;

        let set = decode_telegram2(&telegram, EnergyEncoding::Integer).unwrap();
        let metadata = set.metadata.unwrap();
        assert_eq!(metadata.serial_number, "0caf3202");
        assert_eq!(metadata.version, 32);
        assert_eq!(metadata.access_number, 7);
        assert_eq!(metadata.status, 4);
    }

    #[test]
    fn test_telegram2_frequency_on_bcd_firmware() {
        let mut telegram = vec![0u8; T2_FREQUENCY + 2];
        /* BCD 5002 * 1/100 = 50.02 Hz */
        telegram[199..201].copy_from_slice(&[0x02, 0x50]);

        let set = decode_telegram2(&telegram, EnergyEncoding::Bcd).unwrap();
        let m = set.get("frequency").unwrap();
        assert_eq!(m.value, 50.02);
        assert_eq!(m.unit.as_deref(), Some("Hz"));

        /* the integer firmware has no frequency field */
        let set = decode_telegram2(&telegram, EnergyEncoding::Integer).unwrap();
        assert!(set.get("frequency").is_none());
    }

    #[test]
    fn test_telegram2_phase_energy_encodings() {
        let mut telegram = vec![0u8; T2_FREQUENCY + 2];
        telegram[171..177].copy_from_slice(&4200u64.to_le_bytes()[..6]);

        let set = decode_telegram2(&telegram, EnergyEncoding::Integer).unwrap();
        assert_eq!(set.get("energy_l1").unwrap().value, 4.2);

        /* the same bytes read as BCD: 0x1068 -> high nibbles 1,6 low 0,8 */
        telegram[171..177].copy_from_slice(&[0x68, 0x10, 0x00, 0x00, 0x00, 0x00]);
        let set = decode_telegram2(&telegram, EnergyEncoding::Bcd).unwrap();
        assert_eq!(set.get("energy_l1").unwrap().value, 10.68);
    }
}
