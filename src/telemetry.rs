//! Decoders for the two telemetry characteristics the bridge consumes:
//! FTMS Indoor Bike Data (0x2AD2) and Heart Rate Measurement (0x2A37).
//!
//! Both formats start with a flags field that decides which optional fields
//! follow. The decoders compute the packet length the flags imply before
//! reading anything, so a short or padded packet is rejected as a whole and
//! reading can never run past the end of the buffer.

use crate::error::DecodeError;
use bytes::Buf;
use std::fmt;
use tracing::trace;

/// Indoor Bike Data flag bits 13-15 are reserved
const INDOOR_BIKE_RESERVED: u16 = 0xE000;

/// Heart Rate Measurement flag bits 5-7 are reserved
const HEART_RATE_RESERVED: u8 = 0xE0;

/// Width in bytes of each optional Indoor Bike Data field, indexed by flag bit
///
/// Bit 0 gates instantaneous speed with inverted polarity.
const INDOOR_BIKE_WIDTHS: [usize; 13] = [2, 2, 2, 2, 3, 2, 2, 2, 5, 1, 1, 2, 2];

/// A named telemetry value that can be published
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TelemetryField {
    /// Instantaneous speed
    Speed,
    /// Average speed
    AverageSpeed,
    /// Instantaneous cadence
    Cadence,
    /// Average cadence
    AverageCadence,
    /// Total distance
    TotalDistance,
    /// Trainer resistance level
    ResistanceLevel,
    /// Instantaneous power
    Power,
    /// Average power
    AveragePower,
    /// Total expended energy
    TotalEnergy,
    /// Expended energy per hour
    EnergyPerHour,
    /// Expended energy per minute
    EnergyPerMinute,
    /// Heart rate relayed by the trainer
    TrainerHeartRate,
    /// Metabolic equivalent
    MetabolicEquivalent,
    /// Elapsed workout time
    ElapsedTime,
    /// Remaining workout time
    RemainingTime,
    /// Heart rate from the strap
    HeartRate,
}

impl TelemetryField {
    /// Topic segment the field is published under
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Speed => "speed",
            Self::AverageSpeed => "average_speed",
            Self::Cadence => "cadence",
            Self::AverageCadence => "average_cadence",
            Self::TotalDistance => "distance",
            Self::ResistanceLevel => "resistance_level",
            Self::Power => "power",
            Self::AveragePower => "average_power",
            Self::TotalEnergy => "energy_total",
            Self::EnergyPerHour => "energy_per_hour",
            Self::EnergyPerMinute => "energy_per_minute",
            Self::TrainerHeartRate => "trainer_heartrate",
            Self::MetabolicEquivalent => "metabolic_equivalent",
            Self::ElapsedTime => "elapsed_time",
            Self::RemainingTime => "remaining_time",
            Self::HeartRate => "heartrate",
        }
    }

    /// Unit name reported alongside the value
    #[must_use]
    pub const fn unit_name(self) -> &'static str {
        match self {
            Self::Speed | Self::AverageSpeed => "m/s",
            Self::Cadence | Self::AverageCadence => "rpm",
            Self::TotalDistance => "m",
            Self::ResistanceLevel => "level",
            Self::Power | Self::AveragePower => "W",
            Self::TotalEnergy => "kcal",
            Self::EnergyPerHour => "kcal/h",
            Self::EnergyPerMinute => "kcal/min",
            Self::TrainerHeartRate | Self::HeartRate => "BPM",
            Self::MetabolicEquivalent => "MET",
            Self::ElapsedTime | Self::RemainingTime => "s",
        }
    }
}

impl fmt::Display for TelemetryField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// One decoded Indoor Bike Data packet
///
/// Every field is `None` unless its flag bit announced it.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct IndoorBikeData {
    /// Raw flags field
    pub flags: u16,
    /// Instantaneous speed in m/s
    pub instantaneous_speed: Option<f64>,
    /// Average speed in m/s
    pub average_speed: Option<f64>,
    /// Instantaneous cadence in rpm
    pub instantaneous_cadence: Option<f64>,
    /// Average cadence in rpm
    pub average_cadence: Option<f64>,
    /// Total distance in meters
    pub total_distance: Option<u32>,
    /// Resistance level
    pub resistance_level: Option<u16>,
    /// Instantaneous power in watts
    pub instantaneous_power: Option<i16>,
    /// Average power in watts
    pub average_power: Option<i16>,
    /// Total energy in kcal
    pub total_energy: Option<u16>,
    /// Energy rate in kcal per hour
    pub energy_per_hour: Option<u16>,
    /// Energy rate in kcal per minute
    pub energy_per_minute: Option<u8>,
    /// Heart rate in BPM
    pub heart_rate: Option<u8>,
    /// Metabolic equivalent
    pub metabolic_equivalent: Option<f64>,
    /// Elapsed time in seconds
    pub elapsed_time: Option<u16>,
    /// Remaining time in seconds
    pub remaining_time: Option<u16>,
}

impl IndoorBikeData {
    /// Present fields with their values, in wire order
    #[must_use]
    pub fn fields(&self) -> Vec<(TelemetryField, f64)> {
        [
            (TelemetryField::Speed, self.instantaneous_speed),
            (TelemetryField::AverageSpeed, self.average_speed),
            (TelemetryField::Cadence, self.instantaneous_cadence),
            (TelemetryField::AverageCadence, self.average_cadence),
            (TelemetryField::TotalDistance, self.total_distance.map(f64::from)),
            (TelemetryField::ResistanceLevel, self.resistance_level.map(f64::from)),
            (TelemetryField::Power, self.instantaneous_power.map(f64::from)),
            (TelemetryField::AveragePower, self.average_power.map(f64::from)),
            (TelemetryField::TotalEnergy, self.total_energy.map(f64::from)),
            (TelemetryField::EnergyPerHour, self.energy_per_hour.map(f64::from)),
            (TelemetryField::EnergyPerMinute, self.energy_per_minute.map(f64::from)),
            (TelemetryField::TrainerHeartRate, self.heart_rate.map(f64::from)),
            (TelemetryField::MetabolicEquivalent, self.metabolic_equivalent),
            (TelemetryField::ElapsedTime, self.elapsed_time.map(f64::from)),
            (TelemetryField::RemainingTime, self.remaining_time.map(f64::from)),
        ]
        .into_iter()
        .filter_map(|(field, value)| value.map(|v| (field, v)))
        .collect()
    }

    /// True when the rider is neither pedalling nor moving
    ///
    /// An absent speed or cadence counts as zero.
    #[must_use]
    pub fn is_idle(&self) -> bool {
        self.instantaneous_speed.unwrap_or(0.0) == 0.0
            && self.instantaneous_cadence.unwrap_or(0.0) == 0.0
    }
}

/// Packet length implied by an Indoor Bike Data flags field
#[must_use]
pub fn indoor_bike_data_len(flags: u16) -> usize {
    INDOOR_BIKE_WIDTHS
        .iter()
        .enumerate()
        .filter(|(bit, _)| {
            let set = flags & (1 << bit) != 0;
            if *bit == 0 {
                !set
            } else {
                set
            }
        })
        .map(|(_, width)| width)
        .sum::<usize>()
        + 2
}

fn speed_from_raw(raw: u16) -> f64 {
    f64::from(raw) / 100.0 * 5.0 / 18.0
}

fn cadence_from_raw(raw: u16) -> f64 {
    f64::from(raw) / 10.0
}

/// Decode an Indoor Bike Data notification
///
/// Speeds arrive in 0.01 km/h and are converted to m/s. Cadence uses the
/// 0.1 rpm encoding the KICKR actually sends. Energy sub-fields carrying the
/// "not available" sentinel decode as `None`.
pub fn decode_indoor_bike_data(data: &[u8]) -> Result<IndoorBikeData, DecodeError> {
    if data.len() < 2 {
        return Err(DecodeError::MalformedLength {
            expected: 2,
            actual: data.len(),
        });
    }

    let mut buf = data;
    let flags = buf.get_u16_le();

    if flags & INDOOR_BIKE_RESERVED != 0 {
        return Err(DecodeError::MalformedFlags { flags });
    }

    let expected = indoor_bike_data_len(flags);
    if expected != data.len() {
        return Err(DecodeError::MalformedLength {
            expected,
            actual: data.len(),
        });
    }

    let present = |bit: u16| flags & (1 << bit) != 0;
    let mut sample = IndoorBikeData {
        flags,
        ..IndoorBikeData::default()
    };

    if !present(0) {
        sample.instantaneous_speed = Some(speed_from_raw(buf.get_u16_le()));
    }
    if present(1) {
        sample.average_speed = Some(speed_from_raw(buf.get_u16_le()));
    }
    if present(2) {
        sample.instantaneous_cadence = Some(cadence_from_raw(buf.get_u16_le()));
    }
    if present(3) {
        sample.average_cadence = Some(cadence_from_raw(buf.get_u16_le()));
    }
    if present(4) {
        #[allow(clippy::cast_possible_truncation)]
        let distance = buf.get_uint_le(3) as u32;
        sample.total_distance = Some(distance);
    }
    if present(5) {
        sample.resistance_level = Some(buf.get_u16_le());
    }
    if present(6) {
        sample.instantaneous_power = Some(buf.get_i16_le());
    }
    if present(7) {
        sample.average_power = Some(buf.get_i16_le());
    }
    if present(8) {
        sample.total_energy = Some(buf.get_u16_le()).filter(|v| *v != 0xFFFF);
        sample.energy_per_hour = Some(buf.get_u16_le()).filter(|v| *v != 0xFFFF);
        sample.energy_per_minute = Some(buf.get_u8()).filter(|v| *v != 0xFF);
    }
    if present(9) {
        sample.heart_rate = Some(buf.get_u8());
    }
    if present(10) {
        sample.metabolic_equivalent = Some(f64::from(buf.get_u8()) / 10.0);
    }
    if present(11) {
        sample.elapsed_time = Some(buf.get_u16_le());
    }
    if present(12) {
        sample.remaining_time = Some(buf.get_u16_le());
    }

    debug_assert!(!buf.has_remaining());

    for (field, value) in sample.fields() {
        trace!("{}: {} {}", field, value, field.unit_name());
    }

    Ok(sample)
}

/// Skin contact reported by a heart-rate strap
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SensorContact {
    /// Contact supported but not detected
    NotDetected,
    /// Contact detected
    Detected,
}

/// One decoded Heart Rate Measurement notification
#[derive(Debug, Clone, PartialEq)]
pub struct HeartRateMeasurement {
    /// Raw flags byte
    pub flags: u8,
    /// Heart rate in BPM
    pub heart_rate: u16,
    /// Contact status, `None` when the strap does not report it
    pub sensor_contact: Option<SensorContact>,
    /// Energy expended in kJ
    pub energy_expended: Option<u16>,
    /// RR intervals in seconds, oldest first
    pub rr_intervals: Vec<f64>,
}

impl HeartRateMeasurement {
    /// Present fields with their values
    #[must_use]
    pub fn fields(&self) -> Vec<(TelemetryField, f64)> {
        vec![(TelemetryField::HeartRate, f64::from(self.heart_rate))]
    }
}

/// Decode a Heart Rate Measurement notification
///
/// A zero heart rate decodes successfully; what to do about a run of them is
/// up to the session.
pub fn decode_heart_rate(data: &[u8]) -> Result<HeartRateMeasurement, DecodeError> {
    if data.is_empty() {
        return Err(DecodeError::MalformedLength {
            expected: 2,
            actual: 0,
        });
    }

    let mut buf = data;
    let flags = buf.get_u8();

    if flags & HEART_RATE_RESERVED != 0 {
        return Err(DecodeError::MalformedFlags {
            flags: u16::from(flags),
        });
    }

    let wide = flags & 0x01 != 0;
    let has_energy = flags & 0x08 != 0;
    let has_rr = flags & 0x10 != 0;

    let fixed = 1 + if wide { 2 } else { 1 } + if has_energy { 2 } else { 0 };
    let rr_bytes = data.len().saturating_sub(fixed);
    if data.len() < fixed || (has_rr && rr_bytes % 2 != 0) || (!has_rr && rr_bytes != 0) {
        return Err(DecodeError::MalformedLength {
            expected: fixed + if has_rr { rr_bytes & !1 } else { 0 },
            actual: data.len(),
        });
    }

    let heart_rate = if wide {
        buf.get_u16_le()
    } else {
        u16::from(buf.get_u8())
    };

    let sensor_contact = match (flags >> 1) & 0x03 {
        2 => Some(SensorContact::NotDetected),
        3 => Some(SensorContact::Detected),
        _ => None,
    };

    let energy_expended = has_energy.then(|| buf.get_u16_le());

    let mut rr_intervals = Vec::with_capacity(rr_bytes / 2);
    while buf.remaining() >= 2 {
        rr_intervals.push(f64::from(buf.get_u16_le()) / 1024.0);
    }

    trace!(
        "Heart rate: {} BPM, contact {:?}, {} RR intervals",
        heart_rate,
        sensor_contact,
        rr_intervals.len()
    );

    Ok(HeartRateMeasurement {
        flags,
        heart_rate,
        sensor_contact,
        energy_expended,
        rr_intervals,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BufMut;

    /// Build an Indoor Bike Data packet for `flags` with every field set to a
    /// recognisable value.
    fn indoor_bike_packet(flags: u16) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.put_u16_le(flags);
        let present = |bit: u16| flags & (1 << bit) != 0;

        if !present(0) {
            buf.put_u16_le(3600);
        }
        if present(1) {
            buf.put_u16_le(1800);
        }
        if present(2) {
            buf.put_u16_le(900);
        }
        if present(3) {
            buf.put_u16_le(850);
        }
        if present(4) {
            buf.put_uint_le(70_000, 3);
        }
        if present(5) {
            buf.put_u16_le(12);
        }
        if present(6) {
            buf.put_i16_le(250);
        }
        if present(7) {
            buf.put_i16_le(-5);
        }
        if present(8) {
            buf.put_u16_le(120);
            buf.put_u16_le(0xFFFF);
            buf.put_u8(9);
        }
        if present(9) {
            buf.put_u8(142);
        }
        if present(10) {
            buf.put_u8(85);
        }
        if present(11) {
            buf.put_u16_le(600);
        }
        if present(12) {
            buf.put_u16_le(1200);
        }
        buf
    }

    #[test]
    fn test_every_flag_subset_decodes_to_exact_length() {
        for flags in 0u16..0x2000 {
            let packet = indoor_bike_packet(flags);
            assert_eq!(packet.len(), indoor_bike_data_len(flags), "flags {flags:#06x}");
            let present = |bit: u16| flags & (1 << bit) != 0;

            // Fields keep their values whichever fields precede them
            let sample = decode_indoor_bike_data(&packet).unwrap();
            assert_eq!(sample.flags, flags);
            assert_eq!(sample.instantaneous_speed, (!present(0)).then_some(10.0), "flags {flags:#06x}");
            assert_eq!(sample.average_speed, present(1).then_some(5.0), "flags {flags:#06x}");
            assert_eq!(sample.instantaneous_cadence, present(2).then_some(90.0), "flags {flags:#06x}");
            assert_eq!(sample.average_cadence, present(3).then_some(85.0), "flags {flags:#06x}");
            assert_eq!(sample.total_distance, present(4).then_some(70_000), "flags {flags:#06x}");
            assert_eq!(sample.resistance_level, present(5).then_some(12), "flags {flags:#06x}");
            assert_eq!(sample.instantaneous_power, present(6).then_some(250), "flags {flags:#06x}");
            assert_eq!(sample.average_power, present(7).then_some(-5), "flags {flags:#06x}");
            assert_eq!(sample.total_energy, present(8).then_some(120), "flags {flags:#06x}");
            assert_eq!(sample.energy_per_hour, None, "flags {flags:#06x}");
            assert_eq!(sample.energy_per_minute, present(8).then_some(9), "flags {flags:#06x}");
            assert_eq!(sample.heart_rate, present(9).then_some(142), "flags {flags:#06x}");
            assert_eq!(sample.metabolic_equivalent, present(10).then_some(8.5), "flags {flags:#06x}");
            assert_eq!(sample.elapsed_time, present(11).then_some(600), "flags {flags:#06x}");
            assert_eq!(sample.remaining_time, present(12).then_some(1200), "flags {flags:#06x}");

            let mut short = packet.clone();
            short.pop();
            assert!(decode_indoor_bike_data(&short).is_err());

            let mut long = packet;
            long.push(0);
            assert!(decode_indoor_bike_data(&long).is_err());
        }
    }

    #[test]
    fn test_field_values() {
        let packet = indoor_bike_packet(0x1FFE);
        let sample = decode_indoor_bike_data(&packet).unwrap();

        assert_eq!(sample.instantaneous_speed, Some(10.0));
        assert_eq!(sample.average_speed, Some(5.0));
        assert_eq!(sample.instantaneous_cadence, Some(90.0));
        assert_eq!(sample.average_cadence, Some(85.0));
        assert_eq!(sample.total_distance, Some(70_000));
        assert_eq!(sample.resistance_level, Some(12));
        assert_eq!(sample.instantaneous_power, Some(250));
        assert_eq!(sample.average_power, Some(-5));
        assert_eq!(sample.total_energy, Some(120));
        assert_eq!(sample.energy_per_hour, None);
        assert_eq!(sample.energy_per_minute, Some(9));
        assert_eq!(sample.heart_rate, Some(142));
        assert_eq!(sample.metabolic_equivalent, Some(8.5));
        assert_eq!(sample.elapsed_time, Some(600));
        assert_eq!(sample.remaining_time, Some(1200));
    }

    #[test]
    fn test_speed_and_cadence_fields() {
        let sample = decode_indoor_bike_data(&[0x04, 0x00, 0x10, 0x0E, 0x84, 0x03]).unwrap();
        let fields = sample.fields();

        assert_eq!(
            fields,
            vec![(TelemetryField::Speed, 10.0), (TelemetryField::Cadence, 90.0)]
        );
        assert!(!sample.is_idle());
    }

    #[test]
    fn test_idle_sample() {
        let sample = decode_indoor_bike_data(&[0x04, 0x00, 0x00, 0x00, 0x00, 0x00]).unwrap();
        assert!(sample.is_idle());
    }

    #[test]
    fn test_malformed_length() {
        assert_eq!(
            decode_indoor_bike_data(&[0x04]),
            Err(DecodeError::MalformedLength {
                expected: 2,
                actual: 1
            })
        );
        assert_eq!(
            decode_indoor_bike_data(&[0x04, 0x00, 0x10, 0x0E, 0x84]),
            Err(DecodeError::MalformedLength {
                expected: 6,
                actual: 5
            })
        );
    }

    #[test]
    fn test_reserved_flags_rejected() {
        assert_eq!(
            decode_indoor_bike_data(&[0x01, 0x20]),
            Err(DecodeError::MalformedFlags { flags: 0x2001 })
        );
        assert!(matches!(
            decode_heart_rate(&[0x80, 70]),
            Err(DecodeError::MalformedFlags { flags: 0x80 })
        ));
    }

    #[test]
    fn test_heart_rate_u8() {
        let measurement = decode_heart_rate(&[0x06, 72]).unwrap();
        assert_eq!(measurement.heart_rate, 72);
        assert_eq!(measurement.sensor_contact, Some(SensorContact::Detected));
        assert_eq!(measurement.energy_expended, None);
        assert!(measurement.rr_intervals.is_empty());
    }

    #[test]
    fn test_heart_rate_u16_with_energy_and_rr() {
        let measurement =
            decode_heart_rate(&[0x1D, 0x2C, 0x01, 0x10, 0x00, 0x00, 0x04, 0x00, 0x02]).unwrap();
        assert_eq!(measurement.heart_rate, 300);
        assert_eq!(measurement.sensor_contact, Some(SensorContact::NotDetected));
        assert_eq!(measurement.energy_expended, Some(16));
        assert_eq!(measurement.rr_intervals, vec![1.0, 0.5]);
    }

    #[test]
    fn test_heart_rate_contact_unknown() {
        let measurement = decode_heart_rate(&[0x02, 60]).unwrap();
        assert_eq!(measurement.sensor_contact, None);
    }

    #[test]
    fn test_heart_rate_malformed_length() {
        assert!(matches!(
            decode_heart_rate(&[]),
            Err(DecodeError::MalformedLength { .. })
        ));
        assert!(matches!(
            decode_heart_rate(&[0x01, 0x48]),
            Err(DecodeError::MalformedLength { .. })
        ));
        assert!(matches!(
            decode_heart_rate(&[0x10, 0x48, 0x00]),
            Err(DecodeError::MalformedLength { .. })
        ));
        assert!(matches!(
            decode_heart_rate(&[0x00, 0x48, 0x00]),
            Err(DecodeError::MalformedLength { .. })
        ));
    }

    #[test]
    fn test_zero_heart_rate_is_not_an_error() {
        let measurement = decode_heart_rate(&[0x00, 0x00]).unwrap();
        assert_eq!(measurement.heart_rate, 0);
    }
}
