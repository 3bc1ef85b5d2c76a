use crate::{error::ValidationError, types::Parameter};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::{fmt, time::SystemTime};
use tracing::debug;

/// Lowest Climb incline in percent grade
pub const INCLINE_MIN: f64 = -10.0;

/// Highest Climb incline in percent grade
pub const INCLINE_MAX: f64 = 19.0;

/// Climb incline step in percent grade
pub const INCLINE_RESOLUTION: f64 = 0.5;

/// Lowest trainer resistance level
pub const RESISTANCE_MIN: f64 = 0.0;

/// Highest trainer resistance level
pub const RESISTANCE_MAX: f64 = 100.0;

/// Lowest Headwind speed in percent
pub const FAN_MIN: f64 = 0.0;

/// Highest Headwind speed in percent
pub const FAN_MAX: f64 = 100.0;

/// Headwind speed step in percent
pub const FAN_RESOLUTION: f64 = 1.0;

/// FTMS Request Control, written once the control point is discovered
pub const REQUEST_CONTROL: [u8; 1] = [OpCode::RequestControl as u8];

/// Unlock sequence written to the Headwind auxiliary characteristic
pub const HEADWIND_UNLOCK: [u8; 3] = [0x20, 0xEE, 0xFC];

/// Switches the Headwind into manual speed mode
pub const HEADWIND_START: [u8; 2] = [0x04, 0x04];

/// First byte of every FTMS control point indication
pub const FTMS_RESPONSE_CODE: u8 = 0x80;

/// Op codes written to the control characteristics
///
/// FTMS op codes go to the Fitness Machine Control Point; the incline and fan
/// op codes are Wahoo-specific and go to the Climb and Headwind
/// characteristics respectively.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum OpCode {
    /// FTMS Request Control, required before any other FTMS command
    RequestControl = 0x00,
    /// Headwind set fan speed
    SetFanSpeed = 0x02,
    /// FTMS Set Target Resistance Level
    SetTargetResistanceLevel = 0x04,
    /// Climb set incline
    SetIncline = 0x66,
}

impl OpCode {
    /// Convert from u8
    #[must_use]
    pub const fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x00 => Some(Self::RequestControl),
            0x02 => Some(Self::SetFanSpeed),
            0x04 => Some(Self::SetTargetResistanceLevel),
            0x66 => Some(Self::SetIncline),
            _ => None,
        }
    }

    /// Op code used to command `parameter`
    #[must_use]
    pub const fn for_parameter(parameter: Parameter) -> Self {
        match parameter {
            Parameter::Incline => Self::SetIncline,
            Parameter::Resistance => Self::SetTargetResistanceLevel,
            Parameter::Fan => Self::SetFanSpeed,
        }
    }
}

/// FTMS control point result codes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultCode {
    /// Request accepted
    Success,
    /// Op code not supported by the machine
    NotSupported,
    /// Parameter outside the supported range
    InvalidParameter,
    /// Machine could not execute the request
    OperationFailed,
    /// Control has not been granted to this client
    ControlNotPermitted,
    /// Code outside the assigned range
    Unknown(u8),
}

impl From<u8> for ResultCode {
    fn from(value: u8) -> Self {
        match value {
            0x01 => Self::Success,
            0x02 => Self::NotSupported,
            0x03 => Self::InvalidParameter,
            0x04 => Self::OperationFailed,
            0x05 => Self::ControlNotPermitted,
            other => Self::Unknown(other),
        }
    }
}

impl fmt::Display for ResultCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Success => write!(f, "Success"),
            Self::NotSupported => write!(f, "Op Code Not Supported"),
            Self::InvalidParameter => write!(f, "Invalid Parameter"),
            Self::OperationFailed => write!(f, "Operation Failed"),
            Self::ControlNotPermitted => write!(f, "Control Not Permitted"),
            Self::Unknown(code) => write!(f, "Unknown ({code:#04x})"),
        }
    }
}

/// An FTMS control point indication
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControlPointResponse {
    /// Op code of the request being answered
    pub request: u8,
    /// How the machine handled it
    pub result: ResultCode,
}

/// Parse an FTMS control point indication (`0x80 <op code> <result>`)
///
/// Returns `None` for anything that is not a response frame.
#[must_use]
pub fn parse_control_point_response(data: &[u8]) -> Option<ControlPointResponse> {
    if data.len() < 3 {
        return None;
    }

    let mut buf = data;
    if buf.get_u8() != FTMS_RESPONSE_CODE {
        return None;
    }

    Some(ControlPointResponse {
        request: buf.get_u8(),
        result: ResultCode::from(buf.get_u8()),
    })
}

/// Accepted range for a parameter
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Limits {
    /// Inclusive lower bound
    pub min: f64,
    /// Inclusive upper bound
    pub max: f64,
    /// Required step, if any
    pub resolution: Option<f64>,
}

impl Limits {
    /// Limits enforced for `parameter`
    ///
    /// Resistance is checked for range only; the fractional part is dropped
    /// when the command is encoded.
    #[must_use]
    pub const fn for_parameter(parameter: Parameter) -> Self {
        match parameter {
            Parameter::Incline => Self {
                min: INCLINE_MIN,
                max: INCLINE_MAX,
                resolution: Some(INCLINE_RESOLUTION),
            },
            Parameter::Resistance => Self {
                min: RESISTANCE_MIN,
                max: RESISTANCE_MAX,
                resolution: None,
            },
            Parameter::Fan => Self {
                min: FAN_MIN,
                max: FAN_MAX,
                resolution: Some(FAN_RESOLUTION),
            },
        }
    }

    fn accepts(&self, value: f64) -> bool {
        if !value.is_finite() || value < self.min || value > self.max {
            return false;
        }
        self.resolution.map_or(true, |step| {
            let steps = (value - self.min) / step;
            (steps - steps.round()).abs() < 1e-9
        })
    }
}

/// Check `value` against the limits of `parameter`
pub fn validate(parameter: Parameter, value: f64) -> Result<(), ValidationError> {
    let limits = Limits::for_parameter(parameter);
    if limits.accepts(value) {
        Ok(())
    } else {
        Err(ValidationError {
            parameter,
            value,
            min: limits.min,
            max: limits.max,
            resolution: limits.resolution,
        })
    }
}

/// A validated command, ready to be written by a control channel
///
/// The only way to obtain one is [`Command::new`], so an out-of-range value
/// can never reach the wire.
#[derive(Debug, Clone, PartialEq)]
pub struct Command {
    parameter: Parameter,
    value: f64,
    timestamp: SystemTime,
}

impl Command {
    /// Validate `value` and wrap it as a command for `parameter`
    pub fn new(parameter: Parameter, value: f64) -> Result<Self, ValidationError> {
        validate(parameter, value)?;
        Ok(Self {
            parameter,
            value,
            timestamp: SystemTime::now(),
        })
    }

    /// Target parameter
    #[must_use]
    pub const fn parameter(&self) -> Parameter {
        self.parameter
    }

    /// Human-facing value
    #[must_use]
    pub const fn value(&self) -> f64 {
        self.value
    }

    /// When the command was validated
    #[must_use]
    pub const fn timestamp(&self) -> SystemTime {
        self.timestamp
    }

    /// Serialize to the bytes written to the control characteristic
    ///
    /// - incline: `0x66` + i16 LE of value × 100
    /// - resistance: `0x04` + u8 level, fraction truncated
    /// - fan: `0x02` + u8 percent
    #[must_use]
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(3);
        buf.put_u8(OpCode::for_parameter(self.parameter) as u8);

        match self.parameter {
            Parameter::Incline => buf.put_i16_le((self.value * 100.0).round() as i16),
            Parameter::Resistance => {
                let level = self.value.trunc();
                if (self.value - level).abs() > f64::EPSILON {
                    debug!(
                        "Resistance {} truncated to level {} on the wire",
                        self.value, level
                    );
                }
                buf.put_u8(level as u8);
            }
            Parameter::Fan => buf.put_u8(self.value.round() as u8),
        }

        buf.freeze()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_incline_boundaries() {
        assert!(Command::new(Parameter::Incline, INCLINE_MIN).is_ok());
        assert!(Command::new(Parameter::Incline, INCLINE_MAX).is_ok());
        assert!(Command::new(Parameter::Incline, 2.5).is_ok());

        let error = Command::new(Parameter::Incline, INCLINE_MIN + 0.3).unwrap_err();
        assert_eq!(error.parameter, Parameter::Incline);
        assert_eq!(error.resolution, Some(INCLINE_RESOLUTION));

        assert!(Command::new(Parameter::Incline, 19.5).is_err());
        assert!(Command::new(Parameter::Incline, -10.5).is_err());
    }

    #[test]
    fn test_non_finite_values_rejected() {
        for parameter in Parameter::ALL {
            assert!(Command::new(parameter, f64::NAN).is_err());
            assert!(Command::new(parameter, f64::INFINITY).is_err());
            assert!(Command::new(parameter, f64::NEG_INFINITY).is_err());
        }
    }

    #[test]
    fn test_incline_encoding() {
        let bytes = Command::new(Parameter::Incline, 5.5).unwrap().encode();
        assert_eq!(&bytes[..], &[0x66, 0x26, 0x02]);

        let bytes = Command::new(Parameter::Incline, -10.0).unwrap().encode();
        assert_eq!(&bytes[..], &[0x66, 0x18, 0xFC]);
    }

    #[test]
    fn test_resistance_encoding_truncates() {
        let bytes = Command::new(Parameter::Resistance, 42.9).unwrap().encode();
        assert_eq!(&bytes[..], &[0x04, 42]);

        assert!(Command::new(Parameter::Resistance, 100.0).is_ok());
        assert!(Command::new(Parameter::Resistance, 100.5).is_err());
        assert!(Command::new(Parameter::Resistance, -0.1).is_err());
    }

    #[test]
    fn test_fan_encoding() {
        let bytes = Command::new(Parameter::Fan, 75.0).unwrap().encode();
        assert_eq!(&bytes[..], &[0x02, 75]);

        assert!(Command::new(Parameter::Fan, 50.5).is_err());
        assert!(Command::new(Parameter::Fan, 101.0).is_err());
    }

    #[test]
    fn test_init_payloads() {
        assert_eq!(REQUEST_CONTROL, [0x00]);
        assert_eq!(HEADWIND_UNLOCK, [0x20, 0xEE, 0xFC]);
        assert_eq!(HEADWIND_START, [0x04, 0x04]);
    }

    #[test]
    fn test_control_point_response() {
        let response = parse_control_point_response(&[0x80, 0x04, 0x01]).unwrap();
        assert_eq!(response.request, OpCode::SetTargetResistanceLevel as u8);
        assert_eq!(response.result, ResultCode::Success);

        let response = parse_control_point_response(&[0x80, 0x00, 0x05]).unwrap();
        assert_eq!(response.result, ResultCode::ControlNotPermitted);

        assert!(parse_control_point_response(&[0x80, 0x04]).is_none());
        assert!(parse_control_point_response(&[0x04, 0x04, 0x01]).is_none());
    }

    #[test]
    fn test_opcode_from_u8() {
        assert_eq!(OpCode::from_u8(0x66), Some(OpCode::SetIncline));
        assert_eq!(OpCode::from_u8(0x00), Some(OpCode::RequestControl));
        assert_eq!(OpCode::from_u8(0x99), None);
    }
}
