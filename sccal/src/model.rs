//! Host-side representations of the values the firmware stores.

use std::fmt::{self, Display};

/// The amount of Bezier models every device stores.
pub const MODEL_COUNT: usize = 5;

/// The amount of control points of every Bezier model.
pub const MODEL_POINTS: usize = 6;

/// The largest raw value an axis reports.
pub const AXIS_RAW_MAX: u16 = u16::MAX;

/// The firmware version reported by a device.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct FirmwareVersion {
    pub major: u16,
    pub minor: u16,
    pub revision: u16,
}

impl Display for FirmwareVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.revision)
    }
}

/// The live state of a single axis as reported by the firmware.
#[derive(Clone, Copy, PartialEq, Debug)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct AxisState {
    /// Whether the axis is reported to the host as a joystick axis.
    pub enabled: bool,

    /// The index of the Bezier model applied to the axis, or `-1` if the
    /// response is linear.
    pub curve_index: i8,

    /// The raw input value mapped to 0% output.
    pub range_min: u16,

    /// The raw input value mapped to 100% output.
    pub range_max: u16,

    /// The current raw sensor reading.
    pub input: u16,

    /// The current raw output value after calibration.
    pub output: u16,

    /// The deadzone in percent.
    pub deadzone: u8,

    /// The output limit in percent.
    pub limit: u8,

    /// [`Self::input`] normalized to `0.0..=1.0`.
    pub input_fraction: f32,

    /// [`Self::output`] normalized to `0.0..=1.0`.
    pub output_fraction: f32,
}

impl AxisState {
    /// Recomputes the normalized fractions from the raw values.
    pub fn with_fractions(mut self) -> Self {
        self.input_fraction = f32::from(self.input) / f32::from(AXIS_RAW_MAX);
        self.output_fraction = f32::from(self.output) / f32::from(AXIS_RAW_MAX);
        self
    }
}

impl Default for AxisState {
    fn default() -> Self {
        Self {
            enabled: false,
            curve_index: -1,
            range_min: 0,
            range_max: AXIS_RAW_MAX,
            input: 0,
            output: 0,
            deadzone: 0,
            limit: 100,
            input_fraction: 0.0,
            output_fraction: 0.0,
        }
    }
}

/// The calibration parameters of a single axis.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct AxisRange {
    pub min: u16,
    pub max: u16,
    pub deadzone: u8,
    pub limit: u8,
}

impl From<&AxisState> for AxisRange {
    fn from(state: &AxisState) -> Self {
        Self {
            min: state.range_min,
            max: state.range_max,
            deadzone: state.deadzone,
            limit: state.limit,
        }
    }
}

/// The values a user edits before pushing them to a device.
///
/// These are seeded from the firmware once, during the first successful sync
/// of a device context, and are never overwritten by later syncs.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct AxisEditState {
    pub range_min: u16,
    pub range_max: u16,
    pub deadzone: u8,
    pub limit: u8,

    /// The Bezier model selected for the axis, or `-1` for a linear
    /// response.
    pub curve_edit_index: i8,
}

impl AxisEditState {
    /// The staged calibration parameters.
    pub fn range(&self) -> AxisRange {
        AxisRange {
            min: self.range_min,
            max: self.range_max,
            deadzone: self.deadzone,
            limit: self.limit,
        }
    }
}

impl Default for AxisEditState {
    fn default() -> Self {
        AxisEditState::from(&AxisState::default())
    }
}

impl From<&AxisState> for AxisEditState {
    fn from(state: &AxisState) -> Self {
        Self {
            range_min: state.range_min,
            range_max: state.range_max,
            deadzone: state.deadzone,
            limit: state.limit,
            curve_edit_index: state.curve_index,
        }
    }
}

/// A control point as stored by the firmware, in the range `0.0..=1.0`.
#[derive(Clone, Copy, PartialEq, Debug, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct CurvePoint {
    pub x: f32,
    pub y: f32,
}

impl CurvePoint {
    /// Compares two points bit by bit, as the firmware does when echoing
    /// them.
    pub fn bitwise_eq(&self, other: &Self) -> bool {
        self.x.to_bits() == other.x.to_bits() && self.y.to_bits() == other.y.to_bits()
    }
}

/// A control point in percent, as presented to users.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct PercentPoint {
    pub x: i32,
    pub y: i32,
}

impl From<CurvePoint> for PercentPoint {
    fn from(point: CurvePoint) -> Self {
        Self {
            x: (point.x * 100.0).round() as i32,
            y: (point.y * 100.0).round() as i32,
        }
    }
}

impl From<PercentPoint> for CurvePoint {
    fn from(point: PercentPoint) -> Self {
        Self {
            x: point.x as f32 / 100.0,
            y: point.y as f32 / 100.0,
        }
    }
}

/// A Bezier response curve with an optional user-defined label.
#[derive(Clone, PartialEq, Eq, Hash, Debug)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct BezierModel {
    pub points: [PercentPoint; MODEL_POINTS],
    #[cfg_attr(feature = "serde", serde(skip_serializing_if = "Option::is_none"))]
    pub label: Option<String>,
}

impl BezierModel {
    /// Converts the control points to their wire representation.
    pub fn to_wire(&self) -> [CurvePoint; MODEL_POINTS] {
        self.points.map(CurvePoint::from)
    }

    /// Replaces the control points with ones received from the firmware.
    pub fn set_from_wire(&mut self, points: &[CurvePoint; MODEL_POINTS]) {
        self.points = points.map(PercentPoint::from);
    }
}

impl Default for BezierModel {
    /// A linear response: six points evenly spaced along the diagonal.
    fn default() -> Self {
        Self {
            points: std::array::from_fn(|i| {
                let v = (i * 20) as i32;
                PercentPoint { x: v, y: v }
            }),
            label: None,
        }
    }
}
