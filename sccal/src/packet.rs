//! Encodes requests to and decodes replies from the firmware.
//!
//! Every regular packet starts with the magic `"SC"`, followed by the
//! session's communications ID and the packet ID of the request, both
//! little-endian. The command tag follows at offset 6, then the command
//! arguments. Replies echo the header, the tag and most arguments, which is
//! what [`Reply::answers`] relies on to pair them with their request.
//!
//! The handshake assigning the communications ID uses its own framing, see
//! [`HandshakeRequest`] and [`HandshakeReply`].

use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::{
    model::{AxisRange, AxisState, CurvePoint, FirmwareVersion, MODEL_POINTS},
    transport::{REPORT_LENGTH, Report},
};

/// The magic every regular packet starts with.
pub const MAGIC: [u8; 2] = *b"SC";

/// The magic of a handshake request.
pub const HANDSHAKE_MAGIC: [u8; 3] = *b"SC!";

/// The magic of a handshake reply.
pub const HANDSHAKE_REPLY_MAGIC: [u8; 3] = *b"SC#";

/// The length of the random nonce sent with every handshake.
pub const NONCE_LENGTH: usize = 55;

/// The maximum length of a Bezier model label in bytes.
pub const LABEL_LENGTH: usize = 50;

/// The middle byte of all three-byte command tags.
const TAG_INFIX: u8 = b'A';

/// A Bezier model label as stored by the firmware, padded with NUL bytes.
pub type Label = [u8; LABEL_LENGTH];

/// Converts a label to its wire representation.
///
/// Returns [`None`] if the label is longer than [`LABEL_LENGTH`] bytes.
pub fn encode_label(label: &str) -> Option<Label> {
    let bytes = label.as_bytes();
    if bytes.len() > LABEL_LENGTH {
        return None;
    }

    let mut encoded = [0u8; LABEL_LENGTH];
    encoded[..bytes.len()].copy_from_slice(bytes);
    Some(encoded)
}

/// Converts a label received from the firmware to a string.
///
/// Everything after the first NUL byte is ignored and invalid UTF-8 is
/// replaced.
pub fn decode_label(label: &Label) -> String {
    let end = label.iter().position(|&b| b == 0).unwrap_or(LABEL_LENGTH);
    String::from_utf8_lossy(&label[..end]).into_owned()
}

/// The first byte of every command tag.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum CommandGroup {
    Version = b'V',
    Joystick = b'J',
    Bezier = b'B',
    Commit = b'S',
}

/// The last tag byte of commands addressing a single axis.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum JoystickCommand {
    AxisCount = b'C',
    AxisState = b'S',
    AxisEnable = b'E',
    AxisRange = b'R',
    AxisBezier = b'B',
}

/// The last tag byte of commands addressing a single Bezier model.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum BezierCommand {
    SetModel = b'M',
    GetModel = b'G',
    SetLabel = b'U',
    GetLabel = b'L',
}

/// Identifies the command a packet belongs to.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum Command {
    Version,
    Joystick(JoystickCommand),
    Bezier(BezierCommand),
    Commit,
}

impl Command {
    fn write_tag(self, w: &mut PacketWriter) {
        match self {
            Command::Version => w.u8(CommandGroup::Version.into()),
            Command::Commit => w.u8(CommandGroup::Commit.into()),
            Command::Joystick(cmd) => w.bytes(&[CommandGroup::Joystick.into(), TAG_INFIX, cmd.into()]),
            Command::Bezier(cmd) => w.bytes(&[CommandGroup::Bezier.into(), TAG_INFIX, cmd.into()]),
        };
    }

    fn read_tag(r: &mut PacketReader) -> Option<Self> {
        match CommandGroup::try_from(r.u8()?).ok()? {
            CommandGroup::Version => Some(Command::Version),
            CommandGroup::Commit => Some(Command::Commit),
            CommandGroup::Joystick => {
                if r.u8()? != TAG_INFIX {
                    return None;
                }
                JoystickCommand::try_from(r.u8()?).ok().map(Command::Joystick)
            },
            CommandGroup::Bezier => {
                if r.u8()? != TAG_INFIX {
                    return None;
                }
                BezierCommand::try_from(r.u8()?).ok().map(Command::Bezier)
            },
        }
    }
}

/// Represents the header that starts every regular packet.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct PacketHeader {
    /// The ID assigned to the session by the handshake.
    pub communications_id: u16,

    /// The ID of the request, incremented for every request sent.
    pub packet_id: u16,
}

impl PacketHeader {
    fn write(&self, w: &mut PacketWriter) {
        w.bytes(&MAGIC)
            .u16(self.communications_id)
            .u16(self.packet_id);
    }

    fn read(r: &mut PacketReader) -> Option<Self> {
        if r.bytes::<2>()? != MAGIC {
            return None;
        }

        Some(Self {
            communications_id: r.u16()?,
            packet_id: r.u16()?,
        })
    }
}

/// A request sent from the host to the firmware.
#[derive(Clone, PartialEq, Debug)]
pub enum Request {
    GetVersion,
    GetNumAxes,
    GetAxisState { axis: u8 },
    SetAxisEnabled { axis: u8, enabled: bool },
    SetAxisRange { axis: u8, range: AxisRange },
    SetAxisBezierIndex { axis: u8, curve: i8 },
    SetBezierModel { model: u8, points: [CurvePoint; MODEL_POINTS] },
    GetBezierModel { model: u8 },
    SetBezierLabel { model: u8, label: Label },
    GetBezierLabel { model: u8 },
    Commit,
}

impl Request {
    /// The command this request belongs to.
    pub fn command(&self) -> Command {
        match self {
            Request::GetVersion => Command::Version,
            Request::GetNumAxes => Command::Joystick(JoystickCommand::AxisCount),
            Request::GetAxisState { .. } => Command::Joystick(JoystickCommand::AxisState),
            Request::SetAxisEnabled { .. } => Command::Joystick(JoystickCommand::AxisEnable),
            Request::SetAxisRange { .. } => Command::Joystick(JoystickCommand::AxisRange),
            Request::SetAxisBezierIndex { .. } => Command::Joystick(JoystickCommand::AxisBezier),
            Request::SetBezierModel { .. } => Command::Bezier(BezierCommand::SetModel),
            Request::GetBezierModel { .. } => Command::Bezier(BezierCommand::GetModel),
            Request::SetBezierLabel { .. } => Command::Bezier(BezierCommand::SetLabel),
            Request::GetBezierLabel { .. } => Command::Bezier(BezierCommand::GetLabel),
            Request::Commit => Command::Commit,
        }
    }

    /// Encodes the request into a packet.
    pub fn to_bytes(&self, header: PacketHeader) -> Report {
        let mut w = PacketWriter::new();
        header.write(&mut w);
        self.command().write_tag(&mut w);

        match self {
            Request::GetVersion | Request::GetNumAxes | Request::Commit => {},
            Request::GetAxisState { axis } => {
                w.u8(*axis);
            },
            Request::SetAxisEnabled { axis, enabled } => {
                w.u8(*axis).bool(*enabled);
            },
            Request::SetAxisRange { axis, range } => {
                w.u8(*axis).range(range);
            },
            Request::SetAxisBezierIndex { axis, curve } => {
                w.u8(*axis).i8(*curve);
            },
            Request::SetBezierModel { model, points } => {
                w.u8(*model).points(points);
            },
            Request::GetBezierModel { model } | Request::GetBezierLabel { model } => {
                w.u8(*model);
            },
            Request::SetBezierLabel { model, label } => {
                w.u8(*model).bytes(label);
            },
        }

        w.finish()
    }

    /// Decodes a request from a packet.
    ///
    /// Returns [`None`] if the packet is not a well-formed request.
    pub fn from_bytes(buf: &Report) -> Option<(PacketHeader, Self)> {
        let mut r = PacketReader::new(buf);
        let header = PacketHeader::read(&mut r)?;

        let request = match Command::read_tag(&mut r)? {
            Command::Version => Request::GetVersion,
            Command::Commit => Request::Commit,
            Command::Joystick(cmd) => match cmd {
                JoystickCommand::AxisCount => Request::GetNumAxes,
                JoystickCommand::AxisState => Request::GetAxisState { axis: r.u8()? },
                JoystickCommand::AxisEnable => Request::SetAxisEnabled {
                    axis: r.u8()?,
                    enabled: r.bool()?,
                },
                JoystickCommand::AxisRange => Request::SetAxisRange {
                    axis: r.u8()?,
                    range: r.range()?,
                },
                JoystickCommand::AxisBezier => Request::SetAxisBezierIndex {
                    axis: r.u8()?,
                    curve: r.i8()?,
                },
            },
            Command::Bezier(cmd) => match cmd {
                BezierCommand::SetModel => Request::SetBezierModel {
                    model: r.u8()?,
                    points: r.points()?,
                },
                BezierCommand::GetModel => Request::GetBezierModel { model: r.u8()? },
                BezierCommand::SetLabel => Request::SetBezierLabel {
                    model: r.u8()?,
                    label: r.bytes()?,
                },
                BezierCommand::GetLabel => Request::GetBezierLabel { model: r.u8()? },
            },
        };

        Some((header, request))
    }
}

/// A reply sent from the firmware to the host.
#[derive(Clone, PartialEq, Debug)]
pub enum Reply {
    Version(FirmwareVersion),
    NumAxes(u8),
    AxisState { axis: u8, state: AxisState },
    AxisEnabled { axis: u8, enabled: bool },
    AxisRange { axis: u8, range: AxisRange },
    AxisBezierIndex { axis: u8, curve: i8 },
    BezierModelStored { model: u8, points: [CurvePoint; MODEL_POINTS] },
    BezierModel { model: u8, points: [CurvePoint; MODEL_POINTS] },
    BezierLabelStored { model: u8, label: Label },
    BezierLabel { model: u8, label: Label },
    Commit { status: i8 },
}

impl Reply {
    /// The command this reply belongs to.
    pub fn command(&self) -> Command {
        match self {
            Reply::Version(_) => Command::Version,
            Reply::NumAxes(_) => Command::Joystick(JoystickCommand::AxisCount),
            Reply::AxisState { .. } => Command::Joystick(JoystickCommand::AxisState),
            Reply::AxisEnabled { .. } => Command::Joystick(JoystickCommand::AxisEnable),
            Reply::AxisRange { .. } => Command::Joystick(JoystickCommand::AxisRange),
            Reply::AxisBezierIndex { .. } => Command::Joystick(JoystickCommand::AxisBezier),
            Reply::BezierModelStored { .. } => Command::Bezier(BezierCommand::SetModel),
            Reply::BezierModel { .. } => Command::Bezier(BezierCommand::GetModel),
            Reply::BezierLabelStored { .. } => Command::Bezier(BezierCommand::SetLabel),
            Reply::BezierLabel { .. } => Command::Bezier(BezierCommand::GetLabel),
            Reply::Commit { .. } => Command::Commit,
        }
    }

    /// Checks whether this reply answers a specific request.
    ///
    /// Besides the command, every echoed argument has to match. Control
    /// points are compared by their raw bits.
    pub fn answers(&self, request: &Request) -> bool {
        match (self, request) {
            (Reply::Version(_), Request::GetVersion) => true,
            (Reply::NumAxes(_), Request::GetNumAxes) => true,
            (Reply::AxisState { axis, .. }, Request::GetAxisState { axis: sent }) => axis == sent,
            (
                Reply::AxisEnabled { axis, enabled },
                Request::SetAxisEnabled {
                    axis: sent_axis,
                    enabled: sent_enabled,
                },
            ) => axis == sent_axis && enabled == sent_enabled,
            (
                Reply::AxisRange { axis, range },
                Request::SetAxisRange {
                    axis: sent_axis,
                    range: sent_range,
                },
            ) => axis == sent_axis && range == sent_range,
            (
                Reply::AxisBezierIndex { axis, curve },
                Request::SetAxisBezierIndex {
                    axis: sent_axis,
                    curve: sent_curve,
                },
            ) => axis == sent_axis && curve == sent_curve,
            (
                Reply::BezierModelStored { model, points },
                Request::SetBezierModel {
                    model: sent_model,
                    points: sent_points,
                },
            ) => {
                model == sent_model
                    && points
                        .iter()
                        .zip(sent_points)
                        .all(|(a, b)| a.bitwise_eq(b))
            },
            (Reply::BezierModel { model, .. }, Request::GetBezierModel { model: sent }) => {
                model == sent
            },
            (
                Reply::BezierLabelStored { model, label },
                Request::SetBezierLabel {
                    model: sent_model,
                    label: sent_label,
                },
            ) => model == sent_model && label == sent_label,
            (Reply::BezierLabel { model, .. }, Request::GetBezierLabel { model: sent }) => {
                model == sent
            },
            (Reply::Commit { .. }, Request::Commit) => true,
            _ => false,
        }
    }

    /// Encodes the reply into a packet.
    pub fn to_bytes(&self, header: PacketHeader) -> Report {
        let mut w = PacketWriter::new();
        header.write(&mut w);
        self.command().write_tag(&mut w);

        match self {
            Reply::Version(version) => {
                w.u16(version.major)
                    .u16(version.minor)
                    .u16(version.revision);
            },
            Reply::NumAxes(count) => {
                w.u8(*count);
            },
            Reply::AxisState { axis, state } => {
                w.u8(*axis)
                    .bool(state.enabled)
                    .i8(state.curve_index)
                    .u16(state.range_min)
                    .u16(state.range_max)
                    .u16(state.input)
                    .u16(state.output)
                    .u8(state.deadzone)
                    .u8(state.limit);
            },
            Reply::AxisEnabled { axis, enabled } => {
                w.u8(*axis).bool(*enabled);
            },
            Reply::AxisRange { axis, range } => {
                w.u8(*axis).range(range);
            },
            Reply::AxisBezierIndex { axis, curve } => {
                w.u8(*axis).i8(*curve);
            },
            Reply::BezierModelStored { model, points } | Reply::BezierModel { model, points } => {
                w.u8(*model).points(points);
            },
            Reply::BezierLabelStored { model, label } | Reply::BezierLabel { model, label } => {
                w.u8(*model).bytes(label);
            },
            Reply::Commit { status } => {
                w.i8(*status);
            },
        }

        w.finish()
    }

    /// Decodes a reply from a packet.
    ///
    /// Returns [`None`] if the packet is not a well-formed reply.
    pub fn from_bytes(buf: &Report) -> Option<(PacketHeader, Self)> {
        let mut r = PacketReader::new(buf);
        let header = PacketHeader::read(&mut r)?;

        let reply = match Command::read_tag(&mut r)? {
            Command::Version => Reply::Version(FirmwareVersion {
                major: r.u16()?,
                minor: r.u16()?,
                revision: r.u16()?,
            }),
            Command::Commit => Reply::Commit { status: r.i8()? },
            Command::Joystick(cmd) => match cmd {
                JoystickCommand::AxisCount => Reply::NumAxes(r.u8()?),
                JoystickCommand::AxisState => Reply::AxisState {
                    axis: r.u8()?,
                    state: AxisState {
                        enabled: r.bool()?,
                        curve_index: r.i8()?,
                        range_min: r.u16()?,
                        range_max: r.u16()?,
                        input: r.u16()?,
                        output: r.u16()?,
                        deadzone: r.u8()?,
                        limit: r.u8()?,
                        input_fraction: 0.0,
                        output_fraction: 0.0,
                    }
                    .with_fractions(),
                },
                JoystickCommand::AxisEnable => Reply::AxisEnabled {
                    axis: r.u8()?,
                    enabled: r.bool()?,
                },
                JoystickCommand::AxisRange => Reply::AxisRange {
                    axis: r.u8()?,
                    range: r.range()?,
                },
                JoystickCommand::AxisBezier => Reply::AxisBezierIndex {
                    axis: r.u8()?,
                    curve: r.i8()?,
                },
            },
            Command::Bezier(cmd) => match cmd {
                BezierCommand::SetModel => Reply::BezierModelStored {
                    model: r.u8()?,
                    points: r.points()?,
                },
                BezierCommand::GetModel => Reply::BezierModel {
                    model: r.u8()?,
                    points: r.points()?,
                },
                BezierCommand::SetLabel => Reply::BezierLabelStored {
                    model: r.u8()?,
                    label: r.bytes()?,
                },
                BezierCommand::GetLabel => Reply::BezierLabel {
                    model: r.u8()?,
                    label: r.bytes()?,
                },
            },
        };

        Some((header, reply))
    }
}

/// The request starting a new session.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct HandshakeRequest {
    /// Random bytes the firmware has to echo back.
    pub nonce: [u8; NONCE_LENGTH],
}

impl HandshakeRequest {
    pub fn to_bytes(&self) -> Report {
        let mut w = PacketWriter::new();
        w.bytes(&HANDSHAKE_MAGIC).bytes(&self.nonce);
        w.finish()
    }

    pub fn from_bytes(buf: &Report) -> Option<Self> {
        let mut r = PacketReader::new(buf);
        if r.bytes::<3>()? != HANDSHAKE_MAGIC {
            return None;
        }

        Some(Self { nonce: r.bytes()? })
    }
}

/// The reply assigning a communications ID to a new session.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct HandshakeReply {
    pub communications_id: u16,
    pub nonce: [u8; NONCE_LENGTH],
}

impl HandshakeReply {
    pub fn to_bytes(&self) -> Report {
        let mut w = PacketWriter::new();
        w.bytes(&HANDSHAKE_REPLY_MAGIC)
            .u16(self.communications_id)
            .bytes(&self.nonce);
        w.finish()
    }

    pub fn from_bytes(buf: &Report) -> Option<Self> {
        let mut r = PacketReader::new(buf);
        if r.bytes::<3>()? != HANDSHAKE_REPLY_MAGIC {
            return None;
        }

        Some(Self {
            communications_id: r.u16()?,
            nonce: r.bytes()?,
        })
    }

    /// Checks whether this reply echoes the nonce of a specific request.
    pub fn answers(&self, request: &HandshakeRequest) -> bool {
        self.nonce == request.nonce
    }
}

/// Sequentially writes little-endian values into a zeroed packet.
struct PacketWriter {
    buf: Report,
    pos: usize,
}

impl PacketWriter {
    fn new() -> Self {
        Self {
            buf: [0; REPORT_LENGTH],
            pos: 0,
        }
    }

    fn bytes(&mut self, src: &[u8]) -> &mut Self {
        let end = self.pos + src.len();
        self.buf[self.pos..end].copy_from_slice(src);
        self.pos = end;
        self
    }

    fn u8(&mut self, value: u8) -> &mut Self {
        self.bytes(&[value])
    }

    fn i8(&mut self, value: i8) -> &mut Self {
        self.bytes(&value.to_le_bytes())
    }

    fn bool(&mut self, value: bool) -> &mut Self {
        self.u8(u8::from(value))
    }

    fn u16(&mut self, value: u16) -> &mut Self {
        self.bytes(&value.to_le_bytes())
    }

    fn f32(&mut self, value: f32) -> &mut Self {
        self.bytes(&value.to_le_bytes())
    }

    fn range(&mut self, range: &AxisRange) -> &mut Self {
        self.u16(range.min)
            .u16(range.max)
            .u8(range.deadzone)
            .u8(range.limit)
    }

    fn points(&mut self, points: &[CurvePoint; MODEL_POINTS]) -> &mut Self {
        for point in points {
            self.f32(point.x).f32(point.y);
        }
        self
    }

    fn finish(&self) -> Report {
        self.buf
    }
}

/// Sequentially reads little-endian values from a packet.
struct PacketReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> PacketReader<'a> {
    fn new(buf: &'a Report) -> Self {
        Self { buf, pos: 0 }
    }

    fn bytes<const N: usize>(&mut self) -> Option<[u8; N]> {
        let chunk = self.buf.get(self.pos..self.pos + N)?;
        self.pos += N;
        chunk.try_into().ok()
    }

    fn u8(&mut self) -> Option<u8> {
        self.bytes::<1>().map(|[b]| b)
    }

    fn i8(&mut self) -> Option<i8> {
        self.bytes().map(i8::from_le_bytes)
    }

    fn bool(&mut self) -> Option<bool> {
        self.u8().map(|b| b != 0)
    }

    fn u16(&mut self) -> Option<u16> {
        self.bytes().map(u16::from_le_bytes)
    }

    fn f32(&mut self) -> Option<f32> {
        self.bytes().map(f32::from_le_bytes)
    }

    fn range(&mut self) -> Option<AxisRange> {
        Some(AxisRange {
            min: self.u16()?,
            max: self.u16()?,
            deadzone: self.u8()?,
            limit: self.u8()?,
        })
    }

    fn points(&mut self) -> Option<[CurvePoint; MODEL_POINTS]> {
        let mut points = [CurvePoint::default(); MODEL_POINTS];
        for point in &mut points {
            *point = CurvePoint {
                x: self.f32()?,
                y: self.f32()?,
            };
        }
        Some(points)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const HEADER: PacketHeader = PacketHeader {
        communications_id: 0x1234,
        packet_id: 7,
    };

    #[test]
    fn range_request_layout() {
        let packet = Request::SetAxisRange {
            axis: 2,
            range: AxisRange {
                min: 100,
                max: 50000,
                deadzone: 5,
                limit: 90,
            },
        }
        .to_bytes(HEADER);

        assert_eq!(&packet[0..2], b"SC");
        assert_eq!(&packet[2..4], &[0x34, 0x12]);
        assert_eq!(&packet[4..6], &[0x07, 0x00]);
        assert_eq!(&packet[6..9], b"JAR");
        assert_eq!(packet[9], 2);
        assert_eq!(&packet[10..12], &100u16.to_le_bytes());
        assert_eq!(&packet[12..14], &50000u16.to_le_bytes());
        assert_eq!(packet[14], 5);
        assert_eq!(packet[15], 90);
        assert!(packet[16..].iter().all(|&b| b == 0));
    }

    #[test]
    fn single_byte_tags() {
        let version = Request::GetVersion.to_bytes(HEADER);
        assert_eq!(version[6], b'V');
        assert!(version[7..].iter().all(|&b| b == 0));

        let commit = Request::Commit.to_bytes(HEADER);
        assert_eq!(commit[6], b'S');
    }

    #[test]
    fn handshake_layout() {
        let request = HandshakeRequest {
            nonce: [0xab; NONCE_LENGTH],
        };
        let packet = request.to_bytes();
        assert_eq!(&packet[0..3], b"SC!");
        assert!(packet[3..58].iter().all(|&b| b == 0xab));
        assert!(packet[58..].iter().all(|&b| b == 0));

        let mut raw = [0u8; REPORT_LENGTH];
        raw[0..3].copy_from_slice(b"SC#");
        raw[3..5].copy_from_slice(&0x0102u16.to_le_bytes());
        raw[5..60].copy_from_slice(&[0xab; NONCE_LENGTH]);

        let reply = HandshakeReply::from_bytes(&raw).expect("a handshake reply");
        assert_eq!(reply.communications_id, 0x0102);
        assert!(reply.answers(&request));

        raw[59] = 0xac;
        let stale = HandshakeReply::from_bytes(&raw).expect("a handshake reply");
        assert!(!stale.answers(&request));
    }

    #[test]
    fn decode_axis_state_reply() {
        let mut raw = [0u8; REPORT_LENGTH];
        raw[0..2].copy_from_slice(b"SC");
        raw[2..4].copy_from_slice(&0x1234u16.to_le_bytes());
        raw[4..6].copy_from_slice(&7u16.to_le_bytes());
        raw[6..9].copy_from_slice(b"JAS");
        raw[9] = 1;
        raw[10] = 1;
        raw[11] = 0xff;
        raw[12..14].copy_from_slice(&500u16.to_le_bytes());
        raw[14..16].copy_from_slice(&60000u16.to_le_bytes());
        raw[16..18].copy_from_slice(&32768u16.to_le_bytes());
        raw[18..20].copy_from_slice(&65535u16.to_le_bytes());
        raw[20] = 3;
        raw[21] = 95;

        let (header, reply) = Reply::from_bytes(&raw).expect("a reply");
        assert_eq!(header, HEADER);

        let Reply::AxisState { axis, state } = reply else {
            panic!("expected an axis state reply");
        };
        assert_eq!(axis, 1);
        assert!(state.enabled);
        assert_eq!(state.curve_index, -1);
        assert_eq!(state.range_min, 500);
        assert_eq!(state.range_max, 60000);
        assert_eq!(state.deadzone, 3);
        assert_eq!(state.limit, 95);
        assert_eq!(state.output_fraction, 1.0);
        assert!((state.input_fraction - 0.5).abs() < 0.001);
    }

    #[test]
    fn echo_mismatch_does_not_answer() {
        let request = Request::SetAxisEnabled {
            axis: 0,
            enabled: true,
        };

        assert!(
            Reply::AxisEnabled {
                axis: 0,
                enabled: true
            }
            .answers(&request)
        );
        assert!(
            !Reply::AxisEnabled {
                axis: 0,
                enabled: false
            }
            .answers(&request)
        );
        assert!(
            !Reply::AxisEnabled {
                axis: 1,
                enabled: true
            }
            .answers(&request)
        );
        assert!(!Reply::NumAxes(1).answers(&request));
    }

    #[test]
    fn model_echo_compares_raw_bits() {
        let mut points = [CurvePoint::default(); MODEL_POINTS];
        points[0] = CurvePoint { x: 0.0, y: 0.0 };
        let request = Request::SetBezierModel { model: 1, points };

        let mut echoed = points;
        echoed[0] = CurvePoint { x: -0.0, y: 0.0 };

        assert!(Reply::BezierModelStored { model: 1, points }.answers(&request));
        assert!(
            !Reply::BezierModelStored {
                model: 1,
                points: echoed
            }
            .answers(&request)
        );
    }

    #[test]
    fn request_decodes_from_its_encoding() {
        let request = Request::SetBezierLabel {
            model: 4,
            label: encode_label("Soft brake").expect("a short label"),
        };
        let packet = request.to_bytes(HEADER);
        assert_eq!(&packet[6..9], b"BAU");

        assert_eq!(Request::from_bytes(&packet), Some((HEADER, request)));
    }

    #[test]
    fn garbage_is_rejected() {
        let mut raw = [0u8; REPORT_LENGTH];
        assert_eq!(Reply::from_bytes(&raw), None);

        raw[0..2].copy_from_slice(b"SC");
        raw[6..9].copy_from_slice(b"JXS");
        assert_eq!(Reply::from_bytes(&raw), None);

        raw[6..9].copy_from_slice(b"Q  ");
        assert_eq!(Request::from_bytes(&raw), None);
    }

    #[test]
    fn labels() {
        assert_eq!(encode_label(&"x".repeat(LABEL_LENGTH + 1)), None);

        let full = encode_label(&"y".repeat(LABEL_LENGTH)).expect("a label of maximum length");
        assert_eq!(decode_label(&full).len(), LABEL_LENGTH);

        let mut raw = [0u8; LABEL_LENGTH];
        raw[..4].copy_from_slice(b"Gas\0");
        raw[4] = b'!';
        assert_eq!(decode_label(&raw), "Gas");

        raw[0] = 0xff;
        assert_eq!(decode_label(&raw), "\u{fffd}as");

        assert_eq!(decode_label(&[0; LABEL_LENGTH]), "");
    }
}
