//! Fixed-layout binary telemetry frames.
//!
//! Producer → server: `[1-byte flags][N × f32 little-endian]`
//! Server → aggregator: `[36-byte ASCII sender identity][producer payload]`
//!
//! The relay never decodes the floats; it only checks the payload length
//! against the active [`TelemetrySchema`] and forwards the bytes untouched.

use crate::error::FramingError;
use crate::identity::{ConnectionId, IDENTITY_LEN};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Size of the flags byte at the head of every payload.
pub const FLAGS_LEN: usize = 1;

/// Size of one numeric field.
pub const FLOAT_LEN: usize = 4;

const FLAG_TRACKING: u8 = 1 << 0;
const FLAG_SHAKING: u8 = 1 << 1;
const RESERVED_FLAGS: u8 = !(FLAG_TRACKING | FLAG_SHAKING);

/// Versioned payload layouts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TelemetrySchema {
    /// velocity xyz, acceleration xyz, orientation alpha/beta/gamma.
    #[default]
    V1,
    /// acceleration xyz, rotation rate alpha/beta/gamma,
    /// orientation quaternion wxyz, auxiliary level.
    V2,
}

impl TelemetrySchema {
    /// Number of float32 fields after the flags byte.
    pub const fn float_count(self) -> usize {
        match self {
            TelemetrySchema::V1 => 9,
            TelemetrySchema::V2 => 11,
        }
    }

    /// Size of a producer payload.
    pub const fn payload_len(self) -> usize {
        FLAGS_LEN + self.float_count() * FLOAT_LEN
    }

    /// Size of a frame as delivered to the aggregator.
    pub const fn forwarded_len(self) -> usize {
        IDENTITY_LEN + self.payload_len()
    }

    /// Length check applied by the relay before forwarding.
    pub fn validate(self, payload: &[u8]) -> Result<(), FramingError> {
        if payload.len() != self.payload_len() {
            return Err(FramingError::Length {
                expected: self.payload_len(),
                actual: payload.len(),
            });
        }
        Ok(())
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TelemetrySchema::V1 => "v1",
            TelemetrySchema::V2 => "v2",
        }
    }
}

impl fmt::Display for TelemetrySchema {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TelemetrySchema {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "v1" | "1" => Ok(TelemetrySchema::V1),
            "v2" | "2" => Ok(TelemetrySchema::V2),
            other => Err(format!("unknown telemetry schema: {other}")),
        }
    }
}

/// Flags byte of a sample.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MotionFlags {
    /// The performer is actively engaged (touching the screen).
    pub tracking: bool,
    /// A shake gesture is in progress.
    pub shaking: bool,
}

impl MotionFlags {
    pub fn to_byte(self) -> u8 {
        let mut flags = 0;
        if self.tracking {
            flags |= FLAG_TRACKING;
        }
        if self.shaking {
            flags |= FLAG_SHAKING;
        }
        flags
    }

    pub fn from_byte(byte: u8) -> Result<Self, FramingError> {
        if byte & RESERVED_FLAGS != 0 {
            return Err(FramingError::ReservedFlags(byte));
        }
        Ok(Self {
            tracking: byte & FLAG_TRACKING != 0,
            shaking: byte & FLAG_SHAKING != 0,
        })
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Vec3 {
    pub x: f32,
    pub y: f32,
    pub z: f32,
}

/// Device orientation or rotation rate in the DeviceOrientation convention.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct EulerAngles {
    pub alpha: f32,
    pub beta: f32,
    pub gamma: f32,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Quaternion {
    pub w: f32,
    pub x: f32,
    pub y: f32,
    pub z: f32,
}

impl Default for Quaternion {
    fn default() -> Self {
        Self {
            w: 1.0,
            x: 0.0,
            y: 0.0,
            z: 0.0,
        }
    }
}

/// Schema `v1` sample.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct LinearSample {
    pub flags: MotionFlags,
    pub velocity: Vec3,
    pub acceleration: Vec3,
    pub orientation: EulerAngles,
}

/// Schema `v2` sample.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct QuaternionSample {
    pub flags: MotionFlags,
    pub acceleration: Vec3,
    pub rotation_rate: EulerAngles,
    pub orientation: Quaternion,
    /// Auxiliary scalar (e.g. microphone level), schema-defined range.
    pub level: f32,
}

/// One producer's instantaneous motion sample.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum MotionSample {
    V1(LinearSample),
    V2(QuaternionSample),
}

impl MotionSample {
    pub fn schema(&self) -> TelemetrySchema {
        match self {
            MotionSample::V1(_) => TelemetrySchema::V1,
            MotionSample::V2(_) => TelemetrySchema::V2,
        }
    }

    pub fn flags(&self) -> MotionFlags {
        match self {
            MotionSample::V1(s) => s.flags,
            MotionSample::V2(s) => s.flags,
        }
    }

    /// Serialize into a producer payload of exactly `schema().payload_len()` bytes.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.schema().payload_len());
        out.push(self.flags().to_byte());
        match self {
            MotionSample::V1(s) => {
                put_vec3(&mut out, &s.velocity);
                put_vec3(&mut out, &s.acceleration);
                put_euler(&mut out, &s.orientation);
            }
            MotionSample::V2(s) => {
                put_vec3(&mut out, &s.acceleration);
                put_euler(&mut out, &s.rotation_rate);
                for v in [s.orientation.w, s.orientation.x, s.orientation.y, s.orientation.z] {
                    out.extend_from_slice(&v.to_le_bytes());
                }
                out.extend_from_slice(&s.level.to_le_bytes());
            }
        }
        out
    }
}

fn put_vec3(out: &mut Vec<u8>, v: &Vec3) {
    for f in [v.x, v.y, v.z] {
        out.extend_from_slice(&f.to_le_bytes());
    }
}

fn put_euler(out: &mut Vec<u8>, e: &EulerAngles) {
    for f in [e.alpha, e.beta, e.gamma] {
        out.extend_from_slice(&f.to_le_bytes());
    }
}

/// Sequential float reader over an already length-checked payload.
struct FloatReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> FloatReader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn f32(&mut self) -> f32 {
        let mut raw = [0u8; FLOAT_LEN];
        raw.copy_from_slice(&self.buf[self.pos..self.pos + FLOAT_LEN]);
        self.pos += FLOAT_LEN;
        f32::from_le_bytes(raw)
    }

    fn vec3(&mut self) -> Vec3 {
        Vec3 {
            x: self.f32(),
            y: self.f32(),
            z: self.f32(),
        }
    }

    fn euler(&mut self) -> EulerAngles {
        EulerAngles {
            alpha: self.f32(),
            beta: self.f32(),
            gamma: self.f32(),
        }
    }
}

/// Decode a producer payload (no identity prefix).
pub fn decode_payload(schema: TelemetrySchema, payload: &[u8]) -> Result<MotionSample, FramingError> {
    schema.validate(payload)?;
    let flags = MotionFlags::from_byte(payload[0])?;
    let mut r = FloatReader::new(&payload[FLAGS_LEN..]);

    let sample = match schema {
        TelemetrySchema::V1 => MotionSample::V1(LinearSample {
            flags,
            velocity: r.vec3(),
            acceleration: r.vec3(),
            orientation: r.euler(),
        }),
        TelemetrySchema::V2 => MotionSample::V2(QuaternionSample {
            flags,
            acceleration: r.vec3(),
            rotation_rate: r.euler(),
            orientation: Quaternion {
                w: r.f32(),
                x: r.f32(),
                y: r.f32(),
                z: r.f32(),
            },
            level: r.f32(),
        }),
    };
    Ok(sample)
}

/// Build the aggregator-bound frame: sender identity followed by the payload.
pub fn prefix_frame(sender: &ConnectionId, payload: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(IDENTITY_LEN + payload.len());
    frame.extend_from_slice(sender.as_bytes());
    frame.extend_from_slice(payload);
    frame
}

/// Decode a frame as received by an aggregator.
pub fn decode_forwarded(
    schema: TelemetrySchema,
    frame: &[u8],
) -> Result<(ConnectionId, MotionSample), FramingError> {
    if frame.len() != schema.forwarded_len() {
        return Err(FramingError::Length {
            expected: schema.forwarded_len(),
            actual: frame.len(),
        });
    }
    let (id_bytes, payload) = frame.split_at(IDENTITY_LEN);
    let sender = ConnectionId::from_bytes(id_bytes)?;
    let sample = decode_payload(schema, payload)?;
    Ok((sender, sample))
}
