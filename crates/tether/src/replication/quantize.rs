use std::f32::consts::SQRT_2;

use glam::{Quat, Vec3};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[repr(u8)]
pub enum QuantProfile {
    /// 16-bit axes at 1 cm, relative to the local origin.
    #[default]
    Standard = 0,
    /// Full f32 relative to the local origin.
    High = 1,
    /// 16-bit axes at 1 m, relative to the local origin.
    World = 2,
    /// Raw f32, absolute.
    None = 3,
}

impl QuantProfile {
    pub const ALL: [QuantProfile; 4] = [Self::Standard, Self::High, Self::World, Self::None];

    pub fn from_u8(value: u8) -> Option<Self> {
        Self::ALL.get(value as usize).copied()
    }

    #[inline]
    pub fn codec(self) -> &'static ProfileCodec {
        &CODECS[self as usize]
    }
}

/// Field encoders for one profile. Every snapshot resolves its codec once
/// through the table below instead of matching on the profile per field.
pub struct ProfileCodec {
    pub position_size: usize,
    pub rotation_size: usize,
    pub velocity_size: usize,
    pub encode_position: fn(Vec3, Vec3, &mut [u8]),
    pub decode_position: fn(&[u8], Vec3) -> Vec3,
    pub encode_rotation: fn(Quat, &mut [u8]),
    pub decode_rotation: fn(&[u8]) -> Quat,
    pub encode_velocity: fn(Vec3, &mut [u8]),
    pub decode_velocity: fn(&[u8]) -> Vec3,
}

static CODECS: [ProfileCodec; 4] = [
    ProfileCodec {
        position_size: 6,
        rotation_size: 4,
        velocity_size: 6,
        encode_position: |p, origin, out| write_i16x3(p - origin, 100.0, out),
        decode_position: |bytes, origin| read_i16x3(bytes, 100.0) + origin,
        encode_rotation: encode_smallest_three,
        decode_rotation: decode_smallest_three,
        encode_velocity: |v, out| write_i16x3(v, 100.0, out),
        decode_velocity: |bytes| read_i16x3(bytes, 100.0),
    },
    ProfileCodec {
        position_size: 12,
        rotation_size: 4,
        velocity_size: 12,
        encode_position: |p, origin, out| write_f32x3(p - origin, out),
        decode_position: |bytes, origin| read_f32x3(bytes) + origin,
        encode_rotation: encode_smallest_three,
        decode_rotation: decode_smallest_three,
        encode_velocity: write_f32x3,
        decode_velocity: read_f32x3,
    },
    ProfileCodec {
        position_size: 6,
        rotation_size: 4,
        velocity_size: 6,
        encode_position: |p, origin, out| write_i16x3(p - origin, 1.0, out),
        decode_position: |bytes, origin| read_i16x3(bytes, 1.0) + origin,
        encode_rotation: encode_smallest_three,
        decode_rotation: decode_smallest_three,
        encode_velocity: |v, out| write_i16x3(v, 10.0, out),
        decode_velocity: |bytes| read_i16x3(bytes, 10.0),
    },
    ProfileCodec {
        position_size: 12,
        rotation_size: 16,
        velocity_size: 12,
        encode_position: |p, _origin, out| write_f32x3(p, out),
        decode_position: |bytes, _origin| read_f32x3(bytes),
        encode_rotation: encode_raw_rotation,
        decode_rotation: decode_raw_rotation,
        encode_velocity: write_f32x3,
        decode_velocity: read_f32x3,
    },
];

fn write_i16x3(v: Vec3, scale: f32, out: &mut [u8]) {
    for (i, component) in v.to_array().into_iter().enumerate() {
        let q = (component * scale)
            .round()
            .clamp(i16::MIN as f32, i16::MAX as f32) as i16;
        out[i * 2..i * 2 + 2].copy_from_slice(&q.to_le_bytes());
    }
}

fn read_i16x3(bytes: &[u8], scale: f32) -> Vec3 {
    let axis = |i: usize| i16::from_le_bytes([bytes[i * 2], bytes[i * 2 + 1]]) as f32 / scale;
    Vec3::new(axis(0), axis(1), axis(2))
}

fn write_f32x3(v: Vec3, out: &mut [u8]) {
    for (i, component) in v.to_array().into_iter().enumerate() {
        out[i * 4..i * 4 + 4].copy_from_slice(&component.to_le_bytes());
    }
}

fn read_f32x3(bytes: &[u8]) -> Vec3 {
    Vec3::new(read_f32(bytes, 0), read_f32(bytes, 4), read_f32(bytes, 8))
}

fn read_f32(bytes: &[u8], at: usize) -> f32 {
    f32::from_le_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]])
}

const COMPONENT_BITS: u32 = 10;
/// Codes run from 0 to twice this, with zero at the centre so identity and
/// axis-aligned rotations survive exactly.
const COMPONENT_HALF: f32 = ((1 << (COMPONENT_BITS - 1)) - 1) as f32;

/// Drops the largest quaternion component and packs the other three into
/// 10 bits each behind a 2-bit index: 4 bytes total.
pub fn encode_smallest_three(rotation: Quat, out: &mut [u8]) {
    let components = rotation.normalize().to_array();

    let mut largest = 0;
    for i in 1..4 {
        if components[i].abs() > components[largest].abs() {
            largest = i;
        }
    }
    // q and -q are the same rotation; keep the dropped component positive.
    let sign = if components[largest] < 0.0 { -1.0 } else { 1.0 };

    let mut packed = (largest as u32) << 30;
    let mut shift = COMPONENT_BITS * 2;
    for (i, component) in components.into_iter().enumerate() {
        if i == largest {
            continue;
        }
        let scaled = (component * sign * SQRT_2 * COMPONENT_HALF).round();
        let q = (scaled.clamp(-COMPONENT_HALF, COMPONENT_HALF) + COMPONENT_HALF) as u32;
        packed |= q << shift;
        shift = shift.saturating_sub(COMPONENT_BITS);
    }

    out[..4].copy_from_slice(&packed.to_le_bytes());
}

pub fn decode_smallest_three(bytes: &[u8]) -> Quat {
    let packed = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
    let largest = (packed >> 30) as usize;
    let mask = (1 << COMPONENT_BITS) - 1;

    let mut components = [0.0f32; 4];
    let mut shift = COMPONENT_BITS * 2;
    let mut sum_sq = 0.0;
    for (i, component) in components.iter_mut().enumerate() {
        if i == largest {
            continue;
        }
        let q = (packed >> shift) & mask;
        *component = (q as f32 - COMPONENT_HALF) / (COMPONENT_HALF * SQRT_2);
        sum_sq += *component * *component;
        shift = shift.saturating_sub(COMPONENT_BITS);
    }
    components[largest] = (1.0 - sum_sq).max(0.0).sqrt();

    Quat::from_array(components).normalize()
}

fn encode_raw_rotation(rotation: Quat, out: &mut [u8]) {
    for (i, component) in rotation.to_array().into_iter().enumerate() {
        out[i * 4..i * 4 + 4].copy_from_slice(&component.to_le_bytes());
    }
}

fn decode_raw_rotation(bytes: &[u8]) -> Quat {
    Quat::from_xyzw(
        read_f32(bytes, 0),
        read_f32(bytes, 4),
        read_f32(bytes, 8),
        read_f32(bytes, 12),
    )
}
