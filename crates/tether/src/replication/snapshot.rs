use bitflags::bitflags;
use glam::{Quat, Vec3};

use super::entity::Transform;
use super::quantize::QuantProfile;

pub const SNAPSHOT_HEADER_SIZE: usize = 6;
pub const INPUT_ACK_SIZE: usize = 2;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct DirtyFields: u8 {
        const POSITION = 1 << 0;
        const ROTATION = 1 << 1;
        const VELOCITY = 1 << 2;
        const INPUT_ACK = 1 << 3;
        const TRANSFORM = Self::POSITION.bits() | Self::ROTATION.bits() | Self::VELOCITY.bits();
    }
}

impl DirtyFields {
    /// Transform fields that differ between two states.
    pub fn between(previous: &Transform, current: &Transform) -> Self {
        let mut dirty = DirtyFields::empty();
        if previous.position != current.position {
            dirty |= DirtyFields::POSITION;
        }
        if previous.rotation != current.rotation {
            dirty |= DirtyFields::ROTATION;
        }
        if previous.velocity != current.velocity {
            dirty |= DirtyFields::VELOCITY;
        }
        dirty
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SnapshotHeader {
    pub entity_id: u16,
    pub generation: u8,
    pub dirty: DirtyFields,
    pub quant_profile: u8,
    pub sequence: u8,
}

impl SnapshotHeader {
    pub fn write(&self, out: &mut [u8]) {
        out[0..2].copy_from_slice(&self.entity_id.to_le_bytes());
        out[2] = self.generation;
        out[3] = self.dirty.bits();
        out[4] = self.quant_profile;
        out[5] = self.sequence;
    }

    pub fn read(bytes: &[u8]) -> Result<Self, SnapshotError> {
        if bytes.len() < SNAPSHOT_HEADER_SIZE {
            return Err(SnapshotError::Truncated {
                needed: SNAPSHOT_HEADER_SIZE,
                available: bytes.len(),
            });
        }
        Ok(Self {
            entity_id: u16::from_le_bytes([bytes[0], bytes[1]]),
            generation: bytes[2],
            dirty: DirtyFields::from_bits_truncate(bytes[3]),
            quant_profile: bytes[4],
            sequence: bytes[5],
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DecodedSnapshot {
    pub header: SnapshotHeader,
    pub profile: QuantProfile,
    pub position: Option<Vec3>,
    pub rotation: Option<Quat>,
    pub velocity: Option<Vec3>,
    pub input_ack: Option<u16>,
}

impl DecodedSnapshot {
    /// Overlays the fields this snapshot carries onto `base`.
    pub fn apply_to(&self, base: &Transform) -> Transform {
        Transform {
            position: self.position.unwrap_or(base.position),
            rotation: self.rotation.unwrap_or(base.rotation),
            velocity: self.velocity.unwrap_or(base.velocity),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum SnapshotError {
    #[error("snapshot truncated: needed {needed} bytes, {available} available")]
    Truncated { needed: usize, available: usize },
    #[error("unknown quantization profile {0}")]
    UnknownProfile(u8),
    #[error("output buffer too small: needed {needed} bytes, {available} available")]
    BufferTooSmall { needed: usize, available: usize },
}

pub fn body_size(profile: QuantProfile, dirty: DirtyFields) -> usize {
    let codec = profile.codec();
    let mut size = 0;
    if dirty.contains(DirtyFields::POSITION) {
        size += codec.position_size;
    }
    if dirty.contains(DirtyFields::ROTATION) {
        size += codec.rotation_size;
    }
    if dirty.contains(DirtyFields::VELOCITY) {
        size += codec.velocity_size;
    }
    if dirty.contains(DirtyFields::INPUT_ACK) {
        size += INPUT_ACK_SIZE;
    }
    size
}

pub fn encoded_size(profile: QuantProfile, dirty: DirtyFields) -> usize {
    SNAPSHOT_HEADER_SIZE + body_size(profile, dirty)
}

/// Writes header and quantized body into `out`; returns bytes written.
pub fn encode_snapshot(
    header: &SnapshotHeader,
    profile: QuantProfile,
    transform: &Transform,
    input_ack: u16,
    origin: Vec3,
    out: &mut [u8],
) -> Result<usize, SnapshotError> {
    let needed = encoded_size(profile, header.dirty);
    if out.len() < needed {
        return Err(SnapshotError::BufferTooSmall {
            needed,
            available: out.len(),
        });
    }

    let header = SnapshotHeader {
        quant_profile: profile as u8,
        ..*header
    };
    header.write(out);

    let codec = profile.codec();
    let mut at = SNAPSHOT_HEADER_SIZE;
    if header.dirty.contains(DirtyFields::POSITION) {
        (codec.encode_position)(transform.position, origin, &mut out[at..]);
        at += codec.position_size;
    }
    if header.dirty.contains(DirtyFields::ROTATION) {
        (codec.encode_rotation)(transform.rotation, &mut out[at..]);
        at += codec.rotation_size;
    }
    if header.dirty.contains(DirtyFields::VELOCITY) {
        (codec.encode_velocity)(transform.velocity, &mut out[at..]);
        at += codec.velocity_size;
    }
    if header.dirty.contains(DirtyFields::INPUT_ACK) {
        out[at..at + INPUT_ACK_SIZE].copy_from_slice(&input_ack.to_le_bytes());
        at += INPUT_ACK_SIZE;
    }

    Ok(at)
}

/// Decodes one snapshot from the front of `bytes`; returns it with the
/// number of bytes consumed. An unknown profile leaves the body length
/// unknowable, so the caller must drop the rest of the datagram.
pub fn decode_snapshot(bytes: &[u8], origin: Vec3) -> Result<(DecodedSnapshot, usize), SnapshotError> {
    let header = SnapshotHeader::read(bytes)?;
    let profile = QuantProfile::from_u8(header.quant_profile)
        .ok_or(SnapshotError::UnknownProfile(header.quant_profile))?;

    let needed = encoded_size(profile, header.dirty);
    if bytes.len() < needed {
        return Err(SnapshotError::Truncated {
            needed,
            available: bytes.len(),
        });
    }

    let codec = profile.codec();
    let mut at = SNAPSHOT_HEADER_SIZE;
    let mut snapshot = DecodedSnapshot {
        header,
        profile,
        position: None,
        rotation: None,
        velocity: None,
        input_ack: None,
    };

    if header.dirty.contains(DirtyFields::POSITION) {
        snapshot.position = Some((codec.decode_position)(&bytes[at..], origin));
        at += codec.position_size;
    }
    if header.dirty.contains(DirtyFields::ROTATION) {
        snapshot.rotation = Some((codec.decode_rotation)(&bytes[at..]));
        at += codec.rotation_size;
    }
    if header.dirty.contains(DirtyFields::VELOCITY) {
        snapshot.velocity = Some((codec.decode_velocity)(&bytes[at..]));
        at += codec.velocity_size;
    }
    if header.dirty.contains(DirtyFields::INPUT_ACK) {
        snapshot.input_ack = Some(u16::from_le_bytes([bytes[at], bytes[at + 1]]));
        at += INPUT_ACK_SIZE;
    }

    Ok((snapshot, at))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header(dirty: DirtyFields) -> SnapshotHeader {
        SnapshotHeader {
            entity_id: 0x0102,
            generation: 3,
            dirty,
            quant_profile: 0,
            sequence: 9,
        }
    }

    fn sample() -> Transform {
        Transform::new(
            Vec3::new(1.5, -2.25, 3.0),
            Quat::from_rotation_y(0.75),
            Vec3::new(0.5, 0.0, -1.0),
        )
    }

    #[test]
    fn header_is_six_bytes_for_every_profile() {
        for profile in QuantProfile::ALL {
            let mut buf = [0u8; 64];
            let written = encode_snapshot(
                &header(DirtyFields::empty()),
                profile,
                &sample(),
                0,
                Vec3::ZERO,
                &mut buf,
            )
            .unwrap();

            assert_eq!(written, SNAPSHOT_HEADER_SIZE);
            assert_eq!(buf[4], profile as u8);
            assert_eq!(encoded_size(profile, DirtyFields::empty()), 6);
        }
    }

    #[test]
    fn header_layout() {
        let mut buf = [0u8; SNAPSHOT_HEADER_SIZE];
        header(DirtyFields::POSITION | DirtyFields::VELOCITY).write(&mut buf);
        assert_eq!(buf, [0x02, 0x01, 3, 0b101, 0, 9]);
    }

    #[test]
    fn standard_sizes() {
        assert_eq!(encoded_size(QuantProfile::Standard, DirtyFields::POSITION), 12);
        assert_eq!(
            encoded_size(
                QuantProfile::Standard,
                DirtyFields::POSITION | DirtyFields::ROTATION
            ),
            16
        );
        assert_eq!(encoded_size(QuantProfile::None, DirtyFields::TRANSFORM), 46);
    }

    #[test]
    fn delta_roundtrip_with_input_ack() {
        let dirty = DirtyFields::POSITION | DirtyFields::INPUT_ACK;
        let mut buf = [0u8; 64];
        let written = encode_snapshot(
            &header(dirty),
            QuantProfile::Standard,
            &sample(),
            512,
            Vec3::ZERO,
            &mut buf,
        )
        .unwrap();

        let (decoded, consumed) = decode_snapshot(&buf[..written], Vec3::ZERO).unwrap();
        assert_eq!(consumed, written);
        assert_eq!(decoded.input_ack, Some(512));
        assert!(decoded.rotation.is_none());

        let base = Transform::default();
        let merged = decoded.apply_to(&base);
        assert!((merged.position - sample().position).abs().max_element() <= 0.01);
        assert_eq!(merged.rotation, base.rotation);
    }

    #[test]
    fn unknown_profile_rejected() {
        let mut buf = [0u8; 32];
        header(DirtyFields::POSITION).write(&mut buf);
        buf[4] = 7;

        assert_eq!(
            decode_snapshot(&buf, Vec3::ZERO),
            Err(SnapshotError::UnknownProfile(7))
        );
    }

    #[test]
    fn truncated_body_rejected() {
        let mut buf = [0u8; 64];
        let written = encode_snapshot(
            &header(DirtyFields::TRANSFORM),
            QuantProfile::High,
            &sample(),
            0,
            Vec3::ZERO,
            &mut buf,
        )
        .unwrap();

        assert!(matches!(
            decode_snapshot(&buf[..written - 1], Vec3::ZERO),
            Err(SnapshotError::Truncated { .. })
        ));
    }

    #[test]
    fn dirty_fields_between() {
        let a = sample();
        let b = Transform {
            velocity: Vec3::ZERO,
            ..a
        };
        assert_eq!(DirtyFields::between(&a, &b), DirtyFields::VELOCITY);
        assert!(DirtyFields::between(&a, &a).is_empty());
    }
}
