use super::peer::PeerId;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("packet codec failed: {0}")]
pub struct CodecError(pub String);

/// Transforms datagram bodies on their way to and from the wire, e.g. for
/// encryption. Headers stay in the clear so validation can run first; sealed
/// bodies are flagged in the header. `peer` is the client's id on both ends
/// of a link, and [`PeerId::UNASSIGNED`] during the handshake.
pub trait PacketCodec {
    /// Appends the sealed form of `body` to `out`.
    fn seal(&mut self, peer: PeerId, body: &[u8], out: &mut Vec<u8>) -> Result<(), CodecError>;

    /// Appends the opened form of `body` to `out`.
    fn open(&mut self, peer: PeerId, body: &[u8], out: &mut Vec<u8>) -> Result<(), CodecError>;

    /// Bytes `seal` adds on top of the body, e.g. a nonce and tag. Snapshot
    /// packing leaves this much room in every datagram. Must not change once
    /// the codec is installed.
    fn overhead(&self) -> usize {
        0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Rot13;

    impl PacketCodec for Rot13 {
        fn seal(&mut self, _peer: PeerId, body: &[u8], out: &mut Vec<u8>) -> Result<(), CodecError> {
            out.extend(body.iter().map(|b| b.wrapping_add(13)));
            Ok(())
        }

        fn open(&mut self, _peer: PeerId, body: &[u8], out: &mut Vec<u8>) -> Result<(), CodecError> {
            out.extend(body.iter().map(|b| b.wrapping_sub(13)));
            Ok(())
        }
    }

    struct Tagged;

    impl PacketCodec for Tagged {
        fn seal(&mut self, _peer: PeerId, body: &[u8], out: &mut Vec<u8>) -> Result<(), CodecError> {
            out.extend_from_slice(body);
            out.extend_from_slice(&[0xA5; 16]);
            Ok(())
        }

        fn open(&mut self, _peer: PeerId, body: &[u8], out: &mut Vec<u8>) -> Result<(), CodecError> {
            let Some(len) = body.len().checked_sub(16) else {
                return Err(CodecError("short".to_owned()));
            };
            out.extend_from_slice(&body[..len]);
            Ok(())
        }

        fn overhead(&self) -> usize {
            16
        }
    }

    #[test]
    fn overhead_defaults_to_zero() {
        assert_eq!(Rot13.overhead(), 0);
    }

    #[test]
    fn sealed_size_matches_overhead() {
        let mut codec = Tagged;
        let mut sealed = Vec::new();
        codec.seal(PeerId(2), b"snapshot", &mut sealed).unwrap();
        assert_eq!(sealed.len(), b"snapshot".len() + codec.overhead());
    }

    #[test]
    fn codec_appends_after_existing_bytes() {
        let mut codec = Rot13;
        let mut sealed = vec![0xAA];
        codec.seal(PeerId(1), b"abc", &mut sealed).unwrap();
        assert_eq!(sealed.len(), 4);
        assert_eq!(sealed[0], 0xAA);

        let mut opened = Vec::new();
        codec.open(PeerId(1), &sealed[1..], &mut opened).unwrap();
        assert_eq!(opened, b"abc");
    }
}
