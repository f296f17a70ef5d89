//! Out-of-band (connectionless) packet framing
//!
//! An out-of-band packet starts with four `0xFF` bytes followed by ASCII
//! text. Anything else on the wire is a sequenced channel packet.

pub const OOB_MARKER: [u8; 4] = [0xFF; 4];

/// A datagram as seen by the dispatcher
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Datagram<'a> {
    OutOfBand(String),
    Sequenced(&'a [u8]),
}

/// Frames `text` as an out-of-band packet
pub fn encode(text: &str) -> Vec<u8> {
    let mut packet = Vec::with_capacity(OOB_MARKER.len() + text.len());
    packet.extend_from_slice(&OOB_MARKER);
    packet.extend_from_slice(text.as_bytes());
    packet
}

pub fn is_oob(data: &[u8]) -> bool {
    data.len() >= OOB_MARKER.len() && data[..OOB_MARKER.len()] == OOB_MARKER
}

/// Splits a raw datagram into its out-of-band text or channel payload
pub fn classify(data: &[u8]) -> Datagram<'_> {
    if is_oob(data) {
        let text = String::from_utf8_lossy(&data[OOB_MARKER.len()..]);
        Datagram::OutOfBand(text.trim_end_matches('\0').to_string())
    } else {
        Datagram::Sequenced(data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_prefixes_marker() {
        let packet = encode("getchallenge");
        assert_eq!(&packet[..4], &[0xFF, 0xFF, 0xFF, 0xFF]);
        assert_eq!(&packet[4..], b"getchallenge");
    }

    #[test]
    fn test_classify() {
        assert_eq!(
            classify(&encode("ping")),
            Datagram::OutOfBand("ping".to_string())
        );

        let channel = [1u8, 0, 0, 0, 9, 9];
        assert_eq!(classify(&channel), Datagram::Sequenced(&channel[..]));
        assert_eq!(classify(&[0xFF, 0xFF]), Datagram::Sequenced(&[0xFF, 0xFF][..]));
    }
}
