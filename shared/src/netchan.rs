//! Sequenced channel between a connected client and the server
//!
//! Every channel packet starts with a little-endian `i32` sequence number.
//! Packets from the client additionally carry a 16-bit qport so the server
//! can recognise a client whose NAT rewrote its source port. Duplicated and
//! out-of-order packets are discarded; gaps are counted as drops.

use crate::address::NetAddress;
use crate::error::ProtocolError;
use log::trace;

const SEQUENCE_LEN: usize = 4;
const QPORT_LEN: usize = 2;

/// Which end of the connection owns the channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetSource {
    Client,
    Server,
}

#[derive(Debug, Clone)]
pub struct NetChan {
    pub source: NetSource,
    pub remote: NetAddress,
    pub qport: u16,
    /// Sequence of the last packet accepted from the remote end
    pub incoming_sequence: i32,
    /// Sequence the next outgoing packet will carry
    pub outgoing_sequence: i32,
    /// Packets lost before the last accepted one
    pub dropped: i32,
}

impl NetChan {
    pub fn new(source: NetSource, remote: NetAddress, qport: u16) -> Self {
        Self {
            source,
            remote,
            qport,
            incoming_sequence: 0,
            outgoing_sequence: 1,
            dropped: 0,
        }
    }

    fn header_len(source: NetSource) -> usize {
        match source {
            NetSource::Client => SEQUENCE_LEN + QPORT_LEN,
            NetSource::Server => SEQUENCE_LEN,
        }
    }

    /// Frames `payload` with the next outgoing sequence number
    pub fn transmit(&mut self, payload: &[u8]) -> Vec<u8> {
        let mut packet = Vec::with_capacity(Self::header_len(self.source) + payload.len());
        packet.extend_from_slice(&self.outgoing_sequence.to_le_bytes());
        if self.source == NetSource::Client {
            packet.extend_from_slice(&self.qport.to_le_bytes());
        }
        packet.extend_from_slice(payload);
        self.outgoing_sequence = self.outgoing_sequence.wrapping_add(1);
        packet
    }

    /// Validates a packet from the remote end and returns its payload
    ///
    /// `Ok(None)` means the packet was stale or duplicated and must be ignored.
    pub fn process<'a>(&mut self, packet: &'a [u8]) -> Result<Option<&'a [u8]>, ProtocolError> {
        let remote_source = match self.source {
            NetSource::Client => NetSource::Server,
            NetSource::Server => NetSource::Client,
        };
        let header_len = Self::header_len(remote_source);
        let sequence = read_sequence(packet)?;
        if packet.len() < header_len {
            return Err(ProtocolError::Truncated {
                len: packet.len(),
                needed: header_len,
            });
        }

        if sequence.wrapping_sub(self.incoming_sequence) <= 0 {
            trace!(
                "{}: out of order packet {} at {}",
                self.remote,
                sequence,
                self.incoming_sequence
            );
            return Ok(None);
        }

        self.dropped = sequence.wrapping_sub(self.incoming_sequence.wrapping_add(1));
        if self.dropped > 0 {
            trace!("{}: dropped {} packets at {}", self.remote, self.dropped, sequence);
        }
        self.incoming_sequence = sequence;

        Ok(Some(&packet[header_len..]))
    }
}

pub fn read_sequence(packet: &[u8]) -> Result<i32, ProtocolError> {
    let bytes: [u8; SEQUENCE_LEN] = packet
        .get(..SEQUENCE_LEN)
        .and_then(|b| b.try_into().ok())
        .ok_or(ProtocolError::Truncated {
            len: packet.len(),
            needed: SEQUENCE_LEN,
        })?;
    Ok(i32::from_le_bytes(bytes))
}

/// Reads the qport of a client-to-server packet without consuming it
pub fn read_qport(packet: &[u8]) -> Result<u16, ProtocolError> {
    let bytes: [u8; QPORT_LEN] = packet
        .get(SEQUENCE_LEN..SEQUENCE_LEN + QPORT_LEN)
        .and_then(|b| b.try_into().ok())
        .ok_or(ProtocolError::Truncated {
            len: packet.len(),
            needed: SEQUENCE_LEN + QPORT_LEN,
        })?;
    Ok(u16::from_le_bytes(bytes))
}
