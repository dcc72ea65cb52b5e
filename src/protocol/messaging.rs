//! Pool Messaging.
//!
//! Defines the packets exchanged with the pool and their wire encoding.
//!
//! # Wire format
//! A packet collection is a plain concatenation of entries:
//!
//! ```text
//! entry := body_len:u32be body
//! body  := phase:u8 number:u32be amount:u64be
//!          session_len:u16be session
//!          key_len:u16be key(utf-8)
//! ```
//!
//! Because there is no collection header, several serialized collections
//! joined together parse as one collection. Key gathering relies on this.

use super::session::{SessionId, VerificationKey};
use core::fmt;

/// Largest accepted entry body.
pub const MAX_ENTRY_LEN: usize = 64 * 1024;

const FIXED_BODY_LEN: usize = 1 + 4 + 8 + 2 + 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodecError {
    /// Input ended in the middle of an entry.
    Truncated,
    /// Entry or field longer than the format allows.
    Oversized,
    /// Phase tag not known to this client.
    UnknownPhase(u8),
    /// Key bytes are not valid UTF-8.
    InvalidKey,
    /// Entry length disagrees with its fields.
    Malformed,
}

impl fmt::Display for CodecError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CodecError::Truncated => write!(f, "Packet truncated"),
            CodecError::Oversized => write!(f, "Packet field too large"),
            CodecError::UnknownPhase(tag) => write!(f, "Unknown phase tag {}", tag),
            CodecError::InvalidKey => write!(f, "Verification key is not valid UTF-8"),
            CodecError::Malformed => write!(f, "Malformed packet entry"),
        }
    }
}

impl std::error::Error for CodecError {}

/// Protocol phases as tagged by the pool.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    /// Registration traffic and join notifications.
    None = 0,
    /// Pool closed registration and announces the roster size.
    Announcement = 1,
    Shuffle = 2,
    Broadcast = 3,
    EquivocationCheck = 4,
    Signing = 5,
    VerificationAndSubmission = 6,
    Blame = 7,
}

impl TryFrom<u8> for Phase {
    type Error = CodecError;

    fn try_from(tag: u8) -> Result<Self, Self::Error> {
        match tag {
            0 => Ok(Self::None),
            1 => Ok(Self::Announcement),
            2 => Ok(Self::Shuffle),
            3 => Ok(Self::Broadcast),
            4 => Ok(Self::EquivocationCheck),
            5 => Ok(Self::Signing),
            6 => Ok(Self::VerificationAndSubmission),
            7 => Ok(Self::Blame),
            other => Err(CodecError::UnknownPhase(other)),
        }
    }
}

impl From<Phase> for u8 {
    fn from(phase: Phase) -> Self {
        phase as u8
    }
}

/// One packet entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub phase: Phase,
    /// Player ordinal, or the roster size in an announcement.
    pub number: u32,
    pub session: SessionId,
    pub from_key: VerificationKey,
    pub amount: u64,
}

impl Packet {
    /// Entry with the given phase and number and every other field empty.
    pub fn new(phase: Phase, number: u32) -> Self {
        Self {
            phase,
            number,
            ..Self::blank()
        }
    }

    fn blank() -> Self {
        Self {
            phase: Phase::None,
            number: 0,
            session: SessionId::default(),
            from_key: VerificationKey::new(""),
            amount: 0,
        }
    }

    fn encode_into(&self, out: &mut Vec<u8>) -> Result<(), CodecError> {
        let session = self.session.as_bytes();
        let key = self.from_key.as_str().as_bytes();
        if session.len() > u16::MAX as usize || key.len() > u16::MAX as usize {
            return Err(CodecError::Oversized);
        }
        let body_len = FIXED_BODY_LEN + session.len() + key.len();
        if body_len > MAX_ENTRY_LEN {
            return Err(CodecError::Oversized);
        }

        out.extend_from_slice(&(body_len as u32).to_be_bytes());
        out.push(self.phase.into());
        out.extend_from_slice(&self.number.to_be_bytes());
        out.extend_from_slice(&self.amount.to_be_bytes());
        out.extend_from_slice(&(session.len() as u16).to_be_bytes());
        out.extend_from_slice(session);
        out.extend_from_slice(&(key.len() as u16).to_be_bytes());
        out.extend_from_slice(key);
        Ok(())
    }

    fn decode(body: &[u8]) -> Result<Self, CodecError> {
        let mut reader = Reader { buf: body, pos: 0 };
        let phase = Phase::try_from(reader.u8()?)?;
        let number = u32::from_be_bytes(reader.array()?);
        let amount = u64::from_be_bytes(reader.array()?);
        let session_len = u16::from_be_bytes(reader.array()?) as usize;
        let session = SessionId::new(reader.take(session_len)?.to_vec());
        let key_len = u16::from_be_bytes(reader.array()?) as usize;
        let key = core::str::from_utf8(reader.take(key_len)?).map_err(|_| CodecError::InvalidKey)?;
        if reader.pos != body.len() {
            return Err(CodecError::Malformed);
        }

        Ok(Self {
            phase,
            number,
            session,
            from_key: VerificationKey::new(key),
            amount,
        })
    }
}

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8], CodecError> {
        let end = self.pos.checked_add(n).ok_or(CodecError::Malformed)?;
        if end > self.buf.len() {
            return Err(CodecError::Malformed);
        }
        let slice = &self.buf[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn u8(&mut self) -> Result<u8, CodecError> {
        Ok(self.take(1)?[0])
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N], CodecError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }
}

/// Mutable packet collection: the unit sent to and received from the pool.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Messages {
    packets: Vec<Packet>,
}

impl Messages {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn clear(&mut self) {
        self.packets.clear();
    }

    pub fn entries(&self) -> &[Packet] {
        &self.packets
    }

    pub fn len(&self) -> usize {
        self.packets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.packets.is_empty()
    }

    pub fn push(&mut self, packet: Packet) {
        self.packets.push(packet);
    }

    pub fn last(&self) -> Option<&Packet> {
        self.packets.last()
    }

    /// Replaces the collection with a single registration greeting.
    pub fn make_greeting(&mut self, key: &VerificationKey, amount: u64) {
        self.clear();
        self.packets.push(Packet {
            from_key: key.clone(),
            amount,
            ..Packet::blank()
        });
    }

    /// Appends an entry announcing our verification key to the session.
    pub fn add_key_share(&mut self, key: &VerificationKey, session: &SessionId, number: u32) {
        self.packets.push(Packet {
            number,
            session: session.clone(),
            from_key: key.clone(),
            ..Packet::blank()
        });
    }

    pub fn serialize(&self) -> Result<Vec<u8>, CodecError> {
        let mut out = Vec::new();
        for packet in &self.packets {
            packet.encode_into(&mut out)?;
        }
        Ok(out)
    }

    /// Replaces the collection with the entries decoded from `bytes`.
    ///
    /// On error the collection is left empty.
    pub fn parse(&mut self, bytes: &[u8]) -> Result<(), CodecError> {
        self.clear();
        let mut packets = Vec::new();
        let mut pos = 0;
        while pos < bytes.len() {
            if bytes.len() - pos < 4 {
                return Err(CodecError::Truncated);
            }
            let mut len = [0u8; 4];
            len.copy_from_slice(&bytes[pos..pos + 4]);
            let body_len = u32::from_be_bytes(len) as usize;
            if body_len > MAX_ENTRY_LEN {
                return Err(CodecError::Oversized);
            }
            pos += 4;
            if bytes.len() - pos < body_len {
                return Err(CodecError::Truncated);
            }
            packets.push(Packet::decode(&bytes[pos..pos + body_len])?);
            pos += body_len;
        }
        self.packets = packets;
        Ok(())
    }

    /// Phase of the most recent entry.
    pub fn phase(&self) -> Option<Phase> {
        self.packets.last().map(|p| p.phase)
    }

    /// Number of the most recent entry.
    pub fn number(&self) -> Option<u32> {
        self.packets.last().map(|p| p.number)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(s: &str) -> VerificationKey {
        VerificationKey::new(s)
    }

    fn single(phase: Phase, number: u32) -> Vec<u8> {
        let mut m = Messages::new();
        m.push(Packet { phase, number, ..Packet::blank() });
        m.serialize().unwrap()
    }

    #[test]
    fn test_greeting_layout() {
        let mut m = Messages::new();
        m.make_greeting(&key("vk"), 0x0102);
        let bytes = m.serialize().unwrap();

        // len(4) + phase(1) + number(4) + amount(8) + session_len(2) + key_len(2) + "vk"
        assert_eq!(bytes.len(), 4 + FIXED_BODY_LEN + 2);
        assert_eq!(&bytes[..4], &(19u32).to_be_bytes());
        assert_eq!(bytes[4], 0);
        assert_eq!(&bytes[9..17], &0x0102u64.to_be_bytes());
        assert_eq!(&bytes[bytes.len() - 2..], b"vk");
    }

    #[test]
    fn test_phase_and_number_track_last_entry() {
        let mut m = Messages::new();
        assert_eq!(m.phase(), None);
        assert_eq!(m.number(), None);

        let mut bytes = single(Phase::None, 4);
        bytes.extend(single(Phase::Announcement, 3));
        m.parse(&bytes).unwrap();

        assert_eq!(m.len(), 2);
        assert_eq!(m.phase(), Some(Phase::Announcement));
        assert_eq!(m.number(), Some(3));
    }

    #[test]
    fn test_concatenated_collections_parse_as_one() {
        let session = SessionId::new(b"s1".to_vec());
        let mut wire = Vec::new();
        for (n, k) in [(1, "a"), (2, "b"), (3, "c")] {
            let mut m = Messages::new();
            m.add_key_share(&key(k), &session, n);
            wire.extend(m.serialize().unwrap());
        }

        let mut m = Messages::new();
        m.parse(&wire).unwrap();
        let got: Vec<_> = m.entries().iter().map(|p| (p.number, p.from_key.as_str())).collect();
        assert_eq!(got, vec![(1, "a"), (2, "b"), (3, "c")]);
        assert!(m.entries().iter().all(|p| p.session == session));
    }

    #[test]
    fn test_empty_input_is_empty_collection() {
        let mut m = Messages::new();
        m.make_greeting(&key("vk"), 1);
        m.parse(&[]).unwrap();
        assert!(m.is_empty());
    }

    #[test]
    fn test_malformed_inputs() {
        let mut m = Messages::new();

        let good = single(Phase::Shuffle, 1);
        assert_eq!(m.parse(&good[..good.len() - 1]), Err(CodecError::Truncated));
        assert_eq!(m.parse(&good[..3]), Err(CodecError::Truncated));
        assert!(m.is_empty());

        let mut bad_phase = good.clone();
        bad_phase[4] = 42;
        assert_eq!(m.parse(&bad_phase), Err(CodecError::UnknownPhase(42)));

        let huge = ((MAX_ENTRY_LEN + 1) as u32).to_be_bytes();
        assert_eq!(m.parse(&huge), Err(CodecError::Oversized));

        // Body longer than its fields claim.
        let mut padded = single(Phase::None, 0);
        padded.push(0);
        let body_len = (padded.len() - 4) as u32;
        padded[..4].copy_from_slice(&body_len.to_be_bytes());
        assert_eq!(m.parse(&padded), Err(CodecError::Malformed));
    }

    #[test]
    fn test_invalid_utf8_key() {
        let mut bytes = Messages::new();
        bytes.make_greeting(&key("ab"), 1);
        let mut wire = bytes.serialize().unwrap();
        let n = wire.len();
        wire[n - 1] = 0xff;

        let mut m = Messages::new();
        assert_eq!(m.parse(&wire), Err(CodecError::InvalidKey));
    }

    #[test]
    fn test_phase_tags() {
        assert_eq!(Phase::try_from(1u8), Ok(Phase::Announcement));
        assert_eq!(u8::from(Phase::Blame), 7);
        assert_eq!(Phase::try_from(8u8), Err(CodecError::UnknownPhase(8)));
    }
}
