//! Session model.
//!
//! A `Session` is filled in one field at a time by the bootstrap stages and
//! every field is set-once. After the key gathering stage it is frozen into an
//! `Arc<Session>` and only read from then on.

use super::ProtocolError;
use core::fmt;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use zeroize::Zeroizing;

/// Coin network the round operates on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Network {
    #[default]
    Mainnet,
    Testnet,
    Regtest,
}

/// A participant's public verification key, as exchanged with the pool.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VerificationKey(String);

impl VerificationKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Short identifier for log lines: hex of the first 8 bytes of BLAKE3(key).
    pub fn fingerprint(&self) -> String {
        let digest = blake3::hash(self.0.as_bytes());
        hex::encode(&digest.as_bytes()[..8])
    }
}

impl fmt::Display for VerificationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A participant's spending key. Wiped on drop, never printed.
#[derive(Clone)]
pub struct SecretKey(Zeroizing<String>);

impl SecretKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(Zeroizing::new(key.into()))
    }

    pub fn expose(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for SecretKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SecretKey(<redacted>)")
    }
}

/// Opaque session token assigned by the pool.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct SessionId(Vec<u8>);

impl SessionId {
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(&self.0))
    }
}

/// Financial parameters of one mix. Fixed for the lifetime of a session.
#[derive(Debug, Clone)]
pub struct MixParams {
    /// Amount to mix, in the coin's smallest unit.
    pub amount: u64,
    pub fee: u64,
    pub secret_key: SecretKey,
    pub verification_key: VerificationKey,
    /// Where the mixed output goes.
    pub dest_addr: String,
    pub change_addr: String,
}

impl MixParams {
    pub fn validate(&self) -> Result<(), ProtocolError> {
        if self.amount == 0 {
            return Err(ProtocolError::InvalidParameters("amount"));
        }
        if self.fee >= self.amount {
            return Err(ProtocolError::InvalidParameters("fee"));
        }
        if self.verification_key.is_empty() {
            return Err(ProtocolError::InvalidParameters("verification_key"));
        }
        if self.dest_addr.is_empty() {
            return Err(ProtocolError::InvalidParameters("dest_addr"));
        }
        if self.change_addr.is_empty() {
            return Err(ProtocolError::InvalidParameters("change_addr"));
        }
        Ok(())
    }
}

/// One mixing round instance as seen by this participant.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Session {
    session_id: SessionId,
    player_number: Option<u32>,
    player_count: Option<u32>,
    players: BTreeMap<u32, VerificationKey>,
}

impl Session {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    pub fn player_number(&self) -> Option<u32> {
        self.player_number
    }

    pub fn player_count(&self) -> Option<u32> {
        self.player_count
    }

    pub fn players(&self) -> &BTreeMap<u32, VerificationKey> {
        &self.players
    }

    /// Records the registration reply.
    pub fn assign(&mut self, session_id: SessionId, player_number: u32) -> Result<(), ProtocolError> {
        if !self.session_id.is_empty() || self.player_number.is_some() {
            return Err(ProtocolError::AlreadyAssigned);
        }
        if session_id.is_empty() {
            return Err(ProtocolError::RegistrationRejected);
        }
        self.session_id = session_id;
        self.player_number = Some(player_number);
        Ok(())
    }

    /// Records the announced roster size.
    pub fn set_player_count(&mut self, count: u32) -> Result<(), ProtocolError> {
        if self.player_count.is_some() {
            return Err(ProtocolError::AlreadyAssigned);
        }
        if count == 0 {
            return Err(ProtocolError::EmptyRoster);
        }
        self.player_count = Some(count);
        Ok(())
    }

    /// Installs the gathered roster.
    ///
    /// The roster must hold exactly `player_count` players with pairwise
    /// distinct keys; otherwise nothing is stored and the violation is
    /// returned.
    pub fn set_players(&mut self, players: BTreeMap<u32, VerificationKey>) -> Result<(), ProtocolError> {
        if !self.players.is_empty() {
            return Err(ProtocolError::AlreadyAssigned);
        }
        let expected = self
            .player_count
            .ok_or(ProtocolError::IncompleteSession("player count"))?;

        let distinct = distinct_keys(&players) as u32;
        if distinct as usize != players.len() {
            return Err(ProtocolError::DuplicateKeys { expected, distinct });
        }
        if players.len() != expected as usize {
            return Err(ProtocolError::RosterMismatch {
                expected,
                received: players.len() as u32,
            });
        }

        self.players = players;
        Ok(())
    }

    /// True once every field has been populated.
    pub fn is_complete(&self) -> bool {
        !self.session_id.is_empty()
            && self.player_number.is_some()
            && self.player_count.is_some()
            && !self.players.is_empty()
    }
}

/// Number of distinct keys in a roster.
pub fn distinct_keys(players: &BTreeMap<u32, VerificationKey>) -> usize {
    players.values().collect::<HashSet<_>>().len()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roster(keys: &[&str]) -> BTreeMap<u32, VerificationKey> {
        keys.iter()
            .enumerate()
            .map(|(i, k)| (i as u32 + 1, VerificationKey::new(*k)))
            .collect()
    }

    fn params() -> MixParams {
        MixParams {
            amount: 100_000,
            fee: 1_000,
            secret_key: SecretKey::new("sk"),
            verification_key: VerificationKey::new("vk"),
            dest_addr: "dest".into(),
            change_addr: "change".into(),
        }
    }

    #[test]
    fn test_fields_are_set_once() {
        let mut session = Session::new();
        session.assign(SessionId::new(b"abc".to_vec()), 2).unwrap();
        assert_eq!(
            session.assign(SessionId::new(b"xyz".to_vec()), 3),
            Err(ProtocolError::AlreadyAssigned)
        );
        assert_eq!(session.player_number(), Some(2));

        session.set_player_count(3).unwrap();
        assert_eq!(session.set_player_count(4), Err(ProtocolError::AlreadyAssigned));

        session.set_players(roster(&["a", "b", "c"])).unwrap();
        assert_eq!(
            session.set_players(roster(&["d", "e", "f"])),
            Err(ProtocolError::AlreadyAssigned)
        );
        assert!(session.is_complete());
    }

    #[test]
    fn test_empty_session_id_rejected() {
        let mut session = Session::new();
        assert_eq!(
            session.assign(SessionId::default(), 1),
            Err(ProtocolError::RegistrationRejected)
        );
        assert_eq!(session.player_number(), None);
    }

    #[test]
    fn test_duplicate_keys_detected() {
        let mut session = Session::new();
        session.set_player_count(3).unwrap();

        let err = session.set_players(roster(&["a", "b", "a"])).unwrap_err();
        assert_eq!(err, ProtocolError::DuplicateKeys { expected: 3, distinct: 2 });
        assert!(err.is_violation());
        assert!(session.players().is_empty());
    }

    #[test]
    fn test_roster_size_must_match() {
        let mut session = Session::new();
        session.set_player_count(3).unwrap();
        assert_eq!(
            session.set_players(roster(&["a", "b"])),
            Err(ProtocolError::RosterMismatch { expected: 3, received: 2 })
        );
    }

    #[test]
    fn test_players_need_player_count() {
        let mut session = Session::new();
        assert_eq!(
            session.set_players(roster(&["a"])),
            Err(ProtocolError::IncompleteSession("player count"))
        );
        assert_eq!(session.set_player_count(0), Err(ProtocolError::EmptyRoster));
    }

    #[test]
    fn test_fingerprint_is_stable_and_short() {
        let key = VerificationKey::new("02abcdef");
        assert_eq!(key.fingerprint().len(), 16);
        assert_eq!(key.fingerprint(), VerificationKey::new("02abcdef").fingerprint());
        assert_ne!(key.fingerprint(), VerificationKey::new("02abcdee").fingerprint());
    }

    #[test]
    fn test_mix_params_validation() {
        assert!(params().validate().is_ok());

        let mut p = params();
        p.fee = p.amount;
        assert_eq!(p.validate(), Err(ProtocolError::InvalidParameters("fee")));

        let mut p = params();
        p.verification_key = VerificationKey::new("");
        assert_eq!(p.validate(), Err(ProtocolError::InvalidParameters("verification_key")));
    }

    #[test]
    fn test_secret_key_is_redacted() {
        let sk = SecretKey::new("very secret");
        assert_eq!(format!("{:?}", sk), "SecretKey(<redacted>)");
        assert_eq!(sk.expose(), "very secret");
    }
}
