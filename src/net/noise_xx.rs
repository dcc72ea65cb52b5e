use crate::net::NetError;
use blake3::Hasher;
use chacha20poly1305::aead::{Aead, KeyInit, Payload};
use chacha20poly1305::ChaCha20Poly1305;
use core::fmt;
use rand_core::OsRng;
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::{Zeroize, Zeroizing};

const PROTOCOL_NAME: &[u8] = b"Noise_XX_25519_ChaChaPoly_BLAKE3";
const PROLOGUE: &[u8] = b"mixpool/1";
const DH_LEN: usize = 32;
const TAG_LEN: usize = 16;

/// Which side of the handshake this state drives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// The client connecting to the pool.
    Initiator,
    /// The pool server.
    Responder,
}

/// One direction of an established session: a key and a message counter.
pub struct CipherState {
    cipher: ChaCha20Poly1305,
    nonce: u64,
}

impl CipherState {
    fn new(key: &[u8; 32]) -> Self {
        let key = chacha20poly1305::Key::from_slice(key);
        Self {
            cipher: ChaCha20Poly1305::new(key),
            nonce: 0,
        }
    }

    fn next_nonce(&mut self) -> Result<[u8; 12], NetError> {
        if self.nonce == u64::MAX {
            return Err(NetError::NonceExhausted);
        }
        // 96-bit nonce: 32 zero bits followed by the little-endian counter
        let mut nonce_bytes = [0u8; 12];
        nonce_bytes[4..].copy_from_slice(&self.nonce.to_le_bytes());
        self.nonce += 1;
        Ok(nonce_bytes)
    }

    fn encrypt_with_ad(&mut self, ad: &[u8], plaintext: &[u8]) -> Result<Vec<u8>, NetError> {
        let nonce_bytes = self.next_nonce()?;
        let nonce = chacha20poly1305::Nonce::from_slice(&nonce_bytes);
        self.cipher
            .encrypt(nonce, Payload { msg: plaintext, aad: ad })
            .map_err(|_| NetError::EncryptionError)
    }

    fn decrypt_with_ad(&mut self, ad: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>, NetError> {
        let nonce_bytes = self.next_nonce()?;
        let nonce = chacha20poly1305::Nonce::from_slice(&nonce_bytes);
        self.cipher
            .decrypt(nonce, Payload { msg: ciphertext, aad: ad })
            .map_err(|_| NetError::DecryptionError)
    }

    /// Encrypts one transport message.
    pub fn encrypt(&mut self, plaintext: &[u8]) -> Result<Vec<u8>, NetError> {
        self.encrypt_with_ad(&[], plaintext)
    }

    /// Decrypts one transport message. Messages must arrive in send order.
    pub fn decrypt(&mut self, ciphertext: &[u8]) -> Result<Vec<u8>, NetError> {
        self.decrypt_with_ad(&[], ciphertext)
    }
}

impl fmt::Debug for CipherState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CipherState").field("nonce", &self.nonce).finish_non_exhaustive()
    }
}

/// Keys of an established session, one `CipherState` per direction so the
/// reader and writer threads can each own theirs.
#[derive(Debug)]
pub struct NoiseTransport {
    pub sender: CipherState,
    pub receiver: CipherState,
    pub remote_static: PublicKey,
}

/// Noise_XX_25519_ChaChaPoly_BLAKE3 handshake.
///
/// Handshake Pattern:
///   -> e
///   <- e, ee, s, es
///   -> s, se
pub struct HandshakeState {
    role: Role,
    step: u8,
    static_priv: StaticSecret,
    static_pub: PublicKey,
    ephemeral_priv: Option<StaticSecret>,
    remote_ephemeral: Option<PublicKey>,
    remote_static: Option<PublicKey>,
    handshake_hash: [u8; 32],
    chaining_key: Zeroizing<[u8; 32]>,
    cipher: Option<CipherState>,
}

impl Drop for HandshakeState {
    fn drop(&mut self) {
        self.handshake_hash.zeroize();
        // static and ephemeral secrets are zeroized by x25519_dalek on drop
    }
}

impl HandshakeState {
    fn new(role: Role, static_priv: StaticSecret) -> Self {
        let static_pub = PublicKey::from(&static_priv);
        let mut hasher = Hasher::new();
        hasher.update(PROTOCOL_NAME);
        let h = *hasher.finalize().as_bytes();

        let mut state = Self {
            role,
            step: 0,
            static_priv,
            static_pub,
            ephemeral_priv: None,
            remote_ephemeral: None,
            remote_static: None,
            handshake_hash: h,
            chaining_key: Zeroizing::new(h),
            cipher: None,
        };
        state.mix_hash(PROLOGUE);
        state
    }

    pub fn initiator(static_priv: StaticSecret) -> Self {
        Self::new(Role::Initiator, static_priv)
    }

    pub fn responder(static_priv: StaticSecret) -> Self {
        Self::new(Role::Responder, static_priv)
    }

    /// Fresh static identity for a single connection.
    pub fn generate_static() -> StaticSecret {
        StaticSecret::random_from_rng(OsRng)
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn local_static(&self) -> PublicKey {
        self.static_pub
    }

    pub fn remote_static(&self) -> Option<PublicKey> {
        self.remote_static
    }

    /// True when the next handshake step is ours to write.
    pub fn is_write_turn(&self) -> bool {
        match self.role {
            Role::Initiator => self.step == 0 || self.step == 2,
            Role::Responder => self.step == 1,
        }
    }

    pub fn is_finished(&self) -> bool {
        self.step >= 3
    }

    /// Produces the next handshake message.
    pub fn write_message(&mut self) -> Result<Vec<u8>, NetError> {
        if !self.is_write_turn() || self.is_finished() {
            return Err(NetError::HandshakeFailed);
        }
        let mut msg = Vec::new();
        match self.step {
            0 => {
                // -> e
                let e_pub = self.generate_ephemeral();
                self.mix_hash(e_pub.as_bytes());
                msg.extend_from_slice(e_pub.as_bytes());
                msg.extend_from_slice(&self.encrypt_and_hash(&[])?);
            }
            1 => {
                // <- e, ee, s, es
                let e_pub = self.generate_ephemeral();
                self.mix_hash(e_pub.as_bytes());
                msg.extend_from_slice(e_pub.as_bytes());

                let re = self.remote_ephemeral.ok_or(NetError::HandshakeFailed)?;
                let ee = self.dh_ephemeral(&re)?;
                self.mix_key(&ee);

                let s_bytes = *self.static_pub.as_bytes();
                msg.extend_from_slice(&self.encrypt_and_hash(&s_bytes)?);

                let es = Zeroizing::new(*self.static_priv.diffie_hellman(&re).as_bytes());
                self.mix_key(&es);

                msg.extend_from_slice(&self.encrypt_and_hash(&[])?);
            }
            _ => {
                // -> s, se
                let s_bytes = *self.static_pub.as_bytes();
                msg.extend_from_slice(&self.encrypt_and_hash(&s_bytes)?);

                let re = self.remote_ephemeral.ok_or(NetError::HandshakeFailed)?;
                let se = Zeroizing::new(*self.static_priv.diffie_hellman(&re).as_bytes());
                self.mix_key(&se);

                msg.extend_from_slice(&self.encrypt_and_hash(&[])?);
            }
        }
        self.step += 1;
        Ok(msg)
    }

    /// Consumes the peer's next handshake message.
    pub fn read_message(&mut self, msg: &[u8]) -> Result<(), NetError> {
        if self.is_write_turn() || self.is_finished() {
            return Err(NetError::HandshakeFailed);
        }
        match self.step {
            0 => {
                // -> e
                let re = read_key(msg, 0)?;
                self.mix_hash(re.as_bytes());
                self.remote_ephemeral = Some(re);
                self.decrypt_and_hash(&msg[DH_LEN..])?;
            }
            1 => {
                // <- e, ee, s, es
                let re = read_key(msg, 0)?;
                self.mix_hash(re.as_bytes());
                self.remote_ephemeral = Some(re);

                let ee = self.dh_ephemeral(&re)?;
                self.mix_key(&ee);

                let s_end = DH_LEN + DH_LEN + TAG_LEN;
                if msg.len() < s_end {
                    return Err(NetError::HandshakeFailed);
                }
                let s_bytes = self.decrypt_and_hash(&msg[DH_LEN..s_end])?;
                let rs = read_key(&s_bytes, 0)?;
                self.remote_static = Some(rs);

                let es = self.dh_ephemeral(&rs)?;
                self.mix_key(&es);

                self.decrypt_and_hash(&msg[s_end..])?;
            }
            _ => {
                // -> s, se
                let s_end = DH_LEN + TAG_LEN;
                if msg.len() < s_end {
                    return Err(NetError::HandshakeFailed);
                }
                let s_bytes = self.decrypt_and_hash(&msg[..s_end])?;
                let rs = read_key(&s_bytes, 0)?;
                self.remote_static = Some(rs);

                let se = self.dh_ephemeral(&rs)?;
                self.mix_key(&se);

                self.decrypt_and_hash(&msg[s_end..])?;
            }
        }
        self.step += 1;
        Ok(())
    }

    /// Splits the finished handshake into per-direction transport ciphers.
    pub fn into_transport(self) -> Result<NoiseTransport, NetError> {
        if !self.is_finished() {
            return Err(NetError::HandshakeFailed);
        }
        let remote_static = self.remote_static.ok_or(NetError::HandshakeFailed)?;

        let k1 = Zeroizing::new(self.derive(b"split_key_1"));
        let k2 = Zeroizing::new(self.derive(b"split_key_2"));
        let (send_key, recv_key) = match self.role {
            Role::Initiator => (&k1, &k2),
            Role::Responder => (&k2, &k1),
        };

        Ok(NoiseTransport {
            sender: CipherState::new(send_key),
            receiver: CipherState::new(recv_key),
            remote_static,
        })
    }

    // Helpers
    fn generate_ephemeral(&mut self) -> PublicKey {
        let ephemeral_priv = StaticSecret::random_from_rng(OsRng);
        let ephemeral_pub = PublicKey::from(&ephemeral_priv);
        self.ephemeral_priv = Some(ephemeral_priv);
        ephemeral_pub
    }

    fn dh_ephemeral(&self, remote: &PublicKey) -> Result<Zeroizing<[u8; 32]>, NetError> {
        let ephemeral_priv = self.ephemeral_priv.as_ref().ok_or(NetError::HandshakeFailed)?;
        Ok(Zeroizing::new(*ephemeral_priv.diffie_hellman(remote).as_bytes()))
    }

    fn derive(&self, label: &[u8]) -> [u8; 32] {
        let mut hasher = Hasher::new();
        hasher.update(&*self.chaining_key);
        hasher.update(label);
        *hasher.finalize().as_bytes()
    }

    fn mix_hash(&mut self, data: &[u8]) {
        let mut hasher = Hasher::new();
        hasher.update(&self.handshake_hash);
        hasher.update(data);
        self.handshake_hash = *hasher.finalize().as_bytes();
    }

    fn mix_key(&mut self, input_key_material: &[u8; 32]) {
        // BLAKE3 with domain separation stands in for HKDF(ck, ikm, 2)
        let mut hasher_ck = Hasher::new();
        hasher_ck.update(&*self.chaining_key);
        hasher_ck.update(input_key_material);
        hasher_ck.update(b"chaining_key");
        self.chaining_key = Zeroizing::new(*hasher_ck.finalize().as_bytes());

        let mut hasher_k = Hasher::new();
        hasher_k.update(&*self.chaining_key);
        hasher_k.update(input_key_material);
        hasher_k.update(b"encryption_key");
        let temp_k = Zeroizing::new(*hasher_k.finalize().as_bytes());

        self.cipher = Some(CipherState::new(&temp_k));
    }

    fn encrypt_and_hash(&mut self, plaintext: &[u8]) -> Result<Vec<u8>, NetError> {
        let ciphertext = match self.cipher.as_mut() {
            Some(cipher) => cipher.encrypt_with_ad(&self.handshake_hash, plaintext)?,
            // No key yet: ciphertext = plaintext
            None => plaintext.to_vec(),
        };
        self.mix_hash(&ciphertext);
        Ok(ciphertext)
    }

    fn decrypt_and_hash(&mut self, ciphertext: &[u8]) -> Result<Vec<u8>, NetError> {
        let plaintext = match self.cipher.as_mut() {
            Some(cipher) => cipher.decrypt_with_ad(&self.handshake_hash, ciphertext)?,
            None => ciphertext.to_vec(),
        };
        self.mix_hash(ciphertext);
        Ok(plaintext)
    }
}

fn read_key(bytes: &[u8], offset: usize) -> Result<PublicKey, NetError> {
    let end = offset + DH_LEN;
    if bytes.len() < end {
        return Err(NetError::HandshakeFailed);
    }
    let mut key = [0u8; DH_LEN];
    key.copy_from_slice(&bytes[offset..end]);
    Ok(PublicKey::from(key))
}
