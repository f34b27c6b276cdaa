//! Noise handshake state machine for mutual authentication.
//!
//! Implements exactly two patterns over `25519_ChaChaPoly_SHA256`:
//!
//! ```text
//! XX                                KK
//! Message 1: I -> R: e              Message 1: I -> R: e, es, ss
//! Message 2: R -> I: e, ee, s, es   Message 2: R -> I: e, ee, se
//! Message 3: I -> R: s, se
//! ```
//!
//! XX is used on first contact: neither side knows the other's static key
//! and both are exchanged encrypted. KK is used between peers that already
//! hold each other's statics (after a verified security upgrade) and folds
//! the authentication into two messages.
//!
//! The state carries the chaining key, handshake hash, the symmetric key
//! once active, both keypairs and the remote keys as they are learned, and
//! the message step index. `split` consumes the state, zeroizes the
//! chaining key and yields one zero-counter [`CipherState`] per direction.

use crate::cipher::CipherState;
use crate::error::{CryptoError, HandshakeError};
use crate::primitives::{StaticKeypair, dh, hkdf2, is_low_order_point, sha256_pair};
use crate::{KEY_LEN, TAG_LEN};
use rand_core::{CryptoRng, RngCore};
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Largest possible handshake message: XX message 2 is 96 bytes plus the
/// sealed payload. Callers framing handshake blobs can rely on this bound
/// for empty payloads.
pub const MAX_MESSAGE_LEN: usize = 256;

/// Handshake pattern selector.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Pattern {
    /// Three messages, mutual authentication, no prior knowledge.
    Xx,
    /// Two messages, both statics pre-shared.
    Kk,
}

impl Pattern {
    /// Total number of handshake messages for the pattern.
    #[must_use]
    pub fn message_count(self) -> usize {
        match self {
            Pattern::Xx => 3,
            Pattern::Kk => 2,
        }
    }

    fn protocol_name(self) -> &'static [u8; 32] {
        match self {
            Pattern::Xx => b"Noise_XX_25519_ChaChaPoly_SHA256",
            Pattern::Kk => b"Noise_KK_25519_ChaChaPoly_SHA256",
        }
    }
}

/// Role in the handshake.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Role {
    /// Sends message 1.
    Initiator,
    /// Receives message 1.
    Responder,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Token {
    E,
    S,
    Ee,
    Es,
    Se,
    Ss,
}

const XX_MESSAGES: [&[Token]; 3] = [
    &[Token::E],
    &[Token::E, Token::Ee, Token::S, Token::Es],
    &[Token::S, Token::Se],
];

const KK_MESSAGES: [&[Token]; 2] = [
    &[Token::E, Token::Es, Token::Ss],
    &[Token::E, Token::Ee, Token::Se],
];

fn message_tokens(pattern: Pattern, step: usize) -> &'static [Token] {
    match pattern {
        Pattern::Xx => XX_MESSAGES[step],
        Pattern::Kk => KK_MESSAGES[step],
    }
}

/// Noise symmetric state: chaining key, handshake hash, optional cipher key.
#[derive(Zeroize, ZeroizeOnDrop)]
struct SymmetricState {
    ck: [u8; 32],
    h: [u8; 32],
    k: Option<[u8; 32]>,
    #[zeroize(skip)]
    n: u64,
}

impl SymmetricState {
    fn new(protocol_name: &[u8; 32]) -> Self {
        // The protocol name is exactly the hash length, so it seeds the
        // handshake hash directly.
        Self {
            ck: *protocol_name,
            h: *protocol_name,
            k: None,
            n: 0,
        }
    }

    fn mix_hash(&mut self, data: &[u8]) {
        self.h = sha256_pair(&self.h, data);
    }

    fn mix_key(&mut self, ikm: &[u8]) -> Result<(), CryptoError> {
        let (ck, k) = hkdf2(&self.ck, ikm)?;
        self.ck.zeroize();
        self.ck = ck;
        if let Some(old) = self.k.as_mut() {
            old.zeroize();
        }
        self.k = Some(k);
        self.n = 0;
        Ok(())
    }

    fn has_key(&self) -> bool {
        self.k.is_some()
    }

    fn encrypt_and_hash(&mut self, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let out = match &self.k {
            Some(key) => {
                let nonce = crate::primitives::nonce_for_counter(self.n);
                let ct = crate::primitives::aead_seal(key, &nonce, &self.h, plaintext)?;
                self.n += 1;
                ct
            }
            None => plaintext.to_vec(),
        };
        self.mix_hash(&out);
        Ok(out)
    }

    fn decrypt_and_hash(&mut self, data: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let out = match &self.k {
            Some(key) => {
                let nonce = crate::primitives::nonce_for_counter(self.n);
                let pt = crate::primitives::aead_open(key, &nonce, &self.h, data)?;
                self.n += 1;
                pt
            }
            None => data.to_vec(),
        };
        self.mix_hash(data);
        Ok(out)
    }
}

/// An in-progress Noise handshake.
pub struct Handshake {
    symmetric: SymmetricState,
    pattern: Pattern,
    role: Role,
    local_static: StaticKeypair,
    local_ephemeral: Option<StaticKeypair>,
    remote_static: Option<[u8; 32]>,
    remote_ephemeral: Option<[u8; 32]>,
    step: usize,
}

impl Handshake {
    /// Start a handshake.
    ///
    /// `remote_static` is required for KK (both statics are pre-shared: the
    /// initiator passes the responder's key, the responder the initiator's)
    /// and ignored for XX, where statics travel inside the handshake.
    ///
    /// # Errors
    ///
    /// Returns [`HandshakeError::MissingRemoteStatic`] when KK is selected
    /// without the peer's static key.
    pub fn initiate(
        pattern: Pattern,
        role: Role,
        local_static: StaticKeypair,
        remote_static: Option<[u8; 32]>,
    ) -> Result<Self, HandshakeError> {
        let mut symmetric = SymmetricState::new(pattern.protocol_name());
        // Empty prologue.
        symmetric.mix_hash(&[]);

        let remote_static = match pattern {
            Pattern::Xx => None,
            Pattern::Kk => {
                let Some(remote) = remote_static else {
                    return Err(HandshakeError::MissingRemoteStatic);
                };
                // Pre-message pattern: initiator static, then responder
                // static.
                let (initiator_pub, responder_pub) = match role {
                    Role::Initiator => (*local_static.public(), remote),
                    Role::Responder => (remote, *local_static.public()),
                };
                symmetric.mix_hash(&initiator_pub);
                symmetric.mix_hash(&responder_pub);
                Some(remote)
            }
        };

        Ok(Self {
            symmetric,
            pattern,
            role,
            local_static,
            local_ephemeral: None,
            remote_static,
            remote_ephemeral: None,
            step: 0,
        })
    }

    /// The pattern this handshake runs.
    #[must_use]
    pub fn pattern(&self) -> Pattern {
        self.pattern
    }

    /// The local role.
    #[must_use]
    pub fn role(&self) -> Role {
        self.role
    }

    /// Whether all handshake messages have been processed.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.step == self.pattern.message_count()
    }

    /// Handshake messages processed so far (written or read).
    #[must_use]
    pub fn messages_processed(&self) -> usize {
        self.step
    }

    /// Whether the next action on this side is a write.
    #[must_use]
    pub fn wants_write(&self) -> bool {
        self.is_write_turn()
    }

    /// The remote static key, once learned (immediately for KK, after
    /// message 2 or 3 for XX).
    #[must_use]
    pub fn remote_static(&self) -> Option<[u8; 32]> {
        self.remote_static
    }

    /// The running handshake hash; stable channel-binding value after the
    /// final message.
    #[must_use]
    pub fn handshake_hash(&self) -> [u8; 32] {
        self.symmetric.h
    }

    fn is_write_turn(&self) -> bool {
        self.step < self.pattern.message_count()
            && (self.step % 2 == 0) == (self.role == Role::Initiator)
    }

    fn is_read_turn(&self) -> bool {
        self.step < self.pattern.message_count()
            && (self.step % 2 == 0) == (self.role == Role::Responder)
    }

    /// Produce the next handshake message, advancing the state by one step.
    ///
    /// No plaintext payload is ever emitted once it would need protection:
    /// the payload rides in clear only on XX message 1, where the pattern
    /// defines no key yet.
    ///
    /// # Errors
    ///
    /// Returns [`HandshakeError::OutOfSequence`] when it is not this side's
    /// turn to write.
    pub fn write_message<R: RngCore + CryptoRng>(
        &mut self,
        payload: &[u8],
        rng: &mut R,
    ) -> Result<Vec<u8>, HandshakeError> {
        if !self.is_write_turn() {
            return Err(HandshakeError::OutOfSequence);
        }

        let tokens = message_tokens(self.pattern, self.step);
        let mut message = Vec::with_capacity(MAX_MESSAGE_LEN);

        for token in tokens {
            match token {
                Token::E => {
                    if self.local_ephemeral.is_none() {
                        self.local_ephemeral = Some(StaticKeypair::generate(rng));
                    }
                    let public = self
                        .local_ephemeral
                        .as_ref()
                        .map(|keypair| *keypair.public())
                        .ok_or(HandshakeError::OutOfSequence)?;
                    message.extend_from_slice(&public);
                    self.symmetric.mix_hash(&public);
                }
                Token::S => {
                    let public = *self.local_static.public();
                    let sealed = self
                        .symmetric
                        .encrypt_and_hash(&public)
                        .map_err(map_crypto)?;
                    message.extend_from_slice(&sealed);
                }
                dh_token => {
                    let mut shared = self.token_dh(*dh_token)?;
                    let mixed = self.symmetric.mix_key(&shared);
                    shared.zeroize();
                    mixed.map_err(map_crypto)?;
                }
            }
        }

        let sealed_payload = self
            .symmetric
            .encrypt_and_hash(payload)
            .map_err(map_crypto)?;
        message.extend_from_slice(&sealed_payload);

        self.step += 1;
        Ok(message)
    }

    /// Consume a peer handshake message, advancing the state by one step.
    /// Returns the embedded payload.
    ///
    /// # Errors
    ///
    /// - [`HandshakeError::OutOfSequence`] when it is not this side's turn
    ///   to read.
    /// - [`HandshakeError::MalformedMessage`] on a short message or a
    ///   low-order ephemeral point.
    /// - [`HandshakeError::DecryptFailure`] when authentication fails.
    pub fn read_message(&mut self, message: &[u8]) -> Result<Vec<u8>, HandshakeError> {
        if !self.is_read_turn() {
            return Err(HandshakeError::OutOfSequence);
        }

        let tokens = message_tokens(self.pattern, self.step);
        let mut rest = message;

        for token in tokens {
            match token {
                Token::E => {
                    if rest.len() < KEY_LEN {
                        return Err(HandshakeError::MalformedMessage);
                    }
                    let (head, tail) = rest.split_at(KEY_LEN);
                    let mut public = [0u8; 32];
                    public.copy_from_slice(head);
                    if is_low_order_point(&public) {
                        return Err(HandshakeError::MalformedMessage);
                    }
                    self.symmetric.mix_hash(&public);
                    self.remote_ephemeral = Some(public);
                    rest = tail;
                }
                Token::S => {
                    let need = if self.symmetric.has_key() {
                        KEY_LEN + TAG_LEN
                    } else {
                        KEY_LEN
                    };
                    if rest.len() < need {
                        return Err(HandshakeError::MalformedMessage);
                    }
                    let (head, tail) = rest.split_at(need);
                    let opened = self.symmetric.decrypt_and_hash(head).map_err(map_crypto)?;
                    if opened.len() != KEY_LEN {
                        return Err(HandshakeError::MalformedMessage);
                    }
                    let mut public = [0u8; 32];
                    public.copy_from_slice(&opened);
                    self.remote_static = Some(public);
                    rest = tail;
                }
                dh_token => {
                    let mut shared = self.token_dh(*dh_token)?;
                    let mixed = self.symmetric.mix_key(&shared);
                    shared.zeroize();
                    mixed.map_err(map_crypto)?;
                }
            }
        }

        let payload = self.symmetric.decrypt_and_hash(rest).map_err(map_crypto)?;
        self.step += 1;
        Ok(payload)
    }

    /// Complete the handshake and derive the transport cipher states.
    ///
    /// Returns `(send, receive)` for this side; both counters start at
    /// zero. The chaining key is zeroized before returning.
    ///
    /// # Errors
    ///
    /// Returns [`HandshakeError::OutOfSequence`] if messages remain.
    pub fn split(mut self) -> Result<(CipherState, CipherState), HandshakeError> {
        if !self.is_complete() {
            return Err(HandshakeError::OutOfSequence);
        }
        let (first, second) = hkdf2(&self.symmetric.ck, &[]).map_err(HandshakeError::Crypto)?;
        self.symmetric.ck.zeroize();

        let pair = match self.role {
            Role::Initiator => (CipherState::new(first), CipherState::new(second)),
            Role::Responder => (CipherState::new(second), CipherState::new(first)),
        };
        Ok(pair)
    }

    /// Token DH by role. The token names the key pairing in absolute
    /// initiator/responder terms, so the local mapping depends only on our
    /// role, not on whether we are writing or reading.
    fn token_dh(&self, token: Token) -> Result<[u8; 32], HandshakeError> {
        let ephemeral = self
            .local_ephemeral
            .as_ref()
            .map(StaticKeypair::secret)
            .ok_or(HandshakeError::OutOfSequence);
        let remote_e = self
            .remote_ephemeral
            .as_ref()
            .ok_or(HandshakeError::OutOfSequence);
        let remote_s = self
            .remote_static
            .as_ref()
            .ok_or(HandshakeError::OutOfSequence);

        let shared = match (token, self.role) {
            (Token::Ee, _) => dh(ephemeral?, remote_e?),
            (Token::Ss, _) => dh(self.local_static.secret(), remote_s?),
            (Token::Es, Role::Initiator) | (Token::Se, Role::Responder) => {
                dh(ephemeral?, remote_s?)
            }
            (Token::Es, Role::Responder) | (Token::Se, Role::Initiator) => {
                dh(self.local_static.secret(), remote_e?)
            }
            (Token::E | Token::S, _) => return Err(HandshakeError::OutOfSequence),
        };
        shared.map_err(map_crypto)
    }

    #[cfg(test)]
    pub(crate) fn set_ephemeral(&mut self, secret: [u8; 32]) {
        self.local_ephemeral = Some(StaticKeypair::from_secret(secret));
    }
}

fn map_crypto(error: CryptoError) -> HandshakeError {
    match error {
        CryptoError::AuthFailure => HandshakeError::DecryptFailure,
        CryptoError::InvalidPoint => HandshakeError::MalformedMessage,
        other => HandshakeError::Crypto(other),
    }
}
