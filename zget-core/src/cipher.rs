//! Transfer cipher suites.
//!
//! A [`Ciphersuite`] is chosen once per run from the user's password (or the
//! explicit bypass flag).  Every transfer then starts a fresh
//! [`KeyExchange`], trades one message with the peer and turns into a
//! [`SessionCipher`] that hands out the stream transforms.
//!
//! The authenticated suite runs SPAKE2 (symmetric mode) over the password,
//! expands the shared secret with HKDF-SHA256 and seals the file in
//! fixed-size ChaCha20-Poly1305 frames.  Frame nonces carry a counter and a
//! final-frame flag, so reordering, truncation and extension all fail
//! authentication.

use std::fmt;

use bytes::BytesMut;
use tracing::{debug, warn};

use crate::error::CipherError;

#[cfg(feature = "pake")]
use chacha20poly1305::aead::{Aead, KeyInit};
#[cfg(feature = "pake")]
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
#[cfg(feature = "pake")]
use hkdf::Hkdf;
#[cfg(feature = "pake")]
use sha2::Sha256;
#[cfg(feature = "pake")]
use spake2::{Ed25519Group, Identity, Password, Spake2};

/// Plaintext bytes per sealed frame.
pub const PLAIN_FRAME_LEN: usize = 8 * 1024;
/// Poly1305 tag appended to every frame.
pub const TAG_LEN: usize = 16;
/// Wire size of a full sealed frame.
pub const SEALED_FRAME_LEN: usize = PLAIN_FRAME_LEN + TAG_LEN;

#[cfg(feature = "pake")]
const PAKE_IDENTITY: &[u8] = b"zget";
#[cfg(feature = "pake")]
const KEY_INFO: &[u8] = b"zget/chacha20poly1305/v1";
#[cfg(feature = "pake")]
const KEY_LEN: usize = 32;

/// Security posture of a run.
#[derive(Clone)]
pub enum Ciphersuite {
    /// Password-authenticated key exchange plus sealed frames.
    Authenticated(Secret),
    /// No encryption and no peer authentication.  Only for peers that
    /// cannot run the handshake.
    Bypass,
}

/// Password material. Never printed.
#[derive(Clone)]
pub struct Secret(String);

impl fmt::Debug for Ciphersuite {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Authenticated(_) => f.write_str("Authenticated(<redacted>)"),
            Self::Bypass => f.write_str("Bypass"),
        }
    }
}

/// Picks the cipher suite for a run.
///
/// # Errors
///
/// [`CipherError::MissingPassword`] when neither a password nor `bypass` is
/// given, [`CipherError::Unavailable`] when the build lacks the `pake`
/// backend.  Neither case falls back to [`Ciphersuite::Bypass`].
pub fn negotiate(password: Option<&str>, bypass: bool) -> Result<Ciphersuite, CipherError> {
    if bypass {
        warn!("Encryption and authentication DISABLED");
        return Ok(Ciphersuite::Bypass);
    }

    let password = password.ok_or(CipherError::MissingPassword)?;
    if !cfg!(feature = "pake") {
        return Err(CipherError::Unavailable);
    }

    Ok(Ciphersuite::Authenticated(Secret(password.to_owned())))
}

impl Ciphersuite {
    #[must_use]
    pub fn is_bypass(&self) -> bool {
        matches!(self, Self::Bypass)
    }

    /// Checks that this build can run the suite.
    ///
    /// # Errors
    ///
    /// [`CipherError::Unavailable`] for an authenticated suite without the
    /// `pake` backend.
    pub fn ensure_available(&self) -> Result<(), CipherError> {
        match self {
            Self::Authenticated(_) if !cfg!(feature = "pake") => Err(CipherError::Unavailable),
            _ => Ok(()),
        }
    }

    /// Starts a key exchange for one transfer.
    ///
    /// # Errors
    ///
    /// Returns [`CipherError::Unavailable`] for an authenticated suite in a
    /// build without the `pake` backend.
    pub fn start(&self) -> Result<KeyExchange, CipherError> {
        match self {
            Self::Bypass => Ok(KeyExchange(ExchangeState::Bypass)),
            #[cfg(feature = "pake")]
            Self::Authenticated(Secret(password)) => {
                let (spake, outbound) = Spake2::<Ed25519Group>::start_symmetric(
                    &Password::new(password.as_bytes()),
                    &Identity::new(PAKE_IDENTITY),
                );
                debug!(len = outbound.len(), "Started SPAKE2 exchange");
                Ok(KeyExchange(ExchangeState::Pake { spake, outbound }))
            }
            #[cfg(not(feature = "pake"))]
            Self::Authenticated(_) => Err(CipherError::Unavailable),
        }
    }
}

/// One in-flight key exchange.
pub struct KeyExchange(ExchangeState);

enum ExchangeState {
    Bypass,
    #[cfg(feature = "pake")]
    Pake {
        spake: Spake2<Ed25519Group>,
        outbound: Vec<u8>,
    },
}

impl KeyExchange {
    /// Message to hand to the peer, `None` for the bypass suite.
    #[must_use]
    pub fn outbound(&self) -> Option<&[u8]> {
        match &self.0 {
            ExchangeState::Bypass => None,
            #[cfg(feature = "pake")]
            ExchangeState::Pake { outbound, .. } => Some(outbound),
        }
    }

    /// Completes the exchange with the peer's message.
    ///
    /// The bypass suite ignores `inbound`.  A wrong password is *not*
    /// detected here: SPAKE2 silently yields a different key and the first
    /// sealed frame fails to open.
    ///
    /// # Errors
    ///
    /// [`CipherError::MissingKeyExchange`] when the authenticated suite gets
    /// no peer message, [`CipherError::KeyExchange`] for a malformed one.
    pub fn finish(self, inbound: Option<&[u8]>) -> Result<SessionCipher, CipherError> {
        match self.0 {
            ExchangeState::Bypass => Ok(SessionCipher(SessionKind::Plain)),
            #[cfg(feature = "pake")]
            ExchangeState::Pake { spake, .. } => {
                let inbound = inbound.ok_or(CipherError::MissingKeyExchange)?;
                let shared = spake
                    .finish(inbound)
                    .map_err(|e| CipherError::KeyExchange(format!("{e:?}")))?;
                Ok(SessionCipher(SessionKind::Sealed(derive_key(&shared))))
            }
        }
    }
}

#[cfg(feature = "pake")]
fn derive_key(shared: &[u8]) -> [u8; KEY_LEN] {
    let hkdf = Hkdf::<Sha256>::new(None, shared);
    let mut key = [0u8; KEY_LEN];
    hkdf.expand(KEY_INFO, &mut key)
        .expect("32 bytes is a valid HKDF-SHA256 output length");
    key
}

/// Keyed result of a finished exchange.
pub struct SessionCipher(SessionKind);

enum SessionKind {
    Plain,
    #[cfg(feature = "pake")]
    Sealed([u8; KEY_LEN]),
}

impl SessionCipher {
    /// Number of bytes on the wire for `plain_len` bytes of file.
    #[must_use]
    pub fn sealed_len(&self, plain_len: u64) -> u64 {
        match self.0 {
            SessionKind::Plain => plain_len,
            #[cfg(feature = "pake")]
            SessionKind::Sealed(_) => {
                let frames = plain_len.div_ceil(PLAIN_FRAME_LEN as u64).max(1);
                plain_len + frames * TAG_LEN as u64
            }
        }
    }

    #[must_use]
    pub fn encryptor(&self) -> StreamEncryptor {
        StreamEncryptor {
            buf: BytesMut::new(),
            mode: self.mode(),
        }
    }

    #[must_use]
    pub fn decryptor(&self) -> StreamDecryptor {
        StreamDecryptor {
            buf: BytesMut::new(),
            mode: self.mode(),
        }
    }

    fn mode(&self) -> Mode {
        match &self.0 {
            SessionKind::Plain => Mode::Plain,
            #[cfg(feature = "pake")]
            SessionKind::Sealed(key) => Mode::Sealed(FrameCipher::new(key)),
        }
    }
}

enum Mode {
    Plain,
    #[cfg(feature = "pake")]
    Sealed(FrameCipher),
}

/// Sender-side transform.  Accepts arbitrarily sized input and emits whole
/// sealed frames; the last frame is only written by [`finish`](Self::finish).
pub struct StreamEncryptor {
    buf: BytesMut,
    mode: Mode,
}

impl StreamEncryptor {
    /// # Errors
    ///
    /// Fails only if the AEAD refuses to seal a frame.
    pub fn update(&mut self, data: &[u8]) -> Result<Vec<u8>, CipherError> {
        match &mut self.mode {
            Mode::Plain => Ok(data.to_vec()),
            #[cfg(feature = "pake")]
            Mode::Sealed(cipher) => {
                self.buf.extend_from_slice(data);
                let mut out = Vec::new();
                // Strictly greater: the final frame must stay buffered.
                while self.buf.len() > PLAIN_FRAME_LEN {
                    let frame = self.buf.split_to(PLAIN_FRAME_LEN);
                    out.extend_from_slice(&cipher.seal(&frame, false)?);
                }
                Ok(out)
            }
        }
    }

    /// Seals the final (possibly empty) frame.
    ///
    /// # Errors
    ///
    /// Fails only if the AEAD refuses to seal a frame.
    pub fn finish(self) -> Result<Vec<u8>, CipherError> {
        match self.mode {
            Mode::Plain => Ok(Vec::new()),
            #[cfg(feature = "pake")]
            Mode::Sealed(mut cipher) => cipher.seal(&self.buf, true),
        }
    }
}

/// Receiver-side transform, the mirror of [`StreamEncryptor`].
pub struct StreamDecryptor {
    buf: BytesMut,
    mode: Mode,
}

impl StreamDecryptor {
    /// Feeds received bytes and returns whatever plaintext is now verified.
    ///
    /// # Errors
    ///
    /// [`CipherError::Integrity`] when a frame fails authentication.
    pub fn update(&mut self, data: &[u8]) -> Result<Vec<u8>, CipherError> {
        match &mut self.mode {
            Mode::Plain => Ok(data.to_vec()),
            #[cfg(feature = "pake")]
            Mode::Sealed(cipher) => {
                self.buf.extend_from_slice(data);
                let mut out = Vec::new();
                while self.buf.len() > SEALED_FRAME_LEN {
                    let frame = self.buf.split_to(SEALED_FRAME_LEN);
                    out.extend_from_slice(&cipher.open(&frame, false)?);
                }
                Ok(out)
            }
        }
    }

    /// Opens the final frame.  Must be called once the peer closed the
    /// stream; skipping it would accept a truncated file.
    ///
    /// # Errors
    ///
    /// [`CipherError::Truncated`] when no final frame arrived,
    /// [`CipherError::Integrity`] when it fails authentication.
    pub fn finish(self) -> Result<Vec<u8>, CipherError> {
        match self.mode {
            Mode::Plain => Ok(Vec::new()),
            #[cfg(feature = "pake")]
            Mode::Sealed(mut cipher) => {
                if self.buf.len() < TAG_LEN {
                    return Err(CipherError::Truncated);
                }
                cipher.open(&self.buf, true)
            }
        }
    }
}

#[cfg(feature = "pake")]
struct FrameCipher {
    aead: ChaCha20Poly1305,
    counter: u64,
}

#[cfg(feature = "pake")]
impl FrameCipher {
    fn new(key: &[u8; KEY_LEN]) -> Self {
        Self {
            aead: ChaCha20Poly1305::new(Key::from_slice(key)),
            counter: 0,
        }
    }

    fn seal(&mut self, plain: &[u8], last: bool) -> Result<Vec<u8>, CipherError> {
        let frame = self.counter;
        let sealed = self
            .aead
            .encrypt(&frame_nonce(frame, last), plain)
            .map_err(|_| CipherError::Seal { frame })?;
        self.counter += 1;
        Ok(sealed)
    }

    fn open(&mut self, sealed: &[u8], last: bool) -> Result<Vec<u8>, CipherError> {
        let frame = self.counter;
        let plain = self
            .aead
            .decrypt(&frame_nonce(frame, last), sealed)
            .map_err(|_| CipherError::Integrity { frame })?;
        self.counter += 1;
        Ok(plain)
    }
}

/// Nonce layout: big-endian frame counter in bytes 0..8, final-frame flag in
/// byte 11.
#[cfg(feature = "pake")]
fn frame_nonce(counter: u64, last: bool) -> Nonce {
    let mut nonce = [0u8; 12];
    nonce[..8].copy_from_slice(&counter.to_be_bytes());
    nonce[11] = u8::from(last);
    Nonce::clone_from_slice(&nonce)
}

#[cfg(all(test, feature = "pake"))]
mod tests {
    use super::*;

    fn payload(len: usize) -> Vec<u8> {
        (0..len).map(|i| b"ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789"[i % 36]).collect()
    }

    /// Runs both halves of the exchange and returns (sender, receiver) ciphers.
    fn handshake(sender_pw: &str, receiver_pw: &str) -> (SessionCipher, SessionCipher) {
        let sender = negotiate(Some(sender_pw), false).unwrap().start().unwrap();
        let receiver = negotiate(Some(receiver_pw), false).unwrap().start().unwrap();
        let to_receiver = sender.outbound().unwrap().to_vec();
        let to_sender = receiver.outbound().unwrap().to_vec();
        (
            sender.finish(Some(&to_sender)).unwrap(),
            receiver.finish(Some(&to_receiver)).unwrap(),
        )
    }

    fn seal_all(cipher: &SessionCipher, plain: &[u8], step: usize) -> Vec<u8> {
        let mut enc = cipher.encryptor();
        let mut out = Vec::new();
        for chunk in plain.chunks(step.max(1)) {
            out.extend(enc.update(chunk).unwrap());
        }
        out.extend(enc.finish().unwrap());
        out
    }

    fn open_all(cipher: &SessionCipher, sealed: &[u8], step: usize) -> Result<Vec<u8>, CipherError> {
        let mut dec = cipher.decryptor();
        let mut out = Vec::new();
        for chunk in sealed.chunks(step.max(1)) {
            out.extend(dec.update(chunk)?);
        }
        out.extend(dec.finish()?);
        Ok(out)
    }

    #[test]
    fn given_bypass_flag_when_negotiating_then_password_is_ignored() {
        let suite = negotiate(Some("whatever"), true).unwrap();
        assert!(suite.is_bypass());
        let suite = negotiate(None, true).unwrap();
        assert!(suite.is_bypass());
    }

    #[test]
    fn given_no_password_and_no_bypass_when_negotiating_then_fails() {
        let err = negotiate(None, false).unwrap_err();
        assert!(matches!(err, CipherError::MissingPassword));
    }

    #[test]
    fn given_backend_built_in_when_checking_suites_then_both_are_available() {
        assert!(Ciphersuite::Bypass.ensure_available().is_ok());
        assert!(negotiate(Some("pw"), false).unwrap().ensure_available().is_ok());
    }

    #[test]
    fn given_bypass_session_when_transforming_then_bytes_are_unchanged() {
        let exchange = Ciphersuite::Bypass.start().unwrap();
        assert!(exchange.outbound().is_none());
        let cipher = exchange.finish(Some(b"ignored")).unwrap();

        let plain = payload(20_000);
        let sealed = seal_all(&cipher, &plain, 4096);
        assert_eq!(sealed, plain);
        assert_eq!(open_all(&cipher, &sealed, 1000).unwrap(), plain);
        assert_eq!(cipher.sealed_len(20_000), 20_000);
    }

    #[test]
    fn given_matching_passwords_when_round_tripped_then_plaintext_is_restored() {
        for len in [0, 1, 277, PLAIN_FRAME_LEN, 2 * PLAIN_FRAME_LEN, 62 * 1024 - 1] {
            let (sender, receiver) = handshake("correct-horse", "correct-horse");
            let plain = payload(len);
            let sealed = seal_all(&sender, &plain, 1000);

            assert_eq!(sealed.len() as u64, sender.sealed_len(len as u64), "len {len}");
            if len > 0 {
                assert_ne!(&sealed[..len.min(sealed.len())], &plain[..]);
            }
            assert_eq!(open_all(&receiver, &sealed, 3001).unwrap(), plain, "len {len}");
        }
    }

    #[test]
    fn given_wrong_password_when_opening_then_integrity_fails() {
        let (sender, receiver) = handshake("correct-horse", "wrong-horse");
        let sealed = seal_all(&sender, &payload(5000), 5000);
        let err = open_all(&receiver, &sealed, 5000).unwrap_err();
        assert!(matches!(err, CipherError::Integrity { frame: 0 }));
    }

    #[test]
    fn given_tampered_stream_when_opening_then_integrity_fails() {
        let (sender, receiver) = handshake("pw", "pw");
        let mut sealed = seal_all(&sender, &payload(3 * PLAIN_FRAME_LEN), 8192);
        let mid = sealed.len() / 2;
        sealed[mid..mid + 7].copy_from_slice(b"garbage");
        assert!(matches!(
            open_all(&receiver, &sealed, 8192),
            Err(CipherError::Integrity { .. })
        ));
    }

    #[test]
    fn given_stream_cut_at_frame_boundary_when_finishing_then_detected() {
        let (sender, receiver) = handshake("pw", "pw");
        let sealed = seal_all(&sender, &payload(3 * PLAIN_FRAME_LEN), 8192);
        let cut = &sealed[..2 * SEALED_FRAME_LEN];
        assert!(matches!(
            open_all(&receiver, cut, 4096),
            Err(CipherError::Integrity { .. })
        ));
    }

    #[test]
    fn given_empty_stream_when_finishing_then_truncated() {
        let (_, receiver) = handshake("pw", "pw");
        assert!(matches!(
            open_all(&receiver, &[], 1),
            Err(CipherError::Truncated)
        ));
    }

    #[test]
    fn given_authenticated_suite_without_peer_message_when_finishing_then_fails() {
        let exchange = negotiate(Some("pw"), false).unwrap().start().unwrap();
        assert!(matches!(
            exchange.finish(None),
            Err(CipherError::MissingKeyExchange)
        ));
    }

    #[test]
    fn given_malformed_peer_message_when_finishing_then_key_exchange_fails() {
        let exchange = negotiate(Some("pw"), false).unwrap().start().unwrap();
        assert!(matches!(
            exchange.finish(Some(b"short")),
            Err(CipherError::KeyExchange(_))
        ));
    }

    #[test]
    fn given_authenticated_suite_when_debug_printed_then_password_is_hidden() {
        let suite = negotiate(Some("hunter2"), false).unwrap();
        assert!(!format!("{suite:?}").contains("hunter2"));
    }
}
