//! XChaCha20-Poly1305 secret stream.
//!
//! A byte-exact implementation of libsodium's
//! `crypto_secretstream_xchacha20poly1305`. Every encrypted frame is
//! `tag byte || ciphertext || 16-byte MAC`; the stream state ratchets after
//! each frame, so frames must be pulled in the order they were pushed.
//!
//! ```text
//! header (24 bytes) = HChaCha20 input (16) || initial inonce (8)
//! nonce  (12 bytes) = counter (4, LE, starts at 1) || inonce (8)
//! ```
//!
//! [`SecretStream`] pairs one push state (created eagerly, header sent to the
//! peer) with one pull state (created once the peer's header arrives).

use chacha20::ChaCha20;
use chacha20::cipher::consts::U10;
use chacha20::cipher::generic_array::GenericArray;
use chacha20::cipher::{KeyIvInit, StreamCipher, StreamCipherSeek};
use poly1305::Poly1305;
use poly1305::universal_hash::KeyInit;
use subtle::ConstantTimeEq;
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use crate::{CryptoError, SessionPair, random};

/// Stream header size
pub const HBYTES: usize = 24;

/// Per-frame overhead: tag byte plus Poly1305 MAC
pub const ABYTES: usize = 1 + MAC_BYTES;

/// Stream key size
pub const KEYBYTES: usize = 32;

const MAC_BYTES: usize = 16;
const COUNTER_BYTES: usize = 4;
const INONCE_BYTES: usize = 8;
const NONCE_BYTES: usize = COUNTER_BYTES + INONCE_BYTES;
const BLOCK_BYTES: usize = 64;

/// Frame tag carried (encrypted) in the first byte of every frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Tag {
    /// Ordinary data
    Message = 0x00,
    /// End of a logical message; no state change
    Push = 0x01,
    /// Ratchet the key after this frame
    Rekey = 0x02,
    /// Last frame of the stream
    Final = 0x03,
}

impl TryFrom<u8> for Tag {
    type Error = CryptoError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x00 => Ok(Self::Message),
            0x01 => Ok(Self::Push),
            0x02 => Ok(Self::Rekey),
            0x03 => Ok(Self::Final),
            other => Err(CryptoError::UnknownTag(other)),
        }
    }
}

impl Tag {
    fn rekeys(self) -> bool {
        (self as u8) & (Tag::Rekey as u8) != 0
    }
}

/// One direction of a secret stream.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct StreamState {
    key: [u8; KEYBYTES],
    nonce: [u8; NONCE_BYTES],
}

impl StreamState {
    fn from_header(key: &[u8; KEYBYTES], header: &[u8; HBYTES]) -> Self {
        let mut input = [0u8; 16];
        input.copy_from_slice(&header[..16]);
        let subkey = chacha20::hchacha::<U10>(
            GenericArray::from_slice(key),
            GenericArray::from_slice(&input),
        );

        let mut state = Self {
            key: [0u8; KEYBYTES],
            nonce: [0u8; NONCE_BYTES],
        };
        state.key.copy_from_slice(&subkey);
        state.nonce[COUNTER_BYTES..].copy_from_slice(&header[16..]);
        state.reset_counter();
        state
    }

    /// Start a push stream with a fresh random header.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::RandomFailed`] if no header could be generated.
    pub fn init_push(key: &[u8; KEYBYTES]) -> Result<(Self, [u8; HBYTES]), CryptoError> {
        let header: [u8; HBYTES] = random::random_array()?;
        Ok((Self::from_header(key, &header), header))
    }

    /// Start a push stream with a caller-chosen header.
    ///
    /// The header must never be reused with the same key.
    #[must_use]
    pub fn init_push_with_header(key: &[u8; KEYBYTES], header: &[u8; HBYTES]) -> Self {
        Self::from_header(key, header)
    }

    /// Start a pull stream from the peer's header.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::InvalidHeader`] if `header` is not [`HBYTES`] long.
    pub fn init_pull(key: &[u8; KEYBYTES], header: &[u8]) -> Result<Self, CryptoError> {
        let header: &[u8; HBYTES] =
            header
                .try_into()
                .map_err(|_| CryptoError::InvalidHeader {
                    expected: HBYTES,
                    actual: header.len(),
                })?;
        Ok(Self::from_header(key, header))
    }

    fn reset_counter(&mut self) {
        self.nonce[..COUNTER_BYTES].fill(0);
        self.nonce[0] = 1;
    }

    fn cipher(&self) -> ChaCha20 {
        ChaCha20::new(
            GenericArray::from_slice(&self.key),
            GenericArray::from_slice(&self.nonce),
        )
    }

    fn mac_key(&self) -> Zeroizing<[u8; BLOCK_BYTES]> {
        let mut block = Zeroizing::new([0u8; BLOCK_BYTES]);
        self.cipher().apply_keystream(block.as_mut());
        block
    }

    /// Keystream XOR starting at block counter `ic`.
    fn xor_ic(&self, buf: &mut [u8], ic: u64) {
        let mut cipher = self.cipher();
        cipher.seek(ic * BLOCK_BYTES as u64);
        cipher.apply_keystream(buf);
    }

    fn compute_mac(&self, tag_block: &[u8; BLOCK_BYTES], ciphertext: &[u8]) -> [u8; MAC_BYTES] {
        let poly_key = self.mac_key();
        let mlen = ciphertext.len();

        // Associated data is always empty here, so it contributes no bytes.
        // The ciphertext pad is `(16 - 64 + mlen) mod 16` zero bytes, which is
        // `mlen mod 16`, not the distance to the next block boundary.
        let pad = mlen & 0xf;
        let mut input = Vec::with_capacity(BLOCK_BYTES + mlen + pad + 16);
        input.extend_from_slice(tag_block);
        input.extend_from_slice(ciphertext);
        input.resize(BLOCK_BYTES + mlen + pad, 0);
        input.extend_from_slice(&0u64.to_le_bytes());
        input.extend_from_slice(&((BLOCK_BYTES + mlen) as u64).to_le_bytes());

        let mac = Poly1305::new(GenericArray::from_slice(&poly_key[..32])).compute_unpadded(&input);
        let mut out = [0u8; MAC_BYTES];
        out.copy_from_slice(&mac);
        out
    }

    fn advance(&mut self, mac: &[u8; MAC_BYTES], tag: Tag) {
        for (n, m) in self.nonce[COUNTER_BYTES..].iter_mut().zip(mac.iter()) {
            *n ^= m;
        }

        let mut carry = 1u16;
        for b in &mut self.nonce[..COUNTER_BYTES] {
            carry += u16::from(*b);
            *b = carry as u8;
            carry >>= 8;
        }

        let wrapped = self.nonce[..COUNTER_BYTES].iter().all(|&b| b == 0);
        if tag.rekeys() || wrapped {
            self.rekey();
        }
    }

    /// Ratchet the key and inonce, resetting the counter.
    pub fn rekey(&mut self) {
        let mut buf = Zeroizing::new([0u8; KEYBYTES + INONCE_BYTES]);
        buf[..KEYBYTES].copy_from_slice(&self.key);
        buf[KEYBYTES..].copy_from_slice(&self.nonce[COUNTER_BYTES..]);

        self.xor_ic(buf.as_mut(), 0);

        self.key.copy_from_slice(&buf[..KEYBYTES]);
        self.nonce[COUNTER_BYTES..].copy_from_slice(&buf[KEYBYTES..]);
        self.reset_counter();
    }

    /// Encrypt one frame.
    #[must_use]
    pub fn push(&mut self, plaintext: &[u8], tag: Tag) -> Vec<u8> {
        let mut block = [0u8; BLOCK_BYTES];
        block[0] = tag as u8;
        self.xor_ic(&mut block, 1);

        let mut out = Vec::with_capacity(plaintext.len() + ABYTES);
        out.push(block[0]);
        out.extend_from_slice(plaintext);
        self.xor_ic(&mut out[1..], 2);

        let mac = self.compute_mac(&block, &out[1..]);
        out.extend_from_slice(&mac);

        self.advance(&mac, tag);
        out
    }

    /// Decrypt one frame.
    ///
    /// On failure the state is left untouched.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::DecryptionFailed`] if the frame is truncated or
    /// fails authentication, and [`CryptoError::UnknownTag`] if the decrypted
    /// tag byte is not a known tag.
    pub fn pull(&mut self, frame: &[u8]) -> Result<(Vec<u8>, Tag), CryptoError> {
        if frame.len() < ABYTES {
            return Err(CryptoError::DecryptionFailed);
        }
        let mlen = frame.len() - ABYTES;
        let ciphertext = &frame[1..1 + mlen];
        let stored_mac = &frame[1 + mlen..];

        let mut block = [0u8; BLOCK_BYTES];
        block[0] = frame[0];
        self.xor_ic(&mut block, 1);
        let raw_tag = block[0];
        block[0] = frame[0];

        let mac = self.compute_mac(&block, ciphertext);
        if !bool::from(mac[..].ct_eq(stored_mac)) {
            return Err(CryptoError::DecryptionFailed);
        }
        let tag = Tag::try_from(raw_tag)?;

        let mut plaintext = ciphertext.to_vec();
        self.xor_ic(&mut plaintext, 2);

        self.advance(&mac, tag);
        Ok((plaintext, tag))
    }
}

/// Payload encryption for one virtual connection, keyed with the edge router.
///
/// The push side is ready at construction and its header is handed out once
/// for the CONNECT request. The pull side is set up when the peer's header
/// arrives in the connect reply.
pub struct SecretStream {
    header: Option<[u8; HBYTES]>,
    push: StreamState,
    rx_key: Option<Zeroizing<[u8; KEYBYTES]>>,
    pull: Option<StreamState>,
    finished: bool,
}

impl SecretStream {
    /// Create a stream from connection session keys.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::RandomFailed`] if no header could be generated.
    pub fn new(keys: &SessionPair) -> Result<Self, CryptoError> {
        let (push, header) = StreamState::init_push(keys.tx())?;
        Ok(Self {
            header: Some(header),
            push,
            rx_key: Some(Zeroizing::new(*keys.rx())),
            pull: None,
            finished: false,
        })
    }

    /// Take the local stream header. Succeeds exactly once.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::HeaderAlreadyConsumed`] on later calls.
    pub fn header(&mut self) -> Result<[u8; HBYTES], CryptoError> {
        self.header.take().ok_or(CryptoError::HeaderAlreadyConsumed)
    }

    /// Initialize the pull side from the peer's header.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::InvalidHeader`] for a wrong-length header and
    /// [`CryptoError::AlreadyInitialized`] if called twice.
    pub fn init(&mut self, peer_header: &[u8]) -> Result<(), CryptoError> {
        if peer_header.len() != HBYTES {
            return Err(CryptoError::InvalidHeader {
                expected: HBYTES,
                actual: peer_header.len(),
            });
        }
        let rx_key = self.rx_key.take().ok_or(CryptoError::AlreadyInitialized)?;
        self.pull = Some(StreamState::init_pull(&rx_key, peer_header)?);
        Ok(())
    }

    /// Whether the pull side is ready.
    #[must_use]
    pub fn initialized(&self) -> bool {
        self.pull.is_some()
    }

    /// Whether the peer sent its FINAL frame.
    #[must_use]
    pub fn finished(&self) -> bool {
        self.finished
    }

    /// Encrypt a MESSAGE frame.
    #[must_use]
    pub fn encrypt(&mut self, plaintext: &[u8]) -> Vec<u8> {
        self.push.push(plaintext, Tag::Message)
    }

    /// Encrypt a frame with an explicit tag.
    #[must_use]
    pub fn encrypt_with_tag(&mut self, plaintext: &[u8], tag: Tag) -> Vec<u8> {
        self.push.push(plaintext, tag)
    }

    /// Decrypt a frame, discarding its tag.
    ///
    /// # Errors
    ///
    /// See [`SecretStream::decrypt_with_tag`].
    pub fn decrypt(&mut self, frame: &[u8]) -> Result<Vec<u8>, CryptoError> {
        self.decrypt_with_tag(frame).map(|(plaintext, _)| plaintext)
    }

    /// Decrypt a frame and report its tag.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::NotInitialized`] before [`SecretStream::init`],
    /// [`CryptoError::StreamFinished`] after a FINAL frame, and
    /// [`CryptoError::DecryptionFailed`] for any corrupt frame.
    pub fn decrypt_with_tag(&mut self, frame: &[u8]) -> Result<(Vec<u8>, Tag), CryptoError> {
        if self.finished {
            return Err(CryptoError::StreamFinished);
        }
        let pull = self.pull.as_mut().ok_or(CryptoError::NotInitialized)?;
        let (plaintext, tag) = pull.pull(frame)?;
        if tag == Tag::Final {
            self.finished = true;
        }
        Ok((plaintext, tag))
    }
}

impl std::fmt::Debug for SecretStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecretStream")
            .field("header_pending", &self.header.is_some())
            .field("initialized", &self.initialized())
            .field("finished", &self.finished)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Produced by libsodium's crypto_secretstream_xchacha20poly1305_push with
    // key 00..1f.
    const KAT_HEADER: &str = "8933d36797b31f6b9b50b0f3c2407a1c14104a9cff996765";
    const KAT_FRAMES: &[(&[u8], Tag, &str)] = &[
        (
            b"hello ziti",
            Tag::Message,
            "e2f67b4634ab36035d31846d4ed1852195840098c89af1ab3dc749",
        ),
        (b"", Tag::Rekey, "dd3bd43287cc07c4793898491435bac912"),
        (
            b"second frame",
            Tag::Push,
            "7360f8d305ca9936f6298aedcaadc52ba468aef36b47a8cf15fe4f79a9",
        ),
        (b"bye", Tag::Final, "5605877cbd43b0179460c198230748a1a7dccada"),
    ];

    fn kat_key() -> [u8; KEYBYTES] {
        let mut key = [0u8; KEYBYTES];
        for (i, b) in key.iter_mut().enumerate() {
            *b = i as u8;
        }
        key
    }

    fn kat_header() -> [u8; HBYTES] {
        hex::decode(KAT_HEADER).unwrap().try_into().unwrap()
    }

    fn pair() -> (SecretStream, SecretStream) {
        let keys = SessionPair::new([1u8; 32], [2u8; 32]);
        let mut a = SecretStream::new(&keys).unwrap();
        let mut b = SecretStream::new(&keys.swapped()).unwrap();
        let ha = a.header().unwrap();
        let hb = b.header().unwrap();
        a.init(&hb).unwrap();
        b.init(&ha).unwrap();
        (a, b)
    }

    #[test]
    fn test_push_matches_libsodium() {
        let mut state = StreamState::init_push_with_header(&kat_key(), &kat_header());
        for (plaintext, tag, expected) in KAT_FRAMES {
            assert_eq!(hex::encode(state.push(plaintext, *tag)), *expected);
        }
    }

    #[test]
    fn test_pull_libsodium_frames() {
        let mut state = StreamState::init_pull(&kat_key(), &kat_header()).unwrap();
        for (plaintext, tag, frame) in KAT_FRAMES {
            let (out, got) = state.pull(&hex::decode(frame).unwrap()).unwrap();
            assert_eq!(&out, plaintext);
            assert_eq!(got, *tag);
        }
    }

    #[test]
    fn test_mac_padding_for_every_length_residue() {
        let key = kat_key();
        let header = kat_header();
        let mut push = StreamState::init_push_with_header(&key, &header);
        let mut pull = StreamState::init_pull(&key, &header).unwrap();
        for len in 0..48 {
            let plaintext = vec![len as u8; len];
            let frame = push.push(&plaintext, Tag::Message);
            assert_eq!(pull.pull(&frame).unwrap().0, plaintext, "length {len}");
        }
    }

    #[test]
    fn test_frame_size() {
        let (mut a, _) = pair();
        assert_eq!(a.encrypt(b"hello").len(), 5 + ABYTES);
        assert_eq!(a.encrypt(b"").len(), ABYTES);
    }

    #[test]
    fn test_roundtrip_both_directions() {
        let (mut a, mut b) = pair();
        let frame = a.encrypt(b"ping");
        assert_eq!(b.decrypt(&frame).unwrap(), b"ping");
        let frame = b.encrypt(b"pong");
        assert_eq!(a.decrypt(&frame).unwrap(), b"pong");
    }

    #[test]
    fn test_header_consumed_once() {
        let keys = SessionPair::new([3u8; 32], [4u8; 32]);
        let mut s = SecretStream::new(&keys).unwrap();
        assert!(s.header().is_ok());
        assert_eq!(s.header(), Err(CryptoError::HeaderAlreadyConsumed));
    }

    #[test]
    fn test_init_twice_rejected() {
        let (mut a, _) = pair();
        assert_eq!(a.init(&[0u8; HBYTES]), Err(CryptoError::AlreadyInitialized));
    }

    #[test]
    fn test_init_wrong_length() {
        let keys = SessionPair::new([3u8; 32], [4u8; 32]);
        let mut s = SecretStream::new(&keys).unwrap();
        assert_eq!(
            s.init(&[0u8; 23]),
            Err(CryptoError::InvalidHeader {
                expected: HBYTES,
                actual: 23
            })
        );
        assert!(!s.initialized());
        // A bad header does not use up the receive key.
        assert!(s.init(&[0u8; HBYTES]).is_ok());
    }

    #[test]
    fn test_decrypt_before_init() {
        let keys = SessionPair::new([3u8; 32], [4u8; 32]);
        let mut s = SecretStream::new(&keys).unwrap();
        assert_eq!(s.decrypt(&[0u8; 20]), Err(CryptoError::NotInitialized));
    }

    #[test]
    fn test_tampered_frame_fails_without_advancing() {
        let (mut a, mut b) = pair();
        let frame = a.encrypt(b"payload");
        let mut bad = frame.clone();
        bad[3] ^= 0x01;
        assert_eq!(b.decrypt(&bad), Err(CryptoError::DecryptionFailed));
        assert_eq!(b.decrypt(&frame).unwrap(), b"payload");
    }

    #[test]
    fn test_truncated_frame() {
        let (_, mut b) = pair();
        assert_eq!(b.decrypt(&[0u8; ABYTES - 1]), Err(CryptoError::DecryptionFailed));
    }

    #[test]
    fn test_out_of_order_fails() {
        let (mut a, mut b) = pair();
        let first = a.encrypt(b"one");
        let second = a.encrypt(b"two");
        assert_eq!(b.decrypt(&second), Err(CryptoError::DecryptionFailed));
        assert_eq!(b.decrypt(&first).unwrap(), b"one");
        assert_eq!(b.decrypt(&second).unwrap(), b"two");
    }

    #[test]
    fn test_tags_roundtrip_and_final() {
        let (mut a, mut b) = pair();
        for tag in [Tag::Message, Tag::Push, Tag::Rekey] {
            let frame = a.encrypt_with_tag(b"x", tag);
            assert_eq!(b.decrypt_with_tag(&frame).unwrap(), (b"x".to_vec(), tag));
        }
        let frame = a.encrypt_with_tag(b"", Tag::Final);
        assert_eq!(b.decrypt_with_tag(&frame).unwrap().1, Tag::Final);
        assert!(b.finished());
        let next = a.encrypt(b"late");
        assert_eq!(b.decrypt(&next), Err(CryptoError::StreamFinished));
    }

    #[test]
    fn test_explicit_rekey_keeps_streams_in_step() {
        let (mut a, mut b) = pair();
        a.push.rekey();
        b.pull.as_mut().unwrap().rekey();
        let frame = a.encrypt(b"after rekey");
        assert_eq!(b.decrypt(&frame).unwrap(), b"after rekey");
    }

    #[test]
    fn test_counter_wrap_rekeys() {
        let key = kat_key();
        let header = kat_header();
        let mut tx = StreamState::init_push_with_header(&key, &header);
        let mut rx = StreamState::init_pull(&key, &header).unwrap();
        tx.nonce[..COUNTER_BYTES].copy_from_slice(&u32::MAX.to_le_bytes());
        rx.nonce[..COUNTER_BYTES].copy_from_slice(&u32::MAX.to_le_bytes());

        let before = tx.key;
        let frame = tx.push(b"wrap", Tag::Message);
        assert_ne!(tx.key, before);
        assert_eq!(&tx.nonce[..COUNTER_BYTES], &1u32.to_le_bytes());
        assert_eq!(rx.pull(&frame).unwrap().0, b"wrap");
        assert_eq!(tx.key, rx.key);
    }

    #[test]
    fn test_unknown_tag_byte() {
        assert_eq!(Tag::try_from(7), Err(CryptoError::UnknownTag(7)));
        assert_eq!(Tag::try_from(3), Ok(Tag::Final));
    }
}
