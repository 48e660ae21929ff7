use std::{sync::Arc, time::Duration};

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use rand::RngCore;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use thiserror::Error;
use xsalsa20poly1305::{
    aead::{Aead, KeyInit},
    Key, Nonce, XSalsa20Poly1305,
};

use super::Clock;

/// Length of the random nonce, in bytes. 192 bits of randomness makes
/// collisions across the lifetime of a secret practically impossible.
pub const NONCE_LEN: usize = 24;
const KEY_LEN: usize = 32;

/// The number of base64url characters a sealed nonce decodes to. Used by the
/// cookie store to split a sealed `OAuthState` into its `state` query
/// parameter half and its companion-cookie half.
pub fn state_key_len() -> usize {
    base64::encoded_len(NONCE_LEN, false).expect("NONCE_LEN fits in usize")
}

#[derive(Debug, Error)]
pub enum SealedBoxError {
    #[error(
        "the cookie secret should be a 64-character hex-encoded string. \
         here's a freshly generated one: \"{sample}\""
    )]
    InvalidSecret { sample: String },
}

/// `{ not_after, payload }` — the only structure the cryptographic layer
/// understands. Higher layers (the cookie store) hand it their own
/// serialized payload bytes and never see the envelope directly.
#[derive(Debug, Serialize, Deserialize)]
struct TimeEnvelope {
    not_after: i64,
    payload: Vec<u8>,
}

/// Authenticated encryption of a time-bounded envelope, using a secret-key
/// construction equivalent to NaCl's `secretbox` (XSalsa20-Poly1305) with a
/// fresh 24-byte nonce per call to [`seal`](Self::seal).
pub struct SealedBox {
    cipher: XSalsa20Poly1305,
    clock: Arc<dyn Clock>,
}

impl SealedBox {
    /// Builds a `SealedBox` from a 64-character hex-encoded 32-byte secret.
    /// If the secret is missing or malformed, construction fails with a
    /// message that includes a freshly generated sample key.
    pub fn new(hex_secret: &str, clock: Arc<dyn Clock>) -> Result<Self, SealedBoxError> {
        let key_bytes = hex::decode(hex_secret)
            .ok()
            .filter(|bytes| bytes.len() == KEY_LEN);

        let Some(key_bytes) = key_bytes else {
            let mut sample = [0u8; KEY_LEN];
            rand::rngs::OsRng.fill_bytes(&mut sample);
            return Err(SealedBoxError::InvalidSecret {
                sample: hex::encode(sample),
            });
        };

        Ok(Self {
            cipher: XSalsa20Poly1305::new(Key::from_slice(&key_bytes)),
            clock,
        })
    }

    /// The clock this box seals and opens against. Callers that need to stamp
    /// their own timestamps (e.g. cookie `Expires` attributes) share it
    /// rather than reaching for `SystemTime::now()` independently.
    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Seals `payload` into a time-boxed, authenticated string good for
    /// `max_age`. Fails only if the payload can't be serialized or if
    /// `now + max_age` overflows the timestamp representation.
    pub fn seal<T: Serialize>(&self, payload: &T, max_age: Duration) -> anyhow::Result<String> {
        let payload_bytes = serde_json::to_vec(payload)?;

        let not_after = self
            .clock
            .now()
            .checked_add(i64::try_from(max_age.as_secs())?)
            .ok_or_else(|| anyhow::anyhow!("expiry timestamp overflow"))?;

        let envelope_bytes = serde_json::to_vec(&TimeEnvelope {
            not_after,
            payload: payload_bytes,
        })?;

        let mut nonce_bytes = [0u8; NONCE_LEN];
        rand::rngs::OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = self
            .cipher
            .encrypt(nonce, envelope_bytes.as_ref())
            .map_err(|_| anyhow::anyhow!("failed to seal payload"))?;

        let mut wire = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        wire.extend_from_slice(&nonce_bytes);
        wire.extend_from_slice(&ciphertext);

        Ok(URL_SAFE_NO_PAD.encode(wire))
    }

    /// Attempts to open a sealed string into `T`. Any failure along the way —
    /// bad base64, too-short input, forged ciphertext, expired envelope,
    /// malformed payload — is indistinguishable from any other and yields
    /// `None`. There is no partial result.
    pub fn open<T: DeserializeOwned>(&self, sealed: &str) -> Option<T> {
        let wire = URL_SAFE_NO_PAD.decode(sealed).ok()?;
        if wire.len() < NONCE_LEN + 1 {
            return None;
        }

        let (nonce_bytes, ciphertext) = wire.split_at(NONCE_LEN);
        let nonce = Nonce::from_slice(nonce_bytes);

        let envelope_bytes = self.cipher.decrypt(nonce, ciphertext).ok()?;
        let envelope: TimeEnvelope = serde_json::from_slice(&envelope_bytes).ok()?;

        if self.clock.now() > envelope.not_after {
            return None;
        }

        serde_json::from_slice(&envelope.payload).ok()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use serde::{Deserialize, Serialize};

    use super::*;
    use crate::crypto::clock::FixedClock;

    const SECRET: &str = "000102030405060708090a0b0c0d0e0f101112131415161718191a1b1c1d1e";

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Payload {
        value: String,
    }

    fn sealed_box(clock: FixedClock) -> SealedBox {
        SealedBox::new(SECRET, Arc::new(clock)).expect("valid secret")
    }

    #[test]
    fn round_trips_before_expiry() {
        let clock = FixedClock::new(1000);
        let sb = sealed_box(clock.clone());
        let payload = Payload { value: "hello".into() };

        let sealed = sb.seal(&payload, Duration::from_secs(60)).unwrap();
        let opened: Option<Payload> = sb.open(&sealed);

        assert_eq!(opened, Some(payload));
    }

    #[test]
    fn rejects_after_expiry() {
        let clock = FixedClock::new(1000);
        let sb = sealed_box(clock.clone());
        let payload = Payload { value: "hello".into() };

        let sealed = sb.seal(&payload, Duration::from_secs(0)).unwrap();
        clock.advance(1);

        let opened: Option<Payload> = sb.open(&sealed);
        assert_eq!(opened, None);
    }

    #[test]
    fn rejects_tampered_ciphertext() {
        let clock = FixedClock::new(1000);
        let sb = sealed_box(clock);
        let payload = Payload { value: "hello".into() };

        let sealed = sb.seal(&payload, Duration::from_secs(60)).unwrap();
        let mut raw = URL_SAFE_NO_PAD.decode(&sealed).unwrap();
        let last = raw.len() - 1;
        raw[last] ^= 0xFF;
        let tampered = URL_SAFE_NO_PAD.encode(raw);

        let opened: Option<Payload> = sb.open(&tampered);
        assert_eq!(opened, None);
    }

    #[test]
    fn distinct_seals_produce_distinct_ciphertexts() {
        let clock = FixedClock::new(1000);
        let sb = sealed_box(clock);
        let payload = Payload { value: "hello".into() };

        let a = sb.seal(&payload, Duration::from_secs(60)).unwrap();
        let b = sb.seal(&payload, Duration::from_secs(60)).unwrap();

        assert_ne!(a, b);
    }

    #[test]
    fn invalid_secret_reports_sample_key() {
        let clock = Arc::new(FixedClock::new(0));
        let err = SealedBox::new("not long enough", clock).unwrap_err();
        let message = err.to_string();
        assert!(message.contains("64-character hex-encoded string"));
    }

    #[test]
    fn state_key_len_matches_encoded_nonce_length() {
        assert_eq!(state_key_len(), 32);
    }
}
