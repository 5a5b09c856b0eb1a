//! Cryptographic support for the IKEv2 engine
//!
//! PRF and key derivation follow RFC 7296 Sections 2.13 and 2.14; PSK
//! authentication follows Section 2.15. Key exchange and SK payload sealing
//! sit behind the [`CryptoProvider`] trait so the engine never touches
//! cipher primitives directly.

use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::{Sha256, Sha384, Sha512};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::{Error, Result};
use crate::ikev2::payload::{AuthMethod, AuthPayload};
use crate::ikev2::proposal::{DhGroup, PrfId};

/// Key pad for IKEv2 (RFC 7296 Section 2.15)
const KEY_PAD_IKEV2: &[u8] = b"Key Pad for IKEv2";

/// PRF algorithm
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrfAlgorithm {
    /// HMAC-SHA2-256
    HmacSha256,
    /// HMAC-SHA2-384
    HmacSha384,
    /// HMAC-SHA2-512
    HmacSha512,
}

impl PrfAlgorithm {
    /// Map from the negotiated transform ID
    pub fn from_transform(id: PrfId) -> Self {
        match id {
            PrfId::HmacSha256 => PrfAlgorithm::HmacSha256,
            PrfId::HmacSha384 => PrfAlgorithm::HmacSha384,
            PrfId::HmacSha512 => PrfAlgorithm::HmacSha512,
        }
    }

    /// Get PRF output length in bytes
    pub fn output_len(self) -> usize {
        match self {
            PrfAlgorithm::HmacSha256 => 32,
            PrfAlgorithm::HmacSha384 => 48,
            PrfAlgorithm::HmacSha512 => 64,
        }
    }

    /// Compute PRF over data
    pub fn compute(self, key: &[u8], data: &[u8]) -> Vec<u8> {
        // HMAC accepts keys of any size, so new_from_slice cannot fail
        match self {
            PrfAlgorithm::HmacSha256 => {
                let mut mac = Hmac::<Sha256>::new_from_slice(key)
                    .unwrap_or_else(|_| unreachable!());
                mac.update(data);
                mac.finalize().into_bytes().to_vec()
            }
            PrfAlgorithm::HmacSha384 => {
                let mut mac = Hmac::<Sha384>::new_from_slice(key)
                    .unwrap_or_else(|_| unreachable!());
                mac.update(data);
                mac.finalize().into_bytes().to_vec()
            }
            PrfAlgorithm::HmacSha512 => {
                let mut mac = Hmac::<Sha512>::new_from_slice(key)
                    .unwrap_or_else(|_| unreachable!());
                mac.update(data);
                mac.finalize().into_bytes().to_vec()
            }
        }
    }

    /// Compute prf+ (key expansion, RFC 7296 Section 2.13)
    ///
    /// ```text
    /// prf+ (K,S) = T1 | T2 | T3 | ...
    /// T1 = prf (K, S | 0x01)
    /// T2 = prf (K, T1 | S | 0x02)
    /// ...
    /// ```
    pub fn prf_plus(self, key: &[u8], seed: &[u8], output_len: usize) -> Vec<u8> {
        let mut output = Vec::with_capacity(output_len);
        let mut t = Vec::new();
        let mut counter: u8 = 1;

        while output.len() < output_len {
            let mut input = Vec::new();
            input.extend_from_slice(&t);
            input.extend_from_slice(seed);
            input.push(counter);

            t = self.compute(key, &input);
            output.extend_from_slice(&t);

            counter += 1;
        }

        output.truncate(output_len);
        output
    }
}

/// IKE SA key material derived from SKEYSEED (RFC 7296 Section 2.14)
#[derive(Debug, Clone, Zeroize, ZeroizeOnDrop)]
pub struct IkeKeys {
    /// SK_d, for deriving Child SA keys
    pub sk_d: Vec<u8>,

    /// SK_ai, initiator's integrity key
    pub sk_ai: Vec<u8>,

    /// SK_ar, responder's integrity key
    pub sk_ar: Vec<u8>,

    /// SK_ei, initiator's encryption key
    pub sk_ei: Vec<u8>,

    /// SK_er, responder's encryption key
    pub sk_er: Vec<u8>,

    /// SK_pi, initiator's AUTH payload key
    pub sk_pi: Vec<u8>,

    /// SK_pr, responder's AUTH payload key
    pub sk_pr: Vec<u8>,
}

impl IkeKeys {
    /// Derive IKE SA key material
    ///
    /// ```text
    /// SKEYSEED = prf(Ni | Nr, g^ir)
    /// {SK_d | SK_ai | SK_ar | SK_ei | SK_er | SK_pi | SK_pr}
    ///     = prf+ (SKEYSEED, Ni | Nr | SPIi | SPIr)
    /// ```
    #[allow(clippy::too_many_arguments)]
    pub fn derive(
        prf_alg: PrfAlgorithm,
        nonce_i: &[u8],
        nonce_r: &[u8],
        shared_secret: &[u8],
        spi_i: u64,
        spi_r: u64,
        encr_key_len: usize,
        integ_key_len: usize,
    ) -> Self {
        let mut prf_key = Vec::new();
        prf_key.extend_from_slice(nonce_i);
        prf_key.extend_from_slice(nonce_r);
        let skeyseed = prf_alg.compute(&prf_key, shared_secret);

        let mut seed = Vec::new();
        seed.extend_from_slice(nonce_i);
        seed.extend_from_slice(nonce_r);
        seed.extend_from_slice(&spi_i.to_be_bytes());
        seed.extend_from_slice(&spi_r.to_be_bytes());

        let prf_len = prf_alg.output_len();
        let total_len = prf_len + 2 * integ_key_len + 2 * encr_key_len + 2 * prf_len;

        let keymat = prf_alg.prf_plus(&skeyseed, &seed, total_len);

        let mut offset = 0;
        let mut take = |len: usize| {
            let slice = keymat[offset..offset + len].to_vec();
            offset += len;
            slice
        };

        let sk_d = take(prf_len);
        let sk_ai = take(integ_key_len);
        let sk_ar = take(integ_key_len);
        let sk_ei = take(encr_key_len);
        let sk_er = take(encr_key_len);
        let sk_pi = take(prf_len);
        let sk_pr = take(prf_len);

        IkeKeys {
            sk_d,
            sk_ai,
            sk_ar,
            sk_ei,
            sk_er,
            sk_pi,
            sk_pr,
        }
    }

    /// Derive rekeyed IKE SA keys (RFC 7296 Section 2.18)
    ///
    /// ```text
    /// SKEYSEED = prf(SK_d (old), g^ir (new) | Ni | Nr)
    /// ```
    #[allow(clippy::too_many_arguments)]
    pub fn derive_rekeyed(
        prf_alg: PrfAlgorithm,
        old_sk_d: &[u8],
        nonce_i: &[u8],
        nonce_r: &[u8],
        shared_secret: &[u8],
        spi_i: u64,
        spi_r: u64,
        encr_key_len: usize,
        integ_key_len: usize,
    ) -> Self {
        let mut input = Vec::new();
        input.extend_from_slice(shared_secret);
        input.extend_from_slice(nonce_i);
        input.extend_from_slice(nonce_r);
        let skeyseed = prf_alg.compute(old_sk_d, &input);

        let mut seed = Vec::new();
        seed.extend_from_slice(nonce_i);
        seed.extend_from_slice(nonce_r);
        seed.extend_from_slice(&spi_i.to_be_bytes());
        seed.extend_from_slice(&spi_r.to_be_bytes());

        let prf_len = prf_alg.output_len();
        let total_len = prf_len + 2 * integ_key_len + 2 * encr_key_len + 2 * prf_len;
        let keymat = prf_alg.prf_plus(&skeyseed, &seed, total_len);

        let mut offset = 0;
        let mut take = |len: usize| {
            let slice = keymat[offset..offset + len].to_vec();
            offset += len;
            slice
        };

        IkeKeys {
            sk_d: take(prf_len),
            sk_ai: take(integ_key_len),
            sk_ar: take(integ_key_len),
            sk_ei: take(encr_key_len),
            sk_er: take(encr_key_len),
            sk_pi: take(prf_len),
            sk_pr: take(prf_len),
        }
    }
}

/// Child SA key material (RFC 7296 Section 2.17)
#[derive(Debug, Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct ChildKeys {
    /// Initiator-to-responder encryption key
    pub sk_ei: Vec<u8>,

    /// Initiator-to-responder integrity key
    pub sk_ai: Vec<u8>,

    /// Responder-to-initiator encryption key
    pub sk_er: Vec<u8>,

    /// Responder-to-initiator integrity key
    pub sk_ar: Vec<u8>,
}

impl ChildKeys {
    /// Derive Child SA key material
    ///
    /// ```text
    /// KEYMAT = prf+(SK_d, Ni | Nr)
    /// ```
    ///
    /// With PFS, the new DH shared secret is prepended to the nonces.
    pub fn derive(
        prf_alg: PrfAlgorithm,
        sk_d: &[u8],
        nonce_i: &[u8],
        nonce_r: &[u8],
        shared_secret: Option<&[u8]>,
        encr_key_len: usize,
        integ_key_len: usize,
    ) -> Self {
        let mut seed = Vec::new();
        if let Some(secret) = shared_secret {
            seed.extend_from_slice(secret);
        }
        seed.extend_from_slice(nonce_i);
        seed.extend_from_slice(nonce_r);

        let total_len = 2 * encr_key_len + 2 * integ_key_len;
        let keymat = prf_alg.prf_plus(sk_d, &seed, total_len);

        // Keys are taken in order: initiator-to-responder first
        let mut offset = 0;
        let mut take = |len: usize| {
            let slice = keymat[offset..offset + len].to_vec();
            offset += len;
            slice
        };

        let sk_ei = take(encr_key_len);
        let sk_ai = take(integ_key_len);
        let sk_er = take(encr_key_len);
        let sk_ar = take(integ_key_len);

        ChildKeys {
            sk_ei,
            sk_ai,
            sk_er,
            sk_ar,
        }
    }
}

/// Compute AUTH payload for PSK authentication (RFC 7296 Section 2.15)
///
/// ```text
/// AUTH = prf(prf(SK_p, "Key Pad for IKEv2"), <SignedOctets>)
/// ```
pub fn compute_psk_auth(prf_alg: PrfAlgorithm, sk_p: &[u8], signed_octets: &[u8]) -> AuthPayload {
    let prf1 = prf_alg.compute(sk_p, KEY_PAD_IKEV2);
    let auth_data = prf_alg.compute(&prf1, signed_octets);
    AuthPayload::new(AuthMethod::SharedKeyMic, auth_data)
}

/// Verify AUTH payload for PSK authentication
///
/// Comparison is constant time.
pub fn verify_psk_auth(
    prf_alg: PrfAlgorithm,
    sk_p: &[u8],
    signed_octets: &[u8],
    received_auth: &AuthPayload,
) -> Result<()> {
    if received_auth.auth_method != AuthMethod::SharedKeyMic {
        return Err(Error::AuthenticationFailed(format!(
            "Expected PSK auth, got {:?}",
            received_auth.auth_method
        )));
    }

    let expected = compute_psk_auth(prf_alg, sk_p, signed_octets);

    if expected.auth_data.len() != received_auth.auth_data.len() {
        return Err(Error::AuthenticationFailed(
            "AUTH data length mismatch".to_string(),
        ));
    }

    let mut diff = 0u8;
    for (a, b) in expected.auth_data.iter().zip(received_auth.auth_data.iter()) {
        diff |= a ^ b;
    }
    if diff != 0 {
        return Err(Error::AuthenticationFailed(
            "AUTH verification failed".to_string(),
        ));
    }

    Ok(())
}

/// Construct signed octets (RFC 7296 Section 2.15)
///
/// ```text
/// SignedOctets = RealMessage | NoncePeer | prf(SK_p, ID')
/// ```
///
/// The initiator signs its own IKE_SA_INIT request with the responder's
/// nonce and IDi'; the responder signs its IKE_SA_INIT response with the
/// initiator's nonce and IDr'.
pub fn construct_signed_octets(
    prf_alg: PrfAlgorithm,
    real_message: &[u8],
    peer_nonce: &[u8],
    sk_p: &[u8],
    id_data: &[u8],
) -> Vec<u8> {
    let mut signed_octets = Vec::new();
    signed_octets.extend_from_slice(real_message);
    signed_octets.extend_from_slice(peer_nonce);
    let id_hash = prf_alg.compute(sk_p, id_data);
    signed_octets.extend_from_slice(&id_hash);
    signed_octets
}

/// A Diffie-Hellman keypair produced by a provider
#[derive(Debug, Clone, Zeroize, ZeroizeOnDrop)]
pub struct DhKeyPair {
    /// Public value, sent in the KE payload
    pub public: Vec<u8>,

    /// Private value, kept local
    pub private: Vec<u8>,
}

/// Provider of key exchange, sealing and signature operations
///
/// The engine calls into this trait for everything that touches cipher
/// primitives. Implementations must be usable from the session task.
pub trait CryptoProvider: Send + Sync {
    /// Generate an ephemeral DH keypair for the given group
    fn generate_dh_keypair(&self, group: DhGroup) -> Result<DhKeyPair>;

    /// Compute the DH shared secret from our private value and the peer's
    /// public value
    fn compute_shared_secret(
        &self,
        group: DhGroup,
        private: &[u8],
        peer_public: &[u8],
    ) -> Result<Vec<u8>>;

    /// Seal plaintext for an SK payload
    ///
    /// `aad` is the associated data (the IKE header and SK payload header up
    /// to the ciphertext). Output layout is implementation defined but must
    /// round-trip through [`CryptoProvider::open`].
    fn seal(&self, key: &[u8], plaintext: &[u8], aad: &[u8]) -> Result<Vec<u8>>;

    /// Open a sealed SK payload body
    fn open(&self, key: &[u8], sealed: &[u8], aad: &[u8]) -> Result<Vec<u8>>;

    /// Sign octets with the configured private key (digital signature auth)
    fn sign(&self, _key_blob: &[u8], _octets: &[u8]) -> Result<Vec<u8>> {
        Err(Error::CryptoError(
            "Signature authentication not supported by this provider".to_string(),
        ))
    }

    /// Verify a peer signature against the configured trust anchors
    fn verify_signature(
        &self,
        _trust_blob: &[u8],
        _octets: &[u8],
        _signature: &[u8],
    ) -> Result<()> {
        Err(Error::CryptoError(
            "Signature authentication not supported by this provider".to_string(),
        ))
    }
}

/// Default provider
///
/// SK payloads are sealed with AES-GCM. The DH exchange uses randomly
/// generated placeholder values; swap in a real group implementation before
/// interoperating with external peers.
#[derive(Debug, Default)]
pub struct StandardCryptoProvider;

impl StandardCryptoProvider {
    /// Create a new provider
    pub fn new() -> Self {
        StandardCryptoProvider
    }

    fn dh_public_len(group: DhGroup) -> usize {
        match group {
            DhGroup::None => 0,
            DhGroup::Group14 => 256,
            DhGroup::Group15 => 384,
            DhGroup::Group16 => 512,
            DhGroup::Group31 => 32,
        }
    }
}

const GCM_NONCE_LEN: usize = 12;

impl CryptoProvider for StandardCryptoProvider {
    fn generate_dh_keypair(&self, group: DhGroup) -> Result<DhKeyPair> {
        if group == DhGroup::None {
            return Err(Error::InvalidParameter(
                "Cannot generate keypair for DH group NONE".to_string(),
            ));
        }
        let len = Self::dh_public_len(group);
        let mut public = vec![0u8; len];
        let mut private = vec![0u8; len];
        rand::thread_rng().fill_bytes(&mut public);
        rand::thread_rng().fill_bytes(&mut private);
        Ok(DhKeyPair { public, private })
    }

    fn compute_shared_secret(
        &self,
        group: DhGroup,
        private: &[u8],
        peer_public: &[u8],
    ) -> Result<Vec<u8>> {
        if group == DhGroup::None {
            return Err(Error::InvalidParameter(
                "Cannot compute shared secret for DH group NONE".to_string(),
            ));
        }
        if private.is_empty() || peer_public.is_empty() {
            return Err(Error::CryptoError("Empty DH value".to_string()));
        }
        // Placeholder derivation pending a real group implementation
        let mut input = Vec::with_capacity(private.len() + peer_public.len());
        input.extend_from_slice(private);
        input.extend_from_slice(peer_public);
        Ok(PrfAlgorithm::HmacSha256.compute(b"dh-shared-secret", &input))
    }

    fn seal(&self, key: &[u8], plaintext: &[u8], aad: &[u8]) -> Result<Vec<u8>> {
        use aes_gcm::aead::{Aead, KeyInit, Payload};
        use aes_gcm::{Aes128Gcm, Aes256Gcm, Nonce};

        let mut nonce_bytes = [0u8; GCM_NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);
        let payload = Payload {
            msg: plaintext,
            aad,
        };

        let ciphertext = match key.len() {
            16 => Aes128Gcm::new_from_slice(key)
                .map_err(|_| Error::CryptoError("Bad AES-128 key".to_string()))?
                .encrypt(nonce, payload)
                .map_err(|_| Error::CryptoError("AEAD seal failed".to_string()))?,
            32 => Aes256Gcm::new_from_slice(key)
                .map_err(|_| Error::CryptoError("Bad AES-256 key".to_string()))?
                .encrypt(nonce, payload)
                .map_err(|_| Error::CryptoError("AEAD seal failed".to_string()))?,
            other => {
                return Err(Error::CryptoError(format!(
                    "Unsupported AES-GCM key length: {}",
                    other
                )))
            }
        };

        let mut out = Vec::with_capacity(GCM_NONCE_LEN + ciphertext.len());
        out.extend_from_slice(&nonce_bytes);
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    fn open(&self, key: &[u8], sealed: &[u8], aad: &[u8]) -> Result<Vec<u8>> {
        use aes_gcm::aead::{Aead, KeyInit, Payload};
        use aes_gcm::{Aes128Gcm, Aes256Gcm, Nonce};

        if sealed.len() < GCM_NONCE_LEN {
            return Err(Error::BufferTooShort {
                required: GCM_NONCE_LEN,
                available: sealed.len(),
            });
        }
        let nonce = Nonce::from_slice(&sealed[..GCM_NONCE_LEN]);
        let payload = Payload {
            msg: &sealed[GCM_NONCE_LEN..],
            aad,
        };

        let plaintext = match key.len() {
            16 => Aes128Gcm::new_from_slice(key)
                .map_err(|_| Error::CryptoError("Bad AES-128 key".to_string()))?
                .decrypt(nonce, payload)
                .map_err(|_| Error::CryptoError("AEAD open failed".to_string()))?,
            32 => Aes256Gcm::new_from_slice(key)
                .map_err(|_| Error::CryptoError("Bad AES-256 key".to_string()))?
                .decrypt(nonce, payload)
                .map_err(|_| Error::CryptoError("AEAD open failed".to_string()))?,
            other => {
                return Err(Error::CryptoError(format!(
                    "Unsupported AES-GCM key length: {}",
                    other
                )))
            }
        };

        Ok(plaintext)
    }
}

/// Transparent provider for tests and loopback harnesses
///
/// Sealing is the identity function and the DH shared secret is a fixed
/// constant, so two cores configured with this provider derive identical
/// key material from the public handshake values alone.
#[derive(Debug, Default)]
pub struct PassthroughCrypto;

impl PassthroughCrypto {
    /// Create a new passthrough provider
    pub fn new() -> Self {
        PassthroughCrypto
    }
}

impl CryptoProvider for PassthroughCrypto {
    fn generate_dh_keypair(&self, _group: DhGroup) -> Result<DhKeyPair> {
        let mut public = vec![0u8; 32];
        rand::thread_rng().fill_bytes(&mut public);
        Ok(DhKeyPair {
            public,
            private: vec![0u8; 32],
        })
    }

    fn compute_shared_secret(
        &self,
        _group: DhGroup,
        _private: &[u8],
        _peer_public: &[u8],
    ) -> Result<Vec<u8>> {
        Ok(vec![0x5a; 32])
    }

    fn seal(&self, _key: &[u8], plaintext: &[u8], _aad: &[u8]) -> Result<Vec<u8>> {
        Ok(plaintext.to_vec())
    }

    fn open(&self, _key: &[u8], sealed: &[u8], _aad: &[u8]) -> Result<Vec<u8>> {
        Ok(sealed.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prf_output_len() {
        assert_eq!(PrfAlgorithm::HmacSha256.output_len(), 32);
        assert_eq!(PrfAlgorithm::HmacSha384.output_len(), 48);
        assert_eq!(PrfAlgorithm::HmacSha512.output_len(), 64);
    }

    #[test]
    fn test_prf_deterministic() {
        let a = PrfAlgorithm::HmacSha256.compute(b"key", b"data");
        let b = PrfAlgorithm::HmacSha256.compute(b"key", b"data");
        assert_eq!(a, b);
        assert_eq!(a.len(), 32);
    }

    #[test]
    fn test_prf_plus_prefix_property() {
        let short = PrfAlgorithm::HmacSha256.prf_plus(b"key", b"seed", 16);
        let long = PrfAlgorithm::HmacSha256.prf_plus(b"key", b"seed", 100);
        assert_eq!(&short[..], &long[..16]);
        assert_eq!(long.len(), 100);
    }

    #[test]
    fn test_ike_keys_derivation() {
        let keys = IkeKeys::derive(
            PrfAlgorithm::HmacSha256,
            &[0x01; 32],
            &[0x02; 32],
            &[0x03; 32],
            0x0404040404040404,
            0x0505050505050505,
            32,
            0,
        );

        assert_eq!(keys.sk_d.len(), 32);
        assert_eq!(keys.sk_ai.len(), 0);
        assert_eq!(keys.sk_ei.len(), 32);
        assert_eq!(keys.sk_pi.len(), 32);
        assert_ne!(keys.sk_ei, keys.sk_er);
        assert_ne!(keys.sk_pi, keys.sk_pr);
    }

    #[test]
    fn test_ike_keys_symmetric_derivation() {
        // Both sides of a handshake must derive the same material
        let a = IkeKeys::derive(
            PrfAlgorithm::HmacSha256,
            &[0xAA; 32],
            &[0xBB; 32],
            &[0x5a; 32],
            1,
            2,
            32,
            0,
        );
        let b = IkeKeys::derive(
            PrfAlgorithm::HmacSha256,
            &[0xAA; 32],
            &[0xBB; 32],
            &[0x5a; 32],
            1,
            2,
            32,
            0,
        );
        assert_eq!(a.sk_ei, b.sk_ei);
        assert_eq!(a.sk_d, b.sk_d);
    }

    #[test]
    fn test_rekeyed_keys_differ_from_original() {
        let original = IkeKeys::derive(
            PrfAlgorithm::HmacSha256,
            &[0x01; 32],
            &[0x02; 32],
            &[0x03; 32],
            1,
            2,
            32,
            0,
        );
        let rekeyed = IkeKeys::derive_rekeyed(
            PrfAlgorithm::HmacSha256,
            &original.sk_d,
            &[0x11; 32],
            &[0x12; 32],
            &[0x13; 32],
            3,
            4,
            32,
            0,
        );
        assert_ne!(original.sk_ei, rekeyed.sk_ei);
        assert_ne!(original.sk_d, rekeyed.sk_d);
    }

    #[test]
    fn test_child_keys_derivation() {
        let keys = ChildKeys::derive(
            PrfAlgorithm::HmacSha256,
            &[0x07; 32],
            &[0x01; 32],
            &[0x02; 32],
            None,
            16,
            0,
        );
        assert_eq!(keys.sk_ei.len(), 16);
        assert_eq!(keys.sk_er.len(), 16);
        assert_ne!(keys.sk_ei, keys.sk_er);

        // PFS changes the material
        let pfs = ChildKeys::derive(
            PrfAlgorithm::HmacSha256,
            &[0x07; 32],
            &[0x01; 32],
            &[0x02; 32],
            Some(&[0x09; 32]),
            16,
            0,
        );
        assert_ne!(keys.sk_ei, pfs.sk_ei);
    }

    #[test]
    fn test_psk_auth_roundtrip() {
        let prf = PrfAlgorithm::HmacSha256;
        let sk_p = vec![0x03; 32];
        let octets = vec![0x04; 100];

        let auth = compute_psk_auth(prf, &sk_p, &octets);
        assert!(verify_psk_auth(prf, &sk_p, &octets, &auth).is_ok());

        let result = verify_psk_auth(prf, &sk_p, &[0x05; 100], &auth);
        assert!(matches!(result, Err(Error::AuthenticationFailed(_))));

        let result = verify_psk_auth(prf, &[0x06; 32], &octets, &auth);
        assert!(matches!(result, Err(Error::AuthenticationFailed(_))));
    }

    #[test]
    fn test_psk_auth_wrong_method_rejected() {
        let prf = PrfAlgorithm::HmacSha256;
        let wrong = AuthPayload::new(AuthMethod::RsaSig, vec![0xFF; 32]);
        let result = verify_psk_auth(prf, &[0x01; 32], &[0x02; 50], &wrong);
        assert!(matches!(result, Err(Error::AuthenticationFailed(_))));
    }

    #[test]
    fn test_signed_octets_layout() {
        let octets = construct_signed_octets(
            PrfAlgorithm::HmacSha256,
            &[0x01; 200],
            &[0x02; 32],
            &[0x03; 32],
            &[0x04; 20],
        );
        assert_eq!(octets.len(), 200 + 32 + 32);
        assert_eq!(&octets[..200], &[0x01; 200][..]);
    }

    #[test]
    fn test_standard_seal_open_roundtrip() {
        let provider = StandardCryptoProvider::new();
        let key = vec![0x42; 32];
        let aad = b"header bytes";
        let plaintext = b"the quick brown fox";

        let sealed = provider.seal(&key, plaintext, aad).unwrap();
        assert_ne!(&sealed[GCM_NONCE_LEN..], plaintext.as_slice());

        let opened = provider.open(&key, &sealed, aad).unwrap();
        assert_eq!(opened, plaintext);
    }

    #[test]
    fn test_standard_open_rejects_tamper() {
        let provider = StandardCryptoProvider::new();
        let key = vec![0x42; 16];
        let mut sealed = provider.seal(&key, b"payload", b"aad").unwrap();
        let last = sealed.len() - 1;
        sealed[last] ^= 0x01;

        let result = provider.open(&key, &sealed, b"aad");
        assert!(matches!(result, Err(Error::CryptoError(_))));
    }

    #[test]
    fn test_standard_open_rejects_wrong_aad() {
        let provider = StandardCryptoProvider::new();
        let key = vec![0x42; 16];
        let sealed = provider.seal(&key, b"payload", b"aad one").unwrap();
        let result = provider.open(&key, &sealed, b"aad two");
        assert!(result.is_err());
    }

    #[test]
    fn test_passthrough_shared_secret_is_symmetric() {
        let provider = PassthroughCrypto::new();
        let a = provider
            .compute_shared_secret(DhGroup::Group14, &[1], &[2])
            .unwrap();
        let b = provider
            .compute_shared_secret(DhGroup::Group14, &[3], &[4])
            .unwrap();
        assert_eq!(a, b);
    }
}
