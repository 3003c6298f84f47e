use crate::status::StatusCode;
use crate::types::ByteString;
use blake2::Blake2s256;
use hmac::{Mac, SimpleHmac};
use std::any::Any;

pub const SECURITY_POLICY_NONE_URI: &str = "http://opcfoundation.org/UA/SecurityPolicy#None";

/// Certificate thumbprints are SHA1 digests, always 20 bytes.
pub const THUMBPRINT_LENGTH: usize = 20;

/// Per-channel mutable crypto state. Implementations downcast through
/// `as_any` to reach their own key storage; the channel only ever installs
/// derived key material and reads the remote certificate back.
pub trait ChannelContext {
    fn set_local_sym_signing_key(&mut self, key: &[u8]);
    fn set_local_sym_encrypting_key(&mut self, key: &[u8]);
    fn set_local_sym_iv(&mut self, iv: &[u8]);
    fn set_remote_sym_signing_key(&mut self, key: &[u8]);
    fn set_remote_sym_encrypting_key(&mut self, key: &[u8]);
    fn set_remote_sym_iv(&mut self, iv: &[u8]);
    fn remote_certificate(&self) -> &ByteString;
    fn as_any(&self) -> &dyn Any;
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

/// Symmetric algorithm bundle of a policy. All operations work in place and
/// preserve the data length.
pub trait SymmetricModule {
    fn signature_size(&self) -> usize;
    fn signing_key_length(&self) -> usize;
    fn encryption_key_length(&self) -> usize;
    fn encryption_block_size(&self) -> usize;

    fn encryption_key_bits(&self) -> usize {
        self.encryption_key_length() * 8
    }

    fn sign(
        &self,
        context: &dyn ChannelContext,
        data: &[u8],
        signature: &mut [u8],
    ) -> Result<(), StatusCode>;

    fn verify(
        &self,
        context: &dyn ChannelContext,
        data: &[u8],
        signature: &[u8],
    ) -> Result<(), StatusCode>;

    fn encrypt(&self, context: &dyn ChannelContext, data: &mut [u8]) -> Result<(), StatusCode>;

    fn decrypt(&self, context: &dyn ChannelContext, data: &mut [u8]) -> Result<(), StatusCode>;
}

/// Asymmetric algorithm bundle, used for the OPN exchange only. Encryption
/// may grow the data (RSA block overhead), decryption reports the shrunk
/// plaintext length.
pub trait AsymmetricModule {
    /// Size of a signature produced with the local private key.
    fn local_signature_size(&self, context: &dyn ChannelContext) -> usize;

    /// Size of a signature made by the peer.
    fn remote_signature_size(&self, context: &dyn ChannelContext) -> usize;

    /// Plaintext block size of the peer's public key.
    fn remote_plain_text_block_size(&self, context: &dyn ChannelContext) -> usize;

    /// Modulus size of the peer's encryption key in bits. Decides whether
    /// the extra-padding byte is present when sending.
    fn remote_encryption_key_bits(&self, context: &dyn ChannelContext) -> usize;

    /// Modulus size of the local decryption key in bits. Decides whether
    /// the extra-padding byte is present when receiving.
    fn local_encryption_key_bits(&self, context: &dyn ChannelContext) -> usize;

    /// Additional bytes the encryption adds for `data_length` plaintext
    /// bytes.
    fn encryption_overhead(&self, _context: &dyn ChannelContext, _data_length: usize) -> usize {
        0
    }

    fn sign(
        &self,
        context: &dyn ChannelContext,
        data: &[u8],
        signature: &mut [u8],
    ) -> Result<(), StatusCode>;

    fn verify(
        &self,
        context: &dyn ChannelContext,
        data: &[u8],
        signature: &[u8],
    ) -> Result<(), StatusCode>;

    /// Encrypts `buffer[offset..]` with the remote public key, resizing the
    /// buffer if the ciphertext is larger than the plaintext.
    fn encrypt(
        &self,
        context: &dyn ChannelContext,
        buffer: &mut Vec<u8>,
        offset: usize,
    ) -> Result<(), StatusCode>;

    /// Decrypts `data` in place with the local private key and returns the
    /// plaintext length.
    fn decrypt(&self, context: &dyn ChannelContext, data: &mut [u8]) -> Result<usize, StatusCode>;
}

/// Stateless capability bundle of a security policy. Kept object-safe so
/// channels can hold a set of policies behind `Rc<dyn SecurityPolicy>`.
pub trait SecurityPolicy {
    fn policy_uri(&self) -> &str;

    fn local_certificate(&self) -> &ByteString;

    fn secure_channel_nonce_length(&self) -> usize;

    fn asymmetric(&self) -> &dyn AsymmetricModule;

    fn symmetric(&self) -> &dyn SymmetricModule;

    /// Creates the per-channel context, parsing the remote certificate.
    fn make_channel_context(
        &self,
        remote_certificate: &ByteString,
    ) -> Result<Box<dyn ChannelContext>, StatusCode>;

    /// SHA1 thumbprint of a certificate; null for a null certificate.
    fn certificate_thumbprint(&self, certificate: &ByteString) -> ByteString;

    /// Trust and revocation check of the peer certificate. The concrete
    /// trust store lives behind the policy implementation.
    fn verify_certificate(&self, certificate: &ByteString) -> Result<(), StatusCode>;

    fn generate_nonce(&self, out: &mut [u8]) -> Result<(), StatusCode>;

    /// The key-derivation PRF. Fills `out` from `secret` and `seed`; callers
    /// size `out` as signing key + encryption key + block size (IV).
    fn generate_key(&self, secret: &[u8], seed: &[u8], out: &mut [u8])
        -> Result<(), StatusCode>;
}

/// P_HASH-style pseudo random function over HMAC-Blake2s:
/// A(1) = HMAC(secret, seed), A(i+1) = HMAC(secret, A(i)),
/// out = HMAC(secret, A(1) || seed) || HMAC(secret, A(2) || seed) || ...
pub fn derive_key_material(
    secret: &[u8],
    seed: &[u8],
    out: &mut [u8],
) -> Result<(), StatusCode> {
    type Prf = SimpleHmac<Blake2s256>;

    fn prf(key: &[u8]) -> Result<Prf, StatusCode> {
        Prf::new_from_slice(key).map_err(|_| StatusCode::BAD_INTERNAL_ERROR)
    }

    if out.is_empty() {
        return Ok(());
    }

    let mut a = {
        let mut mac = prf(secret)?;
        mac.update(seed);
        mac.finalize().into_bytes()
    };

    let mut offset = 0;
    while offset < out.len() {
        let mut mac = prf(secret)?;
        mac.update(a.as_slice());
        mac.update(seed);
        let block = mac.finalize().into_bytes();
        let block = block.as_slice();

        let take = (out.len() - offset).min(block.len());
        out[offset..offset + take].copy_from_slice(&block[..take]);
        offset += take;

        let mut next = prf(secret)?;
        next.update(a.as_slice());
        a = next.finalize().into_bytes();
    }
    Ok(())
}

/// The mandatory "None" policy: no certificates, no signatures, no
/// encryption. All size queries return zero and all operations are the
/// identity.
pub struct PolicyNone {
    certificate: ByteString,
}

struct NoneContext {
    remote_certificate: ByteString,
}

impl ChannelContext for NoneContext {
    fn set_local_sym_signing_key(&mut self, _key: &[u8]) {}
    fn set_local_sym_encrypting_key(&mut self, _key: &[u8]) {}
    fn set_local_sym_iv(&mut self, _iv: &[u8]) {}
    fn set_remote_sym_signing_key(&mut self, _key: &[u8]) {}
    fn set_remote_sym_encrypting_key(&mut self, _key: &[u8]) {}
    fn set_remote_sym_iv(&mut self, _iv: &[u8]) {}

    fn remote_certificate(&self) -> &ByteString {
        &self.remote_certificate
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

struct NoneSymmetric;

impl SymmetricModule for NoneSymmetric {
    fn signature_size(&self) -> usize {
        0
    }

    fn signing_key_length(&self) -> usize {
        0
    }

    fn encryption_key_length(&self) -> usize {
        0
    }

    fn encryption_block_size(&self) -> usize {
        0
    }

    fn sign(
        &self,
        _context: &dyn ChannelContext,
        _data: &[u8],
        _signature: &mut [u8],
    ) -> Result<(), StatusCode> {
        Ok(())
    }

    fn verify(
        &self,
        _context: &dyn ChannelContext,
        _data: &[u8],
        _signature: &[u8],
    ) -> Result<(), StatusCode> {
        Ok(())
    }

    fn encrypt(&self, _context: &dyn ChannelContext, _data: &mut [u8]) -> Result<(), StatusCode> {
        Ok(())
    }

    fn decrypt(&self, _context: &dyn ChannelContext, _data: &mut [u8]) -> Result<(), StatusCode> {
        Ok(())
    }
}

struct NoneAsymmetric;

impl AsymmetricModule for NoneAsymmetric {
    fn local_signature_size(&self, _context: &dyn ChannelContext) -> usize {
        0
    }

    fn remote_signature_size(&self, _context: &dyn ChannelContext) -> usize {
        0
    }

    fn remote_plain_text_block_size(&self, _context: &dyn ChannelContext) -> usize {
        1
    }

    fn remote_encryption_key_bits(&self, _context: &dyn ChannelContext) -> usize {
        0
    }

    fn local_encryption_key_bits(&self, _context: &dyn ChannelContext) -> usize {
        0
    }

    fn sign(
        &self,
        _context: &dyn ChannelContext,
        _data: &[u8],
        _signature: &mut [u8],
    ) -> Result<(), StatusCode> {
        Ok(())
    }

    fn verify(
        &self,
        _context: &dyn ChannelContext,
        _data: &[u8],
        _signature: &[u8],
    ) -> Result<(), StatusCode> {
        Ok(())
    }

    fn encrypt(
        &self,
        _context: &dyn ChannelContext,
        _buffer: &mut Vec<u8>,
        _offset: usize,
    ) -> Result<(), StatusCode> {
        Ok(())
    }

    fn decrypt(
        &self,
        _context: &dyn ChannelContext,
        data: &mut [u8],
    ) -> Result<usize, StatusCode> {
        Ok(data.len())
    }
}

static NONE_SYMMETRIC: NoneSymmetric = NoneSymmetric;
static NONE_ASYMMETRIC: NoneAsymmetric = NoneAsymmetric;

impl PolicyNone {
    pub fn new() -> PolicyNone {
        PolicyNone {
            certificate: ByteString::null(),
        }
    }
}

impl SecurityPolicy for PolicyNone {
    fn policy_uri(&self) -> &str {
        SECURITY_POLICY_NONE_URI
    }

    fn local_certificate(&self) -> &ByteString {
        &self.certificate
    }

    fn secure_channel_nonce_length(&self) -> usize {
        0
    }

    fn asymmetric(&self) -> &dyn AsymmetricModule {
        &NONE_ASYMMETRIC
    }

    fn symmetric(&self) -> &dyn SymmetricModule {
        &NONE_SYMMETRIC
    }

    fn make_channel_context(
        &self,
        remote_certificate: &ByteString,
    ) -> Result<Box<dyn ChannelContext>, StatusCode> {
        Ok(Box::new(NoneContext {
            remote_certificate: remote_certificate.clone(),
        }))
    }

    fn certificate_thumbprint(&self, _certificate: &ByteString) -> ByteString {
        ByteString::null()
    }

    fn verify_certificate(&self, _certificate: &ByteString) -> Result<(), StatusCode> {
        Ok(())
    }

    fn generate_nonce(&self, _out: &mut [u8]) -> Result<(), StatusCode> {
        Ok(())
    }

    fn generate_key(
        &self,
        _secret: &[u8],
        _seed: &[u8],
        _out: &mut [u8],
    ) -> Result<(), StatusCode> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_derive_key_material_deterministic() {
        let mut a = [0u8; 72];
        let mut b = [0u8; 72];
        derive_key_material(b"secret", b"seed", &mut a).unwrap();
        derive_key_material(b"secret", b"seed", &mut b).unwrap();
        assert_eq!(a, b);
        assert_ne!(a, [0u8; 72]);
    }

    #[test]
    fn test_derive_key_material_direction_sensitive() {
        let mut forward = [0u8; 32];
        let mut reverse = [0u8; 32];
        derive_key_material(b"alpha", b"beta", &mut forward).unwrap();
        derive_key_material(b"beta", b"alpha", &mut reverse).unwrap();
        assert_ne!(forward, reverse);
    }

    #[test]
    fn test_derive_key_material_prefix_stable() {
        // A longer request yields the short request as its prefix
        let mut short = [0u8; 16];
        let mut long = [0u8; 80];
        derive_key_material(b"s", b"x", &mut short).unwrap();
        derive_key_material(b"s", b"x", &mut long).unwrap();
        assert_eq!(short, long[..16]);
    }

    #[test]
    fn test_policy_none_shape() {
        let policy = PolicyNone::new();
        assert_eq!(policy.policy_uri(), SECURITY_POLICY_NONE_URI);
        assert!(policy.local_certificate().is_null());
        assert_eq!(policy.symmetric().signature_size(), 0);
        assert_eq!(policy.symmetric().encryption_block_size(), 0);
        assert_eq!(policy.secure_channel_nonce_length(), 0);
    }

    #[test]
    fn test_policy_none_ops_are_identity() {
        let policy = PolicyNone::new();
        let context = policy.make_channel_context(&ByteString::null()).unwrap();
        let mut data = vec![1u8, 2, 3, 4];
        policy.symmetric().encrypt(context.as_ref(), &mut data).unwrap();
        assert_eq!(data, vec![1, 2, 3, 4]);
        policy.symmetric().decrypt(context.as_ref(), &mut data).unwrap();
        assert_eq!(data, vec![1, 2, 3, 4]);
        policy
            .symmetric()
            .verify(context.as_ref(), &data, &[])
            .unwrap();
    }
}
