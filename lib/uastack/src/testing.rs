//! Testing plugins: a deterministic security policy with real signatures
//! and a keystream cipher, plus helpers to build pre-opened channel pairs.
//! Exercises the sign/encrypt pipelines, padding and token rotation without
//! a certificate-grade crypto backend.

use crate::channel::{
    ChannelRole, ConnectionConfig, SecureChannel, SecurityMode, SecurityToken,
};
use blake2::digest::Digest;
use blake2::Blake2s256;
use hmac::{Mac, SimpleHmac};
use rand::RngCore;
use std::any::Any;
use std::rc::Rc;
use uabase::logging::null_logger;
use uabase::security::{
    derive_key_material, AsymmetricModule, ChannelContext, SecurityPolicy, SymmetricModule,
};
use uabase::status::StatusCode;
use uabase::time::{self, DateTime};
use uabase::types::ByteString;

pub const POLICY_SIGNED16_URI: &str = "http://example.org/UA/SecurityPolicy#Signed16";

const SIGNATURE_SIZE: usize = 32;
const KEY_LENGTH: usize = 32;
const BLOCK_SIZE: usize = 16;
const NONCE_LENGTH: usize = 32;

/// Shared secret standing in for the asymmetric key pairs of the OPN
/// exchange.
const ASYM_SECRET: &[u8] = b"signed16-asymmetric-exchange-key";

type Prf = SimpleHmac<Blake2s256>;

fn mac_over(key: &[u8], data: &[u8]) -> Result<[u8; SIGNATURE_SIZE], StatusCode> {
    let mut mac = Prf::new_from_slice(key).map_err(|_| StatusCode::BAD_INTERNAL_ERROR)?;
    mac.update(data);
    let mut out = [0u8; SIGNATURE_SIZE];
    out.copy_from_slice(mac.finalize().into_bytes().as_slice());
    Ok(out)
}

fn mac_verify(key: &[u8], data: &[u8], signature: &[u8]) -> Result<(), StatusCode> {
    let mut mac = Prf::new_from_slice(key).map_err(|_| StatusCode::BAD_INTERNAL_ERROR)?;
    mac.update(data);
    mac.verify_slice(signature)
        .map_err(|_| StatusCode::BAD_SECURITY_CHECKS_FAILED)
}

/// Keystream XOR used as the "cipher". Symmetric, so encrypt and decrypt
/// are the same operation.
fn apply_keystream(key: &[u8], iv: &[u8], data: &mut [u8]) {
    for (index, byte) in data.iter_mut().enumerate() {
        let pad = key[index % key.len()]
            ^ iv.get(index % BLOCK_SIZE).copied().unwrap_or(0)
            ^ (index / BLOCK_SIZE) as u8;
        *byte ^= pad;
    }
}

#[derive(Default)]
struct KeySet {
    signing: Vec<u8>,
    encrypting: Vec<u8>,
    iv: Vec<u8>,
}

struct TestContext {
    remote_certificate: ByteString,
    local: KeySet,
    remote: KeySet,
}

impl ChannelContext for TestContext {
    fn set_local_sym_signing_key(&mut self, key: &[u8]) {
        self.local.signing = key.to_vec();
    }

    fn set_local_sym_encrypting_key(&mut self, key: &[u8]) {
        self.local.encrypting = key.to_vec();
    }

    fn set_local_sym_iv(&mut self, iv: &[u8]) {
        self.local.iv = iv.to_vec();
    }

    fn set_remote_sym_signing_key(&mut self, key: &[u8]) {
        self.remote.signing = key.to_vec();
    }

    fn set_remote_sym_encrypting_key(&mut self, key: &[u8]) {
        self.remote.encrypting = key.to_vec();
    }

    fn set_remote_sym_iv(&mut self, iv: &[u8]) {
        self.remote.iv = iv.to_vec();
    }

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

fn test_context(context: &dyn ChannelContext) -> Result<&TestContext, StatusCode> {
    context
        .as_any()
        .downcast_ref::<TestContext>()
        .ok_or(StatusCode::BAD_INTERNAL_ERROR)
}

struct TestSymmetric;

impl SymmetricModule for TestSymmetric {
    fn signature_size(&self) -> usize {
        SIGNATURE_SIZE
    }

    fn signing_key_length(&self) -> usize {
        KEY_LENGTH
    }

    fn encryption_key_length(&self) -> usize {
        KEY_LENGTH
    }

    fn encryption_block_size(&self) -> usize {
        BLOCK_SIZE
    }

    fn sign(
        &self,
        context: &dyn ChannelContext,
        data: &[u8],
        signature: &mut [u8],
    ) -> Result<(), StatusCode> {
        let keys = test_context(context)?;
        signature.copy_from_slice(&mac_over(&keys.local.signing, data)?);
        Ok(())
    }

    fn verify(
        &self,
        context: &dyn ChannelContext,
        data: &[u8],
        signature: &[u8],
    ) -> Result<(), StatusCode> {
        let keys = test_context(context)?;
        mac_verify(&keys.remote.signing, data, signature)
    }

    fn encrypt(&self, context: &dyn ChannelContext, data: &mut [u8]) -> Result<(), StatusCode> {
        let keys = test_context(context)?;
        apply_keystream(&keys.local.encrypting, &keys.local.iv, data);
        Ok(())
    }

    fn decrypt(&self, context: &dyn ChannelContext, data: &mut [u8]) -> Result<(), StatusCode> {
        let keys = test_context(context)?;
        apply_keystream(&keys.remote.encrypting, &keys.remote.iv, data);
        Ok(())
    }
}

struct TestAsymmetric;

impl AsymmetricModule for TestAsymmetric {
    fn local_signature_size(&self, _context: &dyn ChannelContext) -> usize {
        SIGNATURE_SIZE
    }

    fn remote_signature_size(&self, _context: &dyn ChannelContext) -> usize {
        SIGNATURE_SIZE
    }

    fn remote_plain_text_block_size(&self, _context: &dyn ChannelContext) -> usize {
        BLOCK_SIZE
    }

    fn remote_encryption_key_bits(&self, _context: &dyn ChannelContext) -> usize {
        1024
    }

    fn local_encryption_key_bits(&self, _context: &dyn ChannelContext) -> usize {
        1024
    }

    fn sign(
        &self,
        _context: &dyn ChannelContext,
        data: &[u8],
        signature: &mut [u8],
    ) -> Result<(), StatusCode> {
        signature.copy_from_slice(&mac_over(ASYM_SECRET, data)?);
        Ok(())
    }

    fn verify(
        &self,
        _context: &dyn ChannelContext,
        data: &[u8],
        signature: &[u8],
    ) -> Result<(), StatusCode> {
        mac_verify(ASYM_SECRET, data, signature)
    }

    fn encrypt(
        &self,
        _context: &dyn ChannelContext,
        buffer: &mut Vec<u8>,
        offset: usize,
    ) -> Result<(), StatusCode> {
        apply_keystream(ASYM_SECRET, &[], &mut buffer[offset..]);
        Ok(())
    }

    fn decrypt(
        &self,
        _context: &dyn ChannelContext,
        data: &mut [u8],
    ) -> Result<usize, StatusCode> {
        apply_keystream(ASYM_SECRET, &[], data);
        Ok(data.len())
    }
}

static TEST_SYMMETRIC: TestSymmetric = TestSymmetric;
static TEST_ASYMMETRIC: TestAsymmetric = TestAsymmetric;

/// Deterministic policy: Blake2s-HMAC signatures, 16-byte blocks, PRF key
/// derivation. Certificates are opaque byte strings with digest
/// thumbprints.
pub struct PolicySigned16 {
    certificate: ByteString,
}

impl PolicySigned16 {
    pub fn new() -> PolicySigned16 {
        PolicySigned16 {
            certificate: ByteString::new(b"signed16-test-certificate".to_vec()),
        }
    }
}

impl SecurityPolicy for PolicySigned16 {
    fn policy_uri(&self) -> &str {
        POLICY_SIGNED16_URI
    }

    fn local_certificate(&self) -> &ByteString {
        &self.certificate
    }

    fn secure_channel_nonce_length(&self) -> usize {
        NONCE_LENGTH
    }

    fn asymmetric(&self) -> &dyn AsymmetricModule {
        &TEST_ASYMMETRIC
    }

    fn symmetric(&self) -> &dyn SymmetricModule {
        &TEST_SYMMETRIC
    }

    fn make_channel_context(
        &self,
        remote_certificate: &ByteString,
    ) -> Result<Box<dyn ChannelContext>, StatusCode> {
        Ok(Box::new(TestContext {
            remote_certificate: remote_certificate.clone(),
            local: KeySet::default(),
            remote: KeySet::default(),
        }))
    }

    fn certificate_thumbprint(&self, certificate: &ByteString) -> ByteString {
        if certificate.is_null() {
            return ByteString::null();
        }
        let digest = Blake2s256::digest(certificate.as_slice());
        ByteString::new(digest.as_slice()[..20].to_vec())
    }

    fn verify_certificate(&self, certificate: &ByteString) -> Result<(), StatusCode> {
        if certificate.is_null() || certificate.len() == 0 {
            return Err(StatusCode::BAD_CERTIFICATE_INVALID);
        }
        Ok(())
    }

    fn generate_nonce(&self, out: &mut [u8]) -> Result<(), StatusCode> {
        rand::thread_rng().fill_bytes(out);
        Ok(())
    }

    fn generate_key(
        &self,
        secret: &[u8],
        seed: &[u8],
        out: &mut [u8],
    ) -> Result<(), StatusCode> {
        derive_key_material(secret, seed, out)
    }
}

/// A token for tests, created "now" with a ten minute lifetime.
pub fn test_token(channel_id: u32, token_id: u32, now: DateTime) -> SecurityToken {
    SecurityToken {
        channel_id,
        token_id,
        created_at: now,
        revised_lifetime_ms: 600_000,
    }
}

/// Builds a client/server channel pair over the Signed16 policy, runs the
/// HEL/ACK handshake, exchanges nonces and installs the same initial token
/// on both sides.
pub fn open_signed_pair(mode: SecurityMode) -> (SecureChannel, SecureChannel) {
    let policy: Rc<dyn SecurityPolicy> = Rc::new(PolicySigned16::new());
    let mut client = SecureChannel::new(
        ChannelRole::Client,
        vec![policy.clone()],
        mode,
        ConnectionConfig::default(),
        null_logger(),
    );
    let mut server = SecureChannel::new(
        ChannelRole::Server,
        vec![policy.clone()],
        mode,
        ConnectionConfig::default(),
        null_logger(),
    );

    let now = time::now_monotonic();
    client.send_hello("opc.tcp://localhost:4840").expect("hello");
    for chunk in client.take_output() {
        server.process(&chunk, now).expect("server handshake");
    }
    for chunk in server.take_output() {
        client.process(&chunk, now).expect("client handshake");
    }

    let certificate = policy.local_certificate().clone();
    client
        .activate_policy(POLICY_SIGNED16_URI, &certificate)
        .expect("client policy");
    server
        .activate_policy(POLICY_SIGNED16_URI, &certificate)
        .expect("server policy");

    exchange_nonces_and_open(&mut client, &mut server, test_token(42, 1, now), now);
    (client, server)
}

/// Generates fresh nonces on both sides and installs `token`. Used for the
/// initial open and for renewals.
pub fn exchange_nonces_and_open(
    client: &mut SecureChannel,
    server: &mut SecureChannel,
    token: SecurityToken,
    now: DateTime,
) {
    let client_nonce = client.generate_local_nonce().expect("client nonce").clone();
    let server_nonce = server.generate_local_nonce().expect("server nonce").clone();
    client
        .complete_open(token, server_nonce, now)
        .expect("client open");
    server
        .complete_open(token, client_nonce, now)
        .expect("server open");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keystream_is_symmetric() {
        let key = [7u8; KEY_LENGTH];
        let iv = [3u8; BLOCK_SIZE];
        let mut data: Vec<u8> = (0..64).collect();
        let original = data.clone();
        apply_keystream(&key, &iv, &mut data);
        assert_ne!(data, original);
        apply_keystream(&key, &iv, &mut data);
        assert_eq!(data, original);
    }

    #[test]
    fn test_mac_roundtrip() {
        let signature = mac_over(b"key", b"payload").unwrap();
        mac_verify(b"key", b"payload", &signature).unwrap();
        assert!(mac_verify(b"key", b"tampered", &signature).is_err());
        assert!(mac_verify(b"other", b"payload", &signature).is_err());
    }

    #[test]
    fn test_thumbprint_is_twenty_bytes() {
        let policy = PolicySigned16::new();
        let thumbprint = policy.certificate_thumbprint(policy.local_certificate());
        assert_eq!(thumbprint.len(), 20);
        assert!(policy.certificate_thumbprint(&ByteString::null()).is_null());
    }

    #[test]
    fn test_open_signed_pair_is_open() {
        let (client, server) = open_signed_pair(SecurityMode::SignAndEncrypt);
        assert_eq!(client.state(), crate::channel::SecureChannelState::Open);
        assert_eq!(server.state(), crate::channel::SecureChannelState::Open);
        assert!(client.current_token().is_set());
        assert_eq!(client.current_token(), server.current_token());
    }
}
