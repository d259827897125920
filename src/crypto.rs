//! RSA-PSS signing capability shared by every node.
//!
//! Signatures are produced over the exact bytes handed in; no normalization
//! happens here. Callers are responsible for building a canonical payload.

use std::fmt;
use std::fs::File;
use std::io::{self, Read, Write};
use std::path::Path;
use std::sync::Arc;

use log::debug;
use openssl::error::ErrorStack;
use openssl::hash::MessageDigest;
use openssl::pkey::{PKey, Private, Public};
use openssl::rsa::{Padding, Rsa};
use openssl::sign::{RsaPssSaltlen, Signer, Verifier};
use serde::{Serialize, Serializer};
use sha2::{Digest, Sha256};

pub const DEFAULT_KEY_BITS: u32 = 2048;

/// Stable node address: SHA-256 over the DER-encoded public key.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Fingerprint([u8; 32]);

impl Fingerprint {
    pub fn of(public_der: &[u8]) -> Self {
        Fingerprint(Sha256::digest(public_der).into())
    }

    pub fn to_hex(&self) -> String {
        self.0.iter().map(|b| format!("{:02x}", b)).collect()
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in &self.0[..8] {
            write!(f, "{:02x}", b)?;
        }
        Ok(())
    }
}

impl fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fingerprint({})", self)
    }
}

impl Serialize for Fingerprint {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

#[derive(Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Signature(Vec<u8>);

impl Signature {
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn to_base64(&self) -> String {
        base64::encode(&self.0)
    }

    pub fn from_base64(text: &str) -> Result<Self, base64::DecodeError> {
        base64::decode(text).map(Signature)
    }

    /// Short form for logs and error messages.
    pub fn short(&self) -> String {
        self.to_base64().chars().take(12).collect()
    }
}

impl From<Vec<u8>> for Signature {
    fn from(bytes: Vec<u8>) -> Self {
        Signature(bytes)
    }
}

impl fmt::Display for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_base64())
    }
}

impl fmt::Debug for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Signature({})", self.short())
    }
}

impl Serialize for Signature {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_base64())
    }
}

/// A peer's address and verification anchor.
#[derive(Clone)]
pub struct PublicKey {
    key: PKey<Public>,
    der: Arc<[u8]>,
    fingerprint: Fingerprint,
}

impl PublicKey {
    pub fn from_der(der: &[u8]) -> Result<Self, ErrorStack> {
        let key = PKey::public_key_from_der(der)?;
        Ok(PublicKey {
            key,
            der: Arc::from(der),
            fingerprint: Fingerprint::of(der),
        })
    }

    pub fn from_pem(pem: &[u8]) -> Result<Self, ErrorStack> {
        let key = PKey::public_key_from_pem(pem)?;
        Self::from_der(&key.public_key_to_der()?)
    }

    pub fn to_pem(&self) -> Result<String, ErrorStack> {
        let pem = self.key.public_key_to_pem()?;
        Ok(String::from_utf8_lossy(&pem).into_owned())
    }

    pub fn fingerprint(&self) -> Fingerprint {
        self.fingerprint
    }

    pub fn verify(&self, message: &[u8], signature: &Signature) -> bool {
        verify(message, signature, self)
    }
}

impl PartialEq for PublicKey {
    fn eq(&self, other: &Self) -> bool {
        self.der == other.der
    }
}

impl Eq for PublicKey {}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublicKey({})", self.fingerprint)
    }
}

#[derive(Clone)]
pub struct Keypair {
    private: PKey<Private>,
    public: PublicKey,
}

impl Keypair {
    pub fn generate(bits: u32) -> Result<Self, ErrorStack> {
        let rsa = Rsa::generate(bits)?;
        Self::from_private(PKey::from_rsa(rsa)?)
    }

    pub fn from_pem(pem: &[u8]) -> Result<Self, ErrorStack> {
        Self::from_private(PKey::private_key_from_pem(pem)?)
    }

    fn from_private(private: PKey<Private>) -> Result<Self, ErrorStack> {
        let public = PublicKey::from_der(&private.public_key_to_der()?)?;
        Ok(Keypair { private, public })
    }

    pub fn private_key_pem(&self) -> Result<Vec<u8>, ErrorStack> {
        self.private.private_key_to_pem_pkcs8()
    }

    pub fn load(path: &Path) -> Result<Self, crate::Error> {
        let mut file = File::open(path)?;
        let mut contents = Vec::new();
        file.read_to_end(&mut contents)?;
        Ok(Self::from_pem(&contents)?)
    }

    pub fn save(&self, path: &Path) -> Result<(), crate::Error> {
        let mut file = File::create(path)?;
        file.write_all(&self.private_key_pem()?)?;
        Ok(())
    }

    /// Loads the key stored at `path`, or generates one and stores it there.
    pub fn load_or_generate(path: &Path, bits: u32) -> Result<Self, crate::Error> {
        match Self::load(path) {
            Ok(keypair) => Ok(keypair),
            Err(crate::Error::Io(err)) if err.kind() == io::ErrorKind::NotFound => {
                let keypair = Self::generate(bits)?;
                keypair.save(path)?;
                Ok(keypair)
            }
            Err(err) => Err(err),
        }
    }

    pub fn public_key(&self) -> &PublicKey {
        &self.public
    }

    pub fn fingerprint(&self) -> Fingerprint {
        self.public.fingerprint
    }

    pub fn sign(&self, message: &[u8]) -> Result<Signature, ErrorStack> {
        sign(message, &self.private)
    }
}

impl fmt::Debug for Keypair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Keypair({})", self.public.fingerprint)
    }
}

pub fn sign(message: &[u8], private_key: &PKey<Private>) -> Result<Signature, ErrorStack> {
    let mut signer = Signer::new(MessageDigest::sha256(), private_key)?;
    signer.set_rsa_padding(Padding::PKCS1_PSS)?;
    signer.set_rsa_mgf1_md(MessageDigest::sha256())?;
    signer.set_rsa_pss_saltlen(RsaPssSaltlen::MAXIMUM_LENGTH)?;
    signer.update(message)?;
    Ok(Signature(signer.sign_to_vec()?))
}

/// True iff `signature` was produced over exactly `message` by the holder of
/// the private half of `public_key`.
pub fn verify(message: &[u8], signature: &Signature, public_key: &PublicKey) -> bool {
    match try_verify(message, signature, public_key) {
        Ok(true) => true,
        Ok(false) => {
            debug!("signature {} failed validation", signature.short());
            false
        }
        Err(err) => {
            debug!("signature {} rejected by backend: {}", signature.short(), err);
            false
        }
    }
}

fn try_verify(
    message: &[u8],
    signature: &Signature,
    public_key: &PublicKey,
) -> Result<bool, ErrorStack> {
    let mut verifier = Verifier::new(MessageDigest::sha256(), &public_key.key)?;
    verifier.set_rsa_padding(Padding::PKCS1_PSS)?;
    verifier.set_rsa_mgf1_md(MessageDigest::sha256())?;
    verifier.set_rsa_pss_saltlen(RsaPssSaltlen::MAXIMUM_LENGTH)?;
    verifier.update(message)?;
    verifier.verify(signature.as_bytes())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn keypair() -> Keypair {
        Keypair::generate(1024).unwrap()
    }

    #[test]
    fn test_sign_and_verify() {
        let keypair = keypair();
        let signature = keypair.sign(b"ballot:created").unwrap();
        assert!(verify(b"ballot:created", &signature, keypair.public_key()));
    }

    #[test]
    fn test_verify_is_byte_exact() {
        let keypair = keypair();
        let signature = keypair.sign(b"ballot:created").unwrap();
        assert!(!verify(b"ballot:created ", &signature, keypair.public_key()));
        assert!(!verify(b"Ballot:created", &signature, keypair.public_key()));
    }

    #[test]
    fn test_verify_rejects_other_key() {
        let signer = keypair();
        let other = keypair();
        let signature = signer.sign(b"vote").unwrap();
        assert!(!verify(b"vote", &signature, other.public_key()));
    }

    #[test]
    fn test_verify_rejects_garbage_signature() {
        let keypair = keypair();
        assert!(!verify(b"vote", &Signature::from(vec![1, 2, 3]), keypair.public_key()));
    }

    #[test]
    fn test_pem_round_trip_keeps_fingerprint() {
        let keypair = keypair();
        let restored = Keypair::from_pem(&keypair.private_key_pem().unwrap()).unwrap();
        assert_eq!(restored.fingerprint(), keypair.fingerprint());

        let public =
            PublicKey::from_pem(keypair.public_key().to_pem().unwrap().as_bytes()).unwrap();
        assert_eq!(&public, keypair.public_key());
    }

    #[test]
    fn test_signature_base64() {
        let signature = Signature::from(vec![0xde, 0xad, 0xbe, 0xef]);
        let text = signature.to_base64();
        assert_eq!(Signature::from_base64(&text).unwrap(), signature);
    }
}
