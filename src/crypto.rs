//! Crypto collaborators consumed by the receive session.

use sha2::{Digest, Sha256, Sha384, Sha512};

/// Hashing and signature checking for the placement spec and per-block
/// integrity digests.
pub trait SpecCrypto {
    /// Is `signature` a valid signature over `image`?
    fn verify_signature(&self, image: &[u8], signature: &[u8]) -> bool;

    /// Compute the digest named by the placement spec (e.g. "sha256").
    fn named_hash(&self, name: &str, buf: &[u8]) -> anyhow::Result<Vec<u8>>;
}

/// The stock implementation: SHA-2 family digests only.
///
/// Signature verification is platform policy (key storage, trust roots), so
/// this implementation rejects every signature; secure sessions need a
/// platform-supplied [SpecCrypto].
pub struct Sha2Crypto;

impl SpecCrypto for Sha2Crypto {
    fn verify_signature(&self, _image: &[u8], _signature: &[u8]) -> bool {
        false
    }

    fn named_hash(&self, name: &str, buf: &[u8]) -> anyhow::Result<Vec<u8>> {
        Ok(match name {
            "sha256" => Sha256::digest(buf).to_vec(),
            "sha384" => Sha384::digest(buf).to_vec(),
            "sha512" => Sha512::digest(buf).to_vec(),
            _ => anyhow::bail!("unsupported hash {name:?}"),
        })
    }
}

#[test]
fn test_named_hash() {
    let crypto = Sha2Crypto;
    assert_eq!(crypto.named_hash("sha256", b"abc").unwrap().len(), 32);
    assert_eq!(crypto.named_hash("sha512", b"abc").unwrap().len(), 64);
    assert!(crypto.named_hash("md5", b"abc").is_err());
}
