/*
    Copyright © 2024, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Cryptographic primitives.
//!
//! The definitions and re-exports in this module provide two categories of cryptographic primitives:
//! 1. **Cryptographic Hashes**: provided by the [`sha2`] crate, wrapped into the hint-tagged
//!    [`ValueHash`].
//! 2. **Digital Signatures**: provided by the [`ed25519_dalek`] crate.

use std::fmt::{self, Display, Formatter};

use serde::{Deserialize, Serialize};

use super::hint::{Hint, HintType};

// re-exports below.
pub use sha2::Digest;
pub use sha2::Sha256 as CryptoHasher;

pub use ed25519_dalek::{Signature, SignatureError, Signer, SigningKey, Verifier, VerifyingKey};

pub type SignatureBytes = [u8; 64];
pub type VerifyingKeyBytes = [u8; 32];

/// A content hash tagged with the hint of the algorithm that produced it. Two hashes are equal only if
/// both their hints and their bytes are equal.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ValueHash {
    #[serde(rename = "_hint")]
    hint: Hint,
    #[serde(with = "hex")]
    hash: Vec<u8>,
}

impl ValueHash {
    pub const SHA256_HINT: Hint = Hint::new(HintType::new([0x01, 0x50]), 0, 0, 1);

    pub fn new(hint: Hint, hash: Vec<u8>) -> Self {
        Self { hint, hash }
    }

    /// Wrap the output of a SHA-256 computation done elsewhere (e.g. a tree root).
    pub fn from_sha256_bytes(hash: Vec<u8>) -> Self {
        Self::new(Self::SHA256_HINT, hash)
    }

    /// SHA-256 over the concatenation of `parts`.
    pub fn sha256<T: AsRef<[u8]>>(parts: &[T]) -> Self {
        let mut hasher = CryptoHasher::new();
        for part in parts {
            hasher.update(part.as_ref());
        }
        Self::from_sha256_bytes(hasher.finalize().to_vec())
    }

    pub fn hint(&self) -> &Hint {
        &self.hint
    }

    pub fn bytes(&self) -> &[u8] {
        &self.hash
    }

    pub fn is_empty(&self) -> bool {
        self.hash.is_empty()
    }
}

impl Display for ValueHash {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(&self.hash))
    }
}

/// A facade around [`SigningKey`] that implements a method for [`sign`](Self::sign)-ing messages as
/// well as a getter for the [`public`](Self::public) key associated with the signing key.
#[derive(Clone)]
pub struct Keypair(SigningKey);

impl Keypair {
    pub fn new(signing_key: SigningKey) -> Keypair {
        Keypair(signing_key)
    }

    pub fn sign(&self, message: &[u8]) -> SignatureBytes {
        self.0.sign(message).to_bytes()
    }

    pub fn public(&self) -> VerifyingKey {
        self.0.verifying_key()
    }
}

/// Verify `signature` over `message` against the raw `public_key` bytes.
pub fn verify_signature(
    public_key: &VerifyingKeyBytes,
    message: &[u8],
    signature: &SignatureBytes,
) -> Result<(), SignatureError> {
    let verifying_key = VerifyingKey::from_bytes(public_key)?;
    verifying_key.verify(message, &Signature::from_bytes(signature))
}
