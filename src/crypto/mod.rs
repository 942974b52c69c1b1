//! Cryptographic primitives for MS-CHAPv2 and SSTP crypto binding
//!
//! SHA-1/SHA-256, HMAC and the system RNG come from the configured provider
//! (ring or aws-lc-rs); MD4 and DES come from RustCrypto since neither
//! provider ships them.

use crate::error::{Result, VpnError};
use crate::protocol::HashProtocol;

// Conditional crypto imports - prioritize ring if both features are enabled
#[cfg(all(feature = "ring-crypto", not(feature = "aws-lc-crypto")))]
use ring::rand::SecureRandom;
#[cfg(all(feature = "ring-crypto", not(feature = "aws-lc-crypto")))]
use ring::{digest, hmac, rand};

#[cfg(all(feature = "aws-lc-crypto", not(feature = "ring-crypto")))]
use aws_lc_rs::rand::SecureRandom;
#[cfg(all(feature = "aws-lc-crypto", not(feature = "ring-crypto")))]
use aws_lc_rs::{digest, hmac, rand};

// If both features are enabled, prefer ring (for CI --all-features)
#[cfg(all(feature = "ring-crypto", feature = "aws-lc-crypto"))]
use ring::rand::SecureRandom;
#[cfg(all(feature = "ring-crypto", feature = "aws-lc-crypto"))]
use ring::{digest, hmac, rand};

pub mod binding;
pub mod mschap;
pub mod tls;

pub use binding::{certificate_hash, compound_mac, crypto_binding};
pub use mschap::{derive_hlak, ChapMessage};

/// SHA-1 over the concatenation of `parts`
pub fn sha1(parts: &[&[u8]]) -> [u8; 20] {
    let mut context = digest::Context::new(&digest::SHA1_FOR_LEGACY_USE_ONLY);
    for part in parts {
        context.update(part);
    }
    let mut out = [0u8; 20];
    out.copy_from_slice(context.finish().as_ref());
    out
}

pub fn sha256(data: &[u8]) -> [u8; 32] {
    let mut out = [0u8; 32];
    out.copy_from_slice(digest::digest(&digest::SHA256, data).as_ref());
    out
}

/// HMAC with the negotiated hash; output is 20 or 32 bytes
pub fn hmac(hash: HashProtocol, key: &[u8], data: &[u8]) -> Vec<u8> {
    let algorithm = match hash {
        HashProtocol::Sha1 => hmac::HMAC_SHA1_FOR_LEGACY_USE_ONLY,
        HashProtocol::Sha256 => hmac::HMAC_SHA256,
    };
    let key = hmac::Key::new(algorithm, key);
    hmac::sign(&key, data).as_ref().to_vec()
}

/// Fills a fixed-size array from the system RNG
pub fn random_bytes<const N: usize>() -> Result<[u8; N]> {
    let mut bytes = [0u8; N];
    rand::SystemRandom::new()
        .fill(&mut bytes)
        .map_err(|e| VpnError::Crypto(format!("Random generation failed: {e:?}")))?;
    Ok(bytes)
}
