// SPDX-FileCopyrightText: © 2026 PrivKey LLC
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Secp256k1 key helpers shared by the custodian and challenge signing.
use bech32::{Bech32, Hrp};
use k256::schnorr::{signature::Verifier, Signature, SigningKey, VerifyingKey};
use rand::RngCore;
use sha2::{Digest, Sha256};
use zeroize::{Zeroize, Zeroizing};

use crate::error::{CourierError, Result};

const IDENTITY_DOMAIN: &[u8] = b"courier/identity/v1";

/// Generate a fresh secret key.
pub fn generate_secret() -> Result<Zeroizing<[u8; 32]>> {
    const MAX_RETRIES: usize = 64;
    let mut rng = rand::rngs::OsRng;
    for _ in 0..MAX_RETRIES {
        let mut secret = Zeroizing::new([0u8; 32]);
        rng.fill_bytes(&mut secret[..]);
        if SigningKey::from_bytes(&secret[..]).is_ok() {
            return Ok(secret);
        }
    }
    Err(CourierError::crypto(
        "failed to generate valid secret after 64 attempts",
    ))
}

/// Derive the x-only public key for a secret.
pub fn public_key_for(secret: &[u8; 32]) -> Result<[u8; 32]> {
    let signing_key = SigningKey::from_bytes(secret).map_err(|_| CourierError::InvalidSecretKey)?;
    Ok(signing_key.verifying_key().to_bytes().into())
}

/// BIP-340 signature over `message`.
pub fn schnorr_sign(secret: &[u8; 32], message: &[u8]) -> Result<[u8; 64]> {
    use k256::schnorr::signature::Signer;

    let signing_key = SigningKey::from_bytes(secret).map_err(|_| CourierError::InvalidSecretKey)?;
    let signature: Signature = signing_key.sign(message);
    Ok(signature.to_bytes())
}

pub fn schnorr_verify(pubkey: &[u8; 32], message: &[u8], signature: &[u8; 64]) -> Result<()> {
    let verifying_key = VerifyingKey::from_bytes(pubkey)
        .map_err(|e| CourierError::SignatureVerificationFailed(e.to_string()))?;
    let signature = Signature::try_from(signature.as_slice())
        .map_err(|e| CourierError::SignatureVerificationFailed(e.to_string()))?;
    verifying_key
        .verify(message, &signature)
        .map_err(|e| CourierError::SignatureVerificationFailed(e.to_string()))
}

/// Stable, non-reversible handle for an identity, used to key rate limits
/// and logs without exposing the public key itself.
pub fn identity_hash(identity: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(IDENTITY_DOMAIN);
    hasher.update(identity);
    hasher.finalize().into()
}

pub fn secret_from_nsec(nsec: &str) -> Result<Zeroizing<[u8; 32]>> {
    let (hrp, mut data) = bech32::decode(nsec).map_err(|_| CourierError::InvalidNsec)?;

    if hrp.as_str() != "nsec" || data.len() != 32 {
        data.zeroize();
        return Err(CourierError::InvalidNsec);
    }

    let mut secret = Zeroizing::new([0u8; 32]);
    secret.copy_from_slice(&data);
    data.zeroize();

    SigningKey::from_bytes(&secret[..]).map_err(|_| CourierError::InvalidNsec)?;
    Ok(secret)
}

pub fn npub_to_bytes(npub: &str) -> Result<[u8; 32]> {
    let (hrp, data) = bech32::decode(npub).map_err(|_| CourierError::InvalidNpub)?;

    if hrp.as_str() != "npub" || data.len() != 32 {
        return Err(CourierError::InvalidNpub);
    }

    let mut pubkey = [0u8; 32];
    pubkey.copy_from_slice(&data);
    Ok(pubkey)
}

pub fn bytes_to_npub(pubkey: &[u8; 32]) -> String {
    const NPUB_HRP: Hrp = Hrp::parse_unchecked("npub");
    bech32::encode::<Bech32>(NPUB_HRP, pubkey)
        .expect("bech32 encode of 32-byte pubkey with valid HRP is infallible")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sign_verify() {
        let secret = generate_secret().unwrap();
        let pubkey = public_key_for(&secret).unwrap();
        let sig = schnorr_sign(&secret, b"hello").unwrap();

        assert!(schnorr_verify(&pubkey, b"hello", &sig).is_ok());
        assert!(schnorr_verify(&pubkey, b"hellp", &sig).is_err());
    }

    #[test]
    fn test_zero_secret_rejected() {
        assert!(matches!(
            public_key_for(&[0u8; 32]),
            Err(CourierError::InvalidSecretKey)
        ));
    }

    #[test]
    fn test_npub_roundtrip() {
        let secret = generate_secret().unwrap();
        let pubkey = public_key_for(&secret).unwrap();
        let npub = bytes_to_npub(&pubkey);
        assert!(npub.starts_with("npub1"));
        assert_eq!(npub_to_bytes(&npub).unwrap(), pubkey);
    }

    #[test]
    fn test_nsec_decoding() {
        const NSEC_HRP: Hrp = Hrp::parse_unchecked("nsec");
        let secret = generate_secret().unwrap();
        let nsec = bech32::encode::<Bech32>(NSEC_HRP, &secret[..]).unwrap();

        let decoded = secret_from_nsec(&nsec).unwrap();
        assert_eq!(*decoded, *secret);

        let npub = bytes_to_npub(&public_key_for(&secret).unwrap());
        assert!(matches!(
            secret_from_nsec(&npub),
            Err(CourierError::InvalidNsec)
        ));
    }

    #[test]
    fn test_identity_hash_is_stable() {
        assert_eq!(identity_hash(b"alice"), identity_hash(b"alice"));
        assert_ne!(identity_hash(b"alice"), identity_hash(b"bob"));
    }
}
