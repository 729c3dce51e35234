//! Post-quantum KEM pre-key: Kyber768 keypair generation, signing, and
//! encapsulation/decapsulation.
//!
//! The classic X3DH handshake in [`crate::x3dh`] derives its shared secret
//! entirely from elliptic-curve Diffie-Hellman outputs, which a
//! cryptographically-relevant quantum computer would break. This module
//! contributes a second, independent shared secret from a lattice-based KEM;
//! [`crate::x3dh::initiate`] and [`crate::x3dh::respond`] fold it into the
//! same HKDF input alongside the DH outputs, so an attacker must break both
//! primitives to recover the session key.

use pqcrypto_kyber::kyber768::{
    decapsulate, encapsulate, keypair, Ciphertext, PublicKey, SecretKey,
};
use pqcrypto_traits::kem::{
    Ciphertext as _, PublicKey as _, SecretKey as _, SharedSecret as _,
};
use zeroize::Zeroizing;

use crate::{error::CryptoError, identity::IdentityKeyPair};

/// Generate a KEM pre-key: a Kyber768 keypair with the public half signed by
/// the identity key, mirroring `x3dh::generate_signed_prekey`.
pub fn generate_kem_prekey(
    identity: &IdentityKeyPair,
) -> Result<(SecretKey, PublicKey, Vec<u8>), CryptoError> {
    let (public, secret) = keypair();
    let sig = identity.sign(public.as_bytes());
    Ok((secret, public, sig))
}

pub fn public_from_bytes(bytes: &[u8]) -> Result<PublicKey, CryptoError> {
    PublicKey::from_bytes(bytes).map_err(|e| CryptoError::Kem(e.to_string()))
}

pub fn secret_from_bytes(bytes: &[u8]) -> Result<SecretKey, CryptoError> {
    SecretKey::from_bytes(bytes).map_err(|e| CryptoError::Kem(e.to_string()))
}

pub fn ciphertext_from_bytes(bytes: &[u8]) -> Result<Ciphertext, CryptoError> {
    Ciphertext::from_bytes(bytes).map_err(|e| CryptoError::Kem(e.to_string()))
}

/// Encapsulate against a peer's KEM public key. Returns the shared secret
/// (fed into the X3DH HKDF) and the ciphertext the peer needs to decapsulate
/// — unlike a DH output, this ciphertext has no public counterpart the
/// responder can recompute, so it must travel in the handshake header.
pub fn encapsulate_for(public: &PublicKey) -> (Zeroizing<Vec<u8>>, Vec<u8>) {
    let (shared_secret, ciphertext) = encapsulate(public);
    (
        Zeroizing::new(shared_secret.as_bytes().to_vec()),
        ciphertext.as_bytes().to_vec(),
    )
}

/// Decapsulate a ciphertext with our own KEM secret key.
pub fn decapsulate_with(secret: &SecretKey, ciphertext: &Ciphertext) -> Zeroizing<Vec<u8>> {
    let shared_secret = decapsulate(ciphertext, secret);
    Zeroizing::new(shared_secret.as_bytes().to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kem_roundtrip() {
        let identity = IdentityKeyPair::generate().unwrap();
        let (secret, public, sig) = generate_kem_prekey(&identity).unwrap();
        IdentityKeyPair::verify(&identity.public.0, public.as_bytes(), &sig).unwrap();

        let (alice_ss, ct_bytes) = encapsulate_for(&public);
        let ct = ciphertext_from_bytes(&ct_bytes).unwrap();
        let bob_ss = decapsulate_with(&secret, &ct);

        assert_eq!(alice_ss.as_slice(), bob_ss.as_slice());
    }
}
