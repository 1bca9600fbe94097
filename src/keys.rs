//! Keys and identifiers used by the harbor protocols.

use std::{fmt, str::FromStr};

use ed25519_dalek::{Signature, SignatureError, Signer, SigningKey, VerifyingKey};
use rand_core::CryptoRngCore;
use serde::{Deserialize, Serialize};

/// A long-term or ephemeral signing identity.
///
/// Internally this is an ed25519 [`SigningKey`]. Peer identities, device keys
/// and the ephemeral keys used during invitation claims are all of this type.
#[derive(Clone, Serialize, Deserialize)]
pub struct SecretKey {
    signing_key: SigningKey,
}

impl SecretKey {
    /// Create a new [`SecretKey`] with a random key.
    pub fn generate<R: CryptoRngCore + ?Sized>(rng: &mut R) -> Self {
        let signing_key = SigningKey::generate(rng);
        SecretKey { signing_key }
    }

    /// Create a [`SecretKey`] from a byte array.
    pub fn from_bytes(bytes: &[u8; 32]) -> Self {
        SecretKey {
            signing_key: SigningKey::from_bytes(bytes),
        }
    }

    /// Returns the byte representation of this key.
    pub fn to_bytes(&self) -> [u8; 32] {
        self.signing_key.to_bytes()
    }

    /// Get the [`PublicKey`] for this key.
    pub fn public(&self) -> PublicKey {
        PublicKey(self.signing_key.verifying_key())
    }

    /// Sign a message with this key.
    pub fn sign(&self, msg: &[u8]) -> Signature {
        self.signing_key.sign(msg)
    }
}

impl fmt::Debug for SecretKey {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "SecretKey({:?})", self.public())
    }
}

/// The public counterpart of a [`SecretKey`].
///
/// Used as a peer/device identity and to verify [`Signature`]s.
#[derive(Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Hash, derive_more::From)]
pub struct PublicKey(VerifyingKey);

impl PublicKey {
    /// Strictly verify a signature on a message against this key.
    pub fn verify(&self, msg: &[u8], signature: &Signature) -> Result<(), SignatureError> {
        self.0.verify_strict(msg, signature)
    }

    /// Get the byte representation of this key.
    pub fn as_bytes(&self) -> &[u8; 32] {
        self.0.as_bytes()
    }

    /// Create from a slice of bytes.
    ///
    /// Will return an error if the input bytes do not represent a valid
    /// ed25519 curve point. Will never fail for a byte array returned from
    /// [`Self::as_bytes`].
    pub fn from_bytes(bytes: &[u8; 32]) -> Result<Self, SignatureError> {
        Ok(PublicKey(VerifyingKey::from_bytes(bytes)?))
    }
}

impl fmt::Display for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", base32_lower(self.as_bytes()))
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", base32_short(self.as_bytes()))
    }
}

fn base32_lower(bytes: &[u8]) -> String {
    let mut text = data_encoding::BASE32_NOPAD.encode(bytes);
    text.make_ascii_lowercase();
    text
}

fn base32_short(bytes: &[u8]) -> String {
    let text = base32_lower(bytes);
    format!("{}…{}", &text[..5], &text[(text.len() - 2)..])
}

macro_rules! id_type {
    ($(#[$docs:meta])* $name:ident) => {
        $(#[$docs])*
        #[derive(
            Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
            derive_more::From,
        )]
        pub struct $name([u8; 32]);

        impl $name {
            /// Create a random id.
            pub fn random<R: CryptoRngCore + ?Sized>(rng: &mut R) -> Self {
                let mut bytes = [0u8; 32];
                rng.fill_bytes(&mut bytes);
                Self(bytes)
            }

            /// Get the byte representation of this id.
            pub fn as_bytes(&self) -> &[u8; 32] {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
                write!(f, "{}", base32_lower(&self.0))
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
                write!(f, "{}", base32_short(&self.0))
            }
        }

        impl FromStr for $name {
            type Err = data_encoding::DecodeError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                let bytes = data_encoding::BASE32_NOPAD.decode(s.to_ascii_uppercase().as_bytes())?;
                let bytes: [u8; 32] = bytes.try_into().map_err(|_| data_encoding::DecodeError {
                    position: 0,
                    kind: data_encoding::DecodeKind::Length,
                })?;
                Ok(Self(bytes))
            }
        }
    };
}

id_type!(
    /// Identifier of a space, a capability-gated replicated document set.
    SpaceId
);
id_type!(
    /// Identifier of a single document within a space.
    DocumentId
);
id_type!(
    /// Identifier of an invitation.
    InvitationId
);
id_type!(
    /// Rendezvous topic key for a discovery swarm.
    SwarmKey
);
id_type!(
    /// Identity a peer announces for its local document repository.
    RepoId
);

/// Identifier of a document collection, carrying the space it belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CollectionId {
    /// The space this collection lives in.
    pub space_id: SpaceId,
    /// Collection key within the space.
    pub key: String,
}

/// A device key certified by an identity key.
///
/// The identity key signs the device's public key once; the device key can
/// then sign payloads on behalf of the identity. Verifiers only need to trust
/// the identity key.
#[derive(Debug, Clone)]
pub struct DeviceKeychain {
    device: SecretKey,
    identity_key: PublicKey,
    certificate: Signature,
}

impl DeviceKeychain {
    /// Certify `device` with the given identity key.
    pub fn issue(identity: &SecretKey, device: SecretKey) -> Self {
        let certificate = identity.sign(device.public().as_bytes());
        DeviceKeychain {
            device,
            identity_key: identity.public(),
            certificate,
        }
    }

    /// The identity key this keychain is rooted at.
    pub fn identity_key(&self) -> PublicKey {
        self.identity_key
    }

    /// The certified device public key.
    pub fn device_key(&self) -> PublicKey {
        self.device.public()
    }

    /// The identity's signature over the device public key.
    pub fn certificate(&self) -> Signature {
        self.certificate
    }

    /// Sign a payload with the device key.
    pub fn sign(&self, msg: &[u8]) -> Signature {
        self.device.sign(msg)
    }
}

/// Credentials available to the local peer.
///
/// A keyring always knows its identity public key. It may hold the identity
/// secret itself, or only a [`DeviceKeychain`] rooted at the identity (the
/// common case for secondary devices).
#[derive(Debug, Clone)]
pub struct Keyring {
    identity_key: PublicKey,
    identity: Option<SecretKey>,
    device: Option<DeviceKeychain>,
}

impl Keyring {
    /// A keyring holding the identity secret itself.
    pub fn with_identity(identity: SecretKey) -> Self {
        Keyring {
            identity_key: identity.public(),
            identity: Some(identity),
            device: None,
        }
    }

    /// A keyring holding only a device keychain rooted at `identity_key`.
    pub fn with_device(identity_key: PublicKey, device: DeviceKeychain) -> Self {
        Keyring {
            identity_key,
            identity: None,
            device: Some(device),
        }
    }

    /// A keyring with no signing credential at all.
    ///
    /// Claims driven by such a keyring fail fast when asked for a secret.
    pub fn bare(identity_key: PublicKey) -> Self {
        Keyring {
            identity_key,
            identity: None,
            device: None,
        }
    }

    /// The identity public key.
    pub fn identity_key(&self) -> PublicKey {
        self.identity_key
    }

    /// The identity secret, if this keyring holds it.
    pub fn identity(&self) -> Option<&SecretKey> {
        self.identity.as_ref()
    }

    /// The device keychain, if this keyring holds one.
    pub fn device(&self) -> Option<&DeviceKeychain> {
        self.device.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use rand_chacha::ChaCha12Rng;
    use rand_core::SeedableRng;

    use super::*;

    #[test]
    fn id_base32_roundtrip() {
        let mut rng = ChaCha12Rng::seed_from_u64(1);
        let id = SpaceId::random(&mut rng);
        let s = id.to_string();
        assert_eq!(SpaceId::from_str(&s).unwrap(), id);
    }

    #[test]
    fn device_chain_verifies_against_identity() {
        let mut rng = ChaCha12Rng::seed_from_u64(2);
        let identity = SecretKey::generate(&mut rng);
        let device = SecretKey::generate(&mut rng);
        let chain = DeviceKeychain::issue(&identity, device);

        identity
            .public()
            .verify(chain.device_key().as_bytes(), &chain.certificate())
            .unwrap();

        let msg = b"payload";
        let sig = chain.sign(msg);
        chain.device_key().verify(msg, &sig).unwrap();
    }
}
