//! Invitation claim protocol.
//!
//! Admission to a space starts from a long-lived *offline* invitation,
//! pre-shared out of band. A joining peer redeems it over an ephemeral
//! discovery swarm: [`ClaimSession`] drives the claimant side, and
//! [`ClaimHandler`] answers claims by minting a short-lived *interactive*
//! invitation pinned to the invitee's identity key and protected by a
//! per-challenge nonce. The interactive greeting that follows is a separate
//! component and consumes the returned [`InvitationDescriptor`].

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
    time::{Duration, SystemTime},
};

use bytes::Bytes;
use ed25519_dalek::Signature;
use futures_lite::future::Boxed as BoxedFuture;
use rand_core::CryptoRngCore;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, trace, warn};

use crate::{
    keys::{InvitationId, Keyring, PublicKey, SecretKey, SpaceId, SwarmKey},
    metrics::Metrics,
};

/// Default lifetime of a minted interactive invitation.
pub const INTERACTIVE_INVITATION_TTL: Duration = Duration::from_secs(60);

/// The kind of an invitation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
pub enum InvitationKind {
    /// Long-lived, space-scoped, pre-shared out of band.
    Offline,
    /// Short-lived, single-use, pinned to one invitee key.
    Interactive,
}

/// A capability token granting a peer the right to join a space.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Invitation {
    /// Invitation id.
    pub id: InvitationId,
    /// Offline or interactive.
    pub kind: InvitationKind,
    /// The space this invitation admits to.
    pub space_id: SpaceId,
    /// Swarm topic on which the invitation is redeemed.
    pub swarm_key: SwarmKey,
    /// The invitee identity this invitation is pinned to.
    ///
    /// Always present on interactive invitations. On offline invitations it
    /// is the key extracted from the invitation's signed payload when the
    /// invitation was admitted to the space.
    pub invitee_key: Option<PublicKey>,
    /// Nonce for the auth challenge bound to this invitation.
    pub auth_nonce: [u8; 32],
    /// Expiry; `None` means long-lived.
    pub expires_at: Option<SystemTime>,
}

impl Invitation {
    /// Create a long-lived offline invitation for `space_id`, pinned to
    /// `invitee_key`.
    pub fn offline<R: CryptoRngCore + ?Sized>(
        rng: &mut R,
        space_id: SpaceId,
        invitee_key: PublicKey,
    ) -> Self {
        let mut auth_nonce = [0u8; 32];
        rng.fill_bytes(&mut auth_nonce);
        Invitation {
            id: InvitationId::random(rng),
            kind: InvitationKind::Offline,
            space_id,
            swarm_key: SwarmKey::random(rng),
            invitee_key: Some(invitee_key),
            auth_nonce,
            expires_at: None,
        }
    }

    /// Whether the invitation is expired at `now`.
    pub fn is_expired(&self, now: SystemTime) -> bool {
        self.expires_at.is_some_and(|at| now >= at)
    }

    /// The descriptor handed to peers.
    pub fn descriptor(&self) -> InvitationDescriptor {
        InvitationDescriptor {
            kind: self.kind,
            id: self.id,
            swarm_key: self.swarm_key,
        }
    }
}

/// The shareable part of an invitation.
///
/// For offline invitations `swarm_key` is the claim swarm topic; for
/// interactive invitations it is the rendezvous key the greeting runs on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvitationDescriptor {
    /// Offline or interactive.
    pub kind: InvitationKind,
    /// Invitation id.
    pub id: InvitationId,
    /// Claim swarm topic, or rendezvous key for interactive invitations.
    pub swarm_key: SwarmKey,
}

impl InvitationDescriptor {
    /// String prefix for the token encoding.
    pub const KIND: &'static str = "harborinv";

    /// Serialize to a shareable token string.
    pub fn serialize(&self) -> String {
        let bytes = postcard::to_stdvec(self).expect("descriptor serialization is infallible");
        let mut out = Self::KIND.to_string();
        data_encoding::BASE32_NOPAD.encode_append(&bytes, &mut out);
        out.to_ascii_lowercase()
    }

    /// Deserialize from a token string.
    pub fn deserialize(str: &str) -> anyhow::Result<Self> {
        let rest = str
            .strip_prefix(Self::KIND)
            .ok_or_else(|| anyhow::anyhow!("missing {} prefix", Self::KIND))?;
        let bytes = data_encoding::BASE32_NOPAD.decode(rest.to_ascii_uppercase().as_bytes())?;
        Ok(postcard::from_bytes(&bytes)?)
    }
}

/// A signed claim message, sent by the claimant over the swarm.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClaimRequest {
    /// The offline invitation being redeemed.
    pub invitation_id: InvitationId,
    /// The claimant's ephemeral peer key.
    pub claimant: PublicKey,
    /// Signature over the invitation id by the ephemeral key.
    pub signature: Signature,
}

impl ClaimRequest {
    /// Build and sign a claim for `invitation_id` with the ephemeral key.
    pub fn new(invitation_id: InvitationId, ephemeral: &SecretKey) -> Self {
        let signature = ephemeral.sign(invitation_id.as_bytes());
        ClaimRequest {
            invitation_id,
            claimant: ephemeral.public(),
            signature,
        }
    }

    /// Verify the claim signature.
    pub fn verify(&self) -> bool {
        self.claimant
            .verify(self.invitation_id.as_bytes(), &self.signature)
            .is_ok()
    }
}

/// Response to a [`ClaimRequest`].
///
/// Both fields are required for a successful claim; they are optional on the
/// wire so a responder can degrade gracefully, and the claimant treats a
/// partial response as malformed.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClaimResponse {
    /// Id of the freshly minted interactive invitation.
    pub id: Option<InvitationId>,
    /// Rendezvous key for the interactive greeting.
    pub rendezvous_key: Option<SwarmKey>,
}

/// Challenge presented to a peer authenticating against an interactive
/// invitation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthChallenge {
    /// The interactive invitation id.
    pub id: InvitationId,
    /// Nonce the auth payload must echo.
    pub auth_nonce: [u8; 32],
}

/// Credential proving control of an identity key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Credential {
    /// Signed directly with the identity key.
    Identity {
        /// The identity key.
        key: PublicKey,
        /// Signature over the auth body.
        signature: Signature,
    },
    /// Signed with a device key certified by the identity key.
    Device {
        /// The root identity key.
        identity_key: PublicKey,
        /// The certified device key.
        device_key: PublicKey,
        /// Identity's signature over the device key.
        certificate: Signature,
        /// Device's signature over the auth body.
        signature: Signature,
    },
}

/// The authentication payload a claimant presents as its secret.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthPayload {
    /// The challenge's invitation id.
    pub invitation_id: InvitationId,
    /// The space the claimant believes it is joining.
    pub space_id: SpaceId,
    /// Echo of the challenge nonce.
    pub nonce: [u8; 32],
    /// Proof of identity.
    pub credential: Credential,
}

fn auth_signing_bytes(invitation_id: &InvitationId, space_id: &SpaceId, nonce: &[u8; 32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(96);
    bytes.extend_from_slice(invitation_id.as_bytes());
    bytes.extend_from_slice(space_id.as_bytes());
    bytes.extend_from_slice(nonce);
    bytes
}

/// Build the auth secret answering `challenge`, signed with the caller's
/// credentials.
///
/// Prefers the identity key; a keyring without the identity secret falls
/// back to its device keychain and fails fast without one.
pub fn auth_secret(
    challenge: &AuthChallenge,
    space_id: SpaceId,
    keyring: &Keyring,
) -> Result<Bytes, AdmissionError> {
    if keyring.identity().is_some() {
        identity_auth_secret(challenge, space_id, keyring)
    } else {
        device_auth_secret(challenge, space_id, keyring)
    }
}

/// Build the auth secret signed directly with the identity key.
pub fn identity_auth_secret(
    challenge: &AuthChallenge,
    space_id: SpaceId,
    keyring: &Keyring,
) -> Result<Bytes, AdmissionError> {
    let identity = keyring.identity().ok_or(AdmissionError::NoIdentityKey)?;
    let body = auth_signing_bytes(&challenge.id, &space_id, &challenge.auth_nonce);
    let credential = Credential::Identity {
        key: identity.public(),
        signature: identity.sign(&body),
    };
    encode_secret(challenge, space_id, credential)
}

/// Build the auth secret signed with the device keychain.
pub fn device_auth_secret(
    challenge: &AuthChallenge,
    space_id: SpaceId,
    keyring: &Keyring,
) -> Result<Bytes, AdmissionError> {
    let device = keyring.device().ok_or(AdmissionError::NoDeviceKeychain)?;
    let body = auth_signing_bytes(&challenge.id, &space_id, &challenge.auth_nonce);
    let credential = Credential::Device {
        identity_key: device.identity_key(),
        device_key: device.device_key(),
        certificate: device.certificate(),
        signature: device.sign(&body),
    };
    encode_secret(challenge, space_id, credential)
}

fn encode_secret(
    challenge: &AuthChallenge,
    space_id: SpaceId,
    credential: Credential,
) -> Result<Bytes, AdmissionError> {
    let payload = AuthPayload {
        invitation_id: challenge.id,
        space_id,
        nonce: challenge.auth_nonce,
        credential,
    };
    Ok(postcard::to_stdvec(&payload)
        .map_err(|err| AdmissionError::Internal(err.into()))?
        .into())
}

/// Why an auth secret was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[allow(missing_docs)]
pub enum RejectReason {
    Malformed,
    UntrustedKey,
    BadSignature,
    SpaceMismatch,
    NonceMismatch,
    Expired,
    Unknown,
}

/// Validates auth secrets against one minted interactive invitation.
///
/// The trust set contains exactly the pinned invitee key; only that key, or a
/// device credential chain rooted in it, passes.
#[derive(Debug, Clone)]
pub struct SecretValidator {
    trusted_key: PublicKey,
    space_id: SpaceId,
    nonce: [u8; 32],
}

impl SecretValidator {
    /// Build a validator pinned to `trusted_key`.
    pub fn new(trusted_key: PublicKey, space_id: SpaceId, nonce: [u8; 32]) -> Self {
        SecretValidator {
            trusted_key,
            space_id,
            nonce,
        }
    }

    /// Validate a candidate secret; returns the authenticated identity key.
    pub fn validate(&self, secret: &[u8]) -> Result<PublicKey, RejectReason> {
        let payload: AuthPayload =
            postcard::from_bytes(secret).map_err(|_| RejectReason::Malformed)?;
        let body = auth_signing_bytes(&payload.invitation_id, &payload.space_id, &payload.nonce);
        let identity = match &payload.credential {
            Credential::Identity { key, signature } => {
                if *key != self.trusted_key {
                    return Err(RejectReason::UntrustedKey);
                }
                key.verify(&body, signature)
                    .map_err(|_| RejectReason::BadSignature)?;
                *key
            }
            Credential::Device {
                identity_key,
                device_key,
                certificate,
                signature,
            } => {
                if *identity_key != self.trusted_key {
                    return Err(RejectReason::UntrustedKey);
                }
                identity_key
                    .verify(device_key.as_bytes(), certificate)
                    .map_err(|_| RejectReason::BadSignature)?;
                device_key
                    .verify(&body, signature)
                    .map_err(|_| RejectReason::BadSignature)?;
                *identity_key
            }
        };
        if payload.space_id != self.space_id {
            return Err(RejectReason::SpaceMismatch);
        }
        if payload.nonce != self.nonce {
            return Err(RejectReason::NonceMismatch);
        }
        Ok(identity)
    }
}

/// Errors of the admission protocol.
#[derive(Debug, Error)]
pub enum AdmissionError {
    /// An operation was called in the wrong session state.
    #[error("operation requires state {expected}, session is {actual}")]
    InvalidState {
        /// Required state.
        expected: ClaimState,
        /// Actual state.
        actual: ClaimState,
    },
    /// No peer joined the claim swarm in time.
    #[error("no peer joined the claim swarm within {timeout:?}")]
    ConnectionTimeout {
        /// The timeout that elapsed.
        timeout: Duration,
    },
    /// The offline invitation is unknown or expired.
    #[error("invitation {id} is unknown or expired")]
    InvalidInvitation {
        /// The claimed invitation id.
        id: InvitationId,
    },
    /// The claim response lacked required fields.
    #[error("claim response is missing required fields")]
    MalformedResponse,
    /// The keyring holds no credential to authenticate with.
    #[error("no identity key available to authenticate")]
    NoIdentityKey,
    /// The keyring's device keychain is missing.
    #[error("no device keychain available to authenticate")]
    NoDeviceKeychain,
    /// An auth secret was rejected.
    #[error("auth secret rejected: {reason}")]
    Rejected {
        /// Why the secret was rejected.
        reason: RejectReason,
    },
    /// Transport-level swarm failure.
    #[error("swarm error: {0}")]
    Swarm(anyhow::Error),
    /// Internal serialization failure.
    #[error("internal error: {0}")]
    Internal(anyhow::Error),
}

/// Discovery swarm port used by claim sessions.
///
/// Implementations key all operations by the swarm topic. The futures
/// returned must not borrow the receiver; implementors typically clone
/// shared state into them.
pub trait Swarm: Send + Sync + 'static {
    /// Join the swarm on `topic`, announcing `local` as the peer identity.
    fn join(&self, topic: SwarmKey, local: PublicKey) -> BoxedFuture<anyhow::Result<()>>;
    /// Resolve once the first remote peer joins `topic`. Resolves to `None`
    /// if the swarm is closed.
    fn first_peer(&self, topic: SwarmKey) -> BoxedFuture<Option<PublicKey>>;
    /// Send a claim request to `to` and await the response.
    fn request(
        &self,
        topic: SwarmKey,
        to: PublicKey,
        request: ClaimRequest,
    ) -> BoxedFuture<anyhow::Result<ClaimResponse>>;
    /// Leave the swarm on `topic`.
    fn leave(&self, topic: SwarmKey) -> BoxedFuture<()>;
}

/// States of a [`ClaimSession`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[allow(missing_docs)]
pub enum ClaimState {
    Initialized,
    Connected,
    Succeeded,
    Disconnected,
    Destroyed,
}

struct Connected {
    ephemeral: SecretKey,
    remote: PublicKey,
}

/// Claimant-side session redeeming one offline invitation.
///
/// Single use: a session is created per claim attempt and never reused
/// across invitations.
#[derive(derive_more::Debug)]
pub struct ClaimSession {
    #[debug("Swarm")]
    swarm: Arc<dyn Swarm>,
    invitation: InvitationDescriptor,
    state: ClaimState,
    #[debug(skip)]
    conn: Option<Connected>,
    joined: bool,
    metrics: Arc<Metrics>,
}

impl ClaimSession {
    /// Create a session for the given offline invitation.
    pub fn new(
        swarm: Arc<dyn Swarm>,
        invitation: InvitationDescriptor,
        metrics: Arc<Metrics>,
    ) -> Self {
        ClaimSession {
            swarm,
            invitation,
            state: ClaimState::Initialized,
            conn: None,
            joined: false,
            metrics,
        }
    }

    /// Current session state.
    pub fn state(&self) -> ClaimState {
        self.state
    }

    /// Join the invitation's swarm and wait for the first remote peer.
    ///
    /// Uses a fresh ephemeral peer identity so the attempt cannot be linked
    /// to the caller's long-term identity. On timeout the session stays
    /// `Initialized` and the caller may retry with another `connect`.
    pub async fn connect<R: CryptoRngCore + ?Sized>(
        &mut self,
        timeout: Duration,
        rng: &mut R,
    ) -> Result<(), AdmissionError> {
        self.ensure_state(ClaimState::Initialized)?;
        let ephemeral = SecretKey::generate(rng);
        let topic = self.invitation.swarm_key;
        trace!(invitation = %self.invitation.id, %topic, "joining claim swarm");
        self.swarm
            .join(topic, ephemeral.public())
            .await
            .map_err(AdmissionError::Swarm)?;
        self.joined = true;

        match tokio::time::timeout(timeout, self.swarm.first_peer(topic)).await {
            Ok(Some(remote)) => {
                debug!(invitation = %self.invitation.id, peer = ?remote, "claim swarm connected");
                self.conn = Some(Connected { ephemeral, remote });
                self.state = ClaimState::Connected;
                Ok(())
            }
            Ok(None) => {
                self.leave_swarm().await;
                self.metrics.claims_failed.inc();
                Err(AdmissionError::Swarm(anyhow::anyhow!("swarm closed")))
            }
            Err(_) => {
                self.leave_swarm().await;
                self.metrics.claims_failed.inc();
                Err(AdmissionError::ConnectionTimeout { timeout })
            }
        }
    }

    /// Send the signed claim and await the minted interactive invitation.
    ///
    /// Disconnects the ephemeral swarm as soon as the response arrives, to
    /// keep the anonymous session window short.
    pub async fn claim(&mut self) -> Result<InvitationDescriptor, AdmissionError> {
        self.ensure_state(ClaimState::Connected)?;
        let Connected { ephemeral, remote } = self.conn.take().ok_or_else(|| {
            AdmissionError::Internal(anyhow::anyhow!("connected session without connection state"))
        })?;
        let topic = self.invitation.swarm_key;
        let request = ClaimRequest::new(self.invitation.id, &ephemeral);

        let response = match self.swarm.request(topic, remote, request).await {
            Ok(response) => response,
            Err(err) => {
                self.metrics.claims_failed.inc();
                self.disconnect().await;
                return Err(AdmissionError::Swarm(err));
            }
        };
        let (Some(id), Some(rendezvous_key)) = (response.id, response.rendezvous_key) else {
            warn!(invitation = %self.invitation.id, "claim response missing fields");
            self.metrics.claims_failed.inc();
            self.disconnect().await;
            return Err(AdmissionError::MalformedResponse);
        };

        self.leave_swarm().await;
        self.state = ClaimState::Succeeded;
        self.metrics.claims_succeeded.inc();
        debug!(invitation = %self.invitation.id, interactive = %id, "claim succeeded");
        Ok(InvitationDescriptor {
            kind: InvitationKind::Interactive,
            id,
            swarm_key: rendezvous_key,
        })
    }

    /// Leave the swarm and mark the session disconnected. Idempotent; safe
    /// in any state.
    pub async fn disconnect(&mut self) {
        self.leave_swarm().await;
        self.conn = None;
        if self.state != ClaimState::Destroyed {
            self.state = ClaimState::Disconnected;
        }
    }

    /// Tear the session down for good. Idempotent; safe in any state.
    pub async fn destroy(&mut self) {
        self.leave_swarm().await;
        self.conn = None;
        self.state = ClaimState::Destroyed;
    }

    async fn leave_swarm(&mut self) {
        if self.joined {
            self.swarm.leave(self.invitation.swarm_key).await;
            self.joined = false;
        }
    }

    fn ensure_state(&self, expected: ClaimState) -> Result<(), AdmissionError> {
        if self.state != expected {
            return Err(AdmissionError::InvalidState {
                expected,
                actual: self.state,
            });
        }
        Ok(())
    }
}

struct Minted {
    invitation: Invitation,
    validator: SecretValidator,
}

/// Responder side of the claim protocol.
///
/// Holds the offline invitations a space member has issued, and the
/// interactive invitations minted from successful claims.
#[derive(derive_more::Debug)]
pub struct ClaimHandler {
    #[debug(skip)]
    offline: Mutex<HashMap<InvitationId, Invitation>>,
    #[debug(skip)]
    minted: Mutex<HashMap<InvitationId, Minted>>,
    ttl: Duration,
    metrics: Arc<Metrics>,
}

impl ClaimHandler {
    /// Create a handler minting invitations with the default TTL.
    pub fn new(metrics: Arc<Metrics>) -> Self {
        ClaimHandler {
            offline: Mutex::new(HashMap::new()),
            minted: Mutex::new(HashMap::new()),
            ttl: INTERACTIVE_INVITATION_TTL,
            metrics,
        }
    }

    /// Register an offline invitation this peer will answer claims for.
    pub fn register_offline(&self, invitation: Invitation) {
        self.offline
            .lock()
            .expect("poisoned")
            .insert(invitation.id, invitation);
    }

    /// Answer one claim.
    ///
    /// On success mints a fresh interactive invitation pinned to the offline
    /// invitation's invitee key, guarded by a validator that only accepts an
    /// auth payload signed by that key (or a device chain rooted in it) with
    /// the right space and nonce.
    pub fn handle_claim<R: CryptoRngCore + ?Sized>(
        &self,
        request: &ClaimRequest,
        rng: &mut R,
    ) -> Result<ClaimResponse, AdmissionError> {
        if !request.verify() {
            self.metrics.claims_rejected.inc();
            return Err(AdmissionError::Rejected {
                reason: RejectReason::BadSignature,
            });
        }
        let offline = self.offline.lock().expect("poisoned");
        let invitation = offline
            .get(&request.invitation_id)
            .filter(|invitation| !invitation.is_expired(SystemTime::now()))
            .ok_or(AdmissionError::InvalidInvitation {
                id: request.invitation_id,
            })?;
        // The invitee key was verified when the invitation was admitted to
        // the space; it is trusted as-is here.
        let invitee_key = invitation
            .invitee_key
            .ok_or(AdmissionError::InvalidInvitation {
                id: request.invitation_id,
            })?;
        let space_id = invitation.space_id;
        drop(offline);

        let mut auth_nonce = [0u8; 32];
        rng.fill_bytes(&mut auth_nonce);
        let minted = Invitation {
            id: InvitationId::random(rng),
            kind: InvitationKind::Interactive,
            space_id,
            swarm_key: SwarmKey::random(rng),
            invitee_key: Some(invitee_key),
            auth_nonce,
            expires_at: Some(SystemTime::now() + self.ttl),
        };
        let response = ClaimResponse {
            id: Some(minted.id),
            rendezvous_key: Some(minted.swarm_key),
        };
        debug!(offline = %request.invitation_id, interactive = %minted.id, "minted interactive invitation");
        let validator = SecretValidator::new(invitee_key, space_id, auth_nonce);
        self.minted.lock().expect("poisoned").insert(
            minted.id,
            Minted {
                invitation: minted,
                validator,
            },
        );
        Ok(response)
    }

    /// The auth challenge for a minted interactive invitation.
    pub fn challenge(&self, id: &InvitationId) -> Option<AuthChallenge> {
        self.minted.lock().expect("poisoned").get(id).map(|m| AuthChallenge {
            id: m.invitation.id,
            auth_nonce: m.invitation.auth_nonce,
        })
    }

    /// Validate an auth secret against a minted interactive invitation.
    ///
    /// Interactive invitations are single use: a successful validation
    /// consumes the invitation. Rejections leave it in place until expiry.
    pub fn validate_secret(
        &self,
        id: &InvitationId,
        secret: &[u8],
    ) -> Result<PublicKey, AdmissionError> {
        let mut minted = self.minted.lock().expect("poisoned");
        let entry = minted
            .get(id)
            .ok_or(AdmissionError::InvalidInvitation { id: *id })?;
        if entry.invitation.is_expired(SystemTime::now()) {
            minted.remove(id);
            return Err(AdmissionError::InvalidInvitation { id: *id });
        }
        match entry.validator.validate(secret) {
            Ok(identity) => {
                minted.remove(id);
                Ok(identity)
            }
            Err(reason) => {
                self.metrics.claims_rejected.inc();
                Err(AdmissionError::Rejected { reason })
            }
        }
    }
}
