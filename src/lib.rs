//! Synchronization substrate for replicated, capability-gated document
//! spaces.
//!
//! Peers hold replicas of CRDT documents grouped into *spaces*. Admission to
//! a space is gated by invitations: a long-lived offline invitation is
//! redeemed over an ephemeral swarm for a short-lived interactive one, pinned
//! to the invitee's identity key ([`admission`]). Once admitted, a peer
//! replicates the spaces it is interested in over a shared messenger
//! ([`replicator`]), with per-peer sync channels that gate traffic behind a
//! handshake and retry failed sends ([`channel`]). Client-side document
//! proxies batch local changes toward a data service ([`registry`]), and
//! queries are matched locally with a structural filter ([`filter`]).
//!
//! The crate is transport-agnostic: swarms, messengers, RPC ports and data
//! services are traits implemented by the embedding application.

#![deny(missing_docs, rustdoc::broken_intra_doc_links)]

pub mod admission;
pub mod channel;
pub mod filter;
pub mod keys;
pub mod metrics;
pub mod proto;
pub mod registry;
pub mod replicator;

pub use self::{
    admission::{ClaimHandler, ClaimSession, Invitation, InvitationDescriptor},
    channel::SyncChannel,
    filter::{Filter, MatchedObject},
    keys::{DocumentId, Keyring, PublicKey, SecretKey, SpaceId},
    registry::ProxyRegistry,
    replicator::SpaceReplicator,
};
