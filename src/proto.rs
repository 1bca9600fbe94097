//! Wire types shared by the replication protocols.
//!
//! Everything on the wire is postcard-encoded. Transports that carry raw byte
//! streams can use [`EnvelopeCodec`] for length-prefixed framing.

use anyhow::{Result, ensure};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use tokio_util::codec::{Decoder, Encoder};

use crate::keys::{PublicKey, RepoId, SpaceId};

/// Protocol name used as the service-id prefix for replicator traffic.
pub const REPLICATOR_SERVICE: &str = "harbor-replicator";

/// Maximum size of a single wire frame.
pub const MAX_FRAME_SIZE: usize = 1024 * 1024 * 16;

/// Build the service id addressing replicator traffic for one space.
pub fn service_id(space_id: &SpaceId) -> String {
    format!("{REPLICATOR_SERVICE}:{space_id}")
}

/// Parse a service id back into a space id.
///
/// Returns `None` for service ids that do not belong to the replicator
/// protocol, or whose space part does not parse.
pub fn parse_service_id(service_id: &str) -> Option<SpaceId> {
    let rest = service_id.strip_prefix(REPLICATOR_SERVICE)?;
    let rest = rest.strip_prefix(':')?;
    rest.parse().ok()
}

/// Envelope wrapping every message on the shared messenger.
///
/// The service id routes the message to a logical channel; the sender's
/// identity and device keys travel alongside so receivers can attribute
/// traffic without a side channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    /// Service id of the logical channel, e.g. `harbor-replicator:<space>`.
    pub service_id: String,
    /// Sender's identity key.
    pub identity_key: PublicKey,
    /// Sender's device key.
    pub device_key: PublicKey,
    /// Opaque payload, routed by `service_id`.
    pub payload: Bytes,
}

impl Envelope {
    /// Postcard-encode this envelope.
    pub fn encode(&self) -> Result<Bytes> {
        let bytes = postcard::to_stdvec(self)?;
        ensure!(bytes.len() <= MAX_FRAME_SIZE, "envelope too large");
        Ok(bytes.into())
    }

    /// Decode an envelope from postcard bytes.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        Ok(postcard::from_bytes(bytes)?)
    }
}

/// Payload of a replicator envelope: one CRDT sync frame scoped to a space.
///
/// The space id is repeated inside the payload so a receiver can cross-check
/// it against the service id before handing the frame to a connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpaceFrame {
    /// The space this frame belongs to.
    pub space_id: SpaceId,
    /// Opaque CRDT sync frame.
    pub payload: Bytes,
}

impl SpaceFrame {
    /// Postcard-encode this frame.
    pub fn encode(&self) -> Result<Bytes> {
        Ok(postcard::to_stdvec(self)?.into())
    }

    /// Decode a frame from postcard bytes.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        Ok(postcard::from_bytes(bytes)?)
    }
}

/// Calls carried over a sync channel's RPC port.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
pub enum Request {
    /// Announce the local repository and open the channel for sync traffic.
    StartReplication {
        /// The announcing peer's repository id.
        repo_id: RepoId,
    },
    /// One CRDT sync frame.
    SyncMessage {
        /// Opaque CRDT sync frame.
        frame: Bytes,
    },
}

/// Responses to [`Request`]s.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
pub enum Response {
    /// Acknowledges a `StartReplication`, announcing the remote repository.
    ReplicationStarted {
        /// The responding peer's repository id.
        repo_id: RepoId,
    },
    /// Acknowledges a `SyncMessage`.
    Ack,
}

/// Length-prefixed postcard codec for [`Envelope`]s on byte-stream transports.
#[derive(Debug, Default)]
pub struct EnvelopeCodec;

impl Decoder for EnvelopeCodec {
    type Item = Envelope;
    type Error = anyhow::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        if src.len() < 4 {
            return Ok(None);
        }
        let bytes: [u8; 4] = src[..4].try_into().expect("just checked");
        let frame_len = u32::from_be_bytes(bytes) as usize;
        ensure!(
            frame_len <= MAX_FRAME_SIZE,
            "received frame that is too large: {}",
            frame_len
        );
        if src.len() < 4 + frame_len {
            return Ok(None);
        }

        let envelope = Envelope::decode(&src[4..4 + frame_len])?;
        src.advance(4 + frame_len);
        Ok(Some(envelope))
    }
}

impl Encoder<Envelope> for EnvelopeCodec {
    type Error = anyhow::Error;

    fn encode(&mut self, item: Envelope, dst: &mut BytesMut) -> Result<()> {
        let bytes = item.encode()?;
        dst.put_u32(u32::try_from(bytes.len()).expect("bounded by MAX_FRAME_SIZE"));
        dst.extend_from_slice(&bytes);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use rand_chacha::ChaCha12Rng;
    use rand_core::SeedableRng;

    use super::*;
    use crate::keys::SecretKey;

    fn envelope(rng: &mut ChaCha12Rng) -> Envelope {
        let space_id = SpaceId::random(rng);
        Envelope {
            service_id: service_id(&space_id),
            identity_key: SecretKey::generate(rng).public(),
            device_key: SecretKey::generate(rng).public(),
            payload: SpaceFrame {
                space_id,
                payload: Bytes::from_static(b"sync frame"),
            }
            .encode()
            .unwrap(),
        }
    }

    #[test]
    fn service_id_roundtrip() {
        let mut rng = ChaCha12Rng::seed_from_u64(7);
        let space_id = SpaceId::random(&mut rng);
        let sid = service_id(&space_id);
        assert_eq!(parse_service_id(&sid), Some(space_id));
        assert_eq!(parse_service_id("other-protocol:abc"), None);
        assert_eq!(parse_service_id(REPLICATOR_SERVICE), None);
    }

    #[test]
    fn codec_roundtrip() {
        let mut rng = ChaCha12Rng::seed_from_u64(8);
        let env = envelope(&mut rng);

        let mut buf = BytesMut::new();
        EnvelopeCodec.encode(env.clone(), &mut buf).unwrap();

        // A partial buffer decodes to nothing and consumes nothing.
        let mut partial = BytesMut::from(&buf[..buf.len() - 1]);
        assert!(EnvelopeCodec.decode(&mut partial).unwrap().is_none());

        let decoded = EnvelopeCodec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, env);
        assert!(buf.is_empty());
    }
}
