//! TTN wire protocol: topics, envelope codec and the uplink message model

pub mod codec;
pub mod messages;
pub mod topics;

pub use codec::{decode_envelope, encode_downlink, CodecError, DownlinkEnvelope, MAX_DOWNLINK_LEN};
pub use messages::{Gateway, InboundMessage, Metadata};
pub use topics::{
    resolve_broker, resolve_broker_with_host, resolve_publish_topic, resolve_subscribe_topic,
    ResolvedTopics, PROVIDER_HOST,
};
