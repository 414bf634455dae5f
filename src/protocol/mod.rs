//! MQTT 3.1.1 packet model and wire codec.

pub mod codec;
pub mod packet;

pub use codec::{decode, encode, ProtocolError, MAX_REMAINING_LENGTH};
pub use packet::{
    ConnAck, Connect, ConnectReturnCode, Packet, Publish, Qos, SubAck, Subscribe,
    SubscribeReturnCode, Unsubscribe, Will,
};
