//! The `rpc` collaborator (§4.3): fire-and-forget message delivery.
//! Responses are not return values of `send` — they travel back to the
//! server loop as separate inbound `Message`s, the way the teacher's
//! `Tick::send` hands a `Message` to a lower `rpc::Client` layer that is
//! responsible for actually putting it on the wire and, on the receiving
//! end, handing the peer's reply back in through the same front door.

use crate::proto::{Message, ServerDescriptor, ServerId};
use async_trait::async_trait;

#[async_trait]
pub trait RpcClient: Send + Sync {
    async fn send(&self, msg: Message);

    /// Registers a newly-added server's address with the transport layer
    /// so future sends to it can be routed.
    async fn add_server(&self, info: ServerDescriptor);
    async fn remove_server(&self, id: ServerId);
}
