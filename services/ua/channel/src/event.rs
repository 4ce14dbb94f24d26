//! Events reported by the assembler and the channel.

use crate::error::ChannelError;
use bytes::Bytes;
use tokio::sync::mpsc;
use tracing::trace;
use ua_wire::{ExpandedNodeId, MessageType, Structure, UaObject};

/// A fully reassembled and decoded message
#[derive(Debug, Clone)]
pub struct DecodedMessage {
    /// Message type of the carrying chunks
    pub message_type: MessageType,
    /// Encoding id read from the body; null for transport messages
    pub type_id: ExpandedNodeId,
    /// Decoded object
    pub body: Box<dyn UaObject>,
    /// Sequence number of the final chunk
    pub sequence_number: u32,
    /// Request id shared by all chunks of the message
    pub request_id: u32,
}

impl DecodedMessage {
    /// Type name of the decoded object
    pub fn type_name(&self) -> &'static str {
        self.body.type_name()
    }

    /// Borrow the object as `T` if it has that type
    pub fn downcast_ref<T: Structure>(&self) -> Option<&T> {
        self.body.downcast_ref::<T>()
    }
}

impl PartialEq for DecodedMessage {
    fn eq(&self, other: &Self) -> bool {
        self.message_type == other.message_type
            && self.type_id == other.type_id
            && self.sequence_number == other.sequence_number
            && self.request_id == other.request_id
            && self.body.eq_object(other.body.as_ref())
    }
}

/// Channel events
#[derive(Debug, Clone)]
pub enum ChannelEvent {
    /// A message was reassembled and decoded
    Message(DecodedMessage),
    /// Raw body of a reassembled message, emitted before it is decoded
    FullMessageBody(Bytes),
    /// A chunk or message was dropped
    Error(ChannelError),
    /// A chunk's sequence number did not follow the previous one
    InvalidSequenceNumber {
        /// Next number in sequence
        expected: u32,
        /// Number carried by the chunk
        found: u32,
    },
    /// The renewal point of the current token was reached
    Lifetime75 {
        /// Token about to be renewed
        token_id: u32,
    },
    /// A new token was installed
    SecurityTokenRenewed {
        /// Id of the new token
        token_id: u32,
    },
    /// The channel closed
    Closed {
        /// Why the channel closed
        reason: String,
    },
}

/// Receiver of channel events
pub trait EventSink {
    /// Deliver one event
    fn emit(&mut self, event: ChannelEvent);
}

impl EventSink for Vec<ChannelEvent> {
    fn emit(&mut self, event: ChannelEvent) {
        self.push(event);
    }
}

impl EventSink for mpsc::UnboundedSender<ChannelEvent> {
    fn emit(&mut self, event: ChannelEvent) {
        if self.send(event).is_err() {
            trace!("Event receiver dropped");
        }
    }
}
