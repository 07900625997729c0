//! Point-to-point messaging between ranks of a fixed-size process group.
//!
//! Roles only talk through the [`Transport`] trait. Each call either sends one
//! [`Message`] or waits for the next one. [`local`] provides an in-process
//! implementation in which every role runs as a tokio task.
//!
//! # Ordering
//!
//! Messages from one sender to one receiver arrive in the order they were sent.
//! [`Transport::recv_from`] waits for a specific sender. Messages from any
//! other sender that arrive in the meantime are held back and returned later by
//! [`Transport::recv_any`] in their original order.

pub mod local;

use std::future::Future;

use thiserror::Error;

use crate::protocol::{Message, Opcode};

pub use local::{LocalEndpoint, LocalNetwork, LoggedMessage, MessageLog};

/// Index of a process in the group. Rank 0 is always the master.
pub type NodeRank = usize;

pub const MASTER_RANK: NodeRank = 0;

/// A received message and the rank that sent it.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    pub source: NodeRank,
    pub message: Message,
}

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("node {rank} is outside the process group of {size} nodes")]
    UnknownRank { rank: NodeRank, size: usize },

    #[error("node {0} is no longer reachable")]
    Disconnected(NodeRank),

    #[error("the inbox of node {0} was closed")]
    InboxClosed(NodeRank),

    #[error("failed to encode {opcode} message: {source}")]
    Encode {
        opcode: Opcode,
        #[source]
        source: bincode::Error,
    },

    #[error("failed to decode a message from node {from}: {source}")]
    Decode {
        from: NodeRank,
        #[source]
        source: bincode::Error,
    },
}

pub trait Transport: Send + 'static {
    fn rank(&self) -> NodeRank;

    /// Number of processes in the group.
    fn size(&self) -> usize;

    fn send(&self, dest: NodeRank, message: Message) -> Result<(), TransportError>;

    fn recv_any(&mut self) -> impl Future<Output = Result<Envelope, TransportError>> + Send;

    fn recv_from(
        &mut self,
        source: NodeRank,
    ) -> impl Future<Output = Result<Message, TransportError>> + Send;
}
