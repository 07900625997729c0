use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::mpsc;

use super::{Envelope, NodeRank, Transport, TransportError};
use crate::protocol::{Message, Opcode};

struct Frame {
    from: NodeRank,
    bytes: Vec<u8>,
}

/// One recorded send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoggedMessage {
    pub from: NodeRank,
    pub to: NodeRank,
    pub opcode: Opcode,
    pub job_id: Option<u64>,
}

/// Shared record of every message sent on a [`LocalNetwork`], in send order.
#[derive(Debug, Clone, Default)]
pub struct MessageLog {
    entries: Arc<Mutex<Vec<LoggedMessage>>>,
}

impl MessageLog {
    pub fn new() -> Self {
        Self::default()
    }

    fn record(&self, entry: LoggedMessage) {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(entry);
    }

    pub fn snapshot(&self) -> Vec<LoggedMessage> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

/// Builds the connected endpoints of an in-process group.
///
/// Messages are encoded to bytes on send and decoded on receipt, so nothing
/// but bytes ever crosses from one role to another.
pub struct LocalNetwork {
    size: usize,
    log: Option<MessageLog>,
}

impl LocalNetwork {
    pub fn new(size: usize) -> Self {
        Self { size, log: None }
    }

    pub fn with_log(mut self, log: Option<MessageLog>) -> Self {
        self.log = log;
        self
    }

    /// One endpoint per rank, in rank order.
    pub fn endpoints(self) -> Vec<LocalEndpoint> {
        let (senders, receivers): (Vec<_>, Vec<_>) =
            (0..self.size).map(|_| mpsc::unbounded_channel()).unzip();
        let peers = Arc::new(senders);

        receivers
            .into_iter()
            .enumerate()
            .map(|(rank, inbox)| LocalEndpoint {
                rank,
                peers: peers.clone(),
                inbox,
                deferred: VecDeque::new(),
                log: self.log.clone(),
            })
            .collect()
    }
}

pub struct LocalEndpoint {
    rank: NodeRank,
    peers: Arc<Vec<mpsc::UnboundedSender<Frame>>>,
    inbox: mpsc::UnboundedReceiver<Frame>,
    /// Frames skipped over by `recv_from`, oldest first.
    deferred: VecDeque<Frame>,
    log: Option<MessageLog>,
}

impl LocalEndpoint {
    async fn next_frame(&mut self) -> Result<Frame, TransportError> {
        self.inbox
            .recv()
            .await
            .ok_or(TransportError::InboxClosed(self.rank))
    }

    fn decode(frame: Frame) -> Result<Envelope, TransportError> {
        let message = bincode::deserialize(&frame.bytes).map_err(|source| {
            TransportError::Decode {
                from: frame.from,
                source,
            }
        })?;
        Ok(Envelope {
            source: frame.from,
            message,
        })
    }
}

impl Transport for LocalEndpoint {
    fn rank(&self) -> NodeRank {
        self.rank
    }

    fn size(&self) -> usize {
        self.peers.len()
    }

    fn send(&self, dest: NodeRank, message: Message) -> Result<(), TransportError> {
        let peer = self.peers.get(dest).ok_or(TransportError::UnknownRank {
            rank: dest,
            size: self.peers.len(),
        })?;
        let bytes = bincode::serialize(&message).map_err(|source| TransportError::Encode {
            opcode: message.opcode(),
            source,
        })?;
        if let Some(log) = &self.log {
            log.record(LoggedMessage {
                from: self.rank,
                to: dest,
                opcode: message.opcode(),
                job_id: message.job_id(),
            });
        }
        peer.send(Frame {
            from: self.rank,
            bytes,
        })
        .map_err(|_| TransportError::Disconnected(dest))
    }

    async fn recv_any(&mut self) -> Result<Envelope, TransportError> {
        let frame = match self.deferred.pop_front() {
            Some(frame) => frame,
            None => self.next_frame().await?,
        };
        Self::decode(frame)
    }

    async fn recv_from(&mut self, source: NodeRank) -> Result<Message, TransportError> {
        if let Some(position) = self.deferred.iter().position(|frame| frame.from == source) {
            if let Some(frame) = self.deferred.remove(position) {
                return Self::decode(frame).map(|envelope| envelope.message);
            }
        }
        loop {
            let frame = self.next_frame().await?;
            if frame.from == source {
                return Self::decode(frame).map(|envelope| envelope.message);
            }
            self.deferred.push_back(frame);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::job::JobResultId;

    #[tokio::test]
    async fn test_recv_from_defers_other_senders() {
        let mut endpoints = LocalNetwork::new(3).endpoints();
        let mut master = endpoints.remove(0);
        let first = endpoints.remove(0);
        let second = endpoints.remove(0);

        first.send(0, Message::NewJobRequest).unwrap();
        second.send(0, Message::OutputCompleted).unwrap();
        first.send(0, Message::SpinDown).unwrap();

        assert_eq!(master.recv_from(2).await.unwrap(), Message::OutputCompleted);

        let envelope = master.recv_any().await.unwrap();
        assert_eq!(envelope.source, 1);
        assert_eq!(envelope.message, Message::NewJobRequest);

        let envelope = master.recv_any().await.unwrap();
        assert_eq!(envelope.source, 1);
        assert_eq!(envelope.message, Message::SpinDown);
    }

    #[tokio::test]
    async fn test_send_to_unknown_rank_fails() {
        let endpoints = LocalNetwork::new(2).endpoints();
        let err = endpoints[0].send(5, Message::SpinDown).unwrap_err();
        assert!(matches!(err, TransportError::UnknownRank { rank: 5, size: 2 }));
    }

    #[tokio::test]
    async fn test_message_log_records_sends_in_order() {
        let log = MessageLog::new();
        let endpoints = LocalNetwork::new(2).with_log(Some(log.clone())).endpoints();

        endpoints[1].send(0, Message::NewJobRequest).unwrap();
        endpoints[0]
            .send(
                1,
                Message::DiscardJobResult {
                    result_id: JobResultId::new(4, 1),
                },
            )
            .unwrap();

        let entries = log.snapshot();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].opcode, Opcode::NewJobRequest);
        assert_eq!(entries[1].to, 1);
        assert_eq!(entries[1].job_id, Some(4));
    }
}
