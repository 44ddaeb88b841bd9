//! Inbound transmission state machine.

use std::collections::VecDeque;
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use tokio::sync::{Notify, oneshot};
use tracing::{debug, trace};

use super::agreement::Agreement;
use super::clock::Mics;
use super::gene::ReceiveGene;
use super::window::GeneStore;
use crate::protocol::{
    BURST_GENE_LIMIT, DataControl, FirstGeneHeader, FollowingGeneHeader, GeneSpan, Message,
    NetError, NetResult, TransmissionMode,
};

/// Resolves a caller waiting for a solicited message.
pub(crate) type MessageWaiter = oneshot::Sender<NetResult<Message>>;

/// Acknowledgment owed after a gene arrival.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum AckKind {
    Burst,
    Block(Option<i32>),
}

/// What the connection must do after a gene arrival.
#[derive(Debug, Default)]
pub(crate) struct Arrival {
    pub ack: Option<AckKind>,
    /// Completed message nobody was waiting for.
    pub message: Option<Message>,
    pub stream_opened: bool,
    pub completed: bool,
}

impl Arrival {
    fn ack(kind: AckKind) -> Self {
        Self {
            ack: Some(kind),
            ..Self::default()
        }
    }
}

/// Result of a read from a receive stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum StreamRead {
    Chunk { data: Bytes, window_opened: bool },
    Finished,
    Canceled,
    Failed(NetError),
    Pending,
}

#[derive(Debug)]
struct StreamInbox {
    ready: VecDeque<Bytes>,
    capacity: i32,
    max_stream_length: i64,
    received_length: i64,
    finished: Option<DataControl>,
}

#[derive(Debug)]
pub(crate) struct ReceiveTransmission {
    id: u32,
    mode: TransmissionMode,
    wire_mode: TransmissionMode,
    genes: GeneStore<ReceiveGene>,
    total_gene: i32,
    successive_received_position: i32,
    max_receive_position: i32,
    data_kind: u32,
    data_id: u64,
    created_mics: Mics,
    completed_mics: Option<Mics>,
    waiter: Option<MessageWaiter>,
    stream: Option<StreamInbox>,
    failure: Option<NetError>,
    notify: Arc<Notify>,
}

impl ReceiveTransmission {
    /// Transmission opened by the peer.
    pub(crate) fn new(id: u32, now: Mics) -> Self {
        Self {
            id,
            mode: TransmissionMode::Initial,
            wire_mode: TransmissionMode::Initial,
            genes: GeneStore::burst(),
            total_gene: 0,
            successive_received_position: 0,
            max_receive_position: 0,
            data_kind: 0,
            data_id: 0,
            created_mics: now,
            completed_mics: None,
            waiter: None,
            stream: None,
            failure: None,
            notify: Arc::new(Notify::new()),
        }
    }

    /// Transmission registered ahead of a response the local side asked for.
    pub(crate) fn solicited(id: u32, waiter: MessageWaiter, now: Mics) -> Self {
        Self {
            waiter: Some(waiter),
            ..Self::new(id, now)
        }
    }

    pub(crate) fn mode(&self) -> TransmissionMode {
        self.mode
    }

    pub(crate) fn is_solicited(&self) -> bool {
        self.waiter.is_some()
    }

    /// Still receiving or holding undelivered data.
    pub(crate) fn is_active(&self) -> bool {
        !matches!(
            self.mode(),
            TransmissionMode::Disposed | TransmissionMode::StreamCompleted
        )
    }

    pub(crate) fn created_mics(&self) -> Mics {
        self.created_mics
    }

    pub(crate) fn data_kind(&self) -> u32 {
        self.data_kind
    }

    pub(crate) fn data_id(&self) -> u64 {
        self.data_id
    }

    pub(crate) fn notify(&self) -> Arc<Notify> {
        self.notify.clone()
    }

    /// Monotone count of contiguous genes received from position 0.
    pub(crate) fn successive_received_position(&self) -> i32 {
        self.successive_received_position
    }

    /// `(max_receive_position, successive_received_position)` for block and stream acks.
    pub(crate) fn window_report(&self) -> Option<(i32, i32)> {
        matches!(
            self.wire_mode,
            TransmissionMode::Block | TransmissionMode::Stream
        )
        .then_some((self.max_receive_position, self.successive_received_position))
    }

    /// Disposed longer ago than `retention`.
    pub(crate) fn is_expired(&self, now: Mics, retention: Mics) -> bool {
        self.mode == TransmissionMode::Disposed
            && self
                .completed_mics
                .is_some_and(|completed| now - completed > retention)
    }

    fn duplicate(&self) -> Arrival {
        match self.wire_mode {
            TransmissionMode::Burst => Arrival::ack(AckKind::Burst),
            TransmissionMode::Block | TransmissionMode::Stream => {
                Arrival::ack(AckKind::Block(None))
            }
            _ => Arrival::default(),
        }
    }

    /// Handle gene 0, which fixes the mode and the size of the transmission.
    pub(crate) fn first_gene(
        &mut self,
        header: &FirstGeneHeader,
        payload: Bytes,
        agreement: &Agreement,
        now: Mics,
    ) -> NetResult<Arrival> {
        if self.mode != TransmissionMode::Initial {
            return Ok(self.duplicate());
        }

        match (header.mode, header.span) {
            (TransmissionMode::Burst, GeneSpan::TotalGene(total)) => {
                if usize::try_from(total).map_or(true, |total| total > BURST_GENE_LIMIT) {
                    return Err(self.fail(NetError::InvalidData, now));
                }
                self.genes = GeneStore::burst();
                self.total_gene = total;
                self.max_receive_position = total;
            }
            (TransmissionMode::Block, GeneSpan::TotalGene(total)) => {
                if total > agreement.max_block_genes() {
                    return Err(self.fail(NetError::BlockSizeLimit, now));
                }
                self.genes = GeneStore::window(usize::try_from(total).unwrap_or(1));
                self.total_gene = total;
                self.max_receive_position = total;
            }
            (TransmissionMode::Stream, GeneSpan::MaxStreamLength(length)) => {
                if self.waiter.is_some() {
                    return Err(self.fail(NetError::InvalidData, now));
                }
                if length <= 0 || length > agreement.max_stream_length {
                    return Err(self.fail(NetError::StreamLengthLimit, now));
                }
                let capacity = agreement.stream_window_genes(length);
                self.genes = GeneStore::window(usize::try_from(capacity).unwrap_or(1));
                self.max_receive_position = capacity;
                self.stream = Some(StreamInbox {
                    ready: VecDeque::new(),
                    capacity,
                    max_stream_length: length,
                    received_length: 0,
                    finished: None,
                });
            }
            _ => return Err(self.fail(NetError::InvalidData, now)),
        }

        self.mode = header.mode;
        self.wire_mode = header.mode;
        self.data_kind = header.data_kind;
        self.data_id = header.data_id;
        trace!(
            transmission_id = self.id,
            mode = %self.mode,
            "receive transmission opened"
        );

        let mut gene = ReceiveGene::new(0);
        gene.set_recv(payload, header.data_control);
        let mut arrival = self.store(gene, now)?;
        arrival.stream_opened = self.stream.is_some();
        Ok(arrival)
    }

    /// Handle a gene after the first.
    ///
    /// Genes for a transmission whose first gene has not arrived are dropped without an ack;
    /// the sender recovers them through loss detection.
    pub(crate) fn following_gene(
        &mut self,
        header: &FollowingGeneHeader,
        payload: Bytes,
        now: Mics,
    ) -> NetResult<Arrival> {
        match self.mode {
            TransmissionMode::Initial => return Ok(Arrival::default()),
            TransmissionMode::Disposed | TransmissionMode::StreamCompleted => {
                return Ok(self.duplicate());
            }
            _ => {}
        }

        let position = header.position;
        if position < self.genes.base() {
            return Ok(self.duplicate_position(position));
        }
        if !self.genes.accepts(position)
            || (self.mode != TransmissionMode::Stream && position >= self.total_gene)
        {
            trace!(transmission_id = self.id, position, "gene outside the window");
            return Ok(Arrival::default());
        }
        if self.genes.get(position).is_some() {
            return Ok(self.duplicate_position(position));
        }

        let mut gene = ReceiveGene::new(position);
        gene.set_recv(payload, header.data_control);
        self.store(gene, now)
    }

    fn duplicate_position(&self, position: i32) -> Arrival {
        match self.mode {
            TransmissionMode::Burst => Arrival::default(),
            _ => Arrival::ack(AckKind::Block(Some(position))),
        }
    }

    fn store(&mut self, gene: ReceiveGene, now: Mics) -> NetResult<Arrival> {
        let position = gene.position();
        let length = gene
            .payload()
            .map_or(0, |payload| i64::try_from(payload.len()).unwrap_or(i64::MAX));
        if self
            .stream
            .as_ref()
            .is_some_and(|stream| stream.received_length + length > stream.max_stream_length)
        {
            return Err(self.fail(NetError::StreamLengthLimit, now));
        }
        if self.genes.insert(position, gene).is_err() {
            return Ok(self.duplicate_position(position));
        }
        if let Some(stream) = self.stream.as_mut() {
            stream.received_length += length;
        }

        match self.mode {
            TransmissionMode::Burst => Ok(self.progress_burst(now)),
            TransmissionMode::Block => Ok(self.progress_block(position, now)),
            TransmissionMode::Stream => Ok(self.progress_stream(position, now)),
            _ => Ok(Arrival::default()),
        }
    }

    fn progress_burst(&mut self, now: Mics) -> Arrival {
        if i32::try_from(self.genes.len()).unwrap_or(i32::MAX) < self.total_gene {
            return Arrival::default();
        }
        self.successive_received_position = self.total_gene;
        let mut arrival = Arrival::ack(AckKind::Burst);
        arrival.message = self.finish_message(now);
        arrival.completed = true;
        arrival
    }

    fn progress_block(&mut self, position: i32, now: Mics) -> Arrival {
        while self
            .genes
            .get(self.successive_received_position)
            .is_some()
        {
            self.successive_received_position += 1;
        }
        let mut arrival = Arrival::ack(AckKind::Block(Some(position)));
        if self.successive_received_position >= self.total_gene {
            arrival.message = self.finish_message(now);
            arrival.completed = true;
        }
        arrival
    }

    fn progress_stream(&mut self, position: i32, now: Mics) -> Arrival {
        let mut arrival = Arrival::ack(AckKind::Block(Some(position)));
        let Some(stream) = self.stream.as_mut() else {
            return arrival;
        };

        let before = self.successive_received_position;
        while let Some(gene) = self.genes.remove(self.successive_received_position) {
            self.successive_received_position += 1;
            let control = gene.control();
            stream.ready.push_back(gene.into_payload());
            if control.is_terminal() {
                stream.finished = Some(control);
                self.mode = TransmissionMode::StreamCompleted;
                self.completed_mics = Some(now);
                arrival.completed = true;
                break;
            }
        }
        self.genes.slide(self.successive_received_position);
        self.max_receive_position = stream_window_limit(
            self.successive_received_position,
            stream.ready.len(),
            stream.capacity,
        );
        if self.successive_received_position > before {
            self.notify.notify_one();
        }
        arrival
    }

    fn finish_message(&mut self, now: Mics) -> Option<Message> {
        let mut payloads = self.genes.drain();
        let payload = if payloads.len() == 1 {
            payloads.pop().map(ReceiveGene::into_payload).unwrap_or_default()
        } else {
            payloads.sort_unstable_by_key(ReceiveGene::position);
            let length = payloads
                .iter()
                .map(|gene| gene.payload().map_or(0, Bytes::len))
                .sum();
            let mut buffer = BytesMut::with_capacity(length);
            for gene in payloads {
                buffer.extend_from_slice(&gene.into_payload());
            }
            buffer.freeze()
        };

        self.mode = TransmissionMode::Disposed;
        self.completed_mics = Some(now);
        let message = Message::new(self.data_kind, self.data_id, payload);
        debug!(
            transmission_id = self.id,
            len = message.payload().len(),
            "message reassembled"
        );
        match self.waiter.take() {
            Some(waiter) => {
                let _ = waiter.send(Ok(message));
                None
            }
            None => Some(message),
        }
    }

    /// Take the next chunk of a stream.
    pub(crate) fn stream_read(&mut self, now: Mics) -> StreamRead {
        if let Some(error) = self.failure {
            return StreamRead::Failed(error);
        }
        let Some(stream) = self.stream.as_mut() else {
            return StreamRead::Failed(NetError::NoTransmission);
        };

        while let Some(data) = stream.ready.pop_front() {
            let limit = stream_window_limit(
                self.successive_received_position,
                stream.ready.len(),
                stream.capacity,
            );
            let window_opened =
                limit > self.max_receive_position && self.mode == TransmissionMode::Stream;
            self.max_receive_position = self.max_receive_position.max(limit);
            if !data.is_empty() {
                return StreamRead::Chunk {
                    data,
                    window_opened,
                };
            }
        }

        match stream.finished {
            Some(control) => {
                self.mode = TransmissionMode::Disposed;
                self.completed_mics.get_or_insert(now);
                if control == DataControl::Cancel {
                    StreamRead::Canceled
                } else {
                    StreamRead::Finished
                }
            }
            None => StreamRead::Pending,
        }
    }

    /// Abort the transmission, resolving any waiter with `error`.
    pub(crate) fn fail(&mut self, error: NetError, now: Mics) -> NetError {
        debug!(transmission_id = self.id, %error, "receive transmission failed");
        self.genes.clear();
        if let Some(waiter) = self.waiter.take() {
            let _ = waiter.send(Err(error));
        }
        if self.stream.is_some() && self.failure.is_none() {
            self.failure = Some(error);
        }
        self.mode = TransmissionMode::Disposed;
        self.completed_mics.get_or_insert(now);
        self.notify.notify_one();
        error
    }
}

fn stream_window_limit(successive: i32, unconsumed: usize, capacity: i32) -> i32 {
    let unconsumed = i32::try_from(unconsumed).unwrap_or(i32::MAX);
    successive.saturating_sub(unconsumed).saturating_add(capacity)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::MAX_GENE_LENGTH;

    fn first(mode: TransmissionMode, span: GeneSpan, control: DataControl) -> FirstGeneHeader {
        FirstGeneHeader {
            mode,
            transmission_id: 3,
            data_control: control,
            rtt_hint: 0,
            span,
            data_kind: 5,
            data_id: 6,
        }
    }

    fn following(position: i32, control: DataControl) -> FollowingGeneHeader {
        FollowingGeneHeader {
            transmission_id: 3,
            data_control: control,
            position,
        }
    }

    fn streaming_agreement() -> Agreement {
        Agreement {
            max_stream_length: 1 << 20,
            stream_buffer_size: u32::try_from(MAX_GENE_LENGTH * 2).unwrap(),
            ..Agreement::default()
        }
    }

    #[test]
    fn burst_completes_when_every_gene_arrived() {
        let mut transmission = ReceiveTransmission::new(3, 0);
        let header = first(TransmissionMode::Burst, GeneSpan::TotalGene(2), DataControl::Valid);
        let arrival = transmission
            .first_gene(&header, Bytes::from_static(b"ab"), &Agreement::default(), 0)
            .unwrap();
        assert_eq!(arrival.ack, None);

        let arrival = transmission
            .following_gene(&following(1, DataControl::Valid), Bytes::from_static(b"cd"), 1)
            .unwrap();
        assert_eq!(arrival.ack, Some(AckKind::Burst));
        let message = arrival.message.unwrap();
        assert_eq!(message.payload().as_ref(), b"abcd");
        assert_eq!(message.data_kind(), 5);

        let duplicate = transmission
            .following_gene(&following(1, DataControl::Valid), Bytes::from_static(b"cd"), 2)
            .unwrap();
        assert_eq!(duplicate.ack, Some(AckKind::Burst));
        assert!(duplicate.message.is_none());
    }

    #[test]
    fn block_reassembles_out_of_order() {
        let mut transmission = ReceiveTransmission::new(3, 0);
        let header = first(TransmissionMode::Block, GeneSpan::TotalGene(4), DataControl::Valid);
        transmission
            .first_gene(&header, Bytes::from_static(b"0"), &Agreement::default(), 0)
            .unwrap();
        for position in [3, 1] {
            let arrival = transmission
                .following_gene(
                    &following(position, DataControl::Valid),
                    Bytes::from(position.to_string()),
                    0,
                )
                .unwrap();
            assert_eq!(arrival.ack, Some(AckKind::Block(Some(position))));
        }
        assert_eq!(transmission.successive_received_position(), 2);
        assert_eq!(transmission.window_report(), Some((4, 2)));

        let arrival = transmission
            .following_gene(&following(2, DataControl::Valid), Bytes::from_static(b"2"), 0)
            .unwrap();
        assert!(arrival.completed);
        assert_eq!(arrival.message.unwrap().payload().as_ref(), b"0123");
        assert_eq!(transmission.window_report(), Some((4, 4)));
    }

    #[test]
    fn block_over_limit_is_rejected() {
        let mut transmission = ReceiveTransmission::new(3, 0);
        let agreement = Agreement {
            max_block_size: u32::try_from(MAX_GENE_LENGTH * 2).unwrap(),
            ..Agreement::default()
        };
        let header = first(TransmissionMode::Block, GeneSpan::TotalGene(3), DataControl::Valid);
        assert_eq!(
            transmission
                .first_gene(&header, Bytes::new(), &agreement, 0)
                .unwrap_err(),
            NetError::BlockSizeLimit
        );
        assert_eq!(transmission.mode(), TransmissionMode::Disposed);
    }

    #[test]
    fn following_before_first_is_dropped() {
        let mut transmission = ReceiveTransmission::new(3, 0);
        let arrival = transmission
            .following_gene(&following(1, DataControl::Valid), Bytes::from_static(b"x"), 0)
            .unwrap();
        assert!(arrival.ack.is_none());
    }

    #[test]
    fn solicited_message_goes_to_the_waiter() {
        let (tx, mut rx) = oneshot::channel();
        let mut transmission = ReceiveTransmission::solicited(3, tx, 0);
        let header = first(TransmissionMode::Burst, GeneSpan::TotalGene(1), DataControl::Valid);
        let arrival = transmission
            .first_gene(&header, Bytes::from_static(b"pong"), &Agreement::default(), 0)
            .unwrap();
        assert!(arrival.message.is_none());
        assert_eq!(rx.try_recv().unwrap().unwrap().payload().as_ref(), b"pong");
    }

    #[test]
    fn stream_window_follows_consumption() {
        let mut transmission = ReceiveTransmission::new(3, 0);
        let header = first(
            TransmissionMode::Stream,
            GeneSpan::MaxStreamLength(1 << 20),
            DataControl::Valid,
        );
        let arrival = transmission
            .first_gene(&header, Bytes::from_static(b"a"), &streaming_agreement(), 0)
            .unwrap();
        assert!(arrival.stream_opened);
        assert_eq!(transmission.window_report(), Some((2, 1)));

        transmission
            .following_gene(&following(1, DataControl::Valid), Bytes::from_static(b"b"), 0)
            .unwrap();
        assert_eq!(transmission.window_report(), Some((2, 2)));

        assert_eq!(
            transmission.stream_read(0),
            StreamRead::Chunk {
                data: Bytes::from_static(b"a"),
                window_opened: true
            }
        );
        assert_eq!(transmission.window_report(), Some((3, 2)));

        transmission
            .following_gene(&following(2, DataControl::Complete), Bytes::new(), 0)
            .unwrap();
        assert_eq!(transmission.mode(), TransmissionMode::StreamCompleted);
        assert!(matches!(transmission.stream_read(0), StreamRead::Chunk { .. }));
        assert_eq!(transmission.stream_read(0), StreamRead::Finished);
        assert_eq!(transmission.mode(), TransmissionMode::Disposed);
    }

    #[test]
    fn stream_length_limit_fails_the_reader() {
        let mut transmission = ReceiveTransmission::new(3, 0);
        let header = first(
            TransmissionMode::Stream,
            GeneSpan::MaxStreamLength(2),
            DataControl::Valid,
        );
        transmission
            .first_gene(&header, Bytes::from_static(b"ab"), &streaming_agreement(), 0)
            .unwrap();
        let error = transmission
            .following_gene(&following(1, DataControl::Valid), Bytes::from_static(b"c"), 0)
            .unwrap_err();
        assert_eq!(error, NetError::StreamLengthLimit);
        assert_eq!(
            transmission.stream_read(0),
            StreamRead::Failed(NetError::StreamLengthLimit)
        );
    }

    #[test]
    fn disposed_transmission_expires_after_retention() {
        let mut transmission = ReceiveTransmission::new(3, 0);
        let header = first(TransmissionMode::Burst, GeneSpan::TotalGene(1), DataControl::Valid);
        transmission
            .first_gene(&header, Bytes::new(), &Agreement::default(), 100)
            .unwrap();
        assert!(!transmission.is_expired(150, 100));
        assert!(transmission.is_expired(201, 100));
    }

    mod properties {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn successive_position_only_grows(
                order in Just((1..24).collect::<Vec<i32>>()).prop_shuffle(),
            ) {
                let mut transmission = ReceiveTransmission::new(3, 0);
                let header =
                    first(TransmissionMode::Block, GeneSpan::TotalGene(24), DataControl::Valid);
                transmission
                    .first_gene(&header, Bytes::from(vec![0u8]), &Agreement::default(), 0)
                    .unwrap();

                let mut last = transmission.successive_received_position();
                let mut message = None;
                for position in order.iter().chain(order.iter()) {
                    let payload = Bytes::from(vec![u8::try_from(*position).unwrap()]);
                    let arrival = transmission
                        .following_gene(&following(*position, DataControl::Valid), payload, 0)
                        .unwrap();
                    let successive = transmission.successive_received_position();
                    prop_assert!(successive >= last);
                    last = successive;
                    if let Some(received) = arrival.message {
                        prop_assert!(message.is_none());
                        message = Some(received);
                    }
                }

                let expected: Vec<u8> = (0..24).collect();
                let message = message.unwrap();
                prop_assert_eq!(message.payload().as_ref(), expected.as_slice());
            }
        }
    }
}
