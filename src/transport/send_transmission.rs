//! Outbound transmission state machine.

use std::collections::VecDeque;
use std::sync::Arc;

use tokio::sync::{Notify, oneshot};
use tracing::{debug, trace};

use super::ack::AckEntry;
use super::clock::Mics;
use super::congestion::CongestionControl;
use super::gene::{Outlet, SendGene, SendGeneState};
use super::packet_crypto::Sealer;
use super::window::GeneStore;
use crate::protocol::{
    BURST_GENE_LIMIT, DataControl, FirstGeneHeader, FollowingGeneHeader, GeneSpan,
    MAX_GENE_LENGTH, NetError, NetResult, TransmissionMode, gene_count,
};

/// Positions beyond the pre-ack window base after which earlier gaps count as lost.
pub(crate) const LOSS_PACKET_THRESHOLD: i32 = 3;

/// Resolves the caller waiting for a send to finish.
pub(crate) type Completion = oneshot::Sender<NetResult<()>>;

/// Genes sealed for a burst or block, ready to be installed.
#[derive(Debug)]
pub(crate) struct SealedBlock {
    mode: TransmissionMode,
    genes: GeneStore<SendGene>,
    total_gene: i32,
}

/// Outcome of offering a stream gene.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum StreamPush {
    Pushed,
    /// `receiver_window` is set when the peer's window, not local buffering, is exhausted.
    Blocked { receiver_window: bool },
}

/// Effect of one ack entry.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub(crate) struct AckProgress {
    pub acked: usize,
    pub completed: bool,
    pub lost: bool,
    pub window_advanced: bool,
    pub rtt_sample: Option<Mics>,
}

#[derive(Debug)]
struct StreamSend {
    max_stream_length: i64,
    sent_length: i64,
    data_kind: u32,
    data_id: u64,
    finished: bool,
    notify: Arc<Notify>,
}

#[derive(Debug)]
pub(crate) struct SendTransmission {
    id: u32,
    mode: TransmissionMode,
    genes: GeneStore<SendGene>,
    total_gene: i32,
    gene_serial_max: i32,
    max_receive_position: i32,
    send_cursor: i32,
    resend: VecDeque<i32>,
    last_ack_mics: Mics,
    last_loss_position: i32,
    last_loss_mics: Mics,
    completion: Option<Completion>,
    stream: Option<StreamSend>,
    queued: bool,
}

impl SendTransmission {
    pub(crate) fn new(id: u32, completion: Completion, now: Mics) -> Self {
        Self {
            id,
            mode: TransmissionMode::Initial,
            genes: GeneStore::burst(),
            total_gene: 0,
            gene_serial_max: 0,
            max_receive_position: 0,
            send_cursor: 0,
            resend: VecDeque::new(),
            last_ack_mics: now,
            last_loss_position: 0,
            last_loss_mics: now,
            completion: Some(completion),
            stream: None,
            queued: false,
        }
    }

    pub(crate) fn id(&self) -> u32 {
        self.id
    }

    pub(crate) fn mode(&self) -> TransmissionMode {
        self.mode
    }

    pub(crate) fn gene_serial_max(&self) -> i32 {
        self.gene_serial_max
    }

    pub(crate) fn max_receive_position(&self) -> i32 {
        self.max_receive_position
    }

    pub(crate) fn last_ack_mics(&self) -> Mics {
        self.last_ack_mics
    }

    pub(crate) fn is_queued(&self) -> bool {
        self.queued
    }

    pub(crate) fn set_queued(&mut self, queued: bool) {
        self.queued = queued;
    }

    /// Slice `payload` into sealed genes. Runs outside the connection lock.
    pub(crate) fn seal_block(
        transmission_id: u32,
        sealer: Sealer<'_>,
        data_kind: u32,
        data_id: u64,
        payload: &[u8],
        rtt_hint: i32,
    ) -> NetResult<SealedBlock> {
        let count = gene_count(payload.len());
        let total_gene = i32::try_from(count).map_err(|_| NetError::BlockSizeLimit)?;
        let (mode, mut genes) = if count <= BURST_GENE_LIMIT {
            (TransmissionMode::Burst, GeneStore::burst())
        } else {
            (TransmissionMode::Block, GeneStore::window(count))
        };

        let empty: &[u8] = &[];
        let chunks: Box<dyn Iterator<Item = &[u8]>> = if payload.is_empty() {
            Box::new(std::iter::once(empty))
        } else {
            Box::new(payload.chunks(MAX_GENE_LENGTH))
        };

        for (chunk, position) in chunks.zip(0..) {
            let packet = if position == 0 {
                let header = FirstGeneHeader {
                    mode,
                    transmission_id,
                    data_control: DataControl::Valid,
                    rtt_hint,
                    span: GeneSpan::TotalGene(total_gene),
                    data_kind,
                    data_id,
                };
                sealer.seal(|out| {
                    header.encode(out);
                    out.extend_from_slice(chunk);
                })?
            } else {
                let header = FollowingGeneHeader {
                    transmission_id,
                    data_control: DataControl::Valid,
                    position,
                };
                sealer.seal(|out| {
                    header.encode(out);
                    out.extend_from_slice(chunk);
                })?
            };

            let mut gene = SendGene::new(position);
            gene.set_send(packet);
            genes
                .insert(position, gene)
                .map_err(|_| NetError::InvalidData)?;
        }

        Ok(SealedBlock {
            mode,
            genes,
            total_gene,
        })
    }

    pub(crate) fn install_block(&mut self, block: SealedBlock) {
        self.mode = block.mode;
        self.genes = block.genes;
        self.total_gene = block.total_gene;
        self.gene_serial_max = block.total_gene;
        self.max_receive_position = block.total_gene;
    }

    pub(crate) fn open_stream(
        &mut self,
        max_stream_length: i64,
        window_genes: i32,
        data_kind: u32,
        data_id: u64,
        notify: Arc<Notify>,
    ) {
        self.mode = TransmissionMode::Stream;
        self.genes = GeneStore::window(usize::try_from(window_genes).unwrap_or(1));
        self.max_receive_position = window_genes;
        self.stream = Some(StreamSend {
            max_stream_length,
            sent_length: 0,
            data_kind,
            data_id,
            finished: false,
            notify,
        });
    }

    /// Seal and store the next stream gene if both windows allow it.
    pub(crate) fn push_stream_gene(
        &mut self,
        sealer: Sealer<'_>,
        chunk: &[u8],
        control: DataControl,
        rtt_hint: i32,
    ) -> NetResult<StreamPush> {
        debug_assert!(chunk.len() <= MAX_GENE_LENGTH);
        if self.mode != TransmissionMode::Stream {
            return Err(NetError::Closed);
        }
        let Some(stream) = self.stream.as_mut() else {
            return Err(NetError::InvalidData);
        };
        if stream.finished {
            return Err(NetError::Closed);
        }
        let length = i64::try_from(chunk.len()).unwrap_or(i64::MAX);
        if stream.sent_length + length > stream.max_stream_length {
            return Err(NetError::StreamLengthLimit);
        }

        let position = self.gene_serial_max;
        if position >= self.max_receive_position {
            return Ok(StreamPush::Blocked {
                receiver_window: true,
            });
        }
        if !self.genes.accepts(position) {
            return Ok(StreamPush::Blocked {
                receiver_window: false,
            });
        }

        let transmission_id = self.id;
        let packet = if position == 0 {
            let header = FirstGeneHeader {
                mode: TransmissionMode::Stream,
                transmission_id,
                data_control: control,
                rtt_hint,
                span: GeneSpan::MaxStreamLength(stream.max_stream_length),
                data_kind: stream.data_kind,
                data_id: stream.data_id,
            };
            sealer.seal(|out| {
                header.encode(out);
                out.extend_from_slice(chunk);
            })?
        } else {
            let header = FollowingGeneHeader {
                transmission_id,
                data_control: control,
                position,
            };
            sealer.seal(|out| {
                header.encode(out);
                out.extend_from_slice(chunk);
            })?
        };

        let mut gene = SendGene::new(position);
        gene.set_send(packet);
        self.genes
            .insert(position, gene)
            .map_err(|_| NetError::InvalidData)?;

        stream.sent_length += length;
        stream.finished = control.is_terminal();
        self.gene_serial_max += 1;
        self.total_gene = self.gene_serial_max;
        Ok(StreamPush::Pushed)
    }

    pub(crate) fn has_pending(&self) -> bool {
        !self.resend.is_empty() || self.send_cursor < self.gene_serial_max
    }

    /// Sent genes still waiting for an ack.
    pub(crate) fn has_unacked(&self) -> bool {
        self.genes.iter().any(|(_, gene)| gene.send_count() > 0)
    }

    /// Send one gene: a loss-detected one first, otherwise the next unsent one.
    pub(crate) fn send_next(&mut self, outlet: &Outlet<'_>, now: Mics) -> NetResult<bool> {
        while let Some(position) = self.resend.pop_front() {
            if let Some(gene) = self.genes.get_mut(position) {
                if gene.state() == SendGeneState::LossDetected {
                    gene.send(self.id, outlet, now)?;
                    return Ok(true);
                }
            }
        }

        while self.send_cursor < self.gene_serial_max {
            let position = self.send_cursor;
            self.send_cursor += 1;
            if let Some(gene) = self.genes.get_mut(position) {
                gene.send(self.id, outlet, now)?;
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Apply one ack entry. Idempotent: positions already acknowledged are skipped.
    pub(crate) fn process_ack(
        &mut self,
        entry: &AckEntry,
        now: Mics,
        congestion: &dyn CongestionControl,
        minimum_rtt: Mics,
        loss_cooldown: Mics,
    ) -> AckProgress {
        let mut progress = AckProgress::default();
        match entry {
            AckEntry::Burst { .. } => {
                if self.mode != TransmissionMode::Burst {
                    return progress;
                }
                for position in 0..3 {
                    self.ack_gene(position, now, congestion, &mut progress);
                }
            }
            AckEntry::Block {
                max_receive_position,
                successive_received_position,
                ranges,
                ..
            } => {
                if !matches!(self.mode, TransmissionMode::Block | TransmissionMode::Stream) {
                    return progress;
                }
                let base_before = self.genes.base();
                let upper = self.gene_serial_max;

                if *max_receive_position > self.max_receive_position {
                    self.max_receive_position = *max_receive_position;
                    progress.window_advanced = true;
                }
                for position in base_before..(*successive_received_position).min(upper) {
                    self.ack_gene(position, now, congestion, &mut progress);
                }
                for range in ranges {
                    for position in range.start().max(base_before)..range.end().min(upper) {
                        self.ack_gene(position, now, congestion, &mut progress);
                    }
                }
                self.genes.slide(upper);
                if self.genes.base() > base_before {
                    progress.window_advanced = true;
                }

                if now - self.last_loss_mics > loss_cooldown {
                    self.last_loss_position = 0;
                }
                for range in ranges {
                    if range.end() - base_before <= LOSS_PACKET_THRESHOLD {
                        continue;
                    }
                    let from = self.last_loss_position.max(self.genes.base());
                    for position in from..range.start().min(upper) {
                        let Some(gene) = self.genes.get_mut(position) else {
                            continue;
                        };
                        if gene.can_resend(now, minimum_rtt)
                            && gene.mark_lost(self.id, congestion, now)
                        {
                            debug!(
                                transmission_id = self.id,
                                position, "gene loss detected"
                            );
                            self.resend.push_back(position);
                            progress.lost = true;
                        }
                    }
                    self.last_loss_position = self.last_loss_position.max(range.start());
                    self.last_loss_mics = now;
                }
            }
        }

        if progress.acked > 0 {
            self.last_ack_mics = now;
        }
        if progress.window_advanced {
            if let Some(stream) = &self.stream {
                stream.notify.notify_one();
            }
        }
        if self.is_finished() {
            self.complete();
            progress.completed = true;
        }
        progress
    }

    fn ack_gene(
        &mut self,
        position: i32,
        now: Mics,
        congestion: &dyn CongestionControl,
        progress: &mut AckProgress,
    ) {
        let Some(gene) = self.genes.remove(position) else {
            return;
        };
        if gene.send_count() == 1 {
            let sample = now - gene.sent_mics();
            progress.rtt_sample = Some(progress.rtt_sample.map_or(sample, |best| best.min(sample)));
        }
        progress.acked += 1;
        gene.dispose(self.id, true, congestion, now);
    }

    fn is_finished(&self) -> bool {
        if !self.genes.is_empty() {
            return false;
        }
        match self.mode {
            TransmissionMode::Burst | TransmissionMode::Block => {
                self.gene_serial_max == self.total_gene && self.total_gene > 0
            }
            TransmissionMode::Stream => self.stream.as_ref().is_some_and(|stream| stream.finished),
            _ => false,
        }
    }

    fn complete(&mut self) {
        trace!(transmission_id = self.id, mode = %self.mode, "send transmission completed");
        if self.mode == TransmissionMode::Stream {
            self.mode = TransmissionMode::StreamCompleted;
        }
        if let Some(completion) = self.completion.take() {
            let _ = completion.send(Ok(()));
        }
        self.mode = TransmissionMode::Disposed;
        if let Some(stream) = &self.stream {
            stream.notify.notify_one();
        }
    }

    /// Apply the receive window reported by a knock response.
    pub(crate) fn update_window(&mut self, max_receive_position: i32) -> bool {
        if max_receive_position > self.max_receive_position {
            self.max_receive_position = max_receive_position;
            if let Some(stream) = &self.stream {
                stream.notify.notify_one();
            }
            return true;
        }
        false
    }

    /// Declare genes lost whose last send is older than `rto`.
    pub(crate) fn mark_timed_out(
        &mut self,
        now: Mics,
        rto: Mics,
        minimum_rtt: Mics,
        congestion: &dyn CongestionControl,
    ) -> bool {
        let mut any = false;
        for (position, gene) in self.genes.iter_mut() {
            if gene.is_in_flight()
                && now - gene.sent_mics() > rto
                && gene.can_resend(now, minimum_rtt)
                && gene.mark_lost(self.id, congestion, now)
            {
                self.resend.push_back(position);
                any = true;
            }
        }
        if any {
            debug!(transmission_id = self.id, "retransmission timeout");
        }
        any
    }

    /// Release every gene and resolve a pending waiter with `result`.
    pub(crate) fn dispose(
        &mut self,
        result: NetResult<()>,
        congestion: &dyn CongestionControl,
        now: Mics,
    ) {
        for gene in self.genes.drain() {
            gene.dispose(self.id, false, congestion, now);
        }
        self.resend.clear();
        if let Some(completion) = self.completion.take() {
            let _ = completion.send(result);
        }
        self.mode = TransmissionMode::Disposed;
        if let Some(stream) = &self.stream {
            stream.notify.notify_one();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::ack::AckRange;
    use crate::transport::congestion::NoCongestion;
    use crate::transport::testing::Fixture;

    fn block(
        fixture: &Fixture,
        length: usize,
    ) -> (SendTransmission, oneshot::Receiver<NetResult<()>>) {
        let (tx, rx) = oneshot::channel();
        let mut transmission = SendTransmission::new(42, tx, 0);
        let payload = vec![7u8; length];
        let sealed =
            SendTransmission::seal_block(42, fixture.sealer(), 1, 2, &payload, 0).unwrap();
        transmission.install_block(sealed);
        (transmission, rx)
    }

    fn block_ack(successive: i32, ranges: &[(i32, i32)]) -> AckEntry {
        AckEntry::Block {
            transmission_id: 42,
            max_receive_position: 100,
            successive_received_position: successive,
            ranges: ranges
                .iter()
                .map(|(start, end)| AckRange::new(*start, *end).unwrap())
                .collect(),
        }
    }

    fn send_all(fixture: &Fixture, transmission: &mut SendTransmission, now: Mics) -> usize {
        let outlet = fixture.outlet(&NoCongestion);
        let mut sent = 0;
        while transmission.send_next(&outlet, now).unwrap() {
            sent += 1;
        }
        sent
    }

    #[test]
    fn small_payloads_use_burst_mode() {
        let fixture = Fixture::new();
        let (transmission, _) = block(&fixture, 0);
        assert_eq!(transmission.mode(), TransmissionMode::Burst);
        assert_eq!(transmission.gene_serial_max(), 1);

        let (transmission, _) = block(&fixture, 3 * MAX_GENE_LENGTH);
        assert_eq!(transmission.mode(), TransmissionMode::Burst);
        let (transmission, _) = block(&fixture, 3 * MAX_GENE_LENGTH + 1);
        assert_eq!(transmission.mode(), TransmissionMode::Block);
        assert_eq!(transmission.gene_serial_max(), 4);
    }

    #[test]
    fn duplicate_burst_ack_resolves_once() {
        let fixture = Fixture::new();
        let (mut transmission, mut rx) = block(&fixture, 10);
        assert_eq!(send_all(&fixture, &mut transmission, 0), 1);

        let ack = AckEntry::Burst { transmission_id: 42 };
        let first = transmission.process_ack(&ack, 1_000, &NoCongestion, 0, 0);
        assert!(first.completed);
        assert_eq!(first.rtt_sample, Some(1_000));
        assert_eq!(rx.try_recv().unwrap(), Ok(()));

        let second = transmission.process_ack(&ack, 2_000, &NoCongestion, 0, 0);
        assert_eq!(second, AckProgress::default());
    }

    #[test]
    fn gap_beyond_threshold_marks_loss_once() {
        let fixture = Fixture::new();
        let (mut transmission, _) = block(&fixture, 5 * MAX_GENE_LENGTH);
        assert_eq!(send_all(&fixture, &mut transmission, 0), 5);

        let ack = block_ack(3, &[(4, 5)]);
        let progress = transmission.process_ack(&ack, 1_000, &NoCongestion, 0, 50_000);
        assert!(progress.lost);
        assert_eq!(progress.acked, 4);
        assert_eq!(transmission.resend.iter().copied().collect::<Vec<_>>(), vec![3]);

        let repeated = transmission.process_ack(&ack, 1_100, &NoCongestion, 0, 50_000);
        assert!(!repeated.lost);
        assert_eq!(transmission.resend.len(), 1);

        assert_eq!(send_all(&fixture, &mut transmission, 1_200), 1);
        let done = transmission.process_ack(&block_ack(5, &[]), 2_000, &NoCongestion, 0, 50_000);
        assert!(done.completed);
        assert_eq!(done.rtt_sample, None);
    }

    #[test]
    fn gap_within_threshold_is_not_loss() {
        let fixture = Fixture::new();
        let (mut transmission, _) = block(&fixture, 5 * MAX_GENE_LENGTH);
        send_all(&fixture, &mut transmission, 0);

        let progress =
            transmission.process_ack(&block_ack(0, &[(2, 3)]), 1_000, &NoCongestion, 0, 0);
        assert!(!progress.lost);
        assert_eq!(progress.acked, 1);
    }

    #[test]
    fn timeout_marks_in_flight_genes() {
        let fixture = Fixture::new();
        let (mut transmission, _) = block(&fixture, 4 * MAX_GENE_LENGTH);
        send_all(&fixture, &mut transmission, 0);
        assert!(!transmission.has_pending());
        assert!(transmission.has_unacked());

        assert!(!transmission.mark_timed_out(100, 500, 0, &NoCongestion));
        assert!(transmission.mark_timed_out(1_000, 500, 0, &NoCongestion));
        assert!(transmission.has_pending());
        assert_eq!(send_all(&fixture, &mut transmission, 1_100), 4);
    }

    #[test]
    fn dispose_resolves_waiter_with_error() {
        let fixture = Fixture::new();
        let (mut transmission, mut rx) = block(&fixture, 10);
        transmission.dispose(Err(NetError::Closed), &NoCongestion, 0);
        assert_eq!(rx.try_recv().unwrap(), Err(NetError::Closed));
        assert_eq!(transmission.mode(), TransmissionMode::Disposed);
    }

    #[test]
    fn stream_respects_receiver_window() {
        let fixture = Fixture::new();
        let (tx, mut rx) = oneshot::channel();
        let mut transmission = SendTransmission::new(9, tx, 0);
        transmission.open_stream(1 << 20, 2, 0, 0, Arc::new(Notify::new()));

        let sealer = fixture.sealer();
        assert_eq!(
            transmission.push_stream_gene(sealer, b"a", DataControl::Valid, 0),
            Ok(StreamPush::Pushed)
        );
        assert_eq!(
            transmission.push_stream_gene(sealer, b"b", DataControl::Valid, 0),
            Ok(StreamPush::Pushed)
        );
        assert_eq!(
            transmission.push_stream_gene(sealer, b"c", DataControl::Valid, 0),
            Ok(StreamPush::Blocked {
                receiver_window: true
            })
        );

        send_all(&fixture, &mut transmission, 0);
        let ack = AckEntry::Block {
            transmission_id: 9,
            max_receive_position: 4,
            successive_received_position: 2,
            ranges: Vec::new(),
        };
        let progress = transmission.process_ack(&ack, 10, &NoCongestion, 0, 0);
        assert!(progress.window_advanced);
        assert!(!progress.completed);

        assert_eq!(
            transmission.push_stream_gene(sealer, b"", DataControl::Complete, 0),
            Ok(StreamPush::Pushed)
        );
        assert_eq!(
            transmission.push_stream_gene(sealer, b"d", DataControl::Valid, 0),
            Err(NetError::Closed)
        );
        send_all(&fixture, &mut transmission, 20);
        let ack = AckEntry::Block {
            transmission_id: 9,
            max_receive_position: 5,
            successive_received_position: 3,
            ranges: Vec::new(),
        };
        assert!(transmission.process_ack(&ack, 30, &NoCongestion, 0, 0).completed);
        assert_eq!(rx.try_recv().unwrap(), Ok(()));
    }

    #[test]
    fn stream_length_is_enforced() {
        let fixture = Fixture::new();
        let (tx, _rx) = oneshot::channel();
        let mut transmission = SendTransmission::new(9, tx, 0);
        transmission.open_stream(3, 4, 0, 0, Arc::new(Notify::new()));
        assert_eq!(
            transmission.push_stream_gene(fixture.sealer(), b"abcd", DataControl::Valid, 0),
            Err(NetError::StreamLengthLimit)
        );
    }

    mod properties {
        use super::*;
        use crate::protocol::{FrameType, read_frame_type};
        use proptest::prelude::*;

        proptest! {
            #![proptest_config(ProptestConfig::with_cases(48))]

            #[test]
            fn genes_split_payload_evenly(length in 0usize..8 * MAX_GENE_LENGTH + 17) {
                let fixture = Fixture::new();
                let (mut transmission, _) = block(&fixture, length);
                let count = gene_count(length);
                prop_assert_eq!(send_all(&fixture, &mut transmission, 0), count);

                let frames = fixture.sent_frames();
                prop_assert_eq!(frames.len(), count);
                let mut total = 0;
                for (index, frame) in frames.iter().enumerate() {
                    let mut buf = &frame[..];
                    match read_frame_type(&mut buf).unwrap() {
                        FrameType::FirstGene => {
                            prop_assert_eq!(index, 0);
                            FirstGeneHeader::decode(&mut buf).unwrap();
                        }
                        FrameType::FollowingGene => {
                            let header = FollowingGeneHeader::decode(&mut buf).unwrap();
                            prop_assert_eq!(usize::try_from(header.position).unwrap(), index);
                        }
                        other => prop_assert!(false, "unexpected frame {other:?}"),
                    }
                    let expected = if index + 1 < count {
                        MAX_GENE_LENGTH
                    } else {
                        length - MAX_GENE_LENGTH * (count - 1)
                    };
                    prop_assert_eq!(buf.len(), expected);
                    total += buf.len();
                }
                prop_assert_eq!(total, length);
            }
        }
    }
}
