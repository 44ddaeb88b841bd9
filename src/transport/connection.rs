//! Connections: per-peer transmission state behind the client and server handles.

use std::collections::hash_map::Entry;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use bytes::{BufMut, Bytes};
use parking_lot::Mutex;
use rand::Rng;
use tokio::sync::{Notify, oneshot};
use tokio::time::Instant;
use tracing::{debug, info, instrument, trace, warn};

use super::ack::decode_ack_entries;
use super::ack_buffer::{AckKey, AckTarget};
use super::agreement::{Agreement, AgreementResponseFrame, AgreementUpdateFrame};
use super::clock::{Mics, now_mics, to_duration};
use super::congestion::{CongestionControl, CubicCongestion};
use super::embryo::Embryo;
use super::gene::{DeliveryStats, Outlet};
use super::net::PacketLink;
use super::packet_crypto::{NonceSpace, PacketCipher, Sealer};
use super::receive_transmission::{AckKind, Arrival, MessageWaiter, ReceiveTransmission, StreamRead};
use super::rtt::{MIN_RTT_MICS, RttStats};
use super::scheduler::{Schedulable, SendOutcome};
use super::send_transmission::{SendTransmission, StreamPush};
use super::stream::{ReceiveStream, SendStream};
use super::terminal::{Incoming, IncomingMessage, IncomingStream, TerminalContext};
use crate::protocol::{
    ConnectionState, DataControl, FirstGeneHeader, FollowingGeneHeader, FrameError, FrameType,
    KnockFrame, KnockResponseFrame, Message, NetError, NetResult, TransmissionMode, gene_count,
    read_frame_type,
};

/// Which side of the handshake a connection object plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Role {
    Client,
    Server,
}

impl Role {
    const fn flip(self) -> Self {
        match self {
            Self::Client => Self::Server,
            Self::Server => Self::Client,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Lifecycle {
    state: ConnectionState,
    closed_mics: Mics,
}

#[derive(Default)]
struct SendSide {
    transmissions: HashMap<u32, SendTransmission>,
    queue: VecDeque<u32>,
}

impl SendSide {
    fn enqueue(&mut self, transmission_id: u32) {
        if let Some(transmission) = self.transmissions.get_mut(&transmission_id) {
            if !transmission.is_queued() && transmission.has_pending() {
                transmission.set_queued(true);
                self.queue.push_back(transmission_id);
            }
        }
    }

    fn active(&self) -> usize {
        self.transmissions
            .values()
            .filter(|transmission| transmission.mode() != TransmissionMode::Disposed)
            .count()
    }
}

/// Agreement update waiting for the peer's verdict.
struct PendingAgreement {
    target: Agreement,
    reply: oneshot::Sender<bool>,
}

/// Everything needed to build a connection object.
pub(crate) struct ConnectionSeed {
    pub connection_id: u64,
    pub embryo: Embryo,
    pub agreement: Agreement,
    pub endpoint: SocketAddr,
    pub relay_hop_count: u8,
    /// The side that prepared the original client connection.
    pub initiator: bool,
    /// Nonce counter of this connection's sealer.
    pub nonce: Arc<AtomicU64>,
    /// Nonce counter handed to every twin built from this connection.
    pub twin_nonce: Arc<AtomicU64>,
}

impl ConnectionSeed {
    /// Fresh nonce counters for a connection of `role` and its future twins.
    pub(crate) fn nonce_counters(initiator: bool, role: Role) -> (Arc<AtomicU64>, Arc<AtomicU64>) {
        let space = |role: Role| NonceSpace {
            initiator,
            response: role == Role::Server,
        };
        (space(role).counter(), space(role.flip()).counter())
    }
}

/// Shared state of one logical connection.
pub(crate) struct Connection {
    context: Arc<TerminalContext>,
    role: Role,
    connection_id: u64,
    initiator: bool,
    embryo: Embryo,
    link: PacketLink,
    cipher: PacketCipher,
    twin_nonce: Arc<AtomicU64>,
    agreement: Mutex<Agreement>,
    agreement_serial: AtomicU32,
    agreement_updates: Mutex<HashMap<u32, PendingAgreement>>,
    lifecycle: Mutex<Lifecycle>,
    last_event_mics: AtomicI64,
    last_receive_mics: AtomicI64,
    rtt: Mutex<RttStats>,
    sends: Mutex<SendSide>,
    receives: Mutex<HashMap<u32, ReceiveTransmission>>,
    congestion: Mutex<Option<Arc<CubicCongestion>>>,
    in_send_list: AtomicBool,
    stats: DeliveryStats,
    peer: Mutex<Option<Weak<Connection>>>,
}

impl Connection {
    pub(crate) fn new(
        context: Arc<TerminalContext>,
        role: Role,
        seed: ConnectionSeed,
        now: Mics,
    ) -> Arc<Self> {
        let link = PacketLink::new(
            seed.endpoint,
            seed.relay_hop_count,
            context.sender.clone(),
            context.relay.clone(),
            context.pool.clone(),
        );
        let cipher = PacketCipher::with_counter(
            seed.connection_id,
            seed.embryo.clone(),
            NonceSpace {
                initiator: seed.initiator,
                response: role == Role::Server,
            },
            seed.nonce,
        );
        context.metrics.record_connection_open();
        Arc::new(Self {
            context,
            role,
            connection_id: seed.connection_id,
            initiator: seed.initiator,
            embryo: seed.embryo,
            link,
            cipher,
            twin_nonce: seed.twin_nonce,
            agreement: Mutex::new(seed.agreement),
            agreement_serial: AtomicU32::new(0),
            agreement_updates: Mutex::new(HashMap::new()),
            lifecycle: Mutex::new(Lifecycle {
                state: ConnectionState::Open,
                closed_mics: 0,
            }),
            last_event_mics: AtomicI64::new(now),
            last_receive_mics: AtomicI64::new(now),
            rtt: Mutex::new(RttStats::new()),
            sends: Mutex::new(SendSide::default()),
            receives: Mutex::new(HashMap::new()),
            congestion: Mutex::new(None),
            in_send_list: AtomicBool::new(false),
            stats: DeliveryStats::default(),
            peer: Mutex::new(None),
        })
    }

    pub(crate) fn connection_id(&self) -> u64 {
        self.connection_id
    }

    pub(crate) fn role(&self) -> Role {
        self.role
    }

    pub(crate) fn endpoint(&self) -> SocketAddr {
        self.link.endpoint()
    }

    pub(crate) fn relay_hop_count(&self) -> u8 {
        self.link.relay_hop_count()
    }

    pub(crate) fn salt(&self) -> u32 {
        self.embryo.salt()
    }

    pub(crate) fn state(&self) -> ConnectionState {
        self.lifecycle.lock().state
    }

    pub(crate) fn is_open(&self) -> bool {
        self.state() == ConnectionState::Open
    }

    pub(crate) fn agreement(&self) -> Agreement {
        *self.agreement.lock()
    }

    pub(crate) fn rtt(&self) -> RttStats {
        *self.rtt.lock()
    }

    pub(crate) fn stats(&self) -> &DeliveryStats {
        &self.stats
    }

    pub(crate) fn default_timeout(&self) -> Duration {
        self.context.config.default_timeout
    }

    pub(crate) fn has_congestion_control(&self) -> bool {
        self.congestion.lock().is_some()
    }

    fn ensure_open(&self) -> NetResult<()> {
        if self.is_open() {
            Ok(())
        } else {
            Err(NetError::Closed)
        }
    }

    fn touch(&self, now: Mics) {
        self.last_event_mics.fetch_max(now, Ordering::Relaxed);
    }

    fn sealer(&self) -> Sealer<'_> {
        Sealer {
            cipher: &self.cipher,
            pool: &self.context.pool,
        }
    }

    fn retransmission_timeout(&self) -> Mics {
        let floor = self.context.config.ack_delay_mics + MIN_RTT_MICS;
        self.rtt.lock().retransmission_timeout(floor)
    }

    fn rtt_hint(&self) -> i32 {
        i32::try_from(self.rtt.lock().smoothed()).unwrap_or(i32::MAX)
    }

    fn congestion_control(&self) -> Arc<dyn CongestionControl> {
        match self.congestion.lock().as_ref() {
            Some(cubic) => cubic.clone() as Arc<dyn CongestionControl>,
            None => self.context.no_congestion.clone(),
        }
    }

    fn schedule(self: &Arc<Self>) {
        self.context.send_list.lock().push(self);
    }

    fn send_control_frame(&self, write: impl FnOnce(&mut Vec<u8>)) -> NetResult<()> {
        let packet = self.sealer().seal(write)?;
        self.link.emit(&packet)
    }

    fn enable_congestion_control(&self, active: usize) {
        let threshold = self.context.config.congestion.transmission_threshold;
        if active < threshold {
            return;
        }
        let cubic = {
            let mut congestion = self.congestion.lock();
            if congestion.is_some() {
                return;
            }
            let cubic = Arc::new(CubicCongestion::new(self.context.config.congestion));
            *congestion = Some(cubic.clone());
            cubic
        };
        debug!(
            connection_id = self.connection_id,
            active, "congestion control enabled"
        );
        self.context.congestion_list.lock().push(cubic);
    }

    /// Reserve a send transmission, optionally under a caller-chosen id.
    ///
    /// A solicited `waiter` registers the receive transmission for the response under the
    /// same id.
    fn try_create_send_transmission(
        &self,
        transmission_id: Option<u32>,
        waiter: Option<MessageWaiter>,
        now: Mics,
    ) -> NetResult<(u32, oneshot::Receiver<NetResult<()>>)> {
        self.ensure_open()?;
        let max_transmissions = self.agreement.lock().max_transmissions;

        let (transmission_id, completion, active) = {
            let mut sends = self.sends.lock();
            let active = sends.active();
            if active >= usize::try_from(max_transmissions).unwrap_or(usize::MAX) {
                return Err(NetError::NoTransmission);
            }

            let transmission_id = match transmission_id {
                Some(transmission_id) => {
                    if sends.transmissions.contains_key(&transmission_id) {
                        return Err(NetError::NoTransmission);
                    }
                    transmission_id
                }
                None => {
                    let mut rng = rand::thread_rng();
                    let receives = self.receives.lock();
                    loop {
                        let candidate: u32 = rng.r#gen();
                        if !sends.transmissions.contains_key(&candidate)
                            && !receives.contains_key(&candidate)
                        {
                            break candidate;
                        }
                    }
                }
            };

            let (tx, rx) = oneshot::channel();
            sends
                .transmissions
                .insert(transmission_id, SendTransmission::new(transmission_id, tx, now));
            if let Some(waiter) = waiter {
                self.receives.lock().insert(
                    transmission_id,
                    ReceiveTransmission::solicited(transmission_id, waiter, now),
                );
            }
            (transmission_id, rx, active + 1)
        };

        self.touch(now);
        self.enable_congestion_control(active);
        trace!(
            connection_id = self.connection_id,
            transmission_id, "send transmission created"
        );
        Ok((transmission_id, completion))
    }

    /// Slice, seal and queue a block; returns once the peer acknowledged every gene.
    async fn send_block(
        self: &Arc<Self>,
        transmission_id: Option<u32>,
        waiter: Option<MessageWaiter>,
        message: &Message,
        timeout: Duration,
    ) -> NetResult<u32> {
        let genes = gene_count(message.payload().len());
        let max_genes = usize::try_from(self.agreement.lock().max_block_genes()).unwrap_or(0);
        if genes > max_genes {
            return Err(NetError::BlockSizeLimit);
        }

        let now = now_mics();
        let (transmission_id, completion) =
            self.try_create_send_transmission(transmission_id, waiter, now)?;
        let _guard = SendGuard {
            connection: self.clone(),
            transmission_id,
        };

        let sealed = SendTransmission::seal_block(
            transmission_id,
            self.sealer(),
            message.data_kind(),
            message.data_id(),
            message.payload(),
            self.rtt_hint(),
        )?;
        {
            let mut sends = self.sends.lock();
            let transmission = sends
                .transmissions
                .get_mut(&transmission_id)
                .ok_or(NetError::Closed)?;
            transmission.install_block(sealed);
            sends.enqueue(transmission_id);
        }
        self.schedule();

        await_result(completion, timeout).await?;
        Ok(transmission_id)
    }

    fn open_send_stream(
        self: &Arc<Self>,
        data_kind: u32,
        data_id: u64,
        max_stream_length: i64,
        timeout: Duration,
    ) -> NetResult<SendStream> {
        let agreement = self.agreement();
        if max_stream_length <= 0 || max_stream_length > agreement.max_stream_length {
            return Err(NetError::StreamLengthLimit);
        }

        let (transmission_id, completion) =
            self.try_create_send_transmission(None, None, now_mics())?;
        let notify = Arc::new(Notify::new());
        if let Some(transmission) = self.sends.lock().transmissions.get_mut(&transmission_id) {
            transmission.open_stream(
                max_stream_length,
                agreement.stream_window_genes(max_stream_length),
                data_kind,
                data_id,
                notify.clone(),
            );
        }
        debug!(
            connection_id = self.connection_id,
            transmission_id, max_stream_length, "send stream opened"
        );
        Ok(SendStream::new(
            self.clone(),
            transmission_id,
            notify,
            completion,
            timeout,
        ))
    }

    /// Offer one stream gene to the transmission window.
    pub(crate) fn push_stream_gene(
        self: &Arc<Self>,
        transmission_id: u32,
        chunk: &[u8],
        control: DataControl,
    ) -> NetResult<StreamPush> {
        self.ensure_open()?;
        let rtt_hint = self.rtt_hint();
        let push = {
            let mut sends = self.sends.lock();
            let transmission = sends
                .transmissions
                .get_mut(&transmission_id)
                .ok_or(NetError::Closed)?;
            let push = transmission.push_stream_gene(self.sealer(), chunk, control, rtt_hint)?;
            if push == StreamPush::Pushed {
                sends.enqueue(transmission_id);
            }
            push
        };
        if push == StreamPush::Pushed {
            self.touch(now_mics());
            self.schedule();
        }
        Ok(push)
    }

    /// Probe the receiver window of a blocked stream.
    pub(crate) fn knock(&self, transmission_id: u32) -> NetResult<()> {
        self.ensure_open()?;
        trace!(
            connection_id = self.connection_id,
            transmission_id, "knock"
        );
        self.send_control_frame(|out| KnockFrame { transmission_id }.encode(out))
    }

    /// Abandon a send transmission, resolving its waiter with `error` if still active.
    pub(crate) fn release_send(&self, transmission_id: u32, error: NetError) {
        let now = now_mics();
        let removed = self.sends.lock().transmissions.remove(&transmission_id);
        if let Some(mut transmission) = removed {
            if transmission.mode() != TransmissionMode::Disposed {
                transmission.dispose(Err(error), self.congestion_control().as_ref(), now);
                self.context.metrics.record_transmission(false);
            }
        }
    }

    /// Abandon a receive transmission that is still active.
    pub(crate) fn release_receive(&self, transmission_id: u32, error: NetError) {
        let now = now_mics();
        if let Some(transmission) = self.receives.lock().get_mut(&transmission_id) {
            if transmission.is_active() {
                transmission.fail(error, now);
            }
        }
    }

    pub(crate) fn stream_read(self: &Arc<Self>, transmission_id: u32) -> StreamRead {
        let now = now_mics();
        let read = match self.receives.lock().get_mut(&transmission_id) {
            Some(transmission) => transmission.stream_read(now),
            None => StreamRead::Failed(NetError::NoTransmission),
        };
        if let StreamRead::Chunk {
            window_opened: true,
            ..
        } = read
        {
            self.context
                .ack_buffer
                .ack_block(self, transmission_id, None, now);
        }
        read
    }

    /// Widen the limits of both ends to cover `target`.
    ///
    /// The peer checks `target` against its own terminal limit. Each end widens only after
    /// the peer accepted, so the sender never relies on a limit the receiver lacks.
    pub(crate) async fn update_agreement(
        self: &Arc<Self>,
        target: Agreement,
        timeout: Duration,
    ) -> NetResult<()> {
        self.ensure_open()?;
        if !self.context.config.agreement_limit.is_inclusive(&target) {
            return Err(NetError::InvalidData);
        }
        if self.agreement().is_inclusive(&target) {
            return Ok(());
        }

        let deadline = Instant::now() + timeout;
        let serial = self.agreement_serial.fetch_add(1, Ordering::Relaxed);
        let (reply, mut verdict) = oneshot::channel();
        self.agreement_updates
            .lock()
            .insert(serial, PendingAgreement { target, reply });
        let _guard = AgreementGuard {
            connection: self.clone(),
            serial,
        };

        let frame = AgreementUpdateFrame {
            serial,
            agreement: target,
        };
        loop {
            self.send_control_frame(|out| frame.encode(out))?;
            let resend = to_duration(self.retransmission_timeout());
            let wait = resend.min(deadline.saturating_duration_since(Instant::now()));
            match tokio::time::timeout(wait, &mut verdict).await {
                Ok(Ok(true)) => return Ok(()),
                Ok(Ok(false)) => return Err(NetError::InvalidData),
                Ok(Err(_)) => return Err(NetError::Closed),
                Err(_) if Instant::now() >= deadline => return Err(NetError::Timeout),
                Err(_) => trace!(
                    connection_id = self.connection_id,
                    serial, "agreement update resent"
                ),
            }
        }
    }

    /// Create (or return) the reverse-direction twin sharing id and embryo.
    pub(crate) fn prepare_bidirectional(self: &Arc<Self>) -> NetResult<Arc<Connection>> {
        self.ensure_open()?;
        let agreement = self.agreement();
        if !agreement.enable_bidirectional_connection {
            return Err(NetError::InvalidEndpoint);
        }

        let mut peer = self.peer.lock();
        if let Some(existing) = peer.as_ref().and_then(Weak::upgrade) {
            return Ok(existing);
        }

        let twin = Connection::new(
            self.context.clone(),
            self.role.flip(),
            ConnectionSeed {
                connection_id: self.connection_id,
                embryo: self.embryo.clone(),
                agreement,
                endpoint: self.endpoint(),
                relay_hop_count: self.relay_hop_count(),
                initiator: self.initiator,
                nonce: self.twin_nonce.clone(),
                twin_nonce: self.cipher.nonce_counter(),
            },
            now_mics(),
        );
        *twin.peer.lock() = Some(Arc::downgrade(self));
        *peer = Some(Arc::downgrade(&twin));
        drop(peer);

        self.context.registry.insert(&twin);
        info!(
            connection_id = self.connection_id,
            role = ?twin.role,
            "bidirectional connection prepared"
        );
        Ok(twin)
    }

    /// Open → Closed. Cancels every waiter and closes the bidirectional twin.
    pub(crate) fn close(self: &Arc<Self>, now: Mics, send_close: bool) {
        {
            let mut lifecycle = self.lifecycle.lock();
            if lifecycle.state != ConnectionState::Open {
                return;
            }
            lifecycle.state = ConnectionState::Closed;
            lifecycle.closed_mics = now;
        }
        info!(
            connection_id = self.connection_id,
            role = ?self.role,
            send_close,
            "connection closed"
        );

        if send_close {
            if let Err(error) =
                self.send_control_frame(|out| out.put_u16_le(FrameType::Close.as_u16()))
            {
                debug!(connection_id = self.connection_id, %error, "close frame not sent");
            }
        }
        self.abort_transmissions(NetError::Closed, now);
        self.context.metrics.record_connection_close();

        // Unlink both sides so a reopened connection builds a fresh twin.
        let peer = self.peer.lock().take().and_then(|peer| peer.upgrade());
        if let Some(peer) = peer {
            *peer.peer.lock() = None;
            peer.close(now, send_close);
        }
    }

    /// Closed → Disposed. Tears down every transmission.
    fn dispose(&self, now: Mics) {
        {
            let mut lifecycle = self.lifecycle.lock();
            if lifecycle.state == ConnectionState::Disposed {
                return;
            }
            lifecycle.state = ConnectionState::Disposed;
        }
        self.abort_transmissions(NetError::Closed, now);
        self.receives.lock().clear();
        if let Some(cubic) = self.congestion.lock().take() {
            cubic.dispose();
        }
        *self.peer.lock() = None;
        debug!(connection_id = self.connection_id, "connection disposed");
    }

    fn abort_transmissions(&self, error: NetError, now: Mics) {
        self.agreement_updates.lock().clear();
        let congestion = self.congestion_control();
        let mut aborted = 0;
        {
            let mut sends = self.sends.lock();
            sends.queue.clear();
            for (_, mut transmission) in sends.transmissions.drain() {
                if transmission.mode() != TransmissionMode::Disposed {
                    aborted += 1;
                }
                transmission.dispose(Err(error), congestion.as_ref(), now);
            }
        }
        for transmission in self.receives.lock().values_mut() {
            if transmission.is_active() {
                aborted += 1;
                transmission.fail(error, now);
            }
        }
        for _ in 0..aborted {
            self.context.metrics.record_transmission(false);
        }
    }

    /// Lifecycle sweep. Returns the resulting state.
    pub(crate) fn clean(self: &Arc<Self>, now: Mics) -> ConnectionState {
        let lifecycle = *self.lifecycle.lock();
        match lifecycle.state {
            ConnectionState::Open => {
                let retention = self.agreement.lock().min_connection_retention_mics;
                let idle = now - self.last_event_mics.load(Ordering::Relaxed);
                if idle > retention {
                    debug!(connection_id = self.connection_id, idle, "connection idle");
                    self.close(now, true);
                    return ConnectionState::Closed;
                }
                self.clean_transmissions(now);
                self.clean_receive_transmissions(now);
                ConnectionState::Open
            }
            ConnectionState::Closed => {
                let delay = self.context.config.connection_disposal_delay_mics;
                if now - lifecycle.closed_mics > delay {
                    self.dispose(now);
                    ConnectionState::Disposed
                } else {
                    ConnectionState::Closed
                }
            }
            ConnectionState::Disposed => ConnectionState::Disposed,
        }
    }

    /// Dispose send transmissions whose last ack is older than the send retention.
    pub(crate) fn clean_transmissions(&self, now: Mics) -> usize {
        let retention = self.context.config.send_transmission_retention_mics;
        let congestion = self.congestion_control();
        let mut sends = self.sends.lock();
        let stale: Vec<u32> = sends
            .transmissions
            .iter()
            .filter(|(_, transmission)| {
                transmission.has_unacked() && now - transmission.last_ack_mics() > retention
            })
            .map(|(transmission_id, _)| *transmission_id)
            .collect();
        for transmission_id in &stale {
            if let Some(mut transmission) = sends.transmissions.remove(transmission_id) {
                warn!(
                    connection_id = self.connection_id,
                    transmission_id, "send transmission expired"
                );
                transmission.dispose(Err(NetError::Timeout), congestion.as_ref(), now);
                self.context.metrics.record_transmission(false);
            }
        }
        stale.len()
    }

    /// Remove receive transmissions disposed longer ago than the receive retention.
    pub(crate) fn clean_receive_transmissions(&self, now: Mics) -> usize {
        let retention = self.context.config.receive_transmission_retention_mics;
        let mut receives = self.receives.lock();
        let before = receives.len();
        receives.retain(|_, transmission| !transmission.is_expired(now, retention));
        before - receives.len()
    }

    /// Reschedule genes whose last send is older than the retransmission timeout.
    pub(crate) fn check_retransmission(self: &Arc<Self>, now: Mics) {
        if !self.is_open() {
            return;
        }
        let rto = self.retransmission_timeout();
        let minimum_rtt = self.rtt.lock().minimum();
        let congestion = self.congestion_control();

        let rescheduled = {
            let mut sends = self.sends.lock();
            let timed_out: Vec<u32> = sends
                .transmissions
                .iter_mut()
                .filter_map(|(transmission_id, transmission)| {
                    transmission
                        .mark_timed_out(now, rto, minimum_rtt, congestion.as_ref())
                        .then_some(*transmission_id)
                })
                .collect();
            for transmission_id in &timed_out {
                sends.enqueue(*transmission_id);
            }
            !timed_out.is_empty()
        };
        if rescheduled {
            self.schedule();
        }
    }

    /// Authenticate and dispatch one datagram routed to this connection.
    #[instrument(level = "trace", skip(self, datagram), fields(connection_id = self.connection_id))]
    pub(crate) fn process_datagram(self: &Arc<Self>, datagram: &[u8], now: Mics) {
        let frame = match self.cipher.open(datagram) {
            Ok(frame) => frame,
            Err(error) => {
                debug!(%error, "datagram rejected");
                self.context.metrics.record_dropped();
                return;
            }
        };

        let mut body: &[u8] = &frame;
        let frame_type = match read_frame_type(&mut body) {
            Ok(frame_type) => frame_type,
            Err(error) => {
                debug!(%error, "malformed frame");
                self.context.metrics.record_dropped();
                return;
            }
        };
        if !self.accept_inbound(frame_type, now) {
            self.context.metrics.record_dropped();
            return;
        }
        self.last_receive_mics.fetch_max(now, Ordering::Relaxed);
        self.touch(now);
        self.context.metrics.record_received();

        let offset = frame.len() - body.len();
        let result = match frame_type {
            FrameType::Close => {
                self.close(now, false);
                Ok(())
            }
            FrameType::Ack => self.process_ack(body, now),
            FrameType::FirstGene => self.process_first_gene(&frame, offset, now),
            FrameType::FollowingGene => self.process_following_gene(&frame, offset, now),
            FrameType::Knock => self.process_knock(body),
            FrameType::KnockResponse => self.process_knock_response(body),
            FrameType::AgreementUpdate => self.process_agreement_update(body),
            FrameType::AgreementResponse => self.process_agreement_response(body),
        };
        if let Err(error) = result {
            debug!(%error, ?frame_type, "frame dropped");
            self.context.metrics.record_dropped();
        }
    }

    /// Closed connections reopen on inbound traffic other than Close.
    fn accept_inbound(&self, frame_type: FrameType, now: Mics) -> bool {
        let mut lifecycle = self.lifecycle.lock();
        match lifecycle.state {
            ConnectionState::Open => true,
            ConnectionState::Closed if frame_type != FrameType::Close => {
                lifecycle.state = ConnectionState::Open;
                drop(lifecycle);
                self.last_event_mics.store(now, Ordering::Relaxed);
                self.context.metrics.record_connection_open();
                info!(connection_id = self.connection_id, "connection reopened");
                true
            }
            _ => false,
        }
    }

    fn process_ack(self: &Arc<Self>, body: &[u8], now: Mics) -> Result<(), FrameError> {
        let entries = decode_ack_entries(body)?;
        let congestion = self.congestion_control();
        let (minimum_rtt, loss_cooldown) = {
            let rtt = self.rtt.lock();
            (rtt.minimum(), rtt.smoothed())
        };

        let mut sample: Option<Mics> = None;
        let mut completed = 0;
        let mut reschedule = false;
        {
            let mut sends = self.sends.lock();
            for entry in &entries {
                let transmission_id = entry.transmission_id();
                let Some(transmission) = sends.transmissions.get_mut(&transmission_id) else {
                    trace!(transmission_id, "ack for unknown transmission");
                    continue;
                };
                let progress = transmission.process_ack(
                    entry,
                    now,
                    congestion.as_ref(),
                    minimum_rtt,
                    loss_cooldown,
                );
                if let Some(rtt) = progress.rtt_sample {
                    sample = Some(sample.map_or(rtt, |best| best.min(rtt)));
                }
                if progress.completed {
                    completed += 1;
                }
                if transmission.has_pending() {
                    sends.enqueue(transmission_id);
                    reschedule = true;
                }
            }
        }

        if let Some(sample) = sample {
            self.rtt.lock().add_sample(sample);
            congestion.add_rtt(sample);
        }
        for _ in 0..completed {
            self.context.metrics.record_transmission(true);
        }
        if reschedule {
            self.schedule();
        }
        Ok(())
    }

    fn process_first_gene(
        self: &Arc<Self>,
        frame: &Bytes,
        offset: usize,
        now: Mics,
    ) -> Result<(), FrameError> {
        let mut body = &frame[offset..];
        let header = FirstGeneHeader::decode(&mut body)?;
        let payload = frame.slice(frame.len() - body.len()..);
        self.rtt.lock().add_hint(Mics::from(header.rtt_hint));

        let transmission_id = header.transmission_id;
        let agreement = self.agreement();
        let (result, notify) = {
            let mut receives = self.receives.lock();
            let opened_by_peer =
                self.role == Role::Server && !receives.contains_key(&transmission_id);
            if opened_by_peer {
                let active = receives
                    .values()
                    .filter(|receive| !receive.is_solicited() && receive.is_active())
                    .count();
                if active >= usize::try_from(agreement.max_transmissions).unwrap_or(0) {
                    debug!(transmission_id, active, "receive transmission limit reached");
                    self.context.metrics.record_dropped();
                    return Ok(());
                }
            }
            let transmission = match receives.entry(transmission_id) {
                Entry::Occupied(entry) => entry.into_mut(),
                Entry::Vacant(entry) => {
                    if self.role == Role::Client {
                        trace!(transmission_id, "unsolicited transmission dropped");
                        return Ok(());
                    }
                    entry.insert(ReceiveTransmission::new(transmission_id, now))
                }
            };
            let result = transmission.first_gene(&header, payload, &agreement, now);
            (result, transmission.notify())
        };
        self.handle_arrival(transmission_id, result, notify, now);
        Ok(())
    }

    fn process_following_gene(
        self: &Arc<Self>,
        frame: &Bytes,
        offset: usize,
        now: Mics,
    ) -> Result<(), FrameError> {
        let mut body = &frame[offset..];
        let header = FollowingGeneHeader::decode(&mut body)?;
        let payload = frame.slice(frame.len() - body.len()..);

        let transmission_id = header.transmission_id;
        let (result, notify) = {
            let mut receives = self.receives.lock();
            let Some(transmission) = receives.get_mut(&transmission_id) else {
                trace!(transmission_id, "gene for unknown transmission dropped");
                return Ok(());
            };
            let result = transmission.following_gene(&header, payload, now);
            (result, transmission.notify())
        };
        self.handle_arrival(transmission_id, result, notify, now);
        Ok(())
    }

    fn handle_arrival(
        self: &Arc<Self>,
        transmission_id: u32,
        result: NetResult<Arrival>,
        notify: Arc<Notify>,
        now: Mics,
    ) {
        let arrival = match result {
            Ok(arrival) => arrival,
            Err(error) => {
                debug!(transmission_id, %error, "receive transmission rejected");
                self.context.metrics.record_transmission(false);
                return;
            }
        };

        match arrival.ack {
            Some(AckKind::Burst) => self.context.ack_buffer.ack_burst(self, transmission_id, now),
            Some(AckKind::Block(position)) => {
                self.context
                    .ack_buffer
                    .ack_block(self, transmission_id, position, now);
            }
            None => {}
        }
        if arrival.completed {
            self.context.metrics.record_transmission(true);
        }
        if let Some(message) = arrival.message {
            self.deliver(Incoming::Message(IncomingMessage {
                connection: ServerConnection::new(self.clone()),
                transmission_id,
                message,
            }));
        }
        if arrival.stream_opened {
            let (data_kind, data_id) = self
                .receives
                .lock()
                .get(&transmission_id)
                .map_or((0, 0), |transmission| {
                    (transmission.data_kind(), transmission.data_id())
                });
            let stream = ReceiveStream::new(
                self.clone(),
                transmission_id,
                (data_kind, data_id),
                notify,
                self.default_timeout(),
            );
            self.deliver(Incoming::Stream(IncomingStream {
                connection: ServerConnection::new(self.clone()),
                stream,
            }));
        }
    }

    fn deliver(&self, incoming: Incoming) {
        if self.context.incoming.send(incoming).is_err() {
            debug!(
                connection_id = self.connection_id,
                "incoming receiver dropped"
            );
        }
    }

    fn process_knock(&self, mut body: &[u8]) -> Result<(), FrameError> {
        let knock = KnockFrame::decode(&mut body)?;
        let report = self
            .receives
            .lock()
            .get(&knock.transmission_id)
            .and_then(ReceiveTransmission::window_report);
        if let Some((max_receive_position, successive_received_position)) = report {
            let response = KnockResponseFrame {
                transmission_id: knock.transmission_id,
                max_receive_position,
                successive_received_position,
            };
            if let Err(error) = self.send_control_frame(|out| response.encode(out)) {
                debug!(%error, "knock response not sent");
            }
        }
        Ok(())
    }

    fn process_agreement_update(&self, mut body: &[u8]) -> Result<(), FrameError> {
        let update = AgreementUpdateFrame::decode(&mut body)?;
        let accepted = self
            .context
            .config
            .agreement_limit
            .is_inclusive(&update.agreement);
        if accepted {
            self.agreement.lock().accept_all(&update.agreement);
        }
        debug!(
            connection_id = self.connection_id,
            serial = update.serial,
            accepted,
            "agreement update from peer"
        );
        let response = AgreementResponseFrame {
            serial: update.serial,
            accepted,
        };
        if let Err(error) = self.send_control_frame(|out| response.encode(out)) {
            debug!(%error, "agreement response not sent");
        }
        Ok(())
    }

    fn process_agreement_response(&self, mut body: &[u8]) -> Result<(), FrameError> {
        let response = AgreementResponseFrame::decode(&mut body)?;
        let Some(pending) = self.agreement_updates.lock().remove(&response.serial) else {
            trace!(serial = response.serial, "stale agreement response");
            return Ok(());
        };
        if response.accepted {
            self.agreement.lock().accept_all(&pending.target);
            info!(
                connection_id = self.connection_id,
                agreement = ?self.agreement(),
                "agreement widened"
            );
        }
        let _ = pending.reply.send(response.accepted);
        Ok(())
    }

    fn process_knock_response(self: &Arc<Self>, mut body: &[u8]) -> Result<(), FrameError> {
        let response = KnockResponseFrame::decode(&mut body)?;
        let advanced = {
            let mut sends = self.sends.lock();
            let advanced = sends
                .transmissions
                .get_mut(&response.transmission_id)
                .is_some_and(|transmission| {
                    transmission.update_window(response.max_receive_position)
                });
            if advanced {
                sends.enqueue(response.transmission_id);
            }
            advanced
        };
        if advanced {
            self.schedule();
        }
        Ok(())
    }
}

impl Schedulable for Connection {
    fn membership(&self) -> &AtomicBool {
        &self.in_send_list
    }

    fn is_congested(&self) -> bool {
        self.congestion_control().is_congested()
    }

    /// Send one gene from the transmission at the head of the queue.
    fn send_one(self: &Arc<Self>, now: Mics) -> SendOutcome {
        if !self.is_open() {
            return SendOutcome::Idle;
        }
        let congestion = self.congestion_control();
        if congestion.is_congested() {
            return SendOutcome::Congested;
        }

        let silent = now - self.last_receive_mics.load(Ordering::Relaxed);
        let timeout = self.context.config.transmission_timeout_mics;
        let mut timed_out = false;
        let mut outcome = SendOutcome::Idle;
        {
            let mut guard = self.sends.lock();
            let sends = &mut *guard;
            let outlet = Outlet {
                link: &self.link,
                congestion: congestion.as_ref(),
                stats: &self.stats,
                metrics: &self.context.metrics,
            };
            while let Some(transmission_id) = sends.queue.pop_front() {
                let Some(transmission) = sends.transmissions.get_mut(&transmission_id) else {
                    continue;
                };
                if silent > timeout && transmission.has_unacked() {
                    timed_out = true;
                    break;
                }
                match transmission.send_next(&outlet, now) {
                    Ok(sent) => {
                        if transmission.has_pending() {
                            sends.queue.push_back(transmission_id);
                        } else {
                            transmission.set_queued(false);
                        }
                        if sent {
                            outcome = SendOutcome::Sent;
                            break;
                        }
                    }
                    Err(error) => {
                        debug!(transmission_id, %error, "gene send failed");
                        transmission.dispose(Err(error), congestion.as_ref(), now);
                    }
                }
            }
        }

        if timed_out {
            warn!(
                connection_id = self.connection_id,
                silent, "transmission timeout"
            );
            self.close(now, false);
            return SendOutcome::Idle;
        }
        outcome
    }
}

impl AckTarget for Connection {
    fn ack_key(&self) -> AckKey {
        AckKey {
            connection_id: self.connection_id,
            server: self.role == Role::Server,
        }
    }

    fn window_report(&self, transmission_id: u32) -> Option<(i32, i32)> {
        self.receives
            .lock()
            .get(&transmission_id)
            .and_then(ReceiveTransmission::window_report)
    }

    fn emit_ack_frame(&self, frame: &[u8]) {
        if !self.is_open() {
            return;
        }
        match self.send_control_frame(|out| out.extend_from_slice(frame)) {
            Ok(()) => self.context.metrics.record_ack_frame(),
            Err(error) => debug!(connection_id = self.connection_id, %error, "ack not sent"),
        }
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("connection_id", &self.connection_id)
            .field("role", &self.role)
            .field("endpoint", &self.endpoint())
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

/// Resolves the pending transmission with `Canceled` if the awaiting call is dropped.
struct SendGuard {
    connection: Arc<Connection>,
    transmission_id: u32,
}

impl Drop for SendGuard {
    fn drop(&mut self) {
        self.connection
            .release_send(self.transmission_id, NetError::Canceled);
    }
}

struct AgreementGuard {
    connection: Arc<Connection>,
    serial: u32,
}

impl Drop for AgreementGuard {
    fn drop(&mut self) {
        self.connection.agreement_updates.lock().remove(&self.serial);
    }
}

struct ReceiveGuard {
    connection: Arc<Connection>,
    transmission_id: u32,
}

impl Drop for ReceiveGuard {
    fn drop(&mut self) {
        self.connection
            .release_receive(self.transmission_id, NetError::Canceled);
    }
}

pub(crate) async fn await_result<T>(
    receiver: oneshot::Receiver<NetResult<T>>,
    timeout: Duration,
) -> NetResult<T> {
    match tokio::time::timeout(timeout, receiver).await {
        Ok(Ok(result)) => result,
        Ok(Err(_)) => Err(NetError::Closed),
        Err(_) => Err(NetError::Timeout),
    }
}

/// Client side of a connection: sends requests and streams to the server.
#[derive(Clone)]
pub struct ClientConnection {
    inner: Arc<Connection>,
    timeout: Duration,
}

impl ClientConnection {
    pub(crate) fn new(inner: Arc<Connection>) -> Self {
        let timeout = inner.default_timeout();
        Self { inner, timeout }
    }

    /// Use `timeout` for calls made through the returned handle.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Connection id shared with the peer.
    #[must_use]
    pub fn connection_id(&self) -> u64 {
        self.inner.connection_id()
    }

    /// Remote endpoint.
    #[must_use]
    pub fn endpoint(&self) -> SocketAddr {
        self.inner.endpoint()
    }

    /// Lifecycle state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.inner.state()
    }

    /// Current limits.
    #[must_use]
    pub fn agreement(&self) -> Agreement {
        self.inner.agreement()
    }

    /// RTT estimate.
    #[must_use]
    pub fn rtt(&self) -> RttStats {
        self.inner.rtt()
    }

    /// Smoothed RTT as a duration.
    #[must_use]
    pub fn smoothed_rtt(&self) -> Duration {
        to_duration(self.inner.rtt().smoothed())
    }

    /// Send and resend counters.
    #[must_use]
    pub fn delivery_stats(&self) -> &DeliveryStats {
        self.inner.stats()
    }

    /// Share of first sends among all gene sends.
    #[must_use]
    pub fn delivery_ratio(&self) -> f64 {
        self.inner.stats().delivery_ratio()
    }

    /// Whether Cubic congestion control has been switched on.
    #[must_use]
    pub fn has_congestion_control(&self) -> bool {
        self.inner.has_congestion_control()
    }

    /// Send a message and wait until the server acknowledged all of it.
    pub async fn send_block(&self, message: &Message) -> NetResult<()> {
        self.inner
            .send_block(None, None, message, self.timeout)
            .await
            .map(|_| ())
    }

    /// Send a request and wait for the server's response.
    pub async fn send_and_receive(&self, message: &Message) -> NetResult<Message> {
        let deadline = Instant::now() + self.timeout;
        let (waiter, response) = oneshot::channel();
        let transmission_id = self
            .inner
            .send_block(None, Some(waiter), message, self.timeout)
            .await?;
        let _guard = ReceiveGuard {
            connection: self.inner.clone(),
            transmission_id,
        };
        await_result(response, deadline.saturating_duration_since(Instant::now())).await
    }

    /// Open a stream of at most `max_stream_length` bytes.
    pub fn send_stream(
        &self,
        data_kind: u32,
        data_id: u64,
        max_stream_length: i64,
    ) -> NetResult<SendStream> {
        self.inner
            .open_send_stream(data_kind, data_id, max_stream_length, self.timeout)
    }

    /// Widen the limits of both ends of the connection.
    ///
    /// Returns once the peer accepted; `InvalidData` if either terminal's limit forbids it.
    pub async fn update_agreement(&self, agreement: &Agreement) -> NetResult<()> {
        self.inner.update_agreement(*agreement, self.timeout).await
    }

    /// Reverse-direction connection through which the server can send to this side.
    pub fn prepare_bidirectional(&self) -> NetResult<ServerConnection> {
        self.inner.prepare_bidirectional().map(ServerConnection::new)
    }

    /// Close the connection and notify the peer.
    pub fn close(&self) {
        self.inner.close(now_mics(), true);
    }
}

impl fmt::Debug for ClientConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ClientConnection").field(&self.inner).finish()
    }
}

/// Server side of a connection: receives requests and answers them.
#[derive(Clone)]
pub struct ServerConnection {
    inner: Arc<Connection>,
    timeout: Duration,
}

impl ServerConnection {
    pub(crate) fn new(inner: Arc<Connection>) -> Self {
        let timeout = inner.default_timeout();
        Self { inner, timeout }
    }

    /// Use `timeout` for calls made through the returned handle.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Connection id shared with the peer.
    #[must_use]
    pub fn connection_id(&self) -> u64 {
        self.inner.connection_id()
    }

    /// Remote endpoint.
    #[must_use]
    pub fn endpoint(&self) -> SocketAddr {
        self.inner.endpoint()
    }

    /// Lifecycle state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.inner.state()
    }

    /// Current limits.
    #[must_use]
    pub fn agreement(&self) -> Agreement {
        self.inner.agreement()
    }

    /// Share of first sends among all gene sends.
    #[must_use]
    pub fn delivery_ratio(&self) -> f64 {
        self.inner.stats().delivery_ratio()
    }

    /// Answer the request carried by `transmission_id`.
    pub async fn respond(&self, transmission_id: u32, message: &Message) -> NetResult<()> {
        self.inner
            .send_block(Some(transmission_id), None, message, self.timeout)
            .await
            .map(|_| ())
    }

    /// Widen the limits of both ends of the connection.
    ///
    /// Returns once the peer accepted; `InvalidData` if either terminal's limit forbids it.
    pub async fn update_agreement(&self, agreement: &Agreement) -> NetResult<()> {
        self.inner.update_agreement(*agreement, self.timeout).await
    }

    /// Reverse-direction connection through which this side can send to the client.
    pub fn prepare_bidirectional(&self) -> NetResult<ClientConnection> {
        self.inner.prepare_bidirectional().map(ClientConnection::new)
    }

    /// Close the connection and notify the peer.
    pub fn close(&self) {
        self.inner.close(now_mics(), true);
    }
}

impl fmt::Debug for ServerConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ServerConnection").field(&self.inner).finish()
    }
}
