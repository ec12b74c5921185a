//! The server-side connection state machine (RFC 9000 Sections 5-10).
//!
//! A pure protocol engine: the host feeds datagrams and timer fires and
//! drains transmits and events. No I/O, no clocks beyond the instants
//! the host passes in (wall time is only touched to stamp
//! address-validation tokens).

use std::collections::VecDeque;
use std::net::IpAddr;
use std::time::{Duration, Instant, SystemTime};

use bytes::{Bytes, BytesMut};
use tracing::{debug, trace, warn};

use crate::crypto::{
    CipherSuite, EncryptionLevel, HandshakeSink, Keys, SecretDir, ENCRYPTION_LEVELS,
};
use crate::error::{ConnectionError, Error, Result};
use crate::frames::{
    ConnectionCloseFrame, CryptoFrame, Frame, FrameParser, MaxDataFrame, MaxStreamDataFrame,
    MaxStreamsFrame, NewTokenFrame, StopSendingFrame, StreamFrame,
};
use crate::packet::{
    self, encode_packet_number, FrameRecord, Header, PacketType, SendCtx,
};
use crate::server::{build_stateless_reset, Amplification};
use crate::stream::{OpenOutcome, Ordered, OrderedStream, Streams};
use crate::token::{self, TokenCheck, TokenKey};
use crate::transport::TransportParameters;
use crate::types::{
    stream_is_server_initiated, stream_is_unidirectional, ConnectionId, StreamId,
    MAX_BUFFERED, MAX_CID_LENGTH, MAX_LONG_HEADER, MAX_SHORT_HEADER, MAX_UDP_PAYLOAD_OUT,
    MAX_UDP_PAYLOAD_SIZE, MIN_INITIAL_DCID_LENGTH, MIN_INITIAL_SIZE, MIN_PKT_LEN,
    SERVER_CID_LENGTH, SR_TOKEN_LEN, TAG_LEN, UNSET_PN,
};
use crate::version::{is_supported, SUPPORTED_VERSIONS};

use super::cid::ClientCids;
use super::events::{Event, StreamRecv, Transmit};
use super::Config;

/// Application error code used on STOP_SENDING for locally closed
/// streams (H3_NO_ERROR, matching what the original server speaks).
const STOP_SENDING_APP_CODE: u64 = 0x100;

/// Role of the shared PTO/loss timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PtoRole {
    Probe,
    Loss,
}

/// Result of admitting the first datagram of a prospective connection.
pub enum Accept {
    /// Not a connection-forming datagram; optionally reply (version
    /// negotiation) and forget.
    Reject(Option<Transmit>),

    /// A connection was created; it may already have produced transmits
    /// (Retry or handshake flight).
    Connection(Box<Connection>, Vec<Transmit>),
}

/// Admit the first datagram from an unknown source
/// (RFC 9000 Section 5.2.2).
pub fn accept(cfg: Config, peer: IpAddr, now: Instant, datagram: Bytes) -> Accept {
    let header = match Header::parse(datagram.clone(), SERVER_CID_LENGTH) {
        Ok(header) => header,
        Err(_) => return Accept::Reject(None),
    };

    if header.ty != PacketType::Initial {
        // nothing to say to an unknown short-header or handshake source
        return Accept::Reject(None);
    }

    if !is_supported(header.version) {
        debug!(version = header.version, "version negotiation");
        return Accept::Reject(Some(Transmit {
            data: packet::build_version_negotiation(
                &header.dcid,
                &header.scid,
                SUPPORTED_VERSIONS,
            ),
        }));
    }

    if header.dcid.len() < MIN_INITIAL_DCID_LENGTH {
        debug!(len = header.dcid.len(), "short dcid in initial packet");
        return Accept::Reject(None);
    }

    let mut conn = Box::new(Connection::new(cfg, peer, now, &header));
    let transmits = conn.handle_datagram(now, datagram);
    Accept::Connection(conn, transmits)
}

pub struct Connection {
    cfg: Config,
    peer: IpAddr,
    version: u32,

    /// Our current CID (what the client addresses us with).
    dcid: ConnectionId,

    /// The client's original DCID; source of initial secrets and the
    /// `original_destination_connection_id` parameter.
    odcid: ConnectionId,

    /// The client CID we currently address it with.
    scid: ConnectionId,

    client_cids: ClientCids,

    /// Retry token we issued, echoed byte-for-byte by the next Initial.
    retry_token: Option<Vec<u8>>,
    in_retry: bool,
    addr_checked: bool,

    keys: Keys,
    key_phase: bool,
    tls_params_set: bool,
    client_tp_done: bool,
    handshake_done: bool,

    /// Our transport parameters, connection-adjusted.
    tp: TransportParameters,

    /// The client's transport parameters; sane defaults until seen.
    ctp: TransportParameters,

    spaces: [SendCtx; 3],
    crypto: [OrderedStream; ENCRYPTION_LEVELS],
    streams: Streams,

    rtt: crate::recovery::RttEstimator,
    congestion: crate::recovery::Congestion,
    pto_count: u32,
    amp: Amplification,

    error: Option<ConnectionError>,
    closing: bool,
    draining: bool,
    closed: bool,
    last_cc: Option<Instant>,

    // timers
    pto_deadline: Option<Instant>,
    pto_role: PtoRole,
    push_deadline: Option<Instant>,
    close_deadline: Option<Instant>,
    idle_deadline: Option<Instant>,

    events: VecDeque<Event>,
    out: Vec<Transmit>,
}

impl Connection {
    fn new(cfg: Config, peer: IpAddr, now: Instant, header: &Header) -> Self {
        let dcid = ConnectionId::random();
        let odcid = header.dcid.clone();
        let scid = header.scid.clone();

        let mut keys = Keys::new();
        keys.set_initial(odcid.as_bytes());

        let mut tp = cfg.transport_params.clone();
        tp.original_destination_connection_id = Some(odcid.clone());
        tp.initial_source_connection_id = Some(dcid.clone());
        if !cfg.sr_token_key.is_empty() {
            tp.stateless_reset_token =
                Some(token::stateless_reset_token(&cfg.sr_token_key, dcid.as_bytes()));
        }

        let ctp = TransportParameters {
            max_udp_payload_size: MAX_UDP_PAYLOAD_OUT as u64,
            ..TransportParameters::default()
        };

        let streams = Streams::new(&tp);
        let rtt = crate::recovery::RttEstimator::new(cfg.initial_rtt);
        let congestion = crate::recovery::Congestion::new(MAX_UDP_PAYLOAD_OUT, now);

        let version = header.version;

        debug!(%dcid, %odcid, version, "new connection");

        Self {
            cfg,
            peer,
            version,
            dcid,
            odcid,
            scid: scid.clone(),
            client_cids: ClientCids::new(Bytes::copy_from_slice(scid.as_bytes())),
            retry_token: None,
            in_retry: false,
            addr_checked: false,
            keys,
            key_phase: false,
            tls_params_set: false,
            client_tp_done: false,
            handshake_done: false,
            tp,
            ctp,
            spaces: [
                SendCtx::new(EncryptionLevel::Initial),
                SendCtx::new(EncryptionLevel::Handshake),
                SendCtx::new(EncryptionLevel::Application),
            ],
            crypto: Default::default(),
            streams,
            rtt,
            congestion,
            pto_count: 0,
            amp: Amplification::new(),
            error: None,
            closing: false,
            draining: false,
            closed: false,
            last_cc: None,
            pto_deadline: None,
            pto_role: PtoRole::Probe,
            push_deadline: None,
            close_deadline: None,
            idle_deadline: None,
            events: VecDeque::new(),
            out: Vec::new(),
        }
    }

    // ------------------------------------------------------------------
    // Public surface
    // ------------------------------------------------------------------

    /// Ingest one UDP datagram from the peer. Returns datagrams to send.
    pub fn handle_datagram(&mut self, now: Instant, datagram: Bytes) -> Vec<Transmit> {
        if self.closed {
            return Vec::new();
        }

        self.amp.on_received(datagram.len());

        let mut pos = 0usize;
        let mut good = false;

        while pos < datagram.len() {
            let chunk = datagram.slice(pos..);

            let header = match Header::parse(chunk, SERVER_CID_LENGTH) {
                Ok(header) => header,
                Err(_) => {
                    trace!("malformed packet header, datagram abandoned");
                    break;
                }
            };

            let consumed = header.packet.len();
            let is_datagram_start = pos == 0;

            match self.process_packet(now, header, &datagram, is_datagram_start) {
                Ok(true) => good = true,
                Ok(false) => {}
                Err(err) => {
                    self.record_error(err, "packet processing failed");
                    self.close_fault(now);
                    break;
                }
            }

            if self.closed || self.draining {
                break;
            }

            pos += consumed;

            // skip zero padding between coalesced packets
            while pos < datagram.len() && datagram[pos] == 0 {
                pos += 1;
            }
        }

        if good && !self.closing {
            self.arm_idle(now);
        }

        self.flush(now)
    }

    /// Drive timers; the host calls this once `poll_timeout` expires.
    pub fn on_timeout(&mut self, now: Instant) -> Vec<Transmit> {
        if self.closed {
            return Vec::new();
        }

        if let Some(deadline) = self.close_deadline {
            if deadline <= now {
                self.close_deadline = None;
                self.closed = true;
                debug!("closing period ended");
                return Vec::new();
            }
        }

        if let Some(deadline) = self.idle_deadline {
            if deadline <= now {
                self.idle_deadline = None;
                debug!("idle timeout");
                self.close_silent();
                return Vec::new();
            }
        }

        if let Some(deadline) = self.push_deadline {
            if deadline <= now {
                self.push_deadline = None;
            }
        }

        if let Some(deadline) = self.pto_deadline {
            if deadline <= now {
                self.pto_deadline = None;
                match self.pto_role {
                    PtoRole::Loss => self.detect_lost(now),
                    PtoRole::Probe => self.on_pto(now),
                }
            }
        }

        self.flush(now)
    }

    /// Earliest armed deadline and which logical timer it belongs to.
    pub fn poll_timeout(&self) -> Option<(super::TimerKind, Instant)> {
        use super::TimerKind;

        [
            (TimerKind::PtoOrLoss, self.pto_deadline),
            (TimerKind::Push, self.push_deadline),
            (TimerKind::Close, self.close_deadline),
            (TimerKind::Idle, self.idle_deadline),
        ]
        .into_iter()
        .filter_map(|(kind, deadline)| deadline.map(|d| (kind, d)))
        .min_by_key(|(_, deadline)| *deadline)
    }

    /// Next pending application event.
    pub fn poll_event(&mut self) -> Option<Event> {
        self.events.pop_front()
    }

    /// Flush queued frames into packets (after stream writes or reads).
    pub fn poll_transmit(&mut self, now: Instant) -> Vec<Transmit> {
        self.flush(now)
    }

    /// Open a server-initiated stream; `None` when the peer's limit is
    /// exhausted.
    pub fn open_stream(&mut self, bidi: bool) -> Option<StreamId> {
        if self.closing {
            return None;
        }
        self.streams.open_stream(bidi)
    }

    /// Read in-order stream bytes into `buf`.
    pub fn stream_recv(&mut self, id: StreamId, buf: &mut [u8]) -> StreamRecv {
        let Some(stream) = self.streams.get_mut(id) else {
            return StreamRecv::Error;
        };

        if stream.read_error {
            return StreamRecv::Error;
        }

        if stream.ring.is_empty() {
            if stream.pending_eof {
                return StreamRecv::Eof;
            }
            return StreamRecv::WouldBlock;
        }

        let n = stream.ring.read(buf);
        let pending_eof = stream.pending_eof;
        let limit = stream.recv_limit();

        if !pending_eof {
            self.queue_frame(
                EncryptionLevel::Application,
                Frame::MaxStreamData(MaxStreamDataFrame {
                    stream_id: id,
                    limit,
                }),
            );
        }

        if let Some(new_max) = self.streams.flow.on_consumed(n) {
            trace!(max_data = new_max, "connection receive window doubled");
            self.queue_frame(
                EncryptionLevel::Application,
                Frame::MaxData(MaxDataFrame { max_data: new_max }),
            );
        }

        StreamRecv::Data(n)
    }

    /// Queue stream data for sending; returns bytes accepted (flow and
    /// buffer limits may stop short).
    pub fn stream_send(&mut self, id: StreamId, data: &[u8], fin: bool) -> Result<usize> {
        let max_frame = self.max_stream_frame_size();
        let conn_allowance = self.streams.flow.send_allowance();

        let Some(stream) = self.streams.get_mut(id) else {
            return Err(Error::InternalError);
        };

        if stream.write_error || stream.fin_sent {
            return Err(Error::StreamStateError);
        }

        let mut consumed = 0usize;
        let mut frames = Vec::new();

        loop {
            let remaining = data.len() - consumed;
            let allowance = stream
                .send_allowance()
                .min(conn_allowance - (consumed as u64).min(conn_allowance));

            if remaining == 0 {
                break;
            }

            let n = (remaining as u64).min(max_frame as u64).min(allowance) as usize;
            if n == 0 {
                stream.write_blocked = true;
                break;
            }

            frames.push(StreamFrame {
                stream_id: id,
                offset: stream.sent,
                fin: false,
                data: Bytes::copy_from_slice(&data[consumed..consumed + n]),
            });

            stream.sent += n as u64;
            consumed += n;
        }

        let all_sent = consumed == data.len();
        if fin && all_sent {
            match frames.last_mut() {
                Some(last) => last.fin = true,
                None => frames.push(StreamFrame {
                    stream_id: id,
                    offset: stream.sent,
                    fin: true,
                    data: Bytes::new(),
                }),
            }
            stream.fin_sent = true;
        }

        self.streams.flow.sent += consumed as u64;

        for frame in frames {
            self.queue_frame(EncryptionLevel::Application, Frame::Stream(frame));
        }

        Ok(consumed)
    }

    /// Close a stream locally, releasing its state and notifying the
    /// peer (RFC 9000 Section 2.4).
    pub fn stream_close(&mut self, id: StreamId) {
        let Some(stream) = self.streams.remove(id) else {
            return;
        };

        if self.closing {
            return;
        }

        let uni = stream_is_unidirectional(id);
        let server_initiated = stream_is_server_initiated(id);

        // ask the peer to stop sending unless it already finished
        if !(server_initiated && uni) && !stream.pending_eof && !stream.read_error {
            self.queue_frame(
                EncryptionLevel::Application,
                Frame::StopSending(StopSendingFrame {
                    stream_id: id,
                    error_code: STOP_SENDING_APP_CODE,
                }),
            );
        }

        // a reaped client stream frees a slot in the advertised limit
        if !server_initiated {
            let limit = if uni {
                self.streams.client_max_streams_uni += 1;
                self.streams.client_max_streams_uni
            } else {
                self.streams.client_max_streams_bidi += 1;
                self.streams.client_max_streams_bidi
            };
            self.queue_frame(
                EncryptionLevel::Application,
                Frame::MaxStreams(MaxStreamsFrame { limit, bidi: !uni }),
            );

            if uni {
                // no send direction to finish
                return;
            }
        }

        if !stream.fin_sent && !stream.write_error {
            self.queue_frame(
                EncryptionLevel::Application,
                Frame::Stream(StreamFrame {
                    stream_id: id,
                    offset: stream.sent,
                    fin: true,
                    data: Bytes::new(),
                }),
            );
        }
    }

    /// Terminate with an application error (RFC 9000 Section 10.2).
    pub fn finalize(&mut self, now: Instant, code: u64, reason: &'static str) -> Vec<Transmit> {
        if self.error.is_none() {
            let mut error = ConnectionError::application(code, reason);
            error.level = self.write_level();

            // an application close cannot appear in handshake packets;
            // it degrades to APPLICATION_ERROR there (RFC 9000 12.5)
            if error.level != EncryptionLevel::Application {
                error.code = Error::ApplicationError.to_wire();
                error.app = false;
            }

            self.error = Some(error);
        }
        self.close_fault(now);
        self.flush(now)
    }

    /// Whether all state may be dropped.
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn is_closing(&self) -> bool {
        self.closing
    }

    pub fn is_draining(&self) -> bool {
        self.draining
    }

    /// Our current connection id, for host demultiplexing.
    pub fn local_cid(&self) -> &ConnectionId {
        &self.dcid
    }

    /// The original destination CID, for routing pre-handshake packets.
    pub fn original_dcid(&self) -> &ConnectionId {
        &self.odcid
    }

    // ------------------------------------------------------------------
    // Packet ingress
    // ------------------------------------------------------------------

    fn process_packet(
        &mut self,
        now: Instant,
        header: Header,
        datagram: &Bytes,
        is_datagram_start: bool,
    ) -> Result<bool> {
        let level = header.level();

        if header.ty == PacketType::Retry {
            // servers never receive Retry
            return Ok(false);
        }

        if level != EncryptionLevel::Application && header.version != self.version {
            debug!(version = header.version, "version mismatch, packet dropped");
            return Ok(false);
        }

        if !self.check_peer(&header) {
            if level == EncryptionLevel::Application {
                if is_datagram_start && self.detect_stateless_reset(datagram) {
                    warn!("stateless reset detected");
                    self.draining = true;
                    self.events.push_back(Event::Closed {
                        code: Error::NoError.to_wire(),
                        app: false,
                        reason: Bytes::new(),
                    });
                    self.close_graceful(now);
                    return Ok(true);
                }

                if let Some(reset) = build_stateless_reset(
                    &self.cfg.sr_token_key,
                    &header.dcid,
                    header.packet.len(),
                ) {
                    debug!("stateless reset sent");
                    self.amp.on_sent(reset.len());
                    self.out.push(Transmit { data: reset });
                }
            }
            return Ok(false);
        }

        if self.in_retry {
            if level != EncryptionLevel::Initial {
                debug!("late packet during retry, dropped");
                return Ok(false);
            }
            if header.token.is_empty() {
                debug!("post-retry initial without token, dropped");
                return Ok(false);
            }

            self.adopt_post_retry_identity(&header)?;

            match &self.retry_token {
                Some(expected) if expected[..] == header.token[..] => {
                    self.amp.validated = true;
                }
                _ => {
                    self.record_error(Error::InvalidToken, "invalid retry token");
                    return Err(Error::InvalidToken);
                }
            }
        } else if !self.addr_checked && level == EncryptionLevel::Initial {
            self.addr_checked = true;

            if !header.token.is_empty() {
                match self.check_address_token(&header.token) {
                    TokenCheck::Valid => self.amp.validated = true,
                    TokenCheck::Invalid => {
                        self.record_error(Error::InvalidToken, "invalid token");
                        return Err(Error::InvalidToken);
                    }
                    TokenCheck::Expired => {
                        if self.cfg.retry {
                            self.send_retry(now)?;
                            return Ok(true);
                        }
                    }
                }
            } else if self.cfg.retry {
                self.send_retry(now)?;
                return Ok(true);
            }
        }

        if !self.keys.available(level) {
            debug!(level = level.name(), "no keys yet, packet dropped");
            return Ok(false);
        }

        // remove header protection, decode pn, open the payload
        let space_idx = level.space();
        let mut packet = header.packet.to_vec();

        let read_keys = self.keys.read_keys(level)?;
        let (pn, pn_len, key_phase) = match packet::remove_protection(
            read_keys,
            &mut packet,
            header.pn_offset,
            self.spaces[space_idx].largest_pn,
        ) {
            Ok(res) => res,
            Err(_) => return Ok(false),
        };

        let payload_off = header.pn_offset + pn_len;
        let aad = &packet[..payload_off];
        let ciphertext = &packet[payload_off..];

        let mut key_update = false;
        let plaintext = if level == EncryptionLevel::Application
            && key_phase != self.key_phase
            && self.keys.next_read_keys().is_some()
        {
            match self
                .keys
                .next_read_keys()
                .expect("checked")
                .open(pn, aad, ciphertext)
            {
                Ok(plain) => {
                    key_update = true;
                    plain
                }
                Err(_) => {
                    trace!("decrypt failed under next keys, packet dropped");
                    return Ok(false);
                }
            }
        } else {
            match read_keys.open(pn, aad, ciphertext) {
                Ok(plain) => plain,
                Err(_) => {
                    trace!(level = level.name(), pn, "decrypt failed, packet dropped");
                    return Ok(false);
                }
            }
        };

        trace!(level = level.name(), pn, len = plaintext.len(), "packet rx");

        if self.spaces[space_idx].largest_pn == UNSET_PN
            || pn > self.spaces[space_idx].largest_pn
        {
            self.spaces[space_idx].largest_pn = pn;
        }

        if !self.tls_params_set {
            self.install_tls_params()?;
        }

        if level == EncryptionLevel::Handshake {
            // a handshake packet means the client processed our Initial;
            // Initial keys and context can go (RFC 9000 4.9.1), and the
            // address is implicitly validated (RFC 9000 8.1)
            self.discard_space(EncryptionLevel::Initial);
            self.amp.validated = true;
        }

        if key_update {
            debug!("key phase flipped, switching 1-RTT keys");
            self.key_phase = !self.key_phase;
            self.keys.switch()?;
        }

        self.handle_payload(now, level, Bytes::from(plaintext), pn)?;

        if key_update {
            // stage the following generation right away
            self.keys.update()?;
        }

        Ok(true)
    }

    /// Match the packet's CIDs against connection state
    /// (RFC 9000 Section 5.2).
    fn check_peer(&self, header: &Header) -> bool {
        let dcid_ok = if header.dcid == self.dcid {
            true
        } else {
            // client may still address the original DCID until it sees
            // an acknowledged Initial from us
            header.ty == PacketType::Initial
                && self.spaces[0].largest_ack == UNSET_PN
                && header.dcid == self.odcid
        };

        if !dcid_ok {
            return false;
        }

        if header.ty == PacketType::Short {
            return true;
        }

        self.client_cids.contains_id(header.scid.as_bytes())
    }

    /// Inbound stateless reset detection: the trailing 16 bytes of the
    /// datagram match a token the client advertised
    /// (RFC 9000 Section 10.3.1).
    fn detect_stateless_reset(&self, datagram: &Bytes) -> bool {
        if datagram.len() < MIN_PKT_LEN {
            return false;
        }
        let tail = &datagram[datagram.len() - SR_TOKEN_LEN..];
        self.client_cids
            .reset_tokens()
            .any(|token| token::token_matches(token, tail))
    }

    fn adopt_post_retry_identity(&mut self, header: &Header) -> Result<()> {
        // initial secrets restart from the DCID the client echoed
        self.odcid = header.dcid.clone();
        self.dcid = ConnectionId::random();
        self.tp.initial_source_connection_id = Some(self.dcid.clone());
        if !self.cfg.sr_token_key.is_empty() {
            self.tp.stateless_reset_token = Some(token::stateless_reset_token(
                &self.cfg.sr_token_key,
                self.dcid.as_bytes(),
            ));
        }

        self.keys = Keys::new();
        self.keys.set_initial(self.odcid.as_bytes());
        self.in_retry = false;

        debug!(dcid = %self.dcid, "post-retry identity adopted");
        Ok(())
    }

    fn check_address_token(&self, presented: &[u8]) -> TokenCheck {
        let Some(key) = &self.cfg.token_key else {
            return TokenCheck::Invalid;
        };
        TokenKey::new(key).check(
            presented,
            &self.peer,
            SystemTime::now(),
            self.cfg.retry_lifetime,
        )
    }

    fn send_retry(&mut self, now: Instant) -> Result<()> {
        let Some(key) = &self.cfg.token_key else {
            return Err(Error::InternalError);
        };

        let token = TokenKey::new(key).seal(&self.peer, SystemTime::now())?;

        let packet = packet::build_retry(self.version, &self.odcid, &self.scid, &self.dcid, &token);

        debug!(scid = %self.dcid, "retry sent");
        self.amp.on_sent(packet.len());
        self.out.push(Transmit { data: packet });

        self.retry_token = Some(token);
        self.tp.retry_source_connection_id = Some(self.dcid.clone());
        self.in_retry = true;
        self.idle_deadline = Some(now + crate::types::RETRY_TIMEOUT);

        Ok(())
    }

    // ------------------------------------------------------------------
    // Frame handling
    // ------------------------------------------------------------------

    fn handle_payload(
        &mut self,
        now: Instant,
        level: EncryptionLevel,
        payload: Bytes,
        pn: u64,
    ) -> Result<()> {
        if self.closing {
            // RFC 9000 10.2.1: only identify the packet and repeat the
            // CONNECTION_CLOSE, rate limited
            self.send_cc(now);
            return Ok(());
        }

        let mut parser = FrameParser::new(payload);
        let mut need_ack = false;
        let mut do_close: Option<ConnectionCloseFrame> = None;

        while let Some(frame) = parser.next_frame()? {
            if !frame.permitted_at(level) {
                warn!(ty = frame.wire_type(), level = level.name(), "frame not permitted");
                self.record_error_frame(Error::ProtocolViolation, frame.wire_type());
                return Err(Error::ProtocolViolation);
            }

            if frame.is_ack_eliciting() {
                need_ack = true;
            }

            match frame {
                Frame::Padding => {}
                Frame::Ack(ack) => self.handle_ack(now, level, ack)?,
                Frame::ConnectionClose(cc) => do_close = Some(cc),
                Frame::Crypto(f) => self.handle_crypto(now, level, f)?,
                Frame::Ping => {}
                Frame::Stream(f) => self.handle_stream(f)?,
                Frame::MaxData(f) => self.handle_max_data(f),
                Frame::MaxStreamData(f) => self.handle_max_stream_data(f)?,
                Frame::MaxStreams(f) => self.handle_max_streams(f),
                Frame::DataBlocked(_) => {
                    let max_data = self.streams.flow.recv_max_data;
                    self.queue_frame(level, Frame::MaxData(MaxDataFrame { max_data }));
                }
                Frame::StreamDataBlocked(f) => self.handle_stream_data_blocked(level, f)?,
                Frame::StreamsBlocked(_) => {}
                Frame::ResetStream(f) => self.handle_reset_stream(f)?,
                Frame::StopSending(f) => self.handle_stop_sending(f)?,
                Frame::PathChallenge(data) => {
                    self.queue_frame(level, Frame::PathResponse(data));
                }
                Frame::PathResponse(_) | Frame::RetireConnectionId(_) => {
                    // retirement of our own CIDs is not acted upon
                }
                Frame::NewConnectionId(f) => {
                    let limit = self.tp.active_connection_id_limit;
                    let mut retire = Vec::new();
                    match self.client_cids.handle_new_cid(&f, limit, &mut retire) {
                        Ok(preferred) => {
                            if let Some(id) = preferred {
                                self.scid = ConnectionId::new(id).ok_or(Error::ProtocolViolation)?;
                            }
                        }
                        Err(err) => {
                            self.record_error(err, "connection id handling failed");
                            return Err(err);
                        }
                    }
                    for frame in retire {
                        self.queue_frame(level, frame);
                    }
                }
                Frame::NewToken(_) => {
                    // a client never provides tokens (RFC 9000 19.7)
                    self.record_error_frame(Error::ProtocolViolation, 0x07);
                    return Err(Error::ProtocolViolation);
                }
                Frame::HandshakeDone => {
                    // server-only frame (RFC 9000 19.20)
                    self.record_error_frame(Error::ProtocolViolation, 0x1e);
                    return Err(Error::ProtocolViolation);
                }
            }
        }

        if let Some(cc) = do_close {
            debug!(code = cc.error_code, app = cc.app, "peer closed connection");
            self.draining = true;
            self.events.push_back(Event::Closed {
                code: cc.error_code,
                app: cc.app,
                reason: cc.reason.clone(),
            });
            self.close_graceful(now);
            return Ok(());
        }

        // track the packet for acknowledgment
        let space_idx = level.space();
        let exponent = self.ctp.ack_delay_exponent;
        let mut immediate = Vec::new();
        self.spaces[space_idx].ack_packet(pn, now, need_ack, exponent, &mut immediate);
        for frame in immediate {
            self.spaces[space_idx].frames.push_back(frame);
        }

        Ok(())
    }

    fn handle_ack(
        &mut self,
        now: Instant,
        level: EncryptionLevel,
        ack: crate::frames::AckFrame,
    ) -> Result<()> {
        let space_idx = level.space();

        let mut min = ack.largest - ack.first_range;
        let mut max = ack.largest;

        let send_time = self.handle_ack_range(space_idx, min, max)?;

        // RFC 9002 5.1: sample RTT when the largest is newly acked and
        // the newly acked set contains an ack-eliciting packet
        if self.spaces[space_idx].largest_ack == UNSET_PN
            || self.spaces[space_idx].largest_ack < max
        {
            self.spaces[space_idx].largest_ack = max;

            if let Some(sent) = send_time {
                let latest = now.saturating_duration_since(sent);
                let ack_delay = if level == EncryptionLevel::Application {
                    let micros = ack
                        .delay
                        .checked_shl(self.ctp.ack_delay_exponent as u32)
                        .unwrap_or(u64::MAX);
                    Duration::from_micros(micros)
                        .min(Duration::from_millis(self.ctp.max_ack_delay))
                } else {
                    Duration::ZERO
                };
                self.rtt.sample(latest, ack_delay);
                trace!(
                    latest_ms = latest.as_millis() as u64,
                    smoothed_ms = self.rtt.smoothed().as_millis() as u64,
                    "rtt sample"
                );
            }
        }

        for range in &ack.ranges {
            // parser already validated monotonicity
            max = min - range.gap - 2;
            min = max - range.range;
            self.handle_ack_range(space_idx, min, max)?;
        }

        self.detect_lost(now);
        Ok(())
    }

    /// Process one acknowledged packet-number range; returns the send
    /// time of the newest newly-acked ack-eliciting packet.
    fn handle_ack_range(
        &mut self,
        space_idx: usize,
        min: u64,
        max: u64,
    ) -> Result<Option<Instant>> {
        let mut found = false;
        let mut found_num = 0u64;
        let mut send_time = None;

        let mut i = self.spaces[space_idx].sent.len();
        while i > 0 {
            i -= 1;

            let record = &self.spaces[space_idx].sent[i];
            if record.pnum < min || record.pnum > max {
                continue;
            }

            let record = self.spaces[space_idx]
                .sent
                .remove(i)
                .expect("index in bounds");

            self.congestion.ack(record.plen, record.last);

            match &record.frame {
                Frame::Ack(acked) => {
                    self.spaces[space_idx].drop_ack_ranges(acked.largest);
                }
                Frame::Stream(f) => {
                    self.on_stream_acked(f.stream_id, f.data.len() as u64);
                }
                _ => {}
            }

            if !found || record.pnum > found_num {
                send_time = Some(record.last);
                found_num = record.pnum;
            }
            found = true;
        }

        if !found {
            if max < self.spaces[space_idx].pnum {
                // duplicate ACK or ACK of a non-ack-eliciting packet
                return Ok(None);
            }

            self.record_error_frame(Error::ProtocolViolation, 0x02);
            warn!(max, "ack for a packet never sent");
            return Err(Error::ProtocolViolation);
        }

        self.pto_count = 0;
        Ok(send_time)
    }

    fn on_stream_acked(&mut self, id: StreamId, len: u64) {
        let Some(stream) = self.streams.get_mut(id) else {
            return;
        };

        let was_starved = stream.sent - stream.acked >= crate::types::STREAM_BUFSIZE as u64;
        stream.acked = (stream.acked + len).min(stream.sent);

        if was_starved && stream.write_blocked {
            stream.write_blocked = false;
            self.events.push_back(Event::StreamWritable(id));
        }
    }

    fn handle_crypto(
        &mut self,
        now: Instant,
        level: EncryptionLevel,
        f: CryptoFrame,
    ) -> Result<()> {
        let idx = level as usize;

        if self.crypto[idx].exceeds_buffered(f.offset, f.data.len() as u64, MAX_BUFFERED) {
            self.record_error(Error::CryptoBufferExceeded, "crypto buffer exceeded");
            return Err(Error::CryptoBufferExceeded);
        }

        let mut fs = std::mem::take(&mut self.crypto[idx]);
        let mut sink = HandshakeSink::new();
        let tls = &mut self.cfg.tls;

        let outcome = fs.handle(f.offset, f.data, false, |data, _| {
            tls.read_handshake(level, &data, &mut sink)
        });
        self.crypto[idx] = fs;
        let outcome = outcome?;

        if outcome == Ordered::Duplicate && level == EncryptionLevel::Initial {
            // a duplicate initial suggests our flight was lost; resend
            // without waiting for PTO
            if !self.spaces[0].sent.is_empty() {
                self.resend_frames(0, now);
            }
            return Ok(());
        }

        self.drain_handshake_sink(now, sink)
    }

    fn drain_handshake_sink(&mut self, now: Instant, sink: HandshakeSink) -> Result<()> {
        for install in sink.secrets {
            let suite = CipherSuite::from_tls_id(install.suite)?;
            self.keys.set_secret(
                install.level,
                install.dir == SecretDir::Write,
                suite,
                install.secret,
            );
            trace!(level = install.level.name(), "secret installed");
        }

        if let Some(alert) = sink.alert {
            self.record_error(Error::Crypto(alert), "tls alert");
            return Err(Error::Crypto(alert));
        }

        if !self.client_tp_done {
            let raw = self.cfg.tls.peer_transport_params().map(<[u8]>::to_vec);
            if let Some(raw) = raw {
                self.apply_peer_params(&raw)?;
            }
        }

        for (level, data) in sink.outgoing {
            self.queue_crypto(level, data);
        }

        if sink.complete && !self.handshake_done {
            self.on_handshake_complete(now)?;
        }

        Ok(())
    }

    fn apply_peer_params(&mut self, raw: &[u8]) -> Result<()> {
        if self.cfg.require_alpn && self.cfg.tls.alpn_protocol().is_none() {
            // no_application_protocol(120)
            self.record_error(Error::Crypto(120), "no protocol in ALPN extension");
            return Err(Error::Crypto(120));
        }

        let mut ctp = TransportParameters::decode(raw).map_err(|_| {
            self.record_error(
                Error::TransportParameterError,
                "failed to process transport parameters",
            );
            Error::TransportParameterError
        })?;

        // the effective idle timeout is the smaller advertised one
        if ctp.max_idle_timeout > 0 && ctp.max_idle_timeout < self.tp.max_idle_timeout {
            self.tp.max_idle_timeout = ctp.max_idle_timeout;
        }

        if ctp.max_udp_payload_size < MIN_INITIAL_SIZE as u64
            || ctp.max_udp_payload_size > MAX_UDP_PAYLOAD_SIZE as u64
        {
            self.record_error(Error::TransportParameterError, "invalid maximum packet size");
            return Err(Error::TransportParameterError);
        }
        if ctp.max_udp_payload_size > MAX_UDP_PAYLOAD_OUT as u64 {
            ctp.max_udp_payload_size = MAX_UDP_PAYLOAD_OUT as u64;
        }

        match &ctp.initial_source_connection_id {
            Some(cid) if cid.as_bytes() == self.scid.as_bytes() => {}
            _ => {
                self.record_error(
                    Error::TransportParameterError,
                    "initial_source_connection_id mismatch",
                );
                return Err(Error::TransportParameterError);
            }
        }

        self.streams.apply_peer_params(&ctp);
        self.ctp = ctp;
        self.client_tp_done = true;

        debug!("peer transport parameters applied");
        Ok(())
    }

    fn on_handshake_complete(&mut self, now: Instant) -> Result<()> {
        debug!("handshake completed");
        self.handshake_done = true;

        self.queue_frame(EncryptionLevel::Application, Frame::HandshakeDone);

        // hand out a token for future connections from this address
        if self.cfg.retry {
            if let Some(key) = &self.cfg.token_key {
                let token = TokenKey::new(key).seal(&self.peer, SystemTime::now())?;
                self.queue_frame(
                    EncryptionLevel::Application,
                    Frame::NewToken(NewTokenFrame {
                        token: Bytes::from(token),
                    }),
                );
            }
        }

        // stage the next key generation before any update arrives
        self.keys.update()?;

        // handshake confirmation discards handshake keys (RFC 9001 4.9.2)
        self.discard_space(EncryptionLevel::Handshake);

        let _ = now;
        self.events.push_back(Event::HandshakeComplete);
        Ok(())
    }

    fn handle_stream(&mut self, f: StreamFrame) -> Result<()> {
        if stream_is_unidirectional(f.stream_id) && stream_is_server_initiated(f.stream_id) {
            self.record_error(Error::StreamStateError, "stream in wrong direction");
            return Err(Error::StreamStateError);
        }

        let last = f.offset + f.data.len() as u64;

        match self.open_peer_stream(f.stream_id)? {
            None => return Ok(()), // gone
            Some(()) => {}
        }

        // connection-level flow accounting over the highest seen offsets
        let delta = {
            let stream = self.streams.get_mut(f.stream_id).expect("opened above");
            if last > stream.rx_highwater {
                let delta = last - stream.rx_highwater;
                stream.rx_highwater = last;
                delta
            } else {
                0
            }
        };
        if delta > 0 {
            self.streams.flow.received_highwater += delta;
            if self.streams.flow.received_highwater > self.streams.flow.recv_max_data {
                self.record_error(Error::FlowControlError, "connection flow control overrun");
                return Err(Error::FlowControlError);
            }
        }

        let stream = self.streams.get_mut(f.stream_id).expect("opened above");

        // stream window: data beyond the edge must fit the ring
        let window = stream.ring.free_space() as u64;
        if last > stream.rx.received && last - stream.rx.received > window {
            self.record_error(Error::FlowControlError, "stream flow control overrun");
            return Err(Error::FlowControlError);
        }

        let ring = &mut stream.ring;
        let pending_eof = &mut stream.pending_eof;
        let result = stream.rx.handle(f.offset, f.data, f.fin, |data, fin| {
            ring.write(&data)?;
            if fin {
                *pending_eof = true;
            }
            Ok(())
        });

        match result {
            Ok(_) => {
                if stream.readable() {
                    self.events.push_back(Event::StreamReadable(f.stream_id));
                }
                Ok(())
            }
            Err(err) => {
                self.record_error(err, "stream receive failed");
                Err(err)
            }
        }
    }

    /// Ensure a peer-referenced stream exists, firing open events.
    /// Returns `None` when the stream is long gone.
    fn open_peer_stream(&mut self, id: StreamId) -> Result<Option<()>> {
        match self.streams.create_peer_stream(id) {
            Ok(OpenOutcome::Existing) => Ok(Some(())),
            Ok(OpenOutcome::Gone) => Ok(None),
            Ok(OpenOutcome::Opened(ids)) => {
                for opened in ids {
                    self.events.push_back(Event::StreamOpened(opened));
                }
                Ok(Some(()))
            }
            Err(err) => {
                self.record_error(err, "stream admission failed");
                Err(err)
            }
        }
    }

    fn handle_max_data(&mut self, f: MaxDataFrame) {
        if self.streams.flow.on_max_data(f.max_data) {
            // the connection window reopened: wake blocked writers
            let ids: Vec<StreamId> = self.streams.ids();
            for id in ids {
                if let Some(stream) = self.streams.get_mut(id) {
                    if stream.write_blocked {
                        stream.write_blocked = false;
                        self.events.push_back(Event::StreamWritable(id));
                    }
                }
            }
        }
    }

    fn handle_max_stream_data(&mut self, f: MaxStreamDataFrame) -> Result<()> {
        if stream_is_unidirectional(f.stream_id) && !stream_is_server_initiated(f.stream_id) {
            self.record_error(Error::StreamStateError, "max_stream_data in wrong direction");
            return Err(Error::StreamStateError);
        }

        if self.open_peer_stream(f.stream_id)?.is_none() {
            return Ok(());
        }

        let stream = self.streams.get_mut(f.stream_id).expect("opened above");
        if f.limit <= stream.send_max_data {
            return Ok(());
        }

        let was_blocked = stream.sent >= stream.send_max_data;
        stream.send_max_data = f.limit;

        if was_blocked {
            stream.write_blocked = false;
            self.events.push_back(Event::StreamWritable(f.stream_id));
        }
        Ok(())
    }

    fn handle_max_streams(&mut self, f: MaxStreamsFrame) {
        if f.bidi {
            if self.streams.server_max_streams_bidi < f.limit {
                self.streams.server_max_streams_bidi = f.limit;
                debug!(limit = f.limit, "max_streams_bidi");
            }
        } else if self.streams.server_max_streams_uni < f.limit {
            self.streams.server_max_streams_uni = f.limit;
            debug!(limit = f.limit, "max_streams_uni");
        }
    }

    fn handle_stream_data_blocked(
        &mut self,
        level: EncryptionLevel,
        f: crate::frames::StreamDataBlockedFrame,
    ) -> Result<()> {
        if stream_is_unidirectional(f.stream_id) && stream_is_server_initiated(f.stream_id) {
            self.record_error(Error::StreamStateError, "stream_data_blocked in wrong direction");
            return Err(Error::StreamStateError);
        }

        if self.open_peer_stream(f.stream_id)?.is_none() {
            return Ok(());
        }

        let stream = self.streams.get(f.stream_id).expect("opened above");
        let limit = stream.recv_limit();
        self.queue_frame(
            level,
            Frame::MaxStreamData(MaxStreamDataFrame {
                stream_id: f.stream_id,
                limit,
            }),
        );
        Ok(())
    }

    fn handle_reset_stream(&mut self, f: crate::frames::ResetStreamFrame) -> Result<()> {
        if stream_is_unidirectional(f.stream_id) && stream_is_server_initiated(f.stream_id) {
            self.record_error(Error::StreamStateError, "reset for send-only stream");
            return Err(Error::StreamStateError);
        }

        if self.open_peer_stream(f.stream_id)?.is_none() {
            return Ok(());
        }

        let stream = self.streams.get_mut(f.stream_id).expect("opened above");
        stream.read_error = true;
        self.events
            .push_back(Event::StreamReset(f.stream_id, f.error_code));
        Ok(())
    }

    fn handle_stop_sending(&mut self, f: StopSendingFrame) -> Result<()> {
        if stream_is_unidirectional(f.stream_id) && !stream_is_server_initiated(f.stream_id) {
            self.record_error(Error::StreamStateError, "stop_sending for receive-only stream");
            return Err(Error::StreamStateError);
        }

        if self.open_peer_stream(f.stream_id)?.is_none() {
            return Ok(());
        }

        let stream = self.streams.get_mut(f.stream_id).expect("opened above");
        stream.write_error = true;
        self.events
            .push_back(Event::StreamStopped(f.stream_id, f.error_code));
        Ok(())
    }

    // ------------------------------------------------------------------
    // TLS plumbing
    // ------------------------------------------------------------------

    fn install_tls_params(&mut self) -> Result<()> {
        let mut encoded = BytesMut::new();
        self.tp.encode(&mut encoded);
        self.cfg.tls.set_transport_params(&encoded)?;
        self.tls_params_set = true;
        Ok(())
    }

    /// Chunk outgoing TLS bytes into CRYPTO frames sized to fit packets.
    fn queue_crypto(&mut self, level: EncryptionLevel, data: Vec<u8>) {
        let limit =
            self.ctp.max_udp_payload_size as usize - MAX_LONG_HEADER - 17 - TAG_LEN;
        let idx = level as usize;

        let mut data = Bytes::from(data);
        while !data.is_empty() {
            let n = data.len().min(limit);
            let chunk = data.split_to(n);

            let offset = self.crypto[idx].sent;
            self.crypto[idx].sent += chunk.len() as u64;

            self.queue_frame(
                level,
                Frame::Crypto(CryptoFrame {
                    offset,
                    data: chunk,
                }),
            );
        }
    }

    // ------------------------------------------------------------------
    // Loss detection, PTO, retransmission
    // ------------------------------------------------------------------

    /// Walk every space's in-flight queue oldest-first and declare
    /// losses by packet and time thresholds (RFC 9002 Section 6.1).
    fn detect_lost(&mut self, now: Instant) {
        let rtt_max = self.rtt.latest().max(self.rtt.smoothed());
        let thr = rtt_max
            .mul_f64(self.cfg.time_threshold)
            .max(self.cfg.time_granularity);

        let mut min_wait: Option<Duration> = None;

        for space_idx in 0..3 {
            if self.spaces[space_idx].largest_ack == UNSET_PN {
                continue;
            }

            loop {
                let Some(front) = self.spaces[space_idx].sent.front() else {
                    break;
                };

                if front.pnum > self.spaces[space_idx].largest_ack {
                    break;
                }

                let deadline = front.last + thr;

                if deadline > now
                    && self.spaces[space_idx].largest_ack - front.pnum
                        < self.cfg.pkt_threshold
                {
                    let wait = deadline - now;
                    min_wait = Some(match min_wait {
                        Some(current) => current.min(wait),
                        None => wait,
                    });
                    break;
                }

                debug!(
                    pnum = front.pnum,
                    space = space_idx,
                    "packet declared lost"
                );
                self.resend_frames(space_idx, now);
            }
        }

        match min_wait {
            Some(wait) => {
                self.pto_role = PtoRole::Loss;
                self.pto_deadline = Some(now + wait);
            }
            None => {
                self.pto_role = PtoRole::Probe;

                // nothing in flight anywhere: no probe to schedule
                if self.spaces.iter().all(|space| space.sent.is_empty()) {
                    self.pto_deadline = None;
                }
            }
        }
    }

    /// PTO fired: back off and resend the oldest unacknowledged packet
    /// of every space (RFC 9002 Section 6.2.4).
    fn on_pto(&mut self, now: Instant) {
        self.pto_count += 1;
        debug!(pto_count = self.pto_count, "probe timeout");

        for space_idx in 0..3 {
            let Some(front) = self.spaces[space_idx].sent.front() else {
                continue;
            };

            if self.spaces[space_idx].largest_ack != UNSET_PN
                && front.pnum <= self.spaces[space_idx].largest_ack
            {
                continue;
            }

            self.resend_frames(space_idx, now);
        }
    }

    /// Reinject the frames of the oldest in-flight packet
    /// (frame-level retransmission, RFC 9000 Section 13.3).
    fn resend_frames(&mut self, space_idx: usize, now: Instant) {
        let Some(front) = self.spaces[space_idx].sent.front() else {
            return;
        };
        let pnum = front.pnum;

        self.congestion.lost(front.plen, front.last, now);

        while let Some(front) = self.spaces[space_idx].sent.front() {
            if front.pnum != pnum {
                break;
            }
            let record = self.spaces[space_idx].sent.pop_front().expect("front");

            match record.frame {
                Frame::Ack(_) => {
                    // regenerate the current acknowledgment instead
                    self.spaces[space_idx].send_ack = crate::types::MAX_ACK_GAP;
                }
                Frame::Ping | Frame::PathResponse(_) | Frame::ConnectionClose(_) => {}
                Frame::MaxData(_) => {
                    let max_data = self.streams.flow.recv_max_data;
                    self.spaces[space_idx]
                        .frames
                        .push_back(Frame::MaxData(MaxDataFrame { max_data }));
                }
                Frame::MaxStreams(f) => {
                    let limit = if f.bidi {
                        self.streams.client_max_streams_bidi
                    } else {
                        self.streams.client_max_streams_uni
                    };
                    self.spaces[space_idx]
                        .frames
                        .push_back(Frame::MaxStreams(MaxStreamsFrame { limit, bidi: f.bidi }));
                }
                Frame::MaxStreamData(f) => match self.streams.get(f.stream_id) {
                    Some(stream) => {
                        let limit = f.limit.max(stream.recv_limit());
                        self.spaces[space_idx].frames.push_back(Frame::MaxStreamData(
                            MaxStreamDataFrame {
                                stream_id: f.stream_id,
                                limit,
                            },
                        ));
                    }
                    None => {}
                },
                Frame::Stream(f) => {
                    match self.streams.get(f.stream_id) {
                        // a reset or locally closed stream stops retransmitting
                        Some(stream) if !stream.write_error => {
                            self.spaces[space_idx].frames.push_back(Frame::Stream(f));
                        }
                        _ => {}
                    }
                }
                frame => {
                    self.spaces[space_idx].frames.push_back(frame);
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Packetization
    // ------------------------------------------------------------------

    fn queue_frame(&mut self, level: EncryptionLevel, frame: Frame) {
        if self.draining {
            return;
        }
        self.spaces[level.space()].frames.push_back(frame);
    }

    fn max_stream_frame_size(&self) -> usize {
        self.ctp.max_udp_payload_size as usize - MAX_SHORT_HEADER - 25 - TAG_LEN
    }

    /// The level CONNECTION_CLOSE goes out at.
    fn write_level(&self) -> EncryptionLevel {
        if self.handshake_done && self.keys.available(EncryptionLevel::Application) {
            EncryptionLevel::Application
        } else if self.keys.available(EncryptionLevel::Handshake) {
            EncryptionLevel::Handshake
        } else {
            EncryptionLevel::Initial
        }
    }

    fn arm_idle(&mut self, now: Instant) {
        if self.in_retry {
            self.idle_deadline = Some(now + crate::types::RETRY_TIMEOUT);
            return;
        }

        // zero disables the idle timeout (RFC 9000 10.1)
        if self.tp.max_idle_timeout == 0 {
            self.idle_deadline = None;
            return;
        }

        self.idle_deadline = Some(now + Duration::from_millis(self.tp.max_idle_timeout));
    }

    fn pto_for_space(&self, space_idx: usize) -> Duration {
        let mad = if space_idx == 2 && self.handshake_done && self.congestion.in_flight > 0 {
            Some(Duration::from_millis(self.ctp.max_ack_delay))
        } else {
            None
        };
        self.rtt.pto(self.pto_count, mad, self.cfg.time_granularity)
    }

    /// Flush delayed ACKs and queued frames into sealed packets.
    fn flush(&mut self, now: Instant) -> Vec<Transmit> {
        if self.draining || self.closed {
            return std::mem::take(&mut self.out);
        }

        for space_idx in 0..3 {
            let level = match space_idx {
                0 => EncryptionLevel::Initial,
                1 => EncryptionLevel::Handshake,
                _ => EncryptionLevel::Application,
            };
            if !self.keys.available(level) {
                // discarded space: whatever is queued will never be sent
                continue;
            }

            if self.spaces[space_idx].send_ack > 0 {
                let mut flush_now = true;

                if space_idx == 2 && !self.closing {
                    let started = self.spaces[space_idx]
                        .ack_delay_start
                        .unwrap_or(now);
                    let delay = now.saturating_duration_since(started);
                    let max_ack_delay = Duration::from_millis(self.ctp.max_ack_delay);

                    if self.spaces[space_idx].send_ack < crate::types::MAX_ACK_GAP
                        && delay < max_ack_delay
                    {
                        if self.push_deadline.is_none() {
                            self.push_deadline = Some(started + max_ack_delay);
                        }
                        flush_now = false;
                    }
                }

                if flush_now {
                    let exponent = self.ctp.ack_delay_exponent;
                    if let Some(frame) = self.spaces[space_idx].make_ack(now, exponent) {
                        self.spaces[space_idx].frames.push_back(frame);
                    }
                    self.spaces[space_idx].send_ack = 0;
                }
            }

            self.output_space(space_idx, now);
        }

        if !self.out.is_empty() && !self.closing {
            self.arm_idle(now);
        }

        std::mem::take(&mut self.out)
    }

    fn output_space(&mut self, space_idx: usize, now: Instant) {
        let level = match space_idx {
            0 => EncryptionLevel::Initial,
            1 => EncryptionLevel::Handshake,
            _ => EncryptionLevel::Application,
        };

        if !self.keys.available(level) {
            return;
        }

        let header_overhead = if space_idx == 2 {
            MAX_SHORT_HEADER
        } else {
            MAX_LONG_HEADER
        } + TAG_LEN
            - (MAX_CID_LENGTH - self.scid.len());

        loop {
            let mut len = 0usize;
            let mut need_ack = false;
            let mut batch = Vec::new();

            while let Some(frame) = self.spaces[space_idx].frames.front() {
                let flen = frame.wire_len();

                if len > 0
                    && header_overhead + len + flen > self.ctp.max_udp_payload_size as usize
                {
                    break;
                }

                let would_need_ack = need_ack || frame.is_ack_eliciting();

                if would_need_ack && !self.congestion.fits(len + flen) {
                    trace!("congestion window full");
                    break;
                }

                // RFC 9000 8.1: at most 3x received before validation;
                // an Initial packet will be padded to the minimum size
                let outgoing = if space_idx == 0 {
                    MIN_INITIAL_SIZE
                } else {
                    header_overhead + len + flen
                };
                if !self.amp.allows(outgoing) {
                    debug!(
                        received = self.amp.received,
                        sent = self.amp.sent,
                        "amplification limit"
                    );
                    break;
                }

                need_ack = would_need_ack;
                len += flen;
                batch.push(self.spaces[space_idx].frames.pop_front().expect("front"));
            }

            if batch.is_empty() {
                break;
            }

            self.seal_packet(space_idx, level, batch, need_ack, now);
        }
    }

    fn seal_packet(
        &mut self,
        space_idx: usize,
        level: EncryptionLevel,
        batch: Vec<Frame>,
        need_ack: bool,
        now: Instant,
    ) {
        let pn = self.spaces[space_idx].pnum;
        let (trunc, pn_len) =
            encode_packet_number(pn, self.spaces[space_idx].largest_ack);

        let mut payload = BytesMut::new();
        for frame in &batch {
            trace!(level = level.name(), pn, ty = frame.wire_type(), "frame tx");
            frame.encode(&mut payload);
        }

        // Initial packets carrying ack-eliciting frames pad the datagram
        // to 1200 bytes (RFC 9000 14.1); other packets pad enough for
        // header protection sampling.
        let pad_target = if space_idx == 0 && need_ack {
            MIN_INITIAL_SIZE
                - TAG_LEN
                - packet::long_header_len(PacketType::Initial, &self.scid, &self.dcid)
                - pn_len
        } else {
            4
        };
        if payload.len() < pad_target {
            payload.resize(pad_target, 0);
        }

        let mut buf = BytesMut::with_capacity(
            payload.len() + MAX_LONG_HEADER + pn_len + TAG_LEN,
        );
        let pn_offset = match level {
            EncryptionLevel::Initial => packet::build_long_header(
                &mut buf,
                PacketType::Initial,
                self.version,
                &self.scid,
                &self.dcid,
                pn_len + payload.len() + TAG_LEN,
                pn_len,
            ),
            EncryptionLevel::Handshake => packet::build_long_header(
                &mut buf,
                PacketType::Handshake,
                self.version,
                &self.scid,
                &self.dcid,
                pn_len + payload.len() + TAG_LEN,
                pn_len,
            ),
            _ => packet::build_short_header(&mut buf, &self.scid, self.key_phase, pn_len),
        };

        for i in (0..pn_len).rev() {
            buf.extend_from_slice(&[(trunc >> (8 * i)) as u8]);
        }

        let write_keys = match self.keys.write_keys(level) {
            Ok(keys) => keys,
            Err(_) => return,
        };

        let sealed = write_keys.seal(pn, &buf, &payload);

        let mut packet = buf.to_vec();
        packet.extend_from_slice(&sealed);

        if packet::apply_protection(write_keys, &mut packet, pn_offset, pn_len).is_err() {
            return;
        }

        trace!(
            level = level.name(),
            pn,
            bytes = packet.len(),
            need_ack,
            "packet tx"
        );

        self.spaces[space_idx].pnum += 1;
        self.amp.on_sent(packet.len());

        if need_ack && !self.closing {
            let plen = packet.len();
            self.congestion.on_sent(plen);

            for (i, frame) in batch.into_iter().enumerate() {
                self.spaces[space_idx].sent.push_back(FrameRecord {
                    frame,
                    pnum: pn,
                    last: now,
                    first: now,
                    plen: if i == 0 { plen } else { 0 },
                });
            }

            self.pto_role = PtoRole::Probe;
            self.pto_deadline = Some(now + self.pto_for_space(space_idx));
        }

        self.out.push(Transmit { data: packet });
    }

    // ------------------------------------------------------------------
    // Close and drain
    // ------------------------------------------------------------------

    fn record_error(&mut self, err: Error, reason: &'static str) {
        if self.error.is_none() {
            self.error = Some(ConnectionError::transport(err, self.write_level(), reason));
        }
    }

    fn record_error_frame(&mut self, err: Error, frame_type: u64) {
        if self.error.is_none() {
            let mut error = ConnectionError::transport(err, self.write_level(), "");
            error.frame_type = frame_type;
            self.error = Some(error);
        }
    }

    /// Queue a CONNECTION_CLOSE at the error level, rate limited while
    /// closing (RFC 9000 Section 10.2.1).
    fn send_cc(&mut self, now: Instant) {
        if self.draining {
            return;
        }

        if self.closing {
            if let Some(last) = self.last_cc {
                if now.saturating_duration_since(last) < self.cfg.cc_min_interval {
                    return;
                }
            }
        }

        let error = self
            .error
            .clone()
            .unwrap_or_else(|| ConnectionError::transport(Error::NoError, self.write_level(), ""));

        let frame = Frame::ConnectionClose(ConnectionCloseFrame {
            error_code: error.code,
            frame_type: error.frame_type,
            reason: Bytes::from_static(error.reason.as_bytes()),
            app: error.app,
        });

        self.spaces[error.level.space()].frames.push_back(frame.clone());

        // clients without handshake keys still need to hear the close
        if error.level == EncryptionLevel::Handshake
            && self.keys.available(EncryptionLevel::Initial)
        {
            self.spaces[0].frames.push_back(frame);
        }

        self.last_cc = Some(now);
    }

    fn enter_closing(&mut self) {
        if self.closing {
            return;
        }
        self.closing = true;

        // in-flight packets will never be acknowledged now
        for space_idx in 0..3 {
            while let Some(record) = self.spaces[space_idx].sent.pop_front() {
                self.congestion.forget(record.plen);
            }
        }

        for stream in self.streams.iter_mut() {
            stream.read_error = true;
            stream.write_error = true;
        }

        self.push_deadline = None;
        self.pto_deadline = None;
    }

    /// Silent termination: idle timeout. No CONNECTION_CLOSE is emitted.
    fn close_silent(&mut self) {
        self.enter_closing();
        self.closed = true;
        self.events.push_back(Event::Closed {
            code: Error::NoError.to_wire(),
            app: false,
            reason: Bytes::new(),
        });
    }

    /// Graceful close (local shutdown or peer CONNECTION_CLOSE):
    /// CONNECTION_CLOSE goes out (unless draining) and the connection
    /// lingers for 3 PTO answering stray packets.
    fn close_graceful(&mut self, now: Instant) {
        let was_closing = self.closing;
        self.enter_closing();

        if !was_closing {
            if self.error.is_none() {
                self.error = Some(ConnectionError::transport(
                    Error::NoError,
                    self.write_level(),
                    "",
                ));
            }

            let level = self.error.as_ref().expect("just set").level;
            self.close_deadline = Some(now + 3 * self.pto_for_space(level.space()));

            self.send_cc(now);

            if !self.draining {
                self.events.push_back(Event::Closed {
                    code: self.error.as_ref().expect("set").code,
                    app: self.error.as_ref().expect("set").app,
                    reason: Bytes::new(),
                });
            }
        }
    }

    /// Fatal close: emit CONNECTION_CLOSE once and terminate without a
    /// linger period.
    fn close_fault(&mut self, now: Instant) {
        let was_closing = self.closing;
        self.enter_closing();

        if !was_closing {
            if self.error.is_none() {
                self.error = Some(ConnectionError::transport(
                    Error::InternalError,
                    self.write_level(),
                    "",
                ));
            }

            self.send_cc(now);

            let error = self.error.as_ref().expect("set");
            debug!(code = error.code, app = error.app, reason = error.reason, "fatal close");
            self.events.push_back(Event::Closed {
                code: error.code,
                app: error.app,
                reason: Bytes::from_static(error.reason.as_bytes()),
            });
        }

        // flush the close frame, then the connection is gone
        let transmits = self.flush(now);
        self.out = transmits;
        self.closed = true;
    }

    /// Discard a level's keys and its send context
    /// (RFC 9000 Section 4.9).
    fn discard_space(&mut self, level: EncryptionLevel) {
        if !self.keys.available(level) {
            return;
        }

        debug!(level = level.name(), "keys discarded");
        self.keys.discard(level);
        self.pto_count = 0;

        let space_idx = level.space();
        while let Some(record) = self.spaces[space_idx].sent.pop_front() {
            self.congestion.ack(record.plen, record.last);
        }
        self.spaces[space_idx].frames.clear();
        self.spaces[space_idx].send_ack = 0;
    }
}
