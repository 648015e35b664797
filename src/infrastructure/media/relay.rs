//! Per-call RTP relay
//!
//! A session owns one allocated port pair: the RTP socket (even port) and
//! its RTCP companion (odd). Both call legs talk to the same sockets; the
//! caller and callee remotes are told apart by source address. A leg's
//! remote starts NIL and is pinned by the first inbound packet carrying an
//! acceptable payload type (symmetric RTP); packets from other addresses
//! are dropped and counted. Outbound traffic towards an unpinned leg is
//! queued. Telephone-event packets from the caller are forwarded and also
//! copied into the owning call's DTMF queue.

use std::collections::VecDeque;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicU16, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;
use bytes::Bytes;
use rand::Rng;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};
use uuid::Uuid;

use super::port_pool::PortPair;
use super::rtp::{RtpPacket, TelephoneEvent};
use crate::{DomainError, Result};

/// Packets buffered per leg while its remote is unpinned
const PENDING_CAP: usize = 50;

/// Session lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    New,
    Active,
    Stopped,
    Released,
}

/// Which side of the call a packet belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LegSide {
    Caller,
    Callee,
}

/// Per-session counters; process totals go through the metrics registry.
#[derive(Debug, Default)]
pub struct SessionStats {
    pub packets_forwarded: AtomicU64,
    pub packets_dropped: AtomicU64,
    pub bytes_forwarded: AtomicU64,
}

#[derive(Default)]
struct LegState {
    /// Pinned remote, NIL until the first acceptable inbound packet
    remote: Mutex<Option<SocketAddr>>,
    /// Expected remote IP from SDP, used only to classify first packets
    hint_ip: Mutex<Option<IpAddr>>,
    /// Outbound datagrams awaiting the pin
    pending: Mutex<VecDeque<Vec<u8>>>,
    rtcp_remote: Mutex<Option<SocketAddr>>,
}

/// Sequence/timestamp state for RTP the PBX originates (prompt playback).
pub struct RtpStream {
    ssrc: u32,
    sequence: AtomicU16,
    timestamp: AtomicU32,
}

impl RtpStream {
    pub fn new() -> Self {
        let mut rng = rand::thread_rng();
        Self {
            ssrc: rng.gen(),
            sequence: AtomicU16::new(rng.gen()),
            timestamp: AtomicU32::new(rng.gen()),
        }
    }

    /// Build the next packet for a 20 ms frame (160 samples at 8 kHz).
    pub fn next_packet(&self, payload_type: u8, payload: Bytes) -> RtpPacket {
        let sequence = self.sequence.fetch_add(1, Ordering::Relaxed);
        let timestamp = self.timestamp.fetch_add(160, Ordering::Relaxed);
        RtpPacket::new(payload_type, sequence, timestamp, self.ssrc, payload)
    }
}

impl Default for RtpStream {
    fn default() -> Self {
        Self::new()
    }
}

/// One relayed call's media session
pub struct MediaSession {
    pub id: Uuid,
    pub call_id: String,
    pair: PortPair,
    rtp_socket: Arc<UdpSocket>,
    rtcp_socket: Arc<UdpSocket>,
    caller: Arc<LegState>,
    callee: Arc<LegState>,
    allowed_payloads: Vec<u8>,
    telephone_event_pt: u8,
    dtmf_tx: Option<mpsc::Sender<char>>,
    /// When set, caller-leg audio is delivered here (voicemail recording)
    /// instead of being queued for an unpinned callee.
    local_tap: Arc<Mutex<Option<mpsc::Sender<RtpPacket>>>>,
    /// Digits pressed by the callee leg (follow-me answer confirmation)
    callee_dtmf: Arc<Mutex<Option<mpsc::Sender<char>>>>,
    /// Copies caller audio without diverting it (call recording)
    record_tap: Arc<Mutex<Option<mpsc::Sender<RtpPacket>>>>,
    stream: RtpStream,
    stats: Arc<SessionStats>,
    state_tx: watch::Sender<SessionState>,
    state_rx: watch::Receiver<SessionState>,
    last_activity: Arc<Mutex<Instant>>,
}

impl MediaSession {
    pub async fn bind(
        call_id: String,
        pair: PortPair,
        allowed_payloads: Vec<u8>,
        telephone_event_pt: u8,
        dtmf_tx: Option<mpsc::Sender<char>>,
    ) -> Result<Self> {
        let rtp_socket = UdpSocket::bind(("0.0.0.0", pair.rtp))
            .await
            .map_err(|e| DomainError::Transient(format!("bind RTP port {}: {}", pair.rtp, e)))?;
        // port 0 means "any"; keep the companion ephemeral too
        let rtcp_port = if pair.rtp == 0 { 0 } else { pair.rtcp() };
        let rtcp_socket = UdpSocket::bind(("0.0.0.0", rtcp_port))
            .await
            .map_err(|e| DomainError::Transient(format!("bind RTCP port {}: {}", rtcp_port, e)))?;
        let (state_tx, state_rx) = watch::channel(SessionState::New);
        Ok(Self {
            id: Uuid::new_v4(),
            call_id,
            pair,
            rtp_socket: Arc::new(rtp_socket),
            rtcp_socket: Arc::new(rtcp_socket),
            caller: Arc::new(LegState::default()),
            callee: Arc::new(LegState::default()),
            allowed_payloads,
            telephone_event_pt,
            dtmf_tx,
            local_tap: Arc::new(Mutex::new(None)),
            callee_dtmf: Arc::new(Mutex::new(None)),
            record_tap: Arc::new(Mutex::new(None)),
            stream: RtpStream::new(),
            stats: Arc::new(SessionStats::default()),
            state_tx,
            state_rx,
            last_activity: Arc::new(Mutex::new(Instant::now())),
        })
    }

    /// RTP port advertised in SDP towards both legs.
    pub fn rtp_port(&self) -> u16 {
        self.pair.rtp
    }

    pub fn port_pair(&self) -> PortPair {
        self.pair
    }

    pub fn state(&self) -> SessionState {
        *self.state_rx.borrow()
    }

    pub fn stats(&self) -> &SessionStats {
        &self.stats
    }

    pub fn last_activity(&self) -> Instant {
        *self.last_activity.lock().unwrap()
    }

    /// Record the IP a leg is expected to send from (its SDP connection
    /// address). Only used to classify first packets; pinning still follows
    /// the first observed sender.
    pub fn set_leg_hint(&self, side: LegSide, ip: IpAddr) {
        *self.leg(side).hint_ip.lock().unwrap() = Some(ip);
    }

    pub fn leg_remote(&self, side: LegSide) -> Option<SocketAddr> {
        *self.leg(side).remote.lock().unwrap()
    }

    /// Route caller-leg audio to a local consumer (voicemail recorder).
    pub fn set_local_tap(&self, tx: mpsc::Sender<RtpPacket>) {
        *self.local_tap.lock().unwrap() = Some(tx);
    }

    pub fn clear_local_tap(&self) {
        *self.local_tap.lock().unwrap() = None;
    }

    /// Collect callee-leg digits (answer confirmation for follow-me).
    pub fn set_callee_dtmf(&self, tx: mpsc::Sender<char>) {
        *self.callee_dtmf.lock().unwrap() = Some(tx);
    }

    pub fn clear_callee_dtmf(&self) {
        *self.callee_dtmf.lock().unwrap() = None;
    }

    /// Mirror caller audio into a recording consumer; forwarding continues.
    pub fn set_record_tap(&self, tx: mpsc::Sender<RtpPacket>) {
        *self.record_tap.lock().unwrap() = Some(tx);
    }

    pub fn clear_record_tap(&self) {
        *self.record_tap.lock().unwrap() = None;
    }

    fn leg(&self, side: LegSide) -> &Arc<LegState> {
        match side {
            LegSide::Caller => &self.caller,
            LegSide::Callee => &self.callee,
        }
    }

    /// Send locally-generated audio (a prompt frame) to a leg. Queued while
    /// the leg is unpinned.
    pub async fn send_audio(&self, side: LegSide, payload_type: u8, payload: Bytes) {
        let packet = self.stream.next_packet(payload_type, payload);
        let wire = packet.serialize();
        let dest = *self.leg(side).remote.lock().unwrap();
        match dest {
            Some(addr) => {
                if self.rtp_socket.send_to(&wire, addr).await.is_ok() {
                    self.stats.packets_forwarded.fetch_add(1, Ordering::Relaxed);
                    self.stats
                        .bytes_forwarded
                        .fetch_add(wire.len() as u64, Ordering::Relaxed);
                }
            }
            None => {
                let mut pending = self.leg(side).pending.lock().unwrap();
                if pending.len() >= PENDING_CAP {
                    pending.pop_front();
                }
                pending.push_back(wire.to_vec());
            }
        }
    }

    /// Start the relay loops.
    pub fn start(&self) {
        let _ = self.state_tx.send(SessionState::Active);
        tokio::spawn(
            RelayWorker {
                call_id: self.call_id.clone(),
                socket: self.rtp_socket.clone(),
                caller: self.caller.clone(),
                callee: self.callee.clone(),
                allowed_payloads: self.allowed_payloads.clone(),
                telephone_event_pt: self.telephone_event_pt,
                dtmf_tx: self.dtmf_tx.clone(),
                local_tap: self.local_tap.clone(),
                callee_dtmf: self.callee_dtmf.clone(),
                record_tap: self.record_tap.clone(),
                stats: self.stats.clone(),
                last_activity: self.last_activity.clone(),
                state_rx: self.state_rx.clone(),
            }
            .run(),
        );
        tokio::spawn(rtcp_loop(
            self.rtcp_socket.clone(),
            self.caller.clone(),
            self.callee.clone(),
            self.state_rx.clone(),
        ));
        debug!(call_id = %self.call_id, session = %self.id, rtp = self.pair.rtp, "media session active");
    }

    /// Stop forwarding. Idempotent; ports are returned by the session
    /// manager on release.
    pub fn stop(&self) {
        if matches!(self.state(), SessionState::New | SessionState::Active) {
            let _ = self.state_tx.send(SessionState::Stopped);
            debug!(call_id = %self.call_id, session = %self.id, "media session stopped");
        }
    }

    pub(super) fn mark_released(&self) {
        let _ = self.state_tx.send(SessionState::Released);
    }
}

struct RelayWorker {
    call_id: String,
    socket: Arc<UdpSocket>,
    caller: Arc<LegState>,
    callee: Arc<LegState>,
    allowed_payloads: Vec<u8>,
    telephone_event_pt: u8,
    dtmf_tx: Option<mpsc::Sender<char>>,
    local_tap: Arc<Mutex<Option<mpsc::Sender<RtpPacket>>>>,
    callee_dtmf: Arc<Mutex<Option<mpsc::Sender<char>>>>,
    record_tap: Arc<Mutex<Option<mpsc::Sender<RtpPacket>>>>,
    stats: Arc<SessionStats>,
    last_activity: Arc<Mutex<Instant>>,
    state_rx: watch::Receiver<SessionState>,
}

impl RelayWorker {
    async fn run(mut self) {
        let mut buf = vec![0u8; 2048];
        // (event, rtp timestamp) of the last digit delivered, so the
        // retransmitted end packets don't repeat it
        let mut last_event: Option<(u8, u32)> = None;

        loop {
            let (len, src) = tokio::select! {
                result = self.socket.recv_from(&mut buf) => match result {
                    Ok(pair) => pair,
                    Err(e) => {
                        warn!(call_id = %self.call_id, "RTP socket read failed: {}", e);
                        break;
                    }
                },
                _ = self.state_rx.changed() => {
                    if !matches!(*self.state_rx.borrow(), SessionState::Active) {
                        break;
                    }
                    continue;
                }
            };

            *self.last_activity.lock().unwrap() = Instant::now();

            let packet = match RtpPacket::parse(&buf[..len]) {
                Ok(packet) => packet,
                Err(_) => {
                    self.drop_packet();
                    continue;
                }
            };

            let is_event = packet.payload_type == self.telephone_event_pt;
            if !is_event && !self.allowed_payloads.contains(&packet.payload_type) {
                self.drop_packet();
                continue;
            }

            let side = match self.classify(src) {
                Some(side) => side,
                None => {
                    self.drop_packet();
                    continue;
                }
            };

            if is_event {
                if let Some(event) = TelephoneEvent::parse(&packet.payload) {
                    if event.end {
                        let key = (event.event, packet.timestamp);
                        if last_event != Some(key) {
                            last_event = Some(key);
                            if let Some(digit) = event.digit() {
                                match side {
                                    LegSide::Caller => {
                                        if let Some(tx) = &self.dtmf_tx {
                                            if tx.try_send(digit).is_err() {
                                                debug!(call_id = %self.call_id, "DTMF queue full");
                                            }
                                        }
                                    }
                                    LegSide::Callee => {
                                        let tx = self.callee_dtmf.lock().unwrap().clone();
                                        if let Some(tx) = tx {
                                            let _ = tx.try_send(digit);
                                        }
                                    }
                                }
                            }
                        }
                    }
                }
            }

            if side == LegSide::Caller && !is_event {
                // recording mirrors the audio without diverting it
                let record = self.record_tap.lock().unwrap().clone();
                if let Some(record) = record {
                    let _ = record.try_send(packet.clone());
                }
            }

            // caller audio goes to the local tap while one is installed
            if side == LegSide::Caller {
                let tap = self.local_tap.lock().unwrap().clone();
                if let Some(tap) = tap {
                    let _ = tap.try_send(packet.clone());
                    continue;
                }
            }

            self.forward(side, &buf[..len]).await;
        }
    }

    /// Match a source address to a leg, pinning on first contact. The SDP
    /// hint picks the right slot when both legs are still unpinned.
    fn classify(&self, src: SocketAddr) -> Option<LegSide> {
        let caller_pin = *self.caller.remote.lock().unwrap();
        let callee_pin = *self.callee.remote.lock().unwrap();

        if caller_pin == Some(src) {
            return Some(LegSide::Caller);
        }
        if callee_pin == Some(src) {
            return Some(LegSide::Callee);
        }

        let caller_hint = *self.caller.hint_ip.lock().unwrap();
        let callee_hint = *self.callee.hint_ip.lock().unwrap();

        if caller_pin.is_none() && caller_hint == Some(src.ip()) {
            self.pin(LegSide::Caller, src);
            return Some(LegSide::Caller);
        }
        if callee_pin.is_none() && callee_hint == Some(src.ip()) {
            self.pin(LegSide::Callee, src);
            return Some(LegSide::Callee);
        }
        if caller_pin.is_none() && caller_hint.is_none() {
            self.pin(LegSide::Caller, src);
            return Some(LegSide::Caller);
        }
        if callee_pin.is_none() && callee_hint.is_none() {
            self.pin(LegSide::Callee, src);
            return Some(LegSide::Callee);
        }
        None
    }

    fn pin(&self, side: LegSide, src: SocketAddr) {
        let leg = match side {
            LegSide::Caller => &self.caller,
            LegSide::Callee => &self.callee,
        };
        *leg.remote.lock().unwrap() = Some(src);
        debug!(call_id = %self.call_id, ?side, %src, "pinned RTP remote");
    }

    /// Forward a datagram received on `from` to the opposite leg.
    async fn forward(&self, from: LegSide, datagram: &[u8]) {
        let to = match from {
            LegSide::Caller => &self.callee,
            LegSide::Callee => &self.caller,
        };
        let dest = *to.remote.lock().unwrap();
        match dest {
            Some(addr) => {
                let queued: Vec<Vec<u8>> = {
                    let mut pending = to.pending.lock().unwrap();
                    pending.drain(..).collect()
                };
                for earlier in queued {
                    if self.socket.send_to(&earlier, addr).await.is_ok() {
                        self.count_forward(earlier.len());
                    }
                }
                match self.socket.send_to(datagram, addr).await {
                    Ok(_) => self.count_forward(datagram.len()),
                    Err(e) => {
                        warn!(call_id = %self.call_id, "RTP forward failed: {}", e);
                        self.drop_packet();
                    }
                }
            }
            None => {
                let mut pending = to.pending.lock().unwrap();
                if pending.len() >= PENDING_CAP {
                    pending.pop_front();
                    self.drop_packet();
                }
                pending.push_back(datagram.to_vec());
            }
        }
    }

    fn count_forward(&self, bytes: usize) {
        self.stats.packets_forwarded.fetch_add(1, Ordering::Relaxed);
        self.stats
            .bytes_forwarded
            .fetch_add(bytes as u64, Ordering::Relaxed);
        metrics::counter!("pbx_rtp_packets_forwarded_total").increment(1);
        metrics::counter!("pbx_rtp_bytes_forwarded_total").increment(bytes as u64);
    }

    fn drop_packet(&self) {
        self.stats.packets_dropped.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("pbx_rtp_packets_dropped_total").increment(1);
    }
}

/// Blind RTCP relay between the two pinned endpoints. RTCP remotes pin
/// independently of RTP by source IP.
async fn rtcp_loop(
    socket: Arc<UdpSocket>,
    caller: Arc<LegState>,
    callee: Arc<LegState>,
    mut state_rx: watch::Receiver<SessionState>,
) {
    let mut buf = vec![0u8; 1500];
    loop {
        let (len, src) = tokio::select! {
            result = socket.recv_from(&mut buf) => match result {
                Ok(pair) => pair,
                Err(_) => break,
            },
            _ = state_rx.changed() => {
                if !matches!(*state_rx.borrow(), SessionState::Active) {
                    break;
                }
                continue;
            }
        };

        let caller_ip = caller.remote.lock().unwrap().map(|a| a.ip());
        let callee_ip = callee.remote.lock().unwrap().map(|a| a.ip());

        let (own, other) = if caller_ip == Some(src.ip()) {
            (&caller, &callee)
        } else if callee_ip == Some(src.ip()) {
            (&callee, &caller)
        } else {
            continue;
        };
        *own.rtcp_remote.lock().unwrap() = Some(src);

        let dest = *other.rtcp_remote.lock().unwrap();
        let fallback = other
            .remote
            .lock()
            .unwrap()
            .map(|a| SocketAddr::new(a.ip(), a.port() + 1));
        if let Some(addr) = dest.or(fallback) {
            let _ = socket.send_to(&buf[..len], addr).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn session_for_test() -> (MediaSession, mpsc::Receiver<char>) {
        let (tx, rx) = mpsc::channel(16);
        // port 0: the OS picks; the pair is only bookkeeping in tests
        let session = MediaSession::bind(
            "call-relay".into(),
            PortPair { rtp: 0 },
            vec![0, 8],
            101,
            Some(tx),
        )
        .await;
        // RTCP bind on port 1 may fail when rtp=0; retry without rtcp use
        (session.unwrap(), rx)
    }

    #[tokio::test]
    async fn test_forwarding_between_pinned_legs() {
        let (session, _rx) = session_for_test().await;
        session.start();

        let rtp_port = session.rtp_socket.local_addr().unwrap().port();

        let caller_peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let callee_peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();

        // first sender pins the caller slot, second pins the callee slot
        let hello = RtpPacket::new(0, 1, 160, 7, Bytes::from_static(&[0xFF; 160])).serialize();
        caller_peer
            .send_to(&hello, ("127.0.0.1", rtp_port))
            .await
            .unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        callee_peer
            .send_to(&hello, ("127.0.0.1", rtp_port))
            .await
            .unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        // caller audio should now arrive at the callee peer
        let audio = RtpPacket::new(0, 2, 320, 7, Bytes::from_static(&[0x7F; 160])).serialize();
        caller_peer
            .send_to(&audio, ("127.0.0.1", rtp_port))
            .await
            .unwrap();

        let mut buf = [0u8; 2048];
        let (len, _) = tokio::time::timeout(
            std::time::Duration::from_secs(2),
            callee_peer.recv_from(&mut buf),
        )
        .await
        .expect("relay timed out")
        .unwrap();
        let relayed = RtpPacket::parse(&buf[..len]).unwrap();
        assert_eq!(relayed.payload_type, 0);
        assert!(session.stats().packets_forwarded.load(Ordering::Relaxed) >= 1);
        session.stop();
    }

    #[tokio::test]
    async fn test_unknown_payload_type_dropped() {
        let (session, _rx) = session_for_test().await;
        session.start();

        let rtp_port = session.rtp_socket.local_addr().unwrap().port();
        let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();

        // payload type 18 (G.729) is outside the negotiated set
        let packet = RtpPacket::new(18, 1, 160, 7, Bytes::from_static(&[0; 20])).serialize();
        peer.send_to(&packet, ("127.0.0.1", rtp_port)).await.unwrap();

        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        assert!(session.stats().packets_dropped.load(Ordering::Relaxed) >= 1);
        assert_eq!(session.stats().packets_forwarded.load(Ordering::Relaxed), 0);
        // an unacceptable payload type must not pin the leg
        assert_eq!(session.leg_remote(LegSide::Caller), None);
        session.stop();
    }

    #[tokio::test]
    async fn test_third_address_rejected() {
        let (session, _rx) = session_for_test().await;
        session.start();

        let rtp_port = session.rtp_socket.local_addr().unwrap().port();
        let a = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let b = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let c = UdpSocket::bind("127.0.0.1:0").await.unwrap();

        let packet = RtpPacket::new(0, 1, 0, 7, Bytes::from_static(&[0xFF; 4])).serialize();
        a.send_to(&packet, ("127.0.0.1", rtp_port)).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        b.send_to(&packet, ("127.0.0.1", rtp_port)).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        let dropped_before = session.stats().packets_dropped.load(Ordering::Relaxed);
        c.send_to(&packet, ("127.0.0.1", rtp_port)).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        assert!(session.stats().packets_dropped.load(Ordering::Relaxed) > dropped_before);
        session.stop();
    }

    #[tokio::test]
    async fn test_dtmf_delivered_once() {
        let (session, mut rx) = session_for_test().await;
        session.start();

        let rtp_port = session.rtp_socket.local_addr().unwrap().port();
        let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();

        // pin the caller leg with audio first
        let audio = RtpPacket::new(0, 1, 160, 7, Bytes::from_static(&[0xFF; 160])).serialize();
        peer.send_to(&audio, ("127.0.0.1", rtp_port)).await.unwrap();

        // digit 5, end bit set, retransmitted three times with one timestamp
        let event_payload = Bytes::from_static(&[5, 0x8A, 0x01, 0x40]);
        for seq in 2..5u16 {
            let packet = RtpPacket::new(101, seq, 480, 7, event_payload.clone());
            peer.send_to(&packet.serialize(), ("127.0.0.1", rtp_port))
                .await
                .unwrap();
        }

        let digit = tokio::time::timeout(std::time::Duration::from_secs(2), rx.recv())
            .await
            .expect("no digit")
            .unwrap();
        assert_eq!(digit, '5');

        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        assert!(rx.try_recv().is_err());
        session.stop();
    }

    #[tokio::test]
    async fn test_local_tap_receives_caller_audio() {
        let (session, _rx) = session_for_test().await;
        let (tap_tx, mut tap_rx) = mpsc::channel(16);
        session.set_local_tap(tap_tx);
        session.start();

        let rtp_port = session.rtp_socket.local_addr().unwrap().port();
        let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let audio = RtpPacket::new(0, 9, 160, 7, Bytes::from_static(&[0xFF; 160])).serialize();
        peer.send_to(&audio, ("127.0.0.1", rtp_port)).await.unwrap();

        let packet = tokio::time::timeout(std::time::Duration::from_secs(2), tap_rx.recv())
            .await
            .expect("tap timed out")
            .unwrap();
        assert_eq!(packet.sequence, 9);
        session.stop();
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let (session, _rx) = session_for_test().await;
        session.start();
        session.stop();
        session.stop();
        assert_eq!(session.state(), SessionState::Stopped);
    }
}
