//! N-way conference mixing
//!
//! G.711 in, G.711 out. Every 20 ms tick decodes one frame per
//! participant to linear PCM, sums them, subtracts each participant's own
//! contribution for that participant's return mix, clips to i16 and
//! re-encodes.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info};
use uuid::Uuid;

use super::g711::G711Codec;
use crate::domain::conference::ConferenceBridge;
use crate::{DomainError, Result};

/// Samples per 20 ms frame at 8 kHz
pub const FRAME_SAMPLES: usize = 160;

/// Frames buffered per participant before old audio is discarded
const QUEUE_CAP: usize = 10;

struct Participant {
    muted: bool,
    codec: G711Codec,
    /// Decoded inbound frames awaiting the next tick
    queue: VecDeque<Vec<i16>>,
    /// Encoded mixed audio back towards this participant
    out: mpsc::Sender<Vec<u8>>,
}

/// One live conference
pub struct ConferenceRoom {
    pub bridge_id: i64,
    max_members: u32,
    mute_on_join: bool,
    pub announce_joins: bool,
    participants: Mutex<HashMap<Uuid, Participant>>,
    closed: AtomicBool,
}

impl ConferenceRoom {
    pub fn new(bridge: &ConferenceBridge) -> Self {
        Self {
            bridge_id: bridge.id,
            max_members: bridge.max_members,
            mute_on_join: bridge.mute_on_join,
            announce_joins: bridge.announce_joins,
            participants: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
        }
    }

    /// Add a member. Over-cap joins are rejected with `resource_exhausted`
    /// so the caller can play the "conference full" prompt.
    pub fn join(
        &self,
        participant_id: Uuid,
        codec: G711Codec,
        out: mpsc::Sender<Vec<u8>>,
    ) -> Result<()> {
        let mut participants = self.participants.lock().unwrap();
        if self.max_members > 0 && participants.len() as u32 >= self.max_members {
            return Err(DomainError::ResourceExhausted(format!(
                "conference {} is full",
                self.bridge_id
            )));
        }
        participants.insert(
            participant_id,
            Participant {
                muted: self.mute_on_join,
                codec,
                queue: VecDeque::new(),
                out,
            },
        );
        info!(bridge = self.bridge_id, %participant_id, "participant joined conference");
        Ok(())
    }

    pub fn leave(&self, participant_id: Uuid) {
        let mut participants = self.participants.lock().unwrap();
        if participants.remove(&participant_id).is_some() {
            info!(bridge = self.bridge_id, %participant_id, "participant left conference");
        }
    }

    pub fn set_muted(&self, participant_id: Uuid, muted: bool) {
        let mut participants = self.participants.lock().unwrap();
        if let Some(p) = participants.get_mut(&participant_id) {
            p.muted = muted;
        }
    }

    pub fn member_count(&self) -> usize {
        self.participants.lock().unwrap().len()
    }

    /// Queue inbound companded audio from a participant.
    pub fn push_audio(&self, participant_id: Uuid, payload: &[u8]) {
        let mut participants = self.participants.lock().unwrap();
        if let Some(p) = participants.get_mut(&participant_id) {
            let frame = p.codec.decode(payload);
            if p.queue.len() >= QUEUE_CAP {
                p.queue.pop_front();
            }
            p.queue.push_back(frame);
        }
    }

    /// One mixing round. Pops at most one frame per participant, sums the
    /// unmuted ones and delivers `sum - own` to each member.
    pub fn mix_tick(&self) {
        let mut participants = self.participants.lock().unwrap();
        if participants.is_empty() {
            return;
        }

        // collect this tick's contribution per participant
        let mut contributions: HashMap<Uuid, Vec<i16>> = HashMap::new();
        for (id, p) in participants.iter_mut() {
            if let Some(frame) = p.queue.pop_front() {
                if !p.muted {
                    contributions.insert(*id, frame);
                }
            }
        }

        let mut total = vec![0i32; FRAME_SAMPLES];
        for frame in contributions.values() {
            for (i, &sample) in frame.iter().take(FRAME_SAMPLES).enumerate() {
                total[i] += sample as i32;
            }
        }

        for (id, p) in participants.iter() {
            let own = contributions.get(id);
            let mixed: Vec<i16> = (0..FRAME_SAMPLES)
                .map(|i| {
                    let own_sample = own.and_then(|f| f.get(i).copied()).unwrap_or(0) as i32;
                    (total[i] - own_sample).clamp(i16::MIN as i32, i16::MAX as i32) as i16
                })
                .collect();
            let encoded = p.codec.encode(&mixed);
            if p.out.try_send(encoded).is_err() {
                debug!(bridge = self.bridge_id, %id, "conference output queue full");
            }
        }
    }

    pub fn close(&self) {
        self.closed.store(true, Ordering::Relaxed);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Relaxed)
    }
}

/// Holds the live rooms and drives their 20 ms mix loops.
pub struct ConferenceManager {
    rooms: RwLock<HashMap<i64, Arc<ConferenceRoom>>>,
}

impl ConferenceManager {
    pub fn new() -> Self {
        Self {
            rooms: RwLock::new(HashMap::new()),
        }
    }

    /// Fetch the live room for a bridge, creating it (and its mix loop) on
    /// first join.
    pub async fn room(&self, bridge: &ConferenceBridge) -> Arc<ConferenceRoom> {
        {
            let rooms = self.rooms.read().await;
            if let Some(room) = rooms.get(&bridge.id) {
                return room.clone();
            }
        }
        let mut rooms = self.rooms.write().await;
        if let Some(room) = rooms.get(&bridge.id) {
            return room.clone();
        }
        let room = Arc::new(ConferenceRoom::new(bridge));
        rooms.insert(bridge.id, room.clone());
        tokio::spawn(run_mix_loop(room.clone()));
        room
    }

    /// Drop a room once it has emptied.
    pub async fn reap(&self, bridge_id: i64) {
        let mut rooms = self.rooms.write().await;
        if let Some(room) = rooms.get(&bridge_id) {
            if room.member_count() == 0 {
                room.close();
                rooms.remove(&bridge_id);
                debug!(bridge = bridge_id, "conference room reaped");
            }
        }
    }

    pub async fn active_rooms(&self) -> usize {
        self.rooms.read().await.len()
    }
}

impl Default for ConferenceManager {
    fn default() -> Self {
        Self::new()
    }
}

async fn run_mix_loop(room: Arc<ConferenceRoom>) {
    let mut ticker = tokio::time::interval(Duration::from_millis(20));
    loop {
        ticker.tick().await;
        if room.is_closed() {
            break;
        }
        room.mix_tick();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn bridge(max_members: u32, mute_on_join: bool) -> ConferenceBridge {
        ConferenceBridge {
            id: 1,
            name: "standup".into(),
            pin: None,
            max_members,
            mute_on_join,
            announce_joins: false,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn frame_of(value: i16) -> Vec<u8> {
        G711Codec::Ulaw.encode(&vec![value; FRAME_SAMPLES])
    }

    fn decoded(mix: &[u8]) -> Vec<i16> {
        G711Codec::Ulaw.decode(mix)
    }

    #[tokio::test]
    async fn test_mix_subtracts_own_contribution() {
        let room = ConferenceRoom::new(&bridge(0, false));
        let (tx_a, mut rx_a) = mpsc::channel(4);
        let (tx_b, mut rx_b) = mpsc::channel(4);
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        room.join(a, G711Codec::Ulaw, tx_a).unwrap();
        room.join(b, G711Codec::Ulaw, tx_b).unwrap();

        room.push_audio(a, &frame_of(1000));
        room.push_audio(b, &frame_of(-500));
        room.mix_tick();

        // a hears only b, b hears only a (within companding tolerance)
        let heard_by_a = decoded(&rx_a.try_recv().unwrap());
        let heard_by_b = decoded(&rx_b.try_recv().unwrap());
        assert!((heard_by_a[0] as i32 + 500).abs() < 64, "{}", heard_by_a[0]);
        assert!((heard_by_b[0] as i32 - 1000).abs() < 64, "{}", heard_by_b[0]);
    }

    #[tokio::test]
    async fn test_three_way_sum() {
        let room = ConferenceRoom::new(&bridge(0, false));
        let mut outs = Vec::new();
        let mut ids = Vec::new();
        for _ in 0..3 {
            let (tx, rx) = mpsc::channel(4);
            let id = Uuid::new_v4();
            room.join(id, G711Codec::Ulaw, tx).unwrap();
            outs.push(rx);
            ids.push(id);
        }

        room.push_audio(ids[0], &frame_of(1000));
        room.push_audio(ids[1], &frame_of(2000));
        room.push_audio(ids[2], &frame_of(3000));
        room.mix_tick();

        // participant 0 hears 2000 + 3000
        let heard = decoded(&outs[0].try_recv().unwrap());
        assert!((heard[0] as i32 - 5000).abs() < 320, "{}", heard[0]);
    }

    #[tokio::test]
    async fn test_clipping() {
        let room = ConferenceRoom::new(&bridge(0, false));
        let (tx_a, _rx_a) = mpsc::channel(4);
        let (tx_b, _rx_b) = mpsc::channel(4);
        let (tx_c, mut rx_c) = mpsc::channel(4);
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let c = Uuid::new_v4();
        room.join(a, G711Codec::Ulaw, tx_a).unwrap();
        room.join(b, G711Codec::Ulaw, tx_b).unwrap();
        room.join(c, G711Codec::Ulaw, tx_c).unwrap();

        room.push_audio(a, &frame_of(30000));
        room.push_audio(b, &frame_of(30000));
        room.mix_tick();

        // c hears the sum clipped to i16::MAX, not wrapped negative
        let heard = decoded(&rx_c.try_recv().unwrap());
        assert!(heard[0] > 30000);
    }

    #[tokio::test]
    async fn test_muted_participant_not_mixed() {
        let room = ConferenceRoom::new(&bridge(0, false));
        let (tx_a, _rx_a) = mpsc::channel(4);
        let (tx_b, mut rx_b) = mpsc::channel(4);
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        room.join(a, G711Codec::Ulaw, tx_a).unwrap();
        room.join(b, G711Codec::Ulaw, tx_b).unwrap();
        room.set_muted(a, true);

        room.push_audio(a, &frame_of(10000));
        room.mix_tick();

        let heard = decoded(&rx_b.try_recv().unwrap());
        assert!(heard[0].abs() < 64);
    }

    #[tokio::test]
    async fn test_max_members_enforced() {
        let room = ConferenceRoom::new(&bridge(2, false));
        let (tx, _rx) = mpsc::channel(4);
        room.join(Uuid::new_v4(), G711Codec::Ulaw, tx.clone()).unwrap();
        room.join(Uuid::new_v4(), G711Codec::Ulaw, tx.clone()).unwrap();
        let third = room.join(Uuid::new_v4(), G711Codec::Ulaw, tx);
        assert!(matches!(third, Err(DomainError::ResourceExhausted(_))));
    }

    #[tokio::test]
    async fn test_mute_on_join_flag() {
        let room = ConferenceRoom::new(&bridge(0, true));
        let (tx_a, _rx_a) = mpsc::channel(4);
        let (tx_b, mut rx_b) = mpsc::channel(4);
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        room.join(a, G711Codec::Ulaw, tx_a).unwrap();
        room.join(b, G711Codec::Ulaw, tx_b).unwrap();

        room.push_audio(a, &frame_of(10000));
        room.mix_tick();
        let heard = decoded(&rx_b.try_recv().unwrap());
        assert!(heard[0].abs() < 64, "joined muted, should be silent");
    }

    #[tokio::test]
    async fn test_manager_room_lifecycle() {
        let manager = ConferenceManager::new();
        let bridge = bridge(0, false);
        let room = manager.room(&bridge).await;
        let same = manager.room(&bridge).await;
        assert!(Arc::ptr_eq(&room, &same));
        assert_eq!(manager.active_rooms().await, 1);

        manager.reap(bridge.id).await;
        assert_eq!(manager.active_rooms().await, 0);
        assert!(room.is_closed());
    }
}
