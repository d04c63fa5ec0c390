use crate::conn::{ConnError, ConnectionManager};
use crate::cryptor::Keyring;
use crate::io::Efferent;
use crate::shm::{ContainerType, SharedStateClient, ShmError};
use crate::wire::{Codec, Fields, Packet, WrapError};
use keel::logging::{self, Logger};
use keel::time;
use rand::Rng;
use serde_derive::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::io;
use std::net::SocketAddrV4;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

/// Retransmission cap unless the caller overrides it.
pub const DEFAULT_MAX_REPEAT: u64 = 5;

/// Longest idle sleep between repeater passes, in seconds.
pub const MAX_IDLE_INTERVAL: f64 = 1.0;

/// Bounds of the uniformly drawn retransmission interval, in seconds.
pub const REPEAT_INTERVAL_RANGE: (f64, f64) = (0.5, 1.0);

/// The node-shared container holding stored control packets.
pub const PKTS_KEY: &str = "pktstore_packets";

#[derive(Debug, Eq, PartialEq)]
pub enum StoreError {
    MissingSn,
    Shm(ShmError),
}

impl From<ShmError> for StoreError {
    #[inline]
    fn from(err: ShmError) -> StoreError {
        StoreError::Shm(err)
    }
}

/// The persisted projection of a control packet: serializable fields only.
/// Salt and MAC live solely on the wire and are regenerated on every
/// retransmission, which keeps each repeat unique to observers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredPacket {
    #[serde(rename = "type")]
    pub ptype: u8,
    pub fields: Fields,
    pub previous_hop: Option<SocketAddrV4>,
    pub next_hop: Option<SocketAddrV4>,
}

/// Client-side view of the special-packet cache.
///
/// The packet container itself is node-shared; the repeat bookkeeping
/// containers belong to one worker and are keyed by its pid, since every
/// worker runs its own repeater process.
pub struct SpecialPacketStore {
    shm: SharedStateClient,
    pkts_key: String,
    to_repeat_key: String,
    last_time_key: String,
    next_time_key: String,
    max_times_key: String,
    repeated_times_key: String,
    log: Logger,
}

impl SpecialPacketStore {
    pub fn new<'a, L: Into<Option<&'a Logger>>>(
        shm: SharedStateClient,
        worker_pid: u32,
        log: L,
    ) -> Result<SpecialPacketStore, ShmError> {
        let store = SpecialPacketStore {
            shm,
            pkts_key: PKTS_KEY.to_string(),
            to_repeat_key: format!("pktrpt-{}_to-repeat", worker_pid),
            last_time_key: format!("pktrpt-{}_last-repeat-time", worker_pid),
            next_time_key: format!("pktrpt-{}_next-repeat-time", worker_pid),
            max_times_key: format!("pktrpt-{}_max-repeat-times", worker_pid),
            repeated_times_key: format!("pktrpt-{}_repeated-times", worker_pid),
            log: match log.into() {
                Some(log) => log.new(logging::o!()),
                _ => logging::discard(),
            },
        };

        store.shm.create_key(&store.pkts_key, ContainerType::Dict, None)?;
        store.shm.create_key(&store.to_repeat_key, ContainerType::List, None)?;
        store.shm.create_key(&store.last_time_key, ContainerType::Dict, None)?;
        store.shm.create_key(&store.next_time_key, ContainerType::Dict, None)?;
        store.shm.create_key(&store.max_times_key, ContainerType::Dict, None)?;
        store.shm.create_key(&store.repeated_times_key, ContainerType::Dict, None)?;

        Ok(store)
    }

    /// Persists a control packet the node expects a response to.
    pub fn store_pkt(&self, pkt: &Packet, need_repeat: bool, max_repeats: u64) -> Result<(), StoreError> {
        let fields = pkt.fields.clone().ok_or(StoreError::MissingSn)?;
        let sn = fields.sn.ok_or(StoreError::MissingSn)?;

        let stored = StoredPacket {
            ptype: fields.ptype().into(),
            fields,
            previous_hop: pkt.previous_hop,
            next_hop: pkt.next_hop,
        };
        let entry = json!({ sn.to_string(): serde_json::to_value(&stored).expect("Error encoding packet") });

        self.shm.lock_key(&self.pkts_key)?;
        let stored_result = self.shm.add_value(&self.pkts_key, entry);
        self.shm.unlock_key(&self.pkts_key)?;
        stored_result?;

        if need_repeat {
            self.shm.add_value(&self.to_repeat_key, json!([sn]))?;
            self.set_max_repeat_times(sn, max_repeats)?;
        }

        logging::debug!(self.log, "packet stored";
                        "sn" => sn,
                        "need_repeat" => need_repeat,
                        "max_repeats" => max_repeats);

        Ok(())
    }

    /// Stores the packet and schedules it for retransmission.
    #[inline]
    pub fn repeat_pkt(&self, pkt: &Packet, max_repeats: u64) -> Result<(), StoreError> {
        self.store_pkt(pkt, true, max_repeats)
    }

    pub fn get_pkt(&self, sn: u64) -> Result<Option<Packet>, ShmError> {
        let value = self.shm.get_dict_value(&self.pkts_key, &sn.to_string())?;

        if value.is_null() {
            return Ok(None);
        }

        let stored: StoredPacket = serde_json::from_value(value).map_err(|_| ShmError::Unknown)?;

        Ok(Some(Packet {
            valid: None,
            fields: Some(stored.fields),
            data: Vec::new(),
            previous_hop: stored.previous_hop,
            next_hop: stored.next_hop,
        }))
    }

    pub fn remove_pkt(&self, sn: u64) -> Result<(), ShmError> {
        self.cancel_repeat(sn)?;

        self.shm.lock_key(&self.pkts_key)?;
        let result = self.shm.remove_value(&self.pkts_key, vec![json!(sn.to_string())]);
        self.shm.unlock_key(&self.pkts_key)?;

        result
    }

    /// Stops retransmission and clears the repeat bookkeeping of a packet.
    pub fn cancel_repeat(&self, sn: u64) -> Result<(), ShmError> {
        self.shm.remove_value(&self.to_repeat_key, vec![json!(sn)])?;

        let name = vec![json!(sn.to_string())];
        self.shm.remove_value(&self.last_time_key, name.clone())?;
        self.shm.remove_value(&self.next_time_key, name.clone())?;
        self.shm.remove_value(&self.max_times_key, name.clone())?;
        self.shm.remove_value(&self.repeated_times_key, name)?;

        Ok(())
    }

    /// Serial numbers currently scheduled for retransmission.
    pub fn repeating_sns(&self) -> Result<Vec<u64>, ShmError> {
        let value = self.shm.read_key(&self.to_repeat_key)?;

        match value {
            Value::Array(units) => Ok(units.iter().filter_map(Value::as_u64).collect()),
            _ => Ok(Vec::new()),
        }
    }

    pub fn last_repeat_time(&self, sn: u64) -> Result<Option<f64>, ShmError> {
        self.read_time(&self.last_time_key, sn)
    }

    pub fn set_last_repeat_time(&self, sn: u64, ts: f64) -> Result<(), ShmError> {
        self.shm.add_value(&self.last_time_key, json!({ sn.to_string(): ts }))
    }

    pub fn next_repeat_time(&self, sn: u64) -> Result<Option<f64>, ShmError> {
        self.read_time(&self.next_time_key, sn)
    }

    pub fn set_next_repeat_time(&self, sn: u64, ts: f64) -> Result<(), ShmError> {
        self.shm.add_value(&self.next_time_key, json!({ sn.to_string(): ts }))
    }

    pub fn max_repeat_times(&self, sn: u64) -> Result<Option<u64>, ShmError> {
        Ok(self.shm.get_dict_value(&self.max_times_key, &sn.to_string())?.as_u64())
    }

    pub fn set_max_repeat_times(&self, sn: u64, times: u64) -> Result<(), ShmError> {
        self.shm.add_value(&self.max_times_key, json!({ sn.to_string(): times }))
    }

    pub fn repeated_times(&self, sn: u64) -> Result<Option<u64>, ShmError> {
        Ok(self
            .shm
            .get_dict_value(&self.repeated_times_key, &sn.to_string())?
            .as_u64())
    }

    pub fn increase_repeated_times(&self, sn: u64) -> Result<u64, ShmError> {
        let repeated = self.repeated_times(sn)?.unwrap_or(0) + 1;
        self.shm
            .add_value(&self.repeated_times_key, json!({ sn.to_string(): repeated }))?;

        Ok(repeated)
    }

    fn read_time(&self, key: &str, sn: u64) -> Result<Option<f64>, ShmError> {
        Ok(self.shm.get_dict_value(key, &sn.to_string())?.as_f64())
    }
}

/// What the repeater should do with one scheduled packet.
#[derive(Debug, PartialEq)]
pub enum RepeatAction {
    Cancel,
    SendNow,
    Wait(f64),
}

/// The retransmission decision for one packet, pure so the schedule is
/// testable without sockets: exhausted packets are cancelled, unscheduled
/// and overdue packets go out now, everything else waits.
pub fn plan_repeat(
    now: f64,
    last: Option<f64>,
    next: Option<f64>,
    max_times: u64,
    repeated: u64,
) -> RepeatAction {
    if repeated >= max_times {
        return RepeatAction::Cancel;
    }

    match (last, next) {
        (Some(_), Some(next_ts)) if now < next_ts => RepeatAction::Wait(next_ts - now),
        _ => RepeatAction::SendNow,
    }
}

#[derive(Debug)]
pub enum RepeaterError {
    Wrap(WrapError),
    Conn(ConnError),
    Shm(ShmError),
    Io(io::ErrorKind),
}

impl From<WrapError> for RepeaterError {
    fn from(err: WrapError) -> RepeaterError {
        RepeaterError::Wrap(err)
    }
}

impl From<ConnError> for RepeaterError {
    fn from(err: ConnError) -> RepeaterError {
        RepeaterError::Conn(err)
    }
}

impl From<ShmError> for RepeaterError {
    fn from(err: ShmError) -> RepeaterError {
        RepeaterError::Shm(err)
    }
}

impl From<io::Error> for RepeaterError {
    fn from(err: io::Error) -> RepeaterError {
        RepeaterError::Io(err.kind())
    }
}

/// The per-worker retransmission driver.
///
/// Runs as its own process, walking the worker's to-repeat list and
/// re-wrapping due packets with a fresh salt before handing them to the
/// efferent. The idle sleep shrinks toward the earliest upcoming deadline.
pub struct Repeater {
    store: SpecialPacketStore,
    conns: ConnectionManager,
    codec: Codec,
    keyring: Keyring,
    efferent: Efferent,
    running: Arc<AtomicBool>,
    log: Logger,
}

impl Repeater {
    pub fn new<'a, L: Into<Option<&'a Logger>>>(
        store: SpecialPacketStore,
        conns: ConnectionManager,
        codec: Codec,
        keyring: Keyring,
        efferent: Efferent,
        log: L,
    ) -> Repeater {
        Repeater {
            store,
            conns,
            codec,
            keyring,
            efferent,
            running: Arc::new(AtomicBool::new(true)),
            log: match log.into() {
                Some(log) => log.new(logging::o!()),
                _ => logging::discard(),
            },
        }
    }

    #[inline]
    pub fn shutdown_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.running)
    }

    pub fn run(&mut self) {
        logging::info!(self.log, "repeater running");

        while self.running.load(Ordering::Relaxed) {
            let mut next_poll = MAX_IDLE_INTERVAL;

            for sn in self.store.repeating_sns().unwrap_or_default() {
                let pkt = match self.store.get_pkt(sn) {
                    // Removed between the two shared state requests.
                    Ok(None) => continue,
                    Ok(Some(pkt)) => pkt,
                    Err(err) => {
                        logging::debug!(self.log, "packet lookup failed"; "sn" => sn, "error" => ?err);
                        continue;
                    }
                };

                let now = time::timestamp_f64();
                let last = self.store.last_repeat_time(sn).unwrap_or(None);
                let next = self.store.next_repeat_time(sn).unwrap_or(None);
                let max_times = self
                    .store
                    .max_repeat_times(sn)
                    .unwrap_or(None)
                    .unwrap_or(DEFAULT_MAX_REPEAT);
                let repeated = self.store.repeated_times(sn).unwrap_or(None).unwrap_or(0);

                match plan_repeat(now, last, next, max_times, repeated) {
                    RepeatAction::Cancel => {
                        logging::debug!(self.log, "retransmission cap reached"; "sn" => sn);
                        let _ = self.store.cancel_repeat(sn);
                    }
                    RepeatAction::SendNow => {
                        if let Err(err) = self.send(sn, pkt, now) {
                            logging::debug!(self.log, "retransmission failed"; "sn" => sn, "error" => ?err);
                        }
                    }
                    RepeatAction::Wait(until) => {
                        if until < next_poll {
                            next_poll = until;
                        }
                    }
                }
            }

            thread::sleep(Duration::from_millis((next_poll.max(0.0) * 1000.0) as u64));
        }

        logging::info!(self.log, "repeater exited");
    }

    fn send(&mut self, sn: u64, mut pkt: Packet, now: f64) -> Result<(), RepeaterError> {
        // The stored sn and time survive, only salt and MAC are fresh.
        self.codec.wrap(&mut pkt, None)?;
        self.conns.seal(&mut pkt, &self.keyring)?;
        self.efferent.transmit(&pkt)?;

        let (lo, hi) = REPEAT_INTERVAL_RANGE;
        let interval = rand::thread_rng().gen_range(lo, hi);

        self.store.set_last_repeat_time(sn, now)?;
        self.store.set_next_repeat_time(sn, now + interval)?;
        let repeated = self.store.increase_repeated_times(sn)?;

        logging::debug!(self.log, "packet retransmitted"; "sn" => sn, "repeated" => repeated);

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shm::testutil::spawn_server;
    use crate::wire::{Body, Fields};

    fn addr(port: u16) -> SocketAddrV4 {
        SocketAddrV4::new([127, 0, 0, 1].into(), port)
    }

    fn stored_packet(sn: u64) -> Packet {
        let mut fields = Fields::new(
            addr(7001),
            addr(7002),
            Body::Ctrl {
                subject: crate::wire::subjects::JOIN_CLUSTER,
                content: serde_json::Map::new(),
            },
        );
        fields.sn = Some(sn);
        fields.time = Some(1_000_000);

        let mut pkt = Packet::outbound(fields, addr(7002));
        pkt.previous_hop = Some(addr(7000));
        pkt
    }

    #[test]
    fn test_store_get_roundtrip() {
        let server = spawn_server();
        let store = SpecialPacketStore::new(server.client("ps-rt.socket"), 1111, None).unwrap();

        let pkt = stored_packet(42);
        store.store_pkt(&pkt, false, DEFAULT_MAX_REPEAT).unwrap();

        let loaded = store.get_pkt(42).unwrap().unwrap();

        assert_eq!(loaded.fields, pkt.fields);
        assert_eq!(loaded.previous_hop, pkt.previous_hop);
        assert_eq!(loaded.next_hop, pkt.next_hop);
        assert!(loaded.data.is_empty());

        assert!(store.get_pkt(43).unwrap().is_none());
    }

    #[test]
    fn test_store_requires_sn() {
        let server = spawn_server();
        let store = SpecialPacketStore::new(server.client("ps-sn.socket"), 1112, None).unwrap();

        let fields = Fields::new(addr(1), addr(2), Body::Data(vec![1]));
        let pkt = Packet::outbound(fields, addr(2));

        let result = store.store_pkt(&pkt, false, DEFAULT_MAX_REPEAT);

        assert_eq!(result.unwrap_err(), StoreError::MissingSn);
    }

    #[test]
    fn test_repeat_scheduling_and_cancel() {
        let server = spawn_server();
        let store = SpecialPacketStore::new(server.client("ps-rpt.socket"), 1113, None).unwrap();

        store.repeat_pkt(&stored_packet(7), 3).unwrap();

        assert_eq!(store.repeating_sns().unwrap(), vec![7]);
        assert_eq!(store.max_repeat_times(7).unwrap(), Some(3));
        assert_eq!(store.repeated_times(7).unwrap(), None);

        assert_eq!(store.increase_repeated_times(7).unwrap(), 1);
        assert_eq!(store.increase_repeated_times(7).unwrap(), 2);

        store.cancel_repeat(7).unwrap();

        assert!(store.repeating_sns().unwrap().is_empty());
        assert_eq!(store.repeated_times(7).unwrap(), None);

        // The packet itself survives a cancel, only the schedule is gone.
        assert!(store.get_pkt(7).unwrap().is_some());

        store.remove_pkt(7).unwrap();
        assert!(store.get_pkt(7).unwrap().is_none());
    }

    #[test]
    fn test_repeat_times_are_worker_private() {
        let server = spawn_server();
        let store_a = SpecialPacketStore::new(server.client("ps-a.socket"), 2001, None).unwrap();
        let store_b = SpecialPacketStore::new(server.client("ps-b.socket"), 2002, None).unwrap();

        store_a.repeat_pkt(&stored_packet(9), 5).unwrap();

        // Both workers see the packet, only the owner repeats it.
        assert!(store_b.get_pkt(9).unwrap().is_some());
        assert_eq!(store_a.repeating_sns().unwrap(), vec![9]);
        assert!(store_b.repeating_sns().unwrap().is_empty());
    }

    #[test]
    fn test_plan_repeat_branches() {
        // Cap reached.
        assert_eq!(plan_repeat(10.0, Some(9.0), Some(9.5), 5, 5), RepeatAction::Cancel);

        // Never sent.
        assert_eq!(plan_repeat(10.0, None, None, 5, 0), RepeatAction::SendNow);

        // Half-initialized schedule counts as unscheduled.
        assert_eq!(plan_repeat(10.0, Some(9.0), None, 5, 1), RepeatAction::SendNow);

        // Not due yet.
        match plan_repeat(10.0, Some(9.0), Some(10.4), 5, 1) {
            RepeatAction::Wait(delta) => assert!((delta - 0.4).abs() < 1e-9),
            action => panic!("Unexpected action {:?}", action),
        }

        // Due.
        assert_eq!(plan_repeat(10.5, Some(9.0), Some(10.4), 5, 1), RepeatAction::SendNow);
    }
}
