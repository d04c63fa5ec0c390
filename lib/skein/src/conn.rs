use crate::cryptor::Keyring;
use crate::idgen::IdGenerator;
use crate::pktstore::{SpecialPacketStore, StoreError, DEFAULT_MAX_REPEAT};
use crate::shm::{ContainerType, SharedStateClient, ShmError};
use crate::wire::{Body, Codec, Fields, Packet, WrapError};
use hashbrown::HashMap;
use keel::crypto;
use keel::logging::{self, Logger};
use rand::Rng;
use serde_derive::{Deserialize, Serialize};
use serde_json::json;
use std::convert::TryFrom;
use std::fmt;
use std::net::SocketAddrV4;
use std::thread;
use std::time::{Duration, Instant};

/// The node-shared container of per-peer connection slots.
pub const CONNS_KEY: &str = "connmgr_conns";

/// Keying state between this node and one peer.
///
/// A connection is a fake one: no stream, no handshake beyond the IV offer.
/// Establishing it means agreeing on an IV, and the three slots below hold
/// the IVs a peer pair is allowed to use at any moment.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum ConnState {
    Init = 0x00,
    Establishing = 0x01,
    Established = 0x02,
    Removing = 0x03,
    Removed = 0x04,
}

#[derive(Debug, Eq, PartialEq)]
pub struct UnknownConnState(pub u8);

impl fmt::Display for UnknownConnState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "unknown connection state 0x{:02x}", self.0)
    }
}

impl From<ConnState> for u8 {
    #[inline]
    fn from(state: ConnState) -> u8 {
        state as u8
    }
}

impl TryFrom<u8> for ConnState {
    type Error = UnknownConnState;

    fn try_from(byte: u8) -> Result<ConnState, UnknownConnState> {
        match byte {
            0x00 => Ok(ConnState::Init),
            0x01 => Ok(ConnState::Establishing),
            0x02 => Ok(ConnState::Established),
            0x03 => Ok(ConnState::Removing),
            0x04 => Ok(ConnState::Removed),
            other => Err(UnknownConnState(other)),
        }
    }
}

/// The three keying slots of a peer: 0 and 1 are usable (older and newer
/// established IVs), 2 is the staging area for an establishing one.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Slot {
    Slot0,
    Slot1,
    Slot2,
}

impl Slot {
    pub const ALL: [Slot; 3] = [Slot::Slot0, Slot::Slot1, Slot::Slot2];
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Connection {
    pub remote: SocketAddrV4,
    pub sn: u64,
    pub state: ConnState,
    #[serde(with = "keel::encoding::base64")]
    pub iv: Vec<u8>,
    pub iv_duration: u64,
}

/// The JSON projection of a peer's three slots as kept in shared state.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SlotTable {
    #[serde(rename = "slot-0", default)]
    pub slot0: Option<Connection>,
    #[serde(rename = "slot-1", default)]
    pub slot1: Option<Connection>,
    #[serde(rename = "slot-2", default)]
    pub slot2: Option<Connection>,
}

impl SlotTable {
    #[inline]
    pub fn get(&self, slot: Slot) -> &Option<Connection> {
        match slot {
            Slot::Slot0 => &self.slot0,
            Slot::Slot1 => &self.slot1,
            Slot::Slot2 => &self.slot2,
        }
    }

    #[inline]
    fn set(&mut self, slot: Slot, conn: Option<Connection>) {
        match slot {
            Slot::Slot0 => self.slot0 = conn,
            Slot::Slot1 => self.slot1 = conn,
            Slot::Slot2 => self.slot2 = conn,
        }
    }
}

#[derive(Debug, PartialEq)]
pub enum ConnError {
    SlotNotAvailable,
    NoConnAvailable,
    EstablishTimeout,
    MissingNextHop,
    Wrap(WrapError),
    Store(StoreError),
    Shm(ShmError),
}

impl From<ShmError> for ConnError {
    #[inline]
    fn from(err: ShmError) -> ConnError {
        ConnError::Shm(err)
    }
}

impl From<StoreError> for ConnError {
    #[inline]
    fn from(err: StoreError) -> ConnError {
        ConnError::Store(err)
    }
}

/// Manages the three-slot IV lifecycle for every peer of this node.
///
/// All slot tables live in shared state so the node's workers agree on the
/// keying material; this manager is the typed view one worker holds. Slot
/// writes go through a shared-state lock since they are read-modify-write.
pub struct ConnectionManager {
    shm: SharedStateClient,
    local: SocketAddrV4,
    iv_len: usize,
    iv_duration_range: (u64, u64),
    egress_counts: HashMap<SocketAddrV4, u64>,
    log: Logger,
}

impl ConnectionManager {
    pub fn new<'a, L: Into<Option<&'a Logger>>>(
        shm: SharedStateClient,
        local: SocketAddrV4,
        iv_len: usize,
        iv_duration_range: (u64, u64),
        log: L,
    ) -> Result<ConnectionManager, ShmError> {
        shm.create_key(CONNS_KEY, ContainerType::Dict, None)?;

        Ok(ConnectionManager {
            shm,
            local,
            iv_len,
            iv_duration_range,
            egress_counts: HashMap::new(),
            log: match log.into() {
                Some(log) => log.new(logging::o!()),
                _ => logging::discard(),
            },
        })
    }

    /// All slots of a peer, empty table when the peer is unknown.
    pub fn get_conns(&self, remote: &SocketAddrV4) -> Result<SlotTable, ShmError> {
        let value = self.shm.get_dict_value(CONNS_KEY, &remote_key(remote))?;

        if value.is_null() {
            return Ok(SlotTable::default());
        }

        serde_json::from_value(value).map_err(|_| ShmError::Unknown)
    }

    /// Slots currently free for a peer.
    pub fn get_usable_slots(&self, remote: &SocketAddrV4) -> Result<Vec<Slot>, ShmError> {
        let table = self.get_conns(remote)?;

        Ok(Slot::ALL
            .iter()
            .cloned()
            .filter(|&slot| table.get(slot).is_none())
            .collect())
    }

    /// The usable connection of a peer: the newer established IV wins.
    pub fn get_conn(&self, remote: &SocketAddrV4) -> Result<Connection, ConnError> {
        let table = self.get_conns(remote)?;

        for &slot in &[Slot::Slot1, Slot::Slot0] {
            if let Some(conn) = table.get(slot) {
                if conn.state == ConnState::Established {
                    return Ok(conn.clone());
                }
            }
        }

        Err(ConnError::NoConnAvailable)
    }

    /// Stores a connection into a slot, refusing occupied slots unless
    /// overriding. The refusal catches two workers establishing toward the
    /// same peer at once.
    pub fn store_conn(&self, conn: &Connection, slot: Slot, override_slot: bool) -> Result<(), ConnError> {
        self.shm.lock_key(CONNS_KEY)?;
        let result = self.store_conn_locked(conn, slot, override_slot);
        self.shm.unlock_key(CONNS_KEY)?;

        result
    }

    fn store_conn_locked(&self, conn: &Connection, slot: Slot, override_slot: bool) -> Result<(), ConnError> {
        let mut table = self.get_conns(&conn.remote)?;

        if !override_slot && table.get(slot).is_some() {
            return Err(ConnError::SlotNotAvailable);
        }

        table.set(slot, Some(conn.clone()));
        self.write_table(&conn.remote, &table)?;

        Ok(())
    }

    /// Nulls out one slot of a peer.
    pub fn remove_conn(&self, remote: &SocketAddrV4, slot: Slot) -> Result<(), ConnError> {
        self.shm.lock_key(CONNS_KEY)?;

        let result = self.get_conns(remote).and_then(|mut table| {
            table.set(slot, None);
            self.write_table(remote, &table)
        });

        self.shm.unlock_key(CONNS_KEY)?;
        result.map_err(Into::into)
    }

    /// Initiates a connection toward a peer: a fresh IV staged in slot-2 and
    /// a CONN_CTRL offer handed to the packet store for repeated delivery.
    ///
    /// With `synchronous` the call polls shared state until the offer has
    /// been acknowledged and rotated into a usable slot, or the timeout
    /// elapses.
    pub fn new_conn(
        &mut self,
        remote: SocketAddrV4,
        codec: &Codec,
        idgen: &mut IdGenerator,
        pkt_store: &SpecialPacketStore,
        synchronous: bool,
        timeout: Duration,
        interval: Duration,
    ) -> Result<Option<Connection>, ConnError> {
        let usable = self.get_usable_slots(&remote)?;

        if !usable.contains(&Slot::Slot2) {
            return Err(ConnError::SlotNotAvailable);
        }

        let mut iv = vec![0u8; self.iv_len];
        crypto::random_bytes(&mut iv);

        let (lo, hi) = self.iv_duration_range;
        let iv_duration = rand::thread_rng().gen_range(lo, hi + 1);

        let fields = Fields::new(
            self.local,
            remote,
            Body::ConnCtrl {
                iv_changed: 1,
                iv_duration,
                iv: iv.clone(),
            },
        );
        let mut pkt = Packet::outbound(fields, remote);
        codec.wrap(&mut pkt, Some(idgen)).map_err(ConnError::Wrap)?;
        pkt_store.repeat_pkt(&pkt, DEFAULT_MAX_REPEAT)?;

        let sn = pkt.sn().expect("Wrapped packet must carry a serial number");
        let conn = Connection {
            remote,
            sn,
            state: ConnState::Establishing,
            iv,
            iv_duration,
        };

        // The slot was free a moment ago, but another worker may have staged
        // its own offer in between.
        match self.store_conn(&conn, Slot::Slot2, false) {
            Err(ConnError::SlotNotAvailable) => {
                logging::warn!(self.log, "slot-2 seized, abandoning establishment";
                               "remote" => %remote);
                return Ok(None);
            }
            other => other?,
        }

        logging::debug!(self.log, "connection establishing";
                        "remote" => %remote,
                        "sn" => sn,
                        "iv_duration" => iv_duration);

        if !synchronous {
            return Ok(None);
        }

        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            thread::sleep(interval);

            let table = self.get_conns(&remote)?;
            for &slot in &[Slot::Slot1, Slot::Slot0] {
                if let Some(conn) = table.get(slot) {
                    if conn.sn == sn && conn.state == ConnState::Established {
                        return Ok(Some(conn.clone()));
                    }
                }
            }
        }

        Err(ConnError::EstablishTimeout)
    }

    /// Initiator side of establishment: the peer acknowledged the offer with
    /// the given serial number, so the staged connection rotates into use.
    /// Slot-0 drops off, slot-1 shifts down, the staged one becomes slot-1.
    pub fn promote(&mut self, remote: &SocketAddrV4, sn: u64) -> Result<Option<Connection>, ConnError> {
        self.shm.lock_key(CONNS_KEY)?;

        let result = self.get_conns(remote).and_then(|mut table| {
            let staged = match table.slot2.take() {
                Some(ref conn) if conn.sn == sn => {
                    let mut promoted = conn.clone();
                    promoted.state = ConnState::Established;
                    promoted
                }
                other => {
                    table.slot2 = other;
                    self.write_table(remote, &table)?;
                    return Ok(None);
                }
            };

            table.slot0 = table.slot1.take();
            table.slot1 = Some(staged.clone());
            self.write_table(remote, &table)?;

            Ok(Some(staged))
        });

        self.shm.unlock_key(CONNS_KEY)?;

        if let Ok(Some(conn)) = &result {
            self.egress_counts.remove(remote);
            logging::debug!(self.log, "connection established";
                            "remote" => %remote,
                            "sn" => conn.sn);
        }

        result.map_err(Into::into)
    }

    /// Recipient side of establishment: an offered IV is taken into use
    /// right away and the slots rotate, after which the caller acknowledges
    /// the offer toward the initiator.
    pub fn accept_offer(
        &mut self,
        remote: SocketAddrV4,
        sn: u64,
        iv: Vec<u8>,
        iv_duration: u64,
    ) -> Result<Connection, ConnError> {
        let conn = Connection {
            remote,
            sn,
            state: ConnState::Established,
            iv,
            iv_duration,
        };

        self.shm.lock_key(CONNS_KEY)?;

        let result = self.get_conns(&remote).and_then(|mut table| {
            table.slot0 = table.slot1.take();
            table.slot1 = Some(conn.clone());
            table.slot2 = None;
            self.write_table(&remote, &table)
        });

        self.shm.unlock_key(CONNS_KEY)?;
        result?;

        self.egress_counts.remove(&remote);
        logging::debug!(self.log, "accepted connection offer";
                        "remote" => %remote,
                        "sn" => sn);

        Ok(conn)
    }

    /// Encrypts the packet's wire bytes for its next hop, under the peer's
    /// established IV or the bootstrap IV when none exists. Returns true
    /// when the active IV has outlived its packet budget and the caller
    /// should initiate a rotation.
    pub fn seal(&mut self, pkt: &mut Packet, keyring: &Keyring) -> Result<bool, ConnError> {
        let remote = pkt.next_hop.ok_or(ConnError::MissingNextHop)?;

        let budget = match self.get_conn(&remote) {
            Ok(conn) => {
                pkt.data = keyring.cryptor(&conn.iv).encrypt(&pkt.data);
                Some(conn.iv_duration)
            }
            Err(ConnError::NoConnAvailable) => {
                pkt.data = keyring.default_cryptor().encrypt(&pkt.data);
                None
            }
            Err(err) => return Err(err),
        };

        let count = self.egress_counts.entry(remote).or_insert(0);
        *count += 1;

        Ok(budget.map(|duration| *count >= duration).unwrap_or(false))
    }

    /// Decrypts and unwraps an inbound datagram, trying the peer's IVs from
    /// newest to oldest: slot-1, slot-0, the still-establishing slot-2 (the
    /// peer may already have rotated while our acknowledgement is in
    /// flight), and finally the bootstrap IV. The MAC decides which guess
    /// was right.
    pub fn open(&self, raw: &[u8], from: SocketAddrV4, keyring: &Keyring, codec: &Codec) -> Packet {
        let table = self.get_conns(&from).unwrap_or_else(|err| {
            logging::debug!(self.log, "slot lookup failed during open"; "error" => ?err);
            SlotTable::default()
        });

        let mut cryptors = Vec::with_capacity(4);
        for &slot in &[Slot::Slot1, Slot::Slot0, Slot::Slot2] {
            if let Some(conn) = table.get(slot) {
                cryptors.push(keyring.cryptor(&conn.iv));
            }
        }
        cryptors.push(keyring.default_cryptor());

        for mut cryptor in cryptors {
            if let Ok(plain) = cryptor.decrypt(raw) {
                let mut pkt = Packet::inbound(plain, from);
                if codec.unwrap(&mut pkt).is_ok() {
                    return pkt;
                }
            }
        }

        let mut pkt = Packet::inbound(raw.to_vec(), from);
        pkt.valid = Some(false);
        pkt
    }

    fn write_table(&self, remote: &SocketAddrV4, table: &SlotTable) -> Result<(), ShmError> {
        let entry = json!({ remote_key(remote): serde_json::to_value(table).expect("Error encoding slots") });
        self.shm.add_value(CONNS_KEY, entry)
    }
}

#[inline]
fn remote_key(remote: &SocketAddrV4) -> String {
    format!("{}:{}", remote.ip(), remote.port())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shm::testutil::spawn_server;

    const IV_LEN: usize = 12;

    fn addr(port: u16) -> SocketAddrV4 {
        SocketAddrV4::new([10, 0, 0, 1].into(), port)
    }

    fn manager(server: &crate::shm::testutil::TestServer, name: &str) -> ConnectionManager {
        ConnectionManager::new(server.client(name), addr(4000), IV_LEN, (1000, 2000), None).unwrap()
    }

    fn conn(remote: SocketAddrV4, sn: u64, state: ConnState) -> Connection {
        Connection {
            remote,
            sn,
            state,
            iv: vec![sn as u8; IV_LEN],
            iv_duration: 1000,
        }
    }

    #[test]
    fn test_store_and_read_slots() {
        let server = spawn_server();
        let mgr = manager(&server, "conn-store.socket");
        let remote = addr(5001);

        mgr.store_conn(&conn(remote, 1, ConnState::Establishing), Slot::Slot2, false)
            .unwrap();

        let table = mgr.get_conns(&remote).unwrap();
        assert_eq!(table.slot2.as_ref().unwrap().sn, 1);
        assert!(table.slot0.is_none());

        let usable = mgr.get_usable_slots(&remote).unwrap();
        assert_eq!(usable, vec![Slot::Slot0, Slot::Slot1]);

        mgr.remove_conn(&remote, Slot::Slot2).unwrap();
        assert!(mgr.get_conns(&remote).unwrap().slot2.is_none());
        assert_eq!(mgr.get_usable_slots(&remote).unwrap().len(), 3);
    }

    #[test]
    fn test_store_conn_refuses_occupied_slot() {
        let server = spawn_server();
        let mgr = manager(&server, "conn-occ.socket");
        let remote = addr(5002);

        mgr.store_conn(&conn(remote, 1, ConnState::Establishing), Slot::Slot2, false)
            .unwrap();

        let result = mgr.store_conn(&conn(remote, 2, ConnState::Establishing), Slot::Slot2, false);
        assert_eq!(result.unwrap_err(), ConnError::SlotNotAvailable);

        mgr.store_conn(&conn(remote, 2, ConnState::Establishing), Slot::Slot2, true)
            .unwrap();
        assert_eq!(mgr.get_conns(&remote).unwrap().slot2.unwrap().sn, 2);
    }

    #[test]
    fn test_get_conn_prefers_newer_slot() {
        let server = spawn_server();
        let mgr = manager(&server, "conn-prio.socket");
        let remote = addr(5003);

        assert_eq!(mgr.get_conn(&remote).unwrap_err(), ConnError::NoConnAvailable);

        mgr.store_conn(&conn(remote, 1, ConnState::Established), Slot::Slot0, false)
            .unwrap();
        assert_eq!(mgr.get_conn(&remote).unwrap().sn, 1);

        mgr.store_conn(&conn(remote, 2, ConnState::Established), Slot::Slot1, false)
            .unwrap();
        assert_eq!(mgr.get_conn(&remote).unwrap().sn, 2);
    }

    #[test]
    fn test_establishing_conn_is_not_usable() {
        let server = spawn_server();
        let mgr = manager(&server, "conn-unusable.socket");
        let remote = addr(5004);

        mgr.store_conn(&conn(remote, 1, ConnState::Establishing), Slot::Slot1, false)
            .unwrap();

        assert_eq!(mgr.get_conn(&remote).unwrap_err(), ConnError::NoConnAvailable);
    }

    #[test]
    fn test_promote_rotates_slots() {
        let server = spawn_server();
        let mut mgr = manager(&server, "conn-promote.socket");
        let remote = addr(5005);

        mgr.store_conn(&conn(remote, 1, ConnState::Established), Slot::Slot0, false)
            .unwrap();
        mgr.store_conn(&conn(remote, 2, ConnState::Established), Slot::Slot1, false)
            .unwrap();
        mgr.store_conn(&conn(remote, 3, ConnState::Establishing), Slot::Slot2, false)
            .unwrap();

        let promoted = mgr.promote(&remote, 3).unwrap().unwrap();
        assert_eq!(promoted.state, ConnState::Established);

        let table = mgr.get_conns(&remote).unwrap();
        assert_eq!(table.slot0.as_ref().unwrap().sn, 2);
        assert_eq!(table.slot1.as_ref().unwrap().sn, 3);
        assert!(table.slot2.is_none());

        // At most two established connections survive a rotation.
        let established = Slot::ALL
            .iter()
            .filter(|&&slot| {
                table
                    .get(slot)
                    .as_ref()
                    .map(|conn| conn.state == ConnState::Established)
                    .unwrap_or(false)
            })
            .count();
        assert_eq!(established, 2);
    }

    #[test]
    fn test_promote_ignores_unknown_sn() {
        let server = spawn_server();
        let mut mgr = manager(&server, "conn-wrongsn.socket");
        let remote = addr(5006);

        mgr.store_conn(&conn(remote, 3, ConnState::Establishing), Slot::Slot2, false)
            .unwrap();

        assert!(mgr.promote(&remote, 99).unwrap().is_none());
        assert!(mgr.get_conns(&remote).unwrap().slot2.is_some());
    }

    #[test]
    fn test_accept_offer_rotates_immediately() {
        let server = spawn_server();
        let mut mgr = manager(&server, "conn-accept.socket");
        let remote = addr(5007);

        mgr.store_conn(&conn(remote, 1, ConnState::Established), Slot::Slot1, false)
            .unwrap();

        let accepted = mgr.accept_offer(remote, 9, vec![9u8; IV_LEN], 5000).unwrap();
        assert_eq!(accepted.state, ConnState::Established);

        let table = mgr.get_conns(&remote).unwrap();
        assert_eq!(table.slot0.as_ref().unwrap().sn, 1);
        assert_eq!(table.slot1.as_ref().unwrap().sn, 9);
        assert!(table.slot2.is_none());
    }

    #[test]
    fn test_new_conn_stages_offer() {
        let server = spawn_server();
        let mut mgr = manager(&server, "conn-new.socket");
        let store = SpecialPacketStore::new(server.client("conn-new-store.socket"), 3001, None).unwrap();
        let codec = Codec::new(8, IV_LEN);
        let mut idgen = IdGenerator::new(1, 1);
        let remote = addr(5008);

        let result = mgr
            .new_conn(
                remote,
                &codec,
                &mut idgen,
                &store,
                false,
                Duration::from_secs(1),
                Duration::from_millis(50),
            )
            .unwrap();
        assert!(result.is_none());

        let staged = mgr.get_conns(&remote).unwrap().slot2.unwrap();
        assert_eq!(staged.state, ConnState::Establishing);
        assert_eq!(staged.iv.len(), IV_LEN);
        assert!(staged.iv_duration >= 1000 && staged.iv_duration <= 2000);

        // The offer sits in the store, scheduled for repetition.
        assert_eq!(store.repeating_sns().unwrap(), vec![staged.sn]);
        let offer = store.get_pkt(staged.sn).unwrap().unwrap();
        match offer.fields.unwrap().body {
            Body::ConnCtrl { iv_changed, iv, .. } => {
                assert_eq!(iv_changed, 1);
                assert_eq!(iv, staged.iv);
            }
            body => panic!("Unexpected body {:?}", body),
        }

        // A second establishment toward the same peer must back off.
        let result = mgr.new_conn(
            remote,
            &codec,
            &mut idgen,
            &store,
            false,
            Duration::from_secs(1),
            Duration::from_millis(50),
        );
        assert_eq!(result.unwrap_err(), ConnError::SlotNotAvailable);
    }

    #[test]
    fn test_synchronous_new_conn_times_out_unacknowledged() {
        let server = spawn_server();
        let mut mgr = manager(&server, "conn-sync.socket");
        let store = SpecialPacketStore::new(server.client("conn-sync-store.socket"), 3002, None).unwrap();
        let codec = Codec::new(8, IV_LEN);
        let mut idgen = IdGenerator::new(1, 2);

        let result = mgr.new_conn(
            addr(5009),
            &codec,
            &mut idgen,
            &store,
            true,
            Duration::from_millis(300),
            Duration::from_millis(50),
        );

        assert_eq!(result.unwrap_err(), ConnError::EstablishTimeout);
    }

    #[test]
    fn test_seal_open_roundtrip_with_default_iv() {
        let server = spawn_server();
        let mut sender = manager(&server, "conn-seal-a.socket");
        let receiver = manager(&server, "conn-seal-b.socket");
        let keyring = Keyring::new("chacha20-poly1305", "a shared password", IV_LEN);
        let codec = Codec::new(8, IV_LEN);
        let mut idgen = IdGenerator::new(1, 3);

        let fields = Fields::new(addr(4000), addr(5010), Body::Data(vec![42; 64]));
        let mut pkt = Packet::outbound(fields, addr(5010));
        codec.wrap(&mut pkt, Some(&mut idgen)).unwrap();
        let wire = pkt.data.clone();

        let exhausted = sender.seal(&mut pkt, &keyring).unwrap();
        assert!(!exhausted);
        assert_ne!(pkt.data, wire);

        let opened = receiver.open(&pkt.data, addr(4000), &keyring, &codec);
        assert_eq!(opened.valid, Some(true));
        assert_eq!(opened.fields.unwrap().body, Body::Data(vec![42; 64]));
    }

    #[test]
    fn test_seal_open_roundtrip_with_established_iv() {
        let server = spawn_server();
        let mut sender = manager(&server, "conn-est-a.socket");
        let receiver = manager(&server, "conn-est-b.socket");
        let keyring = Keyring::new("chacha20", "a shared password", IV_LEN);
        let codec = Codec::new(8, IV_LEN);
        let mut idgen = IdGenerator::new(1, 4);

        let peer = addr(5011);
        let local = addr(4000);
        let shared_iv = vec![0x5a; IV_LEN];

        // Both directions of the pair share the negotiated IV; each side
        // stores it under the other's address.
        let mut outbound = conn(peer, 7, ConnState::Established);
        outbound.iv = shared_iv.clone();
        sender.store_conn(&outbound, Slot::Slot1, false).unwrap();

        let mut inbound = conn(local, 7, ConnState::Established);
        inbound.iv = shared_iv;
        receiver.store_conn(&inbound, Slot::Slot1, false).unwrap();

        let fields = Fields::new(local, peer, Body::Data(vec![7; 16]));
        let mut pkt = Packet::outbound(fields, peer);
        codec.wrap(&mut pkt, Some(&mut idgen)).unwrap();

        sender.seal(&mut pkt, &keyring).unwrap();

        let opened = receiver.open(&pkt.data, local, &keyring, &codec);
        assert_eq!(opened.valid, Some(true));
    }

    #[test]
    fn test_seal_reports_exhausted_budget() {
        let server = spawn_server();
        let mut mgr = manager(&server, "conn-budget.socket");
        let keyring = Keyring::new("chacha20", "a shared password", IV_LEN);
        let remote = addr(5012);

        let mut active = conn(remote, 1, ConnState::Established);
        active.iv_duration = 2;
        mgr.store_conn(&active, Slot::Slot1, false).unwrap();

        let mut pkt = Packet::inbound(vec![0; 8], remote);
        pkt.next_hop = Some(remote);

        assert!(!mgr.seal(&mut pkt, &keyring).unwrap());
        assert!(mgr.seal(&mut pkt, &keyring).unwrap());
    }

    #[test]
    fn test_open_garbage_is_invalid() {
        let server = spawn_server();
        let mgr = manager(&server, "conn-garbage.socket");
        let keyring = Keyring::new("chacha20-poly1305", "a shared password", IV_LEN);
        let codec = Codec::new(8, IV_LEN);

        let opened = mgr.open(&[0u8; 200], addr(5013), &keyring, &codec);

        assert_eq!(opened.valid, Some(false));
        assert!(opened.fields.is_none());
    }
}
