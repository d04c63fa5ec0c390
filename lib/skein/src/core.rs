use crate::cluster::{ClusterState, Role};
use crate::conn::{ConnError, ConnectionManager};
use crate::cryptor::Keyring;
use crate::idgen::IdGenerator;
use crate::io::{Afferent, Efferent};
use crate::logic::{ClusterSignal, LogicContext, LogicError, LogicHandler};
use crate::pktstore::{SpecialPacketStore, StoreError, DEFAULT_MAX_REPEAT};
use crate::shm::{ContainerType, SharedStateClient, ShmError};
use crate::wire::{subjects, Body, Codec, Fields, Packet, WrapError};
use hashbrown::HashMap;
use keel::logging::{self, Logger};
use keel::UDP_DATA_MAX_LEN;
use mio::unix::UnixReady;
use mio::{Events, Poll, Token};
use serde_json::{json, Map, Value};
use std::io;
use std::net::SocketAddrV4;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// The shared list through which workers allocate their core ids.
pub const CORE_IDS_KEY: &str = "node_core-ids";

/// How long a worker keeps soliciting the controller before giving up.
pub const JOIN_TIMEOUT: Duration = Duration::from_secs(5);

/// How long a departing worker waits for its detach acknowledgement.
pub const LEAVE_TIMEOUT: Duration = Duration::from_secs(2);

const POLL_TIMEOUT: Duration = Duration::from_secs(1);
const BOOTSTRAP_POLL_TIMEOUT: Duration = Duration::from_millis(100);
const MAIN_AFFERENT_TOKEN: usize = 0;

/// Takes the next free core id from the shared list, under its lock. The
/// shared-state server serializes the allocation, so two workers can never
/// draw the same id.
pub fn allocate_core_id(shm: &SharedStateClient) -> Result<u64, ShmError> {
    shm.create_key(CORE_IDS_KEY, ContainerType::List, None)?;
    shm.lock_key(CORE_IDS_KEY)?;

    let result = (|| {
        let list = shm.read_key(CORE_IDS_KEY)?;
        let next = list
            .as_array()
            .and_then(|units| units.last())
            .and_then(Value::as_u64)
            .map(|last| last + 1)
            .unwrap_or(0);

        shm.add_value(CORE_IDS_KEY, json!([next]))?;
        Ok(next)
    })();

    shm.unlock_key(CORE_IDS_KEY)?;
    result
}

/// The identity a worker core acts under.
#[derive(Debug, Clone)]
pub struct NodeProfile {
    pub role: Role,
    pub identification: String,
    pub listen: SocketAddrV4,
    pub entrance: Option<SocketAddrV4>,
}

#[derive(Debug)]
pub enum CoreError {
    JoinRejected,
    JoinTimeout,
    Wrap(WrapError),
    Store(StoreError),
    Shm(ShmError),
    Io(io::ErrorKind),
}

impl From<io::Error> for CoreError {
    #[inline]
    fn from(err: io::Error) -> CoreError {
        CoreError::Io(err.kind())
    }
}

impl From<ShmError> for CoreError {
    #[inline]
    fn from(err: ShmError) -> CoreError {
        CoreError::Shm(err)
    }
}

impl From<StoreError> for CoreError {
    #[inline]
    fn from(err: StoreError) -> CoreError {
        CoreError::Store(err)
    }
}

/// A worker core: one receive socket (plus optional minor afferents)
/// multiplexed by a level-triggered poll. Every readable datagram runs the
/// same pipeline: open, unwrap, handle, wrap, seal, transmit.
pub struct Core<L: LogicHandler> {
    profile: NodeProfile,
    afferents: HashMap<usize, Afferent>,
    next_token: usize,
    efferent: Efferent,
    codec: Codec,
    keyring: Keyring,
    idgen: IdGenerator,
    conns: ConnectionManager,
    pkt_store: SpecialPacketStore,
    logic: L,
    state: ClusterState,
    signal: Option<ClusterSignal>,
    poll: Poll,
    running: Arc<AtomicBool>,
    log: Logger,
}

impl<L: LogicHandler> Core<L> {
    #[allow(clippy::too_many_arguments)]
    pub fn new<'a, G: Into<Option<&'a Logger>>>(
        profile: NodeProfile,
        main_afferent: Afferent,
        efferent: Efferent,
        codec: Codec,
        keyring: Keyring,
        idgen: IdGenerator,
        conns: ConnectionManager,
        pkt_store: SpecialPacketStore,
        logic: L,
        log: G,
    ) -> io::Result<Core<L>> {
        let poll = Poll::new()?;
        main_afferent.register(&poll, Token(MAIN_AFFERENT_TOKEN))?;

        let mut afferents = HashMap::new();
        afferents.insert(MAIN_AFFERENT_TOKEN, main_afferent);

        Ok(Core {
            profile,
            afferents,
            next_token: MAIN_AFFERENT_TOKEN + 1,
            efferent,
            codec,
            keyring,
            idgen,
            conns,
            pkt_store,
            logic,
            state: ClusterState::Init,
            signal: None,
            poll,
            running: Arc::new(AtomicBool::new(true)),
            log: match log.into() {
                Some(log) => log.new(logging::o!()),
                _ => logging::discard(),
            },
        })
    }

    #[inline]
    pub fn state(&self) -> ClusterState {
        self.state
    }

    #[inline]
    pub fn shutdown_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.running)
    }

    /// Registers an additional (minor) afferent on the poll.
    pub fn plug_afferent(&mut self, afferent: Afferent) -> io::Result<()> {
        let token = self.next_token;
        self.next_token += 1;

        afferent.register(&self.poll, Token(token))?;
        self.afferents.insert(token, afferent);

        Ok(())
    }

    /// Removes an afferent from the poll and destroys its socket.
    pub fn unplug_afferent(&mut self, token: usize) {
        if let Some(afferent) = self.afferents.remove(&token) {
            let _ = afferent.deregister(&self.poll);
            logging::warn!(self.log, "afferent unplugged"; "token" => token);
        }
    }

    /// Joins the cluster (unless this is the controller), then serves the
    /// event loop until shut down.
    pub fn run(&mut self) -> Result<(), CoreError> {
        self.bootstrap()?;
        self.state = ClusterState::Working;

        logging::info!(self.log, "worker core running";
                       "role" => self.profile.role.as_str(),
                       "listen" => %self.profile.listen);

        let mut events = Events::with_capacity(1024);
        let mut buf = vec![0u8; UDP_DATA_MAX_LEN];

        while self.running.load(Ordering::Relaxed) {
            self.poll_once(&mut events, &mut buf, POLL_TIMEOUT)?;
        }

        self.farewell();

        logging::info!(self.log, "worker core exited");
        Ok(())
    }

    /// Announces the detach to the controller on the way out, waiting
    /// briefly for the acknowledgement. Shutting down proceeds either way;
    /// the controller will otherwise just carry a stale member.
    fn farewell(&mut self) -> Option<ClusterSignal> {
        if self.profile.role == Role::Controller {
            return None;
        }

        let entrance = self.profile.entrance?;

        match self.state {
            ClusterState::Working | ClusterState::JoinedCluster => (),
            _ => return None,
        }

        let mut content = Map::new();
        content.insert("identification".into(), json!(self.profile.identification));

        let fields = Fields::new(
            self.profile.listen,
            entrance,
            Body::Ctrl {
                subject: subjects::LEAVE_CLUSTER,
                content,
            },
        );
        let mut pkt = Packet::outbound(fields, entrance);

        if self.codec.wrap(&mut pkt, Some(&mut self.idgen)).is_err() {
            return None;
        }

        // Stored so the response can be matched, but not repeated: the
        // repeater is already winding down with the rest of the node.
        if self.pkt_store.store_pkt(&pkt, false, DEFAULT_MAX_REPEAT).is_err() {
            return None;
        }

        self.state = ClusterState::WaitingForLeave;
        logging::info!(self.log, "leaving cluster"; "entrance" => %entrance);
        self.transmit(&mut pkt);

        let mut events = Events::with_capacity(64);
        let mut buf = vec![0u8; UDP_DATA_MAX_LEN];
        let deadline = Instant::now() + LEAVE_TIMEOUT;

        while Instant::now() < deadline {
            if self.poll_once(&mut events, &mut buf, BOOTSTRAP_POLL_TIMEOUT).is_err() {
                break;
            }

            match self.signal.take() {
                Some(signal @ ClusterSignal::LeftCluster) => {
                    logging::info!(self.log, "left the cluster");
                    return Some(signal);
                }
                Some(signal @ ClusterSignal::LeaveRejected) => return Some(signal),
                _ => (),
            }
        }

        None
    }

    /// Allocate nothing, claim nothing: the bootstrap's only shared-state
    /// interaction happens through the packet store. Core-id allocation runs
    /// before construction (the id generator needs it).
    fn bootstrap(&mut self) -> Result<(), CoreError> {
        let entrance = match (self.profile.role, self.profile.entrance) {
            (Role::Controller, _) => return Ok(()),
            (_, Some(entrance)) => entrance,
            (_, None) => {
                logging::warn!(self.log, "no cluster entrance configured, running detached");
                return Ok(());
            }
        };

        let mut content = Map::new();
        content.insert("identification".into(), json!(self.profile.identification));
        content.insert("ip".into(), json!(self.profile.listen.ip().to_string()));
        content.insert("listen_port".into(), json!(self.profile.listen.port()));

        let fields = Fields::new(
            self.profile.listen,
            entrance,
            Body::Ctrl {
                subject: subjects::JOIN_CLUSTER,
                content,
            },
        );
        let mut pkt = Packet::outbound(fields, entrance);

        self.codec
            .wrap(&mut pkt, Some(&mut self.idgen))
            .map_err(CoreError::Wrap)?;
        self.pkt_store.repeat_pkt(&pkt, DEFAULT_MAX_REPEAT)?;

        self.state = ClusterState::WaitingForJoin;
        logging::info!(self.log, "joining cluster"; "entrance" => %entrance);

        // First solicitation goes out right away; the repeater drives any
        // retransmissions after that.
        self.transmit(&mut pkt);

        let mut events = Events::with_capacity(256);
        let mut buf = vec![0u8; UDP_DATA_MAX_LEN];
        let deadline = Instant::now() + JOIN_TIMEOUT;

        while Instant::now() < deadline {
            self.poll_once(&mut events, &mut buf, BOOTSTRAP_POLL_TIMEOUT)?;

            match self.signal.take() {
                Some(ClusterSignal::JoinedCluster) => {
                    self.state = ClusterState::JoinedCluster;
                    logging::info!(self.log, "joined the cluster");
                    return Ok(());
                }
                Some(ClusterSignal::JoinRejected) => {
                    logging::error!(self.log, "the cluster rejected us");
                    return Err(CoreError::JoinRejected);
                }
                _ => (),
            }
        }

        logging::error!(self.log, "no join response within the deadline");
        Err(CoreError::JoinTimeout)
    }

    fn poll_once(
        &mut self,
        events: &mut Events,
        buf: &mut [u8],
        timeout: Duration,
    ) -> Result<(), CoreError> {
        self.poll.poll(events, Some(timeout))?;

        for event in events.iter() {
            let token = event.token().0;

            if UnixReady::from(event.readiness()).is_error() {
                self.unplug_afferent(token);
                continue;
            }

            if event.readiness().is_readable() {
                self.drain_afferent(token, buf);
            }
        }

        Ok(())
    }

    fn drain_afferent(&mut self, token: usize, buf: &mut [u8]) {
        loop {
            let received = match self.afferents.get(&token) {
                Some(afferent) => afferent.recv(buf),
                None => return,
            };

            match received {
                Ok(pkt) => self.handle_datagram(pkt),
                Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => return,
                Err(err) => {
                    logging::warn!(self.log, "receive failure"; "error" => %err);
                    self.unplug_afferent(token);
                    return;
                }
            }
        }
    }

    fn handle_datagram(&mut self, raw: Packet) {
        let from = match raw.previous_hop {
            Some(from) => from,
            None => return,
        };

        let pkt = self.conns.open(&raw.data, from, &self.keyring, &self.codec);

        if pkt.valid != Some(true) {
            logging::debug!(self.log, "dropping invalid datagram"; "from" => %from);
            return;
        }

        let result = {
            let Core {
                ref mut logic,
                ref mut conns,
                ref mut state,
                ref pkt_store,
                ref profile,
                ..
            } = *self;

            let mut ctx = LogicContext {
                state,
                conns,
                pkt_store,
                local: profile.listen,
                identification: &profile.identification,
            };

            logic.handle_logic(&pkt, &mut ctx)
        };

        match result {
            Ok(out) => {
                for pkt in out {
                    self.dispatch(pkt);
                }
            }
            Err(LogicError::Drop(reason)) => {
                logging::debug!(self.log, "dropping packet"; "from" => %from, "reason" => reason);
            }
            Err(LogicError::Signal(signal)) => self.on_signal(signal),
            Err(err) => {
                logging::warn!(self.log, "logic failure"; "from" => %from, "error" => ?err);
            }
        }
    }

    fn dispatch(&mut self, mut pkt: Packet) {
        if let Err(err) = self.codec.wrap(&mut pkt, Some(&mut self.idgen)) {
            logging::warn!(self.log, "wrap failure"; "error" => ?err);
            return;
        }

        self.transmit(&mut pkt);
    }

    /// Seals and sends a wrapped packet, initiating an IV rotation when the
    /// active connection has exhausted its packet budget.
    fn transmit(&mut self, pkt: &mut Packet) {
        let exhausted = match self.conns.seal(pkt, &self.keyring) {
            Ok(exhausted) => exhausted,
            Err(err) => {
                logging::warn!(self.log, "seal failure"; "error" => ?err);
                return;
            }
        };

        if let Err(err) = self.efferent.transmit(pkt) {
            logging::debug!(self.log, "transmit failure"; "error" => %err);
        }

        if exhausted {
            if let Some(remote) = pkt.next_hop {
                self.rotate(remote);
            }
        }
    }

    fn rotate(&mut self, remote: SocketAddrV4) {
        let result = self.conns.new_conn(
            remote,
            &self.codec,
            &mut self.idgen,
            &self.pkt_store,
            false,
            Duration::from_secs(2),
            Duration::from_millis(100),
        );

        match result {
            Ok(_) => {
                logging::debug!(self.log, "iv rotation initiated"; "remote" => %remote);
            }
            // Another establishment toward this peer is already staged.
            Err(ConnError::SlotNotAvailable) => (),
            Err(err) => {
                logging::warn!(self.log, "iv rotation failed"; "remote" => %remote, "error" => ?err);
            }
        }
    }

    fn on_signal(&mut self, signal: ClusterSignal) {
        logging::debug!(self.log, "cluster signal"; "signal" => ?signal);

        match signal {
            ClusterSignal::LeftCluster => self.running.store(false, Ordering::Relaxed),
            ClusterSignal::LeaveRejected => {
                // Leaving ends the worker either way; a rejected detach is
                // logged for the operator but not retried.
                logging::warn!(self.log, "cluster rejected our detach request");
                self.running.store(false, Ordering::Relaxed);
            }
            _ => (),
        }

        self.signal = Some(signal);
    }
}
