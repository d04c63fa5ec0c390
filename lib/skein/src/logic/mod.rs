use crate::cluster::ClusterState;
use crate::conn::{ConnError, ConnectionManager};
use crate::pktstore::{SpecialPacketStore, StoreError};
use crate::shm::{ContainerType, SharedStateClient, ShmError};
use crate::wire::{subjects, Body, Fields, Packet};
use keel::logging::{self, Logger};
use serde_json::{json, Map, Value};
use std::net::SocketAddrV4;

pub mod controller;

pub use self::controller::ControllerLogic;

/// State-machine transitions surfaced by response handling. These ride the
/// error channel up to the core, which maps them onto the cluster state and
/// the process exit code; they are not failures.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ClusterSignal {
    JoinedCluster,
    JoinRejected,
    LeftCluster,
    LeaveRejected,
}

#[derive(Debug, PartialEq)]
pub enum LogicError {
    /// The packet parsed but is contextually irrelevant; dropped at debug.
    Drop(&'static str),
    Signal(ClusterSignal),
    Conn(ConnError),
    Shm(ShmError),
    Store(StoreError),
}

impl From<ConnError> for LogicError {
    #[inline]
    fn from(err: ConnError) -> LogicError {
        LogicError::Conn(err)
    }
}

impl From<ShmError> for LogicError {
    #[inline]
    fn from(err: ShmError) -> LogicError {
        LogicError::Shm(err)
    }
}

impl From<StoreError> for LogicError {
    #[inline]
    fn from(err: StoreError) -> LogicError {
        LogicError::Store(err)
    }
}

/// Engine pieces the handlers work against, passed in per call so the
/// handler itself stays free of borrowed state.
pub struct LogicContext<'a> {
    pub state: &'a mut ClusterState,
    pub conns: &'a mut ConnectionManager,
    pub pkt_store: &'a SpecialPacketStore,
    pub local: SocketAddrV4,
    pub identification: &'a str,
}

/// Dispatches unwrapped packets by type and subject. The default methods
/// implement the behavior every role shares: forwarding DATA while WORKING,
/// matching RESPONSEs against the packet store and completing connection
/// establishment. The controller overrides request handling; other roles
/// leave requests to it.
pub trait LogicHandler {
    fn handle_logic(&mut self, pkt: &Packet, ctx: &mut LogicContext) -> Result<Vec<Packet>, LogicError> {
        let fields = pkt.fields.as_ref().ok_or(LogicError::Drop("packet has no fields"))?;

        match &fields.body {
            Body::Data(_) => self.handle_data(pkt, fields, ctx),
            Body::Ctrl { subject, content } => {
                if *subject == subjects::RESPONSE {
                    self.handle_response(content, ctx)
                } else {
                    self.handle_ctrl_request(*subject, content, fields, ctx)
                }
            }
            Body::ConnCtrl {
                iv_changed,
                iv_duration,
                iv,
            } => self.handle_conn_ctrl(pkt, fields, *iv_changed, *iv_duration, iv, ctx),
        }
    }

    /// DATA flows only while the worker is WORKING; route optimization is
    /// not this layer's business, the next hop is the destination itself.
    fn handle_data(
        &mut self,
        _pkt: &Packet,
        fields: &Fields,
        ctx: &mut LogicContext,
    ) -> Result<Vec<Packet>, LogicError> {
        if *ctx.state != ClusterState::Working {
            return Err(LogicError::Drop("data packet outside WORKING state"));
        }

        let dest = fields.dest.ok_or(LogicError::Drop("data packet without destination"))?;

        Ok(vec![Packet::outbound(fields.clone(), dest)])
    }

    /// Requests are only answered by the controller role.
    fn handle_ctrl_request(
        &mut self,
        _subject: u32,
        _content: &Map<String, Value>,
        _fields: &Fields,
        _ctx: &mut LogicContext,
    ) -> Result<Vec<Packet>, LogicError> {
        Err(LogicError::Drop("request subject on a non-controller node"))
    }

    /// Matches a RESPONSE against the stored request it answers and finishes
    /// whatever that request started.
    fn handle_response(
        &mut self,
        content: &Map<String, Value>,
        ctx: &mut LogicContext,
    ) -> Result<Vec<Packet>, LogicError> {
        let responding_sn = content
            .get("responding_sn")
            .and_then(Value::as_u64)
            .ok_or(LogicError::Drop("response without responding_sn"))?;

        let original = ctx
            .pkt_store
            .get_pkt(responding_sn)?
            .ok_or(LogicError::Drop("response without a matching request"))?;
        let original_fields = original
            .fields
            .ok_or(LogicError::Drop("stored request without fields"))?;

        match &original_fields.body {
            Body::Ctrl { subject, .. } if *subject == subjects::JOIN_CLUSTER => {
                self.finish_join(responding_sn, content, ctx)
            }
            Body::Ctrl { subject, .. } if *subject == subjects::LEAVE_CLUSTER => {
                self.finish_leave(responding_sn, content, ctx)
            }
            Body::ConnCtrl { .. } => {
                // The peer acknowledged an IV offer.
                let remote = original_fields
                    .dest
                    .ok_or(LogicError::Drop("stored offer without destination"))?;

                ctx.pkt_store.remove_pkt(responding_sn)?;
                ctx.conns.promote(&remote, responding_sn)?;

                Ok(Vec::new())
            }
            _ => Err(LogicError::Drop("response to an unanswerable packet")),
        }
    }

    fn finish_join(
        &mut self,
        responding_sn: u64,
        content: &Map<String, Value>,
        ctx: &mut LogicContext,
    ) -> Result<Vec<Packet>, LogicError> {
        if *ctx.state != ClusterState::WaitingForJoin {
            return Err(LogicError::Drop("join response outside WAITING_FOR_JOIN"));
        }

        ctx.pkt_store.remove_pkt(responding_sn)?;

        if response_permitted(content) {
            Err(LogicError::Signal(ClusterSignal::JoinedCluster))
        } else {
            Err(LogicError::Signal(ClusterSignal::JoinRejected))
        }
    }

    fn finish_leave(
        &mut self,
        responding_sn: u64,
        content: &Map<String, Value>,
        ctx: &mut LogicContext,
    ) -> Result<Vec<Packet>, LogicError> {
        if *ctx.state != ClusterState::WaitingForLeave {
            return Err(LogicError::Drop("leave response outside WAITING_FOR_LEAVE"));
        }

        ctx.pkt_store.remove_pkt(responding_sn)?;

        if response_permitted(content) {
            Err(LogicError::Signal(ClusterSignal::LeftCluster))
        } else {
            Err(LogicError::Signal(ClusterSignal::LeaveRejected))
        }
    }

    /// An inbound IV offer: take it into use and acknowledge, so the
    /// initiator can rotate as well.
    fn handle_conn_ctrl(
        &mut self,
        pkt: &Packet,
        fields: &Fields,
        iv_changed: u8,
        iv_duration: u64,
        iv: &[u8],
        ctx: &mut LogicContext,
    ) -> Result<Vec<Packet>, LogicError> {
        if iv_changed == 0 {
            return Ok(Vec::new());
        }

        let remote = pkt
            .previous_hop
            .or(fields.src)
            .ok_or(LogicError::Drop("offer without an origin"))?;
        let sn = fields.sn.ok_or(LogicError::Drop("offer without a serial number"))?;

        ctx.conns.accept_offer(remote, sn, iv.to_vec(), iv_duration)?;

        let mut content = Map::new();
        content.insert("identification".into(), json!(ctx.identification));
        content.insert("responding_sn".into(), json!(sn));
        content.insert("body".into(), json!({ "accepted": true }));

        let reply = Fields::new(
            ctx.local,
            remote,
            Body::Ctrl {
                subject: subjects::RESPONSE,
                content,
            },
        );

        Ok(vec![Packet::outbound(reply, remote)])
    }
}

#[inline]
fn response_permitted(content: &Map<String, Value>) -> bool {
    content
        .get("body")
        .and_then(|body| body.get("permitted"))
        .and_then(Value::as_bool)
        .unwrap_or(false)
}

/// The node-shared container holding the latest pushed cluster status.
pub const CLUSTER_STATUS_KEY: &str = "cluster_status";

/// Logic of the forwarding roles (client, relay, outlet): shared behavior
/// plus bookkeeping of the controller's status pushes.
pub struct ForwarderLogic {
    shm: SharedStateClient,
    log: Logger,
}

impl ForwarderLogic {
    pub fn new<'a, L: Into<Option<&'a Logger>>>(
        shm: SharedStateClient,
        log: L,
    ) -> Result<ForwarderLogic, ShmError> {
        shm.create_key(CLUSTER_STATUS_KEY, ContainerType::Dict, None)?;

        Ok(ForwarderLogic {
            shm,
            log: match log.into() {
                Some(log) => log.new(logging::o!()),
                _ => logging::discard(),
            },
        })
    }
}

impl LogicHandler for ForwarderLogic {
    fn handle_ctrl_request(
        &mut self,
        subject: u32,
        content: &Map<String, Value>,
        _fields: &Fields,
        _ctx: &mut LogicContext,
    ) -> Result<Vec<Packet>, LogicError> {
        if subject != subjects::CLUSTER_STATUS_PUSHING {
            return Err(LogicError::Drop("request subject on a non-controller node"));
        }

        let nodes = match content.get("nodes") {
            Some(Value::Object(nodes)) => nodes.clone(),
            _ => return Err(LogicError::Drop("status push without nodes")),
        };

        logging::debug!(self.log, "cluster status pushed"; "nodes" => nodes.len());

        // The push replaces whatever snapshot was known before.
        match self.shm.clean_key(CLUSTER_STATUS_KEY) {
            Ok(()) | Err(ShmError::KeyError) => (),
            Err(err) => return Err(err.into()),
        }
        self.shm
            .create_key(CLUSTER_STATUS_KEY, ContainerType::Dict, Some(Value::Object(nodes)))?;

        Ok(Vec::new())
    }
}
