use crate::cluster::{ClusterNode, Role};
use crate::logic::{LogicContext, LogicError, LogicHandler};
use crate::shm::{ContainerType, SharedStateClient, ShmError};
use crate::wire::{subjects, Body, Fields, Packet};
use hashbrown::HashMap;
use keel::logging::{self, Logger};
use serde_derive::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::net::SocketAddrV4;

/// The controller's membership table, kept in shared state so all of its
/// workers answer from the same view.
pub const CLUSTER_NODES_KEY: &str = "controller_cluster-nodes";

/// One entry of the operator-configured node roster: which address and role
/// an identification is allowed to claim.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeDefinition {
    pub ip: String,
    pub role: Role,
}

/// Logic of the controller role: admits and removes members, answers
/// configuration reads and pushes membership snapshots after every change.
pub struct ControllerLogic {
    identification: String,
    configured_nodes: HashMap<String, NodeDefinition>,
    shm: SharedStateClient,
    log: Logger,
}

impl ControllerLogic {
    pub fn new<'a, L: Into<Option<&'a Logger>>>(
        identification: String,
        configured_nodes: HashMap<String, NodeDefinition>,
        shm: SharedStateClient,
        log: L,
    ) -> Result<ControllerLogic, ShmError> {
        if configured_nodes.is_empty() {
            panic!("cluster_nodes is not configured");
        }

        shm.create_key(CLUSTER_NODES_KEY, ContainerType::Dict, None)?;

        Ok(ControllerLogic {
            identification,
            configured_nodes,
            shm,
            log: match log.into() {
                Some(log) => log.new(logging::o!()),
                _ => logging::discard(),
            },
        })
    }

    /// Current membership as stored in shared state.
    pub fn cluster_nodes(&self) -> Result<HashMap<String, ClusterNode>, ShmError> {
        let value = self.shm.read_key(CLUSTER_NODES_KEY)?;
        serde_json::from_value(value).map_err(|_| ShmError::Unknown)
    }

    fn add_cluster_node(&self, identification: &str, node: &ClusterNode) -> Result<(), ShmError> {
        let entry = json!({ identification: serde_json::to_value(node).expect("Error encoding node") });
        self.shm.add_value(CLUSTER_NODES_KEY, entry)
    }

    fn remove_cluster_node(&self, identification: &str) -> Result<(), ShmError> {
        self.shm
            .remove_value(CLUSTER_NODES_KEY, vec![json!(identification)])
    }

    /// When the cluster has registered relays, control responses travel
    /// through one of them instead of straight back to the requester.
    fn relay_hop(&self, nodes: &HashMap<String, ClusterNode>) -> Option<SocketAddrV4> {
        nodes
            .values()
            .find(|node| node.role == Role::Relay)
            .and_then(|relay| format!("{}:{}", relay.ip, relay.port).parse().ok())
    }

    fn response_pkt(
        &self,
        responding_sn: u64,
        body: Value,
        requester: SocketAddrV4,
        local: SocketAddrV4,
        nodes: &HashMap<String, ClusterNode>,
    ) -> Packet {
        let mut content = Map::new();
        content.insert("identification".into(), json!(self.identification));
        content.insert("responding_sn".into(), json!(responding_sn));
        content.insert("body".into(), body);

        let fields = Fields::new(
            local,
            requester,
            Body::Ctrl {
                subject: subjects::RESPONSE,
                content,
            },
        );

        let next_hop = self.relay_hop(nodes).unwrap_or(requester);
        Packet::outbound(fields, next_hop)
    }

    /// Membership snapshot pushes toward every registered member.
    fn status_pushes(&self, local: SocketAddrV4, nodes: &HashMap<String, ClusterNode>) -> Vec<Packet> {
        let snapshot = serde_json::to_value(nodes).expect("Error encoding membership");

        nodes
            .values()
            .filter_map(|node| {
                let dest: SocketAddrV4 = format!("{}:{}", node.ip, node.port).parse().ok()?;

                let mut content = Map::new();
                content.insert("nodes".into(), snapshot.clone());

                let fields = Fields::new(
                    local,
                    dest,
                    Body::Ctrl {
                        subject: subjects::CLUSTER_STATUS_PUSHING,
                        content,
                    },
                );

                Some(Packet::outbound(fields, dest))
            })
            .collect()
    }

    fn handle_join(
        &mut self,
        content: &Map<String, Value>,
        fields: &Fields,
        ctx: &mut LogicContext,
    ) -> Result<Vec<Packet>, LogicError> {
        let identification = content
            .get("identification")
            .and_then(Value::as_str)
            .ok_or(LogicError::Drop("join without identification"))?;
        let claimed_ip = content
            .get("ip")
            .and_then(Value::as_str)
            .ok_or(LogicError::Drop("join without ip"))?;
        let listen_port = content
            .get("listen_port")
            .and_then(Value::as_u64)
            .ok_or(LogicError::Drop("join without listen_port"))? as u16;
        let requester = fields.src.ok_or(LogicError::Drop("join without src"))?;
        let sn = fields.sn.ok_or(LogicError::Drop("join without sn"))?;

        let permitted = match self.configured_nodes.get(identification) {
            Some(definition) if definition.ip == claimed_ip => {
                self.add_cluster_node(
                    identification,
                    &ClusterNode {
                        ip: definition.ip.clone(),
                        port: listen_port,
                        role: definition.role,
                    },
                )?;

                logging::info!(self.log, "join permitted";
                               "identification" => identification,
                               "ip" => claimed_ip,
                               "port" => listen_port);
                true
            }
            _ => {
                logging::info!(self.log, "join rejected";
                               "identification" => identification,
                               "ip" => claimed_ip);
                false
            }
        };

        let nodes = self.cluster_nodes()?;
        let mut out = vec![self.response_pkt(sn, json!({ "permitted": permitted }), requester, ctx.local, &nodes)];

        if permitted {
            out.extend(self.status_pushes(ctx.local, &nodes));
        }

        Ok(out)
    }

    fn handle_leave(
        &mut self,
        content: &Map<String, Value>,
        fields: &Fields,
        ctx: &mut LogicContext,
    ) -> Result<Vec<Packet>, LogicError> {
        let identification = content
            .get("identification")
            .and_then(Value::as_str)
            .ok_or(LogicError::Drop("leave without identification"))?;
        let requester = fields.src.ok_or(LogicError::Drop("leave without src"))?;
        let sn = fields.sn.ok_or(LogicError::Drop("leave without sn"))?;

        let permitted = self.cluster_nodes()?.contains_key(identification);

        if permitted {
            self.remove_cluster_node(identification)?;
            logging::info!(self.log, "leave permitted"; "identification" => identification);
        } else {
            logging::info!(self.log, "leave rejected"; "identification" => identification);
        }

        let nodes = self.cluster_nodes()?;
        let mut out = vec![self.response_pkt(sn, json!({ "permitted": permitted }), requester, ctx.local, &nodes)];

        if permitted {
            out.extend(self.status_pushes(ctx.local, &nodes));
        }

        Ok(out)
    }

    /// Answers a configuration read with the shareable part of the cluster
    /// setup: which identification is allowed to claim which role.
    fn handle_read_config(
        &mut self,
        fields: &Fields,
        ctx: &mut LogicContext,
    ) -> Result<Vec<Packet>, LogicError> {
        let requester = fields.src.ok_or(LogicError::Drop("config read without src"))?;
        let sn = fields.sn.ok_or(LogicError::Drop("config read without sn"))?;

        let roster: Map<String, Value> = self
            .configured_nodes
            .iter()
            .map(|(identification, definition)| {
                (identification.clone(), json!(definition.role.as_str()))
            })
            .collect();

        let nodes = self.cluster_nodes()?;
        Ok(vec![self.response_pkt(
            sn,
            json!({ "cluster_nodes": roster }),
            requester,
            ctx.local,
            &nodes,
        )])
    }
}

impl LogicHandler for ControllerLogic {
    fn handle_ctrl_request(
        &mut self,
        subject: u32,
        content: &Map<String, Value>,
        fields: &Fields,
        ctx: &mut LogicContext,
    ) -> Result<Vec<Packet>, LogicError> {
        match subject {
            subjects::JOIN_CLUSTER => self.handle_join(content, fields, ctx),
            subjects::LEAVE_CLUSTER => self.handle_leave(content, fields, ctx),
            subjects::READ_CLUSTER_CONFIG => self.handle_read_config(fields, ctx),
            _ => Err(LogicError::Drop("unknown request subject")),
        }
    }
}
