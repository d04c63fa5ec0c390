use serde_derive::{Deserialize, Serialize};

/// Per-worker cluster-controlling state. DATA traffic only flows while the
/// worker is WORKING; everything before that is the join choreography.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ClusterState {
    Init = 0x00,
    WaitingForJoin = 0x01,
    WaitingForLeave = 0x02,
    JoinedCluster = 0x11,
    Working = 0x21,
}

/// What a node does in the overlay.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Client = 0x01,
    Relay = 0x02,
    Outlet = 0x03,
    Controller = 0x04,
}

impl Role {
    /// Parses the CLI spelling: a role name or its hex code.
    pub fn from_name(name: &str) -> Option<Role> {
        match name {
            "client" | "0x01" => Some(Role::Client),
            "relay" | "0x02" => Some(Role::Relay),
            "outlet" | "0x03" => Some(Role::Outlet),
            "controller" | "0x04" => Some(Role::Controller),
            _ => None,
        }
    }

    #[inline]
    pub fn as_str(self) -> &'static str {
        match self {
            Role::Client => "client",
            Role::Relay => "relay",
            Role::Outlet => "outlet",
            Role::Controller => "controller",
        }
    }
}

/// A registered member of the cluster, as kept in the controller's
/// membership table and pushed around in status snapshots.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterNode {
    pub ip: String,
    pub port: u16,
    pub role: Role,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_role_spellings() {
        assert_eq!(Role::from_name("relay"), Some(Role::Relay));
        assert_eq!(Role::from_name("0x04"), Some(Role::Controller));
        assert_eq!(Role::from_name("gateway"), None);
        assert_eq!(Role::Relay.as_str(), "relay");
    }

    #[test]
    fn test_cluster_node_json_shape() {
        let node = ClusterNode {
            ip: "10.1.0.1".into(),
            port: 9000,
            role: Role::Outlet,
        };

        assert_eq!(
            serde_json::to_value(&node).unwrap(),
            json!({"ip": "10.1.0.1", "port": 9000, "role": "outlet"})
        );
    }
}
