use serde_derive::{Deserialize, Serialize};
use serde_json::Value;
use std::convert::TryFrom;

/// Request verbs of the shared-state protocol.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Action {
    Connect = 0xf0,
    Disconnect = 0xff,

    Create = 0x01,
    Read = 0x02,
    Set = 0x03,
    Add = 0x04,
    Get = 0x05,

    Clean = 0x11,
    Remove = 0x12,

    Lock = 0x21,
    Unlock = 0x22,
}

impl TryFrom<u8> for Action {
    type Error = u8;

    fn try_from(byte: u8) -> Result<Action, u8> {
        match byte {
            0xf0 => Ok(Action::Connect),
            0xff => Ok(Action::Disconnect),
            0x01 => Ok(Action::Create),
            0x02 => Ok(Action::Read),
            0x03 => Ok(Action::Set),
            0x04 => Ok(Action::Add),
            0x05 => Ok(Action::Get),
            0x11 => Ok(Action::Clean),
            0x12 => Ok(Action::Remove),
            0x21 => Ok(Action::Lock),
            0x22 => Ok(Action::Unlock),
            other => Err(other),
        }
    }
}

impl Action {
    /// Whether the action is subject to the per-key locking discipline.
    #[inline]
    pub fn respects_locks(self) -> bool {
        match self {
            Action::Connect | Action::Disconnect | Action::Get => false,
            _ => true,
        }
    }
}

/// Result codes returned to clients.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Rcode {
    Ok = 0x00,
    KeyError = 0x01,
    TypeError = 0x02,
    Locked = 0x03,
    NotLocked = 0x04,
    UnknownError = 0xff,
}

impl From<Rcode> for u8 {
    #[inline]
    fn from(rcode: Rcode) -> u8 {
        rcode as u8
    }
}

/// One shared-state request, JSON over a single datagram. Absent fields are
/// omitted on the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conn_id: Option<String>,
    pub action: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub socket: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub container_type: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backlogging: Option<bool>,
}

impl Request {
    pub fn new(action: Action) -> Request {
        Request {
            conn_id: None,
            action: action as u8,
            socket: None,
            key: None,
            container_type: None,
            value: None,
            value_key: None,
            backlogging: None,
        }
    }
}

/// One shared-state response datagram.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    pub succeeded: bool,
    pub rcode: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conn_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
}

impl Response {
    #[inline]
    pub fn ok(value: Option<Value>) -> Response {
        Response {
            succeeded: true,
            rcode: Rcode::Ok.into(),
            conn_id: None,
            value,
        }
    }

    #[inline]
    pub fn err(rcode: Rcode) -> Response {
        Response {
            succeeded: false,
            rcode: rcode.into(),
            conn_id: None,
            value: None,
        }
    }

    #[inline]
    pub fn is_locked(&self) -> bool {
        self.rcode == Rcode::Locked as u8
    }
}
