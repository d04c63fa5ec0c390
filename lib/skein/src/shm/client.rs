use crate::shm::proto::{Action, Rcode, Request, Response};
use crate::shm::{ContainerType, ShmError};
use keel::logging::{self, Logger};
use keel::UDP_DATA_MAX_LEN;
use serde_json::Value;
use std::fs;
use std::os::unix::net::UnixDatagram;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// How long a client blocks on a reply before surfacing a timeout.
pub const RESPONSE_TIMEOUT: Duration = Duration::from_secs(4);

/// Client half of the shared-state protocol.
///
/// Each client binds its own reply socket under the configured socket
/// directory and hands its name to the server during CONNECT; every request
/// then blocks on that socket until the reply datagram lands or the receive
/// timeout trips.
pub struct SharedStateClient {
    sock: UnixDatagram,
    server_path: PathBuf,
    reply_path: PathBuf,
    conn_id: Option<String>,
    backlogging: bool,
    log: Logger,
}

impl SharedStateClient {
    pub fn new<'a, L: Into<Option<&'a Logger>>>(
        socket_dir: &Path,
        manager_socket_name: &str,
        socket_name: &str,
        log: L,
    ) -> Result<SharedStateClient, ShmError> {
        let reply_path = socket_dir.join(socket_name);
        let sock = UnixDatagram::bind(&reply_path)?;
        sock.set_read_timeout(Some(RESPONSE_TIMEOUT))?;

        let client_log = match log.into() {
            Some(log) => log.new(logging::o!()),
            _ => logging::discard(),
        };

        Ok(SharedStateClient {
            sock,
            server_path: socket_dir.join(manager_socket_name),
            reply_path,
            conn_id: None,
            backlogging: true,
            log: client_log,
        })
    }

    /// Disables (or re-enables) server-side backlogging for this client's
    /// requests; with backlogging off a locked key surfaces as
    /// `ShmError::Locked` instead of blocking.
    #[inline]
    pub fn set_backlogging(&mut self, enabled: bool) {
        self.backlogging = enabled;
    }

    /// Performs the CONNECT handshake and stores the allocated conn id.
    pub fn connect(&mut self) -> Result<(), ShmError> {
        let socket_name = self
            .reply_path
            .file_name()
            .and_then(|name| name.to_str())
            .map(str::to_string)
            .ok_or(ShmError::ConnectFailed)?;

        let mut request = Request::new(Action::Connect);
        request.socket = Some(socket_name);

        let response = self.roundtrip(&request).map_err(|err| match err {
            ShmError::ResponseTimeout => ShmError::ConnectFailed,
            other => other,
        })?;

        match response.conn_id {
            Some(conn_id) if response.succeeded => {
                logging::debug!(self.log, "connected to shared state"; "conn_id" => &conn_id);
                self.conn_id = Some(conn_id);
                Ok(())
            }
            _ => Err(ShmError::ConnectFailed),
        }
    }

    /// Tears the connection down and removes the reply socket file.
    pub fn disconnect(self) {
        if let Some(conn_id) = &self.conn_id {
            let mut request = Request::new(Action::Disconnect);
            request.conn_id = Some(conn_id.clone());

            if let Ok(data) = serde_json::to_vec(&request) {
                let _ = self.sock.send_to(&data, &self.server_path);
            }
        }

        let _ = fs::remove_file(&self.reply_path);
    }

    pub fn create_key(&self, key: &str, kind: ContainerType, value: Option<Value>) -> Result<(), ShmError> {
        let mut request = self.keyed_request(Action::Create, key)?;
        request.container_type = Some(kind as u8);
        request.value = value;

        self.expect_ok(&request).map(|_| ())
    }

    pub fn read_key(&self, key: &str) -> Result<Value, ShmError> {
        let request = self.keyed_request(Action::Read, key)?;
        self.expect_ok(&request)
            .map(|response| response.value.unwrap_or(Value::Null))
    }

    pub fn set_value(&self, key: &str, value: Value) -> Result<(), ShmError> {
        let mut request = self.keyed_request(Action::Set, key)?;
        request.value = Some(value);

        self.expect_ok(&request).map(|_| ())
    }

    pub fn add_value(&self, key: &str, value: Value) -> Result<(), ShmError> {
        let mut request = self.keyed_request(Action::Add, key)?;
        request.value = Some(value);

        self.expect_ok(&request).map(|_| ())
    }

    pub fn get_dict_value(&self, key: &str, value_key: &str) -> Result<Value, ShmError> {
        let mut request = self.keyed_request(Action::Get, key)?;
        request.value_key = Some(value_key.to_string());

        self.expect_ok(&request)
            .map(|response| response.value.unwrap_or(Value::Null))
    }

    pub fn remove_value(&self, key: &str, values: Vec<Value>) -> Result<(), ShmError> {
        let mut request = self.keyed_request(Action::Remove, key)?;
        request.value = Some(Value::Array(values));

        self.expect_ok(&request).map(|_| ())
    }

    pub fn clean_key(&self, key: &str) -> Result<(), ShmError> {
        let request = self.keyed_request(Action::Clean, key)?;
        self.expect_ok(&request).map(|_| ())
    }

    pub fn lock_key(&self, key: &str) -> Result<(), ShmError> {
        let request = self.keyed_request(Action::Lock, key)?;
        self.expect_ok(&request).map(|_| ())
    }

    pub fn unlock_key(&self, key: &str) -> Result<(), ShmError> {
        let request = self.keyed_request(Action::Unlock, key)?;
        self.expect_ok(&request).map(|_| ())
    }

    fn keyed_request(&self, action: Action, key: &str) -> Result<Request, ShmError> {
        let conn_id = self.conn_id.clone().ok_or(ShmError::NotConnected)?;

        let mut request = Request::new(action);
        request.conn_id = Some(conn_id);
        request.key = Some(key.to_string());

        if !self.backlogging {
            request.backlogging = Some(false);
        }

        Ok(request)
    }

    fn expect_ok(&self, request: &Request) -> Result<Response, ShmError> {
        let response = self.roundtrip(request)?;

        if response.succeeded {
            Ok(response)
        } else {
            Err(rcode_error(response.rcode))
        }
    }

    fn roundtrip(&self, request: &Request) -> Result<Response, ShmError> {
        let data = serde_json::to_vec(request).expect("Error encoding request");
        self.sock.send_to(&data, &self.server_path)?;

        let mut buf = vec![0u8; UDP_DATA_MAX_LEN];
        let (count, _) = self.sock.recv_from(&mut buf)?;

        serde_json::from_slice(&buf[..count]).map_err(|_| ShmError::Unknown)
    }
}

#[inline]
fn rcode_error(rcode: u8) -> ShmError {
    match rcode {
        rcode if rcode == Rcode::KeyError as u8 => ShmError::KeyError,
        rcode if rcode == Rcode::TypeError as u8 => ShmError::TypeError,
        rcode if rcode == Rcode::Locked as u8 => ShmError::Locked,
        rcode if rcode == Rcode::NotLocked as u8 => ShmError::NotLocked,
        _ => ShmError::Unknown,
    }
}
