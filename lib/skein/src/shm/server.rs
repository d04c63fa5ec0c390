use crate::shm::containers::{Container, ContainerType};
use crate::shm::proto::{Action, Rcode, Request, Response};
use hashbrown::HashMap;
use indexmap::IndexMap;
use keel::crypto;
use keel::logging::{self, Logger};
use keel::UDP_DATA_MAX_LEN;
use mio::{Events, Poll, PollOpt, Ready, Token};
use mio_uds::UnixDatagram;
use serde_json::Value;
use std::convert::TryFrom;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Poll timeout while the backlog is empty.
pub const POLL_TIMEOUT: Duration = Duration::from_secs(4);

/// Poll timeout while backlogged requests are waiting on a lock; kept small
/// so backlog retry latency stays small.
const BACKLOG_POLL_TIMEOUT: Duration = Duration::from_millis(10);

const SERVER_TOKEN: Token = Token(0);

struct PeerConn {
    reply_path: PathBuf,
}

struct Pending {
    conn_id: String,
    request: Request,
}

enum Outcome {
    Reply(Response),
    Backlog,
    Silent,
}

/// The per-node shared-state coordinator.
///
/// A single-threaded daemon owning every shared container and lock; workers
/// talk to it over a Unix SOCK_DGRAM socket with one JSON request per
/// datagram and (except for DISCONNECT) one JSON response back to the
/// client's own reply socket. Single-threadedness is the serialization
/// guarantee: every mutation happens in arrival order.
pub struct SharedStateServer {
    socket_path: PathBuf,
    socket_dir: PathBuf,
    sock: UnixDatagram,
    resources: HashMap<String, Container>,
    locks: HashMap<String, String>,
    conns: IndexMap<String, PeerConn>,
    backlog: Vec<Pending>,
    running: Arc<AtomicBool>,
    log: Logger,
}

impl SharedStateServer {
    pub fn new<'a, L: Into<Option<&'a Logger>>>(
        socket_dir: &Path,
        socket_name: &str,
        log: L,
    ) -> io::Result<SharedStateServer> {
        let socket_path = socket_dir.join(socket_name);
        let sock = UnixDatagram::bind(&socket_path)?;

        let server_log = match log.into() {
            Some(log) => log.new(logging::o!()),
            _ => logging::discard(),
        };

        Ok(SharedStateServer {
            socket_path,
            socket_dir: socket_dir.to_path_buf(),
            sock,
            resources: HashMap::new(),
            locks: HashMap::new(),
            conns: IndexMap::new(),
            backlog: Vec::new(),
            running: Arc::new(AtomicBool::new(true)),
            log: server_log,
        })
    }

    /// Flag handle that makes `run` wind down on its next iteration.
    #[inline]
    pub fn shutdown_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.running)
    }

    /// The readiness loop: drain ready datagrams, then give every backlogged
    /// request another chance with backlogging disabled.
    pub fn run(&mut self) -> io::Result<()> {
        let poll = Poll::new()?;
        poll.register(&self.sock, SERVER_TOKEN, Ready::readable(), PollOpt::level())?;

        let mut events = Events::with_capacity(256);
        let mut buf = vec![0u8; UDP_DATA_MAX_LEN];

        logging::info!(self.log, "shared state server running";
                       "socket" => %self.socket_path.display());

        while self.running.load(Ordering::Relaxed) {
            let timeout = if self.backlog.is_empty() {
                POLL_TIMEOUT
            } else {
                BACKLOG_POLL_TIMEOUT
            };

            poll.poll(&mut events, Some(timeout))?;

            for _event in &events {
                loop {
                    match self.sock.recv_from(&mut buf) {
                        Ok((count, _)) => self.dispatch(&buf[..count]),
                        Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => break,
                        Err(err) => return Err(err),
                    }
                }
            }

            self.retry_backlog();
        }

        let _ = fs::remove_file(&self.socket_path);
        logging::info!(self.log, "shared state server exited");

        Ok(())
    }

    fn dispatch(&mut self, raw: &[u8]) {
        // Unparseable datagrams might be stray writes, drop them silently.
        let request: Request = match serde_json::from_slice(raw) {
            Ok(request) => request,
            Err(_) => return,
        };

        match self.handle(&request, true) {
            Outcome::Reply(response) => {
                let conn_id = response
                    .conn_id
                    .clone()
                    .or_else(|| request.conn_id.clone());

                if let Some(conn_id) = conn_id {
                    self.send_reply(&conn_id, &response);
                }
            }
            Outcome::Backlog => {
                logging::debug!(self.log, "request backlogged";
                                "key" => request.key.as_ref().map(String::as_str).unwrap_or(""),
                                "action" => request.action);

                self.backlog.push(Pending {
                    conn_id: request.conn_id.clone().unwrap_or_default(),
                    request,
                });
            }
            Outcome::Silent => (),
        }
    }

    fn retry_backlog(&mut self) {
        if self.backlog.is_empty() {
            return;
        }

        let pending = std::mem::replace(&mut self.backlog, Vec::new());

        for item in pending {
            // The owner of the request went away, nobody is waiting anymore.
            if !self.conns.contains_key(&item.conn_id) {
                continue;
            }

            match self.handle(&item.request, false) {
                Outcome::Reply(ref response) if response.is_locked() => self.backlog.push(item),
                Outcome::Reply(response) => self.send_reply(&item.conn_id, &response),
                _ => (),
            }
        }
    }

    fn handle(&mut self, request: &Request, may_backlog: bool) -> Outcome {
        let action = match Action::try_from(request.action) {
            Ok(action) => action,
            // Unknown actions might be stray writes as well.
            Err(_) => return Outcome::Silent,
        };

        match action {
            Action::Connect => self.handle_connect(request),
            Action::Disconnect => self.handle_disconnect(request),
            _ => {
                let conn_id = match &request.conn_id {
                    Some(conn_id) if self.conns.contains_key(conn_id) => conn_id.clone(),
                    _ => return Outcome::Silent,
                };

                if action.respects_locks() {
                    if let Some(key) = &request.key {
                        if let Some(owner) = self.locks.get(key) {
                            if *owner != conn_id {
                                if may_backlog && request.backlogging.unwrap_or(true) {
                                    return Outcome::Backlog;
                                }
                                return Outcome::Reply(Response::err(Rcode::Locked));
                            }
                        }
                    }
                }

                let key = match &request.key {
                    Some(key) => key.clone(),
                    None => return Outcome::Reply(Response::err(Rcode::UnknownError)),
                };

                let result = match action {
                    Action::Create => self.handle_create(request, &key),
                    Action::Read => self.handle_read(&key),
                    Action::Set => self.handle_set(request, &key),
                    Action::Add => self.handle_add(request, &key),
                    Action::Get => self.handle_get(request, &key),
                    Action::Clean => self.handle_clean(&key),
                    Action::Remove => self.handle_remove(request, &key),
                    Action::Lock => self.handle_lock(&conn_id, &key),
                    Action::Unlock => self.handle_unlock(&conn_id, &key),
                    _ => unreachable!(),
                };

                match result {
                    Ok(value) => Outcome::Reply(Response::ok(value)),
                    Err(rcode) => Outcome::Reply(Response::err(rcode)),
                }
            }
        }
    }

    fn handle_connect(&mut self, request: &Request) -> Outcome {
        let socket = match &request.socket {
            Some(socket) => socket,
            None => return Outcome::Silent,
        };

        let conn_id = gen_conn_id();
        let reply_path = self.socket_dir.join(socket);

        self.conns.insert(conn_id.clone(), PeerConn { reply_path });

        logging::debug!(self.log, "connection established"; "conn_id" => &conn_id);

        let mut response = Response::ok(None);
        response.conn_id = Some(conn_id);

        Outcome::Reply(response)
    }

    fn handle_disconnect(&mut self, request: &Request) -> Outcome {
        if let Some(conn_id) = &request.conn_id {
            self.conns.shift_remove(conn_id);

            // Locks held by the departing connection are released so that
            // backlogged requests of other connections can complete.
            self.locks.retain(|_, owner| owner != conn_id);

            logging::debug!(self.log, "connection dropped"; "conn_id" => conn_id.as_str());
        }

        Outcome::Silent
    }

    fn handle_create(&mut self, request: &Request, key: &str) -> Result<Option<Value>, Rcode> {
        let kind = request
            .container_type
            .and_then(|byte| ContainerType::try_from(byte).ok())
            .ok_or(Rcode::TypeError)?;

        if let Some(existing) = self.resources.get(key) {
            // Re-creation with the same type is a no-op so that workers can
            // initialize shared containers without racing each other.
            if existing.kind() == kind {
                return Ok(None);
            }
            return Err(Rcode::TypeError);
        }

        let container = Container::from_initial(kind, request.value.clone())?;
        self.resources.insert(key.to_string(), container);

        Ok(None)
    }

    fn handle_read(&self, key: &str) -> Result<Option<Value>, Rcode> {
        match self.resources.get(key) {
            Some(container) => Ok(Some(container.to_value())),
            None => Err(Rcode::KeyError),
        }
    }

    fn handle_set(&mut self, request: &Request, key: &str) -> Result<Option<Value>, Rcode> {
        let value = request.value.clone().ok_or(Rcode::TypeError)?;
        let container = self.resources.get_mut(key).ok_or(Rcode::KeyError)?;

        container.set(value)?;
        Ok(None)
    }

    fn handle_add(&mut self, request: &Request, key: &str) -> Result<Option<Value>, Rcode> {
        let value = request.value.clone().ok_or(Rcode::TypeError)?;
        let container = self.resources.get_mut(key).ok_or(Rcode::KeyError)?;

        container.add(value)?;
        Ok(None)
    }

    fn handle_get(&self, request: &Request, key: &str) -> Result<Option<Value>, Rcode> {
        let value_key = request.value_key.as_ref().ok_or(Rcode::UnknownError)?;
        let container = self.resources.get(key).ok_or(Rcode::KeyError)?;

        container.get(value_key).map(Some)
    }

    fn handle_clean(&mut self, key: &str) -> Result<Option<Value>, Rcode> {
        match self.resources.remove(key) {
            Some(_) => Ok(None),
            None => Err(Rcode::KeyError),
        }
    }

    fn handle_remove(&mut self, request: &Request, key: &str) -> Result<Option<Value>, Rcode> {
        let values = request.value.clone().ok_or(Rcode::TypeError)?;
        let container = self.resources.get_mut(key).ok_or(Rcode::KeyError)?;

        container.remove(values)?;
        Ok(None)
    }

    fn handle_lock(&mut self, conn_id: &str, key: &str) -> Result<Option<Value>, Rcode> {
        // The key does not have to exist; a lock is a name, not a container.
        self.locks.insert(key.to_string(), conn_id.to_string());
        Ok(None)
    }

    fn handle_unlock(&mut self, conn_id: &str, key: &str) -> Result<Option<Value>, Rcode> {
        match self.locks.get(key) {
            Some(owner) if owner == conn_id => {
                self.locks.remove(key);
                Ok(None)
            }
            // Foreign owners were already filtered by the lock check.
            _ => Err(Rcode::NotLocked),
        }
    }

    fn send_reply(&mut self, conn_id: &str, response: &Response) {
        let conn = match self.conns.get(conn_id) {
            Some(conn) => conn,
            None => return,
        };

        let data = serde_json::to_vec(response).expect("Error encoding response");

        if let Err(err) = self.sock.send_to(&data, &conn.reply_path) {
            logging::debug!(self.log, "failed to deliver response";
                            "conn_id" => conn_id,
                            "error" => %err);
        }
    }
}

#[inline]
fn gen_conn_id() -> String {
    let mut raw = [0u8; 16];
    crypto::random_bytes(&mut raw);
    keel::encoding::hex::encode(&raw)
}
