//! Shared node state: typed containers behind a single-threaded coordinator
//! process, reached over local datagram IPC.

pub mod client;
pub mod containers;
pub mod proto;
pub mod server;

pub use self::client::SharedStateClient;
pub use self::containers::{Container, ContainerType};
pub use self::proto::{Action, Rcode, Request, Response};
pub use self::server::SharedStateServer;

use std::io;

#[derive(Debug, Eq, PartialEq)]
pub enum ShmError {
    NotConnected,
    ConnectFailed,
    ResponseTimeout,
    KeyError,
    TypeError,
    Locked,
    NotLocked,
    AddrInUse,
    Io(io::ErrorKind),
    Unknown,
}

impl From<io::Error> for ShmError {
    #[inline]
    fn from(err: io::Error) -> ShmError {
        match err.kind() {
            io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut => ShmError::ResponseTimeout,
            io::ErrorKind::AddrInUse => ShmError::AddrInUse,
            kind => ShmError::Io(kind),
        }
    }
}

#[cfg(test)]
pub(crate) mod testutil {
    use super::*;
    use std::fs;
    use std::os::unix::net::UnixDatagram;
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::thread::JoinHandle;

    static SCRATCH_COUNTER: AtomicUsize = AtomicUsize::new(0);

    pub const MANAGER_SOCKET: &str = "manager.socket";

    /// A shared-state server on a scratch socket directory, running on its
    /// own thread for the duration of a test.
    pub struct TestServer {
        pub dir: PathBuf,
        stop: Arc<AtomicBool>,
        handle: Option<JoinHandle<()>>,
    }

    pub fn spawn_server() -> TestServer {
        let dir = std::env::temp_dir().join(format!(
            "skein-shm-{}-{}",
            std::process::id(),
            SCRATCH_COUNTER.fetch_add(1, Ordering::Relaxed)
        ));
        fs::create_dir_all(&dir).unwrap();

        let mut server = SharedStateServer::new(&dir, MANAGER_SOCKET, None).unwrap();
        let stop = server.shutdown_handle();

        let handle = std::thread::spawn(move || {
            server.run().unwrap();
        });

        TestServer {
            dir,
            stop,
            handle: Some(handle),
        }
    }

    impl TestServer {
        pub fn client(&self, name: &str) -> SharedStateClient {
            let mut client = SharedStateClient::new(&self.dir, MANAGER_SOCKET, name, None).unwrap();
            client.connect().unwrap();
            client
        }
    }

    impl Drop for TestServer {
        fn drop(&mut self) {
            self.stop.store(false, Ordering::Relaxed);

            // Kick the poll awake; the junk datagram is dropped silently.
            if let Ok(sock) = UnixDatagram::unbound() {
                let _ = sock.send_to(b"wake", self.dir.join(MANAGER_SOCKET));
            }

            if let Some(handle) = self.handle.take() {
                let _ = handle.join();
            }

            let _ = fs::remove_dir_all(&self.dir);
        }
    }
}
