use crate::config::Config;
use keel::logging::{self, Logger};
use skein::cluster::Role;
use skein::conn::ConnectionManager;
use skein::core::{allocate_core_id, Core, CoreError, NodeProfile};
use skein::cryptor::Keyring;
use skein::idgen::IdGenerator;
use skein::io::{Afferent, Efferent};
use skein::logic::{ControllerLogic, ForwarderLogic, LogicHandler};
use skein::pktstore::{Repeater, SpecialPacketStore};
use skein::shm::{SharedStateClient, SharedStateServer};
use std::env;
use std::fs;
use std::os::unix::net::UnixDatagram;
use std::path::Path;
use std::process::{self, Child, Command};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

/// Set by the SIGTERM/SIGINT handler; every long-running entrypoint watches
/// it and winds its component down.
static SHUTDOWN: AtomicBool = AtomicBool::new(false);

extern "C" fn handle_term(_signal: libc::c_int) {
    SHUTDOWN.store(true, Ordering::Relaxed);
}

fn install_term_handler() {
    unsafe {
        libc::signal(libc::SIGTERM, handle_term as libc::sighandler_t);
        libc::signal(libc::SIGINT, handle_term as libc::sighandler_t);
    }
}

/// Bridges the process-level shutdown flag onto a component's own handle.
fn watch_term(handle: Arc<AtomicBool>) {
    thread::spawn(move || loop {
        if SHUTDOWN.load(Ordering::Relaxed) {
            handle.store(false, Ordering::Relaxed);
            return;
        }

        thread::sleep(Duration::from_millis(200));
    });
}

/// The master: writes the pid file, brings up the shared-state server, the
/// worker cores and their repeaters as child processes, and supervises them
/// until a signal or a child failure takes the node down.
pub fn start(config: &Config, role: Role, config_path: &str) -> i32 {
    let log = config.logger("main");
    install_term_handler();

    if let Some(pid) = read_pid(config) {
        if process_alive(pid) {
            logging::error!(log, "node already running"; "pid" => pid);
            return 1;
        }
    }

    fs::create_dir_all(&config.shm.socket_dir).expect("Failed to create the shm socket directory");
    fs::write(&config.basic.pid_file, process::id().to_string()).expect("Failed to write the pid file");

    // Lead a process group of our own so `stop` can signal the whole node
    // tree through the pid file. When setsid fails we already lead one, and
    // the pgid equals our pid either way.
    unsafe {
        libc::setsid();
    }

    let exe = env::current_exe().expect("Failed to locate the running executable");
    let mut children: Vec<(String, Child)> = Vec::new();

    let shm = Command::new(&exe)
        .args(&["start", "-c", config_path, "--process", "shm"])
        .spawn()
        .expect("Failed to spawn the shared state server");
    children.push(("shm".to_string(), shm));

    let manager_socket = Path::new(&config.shm.socket_dir).join(&config.shm.manager_socket_name);
    if !wait_for_socket(&manager_socket) {
        logging::error!(log, "shared state server never came up";
                        "socket" => %manager_socket.display());
        terminate_children(&mut children);
        let _ = fs::remove_file(&config.basic.pid_file);
        return 1;
    }

    for index in 0..config.basic.worker_amount {
        let worker = Command::new(&exe)
            .args(&["start", "-c", config_path, "-r", role.as_str(), "--process", "worker"])
            .spawn()
            .expect("Failed to spawn a worker");
        let worker_pid = worker.id().to_string();
        children.push((format!("worker-{}", index), worker));

        let repeater = Command::new(&exe)
            .args(&[
                "start",
                "-c",
                config_path,
                "-r",
                role.as_str(),
                "--process",
                "repeater",
                "--worker-pid",
                &worker_pid,
            ])
            .spawn()
            .expect("Failed to spawn a repeater");
        children.push((format!("repeater-{}", index), repeater));
    }

    logging::info!(log, "node started";
                   "role" => role.as_str(),
                   "workers" => config.basic.worker_amount,
                   "pid" => process::id());

    let mut failed = false;

    'supervise: loop {
        if SHUTDOWN.load(Ordering::Relaxed) {
            logging::info!(log, "shutting down");
            break;
        }

        for (label, child) in children.iter_mut() {
            if let Ok(Some(status)) = child.try_wait() {
                logging::error!(log, "child process exited";
                                "child" => label.as_str(),
                                "status" => %status);
                failed = true;
                break 'supervise;
            }
        }

        thread::sleep(Duration::from_millis(200));
    }

    terminate_children(&mut children);
    let _ = fs::remove_file(&config.basic.pid_file);

    if failed {
        1
    } else {
        0
    }
}

/// Signals the running node through its pid file. The master leads the
/// process group, so the negative pid reaches the shared-state server, the
/// workers and the repeaters along with it.
pub fn stop(config: &Config) -> i32 {
    match read_pid(config) {
        Some(pid) => {
            unsafe {
                libc::kill(-pid, libc::SIGTERM);
            }
            println!("Sent SIGTERM to the skeind process group {}", pid);
            0
        }
        None => {
            eprintln!("pid file doesn't exist, seems skeind is not running");
            1
        }
    }
}

pub fn status(config: &Config) -> i32 {
    match read_pid(config) {
        Some(pid) if process_alive(pid) => {
            println!("skeind is running, master pid {}", pid);
            0
        }
        _ => {
            println!("skeind is not running");
            1
        }
    }
}

/// Entrypoint of the re-exec'd shared-state server process.
pub fn run_shm(config: &Config) -> i32 {
    let log = config.logger("shm");
    install_term_handler();

    let socket_dir = Path::new(&config.shm.socket_dir);
    fs::create_dir_all(socket_dir).expect("Failed to create the shm socket directory");

    let mut server = match SharedStateServer::new(socket_dir, &config.shm.manager_socket_name, &log) {
        Ok(server) => server,
        Err(err) => {
            logging::error!(log, "failed to bind the shared state socket"; "error" => %err);
            return 1;
        }
    };

    // Translate the signal into a loop shutdown, then kick the poll awake.
    let stop = server.shutdown_handle();
    let wake_path = socket_dir.join(&config.shm.manager_socket_name);
    thread::spawn(move || loop {
        if SHUTDOWN.load(Ordering::Relaxed) {
            stop.store(false, Ordering::Relaxed);

            if let Ok(sock) = UnixDatagram::unbound() {
                let _ = sock.send_to(b"wake", &wake_path);
            }
            return;
        }

        thread::sleep(Duration::from_millis(200));
    });

    match server.run() {
        Ok(()) => 0,
        Err(err) => {
            logging::error!(log, "shared state server failed"; "error" => %err);
            1
        }
    }
}

/// Entrypoint of a re-exec'd worker core process.
pub fn run_worker(config: &Config, role: Role) -> i32 {
    let log = config.logger("worker");
    install_term_handler();

    let pid = process::id();
    let iv_len = config.net.crypto.iv_len;

    let core_client = connect_client(config, &format!("worker-{}-coreid.socket", pid), &log);
    let core_id = allocate_core_id(&core_client).expect("Failed to allocate a core id");
    core_client.disconnect();

    let idgen = IdGenerator::new(u64::from(config.basic.node_id), core_id);
    let afferent = Afferent::bind(config.listen()).expect("Failed to bind the listen socket");
    let efferent = Efferent::open().expect("Failed to open the transmit socket");
    let codec = skein::wire::Codec::new(config.net.crypto.salt_len, iv_len);
    let keyring = Keyring::new(&config.net.crypto.cipher, &config.net.crypto.password, iv_len);

    let conns = ConnectionManager::new(
        connect_client(config, &format!("worker-{}-conns.socket", pid), &log),
        config.listen(),
        iv_len,
        config.net.crypto.iv_duration_range,
        &log,
    )
    .expect("Failed to initialize the connection manager");

    let store = SpecialPacketStore::new(
        connect_client(config, &format!("worker-{}-pkts.socket", pid), &log),
        pid,
        &log,
    )
    .expect("Failed to initialize the packet store");

    let profile = NodeProfile {
        role,
        identification: config.net.identification.clone(),
        listen: config.listen(),
        entrance: config.entrance(),
    };

    match role {
        Role::Controller => {
            let logic = ControllerLogic::new(
                config.net.identification.clone(),
                config.cluster_nodes.clone(),
                connect_client(config, &format!("worker-{}-logic.socket", pid), &log),
                &log,
            )
            .expect("Failed to initialize the controller logic");

            drive(
                Core::new(profile, afferent, efferent, codec, keyring, idgen, conns, store, logic, &log),
                &log,
            )
        }
        _ => {
            let logic = ForwarderLogic::new(
                connect_client(config, &format!("worker-{}-logic.socket", pid), &log),
                &log,
            )
            .expect("Failed to initialize the forwarder logic");

            drive(
                Core::new(profile, afferent, efferent, codec, keyring, idgen, conns, store, logic, &log),
                &log,
            )
        }
    }
}

/// Entrypoint of a re-exec'd repeater process, bound to its worker's repeat
/// containers through the worker's pid.
pub fn run_repeater(config: &Config, worker_pid: u32) -> i32 {
    let log = config.logger("repeater");
    install_term_handler();

    let pid = process::id();
    let iv_len = config.net.crypto.iv_len;

    let store = SpecialPacketStore::new(
        connect_client(config, &format!("rpt-{}-pkts.socket", pid), &log),
        worker_pid,
        &log,
    )
    .expect("Failed to initialize the packet store");

    let conns = ConnectionManager::new(
        connect_client(config, &format!("rpt-{}-conns.socket", pid), &log),
        config.listen(),
        iv_len,
        config.net.crypto.iv_duration_range,
        &log,
    )
    .expect("Failed to initialize the connection manager");

    let codec = skein::wire::Codec::new(config.net.crypto.salt_len, iv_len);
    let keyring = Keyring::new(&config.net.crypto.cipher, &config.net.crypto.password, iv_len);
    let efferent = Efferent::open().expect("Failed to open the transmit socket");

    let mut repeater = Repeater::new(store, conns, codec, keyring, efferent, &log);
    watch_term(repeater.shutdown_handle());
    repeater.run();

    0
}

fn drive<L: LogicHandler>(core: std::io::Result<Core<L>>, log: &Logger) -> i32 {
    let mut core = match core {
        Ok(core) => core,
        Err(err) => {
            logging::error!(log, "failed to assemble the worker core"; "error" => %err);
            return 1;
        }
    };

    watch_term(core.shutdown_handle());

    match core.run() {
        Ok(()) => 0,
        Err(CoreError::JoinRejected) => {
            logging::error!(log, "cluster join was rejected");
            1
        }
        Err(CoreError::JoinTimeout) => {
            logging::error!(log, "cluster join timed out");
            1
        }
        Err(err) => {
            logging::error!(log, "worker core failed"; "error" => ?err);
            1
        }
    }
}

/// Builds and connects a shared-state client, retrying while the server is
/// still coming up. Never returning is the startup deadlock the node must
/// not survive.
fn connect_client(config: &Config, socket_name: &str, log: &Logger) -> SharedStateClient {
    let socket_dir = Path::new(&config.shm.socket_dir);

    for _attempt in 0..20 {
        match SharedStateClient::new(socket_dir, &config.shm.manager_socket_name, socket_name, log) {
            Ok(mut client) => match client.connect() {
                Ok(()) => return client,
                Err(err) => {
                    logging::debug!(log, "shared state connect failed, retrying"; "error" => ?err);
                    client.disconnect();
                }
            },
            Err(err) => {
                logging::debug!(log, "shared state socket unavailable, retrying"; "error" => ?err);
            }
        }

        thread::sleep(Duration::from_millis(300));
    }

    panic!("Failed to connect to the shared state server at {:?}", socket_dir);
}

fn wait_for_socket(path: &Path) -> bool {
    for _ in 0..50 {
        if path.exists() {
            return true;
        }

        thread::sleep(Duration::from_millis(100));
    }

    false
}

fn read_pid(config: &Config) -> Option<i32> {
    fs::read_to_string(&config.basic.pid_file)
        .ok()
        .and_then(|raw| raw.trim().parse().ok())
}

fn process_alive(pid: i32) -> bool {
    unsafe { libc::kill(pid, 0) == 0 }
}

fn terminate_children(children: &mut Vec<(String, Child)>) {
    for (_, child) in children.iter_mut() {
        unsafe {
            libc::kill(child.id() as i32, libc::SIGTERM);
        }
    }

    let deadline = Instant::now() + Duration::from_secs(3);

    for (_, child) in children.iter_mut() {
        loop {
            match child.try_wait() {
                Ok(Some(_)) => break,
                _ if Instant::now() > deadline => {
                    let _ = child.kill();
                    let _ = child.wait();
                    break;
                }
                _ => thread::sleep(Duration::from_millis(100)),
            }
        }
    }
}
