use clap::{App, Arg};
use skein::cluster::Role;
use std::process;

mod config;
mod master;

use crate::config::Config;

fn main() {
    let matches = App::new("skeind")
        .version("0.1.0")
        .author("Skein Works")
        .about("Runs one node of the skein overlay forwarding cluster.")
        .arg(
            Arg::with_name("ACTION")
                .help("Controls the service. options: start/stop/status")
                .required(true),
        )
        .arg(
            Arg::with_name("config")
                .short("c")
                .value_name("path")
                .default_value("./skein.toml")
                .help("Path to the config file"),
        )
        .arg(
            Arg::with_name("role")
                .short("r")
                .value_name("role")
                .help("Role of the node: client/relay/outlet/controller or 0x01..0x04"),
        )
        .arg(
            Arg::with_name("process")
                .long("process")
                .takes_value(true)
                .possible_values(&["shm", "worker", "repeater"])
                .hidden(true),
        )
        .arg(
            Arg::with_name("worker-pid")
                .long("worker-pid")
                .takes_value(true)
                .hidden(true),
        )
        .get_matches();

    let action = matches.value_of("ACTION").unwrap();
    let config_path = matches.value_of("config").unwrap();

    let code = match action {
        "start" => {
            let config = Config::load(config_path);

            match matches.value_of("process") {
                Some("shm") => master::run_shm(&config),
                Some("repeater") => {
                    let worker_pid: u32 = matches
                        .value_of("worker-pid")
                        .and_then(|pid| pid.parse().ok())
                        .expect("The repeater needs a --worker-pid");
                    master::run_repeater(&config, worker_pid)
                }
                Some("worker") => master::run_worker(&config, require_role(&matches)),
                _ => master::start(&config, require_role(&matches), config_path),
            }
        }
        "stop" => master::stop(&Config::load(config_path)),
        "status" => master::status(&Config::load(config_path)),
        other => {
            eprintln!("Unknown action: {}", other);
            2
        }
    };

    process::exit(code);
}

fn require_role(matches: &clap::ArgMatches) -> Role {
    match matches.value_of("role").and_then(Role::from_name) {
        Some(role) => role,
        None => {
            eprintln!("A valid role is required: client/relay/outlet/controller or 0x01..0x04");
            process::exit(2);
        }
    }
}
