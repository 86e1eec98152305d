// Copyright (c) 2024 Cableguard, Inc. All rights reserved.
// SPDX-License-Identifier: BSD-3-Clause

use clap::{Arg, Command};
use daemonize::{Daemonize, Outcome};
use pipex::device::{DeviceConfig, DeviceHandle};
use std::fs::{File, OpenOptions};
use std::io::{self, ErrorKind};
use std::os::unix::net::UnixDatagram;
use std::process::exit;
use tracing::Level;

fn open_log(log: &str) -> io::Result<File> {
    // Append to an existing log, refuse anything that is not a regular file
    match std::fs::metadata(log) {
        Ok(metadata) if metadata.is_file() => OpenOptions::new().append(true).open(log),
        Ok(_) => Err(io::Error::new(
            ErrorKind::Other,
            format!("{} is not a regular file.", log),
        )),
        Err(_) => File::create(log),
    }
}

fn load_config(path: Option<&str>) -> Result<DeviceConfig, String> {
    let path = match path {
        Some(path) => path,
        None => return Ok(DeviceConfig::default()),
    };
    let file = File::open(path).map_err(|e| format!("Error: Failed to open config {}: {}", path, e))?;
    serde_json::from_reader(io::BufReader::new(file))
        .map_err(|e| format!("Error: Failed to parse config {}: {}", path, e))
}

fn notify_parent(sock: &UnixDatagram, ok: bool) {
    if let Err(e) = sock.send(&[ok as u8]) {
        tracing::debug!(message = "Error: Failed to notify parent process", error = ?e);
    }
}

fn main() {
    let matches = Command::new("pipexd")
        .version(env!("CARGO_PKG_VERSION"))
        .author("Vicente Aceituno Canal <vpn@cableguard.org>")
        .about("Fast path for PPP sessions over PPPoE, PPTP and L2TP")
        .args(&[
            Arg::new("INTERFACE_NAME")
                .required(true)
                .takes_value(true)
                .help("The name of the pipex interface to create"),
            Arg::new("foreground")
                .long("foreground")
                .short('f')
                .help("Run and log in the foreground"),
            Arg::new("verbosity")
                .takes_value(true)
                .long("verbosity")
                .short('v')
                .env("PIPEX_LOG_LEVEL")
                .possible_values(["error", "info", "debug", "trace"])
                .help("Log verbosity")
                .default_value("error"),
            Arg::new("log")
                .takes_value(true)
                .long("log")
                .short('l')
                .env("PIPEX_LOG_FILE")
                .help("Log file")
                .default_value("/tmp/pipexd.out"),
            Arg::new("config")
                .takes_value(true)
                .long("config")
                .short('c')
                .env("PIPEX_CONFIG")
                .help("JSON configuration file, command line flags take precedence"),
            Arg::new("l2tp-port")
                .takes_value(true)
                .long("l2tp-port")
                .help("UDP port L2TP sessions arrive on"),
            Arg::new("pppoe-interface")
                .takes_value(true)
                .multiple_occurrences(true)
                .long("pppoe-interface")
                .short('p')
                .help("Ethernet interface to receive PPPoE session frames on, may be repeated"),
            Arg::new("disable-pptp")
                .long("disable-pptp")
                .help("Do not open the GRE socket"),
            Arg::new("disable-l2tp")
                .long("disable-l2tp")
                .help("Do not open the L2TP sockets"),
            Arg::new("disable-start")
                .long("disable-start")
                .help("Leave the fast path disabled until set_mode=true arrives on the control socket"),
            Arg::new("sock-dir")
                .takes_value(true)
                .long("sock-dir")
                .env("PIPEX_SOCK_DIR")
                .help("Directory of the control socket"),
            Arg::new("relay-path")
                .takes_value(true)
                .long("relay-path")
                .env("PIPEX_RELAY_PATH")
                .help("Unix datagram socket of the PPP daemon, receives the packets pipex does not keep"),
        ])
        .get_matches();

    let background = !matches.is_present("foreground");
    let log_level: Level = matches.value_of_t("verbosity").unwrap_or_else(|e| e.exit());
    let tun_name = matches.value_of("INTERFACE_NAME").unwrap_or_default().to_owned();

    let mut config = load_config(matches.value_of("config")).unwrap_or_else(|e| {
        eprintln!("{}", e);
        exit(1);
    });
    if matches.is_present("l2tp-port") {
        config.l2tp_port = matches.value_of_t("l2tp-port").unwrap_or_else(|e| e.exit());
    }
    if let Some(ifnames) = matches.values_of("pppoe-interface") {
        config.pppoe_interfaces = ifnames.map(str::to_owned).collect();
    }
    if matches.is_present("disable-pptp") {
        config.pptp = false;
    }
    if matches.is_present("disable-l2tp") {
        config.l2tp = false;
    }
    if matches.is_present("disable-start") {
        config.start_enabled = false;
    }
    if let Some(dir) = matches.value_of("sock-dir") {
        config.sock_dir = dir.to_owned();
    }
    if let Some(path) = matches.value_of("relay-path") {
        config.relay_path = Some(path.to_owned());
    }

    // Socketpair so the forked child can report whether the device came up
    let (sock1, sock2) = UnixDatagram::pair().unwrap_or_else(|e| {
        eprintln!("Error: Failed to create notification socket: {}", e);
        exit(1);
    });
    let _ = sock1.set_nonblocking(true);

    let _guard;

    if background {
        let log = matches.value_of("log").unwrap_or_default();
        let log_file = open_log(log).unwrap_or_else(|err| {
            eprintln!("Error: Failed to open log file {}: {}", log, err);
            exit(1);
        });

        let (non_blocking, guard) = tracing_appender::non_blocking(log_file);
        _guard = guard;

        tracing_subscriber::fmt()
            .with_max_level(log_level)
            .with_writer(non_blocking)
            .with_ansi(false)
            .init();

        let daemonize = Daemonize::new().working_directory("/tmp");
        match daemonize.execute() {
            Outcome::Parent(Ok(_)) => {
                let mut b = [0u8; 1];
                if sock2.recv(&mut b).is_ok() && b[0] == 1 {
                    println!("Info: pipexd started successfully");
                    exit(0);
                } else {
                    println!("Error: pipexd failed to start. Check that it runs with CAP_NET_ADMIN and CAP_NET_RAW.");
                    exit(1);
                }
            }
            Outcome::Parent(Err(e)) => {
                println!("Error: pipexd failed to daemonize: {}", e);
                exit(1);
            }
            Outcome::Child(_) => {}
        }
    } else {
        tracing_subscriber::fmt().pretty().with_max_level(log_level).init();
    }

    tracing::info!(
        message = "Info: Starting pipex",
        interface = %tun_name,
        pptp = config.pptp,
        l2tp = config.l2tp,
        pppoe = ?config.pppoe_interfaces
    );

    let mut device_handle = match DeviceHandle::new(&tun_name, &config) {
        Ok(d) => d,
        Err(e) => {
            tracing::error!(message = "Error: Failed to initialize pipex interface", error = ?e);
            notify_parent(&sock1, false);
            exit(1);
        }
    };

    notify_parent(&sock1, true);
    drop(sock1);

    device_handle.wait();
}
