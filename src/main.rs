use clap::{Arg, ArgAction, ArgMatches, Command};
use colored::*;
use std::net::IpAddr;
use std::process;

use deimos::{
    config::ProbeConfig,
    scanner::{Protocol, ScanStatus, Scanner},
    ScanContext, ScanTarget,
};

fn build_cli() -> Command {
    Command::new("deimos")
        .version(env!("CARGO_PKG_VERSION"))
        .author("ibrahimsql")
        .about("Deimos: handshake probes for MSSQL, SMB and Telnet")
        .arg(
            Arg::new("module")
                .value_name("MODULE")
                .help("Protocol to probe: mssql, smb or telnet")
                .required(true)
                .value_parser(["mssql", "smb", "telnet"])
                .index(1),
        )
        .arg(
            Arg::new("target")
                .value_name("TARGET")
                .help("Host name or IP address to probe")
                .required(true)
                .index(2),
        )
        .arg(
            Arg::new("port")
                .short('p')
                .long("port")
                .value_name("PORT")
                .help("Port to connect to (defaults to the protocol's well-known port)")
                .value_parser(clap::value_parser!(u16)),
        )
        .arg(
            Arg::new("ip")
                .long("ip")
                .value_name("IP")
                .help("Pre-resolved address to use instead of a DNS lookup")
                .value_parser(clap::value_parser!(IpAddr)),
        )
        .arg(
            Arg::new("timeout")
                .short('t')
                .long("timeout")
                .value_name("MS")
                .help("Per-scan deadline in milliseconds")
                .value_parser(clap::value_parser!(u64)),
        )
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("TOML configuration file (default: ~/.deimos.toml)"),
        )
        .arg(
            Arg::new("max-read-size")
                .long("max-read-size")
                .value_name("BYTES")
                .help("Telnet: maximum number of banner bytes to read")
                .value_parser(clap::value_parser!(usize)),
        )
        .arg(
            Arg::new("force-banner")
                .long("force-banner")
                .help("Telnet: always return the banner if it has non-zero bytes")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("setup-session")
                .long("setup-session")
                .help("SMB: send a session setup after the negotiate response")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("encrypt-mode")
                .long("encrypt-mode")
                .value_name("MODE")
                .help("MSSQL: encryption to request in PRELOGIN (ENCRYPT_ON, ENCRYPT_OFF, ENCRYPT_NOT_SUP)"),
        )
        .arg(
            Arg::new("tls-server-name")
                .long("tls-server-name")
                .value_name("NAME")
                .help("Server name to send in the TLS SNI extension"),
        )
        .arg(
            Arg::new("tls-verify")
                .long("tls-verify")
                .help("Verify the server certificate chain")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("verbose")
                .short('v')
                .long("verbose")
                .help("Include debug fields in the scan results")
                .action(ArgAction::SetTrue),
        )
}

fn load_config(matches: &ArgMatches) -> anyhow::Result<ProbeConfig> {
    let mut config = match matches.get_one::<String>("config") {
        Some(path) => ProbeConfig::from_toml_file(path)?,
        None => ProbeConfig::load_default_config(),
    };

    if let Some(&timeout) = matches.get_one::<u64>("timeout") {
        config.timeout = timeout;
    }
    if let Some(&size) = matches.get_one::<usize>("max-read-size") {
        config.telnet.max_read_size = size;
    }
    if matches.get_flag("force-banner") {
        config.telnet.force_banner = true;
    }
    if matches.get_flag("setup-session") {
        config.smb.setup_session = true;
    }
    if let Some(mode) = matches.get_one::<String>("encrypt-mode") {
        config.mssql.encrypt_mode = mode.clone();
    }
    if let Some(name) = matches.get_one::<String>("tls-server-name") {
        config.tls.server_name = Some(name.clone());
    }
    if matches.get_flag("tls-verify") {
        config.tls.verify_certificates = true;
    }
    if matches.get_flag("verbose") {
        config.telnet.verbose = true;
        config.smb.verbose = true;
        config.mssql.verbose = true;
    }

    config.validate()?;
    Ok(config)
}

async fn run(matches: ArgMatches) -> anyhow::Result<ScanStatus> {
    let config = load_config(&matches)?;

    let protocol: Protocol = matches
        .get_one::<String>("module")
        .map(String::as_str)
        .unwrap_or_default()
        .parse()?;
    let host = matches.get_one::<String>("target").cloned().unwrap_or_default();
    let port = matches
        .get_one::<u16>("port")
        .copied()
        .unwrap_or_else(|| protocol.default_port());

    let mut target = ScanTarget::new(host, port);
    if let Some(&ip) = matches.get_one::<IpAddr>("ip") {
        target = target.with_ip(ip);
    }

    let scanner = Scanner::new(protocol, &config)?;
    let ctx = ScanContext::with_timeout(config.timeout_duration());
    let response = scanner.scan(&ctx, &target).await;

    println!("{}", serde_json::to_string_pretty(&response)?);

    let status = response.status.to_string();
    let colored_status = if response.status.is_success() {
        status.bright_green()
    } else {
        status.bright_red()
    };
    eprintln!(
        "{} {} {} {}",
        "[~]".bright_blue(),
        protocol.name().bright_cyan(),
        target.to_string().bright_white(),
        colored_status
    );

    Ok(response.status)
}

#[tokio::main]
async fn main() {
    env_logger::init();

    let matches = build_cli().get_matches();
    match run(matches).await {
        Ok(status) if status.is_success() => {}
        Ok(_) => process::exit(2),
        Err(e) => {
            eprintln!("{} {}", "[!]".bright_red(), e);
            process::exit(1);
        }
    }
}
