use std::process;
use std::sync::Arc;

use clap::{App, Arg};
use log::LevelFilter;
use tokio::net::UdpSocket;

use common::{parse_configuration, Config};
use paxos::{
    receive_and_handle_paxos_message, Acceptor, Breakpoint, CommitListener, FileLog, Instance,
    PaxosNode, UdpTransport,
};

struct ServerOptions {
    config: Config,
    me: String,
    first: Option<String>,
    breakpoint: Option<Breakpoint>,
}

fn parse_breakpoint(arg: &str) -> Result<Breakpoint, String> {
    match arg {
        "1" => Ok(Breakpoint::AfterPrepare),
        "2" => Ok(Breakpoint::AfterAccept),
        other => Err(format!("unknown breakpoint '{}', expected 1 or 2", other)),
    }
}

async fn run(options: ServerOptions) -> Result<(), Box<dyn std::error::Error>> {
    let ServerOptions {
        config,
        me,
        first,
        breakpoint,
    } = options;

    if !config.is_member(&me) {
        return Err(format!("{} is not a replica in the configuration", me).into());
    }
    log::info!(
        "Starting replica {} of {} (quorum {})",
        me,
        config.n(),
        config.quorum_size()
    );

    let log_path = config.log_path(&me);
    let file_log = FileLog::open(&log_path)?;
    log::info!("Using acceptor log {}", log_path.display());

    let listener_me = me.clone();
    let listener: Arc<dyn CommitListener> = Arc::new(move |instance: Instance, value: &str| {
        log::info!("[{}] committed instance {}: {}", listener_me, instance, value);
    });
    let acceptor = Arc::new(Acceptor::open(&me, file_log, first.as_deref(), Some(listener))?);

    let node = PaxosNode::new(
        &me,
        config.replicas.clone(),
        acceptor,
        UdpTransport::new(&me),
        config.rpc_timeout,
    )
    .with_crash_hook(Arc::new(|at: Breakpoint| {
        log::error!("Exiting at breakpoint {}", at);
        process::exit(1);
    }));
    if let Some(at) = breakpoint {
        node.proposer().arm(at);
    }

    let socket = Arc::new(UdpSocket::bind(me.as_str()).await?);
    receive_and_handle_paxos_message(socket, Arc::new(node)).await;
    Ok(())
}

#[tokio::main]
async fn main() {
    let matches = App::new("Paxos Server")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("Replica configuration file")
                .takes_value(true)
                .required(true),
        )
        .arg(
            Arg::new("me")
                .short('m')
                .long("me")
                .value_name("ADDR")
                .help("This replica's address as listed in the configuration")
                .takes_value(true)
                .required(true),
        )
        .arg(
            Arg::new("first")
                .short('f')
                .long("first")
                .value_name("VALUE")
                .help("Value committed for instance 1 on a fresh log")
                .takes_value(true),
        )
        .arg(
            Arg::new("break")
                .short('b')
                .long("break")
                .value_name("POINT")
                .help("Exit after prepare (1) or after accept (2)")
                .takes_value(true),
        )
        .arg(
            Arg::new("verbose")
                .short('v')
                .long("verbose")
                .help("Log at debug level"),
        )
        .get_matches();

    let me = matches.value_of("me").unwrap_or_default().to_string();
    let level = if matches.is_present("verbose") {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    };
    if let Err(err) = common::logging::init(&me, level) {
        eprintln!("Failed to install logger: {}", err);
    }

    let config_file = matches.value_of("config").unwrap_or_default();
    let config = match parse_configuration(config_file) {
        Ok(config) => config,
        Err(err) => {
            log::error!("Failed to read configuration {}: {}", config_file, err);
            process::exit(2);
        }
    };

    let breakpoint = match matches.value_of("break").map(parse_breakpoint).transpose() {
        Ok(breakpoint) => breakpoint,
        Err(err) => {
            log::error!("{}", err);
            process::exit(2);
        }
    };

    let options = ServerOptions {
        config,
        me,
        first: matches.value_of("first").map(str::to_string),
        breakpoint,
    };
    if let Err(err) = run(options).await {
        log::error!("Server failed: {}", err);
        process::exit(1);
    }
}
