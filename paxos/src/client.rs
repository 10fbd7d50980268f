use std::process;
use std::time::{Duration, Instant};

use clap::{App, Arg};
use log::LevelFilter;
use rand::seq::SliceRandom;

use common::parse_configuration;
use paxos::{send_request, PaxosReply, RequestBody, RpcError};

const CLIENT_ID: &str = "paxos-client";

/// A proposal makes several calls per replica.
const PROPOSE_TIMEOUT_FACTOR: u32 = 4;

async fn call(node: &str, body: RequestBody, timeout: Duration) -> Result<PaxosReply, RpcError> {
    match tokio::time::timeout(timeout, send_request(CLIENT_ID, node, body)).await {
        Ok(result) => result,
        Err(_) => Err(RpcError::Timeout),
    }
}

#[tokio::main]
async fn main() {
    let matches = App::new("Paxos Client")
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
            Arg::new("node")
                .short('n')
                .long("node")
                .value_name("ADDR")
                .help("Replica to contact; a random one if omitted")
                .takes_value(true),
        )
        .arg(
            Arg::new("value")
                .long("value")
                .value_name("VALUE")
                .help("Value to propose")
                .takes_value(true)
                .conflicts_with("status"),
        )
        .arg(
            Arg::new("status")
                .short('s')
                .long("status")
                .help("Print the replica's status instead of proposing"),
        )
        .get_matches();

    if let Err(err) = common::logging::init(CLIENT_ID, LevelFilter::Info) {
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

    let node = match matches.value_of("node") {
        Some(node) => node.to_string(),
        None => match config.replicas.choose(&mut rand::thread_rng()) {
            Some(node) => node.clone(),
            None => {
                log::error!("No replicas configured");
                process::exit(2);
            }
        },
    };

    let (body, timeout) = if matches.is_present("status") {
        (RequestBody::Status, config.rpc_timeout)
    } else {
        match matches.value_of("value") {
            Some(value) => (
                RequestBody::Propose {
                    value: value.to_string(),
                },
                config.rpc_timeout * PROPOSE_TIMEOUT_FACTOR,
            ),
            None => {
                log::error!("Either --value or --status is required");
                process::exit(2);
            }
        }
    };

    let request_start = Instant::now();
    match call(&node, body, timeout).await {
        Ok(PaxosReply::Proposed { instance, decided }) => {
            println!(
                "{}: instance {} {} ({}ms)",
                node,
                instance,
                if decided { "decided" } else { "not decided" },
                request_start.elapsed().as_millis()
            );
            if !decided {
                process::exit(1);
            }
        }
        Ok(PaxosReply::Status(status)) => {
            println!(
                "{}: highest committed {} ({}), promised {}, running {}",
                status.me,
                status.highest_committed,
                status.last_value.as_deref().unwrap_or("-"),
                status.promised,
                status.running
            );
        }
        Ok(other) => {
            log::error!("Unexpected {} reply from {}", other.kind(), node);
            process::exit(1);
        }
        Err(err) => {
            log::error!("Request to {} failed: {}", node, err);
            process::exit(1);
        }
    }
}
