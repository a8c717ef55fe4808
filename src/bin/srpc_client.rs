use std::{error::Error, io};

use clap::Parser;
use srpc::{Rpc, RpcConfig, cli::Command, cli::prompt};

#[derive(Debug, Parser)]
#[command(version, about, long_about = None)]
struct Cli {
    /// Server host name or address
    host: String,
    /// Server port
    port: u16,
    /// Service to connect to
    #[arg(short, long, default_value = "HWDB")]
    service: String,
    /// Initial sequence number
    #[arg(long, default_value_t = 1)]
    seqno: u32,
    /// Local port to bind, 0 for any
    #[arg(short, long, default_value_t = 0)]
    local_port: u16,
    /// Transmission attempts before a connection times out
    #[arg(long, default_value_t = srpc::config::ATTEMPTS)]
    attempts: u16,
    /// Ticks before the first retransmission
    #[arg(long, default_value_t = srpc::config::TICKS)]
    ticks: u16,
}

fn main() -> Result<(), Box<dyn Error>> {
    env_logger::init();

    let cli = Cli::parse();
    let config = RpcConfig {
        attempts: cli.attempts,
        initial_ticks: cli.ticks,
        ..RpcConfig::default()
    };
    let rpc = Rpc::with_config(cli.local_port, config)?;
    let connection = rpc.connect(&cli.host, cli.port, &cli.service, cli.seqno)?;

    let stdio = io::stdin();
    let stdout = io::stdout();

    loop {
        let cmd = match prompt(stdio.lock(), stdout.lock()) {
            Ok(c) => c,
            Err(e) => {
                eprintln!("{e}");
                continue;
            }
        };

        match cmd {
            Command::Exit => break,
            Command::Details => println!("{} -> {}", rpc.details(), connection.endpoint()),
            Command::Call(query) => match rpc.call(&connection, query.as_bytes()) {
                Ok(response) => println!("{}", String::from_utf8_lossy(&response)),
                Err(e) => {
                    eprintln!("call failed: {e}");
                    break;
                }
            },
        }
    }

    if let Err(e) = rpc.disconnect(connection) {
        eprintln!("failed to disconnect: {e}");
    }
    Ok(())
}
