use std::{
    error::Error,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread,
    time::Duration,
};

use clap::Parser;
use log::{info, warn};
use srpc::{Rpc, RpcConfig};

/// How often idle workers check for shutdown.
const WORKER_POLL: Duration = Duration::from_millis(250);

#[derive(Debug, Parser)]
#[command(version, about, long_about = None)]
struct Cli {
    /// Port to listen on
    #[arg(default_value_t = 20000)]
    port: u16,
    /// Name of the offered service
    #[arg(short, long, default_value = "HWDB")]
    service: String,
    /// Number of worker threads answering queries
    #[arg(short, long, default_value_t = 4)]
    workers: usize,
    /// Transmission attempts before a connection times out
    #[arg(long, default_value_t = srpc::config::ATTEMPTS)]
    attempts: u16,
    /// Ticks before the first retransmission
    #[arg(long, default_value_t = srpc::config::TICKS)]
    ticks: u16,
}

/// Offers a service whose workers echo every query back.
fn main() -> Result<(), Box<dyn Error>> {
    env_logger::init();

    let cli = Cli::parse();
    let config = RpcConfig {
        attempts: cli.attempts,
        initial_ticks: cli.ticks,
        ..RpcConfig::default()
    };
    let rpc = Arc::new(Rpc::with_config(cli.port, config)?);
    let service = rpc.offer(&cli.service)?;
    info!("serving '{}' at {}", cli.service, rpc.details());

    let running = Arc::new(AtomicBool::new(true));
    {
        let running = Arc::clone(&running);
        ctrlc::set_handler(move || running.store(false, Ordering::Release))?;
    }

    let workers = (0..cli.workers.max(1))
        .map(|id| {
            let rpc = Arc::clone(&rpc);
            let service = Arc::clone(&service);
            let running = Arc::clone(&running);
            thread::Builder::new()
                .name(format!("worker-{id}"))
                .spawn(move || {
                    while running.load(Ordering::Acquire) {
                        let Some((conn, query)) = rpc.query_timeout(&service, WORKER_POLL) else {
                            continue;
                        };
                        info!(
                            "worker {id}: {} bytes from {}",
                            query.len(),
                            conn.endpoint()
                        );
                        if let Err(e) = rpc.response(&service, &conn, &query) {
                            warn!("worker {id}: failed to respond: {e}");
                        }
                    }
                })
        })
        .collect::<Result<Vec<_>, _>>()?;

    for worker in workers {
        if worker.join().is_err() {
            warn!("worker panicked");
        }
    }

    rpc.withdraw(&service);
    info!("shutting down");
    Ok(())
}
