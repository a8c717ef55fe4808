use std::{
    io,
    net::UdpSocket,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread::{self, JoinHandle},
};

use log::{debug, warn};

use crate::config::MAX_DATAGRAM;

use super::Engine;

/// The reader and timer threads driving an [`Engine`].
///
/// Both threads poll a shared flag; dropping the handle clears it and joins
/// them. The reader notices within one socket read timeout and the timer
/// within one tick.
#[derive(Debug)]
pub struct EngineThreads {
    running: Arc<AtomicBool>,
    reader: Option<JoinHandle<()>>,
    timer: Option<JoinHandle<()>>,
}

impl EngineThreads {
    /// Starts reading datagrams from `socket` and ticking the timer.
    /// `socket` should have a read timeout set.
    pub fn spawn(engine: Arc<Engine>, socket: UdpSocket) -> io::Result<Self> {
        let running = Arc::new(AtomicBool::new(true));

        let reader = {
            let engine = Arc::clone(&engine);
            let running = Arc::clone(&running);
            thread::Builder::new()
                .name("srpc-reader".to_string())
                .spawn(move || read_loop(&engine, &socket, &running))?
        };

        let mut threads = Self {
            running: Arc::clone(&running),
            reader: Some(reader),
            timer: None,
        };

        let timer = thread::Builder::new()
            .name("srpc-timer".to_string())
            .spawn(move || {
                let tick = engine.config().tick;
                while running.load(Ordering::Acquire) {
                    thread::sleep(tick);
                    engine.tick();
                }
            })?;
        threads.timer = Some(timer);

        Ok(threads)
    }

    /// Asks both threads to finish without waiting for them.
    pub fn request_stop(&self) {
        self.running.store(false, Ordering::Release);
    }

    pub fn stop(&mut self) {
        self.request_stop();

        for (name, handle) in [("reader", self.reader.take()), ("timer", self.timer.take())] {
            if let Some(handle) = handle {
                debug!("shutting down {name} thread");
                if handle.join().is_err() {
                    warn!("{name} thread panicked");
                }
            }
        }
    }
}

impl Drop for EngineThreads {
    fn drop(&mut self) {
        self.stop();
    }
}

fn read_loop(engine: &Engine, socket: &UdpSocket, running: &AtomicBool) {
    let mut buf = vec![0; MAX_DATAGRAM];

    while running.load(Ordering::Acquire) {
        match socket.recv_from(&mut buf) {
            Ok((n, from)) => engine.handle_datagram(from, &buf[..n]),
            Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => {}
            Err(e) => warn!("receive failed: {e}"),
        }
    }
}
