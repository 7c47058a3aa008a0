//! TCP echo server driven by the generic looper.
//!
//! Usage: `looper_echo [ADDR] [CONFIG]` (default `127.0.0.1:7878`). The
//! config file uses the looper key=value format; without it the `LOOPER_*`
//! environment variables apply. SIGINT/SIGTERM stop the loop through a
//! signal pipe, and a timer logs connection statistics every few seconds.

use std::cell::RefCell;
use std::collections::HashMap;
use std::env;
use std::io::{ErrorKind, Read, Write};
use std::net::{TcpListener, TcpStream};
use std::os::unix::io::AsRawFd;
use std::process;
use std::rc::Rc;
use std::time::Duration;

use log::{debug, error, info, warn};
use looper_core::signals::SignalPipe;
use looper_core::{
    create_with_config, logger, ClockType, Interest, Looper, LooperConfig, RunStatus, WatchId,
};

const DEFAULT_ADDR: &str = "127.0.0.1:7878";
const STATS_INTERVAL: Duration = Duration::from_secs(5);

struct Conn {
    stream: TcpStream,
    outbox: Vec<u8>,
}

#[derive(Default)]
struct Server {
    conns: HashMap<WatchId, Conn>,
    accepted: u64,
    echoed: u64,
}

type Shared = Rc<RefCell<Server>>;

fn on_listener(looper: &mut dyn Looper, listener: &TcpListener, server: &Shared) {
    loop {
        match listener.accept() {
            Ok((stream, peer)) => {
                if let Err(e) = stream.set_nonblocking(true) {
                    warn!("{}: {}", peer, e);
                    continue;
                }
                let srv = server.clone();
                let watch = looper.create_fd_watch(
                    stream.as_raw_fd(),
                    Box::new(move |l, id, _, events| on_conn(l, id, events, &srv)),
                );
                let registered = watch.and_then(|id| match looper.want_read(id) {
                    Ok(()) => Ok(id),
                    Err(e) => {
                        let _ = looper.destroy_fd_watch(id);
                        Err(e)
                    }
                });
                match registered {
                    Ok(id) => {
                        debug!("accepted {} as {:?}", peer, id);
                        let mut s = server.borrow_mut();
                        s.accepted += 1;
                        s.conns.insert(id, Conn { stream, outbox: Vec::new() });
                    }
                    Err(e) => warn!("cannot watch {}: {}", peer, e),
                }
            }
            Err(e) if e.kind() == ErrorKind::WouldBlock => return,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => {
                error!("accept: {}", e);
                return;
            }
        }
    }
}

fn on_conn(looper: &mut dyn Looper, id: WatchId, events: Interest, server: &Shared) {
    let mut guard = server.borrow_mut();
    let Server { conns, echoed, .. } = &mut *guard;
    let Some(conn) = conns.get_mut(&id) else { return };

    let mut closed = events.is_readable() && read_into_outbox(conn);
    if !closed && !conn.outbox.is_empty() {
        closed = flush_outbox(conn, echoed);
    }
    if closed {
        // Deregister while the fd is still open, then close it.
        let _ = looper.destroy_fd_watch(id);
        conns.remove(&id);
        debug!("closed {:?}", id);
        return;
    }
    let result = if conn.outbox.is_empty() {
        looper.dont_want_write(id)
    } else {
        looper.want_write(id)
    };
    if let Err(e) = result {
        warn!("{:?}: {}", id, e);
    }
}

/// Returns true once the peer is gone.
fn read_into_outbox(conn: &mut Conn) -> bool {
    let mut buf = [0u8; 4096];
    loop {
        match conn.stream.read(&mut buf) {
            Ok(0) => return true,
            Ok(n) => conn.outbox.extend_from_slice(&buf[..n]),
            Err(e) if e.kind() == ErrorKind::WouldBlock => return false,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(_) => return true,
        }
    }
}

/// Returns true if the connection failed.
fn flush_outbox(conn: &mut Conn, echoed: &mut u64) -> bool {
    while !conn.outbox.is_empty() {
        match conn.stream.write(&conn.outbox) {
            Ok(0) => return true,
            Ok(n) => {
                conn.outbox.drain(..n);
                *echoed += n as u64;
            }
            Err(e) if e.kind() == ErrorKind::WouldBlock => return false,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(_) => return true,
        }
    }
    false
}

fn run(addr: &str, config: &LooperConfig) -> looper_core::Result<RunStatus> {
    let mut looper = create_with_config(config)?;
    let server: Shared = Rc::new(RefCell::new(Server::default()));

    let listener = Rc::new(TcpListener::bind(addr)?);
    listener.set_nonblocking(true)?;
    let (l, srv) = (listener.clone(), server.clone());
    let accept = looper.create_fd_watch(
        listener.as_raw_fd(),
        Box::new(move |looper, _, _, _| on_listener(looper, &l, &srv)),
    )?;
    looper.want_read(accept)?;

    let signals = Rc::new(SignalPipe::install(&[libc::SIGINT, libc::SIGTERM])?);
    let sig = signals.clone();
    let sig_watch = looper.create_fd_watch(
        signals.as_raw_fd(),
        Box::new(move |looper, _, _, _| match sig.read_pending() {
            Ok(received) if !received.is_empty() => {
                info!("signal {:?} received, shutting down", received);
                looper.force_quit();
            }
            Ok(_) => {}
            Err(e) => warn!("signal pipe: {}", e),
        }),
    )?;
    looper.want_read(sig_watch)?;

    let srv = server.clone();
    let stats = looper.create_timer(
        ClockType::Host,
        Box::new(move |looper, id| {
            let s = srv.borrow();
            info!("{} open, {} accepted, {} bytes echoed", s.conns.len(), s.accepted, s.echoed);
            let _ = looper.start_timer_relative(id, Some(STATS_INTERVAL));
        }),
    );
    looper.start_timer_relative(stats, Some(STATS_INTERVAL))?;

    info!("{} looper listening on {}", looper.name(), addr);
    looper.run()
}

fn main() {
    let mut args = env::args().skip(1);
    let addr = args.next().unwrap_or_else(|| DEFAULT_ADDR.to_string());
    let config = match args.next() {
        Some(path) => LooperConfig::load_from_file(&path),
        None => LooperConfig::from_env(),
    };
    let config = match config {
        Ok(c) => c,
        Err(e) => {
            eprintln!("looper_echo: {}", e);
            process::exit(2);
        }
    };
    let _ = logger::init(config.log_level);

    match run(&addr, &config) {
        Ok(status) => info!("looper stopped: {:?}", status),
        Err(e) => {
            error!("{}", e);
            process::exit(1);
        }
    }
}
