use std::collections::hash_map::Entry;
use std::collections::{HashMap, HashSet};
use std::io::Read;
use std::net::Ipv4Addr;
use std::os::fd::AsRawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;

use etherparse::{Ipv4HeaderSlice, TcpHeaderSlice};
use nix::poll::{poll, PollFd, PollFlags};
use tidy_tuntap::Tun;

mod err;
pub use err::*;

mod tcp;
pub use tcp::State;
use tcp::{amap, Action, Dual, Kind, Quad, TcpListener, TCB};

/// Registered via `TcpStream::set_callbacks`, invoked with the old and new
/// `State` while the connection lock is held, exactly once per transition.
pub type StateChangeCallback = Box<dyn Fn(State, State) + Send>;
/// Registered via `TcpStream::set_callbacks`, invoked whenever new bytes (or
/// a FIN) land in the receive buffer.
pub type DataAvailableCallback = Box<dyn Fn() + Send>;

#[derive(Debug)]
pub struct EstabElement {
    quad: Quad,
    rvar: Arc<Condvar>,
    wvar: Arc<Condvar>,
    svar: Arc<Condvar>,
    reset: Arc<AtomicBool>,
}

#[derive(Debug)]
pub struct EstabEntry {
    cvar: Arc<Condvar>,
    elts: Vec<EstabElement>,
}

pub struct StreamEntry {
    tcb: TCB,
    rvar: Arc<Condvar>,
    wvar: Arc<Condvar>,
    svar: Arc<Condvar>,
    reset: Arc<AtomicBool>,
    on_state_change: Option<StateChangeCallback>,
    on_data_available: Option<DataAvailableCallback>,
}

impl std::fmt::Debug for StreamEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamEntry")
            .field("tcb", &self.tcb)
            .field("on_state_change", &self.on_state_change.is_some())
            .field("on_data_available", &self.on_data_available.is_some())
            .finish()
    }
}

/// Fires `entry`'s state-change callback (if any arrived, before removal)
/// reporting the connection's final transition to `Closed`.
fn notify_closed(entry: &StreamEntry) {
    if let Some(cb) = &entry.on_state_change {
        cb(entry.tcb.state, State::Closed);
    }
}

/// Routes arriving segments to a `Tcb` and tracks ports bound via `bind`.
///
/// `pending` holds connections mid-handshake (both passive, from a `Listen`
/// Tcb spawned off a bound port, and active, from `connect`); `streams`
/// holds everything once `Action::IsEstablished` fires. `established` is
/// the accept backlog, one entry per bound port, woken by `segment_loop`
/// and drained by `TcpListener::accept`.
#[derive(Debug)]
pub struct Manager {
    bounded: HashSet<u16>,
    pending: HashMap<Quad, TCB>,
    established: HashMap<u16, EstabEntry>,
    streams: HashMap<Quad, StreamEntry>,
    /// Notified whenever a quad leaves `pending`, so a blocked `connect`
    /// call can tell a completed handshake from a reset one.
    pending_cvar: Arc<Condvar>,
}

#[derive(Debug)]
pub struct NetStack {
    manager: Arc<Mutex<Manager>>,
    tun: Arc<Mutex<Tun>>,
    local_addr: Ipv4Addr,
    pending_cvar: Arc<Condvar>,
    jh: thread::JoinHandle<()>,
}

impl NetStack {
    pub fn new(name: &str, addr: Ipv4Addr, mask: Ipv4Addr) -> Result<Self, Error> {
        let tun = Tun::new(name, false)?;
        tun.set_addr(addr)?;
        tun.set_netmask(mask)?;
        tun.bring_up()?;

        let tun = Arc::new(Mutex::new(tun));
        let pending_cvar = Arc::new(Condvar::new());

        let manager = Arc::new(Mutex::new(Manager {
            bounded: HashSet::new(),
            pending: HashMap::new(),
            established: HashMap::new(),
            streams: HashMap::new(),
            pending_cvar: pending_cvar.clone(),
        }));

        let jh = {
            let manager = manager.clone();
            let tun = tun.clone();

            thread::spawn(move || segment_loop(tun, manager))
        };

        Ok(NetStack {
            manager,
            tun,
            local_addr: addr,
            pending_cvar,
            jh,
        })
    }

    pub fn bind(&mut self, port: u16) -> Result<TcpListener, Error> {
        let mut manager = self.manager.lock().unwrap();

        match manager.established.entry(port) {
            Entry::Occupied(_) => Err(Error::Exists),
            Entry::Vacant(v) => {
                let cvar = Arc::new(Condvar::new());

                v.insert(EstabEntry {
                    cvar: cvar.clone(),
                    elts: Vec::new(),
                });

                assert!(manager.bounded.insert(port));
                log::info!("bound port {port}");

                Ok(TcpListener {
                    port,
                    manager: self.manager.clone(),
                    cvar,
                })
            }
        }
    }

    /// Active open: allocates an ephemeral local port, writes the initial
    /// SYN, and blocks until the handshake completes, the peer resets it,
    /// or no ephemeral port is free.
    pub fn connect(&mut self, remote_addr: Ipv4Addr, remote_port: u16) -> Result<tcp::TcpStream, Error> {
        let mut manager = self.manager.lock().unwrap();

        let local_port = amap::allocate_ephemeral_port(|port| {
            manager.bounded.contains(&port)
                || manager.pending.keys().any(|q| q.src.port == port)
                || manager.streams.keys().any(|q| q.src.port == port)
        })
        .ok_or(Error::NoMem)?;

        let quad = Quad {
            src: Dual {
                ipv4: self.local_addr,
                port: local_port,
            },
            dst: Dual {
                ipv4: remote_addr,
                port: remote_port,
            },
        };

        log::info!("connecting to {remote_addr}:{remote_port} from local port {local_port}");

        let iss: u32 = rand::random();
        let tcb = {
            let mut tun = self.tun.lock().unwrap();
            TCB::connect(quad, iss, &mut tun)
        };
        let reset = tcb.reset.clone();

        manager.pending.insert(quad, tcb);

        manager = self
            .pending_cvar
            .wait_while(manager, |manager| {
                manager.pending.contains_key(&quad) && !reset.load(Ordering::Acquire)
            })
            .unwrap();

        if reset.load(Ordering::Acquire) {
            return Err(Error::Reset);
        }

        let entry = manager.streams.get(&quad).ok_or(Error::Reset)?;

        Ok(tcp::TcpStream {
            manager: self.manager.clone(),
            quad,
            rvar: entry.rvar.clone(),
            wvar: entry.wvar.clone(),
            svar: entry.svar.clone(),
            closed: false,
            reset: entry.reset.clone(),
        })
    }

    pub fn join(self) {
        self.jh.join().unwrap();
    }
}

fn segment_loop(tun: Arc<Mutex<Tun>>, manager: Arc<Mutex<Manager>>) -> ! {
    loop {
        let mut buf = [0u8; 1500];

        let mut manager = manager.lock().unwrap();
        let mut tun = tun.lock().unwrap();

        let mut to_be_deleted = vec![];
        for (quad, entry) in manager.streams.iter_mut() {
            if entry.tcb.on_tick(&mut tun) {
                to_be_deleted.push(*quad);
            }
        }
        for quad in to_be_deleted {
            if let Some(entry) = manager.streams.remove(&quad) {
                notify_closed(&entry);
                entry.svar.notify_one();
            }
        }

        let mut to_be_deleted = vec![];
        for (quad, tcb) in manager.pending.iter_mut() {
            if tcb.on_tick(&mut tun) {
                to_be_deleted.push(*quad);
            }
        }
        for quad in to_be_deleted {
            manager.pending.remove(&quad);
            manager.pending_cvar.notify_all();
        }

        let mut pfd = [PollFd::new(tun.as_raw_fd(), PollFlags::POLLIN)];
        if poll(&mut pfd[..], 1).unwrap() == 0 {
            continue;
        }

        let n = tun.read(&mut buf).unwrap();

        let Ok(ip4h) = Ipv4HeaderSlice::from_slice(&buf[..n]) else { continue };
        let Ok(tcph) = TcpHeaderSlice::from_slice(&buf[(ip4h.ihl() * 4) as usize..n]) else { continue };
        let data = &buf[(ip4h.ihl() * 4 + tcph.data_offset() * 4) as usize..n];

        let src = Dual {
            ipv4: ip4h.source_addr(),
            port: tcph.source_port(),
        };
        let dst = Dual {
            ipv4: ip4h.destination_addr(),
            port: tcph.destination_port(),
        };

        let quad = Quad { src, dst };

        let old_state = manager.streams.get(&quad).map(|entry| entry.tcb.state);

        let action = if let Some(StreamEntry { tcb, .. }) = manager.streams.get_mut(&quad) {
            tcb.on_segment(ip4h, tcph, data, &mut tun)
        } else if let Some(tcb) = manager.pending.get_mut(&quad) {
            tcb.on_segment(ip4h, tcph, data, &mut tun)
        } else if manager.bounded.iter().any(|port| amap::listener_matches(*port, &quad)) {
            let mut tcb = TCB::listen(quad, rand::random());

            tcb.on_segment(ip4h, tcph, data, &mut tun)
        } else {
            // No connection owns this quad (CLOSED): answer with a reset
            // unless the arriving segment is itself a reset.
            if tcph.rst() {
                continue;
            }

            tcp::write_reset_reply(&mut tun, &ip4h, &tcph, data);

            Action::Noop
        };

        if let Some(old_state) = old_state {
            if let Some(entry) = manager.streams.get(&quad) {
                let new_state = entry.tcb.state;
                if new_state != old_state {
                    if let Some(cb) = &entry.on_state_change {
                        cb(old_state, new_state);
                    }
                }
            }
        }

        if let Action::Wakeup { wake_up_reader: true, .. } = &action {
            if let Some(entry) = manager.streams.get(&quad) {
                if let Some(cb) = &entry.on_data_available {
                    cb();
                }
            }
        }

        match action {
            Action::Noop => {}
            Action::AddToPending(tcb) => {
                manager.pending.insert(quad, tcb);
            }
            Action::RemoveFromPending => {
                manager.pending.remove(&quad);
                manager.pending_cvar.notify_all();
            }
            Action::IsEstablished => {
                let is_active = manager
                    .pending
                    .get(&quad)
                    .map(|tcb| tcb.kind == Kind::Active)
                    .unwrap_or(false);
                let tcb = manager.pending.remove(&quad).unwrap();

                let rvar = Arc::new(Condvar::new());
                let wvar = Arc::new(Condvar::new());
                let svar = Arc::new(Condvar::new());
                let reset = tcb.reset.clone();

                manager.streams.insert(
                    quad,
                    StreamEntry {
                        tcb,
                        rvar: rvar.clone(),
                        wvar: wvar.clone(),
                        svar: svar.clone(),
                        reset: reset.clone(),
                        on_state_change: None,
                        on_data_available: None,
                    },
                );

                if is_active {
                    manager.pending_cvar.notify_all();
                } else if let Some(EstabEntry { cvar, elts }) = manager.established.get_mut(&dst.port) {
                    elts.push(EstabElement {
                        quad,
                        rvar,
                        wvar,
                        svar,
                        reset,
                    });
                    cvar.notify_one();
                }
            }
            Action::Reset => {
                if let Some(stream) = manager.streams.remove(&quad) {
                    notify_closed(&stream);
                    stream.reset.store(true, Ordering::Release);
                    stream.rvar.notify_one();
                    stream.wvar.notify_one();
                    stream.svar.notify_one();
                } else {
                    manager.pending.remove(&quad);
                }
                manager.pending_cvar.notify_all();
            }
            Action::Wakeup {
                wake_up_reader,
                wake_up_writer,
                wake_up_closer,
            } => {
                if let Some(StreamEntry {
                    rvar, wvar, svar, ..
                }) = manager.streams.get(&quad)
                {
                    if wake_up_reader {
                        rvar.notify_one();
                    }
                    if wake_up_writer {
                        wvar.notify_one();
                    }
                    if wake_up_closer {
                        svar.notify_one();
                    }
                }
            }
            Action::DeleteTCB => {
                if let Some(entry) = manager.streams.remove(&quad) {
                    notify_closed(&entry);
                    entry.svar.notify_one();
                }
            }
        }
    }
}
