use std::cmp;
use std::io::{self, Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};

use crate::{DataAvailableCallback, Error, Manager, StateChangeCallback};

use super::{Quad, State};

#[derive(Debug)]
pub struct TcpStream {
    pub(crate) manager: Arc<Mutex<Manager>>,
    pub(crate) quad: Quad,
    pub(crate) rvar: Arc<Condvar>,
    pub(crate) wvar: Arc<Condvar>,
    pub(crate) svar: Arc<Condvar>,
    pub(crate) closed: bool,
    pub(crate) reset: Arc<AtomicBool>,
}

impl TcpStream {
    /// Graceful close (spec's `ucall` `close`): sends FIN and blocks until
    /// the dispatcher has driven the connection all the way to Closed.
    /// `Err(Error::Closing)` if already closed from this side,
    /// `Err(Error::NotExist)` if the connection was already torn down
    /// (reset, or the peer's side already reached Closed) before this call.
    pub fn close(&mut self) -> Result<(), Error> {
        if self.closed {
            return Err(Error::Closing);
        }

        let mut manager = self.manager.lock().unwrap();

        self.closed = true;

        if let Some(entry) = manager.streams.get_mut(&self.quad) {
            entry.tcb.close();
            manager = self.svar.wait(manager).unwrap();
        } else {
            drop(manager);
            return Err(Error::NotExist);
        }

        drop(manager);
        Ok(())
    }

    /// Forced close (spec's `ucall` `abort`): resets the connection
    /// immediately instead of running the FIN handshake, the way
    /// `tcp_uc_abort` answers `ucall`'s `abort` against a live `conn`.
    pub fn abort(&mut self) {
        self.closed = true;

        let mut manager = self.manager.lock().unwrap();

        if let Some(entry) = manager.streams.remove(&self.quad) {
            crate::notify_closed(&entry);
            entry.reset.store(true, Ordering::Release);
            entry.rvar.notify_one();
            entry.wvar.notify_one();
            entry.svar.notify_one();
        }
    }

    /// Spec's `ucall` `status`: a snapshot of the connection's current
    /// state, or `State::Closed` once it's no longer tracked (reset, or
    /// torn down after the close handshake completed).
    pub fn status(&self) -> State {
        let manager = self.manager.lock().unwrap();
        manager
            .streams
            .get(&self.quad)
            .map(|entry| entry.tcb.state)
            .unwrap_or(State::Closed)
    }

    /// Spec's `ucall` `set_callbacks`: registers `on_state_change`/
    /// `on_data_available`, invoked by the dispatcher thread while holding
    /// the connection lock. `Err(Error::NotExist)` if the connection has
    /// already left the dispatcher's tables.
    pub fn set_callbacks(
        &mut self,
        on_state_change: Option<StateChangeCallback>,
        on_data_available: Option<DataAvailableCallback>,
    ) -> Result<(), Error> {
        let mut manager = self.manager.lock().unwrap();
        let entry = manager.streams.get_mut(&self.quad).ok_or(Error::NotExist)?;
        entry.on_state_change = on_state_change;
        entry.on_data_available = on_data_available;
        Ok(())
    }
}

impl Read for TcpStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.reset.load(Ordering::Acquire) {
            return Err(io::Error::new(
                io::ErrorKind::ConnectionReset,
                "Connection has been reset",
            ));
        }

        let mut manager = self.manager.lock().unwrap();

        let empty_and_open = |manager: &Manager| {
            manager
                .streams
                .get(&self.quad)
                .map(|entry| entry.tcb.incoming.is_empty() && !entry.tcb.is_recv_fin())
                .unwrap_or(false)
        };

        if empty_and_open(&manager) {
            manager = self
                .rvar
                .wait_while(manager, |manager| empty_and_open(manager) && !self.reset.load(Ordering::Acquire))
                .unwrap();
        }

        if self.reset.load(Ordering::Acquire) {
            return Err(io::Error::new(
                io::ErrorKind::ConnectionReset,
                "Connection has been reset",
            ));
        }

        let entry = manager.streams.get_mut(&self.quad).ok_or(Error::NotExist)?;

        // Peer's FIN reached in order and nothing left to deliver.
        if entry.tcb.incoming.is_empty() && entry.tcb.is_recv_fin() {
            return Err(io::Error::new(io::ErrorKind::UnexpectedEof, Error::Closing));
        }

        Ok(entry.tcb.recv(buf))
    }
}

impl Write for TcpStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.closed {
            return Err(io::Error::new(io::ErrorKind::NotConnected, Error::Closing));
        }

        if self.reset.load(Ordering::Acquire) {
            return Err(io::Error::new(
                io::ErrorKind::ConnectionReset,
                "Connection has been reset",
            ));
        }

        let mut manager = self.manager.lock().unwrap();

        if manager
            .streams
            .get_mut(&self.quad)
            .ok_or(Error::NotExist)?
            .tcb
            .is_outgoing_full()
        {
            manager = self
                .wvar
                .wait_while(manager, |manager| {
                    manager
                        .streams
                        .get(&self.quad)
                        .map(|entry| entry.tcb.is_outgoing_full())
                        .unwrap_or(false)
                        && !self.reset.load(Ordering::Acquire)
                })
                .unwrap();
        }

        if self.reset.load(Ordering::Acquire) {
            return Err(io::Error::new(
                io::ErrorKind::ConnectionReset,
                "Connection has been reset",
            ));
        }

        let outgoing = &mut manager
            .streams
            .get_mut(&self.quad)
            .ok_or(Error::NotExist)?
            .tcb
            .outgoing;

        let len = cmp::min(buf.len(), super::tcb::SND_BUF_SIZE - outgoing.len());

        outgoing.extend(buf[..len].iter());

        Ok(len)
    }

    fn flush(&mut self) -> io::Result<()> {
        let mut manager = self.manager.lock().unwrap();

        if !manager
            .streams
            .get_mut(&self.quad)
            .ok_or(Error::NotExist)?
            .tcb
            .outgoing
            .is_empty()
        {
            manager = self
                .wvar
                .wait_while(manager, |manager| {
                    manager
                        .streams
                        .get(&self.quad)
                        .map(|entry| !entry.tcb.outgoing.is_empty())
                        .unwrap_or(false)
                        && !self.reset.load(Ordering::Acquire)
                })
                .unwrap();
        }

        drop(manager);

        if self.reset.load(Ordering::Acquire) {
            Err(io::Error::new(
                io::ErrorKind::ConnectionReset,
                "Connection has been reset",
            ))
        } else {
            Ok(())
        }
    }
}

impl Drop for TcpStream {
    fn drop(&mut self) {
        let _ = self.close();
    }
}
