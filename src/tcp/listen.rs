use std::sync::{Arc, Condvar, Mutex};

use crate::{Error, EstabElement, Manager};

use super::stream::TcpStream;

#[derive(Debug)]
pub struct TcpListener {
    pub(crate) port: u16,
    pub(crate) manager: Arc<Mutex<Manager>>,
    pub(crate) cvar: Arc<Condvar>,
}

impl TcpListener {
    pub fn accept(&self) -> Result<TcpStream, Error> {
        let mut manager = self.manager.lock().unwrap();

        if manager
            .established
            .get(&self.port)
            .ok_or(Error::NotExist)?
            .elts
            .is_empty()
        {
            manager = self
                .cvar
                .wait_while(manager, |manager| {
                    manager
                        .established
                        .get(&self.port)
                        .map(|entry| entry.elts.is_empty())
                        .unwrap_or(true)
                })
                .unwrap();
        }

        let establisheds = manager
            .established
            .get_mut(&self.port)
            .ok_or(Error::NotExist)?;

        let EstabElement {
            quad,
            rvar,
            wvar,
            svar,
            reset,
        } = establisheds.elts.pop().ok_or(Error::WouldBlock)?;

        Ok(TcpStream {
            manager: self.manager.clone(),
            quad,
            rvar,
            wvar,
            svar,
            closed: false,
            reset,
        })
    }
}

impl Drop for TcpListener {
    fn drop(&mut self) {
        let mut manager = self.manager.lock().unwrap();

        manager.bounded.remove(&self.port);
        manager.established.remove(&self.port);
    }
}
