//! Session registry
//!
//! Fixed pool of session slots; a session's uid is the index of the slot
//! it was registered in.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use log::{debug, warn};
use parking_lot::Mutex;

use crate::error::{Error, Result};
use crate::session::Session;

pub struct SessionManager {
    capacity: usize,
    slots: Mutex<Vec<Option<Weak<Session>>>>,
    count: AtomicUsize,
}

impl SessionManager {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            slots: Mutex::new((0..capacity).map(|_| None).collect()),
            count: AtomicUsize::new(0),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Live sessions
    pub fn count(&self) -> usize {
        self.count.load(Ordering::Acquire)
    }

    /// Register into the first free slot and return its index as uid
    pub fn reg_id(&self, session: Weak<Session>) -> Result<u32> {
        let mut slots = self.slots.lock();
        let Some(uid) = slots.iter().position(|s| s.is_none()) else {
            warn!("npu: session table full ({})", self.capacity);
            return Err(Error::ResourceExhausted {
                what: "sessions",
                limit: self.capacity,
            });
        };

        slots[uid] = Some(session);
        self.count.fetch_add(1, Ordering::AcqRel);
        debug!("npu: session {} registered", uid);
        Ok(uid as u32)
    }

    pub fn unreg_id(&self, uid: u32) -> Result<()> {
        let mut slots = self.slots.lock();
        match slots.get_mut(uid as usize) {
            Some(slot @ Some(_)) => {
                *slot = None;
                self.count.fetch_sub(1, Ordering::AcqRel);
                debug!("npu: session {} unregistered", uid);
                Ok(())
            }
            _ => Err(Error::NotFound(format!("session {}", uid))),
        }
    }

    pub fn get(&self, uid: u32) -> Option<Arc<Session>> {
        self.slots
            .lock()
            .get(uid as usize)
            .and_then(|s| s.as_ref())
            .and_then(Weak::upgrade)
    }

    /// Uids of every occupied slot
    pub fn occupied(&self) -> Vec<u32> {
        self.slots
            .lock()
            .iter()
            .enumerate()
            .filter(|(_, s)| s.is_some())
            .map(|(uid, _)| uid as u32)
            .collect()
    }
}
