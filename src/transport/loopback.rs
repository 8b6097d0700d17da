//! In-process loopback transport.
//!
//! A [`LoopbackFabric`] is a bag of named endpoints living in one process,
//! wired together through lock-free event queues. One-sided transfers run
//! eagerly against a fabric-wide region table. Used by tests, benchmarks
//! and demos; real deployments plug their own [`Transport`] underneath.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use std::{ptr, thread};

use ahash::RandomState;
use crossbeam::queue::SegQueue;
use quanta::Instant;

use super::{Event, Transport};
use crate::error::{Error, Result};
use crate::type_alias::*;
use crate::wire::FRAME_BYTES;

/// Default maximum message payload.
const DEFAULT_MAX_MSG_SIZE: usize = 4096;

/// Default transport tag upper bound (the full 31-bit frame field).
const DEFAULT_MAX_TAG: Tag = 0x7fff_ffff;

/// How long `poll` naps between queue checks.
const POLL_NAP: Duration = Duration::from_micros(20);

struct Port {
    uri: String,
    events: Arc<SegQueue<Event<u64>>>,
}

struct Region {
    base: usize,
    len: u64,
    write: bool,
}

struct FabricInner {
    max_msg_size: usize,
    max_tag: Tag,
    ports: Mutex<HashMap<u64, Port, RandomState>>,
    uris: Mutex<HashMap<String, u64, RandomState>>,
    regions: Mutex<HashMap<RmaDesc, Region, RandomState>>,
    next_port: AtomicU64,
    next_region: AtomicU64,
}

/// A process-local fabric of loopback endpoints.
#[derive(Clone)]
pub struct LoopbackFabric {
    inner: Arc<FabricInner>,
}

impl LoopbackFabric {
    pub fn new() -> Self {
        Self::with_limits(DEFAULT_MAX_MSG_SIZE, DEFAULT_MAX_TAG)
    }

    /// Fabric with explicit message-size and tag-space limits.
    pub fn with_limits(max_msg_size: usize, max_tag: Tag) -> Self {
        Self {
            inner: Arc::new(FabricInner {
                max_msg_size,
                max_tag,
                ports: Mutex::new(HashMap::with_hasher(RandomState::new())),
                uris: Mutex::new(HashMap::with_hasher(RandomState::new())),
                regions: Mutex::new(HashMap::with_hasher(RandomState::new())),
                next_port: AtomicU64::new(1),
                next_region: AtomicU64::new(1),
            }),
        }
    }

    /// Open a new endpoint on this fabric under `uri`.
    ///
    /// # Panics
    ///
    /// Panic if the URI is already taken.
    pub fn endpoint(&self, uri: &str) -> LoopbackTransport {
        let id = self.inner.next_port.fetch_add(1, Ordering::Relaxed);
        let events = Arc::new(SegQueue::new());

        let mut uris = self.inner.uris.lock().unwrap();
        assert!(
            !uris.contains_key(uri),
            "loopback URI {:?} is already taken",
            uri
        );
        uris.insert(uri.to_owned(), id);
        self.inner.ports.lock().unwrap().insert(
            id,
            Port {
                uri: uri.to_owned(),
                events: events.clone(),
            },
        );

        LoopbackTransport {
            id,
            uri: uri.to_owned(),
            events,
            fabric: self.inner.clone(),
        }
    }

    /// Number of currently registered memory regions (all endpoints).
    pub fn region_count(&self) -> usize {
        self.inner.regions.lock().unwrap().len()
    }
}

impl Default for LoopbackFabric {
    fn default() -> Self {
        Self::new()
    }
}

/// One endpoint of a [`LoopbackFabric`].
pub struct LoopbackTransport {
    id: u64,
    uri: String,
    events: Arc<SegQueue<Event<u64>>>,
    fabric: Arc<FabricInner>,
}

impl LoopbackTransport {
    fn peer_events(&self, peer: u64) -> Result<Arc<SegQueue<Event<u64>>>> {
        self.fabric
            .ports
            .lock()
            .unwrap()
            .get(&peer)
            .map(|p| p.events.clone())
            .ok_or(Error::Protocol)
    }
}

impl Transport for LoopbackTransport {
    type Conn = u64;

    fn uri(&self) -> &str {
        &self.uri
    }

    fn max_msg_size(&self) -> usize {
        self.fabric.max_msg_size
    }

    fn max_tag(&self) -> Tag {
        self.fabric.max_tag
    }

    fn connect(&mut self, uri: &str) -> Result<u64> {
        self.fabric
            .uris
            .lock()
            .unwrap()
            .get(uri)
            .copied()
            .ok_or(Error::Protocol)
    }

    fn peer_uri(&self, conn: &u64) -> String {
        self.fabric
            .ports
            .lock()
            .unwrap()
            .get(conn)
            .map(|p| p.uri.clone())
            .unwrap_or_default()
    }

    fn send(
        &mut self,
        conn: &u64,
        frame: &[u8; FRAME_BYTES],
        payload: &[u8],
        token: SendToken,
    ) -> Result<()> {
        if payload.len() > self.fabric.max_msg_size {
            return Err(Error::Size);
        }
        let peer = self.peer_events(*conn)?;

        let mut bytes = Vec::with_capacity(FRAME_BYTES + payload.len());
        bytes.extend_from_slice(frame);
        bytes.extend_from_slice(payload);
        peer.push(Event::Recv {
            src: self.id,
            bytes,
        });

        // The copy is out the door; report completion on the next poll.
        self.events.push(Event::Send { token });
        Ok(())
    }

    fn poll(&mut self, timeout: Duration) -> Result<Option<Event<u64>>> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(event) = self.events.pop() {
                return Ok(Some(event));
            }
            if Instant::now() >= deadline {
                return Ok(None);
            }
            thread::sleep(POLL_NAP.min(timeout));
        }
    }

    fn return_event(&mut self, event: Event<u64>) {
        // Event storage is plain heap memory; reclamation is the drop.
        drop(event);
    }

    unsafe fn rma_register(&mut self, base: *mut u8, len: usize, write: bool) -> Result<RmaDesc> {
        let desc = self.fabric.next_region.fetch_add(1, Ordering::Relaxed);
        self.fabric.regions.lock().unwrap().insert(
            desc,
            Region {
                base: base as usize,
                len: len as u64,
                write,
            },
        );
        Ok(desc)
    }

    fn rma_deregister(&mut self, desc: RmaDesc) -> Result<()> {
        match self.fabric.regions.lock().unwrap().remove(&desc) {
            Some(_) => Ok(()),
            None => Err(Error::Protocol),
        }
    }

    fn rma(
        &mut self,
        conn: &u64,
        local: RmaDesc,
        local_off: u64,
        remote: RmaDesc,
        remote_off: u64,
        len: u64,
        write: bool,
        token: SendToken,
    ) -> Result<()> {
        // The peer must still exist, even though the copy itself is local.
        self.peer_events(*conn)?;

        {
            let regions = self.fabric.regions.lock().unwrap();
            let local = regions.get(&local).ok_or(Error::Protocol)?;
            let remote = regions.get(&remote).ok_or(Error::Protocol)?;
            let local_end = local_off.checked_add(len).ok_or(Error::InvalidParam)?;
            let remote_end = remote_off.checked_add(len).ok_or(Error::InvalidParam)?;
            if local_end > local.len || remote_end > remote.len {
                return Err(Error::InvalidParam);
            }
            if write && !remote.write {
                return Err(Error::Permission);
            }
            if !write && !local.write {
                // A get lands in the local region.
                return Err(Error::Permission);
            }

            let local_ptr = (local.base + local_off as usize) as *mut u8;
            let remote_ptr = (remote.base + remote_off as usize) as *mut u8;
            let (src, dst) = if write {
                (local_ptr, remote_ptr)
            } else {
                (remote_ptr, local_ptr)
            };
            // SAFETY: both regions were vouched for at registration and are
            // still registered; offsets and length are bounds-checked above.
            unsafe { ptr::copy_nonoverlapping(src, dst, len as usize) };
        }

        self.events.push(Event::Send { token });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_send_delivers_and_completes() {
        let fabric = LoopbackFabric::new();
        let mut a = fabric.endpoint("a");
        let mut b = fabric.endpoint("b");

        let conn = a.connect("b").unwrap();
        a.send(&conn, &[1, 0, 0, 0], &[9, 9], 7).unwrap();

        match b.poll(Duration::from_millis(100)).unwrap() {
            Some(Event::Recv { bytes, .. }) => assert_eq!(bytes, vec![1, 0, 0, 0, 9, 9]),
            _ => panic!("expected recv event"),
        }
        match a.poll(Duration::from_millis(100)).unwrap() {
            Some(Event::Send { token }) => assert_eq!(token, 7),
            _ => panic!("expected send completion"),
        }
    }

    #[test]
    fn test_poll_times_out_empty() {
        let fabric = LoopbackFabric::new();
        let mut a = fabric.endpoint("a");
        assert!(a.poll(Duration::from_millis(1)).unwrap().is_none());
    }

    #[test]
    fn test_rma_copies_between_regions() {
        let fabric = LoopbackFabric::new();
        let mut a = fabric.endpoint("a");
        let mut b = fabric.endpoint("b");
        let conn = a.connect("b").unwrap();

        let mut src = vec![0xabu8; 32];
        let mut dst = vec![0u8; 32];
        let s = unsafe { a.rma_register(src.as_mut_ptr(), src.len(), false) }.unwrap();
        let d = unsafe { b.rma_register(dst.as_mut_ptr(), dst.len(), true) }.unwrap();
        assert_eq!(fabric.region_count(), 2);

        // put: local a -> remote b
        a.rma(&conn, s, 0, d, 0, 32, true, 1).unwrap();
        assert!(dst.iter().all(|x| *x == 0xab));

        a.rma_deregister(s).unwrap();
        b.rma_deregister(d).unwrap();
        assert_eq!(fabric.region_count(), 0);
    }

    #[test]
    fn test_rma_write_permission_enforced() {
        let fabric = LoopbackFabric::new();
        let mut a = fabric.endpoint("a");
        let mut b = fabric.endpoint("b");
        let conn = a.connect("b").unwrap();

        let mut src = vec![0u8; 8];
        let mut dst = vec![0u8; 8];
        let s = unsafe { a.rma_register(src.as_mut_ptr(), src.len(), true) }.unwrap();
        let d = unsafe { b.rma_register(dst.as_mut_ptr(), dst.len(), false) }.unwrap();

        assert_eq!(a.rma(&conn, s, 0, d, 0, 8, true, 1), Err(Error::Permission));
    }
}
