//! The network abstraction layer: an event-driven endpoint multiplexing
//! unexpected sends, expected receives and one-sided transfers onto a
//! single transport event queue.
//!
//! Lock discipline: the unexpected-message lock is always taken before the
//! unexpected-op lock, so every arrival/post is matched atomically against
//! the opposite queue. No lock is held across transport calls or while a
//! completion callback runs.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use ahash::RandomState;

use crate::addr::{AddrBook, AddrEntry, AddrId, EarlyMsg};
use crate::error::{Error, Result};
use crate::mem::{MemAccess, MemHandle};
use crate::msgbuf::MsgBuf;
use crate::op::{OpCallback, OpId, OpKind, OpOutput, OpRecord};
use crate::transport::{Event, Transport};
use crate::type_alias::*;
use crate::wire::{FrameHeader, FRAME_BYTES};

/// An unexpected message waiting for a receive to be posted.
struct UnexpectedMsg {
    source: AddrId,
    tag: Tag,
    data: Vec<u8>,
}

/// Event-driven endpoint over a [`Transport`].
pub struct Endpoint<T: Transport> {
    transport: Mutex<T>,

    addrs: AddrBook<T::Conn>,

    /// Arrived unexpected messages awaiting a posted receive.
    unexpected_msgs: Mutex<VecDeque<UnexpectedMsg>>,

    /// Posted unexpected receives awaiting an arrival.
    unexpected_ops: Mutex<VecDeque<OpRecord>>,

    /// Posted sends and one-sided transfers, keyed by completion token.
    pending_sends: Mutex<HashMap<SendToken, OpRecord, RandomState>>,

    next_op: AtomicU64,

    uri: String,
    max_msg_size: usize,
    transport_max_tag: Tag,
}

impl<T: Transport> Endpoint<T> {
    pub fn new(transport: T) -> Self {
        let uri = transport.uri().to_owned();
        let max_msg_size = transport.max_msg_size();
        let transport_max_tag = transport.max_tag();
        Self {
            transport: Mutex::new(transport),
            addrs: AddrBook::new(),
            unexpected_msgs: Mutex::new(VecDeque::new()),
            unexpected_ops: Mutex::new(VecDeque::new()),
            pending_sends: Mutex::new(HashMap::with_hasher(RandomState::new())),
            next_op: AtomicU64::new(1),
            uri,
            max_msg_size,
            transport_max_tag,
        }
    }

    /// URI of this endpoint.
    #[inline(always)]
    pub fn uri(&self) -> &str {
        &self.uri
    }

    /// Maximum payload of an unexpected message.
    #[inline(always)]
    pub fn max_unexpected_size(&self) -> usize {
        self.max_msg_size
    }

    /// Maximum payload of an expected message.
    #[inline(always)]
    pub fn max_expected_size(&self) -> usize {
        self.max_msg_size
    }

    /// Largest usable tag. Two transport tag bits stay reserved for
    /// internal signalling.
    #[inline(always)]
    pub fn max_tag(&self) -> Tag {
        self.transport_max_tag >> 2
    }

    /// Transport-reported tag upper bound, before reservation.
    #[inline(always)]
    pub(crate) fn transport_max_tag(&self) -> Tag {
        self.transport_max_tag
    }

    fn next_op_id(&self) -> OpId {
        OpId(self.next_op.fetch_add(1, Ordering::Relaxed))
    }
}

// Address management.
impl<T: Transport> Endpoint<T> {
    /// Resolve a peer URI. The callback carries the fully-formed address;
    /// it fires from this posting context once the transport has produced a
    /// connection identity.
    pub fn addr_lookup(&self, uri: &str, callback: OpCallback) -> Result<OpId> {
        let conn = self.transport.lock().unwrap().connect(uri)?;
        let entry = self.addrs.insert_connected(conn, uri.to_owned(), false);

        let id = self.next_op_id();
        let op = OpRecord::new(id, OpKind::Lookup { addr: entry.id }, callback);
        op.finish(Ok(()), |kind| match kind {
            OpKind::Lookup { addr } => OpOutput::Lookup { addr },
            _ => unreachable!(),
        });
        Ok(id)
    }

    /// Address of this process itself. Self addresses carry no connection
    /// identity and cannot be used as message destinations.
    pub fn addr_self(&self) -> AddrId {
        self.addrs.insert_self(self.uri.clone()).id
    }

    pub fn addr_is_self(&self, addr: AddrId) -> Result<bool> {
        Ok(self.addrs.get(addr).ok_or(Error::InvalidParam)?.is_self)
    }

    pub fn addr_to_string(&self, addr: AddrId) -> Result<String> {
        Ok(self.addrs.get(addr).ok_or(Error::InvalidParam)?.uri.clone())
    }

    /// Free an address. Rejected while its matching queues are non-empty.
    pub fn addr_free(&self, addr: AddrId) -> Result<()> {
        self.addrs.remove(addr)
    }

    fn connected_entry(&self, addr: AddrId) -> Result<(Arc<AddrEntry<T::Conn>>, T::Conn)> {
        let entry = self.addrs.get(addr).ok_or(Error::InvalidParam)?;
        let conn = entry.conn.clone().ok_or(Error::InvalidParam)?;
        Ok((entry, conn))
    }
}

// Two-sided messaging.
impl<T: Transport> Endpoint<T> {
    fn post_send(
        &self,
        dest: AddrId,
        buf: MsgBuf,
        tag: Tag,
        expect: bool,
        callback: OpCallback,
    ) -> Result<OpId> {
        if tag > self.max_tag() {
            return Err(Error::InvalidParam);
        }
        let (_, conn) = self.connected_entry(dest)?;

        let id = self.next_op_id();
        let token: SendToken = id.0;
        let frame = FrameHeader::new(expect, tag).to_bytes();
        self.transport
            .lock()
            .unwrap()
            .send(&conn, &frame, buf.as_slice(), token)?;

        let kind = if expect {
            OpKind::SendExpected { buf }
        } else {
            OpKind::SendUnexpected { buf }
        };
        self.pending_sends
            .lock()
            .unwrap()
            .insert(token, OpRecord::new(id, kind, callback));
        Ok(id)
    }

    /// Post an unexpected send. The buffer is owned by the operation until
    /// the completion callback hands it back.
    pub fn send_unexpected(
        &self,
        dest: AddrId,
        buf: MsgBuf,
        tag: Tag,
        callback: OpCallback,
    ) -> Result<OpId> {
        self.post_send(dest, buf, tag, false, callback)
    }

    /// Post an expected send pairing a pre-posted receive on the peer.
    pub fn send_expected(
        &self,
        dest: AddrId,
        buf: MsgBuf,
        tag: Tag,
        callback: OpCallback,
    ) -> Result<OpId> {
        self.post_send(dest, buf, tag, true, callback)
    }

    /// Post an unexpected receive. Completes synchronously when a message
    /// is already waiting.
    pub fn recv_unexpected(&self, mut buf: MsgBuf, callback: OpCallback) -> Result<OpId> {
        let id = self.next_op_id();

        let mut msgs = self.unexpected_msgs.lock().unwrap();
        if let Some(msg) = msgs.pop_front() {
            drop(msgs);
            buf.fill_truncated(&msg.data);
            let op = OpRecord::new(id, OpKind::RecvUnexpected { buf }, callback);
            op.finish(Ok(()), |kind| match kind {
                OpKind::RecvUnexpected { buf } => OpOutput::RecvUnexpected {
                    buf,
                    source: Some(msg.source),
                    tag: msg.tag,
                },
                _ => unreachable!(),
            });
        } else {
            // Nothing arrived yet; park the op while still holding the
            // message lock so the match stays atomic.
            self.unexpected_ops
                .lock()
                .unwrap()
                .push_back(OpRecord::new(id, OpKind::RecvUnexpected { buf }, callback));
            drop(msgs);
        }
        Ok(id)
    }

    /// Post an expected receive for `tag` from `source`. Completes
    /// synchronously when a matching early arrival is already cached.
    pub fn recv_expected(
        &self,
        source: AddrId,
        tag: Tag,
        mut buf: MsgBuf,
        callback: OpCallback,
    ) -> Result<OpId> {
        let entry = self.addrs.get(source).ok_or(Error::InvalidParam)?;
        let id = self.next_op_id();

        let mut lists = entry.lists.lock().unwrap();
        if let Some(pos) = lists.early.iter().position(|e| e.tag == tag) {
            let early: EarlyMsg = lists.early.remove(pos).unwrap();
            drop(lists);

            buf.fill_truncated(&early.data);
            let op = OpRecord::new(id, OpKind::RecvExpected { tag, buf }, callback);
            op.finish(Ok(()), |kind| match kind {
                OpKind::RecvExpected { buf, .. } => OpOutput::RecvExpected { buf },
                _ => unreachable!(),
            });
        } else {
            lists
                .rxs
                .push_back(OpRecord::new(id, OpKind::RecvExpected { tag, buf }, callback));
        }
        Ok(id)
    }
}

// Registered memory and one-sided transfers.
impl<T: Transport> Endpoint<T> {
    /// Register a handle's region with the transport. Local read access is
    /// always granted; `ReadWrite` handles additionally accept remote puts.
    ///
    /// # Safety
    ///
    /// The handle's region must stay valid, and must not be mutated except
    /// through one-sided transfers, until it is deregistered.
    pub unsafe fn mem_register(&self, handle: &mut MemHandle) -> Result<()> {
        if handle.is_registered() {
            return Err(Error::InvalidParam);
        }
        let write = handle.access() == MemAccess::ReadWrite;
        let desc = self.transport.lock().unwrap().rma_register(
            handle.base() as *mut u8,
            handle.len() as usize,
            write,
        )?;
        handle.bind(desc);
        Ok(())
    }

    /// Drop a handle's registration. Only safe once no one-sided transfer
    /// references it; completions of `put`/`get` establish that.
    pub fn mem_deregister(&self, handle: &mut MemHandle) -> Result<()> {
        let desc = handle.unbind().ok_or(Error::InvalidParam)?;
        self.transport.lock().unwrap().rma_deregister(desc)
    }

    fn post_rma(
        &self,
        local: &MemHandle,
        local_off: u64,
        remote: &MemHandle,
        remote_off: u64,
        len: u64,
        dest: AddrId,
        write: bool,
        callback: OpCallback,
    ) -> Result<OpId> {
        let (local_desc, remote_desc) = match (local.desc(), remote.desc()) {
            (Some(l), Some(r)) => (l, r),
            _ => return Err(Error::InvalidParam),
        };
        let (_, conn) = self.connected_entry(dest)?;

        let id = self.next_op_id();
        let token: SendToken = id.0;
        self.transport.lock().unwrap().rma(
            &conn,
            local_desc,
            local_off,
            remote_desc,
            remote_off,
            len,
            write,
            token,
        )?;

        let kind = if write { OpKind::Put } else { OpKind::Get };
        self.pending_sends
            .lock()
            .unwrap()
            .insert(token, OpRecord::new(id, kind, callback));
        Ok(id)
    }

    /// One-sided write of `len` bytes from the local region into the
    /// remote one. The remote handle must have been registered read-write.
    #[allow(clippy::too_many_arguments)]
    pub fn put(
        &self,
        local: &MemHandle,
        local_off: u64,
        remote: &MemHandle,
        remote_off: u64,
        len: u64,
        dest: AddrId,
        callback: OpCallback,
    ) -> Result<OpId> {
        if remote.access() != MemAccess::ReadWrite {
            log::error!("put requires a read-write remote handle");
            return Err(Error::Permission);
        }
        self.post_rma(local, local_off, remote, remote_off, len, dest, true, callback)
    }

    /// One-sided read of `len` bytes from the remote region into the local
    /// one. Read access is granted to every registered handle.
    #[allow(clippy::too_many_arguments)]
    pub fn get(
        &self,
        local: &MemHandle,
        local_off: u64,
        remote: &MemHandle,
        remote_off: u64,
        len: u64,
        dest: AddrId,
        callback: OpCallback,
    ) -> Result<OpId> {
        self.post_rma(local, local_off, remote, remote_off, len, dest, false, callback)
    }
}

// Progress engine.
impl<T: Transport> Endpoint<T> {
    /// Drain the transport until one event has been handled (and returned
    /// to the transport), or until the deadline passes.
    pub fn progress(&self, timeout: Duration) -> Result<()> {
        let polled = self.transport.lock().unwrap().poll(timeout)?;
        match polled {
            Some(event) => {
                self.dispatch(&event);
                self.transport.lock().unwrap().return_event(event);
                Ok(())
            }
            None => Err(Error::Timeout),
        }
    }

    fn dispatch(&self, event: &Event<T::Conn>) {
        match event {
            Event::Send { token } => self.handle_send(*token),
            Event::Recv { src, bytes } => self.handle_recv(src, bytes),
            Event::ConnectRequest { src } | Event::Connect { src } | Event::Accept { src } => {
                log::trace!("ignoring connection event from {:?}", src);
            }
        }
    }

    fn handle_send(&self, token: SendToken) {
        let op = self.pending_sends.lock().unwrap().remove(&token);
        match op {
            Some(op) => op.finish(Ok(()), |kind| match kind {
                OpKind::SendUnexpected { buf } => OpOutput::SendUnexpected { buf },
                OpKind::SendExpected { buf } => OpOutput::SendExpected { buf },
                OpKind::Put => OpOutput::Put,
                OpKind::Get => OpOutput::Get,
                _ => unreachable!(),
            }),
            None => log::warn!("dropping send completion with unknown token {}", token),
        }
    }

    fn handle_recv(&self, src: &T::Conn, bytes: &[u8]) {
        if bytes.len() < FRAME_BYTES {
            log::warn!("dropping runt message ({} bytes) from {:?}", bytes.len(), src);
            return;
        }
        let frame = FrameHeader::from_bytes(bytes[..FRAME_BYTES].try_into().unwrap());
        let payload = &bytes[FRAME_BYTES..];

        if frame.expect() {
            self.handle_recv_expected(src, frame.tag(), payload);
        } else {
            self.handle_recv_unexpected(src, frame.tag(), payload);
        }
    }

    fn handle_recv_expected(&self, src: &T::Conn, tag: Tag, payload: &[u8]) {
        let Some(entry) = self.addrs.lookup_conn(src) else {
            log::warn!("dropping expected message from unknown peer {:?}", src);
            return;
        };

        let mut lists = entry.lists.lock().unwrap();
        if let Some(pos) = lists
            .rxs
            .iter()
            .position(|op| matches!(op.kind, OpKind::RecvExpected { tag: t, .. } if t == tag))
        {
            let mut op = lists.rxs.remove(pos).unwrap();
            drop(lists);

            if let OpKind::RecvExpected { buf, .. } = &mut op.kind {
                buf.fill_truncated(payload);
            }
            op.finish(Ok(()), |kind| match kind {
                OpKind::RecvExpected { buf, .. } => OpOutput::RecvExpected { buf },
                _ => unreachable!(),
            });
        } else {
            // No post yet; cache a copy until one shows up.
            lists.early.push_back(EarlyMsg {
                tag,
                data: payload.to_vec(),
            });
        }
    }

    fn handle_recv_unexpected(&self, src: &T::Conn, tag: Tag, payload: &[u8]) {
        let entry = match self.addrs.lookup_conn(src) {
            Some(entry) => entry,
            None => {
                let uri = self.transport.lock().unwrap().peer_uri(src);
                self.addrs.insert_connected(src.clone(), uri, true)
            }
        };
        let source = entry.id;

        let mut msgs = self.unexpected_msgs.lock().unwrap();
        let op = self.unexpected_ops.lock().unwrap().pop_front();
        match op {
            Some(mut op) => {
                drop(msgs);
                if let OpKind::RecvUnexpected { buf } = &mut op.kind {
                    buf.fill_truncated(payload);
                }
                op.finish(Ok(()), |kind| match kind {
                    OpKind::RecvUnexpected { buf } => OpOutput::RecvUnexpected {
                        buf,
                        source: Some(source),
                        tag,
                    },
                    _ => unreachable!(),
                });
            }
            None => {
                msgs.push_back(UnexpectedMsg {
                    source,
                    tag,
                    data: payload.to_vec(),
                });
            }
        }
    }
}

// Cancellation and shutdown.
impl<T: Transport> Endpoint<T> {
    /// Cancel a posted receive that has not matched yet. The operation
    /// completes with [`Error::Fail`] from this context. In-flight
    /// operations are not cancellable.
    pub fn cancel(&self, op: OpId) -> Result<()> {
        // Posted unexpected receives.
        {
            let mut ops = self.unexpected_ops.lock().unwrap();
            if let Some(pos) = ops.iter().position(|o| o.id == op) {
                let found = ops.remove(pos).unwrap();
                drop(ops);
                found.finish(Err(Error::Fail), |kind| match kind {
                    OpKind::RecvUnexpected { buf } => OpOutput::RecvUnexpected {
                        buf,
                        source: None,
                        tag: 0,
                    },
                    _ => unreachable!(),
                });
                return Ok(());
            }
        }

        // Posted expected receives, peer by peer.
        for entry in self.addrs.snapshot() {
            let mut lists = entry.lists.lock().unwrap();
            if let Some(pos) = lists.rxs.iter().position(|o| o.id == op) {
                let found = lists.rxs.remove(pos).unwrap();
                drop(lists);
                found.finish(Err(Error::Fail), |kind| match kind {
                    OpKind::RecvExpected { buf, .. } => OpOutput::RecvExpected { buf },
                    _ => unreachable!(),
                });
                return Ok(());
            }
        }

        Err(Error::Protocol)
    }

    /// Verify that the process-wide unexpected queues have been drained.
    /// A non-empty queue at shutdown is a protocol error.
    pub(crate) fn drain_check(&self) -> Result<()> {
        let mut ret = Ok(());
        if !self.unexpected_ops.lock().unwrap().is_empty() {
            log::error!("unexpected op queue should be empty");
            ret = Err(Error::Protocol);
        }
        if !self.unexpected_msgs.lock().unwrap().is_empty() {
            log::error!("unexpected message queue should be empty");
            ret = Err(Error::Protocol);
        }
        ret
    }
}

#[cfg(test)]
impl<T: Transport> Endpoint<T> {
    pub(crate) fn early_len(&self, addr: AddrId) -> usize {
        self.addrs
            .get(addr)
            .map(|e| e.lists.lock().unwrap().early.len())
            .unwrap_or(0)
    }

    pub(crate) fn rxs_len(&self, addr: AddrId) -> usize {
        self.addrs
            .get(addr)
            .map(|e| e.lists.lock().unwrap().rxs.len())
            .unwrap_or(0)
    }

    pub(crate) fn unexpected_msgs_len(&self) -> usize {
        self.unexpected_msgs.lock().unwrap().len()
    }

    pub(crate) fn unexpected_ops_len(&self) -> usize {
        self.unexpected_ops.lock().unwrap().len()
    }
}
