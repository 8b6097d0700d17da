//! Pluggable transport layer.
//!
//! A transport exposes an event-driven endpoint: framed two-sided sends
//! whose completions surface as [`Event::Send`], incoming messages as
//! [`Event::Recv`], and registered-memory one-sided transfers whose
//! completions also surface through the send-event path.

mod loopback;

use std::fmt::Debug;
use std::hash::Hash;
use std::time::Duration;

use crate::error::Result;
use crate::type_alias::*;
use crate::wire::FRAME_BYTES;

/// An event dequeued from the transport.
///
/// Every dequeued event must be handed back via
/// [`Transport::return_event`], on every path, so the transport can reclaim
/// whatever resources back it.
pub enum Event<C> {
    /// A send or one-sided transfer identified by its token completed.
    Send { token: SendToken },

    /// A framed message arrived from a peer.
    Recv { src: C, bytes: Vec<u8> },

    /// Connection-oriented transports only; ignored by this layer.
    ConnectRequest { src: C },
    Connect { src: C },
    Accept { src: C },
}

/// Trait for event-driven endpoints carrying framed two-sided messages and
/// registered-memory one-sided transfers.
pub trait Transport: Send + 'static {
    /// Connection identity of a peer. Must be stable for the lifetime of
    /// the peer so incoming messages can be attributed.
    type Conn: Clone + Eq + Hash + Debug + Send + Sync;

    /// URI of this endpoint.
    fn uri(&self) -> &str;

    /// Maximum payload bytes in a single two-sided message.
    fn max_msg_size(&self) -> usize;

    /// Largest tag value the transport can carry.
    fn max_tag(&self) -> Tag;

    /// Resolve a peer URI into a connection identity.
    fn connect(&mut self, uri: &str) -> Result<Self::Conn>;

    /// URI of a connected peer.
    fn peer_uri(&self, conn: &Self::Conn) -> String;

    /// Post a framed send. Completion is reported as [`Event::Send`]
    /// carrying `token`.
    fn send(
        &mut self,
        conn: &Self::Conn,
        frame: &[u8; FRAME_BYTES],
        payload: &[u8],
        token: SendToken,
    ) -> Result<()>;

    /// Dequeue the next event, waiting up to `timeout`. `Ok(None)` means
    /// the deadline passed with nothing to deliver.
    fn poll(&mut self, timeout: Duration) -> Result<Option<Event<Self::Conn>>>;

    /// Hand a dequeued event back to the transport.
    fn return_event(&mut self, event: Event<Self::Conn>);

    /// Register `[base, base + len)` for one-sided access. Read access is
    /// always granted; `write` additionally allows remote puts.
    ///
    /// # Safety
    ///
    /// The region must stay valid and otherwise untouched until it is
    /// deregistered.
    unsafe fn rma_register(&mut self, base: *mut u8, len: usize, write: bool) -> Result<RmaDesc>;

    /// Drop a region registration.
    fn rma_deregister(&mut self, desc: RmaDesc) -> Result<()>;

    /// Post a one-sided transfer between two registered regions: a put when
    /// `write` is set (local to remote), otherwise a get. Completion is
    /// reported as [`Event::Send`] carrying `token`.
    #[allow(clippy::too_many_arguments)]
    fn rma(
        &mut self,
        conn: &Self::Conn,
        local: RmaDesc,
        local_off: u64,
        remote: RmaDesc,
        remote_off: u64,
        len: u64,
        write: bool,
        token: SendToken,
    ) -> Result<()>;
}

pub use loopback::{LoopbackFabric, LoopbackTransport};
