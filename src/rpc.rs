//! The RPC forwarding engine and top-level runtime lifecycle.

use std::any::Any;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use quanta::Instant;

use crate::addr::AddrId;
use crate::codec::{Proc, ProcFn};
use crate::completion::Completion;
use crate::endpoint::Endpoint;
use crate::error::{Error, Result};
use crate::mem::{MemAccess, MemHandle};
use crate::msgbuf::MsgBuf;
use crate::op::{OpCallback, OpOutput};
use crate::registry::Registry;
use crate::tag::TagGenerator;
use crate::transport::Transport;
use crate::type_alias::*;
use crate::wire::{RequestHeader, ResponseHeader, REQUEST_HEADER_BYTES, RESPONSE_HEADER_BYTES};

/// One runtime per process.
static RUNTIME_ACTIVE: AtomicBool = AtomicBool::new(false);

/// State shared between a [`Request`] and its operation callbacks.
struct ReqShared {
    dec: ProcFn,

    /// Caller-owned output value, filled by the response decoder.
    out: Arc<Mutex<dyn Any + Send>>,

    /// Oversize-input side buffer and its handle. Released only once the
    /// response has arrived; the callee may read the buffer until then.
    extra: Mutex<Option<(Vec<u8>, MemHandle)>>,

    /// First error observed by either half of the call.
    error: Mutex<Option<Error>>,
}

impl std::fmt::Debug for ReqShared {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReqShared").finish_non_exhaustive()
    }
}

impl ReqShared {
    fn record_error(&self, e: Error) {
        let mut slot = self.error.lock().unwrap();
        if slot.is_none() {
            *slot = Some(e);
        }
    }

    fn first_error(&self) -> Option<Error> {
        *self.error.lock().unwrap()
    }
}

/// An in-flight forwarded call.
///
/// A request is complete once both its send half and its receive half have
/// fired, in either order.
#[derive(Debug)]
pub struct Request {
    id: FnId,
    tag: Tag,
    shared: Arc<ReqShared>,
    send_done: Completion,
    recv_done: Completion,
}

impl Request {
    /// Call identifier this request was forwarded under.
    #[inline(always)]
    pub fn id(&self) -> FnId {
        self.id
    }

    /// Tag pairing the request send with the response receive.
    #[inline(always)]
    pub fn tag(&self) -> Tag {
        self.tag
    }

    /// `true` once both halves of the call have completed.
    #[inline]
    pub fn is_complete(&self) -> bool {
        self.send_done.is_complete() && self.recv_done.is_complete()
    }
}

/// The RPC runtime: function registry, tag space and the endpoint it
/// forwards calls through.
pub struct Rpc<T: Transport> {
    nal: Arc<Endpoint<T>>,
    registry: Registry,
    tags: TagGenerator,
}

impl<T: Transport> Rpc<T> {
    /// Initialize the runtime over a transport. At most one runtime may
    /// exist per process.
    pub fn init(transport: T) -> Result<Self> {
        if RUNTIME_ACTIVE.swap(true, Ordering::SeqCst) {
            log::error!("already initialized");
            return Err(Error::Fail);
        }
        let nal = Arc::new(Endpoint::new(transport));
        let tags = TagGenerator::new(nal.transport_max_tag());
        debug_assert_eq!(tags.max_tag(), nal.max_tag());
        Ok(Self {
            nal,
            registry: Registry::new(),
            tags,
        })
    }

    /// `true` while a runtime value exists in this process.
    pub fn initialized() -> bool {
        RUNTIME_ACTIVE.load(Ordering::SeqCst)
    }

    /// Tear the runtime down. Fails with a protocol error when posted
    /// unexpected receives or undelivered unexpected messages remain; the
    /// runtime is released either way.
    pub fn finalize(self) -> Result<()> {
        self.nal.drain_check()
    }

    /// Library version as (major, minor, patch).
    pub fn version() -> (u32, u32, u32) {
        let parse = |s: &str| s.parse().unwrap_or(0);
        (
            parse(env!("CARGO_PKG_VERSION_MAJOR")),
            parse(env!("CARGO_PKG_VERSION_MINOR")),
            parse(env!("CARGO_PKG_VERSION_PATCH")),
        )
    }

    /// The endpoint this runtime forwards through.
    #[inline(always)]
    pub fn endpoint(&self) -> &Arc<Endpoint<T>> {
        &self.nal
    }

    /// Run one iteration of the event loop.
    #[inline]
    pub fn progress(&self, timeout: Duration) -> Result<()> {
        self.nal.progress(timeout)
    }

    /// Register a function name with its encode/decode routines and return
    /// its call identifier.
    pub fn register(&self, name: &str, enc: ProcFn, dec: ProcFn) -> Result<FnId> {
        self.registry.register(name, enc, dec)
    }

    /// Report whether `name` is registered, and under which identifier.
    pub fn registered(&self, name: &str) -> Option<FnId> {
        self.registry.registered(name)
    }

    /// Resolve a peer URI into an address, completing the underlying
    /// asynchronous lookup before returning.
    pub fn lookup(&self, uri: &str) -> Result<AddrId> {
        let slot = Arc::new(Mutex::new(None));
        let filled = slot.clone();
        let cb: OpCallback = Box::new(move |outcome| {
            if outcome.result.is_ok() {
                if let OpOutput::Lookup { addr } = outcome.output {
                    *filled.lock().unwrap() = Some(addr);
                }
            }
        });
        self.nal.addr_lookup(uri, cb)?;
        let addr = slot.lock().unwrap().take();
        addr.ok_or(Error::Protocol)
    }
}

// The forwarding engine.
impl<T: Transport> Rpc<T> {
    /// Forward a call to `dest`: encode `input`, pre-post the expected
    /// response receive and post the unexpected request send. The decoded
    /// response lands in `output` once the request completes.
    ///
    /// Input that outgrows the request buffer spills into a side buffer
    /// registered for remote read; the callee fetches it through the handle
    /// carried in the request header.
    pub fn forward(
        &self,
        dest: AddrId,
        id: FnId,
        input: &mut dyn Any,
        output: Arc<Mutex<dyn Any + Send>>,
    ) -> Result<Request> {
        let pair = self.registry.lookup(id).ok_or(Error::NoMatch)?;

        let send_buf_size = self.nal.max_unexpected_size();
        let recv_buf_size = self.nal.max_expected_size();
        if send_buf_size <= REQUEST_HEADER_BYTES || recv_buf_size <= RESPONSE_HEADER_BYTES {
            return Err(Error::Size);
        }
        let mut send_buf = MsgBuf::with_capacity(send_buf_size);
        let recv_buf = MsgBuf::with_capacity(recv_buf_size);

        // Encode the input past the header.
        let mut extra = None;
        {
            let storage = send_buf.storage_mut();
            let mut proc = Proc::encode(&mut storage[REQUEST_HEADER_BYTES..]);
            (pair.enc)(&mut proc, input)?;
            let encoded = proc.size();

            match proc.take_extra() {
                Some(mut spill) => {
                    // The eager buffer was too small: expose the whole
                    // encoding through a read-only handle instead.
                    let mut handle =
                        MemHandle::new(spill.as_mut_ptr(), spill.len(), MemAccess::ReadOnly);
                    // SAFETY: the spill buffer lives in `extra` untouched
                    // until the response arrives and deregisters it.
                    unsafe { self.nal.mem_register(&mut handle)? };
                    extra = Some((spill, handle));
                    send_buf.set_len(REQUEST_HEADER_BYTES);
                }
                None => send_buf.set_len(REQUEST_HEADER_BYTES + encoded),
            }
        }

        let header = RequestHeader {
            id,
            extra: extra.as_ref().map(|(_, handle)| handle.clone()),
        };
        if let Err(e) = header.encode(&mut send_buf.storage_mut()[..REQUEST_HEADER_BYTES]) {
            if let Some((_, mut handle)) = extra.take() {
                let _ = self.nal.mem_deregister(&mut handle);
            }
            return Err(e);
        }

        let shared = Arc::new(ReqShared {
            dec: pair.dec.clone(),
            out: output,
            extra: Mutex::new(extra),
            error: Mutex::new(None),
        });
        let send_done = Completion::new();
        let recv_done = Completion::new();

        // The same tag pairs the pre-posted response receive with the
        // request send.
        let tag = self.tags.next();

        let recv_cb = recv_output_cb(Arc::downgrade(&self.nal), shared.clone(), recv_done.clone());
        let recv_op = self.nal.recv_expected(dest, tag, recv_buf, recv_cb)?;

        let send_cb = send_input_cb(shared.clone(), send_done.clone());
        if let Err(e) = self.nal.send_unexpected(dest, send_buf, tag, send_cb) {
            // Unwind the pre-posted receive; its callback releases the
            // extra buffer and handle.
            let _ = self.nal.cancel(recv_op);
            return Err(e);
        }

        Ok(Request {
            id,
            tag,
            shared,
            send_done,
            recv_done,
        })
    }

    /// Wait for a request to complete, charging elapsed time against
    /// `timeout` across the send and receive halves. Returns `Ok(false)`
    /// when the deadline passes first (the request itself is unharmed) and
    /// the first recorded error when the request failed.
    pub fn wait(&self, request: &Request, timeout: Duration) -> Result<bool> {
        let start = Instant::now();

        let fired = request
            .send_done
            .wait(timeout, |remaining| self.nal.progress(remaining))?;
        if let Some(e) = request.shared.first_error() {
            return Err(e);
        }
        if !fired {
            return Ok(false);
        }

        let remaining = timeout.saturating_sub(start.elapsed());
        let fired = request
            .recv_done
            .wait(remaining, |remaining| self.nal.progress(remaining))?;
        if let Some(e) = request.shared.first_error() {
            return Err(e);
        }
        Ok(fired)
    }

    /// [`Rpc::wait`] over several requests, applying the same deadline to
    /// each in turn.
    // TODO: multiplex over a single deadline instead of waiting one by one.
    pub fn wait_all(&self, requests: &[Request], timeout: Duration) -> Vec<Result<bool>> {
        requests.iter().map(|r| self.wait(r, timeout)).collect()
    }

    /// Release a completed request. The decoder runs once more in release
    /// mode so the codec can drop anything it allocated into the output
    /// value. Freeing an incomplete request is an error.
    pub fn request_free(&self, request: Request) -> Result<()> {
        if !request.is_complete() {
            log::error!("trying to free an uncompleted request");
            return Err(Error::Fail);
        }

        let mut proc = Proc::free();
        let mut out = request.shared.out.lock().unwrap();
        (request.shared.dec)(&mut proc, &mut *out)?;
        Ok(())
    }
}

impl<T: Transport> Drop for Rpc<T> {
    fn drop(&mut self) {
        RUNTIME_ACTIVE.store(false, Ordering::SeqCst);
    }
}

/// Send-half completion: the request buffer travels back with the outcome
/// and is dropped here; the extra buffer stays alive for the callee.
fn send_input_cb(shared: Arc<ReqShared>, done: Completion) -> OpCallback {
    Box::new(move |outcome| {
        if let Err(e) = outcome.result {
            shared.record_error(e);
        }
        done.complete();
    })
}

/// Receive-half completion: release the extra buffer, verify the response
/// header and decode the output.
fn recv_output_cb<T: Transport>(
    nal: Weak<Endpoint<T>>,
    shared: Arc<ReqShared>,
    done: Completion,
) -> OpCallback {
    Box::new(move |outcome| {
        // The response is in (or the receive failed for good): the callee
        // no longer reads the extra buffer, so release it and its handle.
        if let Some((spill, mut handle)) = shared.extra.lock().unwrap().take() {
            if let Some(nal) = nal.upgrade() {
                if let Err(e) = nal.mem_deregister(&mut handle) {
                    log::warn!("failed to deregister extra buffer handle: {}", e);
                }
            }
            drop(spill);
        }

        let decoded = (|| {
            outcome.result?;
            let buf = match outcome.output {
                OpOutput::RecvExpected { buf } => buf,
                _ => return Err(Error::Protocol),
            };

            let header = ResponseHeader::decode(buf.as_slice())?;
            Error::from_code(header.status)?;

            let mut payload = buf;
            let end = payload.len();
            let mut proc = Proc::decode(&mut payload.storage_mut()[RESPONSE_HEADER_BYTES..end]);
            let mut out = shared.out.lock().unwrap();
            (shared.dec)(&mut proc, &mut *out)
        })();

        if let Err(e) = decoded {
            shared.record_error(e);
        }
        done.complete();
    })
}
