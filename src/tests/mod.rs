#![allow(unused_imports)]

use std::any::Any;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc, Mutex, MutexGuard};
use std::thread;
use std::time::Duration;

use simple_logger::SimpleLogger;

use super::*;
use crate::transport::{LoopbackFabric, LoopbackTransport};
use crate::type_alias::*;
use crate::wire::{RequestHeader, ResponseHeader, REQUEST_HEADER_BYTES, RESPONSE_HEADER_BYTES};

mod forward;

/// Serializes tests that hold the process-wide runtime slot.
static RT_LOCK: Mutex<()> = Mutex::new(());

pub(self) fn rt_lock() -> MutexGuard<'static, ()> {
    RT_LOCK.lock().unwrap_or_else(|e| e.into_inner())
}

pub(self) fn init_logging() {
    let _ = SimpleLogger::new()
        .with_level(log::LevelFilter::Warn)
        .init();
}

/// Codec for a length-prefixed UTF-8 string; one routine serves encode,
/// decode and release.
pub(self) fn string_proc(p: &mut Proc<'_>, value: &mut dyn Any) -> Result<()> {
    let s = value.downcast_mut::<String>().ok_or(Error::InvalidParam)?;
    p.string(s)
}

/// Synchronously resolve a URI on a bare endpoint.
pub(self) fn nal_lookup(ep: &Endpoint<LoopbackTransport>, uri: &str) -> AddrId {
    let slot = Arc::new(Mutex::new(None));
    let filled = slot.clone();
    let cb: OpCallback = Box::new(move |outcome| {
        assert!(outcome.result.is_ok());
        if let OpOutput::Lookup { addr } = outcome.output {
            *filled.lock().unwrap() = Some(addr);
        }
    });
    ep.addr_lookup(uri, cb).unwrap();
    let addr = slot.lock().unwrap().take();
    addr.expect("lookup did not complete")
}

/// Callback that raises a flag on successful completion.
pub(self) fn flag_cb(flag: Arc<AtomicBool>) -> OpCallback {
    Box::new(move |outcome| {
        assert!(outcome.result.is_ok());
        flag.store(true, Ordering::SeqCst);
    })
}

/// Serve string-typed requests on `ep` until `stop` is raised.
///
/// Requests arrive as unexpected messages; oversize inputs are fetched
/// through the side-buffer handle in the request header. The response goes
/// back as an expected send under the request's tag.
pub(self) fn serve_strings<F>(
    ep: Arc<Endpoint<LoopbackTransport>>,
    stop: Arc<AtomicBool>,
    handler: F,
) where
    F: Fn(FnId, String) -> String,
{
    let (tx, rx) = mpsc::channel::<(Option<AddrId>, Tag, MsgBuf)>();

    let post = |tx: &mpsc::Sender<(Option<AddrId>, Tag, MsgBuf)>| -> OpId {
        let tx = tx.clone();
        let buf = MsgBuf::with_capacity(ep.max_unexpected_size());
        let cb: OpCallback = Box::new(move |outcome| {
            if let (Ok(()), OpOutput::RecvUnexpected { buf, source, tag }) =
                (outcome.result, outcome.output)
            {
                let _ = tx.send((source, tag, buf));
            }
        });
        ep.recv_unexpected(buf, cb).unwrap()
    };

    let mut posted = post(&tx);
    while !stop.load(Ordering::SeqCst) {
        let _ = ep.progress(Duration::from_millis(1));
        while let Ok((source, tag, req)) = rx.try_recv() {
            let source = source.expect("arrived request must carry its origin");
            answer_string_request(&ep, source, tag, req, &handler);
            posted = post(&tx);
        }
    }

    // Leave the endpoint drained: the last posted receive never matched.
    let _ = ep.cancel(posted);
}

fn answer_string_request<F>(
    ep: &Arc<Endpoint<LoopbackTransport>>,
    source: AddrId,
    tag: Tag,
    req: MsgBuf,
    handler: &F,
) where
    F: Fn(FnId, String) -> String,
{
    let header = RequestHeader::decode(req.as_slice()).unwrap();

    // Input bytes: inline after the header, or fetched from the caller's
    // side buffer.
    let mut input = match &header.extra {
        Some(remote) => {
            let len = remote.len() as usize;
            let mut local = vec![0u8; len];
            let mut local_handle =
                MemHandle::new(local.as_mut_ptr(), len, MemAccess::ReadWrite);
            unsafe { ep.mem_register(&mut local_handle).unwrap() };

            let done = Arc::new(AtomicBool::new(false));
            ep.get(&local_handle, 0, remote, 0, len as u64, source, flag_cb(done.clone()))
                .unwrap();
            while !done.load(Ordering::SeqCst) {
                let _ = ep.progress(Duration::from_millis(1));
            }
            ep.mem_deregister(&mut local_handle).unwrap();
            local
        }
        None => req.as_slice()[REQUEST_HEADER_BYTES..].to_vec(),
    };

    let mut arg = String::new();
    Proc::decode(&mut input[..]).string(&mut arg).unwrap();
    let mut reply = handler(header.id, arg);

    let mut resp = MsgBuf::with_capacity(ep.max_expected_size());
    ResponseHeader { status: 0 }
        .encode(&mut resp.storage_mut()[..RESPONSE_HEADER_BYTES])
        .unwrap();
    let encoded = {
        let mut p = Proc::encode(&mut resp.storage_mut()[RESPONSE_HEADER_BYTES..]);
        p.string(&mut reply).unwrap();
        assert!(p.take_extra().is_none(), "response must fit the expected buffer");
        p.size()
    };
    resp.set_len(RESPONSE_HEADER_BYTES + encoded);

    ep.send_expected(source, resp, tag, Box::new(|_| {})).unwrap();
}
