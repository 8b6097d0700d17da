//! Echo over the in-process loopback fabric: a server endpoint answering
//! string requests, and a client forwarding one call to it.

use std::any::Any;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::thread;
use std::time::Duration;

use hermes::transport::LoopbackFabric;
use hermes::type_alias::Tag;
use hermes::wire::{RequestHeader, ResponseHeader, REQUEST_HEADER_BYTES, RESPONSE_HEADER_BYTES};
use hermes::{AddrId, Endpoint, Error, MsgBuf, OpCallback, OpOutput, Proc, Result, Rpc};

fn string_proc(p: &mut Proc<'_>, value: &mut dyn Any) -> Result<()> {
    let s = value.downcast_mut::<String>().ok_or(Error::InvalidParam)?;
    p.string(s)
}

fn main() {
    simple_logger::SimpleLogger::new()
        .with_level(log::LevelFilter::Info)
        .init()
        .unwrap();

    let fabric = LoopbackFabric::new();
    let stop = Arc::new(AtomicBool::new(false));

    // Server thread: answer each unexpected request with its own payload.
    let server = thread::spawn({
        let ep = Arc::new(Endpoint::new(fabric.endpoint("server")));
        let stop = stop.clone();
        move || {
            let (tx, rx) = mpsc::channel::<(Option<AddrId>, Tag, MsgBuf)>();
            let post = |tx: &mpsc::Sender<(Option<AddrId>, Tag, MsgBuf)>| {
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
                    let source = source.unwrap();
                    let header = RequestHeader::decode(req.as_slice()).unwrap();

                    let mut input = req.as_slice()[REQUEST_HEADER_BYTES..].to_vec();
                    let mut arg = String::new();
                    Proc::decode(&mut input[..]).string(&mut arg).unwrap();
                    log::info!("serving call {:#x} with {:?}", header.id, arg);

                    let mut resp = MsgBuf::with_capacity(ep.max_expected_size());
                    ResponseHeader { status: 0 }
                        .encode(&mut resp.storage_mut()[..RESPONSE_HEADER_BYTES])
                        .unwrap();
                    let encoded = {
                        let mut p = Proc::encode(&mut resp.storage_mut()[RESPONSE_HEADER_BYTES..]);
                        p.string(&mut arg).unwrap();
                        p.size()
                    };
                    resp.set_len(RESPONSE_HEADER_BYTES + encoded);
                    ep.send_expected(source, resp, tag, Box::new(|_| {})).unwrap();

                    posted = post(&tx);
                }
            }
            let _ = ep.cancel(posted);
        }
    });

    // Client.
    let rpc = Rpc::init(fabric.endpoint("client")).unwrap();
    let echo_id = rpc
        .register("echo", Arc::new(string_proc), Arc::new(string_proc))
        .unwrap();
    let server_addr = rpc.lookup("server").unwrap();

    let mut input = String::from("Hello, world!");
    let output: Arc<Mutex<dyn Any + Send>> = Arc::new(Mutex::new(String::new()));
    let request = rpc
        .forward(server_addr, echo_id, &mut input, output.clone())
        .unwrap();

    let complete = rpc.wait(&request, Duration::from_millis(1000)).unwrap();
    assert!(complete, "echo request timed out");

    let reply = output
        .lock()
        .unwrap()
        .downcast_ref::<String>()
        .unwrap()
        .clone();
    log::info!("reply: {:?}", reply);
    assert_eq!(reply, "Hello, world!");

    rpc.request_free(request).unwrap();
    stop.store(true, Ordering::SeqCst);
    server.join().unwrap();
    rpc.finalize().unwrap();
}
