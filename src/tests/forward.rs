//! End-to-end forwarding tests over the loopback fabric.

use super::*;

fn spawn_string_server<F>(
    fabric: &LoopbackFabric,
    uri: &str,
    handler: F,
) -> (Arc<AtomicBool>, thread::JoinHandle<()>)
where
    F: Fn(FnId, String) -> String + Send + 'static,
{
    let ep = Arc::new(Endpoint::new(fabric.endpoint(uri)));
    let stop = Arc::new(AtomicBool::new(false));
    let handle = thread::spawn({
        let stop = stop.clone();
        move || serve_strings(ep, stop, handler)
    });
    (stop, handle)
}

fn string_slot(initial: &str) -> Arc<Mutex<dyn Any + Send>> {
    Arc::new(Mutex::new(String::from(initial)))
}

fn slot_contents(slot: &Arc<Mutex<dyn Any + Send>>) -> String {
    slot.lock().unwrap().downcast_ref::<String>().unwrap().clone()
}

/// A small echo round trip: encode, send, receive, verify, decode.
#[test]
fn small_echo() {
    let _guard = rt_lock();
    init_logging();

    let fabric = LoopbackFabric::new();
    let (stop, server) = spawn_string_server(&fabric, "server", |_, s| s);

    let rpc = Rpc::init(fabric.endpoint("client")).unwrap();
    assert!(Rpc::<LoopbackTransport>::initialized());

    let echo_id = rpc
        .register("echo", Arc::new(string_proc), Arc::new(string_proc))
        .unwrap();
    assert_eq!(rpc.registered("echo"), Some(echo_id));
    assert_eq!(rpc.registered("missing"), None);

    let server_addr = rpc.lookup("server").unwrap();

    let mut input = String::from("hello");
    let output = string_slot("");
    let request = rpc
        .forward(server_addr, echo_id, &mut input, output.clone())
        .unwrap();

    assert!(rpc.wait(&request, Duration::from_millis(1000)).unwrap());
    assert!(request.is_complete());
    assert_eq!(slot_contents(&output), "hello");

    rpc.request_free(request).unwrap();
    assert_eq!(slot_contents(&output), "");

    stop.store(true, Ordering::SeqCst);
    server.join().unwrap();
    rpc.finalize().unwrap();
    assert!(!Rpc::<LoopbackTransport>::initialized());
}

/// Input larger than the request buffer travels through a read-only side
/// buffer that the server fetches; buffer and handle are released once the
/// response is in.
#[test]
fn oversize_input_spills() {
    use rand::Rng;

    let _guard = rt_lock();

    let fabric = LoopbackFabric::new();
    let (stop, server) = spawn_string_server(&fabric, "server", |_, s| format!("len={}", s.len()));

    let rpc = Rpc::init(fabric.endpoint("client")).unwrap();
    let id = rpc
        .register("measure", Arc::new(string_proc), Arc::new(string_proc))
        .unwrap();
    let server_addr = rpc.lookup("server").unwrap();

    let payload_len = 2 * rpc.endpoint().max_unexpected_size();
    let mut rng = rand::thread_rng();
    let mut input: String = (0..payload_len)
        .map(|_| rng.gen_range(b'a'..=b'z') as char)
        .collect();
    let output = string_slot("");
    let request = rpc
        .forward(server_addr, id, &mut input, output.clone())
        .unwrap();

    // The side buffer is registered until the response arrives.
    assert!(fabric.region_count() >= 1);

    assert!(rpc.wait(&request, Duration::from_millis(2000)).unwrap());
    assert_eq!(slot_contents(&output), format!("len={}", payload_len));
    assert_eq!(fabric.region_count(), 0);

    rpc.request_free(request).unwrap();
    stop.store(true, Ordering::SeqCst);
    server.join().unwrap();
    rpc.finalize().unwrap();
}

/// Two concurrent calls with distinct tags complete independently; each
/// response fulfils its own request.
#[test]
fn concurrent_calls_pair_correctly() {
    let _guard = rt_lock();

    let fabric = LoopbackFabric::new();
    let (stop, server) = spawn_string_server(&fabric, "server", |id, s| {
        // Distinguishable behavior per call id.
        if id % 2 == 0 {
            s.to_uppercase()
        } else {
            s.chars().rev().collect()
        }
    });

    let rpc = Rpc::init(fabric.endpoint("client")).unwrap();
    let mut ids: Vec<FnId> = Vec::new();
    for name in ["upper0", "upper1", "upper2", "upper3"] {
        ids.push(
            rpc.register(name, Arc::new(string_proc), Arc::new(string_proc))
                .unwrap(),
        );
    }
    let even = *ids.iter().find(|id| *id % 2 == 0).unwrap();
    let odd = *ids.iter().find(|id| *id % 2 == 1).unwrap();
    let server_addr = rpc.lookup("server").unwrap();

    let mut in_a = String::from("abc");
    let mut in_b = String::from("abc");
    let out_a = string_slot("");
    let out_b = string_slot("");
    let req_a = rpc.forward(server_addr, even, &mut in_a, out_a.clone()).unwrap();
    let req_b = rpc.forward(server_addr, odd, &mut in_b, out_b.clone()).unwrap();
    assert_ne!(req_a.tag(), req_b.tag());

    let statuses = rpc.wait_all(&[req_a, req_b], Duration::from_millis(1000));
    assert!(statuses.into_iter().all(|s| s.unwrap()));
    assert_eq!(slot_contents(&out_a), "ABC");
    assert_eq!(slot_contents(&out_b), "cba");

    stop.store(true, Ordering::SeqCst);
    server.join().unwrap();
    rpc.finalize().unwrap();
}

/// Forwarding under an unregistered id fails without touching the wire.
#[test]
fn forward_unregistered_id() {
    let _guard = rt_lock();

    let fabric = LoopbackFabric::new();
    let _server = fabric.endpoint("server");
    let rpc = Rpc::init(fabric.endpoint("client")).unwrap();
    let server_addr = rpc.lookup("server").unwrap();

    let mut input = String::from("x");
    let output = string_slot("");
    let err = rpc
        .forward(server_addr, 0xdead_beef, &mut input, output)
        .unwrap_err();
    assert_eq!(err, Error::NoMatch);

    rpc.finalize().unwrap();
}

/// `wait` reports an un-answered call as incomplete, leaving the request
/// intact.
#[test]
fn wait_times_out() {
    let _guard = rt_lock();

    let fabric = LoopbackFabric::new();
    // A listening peer that never answers.
    let _mute = Arc::new(Endpoint::new(fabric.endpoint("mute")));

    let rpc = Rpc::init(fabric.endpoint("client")).unwrap();
    let id = rpc
        .register("echo", Arc::new(string_proc), Arc::new(string_proc))
        .unwrap();
    let addr = rpc.lookup("mute").unwrap();

    let mut input = String::from("anyone there?");
    let output = string_slot("");
    let request = rpc.forward(addr, id, &mut input, output).unwrap();

    // The send half completes; the response never comes.
    assert!(!rpc.wait(&request, Duration::from_millis(30)).unwrap());
    assert!(!request.is_complete());

    rpc.finalize().unwrap();
}

/// Tearing the runtime down with a parked unexpected receive is a protocol
/// error; the runtime is released regardless.
#[test]
fn finalize_with_pending_receive() {
    let _guard = rt_lock();

    let fabric = LoopbackFabric::new();
    let rpc = Rpc::init(fabric.endpoint("solo")).unwrap();

    rpc.endpoint()
        .recv_unexpected(MsgBuf::with_capacity(64), Box::new(|_| {}))
        .unwrap();

    assert_eq!(rpc.finalize(), Err(Error::Protocol));
    assert!(!Rpc::<LoopbackTransport>::initialized());
}

/// Version numbers come from the package metadata.
#[test]
fn version_is_reported() {
    let (major, minor, patch) = Rpc::<LoopbackTransport>::version();
    assert_eq!((major, minor, patch), (0, 1, 0));
}
