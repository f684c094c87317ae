//! Control protocol behaviour, driven over a socketpair.

use std::io::{Read, Write};
use std::os::fd::OwnedFd;
use std::os::unix::net::UnixStream;
use std::time::Duration;

use ordinit::control::{ControlServer, CtlCtx};
use ordinit::load::MemoryLoader;
use ordinit::proto::{
    DepKind, Info, Reply, Request, ServiceEvent, ServiceState, ShutdownType,
    STATUS_BUFFER_SIZE,
};
use ordinit::reactor::Reactor;
use ordinit::service::{ConnId, ServiceSet};
use ordinit::settings::{ServiceKind, ServiceSettings};

struct Harness {
    set: ServiceSet,
    rx: Reactor,
    loader: MemoryLoader,
    server: ControlServer,
    conn: ConnId,
    client: UnixStream,
}

impl Harness {
    fn new(loader: MemoryLoader) -> Harness {
        let mut rx = Reactor::new().unwrap();
        let mut server = ControlServer::new();
        let (client, server_end) = UnixStream::pair().unwrap();
        server_end.set_nonblocking(true).unwrap();
        client
            .set_read_timeout(Some(Duration::from_millis(500)))
            .unwrap();
        let conn = server.add_connection(OwnedFd::from(server_end), &mut rx);
        Harness { set: ServiceSet::new(), rx, loader, server, conn, client }
    }

    /// Lets the server process pending input and deliver events.
    fn pump(&mut self) {
        let mut ctx = CtlCtx {
            set: &mut self.set,
            rx: &mut self.rx,
            loader: &mut self.loader,
        };
        self.server.conn_event(self.conn, true, true, &mut ctx);
        let events = self.set.take_events();
        self.server.dispatch_events(events, &mut self.set, &mut self.rx);
    }

    fn request(&mut self, bytes: &[u8]) {
        self.client.write_all(bytes).unwrap();
        self.pump();
    }

    fn read_exact(&mut self, n: usize) -> Vec<u8> {
        let mut buf = vec![0u8; n];
        self.client.read_exact(&mut buf).unwrap();
        buf
    }

    fn expect_reply(&mut self, reply: Reply) {
        let got = self.read_exact(1);
        assert_eq!(got[0], reply as u8, "expected {reply}, got byte {}", got[0]);
    }

    /// Loads a service and returns its handle.
    fn load(&mut self, name: &str) -> u32 {
        let mut pkt = vec![Request::LoadService as u8];
        pkt.extend_from_slice(&(name.len() as u16).to_le_bytes());
        pkt.extend_from_slice(name.as_bytes());
        self.request(&pkt);
        let rec = self.read_exact(7);
        assert_eq!(rec[0], Reply::ServiceRecord as u8);
        u32::from_le_bytes([rec[2], rec[3], rec[4], rec[5]])
    }

    fn start(&mut self, handle: u32) -> u8 {
        let mut pkt = vec![Request::StartService as u8, 0];
        pkt.extend_from_slice(&handle.to_le_bytes());
        self.request(&pkt);
        self.read_exact(1)[0]
    }

    fn stop(&mut self, handle: u32, flags: u8) -> u8 {
        let mut pkt = vec![Request::StopService as u8, flags];
        pkt.extend_from_slice(&handle.to_le_bytes());
        self.request(&pkt);
        self.read_exact(1)[0]
    }

    /// Reads one ServiceEvent info packet.
    fn read_event(&mut self) -> (u32, ServiceEvent) {
        let hdr = self.read_exact(2);
        assert_eq!(hdr[0], Info::ServiceEvent as u8);
        let body = self.read_exact(hdr[1] as usize - 2);
        let handle = u32::from_le_bytes([body[0], body[1], body[2], body[3]]);
        let event = match body[4] {
            0 => ServiceEvent::Started,
            1 => ServiceEvent::Stopped,
            2 => ServiceEvent::FailedStart,
            3 => ServiceEvent::StartCancelled,
            4 => ServiceEvent::StopCancelled,
            other => panic!("unknown event code {other}"),
        };
        assert_eq!(body.len(), 5 + STATUS_BUFFER_SIZE);
        (handle, event)
    }
}

fn chain_loader() -> MemoryLoader {
    let mut loader = MemoryLoader::new();
    loader.insert("a", ServiceSettings::internal());
    loader.insert("b", ServiceSettings::internal().with_dep("a", DepKind::Regular));
    loader.insert("c", ServiceSettings::internal().with_dep("b", DepKind::Regular));
    loader
}

#[test]
fn query_version() {
    let mut h = Harness::new(MemoryLoader::new());
    h.request(&[Request::QueryVersion as u8]);
    let reply = h.read_exact(5);
    assert_eq!(reply[0], Reply::CpVersion as u8);
    assert_eq!(u16::from_le_bytes([reply[1], reply[2]]), 1);
    assert_eq!(u16::from_le_bytes([reply[3], reply[4]]), 1);
}

#[test]
fn find_unknown_service() {
    let mut h = Harness::new(MemoryLoader::new());
    let mut pkt = vec![Request::FindService as u8];
    pkt.extend_from_slice(&5u16.to_le_bytes());
    pkt.extend_from_slice(b"ghost");
    h.request(&pkt);
    h.expect_reply(Reply::NoService);
}

#[test]
fn load_start_and_event_stream() {
    let mut h = Harness::new(chain_loader());
    let hc = h.load("c");

    // Internal services settle within the request, so the start is
    // reported as already complete.
    assert_eq!(h.start(hc), Reply::AlreadySs as u8);
    let (handle, event) = h.read_event();
    assert_eq!(handle, hc);
    assert_eq!(event, ServiceEvent::Started);

    // The whole chain is up.
    let a = h.set.find("a").unwrap();
    assert_eq!(h.set.rec(a).state(), ServiceState::Started);

    // A second identical start is redundant too, with no extra event.
    assert_eq!(h.start(hc), Reply::AlreadySs as u8);
    let mut probe = [0u8; 1];
    assert!(h.client.read(&mut probe).is_err(), "unexpected extra data");
}

#[test]
fn triggered_start_acks_then_completes() {
    let mut loader = MemoryLoader::new();
    loader.insert(
        "trig",
        ServiceSettings { kind: ServiceKind::TriggeredInternal, ..ServiceSettings::default() },
    );
    let mut h = Harness::new(loader);
    let ht = h.load("trig");

    // The start is issued but cannot complete until triggered.
    assert_eq!(h.start(ht), Reply::Ack as u8);
    assert_eq!(h.start(ht), Reply::Ack as u8);

    let mut pkt = vec![Request::SetTrigger as u8, 1];
    pkt.extend_from_slice(&ht.to_le_bytes());
    h.request(&pkt);
    h.expect_reply(Reply::Ack);
    let (_, event) = h.read_event();
    assert_eq!(event, ServiceEvent::Started);

    assert_eq!(h.start(ht), Reply::AlreadySs as u8);
}

#[test]
fn gentle_stop_reveals_dependents_then_force_stops() {
    let mut h = Harness::new(chain_loader());
    let hc = h.load("c");
    assert_eq!(h.start(hc), Reply::AlreadySs as u8);
    h.read_event();

    let ha = h.load("a");

    // Gentle stop: the affected dependents are reported, nothing
    // changes.
    let mut pkt = vec![Request::StopService as u8, 2];
    pkt.extend_from_slice(&ha.to_le_bytes());
    h.request(&pkt);
    let head = h.read_exact(5);
    assert_eq!(head[0], Reply::Dependents as u8);
    let count = u32::from_le_bytes([head[1], head[2], head[3], head[4]]);
    assert_eq!(count, 2);
    let body = h.read_exact(8);
    let mut dept_names = Vec::new();
    for pair in body.chunks(4) {
        let handle = u32::from_le_bytes([pair[0], pair[1], pair[2], pair[3]]);
        let mut q = vec![Request::QueryServiceName as u8, 0];
        q.extend_from_slice(&handle.to_le_bytes());
        h.request(&q);
        let hdr = h.read_exact(4);
        assert_eq!(hdr[0], Reply::ServiceName as u8);
        let len = u16::from_le_bytes([hdr[2], hdr[3]]) as usize;
        dept_names.push(String::from_utf8(h.read_exact(len)).unwrap());
    }
    dept_names.sort();
    assert_eq!(dept_names, vec!["b".to_owned(), "c".to_owned()]);
    let a = h.set.find("a").unwrap();
    assert_eq!(h.set.rec(a).state(), ServiceState::Started);

    // Forced stop takes the whole chain down.
    assert_eq!(h.stop(ha, 0), Reply::AlreadySs as u8);
    for sid in h.set.ids() {
        assert_eq!(h.set.rec(sid).state(), ServiceState::Stopped);
    }
}

#[test]
fn add_dep_rejects_cycle() {
    let mut loader = MemoryLoader::new();
    loader.insert("x", ServiceSettings::internal().with_dep("y", DepKind::Regular));
    loader.insert("y", ServiceSettings::internal());
    let mut h = Harness::new(loader);
    let hx = h.load("x");
    let hy = h.load("y");

    // x -> y exists; y -> x would close the loop.
    let mut pkt = vec![Request::AddDep as u8, DepKind::Regular as u8];
    pkt.extend_from_slice(&hy.to_le_bytes());
    pkt.extend_from_slice(&hx.to_le_bytes());
    h.request(&pkt);
    h.expect_reply(Reply::Nak);

    let y = h.set.find("y").unwrap();
    assert!(h.set.rec(y).depends_on().is_empty());
}

#[test]
fn add_then_remove_dep() {
    let mut loader = MemoryLoader::new();
    loader.insert("x", ServiceSettings::internal());
    loader.insert("y", ServiceSettings::internal());
    let mut h = Harness::new(loader);
    let hx = h.load("x");
    let hy = h.load("y");

    let mut pkt = vec![Request::AddDep as u8, DepKind::WaitsFor as u8];
    pkt.extend_from_slice(&hx.to_le_bytes());
    pkt.extend_from_slice(&hy.to_le_bytes());
    h.request(&pkt);
    h.expect_reply(Reply::Ack);

    let x = h.set.find("x").unwrap();
    assert_eq!(h.set.rec(x).depends_on().len(), 1);

    let mut pkt = vec![Request::RemDep as u8, DepKind::WaitsFor as u8];
    pkt.extend_from_slice(&hx.to_le_bytes());
    pkt.extend_from_slice(&hy.to_le_bytes());
    h.request(&pkt);
    h.expect_reply(Reply::Ack);
    assert!(h.set.rec(x).depends_on().is_empty());
}

#[test]
fn wake_service_reattaches_to_dependents() {
    let mut loader = MemoryLoader::new();
    loader.insert("base", ServiceSettings::internal());
    loader.insert(
        "top",
        ServiceSettings::internal().with_dep("base", DepKind::WaitsFor),
    );
    let mut h = Harness::new(loader);
    let htop = h.load("top");
    assert_eq!(h.start(htop), Reply::AlreadySs as u8);
    h.read_event();

    // Stop the dependency alone; the waits-for dependent stays up.
    let hbase = h.load("base");
    assert_eq!(h.stop(hbase, 0), Reply::AlreadySs as u8);
    h.read_event();
    let base = h.set.find("base").unwrap();
    assert_eq!(h.set.rec(base).state(), ServiceState::Stopped);
    let top = h.set.find("top").unwrap();
    assert_eq!(h.set.rec(top).state(), ServiceState::Started);

    // Wake re-attaches it to the started dependent.
    let mut pkt = vec![Request::WakeService as u8, 0];
    pkt.extend_from_slice(&hbase.to_le_bytes());
    h.request(&pkt);
    assert_eq!(h.read_exact(1)[0], Reply::AlreadySs as u8);
    assert_eq!(h.set.rec(base).state(), ServiceState::Started);
    let (handle, event) = h.read_event();
    assert_eq!(handle, hbase);
    assert_eq!(event, ServiceEvent::Started);
}

#[test]
fn release_drops_explicit_activation() {
    let mut loader = MemoryLoader::new();
    loader.insert("solo", ServiceSettings::internal());
    let mut h = Harness::new(loader);
    let hs = h.load("solo");
    assert_eq!(h.start(hs), Reply::AlreadySs as u8);
    h.read_event();

    let mut pkt = vec![Request::ReleaseService as u8, 0];
    pkt.extend_from_slice(&hs.to_le_bytes());
    h.request(&pkt);
    assert_eq!(h.read_exact(1)[0], Reply::AlreadySs as u8);
    let solo = h.set.find("solo").unwrap();
    assert_eq!(h.set.rec(solo).state(), ServiceState::Stopped);
}

#[test]
fn pinned_service_refuses_stop_until_unpinned() {
    let mut loader = MemoryLoader::new();
    loader.insert("pinned", ServiceSettings::internal());
    let mut h = Harness::new(loader);
    let hp = h.load("pinned");

    // Start with the pin flag.
    let mut pkt = vec![Request::StartService as u8, 1];
    pkt.extend_from_slice(&hp.to_le_bytes());
    h.request(&pkt);
    assert_eq!(h.read_exact(1)[0], Reply::AlreadySs as u8);
    h.read_event();

    assert_eq!(h.stop(hp, 0), Reply::PinnedStarted as u8);

    let mut pkt = vec![Request::UnpinService as u8];
    pkt.extend_from_slice(&hp.to_le_bytes());
    h.request(&pkt);
    h.expect_reply(Reply::Ack);

    assert_eq!(h.stop(hp, 0), Reply::AlreadySs as u8);
}

#[test]
fn service_status_block() {
    let mut loader = MemoryLoader::new();
    loader.insert("stat", ServiceSettings::internal());
    let mut h = Harness::new(loader);
    let hs = h.load("stat");
    assert_eq!(h.start(hs), Reply::AlreadySs as u8);
    h.read_event();

    let mut pkt = vec![Request::ServiceStatus as u8];
    pkt.extend_from_slice(&hs.to_le_bytes());
    h.request(&pkt);
    let reply = h.read_exact(2 + STATUS_BUFFER_SIZE);
    assert_eq!(reply[0], Reply::ServiceStatus as u8);
    assert_eq!(reply[2], ServiceState::Started as u8);
    assert_eq!(reply[3], ServiceState::Started as u8);
    // Explicitly activated.
    assert_eq!(reply[4] & 8, 8);
}

#[test]
fn list_services_streams_all_records() {
    let mut h = Harness::new(chain_loader());
    let hc = h.load("c");
    assert_eq!(h.start(hc), Reply::AlreadySs as u8);
    h.read_event();

    h.request(&[Request::ListServices as u8]);
    let mut names = Vec::new();
    loop {
        let t = h.read_exact(1)[0];
        if t == Reply::ListDone as u8 {
            break;
        }
        assert_eq!(t, Reply::SvcInfo as u8);
        let name_len = h.read_exact(1)[0] as usize;
        let status = h.read_exact(STATUS_BUFFER_SIZE);
        assert_eq!(status[0], ServiceState::Started as u8);
        names.push(String::from_utf8(h.read_exact(name_len)).unwrap());
    }
    names.sort();
    assert_eq!(names, vec!["a".to_owned(), "b".to_owned(), "c".to_owned()]);
}

#[test]
fn shutdown_stops_everything_and_gates_starts() {
    let mut h = Harness::new(chain_loader());
    let hc = h.load("c");
    assert_eq!(h.start(hc), Reply::AlreadySs as u8);
    h.read_event();

    h.request(&[Request::Shutdown as u8, ShutdownType::Halt as u8]);
    h.expect_reply(Reply::Ack);
    h.read_event(); // stop event for the held handle
    assert!(h.set.is_shutting_down());
    assert_eq!(h.set.shutdown_type(), Some(ShutdownType::Halt));
    assert_eq!(h.set.active_count(), 0);

    assert_eq!(h.start(hc), Reply::ShuttingDown as u8);
}

#[test]
fn bad_shutdown_kind_is_bad_request() {
    let mut h = Harness::new(MemoryLoader::new());
    h.request(&[Request::Shutdown as u8, 9]);
    h.expect_reply(Reply::BadReq);
    let mut probe = [0u8; 1];
    assert_eq!(h.client.read(&mut probe).unwrap(), 0, "connection not closed");
}

#[test]
fn stale_handle_is_bad_request() {
    let mut h = Harness::new(MemoryLoader::new());
    let mut pkt = vec![Request::StartService as u8, 0];
    pkt.extend_from_slice(&99u32.to_le_bytes());
    h.request(&pkt);
    h.expect_reply(Reply::BadReq);
    let mut probe = [0u8; 1];
    assert_eq!(h.client.read(&mut probe).unwrap(), 0, "connection not closed");
    assert_eq!(h.server.active_conns(), 0);
}

#[test]
fn oversize_packet_drops_connection() {
    let mut h = Harness::new(MemoryLoader::new());
    let mut pkt = vec![Request::FindService as u8];
    pkt.extend_from_slice(&1022u16.to_le_bytes());
    pkt.extend_from_slice(&vec![b'x'; 64]);
    h.request(&pkt);
    h.expect_reply(Reply::BadReq);
    let mut probe = [0u8; 1];
    assert_eq!(h.client.read(&mut probe).unwrap(), 0, "connection not closed");
}

#[test]
fn maximum_size_packet_is_accepted() {
    let mut h = Harness::new(MemoryLoader::new());
    // 3-byte header plus a 1021-byte name: exactly the buffer size.
    let name = vec![b'x'; 1021];
    let mut pkt = vec![Request::FindService as u8];
    pkt.extend_from_slice(&1021u16.to_le_bytes());
    pkt.extend_from_slice(&name);
    h.request(&pkt);
    h.pump();
    h.expect_reply(Reply::NoService);
}

#[test]
fn split_packet_is_reassembled() {
    let mut loader = MemoryLoader::new();
    loader.insert("part", ServiceSettings::internal());
    let mut h = Harness::new(loader);

    let mut pkt = vec![Request::LoadService as u8];
    pkt.extend_from_slice(&4u16.to_le_bytes());
    pkt.extend_from_slice(b"part");

    // Deliver the request a byte at a time.
    for b in pkt {
        h.client.write_all(&[b]).unwrap();
        h.pump();
    }
    let rec = h.read_exact(7);
    assert_eq!(rec[0], Reply::ServiceRecord as u8);
    assert_eq!(rec[1], ServiceState::Stopped as u8);
}

#[test]
fn unload_forgets_service() {
    let mut loader = MemoryLoader::new();
    loader.insert("gone", ServiceSettings::internal());
    let mut h = Harness::new(loader);
    let hg = h.load("gone");

    let mut pkt = vec![Request::UnloadService as u8];
    pkt.extend_from_slice(&hg.to_le_bytes());
    h.request(&pkt);
    h.expect_reply(Reply::Ack);
    assert!(h.set.find("gone").is_none());

    let mut find = vec![Request::FindService as u8];
    find.extend_from_slice(&4u16.to_le_bytes());
    find.extend_from_slice(b"gone");
    h.request(&find);
    h.expect_reply(Reply::NoService);
}

#[test]
fn environment_requests() {
    let mut h = Harness::new(MemoryLoader::new());

    h.request(&[Request::ListenEnv as u8]);
    h.expect_reply(Reply::Ack);

    let assignment = b"ORDINIT_PROTO_TEST=42";
    let mut pkt = vec![Request::SetEnv as u8];
    pkt.extend_from_slice(&(assignment.len() as u16).to_le_bytes());
    pkt.extend_from_slice(assignment);
    h.request(&pkt);
    h.expect_reply(Reply::Ack);

    // Subscribed: the change comes back as an EnvEvent info packet.
    let hdr = h.read_exact(2);
    assert_eq!(hdr[0], Info::EnvEvent as u8);
    let name = h.read_exact(hdr[1] as usize - 2);
    assert_eq!(name, b"ORDINIT_PROTO_TEST");

    h.request(&[Request::GetAllEnv as u8]);
    let head = h.read_exact(6);
    assert_eq!(head[0], Reply::AllEnv as u8);
    let total = u32::from_le_bytes([head[2], head[3], head[4], head[5]]) as usize;
    let body = h.read_exact(total);
    let entries: Vec<&[u8]> = body.split(|&b| b == 0).collect();
    assert!(entries.iter().any(|e| *e == b"ORDINIT_PROTO_TEST=42"));
}

#[test]
fn query_load_mech_reports_loader() {
    let mut loader = MemoryLoader::new();
    loader.set_service_dirs(vec!["/etc/ordinit.d".into()]);
    let mut h = Harness::new(loader);

    h.request(&[Request::QueryLoadMech as u8]);
    let head = h.read_exact(6);
    assert_eq!(head[0], Reply::LoaderMech as u8);
    assert_eq!(head[1], ordinit::load::LOADER_TYPE_MEMORY);
    let total = u32::from_le_bytes([head[2], head[3], head[4], head[5]]) as usize;
    let body = h.read_exact(total - 6);
    let ndirs = u32::from_le_bytes([body[0], body[1], body[2], body[3]]);
    assert_eq!(ndirs, 1);
    let cwd_len = u32::from_le_bytes([body[4], body[5], body[6], body[7]]) as usize;
    let after_cwd = &body[8 + cwd_len..];
    let dir_len =
        u32::from_le_bytes([after_cwd[0], after_cwd[1], after_cwd[2], after_cwd[3]])
            as usize;
    assert_eq!(&after_cwd[4..4 + dir_len], b"/etc/ordinit.d");
}
