//! Control-socket protocol server.
//!
//! Accepts local stream-socket clients, parses length-prefixed request
//! packets, maps per-connection handles to service records, mutates the
//! graph, and streams replies and event packets back. See
//! [`crate::proto`] for the wire contract.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::ffi::CString;
use std::fs;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::path::{Path, PathBuf};

use nix::errno::Errno;
use nix::sys::socket::{
    accept4, bind, listen, socket, AddressFamily, Backlog, SockFlag, SockType, UnixAddr,
};
use nix::unistd;
use tracing::{debug, info, warn};

use crate::constants::{
    CONTROL_BUFFER_SIZE, CONTROL_OUTBUF_MAX, CP_VERSION, MIN_COMPAT_VERSION,
    SOCKET_BACKLOG,
};
use crate::cpbuffer::CpBuffer;
use crate::env;
use crate::load::ServiceLoader;
use crate::proto::{
    DepKind, Handle, Info, Reply, Request, ServiceEvent, ServiceState, ShutdownType,
    StoppedReason, SB_FLAG_HAS_CONSOLE, SB_FLAG_MARKED_ACTIVE, SB_FLAG_START_SKIPPED,
    SB_FLAG_WAITING_CONSOLE, STATUS_BUFFER_SIZE,
};
use crate::reactor::{Interest, Reactor, WatchTag};
use crate::service::{ConnId, EmittedEvent, ServiceId, ServiceSet};

/// Mutable state a request handler may touch.
pub struct CtlCtx<'a> {
    /// The service graph.
    pub set: &'a mut ServiceSet,
    /// The reactor, for watch and timer manipulation.
    pub rx: &'a mut Reactor,
    /// The loader behind FindService/LoadService/ReloadService.
    pub loader: &'a mut dyn ServiceLoader,
}

enum PacketStatus {
    /// Packet handled and consumed.
    Done,
    /// More bytes are needed (`chklen` updated).
    Incomplete,
    /// The connection must be closed immediately.
    CloseNow,
}

/// Builds the fixed-size status block for a service.
pub fn fill_status_buffer(buf: &mut [u8], set: &ServiceSet, sid: ServiceId) {
    debug_assert!(buf.len() >= STATUS_BUFFER_SIZE);
    let rec = set.rec(sid);
    buf[0] = rec.state() as u8;
    buf[1] = rec.target_state() as u8;

    let mut b0 = 0u8;
    if rec.is_waiting_for_console() {
        b0 |= SB_FLAG_WAITING_CONSOLE;
    }
    if rec.has_console() {
        b0 |= SB_FLAG_HAS_CONSOLE;
    }
    if rec.was_start_skipped() {
        b0 |= SB_FLAG_START_SKIPPED;
    }
    if rec.is_explicitly_activated() {
        b0 |= SB_FLAG_MARKED_ACTIVE;
    }
    buf[2] = b0;
    buf[3] = rec.stop_reason() as u8;
    buf[4] = 0;
    buf[5] = 0;
    for b in buf[6..STATUS_BUFFER_SIZE].iter_mut() {
        *b = 0;
    }

    if rec.state() != ServiceState::Stopped {
        let pid = rec.pid().map(|p| p.as_raw()).unwrap_or(0);
        buf[6..10].copy_from_slice(&pid.to_le_bytes());
    } else if rec.stop_reason() == StoppedReason::ExecFailed {
        if let Some(err) = rec.exec_err() {
            buf[4..6].copy_from_slice(&(err.stage as u16).to_le_bytes());
            buf[6..10].copy_from_slice(&(err.errno as i32).to_le_bytes());
        }
    } else {
        let status = rec.exit_status().map(|s| s.as_int()).unwrap_or(0);
        buf[6..10].copy_from_slice(&status.to_le_bytes());
    }
}

/// One control connection.
struct ControlConn {
    id: ConnId,
    fd: OwnedFd,
    rbuf: CpBuffer<CONTROL_BUFFER_SIZE>,
    /// Bytes required before the pending packet can be processed.
    chklen: usize,
    outbuf: VecDeque<Vec<u8>>,
    /// Bytes of the front packet already written.
    outpkt_index: usize,
    outbuf_size: usize,
    /// Close once the output buffer has drained.
    bad_conn_close: bool,
    /// Send a final out-of-memory byte before closing.
    oom_close: bool,
    /// Subscribed to environment-change events.
    env_listener: bool,
    key_service: BTreeMap<Handle, ServiceId>,
    service_key: HashMap<ServiceId, Vec<Handle>>,
    /// Environment variables changed by this connection this round,
    /// collected for server-wide broadcast.
    env_changes: Vec<String>,
}

impl ControlConn {
    fn new(id: ConnId, fd: OwnedFd) -> ControlConn {
        ControlConn {
            id,
            fd,
            rbuf: CpBuffer::new(),
            chklen: 0,
            outbuf: VecDeque::new(),
            outpkt_index: 0,
            outbuf_size: 0,
            bad_conn_close: false,
            oom_close: false,
            env_listener: false,
            key_service: BTreeMap::new(),
            service_key: HashMap::new(),
            env_changes: Vec::new(),
        }
    }

    // ------------------------------------------------------------------
    // Handle space
    // ------------------------------------------------------------------

    /// Allocates a handle for a record: the first gap in the sorted
    /// handle space. The connection becomes a listener on the record
    /// the first time it maps it.
    fn allocate_handle(&mut self, set: &mut ServiceSet, sid: ServiceId) -> Handle {
        let mut candidate: Handle = 0;
        for &k in self.key_service.keys() {
            if k == candidate {
                candidate += 1;
            } else {
                break;
            }
        }
        if !self.service_key.contains_key(&sid) {
            set.add_listener(sid, self.id);
        }
        self.key_service.insert(candidate, sid);
        self.service_key.entry(sid).or_default().push(candidate);
        candidate
    }

    fn find_service_for_key(&self, handle: Handle) -> Option<ServiceId> {
        self.key_service.get(&handle).copied()
    }

    /// Drops every handle this connection holds for a record, removing
    /// the listener registration.
    fn drop_handles_for(&mut self, set: &mut ServiceSet, sid: ServiceId) {
        if let Some(handles) = self.service_key.remove(&sid) {
            for h in handles {
                self.key_service.remove(&h);
            }
        }
        if set.contains(sid) {
            set.remove_listener(sid, self.id);
        }
    }

    // ------------------------------------------------------------------
    // Write path
    // ------------------------------------------------------------------

    fn update_watches(&self, rx: &mut Reactor) {
        let interest = Interest {
            read: !self.bad_conn_close,
            write: !self.outbuf.is_empty() || self.bad_conn_close,
        };
        rx.set_fd_interest(self.fd.as_raw_fd(), interest);
    }

    /// Queues a packet, attempting an immediate write when nothing is
    /// pending. Returns false if the connection is dead and must be
    /// closed by the caller.
    fn queue_packet(&mut self, rx: &mut Reactor, pkt: &[u8]) -> bool {
        let mut offset = 0;
        if self.outbuf.is_empty() {
            match unistd::write(&self.fd, pkt) {
                Ok(n) if n == pkt.len() => {
                    self.update_watches(rx);
                    return true;
                }
                Ok(n) => offset = n,
                Err(Errno::EAGAIN) | Err(Errno::EINTR) => {}
                Err(Errno::EPIPE) => return false,
                Err(err) => {
                    warn!("error writing to control connection: {err}");
                    return false;
                }
            }
        }

        let rest = &pkt[offset..];
        self.outbuf_size += rest.len();
        if self.outbuf_size > CONTROL_OUTBUF_MAX {
            // Queue blown: treat as resource exhaustion. Drop the
            // pending output and close with a final Oom byte.
            self.outbuf.clear();
            self.outpkt_index = 0;
            self.outbuf_size = 0;
            self.bad_conn_close = true;
            self.oom_close = true;
            self.update_watches(rx);
            return true;
        }
        self.outbuf.push_back(rest.to_vec());
        self.update_watches(rx);
        true
    }

    /// Flushes queued output. Returns true when the connection should
    /// be closed.
    fn send_data(&mut self, rx: &mut Reactor) -> bool {
        if self.outbuf.is_empty() && self.bad_conn_close {
            if self.oom_close {
                let _ = unistd::write(&self.fd, &[Reply::Oom as u8]);
            }
            return true;
        }

        let (pkt_len, write_res) = {
            let Some(pkt) = self.outbuf.front() else {
                self.update_watches(rx);
                return false;
            };
            (pkt.len(), unistd::write(&self.fd, &pkt[self.outpkt_index..]))
        };
        match write_res {
            Ok(written) => {
                self.outpkt_index += written;
                self.outbuf_size -= written;
                if self.outpkt_index == pkt_len {
                    self.outbuf.pop_front();
                    self.outpkt_index = 0;
                    if self.outbuf.is_empty() {
                        if self.bad_conn_close {
                            if self.oom_close {
                                let _ = unistd::write(&self.fd, &[Reply::Oom as u8]);
                            }
                            return true;
                        }
                        self.update_watches(rx);
                    }
                }
                false
            }
            Err(Errno::EPIPE) => true,
            Err(Errno::EAGAIN) | Err(Errno::EINTR) => false,
            Err(err) => {
                warn!("error writing to control connection: {err}");
                true
            }
        }
    }

    fn reply_byte(&mut self, rx: &mut Reactor, reply: Reply) -> bool {
        self.queue_packet(rx, &[reply as u8])
    }

    /// Queues a BadReq reply and marks the connection for closure after
    /// the flush.
    fn bad_request(&mut self, rx: &mut Reactor) -> PacketStatus {
        if !self.reply_byte(rx, Reply::BadReq) {
            return PacketStatus::CloseNow;
        }
        self.bad_conn_close = true;
        self.update_watches(rx);
        PacketStatus::Done
    }

    // ------------------------------------------------------------------
    // Read path
    // ------------------------------------------------------------------

    /// Reads and processes incoming data. Returns true when the
    /// connection should be closed.
    fn data_ready(&mut self, ctx: &mut CtlCtx<'_>) -> bool {
        match self.rbuf.fill(self.fd.as_raw_fd()) {
            Ok(0) => return true,
            Ok(_) => {}
            Err(err) if err.raw_os_error() == Some(libc::EAGAIN) => return false,
            Err(err) => {
                warn!("error reading from control connection: {err}");
                return true;
            }
        }

        while !self.bad_conn_close
            && !self.rbuf.is_empty()
            && self.rbuf.len() >= self.chklen
        {
            match self.process_packet(ctx) {
                PacketStatus::Done => {
                    self.chklen = 0;
                }
                PacketStatus::Incomplete => {
                    if self.chklen > self.rbuf.capacity() {
                        warn!("received too-large control packet; dropping connection");
                        return !matches!(self.bad_request(ctx.rx), PacketStatus::Done);
                    }
                    break;
                }
                PacketStatus::CloseNow => return true,
            }
        }
        false
    }

    fn process_packet(&mut self, ctx: &mut CtlCtx<'_>) -> PacketStatus {
        let Ok(req) = Request::try_from(self.rbuf.at(0)) else {
            return self.bad_request(ctx.rx);
        };
        match req {
            Request::QueryVersion => {
                let mut pkt = [0u8; 5];
                pkt[0] = Reply::CpVersion as u8;
                pkt[1..3].copy_from_slice(&MIN_COMPAT_VERSION.to_le_bytes());
                pkt[3..5].copy_from_slice(&CP_VERSION.to_le_bytes());
                if !self.queue_packet(ctx.rx, &pkt) {
                    return PacketStatus::CloseNow;
                }
                self.rbuf.consume(1);
                PacketStatus::Done
            }
            Request::FindService | Request::LoadService => self.process_find_load(req, ctx),
            Request::StartService
            | Request::StopService
            | Request::WakeService
            | Request::ReleaseService => self.process_start_stop(req, ctx),
            Request::UnpinService => self.process_unpin(ctx),
            Request::ListServices => self.list_services(ctx),
            Request::UnloadService => self.process_unload(ctx),
            Request::Shutdown => self.process_shutdown(ctx),
            Request::AddDep => self.process_add_dep(ctx, false),
            Request::EnableService => self.process_add_dep(ctx, true),
            Request::RemDep => self.process_rm_dep(ctx),
            Request::QueryLoadMech => self.query_load_mech(ctx),
            Request::QueryServiceName => self.process_query_name(ctx),
            Request::ReloadService => self.process_reload(ctx),
            Request::SetEnv => self.process_setenv(ctx),
            Request::GetAllEnv => self.process_get_all_env(ctx),
            Request::ListenEnv => {
                self.env_listener = true;
                self.rbuf.consume(1);
                if !self.reply_byte(ctx.rx, Reply::Ack) {
                    return PacketStatus::CloseNow;
                }
                PacketStatus::Done
            }
            Request::ServiceStatus => self.process_service_status(ctx),
            Request::SetTrigger => self.process_set_trigger(ctx),
        }
    }

    fn need(&mut self, size: usize) -> Option<PacketStatus> {
        if self.rbuf.len() < size {
            self.chklen = size;
            return Some(PacketStatus::Incomplete);
        }
        None
    }

    fn process_find_load(&mut self, req: Request, ctx: &mut CtlCtx<'_>) -> PacketStatus {
        if let Some(st) = self.need(4) {
            return st;
        }
        let svc_size = self.rbuf.extract_u16(1) as usize;
        if svc_size == 0 || svc_size > CONTROL_BUFFER_SIZE - 3 {
            return self.bad_request(ctx.rx);
        }
        if let Some(st) = self.need(svc_size + 3) {
            return st;
        }
        let pkt_size = svc_size + 3;

        let name_bytes = self.rbuf.extract_vec(3, svc_size);
        let record = match String::from_utf8(name_bytes) {
            Ok(name) => {
                if req == Request::LoadService {
                    match ctx.loader.load(ctx.set, &name) {
                        Ok(sid) => Some(sid),
                        Err(err) => {
                            warn!("could not load service {name}: {err}");
                            None
                        }
                    }
                } else {
                    ctx.set.find(&name)
                }
            }
            Err(_) => None,
        };

        let ok = match record {
            Some(sid) => {
                let handle = self.allocate_handle(ctx.set, sid);
                let mut pkt = [0u8; 7];
                pkt[0] = Reply::ServiceRecord as u8;
                pkt[1] = ctx.set.rec(sid).state() as u8;
                pkt[2..6].copy_from_slice(&handle.to_le_bytes());
                pkt[6] = ctx.set.rec(sid).target_state() as u8;
                self.queue_packet(ctx.rx, &pkt)
            }
            None => self.reply_byte(ctx.rx, Reply::NoService),
        };
        if !ok {
            return PacketStatus::CloseNow;
        }
        self.rbuf.consume(pkt_size);
        PacketStatus::Done
    }

    /// Gentle stops refuse to proceed when regular dependents hold the
    /// service; every service that would be torn down is reported to
    /// the requester instead.
    fn check_dependents(
        &mut self,
        ctx: &mut CtlCtx<'_>,
        sid: ServiceId,
    ) -> Result<bool, ()> {
        let mut affected: Vec<ServiceId> = Vec::new();
        let mut queue = vec![sid];
        while let Some(cur) = queue.pop() {
            let dep_edges: Vec<_> = ctx.set.rec(cur).dependents().to_vec();
            for eid in dep_edges {
                let (from, kind, holding) = {
                    let e = ctx.set.edge(eid);
                    (e.from, e.kind, e.holding_acq)
                };
                if kind == DepKind::Regular && holding && !affected.contains(&from) {
                    affected.push(from);
                    queue.push(from);
                }
            }
        }
        let handles: Vec<Handle> = affected
            .into_iter()
            .map(|dept| self.allocate_handle(ctx.set, dept))
            .collect();
        if handles.is_empty() {
            return Ok(false);
        }
        let mut pkt = Vec::with_capacity(5 + handles.len() * 4);
        pkt.push(Reply::Dependents as u8);
        pkt.extend_from_slice(&(handles.len() as u32).to_le_bytes());
        for h in handles {
            pkt.extend_from_slice(&h.to_le_bytes());
        }
        if !self.queue_packet(ctx.rx, &pkt) {
            return Err(());
        }
        Ok(true)
    }

    fn process_start_stop(&mut self, req: Request, ctx: &mut CtlCtx<'_>) -> PacketStatus {
        const PKT_SIZE: usize = 2 + 4;
        if let Some(st) = self.need(PKT_SIZE) {
            return st;
        }
        let flags = self.rbuf.at(1);
        let do_pin = flags & 1 != 0;
        let handle = self.rbuf.extract_u32(2);

        let Some(sid) = self.find_service_for_key(handle) else {
            return self.bad_request(ctx.rx);
        };

        let mut ack = Reply::Ack;
        match req {
            Request::StartService => {
                let rec = ctx.set.rec(sid);
                if ctx.set.is_shutting_down() {
                    ack = Reply::ShuttingDown;
                } else if matches!(
                    rec.state(),
                    ServiceState::Stopped | ServiceState::Stopping
                ) && rec.is_stop_pinned()
                {
                    ack = Reply::PinnedStopped;
                } else {
                    if do_pin {
                        ctx.set.pin_start(sid);
                    }
                    ctx.set.start(sid, true);
                    ctx.set.process_queues(ctx.rx);
                    if ctx.set.rec(sid).state() == ServiceState::Started {
                        ack = Reply::AlreadySs;
                    }
                }
            }
            Request::StopService => {
                let do_restart = flags & 4 != 0;
                let gentle = flags & 2 != 0 || do_restart;
                let rec = ctx.set.rec(sid);
                if do_restart && ctx.set.is_shutting_down() {
                    ack = Reply::ShuttingDown;
                } else if matches!(
                    rec.state(),
                    ServiceState::Started | ServiceState::Starting
                ) && rec.is_start_pinned()
                {
                    ack = Reply::PinnedStarted;
                } else {
                    if gentle {
                        match self.check_dependents(ctx, sid) {
                            Err(()) => return PacketStatus::CloseNow,
                            Ok(true) => {
                                // Dependents reported; no state change.
                                self.rbuf.consume(PKT_SIZE);
                                return PacketStatus::Done;
                            }
                            Ok(false) => {}
                        }
                    }
                    if do_restart {
                        if !ctx.set.restart(sid) {
                            ack = Reply::Nak;
                        }
                        ctx.set.process_queues(ctx.rx);
                    } else {
                        if do_pin {
                            ctx.set.pin_stop(sid);
                        }
                        ctx.set.stop(sid, true, ctx.rx);
                        ctx.set.forced_stop(sid);
                        ctx.set.process_queues(ctx.rx);
                        if ctx.set.rec(sid).state() == ServiceState::Stopped {
                            ack = Reply::AlreadySs;
                        }
                    }
                }
            }
            Request::WakeService => {
                if ctx.set.is_shutting_down() {
                    ack = Reply::ShuttingDown;
                } else if matches!(
                    ctx.set.rec(sid).state(),
                    ServiceState::Stopped | ServiceState::Stopping
                ) && ctx.set.rec(sid).is_stop_pinned()
                {
                    ack = Reply::PinnedStopped;
                } else {
                    // Re-attach the service to its active dependents,
                    // causing it to start.
                    let mut found = false;
                    let dep_edges: Vec<_> = ctx.set.rec(sid).dependents().to_vec();
                    for eid in dep_edges {
                        let (from, holding, acquires) = {
                            let e = ctx.set.edge(eid);
                            (e.from, e.holding_acq, e.kind.acquires())
                        };
                        let from_state = ctx.set.rec(from).state();
                        if matches!(
                            from_state,
                            ServiceState::Started | ServiceState::Starting
                        ) && acquires
                        {
                            found = true;
                            if !holding {
                                ctx.set.start_dep(eid);
                            }
                        }
                    }
                    if !found {
                        ack = Reply::Nak;
                    } else if do_pin {
                        ctx.set.pin_start(sid);
                    }
                    ctx.set.process_queues(ctx.rx);
                    if found && ctx.set.rec(sid).state() == ServiceState::Started {
                        ack = Reply::AlreadySs;
                    }
                }
            }
            Request::ReleaseService => {
                if do_pin {
                    ctx.set.pin_stop(sid);
                }
                ctx.set.stop(sid, false, ctx.rx);
                ctx.set.process_queues(ctx.rx);
                if ctx.set.rec(sid).state() == ServiceState::Stopped {
                    ack = Reply::AlreadySs;
                }
            }
            _ => unreachable!(),
        }

        if !self.reply_byte(ctx.rx, ack) {
            return PacketStatus::CloseNow;
        }
        self.rbuf.consume(PKT_SIZE);
        PacketStatus::Done
    }

    fn process_unpin(&mut self, ctx: &mut CtlCtx<'_>) -> PacketStatus {
        const PKT_SIZE: usize = 1 + 4;
        if let Some(st) = self.need(PKT_SIZE) {
            return st;
        }
        let handle = self.rbuf.extract_u32(1);
        let Some(sid) = self.find_service_for_key(handle) else {
            return self.bad_request(ctx.rx);
        };
        ctx.set.unpin(sid, ctx.rx);
        ctx.set.process_queues(ctx.rx);
        if !self.reply_byte(ctx.rx, Reply::Ack) {
            return PacketStatus::CloseNow;
        }
        self.rbuf.consume(PKT_SIZE);
        PacketStatus::Done
    }

    fn list_services(&mut self, ctx: &mut CtlCtx<'_>) -> PacketStatus {
        self.rbuf.consume(1);
        for sid in ctx.set.ids() {
            let name = ctx.set.rec(sid).name().as_bytes().to_vec();
            let name_len = name.len().min(255);
            let hdr = 2 + STATUS_BUFFER_SIZE;
            let mut pkt = vec![0u8; hdr + name_len];
            pkt[0] = Reply::SvcInfo as u8;
            pkt[1] = name_len as u8;
            fill_status_buffer(&mut pkt[2..], ctx.set, sid);
            pkt[hdr..].copy_from_slice(&name[..name_len]);
            if !self.queue_packet(ctx.rx, &pkt) {
                return PacketStatus::CloseNow;
            }
        }
        if !self.reply_byte(ctx.rx, Reply::ListDone) {
            return PacketStatus::CloseNow;
        }
        PacketStatus::Done
    }

    fn process_service_status(&mut self, ctx: &mut CtlCtx<'_>) -> PacketStatus {
        const PKT_SIZE: usize = 1 + 4;
        if let Some(st) = self.need(PKT_SIZE) {
            return st;
        }
        let handle = self.rbuf.extract_u32(1);
        self.rbuf.consume(PKT_SIZE);

        let Some(sid) = self.find_service_for_key(handle) else {
            if self.reply_byte(ctx.rx, Reply::Nak) {
                return PacketStatus::Done;
            }
            return PacketStatus::CloseNow;
        };

        let mut pkt = vec![0u8; 2 + STATUS_BUFFER_SIZE];
        pkt[0] = Reply::ServiceStatus as u8;
        fill_status_buffer(&mut pkt[2..], ctx.set, sid);
        if !self.queue_packet(ctx.rx, &pkt) {
            return PacketStatus::CloseNow;
        }
        PacketStatus::Done
    }

    fn process_unload(&mut self, ctx: &mut CtlCtx<'_>) -> PacketStatus {
        const PKT_SIZE: usize = 1 + 4;
        if let Some(st) = self.need(PKT_SIZE) {
            return st;
        }
        let handle = self.rbuf.extract_u32(1);
        let Some(sid) = self.find_service_for_key(handle) else {
            return self.bad_request(ctx.rx);
        };

        let ok = {
            let rec = ctx.set.rec(sid);
            let lone_ref = rec
                .listeners()
                .iter()
                .all(|&c| c == self.id);
            lone_ref
                && rec.state() == ServiceState::Stopped
                && rec.dependents().is_empty()
                && rec.activation_count() == 0
        };

        let reply = if ok {
            self.drop_handles_for(ctx.set, sid);
            match ctx.set.remove_service(sid) {
                Ok(()) => Reply::Ack,
                Err(reason) => {
                    warn!("cannot unload service: {reason}");
                    Reply::Nak
                }
            }
        } else {
            Reply::Nak
        };
        if !self.reply_byte(ctx.rx, reply) {
            return PacketStatus::CloseNow;
        }
        self.rbuf.consume(PKT_SIZE);
        PacketStatus::Done
    }

    fn process_reload(&mut self, ctx: &mut CtlCtx<'_>) -> PacketStatus {
        const PKT_SIZE: usize = 1 + 4;
        if let Some(st) = self.need(PKT_SIZE) {
            return st;
        }
        let handle = self.rbuf.extract_u32(1);
        let Some(sid) = self.find_service_for_key(handle) else {
            return self.bad_request(ctx.rx);
        };

        let lone_ref = ctx
            .set
            .rec(sid)
            .listeners()
            .iter()
            .all(|&c| c == self.id);

        let reply = if !lone_ref {
            Reply::Nak
        } else {
            self.drop_handles_for(ctx.set, sid);
            match ctx.loader.reload(ctx.set, sid) {
                Ok(_) => {
                    ctx.set.process_queues(ctx.rx);
                    Reply::Ack
                }
                Err(err) => {
                    warn!("could not reload service: {err}");
                    Reply::Nak
                }
            }
        };
        if !self.reply_byte(ctx.rx, reply) {
            return PacketStatus::CloseNow;
        }
        self.rbuf.consume(PKT_SIZE);
        PacketStatus::Done
    }

    fn process_shutdown(&mut self, ctx: &mut CtlCtx<'_>) -> PacketStatus {
        const PKT_SIZE: usize = 2;
        if let Some(st) = self.need(PKT_SIZE) {
            return st;
        }
        let Ok(kind) = ShutdownType::try_from(self.rbuf.at(1)) else {
            return self.bad_request(ctx.rx);
        };
        info!("shutdown requested via control connection ({kind})");
        ctx.set.stop_all_services(kind, ctx.rx);
        if !self.reply_byte(ctx.rx, Reply::Ack) {
            return PacketStatus::CloseNow;
        }
        self.rbuf.consume(PKT_SIZE);
        PacketStatus::Done
    }

    fn process_add_dep(&mut self, ctx: &mut CtlCtx<'_>, do_enable: bool) -> PacketStatus {
        const PKT_SIZE: usize = 2 + 4 + 4;
        if let Some(st) = self.need(PKT_SIZE) {
            return st;
        }
        let kind_byte = self.rbuf.at(1);
        let from_handle = self.rbuf.extract_u32(2);
        let to_handle = self.rbuf.extract_u32(6);

        let (Some(from), Some(to)) = (
            self.find_service_for_key(from_handle),
            self.find_service_for_key(to_handle),
        ) else {
            return self.bad_request(ctx.rx);
        };
        if from == to {
            return self.bad_request(ctx.rx);
        }
        let kind = match DepKind::try_from(kind_byte) {
            Ok(k @ (DepKind::Regular | DepKind::Milestone | DepKind::WaitsFor)) => k,
            _ => return self.bad_request(ctx.rx),
        };

        // A regular dependency can only be created while it cannot be
        // immediately contradicted.
        if kind == DepKind::Regular
            && ctx.set.rec(from).state() != ServiceState::Stopped
            && ctx.set.rec(to).state() != ServiceState::Started
        {
            if !self.reply_byte(ctx.rx, Reply::Nak) {
                return PacketStatus::CloseNow;
            }
            self.rbuf.consume(PKT_SIZE);
            return PacketStatus::Done;
        }

        if ctx.set.would_create_cycle(from, to) {
            if !self.reply_byte(ctx.rx, Reply::Nak) {
                return PacketStatus::CloseNow;
            }
            self.rbuf.consume(PKT_SIZE);
            return PacketStatus::Done;
        }

        let eid = match ctx.set.find_dep(from, to, kind) {
            Some(existing) => existing,
            None => ctx.set.add_dep(from, to, kind),
        };

        if do_enable
            && matches!(
                ctx.set.rec(from).state(),
                ServiceState::Started | ServiceState::Starting
            )
            && !ctx.set.is_shutting_down()
        {
            ctx.set.start_dep(eid);
            ctx.set.process_queues(ctx.rx);
        }

        if !self.reply_byte(ctx.rx, Reply::Ack) {
            return PacketStatus::CloseNow;
        }
        self.rbuf.consume(PKT_SIZE);
        PacketStatus::Done
    }

    fn process_rm_dep(&mut self, ctx: &mut CtlCtx<'_>) -> PacketStatus {
        const PKT_SIZE: usize = 2 + 4 + 4;
        if let Some(st) = self.need(PKT_SIZE) {
            return st;
        }
        let kind_byte = self.rbuf.at(1);
        let from_handle = self.rbuf.extract_u32(2);
        let to_handle = self.rbuf.extract_u32(6);

        let (Some(from), Some(to)) = (
            self.find_service_for_key(from_handle),
            self.find_service_for_key(to_handle),
        ) else {
            return self.bad_request(ctx.rx);
        };
        if from == to {
            return self.bad_request(ctx.rx);
        }
        let kind = match DepKind::try_from(kind_byte) {
            Ok(k @ (DepKind::Regular | DepKind::Milestone | DepKind::WaitsFor)) => k,
            _ => return self.bad_request(ctx.rx),
        };

        ctx.set.rm_dep(from, to, kind);
        ctx.set.process_queues(ctx.rx);

        if !self.reply_byte(ctx.rx, Reply::Ack) {
            return PacketStatus::CloseNow;
        }
        self.rbuf.consume(PKT_SIZE);
        PacketStatus::Done
    }

    fn query_load_mech(&mut self, ctx: &mut CtlCtx<'_>) -> PacketStatus {
        self.rbuf.consume(1);
        let info = ctx.loader.describe();

        let cwd = info.cwd.as_os_str().as_encoded_bytes();
        let mut pkt = Vec::new();
        pkt.push(Reply::LoaderMech as u8);
        pkt.push(info.mech);
        pkt.extend_from_slice(&0u32.to_le_bytes()); // total size, patched below
        pkt.extend_from_slice(&(info.service_dirs.len() as u32).to_le_bytes());
        pkt.extend_from_slice(&(cwd.len() as u32).to_le_bytes());
        pkt.extend_from_slice(cwd);
        for dir in &info.service_dirs {
            let bytes = dir.as_os_str().as_encoded_bytes();
            pkt.extend_from_slice(&(bytes.len() as u32).to_le_bytes());
            pkt.extend_from_slice(bytes);
        }
        let total = pkt.len() as u32;
        pkt[2..6].copy_from_slice(&total.to_le_bytes());

        if !self.queue_packet(ctx.rx, &pkt) {
            return PacketStatus::CloseNow;
        }
        PacketStatus::Done
    }

    fn process_query_name(&mut self, ctx: &mut CtlCtx<'_>) -> PacketStatus {
        const PKT_SIZE: usize = 2 + 4;
        if let Some(st) = self.need(PKT_SIZE) {
            return st;
        }
        let handle = self.rbuf.extract_u32(2);
        self.rbuf.consume(PKT_SIZE);

        let Some(sid) = self.find_service_for_key(handle) else {
            if self.reply_byte(ctx.rx, Reply::Nak) {
                return PacketStatus::Done;
            }
            return PacketStatus::CloseNow;
        };

        let name = ctx.set.rec(sid).name().as_bytes();
        let mut pkt = Vec::with_capacity(4 + name.len());
        pkt.push(Reply::ServiceName as u8);
        pkt.push(0);
        pkt.extend_from_slice(&(name.len() as u16).to_le_bytes());
        pkt.extend_from_slice(name);
        if !self.queue_packet(ctx.rx, &pkt) {
            return PacketStatus::CloseNow;
        }
        PacketStatus::Done
    }

    fn process_setenv(&mut self, ctx: &mut CtlCtx<'_>) -> PacketStatus {
        if let Some(st) = self.need(4) {
            return st;
        }
        let env_size = self.rbuf.extract_u16(1) as usize;
        if env_size == 0 || env_size > CONTROL_BUFFER_SIZE - 3 {
            return self.bad_request(ctx.rx);
        }
        if let Some(st) = self.need(env_size + 3) {
            return st;
        }
        let pkt_size = env_size + 3;

        let bytes = self.rbuf.extract_vec(3, env_size);
        let assignment = match String::from_utf8(bytes) {
            Ok(s) => s,
            Err(_) => return self.bad_request(ctx.rx),
        };
        match env::set_env_assignment(&assignment) {
            Ok(name) => {
                debug!("environment updated: {name}");
                self.env_changes.push(name);
            }
            Err(()) => return self.bad_request(ctx.rx),
        }

        if !self.reply_byte(ctx.rx, Reply::Ack) {
            return PacketStatus::CloseNow;
        }
        self.rbuf.consume(pkt_size);
        PacketStatus::Done
    }

    fn process_get_all_env(&mut self, ctx: &mut CtlCtx<'_>) -> PacketStatus {
        self.rbuf.consume(1);
        let mut body = Vec::new();
        for entry in env::environment_snapshot() {
            body.extend_from_slice(entry.as_bytes());
            body.push(0);
        }
        let mut pkt = Vec::with_capacity(6 + body.len());
        pkt.push(Reply::AllEnv as u8);
        pkt.push(0);
        pkt.extend_from_slice(&(body.len() as u32).to_le_bytes());
        pkt.extend_from_slice(&body);
        if !self.queue_packet(ctx.rx, &pkt) {
            return PacketStatus::CloseNow;
        }
        PacketStatus::Done
    }

    fn process_set_trigger(&mut self, ctx: &mut CtlCtx<'_>) -> PacketStatus {
        const PKT_SIZE: usize = 2 + 4;
        if let Some(st) = self.need(PKT_SIZE) {
            return st;
        }
        let value = self.rbuf.at(1) != 0;
        let handle = self.rbuf.extract_u32(2);
        let Some(sid) = self.find_service_for_key(handle) else {
            return self.bad_request(ctx.rx);
        };
        let reply = if ctx.set.set_trigger(sid, value) {
            ctx.set.process_queues(ctx.rx);
            Reply::Ack
        } else {
            Reply::Nak
        };
        if !self.reply_byte(ctx.rx, reply) {
            return PacketStatus::CloseNow;
        }
        self.rbuf.consume(PKT_SIZE);
        PacketStatus::Done
    }

    // ------------------------------------------------------------------
    // Event fan-out
    // ------------------------------------------------------------------

    /// Emits a ServiceEvent info packet for each handle mapping the
    /// record. Returns false if the connection died.
    fn send_service_event(
        &mut self,
        rx: &mut Reactor,
        set: &ServiceSet,
        sid: ServiceId,
        event: ServiceEvent,
    ) -> bool {
        let Some(handles) = self.service_key.get(&sid).cloned() else {
            return true;
        };
        for handle in handles {
            let pktsize = 2 + 4 + 1 + STATUS_BUFFER_SIZE;
            let mut pkt = vec![0u8; pktsize];
            pkt[0] = Info::ServiceEvent as u8;
            pkt[1] = pktsize as u8;
            pkt[2..6].copy_from_slice(&handle.to_le_bytes());
            pkt[6] = event as u8;
            fill_status_buffer(&mut pkt[7..], set, sid);
            if !self.queue_packet(rx, &pkt) {
                return false;
            }
        }
        true
    }

    /// Emits an EnvEvent info packet naming a changed variable.
    fn send_env_event(&mut self, rx: &mut Reactor, name: &str) -> bool {
        let body = name.as_bytes();
        if body.len() > u8::MAX as usize - 2 {
            return true;
        }
        let mut pkt = Vec::with_capacity(2 + body.len());
        pkt.push(Info::EnvEvent as u8);
        pkt.push((2 + body.len()) as u8);
        pkt.extend_from_slice(body);
        self.queue_packet(rx, &pkt)
    }
}

/// The control server: listener plus connection table.
pub struct ControlServer {
    listener: Option<OwnedFd>,
    socket_path: Option<PathBuf>,
    conns: HashMap<ConnId, ControlConn>,
    next_conn_id: ConnId,
}

impl Default for ControlServer {
    fn default() -> Self {
        Self::new()
    }
}

impl ControlServer {
    /// Creates a server with no open socket.
    pub fn new() -> ControlServer {
        ControlServer {
            listener: None,
            socket_path: None,
            conns: HashMap::new(),
            next_conn_id: 0,
        }
    }

    /// Number of live control connections.
    pub fn active_conns(&self) -> usize {
        self.conns.len()
    }

    /// Opens the control socket: unlink a stale socket file (when
    /// running as init), bind, restrict to mode 0600, listen, and
    /// register with the reactor. Idempotent.
    pub fn open_socket(
        &mut self,
        path: &Path,
        unlink_stale: bool,
        rx: &mut Reactor,
    ) -> Result<(), crate::error::ControlError> {
        if self.listener.is_some() {
            return Ok(());
        }

        if unlink_stale {
            let _ = fs::remove_file(path);
        }

        let sock = socket(
            AddressFamily::Unix,
            SockType::Stream,
            SockFlag::SOCK_NONBLOCK | SockFlag::SOCK_CLOEXEC,
            None,
        )?;
        let addr = UnixAddr::new(path)?;
        bind(sock.as_raw_fd(), &addr)?;

        // Restrict access before accepting anyone.
        if let Ok(cpath) = CString::new(path.as_os_str().as_encoded_bytes()) {
            unsafe {
                libc::chmod(cpath.as_ptr(), 0o600);
            }
        }

        let backlog = Backlog::new(SOCKET_BACKLOG).unwrap_or(Backlog::MAXCONN);
        listen(&sock, backlog)?;

        rx.add_fd_watch(sock.as_raw_fd(), Interest::READ, WatchTag::ControlListener);
        info!("control socket listening on {}", path.display());
        self.listener = Some(sock);
        self.socket_path = Some(path.to_owned());
        Ok(())
    }

    /// Accepts all pending clients on the control socket.
    pub fn accept_ready(&mut self, rx: &mut Reactor) {
        let Some(listener_fd) = self.listener.as_ref().map(|l| l.as_raw_fd()) else {
            return;
        };
        loop {
            match accept4(
                listener_fd,
                SockFlag::SOCK_NONBLOCK | SockFlag::SOCK_CLOEXEC,
            ) {
                Ok(fd) => {
                    let fd = unsafe { OwnedFd::from_raw_fd(fd) };
                    self.add_connection(fd, rx);
                }
                Err(Errno::EAGAIN) => break,
                Err(Errno::EINTR) => continue,
                Err(err) => {
                    warn!("control socket accept failed: {err}");
                    break;
                }
            }
        }
    }

    /// Adopts an already-connected stream (an accepted client, or the
    /// server end of a pass-control-fd socket pair).
    pub fn add_connection(&mut self, fd: OwnedFd, rx: &mut Reactor) -> ConnId {
        let id = self.next_conn_id;
        self.next_conn_id = self.next_conn_id.wrapping_add(1);
        rx.add_fd_watch(fd.as_raw_fd(), Interest::READ, WatchTag::ControlConn(id));
        debug!("control connection {id} opened");
        self.conns.insert(id, ControlConn::new(id, fd));
        id
    }

    /// Handles readiness on a connection's fd.
    pub fn conn_event(
        &mut self,
        id: ConnId,
        readable: bool,
        writable: bool,
        ctx: &mut CtlCtx<'_>,
    ) {
        let Some(mut conn) = self.conns.remove(&id) else {
            return;
        };
        let mut close = false;
        if readable && !conn.bad_conn_close {
            close = conn.data_ready(ctx);
        }
        if !close && writable {
            close = conn.send_data(ctx.rx);
        }

        let env_changes = std::mem::take(&mut conn.env_changes);
        if close {
            debug!("control connection {id} closed");
            ctx.rx.remove_fd_watch(conn.fd.as_raw_fd());
            ctx.set.remove_listener_all(id);
        } else {
            self.conns.insert(id, conn);
        }

        if !env_changes.is_empty() {
            self.broadcast_env_events(&env_changes, ctx.rx, ctx.set);
        }
    }

    /// Delivers queued service events to their listening connections.
    pub fn dispatch_events(
        &mut self,
        events: Vec<EmittedEvent>,
        set: &mut ServiceSet,
        rx: &mut Reactor,
    ) {
        let mut dead: Vec<ConnId> = Vec::new();
        for ev in events {
            if let Some(conn) = self.conns.get_mut(&ev.conn) {
                if !conn.send_service_event(rx, set, ev.sid, ev.event) {
                    dead.push(ev.conn);
                }
            }
        }
        for id in dead {
            self.close_conn(id, set, rx);
        }
    }

    fn broadcast_env_events(&mut self, names: &[String], rx: &mut Reactor, set: &mut ServiceSet) {
        let mut dead: Vec<ConnId> = Vec::new();
        for (id, conn) in self.conns.iter_mut() {
            if !conn.env_listener {
                continue;
            }
            for name in names {
                if !conn.send_env_event(rx, name) {
                    dead.push(*id);
                    break;
                }
            }
        }
        for id in dead {
            self.close_conn(id, set, rx);
        }
    }

    /// Closes and forgets a connection.
    pub fn close_conn(&mut self, id: ConnId, set: &mut ServiceSet, rx: &mut Reactor) {
        if let Some(conn) = self.conns.remove(&id) {
            rx.remove_fd_watch(conn.fd.as_raw_fd());
            set.remove_listener_all(id);
        }
    }

    /// Closes the listening socket (shutdown path) and unlinks its
    /// filesystem entry.
    pub fn close_socket(&mut self, rx: &mut Reactor) {
        if let Some(listener) = self.listener.take() {
            rx.remove_fd_watch(listener.as_raw_fd());
        }
        if let Some(path) = self.socket_path.take() {
            let _ = fs::remove_file(path);
        }
    }
}
