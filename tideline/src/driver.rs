//! Nonblocking socket driver.
//!
//! Owns the poller, connection table, and per-connection buffers. The
//! event loop dispatches readiness events here; futures reach the driver
//! through the thread-local pointer in `runtime::io`. All syscalls loop
//! until `EWOULDBLOCK`, then the corresponding interest is (re)armed.

use std::io;
use std::net::SocketAddr;
use std::os::unix::io::RawFd;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::buffer::{AccumulatorTable, SendBufferTable};
use crate::config::Config;
use crate::connection::{ConnPhase, ConnectionTable};
use crate::error::Error;
use crate::metrics;
use crate::poller::{self, Poller, RegistrationQueue};
use crate::runtime::Executor;

/// Convert a sockaddr_storage to a SocketAddr.
pub(crate) fn sockaddr_to_socket_addr(
    addr: &libc::sockaddr_storage,
    len: u32,
) -> Option<SocketAddr> {
    use std::net::{Ipv4Addr, Ipv6Addr, SocketAddrV4, SocketAddrV6};
    match addr.ss_family as libc::c_int {
        libc::AF_INET if len >= std::mem::size_of::<libc::sockaddr_in>() as u32 => {
            let sa = unsafe { &*(addr as *const _ as *const libc::sockaddr_in) };
            let ip = Ipv4Addr::from(u32::from_be(sa.sin_addr.s_addr));
            let port = u16::from_be(sa.sin_port);
            Some(SocketAddr::V4(SocketAddrV4::new(ip, port)))
        }
        libc::AF_INET6 if len >= std::mem::size_of::<libc::sockaddr_in6>() as u32 => {
            let sa = unsafe { &*(addr as *const _ as *const libc::sockaddr_in6) };
            let ip = Ipv6Addr::from(sa.sin6_addr.s6_addr);
            let port = u16::from_be(sa.sin6_port);
            Some(SocketAddr::V6(SocketAddrV6::new(
                ip,
                port,
                sa.sin6_flowinfo,
                sa.sin6_scope_id,
            )))
        }
        _ => None,
    }
}

/// Write a SocketAddr into a sockaddr_storage, return the address length.
pub(crate) fn socket_addr_to_sockaddr(
    addr: SocketAddr,
    storage: &mut libc::sockaddr_storage,
) -> u32 {
    // Zero the storage to avoid uninitialised padding bytes.
    unsafe {
        std::ptr::write_bytes(
            storage as *mut _ as *mut u8,
            0,
            std::mem::size_of::<libc::sockaddr_storage>(),
        );
    }
    match addr {
        SocketAddr::V4(v4) => {
            let sa = storage as *mut _ as *mut libc::sockaddr_in;
            unsafe {
                (*sa).sin_family = libc::AF_INET as libc::sa_family_t;
                (*sa).sin_port = v4.port().to_be();
                (*sa).sin_addr.s_addr = u32::from_ne_bytes(v4.ip().octets());
            }
            std::mem::size_of::<libc::sockaddr_in>() as u32
        }
        SocketAddr::V6(v6) => {
            let sa = storage as *mut _ as *mut libc::sockaddr_in6;
            unsafe {
                (*sa).sin6_family = libc::AF_INET6 as libc::sa_family_t;
                (*sa).sin6_port = v6.port().to_be();
                (*sa).sin6_flowinfo = v6.flowinfo();
                (*sa).sin6_addr.s6_addr = v6.ip().octets();
                (*sa).sin6_scope_id = v6.scope_id();
            }
            std::mem::size_of::<libc::sockaddr_in6>() as u32
        }
    }
}

/// Size of the stack-shared read scratch buffer. One `read(2)` moves at
/// most this much into an accumulator per call; the read loop continues
/// until `EWOULDBLOCK` regardless.
const READ_CHUNK: usize = 16 * 1024;

/// I/O driver encapsulating all infrastructure state (poller, buffers,
/// connections).
///
/// `EventLoop` is composed of a `Driver` + handler + executor.
pub(crate) struct Driver {
    pub(crate) poller: Poller,
    pub(crate) connections: ConnectionTable,
    pub(crate) accumulators: AccumulatorTable,
    pub(crate) send_buffers: SendBufferTable,
    pub(crate) registrations: RegistrationQueue,
    pub(crate) listen_fd: Option<RawFd>,
    pub(crate) shutdown_flag: Arc<AtomicBool>,
    pub(crate) shutdown_local: bool,
    tcp_nodelay: bool,
    read_buf: Vec<u8>,
}

impl Driver {
    pub(crate) fn new(
        config: &Config,
        poller: Poller,
        listen_fd: Option<RawFd>,
        shutdown_flag: Arc<AtomicBool>,
    ) -> Self {
        let registrations = poller.handle();
        Driver {
            poller,
            connections: ConnectionTable::new(config.max_connections),
            accumulators: AccumulatorTable::new(
                config.max_connections,
                config.read_buffer_capacity,
            ),
            send_buffers: SendBufferTable::new(config.max_connections, config.write_buffer_limit),
            registrations,
            listen_fd,
            shutdown_flag,
            shutdown_local: false,
            tcp_nodelay: config.tcp_nodelay,
            read_buf: vec![0u8; READ_CHUNK],
        }
    }

    /// Arm interest bits for a slot. Goes through the registration queue
    /// so the path is identical for futures on this thread and producers
    /// on other threads; the loop top applies the accumulated mask.
    pub(crate) fn arm(&self, slot: u32, mask: u8) {
        self.registrations.arm(slot, mask);
    }

    /// Apply queued interest changes to the kernel. Called at the top of
    /// each event-loop iteration.
    pub(crate) fn apply_registrations(&mut self) {
        let mut synced = 0u64;
        // Pull the pieces apart so the closure can borrow connections
        // while the poller drains its own queue.
        let connections = &self.connections;
        let poller = &self.poller;
        synced += poller.drain_registrations(|slot| {
            if let Some(cs) = connections.get(slot)
                && cs.fd >= 0
            {
                // MOD failure here means the fd is already gone; teardown
                // will deregister it.
                let _ = poller.sync(slot, cs.fd);
            }
        });
        if synced > 0 {
            metrics::POLLER_REGISTRATIONS.add(synced);
        }
    }

    pub(crate) fn request_shutdown(&mut self) {
        self.shutdown_local = true;
    }

    pub(crate) fn shutdown_requested(&self) -> bool {
        self.shutdown_local || self.shutdown_flag.load(Ordering::Relaxed)
    }

    // ── Accept ───────────────────────────────────────────────────────

    /// Accept everything pending on the listener. New slot indices are
    /// appended to `accepted`; the event loop spawns their tasks.
    pub(crate) fn accept_ready(&mut self, accepted: &mut Vec<u32>) {
        let Some(listen_fd) = self.listen_fd else {
            return;
        };
        loop {
            let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
            let mut len = std::mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
            let fd = unsafe {
                libc::accept4(
                    listen_fd,
                    &mut storage as *mut _ as *mut libc::sockaddr,
                    &mut len,
                    libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
                )
            };
            if fd < 0 {
                let err = io::Error::last_os_error();
                match err.kind() {
                    io::ErrorKind::WouldBlock => break,
                    io::ErrorKind::Interrupted => continue,
                    // Peer vanished between queue and accept.
                    io::ErrorKind::ConnectionAborted => continue,
                    _ => break,
                }
            }

            let Some(slot) = self.connections.allocate(fd) else {
                unsafe { libc::close(fd) };
                continue;
            };
            if self.tcp_nodelay {
                set_tcp_nodelay(fd);
            }
            if self.poller.add(slot, fd).is_err() {
                unsafe { libc::close(fd) };
                self.connections.release(slot);
                continue;
            }
            if let Some(cs) = self.connections.get_mut(slot) {
                cs.peer_addr = sockaddr_to_socket_addr(&storage, len as u32);
            }
            self.accumulators.reset(slot);
            self.send_buffers.get_mut(slot).reset();
            metrics::CONNECTIONS_ACCEPTED.increment();
            metrics::CONNECTIONS_ACTIVE.increment();
            accepted.push(slot);
        }
    }

    // ── Recv ─────────────────────────────────────────────────────────

    /// Socket reported readable: drain it into the accumulator, then
    /// clear the READ interest (the parked future re-arms on its next
    /// incomplete parse) and wake the recv waiter.
    pub(crate) fn handle_readable(&mut self, executor: &mut Executor, slot: u32) {
        let Some(cs) = self.connections.get(slot) else {
            return;
        };
        let fd = cs.fd;
        if fd < 0 {
            return;
        }
        let mut saw_eof = false;
        loop {
            let n = unsafe {
                libc::read(
                    fd,
                    self.read_buf.as_mut_ptr() as *mut libc::c_void,
                    self.read_buf.len(),
                )
            };
            if n > 0 {
                self.accumulators.append(slot, &self.read_buf[..n as usize]);
                metrics::BYTES_RECEIVED.add(n as u64);
                continue;
            }
            if n == 0 {
                saw_eof = true;
                break;
            }
            let err = io::Error::last_os_error();
            match err.kind() {
                io::ErrorKind::WouldBlock => break,
                io::ErrorKind::Interrupted => continue,
                _ => {
                    self.fail_connection(executor, slot, err);
                    return;
                }
            }
        }

        if saw_eof {
            if let Some(cs) = self.connections.get_mut(slot) {
                // Half-close: buffered data stays readable, sends still
                // work until the task decides to close.
                cs.recv_closed = true;
            }
        }
        let remaining = self.poller.interest().clear(slot, poller::READ);
        if let Some(cs) = self.connections.get(slot)
            && cs.fd >= 0
        {
            let _ = self.poller.sync(slot, cs.fd);
            let _ = remaining;
        }
        executor.wake_recv(slot);
    }

    // ── Send ─────────────────────────────────────────────────────────

    /// Stage bytes on a connection and flush as much as the socket takes.
    pub(crate) fn stage_send(
        &mut self,
        executor: &mut Executor,
        conn_index: u32,
        generation: u32,
        data: &[u8],
    ) -> Result<(), Error> {
        let Some(cs) = self.connections.get(conn_index) else {
            return Err(Error::InvalidConnection);
        };
        if cs.generation != generation {
            return Err(Error::InvalidConnection);
        }
        if cs.fd < 0 {
            return Err(Error::ClosedChannel);
        }
        if cs.phase == ConnPhase::Connecting {
            return Err(Error::InvalidConnection);
        }
        if !self.send_buffers.get_mut(conn_index).push(data) {
            return Err(Error::SendBufferFull);
        }
        self.try_flush(executor, conn_index);
        Ok(())
    }

    /// Socket reported writable: the event satisfied the WRITE interest.
    pub(crate) fn handle_writable(&mut self, executor: &mut Executor, slot: u32) {
        self.poller.interest().clear(slot, poller::WRITE);
        self.try_flush(executor, slot);
    }

    /// Write pending bytes until drained or `EWOULDBLOCK`. Arms WRITE on
    /// a partial write; wakes the send waiter when the buffer empties.
    pub(crate) fn try_flush(&mut self, executor: &mut Executor, slot: u32) {
        let Some(cs) = self.connections.get(slot) else {
            return;
        };
        let fd = cs.fd;
        if fd < 0 {
            return;
        }
        loop {
            let buffer = self.send_buffers.get_mut(slot);
            let pending = buffer.pending();
            if pending.is_empty() {
                break;
            }
            let n = unsafe {
                libc::write(fd, pending.as_ptr() as *const libc::c_void, pending.len())
            };
            if n > 0 {
                buffer.advance(n as usize);
                metrics::BYTES_SENT.add(n as u64);
                continue;
            }
            let err = io::Error::last_os_error();
            match err.kind() {
                io::ErrorKind::WouldBlock => {
                    self.arm(slot, poller::WRITE);
                    return;
                }
                io::ErrorKind::Interrupted => continue,
                _ => {
                    self.fail_connection(executor, slot, err);
                    return;
                }
            }
        }
        executor.wake_send(slot);
    }

    // ── Connect ──────────────────────────────────────────────────────

    /// Start a nonblocking outbound connect. Returns the new slot and its
    /// generation; the caller's `ConnectFuture` awaits establishment.
    pub(crate) fn connect(&mut self, addr: SocketAddr) -> Result<(u32, u32), Error> {
        let family = match addr {
            SocketAddr::V4(_) => libc::AF_INET,
            SocketAddr::V6(_) => libc::AF_INET6,
        };
        let fd = unsafe {
            libc::socket(
                family,
                libc::SOCK_STREAM | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
                0,
            )
        };
        if fd < 0 {
            return Err(Error::Io(io::Error::last_os_error()));
        }
        if self.tcp_nodelay {
            set_tcp_nodelay(fd);
        }

        let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
        let len = socket_addr_to_sockaddr(addr, &mut storage);
        let rc = unsafe {
            libc::connect(fd, &storage as *const _ as *const libc::sockaddr, len)
        };
        let in_progress = if rc == 0 {
            false
        } else {
            let err = io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::EINPROGRESS) {
                true
            } else {
                unsafe { libc::close(fd) };
                return Err(Error::Io(err));
            }
        };

        let Some(slot) = self.connections.allocate_outbound(fd) else {
            unsafe { libc::close(fd) };
            return Err(Error::ConnectionLimitReached);
        };
        if let Err(err) = self.poller.add(slot, fd) {
            unsafe { libc::close(fd) };
            self.connections.release(slot);
            return Err(Error::Io(err));
        }
        let generation = self.connections.generation(slot);
        self.accumulators.reset(slot);
        self.send_buffers.get_mut(slot).reset();
        if let Some(cs) = self.connections.get_mut(slot) {
            cs.peer_addr = Some(addr);
            if !in_progress {
                cs.phase = ConnPhase::Established;
            }
        }
        metrics::CONNECTIONS_ACTIVE.increment();
        if in_progress {
            self.arm(slot, poller::CONNECT);
        }
        Ok((slot, generation))
    }

    /// Writability on a connecting socket: the connect finished, one way
    /// or the other. `SO_ERROR` tells which.
    pub(crate) fn handle_connect_ready(&mut self, executor: &mut Executor, slot: u32) {
        self.poller.interest().clear(slot, poller::CONNECT);
        let Some(cs) = self.connections.get(slot) else {
            return;
        };
        let fd = cs.fd;
        if fd < 0 || cs.phase != ConnPhase::Connecting {
            return;
        }

        let mut so_error: libc::c_int = 0;
        let mut len = std::mem::size_of::<libc::c_int>() as libc::socklen_t;
        let rc = unsafe {
            libc::getsockopt(
                fd,
                libc::SOL_SOCKET,
                libc::SO_ERROR,
                &mut so_error as *mut _ as *mut libc::c_void,
                &mut len,
            )
        };
        if rc < 0 {
            let err = io::Error::last_os_error();
            self.fail_connection(executor, slot, err);
            return;
        }
        if so_error != 0 {
            self.fail_connection(executor, slot, io::Error::from_raw_os_error(so_error));
            return;
        }

        if let Some(cs) = self.connections.get_mut(slot) {
            cs.phase = ConnPhase::Established;
        }
        let _ = self.poller.sync(slot, fd);
        executor.wake_connect(slot);
    }

    // ── Teardown ─────────────────────────────────────────────────────

    /// Record a fatal I/O error: close the fd and fail every waiter, but
    /// keep the slot allocated so the owning future can take the real
    /// error before the slot is released.
    pub(crate) fn fail_connection(&mut self, executor: &mut Executor, slot: u32, err: io::Error) {
        let Some(cs) = self.connections.get_mut(slot) else {
            return;
        };
        if cs.fd >= 0 {
            let fd = cs.fd;
            cs.fd = -1;
            cs.recv_closed = true;
            cs.error = Some(err);
            let _ = self.poller.remove(fd);
            unsafe { libc::close(fd) };
        } else if cs.error.is_none() {
            cs.error = Some(err);
        }
        self.poller.interest().reset(slot);
        executor.wake_recv(slot);
        executor.wake_send(slot);
        executor.wake_connect(slot);
    }

    /// Close a connection and release its slot. Idempotent: a second call
    /// (or a call on an already-failed connection) finds nothing to do.
    /// Every pending waiter resolves exactly once, observing a released
    /// slot as a closed-channel error.
    pub(crate) fn close_connection(&mut self, executor: &mut Executor, conn_index: u32) {
        let Some(cs) = self.connections.get_mut(conn_index) else {
            return;
        };
        if cs.fd >= 0 {
            let fd = cs.fd;
            cs.fd = -1;
            let _ = self.poller.remove(fd);
            unsafe { libc::close(fd) };
        }
        self.poller.interest().reset(conn_index);
        self.accumulators.reset(conn_index);
        self.send_buffers.get_mut(conn_index).reset();
        executor.wake_recv(conn_index);
        executor.wake_send(conn_index);
        executor.wake_connect(conn_index);
        self.connections.release(conn_index);
        metrics::CONNECTIONS_CLOSED.increment();
        metrics::CONNECTIONS_ACTIVE.decrement();
    }

    /// Tear down every active connection (worker shutdown).
    pub(crate) fn run_shutdown(&mut self, executor: &mut Executor) {
        for slot in 0..self.connections.max_slots() {
            if self.connections.get(slot).is_some() {
                self.close_connection(executor, slot);
                executor.remove_connection(slot);
            }
        }
    }
}

fn set_tcp_nodelay(fd: RawFd) {
    let one: libc::c_int = 1;
    unsafe {
        libc::setsockopt(
            fd,
            libc::IPPROTO_TCP,
            libc::TCP_NODELAY,
            &one as *const _ as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sockaddr_round_trip_v4() {
        let addr: SocketAddr = "127.0.0.1:8080".parse().unwrap();
        let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
        let len = socket_addr_to_sockaddr(addr, &mut storage);
        assert_eq!(sockaddr_to_socket_addr(&storage, len), Some(addr));
    }

    #[test]
    fn sockaddr_round_trip_v6() {
        let addr: SocketAddr = "[::1]:9090".parse().unwrap();
        let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
        let len = socket_addr_to_sockaddr(addr, &mut storage);
        assert_eq!(sockaddr_to_socket_addr(&storage, len), Some(addr));
    }

    #[test]
    fn sockaddr_unknown_family() {
        let storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
        assert_eq!(sockaddr_to_socket_addr(&storage, 0), None);
    }
}
