//! Worker lifecycle: listener setup, thread spawning, shutdown.
//!
//! Every worker is self-contained. It binds its own `SO_REUSEPORT`
//! listener, owns its own poller, and never hands a connection to
//! another thread; the kernel spreads accepts across the listeners.

use std::io;
use std::net::SocketAddr;
use std::os::fd::RawFd;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;

use crate::config::Config;
use crate::driver::Driver;
use crate::error::Error;
use crate::event_loop::EventLoop;
use crate::poller::{Poller, RegistrationQueue};
use crate::runtime::handler::ConnectionHandler;

type WorkerHandles = Vec<thread::JoinHandle<Result<(), Error>>>;

/// Handle returned by `launch()`; signals every worker to stop.
pub struct ShutdownHandle {
    stop: Arc<AtomicBool>,
    wake_handles: Vec<RegistrationQueue>,
}

impl ShutdownHandle {
    /// Begin graceful shutdown: workers stop accepting, close their
    /// connections (dropping the tasks), and return `Ok(())` from their
    /// event loops.
    pub fn shutdown(&self) {
        self.stop.store(true, Ordering::Release);
        // A worker parked in epoll_wait needs a nudge to see the flag.
        for handle in &self.wake_handles {
            handle.wake();
        }
    }
}

/// Entry point for standing up a worker set.
///
/// [`bind`](Self::bind) is optional: without it no listeners exist and
/// the workers run client-only, dialing out from
/// [`ConnectionHandler::on_start`].
pub struct TidelineBuilder {
    config: Config,
    bind_addr: Option<SocketAddr>,
}

impl TidelineBuilder {
    pub fn new(config: Config) -> Self {
        TidelineBuilder {
            config,
            bind_addr: None,
        }
    }

    /// Listen on `addr`. Every worker binds its own socket to it.
    pub fn bind(mut self, addr: SocketAddr) -> Self {
        self.bind_addr = Some(addr);
        self
    }

    /// Spawn the worker threads, each running `H`'s event loop, and
    /// hand back the shutdown handle plus one join handle per worker.
    pub fn launch<H: ConnectionHandler>(self) -> Result<(ShutdownHandle, WorkerHandles), Error> {
        let workers = match self.config.worker.threads {
            0 => online_cpus(),
            n => n,
        };

        // Every connection pins an fd; per worker add the epoll fd, the
        // eventfd, the listener, and slack, plus a global allowance for
        // stdio and whatever else the process holds.
        let required =
            self.config.max_connections as u64 * workers as u64 + 8 * workers as u64 + 64;
        raise_nofile_limit(required)?;

        let stop = Arc::new(AtomicBool::new(false));

        // All pollers and listeners come up before any thread starts,
        // so setup failures surface from launch() itself.
        let mut pollers = Vec::with_capacity(workers);
        let mut wake_handles = Vec::with_capacity(workers);
        let mut listen_fds = Vec::with_capacity(workers);
        let setup = (|| -> Result<(), Error> {
            for _ in 0..workers {
                let poller = Poller::new(self.config.max_connections, self.config.max_events)?;
                wake_handles.push(poller.handle());
                pollers.push(poller);
                if let Some(addr) = self.bind_addr {
                    listen_fds.push(bind_reuseport_listener(addr, self.config.backlog)?);
                }
            }
            Ok(())
        })();
        if let Err(e) = setup {
            for &fd in &listen_fds {
                unsafe { libc::close(fd) };
            }
            return Err(e);
        }

        let mut handles = Vec::with_capacity(workers);
        for (worker_id, poller) in pollers.into_iter().enumerate() {
            let config = self.config.clone();
            let listen_fd = listen_fds.get(worker_id).copied();
            let stop = stop.clone();

            let handle = thread::Builder::new()
                .name(format!("tideline-worker-{worker_id}"))
                .spawn(move || {
                    if config.worker.pin_to_core {
                        pin_thread(config.worker.core_offset + worker_id)?;
                    }
                    crate::metrics::bind_worker_shard(worker_id);

                    let handler = H::create_for_worker(worker_id);
                    let driver = Driver::new(&config, poller, listen_fd, stop);
                    let result = EventLoop::new(&config, handler, driver).run();
                    if let Some(fd) = listen_fd {
                        unsafe { libc::close(fd) };
                    }
                    result
                })
                .map_err(Error::Io)?;
            handles.push(handle);
        }

        Ok((ShutdownHandle { stop, wake_handles }, handles))
    }
}

/// Lift the soft RLIMIT_NOFILE to `required` if it is below, as far as
/// the hard limit allows.
fn raise_nofile_limit(required: u64) -> Result<(), Error> {
    let mut rlim: libc::rlimit = unsafe { std::mem::zeroed() };
    if unsafe { libc::getrlimit(libc::RLIMIT_NOFILE, &mut rlim) } != 0 {
        return Err(Error::Io(io::Error::last_os_error()));
    }
    if rlim.rlim_cur >= required {
        return Ok(());
    }

    let hard = rlim.rlim_max;
    if hard < required && hard != libc::RLIM_INFINITY {
        return Err(Error::ResourceLimit(format!(
            "RLIMIT_NOFILE too low: need {required} but hard limit is {hard} \
             (soft: {}). Raise it with: ulimit -n {required}",
            rlim.rlim_cur
        )));
    }

    rlim.rlim_cur = if hard == libc::RLIM_INFINITY {
        required
    } else {
        required.min(hard)
    };
    if unsafe { libc::setrlimit(libc::RLIMIT_NOFILE, &rlim) } != 0 {
        return Err(Error::Io(io::Error::last_os_error()));
    }
    Ok(())
}

/// Pin the calling thread to one CPU.
fn pin_thread(core: usize) -> Result<(), Error> {
    unsafe {
        let mut set: libc::cpu_set_t = std::mem::zeroed();
        libc::CPU_ZERO(&mut set);
        libc::CPU_SET(core, &mut set);
        if libc::sched_setaffinity(0, std::mem::size_of::<libc::cpu_set_t>(), &set) != 0 {
            return Err(Error::Io(io::Error::last_os_error()));
        }
    }
    Ok(())
}

fn enable_sockopt(fd: RawFd, opt: libc::c_int) {
    let one: libc::c_int = 1;
    unsafe {
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            opt,
            &one as *const _ as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        );
    }
}

fn close_with_errno(fd: RawFd) -> Error {
    let err = io::Error::last_os_error();
    unsafe { libc::close(fd) };
    Error::Io(err)
}

/// Nonblocking listener for one worker. All workers bind the same
/// address; `SO_REUSEPORT` makes the kernel balance accepts between
/// them.
fn bind_reuseport_listener(addr: SocketAddr, backlog: i32) -> Result<RawFd, Error> {
    let domain = if addr.is_ipv4() {
        libc::AF_INET
    } else {
        libc::AF_INET6
    };
    let fd = unsafe {
        libc::socket(
            domain,
            libc::SOCK_STREAM | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
            0,
        )
    };
    if fd < 0 {
        return Err(Error::Io(io::Error::last_os_error()));
    }
    enable_sockopt(fd, libc::SO_REUSEADDR);
    enable_sockopt(fd, libc::SO_REUSEPORT);

    let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
    let addr_len = crate::driver::socket_addr_to_sockaddr(addr, &mut storage);
    if unsafe { libc::bind(fd, &storage as *const _ as *const libc::sockaddr, addr_len) } < 0 {
        return Err(close_with_errno(fd));
    }
    if unsafe { libc::listen(fd, backlog) } < 0 {
        return Err(close_with_errno(fd));
    }
    Ok(fd)
}

fn online_cpus() -> usize {
    match unsafe { libc::sysconf(libc::_SC_NPROCESSORS_ONLN) } {
        n if n < 1 => 1,
        n => n as usize,
    }
}
