//! [`PoolBackend`]: a [`scg_backend::Backend`] that executes prepared
//! submissions synchronously on a fixed pool of worker threads, for use on
//! kernels or storage stacks where `io_uring` isn't available or doesn't
//! accelerate the syscall in question.
//!
//! One worker thread per pinned core, a submission queue and a completion
//! queue, and a sentinel entry id used to signal worker shutdown —
//! structurally similar to a `FixedPool` built on
//! `crossbeam_queue::ArrayQueue` work/result queues, one `std::thread` per
//! worker, `thread::park_timeout` backoff while a queue is empty.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crossbeam_queue::ArrayQueue;

use scg_backend::{Backend, BackendError, EntryId, SubmissionSpec};

enum WorkItem {
    Run { id: u64, spec: SubmissionSpec },
    Shutdown,
}

struct Completion {
    id: u64,
    rc: i64,
}

struct PoolInner {
    work_queue: ArrayQueue<WorkItem>,
    result_queue: ArrayQueue<Completion>,
    active: AtomicUsize,
}

pub struct PoolBackend {
    inner: Arc<PoolInner>,
    workers: Vec<thread::JoinHandle<()>>,
    nthreads: usize,
    prepared: Vec<(u64, SubmissionSpec)>,
    num_in_flight: usize,
}

impl PoolBackend {
    /// Spawn `nthreads` workers, each with its own blocking-call budget of
    /// `queue_depth` in-flight submissions. `pin_cores` requests one worker
    /// pinned per core by affinity; skipped (with a log warning, not a hard
    /// failure) if the host reports fewer logical CPUs than `nthreads`,
    /// since that's an environment-sizing mismatch rather than a programming
    /// error worth crashing the process over.
    pub fn new(nthreads: usize, queue_depth: usize, pin_cores: bool) -> Self {
        assert!(nthreads > 0, "worker pool needs at least one thread");
        let inner = Arc::new(PoolInner {
            work_queue: ArrayQueue::new(queue_depth.max(nthreads)),
            result_queue: ArrayQueue::new(queue_depth.max(nthreads)),
            active: AtomicUsize::new(0),
        });

        let ncores = available_cores();
        if pin_cores && nthreads > ncores {
            log::warn!(
                "requested {nthreads} worker threads but only {ncores} logical cores are available; skipping core pinning"
            );
        }

        let mut workers = Vec::with_capacity(nthreads);
        for worker_id in 0..nthreads {
            let inner = Arc::clone(&inner);
            let do_pin = pin_cores && nthreads <= ncores;
            let handle = thread::Builder::new()
                .name(format!("scg-pool-worker-{worker_id}"))
                .spawn(move || worker_loop(inner, worker_id, do_pin))
                .expect("failed to spawn worker thread");
            workers.push(handle);
        }

        PoolBackend {
            inner,
            workers,
            nthreads,
            prepared: Vec::new(),
            num_in_flight: 0,
        }
    }
}

impl Drop for PoolBackend {
    fn drop(&mut self) {
        for _ in 0..self.nthreads {
            while self.inner.work_queue.push(WorkItem::Shutdown).is_err() {
                thread::yield_now();
            }
        }
        for handle in self.workers.drain(..) {
            let _ = handle.join();
        }
    }
}

fn available_cores() -> usize {
    thread::available_parallelism().map(|n| n.get()).unwrap_or(1)
}

fn worker_loop(inner: Arc<PoolInner>, worker_id: usize, pin_core: bool) {
    if pin_core {
        pin_to_core(worker_id);
    }
    loop {
        match inner.work_queue.pop() {
            Some(WorkItem::Shutdown) => return,
            Some(WorkItem::Run { id, spec }) => {
                inner.active.fetch_add(1, Ordering::Relaxed);
                let rc = execute(&spec);
                inner.active.fetch_sub(1, Ordering::Relaxed);
                let mut completion = Completion { id, rc };
                while let Err(back) = inner.result_queue.push(completion) {
                    completion = back;
                    thread::yield_now();
                }
            }
            None => thread::park_timeout(Duration::from_micros(200)),
        }
    }
}

#[cfg(target_os = "linux")]
fn pin_to_core(core_id: usize) {
    unsafe {
        let mut set: libc::cpu_set_t = std::mem::zeroed();
        libc::CPU_SET(core_id, &mut set);
        libc::sched_setaffinity(0, std::mem::size_of::<libc::cpu_set_t>(), &set);
    }
}

#[cfg(not(target_os = "linux"))]
fn pin_to_core(_core_id: usize) {}

const EMPTY_PATH: &[u8] = b"\0";

/// Run one syscall to completion on the calling (worker) thread.
fn execute(spec: &SubmissionSpec) -> i64 {
    unsafe {
        match spec {
            SubmissionSpec::Open { pathname, flags, mode } => {
                libc::open(pathname.as_ptr(), *flags, *mode as libc::c_uint) as i64
            }
            SubmissionSpec::Openat { dirfd, pathname, flags, mode } => {
                libc::openat(*dirfd, pathname.as_ptr(), *flags, *mode as libc::c_uint) as i64
            }
            SubmissionSpec::Close { fd } => libc::close(*fd) as i64,
            SubmissionSpec::Pread { fd, buf, count, offset } => {
                libc::pread(*fd, buf.as_ptr() as *mut libc::c_void, *count, *offset) as i64
            }
            SubmissionSpec::Pwrite { fd, buf, count, offset } => {
                libc::pwrite(*fd, buf.as_ptr() as *const libc::c_void, *count, *offset) as i64
            }
            SubmissionSpec::Lseek { fd, offset, whence } => libc::lseek(*fd, *offset, *whence) as i64,
            SubmissionSpec::Fstat { fd, statx_buf } => libc::statx(
                *fd,
                EMPTY_PATH.as_ptr() as *const libc::c_char,
                libc::AT_EMPTY_PATH,
                libc::STATX_ALL,
                statx_buf.as_ptr(),
            ) as i64,
            SubmissionSpec::Fstatat { dirfd, pathname, flags, statx_buf } => libc::statx(
                *dirfd,
                pathname.as_ptr(),
                *flags,
                libc::STATX_ALL,
                statx_buf.as_ptr(),
            ) as i64,
        }
    }
}

impl Backend for PoolBackend {
    fn prepare(&mut self, id: EntryId, spec: SubmissionSpec, _link_next: bool) -> Result<(), BackendError> {
        // The pool has no ordering primitive between independent worker
        // threads, so the chain-link hint is meaningful only to the ring
        // backend (see `scg_backend::Backend::prepare`'s doc comment).
        self.prepared.push((id.raw(), spec));
        Ok(())
    }

    fn submit_all(&mut self) -> Result<usize, BackendError> {
        let batch = std::mem::take(&mut self.prepared);
        let num = batch.len();
        for (id, spec) in batch {
            self.inner
                .work_queue
                .push(WorkItem::Run { id, spec })
                .map_err(|_| BackendError::SubmitFailed {
                    reason: "worker pool submission queue is full".into(),
                })?;
            self.num_in_flight += 1;
        }
        Ok(num)
    }

    fn complete_one(&mut self) -> Result<(EntryId, i64), BackendError> {
        loop {
            if let Some(completion) = self.inner.result_queue.pop() {
                self.num_in_flight -= 1;
                return Ok((
                    EntryId::from_raw(completion.id, scg_backend::DEFAULT_EPOCH_BITS),
                    completion.rc,
                ));
            }
            thread::park_timeout(Duration::from_micros(200));
        }
    }

    fn clean_up(&mut self) -> Result<(), BackendError> {
        self.prepared.clear();
        while self.num_in_flight > 0 {
            self.complete_one()?;
        }
        Ok(())
    }

    fn num_prepared(&self) -> usize {
        self.prepared.len()
    }

    fn num_in_flight(&self) -> usize {
        self.num_in_flight
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ffi::CString;
    use scg_backend::SendPtr;

    #[test]
    fn open_close_round_trip_through_the_pool() {
        let mut backend = PoolBackend::new(2, 16, false);

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("scg-pool-test.txt");
        let pathname = CString::new(path.to_str().unwrap()).unwrap();

        let open_id = EntryId::new(1, 0).unwrap();
        backend
            .prepare(
                open_id,
                SubmissionSpec::Open {
                    pathname,
                    flags: libc::O_CREAT | libc::O_RDWR,
                    mode: 0o644,
                },
                false,
            )
            .unwrap();
        backend.submit_all().unwrap();
        let (id, rc) = backend.complete_one().unwrap();
        assert_eq!(id.raw(), open_id.raw());
        assert!(rc >= 0, "open failed: {rc}");

        let fd = rc as i32;
        let mut value: u8 = 7;
        let buf = SendPtr(&mut value as *mut u8);
        let write_id = EntryId::new(2, 0).unwrap();
        backend
            .prepare(
                write_id,
                SubmissionSpec::Pwrite { fd, buf, count: 1, offset: 0 },
                false,
            )
            .unwrap();
        backend.submit_all().unwrap();
        let (id, rc) = backend.complete_one().unwrap();
        assert_eq!(id.raw(), write_id.raw());
        assert_eq!(rc, 1);

        let close_id = EntryId::new(3, 0).unwrap();
        backend.prepare(close_id, SubmissionSpec::Close { fd }, false).unwrap();
        backend.submit_all().unwrap();
        let (id, rc) = backend.complete_one().unwrap();
        assert_eq!(id.raw(), close_id.raw());
        assert_eq!(rc, 0);
    }

    #[test]
    fn clean_up_drains_without_blocking_forever_when_idle() {
        let mut backend = PoolBackend::new(1, 4, false);
        backend.clean_up().unwrap();
        assert_eq!(backend.num_prepared(), 0);
        assert_eq!(backend.num_in_flight(), 0);
    }
}
