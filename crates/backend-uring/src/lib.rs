//! [`UringBackend`]: a [`scg_backend::Backend`] that dispatches prepared
//! submissions through a kernel `io_uring` instance.
//!
//! One ring per graph, a prepared list built up by repeated `prepare` calls
//! and flushed as one batch by `submit_all`, and an on-the-fly set
//! harvested one entry at a time by `complete_one`.

use std::ffi::CString;
use std::io;

use hashbrown::HashMap;
use io_uring::{opcode, squeue, types, IoUring};

use scg_backend::{Backend, BackendError, EntryId, SubmissionSpec};

/// One submission still waiting for its `io_uring_prep_xxx()` call to run
/// (happens at `submit_all` time, not `prepare` time — see
/// [`UringBackend::submit_all`]).
struct Pending {
    id: EntryId,
    spec: SubmissionSpec,
    link_next: bool,
}

pub struct UringBackend {
    ring: IoUring,
    sqe_async_flag: bool,
    prepared: Vec<Pending>,
    /// Entries submitted to the kernel but not yet completed. Holds the
    /// `SubmissionSpec` itself (not just its id) so that any pathname
    /// buffer it owns (`Open`/`Openat`/`Fstatat`) stays alive for as long as
    /// the kernel might still be reading it, not merely until `submit()`
    /// returns.
    in_flight: HashMap<u64, SubmissionSpec>,
}

impl UringBackend {
    /// `sq_length` is the ring's submission queue depth; `sqe_async_flag`
    /// forces `IOSQE_ASYNC` on every submitted entry, trading lower
    /// per-call overhead for always going through a kernel worker thread.
    pub fn new(sq_length: u32, sqe_async_flag: bool) -> io::Result<Self> {
        let ring = IoUring::new(sq_length)?;
        Ok(UringBackend {
            ring,
            sqe_async_flag,
            prepared: Vec::new(),
            in_flight: HashMap::new(),
        })
    }

    /// Build the `io_uring` submission-queue entry for one spec. Borrows
    /// nothing from `self` besides the async/link flags so it can run while
    /// `self.ring`'s submission queue is separately borrowed mutably.
    fn build_entry(id: EntryId, spec: &SubmissionSpec, sqe_async_flag: bool, link_next: bool) -> squeue::Entry {
        let entry = match spec {
            SubmissionSpec::Open { pathname, flags, mode } => {
                opcode::OpenAt::new(types::Fd(libc::AT_FDCWD), pathname.as_ptr())
                    .flags(*flags)
                    .mode(*mode)
                    .build()
            }
            SubmissionSpec::Openat { dirfd, pathname, flags, mode } => {
                opcode::OpenAt::new(types::Fd(*dirfd), pathname.as_ptr())
                    .flags(*flags)
                    .mode(*mode)
                    .build()
            }
            SubmissionSpec::Close { fd } => opcode::Close::new(types::Fd(*fd)).build(),
            SubmissionSpec::Pread { fd, buf, count, offset } => {
                opcode::Read::new(types::Fd(*fd), buf.as_ptr(), *count as u32)
                    .offset(*offset as u64)
                    .build()
            }
            SubmissionSpec::Pwrite { fd, buf, count, offset } => {
                opcode::Write::new(types::Fd(*fd), buf.as_ptr() as *const u8, *count as u32)
                    .offset(*offset as u64)
                    .build()
            }
            SubmissionSpec::Lseek { .. } => {
                unreachable!("lseek is never asynchronously pre-issued, see SubmissionSpec::is_asyncable")
            }
            SubmissionSpec::Fstat { fd, statx_buf } => {
                // AT_EMPTY_PATH against an already-open fd, matching plain
                // fstat(2) semantics through statx(2).
                opcode::Statx::new(types::Fd(*fd), EMPTY_PATH.as_ptr(), statx_buf.as_ptr() as *mut types::statx)
                    .flags(libc::AT_EMPTY_PATH)
                    .mask(libc::STATX_ALL)
                    .build()
            }
            SubmissionSpec::Fstatat { dirfd, pathname, flags, statx_buf } => {
                opcode::Statx::new(types::Fd(*dirfd), pathname.as_ptr(), statx_buf.as_ptr() as *mut types::statx)
                    .flags(*flags)
                    .mask(libc::STATX_ALL)
                    .build()
            }
        };

        let mut flags = squeue::Flags::empty();
        if sqe_async_flag {
            flags |= squeue::Flags::ASYNC;
        }
        // Plain IOSQE_IO_LINK only chains successful entries; a failed link
        // target silently drops the rest of the chain. IOSQE_IO_HARDLINK
        // keeps chaining regardless of each entry's result.
        if link_next {
            flags |= squeue::Flags::IO_HARDLINK;
        }
        entry.user_data(id.raw()).flags(flags)
    }
}

const EMPTY_PATH: &[u8] = b"\0";

impl Backend for UringBackend {
    fn prepare(&mut self, id: EntryId, spec: SubmissionSpec, link_next: bool) -> Result<(), BackendError> {
        self.prepared.push(Pending { id, spec, link_next });
        Ok(())
    }

    fn submit_all(&mut self) -> Result<usize, BackendError> {
        let pending = std::mem::take(&mut self.prepared);
        let num_prepared = pending.len();
        for p in &pending {
            let entry = Self::build_entry(p.id, &p.spec, self.sqe_async_flag, p.link_next);
            // SAFETY: every buffer/pathname referenced by `entry` is owned
            // by `p.spec`, which we move into `self.in_flight` below and
            // keep until the matching completion is harvested.
            unsafe {
                self.ring
                    .submission()
                    .push(&entry)
                    .map_err(|_| BackendError::SubmitFailed { reason: "submission queue full".into() })?;
            }
        }
        for p in pending {
            self.in_flight.insert(p.id.raw(), p.spec);
        }

        let mut num_submitted = 0;
        while num_submitted < num_prepared {
            let n = self.ring.submit().map_err(|e| BackendError::SubmitFailed { reason: e.to_string() })?;
            num_submitted += n;
        }
        Ok(num_submitted)
    }

    fn complete_one(&mut self) -> Result<(EntryId, i64), BackendError> {
        self.ring
            .submit_and_wait(1)
            .map_err(|e| BackendError::WaitFailed { reason: e.to_string() })?;
        let cqe = self
            .ring
            .completion()
            .next()
            .ok_or_else(|| BackendError::WaitFailed { reason: "no completion queue entry after wait".into() })?;
        let raw = cqe.user_data();
        let rc = cqe.result() as i64;
        self.in_flight.remove(&raw);
        Ok((EntryId::from_raw(raw, scg_backend::DEFAULT_EPOCH_BITS), rc))
    }

    fn clean_up(&mut self) -> Result<(), BackendError> {
        self.prepared.clear();
        while !self.in_flight.is_empty() {
            self.complete_one()?;
        }
        Ok(())
    }

    fn num_prepared(&self) -> usize {
        self.prepared.len()
    }

    fn num_in_flight(&self) -> usize {
        self.in_flight.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_open_close_through_a_real_ring() {
        let mut backend = match UringBackend::new(8, false) {
            Ok(b) => b,
            Err(_) => return, // io_uring unavailable in this sandbox/kernel
        };

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("scg-uring-test.txt");
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
        assert_eq!(backend.num_prepared(), 1);
        let submitted = backend.submit_all().unwrap();
        assert_eq!(submitted, 1);
        assert_eq!(backend.num_in_flight(), 1);

        let (id, rc) = backend.complete_one().unwrap();
        assert_eq!(id.raw(), open_id.raw());
        assert!(rc >= 0, "open failed: {rc}");
        assert_eq!(backend.num_in_flight(), 0);

        let fd = rc as i32;
        let close_id = EntryId::new(2, 0).unwrap();
        backend.prepare(close_id, SubmissionSpec::Close { fd }, false).unwrap();
        backend.submit_all().unwrap();
        let (id, rc) = backend.complete_one().unwrap();
        assert_eq!(id.raw(), close_id.raw());
        assert_eq!(rc, 0);
    }

    #[test]
    fn clean_up_drains_without_erroring_when_idle() {
        let mut backend = match UringBackend::new(4, false) {
            Ok(b) => b,
            Err(_) => return,
        };
        backend.clean_up().unwrap();
        assert_eq!(backend.num_prepared(), 0);
        assert_eq!(backend.num_in_flight(), 0);
    }
}
