use std::{
    fmt,
    marker::PhantomData,
    ops::{Deref, DerefMut},
    ptr::NonNull,
    sync::Arc,
};

use tracing::{debug, warn};

use crate::{
    config::Config,
    error::{LockError, SegmentError},
    lock::{FileLock, LockGuard},
    log_sink::LogSink,
    shared_mem::{self, Origin, SharedMem},
    spawner::WorkerKind,
};

/// The record every cooperating process maps. Explicit widths and an explicit
/// tail keep the layout identical for every build that shares a segment.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SharedState {
    counter: i64,
    copy1_busy: u8,
    copy2_busy: u8,
    _reserved: [u8; 6],
}

const _: () = assert!(size_of::<SharedState>() == 16);
const _: () = assert!(align_of::<SharedState>() == 8);

impl SharedState {
    pub const INITIAL: SharedState = SharedState {
        counter: 0,
        copy1_busy: 0,
        copy2_busy: 0,
        _reserved: [0; 6],
    };

    pub fn counter(&self) -> i64 {
        self.counter
    }

    pub fn set_counter(&mut self, value: i64) {
        self.counter = value;
    }

    /// Applies `op` to the counter and returns the new value.
    pub fn update(&mut self, op: impl FnOnce(i64) -> i64) -> i64 {
        self.counter = op(self.counter);
        self.counter
    }

    pub fn is_busy(&self, kind: WorkerKind) -> bool {
        *self.flag(kind) != 0
    }

    pub fn any_busy(&self) -> bool {
        WorkerKind::ALL.iter().any(|&kind| self.is_busy(kind))
    }

    pub fn set_busy(&mut self, kind: WorkerKind, busy: bool) {
        *self.flag_mut(kind) = u8::from(busy);
    }

    fn flag(&self, kind: WorkerKind) -> &u8 {
        match kind {
            WorkerKind::Copy1 => &self.copy1_busy,
            WorkerKind::Copy2 => &self.copy2_busy,
        }
    }

    fn flag_mut(&mut self, kind: WorkerKind) -> &mut u8 {
        match kind {
            WorkerKind::Copy1 => &mut self.copy1_busy,
            WorkerKind::Copy2 => &mut self.copy2_busy,
        }
    }
}

/// Derived from how the process came to attach; never stored in the segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Master,
    Slave,
    Worker(WorkerKind),
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Master => f.write_str("MASTER"),
            Role::Slave => f.write_str("SLAVE"),
            Role::Worker(kind) => write!(f, "{}", kind.tag()),
        }
    }
}

/// A mapping of the named [`SharedState`] segment.
pub struct Segment {
    name: String,
    memory: SharedMem,
    initializer: bool,
}

impl Segment {
    /// Creates the segment, or maps it if another process created it first.
    /// Exactly one racing attacher observes [`Self::is_initializer`].
    ///
    /// The guard proves the caller holds the global lock, so a late attacher
    /// can never observe a segment that is not yet sized and initialized.
    pub fn attach(name: &str, _held: &LockGuard<'_>) -> Result<Self, SegmentError> {
        let (memory, origin) = SharedMem::create_or_open(name, size_of::<SharedState>())?;
        let segment = Self::from_memory(name, memory, origin == Origin::Created);
        if segment.initializer {
            let state = segment.state_ptr().as_ptr();
            unsafe {
                state.cast::<u8>().write_bytes(0, size_of::<SharedState>());
                state.write(SharedState::INITIAL);
            }
            debug!(segment = name, "created and initialized segment");
        } else {
            debug!(segment = name, "attached to existing segment");
        }
        Ok(segment)
    }

    /// Maps an existing segment and never creates one.
    pub fn open(name: &str, _held: &LockGuard<'_>) -> Result<Self, SegmentError> {
        let memory = SharedMem::open_existing(name, size_of::<SharedState>())?;
        Ok(Self::from_memory(name, memory, false))
    }

    fn from_memory(name: &str, memory: SharedMem, initializer: bool) -> Self {
        debug_assert!(memory.len() >= size_of::<SharedState>());
        debug_assert!(memory.as_ptr().align_offset(align_of::<SharedState>()) == 0);
        Self {
            name: name.to_string(),
            memory,
            initializer,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_initializer(&self) -> bool {
        self.initializer
    }

    /// Unmaps the segment from this process. The named object survives.
    pub fn detach(self) {
        debug!(segment = %self.name, "detached");
    }

    /// Removes the named object so that no later attach can find it.
    pub fn destroy(name: &str) -> Result<(), SegmentError> {
        shared_mem::destroy(name)
    }

    fn state_ptr(&self) -> NonNull<SharedState> {
        match NonNull::new(self.memory.as_ptr().cast()) {
            Some(ptr) => ptr,
            None => unreachable!("mmap never returns null"),
        }
    }
}

/// One thread's view of the coordination resources: the shared segment, a
/// private handle on the global lock and the log sink.
///
/// Threads never share a `Session`; they call [`Session::handle`] to get one
/// with its own lock handle.
pub struct Session {
    segment: Arc<Segment>,
    lock: FileLock,
    sink: LogSink,
    role: Role,
}

impl Session {
    /// Attach as a top-level instance. The creator of the segment becomes the
    /// master, everyone else a slave.
    pub fn start(config: &Config) -> Result<Self, SegmentError> {
        let mut lock = FileLock::open(&config.lock_path)?;
        let segment = {
            let held = lock.acquire()?;
            Segment::attach(&config.shm_name, &held)?
        };
        let role = match segment.is_initializer() {
            true => Role::Master,
            false => Role::Slave,
        };
        Ok(Self {
            segment: Arc::new(segment),
            lock,
            sink: LogSink::new(&config.log_path),
            role,
        })
    }

    /// Attach as a spawned worker. Fails if the segment does not exist.
    pub fn join(config: &Config, kind: WorkerKind) -> Result<Self, SegmentError> {
        let mut lock = FileLock::open(&config.lock_path)?;
        let segment = {
            let held = lock.acquire()?;
            Segment::open(&config.shm_name, &held)?
        };
        Ok(Self {
            segment: Arc::new(segment),
            lock,
            sink: LogSink::new(&config.log_path),
            role: Role::Worker(kind),
        })
    }

    /// A second session on the same mapping with its own lock handle.
    pub fn handle(&self) -> Session {
        Session {
            segment: Arc::clone(&self.segment),
            lock: FileLock::new(self.lock.path()),
            sink: self.sink.clone(),
            role: self.role,
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn is_initializer(&self) -> bool {
        self.segment.is_initializer()
    }

    pub fn segment_name(&self) -> &str {
        self.segment.name()
    }

    /// Blocks until the global lock is held and exposes the shared record for
    /// as long as the returned guard lives.
    pub fn lock(&mut self) -> Result<StateGuard<'_>, LockError> {
        let held = self.lock.acquire()?;
        Ok(StateGuard {
            _held: held,
            state: self.segment.state_ptr(),
            _segment: PhantomData,
        })
    }

    /// Runs `f` as one critical section.
    pub fn with_state<R>(&mut self, f: impl FnOnce(&mut SharedState) -> R) -> Result<R, LockError> {
        let mut guard = self.lock()?;
        Ok(f(&mut *guard))
    }

    /// Appends one record to the shared log. Failures are reported on stderr
    /// and the record is dropped.
    pub fn log(&mut self, line: &str) {
        if let Err(e) = self.sink.append(&mut self.lock, line) {
            warn!(error = %e, record = line, "log record discarded");
        }
    }

    /// Detaches, and if this process created the segment also destroys it.
    pub fn close(self) -> Result<(), SegmentError> {
        let Session { segment, lock, .. } = self;
        let destroy = segment.is_initializer().then(|| segment.name().to_string());
        match Arc::try_unwrap(segment) {
            Ok(segment) => segment.detach(),
            Err(shared) => debug!(
                segment = shared.name(),
                "other handles still map the segment"
            ),
        }
        drop(lock);
        if let Some(name) = destroy {
            Segment::destroy(&name)?;
            debug!(segment = %name, "destroyed segment");
        }
        Ok(())
    }
}

/// Exclusive access to the shared record, released on drop.
pub struct StateGuard<'a> {
    _held: LockGuard<'a>,
    state: NonNull<SharedState>,
    _segment: PhantomData<&'a mut SharedState>,
}

impl fmt::Debug for StateGuard<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        <SharedState as fmt::Debug>::fmt(self, f)
    }
}

impl Deref for StateGuard<'_> {
    type Target = SharedState;

    fn deref(&self) -> &Self::Target {
        unsafe { self.state.as_ref() }
    }
}

impl DerefMut for StateGuard<'_> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        unsafe { self.state.as_mut() }
    }
}
