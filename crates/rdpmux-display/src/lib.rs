//! Hypervisor-side display multiplexing.
//!
//! Receives framebuffer-change callbacks from the embedding emulator,
//! coalesces them into dirty rectangles, copies changed strips into a
//! shared-memory region, and hands off serialized update records to an
//! out-of-process consumer over a local identity-tagged transport. Also
//! receives keyboard and mouse events back from that consumer and
//! dispatches them to callbacks registered by the host.
//!
//! The library owns no process-wide state: [`init`] returns a [`Handle`]
//! (`Arc<DisplayInner>`) that the host threads forward; every other entry
//! point in this crate takes that handle explicitly.

mod dbus;
pub mod ffi;
mod error;
mod threads;
mod tracker;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;

use rdpmux_codec::UpdateRecord;
use rdpmux_queue::MessageQueue;
use rdpmux_shm::SharedFrame;
use rdpmux_transport::Transport;

pub use dbus::{get_socket_path, PROTOCOL_VERSION};
pub use error::{ConnectError, DiscoveryError, InitError, SwitchError};
pub use tracker::Rect;

/// An immutable snapshot of the emulator's current backing buffer.
///
/// Holds a raw pointer the emulator guarantees is valid for the duration of
/// one [`display_switch`] or [`display_refresh`] call; it is never retained
/// past that call.
#[derive(Debug, Clone, Copy)]
pub struct FrameSurface {
    pub data: *const u8,
    pub len: usize,
    pub width: i32,
    pub height: i32,
    pub format: u32,
    pub stride: i32,
    pub bpp: i32,
}

// SAFETY: `FrameSurface` is read-only and is only ever dereferenced while
// the caller (the emulator thread, via `display_switch`/`display_refresh`)
// still owns the backing buffer and while the frame lock serializes access
// against the refresh engine. It is never stored past the call that
// receives it, so no cross-thread lifetime extension occurs.
unsafe impl Send for FrameSurface {}

struct FrameLockState {
    out: Option<Rect>,
    ack_pending: bool,
    surface: Option<FrameSurface>,
}

type KbCallback = Box<dyn Fn(u32, u32) + Send + Sync>;
type MouseCallback = Box<dyn Fn(i32, i32, u32) + Send + Sync>;

struct Callbacks {
    kb: KbCallback,
    mouse: MouseCallback,
}

/// The library's per-session state. Always accessed through a [`Handle`].
pub struct DisplayInner {
    identity: String,
    vm_id: Mutex<Option<i32>>,
    shm: Mutex<Option<SharedFrame>>,
    dirty: Mutex<tracker::DirtyTracker>,
    frame_lock: Mutex<FrameLockState>,
    update_cond: Condvar,
    ack_cond: Condvar,
    outgoing: MessageQueue<UpdateRecord>,
    transport: Mutex<Option<Box<dyn Transport>>>,
    callbacks: Mutex<Option<Callbacks>>,
    stop: AtomicBool,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

/// A handle to an initialized session. Cloning shares the same underlying
/// state; there is no process-wide singleton.
pub type Handle = Arc<DisplayInner>;

const POLL_TICK: std::time::Duration = std::time::Duration::from_millis(5);

/// Validate `uuid` and allocate a new session.
///
/// # Errors
///
/// Returns [`InitError::MalformedUuid`] if `uuid` is not exactly 36 bytes.
pub fn init(uuid: &str) -> Result<Handle, InitError> {
    if uuid.len() != 36 {
        return Err(InitError::MalformedUuid(uuid.len()));
    }

    tracing::info!(uuid, "Display session initialized");

    Ok(Arc::new(DisplayInner {
        identity: uuid.to_string(),
        vm_id: Mutex::new(None),
        shm: Mutex::new(None),
        dirty: Mutex::new(tracker::DirtyTracker::new()),
        frame_lock: Mutex::new(FrameLockState { out: None, ack_pending: false, surface: None }),
        update_cond: Condvar::new(),
        ack_cond: Condvar::new(),
        outgoing: MessageQueue::new(),
        transport: Mutex::new(None),
        callbacks: Mutex::new(None),
        stop: AtomicBool::new(false),
        threads: Mutex::new(Vec::new()),
    }))
}

/// Store the keyboard and mouse callbacks. Must be called before the I/O
/// threads are started — they read the callbacks without further locking
/// once the session is running.
pub fn register_callbacks(
    handle: &Handle,
    kb: impl Fn(u32, u32) + Send + Sync + 'static,
    mouse: impl Fn(i32, i32, u32) + Send + Sync + 'static,
) {
    *handle.callbacks.lock().unwrap_or_else(|e| e.into_inner()) =
        Some(Callbacks { kb: Box::new(kb), mouse: Box::new(mouse) });
}

/// Connect the transport to `path`, tagging outbound frames with this
/// session's identity, and record `vm_id` (as returned alongside `path` by
/// [`get_socket_path`]) for use naming the shared-memory region.
///
/// # Errors
///
/// Returns [`ConnectError`] if the underlying transport fails to bind or
/// connect.
pub fn connect(
    handle: &Handle,
    path: impl AsRef<std::path::Path>,
    vm_id: i32,
) -> Result<(), ConnectError> {
    let transport = rdpmux_transport::UnixDatagramTransport::connect(path, &handle.identity)?;
    *handle.transport.lock().unwrap_or_else(|e| e.into_inner()) = Some(Box::new(transport));
    *handle.vm_id.lock().unwrap_or_else(|e| e.into_inner()) = Some(vm_id);
    Ok(())
}

/// Fold a newly-changed region into the pending dirty rectangle.
///
/// Runs on the emulator's calling thread during display-callback dispatch;
/// assumes serial invocation from that thread and takes no lock shared with
/// the refresh path.
pub fn display_update(handle: &Handle, x: i32, y: i32, w: i32, h: i32) {
    handle.dirty.lock().unwrap_or_else(|e| e.into_inner()).update(x, y, w, h);
}

/// Record a resolution or format change: populate the shared frame with the
/// full new buffer, clear any in-flight rectangles, and enqueue a single
/// `DisplaySwitch` record.
///
/// # Errors
///
/// Returns [`SwitchError`] if the shared region cannot be created/resized
/// or `surface`'s declared length doesn't match its geometry. On error the
/// previous mapping (if any) is left untouched.
pub fn display_switch(handle: &Handle, surface: FrameSurface) -> Result<(), SwitchError> {
    let expected_len = (surface.stride as usize) * (surface.height.max(0) as usize);
    if surface.len < expected_len {
        return Err(SwitchError::SurfaceSizeMismatch {
            got: surface.len,
            width: surface.width,
            height: surface.height,
            bpp: surface.bpp,
        });
    }

    // Blocking acquire, unlike the refresh path: a display switch is rare
    // and must never be silently dropped under back-pressure.
    let mut lock = handle.frame_lock.lock().unwrap_or_else(|e| e.into_inner());

    let vm_id = *handle.vm_id.lock().unwrap_or_else(|e| e.into_inner());
    let mut shm_guard = handle.shm.lock().unwrap_or_else(|e| e.into_inner());
    if shm_guard.is_none() {
        let vm_id = vm_id.unwrap_or(0);
        *shm_guard = Some(SharedFrame::create(vm_id)?);
    }
    let shm = shm_guard.as_ref().expect("just populated above");

    // SAFETY: `surface.data` is valid for `surface.len` bytes for the
    // duration of this call per `FrameSurface`'s contract, and `expected_len`
    // was checked above to not exceed it.
    let bytes = unsafe { std::slice::from_raw_parts(surface.data, expected_len) };
    shm.write_at(0, bytes)?;
    drop(shm_guard);

    lock.out = None;
    lock.surface = Some(surface);
    handle.dirty.lock().unwrap_or_else(|e| e.into_inner()).clear();
    drop(lock);

    handle.outgoing.clear();
    handle.outgoing.enqueue(UpdateRecord::DisplaySwitch {
        format: surface.format,
        w: surface.width,
        h: surface.height,
    });

    tracing::info!(width = surface.width, height = surface.height, "Display switch");
    Ok(())
}

/// Attempt to publish the pending dirty rectangle to shared memory.
///
/// Non-blocking: if the frame lock is currently held (a previous update is
/// still awaiting ack from the consumer), this is a no-op and the dirty
/// rectangle is retained to be coalesced with the next update. This is
/// intentional back-pressure, not an error.
pub fn display_refresh(handle: &Handle) {
    if handle.dirty.lock().unwrap_or_else(|e| e.into_inner()).is_empty() {
        return;
    }

    let Ok(mut lock) = handle.frame_lock.try_lock() else {
        return;
    };

    let Some(surface) = lock.surface else {
        return;
    };

    let Some(pending) = handle.dirty.lock().unwrap_or_else(|e| e.into_inner()).take() else {
        return;
    };

    let aligned = pending.align_and_clamp(surface.width, surface.height);
    let row_bytes = surface.stride.max(0) as usize;
    let start = (aligned.y1.max(0) as usize) * row_bytes;
    let len = (aligned.height().max(0) as usize) * row_bytes;

    if len > 0 {
        let shm_guard = handle.shm.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(shm) = shm_guard.as_ref() {
            // SAFETY: `surface.data` is valid for `surface.len` bytes per
            // `FrameSurface`'s contract; `start + len <= surface.len`
            // because `aligned` was clamped to `surface.height` above.
            let bytes = unsafe { std::slice::from_raw_parts(surface.data.add(start), len) };
            if let Err(e) = shm.write_at(start, bytes) {
                tracing::warn!("refresh write to shared memory failed: {e}");
                return;
            }
        } else {
            return;
        }
    }

    lock.out = Some(match lock.out {
        Some(existing) => existing.union(&aligned),
        None => aligned,
    });
    handle.update_cond.notify_one();
}

/// Entry point for the output thread: drains published rectangles onto the
/// outgoing queue and holds the frame lock until the consumer acks.
pub fn run_output(handle: &Handle) {
    threads::run_output(handle);
}

/// Entry point for the main I/O thread: drains the outgoing queue to the
/// transport and dispatches inbound frames.
pub fn run_main_io(handle: &Handle) {
    threads::run_main_io(handle);
}

/// Entry point for the vestigial third thread. A no-op in the current
/// design; kept so hosts built against the three-thread ABI still have
/// something to join.
pub fn run_buffer_update(handle: &Handle) {
    while !handle.stop.load(Ordering::Relaxed) {
        std::thread::sleep(POLL_TICK);
    }
}

/// Spawn the three session threads and retain their handles for `cleanup`.
pub fn spawn_threads(handle: &Handle) {
    let mut threads = handle.threads.lock().unwrap_or_else(|e| e.into_inner());

    let h = Arc::clone(handle);
    threads.push(std::thread::spawn(move || run_output(&h)));

    let h = Arc::clone(handle);
    threads.push(std::thread::spawn(move || run_main_io(&h)));

    let h = Arc::clone(handle);
    threads.push(std::thread::spawn(move || run_buffer_update(&h)));
}

/// Tear down a session: stop flag, drain queue, drop transport, join
/// threads, then unmap and unlink the shared region. Order matters — the
/// queue is cleared first so threads observing empty-and-stopped can exit,
/// then the transport is dropped to unblock any blocked `recv`, then the
/// sync primitives are implicitly torn down with `handle` itself, and
/// finally the shared memory is unmapped last.
pub fn cleanup(handle: &Handle) {
    handle.stop.store(true, Ordering::SeqCst);
    handle.update_cond.notify_all();
    handle.ack_cond.notify_all();

    handle.outgoing.clear();

    *handle.transport.lock().unwrap_or_else(|e| e.into_inner()) = None;

    let threads: Vec<JoinHandle<()>> = std::mem::take(&mut handle.threads.lock().unwrap_or_else(|e| e.into_inner()));
    for thread in threads {
        let _ = thread.join();
    }

    *handle.shm.lock().unwrap_or_else(|e| e.into_inner()) = None;

    tracing::info!(uuid = %handle.identity, "Display session torn down");
}

#[cfg(test)]
mod tests {
    use std::os::unix::net::UnixDatagram;
    use std::sync::atomic::{AtomicI32, AtomicU32};
    use std::sync::Mutex as StdMutex;

    use super::*;

    fn test_uuid(tag: &str) -> String {
        format!("{tag:0<36}")[..36].to_string()
    }

    fn unique_vm_id() -> i32 {
        static NEXT: AtomicI32 = AtomicI32::new(600_000);
        NEXT.fetch_add(1, Ordering::Relaxed) + (std::process::id() as i32 % 10_000)
    }

    fn small_surface(buffer: &[u8], width: i32, height: i32) -> FrameSurface {
        FrameSurface {
            data: buffer.as_ptr(),
            len: buffer.len(),
            width,
            height,
            format: 0,
            stride: width * 4,
            bpp: 32,
        }
    }

    #[test]
    fn refresh_without_dirty_is_noop() {
        let handle = init(&test_uuid("noop")).unwrap();
        display_refresh(&handle);
        assert!(handle.outgoing.is_empty());
        // The frame lock was never contended; it must still be free.
        assert!(handle.frame_lock.try_lock().is_ok());
    }

    #[test]
    fn back_pressure_retains_dirty_until_lock_released() {
        let handle = init(&test_uuid("backpressure")).unwrap();
        *handle.vm_id.lock().unwrap() = Some(unique_vm_id());
        let buffer = vec![0u8; (64 * 64 * 4) as usize];
        let surface = small_surface(&buffer, 64, 64);
        display_switch(&handle, surface).unwrap();

        display_update(&handle, 0, 0, 8, 8);

        // Simulate the output thread holding the frame lock for an
        // in-flight ack.
        let guard = handle.frame_lock.lock().unwrap();
        display_refresh(&handle);
        drop(guard);

        assert!(handle.outgoing.is_empty());
        assert!(!handle.dirty.lock().unwrap().is_empty());
        assert!(handle.frame_lock.lock().unwrap().out.is_none());

        // The retained rectangle coalesces with a later update and is only
        // published to the frame lock's `out` slot once the lock is free —
        // the outgoing queue is filled only by the output thread, not by
        // `display_refresh` itself.
        display_update(&handle, 100, 100, 8, 8);
        display_refresh(&handle);
        assert!(handle.dirty.lock().unwrap().is_empty());
        assert!(handle.frame_lock.lock().unwrap().out.is_some());
    }

    #[test]
    fn display_switch_clears_queue_to_single_switch_record() {
        let handle = init(&test_uuid("switch")).unwrap();
        *handle.vm_id.lock().unwrap() = Some(unique_vm_id());

        handle.outgoing.enqueue(UpdateRecord::DisplayUpdate { x: 0, y: 0, w: 1, h: 1 });
        handle.outgoing.enqueue(UpdateRecord::DisplayUpdate { x: 1, y: 1, w: 1, h: 1 });
        handle.outgoing.enqueue(UpdateRecord::DisplayUpdate { x: 2, y: 2, w: 1, h: 1 });

        let buffer = vec![0u8; (640 * 480 * 4) as usize];
        let surface = small_surface(&buffer, 640, 480);
        display_switch(&handle, surface).unwrap();

        assert_eq!(handle.outgoing.len(), 1);
        match handle.outgoing.try_dequeue().unwrap() {
            UpdateRecord::DisplaySwitch { w, h, .. } => {
                assert_eq!(w, 640);
                assert_eq!(h, 480);
            }
            other => panic!("expected DisplaySwitch, got {other:?}"),
        }
    }

    #[test]
    fn ack_wakes_output_thread() {
        let handle = init(&test_uuid("ack")).unwrap();

        {
            let mut lock = handle.frame_lock.lock().unwrap();
            lock.out = Some(Rect { x1: 0, y1: 0, x2: 16, y2: 16 });
        }
        handle.update_cond.notify_one();

        let thread_handle = Arc::clone(&handle);
        let output = std::thread::spawn(move || run_output(&thread_handle));

        // Give the output thread a chance to publish to the outgoing queue
        // and start waiting on the ack condvar.
        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(handle.outgoing.len(), 1);
        assert!(handle.frame_lock.try_lock().is_err(), "output thread should hold the frame lock awaiting ack");

        threads::dispatch(&handle, UpdateRecord::UpdateAck { success: true });

        std::thread::sleep(Duration::from_millis(50));
        assert!(handle.frame_lock.try_lock().is_ok(), "frame lock should be released after the ack");

        handle.stop.store(true, Ordering::SeqCst);
        handle.update_cond.notify_all();
        handle.ack_cond.notify_all();
        output.join().unwrap();
    }

    /// Builds the same length-prefixed identity frame `UnixDatagramTransport`
    /// produces, so a bare consumer-side socket can inject frames without
    /// going through the transport's own connect/bind lifecycle.
    fn frame_for(identity: &str, payload: &[u8]) -> Vec<u8> {
        let id_bytes = identity.as_bytes();
        let mut frame = Vec::with_capacity(4 + id_bytes.len() + payload.len());
        frame.extend_from_slice(&(id_bytes.len() as u32).to_be_bytes());
        frame.extend_from_slice(id_bytes);
        frame.extend_from_slice(payload);
        frame
    }

    fn spawn_session_with_consumer(uuid: &str) -> (Handle, UnixDatagram, std::path::PathBuf) {
        let handle = init(uuid).unwrap();
        let dir = std::env::temp_dir();
        let consumer_path = dir.join(format!("rdpmux-test-consumer-{}-{}.sock", uuid, std::process::id()));
        let _ = std::fs::remove_file(&consumer_path);
        let consumer = UnixDatagram::bind(&consumer_path).unwrap();

        connect(&handle, &consumer_path, unique_vm_id()).unwrap();
        let main_path = dir.join(format!("rdpmux-{uuid}.sock"));

        let thread_handle = Arc::clone(&handle);
        std::thread::spawn(move || run_main_io(&thread_handle));

        (handle, consumer, main_path)
    }

    #[test]
    fn mouse_event_with_correct_identity_reaches_callback() {
        let uuid = test_uuid("mouseok");
        let (handle, consumer, main_path) = spawn_session_with_consumer(&uuid);

        let seen: Arc<StdMutex<Vec<(i32, i32, u32)>>> = Arc::new(StdMutex::new(Vec::new()));
        let seen_clone = Arc::clone(&seen);
        register_callbacks(
            &handle,
            |_keycode, _flags| {},
            move |x, y, flags| seen_clone.lock().unwrap().push((x, y, flags)),
        );

        let payload = rdpmux_codec::encode(&UpdateRecord::MouseEvent { x: 50, y: 60, flags: 1 });
        let frame = frame_for(&uuid, &payload);
        consumer.send_to(&frame, &main_path).unwrap();

        std::thread::sleep(Duration::from_millis(100));
        assert_eq!(*seen.lock().unwrap(), vec![(50, 60, 1)]);

        cleanup(&handle);
    }

    #[test]
    fn mismatched_identity_is_never_dispatched() {
        let uuid = test_uuid("mousebad");
        let (handle, consumer, main_path) = spawn_session_with_consumer(&uuid);

        let calls = Arc::new(AtomicU32::new(0));
        let calls_clone = Arc::clone(&calls);
        register_callbacks(&handle, |_, _| {}, move |_, _, _| {
            calls_clone.fetch_add(1, Ordering::SeqCst);
        });

        let payload = rdpmux_codec::encode(&UpdateRecord::MouseEvent { x: 50, y: 60, flags: 1 });
        let frame = frame_for("wrong-uuid", &payload);
        consumer.send_to(&frame, &main_path).unwrap();

        std::thread::sleep(Duration::from_millis(100));
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        cleanup(&handle);
    }
}
