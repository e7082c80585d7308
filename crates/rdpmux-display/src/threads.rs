//! Bodies of the two long-lived I/O threads.
//!
//! Thread entry points themselves ([`run_output`], [`run_main_io`]) are
//! re-exported from the crate root; this module holds their loop bodies so
//! `lib.rs` stays the public-surface file.

use std::sync::atomic::Ordering;
use std::time::Duration;

use rdpmux_codec::UpdateRecord;
use rdpmux_transport::Transport;

use crate::{DisplayInner, POLL_TICK};

/// Maximum send attempts per record before the frame is dropped and logged.
/// Bounds the original implementation's indefinite retry, which spins hot
/// against a permanently gone peer.
const MAX_SEND_ATTEMPTS: u32 = 5;

/// Drain published rectangles onto the outgoing queue, holding the frame
/// lock from publish until the consumer's ack arrives.
pub(crate) fn run_output(handle: &DisplayInner) {
    loop {
        let mut guard = handle.frame_lock.lock().unwrap_or_else(|e| e.into_inner());

        loop {
            if guard.out.is_some() || handle.stop.load(Ordering::Relaxed) {
                break;
            }
            let (next, _timeout) = handle.update_cond.wait_timeout(guard, POLL_TICK).unwrap();
            guard = next;
        }

        if handle.stop.load(Ordering::Relaxed) && guard.out.is_none() {
            return;
        }

        let Some(rect) = guard.out.take() else {
            continue;
        };

        handle.outgoing.enqueue(UpdateRecord::DisplayUpdate {
            x: rect.x1,
            y: rect.y1,
            w: rect.width(),
            h: rect.height(),
        });

        loop {
            if guard.ack_pending || handle.stop.load(Ordering::Relaxed) {
                break;
            }
            let (next, _timeout) = handle.ack_cond.wait_timeout(guard, POLL_TICK).unwrap();
            guard = next;
        }
        guard.ack_pending = false;
    }
}

/// Drain the outgoing queue to the transport, poll for inbound frames, and
/// dispatch decoded input events to the registered callbacks.
pub(crate) fn run_main_io(handle: &DisplayInner) {
    loop {
        while let Some(record) = handle.outgoing.try_dequeue() {
            let bytes = rdpmux_codec::encode(&record);
            send_with_backoff(handle, &bytes);
        }

        if handle.stop.load(Ordering::Relaxed) {
            return;
        }

        poll_and_dispatch(handle);
    }
}

fn send_with_backoff(handle: &DisplayInner, bytes: &[u8]) {
    let mut delay = Duration::from_millis(1);

    for attempt in 1..=MAX_SEND_ATTEMPTS {
        let sent = {
            let guard = handle.transport.lock().unwrap_or_else(|e| e.into_inner());
            match guard.as_ref() {
                Some(transport) => transport.send(bytes),
                None => return,
            }
        };

        match sent {
            Ok(()) => return,
            Err(e) if attempt == MAX_SEND_ATTEMPTS => {
                tracing::error!("send failed after {attempt} attempts, dropping frame: {e}");
                return;
            }
            Err(e) => {
                tracing::warn!(attempt, "send failed, retrying: {e}");
                std::thread::sleep(delay);
                delay = (delay * 2).min(POLL_TICK);
            }
        }
    }
}

fn poll_and_dispatch(handle: &DisplayInner) {
    let readable = {
        let guard = handle.transport.lock().unwrap_or_else(|e| e.into_inner());
        match guard.as_ref() {
            Some(transport) => transport.poll(POLL_TICK),
            None => {
                drop(guard);
                std::thread::sleep(POLL_TICK);
                return;
            }
        }
    };

    let readable = match readable {
        Ok(r) => r,
        Err(e) => {
            tracing::warn!("transport poll failed: {e}");
            return;
        }
    };
    if !readable {
        return;
    }

    let received = {
        let guard = handle.transport.lock().unwrap_or_else(|e| e.into_inner());
        guard.as_ref().map(Transport::recv)
    };

    let Some(received) = received else {
        return;
    };

    let (identity, payload) = match received {
        Ok(frame) => frame,
        Err(e) => {
            tracing::warn!("transport recv failed: {e}");
            return;
        }
    };

    if identity != handle.identity {
        tracing::warn!(identity, "rejecting frame with mismatched identity");
        return;
    }

    match rdpmux_codec::decode(&payload) {
        Ok(record) => dispatch(handle, record),
        Err(e) => tracing::warn!("decode error, dropping frame: {e}"),
    }
}

pub(crate) fn dispatch(handle: &DisplayInner, record: UpdateRecord) {
    match record {
        UpdateRecord::MouseEvent { x, y, flags } => {
            if let Some(callbacks) = handle.callbacks.lock().unwrap_or_else(|e| e.into_inner()).as_ref() {
                (callbacks.mouse)(x, y, flags);
            }
        }
        UpdateRecord::KeyboardEvent { keycode, flags } => {
            if let Some(callbacks) = handle.callbacks.lock().unwrap_or_else(|e| e.into_inner()).as_ref() {
                (callbacks.kb)(keycode, flags);
            }
        }
        UpdateRecord::UpdateAck { .. } => {
            let mut guard = handle.frame_lock.lock().unwrap_or_else(|e| e.into_inner());
            guard.ack_pending = true;
            handle.ack_cond.notify_one();
        }
        UpdateRecord::Shutdown => {
            handle.stop.store(true, Ordering::SeqCst);
            handle.update_cond.notify_all();
            handle.ack_cond.notify_all();
        }
        UpdateRecord::DisplayUpdate { .. } | UpdateRecord::DisplaySwitch { .. } => {
            tracing::warn!("received a record this session only ever sends, ignoring");
        }
    }
}
