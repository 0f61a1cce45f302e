//! Single-slot "latest frame wins" queue between a session's ingestion and
//! inference activities.

use std::sync::Mutex;

use tokio::sync::Notify;

#[derive(Default)]
struct SlotState {
    frame: Option<Vec<u8>>,
    closed: bool,
}

/// Holds at most one frame. A push replaces any unconsumed frame; `take`
/// waits until a frame is present or the slot is closed.
///
/// Meant for a single consumer.
#[derive(Default)]
pub struct FrameSlot {
    state: Mutex<SlotState>,
    notify: Notify,
}

impl FrameSlot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store `frame`, dropping any older unconsumed one. Returns `true` if a
    /// frame was evicted. Frames pushed after `close` are discarded.
    pub fn push(&self, frame: Vec<u8>) -> bool {
        let evicted = {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            if state.closed {
                return false;
            }
            state.frame.replace(frame).is_some()
        };
        self.notify.notify_one();
        evicted
    }

    /// Wait for the current frame. `None` once the slot is closed.
    pub async fn take(&self) -> Option<Vec<u8>> {
        loop {
            {
                let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
                if state.closed {
                    return None;
                }
                if let Some(frame) = state.frame.take() {
                    return Some(frame);
                }
            }
            self.notify.notified().await;
        }
    }

    /// Drop any pending frame and wake the consumer. Idempotent.
    pub fn close(&self) {
        {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            state.closed = true;
            state.frame = None;
        }
        self.notify.notify_one();
    }

    #[cfg(test)]
    fn is_pending(&self) -> bool {
        self.state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .frame
            .is_some()
    }
}
