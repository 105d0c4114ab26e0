// Event group between the control callback and the configuration worker.

use core::cell::Cell;
use core::future::poll_fn;
use core::task::Poll;

use critical_section::Mutex;
use embassy_sync::waitqueue::AtomicWaker;

use crate::protocol::EventFlags;

/// Flag set with consume-on-wait semantics.
///
/// `raise` never blocks, so it is safe from the USB callback path. `wait`
/// returns every flag pending at the moment it wakes and clears them in the
/// same critical section.
pub struct EventGroup {
    flags: Mutex<Cell<EventFlags>>,
    load_length: Mutex<Cell<u32>>,
    waker: AtomicWaker,
}

impl EventGroup {
    pub const fn new() -> Self {
        Self {
            flags: Mutex::new(Cell::new(EventFlags::empty())),
            load_length: Mutex::new(Cell::new(0)),
            waker: AtomicWaker::new(),
        }
    }

    pub fn raise(&self, flags: EventFlags) {
        critical_section::with(|cs| {
            let cell = self.flags.borrow(cs);
            cell.set(cell.get() | flags);
        });
        self.waker.wake();
    }

    /// Record the bitstream length and raise `START_CONFIG` together, so the
    /// worker never sees the flag without its length.
    pub fn request_load(&self, total_length: u32) {
        critical_section::with(|cs| {
            self.load_length.borrow(cs).set(total_length);
            let cell = self.flags.borrow(cs);
            cell.set(cell.get() | EventFlags::START_CONFIG);
        });
        self.waker.wake();
    }

    /// True if any flag in `mask` is raised and not yet consumed.
    pub fn pending(&self, mask: EventFlags) -> bool {
        critical_section::with(|cs| self.flags.borrow(cs).get().intersects(mask))
    }

    pub fn load_length(&self) -> u32 {
        critical_section::with(|cs| self.load_length.borrow(cs).get())
    }

    /// Take all pending flags without waiting.
    pub fn take(&self) -> EventFlags {
        critical_section::with(|cs| self.flags.borrow(cs).replace(EventFlags::empty()))
    }

    pub async fn wait(&self) -> EventFlags {
        poll_fn(|cx| {
            self.waker.register(cx.waker());
            let flags = self.take();
            if flags.is_empty() {
                Poll::Pending
            } else {
                Poll::Ready(flags)
            }
        })
        .await
    }

    /// Liveness token for a configuration cycle that starts now.
    pub fn session(&self) -> SessionToken<'_> {
        SessionToken { events: self }
    }
}

impl Default for EventGroup {
    fn default() -> Self {
        Self::new()
    }
}

/// Revoked by a bus reset or by a newer load request.
#[derive(Clone, Copy)]
pub struct SessionToken<'a> {
    events: &'a EventGroup,
}

impl SessionToken<'_> {
    pub fn is_live(&self) -> bool {
        !self
            .events
            .pending(EventFlags::USB_RESET | EventFlags::START_CONFIG)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use embassy_futures::block_on;

    #[test]
    fn wait_consumes_everything_pending() {
        let ev = EventGroup::new();
        ev.raise(EventFlags::AUX_ENABLE);
        ev.raise(EventFlags::POWER_DOWN);

        let got = block_on(ev.wait());
        assert_eq!(got, EventFlags::AUX_ENABLE | EventFlags::POWER_DOWN);
        assert!(!ev.pending(EventFlags::all()));
    }

    #[test]
    fn load_request_carries_latest_length() {
        let ev = EventGroup::new();
        ev.request_load(100);
        ev.request_load(2048);
        assert!(ev.pending(EventFlags::START_CONFIG));
        assert_eq!(ev.load_length(), 2048);
    }

    #[test]
    fn session_revoked_by_reset_or_new_load() {
        let ev = EventGroup::new();
        let session = ev.session();
        assert!(session.is_live());

        ev.raise(EventFlags::SWITCH_TO_STREAMING);
        assert!(session.is_live());

        ev.request_load(16);
        assert!(!session.is_live());
        ev.take();
        assert!(session.is_live());

        ev.raise(EventFlags::USB_RESET);
        assert!(!session.is_live());
    }
}
