//! Handle bookkeeping for a single `start()` call.
//!
//! A [`HandleSet`] owns every descriptor/handle allocated while resolving the
//! child's standard streams. Each handle ends up in exactly one place: taken
//! out as a parent-side stream, or closed when the set is dropped. Closing
//! happens in reverse acquisition order.

use crate::process::Stream;

/// Named positions in a [`HandleSet`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Slot {
    ParentStdin,
    ChildStdin,
    ParentStdout,
    ChildStdout,
    ParentStderr,
    ChildStderr,
    /// Shared null device, opened at most once per start.
    DevNull,
}

const SLOT_COUNT: usize = 7;

impl Slot {
    pub(crate) fn parent(stream: Stream) -> Slot {
        match stream {
            Stream::Stdin => Slot::ParentStdin,
            Stream::Stdout => Slot::ParentStdout,
            Stream::Stderr => Slot::ParentStderr,
        }
    }

    pub(crate) fn child(stream: Stream) -> Slot {
        match stream {
            Stream::Stdin => Slot::ChildStdin,
            Stream::Stdout => Slot::ChildStdout,
            Stream::Stderr => Slot::ChildStderr,
        }
    }

    fn index(self) -> usize {
        self as usize
    }
}

/// Where a child's standard stream comes from after resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ChildEnd<R> {
    /// Leave the stream as the child inherits it.
    Inherit,
    /// A handle held in the set (pipe end, duplicate, null device).
    Owned(Slot),
    /// A caller-owned raw handle, used as-is and never closed.
    #[cfg_attr(windows, allow(dead_code))]
    Borrowed(R),
    /// Same target as the child's stdout.
    SameAsStdout,
}

pub(crate) struct HandleSet<H> {
    slots: [Option<H>; SLOT_COUNT],
    order: Vec<Slot>,
}

impl<H> HandleSet<H> {
    pub(crate) fn new() -> Self {
        Self {
            slots: std::array::from_fn(|_| None),
            order: Vec::with_capacity(SLOT_COUNT),
        }
    }

    /// Record a freshly acquired handle.
    ///
    /// Each slot is filled at most once per start; a second insert is a bug.
    pub(crate) fn insert(&mut self, slot: Slot, handle: H) {
        debug_assert!(
            self.slots[slot.index()].is_none(),
            "slot {:?} filled twice",
            slot
        );
        self.slots[slot.index()] = Some(handle);
        self.order.push(slot);
    }

    pub(crate) fn get(&self, slot: Slot) -> Option<&H> {
        self.slots[slot.index()].as_ref()
    }

    pub(crate) fn contains(&self, slot: Slot) -> bool {
        self.slots[slot.index()].is_some()
    }

    /// Move a handle out; the set no longer closes it.
    pub(crate) fn take(&mut self, slot: Slot) -> Option<H> {
        let handle = self.slots[slot.index()].take();
        if handle.is_some() {
            self.order.retain(|s| *s != slot);
        }
        handle
    }

    /// Close one handle now.
    #[cfg(test)]
    pub(crate) fn close(&mut self, slot: Slot) {
        drop(self.take(slot));
    }

    /// Close everything still held, most recent first.
    pub(crate) fn unwind(&mut self) {
        while let Some(slot) = self.order.pop() {
            drop(self.slots[slot.index()].take());
        }
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.order.len()
    }
}

impl<H> Drop for HandleSet<H> {
    fn drop(&mut self) {
        self.unwind();
    }
}

/// Resolver output: the handle set plus the child end of each stream.
pub(crate) struct ResolvedStdio<H, R> {
    pub handles: HandleSet<H>,
    pub ends: [ChildEnd<R>; 3],
}

impl<H, R: Copy> ResolvedStdio<H, R> {
    pub(crate) fn end(&self, stream: Stream) -> ChildEnd<R> {
        self.ends[stream.index()]
    }
}
