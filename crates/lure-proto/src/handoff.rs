//! Single-slot, overwrite-on-write cells used to pass the latest value of
//! something between tasks.
//!
//! A write replaces whatever was in the slot; a read clones the newest value.
//! Readers never wait for the writer and the writer never waits for readers.
//! There is exactly one [`HandoffWriter`] per cell.

use tokio::sync::watch;

/// Creates a cell holding `init`.
pub fn handoff<T>(init: T) -> (HandoffWriter<T>, HandoffReader<T>) {
    let (tx, rx) = watch::channel(init);
    (HandoffWriter { tx }, HandoffReader { rx })
}

#[derive(Debug)]
pub struct HandoffWriter<T> {
    tx: watch::Sender<T>,
}

impl<T> HandoffWriter<T> {
    /// Overwrites the slot. Succeeds even when no reader is left.
    pub fn publish(&self, value: T) {
        self.tx.send_replace(value);
    }

    /// Edits the slot in place, notifying readers only if `f` returns true.
    pub fn update<F>(&self, f: F)
    where
        F: FnOnce(&mut T) -> bool,
    {
        self.tx.send_if_modified(f);
    }

    pub fn reader(&self) -> HandoffReader<T> {
        HandoffReader { rx: self.tx.subscribe() }
    }
}

impl<T: Clone> HandoffWriter<T> {
    pub fn current(&self) -> T {
        self.tx.borrow().clone()
    }
}

#[derive(Debug, Clone)]
pub struct HandoffReader<T> {
    rx: watch::Receiver<T>,
}

impl<T: Clone> HandoffReader<T> {
    /// Newest value, without marking it seen.
    pub fn latest(&self) -> T {
        self.rx.borrow().clone()
    }

    /// Newest value, marking it seen for [`HandoffReader::changed`].
    pub fn take(&mut self) -> T {
        self.rx.borrow_and_update().clone()
    }

    /// Waits until a value newer than the last [`HandoffReader::take`] is
    /// published. Returns false once the writer is gone.
    pub async fn changed(&mut self) -> bool {
        self.rx.changed().await.is_ok()
    }

    pub fn has_changed(&self) -> bool {
        self.rx.has_changed().unwrap_or(false)
    }
}
