use std::sync::{Condvar, Mutex};

use super::DispatchError;

/// One-shot latch: `complete` once, `wait` from any number of threads.
#[derive(Default)]
pub(crate) struct Completion {
    done: Mutex<bool>,
    wake: Condvar,
}

impl Completion {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn complete(&self) {
        let mut done = match self.done.lock() {
            Ok(done) => done,
            Err(poisoned) => poisoned.into_inner(),
        };
        *done = true;
        self.wake.notify_all();
    }

    pub(crate) fn wait(&self) -> Result<(), DispatchError> {
        let mut done = self
            .done
            .lock()
            .map_err(|_| DispatchError::LockPoisoned("completion wait"))?;
        while !*done {
            done = self
                .wake
                .wait(done)
                .map_err(|_| DispatchError::LockPoisoned("completion wait"))?;
        }
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn is_complete(&self) -> bool {
        self.done.lock().map(|done| *done).unwrap_or(true)
    }
}
