//! Small helper running a closure at a fixed interval on its own
//! thread, stopping when dropped.

use std::{thread, time::Duration};

pub(crate) struct PeriodicTask {
    stop: Option<flume::Sender<()>>,
    handle: Option<thread::JoinHandle<()>>,
}

impl PeriodicTask {
    pub(crate) fn new(
        name: &str,
        interval: Duration,
        task: impl Fn() + Send + 'static,
    ) -> PeriodicTask {
        let (stop, rx) = flume::bounded::<()>(1);

        let handle = thread::Builder::new()
            .name(name.into())
            .spawn(move || loop {
                match rx.recv_timeout(interval) {
                    Err(flume::RecvTimeoutError::Timeout) => task(),
                    _ => break,
                }
            })
            .expect("failed to spawn periodic task");

        PeriodicTask {
            stop: Some(stop),
            handle: Some(handle),
        }
    }
}

impl Drop for PeriodicTask {
    fn drop(&mut self) {
        self.stop.take();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    };

    #[test]
    fn runs_and_stops() {
        let count = Arc::new(AtomicUsize::new(0));
        let counted = Arc::clone(&count);

        let task = PeriodicTask::new("ticker", Duration::from_millis(5), move || {
            counted.fetch_add(1, Ordering::Relaxed);
        });

        while count.load(Ordering::Relaxed) < 3 {
            thread::sleep(Duration::from_millis(5));
        }

        drop(task);
        let after = count.load(Ordering::Relaxed);
        thread::sleep(Duration::from_millis(25));
        assert_eq!(count.load(Ordering::Relaxed), after);
    }
}
