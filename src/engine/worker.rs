use std::io;
use std::sync::mpsc;
use std::thread;

/// Runs `run(task)` on a fresh detached thread. When the thread cannot be
/// started the task comes back to the caller with the error, so whatever
/// it holds can be released and the client answered.
pub(crate) fn spawn_worker<T, F>(name: &str, task: T, run: F) -> Result<(), (T, io::Error)>
where
    T: Send + 'static,
    F: FnOnce(T) + Send + 'static,
{
    let (tx, rx) = mpsc::sync_channel::<T>(1);
    let spawned = thread::Builder::new().name(name.to_string()).spawn(move || {
        if let Ok(task) = rx.recv() {
            run(task);
        }
    });
    match spawned {
        Ok(_detached) => {
            if let Err(mpsc::SendError(task)) = tx.send(task) {
                // the worker is gone; dropping the task releases its resources
                drop(task);
            }
            Ok(())
        }
        Err(err) => Err((task, err)),
    }
}
