use std::collections::BTreeMap;

use anyhow::Result;
use crossbeam::channel::{bounded, Receiver};
use crossbeam::thread::scope;

/// Items flowing through the pool carry the index of the window they belong
/// to; emission order is restored from it.
pub(crate) trait Orderable {
    fn index(&self) -> usize;
}

/// Data-parallel worker pool. Workers drain `in_receiver` concurrently; the
/// postprocessor runs on the calling thread and observes results in input
/// order regardless of completion order. A worker may return `Ok(None)` to
/// drop its item (e.g. on cancellation) without stalling the ordered output.
pub(crate) fn worker_pool<U, T, W, P>(
    threads: usize,
    out_capacity: usize,
    in_receiver: Receiver<U>,
    worker: W,
    mut postprocessor: P,
) -> Result<()>
where
    U: Send + Orderable,
    T: Send,
    W: Fn(U) -> Result<Option<T>> + Send + Sync,
    P: FnMut(T) -> Result<()> + Send,
{
    assert!(threads > 0);
    scope(|scope| -> Result<()> {
        let (out_sender, out_receiver) = bounded::<(usize, Result<Option<T>>)>(out_capacity);
        let worker = &worker;
        let mut handles = Vec::with_capacity(threads);
        for _ in 0..threads {
            let in_receiver = in_receiver.clone();
            let out_sender = out_sender.clone();
            handles.push(scope.spawn(move |_| {
                for item in in_receiver {
                    let index = item.index();
                    if out_sender.send((index, worker(item))).is_err() {
                        // Postprocessor hung up after a failure downstream.
                        break;
                    }
                }
            }));
        }
        drop(out_sender);

        let mut pending = BTreeMap::new();
        let mut next_index = 0;
        for (index, result) in out_receiver {
            pending.insert(index, result?);
            while let Some(slot) = pending.remove(&next_index) {
                if let Some(item) = slot {
                    postprocessor(item)?;
                }
                next_index += 1;
            }
        }
        for handle in handles {
            handle.join().expect("bug: worker thread panicked");
        }
        Ok(())
    })
    .expect("bug: worker pool scope panicked")
}
