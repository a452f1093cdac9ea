use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::{mpsc, Mutex};

/// Marker item for [`IterableQueue`]: either a value or the end-of-stream
/// sentinel that terminates iteration.
pub enum StreamItem<T> {
    Item(T),
    EndOfStream,
}

/// FIFO hand-off between the receiver and the worker dispatcher. Items come
/// out in the order they were put; once the `EndOfStream` sentinel is
/// consumed, `next` returns `None` forever. Putting the sentinel is the
/// canonical way to shut the consuming side down.
pub struct IterableQueue<T> {
    tx: mpsc::UnboundedSender<StreamItem<T>>,
    rx: Mutex<mpsc::UnboundedReceiver<StreamItem<T>>>,
    finished: AtomicBool,
}

impl<T: Send> IterableQueue<T> {
    pub fn new() -> IterableQueue<T> {
        let (tx, rx) = mpsc::unbounded_channel();
        IterableQueue {
            tx,
            rx: Mutex::new(rx),
            finished: AtomicBool::new(false),
        }
    }

    pub fn put(&self, item: StreamItem<T>) {
        // The receiver half lives as long as self, so this only fails after
        // end-of-stream, when dropping the item is the right thing anyway.
        let _ = self.tx.send(item);
    }

    pub async fn next(&self) -> Option<T> {
        if self.finished.load(Ordering::Acquire) {
            return None;
        }

        let mut rx = self.rx.lock().await;
        match rx.recv().await {
            Some(StreamItem::Item(item)) => Some(item),
            Some(StreamItem::EndOfStream) | None => {
                self.finished.store(true, Ordering::Release);
                None
            }
        }
    }
}

impl<T: Send> Default for IterableQueue<T> {
    fn default() -> IterableQueue<T> {
        IterableQueue::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn yields_fifo_until_sentinel() {
        let queue = IterableQueue::new();
        queue.put(StreamItem::Item(1));
        queue.put(StreamItem::Item(2));
        queue.put(StreamItem::EndOfStream);

        let mut collected = Vec::new();
        while let Some(item) = queue.next().await {
            collected.push(item);
        }
        assert_eq!(collected, vec![1, 2]);

        // Terminated for good, even if more items arrive afterward.
        queue.put(StreamItem::Item(3));
        assert_eq!(queue.next().await, None);
    }

    #[tokio::test]
    async fn consumer_wakes_on_late_put() {
        let queue = std::sync::Arc::new(IterableQueue::new());

        let reader = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.next().await })
        };

        tokio::task::yield_now().await;
        queue.put(StreamItem::Item("late"));
        assert_eq!(reader.await.unwrap(), Some("late"));
    }
}
