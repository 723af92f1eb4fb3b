use crate::error::CacheError;
use std::collections::VecDeque;
use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::{oneshot, OwnedRwLockReadGuard, OwnedRwLockWriteGuard, RwLock};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Access {
    Read,
    Write,
}

struct Waiter {
    id: u64,
    access: Access,
    wake: oneshot::Sender<()>,
}

#[derive(Default)]
struct Bookkeeping {
    running_reads: usize,
    writing: bool,
    queue: VecDeque<Waiter>,
    next_id: u64,
}

impl Bookkeeping {
    fn enqueue(&mut self, access: Access) -> (u64, oneshot::Receiver<()>) {
        let (wake, woken) = oneshot::channel();
        let id = self.next_id;
        self.next_id += 1;
        self.queue.push_back(Waiter { id, access, wake });
        (id, woken)
    }

    fn release(&mut self, access: Access) {
        match access {
            Access::Read => self.running_reads = self.running_reads.saturating_sub(1),
            Access::Write => self.writing = false,
        }
    }

    /// Wakes the next writer alone, or every reader ahead of the next writer together.
    fn dispatch(&mut self) {
        if self.writing {
            return;
        }
        match self.queue.front().map(|w| w.access) {
            Some(Access::Write) if self.running_reads == 0 => {
                if let Some(writer) = self.queue.pop_front() {
                    self.writing = true;
                    log::debug!("coordinator waking writer {}", writer.id);
                    // a dropped receiver is cleaned up by its wait guard
                    let _ = writer.wake.send(());
                }
            }
            Some(Access::Read) => {
                let mut woken = 0;
                while self.queue.front().is_some_and(|w| w.access == Access::Read) {
                    if let Some(reader) = self.queue.pop_front() {
                        self.running_reads += 1;
                        woken += 1;
                        let _ = reader.wake.send(());
                    }
                }
                log::debug!("coordinator waking {} readers", woken);
            }
            _ => {}
        }
    }
}

/// Readers run together, writers run alone, and a waiting writer holds back readers that
/// arrive after it. Queued waiters are woken in arrival order.
///
/// Waiting is cancel-safe: dropping a pending `lock_read`/`lock_write` future removes its
/// queue entry, or gives back the access if it was granted in the meantime.
///
/// Permits own their access, so they can be moved into a blocking task.
pub struct ReadWriteCoordinator<T> {
    state: Arc<Mutex<Bookkeeping>>,
    data: Arc<RwLock<T>>,
}

fn lock_state(state: &Mutex<Bookkeeping>) -> MutexGuard<'_, Bookkeeping> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

struct WaitGuard<'c, T> {
    coordinator: &'c ReadWriteCoordinator<T>,
    id: u64,
    access: Access,
    armed: bool,
}

impl<T> Drop for WaitGuard<'_, T> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let mut state = self.coordinator.state();
        match state.queue.iter().position(|w| w.id == self.id) {
            Some(pos) => {
                state.queue.remove(pos);
            }
            None => state.release(self.access),
        }
        state.dispatch();
    }
}

/// Gives back granted access on drop.
struct Release {
    state: Arc<Mutex<Bookkeeping>>,
    access: Access,
}

impl Drop for Release {
    fn drop(&mut self) {
        let mut state = lock_state(&self.state);
        state.release(self.access);
        state.dispatch();
    }
}

// fields drop in declaration order: the data guard goes before the access is given back
pub struct ReadPermit<T> {
    guard: OwnedRwLockReadGuard<T>,
    _release: Release,
}

pub struct WritePermit<T> {
    guard: OwnedRwLockWriteGuard<T>,
    _release: Release,
}

impl<T> ReadWriteCoordinator<T> {
    pub fn new(data: T) -> Self {
        Self { state: Arc::new(Mutex::new(Bookkeeping::default())), data: Arc::new(RwLock::new(data)) }
    }

    fn state(&self) -> MutexGuard<'_, Bookkeeping> {
        lock_state(&self.state)
    }

    async fn acquire(&self, access: Access) -> Result<(), CacheError> {
        let waiting = {
            let mut state = self.state();
            let free = match access {
                Access::Read => !state.writing && state.queue.is_empty(),
                Access::Write => !state.writing && state.running_reads == 0 && state.queue.is_empty(),
            };
            if free {
                match access {
                    Access::Read => state.running_reads += 1,
                    Access::Write => state.writing = true,
                }
                None
            } else {
                Some(state.enqueue(access))
            }
        };
        if let Some((id, woken)) = waiting {
            let mut guard = WaitGuard { coordinator: self, id, access, armed: true };
            woken.await.map_err(|_| CacheError::custom("coordinator dropped a waiter"))?;
            guard.armed = false;
        }
        Ok(())
    }

    pub async fn lock_read(&self) -> Result<ReadPermit<T>, CacheError> {
        self.acquire(Access::Read).await?;
        let release = Release { state: self.state.clone(), access: Access::Read };
        let guard = self.data.clone().try_read_owned().map_err(|_| CacheError::custom("read granted while a write is active"))?;
        Ok(ReadPermit { guard, _release: release })
    }

    pub async fn lock_write(&self) -> Result<WritePermit<T>, CacheError> {
        self.acquire(Access::Write).await?;
        let release = Release { state: self.state.clone(), access: Access::Write };
        let guard = self.data.clone().try_write_owned().map_err(|_| CacheError::custom("write granted while access is active"))?;
        Ok(WritePermit { guard, _release: release })
    }

    /// Runs `body` under shared access.
    pub async fn read<R>(&self, body: impl FnOnce(&T) -> R) -> Result<R, CacheError> {
        let permit = self.lock_read().await?;
        Ok(body(&permit))
    }

    /// Runs `body` under exclusive access.
    pub async fn write<R>(&self, body: impl FnOnce(&mut T) -> R) -> Result<R, CacheError> {
        let mut permit = self.lock_write().await?;
        Ok(body(&mut permit))
    }

    /// `(running readers, writer active, queued waiters)`.
    pub fn status(&self) -> (usize, bool, usize) {
        let state = self.state();
        (state.running_reads, state.writing, state.queue.len())
    }

    /// Fails while a permit is still held somewhere.
    pub fn into_inner(self) -> Result<T, CacheError> {
        Arc::try_unwrap(self.data)
            .map(RwLock::into_inner)
            .map_err(|_| CacheError::custom("coordinator is still in use"))
    }
}

impl<T> Deref for ReadPermit<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.guard
    }
}

impl<T> Deref for WritePermit<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.guard
    }
}

impl<T> DerefMut for WritePermit<T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.guard
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::time::{sleep, timeout};

    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn readers_share_access() {
        let c = ReadWriteCoordinator::new(1);
        let a = c.lock_read().await.unwrap();
        let b = c.lock_read().await.unwrap();
        assert_eq!(*a + *b, 2);
        assert_eq!(c.status(), (2, false, 0));
        drop(a);
        drop(b);
        assert_eq!(c.status(), (0, false, 0));
    }

    #[tokio::test]
    async fn writer_waits_for_readers_and_blocks_new_ones() {
        let c = Arc::new(ReadWriteCoordinator::new(0));
        let reader = c.lock_read().await.unwrap();

        let writer = tokio::spawn({
            let c = c.clone();
            async move { c.write(|v| *v += 1).await.unwrap() }
        });
        settle().await;
        assert_eq!(c.status(), (1, false, 1));

        let late_reader = tokio::spawn({
            let c = c.clone();
            async move { c.read(|v| *v).await.unwrap() }
        });
        settle().await;
        assert_eq!(c.status(), (1, false, 2));

        drop(reader);
        writer.await.unwrap();
        // the late reader queued behind the writer and sees its result
        assert_eq!(late_reader.await.unwrap(), 1);
        assert_eq!(c.status(), (0, false, 0));
    }

    #[tokio::test]
    async fn queued_readers_wake_together() {
        let c = Arc::new(ReadWriteCoordinator::new(0));
        let writer = c.lock_write().await.unwrap();
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        for _ in 0..3 {
            let c = c.clone();
            let tx = tx.clone();
            tokio::spawn(async move {
                let permit = c.lock_read().await.unwrap();
                tx.send(*permit).unwrap();
                sleep(Duration::from_millis(50)).await;
                drop(permit);
            });
        }
        settle().await;
        assert_eq!(c.status(), (0, true, 3));
        drop(writer);
        for _ in 0..3 {
            assert_eq!(rx.recv().await, Some(0));
        }
        assert_eq!(c.status().0, 3);
    }

    #[tokio::test]
    async fn abandoned_waiters_do_not_block_the_queue() {
        let c = Arc::new(ReadWriteCoordinator::new(0));
        let writer = c.lock_write().await.unwrap();

        let abandoned = timeout(Duration::from_millis(10), c.lock_write()).await;
        assert!(abandoned.is_err());
        assert_eq!(c.status(), (0, true, 0));

        let next = tokio::spawn({
            let c = c.clone();
            async move { c.write(|v| *v = 7).await.unwrap() }
        });
        settle().await;
        drop(writer);
        next.await.unwrap();
        assert_eq!(c.read(|v| *v).await.unwrap(), 7);
    }

    #[tokio::test]
    async fn cancelled_writer_releases_waiting_readers() {
        let c = Arc::new(ReadWriteCoordinator::new(0));
        let reader = c.lock_read().await.unwrap();
        let pending_writer = tokio::spawn({
            let c = c.clone();
            async move { c.write(|v| *v = 1).await.unwrap() }
        });
        settle().await;
        let blocked_reader = tokio::spawn({
            let c = c.clone();
            async move { c.read(|v| *v).await.unwrap() }
        });
        settle().await;
        assert_eq!(c.status(), (1, false, 2));

        pending_writer.abort();
        assert!(pending_writer.await.is_err());
        assert_eq!(blocked_reader.await.unwrap(), 0);
        drop(reader);
        assert_eq!(c.status(), (0, false, 0));
    }

    #[tokio::test]
    async fn panicking_body_releases_the_lock() {
        let c = Arc::new(ReadWriteCoordinator::new(0));
        let failed = tokio::spawn({
            let c = c.clone();
            async move { c.write(|_| panic!("boom")).await }
        });
        assert!(failed.await.is_err());
        assert_eq!(c.status(), (0, false, 0));
        assert_eq!(c.write(|v| { *v += 1; *v }).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn permits_move_into_blocking_tasks() {
        let c = Arc::new(ReadWriteCoordinator::new(0));
        let mut permit = c.lock_write().await.unwrap();
        let done = tokio::task::spawn_blocking(move || {
            *permit += 5;
            *permit
        });
        assert_eq!(done.await.unwrap(), 5);
        assert_eq!(c.status(), (0, false, 0));
        assert_eq!(c.read(|v| *v).await.unwrap(), 5);
    }

    #[tokio::test]
    async fn into_inner_fails_while_a_permit_is_held() {
        let c = ReadWriteCoordinator::new(3);
        let permit = c.lock_read().await.unwrap();
        assert!(matches!(c.into_inner(), Err(CacheError::Custom(_))));
        drop(permit);

        let c = ReadWriteCoordinator::new(3);
        assert_eq!(c.into_inner().unwrap(), 3);
    }

    #[tokio::test]
    async fn writes_are_linearized() {
        let c = Arc::new(ReadWriteCoordinator::new(Vec::new()));
        let mut tasks = Vec::new();
        for i in 0..20 {
            let c = c.clone();
            tasks.push(tokio::spawn(async move {
                c.write(|log| {
                    log.push(i);
                    log.len()
                })
                .await
                .unwrap()
            }));
        }
        let mut lens: Vec<usize> = futures::future::join_all(tasks).await.into_iter().map(|t| t.unwrap()).collect();
        lens.sort();
        assert_eq!(lens, (1..=20).collect::<Vec<_>>());
    }
}
