//! Per-key async lock whose entries disappear once nobody holds or awaits them

use std::hash::Hash;
use std::sync::Arc;
use std::sync::Weak;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::Mutex;
use tokio::sync::OwnedMutexGuard;

type LockMap<K> = Arc<DashMap<K, Weak<Mutex<()>>>>;

/// Held for the duration of one keyed critical section.
///
/// Dropping the last guard of a key removes the key from the map.
pub struct KeyedLockGuard<K>
where
    K: Hash + Eq + Clone,
{
    guard: Option<OwnedMutexGuard<()>>,
    lock: Arc<Mutex<()>>,
    key: K,
    locks: LockMap<K>,
}

impl<K> Drop for KeyedLockGuard<K>
where
    K: Hash + Eq + Clone,
{
    fn drop(&mut self) {
        drop(self.guard.take());
        // only `self.lock` left: no holder and no waiter
        if Arc::strong_count(&self.lock) == 1 {
            self.locks.remove(&self.key);
        }
    }
}

/// Serializes work per key while letting distinct keys run in parallel.
///
/// Requests against the same pod take the pod's lock so that two mounts, or a
/// mount and an unmount, never interleave on one container.
pub struct KeyedAsyncLock<K>
where
    K: Hash + Eq + Clone,
{
    locks: LockMap<K>,
}

impl<K> KeyedAsyncLock<K>
where
    K: Hash + Eq + Clone,
{
    pub fn new() -> Self {
        Self {
            locks: Arc::new(DashMap::new()),
        }
    }

    pub async fn lock(&self, key: &K) -> KeyedLockGuard<K> {
        let lock = self.get_or_create(key);
        let guard = Arc::clone(&lock).lock_owned().await;
        KeyedLockGuard {
            guard: Some(guard),
            lock,
            key: key.clone(),
            locks: Arc::clone(&self.locks),
        }
    }

    fn get_or_create(&self, key: &K) -> Arc<Mutex<()>> {
        loop {
            match self.locks.entry(key.clone()) {
                Entry::Occupied(occupied) => {
                    if let Some(strong) = occupied.get().upgrade() {
                        return strong;
                    }
                    occupied.remove();
                }
                Entry::Vacant(vacant) => {
                    let strong = Arc::new(Mutex::new(()));
                    vacant.insert(Arc::downgrade(&strong));
                    return strong;
                }
            }
        }
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.locks.len()
    }
}

impl<K> Default for KeyedAsyncLock<K>
where
    K: Hash + Eq + Clone,
{
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    use tokio::time::sleep;

    use super::*;
    use crate::domain::resource::PodRef;

    #[tokio::test]
    async fn same_pod_is_serialized() {
        let locks = Arc::new(KeyedAsyncLock::<PodRef>::new());
        let counter = Arc::new(AtomicUsize::new(0));
        let mut handles = vec![];

        for _ in 0..10 {
            let locks = Arc::clone(&locks);
            let counter = Arc::clone(&counter);
            handles.push(tokio::spawn(async move {
                let _guard = locks.lock(&PodRef::new("ns1", "p1")).await;
                let val = counter.load(Ordering::SeqCst);
                sleep(Duration::from_millis(1)).await;
                counter.store(val + 1, Ordering::SeqCst);
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(counter.load(Ordering::SeqCst), 10);
        assert_eq!(locks.len(), 0);
    }

    #[tokio::test]
    async fn different_pods_run_concurrently() {
        let locks = Arc::new(KeyedAsyncLock::<PodRef>::new());
        let start = std::time::Instant::now();

        let mut handles = vec![];
        for i in 0..5 {
            let locks = Arc::clone(&locks);
            handles.push(tokio::spawn(async move {
                let _guard = locks.lock(&PodRef::new("ns1", format!("p{i}"))).await;
                sleep(Duration::from_millis(50)).await;
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert!(start.elapsed() < Duration::from_millis(200));
    }

    #[tokio::test]
    async fn entries_are_removed_after_release() {
        let locks = KeyedAsyncLock::<PodRef>::new();
        let pod = PodRef::new("ns1", "p1");

        let guard = locks.lock(&pod).await;
        assert_eq!(locks.len(), 1);
        drop(guard);
        assert_eq!(locks.len(), 0);

        let first = locks.lock(&PodRef::new("ns1", "a")).await;
        let second = locks.lock(&PodRef::new("ns1", "b")).await;
        assert_eq!(locks.len(), 2);
        drop((first, second));
        assert_eq!(locks.len(), 0);
    }
}
