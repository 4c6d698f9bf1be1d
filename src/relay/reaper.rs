// 空闲回收：最后一个订阅者离开后延迟拆除上游。
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::task::AbortHandle;
use tracing::warn;

// 重复 arm 或 cancel 均为空操作。
pub struct IdleReaper {
    grace: Duration,
    generation: AtomicU64,
    pending: Arc<Mutex<Option<(u64, AbortHandle)>>>,
}

impl IdleReaper {
    pub fn new(grace: Duration) -> Self {
        Self {
            grace,
            generation: AtomicU64::new(0),
            pending: Arc::new(Mutex::new(None)),
        }
    }

    pub fn grace(&self) -> Duration {
        self.grace
    }

    pub fn arm<F>(&self, fire: F) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        let mut guard = self.pending.lock();
        if guard.is_some() {
            return false;
        }
        let Ok(runtime) = Handle::try_current() else {
            warn!("idle reaper armed outside of a runtime; teardown skipped");
            return false;
        };
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let slot = self.pending.clone();
        let grace = self.grace;
        let task = runtime.spawn(async move {
            tokio::time::sleep(grace).await;
            {
                let mut guard = slot.lock();
                let current = guard.as_ref().map(|(current, _)| *current);
                if current != Some(generation) {
                    return;
                }
                *guard = None;
            }
            fire();
        });
        *guard = Some((generation, task.abort_handle()));
        true
    }

    pub fn cancel(&self) -> bool {
        match self.pending.lock().take() {
            Some((_, handle)) => {
                handle.abort();
                true
            }
            None => false,
        }
    }

    pub fn is_armed(&self) -> bool {
        self.pending.lock().is_some()
    }
}

impl Drop for IdleReaper {
    fn drop(&mut self) {
        self.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn counter() -> (Arc<AtomicUsize>, impl Fn() -> Box<dyn FnOnce() + Send>) {
        let fired = Arc::new(AtomicUsize::new(0));
        let handle = fired.clone();
        let make = move || {
            let fired = handle.clone();
            Box::new(move || {
                fired.fetch_add(1, Ordering::SeqCst);
            }) as Box<dyn FnOnce() + Send>
        };
        (fired, make)
    }

    #[tokio::test(start_paused = true)]
    async fn fires_after_grace_period() {
        let reaper = IdleReaper::new(Duration::from_secs(60));
        let (fired, make) = counter();
        assert!(reaper.arm(make()));
        tokio::time::sleep(Duration::from_secs(59)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(!reaper.is_armed());
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_prevents_firing() {
        let reaper = IdleReaper::new(Duration::from_secs(60));
        let (fired, make) = counter();
        reaper.arm(make());
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert!(reaper.cancel());
        assert!(!reaper.cancel());
        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn double_arm_keeps_the_first_timer() {
        let reaper = IdleReaper::new(Duration::from_secs(60));
        let (fired, make) = counter();
        assert!(reaper.arm(make()));
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert!(!reaper.arm(make()));
        tokio::time::sleep(Duration::from_secs(31)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn can_rearm_after_cancel() {
        let reaper = IdleReaper::new(Duration::from_secs(10));
        let (fired, make) = counter();
        reaper.arm(make());
        reaper.cancel();
        assert!(reaper.arm(make()));
        tokio::time::sleep(Duration::from_secs(11)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }
}
