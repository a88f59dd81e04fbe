use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::error;

static POISON_RECOVERY_COUNT: AtomicU64 = AtomicU64::new(0);

pub fn poison_recovery_count() -> u64 {
    POISON_RECOVERY_COUNT.load(Ordering::Relaxed)
}

/// Locks `lock`, recovering the guard if a previous holder panicked.
///
/// The registry and pending-call maps only ever hold plain handles, so the data
/// behind a poisoned lock is still structurally valid.
pub fn mutex_lock_or_recover<T>(lock: &Mutex<T>) -> MutexGuard<'_, T> {
    lock.lock().unwrap_or_else(|poisoned| {
        POISON_RECOVERY_COUNT.fetch_add(1, Ordering::Relaxed);
        error!(
            "Mutex poisoned - a thread panicked while holding this lock. \
             Attempting recovery."
        );
        poisoned.into_inner()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_recovers_poisoned_mutex() {
        let lock = Arc::new(Mutex::new(5));
        let poisoner = Arc::clone(&lock);
        let _ = std::thread::spawn(move || {
            let _guard = poisoner.lock().unwrap();
            panic!("poison the lock");
        })
        .join();

        let before = poison_recovery_count();
        let guard = mutex_lock_or_recover(&lock);
        assert_eq!(*guard, 5);
        assert!(poison_recovery_count() > before);
    }
}
