use kernel_sync::{IrqGuard, SpinMutex, interrupts_enabled};
use std::{panic, thread};

#[test]
fn basic_lock_and_raii() {
    let l = SpinMutex::new(0_u32);

    {
        let mut g = l.lock();
        *g = 41;
    }

    {
        let mut g = l.lock();
        *g += 1;
        assert_eq!(*g, 42);
    }
    assert!(!l.is_locked());
}

#[test]
fn try_lock_semantics() {
    let l = SpinMutex::new(1u8);

    let g1 = l.try_lock();
    assert!(g1.is_some());
    assert_eq!(**g1.as_ref().unwrap(), 1);

    assert!(l.try_lock().is_none());

    drop(g1);
    assert!(l.try_lock().is_some());
}

#[test]
fn with_lock_works_and_unlocks() {
    let l = SpinMutex::new(String::from("a"));
    let len = l.with_lock(|s| {
        s.push('b');
        s.len()
    });
    assert_eq!(len, 2);
    assert_eq!(l.with_lock(|s| s.clone()), "ab");
}

#[test]
fn contended_increments_are_exact_and_exclusive() {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Barrier};

    let threads = 8;
    let iters = 5_000;

    let lock = Arc::new(SpinMutex::new(0usize));
    let in_cs = Arc::new(AtomicUsize::new(0));
    let start = Arc::new(Barrier::new(threads));

    let mut handles = Vec::with_capacity(threads);
    for _ in 0..threads {
        let lock = Arc::clone(&lock);
        let in_cs = Arc::clone(&in_cs);
        let start = Arc::clone(&start);
        handles.push(thread::spawn(move || {
            start.wait();
            for _ in 0..iters {
                lock.with_lock(|v| {
                    let prev = in_cs.fetch_add(1, Ordering::SeqCst);
                    assert_eq!(prev, 0, "mutual exclusion violated");
                    *v += 1;
                    in_cs.fetch_sub(1, Ordering::SeqCst);
                });
                thread::yield_now();
            }
        }));
    }

    for h in handles {
        h.join().unwrap();
    }

    assert_eq!(lock.with_lock(|v| *v), threads * iters);
}

#[test]
fn lock_is_released_on_panic() {
    let l = SpinMutex::new(0u32);

    let res = panic::catch_unwind(panic::AssertUnwindSafe(|| {
        l.with_lock(|v| {
            *v = 123;
            panic!("boom");
        });
    }));
    assert!(res.is_err());
    assert_eq!(l.with_lock(|v| *v), 123);
}

// The only test in this binary that looks at the (process-global) simulated
// interrupt flag, so it cannot race with the others.
#[test]
fn lock_irq_masks_interrupts_outside_the_lock() {
    let l = SpinMutex::new(Vec::<u32>::new());
    assert!(interrupts_enabled());

    {
        let mut g = l.lock_irq();
        assert!(!interrupts_enabled());
        assert!(l.is_locked());
        g.push(1);

        // Nested guard must not re-enable on drop.
        {
            let inner = IrqGuard::new();
            assert!(!inner.were_enabled());
        }
        assert!(!interrupts_enabled());
    }

    assert!(!l.is_locked());
    assert!(interrupts_enabled());
    assert_eq!(*l.lock(), vec![1]);
}
