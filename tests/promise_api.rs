//! Cross-thread promise behavior through the public API.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use repool::promise::GetError;
use repool::Promise;

#[test]
fn listeners_before_and_after_completion_all_fire_in_order() {
    let order = Arc::new(Mutex::new(Vec::new()));
    let promise = Promise::<u32>::new();

    // Two listeners before completion.
    for i in 0..2usize {
        let order = Arc::clone(&order);
        promise.add_listener(move |_| order.lock().unwrap().push(i));
    }

    // Complete from a second thread.
    let completer = promise.clone();
    thread::spawn(move || completer.set_success(7).unwrap())
        .join()
        .unwrap();

    // Three more listeners from yet another thread; each fires on its
    // adding call, in insertion order after the before-listeners.
    let late = promise.clone();
    let late_order = Arc::clone(&order);
    thread::spawn(move || {
        for i in 2..5usize {
            let order = Arc::clone(&late_order);
            late.add_listener(move |_| order.lock().unwrap().push(i));
        }
    })
    .join()
    .unwrap();

    assert_eq!(*order.lock().unwrap(), vec![0, 1, 2, 3, 4]);

    // A waiter on another thread observes the value.
    let getter = promise.clone();
    let value = thread::spawn(move || getter.get()).join().unwrap();
    assert_eq!(value.unwrap(), 7);
}

#[test]
fn get_blocks_until_success() {
    let promise = Promise::<String>::new();
    let completer = promise.clone();
    let handle = thread::spawn(move || {
        thread::sleep(Duration::from_millis(30));
        completer.set_success("ready".to_owned()).unwrap();
    });

    assert_eq!(promise.get().unwrap(), "ready");
    handle.join().unwrap();
}

#[test]
fn many_waiters_all_observe_the_result() {
    let promise = Promise::<u64>::new();
    let waiters: Vec<_> = (0..8)
        .map(|_| {
            let promise = promise.clone();
            thread::spawn(move || promise.get().unwrap())
        })
        .collect();

    thread::sleep(Duration::from_millis(20));
    promise.set_success(99).unwrap();

    for waiter in waiters {
        assert_eq!(waiter.join().unwrap(), 99);
    }
}

#[test]
fn cancellation_reaches_listeners_and_waiters() {
    let promise = Promise::<u32>::new();
    let fired = Arc::new(AtomicUsize::new(0));

    let observed = Arc::clone(&fired);
    promise.add_listener(move |p| {
        assert!(p.is_cancelled());
        observed.fetch_add(1, Ordering::Relaxed);
    });

    let waiter = {
        let promise = promise.clone();
        thread::spawn(move || promise.get())
    };
    thread::sleep(Duration::from_millis(20));

    let canceller = promise.clone();
    assert!(thread::spawn(move || canceller.cancel()).join().unwrap());

    assert!(matches!(waiter.join().unwrap(), Err(GetError::Cancelled)));
    assert_eq!(fired.load(Ordering::Relaxed), 1);
    assert!(promise.is_cancelled());
}

#[test]
fn completion_race_has_one_winner() {
    let promise = Promise::<usize>::new();
    let winners: Vec<_> = (0..4)
        .map(|i| {
            let promise = promise.clone();
            thread::spawn(move || promise.try_success(i))
        })
        .collect();

    let won: Vec<bool> = winners.into_iter().map(|t| t.join().unwrap()).collect();
    assert_eq!(won.iter().filter(|&&w| w).count(), 1);
    assert!(promise.is_success());
}

#[test]
fn uncancellable_promise_still_completes_across_threads() {
    let promise = Promise::<u32>::new();
    assert!(promise.set_uncancellable());

    let canceller = promise.clone();
    assert!(!thread::spawn(move || canceller.cancel()).join().unwrap());

    let completer = promise.clone();
    thread::spawn(move || completer.set_success(1).unwrap())
        .join()
        .unwrap();
    assert_eq!(promise.get().unwrap(), 1);
}
