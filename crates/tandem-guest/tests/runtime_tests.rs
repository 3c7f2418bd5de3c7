//! Guest Runtime Integration Tests
//!
//! Exercises the interpreter surface the bridge depends on:
//! - Reference counting across containers, iterators and methods
//! - Capsule destructors and array base objects
//! - Pending calls queued from worker threads
//! - Thread stacks observed under the execution lock

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;

use tandem_guest::{ArrayBuffer, DType, Interpreter, NdArray, Order};

// ===== Reference Counting =====

#[test]
fn test_container_roundtrip_leaves_no_garbage() {
    let interp = Interpreter::new();
    let baseline = interp.heap_stats().live_objects;

    for i in 0..100 {
        let d = interp.new_dict();
        let v = interp.new_int(i);
        interp.dict_set_item_str(d, "value", v).unwrap();
        interp.dec_ref(v);
        let items = interp.mapping_items(d).unwrap();
        let it = interp.get_iter(items).unwrap();
        while let Some(pair) = interp.iter_next(it).unwrap() {
            interp.dec_ref(pair);
        }
        interp.dec_ref(it);
        interp.dec_ref(items);
        interp.dec_ref(d);
    }

    assert_eq!(interp.heap_stats().live_objects, baseline);
}

#[test]
fn test_bound_methods_release_receiver() {
    let interp = Interpreter::new();
    let d = interp.new_dict();
    for _ in 0..10 {
        let keys = interp.call_method(d, "keys", &[], &[]).unwrap();
        interp.dec_ref(keys);
    }
    assert_eq!(interp.refcount(d), 1);
}

// ===== Capsules and Arrays =====

#[test]
fn test_array_base_capsule_finalized_with_array() {
    let interp = Interpreter::new();
    let freed = Arc::new(AtomicUsize::new(0));
    let data: Arc<[f64]> = Arc::from(vec![1.0, 2.0, 3.0, 4.0]);

    let counter = freed.clone();
    let base = interp.new_capsule(
        Arc::new(data.clone()),
        Some("owner"),
        Some(Box::new(move |_, _| {
            counter.fetch_add(1, Ordering::SeqCst);
        })),
    );
    let view = NdArray::view(
        DType::Float64,
        vec![2, 2],
        Order::Fortran,
        ArrayBuffer::F64(data.clone()),
        base,
    )
    .unwrap();
    let array = interp.new_array(view);

    let snapshot = interp.array(array).unwrap();
    assert!(!snapshot.owns_data());
    match snapshot.buffer() {
        ArrayBuffer::F64(buf) => assert!(Arc::ptr_eq(buf, &data)),
        _ => panic!("expected f64 storage"),
    }
    drop(snapshot);

    assert_eq!(freed.load(Ordering::SeqCst), 0);
    interp.dec_ref(array);
    assert_eq!(freed.load(Ordering::SeqCst), 1);
}

#[test]
fn test_object_array_cast_takes_references() {
    let interp = Interpreter::new();
    let a = interp.new_str("a");
    let b = interp.new_str("b");
    let array = interp
        .new_array_from(DType::Object, vec![2], Order::C, ArrayBuffer::Object(vec![a, b]))
        .unwrap();
    let cast = interp.array_cast(array, DType::Object, Order::Fortran).unwrap();
    assert_eq!(interp.refcount(a), 2);
    interp.dec_ref(array);
    interp.dec_ref(cast);
    assert!(!interp.is_alive(a));
    assert!(!interp.is_alive(b));
}

// ===== Pending Calls =====

#[test]
fn test_pending_calls_from_many_workers() {
    let interp = Interpreter::new();
    let counter = Arc::new(AtomicUsize::new(0));

    let workers: Vec<_> = (0..4)
        .map(|_| {
            let interp = interp.clone();
            let counter = counter.clone();
            thread::spawn(move || {
                for _ in 0..5 {
                    let c = counter.clone();
                    let mut call: tandem_guest::PendingFn = Box::new(move |_| {
                        c.fetch_add(1, Ordering::SeqCst);
                        Ok(())
                    });
                    loop {
                        match interp.add_pending_call(call) {
                            Ok(()) => break,
                            Err(back) => {
                                call = back;
                                thread::yield_now();
                            }
                        }
                    }
                }
            })
        })
        .collect();
    for w in workers {
        w.join().unwrap();
    }

    assert_eq!(interp.pending_call_count(), 20);
    assert_eq!(interp.make_pending_calls().unwrap(), 20);
    assert_eq!(counter.load(Ordering::SeqCst), 20);
}

// ===== Thread Stacks =====

#[test]
fn test_thread_stack_visible_while_calling() {
    let interp = Interpreter::new();
    let observed = Arc::new(parking_lot::Mutex::new(Vec::new()));
    let sink = observed.clone();
    let witness = interp.new_native_function("witness", move |interp, _a, _k| {
        for stack in interp.thread_stacks() {
            sink.lock().extend(stack.frames);
        }
        Ok(interp.none())
    });
    let _gil = interp.gil().acquire();
    interp.call(witness, &[], &[]).unwrap();
    assert_eq!(*observed.lock(), vec!["witness".to_string()]);
}
