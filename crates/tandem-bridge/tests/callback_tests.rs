//! Guest → Host Callback Integration Tests
//!
//! Host closures called from guest code:
//! - Argument and result conversion, keyword arguments
//! - Host failures raised as `tandem_call.HostError`
//! - Interrupt forwarding and callback nesting limits
//! - Calls from worker threads and main-thread scheduling

use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use tandem_bridge::callback::CALL_MODULE;
use tandem_bridge::{Bridge, BridgeConfig, BridgeError};
use tandem_guest::{Interpreter, ObjectId};
use tandem_host::{HostArgs, HostClosure, HostError, HostSession, HostValue};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn setup() -> Arc<Bridge> {
    init_tracing();
    Bridge::new(Interpreter::new(), HostSession::new(), BridgeConfig::default()).unwrap()
}

fn closure<F>(name: &str, f: F) -> HostValue
where
    F: Fn(&HostSession, HostArgs) -> Result<HostValue, HostError> + Send + Sync + 'static,
{
    HostValue::Closure(HostClosure::new(name, f))
}

/// A guest callable wrapping `value`, as a new reference.
fn guest_function(bridge: &Bridge, value: &HostValue) -> ObjectId {
    bridge.host_to_guest(value, true).unwrap().detach()
}

// ===== Calls From The Guest =====

#[test]
fn test_guest_calls_host_closure() {
    let bridge = setup();
    let interp = bridge.interpreter().clone();
    let add_one = closure("add_one", |_session, args| {
        let x = args.positional.first().and_then(HostValue::as_integer).unwrap_or(0);
        Ok(HostValue::integer(x + 1))
    });
    let f = guest_function(&bridge, &add_one);

    let _gil = interp.gil().acquire();
    let arg = interp.new_int(41);
    let out = interp.call(f, &[arg], &[]).unwrap();
    assert_eq!(interp.as_int(out), Some(42));
    for id in [out, arg, f] {
        interp.dec_ref(id);
    }
}

#[test]
fn test_keyword_arguments_reach_the_closure() {
    let bridge = setup();
    let interp = bridge.interpreter().clone();
    let scale = closure("scale", |_session, args| {
        let x = args.positional[0].as_double().unwrap_or(0.0);
        let by = args.named_arg("by").and_then(HostValue::as_double).unwrap_or(1.0);
        Ok(HostValue::double(x * by))
    });
    let f = guest_function(&bridge, &scale);

    let _gil = interp.gil().acquire();
    let x = interp.new_float(1.5);
    let by = interp.new_float(4.0);
    let out = interp.call(f, &[x], &[("by".to_string(), by)]).unwrap();
    assert_eq!(interp.as_float(out), Some(6.0));
    for id in [out, by, x, f] {
        interp.dec_ref(id);
    }
}

#[test]
fn test_host_function_has_name_and_type() {
    let bridge = setup();
    let interp = bridge.interpreter().clone();
    let f = guest_function(&bridge, &closure("summary", |_, _| Ok(HostValue::Null)));

    let name = interp.get_attr(f, "__name__").unwrap();
    assert_eq!(interp.as_str(name).as_deref(), Some("summary"));
    let class = interp.import_attr(CALL_MODULE, "HostFunction").unwrap();
    assert!(interp.is_kind(f, class));
    assert!(interp.has_attr(f, "__call__"));
    for id in [class, name, f] {
        interp.dec_ref(id);
    }
}

#[test]
fn test_host_closure_roundtrip_returns_same_closure() {
    let bridge = setup();
    let original = HostClosure::new("identity", |_, args| {
        Ok(args.positional.into_iter().next().unwrap_or(HostValue::Null))
    });
    let g = bridge
        .host_to_guest(&HostValue::Closure(original.clone()), true)
        .unwrap();
    match bridge.guest_to_host(g.id(), true).unwrap() {
        HostValue::Closure(back) => {
            assert_eq!(back.name, "identity");
            assert!(Arc::ptr_eq(&back.func, &original.func));
            assert!(back.foreign.is_none());
        }
        other => panic!("expected the original closure, got {:?}", other),
    }
}

#[test]
fn test_unconverted_closure_receives_wrappers() {
    let bridge = setup();
    let interp = bridge.interpreter().clone();
    let echo = closure("echo", |_session, args| {
        Ok(HostValue::string(args.positional[0].type_name()))
    });
    let f = bridge.host_to_guest(&echo, false).unwrap().detach();

    let _gil = interp.gil().acquire();
    let arg = interp.new_int(5);
    let out = interp.call(f, &[arg], &[]).unwrap();
    assert_eq!(interp.as_str(out).as_deref(), Some("externalptr"));
    for id in [out, arg, f] {
        interp.dec_ref(id);
    }
}

#[test]
fn test_make_host_function_from_capsule() {
    let bridge = setup();
    let interp = bridge.interpreter().clone();
    let value = closure("seven", |_, _| Ok(HostValue::integer(7)));
    let capsule = bridge.capsule(&value).unwrap();
    let capsule_id = bridge.host_to_guest(&capsule, false).unwrap().detach();

    let _gil = interp.gil().acquire();
    let make = interp.import_attr(CALL_MODULE, "make_host_function").unwrap();
    let name = interp.new_str("seven");
    let f = interp.call(make, &[capsule_id, name], &[]).unwrap();
    let out = interp.call(f, &[], &[]).unwrap();
    assert_eq!(interp.as_int(out), Some(7));

    let not_capsule = interp.new_int(1);
    assert!(interp.call(make, &[not_capsule, name], &[]).is_err());
    assert!(interp.err_matches(interp.builtins().type_error));
    interp.err_clear();

    for id in [not_capsule, out, f, name, make, capsule_id] {
        interp.dec_ref(id);
    }
}

// ===== Host Failures =====

#[test]
fn test_host_error_raised_as_guest_exception() {
    let bridge = setup();
    let interp = bridge.interpreter().clone();
    let failing = closure("explode", |_, _| Err(HostError::Stop("boom".into())));
    let f = guest_function(&bridge, &failing);

    let _gil = interp.gil().acquire();
    assert!(interp.call(f, &[], &[]).is_err());
    let host_error = interp.import_attr(CALL_MODULE, "HostError").unwrap();
    assert!(interp.err_matches(host_error));

    let err = bridge.fetch_error(false);
    let condition = err.condition().unwrap();
    assert!(condition.message.starts_with("tandem_call.HostError: boom"));
    assert!(condition.inherits("tandem_call.HostError"));
    assert!(condition.inherits("guest.builtin.Exception"));
    assert!(condition.is_error());
    assert!(interp.err_occurred().is_none());
    interp.dec_ref(host_error);
    interp.dec_ref(f);
}

#[test]
fn test_invoke_host_function_returns_outcome_tuple() {
    let bridge = setup();
    let interp = bridge.interpreter().clone();
    let failing = closure("explode", |_, _| Err(HostError::Stop("nope".into())));
    let capsule = bridge.capsule(&failing).unwrap();
    let capsule_id = bridge.host_to_guest(&capsule, false).unwrap().detach();

    let _gil = interp.gil().acquire();
    let invoke = interp.import_attr(CALL_MODULE, "invoke_host_function").unwrap();
    let outcome = interp.call(invoke, &[capsule_id], &[]).unwrap();
    assert!(interp.err_occurred().is_none());
    let items = interp.tuple_items(outcome).unwrap();
    assert_eq!(items.len(), 2);
    assert!(interp.is_none(items[0]));
    assert_eq!(interp.exception_message(items[1]).unwrap(), "nope");
    for id in [outcome, invoke, capsule_id] {
        interp.dec_ref(id);
    }
}

#[test]
fn test_host_interrupt_forwarded_to_top_level() {
    let bridge = setup();
    let interp = bridge.interpreter().clone();
    let slow = closure("slow", |_, _| Ok(HostValue::Null));
    let host_fn = guest_function(&bridge, &slow);
    let outer = interp.new_native_function("outer", move |interp, args, _kwargs| {
        interp.call(host_fn, args, &[])
    });
    let outer_host = bridge.guest_to_host(outer, true).unwrap();

    bridge.session().set_interrupt();
    let err = bridge.call_guest(&outer_host, HostArgs::default()).unwrap_err();
    assert!(matches!(err, BridgeError::Interrupted));

    // the interrupt was consumed; the next call goes through
    assert!(bridge.call_guest(&outer_host, HostArgs::default()).unwrap().is_null());
    interp.dec_ref(outer);
    interp.dec_ref(host_fn);
}

#[test]
fn test_nested_callbacks_capped_and_original_exception_kept() {
    let config = BridgeConfig {
        max_callback_depth: 1,
        ..BridgeConfig::default()
    };
    init_tracing();
    let bridge = Bridge::new(Interpreter::new(), HostSession::new(), config).unwrap();
    let interp = bridge.interpreter().clone();

    let inner = guest_function(&bridge, &closure("inner", |_, _| Ok(HostValue::integer(1))));
    let relay = interp.new_native_function("relay", move |interp, _args, _kwargs| {
        interp.call(inner, &[], &[])
    });
    let relay_host = bridge.guest_to_host(relay, true).unwrap();

    let weak = Arc::downgrade(&bridge);
    let outer = closure("outer", move |_, _| {
        let bridge = weak.upgrade().ok_or(HostError::WrongThread)?;
        bridge
            .call_guest(&relay_host, HostArgs::default())
            .map_err(HostError::from)
    });
    let outer = guest_function(&bridge, &outer);

    let _gil = interp.gil().acquire();
    assert!(interp.call(outer, &[], &[]).is_err());
    let err = bridge.fetch_error(false);
    let condition = err.condition().unwrap();
    assert!(condition.message.contains("nested deeper than 1"), "{}", condition.message);
    assert!(condition.inherits("tandem_call.HostError"));
    // the site recorded by the innermost failure survives the trip out
    assert!(matches!(&condition.call, HostValue::Language(call) if call == "outer(...)"));

    // depth is restored once the callbacks unwind
    let out = interp.call(inner, &[], &[]).unwrap();
    assert_eq!(interp.as_int(out), Some(1));
    for id in [out, outer, relay, inner] {
        interp.dec_ref(id);
    }
}

// ===== Worker Threads =====

#[test]
fn test_worker_thread_call_runs_on_main_thread() {
    let bridge = setup();
    let interp = bridge.interpreter().clone();
    let main = thread::current().id();
    let where_ran = closure("where_ran", move |session, _args| {
        Ok(HostValue::logical(session.is_main_thread() && thread::current().id() == main))
    });
    let f = guest_function(&bridge, &where_ran);

    let worker_interp = interp.clone();
    let worker = thread::spawn(move || {
        let _gil = worker_interp.gil().acquire();
        let out = worker_interp.call(f, &[], &[]).unwrap();
        let on_main = worker_interp.as_bool(out);
        worker_interp.dec_ref(out);
        on_main
    });

    while !worker.is_finished() {
        bridge.run_pending().unwrap();
        thread::sleep(Duration::from_millis(1));
    }
    assert_eq!(worker.join().unwrap(), Some(true));
    interp.dec_ref(f);
}

#[test]
fn test_scheduled_calls_run_exactly_once() {
    const CALLS: i64 = 20;
    let bridge = setup();
    let interp = bridge.interpreter().clone();

    let count = Arc::new(AtomicUsize::new(0));
    let sum = Arc::new(AtomicI64::new(0));
    let (c, s) = (count.clone(), sum.clone());
    let tally = interp.new_native_function("tally", move |interp, args, _kwargs| {
        c.fetch_add(1, Ordering::SeqCst);
        s.fetch_add(args.first().and_then(|&a| interp.as_int(a)).unwrap_or(0), Ordering::SeqCst);
        let none = interp.none();
        interp.inc_ref(none);
        Ok(none)
    });
    let schedule = interp
        .import_attr(CALL_MODULE, "invoke_host_function_on_main_thread")
        .unwrap();

    let worker_interp = interp.clone();
    thread::spawn(move || {
        let _gil = worker_interp.gil().acquire();
        for i in 0..CALLS {
            let data = worker_interp.new_int(i);
            let out = worker_interp.call(schedule, &[tally, data], &[]).unwrap();
            assert!(worker_interp.is_none(out));
            worker_interp.dec_ref(data);
        }
    })
    .join()
    .unwrap();

    assert_eq!(count.load(Ordering::SeqCst), 0);
    assert_eq!(bridge.run_pending().unwrap(), CALLS as usize);
    assert_eq!(count.load(Ordering::SeqCst), CALLS as usize);
    assert_eq!(sum.load(Ordering::SeqCst), (0..CALLS).sum::<i64>());
    assert_eq!(bridge.run_pending().unwrap(), 0);
    assert_eq!(count.load(Ordering::SeqCst), CALLS as usize);
    interp.dec_ref(schedule);
    interp.dec_ref(tally);
}

#[test]
fn test_run_pending_rejected_off_main_thread() {
    let bridge = setup();
    let worker = bridge.clone();
    let result = thread::spawn(move || worker.run_pending()).join().unwrap();
    assert!(matches!(result, Err(BridgeError::Host(HostError::WrongThread))));
}

#[test]
fn test_capsule_freed_on_worker_released_on_main() {
    let bridge = setup();
    let interp = bridge.interpreter().clone();
    let session = bridge.session().clone();
    let baseline = session.precious_count();

    let capsule = bridge.host_to_guest(&HostValue::Language("f(x)".into()), true).unwrap().detach();
    assert_eq!(session.precious_count(), baseline + 1);

    let worker_interp = interp.clone();
    thread::spawn(move || worker_interp.dec_ref(capsule)).join().unwrap();
    // still rooted: the release waits for the main thread
    assert_eq!(session.precious_count(), baseline + 1);

    bridge.run_pending().unwrap();
    assert_eq!(session.precious_count(), baseline);
}
