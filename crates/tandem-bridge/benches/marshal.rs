use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use tandem_bridge::{Bridge, BridgeConfig};
use tandem_guest::Interpreter;
use tandem_host::{HostList, HostSession, HostValue, Vector};

fn bridge() -> std::sync::Arc<Bridge> {
    Bridge::new(Interpreter::new(), HostSession::new(), BridgeConfig::default()).unwrap()
}

fn bench_vectors_to_guest(c: &mut Criterion) {
    let bridge = bridge();
    let mut group = c.benchmark_group("host_to_guest");

    for len in [10usize, 1_000, 100_000] {
        let doubles = HostValue::Double(Vector::from((0..len).map(|i| i as f64).collect::<Vec<_>>()));
        group.throughput(Throughput::Elements(len as u64));
        group.bench_with_input(BenchmarkId::new("double_vector", len), &doubles, |b, value| {
            b.iter(|| bridge.host_to_guest(black_box(value), true).unwrap());
        });
    }

    let matrix = HostValue::Double(
        Vector::from(vec![1.0; 1_000_000])
            .with_dim(vec![1_000, 1_000])
            .unwrap(),
    );
    group.bench_function("double_matrix_view", |b| {
        b.iter(|| bridge.host_to_guest(black_box(&matrix), true).unwrap());
    });

    let named = HostValue::List(HostList::named(
        (0..100)
            .map(|i| (format!("field{}", i), HostValue::integer(i)))
            .collect(),
    ));
    group.bench_function("named_list", |b| {
        b.iter(|| bridge.host_to_guest(black_box(&named), true).unwrap());
    });

    group.finish();
}

fn bench_guest_to_host(c: &mut Criterion) {
    let bridge = bridge();
    let interp = bridge.interpreter().clone();
    let mut group = c.benchmark_group("guest_to_host");

    for len in [10usize, 1_000, 100_000] {
        let items = (0..len).map(|i| interp.new_int(i as i64)).collect();
        let list = interp.new_list(items);
        group.throughput(Throughput::Elements(len as u64));
        group.bench_with_input(BenchmarkId::new("int_list", len), &list, |b, &list| {
            b.iter(|| bridge.guest_to_host(black_box(list), true).unwrap());
        });
        interp.dec_ref(list);
    }

    let dict = interp.new_dict();
    for i in 0..100 {
        let value = interp.new_float(i as f64);
        interp
            .dict_set_item_str(dict, &format!("field{}", i), value)
            .unwrap();
        interp.dec_ref(value);
    }
    group.bench_function("dict", |b| {
        b.iter(|| bridge.guest_to_host(black_box(dict), true).unwrap());
    });
    group.bench_function("opaque_wrapper", |b| {
        b.iter(|| bridge.guest_to_host(black_box(dict), false).unwrap());
    });
    interp.dec_ref(dict);

    group.finish();
}

criterion_group!(benches, bench_vectors_to_guest, bench_guest_to_host);
criterion_main!(benches);
