//! Micro-benchmarks for write → flush propagation.

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use skein_core::reactive::{Computed, Runtime, Signal, ViewHandle};

/// Write at the root of a computed chain and flush the single dependent
/// view.
fn chain_propagation(c: &mut Criterion) {
    c.bench_function("chain_depth_32", |b| {
        let rt = Runtime::new();
        let root = Signal::new(&rt, 0_u64);

        let mut tip = Computed::new(&rt, {
            let root = root.clone();
            move || Ok(root.get() + 1)
        });
        for _ in 0..31 {
            let prev = tip.clone();
            tip = Computed::new(&rt, move || Ok(prev.get()? + 1));
        }

        let _view = ViewHandle::register(&rt, {
            let tip = tip.clone();
            move || {
                let _ = tip.get()?;
                Ok(())
            }
        });

        let mut n = 0_u64;
        b.iter(|| {
            n += 1;
            root.set(black_box(n)).unwrap();
            rt.flush_sync().unwrap();
        });
    });
}

/// Write one signal fanned out to many views.
fn fanout_propagation(c: &mut Criterion) {
    c.bench_function("fanout_views_64", |b| {
        let rt = Runtime::new();
        let sig = Signal::new(&rt, 0_u64);

        let _views: Vec<ViewHandle> = (0..64)
            .map(|_| {
                let sig = sig.clone();
                ViewHandle::register(&rt, move || {
                    let _ = sig.get();
                    Ok(())
                })
            })
            .collect();

        let mut n = 0_u64;
        b.iter(|| {
            n += 1;
            sig.set(black_box(n)).unwrap();
            rt.flush_sync().unwrap();
        });
    });
}

criterion_group!(benches, chain_propagation, fanout_propagation);
criterion_main!(benches);
