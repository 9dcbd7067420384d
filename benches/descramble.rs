//! Benchmarks for the KPF repacking pipeline.
//!
//! Run with: cargo bench

use criterion::{Criterion, Throughput, criterion_group, criterion_main};

use kpf_repack::kfx::ion::{IonReader, IonValue, to_binary};
use kpf_repack::kpf::descramble::{SIGNATURE, WRAPPER_OFFSET, WRAPPER_FRAME_LENGTH, descramble, scramble};

/// Plain database image spanning several frames.
fn plain_db() -> Vec<u8> {
    let len = WRAPPER_OFFSET + 8 * WRAPPER_FRAME_LENGTH + 12_345;
    let mut data: Vec<u8> = (0..len).map(|i| (i % 253) as u8).collect();
    data[..SIGNATURE.len()].copy_from_slice(SIGNATURE);
    data
}

// ============================================================================
// Descrambling
// ============================================================================

fn bench_descramble(c: &mut Criterion) {
    let scrambled = scramble(&plain_db());
    let mut group = c.benchmark_group("descramble");
    group.throughput(Throughput::Bytes(scrambled.len() as u64));
    group.bench_function("8_frames", |b| {
        b.iter(|| descramble(&scrambled).unwrap());
    });
    group.finish();
}

// ============================================================================
// Ion decoding
// ============================================================================

fn bench_ion_read(c: &mut Criterion) {
    let paragraphs = (0..2000)
        .map(|i| {
            IonValue::Struct(vec![
                (155, IonValue::Int(1000 + i)),
                (159, IonValue::Symbol(269)),
                (145, IonValue::String(format!("paragraph {i}"))),
            ])
        })
        .collect();
    let data = to_binary(&IonValue::Annotated(
        vec![259],
        Box::new(IonValue::Struct(vec![(146, IonValue::List(paragraphs))])),
    ));

    c.bench_function("ion_read_storyline", |b| {
        b.iter(|| {
            let mut reader = IonReader::new(&data).unwrap();
            reader.next().unwrap()
        });
    });
}

criterion_group!(benches, bench_descramble, bench_ion_read);
criterion_main!(benches);
