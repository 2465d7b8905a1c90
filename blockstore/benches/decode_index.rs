use criterion::{criterion_group, Criterion, Throughput};
use gateway_blockstore::{index::format, mocks};

fn bench_decode_index(c: &mut Criterion) {
    let mut group = c.benchmark_group(module_path!());
    for n in [1_000, 10_000, 100_000] {
        // Encode an index of `n` entries
        let entries: Vec<_> = (0..n as u64)
            .map(|i| (mocks::sha256(&i.to_be_bytes()), i * 1024))
            .collect();
        let bytes = format::encode(&entries);

        group.throughput(Throughput::Bytes(bytes.len() as u64));
        group.bench_function(format!("entries={n}"), |b| {
            b.iter(|| format::decode(&bytes).unwrap().len())
        });
        group.bench_function(format!("entries={n} chunked"), |b| {
            b.iter(|| {
                let mut decoder = format::Decoder::new();
                let mut count = 0;
                for chunk in bytes.chunks(64 * 1024) {
                    decoder.push(chunk);
                    while decoder.next_entry().unwrap().is_some() {
                        count += 1;
                    }
                }
                decoder.finish().unwrap();
                count
            })
        });
    }
    group.finish();
}

criterion_group! {
    name = benches;
    config = Criterion::default().sample_size(10);
    targets = bench_decode_index
}
