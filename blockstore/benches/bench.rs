use criterion::criterion_main;

mod decode_index;

criterion_main!(batch::benches, decode_index::benches);
