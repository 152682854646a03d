use bytes::BytesMut;
use criterion::{Criterion, criterion_group, criterion_main};
use sfu_server_codec::rtcp::{
    Decoder,
    report::{ReceiverReport, ReceptionReport},
    sdes::SourceDescription,
};

fn criterion_benchmark(c: &mut Criterion) {
    let mut bytes = BytesMut::new();

    ReceiverReport {
        ssrc: 0x902f9e2e,
        reports: vec![ReceptionReport::default(); 4],
    }
    .encode(&mut bytes);

    SourceDescription::cname(0x902f9e2e, "sfu@example").encode(&mut bytes);

    c.bench_function("decode_compound", |b| {
        b.iter(|| {
            Decoder::decode(std::hint::black_box(&bytes)).unwrap();
        })
    });
}

criterion_group!(benches, criterion_benchmark);
criterion_main!(benches);
