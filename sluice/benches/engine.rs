use criterion::{black_box, criterion_group, criterion_main, Criterion};

use sluice::data::Data;
use sluice::event::Event;
use sluice::pipeline::FilterCtx;

fn bench_rope(c: &mut Criterion) {
    let payload = vec![0xa5u8; 64 * 1024];
    c.bench_function("rope_push_shift", |b| {
        b.iter(|| {
            let mut data = Data::from_slice(&payload);
            let mut out = Data::new();
            while !data.is_empty() {
                data.shift_to(1500, &mut out);
            }
            black_box(out.len())
        })
    });

    c.bench_function("rope_clone_views", |b| {
        let data = Data::from_slice(&payload);
        b.iter(|| black_box(data.clone().len()))
    });
}

fn bench_http1_decode(c: &mut Criterion) {
    use sluice::codecs::http1::Decoder;
    use sluice::pipeline::Filter;

    let request = b"GET /path/to/resource HTTP/1.1\r\nHost: bench.local\r\nUser-Agent: engine-bench\r\nAccept: */*\r\n\r\n";
    c.bench_function("http1_decode_request", |b| {
        let mut ctx = FilterCtx::new(None);
        b.iter(|| {
            let mut decoder = Decoder::new(false);
            let mut count = 0;
            decoder.process(&mut ctx, Event::Data(Data::from_slice(request)), &mut |_| {
                count += 1
            });
            black_box(count)
        })
    });
}

fn bench_hpack(c: &mut Criterion) {
    use sluice::codecs::http2::hpack::{HeaderDecoder, HeaderEncoder};
    use sluice::event::{MessageHead, RequestHead};

    let mut head = RequestHead::default();
    head.scheme = Some("http".to_string());
    head.authority = Some("bench.local".to_string());
    head.headers.push("user-agent", "engine-bench");
    head.headers.push("accept-encoding", "gzip, deflate");
    let head = MessageHead::Request(head);

    let mut block = Data::new();
    HeaderEncoder::encode(false, &head, &mut block);

    c.bench_function("hpack_decode_block", |b| {
        b.iter(|| {
            let mut decoder = HeaderDecoder::new(4096);
            decoder.start(false, false);
            decoder.decode(black_box(&block)).unwrap();
            black_box(decoder.end().is_ok())
        })
    });
}

criterion_group!(benches, bench_rope, bench_http1_decode, bench_hpack);
criterion_main!(benches);
