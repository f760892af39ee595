use criterion::{black_box, criterion_group, criterion_main, Criterion};
use nexustalk::modules::nexus::{encode_frame, FrameDecoder, MessageType};

fn playback_stream() -> Vec<u8> {
    let mut stream = Vec::new();
    for i in 0..64 {
        let (message_type, size) = if i % 8 == 0 {
            (MessageType::LongPlaybackPacket, 70_000)
        } else {
            (MessageType::PlaybackPacket, 1_200)
        };
        let frame = encode_frame(message_type, &vec![0x42; size]).unwrap();
        stream.extend_from_slice(&frame);
    }
    stream
}

fn bench_encode_frame(c: &mut Criterion) {
    let payload = vec![0xAB; 1_200];
    c.bench_function("encode_frame", |b| {
        b.iter(|| encode_frame(black_box(MessageType::PlaybackPacket), black_box(&payload)).unwrap())
    });
}

fn bench_decode_stream(c: &mut Criterion) {
    let stream = playback_stream();

    // Sanity check once before benchmarking
    let mut decoder = FrameDecoder::new();
    assert_eq!(decoder.feed(&stream).count(), 64);

    c.bench_function("decode_stream_whole", |b| {
        b.iter(|| {
            let mut decoder = FrameDecoder::new();
            decoder.feed(black_box(&stream)).count()
        })
    });

    // Chunk size of a typical TLS record
    c.bench_function("decode_stream_16k_chunks", |b| {
        b.iter(|| {
            let mut decoder = FrameDecoder::new();
            let mut frames = 0;
            for chunk in black_box(&stream).chunks(16 * 1024) {
                frames += decoder.feed(chunk).count();
            }
            frames
        })
    });
}

criterion_group!(benches, bench_encode_frame, bench_decode_stream);
criterion_main!(benches);
