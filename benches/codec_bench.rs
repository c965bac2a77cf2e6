use criterion::{criterion_group, criterion_main, BatchSize, Criterion};
use relay_client::protocol::codec::{decode_line, encode_command, encode_datagram, position_update};
use relay_client::protocol::message::{Command, Quat, Vec3};
use relay_client::transport::datagram::DatagramCodec;
use relay_client::utils::crypto::SessionCipher;

fn bench_decode_line(c: &mut Criterion) {
    let mut group = c.benchmark_group("decode_line");

    let pipe = "ROOM_LIST|room_1|Monza|alice|2/8|room_2|Spa|bob|1/4|room_3|Imola|carol|6/8";
    let json = r#"{"command":"ROOM_LIST","rooms":[{"id":"room_1","name":"Monza","hostId":"alice","playerCount":2,"maxPlayers":8},{"id":"room_2","name":"Spa","hostId":"bob","playerCount":1,"maxPlayers":4}]}"#;

    group.bench_function("pipe_room_list", |b| b.iter(|| decode_line(pipe)));
    group.bench_function("json_room_list", |b| b.iter(|| decode_line(json)));
    group.bench_function("bare_pong", |b| b.iter(|| decode_line("PONG")));
    group.bench_function("game_started", |b| {
        b.iter(|| decode_line("GAME_STARTED|room_1|s1:0,0,0|s2:4,0,0|s3:8,0,0|s4:12,0,0"))
    });

    group.finish();
}

fn bench_encode_command(c: &mut Criterion) {
    let command = Command::RelayMessage {
        target_id: "s2".into(),
        message: "a".repeat(256),
    };
    c.bench_function("encode_command", |b| b.iter(|| encode_command(&command)));
}

fn bench_datagram(c: &mut Criterion) {
    let mut group = c.benchmark_group("datagram");
    let payload = encode_datagram(&position_update(
        "abc123",
        Vec3::new(12.5, 0.25, -40.0),
        Quat::new(0.0, 0.707, 0.0, 0.707),
        1_700_000_000_000,
    ))
    .unwrap_or_default();

    let keyed = DatagramCodec::new(Some(SessionCipher::derive("abc123", "secret")));
    let plain = DatagramCodec::new(None);

    group.bench_function("encode_encrypted", |b| b.iter(|| keyed.encode(&payload)));
    group.bench_function("encode_plain", |b| b.iter(|| plain.encode(&payload)));

    let sealed = keyed.encode(&payload).unwrap_or_default();
    group.bench_function("decode_encrypted", |b| {
        b.iter_batched(
            || DatagramCodec::new(Some(SessionCipher::derive("abc123", "secret"))),
            |mut codec| codec.decode(&sealed),
            BatchSize::SmallInput,
        )
    });

    let raw = serde_json::to_vec(&payload).unwrap_or_default();
    group.bench_function("decode_plaintext_fallback", |b| {
        b.iter_batched(
            || DatagramCodec::new(Some(SessionCipher::derive("abc123", "secret"))),
            |mut codec| codec.decode(&raw),
            BatchSize::SmallInput,
        )
    });

    group.finish();
}

criterion_group!(benches, bench_decode_line, bench_encode_command, bench_datagram);
criterion_main!(benches);
