//! Criterion benchmarks for the pairing crypto and the request builder.
//!
//! Run with:
//! ```bash
//! cargo bench --package gs-core --bench pairing_bench
//! ```

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use gs_core::crypto::{
    compute_proof, decrypt_and_verify, derive_pairing_secret, encrypt_challenge, generate_salt,
    ProofRole, CHALLENGE_LEN,
};
use gs_core::{ClientIds, ControlIntent, ControlRequest, StreamConfig};
use uuid::Uuid;

const SERVER_CERT: &[u8] = b"-----BEGIN CERTIFICATE-----bench-----END CERTIFICATE-----";

fn bench_derive_pairing_secret(c: &mut Criterion) {
    let salt = generate_salt();
    c.bench_function("derive_pairing_secret", |b| {
        b.iter(|| {
            derive_pairing_secret(black_box("1234"), black_box(&salt), black_box(SERVER_CERT))
        })
    });
}

fn bench_challenge_roundtrip(c: &mut Criterion) {
    let secret = derive_pairing_secret("1234", &generate_salt(), SERVER_CERT)
        .expect("derivation must succeed");
    let challenge = [0x5Au8; CHALLENGE_LEN];
    c.bench_function("encrypt_then_decrypt_challenge", |b| {
        b.iter(|| {
            let sealed = encrypt_challenge(&secret, black_box(&challenge)).expect("encrypt");
            decrypt_and_verify(&secret, &sealed).expect("decrypt")
        })
    });
    c.bench_function("compute_proof", |b| {
        b.iter(|| {
            compute_proof(
                &secret,
                ProofRole::ClientChallengeResponse,
                &[black_box(&challenge), black_box(SERVER_CERT)],
            )
        })
    });
}

fn bench_build_launch_request(c: &mut Criterion) {
    let ids = ClientIds::default();
    let intent = ControlIntent::Launch {
        app_id: "881448767".to_string(),
        config: StreamConfig::new(1920, 1080, 60),
    };
    c.bench_function("build_launch_request", |b| {
        b.iter(|| ControlRequest::build(black_box(&intent), &ids, Uuid::nil()))
    });
}

criterion_group!(
    benches,
    bench_derive_pairing_secret,
    bench_challenge_roundtrip,
    bench_build_launch_request
);
criterion_main!(benches);
