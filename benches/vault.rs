//! Performance benchmarks for the credential vault
//!
//! Run with: cargo bench

use criterion::{criterion_group, criterion_main, Criterion};
use valkey_watch::vault::CredentialVault;

const MASTER_KEY: &str = "benchmark master key material";

fn bench_encrypt(c: &mut Criterion) {
    let vault = CredentialVault::new(MASTER_KEY).unwrap();

    c.bench_function("vault_encrypt", |b| {
        b.iter(|| vault.encrypt("a-production-password").unwrap());
    });
}

fn bench_decrypt(c: &mut Criterion) {
    let vault = CredentialVault::new(MASTER_KEY).unwrap();
    let envelope = vault.encrypt("a-production-password").unwrap();

    c.bench_function("vault_decrypt_warm_kek", |b| {
        b.iter(|| vault.decrypt(&envelope).unwrap());
    });
}

fn bench_envelope_detection(c: &mut Criterion) {
    let vault = CredentialVault::new(MASTER_KEY).unwrap();
    let envelope = vault.encrypt("a-production-password").unwrap();

    c.bench_function("vault_is_encrypted_envelope", |b| {
        b.iter(|| CredentialVault::is_encrypted(&envelope));
    });

    c.bench_function("vault_is_encrypted_plaintext", |b| {
        b.iter(|| CredentialVault::is_encrypted("just-a-password"));
    });
}

criterion_group!(
    benches,
    bench_encrypt,
    bench_decrypt,
    bench_envelope_detection
);
criterion_main!(benches);
