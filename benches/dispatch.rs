//! Benchmarks for the read/write dispatch path

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use switchcrypt::{
    Argon2Deriver, Capabilities, Device, DeviceConfig, MemoryCounter, SwapCommand, SwappableCipher,
};
use tempfile::TempDir;

fn create_device(dir: &TempDir, cipher: &str, strategy: &str) -> Device {
    let config = DeviceConfig {
        backstore_size: 8 * 1024 * 1024,
        flakes_per_nugget: 64,
        flake_size: 4096,
        cipher: cipher.to_string(),
        swap_cipher: Some("chacha8".to_string()),
        swap_strategy: strategy.to_string(),
        ..DeviceConfig::default()
    };
    let caps = Capabilities::new(MemoryCounter::new()).with_deriver(Argon2Deriver::light());
    Device::create(dir.path().join("bench.img"), &config, b"bench", caps).unwrap()
}

fn benchmark_sequential_write(c: &mut Criterion) {
    let mut group = c.benchmark_group("sequential_write_64k");

    for cipher in SwappableCipher::ALL {
        group.bench_with_input(BenchmarkId::from_parameter(cipher), &cipher, |b, cipher| {
            let dir = tempfile::tempdir().unwrap();
            let mut device = create_device(&dir, cipher.name(), "swap_disabled");
            let data = vec![0x42u8; 64 * 1024];
            let size = device.size();
            let mut offset = 0u64;

            b.iter(|| {
                device.write(black_box(&data), offset).unwrap();
                offset = (offset + data.len() as u64) % size;
            });
        });
    }

    group.finish();
}

fn benchmark_cached_read(c: &mut Criterion) {
    let mut group = c.benchmark_group("cached_read_64k");

    for cipher in SwappableCipher::ALL {
        group.bench_with_input(BenchmarkId::from_parameter(cipher), &cipher, |b, cipher| {
            let dir = tempfile::tempdir().unwrap();
            let mut device = create_device(&dir, cipher.name(), "swap_disabled");
            device.write(&vec![0x42u8; 256 * 1024], 0).unwrap();
            let mut buf = vec![0u8; 64 * 1024];

            b.iter(|| {
                device.read(black_box(&mut buf), 128 * 1024).unwrap();
            });
        });
    }

    group.finish();
}

fn benchmark_forward_migration(c: &mut Criterion) {
    c.bench_function("forward_rekey_read_256k", |b| {
        let dir = tempfile::tempdir().unwrap();
        let mut device = create_device(&dir, "chacha20", "swap_0_forward");
        device.write(&vec![0x42u8; 256 * 1024], 0).unwrap();
        let mut buf = vec![0u8; 256 * 1024];

        // every iteration flips the active cipher, so every nugget rekeys
        b.iter(|| {
            device.swap_sender().send(SwapCommand::FlipActiveCipher).unwrap();
            device.read(black_box(&mut buf), 0).unwrap();
        });
    });
}

criterion_group!(
    benches,
    benchmark_sequential_write,
    benchmark_cached_read,
    benchmark_forward_migration
);
criterion_main!(benches);
