//! Property-based tests for read/write correctness
//!
//! Random writes, with swap commands mixed in, must always read back like a
//! plain in-memory buffer, whatever the strategy does underneath.

use proptest::prelude::*;
use switchcrypt::{
    Argon2Deriver, Capabilities, Device, DeviceConfig, MemoryCounter, SwapCommand,
};

/// 6 nuggets x 4 flakes x 16 bytes
fn config(strategy: &str) -> DeviceConfig {
    DeviceConfig {
        backstore_size: 105 + 6 * (64 + 8 + 1 + 1),
        flakes_per_nugget: 4,
        flake_size: 16,
        cipher: "aes256-ctr".to_string(),
        swap_cipher: Some("chacha12".to_string()),
        swap_strategy: strategy.to_string(),
        ..DeviceConfig::default()
    }
}

#[derive(Debug, Clone)]
enum Op {
    Write { offset: u64, data: Vec<u8> },
    Read { offset: u64, len: usize },
    Flip,
}

fn op(size: u64) -> impl Strategy<Value = Op> {
    prop_oneof![
        4 => (0..size, prop::collection::vec(any::<u8>(), 1..80)).prop_map(move |(offset, mut data)| {
            data.truncate((size - offset) as usize);
            Op::Write { offset, data }
        }),
        2 => (0..size, 1usize..80).prop_map(move |(offset, len)| Op::Read {
            offset,
            len: len.min((size - offset) as usize),
        }),
        1 => Just(Op::Flip),
    ]
}

fn run(strategy: &str, ops: &[Op]) -> Result<(), TestCaseError> {
    let dir = tempfile::tempdir().unwrap();
    let caps = Capabilities::new(MemoryCounter::new()).with_deriver(Argon2Deriver::light());
    let mut device = Device::create(dir.path().join("disk.img"), &config(strategy), b"pw", caps).unwrap();

    let mut model = vec![0u8; device.size() as usize];
    for op in ops {
        match op {
            Op::Write { offset, data } => {
                device.write(data, *offset).unwrap();
                model[*offset as usize..*offset as usize + data.len()].copy_from_slice(data);
            }
            Op::Read { offset, len } => {
                let mut buf = vec![0u8; *len];
                device.read(&mut buf, *offset).unwrap();
                prop_assert_eq!(&buf[..], &model[*offset as usize..*offset as usize + len]);
            }
            Op::Flip => {
                device.swap_sender().send(SwapCommand::FlipActiveCipher).unwrap();
            }
        }
    }

    let mut all = vec![0u8; model.len()];
    device.read(&mut all, 0).unwrap();
    prop_assert_eq!(all, model);
    Ok(())
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    #[test]
    fn prop_forward_matches_model(ops in prop::collection::vec(op(384), 1..40)) {
        run("swap_1_forward", &ops)?;
    }

    #[test]
    fn prop_zero_forward_matches_model(ops in prop::collection::vec(op(384), 1..40)) {
        run("swap_0_forward", &ops)?;
    }

    #[test]
    fn prop_mirrored_matches_model(ops in prop::collection::vec(op(192), 1..40)) {
        run("swap_mirrored", &ops)?;
    }

    #[test]
    fn prop_disabled_matches_model(ops in prop::collection::vec(op(384), 1..40)) {
        run("swap_disabled", &ops)?;
    }
}

#[test]
fn test_request_spanning_every_nugget() {
    let dir = tempfile::tempdir().unwrap();
    let caps = Capabilities::new(MemoryCounter::new()).with_deriver(Argon2Deriver::light());
    let mut device =
        Device::create(dir.path().join("disk.img"), &config("swap_2_forward"), b"pw", caps).unwrap();

    let data: Vec<u8> = (0..device.size()).map(|i| (i % 253) as u8).collect();
    device.write(&data, 0).unwrap();

    device.swap_sender().send(SwapCommand::FlipActiveCipher).unwrap();
    let mut buf = vec![0u8; data.len() - 2];
    device.read(&mut buf, 1).unwrap();
    assert_eq!(buf, data[1..data.len() - 1]);

    for nugget in 0..device.num_nuggets() {
        assert_eq!(device.nugget_cipher(nugget).unwrap().name(), "chacha12");
    }
}

#[test]
fn test_zero_length_requests() {
    let dir = tempfile::tempdir().unwrap();
    let caps = Capabilities::new(MemoryCounter::new()).with_deriver(Argon2Deriver::light());
    let mut device =
        Device::create(dir.path().join("disk.img"), &config("swap_disabled"), b"pw", caps).unwrap();

    device.write(&[], 100).unwrap();
    device.read(&mut [], device.size()).unwrap();
    assert!(device.is_pristine(1));
}
