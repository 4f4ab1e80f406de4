use buffer_ops::{download, emu::EmuDevice, upload, Device, Error, Shuffle, ShuffleOptions};
use rand::{Rng, SeedableRng};
use rand_hc::Hc128Rng;

const SEED: &[u8; 32] = b"Zr5wPq1NvK8cXe3TbM0yHs6LdJ9fGa2U";

fn shuffled(device: &EmuDevice, count: u32, options: &ShuffleOptions<'_>) -> Vec<u32> {
    let values: Vec<u32> = (0..count).collect();
    let data = upload(device, &values).unwrap();
    let mut shuffle = Shuffle::new(device).unwrap();
    shuffle.shuffle(&data, options).unwrap();
    let out = download::<_, u32>(device, &data).unwrap();
    device.release_buffer(&data);
    out
}

#[test]
fn output_is_a_permutation_for_any_count() {
    let device = EmuDevice::new();
    for count in [2, 3, 100, 127, 128, 129, 1000, 4096, 70_000] {
        let mut out = shuffled(&device, count, &ShuffleOptions::key(12345));
        if count >= 100 {
            assert_ne!(out, (0..count).collect::<Vec<_>>(), "count {count}");
        }
        out.sort_unstable();
        assert_eq!(out, (0..count).collect::<Vec<_>>(), "count {count}");
    }
}

#[test]
fn deterministic_per_key_and_rounds() {
    let device = EmuDevice::new();
    let options = ShuffleOptions::key(7).rounds(3);
    assert_eq!(shuffled(&device, 5000, &options), shuffled(&device, 5000, &options));
}

#[test]
fn sensitive_to_key_and_rounds() {
    let device = EmuDevice::new();
    let base = shuffled(&device, 5000, &ShuffleOptions::key(7));
    assert_ne!(base, shuffled(&device, 5000, &ShuffleOptions::key(8)));
    assert_ne!(base, shuffled(&device, 5000, &ShuffleOptions::key(7).rounds(4)));
}

#[test]
fn rounds_outside_the_supported_range_are_clamped() {
    let device = EmuDevice::new();
    assert_eq!(
        shuffled(&device, 777, &ShuffleOptions::key(3).rounds(0)),
        shuffled(&device, 777, &ShuffleOptions::key(3).rounds(1))
    );
    assert_eq!(
        shuffled(&device, 777, &ShuffleOptions::key(3).rounds(99)),
        shuffled(&device, 777, &ShuffleOptions::key(3).rounds(4))
    );
}

#[test]
fn moves_whole_records() {
    let device = EmuDevice::new();
    let mut rng = Hc128Rng::from_seed(*SEED);
    let records: Vec<[u32; 3]> = (0..2000u32).map(|i| [i, rng.gen(), i * 2]).collect();
    let data = upload(&device, &records).unwrap();
    let mut shuffle = Shuffle::new(&device).unwrap();
    shuffle.shuffle(&data, &ShuffleOptions::key(rng.gen())).unwrap();

    let mut out = download::<_, [u32; 3]>(&device, &data).unwrap();
    assert_ne!(out, records);
    out.sort_by_key(|r| r[0]);
    assert_eq!(out, records);
}

#[test]
fn in_place_and_output_buffer_agree() {
    let device = EmuDevice::new();
    let values: Vec<u32> = (0..3000).collect();
    let in_place = upload(&device, &values).unwrap();
    let source = upload(&device, &values).unwrap();
    let out = device.create_buffer(values.len(), 4).unwrap();

    let mut shuffle = Shuffle::new(&device).unwrap();
    shuffle.shuffle(&in_place, &ShuffleOptions::key(99)).unwrap();
    shuffle
        .shuffle(&source, &ShuffleOptions::key(99).output(&out))
        .unwrap();

    assert_eq!(
        download::<_, u32>(&device, &in_place).unwrap(),
        download::<_, u32>(&device, &out).unwrap()
    );
    assert_eq!(download::<_, u32>(&device, &source).unwrap(), values);
}

#[test]
fn empty_buffer_is_a_no_op() {
    let device = EmuDevice::new();
    let data = device.create_buffer(0, 4).unwrap();
    let mut shuffle = Shuffle::new(&device).unwrap();
    shuffle.shuffle(&data, &ShuffleOptions::default()).unwrap();
    assert_eq!(device.launch_count(), 0);
}

#[test]
fn mismatched_output_stride_is_rejected() {
    let device = EmuDevice::new();
    let data = upload(&device, &[[1u32, 2], [3, 4]]).unwrap();
    let out = device.create_buffer(2, 4).unwrap();
    let mut shuffle = Shuffle::new(&device).unwrap();
    let result = shuffle.shuffle(&data, &ShuffleOptions::key(1).output(&out));
    assert!(matches!(result, Err(Error::Config(_))));
}
