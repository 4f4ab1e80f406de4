use buffer_ops::{
    download, emu::EmuDevice, upload, upload_range, Device, RadixSort, RenamingLoader,
    SortOptions, SortRange, ValueType,
};
use rand::{Rng, SeedableRng};
use rand_hc::Hc128Rng;

const SEED: &[u8; 32] = b"q8VfE2rKx0WmN4tPzL6jH1cYbA7sD3uG";

/// Records of `[key, original index]` so stability is observable.
fn tagged(keys: &[u32]) -> Vec<[u32; 2]> {
    keys.iter()
        .enumerate()
        .map(|(i, &k)| [k, i as u32])
        .collect()
}

#[test]
fn sorts_stably_by_leading_word() {
    let device = EmuDevice::new();
    let mut rng = Hc128Rng::from_seed(*SEED);
    let keys: Vec<u32> = (0..20_000).map(|_| rng.gen_range(0..64)).collect();
    let records = tagged(&keys);
    let data = upload(&device, &records).unwrap();

    let mut sort = RadixSort::new(&device).unwrap();
    sort.sort(&data, &SortOptions::ascending(ValueType::Uint).max_value(63))
        .unwrap();

    let mut expected = records.clone();
    expected.sort_by_key(|r| r[0]);
    assert_eq!(download::<_, [u32; 2]>(&device, &data).unwrap(), expected);
}

#[test]
fn full_width_unsigned_keys() {
    let device = EmuDevice::new();
    let mut rng = Hc128Rng::from_seed(*SEED);
    let keys: Vec<u32> = (0..5000).map(|_| rng.gen()).collect();
    let data = upload(&device, &keys).unwrap();

    let mut sort = RadixSort::new(&device).unwrap();
    sort.sort(&data, &SortOptions::default()).unwrap();

    let mut expected = keys.clone();
    expected.sort_unstable();
    assert_eq!(download::<_, u32>(&device, &data).unwrap(), expected);
}

#[test]
fn negative_ints_and_floats_sort_numerically() {
    let device = EmuDevice::new();
    let mut rng = Hc128Rng::from_seed(*SEED);
    let mut sort = RadixSort::new(&device).unwrap();

    let ints: Vec<i32> = (0..3000).map(|_| rng.gen_range(-100_000..100_000)).collect();
    let data = upload(&device, &ints).unwrap();
    sort.sort(&data, &SortOptions::ascending(ValueType::Int)).unwrap();
    let mut expected = ints.clone();
    expected.sort_unstable();
    assert_eq!(download::<_, i32>(&device, &data).unwrap(), expected);

    let floats: Vec<f32> = (0..3000).map(|_| rng.gen_range(-1000.0..1000.0)).collect();
    let data = upload(&device, &floats).unwrap();
    sort.sort(&data, &SortOptions::ascending(ValueType::Float)).unwrap();
    let mut expected = floats.clone();
    expected.sort_by(f32::total_cmp);
    assert_eq!(download::<_, f32>(&device, &data).unwrap(), expected);
}

#[test]
fn descending_floats_match_reference() {
    let device = EmuDevice::new();
    let mut rng = Hc128Rng::seed_from_u64(0);
    let floats: Vec<f32> = (0..100).map(|_| rng.gen_range(-10_000.0..=10_000.0)).collect();
    let data = upload(&device, &floats).unwrap();

    let mut sort = RadixSort::new(&device).unwrap();
    sort.sort(&data, &SortOptions::descending(ValueType::Float)).unwrap();

    let mut expected = floats.clone();
    expected.sort_by(|a, b| b.total_cmp(a));
    assert_eq!(download::<_, f32>(&device, &data).unwrap(), expected);
}

#[test]
fn descending_keeps_equal_keys_in_input_order() {
    let device = EmuDevice::new();
    let records = tagged(&[2, 5, 2, 9, 5, 2]);
    let data = upload(&device, &records).unwrap();
    let mut sort = RadixSort::new(&device).unwrap();
    sort.sort(&data, &SortOptions::descending(ValueType::Uint).max_value(9))
        .unwrap();
    let tags: Vec<u32> = download::<_, [u32; 2]>(&device, &data)
        .unwrap()
        .iter()
        .map(|r| r[1])
        .collect();
    assert_eq!(tags, vec![3, 1, 4, 0, 2, 5]);
}

#[test]
fn host_and_device_ranges_agree() {
    let device = EmuDevice::new();
    let mut rng = Hc128Rng::from_seed(*SEED);
    let keys: Vec<u32> = (0..10_000).map(|_| rng.gen_range(0..1000)).collect();
    let records = tagged(&keys);
    let (start, end) = (1234, 8765);

    let host = upload(&device, &records).unwrap();
    let on_device = upload(&device, &records).unwrap();
    let range = upload_range(&device, start as u32, end as u32).unwrap();

    let mut sort = RadixSort::new(&device).unwrap();
    let options = SortOptions::ascending(ValueType::Uint).max_value(999);
    sort.sort(&host, &options.range(SortRange::Host { start, end }))
        .unwrap();
    sort.sort(&on_device, &options.range(SortRange::Device(&range)))
        .unwrap();

    let host = download::<_, [u32; 2]>(&device, &host).unwrap();
    assert_eq!(host, download::<_, [u32; 2]>(&device, &on_device).unwrap());

    let mut expected = records.clone();
    expected[start..end].sort_by_key(|r| r[0]);
    assert_eq!(host, expected);
}

#[test]
fn device_range_is_clamped_to_the_buffer() {
    let device = EmuDevice::new();
    let keys = vec![9u32, 8, 7, 6, 5, 4, 3, 2];
    let data = upload(&device, &keys).unwrap();
    let range = upload_range(&device, 4, 1_000).unwrap();

    let mut sort = RadixSort::new(&device).unwrap();
    sort.sort(&data, &SortOptions::default().range(SortRange::Device(&range)))
        .unwrap();
    assert_eq!(
        download::<_, u32>(&device, &data).unwrap(),
        vec![9, 8, 7, 6, 2, 3, 4, 5]
    );
}

#[test]
fn empty_device_range_changes_nothing() {
    let device = EmuDevice::new();
    let keys = vec![3u32, 1, 2];
    let data = upload(&device, &keys).unwrap();
    let range = upload_range(&device, 2, 2).unwrap();
    let mut sort = RadixSort::new(&device).unwrap();
    sort.sort(&data, &SortOptions::default().range(SortRange::Device(&range)))
        .unwrap();
    assert_eq!(download::<_, u32>(&device, &data).unwrap(), keys);
}

#[test]
fn scratch_buffers_are_released_on_dispose() {
    let device = EmuDevice::new();
    let data = upload(&device, &[5u32, 4, 3]).unwrap();
    let mut sort = RadixSort::new(&device).unwrap();
    sort.sort(&data, &SortOptions::default()).unwrap();
    sort.dispose();
    sort.dispose();
    assert_eq!(device.live_buffers(), 1);
    device.release_buffer(&data);
    assert_eq!(device.live_buffers(), 0);
}

#[test]
fn loader_routes_to_a_registered_program() {
    let mut device = EmuDevice::new();
    let program = buffer_ops::emu::EmuProgram::builtin(buffer_ops::radix_sort::PROGRAM).unwrap();
    device.register_program("custom_radix_sort", program);
    let loader = RenamingLoader::new().route(buffer_ops::radix_sort::PROGRAM, "custom_radix_sort");

    let data = upload(&device, &[3u32, 1, 2]).unwrap();
    let mut sort = RadixSort::with_loader(&device, &loader).unwrap();
    sort.sort(&data, &SortOptions::default().max_value(3)).unwrap();
    assert_eq!(download::<_, u32>(&device, &data).unwrap(), vec![1, 2, 3]);

    let missing = RenamingLoader::new().route(buffer_ops::radix_sort::PROGRAM, "absent");
    assert!(RadixSort::with_loader(&device, &missing).is_err());
}
