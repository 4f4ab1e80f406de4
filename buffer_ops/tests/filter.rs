use buffer_ops::{download, emu::EmuDevice, upload, Filter, TotalDestination};
use rand::{Rng, SeedableRng};
use rand_hc::Hc128Rng;

const SEED: &[u8; 32] = b"Kc4mW9xRt2BvN7pLq0sEa5jHd8YgF1uZ";

#[test]
fn compacts_large_inputs_in_order() {
    let device = EmuDevice::new();
    let mut rng = Hc128Rng::from_seed(*SEED);
    let records: Vec<[u32; 2]> = (0..300_000u32)
        .map(|i| [rng.gen_bool(0.3) as u32 * rng.gen_range(1..100), i])
        .collect();
    let data = upload(&device, &records).unwrap();

    let mut filter = Filter::new(&device).unwrap();
    let kept = filter.filter(&data, TotalDestination::Return).unwrap().unwrap();

    let expected: Vec<[u32; 2]> = records.iter().copied().filter(|r| r[0] != 0).collect();
    assert_eq!(kept as usize, expected.len());
    let out = download::<_, [u32; 2]>(&device, &data).unwrap();
    assert_eq!(&out[..expected.len()], &expected[..]);
    assert_eq!(&out[expected.len()..], &records[expected.len()..]);
}

#[test]
fn nothing_kept() {
    let device = EmuDevice::new();
    let data = upload(&device, &vec![0u32; 1000]).unwrap();
    let mut filter = Filter::new(&device).unwrap();
    assert_eq!(filter.filter(&data, TotalDestination::Return).unwrap(), Some(0));
    assert_eq!(download::<_, u32>(&device, &data).unwrap(), vec![0u32; 1000]);
}

#[test]
fn reused_filter_handles_wider_records() {
    let device = EmuDevice::new();
    let mut filter = Filter::new(&device).unwrap();

    let narrow = upload(&device, &[0u32, 4, 0, 2]).unwrap();
    assert_eq!(filter.filter(&narrow, TotalDestination::Return).unwrap(), Some(2));

    let wide = upload(&device, &[[7u32, 1, 1], [0, 2, 2], [5, 3, 3]]).unwrap();
    assert_eq!(filter.filter(&wide, TotalDestination::Return).unwrap(), Some(2));
    let out = download::<_, [u32; 3]>(&device, &wide).unwrap();
    assert_eq!(&out[..2], &[[7, 1, 1], [5, 3, 3]]);
}
