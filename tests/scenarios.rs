//! End-to-end scenarios across the cache, the iterators and the software
//! device.

use {
    rand::{rngs::StdRng, Rng, SeedableRng},
    std::sync::Arc,
    tilestream::{
        buffer::{BufferInfo, RasterBuffer},
        color,
        driver::{Device, MemAccess, SoftDevice},
        iter::{Access, GpuIterator, HostIterator},
        CacheMode, Gpu, PixelFormat, Rect,
    },
};

fn init_logging() {
    let _ = pretty_env_logger::try_init();
}

fn engine() -> (Arc<SoftDevice>, Gpu) {
    init_logging();

    let device = Arc::new(SoftDevice::new());
    let gpu = Gpu::new(device.clone());

    (device, gpu)
}

fn float_buffer(width: i32, height: i32) -> Arc<RasterBuffer> {
    RasterBuffer::new(BufferInfo::new(
        Rect::new(0, 0, width, height),
        PixelFormat::RgbaF32,
    ))
}

fn solid(value: f32, pixels: usize) -> Vec<u8> {
    let mut px = [0u8; 16];

    color::encode_px(PixelFormat::RgbaF32, [value, value, value, 1.0], &mut px);

    px.iter().copied().cycle().take(pixels * 16).collect()
}

fn assert_solid(data: &[u8], value: f32) {
    for px in data.chunks_exact(16) {
        let decoded = color::decode_px(PixelFormat::RgbaF32, px);

        assert!((decoded[0] - value).abs() < 1e-6);
        assert!((decoded[3] - 1.0).abs() < 1e-6);
    }
}

/// Fill a whole buffer with one value through the device iterator; the data
/// stays device-resident until the read pulls it home.
#[test]
fn fill_through_device_iterator_reads_back() {
    let (device, gpu) = engine();
    let extent = Rect::new(0, 0, 512, 512);
    let buffer = float_buffer(512, 512);
    let mut iter = GpuIterator::new(&gpu, &buffer, None, None, Access::GPU_WRITE);
    let mut steps = 0;

    while iter.next().unwrap() {
        for k in 0..iter.n() {
            let (width, height) = iter.size(0, k);
            let bytes = solid(0.5, (width * height) as usize);

            gpu.device()
                .write_image(iter.tex(0, k), (0, 0), (width, height), 0, &bytes)
                .unwrap();

            steps += 1;
        }
    }

    iter.end().unwrap();

    // 16 full tiles, batches of 4
    assert_eq!(steps, 16);
    assert!(device.barrier_count() > 0);
    assert!(device.finish_count() >= 1);

    let mut data = vec![0u8; extent.area() as usize * 16];

    gpu.read(&buffer, extent, PixelFormat::RgbaF32, &mut data);

    assert_solid(&data, 0.5);
}

/// The point-filter shape: one cache texture covering the whole result,
/// produced on the device and served straight back by `cache_from`.
#[test]
fn full_roi_entry_serves_cache_from() {
    let (_, gpu) = engine();
    let roi = Rect::new(0, 0, 512, 512);
    let buffer = float_buffer(512, 512);
    let tex = gpu
        .cache_request(
            &buffer,
            MemAccess::READ_WRITE,
            PixelFormat::RgbaF32,
            roi,
            CacheMode::Dirty,
        )
        .unwrap();

    gpu.device()
        .write_image(&tex, (0, 0), (512, 512), 0, &solid(0.5, roi.area() as usize))
        .unwrap();

    let mut data = vec![0u8; roi.area() as usize * 16];

    assert!(gpu.cache_from(&buffer, roi, &mut data, PixelFormat::RgbaF32, None));
    assert_solid(&data, 0.5);

    // a contained read is served from the same entry
    let sub = Rect::new(64, 64, 256, 256);
    let mut sub_data = vec![0u8; sub.area() as usize * 16];

    assert!(gpu.cache_from(&buffer, sub, &mut sub_data, PixelFormat::RgbaF32, None));
    assert_solid(&sub_data, 0.5);
}

/// A dirty entry read back at its own rectangle does not flush unrelated
/// state: no queue drain, other buffers untouched.
#[test]
fn contained_hit_leaves_the_queue_alone() {
    let (device, gpu) = engine();
    let roi = Rect::new(0, 0, 256, 256);
    let buffer = float_buffer(512, 512);
    let bystander = float_buffer(512, 512);

    for (target, value) in [(&buffer, 0.5f32), (&bystander, 0.25f32)] {
        let tex = gpu
            .cache_request(
                target,
                MemAccess::READ_WRITE,
                PixelFormat::RgbaF32,
                roi,
                CacheMode::Dirty,
            )
            .unwrap();

        gpu.device()
            .write_image(&tex, (0, 0), (256, 256), 0, &solid(value, roi.area() as usize))
            .unwrap();
    }

    let finishes = device.finish_count();
    let mut data = vec![0u8; roi.area() as usize * 16];

    assert!(gpu.cache_from(&buffer, roi, &mut data, PixelFormat::RgbaF32, None));
    assert_eq!(device.finish_count(), finishes);
    assert_solid(&data, 0.5);

    // the bystander's dirty entry was not merged: its tile store still
    // reads zero
    let mut probe = vec![0u8; 16];

    bystander.get(Rect::new(0, 0, 1, 1), PixelFormat::RgbaF32, &mut probe, None);

    assert_eq!(color::decode_px(PixelFormat::RgbaF32, &probe)[0], 0.0);
}

/// Memory pressure merges and disposes the least recently used entry, then
/// the retried allocation succeeds.
#[test]
fn eviction_merges_the_lru_tail() {
    init_logging();

    // room for two 256x256 float textures
    let device = Arc::new(SoftDevice::with_mem_limit(2 * 256 * 256 * 16 + 4096));
    let gpu = Gpu::new(device.clone());
    let buffer = float_buffer(1024, 1024);
    let oldest = Rect::new(0, 0, 256, 256);

    let rects = [
        oldest,
        Rect::new(256, 0, 256, 256),
        Rect::new(512, 0, 256, 256),
    ];

    for (at, roi) in rects.iter().enumerate() {
        let tex = gpu
            .cache_request(
                &buffer,
                MemAccess::READ_WRITE,
                PixelFormat::RgbaF32,
                *roi,
                CacheMode::Dirty,
            )
            .unwrap();

        gpu.device()
            .write_image(
                &tex,
                (0, 0),
                (256, 256),
                0,
                &solid(0.1 * (at + 1) as f32, roi.area() as usize),
            )
            .unwrap();
    }

    // the first rectangle was evicted: gone from the cache, merged home
    assert!(gpu.cache_get(&buffer, oldest).is_none());
    assert!(gpu.cache_get(&buffer, rects[2]).is_some());
    assert!(device.finish_count() > 0);

    let mut data = vec![0u8; oldest.area() as usize * 16];

    buffer.get(oldest, PixelFormat::RgbaF32, &mut data, None);

    assert_solid(&data, 0.1);
}

/// Reading in a different registry format runs exactly one conversion pass.
#[test]
fn format_converted_read_uses_one_pass() {
    let (device, gpu) = engine();
    let roi = Rect::new(0, 0, 256, 256);
    let buffer = float_buffer(512, 512);
    let tex = gpu
        .cache_request(
            &buffer,
            MemAccess::READ_WRITE,
            PixelFormat::RgbaF32,
            roi,
            CacheMode::Dirty,
        )
        .unwrap();

    gpu.device()
        .write_image(&tex, (0, 0), (256, 256), 0, &solid(0.25, roi.area() as usize))
        .unwrap();

    let mut data = vec![0u8; roi.area() as usize * 16];

    assert!(gpu.cache_from(&buffer, roi, &mut data, PixelFormat::GammaRgbaF32, None));
    assert_eq!(device.convert_count(), 1);

    let decoded = color::decode_px(PixelFormat::GammaRgbaF32, &data);

    assert!((decoded[0] - 0.25).abs() < 1e-5);
}

/// Small reads never take the device path, whatever the cache holds.
#[test]
fn small_reads_miss_regardless_of_cache_state() {
    let (_, gpu) = engine();
    let buffer = float_buffer(512, 512);
    let tex = gpu
        .cache_request(
            &buffer,
            MemAccess::READ_WRITE,
            PixelFormat::RgbaF32,
            Rect::new(0, 0, 512, 512),
            CacheMode::Dirty,
        )
        .unwrap();

    gpu.device()
        .write_image(&tex, (0, 0), (512, 512), 0, &solid(0.5, 512 * 512))
        .unwrap();

    let roi = Rect::new(0, 0, 128, 128);
    let mut data = vec![0u8; roi.area() as usize * 16];

    assert!(!gpu.cache_from(&buffer, roi, &mut data, PixelFormat::RgbaF32, None));

    // but the miss merged the entry, so the coherent read sees the data
    gpu.read(&buffer, roi, PixelFormat::RgbaF32, &mut data);

    assert_solid(&data, 0.5);
}

/// Two scan-compatible streams walk the same four aligned steps.
#[test]
fn host_iteration_walks_aligned_pairs() {
    let (_, gpu) = engine();
    let src = float_buffer(256, 256);
    let dst = float_buffer(256, 256);
    let roi = Rect::new(0, 0, 256, 256);

    src.set(roi, PixelFormat::RgbaF32, &solid(0.5, roi.area() as usize), None);

    let mut iter = HostIterator::new(&gpu, &dst, Some(roi), None, Access::WRITE);
    let read = iter.add(&src, None, None, Access::READ);
    let mut steps = Vec::new();

    while iter.next() {
        assert_eq!(iter.length(), 128 * 128);

        steps.push(iter.roi(0));

        let (input, output) = iter.data_pair(read, 0);

        output.copy_from_slice(input);
    }

    assert_eq!(
        steps,
        vec![
            Rect::new(0, 0, 128, 128),
            Rect::new(128, 0, 128, 128),
            Rect::new(0, 128, 128, 128),
            Rect::new(128, 128, 128, 128),
        ]
    );

    let mut data = vec![0u8; roi.area() as usize * 16];

    dst.get(roi, PixelFormat::RgbaF32, &mut data, None);

    assert_solid(&data, 0.5);
}

/// Write then read an arbitrary rectangle in the same format; the bytes
/// survive the round trip exactly.
#[test]
fn round_trip_rectangles_are_exact() {
    init_logging();

    let device = Arc::new(SoftDevice::new());
    let gpu = Gpu::new(device);
    let buffer = RasterBuffer::new(BufferInfo::new(
        Rect::new(0, 0, 640, 640),
        PixelFormat::RgbaU8,
    ));
    let mut rng = StdRng::seed_from_u64(0x7113);

    for _ in 0..16 {
        let width = rng.gen_range(1..=320);
        let height = rng.gen_range(1..=320);
        let roi = Rect::new(
            rng.gen_range(0..=640 - width),
            rng.gen_range(0..=640 - height),
            width,
            height,
        );
        let len = roi.area() as usize * 4;
        let seed: Vec<u8> = (&mut rng).sample_iter(rand::distributions::Standard).take(len).collect();

        buffer.set(roi, PixelFormat::RgbaU8, &seed, None);

        let mut back = vec![0u8; len];

        gpu.read(&buffer, roi, PixelFormat::RgbaU8, &mut back);

        assert_eq!(seed, back);
    }
}

/// A device-side blend: out = in scaled by half, run over an unaligned
/// region so direct tiles, pooled edges and write allocation all engage.
#[test]
fn device_iteration_blends_unaligned_regions() {
    let (_, gpu) = engine();
    let src = float_buffer(512, 512);
    let dst = float_buffer(512, 512);
    let roi = Rect::new(64, 64, 320, 320);

    src.set(
        Rect::new(0, 0, 512, 512),
        PixelFormat::RgbaF32,
        &solid(0.8, 512 * 512),
        None,
    );

    let mut iter = GpuIterator::new(&gpu, &dst, Some(roi), None, Access::GPU_WRITE);
    let read = iter.add(&src, Some(roi), None, Access::GPU_READ);

    while iter.next().unwrap() {
        for k in 0..iter.n() {
            let (width, height) = iter.size(0, k);
            let len = (width * height) as usize * 16;
            let mut staged = vec![0u8; len];

            // stand-in for a kernel: halve every channel on the host side
            gpu.device()
                .read_image(iter.tex(read, k), (0, 0), (width, height), 0, &mut staged)
                .unwrap();

            for chunk in staged.chunks_exact_mut(16) {
                let mut px = color::decode_px(PixelFormat::RgbaF32, chunk);

                px = [px[0] * 0.5, px[1] * 0.5, px[2] * 0.5, px[3]];

                color::encode_px(PixelFormat::RgbaF32, px, chunk);
            }

            gpu.device()
                .write_image(iter.tex(0, k), (0, 0), (width, height), 0, &staged)
                .unwrap();
        }
    }

    iter.end().unwrap();

    let mut data = vec![0u8; roi.area() as usize * 16];

    gpu.read(&dst, roi, PixelFormat::RgbaF32, &mut data);

    for px in data.chunks_exact(16) {
        let decoded = color::decode_px(PixelFormat::RgbaF32, px);

        assert!((decoded[0] - 0.4).abs() < 1e-6);
        assert!((decoded[3] - 1.0).abs() < 1e-6);
    }
}

/// Clearing a region leaves nothing contained and nothing dirty across it.
#[test]
fn clear_scrubs_the_region() {
    let (_, gpu) = engine();
    let buffer = float_buffer(512, 512);
    let inside = Rect::new(0, 0, 128, 128);
    let straddle = Rect::new(192, 192, 128, 128);

    for roi in [inside, straddle] {
        let tex = gpu
            .cache_request(
                &buffer,
                MemAccess::READ_WRITE,
                PixelFormat::RgbaF32,
                roi,
                CacheMode::Dirty,
            )
            .unwrap();

        gpu.device()
            .write_image(&tex, (0, 0), (roi.width, roi.height), 0, &solid(0.5, roi.area() as usize))
            .unwrap();
    }

    gpu.cache_clear(&buffer, Rect::new(0, 0, 256, 256));

    assert!(gpu.cache_get(&buffer, inside).is_none());
    assert!(gpu.cache_get(&buffer, straddle).is_none());

    // the straddling entry was merged home before disposal
    let mut probe = vec![0u8; 16];

    buffer.get(Rect::new(200, 200, 1, 1), PixelFormat::RgbaF32, &mut probe, None);

    assert!((color::decode_px(PixelFormat::RgbaF32, &probe)[0] - 0.5).abs() < 1e-6);
}

/// After removing a buffer the cache holds nothing for it, and unrelated
/// buffers keep their entries.
#[test]
fn remove_forgets_a_buffer() {
    let (_, gpu) = engine();
    let buffer = float_buffer(512, 512);
    let other = float_buffer(512, 512);
    let roi = Rect::new(0, 0, 128, 128);

    for target in [&buffer, &other] {
        gpu.cache_request(
            target,
            MemAccess::READ_WRITE,
            PixelFormat::RgbaF32,
            roi,
            CacheMode::Clean,
        )
        .unwrap();
    }

    gpu.cache_remove(&buffer);

    assert!(gpu.cache_get(&buffer, roi).is_none());
    assert!(gpu.cache_get(&other, roi).is_some());
}
