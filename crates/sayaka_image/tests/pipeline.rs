//! End-to-end pipeline tests: bytes in, SIXEL out.

use std::io::Cursor;

use sayaka_image::{
    blurhash, bmp, loader, peek::PeekStream, preferred_size, reduct, sixel, ColorMode, ImageOpt,
    LoaderKind, ReadHint, ResizeAxis,
};

fn bmp_bytes(width: u32, height: u32, px: &[(u8, u8, u8)]) -> Vec<u8> {
    let mut buf = Vec::new();
    for &(r, g, b) in px {
        buf.extend_from_slice(&[r, g, b]);
    }
    let img = sayaka_image::Image::from_rgb24(width, height, buf);
    let mut out = Vec::new();
    bmp::bmp_write(&mut out, &img).unwrap();
    out
}

#[test]
fn white_bmp_to_sixel() {
    // The canonical smoke test: an all-white square reduced to the fixed
    // 8-color palette is a single run of palette entry 7.
    let bytes = bmp_bytes(8, 6, &[(255, 255, 255); 48]);
    let mut ps = PeekStream::new(Cursor::new(bytes));

    let kind = loader::sniff(&mut ps).unwrap().expect("bmp should match");
    assert_eq!(kind, LoaderKind::Bmp);
    let img = loader::read(&mut ps, kind, &ReadHint::default()).unwrap();
    assert_eq!((img.width, img.height), (8, 6));

    let opt = ImageOpt {
        color: ColorMode::Rgb8,
        ..Default::default()
    };
    let img16 = img.convert_to16();
    let reduced = reduct(&img16, 8, 6, &opt).unwrap();
    assert!(reduced.indexed().iter().all(|&v| v == 7));

    let mut out = Vec::new();
    sixel::sixel_write(&mut out, &reduced, &opt).unwrap();
    let s = String::from_utf8(out).unwrap();
    assert!(s.starts_with("\x1bP7;1;q\"1;1;8;6"));
    assert!(s.ends_with("\x1b\\"));
    assert!(s.contains("!8~"));
}

#[test]
fn resize_is_negotiated_from_decoded_size() {
    let px: Vec<(u8, u8, u8)> = (0..200)
        .map(|i| ((i % 256) as u8, (i * 2 % 256) as u8, (i * 3 % 256) as u8))
        .collect();
    let bytes = bmp_bytes(20, 10, &px);
    let mut ps = PeekStream::new(Cursor::new(bytes));
    let kind = loader::sniff(&mut ps).unwrap().unwrap();
    let img = loader::read(
        &mut ps,
        kind,
        &ReadHint {
            axis: ResizeAxis::Long,
            width: 10,
            height: 10,
            page: 0,
        },
    )
    .unwrap();

    // The loader is free to ignore the pixel hint; the caller recomputes.
    let (w, h) = preferred_size(img.width, img.height, ResizeAxis::Long, 10, 10);
    assert_eq!((w, h), (10, 5));

    let img16 = img.convert_to16();
    let reduced = reduct(&img16, w, h, &ImageOpt::default()).unwrap();
    assert_eq!(reduced.indexed().len(), 50);
    let n = reduced.palette_len() as u16;
    assert!(n >= 1);
    assert!(reduced.indexed().iter().all(|&v| (v & 0x7fff) < n));
}

#[test]
fn unknown_bytes_fall_back_to_blurhash() {
    // The sniffer table rejects it, the blurhash reader accepts it; this
    // mirrors the loader fallback order.
    let hash = "LEHV6nWB2yk8pyo0adR*.7kCMdnj";
    let mut ps = PeekStream::new(Cursor::new(hash.as_bytes().to_vec()));
    assert_eq!(loader::sniff(&mut ps).unwrap(), None);

    let mut r = ps.read_handle();
    let img = blurhash::read(&mut r, -20, -20).unwrap();
    assert_eq!((img.width, img.height), (80, 60));

    let img16 = img.convert_to16();
    let reduced = reduct(&img16, 80, 60, &ImageOpt::default()).unwrap();

    let mut out = Vec::new();
    let opt = ImageOpt::default();
    sixel::sixel_write(&mut out, &reduced, &opt).unwrap();
    assert!(out.starts_with(b"\x1bP7;1;q\"1;1;80;60"));
}

#[test]
fn ormode_with_adaptive_palette() {
    let px: Vec<(u8, u8, u8)> = (0..144)
        .map(|i| ((i * 5 % 256) as u8, (i * 11 % 256) as u8, (i * 17 % 256) as u8))
        .collect();
    let bytes = bmp_bytes(12, 12, &px);
    let mut ps = PeekStream::new(Cursor::new(bytes));
    let kind = loader::sniff(&mut ps).unwrap().unwrap();
    let img = loader::read(&mut ps, kind, &ReadHint::default()).unwrap();

    let opt = ImageOpt {
        color: ColorMode::Adaptive(16),
        output_ormode: true,
        ..Default::default()
    };
    let reduced = reduct(&img.convert_to16(), 12, 12, &opt).unwrap();
    assert!(reduced.palette_len() <= 16);

    let mut out = Vec::new();
    sixel::sixel_write(&mut out, &reduced, &opt).unwrap();
    let s = String::from_utf8(out).unwrap();
    // OR mode preamble and plane selectors are powers of two.
    assert!(s.starts_with("\x1bP7;5;q"));
    assert!(s.contains("#1"));
    // Two full 6-row bands.
    assert_eq!(s.matches('-').count(), 2);
}
