//! Blurhash decoding.
//!
//! A blurhash is a short base83 string holding quantized DCT coefficients;
//! decoding evaluates the cosine bases at every output pixel. Input is text,
//! so this is not part of the binary sniffer table; it is tried last, and
//! the client reaches it directly through `blurhash://` URLs.

use std::io::Read;

use crate::{Image, ImageError, Result};

const L2SRGB_SIZE: usize = 64;

#[derive(Clone, Copy, Default)]
struct ColorF {
    r: f32,
    g: f32,
    b: f32,
}

/// True if `src` looks like a complete blurhash string: the size flag must
/// be consistent with the total length.
pub fn looks_like_blurhash(src: &str) -> bool {
    let src = src.trim_end_matches(['\r', '\n']);
    let Some(comp) = decode83(src, 0, 1) else {
        return false;
    };
    let compx = (comp % 9) + 1;
    let compy = (comp / 9) + 1;
    src.len() as u32 == compx * compy * 2 + 4
}

/// Decode a blurhash into an RGB24 image.
///
/// `req_w`/`req_h` choose the output size: positive values are exact pixel
/// counts, negative values scale the component count (so `-20` makes a
/// 1..9 component hash 20..180 px wide). The hash itself carries no aspect
/// information beyond the component grid.
pub fn read<R: Read>(reader: &mut R, req_w: i32, req_h: i32) -> Result<Image> {
    let mut text = String::new();
    reader.take(4096).read_to_string(&mut text)?;
    let src = text.lines().next().unwrap_or("");
    decode(src, req_w, req_h)
}

pub fn decode(src: &str, req_w: i32, req_h: i32) -> Result<Image> {
    let src = src.trim_end_matches(['\r', '\n']);
    let comp = decode83(src, 0, 1).ok_or(ImageError::BadBlurhash)?;
    let compx = (comp % 9) + 1;
    let compy = (comp / 9) + 1;
    if src.len() as u32 != compx * compy * 2 + 4 {
        return Err(ImageError::BadBlurhash);
    }

    let (width, height) = if req_w > 0 && req_h > 0 {
        (req_w as u32, req_h as u32)
    } else {
        let sx = if req_w < 0 { (-req_w) as u32 } else { 1 };
        let sy = if req_h < 0 { (-req_h) as u32 } else { 1 };
        (compx * sx, compy * sy)
    };

    let maxvalue = decode_maxac(decode83(src, 1, 1).ok_or(ImageError::BadBlurhash)?);

    let mut values = Vec::with_capacity((compx * compy) as usize);
    values.push(decode_dc(decode83(src, 2, 4).ok_or(ImageError::BadBlurhash)?));
    let mut pos = 6;
    while pos < src.len() as u32 {
        let q = decode83(src, pos, 2).ok_or(ImageError::BadBlurhash)?;
        let qr = q / (19 * 19);
        let qg = (q / 19) % 19;
        let qb = q % 19;
        values.push(ColorF {
            r: decode_acq(qr) * maxvalue,
            g: decode_acq(qg) * maxvalue,
            b: decode_acq(qb) * maxvalue,
        });
        pos += 2;
    }

    let bases_x = bases_for(width, compx);
    let bases_y = bases_for(height, compy);

    let mut buf = Vec::with_capacity(width as usize * height as usize * 3);
    for y in 0..height as usize {
        for x in 0..width as usize {
            let mut c = ColorF::default();
            for ny in 0..compy as usize {
                for nx in 0..compx as usize {
                    let base = bases_x[x * compx as usize + nx] * bases_y[y * compy as usize + ny];
                    let v = &values[ny * compx as usize + nx];
                    c.r += v.r * base;
                    c.g += v.g * base;
                    c.b += v.b * base;
                }
            }
            buf.push(linear2srgb(c.r));
            buf.push(linear2srgb(c.g));
            buf.push(linear2srgb(c.b));
        }
    }

    Ok(Image::from_rgb24(width, height, buf))
}

/// Decode `len` base83 digits starting at `pos`. `len` is 1, 2 or 4 so the
/// result always fits in u32.
fn decode83(src: &str, pos: u32, len: u32) -> Option<u32> {
    let bytes = src.as_bytes();
    let mut val: u32 = 0;
    for i in 0..len {
        let c = *bytes.get((pos + i) as usize)? as usize;
        let c = c.checked_sub(0x20)?;
        if c >= 0x60 {
            return None;
        }
        let d = TABLE_BASE83[c];
        if d == 0xff {
            return None;
        }
        val = val * 83 + d as u32;
    }
    Some(val)
}

fn decode_dc(val: u32) -> ColorF {
    ColorF {
        r: srgb2linear((val >> 16) as i32),
        g: srgb2linear(((val >> 8) & 0xff) as i32),
        b: srgb2linear((val & 0xff) as i32),
    }
}

fn decode_acq(val: u32) -> f32 {
    let ival = val as i32 - 9;
    (ival * ival.abs()) as f32 / 81.0
}

fn decode_maxac(ival: u32) -> f32 {
    (ival + 1) as f32 / 166.0
}

fn srgb2linear(ival: i32) -> f32 {
    if ival <= 0 {
        return 0.0;
    }
    if ival >= 255 {
        return 255.0;
    }
    let v = ival as f32 / 255.0;
    if v < 0.04045 {
        v / 12.92
    } else {
        ((v + 0.055) / 1.055).powf(2.4)
    }
}

fn linear2srgb(val: f32) -> u8 {
    if val <= 0.0 {
        return 0;
    }
    if val >= 1.0 {
        return 255;
    }
    TABLE_L2SRGB[(val * L2SRGB_SIZE as f32) as usize]
}

/// Cosine bases for one axis. Only the c == 1 column needs cos(); higher
/// components are a modular reindexing of it.
fn bases_for(pixels: u32, comp: u32) -> Vec<f32> {
    let pixels = pixels as usize;
    let comp = comp as usize;
    let mut bases = vec![0.0f32; pixels * comp];

    if comp < 1 {
        return bases;
    }
    for x in 0..pixels {
        bases[x * comp] = 1.0;
    }
    if comp < 2 {
        return bases;
    }

    let scale = std::f32::consts::PI / pixels as f32;
    for x in 0..pixels {
        bases[x * comp + 1] = (scale * x as f32).cos();
    }
    for x in 0..pixels {
        for c in 2..comp {
            let mut t = (c * x) % (2 * pixels);
            if t < pixels {
                bases[x * comp + c] = bases[t * comp + 1];
            } else {
                t -= pixels;
                bases[x * comp + c] = -bases[t * comp + 1];
            }
        }
    }
    bases
}

static TABLE_L2SRGB: [u8; L2SRGB_SIZE] = [
    0, 34, 49, 61, 71, 79, 86, 93, //
    99, 105, 110, 115, 120, 124, 129, 133, //
    137, 141, 145, 148, 152, 155, 158, 162, //
    165, 168, 171, 174, 177, 179, 182, 185, //
    188, 190, 193, 195, 198, 200, 202, 205, //
    207, 209, 212, 214, 216, 218, 220, 223, //
    225, 227, 229, 231, 233, 235, 237, 239, //
    240, 242, 244, 246, 248, 250, 251, 253,
];

/// Base83 digit values for '\x20'..'\x7f'; 0xff marks invalid characters.
static TABLE_BASE83: [u8; 0x60] = [
    0xff, 0xff, 0xff, 0x3e, 0x3f, 0x40, 0xff, 0xff, //
    0xff, 0xff, 0x41, 0x42, 0x43, 0x44, 0x45, 0xff, //
    0x00, 0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, //
    0x08, 0x09, 0x46, 0x47, 0xff, 0x48, 0xff, 0x49, //
    0x4a, 0x0a, 0x0b, 0x0c, 0x0d, 0x0e, 0x0f, 0x10, //
    0x11, 0x12, 0x13, 0x14, 0x15, 0x16, 0x17, 0x18, //
    0x19, 0x1a, 0x1b, 0x1c, 0x1d, 0x1e, 0x1f, 0x20, //
    0x21, 0x22, 0x23, 0x4b, 0xff, 0x4c, 0x4d, 0x4e, //
    0xff, 0x24, 0x25, 0x26, 0x27, 0x28, 0x29, 0x2a, //
    0x2b, 0x2c, 0x2d, 0x2e, 0x2f, 0x30, 0x31, 0x32, //
    0x33, 0x34, 0x35, 0x36, 0x37, 0x38, 0x39, 0x3a, //
    0x3b, 0x3c, 0x3d, 0x4f, 0x50, 0x51, 0x52, 0xff,
];

#[cfg(test)]
mod tests {
    use super::*;

    // A well-known sample hash (4x3 components).
    const SAMPLE: &str = "LEHV6nWB2yk8pyo0adR*.7kCMdnj";

    #[test]
    fn sample_matches() {
        assert!(looks_like_blurhash(SAMPLE));
        assert!(!looks_like_blurhash("LEHV6nWB"));
        assert!(!looks_like_blurhash(""));
    }

    #[test]
    fn decode_scales_by_component_count() {
        let img = decode(SAMPLE, -20, -20).unwrap();
        assert_eq!((img.width, img.height), (80, 60));
        let img = decode(SAMPLE, 32, 16).unwrap();
        assert_eq!((img.width, img.height), (32, 16));
        assert_eq!(img.byte_len(), 32 * 16 * 3);
    }

    #[test]
    fn bad_characters_are_rejected() {
        assert!(decode("\u{3042}aaa", -1, -1).is_err());
    }
}
