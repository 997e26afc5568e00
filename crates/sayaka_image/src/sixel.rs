//! SIXEL emission.
//!
//! Two modes share the preamble/palette/postamble framing. Normal mode
//! emits per-color horizontal spans inside each 6-row band; OR mode
//! transposes the band into bit planes and emits one `#(1<<p)` block per
//! plane, relying on the terminal OR-ing the planes together.

use std::fmt::Write as _;
use std::io::{self, Write};

use log::debug;

use crate::{Image, ImageOpt, Result};

/// Abort an in-flight SIXEL sequence cleanly (SIGINT handler path).
pub fn sixel_abort<W: Write>(w: &mut W) -> io::Result<()> {
    w.write_all(b"\x18\x1b\\")?;
    w.flush()
}

/// Encode `img` (AIDX16) to `w`. The caller flushes.
pub fn sixel_write<W: Write>(w: &mut W, img: &Image, opt: &ImageOpt) -> Result<()> {
    debug!(
        "sixel: source image ({}, {}) {} colors",
        img.width,
        img.height,
        img.palette_len()
    );

    preamble(w, img, opt)?;
    if opt.output_ormode {
        convert_ormode(w, img)?;
    } else {
        convert_normal(w, img)?;
    }
    w.write_all(b"\x1b\\")?;
    Ok(())
}

fn preamble<W: Write>(w: &mut W, img: &Image, opt: &ImageOpt) -> Result<()> {
    // ESC P <P1=7> ; <mode> ; q " 1 ; 1 ; <width> ; <height>
    // mode is 1 normally and 5 for OR mode.
    let mode = if opt.output_ormode { 5 } else { 1 };
    let mut head = format!("\x1bP7;{};q\"1;1;{};{}", mode, img.width, img.height);

    if !opt.suppress_palette {
        if let Some(palette) = &img.palette {
            // "#255;2;100;100;100", channels in percent.
            for (i, col) in palette.iter().enumerate() {
                let r = col.r as u32 * 100 / 255;
                let g = col.g as u32 * 100 / 255;
                let b = col.b as u32 * 100 / 255;
                let _ = write!(head, "#{};2;{};{};{}", i, r, g, b);
            }
        }
    }

    w.write_all(head.as_bytes())?;
    Ok(())
}

/// Append `n` repetitions of pattern `ptn`: literal up to 3, DECGRI beyond.
fn repunit(dst: &mut String, n: usize, ptn: u8) {
    let ch = (ptn + 0x3f) as char;
    if n >= 4 {
        let _ = write!(dst, "!{}{}", n, ch);
    } else {
        for _ in 0..n {
            dst.push(ch);
        }
    }
}

fn convert_normal<W: Write>(w: &mut W, img: &Image) -> Result<()> {
    let buf = img.indexed();
    let width = img.width as usize;
    let height = img.height as usize;
    let palcnt = img.palette_len();

    // Leftmost/rightmost occurrence per color within the current band.
    let mut min_x = vec![-1i32; palcnt];
    let mut max_x = vec![0i32; palcnt];
    let mut line = String::new();

    let mut y = 0;
    while y < height {
        min_x.fill(-1);
        max_x.fill(0);

        let max_dy = 6.min(height - y);

        for dy in 0..max_dy {
            for (x, &cc) in buf[(y + dy) * width..(y + dy) * width + width].iter().enumerate() {
                if cc & 0x8000 != 0 {
                    continue;
                }
                let cc = cc as usize;
                let x = x as i32;
                if min_x[cc] < 0 || min_x[cc] > x {
                    min_x[cc] = x;
                }
                if max_x[cc] < x {
                    max_x[cc] = x;
                }
            }
        }

        loop {
            // One `$` line: colors left to right, never backwards.
            let mut mx: i32 = -1;
            line.clear();

            loop {
                // Next color: smallest min_x beyond the current position.
                let mut min_color = 0usize;
                let mut min = i32::MAX;
                for (c, &mr) in min_x.iter().enumerate() {
                    if mx < mr && mr < min {
                        min_color = c;
                        min = mr;
                    }
                }
                if min_x[min_color] <= mx {
                    break;
                }

                line.push('#');
                let _ = write!(line, "{}", min_color);

                // Forward seek with blank pattern.
                let space = min_x[min_color] - (mx + 1);
                if space > 0 {
                    repunit(&mut line, space as usize, 0);
                }

                // Run-length encode the 6-bit columns of this color.
                let mut prev_t: u8 = 0;
                let mut n = 0usize;
                for x in min_x[min_color]..=max_x[min_color] {
                    let mut t: u8 = 0;
                    for dy in 0..max_dy {
                        let idx = buf[(y + dy) * width + x as usize];
                        if idx as usize == min_color {
                            t |= 1 << dy;
                        }
                    }
                    if prev_t != t {
                        if n > 0 {
                            repunit(&mut line, n, prev_t);
                        }
                        prev_t = t;
                        n = 1;
                    } else {
                        n += 1;
                    }
                }
                if prev_t != 0 && n > 0 {
                    repunit(&mut line, n, prev_t);
                }

                mx = max_x[min_color];
                min_x[min_color] = -1; // done
            }

            line.push('$');
            w.write_all(line.as_bytes())?;

            if mx == -1 {
                break;
            }
        }

        w.write_all(b"-")?;
        y += 6;
    }

    Ok(())
}

/// ceil(log2(n)), at least 1: the number of bit planes a palette needs.
fn plane_count(n: usize) -> usize {
    let mut i = 0;
    while i < 8 {
        if n <= (1 << i) {
            break;
        }
        i += 1;
    }
    i.max(1)
}

/// Nibble -> one byte per bit, bit 0 of each byte carrying the nibble bit.
/// Shifting the whole u32 left by y deposits a column of 6 rows in parallel.
static DEPTABLE: [u32; 16] = [
    0x00000000, 0x00000001, 0x00000100, 0x00000101, //
    0x00010000, 0x00010001, 0x00010100, 0x00010101, //
    0x01000000, 0x01000001, 0x01000100, 0x01000101, //
    0x01010000, 0x01010001, 0x01010100, 0x01010101,
];

fn convert_ormode<W: Write>(w: &mut W, img: &Image) -> Result<()> {
    let buf = img.indexed();
    let width = img.width as usize;
    let height = img.height as usize;
    let nplane = plane_count(img.palette_len());

    let mut sixelbuf = vec![0u8; width * nplane];
    let mut line = String::new();

    let mut y = 0usize;
    // Full bands first, then whatever remains (1..=6 rows).
    while (y as i64) < height as i64 - 6 {
        ormode_band(&mut line, &mut sixelbuf, &buf[y * width..], width, 6, nplane);
        w.write_all(line.as_bytes())?;
        y += 6;
    }
    ormode_band(&mut line, &mut sixelbuf, &buf[y * width..], width, height - y, nplane);
    w.write_all(line.as_bytes())?;

    Ok(())
}

/// Encode one band of up to 6 rows. `sixelbuf[x*nplane + p]` receives the
/// 6-bit column pattern of plane `p` at column `x`.
fn ormode_band(
    dst: &mut String,
    sixelbuf: &mut [u8],
    src: &[u16],
    width: usize,
    height: usize,
    nplane: usize,
) {
    dst.clear();

    // Transpose color bits into per-plane column patterns; DEPTABLE does a
    // nibble at a time.
    let mut buf = 0usize;
    for x in 0..width {
        let mut data0: u32 = 0;
        let mut data1: u32 = 0;
        for yy in 0..height {
            let cc = src[width * yy + x];
            if cc & 0x8000 == 0 && cc != 0 {
                data0 |= DEPTABLE[(cc & 0xf) as usize] << yy;
                data1 |= DEPTABLE[((cc >> 4) & 0xf) as usize] << yy;
            }
        }
        for p in 0..nplane.min(4) {
            sixelbuf[buf + p] = (data0 >> (8 * p)) as u8;
        }
        for p in 4..nplane {
            sixelbuf[buf + p] = (data1 >> (8 * (p - 4))) as u8;
        }
        buf += nplane;
    }

    for p in 0..nplane {
        dst.push('#');
        let _ = write!(dst, "{}", 1u32 << p);

        let mut rept = 1usize;
        let mut ptn = sixelbuf[p];
        for x in 1..width {
            let cur = sixelbuf[x * nplane + p];
            if ptn == cur {
                rept += 1;
            } else {
                repunit(dst, rept, ptn);
                rept = 1;
                ptn = cur;
            }
        }
        // A trailing zero run can simply be left out.
        if ptn != 0 {
            repunit(dst, rept, ptn);
        }
        dst.push('$');
    }

    // Rewrite the final carriage return into a new line.
    dst.pop();
    dst.push('-');
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{reduce, ColorMode, Image, ImageOpt};

    fn white(w: u32, h: u32) -> Image {
        let img = Image::from_rgb24(w, h, vec![255u8; (w * h * 3) as usize]).convert_to16();
        let opt = ImageOpt {
            color: ColorMode::Rgb8,
            ..Default::default()
        };
        reduce::reduct(&img, w, h, &opt).unwrap()
    }

    fn encode(img: &Image, opt: &ImageOpt) -> String {
        let mut out = Vec::new();
        sixel_write(&mut out, img, opt).unwrap();
        String::from_utf8(out).unwrap()
    }

    #[test]
    fn framing_and_preamble() {
        let img = white(8, 6);
        let s = encode(&img, &ImageOpt::default());
        assert!(s.starts_with("\x1bP7;1;q\"1;1;8;6"));
        assert!(s.ends_with("\x1b\\"));
        // Palette entry 7 is white, 100%.
        assert!(s.contains("#7;2;100;100;100"));
        // One full band: all six bits set, eight columns.
        assert!(s.contains("!8~"));
        assert_eq!(s.matches('-').count(), 1);
    }

    #[test]
    fn partial_band_emits_remaining_rows() {
        // 8 rows: a full band then a 2-row band (pattern 0b11 -> 'B').
        let img = white(8, 8);
        let s = encode(&img, &ImageOpt::default());
        assert!(s.contains("!8~"));
        assert!(s.contains("!8B"));
        assert_eq!(s.matches('-').count(), 2);
    }

    #[test]
    fn suppress_palette_omits_definitions() {
        let img = white(6, 6);
        let opt = ImageOpt {
            suppress_palette: true,
            ..Default::default()
        };
        let s = encode(&img, &opt);
        assert!(!s.contains(";2;"));
    }

    #[test]
    fn ormode_emits_one_block_per_plane() {
        // 256-entry palette forces 8 planes.
        let mut img = white(6, 6);
        let pal = vec![crate::ColorRgb::new(0, 0, 0); 256];
        img.palette = Some(std::borrow::Cow::Owned(pal));
        let opt = ImageOpt {
            output_ormode: true,
            ..Default::default()
        };
        let s = encode(&img, &opt);
        assert!(s.starts_with("\x1bP7;5;q"));
        for p in 0..8 {
            assert!(s.contains(&format!("#{}", 1u32 << p)), "plane {}", p);
        }
        // Planes end with $, the band ends with -.
        assert_eq!(s.matches('$').count(), 7);
        assert_eq!(s.matches('-').count(), 1);
    }

    #[test]
    fn plane_count_is_ceil_log2() {
        assert_eq!(plane_count(2), 1);
        assert_eq!(plane_count(3), 2);
        assert_eq!(plane_count(4), 2);
        assert_eq!(plane_count(16), 4);
        assert_eq!(plane_count(17), 5);
        assert_eq!(plane_count(256), 8);
    }

    #[test]
    fn abort_sequence() {
        let mut out = Vec::new();
        sixel_abort(&mut out).unwrap();
        assert_eq!(out, b"\x18\x1b\\");
    }
}
