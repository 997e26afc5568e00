//! ASCII-mosaic output: one background-colored space per pixel.

use std::io::Write;

use crate::{ColorMode, Image, ImageOpt, Result};

/// Write `img` (AIDX16, one pixel per character cell) as colored spaces.
pub fn ascii_write<W: Write>(w: &mut W, img: &Image, opt: &ImageOpt) -> Result<()> {
    let buf = img.indexed();
    let width = img.width as usize;
    let palette = img.palette.as_deref().unwrap_or(&[]);

    for row in buf.chunks_exact(width) {
        let mut prev: i32 = -1;
        for &v in row {
            let cc = if v & 0x8000 != 0 { -1 } else { v as i32 };
            if cc != prev {
                if cc < 0 {
                    // Transparent: reset the color, emit a bare space.
                    w.write_all(b"\x1b[m")?;
                } else if opt.color == ColorMode::Xterm256 {
                    // Palette indices are the terminal's own color codes.
                    if cc < 8 {
                        write!(w, "\x1b[4{}m", cc)?;
                    } else {
                        write!(w, "\x1b[48;5;{}m", cc)?;
                    }
                } else {
                    let c = palette[cc as usize];
                    write!(w, "\x1b[48;2;{};{};{}m", c.r, c.g, c.b)?;
                }
                prev = cc;
            }
            w.write_all(b" ")?;
        }
        w.write_all(b"\x1b[m\n")?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{reduce, ColorMode, ImageOpt};

    #[test]
    fn one_line_per_row_with_reset() {
        let img = Image::from_rgb24(3, 2, vec![255u8; 3 * 2 * 3]).convert_to16();
        let opt = ImageOpt {
            color: ColorMode::Rgb8,
            ..Default::default()
        };
        let img = reduce::reduct(&img, 3, 2, &opt).unwrap();
        let mut out = Vec::new();
        ascii_write(&mut out, &img, &opt).unwrap();
        let s = String::from_utf8(out).unwrap();
        assert_eq!(s.lines().count(), 2);
        // White background, three cells, reset at end of line.
        assert!(s.starts_with("\x1b[48;2;255;255;255m   \x1b[m\n"));
    }
}
