//! Resize + color reduction.
//!
//! The reductor turns an ARGB16 image into an AIDX16 image of the requested
//! size, picking or deriving a palette according to [`ColorMode`]. SIMPLE is
//! nearest-neighbour sampling; HIGH_QUALITY averages the covered source
//! rectangle per destination pixel and runs two-dimensional error diffusion.

use std::borrow::Cow;

use log::debug;

use crate::buffer::rgb888_to_argb16;
use crate::octree::{self, AdaptiveFinder};
use crate::{ColorRgb, Image, ImageData, ImageError, PixelFormat, Rational, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReduceMethod {
    /// Nearest-neighbour pick.
    Simple,
    /// Area averaging plus error diffusion.
    #[default]
    HighQuality,
}

/// Error diffusion kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Diffusion {
    None,
    /// Sierra Filter Lite.
    #[default]
    Sfl,
    /// Floyd-Steinberg.
    Fs,
    Atkinson,
    /// Jarvis, Judice & Ninke.
    Jajuni,
    Stucki,
    Burkes,
    /// Two neighbours: right and down.
    Two,
    /// Three neighbours: right, down, right-down.
    Three,
    /// R, G and B residuals land on different neighbours.
    Rgb,
}

/// Palette family plus its size where variable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColorMode {
    /// N equally spaced grey levels, 2..=256.
    Gray(u16),
    /// The 8 RGB corner colors.
    Rgb8,
    /// ANSI 16 colors (VGA, with Yellow instead of Brown).
    Vga16,
    /// Fixed 256 colors with 3:3:2 channel bits.
    Rgb332,
    /// xterm-compatible 256 colors.
    Xterm256,
    /// Palette derived from the image, 8..=256 entries.
    Adaptive(u16),
}

impl ColorMode {
    pub fn is_adaptive(self) -> bool {
        matches!(self, ColorMode::Adaptive(_))
    }
}

impl std::fmt::Display for ColorMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ColorMode::Gray(n) => write!(f, "Gray{}", n),
            ColorMode::Rgb8 => write!(f, "8(RGB)"),
            ColorMode::Vga16 => write!(f, "16(ANSI VGA)"),
            ColorMode::Rgb332 => write!(f, "256(RGB332)"),
            ColorMode::Xterm256 => write!(f, "256(xterm)"),
            ColorMode::Adaptive(n) => write!(f, "Adaptive{}", n),
        }
    }
}

/// Parse a `--color` argument. Returns None for anything unrecognized.
pub fn parse_color(arg: &str) -> Option<ColorMode> {
    let dp = arg.find(|c: char| c.is_ascii_digit()).unwrap_or(arg.len());
    let (name, digits) = arg.split_at(dp);
    let num: Option<u32> = if digits.is_empty() {
        None
    } else {
        digits.parse().ok()
    };
    if digits.len() > 0 && num.is_none() {
        return None;
    }

    if name.is_empty() {
        match num? {
            2 => Some(ColorMode::Gray(2)),
            8 => Some(ColorMode::Rgb8),
            16 => Some(ColorMode::Vga16),
            256 => Some(ColorMode::Adaptive(256)),
            _ => None,
        }
    } else if arg == "fixed256" {
        Some(ColorMode::Rgb332)
    } else if arg == "xterm256" {
        Some(ColorMode::Xterm256)
    } else if name == "adaptive" {
        match num {
            None => Some(ColorMode::Adaptive(256)),
            Some(n) if (8..=256).contains(&n) => Some(ColorMode::Adaptive(n as u16)),
            Some(_) => None,
        }
    } else if name == "gray" || name == "grey" {
        match num {
            None => Some(ColorMode::Gray(256)),
            Some(n) if (2..=256).contains(&n) => Some(ColorMode::Gray(n as u16)),
            Some(_) => None,
        }
    } else {
        None
    }
}

/// Per-render configuration.
#[derive(Debug, Clone)]
pub struct ImageOpt {
    pub method: ReduceMethod,
    pub diffuse: Diffusion,
    pub color: ColorMode,
    /// Differential color attenuation, 0..=256. 0 disables.
    pub cdm: u32,
    /// Output gain, 0..512 where 256 is 1.0. Negative leaves levels alone.
    pub gain: i32,
    pub output_ormode: bool,
    pub output_transbg: bool,
    pub suppress_palette: bool,
}

impl Default for ImageOpt {
    fn default() -> Self {
        Self {
            method: ReduceMethod::HighQuality,
            diffuse: Diffusion::Sfl,
            color: ColorMode::Adaptive(256),
            cdm: 0,
            gain: -1,
            output_ormode: false,
            output_transbg: false,
            suppress_palette: false,
        }
    }
}

// Fixed palettes.

static PALETTE_FIXED8: [ColorRgb; 8] = [
    ColorRgb::new(0, 0, 0),
    ColorRgb::new(255, 0, 0),
    ColorRgb::new(0, 255, 0),
    ColorRgb::new(255, 255, 0),
    ColorRgb::new(0, 0, 255),
    ColorRgb::new(255, 0, 255),
    ColorRgb::new(0, 255, 255),
    ColorRgb::new(255, 255, 255),
];

// Standard VGA colors, except palette 4 is Yellow rather than Brown.
static PALETTE_VGA16: [ColorRgb; 16] = [
    ColorRgb::new(0, 0, 0),
    ColorRgb::new(170, 0, 0),
    ColorRgb::new(0, 170, 0),
    ColorRgb::new(170, 170, 0),
    ColorRgb::new(0, 0, 170),
    ColorRgb::new(170, 0, 170),
    ColorRgb::new(0, 170, 170),
    ColorRgb::new(170, 170, 170),
    ColorRgb::new(85, 85, 85),
    ColorRgb::new(255, 85, 85),
    ColorRgb::new(85, 255, 85),
    ColorRgb::new(255, 255, 85),
    ColorRgb::new(85, 85, 255),
    ColorRgb::new(255, 85, 255),
    ColorRgb::new(85, 255, 255),
    ColorRgb::new(255, 255, 255),
];

fn gray_palette(count: u16) -> Vec<ColorRgb> {
    (0..count as u32)
        .map(|i| {
            let v = (i * 255 / (count as u32 - 1)) as u8;
            ColorRgb::new(v, v, v)
        })
        .collect()
}

fn fixed256_palette() -> Vec<ColorRgb> {
    (0..256u32)
        .map(|i| {
            ColorRgb::new(
                (((i >> 5) & 0x07) * 255 / 7) as u8,
                (((i >> 2) & 0x07) * 255 / 7) as u8,
                ((i & 0x03) * 255 / 3) as u8,
            )
        })
        .collect()
}

fn xterm256_palette() -> Vec<ColorRgb> {
    let mut pal = PALETTE_VGA16.to_vec();
    // 6x6x6 cube; levels 00, 5f, 87, af, d7, ff (00 alone is off the line).
    for i in 0..216u32 {
        let ch = |v: u32| -> u8 {
            if v == 0 {
                0
            } else {
                (v * 0x28 + 0x37) as u8
            }
        };
        pal.push(ColorRgb::new(
            ch((i / 36) % 6),
            ch((i / 6) % 6),
            ch(i % 6),
        ));
    }
    for i in 0..24u32 {
        let v = (8 + i * 10) as u8;
        pal.push(ColorRgb::new(v, v, v));
    }
    pal
}

// Finders: map a color to a palette index.

enum Finder {
    Gray { count: u32 },
    Fixed8,
    Vga16,
    Fixed256,
    Xterm256,
    Adaptive(Box<AdaptiveFinder>),
}

impl Finder {
    fn find(&mut self, c: ColorRgb) -> u16 {
        match self {
            Finder::Gray { count } => {
                let count = *count;
                let i = (c.r as u32 * (count - 1) + 255 / count) / 255;
                i.min(count - 1) as u16
            }
            Finder::Fixed8 => {
                let r = (c.r >= 128) as u16;
                let g = (c.g >= 128) as u16;
                let b = (c.b >= 128) as u16;
                r | (g << 1) | (b << 2)
            }
            Finder::Vga16 => {
                let i = c.r as u32 + c.g as u32 + c.b as u32;
                if c.r >= 213 || c.g >= 213 || c.b >= 213 {
                    let r = (c.r >= 213) as u16;
                    let g = (c.g >= 213) as u16;
                    let b = (c.b >= 213) as u16;
                    if r == g && g == b {
                        if i >= 224 * 3 {
                            15
                        } else {
                            7
                        }
                    } else {
                        (r + (g << 1) + (b << 2)) | 8
                    }
                } else {
                    let r = (c.r >= 85) as u16;
                    let g = (c.g >= 85) as u16;
                    let b = (c.b >= 85) as u16;
                    if r == g && g == b {
                        if i >= 128 * 3 {
                            7
                        } else if i >= 42 * 3 {
                            8
                        } else {
                            0
                        }
                    } else {
                        r | (g << 1) | (b << 2)
                    }
                }
            }
            Finder::Fixed256 => {
                let r = (c.r >> 5) as u16;
                let g = (c.g >> 5) as u16;
                let b = (c.b >> 6) as u16;
                (r << 5) | (g << 2) | b
            }
            Finder::Xterm256 => {
                16 + xterm_channel(c.r) as u16 * 36
                    + xterm_channel(c.g) as u16 * 6
                    + xterm_channel(c.b) as u16
            }
            Finder::Adaptive(f) => f.find(c),
        }
    }
}

// Cube levels 00,5f,87,af,d7,ff; thresholds 2f,73,9b,bc,eb.
#[inline]
fn xterm_channel(c: u8) -> u8 {
    if c < 0x73 {
        if c < 0x2f {
            0
        } else {
            1
        }
    } else {
        2 + (c - 0x73) / 0x28
    }
}

#[inline]
fn saturate_u8(v: i32) -> u8 {
    v.clamp(0, 255) as u8
}

#[inline]
fn saturate_adderr(a: i16, b: i32) -> i16 {
    (a as i32 + b).clamp(-512, 511) as i16
}

#[inline]
fn gray_of(col: &mut [i32; 3]) {
    let y = (5 * col[0] + 9 * col[1] + 2 * col[2]) / 16;
    *col = [y, y, y];
}

const ERRBUF_LEFT: usize = 2;
const ERRBUF_RIGHT: usize = 2;
const ERRBUF_LINES: usize = 3;

/// Three-row ring of signed RGB residuals. The two-column margins let the
/// kernels write to x-2..x+2 without bounds checks.
struct ErrBuf {
    rows: [Vec<[i16; 3]>; ERRBUF_LINES],
}

impl ErrBuf {
    fn new(width: usize) -> Self {
        let row = vec![[0i16; 3]; width + ERRBUF_LEFT + ERRBUF_RIGHT];
        Self {
            rows: [row.clone(), row.clone(), row],
        }
    }

    #[inline]
    fn at(&self, row: usize, x: i32) -> [i16; 3] {
        self.rows[row][(x + ERRBUF_LEFT as i32) as usize]
    }

    /// rows[row][x] += dif * ratio / 256
    #[inline]
    fn add_scaled(&mut self, row: usize, x: i32, dif: &[i32; 3], ratio: i32) {
        let e = &mut self.rows[row][(x + ERRBUF_LEFT as i32) as usize];
        for ch in 0..3 {
            e[ch] = saturate_adderr(e[ch], dif[ch] * ratio / 256);
        }
    }

    /// rows[row][x] += dif >> shift
    #[inline]
    fn add_shift(&mut self, row: usize, x: i32, dif: &[i32; 3], shift: i32) {
        let e = &mut self.rows[row][(x + ERRBUF_LEFT as i32) as usize];
        for ch in 0..3 {
            e[ch] = saturate_adderr(e[ch], dif[ch] >> shift);
        }
    }

    /// Discard row 0, renumber, clear the new bottom row.
    fn rotate(&mut self) {
        self.rows.rotate_left(1);
        self.rows[ERRBUF_LINES - 1].fill([0; 3]);
    }
}

/// The stateful part of the high-quality path: error ring, attenuation
/// tracking, and the palette lookup.
struct HqFilter<'a> {
    errbuf: ErrBuf,
    /// Running attenuation level, starts fully open at 256.
    cdm_level: u32,
    prevcol: [i32; 3],
    opt: &'a ImageOpt,
    is_gray: bool,
    finder: Finder,
    palette: &'a [ColorRgb],
}

impl HqFilter<'_> {
    fn apply(&mut self, c: ColorRgb, x: i32) -> u16 {
        let mut col = [c.r as i32, c.g as i32, c.b as i32];

        let mut cdm = self.cdm_level;
        if self.opt.cdm != 0 {
            cdm /= 2;
            for ch in 0..3 {
                cdm = cdm.max(col[ch].abs_diff(self.prevcol[ch]));
            }
            cdm = (cdm + self.opt.cdm).min(256);
            self.cdm_level = cdm;
            self.prevcol = col;
        }

        let e = self.errbuf.at(0, x);
        for ch in 0..3 {
            col[ch] += e[ch] as i32;
        }

        if self.is_gray {
            gray_of(&mut col);
        }

        let c8 = ColorRgb::new(saturate_u8(col[0]), saturate_u8(col[1]), saturate_u8(col[2]));
        let code = self.finder.find(c8);

        let pal = self.palette[code as usize];
        let mut dif = [
            col[0] - pal.r as i32,
            col[1] - pal.g as i32,
            col[2] - pal.b as i32,
        ];
        if cdm != 256 {
            for d in &mut dif {
                *d = *d * cdm as i32 / 256;
            }
        }

        let eb = &mut self.errbuf;
        match self.opt.diffuse {
            Diffusion::None => {}
            Diffusion::Sfl => {
                eb.add_shift(0, x + 1, &dif, 1);
                eb.add_shift(1, x - 1, &dif, 2);
                eb.add_shift(1, x, &dif, 2);
            }
            Diffusion::Fs => {
                eb.add_scaled(0, x + 1, &dif, 112);
                eb.add_scaled(1, x - 1, &dif, 48);
                eb.add_scaled(1, x, &dif, 80);
                eb.add_scaled(1, x + 1, &dif, 16);
            }
            Diffusion::Atkinson => {
                eb.add_shift(0, x + 1, &dif, 3);
                eb.add_shift(0, x + 2, &dif, 3);
                eb.add_shift(1, x - 1, &dif, 3);
                eb.add_shift(1, x, &dif, 3);
                eb.add_shift(1, x + 1, &dif, 3);
                eb.add_shift(2, x, &dif, 3);
            }
            Diffusion::Jajuni => {
                eb.add_scaled(0, x + 1, &dif, 37);
                eb.add_scaled(0, x + 2, &dif, 27);
                eb.add_scaled(1, x - 2, &dif, 16);
                eb.add_scaled(1, x - 1, &dif, 27);
                eb.add_scaled(1, x, &dif, 37);
                eb.add_scaled(1, x + 1, &dif, 27);
                eb.add_scaled(1, x + 2, &dif, 16);
                eb.add_scaled(2, x - 2, &dif, 5);
                eb.add_scaled(2, x - 1, &dif, 16);
                eb.add_scaled(2, x, &dif, 27);
                eb.add_scaled(2, x + 1, &dif, 16);
                eb.add_scaled(2, x + 2, &dif, 5);
            }
            Diffusion::Stucki => {
                eb.add_scaled(0, x + 1, &dif, 43);
                eb.add_scaled(0, x + 2, &dif, 21);
                eb.add_scaled(1, x - 2, &dif, 11);
                eb.add_scaled(1, x - 1, &dif, 21);
                eb.add_scaled(1, x, &dif, 43);
                eb.add_scaled(1, x + 1, &dif, 21);
                eb.add_scaled(1, x + 2, &dif, 11);
                eb.add_scaled(2, x - 2, &dif, 5);
                eb.add_scaled(2, x - 1, &dif, 11);
                eb.add_scaled(2, x, &dif, 21);
                eb.add_scaled(2, x + 1, &dif, 11);
                eb.add_scaled(2, x + 2, &dif, 5);
            }
            Diffusion::Burkes => {
                eb.add_shift(0, x + 1, &dif, 2);
                eb.add_shift(0, x + 2, &dif, 3);
                eb.add_shift(1, x - 2, &dif, 4);
                eb.add_shift(1, x - 1, &dif, 3);
                eb.add_shift(1, x, &dif, 2);
                eb.add_shift(1, x + 1, &dif, 3);
                eb.add_shift(1, x + 2, &dif, 4);
            }
            Diffusion::Two => {
                eb.add_scaled(0, x + 1, &dif, 128);
                eb.add_scaled(1, x, &dif, 128);
            }
            Diffusion::Three => {
                eb.add_scaled(0, x + 1, &dif, 102);
                eb.add_scaled(1, x, &dif, 102);
                eb.add_scaled(1, x + 1, &dif, 51);
            }
            Diffusion::Rgb => {
                // The channels scatter to different cells. Intentional.
                let xi = (x + ERRBUF_LEFT as i32) as usize;
                let e0 = &mut eb.rows[0][xi];
                e0[0] = saturate_adderr(e0[0], dif[0]);
                let e1 = &mut eb.rows[1][xi];
                e1[2] = saturate_adderr(e1[2], dif[2]);
                let e1n = &mut eb.rows[1][xi + 1];
                e1n[1] = saturate_adderr(e1n[1], dif[1]);
            }
        }

        code
    }
}

/// Average the source rectangle X = [sx0, sx1), Y = [sy0, sy1), applying
/// gain on the way out. The alpha result is set when more than half of the
/// covered pixels are transparent.
#[inline]
fn pixel_mean(
    src: &[u16],
    src_width: usize,
    sy0: usize,
    sy1: usize,
    sx0: usize,
    sx1: usize,
    gain: i32,
) -> (ColorRgb, bool) {
    let mut r: u32 = 0;
    let mut g: u32 = 0;
    let mut b: u32 = 0;
    let mut a: u32 = 0;
    for sy in sy0..sy1 {
        for &v in &src[sy * src_width + sx0..sy * src_width + sx1] {
            a += (v >> 15) as u32;
            // Accumulate 5-bit channels; widen to 8 bits after the loop.
            r += ((v >> 10) & 0x1f) as u32;
            g += ((v >> 5) & 0x1f) as u32;
            b += (v & 0x1f) as u32;
        }
    }
    let area = ((sy1 - sy0) * (sx1 - sx0)) as u32;
    let mut r = ((r << 3) / area) as i32;
    let mut g = ((g << 3) / area) as i32;
    let mut b = ((b << 3) / area) as i32;

    if gain >= 0 {
        r = r * gain / 256;
        g = g * gain / 256;
        b = b * gain / 256;
    }

    (
        ColorRgb::new(saturate_u8(r), saturate_u8(g), saturate_u8(b)),
        a > area / 2,
    )
}

fn make_finder(color: ColorMode) -> (Finder, Cow<'static, [ColorRgb]>, bool) {
    match color {
        ColorMode::Gray(n) => (
            Finder::Gray { count: n as u32 },
            Cow::Owned(gray_palette(n)),
            true,
        ),
        ColorMode::Rgb8 => (Finder::Fixed8, Cow::Borrowed(&PALETTE_FIXED8[..]), false),
        ColorMode::Vga16 => (Finder::Vga16, Cow::Borrowed(&PALETTE_VGA16[..]), false),
        ColorMode::Rgb332 => (Finder::Fixed256, Cow::Owned(fixed256_palette()), false),
        ColorMode::Xterm256 => (Finder::Xterm256, Cow::Owned(xterm256_palette()), false),
        ColorMode::Adaptive(_) => unreachable!("adaptive palette is built per image"),
    }
}

/// Resize `src` to (dst_width, dst_height) while reducing it to the palette
/// selected by `opt`. `src` must already be ARGB16 (see
/// [`Image::convert_to16`]). Returns a new AIDX16 image.
pub fn reduct(src: &Image, dst_width: u32, dst_height: u32, opt: &ImageOpt) -> Result<Image> {
    let ImageData::Argb16(src_buf) = &src.data else {
        return Err(ImageError::FormatMismatch {
            expected: PixelFormat::Argb16,
        });
    };
    if dst_width == 0 || dst_height == 0 {
        return Err(ImageError::TooSmall {
            width: dst_width,
            height: dst_height,
        });
    }

    let dw = dst_width as usize;
    let dh = dst_height as usize;
    let sw = src.width as usize;

    let (buf, palette) = match (opt.method, opt.color) {
        (ReduceMethod::Simple, color) => {
            let (finder, palette) = match color {
                ColorMode::Adaptive(n) => {
                    let f = octree::build(src_buf, n as usize, opt.gain);
                    debug!(
                        "adaptive palette: {} source colors -> {} entries",
                        f.source_colors,
                        f.palette.len()
                    );
                    let pal = Cow::Owned(f.palette.clone());
                    (Finder::Adaptive(Box::new(f)), pal)
                }
                _ => {
                    let (f, p, _) = make_finder(color);
                    (f, p)
                }
            };
            let buf = reduct_simple(src_buf, sw, src.height as usize, dw, dh, opt, finder, &palette)?;
            (buf, palette)
        }
        (ReduceMethod::HighQuality, ColorMode::Adaptive(n)) => {
            reduct_hq_adaptive(src_buf, sw, src.height as usize, dw, dh, n as usize, opt)?
        }
        (ReduceMethod::HighQuality, color) => {
            let (finder, palette, is_gray) = make_finder(color);
            let buf = reduct_hq_fixed(
                src_buf,
                sw,
                src.height as usize,
                dw,
                dh,
                opt,
                finder,
                &palette,
                is_gray,
            )?;
            (buf, palette)
        }
    };

    Ok(Image {
        width: dst_width,
        height: dst_height,
        has_alpha: src.has_alpha,
        data: ImageData::Aidx16(buf),
        palette: Some(palette),
    })
}

#[allow(clippy::too_many_arguments)]
fn reduct_simple(
    src: &[u16],
    sw: usize,
    sh: usize,
    dw: usize,
    dh: usize,
    opt: &ImageOpt,
    mut finder: Finder,
    _palette: &[ColorRgb],
) -> Result<Vec<u16>> {
    let is_gray = matches!(opt.color, ColorMode::Gray(_));
    let mut dst = Vec::with_capacity(dw * dh);

    let mut ry = Rational::new(0, 0, dh as i32);
    let ystep = Rational::new(0, sh as i32, dh as i32);
    let xstep = Rational::new(0, sw as i32, dw as i32);
    for _y in 0..dh {
        let mut rx = Rational::new(0, 0, dw as i32);
        let row = &src[ry.i as usize * sw..];
        for _x in 0..dw {
            let v = row[rx.i as usize];
            let a = v >> 15;
            let mut col = [
                (((v >> 10) & 0x1f) << 3) as i32,
                (((v >> 5) & 0x1f) << 3) as i32,
                ((v & 0x1f) << 3) as i32,
            ];

            if opt.gain >= 0 {
                for ch in &mut col {
                    *ch = saturate_u8(*ch * opt.gain / 256) as i32;
                }
            }
            if is_gray {
                gray_of(&mut col);
            }
            let c8 = ColorRgb::new(saturate_u8(col[0]), saturate_u8(col[1]), saturate_u8(col[2]));
            let mut code = finder.find(c8);
            if a != 0 {
                code |= 0x8000;
            }
            dst.push(code);

            rx.add(&xstep);
        }
        ry.add(&ystep);
    }

    Ok(dst)
}

/// One loop step of the fraction iterator: take the current integer part,
/// advance, and widen empty spans so at least one source pixel contributes.
#[inline]
fn resize_step(r: &mut Rational, step: &Rational) -> (usize, usize) {
    let s0 = r.i as usize;
    r.add(step);
    let mut s1 = r.i as usize;
    if s0 == s1 {
        s1 += 1;
    }
    (s0, s1)
}

#[allow(clippy::too_many_arguments)]
fn reduct_hq_fixed(
    src: &[u16],
    sw: usize,
    sh: usize,
    dw: usize,
    dh: usize,
    opt: &ImageOpt,
    finder: Finder,
    palette: &[ColorRgb],
    is_gray: bool,
) -> Result<Vec<u16>> {
    let mut filter = HqFilter {
        errbuf: ErrBuf::new(dw),
        cdm_level: 256,
        prevcol: [0; 3],
        opt,
        is_gray,
        finder,
        palette,
    };

    let mut dst = Vec::with_capacity(dw * dh);
    let mut ry = Rational::new(0, 0, dh as i32);
    let ystep = Rational::new(0, sh as i32, dh as i32);
    let xstep = Rational::new(0, sw as i32, dw as i32);
    for _y in 0..dh {
        let (sy0, sy1) = resize_step(&mut ry, &ystep);
        let mut rx = Rational::new(0, 0, dw as i32);
        for x in 0..dw {
            let (sx0, sx1) = resize_step(&mut rx, &xstep);
            let (c8, alpha) = pixel_mean(src, sw, sy0, sy1.min(sh), sx0, sx1.min(sw), opt.gain);
            let mut v = filter.apply(c8, x as i32);
            if alpha {
                v |= 0x8000;
            }
            dst.push(v);
        }
        filter.errbuf.rotate();
    }

    Ok(dst)
}

fn reduct_hq_adaptive(
    src: &[u16],
    sw: usize,
    sh: usize,
    dw: usize,
    dh: usize,
    target: usize,
    opt: &ImageOpt,
) -> Result<(Vec<u16>, Cow<'static, [ColorRgb]>)> {
    // Pass 1: resize-average into an intermediate ARGB16 buffer. Gain is
    // applied here, so the palette pass below runs with gain off.
    let mut tmp = Vec::with_capacity(dw * dh);
    let mut ry = Rational::new(0, 0, dh as i32);
    let ystep = Rational::new(0, sh as i32, dh as i32);
    let xstep = Rational::new(0, sw as i32, dw as i32);
    for _y in 0..dh {
        let (sy0, sy1) = resize_step(&mut ry, &ystep);
        let mut rx = Rational::new(0, 0, dw as i32);
        for _x in 0..dw {
            let (sx0, sx1) = resize_step(&mut rx, &xstep);
            let (c8, alpha) = pixel_mean(src, sw, sy0, sy1.min(sh), sx0, sx1.min(sw), opt.gain);
            let mut v = rgb888_to_argb16(c8.r, c8.g, c8.b);
            if alpha {
                v |= 0x8000;
            }
            tmp.push(v);
        }
    }

    let adaptive = octree::build(&tmp, target, -1);
    debug!(
        "adaptive palette: {} resized colors -> {} entries",
        adaptive.source_colors,
        adaptive.palette.len()
    );
    let palette: Cow<'static, [ColorRgb]> = Cow::Owned(adaptive.palette.clone());

    // Pass 2: same-size diffusion pass over the intermediate.
    let mut filter = HqFilter {
        errbuf: ErrBuf::new(dw),
        cdm_level: 256,
        prevcol: [0; 3],
        opt,
        is_gray: false,
        finder: Finder::Adaptive(Box::new(adaptive)),
        palette: &palette,
    };

    let mut dst = Vec::with_capacity(dw * dh);
    for y in 0..dh {
        for x in 0..dw {
            let cc = tmp[y * dw + x];
            let c8 = ColorRgb::new(
                (((cc >> 10) & 0x1f) << 3) as u8,
                (((cc >> 5) & 0x1f) << 3) as u8,
                ((cc & 0x1f) << 3) as u8,
            );
            let mut v = filter.apply(c8, x as i32);
            if cc & 0x8000 != 0 {
                v |= 0x8000;
            }
            dst.push(v);
        }
        filter.errbuf.rotate();
    }

    Ok((dst, palette))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Image;

    fn rgb(w: u32, h: u32, px: &[(u8, u8, u8)]) -> Image {
        let mut buf = Vec::new();
        for &(r, g, b) in px {
            buf.extend_from_slice(&[r, g, b]);
        }
        Image::from_rgb24(w, h, buf).convert_to16()
    }

    #[test]
    fn parse_color_accepts_all_forms() {
        assert_eq!(parse_color("2"), Some(ColorMode::Gray(2)));
        assert_eq!(parse_color("8"), Some(ColorMode::Rgb8));
        assert_eq!(parse_color("16"), Some(ColorMode::Vga16));
        assert_eq!(parse_color("256"), Some(ColorMode::Adaptive(256)));
        assert_eq!(parse_color("gray"), Some(ColorMode::Gray(256)));
        assert_eq!(parse_color("grey16"), Some(ColorMode::Gray(16)));
        assert_eq!(parse_color("gray2"), Some(ColorMode::Gray(2)));
        assert_eq!(parse_color("adaptive"), Some(ColorMode::Adaptive(256)));
        assert_eq!(parse_color("adaptive64"), Some(ColorMode::Adaptive(64)));
        assert_eq!(parse_color("fixed256"), Some(ColorMode::Rgb332));
        assert_eq!(parse_color("xterm256"), Some(ColorMode::Xterm256));
        assert_eq!(parse_color("adaptive4"), None);
        assert_eq!(parse_color("gray1"), None);
        assert_eq!(parse_color("17"), None);
        assert_eq!(parse_color("bogus"), None);
    }

    #[test]
    fn white_maps_to_palette_corner() {
        let img = rgb(8, 8, &[(255, 255, 255); 64]);
        let opt = ImageOpt {
            color: ColorMode::Rgb8,
            ..Default::default()
        };
        let out = reduct(&img, 8, 8, &opt).unwrap();
        assert!(out.indexed().iter().all(|&v| v == 7));
        assert_eq!(out.palette_len(), 8);
    }

    #[test]
    fn gray_ramp_is_monotone() {
        let px: Vec<(u8, u8, u8)> = (0..=255u32).map(|x| (x as u8, x as u8, x as u8)).collect();
        let img = rgb(256, 1, &px);
        let opt = ImageOpt {
            color: ColorMode::Gray(16),
            diffuse: Diffusion::None,
            ..Default::default()
        };
        let out = reduct(&img, 256, 1, &opt).unwrap();
        let idx = out.indexed();
        assert!(idx.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(idx[0], 0);
        // The 5-bit internal form tops out at 248, one step short of the
        // last gray level.
        assert!(idx[255] >= 14 && idx[255] <= 15);
    }

    #[test]
    fn checkerboard_fs_gray2() {
        let img = rgb(2, 2, &[(0, 0, 0), (255, 255, 255), (255, 255, 255), (0, 0, 0)]);
        let opt = ImageOpt {
            color: ColorMode::Gray(2),
            diffuse: Diffusion::Fs,
            ..Default::default()
        };
        let out = reduct(&img, 2, 2, &opt).unwrap();
        assert_eq!(out.indexed(), &[0, 1, 1, 0]);
    }

    #[test]
    fn gray2_indices_are_binary() {
        let px: Vec<(u8, u8, u8)> = (0..64u32)
            .map(|i| ((i * 4) as u8, (i * 3) as u8, (i * 2) as u8))
            .collect();
        let img = rgb(8, 8, &px);
        let opt = ImageOpt {
            color: ColorMode::Gray(2),
            ..Default::default()
        };
        let out = reduct(&img, 8, 8, &opt).unwrap();
        assert_eq!(out.palette_len(), 2);
        assert!(out.indexed().iter().all(|&v| (v & 0x7fff) < 2));
    }

    #[test]
    fn reduct_is_deterministic() {
        let px: Vec<(u8, u8, u8)> = (0..256u32)
            .map(|i| ((i * 7 % 256) as u8, (i * 13 % 256) as u8, (i * 29 % 256) as u8))
            .collect();
        let img = rgb(16, 16, &px);
        let opt = ImageOpt {
            color: ColorMode::Adaptive(64),
            ..Default::default()
        };
        let a = reduct(&img, 10, 10, &opt).unwrap();
        let b = reduct(&img, 10, 10, &opt).unwrap();
        assert_eq!(a.indexed(), b.indexed());
        assert_eq!(a.palette, b.palette);
    }

    #[test]
    fn indices_stay_below_palette_len() {
        let px: Vec<(u8, u8, u8)> = (0..400u32)
            .map(|i| ((i % 256) as u8, (i * 3 % 256) as u8, (i * 5 % 256) as u8))
            .collect();
        let img = rgb(20, 20, &px);
        for color in [
            ColorMode::Gray(7),
            ColorMode::Rgb8,
            ColorMode::Vga16,
            ColorMode::Rgb332,
            ColorMode::Xterm256,
            ColorMode::Adaptive(32),
        ] {
            let opt = ImageOpt {
                color,
                ..Default::default()
            };
            let out = reduct(&img, 9, 9, &opt).unwrap();
            let n = out.palette_len() as u16;
            assert!(out.indexed().iter().all(|&v| (v & 0x7fff) < n), "{:?}", color);
        }
    }

    #[test]
    fn simple_method_downsamples() {
        let px: Vec<(u8, u8, u8)> = (0..16).map(|i| (i as u8 * 16, 0, 0)).collect();
        let img = rgb(4, 4, &px);
        let opt = ImageOpt {
            method: ReduceMethod::Simple,
            color: ColorMode::Vga16,
            ..Default::default()
        };
        let out = reduct(&img, 2, 2, &opt).unwrap();
        assert_eq!(out.indexed().len(), 4);
    }

    #[test]
    fn transparency_bit_survives() {
        let mut buf = Vec::new();
        for i in 0..4 {
            buf.extend_from_slice(&[200, 100, 50, if i % 2 == 0 { 0xff } else { 0x10 }]);
        }
        let img = Image::from_argb32(2, 2, buf).convert_to16();
        let opt = ImageOpt {
            color: ColorMode::Vga16,
            ..Default::default()
        };
        let out = reduct(&img, 2, 2, &opt).unwrap();
        let idx = out.indexed();
        assert_eq!(idx[0] & 0x8000, 0);
        assert_eq!(idx[1] & 0x8000, 0x8000);
    }
}
