//! Once-configured settings and the recomputable screen geometry.

use std::path::PathBuf;
use std::time::Duration;

use log::debug;
use sayaka_image::{ColorMode, ImageOpt};

use crate::terminal;

pub const DEFAULT_FONT_WIDTH: u32 = 7;
pub const DEFAULT_FONT_HEIGHT: u32 = 14;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BgTheme {
    Dark,
    Light,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Nsfw {
    /// Skip the whole note when any attachment is sensitive.
    Hide,
    /// Show only the MIME type.
    Alt,
    /// Render the blurhash.
    Blur,
    /// Render the real thumbnail.
    Show,
}

pub struct Config {
    /// Text color mode: 1, 2, 8, 16 or 256.
    pub colormode: u32,
    /// Color mode name used in cache file names.
    pub colorname: String,
    pub bgtheme: BgTheme,
    pub eaw_a: u32,
    pub eaw_n: u32,
    pub nsfw: Nsfw,
    pub show_cw: bool,
    pub show_image: bool,
    /// Max images per row; 0 means as many as fit.
    pub max_image_cols: u32,
    pub overwrite_cache: bool,
    pub record_file: Option<PathBuf>,
    pub imageopt: ImageOpt,
    pub image_timeout: Duration,
    pub font_override: Option<(u32, u32)>,
}

/// Cache file color-mode name.
pub fn colorname_of(color: ColorMode) -> String {
    match color {
        ColorMode::Gray(2) => "2".into(),
        ColorMode::Gray(n) => format!("gray{}", n),
        ColorMode::Rgb8 => "8".into(),
        ColorMode::Vga16 => "16".into(),
        ColorMode::Rgb332 => "fixed256".into(),
        ColorMode::Xterm256 => "xterm256".into(),
        ColorMode::Adaptive(_) => "256".into(),
    }
}

/// Geometry derived from the terminal; recomputed on SIGWINCH.
#[derive(Debug, Clone, Copy)]
pub struct Screen {
    pub cols: u32,
    pub font_w: u32,
    pub font_h: u32,
    /// Avatar square, in pixels.
    pub icon_size: u32,
    /// Attachment long-axis size, in pixels.
    pub image_size: u32,
    /// Columns per indent level.
    pub indent_cols: u32,
}

impl Screen {
    pub fn probe(font_override: Option<(u32, u32)>) -> Self {
        let ws = terminal::window_size();

        let cols = ws.map_or(0, |(c, _, _, _)| c);
        let ws_font_w = ws
            .filter(|&(c, _, _, _)| c != 0)
            .map_or(0, |(c, _, xp, _)| xp / c);
        let ws_font_h = ws
            .filter(|&(_, r, _, _)| r != 0)
            .map_or(0, |(_, r, _, yp)| yp / r);

        let font_w = match font_override {
            Some((w, _)) if w > 0 => w,
            _ if ws_font_w > 0 => ws_font_w,
            _ => DEFAULT_FONT_WIDTH,
        };
        let font_h = match font_override {
            Some((_, h)) if h > 0 => h,
            _ if ws_font_h > 0 => ws_font_h,
            _ => DEFAULT_FONT_HEIGHT,
        };

        Self::from_metrics(cols, font_w, font_h)
    }

    fn from_metrics(cols: u32, font_w: u32, font_h: u32) -> Self {
        // SIXEL scrolling leaves the cursor on the row after the last
        // raster on some terminals and on the row containing it on others;
        // an icon between two and three rows tall, rounded to a multiple
        // of six, works on both.
        let icon_size = (font_h * 3 - 1) / 6 * 6;
        let image_size = (font_h * 9 - 1) / 6 * 6;
        let indent_cols = icon_size / font_w + 1;
        let s = Self {
            cols,
            font_w,
            font_h,
            icon_size,
            image_size,
            indent_cols,
        };
        debug!(
            "screen: cols={} font={}x{} icon={} image={} indent={}",
            cols, font_w, font_h, icon_size, image_size, indent_cols
        );
        s
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn geometry_follows_font_height() {
        let s = Screen::from_metrics(80, 7, 14);
        assert_eq!(s.icon_size, 36);
        assert_eq!(s.image_size, 120);
        assert_eq!(s.indent_cols, 6);
    }

    #[test]
    fn colornames() {
        use sayaka_image::ColorMode;
        assert_eq!(colorname_of(ColorMode::Gray(2)), "2");
        assert_eq!(colorname_of(ColorMode::Gray(16)), "gray16");
        assert_eq!(colorname_of(ColorMode::Adaptive(256)), "256");
        assert_eq!(colorname_of(ColorMode::Vga16), "16");
    }
}
