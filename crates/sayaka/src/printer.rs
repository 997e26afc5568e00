//! Column-aware text output and the image display path.
//!
//! The rich-text renderer produces code-point arrays with embedded escape
//! sequences; this module measures display width (East Asian Width aware),
//! wraps, indents, and drives the cache -> fetch -> decode -> reduce ->
//! SIXEL pipeline for avatars and attachments.

use std::io::{Cursor, Write};
use std::sync::atomic::Ordering;

use log::{debug, warn};
use unicode_width::UnicodeWidthChar;

use sayaka_image::{blurhash, loader, peek::PeekStream, reduce, sixel, ResizeAxis};

use crate::terminal::IN_SIXEL;
use crate::App;

fn char_width(c: char, eaw_a: u32) -> usize {
    if eaw_a >= 2 {
        c.width_cjk().unwrap_or(0)
    } else {
        c.width().unwrap_or(0)
    }
}

/// Move right to the given indent level.
pub fn print_indent<W: Write>(out: &mut W, level: u32, indent_cols: u32) {
    let n = level * indent_cols;
    if n > 0 {
        let _ = write!(out, "\x1b[{}C", n);
    }
}

/// Print a styled code-point array with indentation and wrapping. Escape
/// sequences pass through without contributing to the column count. Does
/// not emit a trailing newline.
pub fn iprint(app: &App, chars: &[char]) {
    let stdout = std::io::stdout();
    let mut out = stdout.lock();

    let indent = app.indent_depth * app.screen.indent_cols;
    let limit = if app.screen.cols > indent {
        (app.screen.cols - indent) as usize
    } else {
        0
    };

    print_indent(&mut out, app.indent_depth, app.screen.indent_cols);
    let mut col = 0usize;
    let mut it = chars.iter().copied().peekable();
    while let Some(c) = it.next() {
        if c == '\x1b' {
            // Copy the whole escape sequence; CSI ends at the final byte.
            let mut esc = String::from(c);
            if let Some(&n) = it.peek() {
                esc.push(n);
                it.next();
                if n == '[' {
                    while let Some(&p) = it.peek() {
                        esc.push(p);
                        it.next();
                        if ('\u{40}'..='\u{7e}').contains(&p) {
                            break;
                        }
                    }
                }
            }
            let _ = out.write_all(esc.as_bytes());
            continue;
        }
        if c == '\n' {
            let _ = out.write_all(b"\n");
            print_indent(&mut out, app.indent_depth, app.screen.indent_cols);
            col = 0;
            continue;
        }
        let w = char_width(c, app.cfg.eaw_a);
        if limit > 0 && col + w > limit {
            let _ = out.write_all(b"\n");
            print_indent(&mut out, app.indent_depth, app.screen.indent_cols);
            col = 0;
        }
        let mut buf = [0u8; 4];
        let _ = out.write_all(c.encode_utf8(&mut buf).as_bytes());
        col += w;
    }
    let _ = out.flush();
}

/// Produce (or reuse) the SIXEL for `url` and write it to the terminal.
///
/// `index` is the attachment position within the note, or -1 for the
/// avatar (whose cursor handling belongs to the caller). Returns false
/// when nothing was drawn so the caller can print a fallback.
pub async fn show_image(
    app: &mut App,
    cache_name: &str,
    url: &str,
    width: u32,
    height: u32,
    shade: bool,
    index: i32,
) -> bool {
    if !app.cfg.show_image {
        return false;
    }

    let path = app.cache.path_for(cache_name);

    let mut data: Option<Vec<u8>> = None;
    if !app.cfg.overwrite_cache {
        if let Ok(bytes) = std::fs::read(&path) {
            debug!("cache hit {}", path.display());
            data = Some(bytes);
        }
    }

    let data = match data {
        Some(d) => d,
        None => match render_image(app, url, width, height, shade).await {
            Some(d) => {
                // Write-then-rename so a concurrent reader never sees a
                // half-written cache file.
                let tmp = path.with_extension("tmp");
                if let Err(e) = std::fs::write(&tmp, &d)
                    .and_then(|_| std::fs::rename(&tmp, &path))
                {
                    warn!("{}: {}", path.display(), e);
                }
                d
            }
            None => return false,
        },
    };

    let Some((px_w, px_h)) = crate::cache::sixel_size(&data) else {
        warn!("{}: not a sixel cache", path.display());
        return false;
    };
    let img_cols = px_w.div_ceil(app.screen.font_w.max(1));
    let img_rows = px_h.div_ceil(app.screen.font_h.max(1));

    let stdout = std::io::stdout();
    let mut out = stdout.lock();

    if index >= 0 {
        // Attachments flow left to right until the row or the configured
        // column budget is exhausted.
        let indent = (app.indent_depth + 1) * app.screen.indent_cols;
        let fits = app.image_count > 0
            && (app.cfg.max_image_cols == 0 || app.image_count < app.cfg.max_image_cols)
            && app.screen.cols > 0
            && indent + app.image_next_cols + img_cols <= app.screen.cols;
        if fits {
            // Back up beside the previous image.
            let _ = write!(out, "\x1b[{}A\r", app.image_max_rows);
            let _ = write!(out, "\x1b[{}C", indent + app.image_next_cols);
        } else {
            app.image_count = 0;
            app.image_next_cols = 0;
            app.image_max_rows = 0;
        }
    }

    IN_SIXEL.store(true, Ordering::Relaxed);
    let ok = out.write_all(&data).is_ok() && out.flush().is_ok();
    IN_SIXEL.store(false, Ordering::Relaxed);

    if index >= 0 {
        app.image_count += 1;
        app.image_next_cols += img_cols + 1;
        app.image_max_rows = app.image_max_rows.max(img_rows);
    }
    ok
}

/// Fetch and encode one image; None skips it (caller prints the fallback).
async fn render_image(
    app: &App,
    url: &str,
    width: u32,
    height: u32,
    shade: bool,
) -> Option<Vec<u8>> {
    let src = if let Some(hash) = url.strip_prefix("blurhash://") {
        match blurhash::decode(hash, width as i32, height as i32) {
            Ok(img) => img,
            Err(e) => {
                warn!("blurhash: {}", e);
                return None;
            }
        }
    } else {
        let bytes = match crate::fetch::fetch(&app.http, url, app.cfg.image_timeout).await {
            Ok(b) => b,
            Err(e) => {
                warn!("{}", e);
                return None;
            }
        };
        let mut ps = PeekStream::new(Cursor::new(bytes));
        let kind = match loader::sniff(&mut ps) {
            Ok(Some(kind)) => kind,
            Ok(None) => {
                warn!("{}: unknown image format", url);
                return None;
            }
            Err(e) => {
                warn!("{}: {}", url, e);
                return None;
            }
        };
        let hint = loader::ReadHint {
            axis: ResizeAxis::ScaledownLong,
            width,
            height,
            page: 0,
        };
        match loader::read(&mut ps, kind, &hint) {
            Ok(img) => img,
            Err(e) => {
                warn!("{}: {}", url, e);
                return None;
            }
        }
    };

    let (dst_w, dst_h) = sayaka_image::preferred_size(
        src.width,
        src.height,
        ResizeAxis::ScaledownLong,
        width,
        height,
    );
    if dst_w == 0 || dst_h == 0 {
        warn!("{}: output size ({}, {}) is too small", url, dst_w, dst_h);
        return None;
    }

    let src = src.convert_to16();
    let mut opt = app.cfg.imageopt.clone();
    if shade {
        // Sensitive previews are dimmed rather than hidden.
        opt.gain = 128;
    }
    let reduced = match reduce::reduct(&src, dst_w, dst_h, &opt) {
        Ok(img) => img,
        Err(e) => {
            warn!("reductor failed: {}", e);
            return None;
        }
    };

    let mut sixel_data = Vec::new();
    if let Err(e) = sixel::sixel_write(&mut sixel_data, &reduced, &opt) {
        warn!("sixel: {}", e);
        return None;
    }
    Some(sixel_data)
}
