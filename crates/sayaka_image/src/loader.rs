//! Format detection and decoding.
//!
//! A static table of magic-byte sniffers is tried in a fixed preferred
//! order; the matching entry's decoder then consumes a forward handle over
//! the same bytes. Decoding itself is delegated to the `image` crate.
//!
//! A sniffer that matched but whose decoder failed is an error; the next
//! candidate is NOT tried. Only "not my format" falls through. If nothing
//! matches, the caller may still try [`crate::blurhash`] (text, not magic).

use std::io::{self, Cursor, Read, Seek, SeekFrom};

use image::{AnimationDecoder, ImageFormat};
use log::{debug, trace};

use crate::peek::PeekStream;
use crate::{Image, ImageError, ResizeAxis, Result};

/// Everything the sniffers need from the peek phase.
pub trait ReadSeek: Read + Seek {}
impl<T: Read + Seek> ReadSeek for T {}

/// Size request forwarded to the decoders. A decoder may use it (e.g. to
/// pick the frame for `page`) but must not be assumed to honor the pixel
/// sizes exactly; they are hints, not commands.
#[derive(Debug, Clone, Copy, Default)]
pub struct ReadHint {
    pub axis: ResizeAxis,
    pub width: u32,
    pub height: u32,
    /// Frame number for animated inputs, starting at 0.
    pub page: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoaderKind {
    Webp,
    Jpeg,
    Png,
    Gif,
    Bmp,
    Tiff,
}

struct Entry {
    kind: LoaderKind,
    name: &'static str,
    libname: &'static str,
    sniff: fn(&mut dyn ReadSeek) -> io::Result<bool>,
}

// Tried in order; keep the cheap and common formats first.
static LOADERS: &[Entry] = &[
    Entry {
        kind: LoaderKind::Webp,
        name: "webp",
        libname: "image-rs",
        sniff: sniff_webp,
    },
    Entry {
        kind: LoaderKind::Jpeg,
        name: "jpeg",
        libname: "image-rs",
        sniff: sniff_jpeg,
    },
    Entry {
        kind: LoaderKind::Png,
        name: "png",
        libname: "image-rs",
        sniff: sniff_png,
    },
    Entry {
        kind: LoaderKind::Gif,
        name: "gif",
        libname: "image-rs",
        sniff: sniff_gif,
    },
    Entry {
        kind: LoaderKind::Bmp,
        name: "bmp",
        libname: "image-rs",
        sniff: sniff_bmp,
    },
    Entry {
        kind: LoaderKind::Tiff,
        name: "tiff",
        libname: "image-rs",
        sniff: sniff_tiff,
    },
];

fn head(r: &mut dyn ReadSeek, n: usize) -> io::Result<Vec<u8>> {
    let mut buf = vec![0u8; n];
    let mut got = 0;
    while got < n {
        let k = r.read(&mut buf[got..])?;
        if k == 0 {
            break;
        }
        got += k;
    }
    buf.truncate(got);
    Ok(buf)
}

fn sniff_webp(r: &mut dyn ReadSeek) -> io::Result<bool> {
    let h = head(r, 12)?;
    Ok(h.len() == 12 && &h[0..4] == b"RIFF" && &h[8..12] == b"WEBP")
}

fn sniff_jpeg(r: &mut dyn ReadSeek) -> io::Result<bool> {
    let h = head(r, 3)?;
    Ok(h.len() == 3 && h[0] == 0xff && h[1] == 0xd8 && h[2] == 0xff)
}

fn sniff_png(r: &mut dyn ReadSeek) -> io::Result<bool> {
    let h = head(r, 8)?;
    Ok(h == b"\x89PNG\r\n\x1a\n")
}

fn sniff_gif(r: &mut dyn ReadSeek) -> io::Result<bool> {
    let h = head(r, 6)?;
    Ok(h == b"GIF87a" || h == b"GIF89a")
}

fn sniff_bmp(r: &mut dyn ReadSeek) -> io::Result<bool> {
    let h = head(r, 2)?;
    Ok(h == b"BM")
}

fn sniff_tiff(r: &mut dyn ReadSeek) -> io::Result<bool> {
    let h = head(r, 4)?;
    Ok(h == b"II*\0" || h == b"MM\0*")
}

/// Run the sniffer table over the peek prefix. Each sniffer sees the stream
/// from offset 0; the cursor is rewound between candidates so the following
/// decode observes the identical byte sequence.
pub fn sniff<R: Read>(ps: &mut PeekStream<R>) -> Result<Option<LoaderKind>> {
    let mut handle = ps.peek_handle();
    for entry in LOADERS {
        let ok = (entry.sniff)(&mut handle)?;
        trace!("checking {:4} .. {}", entry.name, if ok { "matched" } else { "no" });
        handle.seek(SeekFrom::Start(0))?;
        if ok {
            return Ok(Some(entry.kind));
        }
    }
    trace!("unsupported image format");
    Ok(None)
}

fn loader_name(kind: LoaderKind) -> &'static str {
    LOADERS
        .iter()
        .find(|e| e.kind == kind)
        .map(|e| e.name)
        .unwrap_or("?")
}

/// Decode the stream with the loader chosen by [`sniff`].
pub fn read<R: Read>(ps: &mut PeekStream<R>, kind: LoaderKind, hint: &ReadHint) -> Result<Image> {
    let mut bytes = Vec::new();
    ps.read_handle().read_to_end(&mut bytes)?;

    let name = loader_name(kind);
    let dynimg = match kind {
        LoaderKind::Gif if hint.page > 0 => {
            let dec = image::codecs::gif::GifDecoder::new(Cursor::new(&bytes[..]))
                .map_err(|source| ImageError::Decode { format: name, source })?;
            let frame = dec
                .into_frames()
                .nth(hint.page as usize)
                .ok_or_else(|| ImageError::Decode {
                    format: name,
                    source: image::ImageError::Parameter(image::error::ParameterError::from_kind(
                        image::error::ParameterErrorKind::NoMoreData,
                    )),
                })?
                .map_err(|source| ImageError::Decode { format: name, source })?;
            image::DynamicImage::ImageRgba8(frame.into_buffer())
        }
        _ => {
            let fmt = match kind {
                LoaderKind::Webp => ImageFormat::WebP,
                LoaderKind::Jpeg => ImageFormat::Jpeg,
                LoaderKind::Png => ImageFormat::Png,
                LoaderKind::Gif => ImageFormat::Gif,
                LoaderKind::Bmp => ImageFormat::Bmp,
                LoaderKind::Tiff => ImageFormat::Tiff,
            };
            image::load_from_memory_with_format(&bytes, fmt)
                .map_err(|source| ImageError::Decode { format: name, source })?
        }
    };

    let (w, h) = (dynimg.width(), dynimg.height());
    debug!("{}: decoded {}x{}", name, w, h);

    // Canonical output: RGB24 when the input has no alpha channel, ARGB32
    // otherwise. has_alpha is declared from the format, not by scanning.
    let img = if dynimg.color().has_alpha() {
        Image::from_argb32(w, h, dynimg.into_rgba8().into_raw())
    } else {
        Image::from_rgb24(w, h, dynimg.into_rgb8().into_raw())
    };
    Ok(img)
}

/// `(filetype, decoder)` pairs for the `--list` output.
pub fn loader_info() -> Vec<(&'static str, &'static str)> {
    let mut v: Vec<(&'static str, &'static str)> =
        vec![("blurhash", "builtin")];
    for e in LOADERS {
        v.push((e.name, e.libname));
    }
    v.sort();
    v
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn sniffers_identify_magic() {
        let cases: &[(&[u8], LoaderKind)] = &[
            (b"\x89PNG\r\n\x1a\n________", LoaderKind::Png),
            (b"\xff\xd8\xff\xe0____", LoaderKind::Jpeg),
            (b"GIF89a____", LoaderKind::Gif),
            (b"BM______", LoaderKind::Bmp),
            (b"II*\0____", LoaderKind::Tiff),
            (b"RIFF\0\0\0\0WEBP____", LoaderKind::Webp),
        ];
        for (bytes, kind) in cases {
            let mut ps = PeekStream::new(Cursor::new(bytes.to_vec()));
            assert_eq!(sniff(&mut ps).unwrap(), Some(*kind));
        }
        let mut ps = PeekStream::new(Cursor::new(b"not an image".to_vec()));
        assert_eq!(sniff(&mut ps).unwrap(), None);
    }

    #[test]
    fn decode_failure_is_not_notmine() {
        // Valid PNG magic, garbage body: sniff matches, read errors.
        let mut bytes = b"\x89PNG\r\n\x1a\n".to_vec();
        bytes.extend_from_slice(&[0u8; 32]);
        let mut ps = PeekStream::new(Cursor::new(bytes));
        let kind = sniff(&mut ps).unwrap().unwrap();
        assert_eq!(kind, LoaderKind::Png);
        let err = read(&mut ps, kind, &ReadHint::default()).unwrap_err();
        assert!(matches!(err, ImageError::Decode { format: "png", .. }));
    }
}
