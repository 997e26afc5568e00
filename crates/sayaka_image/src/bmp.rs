//! BMP output (24-bit, BITMAPINFOHEADER, bottom-up).

use std::io::Write;

use crate::{ColorRgb, Image, ImageData, ImageError, PixelFormat, Result};

const FILE_HEADER_SIZE: u32 = 14;
const INFO_HEADER_SIZE: u32 = 40;

/// Write `img` as an uncompressed 24-bit BMP. Indexed input is expanded
/// through its palette; the transparency bit is dropped.
pub fn bmp_write<W: Write>(w: &mut W, img: &Image) -> Result<()> {
    let width = img.width as usize;
    let height = img.height as usize;
    let rowbytes = width * 3;
    let stride = (rowbytes + 3) & !3;
    let image_size = (stride * height) as u32;
    let offset = FILE_HEADER_SIZE + INFO_HEADER_SIZE;

    let mut header = Vec::with_capacity(offset as usize);
    header.extend_from_slice(b"BM");
    header.extend_from_slice(&(offset + image_size).to_le_bytes());
    header.extend_from_slice(&0u16.to_le_bytes());
    header.extend_from_slice(&0u16.to_le_bytes());
    header.extend_from_slice(&offset.to_le_bytes());

    header.extend_from_slice(&INFO_HEADER_SIZE.to_le_bytes());
    header.extend_from_slice(&(img.width as i32).to_le_bytes());
    header.extend_from_slice(&(img.height as i32).to_le_bytes()); // bottom-up
    header.extend_from_slice(&1u16.to_le_bytes()); // planes
    header.extend_from_slice(&24u16.to_le_bytes());
    header.extend_from_slice(&0u32.to_le_bytes()); // BI_RGB
    header.extend_from_slice(&image_size.to_le_bytes());
    header.extend_from_slice(&3780i32.to_le_bytes()); // 96 dpi
    header.extend_from_slice(&3780i32.to_le_bytes());
    header.extend_from_slice(&0u32.to_le_bytes()); // colors used
    header.extend_from_slice(&0u32.to_le_bytes()); // important colors
    w.write_all(&header)?;

    let mut row = vec![0u8; stride];
    for y in (0..height).rev() {
        match &img.data {
            ImageData::Rgb24(buf) => {
                for x in 0..width {
                    let s = (y * width + x) * 3;
                    row[x * 3] = buf[s + 2];
                    row[x * 3 + 1] = buf[s + 1];
                    row[x * 3 + 2] = buf[s];
                }
            }
            ImageData::Aidx16(buf) => {
                let palette = img.palette.as_deref().unwrap_or(&[]);
                for x in 0..width {
                    let idx = (buf[y * width + x] & 0xff) as usize;
                    let c = palette.get(idx).copied().unwrap_or(ColorRgb::new(0, 0, 0));
                    row[x * 3] = c.b;
                    row[x * 3 + 1] = c.g;
                    row[x * 3 + 2] = c.r;
                }
            }
            _ => {
                return Err(ImageError::FormatMismatch {
                    expected: PixelFormat::Rgb24,
                });
            }
        }
        w.write_all(&row)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loader::{self, ReadHint};
    use crate::peek::PeekStream;
    use std::io::Cursor;

    #[test]
    fn roundtrip_rgb24_is_byte_exact() {
        let px: Vec<u8> = (0..5 * 3 * 3).map(|i| (i * 37 % 256) as u8).collect();
        let img = Image::from_rgb24(5, 3, px.clone());

        let mut bmp = Vec::new();
        bmp_write(&mut bmp, &img).unwrap();

        let mut ps = PeekStream::new(Cursor::new(bmp));
        let kind = loader::sniff(&mut ps).unwrap().unwrap();
        assert_eq!(kind, loader::LoaderKind::Bmp);
        let back = loader::read(&mut ps, kind, &ReadHint::default()).unwrap();
        assert_eq!((back.width, back.height), (5, 3));
        match &back.data {
            ImageData::Rgb24(buf) => assert_eq!(*buf, px),
            other => panic!("unexpected decode format {:?}", other),
        }
    }

    #[test]
    fn rows_are_padded_to_four_bytes() {
        let img = Image::from_rgb24(1, 2, vec![1, 2, 3, 4, 5, 6]);
        let mut bmp = Vec::new();
        bmp_write(&mut bmp, &img).unwrap();
        // 14 + 40 header + 2 rows of 4 bytes.
        assert_eq!(bmp.len(), 54 + 8);
    }
}
