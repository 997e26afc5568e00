//! Adaptive palette derivation.
//!
//! Colors are counted in a 15-bit RGB555 histogram, placed into an 8-way
//! tree keyed by the bit-interleaved channel bits, and the least-populated
//! leaf groups are merged until the requested palette size is reached.

use crate::{rgb_to_y, ColorRgb};

const HIST_CAPACITY: usize = 32768;
const CACHE_UNSET: u16 = 0xffff;

/// Luminance bucket widening. Narrower is faster but can miss the nearest
/// entry; the distance metric is plain RGB euclidean anyway.
const Y_MARGIN: i32 = 20;

#[derive(Default)]
struct Node {
    /// Pixels under this node (leaf: pixels of exactly this color).
    count: u32,
    r: u32,
    g: u32,
    b: u32,
    children: Option<Box<[Node; 8]>>,
}

/// 5-bit channel value -> its bits spread three apart, MSB first, so that
/// `(spread(r) << 2) | (spread(g) << 1) | spread(b)` walks the tree top-down
/// three bits at a time.
static TOBITS: [u16; 32] = [
    0x0000, 0x1000, 0x0200, 0x1200, 0x0040, 0x1040, 0x0240, 0x1240, //
    0x0008, 0x1008, 0x0208, 0x1208, 0x0048, 0x1048, 0x0248, 0x1248, //
    0x0001, 0x1001, 0x0201, 0x1201, 0x0041, 0x1041, 0x0241, 0x1241, //
    0x0009, 0x1009, 0x0209, 0x1209, 0x0049, 0x1049, 0x0249, 0x1249,
];

fn new_children() -> Box<[Node; 8]> {
    Box::new(std::array::from_fn(|_| Node::default()))
}

fn octree_set(root: &mut Node, mut bits: u32, c: ColorRgb, count: u32) {
    let mut node = root;
    for _ in 0..5 {
        // count on interior nodes is the total below them.
        node.count += count;
        let children = node.children.get_or_insert_with(new_children);
        node = &mut children[(bits & 7) as usize];
        bits >>= 3;
    }
    // Each color reaches its leaf exactly once, so plain assignment.
    node.count = count;
    node.r = c.r as u32 * count;
    node.g = c.g as u32 * count;
    node.b = c.b as u32 * count;
}

/// Find the leaf-parent with the smallest aggregate count; records the
/// child-index path from the root so the caller can walk down mutably.
fn find_minnode(node: &Node, path: &mut Vec<u8>, min: &mut u32, best: &mut Option<Vec<u8>>) {
    let Some(children) = &node.children else {
        return;
    };
    let has_grandchild = children.iter().any(|c| c.children.is_some());
    if has_grandchild {
        for (i, child) in children.iter().enumerate() {
            path.push(i as u8);
            find_minnode(child, path, min, best);
            path.pop();
        }
    } else if node.count < *min {
        *min = node.count;
        *best = Some(path.clone());
    }
}

/// Merge the leaves of a leaf-parent node into the node itself. Returns the
/// change in leaf count (1 new leaf minus 1..8 removed, so always <= 0).
fn merge_leaves(node: &mut Node) -> i32 {
    let mut r = 0u32;
    let mut g = 0u32;
    let mut b = 0u32;
    let mut ndiff = 1i32;
    if let Some(children) = node.children.take() {
        for child in children.iter() {
            if child.count != 0 {
                ndiff -= 1;
                r += child.r;
                g += child.g;
                b += child.b;
            }
        }
    }
    // count is already the aggregate.
    node.r = r;
    node.g = g;
    node.b = b;
    ndiff
}

fn make_palette(pal: &mut Vec<ColorRgb>, node: &Node) {
    if let Some(children) = &node.children {
        for child in children.iter() {
            make_palette(pal, child);
        }
    } else if node.count != 0 {
        let r = (node.r / node.count) as u8;
        let g = (node.g / node.count) as u8;
        let b = (node.b / node.count) as u8;
        pal.push(ColorRgb {
            r,
            g,
            b,
            // Luminance rides in the unused A byte for the sorted search.
            a: rgb_to_y(r, g, b),
        });
    }
}

/// The derived palette plus the lookup state `finder_adaptive` needs.
pub(crate) struct AdaptiveFinder {
    pub palette: Vec<ColorRgb>,
    /// Palette index ranges per upper-3-bit luminance bucket.
    y_lo: [usize; 8],
    y_hi: [usize; 8],
    /// RGB555 -> palette index, populated lazily. CACHE_UNSET = unknown.
    cache: Vec<u16>,
    /// Distinct colors seen in the source (for diagnostics).
    pub source_colors: usize,
}

/// Build an adaptive palette of at most `target` colors from an ARGB16
/// pixel slice. `gain` >= 0 scales the 5-bit channels while histogramming
/// (one-pass callers); pass -1 when gain was already applied upstream.
pub(crate) fn build(src: &[u16], target: usize, gain: i32) -> AdaptiveFinder {
    // Histogram: 15 bits of color index the count table directly. Counts
    // saturate at 0xffff. Transparent pixels carry no color information;
    // an all-transparent image still gets one pass so the palette is
    // never empty.
    let mut colormap = vec![0u16; HIST_CAPACITY];
    for skip_transparent in [true, false] {
        for &v in src {
            if skip_transparent && v & 0x8000 != 0 {
                continue;
            }
            let mut n = (v & 0x7fff) as usize;
            if gain >= 0 {
                let r5 = (((n >> 10) & 0x1f) as u32 * gain as u32 / 256).min(31);
                let g5 = (((n >> 5) & 0x1f) as u32 * gain as u32 / 256).min(31);
                let b5 = ((n & 0x1f) as u32 * gain as u32 / 256).min(31);
                n = ((r5 << 10) | (g5 << 5) | b5) as usize;
            }
            colormap[n] = colormap[n].saturating_add(1);
        }
        if colormap.iter().any(|&c| c != 0) || src.is_empty() {
            break;
        }
    }

    let mut root = Node::default();
    let mut palette_count: i32 = 0;
    for (i, &count) in colormap.iter().enumerate() {
        if count == 0 {
            continue;
        }
        let r5 = ((i >> 10) & 0x1f) as usize;
        let g5 = ((i >> 5) & 0x1f) as usize;
        let b5 = (i & 0x1f) as usize;
        let bits =
            ((TOBITS[r5] as u32) << 2) | ((TOBITS[g5] as u32) << 1) | TOBITS[b5] as u32;
        let c = ColorRgb::new((r5 << 3) as u8, (g5 << 3) as u8, (b5 << 3) as u8);
        octree_set(&mut root, bits, c, count as u32);
        palette_count += 1;
    }
    let source_colors = palette_count as usize;

    // Merge the cheapest groups until the palette fits.
    while palette_count > target as i32 {
        let mut min = u32::MAX;
        let mut best = None;
        find_minnode(&root, &mut Vec::new(), &mut min, &mut best);
        let Some(path) = best else {
            break;
        };
        let mut node = &mut root;
        for &i in &path {
            node = match node.children.as_mut() {
                Some(children) => &mut children[i as usize],
                None => unreachable!("minnode path points below a leaf"),
            };
        }
        palette_count += merge_leaves(node);
    }

    let mut palette = Vec::with_capacity(palette_count.max(0) as usize);
    make_palette(&mut palette, &root);
    palette.sort_by_key(|c| c.a);

    // Precompute the search window for each luminance bucket.
    let n = palette.len();
    let mut y_lo = [0usize; 8];
    let mut y_hi = [0usize; 8];
    for y in 0..8 {
        let lo = (y as i32 * 0x20 - Y_MARGIN).max(0);
        let hi = (y as i32 * 0x20 + 0x1f + Y_MARGIN).min(255);

        let mut i = 0;
        while i + 1 < n {
            if palette[i].a as i32 >= lo {
                break;
            }
            i += 1;
        }
        let mut ylo = i;
        while i < n {
            if palette[i].a as i32 > hi {
                break;
            }
            i += 1;
        }
        let mut yhi = i;
        if ylo == yhi {
            if yhi == n {
                ylo = ylo.saturating_sub(1);
            } else {
                yhi += 1;
            }
        }
        y_lo[y] = ylo;
        y_hi[y] = yhi;
    }

    AdaptiveFinder {
        palette,
        y_lo,
        y_hi,
        cache: vec![CACHE_UNSET; HIST_CAPACITY],
        source_colors,
    }
}

impl AdaptiveFinder {
    pub fn find(&mut self, c: ColorRgb) -> u16 {
        let r5 = (c.r >> 3) as usize;
        let g5 = (c.g >> 3) as usize;
        let b5 = (c.b >> 3) as usize;
        let n = r5 * 32 * 32 + g5 * 32 + b5;
        let cc = self.cache[n];
        if cc != CACHE_UNSET {
            return cc;
        }
        // Look up with the center of the 5-bit cell.
        let cc = self.find_linear(ColorRgb::new(
            (r5 * 8 + 4) as u8,
            (g5 * 8 + 4) as u8,
            (b5 * 8 + 4) as u8,
        ));
        self.cache[n] = cc;
        cc
    }

    fn find_linear(&self, c: ColorRgb) -> u16 {
        let mut mindist = u32::MAX;
        let mut minidx = 0usize;
        let yh = (rgb_to_y(c.r, c.g, c.b) >> 5) as usize;

        for i in self.y_lo[yh]..self.y_hi[yh] {
            let pal = &self.palette[i];
            let dr = c.r as i32 - pal.r as i32;
            let dg = c.g as i32 - pal.g as i32;
            let db = c.b as i32 - pal.b as i32;
            let dist = (dr * dr + dg * dg + db * db) as u32;
            if dist < mindist {
                minidx = i;
                if dist < 8 {
                    break;
                }
                mindist = dist;
            }
        }
        minidx as u16
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::rgb888_to_argb16;

    #[test]
    fn few_colors_survive_unmerged() {
        let black = rgb888_to_argb16(0, 0, 0);
        let white = rgb888_to_argb16(255, 255, 255);
        let src = vec![black, white, black, white];
        let f = build(&src, 16, -1);
        assert_eq!(f.source_colors, 2);
        assert_eq!(f.palette.len(), 2);
        // Sorted by luminance: dark first.
        assert!(f.palette[0].a <= f.palette[1].a);
    }

    #[test]
    fn merges_down_to_target() {
        // 64 distinct reds.
        let src: Vec<u16> = (0..32)
            .flat_map(|r| (0..2).map(move |g| ((r as u16) << 10) | ((g as u16) << 5)))
            .collect();
        let f = build(&src, 8, -1);
        assert!(f.palette.len() <= 8);
        assert!(!f.palette.is_empty());
    }

    #[test]
    fn finder_returns_valid_indices() {
        let src: Vec<u16> = (0..1000u32)
            .map(|i| rgb888_to_argb16((i % 256) as u8, (i * 7 % 256) as u8, (i * 13 % 256) as u8))
            .collect();
        let mut f = build(&src, 64, -1);
        let n = f.palette.len();
        for i in (0..256).step_by(17) {
            let idx = f.find(ColorRgb::new(i as u8, (255 - i) as u8, 128));
            assert!((idx as usize) < n);
        }
    }

    #[test]
    fn histogram_gain_saturates() {
        let gray = rgb888_to_argb16(200, 200, 200);
        let f = build(&[gray], 256, 512); // 2.0 gain, clamps to 31
        assert_eq!(f.palette.len(), 1);
        assert_eq!((f.palette[0].r, f.palette[0].g, f.palette[0].b), (248, 248, 248));
    }
}
