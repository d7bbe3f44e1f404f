//! Contrast-limited adaptive histogram equalization on 8-bit images.
//!
//! Tiling, clipping and bilinear LUT interpolation follow OpenCV's `CLAHE`
//! so that frames match the values produced by the legacy pipeline: images
//! whose size is not a multiple of the grid are extended with a
//! reflect-101 border (by a whole tile on an axis that already divides
//! evenly), the clip limit is `clip * tile_area / 256` truncated and at least
//! 1, and excess counts are redistributed uniformly with a strided residual.

use image::GrayImage;

const HIST_SIZE: usize = 256;

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Clahe {
    clip_limit: f64,
    tiles_x: u32,
    tiles_y: u32,
}

impl Clahe {
    /// `tile_grid_size` tiles per side; zero is treated as one.
    pub fn new(clip_limit: f64, tile_grid_size: u32) -> Self {
        let tiles = tile_grid_size.max(1);
        Self {
            clip_limit,
            tiles_x: tiles,
            tiles_y: tiles,
        }
    }

    pub fn apply(&self, src: &GrayImage) -> GrayImage {
        let (width, height) = src.dimensions();
        if width == 0 || height == 0 {
            return src.clone();
        }
        let tiles_x = self.tiles_x as usize;
        let tiles_y = self.tiles_y as usize;
        let (w, h) = (width as usize, height as usize);

        let (ext_w, ext_h) = if w % tiles_x == 0 && h % tiles_y == 0 {
            (w, h)
        } else {
            (w + tiles_x - w % tiles_x, h + tiles_y - h % tiles_y)
        };
        let tile_w = ext_w / tiles_x;
        let tile_h = ext_h / tiles_y;
        let tile_area = tile_w * tile_h;

        let clip = if self.clip_limit > 0.0 {
            Some(((self.clip_limit * tile_area as f64 / HIST_SIZE as f64) as usize).max(1))
        } else {
            None
        };

        let pixels = src.as_raw();
        let col_map: Vec<usize> = (0..ext_w).map(|x| reflect_101(x, w)).collect();
        let row_map: Vec<usize> = (0..ext_h).map(|y| reflect_101(y, h)).collect();

        let mut luts = vec![[0u8; HIST_SIZE]; tiles_x * tiles_y];
        for ty in 0..tiles_y {
            for tx in 0..tiles_x {
                let mut hist = [0usize; HIST_SIZE];
                for &sy in &row_map[ty * tile_h..(ty + 1) * tile_h] {
                    let row = &pixels[sy * w..(sy + 1) * w];
                    for &sx in &col_map[tx * tile_w..(tx + 1) * tile_w] {
                        hist[row[sx] as usize] += 1;
                    }
                }
                if let Some(limit) = clip {
                    clip_histogram(&mut hist, limit);
                }
                luts[ty * tiles_x + tx] = build_lut(&hist, tile_area);
            }
        }

        interpolate(src, &luts, tiles_x, tiles_y, tile_w, tile_h)
    }
}

fn clip_histogram(hist: &mut [usize; HIST_SIZE], limit: usize) {
    let mut clipped = 0;
    for bin in hist.iter_mut() {
        if *bin > limit {
            clipped += *bin - limit;
            *bin = limit;
        }
    }

    let batch = clipped / HIST_SIZE;
    let mut residual = clipped - batch * HIST_SIZE;
    for bin in hist.iter_mut() {
        *bin += batch;
    }
    if residual != 0 {
        let step = (HIST_SIZE / residual).max(1);
        let mut i = 0;
        while i < HIST_SIZE && residual > 0 {
            hist[i] += 1;
            residual -= 1;
            i += step;
        }
    }
}

fn build_lut(hist: &[usize; HIST_SIZE], tile_area: usize) -> [u8; HIST_SIZE] {
    let scale = (HIST_SIZE - 1) as f32 / tile_area as f32;
    let mut lut = [0u8; HIST_SIZE];
    let mut sum = 0usize;
    for (entry, &count) in lut.iter_mut().zip(hist.iter()) {
        sum += count;
        *entry = saturate_u8(sum as f32 * scale);
    }
    lut
}

fn interpolate(
    src: &GrayImage,
    luts: &[[u8; HIST_SIZE]],
    tiles_x: usize,
    tiles_y: usize,
    tile_w: usize,
    tile_h: usize,
) -> GrayImage {
    let (width, height) = src.dimensions();
    let w = width as usize;
    let inv_tw = 1.0f32 / tile_w as f32;
    let inv_th = 1.0f32 / tile_h as f32;

    // Per-column neighbours and weights are shared by every row.
    let columns: Vec<(usize, usize, f32)> = (0..w)
        .map(|x| {
            let txf = x as f32 * inv_tw - 0.5;
            let tx1 = txf.floor();
            let xa = txf - tx1;
            let tx1 = tx1 as i64;
            let left = tx1.max(0) as usize;
            let right = ((tx1 + 1) as usize).min(tiles_x - 1);
            (left, right, xa)
        })
        .collect();

    let pixels = src.as_raw();
    let mut out = vec![0u8; pixels.len()];
    for y in 0..height as usize {
        let tyf = y as f32 * inv_th - 0.5;
        let ty1 = tyf.floor();
        let ya = tyf - ty1;
        let ya1 = 1.0 - ya;
        let ty1 = ty1 as i64;
        let top = ty1.max(0) as usize;
        let bottom = ((ty1 + 1) as usize).min(tiles_y - 1);

        let top_row = &luts[top * tiles_x..(top + 1) * tiles_x];
        let bottom_row = &luts[bottom * tiles_x..(bottom + 1) * tiles_x];
        for (x, &(left, right, xa)) in columns.iter().enumerate() {
            let value = pixels[y * w + x] as usize;
            let xa1 = 1.0 - xa;
            let upper = top_row[left][value] as f32 * xa1 + top_row[right][value] as f32 * xa;
            let lower =
                bottom_row[left][value] as f32 * xa1 + bottom_row[right][value] as f32 * xa;
            out[y * w + x] = saturate_u8(upper * ya1 + lower * ya);
        }
    }

    GrayImage::from_raw(width, height, out).unwrap_or_else(|| src.clone())
}

/// Index of `i` mirrored into `0..n` without repeating the edge sample.
fn reflect_101(mut i: usize, n: usize) -> usize {
    if n == 1 {
        return 0;
    }
    let last = n - 1;
    let period = 2 * last;
    i %= period;
    if i > last {
        period - i
    } else {
        i
    }
}

fn saturate_u8(value: f32) -> u8 {
    value.round_ties_even().clamp(0.0, 255.0) as u8
}
