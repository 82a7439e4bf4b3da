use rayon::prelude::*;
use std::ops::Range;

/// Half-width of the square neighborhood a spot must dominate (5x5 window).
pub const WINDOW_RADIUS: isize = 2;

/// Capacity each parallel unit starts its spot buffer with.
pub const INITIAL_BUFFER_CAPACITY: usize = 1024;

/// A local intensity maximum at or above the frame threshold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Spot {
    pub x: usize,
    pub y: usize,
    pub intensity: i32,
}

/// Read-only row-major view of a frame whose length matches its dimensions.
#[derive(Debug, Clone, Copy)]
pub struct PixelGrid<'a> {
    pixels: &'a [i32],
    width: usize,
    height: usize,
}

impl<'a> PixelGrid<'a> {
    /// Returns `None` unless `pixels.len() == width * height`.
    pub fn new(pixels: &'a [i32], width: usize, height: usize) -> Option<Self> {
        (width.checked_mul(height)? == pixels.len()).then_some(Self {
            pixels,
            width,
            height,
        })
    }

    #[inline]
    pub fn get(&self, x: usize, y: usize) -> i32 {
        self.pixels[y * self.width + x]
    }

    /// True when no in-bounds pixel of the window around `(x, y)` is strictly
    /// brighter. Neighbors that fall off the grid are skipped; equal
    /// neighbors do not disqualify.
    pub fn is_local_max(&self, x: usize, y: usize) -> bool {
        let value = self.get(x, y);
        for dy in -WINDOW_RADIUS..=WINDOW_RADIUS {
            let ny = y as isize + dy;
            if ny < 0 || ny >= self.height as isize {
                continue;
            }
            for dx in -WINDOW_RADIUS..=WINDOW_RADIUS {
                if dx == 0 && dy == 0 {
                    continue;
                }
                let nx = x as isize + dx;
                if nx < 0 || nx >= self.width as isize {
                    continue;
                }
                if self.get(nx as usize, ny as usize) > value {
                    return false;
                }
            }
        }
        true
    }
}

/// Growable spot list owned by a single parallel unit. Capacity starts at
/// [`INITIAL_BUFFER_CAPACITY`] and doubles whenever it is exhausted.
#[derive(Debug)]
pub struct SpotBuffer {
    spots: Vec<Spot>,
}

impl Default for SpotBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl SpotBuffer {
    pub fn new() -> Self {
        Self {
            spots: Vec::with_capacity(INITIAL_BUFFER_CAPACITY),
        }
    }

    pub fn push(&mut self, spot: Spot) {
        if self.spots.len() == self.capacity() {
            self.spots.reserve_exact(self.capacity().max(1));
        }
        self.spots.push(spot);
    }

    pub fn len(&self) -> usize {
        self.spots.len()
    }

    pub fn capacity(&self) -> usize {
        self.spots.capacity()
    }

    pub fn as_slice(&self) -> &[Spot] {
        &self.spots
    }
}

/// Concatenate per-unit buffers in unit order.
fn merge(buffers: &[SpotBuffer]) -> Vec<Spot> {
    let total = buffers.iter().map(SpotBuffer::len).sum();
    let mut spots = Vec::with_capacity(total);
    for buffer in buffers {
        spots.extend_from_slice(buffer.as_slice());
    }
    spots
}

/// Scan interior columns of `rows` sequentially, appending matches to `buffer`.
pub fn scan_rows(grid: &PixelGrid<'_>, threshold: i32, rows: Range<usize>, buffer: &mut SpotBuffer) {
    if grid.width < 3 {
        return;
    }
    let rows = rows.start.max(1)..rows.end.min(grid.height.saturating_sub(1));
    for y in rows {
        for x in 1..grid.width - 1 {
            let intensity = grid.get(x, y);
            if intensity >= threshold && grid.is_local_max(x, y) {
                buffer.push(Spot { x, y, intensity });
            }
        }
    }
}

/// Find every interior pixel at or above `threshold` that is a local maximum
/// of its 5x5 neighborhood.
///
/// Rows are distributed over the current rayon pool one at a time so that
/// work stealing evens out rows with many candidates. Each unit fills its own
/// [`SpotBuffer`]; the buffers are concatenated once, in row order.
pub fn detect(grid: &PixelGrid<'_>, threshold: i32) -> Vec<Spot> {
    if grid.width < 3 || grid.height < 3 {
        return Vec::new();
    }

    let buffers: Vec<SpotBuffer> = (1..grid.height - 1)
        .into_par_iter()
        .with_min_len(1)
        .fold(SpotBuffer::new, |mut buffer, y| {
            scan_rows(grid, threshold, y..y + 1, &mut buffer);
            buffer
        })
        .collect();

    merge(&buffers)
}
