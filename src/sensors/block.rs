//! Sensor blocks: fixed-size film tiles handed out in spiral order.

// std
use std::sync::atomic::{AtomicUsize, Ordering};
// wavert
use crate::core::geometry::{Bounds2i, Point2i};
use crate::sensors::film::Film;

/// Partitions the film into tiles ordered in an outward spiral from the
/// centre.
pub fn spiral_blocks(width: u32, height: u32, block_size: u32) -> Vec<Bounds2i> {
    let bs = block_size.max(1) as i32;
    let nx = (width as i32 + bs - 1) / bs;
    let ny = (height as i32 + bs - 1) / bs;

    let mut order: Vec<(i32, i32)> = Vec::with_capacity((nx * ny) as usize);
    // walk the spiral: right, down, left, up with growing run lengths
    let (mut cx, mut cy) = ((nx - 1) / 2, (ny - 1) / 2);
    let mut dir = 0;
    let mut run = 1;
    order.push((cx, cy));
    'outer: loop {
        for _ in 0..2 {
            let (dx, dy) = [(1, 0), (0, 1), (-1, 0), (0, -1)][dir];
            for _ in 0..run {
                cx += dx;
                cy += dy;
                if cx >= -nx && cx <= 2 * nx && cy >= -ny && cy <= 2 * ny {
                    if cx >= 0 && cx < nx && cy >= 0 && cy < ny {
                        order.push((cx, cy));
                        if order.len() == (nx * ny) as usize {
                            break 'outer;
                        }
                    }
                } else {
                    break 'outer;
                }
            }
            dir = (dir + 1) % 4;
        }
        run += 1;
    }
    assert_eq!(order.len(), (nx * ny) as usize);

    order
        .into_iter()
        .map(|(tx, ty)| {
            Bounds2i::new(
                Point2i {
                    x: tx * bs,
                    y: ty * bs,
                },
                Point2i {
                    x: ((tx + 1) * bs).min(width as i32),
                    y: ((ty + 1) * bs).min(height as i32),
                },
            )
        })
        .collect()
}

/// Hands out blocks to workers; each block is owned by exactly one worker.
pub struct BlockQueue {
    blocks: Vec<Bounds2i>,
    next: AtomicUsize,
}

impl BlockQueue {
    pub fn new(blocks: Vec<Bounds2i>) -> BlockQueue {
        BlockQueue {
            blocks,
            next: AtomicUsize::new(0),
        }
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }
    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    pub fn next(&self) -> Option<(usize, Bounds2i)> {
        let i = self.next.fetch_add(1, Ordering::Relaxed);
        self.blocks.get(i).map(|b| (i, *b))
    }

    pub fn completed(&self) -> usize {
        self.next.load(Ordering::Relaxed).min(self.blocks.len())
    }
}

/// Owning handle of an acquired block; refcounts into the film storage and
/// releases on every exit path.
pub struct BlockHandle<'a> {
    film: &'a Film,
    pub id: usize,
    pub bounds: Bounds2i,
}

impl<'a> BlockHandle<'a> {
    pub fn acquire(film: &'a Film, id: usize, bounds: Bounds2i) -> BlockHandle<'a> {
        film.acquire_block_ref();
        BlockHandle { film, id, bounds }
    }
    pub fn film(&self) -> &Film {
        self.film
    }
}

impl<'a> Drop for BlockHandle<'a> {
    fn drop(&mut self) {
        self.film.release_block_ref();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sensors::response::Response;

    #[test]
    fn spiral_covers_every_pixel_once() {
        let blocks = spiral_blocks(37, 23, 8);
        let mut covered = vec![0_u32; 37 * 23];
        for b in &blocks {
            for y in b.p_min.y..b.p_max.y {
                for x in b.p_min.x..b.p_max.x {
                    covered[(y * 37 + x) as usize] += 1;
                }
            }
        }
        assert!(covered.iter().all(|&c| c == 1));
    }

    #[test]
    fn spiral_starts_near_the_centre() {
        let blocks = spiral_blocks(64, 64, 16);
        let first = blocks[0];
        let cx = (first.p_min.x + first.p_max.x) / 2;
        let cy = (first.p_min.y + first.p_max.y) / 2;
        assert!((cx - 32).abs() <= 16 && (cy - 32).abs() <= 16);
        // the last block is a corner block
        let last = blocks.last().unwrap();
        assert!(last.p_min.x == 0 || last.p_min.y == 0 || last.p_max.x == 64 || last.p_max.y == 64);
    }

    #[test]
    fn queue_hands_out_each_block_once() {
        let blocks = spiral_blocks(32, 32, 16);
        let q = BlockQueue::new(blocks);
        let mut seen = std::collections::HashSet::new();
        while let Some((id, _)) = q.next() {
            assert!(seen.insert(id));
        }
        assert_eq!(seen.len(), 4);
    }

    #[test]
    fn handle_refcounts_into_the_film() {
        let film = Film::new(8, 8, Response::Scalar, false);
        {
            let _h = BlockHandle::acquire(&film, 0, spiral_blocks(8, 8, 8)[0]);
            assert_eq!(film.active_blocks(), 1);
        }
        assert_eq!(film.active_blocks(), 0);
    }
}
