//! Film storage: per-element spectral/polarimetric accumulators.

// std
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
// others
use atomic::Atomic;
use thiserror::Error;
// wavert
use crate::core::quantity::Float;
use crate::interaction::polarimetric::Stokes;
use crate::sensors::response::Response;
use crate::sensors::tonemap::Tonemap;

#[derive(Debug, Error)]
pub enum StorageWriteError {
    #[error("image write failed: {0}")]
    Image(String),
}

/// Render-target storage of one sensor.
///
/// Tiles are owned exclusively by one worker; their splats go through the
/// unsynchronized path. Direct splats (paths that land outside the owned
/// tile) take the thread-safe compare-and-swap path.
pub struct Film {
    width: u32,
    height: u32,
    response: Response,
    stokes_components: usize,
    data: Vec<Atomic<Float>>,
    weights: Vec<Atomic<Float>>,
    active_blocks: AtomicUsize,
}

impl Film {
    pub fn new(width: u32, height: u32, response: Response, polarimetric: bool) -> Film {
        let stokes_components = if polarimetric { 4 } else { 1 };
        let n = (width * height) as usize;
        let len = n * response.channels() * stokes_components;
        Film {
            width,
            height,
            response,
            stokes_components,
            data: (0..len).map(|_| Atomic::new(0.0 as Float)).collect(),
            weights: (0..n).map(|_| Atomic::new(0.0 as Float)).collect(),
            active_blocks: AtomicUsize::new(0),
        }
    }

    pub fn width(&self) -> u32 {
        self.width
    }
    pub fn height(&self) -> u32 {
        self.height
    }
    pub fn channels(&self) -> usize {
        self.response.channels()
    }
    pub fn response(&self) -> Response {
        self.response
    }
    pub fn is_polarimetric(&self) -> bool {
        self.stokes_components == 4
    }

    pub(crate) fn acquire_block_ref(&self) {
        self.active_blocks.fetch_add(1, Ordering::AcqRel);
    }
    pub(crate) fn release_block_ref(&self) {
        self.active_blocks.fetch_sub(1, Ordering::AcqRel);
    }
    pub fn active_blocks(&self) -> usize {
        self.active_blocks.load(Ordering::Acquire)
    }

    fn base_index(&self, x: u32, y: u32) -> usize {
        (y * self.width + x) as usize * self.channels() * self.stokes_components
    }

    fn in_range(&self, x: u32, y: u32) -> bool {
        let ok = x < self.width && y < self.height;
        debug_assert!(ok, "film element out of range");
        ok
    }

    fn accumulate(&self, x: u32, y: u32, sample: &Stokes, weights3: [Float; 3], atomic_add: bool) {
        if !self.in_range(x, y) {
            // out-of-range splats are dropped in release builds
            return;
        }
        let base = self.base_index(x, y);
        for c in 0..self.channels() {
            let w = weights3[c];
            if w == 0.0 {
                continue;
            }
            for s in 0..self.stokes_components {
                let idx = base + c * self.stokes_components + s;
                let add = w * sample.s[s];
                if atomic_add {
                    let cell = &self.data[idx];
                    let mut cur = cell.load(Ordering::Relaxed);
                    loop {
                        match cell.compare_exchange_weak(
                            cur,
                            cur + add,
                            Ordering::Relaxed,
                            Ordering::Relaxed,
                        ) {
                            Ok(_) => break,
                            Err(v) => cur = v,
                        }
                    }
                } else {
                    let cell = &self.data[idx];
                    cell.store(cell.load(Ordering::Relaxed) + add, Ordering::Relaxed);
                }
            }
        }
    }

    /// Splat from the worker owning the element's tile (unsynchronized).
    pub fn splat(&self, x: u32, y: u32, sample: &Stokes, weights3: [Float; 3]) {
        self.accumulate(x, y, sample, weights3, false);
    }

    /// Thread-safe splat to an arbitrary element (atomic adds).
    pub fn splat_direct(&self, x: u32, y: u32, sample: &Stokes, weights3: [Float; 3]) {
        self.accumulate(x, y, sample, weights3, true);
    }

    /// Adds to the element's accumulated sample weight (tile-owned path).
    pub fn add_sample_weight(&self, x: u32, y: u32, w: Float) {
        if !self.in_range(x, y) {
            return;
        }
        let cell = &self.weights[(y * self.width + x) as usize];
        cell.store(cell.load(Ordering::Relaxed) + w, Ordering::Relaxed);
    }

    /// Weight-normalized channel intensities of one element.
    pub fn element(&self, x: u32, y: u32) -> Vec<Float> {
        let base = self.base_index(x, y);
        let w = self.weights[(y * self.width + x) as usize].load(Ordering::Relaxed);
        let norm = if w > 0.0 { 1.0 as Float / w } else { 0.0 };
        (0..self.channels())
            .map(|c| self.data[base + c * self.stokes_components].load(Ordering::Relaxed) * norm)
            .collect()
    }

    /// A consistent-enough copy of the film for preview or output; the film
    /// itself remains live for concurrent writers.
    pub fn snapshot(&self) -> FilmSnapshot {
        let mut pixels = Vec::with_capacity((self.width * self.height) as usize * self.channels());
        for y in 0..self.height {
            for x in 0..self.width {
                pixels.extend(self.element(x, y));
            }
        }
        FilmSnapshot {
            width: self.width,
            height: self.height,
            channels: self.channels(),
            pixels,
        }
    }
}

/// An immutable copy of film contents.
#[derive(Debug, Clone)]
pub struct FilmSnapshot {
    pub width: u32,
    pub height: u32,
    pub channels: usize,
    /// Row-major, channel-interleaved, weight-normalized.
    pub pixels: Vec<Float>,
}

impl FilmSnapshot {
    pub fn pixel(&self, x: u32, y: u32) -> &[Float] {
        let i = (y * self.width + x) as usize * self.channels;
        &self.pixels[i..i + self.channels]
    }

    /// Writes an OpenEXR image; scalar films replicate L across R, G, B.
    pub fn write_exr(&self, path: &Path) -> Result<(), StorageWriteError> {
        let mut buf: Vec<f32> = Vec::with_capacity((self.width * self.height * 3) as usize);
        for y in 0..self.height {
            for x in 0..self.width {
                let p = self.pixel(x, y);
                match self.channels {
                    1 => buf.extend_from_slice(&[p[0], p[0], p[0]]),
                    _ => buf.extend_from_slice(&[
                        p[0],
                        *p.get(1).unwrap_or(&p[0]),
                        *p.get(2).unwrap_or(&p[0]),
                    ]),
                }
            }
        }
        let img: image::ImageBuffer<image::Rgb<f32>, Vec<f32>> =
            image::ImageBuffer::from_raw(self.width, self.height, buf)
                .ok_or_else(|| StorageWriteError::Image("buffer size mismatch".into()))?;
        img.save(path)
            .map_err(|e| StorageWriteError::Image(e.to_string()))
    }

    /// Writes a tone-mapped PNG preview.
    pub fn write_png(&self, path: &Path, tonemap: &Tonemap) -> Result<(), StorageWriteError> {
        let mut buf: Vec<u8> = Vec::with_capacity((self.width * self.height * 3) as usize);
        for y in 0..self.height {
            for x in 0..self.width {
                let rgb = tonemap.map_pixel(self.pixel(x, y));
                for v in &rgb {
                    buf.push((v * 255.0 + 0.5) as u8);
                }
            }
        }
        let img: image::ImageBuffer<image::Rgb<u8>, Vec<u8>> =
            image::ImageBuffer::from_raw(self.width, self.height, buf)
                .ok_or_else(|| StorageWriteError::Image("buffer size mismatch".into()))?;
        img.save(path)
            .map_err(|e| StorageWriteError::Image(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sensors::tonemap::{TonemapMode, TonemapOperator};

    #[test]
    fn splats_accumulate_and_normalize() {
        let film = Film::new(4, 4, Response::Scalar, false);
        film.splat(1, 2, &Stokes::unpolarized(2.0), [1.0, 0.0, 0.0]);
        film.splat(1, 2, &Stokes::unpolarized(4.0), [1.0, 0.0, 0.0]);
        film.add_sample_weight(1, 2, 2.0);
        let e = film.element(1, 2);
        assert!((e[0] - 3.0).abs() < 1e-6);
    }

    #[test]
    fn direct_splats_are_additive_across_threads() {
        use std::sync::Arc;
        let film = Arc::new(Film::new(2, 2, Response::Scalar, false));
        let threads: Vec<_> = (0..4)
            .map(|_| {
                let film = film.clone();
                std::thread::spawn(move || {
                    for _ in 0..1000 {
                        film.splat_direct(0, 0, &Stokes::unpolarized(1.0), [1.0, 0.0, 0.0]);
                    }
                })
            })
            .collect();
        for t in threads {
            t.join().unwrap();
        }
        film.add_sample_weight(0, 0, 1.0);
        assert!((film.element(0, 0)[0] - 4000.0).abs() < 1.0);
    }

    #[test]
    fn polarimetric_film_keeps_stokes_components() {
        let film = Film::new(2, 1, Response::Scalar, true);
        let s = Stokes {
            s: [1.0, 0.5, -0.25, 0.1],
        };
        film.splat(0, 0, &s, [1.0, 0.0, 0.0]);
        film.add_sample_weight(0, 0, 1.0);
        assert!(film.is_polarimetric());
        assert!((film.element(0, 0)[0] - 1.0).abs() < 1e-6);
    }

    #[test]
    fn writes_exr_and_png() {
        let film = Film::new(3, 2, Response::Scalar, false);
        film.splat(1, 1, &Stokes::unpolarized(1.0), [1.0, 0.0, 0.0]);
        film.add_sample_weight(1, 1, 1.0);
        let snap = film.snapshot();
        let dir = tempfile::tempdir().unwrap();
        snap.write_exr(&dir.path().join("out.exr")).unwrap();
        let tm = Tonemap {
            operator: TonemapOperator::Linear,
            mode: TonemapMode::Select(0),
        };
        snap.write_png(&dir.path().join("out.png"), &tm).unwrap();
        assert!(dir.path().join("out.exr").exists());
        assert!(dir.path().join("out.png").exists());
    }
}
