pub mod elliptic_cone;
pub mod frame;
pub mod gaussian2d;
pub mod geometry;
pub mod intersect;
pub mod quantity;
pub mod rng;
pub mod sampling;
pub mod simd;
pub mod spectrum;
