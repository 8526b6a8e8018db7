#[macro_use]
extern crate impl_ops;

pub mod accelerators;
pub mod beam;
pub mod core;
pub mod integrators;
pub mod interaction;
pub mod lights;
pub mod materials;
pub mod mesh;
pub mod previewer;
pub mod samplers;
pub mod scene;
pub mod sensors;
pub mod stats;
