pub mod fsd;
pub mod intersection;
pub mod polarimetric;
pub mod surface_profile;
