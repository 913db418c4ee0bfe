pub mod generation;
pub mod probe;

pub use generation::{split_image_ref, Generation};
