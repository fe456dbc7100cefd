pub mod checkpoint;
pub mod reader;

pub use checkpoint::{ConnTableImage, ImageEntry};
pub use reader::ImageDir;
