pub mod font;
pub mod source;
pub mod visualizer;
