pub mod merge;
pub mod render;
pub mod trace;
