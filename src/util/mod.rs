pub mod color;
pub mod identifier;
pub mod vec2;
