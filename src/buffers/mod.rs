//! Accumulation and display buffers.

pub mod display;
pub mod film;
pub mod params;
pub mod passes;
pub mod render_buffers;

pub use display::DisplayBuffer;
pub use film::{film_map, film_map_byte, film_map_half, FilmParams, ToneMap};
pub use params::BufferParams;
pub use passes::{add_pass, FilmConstants, PassType};
pub use render_buffers::{RenderBuffers, SharedBuffers};
