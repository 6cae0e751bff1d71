//! Tiles and the tile manager.

pub mod manager;
#[allow(clippy::module_inception)]
pub mod tile;

pub use manager::{FinishedTile, TileManager, TileManagerState, TileOrder, TileSettings, TileTypes};
pub use tile::{RenderTile, RenderTileNeighbors, RenderTileTask, Tile, TileState};
