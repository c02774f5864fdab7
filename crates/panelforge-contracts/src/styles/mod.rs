mod registry;
mod selectors;

pub use registry::{ComicStyle, StyleRegistry, DEFAULT_STYLE};
pub use selectors::{StyleSelection, StyleSelector};
