pub mod address;
mod layout;
mod models;

pub use layout::{LayoutAmounts, Layouts};
pub use models::*;
