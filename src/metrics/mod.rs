pub mod registry;
pub mod series;
pub mod stats;
