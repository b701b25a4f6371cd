// shared tables and errors
pub mod error;
pub mod table;

// spatial model
pub mod lattice;
pub mod neighbors;
pub mod aggregate;

// score engines
pub mod scores;

// region classification and display
pub mod region;
pub mod palette;

pub mod progress;

pub use error::{Result, SpatialError};
pub use table::{LabelTable, Signal, SignalMatrix, SpotTable};
