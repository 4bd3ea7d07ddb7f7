//! The read path: locate chunk parts, plan which replicas to ask, execute
//! the plan with fallback waves, and adapt readahead to the access pattern.

pub mod chunk_reader;
pub mod executor;
pub mod locator;
pub mod planner;
pub mod readahead;

pub use chunk_reader::ChunkReader;
pub use executor::{ReadPlanExecutor, ReadTimeouts};
pub use locator::{ChunkLocation, ChunkLocator};
pub use planner::{PartInstance, ReadPlan, ReadPlanner, Wave};
pub use readahead::ReadaheadAdviser;
