mod registry;
mod selectors;

pub use registry::{ModelRegistry, ModelSpec, Task};
pub use selectors::{ModelSelector, RankedCandidates};
