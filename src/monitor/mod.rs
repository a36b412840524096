pub mod evaluator;
pub mod model;
pub mod reconciler;
pub mod sampler;
pub mod store;

pub use reconciler::Reconciler;
pub use sampler::StatsSampler;
