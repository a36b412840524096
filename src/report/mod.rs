pub mod queue;
pub mod service;
pub mod sink;

pub use queue::VerdictQueue;
pub use service::ReporterService;
