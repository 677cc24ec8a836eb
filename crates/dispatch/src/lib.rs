pub mod engine;
pub mod executor;
pub mod queue;
pub mod tracker;

pub use engine::{CampaignEngine, CampaignStatistics, CreateCampaignRequest, UpdateCampaignRequest};
pub use executor::{Dispatcher, SequenceStepHandler};
pub use queue::{RetryPolicy, Task, TaskExecutor, TaskPolicies, TaskQueue, WorkerPool};
pub use tracker::DeliveryTracker;
