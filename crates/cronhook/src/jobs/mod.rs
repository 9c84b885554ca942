pub mod delivery;
pub mod dispatcher;
pub mod memory;
pub mod model;
pub mod repo;
pub mod retry;
pub mod store;

pub use delivery::{DeliveryError, HttpWebhookSender, WebhookSender, DELIVERY_TIMEOUT};
pub use dispatcher::{DispatchConfig, Dispatcher, SweepReport};
pub use memory::MemoryJobStore;
pub use model::{Job, JobStatus, NewJob, Transition};
pub use repo::JobsRepo;
pub use retry::{AttemptOutcome, RetryConfig, RetryPolicy};
pub use store::{DueQuery, JobStore, JobStoreError};
