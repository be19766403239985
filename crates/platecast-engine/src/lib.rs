pub mod client;
pub mod config;
mod dryrun;
pub mod error;
pub mod gate;
pub mod media;
pub mod pipeline;
pub mod progress;
pub mod prompt;
pub mod retry;
pub mod token;
pub mod transport;

pub use client::{PollSettings, ProviderClient};
pub use config::{resolve, ConfigSources, ResolvedConfig, Vendor, VendorSelection};
pub use error::ProviderError;
pub use gate::{GateError, Session};
pub use pipeline::{BatchRun, PipelineItemResult, PipelineRunner, PipelineSettings};
pub use progress::{EventLogObserver, NoopObserver, PipelineObserver};
pub use prompt::TemplateVariant;
pub use retry::RetryPolicy;
