pub mod checkpoint;
pub mod cli;
pub mod config;
pub mod controller;
pub mod distributor;
pub mod endpoint;
pub mod error;
pub mod init;
pub mod scheduler;
pub mod transport;

// Re-export key types for convenience
pub use checkpoint::Checkpoint;
pub use config::{Config, ConfigOverrides, LoggingConfig};
pub use controller::{ConcurrencyConfig, ConcurrencyController, LevelChange};
pub use distributor::{Dispatched, Distributor};
pub use endpoint::{Admission, EndpointConfig, Outcome, RateLimiter, WindowKind};
pub use error::{DispatchError, TransportError};
pub use init::{initialize_config, InitOptions};
pub use scheduler::{ExhaustedPolicy, RunSummary, Scheduler, SchedulerConfig};
pub use transport::{HttpTransport, MockTransport, RequestSpec, Response, Transport};

// Test utilities module - only compiled with test or testing feature
#[cfg(any(test, feature = "testing"))]
pub mod test_utils;
