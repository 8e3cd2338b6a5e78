// Pricing engine: listing model, ratio decisions and the control loop
pub mod types;
pub mod thresholds;
pub mod ratio;
pub mod registry;
pub mod scheduler;

pub use ratio::{PricingParams, RatioComputer};
pub use registry::ListingRegistry;
pub use scheduler::{PassReport, PassState, Scheduler};
