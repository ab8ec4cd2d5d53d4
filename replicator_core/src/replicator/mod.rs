//! Replicator contract: the capability interface every adapter implements,
//! the service-name registry, and the onboarding calculator.

pub mod onboarding;
pub mod registry;
pub mod traits;

pub use onboarding::{
    OnboardingField, StateMachineStep, calculate_backfill_state_machine,
    calculate_webhook_state_machine, submit_value,
};
pub use registry::ReplicatorRegistry;
pub use traits::{
    BackfillSource, CredentialVerifier, Enricher, NormalizedRow, OnboardingRequirements, Page,
    PageRequest, Replicator, ReplicatorFactory, StaleRowPolicy,
};
