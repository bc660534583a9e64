//! Discovered limits of the remote model services.
//!
//! The probe writes a JSON snapshot once; the registry loads it and hands
//! typed values to every other component. The transform path refuses to run
//! on an incomplete snapshot so budgets always come from the services
//! themselves rather than guessed constants.

pub mod probe;
pub mod registry;

pub use registry::{Capabilities, CapabilityError, TransformCaps};
