//! Service-side tenant scoping helpers layered over the identity crate.
pub mod adoption;

pub use adoption::{AdoptionService, authorize_adoption};
