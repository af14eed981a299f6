//! Work inventory and source validation

mod inventory;
mod validator;

pub use inventory::Inventory;
pub use validator::{FileSignatureValidator, SourceValidator, ValidatedSource};
