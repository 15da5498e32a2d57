// src/db/models/mod.rs

//! Row models for the repository database
//!
//! Each model maps one table (or one tightly-coupled pair) and follows the
//! same shape: `insert`, `find_*`, `from_row`.

mod contents;
mod identity;
mod instance;
mod label;
mod mirror_mark;
mod signing_key;
mod trove_info;

pub use contents::{TroveFileEntry, TroveReference};
pub use identity::{ANY_LABEL, ANY_TROVE, EntitlementGroup, Permission, Role, User};
pub use instance::{Instance, TroveState};
pub use label::{BranchEntry, LabelEntry};
pub use mirror_mark::{MirrorMark, NO_MARK};
pub use signing_key::SigningKeyEntry;
pub use trove_info::{InfoType, TroveInfo};
