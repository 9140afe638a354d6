//! Privilege handling

pub mod privileges;

pub use privileges::{is_elevated, PrivilegeLevel, PrivilegeManager};
