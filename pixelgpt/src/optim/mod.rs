pub mod grads;
pub mod groups;
pub mod roles;
pub mod schedule;
