//! Collaborators used by the tests and example programs of `swapr`.
pub mod framegen;
pub mod shm_allocator;
