//! Cross-domain memory shared with the producer.

pub mod shmem;
