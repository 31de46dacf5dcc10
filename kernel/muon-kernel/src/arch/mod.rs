//! Architecture glue.

pub mod x86_64;
