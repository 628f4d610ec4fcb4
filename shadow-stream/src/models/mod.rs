//! Storage data models.

pub mod shadow;
pub mod stream;
