mod shadow;
mod shadow_ext;
#[cfg(test)]
mod shadow_ext_test;

pub use shadow::shadows_server::{Shadows, ShadowsServer};
pub use shadow::*;
