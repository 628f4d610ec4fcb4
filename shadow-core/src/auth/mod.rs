mod basic;
mod token;

pub use basic::BasicCredentials;
pub use token::DeviceClaims;
