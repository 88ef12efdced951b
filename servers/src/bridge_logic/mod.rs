pub mod config;
pub mod downstream;
pub mod ingress;
pub mod sessions;
