pub mod config;
pub mod fixed;
pub mod layer;
pub mod stimulus;
pub mod validation;
