pub mod audit;
pub mod billing;
pub mod export;
pub mod user;
