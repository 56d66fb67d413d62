pub mod config;
pub mod coordinator;
pub mod ingress;
pub mod mgmt;
