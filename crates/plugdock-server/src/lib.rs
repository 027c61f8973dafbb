//! HTTP façade for the plugdock plugin host.

pub mod api;
