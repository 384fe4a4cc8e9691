//! API Module
//!
//! HTTP surface of the controller: debug and administrative routes, the
//! satellite rollback callback, health and metrics.

pub mod rest;
pub mod server;

pub use rest::{ApiErrorResponse, RestRouter, IDENTITY_HEADER, ROLE_HEADER};
pub use server::{ApiServer, ShutdownHandle};
