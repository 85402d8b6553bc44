//! Example device implementations for the channel-subsystem core.
//!
//! These are templates for real control-unit device logic: a polled
//! line-input device with a readiness predicate, a clocked pin-bank
//! device, and a store-and-forward message bridge. Each is driven purely
//! by devib callbacks (via the hldev helper) plus its own data source.

pub mod bridge;
pub mod linereader;
pub mod pinbank;
