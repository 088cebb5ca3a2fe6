//! Policy Enforcement Point reverse proxy.
//!
//! Every inbound request runs through a [`pipeline::Pipeline`]: the action is
//! extracted from the request, the bearer token is validated against the
//! identity provider, the PDP is asked for a verdict, and only a permitted
//! request is forwarded to the backend. Anything short of an explicit permit
//! is a deny.

pub mod action;
pub mod config;
pub mod decision;
pub mod forward;
pub mod identity;
pub mod observability;
pub mod pipeline;
pub mod proxy;

#[cfg(test)]
mod tests;
