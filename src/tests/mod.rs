//! End-to-end tests.
//!
//! These drive the full router, or the running listener, against wiremock
//! doubles of the identity provider, the PDP and the backend.

mod pipeline_e2e;
