//! Data plane scenarios driven through the ingest and egress loops
//!
//! Run with: cargo test --test dataplane

mod home_router;
mod loops;
mod packets;
mod state_sync;
