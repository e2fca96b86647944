//! Host-resident telemetry agent library: sampling engine, container
//! manager, subprocess collectors, session cache, connection manager, and
//! configuration reconciler (see each module's header for its spec section).

pub mod agent;
pub mod cache;
pub mod config;
pub mod connection;
pub mod containers;
pub mod fingerprint;
pub mod gpu;
pub mod host;
pub mod rate;
pub mod sampler;
pub mod sensors;
pub mod smart;
pub mod snapshot;
