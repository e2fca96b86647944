//! Listen-address parsing tests (spec section 6), exercised through the
//! library crate rather than the binary.

use hostpulse_agent::config::AgentConfig;
use hostpulse_agent::connection::server::{parse_listen_address, ListenTarget};
use std::path::PathBuf;

#[test]
fn bare_port_becomes_colon_prefixed_tcp() {
    assert_eq!(parse_listen_address("45876", None), ListenTarget::Tcp(":45876".to_string()));
}

#[test]
fn slash_prefixed_value_is_unix_socket() {
    assert_eq!(parse_listen_address("/run/hostpulse.sock", None), ListenTarget::Unix(PathBuf::from("/run/hostpulse.sock")));
}

#[test]
fn network_env_var_overrides_shape_inference() {
    assert_eq!(parse_listen_address("/looks/like/a/path", Some("tcp")), ListenTarget::Tcp(":/looks/like/a/path".to_string()));
}

// Both LISTEN/PORT cases live in one test: process env is global state, and
// cargo runs tests in this file in the same process concurrently, so two
// separate tests mutating the same vars would race.
#[test]
fn listen_and_legacy_port_env_vars_are_read_by_agent_config() {
    std::env::remove_var("BESZEL_AGENT_LISTEN");
    std::env::remove_var("BESZEL_AGENT_PORT");

    std::env::set_var("LISTEN", ":9001");
    std::env::remove_var("PORT");
    assert_eq!(AgentConfig::from_env().listen, ":9001");

    std::env::remove_var("LISTEN");
    std::env::set_var("PORT", "9002");
    assert_eq!(AgentConfig::from_env().listen, "9002");

    std::env::remove_var("PORT");
}
