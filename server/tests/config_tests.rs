//! Server configuration tests

use beamdrop_server::config::ServerConfig;

// Environment access is process-global, so everything lives in one test.
#[test]
fn config_from_env_defaults_and_overrides() {
    std::env::remove_var("PORT");
    std::env::remove_var("BD_HOST");
    std::env::remove_var("BD_MAX_CONNECTIONS");

    let config = ServerConfig::from_env().unwrap();
    assert_eq!(config.host, "0.0.0.0");
    assert_eq!(config.port, 80);
    assert_eq!(config.data_dir, "data");
    assert_eq!(config.upload_dir, "uploads");
    assert_eq!(config.max_connections, 2000);
    assert_eq!(config.max_connections_per_ip, 0);

    std::env::set_var("PORT", "8088");
    std::env::set_var("BD_HOST", "127.0.0.1");
    std::env::set_var("BD_MAX_CONNECTIONS", "10");
    let config = ServerConfig::from_env().unwrap();
    assert_eq!(config.port, 8088);
    assert_eq!(config.host, "127.0.0.1");
    assert_eq!(config.max_connections, 10);

    std::env::set_var("PORT", "not_a_port");
    assert!(ServerConfig::from_env().is_err());

    std::env::remove_var("PORT");
    std::env::remove_var("BD_HOST");
    std::env::remove_var("BD_MAX_CONNECTIONS");
}
