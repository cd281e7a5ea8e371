use anyhow::Result;

use api_gateway::{config, jwt::TokenValidator, routes::RouteTable};

/// Check that the configuration, route table, and public key all load.
pub fn execute() -> Result<()> {
    let cfg = config::load_config()?;
    println!("Configuration OK ({}:{})", cfg.server.host, cfg.server.port);

    let routes = RouteTable::load(&cfg.routes_file)?;
    println!("Routes OK ({} routes from {})", routes.len(), cfg.routes_file);
    for route in routes.routes() {
        println!(
            "  {} -> {} (strip_prefix={}, timeout={:?})",
            route.path_prefix, route.target, route.strip_prefix, route.timeout
        );
    }

    TokenValidator::from_pem_file(&cfg.auth.public_key_path, cfg.auth.issuer.clone())?;
    println!("Public key OK ({})", cfg.auth.public_key_path);

    Ok(())
}
