//! Effective server configuration.

use datasync_server::ServerConfig;
use std::path::Path;

/// Loads and validates `path`, or the defaults when no file is given.
pub fn load(path: Option<&Path>) -> Result<ServerConfig, Box<dyn std::error::Error>> {
    match path {
        Some(path) => {
            let json = std::fs::read_to_string(path)
                .map_err(|e| format!("Cannot read {:?}: {}", path, e))?;
            let config = ServerConfig::from_json(&json)?;
            config.validate()?;
            Ok(config)
        }
        None => Ok(ServerConfig::default()),
    }
}

/// Runs the config command.
pub fn run(path: Option<&Path>) -> Result<(), Box<dyn std::error::Error>> {
    let config = load(path)?;
    println!("{}", serde_json::to_string_pretty(&config)?);
    Ok(())
}
