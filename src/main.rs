// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

use anyhow::{Context, Result};
use clap::Parser;

use steamfetch::health::check_binary;
use steamfetch::{logging, App, Config};

/// Exit codes following sysexits.h conventions
mod exit_codes {
    /// General error
    pub const ERROR: i32 = 1;
    /// Required service (the download utility) is unavailable
    pub const SERVICE_UNAVAILABLE: i32 = 69;
    /// Invalid configuration
    pub const CONFIG: i32 = 78;
}

fn main() -> Result<()> {
    let config = Config::parse();

    if let Err(e) = logging::init(&config) {
        eprintln!("[!] Failed to initialize logging: {:#}", e);
        std::process::exit(exit_codes::ERROR);
    }

    if let Err(e) = config.validate() {
        tracing::error!(error = %e, "Invalid configuration");
        std::process::exit(exit_codes::CONFIG);
    }

    let binary = check_binary(&config.steamcmd_path);
    if !binary.ok {
        tracing::error!(detail = %binary.detail, "SteamCMD installation not usable");
        std::process::exit(exit_codes::SERVICE_UNAVAILABLE);
    }

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        api = %config.api_addr(),
        metrics = config.enable_metrics,
        max_downloads = config.max_downloads,
        storage = %config.storage_path.display(),
        "Starting steamfetch"
    );

    let runtime = tokio::runtime::Runtime::new().context("Failed to create async runtime")?;
    runtime.block_on(async {
        let app = App::build(config)?;
        app.run().await
    })
}
