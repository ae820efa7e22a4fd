// CUSE RPMB character-device backend
//
// Copyright 2023 Linaro Ltd. All Rights Reserved.
//
// SPDX-License-Identifier: Apache-2.0 or BSD-3-Clause

use std::process;

use clap::Parser;
use cuse_device_rpmb::*;
use log::{error, info, LevelFilter};

fn init_logging(args: &RpmbArgs) {
    let level = if args.quiet {
        LevelFilter::Off
    } else if args.debug {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    };
    env_logger::Builder::from_default_env()
        .filter_level(level)
        .init();
}

fn main() {
    let args = RpmbArgs::parse();
    init_logging(&args);

    let config = match RpmbConfig::try_from(args) {
        Ok(config) => config,
        Err(err) => {
            error!("{err}");
            process::exit(2);
        }
    };

    info!("cuse-device-rpmb starting (pid {})", process::id());
    info!("state file: {}", config.state_file.display());
    info!("device:     /dev/{}", config.dev_name);
    info!("data area:  {} blocks of 256 bytes", config.max_blocks);

    if let Err(err) = start_device(&config) {
        error!("device failed: {err}");
        process::exit(1);
    }
}
