/*
    SPDX-License-Identifier: AGPL-3.0-or-later
    SPDX-FileCopyrightText: 2025 Shomy
*/
mod commands;
use commands::Command;
use env_logger::Builder;
use log::error;
use secrypt::{EngineConfig, SecurityEngine};
use std::process::ExitCode;
use std::str::FromStr;
use strum::IntoEnumIterator;

fn usage() {
    eprintln!("usage: sectl <command> [args...]");
    eprintln!("commands:");
    for cmd in Command::iter() {
        eprintln!("  {:<10} {}", cmd.as_ref(), cmd.help());
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    Builder::new()
        .parse_default_env()
        .write_style(env_logger::WriteStyle::Auto)
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let Some((name, rest)) = args.split_first() else {
        usage();
        return ExitCode::FAILURE;
    };
    let Ok(cmd) = Command::from_str(name) else {
        eprintln!("unknown command '{}'", name);
        usage();
        return ExitCode::FAILURE;
    };

    let (engine, _accel) = match SecurityEngine::soft(EngineConfig::default()) {
        Ok(pair) => pair,
        Err(err) => {
            error!("Failed to bring up the engine: {}", err);
            return ExitCode::FAILURE;
        }
    };

    match cmd.run(&engine, rest).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("sectl {}: {}", cmd.as_ref(), err);
            ExitCode::FAILURE
        }
    }
}
