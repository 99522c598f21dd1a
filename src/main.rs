//
// wxvisor
//
// Copyright 2025- Manos Pitsidianakis
//
// This file is part of wxvisor.
//
// wxvisor is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// wxvisor is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with wxvisor. If not, see <http://www.gnu.org/licenses/>.
//
// SPDX-License-Identifier: EUPL-1.2 OR GPL-3.0-or-later

use clap::Parser;
use wxvisor::{
    cli::Args,
    machine::{guest::Guest, script::Script},
};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    env_logger::builder()
        .filter_level(match args.verbose {
            0 => log::LevelFilter::Warn,
            1 => log::LevelFilter::Info,
            2 => log::LevelFilter::Debug,
            _ => log::LevelFilter::Trace,
        })
        .parse_default_env()
        .init();

    let config = args.platform_config()?;
    let script = Script::from_path(&args.script)?;
    let mut guest = Guest::boot(config)?;
    let report = script.replay(&mut guest);
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}
