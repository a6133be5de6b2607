// Licensed to the Apache Software Foundation (ASF) under one
// or more contributor license agreements.  See the NOTICE file
// distributed with this work for additional information
// regarding copyright ownership.  The ASF licenses this file
// to you under the Apache License, Version 2.0 (the
// "License"); you may not use this file except in compliance
// with the License.  You may obtain a copy of the License at
//
//   http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing,
// software distributed under the License is distributed on an
// "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied.  See the License for the
// specific language governing permissions and limitations
// under the License.

//! Quiver: hash-join build and probe with arbitrated memory and spilling.
//!
//! Pipelines run on [`execution::driver::Driver`]s. Each operator allocates from a
//! leaf [`execution::memory_pools::MemoryPoolImpl`]; when a query pool runs out of
//! capacity the [`execution::memory_pools::SharedArbitrator`] grows it, shrinks idle
//! pools, or reclaims memory by asking operators such as
//! [`execution::joins::HashBuild`] to spill.

#![allow(clippy::upper_case_acronyms)]
// The clippy throws an error if the reference clone not wrapped into `Arc::clone`
// The lint makes easier for code reader/reviewer separate references clones from more heavyweight ones
#![deny(clippy::clone_on_ref_ptr)]

use log::{info, LevelFilter};
use log4rs::{
    append::console::{ConsoleAppender, Target},
    config::{load_config_file, Appender, Deserializers, Root},
    encode::pattern::PatternEncoder,
    Config,
};
use once_cell::sync::OnceCell;

pub use errors::{ExecError, ExecResult};

pub mod errors;
pub mod execution;

static LOGGER: OnceCell<()> = OnceCell::new();

/// Initializes logging once per process. An empty or missing path falls back to
/// logging `INFO` and above to stderr.
pub fn init_logging(log_conf_path: Option<&str>) -> ExecResult<()> {
    LOGGER.get_or_try_init(|| {
        let log_config = match log_conf_path {
            Some(path) if !path.is_empty() => load_config_file(path, Deserializers::default())
                .map_err(|err| ExecError::Config(err.to_string())),
            _ => default_logger_config(),
        }?;
        // Another logger may already be installed by the embedding engine.
        let _ = log4rs::init_config(log_config)
            .map_err(|err| ExecError::Config(err.to_string()));

        let version = env!("CARGO_PKG_VERSION");
        info!("Quiver native library version {version} initialized");
        Ok::<(), ExecError>(())
    })?;
    Ok(())
}

const LOG_PATTERN: &str = "{d(%y/%m/%d %H:%M:%S)} {l} {f}: {m}{n}";

// Creates a default log4rs config, which logs to console with `INFO` level.
fn default_logger_config() -> ExecResult<Config> {
    let console_append = ConsoleAppender::builder()
        .target(Target::Stderr)
        .encoder(Box::new(PatternEncoder::new(LOG_PATTERN)))
        .build();
    let appender = Appender::builder().build("console", Box::new(console_append));
    let root = Root::builder().appender("console").build(LevelFilter::Info);
    Config::builder()
        .appender(appender)
        .build(root)
        .map_err(|err| ExecError::Config(err.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn logging_initializes_once() {
        init_logging(None).unwrap();
        init_logging(Some("")).unwrap();
    }
}
