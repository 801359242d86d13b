// /////////////////////////////////////////////////////////////////////////////
// Imageforge
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! Binary entry point: parse and validate the CLI, bring up the bootstrap
//! logger and the platform probe, then dispatch — build, inspect, or
//! (hidden) one helper process via the `host-service` subcommand.
//! Bring-up failures go through the bootstrap logger; once a build is
//! underway, diagnostics flow through tracing and the result channel.

use std::io::Read;

use imageforge::application::use_cases::build::{BuildRequest, BuildUseCase};
use imageforge::application::use_cases::inspect::InspectUseCase;
use imageforge::infrastructure::config::{ConfigFile, EngineConfig};
use imageforge::infrastructure::services::{helper_main, scan_module_registry};
use imageforge::presentation;
use imageforge_bootstrap::platform::{create_platform, Platform};
use imageforge_bootstrap::shutdown::ShutdownCoordinator;
use imageforge_bootstrap::{
    parse_and_validate, BootstrapLogger, ManifestSource, StderrLogger, ValidatedCommand,
};

fn main() {
    let cli = match parse_and_validate() {
        Ok(cli) => cli,
        Err(e) => {
            // Verbosity is unknown before parsing succeeds.
            StderrLogger::new(0).error(&e.to_string());
            std::process::exit(presentation::EXIT_MANIFEST_ERROR);
        }
    };

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .expect("tokio runtime");
    let code = runtime.block_on(run(cli));
    std::process::exit(code);
}

async fn run(cli: imageforge_bootstrap::ValidatedCli) -> i32 {
    let logger = StderrLogger::new(cli.verbose);
    presentation::init_tracing(cli.verbose);

    match cli.command {
        ValidatedCommand::HostService { role } => match helper_main(&role).await {
            Ok(()) => presentation::EXIT_SUCCESS,
            Err(e) => {
                logger.error(&format!("host-service {role}: {e}"));
                presentation::EXIT_BUILD_ERROR
            }
        },

        ValidatedCommand::Inspect {
            manifest,
            module_path,
            config,
        } => {
            let config = match load_config(None, config.as_deref(), &module_path, None, None) {
                Ok(config) => config,
                Err(e) => return fail_early(&logger, &e),
            };
            let text = match read_manifest(&manifest) {
                Ok(text) => text,
                Err(e) => return fail_early(&logger, &e),
            };
            let registry = scan_module_registry(&config.module_path);
            match InspectUseCase::new(registry).execute(&text) {
                Ok(plan) => {
                    println!("{}", serde_json::to_string_pretty(&plan).expect("plan json"));
                    presentation::EXIT_SUCCESS
                }
                Err(e) => fail_early(&logger, &e),
            }
        }

        ValidatedCommand::Build {
            manifest,
            store,
            output_directory,
            checkpoints,
            exports,
            cache_max_size,
            module_path,
            json,
            config,
        } => {
            let platform = create_platform();
            logger.debug(&format!(
                "platform {}, {} cpus, privileged: {}",
                platform.platform_name(),
                platform.cpu_count(),
                platform.is_privileged()
            ));

            let config = match load_config(
                Some(platform.as_ref()),
                config.as_deref(),
                &module_path,
                store.as_deref(),
                cache_max_size,
            ) {
                Ok(config) => config,
                Err(e) => return fail_early(&logger, &e),
            };
            logger.info(&format!("store at {}", config.store_root.display()));
            let text = match read_manifest(&manifest) {
                Ok(text) => text,
                Err(e) => return fail_early(&logger, &e),
            };

            let coordinator = ShutdownCoordinator::default();
            coordinator.install_signal_handlers();

            let monitor = presentation::select_monitor(json);
            let use_case =
                BuildUseCase::new(config, monitor).with_cancellation(coordinator.token());
            let record = use_case
                .execute(BuildRequest {
                    manifest_text: text,
                    checkpoints,
                    exports,
                    output_dir: output_directory,
                    started_at: platform.process_start_time(),
                    privileged: platform.is_privileged(),
                })
                .await;
            presentation::exit_code(&record)
        }
    }
}

fn fail_early(logger: &dyn BootstrapLogger, error: &imageforge::BuildError) -> i32 {
    logger.error(&error.to_string());
    presentation::exit_code_for_error(error)
}

/// Layers: defaults ← platform worker sizing ← config file ← environment
/// ← CLI flags.
fn load_config(
    platform: Option<&dyn Platform>,
    file: Option<&std::path::Path>,
    extra_module_path: &[std::path::PathBuf],
    store: Option<&std::path::Path>,
    cache_max_size: Option<u64>,
) -> Result<EngineConfig, imageforge::BuildError> {
    let mut config = EngineConfig::default();
    if let Some(platform) = platform {
        config.size_fetch_workers(platform.cpu_count());
    }
    if let Some(path) = file {
        config.apply(ConfigFile::load(path)?);
    }
    config.apply_env();
    if let Some(store) = store {
        config.store_root = store.to_path_buf();
    }
    if let Some(max) = cache_max_size {
        config.cache_max_size = Some(max);
    }
    if !extra_module_path.is_empty() {
        // CLI directories shadow the configured ones.
        let mut module_path = extra_module_path.to_vec();
        module_path.extend(config.module_path);
        config.module_path = module_path;
    }
    Ok(config)
}

/// Reads the manifest from its validated source.
fn read_manifest(source: &ManifestSource) -> Result<String, imageforge::BuildError> {
    match source {
        ManifestSource::Stdin => {
            let mut text = String::new();
            std::io::stdin()
                .read_to_string(&mut text)
                .map_err(|e| imageforge::BuildError::manifest_invalid(format!("reading stdin: {e}")))?;
            Ok(text)
        }
        ManifestSource::File(path) => std::fs::read_to_string(path).map_err(|e| {
            imageforge::BuildError::manifest_invalid(format!("reading {}: {e}", path.display()))
        }),
    }
}
