mod cli;

use std::process::ExitCode;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use clap::Parser;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::prelude::*;

use srpmgraph::build_lock::{BuildSessionGuard, BuildSessionKind};
use srpmgraph::error::CoreError;
use srpmgraph::ui::{ProgressLayer, ProgressUi};
use srpmgraph::Engine;

fn install_tracing(progress_sink: Option<Arc<dyn Fn(String) + Send + Sync>>) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);
    match progress_sink {
        Some(sink) => {
            registry.with(ProgressLayer::new(sink)).init();
        }
        None => {
            registry.with(tracing_subscriber::fmt::layer()).init();
        }
    }
}

fn install_cancellation_handler(cancellation: Arc<AtomicBool>) {
    let flag = cancellation.clone();
    let _ = ctrlc::set_handler(move || {
        flag.store(true, Ordering::SeqCst);
    });
}

fn core_error_exit(err: &CoreError) -> ExitCode {
    eprintln!("error: {err}");
    ExitCode::from(err.exit_code() as u8)
}

fn anyhow_exit(err: &anyhow::Error) -> ExitCode {
    eprintln!("error: {err:#}");
    ExitCode::FAILURE
}

fn main() -> ExitCode {
    let cli = cli::Cli::parse();

    match cli.command {
        cli::Command::Analyze(args) => {
            install_tracing(None);
            let config = match args.common.resolve_config() {
                Ok(c) => c,
                Err(err) => return anyhow_exit(&err),
            };
            let engine = match Engine::new(config) {
                Ok(e) => e,
                Err(err) => return anyhow_exit(&err),
            };
            match engine.analyze(&args.target) {
                Ok(info) => {
                    println!(
                        "name={} version={} release={} epoch={} nvr={} sources={} build_requires={}",
                        info.name,
                        info.version,
                        info.release,
                        info.epoch.as_deref().unwrap_or("none"),
                        info.nvr(),
                        info.source_urls.join(","),
                        info.build_requires
                            .iter()
                            .map(|r| r.to_token())
                            .collect::<Vec<_>>()
                            .join(", ")
                    );
                    ExitCode::SUCCESS
                }
                Err(err) => core_error_exit(&err),
            }
        }
        cli::Command::Plan(args) => {
            install_tracing(None);
            let config = match args.common.resolve_config() {
                Ok(c) => c,
                Err(err) => return anyhow_exit(&err),
            };
            let engine = match Engine::new(config) {
                Ok(e) => e,
                Err(err) => return anyhow_exit(&err),
            };
            match engine.plan(&args.target) {
                Ok(plan) => {
                    for (level, names) in plan.chain.iter().enumerate() {
                        println!("level={level} packages={}", names.iter().cloned().collect::<Vec<_>>().join(","));
                    }
                    let unresolved: Vec<&str> = plan
                        .graph
                        .values()
                        .filter(|n| !n.is_available && n.archive_path.is_none())
                        .map(|n| n.name.as_str())
                        .collect();
                    if !unresolved.is_empty() {
                        println!("unresolved={}", unresolved.join(","));
                    }
                    ExitCode::SUCCESS
                }
                Err(err) => core_error_exit(&err),
            }
        }
        cli::Command::Download(args) => {
            install_tracing(None);
            let config = match args.common.resolve_config() {
                Ok(c) => c,
                Err(err) => return anyhow_exit(&err),
            };
            let engine = match Engine::new(config) {
                Ok(e) => e,
                Err(err) => return anyhow_exit(&err),
            };
            match engine.download_only(&args.name, args.version.as_deref()) {
                Ok(path) => {
                    println!("archive_path={}", path.display());
                    ExitCode::SUCCESS
                }
                Err(err) => core_error_exit(&err),
            }
        }
        cli::Command::Build(args) => {
            let mut config = match args.common.resolve_config() {
                Ok(c) => c,
                Err(err) => return anyhow_exit(&err),
            };
            args.apply_onto(&mut config);

            let ui_mode = args.ui.resolve();
            let mut progress_ui = if ui_mode == cli::UiMode::Ratatui {
                Some(ProgressUi::start(format!("srpmgraph build ({})", args.target)))
            } else {
                None
            };
            install_tracing(progress_ui.as_ref().map(|ui| ui.sink()));

            let cache_dir = config.archive_cache_dir.clone();
            let _session = match BuildSessionGuard::acquire(&cache_dir, &args.target, BuildSessionKind::Build) {
                Ok(guard) => guard,
                Err(err) => {
                    if let Some(ui) = progress_ui.take() {
                        ui.finish(format!("build failed: workspace lock error: {err}"));
                    }
                    return anyhow_exit(&err);
                }
            };

            let engine = match Engine::new(config) {
                Ok(e) => e,
                Err(err) => {
                    if let Some(ui) = progress_ui.take() {
                        ui.finish(format!("build failed: {err}"));
                    }
                    return anyhow_exit(&err);
                }
            };

            let cancellation = progress_ui
                .as_ref()
                .map(|ui| ui.cancel_requested())
                .unwrap_or_else(|| Arc::new(AtomicBool::new(false)));
            install_cancellation_handler(cancellation.clone());

            let outcome = engine.build(&args.target, cancellation);

            if let Ok(result) = &outcome {
                match srpmgraph::report::write_build_report(&cache_dir, &args.target, result) {
                    Ok(path) => tracing::info!(report = %path.display(), "wrote build report"),
                    Err(err) => tracing::warn!(error = %err, "failed to write build report"),
                }
            }

            if let Some(ui) = progress_ui.take() {
                let summary = match &outcome {
                    Ok(result) => format!(
                        "build {} built={} failed={} elapsed={:.1}s",
                        if result.success { "succeeded" } else { "failed" },
                        result.built_packages.len(),
                        result.failed_packages.len(),
                        result.total_seconds
                    ),
                    Err(err) => format!("build failed: {err}"),
                };
                ui.finish(summary);
            }

            match outcome {
                Ok(result) => {
                    println!(
                        "success={} built={} failed={} total_seconds={:.2} built_packages={} failed_packages={}",
                        result.success,
                        result.built_packages.len(),
                        result.failed_packages.len(),
                        result.total_seconds,
                        result.built_packages.join(","),
                        result.failed_packages.join(",")
                    );
                    if result.success {
                        ExitCode::SUCCESS
                    } else {
                        ExitCode::from(CoreError::HubBuild {
                            kind: srpmgraph::error::HubBuildErrorKind::TaskFailed,
                            message: "one or more build tasks did not complete".to_string(),
                        }
                        .exit_code() as u8)
                    }
                }
                Err(err) => core_error_exit(&err),
            }
        }
    }
}

