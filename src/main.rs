use anyhow::Result;
use clap::Parser;
use std::fs::OpenOptions;
use tracing_appender::non_blocking;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, fmt};

use jobpilot::cli::{
    Cli, Commands, CoordinatorCmd, DaemonCmd, FilesCmd, FoldersCmd, JobsCmd, PurCmd,
};
use jobpilot::commands::{self, PurRunArgs, Services};
use jobpilot::config::Config;

fn main() {
    let cli = Cli::parse();
    let mut config = Config::init(cli.config.clone());
    if let Some(key) = &cli.api_key {
        config.api_key = key.clone();
    }
    if let Some(url) = &cli.api_base_url {
        config.api_base_url = url.clone();
    }
    if let Some(n) = cli.max_threads {
        config.max_threads = n.clamp(1, 32);
    }
    if cli.no_auto_scale {
        config.auto_scale = false;
    }
    if let Some(ms) = cli.retry_backoff_ms {
        jobpilot::util::set_backoff_ms(ms);
    }

    init_tracing_if_requested(&config, cli.debug);
    jobpilot::util::init_failure_dir(config.logs_dir());
    jobpilot::util::install_cancel_handler();

    match dispatch(cli, config) {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            eprintln!("❌ {}", e);
            std::process::exit(1);
        }
    }
}

fn dispatch(cli: Cli, config: Config) -> Result<i32> {
    match cli.command {
        Commands::Pur(cmd) => match cmd {
            PurCmd::MakeDirsCsv { root, out } => {
                commands::handle_pur_make_dirs_csv(&root, &out)?;
                Ok(0)
            }
            PurCmd::Plan { csv, state } => {
                commands::handle_pur_plan(&csv, state.as_deref())?;
                Ok(0)
            }
            PurCmd::Run {
                csv,
                state,
                tar_workers,
                upload_workers,
                job_workers,
                continue_on_error,
                dry_run,
                rm_tar_on_success,
                dest_folder,
                include,
                exclude,
                flatten,
                gzip,
                json,
            } => {
                let svc = Services::init(config)?;
                commands::handle_pur_run(
                    &svc,
                    PurRunArgs {
                        csv,
                        state,
                        tar_workers,
                        upload_workers,
                        job_workers,
                        continue_on_error,
                        dry_run,
                        rm_tar_on_success,
                        dest_folder,
                        include,
                        exclude,
                        flatten,
                        gzip,
                        json,
                    },
                )
            }
            PurCmd::Resume {
                csv,
                state,
                tar_workers,
                upload_workers,
                job_workers,
                continue_on_error,
                rm_tar_on_success,
                dest_folder,
                include,
                exclude,
                flatten,
                gzip,
                json,
            } => {
                let svc = Services::init(config)?;
                commands::handle_pur_run(
                    &svc,
                    PurRunArgs {
                        csv,
                        state,
                        tar_workers,
                        upload_workers,
                        job_workers,
                        continue_on_error,
                        dry_run: false,
                        rm_tar_on_success,
                        dest_folder,
                        include,
                        exclude,
                        flatten,
                        gzip,
                        json,
                    },
                )
            }
            PurCmd::SubmitExisting {
                csv,
                file_id,
                name,
                command,
                analysis_code,
                analysis_version,
                core_type,
                walltime_hours,
                state,
                continue_on_error,
            } => {
                let svc = Services::init(config)?;
                commands::handle_pur_submit_existing(
                    &svc,
                    csv.as_deref(),
                    &file_id,
                    name,
                    command,
                    analysis_code,
                    analysis_version,
                    core_type,
                    walltime_hours,
                    &state,
                    continue_on_error,
                )
            }
        },
        Commands::Files(cmd) => {
            let svc = Services::init(config)?;
            match cmd {
                FilesCmd::Upload { local, folder, on_conflict } => {
                    commands::handle_files_upload(&svc, &local, folder, on_conflict)?
                }
                FilesCmd::Download { file_id, out, skip_checksum } => {
                    commands::handle_files_download(&svc, &file_id, out, skip_checksum)?
                }
                FilesCmd::List { folder } => commands::handle_files_list(&svc, folder)?,
                FilesCmd::Delete { file_id } => commands::handle_files_delete(&svc, &file_id)?,
            }
            Ok(0)
        }
        Commands::Folders(cmd) => {
            let svc = Services::init(config)?;
            match cmd {
                FoldersCmd::Create { name, parent } => {
                    commands::handle_folders_create(&svc, &name, parent)?
                }
                FoldersCmd::List { parent } => commands::handle_folders_list(&svc, parent)?,
                FoldersCmd::UploadDir { local, folder, include_hidden, on_conflict } => {
                    commands::handle_folders_upload_dir(
                        &svc,
                        &local,
                        folder,
                        include_hidden,
                        on_conflict,
                    )?
                }
                FoldersCmd::DownloadDir { folder_id, out, on_conflict } => {
                    commands::handle_folders_download_dir(&svc, &folder_id, &out, on_conflict)?
                }
                FoldersCmd::Delete { folder_id } => {
                    commands::handle_folders_delete(&svc, &folder_id)?
                }
            }
            Ok(0)
        }
        Commands::Jobs(cmd) => {
            let svc = Services::init(config)?;
            match cmd {
                JobsCmd::List { name_prefix } => commands::handle_jobs_list(&svc, name_prefix)?,
                JobsCmd::Get { job_id } => commands::handle_jobs_get(&svc, &job_id)?,
                JobsCmd::Submit { job_id } => commands::handle_jobs_submit(&svc, &job_id)?,
                JobsCmd::Stop { job_id } => commands::handle_jobs_stop(&svc, &job_id)?,
                JobsCmd::Tail { job_id, file_name, interval } => {
                    commands::handle_jobs_tail(&svc, &job_id, &file_name, interval)?
                }
                JobsCmd::Listfiles { job_id } => {
                    commands::handle_jobs_listfiles(&svc, &job_id)?
                }
                JobsCmd::Download { job_id, out, skip_checksum } => {
                    commands::handle_jobs_download(&svc, &job_id, &out, skip_checksum)?
                }
                JobsCmd::Delete { job_id } => commands::handle_jobs_delete(&svc, &job_id)?,
            }
            Ok(0)
        }
        Commands::Daemon(cmd) => match cmd {
            DaemonCmd::Run { interval, name_prefix, name_contains, name_exclude, output_root } => {
                let svc = Services::init(config)?;
                commands::handle_daemon_run(
                    &svc,
                    interval,
                    name_prefix,
                    name_contains,
                    name_exclude,
                    output_root,
                )?;
                Ok(0)
            }
            DaemonCmd::Status => {
                commands::handle_daemon_status()?;
                Ok(0)
            }
            DaemonCmd::Stop => {
                commands::handle_daemon_simple(
                    jobpilot::daemon::ControlRequest::Stop,
                    "守护进程已停止",
                )?;
                Ok(0)
            }
            DaemonCmd::Pause => {
                commands::handle_daemon_simple(
                    jobpilot::daemon::ControlRequest::Pause,
                    "守护进程已暂停",
                )?;
                Ok(0)
            }
            DaemonCmd::Resume => {
                commands::handle_daemon_simple(
                    jobpilot::daemon::ControlRequest::Resume,
                    "守护进程已恢复",
                )?;
                Ok(0)
            }
            DaemonCmd::List => {
                commands::handle_daemon_list(&config)?;
                Ok(0)
            }
            DaemonCmd::Retry { job_id } => {
                commands::handle_daemon_retry(&config, &job_id)?;
                Ok(0)
            }
        },
        Commands::Coordinator(cmd) => match cmd {
            CoordinatorCmd::Run => {
                commands::handle_coordinator_run()?;
                Ok(0)
            }
            CoordinatorCmd::State => {
                commands::handle_coordinator_state()?;
                Ok(0)
            }
            CoordinatorCmd::Stop => {
                commands::handle_coordinator_stop()?;
                Ok(0)
            }
        },
    }
}

fn init_tracing_if_requested(cfg: &Config, debug: bool) {
    // All tracing output goes into the canonical debug log file only; console
    // output stays clean for progress bars and summaries.
    let logs_dir = cfg.logs_dir();
    let _ = std::fs::create_dir_all(&logs_dir);
    let log_path = logs_dir.join("debug.log");
    let level_str = if debug { "debug" } else { "warn" };

    match OpenOptions::new().create(true).append(true).open(&log_path) {
        Ok(file) => {
            let (non_blocking_writer, guard) = non_blocking(file);
            // Leak the worker guard so the background thread stays alive for
            // the duration of the process.
            let _ = Box::leak(Box::new(guard));
            let file_layer = fmt::layer()
                .with_writer(non_blocking_writer)
                .with_ansi(false)
                .with_filter(EnvFilter::new(level_str));
            tracing_subscriber::registry().with(file_layer).init();
        }
        Err(e) => {
            eprintln!("warning: could not open debug log at {}: {}", log_path.display(), e);
        }
    }
}
