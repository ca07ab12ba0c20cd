use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[clap(author, version, about, long_about = None)]
pub struct Cli {
    #[clap(long, global = true, help = "Path to an alternate config.json")]
    pub config: Option<PathBuf>,
    #[clap(long, global = true, help = "API key (overrides config and JOBPILOT_API_KEY)")]
    pub api_key: Option<String>,
    #[clap(long, global = true, help = "API base URL override")]
    pub api_base_url: Option<String>,
    #[clap(long, global = true, help = "Write debug level logs to <config_dir>/logs/debug.log")]
    pub debug: bool,
    #[clap(long, global = true, help = "Max byte-range workers per transfer [1,32]")]
    pub max_threads: Option<usize>,
    #[clap(long, global = true, help = "Disable size-based worker auto scaling")]
    pub no_auto_scale: bool,
    #[clap(long, global = true, help = "Base backoff in ms between transient retries")]
    pub retry_backoff_ms: Option<u64>,
    #[clap(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    #[clap(subcommand, about = "Batch pipeline: archive, upload, create and submit jobs")]
    Pur(PurCmd),
    #[clap(subcommand, about = "Single file operations")]
    Files(FilesCmd),
    #[clap(subcommand, about = "Remote folder operations")]
    Folders(FoldersCmd),
    #[clap(subcommand, about = "Job operations")]
    Jobs(JobsCmd),
    #[clap(subcommand, about = "Completion daemon: poll and download finished jobs")]
    Daemon(DaemonCmd),
    // 内部命令：限流协调器由客户端按需自动拉起，不在帮助中展示
    #[clap(subcommand, hide = true)]
    Coordinator(CoordinatorCmd),
}

#[derive(Subcommand, Debug)]
pub enum PurCmd {
    #[clap(
        about = "Generate a template jobs csv from a directory of per-job subdirectories",
        name = "make-dirs-csv"
    )]
    MakeDirsCsv {
        #[clap(help = "Directory whose immediate subdirectories become rows")]
        root: PathBuf,
        #[clap(short, long, help = "Output csv path", default_value = "jobs.csv")]
        out: PathBuf,
    },
    #[clap(about = "Validate the csv and print the execution plan without remote calls")]
    Plan {
        #[clap(help = "Jobs csv")]
        csv: PathBuf,
        #[clap(long, help = "Existing state file to predict per-row stages from")]
        state: Option<PathBuf>,
    },
    #[clap(about = "Run the pipeline: tar -> upload -> create -> submit")]
    Run {
        #[clap(help = "Jobs csv")]
        csv: PathBuf,
        #[clap(long, default_value = "pur-state.csv", help = "Durable per-row state file")]
        state: PathBuf,
        #[clap(long, default_value_t = 2)]
        tar_workers: usize,
        #[clap(long, default_value_t = 3)]
        upload_workers: usize,
        #[clap(long, default_value_t = 4)]
        job_workers: usize,
        #[clap(long, help = "Record row failures and keep going")]
        continue_on_error: bool,
        #[clap(long, help = "Validate and print the plan, then exit 0")]
        dry_run: bool,
        #[clap(long, help = "Remove the local archive after a successful upload")]
        rm_tar_on_success: bool,
        #[clap(long, help = "Destination folder id for uploaded archives")]
        dest_folder: Option<String>,
        #[clap(long, help = "Include glob for archive entries (repeatable)")]
        include: Vec<String>,
        #[clap(long, help = "Exclude glob for archive entries (repeatable)")]
        exclude: Vec<String>,
        #[clap(long, help = "Strip directory prefixes inside the archive")]
        flatten: bool,
        #[clap(long, help = "Gzip-compress archives")]
        gzip: bool,
        #[clap(long, help = "Emit a single-line JSON summary")]
        json: bool,
    },
    #[clap(about = "Resume an interrupted run from its state file")]
    Resume {
        #[clap(help = "Jobs csv")]
        csv: PathBuf,
        #[clap(long, default_value = "pur-state.csv")]
        state: PathBuf,
        #[clap(long, default_value_t = 2)]
        tar_workers: usize,
        #[clap(long, default_value_t = 3)]
        upload_workers: usize,
        #[clap(long, default_value_t = 4)]
        job_workers: usize,
        #[clap(long)]
        continue_on_error: bool,
        #[clap(long)]
        rm_tar_on_success: bool,
        #[clap(long)]
        dest_folder: Option<String>,
        #[clap(long)]
        include: Vec<String>,
        #[clap(long)]
        exclude: Vec<String>,
        #[clap(long)]
        flatten: bool,
        #[clap(long)]
        gzip: bool,
        #[clap(long)]
        json: bool,
    },
    #[clap(
        about = "Create and submit jobs for files already uploaded",
        name = "submit-existing"
    )]
    SubmitExisting {
        #[clap(long, help = "Jobs csv whose rows carry extra_input_file_ids")]
        csv: Option<PathBuf>,
        #[clap(long, help = "Direct file ids (repeatable); mutually exclusive with --csv")]
        file_id: Vec<String>,
        #[clap(long, help = "Job name (direct-id mode)")]
        name: Option<String>,
        #[clap(long, help = "Job command (direct-id mode)")]
        command: Option<String>,
        #[clap(long, help = "Analysis code (direct-id mode)")]
        analysis_code: Option<String>,
        #[clap(long, help = "Analysis version (direct-id mode)")]
        analysis_version: Option<String>,
        #[clap(long, help = "Hardware profile code (direct-id mode)")]
        core_type: Option<String>,
        #[clap(long, help = "Wall-time budget in hours (direct-id mode)")]
        walltime_hours: Option<f64>,
        #[clap(long, default_value = "pur-state.csv")]
        state: PathBuf,
        #[clap(long)]
        continue_on_error: bool,
    },
}

#[derive(Subcommand, Debug)]
pub enum FilesCmd {
    #[clap(about = "Encrypt and upload a single file")]
    Upload {
        local: PathBuf,
        #[clap(long, help = "Destination folder id")]
        folder: Option<String>,
        #[clap(long, value_parser = parse_conflict_flag,
               help = "On conflict: skip|overwrite|resume (applies to all)")]
        on_conflict: Option<crate::conflict::ConflictChoice>,
    },
    #[clap(about = "Download and decrypt a single file by id")]
    Download {
        file_id: String,
        #[clap(short, long, help = "Output path (defaults to the remote name)")]
        out: Option<PathBuf>,
        #[clap(long, help = "Skip the plaintext checksum verification")]
        skip_checksum: bool,
    },
    #[clap(about = "List files", name = "ls")]
    List {
        #[clap(long, help = "Folder id to list (root when omitted)")]
        folder: Option<String>,
    },
    #[clap(about = "Delete a remote file", name = "rm")]
    Delete { file_id: String },
}

#[derive(Subcommand, Debug)]
pub enum FoldersCmd {
    #[clap(about = "Create a remote folder", name = "new")]
    Create {
        name: String,
        #[clap(long, help = "Parent folder id")]
        parent: Option<String>,
    },
    #[clap(about = "List folders", name = "ls")]
    List {
        #[clap(long)]
        parent: Option<String>,
    },
    #[clap(about = "Recursively upload a local directory", name = "upload-dir")]
    UploadDir {
        local: PathBuf,
        #[clap(long, help = "Destination folder id")]
        folder: Option<String>,
        #[clap(long, help = "Include hidden files")]
        include_hidden: bool,
        #[clap(long, value_parser = parse_conflict_flag,
               help = "On conflict: skip|overwrite|resume (applies to all)")]
        on_conflict: Option<crate::conflict::ConflictChoice>,
    },
    #[clap(about = "Recursively download a remote folder", name = "download-dir")]
    DownloadDir {
        folder_id: String,
        #[clap(short, long, default_value = ".")]
        out: PathBuf,
        #[clap(long, value_parser = parse_conflict_flag,
               help = "On conflict: skip|overwrite|resume|merge (applies to all)")]
        on_conflict: Option<crate::conflict::ConflictChoice>,
    },
    #[clap(about = "Delete a remote folder", name = "rm")]
    Delete { folder_id: String },
}

#[derive(Subcommand, Debug)]
pub enum JobsCmd {
    #[clap(about = "List jobs", name = "ls")]
    List {
        #[clap(long, help = "Only jobs whose name starts with the prefix")]
        name_prefix: Option<String>,
    },
    #[clap(about = "Show one job")]
    Get { job_id: String },
    #[clap(about = "Submit a created job")]
    Submit { job_id: String },
    #[clap(about = "Stop a running job")]
    Stop { job_id: String },
    #[clap(about = "Poll and print the tail of a job output file")]
    Tail {
        job_id: String,
        #[clap(default_value = "process_output.log")]
        file_name: String,
        #[clap(long, default_value_t = 5, help = "Poll interval in seconds")]
        interval: u64,
    },
    #[clap(about = "List a job's output files")]
    Listfiles { job_id: String },
    #[clap(about = "Download all output files of a job")]
    Download {
        job_id: String,
        #[clap(short, long, default_value = ".")]
        out: PathBuf,
        #[clap(long)]
        skip_checksum: bool,
    },
    #[clap(about = "Delete a job", name = "rm")]
    Delete { job_id: String },
}

#[derive(Subcommand, Debug)]
pub enum DaemonCmd {
    #[clap(about = "Run the completion daemon in the foreground")]
    Run {
        #[clap(long, default_value_t = 300, help = "Poll interval in seconds [30, 86400]")]
        interval: u64,
        #[clap(long, help = "Only jobs whose name starts with the prefix")]
        name_prefix: Option<String>,
        #[clap(long, help = "Only jobs whose name contains the string")]
        name_contains: Option<String>,
        #[clap(long, help = "Skip jobs whose name contains the string")]
        name_exclude: Option<String>,
        #[clap(long, default_value = "downloads", help = "Root directory for job outputs")]
        output_root: PathBuf,
    },
    #[clap(about = "Query a running daemon")]
    Status,
    #[clap(about = "Stop a running daemon")]
    Stop,
    #[clap(about = "Pause polling without exiting")]
    Pause,
    #[clap(about = "Resume a paused daemon")]
    Resume,
    #[clap(about = "List journaled downloads", name = "ls")]
    List,
    #[clap(about = "Mark a failed journal entry for retry")]
    Retry { job_id: String },
}

#[derive(Subcommand, Debug)]
pub enum CoordinatorCmd {
    #[clap(about = "Run the rate-limit coordinator (auto-spawned by clients)")]
    Run,
    #[clap(about = "Dump coordinator state")]
    State,
    #[clap(about = "Shut down the coordinator")]
    Stop,
}

fn parse_conflict_flag(s: &str) -> Result<crate::conflict::ConflictChoice, String> {
    crate::conflict::ConflictChoice::parse_flag(s)
        .ok_or_else(|| format!("未知冲突策略 '{}'（可选 skip|overwrite|resume|merge）", s))
}
