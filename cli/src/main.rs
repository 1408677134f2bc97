use std::path;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use log::{error, warn};

use backend::{
    Config, EnvSessionKeys, HttpMultipartApi, HttpPartStore, SessionKeys, StaticSessionKeys,
};
use upload::guard::FsMarkerStore;
use upload::{upload_path, MultipartUploadClient, ProgressSink, UploadRegistry};

#[derive(Parser, Debug)]
struct Args {
    #[arg(
        short = 'i',
        long,
        value_parser = parse_file_path
    )]
    input: path::PathBuf,

    #[arg(short = 'j', long)]
    job_id: String,

    #[arg(short = 'u', long)]
    base_url: Option<String>,

    #[arg(short = 'k', long)]
    session_key: Option<String>,

    #[arg(short = 's', long)]
    state_dir: Option<path::PathBuf>,

    #[arg(short = 'q', long)]
    quiet: bool,
}

fn parse_file_path(path_str: &str) -> Result<path::PathBuf, String> {
    let path = path::PathBuf::from(path_str.to_string());
    if path.is_file() {
        Ok(path)
    } else {
        Err(format!("path {} is not a file", path_str))
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    simple_logger::init_with_level(log::Level::Info)?;
    let args = Args::parse();

    let base_url = args
        .base_url
        .or_else(|| Config.api_base_url())
        .ok_or_else(|| anyhow::anyhow!("no backend URL; pass --base-url or set CONVERT_API_BASE_URL"))?;
    let keys: Arc<dyn SessionKeys> = match &args.session_key {
        Some(key) => Arc::new(StaticSessionKeys::new(key.as_str())),
        None => Arc::new(EnvSessionKeys),
    };
    let state_dir = args.state_dir.unwrap_or_else(|| Config.state_dir());

    let api = Arc::new(HttpMultipartApi::new(&base_url, keys.clone())?);
    let store = Arc::new(HttpPartStore::new(reqwest::Client::new()));
    let client = MultipartUploadClient::new(
        api,
        store,
        Arc::new(UploadRegistry::new()),
        Arc::new(FsMarkerStore::new(&state_dir)),
        &state_dir,
    );

    let mut result = upload_path(&client, &args.input, &args.job_id, progress_sink(args.quiet)).await;

    // A rejected credential gets one refresh-and-retry before giving up;
    // every call re-reads the key, so a successful refresh is picked up.
    if matches!(&result, Err(e) if e.is_unauthorized()) {
        match keys.refresh().await {
            Ok(_) => {
                warn!("session key rejected; retrying with a refreshed credential");
                result =
                    upload_path(&client, &args.input, &args.job_id, progress_sink(args.quiet)).await;
            }
            Err(e) => warn!("could not refresh session key: {}", e),
        }
    }

    match result {
        Ok(()) => {
            println!("upload of {} complete", args.input.display());
            Ok(ExitCode::SUCCESS)
        }
        Err(e) if e.is_unauthorized() => {
            error!("session rejected by the backend: {}", e);
            eprintln!("the session key is invalid or expired; acquire a new one and retry");
            Ok(ExitCode::from(3))
        }
        Err(e) => {
            error!("upload failed: {}", e);
            Ok(ExitCode::FAILURE)
        }
    }
}

fn progress_sink(quiet: bool) -> Option<ProgressSink> {
    if quiet {
        return None;
    }
    Some(Box::new(|progress| {
        println!(
            "{:>6.2}%  {} / {}  ({} of {} parts)",
            progress.percentage,
            bytesize::ByteSize(progress.uploaded_bytes),
            bytesize::ByteSize(progress.total_bytes),
            progress.completed_parts,
            progress.total_parts_known,
        );
    }))
}
