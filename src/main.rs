use circlefy::{
    archive_digest, deduplicate_url_lines, filter_valid_urls, inspect_archive, package_app,
    validation, ArchiveCodec, CirclefyError, Config, MachoPlatformPatcher, Notifier,
    PlatformCode, ProgressSink, Repackager, Result, Severity, Stage,
};
use clap::{Parser, Subcommand};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "circlefy")]
#[command(about = "Rewrite an IPA's platform marker and check repository sources")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// TOML config file
    #[arg(long, global = true, env = "CIRCLEFY_CONFIG")]
    config: Option<PathBuf>,

    /// Where finished IPAs and extracted trees go
    #[arg(long, global = true)]
    documents_dir: Option<PathBuf>,

    /// Seconds to wait for the patch routine
    #[arg(long, global = true)]
    timeout: Option<u64>,

    /// The compression level of the ipa (0-9)
    #[arg(short = 'c', long, global = true, value_parser = clap::value_parser!(u32).range(0..=9))]
    compress: Option<u32>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Patch the main executable of an IPA and repackage it
    Patch {
        /// The .ipa to modify (left untouched)
        input: PathBuf,

        /// visionos (Circle), macos (No Mask), ios, or a raw platform number
        #[arg(short, long, default_value = "visionos")]
        platform: PlatformCode,

        /// The input is an already signed IPA
        #[arg(short, long)]
        signed: bool,

        /// Move the result here instead of leaving it in the documents dir
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Overwrite existing files without confirming
        #[arg(long)]
        overwrite: bool,
    },

    /// Print the name, bundle id, version and digest of an IPA
    Inspect {
        input: PathBuf,
    },

    /// Wrap a bare .app folder into an IPA
    Pack {
        app: PathBuf,

        /// Output path (defaults to <app>.ipa)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Fetch and validate repository sources
    Validate {
        urls: Vec<String>,

        /// Read additional URLs from a file, one per line
        #[arg(short, long)]
        file: Option<PathBuf>,

        /// Maximum requests in flight
        #[arg(long, default_value = "4")]
        concurrency: usize,
    },

    /// Print only the valid http(s) URLs from a list
    FilterUrls {
        /// Defaults to stdin
        file: Option<PathBuf>,
    },

    /// Remove repeated URL lines from a list
    DedupeUrls {
        /// Defaults to stdin
        file: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    if let Err(e) = run().await {
        eprintln!("[!] {}", e);
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    let cli = Cli::parse();
    let config = load_config(&cli)?;

    match cli.command {
        Commands::Patch {
            input,
            platform,
            signed,
            output,
            overwrite,
        } => run_patch(config, input, platform, signed, output, overwrite).await,
        Commands::Inspect { input } => run_inspect(&input),
        Commands::Pack { app, output } => run_pack(&config, &app, output),
        Commands::Validate {
            urls,
            file,
            concurrency,
        } => run_validate(urls, file, concurrency).await,
        Commands::FilterUrls { file } => {
            for url in filter_valid_urls(&read_input(file.as_deref())?) {
                println!("{}", url);
            }
            Ok(())
        }
        Commands::DedupeUrls { file } => {
            let (text, removed) = deduplicate_url_lines(&read_input(file.as_deref())?);
            println!("{}", text);
            if !removed.is_empty() {
                eprintln!(
                    "[?] {} duplicate {} removed",
                    removed.len(),
                    if removed.len() == 1 { "URL" } else { "URLs" }
                );
            }
            Ok(())
        }
    }
}

fn load_config(cli: &Cli) -> Result<Config> {
    let mut config = Config::load_or_default(cli.config.as_deref())?;
    if let Some(ref dir) = cli.documents_dir {
        config = config.with_documents_dir(dir);
    }
    if let Some(secs) = cli.timeout {
        config.patch_timeout_secs = secs;
    }
    if let Some(level) = cli.compress {
        config.compression_level = level;
    }
    config.validate()?;
    Ok(config)
}

async fn run_patch(
    config: Config,
    input: PathBuf,
    platform: PlatformCode,
    signed: bool,
    output: Option<PathBuf>,
    overwrite: bool,
) -> Result<()> {
    if !input.is_file() {
        return Err(CirclefyError::FileNotFound(input));
    }
    if let Some(ref out) = output {
        if out.exists() && !overwrite && !confirm_overwrite(out)? {
            println!("[>] quitting.");
            return Ok(());
        }
    }

    println!("[*] applying {} mask ({})", platform.mask_name(), platform);

    let repackager = Arc::new(
        Repackager::new(config, Arc::new(MachoPlatformPatcher))?
            .with_notifier(Arc::new(ConsoleNotifier))
            .with_progress(Arc::new(ConsoleProgress)),
    );

    let cancel = CancellationToken::new();
    let ctrl_c = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("[?] cancelling...");
            ctrl_c.cancel();
        }
    });

    let worker = repackager.clone();
    let result = tokio::task::spawn_blocking(move || {
        if signed {
            worker.process_signed(&input, platform, &cancel)
        } else {
            worker.process(&input, platform, &cancel)
        }
    })
    .await
    .map_err(|e| CirclefyError::Io(std::io::Error::other(e)))??;

    let final_path = match output {
        Some(out) => {
            move_file(&result, &out)?;
            out
        }
        None => result,
    };

    println!("[*] generated {}", final_path.display());
    Ok(())
}

fn run_inspect(input: &Path) -> Result<()> {
    let summary = inspect_archive(input)?;
    let digest = archive_digest(input)?;

    println!("[*] name:       {}", summary.display_name);
    println!("[*] bundle id:  {}", summary.bundle_id);
    println!("[*] version:    {}", summary.version);
    match summary.executable {
        Some(exec) => println!("[*] executable: {}", exec),
        None => println!("[?] executable: (not declared)"),
    }
    println!("[*] sha256:     {}", digest);
    Ok(())
}

fn run_pack(config: &Config, app: &Path, output: Option<PathBuf>) -> Result<()> {
    let output = output.unwrap_or_else(|| app.with_extension("ipa"));
    let codec = ArchiveCodec::new(config.compression_level);

    println!("[*] generating...");
    fs::create_dir_all(&config.work_dir)?;
    package_app(&codec, app, &output, &config.work_dir)?;
    println!("[*] generated {}", output.display());
    Ok(())
}

async fn run_validate(mut urls: Vec<String>, file: Option<PathBuf>, concurrency: usize) -> Result<()> {
    if let Some(path) = file {
        urls.extend(filter_valid_urls(&fs::read_to_string(path)?));
    }
    if urls.is_empty() {
        return Err(CirclefyError::InvalidInput("no URLs given".to_string()));
    }

    let client = validation::default_client()
        .map_err(|e| CirclefyError::InvalidInput(format!("failed to build HTTP client: {}", e)))?;
    let results = validation::validate_all(&client, &urls, concurrency).await;

    let mut failed = 0;
    for (url, result) in &results {
        match result {
            Ok(repo) => println!(
                "[*] {}: {} ({}), {} apps",
                url,
                repo.name,
                repo.identifier,
                repo.apps.len()
            ),
            Err(e) => {
                failed += 1;
                let hint = if e.is_retryable() { " (retryable)" } else { "" };
                println!("[!] {}: {}{}", url, e, hint);
            }
        }
    }

    if failed > 0 {
        return Err(CirclefyError::InvalidInput(format!(
            "{} of {} repositories failed validation",
            failed,
            results.len()
        )));
    }
    println!("[*] all {} repositories are valid", results.len());
    Ok(())
}

fn read_input(file: Option<&Path>) -> Result<String> {
    Ok(match file {
        Some(path) => fs::read_to_string(path)?,
        None => std::io::read_to_string(std::io::stdin())?,
    })
}

fn confirm_overwrite(path: &Path) -> Result<bool> {
    print!("[<] {} already exists. overwrite? [Y/n] ", path.display());
    std::io::stdout().flush()?;

    let mut response = String::new();
    std::io::stdin().read_line(&mut response)?;
    let response = response.trim().to_lowercase();
    Ok(matches!(response.as_str(), "y" | "yes" | ""))
}

/// Rename, falling back to copy + delete across filesystems.
fn move_file(from: &Path, to: &Path) -> Result<()> {
    if let Some(parent) = to.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    if fs::rename(from, to).is_err() {
        fs::copy(from, to)?;
        fs::remove_file(from)?;
    }
    Ok(())
}

struct ConsoleNotifier;

impl Notifier for ConsoleNotifier {
    fn notify(&self, message: &str, severity: Severity) {
        match severity {
            Severity::Info | Severity::Success => println!("[*] {}", message),
            Severity::Warning => println!("[?] {}", message),
            // Reported once by main.
            Severity::Error => tracing::debug!("{}", message),
        }
    }
}

struct ConsoleProgress;

impl ProgressSink for ConsoleProgress {
    fn stage(&self, stage: Stage) {
        match stage {
            Stage::Idle | Stage::Done | Stage::Failed => {}
            _ => println!("[*] {}...", stage),
        }
    }

    fn progress(&self, stage: Stage, percent: f32) {
        tracing::trace!(%stage, percent, "progress");
    }
}
