use anyhow::{bail, Context, Result};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use facefind::db::{parse_labels, PhotoId};
use facefind::logging::{self, LogTarget};
use facefind::search::{write_report, ReportFormat, SearchResponse};
use facefind::{Config, FaceFinder};

enum Command {
    Ingest { path: PathBuf, labels: Vec<String> },
    Search { image: PathBuf, json: bool, report: Option<ReportFormat> },
    Label { photo_id: i64, labels: Vec<String> },
    People,
    Stats,
    Rehydrate,
}

struct Cli {
    config_path: Option<PathBuf>,
    command: Command,
}

fn usage_error(message: impl AsRef<str>) -> ! {
    eprintln!("Error: {}", message.as_ref());
    eprintln!();
    print_help();
    std::process::exit(1);
}

fn parse_args() -> Cli {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let mut config_path = None;
    let mut positional = Vec::new();
    let mut labels = Vec::new();
    let mut json = false;
    let mut report = None;

    let mut i = 0;
    while i < args.len() {
        match args[i].as_str() {
            "--help" | "-h" => {
                print_help();
                std::process::exit(0);
            }
            "--version" | "-V" => {
                println!("facefind {}", env!("CARGO_PKG_VERSION"));
                std::process::exit(0);
            }
            "--config" | "-c" => {
                let Some(path) = args.get(i + 1) else {
                    usage_error("--config requires a path argument");
                };
                config_path = Some(PathBuf::from(path));
                i += 1;
            }
            "--labels" | "-l" => {
                let Some(raw) = args.get(i + 1) else {
                    usage_error("--labels requires a comma-separated list");
                };
                labels.extend(parse_labels(raw));
                i += 1;
            }
            "--json" => json = true,
            "--report" => {
                let Some(raw) = args.get(i + 1) else {
                    usage_error("--report requires csv or json");
                };
                report = Some(raw.parse().unwrap_or_else(|e: String| usage_error(e)));
                i += 1;
            }
            arg if arg.starts_with('-') => usage_error(format!("unknown argument: {arg}")),
            arg => positional.push(arg.to_string()),
        }
        i += 1;
    }

    let mut positional = positional.into_iter();
    let command = match positional.next().as_deref() {
        Some("ingest") => Command::Ingest {
            path: positional
                .next()
                .map(PathBuf::from)
                .unwrap_or_else(|| usage_error("ingest requires a path")),
            labels,
        },
        Some("search") => Command::Search {
            image: positional
                .next()
                .map(PathBuf::from)
                .unwrap_or_else(|| usage_error("search requires an image")),
            json,
            report,
        },
        Some("label") => {
            let photo_id = positional
                .next()
                .and_then(|id| id.parse().ok())
                .unwrap_or_else(|| usage_error("label requires a numeric photo id"));
            let raw = positional
                .next()
                .unwrap_or_else(|| usage_error("label requires a comma-separated list"));
            Command::Label {
                photo_id,
                labels: parse_labels(&raw),
            }
        }
        Some("people") => Command::People,
        Some("stats") => Command::Stats,
        Some("rehydrate") => Command::Rehydrate,
        Some(other) => usage_error(format!("unknown command: {other}")),
        None => usage_error("missing command"),
    };

    if let Some(extra) = positional.next() {
        usage_error(format!("unexpected argument: {extra}"));
    }

    Cli {
        config_path,
        command,
    }
}

fn print_help() {
    println!(
        r#"facefind - index faces in a photo collection and search by photo

USAGE:
    facefind [OPTIONS] <COMMAND>

COMMANDS:
    ingest PATH [--labels a,b]           Index a photo or every image under a directory
    search IMAGE [--json] [--report F]   Find indexed photos of the person in IMAGE
                                         (F is csv or json)
    label PHOTO_ID LABELS                Add comma-separated labels to a photo
    people                               List person clusters
    stats                                Show index counts
    rehydrate                            Restore missing media files from their sources

OPTIONS:
    --config, -c PATH   Path to config file
    --version, -V       Show version
    --help, -h          Show this help message

ENVIRONMENT:
    FACEFIND_CONFIG     Path to config file (overrides default location)
    FACEFIND_LOG        Log filter (trace, debug, info, warn, error)

Config file location: $XDG_CONFIG_HOME/facefind/config.toml

See also: facefind-daemon --help"#
    );
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = parse_args();

    let _ = logging::init(LogTarget::Console, None);

    let config = match &cli.config_path {
        Some(path) => Config::load_from(path)?,
        None => Config::load()?,
    };
    let finder = FaceFinder::open(config).context("Failed to open the index")?;

    match cli.command {
        Command::Ingest { path, labels } => ingest(&finder, &path, &labels).await,
        Command::Search {
            image,
            json,
            report,
        } => search(&finder, &image, json, report).await,
        Command::Label { photo_id, labels } => {
            if labels.is_empty() {
                bail!("no labels given");
            }
            let photo = finder.label(PhotoId(photo_id), &labels)?;
            let labels: Vec<&str> = photo.labels.iter().map(String::as_str).collect();
            println!("photo {}: {}", photo.id, labels.join(", "));
            Ok(())
        }
        Command::People => {
            let people = finder.people()?;
            if people.is_empty() {
                println!("No people indexed yet");
            }
            for person in people {
                println!("person {}: {} face(s)", person.id, person.face_count);
            }
            Ok(())
        }
        Command::Stats => {
            let stats = finder.stats()?;
            println!("photos: {}", stats.photos);
            println!("faces:  {}", stats.faces);
            println!("people: {}", stats.people);
            Ok(())
        }
        Command::Rehydrate => {
            let summary = finder.rehydrate().await?;
            println!(
                "restored {}, still missing {}",
                summary.restored, summary.still_missing
            );
            Ok(())
        }
    }
}

async fn ingest(finder: &FaceFinder, path: &Path, labels: &[String]) -> Result<()> {
    if path.is_file() {
        let outcome = finder
            .pipeline()
            .ingest_file(path, labels)
            .await
            .with_context(|| format!("Failed to ingest {}", path.display()))?;
        if outcome.skipped {
            println!("{}: already indexed as photo {}", path.display(), outcome.photo.id);
        } else {
            println!(
                "{}: indexed as photo {} with {} face(s)",
                path.display(),
                outcome.photo.id,
                outcome.faces_indexed
            );
        }
        return Ok(());
    }

    let cancel = Arc::new(AtomicBool::new(false));
    let ctrl_c_flag = Arc::clone(&cancel);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("Stopping after the current file...");
            ctrl_c_flag.store(true, Ordering::SeqCst);
        }
    });

    let summary = finder
        .pipeline()
        .ingest_directory(path, labels, cancel, None)
        .await
        .with_context(|| format!("Scan of {} aborted", path.display()))?;

    println!("{summary}");
    for failure in &summary.failures {
        println!("  failed: {}: {}", failure.path.display(), failure.error);
    }
    Ok(())
}

async fn search(
    finder: &FaceFinder,
    image: &Path,
    json: bool,
    report: Option<ReportFormat>,
) -> Result<()> {
    let bytes = tokio::fs::read(image)
        .await
        .with_context(|| format!("Failed to read {}", image.display()))?;
    let response = finder.search(bytes).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&response)?);
    } else {
        print_matches(&response);
    }

    if let Some(format) = report {
        let query_name = image.file_name().map(|n| n.to_string_lossy().to_string());
        let relative = write_report(finder.media(), query_name.as_deref(), &response, format)?;
        println!("report: {}", finder.media().media_url(&relative));
    }
    Ok(())
}

fn print_matches(response: &SearchResponse) {
    if response.query_face_count == 0 {
        println!("No face detected in the query image");
        return;
    }
    if response.matches.is_empty() {
        println!("No matching photos");
        return;
    }

    println!("{} matching photo(s):", response.matches.len());
    for m in &response.matches {
        let person = m.person_id.map(|p| p.to_string()).unwrap_or_else(|| "-".to_string());
        let labels: Vec<&str> = m.labels.iter().map(String::as_str).collect();
        println!(
            "  {:.4}  photo {}  person {}  {}  [{}]",
            m.distance,
            m.photo_id,
            person,
            m.media_url,
            labels.join(", ")
        );
    }
}
