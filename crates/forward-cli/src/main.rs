use std::path::PathBuf;

use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use forward_contracts::entries::{EntryStatus, GeneratedEntry, DEFAULT_FUTURE_YEARS};
use forward_contracts::summary::load_summary;
use forward_engine::collage::{write_collage, COLLAGE_FILE_NAME};
use forward_engine::{provider_named, provider_names, GenerationRun};
use uuid::Uuid;

#[derive(Debug, Parser)]
#[command(
    name = "future-forward",
    version,
    about = "Age a portrait across future decades with a generative image model"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run one full generation pass over the configured years
    Generate(GenerateArgs),
    /// Compose the polaroid collage for a settled run
    Collage(CollageArgs),
}

#[derive(Debug, Parser)]
struct GenerateArgs {
    /// Source portrait (PNG, JPG, or WEBP)
    #[arg(long)]
    image: PathBuf,
    /// Run directory; a fresh runs/run-<id> when omitted
    #[arg(long)]
    out: Option<PathBuf>,
    /// Event log path; <out>/events.jsonl when omitted
    #[arg(long)]
    events: Option<PathBuf>,
    /// Comma-separated year labels to render
    #[arg(long, value_delimiter = ',')]
    years: Vec<String>,
    #[arg(long, default_value = "gemini")]
    provider: String,
    /// Also write the collage once the run settles
    #[arg(long)]
    collage: bool,
}

#[derive(Debug, Parser)]
struct CollageArgs {
    /// A settled run directory containing summary.json
    #[arg(long)]
    run: PathBuf,
    /// Output path; <run>/future_forward_collage.png when omitted
    #[arg(long)]
    out: Option<PathBuf>,
}

fn main() {
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("future-forward error: {err:#}");
            std::process::exit(1);
        }
    }
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    match cli.command {
        Command::Generate(args) => run_generate(args),
        Command::Collage(args) => run_collage(args),
    }
}

fn run_generate(args: GenerateArgs) -> Result<i32> {
    let Some(provider) = provider_named(&args.provider) else {
        bail!(
            "unknown provider '{}'; expected one of {}",
            args.provider,
            provider_names().join(", ")
        );
    };

    let out_dir = args.out.clone().unwrap_or_else(default_run_dir);
    let events_path = args
        .events
        .clone()
        .unwrap_or_else(|| out_dir.join("events.jsonl"));
    let years = resolve_years(&args.years);

    let mut run = GenerationRun::new(&out_dir, &events_path, provider)?;
    println!("run {} -> {}", run.run_id(), out_dir.display());
    run.generate(&args.image, &years, print_entry_line)?;

    let sequence = run.sequence();
    println!(
        "settled: {}/{} ready",
        sequence.ready_count(),
        sequence.len()
    );

    if sequence.is_settled() && sequence.ready_count() > 0 {
        if args.collage {
            let collage_path = out_dir.join(COLLAGE_FILE_NAME);
            write_collage(sequence, &collage_path)?;
            println!("collage -> {}", collage_path.display());
        } else {
            println!(
                "collage available: future-forward collage --run {}",
                out_dir.display()
            );
        }
    }
    Ok(0)
}

fn run_collage(args: CollageArgs) -> Result<i32> {
    let summary = load_summary(&args.run.join("summary.json"))?;
    let sequence = summary.sequence();
    if !sequence.is_settled() {
        bail!(
            "run {} has entries still loading; regenerate before composing",
            summary.run_id
        );
    }

    let out_path = args
        .out
        .clone()
        .unwrap_or_else(|| args.run.join(COLLAGE_FILE_NAME));
    write_collage(&sequence, &out_path)?;
    println!("collage -> {}", out_path.display());
    Ok(0)
}

fn print_entry_line(entry: &GeneratedEntry) {
    match entry.status {
        EntryStatus::Loading => println!("[loading] {}", entry.label),
        EntryStatus::Ready => {
            let location = entry.artifact_path.as_deref().or_else(|| {
                entry
                    .image_url
                    .as_deref()
                    .filter(|url| !url.starts_with("data:"))
            });
            match location {
                Some(location) => println!("[ready]   {} -> {location}", entry.label),
                None => println!("[ready]   {}", entry.label),
            }
        }
        EntryStatus::Error => println!(
            "[error]   {}: {}",
            entry.label,
            entry.error_message.as_deref().unwrap_or("unknown failure")
        ),
    }
}

fn resolve_years(requested: &[String]) -> Vec<String> {
    let cleaned: Vec<String> = requested
        .iter()
        .map(|year| year.trim().to_string())
        .filter(|year| !year.is_empty())
        .collect();
    if cleaned.is_empty() {
        DEFAULT_FUTURE_YEARS
            .iter()
            .map(|year| year.to_string())
            .collect()
    } else {
        cleaned
    }
}

fn default_run_dir() -> PathBuf {
    let id = Uuid::new_v4().simple().to_string();
    PathBuf::from("runs").join(format!("run-{}", &id[..8]))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generate_args_split_years_on_commas() {
        let cli = Cli::parse_from([
            "future-forward",
            "generate",
            "--image",
            "photo.png",
            "--years",
            "2030,2050,2070",
        ]);
        let Command::Generate(args) = cli.command else {
            panic!("expected generate");
        };
        assert_eq!(args.years, vec!["2030", "2050", "2070"]);
        assert_eq!(args.provider, "gemini");
        assert!(!args.collage);
    }

    #[test]
    fn empty_year_list_falls_back_to_the_defaults() {
        assert_eq!(resolve_years(&[]).len(), DEFAULT_FUTURE_YEARS.len());
        assert_eq!(
            resolve_years(&[" 2030 ".to_string(), "".to_string()]),
            vec!["2030"]
        );
    }

    #[test]
    fn default_run_dirs_are_unique() {
        let first = default_run_dir();
        let second = default_run_dir();
        assert_ne!(first, second);
        assert!(first.starts_with("runs"));
    }
}
