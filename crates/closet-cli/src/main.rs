use std::fs;
use std::io::{self, BufRead, ErrorKind, Read, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use closet_contracts::chat::{parse_chat_line, ChatCommand, CHAT_HELP_COMMANDS};
use closet_contracts::wardrobe::GarmentRecord;
use closet_engine::config::DEFAULT_ENV_FILE;
use closet_engine::{BatchMode, BatchReport, Closet, Config, StylistError};
use tracing::debug;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "closet", version, about = "Wardrobe photo extraction and outfit stylist")]
struct Cli {
    /// Dotenv file loaded before reading the environment, when present.
    #[arg(long, global = true, default_value = DEFAULT_ENV_FILE)]
    env_file: PathBuf,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Extract records for the images in the image directory.
    Process(ProcessArgs),
    /// Print the record extracted from one image without storing it.
    Describe(DescribeArgs),
    /// List the stored wardrobe.
    Wardrobe(WardrobeArgs),
    /// Insert or replace a record from a JSON file, or `-` for stdin.
    Add(AddArgs),
    /// Copy images into the image directory.
    Upload(UploadArgs),
    /// Ask the stylist one question.
    Ask(AskArgs),
    /// Interactive stylist session.
    Chat(ChatArgs),
}

#[derive(Debug, Parser)]
struct ProcessArgs {
    #[arg(long)]
    images: Option<PathBuf>,
    #[arg(long)]
    wardrobe: Option<PathBuf>,
    /// Clear the wardrobe and process every image again.
    #[arg(long)]
    rebuild: bool,
}

#[derive(Debug, Parser)]
struct DescribeArgs {
    image: PathBuf,
}

#[derive(Debug, Parser)]
struct WardrobeArgs {
    #[arg(long)]
    wardrobe: Option<PathBuf>,
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Parser)]
struct AddArgs {
    source: String,
    #[arg(long)]
    wardrobe: Option<PathBuf>,
}

#[derive(Debug, Parser)]
struct UploadArgs {
    #[arg(required = true)]
    files: Vec<PathBuf>,
    #[arg(long)]
    images: Option<PathBuf>,
    #[arg(long)]
    wardrobe: Option<PathBuf>,
    /// Process the uploaded images right away.
    #[arg(long)]
    process: bool,
}

#[derive(Debug, Parser)]
struct AskArgs {
    #[arg(required = true, num_args = 1..)]
    question: Vec<String>,
    #[arg(long)]
    city: Option<String>,
}

#[derive(Debug, Parser)]
struct ChatArgs {
    #[arg(long)]
    city: Option<String>,
}

const EXIT_FAILED_IMAGES: i32 = 2;

fn main() {
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("closet error: {err:#}");
            std::process::exit(1);
        }
    }
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    let config = Config::from_env(Some(&cli.env_file))?;
    init_tracing();
    debug!(env_file = %cli.env_file.display(), provider = ?config.providers.kind(), "configuration loaded");
    let mut out = io::stdout().lock();
    match cli.command {
        Command::Process(args) => {
            let closet = open_closet(config, args.images, args.wardrobe)?;
            let mode = if args.rebuild {
                BatchMode::Rebuild
            } else {
                BatchMode::Incremental
            };
            let report = closet.process(mode)?;
            print_report(&mut out, &report)?;
            Ok(report_exit_code(&report))
        }
        Command::Describe(args) => {
            let closet = open_closet(config, None, None)?;
            let record = closet.describe(&args.image)?;
            writeln!(out, "{}", serde_json::to_string_pretty(&record)?)?;
            Ok(0)
        }
        Command::Wardrobe(args) => {
            let closet = open_closet(config, None, args.wardrobe)?;
            let records = closet.wardrobe()?;
            if args.json {
                writeln!(out, "{}", serde_json::to_string_pretty(&records)?)?;
            } else {
                print_wardrobe(&mut out, &records)?;
            }
            Ok(0)
        }
        Command::Add(args) => {
            let closet = open_closet(config, None, args.wardrobe)?;
            let raw = read_source(&args.source)?;
            let record = GarmentRecord::from_json_str(&raw)
                .with_context(|| format!("{} is not a garment record", args.source))?;
            let record = closet.upsert(record)?;
            writeln!(out, "Saved {}", record.id.as_deref().unwrap_or("?"))?;
            Ok(0)
        }
        Command::Upload(args) => {
            let closet = open_closet(config, args.images, args.wardrobe)?;
            let (saved, report) = closet.upload(&args.files, args.process)?;
            for path in &saved {
                writeln!(out, "Saved {}", path.display())?;
            }
            match report {
                Some(report) => {
                    print_report(&mut out, &report)?;
                    Ok(report_exit_code(&report))
                }
                None => Ok(0),
            }
        }
        Command::Ask(args) => {
            let closet = open_closet(config, None, None)?;
            let question = args.question.join(" ");
            let answer = closet.ask(&question, args.city.as_deref())?;
            writeln!(out, "{}", answer.render())?;
            Ok(0)
        }
        Command::Chat(args) => {
            let closet = open_closet(config, None, None)?;
            let city = args.city.unwrap_or_else(|| closet.config().city.clone());
            let stdin = io::stdin();
            run_chat(&closet, city, stdin.lock(), &mut out)?;
            Ok(0)
        }
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_env("CLOSET_LOG").unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(io::stderr)
        .try_init();
}

fn open_closet(config: Config, images: Option<PathBuf>, wardrobe: Option<PathBuf>) -> Result<Closet> {
    let mut config = config;
    if let Some(dir) = images {
        config = config.with_image_dir(dir);
    }
    if let Some(path) = wardrobe {
        config = config.with_wardrobe_path(path);
    }
    Closet::new(config)
}

fn read_source(source: &str) -> Result<String> {
    if source == "-" {
        let mut raw = String::new();
        io::stdin()
            .read_to_string(&mut raw)
            .context("failed reading record from stdin")?;
        return Ok(raw);
    }
    fs::read_to_string(Path::new(source)).with_context(|| format!("failed reading {source}"))
}

fn report_exit_code(report: &BatchReport) -> i32 {
    if report.is_clean() {
        0
    } else {
        EXIT_FAILED_IMAGES
    }
}

fn print_report(out: &mut impl Write, report: &BatchReport) -> Result<()> {
    let summary = &report.summary;
    writeln!(
        out,
        "Processed {}, skipped {}, failed {}",
        summary.processed.len(),
        summary.skipped.len(),
        summary.failed.len()
    )?;
    for failure in &summary.failed {
        writeln!(out, "  failed {}: {}", failure.image, failure.error)?;
    }
    Ok(())
}

fn print_wardrobe(out: &mut impl Write, records: &[GarmentRecord]) -> Result<()> {
    if records.is_empty() {
        writeln!(out, "The wardrobe is empty.")?;
        return Ok(());
    }
    for (index, record) in records.iter().enumerate() {
        writeln!(out, "{:>3}. {}", index + 1, record.label())?;
    }
    Ok(())
}

fn run_chat(closet: &Closet, mut city: String, mut input: impl BufRead, out: &mut impl Write) -> Result<()> {
    writeln!(out, "Wardrobe stylist ready. Ask what to wear, or type /help.")?;
    let mut line = String::new();
    loop {
        write!(out, "> ")?;
        out.flush()?;

        line.clear();
        let read = match input.read_line(&mut line) {
            Ok(read) => read,
            Err(err) if err.kind() == ErrorKind::Interrupted => continue,
            Err(err) => return Err(err.into()),
        };
        if read == 0 {
            break;
        }

        match parse_chat_line(&line) {
            ChatCommand::Noop => {}
            ChatCommand::Help => {
                writeln!(out, "Commands: {}", CHAT_HELP_COMMANDS.join(" "))?;
            }
            ChatCommand::Wardrobe => match closet.wardrobe() {
                Ok(records) => print_wardrobe(out, &records)?,
                Err(err) => writeln!(out, "Wardrobe unavailable: {err:#}")?,
            },
            ChatCommand::Process => match closet.process(BatchMode::Incremental) {
                Ok(report) => print_report(out, &report)?,
                Err(err) => writeln!(out, "Processing failed: {err:#}")?,
            },
            ChatCommand::Weather { city: asked } => {
                let target = asked.unwrap_or_else(|| city.clone());
                match closet.forecast(Some(target.as_str())) {
                    Ok(forecast) => writeln!(
                        out,
                        "Tomorrow in {}: {:.1}°C to {:.1}°C",
                        forecast.city, forecast.t_min, forecast.t_max
                    )?,
                    Err(err) => writeln!(out, "{err}")?,
                }
            }
            ChatCommand::SetCity { city: Some(next) } => {
                city = next;
                writeln!(out, "City set to {city}")?;
            }
            ChatCommand::SetCity { city: None } => {
                writeln!(out, "/city requires a city name")?;
            }
            ChatCommand::Quit => break,
            ChatCommand::Unknown { command } => {
                writeln!(out, "Unknown command /{command}. Type /help for commands.")?;
            }
            ChatCommand::Question(question) => match closet.ask(&question, Some(city.as_str())) {
                Ok(answer) => writeln!(out, "\n{}", answer.render())?,
                Err(StylistError::EmptyWardrobe) => {
                    writeln!(out, "Upload garments and run /process first.")?;
                }
                Err(err) => writeln!(out, "Stylist failed: {err}")?,
            },
        }
    }
    Ok(())
}
