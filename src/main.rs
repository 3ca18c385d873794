mod app;
mod config;
mod event;
mod logging;

use clap::{Parser, Subcommand};
use color_eyre::Result;
use formsync::cache::Intercepted;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "formsync")]
#[command(about = "Offline-first form caching and OpenRosa synchronization")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/formsync/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Cache a configured survey (definition and media)
  Fetch { survey_id: String },

  /// Inspect and add records
  Records {
    #[command(subcommand)]
    command: RecordsCommand,
  },

  /// Submit every queued record
  Upload,

  /// Ask the resource cache whether a survey changed upstream
  CheckHash { survey_id: String },

  /// Resolve a URL through the resource cache
  Resolve { url: String },

  /// Keep surveys fresh and drain the queue until Ctrl-C
  Watch,
}

#[derive(Subcommand, Debug)]
enum RecordsCommand {
  /// Finalized records of a survey, in queue order
  List { survey_id: String },

  /// Draft records of a survey
  Drafts { survey_id: String },

  /// Save a record from an XML file
  ///
  /// Finalized records of surveys that encrypt submissions (a
  /// base64RsaPublicKey on the submission element) are refused, since
  /// formsync does not encrypt. Such records can still be kept with --draft.
  Add {
    survey_id: String,
    /// Instance id, e.g. uuid:...
    #[arg(long)]
    id: String,
    /// Display name (defaults to the instance id)
    #[arg(long)]
    name: Option<String>,
    /// File holding the record XML
    #[arg(long)]
    xml: PathBuf,
    /// Files to attach
    #[arg(long = "attach")]
    attachments: Vec<PathBuf>,
    /// Keep as draft instead of queueing for upload (required for encrypted surveys)
    #[arg(long)]
    draft: bool,
  },
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;
  let _log_guard = logging::init()?;

  let args = Args::parse();

  // Load configuration
  let config = config::Config::load(args.config.as_deref())?;
  let app = app::App::new(config)?;

  match args.command {
    Command::Fetch { survey_id } => {
      let survey = app.fetch(&survey_id).await?;
      println!(
        "{}  hash={}  media={}  cached_at={}",
        survey.survey_id,
        survey.hash,
        survey.media.len(),
        survey.cached_at.to_rfc3339()
      );
    }
    Command::Records { command } => match command {
      RecordsCommand::List { survey_id } => print_records(&app.list_records(&survey_id, false)?),
      RecordsCommand::Drafts { survey_id } => print_records(&app.list_records(&survey_id, true)?),
      RecordsCommand::Add {
        survey_id,
        id,
        name,
        xml,
        attachments,
        draft,
      } => {
        let record = app.add_record(&survey_id, &id, name.as_deref(), &xml, &attachments, draft)?;
        println!("saved {} (#{})", record.record_id, record.order);
      }
    },
    Command::Upload => {
      let report = app.upload().await?;
      println!("uploaded {}", report.uploaded.len());
      for failure in &report.failed {
        println!("failed {}: {}", failure.record_id, failure.error);
      }
    }
    Command::CheckHash { survey_id } => {
      let reply = app.check_hash(&survey_id).await?;
      println!("{}", serde_json::to_string(&reply)?);
    }
    Command::Resolve { url } => match app.resolve(&url).await? {
      Intercepted::Bypass => println!("bypass"),
      Intercepted::Respond { response, source } => {
        println!("{} {:?} {} bytes", response.status, source, response.body.len());
      }
    },
    Command::Watch => app.watch().await?,
  }

  Ok(())
}

fn print_records(records: &[formsync::records::Record]) {
  for record in records {
    println!(
      "{:>4}  {:<40}  {:<24}  {}  files={}",
      record.order,
      record.record_id,
      record.name,
      record.updated_at.format("%Y-%m-%d %H:%M"),
      record.files.len()
    );
  }
}
