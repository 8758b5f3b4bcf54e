use std::{io::Write, path::PathBuf, process::ExitCode, time::Duration};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use client_core::{load_settings, ClientSettings, NeumoClient, UploadFile};
use futures::StreamExt;
use shared::{
    domain::{PatientInfo, PredictionId, PredictionRecord},
    protocol::{ListPredictionsQuery, DEFAULT_PAGE_SIZE},
};
use tokio::task::JoinHandle;
use tracing::debug;
use tracing_subscriber::EnvFilter;

/// How long the progress line may take to catch up once the result is in.
const PROGRESS_FLUSH: Duration = Duration::from_millis(250);

#[derive(Parser, Debug)]
#[command(name = "neumo", about = "Chest X-ray analysis client")]
struct Args {
    /// Base URL of the prediction API.
    #[arg(long, global = true)]
    api_url: Option<String>,
    /// SQLite URL or file path for the saved session.
    #[arg(long, global = true)]
    storage_url: Option<String>,
    /// Per-request timeout; 0 waits indefinitely.
    #[arg(long, global = true)]
    timeout_secs: Option<u64>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    Login {
        #[arg(long)]
        email: String,
        #[arg(long)]
        password: String,
    },
    Register {
        #[arg(long)]
        email: String,
        #[arg(long)]
        password: String,
        #[arg(long)]
        username: String,
        #[arg(long)]
        full_name: String,
    },
    Logout,
    /// Shows who is signed in.
    Status,
    /// Uploads an image for analysis.
    Predict {
        path: PathBuf,
        #[arg(long)]
        age: Option<u32>,
        #[arg(long)]
        gender: Option<String>,
        #[arg(long)]
        symptoms: Option<String>,
    },
    History {
        #[arg(long)]
        include_images: bool,
        /// Rows to skip from the newest.
        #[arg(long, default_value_t = 0)]
        skip: u32,
        #[arg(long, default_value_t = DEFAULT_PAGE_SIZE)]
        limit: u32,
    },
    Show {
        id: i64,
    },
    Delete {
        id: i64,
    },
    /// Requests a doctor's review of a result.
    Flag {
        id: i64,
    },
}

impl Args {
    fn settings(&self) -> ClientSettings {
        let mut settings = load_settings();
        if let Some(url) = &self.api_url {
            settings.api_base_url = url.clone();
        }
        if let Some(url) = &self.storage_url {
            settings.storage_url = url.clone();
        }
        if let Some(secs) = self.timeout_secs {
            settings.request_timeout_secs = Some(secs);
        }
        settings
    }
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();
    let args = Args::parse();
    let settings = args.settings();
    debug!(?settings, "cli: settings resolved");

    let client = NeumoClient::connect(&settings).await?;
    run(&client, args.command).await
}

async fn run(client: &NeumoClient, command: Command) -> Result<ExitCode> {
    match command {
        Command::Login { email, password } => {
            match client.session.login(&email, &password).await {
                Ok(user) => println!("Signed in as {}", user.display_name()),
                Err(err) => return Ok(failure(&err.to_string())),
            }
        }
        Command::Register {
            email,
            password,
            username,
            full_name,
        } => match client
            .session
            .register(&email, &password, &username, &full_name)
            .await
        {
            Ok(user) => println!("Account created; signed in as {}", user.display_name()),
            Err(err) => return Ok(failure(&err.to_string())),
        },
        Command::Logout => {
            client.session.logout().await;
            println!("Signed out");
        }
        Command::Status => {
            let state = client.session.snapshot();
            match state.user() {
                Some(user) if state.is_authenticated() => {
                    println!("Signed in as {} <{}>", user.display_name(), user.email)
                }
                _ => println!("Not signed in"),
            }
        }
        Command::Predict {
            path,
            age,
            gender,
            symptoms,
        } => {
            let upload = UploadFile::from_path(&path).await?;
            let patient = PatientInfo {
                age,
                gender,
                symptoms,
            };

            let mut progress = client.tasks.progress_stream();
            let printer = tokio::spawn(async move {
                while let Some((_, percent)) = progress.next().await {
                    eprint!("\rUploading... {percent:>3}%");
                    let _ = std::io::stderr().flush();
                    if percent == 100 {
                        eprintln!();
                        break;
                    }
                }
            });

            let result = client.tasks.submit(upload, patient).await;
            if !finish_printer(printer).await {
                // upload stopped short of 100%; end the partial line
                eprintln!();
            }
            match result {
                Ok(record) => print_record(&record)?,
                Err(err) => return Ok(failure(&err.to_string())),
            }
        }
        Command::History {
            include_images,
            skip,
            limit,
        } => {
            let query = ListPredictionsQuery {
                include_images,
                skip,
                limit,
            };
            let Some(page) = client.tasks.list_page(query).await else {
                return Ok(failure("history could not be loaded"));
            };
            if page.data.is_empty() {
                println!("No predictions yet");
            }
            for row in &page.data {
                println!(
                    "{:>6}  {}  {:<10} {:>6.2}%{}{}",
                    row.id,
                    row.created_at.format("%Y-%m-%d %H:%M"),
                    row.prediction_class,
                    row.confidence_percent(),
                    if row.is_flagged { "  [flagged]" } else { "" },
                    if row.reviewed_by_doctor { "  [reviewed]" } else { "" },
                );
            }
            if !page.data.is_empty() {
                let first = u64::from(skip) + 1;
                let last = u64::from(skip) + page.data.len() as u64;
                println!("Showing {first}-{last} of {}", page.total);
            }
        }
        Command::Show { id } => match client.tasks.fetch_one(PredictionId(id)).await {
            Some(record) => print_record(&record)?,
            None => return Ok(failure(&format!("prediction {id} could not be loaded"))),
        },
        Command::Delete { id } => {
            if !client.tasks.delete(PredictionId(id)).await {
                return Ok(failure(&format!("prediction {id} was not deleted")));
            }
            println!("Deleted prediction {id}");
        }
        Command::Flag { id } => {
            if !client.tasks.flag(PredictionId(id)).await {
                return Ok(failure(&format!("prediction {id} was not flagged")));
            }
            println!("Prediction {id} flagged for review");
        }
    }
    Ok(ExitCode::SUCCESS)
}

/// Gives the progress printer a moment to flush what was already reported.
/// Returns `false` when it had to be cut off.
async fn finish_printer(mut printer: JoinHandle<()>) -> bool {
    if tokio::time::timeout(PROGRESS_FLUSH, &mut printer).await.is_ok() {
        return true;
    }
    printer.abort();
    false
}

fn print_record(record: &PredictionRecord) -> Result<()> {
    println!(
        "{}",
        serde_json::to_string_pretty(record).context("failed to render prediction")?
    );
    Ok(())
}

fn failure(message: &str) -> ExitCode {
    eprintln!("error: {message}");
    ExitCode::FAILURE
}
