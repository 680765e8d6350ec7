use std::io::Read;
use std::process::ExitCode;
use std::sync::atomic::AtomicBool;

use camino::Utf8PathBuf;
use clap::{Args, Parser, Subcommand};
use miette::IntoDiagnostic;
use serde_json::json;
use tracing_subscriber::EnvFilter;

use wavereq::app::App;
use wavereq::domain::{MetadataLevel, RequestKind};
use wavereq::error::WavereqError;
use wavereq::fdsnws::{FdsnwsControl, HttpDataClient, LogStatusSink, StatusSink};
use wavereq::legacy::LegacyHttpClient;
use wavereq::output::{JsonOutput, OutputMode};
use wavereq::request::{AutoConfirm, SubmitInfo, SubmitOutcome, TimeWindowMode};
use wavereq::router::HttpRoutingClient;
use wavereq::service::{EventQuery, MetadataHttpClient, StationQuery};
use wavereq::settings::Settings;
use wavereq::store::BlobStore;

#[derive(Parser)]
#[command(name = "wavereq")]
#[command(about = "Batch front end for seismic waveform and metadata requests")]
#[command(version, author)]
struct Cli {
    /// Path to a settings file (default: wavereq.json if present)
    #[arg(long, global = true)]
    config: Option<String>,

    /// Emit machine-readable JSON instead of text
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    #[command(about = "Select data and submit a new request")]
    Submit(SubmitArgs),
    #[command(about = "List persisted requests and their progress")]
    Status,
    #[command(about = "Re-drive a persisted request, skipping stored payloads")]
    Resume { id: u64 },
    #[command(about = "Delete a request and its payloads")]
    Purge { id: u64 },
    #[command(about = "Write the assembled artifacts of a request to disk")]
    Save {
        id: u64,
        #[arg(long, default_value = ".")]
        dir: String,
    },
    #[command(about = "Manage the auth token")]
    Token(TokenArgs),
    #[command(about = "List phase names supported by relative time windows")]
    Phases,
}

#[derive(Args)]
struct SubmitArgs {
    /// Request type
    #[arg(long, value_enum, default_value = "dataselect")]
    kind: RequestKind,

    /// Metadata detail level (station requests)
    #[arg(long, value_enum)]
    level: Option<MetadataLevel>,

    // Station search
    #[arg(long)]
    network: Option<String>,
    #[arg(long)]
    station: Option<String>,
    #[arg(long)]
    networktype: Option<String>,
    #[arg(long)]
    streams: Option<String>,
    #[arg(long)]
    minlat: Option<f64>,
    #[arg(long)]
    maxlat: Option<f64>,
    #[arg(long)]
    minlon: Option<f64>,
    #[arg(long)]
    maxlon: Option<f64>,

    // Event search
    #[arg(long)]
    catalog: Option<String>,
    #[arg(long)]
    minmag: Option<f64>,
    #[arg(long)]
    maxmag: Option<f64>,
    #[arg(long)]
    mindepth: Option<f64>,
    #[arg(long)]
    maxdepth: Option<f64>,

    /// Import events from a local file instead of a catalog search
    #[arg(long)]
    events_file: Option<String>,
    /// Column layout of the imported event file
    #[arg(long, default_value = "datetime,latitude,longitude,depth,magnitude")]
    events_columns: String,

    /// Search and absolute window start (ISO time)
    #[arg(long)]
    start: Option<String>,
    /// Search and absolute window end (ISO time)
    #[arg(long)]
    end: Option<String>,

    /// Use time windows relative to event phase onsets
    #[arg(long)]
    relative: bool,
    #[arg(long, default_value = "P")]
    start_phase: String,
    #[arg(long, default_value_t = -2, allow_hyphen_values = true)]
    start_offset: i64,
    #[arg(long, default_value = "S")]
    end_phase: String,
    #[arg(long, default_value_t = 10)]
    end_offset: i64,

    // Legacy request service
    #[arg(long)]
    user: Option<String>,
    #[arg(long)]
    compressed: bool,
    #[arg(long)]
    response_dictionary: bool,
}

#[derive(Args)]
struct TokenArgs {
    #[command(subcommand)]
    command: TokenCommand,
}

#[derive(Subcommand)]
enum TokenCommand {
    #[command(about = "Read a token from a file ('-' for stdin) and store it")]
    Set { file: String },
    #[command(about = "Forget the stored token")]
    Clear,
    #[command(about = "Show the identity of the stored token")]
    Show,
}

fn main() -> ExitCode {
    if let Err(report) = run() {
        eprintln!("{report:?}");
        if let Some(err) = report.downcast_ref::<WavereqError>() {
            return ExitCode::from(map_exit_code(err));
        }
        return ExitCode::from(1);
    }
    ExitCode::SUCCESS
}

fn map_exit_code(error: &WavereqError) -> u8 {
    match error {
        WavereqError::RequestNotFound(_) | WavereqError::MissingConfig => 2,
        WavereqError::MetadataHttp(_)
        | WavereqError::MetadataStatus { .. }
        | WavereqError::RoutingHttp(_)
        | WavereqError::RoutingStatus { .. }
        | WavereqError::DataHttp(_)
        | WavereqError::LegacyHttp(_)
        | WavereqError::LegacyStatus { .. } => 3,
        WavereqError::TotalLimitExceeded { .. } | WavereqError::TraceLimitExceeded { .. } => 4,
        _ => 1,
    }
}

fn run() -> miette::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let output_mode = if cli.json {
        OutputMode::Json
    } else {
        OutputMode::Text
    };

    let settings = Settings::load_or_default(cli.config.as_deref()).into_diagnostic()?;
    let mut app = build_app(&settings).into_diagnostic()?;

    let sink: Box<dyn StatusSink> = match output_mode {
        OutputMode::Json => Box::new(JsonOutput),
        OutputMode::Text => Box::new(LogStatusSink),
    };
    let stop = AtomicBool::new(false);

    match cli.command {
        Commands::Submit(args) => run_submit(args, &mut app, sink.as_ref(), &stop, output_mode),
        Commands::Status => {
            let summaries = app.status().into_diagnostic()?;
            match output_mode {
                OutputMode::Json => JsonOutput::print(&summaries).into_diagnostic()?,
                OutputMode::Text => {
                    for s in &summaries {
                        println!(
                            "{}: {} {} ({} groups, {}/{} lines fetched, {} empty)",
                            s.id, s.service, s.filename, s.groups, s.fetched, s.lines, s.nodata
                        );
                    }
                }
            }
            Ok(())
        }
        Commands::Resume { id } => {
            app.load_auth_token().into_diagnostic()?;
            let outcome = app.resume(id, sink.as_ref(), &stop).into_diagnostic()?;
            println!("request {id}: {outcome:?}");
            Ok(())
        }
        Commands::Purge { id } => {
            app.purge(id).into_diagnostic()?;
            println!("request {id} deleted");
            Ok(())
        }
        Commands::Save { id, dir } => {
            let dir = Utf8PathBuf::from(dir);
            let paths = app.save(id, &dir).into_diagnostic()?;
            match output_mode {
                OutputMode::Json => JsonOutput::print(&paths).into_diagnostic()?,
                OutputMode::Text => {
                    for path in paths {
                        println!("{path}");
                    }
                }
            }
            Ok(())
        }
        Commands::Token(args) => run_token(args, &mut app, &settings, output_mode),
        Commands::Phases => {
            let phases = app.phases().into_diagnostic()?;
            match output_mode {
                OutputMode::Json => JsonOutput::print(&phases).into_diagnostic()?,
                OutputMode::Text => {
                    for phase in phases {
                        println!("{phase}");
                    }
                }
            }
            Ok(())
        }
    }
}

type HttpApp = App<MetadataHttpClient, HttpDataClient, HttpRoutingClient, LegacyHttpClient>;

fn build_app(settings: &Settings) -> Result<HttpApp, WavereqError> {
    let metadata = MetadataHttpClient::new(settings.service_root())?;
    let legacy = LegacyHttpClient::new(settings.service_root())?;
    let data = HttpDataClient::new()?;
    let routing_client = HttpRoutingClient::new()?;

    // A broken store degrades to submit-less operation instead of failing
    // outright, matching how the browser handles missing IndexedDB.
    let store = match BlobStore::open(settings.store_root.clone()) {
        Ok(store) => Some(store),
        Err(err) => {
            tracing::warn!("cannot open offline store: {err}");
            None
        }
    };

    let fdsnws = FdsnwsControl::new(
        data,
        routing_client,
        settings.routing,
        settings.router_url.clone(),
        settings.fdsnws_root(),
        store,
    );
    Ok(App::new(settings.clone(), metadata, fdsnws, legacy))
}

fn run_submit(
    args: SubmitArgs,
    app: &mut HttpApp,
    sink: &dyn StatusSink,
    stop: &AtomicBool,
    output_mode: OutputMode,
) -> miette::Result<()> {
    app.init(sink, stop).into_diagnostic()?;

    let station_query = StationQuery {
        start: args.start.clone(),
        end: args.end.clone(),
        network: args.network.clone(),
        networktype: args.networktype.clone(),
        station: args.station.clone(),
        streams: args.streams.clone(),
        minlat: args.minlat,
        maxlat: args.maxlat,
        minlon: args.minlon,
        maxlon: args.maxlon,
        ..StationQuery::default()
    };
    let stations = app.load_stations(&station_query).into_diagnostic()?;
    tracing::info!("station search matched {stations} stations");

    if let Some(catalog) = &args.catalog {
        let event_query = EventQuery {
            start: args.start.clone(),
            end: args.end.clone(),
            minmag: args.minmag,
            maxmag: args.maxmag,
            mindepth: args.mindepth,
            maxdepth: args.maxdepth,
            ..EventQuery::default()
        };
        let events = app.load_events(catalog, &event_query).into_diagnostic()?;
        tracing::info!("event search matched {events} events");
    }

    if let Some(file) = &args.events_file {
        let input = std::fs::read_to_string(file).into_diagnostic()?;
        let events = app
            .import_events("csv", &args.events_columns, &input)
            .into_diagnostic()?;
        tracing::info!("imported {events} events from {file}");
    }

    let mode = if args.relative {
        TimeWindowMode::Relative {
            start_phase: args.start_phase,
            start_offset: args.start_offset,
            end_phase: args.end_phase,
            end_offset: args.end_offset,
        }
    } else {
        let (Some(start), Some(end)) = (args.start, args.end) else {
            return Err(miette::Report::msg(
                "absolute time windows need --start and --end",
            ));
        };
        TimeWindowMode::Absolute { start, end }
    };

    let info = SubmitInfo {
        kind: args.kind,
        level: args.level,
        mode,
        user: args.user,
        compressed: args.compressed,
        response_dictionary: args.response_dictionary,
    };

    let outcome = app
        .submit(&info, None, &AutoConfirm, sink, stop)
        .into_diagnostic()?;

    match outcome {
        SubmitOutcome::Fdsnws { request_id } => match output_mode {
            OutputMode::Json => {
                JsonOutput::print(&json!({ "request": request_id })).into_diagnostic()?;
            }
            OutputMode::Text => println!("request {request_id} submitted"),
        },
        SubmitOutcome::Legacy { outcome } => match output_mode {
            OutputMode::Json => {
                let tickets: Vec<_> = outcome
                    .tickets
                    .iter()
                    .map(|t| json!({ "dcid": t.dcid, "id": t.id }))
                    .collect();
                JsonOutput::print(&json!({
                    "tickets": tickets,
                    "failed_lines": outcome.failed_lines,
                }))
                .into_diagnostic()?;
            }
            OutputMode::Text => {
                for ticket in &outcome.tickets {
                    println!("{}: request {}", ticket.dcid, ticket.id);
                }
                if outcome.failed_lines > 0 {
                    println!("routing of {} lines failed", outcome.failed_lines);
                }
            }
        },
        SubmitOutcome::Cancelled => println!("submission cancelled"),
    }
    Ok(())
}

fn run_token(
    args: TokenArgs,
    app: &mut HttpApp,
    settings: &Settings,
    output_mode: OutputMode,
) -> miette::Result<()> {
    match args.command {
        TokenCommand::Set { file } => {
            let token = if file == "-" {
                let mut buffer = String::new();
                std::io::stdin()
                    .read_to_string(&mut buffer)
                    .into_diagnostic()?;
                buffer
            } else {
                std::fs::read_to_string(&file).into_diagnostic()?
            };
            match app.set_auth_token(Some(&token)).into_diagnostic()? {
                Some(info) => {
                    print_auth_info(&info.user_id, &info.valid_until.to_rfc3339(), output_mode)
                }
                None => Ok(()),
            }
        }
        TokenCommand::Clear => {
            app.set_auth_token(None).into_diagnostic()?;
            println!("token cleared");
            Ok(())
        }
        TokenCommand::Show => {
            let store = BlobStore::open(settings.store_root.clone()).into_diagnostic()?;
            match store.get_token().into_diagnostic()? {
                Some(token) => {
                    let info = wavereq::auth::parse_token(&token).into_diagnostic()?;
                    print_auth_info(&info.user_id, &info.valid_until.to_rfc3339(), output_mode)
                }
                None => {
                    println!("no token stored");
                    Ok(())
                }
            }
        }
    }
}

fn print_auth_info(user_id: &str, valid_until: &str, output_mode: OutputMode) -> miette::Result<()> {
    match output_mode {
        OutputMode::Json => JsonOutput::print(&json!({
            "user": user_id,
            "valid_until": valid_until,
        }))
        .into_diagnostic(),
        OutputMode::Text => {
            println!("{user_id} (valid until {valid_until})");
            Ok(())
        }
    }
}
