use anyhow::{Context, Result};
use axum::Router;
use depositor::{
    config::{AppConfig, Command, DepositArgs, DownloadArgs},
    models::report::Report,
    routes,
    services::{
        deposit_service::{DepositOptions, DepositOutcome, DepositService, package_path},
        doi::DataciteClient,
        invenio_client::InvenioClient,
        journal::Journal,
        memory_repository::MemoryRepository,
        mirror::{download_tree, resolve_title},
    },
};
use std::{io::ErrorKind, path::Path, process::ExitCode, sync::Arc};
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<ExitCode> {
    // --- Logging setup ---
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    // --- Parse config + command ---
    let (cfg, command) = AppConfig::from_env_and_args()?;

    tracing::debug!("Starting depositor with config: {:?}", cfg);

    match command {
        Command::Deposit(args) => deposit(&cfg, args).await,
        Command::Download(args) => download(&cfg, args).await,
        Command::Cleanup { all } => cleanup(&cfg, all).await,
        Command::Sandbox { host, port } => sandbox(&host, port).await,
    }
}

fn client(cfg: &AppConfig) -> Result<InvenioClient> {
    let url = cfg.repository_url()?;
    InvenioClient::new(url, cfg.token.clone(), cfg.http_timeout)
        .with_context(|| format!("creating client for {}", url))
}

async fn service(cfg: &AppConfig) -> Result<DepositService> {
    let journal = Journal::open(&cfg.journal_url)
        .await
        .with_context(|| format!("opening journal {}", cfg.journal_url))?;
    let mut service = DepositService::new(Arc::new(client(cfg)?))
        .with_journal(journal)
        .with_lock_timeout(cfg.lock_timeout);
    if let Some(creator) = &cfg.preservation_creator {
        service = service.with_preservation_creator(creator.clone());
    }
    if let Some(settings) = &cfg.datacite {
        let registrar = DataciteClient::new(settings, cfg.http_timeout)
            .with_context(|| format!("creating DataCite client for {}", settings.url))?;
        service = service.with_doi_registrar(Arc::new(registrar));
    }
    Ok(service)
}

async fn deposit(cfg: &AppConfig, args: DepositArgs) -> Result<ExitCode> {
    let service = service(cfg).await?;
    let package = package_path(&args.path);
    let options = DepositOptions {
        public_files: args.public_files,
        separate_private_records: args.separate_private_records,
        update: args.update,
        no_publish: args.no_publish,
    };

    let mut report = Report::new();
    let outcome = service.deposit(&package, &options, &mut report).await;
    finish_report(&report, args.report.as_deref()).await?;

    match outcome {
        DepositOutcome::Deposited {
            root_id,
            preservation_id,
            published,
        } => {
            let state = if published { "published" } else { "drafted" };
            println!("{} {} (preservation record {})", state, root_id, preservation_id);
            Ok(if published || args.no_publish {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            })
        }
        DepositOutcome::Rejected => {
            eprintln!("package {} was rejected", package.display());
            Ok(ExitCode::FAILURE)
        }
        DepositOutcome::LockUnavailable => {
            eprintln!("another deposit holds the lock");
            Ok(ExitCode::FAILURE)
        }
        DepositOutcome::UpdateNotImplemented { title } => {
            eprintln!("updating \"{}\" is not implemented", title);
            Ok(ExitCode::FAILURE)
        }
        DepositOutcome::RolledBack { reason, complete } => {
            eprintln!("deposit rolled back: {}", reason);
            if !complete {
                eprintln!("some drafts remain; run `depositor cleanup`");
            }
            Ok(ExitCode::FAILURE)
        }
    }
}

async fn download(cfg: &AppConfig, args: DownloadArgs) -> Result<ExitCode> {
    let client = client(cfg)?;
    let id = match (args.record.id, args.record.title) {
        (Some(id), _) => id,
        (None, Some(title)) => resolve_title(&client, &title)
            .await?
            .with_context(|| format!("no record titled \"{}\"", title))?,
        (None, None) => anyhow::bail!("either --id or --title is required"),
    };

    tokio::fs::create_dir_all(&args.dest).await?;
    let mut report = Report::new();
    let summary = download_tree(&client, &id, &args.dest, &mut report).await?;
    finish_report(&report, args.report.as_deref()).await?;

    println!(
        "downloaded {} files from {} records into {}",
        summary.files,
        summary.records,
        args.dest.display()
    );
    Ok(if summary.checksum_failures == 0 {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

async fn cleanup(cfg: &AppConfig, all: bool) -> Result<ExitCode> {
    let service = service(cfg).await?;
    let mut report = Report::new();
    let summary = service.cleanup(all, &mut report).await?;
    finish_report(&report, None).await?;
    Ok(if summary.failed == 0 {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

async fn sandbox(host: &str, port: u16) -> Result<ExitCode> {
    // --- Start server ---
    let addr = format!("{}:{}", host, port);
    let listener = match TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(err)
            if err.kind() == ErrorKind::PermissionDenied && matches!(host, "0.0.0.0" | "::") =>
        {
            let fallback_addr = format!("127.0.0.1:{}", port);
            tracing::warn!(
                "Permission denied binding to {} ({}). Falling back to {}",
                addr,
                err,
                fallback_addr
            );
            TcpListener::bind(&fallback_addr).await?
        }
        Err(err) => return Err(err.into()),
    };

    let local = listener.local_addr()?;
    let repo = MemoryRepository::new(format!("http://{}", local));

    // --- Build router ---
    let app: Router = routes::routes::routes().with_state(repo);

    tracing::info!("Sandbox listening on http://{}", local);
    axum::serve(listener, app).await?;

    Ok(ExitCode::SUCCESS)
}

/// Print the report and optionally store it as JSON.
async fn finish_report(report: &Report, path: Option<&Path>) -> Result<()> {
    for item in report.iter() {
        println!("{}", item);
    }
    if let Some(path) = path {
        let json = serde_json::to_vec_pretty(report)?;
        tokio::fs::write(path, json)
            .await
            .with_context(|| format!("writing report to {}", path.display()))?;
    }
    Ok(())
}
