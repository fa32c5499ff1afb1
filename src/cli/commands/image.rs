//! `keelscan image` subcommands.

use std::sync::Arc;

use clap::{Args, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::warn;
use uuid::Uuid;

use crate::cli::global::GlobalArgs;
use crate::errors::{Error, Result};
use crate::events::{NullSink, ProgressSink, SpinnerSink};
use crate::image::loader::LoadOptions;
use crate::image::{load_image, Credential};
use crate::scan::{
    generate_bom, reconstruct_layers, BuiltinCataloger, PackageCataloger, ScanHandler, ScanOptions,
};

#[derive(Subcommand, Debug)]
pub enum ImageCommand {
    /// Scan an image and report its vulnerabilities
    Scan(ScanArgs),
    /// Print the package catalog for an image without scanning it
    Packages(PackagesArgs),
}

#[derive(Args, Debug)]
pub struct ScanArgs {
    /// Image reference, archive path, or daemon-local name
    pub source: String,

    /// Rescan even when the backend already has a report
    #[arg(long = "force")]
    pub force_scan: bool,

    /// Resolve non-file inputs against the registry before the daemon
    #[arg(long)]
    pub bypass_docker_daemon: bool,

    /// Registry credentials as username[:password]
    #[arg(long)]
    pub credential: Option<String>,

    /// Tag to file the report under, derived from the input when unset
    #[arg(long)]
    pub full_tag: Option<String>,

    /// Polling timeout in seconds
    #[arg(long)]
    pub timeout: Option<u64>,

    /// Build stage reported with the scan
    #[arg(long, default_value = "CICD")]
    pub build_step: String,

    /// Namespace the image is deployed to
    #[arg(long, default_value = "default")]
    pub namespace: String,
}

#[derive(Args, Debug)]
pub struct PackagesArgs {
    /// Image reference, archive path, or daemon-local name
    pub source: String,

    #[arg(long)]
    pub bypass_docker_daemon: bool,

    /// Registry credentials as username[:password]
    #[arg(long)]
    pub credential: Option<String>,
}

pub async fn run(global: &GlobalArgs, command: &ImageCommand) -> Result<()> {
    match command {
        ImageCommand::Scan(args) => scan(global, args).await,
        ImageCommand::Packages(args) => packages(global, args).await,
    }
}

fn progress_sink(global: &GlobalArgs) -> Arc<dyn ProgressSink> {
    if global.no_progress || global.quiet {
        Arc::new(NullSink)
    } else {
        Arc::new(SpinnerSink::new())
    }
}

fn load_options(bypass_docker_daemon: bool, credential: Option<&str>) -> Result<LoadOptions> {
    Ok(LoadOptions {
        bypass_docker_daemon,
        credential: credential.map(Credential::parse).transpose()?,
    })
}

async fn scan(global: &GlobalArgs, args: &ScanArgs) -> Result<()> {
    let (config, session) = global.session()?;
    let sink = progress_sink(global);

    let load_opts = load_options(args.bypass_docker_daemon, args.credential.as_deref())?;
    let image = Arc::new(load_image(&args.source, &load_opts, Arc::clone(&sink)).await?);

    sink.stage("Reconstructing image layers");
    let layers_image = Arc::clone(&image);
    let layers_task = tokio::task::spawn_blocking(move || reconstruct_layers(&layers_image));

    let cataloger = BuiltinCataloger;
    let bom = generate_bom(&image, &args.source, args.full_tag.as_deref(), &cataloger)?;
    let layers = layers_task
        .await
        .map_err(|e| Error::LayersGeneration(format!("layer task failed: {e}")))??;

    let mut handler = ScanHandler::new(
        session,
        &config.saas_url,
        &config.org_key,
        &args.build_step,
        &args.namespace,
        Arc::clone(&sink),
    );
    handler.attach_data(bom, layers, image.id.clone(), cataloger.version());

    if let Err(err) = handler.health_check().await {
        warn!(error = %err, "analyzer health check failed, proceeding anyway");
    }

    let cancel = CancellationToken::new();
    let ctrl_c_cancel = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            ctrl_c_cancel.cancel();
        }
    });

    let scan_opts = ScanOptions {
        force_scan: args.force_scan,
        timeout: args.timeout,
    };
    let operation_id = Uuid::new_v4().to_string();
    let report = handler.scan(&operation_id, &scan_opts, cancel).await;
    sink.completed();
    let report = report?;

    println!(
        "{}",
        serde_json::to_string_pretty(&report)
            .map_err(|e| Error::ScanFailed(format!("failed to render report: {e}")))?
    );
    Ok(())
}

async fn packages(global: &GlobalArgs, args: &PackagesArgs) -> Result<()> {
    let sink = progress_sink(global);
    let load_opts = load_options(args.bypass_docker_daemon, args.credential.as_deref())?;
    let image = load_image(&args.source, &load_opts, Arc::clone(&sink)).await?;

    sink.stage("Cataloging packages");
    let catalog = BuiltinCataloger.catalog(&image)?;
    sink.completed();

    println!(
        "{}",
        serde_json::to_string_pretty(&catalog)
            .map_err(|e| Error::SbomGeneration(format!("failed to render catalog: {e}")))?
    );
    Ok(())
}
