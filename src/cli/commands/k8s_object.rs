//! `keelscan k8s-object` subcommands.

use std::sync::Arc;

use clap::{Args, Subcommand};

use crate::cli::global::GlobalArgs;
use crate::errors::{Error, Result};
use crate::events::{NullSink, ProgressSink, SpinnerSink};
use crate::validate::ResourceValidator;

#[derive(Subcommand, Debug)]
pub enum K8sObjectCommand {
    /// Validate Kubernetes manifests against org policy
    Validate(ValidateArgs),
}

#[derive(Args, Debug)]
pub struct ValidateArgs {
    /// File or directory of YAML manifests, or `-` for stdin
    pub path: String,

    /// Build stage reported with the validation
    #[arg(long, default_value = "DEPLOY")]
    pub build_step: String,

    /// Namespace the objects are deployed to
    #[arg(long, default_value = "default")]
    pub namespace: String,
}

pub async fn run(global: &GlobalArgs, command: &K8sObjectCommand) -> Result<()> {
    match command {
        K8sObjectCommand::Validate(args) => validate(global, args).await,
    }
}

async fn validate(global: &GlobalArgs, args: &ValidateArgs) -> Result<()> {
    let (config, session) = global.session()?;
    let sink: Arc<dyn ProgressSink> = if global.no_progress || global.quiet {
        Arc::new(NullSink)
    } else {
        Arc::new(SpinnerSink::new())
    };

    let validator = ResourceValidator::new(
        session,
        &config.saas_url,
        &config.org_key,
        &args.build_step,
        &args.namespace,
    );
    let results = validator.validate(&args.path, sink).await?;
    let by_policy = results.to_by_policy();

    println!(
        "{}",
        serde_json::to_string_pretty(&by_policy)
            .map_err(|e| Error::ValidateFailed(format!("failed to render results: {e}")))?
    );

    let count = by_policy.policy_violations_count();
    if count > 0 {
        return Err(Error::PolicyViolation { count });
    }
    Ok(())
}
