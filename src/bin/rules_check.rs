//! Rules Check CLI
//!
//! Runs the registry rule engine against files on disk.

use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context};
use clap::{Parser, Subcommand};
use registry_rules::{
    canonicalize, ArtifactScope, ArtifactType, CompatibilityLevel, Content, ContentType, EngineConfig,
    InMemoryLookup, LayeredRuleSettings, RuleExecutor, RuleViolations, StageTrace, ValidityLevel, Verdict,
};
use serde_json::json;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "rules-check")]
#[command(about = "Validate artifacts and check compatibility between versions")]
struct Cli {
    /// Directory holding referenced artifacts, keyed by relative path
    #[arg(long, global = true)]
    refs: Option<PathBuf>,

    /// Engine config file (limits)
    #[arg(short, long, global = true)]
    config: Option<String>,

    /// Print a JSON report instead of text
    #[arg(long, global = true)]
    json: bool,

    /// Declared media type of the submitted file (e.g. application/x-yaml)
    #[arg(long, global = true)]
    content_type: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate a single artifact
    Validate {
        /// Artifact type (AVRO, PROTOBUF, JSON, ...) or "auto"
        artifact_type: String,
        file: PathBuf,
        /// NONE, SYNTAX_ONLY or FULL
        #[arg(short, long, default_value = "FULL")]
        level: ValidityLevel,
    },

    /// Check a candidate against prior versions, oldest first
    Compat {
        artifact_type: String,
        candidate: PathBuf,
        #[arg(required = true)]
        priors: Vec<PathBuf>,
        /// BACKWARD, FORWARD_TRANSITIVE, FULL, ...
        #[arg(short, long, default_value = "BACKWARD")]
        level: CompatibilityLevel,
    },

    /// Print the canonical form and its digest
    Canonicalize {
        artifact_type: String,
        file: PathBuf,
    },

    /// Run the full registration pipeline
    Register {
        artifact_type: String,
        file: PathBuf,
        #[arg(short, long)]
        group: Option<String>,
        #[arg(short, long)]
        artifact: String,
        /// Layered rule settings (TOML)
        #[arg(short, long)]
        settings: Option<PathBuf>,
        /// Prior versions, oldest first
        #[arg(short, long)]
        prior: Vec<PathBuf>,
    },
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match run(cli) {
        Ok(true) => {}
        Ok(false) => std::process::exit(1),
        Err(e) => {
            eprintln!("Error: {:#}", e);
            std::process::exit(2);
        }
    }
}

/// `Ok(false)` when the content was rejected
fn run(cli: Cli) -> anyhow::Result<bool> {
    let config = EngineConfig::load_from(cli.config.as_deref()).context("loading engine config")?;
    let executor = RuleExecutor::new(config);
    let declared = cli.content_type.as_deref().map(ContentType::from_mime);
    let load = |path: &Path| read(path, declared.as_ref());
    let lookup = match &cli.refs {
        Some(dir) => InMemoryLookup::from_directory(dir)
            .with_context(|| format!("reading references from {}", dir.display()))?,
        None => InMemoryLookup::new(),
    };

    match cli.command {
        Commands::Validate { artifact_type, file, level } => {
            let content = load(file.as_path())?;
            let artifact_type = artifact_type_of(&artifact_type, &content)?;
            let verdict = executor.validate_only(artifact_type, &content, level, &lookup)?;
            let media_type = media_type(artifact_type, &content);
            Ok(report(cli.json, artifact_type, &media_type, &file, None, verdict.map(Some)))
        }

        Commands::Compat { artifact_type, candidate, priors, level } => {
            let content = load(candidate.as_path())?;
            let artifact_type = artifact_type_of(&artifact_type, &content)?;
            let priors = priors.iter().map(|p| load(p.as_path())).collect::<anyhow::Result<Vec<_>>>()?;
            let verdict = executor.check_compatibility_only(artifact_type, &content, &priors, level, &lookup)?;
            let media_type = media_type(artifact_type, &content);
            Ok(report(cli.json, artifact_type, &media_type, &candidate, None, verdict.map(Some)))
        }

        Commands::Canonicalize { artifact_type, file } => {
            let content = load(file.as_path())?;
            let artifact_type = artifact_type_of(&artifact_type, &content)?;
            let canonical = canonicalize(artifact_type, &content);
            if cli.json {
                let output = json!({
                    "artifact_type": artifact_type,
                    "content_type": media_type(artifact_type, &content),
                    "file": file.display().to_string(),
                    "digest": canonical.digest().as_str(),
                    "canonical": String::from_utf8_lossy(canonical.bytes()),
                });
                println!("{}", serde_json::to_string_pretty(&output)?);
            } else {
                println!("{}", String::from_utf8_lossy(canonical.bytes()));
                eprintln!("{}", canonical.digest());
            }
            Ok(true)
        }

        Commands::Register { artifact_type, file, group, artifact, settings, prior } => {
            let content = load(file.as_path())?;
            let artifact_type = artifact_type_of(&artifact_type, &content)?;
            let settings = match settings {
                Some(path) => LayeredRuleSettings::from_file(&path)
                    .with_context(|| format!("reading rule settings from {}", path.display()))?,
                None => LayeredRuleSettings::default(),
            };
            let priors = prior.iter().map(|p| load(p.as_path())).collect::<anyhow::Result<Vec<_>>>()?;
            let scope = ArtifactScope::new(group.as_deref(), artifact);

            let verdict = executor.validate_and_check(artifact_type, &content, &scope, &priors, &settings, &lookup)?;
            let digest = match &verdict {
                Verdict::Accepted(accepted) => Some(accepted.digest().to_string()),
                Verdict::Rejected(_) => None,
            };
            Ok(report(
                cli.json,
                artifact_type,
                &media_type(artifact_type, &content),
                &file,
                digest,
                verdict.map(|accepted| Some(accepted.trace)),
            ))
        }
    }
}

fn read(path: &Path, content_type: Option<&ContentType>) -> anyhow::Result<Content> {
    let bytes = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    let content = Content::from_bytes(bytes);
    Ok(match content_type {
        Some(content_type) => content.with_content_type(content_type.clone()),
        None => content,
    })
}

/// Declared media type, or the usual one for the artifact type
fn media_type(artifact_type: ArtifactType, content: &Content) -> String {
    match content.content_type() {
        Some(content_type) => content_type.as_mime().to_string(),
        None => artifact_type.default_content_type().as_mime().to_string(),
    }
}

fn artifact_type_of(name: &str, content: &Content) -> anyhow::Result<ArtifactType> {
    if name.eq_ignore_ascii_case("auto") {
        return ArtifactType::detect(content).ok_or_else(|| anyhow!("could not detect the artifact type"));
    }
    Ok(name.parse()?)
}

/// Print the verdict; returns whether it was accepted
fn report(
    as_json: bool,
    artifact_type: ArtifactType,
    media_type: &str,
    file: &Path,
    digest: Option<String>,
    verdict: Verdict<Option<StageTrace>>,
) -> bool {
    let accepted = verdict.is_accepted();

    if as_json {
        let (trace, violations) = match &verdict {
            Verdict::Accepted(trace) => (trace.as_ref().map(ToString::to_string), None),
            Verdict::Rejected(violations) => (None, Some(violations)),
        };
        let output = json!({
            "checked_at": chrono::Utc::now().to_rfc3339(),
            "artifact_type": artifact_type,
            "content_type": media_type,
            "file": file.display().to_string(),
            "accepted": accepted,
            "digest": digest,
            "trace": trace,
            "violations": violations.map(RuleViolations::as_slice).unwrap_or(&[]),
        });
        match serde_json::to_string_pretty(&output) {
            Ok(text) => println!("{}", text),
            Err(e) => eprintln!("Error: {}", e),
        }
        return accepted;
    }

    match verdict {
        Verdict::Accepted(_) => {
            println!("✅ {} ({}) - accepted", file.display(), artifact_type);
            if let Some(digest) = digest {
                println!("   └─ {}", digest);
            }
        }
        Verdict::Rejected(violations) => {
            println!("❌ {} ({}) - {} violation(s)", file.display(), artifact_type, violations.len());
            for violation in &violations {
                println!("   └─ {}", violation);
            }
        }
    }
    accepted
}
