mod config;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use config::Config;
use rosto_core::{
    draw_regions, CommandDetector, Detection, DetectionKind, IdentityKey, IdentityRecord, ManifestDetector, Metadata,
    RegionDetector, SourceImage,
};
use rosto_engine::{BatchReport, Workflow, WorkflowError};
use rosto_hw::{spawn_acquisition, AcquisitionOutcome, Camera, Frame};
use rosto_store::{Registry, RegistryError};
use std::io::{self, BufRead, Write};
use std::path::{Path, PathBuf};
use std::process::ExitCode;

#[derive(Parser)]
#[command(name = "rosto", version, about = "Register detected faces as identities")]
struct Cli {
    /// Config file (default: $XDG_CONFIG_HOME/rosto/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Detect regions in an image and register the new ones
    Register {
        /// Image file to process
        image: PathBuf,
        /// Region type to detect: face, eye or mouth (repeatable)
        #[arg(short, long = "kind", default_value = "face")]
        kinds: Vec<DetectionKind>,
        /// JSON file with precomputed regions per kind, instead of the detector command
        #[arg(long)]
        regions: Option<PathBuf>,
        /// Also save a copy of the image with detected regions outlined
        #[arg(long)]
        annotate: Option<PathBuf>,
        #[command(flatten)]
        metadata: MetadataArgs,
    },
    /// Capture a frame from the camera and register the new regions
    Capture {
        /// Region type to detect: face, eye or mouth (repeatable)
        #[arg(short, long = "kind", default_value = "face")]
        kinds: Vec<DetectionKind>,
    },
    /// List registered identities
    List,
    /// Show one identity
    Show { key: String },
    /// Change the metadata of an identity
    Edit {
        key: String,
        #[command(flatten)]
        metadata: MetadataArgs,
    },
    /// Remove an identity and its images
    Remove { key: String },
    /// Find identities by name, email or telephone
    Search {
        /// Case-insensitive substring; omit to list everything
        query: Option<String>,
    },
    /// Write all identities as a delimited table
    Export {
        path: PathBuf,
        /// Field separator (default from config, usually ',')
        #[arg(long)]
        delimiter: Option<char>,
    },
    /// List V4L2 capture devices
    Devices,
}

#[derive(Args)]
struct MetadataArgs {
    #[arg(long)]
    name: Option<String>,
    #[arg(long)]
    email: Option<String>,
    #[arg(long)]
    phone: Option<String>,
}

impl MetadataArgs {
    fn is_empty(&self) -> bool {
        self.name.is_none() && self.email.is_none() && self.phone.is_none()
    }

    /// All three fields, or none at all.
    fn complete(self) -> Result<Option<Metadata>> {
        match (self.name, self.email, self.phone) {
            (Some(name), Some(email), Some(phone)) => Ok(Some(Metadata::new(name, email, phone))),
            (None, None, None) => Ok(None),
            _ => bail!("--name, --email and --phone must be given together"),
        }
    }

    /// Overlay the given fields on `base`.
    fn merge(self, base: Option<Metadata>) -> Metadata {
        let mut merged = base.unwrap_or_default();
        if let Some(name) = self.name {
            merged.name = name;
        }
        if let Some(email) = self.email {
            merged.email = email;
        }
        if let Some(phone) = self.phone {
            merged.telephone = phone;
        }
        merged
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            match e.downcast_ref::<WorkflowError>() {
                Some(workflow_error) => eprintln!("{}", workflow_error.user_message()),
                None => eprintln!("Error: {e:#}"),
            }
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<()> {
    let config = Config::load(cli.config.as_deref())?;
    tracing::debug!(?config, "configuration resolved");
    let registry = Registry::new(config.registry_path(), config.images_dir());

    match cli.command {
        Commands::Register {
            image,
            kinds,
            regions,
            annotate,
            metadata,
        } => register(&config, registry, &image, &kinds, regions.as_deref(), annotate.as_deref(), metadata),
        Commands::Capture { kinds } => capture(&config, registry, &kinds).await,
        Commands::List => {
            let records = records_only(&config, registry).list()?;
            if records.is_empty() {
                println!("No identities registered");
            }
            for record in &records {
                print_summary(record);
            }
            Ok(())
        }
        Commands::Show { key } => {
            let record = records_only(&config, registry).lookup(&IdentityKey::new(key))?;
            print_record(&record);
            Ok(())
        }
        Commands::Edit { key, metadata } => {
            if metadata.is_empty() {
                bail!("nothing to change: pass --name, --email or --phone");
            }
            let workflow = records_only(&config, registry);
            let key = IdentityKey::new(key);
            let current = workflow.lookup(&key)?;
            let record = workflow.edit(&key, metadata.merge(current.metadata))?;
            println!("Updated {}", record.key);
            Ok(())
        }
        Commands::Remove { key } => {
            let record = records_only(&config, registry).remove(&IdentityKey::new(key))?;
            println!("Removed {}", record.key);
            Ok(())
        }
        Commands::Search { query } => {
            let search = records_only(&config, registry).search(query.as_deref().unwrap_or(""))?;
            let mut found = 0;
            for record in &search {
                print_summary(record);
                found += 1;
            }
            if found == 0 {
                println!("No matches");
            }
            Ok(())
        }
        Commands::Export { path, delimiter } => {
            let delimiter = delimiter.unwrap_or(config.export_delimiter);
            let rows = records_only(&config, registry).export(&path, delimiter)?;
            println!("Exported {rows} identities to {}", path.display());
            Ok(())
        }
        Commands::Devices => {
            let devices = Camera::list_devices();
            if devices.is_empty() {
                println!("No V4L2 capture devices found");
            }
            for device in devices {
                println!("{}  {} ({})", device.path.display(), device.card, device.driver);
            }
            Ok(())
        }
    }
}

/// A workflow for commands that never detect anything.
fn records_only(config: &Config, registry: Registry) -> Workflow<()> {
    Workflow::new((), registry, config.key_policy)
}

fn build_detector(config: &Config, manifest: Option<&Path>) -> Result<Box<dyn RegionDetector>> {
    if let Some(path) = manifest {
        let detector = ManifestDetector::load(path).map_err(WorkflowError::from)?;
        return Ok(Box::new(detector.with_min_size(config.min_region_size)));
    }
    match config.detector_command.as_deref().and_then(CommandDetector::from_command_line) {
        Some(detector) => Ok(Box::new(detector.with_min_size(config.min_region_size))),
        None => bail!("no detector configured: pass --regions <file> or set detector_command"),
    }
}

fn register(
    config: &Config,
    registry: Registry,
    image: &Path,
    kinds: &[DetectionKind],
    regions: Option<&Path>,
    annotate: Option<&Path>,
    flags: MetadataArgs,
) -> Result<()> {
    let preset = flags.complete()?;
    let source = SourceImage::open(image).map_err(WorkflowError::from)?;
    let detector = build_detector(config, regions)?;
    let mut workflow = Workflow::new(detector, registry, config.key_policy).keep_originals(config.keep_originals);

    let detections = process_kinds(&mut workflow, &source, kinds)?;

    if let Some(path) = annotate {
        draw_regions(&source.pixels, &detections)
            .save(path)
            .with_context(|| format!("writing annotated image {}", path.display()))?;
        println!("Annotated image written to {}", path.display());
    }

    settle_pending(&mut workflow, preset)
}

/// Stream from the camera until the user captures or cancels.
///
/// The acquisition callback only takes the frame's image out. By the time
/// `capture()` resolves, the loop has ended and the camera is released, so
/// detection and the metadata prompt run with the device already free.
async fn capture(config: &Config, registry: Registry, kinds: &[DetectionKind]) -> Result<()> {
    let detector = build_detector(config, None)?;
    let device = config.camera_device.clone();
    let handle = spawn_acquisition(move || Camera::open(&device), |frame: Frame| frame.image)?;

    println!(
        "Streaming from {}. Press Enter to capture, or q then Enter to cancel.",
        config.camera_device
    );
    let answer = tokio::task::spawn_blocking(|| {
        let mut line = String::new();
        io::stdin().read_line(&mut line).map(|_| line)
    })
    .await??;

    let image = if answer.trim().eq_ignore_ascii_case("q") {
        handle.cancel().await?;
        None
    } else {
        match handle.capture().await? {
            AcquisitionOutcome::Captured(image) => Some(image),
            AcquisitionOutcome::Cancelled => None,
        }
    };
    let Some(image) = image else {
        println!("Capture cancelled");
        return Ok(());
    };

    let source = SourceImage::from_rgb(image).map_err(WorkflowError::from)?;
    let mut workflow = Workflow::new(detector, registry, config.key_policy).keep_originals(config.keep_originals);
    process_kinds(&mut workflow, &source, kinds)?;
    settle_pending(&mut workflow, None)
}

/// Run every requested kind and print one status line per region.
fn process_kinds<D: RegionDetector>(
    workflow: &mut Workflow<D>,
    source: &SourceImage,
    kinds: &[DetectionKind],
) -> Result<Vec<Detection>> {
    let mut detections = Vec::new();
    for &kind in kinds {
        match workflow.process(source, kind)? {
            BatchReport::NoDetections { kind } => println!("No {kind} regions detected"),
            BatchReport::Processed { regions, .. } => {
                for region in &regions {
                    println!("{}", region.status_message());
                    detections.push(*region.detection());
                }
            }
        }
    }
    Ok(detections)
}

/// Collect metadata for every pending identity, from flags or interactively.
fn settle_pending<D>(workflow: &mut Workflow<D>, preset: Option<Metadata>) -> Result<()> {
    let keys: Vec<IdentityKey> = workflow.pending().map(|p| p.key.clone()).collect();
    if keys.is_empty() {
        return Ok(());
    }

    if let Some(metadata) = preset {
        if keys.len() > 1 {
            bail!(
                "--name, --email and --phone describe one identity, but {} new regions were found",
                keys.len()
            );
        }
        let record = workflow.confirm(&keys[0], metadata)?;
        println!("Registered {}", record.key);
        return Ok(());
    }

    let stdin = io::stdin();
    let mut input = stdin.lock();
    for key in &keys {
        prompt_and_confirm(workflow, key, &mut input)?;
    }
    Ok(())
}

/// Ask for metadata until it is accepted. An empty name skips the identity.
fn prompt_and_confirm<D>(workflow: &mut Workflow<D>, key: &IdentityKey, input: &mut impl BufRead) -> Result<()> {
    let Some(pending) = workflow.pending_identity(key) else {
        return Ok(());
    };
    let d = pending.detection;
    println!();
    println!("New identity {key}: {} at ({}, {}), {}x{}", d.kind, d.x, d.y, d.width, d.height);

    loop {
        let name = prompt(input, "Name (empty to skip)")?;
        if name.trim().is_empty() {
            workflow.abandon(key)?;
            println!("Skipped {key}");
            return Ok(());
        }
        let email = prompt(input, "Email")?;
        let telephone = prompt(input, "Telephone")?;

        match workflow.confirm(key, Metadata::new(name, email, telephone)) {
            Ok(record) => {
                println!("Registered {}", record.key);
                return Ok(());
            }
            Err(e @ (WorkflowError::Validation(_) | WorkflowError::Registry(RegistryError::DuplicateEmail { .. }))) => {
                println!("{}. Try again.", e.user_message());
            }
            Err(e) => return Err(e.into()),
        }
    }
}

fn prompt(input: &mut impl BufRead, label: &str) -> Result<String> {
    print!("{label}: ");
    io::stdout().flush()?;
    let mut line = String::new();
    if input.read_line(&mut line)? == 0 {
        bail!("input closed");
    }
    Ok(line.trim_end_matches(['\r', '\n']).to_string())
}

fn print_summary(record: &IdentityRecord) {
    let (name, email) = record
        .metadata
        .as_ref()
        .map(|m| (m.name.as_str(), m.email.as_str()))
        .unwrap_or(("-", "-"));
    println!("{:<24} {:<28} {}", record.key.as_str(), name, email);
}

fn print_record(record: &IdentityRecord) {
    println!("{}", record.key);
    match &record.metadata {
        Some(m) => {
            println!("  name:      {}", m.name);
            println!("  email:     {}", m.email);
            println!("  telephone: {}", m.telephone);
        }
        None => println!("  (no metadata)"),
    }
    println!("  crop:      {}", record.cropped_image_path.display());
    if let Some(original) = &record.original_image_path {
        println!("  original:  {}", original.display());
    }
    println!("  created:   {}", record.created_at);
    println!("  updated:   {}", record.updated_at);
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;
    use image::{Rgb, RgbImage};
    use rosto_core::KeyPolicy;
    use std::io::Cursor;
    use tempfile::TempDir;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_register_args_parse_kinds_and_aliases() {
        let cli = Cli::try_parse_from(["rosto", "register", "photo.jpg", "-k", "face", "--kind", "olho"]).unwrap();
        match cli.command {
            Commands::Register { kinds, .. } => assert_eq!(kinds, [DetectionKind::Face, DetectionKind::Eye]),
            _ => panic!("expected register"),
        }
        assert!(Cli::try_parse_from(["rosto", "register", "photo.jpg", "--kind", "nose"]).is_err());
    }

    #[test]
    fn test_register_default_kind_is_face() {
        let cli = Cli::try_parse_from(["rosto", "register", "photo.jpg"]).unwrap();
        match cli.command {
            Commands::Register { kinds, .. } => assert_eq!(kinds, [DetectionKind::Face]),
            _ => panic!("expected register"),
        }
    }

    #[test]
    fn test_metadata_flags_all_or_nothing() {
        let partial = MetadataArgs {
            name: Some("Ana".into()),
            email: None,
            phone: None,
        };
        assert!(partial.complete().is_err());

        let none = MetadataArgs {
            name: None,
            email: None,
            phone: None,
        };
        assert!(none.complete().unwrap().is_none());
    }

    #[test]
    fn test_metadata_merge_keeps_unchanged_fields() {
        let flags = MetadataArgs {
            name: None,
            email: Some("new@example.com".into()),
            phone: None,
        };
        let merged = flags.merge(Some(Metadata::new("Ana", "old@example.com", "123")));
        assert_eq!(merged, Metadata::new("Ana", "new@example.com", "123"));
    }

    struct OneFace;

    impl RegionDetector for OneFace {
        fn detect(
            &mut self,
            _image: &SourceImage,
            kind: DetectionKind,
        ) -> Result<Vec<Detection>, rosto_core::DetectorError> {
            Ok(vec![Detection::new(10, 10, 40, 40, kind)])
        }
    }

    fn pending_workflow(dir: &TempDir) -> Workflow<OneFace> {
        let registry = Registry::new(dir.path().join("registry.json"), dir.path().join("images"));
        let mut workflow = Workflow::new(OneFace, registry, KeyPolicy::Ordinal);
        let source = SourceImage::from_rgb(RgbImage::from_pixel(100, 100, Rgb([1, 2, 3]))).unwrap();
        workflow.process(&source, DetectionKind::Face).unwrap();
        workflow
    }

    #[test]
    fn test_prompt_reprompts_after_invalid_email() {
        let dir = TempDir::new().unwrap();
        let mut workflow = pending_workflow(&dir);
        let key = IdentityKey::from("usuario_0");

        let mut input = Cursor::new("Ana\nnot-an-email\n555\nAna\nana@example.com\n555\n");
        prompt_and_confirm(&mut workflow, &key, &mut input).unwrap();

        let record = workflow.lookup(&key).unwrap();
        assert_eq!(record.metadata.unwrap().email, "ana@example.com");
    }

    #[test]
    fn test_prompt_empty_name_abandons() {
        let dir = TempDir::new().unwrap();
        let mut workflow = pending_workflow(&dir);
        let key = IdentityKey::from("usuario_0");

        let mut input = Cursor::new("\n");
        prompt_and_confirm(&mut workflow, &key, &mut input).unwrap();

        assert!(workflow.pending_identity(&key).is_none());
        assert!(!workflow.registry().blob_path().exists());
    }

    #[test]
    fn test_prompt_closed_input_is_an_error() {
        let dir = TempDir::new().unwrap();
        let mut workflow = pending_workflow(&dir);
        let mut input = Cursor::new("Ana\n");
        assert!(prompt_and_confirm(&mut workflow, &IdentityKey::from("usuario_0"), &mut input).is_err());
    }

    #[test]
    fn test_preset_metadata_registers_single_identity() {
        let dir = TempDir::new().unwrap();
        let mut workflow = pending_workflow(&dir);
        settle_pending(&mut workflow, Some(Metadata::new("Ana", "ana@example.com", "555"))).unwrap();
        assert!(workflow.registry().exists(&IdentityKey::from("usuario_0")).unwrap());
    }
}
