use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{SecondsFormat, Utc};
use clap::{Args, Parser, Subcommand};
use platecast_contracts::events::EventWriter;
use platecast_contracts::media::{MerchantInput, RenderedImageRef};
use platecast_contracts::runs::summary::write_summary;
use platecast_engine::media::load_asset;
use platecast_engine::pipeline::{ItemStage, Progress};
use platecast_engine::prompt::PromptBuilder;
use platecast_engine::retry::RetryNotice;
use platecast_engine::{
    resolve, BatchRun, ConfigSources, EventLogObserver, PipelineItemResult,
    PipelineObserver, PipelineRunner, PipelineSettings, PollSettings, ProviderClient,
    ResolvedConfig, RetryPolicy, Session, TemplateVariant, Vendor, VendorSelection,
};
use serde_json::{json, Map, Value};

#[derive(Debug, Parser)]
#[command(
    name = "platecast",
    version,
    about = "Marketing copy and re-rendered photos for takeaway dishes"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Describe, write copy for, and re-render a batch of dish photos.
    Run(RunArgs),
    /// Write copy from the dish name alone, without a photo.
    Copy(CopyArgs),
    /// Print the resolved provider table with credentials masked.
    Config(ConfigArgs),
}

#[derive(Debug, Clone, Args)]
struct ProviderArgs {
    #[arg(long = "vision-provider", default_value = "siliconflow")]
    vision: Vendor,
    #[arg(long = "text-provider", default_value = "deepseek")]
    text: Vendor,
    #[arg(long = "image-provider", default_value = "siliconflow")]
    image: Vendor,
    #[arg(long)]
    vision_model: Option<String>,
    #[arg(long)]
    text_model: Option<String>,
    #[arg(long)]
    image_model: Option<String>,
    /// Serve every capability offline.
    #[arg(long)]
    dryrun: bool,
    /// Secrets TOML; `.streamlit/secrets.toml` is read when present.
    #[arg(long)]
    secrets: Option<PathBuf>,
    #[arg(long, default_value_t = 60)]
    timeout_secs: u64,
}

#[derive(Debug, Clone, Args)]
struct MerchantArgs {
    #[arg(long, default_value = "")]
    dish: String,
    #[arg(long, default_value = "")]
    selling_points: String,
    #[arg(long, default_value = "")]
    context: String,
    #[arg(long)]
    password: Option<String>,
}

#[derive(Debug, Parser)]
struct RunArgs {
    #[arg(long = "image", required = true, num_args = 1..)]
    images: Vec<PathBuf>,
    #[command(flatten)]
    merchant: MerchantArgs,
    #[arg(long, default_value = "plog")]
    variant: TemplateVariant,
    #[arg(long)]
    out: PathBuf,
    #[arg(long)]
    events: Option<PathBuf>,
    #[arg(long, default_value_t = platecast_engine::pipeline::DEFAULT_MAX_ITEMS)]
    max_items: usize,
    #[arg(long, default_value = platecast_engine::pipeline::DEFAULT_IMAGE_SIZE)]
    size: String,
    #[arg(long, default_value_t = 1)]
    count: u32,
    #[arg(long, default_value_t = platecast_engine::pipeline::DEFAULT_STRENGTH)]
    strength: f32,
    /// Render from the prompt only instead of restyling the uploaded photo.
    #[arg(long)]
    text_to_image: bool,
    #[command(flatten)]
    tuning: TuningArgs,
    #[command(flatten)]
    providers: ProviderArgs,
}

#[derive(Debug, Clone, Args)]
struct TuningArgs {
    #[arg(long, default_value_t = 1.0)]
    copy_temperature: f32,
    #[arg(long, default_value_t = 0.3)]
    translation_temperature: f32,
    #[arg(long, default_value_t = platecast_engine::retry::DEFAULT_MAX_ATTEMPTS)]
    retry_attempts: u32,
    #[arg(long, default_value_t = 3)]
    retry_delay_secs: u64,
    #[arg(long, default_value_t = 2)]
    poll_interval_secs: u64,
    #[arg(long, default_value_t = 60)]
    poll_attempts: u32,
}

#[derive(Debug, Parser)]
struct CopyArgs {
    #[command(flatten)]
    merchant: MerchantArgs,
    #[command(flatten)]
    tuning: TuningArgs,
    #[command(flatten)]
    providers: ProviderArgs,
}

#[derive(Debug, Parser)]
struct ConfigArgs {
    #[command(flatten)]
    providers: ProviderArgs,
}

fn main() {
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("platecast error: {err:#}");
            std::process::exit(1);
        }
    }
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    match cli.command {
        Command::Run(args) => run_batch(args),
        Command::Copy(args) => run_copy(args),
        Command::Config(args) => run_config(args),
    }
}

fn run_batch(args: RunArgs) -> Result<i32> {
    let sources = ConfigSources::load(args.providers.secrets.as_deref())?;
    unlock(&sources, args.merchant.password.as_deref())?;
    let resolved = resolve(&vendor_selection(&args.providers), &sources)?;
    print_notes(&resolved);

    let run_id = format!("batch-{}", uuid::Uuid::new_v4());
    let events_path = args
        .events
        .clone()
        .unwrap_or_else(|| args.out.join("events.jsonl"));
    let events = EventWriter::new(&events_path, run_id.clone());
    let mut observer = ConsoleObserver::new(EventLogObserver::new(events));

    let settings = PipelineSettings {
        max_items: args.max_items,
        size: args.size.clone(),
        count: args.count,
        image_to_image: !args.text_to_image,
        variant: args.variant,
        ..PipelineSettings::default()
    }
    .with_strength(args.strength);
    let runner = build_runner(&resolved, &args.tuning).with_settings(settings);

    let started_at = now_utc_iso();
    let batch = process_images(
        &runner,
        &args.images,
        &merchant_input(&args.merchant),
        &mut observer,
    )?;
    let finished_at = now_utc_iso();

    let mut summary = batch.summary(&run_id, &started_at, &finished_at);
    for (row, item) in summary.items.iter_mut().zip(&batch.results) {
        if let Some(RenderedImageRef::Inline { mime_type, bytes }) = &item.image {
            let path = save_inline_image(&args.out, item.index, mime_type, bytes)?;
            row.insert("image_path".to_string(), json!(path.display().to_string()));
        }
    }
    let mut extra = Map::new();
    extra.insert("variant".to_string(), json!(args.variant.as_str()));
    extra.insert("providers".to_string(), provider_rows(&resolved));
    let summary_path = args.out.join("summary.json");
    write_summary(&summary_path, &summary, Some(&extra))
        .with_context(|| format!("failed writing {}", summary_path.display()))?;

    print_batch(&batch, &summary.items);
    println!("{}", batch.summary_line());
    println!("Events: {}", events_path.display());
    println!("Summary: {}", summary_path.display());
    Ok(exit_code(&batch))
}

/// Photos past the batch cap are dropped before they are read.
fn process_images(
    runner: &PipelineRunner,
    images: &[PathBuf],
    input: &MerchantInput,
    observer: &mut dyn PipelineObserver,
) -> Result<BatchRun> {
    runner.run_batch_with(images.to_vec(), |path| load_asset(&path), input, observer)
}

fn run_copy(args: CopyArgs) -> Result<i32> {
    let sources = ConfigSources::load(args.providers.secrets.as_deref())?;
    unlock(&sources, args.merchant.password.as_deref())?;
    let resolved = resolve(&vendor_selection(&args.providers), &sources)?;
    print_notes(&resolved);

    let runner = build_runner(&resolved, &args.tuning);
    let mut observer = ConsoleObserver::stderr_only();
    let copy = runner.run_copy_only(&merchant_input(&args.merchant), &mut observer)?;
    println!("{}", copy.as_str());
    Ok(0)
}

fn run_config(args: ConfigArgs) -> Result<i32> {
    let sources = ConfigSources::load(args.providers.secrets.as_deref())?;
    let resolved = resolve(&vendor_selection(&args.providers), &sources)?;
    match sources.secrets_path() {
        Some(path) => println!("secrets file: {}", path.display()),
        None => println!("secrets file: none"),
    }
    let gate = if Session::new(sources.password()).is_protected() {
        "password required"
    } else {
        "open"
    };
    println!("gate: {gate}");
    for (capability, route) in resolved.table.routes() {
        println!(
            "{:<7} {:<12} {:<19} {:<13} {:<32} {:<36} {}",
            capability.as_str(),
            route.provider,
            route.wire.as_str(),
            route.auth_style().as_str(),
            if route.endpoint.is_empty() { "-" } else { route.endpoint.as_str() },
            route.model,
            route.credential.masked(),
        );
    }
    print_notes(&resolved);
    Ok(0)
}

fn unlock(sources: &ConfigSources, password: Option<&str>) -> Result<()> {
    let mut session = Session::new(sources.password());
    session.unlock(password)?;
    session.require()?;
    Ok(())
}

fn vendor_selection(args: &ProviderArgs) -> VendorSelection {
    let base = if args.dryrun {
        VendorSelection::dryrun()
    } else {
        VendorSelection {
            vision: args.vision,
            text: args.text,
            image: args.image,
            ..VendorSelection::default()
        }
    };
    VendorSelection {
        vision_model: args.vision_model.clone(),
        text_model: args.text_model.clone(),
        image_model: args.image_model.clone(),
        timeout: Duration::from_secs(args.timeout_secs),
        ..base
    }
}

fn build_runner(resolved: &ResolvedConfig, tuning: &TuningArgs) -> PipelineRunner {
    let client = ProviderClient::http().with_poll(PollSettings {
        interval: Duration::from_secs(tuning.poll_interval_secs),
        max_attempts: tuning.poll_attempts.max(1),
    });
    let prompts = PromptBuilder {
        copy_temperature: tuning.copy_temperature,
        translation_temperature: tuning.translation_temperature,
        ..PromptBuilder::default()
    };
    PipelineRunner::new(client, resolved.table.clone())
        .with_retry(RetryPolicy::new(
            tuning.retry_attempts,
            Duration::from_secs(tuning.retry_delay_secs),
        ))
        .with_prompts(prompts)
}

fn merchant_input(args: &MerchantArgs) -> MerchantInput {
    MerchantInput::new(args.dish.as_str(), args.selling_points.as_str())
        .with_context(args.context.as_str())
}

fn print_notes(resolved: &ResolvedConfig) {
    for note in &resolved.notes {
        eprintln!("note: {note}");
    }
}

fn print_batch(batch: &BatchRun, rows: &[Map<String, Value>]) {
    for (item, row) in batch.results.iter().zip(rows) {
        println!("== {}. {} ==", item.index + 1, item.asset.filename);
        if let Some(vision) = &item.vision {
            println!("vision: {}", vision.as_str());
        }
        if let Some(copy) = &item.copy {
            println!("{}", copy.as_str());
        }
        let saved = row.get("image_path").and_then(Value::as_str);
        match (&item.image, saved) {
            (_, Some(path)) => println!("image: {path}"),
            (Some(image), None) => println!("image: {}", image.locator()),
            (None, None) => {}
        }
        if let Some(error) = &item.error {
            println!("error: {error}");
        }
        println!();
    }
}

fn save_inline_image(out: &Path, index: usize, mime_type: &str, bytes: &[u8]) -> Result<PathBuf> {
    let ext = match mime_type {
        "image/jpeg" => "jpg",
        "image/webp" => "webp",
        _ => "png",
    };
    let dir = out.join("images");
    fs::create_dir_all(&dir).with_context(|| format!("failed creating {}", dir.display()))?;
    let path = dir.join(format!("item-{:02}.{ext}", index + 1));
    fs::write(&path, bytes).with_context(|| format!("failed writing {}", path.display()))?;
    Ok(path)
}

/// 0 when anything succeeded, 2 when every processed item failed.
fn exit_code(batch: &BatchRun) -> i32 {
    if batch.succeeded() > 0 {
        0
    } else {
        2
    }
}

fn provider_rows(resolved: &ResolvedConfig) -> Value {
    let mut rows = Map::new();
    for (capability, route) in resolved.table.routes() {
        rows.insert(
            capability.as_str().to_string(),
            json!({
                "provider": route.provider,
                "wire": route.wire.as_str(),
                "auth": route.auth_style().as_str(),
                "model": route.model,
            }),
        );
    }
    Value::Object(rows)
}

fn now_utc_iso() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, false)
}

/// Human progress on stderr, mirrored into the event log when there is one.
struct ConsoleObserver {
    events: Option<EventLogObserver>,
}

impl ConsoleObserver {
    fn new(events: EventLogObserver) -> Self {
        Self {
            events: Some(events),
        }
    }

    fn stderr_only() -> Self {
        Self { events: None }
    }

    fn log(&mut self, emit: impl FnOnce(&mut EventLogObserver) -> Result<()>) -> Result<()> {
        match self.events.as_mut() {
            Some(events) => emit(events),
            None => Ok(()),
        }
    }
}

impl PipelineObserver for ConsoleObserver {
    fn batch_started(&mut self, total: usize, max_items: usize) -> Result<()> {
        eprintln!("processing {total} image(s), limit {max_items}");
        self.log(|events| events.batch_started(total, max_items))
    }

    fn batch_truncated(&mut self, rejected: usize, max_items: usize) -> Result<()> {
        self.log(|events| events.batch_truncated(rejected, max_items))
    }

    fn warning(&mut self, message: &str) -> Result<()> {
        eprintln!("warning: {message}");
        self.log(|events| events.warning(message))
    }

    fn item_stage(&mut self, index: usize, stage: ItemStage) -> Result<()> {
        if stage.is_in_flight() {
            eprintln!("  #{} {stage}", index + 1);
        }
        self.log(|events| events.item_stage(index, stage))
    }

    fn retry_scheduled(&mut self, index: usize, notice: &RetryNotice) -> Result<()> {
        eprintln!("{}", retry_line(index, notice));
        self.log(|events| events.retry_scheduled(index, notice))
    }

    fn item_finished(&mut self, result: &PipelineItemResult, progress: Progress) -> Result<()> {
        let outcome = match (&result.failed_stage, &result.error) {
            (Some(stage), Some(error)) => format!("failed at {stage}: {error}"),
            _ => "done".to_string(),
        };
        eprintln!(
            "[{progress}] {:.0}% {}: {outcome}",
            progress.fraction() * 100.0,
            result.asset.filename
        );
        self.log(|events| events.item_finished(result, progress))
    }

    fn batch_finished(&mut self, run: &BatchRun) -> Result<()> {
        self.log(|events| events.batch_finished(run))
    }
}

fn retry_line(index: usize, notice: &RetryNotice) -> String {
    format!(
        "  #{} {} rate limited (attempt {}/{}); retrying in {}s",
        index + 1,
        notice.label,
        notice.attempt,
        notice.max_attempts,
        notice.delay.as_secs()
    )
}

#[cfg(test)]
mod tests {
    use anyhow::bail;
    use platecast_engine::{NoopObserver, ProviderError};

    use super::*;

    fn dryrun_runner(max_items: usize) -> Result<PipelineRunner> {
        let resolved = resolve(&VendorSelection::dryrun(), &ConfigSources::default())?;
        let runner = build_runner(
            &resolved,
            &TuningArgs {
                copy_temperature: 1.0,
                translation_temperature: 0.3,
                retry_attempts: 1,
                retry_delay_secs: 0,
                poll_interval_secs: 0,
                poll_attempts: 1,
            },
        );
        Ok(runner.with_settings(PipelineSettings {
            max_items,
            ..PipelineSettings::default()
        }))
    }

    fn write_photo(dir: &Path, name: &str) -> Result<PathBuf> {
        let path = dir.join(name);
        image::RgbImage::from_pixel(8, 8, image::Rgb([120, 60, 20])).save(&path)?;
        Ok(path)
    }

    #[test]
    fn run_args_parse_with_defaults() -> Result<()> {
        let cli = Cli::try_parse_from([
            "platecast",
            "run",
            "--image",
            "a.jpg",
            "b.jpg",
            "--dish",
            "红烧肉饭",
            "--out",
            "out",
        ])?;
        let Command::Run(args) = cli.command else {
            bail!("expected run command");
        };
        assert_eq!(args.images.len(), 2);
        assert_eq!(args.variant, TemplateVariant::PlogLifestyle);
        assert_eq!(args.max_items, 5);
        assert_eq!(args.size, "1024x1024");
        assert_eq!(args.providers.vision, Vendor::SiliconFlow);
        assert_eq!(args.providers.text, Vendor::DeepSeek);
        assert_eq!(args.tuning.retry_attempts, 3);
        Ok(())
    }

    #[test]
    fn dryrun_flag_overrides_vendors_but_keeps_models() -> Result<()> {
        let cli = Cli::try_parse_from([
            "platecast",
            "config",
            "--image-provider",
            "kling",
            "--text-model",
            "custom/model",
            "--dryrun",
            "--timeout-secs",
            "15",
        ])?;
        let Command::Config(args) = cli.command else {
            bail!("expected config command");
        };
        let selection = vendor_selection(&args.providers);
        assert_eq!(selection.image, Vendor::Dryrun);
        assert_eq!(selection.text_model.as_deref(), Some("custom/model"));
        assert_eq!(selection.timeout, Duration::from_secs(15));
        Ok(())
    }

    #[test]
    fn unknown_vendor_is_a_parse_error() {
        assert!(Cli::try_parse_from(["platecast", "config", "--image-provider", "midjourney"]).is_err());
    }

    #[test]
    fn inline_images_are_saved_under_out() -> Result<()> {
        let temp = tempfile::tempdir()?;
        let path = save_inline_image(temp.path(), 0, "image/png", &[1, 2, 3])?;
        assert_eq!(path, temp.path().join("images").join("item-01.png"));
        assert_eq!(fs::read(&path)?, vec![1, 2, 3]);
        Ok(())
    }

    #[test]
    fn gate_blocks_wrong_password() {
        let sources = ConfigSources::new(
            [("PLATECAST_PASSWORD".to_string(), "letmein".to_string())]
                .into_iter()
                .collect(),
            Default::default(),
        );
        assert!(unlock(&sources, None).is_err());
        assert!(unlock(&sources, Some("nope")).is_err());
        assert!(unlock(&sources, Some("letmein")).is_ok());
    }

    #[test]
    fn dryrun_batch_writes_images_and_exit_code() -> Result<()> {
        let runner = dryrun_runner(5)?;
        let temp = tempfile::tempdir()?;
        let photo = write_photo(temp.path(), "braised-pork.png")?;

        let batch = process_images(
            &runner,
            &[photo],
            &MerchantInput::new("红烧肉饭", "分量大"),
            &mut NoopObserver,
        )?;
        assert_eq!(exit_code(&batch), 0);
        assert!(matches!(
            batch.results[0].image,
            Some(RenderedImageRef::Inline { .. })
        ));
        Ok(())
    }

    #[test]
    fn unreadable_upload_past_the_cap_is_only_dropped() -> Result<()> {
        let runner = dryrun_runner(2)?;
        let temp = tempfile::tempdir()?;
        let notes = temp.path().join("notes.txt");
        fs::write(&notes, "not a photo")?;
        let images = vec![
            write_photo(temp.path(), "a.png")?,
            write_photo(temp.path(), "b.png")?,
            notes,
        ];
        let events = EventWriter::in_memory("batch-cli");
        let mut observer = ConsoleObserver::new(EventLogObserver::new(events.clone()));

        let batch = process_images(
            &runner,
            &images,
            &MerchantInput::new("红烧肉饭", "分量大"),
            &mut observer,
        )?;
        assert_eq!(batch.results.len(), 2);
        assert_eq!(batch.rejected, 1);
        assert!(batch.warnings[0].contains("dropped the last 1"));
        assert_eq!(exit_code(&batch), 0);
        assert!(events
            .captured()
            .iter()
            .any(|event| event["type"] == "batch_truncated"));
        Ok(())
    }

    #[test]
    fn retry_notices_are_printed() {
        let notice = RetryNotice {
            label: "copy".to_string(),
            attempt: 1,
            max_attempts: 3,
            delay: Duration::from_secs(3),
            error: ProviderError::config("deepseek", "busy"),
        };
        assert_eq!(
            retry_line(0, &notice),
            "  #1 copy rate limited (attempt 1/3); retrying in 3s"
        );
        let mut observer = ConsoleObserver::stderr_only();
        assert!(observer.retry_scheduled(0, &notice).is_ok());
    }
}
