use std::fmt;

use anyhow::{bail, Result};
use platecast_contracts::media::{
    GeneratedCopy, MediaAsset, MerchantInput, RenderedImageRef, VisionDescription,
};
use platecast_contracts::providers::{Capability, ProviderRoute, ProviderTable};
use platecast_contracts::runs::summary::BatchSummary;
use serde::Serialize;
use serde_json::{json, Map, Value};
use thiserror::Error;

use crate::client::{check_route, ImageRequest, ProviderClient, SourceImage};
use crate::error::ProviderError;
use crate::media::fingerprint;
use crate::progress::PipelineObserver;
use crate::prompt::{PromptBuilder, TemplateVariant};
use crate::retry::{RetryNotice, RetryPolicy};

pub const DEFAULT_MAX_ITEMS: usize = 5;
pub const DEFAULT_IMAGE_SIZE: &str = "1024x1024";
pub const DEFAULT_STRENGTH: f32 = 0.6;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemStage {
    Pending,
    VisionInFlight,
    VisionDone,
    CopyInFlight,
    CopyDone,
    ImageInFlight,
    Complete,
    Failed,
}

impl ItemStage {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::VisionInFlight => "vision_in_flight",
            Self::VisionDone => "vision_done",
            Self::CopyInFlight => "copy_in_flight",
            Self::CopyDone => "copy_done",
            Self::ImageInFlight => "image_in_flight",
            Self::Complete => "complete",
            Self::Failed => "failed",
        }
    }

    pub fn is_in_flight(self) -> bool {
        matches!(
            self,
            Self::VisionInFlight | Self::CopyInFlight | Self::ImageInFlight
        )
    }

    /// `Failed` is reachable only from an in-flight stage.
    pub fn advance(self, next: ItemStage) -> Result<ItemStage, StageError> {
        let allowed = match (self, next) {
            (Self::Pending, Self::VisionInFlight)
            | (Self::VisionInFlight, Self::VisionDone)
            | (Self::VisionDone, Self::CopyInFlight)
            | (Self::CopyInFlight, Self::CopyDone)
            | (Self::CopyDone, Self::ImageInFlight)
            | (Self::ImageInFlight, Self::Complete) => true,
            (from, Self::Failed) => from.is_in_flight(),
            _ => false,
        };
        if allowed {
            Ok(next)
        } else {
            Err(StageError {
                from: self,
                to: next,
            })
        }
    }
}

impl fmt::Display for ItemStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("illegal stage transition {from} -> {to}")]
pub struct StageError {
    pub from: ItemStage,
    pub to: ItemStage,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StageKind {
    Vision,
    Copy,
    Image,
}

impl StageKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Vision => "vision",
            Self::Copy => "copy",
            Self::Image => "image",
        }
    }

    fn in_flight(self) -> ItemStage {
        match self {
            Self::Vision => ItemStage::VisionInFlight,
            Self::Copy => ItemStage::CopyInFlight,
            Self::Image => ItemStage::ImageInFlight,
        }
    }
}

impl fmt::Display for StageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AssetSummary {
    pub filename: String,
    pub mime_type: String,
    pub bytes: usize,
    pub fingerprint: String,
}

impl AssetSummary {
    pub fn of(asset: &MediaAsset) -> Self {
        Self {
            filename: asset.filename().to_string(),
            mime_type: asset.mime_type().to_string(),
            bytes: asset.len(),
            fingerprint: fingerprint(asset),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PipelineItemResult {
    pub index: usize,
    pub asset: AssetSummary,
    pub vision: Option<VisionDescription>,
    pub copy: Option<GeneratedCopy>,
    pub image_prompt: Option<String>,
    pub image: Option<RenderedImageRef>,
    pub stage: ItemStage,
    pub failed_stage: Option<StageKind>,
    pub error: Option<String>,
}

impl PipelineItemResult {
    fn new(index: usize, asset: &MediaAsset) -> Self {
        Self {
            index,
            asset: AssetSummary::of(asset),
            vision: None,
            copy: None,
            image_prompt: None,
            image: None,
            stage: ItemStage::Pending,
            failed_stage: None,
            error: None,
        }
    }

    pub fn is_success(&self) -> bool {
        self.stage == ItemStage::Complete
    }

    /// Flat JSON row for events and the batch summary. Inline images are
    /// reported by size, not embedded.
    pub fn to_row(&self) -> Map<String, Value> {
        let mut row = Map::new();
        row.insert("index".to_string(), json!(self.index));
        row.insert("filename".to_string(), json!(self.asset.filename));
        row.insert("mime_type".to_string(), json!(self.asset.mime_type));
        row.insert("bytes".to_string(), json!(self.asset.bytes));
        row.insert("fingerprint".to_string(), json!(self.asset.fingerprint));
        row.insert("stage".to_string(), json!(self.stage.as_str()));
        row.insert(
            "vision".to_string(),
            json!(self.vision.as_ref().map(VisionDescription::as_str)),
        );
        row.insert(
            "copy".to_string(),
            json!(self.copy.as_ref().map(GeneratedCopy::as_str)),
        );
        row.insert("image_prompt".to_string(), json!(self.image_prompt));
        match &self.image {
            Some(RenderedImageRef::Url(url)) => {
                row.insert("image_url".to_string(), json!(url));
            }
            Some(RenderedImageRef::Inline { mime_type, bytes }) => {
                row.insert(
                    "image_inline".to_string(),
                    json!({ "mime_type": mime_type, "bytes": bytes.len() }),
                );
            }
            None => {}
        }
        if let Some(stage) = self.failed_stage {
            row.insert("failed_stage".to_string(), json!(stage.as_str()));
        }
        if let Some(error) = &self.error {
            row.insert("error".to_string(), json!(error));
        }
        row
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Progress {
    pub done: usize,
    pub total: usize,
}

impl Progress {
    pub fn fraction(self) -> f64 {
        if self.total == 0 {
            1.0
        } else {
            self.done as f64 / self.total as f64
        }
    }
}

impl fmt::Display for Progress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.done, self.total)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct BatchRun {
    pub results: Vec<PipelineItemResult>,
    pub max_items: usize,
    pub rejected: usize,
    pub warnings: Vec<String>,
}

impl BatchRun {
    pub fn succeeded(&self) -> usize {
        self.results.iter().filter(|item| item.is_success()).count()
    }

    pub fn failed(&self) -> usize {
        self.results.len() - self.succeeded()
    }

    pub fn summary_line(&self) -> String {
        let mut line = format!("{} succeeded, {} failed", self.succeeded(), self.failed());
        if self.rejected > 0 {
            line.push_str(&format!(", {} rejected over the limit", self.rejected));
        }
        line
    }

    pub fn summary(&self, run_id: &str, started_at: &str, finished_at: &str) -> BatchSummary {
        BatchSummary {
            run_id: run_id.to_string(),
            started_at: started_at.to_string(),
            finished_at: finished_at.to_string(),
            max_items: self.max_items as u64,
            total_items: self.results.len() as u64,
            succeeded: self.succeeded() as u64,
            failed: self.failed() as u64,
            rejected: self.rejected as u64,
            items: self.results.iter().map(PipelineItemResult::to_row).collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PipelineSettings {
    pub max_items: usize,
    pub size: String,
    pub count: u32,
    /// Image-to-image strength, clamped to 0..=1.
    pub strength: f32,
    pub image_to_image: bool,
    pub variant: TemplateVariant,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            max_items: DEFAULT_MAX_ITEMS,
            size: DEFAULT_IMAGE_SIZE.to_string(),
            count: 1,
            strength: DEFAULT_STRENGTH,
            image_to_image: true,
            variant: TemplateVariant::default(),
        }
    }
}

impl PipelineSettings {
    pub fn with_strength(mut self, strength: f32) -> Self {
        self.strength = if strength.is_finite() {
            strength.clamp(0.0, 1.0)
        } else {
            DEFAULT_STRENGTH
        };
        self
    }
}

/// Runs vision, copy and image stages for each uploaded photo, one at a time.
pub struct PipelineRunner {
    client: ProviderClient,
    table: ProviderTable,
    retry: RetryPolicy,
    prompts: PromptBuilder,
    settings: PipelineSettings,
}

impl PipelineRunner {
    pub fn new(client: ProviderClient, table: ProviderTable) -> Self {
        Self {
            client,
            table,
            retry: RetryPolicy::default(),
            prompts: PromptBuilder::default(),
            settings: PipelineSettings::default(),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_prompts(mut self, prompts: PromptBuilder) -> Self {
        self.prompts = prompts;
        self
    }

    pub fn with_settings(mut self, settings: PipelineSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Items beyond `max_items` are rejected before any call is made. Item
    /// failures become result rows; only observer errors abort the batch.
    pub fn run_batch(
        &self,
        assets: Vec<MediaAsset>,
        input: &MerchantInput,
        observer: &mut dyn PipelineObserver,
    ) -> Result<BatchRun> {
        self.run_batch_with(assets, Ok, input, observer)
    }

    /// Like [`run_batch`](Self::run_batch), but `load` only runs for the
    /// sources kept under the cap, so rejected uploads are never read.
    pub fn run_batch_with<S>(
        &self,
        mut sources: Vec<S>,
        load: impl FnMut(S) -> Result<MediaAsset>,
        input: &MerchantInput,
        observer: &mut dyn PipelineObserver,
    ) -> Result<BatchRun> {
        let max_items = self.settings.max_items.max(1);
        let offered = sources.len();
        let rejected = offered.saturating_sub(max_items);
        sources.truncate(max_items);
        let assets = sources
            .into_iter()
            .map(load)
            .collect::<Result<Vec<_>>>()?;
        let total = assets.len();

        observer.batch_started(total, max_items)?;
        let mut warnings = Vec::new();
        if rejected > 0 {
            let warning = format!(
                "{offered} images uploaded but at most {max_items} are processed per batch; \
                 dropped the last {rejected}"
            );
            observer.batch_truncated(rejected, max_items)?;
            observer.warning(&warning)?;
            warnings.push(warning);
        }

        let mut results = Vec::with_capacity(total);
        for (index, asset) in assets.iter().enumerate() {
            let result = self.run_item(index, asset, input, observer)?;
            observer.item_finished(
                &result,
                Progress {
                    done: index + 1,
                    total,
                },
            )?;
            results.push(result);
        }

        let run = BatchRun {
            results,
            max_items,
            rejected,
            warnings,
        };
        observer.batch_finished(&run)?;
        Ok(run)
    }

    pub fn run_item(
        &self,
        index: usize,
        asset: &MediaAsset,
        input: &MerchantInput,
        observer: &mut dyn PipelineObserver,
    ) -> Result<PipelineItemResult> {
        let mut item = PipelineItemResult::new(index, asset);

        enter(&mut item, StageKind::Vision.in_flight(), observer)?;
        if let Err((stage, err)) = self.preflight() {
            return fail(item, stage, err, observer);
        }
        let vision = match self.vision_stage(index, asset, observer)? {
            Ok(vision) => vision,
            Err(err) => return fail(item, StageKind::Vision, err, observer),
        };
        item.vision = Some(vision.clone());
        enter(&mut item, ItemStage::VisionDone, observer)?;

        enter(&mut item, StageKind::Copy.in_flight(), observer)?;
        match self.copy_stage(index, Some(&vision), input, observer)? {
            Ok(copy) => item.copy = Some(copy),
            Err(err) => return fail(item, StageKind::Copy, err, observer),
        }
        enter(&mut item, ItemStage::CopyDone, observer)?;

        enter(&mut item, StageKind::Image.in_flight(), observer)?;
        match self.image_stage(index, asset, &vision, input, &mut item, observer)? {
            Ok(image) => item.image = Some(image),
            Err(err) => return fail(item, StageKind::Image, err, observer),
        }
        enter(&mut item, ItemStage::Complete, observer)?;
        Ok(item)
    }

    /// Text stage alone, with no photo. The dish name is required because
    /// there is no vision description to stand in for it.
    pub fn run_copy_only(
        &self,
        input: &MerchantInput,
        observer: &mut dyn PipelineObserver,
    ) -> Result<GeneratedCopy> {
        if input.dish_name().is_none() {
            bail!("dish name is required to write copy without a photo");
        }
        let copy = self.copy_stage(0, None, input, observer)??;
        Ok(copy)
    }

    /// Vision and text routes are checked before the first call, so a broken
    /// text setup never spends a vision request. The image route is checked
    /// later, in the image stage, and the copy is kept when only that fails.
    fn preflight(&self) -> Result<(), (StageKind, ProviderError)> {
        for (stage, capability) in [
            (StageKind::Vision, Capability::Vision),
            (StageKind::Copy, Capability::Text),
        ] {
            self.route(capability)
                .and_then(|route| check_route(route, capability))
                .map_err(|err| (stage, err))?;
        }
        Ok(())
    }

    fn route(&self, capability: Capability) -> Result<&ProviderRoute, ProviderError> {
        self.table.get(capability).ok_or_else(|| {
            ProviderError::config(
                capability.as_str(),
                format!("no provider configured for {capability}"),
            )
        })
    }

    fn vision_stage(
        &self,
        index: usize,
        asset: &MediaAsset,
        observer: &mut dyn PipelineObserver,
    ) -> Result<Result<VisionDescription, ProviderError>> {
        let route = match self.route(Capability::Vision) {
            Ok(route) => route,
            Err(err) => return Ok(Err(err)),
        };
        let request = self.prompts.vision_request(asset);
        let mut relay = RetryRelay::new(index, observer);
        let outcome = self.retry.run("vision", &mut |notice| relay.notify(notice), |_| {
            self.client.describe_image(route, &request)
        });
        relay.finish()?;
        Ok(outcome.and_then(|text| {
            VisionDescription::new(text).ok_or_else(|| {
                ProviderError::malformed(&route.provider, "vision description is empty")
            })
        }))
    }

    fn copy_stage(
        &self,
        index: usize,
        vision: Option<&VisionDescription>,
        input: &MerchantInput,
        observer: &mut dyn PipelineObserver,
    ) -> Result<Result<GeneratedCopy, ProviderError>> {
        let route = match self.route(Capability::Text) {
            Ok(route) => route,
            Err(err) => return Ok(Err(err)),
        };
        let request = self.prompts.copy_request(vision, input);
        let mut relay = RetryRelay::new(index, observer);
        let outcome = self.retry.run("copy", &mut |notice| relay.notify(notice), |_| {
            self.client.complete_text(route, &request)
        });
        relay.finish()?;
        Ok(outcome.and_then(|text| {
            GeneratedCopy::new(text)
                .ok_or_else(|| ProviderError::malformed(&route.provider, "copy came back empty"))
        }))
    }

    fn image_stage(
        &self,
        index: usize,
        asset: &MediaAsset,
        vision: &VisionDescription,
        input: &MerchantInput,
        item: &mut PipelineItemResult,
        observer: &mut dyn PipelineObserver,
    ) -> Result<Result<RenderedImageRef, ProviderError>> {
        // The image route is checked before the translation call so a bad
        // image setup costs no text request.
        let routes = self.route(Capability::Image).and_then(|image_route| {
            check_route(image_route, Capability::Image)?;
            Ok((image_route, self.route(Capability::Text)?))
        });
        let (image_route, text_route) = match routes {
            Ok(routes) => routes,
            Err(err) => return Ok(Err(err)),
        };

        let mut relay = RetryRelay::new(index, observer);
        let prompt = self.prompts.build_image_prompt(
            &self.client,
            text_route,
            &self.retry,
            vision,
            input,
            self.settings.variant,
            &mut |notice| relay.notify(notice),
        );
        relay.finish()?;
        let prompt = match prompt {
            Ok(prompt) => prompt,
            Err(err) => return Ok(Err(err)),
        };
        item.image_prompt = Some(prompt.prompt.clone());

        let request = ImageRequest {
            prompt: prompt.prompt,
            size: self.settings.size.clone(),
            count: self.settings.count.max(1),
            source: self.settings.image_to_image.then(|| SourceImage {
                asset: asset.clone(),
                strength: self.settings.strength.clamp(0.0, 1.0),
            }),
        };
        let mut relay = RetryRelay::new(index, observer);
        let outcome = self.retry.run("image", &mut |notice| relay.notify(notice), |_| {
            self.client.generate_image(image_route, &request)
        });
        relay.finish()?;
        Ok(outcome)
    }
}

/// Forwards retry notices to the observer and keeps the first logging error.
struct RetryRelay<'a> {
    index: usize,
    observer: &'a mut dyn PipelineObserver,
    failure: Option<anyhow::Error>,
}

impl<'a> RetryRelay<'a> {
    fn new(index: usize, observer: &'a mut dyn PipelineObserver) -> Self {
        Self {
            index,
            observer,
            failure: None,
        }
    }

    fn notify(&mut self, notice: &RetryNotice) {
        if self.failure.is_some() {
            return;
        }
        if let Err(err) = self.observer.retry_scheduled(self.index, notice) {
            self.failure = Some(err);
        }
    }

    fn finish(self) -> Result<()> {
        match self.failure {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

fn enter(
    item: &mut PipelineItemResult,
    next: ItemStage,
    observer: &mut dyn PipelineObserver,
) -> Result<()> {
    item.stage = item.stage.advance(next)?;
    observer.item_stage(item.index, item.stage)
}

fn fail(
    mut item: PipelineItemResult,
    stage: StageKind,
    err: ProviderError,
    observer: &mut dyn PipelineObserver,
) -> Result<PipelineItemResult> {
    enter(&mut item, ItemStage::Failed, observer)?;
    item.failed_stage = Some(stage);
    item.error = Some(format!("{stage}: {err}"));
    Ok(item)
}
