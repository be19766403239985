use std::fmt;
use std::str::FromStr;

use platecast_contracts::media::{MediaAsset, MerchantInput, VisionDescription};
use platecast_contracts::providers::ProviderRoute;

use crate::client::{ChatMessage, ProviderClient, TextRequest, VisionRequest};
use crate::error::ProviderError;
use crate::media::VISION_MAX_DIM;
use crate::retry::{RetryNotice, RetryPolicy};

const VISION_SYSTEM: &str = "你是一名资深美食摄影师，也是经验丰富的菜品鉴定师。";
const VISION_INSTRUCTION: &str = "识别图片中的菜品：先给出菜名，再用不超过 60 字描述它的外观、主要配料和摆盘。只输出这段描述。";

const COPY_SYSTEM: &str = "你是一个拥有百万粉丝的小红书美食博主，最擅长写让外卖爆单的种草笔记。";

const TRANSLATION_SYSTEM: &str = "You are a prompt engineer for text-to-image models.";
const TRANSLATION_INSTRUCTION: &str = "Rewrite the brief below as one English prompt for an image generation model. \
Use comma-separated keywords that cover the subject, composition, camera angle, lighting, background and photographic style. \
Output only the prompt.";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TemplateVariant {
    /// Lifestyle "plog" scene: the dish on a table with props and window light.
    #[default]
    PlogLifestyle,
    /// Clean product shot on a plain background.
    PlainFoodPhoto,
}

impl TemplateVariant {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::PlogLifestyle => "plog",
            Self::PlainFoodPhoto => "plain",
        }
    }
}

impl fmt::Display for TemplateVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TemplateVariant {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "plog" | "lifestyle" | "plog-lifestyle" => Ok(Self::PlogLifestyle),
            "plain" | "photo" | "plain-food-photo" => Ok(Self::PlainFoodPhoto),
            other => Err(format!("unknown template variant '{other}' (expected plog or plain)")),
        }
    }
}

/// Image prompt before and after the translation round-trip.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImagePrompt {
    pub template: String,
    pub prompt: String,
}

#[derive(Debug, Clone)]
pub struct PromptBuilder {
    pub vision_max_dim: u32,
    pub vision_temperature: f32,
    pub copy_temperature: f32,
    pub translation_temperature: f32,
}

impl Default for PromptBuilder {
    fn default() -> Self {
        Self {
            vision_max_dim: VISION_MAX_DIM,
            vision_temperature: 0.2,
            copy_temperature: 1.0,
            translation_temperature: 0.3,
        }
    }
}

impl PromptBuilder {
    pub fn vision_request<'a>(&self, asset: &'a MediaAsset) -> VisionRequest<'a> {
        VisionRequest {
            system: VISION_SYSTEM.to_string(),
            instruction: VISION_INSTRUCTION.to_string(),
            asset,
            max_dim: self.vision_max_dim,
            temperature: self.vision_temperature,
        }
    }

    pub fn copy_request(&self, vision: Option<&VisionDescription>, input: &MerchantInput) -> TextRequest {
        TextRequest {
            messages: copy_messages(vision, input),
            temperature: self.copy_temperature,
        }
    }

    pub fn translation_request(&self, expanded: &str) -> TextRequest {
        TextRequest {
            messages: translation_messages(expanded),
            temperature: self.translation_temperature,
        }
    }

    /// Expands the template, then asks the text model for an image-ready
    /// prompt. A failed round-trip is returned as-is; the untranslated
    /// template is never sent to the image provider.
    #[allow(clippy::too_many_arguments)]
    pub fn build_image_prompt(
        &self,
        client: &ProviderClient,
        text_route: &ProviderRoute,
        retry: &RetryPolicy,
        vision: &VisionDescription,
        input: &MerchantInput,
        variant: TemplateVariant,
        notify: &mut dyn FnMut(&RetryNotice),
    ) -> Result<ImagePrompt, ProviderError> {
        let template = expand_image_template(variant, vision, input);
        let request = self.translation_request(&template);
        let raw = retry.run("image-prompt", notify, |_| {
            client.complete_text(text_route, &request)
        })?;
        let prompt = clean_translated_prompt(&raw);
        if prompt.is_empty() {
            return Err(ProviderError::malformed(
                &text_route.provider,
                "prompt translation came back empty",
            ));
        }
        Ok(ImagePrompt { template, prompt })
    }
}

pub fn copy_messages(vision: Option<&VisionDescription>, input: &MerchantInput) -> Vec<ChatMessage> {
    let dish = dish_label(vision, input);
    let mut brief = format!("请为这道外卖菜品写一篇小红书笔记。\n\n菜品名称：{dish}\n");
    if let Some(vision) = vision {
        brief.push_str(&format!("图片描述：{}\n", vision.as_str()));
    }
    match input.selling_points() {
        Some(points) => brief.push_str(&format!("核心卖点：{points}\n")),
        None => brief.push_str("核心卖点：商家未填写，请根据菜品本身提炼\n"),
    }
    if let Some(context) = input.context() {
        brief.push_str(&format!("补充信息：{context}\n"));
    }
    brief.push_str(
        "\n写作要求：\n\
1. 标题必须带 Emoji，语气夸张惊叹，比如“好吃到哭！”“绝绝子！”“排队两小时！”。\n\
2. 正文分段，多用 Emoji 😋🔥✨，语气亲切热情，突出【分量足】【性价比】【现做现发】【学生党/打工人必吃】。\n\
3. 结尾附上 5-8 个热门标签，例如 #外卖 #宝藏店铺 #干饭人 #本地美食（换成具体地名）。",
    );
    vec![ChatMessage::system(COPY_SYSTEM), ChatMessage::user(brief)]
}

pub fn translation_messages(expanded: &str) -> Vec<ChatMessage> {
    vec![
        ChatMessage::system(TRANSLATION_SYSTEM),
        ChatMessage::user(format!("{TRANSLATION_INSTRUCTION}\n\nBrief:\n{expanded}")),
    ]
}

/// Pure expansion: the dish always fills the same slot of the chosen template.
pub fn expand_image_template(
    variant: TemplateVariant,
    vision: &VisionDescription,
    input: &MerchantInput,
) -> String {
    let dish = dish_label(Some(vision), input);
    let selling = input.selling_points().unwrap_or("色香味俱全");
    let mut text = match variant {
        TemplateVariant::PlogLifestyle => format!(
            "小红书 plog 风格的生活方式美食照片：{dish}（{}）摆在温馨的木质餐桌上，自然窗光，旁边点缀餐具和饮品，画面有氛围感和烟火气。卖点：{selling}。",
            vision.as_str()
        ),
        TemplateVariant::PlainFoodPhoto => format!(
            "专业外卖菜品摄影：{dish}（{}），干净纯色背景，45 度俯拍，柔和棚拍光，食材色泽鲜亮、细节清晰，突出分量感。卖点：{selling}。",
            vision.as_str()
        ),
    };
    if let Some(context) = input.context() {
        text.push_str(&format!("补充：{context}。"));
    }
    text
}

fn dish_label<'a>(vision: Option<&'a VisionDescription>, input: &'a MerchantInput) -> &'a str {
    input
        .dish_name()
        .or_else(|| vision.map(VisionDescription::as_str))
        .unwrap_or("招牌菜")
}

fn clean_translated_prompt(raw: &str) -> String {
    let mut text = raw.trim();
    if text.starts_with("```") {
        text = text.trim_start_matches('`');
        text = text.split_once('\n').map(|(_, rest)| rest).unwrap_or(text);
        text = text.trim_end().trim_end_matches('`');
    }
    let text = text.trim();
    let text = text
        .strip_prefix("Prompt:")
        .or_else(|| text.strip_prefix("prompt:"))
        .unwrap_or(text)
        .trim();
    text.trim_matches(|c| c == '"' || c == '“' || c == '”')
        .trim()
        .to_string()
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use platecast_contracts::providers::{Credential, WireFormat};
    use serde_json::json;

    use super::*;
    use crate::retry::counting_sleeper;
    use crate::transport::scripted::ScriptedTransport;

    fn vision() -> VisionDescription {
        VisionDescription::new("红烧肉盖在米饭上，酱汁浓郁").unwrap()
    }

    fn text_route() -> ProviderRoute {
        ProviderRoute::new(
            "deepseek",
            WireFormat::OpenAiChat,
            "https://api.deepseek.com",
            Credential::Bearer("sk".to_string()),
            "deepseek-chat",
        )
    }

    #[test]
    fn expansion_is_pure_and_uses_dish_slot() {
        let input = MerchantInput::new("红烧肉饭", "分量大");
        let first = expand_image_template(TemplateVariant::PlogLifestyle, &vision(), &input);
        let second = expand_image_template(TemplateVariant::PlogLifestyle, &vision(), &input);
        assert_eq!(first, second);
        assert!(first.starts_with("小红书 plog 风格的生活方式美食照片：红烧肉饭（"));
        assert!(first.contains("卖点：分量大。"));

        let plain = expand_image_template(TemplateVariant::PlainFoodPhoto, &vision(), &input);
        assert!(plain.starts_with("专业外卖菜品摄影：红烧肉饭（"));
        assert_ne!(first, plain);
    }

    #[test]
    fn missing_dish_name_falls_back_to_vision_description() {
        let input = MerchantInput::new("", "");
        let text = expand_image_template(TemplateVariant::PlainFoodPhoto, &vision(), &input);
        assert!(text.starts_with("专业外卖菜品摄影：红烧肉盖在米饭上，酱汁浓郁（"));
        assert!(text.contains("卖点：色香味俱全。"));
    }

    #[test]
    fn copy_brief_carries_merchant_facts() {
        let input = MerchantInput::new("脆皮炸鸡腿饭", "外酥里嫩").with_context("满20减5");
        let messages = copy_messages(Some(&vision()), &input);
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].role, "system");
        let brief = &messages[1].content;
        assert!(brief.contains("菜品名称：脆皮炸鸡腿饭"));
        assert!(brief.contains("核心卖点：外酥里嫩"));
        assert!(brief.contains("补充信息：满20减5"));
        assert!(brief.contains("#干饭人"));
    }

    #[test]
    fn variant_parsing() {
        assert_eq!("plog".parse::<TemplateVariant>(), Ok(TemplateVariant::PlogLifestyle));
        assert_eq!(" Plain ".parse::<TemplateVariant>(), Ok(TemplateVariant::PlainFoodPhoto));
        assert!("poster".parse::<TemplateVariant>().is_err());
    }

    #[test]
    fn translated_prompt_is_cleaned() {
        assert_eq!(
            clean_translated_prompt("```text\nPrompt: \"braised pork rice, top view\"\n```"),
            "braised pork rice, top view"
        );
        assert_eq!(clean_translated_prompt("  rice bowl  "), "rice bowl");
    }

    #[test]
    fn build_image_prompt_sends_template_through_text_model() {
        let transport = Arc::new(ScriptedTransport::new().reply_json(json!({
            "choices": [{"message": {"content": "braised pork rice bowl, overhead shot, soft window light"}}]
        })));
        let client = ProviderClient::new(transport.clone());
        let input = MerchantInput::new("红烧肉饭", "分量大");
        let built = PromptBuilder::default()
            .build_image_prompt(
                &client,
                &text_route(),
                &RetryPolicy::default(),
                &vision(),
                &input,
                TemplateVariant::PlogLifestyle,
                &mut |_| {},
            )
            .unwrap();
        assert_eq!(
            built.prompt,
            "braised pork rice bowl, overhead shot, soft window light"
        );
        assert_eq!(
            built.template,
            expand_image_template(TemplateVariant::PlogLifestyle, &vision(), &input)
        );
        let body = transport.calls()[0].json_body().cloned().unwrap();
        assert!(body["messages"][1]["content"]
            .as_str()
            .unwrap()
            .ends_with(&built.template));
        assert!((body["temperature"].as_f64().unwrap() - 0.3).abs() < 1e-6);
    }

    #[test]
    fn translation_failure_is_surfaced_without_fallback() {
        let transport = Arc::new(
            ScriptedTransport::new()
                .reply(429, "{}")
                .reply(500, r#"{"error":{"message":"boom"}}"#),
        );
        let client = ProviderClient::new(transport.clone());
        let (sleeper, slept) = counting_sleeper();
        let retry = RetryPolicy::default().with_sleeper(sleeper);
        let mut notices = 0;
        let err = PromptBuilder::default()
            .build_image_prompt(
                &client,
                &text_route(),
                &retry,
                &vision(),
                &MerchantInput::new("红烧肉饭", ""),
                TemplateVariant::PlainFoodPhoto,
                &mut |_| notices += 1,
            )
            .unwrap_err();
        assert_eq!(err.status(), Some(500));
        assert_eq!(notices, 1);
        assert_eq!(slept.lock().unwrap().len(), 1);
        assert_eq!(transport.calls().len(), 2);
    }
}
