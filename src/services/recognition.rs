//! 识别服务 - 业务能力层
//!
//! 只负责"把一份输入读成字段"的能力，不关心作业和合并
//!
//! ## 技术栈
//! - 使用 `async-openai` crate 进行 API 调用
//! - 兼容 OpenAI API 的服务（支持视觉输入的模型可以直接读证件图片）

use async_openai::{
    config::OpenAIConfig,
    types::chat::{
        ChatCompletionRequestMessage, ChatCompletionRequestMessageContentPartImage,
        ChatCompletionRequestMessageContentPartText, ChatCompletionRequestSystemMessageArgs,
        ChatCompletionRequestUserMessageArgs, ChatCompletionRequestUserMessageContent,
        ChatCompletionRequestUserMessageContentPart, CreateChatCompletionRequestArgs, ImageDetail,
        ImageUrl,
    },
    Client,
};
use async_trait::async_trait;
use serde_json::Value as JsonValue;
use std::collections::BTreeMap;
use tracing::{debug, warn};

use crate::config::Config;
use crate::error::RecognitionError;
use crate::infrastructure::PreparedInput;
use crate::models::field::FieldName;
use crate::utils::logging::truncate_text;

/// 识别服务返回的单个字段
#[derive(Debug, Clone, PartialEq)]
pub struct RecognizedField {
    pub value: String,
    pub confidence: Option<f64>,
}

/// 识别服务返回的原始字段表（键名未经校验）
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RecognizedFields(pub BTreeMap<String, RecognizedField>);

impl RecognizedFields {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>, confidence: Option<f64>) {
        self.0.insert(
            key.into(),
            RecognizedField {
                value: value.into(),
                confidence,
            },
        );
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// 外部识别能力
#[async_trait]
pub trait Recognizer: Send + Sync {
    /// 日志用名称
    fn name(&self) -> &str;

    async fn recognize(&self, input: &PreparedInput) -> Result<RecognizedFields, RecognitionError>;
}

/// 基于 LLM 的识别服务
///
/// 职责：
/// - 调用 LLM API 从图片或转写文本中抽取字段
/// - 容错解析模型的 JSON 回复
/// - 不认识作业 / 权威记录
pub struct LlmRecognizer {
    client: Client<OpenAIConfig>,
    model_name: String,
    temperature: f32,
}

impl LlmRecognizer {
    /// 创建新的识别服务
    pub fn new(config: &Config) -> Self {
        // 配置 OpenAI 客户端（兼容 OpenAI API 的服务）
        let openai_config = OpenAIConfig::new()
            .with_api_key(&config.llm_api_key)
            .with_api_base(&config.llm_api_base_url);

        Self {
            client: Client::with_config(openai_config),
            model_name: config.llm_model_name.clone(),
            temperature: config.llm_temperature,
        }
    }

    fn api_error(&self, e: impl ToString) -> RecognitionError {
        RecognitionError::ApiCallFailed {
            model: self.model_name.clone(),
            message: e.to_string(),
        }
    }

    /// 通用的 LLM 调用函数
    ///
    /// # 参数
    /// - `user_message`: 用户消息内容
    /// - `system_message`: 系统消息
    /// - `image_url`: 图片地址（可选），会追加到用户消息中
    async fn send_to_llm(
        &self,
        user_message: &str,
        system_message: &str,
        image_url: Option<&str>,
    ) -> Result<String, RecognitionError> {
        debug!("调用 LLM API，模型: {}", self.model_name);

        let system_msg = ChatCompletionRequestSystemMessageArgs::default()
            .content(system_message)
            .build()
            .map_err(|e| self.api_error(e))?;

        let user_msg = match image_url {
            Some(url) => {
                // 使用 Vision API：文本 + 图片
                let content_parts = vec![
                    ChatCompletionRequestUserMessageContentPart::Text(
                        ChatCompletionRequestMessageContentPartText {
                            text: user_message.to_string(),
                        },
                    ),
                    ChatCompletionRequestUserMessageContentPart::ImageUrl(
                        ChatCompletionRequestMessageContentPartImage {
                            image_url: ImageUrl {
                                url: url.to_string(),
                                detail: Some(ImageDetail::Auto),
                            },
                        },
                    ),
                ];
                ChatCompletionRequestUserMessageArgs::default()
                    .content(ChatCompletionRequestUserMessageContent::Array(content_parts))
                    .build()
            }
            None => ChatCompletionRequestUserMessageArgs::default()
                .content(user_message)
                .build(),
        }
        .map_err(|e| self.api_error(e))?;

        let request = CreateChatCompletionRequestArgs::default()
            .model(&self.model_name)
            .messages(vec![
                ChatCompletionRequestMessage::System(system_msg),
                ChatCompletionRequestMessage::User(user_msg),
            ])
            .temperature(self.temperature)
            .max_tokens(1024u32)
            .build()
            .map_err(|e| self.api_error(e))?;

        let response = self.client.chat().create(request).await.map_err(|e| {
            warn!("LLM API 调用失败: {}", e);
            self.api_error(e)
        })?;

        let content = response
            .choices
            .first()
            .and_then(|choice| choice.message.content.clone())
            .ok_or_else(|| RecognitionError::EmptyContent {
                model: self.model_name.clone(),
            })?;

        debug!("LLM 响应: {}", truncate_text(&content, 200));
        Ok(content.trim().to_string())
    }
}

#[async_trait]
impl Recognizer for LlmRecognizer {
    fn name(&self) -> &str {
        &self.model_name
    }

    async fn recognize(&self, input: &PreparedInput) -> Result<RecognizedFields, RecognitionError> {
        let system_message = build_system_message();
        let response = match input {
            PreparedInput::Image { url } => {
                self.send_to_llm(
                    "请从这张证件/保险卡图片中抽取字段。",
                    &system_message,
                    Some(url),
                )
                .await?
            }
            PreparedInput::Transcript { text } => {
                let user_message = format!("以下是通话转写文本，请抽取字段：\n\n{}", text);
                self.send_to_llm(&user_message, &system_message, None).await?
            }
        };
        parse_recognition_response(&response)
    }
}

/// 构建系统提示词，列出全部字段的键名
fn build_system_message() -> String {
    let keys: Vec<&str> = FieldName::ALL.iter().map(|f| f.key()).collect();
    format!(
        r#"你是一个资料录入助手，负责从输入中抽取个人联系与保险信息。

只返回一个 JSON 对象，格式：
{{"fields": {{"<键名>": {{"value": "<值>", "confidence": <0 到 1 的数字>}}}}}}

可用键名：{}
如果只听到/看到一整行地址，可以用键名 "address" 返回整行。
没有把握的字段不要返回；不要编造；不要返回任何 JSON 以外的内容。"#,
        keys.join(", ")
    )
}

/// 解析识别服务的回复
///
/// 容忍代码块包裹、前后说明文字，以及没有 `fields` 外层的平铺对象
pub fn parse_recognition_response(response: &str) -> Result<RecognizedFields, RecognitionError> {
    let malformed = || RecognitionError::MalformedResponse {
        response: truncate_text(response, 200),
    };

    let start = response.find('{').ok_or_else(malformed)?;
    let end = response.rfind('}').ok_or_else(malformed)?;
    if end < start {
        return Err(malformed());
    }
    let json: JsonValue = serde_json::from_str(&response[start..=end]).map_err(|_| malformed())?;

    let object = match json.get("fields") {
        Some(JsonValue::Object(fields)) => fields,
        _ => json.as_object().ok_or_else(malformed)?,
    };

    let mut recognized = RecognizedFields::new();
    for (key, entry) in object {
        let (value, confidence) = match entry {
            JsonValue::Object(inner) => (
                inner.get("value").and_then(scalar_text),
                inner.get("confidence").and_then(JsonValue::as_f64),
            ),
            other => (scalar_text(other), None),
        };
        match value {
            Some(value) if !value.trim().is_empty() => recognized.insert(key, value, confidence),
            _ => debug!("忽略空字段: {}", key),
        }
    }

    Ok(recognized)
}

fn scalar_text(value: &JsonValue) -> Option<String> {
    match value {
        JsonValue::String(s) => Some(s.clone()),
        JsonValue::Number(n) => Some(n.to_string()),
        JsonValue::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}
