//! 输入读取 - 基础设施层
//!
//! 负责流水线的 convert 阶段：把原始输入引用变成识别服务能直接使用的内容。
//! 本地图片读入后编码为 `data:<mime>;base64,...`。

use base64::{engine::general_purpose::STANDARD, Engine as _};
use std::path::Path;
use tokio::fs;
use tracing::debug;

use crate::error::InputError;
use crate::models::job::RawInput;

/// 单张图片的大小上限
const MAX_IMAGE_BYTES: u64 = 20 * 1024 * 1024;

/// 交给识别服务的输入
#[derive(Debug, Clone, PartialEq)]
pub enum PreparedInput {
    /// 图片地址（远程 URL 或 data URL）
    Image { url: String },
    /// 转写文本
    Transcript { text: String },
}

impl PreparedInput {
    pub fn kind(&self) -> &'static str {
        match self {
            PreparedInput::Image { .. } => "image",
            PreparedInput::Transcript { .. } => "transcript",
        }
    }
}

/// 准备原始输入
///
/// 手工修改不需要识别，返回 `Ok(None)`
pub async fn prepare(input: &RawInput) -> Result<Option<PreparedInput>, InputError> {
    match input {
        RawInput::ImageFile(path) => read_image(path).await.map(Some),
        RawInput::ImageUrl(url) => {
            let url = url.trim();
            if url.is_empty() {
                return Err(InputError::Empty {
                    what: "图片地址".to_string(),
                });
            }
            Ok(Some(PreparedInput::Image {
                url: url.to_string(),
            }))
        }
        RawInput::Transcript(text) => {
            if text.trim().is_empty() {
                return Err(InputError::Empty {
                    what: "转写文本".to_string(),
                });
            }
            Ok(Some(PreparedInput::Transcript { text: text.clone() }))
        }
        RawInput::ManualEdit(_) => Ok(None),
    }
}

/// 读取本地图片并编码为 data URL
pub async fn read_image(path: &Path) -> Result<PreparedInput, InputError> {
    let mime = mime_for(path)?;
    let shown = path.display().to_string();

    let metadata = fs::metadata(path).await.map_err(|source| {
        if source.kind() == std::io::ErrorKind::NotFound {
            InputError::NotFound {
                path: shown.clone(),
            }
        } else {
            InputError::ReadFailed {
                path: shown.clone(),
                source,
            }
        }
    })?;
    if metadata.len() > MAX_IMAGE_BYTES {
        return Err(InputError::ReadFailed {
            path: shown,
            source: std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("图片超过 {} 字节", MAX_IMAGE_BYTES),
            ),
        });
    }

    let bytes = fs::read(path).await.map_err(|source| InputError::ReadFailed {
        path: shown.clone(),
        source,
    })?;
    if bytes.is_empty() {
        return Err(InputError::Empty { what: shown });
    }

    debug!("读取图片 {} ({} 字节, {})", shown, bytes.len(), mime);
    Ok(PreparedInput::Image {
        url: format!("data:{};base64,{}", mime, STANDARD.encode(&bytes)),
    })
}

fn mime_for(path: &Path) -> Result<&'static str, InputError> {
    let extension = path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_lowercase)
        .unwrap_or_default();
    match extension.as_str() {
        "png" => Ok("image/png"),
        "jpg" | "jpeg" => Ok("image/jpeg"),
        "webp" => Ok("image/webp"),
        "gif" => Ok("image/gif"),
        _ => Err(InputError::UnsupportedFormat { extension }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::field::FieldValues;

    #[tokio::test]
    async fn test_image_becomes_data_url() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("card.JPG");
        std::fs::write(&path, b"abc").unwrap();

        let prepared = prepare(&RawInput::ImageFile(path)).await.unwrap();
        assert_eq!(
            prepared,
            Some(PreparedInput::Image {
                url: "data:image/jpeg;base64,YWJj".to_string()
            })
        );
    }

    #[tokio::test]
    async fn test_rejected_inputs() {
        let dir = tempfile::tempdir().unwrap();
        let empty = dir.path().join("empty.png");
        std::fs::write(&empty, b"").unwrap();
        let pdf = dir.path().join("card.pdf");
        std::fs::write(&pdf, b"%PDF").unwrap();

        assert!(matches!(
            prepare(&RawInput::ImageFile(empty)).await,
            Err(InputError::Empty { .. })
        ));
        assert!(matches!(
            prepare(&RawInput::ImageFile(pdf)).await,
            Err(InputError::UnsupportedFormat { .. })
        ));
        assert!(matches!(
            prepare(&RawInput::ImageFile(dir.path().join("missing.png"))).await,
            Err(InputError::NotFound { .. })
        ));
        assert!(matches!(
            prepare(&RawInput::Transcript("  \n".to_string())).await,
            Err(InputError::Empty { .. })
        ));
    }

    #[tokio::test]
    async fn test_manual_edit_skips_recognition() {
        let prepared = prepare(&RawInput::ManualEdit(FieldValues::new())).await.unwrap();
        assert!(prepared.is_none());
    }
}
