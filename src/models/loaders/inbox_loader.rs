use crate::error::InputError;
use crate::models::candidate::CandidateSource;
use crate::models::field::{FieldName, FieldValues};
use crate::models::job::RawInput;
use anyhow::{Context, Result};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::fs;

/// 收件箱中的一条待处理输入
#[derive(Debug, Clone, PartialEq)]
pub struct InboxItem {
    pub subject_id: String,
    pub source: CandidateSource,
    pub input: RawInput,
    pub path: PathBuf,
}

const IMAGE_EXTENSIONS: [&str; 5] = ["png", "jpg", "jpeg", "webp", "gif"];
const EDITS_SUFFIX: &str = ".edits.toml";
const REALTIME_PREFIX: &str = "realtime_";

/// 从 TOML 文件加载手工修改
///
/// 文件内容为 `字段名 = 值`，字段名支持别名
pub async fn load_manual_edits(path: &Path) -> Result<FieldValues> {
    let content = fs::read_to_string(path)
        .await
        .with_context(|| format!("无法读取手工修改文件: {}", path.display()))?;

    let table: BTreeMap<String, toml::Value> =
        toml::from_str(&content).map_err(|source| InputError::EditsParseFailed {
            path: path.display().to_string(),
            source,
        })?;

    let mut edits = FieldValues::new();
    for (key, value) in table {
        let field = FieldName::from_key(&key).ok_or(InputError::UnknownField { key })?;
        let text = match value {
            toml::Value::String(s) => s,
            other => other.to_string(),
        };
        edits.set(field, &text);
    }

    Ok(edits)
}

/// 根据文件名判断输入类型；不认识的文件返回 None
async fn classify_file(subject_id: &str, path: &Path) -> Result<Option<InboxItem>> {
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_lowercase())
        .unwrap_or_default();
    let extension = path
        .extension()
        .and_then(|s| s.to_str())
        .map(str::to_lowercase)
        .unwrap_or_default();

    let (source, input) = if file_name.ends_with(EDITS_SUFFIX) {
        let edits = load_manual_edits(path).await?;
        (CandidateSource::UserEdit, RawInput::ManualEdit(edits))
    } else if extension == "txt" {
        let text = fs::read_to_string(path)
            .await
            .with_context(|| format!("无法读取转写文件: {}", path.display()))?;
        let source = if file_name.starts_with(REALTIME_PREFIX) {
            CandidateSource::Realtime
        } else {
            CandidateSource::PostCall
        };
        (source, RawInput::Transcript(text))
    } else if IMAGE_EXTENSIONS.contains(&extension.as_str()) {
        (
            CandidateSource::PostCall,
            RawInput::ImageFile(path.to_path_buf()),
        )
    } else {
        return Ok(None);
    };

    Ok(Some(InboxItem {
        subject_id: subject_id.to_string(),
        source,
        input,
        path: path.to_path_buf(),
    }))
}

/// 处理顺序：实时 → 通话后 → 手工修改，同类按文件名
fn source_rank(source: CandidateSource) -> u8 {
    match source {
        CandidateSource::Realtime => 0,
        CandidateSource::PostCall => 1,
        CandidateSource::UserEdit => 2,
    }
}

/// 加载收件箱：`<inbox>/<subject_id>/<文件>`
///
/// 返回 subject_id → 按处理顺序排列的输入
pub async fn load_inbox(folder_path: &str) -> Result<BTreeMap<String, Vec<InboxItem>>> {
    let folder = PathBuf::from(folder_path);

    if !folder.exists() {
        anyhow::bail!("收件箱不存在: {}", folder_path);
    }

    let mut inbox: BTreeMap<String, Vec<InboxItem>> = BTreeMap::new();
    let mut subjects = fs::read_dir(&folder)
        .await
        .with_context(|| format!("无法读取收件箱: {}", folder_path))?;

    while let Some(subject_entry) = subjects.next_entry().await? {
        let subject_path = subject_entry.path();
        if !subject_entry.file_type().await?.is_dir() {
            continue;
        }
        let subject_id = subject_entry.file_name().to_string_lossy().to_string();

        let mut files = fs::read_dir(&subject_path).await?;
        let mut items = Vec::new();
        while let Some(entry) = files.next_entry().await? {
            let path = entry.path();
            if !entry.file_type().await?.is_file() {
                continue;
            }
            match classify_file(&subject_id, &path).await {
                Ok(Some(item)) => items.push(item),
                Ok(None) => tracing::debug!("跳过无法识别的文件: {}", path.display()),
                Err(e) => tracing::warn!("加载文件失败 {}: {}", path.display(), e),
            }
        }

        if items.is_empty() {
            continue;
        }
        items.sort_by(|a, b| {
            source_rank(a.source)
                .cmp(&source_rank(b.source))
                .then_with(|| a.path.cmp(&b.path))
        });
        tracing::info!("对象 {}: 找到 {} 个输入", subject_id, items.len());
        inbox.insert(subject_id, items);
    }

    Ok(inbox)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_load_inbox_orders_items_per_subject() {
        let dir = tempfile::tempdir().unwrap();
        let subject = dir.path().join("patient-7");
        std::fs::create_dir(&subject).unwrap();
        std::fs::write(subject.join("call.txt"), "my name is Ann Lee").unwrap();
        std::fs::write(subject.join("realtime_call.txt"), "ann lee").unwrap();
        std::fs::write(subject.join("fix.edits.toml"), "lastName = \"Leigh\"\nzip = 10001\n").unwrap();
        std::fs::write(subject.join("card.PNG"), [0u8, 1, 2]).unwrap();
        std::fs::write(subject.join("notes.md"), "ignored").unwrap();
        std::fs::write(dir.path().join("stray.txt"), "not in a subject folder").unwrap();

        let inbox = load_inbox(dir.path().to_str().unwrap()).await.unwrap();
        assert_eq!(inbox.len(), 1);

        let items = &inbox["patient-7"];
        let sources: Vec<_> = items.iter().map(|i| i.source).collect();
        assert_eq!(
            sources,
            vec![
                CandidateSource::Realtime,
                CandidateSource::PostCall,
                CandidateSource::PostCall,
                CandidateSource::UserEdit
            ]
        );

        match &items[3].input {
            RawInput::ManualEdit(edits) => {
                assert_eq!(edits.get(FieldName::LastName), Some("Leigh"));
                assert_eq!(edits.get(FieldName::AddressZip), Some("10001"));
            }
            other => panic!("unexpected input: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_manual_edits_reject_unknown_keys() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.edits.toml");
        std::fs::write(&path, "shoeSize = \"9\"\n").unwrap();
        assert!(load_manual_edits(&path).await.is_err());
    }

    #[tokio::test]
    async fn test_missing_inbox_is_an_error() {
        assert!(load_inbox("/definitely/not/here").await.is_err());
    }
}
