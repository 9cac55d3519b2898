//! Object storage seam for downloaded media.

use async_trait::async_trait;
use dashmap::DashMap;

use crate::error::StoreError;

#[async_trait]
pub trait ObjectStorage: Send + Sync {
    async fn put(
        &self,
        key: &str,
        bytes: Vec<u8>,
        content_type: Option<&str>,
    ) -> Result<(), StoreError>;
}

/// Storage key for one attachment:
/// `workspaces/{ws}/conversations/{conv}/{message}-{name}.{ext}`.
pub fn build_storage_key(
    workspace_id: &str,
    conversation_id: &str,
    message_id: &str,
    file_name: Option<&str>,
    mimetype: Option<&str>,
) -> String {
    let base = file_name
        .map(sanitize_filename)
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| "file".to_string());
    let name = if base.contains('.') {
        base
    } else {
        match infer_extension(mimetype) {
            Some(ext) => format!("{base}.{ext}"),
            None => base,
        }
    };
    format!("workspaces/{workspace_id}/conversations/{conversation_id}/{message_id}-{name}")
}

fn sanitize_filename(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut last_dash = false;
    for c in name.trim().chars() {
        if c.is_ascii_alphanumeric() || c == '.' || c == '_' || c == '-' {
            out.push(c);
            last_dash = false;
        } else if !last_dash {
            out.push('-');
            last_dash = true;
        }
    }
    let trimmed = out.trim_matches('-');
    trimmed.chars().take(80).collect()
}

fn infer_extension(mimetype: Option<&str>) -> Option<&'static str> {
    let mime = mimetype?.split(';').next()?.trim();
    match mime {
        "image/jpeg" => Some("jpg"),
        "image/png" => Some("png"),
        "image/webp" => Some("webp"),
        "image/gif" => Some("gif"),
        "video/mp4" => Some("mp4"),
        "video/3gpp" => Some("3gp"),
        "audio/ogg" => Some("ogg"),
        "audio/mpeg" => Some("mp3"),
        "audio/mp4" => Some("m4a"),
        "application/pdf" => Some("pdf"),
        _ => None,
    }
}

/// In-process storage used by tests.
#[derive(Default)]
pub struct MemoryObjectStorage {
    pub objects: DashMap<String, (Vec<u8>, Option<String>)>,
}

impl MemoryObjectStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ObjectStorage for MemoryObjectStorage {
    async fn put(
        &self,
        key: &str,
        bytes: Vec<u8>,
        content_type: Option<&str>,
    ) -> Result<(), StoreError> {
        self.objects
            .insert(key.to_string(), (bytes, content_type.map(str::to_string)));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_storage_key_sanitizes_and_infers_extension() {
        let key = build_storage_key(
            "ws1",
            "conv1",
            "MSG1",
            Some("relatório final (v2).pdf"),
            Some("application/pdf"),
        );
        assert_eq!(
            key,
            "workspaces/ws1/conversations/conv1/MSG1-relat-rio-final-v2-.pdf"
        );
        let key = build_storage_key("ws1", "conv1", "MSG2", None, Some("image/jpeg"));
        assert_eq!(key, "workspaces/ws1/conversations/conv1/MSG2-file.jpg");
        let key = build_storage_key("ws1", "conv1", "MSG3", None, Some("application/x-unknown"));
        assert_eq!(key, "workspaces/ws1/conversations/conv1/MSG3-file");
    }
}
