use anyhow::{Context, Result};
use base64::Engine;
use std::path::Path;

use turnstile_core::Attachment;

/// Read a file for `--attach`: images are sent base64-encoded, anything
/// else must be UTF-8 text.
pub fn load_attachment(path: &Path) -> Result<Attachment> {
    let bytes = std::fs::read(path).with_context(|| format!("Failed to read attachment {}", path.display()))?;
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string());
    attachment_from_bytes(name, bytes)
}

fn attachment_from_bytes(name: String, bytes: Vec<u8>) -> Result<Attachment> {
    if let Some(kind) = infer::get(&bytes) {
        if kind.matcher_type() == infer::MatcherType::Image {
            let data = base64::engine::general_purpose::STANDARD.encode(&bytes);
            return Ok(Attachment::new(name, kind.mime_type(), data));
        }
    }

    let text = String::from_utf8(bytes)
        .map_err(|_| anyhow::anyhow!("Attachment {name} is neither an image nor UTF-8 text"))?;
    Ok(Attachment::new(name, "text/plain", text))
}

#[cfg(test)]
mod tests {
    use super::*;

    const PNG_HEADER: &[u8] = &[0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A, 0, 0, 0, 0x0D];

    #[test]
    fn test_image_is_base64_encoded() {
        let attachment = attachment_from_bytes("a.png".into(), PNG_HEADER.to_vec()).unwrap();
        assert_eq!(attachment.mime_type, "image/png");
        assert!(attachment.is_image());
        assert_eq!(
            base64::engine::general_purpose::STANDARD
                .decode(&attachment.data)
                .unwrap(),
            PNG_HEADER
        );
    }

    #[test]
    fn test_text_is_kept_verbatim() {
        let attachment = attachment_from_bytes("notes.md".into(), b"# Notes\n".to_vec()).unwrap();
        assert_eq!(attachment.mime_type, "text/plain");
        assert_eq!(attachment.data, "# Notes\n");
    }

    #[test]
    fn test_binary_is_rejected() {
        assert!(attachment_from_bytes("blob".into(), vec![0xff, 0xfe, 0x00, 0x81]).is_err());
    }

    #[test]
    fn test_load_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("todo.txt");
        std::fs::write(&path, "buy milk").unwrap();
        let attachment = load_attachment(&path).unwrap();
        assert_eq!(attachment.name, "todo.txt");
        assert_eq!(attachment.data, "buy milk");
    }
}
