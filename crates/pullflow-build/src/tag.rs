//! 決定的なイメージタグとイメージ参照のヘルパー
//!
//! タグは `{short_sha}-{env_hash}`。同じリビジョンを同じ解決済み env で
//! ビルドすれば常に同じタグになるので、レジストリに既にあれば
//! 再ビルドを省略できる。

use crate::error::{BuildError, Result};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

const SHORT_SHA_LEN: usize = 7;
const ENV_HASH_LEN: usize = 16;
const MAX_TAG_LEN: usize = 128;

pub fn short_sha(sha: &str) -> &str {
    match sha.char_indices().nth(SHORT_SHA_LEN) {
        Some((idx, _)) => &sha[..idx],
        None => sha,
    }
}

/// キーをソートしてシリアライズした env の SHA-256 の先頭 16 桁
pub fn env_hash(env: &BTreeMap<String, String>) -> String {
    let canonical = serde_json::to_string(env).unwrap_or_default();
    let mut hasher = Sha256::new();
    hasher.update(canonical.as_bytes());
    let digest = format!("{:x}", hasher.finalize());
    digest[..ENV_HASH_LEN].to_string()
}

pub fn image_tag(sha: &str, env: &BTreeMap<String, String>) -> String {
    format!("{}-{}", short_sha(sha), env_hash(env))
}

pub fn init_image_tag(sha: &str, init_env: &BTreeMap<String, String>) -> String {
    format!("init-{}", image_tag(sha, init_env))
}

/// Docker のタグ規則: `[A-Za-z0-9_.-]` で 1〜128 文字、先頭は `.` と `-` 以外
pub fn validate_tag(tag: &str) -> Result<()> {
    if tag.is_empty() {
        return Err(BuildError::InvalidTag {
            tag: "(empty)".to_string(),
        });
    }

    if tag.len() > MAX_TAG_LEN {
        return Err(BuildError::InvalidTag {
            tag: format!("Tag too long ({} characters, max {})", tag.len(), MAX_TAG_LEN),
        });
    }

    if tag.starts_with('.') || tag.starts_with('-') {
        return Err(BuildError::InvalidTag {
            tag: tag.to_string(),
        });
    }

    if let Some(c) = tag
        .chars()
        .find(|c| !c.is_ascii_alphanumeric() && !matches!(c, '.' | '-' | '_'))
    {
        return Err(BuildError::InvalidTag {
            tag: format!("Invalid character '{}' in tag: {}", c, tag),
        });
    }

    Ok(())
}

/// イメージ参照をリポジトリとタグに分割
///
/// - `ghcr.io/org/app:v1.0` -> `("ghcr.io/org/app", "v1.0")`
/// - `ghcr.io/org/app` -> `("ghcr.io/org/app", "latest")`
/// - `localhost:5000/app` -> `("localhost:5000/app", "latest")`
pub fn split_image_tag(image: &str) -> (String, String) {
    let image = image.split('@').next().unwrap_or(image);
    if let Some(pos) = image.rfind(':') {
        let potential_tag = &image[pos + 1..];
        // ポートの後ろにはパスが続くが、タグの後ろには続かない
        if !potential_tag.contains('/') {
            return (image[..pos].to_string(), potential_tag.to_string());
        }
    }

    (image.to_string(), "latest".to_string())
}

/// `{registry}/{path}:{tag}`
pub fn image_reference(registry: &str, path: &str, tag: &str) -> String {
    format!("{}/{}:{}", registry.trim_end_matches('/'), path, tag)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_tag_is_deterministic() {
        let sha = "0123456789abcdef0123456789abcdef01234567";
        let a = image_tag(sha, &env(&[("A", "1"), ("B", "2")]));
        let b = image_tag(sha, &env(&[("B", "2"), ("A", "1")]));
        assert_eq!(a, b);
        assert!(a.starts_with("0123456-"));
        assert_eq!(a.len(), 7 + 1 + 16);
        validate_tag(&a).unwrap();
    }

    #[test]
    fn test_tag_changes_with_env() {
        let sha = "0123456789abcdef";
        let a = image_tag(sha, &env(&[("A", "1")]));
        let b = image_tag(sha, &env(&[("A", "2")]));
        let c = image_tag(sha, &env(&[("A1", "")]));
        assert_ne!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_init_tag_prefix() {
        let tag = init_image_tag("0123456789", &BTreeMap::new());
        assert!(tag.starts_with("init-0123456-"));
    }

    #[test]
    fn test_validate_tag_rejects_bad_tags() {
        assert!(validate_tag("").is_err());
        assert!(validate_tag("-abc").is_err());
        assert!(validate_tag("a/b").is_err());
        assert!(validate_tag(&"a".repeat(129)).is_err());
        assert!(validate_tag("v1.0_rc-1").is_ok());
    }

    #[test]
    fn test_split_image_tag() {
        assert_eq!(
            split_image_tag("ghcr.io/org/app:v1.0"),
            ("ghcr.io/org/app".to_string(), "v1.0".to_string())
        );
        assert_eq!(
            split_image_tag("ghcr.io/org/app"),
            ("ghcr.io/org/app".to_string(), "latest".to_string())
        );
        assert_eq!(
            split_image_tag("localhost:5000/app"),
            ("localhost:5000/app".to_string(), "latest".to_string())
        );
        assert_eq!(
            split_image_tag("localhost:5000/app:dev"),
            ("localhost:5000/app".to_string(), "dev".to_string())
        );
    }
}
